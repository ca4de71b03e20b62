//! Conversions between ONNX values and ndarray arrays.

use ndarray::{Array1, Array3, Array4, ArrayD, IxDyn};
use ort::session::SessionInputValue;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueRef, ValueType};

use crate::error::{Error, Result};

/// Element type of a tensor input or output, if it is a tensor.
pub fn element_type(value_type: &ValueType) -> Option<TensorElementType> {
    match value_type {
        ValueType::Tensor { ty, .. } => Some(*ty),
        _ => None,
    }
}

/// Whether the element type is a 32-bit integer.
pub fn is_int32(ty: TensorElementType) -> bool {
    ty == TensorElementType::Int32
}

/// Build a batch of identical timesteps in whatever dtype the model expects.
///
/// # Errors
///
/// Returns an error if the tensor cannot be created.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
pub fn timestep_value(
    expected: Option<TensorElementType>,
    timestep: usize,
    batch: usize,
) -> Result<SessionInputValue<'static>> {
    let value = match expected {
        Some(TensorElementType::Float32) => {
            Tensor::from_array(Array1::from_elem(batch, timestep as f32))
                .map_err(|source| Error::Inference { source })?
                .into_dyn()
        }
        Some(TensorElementType::Int32) => {
            Tensor::from_array(Array1::from_elem(batch, timestep as i32))
                .map_err(|source| Error::Inference { source })?
                .into_dyn()
        }
        _ => Tensor::from_array(Array1::from_elem(batch, timestep as i64))
            .map_err(|source| Error::Inference { source })?
            .into_dyn(),
    };

    Ok(value.into())
}

/// Wrap an owned f32 array as a session input.
///
/// # Errors
///
/// Returns an error if the tensor cannot be created.
pub fn f32_value<D: ndarray::Dimension + 'static>(
    array: ndarray::Array<f32, D>,
) -> Result<SessionInputValue<'static>> {
    let tensor = Tensor::from_array(array).map_err(|source| Error::Inference { source })?;
    Ok(tensor.into_dyn().into())
}

/// Extract a dynamically shaped f32 array from an ONNX value.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn extract_arrayd(value: &ValueRef<'_>) -> Result<ArrayD<f32>> {
    let (shape_info, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|source| Error::Inference { source })?;

    // Safe: tensor dimensions are always non-negative and within bounds
    let dims: Vec<usize> = shape_info.iter().map(|&x| x as usize).collect();

    ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(|_| Error::ShapeMismatch {
        expected: format!("{dims:?}"),
        actual: "reshape failed".to_string(),
    })
}

/// Extract a 4D array from an ONNX value.
pub fn extract_array4(value: &ValueRef<'_>) -> Result<Array4<f32>> {
    let array = extract_arrayd(value)?;
    let ndim = array.ndim();

    array.into_dimensionality().map_err(|_| Error::ShapeMismatch {
        expected: "4D tensor".to_string(),
        actual: format!("{ndim}D tensor"),
    })
}

/// Extract a 3D array from an ONNX value.
pub fn extract_array3(value: &ValueRef<'_>) -> Result<Array3<f32>> {
    let array = extract_arrayd(value)?;
    let ndim = array.ndim();

    array.into_dimensionality().map_err(|_| Error::ShapeMismatch {
        expected: "3D tensor".to_string(),
        actual: format!("{ndim}D tensor"),
    })
}
