//! Image saving utilities.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{codecs::jpeg::JpegEncoder, ImageBuffer, ImageFormat, Rgb, RgbImage};

use crate::error::{Error, Result};

use super::ImageTensor;

/// JPEG quality used when the output path asks for a JPEG.
const JPEG_QUALITY: u8 = 95;

/// Save an image to `path`.
///
/// The format is inferred from the extension (PNG when unknown). The image is
/// first written to a hidden sibling file and renamed into place, so a failed
/// save never leaves a partial file at `path`.
///
/// # Errors
///
/// Returns an error if the image cannot be encoded or written.
pub fn save_image<P: AsRef<Path>>(img: &RgbImage, path: P) -> Result<()> {
    let path = path.as_ref();
    let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
    let temp_path = partial_path(path);

    if let Err(err) = write_image(img, &temp_path, format, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }

    Ok(())
}

fn write_image(img: &RgbImage, temp_path: &Path, format: ImageFormat, path: &Path) -> Result<()> {
    let save_error = |source| Error::ImageSave {
        path: path.to_path_buf(),
        source,
    };

    match format {
        ImageFormat::Jpeg => {
            let mut output = BufWriter::new(fs::File::create(temp_path)?);
            let encoder = JpegEncoder::new_with_quality(&mut output, JPEG_QUALITY);
            img.write_with_encoder(encoder).map_err(save_error)?;
            output.flush()?;
        }
        _ => {
            img.save_with_format(temp_path, format).map_err(save_error)?;
        }
    }

    Ok(())
}

/// Hidden sibling of `path` used while writing.
fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "output".into(), |n| n.to_string_lossy());
    path.with_file_name(format!(".{name}.partial"))
}

/// Convert a normalized NCHW tensor to an RGB image.
///
/// The tensor is denormalized from [-1, 1] to [0, 255]; the image takes the
/// tensor's spatial dimensions.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn tensor_to_image(tensor: &ImageTensor) -> RgbImage {
    let (_, _, height, width) = tensor.dim();

    // Safe: tensor spatial dimensions come from u32 image sizes
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(tensor[[0, 0, y, x]]),
            denormalize(tensor[[0, 1, y, x]]),
            denormalize(tensor[[0, 2, y, x]]),
        ])
    })
}

/// Denormalize a value from [-1, 1] to [0, 255] with clamping.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    let scaled = (value + 1.0) * 127.5;
    scaled.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_denormalize() {
        assert_eq!(denormalize(-1.0), 0);
        assert_eq!(denormalize(0.0), 127);
        assert_eq!(denormalize(1.0), 255);
    }

    #[test]
    fn test_denormalize_clamp() {
        assert_eq!(denormalize(-2.0), 0);
        assert_eq!(denormalize(2.0), 255);
    }

    #[test]
    fn test_tensor_to_image_uses_tensor_dims() {
        let tensor = Array4::<f32>::ones((1, 3, 16, 24));
        let img = tensor_to_image(&tensor);

        assert_eq!(img.dimensions(), (24, 16));
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_save_png_and_no_partial_left() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");

        save_image(&RgbImage::new(8, 8), &path).unwrap();

        assert_eq!(image::open(&path).unwrap().to_rgb8().dimensions(), (8, 8));
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn test_save_jpeg_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jpg");

        save_image(&RgbImage::new(8, 8), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_save_other_formats_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        for (name, format) in [
            ("out.gif", ImageFormat::Gif),
            ("out.tif", ImageFormat::Tiff),
            ("out.tiff", ImageFormat::Tiff),
            ("out.bmp", ImageFormat::Bmp),
            ("out.webp", ImageFormat::WebP),
            ("out.ico", ImageFormat::Ico),
        ] {
            let path = dir.path().join(name);
            save_image(&RgbImage::new(8, 8), &path).unwrap();

            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(image::guess_format(&bytes).unwrap(), format, "{name}");
            assert!(!partial_path(&path).exists());
        }
    }

    #[test]
    fn test_unknown_extension_saves_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.result");

        save_image(&RgbImage::new(8, 8), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn test_failed_save_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("out.png");

        assert!(save_image(&RgbImage::new(8, 8), &path).is_err());
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());
    }
}
