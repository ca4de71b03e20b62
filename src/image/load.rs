//! Image loading utilities.

use std::io::ErrorKind;
use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageError};

use crate::error::{Error, Result};

/// Load and decode an image from disk.
///
/// The file is only ever opened for reading.
///
/// # Errors
///
/// Returns [`Error::InputNotFound`] if the path is not a readable file and
/// [`Error::Decode`] if the file cannot be decoded.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path = path.as_ref();

    if !path.is_file() {
        return Err(Error::InputNotFound {
            path: path.to_path_buf(),
        });
    }

    let img = image::open(path).map_err(|source| match source {
        ImageError::IoError(ref io)
            if matches!(io.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) =>
        {
            Error::InputNotFound {
                path: path.to_path_buf(),
            }
        }
        source => Error::Decode {
            path: path.to_path_buf(),
            source,
        },
    })?;

    let (width, height) = img.dimensions();
    tracing::debug!("Decoded {} ({width}x{height}, {:?})", path.display(), img.color());

    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn test_missing_file_is_input_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_image(dir.path().join("nope.png")).unwrap_err();
        assert_eq!(err.kind(), FailureKind::InputNotFound);
    }

    #[test]
    fn test_directory_is_input_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_image(dir.path()).unwrap_err();
        assert_eq!(err.kind(), FailureKind::InputNotFound);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.png");
        std::fs::write(&path, b"definitely not a png").unwrap();

        let err = load_image(&path).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Decode);
    }

    #[test]
    fn test_loads_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("black.png");
        DynamicImage::new_rgb8(30, 20).save(&path).unwrap();

        let img = load_image(&path).unwrap();
        assert_eq!(img.dimensions(), (30, 20));
    }

    #[test]
    fn test_loads_gif_and_tiff() {
        let dir = tempfile::tempdir().unwrap();

        for name in ["upload.gif", "upload.tif"] {
            let path = dir.path().join(name);
            DynamicImage::new_rgb8(30, 20).save(&path).unwrap();

            let img = load_image(&path).unwrap();
            assert_eq!(img.dimensions(), (30, 20), "{name}");
        }
    }
}
