//! Model downloading and caching utilities.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tokenizers::Tokenizer;

use crate::config::ModelSource;
use crate::error::{Error, Result};

/// Environment variable holding an optional registry access token.
const TOKEN_ENV: &str = "HF_TOKEN";

/// Registry filename of the prompt tokenizer.
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Types of models used in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// CLIP text encoder - turns token ids into prompt embeddings.
    TextEncoder,
    /// ControlNet - turns the control image into `UNet` residuals.
    ControlNet,
    /// `UNet` - predicts noise, accepting ControlNet residuals.
    Unet,
    /// VAE Decoder - decodes latents to images.
    VaeDecoder,
    /// Safety checker - flags unsafe generated images.
    SafetyChecker,
}

impl ModelType {
    /// Every model, in pipeline order.
    pub const ALL: [Self; 5] = [
        Self::TextEncoder,
        Self::ControlNet,
        Self::Unet,
        Self::VaeDecoder,
        Self::SafetyChecker,
    ];

    /// Path of the ONNX file inside its repository.
    #[must_use]
    pub const fn filename(&self) -> &'static str {
        match self {
            Self::TextEncoder => "text_encoder/model.onnx",
            Self::ControlNet => "controlnet/model.onnx",
            Self::Unet => "unet/model.onnx",
            Self::VaeDecoder => "vae_decoder/model.onnx",
            Self::SafetyChecker => "safety_checker/model.onnx",
        }
    }

    /// Path of the external weights file, for models large enough to have one.
    /// Note: Must match the reference in the ONNX file (usually `model.onnx_data`).
    #[must_use]
    pub const fn data_filename(&self) -> Option<&'static str> {
        match self {
            Self::ControlNet => Some("controlnet/model.onnx_data"),
            Self::Unet => Some("unet/model.onnx_data"),
            Self::TextEncoder | Self::VaeDecoder | Self::SafetyChecker => None,
        }
    }

    /// Whether the model lives in the conditioning repository.
    #[must_use]
    pub const fn is_conditioning(&self) -> bool {
        matches!(self, Self::ControlNet)
    }

    /// Get the approximate size in bytes for progress indication.
    #[must_use]
    pub const fn approx_size(&self) -> u64 {
        match self {
            Self::TextEncoder => 490_000_000, // ~490 MB
            Self::ControlNet => 1_400_000_000, // ~1.4 GB
            Self::Unet => 3_400_000_000,       // ~3.4 GB
            Self::VaeDecoder => 200_000_000,  // ~200 MB
            Self::SafetyChecker => 1_200_000_000, // ~1.2 GB
        }
    }
}

/// Manages the model cache directory and downloads.
pub struct ModelCache {
    source: ModelSource,
    cache_dir: PathBuf,
    client: Option<Client>,
}

impl ModelCache {
    /// Create a new model cache for the given source.
    ///
    /// With `model_dir` set, files are read from that directory and never
    /// downloaded. Otherwise the platform-appropriate cache directory is used:
    /// - Windows: `%LOCALAPPDATA%\promptshift\models`
    /// - Linux: `~/.cache/promptshift/models`
    /// - macOS: `~/Library/Caches/promptshift/models`
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new(source: &ModelSource) -> Result<Self> {
        if let Some(dir) = &source.model_dir {
            return Ok(Self {
                source: source.clone(),
                cache_dir: dir.clone(),
                client: None,
            });
        }

        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        let cache_dir = base.join("promptshift").join("models");

        fs::create_dir_all(&cache_dir).map_err(|source| Error::CacheDir {
            path: cache_dir.clone(),
            source,
        })?;

        let client = Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| Error::ModelDownload {
                name: "registry client".to_string(),
                source,
            })?;

        Ok(Self {
            source: source.clone(),
            cache_dir,
            client: Some(client),
        })
    }

    /// Get the path to a model file, downloading if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be downloaded or accessed.
    pub fn fetch(&self, model_type: ModelType) -> Result<PathBuf> {
        let repo = if model_type.is_conditioning() {
            &self.source.controlnet_model
        } else {
            &self.source.base_model
        };

        let path = self.fetch_file(repo, model_type.filename(), model_type.approx_size(), true)?;

        // External data is optional: small exports keep weights inline
        if let Some(data_filename) = model_type.data_filename() {
            self.fetch_file(repo, data_filename, model_type.approx_size(), false)?;
        }

        Ok(path)
    }

    /// Load the prompt tokenizer.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer cannot be downloaded or parsed.
    pub fn fetch_tokenizer(&self) -> Result<Tokenizer> {
        let path = self.fetch_file(&self.source.tokenizer_model, TOKENIZER_FILE, 2_000_000, true)?;

        Tokenizer::from_file(&path).map_err(|err| Error::Tokenizer {
            reason: format!("{}: {err}", path.display()),
        })
    }

    /// Local path of a repository file, without fetching it.
    fn local_path(&self, repo: &str, file: &str) -> PathBuf {
        if self.client.is_none() {
            return self.cache_dir.join(file);
        }

        self.cache_dir
            .join(repo.replace('/', "--"))
            .join(&self.source.revision)
            .join(file)
    }

    /// Resolve one file, downloading it when missing.
    ///
    /// Returns the local path; for optional files that the registry does not
    /// have, the returned path does not exist.
    fn fetch_file(&self, repo: &str, file: &str, approx_size: u64, required: bool) -> Result<PathBuf> {
        let path = self.local_path(repo, file);

        if path.exists() {
            return Ok(path);
        }

        let Some(client) = &self.client else {
            if required {
                return Err(Error::ModelStatus {
                    name: path.display().to_string(),
                    status: StatusCode::NOT_FOUND.as_u16(),
                });
            }
            return Ok(path);
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::CacheDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let url = format!(
            "{}/{repo}/resolve/{}/{file}",
            self.source.endpoint.trim_end_matches('/'),
            self.source.revision
        );
        download_file(client, &url, &path, file, approx_size, required)?;

        Ok(path)
    }
}

/// Download a file from a URL to a path with progress indication.
///
/// A 404 on an optional file is not an error.
fn download_file(
    client: &Client,
    url: &str,
    path: &Path,
    name: &str,
    approx_size: u64,
    required: bool,
) -> Result<()> {
    tracing::info!("Downloading {name} from {url}");

    let mut request = client.get(url);
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        request = request.bearer_auth(token);
    }

    let response = request.send().map_err(|source| Error::ModelDownload {
        name: name.to_string(),
        source,
    })?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND && !required {
        tracing::debug!("{name} not present in registry, skipping");
        return Ok(());
    }
    if !status.is_success() {
        return Err(Error::ModelStatus {
            name: name.to_string(),
            status: status.as_u16(),
        });
    }

    let total_size = response.content_length().unwrap_or(approx_size);

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("valid template")
            .progress_chars("#>-"),
    );
    pb.set_message(format!("Downloading {name}"));

    let mut reader = response;
    write_atomically(&mut reader, path, &pb)?;

    pb.finish_with_message(format!("Downloaded {name}"));

    Ok(())
}

/// Stream `reader` into a temporary file next to `path`, then rename it into
/// place. The temporary file is removed if any step fails.
fn write_atomically(reader: &mut impl Read, path: &Path, pb: &ProgressBar) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let result = copy_with_progress(reader, &temp_path, pb)
        .and_then(|()| fs::rename(&temp_path, path));

    if let Err(err) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }

    Ok(())
}

fn copy_with_progress(reader: &mut impl Read, temp_path: &Path, pb: &ProgressBar) -> io::Result<()> {
    let mut file = fs::File::create(temp_path)?;
    let mut downloaded = 0u64;
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])?;
        downloaded += bytes_read as u64;
        pb.set_position(downloaded);
    }

    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn local_source(dir: &Path) -> ModelSource {
        ModelSource {
            model_dir: Some(dir.to_path_buf()),
            ..ModelSource::default()
        }
    }

    #[test]
    fn test_model_paths_are_distinct() {
        let mut names: Vec<_> = ModelType::ALL.iter().map(ModelType::filename).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ModelType::ALL.len());
    }

    #[test]
    fn test_only_controlnet_is_conditioning() {
        let conditioning: Vec<_> = ModelType::ALL
            .into_iter()
            .filter(ModelType::is_conditioning)
            .collect();
        assert_eq!(conditioning, vec![ModelType::ControlNet]);
    }

    #[test]
    fn test_local_dir_resolves_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let vae = dir.path().join("vae_decoder");
        fs::create_dir_all(&vae).unwrap();
        fs::write(vae.join("model.onnx"), b"onnx").unwrap();

        let cache = ModelCache::new(&local_source(dir.path())).unwrap();
        let path = cache.fetch(ModelType::VaeDecoder).unwrap();

        assert_eq!(path, vae.join("model.onnx"));
    }

    #[test]
    fn test_local_dir_missing_model_is_model_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(&local_source(dir.path())).unwrap();

        let err = cache.fetch(ModelType::Unet).unwrap_err();
        assert_eq!(err.kind(), FailureKind::ModelLoad);
    }

    #[test]
    fn test_local_dir_tolerates_missing_external_data() {
        let dir = tempfile::tempdir().unwrap();
        let unet = dir.path().join("unet");
        fs::create_dir_all(&unet).unwrap();
        fs::write(unet.join("model.onnx"), b"onnx").unwrap();

        let cache = ModelCache::new(&local_source(dir.path())).unwrap();
        assert!(cache.fetch(ModelType::Unet).is_ok());
    }

    #[test]
    fn test_bad_tokenizer_is_model_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(TOKENIZER_FILE), b"{not json").unwrap();

        let cache = ModelCache::new(&local_source(dir.path())).unwrap();
        let err = cache.fetch_tokenizer().unwrap_err();
        assert_eq!(err.kind(), FailureKind::ModelLoad);
    }

    /// Reader that yields some bytes, then fails.
    struct BrokenStream {
        sent: bool,
    }

    impl Read for BrokenStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
            }
            self.sent = true;
            buf[..4].copy_from_slice(b"onnx");
            Ok(4)
        }
    }

    #[test]
    fn test_model_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        for model in ModelType::ALL {
            let path = dir.path().join(model.filename());
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"onnx").unwrap();
        }

        let cache = ModelCache::new(&local_source(dir.path())).unwrap();
        for model in ModelType::ALL {
            assert_eq!(cache.fetch(model).unwrap(), dir.path().join(model.filename()));
        }
        assert_eq!(
            cache.local_path("ignored/repo", TOKENIZER_FILE),
            dir.path().join(TOKENIZER_FILE)
        );
    }

    #[test]
    fn test_registry_layout_is_per_repo_and_revision() {
        let cache = ModelCache {
            source: ModelSource {
                revision: "v1".to_string(),
                ..ModelSource::default()
            },
            cache_dir: PathBuf::from("/cache"),
            client: Some(Client::new()),
        };

        assert_eq!(
            cache.local_path("acme/sd15-controlnet-onnx", ModelType::Unet.filename()),
            PathBuf::from("/cache/acme--sd15-controlnet-onnx/v1/unet/model.onnx")
        );
    }

    #[test]
    fn test_failed_stream_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");

        let err = write_atomically(&mut BrokenStream { sent: false }, &path, &ProgressBar::hidden())
            .unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert!(!path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::create_dir_all(path.join("occupied")).unwrap();

        let mut reader: &[u8] = b"onnx";
        assert!(write_atomically(&mut reader, &path, &ProgressBar::hidden()).is_err());

        assert!(path.is_dir());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_complete_stream_is_renamed_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");

        let mut reader: &[u8] = b"onnx weights";
        write_atomically(&mut reader, &path, &ProgressBar::hidden()).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"onnx weights");
        assert!(!path.with_extension("tmp").exists());
    }
}
