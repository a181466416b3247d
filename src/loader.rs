// loader.rs: Image source: a directory of files decoded as 8-bit grayscale.
//
// Files are visited in name order so a batch is reproducible. Files that do
// not decode are skipped and counted; the load fails only when the directory
// is missing, has no entries, or yields no image at all.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use crate::image::Image;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("image directory {} does not exist", .0.display())]
    MissingDirectory(PathBuf),

    #[error("image directory {} has no entries", .0.display())]
    EmptyDirectory(PathBuf),

    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decoding {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: ::image::ImageError,
    },

    #[error("none of the {failed} files in {} could be decoded", .dir.display())]
    NothingLoaded { dir: PathBuf, failed: usize },
}

/// Where to load from and how much.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub dir: PathBuf,
    /// Stop after this many files, `None` for all.
    pub limit: Option<usize>,
}

impl LoaderConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        LoaderConfig { dir: dir.into(), limit: None }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The decoded images and what happened to every file.
#[derive(Debug, Clone)]
pub struct LoadedBatch {
    pub images: Vec<Image<u8>>,
    /// Source of each entry in `images`.
    pub paths: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl LoadedBatch {
    /// The largest `(rows, cols)` window every image covers.
    pub fn common_shape(&self) -> Option<(usize, usize)> {
        let rows = self.images.iter().map(|img| img.height()).min()?;
        let cols = self.images.iter().map(|img| img.width()).min()?;
        Some((rows, cols))
    }

    /// Whether every image has the same dimensions.
    pub fn is_uniform(&self) -> bool {
        self.images
            .windows(2)
            .all(|w| w[0].width() == w[1].width() && w[0].height() == w[1].height())
    }
}

/// Regular files in `dir`, sorted by name, at most `limit` of them.
pub fn list_image_files(dir: &Path, limit: Option<usize>) -> Result<Vec<PathBuf>, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::MissingDirectory(dir.to_path_buf()));
    }
    let io_err = |source: std::io::Error| LoadError::Io { path: dir.to_path_buf(), source };

    let mut files = Vec::new();
    let mut saw_entry = false;
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        saw_entry = true;
        if entry.file_type().map_err(io_err)?.is_file() {
            files.push(entry.path());
        }
    }
    if !saw_entry {
        return Err(LoadError::EmptyDirectory(dir.to_path_buf()));
    }
    files.sort();
    if let Some(limit) = limit {
        files.truncate(limit);
    }
    Ok(files)
}

/// Decode one file as 8-bit grayscale.
pub fn load_grayscale(path: &Path) -> Result<Image<u8>, LoadError> {
    let decoded = ::image::open(path)
        .map_err(|source| LoadError::Decode { path: path.to_path_buf(), source })?;
    let luma = decoded.to_luma8();
    let (width, height) = luma.dimensions();
    Ok(Image::from_vec(width as usize, height as usize, luma.into_raw()))
}

/// Load every decodable file named by `config`.
pub fn load_batch(config: &LoaderConfig) -> Result<LoadedBatch, LoadError> {
    let files = list_image_files(&config.dir, config.limit)?;
    let mut batch = LoadedBatch { images: Vec::new(), paths: Vec::new(), failed: Vec::new() };

    for path in files {
        match load_grayscale(&path) {
            Ok(img) => {
                batch.images.push(img);
                batch.paths.push(path);
            }
            Err(e) => {
                warn!("{e}");
                batch.failed.push(path);
            }
        }
    }

    info!(
        "loaded {} images, could not load {} from {}",
        batch.images.len(),
        batch.failed.len(),
        config.dir.display()
    );
    if batch.images.is_empty() {
        return Err(LoadError::NothingLoaded { dir: config.dir.clone(), failed: batch.failed.len() });
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_directory() {
        let err = list_image_files(Path::new("/definitely/not/here"), None).unwrap_err();
        assert!(matches!(err, LoadError::MissingDirectory(_)));
    }

    #[test]
    fn test_config_builder() {
        let config = LoaderConfig::new("imgs").with_limit(1);
        assert_eq!(config.dir, PathBuf::from("imgs"));
        assert_eq!(config.limit, Some(1));
    }

    #[test]
    fn test_common_shape() {
        let batch = LoadedBatch {
            images: vec![Image::new(6, 4), Image::new(5, 7)],
            paths: vec![],
            failed: vec![],
        };
        assert_eq!(batch.common_shape(), Some((4, 5)));
        assert!(!batch.is_uniform());
    }
}
