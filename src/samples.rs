use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::debug;
use walkdir::WalkDir;

use crate::codec::{decode_bytes, ImageArray};
use crate::errors::{InstanSegError, Result};

/// A bundled demo image.
#[derive(Debug, Clone)]
pub struct SampleImage {
    pub path: PathBuf,
    /// File contents as stored on disk.
    pub encoded: Vec<u8>,
    pub image: ImageArray,
}

/// Reads and decodes every file directly inside `dir`.
///
/// Files are not filtered by extension, so anything that is not an image
/// fails the whole call, as does a dangling symlink. Entries come back sorted
/// by file name.
pub fn load_sample_images(dir: &Path) -> Result<Vec<SampleImage>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir)
        .follow_links(true)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| InstanSegError::FileSystem {
            path: dir.to_path_buf(),
            operation: "sample directory listing".to_string(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() {
            paths.push(entry.into_path());
        }
    }
    debug!(dir = %dir.display(), count = paths.len(), "loading sample images");

    paths.into_par_iter().map(load_sample_image).collect()
}

fn load_sample_image(path: PathBuf) -> Result<SampleImage> {
    let encoded = fs::read(&path).map_err(|e| InstanSegError::FileSystem {
        path: path.clone(),
        operation: "sample image read".to_string(),
        source: e,
    })?;
    let image = decode_bytes(&encoded).map_err(|e| InstanSegError::ImageProcessing {
        path: path.display().to_string(),
        operation: "sample image decoding".to_string(),
        source: Box::new(e),
    })?;
    Ok(SampleImage {
        path,
        encoded,
        image,
    })
}
