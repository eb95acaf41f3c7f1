//! Static X-ray catalog (spec §4.6, C6).
//!
//! Grounded directly in `XRayManager.cpp`: a 1-based flat catalog of
//! `{idx}.jpg` files under one directory, where the total is simply the count
//! of non-directory entries. `StaticImageProvider` turns that into a trait so
//! the server engine and its tests never depend on the filesystem directly.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{NirError, Result};

pub trait StaticImageProvider: Send + Sync {
    /// Number of addressable images, 0 if the catalog is empty or unreadable.
    fn total(&self) -> u32;

    /// Fetch image `index` (1-based, matching `XRayManager::ReadImage`).
    /// Returns `NirError::NotFound` for `index == 0`, `index > total()`, or a
    /// file that can't be read.
    fn read(&self, index: u32) -> Result<Vec<u8>>;
}

/// Reads `{index}.jpg` files out of a directory, counting the total once at
/// construction time the way `XRayManager::constructor_helper` does.
pub struct DirectoryImageProvider {
    dir: PathBuf,
    total: u32,
}

impl DirectoryImageProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let total = count_non_directory_entries(&dir);
        DirectoryImageProvider { dir, total }
    }

    fn image_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{index}.jpg"))
    }
}

impl StaticImageProvider for DirectoryImageProvider {
    fn total(&self) -> u32 {
        self.total
    }

    fn read(&self, index: u32) -> Result<Vec<u8>> {
        if index == 0 || index > self.total {
            return Err(NirError::NotFound);
        }
        fs::read(self.image_path(index)).map_err(|_| NirError::NotFound)
    }
}

fn count_non_directory_entries(dir: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| !ft.is_dir()).unwrap_or(false))
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn populate(dir: &Path, count: usize) {
        for idx in 1..=count {
            let mut f = File::create(dir.join(format!("{idx}.jpg"))).unwrap();
            f.write_all(format!("image-{idx}").as_bytes()).unwrap();
        }
    }

    #[test]
    fn total_counts_only_files() {
        let tmp = tempfile::tempdir().unwrap();
        populate(tmp.path(), 3);
        fs::create_dir(tmp.path().join("subdir")).unwrap();
        let provider = DirectoryImageProvider::new(tmp.path());
        assert_eq!(provider.total(), 3);
    }

    #[test]
    fn read_is_one_based() {
        let tmp = tempfile::tempdir().unwrap();
        populate(tmp.path(), 2);
        let provider = DirectoryImageProvider::new(tmp.path());
        assert_eq!(provider.read(1).unwrap(), b"image-1");
        assert_eq!(provider.read(2).unwrap(), b"image-2");
    }

    #[test]
    fn read_rejects_zero_and_out_of_range() {
        let tmp = tempfile::tempdir().unwrap();
        populate(tmp.path(), 1);
        let provider = DirectoryImageProvider::new(tmp.path());
        assert!(matches!(provider.read(0), Err(NirError::NotFound)));
        assert!(matches!(provider.read(2), Err(NirError::NotFound)));
    }

    #[test]
    fn empty_directory_reports_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = DirectoryImageProvider::new(tmp.path());
        assert_eq!(provider.total(), 0);
    }
}
