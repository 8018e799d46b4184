// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache reclamation by size water marks. When the rendered cache grows past
//! the high mark, the oldest archives are deleted until usage drops under the
//! low mark. Rendered trees, metadata, and any empty parent directories go
//! together; an archive can always be re-rendered from its source.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::search::read_metadata_file;

pub struct CachePaths {
    /// Rendered pages, one tree per archive.
    pub root: PathBuf,
    /// Metadata + search index files, one per archive.
    pub meta: PathBuf,
}

impl CachePaths {
    pub fn new(base: &Path) -> CachePaths {
        CachePaths { root: base.join("root"), meta: base.join("meta") }
    }

    /// Where an archive's metadata file lives. The sanitized name keeps the
    /// file recognizable when debugging; the digest keeps it collision-free.
    pub fn metadata_path(&self, archive_path: &str) -> PathBuf {
        let mut name: String = archive_path
            .chars()
            .take(64)
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        name.push('_');
        name.push_str(&format!("{:016x}", fnv1a(archive_path.as_bytes())));
        self.meta.join(name)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Total size of everything under `path`, in bytes.
pub fn directory_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

/// Removes one archive's rendered tree and metadata, pruning any parent
/// directories left empty.
pub fn reclaim_archive(cache: &CachePaths, archive_path: &str) -> io::Result<()> {
    log::info!("reclaiming archive {archive_path}");
    fs::remove_file(cache.metadata_path(archive_path)).ok();
    reclaim_directory(&cache.root.join(archive_path));
    Ok(())
}

fn reclaim_directory(directory: &Path) {
    fs::remove_dir_all(directory).ok();
    let mut directory = directory.to_path_buf();
    while let Some(parent) = directory.parent() {
        if fs::remove_dir(parent).is_err() {
            break;
        }
        directory = parent.to_path_buf();
    }
}

/// Brings cache usage under `low_mark` if it exceeds `high_mark`, deleting
/// the oldest archives first. Returns the archive paths reclaimed.
pub fn reclaim(cache: &CachePaths, low_mark: u64, high_mark: u64) -> io::Result<Vec<String>> {
    let mut reclaimed = Vec::new();
    let mut used = directory_size(&cache.root)? + directory_size(&cache.meta)?;
    if used <= high_mark {
        return Ok(reclaimed);
    }

    // Oldest first, by the creation time recorded in each metadata file.
    // Unreadable metadata files are reclaimed outright.
    let mut archives = Vec::new();
    for entry in fs::read_dir(&cache.meta)? {
        let entry = entry?;
        match read_metadata_file(&entry.path()) {
            Ok((metadata, _)) => archives.push((metadata.creation_time, metadata.archive_path)),
            Err(err) => {
                log::warn!("removing unreadable metadata file {}: {err}", entry.path().display());
                fs::remove_file(entry.path()).ok();
            }
        }
    }
    archives.sort();

    for (_, archive_path) in archives {
        if used < low_mark {
            break;
        }
        reclaim_archive(cache, &archive_path)?;
        reclaimed.push(archive_path);
        used = directory_size(&cache.root)? + directory_size(&cache.meta)?;
    }
    if used >= low_mark {
        log::warn!("cache still over the low water mark after reclaiming all archives");
    }
    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{ArchiveMetadata, SearchIndex, write_metadata_file};
    use chrono::{TimeZone, Utc};

    fn write_archive(cache: &CachePaths, name: &str, year: i32, bytes: usize) {
        let dir = cache.root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("index.html"), vec![b'x'; bytes]).unwrap();
        let metadata = ArchiveMetadata {
            version: 1,
            archive_path: name.to_string(),
            creation_time: Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap(),
            number_of_files: 1,
            initial_directory: String::new(),
        };
        let index = SearchIndex::new(1);
        write_metadata_file(&cache.metadata_path(name), &index, &metadata).unwrap();
    }

    #[test]
    fn reclaims_oldest_archives_until_under_the_low_mark() {
        let base = std::env::temp_dir().join("srcview-reclaim-test");
        fs::remove_dir_all(&base).ok();
        let cache = CachePaths::new(&base);
        fs::create_dir_all(&cache.root).unwrap();
        fs::create_dir_all(&cache.meta).unwrap();

        write_archive(&cache, "old", 2020, 10_000);
        write_archive(&cache, "mid", 2022, 10_000);
        write_archive(&cache, "new", 2024, 10_000);

        // Each archive holds ~10 KB of pages plus a ~17 KB metadata file;
        // under the high mark nothing happens.
        assert!(reclaim(&cache, 10_000, 1_000_000).unwrap().is_empty());

        // Over the high mark, the oldest goes and usage drops under the low
        // mark; the others survive.
        let reclaimed = reclaim(&cache, 60_000, 70_000).unwrap();
        assert_eq!(reclaimed, vec!["old".to_string()]);
        assert!(!cache.root.join("old").exists());
        assert!(cache.root.join("mid").exists());
        assert!(cache.root.join("new").exists());

        // Tighter marks take the rest, oldest first.
        let reclaimed = reclaim(&cache, 1_000, 10_000).unwrap();
        assert_eq!(reclaimed, vec!["mid".to_string(), "new".to_string()]);

        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn metadata_paths_stay_recognizable() {
        let cache = CachePaths::new(Path::new("/cache"));
        let path = cache.metadata_path("demo-1.0/src");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("demo_1_0_src_"));
        // Different archives never share a file.
        assert_ne!(cache.metadata_path("a"), cache.metadata_path("b"));
    }
}
