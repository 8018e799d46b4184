// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The render loop: turns one unpacked source tree into a rendered archive
//! in the cache. An archive is a page per file, an index page per directory,
//! and the metadata/search-index file that makes it searchable and
//! reclaimable.

use std::fs;
use std::io::{self, BufWriter, Write as _};
use std::path::Path;

use chrono::Utc;
use tmlang::highlight::Highlighter;

use crate::archive::{self, Archive, DirectoryEntry, ScanError, TEXT_FILE_SIZE_LIMIT, join_path};
use crate::pages::{self, Page, directory_page_name};
use crate::reclaim::CachePaths;
use crate::search::{ArchiveMetadata, MetadataError, SearchIndex, write_metadata_file};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

pub struct RenderSummary {
    pub files: usize,
    pub directories: usize,
    pub initial_directory: String,
}

/// Renders the tree at `tree` into `cache` under the archive name `name`.
pub fn render_archive(
    tree: &Path,
    cache: &CachePaths,
    name: &str,
    highlighter: &Highlighter<String>,
) -> Result<RenderSummary, RenderError> {
    fs::create_dir_all(&cache.root)?;
    fs::create_dir_all(&cache.meta)?;

    // Size the index before scanning; every tree entry gets a slot.
    let entries = archive::count_entries(tree)?;
    let mut index = SearchIndex::new(entries);
    let archive = archive::scan_tree(tree, |file, contents| index.add_file(file, contents))?;

    let out_root = cache.root.join(name);
    for dir in archive.directories.keys() {
        fs::create_dir_all(out_root.join(dir))?;
    }
    for dir in archive.directories.keys() {
        write_directory_page(&out_root, name, &archive, dir, tree, highlighter)?;
    }
    for file in &archive.files {
        write_file_page(&out_root, name, &archive, file, tree, highlighter)?;
    }

    let metadata = ArchiveMetadata {
        version: 1,
        archive_path: name.to_string(),
        creation_time: Utc::now(),
        number_of_files: entries,
        initial_directory: archive.initial_directory.clone(),
    };
    write_metadata_file(&cache.metadata_path(name), &index, &metadata)?;

    Ok(RenderSummary {
        files: archive.files.len(),
        directories: archive.directories.len(),
        initial_directory: archive.initial_directory,
    })
}

fn entry_of<'a>(archive: &'a Archive, file: &str) -> Option<&'a DirectoryEntry> {
    let (dir, base) = match file.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", file),
    };
    archive.directories.get(dir)?.entries.get(base)
}

fn write_file_page(
    out_root: &Path,
    archive_name: &str,
    archive: &Archive,
    file: &str,
    tree: &Path,
    highlighter: &Highlighter<String>,
) -> Result<(), RenderError> {
    let Some(entry) = entry_of(archive, file) else { return Ok(()) };
    let contents = if entry.size <= TEXT_FILE_SIZE_LIMIT {
        fs::read(tree.join(file)).unwrap_or_default()
    } else {
        Vec::new()
    };
    let page = Page { name: file, is_directory: false, archive_name };
    let mut w = BufWriter::new(fs::File::create(out_root.join(file))?);
    pages::write_file_page(&mut w, &page, entry, &contents, highlighter)?;
    w.flush()?;
    Ok(())
}

fn write_directory_page(
    out_root: &Path,
    archive_name: &str,
    archive: &Archive,
    dir: &str,
    tree: &Path,
    highlighter: &Highlighter<String>,
) -> Result<(), RenderError> {
    let directory = &archive.directories[dir];
    let readme_contents;
    let readme = if directory.readme_name.is_empty() {
        None
    } else {
        let readme_path = join_path(dir, &directory.readme_name);
        readme_contents = fs::read(tree.join(&readme_path)).unwrap_or_default();
        directory
            .entries
            .get(&directory.readme_name)
            .map(|entry| (entry, readme_contents.as_slice()))
    };
    let page = Page { name: dir, is_directory: true, archive_name };
    let mut w = BufWriter::new(fs::File::create(out_root.join(directory_page_name(dir)))?);
    pages::write_directory_page(&mut w, &page, archive, readme, highlighter)?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::scope_class;
    use crate::search::{read_metadata_file, search_rendered};
    use tmlang::rules::RawLanguage;

    fn toy_grammar() -> RawLanguage {
        RawLanguage::from_json(
            r##"{
                "scopeName": "source.toy",
                "fileTypes": ["toy"],
                "patterns": [
                    { "match": "//.*", "name": "comment.line.toy" },
                    { "match": "\\b(?:fn|let)\\b", "name": "keyword.toy" }
                ]
            }"##,
        )
        .unwrap()
    }

    #[test]
    fn renders_and_searches_a_tree_end_to_end() {
        let base = std::env::temp_dir().join("srcview-render-test");
        fs::remove_dir_all(&base).ok();
        let tree = base.join("tree/demo");
        fs::create_dir_all(tree.join("src")).unwrap();
        fs::write(tree.join("src/main.toy"), "fn main\nlet haystack = 1 // needle here\n")
            .unwrap();
        fs::write(tree.join("README"), "a demo tree\n").unwrap();
        fs::write(tree.join("blob.bin"), [0u8, 1, 2]).unwrap();

        let cache = CachePaths::new(&base.join("cache"));
        let highlighter = Highlighter::new(&[toy_grammar()], scope_class).unwrap();
        let summary =
            render_archive(&base.join("tree/demo"), &cache, "demo", &highlighter).unwrap();
        assert_eq!(summary.files, 3);

        // The rendered page exists and carries highlighted spans.
        let page = fs::read_to_string(cache.root.join("demo/src/main.toy")).unwrap();
        assert!(page.contains("<span class='hl-keyword'>fn</span>"));
        assert!(page.contains("<span class='hl-comment'>// needle here</span>"));
        let index_page = fs::read_to_string(cache.root.join("demo/index.html")).unwrap();
        assert!(index_page.contains("README"));

        // The binary file rendered as a stub.
        let blob = fs::read_to_string(cache.root.join("demo/blob.bin")).unwrap();
        assert!(blob.contains("binary file"));

        // The metadata file round-trips and the search finds the needle
        // through markup, reporting the right line.
        let (metadata, index) = read_metadata_file(&cache.metadata_path("demo")).unwrap();
        assert_eq!(metadata.initial_directory, "");
        let results =
            search_rendered(&cache.root, "demo", &index, "needle", None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file, "src/main.toy");
        assert_eq!(results[0].first_line, 1);
        assert!(results[0].html.contains("needle"));
        assert!(results[0].html.contains("class='search-result'"));

        // A filter that doesn't match the path suppresses the hit.
        let filtered = search_rendered(
            &cache.root,
            "demo",
            &index,
            "needle",
            Some(&regex::Regex::new("^docs/").unwrap()),
        );
        assert!(filtered.is_empty());

        fs::remove_dir_all(&base).ok();
    }
}
