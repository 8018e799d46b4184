// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Analysis of an unpacked source archive: which files are text, how many
//! lines they have, and how they hang together as a directory tree.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Files above this size render as a "too big" stub and are not indexed.
pub const TEXT_FILE_SIZE_LIMIT: u64 = 10_000_000;

/// How many bytes above `0xF4` to tolerate before declaring a file binary.
/// Some source trees use legacy codepages; a few stray bytes show up as
/// U+FFFD in the output instead of losing the whole file.
pub const WEIRD_CHARACTER_LIMIT: usize = 3;

pub const ENTRIES_PER_DIRECTORY_LIMIT: usize = 99_999;
pub const ARCHIVE_COMPONENT_LIMIT: usize = 99;
pub const ARCHIVE_PATH_LIMIT: usize = 255;

/// Directory pages are written under this name; archive members that would
/// collide with it are skipped during the scan.
pub const INDEX_FILE_NAME: &str = "index.html";

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("path {0} contains a . or .. component")]
    DotComponent(String),
    #[error("empty directory component in path {0}")]
    EmptyComponent(String),
    #[error("length of path {0} greater than limit {ARCHIVE_PATH_LIMIT}")]
    PathTooLong(String),
    #[error("number of path components in {0} greater than limit {ARCHIVE_COMPONENT_LIMIT}")]
    TooManyComponents(String),
    #[error("directory '{0}' has more than {ENTRIES_PER_DIRECTORY_LIMIT} entries")]
    TooManyEntries(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextStats {
    /// Negative means the file doesn't look like text.
    pub lines: i64,
    pub max_line_length: usize,
}

/// Counts lines and sniffs for binary content the way the renderer will see
/// it: a NUL byte or too many impossible UTF-8 lead bytes disqualify the
/// file, and a trailing blank line is not counted.
pub fn analyze_text(contents: &[u8]) -> TextStats {
    let mut stats = TextStats { lines: 1, max_line_length: 0 };
    let mut weird_characters = 0;
    let mut blank_line = true;
    let mut line_length = 0;
    let mut i = 0;
    while i < contents.len() {
        match contents[i] {
            b'\r' | b'\n' => {
                if contents[i] == b'\r' && contents.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                stats.lines += 1;
                stats.max_line_length = stats.max_line_length.max(line_length);
                line_length = 0;
                blank_line = true;
            }
            0 => {
                stats.lines = -1;
                break;
            }
            c => {
                if c > 0xf4 {
                    weird_characters += 1;
                    if weird_characters > WEIRD_CHARACTER_LIMIT {
                        stats.lines = -1;
                        break;
                    }
                }
                line_length += 1;
                blank_line = false;
            }
        }
        i += 1;
    }
    if stats.lines < 0 {
        return TextStats { lines: -1, max_line_length: 0 };
    }
    stats.max_line_length = stats.max_line_length.max(line_length);
    if blank_line {
        stats.lines -= 1;
    }
    stats
}

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub is_file: bool,
    pub modified: SystemTime,
    /// Negative for binary (or unreadable, or too big) files. Directories
    /// accumulate the line counts of everything below them.
    pub lines: i64,
    pub max_line_length: usize,
    pub size: u64,
}

impl DirectoryEntry {
    fn directory() -> DirectoryEntry {
        DirectoryEntry {
            is_file: false,
            modified: SystemTime::UNIX_EPOCH,
            lines: 0,
            max_line_length: 0,
            size: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Directory {
    pub entries: BTreeMap<String, DirectoryEntry>,
    pub directory_names: Vec<String>,
    pub file_names: Vec<String>,
    pub readme_name: String,
}

#[derive(Debug, Default)]
pub struct Archive {
    /// Keyed by slash-joined relative path; the root directory is "".
    pub directories: BTreeMap<String, Directory>,
    /// Relative paths of every regular file, in scan order.
    pub files: Vec<String>,
    /// While the root holds a single directory chain, browsing starts there.
    pub initial_directory: String,
}

impl Archive {
    /// Registers `entry` under its path, creating intermediate directories
    /// and folding modification times and line counts into them.
    fn add_directory_entry(
        &mut self,
        entry: &DirectoryEntry,
        components: &[String],
    ) -> Result<(), ScanError> {
        let joined = components.join("/");
        for (index, component) in components.iter().enumerate() {
            let key = components[..index].join("/");
            let dir = self.directories.entry(key.clone()).or_default();
            let is_intermediate = index != components.len() - 1;
            if component.is_empty() {
                if index == 0 || is_intermediate {
                    return Err(ScanError::EmptyComponent(joined));
                }
                // A trailing empty component just names a directory.
                break;
            }
            if is_intermediate {
                let folded = dir
                    .entries
                    .entry(component.clone())
                    .or_insert_with(DirectoryEntry::directory);
                if entry.modified > folded.modified {
                    folded.modified = entry.modified;
                }
                folded.lines += entry.lines;
            } else {
                dir.entries.insert(component.clone(), entry.clone());
            }
            if dir.entries.len() > ENTRIES_PER_DIRECTORY_LIMIT {
                return Err(ScanError::TooManyEntries(key));
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        // While the root chain holds a single subdirectory, start browsing
        // below it.
        loop {
            let Some(dir) = self.directories.get(&self.initial_directory) else { break };
            if dir.entries.len() != 1 {
                break;
            }
            let Some((name, entry)) = dir.entries.iter().next() else { break };
            if entry.is_file {
                break;
            }
            self.initial_directory = join_path(&self.initial_directory, name);
        }

        for dir in self.directories.values_mut() {
            dir.file_names.clear();
            dir.directory_names.clear();
            for (name, entry) in &dir.entries {
                if entry.is_file {
                    dir.file_names.push(name.clone());
                    if entry.lines > 0 && use_as_readme(&dir.readme_name, name) {
                        dir.readme_name = name.clone();
                    }
                } else {
                    dir.directory_names.push(name.clone());
                }
            }
        }
    }
}

pub fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() { name.to_string() } else { format!("{base}/{name}") }
}

fn find_invalid_component(components: &[String]) -> Option<ScanError> {
    let joined = components.join("/");
    for component in components {
        if component == "." || component == ".." {
            return Some(ScanError::DotComponent(joined));
        }
    }
    None
}

pub fn is_markdown(name: &str) -> bool {
    name.to_lowercase().ends_with(".md")
}

/// Whether `name` should replace `current` as the directory's readme:
/// markdown beats other formats, then shorter names win. HTML source never
/// qualifies.
fn use_as_readme(current: &str, name: &str) -> bool {
    let lower = name.to_lowercase();
    if !lower.contains("readme") {
        return false;
    }
    if lower.ends_with(".html") || lower.ends_with(".htm") {
        return false;
    }
    if current.is_empty() {
        return true;
    }
    if is_markdown(name) && !is_markdown(current) {
        return true;
    }
    if !is_markdown(name) && is_markdown(current) {
        return false;
    }
    name.len() < current.len() || (name.len() == current.len() && name >= current)
}

/// Number of directory entries below `root`, for sizing the search index.
pub fn count_entries(root: &Path) -> io::Result<usize> {
    let mut count = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            count += 1;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            }
        }
    }
    Ok(count)
}

/// Walks the unpacked tree under `root`, building the directory table. Text
/// files within the size limit are read and handed to `on_text_file` (the
/// search indexer) along with their stats.
pub fn scan_tree(
    root: &Path,
    mut on_text_file: impl FnMut(&str, &[u8]),
) -> Result<Archive, ScanError> {
    let mut archive = Archive::default();
    let mut components = Vec::new();
    scan_directory(root, &mut components, &mut archive, &mut on_text_file)?;
    archive.finish();
    Ok(archive)
}

fn scan_directory(
    dir: &Path,
    components: &mut Vec<String>,
    archive: &mut Archive,
    on_text_file: &mut impl FnMut(&str, &[u8]),
) -> Result<(), ScanError> {
    let mut names: Vec<_> = fs::read_dir(dir)?
        .collect::<io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    for name in names {
        // Skip entries that would shadow the generated directory pages.
        if name == INDEX_FILE_NAME {
            continue;
        }
        components.push(name.clone());
        let result = scan_entry(&dir.join(&name), components, archive, on_text_file);
        components.pop();
        result?;
    }
    Ok(())
}

fn scan_entry(
    path: &Path,
    components: &mut Vec<String>,
    archive: &mut Archive,
    on_text_file: &mut impl FnMut(&str, &[u8]),
) -> Result<(), ScanError> {
    let joined = components.join("/");
    if joined.len() > ARCHIVE_PATH_LIMIT {
        return Err(ScanError::PathTooLong(joined));
    }
    if components.len() > ARCHIVE_COMPONENT_LIMIT {
        return Err(ScanError::TooManyComponents(joined));
    }
    if let Some(err) = find_invalid_component(components) {
        return Err(err);
    }

    let metadata = fs::metadata(path)?;
    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    if metadata.is_dir() {
        // Materialize the directory even if it turns out to be empty.
        components.push(String::new());
        let entry = DirectoryEntry { modified, ..DirectoryEntry::directory() };
        let result = archive.add_directory_entry(&entry, components);
        components.pop();
        result?;
        return scan_directory(path, components, archive, on_text_file);
    }

    let mut entry = DirectoryEntry {
        is_file: true,
        modified,
        lines: -1,
        max_line_length: 0,
        size: metadata.len(),
    };
    if metadata.len() <= TEXT_FILE_SIZE_LIMIT {
        match fs::read(path) {
            Ok(contents) => {
                let stats = analyze_text(&contents);
                entry.lines = stats.lines;
                entry.max_line_length = stats.max_line_length;
                if stats.lines >= 0 {
                    on_text_file(&joined, &contents);
                }
            }
            Err(err) => log::warn!("skipping unreadable file {joined}: {err}"),
        }
    }
    archive.files.push(joined);
    archive.add_directory_entry(&entry, components)
}
