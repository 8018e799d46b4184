// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The search subsystem: a trigram bloom filter over every indexed file, the
//! full search over rendered HTML, and the metadata file that persists both
//! the filter and the archive's identity.
//!
//! The filter maps each trigram (via a Rabin-Karp rolling hash mixed with the
//! FNV offset basis) to two buckets of 2^14; each bucket holds one bit per
//! file. A query ANDs the buckets of its trigrams, so it can return false
//! positives but never misses. Candidate files are then actually searched in
//! their rendered form, stripping tags with an offset map so matches can be
//! wrapped in result anchors within the existing markup.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pages::{BEGIN_SEARCH_MARKER, END_SEARCH_MARKER, escape_html};

const RABIN_KARP_BASE: u32 = 16777619;

const FILTER_BITS: u32 = 14;
const FILTER_SIZE: usize = 1 << FILTER_BITS;
const FILTER_MASK: u32 = FILTER_SIZE as u32 - 1;
// The fnv 32-bit offset basis.
const FILTER_MIX: u32 = 2166136261;

/// Context lines shown around each match in search results.
pub const MATCH_CONTEXT_LINES_BEFORE: usize = 3;
pub const MATCH_CONTEXT_LINES_AFTER: usize = 3;

struct RabinKarp<'a> {
    outgoing_base: u32,
    bytes: &'a [u8],
    window_size: usize,
    hash: u32,
    outgoing_offset: i64,
}

impl<'a> RabinKarp<'a> {
    fn new(bytes: &'a [u8], window_size: usize) -> RabinKarp<'a> {
        let mut rk = RabinKarp { outgoing_base: 1, bytes, window_size, hash: 0, outgoing_offset: -1 };
        for i in 0..window_size.min(bytes.len()) {
            rk.outgoing_base = rk.outgoing_base.wrapping_mul(RABIN_KARP_BASE);
            rk.step(bytes[i], 0);
        }
        rk
    }

    fn step(&mut self, incoming: u8, outgoing: u8) {
        self.hash = self
            .hash
            .wrapping_mul(RABIN_KARP_BASE)
            .wrapping_add(incoming as u32)
            .wrapping_sub(self.outgoing_base.wrapping_mul(outgoing as u32));
    }

    fn next(&mut self) -> bool {
        if self.outgoing_offset + self.window_size as i64 >= self.bytes.len() as i64 {
            return false;
        }
        if self.outgoing_offset >= 0 {
            let outgoing = self.outgoing_offset as usize;
            self.step(self.bytes[outgoing + self.window_size], self.bytes[outgoing]);
        }
        self.outgoing_offset += 1;
        true
    }
}

pub struct SearchIndex {
    filter: Vec<u8>,
    name_lengths: Vec<u8>,
    names: Vec<u8>,
    number_of_files: usize,
    next_file_index: usize,
}

impl SearchIndex {
    pub fn new(number_of_files: usize) -> SearchIndex {
        let stride = number_of_files.div_ceil(8);
        SearchIndex {
            filter: vec![0; stride * FILTER_SIZE],
            name_lengths: vec![0; number_of_files],
            names: Vec::new(),
            number_of_files,
            next_file_index: 0,
        }
    }

    fn stride(&self) -> usize {
        self.number_of_files.div_ceil(8)
    }

    pub fn add_file(&mut self, name: &str, contents: &[u8]) {
        if name.is_empty() {
            log::warn!("search index: ignoring file with empty name");
            return;
        }
        if name.len() > 0xff {
            log::warn!("search index: name of '{:.9}...' too long to index", name);
            return;
        }
        if self.next_file_index >= self.number_of_files {
            log::warn!("search index: out of file slots, '{name}' not indexed");
            return;
        }
        let stride = self.stride();
        let index = self.next_file_index;
        self.next_file_index += 1;
        let mut rk = RabinKarp::new(contents, 3);
        while rk.next() {
            let h = rk.hash.wrapping_mul(FILTER_MIX);
            for bucket in [h & FILTER_MASK, (h >> FILTER_BITS) & FILTER_MASK] {
                self.filter[stride * bucket as usize + index / 8] |= 1 << (index % 8);
            }
        }
        self.name_lengths[index] = name.len() as u8;
        self.names.extend_from_slice(name.as_bytes());
    }

    /// Names of every file that may contain `query`. Queries shorter than one
    /// trigram can't filter anything and return all indexed files.
    pub fn search(&self, query: &[u8]) -> Vec<String> {
        let stride = self.stride();
        let mut matches = vec![0xffu8; stride];
        let mut rk = RabinKarp::new(query, 3);
        while rk.next() {
            let h = rk.hash.wrapping_mul(FILTER_MIX);
            for bucket in [h & FILTER_MASK, (h >> FILTER_BITS) & FILTER_MASK] {
                let row = &self.filter[stride * bucket as usize..stride * bucket as usize + stride];
                for (m, &f) in matches.iter_mut().zip(row) {
                    *m &= f;
                }
            }
        }
        let mut filenames = Vec::new();
        let mut name_offset = 0;
        for i in 0..self.number_of_files {
            let n = self.name_lengths[i] as usize;
            if n == 0 {
                break;
            }
            let offset = name_offset;
            name_offset += n;
            if matches[i / 8] & (1 << (i % 8)) == 0 {
                continue;
            }
            if let Ok(name) = std::str::from_utf8(&self.names[offset..offset + n]) {
                filenames.push(name.to_string());
            }
        }
        filenames
    }
}

// -- metadata file
//
// Layout: [filter][name lengths][names][metadata json][json length: u32 le]
// [crc32 of everything prior: u32 le]. The length makes the json easy to find
// from the end; the checksum catches partially-written files after a crash.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub version: i32,
    pub archive_path: String,
    pub creation_time: DateTime<Utc>,
    pub number_of_files: usize,
    pub initial_directory: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad checksum ({computed:08x} vs {stored:08x})")]
    BadChecksum { computed: u32, stored: u32 },
    #[error("metadata file is truncated")]
    Truncated,
    #[error("bad metadata json: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn write_metadata_file(
    path: &Path,
    index: &SearchIndex,
    metadata: &ArchiveMetadata,
) -> Result<(), MetadataError> {
    let json = serde_json::to_vec(metadata)?;
    let mut bytes = Vec::with_capacity(
        index.filter.len() + index.name_lengths.len() + index.names.len() + json.len() + 8,
    );
    bytes.extend_from_slice(&index.filter);
    bytes.extend_from_slice(&index.name_lengths);
    bytes.extend_from_slice(&index.names);
    bytes.extend_from_slice(&json);
    bytes.extend_from_slice(&(json.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&crc32(&bytes).to_le_bytes());
    fs::write(path, bytes)?;
    Ok(())
}

pub fn read_metadata_file(path: &Path) -> Result<(ArchiveMetadata, SearchIndex), MetadataError> {
    let bytes = fs::read(path)?;
    if bytes.len() < 8 {
        return Err(MetadataError::Truncated);
    }
    let (body, tail) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed = crc32(body);
    if computed != stored {
        return Err(MetadataError::BadChecksum { computed, stored });
    }
    let (body, tail) = body.split_at(body.len() - 4);
    let json_len = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]) as usize;
    if json_len > body.len() {
        return Err(MetadataError::Truncated);
    }
    let (index_bytes, json) = body.split_at(body.len() - json_len);
    let metadata: ArchiveMetadata = serde_json::from_slice(json)?;

    let mut index = SearchIndex::new(metadata.number_of_files);
    let filter_len = index.filter.len();
    let names_offset = filter_len + metadata.number_of_files;
    if index_bytes.len() < names_offset {
        return Err(MetadataError::Truncated);
    }
    index.filter.copy_from_slice(&index_bytes[..filter_len]);
    index.name_lengths.copy_from_slice(&index_bytes[filter_len..names_offset]);
    index.names = index_bytes[names_offset..].to_vec();
    index.next_file_index =
        index.name_lengths.iter().take_while(|&&n| n != 0).count();
    Ok((metadata, index))
}

pub(crate) fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xedb88320 } else { crc >> 1 };
        }
    }
    !crc
}

// -- full search over rendered files

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    NoMatch,
    Match,
    /// The bytes before the begin marker and after the end marker; reported
    /// as a single pseudo-line regardless of the newlines inside.
    Surrounding,
}

#[derive(Debug)]
pub struct ResultLine {
    pub kind: LineKind,
    pub bytes: Vec<u8>,
}

/// Walks a rendered file line by line, stripping tags to find `query` and
/// wrapping each hit with the tag pair produced by `tags`. Relies on the
/// renderer's conventions: entities escaped, newlines normalized, `<`/`>`
/// only in tags, and no element spanning lines.
pub fn match_lines(
    content: &[u8],
    query: &str,
    tags: &mut dyn FnMut() -> (String, String),
    visit: &mut dyn FnMut(ResultLine),
) {
    let Some(start) = find(content, BEGIN_SEARCH_MARKER.as_bytes()) else {
        visit(ResultLine { kind: LineKind::Surrounding, bytes: content.to_vec() });
        return;
    };
    let start = start + BEGIN_SEARCH_MARKER.len();
    let (before, mut buf) = content.split_at(start);
    let Some(end) = rfind(buf, END_SEARCH_MARKER.as_bytes()) else {
        visit(ResultLine { kind: LineKind::Surrounding, bytes: content.to_vec() });
        return;
    };
    let after = &buf[end..];
    buf = &buf[..end];

    visit(ResultLine { kind: LineKind::Surrounding, bytes: before.to_vec() });

    let escaped_query = escape_html(query).into_bytes();
    let mut tags_removed: Vec<u8> = Vec::new();
    let mut offsets: Vec<usize> = Vec::new();
    while !buf.is_empty() {
        // Strip tags from one line, tracking the original offset of every
        // text byte so match positions can be translated back.
        tags_removed.clear();
        offsets.clear();
        let mut offset = 0;
        let mut i = 0;
        while i + offset < buf.len() {
            offsets.push(offset);
            while i + offset < buf.len() && buf[i + offset] == b'<' {
                let tag_length = find(&buf[i + offset..], b">").map_or(buf.len() - i - offset, |n| n + 1);
                offset += tag_length;
            }
            if i + offset < buf.len() {
                let b = buf[i + offset];
                tags_removed.push(b);
                i += 1;
                if b == b'\n' {
                    break;
                }
            }
        }
        offsets.push(offset);
        let line = &buf[..i + offset];
        buf = &buf[i + offset..];

        let mut result_bytes: Vec<u8> = Vec::new();
        let mut kind = LineKind::NoMatch;
        let mut last_end = 0;
        let mut search_from = 0;
        while let Some(found) = find(&tags_removed[search_from..], &escaped_query) {
            let index = search_from + found;
            kind = LineKind::Match;
            let end_index = index + escaped_query.len();
            let start = index + offsets[index];
            let end = end_index + offsets[end_index];
            let (start_tag, end_tag) = tags();
            result_bytes.extend_from_slice(&line[last_end..start]);
            result_bytes.extend_from_slice(start_tag.as_bytes());
            result_bytes.extend_from_slice(&line[start..end]);
            result_bytes.extend_from_slice(end_tag.as_bytes());
            last_end = end;
            search_from = end_index;
        }
        if last_end > 0 {
            result_bytes.extend_from_slice(&line[last_end..]);
        } else {
            result_bytes = line.to_vec();
        }
        visit(ResultLine { kind, bytes: result_bytes });
    }
    visit(ResultLine { kind: LineKind::Surrounding, bytes: after.to_vec() });
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub file: String,
    pub first_line: usize,
    pub lines: usize,
    pub html: String,
}

pub const SEARCH_RESULT_LIMIT: usize = 9999;

/// Runs a full search: the index narrows the files, each candidate's
/// rendered page is scanned, and hits are reported with their surrounding
/// context lines.
pub fn search_rendered(
    cache_root: &Path,
    archive_path: &str,
    index: &SearchIndex,
    query: &str,
    filter: Option<&regex::Regex>,
) -> Vec<SearchResult> {
    let mut results = Vec::new();
    if query.is_empty() {
        return results;
    }
    let mut global_match = 0usize;
    for filename in index.search(query.as_bytes()) {
        if results.len() >= SEARCH_RESULT_LIMIT {
            break;
        }
        if let Some(filter) = filter
            && !filter.is_match(&filename)
        {
            continue;
        }
        let path = cache_root.join(archive_path).join(&filename);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) => {
                log::warn!("search: unable to open {}: {err}", path.display());
                continue;
            }
        };

        let mut which_match = 0usize;
        let mut tags = |global: &mut usize, which: &mut usize| {
            *which += 1;
            *global += 1;
            search_result_tags(&filename, query, *which, *global)
        };
        let mut match_line: Option<usize> = None;
        let mut line_number = 1usize;
        let mut lines: Vec<Vec<u8>> = Vec::new();
        let file = filename.clone();
        let mut emit = |lines: &mut Vec<Vec<u8>>, match_line: usize, line_number: usize| {
            let count = (match_line + MATCH_CONTEXT_LINES_AFTER + 1).min(lines.len());
            let html: Vec<u8> = lines[..count].concat();
            results.push(SearchResult {
                file: file.clone(),
                first_line: line_number - lines.len(),
                lines: count,
                html: String::from_utf8_lossy(&html).into_owned(),
            });
            lines.drain(..count);
        };
        match_lines(
            &contents,
            query,
            &mut || tags(&mut global_match, &mut which_match),
            &mut |line| {
                match line.kind {
                    LineKind::Surrounding => return,
                    LineKind::Match => match_line = Some(lines.len()),
                    LineKind::NoMatch => {}
                }
                line_number += 1;
                lines.push(line.bytes);
                if let Some(m) = match_line
                    && lines.len() > m + MATCH_CONTEXT_LINES_AFTER + MATCH_CONTEXT_LINES_BEFORE + 1
                {
                    emit(&mut lines, m, line_number);
                    match_line = None;
                }
                if match_line.is_none() && lines.len() > MATCH_CONTEXT_LINES_BEFORE {
                    lines.drain(..lines.len() - MATCH_CONTEXT_LINES_BEFORE);
                }
            },
        );
        if let Some(m) = match_line {
            emit(&mut lines, m, line_number);
        }
    }
    results
}

/// Tags inserted around matches on the search results page; each links to the
/// anchored match within its file.
fn search_result_tags(file: &str, query: &str, which: usize, global: usize) -> (String, String) {
    (
        format!(
            "<a class='search-result' href='{}?search={}#{which}' id='{global}'>",
            escape_html(file),
            escape_url_component(query),
        ),
        "</a>".to_string(),
    )
}

pub(crate) fn escape_url_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
