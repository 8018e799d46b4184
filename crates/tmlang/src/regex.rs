// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thin adapter over the Oniguruma binding.
//!
//! The renderer needs three things from a regex engine: a windowed search
//! that fills a capture region, an anchored match for first-line probing,
//! and control over whether `\G` may match at the search position. The
//! binding covers the first two; the third is handled here by compiling a
//! second variant of any pattern containing `\G`, with the anchor replaced
//! by `(?!)` so alternations like `(\G|,)` keep their other arms.

use onig::{RegexOptions, SearchOptions, Syntax};

/// A regex body that failed to compile, with the backend's message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} in pattern {pattern}")]
pub struct RegexError {
    pub pattern: String,
    pub message: String,
}

/// A compiled Oniguruma regex plus its source text.
#[derive(Debug)]
pub struct Regex {
    pattern: String,
    re: onig::Regex,
    /// Compiled only for patterns containing an unescaped `\G`; used when a
    /// search runs with `not_begin_position` set.
    unanchored: Option<onig::Regex>,
}

impl Regex {
    pub fn new(pattern: &str) -> Result<Regex, RegexError> {
        let re = compile(pattern)?;
        let unanchored = if contains_g_anchor(pattern) {
            // The variant may fail to compile in weird cases (e.g. a
            // quantified anchor); treat that as "no variant" rather than
            // rejecting a pattern that compiled fine on its own.
            compile(&without_g_anchor(pattern)).ok()
        } else {
            None
        };
        Ok(Regex { pattern: pattern.to_string(), re, unanchored })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Number of capture groups, including group 0.
    pub fn capture_count(&self) -> usize {
        self.re.captures_len() + 1
    }

    /// Group indices of the named capture `name`, in definition order.
    pub fn named_group_indices(&self, name: &str) -> Vec<usize> {
        let mut indices = Vec::new();
        self.re.foreach_name(|n, groups| {
            if n == name {
                indices.extend(groups.iter().map(|&g| g as usize));
            }
            true
        });
        indices
    }

    /// Searches `[from, to)` of `haystack` and returns the captures of the
    /// leftmost match. With `not_begin_position`, `\G` is forbidden from
    /// matching at `from`.
    pub fn search(
        &self,
        haystack: &str,
        from: usize,
        to: usize,
        not_begin_position: bool,
    ) -> Option<Captures> {
        if from > to || to > haystack.len() {
            return None;
        }
        let re = if not_begin_position {
            self.unanchored.as_ref().unwrap_or(&self.re)
        } else {
            &self.re
        };
        let mut region = onig::Region::new();
        re.search_with_options(
            haystack,
            from,
            to,
            SearchOptions::SEARCH_OPTION_NONE,
            Some(&mut region),
        )?;
        Some(Captures::from_region(&region))
    }

    /// Anchored match at `at`; no captures are reported.
    pub fn match_at(&self, haystack: &str, at: usize) -> bool {
        self.re
            .match_with_options(haystack, at, SearchOptions::SEARCH_OPTION_NONE, None)
            .is_some()
    }
}

fn compile(pattern: &str) -> Result<onig::Regex, RegexError> {
    onig::Regex::with_options(
        pattern,
        RegexOptions::REGEX_OPTION_CAPTURE_GROUP,
        Syntax::oniguruma(),
    )
    .map_err(|err| RegexError { pattern: pattern.to_string(), message: err.to_string() })
}

/// True if `pattern` contains a `\G` whose backslash is not itself escaped.
pub(crate) fn contains_g_anchor(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'\\' {
            if bytes[i + 1] == b'G' {
                return true;
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    false
}

fn without_g_anchor(pattern: &str) -> String {
    let bytes = pattern.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            if bytes[i + 1] == b'G' {
                out.extend_from_slice(b"(?!)");
            } else {
                out.push(bytes[i]);
                out.push(bytes[i + 1]);
            }
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    // Only escapes were rewritten, so the bytes are still valid UTF-8.
    String::from_utf8(out).unwrap_or_default()
}

/// Byte spans of every capture group of one match. Group 0 is the whole
/// match; groups that didn't participate are `None`.
#[derive(Clone, Debug, Default)]
pub struct Captures {
    pos: Vec<Option<(usize, usize)>>,
}

impl Captures {
    fn from_region(region: &onig::Region) -> Captures {
        Captures { pos: (0..region.len()).map(|i| region.pos(i)).collect() }
    }

    pub fn len(&self) -> usize {
        self.pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    pub fn pos(&self, group: usize) -> Option<(usize, usize)> {
        self.pos.get(group).copied().flatten()
    }

    /// Start of the whole match.
    pub fn begin(&self) -> usize {
        self.pos.first().copied().flatten().unwrap_or_default().0
    }

    /// End of the whole match.
    pub fn end(&self) -> usize {
        self.pos.first().copied().flatten().unwrap_or_default().1
    }

    /// Shifts every span by `base`. Searches run against a single line; this
    /// rebases their results into document offsets.
    pub fn offset_by(mut self, base: usize) -> Captures {
        for pos in &mut self.pos {
            if let Some((start, end)) = pos {
                *start += base;
                *end += base;
            }
        }
        self
    }
}
