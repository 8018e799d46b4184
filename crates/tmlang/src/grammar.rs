// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Patterns, states, and the arena that owns them.
//!
//! A [`Pattern`] is a compiled regex with scope metadata attached: scopes for
//! the whole begin/end span (outer/inner), and per-capture actions that either
//! assign a scope or enter a sub-state over the capture's span. A [`State`] is
//! a node in the state graph: an ordered list of match/begin patterns plus an
//! optional end or while terminator. Both live in a [`Grammar`] arena and are
//! addressed by `u32` handles, which keeps the (cyclic) graph trivially
//! droppable and renderers free of lifetimes into individual nodes.

use crate::regex::{Regex, RegexError};

/// An interned scope identifier. `0` is "no scope".
pub type ScopeName = u32;

pub const NO_SCOPE: ScopeName = 0;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PatternId(pub(crate) u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StateId(pub(crate) u32);

pub struct Pattern {
    regex: Regex,
    capture_count: usize,
    capture_scopes: Vec<ScopeName>,
    capture_states: Vec<Option<StateId>>,
    outer_scope: ScopeName,
    inner_scope: ScopeName,
    /// For backreferencing end/while patterns: the original body with its
    /// `\N` references intact, expanded per match in the renderer.
    backref: Option<String>,
}

impl Pattern {
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn outer_scope(&self) -> ScopeName {
        self.outer_scope
    }

    pub fn inner_scope(&self) -> ScopeName {
        self.inner_scope
    }

    pub fn capture_scope(&self, group: usize) -> ScopeName {
        self.capture_scopes.get(group).copied().unwrap_or(NO_SCOPE)
    }

    pub fn capture_state(&self, group: usize) -> Option<StateId> {
        self.capture_states.get(group).copied().flatten()
    }

    pub fn is_backreferencing(&self) -> bool {
        self.backref.is_some()
    }

    pub(crate) fn backref_body(&self) -> Option<&str> {
        self.backref.as_deref()
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum StateEntry {
    Match(PatternId),
    Begin(PatternId, StateId),
}

impl StateEntry {
    pub(crate) fn pattern(self) -> PatternId {
        match self {
            StateEntry::Match(p) => p,
            StateEntry::Begin(p, _) => p,
        }
    }
}

#[derive(Default)]
pub struct State {
    pub(crate) entries: Vec<StateEntry>,
    pub(crate) end_pattern: Option<PatternId>,
    pub(crate) while_pattern: Option<PatternId>,
    /// When an end match and an inner match start at the same offset, the end
    /// wins unless this is set.
    pub(crate) apply_end_pattern_last: bool,
}

/// Arena for one compiled grammar (possibly spanning several languages).
#[derive(Default)]
pub struct Grammar {
    patterns: Vec<Pattern>,
    states: Vec<State>,
}

impl Grammar {
    pub fn new() -> Grammar {
        Grammar::default()
    }

    pub fn add_pattern(&mut self, body: &str) -> Result<PatternId, RegexError> {
        self.add_pattern_impl(body, false)
    }

    /// Like [`Grammar::add_pattern`], but `\N` (N in 0..9) refers to the
    /// capture N of a sibling begin match. The body is compile-checked once
    /// with every backreference rewritten to `\0` (a legal zero-group
    /// reference); the original bytes are kept for expansion at match time.
    pub fn add_backref_pattern(&mut self, body: &str) -> Result<PatternId, RegexError> {
        self.add_pattern_impl(body, true)
    }

    fn add_pattern_impl(&mut self, body: &str, backref: bool) -> Result<PatternId, RegexError> {
        let mut has_backref = false;
        let checked = if backref {
            let mut out = Vec::with_capacity(body.len());
            let bytes = body.as_bytes();
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'\\' && i + 1 < bytes.len() {
                    out.push(b'\\');
                    if bytes[i + 1].is_ascii_digit() {
                        has_backref = true;
                        out.push(b'0');
                    } else {
                        out.push(bytes[i + 1]);
                    }
                    i += 2;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            String::from_utf8(out).unwrap_or_default()
        } else {
            body.to_string()
        };

        let regex = Regex::new(&checked)?;
        let capture_count = regex.capture_count();
        self.patterns.push(Pattern {
            regex,
            capture_count,
            capture_scopes: vec![NO_SCOPE; capture_count],
            capture_states: vec![None; capture_count],
            outer_scope: NO_SCOPE,
            inner_scope: NO_SCOPE,
            backref: has_backref.then(|| body.to_string()),
        });
        Ok(PatternId(self.patterns.len() as u32 - 1))
    }

    /// The outer scope covers a begin/end span from begin-match start to
    /// end-match end. Only meaningful for begin patterns.
    pub fn set_outer_scope(&mut self, pattern: PatternId, scope: ScopeName) {
        self.patterns[pattern.0 as usize].outer_scope = scope;
    }

    /// The inner scope covers begin-match end to end-match start.
    pub fn set_inner_scope(&mut self, pattern: PatternId, scope: ScopeName) {
        self.patterns[pattern.0 as usize].inner_scope = scope;
    }

    /// `group_ref` is either a decimal capture index ("0" is the whole match)
    /// or a group name, which may resolve to several indices; every resolved
    /// index receives the scope.
    pub fn set_capture_scope(&mut self, pattern: PatternId, group_ref: &str, scope: ScopeName) {
        for group in self.resolve_group_ref(pattern, group_ref) {
            self.patterns[pattern.0 as usize].capture_scopes[group] = scope;
        }
    }

    /// Instead of assigning a scope, enter `state` over the capture's span
    /// and match its patterns there.
    pub fn set_capture_state(&mut self, pattern: PatternId, group_ref: &str, state: StateId) {
        for group in self.resolve_group_ref(pattern, group_ref) {
            self.patterns[pattern.0 as usize].capture_states[group] = Some(state);
        }
    }

    fn resolve_group_ref(&self, pattern: PatternId, group_ref: &str) -> Vec<usize> {
        let p = &self.patterns[pattern.0 as usize];
        if let Some(index) = parse_group_index(group_ref) {
            if index < p.capture_count {
                return vec![index];
            }
            return Vec::new();
        }
        p.regex
            .named_group_indices(group_ref)
            .into_iter()
            .filter(|&g| g < p.capture_count)
            .collect()
    }

    pub fn add_state(&mut self) -> StateId {
        self.states.push(State::default());
        StateId(self.states.len() as u32 - 1)
    }

    pub fn add_match(&mut self, state: StateId, pattern: PatternId) {
        self.states[state.0 as usize].entries.push(StateEntry::Match(pattern));
    }

    pub fn add_begin(&mut self, from: StateId, to: StateId, pattern: PatternId) {
        self.states[from.0 as usize].entries.push(StateEntry::Begin(pattern, to));
    }

    pub fn set_end(&mut self, state: StateId, pattern: PatternId, apply_last: bool) {
        let s = &mut self.states[state.0 as usize];
        s.end_pattern = Some(pattern);
        s.apply_end_pattern_last = apply_last;
    }

    pub fn set_while(&mut self, state: StateId, pattern: PatternId) {
        self.states[state.0 as usize].while_pattern = Some(pattern);
    }

    pub(crate) fn pattern(&self, id: PatternId) -> &Pattern {
        &self.patterns[id.0 as usize]
    }

    pub(crate) fn state(&self, id: StateId) -> &State {
        &self.states[id.0 as usize]
    }
}

fn parse_group_index(group_ref: &str) -> Option<usize> {
    if group_ref.is_empty() || !group_ref.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    group_ref.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_scope_by_index_and_name() {
        let mut g = Grammar::new();
        let p = g.add_pattern(r"(?<q>a)(b)(?<q>c)").unwrap();
        g.set_capture_scope(p, "0", 7);
        g.set_capture_scope(p, "q", 9);
        let pat = g.pattern(p);
        assert_eq!(pat.capture_scope(0), 7);
        assert_eq!(pat.capture_scope(1), 9);
        assert_eq!(pat.capture_scope(2), 0);
        assert_eq!(pat.capture_scope(3), 9);
    }

    #[test]
    fn out_of_range_group_ref_is_ignored() {
        let mut g = Grammar::new();
        let p = g.add_pattern("(a)").unwrap();
        g.set_capture_scope(p, "5", 3);
        g.set_capture_scope(p, "nope", 3);
        assert_eq!(g.pattern(p).capture_scope(0), 0);
        assert_eq!(g.pattern(p).capture_scope(1), 0);
    }

    #[test]
    fn backref_pattern_compile_check() {
        let mut g = Grammar::new();
        // `\1` alone would be an invalid group reference at compile time; the
        // sanity copy rewrites it to `\0` so the body still compile-checks.
        let p = g.add_backref_pattern(r"\1\)").unwrap();
        assert!(g.pattern(p).is_backreferencing());
        assert_eq!(g.pattern(p).backref_body(), Some(r"\1\)"));

        let plain = g.add_backref_pattern(r"\*/").unwrap();
        assert!(!g.pattern(plain).is_backreferencing());
    }

    #[test]
    fn escaped_backslash_is_not_a_backreference() {
        let mut g = Grammar::new();
        let p = g.add_backref_pattern(r"\\1").unwrap();
        assert!(!g.pattern(p).is_backreferencing());
    }
}
