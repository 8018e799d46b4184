// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-document rendering engine.
//!
//! A [`Renderer`] walks a document line by line, keeping a stack of active
//! begin/end spans. Per line it runs two phases: first every stacked `while`
//! pattern must re-match at the line head (frames above the first failure are
//! popped), then the main loop repeatedly arbitrates between the top state's
//! pattern set and its end pattern, pushing and popping frames as spans open
//! and close. Scope markers accumulate into a [`Line`] and are sorted at the
//! end into a well-nested sequence.
//!
//! ## Gotchas
//!
//! - Spans that stay open across a line emit a Begin *and* an End marker on
//!   every line they cover, clipped to that line; the `(start_offset,
//!   end_offset, seq)` triple identifies the span across lines.
//! - `\G` must not match inside a span's body, only right after its begin
//!   match. `offset > inner_begin` decides that per search.
//! - Captures can enter a sub-state over their span. That recursion runs on
//!   the same stack with a raised base; begins left unclosed inside the
//!   capture are clipped to the capture's end.

use crate::grammar::{Grammar, NO_SCOPE, PatternId, ScopeName, StateId};
use crate::regex::{Captures, Regex};

/// Hard ceiling for the active-state stack. Pushes beyond it are dropped;
/// rendering continues without the nested span.
pub const MAX_STACK_DEPTH: usize = 256;

/// Zero-advance matches tolerated per line before the main loop aborts.
const MAX_MATCHES_WITHOUT_PROGRESS: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScopeKind {
    Begin,
    End,
}

/// One scope marker within a line.
#[derive(Clone, Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    pub name: ScopeName,
    /// Position of this marker, always within the line.
    pub offset: usize,
    /// Full extent of the originating span; may lie outside the line.
    pub start_offset: usize,
    pub end_offset: usize,
    /// Tie-breaker for sorting; identical for both ends of one span.
    pub seq: u64,
}

/// One rendered line: its byte range and sorted scope markers.
#[derive(Default)]
pub struct Line {
    pub scopes: Vec<Scope>,
    /// Line range, excluding the trailing newline.
    pub begin: usize,
    pub end: usize,
    /// Line end including the `\n`, `\r`, or `\r\n` terminator.
    pub end_including_newline: usize,
}

struct Frame {
    /// `None` only for the barrier frame of a capture sub-render; the main
    /// loop stops immediately on it.
    state: Option<StateId>,
    /// The begin pattern that pushed this frame; carries outer/inner scopes.
    pattern: Option<PatternId>,
    /// Snapshot of the begin match, kept only when the target state's end or
    /// while pattern needs it for backreference expansion.
    begin_captures: Option<Captures>,
    /// End/while regexes materialized from `begin_captures`, cached until the
    /// frame is popped.
    end_regex: Option<Regex>,
    while_regex: Option<Regex>,
    outer_begin: usize,
    outer_seq: u64,
    inner_begin: usize,
    inner_seq: u64,
}

impl Frame {
    fn barrier(state: Option<StateId>) -> Frame {
        Frame {
            state,
            pattern: None,
            begin_captures: None,
            end_regex: None,
            while_regex: None,
            outer_begin: 0,
            outer_seq: 0,
            inner_begin: 0,
            inner_seq: 0,
        }
    }
}

#[derive(Clone, Copy)]
enum CacheSlot {
    End,
    While,
}

pub struct Renderer<'a> {
    grammar: &'a Grammar,
    text: &'a str,
    offset: usize,
    stack: Vec<Frame>,
    seq: u64,
}

impl<'a> Renderer<'a> {
    /// A renderer over `text` starting in `start_state`. With `None`, lines
    /// are produced without any scopes (unknown file types render as plain
    /// text).
    pub fn new(grammar: &'a Grammar, text: &'a str, start_state: Option<StateId>) -> Renderer<'a> {
        Renderer {
            grammar,
            text,
            offset: 0,
            stack: vec![Frame::barrier(start_state)],
            seq: 0,
        }
    }

    /// Advances to the next line, filling `line` with its range and sorted
    /// scope markers. Returns false at end of input.
    pub fn render_next_line(&mut self, line: &mut Line) -> bool {
        if self.offset >= self.text.len() {
            return false;
        }
        line.scopes.clear();
        line.begin = self.offset;
        line.end = advance_to_next_line(self.text, &mut self.offset);
        line.end_including_newline = self.offset;
        let (begin, end) = (line.begin, line.end_including_newline);
        self.render_line(line, begin, end, 1);
        line.scopes.sort_by(compare_scopes);
        true
    }

    fn render_line(&mut self, line: &mut Line, begin: usize, end: usize, stack_base: usize) {
        if begin == end {
            return;
        }
        let grammar = self.grammar;
        let mut offset = begin;
        let mut max_offset = offset;

        // While-pattern descent, bottom to top. Each stacked while must
        // re-match at the line head or its frame (and everything above) goes.
        let mut i = stack_base;
        while i < self.stack.len() {
            let while_pattern = self.stack[i]
                .state
                .and_then(|s| grammar.state(s).while_pattern);
            let Some(wp) = while_pattern else {
                i += 1;
                continue;
            };
            match self.search_end_while(i, wp, CacheSlot::While, line, offset, end, true) {
                None => {
                    self.stack.truncate(i);
                    break;
                }
                Some(caps) => {
                    self.render_captures(line, wp, &caps);
                    let frame = &mut self.stack[i];
                    frame.outer_begin = caps.begin();
                    frame.inner_begin = caps.end();
                    offset = caps.end();
                    i += 1;
                }
            }
        }

        // Main match loop.
        let mut matches_without_progress = 0;
        while matches_without_progress < MAX_MATCHES_WITHOUT_PROGRESS {
            let top = self.stack.len() - 1;
            let Some(state_id) = self.stack[top].state else {
                break;
            };
            let not_begin_position = offset > self.stack[top].inner_begin;

            let end_match = match grammar.state(state_id).end_pattern {
                Some(ep) => self
                    .search_end_while(top, ep, CacheSlot::End, line, offset, end, not_begin_position)
                    .map(|caps| (ep, caps)),
                None => None,
            };
            let set_match = regset_search(grammar, state_id, self.text, line, offset, end, not_begin_position);

            enum Step {
                Inner(usize, Captures),
                End(PatternId, Captures),
                Stop,
            }
            let step = match (set_match, end_match) {
                (Some((index, m)), Some((ep, e))) => {
                    if m.begin() < e.begin()
                        || (m.begin() == e.begin()
                            && grammar.state(state_id).apply_end_pattern_last)
                    {
                        Step::Inner(index, m)
                    } else {
                        Step::End(ep, e)
                    }
                }
                (Some((index, m)), None) => Step::Inner(index, m),
                (None, Some((ep, e))) => Step::End(ep, e),
                (None, None) => Step::Stop,
            };

            match step {
                Step::Inner(index, caps) => {
                    let entry = grammar.state(state_id).entries[index];
                    self.render_captures(line, entry.pattern(), &caps);

                    if let crate::grammar::StateEntry::Begin(pattern, to) = entry {
                        if self.stack.len() == MAX_STACK_DEPTH {
                            log::warn!("state stack overflow, dropping nested span");
                        } else {
                            let to_state = grammar.state(to);
                            let needs_captures = to_state
                                .end_pattern
                                .into_iter()
                                .chain(to_state.while_pattern)
                                .any(|p| grammar.pattern(p).is_backreferencing());
                            self.stack.push(Frame {
                                state: Some(to),
                                pattern: Some(pattern),
                                begin_captures: needs_captures.then(|| caps.clone()),
                                end_regex: None,
                                while_regex: None,
                                outer_begin: caps.begin(),
                                outer_seq: self.seq,
                                inner_begin: caps.end(),
                                inner_seq: self.seq + 1,
                            });
                            self.seq += 2;
                        }
                    }
                    if caps.end() > max_offset {
                        matches_without_progress = 0;
                        max_offset = caps.end();
                    } else {
                        matches_without_progress += 1;
                    }
                    offset = caps.end();
                }
                Step::End(end_pattern, caps) => {
                    self.render_captures(line, end_pattern, &caps);
                    if self.stack.len() <= stack_base {
                        break;
                    }
                    let frame = &self.stack[self.stack.len() - 1];
                    if let Some(p) = frame.pattern {
                        let pattern = grammar.pattern(p);
                        add_scope_range(
                            line,
                            pattern.inner_scope(),
                            frame.inner_seq,
                            frame.inner_begin,
                            caps.begin(),
                        );
                        add_scope_range(
                            line,
                            pattern.outer_scope(),
                            frame.outer_seq,
                            frame.outer_begin,
                            caps.end(),
                        );
                    }
                    offset = caps.end();
                    self.stack.pop();
                }
                Step::Stop => break,
            }
        }

        // Spans still open at the line end re-emit, clipped to this line.
        for frame in &self.stack[stack_base..] {
            let Some(p) = frame.pattern else { continue };
            let pattern = grammar.pattern(p);
            add_scope_range(line, pattern.outer_scope(), frame.outer_seq, frame.outer_begin, end);
            add_scope_range(line, pattern.inner_scope(), frame.inner_seq, frame.inner_begin, end);
        }
    }

    /// Applies a match's captures to the line: scoped captures emit ranges,
    /// capture states recurse over the capture's span.
    fn render_captures(&mut self, line: &mut Line, pattern_id: PatternId, caps: &Captures) {
        let grammar = self.grammar;
        for group in 0..caps.len() {
            let Some((start, end)) = caps.pos(group) else { continue };
            let pattern = grammar.pattern(pattern_id);
            let scope = pattern.capture_scope(group);
            if scope != NO_SCOPE {
                let seq = self.seq;
                self.seq += 1;
                add_scope_range(line, scope, seq, start, end);
            } else if let Some(state) = pattern.capture_state(group) {
                if self.stack.len() == MAX_STACK_DEPTH {
                    log::warn!("state stack overflow, skipping capture state");
                    continue;
                }
                self.stack.push(Frame::barrier(Some(state)));
                let base = self.stack.len();
                self.render_line(line, start, end, base);
                self.stack.truncate(base - 1);
            }
        }
    }

    /// Search an end/while pattern for the frame at `index`, expanding and
    /// caching its backreferenced form when needed. Expansion failure (a
    /// capture that never participated, or a regex that no longer compiles)
    /// reads as "no match".
    fn search_end_while(
        &mut self,
        index: usize,
        pattern_id: PatternId,
        slot: CacheSlot,
        line: &Line,
        from: usize,
        to: usize,
        not_begin_position: bool,
    ) -> Option<Captures> {
        let grammar = self.grammar;
        let text = self.text;
        let pattern = grammar.pattern(pattern_id);
        if !pattern.is_backreferencing() {
            return line_search(pattern.regex(), text, line, from, to, not_begin_position);
        }

        let frame = &mut self.stack[index];
        let cached = match slot {
            CacheSlot::End => frame.end_regex.is_some(),
            CacheSlot::While => frame.while_regex.is_some(),
        };
        if !cached {
            let body = pattern.backref_body()?;
            let caps = frame.begin_captures.as_ref()?;
            let re = materialize_backrefs(body, caps, text)?;
            match slot {
                CacheSlot::End => frame.end_regex = Some(re),
                CacheSlot::While => frame.while_regex = Some(re),
            }
        }
        let re = match slot {
            CacheSlot::End => self.stack[index].end_regex.as_ref(),
            CacheSlot::While => self.stack[index].while_regex.as_ref(),
        }?;
        line_search(re, text, line, from, to, not_begin_position)
    }
}

/// Anchored probe of a pattern against the first line of `text` (terminator
/// included). Collaborators use this to pick a grammar for extensionless
/// files.
pub fn first_line_match(grammar: &Grammar, text: &str, pattern: PatternId) -> bool {
    let mut offset = 0;
    advance_to_next_line(text, &mut offset);
    grammar.pattern(pattern).regex().match_at(&text[..offset], 0)
}

/// Moves `offset` past the next `\n`, `\r`, or `\r\n`, returning the offset
/// of the terminator itself (or of EOF when there is none).
fn advance_to_next_line(text: &str, offset: &mut usize) -> usize {
    let bytes = text.as_bytes();
    loop {
        let before_newline = *offset;
        if *offset >= bytes.len() {
            return before_newline;
        }
        match bytes[*offset] {
            b'\n' => {
                *offset += 1;
                return before_newline;
            }
            b'\r' => {
                *offset += 1;
                if *offset < bytes.len() && bytes[*offset] == b'\n' {
                    *offset += 1;
                }
                return before_newline;
            }
            _ => *offset += 1,
        }
    }
}

/// Emits the Begin/End marker pair for one scope range, clipped to the line.
/// Empty (after clipping) and unnamed ranges are dropped.
fn add_scope_range(line: &mut Line, name: ScopeName, seq: u64, begin: usize, end: usize) {
    let clamped_begin = begin.max(line.begin);
    let clamped_end = end.min(line.end);
    if name == NO_SCOPE || clamped_begin >= clamped_end {
        return;
    }
    line.scopes.push(Scope {
        kind: ScopeKind::Begin,
        name,
        offset: clamped_begin,
        start_offset: begin,
        end_offset: end,
        seq,
    });
    line.scopes.push(Scope {
        kind: ScopeKind::End,
        name,
        offset: clamped_end,
        start_offset: begin,
        end_offset: end,
        seq,
    });
}

/// Searches a state's pattern set, returning the entry index and captures of
/// the leftmost match, with the lowest index winning ties (position-lead
/// regex-set semantics).
fn regset_search(
    grammar: &Grammar,
    state: StateId,
    text: &str,
    line: &Line,
    from: usize,
    to: usize,
    not_begin_position: bool,
) -> Option<(usize, Captures)> {
    let mut best: Option<(usize, Captures)> = None;
    for (index, entry) in grammar.state(state).entries.iter().enumerate() {
        let regex = grammar.pattern(entry.pattern()).regex();
        if let Some(caps) = line_search(regex, text, line, from, to, not_begin_position) {
            let leftmost = caps.begin() == from;
            if best.as_ref().is_none_or(|(_, b)| caps.begin() < b.begin()) {
                best = Some((index, caps));
            }
            if leftmost {
                break;
            }
        }
    }
    best
}

/// Searches within a line's window `[from, to)`. The subject string is the
/// whole line (so `^` and lookbehind behave), and results are rebased to
/// document offsets.
fn line_search(
    regex: &Regex,
    text: &str,
    line: &Line,
    from: usize,
    to: usize,
    not_begin_position: bool,
) -> Option<Captures> {
    if from > to {
        return None;
    }
    let haystack = &text[line.begin..line.end_including_newline];
    let caps = regex.search(haystack, from - line.begin, to - line.begin, not_begin_position)?;
    Some(caps.offset_by(line.begin))
}

/// Expands `\N` references in `body` with the begin match's capture N, every
/// captured byte rewritten as a three-digit octal escape so metacharacters in
/// the captured text stay literal.
fn materialize_backrefs(body: &str, begin_captures: &Captures, text: &str) -> Option<Regex> {
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() * 2);
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            if bytes[i + 1].is_ascii_digit() {
                let group = (bytes[i + 1] - b'0') as usize;
                let (start, end) = begin_captures.pos(group)?;
                for &b in text.as_bytes().get(start..end)? {
                    out.push(b'\\');
                    out.push(b'0' + ((b >> 6) & 0o7));
                    out.push(b'0' + ((b >> 3) & 0o7));
                    out.push(b'0' + (b & 0o7));
                }
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
    let pattern = String::from_utf8(out).ok()?;
    Regex::new(&pattern).ok()
}

/// The per-line marker order: by offset; End before Begin at equal offsets;
/// then Begin markers open outer spans first while End markers close inner
/// spans first, which keeps the emitted sequence well nested.
fn compare_scopes(a: &Scope, b: &Scope) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match a.offset.cmp(&b.offset) {
        Ordering::Equal => {}
        ord => return ord,
    }
    match (a.kind, b.kind) {
        (ScopeKind::End, ScopeKind::Begin) => return Ordering::Less,
        (ScopeKind::Begin, ScopeKind::End) => return Ordering::Greater,
        _ => {}
    }
    let by_span = a
        .start_offset
        .cmp(&b.start_offset)
        .then(b.end_offset.cmp(&a.end_offset))
        .then(a.seq.cmp(&b.seq));
    if a.kind == ScopeKind::Begin { by_span } else { by_span.reverse() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Grammar;

    // Scope names used by the test grammars.
    const S: ScopeName = 1;
    const C: ScopeName = 2;
    const C_BODY: ScopeName = 3;
    const T: ScopeName = 4;
    const Q: ScopeName = 5;
    const M: ScopeName = 6;

    fn render_all(grammar: &Grammar, start: StateId, text: &str) -> Vec<Vec<Scope>> {
        let mut renderer = Renderer::new(grammar, text, Some(start));
        let mut line = Line::default();
        let mut out = Vec::new();
        while renderer.render_next_line(&mut line) {
            out.push(line.scopes.clone());
        }
        out
    }

    fn marks(scopes: &[Scope]) -> Vec<(ScopeKind, ScopeName, usize)> {
        scopes.iter().map(|s| (s.kind, s.name, s.offset)).collect()
    }

    #[test]
    fn simple_match() {
        let mut g = Grammar::new();
        let start = g.add_state();
        let p = g.add_pattern("foo").unwrap();
        g.set_capture_scope(p, "0", S);
        g.add_match(start, p);

        let lines = render_all(&g, start, "foo bar foo");
        assert_eq!(lines.len(), 1);
        assert_eq!(
            marks(&lines[0]),
            vec![
                (ScopeKind::Begin, S, 0),
                (ScopeKind::End, S, 3),
                (ScopeKind::Begin, S, 8),
                (ScopeKind::End, S, 11),
            ]
        );
    }

    fn comment_grammar() -> (Grammar, StateId) {
        let mut g = Grammar::new();
        let start = g.add_state();
        let body = g.add_state();
        let begin = g.add_pattern(r"/\*").unwrap();
        g.set_outer_scope(begin, C);
        g.set_inner_scope(begin, C_BODY);
        g.add_begin(start, body, begin);
        let end = g.add_backref_pattern(r"\*/").unwrap();
        g.set_end(body, end, false);
        (g, start)
    }

    #[test]
    fn begin_end_across_lines() {
        let (g, start) = comment_grammar();
        let lines = render_all(&g, start, "/* a\nb */");
        assert_eq!(lines.len(), 2);
        assert_eq!(
            marks(&lines[0]),
            vec![
                (ScopeKind::Begin, C, 0),
                (ScopeKind::Begin, C_BODY, 2),
                (ScopeKind::End, C_BODY, 4),
                (ScopeKind::End, C, 4),
            ]
        );
        // The same spans re-open at the start of the next line and close for
        // real at the end match.
        assert_eq!(
            marks(&lines[1]),
            vec![
                (ScopeKind::Begin, C, 5),
                (ScopeKind::Begin, C_BODY, 5),
                (ScopeKind::End, C_BODY, 7),
                (ScopeKind::End, C, 9),
            ]
        );
    }

    #[test]
    fn open_span_keeps_its_seq_across_lines() {
        let (g, start) = comment_grammar();
        let lines = render_all(&g, start, "/* a\nb\nc */");
        let seq_of = |scopes: &[Scope], name: ScopeName| {
            scopes.iter().find(|s| s.name == name).map(|s| s.seq)
        };
        for name in [C, C_BODY] {
            let first = seq_of(&lines[0], name);
            assert!(first.is_some());
            assert_eq!(first, seq_of(&lines[1], name));
            assert_eq!(first, seq_of(&lines[2], name));
        }
    }

    fn tie_grammar(apply_end_pattern_last: bool) -> (Grammar, StateId) {
        let mut g = Grammar::new();
        let start = g.add_state();
        let inner = g.add_state();
        let begin = g.add_pattern("b").unwrap();
        g.set_outer_scope(begin, C);
        g.set_inner_scope(begin, C_BODY);
        g.add_begin(start, inner, begin);
        let end = g.add_backref_pattern("a").unwrap();
        g.set_end(inner, end, apply_end_pattern_last);
        let m = g.add_pattern("a").unwrap();
        g.set_capture_scope(m, "0", M);
        g.add_match(inner, m);
        (g, start)
    }

    #[test]
    fn end_wins_tie_by_default() {
        let (g, start) = tie_grammar(false);
        let lines = render_all(&g, start, "ba");
        // The end pattern consumed the "a": the span closed, and the inner
        // match rule never fired.
        assert!(lines[0].iter().all(|s| s.name != M));
        assert_eq!(
            marks(&lines[0]),
            vec![(ScopeKind::Begin, C, 0), (ScopeKind::End, C, 2)]
        );
    }

    #[test]
    fn apply_end_pattern_last_gives_inner_match_the_tie() {
        let (g, start) = tie_grammar(true);
        let lines = render_all(&g, start, "ba");
        // The inner match consumed the "a"; the span stays open to EOL. The
        // body span carries a smaller seq than the match, so it opens first.
        assert_eq!(
            marks(&lines[0]),
            vec![
                (ScopeKind::Begin, C, 0),
                (ScopeKind::Begin, C_BODY, 1),
                (ScopeKind::Begin, M, 1),
                (ScopeKind::End, M, 2),
                (ScopeKind::End, C_BODY, 2),
                (ScopeKind::End, C, 2),
            ]
        );
    }

    #[test]
    fn backreferenced_end_binds_begin_captures() {
        let mut g = Grammar::new();
        let start = g.add_state();
        let span = g.add_state();
        let begin = g.add_pattern("(`+)").unwrap();
        g.set_outer_scope(begin, C);
        g.set_inner_scope(begin, C_BODY);
        g.add_begin(start, span, begin);
        let end = g.add_backref_pattern(r"\1").unwrap();
        g.set_end(span, end, false);

        // The double backtick span must close at the next double backtick,
        // not at the single one inside it.
        let lines = render_all(&g, start, "``a`b``");
        assert_eq!(
            marks(&lines[0]),
            vec![
                (ScopeKind::Begin, C, 0),
                (ScopeKind::Begin, C_BODY, 2),
                (ScopeKind::End, C_BODY, 5),
                (ScopeKind::End, C, 7),
            ]
        );
    }

    #[test]
    fn backreference_escapes_metacharacters() {
        let mut g = Grammar::new();
        let start = g.add_state();
        let span = g.add_state();
        let begin = g.add_pattern(r"(a\.)").unwrap();
        g.set_outer_scope(begin, C);
        g.add_begin(start, span, begin);
        let end = g.add_backref_pattern(r"\1").unwrap();
        g.set_end(span, end, false);

        // The captured "a." must only match itself literally; if the dot
        // stayed a metacharacter the span would already close at "ab".
        let lines = render_all(&g, start, "a.xaby a.");
        assert_eq!(
            marks(&lines[0]),
            vec![(ScopeKind::Begin, C, 0), (ScopeKind::End, C, 9)]
        );
    }

    #[test]
    fn capture_state_runs_a_sub_grammar() {
        let mut g = Grammar::new();
        let start = g.add_state();
        let sub = g.add_state();
        let bar = g.add_pattern("bar").unwrap();
        g.set_capture_scope(bar, "0", T);
        g.add_match(sub, bar);
        let outer = g.add_pattern("(xx bar xx)").unwrap();
        g.set_capture_state(outer, "1", sub);
        g.add_match(start, outer);

        let lines = render_all(&g, start, "xx bar xx");
        assert_eq!(
            marks(&lines[0]),
            vec![(ScopeKind::Begin, T, 3), (ScopeKind::End, T, 6)]
        );
    }

    #[test]
    fn capture_state_clips_unended_begins_to_the_capture() {
        let mut g = Grammar::new();
        let start = g.add_state();
        let sub = g.add_state();
        let never = g.add_state();
        let open = g.add_pattern("<").unwrap();
        g.set_outer_scope(open, C);
        g.add_begin(sub, never, open);
        let end = g.add_backref_pattern("NEVER").unwrap();
        g.set_end(never, end, false);
        let outer = g.add_pattern("(a<b)c").unwrap();
        g.set_capture_state(outer, "1", sub);
        g.add_match(start, outer);

        // The "<" span never ends inside the capture "a<b"; it is closed at
        // the capture's end offset, not at the line's.
        let lines = render_all(&g, start, "a<bc");
        assert_eq!(
            marks(&lines[0]),
            vec![(ScopeKind::Begin, C, 1), (ScopeKind::End, C, 3)]
        );
    }

    fn quote_grammar() -> (Grammar, StateId) {
        let mut g = Grammar::new();
        let start = g.add_state();
        let quoted = g.add_state();
        let begin = g.add_pattern(">").unwrap();
        g.set_inner_scope(begin, Q);
        g.add_begin(start, quoted, begin);
        let while_ = g.add_backref_pattern("^>").unwrap();
        g.set_while(quoted, while_);
        (g, start)
    }

    #[test]
    fn while_pattern_continues_the_span() {
        let (g, start) = quote_grammar();
        let lines = render_all(&g, start, "> a\n> b\nno");
        assert_eq!(
            marks(&lines[0]),
            vec![(ScopeKind::Begin, Q, 1), (ScopeKind::End, Q, 3)]
        );
        assert_eq!(
            marks(&lines[1]),
            vec![(ScopeKind::Begin, Q, 5), (ScopeKind::End, Q, 7)]
        );
        // The third line doesn't start with ">", so the span is gone.
        assert!(lines[2].is_empty());
    }

    #[test]
    fn while_pattern_failure_pops_immediately() {
        let (g, start) = quote_grammar();
        let lines = render_all(&g, start, ">x\nplain >z");
        // The old span is gone at the head of line 2; the ">" later in the
        // line opens a fresh one, so exactly one Q pair shows up.
        assert_eq!(
            marks(&lines[1]),
            vec![(ScopeKind::Begin, Q, 10), (ScopeKind::End, Q, 11)]
        );
    }

    #[test]
    fn zero_width_matches_terminate() {
        let mut g = Grammar::new();
        let start = g.add_state();
        let p = g.add_pattern("x*").unwrap();
        g.set_capture_scope(p, "0", S);
        g.add_match(start, p);

        // "x*" happily matches empty at offset 0 forever; the no-progress
        // guard has to abort the line, and the next line still renders.
        let lines = render_all(&g, start, "abc\nxx");
        assert_eq!(lines.len(), 2);
        assert!(lines[1].iter().any(|s| s.name == S && s.offset == 4));
    }

    #[test]
    fn stack_overflow_drops_the_push() {
        let mut g = Grammar::new();
        let start = g.add_state();
        let nested = g.add_state();
        let begin = g.add_pattern(r"\(").unwrap();
        g.set_outer_scope(begin, C);
        g.add_begin(start, nested, begin);
        g.add_begin(nested, nested, begin);
        let end = g.add_backref_pattern(r"\)").unwrap();
        g.set_end(nested, end, false);

        let text = "(".repeat(MAX_STACK_DEPTH + 50);
        let lines = render_all(&g, start, &text);
        // Every marker pair balances even though pushes were dropped.
        let begins = lines[0].iter().filter(|s| s.kind == ScopeKind::Begin).count();
        let ends = lines[0].iter().filter(|s| s.kind == ScopeKind::End).count();
        assert_eq!(begins, ends);
        assert_eq!(begins, MAX_STACK_DEPTH - 1);
    }

    #[test]
    fn markers_stay_within_their_line() {
        let (g, start) = comment_grammar();
        let text = "/* a\nbb\ncc */ /* d\ne */";
        let mut renderer = Renderer::new(&g, text, Some(start));
        let mut line = Line::default();
        while renderer.render_next_line(&mut line) {
            for scope in &line.scopes {
                assert!(scope.offset >= line.begin && scope.offset <= line.end);
            }
        }
    }

    #[test]
    fn sorted_markers_are_well_nested_per_line() {
        let (g, start) = comment_grammar();
        let text = "/* a /* b */ c\nd */ after /* x */";
        for scopes in render_all(&g, start, text) {
            let mut open: Vec<ScopeName> = Vec::new();
            for scope in &scopes {
                match scope.kind {
                    ScopeKind::Begin => open.push(scope.name),
                    ScopeKind::End => assert_eq!(open.pop(), Some(scope.name)),
                }
            }
            assert!(open.is_empty());
        }
    }

    #[test]
    fn first_line_probe() {
        let mut g = Grammar::new();
        let shebang = g.add_pattern(r"^#!.*\bsh\b").unwrap();
        assert!(first_line_match(&g, "#!/bin/sh\necho hi", shebang));
        assert!(!first_line_match(&g, "echo hi\n#!/bin/sh", shebang));
    }

    #[test]
    fn crlf_and_missing_terminators() {
        let mut g = Grammar::new();
        let start = g.add_state();
        let mut renderer = Renderer::new(&g, "a\r\nb\rc", Some(start));
        let mut line = Line::default();
        let mut ranges = Vec::new();
        while renderer.render_next_line(&mut line) {
            ranges.push((line.begin, line.end, line.end_including_newline));
        }
        assert_eq!(ranges, vec![(0, 1, 3), (3, 4, 5), (5, 6, 6)]);
    }
}
