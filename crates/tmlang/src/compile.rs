// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Compiles declarative grammars into the pattern/state arena.
//!
//! Compilation runs in three passes over the rule trees:
//!
//! 1. every regex body becomes a [`crate::grammar::Pattern`] with its scope
//!    and capture metadata (end/while bodies compile as backreferencing),
//! 2. each rule is linked to its lexical repository chain (inner repositories
//!    shadow outer ones; this has to follow the *source* tree, because an
//!    included rule resolves `#name` in its own context, not its includer's),
//! 3. per language, a start state is built by inlining rules; a begin rule's
//!    target state is created lazily and memoized per rule, which is what
//!    makes recursive `$self`/`$base` includes terminate.
//!
//! Capture sub-grammars are deferred: the capture's state is created in pass
//! 1 but filled only after the whole language compiled, so `$self` inside a
//! capture resolves against the complete language.

use std::collections::{BTreeMap, HashMap};

use crate::grammar::{Grammar, NO_SCOPE, PatternId, ScopeName, StateId};
use crate::regex::RegexError;
use crate::rules::{RawCapture, RawLanguage, RawRule};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Regex(#[from] RegexError),
    #[error("two languages share the scope name {0}")]
    DuplicateScopeName(String),
}

/// One language's entry points into the shared arena.
pub struct CompiledLanguage {
    pub scope_name: String,
    pub file_types: Vec<String>,
    pub start_state: StateId,
    pub first_line: Option<PatternId>,
}

pub struct Compiled<T> {
    pub grammar: Grammar,
    pub languages: Vec<CompiledLanguage>,
    /// Caller data per interned scope id; index 0 is the "no scope" slot.
    pub scope_data: Vec<Option<T>>,
}

/// Compiles `languages` into one shared grammar. `scope_data` is consulted
/// once per distinct scope name: `None` interns the name to the zero scope
/// (dropping it from all output), `Some` allocates a fresh id carrying the
/// returned data.
pub fn compile<T>(
    languages: &[RawLanguage],
    scope_data: impl FnMut(&str) -> Option<T>,
) -> Result<Compiled<T>, CompileError> {
    let mut compiler = Compiler {
        languages,
        scope_data,
        by_scope_name: HashMap::new(),
        scope_ids: HashMap::new(),
        scope_data_for_id: vec![None],
        grammar: Grammar::new(),
        rule_match: HashMap::new(),
        rule_begin: HashMap::new(),
        rule_end: HashMap::new(),
        rule_while: HashMap::new(),
        rule_state: HashMap::new(),
        rule_repo: HashMap::new(),
        deferred: vec![Vec::new(); languages.len()],
    };
    compiler.run()
}

/// Rules are identified by their address within the borrowed tree; the tree
/// doesn't move for the lifetime of a compilation.
type RuleKey = *const RawRule;

fn key(rule: &RawRule) -> RuleKey {
    rule
}

/// Lexical repository scope chain, innermost last.
type RepoChain<'a> = Vec<&'a BTreeMap<String, RawRule>>;

struct Compiler<'a, T, F> {
    languages: &'a [RawLanguage],
    scope_data: F,
    by_scope_name: HashMap<&'a str, usize>,
    scope_ids: HashMap<&'a str, ScopeName>,
    scope_data_for_id: Vec<Option<T>>,
    grammar: Grammar,

    rule_match: HashMap<RuleKey, PatternId>,
    rule_begin: HashMap<RuleKey, PatternId>,
    rule_end: HashMap<RuleKey, PatternId>,
    rule_while: HashMap<RuleKey, PatternId>,
    rule_state: HashMap<RuleKey, StateId>,
    rule_repo: HashMap<RuleKey, RepoChain<'a>>,
    /// Capture states waiting for their patterns, per language.
    deferred: Vec<Vec<(StateId, &'a [RawRule])>>,
}

impl<'a, T, F: FnMut(&str) -> Option<T>> Compiler<'a, T, F> {
    fn run(mut self) -> Result<Compiled<T>, CompileError> {
        let languages = self.languages;

        let mut first_lines = Vec::with_capacity(languages.len());
        for (index, lang) in languages.iter().enumerate() {
            if self.by_scope_name.insert(&lang.scope_name, index).is_some() {
                return Err(CompileError::DuplicateScopeName(lang.scope_name.clone()));
            }
            first_lines.push(if lang.first_line_match.is_empty() {
                None
            } else {
                Some(self.grammar.add_pattern(&lang.first_line_match)?)
            });
        }

        for (index, lang) in languages.iter().enumerate() {
            for rule in lang.patterns.iter().chain(lang.repository.values()) {
                self.create_patterns(index, rule)?;
            }
        }

        for lang in languages {
            let chain: RepoChain<'a> = vec![&lang.repository];
            for rule in lang.patterns.iter().chain(lang.repository.values()) {
                self.link_repositories(rule, &chain);
            }
        }

        let mut compiled_languages = Vec::with_capacity(languages.len());
        for (index, lang) in languages.iter().enumerate() {
            let start = self.grammar.add_state();
            self.add_to_state(start, index, index, &languages[index].patterns);
            for (state, rules) in std::mem::take(&mut self.deferred[index]) {
                self.add_to_state(state, index, index, rules);
            }
            compiled_languages.push(CompiledLanguage {
                scope_name: lang.scope_name.clone(),
                file_types: lang.file_types.clone(),
                start_state: start,
                first_line: first_lines[index],
            });
        }

        Ok(Compiled {
            grammar: self.grammar,
            languages: compiled_languages,
            scope_data: self.scope_data_for_id,
        })
    }

    fn create_patterns(&mut self, lang: usize, rule: &'a RawRule) -> Result<(), CompileError> {
        if rule.disabled {
            return Ok(());
        }
        if !rule.match_.is_empty() {
            let p = self.create_pattern(
                lang,
                &rule.match_,
                &rule.name,
                "",
                "",
                &rule.captures,
                None,
                false,
            )?;
            self.rule_match.insert(key(rule), p);
        }
        if !rule.begin.is_empty() {
            let p = self.create_pattern(
                lang,
                &rule.begin,
                "",
                &rule.content_name,
                &rule.name,
                &rule.captures,
                Some(&rule.begin_captures),
                false,
            )?;
            self.rule_begin.insert(key(rule), p);
        }
        if !rule.end.is_empty() {
            let p = self.create_pattern(
                lang,
                &rule.end,
                "",
                &rule.content_name,
                &rule.name,
                &rule.captures,
                Some(&rule.end_captures),
                true,
            )?;
            self.rule_end.insert(key(rule), p);
        }
        if !rule.while_.is_empty() {
            let p = self.create_pattern(
                lang,
                &rule.while_,
                "",
                &rule.content_name,
                &rule.name,
                &rule.captures,
                Some(&rule.while_captures),
                true,
            )?;
            self.rule_while.insert(key(rule), p);
        }
        for child in rule.patterns.iter().chain(rule.repository.values()) {
            self.create_patterns(lang, child)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn create_pattern(
        &mut self,
        lang: usize,
        body: &'a str,
        name: &'a str,
        inner_name: &'a str,
        outer_name: &'a str,
        general_captures: &'a BTreeMap<String, RawCapture>,
        specific_captures: Option<&'a BTreeMap<String, RawCapture>>,
        backreferencing: bool,
    ) -> Result<PatternId, CompileError> {
        let p = if backreferencing {
            self.grammar.add_backref_pattern(body)?
        } else {
            self.grammar.add_pattern(body)?
        };
        if !name.is_empty() {
            let id = self.scope_id(name);
            self.grammar.set_capture_scope(p, "0", id);
        }
        if !inner_name.is_empty() {
            let id = self.scope_id(inner_name);
            self.grammar.set_inner_scope(p, id);
        }
        if !outer_name.is_empty() {
            let id = self.scope_id(outer_name);
            self.grammar.set_outer_scope(p, id);
        }

        // Specific (begin/end/while) capture entries override general ones.
        let mut captures: BTreeMap<&'a str, &'a RawCapture> = BTreeMap::new();
        for (k, v) in general_captures {
            captures.insert(k, v);
        }
        for (k, v) in specific_captures.into_iter().flatten() {
            captures.insert(k, v);
        }
        for (group_ref, capture) in captures {
            if !capture.name.is_empty() {
                let id = self.scope_id(&capture.name);
                self.grammar.set_capture_scope(p, group_ref, id);
            }
            if !capture.patterns.is_empty() {
                for child in &capture.patterns {
                    self.create_patterns(lang, child)?;
                }
                let state = self.grammar.add_state();
                self.grammar.set_capture_state(p, group_ref, state);
                self.deferred[lang].push((state, &capture.patterns));
            }
            for child in capture.repository.values() {
                self.create_patterns(lang, child)?;
            }
        }
        Ok(p)
    }

    fn link_repositories(&mut self, rule: &'a RawRule, outer: &RepoChain<'a>) {
        let mut chain = outer.clone();
        if !rule.repository.is_empty() {
            chain.push(&rule.repository);
        }
        self.rule_repo.insert(key(rule), chain.clone());
        for child in rule.patterns.iter().chain(rule.repository.values()) {
            self.link_repositories(child, &chain);
        }
        for capture in rule
            .captures
            .values()
            .chain(rule.begin_captures.values())
            .chain(rule.end_captures.values())
            .chain(rule.while_captures.values())
        {
            self.link_capture_repositories(capture, &chain);
        }
    }

    fn link_capture_repositories(&mut self, capture: &'a RawCapture, outer: &RepoChain<'a>) {
        let mut chain = outer.clone();
        if !capture.repository.is_empty() {
            chain.push(&capture.repository);
        }
        for child in capture.patterns.iter().chain(capture.repository.values()) {
            self.link_repositories(child, &chain);
        }
    }

    fn add_to_state(&mut self, state: StateId, lang: usize, base: usize, rules: &'a [RawRule]) {
        let languages = self.languages;
        for rule in rules {
            if rule.disabled {
                continue;
            }
            if !rule.include.is_empty() {
                let include = rule.include.as_str();
                if include == "$self" {
                    self.add_to_state(state, lang, base, &languages[lang].patterns);
                } else if include == "$base" {
                    self.add_to_state(state, base, base, &languages[base].patterns);
                } else if let Some(name) = include.strip_prefix('#') {
                    if let Some(target) = self.repo_lookup(rule, name) {
                        self.add_to_state(state, lang, base, std::slice::from_ref(target));
                    }
                } else if let Some(split) = include.find('#') {
                    let (scope, repo_key) = (&include[..split], &include[split + 1..]);
                    if let Some(&ext) = self.by_scope_name.get(scope)
                        && let Some(target) = languages[ext].repository.get(repo_key)
                    {
                        self.add_to_state(state, ext, base, std::slice::from_ref(target));
                    }
                } else if let Some(&ext) = self.by_scope_name.get(include) {
                    self.add_to_state(state, ext, base, &languages[ext].patterns);
                } else {
                    log::debug!("dropping unresolvable include {include}");
                }
            } else if let Some(&p) = self.rule_match.get(&key(rule)) {
                self.grammar.add_match(state, p);
            } else if let Some(&p) = self.rule_begin.get(&key(rule)) {
                let target = match self.rule_state.get(&key(rule)) {
                    Some(&existing) => existing,
                    None => {
                        let target = self.grammar.add_state();
                        self.rule_state.insert(key(rule), target);
                        if let Some(&wp) = self.rule_while.get(&key(rule)) {
                            self.grammar.set_while(target, wp);
                        }
                        if let Some(&ep) = self.rule_end.get(&key(rule)) {
                            self.grammar.set_end(target, ep, rule.apply_end_pattern_last);
                        }
                        // The rule may have been reached through another
                        // language's include; its own patterns still belong
                        // to the language that defines it, so base resets.
                        self.add_to_state(target, lang, lang, &rule.patterns);
                        target
                    }
                };
                self.grammar.add_begin(state, target, p);
            } else if !rule.patterns.is_empty() {
                self.add_to_state(state, lang, base, &rule.patterns);
            }
        }
    }

    /// Resolves `#name` against the rule's lexical repository chain.
    fn repo_lookup(&self, rule: &'a RawRule, name: &str) -> Option<&'a RawRule> {
        let chain = self.rule_repo.get(&key(rule))?;
        for &map in chain.iter().rev() {
            if let Some(target) = map.get(name) {
                return Some(target);
            }
        }
        None
    }

    fn scope_id(&mut self, name: &'a str) -> ScopeName {
        if let Some(&id) = self.scope_ids.get(name) {
            return id;
        }
        let id = match (self.scope_data)(name) {
            Some(data) => {
                self.scope_data_for_id.push(Some(data));
                (self.scope_data_for_id.len() - 1) as ScopeName
            }
            None => NO_SCOPE,
        };
        self.scope_ids.insert(name, id);
        id
    }
}
