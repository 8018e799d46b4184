// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Language registry and the scope-event driver.
//!
//! A [`Highlighter`] owns the compiled grammar for a set of languages plus
//! the lookup tables to pick one for a document: file extension first, exact
//! file name second (makefiles and friends), first-line probe last. The
//! [`ScopeWriter`] trait is how output leaves the engine: the driver walks
//! each rendered line's sorted markers and interleaves literal text with
//! begin/end scope events.

use std::collections::HashMap;
use std::io;

use crate::compile::{Compiled, CompileError, CompiledLanguage, compile};
use crate::grammar::{Grammar, ScopeName};
use crate::render::{Line, Renderer, ScopeKind, first_line_match};
use crate::rules::RawLanguage;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LanguageId(usize);

/// Receives the highlighted document as a stream of text chunks and scope
/// events. Scope events carry the caller data registered for the scope at
/// compile time.
pub trait ScopeWriter<T> {
    fn write_text(&mut self, text: &str) -> io::Result<()>;
    fn begin_scope(&mut self, data: &T) -> io::Result<()>;
    fn end_scope(&mut self, data: &T) -> io::Result<()>;
    fn new_line(&mut self) -> io::Result<()>;
}

pub struct Highlighter<T> {
    grammar: Grammar,
    languages: Vec<CompiledLanguage>,
    by_file_type: HashMap<String, usize>,
    scope_data: Vec<Option<T>>,
}

impl<T> Highlighter<T> {
    /// Compiles `languages` with scopes interned through `scope_data` (see
    /// [`compile`]). Scope names mapped to `None` disappear from all output.
    pub fn new(
        languages: &[RawLanguage],
        scope_data: impl FnMut(&str) -> Option<T>,
    ) -> Result<Highlighter<T>, CompileError> {
        let Compiled { grammar, languages, scope_data } = compile(languages, scope_data)?;
        let mut by_file_type = HashMap::new();
        for (index, lang) in languages.iter().enumerate() {
            for file_type in &lang.file_types {
                by_file_type.insert(file_type.clone(), index);
            }
        }
        Ok(Highlighter { grammar, languages, by_file_type, scope_data })
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    /// Picks a language for a document: registered extension, then exact
    /// base name, then the languages' first-line patterns in order.
    pub fn language_for(&self, file_name: &str, contents: &str) -> Option<LanguageId> {
        let base = file_name.rsplit('/').next().unwrap_or(file_name);
        let by_name = match base.rfind('.') {
            Some(dot) => self.by_file_type.get(&base[dot + 1..]),
            None => self.by_file_type.get(base),
        };
        if let Some(&index) = by_name {
            return Some(LanguageId(index));
        }
        for (index, lang) in self.languages.iter().enumerate() {
            if let Some(pattern) = lang.first_line
                && first_line_match(&self.grammar, contents, pattern)
            {
                return Some(LanguageId(index));
            }
        }
        None
    }

    pub fn scope_name_of(&self, language: LanguageId) -> &str {
        &self.languages[language.0].scope_name
    }

    /// Renders `contents` and streams it into `writer`. Documents with no
    /// recognizable language come through as plain text.
    pub fn highlight<W: ScopeWriter<T>>(
        &self,
        writer: &mut W,
        contents: &str,
        file_name: &str,
    ) -> io::Result<()> {
        let language = self.language_for(file_name, contents);
        self.highlight_as(writer, contents, language)
    }

    pub fn highlight_as<W: ScopeWriter<T>>(
        &self,
        writer: &mut W,
        contents: &str,
        language: Option<LanguageId>,
    ) -> io::Result<()> {
        let start = language.map(|l| self.languages[l.0].start_state);
        let mut renderer = Renderer::new(&self.grammar, contents, start);
        let mut line = Line::default();
        while renderer.render_next_line(&mut line) {
            let mut offset = line.begin;
            for scope in &line.scopes {
                if scope.offset > offset {
                    writer.write_text(&contents[offset..scope.offset])?;
                    offset = scope.offset;
                }
                if let Some(data) = self.scope_data(scope.name) {
                    match scope.kind {
                        ScopeKind::Begin => writer.begin_scope(data)?,
                        ScopeKind::End => writer.end_scope(data)?,
                    }
                }
            }
            if offset < line.end {
                writer.write_text(&contents[offset..line.end])?;
            }
            writer.new_line()?;
        }
        Ok(())
    }

    fn scope_data(&self, name: ScopeName) -> Option<&T> {
        self.scope_data.get(name as usize).and_then(|d| d.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Events(Vec<String>);

    impl ScopeWriter<String> for Events {
        fn write_text(&mut self, text: &str) -> io::Result<()> {
            self.0.push(format!("t:{text}"));
            Ok(())
        }
        fn begin_scope(&mut self, data: &String) -> io::Result<()> {
            self.0.push(format!("<{data}>"));
            Ok(())
        }
        fn end_scope(&mut self, data: &String) -> io::Result<()> {
            self.0.push(format!("</{data}>"));
            Ok(())
        }
        fn new_line(&mut self) -> io::Result<()> {
            self.0.push("nl".to_string());
            Ok(())
        }
    }

    fn events(highlighter: &Highlighter<String>, contents: &str, file_name: &str) -> Vec<String> {
        let mut writer = Events(Vec::new());
        highlighter.highlight(&mut writer, contents, file_name).unwrap();
        writer.0
    }

    fn toy_language() -> RawLanguage {
        RawLanguage::from_json(
            r##"{
                "scopeName": "source.toy",
                "fileTypes": ["toy"],
                "firstLineMatch": "^#!.*\\btoy\\b",
                "patterns": [
                    { "include": "#comment" },
                    { "match": "\\b(?:let|fn)\\b", "name": "keyword.toy" },
                    {
                        "begin": "\\(", "end": "\\)",
                        "name": "meta.group.toy",
                        "patterns": [ { "include": "$self" } ]
                    },
                    { "match": "\\d+", "name": "constant.numeric.toy" }
                ],
                "repository": {
                    "comment": { "match": "//.*", "name": "comment.line.toy" }
                }
            }"##,
        )
        .unwrap()
    }

    fn keep_all(name: &str) -> Option<String> {
        Some(name.to_string())
    }

    #[test]
    fn match_rules_and_repository_includes() {
        let h = Highlighter::new(&[toy_language()], keep_all).unwrap();
        assert_eq!(
            events(&h, "let x // hi", "a.toy"),
            vec![
                "<keyword.toy>",
                "t:let",
                "</keyword.toy>",
                "t: x ",
                "<comment.line.toy>",
                "t:// hi",
                "</comment.line.toy>",
                "nl",
            ]
        );
    }

    #[test]
    fn recursive_self_include_nests_groups() {
        let h = Highlighter::new(&[toy_language()], keep_all).unwrap();
        assert_eq!(
            events(&h, "(1 (2))", "a.toy"),
            vec![
                "<meta.group.toy>",
                "t:(",
                "<constant.numeric.toy>",
                "t:1",
                "</constant.numeric.toy>",
                "t: ",
                "<meta.group.toy>",
                "t:(",
                "<constant.numeric.toy>",
                "t:2",
                "</constant.numeric.toy>",
                "t:)",
                "</meta.group.toy>",
                "t:)",
                "</meta.group.toy>",
                "nl",
            ]
        );
    }

    #[test]
    fn scope_filter_drops_names() {
        let h = Highlighter::new(&[toy_language()], |name| {
            if name.starts_with("meta.") { None } else { Some(name.to_string()) }
        })
        .unwrap();
        assert_eq!(
            events(&h, "(7)", "a.toy"),
            vec![
                "t:(",
                "<constant.numeric.toy>",
                "t:7",
                "</constant.numeric.toy>",
                "t:)",
                "nl",
            ]
        );
    }

    #[test]
    fn capture_sub_grammars_defer_until_language_is_complete() {
        let lang = RawLanguage::from_json(
            r##"{
                "scopeName": "source.cap",
                "fileTypes": ["cap"],
                "patterns": [
                    {
                        "match": "(a+)(b+)",
                        "captures": {
                            "1": { "patterns": [ { "include": "#inner" } ] },
                            "2": { "name": "two" }
                        }
                    }
                ],
                "repository": {
                    "inner": { "match": "a", "name": "one" }
                }
            }"##,
        )
        .unwrap();
        let h = Highlighter::new(&[lang], keep_all).unwrap();
        assert_eq!(
            events(&h, "aab", "x.cap"),
            vec![
                "<one>", "t:a", "</one>", "<one>", "t:a", "</one>", "<two>", "t:b", "</two>",
                "nl",
            ]
        );
    }

    #[test]
    fn cross_language_include() {
        let host = RawLanguage::from_json(
            r##"{
                "scopeName": "source.host",
                "fileTypes": ["host"],
                "patterns": [ { "include": "source.guest" } ]
            }"##,
        )
        .unwrap();
        let guest = RawLanguage::from_json(
            r##"{
                "scopeName": "source.guest",
                "fileTypes": ["guest"],
                "patterns": [ { "match": "zz", "name": "guest.thing" } ]
            }"##,
        )
        .unwrap();
        let h = Highlighter::new(&[host, guest], keep_all).unwrap();
        assert_eq!(
            events(&h, "zz", "x.host"),
            vec!["<guest.thing>", "t:zz", "</guest.thing>", "nl"]
        );
    }

    #[test]
    fn duplicate_scope_names_are_rejected() {
        let a = toy_language();
        let b = toy_language();
        match Highlighter::new(&[a, b], keep_all) {
            Err(CompileError::DuplicateScopeName(name)) => assert_eq!(name, "source.toy"),
            other => panic!("expected duplicate scope error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn bad_regex_reports_the_offending_body() {
        let lang = RawLanguage::from_json(
            r##"{
                "scopeName": "source.bad",
                "patterns": [ { "match": "(unclosed", "name": "x" } ]
            }"##,
        )
        .unwrap();
        match Highlighter::new(&[lang], keep_all) {
            Err(CompileError::Regex(err)) => assert_eq!(err.pattern, "(unclosed"),
            other => panic!("expected regex error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn language_lookup_by_extension_name_and_first_line() {
        let h = Highlighter::new(&[toy_language()], keep_all).unwrap();
        let by_extension = h.language_for("dir/x.toy", "").unwrap();
        assert_eq!(h.scope_name_of(by_extension), "source.toy");
        assert!(h.language_for("x.other", "junk").is_none());
        assert!(h.language_for("script", "#!/usr/bin/env toy\n1").is_some());
        assert!(h.language_for("script", "#!/bin/sh\n1").is_none());
    }

    #[test]
    fn unknown_files_render_as_plain_text() {
        let h = Highlighter::new(&[toy_language()], keep_all).unwrap();
        assert_eq!(events(&h, "let (1)", "x.other"), vec!["t:let (1)", "nl"]);
    }

    #[test]
    fn compiling_twice_yields_identical_output() {
        let text = "let a = (1 (2)) // done";
        let a = Highlighter::new(&[toy_language()], keep_all).unwrap();
        let b = Highlighter::new(&[toy_language()], keep_all).unwrap();
        assert_eq!(events(&a, text, "a.toy"), events(&b, text, "a.toy"));
    }
}
