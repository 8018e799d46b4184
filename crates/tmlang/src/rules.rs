// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The declarative grammar model, as found in `.tmLanguage.json` files.
//! See <https://macromates.com/manual/en/language_grammars> for the meaning
//! of the fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawLanguage {
    pub scope_name: String,
    /// File extensions (or exact file names, for things like makefiles).
    pub file_types: Vec<String>,
    pub patterns: Vec<RawRule>,
    pub first_line_match: String,
    pub repository: BTreeMap<String, RawRule>,
}

impl RawLanguage {
    pub fn from_json(json: &str) -> serde_json::Result<RawLanguage> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawRule {
    pub name: String,
    pub content_name: String,

    #[serde(rename = "match")]
    pub match_: String,
    pub begin: String,
    pub end: String,
    #[serde(rename = "while")]
    pub while_: String,

    pub patterns: Vec<RawRule>,
    pub repository: BTreeMap<String, RawRule>,

    pub captures: BTreeMap<String, RawCapture>,
    pub begin_captures: BTreeMap<String, RawCapture>,
    pub end_captures: BTreeMap<String, RawCapture>,
    pub while_captures: BTreeMap<String, RawCapture>,

    pub include: String,

    #[serde(deserialize_with = "flag")]
    pub disabled: bool,
    #[serde(deserialize_with = "flag")]
    pub apply_end_pattern_last: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawCapture {
    pub name: String,
    pub patterns: Vec<RawRule>,
    pub repository: BTreeMap<String, RawRule>,
}

/// Grammars in the wild write these flags as booleans or as 0/1.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_a_grammar() {
        let lang = RawLanguage::from_json(
            r##"{
                "scopeName": "source.example",
                "fileTypes": ["ex", "exi"],
                "firstLineMatch": "^#!.*example",
                "patterns": [
                    { "match": "foo", "name": "keyword.foo" },
                    { "include": "#strings" },
                    {
                        "begin": "\\(", "end": "\\)",
                        "name": "meta.parens",
                        "contentName": "meta.parens.body",
                        "applyEndPatternLast": 1,
                        "beginCaptures": { "0": { "name": "punctuation.open" } }
                    }
                ],
                "repository": {
                    "strings": { "match": "\"[^\"]*\"", "name": "string.quoted" }
                }
            }"##,
        )
        .unwrap();

        assert_eq!(lang.scope_name, "source.example");
        assert_eq!(lang.file_types, vec!["ex", "exi"]);
        assert_eq!(lang.patterns.len(), 3);
        assert_eq!(lang.patterns[0].match_, "foo");
        assert_eq!(lang.patterns[1].include, "#strings");
        assert!(lang.patterns[2].apply_end_pattern_last);
        assert_eq!(lang.patterns[2].begin_captures["0"].name, "punctuation.open");
        assert!(lang.repository.contains_key("strings"));
    }

    #[test]
    fn flags_accept_bools_and_ints() {
        let rule: RawRule =
            serde_json::from_str(r#"{ "match": "x", "disabled": true }"#).unwrap();
        assert!(rule.disabled);
        let rule: RawRule =
            serde_json::from_str(r#"{ "match": "x", "applyEndPatternLast": 0 }"#).unwrap();
        assert!(!rule.apply_end_pattern_last);
    }
}
