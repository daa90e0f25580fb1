//! Simplified to traditional Chinese conversion
//!
//! The rewrite engine only needs something that maps a run of Han characters
//! to its traditional form; the dictionary-backed implementation reads the
//! tab-separated tables shipped with OpenCC (`STCharacters.txt`,
//! `STPhrases.txt`).

use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

static HAN_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x{4e00}-\x{9fa5}]+").expect("HAN_RUN: hardcoded regex is valid"));

/// Converts Chinese text between scripts
pub trait ScriptConverter: Send + Sync {
    fn convert(&self, text: &str) -> String;
}

/// Table-driven converter with longest-phrase-first matching
#[derive(Debug, Default)]
pub struct DictionaryConverter {
    phrases: HashMap<String, String>,
    max_phrase_chars: usize,
}

impl DictionaryConverter {
    /// Parse an OpenCC table: `source<TAB>target [alternatives...]` per line.
    pub fn from_table(table: &str) -> Self {
        let mut converter = Self::default();
        for line in table.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((source, targets)) = line.split_once('\t') else {
                continue;
            };
            let Some(target) = targets.split_whitespace().next() else {
                continue;
            };
            converter.insert(source, target);
        }
        converter
    }

    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let table = std::fs::read_to_string(path)?;
        Ok(Self::from_table(&table))
    }

    pub fn insert(&mut self, source: &str, target: &str) {
        self.max_phrase_chars = self.max_phrase_chars.max(source.chars().count());
        self.phrases.insert(source.to_string(), target.to_string());
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

impl ScriptConverter for DictionaryConverter {
    fn convert(&self, text: &str) -> String {
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let chars = boundaries.len() - 1;

        let mut out = String::with_capacity(text.len());
        let mut pos = 0;
        while pos < chars {
            let longest = self.max_phrase_chars.min(chars - pos);
            let matched = (1..=longest).rev().find_map(|n| {
                let candidate = &text[boundaries[pos]..boundaries[pos + n]];
                self.phrases.get(candidate).map(|target| (n, target))
            });
            match matched {
                Some((n, target)) => {
                    out.push_str(target);
                    pos += n;
                }
                None => {
                    out.push_str(&text[boundaries[pos]..boundaries[pos + 1]]);
                    pos += 1;
                }
            }
        }
        out
    }
}

/// Convert every maximal run of CJK unified ideographs in `text`.
pub fn convert_han_runs<'a>(converter: &dyn ScriptConverter, text: &'a str) -> Cow<'a, str> {
    HAN_RUN.replace_all(text, |caps: &regex::Captures<'_>| converter.convert(&caps[0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter() -> DictionaryConverter {
        DictionaryConverter::from_table("# comment\n简\t簡\n体\t體 躰\n头发\t頭髮\n头\t頭\n发\t發 髮\n")
    }

    #[test]
    fn test_from_table_skips_comments() {
        let c = converter();
        assert_eq!(c.len(), 5);
        assert!(!c.is_empty());
    }

    #[test]
    fn test_convert_uses_first_alternative() {
        assert_eq!(converter().convert("简体"), "簡體");
    }

    #[test]
    fn test_convert_prefers_longest_phrase() {
        let c = converter();
        assert_eq!(c.convert("头发"), "頭髮");
        assert_eq!(c.convert("发头"), "發頭");
    }

    #[test]
    fn test_convert_han_runs_leaves_other_text() {
        let c = converter();
        assert_eq!(convert_han_runs(&c, "abc 简体 x 头发!"), "abc 簡體 x 頭髮!");
        assert!(matches!(convert_han_runs(&c, "plain ascii"), Cow::Borrowed(_)));
    }
}
