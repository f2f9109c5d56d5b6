use std::{collections::HashSet, path::Path};

use anyhow::Context;

use crate::error::{UpliftError, UpliftResult};

const DEFAULT_BLOCKED_TERMS: &str = include_str!("../assets/blocked_terms.txt");

/// Characters replaced by spaces in the second screening pass.
const STRIPPED_PUNCTUATION: [char; 4] = ['"', '\'', ',', '.'];

/// Client-side text screen run before any job is submitted.
///
/// Terms are matched case-insensitively against whitespace-separated words; multi-word terms
/// match as contiguous phrases. A text is unsafe when either the raw text or its
/// punctuation-stripped variant contains a term.
#[derive(Debug, Clone, Default)]
pub struct SafetyScreen {
    words: HashSet<String>,
    phrases: Vec<Vec<String>>,
}

impl SafetyScreen {
    /// The term list shipped with the crate.
    pub fn bundled() -> Self {
        Self::from_list(DEFAULT_BLOCKED_TERMS)
    }

    /// Load a term list file (one term per line, `#` comments).
    ///
    /// Meant to run once at startup; a missing or unreadable file is an error.
    pub fn load(path: &Path) -> UpliftResult<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read blocked terms at {}", path.display()))
            .map_err(|e| UpliftError::config(format!("{e:#}")))?;
        let screen = Self::from_list(&text);
        if screen.is_empty() {
            tracing::warn!(path = %path.display(), "blocked term list is empty");
        }
        Ok(screen)
    }

    pub fn from_list(text: &str) -> Self {
        Self::from_terms(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        )
    }

    pub fn from_terms<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut screen = Self::default();
        for term in terms {
            let tokens = tokenize(term.as_ref());
            match tokens.len() {
                0 => {}
                1 => {
                    screen.words.extend(tokens);
                }
                _ => screen.phrases.push(tokens),
            }
        }
        screen
    }

    pub fn len(&self) -> usize {
        self.words.len() + self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_safe(&self, text: &str) -> bool {
        let stripped = text.replace(&STRIPPED_PUNCTUATION[..], " ");
        !(self.contains_term(text) || self.contains_term(&stripped))
    }

    fn contains_term(&self, text: &str) -> bool {
        let tokens = tokenize(text);
        if tokens.iter().any(|t| self.words.contains(t)) {
            return true;
        }
        self.phrases.iter().any(|phrase| {
            tokens
                .windows(phrase.len())
                .any(|window| window == phrase.as_slice())
        })
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| matches!(c, '!' | '?' | ';' | ':' | '(' | ')' | '[' | ']'))
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}
