//! Text analysis used by the reference indexing chain.

use std::fmt::Debug;

use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// A token produced by an analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub position: u32,
}

/// Splits field text into indexable tokens.
pub trait Analyzer: Send + Sync + Debug {
    fn analyze(&self, text: &str) -> Vec<Token>;

    fn name(&self) -> &'static str;
}

/// NFKC-normalizes, splits on Unicode word boundaries and lowercases.
#[derive(Debug, Clone, Default)]
pub struct StandardAnalyzer;

impl StandardAnalyzer {
    pub fn new() -> Self {
        StandardAnalyzer
    }
}

impl Analyzer for StandardAnalyzer {
    fn analyze(&self, text: &str) -> Vec<Token> {
        let normalized: String = text.nfkc().collect();
        normalized
            .unicode_words()
            .enumerate()
            .map(|(position, word)| Token {
                text: word.to_lowercase(),
                position: position as u32,
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "standard"
    }
}

/// Emits the whole input as a single token.
#[derive(Debug, Clone, Default)]
pub struct KeywordAnalyzer;

impl Analyzer for KeywordAnalyzer {
    fn analyze(&self, text: &str) -> Vec<Token> {
        vec![Token {
            text: text.to_string(),
            position: 0,
        }]
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_analyzer() {
        let tokens = StandardAnalyzer::new().analyze("Hello, Wörld! ﬁne");
        let texts: Vec<_> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "wörld", "fine"]);
        assert_eq!(tokens[2].position, 2);
    }

    #[test]
    fn test_keyword_analyzer() {
        let tokens = KeywordAnalyzer.analyze("Doc-1");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].text, "Doc-1");
    }
}
