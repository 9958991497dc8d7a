//! Language detection for message bodies

use async_trait::async_trait;
use mailpost_common::{Error, Result};
use serde::Serialize;
use whatlang::{Detector, Lang};

/// Number of candidates requested from the detector
pub const LANGUAGE_CANDIDATES: usize = 2;

/// One ranked language candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LanguageGuess {
    /// ISO 639-3 code
    pub code: String,
    pub confidence: f64,
}

/// Statistical language guesser
#[async_trait]
pub trait LanguageDetector: Send + Sync {
    /// Return up to `limit` candidates, most confident first
    async fn detect(&self, text: &str, limit: usize) -> Result<Vec<LanguageGuess>>;
}

/// Pick the language recorded in the envelope: the top-ranked candidate, or
/// an empty string when there is none
pub fn top_language(guesses: &[LanguageGuess]) -> String {
    guesses
        .first()
        .map(|guess| guess.code.clone())
        .unwrap_or_default()
}

/// Trigram detector backed by `whatlang`
#[derive(Debug, Clone, Default)]
pub struct WhatlangDetector;

impl WhatlangDetector {
    pub fn new() -> Self {
        Self
    }

    fn rank(text: &str, limit: usize) -> Vec<LanguageGuess> {
        let mut excluded: Vec<Lang> = Vec::new();
        let mut guesses = Vec::new();

        while guesses.len() < limit {
            let detector = Detector::with_denylist(excluded.clone());
            let Some(info) = detector.detect(text) else {
                break;
            };

            excluded.push(info.lang());
            guesses.push(LanguageGuess {
                code: info.lang().code().to_string(),
                confidence: info.confidence(),
            });
        }

        guesses
    }
}

#[async_trait]
impl LanguageDetector for WhatlangDetector {
    async fn detect(&self, text: &str, limit: usize) -> Result<Vec<LanguageGuess>> {
        if limit == 0 || text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let text = text.to_string();
        tokio::task::spawn_blocking(move || Self::rank(&text, limit))
            .await
            .map_err(|e| Error::Language(format!("Detector task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_language() {
        let guesses = vec![
            LanguageGuess {
                code: "eng".to_string(),
                confidence: 0.9,
            },
            LanguageGuess {
                code: "sco".to_string(),
                confidence: 0.4,
            },
        ];
        assert_eq!(top_language(&guesses), "eng");
        assert_eq!(top_language(&guesses[1..]), "sco");
        assert_eq!(top_language(&[]), "");
    }

    #[tokio::test]
    async fn test_whatlang_ranks_candidates() {
        let detector = WhatlangDetector::new();
        let text = "The quick brown fox jumps over the lazy dog while the farmer \
                    watches from the porch and drinks his morning coffee.";

        let guesses = detector.detect(text, LANGUAGE_CANDIDATES).await.unwrap();
        assert!(!guesses.is_empty());
        assert!(guesses.len() <= LANGUAGE_CANDIDATES);
        assert_eq!(guesses[0].code, "eng");
        assert_eq!(top_language(&guesses), "eng");
    }

    #[tokio::test]
    async fn test_whatlang_empty_text() {
        let detector = WhatlangDetector::new();
        assert!(detector.detect("", 2).await.unwrap().is_empty());
        assert!(detector.detect("   \r\n", 2).await.unwrap().is_empty());
        assert!(detector
            .detect("some words here", 0)
            .await
            .unwrap()
            .is_empty());
    }
}
