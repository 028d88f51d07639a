//! Stateless linguistic analysis of partial transcripts.
//!
//! Scores how complete an utterance sounds so the turn detector can weigh
//! "the words look finished" against "the audio went quiet". Deliberately
//! coarse; a real parser could replace the subject/verb heuristic without
//! changing the contract.

use std::collections::HashSet;

use serde::Deserialize;

/// Words a speaker trails off on when they intend to keep going.
const DEFAULT_CONTINUATION_WORDS: &[&str] = &[
    "and", "so", "but", "um", "uh", "like", "or", "because", "then", "well", "actually",
    "basically", "you know",
];

/// Very common verb forms for the subject/verb heuristic.
const DEFAULT_COMMON_VERBS: &[&str] = &[
    "is", "are", "was", "were", "am", "be", "been", "being", "have", "has", "had", "do", "does",
    "did", "can", "could", "will", "would", "should", "shall", "may", "might", "must", "go",
    "goes", "went", "going", "get", "gets", "got", "getting", "make", "makes", "made", "making",
    "know", "knows", "knew", "knowing", "think", "thinks", "thought", "thinking", "see", "sees",
    "saw", "seeing", "want", "wants", "wanted", "wanting", "need", "needs", "needed", "needing",
];

/// Interrogative and auxiliary openers that mark a question.
const QUESTION_WORDS: &[&str] = &[
    "what", "when", "where", "who", "whom", "whose", "why", "which", "how", "is", "are", "was",
    "were", "do", "does", "did", "can", "could", "will", "would", "should", "shall", "may",
    "might", "must",
];

const TERMINAL_PUNCTUATION: [char; 3] = ['.', '?', '!'];
const TRAILING_PUNCTUATION: [char; 6] = ['.', ',', '!', '?', ';', ':'];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LanguageSettings {
    pub continuation_words: Vec<String>,
    pub common_verbs: Vec<String>,
}

impl Default for LanguageSettings {
    fn default() -> Self {
        Self {
            continuation_words: DEFAULT_CONTINUATION_WORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            common_verbs: DEFAULT_COMMON_VERBS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Result of analyzing one transcript string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinguisticAnalysis {
    /// 0–100; higher means the utterance reads as finished.
    pub completeness_score: u32,
    pub is_question: bool,
    pub is_complete: bool,
    pub word_count: usize,
    pub sentence_count: usize,
    pub ends_with_continuation: bool,
    pub ends_with_punctuation: bool,
}

impl LinguisticAnalysis {
    fn empty() -> Self {
        Self {
            completeness_score: 0,
            is_question: false,
            is_complete: false,
            word_count: 0,
            sentence_count: 0,
            ends_with_continuation: false,
            ends_with_punctuation: false,
        }
    }
}

pub struct LinguisticAnalyzer {
    continuation_words: HashSet<String>,
    common_verbs: HashSet<String>,
    question_words: HashSet<&'static str>,
}

impl Default for LinguisticAnalyzer {
    fn default() -> Self {
        Self::new(&LanguageSettings::default())
    }
}

impl LinguisticAnalyzer {
    pub fn new(settings: &LanguageSettings) -> Self {
        Self {
            continuation_words: settings
                .continuation_words
                .iter()
                .map(|w| w.to_lowercase())
                .collect(),
            common_verbs: settings
                .common_verbs
                .iter()
                .map(|w| w.to_lowercase())
                .collect(),
            question_words: QUESTION_WORDS.iter().copied().collect(),
        }
    }

    /// Score a transcript. Pure: same input, same output.
    pub fn analyze(&self, text: &str) -> LinguisticAnalysis {
        let text = text.trim();
        if text.is_empty() {
            return LinguisticAnalysis::empty();
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        let word_count = words.len();

        if word_count < 3 {
            return LinguisticAnalysis {
                completeness_score: 20,
                is_question: self.is_question(text),
                is_complete: false,
                word_count,
                sentence_count: 0,
                ends_with_continuation: false,
                ends_with_punctuation: ends_with_punctuation(text),
            };
        }

        let ends_with_punct = ends_with_punctuation(text);
        let ends_with_cont = self.ends_with_continuation(&words);
        let is_question = self.is_question(text);
        let sentence_count = count_sentences(text);
        let has_subject_verb = self.has_subject_and_verb(&words);

        let completeness_score = if ends_with_cont {
            30
        } else {
            let mut score = 0;
            if ends_with_punct {
                score += 40;
            }
            if has_subject_verb {
                score += 20;
            }
            if sentence_count >= 1 && ends_with_punct {
                score += 30;
            }
            if is_question && text.ends_with('?') {
                score += 10;
            }
            score.min(100)
        };

        LinguisticAnalysis {
            completeness_score,
            is_question,
            is_complete: completeness_score >= 70,
            word_count,
            sentence_count,
            ends_with_continuation: ends_with_cont,
            ends_with_punctuation: ends_with_punct,
        }
    }

    pub fn is_question(&self, text: &str) -> bool {
        let text = text.trim();
        if text.ends_with('?') {
            return true;
        }
        text.split_whitespace()
            .next()
            .map(|w| w.to_lowercase())
            .is_some_and(|w| self.question_words.contains(w.as_str()))
    }

    /// The configured set contains both single words and the two-word
    /// "you know", so the trailing one- and two-word forms are checked.
    fn ends_with_continuation(&self, words: &[&str]) -> bool {
        let Some(last) = words.last() else {
            return false;
        };
        let last = clean_word(last);
        if self.continuation_words.contains(&last) {
            return true;
        }
        if words.len() >= 2 {
            let phrase = format!("{} {}", clean_word(words[words.len() - 2]), last);
            return self.continuation_words.contains(&phrase);
        }
        false
    }

    fn has_subject_and_verb(&self, words: &[&str]) -> bool {
        if words.len() < 2 {
            return false;
        }
        if words
            .iter()
            .any(|w| self.common_verbs.contains(&clean_word(w)))
        {
            return true;
        }
        words.len() >= 3
    }
}

fn clean_word(word: &str) -> String {
    word.trim_end_matches(TRAILING_PUNCTUATION).to_lowercase()
}

fn ends_with_punctuation(text: &str) -> bool {
    text.trim()
        .chars()
        .next_back()
        .is_some_and(|c| TERMINAL_PUNCTUATION.contains(&c))
}

fn count_sentences(text: &str) -> usize {
    let count = text
        .chars()
        .filter(|c| TERMINAL_PUNCTUATION.contains(c))
        .count();
    if count == 0 && !text.trim().is_empty() {
        1
    } else {
        count
    }
}
