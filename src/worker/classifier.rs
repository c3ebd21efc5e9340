//! Detecting when the agent is waiting on user input.
//!
//! Kept behind a trait so the keyword heuristic can be replaced with a
//! model-based classifier without touching the worker loop.

/// Classifies agent responses as requiring user input or not.
pub trait InputClassifier: Send + Sync {
    fn needs_input(&self, response: &str) -> bool;
}

/// Case-insensitive keyword heuristic.
pub struct KeywordClassifier {
    phrases: Vec<&'static str>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self {
            phrases: vec![
                "would you like",
                "do you want",
                "should i",
                "shall i",
                "please confirm",
                "please clarify",
                "can you confirm",
                "let me know",
                "which option",
                "which approach",
                "what would you prefer",
            ],
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl InputClassifier for KeywordClassifier {
    fn needs_input(&self, response: &str) -> bool {
        let lower = response.to_lowercase();
        self.phrases
            .iter()
            .any(|phrase| contains_phrase(&lower, phrase))
    }
}

/// Substring match bounded by non-alphanumeric characters, so
/// "should i" does not fire on "should implement".
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(phrase) {
        let start = from + pos;
        let end = start + phrase.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        from = end;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_phrases_detected() {
        let classifier = KeywordClassifier::new();
        assert!(classifier.needs_input("Would you like me to also update the tests?"));
        assert!(classifier.needs_input("Please confirm before I delete the branch."));
        assert!(classifier.needs_input("Which approach do you prefer here?"));
    }

    #[test]
    fn test_detection_is_case_insensitive() {
        let classifier = KeywordClassifier::new();
        assert!(classifier.needs_input("SHOULD I proceed with the migration?"));
    }

    #[test]
    fn test_plain_answers_pass() {
        let classifier = KeywordClassifier::new();
        assert!(!classifier.needs_input("Done. The parser now handles empty input."));
        assert!(!classifier.needs_input("I refactored the module and added tests."));
    }

    #[test]
    fn test_phrases_match_on_word_boundaries() {
        let classifier = KeywordClassifier::new();
        assert!(!classifier.needs_input("Next we should implement the cache layer."));
        assert!(!classifier.needs_input("You should install the hook first."));
        assert!(classifier.needs_input("Should I implement the cache layer now?"));
        assert!(classifier.needs_input("Tell me: should i keep going"));
    }
}
