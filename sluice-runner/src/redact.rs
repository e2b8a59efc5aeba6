//! Secret redaction
//!
//! Every string that leaves a step (captured output, log entries, failure
//! reasons) passes through the stage's redactor first.

use sluice_core::domain::secret::SecretValue;
use std::fmt;
use std::sync::Mutex;

/// Replacement for redacted values
pub const MASK: &str = "***";

/// Lines of a multi-line secret shorter than this are not masked on their own
/// (a lone `}` or `---` from a kubeconfig would mask unrelated output).
const MIN_FRAGMENT_LEN: usize = 4;

/// Masks registered secret values in arbitrary text
#[derive(Default)]
pub struct Redactor {
    patterns: Mutex<Vec<String>>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolved secret for masking
    ///
    /// Multi-line values are also masked line by line so that output split
    /// across lines cannot leak a fragment.
    pub fn register(&self, value: &SecretValue) {
        let plaintext = value.expose();
        if plaintext.is_empty() {
            return;
        }

        let mut patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
        let mut push = |candidate: &str| {
            if !patterns.iter().any(|p| p == candidate) {
                patterns.push(candidate.to_string());
            }
        };

        push(plaintext);
        if plaintext.contains('\n') {
            for line in plaintext.lines().map(str::trim) {
                if line.len() >= MIN_FRAGMENT_LEN {
                    push(line);
                }
            }
        }

        // Longest first, so a secret containing another is masked whole
        patterns.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Returns `text` with every registered value replaced by [`MASK`]
    pub fn redact(&self, text: &str) -> String {
        let patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
        let mut redacted = text.to_string();
        for pattern in patterns.iter() {
            if redacted.contains(pattern.as_str()) {
                redacted = redacted.replace(pattern.as_str(), MASK);
            }
        }
        redacted
    }

    pub fn is_empty(&self) -> bool {
        self.patterns
            .lock()
            .map(|p| p.is_empty())
            .unwrap_or(true)
    }
}

impl fmt::Debug for Redactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.patterns.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("Redactor").field("patterns", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_registered_values() {
        let redactor = Redactor::new();
        redactor.register(&SecretValue::new("s3cr3t-token"));

        let out = redactor.redact("login with s3cr3t-token and s3cr3t-token again");
        assert_eq!(out, "login with *** and *** again");
    }

    #[test]
    fn test_text_without_secrets_is_untouched() {
        let redactor = Redactor::new();
        assert!(redactor.is_empty());
        assert_eq!(redactor.redact("plain output"), "plain output");
    }

    #[test]
    fn test_empty_secret_is_ignored() {
        let redactor = Redactor::new();
        redactor.register(&SecretValue::new(""));
        assert!(redactor.is_empty());
        assert_eq!(redactor.redact("abc"), "abc");
    }

    #[test]
    fn test_longest_value_wins() {
        let redactor = Redactor::new();
        redactor.register(&SecretValue::new("pass"));
        redactor.register(&SecretValue::new("password123"));

        assert_eq!(redactor.redact("password123"), "***");
    }

    #[test]
    fn test_multiline_secret_fragments_are_masked() {
        let kubeconfig = "apiVersion: v1\nclusters:\n- cluster:\n    token: abcdef123456\n}";
        let redactor = Redactor::new();
        redactor.register(&SecretValue::new(kubeconfig));

        let out = redactor.redact("line one\n    token: abcdef123456\nline three");
        assert!(!out.contains("abcdef123456"));
        assert!(out.contains("line one"));

        assert!(!redactor.redact(kubeconfig).contains("apiVersion: v1"));
        // Short fragments such as "}" are left alone
        assert_eq!(redactor.redact("{}"), "{}");
    }

    #[test]
    fn test_debug_never_prints_values() {
        let redactor = Redactor::new();
        redactor.register(&SecretValue::new("hunter2"));
        assert!(!format!("{:?}", redactor).contains("hunter2"));
    }
}
