use regex::Regex;
use std::sync::OnceLock;

static PATTERNS: OnceLock<Vec<(Regex, String)>> = OnceLock::new();

/// Redacts personal data and credentials from strings that leave the process
/// (log lines, user-facing sync errors).
pub struct LogSanitizer {
    patterns: Vec<(Regex, String)>,
}

impl LogSanitizer {
    pub fn new() -> Self {
        let patterns = PATTERNS.get_or_init(|| {
            let rules: [(&str, &str); 5] = [
                (
                    r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
                    "***@***.***",
                ),
                (r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]+", "$1***"),
                (r"(?i)((?:token|key|secret)=)[^&\s]+", "$1***"),
                (r"(?i)(share\s*code[:=\s]+)[A-Z0-9-]+", "$1***"),
                (
                    r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
                    "***.***.***.***",
                ),
            ];
            rules
                .iter()
                .filter_map(|(pattern, replacement)| {
                    Regex::new(pattern)
                        .ok()
                        .map(|re| (re, replacement.to_string()))
                })
                .collect()
        });

        Self {
            patterns: patterns.clone(),
        }
    }

    pub fn sanitize(&self, message: &str) -> String {
        let mut result = message.to_string();
        for (pattern, replacement) in &self.patterns {
            result = pattern.replace_all(&result, replacement.as_str()).to_string();
        }
        result
    }
}

impl Default for LogSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_redaction() {
        let sanitizer = LogSanitizer::new();
        let log = "Upload rejected for user@example.com";
        assert_eq!(sanitizer.sanitize(log), "Upload rejected for ***@***.***");
    }

    #[test]
    fn test_bearer_token_redaction() {
        let sanitizer = LogSanitizer::new();
        let log = "Unauthenticated: Bearer eyJhbGciOi.abc-def";
        assert_eq!(sanitizer.sanitize(log), "Unauthenticated: Bearer ***");
    }

    #[test]
    fn test_query_token_redaction() {
        let sanitizer = LogSanitizer::new();
        let log = "GET /v1/docs?token=abc123&page=2";
        assert_eq!(sanitizer.sanitize(log), "GET /v1/docs?token=***&page=2");
    }

    #[test]
    fn test_share_code_redaction() {
        let sanitizer = LogSanitizer::new();
        let log = "Family join failed, share code: XK4-92QZ";
        assert_eq!(
            sanitizer.sanitize(log),
            "Family join failed, share code: ***"
        );
    }

    #[test]
    fn test_ip_redaction() {
        let sanitizer = LogSanitizer::new();
        let log = "Connection to 10.0.0.12 refused";
        assert_eq!(sanitizer.sanitize(log), "Connection to ***.***.***.*** refused");
    }
}
