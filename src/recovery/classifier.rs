//! Failure classification by message signature.
//!
//! The signature table is data: an ordered list of `(pattern, ErrorType)` rules, first match
//! wins. New vendor signatures are added with [`ErrorClassifier::push_rule`] without touching
//! any control flow.

use super::ErrorType;
use regex::Regex;

/// Rejected classifier rule.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: Regex,
    error_type: ErrorType,
}

// Order matters: quota before rate limit ("quota exceeded" vs "rate limit exceeded"),
// timeouts before 5xx so "504 gateway timeout" lands on connectivity repair.
const DEFAULT_RULES: &[(&str, ErrorType)] = &[
    (
        r"(?i)\b40[13]\b|unauthori[sz]ed|forbidden|invalid[ _-]?(api[ _-]?)?key|invalid credentials|authentication|access denied|signature.*(mismatch|invalid)",
        ErrorType::Authentication,
    ),
    (
        r"(?i)quota|insufficient[ _](credits|funds|balance)|character limit|billing|plan limit",
        ErrorType::QuotaExceeded,
    ),
    (r"(?i)\b429\b|rate[ _-]?limit|too many requests|throttl", ErrorType::RateLimited),
    (
        r"(?i)\bdns\b|name resolution|could not resolve|no such host|getaddrinfo|name or service not known",
        ErrorType::DnsResolution,
    ),
    (r"(?i)timed? ?out|timeout|deadline exceeded", ErrorType::Timeout),
    (
        r"(?i)\b50[0234]\b|service unavailable|bad gateway|internal server error|temporarily unavailable|overloaded",
        ErrorType::ServiceUnavailable,
    ),
    (
        r"(?i)connection (refused|reset|closed|aborted)|network( is)? unreachable|broken pipe|unable to connect|tls handshake",
        ErrorType::Connectivity,
    ),
];

/// Ordered signature table.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<Rule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(pattern, error_type)| {
                Regex::new(pattern).ok().map(|pattern| Rule { pattern, error_type: error_type.clone() })
            })
            .collect();
        Self { rules }
    }
}

impl ErrorClassifier {
    /// A classifier with no rules; everything is [`ErrorType::Generic`].
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule. Earlier rules take precedence.
    pub fn push_rule(&mut self, pattern: &str, error_type: ErrorType) -> Result<(), ClassifierError> {
        let compiled = Regex::new(pattern).map_err(|source| ClassifierError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.rules.push(Rule { pattern: compiled, error_type });
        Ok(())
    }

    /// Insert a rule ahead of every existing one.
    pub fn prepend_rule(&mut self, pattern: &str, error_type: ErrorType) -> Result<(), ClassifierError> {
        let compiled = Regex::new(pattern).map_err(|source| ClassifierError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.rules.insert(0, Rule { pattern: compiled, error_type });
        Ok(())
    }

    pub fn with_rule(mut self, pattern: &str, error_type: ErrorType) -> Result<Self, ClassifierError> {
        self.push_rule(pattern, error_type)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn classify(&self, message: &str) -> ErrorType {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(message))
            .map(|rule| rule.error_type.clone())
            .unwrap_or(ErrorType::Generic)
    }
}
