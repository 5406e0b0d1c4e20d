//! PII scrubbing for knowledge-base retrieval results.
//!
//! Knowledge chunks come from reference material (case studies, handbooks)
//! that can carry identifying strings.  Every knowledge hit passes through
//! here before entering any shared context.

use regex::Regex;
use tracing::debug;

/// A single scrub rule: a named pattern plus a redaction shape.
#[derive(Debug, Clone)]
pub struct SanitizerRule {
    pub name: &'static str,
    pub pattern: &'static str,
}

struct CompiledRule {
    name: &'static str,
    pattern: Regex,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SanitizeOutcome {
    pub text: String,
    pub redactions: usize,
}

pub struct Sanitizer {
    rules: Vec<CompiledRule>,
}

/// Identifying-string patterns scrubbed from knowledge-base hits.
const DEFAULT_RULES: &[SanitizerRule] = &[
    SanitizerRule {
        name: "email",
        pattern: r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
    },
    SanitizerRule {
        name: "ssn",
        pattern: r"\b\d{3}-\d{2}-\d{4}\b",
    },
    SanitizerRule {
        name: "credit_card",
        pattern: r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b",
    },
    SanitizerRule {
        name: "phone",
        pattern: r"\b\(?\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b",
    },
    SanitizerRule {
        name: "honorific_name",
        pattern: r"\b(?:Mr|Mrs|Ms|Dr|Prof)\.?\s+[A-Z][a-z]+\b",
    },
];

impl Sanitizer {
    pub fn with_default_rules() -> Self {
        // The default patterns are compile-time constants; a failure here is a
        // programming error caught by the rule tests below.
        Self::new(DEFAULT_RULES).expect("default sanitizer rules are valid")
    }

    pub fn new(rules: &[SanitizerRule]) -> Result<Self, regex::Error> {
        let compiled = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    name: rule.name,
                    pattern: Regex::new(rule.pattern)?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules: compiled })
    }

    /// Replace every identifying match with its redaction shape.  Overlapping
    /// matches collapse into the first rule's redaction.
    pub fn sanitize(&self, text: &str) -> SanitizeOutcome {
        let mut matches: Vec<(usize, usize, String)> = Vec::new();
        for rule in &self.rules {
            for m in rule.pattern.find_iter(text) {
                let overlaps = matches
                    .iter()
                    .any(|(start, end, _)| m.start() < *end && *start < m.end());
                if !overlaps {
                    matches.push((m.start(), m.end(), redact(m.as_str(), rule.name)));
                }
            }
        }

        let redactions = matches.len();
        // Replace back-to-front so earlier spans stay valid.
        matches.sort_by(|a, b| b.0.cmp(&a.0));
        let mut result = text.to_string();
        for (start, end, replacement) in matches {
            result.replace_range(start..end, &replacement);
        }

        if redactions > 0 {
            debug!(redactions, "sanitized knowledge-base text");
        }
        SanitizeOutcome {
            text: result,
            redactions,
        }
    }

    pub fn contains_pii(&self, text: &str) -> bool {
        self.rules.iter().any(|rule| rule.pattern.is_match(text))
    }
}

/// Shape-preserving redaction keyed by rule name, so scrubbed text still
/// reads naturally in a prompt.
fn redact(text: &str, rule_name: &str) -> String {
    let len = text.len();
    match rule_name {
        "credit_card" => {
            if len >= 4 {
                format!("****-****-****-{}", &text[len - 4..])
            } else {
                "[REDACTED]".to_string()
            }
        }
        "ssn" => "***-**-****".to_string(),
        "email" => match text.find('@') {
            Some(at_pos) => format!("****{}", &text[at_pos..]),
            None => "[REDACTED]".to_string(),
        },
        "phone" => {
            if len >= 4 {
                format!("***-***-{}", &text[len - 4..])
            } else {
                "[REDACTED]".to_string()
            }
        }
        "honorific_name" => "[NAME]".to_string(),
        _ => "[REDACTED]".to_string(),
    }
}
