//! Input circuit breakers run against raw inbound text before a turn executes.

use regex::{Regex, RegexBuilder};

use crate::config::GuardConfig;

pub const REFUSAL_TEXT: &str =
    "I can't help with that request. It matches a blocked instruction pattern.";

const BUILTIN_PATTERNS: &[&str] = &[
    r"ignore\s+(all\s+)?(the\s+)?(previous|prior|above|earlier)\s+(instructions|rules|prompts?)",
    r"disregard\s+(all\s+)?(your\s+)?(previous|prior|system)\s+(instructions|rules|prompt)",
    r"you\s+are\s+now\s+(dan|in\s+developer\s+mode|unrestricted)",
    r"pretend\s+(that\s+)?(you\s+have|there\s+are)\s+no\s+(rules|restrictions|guidelines)",
    r"(reveal|print|show)\s+(me\s+)?(your\s+)?(system\s+prompt|hidden\s+instructions)",
    r"\bjailbreak\b",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Allow,
    Refuse { reason: String },
}

impl GuardVerdict {
    #[must_use]
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Refuse { .. })
    }
}

#[derive(Debug)]
pub struct InputGuard {
    patterns: Vec<Regex>,
    max_input_chars: usize,
}

fn compile(pattern: &str) -> Option<Regex> {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "skipping invalid guard pattern");
            None
        }
    }
}

impl InputGuard {
    /// Built-in patterns followed by `config.extra_patterns`. Invalid extras
    /// are logged and skipped.
    #[must_use]
    pub fn new(config: &GuardConfig) -> Self {
        let patterns = BUILTIN_PATTERNS
            .iter()
            .copied()
            .chain(config.extra_patterns.iter().map(String::as_str))
            .filter_map(compile)
            .collect();
        Self {
            patterns,
            max_input_chars: config.max_input_chars,
        }
    }

    #[must_use]
    pub fn check(&self, text: &str) -> GuardVerdict {
        let chars = text.chars().count();
        if chars > self.max_input_chars {
            return GuardVerdict::Refuse {
                reason: format!(
                    "input of {chars} chars exceeds the {} char limit",
                    self.max_input_chars
                ),
            };
        }
        match self.patterns.iter().find(|re| re.is_match(text)) {
            Some(re) => GuardVerdict::Refuse {
                reason: format!("matched pattern `{}`", re.as_str()),
            },
            None => GuardVerdict::Allow,
        }
    }
}

impl Default for InputGuard {
    fn default() -> Self {
        Self::new(&GuardConfig::default())
    }
}
