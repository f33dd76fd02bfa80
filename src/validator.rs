//! Command admission control.
//!
//! [`CommandValidator::classify`] is the gate between untrusted input and the
//! sandbox. It is deterministic and total: every input, including empty or
//! malformed strings, produces a [`Verdict`].
//!
//! The validator does not parse shell grammar. It bans sequencing and
//! substitution outright, splits the command on `|`, and checks each segment
//! against the deny-set and the argument sanitizers in [`crate::policy`].

use crate::policy::{self, Sanitizer};
use serde::Serialize;

/// Default account inside the sandbox; its home directory bounds `chown`.
pub const DEFAULT_SANDBOX_USER: &str = "webuser";

const SEQUENCING_OPERATORS: &[&str] = &["&&", "||", ";"];
const SUBSTITUTION_MARKERS: &[&str] = &["$(", "`"];

/// Outcome of classifying one command string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_command: Option<String>,
}

impl Verdict {
    fn allow(raw: &str) -> Self {
        Self {
            allowed: true,
            reason: None,
            normalized_command: Some(raw.to_string()),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            normalized_command: None,
        }
    }
}

/// One pipe-delimited unit of a command line, split on whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    tokens: Vec<&'a str>,
}

impl<'a> Segment<'a> {
    pub fn parse(text: &'a str) -> Self {
        Self {
            tokens: text.split_whitespace().collect(),
        }
    }

    /// The base command (lead token), or `None` for a blank segment.
    pub fn base(&self) -> Option<&'a str> {
        self.tokens.first().copied()
    }

    /// Tokens after the base command.
    pub fn args(&self) -> &[&'a str] {
        self.tokens.get(1..).unwrap_or_default()
    }
}

/// Splits a command line into its pipeline segments, in order.
pub fn split_pipeline(raw: &str) -> Vec<Segment<'_>> {
    raw.split('|').map(Segment::parse).collect()
}

/// Blacklist-based command classifier.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    home_prefix: String,
}

impl CommandValidator {
    /// Validator for a sandbox whose user lives under `/home/<sandbox_user>`.
    pub fn new(sandbox_user: &str) -> Self {
        Self::with_home_prefix(format!("/home/{sandbox_user}"))
    }

    pub fn with_home_prefix(home_prefix: impl Into<String>) -> Self {
        Self {
            home_prefix: home_prefix.into(),
        }
    }

    /// Classifies `raw` as admissible or not. An allowed verdict carries the
    /// original string, unmodified, as its normalized command.
    pub fn classify(&self, raw: &str) -> Verdict {
        if raw.trim().is_empty() {
            return Verdict::reject("Empty command");
        }

        // Applies to the whole string, pipe segments included.
        if let Some(reason) = forbidden_syntax(raw) {
            return Verdict::reject(reason);
        }

        let segments = split_pipeline(raw);
        for (index, segment) in segments.iter().enumerate() {
            let Some(base) = segment.base() else {
                return Verdict::reject("Empty pipeline segment");
            };

            if let Some(category) = policy::denied_category(base) {
                return Verdict::reject(format!(
                    "Command '{base}' is not allowed ({category})"
                ));
            }

            if let Some(sanitizer) = Sanitizer::for_command(base) {
                if let Err(reason) =
                    sanitizer.check(segment, &segments[index + 1..], &self.home_prefix)
                {
                    return Verdict::reject(reason);
                }
            }
        }

        Verdict::allow(raw)
    }
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::new(DEFAULT_SANDBOX_USER)
    }
}

fn forbidden_syntax(raw: &str) -> Option<String> {
    if let Some(op) = SEQUENCING_OPERATORS.iter().find(|op| raw.contains(**op)) {
        return Some(format!("Command chaining with '{op}' is not allowed"));
    }
    if SUBSTITUTION_MARKERS.iter().any(|marker| raw.contains(*marker)) {
        return Some("Command substitution is not allowed".to_string());
    }
    None
}
