//! Retry classification
//!
//! Error messages are matched against pattern sets to pick a category,
//! and each category carries its own backoff policy. Permanent errors
//! never retry regardless of remaining attempt budget.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Error categories in decreasing order of optimism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Network blips, timeouts, throttling
    Transient,
    /// Server-side trouble likely to clear
    Recoverable,
    /// Client errors; retrying cannot help
    Permanent,
    /// Unclassified; retried cautiously
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Recoverable => "recoverable",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Backoff policy for a category
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Multiplicative jitter fraction (0.2 means +-20%)
    pub jitter: f64,
}

impl RetryPolicy {
    pub const TRANSIENT: Self = Self {
        max_attempts: 5,
        base_delay_ms: 2_000,
        multiplier: 2.0,
        max_delay_ms: 30_000,
        jitter: 0.2,
    };

    pub const RECOVERABLE: Self = Self {
        max_attempts: 3,
        base_delay_ms: 5_000,
        multiplier: 3.0,
        max_delay_ms: 60_000,
        jitter: 0.2,
    };

    pub const UNKNOWN: Self = Self {
        max_attempts: 3,
        ..Self::TRANSIENT
    };

    pub fn for_category(category: ErrorCategory) -> Option<Self> {
        match category {
            ErrorCategory::Transient => Some(Self::TRANSIENT),
            ErrorCategory::Recoverable => Some(Self::RECOVERABLE),
            ErrorCategory::Unknown => Some(Self::UNKNOWN),
            ErrorCategory::Permanent => None,
        }
    }
}

/// Classification result: category plus a server-suggested delay when the
/// error implies one (429 suggests 30 s)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub suggested_delay_ms: Option<u64>,
}

/// Categorize an error message
pub fn categorize(error: &str) -> Classification {
    let message = error.to_lowercase();

    let transient_patterns = [
        "timeout",
        "timed out",
        "econnreset",
        "etimedout",
        "enotfound",
        "eai_again",
        "connection reset",
        "rate limit",
    ];
    if transient_patterns.iter().any(|p| message.contains(p)) {
        return Classification {
            category: ErrorCategory::Transient,
            suggested_delay_ms: None,
        };
    }

    if let Some(code) = first_http_code(&message) {
        return match code {
            429 => Classification {
                category: ErrorCategory::Transient,
                suggested_delay_ms: Some(30_000),
            },
            503 => Classification {
                category: ErrorCategory::Transient,
                suggested_delay_ms: None,
            },
            500..=599 => Classification {
                category: ErrorCategory::Recoverable,
                suggested_delay_ms: None,
            },
            400..=499 => Classification {
                category: ErrorCategory::Permanent,
                suggested_delay_ms: None,
            },
            _ => Classification {
                category: ErrorCategory::Unknown,
                suggested_delay_ms: None,
            },
        };
    }

    let permanent_patterns = ["unauthorized", "forbidden", "not found", "permission denied"];
    if permanent_patterns.iter().any(|p| message.contains(p)) {
        return Classification {
            category: ErrorCategory::Permanent,
            suggested_delay_ms: None,
        };
    }

    if message.contains("temporary") {
        return Classification {
            category: ErrorCategory::Recoverable,
            suggested_delay_ms: None,
        };
    }

    Classification {
        category: ErrorCategory::Unknown,
        suggested_delay_ms: None,
    }
}

/// Extract the first thing that looks like an HTTP status code
fn first_http_code(message: &str) -> Option<u16> {
    let bytes = message.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            // Standalone 3-digit runs only; version strings and ports are
            // longer or embedded in words
            let boundary_ok = (start == 0 || !bytes[start - 1].is_ascii_alphanumeric() && bytes[start - 1] != b'.')
                && (i == bytes.len() || !bytes[i].is_ascii_alphanumeric() && bytes[i] != b'.');
            if i - start == 3 && boundary_ok {
                let code: u16 = message[start..i].parse().ok()?;
                if (400..600).contains(&code) {
                    return Some(code);
                }
            }
        }
        i += 1;
    }
    None
}

/// The verdict handed back to the worker
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay_ms: u64,
    pub reason: String,
    pub next_attempt: u32,
    pub category: ErrorCategory,
}

/// Decide whether to retry after `attempt` failures
///
/// `node_max_attempts` caps the category budget when a node carries its
/// own override.
pub fn should_retry(error: &str, attempt: u32, node_max_attempts: Option<u32>) -> RetryDecision {
    let classification = categorize(error);

    let Some(policy) = RetryPolicy::for_category(classification.category) else {
        return RetryDecision {
            should_retry: false,
            delay_ms: 0,
            reason: format!("{} error, not retryable", classification.category),
            next_attempt: attempt,
            category: classification.category,
        };
    };

    let max_attempts = node_max_attempts.unwrap_or(policy.max_attempts).min(policy.max_attempts);
    if attempt >= max_attempts {
        return RetryDecision {
            should_retry: false,
            delay_ms: 0,
            reason: format!(
                "{} error, attempt budget exhausted ({}/{})",
                classification.category, attempt, max_attempts
            ),
            next_attempt: attempt,
            category: classification.category,
        };
    }

    let delay_ms = classification
        .suggested_delay_ms
        .unwrap_or_else(|| calculate_retry_delay(attempt, &policy));

    RetryDecision {
        should_retry: true,
        delay_ms,
        reason: format!(
            "{} error, retrying in {}ms (attempt {} of {})",
            classification.category,
            delay_ms,
            attempt + 1,
            max_attempts
        ),
        next_attempt: attempt + 1,
        category: classification.category,
    }
}

/// `base * multiplier^(attempt-1)` capped at `max_delay_ms`, with
/// multiplicative jitter
pub fn calculate_retry_delay(attempt: u32, policy: &RetryPolicy) -> u64 {
    let exponent = attempt.saturating_sub(1) as i32;
    let raw = policy.base_delay_ms as f64 * policy.multiplier.powi(exponent);
    let capped = raw.min(policy.max_delay_ms as f64);

    let jitter_factor = if policy.jitter > 0.0 {
        rand::rng().random_range((1.0 - policy.jitter)..=(1.0 + policy.jitter))
    } else {
        1.0
    };

    (capped * jitter_factor).round().max(0.0) as u64
}
