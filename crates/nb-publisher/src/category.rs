//! Broker error categorization
//!
//! Stringly classification of broker/transport failures for metrics and
//! log tagging. Substring matching is the only portable option across
//! broker client versions; it never drives control flow.

/// Category tag attached to publish failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    Channel,
    Timeout,
    Encoding,
    Config,
    Unknown,
}

/// Ordered matcher table, first match wins. The precedence is
/// load-bearing: "connection timeout" classifies as `Connection`, not
/// `Timeout`, because connection loss dominates.
pub const CATEGORY_MATCHERS: &[(&[&str], ErrorCategory)] = &[
    (
        &["connection", "socket", "network", "broken"],
        ErrorCategory::Connection,
    ),
    (&["channel"], ErrorCategory::Channel),
    (&["timeout", "timed out"], ErrorCategory::Timeout),
    (
        &["encode", "serialize", "malformed json"],
        ErrorCategory::Encoding,
    ),
    (
        &["exchange", "routing key", "config"],
        ErrorCategory::Config,
    ),
];

impl ErrorCategory {
    /// Classify an error message, case-insensitively.
    pub fn of(message: &str) -> Self {
        let lower = message.to_lowercase();
        for (patterns, category) in CATEGORY_MATCHERS {
            if patterns.iter().any(|pattern| lower.contains(pattern)) {
                return *category;
            }
        }
        ErrorCategory::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Connection => "connection-error",
            ErrorCategory::Channel => "channel-error",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Encoding => "encoding-error",
            ErrorCategory::Config => "config-error",
            ErrorCategory::Unknown => "unknown",
        }
    }
}
