//! Ambient structured logging. The core never initializes its own global
//! subscriber on load — [`init_tracing`] is offered as a constructor the
//! embedding binary calls once at process entry, the same pattern the
//! teacher's logging manager uses rather than hijacking global state.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing_subscriber::EnvFilter;

/// Initialize a global `tracing` subscriber reading its filter from
/// `RUST_LOG` (default: `info`), emitting newline-delimited JSON to
/// stdout. Returns an error if a subscriber is already installed.
pub fn init_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).json().with_target(true).try_init()
}

/// Redact secret-shaped substrings from `text` before it is logged:
/// `Authorization: Bearer <token>` headers, bare `Bearer <token>` mentions,
/// and `KEY=value`/`TOKEN=value`/`SECRET=value`/`PASSWORD=value` pairs. The
/// key name or header prefix is preserved; only the value is replaced.
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in patterns().iter() {
        out = pattern
            .replace_all(&out, |captures: &regex::Captures| {
                let prefix = captures.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{prefix}[REDACTED]")
            })
            .to_string();
    }
    out
}

fn patterns() -> &'static Vec<Regex> {
    static PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
        vec![
            Regex::new(r"(?i)(authorization:\s+)([^\s]+(?:\s+[^\s]+)*)").unwrap(),
            Regex::new(r"(?i)((?:^|\b)Bearer\s+)([A-Za-z0-9\-._~+/]+=*)").unwrap(),
            Regex::new(r"(?i)((?:[A-Z0-9_]*?(?:KEY|TOKEN|SECRET|PASSWORD))=)([^\s]+)").unwrap(),
        ]
    });
    &PATTERNS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_token_preserving_prefix() {
        let input = "Authorization: Bearer abc123XYZ";
        assert_eq!(redact(input), "Authorization: [REDACTED]");
    }

    #[test]
    fn redacts_key_value_secrets_preserving_key_name() {
        let input = "API_KEY=sk-live-deadbeef other=fine";
        assert_eq!(redact(input), "API_KEY=[REDACTED] other=fine");
    }

    #[test]
    fn leaves_non_secret_text_untouched() {
        let input = "connected to calc__add with 2 arguments";
        assert_eq!(redact(input), input);
    }
}
