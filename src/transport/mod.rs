//! HTTP transport and credential redaction.
//!
//! Everything that leaves this module as diagnostics (URLs, body excerpts) has been
//! scrubbed of the provider credential.

pub mod http;

pub use http::HttpTransport;

/// Maximum length of an upstream body excerpt carried by errors.
pub const EXCERPT_MAX_CHARS: usize = 300;

const REDACTED: &str = "***";

/// Query parameters that carry credentials on some backends.
const SECRET_QUERY_PARAMS: &[&str] = &["key", "api_key", "apikey", "access_token"];

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Replace credential-bearing query values and any occurrence of a known secret.
pub fn redact_url(raw: &str, secrets: &[String]) -> String {
    let redacted = match url::Url::parse(raw) {
        Ok(mut parsed) => {
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| {
                    if SECRET_QUERY_PARAMS.contains(&k.to_ascii_lowercase().as_str()) {
                        (k.into_owned(), REDACTED.to_string())
                    } else {
                        (k.into_owned(), v.into_owned())
                    }
                })
                .collect();
            if pairs.is_empty() {
                parsed.set_query(None);
            } else {
                parsed.query_pairs_mut().clear().extend_pairs(pairs);
            }
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some(REDACTED));
            }
            parsed.to_string()
        }
        Err(_) => raw.to_string(),
    };
    scrub(&redacted, secrets)
}

/// Remove every known secret from `text`.
pub fn scrub(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        let secret = secret.trim();
        if secret.len() >= 4 && out.contains(secret) {
            out = out.replace(secret, REDACTED);
        }
    }
    out
}

/// Scrubbed, whitespace-collapsed body excerpt of at most [`EXCERPT_MAX_CHARS`] chars.
pub fn excerpt(body: &str, secrets: &[String]) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    let scrubbed = scrub(&collapsed, secrets);
    if scrubbed.chars().count() <= EXCERPT_MAX_CHARS {
        scrubbed
    } else {
        scrubbed.chars().take(EXCERPT_MAX_CHARS).collect()
    }
}
