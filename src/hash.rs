//! Content-addressed cache keys.
//!
//! A key is the lowercase hex SHA-256 of a canonical rendering of the message:
//! a fixed subset of headers (names lowercased, values trimmed and
//! whitespace-collapsed, sorted by name), the body with line endings
//! normalized, and the provider/model pair that produced the analysis. Every
//! field is length-prefixed and an absent model is marked distinctly from an
//! empty one, so no two different inputs render to the same bytes. The
//! rendering contains nothing time- or randomness-dependent, so equal input
//! always yields an equal key.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Headers that participate in the hash. Everything else (dates, routing,
/// message ids) is ignored so that re-delivered copies share a key.
pub const HASHED_HEADERS: &[&str] = &["from", "to", "cc", "reply-to", "subject"];

/// Hash a message body and headers, independent of any provider.
pub fn hash_email<I, K, V>(body: &str, headers: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    digest(&canonical_headers(headers), body, None)
}

/// Cache key for an analysis of `body`/`headers` by `provider_id`/`model_id`.
pub fn cache_key<I, K, V>(
    body: &str,
    headers: I,
    provider_id: &str,
    model_id: Option<&str>,
) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    digest(
        &canonical_headers(headers),
        body,
        Some((provider_id, model_id)),
    )
}

fn canonical_headers<I, K, V>(headers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    headers
        .into_iter()
        .filter_map(|(k, v)| {
            let name = k.as_ref().trim().to_ascii_lowercase();
            if !HASHED_HEADERS.contains(&name.as_str()) {
                return None;
            }
            let value = v.as_ref().split_whitespace().collect::<Vec<_>>().join(" ");
            Some((name, value))
        })
        .collect()
}

fn normalize_body(body: &str) -> String {
    body.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn digest(
    headers: &BTreeMap<String, String>,
    body: &str,
    provider: Option<(&str, Option<&str>)>,
) -> String {
    let mut hasher = Sha256::new();
    match provider {
        Some((provider_id, model_id)) => {
            hasher.update(b"K");
            update_field(&mut hasher, provider_id.as_bytes());
            match model_id {
                Some(model) => {
                    hasher.update(b"M");
                    update_field(&mut hasher, model.as_bytes());
                }
                None => hasher.update(b"-"),
            }
        }
        None => hasher.update(b"E"),
    }
    hasher.update((headers.len() as u64).to_be_bytes());
    for (name, value) in headers {
        update_field(&mut hasher, name.as_bytes());
        update_field(&mut hasher, value.as_bytes());
    }
    update_field(&mut hasher, normalize_body(body).as_bytes());
    format!("{:x}", hasher.finalize())
}
