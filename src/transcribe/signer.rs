//! # Presigned URL Construction
//!
//! Builds the signed WebSocket URL used to open a streaming transcription
//! session. The upstream endpoint authenticates connections through query
//! parameters: the request is serialized into a canonical form, signed with
//! an HMAC-SHA256 key derived from the caller's secret key, and the
//! signature is appended to the URL. The resulting URL is valid only for
//! the requested expiry window — after that many seconds from signing it is
//! rejected by the upstream verifier, so every session start signs afresh.
//!
//! ## Signing Steps:
//! 1. Percent-encode and sort the query parameters into a canonical string
//! 2. Build the canonical request (method, path, query, signed headers)
//! 3. Derive the signing key from the secret via the date/region/service
//!    HMAC chain and sign the scoped string-to-sign
//! 4. Append the signature as one more query parameter

use crate::error::RelayError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::env;

/// Signature algorithm identifier embedded in the signed URL.
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Only the host header participates in the signature for presigned URLs.
const SIGNED_HEADERS: &str = "host";

/// Maximum expiry window accepted by the upstream verifier, in seconds.
pub const MAX_EXPIRY_SECONDS: u64 = 300;

/// Canonical encode set: everything except unreserved characters
/// (`A-Z a-z 0-9 - _ . ~`) is escaped. Notably `!`, `'`, `(`, `)` and `*`
/// are escaped even though many URL encoders leave them alone — the
/// upstream verifier recomputes the signature with them escaped.
const CANONICAL_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

type HmacSha256 = Hmac<Sha256>;

/// Static credentials for one signing operation.
///
/// Credentials are read from the environment when a session starts, not at
/// process startup, so an operator can fix the environment and retry
/// without a restart.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    /// Build credentials, rejecting empty required fields.
    pub fn new(
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    ) -> Result<Self, RelayError> {
        if access_key_id.is_empty() {
            return Err(RelayError::Config(
                "AWS_ACCESS_KEY_ID is not set".to_string(),
            ));
        }
        if secret_access_key.is_empty() {
            return Err(RelayError::Config(
                "AWS_SECRET_ACCESS_KEY is not set".to_string(),
            ));
        }

        Ok(Self {
            access_key_id,
            secret_access_key,
            // An empty token means "no token", not an empty header
            session_token: session_token.filter(|t| !t.is_empty()),
        })
    }

    /// Read credentials from the standard environment variables.
    ///
    /// `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY` are required;
    /// `AWS_SESSION_TOKEN` is optional (temporary credentials only).
    pub fn from_env() -> Result<Self, RelayError> {
        Self::new(
            env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            env::var("AWS_SESSION_TOKEN").ok(),
        )
    }
}

/// Percent-encode one query-string component with the canonical set.
fn uri_encode(component: &str) -> String {
    utf8_percent_encode(component, CANONICAL_ENCODE_SET).to_string()
}

/// Serialize query parameters into the canonical query string.
///
/// Pairs are encoded first, then sorted by encoded key and, within one
/// key, by encoded value — so a multi-valued parameter expands into
/// repeated `key=value` pairs in ascending value order. The signature is
/// computed over exactly this serialization, and the final URL must use
/// it byte for byte.
pub fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    encoded.sort();

    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Derive the signing key: HMAC chain over date, region and service.
fn signing_key(secret_access_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_access_key).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Build a presigned `wss://` URL for a streaming endpoint.
///
/// `host`/`path` name the endpoint and `region`/`service` scope the
/// credential; `params` carries the request parameters (`language-code`,
/// `media-encoding`, `sample-rate`). The signature-related parameters are
/// added here. Fails with `RelayError::Signing` when the expiry window is
/// out of range. There are no retries: a failure here aborts the
/// enclosing session start.
pub fn presign(
    host: &str,
    path: &str,
    params: &[(String, String)],
    credentials: &Credentials,
    region: &str,
    service: &str,
    expiry_seconds: u64,
) -> Result<String, RelayError> {
    presign_at(
        host,
        path,
        params,
        credentials,
        region,
        service,
        expiry_seconds,
        Utc::now(),
    )
}

/// Signing with an explicit timestamp. `presign` feeds it the current
/// time; tests pin it to get deterministic output.
#[allow(clippy::too_many_arguments)]
pub fn presign_at(
    host: &str,
    path: &str,
    params: &[(String, String)],
    credentials: &Credentials,
    region: &str,
    service: &str,
    expiry_seconds: u64,
    now: DateTime<Utc>,
) -> Result<String, RelayError> {
    if expiry_seconds == 0 || expiry_seconds > MAX_EXPIRY_SECONDS {
        return Err(RelayError::Signing(format!(
            "expiry must be between 1 and {} seconds, got {}",
            MAX_EXPIRY_SECONDS, expiry_seconds
        )));
    }

    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{}/{}/{}/aws4_request", date, region, service);

    // Request parameters plus the signature metadata, all signed together
    let mut query: Vec<(String, String)> = params.to_vec();
    query.push(("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()));
    query.push((
        "X-Amz-Credential".to_string(),
        format!("{}/{}", credentials.access_key_id, scope),
    ));
    query.push(("X-Amz-Date".to_string(), amz_date.clone()));
    query.push(("X-Amz-Expires".to_string(), expiry_seconds.to_string()));
    query.push(("X-Amz-SignedHeaders".to_string(), SIGNED_HEADERS.to_string()));
    if let Some(token) = &credentials.session_token {
        query.push(("X-Amz-Security-Token".to_string(), token.clone()));
    }

    let canonical_query = canonical_query_string(&query);

    // Canonical request: method, path, query, headers, signed-header list,
    // and the hash of the (empty) payload
    let canonical_request = format!(
        "GET\n{}\n{}\nhost:{}\n\n{}\n{}",
        path,
        canonical_query,
        host,
        SIGNED_HEADERS,
        sha256_hex(b"")
    );

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(&credentials.secret_access_key, &date, region, service);
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    Ok(format!(
        "wss://{}{}?{}&X-Amz-Signature={}",
        host, path, canonical_query, signature
    ))
}
