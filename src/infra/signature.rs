use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Why a webhook was refused. Safe to log: carries no payload or secret material.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRejection {
    #[error("missing signature header")]
    MissingHeader,

    #[error("malformed signature header")]
    MalformedHeader,

    #[error("timestamp outside tolerance")]
    StaleTimestamp,

    #[error("no secret matched the signature")]
    NoMatchingSecret,

    #[error("no webhook secrets configured")]
    NoSecretsConfigured,
}

/// Checks `t=<ts>,v1=<hex>` headers against an ordered list of secrets. More than one
/// secret is configured while a rotation is in progress.
#[derive(Clone)]
pub struct SignatureVerifier {
    secrets: Vec<SecretString>,
    tolerance_secs: i64,
}

struct ParsedHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<ParsedHeader<'_>, SignatureRejection> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = Some(value),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .and_then(|t| t.parse::<i64>().ok())
        .ok_or(SignatureRejection::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(SignatureRejection::MalformedHeader);
    }

    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

fn compute_signature(secret: &str, timestamp: i64, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

impl SignatureVerifier {
    pub fn new(secrets: Vec<SecretString>, tolerance_secs: i64) -> Self {
        Self {
            secrets,
            tolerance_secs,
        }
    }

    pub fn verify(
        &self,
        body: &[u8],
        header: Option<&str>,
        now_unix: i64,
    ) -> Result<(), SignatureRejection> {
        let header = header
            .filter(|h| !h.trim().is_empty())
            .ok_or(SignatureRejection::MissingHeader)?;
        if self.secrets.is_empty() {
            return Err(SignatureRejection::NoSecretsConfigured);
        }

        let parsed = parse_header(header)?;
        let skew = now_unix
            .checked_sub(parsed.timestamp)
            .and_then(i64::checked_abs);
        if skew.is_none_or(|skew| skew > self.tolerance_secs) {
            return Err(SignatureRejection::StaleTimestamp);
        }

        for secret in &self.secrets {
            let Some(expected) = compute_signature(secret.expose_secret(), parsed.timestamp, body)
            else {
                continue;
            };
            if parsed
                .signatures
                .iter()
                .any(|sig| constant_time_compare(sig, &expected))
            {
                return Ok(());
            }
        }

        Err(SignatureRejection::NoMatchingSecret)
    }
}

/// Builds a header in the format providers send. Used by tests and operator tooling.
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> String {
    let signature = compute_signature(secret, timestamp, body.as_bytes()).unwrap_or_default();
    format!("t={},v1={}", timestamp, signature)
}

pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
