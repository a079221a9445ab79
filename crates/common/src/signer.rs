//! AWS Signature Version 4 request signing
//!
//! The relay authenticates every handshake and every subscribe/publish
//! operation with SigV4 headers computed over an HTTP-shaped description of
//! the request. Signing is a pure function of its inputs, including the
//! signing instant.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Result, TunnelError};
use crate::protocol::Authorization;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const ACCEPT: &str = "application/json, text/javascript";
const CONTENT_ENCODING: &str = "amz-1.0";
const CONTENT_TYPE: &str = "application/json; charset=UTF-8";

type HmacSha256 = Hmac<Sha256>;

/// Account credentials used to sign requests
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &self.session_token.as_ref().map(|_| "** redacted **"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the credentials are past their expiry at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// HTTP-shaped description of the request being authorized
#[derive(Debug, Clone, Copy)]
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub body: &'a str,
    pub region: &'a str,
    pub service: &'a str,
}

/// Produce the signed header set for `request`
pub fn sign(
    request: &SigningRequest<'_>,
    credentials: &Credentials,
    now: DateTime<Utc>,
) -> Result<Authorization> {
    if credentials.access_key_id.is_empty() || credentials.secret_access_key.is_empty() {
        return Err(TunnelError::Signing("credentials are missing".to_string()));
    }
    if credentials.is_expired(now) {
        return Err(TunnelError::Signing(format!(
            "credentials for {} expired",
            credentials.access_key_id
        )));
    }
    if request.host.is_empty() || request.region.is_empty() {
        return Err(TunnelError::Signing(
            "host and region are required".to_string(),
        ));
    }

    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    // Ordered by header name, which is the canonical order
    let mut headers = Authorization::new();
    headers.insert("accept".to_string(), ACCEPT.to_string());
    headers.insert("content-encoding".to_string(), CONTENT_ENCODING.to_string());
    headers.insert("content-type".to_string(), CONTENT_TYPE.to_string());
    headers.insert("host".to_string(), request.host.to_string());
    headers.insert("x-amz-date".to_string(), amz_date.clone());
    if let Some(token) = &credentials.session_token {
        headers.insert("x-amz-security-token".to_string(), token.clone());
    }

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
    let payload_hash = hex::encode(Sha256::digest(request.body.as_bytes()));

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method.to_ascii_uppercase(),
        canonical_uri(request.path),
        "",
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, request.region, request.service
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        credential_scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", credentials.secret_access_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, request.region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, request.service.as_bytes())?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    headers.insert(
        "authorization".to_string(),
        format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, credentials.access_key_id, credential_scope, signed_headers, signature
        ),
    );

    Ok(headers)
}

fn canonical_uri(path: &str) -> &str {
    if path.is_empty() { "/" } else { path }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| TunnelError::Signing(format!("HMAC key error: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
