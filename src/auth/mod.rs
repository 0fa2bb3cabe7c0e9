//! Download capability tokens.
//!
//! A successful segmentation hands out a short-lived HS256 token naming its
//! session. Downloads must present a token for the same session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DownloadConfig;
use crate::session::SessionId;

const TOKEN_ISSUER: &str = "segserver";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("missing download token")]
    Missing,

    #[error("download token expired")]
    Expired,

    #[error("invalid download token: {0}")]
    Invalid(String),

    #[error("download token issued for another session")]
    WrongSession,

    #[error("failed to sign download token: {0}")]
    Signing(String),
}

/// Claims carried by a download token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadClaims {
    /// Session the token grants access to.
    pub sub: String,
    pub iss: String,
    /// Expiration time (as Unix timestamp).
    pub exp: i64,
    pub iat: i64,
}

/// Issues and verifies download tokens.
pub struct DownloadSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for DownloadSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl DownloadSigner {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Build from config, generating a per-process secret when none is set.
    pub fn from_config(config: &DownloadConfig) -> Self {
        let ttl = Duration::from_secs(config.token_ttl_secs);
        match config.token_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => Self::new(secret.as_bytes(), ttl),
            None => {
                debug!("No download token secret configured; generating one");
                let secret = hex::encode(rand::random::<[u8; 32]>());
                Self::new(secret.as_bytes(), ttl)
            }
        }
    }

    /// Mint a token for `session_id`, returning it with its expiry.
    pub fn issue(&self, session_id: &SessionId) -> Result<(String, DateTime<Utc>), TokenError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        let expires_at = now + ttl;

        let claims = DownloadClaims {
            sub: session_id.to_string(),
            iss: TOKEN_ISSUER.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };
        let token = self.sign(&claims)?;
        Ok((token, expires_at))
    }

    fn sign(&self, claims: &DownloadClaims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Check that `token` is valid and names `session_id`.
    pub fn verify(&self, token: Option<&str>, session_id: &SessionId) -> Result<(), TokenError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(TokenError::Missing)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[TOKEN_ISSUER]);

        let data = decode::<DownloadClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            warn!("Download token rejected: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            }
        })?;

        if data.claims.sub != session_id.to_string() {
            return Err(TokenError::WrongSession);
        }
        Ok(())
    }
}
