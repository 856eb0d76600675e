// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HMAC-SHA256 authenticity gate for inbound webhooks.
//!
//! The signature is the hex-encoded HMAC of the exact raw body, optionally
//! prefixed with `sha256=`. A missing signature always fails.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookConfig {
    pub secret: Option<String>,
    /// Accept unsigned requests. Meant for first-time setup only.
    pub skip_verification: bool,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature")]
    Missing,
    #[error("no webhook secret configured")]
    NoSecret,
    #[error("invalid signature")]
    Mismatch,
}

/// How a request got through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    /// Verification disabled by configuration
    Skipped,
}

/// Hex HMAC-SHA256 of `body` under `secret`.
///
/// `None` only if the MAC rejects the key, which HMAC never does.
#[must_use]
pub fn compute_signature(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    config: WebhookConfig,
}

impl WebhookVerifier {
    pub fn new(config: WebhookConfig) -> Self {
        if config.skip_verification {
            warn!("Webhook signature verification is DISABLED");
        }
        Self { config }
    }

    #[must_use]
    pub fn skips_verification(&self) -> bool {
        self.config.skip_verification
    }

    /// Check `signature` against the raw `body`.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<Verification, SignatureError> {
        if self.config.skip_verification {
            warn!(bytes = body.len(), "Accepting webhook without signature verification");
            return Ok(Verification::Skipped);
        }

        let provided = signature
            .filter(|s| !s.is_empty())
            .ok_or(SignatureError::Missing)?;
        let provided = provided.strip_prefix(SIGNATURE_PREFIX).unwrap_or(provided);

        let secret = self
            .config
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(SignatureError::NoSecret)?;
        let expected = compute_signature(secret, body).ok_or(SignatureError::NoSecret)?;

        if provided.len() != expected.len() {
            return Err(SignatureError::Mismatch);
        }
        if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(Verification::Verified)
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}
