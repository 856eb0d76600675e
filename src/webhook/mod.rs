// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound webhooks: signature verification and the HTTP router.

mod router;
mod verifier;

pub use router::{router, serve, ErrorResponse, WebhookBackend, WebhookError};
pub use verifier::{compute_signature, SignatureError, Verification, WebhookConfig, WebhookVerifier};
