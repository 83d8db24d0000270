//! Hashing and signing of canonicalized events.
//!
//! Per the design note that a synchronous HMAC path and an async KMS-backed
//! RSA path are "two strategies behind one signing capability, not two
//! APIs", [`Sealer::sign`] is a single async entry point; the HMAC branch
//! simply never awaits anything.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::audit::event::{AuditEvent, SigningAlgorithm};
use crate::error::{ErrorCode, Result};
use crate::security::KmsClient;
use crate::Error;

type HmacSha256 = Hmac<Sha256>;

/// Computes `hash` and (optionally) `signature` for an event, and verifies
/// both on the read path. A verification failure is always a permanent
/// [`ErrorCode::IntegrityError`] — callers must not retry it.
pub struct Sealer {
    hmac_secret: Vec<u8>,
    kms: Option<Arc<dyn KmsClient>>,
    kms_key_id: String,
}

impl Sealer {
    pub fn new(hmac_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            hmac_secret: hmac_secret.into(),
            kms: None,
            kms_key_id: String::new(),
        }
    }

    pub fn with_kms(mut self, kms: Arc<dyn KmsClient>, key_id: impl Into<String>) -> Self {
        self.kms = Some(kms);
        self.kms_key_id = key_id.into();
        self
    }

    /// SHA-256 over the event's canonical bytes, as 64 lowercase hex chars.
    pub fn hash(&self, event: &AuditEvent) -> String {
        let mut hasher = Sha256::new();
        hasher.update(event.canonical_bytes().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify_hash(&self, event: &AuditEvent) -> Result<()> {
        let expected = self.hash(event);
        match &event.hash {
            Some(actual) if constant_time_eq(actual.as_bytes(), expected.as_bytes()) => Ok(()),
            Some(_) => Err(Error::integrity("hash verification failed: event has been tampered with")),
            None => Err(Error::integrity("event has no hash to verify")),
        }
    }

    /// Signs the event's canonical bytes with `algorithm`, returning the
    /// base64 signature. HMAC-SHA256 is computed locally; the RSA variants
    /// are forwarded to the configured KMS collaborator.
    pub async fn sign(&self, event: &AuditEvent, algorithm: SigningAlgorithm) -> Result<String> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let canonical = event.canonical_bytes();

        let signature_bytes = if algorithm.is_local() {
            let mut mac = HmacSha256::new_from_slice(&self.hmac_secret)
                .map_err(|e| Error::new(ErrorCode::ConfigurationError, format!("invalid hmac secret: {}", e)))?;
            mac.update(canonical.as_bytes());
            mac.finalize().into_bytes().to_vec()
        } else {
            let kms = self
                .kms
                .as_ref()
                .ok_or_else(|| Error::new(ErrorCode::ConfigurationError, "no kms client configured for RSA signing"))?;
            kms.sign(&self.kms_key_id, canonical.as_bytes()).await?
        };

        Ok(STANDARD.encode(signature_bytes))
    }

    pub async fn verify_signature(&self, event: &AuditEvent) -> Result<()> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let (signature, algorithm) = match (&event.signature, &event.algorithm) {
            (Some(sig), Some(algo)) => (sig, *algo),
            _ => return Err(Error::integrity("event has no signature to verify")),
        };

        let signature_bytes = STANDARD
            .decode(signature)
            .map_err(|_| Error::integrity("signature is not valid base64"))?;

        if signature_bytes.len() < 32 {
            return Err(Error::integrity("signature decodes to fewer than 32 bytes"));
        }

        let canonical = event.canonical_bytes();

        let valid = if algorithm.is_local() {
            let mut mac = HmacSha256::new_from_slice(&self.hmac_secret)
                .map_err(|e| Error::new(ErrorCode::ConfigurationError, format!("invalid hmac secret: {}", e)))?;
            mac.update(canonical.as_bytes());
            mac.verify_slice(&signature_bytes).is_ok()
        } else {
            let kms = self
                .kms
                .as_ref()
                .ok_or_else(|| Error::new(ErrorCode::ConfigurationError, "no kms client configured for RSA verification"))?;
            kms.verify(&self.kms_key_id, canonical.as_bytes(), &signature_bytes).await?
        };

        if valid {
            Ok(())
        } else {
            Err(Error::integrity("signature verification failed: event has been tampered with"))
        }
    }

    /// Applies hash and/or signature generation to `event` in place,
    /// mirroring the `generateHash`/`generateSignature` producer options.
    pub async fn seal(
        &self,
        event: &mut AuditEvent,
        generate_hash: bool,
        generate_signature: bool,
        algorithm: SigningAlgorithm,
    ) -> Result<()> {
        if generate_hash {
            event.hash = Some(self.hash(event));
            event.hash_algorithm = Some("SHA-256".to_string());
        }
        if generate_signature {
            event.signature = Some(self.sign(event, algorithm).await?);
            event.algorithm = Some(algorithm);
        }
        Ok(())
    }
}

/// Avoids short-circuiting string comparison for hash verification: hashes
/// are not secret, but this keeps the comparison style consistent with the
/// signature path below it.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::EventStatus;

    fn sample_event() -> AuditEvent {
        AuditEvent::builder("auth.login.success", EventStatus::Success)
            .timestamp("2024-06-01T10:00:00.000Z".parse().unwrap())
            .principal_id("user-1")
            .organization_id("org-1")
            .build()
    }

    #[test]
    fn hash_matches_expected_sha256_of_canonical_bytes() {
        let sealer = Sealer::new("k");
        let event = sample_event();
        let hash = sealer.hash(&event);
        assert_eq!(hash.len(), 64);

        let mut hasher = Sha256::new();
        hasher.update(event.canonical_bytes().as_bytes());
        assert_eq!(hash, hex::encode(hasher.finalize()));
    }

    #[tokio::test]
    async fn hmac_signature_round_trips() {
        let sealer = Sealer::new("k");
        let mut event = sample_event();
        sealer
            .seal(&mut event, true, true, SigningAlgorithm::HmacSha256)
            .await
            .unwrap();

        assert!(sealer.verify_hash(&event).is_ok());
        assert!(sealer.verify_signature(&event).await.is_ok());
    }

    #[tokio::test]
    async fn tampering_after_seal_fails_verification() {
        let sealer = Sealer::new("k");
        let mut event = sample_event();
        sealer
            .seal(&mut event, true, true, SigningAlgorithm::HmacSha256)
            .await
            .unwrap();

        event.principal_id = Some("attacker".to_string());
        assert!(sealer.verify_hash(&event).is_err());
        assert!(sealer.verify_signature(&event).await.is_err());
    }

    #[tokio::test]
    async fn kms_signing_requires_configured_client() {
        let sealer = Sealer::new("k");
        let event = sample_event();
        let result = sealer.sign(&event, SigningAlgorithm::RsassaPssSha256).await;
        assert!(result.is_err());
    }
}
