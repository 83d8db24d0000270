//! KMS client capability used by [`crate::audit::seal`] for the RSA signing
//! strategy, and optionally by configuration to unwrap secrets.
//!
//! There is deliberately no bundled real KMS vendor client in this crate:
//! production deployments inject an implementation (AWS KMS, GCP KMS,
//! HashiCorp Vault transit, etc.) over the HTTP API those services expose.
//! [`HttpKmsClient`] is a thin `reqwest`-based implementation of the
//! request/response shape common to all of them; [`LocalKmsClient`] is a
//! software-only stand-in useful for development and tests.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result};
use crate::Error;

/// Capability a KMS-backed signer needs: sign an opaque payload and return
/// an opaque signature, both base64 encoded at the transport boundary.
#[async_trait]
pub trait KmsClient: Send + Sync {
    async fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>>;
    async fn verify(&self, key_id: &str, payload: &[u8], signature: &[u8]) -> Result<bool>;
}

#[derive(Serialize)]
struct SignRequest<'a> {
    key_id: &'a str,
    message: String,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    key_id: &'a str,
    message: String,
    signature: String,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
}

/// Calls an HTTP KMS endpoint that speaks the `sign`/`verify` request shape
/// above. Network failures and timeouts surface as retryable `KmsError`s;
/// auth and other 4xx responses surface as non-retryable ones, per the
/// per-cause classification the signer is expected to apply.
pub struct HttpKmsClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpKmsClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    fn classify_transport_error(err: reqwest::Error) -> Error {
        if err.is_timeout() || err.is_connect() {
            Error::kms(format!("kms request failed transiently: {}", err))
        } else {
            Error::new(ErrorCode::KmsError, format!("kms request failed: {}", err))
        }
    }
}

#[async_trait]
impl KmsClient for HttpKmsClient {
    async fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(format!("{}/sign", self.endpoint))
            .json(&SignRequest {
                key_id,
                message: STANDARD.encode(payload),
            })
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        if response.status().is_client_error() {
            return Err(Error::new(
                ErrorCode::KmsError,
                format!("kms rejected sign request: {}", response.status()),
            ));
        }
        if !response.status().is_success() {
            return Err(Error::kms(format!("kms sign request failed: {}", response.status())));
        }

        let body: SignResponse = response
            .json()
            .await
            .map_err(|e| Error::new(ErrorCode::KmsError, format!("malformed kms response: {}", e)))?;

        STANDARD
            .decode(body.signature)
            .map_err(|e| Error::new(ErrorCode::KmsError, format!("kms returned invalid base64: {}", e)))
    }

    async fn verify(&self, key_id: &str, payload: &[u8], signature: &[u8]) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/verify", self.endpoint))
            .json(&VerifyRequest {
                key_id,
                message: STANDARD.encode(payload),
                signature: STANDARD.encode(signature),
            })
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        if !response.status().is_success() {
            return Err(Error::new(ErrorCode::KmsError, format!("kms verify request failed: {}", response.status())));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| Error::new(ErrorCode::KmsError, format!("malformed kms response: {}", e)))?;

        Ok(body.valid)
    }
}

/// Software-only signer used in development and tests. Not a real KMS: the
/// "key" is an HMAC secret held in process memory.
pub struct LocalKmsClient {
    secret: Vec<u8>,
}

impl LocalKmsClient {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }
}

#[async_trait]
impl KmsClient for LocalKmsClient {
    async fn sign(&self, _key_id: &str, payload: &[u8]) -> Result<Vec<u8>> {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        type HmacSha256 = Hmac<Sha256>;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::new(ErrorCode::KmsError, format!("invalid local kms secret: {}", e)))?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    async fn verify(&self, key_id: &str, payload: &[u8], signature: &[u8]) -> Result<bool> {
        let expected = self.sign(key_id, payload).await?;
        Ok(expected == signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_kms_round_trips_signature() {
        let client = LocalKmsClient::new("test-secret");
        let signature = client.sign("key-1", b"payload").await.unwrap();
        assert!(client.verify("key-1", b"payload", &signature).await.unwrap());
        assert!(!client.verify("key-1", b"tampered", &signature).await.unwrap());
    }
}
