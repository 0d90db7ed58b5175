//! Request validation: schema check, token presence, challenge verification.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::message::ChatRequest;
use crate::providers::{SiteVerifyRequest, SiteVerifyResponse};

/// Verifies a single-use challenge token with the anti-abuse service.
///
/// Implementations answer `true` only on a positive verdict; any failure
/// (rejection, unexpected shape, unreachable service) is `false`.
#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> bool;
}

/// Production verifier: `POST {secret, response}` to the site-verify endpoint.
pub struct SiteVerifier {
    client: reqwest::Client,
    verify_url: String,
    secret: String,
}

impl SiteVerifier {
    pub fn new(client: reqwest::Client, verify_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client,
            verify_url: verify_url.into(),
            secret: secret.into(),
        }
    }

    async fn call(&self, token: &str) -> std::result::Result<SiteVerifyResponse, String> {
        let body = SiteVerifyRequest {
            secret: self.secret.clone(),
            response: token.to_string(),
        };
        let resp = self
            .client
            .post(&self.verify_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
        serde_json::from_slice::<SiteVerifyResponse>(&bytes).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ChallengeVerifier for SiteVerifier {
    async fn verify(&self, token: &str) -> bool {
        match self.call(token).await {
            Ok(resp) if resp.success => true,
            Ok(resp) => {
                warn!(error_codes = ?resp.error_codes, "challenge token rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, url = %self.verify_url, "challenge verification failed");
                false
            }
        }
    }
}

/// Parse and schema-check a raw request body.
pub fn parse_request(raw: &[u8]) -> Result<ChatRequest> {
    serde_json::from_slice::<ChatRequest>(raw).map_err(|e| {
        debug!(error = %e, "rejecting malformed chat request");
        RelayError::InvalidPayload
    })
}

/// Full validation of one turn. No retry: a failed verification is final for
/// this request and the client must acquire a fresh token.
pub async fn validate(raw: &[u8], verifier: &dyn ChallengeVerifier) -> Result<ChatRequest> {
    let request = parse_request(raw)?;
    if request.token.is_empty() {
        return Err(RelayError::MissingToken);
    }
    if !verifier.verify(&request.token).await {
        return Err(RelayError::VerificationFailed);
    }
    Ok(request)
}
