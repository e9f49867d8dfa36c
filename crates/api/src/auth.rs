//! Merchant API key authentication
//!
//! Keys are presented in the `X-API-Key` header and stored as HMAC-SHA256
//! hex digests on the merchant row, so a database leak never exposes usable
//! keys. The digest is deterministic per secret, which makes the lookup a
//! single indexed equality query.

use hmac::{Hmac, Mac};
use recoup_recovery::RecoveryError;
use sha2::Sha256;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct ApiKeyVerifier {
    hmac_secret: String,
}

impl std::fmt::Debug for ApiKeyVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyVerifier").finish_non_exhaustive()
    }
}

impl ApiKeyVerifier {
    pub fn new(hmac_secret: impl Into<String>) -> Self {
        Self {
            hmac_secret: hmac_secret.into(),
        }
    }

    pub fn hash_key(&self, api_key: &str) -> ApiResult<String> {
        let mut mac = <Hmac<Sha256>>::new_from_slice(self.hmac_secret.as_bytes())
            .map_err(|_| RecoveryError::Config("API key HMAC secret rejected".to_string()))?;
        mac.update(api_key.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Resolve the merchant owning `api_key`, or 401.
    pub async fn merchant_for_key(&self, pool: &PgPool, api_key: &str) -> ApiResult<Uuid> {
        let hash = self.hash_key(api_key)?;
        let merchant: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM merchants WHERE api_key_hash = $1")
                .bind(&hash)
                .fetch_optional(pool)
                .await
                .map_err(RecoveryError::from)?;
        merchant.map(|(id,)| id).ok_or(ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_per_secret() {
        let verifier = ApiKeyVerifier::new("secret-a");
        assert_eq!(
            verifier.hash_key("rk_live_1").unwrap(),
            verifier.hash_key("rk_live_1").unwrap()
        );
        assert_ne!(
            verifier.hash_key("rk_live_1").unwrap(),
            verifier.hash_key("rk_live_2").unwrap()
        );
    }

    #[test]
    fn different_secrets_produce_different_hashes() {
        let a = ApiKeyVerifier::new("secret-a");
        let b = ApiKeyVerifier::new("secret-b");
        assert_ne!(
            a.hash_key("rk_live_1").unwrap(),
            b.hash_key("rk_live_1").unwrap()
        );
    }
}
