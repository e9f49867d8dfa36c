//! Application state

use std::sync::Arc;

use recoup_recovery::{RecoveryError, RecoveryResult, RecoveryService};
use sqlx::PgPool;

use crate::auth::ApiKeyVerifier;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub recovery: Arc<RecoveryService>,
    pub api_keys: ApiKeyVerifier,
}

impl AppState {
    pub fn from_env(pool: PgPool) -> RecoveryResult<Self> {
        let recovery = Arc::new(RecoveryService::from_env(pool.clone())?);
        let hmac_secret = std::env::var("API_KEY_HMAC_SECRET")
            .map_err(|_| RecoveryError::Config("API_KEY_HMAC_SECRET must be set".to_string()))?;
        Ok(Self {
            pool,
            recovery,
            api_keys: ApiKeyVerifier::new(hmac_secret),
        })
    }
}
