//! Sources of the long-term (or session) credentials used to sign relay traffic

use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use chrono::{DateTime, Utc};
use live_lambda_common::{Credentials, Result, TunnelError};

/// Anything that can hand out signing credentials on demand
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self) -> Result<Credentials>;
}

/// Fixed credentials
#[async_trait]
impl CredentialSource for Credentials {
    async fn credentials(&self) -> Result<Credentials> {
        Ok(self.clone())
    }
}

/// Credentials resolved through the AWS SDK default provider chain.
///
/// The chain caches and refreshes on its own, so every signature picks up
/// rotated session credentials.
pub struct SdkCredentials {
    provider: SharedCredentialsProvider,
}

impl SdkCredentials {
    pub fn new(provider: SharedCredentialsProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl CredentialSource for SdkCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        let resolved = self
            .provider
            .provide_credentials()
            .await
            .map_err(|e| TunnelError::Signing(format!("Failed to resolve credentials: {}", e)))?;

        let mut credentials =
            Credentials::new(resolved.access_key_id(), resolved.secret_access_key());
        if let Some(token) = resolved.session_token() {
            credentials = credentials.with_session_token(token);
        }
        if let Some(expiry) = resolved.expiry() {
            credentials = credentials.with_expiry(DateTime::<Utc>::from(expiry));
        }
        Ok(credentials)
    }
}
