//! Per-user settings: credential resolution for runs, plus the read/write
//! surface used by settings screens.

use std::sync::Arc;

use basket_adapters::SourceCredentials;
use basket_core::{NotificationPreference, NotificationThreshold, SettingsPatch, UserId};
use basket_storage::{SettingsStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::cipher::{CipherError, CredentialCipher};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Settings not found for user {0}.")]
    NotFound(UserId),
    #[error("Amazon credentials are not fully configured.")]
    Incomplete,
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Settings as shown back to the user. Secrets are never echoed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SettingsView {
    pub is_configured: bool,
    pub source_email: Option<String>,
    pub has_otp_secret: bool,
    pub enable_scheduled_ingestion: bool,
    pub job_webhook_url: Option<String>,
    pub job_notification_preference: NotificationPreference,
    pub price_webhook_url: Option<String>,
    pub default_threshold: Option<NotificationThreshold>,
}

/// Settings update as submitted, password still in plaintext.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SettingsInput {
    pub source_email: Option<String>,
    pub source_password: Option<String>,
    pub source_otp_secret: Option<String>,
    pub enable_scheduled_ingestion: Option<bool>,
    pub job_webhook_url: Option<String>,
    pub job_notification_preference: Option<NotificationPreference>,
    pub price_webhook_url: Option<String>,
    pub default_threshold: Option<NotificationThreshold>,
}

#[derive(Clone)]
pub struct SettingsResolver {
    store: Arc<dyn SettingsStore>,
    cipher: Option<Arc<dyn CredentialCipher>>,
}

impl SettingsResolver {
    /// `cipher` is `None` when no encryption key is configured; credential
    /// reads and password writes then fail with [`CipherError::MissingKey`].
    pub fn new(store: Arc<dyn SettingsStore>, cipher: Option<Arc<dyn CredentialCipher>>) -> Self {
        Self { store, cipher }
    }

    fn cipher(&self) -> Result<&dyn CredentialCipher, SettingsError> {
        self.cipher
            .as_deref()
            .ok_or(SettingsError::Cipher(CipherError::MissingKey))
    }

    pub async fn resolve_credentials(&self, user_id: UserId) -> Result<SourceCredentials, SettingsError> {
        info!(%user_id, "fetching source settings");
        let settings = self
            .store
            .get_settings(user_id)
            .await?
            .ok_or(SettingsError::NotFound(user_id))?;

        let email = settings
            .source_email
            .filter(|e| !e.trim().is_empty())
            .ok_or(SettingsError::Incomplete)?;
        let encrypted = settings
            .source_password_encrypted
            .filter(|p| !p.is_empty())
            .ok_or(SettingsError::Incomplete)?;

        let password = self.cipher()?.decrypt(&encrypted)?;
        Ok(SourceCredentials {
            email,
            password,
            otp_secret: settings.source_otp_secret.filter(|s| !s.is_empty()),
        })
    }

    pub async fn view(&self, user_id: UserId) -> Result<SettingsView, SettingsError> {
        let Some(settings) = self.store.get_settings(user_id).await? else {
            return Ok(SettingsView::default());
        };
        Ok(SettingsView {
            is_configured: settings.source_email.is_some()
                && settings.source_password_encrypted.is_some(),
            source_email: settings.source_email,
            has_otp_secret: settings.source_otp_secret.is_some(),
            enable_scheduled_ingestion: settings.enable_scheduled_ingestion,
            job_webhook_url: settings.job_webhook_url,
            job_notification_preference: settings.job_notification_preference,
            price_webhook_url: settings.price_webhook_url,
            default_threshold: settings.default_threshold,
        })
    }

    /// Only provided fields overwrite stored values. An empty password is
    /// treated as "unchanged".
    pub async fn save(&self, user_id: UserId, input: SettingsInput) -> Result<(), SettingsError> {
        let source_password_encrypted = match input.source_password.as_deref() {
            Some(password) if !password.is_empty() => Some(self.cipher()?.encrypt(password)),
            _ => None,
        };
        let patch = SettingsPatch {
            source_email: input.source_email,
            source_password_encrypted,
            source_otp_secret: input.source_otp_secret,
            enable_scheduled_ingestion: input.enable_scheduled_ingestion,
            job_webhook_url: input.job_webhook_url,
            job_notification_preference: input.job_notification_preference,
            price_webhook_url: input.price_webhook_url,
            default_threshold: input.default_threshold,
        };
        self.store.save_settings(user_id, &patch).await?;
        info!(%user_id, "settings saved");
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::FernetCipher;
    use basket_storage::MemoryStore;
    use uuid::Uuid;

    fn resolver(store: Arc<MemoryStore>) -> SettingsResolver {
        let cipher: Arc<dyn CredentialCipher> = Arc::new(FernetCipher::from_secret("k").unwrap());
        SettingsResolver::new(store, Some(cipher))
    }

    #[tokio::test]
    async fn saved_password_round_trips_through_resolver() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());
        let user = Uuid::new_v4();

        resolver
            .save(
                user,
                SettingsInput {
                    source_email: Some("lee@example.com".into()),
                    source_password: Some("pw-123".into()),
                    ..SettingsInput::default()
                },
            )
            .await
            .unwrap();

        let stored = store.get_settings(user).await.unwrap().unwrap();
        assert_ne!(stored.source_password_encrypted.as_deref(), Some(&b"pw-123"[..]));

        let creds = resolver.resolve_credentials(user).await.unwrap();
        assert_eq!(creds.email, "lee@example.com");
        assert_eq!(creds.password, "pw-123");
        assert_eq!(creds.otp_secret, None);

        let view = resolver.view(user).await.unwrap();
        assert!(view.is_configured);
        assert_eq!(view.job_notification_preference, NotificationPreference::Off);
    }

    #[tokio::test]
    async fn incomplete_or_missing_settings_are_configuration_errors() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());
        let user = Uuid::new_v4();

        assert!(matches!(
            resolver.resolve_credentials(user).await,
            Err(SettingsError::NotFound(_))
        ));

        resolver
            .save(
                user,
                SettingsInput {
                    source_email: Some("lee@example.com".into()),
                    ..SettingsInput::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            resolver.resolve_credentials(user).await,
            Err(SettingsError::Incomplete)
        ));
        assert!(!resolver.view(user).await.unwrap().is_configured);
    }

    #[tokio::test]
    async fn missing_encryption_key_blocks_password_writes() {
        let resolver = SettingsResolver::new(Arc::new(MemoryStore::new()), None);
        let err = resolver
            .save(
                Uuid::new_v4(),
                SettingsInput {
                    source_password: Some("pw".into()),
                    ..SettingsInput::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::Cipher(CipherError::MissingKey)));
    }
}
