use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{RegistryError, StoreError, ValidationError};
use crate::models::{ActorProfile, Device, NotificationPreferences, Platform, TransportKind, UserId};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub device_id: String,
    pub platform: Platform,
    pub credential: String,
    #[serde(default)]
    pub transport_kind: Option<TransportKind>,
}

impl DeviceRegistration {
    pub fn new(
        device_id: impl Into<String>,
        platform: Platform,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            platform,
            credential: credential.into(),
            transport_kind: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.device_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("deviceId"));
        }
        if self.credential.trim().is_empty() {
            return Err(ValidationError::EmptyField("credential"));
        }
        Ok(())
    }

    /// Explicit kind wins, otherwise inferred from the credential once here
    /// so sends never have to guess.
    pub fn resolved_transport_kind(&self) -> TransportKind {
        self.transport_kind
            .unwrap_or_else(|| resolve_transport_kind(&self.credential))
    }
}

/// Web Push subscriptions arrive as a JSON document carrying an https
/// endpoint; anything else is treated as an FCM registration token.
pub fn resolve_transport_kind(credential: &str) -> TransportKind {
    let is_subscription = serde_json::from_str::<serde_json::Value>(credential)
        .ok()
        .and_then(|v| {
            v.get("endpoint")
                .and_then(|e| e.as_str())
                .map(|e| e.starts_with("https://"))
        })
        .unwrap_or(false);

    if is_subscription {
        TransportKind::WebPush
    } else {
        TransportKind::Fcm
    }
}

#[trait_variant::make(Send)]
pub trait DeviceRegistry: Send + Sync {
    /// Idempotent upsert keyed by `(user_id, device_id)`.
    async fn register_device(
        &self,
        user_id: &str,
        registration: DeviceRegistration,
    ) -> Result<Device, RegistryError>;

    /// Returns whether a record was removed. Absent devices are not an error.
    async fn unregister_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, RegistryError>;

    async fn set_enabled(
        &self,
        user_id: &str,
        device_id: &str,
        enabled: bool,
    ) -> Result<Device, RegistryError>;

    /// All devices in creation order.
    async fn list_devices(&self, user_id: &str) -> Result<Vec<Device>, RegistryError>;

    /// Enabled devices with a non-empty credential, in no particular order.
    async fn list_eligible_devices(&self, user_id: &str) -> Result<Vec<Device>, RegistryError>;
}

#[trait_variant::make(Send)]
pub trait UserDirectory: Send + Sync {
    /// Users whose `following` set contains `user_id`.
    async fn followers_of(&self, user_id: &str) -> Result<Vec<UserId>, StoreError>;

    /// Preferences for every known user in `user_ids`. Unknown users are
    /// simply missing from the map.
    async fn preferences_for(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, NotificationPreferences>, StoreError>;

    /// `Ok(None)` when the user does not exist.
    async fn update_preferences(
        &self,
        user_id: &str,
        preferences: NotificationPreferences,
    ) -> Result<Option<NotificationPreferences>, StoreError>;

    async fn profile(&self, user_id: &str) -> Result<Option<ActorProfile>, StoreError>;
}

/// Everything the service needs from a backing store.
pub trait Store: DeviceRegistry + UserDirectory + 'static {}

impl<T> Store for T where T: DeviceRegistry + UserDirectory + 'static {}
