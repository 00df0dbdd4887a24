use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{RegistryError, StoreError};
use crate::models::{ActorProfile, Device, NotificationPreferences, UserId};
use crate::store::{DeviceRegistration, DeviceRegistry, UserDirectory};

/// Seed data for one user.
#[derive(Debug, Clone, Default)]
pub struct UserRecord {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub following: HashSet<UserId>,
    pub preferences: NotificationPreferences,
}

impl UserRecord {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    pub fn following(mut self, user_id: impl Into<UserId>) -> Self {
        self.following.insert(user_id.into());
        self
    }

    pub fn preferences(mut self, preferences: NotificationPreferences) -> Self {
        self.preferences = preferences;
        self
    }
}

#[derive(Debug, Default)]
struct UserEntry {
    record: Option<UserRecord>,
    devices: Vec<Device>,
}

/// In-process store used by tests and when no `DATABASE_URL` is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<UserId, UserEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, record: UserRecord) {
        let id = record.id.clone();
        let mut users = self.users.write().await;
        users.entry(id).or_default().record = Some(record);
    }
}

impl DeviceRegistry for MemoryStore {
    async fn register_device(
        &self,
        user_id: &str,
        registration: DeviceRegistration,
    ) -> Result<Device, RegistryError> {
        registration.validate()?;
        let transport_kind = registration.resolved_transport_kind();
        let now = OffsetDateTime::now_utc();

        let mut users = self.users.write().await;
        let entry = users.entry(user_id.to_string()).or_default();

        if let Some(device) = entry
            .devices
            .iter_mut()
            .find(|d| d.device_id == registration.device_id)
        {
            device.platform = registration.platform;
            device.transport_kind = transport_kind;
            device.transport_credential = registration.credential;
            device.enabled = true;
            device.last_active_at = now;
            debug!(user_id = %user_id, device_id = %device.device_id, "Device re-registered");
            return Ok(device.clone());
        }

        let device = Device {
            device_id: registration.device_id,
            platform: registration.platform,
            transport_kind,
            transport_credential: registration.credential,
            enabled: true,
            last_active_at: now,
            created_at: now,
        };
        entry.devices.push(device.clone());
        Ok(device)
    }

    async fn unregister_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, RegistryError> {
        let mut users = self.users.write().await;
        let Some(entry) = users.get_mut(user_id) else {
            return Ok(false);
        };
        let before = entry.devices.len();
        entry.devices.retain(|d| d.device_id != device_id);
        Ok(entry.devices.len() != before)
    }

    async fn set_enabled(
        &self,
        user_id: &str,
        device_id: &str,
        enabled: bool,
    ) -> Result<Device, RegistryError> {
        let mut users = self.users.write().await;
        let device = users
            .get_mut(user_id)
            .and_then(|entry| entry.devices.iter_mut().find(|d| d.device_id == device_id))
            .ok_or_else(|| RegistryError::NotFound {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
            })?;
        device.enabled = enabled;
        Ok(device.clone())
    }

    async fn list_devices(&self, user_id: &str) -> Result<Vec<Device>, RegistryError> {
        let users = self.users.read().await;
        Ok(users
            .get(user_id)
            .map(|entry| entry.devices.clone())
            .unwrap_or_default())
    }

    async fn list_eligible_devices(&self, user_id: &str) -> Result<Vec<Device>, RegistryError> {
        let users = self.users.read().await;
        Ok(users
            .get(user_id)
            .map(|entry| {
                entry
                    .devices
                    .iter()
                    .filter(|d| d.is_eligible())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl UserDirectory for MemoryStore {
    async fn followers_of(&self, user_id: &str) -> Result<Vec<UserId>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .filter_map(|entry| entry.record.as_ref())
            .filter(|record| record.following.contains(user_id))
            .map(|record| record.id.clone())
            .collect())
    }

    async fn preferences_for(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, NotificationPreferences>, StoreError> {
        let users = self.users.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| {
                users
                    .get(id)
                    .and_then(|entry| entry.record.as_ref())
                    .map(|record| (id.clone(), record.preferences.clone()))
            })
            .collect())
    }

    async fn update_preferences(
        &self,
        user_id: &str,
        preferences: NotificationPreferences,
    ) -> Result<Option<NotificationPreferences>, StoreError> {
        let mut users = self.users.write().await;
        Ok(users
            .get_mut(user_id)
            .and_then(|entry| entry.record.as_mut())
            .map(|record| {
                record.preferences = preferences;
                record.preferences.clone()
            }))
    }

    async fn profile(&self, user_id: &str) -> Result<Option<ActorProfile>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .get(user_id)
            .and_then(|entry| entry.record.as_ref())
            .map(|record| ActorProfile {
                id: record.id.clone(),
                display_name: record.display_name.clone(),
                avatar_url: record.avatar_url.clone(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Platform, TransportKind};

    #[tokio::test]
    async fn re_registration_updates_in_place() {
        let store = MemoryStore::new();
        store
            .register_device("alice", DeviceRegistration::new("phone", Platform::Android, "tok-1"))
            .await
            .unwrap();
        store.set_enabled("alice", "phone", false).await.unwrap();

        let device = store
            .register_device("alice", DeviceRegistration::new("phone", Platform::Android, "tok-2"))
            .await
            .unwrap();

        let devices = store.list_devices("alice").await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].transport_credential, "tok-2");
        assert!(device.enabled, "re-registration re-enables the device");
        assert!(device.last_active_at >= device.created_at);
    }

    #[tokio::test]
    async fn re_registration_can_switch_transport_kind() {
        let store = MemoryStore::new();
        let fcm = store
            .register_device(
                "alice",
                DeviceRegistration::new("browser", Platform::Web, "fcm-token:APA91b"),
            )
            .await
            .unwrap();
        assert_eq!(fcm.transport_kind, TransportKind::Fcm);

        let subscription =
            r#"{"endpoint":"https://push.example/sub/1","keys":{"p256dh":"x","auth":"y"}}"#;
        let web_push = store
            .register_device(
                "alice",
                DeviceRegistration::new("browser", Platform::Web, subscription),
            )
            .await
            .unwrap();
        assert_eq!(web_push.transport_kind, TransportKind::WebPush);
        assert_eq!(web_push.created_at, fcm.created_at);

        let devices = store.list_devices("alice").await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].transport_kind, TransportKind::WebPush);
        assert_eq!(devices[0].transport_credential, subscription);
    }

    #[tokio::test]
    async fn unregister_then_register_yields_one_record() {
        let store = MemoryStore::new();
        let reg = DeviceRegistration::new("laptop", Platform::Web, "tok");
        store.register_device("alice", reg.clone()).await.unwrap();

        assert!(store.unregister_device("alice", "laptop").await.unwrap());
        assert!(!store.unregister_device("alice", "laptop").await.unwrap());
        assert!(!store.unregister_device("nobody", "laptop").await.unwrap());

        store.register_device("alice", reg).await.unwrap();
        assert_eq!(store.list_devices("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_enabled_on_unknown_device_is_not_found() {
        let store = MemoryStore::new();
        let err = store.set_enabled("alice", "ghost", true).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn eligible_devices_exclude_disabled() {
        let store = MemoryStore::new();
        store
            .register_device("alice", DeviceRegistration::new("a", Platform::Ios, "tok-a"))
            .await
            .unwrap();
        let sub = r#"{"endpoint":"https://push.example/sub/1"}"#;
        let web = store
            .register_device("alice", DeviceRegistration::new("b", Platform::Web, sub))
            .await
            .unwrap();
        assert_eq!(web.transport_kind, TransportKind::WebPush);

        store.set_enabled("alice", "a", false).await.unwrap();
        let eligible = store.list_eligible_devices("alice").await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].device_id, "b");
    }

    #[tokio::test]
    async fn followers_and_preferences() {
        let store = MemoryStore::new();
        store.insert_user(UserRecord::new("alice", "Alice")).await;
        store
            .insert_user(UserRecord::new("bob", "Bob").following("alice"))
            .await;
        store
            .insert_user(UserRecord::new("carol", "Carol").following("bob"))
            .await;

        assert_eq!(store.followers_of("alice").await.unwrap(), vec!["bob".to_string()]);

        let prefs = store
            .preferences_for(&["bob".to_string(), "stranger".to_string()])
            .await
            .unwrap();
        assert!(prefs.contains_key("bob"));
        assert!(!prefs.contains_key("stranger"));

        let updated = store
            .update_preferences(
                "bob",
                NotificationPreferences {
                    follows: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.unwrap().follows, Some(false));
        assert!(store
            .update_preferences("stranger", NotificationPreferences::default())
            .await
            .unwrap()
            .is_none());
    }
}
