use anyhow::Result;
use moka::future::Cache;
use sqlx::{postgres::PgPoolOptions, types::Json, FromRow, Pool, Postgres};
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{RegistryError, StoreError};
use crate::models::{ActorProfile, Device, NotificationPreferences, UserId};
use crate::store::{DeviceRegistration, DeviceRegistry, UserDirectory};

pub async fn init_db_pool(database_url: &str) -> Result<Pool<Postgres>> {
    info!("Initializing database connection pool");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

const DEVICE_COLUMNS: &str =
    "device_id, platform, transport_kind, transport_credential, enabled, last_active_at, created_at";

#[derive(Debug, FromRow)]
struct DeviceRow {
    device_id: String,
    platform: String,
    transport_kind: String,
    transport_credential: String,
    enabled: bool,
    last_active_at: OffsetDateTime,
    created_at: OffsetDateTime,
}

impl TryFrom<DeviceRow> for Device {
    type Error = StoreError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        Ok(Device {
            platform: row
                .platform
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("device {}: {e}", row.device_id)))?,
            transport_kind: row
                .transport_kind
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("device {}: {e}", row.device_id)))?,
            device_id: row.device_id,
            transport_credential: row.transport_credential,
            enabled: row.enabled,
            last_active_at: row.last_active_at,
            created_at: row.created_at,
        })
    }
}

fn into_devices(rows: Vec<DeviceRow>) -> Result<Vec<Device>, RegistryError> {
    rows.into_iter()
        .map(|row| Device::try_from(row).map_err(RegistryError::from))
        .collect()
}

/// Postgres-backed registry and directory. Actor profiles are cached since
/// every dispatch looks one up.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
    profiles: Cache<UserId, ActorProfile>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>, profile_ttl: Duration) -> Self {
        let profiles = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(profile_ttl)
            .build();
        Self { pool, profiles }
    }
}

impl DeviceRegistry for PgStore {
    async fn register_device(
        &self,
        user_id: &str,
        registration: DeviceRegistration,
    ) -> Result<Device, RegistryError> {
        registration.validate()?;
        let transport_kind = registration.resolved_transport_kind();

        let query = format!(
            r#"
            INSERT INTO user_devices
                (user_id, device_id, platform, transport_kind, transport_credential, enabled, last_active_at, created_at)
            VALUES ($1, $2, $3, $4, $5, TRUE, NOW(), NOW())
            ON CONFLICT (user_id, device_id) DO UPDATE
            SET platform = EXCLUDED.platform,
                transport_kind = EXCLUDED.transport_kind,
                transport_credential = EXCLUDED.transport_credential,
                enabled = TRUE,
                last_active_at = NOW()
            RETURNING {DEVICE_COLUMNS}
            "#
        );
        let row: DeviceRow = sqlx::query_as(&query)
            .bind(user_id)
            .bind(&registration.device_id)
            .bind(registration.platform.as_str())
            .bind(transport_kind.as_str())
            .bind(&registration.credential)
            .fetch_one(&self.pool)
            .await?;

        debug!(user_id = %user_id, device_id = %row.device_id, "Device upserted");
        Ok(Device::try_from(row)?)
    }

    async fn unregister_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, RegistryError> {
        let result = sqlx::query("DELETE FROM user_devices WHERE user_id = $1 AND device_id = $2")
            .bind(user_id)
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_enabled(
        &self,
        user_id: &str,
        device_id: &str,
        enabled: bool,
    ) -> Result<Device, RegistryError> {
        let query = format!(
            "UPDATE user_devices SET enabled = $3 WHERE user_id = $1 AND device_id = $2 RETURNING {DEVICE_COLUMNS}"
        );
        let row: Option<DeviceRow> = sqlx::query_as(&query)
            .bind(user_id)
            .bind(device_id)
            .bind(enabled)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Device::try_from(row)?),
            None => Err(RegistryError::NotFound {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
            }),
        }
    }

    async fn list_devices(&self, user_id: &str) -> Result<Vec<Device>, RegistryError> {
        let query = format!(
            "SELECT {DEVICE_COLUMNS} FROM user_devices WHERE user_id = $1 ORDER BY created_at, device_id"
        );
        let rows: Vec<DeviceRow> = sqlx::query_as(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        into_devices(rows)
    }

    async fn list_eligible_devices(&self, user_id: &str) -> Result<Vec<Device>, RegistryError> {
        let query = format!(
            "SELECT {DEVICE_COLUMNS} FROM user_devices \
             WHERE user_id = $1 AND enabled AND btrim(transport_credential) <> ''"
        );
        let rows: Vec<DeviceRow> = sqlx::query_as(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        into_devices(rows)
    }
}

impl UserDirectory for PgStore {
    async fn followers_of(&self, user_id: &str) -> Result<Vec<UserId>, StoreError> {
        let followers: Vec<String> =
            sqlx::query_scalar("SELECT id FROM users WHERE $1 = ANY(following)")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(followers)
    }

    async fn preferences_for(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, NotificationPreferences>, StoreError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut preferences = HashMap::with_capacity(user_ids.len());
        for chunk in user_ids.chunks(500) {
            let rows: Vec<(String, Json<NotificationPreferences>)> = sqlx::query_as(
                "SELECT id, notification_preferences FROM users WHERE id = ANY($1)",
            )
            .bind(chunk)
            .fetch_all(&self.pool)
            .await?;
            preferences.extend(rows.into_iter().map(|(id, Json(prefs))| (id, prefs)));
        }
        Ok(preferences)
    }

    async fn update_preferences(
        &self,
        user_id: &str,
        preferences: NotificationPreferences,
    ) -> Result<Option<NotificationPreferences>, StoreError> {
        let updated: Option<Json<NotificationPreferences>> = sqlx::query_scalar(
            "UPDATE users SET notification_preferences = $2 WHERE id = $1 RETURNING notification_preferences",
        )
        .bind(user_id)
        .bind(Json(&preferences))
        .fetch_optional(&self.pool)
        .await?;
        Ok(updated.map(|Json(prefs)| prefs))
    }

    async fn profile(&self, user_id: &str) -> Result<Option<ActorProfile>, StoreError> {
        if let Some(profile) = self.profiles.get(user_id) {
            return Ok(Some(profile));
        }

        let row: Option<(String, String, Option<String>)> =
            sqlx::query_as("SELECT id, display_name, avatar_url FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some((id, display_name, avatar_url)) = row else {
            return Ok(None);
        };
        let profile = ActorProfile {
            id,
            display_name,
            avatar_url,
        };
        self.profiles
            .insert(user_id.to_string(), profile.clone())
            .await;
        Ok(Some(profile))
    }
}
