use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::fcm::{FcmConfig, FCM_API_BASE};
use crate::payload::DEFAULT_ICON;
use crate::web_push::VapidConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Absent means run on the in-memory store.
    pub database_url: Option<String>,
    pub api_bind_address: String,
    pub api_key: Option<String>,
    pub fcm: Option<FcmConfig>,
    /// Absent means Web Push requests go out unauthenticated.
    pub vapid: Option<VapidConfig>,
    pub push_timeout: Duration,
    pub default_notification_icon: String,
    pub max_in_flight_sends: usize,
    pub dispatch_queue_capacity: usize,
    pub profile_cache_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let fcm = match (optional("FCM_PROJECT_ID"), optional("FCM_ACCESS_TOKEN")) {
            (Some(project_id), Some(access_token)) => Some(FcmConfig {
                project_id,
                access_token,
                api_base: env::var("FCM_API_BASE").unwrap_or_else(|_| FCM_API_BASE.to_string()),
                web_origin: optional("WEB_ORIGIN"),
            }),
            _ => None,
        };

        Ok(Self {
            database_url: optional("DATABASE_URL"),
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            api_key: optional("API_KEY"),
            fcm,
            vapid: optional("VAPID_PRIVATE_KEY").map(|private_key| VapidConfig {
                private_key,
                subject: env::var("VAPID_SUBJECT")
                    .unwrap_or_else(|_| "mailto:notifications@localhost".to_string()),
            }),
            push_timeout: Duration::from_secs(parse_or("PUSH_TIMEOUT_SECS", 10)?),
            default_notification_icon: env::var("DEFAULT_NOTIFICATION_ICON")
                .unwrap_or_else(|_| DEFAULT_ICON.to_string()),
            max_in_flight_sends: parse_or("MAX_IN_FLIGHT_SENDS", 64)?,
            dispatch_queue_capacity: parse_or("DISPATCH_QUEUE_CAPACITY", 1000)?,
            profile_cache_ttl: Duration::from_secs(parse_or("PROFILE_CACHE_TTL_SECS", 600)?),
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number, got {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Keys are unique to these tests so parallel test threads don't collide.
    #[test]
    fn numeric_settings_fall_back_and_reject_garbage() {
        assert_eq!(parse_or::<u64>("SPN_TEST_UNSET_NUMBER", 7).unwrap(), 7);

        env::set_var("SPN_TEST_BAD_NUMBER", "ten");
        let err = parse_or::<usize>("SPN_TEST_BAD_NUMBER", 1).unwrap_err();
        assert!(err.to_string().contains("SPN_TEST_BAD_NUMBER"));

        env::set_var("SPN_TEST_GOOD_NUMBER", " 32 ");
        assert_eq!(parse_or::<usize>("SPN_TEST_GOOD_NUMBER", 1).unwrap(), 32);
    }

    #[test]
    fn blank_values_count_as_unset() {
        env::set_var("SPN_TEST_BLANK", "   ");
        assert_eq!(optional("SPN_TEST_BLANK"), None);
    }
}
