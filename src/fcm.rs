use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

use crate::models::{Device, Payload, Platform};
use crate::transport::{DeliveryFailure, PushTransport};

pub const FCM_API_BASE: &str = "https://fcm.googleapis.com";

#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub project_id: String,
    /// OAuth2 bearer token for the service account.
    pub access_token: String,
    pub api_base: String,
    /// Absolute origin used to turn deep links into `fcm_options.link`.
    pub web_origin: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FcmMessage {
    pub message: FcmMessageBody,
}

#[derive(Debug, Serialize)]
pub struct FcmMessageBody {
    pub token: String,
    pub notification: FcmNotification,
    pub data: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub android: Option<AndroidConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apns: Option<ApnsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webpush: Option<WebpushConfig>,
}

#[derive(Debug, Serialize)]
pub struct FcmNotification {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AndroidConfig {
    pub priority: &'static str,
    pub notification: AndroidNotification,
}

#[derive(Debug, Serialize)]
pub struct AndroidNotification {
    pub sound: &'static str,
    pub icon: String,
    /// Deep link the app's intent filter opens on tap.
    pub click_action: String,
    pub default_vibrate_timings: bool,
}

#[derive(Debug, Serialize)]
pub struct ApnsConfig {
    pub headers: HashMap<&'static str, String>,
    pub payload: ApnsPayload,
}

#[derive(Debug, Serialize)]
pub struct ApnsPayload {
    pub aps: Aps,
}

#[derive(Debug, Serialize)]
pub struct Aps {
    pub sound: &'static str,
    pub badge: u32,
}

#[derive(Debug, Serialize)]
pub struct WebpushConfig {
    pub headers: HashMap<&'static str, String>,
    pub notification: WebpushNotification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fcm_options: Option<WebpushFcmOptions>,
}

#[derive(Debug, Serialize)]
pub struct WebpushNotification {
    pub icon: String,
    pub badge: String,
}

#[derive(Debug, Serialize)]
pub struct WebpushFcmOptions {
    pub link: String,
}

pub struct FcmTransport {
    http: reqwest::Client,
    config: Option<FcmConfig>,
    api_url: String,
}

impl FcmTransport {
    /// `None` config leaves the channel wired but failing every send.
    pub fn new(config: Option<FcmConfig>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create FCM HTTP client")?;

        let api_url = config
            .as_ref()
            .map(|c| {
                format!(
                    "{}/v1/projects/{}/messages:send",
                    c.api_base.trim_end_matches('/'),
                    c.project_id
                )
            })
            .unwrap_or_default();

        Ok(Self {
            http,
            config,
            api_url,
        })
    }

    pub fn build_message(
        device: &Device,
        payload: &Payload,
        web_origin: Option<&str>,
    ) -> FcmMessage {
        let mut data = payload.data.clone();
        data.insert("title".to_string(), payload.title.clone());
        data.insert("body".to_string(), payload.body.clone());
        data.insert("icon".to_string(), payload.icon.clone());
        data.entry("url".to_string())
            .or_insert_with(|| payload.url().to_string());

        let (android, apns, webpush) = match device.platform {
            Platform::Android => (
                Some(AndroidConfig {
                    priority: "HIGH",
                    notification: AndroidNotification {
                        sound: "default",
                        icon: payload.icon.clone(),
                        click_action: payload.url().to_string(),
                        default_vibrate_timings: true,
                    },
                }),
                None,
                None,
            ),
            Platform::Ios | Platform::Mac => (
                None,
                Some(ApnsConfig {
                    headers: HashMap::from([("apns-priority", "10".to_string())]),
                    payload: ApnsPayload {
                        aps: Aps {
                            sound: "default",
                            badge: 1,
                        },
                    },
                }),
                None,
            ),
            Platform::Web | Platform::Windows => (
                None,
                None,
                Some(WebpushConfig {
                    headers: HashMap::from([("Urgency", "high".to_string())]),
                    notification: WebpushNotification {
                        icon: payload.icon.clone(),
                        badge: payload.icon.clone(),
                    },
                    fcm_options: web_origin.map(|origin| WebpushFcmOptions {
                        link: format!("{}{}", origin.trim_end_matches('/'), payload.url()),
                    }),
                }),
            ),
        };

        FcmMessage {
            message: FcmMessageBody {
                token: device.transport_credential.clone(),
                notification: FcmNotification {
                    title: payload.title.clone(),
                    body: payload.body.clone(),
                    image: payload
                        .icon
                        .starts_with("https://")
                        .then(|| payload.icon.clone()),
                },
                data,
                android,
                apns,
                webpush,
            },
        }
    }
}

impl PushTransport for FcmTransport {
    async fn send(&self, device: &Device, payload: &Payload) -> Result<(), DeliveryFailure> {
        let Some(config) = &self.config else {
            return Err(DeliveryFailure::transport("fcm not configured"));
        };

        let message = Self::build_message(device, payload, config.web_origin.as_deref());

        let response = match self
            .http
            .post(&self.api_url)
            .bearer_auth(&config.access_token)
            .json(&message)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(DeliveryFailure::transport("fcm request timed out"))
            }
            Err(e) => return Err(DeliveryFailure::transport(format!("fcm request failed: {e}"))),
        };

        let status = response.status();
        if status.is_success() {
            debug!(device_id = %device.device_id, "FCM notification sent successfully");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        Err(classify_error(status.as_u16(), &body))
    }
}

/// Maps an FCM v1 error response to a failure. `UNREGISTERED` (or a bare
/// 404) means the token is dead for good.
fn classify_error(status: u16, body: &str) -> DeliveryFailure {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let error_code = error
        .and_then(|e| e.get("details"))
        .and_then(|d| d.as_array())
        .and_then(|details| {
            details
                .iter()
                .find_map(|d| d.get("errorCode").and_then(|c| c.as_str()))
        })
        .or_else(|| error.and_then(|e| e.get("status")).and_then(|s| s.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| "UNKNOWN".to_string());

    let reason = format!("fcm {error_code} (HTTP {status})");
    if error_code == "UNREGISTERED" || status == 404 {
        DeliveryFailure::rejected(reason)
    } else {
        DeliveryFailure::transport(reason)
    }
}
