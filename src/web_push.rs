// Web Push (RFC 8030) with aes128gcm payload encryption (RFC 8291) and
// optional VAPID (RFC 8292) authorization.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand_core::{OsRng, RngCore};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

use crate::models::{Device, Payload};
use crate::transport::{DeliveryFailure, PushTransport};

/// Seconds the push service may hold an undelivered message.
const DEFAULT_TTL_SECS: u32 = 24 * 60 * 60;
const RECORD_SIZE: u32 = 4096;
// Push services cap the body at 4096 bytes: 86 header bytes, 16 tag bytes
// and the record delimiter leave this much room for the JSON.
const MAX_PLAINTEXT: usize = 4096 - 86 - 16 - 1;
const VAPID_TOKEN_LIFETIME_SECS: i64 = 12 * 60 * 60;

#[derive(Debug, Deserialize)]
struct Subscription {
    endpoint: String,
    keys: SubscriptionKeys,
}

#[derive(Debug, Deserialize)]
struct SubscriptionKeys {
    p256dh: String,
    auth: String,
}

#[derive(Debug, Clone)]
pub struct VapidConfig {
    /// Raw P-256 private scalar, base64url.
    pub private_key: String,
    /// `mailto:` or `https:` contact for the push service operator.
    pub subject: String,
}

struct Vapid {
    key: SigningKey,
    public_key: String,
    subject: String,
}

impl Vapid {
    fn from_config(config: &VapidConfig) -> Result<Self> {
        let raw = decode_base64url(&config.private_key)
            .context("VAPID_PRIVATE_KEY is not base64url")?;
        let key = SigningKey::from_slice(&raw)
            .context("VAPID_PRIVATE_KEY is not a P-256 private key")?;
        let public_key = PublicKey::from(key.verifying_key()).to_encoded_point(false);
        Ok(Self {
            public_key: URL_SAFE_NO_PAD.encode(public_key.as_bytes()),
            key,
            subject: config.subject.clone(),
        })
    }

    fn authorization(&self, endpoint: &reqwest::Url) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"typ":"JWT","alg":"ES256"}"#);
        let claims = serde_json::json!({
            "aud": endpoint.origin().ascii_serialization(),
            "exp": OffsetDateTime::now_utc().unix_timestamp() + VAPID_TOKEN_LIFETIME_SECS,
            "sub": self.subject,
        });
        let signing_input = format!("{header}.{}", URL_SAFE_NO_PAD.encode(claims.to_string()));
        let signature: Signature = self.key.sign(signing_input.as_bytes());
        format!(
            "vapid t={signing_input}.{}, k={}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            self.public_key
        )
    }
}

pub struct WebPushTransport {
    http: reqwest::Client,
    vapid: Option<Vapid>,
    ttl_secs: u32,
    require_https: bool,
}

impl WebPushTransport {
    pub fn new(timeout: Duration, vapid: Option<&VapidConfig>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create Web Push HTTP client")?;
        Ok(Self {
            http,
            vapid: vapid.map(Vapid::from_config).transpose()?,
            ttl_secs: DEFAULT_TTL_SECS,
            require_https: true,
        })
    }

    /// Lets tests point subscriptions at a plain-http mock server.
    #[cfg(test)]
    pub(crate) fn allowing_http(mut self) -> Self {
        self.require_https = false;
        self
    }
}

impl PushTransport for WebPushTransport {
    async fn send(&self, device: &Device, payload: &Payload) -> Result<(), DeliveryFailure> {
        let subscription: Subscription = serde_json::from_str(&device.transport_credential)
            .map_err(|e| {
                DeliveryFailure::transport(format!("malformed web push subscription: {e}"))
            })?;
        let endpoint = reqwest::Url::parse(&subscription.endpoint)
            .map_err(|e| DeliveryFailure::transport(format!("malformed web push endpoint: {e}")))?;
        if self.require_https && endpoint.scheme() != "https" {
            return Err(DeliveryFailure::transport("web push endpoint must be https"));
        }

        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| DeliveryFailure::transport(format!("payload encoding failed: {e}")))?;
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(DeliveryFailure::transport(format!(
                "web push payload too large ({} bytes)",
                plaintext.len()
            )));
        }
        let body = encrypt_for(&subscription.keys, &plaintext)
            .map_err(|e| DeliveryFailure::transport(format!("web push encryption failed: {e:#}")))?;

        let topic = payload
            .data
            .get("type")
            .map(String::as_str)
            .unwrap_or("notification");

        let mut request = self
            .http
            .post(endpoint.clone())
            .header("TTL", self.ttl_secs.to_string())
            .header("Urgency", "high")
            .header("Topic", topic)
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream");
        if let Some(vapid) = &self.vapid {
            request = request.header("Authorization", vapid.authorization(&endpoint));
        }

        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(DeliveryFailure::transport("web push request timed out"))
            }
            Err(e) => {
                return Err(DeliveryFailure::transport(format!(
                    "web push request failed: {e}"
                )))
            }
        };

        let status = response.status().as_u16();
        match status {
            200..=299 => {
                debug!(device_id = %device.device_id, status, "Web push accepted");
                Ok(())
            }
            // Subscription expired or was removed by the browser.
            404 | 410 => Err(DeliveryFailure::rejected(format!(
                "web push subscription gone (HTTP {status})"
            ))),
            _ => Err(DeliveryFailure::transport(format!("web push HTTP {status}"))),
        }
    }
}

fn decode_base64url(value: &str) -> Result<Vec<u8>> {
    Ok(URL_SAFE_NO_PAD.decode(value.trim().trim_end_matches('='))?)
}

/// Single-record aes128gcm body: salt, record size, sender key, ciphertext.
fn encrypt_for(keys: &SubscriptionKeys, plaintext: &[u8]) -> Result<Vec<u8>> {
    let ua_public = PublicKey::from_sec1_bytes(&decode_base64url(&keys.p256dh)?)
        .map_err(|_| anyhow!("p256dh is not a P-256 public key"))?;
    let auth_secret = decode_base64url(&keys.auth)?;
    if auth_secret.len() != 16 {
        return Err(anyhow!("auth secret must be 16 bytes"));
    }

    let as_secret = EphemeralSecret::random(&mut OsRng);
    let as_public = as_secret.public_key().to_encoded_point(false);
    let shared = as_secret.diffie_hellman(&ua_public);

    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);

    let (cek, nonce) = content_keys(
        shared.raw_secret_bytes().as_slice(),
        &auth_secret,
        ua_public.to_encoded_point(false).as_bytes(),
        as_public.as_bytes(),
        &salt,
    )?;

    let mut record = Vec::with_capacity(plaintext.len() + 1);
    record.extend_from_slice(plaintext);
    record.push(0x02);
    let ciphertext = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&cek))
        .encrypt(Nonce::from_slice(&nonce), record.as_slice())
        .map_err(|_| anyhow!("aes128gcm encryption failed"))?;

    let mut body = Vec::with_capacity(21 + as_public.len() + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(as_public.len() as u8);
    body.extend_from_slice(as_public.as_bytes());
    body.extend_from_slice(&ciphertext);
    Ok(body)
}

fn content_keys(
    ecdh_secret: &[u8],
    auth_secret: &[u8],
    ua_public: &[u8],
    as_public: &[u8],
    salt: &[u8],
) -> Result<([u8; 16], [u8; 12])> {
    let mut key_info = Vec::with_capacity(14 + ua_public.len() + as_public.len());
    key_info.extend_from_slice(b"WebPush: info\0");
    key_info.extend_from_slice(ua_public);
    key_info.extend_from_slice(as_public);

    let mut ikm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(auth_secret), ecdh_secret)
        .expand(&key_info, &mut ikm)
        .map_err(|e| anyhow!("HKDF expansion failed: {e}"))?;

    let prk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut cek = [0u8; 16];
    let mut nonce = [0u8; 12];
    prk.expand(b"Content-Encoding: aes128gcm\0", &mut cek)
        .map_err(|e| anyhow!("HKDF expansion failed: {e}"))?;
    prk.expand(b"Content-Encoding: nonce\0", &mut nonce)
        .map_err(|e| anyhow!("HKDF expansion failed: {e}"))?;
    Ok((cek, nonce))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Platform, TransportKind};
    use p256::ecdsa::{signature::Verifier, VerifyingKey};
    use p256::SecretKey;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Browser {
        secret: SecretKey,
        auth: [u8; 16],
    }

    impl Browser {
        fn new() -> Self {
            let mut auth = [0u8; 16];
            OsRng.fill_bytes(&mut auth);
            Self {
                secret: SecretKey::random(&mut OsRng),
                auth,
            }
        }

        fn public_key(&self) -> Vec<u8> {
            self.secret.public_key().to_encoded_point(false).as_bytes().to_vec()
        }

        fn subscription(&self, endpoint: &str) -> String {
            serde_json::json!({
                "endpoint": endpoint,
                "keys": {
                    "p256dh": URL_SAFE_NO_PAD.encode(self.public_key()),
                    "auth": URL_SAFE_NO_PAD.encode(self.auth),
                }
            })
            .to_string()
        }

        fn decrypt(&self, body: &[u8]) -> Vec<u8> {
            let salt = &body[..16];
            assert_eq!(u32::from_be_bytes(body[16..20].try_into().unwrap()), RECORD_SIZE);
            let id_len = body[20] as usize;
            let sender_key = &body[21..21 + id_len];
            let ciphertext = &body[21 + id_len..];

            let sender = PublicKey::from_sec1_bytes(sender_key).unwrap();
            let shared =
                p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), sender.as_affine());
            let (cek, nonce) = content_keys(
                shared.raw_secret_bytes().as_slice(),
                &self.auth,
                &self.public_key(),
                sender_key,
                salt,
            )
            .unwrap();

            let mut record = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&cek))
                .decrypt(Nonce::from_slice(&nonce), ciphertext)
                .unwrap();
            assert_eq!(record.pop(), Some(0x02), "last record delimiter");
            record
        }
    }

    fn device(credential: String) -> Device {
        Device {
            device_id: "browser-1".to_string(),
            platform: Platform::Web,
            transport_kind: TransportKind::WebPush,
            transport_credential: credential,
            enabled: true,
            last_active_at: OffsetDateTime::now_utc(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn payload() -> Payload {
        Payload {
            title: "Alice liked your post".to_string(),
            body: "hello".to_string(),
            icon: "/icons/notification-192.png".to_string(),
            data: BTreeMap::from([
                ("type".to_string(), "like".to_string()),
                ("url".to_string(), "/posts/p1".to_string()),
            ]),
        }
    }

    fn transport(vapid: Option<&VapidConfig>) -> WebPushTransport {
        WebPushTransport::new(Duration::from_secs(5), vapid)
            .unwrap()
            .allowing_http()
    }

    async fn push_service(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/push/sub-1"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn browser_can_decrypt_the_pushed_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/push/sub-1"))
            .and(header("TTL", "86400"))
            .and(header("Topic", "like"))
            .and(header("Content-Encoding", "aes128gcm"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let browser = Browser::new();
        let endpoint = format!("{}/push/sub-1", server.uri());
        let result = transport(None)
            .send(&device(browser.subscription(&endpoint)), &payload())
            .await;
        assert_eq!(result, Ok(()));

        let requests = server.received_requests().await.unwrap();
        let plaintext = browser.decrypt(&requests[0].body);
        let delivered: Payload = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(delivered, payload());
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn vapid_token_is_signed_for_the_endpoint_origin() {
        let server = push_service(201).await;
        let signing_key = SigningKey::random(&mut OsRng);
        let vapid = VapidConfig {
            private_key: URL_SAFE_NO_PAD.encode(signing_key.to_bytes()),
            subject: "mailto:ops@social.example".to_string(),
        };

        let browser = Browser::new();
        let endpoint = format!("{}/push/sub-1", server.uri());
        transport(Some(&vapid))
            .send(&device(browser.subscription(&endpoint)), &payload())
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let authorization = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
        let (token, key) = authorization
            .strip_prefix("vapid t=")
            .and_then(|rest| rest.split_once(", k="))
            .unwrap();

        let public_key = PublicKey::from(signing_key.verifying_key()).to_encoded_point(false);
        assert_eq!(key, URL_SAFE_NO_PAD.encode(public_key.as_bytes()));

        let (signing_input, signature) = token.rsplit_once('.').unwrap();
        let signature = Signature::from_slice(&URL_SAFE_NO_PAD.decode(signature).unwrap()).unwrap();
        VerifyingKey::from(&signing_key)
            .verify(signing_input.as_bytes(), &signature)
            .unwrap();

        let claims = signing_input.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims).unwrap()).unwrap();
        assert_eq!(claims["aud"], server.uri());
        assert_eq!(claims["sub"], "mailto:ops@social.example");
    }

    #[tokio::test]
    async fn expired_subscription_is_flagged_as_rejected() {
        let server = push_service(410).await;
        let browser = Browser::new();
        let endpoint = format!("{}/push/sub-1", server.uri());

        let err = transport(None)
            .send(&device(browser.subscription(&endpoint)), &payload())
            .await
            .unwrap_err();
        assert!(err.is_credential_rejected());
        assert_eq!(
            err.to_string(),
            "transport_error: web push subscription gone (HTTP 410)"
        );
    }

    #[tokio::test]
    async fn server_errors_are_transport_failures() {
        let server = push_service(503).await;
        let browser = Browser::new();
        let endpoint = format!("{}/push/sub-1", server.uri());

        let err = transport(None)
            .send(&device(browser.subscription(&endpoint)), &payload())
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryFailure::transport("web push HTTP 503"));
    }

    #[tokio::test]
    async fn malformed_subscriptions_are_transport_errors() {
        let transport = WebPushTransport::new(Duration::from_secs(1), None).unwrap();

        let err = transport
            .send(&device("not-json".to_string()), &payload())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("malformed web push subscription"));
        assert!(!err.is_credential_rejected());

        let keyless = serde_json::json!({ "endpoint": "https://push.example/sub" }).to_string();
        let err = transport.send(&device(keyless), &payload()).await.unwrap_err();
        assert!(err.to_string().contains("malformed web push subscription"));

        let bad_key = serde_json::json!({
            "endpoint": "https://push.example/sub",
            "keys": { "p256dh": "AAAA", "auth": URL_SAFE_NO_PAD.encode([0u8; 16]) }
        })
        .to_string();
        let err = transport.send(&device(bad_key), &payload()).await.unwrap_err();
        assert!(err.to_string().contains("web push encryption failed"));
    }

    #[tokio::test]
    async fn plain_http_endpoint_is_refused() {
        let transport = WebPushTransport::new(Duration::from_secs(1), None).unwrap();
        let credential = Browser::new().subscription("http://push.example/sub");
        let err = transport.send(&device(credential), &payload()).await.unwrap_err();
        assert_eq!(err, DeliveryFailure::transport("web push endpoint must be https"));
    }

    #[test]
    fn invalid_vapid_key_fails_at_startup() {
        let vapid = VapidConfig {
            private_key: "not a key".to_string(),
            subject: "mailto:ops@social.example".to_string(),
        };
        assert!(WebPushTransport::new(Duration::from_secs(1), Some(&vapid)).is_err());
    }
}
