use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::credential_fingerprint;
use crate::fcm::FcmTransport;
use crate::metrics;
use crate::models::{Device, Payload, TransportKind};
use crate::web_push::WebPushTransport;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// Device is switched off; no remote call was made.
    #[error("disabled")]
    Disabled,

    /// Device has nothing to send to; no remote call was made.
    #[error("no_credential")]
    NoCredential,

    #[error("transport_error: {reason}")]
    Transport {
        reason: String,
        /// Provider says the credential will never work again.
        credential_rejected: bool,
    },
}

impl DeliveryFailure {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
            credential_rejected: false,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
            credential_rejected: true,
        }
    }

    pub fn is_credential_rejected(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                credential_rejected: true,
                ..
            }
        )
    }
}

#[trait_variant::make(Send)]
pub trait PushTransport: Send + Sync {
    /// Delivers `payload` to `device`. Failures come back as values.
    async fn send(&self, device: &Device, payload: &Payload) -> Result<(), DeliveryFailure>;
}

/// Local short-circuits that never reach a provider.
pub fn precheck(device: &Device) -> Result<(), DeliveryFailure> {
    if !device.enabled {
        return Err(DeliveryFailure::Disabled);
    }
    if device.transport_credential.trim().is_empty() {
        return Err(DeliveryFailure::NoCredential);
    }
    Ok(())
}

pub struct TransportRouter {
    fcm: FcmTransport,
    web_push: WebPushTransport,
}

impl TransportRouter {
    pub fn new(fcm: FcmTransport, web_push: WebPushTransport) -> Self {
        Self { fcm, web_push }
    }
}

impl PushTransport for TransportRouter {
    async fn send(&self, device: &Device, payload: &Payload) -> Result<(), DeliveryFailure> {
        precheck(device)?;

        let started = Instant::now();
        let result = match device.transport_kind {
            TransportKind::Fcm => self.fcm.send(device, payload).await,
            TransportKind::WebPush => self.web_push.send(device, payload).await,
        };
        metrics::TRANSPORT_LATENCY.observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(()) => debug!(
                device_id = %device.device_id,
                transport = %device.transport_kind,
                "Push accepted"
            ),
            Err(failure) if failure.is_credential_rejected() => {
                metrics::CREDENTIALS_REJECTED.inc();
                // Not pruned automatically; cleanup stays with the owner.
                warn!(
                    device_id = %device.device_id,
                    transport = %device.transport_kind,
                    credential = %credential_fingerprint(&device.transport_credential),
                    error = %failure,
                    "Provider rejected device credential"
                );
            }
            Err(failure) => warn!(
                device_id = %device.device_id,
                transport = %device.transport_kind,
                error = %failure,
                "Push failed"
            ),
        }
        result
    }
}
