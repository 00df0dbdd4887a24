// Only a malformed event is an error; per-recipient failures land in the report.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ResolveError, ValidationError};
use crate::metrics;
use crate::models::{Device, EventKind, NotificationEvent, Payload, UserId};
use crate::payload::{anonymous_actor, PayloadBuilder};
use crate::resolver::RecipientResolver;
use crate::store::Store;
use crate::transport::{DeliveryFailure, PushTransport};

pub const NO_ENABLED_DEVICES: &str = "no_enabled_devices";
pub const ALL_DEVICES_FAILED: &str = "all_devices_failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOutcome {
    pub user_id: UserId,
    pub device_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreachedRecipient {
    pub user_id: UserId,
    pub reason: String,
}

/// Advisory outcome of one fan-out run. `failed > 0` alongside successes is
/// the normal shape of a partially delivered batch, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub event_type: EventKind,
    pub total_recipients: usize,
    pub recipients_reached: usize,
    pub successful: usize,
    pub failed: usize,
    pub outcomes: Vec<DeviceOutcome>,
    pub unreached: Vec<UnreachedRecipient>,
}

impl DeliveryReport {
    pub fn empty(event_type: EventKind) -> Self {
        Self {
            event_type,
            total_recipients: 0,
            recipients_reached: 0,
            successful: 0,
            failed: 0,
            outcomes: Vec::new(),
            unreached: Vec::new(),
        }
    }

    fn record(&mut self, user_id: UserId, device_id: String, result: Result<(), String>) {
        match result {
            Ok(()) => {
                self.successful += 1;
                self.outcomes.push(DeviceOutcome {
                    user_id,
                    device_id,
                    success: true,
                    error_reason: None,
                });
            }
            Err(reason) => {
                self.failed += 1;
                self.outcomes.push(DeviceOutcome {
                    user_id,
                    device_id,
                    success: false,
                    error_reason: Some(reason),
                });
            }
        }
    }
}

struct PendingSend {
    user_id: UserId,
    device_id: String,
    handle: JoinHandle<Result<(), DeliveryFailure>>,
}

pub struct FanOutDispatcher<S, T> {
    store: Arc<S>,
    resolver: RecipientResolver<S>,
    transport: Arc<T>,
    payloads: PayloadBuilder,
    send_permits: Arc<Semaphore>,
}

impl<S, T> FanOutDispatcher<S, T>
where
    S: Store,
    T: PushTransport + 'static,
{
    pub fn new(
        store: Arc<S>,
        transport: Arc<T>,
        payloads: PayloadBuilder,
        max_in_flight_sends: usize,
    ) -> Self {
        Self {
            resolver: RecipientResolver::new(store.clone()),
            store,
            transport,
            payloads,
            send_permits: Arc::new(Semaphore::new(max_in_flight_sends.max(1))),
        }
    }

    pub async fn dispatch(
        &self,
        event: &NotificationEvent,
    ) -> Result<DeliveryReport, ValidationError> {
        let started = Instant::now();

        if let Err(e) = event.validate() {
            metrics::EVENTS_INVALID.inc();
            return Err(e);
        }

        let recipients = match self.resolver.resolve(event).await {
            Ok(recipients) => recipients,
            Err(ResolveError::Invalid(e)) => {
                metrics::EVENTS_INVALID.inc();
                return Err(e);
            }
            Err(ResolveError::Store(e)) => {
                error!(
                    event_type = %event.kind,
                    actor_id = %event.actor_id,
                    error = %e,
                    "Recipient resolution failed, nothing sent"
                );
                return Ok(DeliveryReport::empty(event.kind));
            }
        };

        metrics::EVENTS_DISPATCHED.inc();
        if recipients.is_empty() {
            return Ok(DeliveryReport::empty(event.kind));
        }

        let actor = match self.store.profile(&event.actor_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                warn!(actor_id = %event.actor_id, "Actor profile not found, using placeholder");
                anonymous_actor(&event.actor_id)
            }
            Err(e) => {
                warn!(
                    actor_id = %event.actor_id,
                    error = %e,
                    "Actor profile lookup failed, using placeholder"
                );
                anonymous_actor(&event.actor_id)
            }
        };
        let payload = Arc::new(self.payloads.build(event, &actor)?);

        let mut report = DeliveryReport::empty(event.kind);
        report.total_recipients = recipients.len();

        let lookups = join_all(recipients.iter().map(|user_id| async move {
            (user_id, self.store.list_eligible_devices(user_id).await)
        }))
        .await;

        let mut with_devices: Vec<UserId> = Vec::new();
        let mut pending = Vec::new();
        for (user_id, lookup) in lookups {
            match lookup {
                Ok(devices) if devices.is_empty() => {
                    report.unreached.push(UnreachedRecipient {
                        user_id: user_id.clone(),
                        reason: NO_ENABLED_DEVICES.to_string(),
                    });
                }
                Ok(devices) => {
                    with_devices.push(user_id.clone());
                    for device in devices {
                        pending.push(PendingSend {
                            user_id: user_id.clone(),
                            device_id: device.device_id.clone(),
                            handle: self.spawn_send(device, payload.clone()),
                        });
                    }
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Device lookup failed for recipient");
                    report.unreached.push(UnreachedRecipient {
                        user_id: user_id.clone(),
                        reason: format!("registry_error: {e}"),
                    });
                }
            }
        }

        let finished = join_all(pending.into_iter().map(|send| async move {
            let result = match send.handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(failure)) => Err(failure.to_string()),
                Err(join_error) if join_error.is_panic() => {
                    Err(DeliveryFailure::transport("send task panicked").to_string())
                }
                Err(_) => Err(DeliveryFailure::transport("send task cancelled").to_string()),
            };
            (send.user_id, send.device_id, result)
        }))
        .await;

        let mut reached: HashSet<UserId> = HashSet::new();
        for (user_id, device_id, result) in finished {
            if result.is_ok() {
                reached.insert(user_id.clone());
            }
            report.record(user_id, device_id, result);
        }

        for user_id in with_devices {
            if !reached.contains(&user_id) {
                report.unreached.push(UnreachedRecipient {
                    user_id,
                    reason: ALL_DEVICES_FAILED.to_string(),
                });
            }
        }
        report.recipients_reached = reached.len();

        metrics::PUSH_SENT.inc_by(report.successful as f64);
        metrics::PUSH_FAILED.inc_by(report.failed as f64);
        metrics::RECIPIENTS_UNREACHED.inc_by(report.unreached.len() as f64);
        metrics::DISPATCH_TIME.observe(started.elapsed().as_secs_f64());

        info!(
            event_type = %event.kind,
            actor_id = %event.actor_id,
            recipients = report.total_recipients,
            reached = report.recipients_reached,
            successful = report.successful,
            failed = report.failed,
            "Fan-out complete"
        );
        Ok(report)
    }

    // Each send runs in its own task so a panicking transport call only
    // takes down that one device's outcome.
    fn spawn_send(
        &self,
        device: Device,
        payload: Arc<Payload>,
    ) -> JoinHandle<Result<(), DeliveryFailure>> {
        let transport = self.transport.clone();
        let permits = self.send_permits.clone();
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| DeliveryFailure::transport("send limiter closed"))?;
            transport.send(&device, &payload).await
        })
    }
}
