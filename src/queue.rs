use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::dispatcher::{DeliveryReport, FanOutDispatcher};
use crate::metrics;
use crate::models::NotificationEvent;
use crate::store::Store;
use crate::transport::PushTransport;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("dispatch queue is full")]
    Full,
    #[error("dispatch queue is closed")]
    Closed,
}

/// Producer half handed to whatever triggers notifications. Submitting never
/// waits: a full queue drops the event.
#[derive(Clone)]
pub struct DispatchQueue {
    sender: mpsc::Sender<NotificationEvent>,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NotificationEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn submit(&self, event: NotificationEvent) -> Result<(), QueueError> {
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::EVENTS_REJECTED.inc();
                warn!(
                    event_type = %event.kind,
                    actor_id = %event.actor_id,
                    "Dispatch queue full, dropping event"
                );
                Err(QueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                metrics::EVENTS_REJECTED.inc();
                warn!(
                    event_type = %event.kind,
                    actor_id = %event.actor_id,
                    "Dispatch queue closed, dropping event"
                );
                Err(QueueError::Closed)
            }
        }
    }
}

/// Drains the queue until every producer is dropped, then waits for the
/// fan-outs still in flight. Finished reports go to `reports` when given.
pub async fn run_dispatch_worker<S, T>(
    mut receiver: mpsc::Receiver<NotificationEvent>,
    dispatcher: Arc<FanOutDispatcher<S, T>>,
    reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
) where
    S: Store,
    T: PushTransport + 'static,
{
    info!("Starting dispatch worker");
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            next = receiver.recv() => {
                let Some(event) = next else { break };
                let dispatcher = dispatcher.clone();
                let reports = reports.clone();
                let span = tracing::info_span!("dispatch", dispatch_id = %Uuid::new_v4());

                in_flight.spawn(
                    async move {
                        match dispatcher.dispatch(&event).await {
                            Ok(report) => {
                                if let Some(reports) = reports {
                                    let _ = reports.send(report);
                                }
                            }
                            Err(e) => {
                                debug!(
                                    event_type = %event.kind,
                                    error = %e,
                                    "Dropping malformed event"
                                );
                            }
                        }
                    }
                    .instrument(span),
                );
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join_error(joined);
            }
        }
    }

    info!(in_flight = in_flight.len(), "Dispatch queue closed, finishing in-flight events");
    while let Some(joined) = in_flight.join_next().await {
        log_join_error(joined);
    }
    info!("Dispatch worker exiting");
}

fn log_join_error(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Dispatch task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::{MemoryStore, UserRecord};
    use crate::models::{Device, EventKind, Payload, Platform, Subject};
    use crate::payload::PayloadBuilder;
    use crate::store::{DeviceRegistration, DeviceRegistry};
    use crate::transport::DeliveryFailure;
    use std::time::Duration;

    struct AcceptAll;

    impl PushTransport for AcceptAll {
        async fn send(&self, _device: &Device, _payload: &Payload) -> Result<(), DeliveryFailure> {
            Ok(())
        }
    }

    struct SlowAccept(Duration);

    impl PushTransport for SlowAccept {
        async fn send(&self, _device: &Device, _payload: &Payload) -> Result<(), DeliveryFailure> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    async fn store_with_device(user: &str) -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_user(UserRecord::new(user, user)).await;
        store
            .register_device(user, DeviceRegistration::new("phone", Platform::Ios, "tok"))
            .await
            .unwrap();
        store
    }

    fn follow(actor: &str, target: &str) -> NotificationEvent {
        NotificationEvent::new(
            EventKind::Follow,
            actor,
            Subject {
                id: target.to_string(),
                owner_id: Some(target.to_string()),
                post_id: None,
                text: String::new(),
            },
        )
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let (queue, _receiver) = DispatchQueue::new(1);
        assert_eq!(queue.submit(follow("a", "b")), Ok(()));
        assert_eq!(queue.submit(follow("a", "c")), Err(QueueError::Full));
    }

    #[tokio::test]
    async fn closed_queue_rejects() {
        let (queue, receiver) = DispatchQueue::new(4);
        drop(receiver);
        assert_eq!(queue.submit(follow("a", "b")), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn worker_dispatches_and_publishes_reports() {
        let dispatcher = Arc::new(FanOutDispatcher::new(
            Arc::new(store_with_device("b").await),
            Arc::new(AcceptAll),
            PayloadBuilder::default(),
            4,
        ));
        let (queue, receiver) = DispatchQueue::new(8);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_dispatch_worker(receiver, dispatcher, Some(report_tx)));

        queue.submit(follow("a", "b")).unwrap();
        let report = report_rx.recv().await.unwrap();
        assert_eq!(report.event_type, EventKind::Follow);
        assert_eq!(report.recipients_reached, 1);
        assert_eq!(report.successful, 1);

        drop(queue);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_finishes_in_flight_events_before_exiting() {
        let dispatcher = Arc::new(FanOutDispatcher::new(
            Arc::new(store_with_device("b").await),
            Arc::new(SlowAccept(Duration::from_millis(300))),
            PayloadBuilder::default(),
            4,
        ));
        let (queue, receiver) = DispatchQueue::new(8);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_dispatch_worker(receiver, dispatcher, Some(report_tx)));

        queue.submit(follow("a", "b")).unwrap();
        drop(queue);
        worker.await.unwrap();

        let report = report_rx.try_recv().expect("report published before worker exit");
        assert_eq!(report.successful, 1);
    }
}
