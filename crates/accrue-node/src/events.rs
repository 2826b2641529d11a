//! Channel-backed event bus with per-send delivery confirmation.
//!
//! [`ChannelPublisher`] hands each event to a consumer task together with a
//! oneshot acknowledgement channel and waits for the ack. The consumer is a
//! sink function: the daemon ships events to the log, tests collect them.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use accrue_core::error::PublishError;
use accrue_core::traits::EventPublisher;
use accrue_core::types::Event;

/// One event in flight plus the channel its confirmation goes back on.
#[derive(Debug)]
pub struct Delivery {
    pub event: Event,
    pub ack: oneshot::Sender<Result<(), PublishError>>,
}

#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<Delivery>,
    timeout: Duration,
}

impl ChannelPublisher {
    /// Create a publisher and the receiving end a sink task drains.
    pub fn channel(capacity: usize, timeout: Duration) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, timeout }, rx)
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: Event) -> Result<(), PublishError> {
        let kind = event.kind();
        let user_id = event.user_id();
        let (ack, confirmed) = oneshot::channel();
        let delivery = Delivery { event, ack };

        let roundtrip = async {
            self.tx.send(delivery).await.map_err(|_| PublishError::Closed)?;
            confirmed.await.map_err(|_| PublishError::Unconfirmed { kind, user_id })?
        };
        match tokio::time::timeout(self.timeout, roundtrip).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout),
        }
    }
}

/// Drain `rx`, passing each event to `sink` and acknowledging with its result.
///
/// Returns the number of confirmed deliveries once every sender is dropped.
pub fn spawn_sink<F>(mut rx: mpsc::Receiver<Delivery>, mut sink: F) -> JoinHandle<u64>
where
    F: FnMut(&Event) -> Result<(), PublishError> + Send + 'static,
{
    tokio::spawn(async move {
        let mut delivered = 0u64;
        while let Some(Delivery { event, ack }) = rx.recv().await {
            let result = sink(&event);
            if result.is_ok() {
                delivered += 1;
            }
            if ack.send(result).is_err() {
                warn!(kind = event.kind(), user_id = event.user_id(), "publisher went away before ack");
            }
        }
        delivered
    })
}

/// Sink that writes each event as a JSON line at `debug`.
pub fn log_sink(event: &Event) -> Result<(), PublishError> {
    let payload = serde_json::to_string(event).map_err(|e| PublishError::Rejected(e.to_string()))?;
    debug!(target: "accrue::events", kind = event.kind(), user_id = event.user_id(), %payload, "event");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    fn event(user_id: u64) -> Event {
        Event::ExtraBonusAvailable { user_id, available_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap() }
    }

    #[tokio::test]
    async fn publish_waits_for_ack() {
        let (publisher, rx) = ChannelPublisher::channel(4, Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = spawn_sink(rx, move |e| {
            sink_seen.lock().push(e.clone());
            Ok(())
        });

        publisher.publish_all(vec![event(1), event(2)]).await.unwrap();
        assert_eq!(seen.lock().iter().map(Event::user_id).collect::<Vec<_>>(), vec![1, 2]);

        drop(publisher);
        assert_eq!(sink.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejection_is_returned_to_sender() {
        let (publisher, rx) = ChannelPublisher::channel(1, Duration::from_secs(1));
        let _sink = spawn_sink(rx, |_| Err(PublishError::Rejected("full".into())));
        assert_eq!(publisher.publish(event(3)).await, Err(PublishError::Rejected("full".into())));
    }

    #[tokio::test]
    async fn closed_bus_fails() {
        let (publisher, rx) = ChannelPublisher::channel(1, Duration::from_secs(1));
        drop(rx);
        assert_eq!(publisher.publish(event(4)).await, Err(PublishError::Closed));
    }

    #[tokio::test]
    async fn dropped_ack_is_unconfirmed() {
        let (publisher, mut rx) = ChannelPublisher::channel(1, Duration::from_secs(1));
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                drop(delivery.ack);
            }
        });
        assert_eq!(
            publisher.publish(event(5)).await,
            Err(PublishError::Unconfirmed { kind: "extra_bonus_available", user_id: 5 })
        );
    }

    #[tokio::test]
    async fn silent_consumer_times_out() {
        let (publisher, _rx) = ChannelPublisher::channel(1, Duration::from_millis(20));
        assert_eq!(publisher.publish(event(6)).await, Err(PublishError::Timeout));
    }

    #[test]
    fn log_sink_accepts_every_event() {
        assert!(log_sink(&event(7)).is_ok());
    }
}
