//! In-process stand-in for the push transport used with the memory backend.
//!
//! Each delivery runs on its own task, so items are processed concurrently
//! and out of order, and retryable failures are redelivered with backoff.

use crate::config::HarvestConfig;
use crate::models::PubsubMessage;
use crate::pipeline::{EnrichmentPipeline, IngestionPipeline, ObjectEvent, encode_message};
use rand::Rng;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub enum BusEvent {
    AdvertPublished { message_id: String, payload: Vec<u8> },
    ObjectFinalized(ObjectEvent),
}

impl BusEvent {
    fn label(&self) -> &'static str {
        match self {
            BusEvent::AdvertPublished { .. } => "advert_published",
            BusEvent::ObjectFinalized(_) => "object_finalized",
        }
    }
}

#[derive(Debug)]
struct Delivery {
    event: BusEvent,
    attempt: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BusStats {
    pub delivered: u64,
    pub redelivered: u64,
    pub dropped: u64,
}

#[derive(Clone)]
pub struct LocalBus {
    tx: mpsc::UnboundedSender<Delivery>,
    stats: Arc<Mutex<BusStats>>,
}

pub struct BusReceiver {
    rx: mpsc::UnboundedReceiver<Delivery>,
    bus: LocalBus,
}

impl LocalBus {
    pub fn channel() -> (Self, BusReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self {
            tx,
            stats: Arc::default(),
        };
        (bus.clone(), BusReceiver { rx, bus })
    }

    pub fn emit(&self, event: BusEvent) {
        self.send(Delivery { event, attempt: 1 });
    }

    pub async fn stats(&self) -> BusStats {
        *self.stats.lock().await
    }

    fn send(&self, delivery: Delivery) {
        if let Err(err) = self.tx.send(delivery) {
            warn!(target = "harvest.bus", event = err.0.event.label(), "bus_closed_event_lost");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RedeliveryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RedeliveryPolicy {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            max_attempts: config.bus_max_attempts,
            base_backoff: config.bus_backoff,
        }
    }

    /// Exponential in the attempt number with up to half a base step of jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let jitter = if base > 1 {
            rand::rng().random_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

/// Routes bus events to the pipeline a real trigger would invoke.
#[derive(Clone)]
pub struct EventRouter {
    ingest: IngestionPipeline,
    enrich: EnrichmentPipeline,
    policy: RedeliveryPolicy,
}

impl EventRouter {
    pub fn new(
        ingest: IngestionPipeline,
        enrich: EnrichmentPipeline,
        policy: RedeliveryPolicy,
    ) -> Self {
        Self {
            ingest,
            enrich,
            policy,
        }
    }

    async fn deliver(&self, delivery: Delivery, bus: &LocalBus) {
        let result = match &delivery.event {
            BusEvent::AdvertPublished {
                message_id,
                payload,
            } => {
                let message = PubsubMessage {
                    data: Some(encode_message(payload)),
                    message_id: Some(message_id.clone()),
                    ..Default::default()
                };
                self.ingest.run(&message).await.map(|_| ())
            }
            BusEvent::ObjectFinalized(event) => self
                .enrich
                .run(format!("object-{}", event.name), event.clone())
                .await
                .map(|_| ()),
        };

        let event = delivery.event.label();
        let Err(err) = result else {
            bus.stats.lock().await.delivered += 1;
            debug!(target = "harvest.bus", event, attempt = delivery.attempt, "delivered");
            return;
        };

        if err.is_retryable() && delivery.attempt < self.policy.max_attempts {
            let delay = self.policy.backoff(delivery.attempt);
            warn!(
                target = "harvest.bus",
                event,
                attempt = delivery.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "redelivery_scheduled"
            );
            bus.stats.lock().await.redelivered += 1;
            sleep(delay).await;
            bus.send(Delivery {
                event: delivery.event,
                attempt: delivery.attempt + 1,
            });
        } else {
            error!(target = "harvest.bus", event, attempt = delivery.attempt, error = %err, "delivery_dropped");
            bus.stats.lock().await.dropped += 1;
        }
    }
}

impl BusReceiver {
    pub fn spawn(self, router: EventRouter) -> JoinHandle<()> {
        let BusReceiver { mut rx, bus } = self;
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let router = router.clone();
                let bus = bus.clone();
                tokio::spawn(async move { router.deliver(delivery, &bus).await });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advert::ImageReferenceResolver;
    use crate::backends::Annotation;
    use crate::memory::MemoryBackends;
    use crate::pipeline::SearchDispatchPipeline;
    use crate::pipeline::enrich::DEFAULT_MIN_CONFIDENCE;
    use serde_json::json;
    use tokio::time::timeout;

    fn policy() -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(5),
        }
    }

    fn start(memory: &MemoryBackends, receiver: BusReceiver) -> JoinHandle<()> {
        let backends = memory.backends();
        let router = EventRouter::new(
            IngestionPipeline::new(&backends, ImageReferenceResolver::default()),
            EnrichmentPipeline::new(&backends, DEFAULT_MIN_CONFIDENCE),
            policy(),
        );
        receiver.spawn(router)
    }

    async fn wait_for<F, Fut>(mut done: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(5), async {
            while !done().await {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("bus settled in time");
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let policy = RedeliveryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
        };
        let first = policy.backoff(1);
        let third = policy.backoff(3);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn search_fans_out_through_ingestion_into_enrichment() {
        let (bus, receiver) = LocalBus::channel();
        let memory = MemoryBackends::with_bus(Some(bus.clone()));
        memory
            .classifier
            .respond(vec![Annotation { label: "Camera".into(), score: 0.97 }], vec![])
            .await;
        memory
            .search
            .respond(
                ["AAAAAAAAAAAAAAAA", "BBBBBBBBBBBBBBBB", "CCCCCCCCCCCCCCCC"]
                    .iter()
                    .enumerate()
                    .map(|(i, token)| {
                        json!({
                            "itemId": [i.to_string()],
                            "galleryURL": [format!("https://i.ebayimg.com/thumbs/images/g/{token}/s-l140.jpg")]
                        })
                    })
                    .collect(),
            )
            .await;
        let _worker = start(&memory, receiver);

        let message = PubsubMessage {
            data: Some(encode_message(br#"{"q":"vintage camera"}"#)),
            ..Default::default()
        };
        SearchDispatchPipeline::new(&memory.backends())
            .run(&message)
            .await
            .unwrap();

        // three adverts plus three finalized images
        let watched = bus.clone();
        wait_for(|| {
            let bus = watched.clone();
            async move { bus.stats().await.delivered == 6 }
        })
        .await;
        let adverts = memory.store.snapshot().await;
        assert_eq!(adverts.len(), 3);
        assert!(adverts.iter().all(|a| a.machine_learning.is_some()));
        assert_eq!(memory.objects.len().await, 3);
    }

    #[tokio::test]
    async fn enrichment_before_record_is_redelivered_then_dropped() {
        let (bus, receiver) = LocalBus::channel();
        let memory = MemoryBackends::with_bus(Some(bus.clone()));
        memory
            .classifier
            .respond(vec![Annotation { label: "Camera".into(), score: 0.97 }], vec![])
            .await;
        let _worker = start(&memory, receiver);

        bus.emit(BusEvent::ObjectFinalized(ObjectEvent {
            bucket: "memory-bucket".into(),
            name: crate::advert::RecordIdentity::generate().to_string(),
            event_type: None,
        }));

        let watched = bus.clone();
        wait_for(|| {
            let bus = watched.clone();
            async move { bus.stats().await.dropped == 1 }
        })
        .await;
        let stats = bus.stats().await;
        assert_eq!(stats.redelivered, 2);
        assert_eq!(stats.delivered, 0);
        assert_eq!(memory.store.len().await, 0);
    }
}
