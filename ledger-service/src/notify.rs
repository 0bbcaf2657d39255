use std::time::Duration;

use ledger_shared::StockChanged;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Receives stock events after their unit of work committed.
///
/// `publish` must return immediately: delivery is best-effort and is never
/// awaited by the caller.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: StockChanged);
}

/// In-process fan-out, e.g. for a websocket hub.
#[derive(Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<StockChanged>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StockChanged> {
        self.sender.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(&self, event: StockChanged) {
        // No subscribers is not an error.
        if self.sender.send(event).is_err() {
            debug!("stock event dropped, nobody is listening");
        }
    }
}

pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaSink {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }
}

impl NotificationSink for KafkaSink {
    fn publish(&self, event: StockChanged) {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        tokio::spawn(async move {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode stock event for {}: {}", event.product_id, e);
                    return;
                }
            };
            let key = event.product_id.to_string();
            let record = FutureRecord::to(&topic).payload(&json).key(&key);
            if let Err((e, _)) = producer.send(record, Duration::from_secs(5)).await {
                warn!("Failed to publish stock event for {}: {}", event.product_id, e);
            }
        });
    }
}
