#![allow(dead_code)]

use event_bus::{Broker, DomainEvent, EventBus, EventRegistry, InMemoryBroker};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub amount_cents: i64,
}

impl DomainEvent for OrderPlaced {
    const EVENT_TYPE: &'static str = "OrderPlaced";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: String,
    pub reason: String,
}

impl DomainEvent for OrderCancelled {
    const EVENT_TYPE: &'static str = "OrderCancelled";
}

pub fn order_placed(order_id: &str) -> OrderPlaced {
    OrderPlaced {
        order_id: order_id.to_string(),
        amount_cents: 4200,
    }
}

/// Fresh in-memory server plus a bus wired to it
pub async fn setup_bus() -> (InMemoryBroker, Arc<EventBus>) {
    let server = InMemoryBroker::new();
    let broker = Arc::new(Broker::new(Arc::new(server.clone())));
    let bus = EventBus::new(broker, EventRegistry::new())
        .await
        .expect("Failed to declare event topology");
    (server, Arc::new(bus))
}

/// Run the bus consume loop in the background
pub fn start(bus: &Arc<EventBus>) -> JoinHandle<()> {
    let runner = bus.clone();
    tokio::spawn(async move {
        runner.start().await.expect("Event bus loop failed");
    })
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
