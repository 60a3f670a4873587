// Wire encode/decode cost for event envelopes

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use event_bus::{DomainEvent, EventEnvelope, EventRegistry, Serializable};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InvoiceIssued {
    invoice_id: String,
    customer_id: String,
    amount_cents: i64,
    currency: String,
    line_items: Vec<String>,
}

impl DomainEvent for InvoiceIssued {
    const EVENT_TYPE: &'static str = "InvoiceIssued";
}

fn sample() -> EventEnvelope<InvoiceIssued> {
    EventEnvelope::new(InvoiceIssued {
        invoice_id: "inv_0001".to_string(),
        customer_id: "cus_0042".to_string(),
        amount_cents: 129_900,
        currency: "usd".to_string(),
        line_items: (0..8).map(|i| format!("sku_{}", i)).collect(),
    })
    .with_aggregate_id(Some("inv_0001".to_string()))
}

fn bench_envelope(c: &mut Criterion) {
    let event = sample();
    let wire = event.to_wire().unwrap();
    let bytes = serde_json::to_vec(&wire).unwrap();

    let registry = EventRegistry::new();
    registry.register::<InvoiceIssued>();

    c.bench_function("envelope_to_wire", |b| {
        b.iter(|| black_box(&event).to_wire().unwrap());
    });

    c.bench_function("envelope_from_wire_typed", |b| {
        b.iter(|| EventEnvelope::<InvoiceIssued>::from_wire(black_box(&wire)).unwrap());
    });

    c.bench_function("registry_construct_from_bytes", |b| {
        b.iter(|| {
            let value: serde_json::Value = serde_json::from_slice(black_box(&bytes)).unwrap();
            registry.construct_from_wire(&value).unwrap()
        });
    });
}

criterion_group!(benches, bench_envelope);
criterion_main!(benches);
