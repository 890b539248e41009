//! Benchmark utilities.

#![warn(missing_docs)]

use entiframe_core::{Session, StoreKind, Value};
use entiframe_testkit::{add_customer, add_order, customers_model, DocumentFixture, RelationalFixture};
use rand::Rng;

const CITIES: [&str; 6] = ["Oslo", "Rome", "Lima", "Kyiv", "Doha", "Pune"];

/// A random city name from a small fixed set.
pub fn random_city(rng: &mut impl Rng) -> &'static str {
    CITIES[rng.gen_range(0..CITIES.len())]
}

/// A customer document with `lines` nested order lines, as a store would hold it.
pub fn customer_document(lines: usize) -> Value {
    let mut rng = rand::thread_rng();
    let lines: Vec<Value> = (0..lines)
        .map(|i| {
            Value::object([
                ("Sku", Value::Text(format!("SKU-{i:04}"))),
                ("Quantity", Value::Integer(rng.gen_range(1..100))),
            ])
        })
        .collect();
    Value::object([
        ("id", Value::from("c1")),
        ("Name", Value::from("Alice")),
        ("Discriminator", Value::from("Customer")),
        (
            "Address",
            Value::object([("Street", "1 Main St"), ("City", random_city(&mut rng))]),
        ),
        ("Lines", Value::Array(lines)),
    ])
}

/// Opens a customers-model session over an empty in-memory store of `kind`.
pub fn customers_session(kind: StoreKind) -> Session {
    let model = customers_model(kind);
    match kind {
        StoreKind::Document => DocumentFixture::new(model).session,
        StoreKind::Relational => RelationalFixture::new(model).session,
    }
}

/// Tracks `customers` new customers, each with one order of `lines` lines.
pub fn populate(session: &Session, customers: usize, lines: usize) {
    let mut rng = rand::thread_rng();
    let order_lines: Vec<(String, i64)> = (0..lines)
        .map(|i| (format!("SKU-{i:04}"), rng.gen_range(1..100)))
        .collect();
    let order_lines: Vec<(&str, i64)> = order_lines.iter().map(|(s, q)| (s.as_str(), *q)).collect();
    for i in 0..customers {
        let customer = add_customer(session, &format!("c{i}"), "Customer", random_city(&mut rng));
        add_order(session, &format!("o{i}"), customer, &order_lines);
    }
}
