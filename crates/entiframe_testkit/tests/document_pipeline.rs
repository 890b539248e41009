//! Document saves: embedding, ordinals, no-op detection and etags.

use entiframe_core::update::{refresh_snapshots, set_temporary_ordinals, DocumentSource};
use entiframe_core::{CoreError, EntityState, StateManager, StoreError, StoreKind, Value};
use entiframe_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;

fn keys(document: &Value) -> Vec<&str> {
    let mut keys: Vec<&str> = document
        .as_object()
        .unwrap()
        .iter()
        .map(|(k, _)| k.as_str())
        .collect();
    keys.sort_unstable();
    keys
}

#[test]
fn document_round_trip_with_embedded_reference() {
    let model = customers_model(StoreKind::Document);
    let customer_type = model.find_entity_type("Customer").unwrap().id();
    let mut state = StateManager::new(Arc::clone(&model));
    let customer = state
        .attach(customer_type, [("Id", "c1"), ("Name", "Ann")])
        .unwrap();
    state
        .attach_owned(customer, "Address", [("Street", "1 Main St"), ("City", "Oslo")])
        .unwrap();

    let source = DocumentSource::new(&model, customer_type).unwrap();
    let document = source.create_document(&mut state, customer).unwrap();
    assert_eq!(keys(&document), vec!["Address", "Discriminator", "Name", "id"]);
    let address = document.get("Address").unwrap();
    assert_eq!(keys(address), vec!["City", "Street"]);
    assert_eq!(address.get("City"), Some(&Value::from("Oslo")));

    refresh_snapshots(&mut state, customer, &document).unwrap();
    assert!(source.update_document(&mut state, &document, customer).unwrap().is_none());

    state.set_value(customer, "Name", "Anne").unwrap();
    let patched = source.update_document(&mut state, &document, customer).unwrap().unwrap();
    assert_eq!(patched.get("Name"), Some(&Value::from("Anne")));
    assert_eq!(patched.get("Address"), document.get("Address"));
}

#[test]
fn unchanged_entities_are_not_rewritten() {
    let fixture = DocumentFixture::new(customers_model(StoreKind::Document));
    let session = &fixture.session;
    let customer = add_customer(session, "c1", "Ann", "Oslo");
    add_order(session, "o1", customer, &[("ABC-001", 2)]);
    assert_eq!(session.save_changes().unwrap(), 4);
    assert_eq!(fixture.store.write_count(), 2);

    assert_eq!(session.save_changes().unwrap(), 0);
    assert_eq!(fixture.store.write_count(), 2);

    // a value written back unchanged is not a change
    session.set_value(customer, "Name", "Ann").unwrap();
    assert_eq!(session.save_changes().unwrap(), 0);
    assert_eq!(fixture.store.write_count(), 2);
}

#[test]
fn owned_changes_rewrite_only_their_document() {
    let fixture = DocumentFixture::new(customers_model(StoreKind::Document));
    let session = &fixture.session;
    let ann = add_customer(session, "c1", "Ann", "Oslo");
    add_customer(session, "c2", "Bob", "Rome");
    let order = add_order(session, "o1", ann, &[("ABC-001", 2), ("ABC-002", 1)]);
    session.save_changes().unwrap();
    let writes = fixture.store.write_count();

    let line = session.instance(order).unwrap().owned_many("Lines")[1].entry.unwrap();
    session.set_value(line, "Quantity", 5).unwrap();
    assert_eq!(session.save_changes().unwrap(), 1);
    assert_eq!(fixture.store.write_count(), writes + 1);

    let orders = fixture.store.documents("Orders").unwrap();
    let lines = orders[0].get("Lines").and_then(Value::as_array).unwrap();
    assert_eq!(lines[1].get("Quantity"), Some(&Value::Integer(5)));
    assert_eq!(lines[0].get("Quantity"), Some(&Value::Integer(2)));
}

#[test]
fn removed_reference_is_stored_as_null() {
    let fixture = DocumentFixture::new(customers_model(StoreKind::Document));
    let session = &fixture.session;
    let customer = add_customer(session, "c1", "Ann", "Oslo");
    session.save_changes().unwrap();

    let address = session.instance(customer).unwrap().owned_one("Address").unwrap().entry.unwrap();
    session.remove(address).unwrap();
    session.save_changes().unwrap();

    let stored = fixture.store.documents("Customers").unwrap();
    assert_eq!(stored[0].get("Address"), Some(&Value::Null));
    assert!(session.instance(customer).unwrap().owned_one("Address").is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn ordinals_are_assigned_once_and_kept(lines in order_lines_strategy(6)) {
        prop_assume!(!lines.is_empty());
        let fixture = DocumentFixture::new(customers_model(StoreKind::Document));
        let session = &fixture.session;
        let customer = add_customer(session, "c1", "Ann", "Oslo");
        let borrowed: Vec<(&str, i64)> = lines.iter().map(|(s, q)| (s.as_str(), *q)).collect();
        let order = add_order(session, "o1", customer, &borrowed);

        let line_type = session.model().find_entity_type("Line").unwrap();
        let ordinal = line_type.ordinal_key_property().unwrap();
        let elements: Vec<_> = session
            .instance(order)
            .unwrap()
            .owned_many("Lines")
            .iter()
            .map(|line| line.entry.unwrap())
            .collect();

        {
            let mut state = session.state();
            prop_assert!(set_temporary_ordinals(&mut state, &elements).unwrap());
            for (position, element) in elements.iter().enumerate() {
                let entry = state.entry(*element).unwrap();
                prop_assert!(entry.is_temporary(ordinal));
                prop_assert_eq!(entry.current_value(ordinal), &Value::Integer(-(position as i64) - 1));
            }
        }

        session.save_changes().unwrap();

        let mut state = session.state();
        for (position, element) in elements.iter().enumerate() {
            let entry = state.entry(*element).unwrap();
            prop_assert!(!entry.is_temporary(ordinal));
            prop_assert_eq!(entry.current_value(ordinal), &Value::Integer(position as i64 + 1));
        }
        prop_assert!(!set_temporary_ordinals(&mut state, &elements).unwrap());
        for (position, element) in elements.iter().enumerate() {
            prop_assert_eq!(
                state.entry(*element).unwrap().current_value(ordinal),
                &Value::Integer(position as i64 + 1)
            );
        }
        drop(state);

        let stored = fixture.store.documents("Orders").unwrap();
        let skus: Vec<_> = stored[0]
            .get("Lines")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .map(|line| line.get("Sku").and_then(Value::as_text).unwrap().to_string())
            .collect();
        let expected: Vec<_> = lines.iter().map(|(sku, _)| sku.clone()).collect();
        prop_assert_eq!(skus, expected);
    }
}

#[test]
fn stale_etag_surfaces_as_concurrency_conflict() {
    let fixture = DocumentFixture::new(customers_model(StoreKind::Document));
    let writer = &fixture.session;
    let customer = add_customer(writer, "c1", "Ann", "Oslo");
    writer.save_changes().unwrap();

    let reader = fixture.second_session();
    let query = reader.query("Customer").unwrap();
    let loaded = reader.to_list(&query).unwrap();
    let stale = loaded[0].entry.unwrap();
    assert!(loaded[0].get("_etag").and_then(Value::as_text).is_some());

    writer.set_value(customer, "Name", "Anne").unwrap();
    writer.save_changes().unwrap();

    reader.set_value(stale, "Name", "Annie").unwrap();
    let err = reader.save_changes().unwrap_err();
    assert!(err.is_concurrency_conflict());
    match err {
        CoreError::ConcurrencyConflict { entries, expected, actual } => {
            assert_eq!(entries, vec![stale]);
            assert_eq!((expected, actual), (1, 0));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(reader.state().entry(stale).unwrap().state(), EntityState::Modified);

    let stored = fixture.store.documents("Customers").unwrap();
    assert_eq!(stored[0].get("Name"), Some(&Value::from("Anne")));
}

#[test]
fn store_failures_pass_through_and_keep_changes_pending() {
    let fixture = DocumentFixture::new(customers_model(StoreKind::Document));
    let session = &fixture.session;
    let customer = add_customer(session, "c1", "Ann", "Oslo");

    fixture.store.fail_next(StoreError::connection("connection reset", true));
    let err = session.save_changes().unwrap_err();
    assert!(matches!(
        err,
        CoreError::Store(StoreError::Connection { transient: true, .. })
    ));
    assert_eq!(session.state().entry(customer).unwrap().state(), EntityState::Added);
    assert!(fixture.store.documents("Customers").unwrap().is_empty());

    assert_eq!(session.save_changes().unwrap(), 2);
    assert_eq!(fixture.store.documents("Customers").unwrap().len(), 1);

    fixture.store.fail_next(StoreError::Timeout);
    let query = session.query("Customer").unwrap();
    let err = session.to_list(&query).unwrap_err();
    assert!(matches!(err, CoreError::Store(StoreError::Timeout)));
}

#[test]
fn composite_keys_cannot_address_documents() {
    let model = entiframe_core::ModelBuilder::document()
        .entity(
            entiframe_core::EntityTypeBuilder::new("Reading")
                .property("Sensor", entiframe_core::ValueKind::Text)
                .property("At", entiframe_core::ValueKind::Integer)
                .key(["Sensor", "At"]),
        )
        .build()
        .unwrap();
    let reading = model.find_entity_type("Reading").unwrap().id();
    let err = DocumentSource::new(&model, reading).unwrap_err();
    assert!(matches!(err, CoreError::MissingIdProperty { .. }));

    let fixture = DocumentFixture::new(model);
    fixture
        .session
        .add("Reading", [("Sensor", Value::from("s1")), ("At", Value::Integer(1))])
        .unwrap();
    let err = fixture.session.save_changes().unwrap_err();
    assert!(matches!(err, CoreError::MissingIdProperty { .. }));
    assert_eq!(fixture.store.write_count(), 0);
}
