//! Sync and async enumeration yield the same results; cancellation stops
//! fetching.

use entiframe_core::{CoreError, EntityInstance, Session, StoreKind, Value};
use entiframe_testkit::prelude::*;
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

fn summary(instance: &EntityInstance) -> (Value, Value, Option<Value>) {
    (
        instance.get("Id").cloned().unwrap_or(Value::Null),
        instance.get("Name").cloned().unwrap_or(Value::Null),
        instance
            .owned_one("Address")
            .and_then(|address| address.get("City"))
            .cloned(),
    )
}

fn seed(session: &Session, count: usize) {
    for i in 0..count {
        add_customer(session, &format!("c{i:02}"), &format!("Name {i}"), "Oslo");
    }
    session.save_changes().unwrap();
}

async fn assert_parity(session: &Session) {
    let query = session.query("Customer").unwrap();
    let ordered = query.clone().order_by(query.property("Id"));
    for query in [ordered.clone(), ordered.as_no_tracking()] {
        let sync: Vec<_> = session.to_list(&query).unwrap().iter().map(summary).collect();
        let streamed: Vec<EntityInstance> = session
            .execute_async(&query, CancellationToken::new())
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let streamed: Vec<_> = streamed.iter().map(summary).collect();
        assert_eq!(sync.len(), 6);
        assert_eq!(sync, streamed);
    }
}

#[tokio::test]
async fn document_enumeration_parity() {
    let fixture = DocumentFixture::new(customers_model(StoreKind::Document));
    seed(&fixture.session, 6);
    assert_parity(&fixture.session).await;
}

#[tokio::test]
async fn relational_enumeration_parity() {
    let fixture = RelationalFixture::new(customers_model(StoreKind::Relational));
    seed(&fixture.session, 6);
    assert_parity(&fixture.session).await;
}

#[tokio::test]
async fn cancelling_mid_stream_stops_fetching() {
    let fixture = DocumentFixture::new(customers_model(StoreKind::Document));
    seed(&fixture.session, 6);
    let before = fixture.store.rows_fetched();

    let cancel = CancellationToken::new();
    let query = fixture.session.query("Customer").unwrap().as_no_tracking();
    let mut stream = fixture.session.execute_async(&query, cancel.clone()).unwrap();
    assert!(stream.next().await.unwrap().is_ok());
    assert!(stream.next().await.unwrap().is_ok());

    cancel.cancel();
    assert!(matches!(stream.next().await, Some(Err(CoreError::Cancelled))));
    assert!(stream.next().await.is_none());
    assert_eq!(fixture.store.rows_fetched() - before, 2);
}

#[tokio::test]
async fn cancelled_before_start_fetches_nothing() {
    let fixture = RelationalFixture::new(customers_model(StoreKind::Relational));
    seed(&fixture.session, 3);
    let before = fixture.store.rows_fetched();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let query = fixture.session.query("Customer").unwrap();
    let results: Vec<_> = fixture
        .session
        .execute_async(&query, cancel)
        .unwrap()
        .collect()
        .await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(CoreError::Cancelled)));
    assert_eq!(fixture.store.rows_fetched(), before);
}

#[tokio::test]
async fn async_saves_match_sync_saves() {
    for kind in [StoreKind::Document, StoreKind::Relational] {
        let sync = IntegrationHarness::new(kind);
        let async_fixture = match kind {
            StoreKind::Document => DocumentFixture::new(customers_model(kind)).session,
            StoreKind::Relational => RelationalFixture::new(customers_model(kind)).session,
        };

        for session in [sync.session(), &async_fixture] {
            add_customer(session, "c1", "Ann", "Oslo");
            add_customer(session, "c2", "Bob", "Rome");
        }
        let saved_sync = sync.session().save_changes().unwrap();
        let saved_async = async_fixture
            .save_changes_async(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(saved_sync, saved_async);
        assert!(!async_fixture.state().has_changes());

        let query = async_fixture.query("Customer").unwrap().as_no_tracking();
        let stored = async_fixture.to_list(&query).unwrap();
        assert_eq!(stored.len(), 2);
    }
}

#[tokio::test]
async fn cancelled_save_writes_nothing_and_keeps_changes() {
    let fixture = DocumentFixture::new(customers_model(StoreKind::Document));
    let customer = add_customer(&fixture.session, "c1", "Ann", "Oslo");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = fixture.session.save_changes_async(&cancel).await.unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert_eq!(fixture.store.write_count(), 0);
    assert_eq!(
        fixture.session.state().entry(customer).unwrap().state(),
        entiframe_core::EntityState::Added
    );

    let saved = fixture
        .session
        .save_changes_async(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(saved, 2);
    assert_eq!(fixture.store.write_count(), 1);
}
