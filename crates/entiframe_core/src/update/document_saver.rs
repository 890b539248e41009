//! Document store save: one write per changed document.

use super::document_source::{refresh_snapshots, DocumentSource};
use crate::config::Config;
use crate::error::{CoreError, CoreResult, StoreError};
use crate::metadata::ETAG_PROPERTY;
use crate::storage::{DocumentClient, StoredDocument};
use crate::tracking::{EntityState, StateManager};
use crate::types::{EntityTypeId, EntryId};
use entiframe_codec::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
enum DocumentWrite {
    Create {
        document: Value,
    },
    Replace {
        id: String,
        document: Value,
        if_match: Option<String>,
    },
    Delete {
        id: String,
        if_match: Option<String>,
    },
}

impl DocumentWrite {
    fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Replace { .. } => "replace",
            Self::Delete { .. } => "delete",
        }
    }
}

/// The write for one document root and the entries it persists.
#[derive(Debug)]
struct PlannedWrite {
    root: EntryId,
    container: String,
    entries: Vec<EntryId>,
    write: Option<DocumentWrite>,
}

/// Saves tracked changes to a document store.
///
/// Changed entries are grouped by the document that holds them. Each group is
/// written with a single create, replace or delete; groups whose document is
/// unchanged are accepted without a write. Writes run in tracking order and
/// each group is accepted as soon as its write succeeds.
#[derive(Debug, Clone, Default)]
pub struct DocumentSaver {
    sensitive_data_logging: bool,
}

impl DocumentSaver {
    /// Creates a saver.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            sensitive_data_logging: config.sensitive_data_logging,
        }
    }

    /// Saves every pending change. Returns the number of entries persisted.
    pub fn save(&self, state: &mut StateManager, client: &dyn DocumentClient) -> CoreResult<usize> {
        let plan = self.plan(state)?;
        let mut saved = 0;
        for planned in plan {
            let outcome = match &planned.write {
                None => None,
                Some(write) => {
                    self.log_write(&planned, write);
                    Some(run(client, &planned.container, write.clone()))
                }
            };
            saved += finish(state, &planned, outcome)?;
        }
        debug!(entries = saved, "document save complete");
        Ok(saved)
    }

    /// Async [`DocumentSaver::save`]. Cancellation is checked before every
    /// document write; the tracker is not locked while a write is in flight.
    pub async fn save_async(
        &self,
        state: &Mutex<StateManager>,
        client: &dyn DocumentClient,
        cancel: &CancellationToken,
    ) -> CoreResult<usize> {
        let plan = self.plan(&mut state.lock())?;
        let mut saved = 0;
        for planned in plan {
            let outcome = match &planned.write {
                None => None,
                Some(write) => {
                    if cancel.is_cancelled() {
                        debug!(saved, "document save cancelled");
                        return Err(CoreError::Cancelled);
                    }
                    self.log_write(&planned, write);
                    Some(run_async(client, &planned.container, write.clone()).await)
                }
            };
            saved += finish(&mut state.lock(), &planned, outcome)?;
        }
        debug!(entries = saved, "document save complete");
        Ok(saved)
    }

    fn log_write(&self, planned: &PlannedWrite, write: &DocumentWrite) {
        debug!(
            container = %planned.container,
            root = %planned.root,
            operation = write.name(),
            "writing document"
        );
        if self.sensitive_data_logging {
            if let DocumentWrite::Create { document } | DocumentWrite::Replace { document, .. } = write {
                trace!(document = %document, "document body");
            }
        }
    }

    fn plan(&self, state: &mut StateManager) -> CoreResult<Vec<PlannedWrite>> {
        let mut order: Vec<EntryId> = Vec::new();
        let mut groups: HashMap<EntryId, Vec<EntryId>> = HashMap::new();
        for id in state.entries_to_save() {
            let mut root = state.document_root_of(id)?;
            let root_entry = state.entry(root)?;
            if root_entry.state() == EntityState::Deleted {
                if let Some(partner) = root_entry.shared_identity() {
                    root = partner;
                }
            }
            groups
                .entry(root)
                .or_insert_with(|| {
                    order.push(root);
                    Vec::new()
                })
                .push(id);
        }

        let mut sources: HashMap<EntityTypeId, DocumentSource> = HashMap::new();
        let mut plan = Vec::with_capacity(order.len());
        for root in order {
            let mut entries = groups.remove(&root).unwrap_or_default();
            if !entries.contains(&root) {
                entries.insert(0, root);
            }
            let entity_type = state.entry(root)?.entity_type();
            let source = match sources.get(&entity_type) {
                Some(source) => source.clone(),
                None => {
                    let source = DocumentSource::new(state.model(), entity_type)?;
                    sources.insert(entity_type, source.clone());
                    source
                }
            };
            let write = plan_write(state, &source, root)?;
            plan.push(PlannedWrite {
                root,
                container: source.container().to_string(),
                entries,
                write,
            });
        }
        Ok(plan)
    }
}

fn plan_write(state: &mut StateManager, source: &DocumentSource, root: EntryId) -> CoreResult<Option<DocumentWrite>> {
    let entry = state.entry(root)?;
    let entry_state = entry.state();
    let partner = entry.shared_identity();
    let snapshot = entry.document().cloned();
    Ok(match (entry_state, partner) {
        (EntityState::Added, None) => Some(DocumentWrite::Create {
            document: source.create_document(state, root)?,
        }),
        (EntityState::Added, Some(partner)) => Some(DocumentWrite::Replace {
            id: source.id(state, root)?,
            if_match: etag(state, partner)?,
            document: source.create_document(state, root)?,
        }),
        (EntityState::Deleted, _) => Some(DocumentWrite::Delete {
            id: source.id(state, root)?,
            if_match: etag(state, root)?,
        }),
        _ => {
            let document = match snapshot {
                Some(snapshot) => source.update_document(state, &snapshot, root)?,
                None => Some(source.create_document(state, root)?),
            };
            match document {
                Some(document) => Some(DocumentWrite::Replace {
                    id: source.id(state, root)?,
                    if_match: etag(state, root)?,
                    document,
                }),
                None => {
                    trace!(root = %root, "document unchanged, write skipped");
                    None
                }
            }
        }
    })
}

/// The etag the entry was read with.
fn etag(state: &StateManager, id: EntryId) -> CoreResult<Option<String>> {
    let entry = state.entry(id)?;
    let ty = state.model().entity_type(entry.entity_type());
    Ok(ty
        .properties()
        .iter()
        .position(|p| p.store_name() == Some(ETAG_PROPERTY))
        .and_then(|index| entry.original_value(index).as_text())
        .map(str::to_string))
}

fn run(client: &dyn DocumentClient, container: &str, write: DocumentWrite) -> Result<Option<StoredDocument>, StoreError> {
    match write {
        DocumentWrite::Create { document } => client.create_item(container, document).map(Some),
        DocumentWrite::Replace { id, document, if_match } => client
            .replace_item(container, &id, document, if_match.as_deref())
            .map(Some),
        DocumentWrite::Delete { id, if_match } => client
            .delete_item(container, &id, if_match.as_deref())
            .map(|()| None),
    }
}

async fn run_async(
    client: &dyn DocumentClient,
    container: &str,
    write: DocumentWrite,
) -> Result<Option<StoredDocument>, StoreError> {
    match write {
        DocumentWrite::Create { document } => client.create_item_async(container, document).await.map(Some),
        DocumentWrite::Replace { id, document, if_match } => client
            .replace_item_async(container, &id, document, if_match.as_deref())
            .await
            .map(Some),
        DocumentWrite::Delete { id, if_match } => client
            .delete_item_async(container, &id, if_match.as_deref())
            .await
            .map(|()| None),
    }
}

/// Applies a write's outcome and accepts the group's entries.
fn finish(
    state: &mut StateManager,
    planned: &PlannedWrite,
    outcome: Option<Result<Option<StoredDocument>, StoreError>>,
) -> CoreResult<usize> {
    match outcome {
        None => {}
        Some(Err(StoreError::PreconditionFailed { .. } | StoreError::NotFound { .. })) => {
            warn!(container = %planned.container, root = %planned.root, "document concurrency conflict");
            return Err(CoreError::ConcurrencyConflict {
                entries: planned.entries.clone(),
                expected: 1,
                actual: 0,
            });
        }
        Some(Err(err)) => return Err(err.into()),
        Some(Ok(None)) => {}
        Some(Ok(Some(stored))) => {
            let ty = state.entity_type_of(planned.root)?;
            if let Some(index) = ty.properties().iter().position(|p| p.store_name() == Some(ETAG_PROPERTY)) {
                state.set_store_generated(planned.root, index, Value::Text(stored.etag.clone()))?;
            }
            refresh_snapshots(state, planned.root, &stored.document)?;
        }
    }
    state.accept_all(&planned.entries)?;
    Ok(planned.entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityTypeBuilder, Model, ModelBuilder, ValueKind};
    use crate::storage::InMemoryDocumentStore;
    use std::sync::Arc;

    fn model() -> Arc<Model> {
        ModelBuilder::document()
            .entity(
                EntityTypeBuilder::new("Order")
                    .container("Orders")
                    .property("Id", ValueKind::Text)
                    .property("Status", ValueKind::Text)
                    .key(["Id"])
                    .etag(),
            )
            .owns_many(
                "Order",
                "Lines",
                EntityTypeBuilder::new("Line").property("Sku", ValueKind::Text),
            )
            .build()
            .unwrap()
    }

    fn add_order(state: &mut StateManager, id: &str) -> EntryId {
        let ty = state.model().find_entity_type("Order").unwrap().id();
        let order = state.add(ty, [("Id", id), ("Status", "new")]).unwrap();
        state.add_owned(order, "Lines", [("Sku", "a")]).unwrap();
        state.add_owned(order, "Lines", [("Sku", "b")]).unwrap();
        order
    }

    #[test]
    fn create_update_and_skip_unchanged() {
        let store = InMemoryDocumentStore::new();
        let mut state = StateManager::new(model());
        let order = add_order(&mut state, "o1");
        let saver = DocumentSaver::default();

        assert_eq!(saver.save(&mut state, &store).unwrap(), 3);
        assert_eq!(store.write_count(), 1);
        let stored = store.documents("Orders").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].get("Discriminator"), Some(&Value::from("Order")));
        assert_eq!(stored[0].get("Lines").and_then(Value::as_array).map(<[_]>::len), Some(2));
        let etag = state.entry(order).unwrap().current_value(2).clone();
        assert!(etag.as_text().is_some_and(|t| t.starts_with('"')));

        state.set_value(order, "Status", "shipped").unwrap();
        assert_eq!(saver.save(&mut state, &store).unwrap(), 1);
        assert_eq!(store.write_count(), 2);
        let stored = store.documents("Orders").unwrap();
        assert_eq!(stored[0].get("Status"), Some(&Value::from("shipped")));
        assert_ne!(state.entry(order).unwrap().current_value(2), &etag);

        // a value set back to what is stored does not write
        state.set_value(order, "Status", "shipped").unwrap();
        assert_eq!(saver.save(&mut state, &store).unwrap(), 0);
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn stale_etag_is_a_conflict() {
        let store = InMemoryDocumentStore::new();
        let model = model();
        let mut state = StateManager::new(Arc::clone(&model));
        let order = add_order(&mut state, "o1");
        let saver = DocumentSaver::default();
        saver.save(&mut state, &store).unwrap();

        let mut other = StateManager::new(Arc::clone(&model));
        let ty = model.find_entity_type("Order").unwrap().id();
        let stale = other
            .attach(ty, [("Id", "o1"), ("Status", "new"), ("_etag", "\"0000\"")])
            .unwrap();
        other.set_value(stale, "Status", "lost").unwrap();
        let err = saver.save(&mut other, &store).unwrap_err();
        assert!(matches!(err, CoreError::ConcurrencyConflict { ref entries, .. } if entries == &[stale]));
        assert_eq!(other.entry(stale).unwrap().state(), EntityState::Modified);

        state.remove(order).unwrap();
        assert_eq!(saver.save(&mut state, &store).unwrap(), 3);
        assert!(store.documents("Orders").unwrap().is_empty());
        assert!(state.is_empty());
    }

    #[test]
    fn duplicate_id_passes_store_conflict_through() {
        let store = InMemoryDocumentStore::new();
        let saver = DocumentSaver::default();
        let mut first = StateManager::new(model());
        add_order(&mut first, "o1");
        saver.save(&mut first, &store).unwrap();
        let mut second = StateManager::new(model());
        add_order(&mut second, "o1");
        let err = saver.save(&mut second, &store).unwrap_err();
        assert!(matches!(err, CoreError::Store(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn async_save_checks_cancellation_per_document() {
        let store = InMemoryDocumentStore::new();
        let state = Mutex::new(StateManager::new(model()));
        add_order(&mut state.lock(), "o1");
        add_order(&mut state.lock(), "o2");
        let saver = DocumentSaver::default();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = saver.save_async(&state, &store, &cancel).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert_eq!(store.write_count(), 0);

        let saved = saver
            .save_async(&state, &store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(saved, 6);
        assert_eq!(store.documents("Orders").unwrap().len(), 2);
    }
}
