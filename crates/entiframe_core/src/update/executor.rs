//! Relational save: runs prepared batches in order and writes store results
//! back into the tracker.

use super::batch::{CommandBatchPreparer, ModificationCommandBatch};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::storage::{CommandResult, RelationalConnection};
use crate::tracking::StateManager;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Executes the pending changes of a tracker against a relational store.
///
/// Batches run strictly one after another. A failure stops the save; batches
/// already executed stay committed and their entries keep their pending state
/// so the caller can inspect or retry them.
#[derive(Debug, Clone)]
pub struct CommandBatchExecutor {
    preparer: CommandBatchPreparer,
    sensitive_data_logging: bool,
}

impl CommandBatchExecutor {
    /// Creates an executor using `config`'s dialect and batch caps.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            preparer: CommandBatchPreparer::new(config),
            sensitive_data_logging: config.sensitive_data_logging,
        }
    }

    /// Saves every pending change. Returns the number of entries written.
    pub fn execute(&self, state: &mut StateManager, connection: &dyn RelationalConnection) -> CoreResult<usize> {
        let entries = state.entries_to_save();
        if entries.is_empty() {
            return Ok(0);
        }
        let batches = self.preparer.prepare(state)?;
        for batch in &batches {
            let request = batch.to_request(state)?;
            self.log_batch(batch, &request);
            let results = connection.execute_batch(&request)?;
            propagate(state, batch, &results)?;
        }
        state.accept_all(&entries)?;
        debug!(entries = entries.len(), batches = batches.len(), "relational save complete");
        Ok(entries.len())
    }

    /// Async [`CommandBatchExecutor::execute`].
    ///
    /// The tracker lock is only held while building requests and applying
    /// results, never across a store call. Cancellation is checked before
    /// every batch.
    pub async fn execute_async(
        &self,
        state: &Mutex<StateManager>,
        connection: &dyn RelationalConnection,
        cancel: &CancellationToken,
    ) -> CoreResult<usize> {
        let (entries, batches) = {
            let state = state.lock();
            let entries = state.entries_to_save();
            if entries.is_empty() {
                return Ok(0);
            }
            let batches = self.preparer.prepare(&state)?;
            (entries, batches)
        };
        for batch in &batches {
            if cancel.is_cancelled() {
                debug!("relational save cancelled");
                return Err(CoreError::Cancelled);
            }
            let request = batch.to_request(&state.lock())?;
            self.log_batch(batch, &request);
            let results = connection.execute_batch_async(&request).await?;
            propagate(&mut state.lock(), batch, &results)?;
        }
        state.lock().accept_all(&entries)?;
        debug!(entries = entries.len(), batches = batches.len(), "relational save complete");
        Ok(entries.len())
    }

    fn log_batch(&self, batch: &ModificationCommandBatch, request: &crate::storage::BatchRequest) {
        debug!(
            commands = batch.len(),
            parameters = batch.parameter_count(),
            sql = %batch.sql(),
            "executing command batch"
        );
        if self.sensitive_data_logging {
            for command in &request.commands {
                trace!(
                    table = %command.table,
                    writes = ?command.write_columns,
                    conditions = ?command.conditions,
                    "command values"
                );
            }
        }
    }
}

fn propagate(state: &mut StateManager, batch: &ModificationCommandBatch, results: &[CommandResult]) -> CoreResult<()> {
    if results.len() != batch.len() {
        return Err(CoreError::invalid_operation(format!(
            "store returned {} results for a batch of {} commands",
            results.len(),
            batch.len()
        )));
    }
    for (command, result) in batch.commands().iter().zip(results) {
        if let Err(err) = command.propagate_results(state, result) {
            if err.is_concurrency_conflict() {
                warn!(command = %command, affected = result.rows_affected, "concurrency conflict");
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        EntityTypeBuilder, ForeignKeyBuilder, Model, ModelBuilder, PropertyBuilder, ValueGenerated,
        ValueKind,
    };
    use crate::storage::InMemoryRelationalStore;
    use crate::tracking::EntityState;
    use entiframe_codec::Value;
    use std::sync::Arc;

    fn model() -> Arc<Model> {
        ModelBuilder::relational()
            .entity(
                EntityTypeBuilder::new("Blog")
                    .property_with(PropertyBuilder::new("Id", ValueKind::Integer).generated(ValueGenerated::OnAdd))
                    .property("Title", ValueKind::Text)
                    .property_with(
                        PropertyBuilder::new("RowVersion", ValueKind::Bytes)
                            .nullable()
                            .concurrency_token()
                            .generated(ValueGenerated::OnAddOrUpdate),
                    )
                    .key(["Id"]),
            )
            .entity(
                EntityTypeBuilder::new("Post")
                    .property_with(PropertyBuilder::new("Id", ValueKind::Integer).generated(ValueGenerated::OnAdd))
                    .property("BlogId", ValueKind::Integer)
                    .key(["Id"]),
            )
            .foreign_key(ForeignKeyBuilder::new("Post", "Blog", ["BlogId"]).dependent_navigation("Blog"))
            .build()
            .unwrap()
    }

    fn graph(state: &mut StateManager) -> (crate::types::EntryId, crate::types::EntryId) {
        let model = Arc::clone(state.model());
        let blog = state
            .add(model.find_entity_type("Blog").unwrap().id(), [("Title", "Rust")])
            .unwrap();
        let post = state
            .add(model.find_entity_type("Post").unwrap().id(), Vec::<(&str, Value)>::new())
            .unwrap();
        state.set_reference(post, "Blog", Some(blog)).unwrap();
        (blog, post)
    }

    #[test]
    fn generated_keys_flow_into_dependents() {
        let model = model();
        let store = InMemoryRelationalStore::new(&model);
        let mut state = StateManager::new(Arc::clone(&model));
        let (blog, post) = graph(&mut state);

        let saved = CommandBatchExecutor::new(&Config::default())
            .execute(&mut state, &store)
            .unwrap();
        assert_eq!(saved, 2);
        let blog_entry = state.entry(blog).unwrap();
        assert_eq!(blog_entry.state(), EntityState::Unchanged);
        assert_eq!(blog_entry.current_value(0), &Value::Integer(1));
        assert!(!blog_entry.current_value(2).is_null());
        assert_eq!(state.entry(post).unwrap().current_value(1), &Value::Integer(1));
        assert_eq!(store.rows("Post").len(), 1);
        // principal and dependent levels are separate round trips
        assert_eq!(store.executed_batches().len(), 2);
    }

    #[test]
    fn stale_row_version_is_a_conflict() {
        let model = model();
        let store = InMemoryRelationalStore::new(&model);
        let mut state = StateManager::new(Arc::clone(&model));
        let (blog, _) = graph(&mut state);
        let executor = CommandBatchExecutor::new(&Config::default());
        executor.execute(&mut state, &store).unwrap();

        let mut other = StateManager::new(Arc::clone(&model));
        let copy = other
            .attach(
                model.find_entity_type("Blog").unwrap().id(),
                [
                    ("Id", state.entry(blog).unwrap().current_value(0).clone()),
                    ("Title", Value::from("Rust")),
                    ("RowVersion", state.entry(blog).unwrap().current_value(2).clone()),
                ],
            )
            .unwrap();
        state.set_value(blog, "Title", "Rust 2").unwrap();
        executor.execute(&mut state, &store).unwrap();

        other.set_value(copy, "Title", "Stale").unwrap();
        let err = executor.execute(&mut other, &store).unwrap_err();
        assert!(matches!(err, CoreError::ConcurrencyConflict { ref entries, .. } if entries == &[copy]));
        assert_eq!(other.entry(copy).unwrap().state(), EntityState::Modified);
    }

    #[tokio::test]
    async fn async_save_matches_sync_and_honours_cancellation() {
        let model = model();
        let store = InMemoryRelationalStore::new(&model);
        let state = Mutex::new(StateManager::new(Arc::clone(&model)));
        graph(&mut state.lock());
        let executor = CommandBatchExecutor::new(&Config::default());

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = executor.execute_async(&state, &store, &cancelled).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert!(store.executed_batches().is_empty());

        let saved = executor
            .execute_async(&state, &store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(saved, 2);
        assert!(!state.lock().has_changes());
        assert_eq!(store.rows("Blog").len(), 1);
    }

    #[test]
    fn nothing_to_save_sends_nothing() {
        let model = model();
        let store = InMemoryRelationalStore::new(&model);
        let mut state = StateManager::new(model);
        let saved = CommandBatchExecutor::new(&Config::default())
            .execute(&mut state, &store)
            .unwrap();
        assert_eq!(saved, 0);
        assert!(store.executed_batches().is_empty());
    }
}
