//! In-memory stores.
//!
//! Both stores interpret the bound [`SelectExpression`] of a query directly
//! instead of parsing the generated text, the way an in-process provider
//! evaluates its query tree. They are thread-safe and suitable for tests and
//! ephemeral sessions.

use crate::error::{StoreError, StoreResult};
use crate::metadata::{Model, ValueGenerated, ValueKind, ETAG_PROPERTY};
use crate::query::{compare_rows, evaluate, matches, SelectExpression, SqlQuery};
use crate::storage::{
    BatchRequest, CommandRequest, CommandResult, DocumentClient, DocumentCursor, QueryClient,
    QueryRequest, RelationalConnection, StoredDocument,
};
use crate::update::CommandOperation;
use entiframe_codec::{from_cbor, to_canonical_cbor, Value};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Filters, sorts and pages `rows` the way `select` describes.
fn apply_select(
    select: &SelectExpression,
    rows: Vec<Value>,
    parameters: &[(String, Value)],
) -> StoreResult<Vec<Value>> {
    let invalid = |err: crate::error::CoreError| StoreError::invalid_query(err.to_string());

    let mut selected = Vec::with_capacity(rows.len());
    for row in rows {
        let keep = match select.predicate() {
            Some(predicate) => matches(predicate, &row, parameters).map_err(invalid)?,
            None => true,
        };
        if keep {
            selected.push(row);
        }
    }

    if !select.orderings().is_empty() {
        let terms: Vec<_> = select
            .orderings()
            .iter()
            .map(|o| (&o.expression, o.ascending))
            .collect();
        let mut failure = None;
        selected.sort_by(|a, b| {
            compare_rows(&terms, a, b, parameters).unwrap_or_else(|err| {
                failure.get_or_insert(err);
                std::cmp::Ordering::Equal
            })
        });
        if let Some(err) = failure {
            return Err(invalid(err));
        }
    }

    let count = |expression: Option<&crate::query::Expression>| -> StoreResult<Option<usize>> {
        let Some(expression) = expression else {
            return Ok(None);
        };
        let value = evaluate(expression, &Value::Null, parameters).map_err(invalid)?;
        value
            .as_integer()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| StoreError::invalid_query(format!("'{value}' is not a row count")))
    };
    let offset = count(select.offset())?.unwrap_or(0);
    let limit = count(select.limit())?;
    Ok(selected
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect())
}

fn counting_cursor(rows: Vec<Value>, fetched: &Arc<AtomicUsize>) -> DocumentCursor {
    let fetched = Arc::clone(fetched);
    Box::new(rows.into_iter().map(move |row| {
        fetched.fetch_add(1, Ordering::Relaxed);
        Ok(row)
    }))
}

fn document_id(container: &str, document: &Value) -> StoreResult<String> {
    match document.get("id") {
        Some(Value::Text(id)) => Ok(id.clone()),
        Some(Value::Integer(id)) => Ok(id.to_string()),
        _ => Err(StoreError::invalid_query(format!(
            "document for {container} has no string or integer id"
        ))),
    }
}

/// A document store keeping canonical CBOR documents per container.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    containers: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    revision: AtomicU64,
    failures: Mutex<VecDeque<StoreError>>,
    queries: Mutex<Vec<SqlQuery>>,
    writes: AtomicUsize,
    fetched: Arc<AtomicUsize>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next operation fail with `error`.
    pub fn fail_next(&self, error: StoreError) {
        self.failures.lock().push_back(error);
    }

    /// Query texts executed so far.
    #[must_use]
    pub fn executed_queries(&self) -> Vec<SqlQuery> {
        self.queries.lock().clone()
    }

    /// Number of create, replace and delete calls that reached the store.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of query results handed out so far.
    #[must_use]
    pub fn rows_fetched(&self) -> usize {
        self.fetched.load(Ordering::Relaxed)
    }

    /// Documents of a container, in id order.
    pub fn documents(&self, container: &str) -> StoreResult<Vec<Value>> {
        let containers = self.containers.read();
        let Some(documents) = containers.get(container) else {
            return Ok(Vec::new());
        };
        documents
            .values()
            .map(|bytes| from_cbor(bytes).map_err(StoreError::from))
            .collect()
    }

    /// Stores `document` as-is, bypassing etag checks.
    pub fn seed(&self, container: &str, document: Value) -> StoreResult<StoredDocument> {
        let id = document_id(container, &document)?;
        let stored = self.stamp(document)?;
        self.containers
            .write()
            .entry(container.to_string())
            .or_default()
            .insert(id, to_canonical_cbor(&stored.document)?);
        Ok(stored)
    }

    fn check_failure(&self) -> StoreResult<()> {
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn stamp(&self, mut document: Value) -> StoreResult<StoredDocument> {
        document.remove(ETAG_PROPERTY);
        let revision = self.revision.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(to_canonical_cbor(&document)?);
        hasher.update(revision.to_be_bytes());
        let digest = hasher.finalize();
        let etag: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        let etag = format!("\"{etag}\"");
        document.set(ETAG_PROPERTY, etag.as_str());
        Ok(StoredDocument { document, etag })
    }

    fn current_etag(bytes: &[u8]) -> StoreResult<Option<String>> {
        let document = from_cbor(bytes)?;
        Ok(document
            .get(ETAG_PROPERTY)
            .and_then(Value::as_text)
            .map(str::to_string))
    }
}

impl QueryClient for InMemoryDocumentStore {
    fn execute_query(&self, request: &QueryRequest) -> StoreResult<DocumentCursor> {
        self.check_failure()?;
        self.queries.lock().push(request.sql.clone());
        let documents = self.documents(&request.container)?;
        let rows = apply_select(&request.select, documents, &request.parameters)?;
        debug!(container = %request.container, results = rows.len(), "query evaluated");
        Ok(counting_cursor(rows, &self.fetched))
    }
}

impl DocumentClient for InMemoryDocumentStore {
    fn create_item(&self, container: &str, document: Value) -> StoreResult<StoredDocument> {
        self.check_failure()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let id = document_id(container, &document)?;
        let mut containers = self.containers.write();
        let documents = containers.entry(container.to_string()).or_default();
        if documents.contains_key(&id) {
            return Err(StoreError::Conflict {
                container: container.to_string(),
                key: id,
            });
        }
        let stored = self.stamp(document)?;
        documents.insert(id.clone(), to_canonical_cbor(&stored.document)?);
        trace!(container, id = %id, etag = %stored.etag, "document created");
        Ok(stored)
    }

    fn replace_item(
        &self,
        container: &str,
        id: &str,
        document: Value,
        if_match: Option<&str>,
    ) -> StoreResult<StoredDocument> {
        self.check_failure()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut containers = self.containers.write();
        let existing = containers
            .get_mut(container)
            .and_then(|documents| documents.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                container: container.to_string(),
                key: id.to_string(),
            })?;
        if let Some(expected) = if_match {
            if Self::current_etag(existing)?.as_deref() != Some(expected) {
                return Err(StoreError::PreconditionFailed {
                    container: container.to_string(),
                    key: id.to_string(),
                });
            }
        }
        let stored = self.stamp(document)?;
        *existing = to_canonical_cbor(&stored.document)?;
        trace!(container, id, etag = %stored.etag, "document replaced");
        Ok(stored)
    }

    fn delete_item(&self, container: &str, id: &str, if_match: Option<&str>) -> StoreResult<()> {
        self.check_failure()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut containers = self.containers.write();
        let not_found = || StoreError::NotFound {
            container: container.to_string(),
            key: id.to_string(),
        };
        let documents = containers.get_mut(container).ok_or_else(not_found)?;
        let existing = documents.get(id).ok_or_else(not_found)?;
        if let Some(expected) = if_match {
            if Self::current_etag(existing)?.as_deref() != Some(expected) {
                return Err(StoreError::PreconditionFailed {
                    container: container.to_string(),
                    key: id.to_string(),
                });
            }
        }
        documents.remove(id);
        trace!(container, id, "document deleted");
        Ok(())
    }

    fn read_item(&self, container: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
        self.check_failure()?;
        let containers = self.containers.read();
        let Some(bytes) = containers.get(container).and_then(|documents| documents.get(id)) else {
            return Ok(None);
        };
        let document = from_cbor(bytes)?;
        let etag = document
            .get(ETAG_PROPERTY)
            .and_then(Value::as_text)
            .unwrap_or_default()
            .to_string();
        Ok(Some(StoredDocument { document, etag }))
    }
}

#[derive(Debug, Default)]
struct TableInfo {
    key_columns: Vec<String>,
    generated: HashMap<String, (ValueKind, ValueGenerated)>,
}

/// A relational store keeping rows as column objects per table.
///
/// Integer columns generated on add behave as identity columns; columns
/// generated on add or update behave as row versions.
#[derive(Debug)]
pub struct InMemoryRelationalStore {
    tables: RwLock<BTreeMap<String, Vec<Value>>>,
    info: HashMap<String, TableInfo>,
    row_version: AtomicU64,
    failures: Mutex<VecDeque<StoreError>>,
    batches: Mutex<Vec<BatchRequest>>,
    fetched: Arc<AtomicUsize>,
}

impl InMemoryRelationalStore {
    /// Creates an empty store for the tables of `model`.
    #[must_use]
    pub fn new(model: &Model) -> Self {
        let mut info: HashMap<String, TableInfo> = HashMap::new();
        for ty in model.entity_types() {
            let Some(table) = ty.mapping().table.as_deref() else {
                continue;
            };
            let table_info = info.entry(table.to_string()).or_default();
            if ty.is_document_root() && ty.base_type().is_none() {
                table_info.key_columns = ty
                    .primary_key()
                    .iter()
                    .filter_map(|&i| ty.property(i).and_then(|p| p.store_name()))
                    .map(str::to_string)
                    .collect();
            }
            for property in ty.properties() {
                if let (Some(column), generated) = (property.store_name(), property.value_generated()) {
                    if generated != ValueGenerated::Never {
                        table_info
                            .generated
                            .insert(column.to_string(), (property.kind(), generated));
                    }
                }
            }
        }
        Self {
            tables: RwLock::new(BTreeMap::new()),
            info,
            row_version: AtomicU64::new(1),
            failures: Mutex::new(VecDeque::new()),
            batches: Mutex::new(Vec::new()),
            fetched: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the next query or batch fail with `error`.
    pub fn fail_next(&self, error: StoreError) {
        self.failures.lock().push_back(error);
    }

    /// Batches executed so far.
    #[must_use]
    pub fn executed_batches(&self) -> Vec<BatchRequest> {
        self.batches.lock().clone()
    }

    /// Number of query results handed out so far.
    #[must_use]
    pub fn rows_fetched(&self) -> usize {
        self.fetched.load(Ordering::Relaxed)
    }

    /// Rows of a table, in insertion order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    /// Inserts a row as-is.
    pub fn seed(&self, table: &str, row: Value) {
        self.tables.write().entry(table.to_string()).or_default().push(row);
    }

    fn check_failure(&self) -> StoreResult<()> {
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn generate(
        &self,
        info: Option<&TableInfo>,
        rows: &[Value],
        column: &str,
        operation: CommandOperation,
    ) -> Option<Value> {
        let (kind, generated) = info?.generated.get(column)?;
        match (generated, operation) {
            (ValueGenerated::OnAdd, CommandOperation::Insert) if *kind == ValueKind::Integer => {
                let max = rows
                    .iter()
                    .filter_map(|row| row.get(column).and_then(Value::as_integer))
                    .max()
                    .unwrap_or(0);
                Some(Value::Integer(max + 1))
            }
            (ValueGenerated::OnAddOrUpdate, CommandOperation::Insert | CommandOperation::Update) => {
                let version = self.row_version.fetch_add(1, Ordering::Relaxed);
                Some(match kind {
                    ValueKind::Bytes => Value::Bytes(version.to_be_bytes().to_vec()),
                    ValueKind::Text => Value::Text(format!("{version:016x}")),
                    _ => Value::Integer(version as i64),
                })
            }
            _ => None,
        }
    }

    fn execute_command(
        &self,
        tables: &mut BTreeMap<String, Vec<Value>>,
        command: &CommandRequest,
    ) -> StoreResult<CommandResult> {
        let info = self.info.get(&command.table);
        let rows = tables.entry(command.table.clone()).or_default();
        let matches_conditions = |row: &Value| {
            command.conditions.iter().all(|(column, expected)| {
                let actual = row.get(column).unwrap_or(&Value::Null);
                if expected.is_null() {
                    actual.is_null()
                } else {
                    actual.loose_eq(expected)
                }
            })
        };

        match command.operation {
            CommandOperation::Insert => {
                let mut row = Value::object(command.write_columns.iter().cloned());
                let mut generated = Vec::with_capacity(command.read_columns.len());
                for column in &command.read_columns {
                    let value = self
                        .generate(info, rows, column, CommandOperation::Insert)
                        .ok_or_else(|| {
                            StoreError::invalid_query(format!(
                                "{}.{column} is not generated on insert",
                                command.table
                            ))
                        })?;
                    row.set(column.clone(), value.clone());
                    generated.push((column.clone(), value));
                }
                if let Some(info) = info.filter(|i| !i.key_columns.is_empty()) {
                    let duplicate = rows.iter().any(|existing| {
                        info.key_columns.iter().all(|column| {
                            existing
                                .get(column)
                                .zip(row.get(column))
                                .is_some_and(|(a, b)| a.loose_eq(b))
                        })
                    });
                    if duplicate {
                        let key: Vec<String> = info
                            .key_columns
                            .iter()
                            .map(|c| row.get(c).map_or_else(|| "null".to_string(), Value::to_string))
                            .collect();
                        return Err(StoreError::Conflict {
                            container: command.table.clone(),
                            key: key.join(", "),
                        });
                    }
                }
                rows.push(row);
                Ok(CommandResult {
                    rows_affected: 1,
                    generated,
                })
            }
            CommandOperation::Update => {
                let mut affected = 0;
                let mut generated = Vec::new();
                let positions: Vec<usize> = rows
                    .iter()
                    .enumerate()
                    .filter(|(_, row)| matches_conditions(row))
                    .map(|(i, _)| i)
                    .collect();
                for position in positions {
                    generated.clear();
                    for (column, value) in &command.write_columns {
                        rows[position].set(column.clone(), value.clone());
                    }
                    for column in &command.read_columns {
                        let value = self
                            .generate(info, rows, column, CommandOperation::Update)
                            .or_else(|| rows[position].get(column).cloned())
                            .unwrap_or(Value::Null);
                        rows[position].set(column.clone(), value.clone());
                        generated.push((column.clone(), value));
                    }
                    affected += 1;
                }
                Ok(CommandResult {
                    rows_affected: affected,
                    generated,
                })
            }
            CommandOperation::Delete => {
                let before = rows.len();
                rows.retain(|row| !matches_conditions(row));
                Ok(CommandResult {
                    rows_affected: (before - rows.len()) as u64,
                    generated: Vec::new(),
                })
            }
        }
    }
}

impl QueryClient for InMemoryRelationalStore {
    fn execute_query(&self, request: &QueryRequest) -> StoreResult<DocumentCursor> {
        self.check_failure()?;
        let rows = self.rows(&request.container);
        let rows = apply_select(&request.select, rows, &request.parameters)?;
        debug!(table = %request.container, results = rows.len(), "query evaluated");
        Ok(counting_cursor(rows, &self.fetched))
    }
}

impl RelationalConnection for InMemoryRelationalStore {
    /// Runs the batch atomically: a failing command leaves every table as it
    /// was before the batch.
    fn execute_batch(&self, batch: &BatchRequest) -> StoreResult<Vec<CommandResult>> {
        self.check_failure()?;
        self.batches.lock().push(batch.clone());
        let mut tables = self.tables.write();
        let mut working = tables.clone();
        let mut results = Vec::with_capacity(batch.commands.len());
        for command in &batch.commands {
            results.push(self.execute_command(&mut working, command)?);
        }
        *tables = working;
        debug!(commands = results.len(), "batch applied");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityTypeBuilder, ModelBuilder, PropertyBuilder};
    use crate::query::{DocumentSqlGenerator, Expression, QuerySqlGenerator};
    use crate::types::QuerySourceId;

    fn request(model: &Arc<Model>, name: &str, configure: impl FnOnce(&mut SelectExpression)) -> QueryRequest {
        let id = model.find_entity_type(name).unwrap().id();
        let mut select = SelectExpression::new(Arc::clone(model), id, QuerySourceId(1));
        configure(&mut select);
        QueryRequest {
            container: select.store_object().to_string(),
            sql: DocumentSqlGenerator.generate(&select, &[]).unwrap(),
            select: Arc::new(select),
            parameters: Vec::new(),
        }
    }

    #[test]
    fn document_crud_with_etags() {
        let store = InMemoryDocumentStore::new();
        let created = store
            .create_item("People", Value::object([("id", "1"), ("Name", "Ann")]))
            .unwrap();
        assert_eq!(created.document.get(ETAG_PROPERTY), Some(&Value::from(created.etag.as_str())));

        let duplicate = store.create_item("People", Value::object([("id", "1")]));
        assert!(matches!(duplicate, Err(StoreError::Conflict { .. })));

        let stale = store.replace_item("People", "1", Value::object([("id", "1")]), Some("\"nope\""));
        assert!(matches!(stale, Err(StoreError::PreconditionFailed { .. })));

        let replaced = store
            .replace_item(
                "People",
                "1",
                Value::object([("id", "1"), ("Name", "Bea")]),
                Some(&created.etag),
            )
            .unwrap();
        assert_ne!(replaced.etag, created.etag);

        let read = store.read_item("People", "1").unwrap().unwrap();
        assert_eq!(read.document.get("Name"), Some(&Value::from("Bea")));

        assert!(store.delete_item("People", "1", Some(&created.etag)).is_err());
        store.delete_item("People", "1", Some(&replaced.etag)).unwrap();
        assert!(store.read_item("People", "1").unwrap().is_none());
        assert_eq!(store.write_count(), 6);
    }

    #[test]
    fn document_query_filters_orders_and_pages() {
        let model = ModelBuilder::document()
            .entity(
                EntityTypeBuilder::new("Person")
                    .container("People")
                    .property("Id", ValueKind::Integer)
                    .property("Age", ValueKind::Integer)
                    .key(["Id"]),
            )
            .build()
            .unwrap();
        let store = InMemoryDocumentStore::new();
        for (id, age) in [(1, 40), (2, 20), (3, 30), (4, 10)] {
            store
                .seed(
                    "People",
                    Value::object([
                        ("id", Value::from(id)),
                        ("Age", Value::from(age)),
                        ("Discriminator", Value::from("Person")),
                    ]),
                )
                .unwrap();
        }
        let request = request(&model, "Person", |select| {
            let age = Expression::key_access(select.from().clone(), "Age");
            select.add_to_predicate(age.clone().greater_than(15));
            select.add_ordering(age, true);
            select.set_offset(Expression::constant(1));
        });
        let ages: Vec<i64> = store
            .execute_query(&request)
            .unwrap()
            .map(|row| row.unwrap().get("Age").and_then(Value::as_integer).unwrap())
            .collect();
        assert_eq!(ages, vec![30, 40]);
        assert_eq!(store.rows_fetched(), 2);
        assert_eq!(store.executed_queries().len(), 1);
    }

    #[test]
    fn relational_batches_generate_values_and_roll_back() {
        let model = ModelBuilder::relational()
            .entity(
                EntityTypeBuilder::new("Blog")
                    .property_with(
                        PropertyBuilder::new("Id", ValueKind::Integer).generated(ValueGenerated::OnAdd),
                    )
                    .property("Name", ValueKind::Text)
                    .property_with(
                        PropertyBuilder::new("Version", ValueKind::Bytes)
                            .concurrency_token()
                            .generated(ValueGenerated::OnAddOrUpdate),
                    )
                    .key(["Id"]),
            )
            .build()
            .unwrap();
        let store = InMemoryRelationalStore::new(&model);
        let insert = |name: &str| CommandRequest {
            operation: CommandOperation::Insert,
            table: "Blog".into(),
            schema: None,
            write_columns: vec![("Name".into(), Value::from(name))],
            conditions: Vec::new(),
            read_columns: vec!["Id".into(), "Version".into()],
        };
        let results = store
            .execute_batch(&BatchRequest {
                sql: String::new(),
                commands: vec![insert("a"), insert("b")],
            })
            .unwrap();
        assert_eq!(results[0].generated[0], ("Id".to_string(), Value::Integer(1)));
        assert_eq!(results[1].generated[0], ("Id".to_string(), Value::Integer(2)));

        let version = results[0].generated[1].1.clone();
        let update = |version: Value| CommandRequest {
            operation: CommandOperation::Update,
            table: "Blog".into(),
            schema: None,
            write_columns: vec![("Name".into(), Value::from("c"))],
            conditions: vec![("Id".into(), Value::Integer(1)), ("Version".into(), version)],
            read_columns: vec!["Version".into()],
        };
        let batch = BatchRequest {
            sql: String::new(),
            commands: vec![update(version.clone())],
        };
        assert_eq!(store.execute_batch(&batch).unwrap()[0].rows_affected, 1);
        assert_eq!(store.execute_batch(&batch).unwrap()[0].rows_affected, 0);

        let mut conflicting = insert("d");
        conflicting.write_columns.push(("Id".into(), Value::Integer(2)));
        conflicting.read_columns = vec!["Version".into()];
        let failed = store.execute_batch(&BatchRequest {
            sql: String::new(),
            commands: vec![insert("e"), conflicting],
        });
        assert!(matches!(failed, Err(StoreError::Conflict { .. })));
        assert_eq!(store.rows("Blog").len(), 2);
        assert_eq!(store.executed_batches().len(), 4);
    }

    #[test]
    fn injected_failures_surface_once() {
        let store = InMemoryDocumentStore::new();
        store.fail_next(StoreError::Timeout);
        assert_eq!(store.read_item("c", "1"), Err(StoreError::Timeout));
        assert_eq!(store.read_item("c", "1"), Ok(None));
    }
}
