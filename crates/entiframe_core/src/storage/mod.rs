//! Store client contracts.
//!
//! The query pipeline talks to a store through [`QueryClient`]; the save
//! pipelines use [`DocumentClient`] for document stores and
//! [`RelationalConnection`] for relational stores. Every async method returns
//! a boxed future or stream so the traits stay object-safe.

mod memory;

pub use memory::{InMemoryDocumentStore, InMemoryRelationalStore};

use crate::error::StoreResult;
use crate::query::{SelectExpression, SqlQuery};
use crate::update::CommandOperation;
use entiframe_codec::Value;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use std::sync::Arc;

/// A lazy, single-pass cursor over documents or rows.
pub type DocumentCursor = Box<dyn Iterator<Item = StoreResult<Value>> + Send>;

/// The async counterpart of [`DocumentCursor`].
pub type DocumentStream = BoxStream<'static, StoreResult<Value>>;

/// A query sent to a store.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Container or table queried.
    pub container: String,
    /// Generated query text and parameters.
    pub sql: SqlQuery,
    /// The select the text was generated from.
    pub select: Arc<SelectExpression>,
    /// Parameter values by name, without the `@` prefix.
    pub parameters: Vec<(String, Value)>,
}

/// Runs queries.
pub trait QueryClient: Send + Sync {
    /// Runs a query, returning a lazy cursor over the results.
    fn execute_query(&self, request: &QueryRequest) -> StoreResult<DocumentCursor>;

    /// Runs a query asynchronously. Rows are fetched as the stream is polled.
    fn execute_query_stream(&self, request: QueryRequest) -> DocumentStream {
        match self.execute_query(&request) {
            Ok(cursor) => futures_util::stream::iter(cursor).boxed(),
            Err(err) => futures_util::stream::once(futures_util::future::ready(Err(err))).boxed(),
        }
    }
}

/// A document with its concurrency tag.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Document body, including the `_etag` property.
    pub document: Value,
    /// Opaque version tag.
    pub etag: String,
}

/// Reads and writes whole documents.
pub trait DocumentClient: QueryClient {
    /// Creates a document; fails with `Conflict` if the id exists.
    fn create_item(&self, container: &str, document: Value) -> StoreResult<StoredDocument>;

    /// Replaces a document, optionally only if its etag matches.
    fn replace_item(
        &self,
        container: &str,
        id: &str,
        document: Value,
        if_match: Option<&str>,
    ) -> StoreResult<StoredDocument>;

    /// Deletes a document, optionally only if its etag matches.
    fn delete_item(&self, container: &str, id: &str, if_match: Option<&str>) -> StoreResult<()>;

    /// Reads a document by id.
    fn read_item(&self, container: &str, id: &str) -> StoreResult<Option<StoredDocument>>;

    /// Async [`DocumentClient::create_item`].
    fn create_item_async<'a>(
        &'a self,
        container: &'a str,
        document: Value,
    ) -> BoxFuture<'a, StoreResult<StoredDocument>> {
        futures_util::future::ready(self.create_item(container, document)).boxed()
    }

    /// Async [`DocumentClient::replace_item`].
    fn replace_item_async<'a>(
        &'a self,
        container: &'a str,
        id: &'a str,
        document: Value,
        if_match: Option<&'a str>,
    ) -> BoxFuture<'a, StoreResult<StoredDocument>> {
        futures_util::future::ready(self.replace_item(container, id, document, if_match)).boxed()
    }

    /// Async [`DocumentClient::delete_item`].
    fn delete_item_async<'a>(
        &'a self,
        container: &'a str,
        id: &'a str,
        if_match: Option<&'a str>,
    ) -> BoxFuture<'a, StoreResult<()>> {
        futures_util::future::ready(self.delete_item(container, id, if_match)).boxed()
    }
}

/// One write command in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Kind of write.
    pub operation: CommandOperation,
    /// Target table.
    pub table: String,
    /// Target schema.
    pub schema: Option<String>,
    /// Column values written.
    pub write_columns: Vec<(String, Value)>,
    /// Column values the affected row must match.
    pub conditions: Vec<(String, Value)>,
    /// Columns whose store-generated values are read back.
    pub read_columns: Vec<String>,
}

/// A batch of commands sent in one round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    /// Generated SQL script for the whole batch.
    pub sql: String,
    /// The commands in script order.
    pub commands: Vec<CommandRequest>,
}

/// Outcome of one command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    /// Rows affected.
    pub rows_affected: u64,
    /// Values of the requested read columns, by column name.
    pub generated: Vec<(String, Value)>,
}

/// Executes write batches against a relational store.
pub trait RelationalConnection: QueryClient {
    /// Executes a batch, returning one result per command.
    fn execute_batch(&self, batch: &BatchRequest) -> StoreResult<Vec<CommandResult>>;

    /// Async [`RelationalConnection::execute_batch`].
    fn execute_batch_async<'a>(
        &'a self,
        batch: &'a BatchRequest,
    ) -> BoxFuture<'a, StoreResult<Vec<CommandResult>>> {
        futures_util::future::ready(self.execute_batch(batch)).boxed()
    }
}
