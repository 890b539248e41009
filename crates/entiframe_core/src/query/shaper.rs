//! Terminal query nodes.

use crate::error::{CoreError, CoreResult};
use crate::query::context::{AsyncQueryingStream, QueryContext, QueryingIter};
use crate::query::materializer::EntityShaper;
use crate::query::select::SelectExpression;
use crate::storage::{DocumentCursor, DocumentStream};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Native element type of a store's result sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    /// A JSON-like document.
    Document,
    /// A flat row of named columns.
    Row,
}

/// Runs a query synchronously.
pub type SyncQueryFn = fn(&QueryContext, &DocumentQueryExpression) -> CoreResult<DocumentCursor>;

/// Starts a query asynchronously.
pub type AsyncQueryFn = fn(&QueryContext, &DocumentQueryExpression) -> CoreResult<DocumentStream>;

/// The execution function captured at translation time.
#[derive(Clone, Copy)]
pub enum QueryCall {
    /// Blocking enumeration.
    Sync(SyncQueryFn),
    /// Stream enumeration.
    Async(AsyncQueryFn),
}

impl fmt::Debug for QueryCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("QueryCall::Sync"),
            Self::Async(_) => f.write_str("QueryCall::Async"),
        }
    }
}

/// A finished select bound to the call that executes it.
#[derive(Debug, Clone)]
pub struct DocumentQueryExpression {
    select: Arc<SelectExpression>,
    call: QueryCall,
    row_kind: RowKind,
}

impl DocumentQueryExpression {
    /// Binds `select` to `call`.
    #[must_use]
    pub fn new(select: Arc<SelectExpression>, call: QueryCall, row_kind: RowKind) -> Self {
        Self {
            select,
            call,
            row_kind,
        }
    }

    /// The select.
    #[must_use]
    pub fn select(&self) -> &Arc<SelectExpression> {
        &self.select
    }

    /// The captured call.
    #[must_use]
    pub fn call(&self) -> QueryCall {
        self.call
    }

    /// Element type of the results.
    #[must_use]
    pub fn row_kind(&self) -> RowKind {
        self.row_kind
    }

    /// Whether the async call was captured.
    #[must_use]
    pub fn is_async(&self) -> bool {
        matches!(self.call, QueryCall::Async(_))
    }

    /// Invokes the captured synchronous call.
    pub fn reduce(&self, context: &QueryContext) -> CoreResult<DocumentCursor> {
        match self.call {
            QueryCall::Sync(call) => call(context, self),
            QueryCall::Async(_) => Err(CoreError::invalid_operation(
                "query was translated for asynchronous execution",
            )),
        }
    }

    /// Invokes the captured asynchronous call.
    pub fn reduce_async(&self, context: &QueryContext) -> CoreResult<DocumentStream> {
        match self.call {
            QueryCall::Async(call) => call(context, self),
            QueryCall::Sync(_) => Err(CoreError::invalid_operation(
                "query was translated for synchronous execution",
            )),
        }
    }
}

/// A store query plus the shaper that materializes its results.
#[derive(Debug, Clone)]
pub struct QueryShaperExpression {
    query: DocumentQueryExpression,
    shaper: EntityShaper,
}

impl QueryShaperExpression {
    /// Pairs a query with a shaper.
    ///
    /// Fails when the shaper expects a different element type than the store
    /// query yields.
    pub fn new(query: DocumentQueryExpression, shaper: EntityShaper) -> CoreResult<Self> {
        if query.row_kind() != shaper.row_kind() {
            return Err(CoreError::invalid_operation(format!(
                "shaper expects {:?} elements but the query yields {:?}",
                shaper.row_kind(),
                query.row_kind()
            )));
        }
        Ok(Self { query, shaper })
    }

    /// The store query.
    #[must_use]
    pub fn query(&self) -> &DocumentQueryExpression {
        &self.query
    }

    /// The shaper.
    #[must_use]
    pub fn shaper(&self) -> &EntityShaper {
        &self.shaper
    }

    /// Runs the query and returns a lazy sequence of shaped results.
    pub fn enumerate(&self, context: QueryContext) -> CoreResult<QueryingIter> {
        let rows = self.query.reduce(&context)?;
        Ok(QueryingIter::new(rows, self.shaper.clone(), context))
    }

    /// Starts the query and returns a stream of shaped results.
    pub fn enumerate_async(
        &self,
        context: QueryContext,
        cancel: CancellationToken,
    ) -> CoreResult<AsyncQueryingStream> {
        let rows = self.query.reduce_async(&context)?;
        Ok(AsyncQueryingStream::new(rows, self.shaper.clone(), context, cancel))
    }
}
