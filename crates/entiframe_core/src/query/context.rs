//! Query execution context and result enumerators.

use crate::error::{CoreError, CoreResult};
use crate::metadata::Model;
use crate::query::materializer::{EntityInstance, EntityShaper};
use crate::query::shaper::DocumentQueryExpression;
use crate::query::sql::QuerySqlGenerator;
use crate::storage::{DocumentCursor, DocumentStream, QueryClient, QueryRequest};
use crate::tracking::StateManager;
use entiframe_codec::Value;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

/// Everything a query needs at run time.
#[derive(Clone)]
pub struct QueryContext {
    model: Arc<Model>,
    client: Arc<dyn QueryClient>,
    generator: Arc<dyn QuerySqlGenerator>,
    state: Option<Arc<Mutex<StateManager>>>,
    parameters: Vec<(String, Value)>,
    sensitive_data_logging: bool,
}

impl QueryContext {
    /// Creates a context that does not track results.
    pub fn new(
        model: Arc<Model>,
        client: Arc<dyn QueryClient>,
        generator: Arc<dyn QuerySqlGenerator>,
    ) -> Self {
        Self {
            model,
            client,
            generator,
            state: None,
            parameters: Vec::new(),
            sensitive_data_logging: false,
        }
    }

    /// Attaches results to `state`.
    #[must_use]
    pub fn with_state(mut self, state: Arc<Mutex<StateManager>>) -> Self {
        self.state = Some(state);
        self
    }

    /// Sets the parameter values.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Vec<(String, Value)>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Allows parameter values in logs.
    #[must_use]
    pub fn with_sensitive_data_logging(mut self, enabled: bool) -> Self {
        self.sensitive_data_logging = enabled;
        self
    }

    /// The model.
    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The state manager results attach to.
    #[must_use]
    pub fn state(&self) -> Option<&Arc<Mutex<StateManager>>> {
        self.state.as_ref()
    }

    /// Parameter values.
    #[must_use]
    pub fn parameters(&self) -> &[(String, Value)] {
        &self.parameters
    }

    fn prepare(&self, query: &DocumentQueryExpression) -> CoreResult<QueryRequest> {
        let select = query.select();
        let sql = select.to_sql_query(self.generator.as_ref(), &self.parameters)?;
        if self.sensitive_data_logging {
            debug!(
                container = %select.store_object(),
                query = %sql.text,
                parameters = ?sql.parameters,
                "executing query"
            );
        } else {
            debug!(
                container = %select.store_object(),
                query = %sql.text,
                parameter_count = sql.parameters.len(),
                "executing query"
            );
        }
        Ok(QueryRequest {
            container: select.store_object().to_string(),
            sql,
            select: Arc::clone(select),
            parameters: self.parameters.clone(),
        })
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("generator", &self.generator)
            .field("tracking", &self.state.is_some())
            .field("parameters", &self.parameters.len())
            .finish_non_exhaustive()
    }
}

/// Synchronous query call captured by the translator.
pub(crate) fn execute_query(
    context: &QueryContext,
    query: &DocumentQueryExpression,
) -> CoreResult<DocumentCursor> {
    let request = context.prepare(query)?;
    Ok(context.client.execute_query(&request)?)
}

/// Asynchronous query call captured by the translator.
pub(crate) fn execute_query_async(
    context: &QueryContext,
    query: &DocumentQueryExpression,
) -> CoreResult<DocumentStream> {
    let request = context.prepare(query)?;
    Ok(context.client.execute_query_stream(request))
}

/// Lazy, single-pass sequence of shaped results.
///
/// The first error ends the sequence.
pub struct QueryingIter {
    rows: DocumentCursor,
    shaper: EntityShaper,
    context: QueryContext,
    finished: bool,
}

impl QueryingIter {
    pub(crate) fn new(rows: DocumentCursor, shaper: EntityShaper, context: QueryContext) -> Self {
        Self {
            rows,
            shaper,
            context,
            finished: false,
        }
    }
}

impl Iterator for QueryingIter {
    type Item = CoreResult<EntityInstance>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let result = match self.rows.next()? {
            Ok(row) => self.shaper.shape(&self.context, row),
            Err(err) => Err(CoreError::from(err)),
        };
        if let Err(err) = &result {
            warn!(error = %err, "query enumeration failed");
            self.finished = true;
        }
        Some(result)
    }
}

impl fmt::Debug for QueryingIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryingIter")
            .field("shaper", &self.shaper)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Stream of shaped results.
///
/// Cancellation is checked before every row fetch and wakes a fetch that is
/// still pending; a cancelled stream yields one [`CoreError::Cancelled`],
/// drops the store stream and then ends.
pub struct AsyncQueryingStream {
    rows: Option<DocumentStream>,
    shaper: EntityShaper,
    context: QueryContext,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl AsyncQueryingStream {
    pub(crate) fn new(
        rows: DocumentStream,
        shaper: EntityShaper,
        context: QueryContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rows: Some(rows),
            shaper,
            context,
            cancelled: Box::pin(cancel.cancelled_owned()),
        }
    }
}

impl Stream for AsyncQueryingStream {
    type Item = CoreResult<EntityInstance>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        // registers the waker, so a cancel during a pending fetch wakes us
        if this.rows.is_some() && this.cancelled.as_mut().poll(cx).is_ready() {
            debug!("query enumeration cancelled");
            this.rows = None;
            return Poll::Ready(Some(Err(CoreError::Cancelled)));
        }
        let Some(rows) = this.rows.as_mut() else {
            return Poll::Ready(None);
        };
        let result = match rows.poll_next_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => {
                this.rows = None;
                return Poll::Ready(None);
            }
            Poll::Ready(Some(Ok(row))) => this.shaper.shape(&this.context, row),
            Poll::Ready(Some(Err(err))) => Err(CoreError::from(err)),
        };
        if let Err(err) = &result {
            warn!(error = %err, "query enumeration failed");
            this.rows = None;
        }
        Poll::Ready(Some(result))
    }
}

impl fmt::Debug for AsyncQueryingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueryingStream")
            .field("shaper", &self.shaper)
            .field("finished", &self.rows.is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityTypeBuilder, ModelBuilder, ValueKind};
    use crate::query::{DocumentSqlGenerator, RowKind};
    use crate::storage::InMemoryDocumentStore;
    use std::time::Duration;

    fn stream_over(rows: DocumentStream, cancel: CancellationToken) -> AsyncQueryingStream {
        let model = ModelBuilder::document()
            .entity(
                EntityTypeBuilder::new("Note")
                    .property("Id", ValueKind::Text)
                    .key(["Id"]),
            )
            .build()
            .unwrap();
        let note = model.find_entity_type("Note").unwrap().id();
        let context = QueryContext::new(
            Arc::clone(&model),
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(DocumentSqlGenerator),
        );
        let shaper = EntityShaper::new(note, false, RowKind::Document);
        AsyncQueryingStream::new(rows, shaper, context, cancel)
    }

    #[tokio::test]
    async fn cancel_wakes_a_pending_fetch() {
        let cancel = CancellationToken::new();
        let mut stream = stream_over(futures_util::stream::pending().boxed(), cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("cancel did not wake the pending fetch");
        assert!(matches!(first, Some(Err(CoreError::Cancelled))));
        assert!(stream.next().await.is_none());
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn rows_flow_until_the_store_ends() {
        let rows = futures_util::stream::iter(vec![
            Ok(Value::object([("id", "n1"), ("Discriminator", "Note")])),
            Ok(Value::object([("id", "n2"), ("Discriminator", "Note")])),
        ])
        .boxed();
        let results: Vec<_> = stream_over(rows, CancellationToken::new()).collect().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Result::is_ok));
    }
}
