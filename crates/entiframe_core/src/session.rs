//! Session facade.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::metadata::{Model, StoreKind};
use crate::query::{
    AsyncQueryingStream, DocumentSqlGenerator, EntityInstance, QueryContext, QuerySqlGenerator,
    QueryTranslator, Queryable, QueryingIter, RelationalSqlGenerator,
};
use crate::storage::{DocumentClient, QueryClient, RelationalConnection};
use crate::tracking::StateManager;
use crate::types::EntryId;
use crate::update::{CommandBatchExecutor, DocumentSaver};
use entiframe_codec::Value;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
enum Backend {
    Document(Arc<dyn DocumentClient>),
    Relational(Arc<dyn RelationalConnection>),
}

/// The store a session reads from and saves to.
#[derive(Clone)]
pub struct Store {
    query: Arc<dyn QueryClient>,
    backend: Backend,
}

impl Store {
    /// A document store.
    pub fn document<C: DocumentClient + 'static>(client: Arc<C>) -> Self {
        Self {
            query: Arc::clone(&client) as Arc<dyn QueryClient>,
            backend: Backend::Document(client),
        }
    }

    /// A relational store.
    pub fn relational<C: RelationalConnection + 'static>(connection: Arc<C>) -> Self {
        Self {
            query: Arc::clone(&connection) as Arc<dyn QueryClient>,
            backend: Backend::Relational(connection),
        }
    }

    /// The kind of model the store can hold.
    #[must_use]
    pub fn kind(&self) -> StoreKind {
        match self.backend {
            Backend::Document(_) => StoreKind::Document,
            Backend::Relational(_) => StoreKind::Relational,
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("kind", &self.kind()).finish_non_exhaustive()
    }
}

/// A unit of work over one store.
///
/// A session owns a change tracker. Entities are tracked through [`add`],
/// [`attach`] or tracking queries, changed through [`set_value`] and
/// [`remove`], and written back by [`save_changes`].
///
/// The tracker is locked for each call; iterating a tracking query locks it
/// once per result, so do not hold the guard from [`state`] while iterating.
///
/// ```rust,ignore
/// let session = Session::new(model, Store::document(Arc::new(InMemoryDocumentStore::new())))?;
/// let order = session.add("Order", [("Id", "o1"), ("Status", "new")])?;
/// session.save_changes()?;
///
/// let query = session.query("Order")?;
/// let open = query.clone().filter(query.property("Status").equal("new"));
/// for order in session.execute(&open)? {
///     println!("{:?}", order?.get("Id"));
/// }
/// ```
///
/// [`add`]: Session::add
/// [`attach`]: Session::attach
/// [`set_value`]: Session::set_value
/// [`remove`]: Session::remove
/// [`save_changes`]: Session::save_changes
/// [`state`]: Session::state
pub struct Session {
    model: Arc<Model>,
    config: Config,
    state: Arc<Mutex<StateManager>>,
    store: Store,
    generator: Arc<dyn QuerySqlGenerator>,
    translator: QueryTranslator,
}

impl Session {
    /// Opens a session with the default configuration.
    pub fn new(model: Arc<Model>, store: Store) -> CoreResult<Self> {
        Self::with_config(model, store, Config::default())
    }

    /// Opens a session.
    ///
    /// Fails if the model was built for another kind of store.
    pub fn with_config(model: Arc<Model>, store: Store, config: Config) -> CoreResult<Self> {
        if model.store_kind() != store.kind() {
            return Err(CoreError::invalid_operation(format!(
                "a {:?} model cannot be used with a {:?} store",
                model.store_kind(),
                store.kind()
            )));
        }
        let generator: Arc<dyn QuerySqlGenerator> = match store.kind() {
            StoreKind::Document => Arc::new(DocumentSqlGenerator),
            StoreKind::Relational => Arc::new(RelationalSqlGenerator::new(config.dialect)),
        };
        Ok(Self {
            state: Arc::new(Mutex::new(StateManager::new(Arc::clone(&model)))),
            translator: QueryTranslator::new(Arc::clone(&model)),
            model,
            config,
            store,
            generator,
        })
    }

    /// The model.
    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Locks the change tracker.
    pub fn state(&self) -> MutexGuard<'_, StateManager> {
        self.state.lock()
    }

    /// Tracks a new entity of the named type.
    pub fn add<S, V>(&self, entity_type: &str, values: impl IntoIterator<Item = (S, V)>) -> CoreResult<EntryId>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        let ty = self.model.entity_type_named(entity_type)?.id();
        self.state.lock().add(ty, values)
    }

    /// Tracks an existing entity of the named type as unchanged.
    pub fn attach<S, V>(&self, entity_type: &str, values: impl IntoIterator<Item = (S, V)>) -> CoreResult<EntryId>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        let ty = self.model.entity_type_named(entity_type)?.id();
        self.state.lock().attach(ty, values)
    }

    /// Adds an owned dependent through `owner`'s navigation.
    pub fn add_owned<S, V>(
        &self,
        owner: EntryId,
        navigation: &str,
        values: impl IntoIterator<Item = (S, V)>,
    ) -> CoreResult<EntryId>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        self.state.lock().add_owned(owner, navigation, values)
    }

    /// Marks an entity, and what it owns, for deletion.
    pub fn remove(&self, id: EntryId) -> CoreResult<()> {
        self.state.lock().remove(id)
    }

    /// Sets a property value.
    pub fn set_value(&self, id: EntryId, property: &str, value: impl Into<Value>) -> CoreResult<()> {
        self.state.lock().set_value(id, property, value)
    }

    /// Points a reference navigation at a principal, or clears it.
    pub fn set_reference(&self, dependent: EntryId, navigation: &str, principal: Option<EntryId>) -> CoreResult<()> {
        self.state.lock().set_reference(dependent, navigation, principal)
    }

    /// The current value of a property.
    pub fn value(&self, id: EntryId, property: &str) -> CoreResult<Value> {
        let state = self.state.lock();
        let index = state.entity_type_of(id)?.property_index(property)?;
        Ok(state.entry(id)?.current_value(index).clone())
    }

    /// Snapshot of a tracked entity and its owned dependents.
    pub fn instance(&self, id: EntryId) -> CoreResult<EntityInstance> {
        self.state.lock().instance(id)
    }

    /// Starts a query over the named document root type.
    pub fn query(&self, entity_type: &str) -> CoreResult<Queryable> {
        Queryable::new(Arc::clone(&self.model), entity_type)
    }

    /// Runs a query.
    pub fn execute(&self, query: &Queryable) -> CoreResult<QueryingIter> {
        let shaper = self.translator.translate(query, false, self.config.tracking)?;
        shaper.enumerate(self.context(query, shaper.shaper().is_tracking()))
    }

    /// Runs a query and collects every result.
    pub fn to_list(&self, query: &Queryable) -> CoreResult<Vec<EntityInstance>> {
        self.execute(query)?.collect()
    }

    /// Runs a query asynchronously.
    pub fn execute_async(&self, query: &Queryable, cancel: CancellationToken) -> CoreResult<AsyncQueryingStream> {
        let shaper = self.translator.translate(query, true, self.config.tracking)?;
        shaper.enumerate_async(self.context(query, shaper.shaper().is_tracking()), cancel)
    }

    fn context(&self, query: &Queryable, tracking: bool) -> QueryContext {
        let context = QueryContext::new(
            Arc::clone(&self.model),
            Arc::clone(&self.store.query),
            Arc::clone(&self.generator),
        )
        .with_parameters(query.parameters().to_vec())
        .with_sensitive_data_logging(self.config.sensitive_data_logging);
        if tracking {
            context.with_state(Arc::clone(&self.state))
        } else {
            context
        }
    }

    /// Writes every pending change to the store.
    ///
    /// Returns the number of entries written. Relational saves are not
    /// atomic across batches: on failure, batches already executed stay
    /// committed while every entry keeps its pending state.
    pub fn save_changes(&self) -> CoreResult<usize> {
        let mut state = self.state.lock();
        if self.config.detect_changes_on_save {
            state.detect_changes();
        }
        let saved = match &self.store.backend {
            Backend::Document(client) => DocumentSaver::new(&self.config).save(&mut state, client.as_ref())?,
            Backend::Relational(connection) => {
                CommandBatchExecutor::new(&self.config).execute(&mut state, connection.as_ref())?
            }
        };
        info!(saved, "changes saved");
        Ok(saved)
    }

    /// Async [`Session::save_changes`].
    pub async fn save_changes_async(&self, cancel: &CancellationToken) -> CoreResult<usize> {
        if self.config.detect_changes_on_save {
            self.state.lock().detect_changes();
        }
        let saved = match &self.store.backend {
            Backend::Document(client) => {
                DocumentSaver::new(&self.config)
                    .save_async(&self.state, client.as_ref(), cancel)
                    .await?
            }
            Backend::Relational(connection) => {
                CommandBatchExecutor::new(&self.config)
                    .execute_async(&self.state, connection.as_ref(), cancel)
                    .await?
            }
        };
        info!(saved, "changes saved");
        Ok(saved)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("tracked", &self.state.lock().len())
            .finish_non_exhaustive()
    }
}
