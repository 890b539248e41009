//! # entiframe core
//!
//! Query translation, change tracking and save pipelines for document and
//! relational stores.
//!
//! This crate provides:
//! - A metadata model of entity types, keys, inheritance, ownership and store
//!   mappings ([`ModelBuilder`])
//! - Query translation from a [`Queryable`] into a store query, with lazy sync
//!   and async execution that shapes results into tracked entities
//! - A change tracker ([`StateManager`]) with identity resolution, temporary
//!   keys and foreign key fix-up
//! - Document saves that embed owned entities into their owner's document
//! - Relational saves as dependency-ordered, batched commands with
//!   optimistic concurrency and store-generated value propagation
//! - In-memory document and relational stores
//!
//! [`Session`] ties these together for one unit of work.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
pub mod metadata;
pub mod query;
mod session;
pub mod storage;
pub mod tracking;
mod types;
pub mod update;

pub use config::{Config, QueryTrackingBehavior};
pub use error::{CoreError, CoreResult, StoreError, StoreResult};
pub use metadata::{
    EntityTypeBuilder, ForeignKeyBuilder, Model, ModelBuilder, PropertyBuilder, StoreKind,
    ValueGenerated, ValueKind,
};
pub use query::{EntityInstance, Expression, OwnedValue, Queryable, SqlDialect};
pub use session::{Session, Store};
pub use storage::{InMemoryDocumentStore, InMemoryRelationalStore};
pub use tracking::{EntityState, StateManager};
pub use types::{EntityTypeId, EntryId, ForeignKeyId, QuerySourceId};

pub use entiframe_codec::Value;
