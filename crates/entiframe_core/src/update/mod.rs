//! Save pipelines.
//!
//! Relational stores receive ordered, batched `INSERT`/`UPDATE`/`DELETE`
//! commands ([`CommandBatchExecutor`]); document stores receive whole
//! documents built by [`DocumentSource`] ([`DocumentSaver`]).

mod batch;
mod command;
mod document_saver;
mod document_source;
mod executor;
mod sorter;
mod sql;

pub use batch::{CommandBatchPreparer, ModificationCommandBatch};
pub use command::{build_commands, ColumnModification, CommandOperation, ModificationCommand};
pub use document_saver::DocumentSaver;
pub use document_source::{refresh_snapshots, set_temporary_ordinals, DocumentSource};
pub use executor::CommandBatchExecutor;
pub use sorter::sort_commands;
pub use sql::UpdateSqlGenerator;
