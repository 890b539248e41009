//! Relational modification commands.

use crate::error::{CoreError, CoreResult};
use crate::metadata::{convert_from_provider, convert_to_provider, EntityType, Model, ValueGenerated};
use crate::storage::{CommandRequest, CommandResult};
use crate::tracking::{EntityState, Entry, StateManager};
use crate::types::EntryId;
use entiframe_codec::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Kind of write a command performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandOperation {
    /// `INSERT`
    Insert,
    /// `UPDATE`
    Update,
    /// `DELETE`
    Delete,
}

impl fmt::Display for CommandOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        })
    }
}

/// One column touched by a command.
///
/// Values are read from the tracked entry when the command is sent, so
/// store-generated keys written back by earlier batches flow into later ones.
#[derive(Debug, Clone)]
pub struct ColumnModification {
    column: String,
    entry: EntryId,
    property: usize,
    is_read: bool,
    is_write: bool,
    is_condition: bool,
    is_key: bool,
    write_null: bool,
    null_condition: bool,
}

impl ColumnModification {
    /// Column name.
    #[must_use]
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Entry the value belongs to.
    #[must_use]
    pub fn entry(&self) -> EntryId {
        self.entry
    }

    /// Property index within the entry's type.
    #[must_use]
    pub fn property(&self) -> usize {
        self.property
    }

    /// Whether the store generates the value and returns it.
    #[must_use]
    pub fn is_read(&self) -> bool {
        self.is_read
    }

    /// Whether a new value is written.
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.is_write
    }

    /// Whether the affected row must match the value.
    #[must_use]
    pub fn is_condition(&self) -> bool {
        self.is_condition
    }

    /// Whether the column is part of the row key.
    #[must_use]
    pub fn is_key(&self) -> bool {
        self.is_key
    }

    /// Whether the condition compares against null.
    #[must_use]
    pub fn is_null_condition(&self) -> bool {
        self.null_condition
    }

    /// Number of bound parameters: one for the new value, one for the
    /// original value of a non-null condition.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        usize::from(self.is_write) + usize::from(self.is_condition && !self.null_condition)
    }

    fn write_value(&self, state: &StateManager) -> CoreResult<Value> {
        if self.write_null {
            return Ok(Value::Null);
        }
        let entry = state.entry(self.entry)?;
        let property = property_of(state, entry, self.property)?;
        convert_to_provider(property.converter(), entry.current_value(self.property))
    }

    fn condition_value(&self, state: &StateManager) -> CoreResult<Value> {
        let entry = state.entry(self.entry)?;
        let property = property_of(state, entry, self.property)?;
        // key values of persisted entries never change
        let value = if self.is_key {
            entry.current_value(self.property)
        } else {
            entry.original_value(self.property)
        };
        convert_to_provider(property.converter(), value)
    }
}

fn property_of<'s>(
    state: &'s StateManager,
    entry: &Entry,
    index: usize,
) -> CoreResult<&'s crate::metadata::Property> {
    let ty = state.model().entity_type(entry.entity_type());
    ty.property(index).ok_or_else(|| {
        CoreError::invalid_operation(format!("'{}' has no property {index}", ty.name()))
    })
}

/// All writes to one table row.
#[derive(Debug, Clone)]
pub struct ModificationCommand {
    table: String,
    schema: Option<String>,
    operation: CommandOperation,
    entity_type: String,
    entries: Vec<EntryId>,
    columns: Vec<ColumnModification>,
}

impl ModificationCommand {
    /// Target table.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Target schema.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Kind of write.
    #[must_use]
    pub fn operation(&self) -> CommandOperation {
        self.operation
    }

    /// Name of the entity type owning the row.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Entries mapped to the row; the row owner comes first.
    #[must_use]
    pub fn entries(&self) -> &[EntryId] {
        &self.entries
    }

    /// Column modifications.
    #[must_use]
    pub fn columns(&self) -> &[ColumnModification] {
        &self.columns
    }

    /// Bound parameters the command needs.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.columns.iter().map(ColumnModification::parameter_count).sum()
    }

    /// Whether the store returns generated values.
    #[must_use]
    pub fn has_read_columns(&self) -> bool {
        self.columns.iter().any(|c| c.is_read)
    }

    /// Writes `NULL` instead of the current values of the given columns.
    pub(crate) fn null_out(&mut self, entry: EntryId, properties: &[usize]) {
        for column in &mut self.columns {
            if column.entry == entry && properties.contains(&column.property) {
                column.write_null = true;
            }
        }
    }

    /// The follow-up update that restores foreign key values nulled to break a
    /// cycle.
    pub(crate) fn fixup(&self, entry: EntryId, properties: &[usize]) -> Self {
        let mut columns: Vec<ColumnModification> = self
            .columns
            .iter()
            .filter(|c| c.is_key)
            .map(|c| ColumnModification {
                is_read: false,
                is_write: false,
                is_condition: true,
                write_null: false,
                null_condition: false,
                ..c.clone()
            })
            .collect();
        columns.extend(
            self.columns
                .iter()
                .filter(|c| c.entry == entry && properties.contains(&c.property) && !c.is_key)
                .map(|c| ColumnModification {
                    is_read: false,
                    is_write: true,
                    is_condition: false,
                    write_null: false,
                    null_condition: false,
                    ..c.clone()
                }),
        );
        Self {
            table: self.table.clone(),
            schema: self.schema.clone(),
            operation: CommandOperation::Update,
            entity_type: self.entity_type.clone(),
            entries: vec![entry],
            columns,
        }
    }

    /// Builds the store request with the entries' current values.
    pub fn to_request(&self, state: &StateManager) -> CoreResult<CommandRequest> {
        let mut write_columns = Vec::new();
        let mut conditions = Vec::new();
        let mut read_columns = Vec::new();
        for column in &self.columns {
            if column.is_write {
                write_columns.push((column.column.clone(), column.write_value(state)?));
            }
            if column.is_condition {
                let value = if column.null_condition {
                    Value::Null
                } else {
                    column.condition_value(state)?
                };
                conditions.push((column.column.clone(), value));
            }
            if column.is_read {
                read_columns.push(column.column.clone());
            }
        }
        Ok(CommandRequest {
            operation: self.operation,
            table: self.table.clone(),
            schema: self.schema.clone(),
            write_columns,
            conditions,
            read_columns,
        })
    }

    /// Checks the affected row count and writes generated values back.
    pub fn propagate_results(&self, state: &mut StateManager, result: &CommandResult) -> CoreResult<()> {
        if result.rows_affected != 1 {
            return Err(CoreError::ConcurrencyConflict {
                entries: self.entries.clone(),
                expected: 1,
                actual: result.rows_affected,
            });
        }
        let model = Arc::clone(state.model());
        for column in self.columns.iter().filter(|c| c.is_read) {
            let entry = state.entry(column.entry)?;
            let ty = model.entity_type(entry.entity_type());
            let property = ty.property(column.property).ok_or_else(|| {
                CoreError::generated_value_missing(ty.name(), column.column.clone())
            })?;
            let value = result
                .generated
                .iter()
                .find(|(name, _)| *name == column.column)
                .map(|(_, v)| v)
                .ok_or_else(|| CoreError::generated_value_missing(ty.name(), property.name()))?;
            let value = convert_from_provider(property.converter(), value)?;
            trace!(
                entry = %column.entry,
                property = %property.name(),
                "store generated value propagated"
            );
            state.set_store_generated(column.entry, column.property, value)?;
        }
        Ok(())
    }
}

impl fmt::Display for ModificationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.operation, self.table, self.entity_type)
    }
}

/// Builds one command per table row with pending changes.
///
/// Entries sharing a row (table-split owned references, or a deleted and an
/// added instance with the same key) are folded into one command.
pub fn build_commands(state: &StateManager) -> CoreResult<Vec<ModificationCommand>> {
    let model = Arc::clone(state.model());
    let mut order: Vec<EntryId> = Vec::new();
    let mut groups: HashMap<EntryId, Vec<EntryId>> = HashMap::new();
    for id in state.entries_to_save() {
        let mut row = state.document_root_of(id)?;
        let row_entry = state.entry(row)?;
        if row_entry.state() == EntityState::Deleted {
            if let Some(partner) = row_entry.shared_identity() {
                row = partner;
            }
        }
        groups
            .entry(row)
            .or_insert_with(|| {
                order.push(row);
                Vec::new()
            })
            .push(id);
    }

    let mut commands = Vec::with_capacity(order.len());
    for row in order {
        let mut members = groups.remove(&row).unwrap_or_default();
        members.retain(|m| *m != row);
        members.insert(0, row);
        if let Some(command) = build_row_command(&model, state, &members)? {
            commands.push(command);
        }
    }
    Ok(commands)
}

fn build_row_command(
    model: &Model,
    state: &StateManager,
    members: &[EntryId],
) -> CoreResult<Option<ModificationCommand>> {
    let root = state.entry(members[0])?;
    let root_type = model.entity_type(root.entity_type());
    let table = root_type.mapping().table.clone().ok_or_else(|| {
        CoreError::mapping(root_type.name(), "not mapped to a table")
    })?;
    let operation = match root.state() {
        EntityState::Added if root.shared_identity().is_none() => CommandOperation::Insert,
        EntityState::Deleted => CommandOperation::Delete,
        _ => CommandOperation::Update,
    };
    let mut builder = ColumnsBuilder::default();

    match operation {
        CommandOperation::Insert => {
            for &member in members {
                let entry = state.entry(member)?;
                let ty = model.entity_type(entry.entity_type());
                for (index, property) in ty.properties().iter().enumerate() {
                    let Some(column) = property.store_name() else {
                        continue;
                    };
                    let generated = match property.value_generated() {
                        ValueGenerated::Never => false,
                        ValueGenerated::OnAdd => {
                            entry.is_temporary(index) || entry.current_value(index).is_null()
                        }
                        ValueGenerated::OnAddOrUpdate => true,
                    };
                    builder.push(ColumnModification {
                        column: column.to_string(),
                        entry: member,
                        property: index,
                        is_read: generated,
                        is_write: !generated,
                        is_condition: false,
                        is_key: property.is_key(),
                        write_null: false,
                        null_condition: false,
                    });
                }
            }
        }
        CommandOperation::Update | CommandOperation::Delete => {
            push_key_conditions(&mut builder, root_type, members[0]);
            for &member in members {
                let entry = state.entry(member)?;
                let ty = model.entity_type(entry.entity_type());
                let is_counterpart = member != members[0] && ty.is_document_root();
                let full = entry.state() == EntityState::Added || entry.shared_identity().is_some();
                for (index, property) in ty.properties().iter().enumerate() {
                    let Some(column) = property.store_name() else {
                        continue;
                    };
                    if property.is_key() {
                        continue;
                    }
                    let mut modification = ColumnModification {
                        column: column.to_string(),
                        entry: member,
                        property: index,
                        is_read: false,
                        is_write: false,
                        is_condition: false,
                        is_key: false,
                        write_null: false,
                        null_condition: false,
                    };
                    if property.is_concurrency_token() && entry.state() != EntityState::Added {
                        modification.is_condition = true;
                        modification.null_condition = entry.original_value(index).is_null();
                    }
                    if operation == CommandOperation::Update {
                        if property.value_generated() == ValueGenerated::OnAddOrUpdate {
                            modification.is_read = true;
                        } else {
                            match entry.state() {
                                EntityState::Deleted if is_counterpart || entry.shared_identity().is_some() => {}
                                EntityState::Deleted => {
                                    modification.is_write = true;
                                    modification.write_null = true;
                                }
                                _ => modification.is_write = full || entry.is_modified(index),
                            }
                        }
                    }
                    if is_counterpart {
                        // the added instance writes the row
                        continue;
                    }
                    if modification.is_read || modification.is_write || modification.is_condition {
                        builder.push(modification);
                    }
                }
            }
            if operation == CommandOperation::Update && !builder.columns.iter().any(|c| c.is_write) {
                trace!(entity_type = %root_type.name(), "row has no column changes");
                return Ok(None);
            }
        }
    }

    Ok(Some(ModificationCommand {
        table,
        schema: root_type.mapping().schema.clone(),
        operation,
        entity_type: root_type.name().to_string(),
        entries: members.to_vec(),
        columns: builder.columns,
    }))
}

fn push_key_conditions(builder: &mut ColumnsBuilder, ty: &EntityType, entry: EntryId) {
    for &index in ty.primary_key() {
        let Some(column) = ty.property(index).and_then(|p| p.store_name()) else {
            continue;
        };
        builder.push(ColumnModification {
            column: column.to_string(),
            entry,
            property: index,
            is_read: false,
            is_write: false,
            is_condition: true,
            is_key: true,
            write_null: false,
            null_condition: false,
        });
    }
}

/// Collects column modifications, keeping the first one per column.
#[derive(Default)]
struct ColumnsBuilder {
    columns: Vec<ColumnModification>,
}

impl ColumnsBuilder {
    fn push(&mut self, column: ColumnModification) {
        if !self.columns.iter().any(|c| c.column == column.column) {
            self.columns.push(column);
        }
    }
}
