//! Orders modification commands so that foreign key constraints hold after
//! every statement.

use super::command::{CommandOperation, ModificationCommand};
use crate::error::{CoreError, CoreResult};
use crate::tracking::StateManager;
use crate::types::{EntryId, ForeignKeyId};
use entiframe_codec::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    from: usize,
    to: usize,
    /// Set when the edge comes from a principal insert the dependent's
    /// foreign key points at.
    foreign_key: Option<(EntryId, ForeignKeyId)>,
}

/// Sorts commands into levels.
///
/// Commands within one level do not depend on each other; every level only
/// depends on earlier ones. A cycle through an optional foreign key is broken
/// by inserting the dependent with a null key and appending an update that
/// sets it once the principal exists.
pub fn sort_commands(
    state: &StateManager,
    mut commands: Vec<ModificationCommand>,
) -> CoreResult<Vec<Vec<ModificationCommand>>> {
    let mut edges = collect_edges(state, &commands)?;
    let mut fixups = Vec::new();
    let mut remaining: BTreeSet<usize> = (0..commands.len()).collect();
    let mut order: Vec<Vec<usize>> = Vec::new();

    while !remaining.is_empty() {
        let level: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&n| !edges.iter().any(|e| e.to == n && remaining.contains(&e.from)))
            .collect();
        if level.is_empty() {
            let breakable = edges.iter().position(|e| {
                remaining.contains(&e.from)
                    && remaining.contains(&e.to)
                    && commands[e.to].operation() == CommandOperation::Insert
                    && e.foreign_key.is_some_and(|(_, fk)| !state.model().foreign_key(fk).is_required())
            });
            let Some(index) = breakable else {
                let mut entity_types: Vec<String> = remaining
                    .iter()
                    .map(|&n| commands[n].entity_type().to_string())
                    .collect();
                entity_types.sort();
                entity_types.dedup();
                return Err(CoreError::CommandOrderingCycle { entity_types });
            };
            let edge = edges.remove(index);
            if let Some((entry, fk)) = edge.foreign_key {
                let properties = state.model().foreign_key(fk).properties().to_vec();
                debug!(
                    command = %commands[edge.to],
                    principal = %commands[edge.from],
                    "breaking command cycle through optional foreign key"
                );
                commands[edge.to].null_out(entry, &properties);
                fixups.push(commands[edge.to].fixup(entry, &properties));
                // edges for the same key are now satisfied by the fixup
                edges.retain(|e| !(e.to == edge.to && e.foreign_key == Some((entry, fk))));
            }
            continue;
        }
        for n in &level {
            remaining.remove(n);
        }
        order.push(level);
    }

    let mut slots: Vec<Option<ModificationCommand>> = commands.into_iter().map(Some).collect();
    let mut levels: Vec<Vec<ModificationCommand>> = order
        .into_iter()
        .map(|level| level.into_iter().filter_map(|n| slots[n].take()).collect())
        .collect();
    if !fixups.is_empty() {
        levels.push(fixups);
    }
    Ok(levels)
}

fn collect_edges(state: &StateManager, commands: &[ModificationCommand]) -> CoreResult<Vec<Edge>> {
    let mut owner_of: HashMap<EntryId, usize> = HashMap::new();
    for (index, command) in commands.iter().enumerate() {
        for &entry in command.entries() {
            owner_of.entry(entry).or_insert(index);
        }
    }

    let mut edges = Vec::new();
    for (index, command) in commands.iter().enumerate() {
        for &entry in command.entries() {
            for (fk, principal) in state.entry(entry)?.principals() {
                let Some(&target) = owner_of.get(&principal) else {
                    continue;
                };
                if target == index {
                    continue;
                }
                let principal_op = commands[target].operation();
                match (principal_op, command.operation()) {
                    (CommandOperation::Insert, CommandOperation::Insert | CommandOperation::Update) => {
                        edges.push(Edge {
                            from: target,
                            to: index,
                            foreign_key: Some((entry, fk)),
                        });
                    }
                    (CommandOperation::Delete, CommandOperation::Delete | CommandOperation::Update) => {
                        edges.push(Edge {
                            from: index,
                            to: target,
                            foreign_key: None,
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    // a deleted row must be gone before another row reuses its key
    let keys: Vec<Option<(String, Vec<Value>)>> = commands
        .iter()
        .map(|c| row_key(state, c))
        .collect::<CoreResult<_>>()?;
    for (delete, command) in commands.iter().enumerate() {
        if command.operation() != CommandOperation::Delete {
            continue;
        }
        for (insert, other) in commands.iter().enumerate() {
            if other.operation() == CommandOperation::Insert
                && keys[delete].is_some()
                && keys[delete] == keys[insert]
            {
                edges.push(Edge {
                    from: delete,
                    to: insert,
                    foreign_key: None,
                });
            }
        }
    }
    Ok(edges)
}

fn row_key(state: &StateManager, command: &ModificationCommand) -> CoreResult<Option<(String, Vec<Value>)>> {
    let Some(&root) = command.entries().first() else {
        return Ok(None);
    };
    let entry = state.entry(root)?;
    let ty = state.model().entity_type(entry.entity_type());
    if ty.primary_key().iter().any(|&p| entry.is_temporary(p)) {
        return Ok(None);
    }
    let values = ty
        .primary_key()
        .iter()
        .map(|&p| entry.current_value(p).clone())
        .collect();
    Ok(Some((command.table().to_string(), values)))
}
