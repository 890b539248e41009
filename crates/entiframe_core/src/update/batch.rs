//! Grouping of sorted commands into store round trips.

use super::command::{build_commands, ModificationCommand};
use super::sorter::sort_commands;
use super::sql::UpdateSqlGenerator;
use crate::config::Config;
use crate::error::CoreResult;
use crate::storage::BatchRequest;
use crate::tracking::StateManager;
use tracing::{debug, trace};

/// Commands sent to the store in one round trip.
#[derive(Debug, Clone)]
pub struct ModificationCommandBatch {
    generator: UpdateSqlGenerator,
    max_batch_size: usize,
    max_parameters: usize,
    max_script_length: usize,
    commands: Vec<ModificationCommand>,
    sql: String,
    parameters: usize,
}

impl ModificationCommandBatch {
    /// Creates an empty batch with the caps from `config`.
    #[must_use]
    pub fn new(generator: UpdateSqlGenerator, config: &Config) -> Self {
        Self {
            generator,
            max_batch_size: config.max_batch_size,
            max_parameters: config.max_batch_parameters,
            max_script_length: config.max_script_length,
            commands: Vec::new(),
            sql: String::new(),
            parameters: 0,
        }
    }

    /// Whether `command` fits without exceeding any cap.
    ///
    /// The first command of an empty batch always fits.
    #[must_use]
    pub fn can_add_command(&self, command: &ModificationCommand) -> bool {
        if self.commands.is_empty() {
            return true;
        }
        if self.commands.len() + 1 > self.max_batch_size {
            return false;
        }
        if self.parameters + command.parameter_count() > self.max_parameters {
            return false;
        }
        let mut script = self.sql.clone();
        self.generator.append_command(&mut script, command, self.parameters);
        script.len() <= self.max_script_length
    }

    /// Adds `command` if it fits; returns whether it was accepted.
    pub fn add_command(&mut self, command: ModificationCommand) -> bool {
        if !self.can_add_command(&command) {
            return false;
        }
        self.parameters += self.generator.append_command(&mut self.sql, &command, self.parameters);
        self.commands.push(command);
        true
    }

    /// Commands in script order.
    #[must_use]
    pub fn commands(&self) -> &[ModificationCommand] {
        &self.commands
    }

    /// The generated script.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bound parameters across the batch.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.parameters
    }

    /// Number of commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the batch has no commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Builds the store request with the entries' current values.
    pub fn to_request(&self, state: &StateManager) -> CoreResult<BatchRequest> {
        let commands = self
            .commands
            .iter()
            .map(|c| c.to_request(state))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(BatchRequest {
            sql: self.sql.clone(),
            commands,
        })
    }

    fn split(self) -> Vec<Self> {
        let Self {
            generator,
            max_batch_size,
            max_parameters,
            max_script_length,
            commands,
            ..
        } = self;
        commands
            .into_iter()
            .map(|command| {
                let mut single = Self {
                    generator,
                    max_batch_size,
                    max_parameters,
                    max_script_length,
                    commands: Vec::new(),
                    sql: String::new(),
                    parameters: 0,
                };
                single.add_command(command);
                single
            })
            .collect()
    }
}

/// Turns the tracker's pending changes into ordered batches.
#[derive(Debug, Clone)]
pub struct CommandBatchPreparer {
    generator: UpdateSqlGenerator,
    config: Config,
}

impl CommandBatchPreparer {
    /// Creates a preparer for the configured dialect and caps.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            generator: UpdateSqlGenerator::new(config.dialect),
            config: config.clone(),
        }
    }

    /// Builds, sorts and batches the commands for every pending change.
    pub fn prepare(&self, state: &StateManager) -> CoreResult<Vec<ModificationCommandBatch>> {
        let commands = build_commands(state)?;
        let command_count = commands.len();
        let levels = sort_commands(state, commands)?;
        let batches = self.batch_levels(levels);
        debug!(
            commands = command_count,
            batches = batches.len(),
            "prepared command batches"
        );
        Ok(batches)
    }

    /// Packs sorted levels into batches. A batch never spans two levels.
    #[must_use]
    pub fn batch_levels(&self, levels: Vec<Vec<ModificationCommand>>) -> Vec<ModificationCommandBatch> {
        let mut batches = Vec::new();
        for level in levels {
            let mut batch = ModificationCommandBatch::new(self.generator, &self.config);
            for command in level {
                if !batch.can_add_command(&command) {
                    trace!(
                        commands = batch.len(),
                        parameters = batch.parameter_count(),
                        "batch full"
                    );
                    self.close(&mut batches, batch);
                    batch = ModificationCommandBatch::new(self.generator, &self.config);
                }
                batch.add_command(command);
            }
            self.close(&mut batches, batch);
        }
        batches
    }

    fn close(&self, batches: &mut Vec<ModificationCommandBatch>, batch: ModificationCommandBatch) {
        if batch.is_empty() {
            return;
        }
        if batch.len() > 1 && batch.len() < self.config.min_batch_size {
            batches.extend(batch.split());
        } else {
            batches.push(batch);
        }
    }
}
