//! SQL text for modification commands.

use super::command::{CommandOperation, ModificationCommand};
use crate::query::SqlDialect;
use std::fmt::Write;

/// Renders `INSERT`, `UPDATE` and `DELETE` statements for one dialect.
///
/// Only column names and condition shapes are needed, so a command can be
/// measured before its values are known. Parameters are named `@p0`, `@p1`,
/// ... across a whole batch: write values first, then condition values, each
/// in column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateSqlGenerator {
    dialect: SqlDialect,
}

impl UpdateSqlGenerator {
    /// Creates a generator.
    #[must_use]
    pub const fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    /// The dialect.
    #[must_use]
    pub const fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Appends the statement(s) for `command`, numbering parameters from
    /// `first_parameter`. Returns the number of parameters used.
    pub fn append_command(&self, sql: &mut String, command: &ModificationCommand, first_parameter: usize) -> usize {
        let mut next = first_parameter;
        if !sql.is_empty() {
            sql.push('\n');
        }
        match command.operation() {
            CommandOperation::Insert => self.insert(sql, command, &mut next),
            CommandOperation::Update => self.update(sql, command, &mut next),
            CommandOperation::Delete => self.delete(sql, command, &mut next),
        }
        if !command.has_read_columns() {
            sql.push('\n');
            sql.push_str(self.dialect.rowcount_check());
        }
        next - first_parameter
    }

    /// Renders a single command on its own.
    #[must_use]
    pub fn render(&self, command: &ModificationCommand) -> String {
        let mut sql = String::new();
        self.append_command(&mut sql, command, 0);
        sql
    }

    fn table(&self, command: &ModificationCommand) -> String {
        self.dialect.table(command.table(), command.schema())
    }

    fn read_list(&self, command: &ModificationCommand, prefix: &str) -> String {
        command
            .columns()
            .iter()
            .filter(|c| c.is_read())
            .map(|c| format!("{prefix}{}", self.dialect.quote(c.column())))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn output(&self, sql: &mut String, command: &ModificationCommand) {
        if self.dialect == SqlDialect::SqlServer && command.has_read_columns() {
            let _ = write!(sql, "\nOUTPUT {}", self.read_list(command, "INSERTED."));
        }
    }

    fn returning(&self, sql: &mut String, command: &ModificationCommand) {
        if self.dialect == SqlDialect::Sqlite && command.has_read_columns() {
            let _ = write!(sql, "\nRETURNING {}", self.read_list(command, ""));
        }
    }

    fn insert(&self, sql: &mut String, command: &ModificationCommand, next: &mut usize) {
        let writes: Vec<&str> = command
            .columns()
            .iter()
            .filter(|c| c.is_write())
            .map(|c| c.column())
            .collect();
        let _ = write!(sql, "INSERT INTO {}", self.table(command));
        if !writes.is_empty() {
            let names: Vec<String> = writes.iter().map(|c| self.dialect.quote(c)).collect();
            let _ = write!(sql, " ({})", names.join(", "));
        }
        self.output(sql, command);
        if writes.is_empty() {
            sql.push_str("\nDEFAULT VALUES");
        } else {
            let values: Vec<String> = writes.iter().map(|_| parameter(next)).collect();
            let _ = write!(sql, "\nVALUES ({})", values.join(", "));
        }
        self.returning(sql, command);
        sql.push(';');
    }

    fn update(&self, sql: &mut String, command: &ModificationCommand, next: &mut usize) {
        let assignments: Vec<String> = command
            .columns()
            .iter()
            .filter(|c| c.is_write())
            .map(|c| format!("{} = {}", self.dialect.quote(c.column()), parameter(next)))
            .collect();
        let _ = write!(sql, "UPDATE {} SET {}", self.table(command), assignments.join(", "));
        self.output(sql, command);
        self.conditions(sql, command, next);
        self.returning(sql, command);
        sql.push(';');
    }

    fn delete(&self, sql: &mut String, command: &ModificationCommand, next: &mut usize) {
        let _ = write!(sql, "DELETE FROM {}", self.table(command));
        self.conditions(sql, command, next);
        sql.push(';');
    }

    fn conditions(&self, sql: &mut String, command: &ModificationCommand, next: &mut usize) {
        let predicates: Vec<String> = command
            .columns()
            .iter()
            .filter(|c| c.is_condition())
            .map(|c| {
                let column = self.dialect.quote(c.column());
                if c.is_null_condition() {
                    format!("{column} IS NULL")
                } else {
                    format!("{column} = {}", parameter(next))
                }
            })
            .collect();
        if !predicates.is_empty() {
            let _ = write!(sql, "\nWHERE {}", predicates.join(" AND "));
        }
    }
}

fn parameter(next: &mut usize) -> String {
    let name = format!("@p{next}");
    *next += 1;
    name
}
