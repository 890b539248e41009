//! Session configuration.

use crate::query::SqlDialect;

/// Whether queries attach their results to the change tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTrackingBehavior {
    /// Results are tracked and identity-resolved.
    #[default]
    TrackAll,
    /// Results are plain snapshots.
    NoTracking,
}

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of commands in one batch.
    pub max_batch_size: usize,

    /// Maximum number of bound parameters in one batch.
    pub max_batch_parameters: usize,

    /// Maximum length of one batch's SQL script, in bytes.
    pub max_script_length: usize,

    /// Batches with fewer commands than this are sent one command at a time.
    pub min_batch_size: usize,

    /// SQL dialect for relational stores.
    pub dialect: SqlDialect,

    /// Whether parameter values may appear in logs.
    pub sensitive_data_logging: bool,

    /// Default tracking behavior for queries.
    pub tracking: QueryTrackingBehavior,

    /// Whether save compares current and original values before writing.
    pub detect_changes_on_save: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_size: 42,
            max_batch_parameters: 2100,
            max_script_length: 128 * 1024, // 128 KiB
            min_batch_size: 1,
            dialect: SqlDialect::SqlServer,
            sensitive_data_logging: false,
            tracking: QueryTrackingBehavior::TrackAll,
            detect_changes_on_save: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of commands per batch.
    #[must_use]
    pub const fn max_batch_size(mut self, value: usize) -> Self {
        self.max_batch_size = value;
        self
    }

    /// Sets the maximum number of parameters per batch.
    #[must_use]
    pub const fn max_batch_parameters(mut self, value: usize) -> Self {
        self.max_batch_parameters = value;
        self
    }

    /// Sets the maximum script length per batch.
    #[must_use]
    pub const fn max_script_length(mut self, value: usize) -> Self {
        self.max_script_length = value;
        self
    }

    /// Sets the minimum batch size.
    #[must_use]
    pub const fn min_batch_size(mut self, value: usize) -> Self {
        self.min_batch_size = value;
        self
    }

    /// Sets the SQL dialect.
    #[must_use]
    pub const fn dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Sets whether parameter values may be logged.
    #[must_use]
    pub const fn sensitive_data_logging(mut self, value: bool) -> Self {
        self.sensitive_data_logging = value;
        self
    }

    /// Sets the default query tracking behavior.
    #[must_use]
    pub const fn tracking(mut self, tracking: QueryTrackingBehavior) -> Self {
        self.tracking = tracking;
        self
    }

    /// Sets whether changes are detected on save.
    #[must_use]
    pub const fn detect_changes_on_save(mut self, value: bool) -> Self {
        self.detect_changes_on_save = value;
        self
    }
}
