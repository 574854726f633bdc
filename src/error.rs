// ABOUTME: Typed error taxonomy for discovery, mapping and planning
// ABOUTME: Separates "not there" from "could not ask" and config bugs from both

use thiserror::Error;

/// Failure talking to a source database.
///
/// Absence of data is never an error: adapters return `Ok(None)` or an empty
/// vector for that. `NotFound` means the database or table itself vanished.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{kind} '{name}' not found in source")]
    NotFound { kind: &'static str, name: String },

    #[error("source query failed: {context}")]
    Query {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SourceError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        SourceError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn query<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SourceError::Query {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound { .. })
    }
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Driver configuration or label inconsistencies. These are operator errors
/// and abort startup rather than being skipped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error(
        "controller '{controller_id}' in database '{database}' is claimed by instances \
         '{first_instance}' and '{second_instance}'"
    )]
    AmbiguousController {
        database: String,
        controller_id: String,
        first_instance: String,
        second_instance: String,
    },

    #[error("driver '{driver}' binds {what} '{value}' more than once")]
    DuplicateClaim {
        driver: String,
        what: &'static str,
        value: String,
    },

    #[error("driver '{0}' is defined more than once")]
    DuplicateDriver(String),

    #[error("driver '{driver}' has an invalid table pattern: {message}")]
    InvalidPattern { driver: String, message: String },
}

/// Planner sequencing violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("{count} backfill job(s) are still outstanding; incremental planning must wait")]
    UnsyncedOutstanding { count: usize },

    #[error("job {0} is not outstanding")]
    UnknownJob(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_kinds() {
        let missing = SourceError::not_found("table", "Ctrl_1_Data");
        assert!(missing.is_not_found());
        assert_eq!(
            missing.to_string(),
            "table 'Ctrl_1_Data' not found in source"
        );

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let failed = SourceError::query("reading Ctrl_1_Data", io);
        assert!(!failed.is_not_found());
        assert!(std::error::Error::source(&failed).is_some());
    }

    #[test]
    fn test_plan_error_message() {
        let err = PlanError::UnsyncedOutstanding { count: 3 };
        assert!(err.to_string().contains("3 backfill job(s)"));
    }
}
