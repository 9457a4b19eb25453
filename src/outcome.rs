//! Result of one statement execution.

use std::time::Duration;

use serde::Serialize;

use crate::pg::connection::parse_rows_affected;
use crate::pg::{QueryResult, Row, SharedColumns};

/// Rows returned by a statement together with how long it took.
///
/// `duration` covers the statement round trip only; pool checkout, health
/// checks and retry backoff are excluded.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub rows: Vec<Row>,
    #[serde(skip)]
    pub columns: SharedColumns,
    pub command_tag: String,
    #[serde(rename = "durationMs", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl QueryOutcome {
    pub(crate) fn new(result: QueryResult, duration: Duration) -> Self {
        Self {
            rows: result.rows,
            columns: result.columns,
            command_tag: result.command_tag,
            duration,
        }
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }

    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|field| field.name.as_str())
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn outcome(tag: &str, millis: u64) -> QueryOutcome {
        QueryOutcome::new(
            QueryResult {
                columns: Arc::new(Vec::new()),
                rows: Vec::new(),
                command_tag: tag.to_string(),
            },
            Duration::from_millis(millis),
        )
    }

    #[test]
    fn test_duration_ms() {
        assert_eq!(outcome("SELECT 0", 125).duration_ms(), 125.0);
    }

    #[test]
    fn test_rows_affected() {
        assert_eq!(outcome("INSERT 0 5", 0).rows_affected(), 5);
        assert_eq!(outcome("UPDATE 3", 0).rows_affected(), 3);
        assert_eq!(outcome("CREATE TABLE", 0).rows_affected(), 0);
        assert_eq!(outcome("", 0).rows_affected(), 0);
    }

    #[test]
    fn test_serializes_rows_and_duration() {
        let json = serde_json::to_value(outcome("SELECT 0", 40)).unwrap();
        assert_eq!(json["durationMs"], serde_json::json!(40.0));
        assert_eq!(json["rows"], serde_json::json!([]));
        assert_eq!(json["command_tag"], serde_json::json!("SELECT 0"));
    }
}
