//! SQL statement scripts.
//!
//! Format, one statement per `;`-terminated line group:
//!
//! ```text
//! -- comment lines and blank lines are skipped
//! CREATE TABLE t (id INT,
//!                 val INT);      <- joined with a space
//! CREATE STATIC_CHECKPOINT;      <- checkpoint statement
//! crash                          <- fault injected here, never sent
//! ```

use std::path::Path;

use super::statement::{Statement, StatementKind};
use crate::error::WorkloadError;

/// A parsed statement script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementScript {
    statements: Vec<Statement>,
}

impl StatementScript {
    pub fn parse(text: &str) -> Self {
        let mut statements = Vec::new();
        let mut current: Vec<&str> = Vec::new();

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with("--") {
                continue;
            }
            if line.trim_end_matches(';').eq_ignore_ascii_case("crash") {
                if !current.is_empty() {
                    statements.push(Statement::new(current.join(" ")));
                    current.clear();
                }
                statements.push(Statement::crash_marker());
                continue;
            }
            current.push(line);
            if line.ends_with(';') {
                statements.push(Statement::new(current.join(" ")));
                current.clear();
            }
        }
        if !current.is_empty() {
            statements.push(Statement::new(current.join(" ")));
        }

        Self { statements }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WorkloadError> {
        let path = path.as_ref();
        std::fs::read_to_string(path)
            .map(|text| Self::parse(&text))
            .map_err(|source| WorkloadError::Script {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Index of the first crash marker.
    pub fn crash_point(&self) -> Option<usize> {
        self.statements.iter().position(Statement::is_crash_marker)
    }

    /// Read statements of the script, rerun after recovery.
    pub fn verification_queries(&self) -> Vec<&Statement> {
        self.statements
            .iter()
            .filter(|s| s.kind == StatementKind::Read)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "\
-- setup
CREATE TABLE t (id INT,
    val INT);

BEGIN;
INSERT INTO t VALUES (1, 10);
CREATE STATIC_CHECKPOINT;
SELECT * FROM t;
crash
SELECT val FROM t WHERE id = 1;
";

    #[test]
    fn test_parse_script() {
        let script = StatementScript::parse(SCRIPT);
        let sql: Vec<&str> = script.statements().iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "CREATE TABLE t (id INT, val INT);",
                "BEGIN;",
                "INSERT INTO t VALUES (1, 10);",
                "CREATE STATIC_CHECKPOINT;",
                "SELECT * FROM t;",
                "crash",
                "SELECT val FROM t WHERE id = 1;",
            ]
        );
        assert_eq!(script.statements()[3].kind, StatementKind::Checkpoint);
        assert_eq!(script.crash_point(), Some(5));
        assert_eq!(script.verification_queries().len(), 2);
    }

    #[test]
    fn test_unterminated_tail_is_kept() {
        let script = StatementScript::parse("SELECT 1;\nSELECT 2");
        assert_eq!(script.statements().len(), 2);
        assert_eq!(script.statements()[1].sql, "SELECT 2");
        assert_eq!(script.crash_point(), None);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = StatementScript::from_file("/nonexistent/case.sql").unwrap_err();
        assert!(matches!(err, WorkloadError::Script { .. }));
    }
}
