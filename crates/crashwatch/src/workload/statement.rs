//! Workload statements and their expected effects.

use serde::Serialize;

/// Coarse role of a statement, derived from its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Begin,
    Commit,
    Rollback,
    /// SELECT or SHOW.
    Read,
    /// INSERT, UPDATE or DELETE.
    Write,
    /// Schema changes (CREATE/DROP, including indexes).
    Ddl,
    /// Server checkpoint request.
    Checkpoint,
    /// Placeholder in a stream where a fault must be injected. Never sent.
    CrashMarker,
    Other,
}

impl StatementKind {
    /// Classifies `sql` by its first keyword(s), case-insensitively.
    pub fn classify(sql: &str) -> Self {
        let upper = sql.trim_start().to_ascii_uppercase();
        let mut words = upper
            .split(|c: char| c.is_ascii_whitespace() || c == ';' || c == '(')
            .filter(|w| !w.is_empty());
        match words.next() {
            Some("BEGIN" | "START") => Self::Begin,
            Some("COMMIT") => Self::Commit,
            Some("ROLLBACK" | "ABORT") => Self::Rollback,
            Some("SELECT" | "SHOW") => Self::Read,
            Some("INSERT" | "UPDATE" | "DELETE") => Self::Write,
            Some("CREATE") if words.next() == Some("STATIC_CHECKPOINT") => Self::Checkpoint,
            Some("CREATE" | "DROP" | "ALTER") => Self::Ddl,
            _ => Self::Other,
        }
    }

    /// Ends an explicit transaction.
    pub fn ends_transaction(self) -> bool {
        matches!(self, Self::Commit | Self::Rollback)
    }

    /// Safe to resend after a lost response.
    pub fn is_idempotent(self) -> bool {
        self == Self::Read
    }
}

/// Row-count effect of a write, over ids the generating session owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Effect {
    /// Rows with these ids are inserted.
    Insert { table: String, ids: Vec<u64> },
    /// Rows with ids in `lo..=hi` are deleted if present.
    Delete { table: String, lo: u64, hi: u64 },
}

impl Effect {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Delete { table, .. } => table,
        }
    }
}

/// One entry of a workload statement stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    pub sql: String,
    pub kind: StatementKind,
    /// Expected effect on row counts, when the statement changes them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let kind = StatementKind::classify(&sql);
        Self {
            sql,
            kind,
            effect: None,
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }

    /// A crash marker; the driver injects a fault when it reaches one.
    pub fn crash_marker() -> Self {
        Self {
            sql: String::from("crash"),
            kind: StatementKind::CrashMarker,
            effect: None,
        }
    }

    pub fn is_crash_marker(&self) -> bool {
        self.kind == StatementKind::CrashMarker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("BEGIN;", StatementKind::Begin)]
    #[test_case("  commit;", StatementKind::Commit)]
    #[test_case("abort;", StatementKind::Rollback)]
    #[test_case("ROLLBACK;", StatementKind::Rollback)]
    #[test_case("SELECT COUNT(*) FROM warehouse;", StatementKind::Read)]
    #[test_case("SHOW TABLES;", StatementKind::Read)]
    #[test_case("INSERT INTO t VALUES (1);", StatementKind::Write)]
    #[test_case("update t set v = 1;", StatementKind::Write)]
    #[test_case("CREATE STATIC_CHECKPOINT;", StatementKind::Checkpoint)]
    #[test_case("CREATE TABLE t (id INT);", StatementKind::Ddl)]
    #[test_case("CREATE INDEX idx ON t(id);", StatementKind::Ddl)]
    #[test_case("crash", StatementKind::Other)]
    fn test_classify(sql: &str, expected: StatementKind) {
        assert_eq!(StatementKind::classify(sql), expected);
    }

    #[test]
    fn test_only_reads_are_idempotent() {
        assert!(StatementKind::classify("SELECT * FROM t;").is_idempotent());
        assert!(!StatementKind::classify("UPDATE t SET v = v + 1;").is_idempotent());
        assert!(!StatementKind::classify("COMMIT;").is_idempotent());
    }

    #[test]
    fn test_crash_marker_is_not_classified_from_text() {
        let marker = Statement::crash_marker();
        assert!(marker.is_crash_marker());
        assert!(!Statement::new("crash").is_crash_marker());
    }
}
