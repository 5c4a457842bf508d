//! Response classification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a statement as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The server accepted the statement.
    Ok,
    /// The server rejected the statement (syntax, constraint, unsupported).
    SqlError,
    /// The server aborted the surrounding transaction.
    Aborted,
}

impl ResponseStatus {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Maps raw response text to a [`ResponseStatus`].
pub trait ResponseClassifier: fmt::Debug + Send + Sync {
    fn classify(&self, text: &str) -> ResponseStatus;
}

/// Substring heuristic for servers without a structured status.
///
/// `abort` wins over `error`/`failure`, so a message such as
/// "abort: write conflict error" reports a transaction abort. A result row
/// that happens to contain one of these words is misclassified.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

impl ResponseClassifier for HeuristicClassifier {
    fn classify(&self, text: &str) -> ResponseStatus {
        let lowered = text.to_ascii_lowercase();
        if lowered.contains("abort") {
            ResponseStatus::Aborted
        } else if lowered.contains("error") || lowered.contains("failure") {
            ResponseStatus::SqlError
        } else {
            ResponseStatus::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("| val |\n| 100 |", ResponseStatus::Ok ; "result table")]
    #[test_case("", ResponseStatus::Ok ; "empty ack")]
    #[test_case("Error: table not found", ResponseStatus::SqlError ; "error prefix")]
    #[test_case("failure", ResponseStatus::SqlError ; "bare failure")]
    #[test_case("abort", ResponseStatus::Aborted ; "bare abort")]
    #[test_case("ABORT: write conflict error", ResponseStatus::Aborted ; "abort wins over error")]
    fn test_heuristic_classifier(text: &str, expected: ResponseStatus) {
        assert_eq!(HeuristicClassifier.classify(text), expected);
    }
}
