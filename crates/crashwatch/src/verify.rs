//! Post-recovery consistency checks.

use std::net::SocketAddr;
use std::time::Duration;

use crashwatch_wire::{ClientConfig, WireClient};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ConsistencyViolation;
use crate::workload::{CountRange, ExpectedState, Table};

/// Predicate over a query response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// The server answered without an error.
    Succeeds,
    /// A successful answer containing the text.
    Contains(String),
    /// A successful answer not containing the text.
    NotContains(String),
    /// A successful answer whose first integer equals the value.
    ScalarEquals(u64),
    /// A successful answer whose first integer is in the range.
    ScalarInRange(CountRange),
}

impl Expectation {
    pub fn describe(&self) -> String {
        match self {
            Self::Succeeds => "success".to_string(),
            Self::Contains(text) => format!("contains {text:?}"),
            Self::NotContains(text) => format!("does not contain {text:?}"),
            Self::ScalarEquals(n) => n.to_string(),
            Self::ScalarInRange(range) => range.to_string(),
        }
    }

    /// Evaluates the predicate over a successful response text.
    pub fn holds(&self, text: &str) -> bool {
        match self {
            Self::Succeeds => true,
            Self::Contains(needle) => text.contains(needle.as_str()),
            Self::NotContains(needle) => !text.contains(needle.as_str()),
            Self::ScalarEquals(n) => first_integer(text) == Some(*n),
            Self::ScalarInRange(range) => first_integer(text).is_some_and(|n| range.contains(n)),
        }
    }
}

/// A named query and what its answer must satisfy.
#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub query: String,
    pub expect: Expectation,
}

impl Check {
    pub fn new(name: impl Into<String>, query: impl Into<String>, expect: Expectation) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            expect,
        }
    }
}

/// Verdict for one check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    /// Empty for checks computed from recorded results.
    pub query: String,
    pub expected: String,
    pub observed: String,
    pub passed: bool,
}

impl CheckResult {
    /// A check over already-recorded values.
    pub fn assertion(
        name: impl Into<String>,
        expected: impl Into<String>,
        observed: impl Into<String>,
        passed: bool,
    ) -> Self {
        Self {
            name: name.into(),
            query: String::new(),
            expected: expected.into(),
            observed: observed.into(),
            passed,
        }
    }
}

/// All verdicts of one verification pass.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub checks: Vec<CheckResult>,
    pub passed: bool,
}

impl ConsistencyReport {
    pub fn from_results(checks: Vec<CheckResult>) -> Self {
        let passed = checks.iter().all(|c| c.passed);
        Self { checks, passed }
    }

    pub fn push(&mut self, result: CheckResult) {
        self.passed = self.passed && result.passed;
        self.checks.push(result);
    }

    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }

    pub fn into_result(self) -> Result<Self, ConsistencyViolation> {
        if self.passed {
            Ok(self)
        } else {
            Err(ConsistencyViolation {
                failed: self.failed().map(|c| c.name.clone()).collect(),
            })
        }
    }
}

impl Default for ConsistencyReport {
    fn default() -> Self {
        Self::from_results(Vec::new())
    }
}

/// Runs checks against a server, one fresh connection per check.
#[derive(Debug, Clone)]
pub struct ConsistencyVerifier {
    addr: SocketAddr,
    client: ClientConfig,
    timeout: Duration,
}

impl ConsistencyVerifier {
    pub fn new(addr: SocketAddr, client: ClientConfig, timeout: Duration) -> Self {
        Self {
            addr,
            client,
            timeout,
        }
    }

    /// Runs every check; a failing or unreachable check does not stop the
    /// others.
    pub fn verify(&self, checks: &[Check]) -> ConsistencyReport {
        let results = checks.iter().map(|check| self.run_check(check)).collect();
        let report = ConsistencyReport::from_results(results);
        if !report.passed {
            warn!(
                failed = report.failed().count(),
                total = report.checks.len(),
                "consistency checks failed"
            );
        }
        report
    }

    fn run_check(&self, check: &Check) -> CheckResult {
        let (observed, passed) =
            match WireClient::send_once(self.addr, &self.client, &check.query, self.timeout) {
                Ok(response) => {
                    let passed = response.is_ok() && check.expect.holds(&response.text);
                    (response.text, passed)
                }
                Err(e) => (format!("<{e}>"), false),
            };
        debug!(check = %check.name, passed, "consistency check");
        CheckResult {
            name: check.name.clone(),
            query: check.query.clone(),
            expected: check.expect.describe(),
            observed,
            passed,
        }
    }
}

/// Schema, row-count and lookup checks for a generated workload.
///
/// `indexed` adds lookups that go through the secondary indexes.
pub fn standard_checks(tables: &[Table], expected: &ExpectedState, indexed: bool) -> Vec<Check> {
    let mut checks = Vec::new();
    for table in tables {
        checks.push(Check::new(
            format!("{}_exists", table.name()),
            "SHOW TABLES;",
            Expectation::Contains(table.name().to_string()),
        ));
    }
    for table in tables {
        checks.push(Check::new(
            format!("{}_count", table.name()),
            format!("SELECT COUNT(*) FROM {};", table.name()),
            Expectation::ScalarInRange(expected.count(table.name())),
        ));
    }
    if tables.contains(&Table::Warehouse) {
        checks.push(Check::new(
            "warehouse_point_lookup",
            "SELECT * FROM warehouse WHERE w_id = 1;",
            Expectation::Contains("Warehouse001".to_string()),
        ));
    }
    if indexed {
        if tables.contains(&Table::Warehouse) {
            checks.push(Check::new(
                "warehouse_city_lookup",
                "SELECT * FROM warehouse WHERE w_city = 'City1';",
                Expectation::Contains("Warehouse001".to_string()),
            ));
        }
        if tables.contains(&Table::District) {
            checks.push(Check::new(
                "district_point_lookup",
                "SELECT * FROM district WHERE d_id = 1;",
                Expectation::Contains("District001".to_string()),
            ));
        }
    }
    checks
}

/// The checkpoint-assisted recovery took at most `ratio` of the baseline.
pub fn recovery_ratio_check(baseline: Duration, assisted: Duration, ratio: f64) -> CheckResult {
    let t1 = baseline.as_secs_f64();
    let t2 = assisted.as_secs_f64();
    let observed = if t1 > 0.0 { t2 / t1 } else { f64::INFINITY };
    CheckResult::assertion(
        "checkpoint_recovery_ratio",
        format!("t2/t1 <= {ratio:.2}"),
        format!("t2/t1 = {observed:.3} (t1 = {t1:.3}s, t2 = {t2:.3}s)"),
        t1 > 0.0 && observed <= ratio,
    )
}

/// First token made only of ASCII digits.
///
/// Column headers such as `COUNT(*)` and footers such as `(1 row)` never
/// form such a token.
fn first_integer(text: &str) -> Option<u64> {
    text.split(|c: char| c.is_whitespace() || c == '|' || c == ',')
        .find(|token| !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|token| token.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("| COUNT(*) |\n| 52 |", Some(52))]
    #[test_case("52", Some(52))]
    #[test_case(" count \n-------\n  7\n(1 row)", Some(7))]
    #[test_case("empty set", None)]
    fn test_first_integer(text: &str, expected: Option<u64>) {
        assert_eq!(first_integer(text), expected);
    }

    #[test]
    fn test_expectations() {
        assert!(Expectation::Contains("warehouse".into()).holds("| warehouse |"));
        assert!(Expectation::NotContains("130".into()).holds("| 120 |"));
        assert!(Expectation::ScalarEquals(3).holds("| 3 |"));
        let range = CountRange { min: 50, max: 52 };
        assert!(Expectation::ScalarInRange(range).holds("| 51 |"));
        assert!(!Expectation::ScalarInRange(range).holds("| 53 |"));
    }

    #[test]
    fn test_standard_checks_follow_expected_counts() {
        let mut expected = ExpectedState::new();
        expected.add_base("warehouse", 50);
        let checks = standard_checks(&[Table::Warehouse], &expected, false);
        let names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["warehouse_exists", "warehouse_count", "warehouse_point_lookup"]
        );
        assert_eq!(
            checks[1].expect,
            Expectation::ScalarInRange(CountRange::exact(50))
        );
    }

    #[test]
    fn test_report_aggregates_and_names_failures() {
        let mut report = ConsistencyReport::from_results(vec![CheckResult::assertion(
            "a", "1", "1", true,
        )]);
        assert!(report.passed);
        report.push(CheckResult::assertion("b", "1", "2", false));
        report.push(CheckResult::assertion("c", "1", "1", true));
        assert!(!report.passed);
        let violation = report.into_result().unwrap_err();
        assert_eq!(violation.failed, vec!["b".to_string()]);
    }

    #[test]
    fn test_recovery_ratio() {
        let pass = recovery_ratio_check(Duration::from_secs(10), Duration::from_secs(6), 0.7);
        assert!(pass.passed);
        let fail = recovery_ratio_check(Duration::from_secs(10), Duration::from_secs(8), 0.7);
        assert!(!fail.passed);
        let degenerate = recovery_ratio_check(Duration::ZERO, Duration::from_secs(1), 0.7);
        assert!(!degenerate.passed);
    }
}
