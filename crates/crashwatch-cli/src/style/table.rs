//! Tables using comfy-table.

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use crashwatch::{ScenarioReport, SuiteReport};

use super::colors::SemanticStyle;
use super::{print_error, print_labeled, print_success};

fn base_table(columns: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header: Vec<Cell> = columns
        .iter()
        .map(|col| {
            if super::no_color() {
                Cell::new(col)
            } else {
                Cell::new(col).add_attribute(Attribute::Bold).fg(Color::Cyan)
            }
        })
        .collect();
    table.set_header(header);
    table
}

pub fn print_scenario_table(rows: &[Vec<String>]) {
    let mut table = base_table(&["scenario", "family", "description"]);
    for row in rows {
        table.add_row(row);
    }
    println!("{table}");
}

fn verdict(report: &ScenarioReport) -> Cell {
    let (text, color) = if report.skipped.is_some() {
        ("SKIP", Color::Yellow)
    } else if report.passed {
        ("PASS", Color::Green)
    } else {
        ("FAIL", Color::Red)
    };
    if super::no_color() {
        Cell::new(text)
    } else {
        Cell::new(text).fg(color).add_attribute(Attribute::Bold)
    }
}

fn ms(duration: std::time::Duration) -> String {
    format!("{:.0}", duration.as_secs_f64() * 1000.0)
}

/// Creates the per-scenario summary table.
pub fn suite_table(suite: &SuiteReport) -> Table {
    let mut table = base_table(&["scenario", "result", "fault at", "recovery ms", "checks", "detail"]);
    for report in &suite.scenarios {
        let fault = report.fault.as_ref().map_or_else(String::new, |f| {
            format!("#{} ({:.0}%)", f.statement_index, f.progress_fraction * 100.0)
        });
        let recovery = report
            .recovery
            .as_ref()
            .map_or_else(String::new, |r| ms(r.latency));
        let checks = &report.consistency.checks;
        let passed = checks.iter().filter(|c| c.passed).count();
        let detail = report
            .skipped
            .clone()
            .or_else(|| report.failure.clone())
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&report.name),
            verdict(report),
            Cell::new(fault),
            Cell::new(recovery),
            Cell::new(format!("{passed}/{}", checks.len())),
            Cell::new(detail),
        ]);
    }
    table
}

/// Prints the summary table, the checkpoint latencies and the verdict.
pub fn print_suite(suite: &SuiteReport) {
    println!("{}", suite_table(suite));
    if let Some(t1) = suite.t1 {
        print_labeled("t1 (no checkpoint)", &format!("{} ms", ms(t1)));
    }
    if let Some(t2) = suite.t2 {
        print_labeled("t2 (with checkpoint)", &format!("{} ms", ms(t2)));
    }
    let failed = suite.failed().count();
    if suite.passed {
        print_success(&format!("{} scenarios passed", suite.scenarios.len()));
    } else {
        print_error(&format!(
            "{failed} of {} scenarios failed",
            suite.scenarios.len()
        ));
        for report in suite.failed() {
            for check in report.consistency.failed() {
                eprintln!(
                    "  {} {}: expected {}, observed {}",
                    report.name.muted(),
                    check.name,
                    check.expected,
                    check.observed.lines().next().unwrap_or_default()
                );
            }
        }
    }
}
