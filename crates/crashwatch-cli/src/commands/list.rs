//! Scenario listing.

use crashwatch::ScenarioKind;

use crate::style::print_scenario_table;

pub fn run() {
    let rows: Vec<Vec<String>> = ScenarioKind::ALL
        .iter()
        .map(|kind| {
            let family = if kind.is_crash() { "crash" } else { "isolation" };
            vec![
                kind.name().to_string(),
                family.to_string(),
                kind.description().to_string(),
            ]
        })
        .collect();
    print_scenario_table(&rows);
}
