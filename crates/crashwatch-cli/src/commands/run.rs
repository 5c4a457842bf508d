//! Suite runs.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use crashwatch::{Orchestrator, ScenarioKind};

use super::{GlobalOptions, interrupt_token, load_config, report_path, write_report};
use crate::style::{print_labeled, print_suite};

pub fn run(
    options: &GlobalOptions,
    scenarios: &[String],
    scale: Option<f64>,
    report: Option<PathBuf>,
) -> Result<ExitCode> {
    let mut config = load_config(options)?;
    for name in scenarios {
        name.parse::<ScenarioKind>().map_err(anyhow::Error::msg)?;
    }
    if !scenarios.is_empty() {
        config.scenarios.enabled = scenarios.to_vec();
    }
    if let Some(scale) = scale {
        config.scenarios.scale = scale;
        config.validate().context("invalid --scale")?;
    }

    let path = report_path(&config, report);
    print_labeled("server", &config.server.binary.display().to_string());
    print_labeled("artifacts", &config.scenarios.artifacts_dir.display().to_string());

    let orchestrator = Orchestrator::new(config).with_interrupt(interrupt_token()?);
    let suite = orchestrator.run_suite();

    write_report(&suite, &path)?;
    print_suite(&suite);
    print_labeled("report", &path.display().to_string());

    Ok(if suite.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
