//! Script runs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use crashwatch::{Orchestrator, StatementScript, SuiteReport};

use super::{GlobalOptions, load_config, report_path, write_report};
use crate::style::{print_labeled, print_suite, print_warn};

pub fn run(options: &GlobalOptions, path: &Path, report: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config(options)?;
    let script = StatementScript::from_file(path)?;
    if script.statements().is_empty() {
        print_warn(&format!("{} contains no statements", path.display()));
    }
    if script.crash_point().is_none() {
        print_warn("no crash marker; the script runs without a fault");
    }

    let name = path
        .file_name()
        .map_or_else(|| "script".to_string(), |n| n.to_string_lossy().into_owned());
    let report_file = report_path(&config, report);
    let orchestrator = Orchestrator::new(config);

    let mut suite = SuiteReport::new();
    suite.push(orchestrator.run_script(&name, &script));

    write_report(&suite, &report_file)?;
    print_suite(&suite);
    print_labeled("report", &report_file.display().to_string());

    Ok(if suite.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
