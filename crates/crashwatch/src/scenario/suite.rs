//! Suite orchestration.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crashwatch_config::CrashwatchConfig;
use crashwatch_wire::InteractionLog;
use tracing::{error, info, instrument, warn};

use super::{Baseline, ScenarioKind, crash, isolation};
use crate::cancel::CancelToken;
use crate::error::HarnessResult;
use crate::report::{ScenarioReport, SuiteReport};
use crate::session::SessionFactory;
use crate::settings::{client_config, launch_spec, server_addr, supervisor_config};
use crate::supervisor::{LaunchSpec, ServerHandle, Supervisor};
use crate::verify::ConsistencyVerifier;
use crate::workload::StatementScript;

/// Per-scenario resources.
#[derive(Debug)]
pub(crate) struct ScenarioEnv {
    pub addr: SocketAddr,
    pub spec: LaunchSpec,
    pub log: InteractionLog,
    /// Fault flag shared by the scenario's drivers.
    pub cancel: CancelToken,
}

impl ScenarioEnv {
    pub fn factory(&self, config: &CrashwatchConfig) -> SessionFactory {
        SessionFactory::new(
            self.addr,
            client_config(&config.wire),
            config.wire.session_timeout(),
        )
        .with_log(self.log.clone())
        .with_cancel(self.cancel.clone())
    }

    pub fn verifier(&self, config: &CrashwatchConfig) -> ConsistencyVerifier {
        ConsistencyVerifier::new(
            self.addr,
            client_config(&config.wire),
            config.wire.statement_timeout(),
        )
    }
}

/// Server slot owned by the orchestrator; stopped after every scenario.
pub(crate) type ServerSlot = Option<ServerHandle>;

/// Runs scenarios one at a time, each isolated from the others.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: CrashwatchConfig,
    interrupt: CancelToken,
}

impl Orchestrator {
    pub fn new(config: CrashwatchConfig) -> Self {
        Self {
            config,
            interrupt: CancelToken::new(),
        }
    }

    /// Once `token` is cancelled, scenarios not yet started are skipped.
    pub fn with_interrupt(mut self, token: CancelToken) -> Self {
        self.interrupt = token;
        self
    }

    pub fn config(&self) -> &CrashwatchConfig {
        &self.config
    }

    /// Runs every enabled scenario in suite order.
    ///
    /// The no-checkpoint latency (t1) feeds the with-checkpoint ratio
    /// check. A failing scenario never stops the suite.
    pub fn run_suite(&self) -> SuiteReport {
        let mut suite = SuiteReport::new();
        let mut baseline = Baseline::NotRun;
        for kind in ScenarioKind::ALL {
            if !self.config.scenarios.is_enabled(kind.name()) {
                continue;
            }
            if self.interrupt.is_cancelled() {
                let mut report = ScenarioReport::new(kind.name(), self.artifacts_for(kind.name()));
                report.skipped = Some("interrupted".to_string());
                suite.push(report);
                continue;
            }

            let report = self.run_scenario(kind, baseline);
            match kind {
                ScenarioKind::NoCheckpoint => {
                    baseline = Baseline::from_report(&report);
                    suite.t1 = baseline.latency();
                }
                ScenarioKind::WithCheckpoint => suite.t2 = report.recovery_latency(),
                _ => {}
            }
            suite.push(report);
        }
        info!(
            scenarios = suite.scenarios.len(),
            failed = suite.failed().count(),
            passed = suite.passed,
            "suite finished"
        );
        suite
    }

    /// Runs one scenario. `baseline` feeds the checkpoint ratio check.
    pub fn run_scenario(&self, kind: ScenarioKind, baseline: Baseline) -> ScenarioReport {
        self.run_isolated(kind.name(), |env, supervisor, slot, report| {
            if kind.is_crash() {
                crash::run(&self.config, kind, baseline, env, supervisor, slot, report)
            } else {
                isolation::run(&self.config, kind, env, supervisor, slot, report)
            }
        })
    }

    /// Runs a statement script as a scenario named `script-<name>`.
    pub fn run_script(&self, name: &str, script: &StatementScript) -> ScenarioReport {
        let name = format!("script-{}", sanitize(name));
        self.run_isolated(&name, |env, supervisor, slot, report| {
            crash::run_script(&self.config, script, env, supervisor, slot, report)
        })
    }

    #[instrument(skip(self, body), fields(scenario = %name))]
    fn run_isolated<F>(&self, name: &str, body: F) -> ScenarioReport
    where
        F: FnOnce(
            &ScenarioEnv,
            &mut Supervisor,
            &mut ServerSlot,
            &mut ScenarioReport,
        ) -> HarnessResult<()>,
    {
        let started = Instant::now();
        let artifacts = self.artifacts_for(name);
        let mut report = ScenarioReport::new(name, &artifacts);
        let mut supervisor = Supervisor::new(supervisor_config(&self.config));
        let mut slot: ServerSlot = None;

        info!("scenario starting");
        let result = self
            .prepare(name, &artifacts)
            .and_then(|env| body(&env, &mut supervisor, &mut slot, &mut report));
        if let Err(e) = result {
            error!(error = %e, "scenario aborted");
            report.fail(e.to_string());
        }

        if let Some(mut handle) = slot.take() {
            if let Err(e) = supervisor.stop(&mut handle, self.config.server.graceful_timeout()) {
                warn!(error = %e, "failed to stop server");
                report.fail(format!("failed to stop server: {e}"));
            }
        }

        if report.failure.is_none() {
            match report.consistency.clone().into_result() {
                Ok(_) => report.passed = true,
                Err(violation) => report.fail(violation.to_string()),
            }
        }
        report.elapsed = started.elapsed();
        info!(
            passed = report.passed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "scenario finished"
        );
        report
    }

    fn prepare(&self, name: &str, artifacts: &Path) -> HarnessResult<ScenarioEnv> {
        let server = &self.config.server;
        let addr = server_addr(&self.config)?;
        let instance = format!("{}_{}", server.instance_prefix, sanitize(name));

        let workdir = server.workdir.join(&instance);
        if workdir.exists() {
            fs::remove_dir_all(&workdir)?;
        }
        fs::create_dir_all(&workdir)?;
        if artifacts.exists() {
            fs::remove_dir_all(artifacts)?;
        }
        fs::create_dir_all(artifacts)?;

        let log = if self.config.wire.interaction_log {
            InteractionLog::open(artifacts.join("interactions.jsonl"))?
        } else {
            InteractionLog::disabled()
        };

        let spec = launch_spec(&self.config, &instance, addr, artifacts);

        Ok(ScenarioEnv {
            addr,
            spec,
            log,
            cancel: CancelToken::new(),
        })
    }

    fn artifacts_for(&self, name: &str) -> PathBuf {
        self.config.scenarios.artifacts_dir.join(name)
    }
}

/// Keeps names usable as instance and directory names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("single-thread"), "single_thread");
        assert_eq!(sanitize("script-my file.sql"), "script_my_file_sql");
    }

    #[test]
    fn test_missing_binary_fails_scenario_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CrashwatchConfig::smoke();
        config.server.binary = dir.path().join("bin/missing-server");
        config.server.workdir = dir.path().join("work");
        config.scenarios.artifacts_dir = dir.path().join("artifacts");

        let orchestrator = Orchestrator::new(config);
        let report = orchestrator.run_scenario(ScenarioKind::SingleThread, Baseline::NotRun);
        assert!(!report.passed);
        assert!(
            report.failure.as_deref().unwrap_or_default().contains("not found"),
            "{:?}",
            report.failure
        );
    }
}
