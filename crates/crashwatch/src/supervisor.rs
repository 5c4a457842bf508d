//! Server process supervision.
//!
//! The server is launched as `binary <instance> [args...]` in its own
//! process group, with stdout and stderr redirected to per-launch files.
//! Faults and forced stops signal the whole group so helper processes the
//! server forks die with it.

#![allow(unsafe_code, reason = "process groups are only reachable through libc::killpg")]

use std::fs::{self, File};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crashwatch_wire::{ClientConfig, WireClient};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{StartError, SupervisorError};

/// Bytes of captured output kept in error messages.
const CAPTURE_TAIL: usize = 4096;

/// Lifecycle state of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Crashed,
    Recovering,
}

/// Everything needed to (re)launch the same server instance.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub instance: String,
    /// Extra arguments; `{host}`, `{port}` and `{instance}` are substituted.
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory holding the server's on-disk state.
    pub workdir: PathBuf,
    /// Where stdout/stderr of each launch are written.
    pub log_dir: PathBuf,
    pub addr: SocketAddr,
}

impl LaunchSpec {
    pub fn new(
        binary: impl Into<PathBuf>,
        instance: impl Into<String>,
        workdir: impl Into<PathBuf>,
        addr: SocketAddr,
    ) -> Self {
        let workdir = workdir.into();
        Self {
            binary: binary.into(),
            instance: instance.into(),
            args: Vec::new(),
            env: Vec::new(),
            log_dir: workdir.clone(),
            workdir,
            addr,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Full argument vector: the instance name followed by substituted args.
    pub fn command_args(&self) -> Vec<String> {
        let host = self.addr.ip().to_string();
        let port = self.addr.port().to_string();
        std::iter::once(self.instance.clone())
            .chain(self.args.iter().map(|arg| {
                arg.replace("{host}", &host)
                    .replace("{port}", &port)
                    .replace("{instance}", &self.instance)
            }))
            .collect()
    }
}

/// Sends SIGKILL to a server's process group without needing the handle.
///
/// Cheap to copy into a fault injector running on a driver thread.
#[derive(Debug, Clone, Copy)]
pub struct KillSwitch {
    pid: u32,
    pgid: i32,
}

impl KillSwitch {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn fire(&self) -> Result<(), SupervisorError> {
        signal_group(self.pgid, libc::SIGKILL).map_err(|source| SupervisorError::Signal {
            pgid: self.pgid,
            source,
        })
    }
}

/// One launched server process.
#[derive(Debug)]
pub struct ServerHandle {
    spec: LaunchSpec,
    child: Option<Child>,
    pid: u32,
    pgid: i32,
    state: ServerState,
    generation: u32,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    exit: Option<ExitStatus>,
}

impl ServerHandle {
    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn addr(&self) -> SocketAddr {
        self.spec.addr
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ServerState) {
        self.state = state;
    }

    /// How many launches of the supervisor preceded this one.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch {
            pid: self.pid,
            pgid: self.pgid,
        }
    }

    /// Exit status if the process has exited, reaping it on first sight.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(status) => self.exit = status,
                    Err(e) => debug!(pid = self.pid, error = %e, "try_wait failed"),
                }
            }
        }
        self.exit
    }

    pub fn captured_stdout(&self) -> String {
        read_tail(&self.stdout_path)
    }

    pub fn captured_stderr(&self) -> String {
        read_tail(&self.stderr_path)
    }

    fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll_exit().is_some() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.child.is_some() && self.poll_exit().is_none() {
            warn!(pid = self.pid, "server handle dropped while running; killing process group");
            let _ = signal_group(self.pgid, libc::SIGKILL);
            if let Some(child) = self.child.as_mut() {
                let _ = child.wait();
            }
        }
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub probe_statement: String,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    pub startup_timeout: Duration,
    pub graceful_timeout: Duration,
    pub port_release_timeout: Duration,
    /// Bound on reaping a process after SIGKILL.
    pub reap_timeout: Duration,
    /// Statement asking the server to shut itself down, if it has one.
    pub shutdown_statement: Option<String>,
    pub client: ClientConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_statement: "SELECT 1;".to_string(),
            probe_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            startup_timeout: Duration::from_secs(30),
            graceful_timeout: Duration::from_secs(5),
            port_release_timeout: Duration::from_secs(2),
            reap_timeout: Duration::from_secs(5),
            shutdown_statement: None,
            client: ClientConfig::default(),
        }
    }
}

/// Starts, stops and kills server processes.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    launches: u32,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            launches: 0,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launches the server and waits until it answers the liveness probe.
    ///
    /// Fails as soon as the process exits, with its captured output, rather
    /// than waiting out the startup timeout.
    #[instrument(skip(self, spec), fields(instance = %spec.instance, addr = %spec.addr))]
    pub fn start(&mut self, spec: &LaunchSpec) -> Result<ServerHandle, StartError> {
        let mut handle = self.spawn(spec)?;
        match self.wait_ready(&mut handle, self.config.startup_timeout) {
            Ok(elapsed) => {
                info!(
                    pid = handle.pid,
                    startup_ms = elapsed.as_millis() as u64,
                    "server ready"
                );
                Ok(handle)
            }
            Err(e) => {
                if let Err(kill_err) = self.kill(&mut handle) {
                    warn!(error = %kill_err, "failed to clean up server after failed start");
                }
                Err(e)
            }
        }
    }

    /// Launches the server without waiting for readiness.
    pub fn spawn(&mut self, spec: &LaunchSpec) -> Result<ServerHandle, StartError> {
        let binary = resolve_binary(&spec.binary)?;

        for dir in [&spec.workdir, &spec.log_dir] {
            fs::create_dir_all(dir).map_err(|source| StartError::Workdir {
                path: dir.clone(),
                source,
            })?;
        }

        self.wait_port_free(spec.addr)?;

        let generation = self.launches;
        self.launches += 1;
        let stdout_path = spec
            .log_dir
            .join(format!("{}.{generation}.stdout.log", spec.instance));
        let stderr_path = spec
            .log_dir
            .join(format!("{}.{generation}.stderr.log", spec.instance));
        let stdout = create_log(&stdout_path)?;
        let stderr = create_log(&stderr_path)?;

        let mut command = Command::new(&binary);
        command
            .args(spec.command_args())
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);

        let child = command.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                StartError::BinaryMissing(binary.clone())
            } else {
                StartError::Spawn {
                    binary: binary.clone(),
                    source,
                }
            }
        })?;

        let pid = child.id();
        let pgid = i32::try_from(pid).map_err(|_| StartError::Spawn {
            binary: binary.clone(),
            source: io::Error::other(format!("pid {pid} out of range")),
        })?;
        info!(pid, generation, binary = %binary.display(), "server spawned");

        Ok(ServerHandle {
            spec: spec.clone(),
            child: Some(child),
            pid,
            pgid,
            state: ServerState::Starting,
            generation,
            stdout_path,
            stderr_path,
            exit: None,
        })
    }

    /// Polls the liveness probe until it succeeds, the process exits, or
    /// `timeout` elapses.
    pub fn wait_ready(
        &self,
        handle: &mut ServerHandle,
        timeout: Duration,
    ) -> Result<Duration, StartError> {
        let started = Instant::now();
        loop {
            if let Some(status) = handle.poll_exit() {
                handle.state = ServerState::Crashed;
                return Err(StartError::ExitedEarly {
                    status: status.to_string(),
                    stdout: handle.captured_stdout(),
                    stderr: handle.captured_stderr(),
                });
            }
            if self.probe(handle.addr()) {
                handle.state = ServerState::Running;
                return Ok(started.elapsed());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(StartError::Timeout(timeout));
            }
            thread::sleep(self.config.poll_interval.min(timeout - elapsed));
        }
    }

    /// True if the liveness probe gets an `Ok` answer.
    pub fn probe(&self, addr: SocketAddr) -> bool {
        WireClient::send_once(
            addr,
            &self.config.client,
            &self.config.probe_statement,
            self.config.probe_timeout,
        )
        .is_ok_and(|r| r.is_ok())
    }

    /// Two-phase stop: graceful request, then SIGKILL after
    /// `graceful_timeout`. Stopping a stopped server is a no-op.
    #[instrument(skip(self, handle), fields(pid = handle.pid))]
    pub fn stop(
        &self,
        handle: &mut ServerHandle,
        graceful_timeout: Duration,
    ) -> Result<(), SupervisorError> {
        if handle.child.is_none() || handle.poll_exit().is_some() {
            handle.state = ServerState::Stopped;
            return Ok(());
        }

        match &self.config.shutdown_statement {
            Some(statement) => {
                debug!(statement = %statement, "requesting protocol shutdown");
                let _ = WireClient::send_once(
                    handle.addr(),
                    &self.config.client,
                    statement,
                    self.config.probe_timeout,
                );
            }
            None => {
                signal_group(handle.pgid, libc::SIGTERM).map_err(|source| {
                    SupervisorError::Signal {
                        pgid: handle.pgid,
                        source,
                    }
                })?;
            }
        }

        if !handle.wait_exit(graceful_timeout) {
            warn!(timeout = ?graceful_timeout, "graceful stop timed out; escalating to SIGKILL");
            handle.kill_switch().fire()?;
            if !handle.wait_exit(self.config.reap_timeout) {
                return Err(SupervisorError::Unkillable {
                    pid: handle.pid,
                    timeout: self.config.reap_timeout,
                });
            }
        }

        handle.state = ServerState::Stopped;
        info!("server stopped");
        Ok(())
    }

    /// Immediate SIGKILL of the process group, then a bounded reap.
    pub fn kill(&self, handle: &mut ServerHandle) -> Result<(), SupervisorError> {
        if handle.child.is_some() && handle.poll_exit().is_none() {
            handle.kill_switch().fire()?;
            if !handle.wait_exit(self.config.reap_timeout) {
                return Err(SupervisorError::Unkillable {
                    pid: handle.pid,
                    timeout: self.config.reap_timeout,
                });
            }
        }
        handle.state = ServerState::Crashed;
        Ok(())
    }

    /// True while the process has not exited.
    pub fn is_alive(&self, handle: &mut ServerHandle) -> bool {
        handle.child.is_some() && handle.poll_exit().is_none()
    }

    fn wait_port_free(&self, addr: SocketAddr) -> Result<(), StartError> {
        let deadline = Instant::now() + self.config.port_release_timeout;
        loop {
            match TcpListener::bind(addr) {
                Ok(_) => return Ok(()),
                Err(e) if Instant::now() < deadline => {
                    debug!(%addr, error = %e, "waiting for port to be released");
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => return Err(StartError::PortBusy(addr)),
            }
        }
    }
}

fn resolve_binary(binary: &Path) -> Result<PathBuf, StartError> {
    // Bare names are left to PATH lookup.
    if binary.components().count() <= 1 {
        return Ok(binary.to_path_buf());
    }
    fs::canonicalize(binary).map_err(|_| StartError::BinaryMissing(binary.to_path_buf()))
}

fn create_log(path: &Path) -> Result<File, StartError> {
    File::create(path).map_err(|source| StartError::Workdir {
        path: path.to_path_buf(),
        source,
    })
}

fn read_tail(path: &Path) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let start = bytes.len().saturating_sub(CAPTURE_TAIL);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

fn signal_group(pgid: i32, signal: libc::c_int) -> io::Result<()> {
    if pgid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }
    // SAFETY: killpg only reads its two integer arguments. pgid is positive,
    // so it names the group created for our child and never our own group.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Group already gone.
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:8765".parse().unwrap()
    }

    #[test]
    fn test_command_args_substitute_placeholders() {
        let spec = LaunchSpec::new("bin/server", "crash_test_db", "/tmp/work", addr())
            .with_args(["--port", "{port}", "--name={instance}", "{host}"]);
        assert_eq!(
            spec.command_args(),
            vec!["crash_test_db", "--port", "8765", "--name=crash_test_db", "127.0.0.1"]
        );
    }

    #[test]
    fn test_missing_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new(dir.path().join("no/such/server"), "db", dir.path(), addr());
        let mut supervisor = Supervisor::new(SupervisorConfig::default());
        assert!(matches!(
            supervisor.spawn(&spec),
            Err(StartError::BinaryMissing(_))
        ));
    }

    #[test]
    fn test_refuses_to_signal_own_group() {
        assert!(signal_group(0, libc::SIGTERM).is_err());
    }
}
