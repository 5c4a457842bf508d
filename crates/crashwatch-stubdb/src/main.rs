//! Target server for the crashwatch integration tests.
//!
//! Speaks the harness wire protocol (NUL-terminated statements, NUL-ended
//! text replies) over a small SQL subset with snapshot isolation, a redo
//! log and static checkpoints. The port is bound before recovery starts;
//! until recovery completes every data statement is refused.
//!
//! ```text
//! crashwatch-stubdb <instance> [--host <host>] [--port <port>]
//! ```
//!
//! Data lives in `./<instance>`. Test knobs:
//!
//! - `STUBDB_STARTUP_DELAY_MS`: sleep before binding
//! - `STUBDB_REDO_DELAY_US`: extra time per replayed log entry
//! - `STUBDB_EXIT_IMMEDIATELY`: exit with status 3 before binding

mod engine;
mod sql;

use std::env;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{self, ExitCode};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use engine::{Engine, IoCounters, Phase, TxnId, render};
use sql::Command;

/// Fixture SQL server for the crashwatch integration tests.
#[derive(Debug, Parser)]
#[command(name = "crashwatch-stubdb", version)]
struct Args {
    /// Instance name; data lives in `./<instance>`.
    instance: String,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8765)]
    port: u16,
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// A connection's view of its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnSlot {
    Idle,
    Open(TxnId),
    /// Aborted by the server; only COMMIT or ROLLBACK end it.
    Aborted,
}

impl TxnSlot {
    fn id(self) -> Option<TxnId> {
        match self {
            Self::Open(id) => Some(id),
            Self::Idle | Self::Aborted => None,
        }
    }
}

#[derive(Debug)]
struct State {
    phase: Phase,
    io: IoCounters,
    engine: Option<Engine>,
}

#[derive(Debug)]
struct Server {
    state: Mutex<State>,
}

impl Server {
    fn new() -> Self {
        Self {
            state: Mutex::new(State {
                phase: Phase::Analysis,
                io: IoCounters::default(),
                engine: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recover(&self, dir: &Path, redo_delay: Duration) {
        let result = Engine::recover(dir, redo_delay, |phase, io| {
            let mut state = self.lock();
            if state.phase != phase {
                info!(phase = phase.name(), "recovery phase");
            }
            state.phase = phase;
            state.io = io;
        });
        match result {
            Ok(engine) => {
                let mut state = self.lock();
                state.io = engine.io();
                state.engine = Some(engine);
                state.phase = Phase::Complete;
                info!("recovery complete");
            }
            Err(e) => {
                error!(error = %e, dir = %dir.display(), "recovery failed");
                process::exit(4);
            }
        }
    }

    fn execute(&self, slot: &mut TxnSlot, sql: &str) -> String {
        let command = match sql::parse(sql) {
            Ok(command) => command,
            Err(e) => return format!("error: {e}"),
        };
        let mut state = self.lock();
        match command {
            Command::Crash => {
                warn!("crash requested");
                process::exit(1);
            }
            Command::ShowRecoveryPhase => return format!("phase: {}", state.phase.name()),
            Command::ShowIoStatistics => {
                let io = state.engine.as_ref().map_or(state.io, Engine::io);
                return io.to_json();
            }
            _ => {}
        }
        let Some(engine) = state.engine.as_mut() else {
            return "error: recovery in progress".to_string();
        };
        run_command(engine, slot, command)
    }

    fn disconnect(&self, slot: TxnSlot) {
        if let Some(id) = slot.id() {
            if let Some(engine) = self.lock().engine.as_mut() {
                engine.rollback(id);
            }
        }
    }
}

fn run_command(engine: &mut Engine, slot: &mut TxnSlot, command: Command) -> String {
    match command {
        Command::Begin => match *slot {
            TxnSlot::Open(_) => "error: transaction already in progress".to_string(),
            TxnSlot::Idle | TxnSlot::Aborted => {
                *slot = TxnSlot::Open(engine.begin());
                "ok: transaction started".to_string()
            }
        },
        Command::Commit => match std::mem::replace(slot, TxnSlot::Idle) {
            TxnSlot::Open(id) => engine.commit(id).text,
            TxnSlot::Aborted => "abort: transaction was aborted".to_string(),
            TxnSlot::Idle => "ok: no transaction in progress".to_string(),
        },
        Command::Rollback => {
            if let TxnSlot::Open(id) = std::mem::replace(slot, TxnSlot::Idle) {
                engine.rollback(id);
            }
            "ok: rolled back".to_string()
        }
        _ if *slot == TxnSlot::Aborted => {
            "abort: current transaction is aborted until the end of the block".to_string()
        }
        Command::Literal(value) => render(&["?column?".to_string()], &[vec![value.to_string()]]),
        Command::CreateTable { name, columns } => engine.create_table(name, columns).text,
        Command::CreateIndex {
            name,
            table,
            column,
        } => engine.create_index(name, table, column).text,
        Command::Checkpoint => match engine.checkpoint() {
            Ok(()) => "ok: checkpoint written".to_string(),
            Err(e) => format!("error: checkpoint failed: {e}"),
        },
        Command::ShowTables => {
            let rows: Vec<Vec<String>> = engine
                .table_names()
                .into_iter()
                .map(|name| vec![name.to_string()])
                .collect();
            render(&["table".to_string()], &rows)
        }
        Command::Insert { table, rows } => write(engine, slot, |e, id| e.insert(id, &table, rows)),
        Command::Update {
            table,
            assignments,
            filter,
        } => write(engine, slot, |e, id| {
            e.update(id, &table, &assignments, filter.as_ref())
        }),
        Command::Delete { table, filter } => {
            write(engine, slot, |e, id| e.delete(id, &table, filter.as_ref()))
        }
        Command::Select {
            table,
            projection,
            filter,
        } => engine
            .select(slot.id(), &table, &projection, filter.as_ref())
            .unwrap_or_else(|outcome| outcome.text),
        Command::Crash | Command::ShowRecoveryPhase | Command::ShowIoStatistics => {
            "error: not available here".to_string()
        }
    }
}

fn write<F>(engine: &mut Engine, slot: &mut TxnSlot, body: F) -> String
where
    F: FnOnce(&mut Engine, TxnId) -> Result<String, engine::Outcome>,
{
    let outcome = engine.run(slot.id(), body);
    if outcome.aborted && slot.id().is_some() {
        *slot = TxnSlot::Aborted;
    }
    outcome.text
}

fn serve(mut stream: TcpStream, server: &Server) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let mut slot = TxnSlot::Idle;
    let mut pending = Vec::new();
    let mut buf = [0u8; 8192];

    'connection: loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        while let Some(end) = pending.iter().position(|&b| b == 0) {
            let raw: Vec<u8> = pending.drain(..=end).collect();
            let sql = String::from_utf8_lossy(&raw[..end]);
            let sql = sql.trim();
            let mut reply = server.execute(&mut slot, sql).into_bytes();
            debug!(peer = %peer, statement = sql, "executed");
            reply.push(0);
            if stream.write_all(&reply).is_err() {
                break 'connection;
            }
        }
    }
    server.disconnect(slot);
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if env::var_os("STUBDB_EXIT_IMMEDIATELY").is_some() {
        error!("exiting on request");
        return ExitCode::from(3);
    }
    if let Some(ms) = env_u64("STUBDB_STARTUP_DELAY_MS") {
        thread::sleep(Duration::from_millis(ms));
    }

    let dir = match env::current_dir() {
        Ok(cwd) => cwd.join(&args.instance),
        Err(e) => {
            error!(error = %e, "no working directory");
            return ExitCode::from(2);
        }
    };
    let listener = match TcpListener::bind((args.host.as_str(), args.port)) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, host = %args.host, port = args.port, "bind failed");
            return ExitCode::from(2);
        }
    };
    info!(instance = %args.instance, host = %args.host, port = args.port, "listening");

    let server = Arc::new(Server::new());
    let redo_delay = Duration::from_micros(env_u64("STUBDB_REDO_DELAY_US").unwrap_or(0));
    {
        let server = Arc::clone(&server);
        thread::spawn(move || server.recover(&dir, redo_delay));
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let server = Arc::clone(&server);
                thread::spawn(move || serve(stream, &server));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("crashwatch-stubdb").chain(list.iter().copied()))
    }

    #[test]
    fn test_args() {
        let parsed = args(&["crash_test_db_x", "--port", "9000"]).unwrap();
        assert_eq!(parsed.instance, "crash_test_db_x");
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.host, "127.0.0.1");
        assert!(args(&[]).is_err());
        assert!(args(&["a", "--bogus"]).is_err());
        assert!(args(&["a", "--port", "not-a-port"]).is_err());
    }

    #[test]
    fn test_aborted_block_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::recover(dir.path(), Duration::ZERO, |_, _| {}).unwrap();
        let mut a = TxnSlot::Idle;
        let mut b = TxnSlot::Idle;
        let mut run = |slot: &mut TxnSlot, sql: &str| {
            run_command(&mut engine, slot, sql::parse(sql).unwrap())
        };

        run(&mut a, "CREATE TABLE t (id INT, val INT);");
        run(&mut a, "INSERT INTO t VALUES (1, 100);");
        run(&mut a, "BEGIN;");
        run(&mut b, "BEGIN;");
        assert!(run(&mut a, "UPDATE t SET val = 120 WHERE id = 1;").starts_with("ok"));
        assert!(run(&mut b, "UPDATE t SET val = 130 WHERE id = 1;").starts_with("abort"));
        assert!(run(&mut b, "SELECT * FROM t;").starts_with("abort"));
        assert!(run(&mut b, "COMMIT;").starts_with("abort"));
        assert_eq!(b, TxnSlot::Idle);
        assert_eq!(run(&mut a, "COMMIT;"), "ok: committed");
        assert!(run(&mut b, "SELECT val FROM t WHERE id = 1;").contains("| 120 |"));
    }
}
