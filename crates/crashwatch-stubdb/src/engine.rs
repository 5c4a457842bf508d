//! Multi-version storage with a redo log and static checkpoints.
//!
//! Committed rows keep one version per commit timestamp. A transaction
//! reads the versions visible at its begin timestamp plus its own pending
//! writes. Writers take row locks at update time: a row locked by another
//! transaction, or committed after the writer's snapshot, aborts the writer
//! (first updater wins). Only committed work reaches the log, so recovery
//! is redo-only.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sql::{Assignment, Predicate, Projection, Value};

const WAL_FILE: &str = "redo.log";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const PAGE_SIZE: u64 = 8192;

pub type TxnId = u64;

/// Recovery progress as reported by `SHOW RECOVERY PHASE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Analysis,
    Redo,
    Undo,
    Complete,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Redo => "redo",
            Self::Undo => "undo",
            Self::Complete => "complete",
        }
    }
}

/// Bytes moved to and from the data files.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl IoCounters {
    pub fn to_json(self) -> String {
        let read_pages = self.read_bytes.div_ceil(PAGE_SIZE);
        let write_pages = self.write_bytes.div_ceil(PAGE_SIZE);
        serde_json::json!({
            "total_io": read_pages + write_pages,
            "read_pages": read_pages,
            "write_pages": write_pages,
        })
        .to_string()
    }
}

// ============================================================================
// Persistent formats
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Mutation {
    CreateTable { name: String, columns: Vec<String> },
    CreateIndex { table: String, name: String, column: String },
    Put { table: String, row: u64, values: Vec<Value> },
    Remove { table: String, row: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    ts: u64,
    ops: Vec<Mutation>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TableImage {
    columns: Vec<String>,
    indexes: Vec<(String, String)>,
    rows: BTreeMap<u64, Vec<Value>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Image {
    clock: u64,
    next_row: u64,
    tables: BTreeMap<String, TableImage>,
}

// ============================================================================
// In-memory state
// ============================================================================

#[derive(Debug, Clone)]
struct Version {
    ts: u64,
    /// `None` marks a deletion.
    values: Option<Vec<Value>>,
}

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    indexes: Vec<(String, String)>,
    rows: BTreeMap<u64, Vec<Version>>,
}

impl Table {
    fn column(&self, name: &str) -> Result<usize, String> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| format!("error: column `{name}` does not exist"))
    }

    fn latest_ts(&self, row: u64) -> Option<u64> {
        self.rows.get(&row).and_then(|v| v.last()).map(|v| v.ts)
    }

    fn visible(&self, row: u64, snapshot: u64) -> Option<&Vec<Value>> {
        self.rows
            .get(&row)?
            .iter()
            .rev()
            .find(|v| v.ts <= snapshot)?
            .values
            .as_ref()
    }
}

#[derive(Debug)]
struct Txn {
    snapshot: u64,
    /// Pending row images keyed by (table, row); `None` deletes.
    writes: BTreeMap<(String, u64), Option<Vec<Value>>>,
}

/// Rows a statement operates on, with their current values.
type RowSet = Vec<(u64, Vec<Value>)>;

#[derive(Debug)]
pub struct Engine {
    dir: PathBuf,
    clock: u64,
    next_row: u64,
    tables: BTreeMap<String, Table>,
    txns: HashMap<TxnId, Txn>,
    locks: HashMap<(String, u64), TxnId>,
    next_txn: TxnId,
    wal: File,
    io: IoCounters,
}

/// Statement outcome: the response text, and whether the server aborted
/// the surrounding transaction.
pub struct Outcome {
    pub text: String,
    pub aborted: bool,
}

impl Outcome {
    fn reply(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            aborted: false,
        }
    }

    fn abort(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            aborted: true,
        }
    }
}

impl Engine {
    /// Rebuilds state from the checkpoint image and the redo log.
    ///
    /// `on_phase` observes progress; `redo_delay` is spent per replayed log
    /// entry. The caller declares [`Phase::Complete`] once it installs the
    /// engine.
    pub fn recover(
        dir: &Path,
        redo_delay: Duration,
        mut on_phase: impl FnMut(Phase, IoCounters),
    ) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut io_counters = IoCounters::default();

        on_phase(Phase::Analysis, io_counters);
        let checkpoint = dir.join(CHECKPOINT_FILE);
        let image: Image = if checkpoint.exists() {
            let bytes = fs::read(&checkpoint)?;
            io_counters.read_bytes += bytes.len() as u64;
            serde_json::from_slice(&bytes).map_err(io::Error::other)?
        } else {
            Image::default()
        };

        let mut engine = Self {
            dir: dir.to_path_buf(),
            clock: image.clock,
            next_row: image.next_row,
            tables: image
                .tables
                .into_iter()
                .map(|(name, t)| {
                    let rows = t
                        .rows
                        .into_iter()
                        .map(|(row, values)| {
                            let version = Version {
                                ts: image.clock,
                                values: Some(values),
                            };
                            (row, vec![version])
                        })
                        .collect();
                    let table = Table {
                        columns: t.columns,
                        indexes: t.indexes,
                        rows,
                    };
                    (name, table)
                })
                .collect(),
            txns: HashMap::new(),
            locks: HashMap::new(),
            next_txn: 1,
            wal: OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(WAL_FILE))?,
            io: io_counters,
        };

        on_phase(Phase::Redo, engine.io);
        let wal_path = dir.join(WAL_FILE);
        let mut reader = BufReader::new(File::open(&wal_path)?);
        let mut good_len = 0u64;
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                break;
            }
            engine.io.read_bytes += n as u64;
            // A torn tail is the last write cut short by the crash.
            if line.last() != Some(&b'\n') {
                break;
            }
            let Ok(entry) = serde_json::from_slice::<WalEntry>(&line) else {
                break;
            };
            good_len += n as u64;
            if entry.ts > engine.clock {
                engine.clock = entry.ts;
                for op in entry.ops {
                    engine.apply(op, entry.ts);
                }
            }
            if !redo_delay.is_zero() {
                thread::sleep(redo_delay);
            }
            on_phase(Phase::Redo, engine.io);
        }
        drop(reader);
        OpenOptions::new()
            .write(true)
            .open(&wal_path)?
            .set_len(good_len)?;

        // Nothing uncommitted is ever logged, so undo has no work.
        on_phase(Phase::Undo, engine.io);
        Ok(engine)
    }

    pub fn io(&self) -> IoCounters {
        self.io
    }

    fn apply(&mut self, op: Mutation, ts: u64) {
        match op {
            Mutation::CreateTable { name, columns } => {
                self.tables.entry(name).or_insert_with(|| Table {
                    columns,
                    ..Table::default()
                });
            }
            Mutation::CreateIndex {
                table,
                name,
                column,
            } => {
                if let Some(t) = self.tables.get_mut(&table) {
                    t.indexes.push((name, column));
                }
            }
            Mutation::Put { table, row, values } => {
                self.next_row = self.next_row.max(row + 1);
                if let Some(t) = self.tables.get_mut(&table) {
                    t.rows.entry(row).or_default().push(Version {
                        ts,
                        values: Some(values),
                    });
                }
            }
            Mutation::Remove { table, row } => {
                if let Some(t) = self.tables.get_mut(&table) {
                    t.rows.entry(row).or_default().push(Version { ts, values: None });
                }
            }
        }
    }

    /// Applies `ops` at a new timestamp and logs them.
    fn commit_ops(&mut self, ops: Vec<Mutation>) -> io::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let entry = WalEntry {
            ts: self.clock + 1,
            ops,
        };
        let mut line = serde_json::to_string(&entry).map_err(io::Error::other)?;
        line.push('\n');
        self.wal.write_all(line.as_bytes())?;
        self.io.write_bytes += line.len() as u64;
        self.clock = entry.ts;
        for op in entry.ops {
            self.apply(op, entry.ts);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    pub fn begin(&mut self) -> TxnId {
        let id = self.next_txn;
        self.next_txn += 1;
        self.txns.insert(
            id,
            Txn {
                snapshot: self.clock,
                writes: BTreeMap::new(),
            },
        );
        id
    }

    pub fn commit(&mut self, id: TxnId) -> Outcome {
        let Some(txn) = self.txns.remove(&id) else {
            return Outcome::reply("ok: no transaction in progress");
        };
        self.release(id);
        let ops = txn
            .writes
            .into_iter()
            .map(|((table, row), values)| match values {
                Some(values) => Mutation::Put { table, row, values },
                None => Mutation::Remove { table, row },
            })
            .collect();
        match self.commit_ops(ops) {
            Ok(()) => Outcome::reply("ok: committed"),
            Err(e) => Outcome::abort(format!("abort: commit could not be logged: {e}")),
        }
    }

    pub fn rollback(&mut self, id: TxnId) {
        self.txns.remove(&id);
        self.release(id);
    }

    fn release(&mut self, id: TxnId) {
        self.locks.retain(|_, owner| *owner != id);
    }

    /// Runs a data statement inside `txn`, or in its own transaction.
    pub fn run<F>(&mut self, txn: Option<TxnId>, body: F) -> Outcome
    where
        F: FnOnce(&mut Self, TxnId) -> Result<String, Outcome>,
    {
        let (id, autocommit) = match txn {
            Some(id) => (id, false),
            None => (self.begin(), true),
        };
        match body(self, id) {
            Ok(text) if autocommit => {
                let committed = self.commit(id);
                if committed.aborted { committed } else { Outcome::reply(text) }
            }
            Ok(text) => Outcome::reply(text),
            Err(outcome) => {
                if outcome.aborted || autocommit {
                    self.rollback(id);
                }
                outcome
            }
        }
    }

    // ------------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------------

    pub fn create_table(&mut self, name: String, columns: Vec<String>) -> Outcome {
        if self.tables.contains_key(&name) {
            return Outcome::reply(format!("error: table `{name}` already exists"));
        }
        match self.commit_ops(vec![Mutation::CreateTable { name, columns }]) {
            Ok(()) => Outcome::reply("ok: table created"),
            Err(e) => Outcome::reply(format!("error: {e}")),
        }
    }

    pub fn create_index(&mut self, name: String, table: String, column: String) -> Outcome {
        match self.tables.get(&table).map(|t| t.column(&column)) {
            None => return Outcome::reply(format!("error: table `{table}` does not exist")),
            Some(Err(e)) => return Outcome::reply(e),
            Some(Ok(_)) => {}
        }
        match self.commit_ops(vec![Mutation::CreateIndex {
            table,
            name,
            column,
        }]) {
            Ok(()) => Outcome::reply("ok: index created"),
            Err(e) => Outcome::reply(format!("error: {e}")),
        }
    }

    /// Writes the committed state as an image and empties the log.
    pub fn checkpoint(&mut self) -> io::Result<()> {
        let image = Image {
            clock: self.clock,
            next_row: self.next_row,
            tables: self
                .tables
                .iter()
                .map(|(name, t)| {
                    let rows = t
                        .rows
                        .keys()
                        .filter_map(|&row| t.visible(row, self.clock).map(|v| (row, v.clone())))
                        .collect();
                    let image = TableImage {
                        columns: t.columns.clone(),
                        indexes: t.indexes.clone(),
                        rows,
                    };
                    (name.clone(), image)
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&image).map_err(io::Error::other)?;
        let tmp = self.dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.dir.join(CHECKPOINT_FILE))?;
        self.wal.set_len(0)?;
        self.io.write_bytes += bytes.len() as u64;
        Ok(())
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    fn table(&self, name: &str) -> Result<&Table, Outcome> {
        self.tables
            .get(name)
            .ok_or_else(|| Outcome::reply(format!("error: table `{name}` does not exist")))
    }

    /// Rows of `table` visible to `id` that satisfy `filter`.
    fn scan(&self, id: TxnId, table: &str, filter: Option<&Predicate>) -> Result<RowSet, Outcome> {
        let t = self.table(table)?;
        let column = match filter {
            Some(p) => Some(t.column(p.column()).map_err(Outcome::reply)?),
            None => None,
        };
        let txn = self.txns.get(&id);
        let snapshot = txn.map_or(self.clock, |t| t.snapshot);

        let mut rows: BTreeMap<u64, Vec<Value>> = t
            .rows
            .keys()
            .filter_map(|&row| t.visible(row, snapshot).map(|v| (row, v.clone())))
            .collect();
        if let Some(txn) = txn {
            for ((name, row), values) in &txn.writes {
                if name != table {
                    continue;
                }
                match values {
                    Some(values) => rows.insert(*row, values.clone()),
                    None => rows.remove(row),
                };
            }
        }
        Ok(rows
            .into_iter()
            .filter(|(_, values)| match (filter, column) {
                (Some(p), Some(c)) => values.get(c).is_some_and(|v| p.holds(v)),
                _ => true,
            })
            .collect())
    }

    /// Takes the row lock or aborts the writer.
    fn lock(&mut self, id: TxnId, table: &str, row: u64) -> Result<(), Outcome> {
        let key = (table.to_string(), row);
        if let Some(&owner) = self.locks.get(&key) {
            if owner != id {
                return Err(Outcome::abort(format!(
                    "abort: write conflict on {table} row {row} (locked by transaction {owner})"
                )));
            }
            return Ok(());
        }
        let snapshot = self.txns.get(&id).map_or(self.clock, |t| t.snapshot);
        let changed = self
            .tables
            .get(table)
            .and_then(|t| t.latest_ts(row))
            .is_some_and(|ts| ts > snapshot);
        if changed {
            return Err(Outcome::abort(format!(
                "abort: write conflict on {table} row {row} (changed since snapshot)"
            )));
        }
        self.locks.insert(key, id);
        Ok(())
    }

    fn stage(&mut self, id: TxnId, table: &str, row: u64, values: Option<Vec<Value>>) {
        if let Some(txn) = self.txns.get_mut(&id) {
            txn.writes.insert((table.to_string(), row), values);
        }
    }

    pub fn insert(&mut self, id: TxnId, table: &str, rows: Vec<Vec<Value>>) -> Result<String, Outcome> {
        let width = self.table(table)?.columns.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != width) {
            return Err(Outcome::reply(format!(
                "error: {table} has {width} columns, row has {}",
                bad.len()
            )));
        }
        let count = rows.len();
        for values in rows {
            let row = self.next_row;
            self.next_row += 1;
            self.stage(id, table, row, Some(values));
        }
        Ok(format!("ok: {count} rows inserted"))
    }

    pub fn update(
        &mut self,
        id: TxnId,
        table: &str,
        assignments: &[Assignment],
        filter: Option<&Predicate>,
    ) -> Result<String, Outcome> {
        let t = self.table(table)?;
        let mut targets = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let (Assignment::Set(column, _) | Assignment::Add(column, _)) = assignment;
            targets.push(t.column(column).map_err(Outcome::reply)?);
        }

        let rows = self.scan(id, table, filter)?;
        let count = rows.len();
        for (row, mut values) in rows {
            self.lock(id, table, row)?;
            for (assignment, &c) in assignments.iter().zip(&targets) {
                values[c] = match assignment {
                    Assignment::Set(_, value) => value.clone(),
                    Assignment::Add(column, delta) => values[c].add(delta).ok_or_else(|| {
                        Outcome::reply(format!("error: `{column}` is not numeric"))
                    })?,
                };
            }
            self.stage(id, table, row, Some(values));
        }
        Ok(format!("ok: {count} rows updated"))
    }

    pub fn delete(&mut self, id: TxnId, table: &str, filter: Option<&Predicate>) -> Result<String, Outcome> {
        let rows = self.scan(id, table, filter)?;
        let count = rows.len();
        for (row, _) in rows {
            self.lock(id, table, row)?;
            self.stage(id, table, row, None);
        }
        Ok(format!("ok: {count} rows deleted"))
    }

    pub fn select(
        &self,
        id: Option<TxnId>,
        table: &str,
        projection: &Projection,
        filter: Option<&Predicate>,
    ) -> Result<String, Outcome> {
        let t = self.table(table)?;
        // Outside a transaction reads see the latest commit.
        let rows = self.scan(id.unwrap_or(0), table, filter)?;
        let (header, picks): (Vec<String>, Vec<usize>) = match projection {
            Projection::Count => {
                return Ok(render(&["COUNT(*)".to_string()], &[vec![rows.len().to_string()]]));
            }
            Projection::All => (t.columns.clone(), (0..t.columns.len()).collect()),
            Projection::Columns(columns) => {
                let mut picks = Vec::with_capacity(columns.len());
                for c in columns {
                    picks.push(t.column(c).map_err(Outcome::reply)?);
                }
                (columns.clone(), picks)
            }
        };
        let body: Vec<Vec<String>> = rows
            .iter()
            .map(|(_, values)| picks.iter().map(|&c| values[c].to_string()).collect())
            .collect();
        Ok(render(&header, &body))
    }
}

/// `| a | b |` rows with a row-count footer.
pub fn render(header: &[String], rows: &[Vec<String>]) -> String {
    let line = |cells: &[String]| format!("| {} |", cells.join(" | "));
    let mut out = line(header);
    for row in rows {
        out.push('\n');
        out.push_str(&line(row));
    }
    let n = rows.len();
    out.push_str(&format!("\n({n} {})", if n == 1 { "row" } else { "rows" }));
    out
}
