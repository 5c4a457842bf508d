//! Deterministic tpmC-style statement generator.
//!
//! The generator is the workload collaborator: it produces the schema, the
//! bulk load and the transactional mix, and tags every count-changing
//! statement with its [`Effect`] so the expected state can be computed
//! from what the server acknowledged.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::statement::{Effect, Statement};

/// Ids inserted by session `s` start at `SESSION_ID_STRIDE * (s + 1)`,
/// above any bulk-loaded row.
pub const SESSION_ID_STRIDE: u64 = 1_000_000;

/// Transaction mix weights: select, update, insert, delete.
const MIX_WEIGHTS: [f64; 4] = [0.4, 0.3, 0.2, 0.1];

/// Tables of the benchmark schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Warehouse,
    District,
    Customer,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Warehouse, Table::District, Table::Customer];

    pub fn name(self) -> &'static str {
        match self {
            Self::Warehouse => "warehouse",
            Self::District => "district",
            Self::Customer => "customer",
        }
    }

    pub fn id_column(self) -> &'static str {
        match self {
            Self::Warehouse => "w_id",
            Self::District => "d_id",
            Self::Customer => "c_id",
        }
    }

    fn create_sql(self) -> &'static str {
        match self {
            Self::Warehouse => {
                "CREATE TABLE warehouse (w_id INT, w_name CHAR(10), w_street_1 CHAR(20), \
                 w_street_2 CHAR(20), w_city CHAR(20), w_state CHAR(2), w_zip CHAR(9), \
                 w_tax FLOAT, w_ytd FLOAT);"
            }
            Self::District => {
                "CREATE TABLE district (d_id INT, d_w_id INT, d_name CHAR(10), \
                 d_street_1 CHAR(20), d_street_2 CHAR(20), d_city CHAR(20), d_state CHAR(2), \
                 d_zip CHAR(9), d_tax FLOAT, d_ytd FLOAT, d_next_o_id INT);"
            }
            Self::Customer => {
                "CREATE TABLE customer (c_id INT, c_d_id INT, c_w_id INT, c_first CHAR(16), \
                 c_middle CHAR(2), c_last CHAR(16), c_street_1 CHAR(20), c_street_2 CHAR(20), \
                 c_city CHAR(20), c_state CHAR(2), c_zip CHAR(9), c_phone CHAR(16), \
                 c_since CHAR(30), c_credit CHAR(2), c_credit_lim INT, c_discount FLOAT, \
                 c_balance FLOAT, c_ytd_payment FLOAT, c_payment_cnt INT, c_delivery_cnt INT, \
                 c_data CHAR(50));"
            }
        }
    }

    fn index_sql(self) -> &'static [&'static str] {
        match self {
            Self::Warehouse => &[
                "CREATE INDEX idx_warehouse_w_id ON warehouse(w_id);",
                "CREATE INDEX idx_warehouse_w_city ON warehouse(w_city);",
            ],
            Self::District => &[
                "CREATE INDEX idx_district_d_id ON district(d_id);",
                "CREATE INDEX idx_district_d_w_id ON district(d_w_id);",
            ],
            Self::Customer => &[],
        }
    }

    fn row_sql(self, i: u64) -> String {
        match self {
            Self::Warehouse => format!(
                "INSERT INTO warehouse VALUES ({i}, 'Warehouse{i:03}', 'Street1_{i}', \
                 'Street2_{i}', 'City{i}', 'ST', '12345-{i:04}', {:.2}, {:.1});",
                0.05 + (i % 10) as f64 * 0.01,
                1000.0 + i as f64 * 10.0,
            ),
            Self::District => format!(
                "INSERT INTO district VALUES ({i}, {}, 'District{i:03}', 'Street1_{i}', \
                 'Street2_{i}', 'City{i}', 'ST', '12345-{i:04}', {:.2}, {:.1}, {});",
                i % 10 + 1,
                0.04 + (i % 8) as f64 * 0.01,
                500.0 + i as f64 * 5.0,
                1000 + i,
            ),
            Self::Customer => format!(
                "INSERT INTO customer VALUES ({i}, {}, {}, 'First{i:03}', 'M', 'Last{i:03}', \
                 'Street1_{i}', 'Street2_{i}', 'City{i}', 'ST', '12345-{i:04}', '555-{i:04}', \
                 '2023-01-01', 'GC', {}, {:.2}, {:.1}, {:.1}, {}, {}, 'Customer data {i}');",
                i % 10 + 1,
                i % 5 + 1,
                1000 + i * 100,
                0.05 + (i % 10) as f64 * 0.01,
                100.0 + i as f64 * 2.0,
                50.0 + i as f64,
                i % 10,
                i % 5,
            ),
        }
    }
}

/// Source of workload statements.
///
/// Implementations must be deterministic for a given seed so the expected
/// state of a run can be reproduced.
pub trait WorkloadGenerator {
    /// CREATE TABLE statements.
    fn schema(&self, tables: &[Table]) -> Vec<Statement>;

    /// CREATE INDEX statements for the indexed scenario.
    fn indexes(&self, tables: &[Table]) -> Vec<Statement>;

    /// Inserts rows `1..=rows` into `table`.
    fn bulk_load(&mut self, table: Table, rows: u64) -> Vec<Statement>;

    /// `count` mixed operations for `session`, wrapped in explicit
    /// transactions of `batch` operations when `batch > 1`.
    fn transactions(&mut self, session: usize, count: usize, batch: usize) -> Vec<Statement>;

    /// `count` point lookups over the loaded tables.
    fn point_queries(&mut self, count: usize) -> Vec<Statement>;
}

/// Generator for the warehouse/district/customer schema.
#[derive(Debug)]
pub struct TpccGenerator {
    rng: StdRng,
    loaded: BTreeMap<Table, u64>,
    next_id: BTreeMap<usize, u64>,
}

impl TpccGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            loaded: BTreeMap::new(),
            next_id: BTreeMap::new(),
        }
    }

    fn session_base(session: usize) -> u64 {
        SESSION_ID_STRIDE * (session as u64 + 1)
    }

    fn rows(&self, table: Table) -> u64 {
        self.loaded.get(&table).copied().unwrap_or(0).max(1)
    }

    fn pick_table(&mut self) -> Table {
        let loaded: Vec<Table> = self.loaded.keys().copied().collect();
        if loaded.is_empty() {
            Table::Warehouse
        } else {
            loaded[self.rng.gen_range(0..loaded.len())]
        }
    }

    fn range_start(&mut self, table: Table, width: u64) -> u64 {
        let upper = self.rows(table).saturating_sub(width).max(1);
        self.rng.gen_range(1..=upper)
    }

    fn select(&mut self) -> Statement {
        let table = self.pick_table();
        let start = self.range_start(table, 10);
        Statement::new(format!(
            "SELECT * FROM {} WHERE {} BETWEEN {start} AND {};",
            table.name(),
            table.id_column(),
            start + 10
        ))
    }

    fn update(&mut self) -> Statement {
        if self.loaded.contains_key(&Table::District) && self.rng.gen_bool(0.5) {
            let start = self.range_start(Table::District, 10);
            let delta = self.rng.gen_range(5..=50);
            Statement::new(format!(
                "UPDATE district SET d_ytd = d_ytd + {delta} WHERE d_id BETWEEN {start} AND {};",
                start + 10
            ))
        } else {
            let start = self.range_start(Table::Warehouse, 5);
            let delta = self.rng.gen_range(10..=100);
            Statement::new(format!(
                "UPDATE warehouse SET w_ytd = w_ytd + {delta} WHERE w_id BETWEEN {start} AND {};",
                start + 5
            ))
        }
    }

    fn insert(&mut self, session: usize) -> Statement {
        let count = self.rng.gen_range(1..=3u64);
        let next = self
            .next_id
            .entry(session)
            .or_insert_with(|| Self::session_base(session));
        let first = *next;
        *next += count;

        let ids: Vec<u64> = (first..first + count).collect();
        let values: Vec<String> = ids
            .iter()
            .enumerate()
            .map(|(k, id)| {
                format!(
                    "({id}, 'NewWH{id:04}', 'Street1_{id}', 'Street2_{id}', 'City{id}', 'ST', \
                     '54321-{k:04}', {:.2}, {:.1})",
                    0.06 + (k % 10) as f64 * 0.01,
                    2000.0 + k as f64 * 10.0
                )
            })
            .collect();

        Statement::new(format!("INSERT INTO warehouse VALUES {};", values.join(", "))).with_effect(
            Effect::Insert {
                table: Table::Warehouse.name().to_string(),
                ids,
            },
        )
    }

    fn delete(&mut self, session: usize) -> Statement {
        let base = Self::session_base(session);
        let next = self.next_id.get(&session).copied().unwrap_or(base);
        if next == base {
            // Nothing of ours to delete yet.
            return self.select();
        }
        let lo = self.rng.gen_range(base..next);
        let hi = lo + 5;
        Statement::new(format!(
            "DELETE FROM warehouse WHERE w_id BETWEEN {lo} AND {hi};"
        ))
        .with_effect(Effect::Delete {
            table: Table::Warehouse.name().to_string(),
            lo,
            hi,
        })
    }

    fn operation(&mut self, session: usize) -> Statement {
        let roll: f64 = self.rng.gen_range(0.0..1.0);
        let mut cumulative = 0.0;
        let choice = MIX_WEIGHTS
            .iter()
            .position(|w| {
                cumulative += w;
                roll < cumulative
            })
            .unwrap_or(MIX_WEIGHTS.len() - 1);
        match choice {
            0 => self.select(),
            1 => self.update(),
            2 => self.insert(session),
            _ => self.delete(session),
        }
    }
}

impl WorkloadGenerator for TpccGenerator {
    fn schema(&self, tables: &[Table]) -> Vec<Statement> {
        tables.iter().map(|t| Statement::new(t.create_sql())).collect()
    }

    fn indexes(&self, tables: &[Table]) -> Vec<Statement> {
        tables
            .iter()
            .flat_map(|t| t.index_sql().iter().map(|sql| Statement::new(*sql)))
            .collect()
    }

    fn bulk_load(&mut self, table: Table, rows: u64) -> Vec<Statement> {
        *self.loaded.entry(table).or_default() += rows;
        (1..=rows).map(|i| Statement::new(table.row_sql(i))).collect()
    }

    fn transactions(&mut self, session: usize, count: usize, batch: usize) -> Vec<Statement> {
        let mut statements = Vec::with_capacity(count + 2 * count / batch.max(1) + 2);
        let mut remaining = count;
        while remaining > 0 {
            let n = if batch <= 1 { 1 } else { batch.min(remaining) };
            if batch > 1 {
                statements.push(Statement::new("BEGIN;"));
            }
            for _ in 0..n {
                statements.push(self.operation(session));
            }
            if batch > 1 {
                statements.push(Statement::new("COMMIT;"));
            }
            remaining -= n;
        }
        statements
    }

    fn point_queries(&mut self, count: usize) -> Vec<Statement> {
        let district = self.loaded.contains_key(&Table::District);
        (0..count)
            .map(|i| {
                let table = if district && i % 2 == 1 {
                    Table::District
                } else {
                    Table::Warehouse
                };
                let rows = self.rows(table);
                let id = self.rng.gen_range(1..=rows);
                Statement::new(format!(
                    "SELECT * FROM {} WHERE {} = {id};",
                    table.name(),
                    table.id_column()
                ))
            })
            .collect()
    }
}
