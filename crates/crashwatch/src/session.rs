//! Client sessions.
//!
//! A [`Session`] wraps one held [`WireClient`] connection and tracks the
//! transaction state the server should be holding for it. Everything that
//! talks to the server on behalf of a workload goes through a session so
//! that cancellation, the retry rule and the statement log apply uniformly.

use std::net::SocketAddr;
use std::time::Duration;

use crashwatch_wire::{
    ClientConfig, ConnError, InteractionLog, Response, ResponseStatus, SendErrorKind, WireClient,
    WireResult,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::SessionError;
use crate::workload::StatementKind;

/// Transaction state of a session as the client understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    None,
    Open,
    Committed,
    Aborted,
}

/// One executed (or attempted) statement.
#[derive(Debug, Clone, Serialize)]
pub struct StatementRecord {
    pub sql: String,
    /// Server verdict, when a response arrived.
    pub status: Option<ResponseStatus>,
    /// Transport failure, when none did.
    pub error: Option<SendErrorKind>,
    pub response: Option<String>,
    pub latency_ms: f64,
    pub retried: bool,
}

/// A logical client connection.
#[derive(Debug)]
pub struct Session {
    label: String,
    client: WireClient,
    timeout: Duration,
    cancel: Option<CancelToken>,
    txn: TxnState,
    log: Vec<StatementRecord>,
}

impl Session {
    pub fn new(label: impl Into<String>, client: WireClient, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            client,
            timeout,
            cancel: None,
            txn: TxnState::None,
            log: Vec::new(),
        }
    }

    /// Checks `token` before every statement.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn txn_state(&self) -> TxnState {
        self.txn
    }

    pub fn log(&self) -> &[StatementRecord] {
        &self.log
    }

    pub fn take_log(&mut self) -> Vec<StatementRecord> {
        std::mem::take(&mut self.log)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    pub fn connect(&mut self) -> Result<(), ConnError> {
        self.client.connect()
    }

    pub fn close(&mut self) {
        self.client.disconnect();
    }

    /// Sends one statement.
    ///
    /// A failed round trip is retried once on a fresh connection only when
    /// that cannot duplicate or split work: the connect itself failed, or
    /// the statement is a read outside any transaction. A lost connection
    /// inside a transaction marks it aborted.
    pub fn execute(&mut self, sql: &str) -> Result<Response, SessionError> {
        if self.is_cancelled() {
            return Err(SessionError::Cancelled(self.label.clone()));
        }

        let kind = StatementKind::classify(sql);
        if self.txn == TxnState::Open && !self.client.is_connected() {
            self.txn = TxnState::Aborted;
            return Err(SessionError::TransactionLost(self.label.clone()));
        }

        let mut retried = false;
        let mut result = self.client.send(sql, self.timeout);
        if let Err(e) = &result {
            let outside_txn = self.txn != TxnState::Open;
            let retry = outside_txn
                && (e.kind() == SendErrorKind::ConnectFailed || kind.is_idempotent());
            if retry && !self.is_cancelled() {
                debug!(session = %self.label, error = %e, "retrying statement once");
                retried = true;
                result = self.client.send(sql, self.timeout);
            }
        }

        match &result {
            Ok(response) => self.advance(kind, response.status),
            Err(e) => {
                if self.txn == TxnState::Open {
                    warn!(session = %self.label, error = %e, "connection lost inside a transaction");
                    self.txn = TxnState::Aborted;
                }
            }
        }
        self.record(sql, &result, retried);

        result.map_err(SessionError::from)
    }

    /// An aborted transaction stays aborted whatever COMMIT returns.
    fn advance(&mut self, kind: StatementKind, status: ResponseStatus) {
        self.txn = match (kind, status) {
            (StatementKind::Begin, ResponseStatus::Ok) => TxnState::Open,
            (StatementKind::Commit, ResponseStatus::Ok) if self.txn != TxnState::Aborted => {
                TxnState::Committed
            }
            (StatementKind::Commit | StatementKind::Rollback, _) => TxnState::Aborted,
            (_, ResponseStatus::Aborted) => TxnState::Aborted,
            _ => self.txn,
        };
    }

    fn record(&mut self, sql: &str, result: &WireResult<Response>, retried: bool) {
        let record = match result {
            Ok(response) => StatementRecord {
                sql: sql.to_string(),
                status: Some(response.status),
                error: None,
                response: Some(response.text.clone()),
                latency_ms: response.elapsed.as_secs_f64() * 1000.0,
                retried,
            },
            Err(e) => StatementRecord {
                sql: sql.to_string(),
                status: None,
                error: Some(e.kind()),
                response: None,
                latency_ms: 0.0,
                retried,
            },
        };
        self.log.push(record);
    }
}

/// Opens sessions against one server address with shared settings.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    pub addr: SocketAddr,
    pub client: ClientConfig,
    pub timeout: Duration,
    pub log: InteractionLog,
    pub cancel: Option<CancelToken>,
}

impl SessionFactory {
    pub fn new(addr: SocketAddr, client: ClientConfig, timeout: Duration) -> Self {
        Self {
            addr,
            client,
            timeout,
            log: InteractionLog::disabled(),
            cancel: None,
        }
    }

    pub fn with_log(mut self, log: InteractionLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Creates an unconnected session labelled `label`.
    pub fn open(&self, label: &str) -> Session {
        let client = WireClient::new(self.addr, self.client.clone()).with_log(self.log.clone(), label);
        let session = Session::new(label, client, self.timeout);
        match &self.cancel {
            Some(token) => session.with_cancel(token.clone()),
            None => session,
        }
    }
}
