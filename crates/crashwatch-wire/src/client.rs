//! Blocking wire client.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use chrono::Utc;
use tracing::{debug, trace};

use crate::classify::{HeuristicClassifier, ResponseClassifier, ResponseStatus};
use crate::error::{ConnError, SendError, WireResult};
use crate::framing::ResponseFraming;
use crate::log::{InteractionLog, InteractionRecord};
use crate::{DEFAULT_BUFFER_SIZE, STATEMENT_TERMINATOR};

/// Client tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Size of each `recv`.
    pub buffer_size: usize,
    /// Responses longer than this are cut and flagged as truncated.
    pub max_response_bytes: usize,
    pub framing: ResponseFraming,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_response_bytes: 16 * 1024 * 1024,
            framing: ResponseFraming::default(),
        }
    }
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// UTF-8 text with trailing NULs and surrounding whitespace removed.
    pub text: String,
    pub status: ResponseStatus,
    /// Time from the first request byte to the end of the response.
    pub elapsed: Duration,
    /// The response hit `max_response_bytes`.
    pub truncated: bool,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Client for one server address.
///
/// Holds at most one connection. [`send`](Self::send) connects lazily, and
/// any failed round trip drops the connection so a late response can never
/// be read as the answer to the next statement.
#[derive(Debug)]
pub struct WireClient {
    addr: SocketAddr,
    config: ClientConfig,
    classifier: Arc<dyn ResponseClassifier>,
    log: InteractionLog,
    context: String,
    stream: Option<TcpStream>,
}

impl WireClient {
    pub fn new(addr: SocketAddr, config: ClientConfig) -> Self {
        Self {
            addr,
            config,
            classifier: Arc::new(HeuristicClassifier),
            log: InteractionLog::disabled(),
            context: String::from("client"),
            stream: None,
        }
    }

    /// Replaces the response classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn ResponseClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Appends every round trip to `log` under the given context label.
    pub fn with_log(mut self, log: InteractionLog, context: impl Into<String>) -> Self {
        self.log = log;
        self.context = context.into();
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the connection if none is held.
    pub fn connect(&mut self) -> Result<(), ConnError> {
        if self.stream.is_none() {
            self.stream = Some(self.open(self.config.connect_timeout)?);
        }
        Ok(())
    }

    /// Closes the held connection, if any.
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            trace!(addr = %self.addr, "disconnected");
        }
    }

    /// Sends one statement and waits up to `timeout` for its response.
    ///
    /// An SQL-level failure is a successful round trip with a non-`Ok`
    /// [`ResponseStatus`]; only transport failures are errors.
    pub fn send(&mut self, statement: &str, timeout: Duration) -> WireResult<Response> {
        let started = Instant::now();
        let result = self.round_trip(statement, timeout, started);
        if result.is_err() {
            self.disconnect();
        }
        self.log_round_trip(statement, &result, started.elapsed());
        result
    }

    /// Sends one statement on a fresh connection and closes it afterwards.
    pub fn send_once(
        addr: SocketAddr,
        config: &ClientConfig,
        statement: &str,
        timeout: Duration,
    ) -> WireResult<Response> {
        let mut client = Self::new(addr, config.clone());
        let response = client.send(statement, timeout);
        client.disconnect();
        response
    }

    fn open(&self, timeout: Duration) -> Result<TcpStream, ConnError> {
        let timeout = if timeout.is_zero() { Duration::from_millis(1) } else { timeout };
        let stream = TcpStream::connect_timeout(&self.addr, timeout)
            .map_err(|e| ConnError::from_io(self.addr, timeout, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ConnError::from_io(self.addr, timeout, e))?;
        debug!(addr = %self.addr, "connected");
        Ok(stream)
    }

    fn round_trip(
        &mut self,
        statement: &str,
        timeout: Duration,
        started: Instant,
    ) -> WireResult<Response> {
        if self.stream.is_none() {
            let budget = self.config.connect_timeout.min(timeout);
            self.stream = Some(self.open(budget)?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(SendError::ConnectionReset("no connection".to_string()));
        };

        let mut request = BytesMut::with_capacity(statement.len() + 1);
        request.put_slice(statement.as_bytes());
        request.put_u8(STATEMENT_TERMINATOR);

        stream
            .set_write_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|e| SendError::from_io(timeout, &e))?;
        stream
            .write_all(&request)
            .map_err(|e| SendError::from_io(timeout, &e))?;

        let frame = self.config.framing.read(
            stream,
            self.config.buffer_size,
            self.config.max_response_bytes,
            timeout,
            started,
        )?;

        let text = String::from_utf8_lossy(&frame.bytes)
            .trim_end_matches(char::from(STATEMENT_TERMINATOR))
            .trim()
            .to_string();
        let status = self.classifier.classify(&text);

        Ok(Response {
            text,
            status,
            elapsed: started.elapsed(),
            truncated: frame.truncated,
        })
    }

    fn log_round_trip(&self, statement: &str, result: &WireResult<Response>, elapsed: Duration) {
        if !self.log.is_enabled() {
            return;
        }
        let (success, status, response) = match result {
            Ok(r) => (true, Some(r.status), r.text.clone()),
            Err(e) => (false, None, e.to_string()),
        };
        self.log.record(&InteractionRecord {
            timestamp: Utc::now(),
            context: self.context.clone(),
            statement: statement.to_string(),
            success,
            status,
            response,
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        });
    }
}

impl Drop for WireClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
