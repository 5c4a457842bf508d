//! # crashwatch-wire: SQL-over-TCP client
//!
//! The database under test speaks a minimal textual protocol:
//!
//! ```text
//! request:  <UTF-8 statement bytes> 0x00
//! response: <UTF-8 text>             (no length prefix)
//! ```
//!
//! The server writes its answer and then waits for the next request, so a
//! client has to decide where a response ends. [`ResponseFraming`] offers
//! read-until-idle (the default), read-until-terminator, and the original
//! single `recv` of a fixed buffer as a compatibility fallback.
//!
//! Responses are free text. [`ResponseClassifier`] turns that text into a
//! [`ResponseStatus`]; the bundled [`HeuristicClassifier`] matches on
//! `error`/`failure`/`abort` substrings and can be swapped for a structured
//! contract if the server ever grows one.
//!
//! Every call can also be appended to an [`InteractionLog`] (JSON lines)
//! for post-mortem debugging. Logging never fails the calling test.
//!
//! ## Example
//!
//! ```ignore
//! let mut client = WireClient::new(addr, ClientConfig::default());
//! client.connect()?;
//! let response = client.send("SELECT 1;", Duration::from_secs(5))?;
//! assert!(response.is_ok());
//! client.disconnect();
//! ```

mod classify;
mod client;
mod error;
mod framing;
mod log;

pub use classify::{HeuristicClassifier, ResponseClassifier, ResponseStatus};
pub use client::{ClientConfig, Response, WireClient};
pub use error::{ConnError, SendError, SendErrorKind, WireResult};
pub use framing::ResponseFraming;
pub use log::{InteractionLog, InteractionRecord};

/// Byte that terminates every request.
pub const STATEMENT_TERMINATOR: u8 = 0x00;

/// Receive buffer size used by the single-read framing (and as the chunk
/// size for the other strategies).
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

#[cfg(test)]
mod tests;
