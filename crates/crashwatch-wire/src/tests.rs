//! Round-trip tests against throwaway loopback servers.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::*;

/// Accepts one connection and hands it to `serve`.
fn serve_one<F>(serve: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve(stream);
    });
    (addr, handle)
}

/// Reads one NUL-terminated request.
fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while stream.read(&mut byte).unwrap() == 1 {
        if byte[0] == STATEMENT_TERMINATOR {
            break;
        }
        request.push(byte[0]);
    }
    request
}

fn config(framing: ResponseFraming) -> ClientConfig {
    ClientConfig {
        framing,
        ..ClientConfig::default()
    }
}

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_statement_is_nul_terminated() {
    let (addr, server) = serve_one(|mut stream| {
        let request = read_request(&mut stream);
        assert_eq!(request, b"SELECT 1;");
        stream.write_all(b"| 1 |\n\0").unwrap();
    });

    let mut client = WireClient::new(addr, config(ResponseFraming::default()));
    let response = client.send("SELECT 1;", TIMEOUT).unwrap();
    assert_eq!(response.text, "| 1 |");
    assert_eq!(response.status, ResponseStatus::Ok);
    assert!(!response.truncated);
    assert!(client.is_connected());

    server.join().unwrap();
}

#[test]
fn test_held_connection_serves_many_statements() {
    let (addr, server) = serve_one(|mut stream| {
        for i in 0..3 {
            let _ = read_request(&mut stream);
            stream.write_all(format!("ok {i}\0").as_bytes()).unwrap();
        }
    });

    let mut client = WireClient::new(addr, config(ResponseFraming::default()));
    client.connect().unwrap();
    for i in 0..3 {
        let response = client.send("UPDATE t SET v = 1;", TIMEOUT).unwrap();
        assert_eq!(response.text, format!("ok {i}"));
    }

    server.join().unwrap();
}

#[test]
fn test_sql_error_is_a_response_not_an_error() {
    let (addr, server) = serve_one(|mut stream| {
        let _ = read_request(&mut stream);
        stream.write_all(b"Error: no such table\0").unwrap();
    });

    let response = WireClient::send_once(
        addr,
        &config(ResponseFraming::default()),
        "SELECT * FROM missing;",
        TIMEOUT,
    )
    .unwrap();
    assert_eq!(response.status, ResponseStatus::SqlError);

    server.join().unwrap();
}

#[test]
fn test_timeout_drops_connection() {
    let (addr, server) = serve_one(|mut stream| {
        let _ = read_request(&mut stream);
        thread::sleep(Duration::from_millis(500));
    });

    let mut client = WireClient::new(addr, config(ResponseFraming::default()));
    let err = client
        .send("SELECT 1;", Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(err.kind(), SendErrorKind::Timeout);
    assert!(!client.is_connected());

    server.join().unwrap();
}

#[test]
fn test_peer_close_is_connection_reset() {
    let (addr, server) = serve_one(|mut stream| {
        let _ = read_request(&mut stream);
    });

    let mut client = WireClient::new(addr, config(ResponseFraming::default()));
    let err = client.send("crash", TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), SendErrorKind::ConnectionReset);

    server.join().unwrap();
}

#[test]
fn test_refused_connect_is_connect_failed() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let mut client = WireClient::new(addr, config(ResponseFraming::default()));
    assert!(client.connect().is_err());
    let err = client.send("SELECT 1;", TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), SendErrorKind::ConnectFailed);
}

#[test]
fn test_idle_framing_joins_chunks() {
    let (addr, server) = serve_one(|mut stream| {
        let _ = read_request(&mut stream);
        stream.write_all(b"| id |\n").unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
        stream.write_all(b"| 1 |\n").unwrap();
        thread::sleep(Duration::from_millis(500));
    });

    let mut client = WireClient::new(
        addr,
        config(ResponseFraming::Idle(Duration::from_millis(200))),
    );
    let response = client.send("SELECT id FROM t;", TIMEOUT).unwrap();
    assert_eq!(response.text, "| id |\n| 1 |");

    server.join().unwrap();
}

#[test]
fn test_terminator_framing_stops_at_terminator() {
    let (addr, server) = serve_one(|mut stream| {
        let _ = read_request(&mut stream);
        stream.write_all(b"first;").unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
        stream.write_all(b"rest$trailing").unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let mut client = WireClient::new(addr, config(ResponseFraming::Terminator(b'$')));
    let response = client.send("SELECT 1;", TIMEOUT).unwrap();
    assert_eq!(response.text, "first;rest");

    server.join().unwrap();
}

#[test]
fn test_single_read_is_capped_by_buffer() {
    let (addr, server) = serve_one(|mut stream| {
        let _ = read_request(&mut stream);
        stream.write_all(&[b'x'; 100]).unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let mut client = WireClient::new(
        addr,
        ClientConfig {
            buffer_size: 16,
            framing: ResponseFraming::SingleRead,
            ..ClientConfig::default()
        },
    );
    let response = client.send("SELECT 1;", TIMEOUT).unwrap();
    assert_eq!(response.text.len(), 16);

    server.join().unwrap();
}

#[test]
fn test_oversized_response_is_truncated() {
    let (addr, server) = serve_one(|mut stream| {
        let _ = read_request(&mut stream);
        stream.write_all(&[b'y'; 4096]).unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let mut client = WireClient::new(
        addr,
        ClientConfig {
            buffer_size: 64,
            max_response_bytes: 256,
            framing: ResponseFraming::Idle(Duration::from_millis(100)),
            ..ClientConfig::default()
        },
    );
    let response = client.send("SELECT * FROM big;", TIMEOUT).unwrap();
    assert!(response.truncated);
    assert_eq!(response.text.len(), 256);

    server.join().unwrap();
}

#[test]
fn test_round_trips_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wire.jsonl");
    let (addr, server) = serve_one(|mut stream| {
        let _ = read_request(&mut stream);
        stream.write_all(b"abort\0").unwrap();
    });

    let log = InteractionLog::open(&path).unwrap();
    let mut client =
        WireClient::new(addr, config(ResponseFraming::default())).with_log(log, "session-1");
    let response = client.send("COMMIT;", TIMEOUT).unwrap();
    assert_eq!(response.status, ResponseStatus::Aborted);
    server.join().unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let record: InteractionRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
    assert_eq!(record.context, "session-1");
    assert_eq!(record.statement, "COMMIT;");
    assert_eq!(record.status, Some(ResponseStatus::Aborted));
}
