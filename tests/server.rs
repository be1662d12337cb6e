//! End-to-end scenarios driven over real TCP sockets against a running
//! `Server`: HTTP request/response framing, chunked bodies, the
//! WebSocket upgrade handshake, and pipelined requests.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use emberweb::config::ServerConfig;
use emberweb::dispatch::{HandlerReply, Outcome};
use emberweb::parser::status::Status;
use emberweb::Server;

fn test_config(dir: &std::path::Path) -> ServerConfig {
    std::fs::create_dir_all(dir).unwrap();
    ServerConfig::new()
        .with_worker_threads(2)
        .with_log_path(dir.join("server.log"))
}

fn start(config: ServerConfig) -> (Server, std::net::SocketAddr) {
    let mut server = Server::new(config);
    server.start_listen(0, 2).expect("bind should succeed");
    // give the reactor thread a moment to register the listener
    std::thread::sleep(Duration::from_millis(20));
    let addr = server.local_addr().expect("listener should report its address");
    (server, addr)
}

fn read_until_quiet(stream: &mut TcpStream, min_len: usize) -> Vec<u8> {
    stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut out = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                if out.len() >= min_len {
                    // try a little longer in case more is still in flight
                    stream.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                if out.len() >= min_len || Instant::now() > deadline {
                    break;
                }
            }
            Err(e) => panic!("read failed: {e}"),
        }
        if Instant::now() > deadline {
            break;
        }
    }
    out
}

#[test]
fn s1_http_get_dispatches_to_registered_handler() {
    let dir = std::env::temp_dir().join(format!("emberweb-it-s1-{}", std::process::id()));
    let mut server = Server::new(test_config(&dir));
    server.set_function(
        "/ping",
        Arc::new(|_ctx| {
            (
                Outcome::Ok,
                HandlerReply::Http {
                    status: Status::r#Ok,
                    headers: Vec::new(),
                    body: b"pong".to_vec(),
                },
            )
        }),
    );
    server.start_listen(0, 2).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let response = read_until_quiet(&mut client, 4);
    let text = String::from_utf8(response).unwrap();

    assert_eq!("HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong", text);

    server.close().unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn s2_chunked_body_is_reassembled_before_dispatch() {
    let dir = std::env::temp_dir().join(format!("emberweb-it-s2-{}", std::process::id()));
    let received = Arc::new(Mutex::new(None));
    let received_clone = received.clone();

    let mut server = Server::new(test_config(&dir));
    server.set_function(
        "/u",
        Arc::new(move |ctx| {
            if let emberweb::Context::Http(req) = ctx {
                *received_clone.lock().unwrap() = Some(req.body.clone());
            }
            (Outcome::Ok, HandlerReply::Http { status: Status::r#Ok, headers: Vec::new(), body: Vec::new() })
        }),
    );
    server.start_listen(0, 2).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
        .unwrap();
    let _ = read_until_quiet(&mut client, 1);

    let body = received.lock().unwrap().clone();
    assert_eq!(Some(b"hello world".to_vec()), body);

    server.close().unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn s3_websocket_handshake_computes_expected_accept() {
    let dir = std::env::temp_dir().join(format!("emberweb-it-s3-{}", std::process::id()));
    let (mut server, addr) = start(test_config(&dir));

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(
            b"GET /chat HTTP/1.1\r\n\
              Host: x\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let response = read_until_quiet(&mut client, 4);
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    server.close().unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn s4_websocket_text_frame_is_echoed_unmasked() {
    let dir = std::env::temp_dir().join(format!("emberweb-it-s4-{}", std::process::id()));
    let mut server = Server::new(test_config(&dir));
    server.set_global_solve_function(Arc::new(|ctx| {
        if let emberweb::Context::Ws(opcode, payload) = ctx {
            (Outcome::Ok, HandlerReply::Ws(*opcode, payload.clone()))
        } else {
            (Outcome::Ok, HandlerReply::None)
        }
    }));
    server.start_listen(0, 2).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let _ = read_until_quiet(&mut client, 4);

    // masked client text frame with payload "Hi"
    let mask = [0x12u8, 0x34, 0x56, 0x78];
    let payload = b"Hi";
    let masked: Vec<u8> = payload.iter().zip(mask.iter().cycle()).map(|(b, m)| b ^ m).collect();
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend_from_slice(&masked);
    client.write_all(&frame).unwrap();

    let response = read_until_quiet(&mut client, 4);
    assert_eq!(vec![0x81, 0x02, b'H', b'i'], response);

    server.close().unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn pipelined_requests_are_dispatched_in_arrival_order() {
    let dir = std::env::temp_dir().join(format!("emberweb-it-pipeline-{}", std::process::id()));
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut server = Server::new(test_config(&dir));
    let order_a = order.clone();
    server.set_function(
        "/a",
        Arc::new(move |_ctx| {
            order_a.lock().unwrap().push("a");
            (Outcome::Ok, HandlerReply::Http { status: Status::r#Ok, headers: Vec::new(), body: b"a".to_vec() })
        }),
    );
    let order_b = order.clone();
    server.set_function(
        "/b",
        Arc::new(move |_ctx| {
            order_b.lock().unwrap().push("b");
            (Outcome::Ok, HandlerReply::Http { status: Status::r#Ok, headers: Vec::new(), body: b"b".to_vec() })
        }),
    );
    server.start_listen(0, 2).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_until_quiet(&mut client, 1);
    let text = String::from_utf8(response).unwrap();

    assert_eq!(2, text.matches("HTTP/1.1 200 OK").count());
    assert_eq!(vec!["a", "b"], *order.lock().unwrap());

    server.close().unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}
