//! End-to-end client tests against a scripted in-process server.

mod harness;

use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::Duration;

use harness::spawn_server;
use wscl::codec::deflate::{DeflateParams, Deflater, Inflater};
use wscl::{CloseCode, ConnectionState, WebSocketClient};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Event {
    Open,
    Text(String),
    Binary(Vec<u8>),
    Close(u16, String),
    Error(String),
}

/// Build a client pointed at `addr` with every callback wired to a channel.
fn wired_client(addr: SocketAddr) -> (WebSocketClient, Receiver<Event>) {
    let client = WebSocketClient::new();
    client.set_url(&format!("ws://{addr}/")).unwrap();

    let (tx, rx) = channel();
    {
        let tx = tx.clone();
        client.set_open_callback(move || {
            let _ = tx.send(Event::Open);
        });
    }
    {
        let tx = tx.clone();
        client.set_message_callback(move |msg| {
            let _ = tx.send(Event::Text(msg.to_string()));
        });
    }
    {
        let tx = tx.clone();
        client.set_binary_callback(move |data| {
            let _ = tx.send(Event::Binary(data.to_vec()));
        });
    }
    {
        let tx = tx.clone();
        client.set_close_callback(move |code, reason| {
            let _ = tx.send(Event::Close(code, reason.to_string()));
        });
    }
    client.set_error_callback(move |err| {
        let _ = tx.send(Event::Error(err.to_string()));
    });

    (client, rx)
}

fn next(rx: &Receiver<Event>) -> Event {
    rx.recv_timeout(WAIT).expect("expected an event in time")
}

#[test]
fn echo_small_text() {
    let (addr, server) = spawn_server(|mut conn| {
        conn.accept_upgrade(None);

        let frame = conn.read_frame();
        assert!(frame.fin);
        assert_eq!(frame.opcode, 0x1);
        assert_eq!(frame.payload, b"Hello");
        conn.write_frame(true, false, 0x1, b"Hello");

        conn.write_close(1000, "");
        assert_eq!(conn.read_until_close(), 1000);
    });

    let (client, events) = wired_client(addr);
    client.connect().unwrap();
    client.send_message("Hello").unwrap();

    assert_eq!(next(&events), Event::Open);
    assert_eq!(next(&events), Event::Text("Hello".to_string()));
    assert_eq!(next(&events), Event::Close(1000, String::new()));

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Closed);
    server.join().unwrap();
}

#[test]
fn fragmented_binary_one_mebibyte() {
    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 16;

    let (addr, server) = spawn_server(|mut conn| {
        conn.accept_upgrade(None);

        for i in 0..CHUNKS {
            let first = i == 0;
            let last = i == CHUNKS - 1;
            let opcode = if first { 0x2 } else { 0x0 };
            conn.write_frame(last, false, opcode, &vec![i as u8; CHUNK]);
        }

        conn.write_close(1000, "");
        assert_eq!(conn.read_until_close(), 1000);
    });

    let (client, events) = wired_client(addr);
    client.connect().unwrap();

    assert_eq!(next(&events), Event::Open);
    match next(&events) {
        Event::Binary(data) => {
            assert_eq!(data.len(), CHUNKS * CHUNK);
            for (i, chunk) in data.chunks(CHUNK).enumerate() {
                assert!(chunk.iter().all(|&b| b == i as u8), "chunk {i} differs");
            }
        }
        other => panic!("expected one binary message, got {other:?}"),
    }
    assert_eq!(next(&events), Event::Close(1000, String::new()));

    client.disconnect();
    server.join().unwrap();
}

#[test]
fn compressed_text_round_trip() {
    const MESSAGE: &str = "The quick brown fox";

    let (addr, server) = spawn_server(|mut conn| {
        let request = conn.accept_upgrade(Some("permessage-deflate"));
        assert!(
            request.contains("permessage-deflate"),
            "client must offer the extension"
        );

        // Server-to-client: deflate with RSV1 set.
        let compressed = Deflater::new(&DeflateParams::default(), 6)
            .compress(MESSAGE.as_bytes())
            .unwrap();
        conn.write_frame(true, true, 0x1, &compressed);

        // Client-to-server echo must arrive compressed and inflate back.
        let frame = conn.read_frame();
        assert_eq!(frame.opcode, 0x1);
        assert!(frame.rsv1, "echo should be compressed");
        let inflated = Inflater::new(&DeflateParams::default(), 1 << 20)
            .decompress(&frame.payload)
            .unwrap();
        assert_eq!(inflated, MESSAGE.as_bytes());

        conn.write_close(1000, "");
        assert_eq!(conn.read_until_close(), 1000);
    });

    let (client, events) = wired_client(addr);
    client.enable_compression();
    client.connect().unwrap();

    assert_eq!(next(&events), Event::Open);
    assert_eq!(next(&events), Event::Text(MESSAGE.to_string()));
    client.send_message(MESSAGE).unwrap();
    assert_eq!(next(&events), Event::Close(1000, String::new()));

    client.disconnect();
    server.join().unwrap();
}

#[test]
fn invalid_utf8_continuation_closes_1007() {
    let (addr, server) = spawn_server(|mut conn| {
        conn.accept_upgrade(None);

        // κ plus a dangling multi-byte lead, then a byte that completes it
        // invalid.
        conn.write_frame(false, false, 0x1, &[0xCE, 0xBA, 0xE1]);
        conn.write_frame(false, false, 0x0, &[0xFF]);

        assert_eq!(conn.read_until_close(), 1007);
        conn.drop_abruptly();
    });

    let (client, events) = wired_client(addr);
    client.connect().unwrap();

    assert_eq!(next(&events), Event::Open);
    match next(&events) {
        Event::Close(1007, _) => {}
        other => panic!("expected close 1007, got {other:?}"),
    }

    client.disconnect();
    server.join().unwrap();
}

#[test]
fn masked_server_frame_closes_1002() {
    let (addr, server) = spawn_server(|mut conn| {
        conn.accept_upgrade(None);

        // A masked binary frame from the server is a protocol error.
        conn.write_raw(&[0x82, 0x81, 0x00, 0x00, 0x00, 0x00, 0x00]);

        assert_eq!(conn.read_until_close(), 1002);
        conn.drop_abruptly();
    });

    let (client, events) = wired_client(addr);
    client.connect().unwrap();

    assert_eq!(next(&events), Event::Open);
    match next(&events) {
        Event::Close(1002, _) => {}
        other => panic!("expected close 1002, got {other:?}"),
    }

    client.disconnect();
    server.join().unwrap();
}

#[test]
fn ping_during_fragmentation_answered_without_state_loss() {
    let (addr, server) = spawn_server(|mut conn| {
        conn.accept_upgrade(None);

        conn.write_frame(false, false, 0x1, b"Hel");
        conn.write_frame(true, false, 0x9, b"mid-message");
        conn.write_frame(true, false, 0x0, b"lo");

        let pong = conn.read_frame();
        assert_eq!(pong.opcode, 0xA);
        assert_eq!(pong.payload, b"mid-message");

        conn.write_close(1000, "");
        assert_eq!(conn.read_until_close(), 1000);
    });

    let (client, events) = wired_client(addr);
    client.connect().unwrap();

    assert_eq!(next(&events), Event::Open);
    assert_eq!(next(&events), Event::Text("Hello".to_string()));
    assert_eq!(next(&events), Event::Close(1000, String::new()));

    client.disconnect();
    server.join().unwrap();
}

#[test]
fn abrupt_transport_loss_reports_1006() {
    let (addr, server) = spawn_server(|mut conn| {
        conn.accept_upgrade(None);
        conn.drop_abruptly();
    });

    let (client, events) = wired_client(addr);
    client.connect().unwrap();

    assert_eq!(next(&events), Event::Open);
    assert_eq!(
        next(&events),
        Event::Close(1006, "abnormal closure".to_string())
    );

    client.disconnect();
    server.join().unwrap();
}

#[test]
fn rejected_upgrade_fires_error_not_close() {
    let (addr, server) = spawn_server(|mut conn| {
        conn.reject_upgrade("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
    });

    let (client, events) = wired_client(addr);
    client.connect().unwrap();

    match next(&events) {
        Event::Error(message) => assert!(message.contains("101"), "got: {message}"),
        other => panic!("expected a handshake error, got {other:?}"),
    }

    // No close callback: the connection never opened.
    match events.recv_timeout(Duration::from_millis(300)) {
        Err(RecvTimeoutError::Timeout) => {}
        other => panic!("expected silence after the error, got {other:?}"),
    }

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Closed);
    server.join().unwrap();
}

#[test]
fn unknown_extension_parameter_fails_handshake() {
    let (addr, server) = spawn_server(|mut conn| {
        conn.accept_upgrade(Some("permessage-deflate; mystery_knob=3"));
    });

    let (client, events) = wired_client(addr);
    client.enable_compression();
    client.connect().unwrap();

    match next(&events) {
        Event::Error(message) => assert!(message.contains("mystery_knob"), "got: {message}"),
        other => panic!("expected a handshake error, got {other:?}"),
    }

    client.disconnect();
    server.join().unwrap();
}

#[test]
fn messages_queued_before_open_flush_in_order() {
    let (addr, server) = spawn_server(|mut conn| {
        conn.accept_upgrade(None);

        for expected in ["first", "second", "third"] {
            let frame = conn.read_frame();
            assert_eq!(frame.opcode, 0x1);
            assert_eq!(frame.payload, expected.as_bytes());
        }

        conn.write_close(1000, "");
        assert_eq!(conn.read_until_close(), 1000);
    });

    let (client, events) = wired_client(addr);
    client.connect().unwrap();
    client.send_message("first").unwrap();
    client.send_message("second").unwrap();
    client.send_message("third").unwrap();

    assert_eq!(next(&events), Event::Open);
    assert_eq!(next(&events), Event::Close(1000, String::new()));

    client.disconnect();
    server.join().unwrap();
}

#[test]
fn local_close_sends_frame_and_reports_reply() {
    let (addr, server) = spawn_server(|mut conn| {
        conn.accept_upgrade(None);

        let frame = conn.read_frame();
        assert_eq!(frame.opcode, 0x8);
        assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&frame.payload[2..], b"done");

        conn.write_close(1000, "done");
    });

    let (client, events) = wired_client(addr);
    client.connect().unwrap();

    assert_eq!(next(&events), Event::Open);
    client.close(CloseCode::Normal.as_u16(), "done").unwrap();
    assert_eq!(next(&events), Event::Close(1000, "done".to_string()));

    // After a close request, further sends are rejected.
    assert!(client.send_message("too late").is_err());

    client.disconnect();
    server.join().unwrap();
}

#[test]
fn ping_timer_sends_pings() {
    let (addr, server) = spawn_server(|mut conn| {
        conn.accept_upgrade(None);

        let ping = conn.read_frame();
        assert_eq!(ping.opcode, 0x9);
        assert!(ping.payload.is_empty());
        conn.write_frame(true, false, 0xA, &ping.payload);

        conn.write_close(1000, "");
        assert_eq!(conn.read_until_close(), 1000);
    });

    let (client, events) = wired_client(addr);
    client.set_ping_interval(Some(Duration::from_millis(100)));
    client.connect().unwrap();

    assert_eq!(next(&events), Event::Open);
    assert_eq!(next(&events), Event::Close(1000, String::new()));

    client.disconnect();
    server.join().unwrap();
}
