//! Autobahn Test Suite echo client.
//!
//! Runs every fuzzing-server case, echoing text and binary messages until
//! the server closes the case, then fetches the report update. Point it at
//! a running `wstest -m fuzzingserver` instance:
//!
//! ```sh
//! cargo run --example autobahn -- ws://127.0.0.1:9001 516
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use wscl::WebSocketClient;

const AGENT: &str = "wscl";

fn run_until_closed(url: &str, timeout: Duration) {
    let client = Arc::new(WebSocketClient::new());
    if let Err(e) = client.set_url(url) {
        eprintln!("bad URL {url}: {e}");
        return;
    }
    client.enable_compression();

    let (done_tx, done_rx) = channel();
    // Once closing begins, stop echoing so nothing races the close
    // handshake.
    let closing = Arc::new(AtomicBool::new(false));

    // Callbacks hold a weak handle: they may send replies but must not keep
    // the client alive.
    let weak = Arc::downgrade(&client);
    {
        let closing = closing.clone();
        client.set_message_callback(move |msg| {
            if closing.load(Ordering::Acquire) {
                return;
            }
            if let Some(client) = weak.upgrade() {
                let _ = client.send_message(msg);
            }
        });
    }
    let weak = Arc::downgrade(&client);
    {
        let closing = closing.clone();
        client.set_binary_callback(move |data| {
            if closing.load(Ordering::Acquire) {
                return;
            }
            if let Some(client) = weak.upgrade() {
                let _ = client.send_binary(data);
            }
        });
    }
    {
        let closing = closing.clone();
        let done = done_tx.clone();
        client.set_close_callback(move |code, reason| {
            closing.store(true, Ordering::Release);
            println!("closed: {code} \"{reason}\"");
            let _ = done.send(());
        });
    }
    {
        let closing = closing.clone();
        client.set_error_callback(move |err| {
            closing.store(true, Ordering::Release);
            eprintln!("error: {err}");
            let _ = done_tx.send(());
        });
    }

    if let Err(e) = client.connect() {
        eprintln!("connect failed: {e}");
        return;
    }

    if done_rx.recv_timeout(timeout).is_err() {
        closing.store(true, Ordering::Release);
        eprintln!("timed out waiting for the server to close");
    }

    client.disconnect();
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let base = args
        .next()
        .unwrap_or_else(|| "ws://127.0.0.1:9001".to_string());
    let total_cases: u32 = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(516);

    for case in 1..=total_cases {
        println!("--- case {case}/{total_cases} ---");
        run_until_closed(
            &format!("{base}/runCase?case={case}&agent={AGENT}"),
            Duration::from_secs(60),
        );
    }

    println!("--- updating report ---");
    run_until_closed(
        &format!("{base}/updateReports?agent={AGENT}"),
        Duration::from_secs(10),
    );
}
