//! In-process WebSocket server for end-to-end client tests.
//!
//! Speaks just enough raw RFC 6455 on a blocking `std::net` socket to drive
//! one scripted connection per test: it accepts the upgrade, reads masked
//! client frames, and writes unmasked server frames (including deliberately
//! malformed ones). Assertions inside the server script surface through
//! `JoinHandle::join`.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread::JoinHandle;

use wscl::protocol::compute_accept_key;

/// A frame as read from the client, payload already unmasked.
#[derive(Debug)]
pub struct RawFrame {
    pub fin: bool,
    pub rsv1: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// One accepted server-side connection.
pub struct ServerConn {
    stream: TcpStream,
}

/// Bind an ephemeral port and run `script` on the first accepted
/// connection. Returns the address to connect to and the server thread.
pub fn spawn_server<F>(script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(ServerConn) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept test client");
        script(ServerConn { stream });
    });
    (addr, handle)
}

impl ServerConn {
    /// Read the upgrade request head and reply 101, optionally attaching a
    /// Sec-WebSocket-Extensions header. Returns the raw request head.
    pub fn accept_upgrade(&mut self, extensions: Option<&str>) -> String {
        let head = self.read_head();
        let key = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("sec-websocket-key")
                    .then(|| value.trim().to_string())
            })
            .expect("request carries Sec-WebSocket-Key");

        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n",
            compute_accept_key(&key)
        );
        if let Some(extensions) = extensions {
            response.push_str(&format!("Sec-WebSocket-Extensions: {extensions}\r\n"));
        }
        response.push_str("\r\n");
        self.stream.write_all(response.as_bytes()).unwrap();
        head
    }

    /// Read the request head, then answer with an arbitrary raw response
    /// (used for rejection scenarios).
    pub fn reject_upgrade(&mut self, response: &str) {
        let _ = self.read_head();
        self.stream.write_all(response.as_bytes()).unwrap();
    }

    fn read_head(&mut self) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            self.stream.read_exact(&mut byte).expect("read request head");
            head.push(byte[0]);
        }
        String::from_utf8(head).expect("request head is UTF-8")
    }

    /// Read one client frame; panics on malformed input. Client frames must
    /// be masked (RFC 6455 client rule); the payload is returned unmasked.
    pub fn read_frame(&mut self) -> RawFrame {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).expect("read frame header");

        let fin = header[0] & 0x80 != 0;
        let rsv1 = header[0] & 0x40 != 0;
        let opcode = header[0] & 0x0F;
        assert!(header[1] & 0x80 != 0, "client frames must be masked");

        let len = match header[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).unwrap();
                u64::from_be_bytes(ext) as usize
            }
            len => len as usize,
        };

        let mut mask = [0u8; 4];
        self.stream.read_exact(&mut mask).unwrap();

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).unwrap();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        RawFrame {
            fin,
            rsv1,
            opcode,
            payload,
        }
    }

    /// Write one unmasked server frame.
    pub fn write_frame(&mut self, fin: bool, rsv1: bool, opcode: u8, payload: &[u8]) {
        let mut out = Vec::with_capacity(payload.len() + 10);
        let mut byte0 = opcode;
        if fin {
            byte0 |= 0x80;
        }
        if rsv1 {
            byte0 |= 0x40;
        }
        out.push(byte0);

        let len = payload.len();
        if len <= 125 {
            out.push(len as u8);
        } else if len <= 65535 {
            out.push(126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(payload);
        self.stream.write_all(&out).unwrap();
    }

    /// Write a close frame with the given code and reason.
    pub fn write_close(&mut self, code: u16, reason: &str) {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        self.write_frame(true, false, 0x8, &payload);
    }

    /// Write arbitrary bytes, valid or not.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Read frames until a close frame arrives; returns its status code
    /// (1005 stand-in when the payload is empty).
    pub fn read_until_close(&mut self) -> u16 {
        loop {
            let frame = self.read_frame();
            if frame.opcode == 0x8 {
                if frame.payload.len() >= 2 {
                    return u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                }
                return 1005;
            }
        }
    }

    /// Drop the TCP connection without a close handshake.
    pub fn drop_abruptly(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
