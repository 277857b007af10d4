//! Minimal WebSocket (RFC 6455) plumbing over `std::net::TcpStream`:
//! frame codec, client and server handshakes, and a `ws://` URL parser.
//! Shared by the device link (client side) and the simulator server.
//!
//! Text frames only carry protocol envelopes; fragmentation is not produced
//! by either peer we talk to, so continuation frames are rejected.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha1_smol::Sha1;
use std::io::{self, Cursor, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const OP_TEXT: u8 = 0x1;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

/// One parsed frame from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

// ─── Handshake ──────────────────────────────────────────────────────────────

/// Sec-WebSocket-Accept value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}{}", key, WS_GUID).as_bytes());
    base64_encode(&hasher.digest().bytes())
}

/// Perform the client side of the upgrade handshake. The stream's read
/// timeout bounds how long we wait for the server's response headers.
pub fn client_handshake(stream: &mut TcpStream, host: &str, path: &str) -> Result<(), String> {
    let key = base64_encode(&nonce16());
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        path, host, key
    );
    stream
        .write_all(request.as_bytes())
        .map_err(|e| format!("send upgrade request: {}", e))?;

    let header = read_http_header(stream).map_err(|e| format!("read upgrade response: {}", e))?;
    let mut lines = header.lines();
    let status = lines.next().unwrap_or("");
    if !status.contains("101") {
        return Err(format!("server refused upgrade: {}", status));
    }
    let expected = accept_key(&key);
    let accepted = lines
        .filter_map(|l| l.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("sec-websocket-accept") && value.trim() == expected
        });
    if !accepted {
        return Err("bad Sec-WebSocket-Accept in upgrade response".into());
    }
    Ok(())
}

/// Perform the server side of the upgrade handshake on an accepted stream.
pub fn server_handshake(stream: &mut TcpStream) -> Result<(), String> {
    let header = read_http_header(stream).map_err(|e| format!("read upgrade request: {}", e))?;
    let mut is_upgrade = false;
    let mut ws_key = None;
    for line in header.lines().skip(1) {
        let lower = line.to_lowercase();
        if lower.starts_with("upgrade:") && lower.contains("websocket") {
            is_upgrade = true;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("sec-websocket-key") {
                ws_key = Some(value.trim().to_string());
            }
        }
    }
    let key = match (is_upgrade, ws_key) {
        (true, Some(k)) => k,
        _ => {
            let body = b"<h1>400</h1><p>WebSocket upgrade required</p>";
            let _ = stream.write_all(
                format!(
                    "HTTP/1.1 400 Bad Request\r\n\
                     Content-Type: text/html\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\
                     \r\n",
                    body.len()
                )
                .as_bytes(),
            );
            let _ = stream.write_all(body);
            return Err("not a websocket upgrade request".into());
        }
    };
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(&key)
    );
    stream
        .write_all(response.as_bytes())
        .map_err(|e| format!("send upgrade response: {}", e))
}

/// Read HTTP headers byte-by-byte up to the blank line. Deliberately
/// unbuffered, since a BufReader could swallow the first frames that follow
/// the handshake on the same stream. Bounded: a peer that stops talking
/// mid-handshake gets a timeout, not a hang.
fn read_http_header(stream: &mut TcpStream) -> io::Result<String> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut bytes = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during handshake",
                ))
            }
            Ok(_) => {
                bytes.push(byte[0]);
                if bytes.ends_with(b"\r\n\r\n") {
                    break;
                }
                if bytes.len() > 16 * 1024 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "oversized http header",
                    ));
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "handshake timed out",
                    ));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ─── URL parsing ────────────────────────────────────────────────────────────

/// Split a `ws://host:port/path` URL into (host, port, path).
pub fn parse_ws_url(url: &str) -> Result<(String, u16, String), String> {
    let rest = url
        .strip_prefix("ws://")
        .ok_or_else(|| format!("unsupported URL scheme in {:?} (expected ws://)", url))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(format!("missing host in {:?}", url));
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| format!("bad port {:?} in {:?}", p, url))?;
            (h.to_string(), port)
        }
        None => (authority.to_string(), 80),
    };
    Ok((host, port, path.to_string()))
}

// ─── Frame codec ────────────────────────────────────────────────────────────

/// Write one frame. Client→server frames must set `mask`.
pub fn write_frame(w: &mut impl Write, opcode: u8, payload: &[u8], mask: bool) -> io::Result<()> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.push(0x80 | (opcode & 0x0F)); // FIN + opcode
    let mask_bit = if mask { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        frame.push(mask_bit | len as u8);
    } else if len < 65536 {
        frame.push(mask_bit | 126);
        frame.write_u16::<BigEndian>(len as u16)?;
    } else {
        frame.push(mask_bit | 127);
        frame.write_u64::<BigEndian>(len as u64)?;
    }
    if mask {
        let key = mask_key();
        frame.extend_from_slice(&key);
        frame.extend(payload.iter().enumerate().map(|(i, &b)| b ^ key[i % 4]));
    } else {
        frame.extend_from_slice(payload);
    }
    w.write_all(&frame)
}

/// Convenience: write a masked client text frame.
pub fn write_client_text(w: &mut impl Write, text: &str) -> io::Result<()> {
    write_frame(w, OP_TEXT, text.as_bytes(), true)
}

/// Convenience: write an unmasked server text frame.
pub fn write_server_text(w: &mut impl Write, text: &str) -> io::Result<()> {
    write_frame(w, OP_TEXT, text.as_bytes(), false)
}

/// Read one frame.
///
/// `Ok(None)` means the stream's read timeout expired before a frame
/// started, which is the caller's chance to poll its shutdown flag. Once a frame
/// has begun, the remainder is read to completion (timeouts mid-frame are
/// retried; a torn-down socket surfaces as a real error).
pub fn read_frame(stream: &mut TcpStream) -> io::Result<Option<WsFrame>> {
    let mut b0 = [0u8; 1];
    match stream.read(&mut b0) {
        Ok(0) => return Ok(Some(WsFrame::Close)),
        Ok(_) => {}
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
        {
            return Ok(None)
        }
        Err(e) => return Err(e),
    }

    let fin = b0[0] & 0x80 != 0;
    let opcode = b0[0] & 0x0F;
    if !fin || opcode == 0x0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "fragmented frames not supported",
        ));
    }

    let mut b1 = [0u8; 1];
    read_full(stream, &mut b1)?;
    let masked = b1[0] & 0x80 != 0;
    let len = match b1[0] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            read_full(stream, &mut ext)?;
            Cursor::new(ext).read_u16::<BigEndian>()? as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            read_full(stream, &mut ext)?;
            let len = Cursor::new(ext).read_u64::<BigEndian>()?;
            if len > 16 * 1024 * 1024 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
            }
            len as usize
        }
        n => n as usize,
    };

    let mut key = [0u8; 4];
    if masked {
        read_full(stream, &mut key)?;
    }
    let mut payload = vec![0u8; len];
    read_full(stream, &mut payload)?;
    if masked {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }

    Ok(Some(match opcode {
        OP_TEXT => WsFrame::Text(String::from_utf8_lossy(&payload).into_owned()),
        0x2 => WsFrame::Binary(payload),
        OP_PING => WsFrame::Ping(payload),
        OP_PONG => WsFrame::Pong(payload),
        OP_CLOSE => WsFrame::Close,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown opcode 0x{:X}", other),
            ))
        }
    }))
}

/// Fill `buf` completely, retrying through read-timeout ticks. A closed
/// socket yields `UnexpectedEof` (or whatever error the shutdown produced).
fn read_full(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                ))
            }
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ─── Entropy-light randomness for mask keys / handshake nonces ──────────────
// Interop needs unpredictability of no cryptographic consequence here; a
// time-seeded xorshift keeps the dependency set flat.

static MASK_STATE: AtomicU64 = AtomicU64::new(0);

fn next_rand() -> u64 {
    let mut s = MASK_STATE.load(Ordering::Relaxed);
    if s == 0 {
        s = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E37_79B9_7F4A_7C15)
            | 1;
    }
    s ^= s << 13;
    s ^= s >> 7;
    s ^= s << 17;
    MASK_STATE.store(s, Ordering::Relaxed);
    s
}

fn mask_key() -> [u8; 4] {
    next_rand().to_le_bytes()[..4].try_into().unwrap()
}

fn nonce16() -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&next_rand().to_le_bytes());
    out[8..].copy_from_slice(&next_rand().to_le_bytes());
    out
}

fn base64_encode(data: &[u8]) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut result = String::new();
    let mut i = 0;
    while i < data.len() {
        let b0 = data[i] as u32;
        let b1 = if i + 1 < data.len() {
            data[i + 1] as u32
        } else {
            0
        };
        let b2 = if i + 2 < data.len() {
            data[i + 2] as u32
        } else {
            0
        };
        let triple = (b0 << 16) | (b1 << 8) | b2;
        result.push(CHARS[((triple >> 18) & 0x3F) as usize] as char);
        result.push(CHARS[((triple >> 12) & 0x3F) as usize] as char);
        if i + 1 < data.len() {
            result.push(CHARS[((triple >> 6) & 0x3F) as usize] as char);
        } else {
            result.push('=');
        }
        if i + 2 < data.len() {
            result.push(CHARS[(triple & 0x3F) as usize] as char);
        } else {
            result.push('=');
        }
        i += 3;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_known_vectors() {
        assert_eq!(base64_encode(b""), "");
        assert_eq!(base64_encode(b"f"), "Zg==");
        assert_eq!(base64_encode(b"fo"), "Zm8=");
        assert_eq!(base64_encode(b"foo"), "Zm9v");
        assert_eq!(base64_encode(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn test_accept_key_rfc_example() {
        // The worked example from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_parse_ws_url() {
        assert_eq!(
            parse_ws_url("ws://127.0.0.1:12345/link").unwrap(),
            ("127.0.0.1".into(), 12345, "/link".into())
        );
        assert_eq!(
            parse_ws_url("ws://localhost:9000").unwrap(),
            ("localhost".into(), 9000, "/".into())
        );
        assert_eq!(
            parse_ws_url("ws://example.com/x").unwrap(),
            ("example.com".into(), 80, "/x".into())
        );
        assert!(parse_ws_url("http://example.com").is_err());
        assert!(parse_ws_url("ws://host:notaport/").is_err());
    }

    #[test]
    fn test_frame_round_trip_over_loopback() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = std::thread::spawn(move || {
            let mut out = TcpStream::connect(addr).unwrap();
            write_client_text(&mut out, "hello").unwrap();
            write_frame(&mut out, OP_PING, b"hb", true).unwrap();
            // 200-byte payload exercises the 16-bit extended length path.
            let big = "x".repeat(200);
            write_client_text(&mut out, &big).unwrap();
            write_frame(&mut out, OP_CLOSE, &[], true).unwrap();
        });

        let (mut stream, _) = listener.accept().unwrap();
        assert_eq!(
            read_frame(&mut stream).unwrap(),
            Some(WsFrame::Text("hello".into()))
        );
        assert_eq!(
            read_frame(&mut stream).unwrap(),
            Some(WsFrame::Ping(b"hb".to_vec()))
        );
        match read_frame(&mut stream).unwrap() {
            Some(WsFrame::Text(t)) => assert_eq!(t.len(), 200),
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(read_frame(&mut stream).unwrap(), Some(WsFrame::Close));
        sender.join().unwrap();
    }

    #[test]
    fn test_read_frame_times_out_to_none() {
        use std::net::TcpListener;
        use std::time::Duration;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(read_frame(&mut stream).unwrap(), None);
    }

    #[test]
    fn test_mask_keys_vary() {
        assert_ne!(mask_key(), mask_key());
    }
}
