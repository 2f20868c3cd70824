//! Broker-level liveness scenarios: ordinal allocation, heartbeat eviction,
//! and ordinal reuse after eviction.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use postal::Broker;

const FRAME_RECORD_TYPE: &str = "F";

fn encode_record(record_type: &str, text: &[u8]) -> Vec<u8> {
    let content_len = record_type.len() + text.len() + 4;
    let mut out = Vec::with_capacity(content_len + 16);
    out.push(b'[');
    out.extend(content_len.to_string().into_bytes());
    out.push(b' ');
    out.push(b'(');
    out.extend_from_slice(record_type.as_bytes());
    out.push(b' ');
    out.extend_from_slice(text);
    out.push(b')');
    out.push(b'\n');
    out.push(b']');
    out
}

fn write_frames(stream: &mut TcpStream, frames: &[&[u8]]) {
    let mut out = Vec::new();
    for frame in frames {
        out.extend(encode_record(FRAME_RECORD_TYPE, frame));
    }
    stream.write_all(&out).unwrap();
}

/// Minimal manual frame reader mirroring the broker's own wire framing, kept
/// deliberately independent of `postal`'s internal `message` module so this
/// test exercises the protocol as an external client would see it.
fn read_frame(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        if let Some(open) = buf.iter().position(|&b| b == b'[') {
            if let Some(space_off) = buf[open + 1..].iter().position(|&b| b == b' ') {
                let space_idx = open + 1 + space_off;
                let len_str = std::str::from_utf8(&buf[open + 1..space_idx]).ok()?;
                let declared_len: usize = len_str.parse().ok()?;
                let content_start = space_idx + 1;
                let content_end = content_start + declared_len;
                if content_end < buf.len() && buf[content_end] == b']' {
                    let inner = &buf[content_start + 1..content_end - 2];
                    let sep = inner.iter().position(|&b| b == b' ')?;
                    let text = inner[sep + 1..].to_vec();
                    buf.drain(0..content_end + 1);
                    return Some(text);
                }
            }
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn register(stream: &mut TcpStream, name: &str) -> String {
    write_frames(stream, &[b"Register", name.as_bytes()]);
    let mut buf = Vec::new();
    let verb = read_frame(stream, &mut buf).unwrap();
    assert_eq!(verb, b"Register");
    let id = read_frame(stream, &mut buf).unwrap();
    String::from_utf8(id).unwrap()
}

#[test]
fn three_concurrent_registrations_get_distinct_ordinals() {
    let broker = Broker::bind("127.0.0.1", 0).unwrap();
    let addr = broker.local_addr().unwrap();
    let handle = broker.spawn().unwrap();

    let mut one = TcpStream::connect(addr).unwrap();
    let mut two = TcpStream::connect(addr).unwrap();
    let mut three = TcpStream::connect(addr).unwrap();

    let mut ids = vec![
        register(&mut one, "worker"),
        register(&mut two, "worker"),
        register(&mut three, "worker"),
    ];
    ids.sort();
    assert_eq!(ids, vec!["worker", "worker#2", "worker#3"]);

    handle.join();
}

/// Scenario 5 in full: a stale client is evicted within ~10s and its ordinal
/// becomes reusable. This test genuinely waits out the inactivity timeout
/// and is therefore slow (~11s); it earns its keep by being the only test
/// that exercises eviction end-to-end rather than the registry internals.
#[test]
fn stale_client_is_evicted_and_its_ordinal_is_reused() {
    let broker = Broker::bind("127.0.0.1", 0).unwrap();
    let addr = broker.local_addr().unwrap();
    let handle = broker.spawn().unwrap();

    let mut first = TcpStream::connect(addr).unwrap();
    let mut stale = TcpStream::connect(addr).unwrap();

    assert_eq!(register(&mut first, "worker"), "worker");
    assert_eq!(register(&mut stale, "worker"), "worker#2");

    // `stale` never heartbeats again; let it age past the 10s timeout.
    // `first` keeps heartbeating throughout so only `stale` gets evicted.
    for _ in 0..12 {
        std::thread::sleep(Duration::from_secs(1));
        write_frames(&mut first, &[b"Heartbeat"]);
    }

    let mut fresh = TcpStream::connect(addr).unwrap();
    assert_eq!(register(&mut fresh, "worker"), "worker#2");

    drop(first);
    handle.join();
}
