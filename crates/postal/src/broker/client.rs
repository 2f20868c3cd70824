//! [`BrokerTransport`]: the client-side [`crate::transport::Transport`] that
//! dials the embedded [`super::Broker`] over plain TCP.
//!
//! Grounded on `examples/original_source/messaging/numrabw/numrabw_postoffice.cpp`
//! for the lazy reconnect-on-every-call shape (`CheckConnection`/
//! `RegularOperations`), and on `num0w::Broker::Broker.cpp` for the wire
//! protocol this dials into.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::PostalError;
use crate::message::{decode_one_record, encode_record, Message};
use crate::transport::Transport;

const FRAME_RECORD_TYPE: &str = "F";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Grounded on spec's reconnect state machine: "pause 1 s before retrying".
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Version string reported by [`Transport::version`].
pub const VERSION: &str = concat!("postal-broker-transport/", env!("CARGO_PKG_VERSION"));

/// A condvar-backed wakeup latch so [`Transport::wake`] can interrupt a
/// concurrent [`Transport::wait`] from any thread without busy-polling.
/// Grounded on `numrabw::Activity()`'s role as the cross-thread nudge.
struct WakeSignal {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn wake(&self) {
        let mut flag = self.mutex.lock().unwrap();
        *flag = true;
        self.condvar.notify_all();
    }

    /// Waits up to `timeout` for a flag set by `wake`, or for the predicate
    /// `still_waiting` to go false (checked before sleeping and after each
    /// spurious wakeup). Clears the flag before returning `true`.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.mutex.lock().unwrap();
        loop {
            if *flag {
                *flag = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .condvar
                .wait_timeout(flag, deadline - now)
                .unwrap();
            flag = guard;
            if result.timed_out() && !*flag {
                return false;
            }
        }
    }
}

struct Connection {
    stream: TcpStream,
    read_buf: Vec<u8>,
}

/// Everything about the connection that must survive a reconnect: the
/// socket itself, plus bookkeeping to replay state once reconnected.
struct State {
    conn: Option<Connection>,
    subscriptions: HashSet<String>,
    client_address: String,
    last_heartbeat_sent: Instant,
}

/// Client-side transport talking to the embedded [`super::Broker`].
///
/// Owns a lazily-(re)established `TcpStream`. Every public method first
/// calls `ensure_connected`, mirroring `numrabw::CheckConnection`'s
/// check-before-every-operation pattern rather than a background reconnect
/// thread.
pub struct BrokerTransport {
    host: String,
    port: u16,
    identity: Mutex<String>,
    state: Mutex<State>,
    wake: WakeSignal,
    errors: Mutex<Vec<String>>,
    epoch: AtomicU64,
    closed: AtomicBool,
}

impl BrokerTransport {
    pub fn new(host: impl Into<String>, port: u16, identity: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            identity: Mutex::new(identity.into()),
            state: Mutex::new(State {
                conn: None,
                subscriptions: HashSet::new(),
                client_address: String::new(),
                last_heartbeat_sent: Instant::now() - HEARTBEAT_INTERVAL,
            }),
            wake: WakeSignal::new(),
            errors: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn push_error(&self, err: impl Into<String>) {
        self.errors.lock().unwrap().push(err.into());
    }

    /// Ensures `state.conn` is `Some`, dialing and replaying `Register` plus
    /// every tracked subscription if it wasn't. On success bumps `epoch` so
    /// the engine can detect "we just reconnected."
    fn ensure_connected(&self, state: &mut State) -> bool {
        if state.conn.is_some() {
            return true;
        }
        let stream = match TcpStream::connect((self.host.as_str(), self.port)) {
            Ok(s) => s,
            Err(e) => {
                self.push_error(format!("connect {}:{} failed: {e}", self.host, self.port));
                return false;
            }
        };
        let _ = stream.set_nodelay(true);
        let mut conn = Connection {
            stream,
            read_buf: Vec::new(),
        };

        let identity = self.identity.lock().unwrap().clone();
        if Self::write_frames(&mut conn.stream, &[b"Register", identity.as_bytes()]).is_err() {
            self.push_error("register write failed");
            return false;
        }
        match Self::read_frame_blocking(&mut conn, Duration::from_secs(5)) {
            Ok(Some(verb)) if verb == b"Register" => {}
            _ => {
                self.push_error("register: no reply from broker");
                return false;
            }
        }
        let full_addr = match Self::read_frame_blocking(&mut conn, Duration::from_secs(5)) {
            Ok(Some(addr)) => String::from_utf8_lossy(&addr).into_owned(),
            _ => {
                self.push_error("register: missing assigned address");
                return false;
            }
        };

        for topic in state.subscriptions.clone() {
            if Self::write_frames(&mut conn.stream, &[b"Subscribe", topic.as_bytes()]).is_err() {
                self.push_error(format!("resubscribe to {topic} failed"));
                return false;
            }
        }

        // Handshake above runs with blocking reads (via `read_frame_blocking`'s
        // explicit timeout); ordinary operation needs non-blocking reads so
        // `receive()` never stalls the single worker thread waiting on data
        // that may never arrive.
        if conn.stream.set_nonblocking(true).is_err() {
            self.push_error("failed to switch connection to non-blocking mode");
            return false;
        }

        state.client_address = full_addr;
        state.conn = Some(conn);
        state.last_heartbeat_sent = Instant::now();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn write_frames(stream: &mut TcpStream, frames: &[&[u8]]) -> io::Result<()> {
        let mut out = Vec::new();
        for frame in frames {
            out.extend(encode_record(FRAME_RECORD_TYPE, frame));
        }
        stream.write_all(&out)
    }

    /// Reads one frame, blocking with `timeout` applied via
    /// `set_read_timeout`. Used only during the synchronous `Register`
    /// handshake in `ensure_connected`.
    fn read_frame_blocking(conn: &mut Connection, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        conn.stream.set_read_timeout(Some(timeout))?;
        let result = Self::read_frame(conn);
        let _ = conn.stream.set_read_timeout(None);
        result
    }

    /// Non-blocking-ish frame read: returns immediately with whatever is
    /// already buffered/available on the socket, `None` if nothing is ready
    /// yet (a `WouldBlock`/timeout read), or an error if the socket died.
    fn read_frame(conn: &mut Connection) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some((record, consumed)) = decode_one_record(&conn.read_buf) {
                conn.read_buf.drain(0..consumed);
                if let Some((_, text)) = record {
                    return Ok(Some(text));
                }
                continue;
            }
            let mut chunk = [0u8; 4096];
            match conn.stream.read(&mut chunk) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")),
                Ok(n) => conn.read_buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn drop_connection(&self, state: &mut State, reason: &str) {
        if state.conn.take().is_some() {
            self.push_error(format!("connection dropped: {reason}"));
        }
    }
}

impl Transport for BrokerTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PostalError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PostalError::Closed);
        }
        let mut state = self.state.lock().unwrap();
        if !self.ensure_connected(&mut state) {
            return Err(PostalError::Transport("not connected".into()));
        }
        let conn = state.conn.as_mut().unwrap();
        if Self::write_frames(&mut conn.stream, &[b"Publish", topic.as_bytes(), payload]).is_err() {
            self.drop_connection(&mut state, "publish write failed");
            return Err(PostalError::Transport("publish failed".into()));
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), PostalError> {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.insert(topic.to_string());
        if !self.ensure_connected(&mut state) {
            // Recorded for replay on the next successful (re)connect.
            return Ok(());
        }
        let conn = state.conn.as_mut().unwrap();
        if Self::write_frames(&mut conn.stream, &[b"Subscribe", topic.as_bytes()]).is_err() {
            self.drop_connection(&mut state, "subscribe write failed");
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), PostalError> {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.remove(topic);
        if !self.ensure_connected(&mut state) {
            return Ok(());
        }
        let conn = state.conn.as_mut().unwrap();
        if Self::write_frames(&mut conn.stream, &[b"Unsubscribe", topic.as_bytes()]).is_err() {
            self.drop_connection(&mut state, "unsubscribe write failed");
        }
        Ok(())
    }

    fn receive(&self) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        if !self.ensure_connected(&mut state) {
            return None;
        }
        loop {
            let conn = state.conn.as_mut()?;
            match Self::read_frame(conn) {
                Ok(Some(verb)) if verb == b"Publish" => {
                    let topic = match Self::read_frame(conn) {
                        Ok(Some(t)) => t,
                        _ => {
                            self.drop_connection(&mut state, "publish missing topic frame");
                            return None;
                        }
                    };
                    let payload = match Self::read_frame(conn) {
                        Ok(Some(p)) => p,
                        _ => {
                            self.drop_connection(&mut state, "publish missing payload frame");
                            return None;
                        }
                    };
                    let topic = String::from_utf8_lossy(&topic).into_owned();
                    return Some(Message::new_unchecked(topic, payload));
                }
                Ok(Some(verb)) if verb == b"UnregisteredError" => {
                    self.push_error("broker reported us unregistered; reconnecting");
                    self.drop_connection(&mut state, "unregistered");
                    return None;
                }
                Ok(Some(_)) => continue,
                Ok(None) => return None,
                Err(e) => {
                    self.drop_connection(&mut state, &e.to_string());
                    return None;
                }
            }
        }
    }

    fn wait(&self, max_wait: Duration) -> bool {
        if self.wake.wait(max_wait) {
            return true;
        }
        // Even without an explicit wake, give the caller a chance to retry a
        // dropped connection rather than waiting out the full backoff idle.
        let state = self.state.lock().unwrap();
        state.conn.is_none()
    }

    fn wake(&self) {
        self.wake.wake();
    }

    fn set_identity(&self, identity: &str) {
        *self.identity.lock().unwrap() = identity.to_string();
    }

    fn client_address(&self) -> String {
        self.state.lock().unwrap().client_address.clone()
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn take_errors(&self) -> Vec<String> {
        std::mem::take(&mut self.errors.lock().unwrap())
    }

    fn connection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn heartbeat(&self) {
        let mut state = self.state.lock().unwrap();
        if state.last_heartbeat_sent.elapsed() < HEARTBEAT_INTERVAL {
            return;
        }
        if !self.ensure_connected(&mut state) {
            std::thread::sleep(RECONNECT_BACKOFF);
            return;
        }
        let conn = state.conn.as_mut().unwrap();
        if Self::write_frames(&mut conn.stream, &[b"Heartbeat"]).is_err() {
            self.drop_connection(&mut state, "heartbeat write failed");
            return;
        }
        state.last_heartbeat_sent = Instant::now();
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
