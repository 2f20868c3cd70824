//! The embedded in-process broker: a framed-TCP router that tracks
//! per-client subscriptions and heartbeat liveness and fans published
//! messages out to matching subscribers.
//!
//! Grounded on `examples/original_source/messaging/num0w/Broker/Broker.cpp`.
//! That reference multiplexes every client over one ZeroMQ ROUTER socket on
//! a single OS thread; plain `std::net::TcpStream` has no equivalent
//! multi-socket poll without pulling in an async runtime or `mio`, neither
//! of which belongs in a crate built around blocking threads (see
//! `DESIGN.md`). This implementation reinterprets "single-threaded event
//! loop" as "one thread per client connection, all mutating a single
//! `Mutex`-guarded registry" — logically serialized the same way, just
//! scheduled by the OS instead of a manual poll loop.

pub mod client;

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::PostalError;
use crate::message::{decode_one_record, encode_record};

pub use client::BrokerTransport;

/// Default TCP port the embedded broker listens on (reference uses 4808).
pub const DEFAULT_PORT: u16 = 4808;

/// A client is evicted if no heartbeat is observed within this long.
/// Grounded on `num0w::Broker::RemoveInactiveClients`'s 10000ms constant.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the sweeper thread checks for inactive clients.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How often the accept loop polls the stop flag while no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

const FRAME_RECORD_TYPE: &str = "F";

/// One client known to the broker: a TCP connection plus its subscriptions.
///
/// Grounded on `num0w::RegisteredClient`; `zmqId` there (the ZeroMQ ROUTER
/// envelope identity) becomes `id`, an opaque per-connection counter, since
/// a plain `TcpStream` has no equivalent routing identity of its own.
struct RegisteredClient {
    id: u64,
    ordinal: u32,
    subscriptions: Mutex<HashSet<String>>,
    last_heartbeat: Mutex<Instant>,
    writer: Mutex<TcpStream>,
}

impl RegisteredClient {
    /// `"worker"` for ordinal 1, `"worker#2"` for ordinal >= 2.
    /// Grounded on `RegisteredClient::GetFullClientIdentifier`.
    fn full_identifier(logical_name: &str, ordinal: u32) -> String {
        if ordinal == 1 {
            logical_name.to_string()
        } else {
            format!("{logical_name}#{ordinal}")
        }
    }

    fn touch(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(*self.last_heartbeat.lock().unwrap()) > timeout
    }
}

#[derive(Default)]
struct Registry {
    /// logical name -> clients registered under that name.
    by_name: HashMap<String, Vec<Arc<RegisteredClient>>>,
    /// connection id -> logical name, for O(1) dispatch lookup.
    by_id: HashMap<u64, String>,
}

impl Registry {
    fn smallest_available_ordinal(clients: &[Arc<RegisteredClient>]) -> u32 {
        let mut candidate = 1u32;
        loop {
            if !clients.iter().any(|c| c.ordinal == candidate) {
                return candidate;
            }
            candidate += 1;
        }
    }

    /// Register a new connection under `logical_name`, allocating the
    /// smallest ordinal not already in use for that name. Returns the full
    /// identifier to reply with.
    fn register(&mut self, id: u64, logical_name: &str, writer: TcpStream) -> String {
        let clients = self.by_name.entry(logical_name.to_string()).or_default();
        let ordinal = Self::smallest_available_ordinal(clients);
        clients.push(Arc::new(RegisteredClient {
            id,
            ordinal,
            subscriptions: Mutex::new(HashSet::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            writer: Mutex::new(writer),
        }));
        self.by_id.insert(id, logical_name.to_string());
        RegisteredClient::full_identifier(logical_name, ordinal)
    }

    fn find_by_id(&self, id: u64) -> Option<Arc<RegisteredClient>> {
        let name = self.by_id.get(&id)?;
        self.by_name
            .get(name)?
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    fn touch_heartbeat(&self, id: u64) {
        if let Some(client) = self.find_by_id(id) {
            client.touch();
        }
    }

    fn set_subscription(&self, id: u64, topic: &str, subscribed: bool) {
        if let Some(client) = self.find_by_id(id) {
            let mut subs = client.subscriptions.lock().unwrap();
            if subscribed {
                subs.insert(topic.to_string());
            } else {
                subs.remove(topic);
            }
        }
    }

    fn matching_subscribers(&self, topic: &str) -> Vec<Arc<RegisteredClient>> {
        self.by_name
            .values()
            .flatten()
            .filter(|c| c.subscriptions.lock().unwrap().contains(topic))
            .cloned()
            .collect()
    }

    /// Remove clients that haven't sent a heartbeat within
    /// `INACTIVITY_TIMEOUT`. Returns the full identifiers removed, for
    /// logging. Grounded on `num0w::Broker::RemoveInactiveClients`.
    fn remove_inactive(&mut self, now: Instant) -> Vec<String> {
        let mut removed = Vec::new();
        self.by_name.retain(|name, clients| {
            clients.retain(|c| {
                let stale = c.is_stale(now, INACTIVITY_TIMEOUT);
                if stale {
                    removed.push(RegisteredClient::full_identifier(name, c.ordinal));
                }
                !stale
            });
            !clients.is_empty()
        });
        self.by_id.retain(|id, name| {
            self.by_name
                .get(name)
                .is_some_and(|clients| clients.iter().any(|c| c.id == *id))
        });
        removed
    }

    fn remove_connection(&mut self, id: u64) {
        if let Some(name) = self.by_id.remove(&id) {
            if let Some(clients) = self.by_name.get_mut(&name) {
                clients.retain(|c| c.id != id);
                if clients.is_empty() {
                    self.by_name.remove(&name);
                }
            }
        }
    }
}

/// The embedded broker: owns the listening socket and the client registry.
pub struct Broker {
    listener: TcpListener,
    registry: Arc<Mutex<Registry>>,
    stop: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

/// A handle to a broker running on background threads, returned by [`Broker::spawn`].
pub struct BrokerHandle {
    stop: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
    sweep_thread: Option<thread::JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Signal both background threads to stop. Does not block; call `join`
    /// afterwards to wait for them to actually exit.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(mut self) {
        self.stop();
        if let Some(h) = self.accept_thread.take() {
            let _ = h.join();
        }
        if let Some(h) = self.sweep_thread.take() {
            let _ = h.join();
        }
    }
}

impl Broker {
    /// Bind a new broker. Pass port `0` to let the OS assign an ephemeral
    /// port (useful in tests); read it back via [`BrokerHandle::local_addr`].
    pub fn bind(host: &str, port: u16) -> Result<Self, PostalError> {
        let listener = TcpListener::bind((host, port))
            .map_err(|e| PostalError::Transport(format!("broker bind failed: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| PostalError::Transport(format!("broker set_nonblocking failed: {e}")))?;
        Ok(Self {
            listener,
            registry: Arc::new(Mutex::new(Registry::default())),
            stop: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop and the inactivity sweeper on background
    /// threads and return immediately with a handle to stop them.
    pub fn spawn(self) -> Result<BrokerHandle, PostalError> {
        let local_addr = self
            .listener
            .local_addr()
            .map_err(|e| PostalError::Transport(format!("local_addr failed: {e}")))?;

        let sweep_stop = self.stop.clone();
        let sweep_registry = self.registry.clone();
        let sweep_thread = thread::spawn(move || {
            while !sweep_stop.load(Ordering::Relaxed) {
                thread::sleep(SWEEP_INTERVAL);
                let mut registry = sweep_registry.lock().unwrap();
                for removed in registry.remove_inactive(Instant::now()) {
                    tracing::info!(client = %removed, "removing inactive client");
                }
            }
        });

        let Broker {
            listener,
            registry,
            stop,
            next_id,
        } = self;

        let accept_thread = thread::spawn(move || loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    let registry = registry.clone();
                    tracing::debug!(%addr, client_id = id, "broker accepted connection");
                    thread::spawn(move || handle_client(id, stream, registry));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "broker accept error");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        });

        Ok(BrokerHandle {
            stop,
            accept_thread: Some(accept_thread),
            sweep_thread: Some(sweep_thread),
            local_addr,
        })
    }
}

/// Read one length-prefixed wire frame, blocking until a complete `Record`
/// is available or the connection closes. Malformed records (per
/// `decode_one_record`) are silently skipped, matching the reference
/// client's own tolerance for junk on the wire.
fn read_frame(stream: &mut TcpStream, buf: &mut Vec<u8>) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some((record, consumed)) = decode_one_record(buf) {
            buf.drain(0..consumed);
            if let Some((_, text)) = record {
                return Ok(Some(text));
            }
            continue;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn write_frames(stream: &mut TcpStream, frames: &[&[u8]]) -> io::Result<()> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend(encode_record(FRAME_RECORD_TYPE, frame));
    }
    stream.write_all(&out)
}

/// One accepted connection's lifetime: read frames, dispatch verbs, reply.
///
/// Grounded on `Broker::Run`'s per-message verb dispatch (`Register`,
/// `Heartbeat`, `Subscribe`/`Unsubscribe`, `Publish`) — the polling/`Peek()`
/// outer loop there is replaced by this function simply blocking in
/// `read_frame` since each connection has its own OS thread here.
fn handle_client(id: u64, mut stream: TcpStream, registry: Arc<Mutex<Registry>>) {
    let writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, client_id = id, "failed to clone connection for fan-out writes");
            return;
        }
    };
    let mut buf = Vec::new();
    let mut registered = false;

    loop {
        let verb_bytes = match read_frame(&mut stream, &mut buf) {
            Ok(Some(v)) => v,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, client_id = id, "connection read error");
                break;
            }
        };
        let verb = String::from_utf8_lossy(&verb_bytes).into_owned();

        match verb.as_str() {
            "Register" => {
                let name_bytes = match read_frame(&mut stream, &mut buf) {
                    Ok(Some(v)) => v,
                    _ => {
                        tracing::warn!(client_id = id, "sequence error: no client identifier");
                        continue;
                    }
                };
                let logical_name = String::from_utf8_lossy(&name_bytes).into_owned();
                let writer_clone = match writer.try_clone() {
                    Ok(w) => w,
                    Err(_) => break,
                };
                let full_id = {
                    let mut registry = registry.lock().unwrap();
                    registry.register(id, &logical_name, writer_clone)
                };
                registered = true;
                tracing::info!(client = %full_id, "registered client");
                if write_frames(&mut stream, &[b"Register", full_id.as_bytes()]).is_err() {
                    break;
                }
            }
            "Heartbeat" => {
                if registered {
                    registry.lock().unwrap().touch_heartbeat(id);
                } else {
                    let _ = write_frames(&mut stream, &[b"UnregisteredError"]);
                }
            }
            "Subscribe" | "Unsubscribe" => {
                let topic_bytes = match read_frame(&mut stream, &mut buf) {
                    Ok(Some(v)) => v,
                    _ => {
                        tracing::warn!(client_id = id, "sequence error: no message type");
                        continue;
                    }
                };
                if !registered {
                    let _ = write_frames(&mut stream, &[b"UnregisteredError"]);
                    continue;
                }
                let topic = String::from_utf8_lossy(&topic_bytes).into_owned();
                registry
                    .lock()
                    .unwrap()
                    .set_subscription(id, &topic, verb == "Subscribe");
            }
            "Publish" => {
                let topic_bytes = match read_frame(&mut stream, &mut buf) {
                    Ok(Some(v)) => v,
                    _ => {
                        tracing::warn!(client_id = id, "sequence error: no message type");
                        continue;
                    }
                };
                let payload_bytes = match read_frame(&mut stream, &mut buf) {
                    Ok(Some(v)) => v,
                    _ => {
                        tracing::warn!(client_id = id, "sequence error: no payload");
                        continue;
                    }
                };
                if !registered {
                    let _ = write_frames(&mut stream, &[b"UnregisteredError"]);
                    continue;
                }
                let topic = String::from_utf8_lossy(&topic_bytes).into_owned();
                let subscribers = registry.lock().unwrap().matching_subscribers(&topic);
                for subscriber in subscribers {
                    let mut w = subscriber.writer.lock().unwrap();
                    let _ = write_frames(
                        &mut w,
                        &[b"Publish", topic_bytes.as_slice(), payload_bytes.as_slice()],
                    );
                }
            }
            other => {
                if !registered {
                    let _ = write_frames(&mut stream, &[b"UnregisteredError"]);
                } else {
                    tracing::warn!(client_id = id, verb = %other, "sequence error: unexpected header");
                }
            }
        }
    }

    registry.lock().unwrap().remove_connection(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdStream;
    use std::time::Duration as StdDuration;

    fn connect(addr: std::net::SocketAddr) -> StdStream {
        StdStream::connect(addr).unwrap()
    }

    fn register(stream: &mut StdStream, name: &str) -> String {
        write_frames(stream, &[b"Register", name.as_bytes()]).unwrap();
        let mut buf = Vec::new();
        let verb = read_frame(stream, &mut buf).unwrap().unwrap();
        assert_eq!(verb, b"Register");
        let id = read_frame(stream, &mut buf).unwrap().unwrap();
        String::from_utf8(id).unwrap()
    }

    #[test]
    fn register_heartbeat_subscribe_publish_roundtrip() {
        let broker = Broker::bind("127.0.0.1", 0).unwrap();
        let addr = broker.local_addr().unwrap();
        let handle = broker.spawn().unwrap();

        let mut publisher = connect(addr);
        register(&mut publisher, "pub");

        let mut subscriber = connect(addr);
        register(&mut subscriber, "sub");
        write_frames(&mut subscriber, &[b"Subscribe", b"greeting"]).unwrap();

        // Give the subscribe a moment to land before the publish races it.
        thread::sleep(StdDuration::from_millis(50));

        write_frames(&mut publisher, &[b"Publish", b"greeting", b"hi"]).unwrap();

        subscriber
            .set_read_timeout(Some(StdDuration::from_secs(2)))
            .unwrap();
        let mut buf = Vec::new();
        let verb = read_frame(&mut subscriber, &mut buf).unwrap().unwrap();
        assert_eq!(verb, b"Publish");
        let topic = read_frame(&mut subscriber, &mut buf).unwrap().unwrap();
        assert_eq!(topic, b"greeting");
        let payload = read_frame(&mut subscriber, &mut buf).unwrap().unwrap();
        assert_eq!(payload, b"hi");

        handle.join();
    }

    #[test]
    fn unregistered_client_gets_error() {
        let broker = Broker::bind("127.0.0.1", 0).unwrap();
        let addr = broker.local_addr().unwrap();
        let handle = broker.spawn().unwrap();

        let mut stream = connect(addr);
        write_frames(&mut stream, &[b"Heartbeat"]).unwrap();
        stream
            .set_read_timeout(Some(StdDuration::from_secs(2)))
            .unwrap();
        let mut buf = Vec::new();
        let reply = read_frame(&mut stream, &mut buf).unwrap().unwrap();
        assert_eq!(reply, b"UnregisteredError");

        handle.join();
    }

    #[test]
    fn two_registrations_under_same_name_get_distinct_ordinals() {
        let broker = Broker::bind("127.0.0.1", 0).unwrap();
        let addr = broker.local_addr().unwrap();
        let handle = broker.spawn().unwrap();

        let mut first = connect(addr);
        let first_id = register(&mut first, "worker");
        assert_eq!(first_id, "worker");

        let mut second = connect(addr);
        let second_id = register(&mut second, "worker");
        assert_eq!(second_id, "worker#2");

        handle.join();
    }
}
