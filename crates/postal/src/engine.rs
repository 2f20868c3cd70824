//! [`BufferedPostOffice`]: the engine. Owns a transport, two bounded queues,
//! two throughput meters, an error journal, and a single worker thread that
//! shuttles items between the application and the transport.
//!
//! Grounded on `examples/original_source/messaging/claim/PostOffice.cpp`,
//! specifically its `operator()()` worker loop and `GetStatusMessage()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bounded_queue::{BoundedQueue, ByteSized};
use crate::error_journal::ErrorJournal;
use crate::message::{AttributeMessage, Message};
use crate::throughput::ThroughputMeter;
use crate::transport::Transport;

/// Topic the engine publishes its own health/status messages on.
pub const STATUS_TOPIC: &str = "__claim_MsgStatus";

const SEND_MAX_PER_PASS: usize = 100;
const RECEIVE_MAX_PER_PASS: usize = 100;
const STATUS_IDLE_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_MAX_INTERVAL: Duration = Duration::from_secs(5);
const HOSTNAME_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// One item on the send queue. Grounded on `claim::SendBufferAction`'s
/// tagged union (`SendAction` / `SubscribeAction` / `SetClientIdentifierAction`).
#[derive(Debug, Clone)]
pub(crate) enum ControlRecord {
    Publish(Message),
    Subscribe(String),
    Unsubscribe(String),
    SetIdentifier(String),
}

impl ByteSized for ControlRecord {
    fn byte_size(&self) -> usize {
        match self {
            ControlRecord::Publish(msg) => msg.size(),
            ControlRecord::Subscribe(topic) | ControlRecord::Unsubscribe(topic) => topic.len(),
            ControlRecord::SetIdentifier(identity) => identity.len(),
        }
    }
}

impl ByteSized for Message {
    fn byte_size(&self) -> usize {
        self.size()
    }
}

struct HostnameCache {
    hostname: String,
    username: String,
    last_refresh: Option<Instant>,
}

impl HostnameCache {
    fn new() -> Self {
        Self {
            hostname: String::new(),
            username: String::new(),
            last_refresh: None,
        }
    }

    /// Refresh at most once per `HOSTNAME_REFRESH_INTERVAL`, or immediately
    /// if never populated. Grounded on `claim::PostOffice::GetStatusMessage`'s
    /// cached-hostname behavior.
    fn refresh_if_stale(&mut self) {
        let stale = match self.last_refresh {
            None => true,
            Some(t) => t.elapsed() >= HOSTNAME_REFRESH_INTERVAL,
        };
        if !stale {
            return;
        }
        self.hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        self.username = whoami::username();
        self.last_refresh = Some(Instant::now());
    }
}

/// The buffered post-office engine: the public-facing handle an application
/// holds onto once `create_post_office` returns (with `buffered = true`).
pub struct BufferedPostOffice {
    transport: Arc<dyn Transport>,
    send_queue: Arc<BoundedQueue<ControlRecord>>,
    recv_queue: Arc<BoundedQueue<Message>>,
    send_meter: Arc<ThroughputMeter>,
    recv_meter: Arc<ThroughputMeter>,
    errors: Arc<ErrorJournal>,
    stop: Arc<AtomicBool>,
    client_address: Arc<Mutex<String>>,
    worker: Option<JoinHandle<()>>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl BufferedPostOffice {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        send_max_items: usize,
        send_max_bytes: usize,
        recv_max_items: usize,
        recv_max_bytes: usize,
    ) -> Self {
        let send_queue = Arc::new(BoundedQueue::new(send_max_items, send_max_bytes));
        let recv_queue = Arc::new(BoundedQueue::new(recv_max_items, recv_max_bytes));
        let send_meter = Arc::new(ThroughputMeter::new());
        let recv_meter = Arc::new(ThroughputMeter::new());
        let errors = Arc::new(ErrorJournal::new());
        let stop = Arc::new(AtomicBool::new(false));
        let client_address = Arc::new(Mutex::new(transport.client_address()));
        let started_at = chrono::Utc::now();

        let worker = {
            let transport = transport.clone();
            let send_queue = send_queue.clone();
            let recv_queue = recv_queue.clone();
            let send_meter = send_meter.clone();
            let recv_meter = recv_meter.clone();
            let errors = errors.clone();
            let stop = stop.clone();
            let client_address = client_address.clone();
            thread::spawn(move || {
                worker_loop(
                    transport,
                    send_queue,
                    recv_queue,
                    send_meter,
                    recv_meter,
                    errors,
                    stop,
                    client_address,
                    started_at,
                )
            })
        };

        Self {
            transport,
            send_queue,
            recv_queue,
            send_meter,
            recv_meter,
            errors,
            stop,
            client_address,
            worker: Some(worker),
            started_at,
        }
    }

    /// Enqueue a subscribe control record. Drops it and records an error if
    /// the send queue is full; wakes the worker on success.
    pub fn subscribe(&self, topic: &str) {
        if self
            .send_queue
            .push(ControlRecord::Subscribe(topic.to_string()))
        {
            self.transport.wake();
        } else {
            self.errors.set(format!("send queue full: dropped subscribe({topic})"));
        }
    }

    pub fn unsubscribe(&self, topic: &str) {
        if self
            .send_queue
            .push(ControlRecord::Unsubscribe(topic.to_string()))
        {
            self.transport.wake();
        } else {
            self.errors
                .set(format!("send queue full: dropped unsubscribe({topic})"));
        }
    }

    /// Validates the message's topic, enqueues a publish control record, and
    /// wakes the worker. Returns `false` if validation fails or the send
    /// queue is full; the failure is recorded in the error journal either way.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        let msg = match Message::new(topic, payload.to_vec()) {
            Ok(msg) => msg,
            Err(e) => {
                self.errors.set(e.to_string());
                return false;
            }
        };
        if self.send_queue.push(ControlRecord::Publish(msg)) {
            self.transport.wake();
            true
        } else {
            self.errors
                .set(format!("send queue full: dropped publish({topic})"));
            false
        }
    }

    /// Blocks up to `max_wait` for a received message.
    pub fn receive(&self, max_wait: Duration) -> Option<Message> {
        self.recv_queue.pop(max_wait)
    }

    /// Pops the oldest pending error, or an empty string if none.
    pub fn error(&self) -> String {
        self.errors.get()
    }

    pub fn client_address(&self) -> String {
        self.client_address.lock().unwrap().clone()
    }

    pub fn version(&self) -> &str {
        self.transport.version()
    }

    /// Signals the worker to stop, wakes it, and joins. Idempotent.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.send_queue.halt();
        self.recv_queue.halt();
        self.transport.wake();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BufferedPostOffice {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    transport: Arc<dyn Transport>,
    send_queue: Arc<BoundedQueue<ControlRecord>>,
    recv_queue: Arc<BoundedQueue<Message>>,
    send_meter: Arc<ThroughputMeter>,
    recv_meter: Arc<ThroughputMeter>,
    errors: Arc<ErrorJournal>,
    stop: Arc<AtomicBool>,
    client_address: Arc<Mutex<String>>,
    started_at: chrono::DateTime<chrono::Utc>,
) {
    let mut last_status = Instant::now() - STATUS_MAX_INTERVAL;
    let mut hostname_cache = HostnameCache::new();
    let mut last_epoch = transport.connection_epoch();
    let mut pending_send: Option<ControlRecord> = None;
    let mut pending_recv: Option<Message> = None;
    let mut had_transport_error = false;

    while !stop.load(Ordering::Relaxed) {
        let mut activity = false;

        transport.heartbeat();

        // Reconnect detection: if the epoch advanced, the transport already
        // replayed subscriptions for us (see `BrokerTransport::ensure_connected`);
        // nothing further is required here beyond noting it for logging.
        let epoch = transport.connection_epoch();
        if epoch != last_epoch {
            tracing::info!(epoch, "transport reconnected, subscriptions replayed");
            last_epoch = epoch;
        }

        // Phase 1: send, up to SEND_MAX_PER_PASS.
        for _ in 0..SEND_MAX_PER_PASS {
            let record = match pending_send.take() {
                Some(r) => r,
                None => match send_queue.pop(Duration::ZERO) {
                    Some(r) => r,
                    None => break,
                },
            };
            let result = match &record {
                ControlRecord::Publish(msg) => transport.publish(msg.topic(), msg.payload()),
                ControlRecord::Subscribe(topic) => transport.subscribe(topic),
                ControlRecord::Unsubscribe(topic) => transport.unsubscribe(topic),
                ControlRecord::SetIdentifier(identity) => {
                    transport.set_identity(identity);
                    Ok(())
                }
            };
            match result {
                Ok(()) => {
                    if let ControlRecord::Publish(msg) = &record {
                        send_meter.add(msg.size());
                    }
                    activity = true;
                }
                Err(e) => {
                    errors.set(e.to_string());
                    pending_send = Some(record);
                    break;
                }
            }
        }

        // Phase 2: status.
        let elapsed_since_status = last_status.elapsed();
        let should_emit_status = (!activity && elapsed_since_status >= STATUS_IDLE_INTERVAL)
            || elapsed_since_status >= STATUS_MAX_INTERVAL;
        if should_emit_status {
            hostname_cache.refresh_if_stale();
            let status = build_status_message(
                &client_address.lock().unwrap(),
                &hostname_cache,
                transport.version(),
                &send_queue,
                &recv_queue,
                &send_meter,
                &recv_meter,
                started_at,
            );
            if let Err(e) = transport.publish(status.topic(), status.payload()) {
                errors.set(format!("status publish failed: {e}"));
            }
            last_status = Instant::now();
        }

        // Phase 3: receive, up to RECEIVE_MAX_PER_PASS.
        for _ in 0..RECEIVE_MAX_PER_PASS {
            let msg = match pending_recv.take() {
                Some(m) => m,
                None => match transport.receive() {
                    Some(m) => m,
                    None => break,
                },
            };
            recv_meter.add(msg.size());
            activity = true;
            if !recv_queue.push(msg.clone()) {
                errors.set("receive queue full: message held for retry".to_string());
                pending_recv = Some(msg);
                break;
            }
        }

        // Phase 4: drain.
        *client_address.lock().unwrap() = transport.client_address();
        let drained = transport.take_errors();
        if drained.is_empty() {
            if had_transport_error {
                errors.set("transport recovered, now ok".to_string());
                had_transport_error = false;
            }
        } else {
            activity = true;
            had_transport_error = true;
            for err in drained {
                errors.set(err);
            }
        }

        if !activity {
            transport.wait(IDLE_WAIT_TIMEOUT);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_status_message(
    client_address: &str,
    hostname_cache: &HostnameCache,
    version: &str,
    send_queue: &BoundedQueue<ControlRecord>,
    recv_queue: &BoundedQueue<Message>,
    send_meter: &ThroughputMeter,
    recv_meter: &ThroughputMeter,
    started_at: chrono::DateTime<chrono::Utc>,
) -> Message {
    let (send_items, send_bytes) = send_queue.size();
    let (recv_items, recv_bytes) = recv_queue.size();
    let (sent_items_per_sec, sent_bytes_per_sec) = send_meter.rate();
    let (recv_items_per_sec, recv_bytes_per_sec) = recv_meter.rate();
    let working_dir = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    AttributeMessage::new(STATUS_TOPIC)
        .with_attribute("client_address", client_address)
        .with_attribute("hostname", &hostname_cache.hostname)
        .with_attribute("username", &hostname_cache.username)
        .with_attribute("postoffice_version", version)
        .with_attribute("recv_buf_item_count", recv_items.to_string())
        .with_attribute("recv_buf_byte_count", recv_bytes.to_string())
        .with_attribute("send_buf_item_count", send_items.to_string())
        .with_attribute("send_buf_byte_count", send_bytes.to_string())
        .with_attribute("recv_items_per_sec", format!("{recv_items_per_sec:.2}"))
        .with_attribute("recv_bytes_per_sec", format!("{recv_bytes_per_sec:.2}"))
        .with_attribute("sent_items_per_sec", format!("{sent_items_per_sec:.2}"))
        .with_attribute("sent_bytes_per_sec", format!("{sent_bytes_per_sec:.2}"))
        .with_attribute("time_current_utc", chrono::Utc::now().to_rfc3339())
        .with_attribute("time_started_utc", started_at.to_rfc3339())
        .with_attribute("working_dir", working_dir)
        .encode()
}
