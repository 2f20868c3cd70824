//! The abstract [`Transport`] contract the engine depends on.
//!
//! Only one concrete implementation ships in this crate: [`crate::broker::client::BrokerTransport`],
//! talking to the embedded [`crate::broker::Broker`] over TCP. AMQP and
//! Spread-style carriers are named in the data model only (see
//! `SPEC_FULL.md` §4.4) — no networking code for them exists here.

use std::sync::Arc;
use std::time::Duration;

use crate::error::PostalError;
use crate::message::Message;

/// Abstract interface to an underlying pub/sub carrier.
///
/// The engine ([`crate::engine::BufferedPostOffice`]) holds a transport only
/// through this trait object; it never depends on a concrete transport type.
///
/// `wait` must be called only from the registered worker thread. `wake` is
/// the single operation callable from any thread, and must be idempotent and
/// cheap: it interrupts a concurrent `wait` so the caller does not have to
/// poll.
pub trait Transport: Send + Sync {
    /// Hand off one message for publication. May fail (transient transport error).
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PostalError>;

    /// Update server-side filtering to include `topic`.
    fn subscribe(&self, topic: &str) -> Result<(), PostalError>;

    /// Update server-side filtering to exclude `topic`.
    fn unsubscribe(&self, topic: &str) -> Result<(), PostalError>;

    /// Non-blocking: returns `Some(message)` iff one was immediately available.
    fn receive(&self) -> Option<Message>;

    /// Blocks until a `receive` would likely succeed, `wake` fires, or the
    /// timeout elapses. Returns `true` when there may be data ready.
    fn wait(&self, max_wait: Duration) -> bool;

    /// Interrupts a concurrent `wait` from any thread.
    fn wake(&self);

    /// Sets the client identity announced to the transport (e.g. re-sent on
    /// reconnect as part of `Register`).
    fn set_identity(&self, identity: &str);

    /// Best-effort, snapshot-safe description of this client's address as
    /// seen by the transport (e.g. `"worker#2"` for the embedded broker).
    fn client_address(&self) -> String;

    /// A short transport implementation version string.
    fn version(&self) -> &str;

    /// Drains any transport-level errors accumulated since the last call
    /// (connect failures, publish/consume exceptions). The engine folds
    /// these into its [`crate::error_journal::ErrorJournal`] every pass.
    /// Default: no transport-level errors (e.g. a transport with no
    /// separate internal error channel).
    fn take_errors(&self) -> Vec<String> {
        Vec::new()
    }

    /// Increments once per successful (re)connection. The engine compares
    /// this against the value it last observed to detect "we just
    /// reconnected" and replay the full subscription set before resuming
    /// ordinary sends. Default: `0` forever (a transport that never
    /// disconnects has nothing to replay).
    fn connection_epoch(&self) -> u64 {
        0
    }

    /// Called once per worker pass regardless of activity, so
    /// transport-internal periodic work (e.g. heartbeat frames) happens on a
    /// steady cadence even when the send/receive phases stay busy and the
    /// worker never reaches the idle `wait`. Default: no periodic work.
    fn heartbeat(&self) {}
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PostalError> {
        (**self).publish(topic, payload)
    }

    fn subscribe(&self, topic: &str) -> Result<(), PostalError> {
        (**self).subscribe(topic)
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), PostalError> {
        (**self).unsubscribe(topic)
    }

    fn receive(&self) -> Option<Message> {
        (**self).receive()
    }

    fn wait(&self, max_wait: Duration) -> bool {
        (**self).wait(max_wait)
    }

    fn wake(&self) {
        (**self).wake()
    }

    fn set_identity(&self, identity: &str) {
        (**self).set_identity(identity)
    }

    fn client_address(&self) -> String {
        (**self).client_address()
    }

    fn version(&self) -> &str {
        (**self).version()
    }

    fn take_errors(&self) -> Vec<String> {
        (**self).take_errors()
    }

    fn connection_epoch(&self) -> u64 {
        (**self).connection_epoch()
    }

    fn heartbeat(&self) {
        (**self).heartbeat()
    }
}
