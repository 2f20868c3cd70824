//! `postal` — a topic-based publish/subscribe client library with an
//! embedded broker.
//!
//! The entry point is [`create_post_office`], which returns a [`PostOffice`]
//! handle wired according to [`PostalConfig`]. When `config.buffered` is
//! `true` (the default) the handle is backed by [`engine::BufferedPostOffice`]
//! — a dedicated worker thread, two bounded queues, and reconnect/resubscribe
//! handling. When `false`, the handle talks to the transport directly with
//! no buffering or background thread at all.
//!
//! Grounded on `examples/original_source/messaging/claim/PostOffice.cpp`'s
//! `CreatePostOffice` factory, which makes the identical buffered-vs-direct
//! choice based on `PostOfficeInitializer::IsBuffered()`.

pub mod bounded_queue;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod error_journal;
pub mod message;
pub mod throughput;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

pub use broker::{Broker, BrokerHandle};
pub use config::PostalConfig;
pub use engine::BufferedPostOffice;
pub use error::PostalError;
pub use error_journal::ErrorJournal;
pub use message::{AttributeMessage, Message};
pub use transport::Transport;

use broker::client::BrokerTransport;

enum Inner {
    Buffered(BufferedPostOffice),
    Direct(Arc<dyn Transport>),
}

/// The application-facing pub/sub handle returned by [`create_post_office`].
///
/// Mirrors `claim::PostOffice`'s role as a thin wrapper: when buffered, every
/// call delegates to the [`BufferedPostOffice`] engine; when unbuffered,
/// calls go straight to the transport and `receive`/`close` degrade to the
/// transport's own blocking/no-op semantics.
pub struct PostOffice {
    inner: Inner,
}

impl PostOffice {
    pub fn subscribe(&self, topic: &str) {
        match &self.inner {
            Inner::Buffered(engine) => engine.subscribe(topic),
            Inner::Direct(transport) => {
                if let Err(e) = transport.subscribe(topic) {
                    tracing::warn!(error = %e, topic, "unbuffered subscribe failed");
                }
            }
        }
    }

    pub fn unsubscribe(&self, topic: &str) {
        match &self.inner {
            Inner::Buffered(engine) => engine.unsubscribe(topic),
            Inner::Direct(transport) => {
                if let Err(e) = transport.unsubscribe(topic) {
                    tracing::warn!(error = %e, topic, "unbuffered unsubscribe failed");
                }
            }
        }
    }

    pub fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        match &self.inner {
            Inner::Buffered(engine) => engine.publish(topic, payload),
            Inner::Direct(transport) => match Message::new(topic, payload.to_vec()) {
                Ok(msg) => transport.publish(msg.topic(), msg.payload()).is_ok(),
                Err(_) => false,
            },
        }
    }

    /// Waits up to `max_wait` for the next message.
    pub fn receive(&self, max_wait: Duration) -> Option<Message> {
        match &self.inner {
            Inner::Buffered(engine) => engine.receive(max_wait),
            Inner::Direct(transport) => {
                if let Some(msg) = transport.receive() {
                    return Some(msg);
                }
                if transport.wait(max_wait) {
                    transport.receive()
                } else {
                    None
                }
            }
        }
    }

    pub fn error(&self) -> String {
        match &self.inner {
            Inner::Buffered(engine) => engine.error(),
            Inner::Direct(_) => String::new(),
        }
    }

    pub fn client_address(&self) -> String {
        match &self.inner {
            Inner::Buffered(engine) => engine.client_address(),
            Inner::Direct(transport) => transport.client_address(),
        }
    }

    pub fn version(&self) -> &str {
        match &self.inner {
            Inner::Buffered(engine) => engine.version(),
            Inner::Direct(transport) => transport.version(),
        }
    }

    pub fn close(&mut self) {
        if let Inner::Buffered(engine) = &mut self.inner {
            engine.close();
        }
    }
}

/// Builds a [`PostOffice`] against the embedded broker transport, honoring
/// `config.buffered` to decide whether the engine's worker thread and
/// bounded queues sit in front of it.
pub fn create_post_office(config: PostalConfig, client_identifier: &str) -> PostOffice {
    let transport: Arc<dyn Transport> = Arc::new(BrokerTransport::new(
        config.effective_host().to_string(),
        config.server_port,
        client_identifier,
    ));

    if config.buffered {
        let engine = BufferedPostOffice::new(
            transport,
            config.send_buffer_max_items,
            config.send_buffer_max_bytes(),
            config.receive_buffer_max_items,
            config.receive_buffer_max_bytes(),
        );
        PostOffice {
            inner: Inner::Buffered(engine),
        }
    } else {
        PostOffice {
            inner: Inner::Direct(transport),
        }
    }
}
