//! In-process transport used by the unit tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_wire::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{Link, Transport};

/// The server end of one mock connection
pub struct ServerSide {
    pub sent: mpsc::UnboundedReceiver<ClientMessage>,
    pub push: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerSide {
    /// Drain every frame the client has emitted so far
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        let mut frames = vec![];
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// A transport whose connections are channel pairs held by the test
#[derive(Clone, Default)]
pub struct MockTransport {
    servers: Arc<Mutex<Vec<ServerSide>>>,
    failures: Arc<Mutex<VecDeque<TransportError>>>,
    opens: Arc<Mutex<u32>>,
    open_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` open attempts fail
    pub fn fail_next(&self, count: usize) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(TransportError::ConnectFailed("refused".into()));
        }
    }

    /// Make every later open take `delay` before completing
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    /// Take the server side of the most recent connection
    pub fn take_server(&self) -> ServerSide {
        self.servers
            .lock()
            .pop()
            .expect("no connection has been opened")
    }

    /// Number of open attempts, failed ones included
    pub fn open_count(&self) -> u32 {
        *self.opens.lock()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<Link, TransportError> {
        *self.opens.lock() += 1;
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        let (outbound, sent) = mpsc::unbounded_channel();
        let (push, inbound) = mpsc::unbounded_channel();
        self.servers.lock().push(ServerSide { sent, push });
        Ok(Link { outbound, inbound })
    }
}
