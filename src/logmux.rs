//! Log multiplexing and fan-out.
//!
//! Every child's output lines become `LogMessage`s pushed onto one
//! process-wide channel. A broadcast task drains that channel, writes the
//! padded console form to the configured sink, and attempts a non-blocking
//! send to every subscriber. Slow subscribers lose messages; they never block
//! a producer.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the central log channel and of each subscriber buffer.
pub const LOG_FORWARDER_BUFFER_SIZE: usize = 102_400;

/// One line of process output, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(rename = "paddedName")]
    pub padded_name: String,
    pub name: String,
    pub line: String,
}

type SubscriberList = Arc<RwLock<Vec<(u64, mpsc::Sender<LogMessage>)>>>;

/// Console writer the multiplexer prints through. Swappable so an output
/// filter can wrap standard output before the engine starts emitting.
pub type ConsoleSink = Box<dyn Write + Send>;

pub struct LogMux {
    tx: mpsc::Sender<LogMessage>,
    rx: Mutex<Option<mpsc::Receiver<LogMessage>>>,
    subscribers: SubscriberList,
    next_id: AtomicU64,
    sink: Mutex<ConsoleSink>,
    pad_width: usize,
}

impl LogMux {
    pub fn new(pad_width: usize, sink: ConsoleSink) -> Self {
        let (tx, rx) = mpsc::channel(LOG_FORWARDER_BUFFER_SIZE);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            subscribers: Arc::default(),
            next_id: AtomicU64::new(0),
            sink: Mutex::new(sink),
            pad_width,
        }
    }

    /// Publishes one line under the given instance name: writes the padded
    /// console form and enqueues the message for subscriber fan-out.
    pub async fn publish(&self, name: &str, line: &str) {
        let padded_name = format!("{name:<width$}", width = self.pad_width);
        {
            let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = writeln!(sink, "{padded_name}: {line}");
        }
        let _ = self
            .tx
            .send(LogMessage {
                padded_name,
                name: name.to_string(),
                line: line.to_string(),
            })
            .await;
    }

    /// Registers a new subscriber. Dropping the subscription removes it.
    pub fn subscribe(&self) -> LogSubscription {
        let (tx, rx) = mpsc::channel(LOG_FORWARDER_BUFFER_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        LogSubscription {
            id,
            rx,
            subscribers: self.subscribers.clone(),
        }
    }

    /// Drains the central channel, fanning messages out to subscribers.
    /// Runs until the root token is cancelled.
    pub async fn run_broadcast(&self, root: CancellationToken) {
        let Some(mut rx) = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        loop {
            let msg = tokio::select! {
                _ = root.cancelled() => return,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
            };
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (_, subscriber) in subscribers.iter() {
                let _ = subscriber.try_send(msg.clone());
            }
        }
    }
}

/// Handle to a registered log subscriber.
pub struct LogSubscription {
    id: u64,
    rx: mpsc::Receiver<LogMessage>,
    subscribers: SubscriberList,
}

impl LogSubscription {
    pub async fn recv(&mut self) -> Option<LogMessage> {
        self.rx.recv().await
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(id, _)| *id != self.id);
    }
}
