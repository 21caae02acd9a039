//! Fire-and-forget delivery of assembled events.
//!
//! The serving path only ever calls [`AsyncPublisher::publish`], which cannot
//! fail. In background mode events go through a bounded queue drained by a
//! single worker task; in inline mode the sink is awaited directly.
//!
//! [`AsyncPublisher::publish_detached`] is the synchronous counterpart for
//! callers that cannot await, such as a response body that just ended.

use crate::config::Delivery;
use crate::error::PublishError;
use crate::event::TelemetryEvent;
use crate::sink::EventSink;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Delivers events to an [`EventSink`] without blocking or failing the
/// request that produced them.
pub struct AsyncPublisher {
    target: Option<Target>,
    debug: bool,
}

struct Target {
    topic: String,
    sink: Arc<dyn EventSink>,
    mode: Mode,
}

enum Mode {
    Inline,
    Background {
        tx: Mutex<Option<mpsc::Sender<TelemetryEvent>>>,
        worker: Mutex<Option<JoinHandle<()>>>,
    },
}

impl AsyncPublisher {
    /// A publisher with no sink. Every event is discarded.
    pub fn disabled(debug: bool) -> Self {
        Self {
            target: None,
            debug,
        }
    }

    /// Create a publisher for `topic`.
    ///
    /// Background delivery needs a Tokio runtime; without one the publisher
    /// falls back to inline delivery.
    pub fn new(
        sink: Arc<dyn EventSink>,
        topic: impl Into<String>,
        delivery: Delivery,
        debug: bool,
    ) -> Self {
        let topic = topic.into();
        let mode = match delivery {
            Delivery::Inline => Mode::Inline,
            Delivery::Background { capacity } => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let (tx, rx) = mpsc::channel(capacity.max(1));
                    let worker =
                        handle.spawn(run_worker(rx, sink.clone(), topic.clone(), debug));
                    Mode::Background {
                        tx: Mutex::new(Some(tx)),
                        worker: Mutex::new(Some(worker)),
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        "APIToolkit: no Tokio runtime available, publishing events inline"
                    );
                    Mode::Inline
                }
            },
        };

        Self {
            target: Some(Target { topic, sink, mode }),
            debug,
        }
    }

    /// Whether events are actually delivered anywhere.
    pub fn is_ready(&self) -> bool {
        self.target.is_some()
    }

    /// The topic events are published to, if any.
    pub fn topic(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.topic.as_str())
    }

    /// Hand an event off for delivery. Failures are logged, never returned.
    pub async fn publish(&self, event: TelemetryEvent) {
        if let Err(e) = self.try_publish(event).await {
            tracing::warn!(error = %e, "APIToolkit: failed to publish event");
        }
    }

    /// Hand an event off for delivery.
    ///
    /// In background mode success means the event was queued. A disabled
    /// publisher accepts and discards everything.
    pub async fn try_publish(&self, event: TelemetryEvent) -> Result<(), PublishError> {
        let Some(target) = &self.target else {
            if self.debug {
                tracing::debug!(
                    "APIToolkit: No topic or publisher (restart your server to fix)"
                );
            }
            return Ok(());
        };

        match &target.mode {
            Mode::Inline => {
                deliver(target.sink.as_ref(), &target.topic, &event, self.debug).await?;
                Ok(())
            }
            Mode::Background { tx, .. } => enqueue(tx, event),
        }
    }

    /// Hand an event off without awaiting anything.
    ///
    /// Background mode queues it as usual. Inline mode spawns the publish on
    /// the current Tokio runtime, or drops the event when there is none.
    pub fn publish_detached(&self, event: TelemetryEvent) {
        let Some(target) = &self.target else {
            if self.debug {
                tracing::debug!(
                    "APIToolkit: No topic or publisher (restart your server to fix)"
                );
            }
            return;
        };

        let result = match &target.mode {
            Mode::Background { tx, .. } => enqueue(tx, event),
            Mode::Inline => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let sink = target.sink.clone();
                    let topic = target.topic.clone();
                    let debug = self.debug;
                    handle.spawn(async move {
                        if let Err(e) = deliver(sink.as_ref(), &topic, &event, debug).await {
                            tracing::warn!(error = %e, "APIToolkit: failed to publish event");
                        }
                    });
                    Ok(())
                }
                Err(_) => Err(PublishError::Closed),
            },
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, "APIToolkit: failed to publish event");
        }
    }

    /// Stop accepting events and wait until everything already queued has
    /// been delivered. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let Some(Target {
            mode: Mode::Background { tx, worker },
            ..
        }) = &self.target
        else {
            return;
        };

        drop(tx.lock().unwrap_or_else(|p| p.into_inner()).take());
        let handle = worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "APIToolkit: publish worker failed");
            }
        }
    }
}

impl std::fmt::Debug for AsyncPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.target.as_ref().map(|t| &t.mode) {
            None => "disabled",
            Some(Mode::Inline) => "inline",
            Some(Mode::Background { .. }) => "background",
        };
        f.debug_struct("AsyncPublisher")
            .field("topic", &self.topic())
            .field("mode", &mode)
            .field("debug", &self.debug)
            .finish()
    }
}

fn enqueue(
    tx: &Mutex<Option<mpsc::Sender<TelemetryEvent>>>,
    event: TelemetryEvent,
) -> Result<(), PublishError> {
    let guard = tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let Some(tx) = guard.as_ref() else {
        return Err(PublishError::Closed);
    };
    tx.try_send(event).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => PublishError::QueueFull,
        mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
    })
}

async fn run_worker(
    mut rx: mpsc::Receiver<TelemetryEvent>,
    sink: Arc<dyn EventSink>,
    topic: String,
    debug: bool,
) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = deliver(sink.as_ref(), &topic, &event, debug).await {
            tracing::warn!(error = %e, topic = %topic, "APIToolkit: failed to publish event");
        }
    }
    tracing::debug!(topic = %topic, "APIToolkit: publish worker stopped");
}

/// Serialize and publish one event.
async fn deliver(
    sink: &dyn EventSink,
    topic: &str,
    event: &TelemetryEvent,
    debug: bool,
) -> Result<String, PublishError> {
    let data = serde_json::to_vec(event)?;

    if debug {
        match serde_json::to_string_pretty(event) {
            Ok(pretty) => tracing::info!(topic = %topic, "APIToolkit: publishing event\n{}", pretty),
            Err(e) => tracing::debug!(error = %e, "APIToolkit: could not pretty-print event"),
        }
    }

    let id = sink.publish(topic, data).await?;
    if debug {
        tracing::info!(message_id = %id, "APIToolkit: event published");
    }
    Ok(id)
}
