//! Per-type event dispatch.
//!
//! Every type gets its own worker pool at startup: negative thread count
//! means one worker per CPU, zero means inline synchronous delivery, a
//! positive count is taken literally, except that a losslessly consumed
//! type is always capped at a single worker, because acknowledgment order
//! must equal commit order.
//!
//! The queue is bounded. When it fills, a normal type logs and drops; a
//! lossless type blocks the submitter (back-pressure up to the channel
//! reader, and from there to the transport).

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::Event;

/// The runtime-supplied event sink; one invocation fully handles one event.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Dispatcher {
    label: String,
    tx: Option<mpsc::Sender<Event>>,
    handler: EventHandler,
    lossless: bool,
}

impl Dispatcher {
    /// Resolve a configured thread count against the lossless cap.
    pub fn worker_count(threads: i32, lossless: bool) -> usize {
        let n = match threads {
            t if t < 0 => std::thread::available_parallelism().map_or(1, usize::from),
            t => t as usize,
        };
        if lossless { 1 } else { n }
    }

    /// Start the pool. `workers == 0` dispatches inline on the submitter.
    pub fn start(
        label: impl Into<String>,
        workers: usize,
        capacity: usize,
        lossless: bool,
        handler: EventHandler,
    ) -> Dispatcher {
        let label = label.into();
        if workers == 0 {
            return Dispatcher { label, tx: None, handler, lossless };
        }
        let (tx, rx) = mpsc::channel::<Event>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..workers {
            let rx = rx.clone();
            let handler = handler.clone();
            let label = label.clone();
            tokio::spawn(async move {
                loop {
                    let event = { rx.lock().await.recv().await };
                    match event {
                        Some(event) => (handler)(event).await,
                        None => {
                            debug!(type_code = %label, worker, "dispatcher worker stopping");
                            break;
                        }
                    }
                }
            });
        }
        Dispatcher { label, tx: Some(tx), handler, lossless }
    }

    /// Hand an event to the pool.
    pub async fn submit(&self, event: Event) {
        match &self.tx {
            None => (self.handler)(event).await,
            Some(tx) => {
                if self.lossless {
                    // Block the submitter rather than lose an event.
                    if tx.send(event).await.is_err() {
                        warn!(type_code = %self.label, "dispatcher gone, event lost");
                    }
                } else if let Err(e) = tx.try_send(event) {
                    warn!(type_code = %self.label, error = %e, "event queue full, dropping");
                }
            }
        }
    }
}
