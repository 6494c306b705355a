//! Background workers: one poll loop per stage, plus fixed-interval tickers
//! for sweeps and the archival orchestrator.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use annoflow_events::{decode, Delivery, DeliveryQueue, ReceiveOptions};

use crate::stages::{DeliveryContext, Disposition, StageProcessor};

/// Pause after a failed receive before polling again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A stage worker notices the request after its current receive returns,
    /// so this can take up to the configured long-poll wait.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

fn spawn_thread<F>(name: &str, body: F) -> std::io::Result<WorkerHandle>
where
    F: FnOnce(mpsc::Receiver<()>) + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(shutdown_rx))?;
    Ok(WorkerHandle {
        name: name.to_string(),
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

fn stop_requested(shutdown_rx: &mpsc::Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty))
}

/// Queue poll loop for one stage.
///
/// - Long-polls the stage's queue
/// - Decodes each message against the stage's topic
/// - Deletes or retains it according to the processing outcome
#[derive(Debug)]
pub struct StageWorker;

impl StageWorker {
    pub fn spawn(
        queue: Arc<dyn DeliveryQueue>,
        processor: Arc<dyn StageProcessor>,
        options: ReceiveOptions,
    ) -> std::io::Result<WorkerHandle> {
        let name = format!("stage-{}", processor.name());
        spawn_thread(&name, move |shutdown_rx| {
            info!(stage = processor.name(), queue = queue.name(), "stage worker started");
            loop {
                if stop_requested(&shutdown_rx) {
                    break;
                }
                if let Err(e) = drain_once(queue.as_ref(), processor.as_ref(), options) {
                    warn!(stage = processor.name(), queue = queue.name(), error = %e, "receive failed");
                    if !matches!(
                        shutdown_rx.recv_timeout(RECEIVE_BACKOFF),
                        Err(mpsc::RecvTimeoutError::Timeout)
                    ) {
                        break;
                    }
                }
            }
            info!(stage = processor.name(), "stage worker stopped");
        })
    }
}

/// Receive one batch and process every message in it. Returns how many
/// messages were received.
pub fn drain_once(
    queue: &dyn DeliveryQueue,
    processor: &dyn StageProcessor,
    options: ReceiveOptions,
) -> Result<usize, annoflow_events::QueueError> {
    let batch = queue.receive(options)?;
    for delivery in &batch {
        process_delivery(queue, processor, delivery);
    }
    Ok(batch.len())
}

/// Process one message and settle it: delete on success or unrecoverable
/// failure, leave it for redelivery otherwise.
pub fn process_delivery(queue: &dyn DeliveryQueue, processor: &dyn StageProcessor, delivery: &Delivery) -> Disposition {
    let stage = processor.name();
    let disposition = match decode(processor.topic(), &delivery.body) {
        Ok(event) => {
            let ctx = DeliveryContext::new(queue, &delivery.token, delivery.receive_count);
            match processor.process(event, ctx) {
                Ok(()) => Disposition::Delete,
                Err(e) => {
                    e.log(stage, &delivery.message_id);
                    e.disposition()
                }
            }
        }
        Err(e) => {
            warn!(stage, message_id = %delivery.message_id, error = %e, "undecodable message dropped");
            Disposition::Delete
        }
    };

    if disposition == Disposition::Delete {
        if let Err(e) = queue.delete(&delivery.token) {
            // The message comes back after its visibility timeout; stages
            // tolerate the repeat.
            warn!(stage, message_id = %delivery.message_id, error = %e, "failed to delete message");
        }
    } else {
        debug!(stage, message_id = %delivery.message_id, receive_count = delivery.receive_count, "message retained");
    }
    disposition
}

/// Runs a closure at a fixed interval until shut down.
#[derive(Debug)]
pub struct IntervalWorker;

impl IntervalWorker {
    pub fn spawn<F>(name: &str, every: Duration, mut tick: F) -> std::io::Result<WorkerHandle>
    where
        F: FnMut() + Send + 'static,
    {
        let worker = name.to_string();
        spawn_thread(name, move |shutdown_rx| {
            debug!(worker = %worker, interval_ms = every.as_millis() as u64, "interval worker started");
            loop {
                match shutdown_rx.recv_timeout(every) {
                    Err(mpsc::RecvTimeoutError::Timeout) => tick(),
                    _ => break,
                }
            }
            debug!(worker = %worker, "interval worker stopped");
        })
    }
}
