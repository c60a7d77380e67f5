//! Event queue between running jobs and the [`MetricSink`].
//!
//! Producers hold a cloneable [`MetricEmitter`]; a single [`MetricWriter`]
//! task applies commands in arrival order. The queue is bounded and `send`
//! waits when it is full, so a slow writer slows producers down instead of
//! growing memory. Order is kept per producer only.
//!
//! `reset` and `flush` travel through the same queue and are acknowledged, so
//! once they return every command enqueued before them has been applied.

use super::{MetricEvent, MetricSink, Series};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
enum Command {
    Set(MetricEvent),
    Delete(Series),
    Reset(oneshot::Sender<()>),
    Flush(oneshot::Sender<()>),
}

/// Create a queue of `capacity` commands in front of `sink`.
#[must_use]
pub fn channel(sink: MetricSink, capacity: usize) -> (MetricEmitter, MetricWriter) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MetricEmitter { tx }, MetricWriter { rx, sink })
}

#[derive(Clone, Debug)]
pub struct MetricEmitter {
    tx: mpsc::Sender<Command>,
}

impl MetricEmitter {
    pub async fn emit(&self, event: MetricEvent) {
        self.send(Command::Set(event)).await;
    }

    pub async fn delete(&self, series: Series) {
        self.send(Command::Delete(series)).await;
    }

    /// Purge every family once all earlier commands are applied.
    pub async fn reset(&self) {
        let (ack, done) = oneshot::channel();
        self.send(Command::Reset(ack)).await;
        let _ = done.await;
    }

    /// Wait until every command sent before this call is applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.send(Command::Flush(ack)).await;
        let _ = done.await;
    }

    async fn send(&self, command: Command) {
        if let Err(e) = self.tx.send(command).await {
            debug!(command = ?e.0, "metric writer stopped, dropping command");
        }
    }
}

pub struct MetricWriter {
    rx: mpsc::Receiver<Command>,
    sink: MetricSink,
}

impl MetricWriter {
    /// Apply commands until every emitter is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Set(event) => {
                    trace!(?event, "set");
                    self.sink.set(&event);
                }
                Command::Delete(series) => {
                    if !self.sink.delete(&series) {
                        trace!(?series, "delete of a series that does not exist");
                    }
                }
                Command::Reset(ack) => {
                    self.sink.reset_all();
                    debug!("metric families reset");
                    let _ = ack.send(());
                }
                Command::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        debug!("metric writer stopped");
    }

    /// Spawn [`Self::run`] on the current runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
