//! Stage contract for plugging the capture into a larger pipeline.
//!
//! Stages are connected by bounded flume channels. A producer never blocks
//! for long on a slow consumer: after a few timed attempts it discards the
//! oldest queued item so the newest one fits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flume::{Receiver, SendTimeoutError, Sender, TrySendError};
use metrics::counter;
use tracing::{debug, warn};

use crate::error::Result;
use crate::PipelineConfig;

/// A stage with no inputs that yields items on demand.
pub trait Producer {
    type Output;

    /// Run one step. A step may finish without producing anything.
    fn produce(&mut self) -> Result<Option<Self::Output>>;
}

/// A stage that takes items and yields nothing downstream.
pub trait Consumer {
    type Input;

    fn consume(&mut self, item: Self::Input);
}

/// Outcome of handing one item downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    Sent,
    /// Sent after discarding the oldest queued item.
    DroppedOldest,
    /// Every connected consumer is gone.
    Disconnected,
}

struct Edge<T> {
    tx: Sender<T>,
    // Kept so the producer can evict from its own end.
    rx: Receiver<T>,
}

/// Fan-out of a producer to its connected consumers, round-robin.
pub struct Outlet<T> {
    edges: Vec<Edge<T>>,
    next: usize,
    timeout: Duration,
    retries: u32,
    capacity: usize,
}

impl<T> Outlet<T> {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            edges: Vec::new(),
            next: 0,
            timeout: Duration::from_millis(config.handoff_timeout_ms),
            retries: config.handoff_retries.max(1),
            capacity: config.queue_size.max(1),
        }
    }

    /// Add a downstream edge and return its receiving end.
    pub fn connect(&mut self) -> Receiver<T> {
        let (tx, rx) = flume::bounded(self.capacity);
        self.edges.push(Edge {
            tx,
            rx: rx.clone(),
        });
        rx
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Hand `item` to the next consumer in turn. Edges whose consumer has
    /// gone are dropped along the way.
    pub fn emit(&mut self, item: T) -> Emission {
        loop {
            if self.edges.is_empty() {
                return Emission::Disconnected;
            }
            let idx = self.next % self.edges.len();
            // Our own eviction handle is always one of the receivers.
            if self.edges[idx].tx.receiver_count() <= 1 {
                debug!(edge = idx, "Consumer gone, removing edge");
                self.edges.remove(idx);
                continue;
            }
            self.next = (idx + 1) % self.edges.len();
            return self.send(idx, item);
        }
    }

    fn send(&self, idx: usize, mut item: T) -> Emission {
        let edge = &self.edges[idx];
        for _ in 0..self.retries {
            match edge.tx.send_timeout(item, self.timeout) {
                Ok(()) => {
                    counter!("frames_emitted").increment(1);
                    return Emission::Sent;
                }
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(_)) => return Emission::Disconnected,
            }
        }

        // Consumer is behind. Make room rather than stall the hardware.
        let mut dropped = false;
        loop {
            match edge.tx.try_send(item) {
                Ok(()) => {
                    counter!("frames_emitted").increment(1);
                    return if dropped {
                        Emission::DroppedOldest
                    } else {
                        Emission::Sent
                    };
                }
                Err(TrySendError::Full(back)) => item = back,
                Err(TrySendError::Disconnected(_)) => return Emission::Disconnected,
            }
            if edge.rx.try_recv().is_ok() {
                dropped = true;
                counter!("frames_dropped").increment(1);
                debug!(edge = idx, "Dropped oldest queued item");
            }
        }
    }
}

/// Drive `producer` until `running` is cleared or an error occurs. The flag
/// is checked once per step; a step in progress always completes.
pub fn run_producer<P>(producer: &mut P, outlet: &mut Outlet<P::Output>, running: &AtomicBool) -> Result<()>
where
    P: Producer,
{
    while running.load(Ordering::Relaxed) {
        if let Some(item) = producer.produce()? {
            if outlet.emit(item) == Emission::Disconnected {
                warn!("All consumers disconnected, stopping producer");
                break;
            }
        }
    }
    Ok(())
}

/// Feed `consumer` from `rx` until `running` is cleared or the channel closes.
pub fn run_consumer<C>(consumer: &mut C, rx: &Receiver<C::Input>, running: &AtomicBool)
where
    C: Consumer,
{
    while running.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(item) => consumer.consume(item),
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
}
