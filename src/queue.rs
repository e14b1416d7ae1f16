//! Bounded cross-thread request queues
//!
//! Work targeting the NAT thread or the receive thread is parked as a
//! boxed call on a bounded FIFO channel and executed by that queue's
//! single consumer. Producers on any thread either fire and forget
//! (`post`) or block until the consumer ran the request
//! (`call_and_wait`, which pokes the wakeup itself when the consumer is
//! not draining promptly). A `post` must be followed by a poke of the
//! wakeup channel or the consumer may sleep until its next timeout.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Queue depth per consumer.
const QUEUE_CAPACITY: usize = 512;

/// The queue is full and the request was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

struct Request<C> {
    work: Box<dyn FnOnce(&mut C) + Send>,
    /// Present for awaitable requests; signaled after the work ran.
    done: Option<Sender<()>>,
}

/// Multi-producer, single-consumer deferred-call queue.
///
/// `C` is the context handed to each request by the consumer thread,
/// e.g. the engine for NAT-thread work.
pub struct RequestQueue<C> {
    tx: Sender<Request<C>>,
    rx: Receiver<Request<C>>,
}

impl<C> RequestQueue<C> {
    pub fn new() -> Self {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        Self { tx, rx }
    }

    /// Enqueues a fire-and-forget request. Never blocks.
    ///
    /// When the queue cannot accept the request it is dropped (together
    /// with everything it captured) and [`QueueFull`] is returned.
    pub fn post<F>(&self, work: F) -> Result<(), QueueFull>
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.tx
            .try_send(Request {
                work: Box::new(work),
                done: None,
            })
            .map_err(|_| QueueFull)
    }

    /// Enqueues a request and blocks until the consumer completed it.
    ///
    /// A request the consumer dispatches immediately completes without
    /// further ado. When the enqueue reports that the consumer is not
    /// draining promptly, `wakeup` is invoked to steer a sleeping
    /// consumer out of its wait and the caller blocks indefinitely.
    pub fn call_and_wait<F, W>(&self, work: F, wakeup: W)
    where
        F: FnOnce(&mut C) + Send + 'static,
        W: FnOnce(),
    {
        let (done_tx, done_rx) = bounded(1);
        let request = Request {
            work: Box::new(work),
            done: Some(done_tx),
        };
        if let Err(err) = self.tx.try_send(request) {
            // The queue is backed up; the consumer is clearly behind.
            let request = match err {
                TrySendError::Full(r) | TrySendError::Disconnected(r) => r,
            };
            if self.tx.send(request).is_err() {
                return;
            }
        } else if done_rx.try_recv().is_ok() {
            // Dispatched on the spot; no need to wake anyone.
            return;
        }
        wakeup();
        let _ = done_rx.recv();
    }

    /// Runs every queued request to completion without blocking.
    ///
    /// Only the queue's consumer thread calls this.
    pub fn process_all(&self, ctx: &mut C) {
        while let Ok(request) = self.rx.try_recv() {
            (request.work)(ctx);
            if let Some(done) = request.done {
                let _ = done.send(());
            }
        }
    }

    /// Number of requests waiting to be processed.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl<C> Default for RequestQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}
