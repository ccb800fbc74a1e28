//! In-process sync channel
//!
//! Published events go through one crossbeam queue to a dedicated dispatcher
//! thread, so delivery is FIFO across every channel name and handlers never run
//! on the publisher's thread. Handlers run one at a time.
//!
//! A handler that returns an error or panics only loses the current message;
//! it stays registered.

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use decibender_core::domain::channel::{self, ChannelError, Handler, Subscription, SyncChannel};
use decibender_core::domain::Event;
use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info, trace, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One registered handler
struct Entry {
    id: u64,
    active: Arc<AtomicBool>,
    /// Held for the duration of each invocation
    gate: Arc<Mutex<()>>,
    handler: Arc<Handler>,
}

enum Envelope {
    Deliver(Event),
    Flush(Sender<()>),
    Stop,
}

struct Shared {
    registry: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
    dispatcher: OnceLock<ThreadId>,
}

impl Shared {
    fn on_dispatcher(&self) -> bool {
        self.dispatcher.get() == Some(&thread::current().id())
    }

    fn deliver(&self, event: &Event) {
        let entries: Vec<_> = lock(&self.registry)
            .get(&event.name)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| {
                        (
                            Arc::clone(&entry.active),
                            Arc::clone(&entry.gate),
                            Arc::clone(&entry.handler),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        if entries.is_empty() {
            trace!(channel = %event.name, "No subscribers");
            return;
        }

        for (active, gate, handler) in entries {
            let _invocation = lock(&gate);
            if !active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(channel = %event.name, "Handler failed, message dropped: {}", err);
                }
                Err(_) => {
                    error!(channel = %event.name, "Handler panicked, message dropped");
                }
            }
        }
    }

    fn release(&self, name: &str, id: u64, active: &AtomicBool, gate: &Mutex<()>) {
        active.store(false, Ordering::Release);
        if let Some(entries) = lock(&self.registry).get_mut(name) {
            entries.retain(|entry| entry.id != id);
        }
        // Wait out an invocation in flight on the dispatcher. From inside a
        // handler the only invocation in flight is the caller's own.
        if !self.on_dispatcher() {
            drop(lock(gate));
        }
        debug!(channel = name, id, "Handler unsubscribed");
    }
}

/// In-process [`SyncChannel`] backed by a dispatcher thread
pub struct LocalBus {
    shared: Arc<Shared>,
    queue: Sender<Envelope>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBus {
    /// Start the bus and its dispatcher thread
    pub fn new() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dispatcher: OnceLock::new(),
        });
        let (queue, inbox) = unbounded();

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("decibender-bus".to_string())
            .spawn(move || dispatch_loop(worker_shared, inbox))?;
        let _ = shared.dispatcher.set(worker.thread().id());

        info!("Local bus started");
        Ok(Self {
            shared,
            queue,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Block until every event published before this call has been delivered
    ///
    /// Returns immediately when called from a handler or after shutdown.
    pub fn flush(&self) {
        if self.shared.on_dispatcher() {
            warn!("flush called from a handler, skipping");
            return;
        }
        let (done_tx, done_rx) = bounded(1);
        if self.queue.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Deliver what is already queued, then stop the dispatcher
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.queue.send(Envelope::Stop);
        if self.shared.on_dispatcher() {
            return;
        }
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                error!("Bus dispatcher thread panicked");
            }
        }
        info!("Local bus stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of active handlers for `name`
    pub fn subscriber_count(&self, name: &str) -> usize {
        lock(&self.shared.registry).get(name).map_or(0, Vec::len)
    }
}

impl SyncChannel for LocalBus {
    fn publish(&self, event: Event) -> channel::Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        trace!(channel = %event.name, "Publishing");
        self.queue
            .send(Envelope::Deliver(event))
            .map_err(|_| ChannelError::Closed)
    }

    fn subscribe(&self, name: &str, handler: Handler) -> channel::Result<Subscription> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let gate = Arc::new(Mutex::new(()));
        lock(&self.shared.registry)
            .entry(name.to_string())
            .or_default()
            .push(Entry {
                id,
                active: Arc::clone(&active),
                gate: Arc::clone(&gate),
                handler: Arc::new(handler),
            });
        debug!(channel = name, id, "Handler subscribed");

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let key = name.to_string();
        Ok(Subscription::new(name, move || match shared.upgrade() {
            Some(shared) => shared.release(&key, id, &active, &gate),
            None => active.store(false, Ordering::Release),
        }))
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(shared: Arc<Shared>, inbox: Receiver<Envelope>) {
    for envelope in inbox.iter() {
        match envelope {
            Envelope::Deliver(event) => shared.deliver(&event),
            Envelope::Flush(done) => {
                let _ = done.send(());
            }
            Envelope::Stop => break,
        }
    }
    debug!("Bus dispatcher finished");
}
