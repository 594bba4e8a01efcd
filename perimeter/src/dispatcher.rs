//! Event scheduling: the bounded priority queue, the worker pool driving
//! events through matched handlers, and the termination detector.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::event::Event;
use crate::registry::{HandlerError, RegisteredHandler, Registry};
use crate::session::Session;

const QUIESCENCE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    backpressure_waits: AtomicU64,
}

impl QueueStats {
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    pub fn backpressure_waits(&self) -> u64 {
        self.backpressure_waits.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct QueueInner {
    lanes: BTreeMap<u8, VecDeque<Event>>,
    len: usize,
    /// Set when the high-water mark was hit; producers stay suspended until
    /// the queue drains below the low-water mark.
    congested: bool,
}

impl QueueInner {
    fn enqueue(&mut self, event: Event) {
        self.lanes.entry(event.meta.priority).or_default().push_back(event);
        self.len += 1;
    }

    fn dequeue(&mut self) -> Option<Event> {
        let (&priority, lane) = self.lanes.iter_mut().next()?;

        // Lanes are removed as soon as they drain, so the front lane always
        // holds at least one event.
        let event = lane.pop_front()?;

        if lane.is_empty() {
            self.lanes.remove(&priority);
        }

        self.len -= 1;

        Some(event)
    }
}

/// Priority-fair multi-producer multi-consumer event queue.
///
/// Lower priority numbers drain first; FIFO within a priority. Enqueue never
/// drops: past the high-water mark producers suspend until consumers bring
/// the depth back below the low-water mark.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    ready: Notify,
    space: Notify,
    high_water: usize,
    low_water: usize,
    stats: QueueStats,
}

impl EventQueue {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        debug_assert!(low_water < high_water);

        Self {
            inner: Mutex::new(QueueInner::default()),
            ready: Notify::new(),
            space: Notify::new(),
            high_water,
            low_water,
            stats: QueueStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub async fn push(&self, event: Event) {
        let mut event = Some(event);

        loop {
            let space = self.space.notified();

            {
                let mut inner = self.inner.lock();

                let accept = if inner.congested {
                    inner.len < self.low_water
                } else {
                    inner.len < self.high_water
                };

                if accept {
                    inner.congested = false;
                    inner.enqueue(event.take().expect("event is present until enqueued"));
                    drop(inner);

                    self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                    self.ready.notify_one();
                    return;
                }

                inner.congested = true;
            }

            self.stats.backpressure_waits.fetch_add(1, Ordering::Relaxed);
            space.await;
        }
    }

    pub fn try_pop(&self) -> Option<Event> {
        let event = {
            let mut inner = self.inner.lock();
            let event = inner.dequeue()?;

            if inner.len < self.low_water {
                self.space.notify_waiters();
            }

            event
        };

        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);

        Some(event)
    }

    /// Waits for the next event. Callers race this against shutdown.
    pub async fn pop(&self) -> Event {
        loop {
            let ready = self.ready.notified();

            if let Some(event) = self.try_pop() {
                // Chain the wakeup so sibling consumers drain a burst.
                if !self.is_empty() {
                    self.ready.notify_one();
                }
                return event;
            }

            ready.await;
        }
    }
}

/// Drives events through matched handlers.
///
/// Per event, handlers execute in ascending priority groups with a barrier
/// between groups; handlers inside a group run concurrently, each behind its
/// own `max_instances` admission semaphore.
#[derive(Clone)]
pub struct Dispatcher {
    session: Arc<Session>,
    registry: Arc<Registry>,
    busy: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>, registry: Arc<Registry>) -> Self {
        Self {
            session,
            registry,
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Runs one event to completion through every matching handler.
    pub async fn dispatch(&self, event: Event) {
        let handlers = self.registry.handlers_for(event.asset.kind());

        if handlers.is_empty() {
            trace!(kind = %event.asset.kind(), "No handler for event");
            return;
        }

        let mut start = 0;
        while start < handlers.len() {
            let priority = handlers[start].priority;
            let end = start + handlers[start..].iter().take_while(|h| h.priority == priority).count();

            let group = handlers[start..end].iter().map(|handler| self.invoke(handler, &event));
            futures::future::join_all(group).await;

            start = end;
        }
    }

    async fn invoke(&self, handler: &Arc<RegisteredHandler>, event: &Event) {
        let _permit = handler.acquire().await;

        match handler.callback.handle(&self.session, event).await {
            Ok(()) => {}
            Err(HandlerError::Canceled) => {
                trace!(plugin = %handler.plugin, handler = %handler.name, "Handler interrupted by shutdown");
            }
            Err(HandlerError::Other(error)) => {
                warn!(
                    plugin = %handler.plugin,
                    handler = %handler.name,
                    error = format!("{error:#}"),
                    "Handler failed; event continues",
                );
            }
        }
    }

    async fn worker_loop(self) {
        let mut halt = self.session.halted();

        loop {
            let Ok(event) = halt.guard(self.session.queue.pop()).await else {
                break;
            };

            self.busy.fetch_add(1, Ordering::SeqCst);
            self.dispatch(event).await;
            self.busy.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Worker pool; one per session.
pub struct DispatcherTask {
    dispatcher: Dispatcher,
    workers: usize,
}

impl DispatcherTask {
    pub fn new(dispatcher: Dispatcher, workers: usize) -> Self {
        Self { dispatcher, workers }
    }

    /// Runs the worker pool until the session halts.
    pub async fn run(self) -> anyhow::Result<()> {
        debug!(workers = self.workers, "Dispatcher started");

        let crew: Vec<_> = (0..self.workers)
            .map(|_| tokio::spawn(self.dispatcher.clone().worker_loop()))
            .collect();

        for worker in crew {
            if let Err(error) = worker.await {
                error!(%error, "A dispatcher worker ended abnormally");
            }
        }

        debug!("Dispatcher terminated");

        Ok(())
    }
}

/// Termination detector.
///
/// Declares quiescence when the queue is empty, no worker is busy, every
/// handler semaphore is fully replenished and no external I/O token is held,
/// continuously for the configured window. Recording the drain verdict on the
/// session stops the worker pool.
pub struct QuiescenceTask {
    dispatcher: Dispatcher,
    registry: Arc<Registry>,
    window: Duration,
}

impl QuiescenceTask {
    pub fn new(dispatcher: Dispatcher, registry: Arc<Registry>, window: Duration) -> Self {
        Self {
            dispatcher,
            registry,
            window,
        }
    }

    fn engine_is_idle(&self) -> bool {
        let session = self.dispatcher.session();

        session.queue.is_empty()
            && self.dispatcher.busy_workers() == 0
            && self.registry.fully_replenished()
            && session.io.idle()
            && session.flights.in_flight() == 0
    }

    /// Samples the engine until it stays idle for a full window, then records
    /// the drain verdict on the session.
    pub async fn run(self) -> anyhow::Result<()> {
        let session = Arc::clone(self.dispatcher.session());
        let mut halt = session.halted();

        // Jitter the sampling period so detectors of concurrent sessions do
        // not align their probes.
        let mut rng = session.rng();
        let jitter = Duration::from_millis(rng.gen_range(0..50));
        let poll_interval = QUIESCENCE_POLL_INTERVAL + jitter;

        let mut stable_since: Option<Instant> = None;

        loop {
            if halt.guard(tokio::time::sleep(poll_interval)).await.is_err() {
                debug!("Termination detector stopped before the stream drained");
                return Ok(());
            }

            if self.engine_is_idle() {
                let since = stable_since.get_or_insert_with(Instant::now);

                if since.elapsed() >= self.window {
                    let stats = session.queue.stats();
                    info!(
                        events = stats.dequeued(),
                        "Event stream drained; session is quiescent",
                    );
                    session.complete();
                    return Ok(());
                }
            } else {
                stable_since = None;
            }
        }
    }
}
