//! Ordered asynchronous execution queues and their synchronization edges.
//!
//! A [`Context`] is the engine's unit of scheduling: an ordered queue of
//! operations bound to one device. Operations enqueued on one context
//! execute in submission order; operations on two different contexts are
//! unordered unless a [`Context::wait`] or [`Context::block`] edge was
//! established between them. No global lock, no barrier: each edge is a
//! lightweight generation-counted token private to one (producer, consumer)
//! pair.
//!
//! Accelerator contexts are serviced by a dedicated worker thread (the
//! reference stand-in for a device stream). A CPU context has no thread of
//! its own: its "queue" is the calling thread, so enqueued work runs
//! immediately and a wait instruction against another CPU context is
//! trivially satisfied. A CPU context waiting on an accelerator edge
//! executes the wait instruction inline, i.e. the calling thread parks
//! until the producer's queue reaches the recorded point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, trace};
use once_cell::sync::Lazy;

use crate::device::{set_current_device, Device};
use crate::error::FluxRustError;
use crate::registry::{DeviceEntry, DeviceRegistry};
use crate::scratch::ScratchPool;

// ---------------------------------------------------------------------------
// Synchronization tokens
// ---------------------------------------------------------------------------

/// Reusable synchronization token for one directed (producer, consumer)
/// context pair.
///
/// `issue` stamps a new generation at record time on the host;
/// the producer queue completes that generation when it reaches the
/// recorded point, and the consumer queue parks until the generation it
/// captured is complete. Completion is monotone, so a token can be recorded
/// again while an older wait is still pending.
#[derive(Debug, Default)]
pub(crate) struct Event {
    issued: AtomicU64,
    completed: Mutex<u64>,
    cv: Condvar,
}

impl Event {
    fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn complete(&self, generation: u64) {
        let mut done = self.completed.lock().expect("event poisoned");
        if generation > *done {
            *done = generation;
            self.cv.notify_all();
        }
    }

    fn wait_reached(&self, generation: u64) {
        let mut done = self.completed.lock().expect("event poisoned");
        while *done < generation {
            done = self.cv.wait(done).expect("event poisoned");
        }
    }
}

/// Adjacency map of synchronization tokens, keyed by the stable ids of the
/// ordered (producer, consumer) pair. Tokens are created lazily on the
/// first edge between a pair and removed when either context is dropped,
/// so the table cannot grow past the set of live context pairs.
#[derive(Debug, Default)]
struct EventTable {
    map: Mutex<HashMap<(u64, u64), Arc<Event>>>,
}

static SYNC_TOKENS: Lazy<EventTable> = Lazy::new(EventTable::default);

impl EventTable {
    fn pair(&self, producer: u64, consumer: u64) -> Arc<Event> {
        let mut map = self.map.lock().expect("token table poisoned");
        Arc::clone(map.entry((producer, consumer)).or_default())
    }

    fn retire(&self, context_id: u64) {
        let mut map = self.map.lock().expect("token table poisoned");
        map.retain(|&(p, c), _| p != context_id && c != context_id);
    }
}

// ---------------------------------------------------------------------------
// Queue plumbing
// ---------------------------------------------------------------------------

enum Cmd {
    Op(Box<dyn FnOnce() + Send + 'static>),
    Signal(Arc<Event>, u64),
    WaitFor(Arc<Event>, u64),
    Shutdown,
}

/// Worker-thread queue of an accelerator context.
struct WorkerQueue {
    sender: Sender<Cmd>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerQueue {
    fn spawn(device: Device, context_id: u64) -> Result<Self, FluxRustError> {
        let (sender, receiver) = channel::<Cmd>();
        let handle = std::thread::Builder::new()
            .name(format!("fluxrust-{:?}-ctx{}", device, context_id))
            .spawn(move || {
                while let Ok(cmd) = receiver.recv() {
                    match cmd {
                        Cmd::Op(op) => op(),
                        Cmd::Signal(event, generation) => event.complete(generation),
                        Cmd::WaitFor(event, generation) => event.wait_reached(generation),
                        Cmd::Shutdown => break,
                    }
                }
            })
            .map_err(|e| FluxRustError::DeviceResource {
                message: format!("failed to spawn queue worker for {:?}: {}", device, e),
            })?;
        Ok(WorkerQueue {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn push(&self, cmd: Cmd) {
        // A send can only fail after shutdown, which Drop makes unreachable
        // for live contexts.
        let _ = self.sender.send(cmd);
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        let _ = self.sender.send(Cmd::Shutdown);
        if let Ok(mut guard) = self.handle.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

enum QueueImpl {
    /// CPU context: the calling thread is the queue.
    Inline,
    Worker(WorkerQueue),
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct ContextInner {
    id: u64,
    device: Device,
    entry: Arc<DeviceEntry>,
    queue: QueueImpl,
    /// Drain marker reused by `synchronize`.
    drain: Arc<Event>,
    /// Host-side completion callbacks, run after the next successful drain.
    callbacks: Mutex<Vec<Callback>>,
    scratch: Arc<ScratchPool>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        trace!("context {} on {:?} dropped", self.id, self.device);
        SYNC_TOKENS.retire(self.id);
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// An ordered, asynchronous execution queue bound to a compute device.
///
/// Cloning a `Context` clones the handle, not the queue. The queue is
/// released when the last handle drops; the per-device registry handles it
/// shares are never released.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .finish()
    }
}

impl Context {
    /// Creates a context bound to `device`, against the process-wide
    /// registry.
    ///
    /// # Errors
    /// `InvalidDevice` if the device id is not registered, `DeviceResource`
    /// if the queue cannot be allocated. Both are fatal for the device in
    /// this design; there is no retry.
    pub fn new(device: Device) -> Result<Self, FluxRustError> {
        Context::on_registry(DeviceRegistry::global(), device)
    }

    /// Creates a context against an explicit registry: the injection seam
    /// that lets tests run queues over a registry they control.
    pub fn on_registry(
        registry: &DeviceRegistry,
        device: Device,
    ) -> Result<Self, FluxRustError> {
        let entry = registry.entry(device)?;
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let queue = match device {
            Device::Cpu => QueueImpl::Inline,
            Device::Accel(_) => QueueImpl::Worker(WorkerQueue::spawn(device, id)?),
        };
        debug!("context {} created on {:?}", id, entry.device);
        Ok(Context {
            inner: Arc::new(ContextInner {
                id,
                device,
                entry,
                queue,
                drain: Arc::new(Event::default()),
                callbacks: Mutex::new(Vec::new()),
                scratch: Arc::new(ScratchPool::new()),
            }),
        })
    }

    /// The device this context is bound to.
    pub fn device(&self) -> Device {
        self.inner.device
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn device_entry(&self) -> Arc<DeviceEntry> {
        Arc::clone(&self.inner.entry)
    }

    pub(crate) fn scratch(&self) -> Arc<ScratchPool> {
        Arc::clone(&self.inner.scratch)
    }

    /// Makes this context's device the implicit target for subsequent
    /// device-defaulting calls on the calling thread. Side effect only; no
    /// ordering guarantee.
    pub fn activate(&self) {
        set_current_device(self.inner.device);
    }

    /// Appends `op` to this context's queue and returns immediately.
    ///
    /// This is the asynchronous contract the engine relies on: the call
    /// never blocks the caller. On a CPU context the queue is the calling
    /// thread, so `op` runs before the call returns, still in submission
    /// order, which is the only guarantee `enqueue` makes.
    pub fn enqueue(&self, op: impl FnOnce() + Send + 'static) {
        match &self.inner.queue {
            QueueImpl::Inline => op(),
            QueueImpl::Worker(worker) => worker.push(Cmd::Op(Box::new(op))),
        }
    }

    fn push(&self, cmd: Cmd) {
        match &self.inner.queue {
            QueueImpl::Inline => match cmd {
                Cmd::Op(op) => op(),
                // The calling thread executes the instruction right away:
                // a signal completes here, a wait parks here.
                Cmd::Signal(event, generation) => event.complete(generation),
                Cmd::WaitFor(event, generation) => event.wait_reached(generation),
                Cmd::Shutdown => {}
            },
            QueueImpl::Worker(worker) => worker.push(cmd),
        }
    }

    /// Records each of `others`' current queue positions and inserts a wait
    /// instruction into this context's queue: all work enqueued here after
    /// the call observes the completion of all work enqueued on each
    /// `other` before the call. Does not block the calling thread (for an
    /// accelerator context; a CPU context executes its own wait
    /// instruction inline, see the module docs).
    pub fn wait<'a, I>(&self, others: I)
    where
        I: IntoIterator<Item = &'a Context>,
    {
        for other in others {
            if Arc::ptr_eq(&self.inner, &other.inner) {
                continue; // already ordered by the queue itself
            }
            if !self.device().is_accel() && !other.device().is_accel() {
                continue; // one implicit host queue, nothing to order
            }
            let token = SYNC_TOKENS.pair(other.id(), self.id());
            let generation = token.issue();
            trace!(
                "context {} waits on context {} (generation {})",
                self.id(),
                other.id(),
                generation
            );
            other.push(Cmd::Signal(Arc::clone(&token), generation));
            self.push(Cmd::WaitFor(token, generation));
        }
    }

    /// Dual of [`Context::wait`]: makes each of `others` wait on this
    /// context's current queue position. Used by a producer that must keep
    /// consumers from racing ahead of data it is about to publish.
    pub fn block<'a, I>(&self, others: I)
    where
        I: IntoIterator<Item = &'a Context>,
    {
        for other in others {
            if Arc::ptr_eq(&self.inner, &other.inner) {
                continue;
            }
            if !self.device().is_accel() && !other.device().is_accel() {
                continue;
            }
            let token = SYNC_TOKENS.pair(self.id(), other.id());
            let generation = token.issue();
            trace!(
                "context {} blocks context {} (generation {})",
                self.id(),
                other.id(),
                generation
            );
            self.push(Cmd::Signal(Arc::clone(&token), generation));
            other.push(Cmd::WaitFor(token, generation));
        }
    }

    /// Registers host-side work to run on the calling thread after the next
    /// successful [`Context::synchronize`]. Keeps deferred host
    /// computations (loss read-back and the like) out of the queue itself.
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner
            .callbacks
            .lock()
            .expect("callback list poisoned")
            .push(Box::new(callback));
    }

    /// Blocks the calling thread until this context's queue is empty, then
    /// drains the completion-callback list. The only thread-blocking
    /// operation in the engine; meant for graph boundaries, never for
    /// steady-state propagation.
    pub fn synchronize(&self) {
        if let QueueImpl::Worker(worker) = &self.inner.queue {
            let generation = self.inner.drain.issue();
            worker.push(Cmd::Signal(Arc::clone(&self.inner.drain), generation));
            self.inner.drain.wait_reached(generation);
        }
        let callbacks: Vec<Callback> = std::mem::take(
            &mut *self
                .inner
                .callbacks
                .lock()
                .expect("callback list poisoned"),
        );
        for callback in callbacks {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cpu_context_runs_inline() {
        let ctx = Context::new(Device::Cpu).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        ctx.enqueue(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        // Inline queue: already done, no synchronize needed.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn accel_context_preserves_submission_order() {
        let ctx = Context::new(Device::Accel(0)).unwrap();
        let trail = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let t = Arc::clone(&trail);
            ctx.enqueue(move || t.lock().unwrap().push(i));
        }
        ctx.synchronize();
        let trail = trail.lock().unwrap();
        assert_eq!(*trail, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn invalid_device_is_fatal_at_construction() {
        let err = Context::new(Device::Accel(9999)).unwrap_err();
        assert!(matches!(err, FluxRustError::InvalidDevice { id: 9999, .. }));
    }

    #[test]
    fn callbacks_run_only_on_synchronize() {
        let ctx = Context::new(Device::Accel(0)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        ctx.add_callback(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        ctx.synchronize();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Drained: a second synchronize must not re-run it.
        ctx.synchronize();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn contexts_run_against_an_injected_registry() {
        let registry = DeviceRegistry::with_devices(4);
        let ctx = Context::on_registry(&registry, Device::Accel(3)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        ctx.enqueue(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        ctx.synchronize();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_between_cpu_contexts_is_a_no_op() {
        let a = Context::new(Device::Cpu).unwrap();
        let b = Context::new(Device::Cpu).unwrap();
        // Must return immediately and not deadlock.
        b.wait([&a]);
        a.block([&b]);
    }
}
