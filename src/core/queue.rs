//! Priority-aware, bounded-concurrency work queues.
//!
//! One queue exists per resource class (data loading, decoding,
//! processing, decompression, encoding). Items are one-shot async
//! closures with a priority that can change after enqueue and a
//! cooperative cancellation token that executing closures are expected
//! to observe.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::request::Priority;

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Waiting for a free execution slot
    Pending,
    /// Currently executing
    Executing,
    /// Ran to completion
    Finished,
    /// Cancelled before or during execution
    Cancelled,
}

/// Queue lifecycle notifications, exposed for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// An item was enqueued
    ItemAdded {
        seq: u64,
    },
    /// An item's priority changed
    PriorityUpdated {
        seq: u64,
        priority: Priority,
    },
    /// An item was cancelled
    ItemCancelled {
        seq: u64,
    },
}

type WorkFn = Box<dyn FnOnce(WorkContext) -> BoxFuture<'static, ()> + Send>;

/// Execution context handed to a work closure.
///
/// Closures must treat cancellation cooperatively: bail out as soon as
/// the token fires.
#[derive(Clone)]
pub struct WorkContext {
    token: CancellationToken,
}

impl WorkContext {
    /// The item's cancellation token, for use in `select!` arms.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the item has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the item is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// A scheduled unit of work.
///
/// Returned by [`WorkQueue::enqueue`]; the handle outlives execution
/// and can be used to re-prioritize or cancel the item at any point.
pub struct WorkItem {
    seq: u64,
    priority: Mutex<Priority>,
    state: Mutex<ItemState>,
    token: CancellationToken,
    work: Mutex<Option<WorkFn>>,
    queue: Weak<QueueInner>,
}

impl WorkItem {
    /// The item's enqueue sequence number. FIFO order among equal
    /// priorities follows this number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Current priority.
    pub fn priority(&self) -> Priority {
        *self.priority.lock().unwrap()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ItemState {
        *self.state.lock().unwrap()
    }

    /// Whether the item was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Update the item's priority.
    ///
    /// Pending items are re-ranked; executing items record the new
    /// priority without being preempted.
    pub fn set_priority(&self, priority: Priority) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        {
            let mut current = self.priority.lock().unwrap();
            if *current == priority {
                return;
            }
            *current = priority;
        }
        queue.notify(QueueEvent::PriorityUpdated {
            seq: self.seq,
            priority,
        });
        // A pending item may now outrank an item ahead of it.
        QueueInner::dispatch(&queue);
    }

    /// Cancel the item.
    ///
    /// Pending items are removed immediately; executing items keep
    /// running until their closure observes the token. The terminal
    /// state is `Cancelled` either way.
    pub fn cancel(&self) {
        let Some(queue) = self.queue.upgrade() else {
            self.token.cancel();
            return;
        };
        let was_pending;
        {
            let mut queue_state = queue.state.lock().unwrap();
            let mut state = self.state.lock().unwrap();
            match *state {
                ItemState::Finished | ItemState::Cancelled => return,
                ItemState::Pending => {
                    was_pending = true;
                    queue_state.pending.retain(|item| item.seq != self.seq);
                }
                ItemState::Executing => {
                    was_pending = false;
                }
            }
            *state = ItemState::Cancelled;
        }
        self.token.cancel();
        // Drop the closure right away so captured resources are freed
        // even if the item never ran.
        self.work.lock().unwrap().take();
        queue.notify(QueueEvent::ItemCancelled { seq: self.seq });
        if was_pending {
            QueueInner::dispatch(&queue);
        }
    }
}

struct QueueState {
    max_concurrent: usize,
    executing: usize,
    is_suspended: bool,
    pending: Vec<Arc<WorkItem>>,
    next_seq: u64,
    observer: Option<mpsc::UnboundedSender<QueueEvent>>,
}

struct QueueInner {
    name: &'static str,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn notify(&self, event: QueueEvent) {
        let observer = self.state.lock().unwrap().observer.clone();
        if let Some(observer) = observer {
            let _ = observer.send(event);
        }
    }

    fn dispatch(inner: &Arc<QueueInner>) {
        loop {
            let (item, work) = {
                let mut state = inner.state.lock().unwrap();
                if state.is_suspended || state.executing >= state.max_concurrent {
                    return;
                }
                // Highest priority wins; FIFO among equals.
                let best = state
                    .pending
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| {
                        a.priority()
                            .cmp(&b.priority())
                            .then(b.seq.cmp(&a.seq))
                    })
                    .map(|(index, _)| index);
                let Some(index) = best else {
                    return;
                };
                let item = state.pending.remove(index);
                let Some(work) = item.work.lock().unwrap().take() else {
                    continue;
                };
                *item.state.lock().unwrap() = ItemState::Executing;
                state.executing += 1;
                (item, work)
            };
            let context = WorkContext {
                token: item.token.clone(),
            };
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                work(context).await;
                {
                    let mut queue_state = inner.state.lock().unwrap();
                    queue_state.executing -= 1;
                    let mut state = item.state.lock().unwrap();
                    if *state == ItemState::Executing {
                        *state = ItemState::Finished;
                    }
                }
                QueueInner::dispatch(&inner);
            });
        }
    }
}

/// A bounded-concurrency scheduler of prioritized work closures.
///
/// # Examples
///
/// ```rust
/// use pixfetch::core::WorkQueue;
/// use pixfetch::request::Priority;
///
/// # async fn example() {
/// let queue = WorkQueue::new(2);
/// let item = queue.enqueue(Priority::High, |_ctx| async move {
///     // heavy work here
/// });
/// item.cancel();
/// # }
/// ```
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    /// Create a queue executing at most `max_concurrent` items at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_name(max_concurrent, "work-queue")
    }

    /// Create a named queue; the name appears in debug logging.
    pub fn with_name(max_concurrent: usize, name: &'static str) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name,
                state: Mutex::new(QueueState {
                    max_concurrent: max_concurrent.max(1),
                    executing: 0,
                    is_suspended: false,
                    pending: Vec::new(),
                    next_seq: 0,
                    observer: None,
                }),
            }),
        }
    }

    /// Enqueue a work closure at the given priority.
    pub fn enqueue<F, Fut>(&self, priority: Priority, work: F) -> Arc<WorkItem>
    where
        F: FnOnce(WorkContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let work: WorkFn = Box::new(move |context| Box::pin(work(context)));
        let item = {
            let mut state = self.inner.state.lock().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;
            let item = Arc::new(WorkItem {
                seq,
                priority: Mutex::new(priority),
                state: Mutex::new(ItemState::Pending),
                token: CancellationToken::new(),
                work: Mutex::new(Some(work)),
                queue: Arc::downgrade(&self.inner),
            });
            state.pending.push(Arc::clone(&item));
            log::debug!(
                "{}: enqueued item {} at {:?} ({} pending)",
                self.inner.name,
                seq,
                priority,
                state.pending.len()
            );
            item
        };
        self.inner.notify(QueueEvent::ItemAdded { seq: item.seq });
        QueueInner::dispatch(&self.inner);
        item
    }

    /// Pause or resume dispatch. Enqueued items are kept, executing
    /// items are unaffected.
    pub fn set_suspended(&self, is_suspended: bool) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.is_suspended = is_suspended;
        }
        if !is_suspended {
            QueueInner::dispatch(&self.inner);
        }
    }

    /// Install a lifecycle observer. Used by tests to await queue
    /// activity deterministically.
    pub fn set_observer(&self, observer: mpsc::UnboundedSender<QueueEvent>) {
        self.inner.state.lock().unwrap().observer = Some(observer);
    }

    /// Number of items waiting for a slot.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    /// Number of items currently executing.
    pub fn executing_count(&self) -> usize {
        self.inner.state.lock().unwrap().executing
    }
}
