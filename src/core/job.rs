//! Single-producer, multi-subscriber jobs.
//!
//! A [`Job`] is the unit of coalescing: every pipeline stage runs as a
//! job, and equivalent requests subscribe to the same job instead of
//! duplicating work. A job emits any number of progress and preview
//! events followed by exactly one final value or error, starts lazily
//! on the first subscription, and disposes when the last subscriber
//! leaves or a terminal event fires.
//!
//! Jobs chain: a job may hold one type-erased subscription to an
//! upstream job. Priority flows upstream (a job runs at the maximum of
//! its subscribers' priorities), cancellation flows upstream on
//! disposal.

use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;

use crate::core::queue::WorkItem;
use crate::error::PixfetchError;
use crate::request::Priority;
use crate::response::Progress;

/// An event emitted by a job.
#[derive(Clone)]
pub enum JobEvent<T: Clone> {
    /// Transfer progress of the underlying load
    Progress(Progress),
    /// A produced value; `is_completed == false` marks a preview that
    /// will be superseded
    Value {
        value: T,
        is_completed: bool,
    },
    /// Terminal failure
    Error(PixfetchError),
}

impl<T: Clone> JobEvent<T> {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Value {
                is_completed: true,
                ..
            } | JobEvent::Error(_)
        )
    }
}

type Starter<T> = Box<dyn FnOnce(&Job<T>) + Send>;
type Handler<T> = Arc<dyn Fn(JobEvent<T>) + Send + Sync>;

struct Subscriber<T: Clone> {
    id: u64,
    priority: Priority,
    handler: Handler<T>,
}

struct JobState<T: Clone + Send + 'static> {
    starter: Option<Starter<T>>,
    started: bool,
    disposed: bool,
    subscribers: Vec<Subscriber<T>>,
    next_id: u64,
    priority: Priority,
    operation: Option<Arc<WorkItem>>,
    dependency: Option<DependencyHandle>,
    on_dispose: Option<Box<dyn FnOnce() + Send>>,
    disposal_token: CancellationToken,
}

impl<T: Clone + Send + 'static> JobState<T> {
    fn effective_priority(&self) -> Priority {
        self.subscribers
            .iter()
            .map(|s| s.priority)
            .max()
            .unwrap_or(self.priority)
    }
}

struct JobShared<T: Clone + Send + 'static> {
    state: Mutex<JobState<T>>,
}

/// A coalesced work node. Cloning shares the same node.
pub struct Job<T: Clone + Send + 'static> {
    shared: Arc<JobShared<T>>,
}

impl<T: Clone + Send + 'static> Clone for Job<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Job<T> {
    /// Create a job. `starter` runs exactly once, triggered by the
    /// first subscription, and is dropped immediately afterwards so
    /// captured resources are released.
    pub fn new(starter: impl FnOnce(&Job<T>) + Send + 'static) -> Self {
        Self {
            shared: Arc::new(JobShared {
                state: Mutex::new(JobState {
                    starter: Some(Box::new(starter)),
                    started: false,
                    disposed: false,
                    subscribers: Vec::new(),
                    next_id: 0,
                    priority: Priority::default(),
                    operation: None,
                    dependency: None,
                    on_dispose: None,
                    disposal_token: CancellationToken::new(),
                }),
            }),
        }
    }

    /// Subscribe to the job's events.
    ///
    /// Returns `None` when the job has already terminated or been
    /// disposed; such a job never emits again. The first successful
    /// subscription starts the job.
    pub fn subscribe(
        &self,
        priority: Priority,
        handler: impl Fn(JobEvent<T>) + Send + Sync + 'static,
    ) -> Option<JobSubscription<T>> {
        let starter;
        let reprioritize;
        let id;
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.disposed {
                return None;
            }
            id = state.next_id;
            state.next_id += 1;
            state.subscribers.push(Subscriber {
                id,
                priority,
                handler: Arc::new(handler),
            });
            reprioritize = Self::reprioritize_locked(&mut state);
            starter = if state.started {
                None
            } else {
                state.started = true;
                state.starter.take()
            };
        }
        if let Some((priority, operation, dependency)) = reprioritize {
            apply_priority(priority, operation, dependency);
        }
        if let Some(starter) = starter {
            starter(self);
        }
        Some(JobSubscription {
            shared: Arc::downgrade(&self.shared),
            id,
        })
    }

    // Recomputes the effective priority; returns the propagation
    // targets when it changed.
    fn reprioritize_locked(
        state: &mut JobState<T>,
    ) -> Option<(Priority, Option<Arc<WorkItem>>, Option<DependencyHandle>)> {
        let effective = state.effective_priority();
        if effective == state.priority && state.started {
            return None;
        }
        state.priority = effective;
        Some((effective, state.operation.clone(), state.dependency.clone()))
    }

    /// Attach the active work-queue item. The job cancels it on
    /// disposal and keeps its priority in sync.
    pub fn set_operation(&self, item: Arc<WorkItem>) {
        let (disposed, priority) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.disposed {
                (true, Priority::default())
            } else {
                let priority = state.priority;
                state.operation = Some(Arc::clone(&item));
                (false, priority)
            }
        };
        if disposed {
            item.cancel();
        } else {
            item.set_priority(priority);
        }
    }

    /// Attach the subscription to the upstream job this one depends on.
    pub fn set_dependency(&self, dependency: DependencyHandle) {
        let (disposed, priority) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.disposed {
                (true, Priority::default())
            } else {
                let priority = state.priority;
                state.dependency = Some(dependency.clone());
                (false, priority)
            }
        };
        if disposed {
            dependency.unsubscribe();
        } else {
            dependency.set_priority(priority);
        }
    }

    /// Register cleanup that runs exactly once when the job disposes,
    /// whether by completion, error, or losing its last subscriber.
    pub fn set_on_dispose(&self, f: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.shared.state.lock().unwrap();
            if state.disposed {
                true
            } else {
                state.on_dispose = Some(Box::new(f));
                return;
            }
        };
        if run_now {
            f();
        }
    }

    /// A token cancelled at disposal; auxiliary tasks spawned by the
    /// starter guard on it.
    pub fn disposal_token(&self) -> CancellationToken {
        self.shared.state.lock().unwrap().disposal_token.clone()
    }

    /// Emit a progress event.
    pub fn send_progress(&self, progress: Progress) {
        self.emit(JobEvent::Progress(progress));
    }

    /// Emit a value. `is_completed == true` terminates the job.
    pub fn send_value(&self, value: T, is_completed: bool) {
        self.emit(JobEvent::Value {
            value,
            is_completed,
        });
    }

    /// Emit the terminal error.
    pub fn send_error(&self, error: PixfetchError) {
        self.emit(JobEvent::Error(error));
    }

    fn emit(&self, event: JobEvent<T>) {
        let handlers: Vec<Handler<T>>;
        let mut cleanup = None;
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.disposed {
                return;
            }
            handlers = state.subscribers.iter().map(|s| s.handler.clone()).collect();
            if event.is_terminal() {
                state.disposed = true;
                state.subscribers.clear();
                state.starter = None;
                state.disposal_token.cancel();
                cleanup = Some((
                    state.operation.take(),
                    state.dependency.take(),
                    state.on_dispose.take(),
                ));
            }
        }
        for handler in &handlers {
            handler(event.clone());
        }
        if let Some((_operation, dependency, on_dispose)) = cleanup {
            // The operation just produced the terminal event; dropping
            // the handle is enough.
            if let Some(dependency) = dependency {
                dependency.unsubscribe();
            }
            if let Some(on_dispose) = on_dispose {
                on_dispose();
            }
        }
    }

    /// Current effective priority.
    pub fn priority(&self) -> Priority {
        self.shared.state.lock().unwrap().priority
    }

    /// Whether the job has terminated or been disposed.
    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().unwrap().disposed
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().unwrap().subscribers.len()
    }
}

/// A single subscriber's handle on a [`Job`].
pub struct JobSubscription<T: Clone + Send + 'static> {
    shared: Weak<JobShared<T>>,
    id: u64,
}

impl<T: Clone + Send + 'static> Clone for JobSubscription<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            id: self.id,
        }
    }
}

impl<T: Clone + Send + 'static> JobSubscription<T> {
    /// Update this subscriber's priority. The job's effective priority
    /// is the maximum over live subscribers and propagates to its work
    /// item and upstream dependency.
    pub fn set_priority(&self, priority: Priority) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let reprioritize = {
            let mut state = shared.state.lock().unwrap();
            if state.disposed {
                return;
            }
            let Some(subscriber) = state.subscribers.iter_mut().find(|s| s.id == self.id) else {
                return;
            };
            subscriber.priority = priority;
            Job::reprioritize_locked(&mut state)
        };
        if let Some((priority, operation, dependency)) = reprioritize {
            apply_priority(priority, operation, dependency);
        }
    }

    /// Drop this subscription. When the last subscriber of a live job
    /// unsubscribes, the job cancels its work item and upstream
    /// subscription and disposes.
    pub fn unsubscribe(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        enum Outcome {
            Nothing,
            Reprioritize(Priority, Option<Arc<WorkItem>>, Option<DependencyHandle>),
            Dispose(
                Option<Arc<WorkItem>>,
                Option<DependencyHandle>,
                Option<Box<dyn FnOnce() + Send>>,
            ),
        }
        let outcome = {
            let mut state = shared.state.lock().unwrap();
            if state.disposed {
                Outcome::Nothing
            } else {
                let before = state.subscribers.len();
                state.subscribers.retain(|s| s.id != self.id);
                if state.subscribers.len() == before {
                    Outcome::Nothing
                } else if state.subscribers.is_empty() {
                    state.disposed = true;
                    state.starter = None;
                    state.disposal_token.cancel();
                    Outcome::Dispose(
                        state.operation.take(),
                        state.dependency.take(),
                        state.on_dispose.take(),
                    )
                } else {
                    match Job::reprioritize_locked(&mut state) {
                        Some((p, op, dep)) => Outcome::Reprioritize(p, op, dep),
                        None => Outcome::Nothing,
                    }
                }
            }
        };
        match outcome {
            Outcome::Nothing => {}
            Outcome::Reprioritize(priority, operation, dependency) => {
                apply_priority(priority, operation, dependency);
            }
            Outcome::Dispose(operation, dependency, on_dispose) => {
                if let Some(operation) = operation {
                    operation.cancel();
                }
                if let Some(dependency) = dependency {
                    dependency.unsubscribe();
                }
                if let Some(on_dispose) = on_dispose {
                    on_dispose();
                }
            }
        }
    }
}

fn apply_priority(
    priority: Priority,
    operation: Option<Arc<WorkItem>>,
    dependency: Option<DependencyHandle>,
) {
    if let Some(operation) = operation {
        operation.set_priority(priority);
    }
    if let Some(dependency) = dependency {
        dependency.set_priority(priority);
    }
}

trait DependencyControl: Send + Sync {
    fn set_priority(&self, priority: Priority);
    fn unsubscribe(&self);
}

impl<T: Clone + Send + 'static> DependencyControl for JobSubscription<T> {
    fn set_priority(&self, priority: Priority) {
        JobSubscription::set_priority(self, priority);
    }

    fn unsubscribe(&self) {
        JobSubscription::unsubscribe(self);
    }
}

/// Type-erased handle on an upstream subscription, so jobs with
/// different value types can chain.
#[derive(Clone)]
pub struct DependencyHandle {
    control: Arc<dyn DependencyControl>,
}

impl DependencyHandle {
    /// Erase a subscription into a dependency handle.
    pub fn new<T: Clone + Send + 'static>(subscription: JobSubscription<T>) -> Self {
        Self {
            control: Arc::new(subscription),
        }
    }

    /// Propagate a priority change upstream.
    pub fn set_priority(&self, priority: Priority) {
        self.control.set_priority(priority);
    }

    /// Cancel the upstream subscription.
    pub fn unsubscribe(&self) {
        self.control.unsubscribe();
    }
}
