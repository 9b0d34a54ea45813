//! The I/O task graph.
//!
//! A [`Task`] wraps one device operation (a block write, a cache flush, or
//! nothing at all) plus completion edges: a task executes only once it has
//! been submitted *and* every child has completed, and its completion
//! callback runs before its parents are notified. Chaining each log block's
//! root task to its predecessor's is the only mechanism that guarantees
//! waiters fire in sequence order.
//!
//! Errors propagate from child to parent, with one deliberate exception:
//! flush tasks swallow their errors (see DESIGN.md).

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use log::warn;
use parking_lot::Mutex;

type Op = Box<dyn FnOnce() -> io::Result<()> + Send>;
type DoneFn = Box<dyn FnOnce(Option<io::ErrorKind>) + Send>;

struct TaskInner {
    op: Option<Op>,
    on_done: Option<DoneFn>,
    parents: Vec<Arc<Task>>,
    pending_children: usize,
    submitted: bool,
    done: bool,
    error: Option<io::ErrorKind>,
    /// Whether this task's error is visible to its parents.
    propagate: bool,
}

pub(crate) struct Task {
    inner: Mutex<TaskInner>,
    dispatch: Sender<Arc<Task>>,
}

impl Task {
    fn new(
        dispatch: Sender<Arc<Task>>,
        op: Option<Op>,
        on_done: Option<DoneFn>,
        propagate: bool,
    ) -> Arc<Task> {
        Arc::new(Task {
            inner: Mutex::new(TaskInner {
                op,
                on_done,
                parents: Vec::new(),
                pending_children: 0,
                submitted: false,
                done: false,
                error: None,
                propagate,
            }),
            dispatch,
        })
    }

    /// A task with no device operation of its own; completes when its
    /// children do. Used for the per-block root and the child aggregator.
    pub(crate) fn null(dispatch: &Sender<Arc<Task>>, on_done: Option<DoneFn>) -> Arc<Task> {
        Task::new(dispatch.clone(), None, on_done, true)
    }

    /// A task performing `op` when it becomes runnable.
    pub(crate) fn run(
        dispatch: &Sender<Arc<Task>>,
        op: impl FnOnce() -> io::Result<()> + Send + 'static,
        on_done: Option<DoneFn>,
        propagate: bool,
    ) -> Arc<Task> {
        Task::new(dispatch.clone(), Some(Box::new(op)), on_done, propagate)
    }

    /// Force an error outcome before submission (a task that exists only to
    /// keep ordering edges, e.g. after an allocation failure).
    pub(crate) fn set_error(&self, kind: io::ErrorKind) {
        self.inner.lock().error = Some(kind);
    }

    /// Make `parent` complete only after `child` does.
    ///
    /// If the child has already completed, only its error (if visible) is
    /// carried over.
    pub(crate) fn add_child(parent: &Arc<Task>, child: &Arc<Task>) {
        let mut c = child.inner.lock();
        if c.done {
            let err = if c.propagate { c.error } else { None };
            drop(c);
            if let Some(kind) = err {
                let mut p = parent.inner.lock();
                p.error.get_or_insert(kind);
            }
            return;
        }
        c.parents.push(Arc::clone(parent));
        drop(c);
        parent.inner.lock().pending_children += 1;
    }

    /// Hand the task to the dispatcher. It will execute as soon as all of
    /// its children have completed.
    pub(crate) fn submit(this: &Arc<Task>) {
        let runnable = {
            let mut inner = this.inner.lock();
            debug_assert!(!inner.submitted);
            inner.submitted = true;
            inner.pending_children == 0
        };
        if runnable {
            Task::enqueue(this);
        }
    }

    fn enqueue(this: &Arc<Task>) {
        if this.dispatch.send(Arc::clone(this)).is_err() {
            // Dispatcher gone (engine shutting down); run inline so the
            // graph still drains.
            Task::execute(this);
        }
    }

    pub(crate) fn execute(this: &Arc<Task>) {
        let (op, preset) = {
            let mut inner = this.inner.lock();
            (inner.op.take(), inner.error)
        };
        let result = match (preset, op) {
            (Some(kind), _) => Some(kind),
            (None, Some(op)) => op().err().map(|e| e.kind()),
            (None, None) => None,
        };
        Task::complete(this, result);
    }

    fn complete(this: &Arc<Task>, result: Option<io::ErrorKind>) {
        let (on_done, error, parents, propagate) = {
            let mut inner = this.inner.lock();
            if let Some(kind) = result {
                inner.error.get_or_insert(kind);
            }
            inner.done = true;
            (
                inner.on_done.take(),
                inner.error,
                std::mem::take(&mut inner.parents),
                inner.propagate,
            )
        };
        if let Some(cb) = on_done {
            cb(error);
        }
        for parent in parents {
            let runnable = {
                let mut p = parent.inner.lock();
                if propagate {
                    if let Some(kind) = error {
                        p.error.get_or_insert(kind);
                    }
                }
                debug_assert!(p.pending_children > 0);
                p.pending_children -= 1;
                p.pending_children == 0 && p.submitted
            };
            if runnable {
                Task::enqueue(&parent);
            }
        }
    }
}

/// A single worker draining a queue of runnable tasks. Also serves as the
/// general-purpose deferred-work queue (itx cleanup).
pub(crate) struct Dispatcher {
    tx: Sender<Arc<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub(crate) fn new(name: &str) -> Dispatcher {
        let (tx, rx): (Sender<Arc<Task>>, Receiver<Arc<Task>>) =
            crossbeam_channel::unbounded();
        let worker = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for task in rx {
                    Task::execute(&task);
                }
            })
            .expect("spawn dispatcher thread");
        Dispatcher {
            tx,
            worker: Some(worker),
        }
    }

    pub(crate) fn sender(&self) -> &Sender<Arc<Task>> {
        &self.tx
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Close the queue; queued tasks still run before the worker exits.
        let (closed, _) = crossbeam_channel::unbounded();
        self.tx = closed;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("i/o dispatcher panicked");
            }
        }
    }
}

/// Queue for deferred cleanup work, with inline fallback when the worker is
/// gone.
pub(crate) struct Taskq {
    tx: Sender<Box<dyn FnOnce() + Send>>,
    worker: Option<JoinHandle<()>>,
}

impl Taskq {
    pub(crate) fn new(name: &str) -> Taskq {
        let (tx, rx): (
            Sender<Box<dyn FnOnce() + Send>>,
            Receiver<Box<dyn FnOnce() + Send>>,
        ) = crossbeam_channel::unbounded();
        let worker = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("spawn taskq thread");
        Taskq {
            tx,
            worker: Some(worker),
        }
    }

    /// Dispatch `job` to the worker, or report it back for inline
    /// execution if the worker is unavailable.
    pub(crate) fn dispatch(
        &self,
        job: Box<dyn FnOnce() + Send>,
    ) -> Result<(), Box<dyn FnOnce() + Send>> {
        self.tx.send(job).map_err(|e| e.into_inner())
    }
}

impl Drop for Taskq {
    fn drop(&mut self) {
        let (closed, _) = crossbeam_channel::unbounded();
        self.tx = closed;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("cleanup taskq panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for condition");
    }

    #[test]
    fn parent_completes_after_children() {
        let disp = Dispatcher::new("io-test");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        let parent = Task::null(
            disp.sender(),
            Some(Box::new(move |_| o.lock().push("parent"))),
        );
        let o = Arc::clone(&order);
        let child = Task::run(
            disp.sender(),
            || Ok(()),
            Some(Box::new(move |_| o.lock().push("child"))),
            true,
        );
        Task::add_child(&parent, &child);

        // Parent submitted first, but must not run until the child is done.
        Task::submit(&parent);
        std::thread::sleep(Duration::from_millis(5));
        assert!(order.lock().is_empty());

        Task::submit(&child);
        wait_for(|| order.lock().len() == 2);
        assert_eq!(*order.lock(), vec!["child", "parent"]);
    }

    #[test]
    fn errors_propagate_to_parent() {
        let disp = Dispatcher::new("io-test");
        let seen = Arc::new(Mutex::new(None));

        let s = Arc::clone(&seen);
        let parent = Task::null(
            disp.sender(),
            Some(Box::new(move |err| *s.lock() = Some(err))),
        );
        let child = Task::run(
            disp.sender(),
            || Err(io::Error::new(io::ErrorKind::Other, "boom")),
            None,
            true,
        );
        Task::add_child(&parent, &child);
        Task::submit(&parent);
        Task::submit(&child);

        wait_for(|| seen.lock().is_some());
        assert_eq!(*seen.lock(), Some(Some(io::ErrorKind::Other)));
    }

    #[test]
    fn flush_errors_are_swallowed() {
        let disp = Dispatcher::new("io-test");
        let seen = Arc::new(Mutex::new(None));

        let s = Arc::clone(&seen);
        let parent = Task::null(
            disp.sender(),
            Some(Box::new(move |err| *s.lock() = Some(err))),
        );
        let child = Task::run(
            disp.sender(),
            || Err(io::Error::new(io::ErrorKind::Other, "flush failed")),
            None,
            false,
        );
        Task::add_child(&parent, &child);
        Task::submit(&parent);
        Task::submit(&child);

        wait_for(|| seen.lock().is_some());
        assert_eq!(*seen.lock(), Some(None));
    }

    #[test]
    fn chain_of_roots_completes_in_order() {
        let disp = Dispatcher::new("io-test");
        let hits = Arc::new(Mutex::new(Vec::new()));

        let mut roots = Vec::new();
        for i in 0..4 {
            let h = Arc::clone(&hits);
            let root = Task::null(
                disp.sender(),
                Some(Box::new(move |_| h.lock().push(i))),
            );
            if let Some(prev) = roots.last() {
                Task::add_child(&root, prev);
            }
            roots.push(root);
        }
        // Submit in reverse to prove edges, not submission order, decide.
        for root in roots.iter().rev() {
            Task::submit(root);
        }
        wait_for(|| hits.lock().len() == 4);
        assert_eq!(*hits.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn taskq_runs_jobs() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        let q = Taskq::new("clean-test");
        q.dispatch(Box::new(|| {
            RAN.fetch_add(1, Ordering::SeqCst);
        }))
        .ok()
        .unwrap();
        drop(q); // joins the worker
        assert_eq!(RAN.load(Ordering::SeqCst), 1);
    }
}
