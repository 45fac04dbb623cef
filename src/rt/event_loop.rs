//! The single-threaded cooperative event loop that runs the commit future
//! and every load task it spawns.
//!
//! Scheduling model: the loop owns a queue of ready tasks and runs on
//! one dedicated background thread; registered worker threads are ordinary
//! preemptive OS threads that reach into the loop only to enqueue work or
//! block on an [`EnqueuedFuture`]'s result via
//! [`crate::rt::blocking::BlockingContext`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::JoinHandle;

type TaskId = u64;
type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Shared {
    tasks: Mutex<HashMap<TaskId, BoxFuture>>,
    ready: Mutex<VecDeque<TaskId>>,
    ready_cv: Condvar,
    next_id: AtomicU64,
    shutdown: Mutex<bool>,
}

struct TaskWaker {
    id: TaskId,
    shared: Arc<Shared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut ready = self.shared.ready.lock().unwrap();
        ready.push_back(self.id);
        self.shared.ready_cv.notify_one();
    }
}

/// A single-threaded event loop owning exactly one background thread.
/// Dropping it stops accepting new work and joins the background thread
/// after letting it drain any tasks already marked ready.
pub struct EventLoop {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            ready_cv: Condvar::new(),
            next_id: AtomicU64::new(0),
            shutdown: Mutex::new(false),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("fimo-modules-event-loop".into())
            .spawn(move || run(worker_shared))
            .expect("failed to spawn the module subsystem's event loop thread");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Spawns `fut` onto the loop; it starts being polled as soon as the
    /// loop thread gets to it, independent of whether the caller ever
    /// inspects the result.
    pub fn spawn<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.tasks.lock().unwrap().insert(id, Box::pin(fut));
        self.shared.ready.lock().unwrap().push_back(id);
        self.shared.ready_cv.notify_one();
    }

    /// Spawns `fut` and returns a handle that copies its output to the
    /// caller once it resolves: state lives in the loop, polling may begin
    /// immediately, and the value is copied out on completion.
    pub fn enqueue<T, Fut>(&self, fut: Fut) -> EnqueuedFuture<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let slot: Arc<(Mutex<Option<T>>, Condvar)> = Arc::new((Mutex::new(None), Condvar::new()));
        let slot2 = slot.clone();
        self.spawn(async move {
            let value = fut.await;
            *slot2.0.lock().unwrap() = Some(value);
            slot2.1.notify_all();
        });
        EnqueuedFuture { slot }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        *self.shared.shutdown.lock().unwrap() = true;
        self.shared.ready_cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(shared: Arc<Shared>) {
    crate::rt::blocking::mark_event_loop_thread();
    loop {
        let id = {
            let mut ready = shared.ready.lock().unwrap();
            loop {
                if let Some(id) = ready.pop_front() {
                    break id;
                }
                if *shared.shutdown.lock().unwrap() && shared.tasks.lock().unwrap().is_empty() {
                    return;
                }
                ready = shared.ready_cv.wait(ready).unwrap();
            }
        };

        let mut fut = match shared.tasks.lock().unwrap().remove(&id) {
            Some(fut) => fut,
            None => continue,
        };

        let waker: Waker = Waker::from(Arc::new(TaskWaker {
            id,
            shared: shared.clone(),
        }));
        let mut cx = Context::from_waker(&waker);
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => {
                shared.tasks.lock().unwrap().insert(id, fut);
            }
        }
    }
}

/// A future whose state lives in the event loop's own task table; the
/// handle held by the caller only ever copies the final value out.
pub struct EnqueuedFuture<T> {
    slot: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> EnqueuedFuture<T> {
    /// Blocks the calling thread (which must not be the event loop thread)
    /// until the enqueued future resolves, then returns its value.
    pub fn wait(&self) -> T {
        let (lock, cv) = &*self.slot;
        let mut guard = lock.lock().unwrap();
        while guard.is_none() {
            guard = cv.wait(guard).unwrap();
        }
        guard.take().unwrap()
    }

    /// Non-blocking: returns the value if the future has already resolved.
    pub fn try_take(&self) -> Option<T> {
        self.slot.0.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_future_runs_to_completion() {
        let loop_ = EventLoop::new();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let done2 = done.clone();
        let handle = loop_.enqueue(async move {
            done2.store(true, Ordering::SeqCst);
            7
        });
        assert_eq!(handle.wait(), 7);
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn yields_across_multiple_polls() {
        struct YieldOnce(bool);
        impl Future for YieldOnce {
            type Output = ();
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                if self.0 {
                    Poll::Ready(())
                } else {
                    self.0 = true;
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            }
        }

        let loop_ = EventLoop::new();
        let handle = loop_.enqueue(async move {
            YieldOnce(false).await;
            99
        });
        assert_eq!(handle.wait(), 99);
    }
}
