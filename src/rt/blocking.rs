//! The blocking context: a waker obtainable from any thread that is *not*
//! the event loop's own thread, built on `std::thread::park`/`unpark`.
//!
//! Using a blocking context from inside the event loop is forbidden: the
//! event loop thread would park itself waiting for a wakeup that only it
//! could deliver. This is enforced with a thread-local flag rather than
//! leaving it as a silent footgun.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::Thread;

thread_local! {
    static IN_EVENT_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// Marks the calling thread as the event loop's own thread. Called once by
/// [`crate::rt::event_loop::EventLoop`] when it starts running.
pub(crate) fn mark_event_loop_thread() {
    IN_EVENT_LOOP.with(|flag| flag.set(true));
}

pub(crate) fn is_event_loop_thread() -> bool {
    IN_EVENT_LOOP.with(Cell::get)
}

struct ParkSignal {
    woken: AtomicBool,
    thread: Thread,
}

impl ParkSignal {
    fn new() -> Self {
        Self {
            woken: AtomicBool::new(false),
            thread: std::thread::current(),
        }
    }

    fn wait(&self) {
        while !self.woken.swap(false, Ordering::Acquire) {
            std::thread::park();
        }
    }
}

impl Wake for ParkSignal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// A park/unpark-based waker for threads outside the event loop.
///
/// # Panics
///
/// [`BlockingContext::current`] panics if called from the event loop
/// thread: blocking the very thread that drives every future would
/// deadlock the whole subsystem.
pub struct BlockingContext {
    signal: Arc<ParkSignal>,
    waker: Waker,
}

impl BlockingContext {
    pub fn current() -> Self {
        assert!(
            !is_event_loop_thread(),
            "BlockingContext::current() called from the event loop thread: this would deadlock"
        );
        let signal = Arc::new(ParkSignal::new());
        let waker = Waker::from(signal.clone());
        Self { signal, waker }
    }

    pub fn waker(&self) -> &Waker {
        &self.waker
    }

    /// Parks the calling thread until the context's waker is used to wake
    /// it (or returns immediately if a wakeup already happened since the
    /// last call).
    pub fn block_until_woken(&self) {
        self.signal.wait();
    }

    /// Polls `fut` to completion on the calling thread, parking between
    /// poll attempts. Unbounded: there is no timeout variant.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        let mut fut = fut;
        // SAFETY: `fut` is not moved again after this point; it is pinned
        // to this stack frame for the remainder of the call.
        let mut fut = unsafe { Pin::new_unchecked(&mut fut) };
        loop {
            let mut cx = Context::from_waker(&self.waker);
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(v) => return v,
                Poll::Pending => self.block_until_woken(),
            }
        }
    }
}

/// Convenience free function: equivalent to
/// `BlockingContext::current().block_on(fut)`.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    BlockingContext::current().block_on(fut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_resolves_ready_future() {
        let v = block_on(std::future::ready(42));
        assert_eq!(v, 42);
    }

    #[test]
    #[should_panic(expected = "would deadlock")]
    fn forbidden_from_event_loop_thread() {
        mark_event_loop_thread();
        let _ = BlockingContext::current();
    }
}
