//! The FSM-future combinator: turns a struct whose methods model explicit
//! state transitions into an ordinary [`std::future::Future`].
//!
//! Rather than reconstructing an owning pointer across a suspend point,
//! each state method takes `&mut self` and a borrowed [`std::task::Context`],
//! and returns a [`Step`] telling the combinator whether to yield, advance
//! to the next state, or return a final value.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// The result of polling one state of an [`FsmFuture`].
pub enum Step<T> {
    /// Equivalent to `Poll::Pending`: the waker has been registered
    /// somewhere and the state will be re-polled once woken.
    Pending,
    /// Advance immediately to the next state without yielding control back
    /// to the executor. Used for synchronous transitions between states
    /// that do not need to wait on anything.
    Continue,
    /// The state machine is done.
    Ready(T),
}

/// A future modelled as an explicit state machine. `poll_step` is called
/// repeatedly (without re-entering the executor) as long as it returns
/// [`Step::Continue`].
pub trait FsmFuture {
    type Output;

    fn poll_step(&mut self, cx: &mut Context<'_>) -> Step<Self::Output>;
}

/// Adapts an [`FsmFuture`] into an ordinary [`Future`].
pub struct Fsm<F>(F);

impl<F> Fsm<F> {
    pub fn new(fsm: F) -> Self {
        Self(fsm)
    }
}

impl<F: FsmFuture + Unpin> Future for Fsm<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.0.poll_step(cx) {
                Step::Pending => return Poll::Pending,
                Step::Continue => continue,
                Step::Ready(v) => return Poll::Ready(v),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountTo3 {
        n: u32,
    }

    impl FsmFuture for CountTo3 {
        type Output = u32;

        fn poll_step(&mut self, _cx: &mut Context<'_>) -> Step<u32> {
            if self.n >= 3 {
                Step::Ready(self.n)
            } else {
                self.n += 1;
                Step::Continue
            }
        }
    }

    #[test]
    fn fsm_adapter_drains_continue_steps() {
        let v = crate::rt::blocking::block_on(Fsm::new(CountTo3 { n: 0 }));
        assert_eq!(v, 3);
    }
}
