//! Async plumbing (C8): the single-threaded cooperative event loop, the
//! FSM-future combinator used to build the commit pipeline, and the
//! blocking context used by callers outside the loop.

pub mod blocking;
pub mod event_loop;
pub mod fsm;

pub use blocking::BlockingContext;
pub use event_loop::{EnqueuedFuture, EventLoop};
pub use fsm::{Fsm, FsmFuture, Step};
