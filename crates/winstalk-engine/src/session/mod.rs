//! Debugging sessions.
//!
//! A [DebugSession] is configured with a [Builder], then drives any number of
//! debuggees. Event handlers and breakpoint actions get the [Session] state,
//! which exposes the breakpoint, hook, watch and tracing APIs.

mod breakpoints;
mod builder;
mod debug;
mod dispatch;
mod state;
mod trace;

pub use self::builder::Builder;
pub use self::debug::DebugSession;
pub use self::state::{Options, Session};
