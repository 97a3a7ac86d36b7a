//! This crate is a debugging engine for native Windows processes.
//!
//! It owns the life cycle of every breakpoint placed in the debuggees (code,
//! page and hardware breakpoints, plus the function hooks and buffer watches
//! built on top of them), and runs the debug event loop over any number of
//! processes, routing each event to a user-provided handler.
//!
//! The OS debug API is reached through the
//! [NativeDebugger](self::native::NativeDebugger) trait. The
//! `winstalk-debugger` crate provides its Win32 implementation.
//!
//! # Handling debug events
//!
//! The [EventHandler](self::handler::EventHandler) trait allows to define
//! custom logic for debug events. Wrapping it in an
//! [EventSift](self::handler::EventSift) gives each debuggee its own handler
//! instance.
//!
//! ```no_run
//! use std::marker::PhantomData;
//!
//! use winstalk_engine::event::{ContinueStatus, Event, EventKind};
//! use winstalk_engine::handler::EventHandler;
//! use winstalk_engine::native::NativeDebugger;
//! use winstalk_engine::{Builder, Command, Session};
//!
//! fn debug<N: NativeDebugger>(native: N) -> winstalk_engine::Result<()> {
//!     let mut session = Builder::new()
//!         .with_native(native)
//!         .with_event_handler(EntryBreaker(PhantomData))
//!         .kill_on_exit(true)
//!         .build();
//!
//!     session.start(&Command::new("C:\\Windows\\System32\\notepad.exe"))?;
//!     session.run()
//! }
//!
//! struct EntryBreaker<N>(PhantomData<N>);
//!
//! impl<N: NativeDebugger> EventHandler for EntryBreaker<N> {
//!     type Native = N;
//!     type Error = winstalk_engine::Error;
//!
//!     fn create_process(
//!         &mut self,
//!         session: &mut Session<N>,
//!         event: &mut Event,
//!     ) -> Result<(), Self::Error> {
//!         let EventKind::CreateProcess { start_address, .. } = *event.kind() else {
//!             return Ok(());
//!         };
//!
//!         session.stalk_at(event.pid(), start_address, |_session, event| {
//!             tracing::info!(pid = event.pid(), "entry point reached");
//!             event.set_continue_status(ContinueStatus::Continue);
//!             Ok(())
//!         })
//!     }
//! }
//! ```

pub mod breakpoint;
mod command;
mod error;
pub mod event;
pub mod handler;
pub mod hook;
pub mod native;
pub mod session;
mod watch;

pub use self::command::{Command, CommandEnv};
pub use self::error::{BoxError, Error, Result};
pub use self::session::{Builder, DebugSession, Session};
