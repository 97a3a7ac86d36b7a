//! This crate provides the default native debugger of `winstalk-engine`,
//! built on the Win32 debug API.
//!
//! The debugger spawns or attaches to processes on the **same host machine**,
//! and reports their debug events to the engine.
//!
//! <div class="warning">
//!
//! *This crate is not meant to be used on its own! It merely implements the
//! `NativeDebugger` trait provided by `winstalk-engine`, which manages the
//! breakpoints and dispatches the events.*
//!
//! </div>
//!
//! ```no_run
//! # #[cfg(all(target_os = "windows", target_arch = "x86_64"))]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use winstalk_debugger::Win32Debugger;
//! use winstalk_engine::handler::EventHandler;
//! use winstalk_engine::{Builder, Command};
//!
//! struct Quiet;
//!
//! impl EventHandler for Quiet {
//!     type Native = Win32Debugger;
//!     type Error = std::convert::Infallible;
//! }
//!
//! let mut debug = Builder::new()
//!     .with_native(Win32Debugger::new())
//!     .with_event_handler(Quiet)
//!     .build();
//!
//! debug.start(&Command::new("C:\\Windows\\System32\\whoami.exe"))?;
//! debug.run()?;
//! # Ok(())
//! # }
//! # #[cfg(not(all(target_os = "windows", target_arch = "x86_64")))]
//! # fn main() {}
//! ```
//!
//! # Supported Platforms
//!
//! <table>
//!     <thead>
//!         <tr>
//!             <th>Host Machine</th>
//!             <th>Debuggee Platform</th>
//!         </tr>
//!     </thead>
//!     <tbody>
//!         <tr>
//!             <td rowspan="2">Windows <code>x86_64</code></td>
//!             <td><code>x86_64</code></td>
//!         </tr>
//!         <tr>
//!             <td><code>i386</code> (WOW64)</td>
//!         </tr>
//!     </tbody>
//! </table>
//!
//! On any other host, this crate is empty.

#![cfg_attr(
    not(all(target_os = "windows", target_arch = "x86_64")),
    allow(dead_code)
)]

mod environment;
mod error;
mod sys;

pub use self::error::{Error, Result};
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub use self::sys::Win32Debugger;
