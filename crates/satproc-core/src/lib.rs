//! # satproc-core
//!
//! **A single-threaded process runtime for small-satellite onboard
//! services.**
//!
//! A program built on this crate is a daemon that reacts to exactly three
//! things: datagrams arriving on UDP sockets, timers firing, and POSIX
//! signals. On top of that it gets a uniform command/response protocol
//! between processes, a durable critical-state blob that survives reboots,
//! and supervised child processes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use satproc_core::events::SchedResult;
//! use satproc_core::process::Process;
//!
//! let mut proc = Process::init("payload").unwrap();
//!
//! // A periodic housekeeping timer.
//! proc.events().add_timer(
//!     Duration::from_secs(10),
//!     Box::new(|_evt, st| {
//!         let _ = st.save_critical_state(b"housekeeping ok");
//!         SchedResult::Keep
//!     }),
//! );
//!
//! proc.run().unwrap();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Process façade
//!   └── EventLoop (timer heap + poll(2) multiplexer)
//!         ├── EventTimer (real | debug-offset | virtual | shared-virtual)
//!         ├── Command engine (legacy bytes + XDR, response correlation)
//!         │     └── XDR codec & type registry
//!         └── Critical-state store (checksummed multi-copy files)
//! ```
//!
//! Everything runs cooperatively on one thread; the only place a process
//! waits is inside the clock's blocking primitive, which makes the same
//! application code runnable against real time, accelerated virtual time,
//! or a virtual clock shared across processes.

pub mod child;
pub mod cmd;
pub mod critical;
pub mod events;
#[cfg(target_os = "linux")]
pub mod gtimer;
pub mod net;
pub mod process;
pub mod proto;
pub mod queue;
pub mod time;
pub mod xdr;

pub use cmd::{CallbackStyle, CommandCatalog, CommandOutcome, CommandSpec, ErrorCatalog, ErrorInfo};
pub use critical::CriticalStore;
pub use events::{EventLoop, FdResult, FdSlot, SchedResult};
pub use process::{Process, ProcessConfig};
pub use queue::TimerId;
pub use time::{EventTimer, PauseState, RealTimer, VirtualTimer};
pub use xdr::{PrintStyle, XdrRegistry};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
