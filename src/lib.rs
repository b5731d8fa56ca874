//! Process lifecycle telemetry for Linux.
//!
//! A [`Queue`] watches every CPU for process activity through the
//! perf ring-buffer interface: the `sched_process_exec` tracepoint
//! plus a small set of kprobes installed through tracefs, their
//! field offsets resolved from the running kernel's BTF. Records are
//! decoded into [`RawEvent`]s (exec, task wake-up, exit, comm
//! change, exec connector) and queued in time order.
//!
//! ## Example
//!
//! ```no_run
//! use procwatch::{Queue, QueueOpts, RawEventKind};
//!
//! let mut queue = Queue::open(QueueOpts::default()).unwrap();
//! loop {
//!     queue.block().unwrap(); // or poll queue.get_fds() yourself
//!     queue.populate().unwrap();
//!     for ev in queue.get_events(1024) {
//!         match ev.kind {
//!             RawEventKind::Exec(exec) => {
//!                 println!("{} exec {}", ev.pid, exec.filename)
//!             }
//!             RawEventKind::ExitThread(task) => {
//!                 println!("{} exit {:?}", ev.pid, task.exit_code)
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```
//!
//! ## Permission
//!
//! Installing kprobes and opening tracepoint perf events needs root
//! (or `CAP_PERFMON` plus write access to tracefs). Probe names are
//! suffixed with the process id, so concurrent processes do not
//! collide in the host-global `kprobe_events` namespace; within one
//! process, any number of queues share a single installation.

mod btf;
mod error;
mod ffi;
mod probe;
pub mod queue;
pub mod raw;
mod ring;
mod tracefs;

pub use error::{Error, Result};
pub use queue::{Queue, QueueFlags, QueueOpts, QueueStats};
pub use raw::{RawComm, RawEvent, RawEventKind, RawExec, RawExecConnector, RawTask};
