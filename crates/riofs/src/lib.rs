//! Synthetic 9P filesystem core for a Plan-9-inspired agent environment.
//!
//! riofs exposes long-lived state — an executable scene, PTY-backed
//! terminals, inter-file routes — as a tree of named files with carefully
//! designed blocking-read and write semantics. Clients interact with the
//! system exclusively through file operations; composition happens at the
//! shell level (`cat agent/output > scene/parse`).
//!
//! # Overview
//!
//! The crate is transport-agnostic: anything that can deliver
//! `walk/open/read/write/clunk` calls (a 9P codec, a FUSE bridge, an
//! in-process client) drives the [`dispatch::Dispatch`] returned by
//! [`srv::Rio::new`]. The tree it serves:
//!
//! ```text
//! /
//! ├── ctl
//! ├── screen
//! ├── CONTEXT
//! ├── routes
//! ├── terms/<term_id>/{ctl, stdin, stdout, input, output, interrupt}
//! └── scene/{ctl, parse, stdout, STDERR, vars, state, version}
//! ```
//!
//! # Blocking reads
//!
//! Streaming output files follow a three-state readiness protocol
//! ([`stream::StreamFile`]): producers accumulate with `post` and latch a
//! batch with `mark_ready`; a read at offset 0 after full delivery rearms
//! the buffer for the next batch. This is what makes
//! `while true; do cat STDERR; done` — and therefore [`routes`] — work
//! without busy-polling.
//!
//! # Concurrency
//!
//! Single process, one tokio event loop. Every read is dispatched as an
//! independent task, so a blocked reader never stalls writes on other
//! fids; writes to one fid are FIFO. Blocked reads are cancelled when
//! their fid is clunked. Mutexes guard only trivial critical sections and
//! are never held across a suspension point.
//!
//! # Errors
//!
//! Recoverable conditions (bad code in `parse`, sandbox rejections) become
//! visible artifacts in readable files, because files are how agents
//! observe the world. Protocol errors ([`error::Error`]) are reserved for
//! genuinely invalid requests: bad paths, wrong modes, malformed control
//! commands.

pub mod context;
pub mod ctl;
pub mod dispatch;
pub mod dsl;
pub mod error;
pub mod exec;
pub mod node;
pub mod routes;
pub mod sandbox;
pub mod scene;
pub mod scene_fs;
pub mod srv;
pub mod stream;
pub mod term;

pub use crate::dispatch::Dispatch;
pub use crate::error::{Error, Result};
pub use crate::node::{FileOps, Node, OpenMode};
pub use crate::srv::{Config, Rio};
