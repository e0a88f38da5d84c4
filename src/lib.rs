//! Remote source-level debugger backend for a dynamic-language interpreter.
//!
//! The interpreter delivers call/line/return/exception trace events to the
//! debugger on whichever thread produced them; the debugger talks to an
//! external front-end over a single framed TCP connection. Traced threads
//! push events outward through the connection's send lock while a dedicated
//! reader thread pulls commands inward and mutates the thread registry and
//! breakpoint tables. There are no queues: the front-end drives by issuing
//! commands against thread-ids and frame-ids that are valid while a thread
//! is parked.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;

pub mod breakpoints;
pub mod commands;
pub mod connection;
pub mod eval;
pub mod exceptions;
pub mod flags;
pub mod interp;
pub mod output;
pub mod session;
pub mod sync;
pub mod thread;
pub mod wire;

pub use crate::flags::DebugFlags;
pub use crate::session::{attach_process, debug, Session};
