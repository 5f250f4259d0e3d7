//! Queue/token asynchronous I/O.
//!
//! Sockets, files and in-process memory queues sit behind one descriptor type,
//! [`Qd`]. Push and pop never block: they hand back a [`QToken`], and the
//! caller decides when to block on it with [`Runtime::wait`],
//! [`Runtime::wait_any`] or [`Runtime::wait_all`]. Network queues run on
//! `io_uring`; the ring is driven by whichever thread is waiting on it.
//!
//! ```no_run
//! use qio::{Runtime, Sga};
//!
//! let runtime = Runtime::new()?;
//! let qd = runtime.create_memory_queue()?;
//!
//! let push = runtime.push(qd, Sga::from("hello"))?;
//! let pop = runtime.pop(qd)?;
//!
//! runtime.wait(push)?;
//! assert_eq!(runtime.wait(pop)?.into_sga()?.to_vec(), b"hello");
//! # Ok::<(), qio::Error>(())
//! ```
//!
//! Queues only exist through the runtime; their implementations and the ring
//! are not reachable from outside.
//!
//! ```compile_fail
//! let fd = qio::kio::net::socket(2, 1, 0).unwrap();
//! ```
//!
//! ```compile_fail
//! let queue = qio::queue::NetworkQueue::new(3);
//! ```

mod completion;
mod error;
mod kio;
mod queue;
mod registry;
mod runtime;
mod sga;
mod token;

pub use completion::{Opcode, QResult, QValue};
pub use error::{Error, Result};
pub use queue::{Qd, QueueKind};
pub use runtime::{Runtime, RuntimeBuilder};
pub use sga::{Segment, Sga};
pub use token::QToken;
