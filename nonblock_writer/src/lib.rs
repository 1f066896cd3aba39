//! Writers that decouple producers from a slow or failing [`std::io::Write`] sink.
//!
//! [`NonBlockWriter`] copies each write into a bounded queue drained by a
//! dedicated worker thread. Producers only block when the queue is full;
//! sink errors are recorded and reported by [`NonBlockWriter::close`].
//!
//! [`CheckWriter`] and [`NilWriter`] are small pass-through decorators.

pub mod adapters;
pub mod cancel;
pub mod error;
pub mod writer;

pub use adapters::{CheckWriter, NilWriter};
pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use writer::{Builder, NonBlockWriter, State, WriteOutcome, DEFAULT_CAPACITY};
