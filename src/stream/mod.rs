//! Byte movement between clients and backends.
//!
//! ```text
//! Cat:  backend --> RetryReader --> [pipe --> decrypt] --> client
//! Put:  client frames --> [encrypt] --> pipe --> ProgressWriter --> backend
//! Copy: source --> RetryReader --> [pipe --> decrypt] --> [encrypt] --> ProgressWriter --> dest
//! ```
//!
//! Every stage passes bytes through the shared [`RateGovernor`] and reports
//! progress into the owning session.

pub mod limiter;
pub mod pipe;
pub mod reader;
pub mod writer;

pub use limiter::RateGovernor;
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use reader::{ReadSource, ReaderState, RetryPolicy, RetryReader, StorageSource};
pub use writer::ProgressWriter;
