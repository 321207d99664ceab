//! Buffered, sequential, single-consumer file reading over raw
//! file-descriptor I/O.
//!
//! A [`FileStream`] amortizes read cost through a fixed-size read-ahead
//! buffer and serializes every operation through a single-flight FIFO
//! queue, so concurrent callers never interleave against one open file.

pub mod queue;
pub mod raw;
pub mod stream;

pub use queue::OpQueue;
pub use raw::{RawFile, RawIo, StdIo};
pub use stream::{
    Encoding, FileStream, StreamOptions, Whence, DEFAULT_BUFFER_SIZE,
    DEFAULT_ENCODING, DEFAULT_NEWLINE,
};

pub use stream_error::{FileStreamError, Result};
