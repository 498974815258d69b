/*!
tailgrep is the core of an interactive log viewer. It ingests log sources
that may be regular files, pipes or compressed streams, buffers them into
line-addressable storage and runs incremental, cancellable regex searches
against them from a worker that stays out of the caller's event loop.

Three mechanisms make up the crate:

* [`line_buffer::LineBuffer`] turns a file descriptor into random-access
  line retrieval by offset, hiding pipes and compression behind a window
  of cached bytes.
* [`piper::Piper`] drains a non-seekable input into a private seekable
  scratch file so that the rest of the system can treat a live pipe like
  any other file.
* [`grep::GrepWorker`] runs a compiled pattern over a line source in a
  worker joined to the host by pipe channels, streaming match records
  back for dispatch from the host's poll loop.

This crate is Unix-only: the data model is file descriptors, positional
reads and writes, and `poll(2)`.
*/

use std::error;
use std::fmt;
use std::io;
use std::result;

pub mod archive;
pub mod fd;
pub mod grep;
pub mod line_buffer;
pub mod piper;
pub mod poll;
pub mod wire;
pub mod window;

pub use crate::grep::{
    GrepBuilder, GrepControl, GrepSink, GrepSource, GrepState, GrepWorker,
};
pub use crate::line_buffer::{LineBuffer, LineRef};
pub use crate::piper::Piper;
pub use crate::window::ByteWindow;

/// A type alias for `Result<T, tailgrep::Error>`.
pub type Result<T> = result::Result<T, Error>;

/// Error describes the failures that can occur while buffering or
/// searching a log stream.
///
/// Transient conditions (short reads, would-block on a pipe) are handled
/// internally and never surface here.
#[derive(Debug)]
pub enum Error {
    /// An underlying read, write or open failed non-transiently.
    Io(io::Error),
    /// A single line is larger than the window is allowed to grow.
    ///
    /// The caller decides what to do with the oversized line; the leading
    /// bytes are still retrievable with `read_range`.
    BufferExhausted(usize),
    /// An offset behind the cached window was requested on a source that
    /// cannot rewind.
    Seek {
        /// The offset that was asked for.
        offset: u64,
        /// The earliest offset still cached.
        window_start: u64,
    },
    /// The search pattern failed to compile.
    InvalidPattern(regex::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref err) => err.fmt(f),
            Error::BufferExhausted(len) => {
                write!(
                    f,
                    "line too long: {} bytes exceed the {} byte buffer limit",
                    len,
                    window::MAX_BUFFER_SIZE
                )
            }
            Error::Seek { offset, window_start } => {
                write!(
                    f,
                    "offset {} is behind the buffered window starting at {}",
                    offset, window_start
                )
            }
            Error::InvalidPattern(ref err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            Error::InvalidPattern(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Error {
        Error::InvalidPattern(err)
    }
}
