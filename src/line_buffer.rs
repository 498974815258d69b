/*!
Buffer for reading whole lines out of file descriptors. The interface is
stateless-facing: callers say which offset a line starts at and the
buffer takes care of caching the surrounding range and locating the
delimiter. The descriptor may be a regular file, a pipe, or a
gzip/bzip2-compressed file; offsets are always into the logical
(decompressed) stream.
*/

use std::cmp;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use log::debug;
use memchr::memchr;

use crate::fd::{self, Fd};
use crate::window::{ByteWindow, MAX_BUFFER_SIZE};
use crate::{Error, Result};

/// How much new data one fill asks for.
const FILL_CHUNK: usize = 64 * 1024;

/// The result of a line read.
///
/// The bytes borrow from the buffer's window; consume or copy them
/// before the next `read_line`/`read_range`/`invalidate`.
pub struct LineRef<'a> {
    bytes: &'a [u8],
    partial: bool,
}

impl<'a> LineRef<'a> {
    /// The line's bytes, without the delimiter unless the line was read
    /// with `include_delim`.
    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True iff end-of-stream was reached before a delimiter, i.e. this
    /// is an unterminated final line.
    #[inline]
    pub fn is_partial(&self) -> bool {
        self.partial
    }
}

/// A sequential reader over the raw (compressed) file that counts how
/// many physical bytes the decoder has consumed.
struct RawSource {
    file: File,
    bytes_read: u64,
}

impl Read for RawSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file.read(buf) {
                Ok(n) => {
                    self.bytes_read += n as u64;
                    return Ok(n);
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

enum Decoder {
    Plain,
    Gz(GzDecoder<RawSource>),
    Bz(BzDecoder<RawSource>),
}

enum FillResult {
    Bytes(usize),
    WouldBlock,
    Eof,
}

const GZ_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZ_MAGIC: &[u8] = b"BZh";

/// Lazily-backed window over a file descriptor with random-access line
/// retrieval by offset.
pub struct LineBuffer {
    window: ByteWindow,
    fd: Option<Fd>,
    decoder: Decoder,
    seekable: bool,
    /// For seekable uncompressed sources, the size from `fstat` at
    /// attach time. For pipes and compressed streams, unknown until EOF
    /// and then frozen at the total logical bytes drained.
    stream_size: Option<u64>,
    file_time: Option<SystemTime>,
}

impl LineBuffer {
    pub fn new() -> LineBuffer {
        LineBuffer {
            window: ByteWindow::new(),
            fd: None,
            decoder: Decoder::Plain,
            seekable: false,
            stream_size: None,
            file_time: None,
        }
    }

    /// Attach the buffer to a descriptor, taking ownership of it.
    ///
    /// Seekability is probed with `lseek` and compression is sniffed
    /// from the first bytes of seekable sources. Any previous state is
    /// discarded.
    pub fn attach(&mut self, fd: Fd) -> Result<()> {
        self.reset();

        let st = fd::fstat(fd.raw())?;
        self.seekable = fd::is_seekable(fd.raw());
        if st.st_mtime > 0 {
            self.file_time =
                Some(UNIX_EPOCH + Duration::from_secs(st.st_mtime as u64));
        }

        if self.seekable {
            let mut magic = [0u8; 4];
            let n = fd::pread(fd.raw(), &mut magic, 0)?;
            if magic[..n].starts_with(GZ_MAGIC) {
                self.decoder = Decoder::Gz(GzDecoder::new(raw_source(&fd)?));
            } else if magic[..n].starts_with(BZ_MAGIC) {
                self.decoder = Decoder::Bz(BzDecoder::new(raw_source(&fd)?));
            } else {
                self.stream_size = Some(st.st_size as u64);
            }
        }

        self.fd = Some(fd);
        Ok(())
    }

    /// The attached descriptor, if any.
    pub fn fd(&self) -> Option<i32> {
        self.fd.as_ref().map(|fd| fd.raw())
    }

    /// True if the descriptor does not support seeking.
    pub fn is_pipe(&self) -> bool {
        !self.seekable
    }

    /// True once a non-seekable source has reached EOF.
    pub fn is_pipe_closed(&self) -> bool {
        !self.seekable && self.stream_size.is_some()
    }

    pub fn is_compressed(&self) -> bool {
        match self.decoder {
            Decoder::Plain => false,
            _ => true,
        }
    }

    /// The size of the stream: the file size for seekable uncompressed
    /// sources, or the total bytes drained once EOF is reached,
    /// `None` while still unknown.
    pub fn stream_size(&self) -> Option<u64> {
        self.stream_size
    }

    /// Last-modified time of the underlying file, if available.
    pub fn file_time(&self) -> Option<SystemTime> {
        self.file_time
    }

    /// The physical read position corresponding to the logical offset
    /// `offset`: for compressed sources this is how far into the
    /// compressed file the decoder has read, useful for progress
    /// display.
    pub fn read_offset(&self, offset: u64) -> u64 {
        match self.decoder {
            Decoder::Plain => offset,
            Decoder::Gz(ref dec) => dec.get_ref().bytes_read,
            Decoder::Bz(ref dec) => dec.get_ref().bytes_read,
        }
    }

    /// Read the line beginning at `*offset`.
    ///
    /// On success `*offset` is advanced past the delimiter, or to the
    /// end of the stream for an unterminated final line (reported with
    /// `is_partial`). `Ok(None)` means end of stream, or, for a pipe
    /// that has not yet closed, that no complete line is available yet;
    /// the caller should retry after the descriptor polls readable.
    pub fn read_line(
        &mut self,
        offset: &mut u64,
        include_delim: bool,
    ) -> Result<Option<LineRef>> {
        let start = *offset;
        if let Some(size) = self.stream_size {
            if start >= size {
                return Ok(None);
            }
        }
        self.rewind_to(start)?;

        // Locate the delimiter first and only borrow the line bytes once
        // the window has stopped moving.
        let (len, partial) = loop {
            let have = if start < self.window.end_offset() {
                self.window.slice_from(start).len()
            } else {
                0
            };
            if have > 0 {
                if let Some(nl) = memchr(b'\n', self.window.slice_from(start)) {
                    break (nl, false);
                }
            }
            if have >= MAX_BUFFER_SIZE {
                return Err(Error::BufferExhausted(have));
            }

            let want = cmp::min(have + FILL_CHUNK, MAX_BUFFER_SIZE);
            match self.fill(start, want)? {
                FillResult::Bytes(_) => continue,
                FillResult::WouldBlock => return Ok(None),
                FillResult::Eof => {
                    if have == 0 {
                        return Ok(None);
                    }
                    break (have, true);
                }
            }
        };

        let end = if partial || !include_delim { len } else { len + 1 };
        *offset = start + len as u64 + if partial { 0 } else { 1 };
        let bytes = &self.window.slice_from(start)[..end];
        Ok(Some(LineRef { bytes, partial }))
    }

    /// Bulk, non-line-oriented read of up to `length` bytes at
    /// `offset`, used to extract slices referenced by earlier match
    /// offsets. Returns fewer bytes only when the stream ends (or a
    /// pipe has nothing more buffered).
    pub fn read_range(&mut self, offset: u64, length: usize) -> Result<&[u8]> {
        if length > MAX_BUFFER_SIZE {
            return Err(Error::BufferExhausted(length));
        }
        self.rewind_to(offset)?;
        let take = loop {
            let have = if offset < self.window.end_offset() {
                self.window.slice_from(offset).len()
            } else {
                0
            };
            if have >= length {
                break length;
            }
            match self.fill(offset, length)? {
                FillResult::Bytes(_) => continue,
                FillResult::WouldBlock | FillResult::Eof => break have,
            }
        };
        Ok(&self.window.slice_from(offset)[..take])
    }

    /// Forget cached data. The next read goes back to the source, which
    /// is required after the caller has observed the source being
    /// mutated or truncated. The descriptor stays attached.
    pub fn invalidate(&mut self) {
        debug!("line buffer invalidated at offset {}", self.window.end_offset());
        self.window.invalidate();
        if self.seekable && !self.is_compressed() {
            self.stream_size = None;
        }
    }

    /// Detach the descriptor and clear all state.
    pub fn reset(&mut self) {
        self.fd = None;
        self.decoder = Decoder::Plain;
        self.seekable = false;
        self.stream_size = None;
        self.file_time = None;
        self.window.clear();
    }

    /// Make an offset behind the cached window addressable again. A
    /// seekable, uncompressed source can always reposition with a
    /// `pread`, so the window is simply restarted there; pipes and
    /// streams still being decompressed cannot rewind and fail with a
    /// seek error.
    fn rewind_to(&mut self, offset: u64) -> Result<()> {
        if offset >= self.window.base_offset() {
            return Ok(());
        }
        if self.seekable && !self.is_compressed() {
            self.window.clear();
            return Ok(());
        }
        Err(Error::Seek { offset, window_start: self.window.base_offset() })
    }

    /// Pull more bytes into the window so that data at `start` grows
    /// toward `want` bytes.
    fn fill(&mut self, start: u64, want: usize) -> Result<FillResult> {
        self.window.ensure(start, want)?;
        let fd = match self.fd {
            Some(ref fd) => fd.raw(),
            None => {
                return Err(Error::Io(io::Error::from_raw_os_error(libc::EBADF)))
            }
        };

        let read_at = self.window.end_offset();
        let seekable = self.seekable;
        let res = match self.decoder {
            Decoder::Plain => self.window.fetch(|buf| {
                if seekable {
                    fd::pread(fd, buf, read_at)
                } else {
                    fd::read(fd, buf)
                }
            }),
            Decoder::Gz(ref mut dec) => self.window.fetch(|buf| dec.read(buf)),
            Decoder::Bz(ref mut dec) => self.window.fetch(|buf| dec.read(buf)),
        };
        match res {
            Ok(0) => {
                if self.stream_size.is_none() {
                    self.stream_size = Some(self.window.end_offset());
                }
                Ok(FillResult::Eof)
            }
            Ok(n) => Ok(FillResult::Bytes(n)),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                Ok(FillResult::WouldBlock)
            }
            Err(err) => Err(Error::Io(err)),
        }
    }
}

/// A fresh sequential handle on the compressed file, positioned at the
/// start.
fn raw_source(fd: &Fd) -> Result<RawSource> {
    let mut file = fd.clone_fd()?.into_file();
    file.seek(SeekFrom::Start(0))?;
    Ok(RawSource { file, bytes_read: 0 })
}
