/*!
The piper drains a live, non-seekable input into a private seekable
scratch file so the rest of the system can treat a pipe like any other
file and do positional reads while data is still arriving.

A worker thread reads whole lines out of the input and appends them to
the scratch file with `pwrite`, optionally prefixing each with an
ISO 8601 millisecond timestamp. Writes are positional and monotonic in
offset, so concurrent readers that bound themselves by the observed
file size always see committed bytes. When the input reaches EOF a
sentinel is appended after the last line.
*/

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread::{self, JoinHandle};

use chrono::Local;
use log::{debug, error};

use crate::fd::{self, Fd, Pipe};
use crate::line_buffer::LineBuffer;
use crate::poll;
use crate::Result;

/// Appended to the scratch file when the input reaches end of stream.
const EOF_SENTINEL: &[u8] = b"---- END-OF-STDIN ----";

/// A pipe-to-file worker and the scratch file it writes.
pub struct Piper {
    scratch: Fd,
    handle: Option<JoinHandle<()>>,
    shutdown: Option<Fd>,
}

impl Piper {
    /// Spawn a worker that copies `input` into a seekable scratch file.
    ///
    /// With no `path`, the scratch file is anonymous: created in the
    /// temporary directory (honoring `TMPDIR`) and immediately
    /// unlinked, so it is reachable only through descriptors. A named
    /// scratch file is created `0600` and truncated.
    ///
    /// When `timestamp` is set, every line is prefixed with the wall
    /// clock time it was drained, as `YYYY-MM-DDTHH:MM:SS.mmm` and two
    /// spaces.
    pub fn new(input: Fd, timestamp: bool, path: Option<&Path>) -> Result<Piper> {
        let scratch_file = match path {
            Some(path) => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)?,
            None => tempfile::tempfile()?,
        };
        let scratch = Fd::from_file(scratch_file);
        scratch.set_cloexec()?;

        let worker_scratch = scratch.clone_fd()?;
        let Pipe { read: shutdown_read, write: shutdown_write } = Pipe::new()?;
        input.set_nonblocking()?;

        let handle = thread::Builder::new()
            .name("piper".to_string())
            .spawn(move || drain(input, worker_scratch, timestamp, shutdown_read))?;

        Ok(Piper {
            scratch,
            handle: Some(handle),
            shutdown: Some(shutdown_write),
        })
    }

    /// Duplicate the scratch descriptor for a reader.
    pub fn scratch_fd(&self) -> io::Result<Fd> {
        self.scratch.clone_fd()
    }

    /// The number of bytes committed to the scratch file so far.
    pub fn scratch_size(&self) -> io::Result<u64> {
        Ok(fd::fstat(self.scratch.raw())?.st_size as u64)
    }

    /// Non-blocking probe for worker completion; reaps the worker once
    /// it has finished. Idempotent.
    pub fn is_finished(&mut self) -> bool {
        if let Some(ref handle) = self.handle {
            if !handle.is_finished() {
                return false;
            }
            self.reap();
        }
        true
    }

    /// Request an orderly shutdown and wait for the worker to finish.
    /// The scratch file retains whatever was committed.
    pub fn terminate(&mut self) {
        // Closing the shutdown channel wakes the worker out of poll.
        self.shutdown = None;
        self.reap();
    }

    fn reap(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("piper worker panicked");
            }
        }
    }
}

impl Drop for Piper {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// The worker body: drain `input` into `scratch` until EOF or shutdown.
fn drain(input: Fd, scratch: Fd, timestamp: bool, shutdown: Fd) {
    let mut lb = LineBuffer::new();
    let input_fd = input.raw();
    if let Err(err) = lb.attach(input) {
        error!("piper: unable to attach to input: {}", err);
        return;
    }

    let mut off: u64 = 0;
    let mut woff: u64 = 0;
    let eof = loop {
        loop {
            match lb.read_line(&mut off, true) {
                Ok(Some(lv)) => {
                    if write_entry(&scratch, timestamp, &mut woff, lv.bytes()).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!("piper: unable to read from input: {}", err);
                    return;
                }
            }
        }
        if !lb.is_pipe() || lb.is_pipe_closed() {
            break true;
        }

        let mut fds = [poll::pollfd_in(input_fd), poll::pollfd_in(shutdown.raw())];
        if let Err(err) = poll::poll(&mut fds, -1) {
            error!("piper: poll failed: {}", err);
            return;
        }
        if poll::ready(&fds, shutdown.raw()) {
            break false;
        }
    };

    if eof {
        debug!("piper: input closed after {} bytes", off);
        let _ = write_entry(&scratch, timestamp, &mut woff, EOF_SENTINEL);
    }
}

fn write_entry(
    scratch: &Fd,
    timestamp: bool,
    woff: &mut u64,
    bytes: &[u8],
) -> io::Result<()> {
    let res = (|| {
        if timestamp {
            let stamp =
                format!("{}  ", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"));
            *woff += fd::pwrite_all(scratch.raw(), stamp.as_bytes(), *woff)? as u64;
        }
        *woff += fd::pwrite_all(scratch.raw(), bytes, *woff)? as u64;
        Ok(())
    })();
    if let Err(ref err) = res {
        error!("piper: unable to write to scratch file: {}", err);
    }
    res
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::Piper;
    use crate::fd::{self, Pipe};

    fn wait_finished(piper: &mut Piper) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !piper.is_finished() {
            assert!(Instant::now() < deadline, "piper did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn scratch_contents(piper: &Piper) -> Vec<u8> {
        let fd = piper.scratch_fd().unwrap();
        let size = piper.scratch_size().unwrap() as usize;
        let mut buf = vec![0; size];
        let mut read = 0;
        while read < size {
            let n = fd::pread(fd.raw(), &mut buf[read..], read as u64).unwrap();
            assert!(n > 0);
            read += n;
        }
        buf
    }

    #[test]
    fn partial_final_line_and_sentinel() {
        let pipe = Pipe::new().unwrap();
        let mut wtr = pipe.write.into_file();
        wtr.write_all(b"one\ntwo").unwrap();
        drop(wtr);

        let mut piper = Piper::new(pipe.read, false, None).unwrap();
        wait_finished(&mut piper);
        assert_eq!(scratch_contents(&piper), b"one\ntwo---- END-OF-STDIN ----".to_vec());
    }

    #[test]
    fn timestamps_prefix_every_entry() {
        let pipe = Pipe::new().unwrap();
        let mut wtr = pipe.write.into_file();
        wtr.write_all(b"hello\n").unwrap();
        drop(wtr);

        let mut piper = Piper::new(pipe.read, true, None).unwrap();
        wait_finished(&mut piper);
        let contents = String::from_utf8(scratch_contents(&piper)).unwrap();
        let stamp = r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}  ";
        let expected = format!(
            "^{stamp}hello\n{stamp}---- END-OF-STDIN ----$",
            stamp = stamp
        );
        assert!(
            regex::Regex::new(&expected).unwrap().is_match(&contents),
            "unexpected scratch contents: {:?}",
            contents
        );
    }

    #[test]
    fn named_scratch_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piper.out");
        let pipe = Pipe::new().unwrap();
        let mut wtr = pipe.write.into_file();
        wtr.write_all(b"line\n").unwrap();
        drop(wtr);

        let mut piper = Piper::new(pipe.read, false, Some(&path)).unwrap();
        wait_finished(&mut piper);
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"line\n---- END-OF-STDIN ----".to_vec()
        );
    }

    #[test]
    fn terminate_stops_a_live_stream() {
        let pipe = Pipe::new().unwrap();
        let mut wtr = pipe.write.into_file();
        wtr.write_all(b"early\n").unwrap();

        let mut piper = Piper::new(pipe.read, false, None).unwrap();
        // Give the worker a moment to commit the first line.
        let deadline = Instant::now() + Duration::from_secs(10);
        while piper.scratch_size().unwrap() == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        assert!(!piper.is_finished());
        piper.terminate();
        // No sentinel: the input never reached EOF.
        assert_eq!(scratch_contents(&piper), b"early\n".to_vec());
        drop(wtr);
    }

    #[test]
    fn seekable_inputs_are_copied_once() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"a\nb\n").unwrap();
        let mut piper = Piper::new(crate::fd::Fd::from_file(file), false, None).unwrap();
        wait_finished(&mut piper);
        assert_eq!(scratch_contents(&piper), b"a\nb\n---- END-OF-STDIN ----".to_vec());
    }
}
