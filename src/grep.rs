/*!
A "grep" that runs out-of-band from the caller's event loop so that
searching a large source never stalls user interaction. The worker
pulls lines from a [`GrepSource`] delegate, matches a compiled pattern
against each, and streams framed match records over a pipe channel back
to the host, which dispatches them to a [`GrepSink`] from its poll
loop.

The original design forks a child process for isolation; here the
worker is an OS thread joined to the host by real `pipe(2)` channels,
which preserves the on-wire framing and shares none of the matcher's
mutable state with the host.
*/

use std::collections::VecDeque;
use std::io::{self, BufWriter, Write};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};
use regex::bytes::{Regex, RegexBuilder};

use crate::fd::{self, Fd, Pipe};
use crate::line_buffer::LineBuffer;
use crate::poll;
use crate::wire::{self, Record, RecordWriter};
use crate::{Error, Result};

/// How many record lines one `check_poll_set` call will dispatch before
/// yielding back to the event loop.
const MAX_DISPATCH_LINES: usize = 100;

/// The worker flushes its output channel every this many source lines
/// so the host observes progress on long scans.
const FLUSH_LINE_INTERVAL: u64 = 10_000;

/// Messages on the worker's error channel carry this prefix.
const ERROR_PREFIX: &str = ": ";

/// Data source for lines to be searched by a `GrepWorker`.
///
/// The delegate is shared with the worker thread, so implementations
/// synchronize interior state themselves.
pub trait GrepSource: Send + Sync {
    /// Append the value of line `line` to `value_out`. Returning false
    /// means the line is unavailable, which ends the current scan
    /// request.
    fn value_for_line(&self, line: u64, value_out: &mut Vec<u8>) -> bool;
}

/// Sink for match events produced by a `GrepWorker`.
pub trait GrepSink {
    /// Called at the start of a new grep run.
    fn grep_begin(&mut self) {}

    /// A match was found on `line` between `[start, end)`.
    fn grep_match(&mut self, line: u64, start: usize, end: usize);

    /// One captured group of the current match. A non-participating
    /// capture is reported with negative offsets and no bytes.
    fn grep_capture(
        &mut self,
        _line: u64,
        _start: i64,
        _end: i64,
        _capture: Option<&[u8]>,
    ) {
    }

    /// Closes out the captures of one match on `line`.
    fn grep_match_end(&mut self, _line: u64) {}

    /// Called after each batch of dispatched records; a pacing point
    /// for display refresh, not a semantic boundary.
    fn grep_end_batch(&mut self) {}

    /// Called when the worker has finished all queued work. This is the
    /// only guaranteed completion signal.
    fn grep_end(&mut self) {}
}

/// Delegate for out-of-band error messages from a `GrepWorker`.
pub trait GrepControl {
    /// `msg` describes an error encountered while attempting the grep.
    fn grep_error(&mut self, _msg: &str) {}
}

/// Builder for the compiled pattern a worker runs.
///
/// The pattern is matched against raw line bytes, so the `regex` crate
/// is used in its `bytes` flavor with Unicode enabled.
#[derive(Clone, Debug)]
pub struct GrepBuilder {
    pattern: String,
    case_insensitive: bool,
    size_limit: usize,
}

impl GrepBuilder {
    /// Create a new builder for the regex `pattern`.
    pub fn new(pattern: &str) -> GrepBuilder {
        GrepBuilder {
            pattern: pattern.to_string(),
            case_insensitive: false,
            size_limit: 10 * (1 << 20),
        }
    }

    /// Set the case insensitive flag (`i`) on the regex.
    pub fn case_insensitive(mut self, yes: bool) -> GrepBuilder {
        self.case_insensitive = yes;
        self
    }

    /// Set the approximate size limit of the compiled program.
    pub fn size_limit(mut self, limit: usize) -> GrepBuilder {
        self.size_limit = limit;
        self
    }

    /// Compile the pattern.
    pub fn build(self) -> Result<Regex> {
        RegexBuilder::new(&self.pattern)
            .case_insensitive(self.case_insensitive)
            .size_limit(self.size_limit)
            .build()
            .map_err(Error::from)
    }
}

/// Observable lifecycle state of a `GrepWorker`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrepState {
    /// No child running, nothing queued.
    Idle,
    /// Requests queued, child not yet started.
    Queued,
    /// The child is scanning.
    Running,
    /// The child's output channel reached EOF but buffered records are
    /// still being dispatched.
    Draining,
    /// The child is being torn down by `invalidate`.
    Terminated,
}

struct Child {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// The out-of-band pattern matcher.
///
/// Requests are queued with `queue_request` and run by `start`. The
/// host registers the worker's channels in its poll set and calls
/// `check_poll_set` on readiness; match events come back through the
/// installed sink.
pub struct GrepWorker {
    pattern: Regex,
    source: Arc<dyn GrepSource>,
    queue: VecDeque<(i64, i64)>,

    child: Option<Child>,
    child_started: bool,
    out_buffer: LineBuffer,
    pipe_offset: u64,
    err_fd: Option<Fd>,

    /// The last line a child actually fed to the matcher, `-1` before
    /// any scan. Tail-follow requests resume just past it.
    highest_line: i64,
    /// The line number of the records currently being dispatched.
    last_line: u64,

    sink: Option<Box<dyn GrepSink>>,
    control: Option<Box<dyn GrepControl>>,
    state: GrepState,
}

impl GrepWorker {
    /// Create a worker that matches `pattern` against lines from
    /// `source`. Fails if the pattern does not compile; nothing runs
    /// until requests are queued and `start` is called.
    pub fn new(pattern: &str, source: Arc<dyn GrepSource>) -> Result<GrepWorker> {
        Ok(GrepWorker::with_pattern(GrepBuilder::new(pattern).build()?, source))
    }

    /// Create a worker from an already-compiled pattern.
    pub fn with_pattern(pattern: Regex, source: Arc<dyn GrepSource>) -> GrepWorker {
        GrepWorker {
            pattern,
            source,
            queue: VecDeque::new(),
            child: None,
            child_started: false,
            out_buffer: LineBuffer::new(),
            pipe_offset: 0,
            err_fd: None,
            highest_line: -1,
            last_line: 0,
            sink: None,
            control: None,
            state: GrepState::Idle,
        }
    }

    /// The source pattern of the compiled regex.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn state(&self) -> GrepState {
        self.state
    }

    /// Install or replace the match-event sink. The new sink is
    /// immediately told that a fresh run begins.
    pub fn set_sink(&mut self, sink: Box<dyn GrepSink>) {
        self.sink = Some(sink);
        if let Some(ref mut sink) = self.sink {
            sink.grep_begin();
        }
    }

    /// Install or replace the error delegate.
    pub fn set_control(&mut self, control: Box<dyn GrepControl>) {
        self.control = Some(control);
    }

    /// Queue a request to search line numbers `[start, stop)`.
    ///
    /// `start == -1` resumes from past the highest line this worker has
    /// scanned (and requires `stop == -1`); `stop == -1` scans to the
    /// end of the source.
    pub fn queue_request(&mut self, start: i64, stop: i64) {
        assert!(start != -1 || stop == -1);
        assert!(start >= -1 && stop >= -1);
        assert!(stop == -1 || start < stop);
        self.queue.push_back((start, stop));
        if self.state == GrepState::Idle {
            self.state = GrepState::Queued;
        }
    }

    /// Spawn the child if it is not already running and work is queued.
    /// Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.child_started || self.queue.is_empty() {
            return Ok(());
        }

        let out = Pipe::new()?;
        let err = Pipe::new()?;
        out.read.set_nonblocking()?;
        out.read.set_cloexec()?;
        err.read.set_nonblocking()?;
        err.read.set_cloexec()?;

        let stop = Arc::new(AtomicBool::new(false));
        let task = ChildTask {
            pattern: self.pattern.clone(),
            source: self.source.clone(),
            queue: mem::replace(&mut self.queue, VecDeque::new()),
            highest_line: self.highest_line,
            stop: stop.clone(),
            out: out.write.into_file(),
            err: err.write.into_file(),
        };
        let handle = thread::Builder::new()
            .name("grep-worker".to_string())
            .spawn(move || task.run())?;

        self.out_buffer.attach(out.read)?;
        self.pipe_offset = 0;
        self.err_fd = Some(err.read);
        self.child = Some(Child { handle, stop });
        self.child_started = true;
        self.state = GrepState::Running;
        debug!("grep worker started for pattern {:?}", self.pattern.as_str());

        if let Some(ref mut sink) = self.sink {
            sink.grep_begin();
        }
        Ok(())
    }

    /// Register the worker's channels for readability polling.
    pub fn register_poll(&self, pollfds: &mut Vec<libc::pollfd>) {
        if let Some(fd) = self.out_buffer.fd() {
            pollfds.push(poll::pollfd_in(fd));
        }
        if let Some(ref err) = self.err_fd {
            pollfds.push(poll::pollfd_in(err.raw()));
        }
    }

    /// Process any channels the poll set reports readable, dispatching
    /// at most a bounded number of records so the host loop stays
    /// responsive.
    pub fn check_poll_set(&mut self, pollfds: &[libc::pollfd]) {
        self.check_error_channel(pollfds);

        let out_fd = match self.out_buffer.fd() {
            Some(fd) => fd,
            None => return,
        };
        if !poll::ready(pollfds, out_fd) {
            return;
        }

        let mut record = Vec::new();
        let mut dispatched = 0;
        while dispatched < MAX_DISPATCH_LINES {
            record.clear();
            match self.out_buffer.read_line(&mut self.pipe_offset, false) {
                Ok(Some(lv)) => record.extend_from_slice(lv.bytes()),
                Ok(None) => break,
                Err(err) => {
                    error!("grep worker: output channel failed: {}", err);
                    self.cleanup();
                    return;
                }
            }
            self.dispatch_record(&record);
            dispatched += 1;
        }

        if let Some(ref mut sink) = self.sink {
            sink.grep_end_batch();
        }

        if self.out_buffer.is_pipe_closed() {
            if Some(self.pipe_offset) == self.out_buffer.stream_size() {
                self.cleanup();
            } else {
                // EOF seen but buffered records remain for later calls.
                self.state = GrepState::Draining;
            }
        }
    }

    /// Forcibly terminate any running child, drop queued work and reset
    /// the channel state. Synchronous: does not return until the child
    /// is reaped. The worker is reusable afterwards; the high-water
    /// mark survives, so a later tail-follow request still resumes past
    /// everything already reported.
    pub fn invalidate(&mut self) {
        self.state = GrepState::Terminated;
        self.queue.clear();
        self.reap_child();
        self.out_buffer.reset();
        self.err_fd = None;
        self.pipe_offset = 0;
        self.child_started = false;
        if let Some(ref mut sink) = self.sink {
            sink.grep_end();
        }
        self.state = GrepState::Idle;
    }

    /// Tear down after the child has drained its output; restart if new
    /// requests were queued while it ran.
    fn cleanup(&mut self) {
        self.reap_child();
        self.out_buffer.reset();
        self.err_fd = None;
        self.pipe_offset = 0;
        self.child_started = false;
        self.state = GrepState::Idle;
        if let Some(ref mut sink) = self.sink {
            sink.grep_end();
        }
        if !self.queue.is_empty() {
            self.state = GrepState::Queued;
            if let Err(err) = self.start() {
                error!("grep worker: unable to restart: {}", err);
            }
        }
    }

    fn reap_child(&mut self) {
        if let Some(child) = self.child.take() {
            child.stop.store(true, Ordering::SeqCst);
            // Closing our ends of the channels unblocks any pending
            // write in the child.
            self.out_buffer.reset();
            self.err_fd = None;
            let result = child.handle.join();
            debug_assert!(result.is_ok(), "grep worker thread panicked");
            if result.is_err() {
                error!("grep worker thread panicked");
                if let Some(ref mut control) = self.control {
                    control.grep_error("grep worker thread panicked");
                }
            }
        }
    }

    fn check_error_channel(&mut self, pollfds: &[libc::pollfd]) {
        let ready = match self.err_fd {
            Some(ref err) => poll::ready(pollfds, err.raw()),
            None => false,
        };
        if !ready {
            return;
        }
        let err_fd = self.err_fd.as_ref().unwrap().raw();
        let mut buf = [0u8; 1024];
        match fd::read(err_fd, &mut buf) {
            Ok(0) => {
                self.err_fd = None;
            }
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                if let Some(msg) = text.strip_prefix(ERROR_PREFIX) {
                    let msg = msg.lines().next().unwrap_or("");
                    if let Some(ref mut control) = self.control {
                        control.grep_error(msg);
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!("grep worker: error channel failed: {}", err);
                self.err_fd = None;
            }
        }
    }

    fn dispatch_record(&mut self, line: &[u8]) {
        match wire::parse(line) {
            Some(Record::HighWater(h)) => {
                self.highest_line = h;
            }
            Some(Record::Line(n)) => {
                self.last_line = n;
            }
            Some(Record::Match { start, end }) => {
                if let Some(ref mut sink) = self.sink {
                    sink.grep_match(self.last_line, start, end);
                }
            }
            Some(Record::Capture { start, end, bytes }) => {
                if let Some(ref mut sink) = self.sink {
                    sink.grep_capture(self.last_line, start, end, bytes);
                }
            }
            Some(Record::MatchEnd) => {
                if let Some(ref mut sink) = self.sink {
                    sink.grep_match_end(self.last_line);
                }
            }
            None => {
                warn!("bad line from grep child -- {:?}", line);
                if let Some(ref mut control) = self.control {
                    control.grep_error(&format!(
                        "unrecognized record from grep child: {}",
                        String::from_utf8_lossy(line)
                    ));
                }
            }
        }
    }
}

impl Drop for GrepWorker {
    fn drop(&mut self) {
        self.queue.clear();
        self.reap_child();
    }
}

/// Everything the worker thread owns. Nothing here is shared with the
/// host except the source delegate and the stop flag.
struct ChildTask {
    pattern: Regex,
    source: Arc<dyn GrepSource>,
    queue: VecDeque<(i64, i64)>,
    highest_line: i64,
    stop: Arc<AtomicBool>,
    out: std::fs::File,
    err: std::fs::File,
}

impl ChildTask {
    fn run(self) {
        let ChildTask { pattern, source, mut queue, highest_line, stop, out, mut err } =
            self;
        let mut wtr = RecordWriter::new(BufWriter::with_capacity(16 * 1024, out));
        let mut value = Vec::with_capacity(16 * 1024);
        let mut highest = highest_line;

        while let Some((start, stop_line)) = queue.pop_front() {
            let mut line = if start == -1 { (highest + 1) as u64 } else { start as u64 };
            let scan_to_eof = stop_line == -1;
            loop {
                if !scan_to_eof && line >= stop_line as u64 {
                    break;
                }
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                value.clear();
                if !source.value_for_line(line, &mut value) {
                    break;
                }
                if match_line(&pattern, &mut wtr, line, &value).is_err() {
                    report_write_error(&mut err);
                    return;
                }
                highest = line as i64;
                line += 1;
                if line % FLUSH_LINE_INTERVAL == 0 && wtr.flush().is_err() {
                    report_write_error(&mut err);
                    return;
                }
            }
            if scan_to_eof && wtr.high_water(highest).is_err() {
                report_write_error(&mut err);
                return;
            }
            if wtr.flush().is_err() {
                report_write_error(&mut err);
                return;
            }
        }
        // Dropping the writer closes the channel; the host sees EOF.
    }
}

fn report_write_error(err: &mut std::fs::File) {
    let _ = write!(err, "{}unable to write match records\n", ERROR_PREFIX);
}

/// Match the pattern repeatedly against one line, emitting the framed
/// records for every non-overlapping match.
fn match_line<W: Write>(
    pattern: &Regex,
    wtr: &mut RecordWriter<W>,
    line: u64,
    value: &[u8],
) -> io::Result<()> {
    let mut locs = pattern.capture_locations();
    let mut at = 0;
    let mut first = true;
    while at <= value.len() {
        let m = match pattern.captures_read_at(&mut locs, value, at) {
            None => break,
            Some(m) => m,
        };
        if first {
            wtr.line(line)?;
            first = false;
        }
        wtr.matched(m.start(), m.end())?;
        for i in 1..locs.len() {
            match locs.get(i) {
                Some((s, e)) => wtr.capture(Some((s, e)), &value[s..e])?,
                None => wtr.capture(None, b"")?,
            }
        }
        wtr.match_end()?;
        // An empty match must not stall the cursor.
        at = if m.end() == m.start() { m.end() + 1 } else { m.end() };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{match_line, GrepBuilder};
    use crate::wire::RecordWriter;
    use crate::Error;

    fn run_line(pattern: &str, line: u64, value: &[u8]) -> Vec<u8> {
        let re = GrepBuilder::new(pattern).build().unwrap();
        let mut wtr = RecordWriter::new(vec![]);
        match_line(&re, &mut wtr, line, value).unwrap();
        wtr.into_inner()
    }

    #[test]
    fn invalid_patterns_fail_at_build_time() {
        match GrepBuilder::new("(unclosed").build() {
            Err(Error::InvalidPattern(_)) => {}
            _ => panic!("expected InvalidPattern"),
        }
    }

    #[test]
    fn case_insensitive_matching() {
        let re = GrepBuilder::new("error")
            .case_insensitive(true)
            .build()
            .unwrap();
        assert!(re.is_match(b"ERROR: oops"));
    }

    #[test]
    fn the_line_number_is_emitted_once_per_line() {
        assert_eq!(run_line("a", 0, b"alpha"), b"0\n[0:1]\n/\n[4:5]\n/\n".to_vec());
        assert_eq!(run_line("a", 1, b"beta"), b"1\n[3:4]\n/\n".to_vec());
    }

    #[test]
    fn non_matching_lines_emit_nothing() {
        assert_eq!(run_line("z", 7, b"alpha"), b"".to_vec());
    }

    #[test]
    fn captures_carry_their_bytes() {
        assert_eq!(
            run_line(r"(\d{4})-(\d{2})", 2, b"on 2024-01 we shipped"),
            b"2\n[3:10]\n(3:7)2024\n(8:10)01\n/\n".to_vec()
        );
    }

    #[test]
    fn non_participating_captures_are_negative() {
        assert_eq!(
            run_line(r"(a)|(b)", 0, b"b"),
            b"0\n[0:1]\n(-1:-1)\n(0:1)b\n/\n".to_vec()
        );
    }

    #[test]
    fn empty_matches_advance() {
        // One empty match at every position, including the end.
        assert_eq!(
            run_line("x*", 0, b"ab"),
            b"0\n[0:0]\n/\n[1:1]\n/\n[2:2]\n/\n".to_vec()
        );
    }
}
