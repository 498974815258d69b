/*!
Shared scaffolding for driving a `GrepWorker` end to end: an in-memory
line source, a sink that records every event, and a poll loop that runs
the worker to completion the way a host event loop would.
*/

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tailgrep::poll;
use tailgrep::{GrepSink, GrepSource, GrepWorker};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Begin,
    Match(u64, usize, usize),
    Capture(u64, i64, i64, Option<Vec<u8>>),
    MatchEnd(u64),
    End,
}

/// A growable, thread-safe source of lines.
pub struct VecSource {
    lines: Mutex<Vec<Vec<u8>>>,
}

impl VecSource {
    pub fn from_text(text: &str) -> Arc<VecSource> {
        Arc::new(VecSource {
            lines: Mutex::new(
                text.lines().map(|line| line.as_bytes().to_vec()).collect(),
            ),
        })
    }

    pub fn push_line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.as_bytes().to_vec());
    }
}

impl GrepSource for VecSource {
    fn value_for_line(&self, line: u64, value_out: &mut Vec<u8>) -> bool {
        match self.lines.lock().unwrap().get(line as usize) {
            Some(value) => {
                value_out.extend_from_slice(value);
                true
            }
            None => false,
        }
    }
}

/// An endless source, for exercising cancellation mid-scan.
pub struct EndlessSource;

impl GrepSource for EndlessSource {
    fn value_for_line(&self, line: u64, value_out: &mut Vec<u8>) -> bool {
        value_out.extend_from_slice(format!("synthetic line {}", line).as_bytes());
        true
    }
}

/// Sink that appends every callback to a shared event log.
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingSink {
    pub fn new() -> (RecordingSink, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(vec![]));
        (RecordingSink { events: events.clone() }, events)
    }
}

impl GrepSink for RecordingSink {
    fn grep_begin(&mut self) {
        self.events.lock().unwrap().push(Event::Begin);
    }

    fn grep_match(&mut self, line: u64, start: usize, end: usize) {
        self.events.lock().unwrap().push(Event::Match(line, start, end));
    }

    fn grep_capture(&mut self, line: u64, start: i64, end: i64, capture: Option<&[u8]>) {
        self.events.lock().unwrap().push(Event::Capture(
            line,
            start,
            end,
            capture.map(|bytes| bytes.to_vec()),
        ));
    }

    fn grep_match_end(&mut self, line: u64) {
        self.events.lock().unwrap().push(Event::MatchEnd(line));
    }

    fn grep_end(&mut self) {
        self.events.lock().unwrap().push(Event::End);
    }
}

fn count_ends(events: &Arc<Mutex<Vec<Event>>>) -> usize {
    events.lock().unwrap().iter().filter(|e| **e == Event::End).count()
}

/// Poll and dispatch until one more `End` event arrives.
pub fn drive(worker: &mut GrepWorker, events: &Arc<Mutex<Vec<Event>>>) {
    let before = count_ends(events);
    let deadline = Instant::now() + Duration::from_secs(10);
    while count_ends(events) == before {
        assert!(Instant::now() < deadline, "grep worker made no progress");
        let mut fds = vec![];
        worker.register_poll(&mut fds);
        if fds.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        poll::poll(&mut fds, 100).unwrap();
        worker.check_poll_set(&fds);
    }
}

/// The `Match`/`MatchEnd` events, in arrival order.
pub fn match_events(events: &Arc<Mutex<Vec<Event>>>) -> Vec<Event> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| match e {
            Event::Match(..) | Event::MatchEnd(..) => true,
            _ => false,
        })
        .cloned()
        .collect()
}
