//! Scripted test doubles for the hardware, network, link and clock seams.
//! All of them append to a shared [`Journal`] so tests can assert on the
//! relative order of valve transitions, posts and sleeps.

use anyhow::{anyhow, bail, Result};
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;

use crate::clock::{Clock, TokioClock};
use crate::gpio::{Gpio, Level};
use crate::network::Network;
use crate::supervisor::Link;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Entry {
    Output(u8, Level),
    Fetch(String),
    Post(bool),
    NoAck(String),
    Join,
    Leave,
    Sleep(Duration),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Rc<RefCell<Vec<Entry>>>);

impl Journal {
    pub(crate) fn push(&self, entry: Entry) {
        self.0.borrow_mut().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<Entry> {
        self.0.borrow().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Entry) -> bool) -> usize {
        self.0.borrow().iter().filter(|e| pred(e)).count()
    }

    pub(crate) fn posts(&self) -> Vec<bool> {
        self.0
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Entry::Post(on) => Some(*on),
                _ => None,
            })
            .collect()
    }

    /// Sleeps longer than `min`, skipping actuator poll ticks.
    pub(crate) fn long_sleeps(&self, min: Duration) -> Vec<Duration> {
        self.0
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Entry::Sleep(d) if *d > min => Some(*d),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// GPIO
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct GpioState {
    outputs: HashSet<u8>,
    inputs: HashSet<u8>,
    /// Readings returned first, in order; `idle` once exhausted.
    script: VecDeque<Level>,
    idle: Level,
    reads: usize,
    fail_reads: bool,
}

pub(crate) struct MockGpio {
    state: Rc<RefCell<GpioState>>,
    journal: Journal,
    rejected: Option<u8>,
}

/// Read-side handle kept by the test after the mock moves into the actuator.
pub(crate) struct GpioLog {
    state: Rc<RefCell<GpioState>>,
    journal: Journal,
}

impl MockGpio {
    pub(crate) fn new(idle: Level) -> (Self, GpioLog) {
        Self::with_journal(idle, Journal::default())
    }

    pub(crate) fn with_journal(idle: Level, journal: Journal) -> (Self, GpioLog) {
        let state = Rc::new(RefCell::new(GpioState {
            outputs: HashSet::new(),
            inputs: HashSet::new(),
            script: VecDeque::new(),
            idle,
            reads: 0,
            fail_reads: false,
        }));
        let log = GpioLog {
            state: Rc::clone(&state),
            journal: journal.clone(),
        };
        (
            Self {
                state,
                journal,
                rejected: None,
            },
            log,
        )
    }

    pub(crate) fn script(&self, levels: &[Level]) {
        self.state.borrow_mut().script.extend(levels.iter().copied());
    }

    pub(crate) fn fail_reads(&self) {
        self.state.borrow_mut().fail_reads = true;
    }

    pub(crate) fn rejecting_pin(mut self, pin: u8) -> Self {
        self.rejected = Some(pin);
        self
    }
}

impl GpioLog {
    pub(crate) fn writes(&self, pin: u8) -> Vec<Level> {
        self.journal
            .entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Output(p, level) if p == pin => Some(level),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn reads(&self) -> usize {
        self.state.borrow().reads
    }

    pub(crate) fn script(&self, levels: &[Level]) {
        self.state.borrow_mut().script.extend(levels.iter().copied());
    }

    pub(crate) fn fail_reads(&self) {
        self.state.borrow_mut().fail_reads = true;
    }
}

impl Gpio for MockGpio {
    /// The configured level is journaled as the pin's first write.
    fn configure_output(&mut self, pin: u8, initial: Level) -> Result<()> {
        if self.rejected == Some(pin) {
            bail!("gpio {pin} unavailable");
        }
        self.state.borrow_mut().outputs.insert(pin);
        self.journal.push(Entry::Output(pin, initial));
        Ok(())
    }

    fn configure_input_pullup(&mut self, pin: u8) -> Result<()> {
        if self.rejected == Some(pin) {
            bail!("gpio {pin} unavailable");
        }
        self.state.borrow_mut().inputs.insert(pin);
        Ok(())
    }

    fn set_output(&mut self, pin: u8, level: Level) -> Result<()> {
        if !self.state.borrow().outputs.contains(&pin) {
            bail!("gpio {pin} is not configured as an output");
        }
        self.journal.push(Entry::Output(pin, level));
        Ok(())
    }

    fn read_input(&mut self, pin: u8) -> Result<Level> {
        let mut st = self.state.borrow_mut();
        if !st.inputs.contains(&pin) {
            bail!("gpio {pin} is not configured as an input");
        }
        if st.fail_reads {
            bail!("gpio {pin} read failed");
        }
        st.reads += 1;
        Ok(st.script.pop_front().unwrap_or(st.idle))
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct NetState {
    responses: VecDeque<Result<String, String>>,
    fail_posts: bool,
    fail_no_ack: bool,
}

#[derive(Clone)]
pub(crate) struct MockNetwork {
    state: Rc<RefCell<NetState>>,
    journal: Journal,
}

impl MockNetwork {
    pub(crate) fn new(journal: Journal) -> Self {
        Self {
            state: Rc::default(),
            journal,
        }
    }

    pub(crate) fn respond(&self, body: &str) -> &Self {
        self.state
            .borrow_mut()
            .responses
            .push_back(Ok(body.to_string()));
        self
    }

    pub(crate) fn respond_err(&self, msg: &str) -> &Self {
        self.state
            .borrow_mut()
            .responses
            .push_back(Err(msg.to_string()));
        self
    }

    pub(crate) fn fail_posts(&self) {
        self.state.borrow_mut().fail_posts = true;
    }

    pub(crate) fn fail_no_ack(&self) {
        self.state.borrow_mut().fail_no_ack = true;
    }
}

impl Network for MockNetwork {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.journal.push(Entry::Fetch(url.to_string()));
        match self.state.borrow_mut().responses.pop_front() {
            Some(Ok(body)) => Ok(body),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => bail!("no scripted response for {url}"),
        }
    }

    async fn post_status(&self, _url: &str, is_watering: bool) -> Result<()> {
        self.journal.push(Entry::Post(is_watering));
        if self.state.borrow().fail_posts {
            bail!("post refused");
        }
        Ok(())
    }

    async fn notify_no_ack(&self, url: &str) -> Result<()> {
        self.journal.push(Entry::NoAck(url.to_string()));
        if self.state.borrow().fail_no_ack {
            bail!("notify refused");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

pub(crate) struct MockLink {
    journal: Journal,
    failures_left: u32,
}

impl MockLink {
    pub(crate) fn new(journal: Journal) -> Self {
        Self {
            journal,
            failures_left: 0,
        }
    }

    pub(crate) fn failing_first(mut self, n: u32) -> Self {
        self.failures_left = n;
        self
    }

    pub(crate) fn heal(&mut self) {
        self.failures_left = 0;
    }
}

impl Link for MockLink {
    async fn join(&mut self) -> Result<()> {
        self.journal.push(Entry::Join);
        if self.failures_left > 0 {
            self.failures_left -= 1;
            bail!("association refused");
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.journal.push(Entry::Leave);
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Tokio clock that journals every sleep request.
#[derive(Clone)]
pub(crate) struct RecordingClock {
    journal: Journal,
}

impl RecordingClock {
    pub(crate) fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

impl Clock for RecordingClock {
    fn now(&self) -> Instant {
        TokioClock.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.journal.push(Entry::Sleep(duration));
        TokioClock.sleep(duration).await;
    }
}
