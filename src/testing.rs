//! Test doubles shared by the unit tests: a scripted link, in-memory devices
//! and a deterministic stand-in for the SBC library.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::device::{AudioDevices, CaptureStream, PlaybackStream};
use crate::audio::transform::{SbcTransform, TransformProvider};
use crate::audio::SampleRate;
use crate::error::{BridgeError, BridgeResult};
use crate::link::Link;
use crate::stream::{StreamCounters, StreamTiming, WorkerContext};

/// Fast retry policy so worker tests finish in milliseconds.
pub fn test_timing() -> StreamTiming {
    StreamTiming {
        poll_timeout: Duration::from_millis(20),
        max_link_timeouts: 3,
        timeout_backoff: Duration::from_millis(1),
        write_backoff: Duration::from_millis(1),
        max_write_failures: 10,
        logged_write_failures: 3,
    }
}

pub fn context(link: Arc<MockLink>) -> WorkerContext {
    WorkerContext {
        link,
        running: Arc::new(AtomicBool::new(true)),
        counters: Arc::new(StreamCounters::default()),
        timing: test_timing(),
    }
}

/// Ordered record of link events across several links.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn record(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    Recv(usize),
    Send(usize),
    Poll,
    TakeError,
}

/// One scripted outcome of a non-empty receive.
#[derive(Debug, Clone)]
pub enum RecvStep {
    Data(Vec<u8>),
    Empty,
    Error(io::ErrorKind),
}

#[derive(Default)]
pub struct MockState {
    name: Option<(String, Journal)>,
    script: Mutex<VecDeque<RecvStep>>,
    send_failures: Mutex<VecDeque<(io::ErrorKind, usize)>>,
    accept_error: Mutex<Option<io::ErrorKind>>,
    pending_error: Mutex<Option<i32>>,
    ops: Mutex<Vec<LinkOp>>,
    sent: Mutex<Vec<Vec<u8>>>,
    send_log: Mutex<Vec<Vec<u8>>>,
    closes: AtomicUsize,
}

impl MockState {
    fn log(&self, op: LinkOp) {
        if let Some((name, journal)) = &self.name {
            let event = match &op {
                LinkOp::Recv(n) => format!("{}:recv:{}", name, n),
                LinkOp::Send(n) => format!("{}:send:{}", name, n),
                LinkOp::Poll => format!("{}:poll", name),
                LinkOp::TakeError => format!("{}:take_error", name),
            };
            journal.record(event);
        }
        self.ops.lock().unwrap().push(op);
    }

    pub fn script_recv(&self, steps: impl IntoIterator<Item = RecvStep>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// Fail the next `count` sends with `kind`, after any failures queued earlier.
    pub fn fail_sends(&self, kind: io::ErrorKind, count: usize) {
        self.send_failures.lock().unwrap().push_back((kind, count));
    }

    pub fn fail_accept(&self, kind: io::ErrorKind) {
        *self.accept_error.lock().unwrap() = Some(kind);
    }

    pub fn set_pending_error(&self, errno: i32) {
        *self.pending_error.lock().unwrap() = Some(errno);
    }

    pub fn ops(&self) -> Vec<LinkOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Packets that were accepted by the link.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Every packet a send was attempted with, failed or not.
    pub fn send_log(&self) -> Vec<Vec<u8>> {
        self.send_log.lock().unwrap().clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_log.lock().unwrap().len()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn wait_script_drained(&self) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !self.script.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "receive script not consumed");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn next_send_failure(&self) -> Option<io::ErrorKind> {
        let mut failures = self.send_failures.lock().unwrap();
        let (kind, remaining) = failures.front_mut()?;
        let kind = *kind;
        *remaining -= 1;
        if *remaining == 0 {
            failures.pop_front();
        }
        Some(kind)
    }
}

/// Scripted [`Link`]; records a close when dropped.
pub struct MockLink {
    state: Arc<MockState>,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    /// A link whose events also go to a shared journal, prefixed by `name`.
    pub fn named(name: &str, journal: Journal) -> Self {
        Self {
            state: Arc::new(MockState {
                name: Some((name.to_string(), journal)),
                ..MockState::default()
            }),
        }
    }

    /// A view of the link's state that outlives the link itself.
    pub fn observer(&self) -> LinkObserver {
        LinkObserver {
            state: self.state.clone(),
        }
    }
}

impl Deref for MockLink {
    type Target = MockState;

    fn deref(&self) -> &MockState {
        &self.state
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        if let Some((name, journal)) = &self.state.name {
            journal.record(format!("{}:close", name));
        }
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Link for MockLink {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.log(LinkOp::Recv(buf.len()));
        if buf.is_empty() {
            return match *self.accept_error.lock().unwrap() {
                Some(kind) => Err(kind.into()),
                None => Ok(0),
            };
        }

        match self.script.lock().unwrap().pop_front() {
            Some(RecvStep::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(RecvStep::Empty) => Ok(0),
            Some(RecvStep::Error(kind)) => Err(kind.into()),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.log(LinkOp::Send(buf.len()));
        self.send_log.lock().unwrap().push(buf.to_vec());
        if let Some(kind) = self.next_send_failure() {
            return Err(kind.into());
        }
        self.sent.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        self.log(LinkOp::Poll);
        if !self.script.lock().unwrap().is_empty() {
            return Ok(true);
        }
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(false)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.log(LinkOp::TakeError);
        Ok(self
            .pending_error
            .lock()
            .unwrap()
            .take()
            .map(io::Error::from_raw_os_error))
    }
}

pub struct LinkObserver {
    state: Arc<MockState>,
}

impl Deref for LinkObserver {
    type Target = MockState;

    fn deref(&self) -> &MockState {
        &self.state
    }
}

/// Playback sink keeping every write; can be created already closed.
#[derive(Clone, Default)]
pub struct MemorySink {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closed() -> Self {
        Self {
            closed: true,
            ..Self::default()
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.writes().concat()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.writes.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Capture source replaying fixed bytes, then either ending or idling.
pub struct ScriptedCapture {
    data: VecDeque<u8>,
    eof_after: bool,
}

impl ScriptedCapture {
    /// Replay `data`, then report end of stream (a device that exited).
    pub fn then_eof(data: Vec<u8>) -> Self {
        Self {
            data: data.into(),
            eof_after: true,
        }
    }

    /// Replay `data`, then deliver zeros at a slow pace like an idle microphone.
    pub fn then_quiet(data: Vec<u8>) -> Self {
        Self {
            data: data.into(),
            eof_after: false,
        }
    }
}

impl Read for ScriptedCapture {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.data.is_empty() {
            let n = buf.len().min(self.data.len());
            for (slot, byte) in buf.iter_mut().zip(self.data.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        if self.eof_after {
            return Ok(0);
        }
        thread::sleep(Duration::from_millis(2));
        buf.fill(0);
        Ok(buf.len())
    }
}

/// Devices living in memory: a recording sink and a quiet capture source.
pub struct MemoryDevices {
    sink: MemorySink,
    playback_available: bool,
}

impl MemoryDevices {
    pub fn new() -> Self {
        Self {
            sink: MemorySink::new(),
            playback_available: true,
        }
    }

    /// Playback cannot be opened at all.
    pub fn closed_playback() -> Self {
        Self {
            sink: MemorySink::new(),
            playback_available: false,
        }
    }
}

impl AudioDevices for MemoryDevices {
    fn open_playback(&self, _rate: SampleRate) -> io::Result<PlaybackStream> {
        if !self.playback_available {
            return Err(io::ErrorKind::NotFound.into());
        }
        Ok(Box::new(self.sink.clone()))
    }

    fn open_capture(&self, _rate: SampleRate) -> io::Result<CaptureStream> {
        Ok(Box::new(ScriptedCapture::then_quiet(Vec::new())))
    }
}

/// Deterministic stand-in for libsbc.
///
/// Encode keeps every 4th byte of a 240-byte chunk (57 of them); decode
/// repeats each payload byte 4 times and pads to 240 bytes.
pub struct FakeTransform {
    finished: Arc<AtomicUsize>,
    live: bool,
    fail_encode: bool,
}

const FAKE_CODESIZE: usize = 240;

impl FakeTransform {
    pub fn boxed() -> Box<dyn SbcTransform> {
        Self::tracked().0
    }

    pub fn failing_encode() -> Box<dyn SbcTransform> {
        Box::new(Self {
            finished: Arc::default(),
            live: true,
            fail_encode: true,
        })
    }

    /// Transform plus a counter of how often its state was finalised.
    pub fn tracked() -> (Box<dyn SbcTransform>, Arc<AtomicUsize>) {
        let finished = Arc::new(AtomicUsize::new(0));
        let transform = Box::new(Self {
            finished: finished.clone(),
            live: true,
            fail_encode: false,
        });
        (transform, finished)
    }
}

impl SbcTransform for FakeTransform {
    fn codesize(&self) -> usize {
        FAKE_CODESIZE
    }

    fn decode(&mut self, payload: &[u8]) -> BridgeResult<Vec<u8>> {
        let mut pcm: Vec<u8> = payload.iter().flat_map(|&b| [b; 4]).collect();
        pcm.resize(FAKE_CODESIZE, 0);
        Ok(pcm)
    }

    fn encode(&mut self, pcm: &[u8]) -> BridgeResult<Vec<u8>> {
        if self.fail_encode {
            return Err(BridgeError::Transform("encode disabled".into()));
        }
        Ok(pcm.iter().step_by(4).take(57).copied().collect())
    }

    fn finish(&mut self) {
        if self.live {
            self.live = false;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Provider handing out [`FakeTransform`]s and counting them.
#[derive(Default)]
pub struct FakeProvider {
    created: AtomicUsize,
}

impl FakeProvider {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransformProvider for FakeProvider {
    fn init_wideband(&self) -> BridgeResult<Box<dyn SbcTransform>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeTransform::boxed())
    }
}
