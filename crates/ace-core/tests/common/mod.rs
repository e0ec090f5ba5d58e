//! Shared test fixtures: an in-memory transport and device builders

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ace_core::config::AceConfig;
use ace_core::device::AceDevice;
use ace_core::notify::Notification;
use ace_core::protocol::{FrameDecoder, Packet, ProtocolError, Request, Transport};
use ace_core::scheduler::{ManualClock, TimerQueue};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver};

#[derive(Default)]
struct MockState {
    open: bool,
    open_calls: u32,
    /// Number of upcoming `open` calls that fail
    fail_opens: u32,
    fail_next_write: bool,
    fail_next_read: bool,
    written: Vec<u8>,
    incoming: VecDeque<u8>,
    /// Largest chunk handed out per `read_some`
    chunk: Option<usize>,
}

/// In-memory transport; clones share state so tests can inspect what the
/// device wrote and inject what it reads
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, bytes: &[u8]) {
        self.state.lock().unwrap().incoming.extend(bytes);
    }

    /// Queue a framed JSON response
    pub fn respond(&self, value: Value) {
        let payload = serde_json::to_vec(&value).unwrap();
        self.inject(&Packet::new(payload).to_bytes());
    }

    pub fn set_chunk(&self, chunk: usize) {
        self.state.lock().unwrap().chunk = Some(chunk);
    }

    pub fn fail_opens(&self, count: u32) {
        self.state.lock().unwrap().fail_opens = count;
    }

    pub fn fail_next_write(&self) {
        self.state.lock().unwrap().fail_next_write = true;
    }

    pub fn fail_next_read(&self) {
        self.state.lock().unwrap().fail_next_read = true;
    }

    pub fn open_calls(&self) -> u32 {
        self.state.lock().unwrap().open_calls
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().written)
    }

    /// Decode everything written since the last call
    pub fn take_requests(&self) -> Vec<Request> {
        let bytes = self.take_written();
        let mut decoder = FrameDecoder::new();
        decoder
            .feed(&bytes)
            .frames
            .into_iter()
            .map(|frame| serde_json::from_value(frame).unwrap())
            .collect()
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        state.open_calls += 1;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(ProtocolError::PortNotFound("/dev/ttyACM0".to_string()));
        }
        state.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(ProtocolError::NotConnected);
        }
        if state.fail_next_read {
            state.fail_next_read = false;
            return Err(ProtocolError::SerialError("device unplugged".to_string()));
        }
        let limit = state.chunk.unwrap_or(buf.len()).min(buf.len());
        let n = limit.min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(ProtocolError::NotConnected);
        }
        if state.fail_next_write {
            state.fail_next_write = false;
            return Err(ProtocolError::SerialError("write timeout".to_string()));
        }
        state.written.extend_from_slice(data);
        Ok(())
    }
}

pub type TestDevice = AceDevice<TimerQueue<ManualClock>>;

/// Device wired to a mock transport and manual clock
pub struct Harness {
    pub device: TestDevice,
    pub transport: MockTransport,
    pub clock: ManualClock,
    pub notifications: UnboundedReceiver<Notification>,
}

impl Harness {
    pub fn new(config: AceConfig) -> Self {
        let transport = MockTransport::new();
        let clock = ManualClock::new();
        let (tx, notifications) = mpsc::unbounded_channel();
        let device = AceDevice::new(
            config,
            Box::new(transport.clone()),
            Box::new(tx),
            TimerQueue::new(clock.clone()),
        )
        .unwrap();
        Self {
            device,
            transport,
            clock,
            notifications,
        }
    }

    /// Start and run the first supervise tick
    pub fn connected(config: AceConfig) -> Self {
        let mut harness = Self::new(config);
        harness.device.start();
        harness.device.run_due();
        assert!(harness.device.is_connected());
        harness
    }

    /// Advance time in 10 ms steps, running due events after each step
    pub fn advance(&mut self, by: Duration) {
        let step = Duration::from_millis(10);
        let mut elapsed = Duration::ZERO;
        while elapsed < by {
            let next = step.min(by - elapsed);
            self.clock.advance(next);
            self.device.run_due();
            elapsed += next;
        }
    }

    pub fn advance_ms(&mut self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            out.push(notification);
        }
        out
    }

    /// Answer every written request: `get_status` with `status`, everything
    /// else with an empty success
    pub fn answer_all(&mut self, status: &Value) -> Vec<Request> {
        let requests = self.transport.take_requests();
        for request in &requests {
            if request.method == "get_status" {
                self.transport
                    .respond(json!({"id": request.id, "code": 0, "msg": "success", "result": status}));
            } else {
                self.transport
                    .respond(json!({"id": request.id, "code": 0, "msg": "success", "result": {}}));
            }
        }
        requests
    }
}

/// Status result with the given device state, assist counter and ready slots
pub fn status_result(state: &str, assist_count: i64, ready: &[u8]) -> Value {
    let slots: Vec<Value> = (0..4u8)
        .map(|i| {
            json!({
                "index": i,
                "status": if ready.contains(&i) { "ready" } else { "empty" },
                "sku": "",
                "type": "PLA",
                "color": [0, 0, 0]
            })
        })
        .collect();
    json!({
        "status": state,
        "temp": 25,
        "feed_assist_count": assist_count,
        "slots": slots
    })
}
