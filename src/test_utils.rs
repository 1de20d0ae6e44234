//! Scripted transports and device simulators for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;

use crate::errors::{ConnectionError, DriverError, Result};
use crate::host_clock::{CancelToken, ManualClock};
use crate::link::Link;
use crate::transport::Transport;

pub fn clock_at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> ManualClock {
    ManualClock::new(
        NaiveDate::from_ymd_opt(year, month, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap(),
    )
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Transport whose replies are computed from each request by a closure.
pub struct MockTransport {
    responder: Responder,
    pending: VecDeque<u8>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: bool,
}

impl MockTransport {
    pub fn new(responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            pending: VecDeque::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Replies with exactly what was sent.
    pub fn echo() -> Self {
        Self::new(|request| request.to_vec())
    }

    /// Replays canned replies in order, one per request; silent once exhausted.
    pub fn scripted(replies: Vec<Vec<u8>>) -> Self {
        let mut replies: VecDeque<Vec<u8>> = replies.into();
        Self::new(move |_| replies.pop_front().unwrap_or_default())
    }

    /// Unsolicited bytes, as a streaming console would push them.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes);
    }

    /// Shared log of every request written.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.sent)
    }
}

impl Transport for MockTransport {
    fn send(&mut self, bytes: &[u8], _timeout: Duration) -> Result<()> {
        if self.closed {
            return Err(ConnectionError::Closed.into());
        }
        self.sent.lock().unwrap().push(bytes.to_vec());
        let reply = (self.responder)(bytes);
        self.pending.extend(reply);
        Ok(())
    }

    fn receive(&mut self, max_bytes: usize, _timeout: Duration) -> Result<Vec<u8>> {
        if self.closed {
            return Err(ConnectionError::Closed.into());
        }
        if self.pending.is_empty() {
            return Err(DriverError::Timeout("mock read".into()));
        }
        let n = max_bytes.min(self.pending.len());
        Ok(self.pending.drain(..n).collect())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn describe(&self) -> String {
        "mock".into()
    }
}

/// A link over `transport` driven by a manual clock.
pub fn mock_link(transport: MockTransport, clock: Arc<ManualClock>) -> Link {
    Link::new(
        Box::new(transport),
        Duration::from_millis(50),
        clock,
        CancelToken::new(),
    )
}

/// Flat memory behind a USB HID block-read console: every 8-byte
/// `A1 hi lo 20 ...` request is answered with 32 bytes from `addr`.
#[derive(Clone)]
pub struct HidMemory {
    pub bytes: Arc<Mutex<Vec<u8>>>,
}

impl HidMemory {
    pub fn new() -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; 0x10000])),
        }
    }

    pub fn write(&self, addr: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        for (i, b) in data.iter().enumerate() {
            bytes[(addr + i) % 0x10000] = *b;
        }
    }

    pub fn write_u16(&self, addr: usize, value: u16) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn transport(&self) -> MockTransport {
        let memory = self.clone();
        MockTransport::new(move |request| {
            if request.len() != 8 || request[0] != 0xA1 {
                return Vec::new();
            }
            let addr = usize::from(u16::from_be_bytes([request[1], request[2]]));
            let bytes = memory.bytes.lock().unwrap();
            (0..32).map(|i| bytes[(addr + i) % 0x10000]).collect()
        })
    }
}
