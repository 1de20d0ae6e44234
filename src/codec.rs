//! Request/response framing shared by the polled device families.

use log::{debug, warn};

use crate::errors::Result;
use crate::link::Link;
use crate::retry::RetryPolicy;

/// One complete protocol unit whose integrity check passed.
///
/// Only codecs construct frames, and only after verification, so holding a
/// `Frame` is proof the bytes were intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: u8,
    payload: Vec<u8>,
    verified: bool,
}

impl Frame {
    pub(crate) fn verified(command: u8, payload: Vec<u8>) -> Self {
        Self {
            command,
            payload,
            verified: true,
        }
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Wire format of a request/response protocol.
pub trait FrameCodec {
    /// Serialize a request.
    fn encode(&self, command: u8, payload: &[u8]) -> Vec<u8>;

    /// Bytes to read before the total response length is known.
    fn prefix_len(&self, command: u8) -> usize;

    /// Total response length, given its first [`prefix_len`](Self::prefix_len) bytes.
    fn frame_len(&self, command: u8, prefix: &[u8]) -> Result<usize>;

    /// Check a complete response against the `outstanding` command.
    fn decode(&self, bytes: &[u8], outstanding: u8) -> Result<Frame>;
}

/// Send `command` and read back its verified response.
///
/// Stale input is drained first; a failed attempt runs `reset` (the family's
/// handshake) before the next one.
pub fn exchange<C, R>(
    link: &mut Link,
    codec: &C,
    policy: &RetryPolicy,
    command: u8,
    payload: &[u8],
    mut reset: R,
) -> Result<Frame>
where
    C: FrameCodec + ?Sized,
    R: FnMut(&mut Link) -> Result<()>,
{
    let clock = link.clock_handle();
    let cancel = link.cancel().clone();
    let request = codec.encode(command, payload);

    policy.run(clock.as_ref(), &cancel, |attempt| {
        if attempt > 0 {
            reset(link)?;
        }
        link.discard_input()?;
        link.send(&request)?;

        let mut bytes = link.receive_exact(codec.prefix_len(command))?;
        let total = codec.frame_len(command, &bytes)?;
        if total > bytes.len() {
            let rest = link.receive_exact(total - bytes.len())?;
            bytes.extend_from_slice(&rest);
        }

        match codec.decode(&bytes, command) {
            Ok(frame) => {
                debug!(
                    "exchange ok: command={:#04X}, payload_len={}",
                    command,
                    frame.payload().len()
                );
                Ok(frame)
            }
            Err(e) => {
                warn!("exchange rejected: command={:#04X}, error={}", command, e);
                Err(e)
            }
        }
    })
}

/// Reset handshake for packet protocols that need nothing beyond draining input.
pub fn drain_only(link: &mut Link) -> Result<()> {
    link.discard_input()
}
