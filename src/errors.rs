use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("checksum mismatch (expected {expected:#04X}, received {received:#04X})")]
    ChecksumMismatch { expected: u8, received: u8 },
    #[error("short frame: declared {declared} bytes, received {received}")]
    ShortFrame { declared: usize, received: usize },
    #[error("unknown or unexpected command {0:#04X}")]
    UnknownCommand(u8),
    #[error("unknown sensor tag {0:#04X}")]
    UnknownSensor(u8),
    #[error(
        "acknowledge mismatch at step {step} (expected {expected:#04X}, received {received:#04X})"
    )]
    AckMismatch { step: usize, expected: u8, received: u8 },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("clock synchronisation failed: {0}")]
    ClockSync(String),
    #[error("write pointer moved during read ({previous:#06X} -> {current:#06X})")]
    AddressPointerDrift { previous: u16, current: u16 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("record sink failed: {0}")]
    Sink(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("session worker panicked")]
    WorkerPanicked,
}

impl DriverError {
    /// Whether a bounded retry (with the family's reset handshake in between)
    /// may clear this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::Timeout(_)
            | DriverError::ChecksumMismatch { .. }
            | DriverError::ShortFrame { .. }
            | DriverError::UnknownCommand(_)
            | DriverError::AckMismatch { .. }
            | DriverError::AddressPointerDrift { .. } => true,
            DriverError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::UnexpectedEof
            ),
            DriverError::Serial(e) => matches!(e.kind(), serialport::ErrorKind::Io(_)),
            _ => false,
        }
    }

    /// Errors that indicate the transport itself is gone and must be reopened.
    pub fn is_link_fault(&self) -> bool {
        match self {
            DriverError::Connection(_) | DriverError::Serial(_) => true,
            DriverError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::NotFound
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("device not found: {what}")]
    NotFound { what: String },
    #[error("could not open {target}: {reason}")]
    Open { target: String, reason: String },
    #[error("transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DriverError::Timeout("read".into()).is_retryable());
        assert!(DriverError::ChecksumMismatch {
            expected: 1,
            received: 2
        }
        .is_retryable());
        assert!(DriverError::Io(io::Error::new(io::ErrorKind::TimedOut, "t")).is_retryable());
        assert!(!DriverError::Cancelled.is_retryable());
        assert!(!DriverError::Config("bad".into()).is_retryable());
        assert!(!DriverError::OutOfRange {
            field: "humidity",
            value: 120.0
        }
        .is_retryable());
    }

    #[test]
    fn test_link_fault_classification() {
        assert!(DriverError::Connection(ConnectionError::Closed).is_link_fault());
        assert!(
            DriverError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).is_link_fault()
        );
        assert!(!DriverError::Timeout("read".into()).is_link_fault());
    }

    #[test]
    fn test_display() {
        let e = DriverError::ShortFrame {
            declared: 5,
            received: 4,
        };
        assert_eq!("short frame: declared 5 bytes, received 4", e.to_string());
        let e = DriverError::ChecksumMismatch {
            expected: 0x2A,
            received: 0x2B,
        };
        assert_eq!(
            "checksum mismatch (expected 0x2A, received 0x2B)",
            e.to_string()
        );
    }
}
