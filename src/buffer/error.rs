use crate::event::MergeError;
use crate::transport::TransportError;
use std::time::Duration;

/// Error type for buffer operations
#[derive(Debug)]
pub enum BufferError {
    /// The processing task is gone; nothing can be submitted
    Closed,
    /// At least one send failed during a flush
    Flush {
        failed: usize,
        attempted: usize,
        source: TransportError,
    },
    /// Merge fault. Fatal when raised by the processing task; a decrement
    /// by `i64::MIN` is refused with it before submission.
    Merge(MergeError),
    /// Closing the transport failed
    Transport(TransportError),
    /// The final flush did not answer in time
    CloseTimeout(Duration),
}

impl std::fmt::Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferError::Closed => write!(f, "metrics buffer is closed"),
            BufferError::Flush {
                failed,
                attempted,
                source,
            } => write!(
                f,
                "flush failed for {} of {} metrics: {}",
                failed, attempted, source
            ),
            BufferError::Merge(e) => write!(f, "metrics buffer fault: {}", e),
            BufferError::Transport(e) => write!(f, "closing transport failed: {}", e),
            BufferError::CloseTimeout(d) => {
                write!(f, "final flush did not complete within {:?}", d)
            }
        }
    }
}

impl std::error::Error for BufferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BufferError::Flush { source, .. } => Some(source),
            BufferError::Merge(e) => Some(e),
            BufferError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MergeError> for BufferError {
    fn from(e: MergeError) -> Self {
        BufferError::Merge(e)
    }
}
