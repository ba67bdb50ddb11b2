use std::io;

/// Reason a connection is torn down. Carried inside `NetworkError::Fatal`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    /// Hard I/O error on the socket.
    Io,
    /// Orderly EOF (read returned 0). Fatal for the connection, but ingest
    /// treats it as a graceful publisher teardown.
    Closed,
    /// Unparseable HTTP request.
    BadRequest,
    /// Unparseable or unsupported container data (e.g. unknown-size Cluster).
    BadStream,
    /// The ingest accumulator hit its hard cap.
    ScratchOverflow,
}

/// The error plumbing shared by every resumable operation: `Wait` suspends
/// the state machine until the next poll readiness, `Fatal` disconnects.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetworkError::Wait,
            _ => NetworkError::Fatal(ErrorType::Io),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    /// True only for fatal errors; `Wait` is a suspension, not a failure.
    #[inline]
    fn has_failed(&self) -> bool {
        matches!(self, Err(NetworkError::Fatal(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);
    }

    #[test]
    fn test_hard_errors_fold_to_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(err, NetworkError::Fatal(ErrorType::Io));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetworkError>(()).has_failed());
        assert!(!Err::<(), _>(NetworkError::Wait).has_failed());
        assert!(Err::<(), _>(NetworkError::Fatal(ErrorType::Io)).has_failed());
    }
}
