//! Common error types for MultiServe
//!
//! The variants here are the error *kinds* spec section 7 enumerates, not
//! one-off per-module variants. Each kind maps onto a gRPC status code via
//! `From<Error> for tonic::Status`, since the taxonomy was chosen to be
//! status-code-shaped even though the service layer that would expose it
//! over the wire is out of scope.

use thiserror::Error;

/// Main error type for MultiServe.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad config, shape mismatch, oversized batch dimension, or an unknown
    /// correlation ID on a non-start request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Model or version not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Queue full, GPU pool saturated, sequence capacity exhausted, or a
    /// subsystem used before it was initialized.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Backend framework error, or inconsistent internal state.
    #[error("internal error: {0}")]
    Internal(String),

    /// Double-init of a process-wide singleton (the GPU pool).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A request aged past its deadline before being dispatched.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The profiler exhausted its measurement trials without stabilizing.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Configuration load/parse/validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Error::AlreadyExists(msg.into())
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Error::DeadlineExceeded(msg.into())
    }

    pub fn timed_out(msg: impl Into<String>) -> Self {
        Error::TimedOut(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        use tonic::Code;
        let code = match &err {
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::NotFound(_) => Code::NotFound,
            Error::Unavailable(_) => Code::Unavailable,
            Error::Internal(_) => Code::Internal,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Error::TimedOut(_) => Code::DeadlineExceeded,
            Error::Config(_) => Code::FailedPrecondition,
            Error::Io(_) => Code::Internal,
        };
        tonic::Status::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_maps_to_matching_grpc_code() {
        let status: tonic::Status = Error::invalid_argument("bad shape").into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn already_exists_maps_to_matching_grpc_code() {
        let status: tonic::Status = Error::already_exists("gpu pool").into();
        assert_eq!(status.code(), tonic::Code::AlreadyExists);
    }
}
