use jsonrpsee::types::error::CallError;
use jsonrpsee::types::ErrorObjectOwned;

/// Stable client-facing error codes. Every daemon error maps onto one of
/// these before it crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    NotFound = 1,
    AlreadyExists = 2,
    InvalidArgument = 3,
    PermissionDenied = 4,
    FailedPrecondition = 5,
    Unavailable = 6,
    Internal = 7,
    DeadlineExceeded = 8,
    Canceled = 9,
}

/// A coded error with a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl From<ApiError> for ErrorObjectOwned {
    fn from(err: ApiError) -> Self {
        ErrorObjectOwned::owned(err.code as i32, err.message, None::<()>)
    }
}

impl From<ApiError> for jsonrpsee::core::Error {
    fn from(err: ApiError) -> Self {
        jsonrpsee::core::Error::Call(CallError::Custom(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::NotFound as i32, 1);
        assert_eq!(ErrorCode::PermissionDenied as i32, 4);
        assert_eq!(ErrorCode::Canceled as i32, 9);
    }

    #[test]
    fn converts_to_error_object() {
        let obj: ErrorObjectOwned = ApiError::not_found("devnet default/d1 not found").into();
        assert_eq!(obj.code(), 1);
        assert_eq!(obj.message(), "devnet default/d1 not found");
    }
}
