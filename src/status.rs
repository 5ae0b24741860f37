//! gRPC status codes and terminal call status.

use crate::metadata::Metadata;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::fmt;

/// Bytes percent-encoded inside `grpc-message` trailer values. Everything
/// outside printable ASCII is escaped, plus the escape character itself.
const GRPC_MESSAGE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

/// gRPC status codes (distinct from HTTP status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Create a Code from its numeric value. Out-of-range values map to
    /// `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        write!(f, "{}", name)
    }
}

/// Terminal record of an RPC: code, human-readable details, and trailing
/// metadata. Constructed only at terminal points; immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    code: Code,
    details: String,
    metadata: Metadata,
}

impl Status {
    pub fn new(code: Code, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(code: Code, details: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            code,
            details: details.into(),
            metadata,
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub fn cancelled(details: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, details)
    }

    pub fn unknown(details: impl Into<String>) -> Self {
        Self::new(Code::Unknown, details)
    }

    pub fn invalid_argument(details: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, details)
    }

    pub fn deadline_exceeded(details: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, details)
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(Code::Internal, details)
    }

    pub fn unavailable(details: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, details)
    }

    /// Build a status from trailer metadata.
    ///
    /// `grpc-status` carries the decimal code (missing or malformed maps to
    /// `Unknown`), `grpc-message` the percent-encoded details. Remaining
    /// trailer entries become the status metadata.
    pub fn from_trailers(trailers: Metadata) -> Self {
        let code = trailers
            .get_str("grpc-status")
            .and_then(|s| s.parse::<u32>().ok())
            .map(Code::from_u32)
            .unwrap_or(Code::Unknown);

        let details = trailers
            .get_str("grpc-message")
            .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
            .unwrap_or_default();

        let mut metadata = trailers;
        metadata.remove("grpc-status");
        metadata.remove("grpc-message");

        Self {
            code,
            details,
            metadata,
        }
    }

    /// Render this status as trailer metadata, the inverse of
    /// [`Status::from_trailers`].
    pub fn to_trailers(&self) -> Metadata {
        let mut trailers = Metadata::new();
        // Keys and encoded values are always legal, so these cannot fail.
        let _ = trailers.set("grpc-status", self.code.as_u32().to_string());
        if !self.details.is_empty() {
            let encoded = utf8_percent_encode(&self.details, GRPC_MESSAGE_ESCAPES).to_string();
            let _ = trailers.set("grpc-message", encoded);
        }
        trailers.merge(self.metadata.clone());
        trailers
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if !self.details.is_empty() {
            write!(f, ": {}", self.details)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for i in 0..=16 {
            assert_eq!(Code::from_u32(i).as_u32(), i);
        }
        assert_eq!(Code::from_u32(999), Code::Unknown);
    }

    #[test]
    fn test_code_display() {
        assert_eq!(format!("{}", Code::Ok), "OK");
        assert_eq!(format!("{}", Code::DeadlineExceeded), "DEADLINE_EXCEEDED");
    }

    #[test]
    fn test_status_equality() {
        let mut md = Metadata::new();
        md.set("k", "v").unwrap();

        let a = Status::with_metadata(Code::NotFound, "missing", md.clone());
        let b = Status::with_metadata(Code::NotFound, "missing", md);
        let c = Status::new(Code::NotFound, "missing");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ok_is_sole_success() {
        assert!(Status::ok().is_ok());
        assert!(!Status::internal("boom").is_ok());
        assert!(!Status::cancelled("stop").is_ok());
    }

    #[test]
    fn test_from_trailers() {
        let mut trailers = Metadata::new();
        trailers.set("grpc-status", "5").unwrap();
        trailers.set("grpc-message", "resource%20not%20found").unwrap();
        trailers.set("x-extra", "kept").unwrap();

        let status = Status::from_trailers(trailers);
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.details(), "resource not found");
        assert_eq!(status.metadata().get_str("x-extra"), Some("kept"));
        assert!(!status.metadata().contains_key("grpc-status"));
    }

    #[test]
    fn test_from_trailers_missing_status() {
        let status = Status::from_trailers(Metadata::new());
        assert_eq!(status.code(), Code::Unknown);
        assert_eq!(status.details(), "");
    }

    #[test]
    fn test_from_trailers_malformed_status() {
        let mut trailers = Metadata::new();
        trailers.set("grpc-status", "not-a-number").unwrap();
        assert_eq!(Status::from_trailers(trailers).code(), Code::Unknown);
    }

    #[test]
    fn test_trailer_round_trip_with_encoding() {
        let mut md = Metadata::new();
        md.set("x-detail-bin", bytes::Bytes::from_static(b"\x01\x02")).unwrap();
        let status = Status::with_metadata(Code::Internal, "bad news: 100%", md);

        let trailers = status.to_trailers();
        assert!(trailers.get_str("grpc-message").unwrap().contains("100%25"));

        let back = Status::from_trailers(trailers);
        assert_eq!(back, status);
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::new(Code::Internal, "boom").to_string(), "INTERNAL: boom");
        assert_eq!(Status::ok().to_string(), "OK");
    }
}
