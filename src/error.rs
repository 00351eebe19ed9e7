// MIT License - Copyright (c) 2021 TJForc
// Error taxonomy

use std::fmt;

/// BACnet error classes the hub reports in Error PDUs.
pub mod error_class {
    pub const DEVICE: u32 = 0;
    pub const OBJECT: u32 = 1;
    pub const PROPERTY: u32 = 2;
    pub const RESOURCES: u32 = 3;
    pub const SECURITY: u32 = 4;
    pub const SERVICES: u32 = 5;
    pub const VT: u32 = 6;
    pub const COMMUNICATION: u32 = 7;
}

/// The error codes this bridge cares about. Anything else is shown numerically.
pub mod error_code {
    pub const OTHER: u32 = 0;
    pub const CONFIGURATION_IN_PROGRESS: u32 = 2;
    pub const DEVICE_BUSY: u32 = 3;
    pub const INCONSISTENT_PARAMETERS: u32 = 7;
    pub const INVALID_DATA_TYPE: u32 = 9;
    pub const MISSING_REQUIRED_PARAMETER: u32 = 16;
    pub const SERVICE_REQUEST_DENIED: u32 = 29;
    pub const UNKNOWN_OBJECT: u32 = 31;
    pub const UNKNOWN_PROPERTY: u32 = 32;
    pub const VALUE_OUT_OF_RANGE: u32 = 37;
    pub const WRITE_ACCESS_DENIED: u32 = 40;
    pub const READ_ACCESS_DENIED: u32 = 27;
}

/// Why the hub refused a confirmed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// Error PDU with an error class and code
    Error { class: u32, code: u32 },
    /// Reject PDU (malformed or unsupported request)
    Reject { reason: u8 },
    /// Abort PDU (transaction abandoned by the hub)
    Abort { reason: u8 },
}

impl Rejection {
    /// Whether the rejection means the service itself is not available,
    /// as opposed to a problem with one object or property.
    pub fn is_service_unsupported(&self) -> bool {
        match self {
            Self::Error { class, code } => {
                *class == error_class::SERVICES
                    || *code == error_code::SERVICE_REQUEST_DENIED
            }
            // unrecognized-service, unrecognized/other reject reasons
            Self::Reject { .. } => true,
            // buffer-overflow, segmentation-not-supported, apdu-too-long
            Self::Abort { reason } => matches!(reason, 1 | 4 | 11),
        }
    }

    /// Whether the rejection only concerns a missing object or property.
    pub fn is_unknown_point(&self) -> bool {
        matches!(
            self,
            Self::Error { code, .. }
                if *code == error_code::UNKNOWN_OBJECT || *code == error_code::UNKNOWN_PROPERTY
        )
    }

    /// Human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Error { class, code } => {
                format!("{} / {}", class_name(*class), code_name(*code))
            }
            Self::Reject { reason } => format!("reject: {}", reject_reason(*reason)),
            Self::Abort { reason } => format!("abort: {}", abort_reason(*reason)),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

fn class_name(class: u32) -> String {
    match class {
        error_class::DEVICE => "device".into(),
        error_class::OBJECT => "object".into(),
        error_class::PROPERTY => "property".into(),
        error_class::RESOURCES => "resources".into(),
        error_class::SECURITY => "security".into(),
        error_class::SERVICES => "services".into(),
        error_class::VT => "vt".into(),
        error_class::COMMUNICATION => "communication".into(),
        other => format!("class {other}"),
    }
}

fn code_name(code: u32) -> String {
    match code {
        error_code::OTHER => "other".into(),
        error_code::CONFIGURATION_IN_PROGRESS => "configuration-in-progress".into(),
        error_code::DEVICE_BUSY => "device-busy".into(),
        error_code::INCONSISTENT_PARAMETERS => "inconsistent-parameters".into(),
        error_code::INVALID_DATA_TYPE => "invalid-data-type".into(),
        error_code::MISSING_REQUIRED_PARAMETER => "missing-required-parameter".into(),
        error_code::READ_ACCESS_DENIED => "read-access-denied".into(),
        error_code::SERVICE_REQUEST_DENIED => "service-request-denied".into(),
        error_code::UNKNOWN_OBJECT => "unknown-object".into(),
        error_code::UNKNOWN_PROPERTY => "unknown-property".into(),
        error_code::VALUE_OUT_OF_RANGE => "value-out-of-range".into(),
        error_code::WRITE_ACCESS_DENIED => "write-access-denied".into(),
        other => format!("code {other}"),
    }
}

fn reject_reason(reason: u8) -> &'static str {
    match reason {
        0 => "other",
        1 => "buffer-overflow",
        2 => "inconsistent-parameters",
        3 => "invalid-parameter-data-type",
        4 => "invalid-tag",
        5 => "missing-required-parameter",
        6 => "parameter-out-of-range",
        7 => "too-many-arguments",
        8 => "undefined-enumeration",
        9 => "unrecognized-service",
        _ => "unknown",
    }
}

fn abort_reason(reason: u8) -> &'static str {
    match reason {
        0 => "other",
        1 => "buffer-overflow",
        2 => "invalid-apdu-in-this-state",
        3 => "preempted-by-higher-priority-task",
        4 => "segmentation-not-supported",
        5 => "security-error",
        6 => "insufficient-security",
        7 => "window-size-out-of-range",
        8 => "application-exceeded-reply-time",
        9 => "out-of-resources",
        10 => "tsm-timeout",
        11 => "apdu-too-long",
        _ => "unknown",
    }
}

/// All errors that can occur in the waterguard-linkbox library.
#[derive(Debug, thiserror::Error)]
pub enum LinkboxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout: {request}")]
    Timeout { request: String },

    #[error("Hub rejected request: {0}")]
    Rejected(Rejection),

    #[error("Malformed response: {details}")]
    Decode { details: String },

    #[error("Discovery failed: {reason}")]
    DiscoveryFailed { reason: String },

    #[error("Invalid valve index: {index} (max: {max})")]
    InvalidValve { index: u8, max: u8 },

    #[error("Unknown device id: {0}")]
    UnknownDevice(u32),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Channel closed")]
    ChannelClosed,
}

impl LinkboxError {
    /// Whether this error is transient and the next poll cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkboxError::Io(_) | LinkboxError::Timeout { .. } | LinkboxError::ChannelClosed
        )
    }

    pub(crate) fn decode(details: impl Into<String>) -> Self {
        LinkboxError::Decode {
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LinkboxError::Timeout { request: "read".into() }.is_retryable());
        assert!(LinkboxError::Io(std::io::Error::other("down")).is_retryable());
        assert!(!LinkboxError::Rejected(Rejection::Reject { reason: 9 }).is_retryable());
        assert!(!LinkboxError::decode("short frame").is_retryable());
        assert!(!LinkboxError::SessionClosed.is_retryable());
    }

    #[test]
    fn test_service_unsupported() {
        assert!(Rejection::Reject { reason: 9 }.is_service_unsupported());
        assert!(Rejection::Abort { reason: 4 }.is_service_unsupported());
        assert!(
            Rejection::Error { class: error_class::SERVICES, code: error_code::OTHER }
                .is_service_unsupported()
        );
        assert!(
            !Rejection::Error { class: error_class::OBJECT, code: error_code::UNKNOWN_OBJECT }
                .is_service_unsupported()
        );
    }

    #[test]
    fn test_unknown_point() {
        let e = Rejection::Error { class: error_class::OBJECT, code: error_code::UNKNOWN_OBJECT };
        assert!(e.is_unknown_point());
        assert!(!Rejection::Abort { reason: 0 }.is_unknown_point());
    }

    #[test]
    fn test_description() {
        let e = Rejection::Error { class: error_class::PROPERTY, code: error_code::WRITE_ACCESS_DENIED };
        assert_eq!(e.to_string(), "property / write-access-denied");
        assert_eq!(Rejection::Reject { reason: 9 }.to_string(), "reject: unrecognized-service");
        assert_eq!(Rejection::Error { class: 99, code: 500 }.to_string(), "class 99 / code 500");
    }
}
