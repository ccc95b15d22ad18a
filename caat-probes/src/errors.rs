use crate::kernel::BundleId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaatError {
    #[error("Invalid instrumentation artifact: {0}")]
    InvalidArtifact(String),
    #[error("Kernel does not support: {0}")]
    KernelUnsupported(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Program not found in bundle: {program}")]
    ProgramNotFound { program: String },
    #[error("Program already attached: {program}")]
    ProgramAlreadyAttached { program: String },
    #[error("Map not found in bundle: {map}")]
    MapNotFound { map: String },
    #[error("Bundle {bundle} still has {attachments} live attachment(s)")]
    BundleInUse { bundle: BundleId, attachments: usize },
    #[error("Kernel I/O error: {0}")]
    KernelIo(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Event sink closed")]
    SinkClosed,
    #[error("Consumer for map {map} failed: {reason}")]
    ConsumerFailed { map: String, reason: String },
    #[error("Supervisor is {state}, a run can only start from Idle")]
    NotIdle { state: String },
    #[error("Missing attribute: {0}")]
    MissingAttribute(String),
    #[error("Invalid attribute: {attribute:?}, value: {value:?}")]
    InvalidAttribute {
        attribute: &'static str,
        value: String,
    },
}

/// Per-record failure. Never fatal to a stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Record length {actual}, expected {expected}")]
    Length { actual: usize, expected: usize },
    #[error("Unknown event kind: {0}")]
    UnknownKind(u32),
    #[error("Path length {0} out of range")]
    PathLength(u16),
    #[error("Path is not valid UTF-8")]
    Utf8,
    #[error("Unknown address family: {0}")]
    AddressFamily(u16),
}
