//! Journal Error Taxonomy
//!
//! Client-input errors (`BadKey`, `KeyTooLong`) are raised before any state
//! is touched. Logical misses (`ContainerUnknown`, `ObjectUnknown`,
//! `ObjectDeleted`) are not failures. `DeviceFailure` is fail-stop: once it
//! has been returned by the buffer pool, every later pool operation returns
//! it as well.

use std::io::{Error as IoError, ErrorKind};

/// Result alias used throughout the crate
pub type JournalResult<T> = Result<T, JournalError>;

/// Error type for journal operations
#[derive(Debug)]
pub enum JournalError {
    /// Key does not follow `<digits>_<name>[_<rest>]`
    BadKey(String),
    /// Key exceeds the record payload budget
    KeyTooLong { len: usize, max: usize },
    /// A bounded table is full; nothing was modified
    OutOfMemory(&'static str),
    /// No open container with this id
    ContainerUnknown(u32),
    /// No record exists for the key
    ObjectUnknown,
    /// The newest visible record for the key is a delete, or it was trimmed
    ObjectDeleted,
    /// Buffer or backing-store capacity exhausted
    NoSpace,
    /// Durable media failed; the buffer pool is disabled
    DeviceFailure(String),
    /// Malformed streaming object or record framing
    Corruption(String),
    /// Backing store I/O error
    Io(IoError),
    /// Configuration rejected at construction
    Config(ConfigError),
}

impl JournalError {
    /// Whether this error is a logical miss rather than a failure
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            JournalError::ContainerUnknown(_)
                | JournalError::ObjectUnknown
                | JournalError::ObjectDeleted
        )
    }
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalError::BadKey(key) => write!(f, "Malformed key: {:?}", key),
            JournalError::KeyTooLong { len, max } => {
                write!(f, "Key too long: {} bytes (max {})", len, max)
            }
            JournalError::OutOfMemory(what) => write!(f, "Out of memory: {} table full", what),
            JournalError::ContainerUnknown(id) => write!(f, "Unknown container: {}", id),
            JournalError::ObjectUnknown => write!(f, "Object not found"),
            JournalError::ObjectDeleted => write!(f, "Object deleted"),
            JournalError::NoSpace => write!(f, "No space left"),
            JournalError::DeviceFailure(msg) => write!(f, "Durable device failure: {}", msg),
            JournalError::Corruption(msg) => write!(f, "Corruption: {}", msg),
            JournalError::Io(e) => write!(f, "Backing store I/O error: {}", e),
            JournalError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for JournalError {}

impl From<IoError> for JournalError {
    fn from(e: IoError) -> Self {
        if e.to_string().contains("No space left") {
            return JournalError::NoSpace;
        }
        match e.kind() {
            ErrorKind::NotFound => JournalError::ObjectUnknown,
            _ => JournalError::Io(e),
        }
    }
}

impl From<ConfigError> for JournalError {
    fn from(e: ConfigError) -> Self {
        JournalError::Config(e)
    }
}

/// Error type for configuration loading and validation
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io(IoError),
    /// Config file is not valid TOML for this schema
    Parse(String),
    /// Values are individually valid but inconsistent
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {}", e),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<IoError> for ConfigError {
    fn from(e: IoError) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}
