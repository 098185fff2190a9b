//! error types for maci-coordinator

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// result contract shared by the three coordinator operations
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("rpc transport error: {0}")]
    Rpc(String),

    #[error("rpc error {code}: {message}")]
    RpcResponse { code: i64, message: String },

    #[error("abi decoding error: {0}")]
    AbiDecode(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("value does not fit in {target}: 0x{value}")]
    Overflow { target: &'static str, value: String },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("finalization already running for poll {0}")]
    FinalizeInProgress(u64),

    #[error("poll {poll_id} is {status}, finalize needs an idle poll")]
    FinalizeNotIdle { poll_id: u64, status: String },

    #[error("invalid finalize transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("no signer account configured")]
    NoSigner,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("maci sdk error: {0}")]
    Sdk(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::KeyStore(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// coordinator operation, used to prefix failure messages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Merge,
    GenerateProofs,
    Submit,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Merge => write!(f, "merge"),
            Operation::GenerateProofs => write!(f, "generate proofs"),
            Operation::Submit => write!(f, "submit"),
        }
    }
}

/// failure of a coordinator call
///
/// transport failures, non-OK responses and malformed bodies all land here so
/// callers handle one shape. only the message differs.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Failed to {op}: {reason}")]
    Transport { op: Operation, reason: String },

    #[error("Failed to {op}: {status} - {status_text}{}", message_suffix(.message))]
    Http {
        op: Operation,
        status: u16,
        status_text: String,
        message: Option<String>,
    },

    #[error("Failed to {op}: invalid response: {reason}")]
    Schema { op: Operation, reason: String },

    #[error("Failed to {op}: no response after {}s", .after.as_secs())]
    Timeout { op: Operation, after: Duration },
}

impl ServiceError {
    pub fn operation(&self) -> Operation {
        match self {
            ServiceError::Transport { op, .. }
            | ServiceError::Http { op, .. }
            | ServiceError::Schema { op, .. }
            | ServiceError::Timeout { op, .. } => *op,
        }
    }
}

fn message_suffix(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(". {}", m),
        None => String::new(),
    }
}
