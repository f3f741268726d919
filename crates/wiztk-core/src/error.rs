//! Error kinds shared by every pipeline, plus a small non-fatal warning
//! aggregator so callers can tell "wrong key/corrupt header" apart from
//! "truncation or tampering mid-stream".

use std::fmt;
use std::sync::Mutex;

/// The stable error kinds a caller can match on. Each variant carries enough
/// context for a caller (or the CLI) to produce a useful diagnostic without
/// re-deriving it from a bare string.
#[derive(thiserror::Error, Debug)]
pub enum ToolkitError {
    #[error("option error: {0}")]
    Option(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("file error: {0}")]
    File(#[from] std::io::Error),

    #[error("blob error: {0}")]
    Blob(String),

    #[error("random error: {0}")]
    Random(String),

    #[error("entropy error: {0}")]
    Entropy(String),

    #[error("authenticate error: header digest mismatch")]
    AuthenticateHeader,

    #[error("authenticate error: key authentication failed")]
    AuthenticateKey,

    #[error("authenticate error: corrupt cipher chunk #{index}")]
    AuthenticateChunk { index: u64 },

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("fatal option error: {0}")]
    OptionFatal(String),
}

impl ToolkitError {
    pub fn option(msg: impl Into<String>) -> Self {
        ToolkitError::Option(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        ToolkitError::Resource(msg.into())
    }

    pub fn blob(msg: impl Into<String>) -> Self {
        ToolkitError::Blob(msg.into())
    }

    pub fn random(msg: impl Into<String>) -> Self {
        ToolkitError::Random(msg.into())
    }

    pub fn entropy(msg: impl Into<String>) -> Self {
        ToolkitError::Entropy(msg.into())
    }

    pub fn cipher(msg: impl Into<String>) -> Self {
        ToolkitError::Cipher(msg.into())
    }

    /// True for the errors that must be raised *before* any cipher
    /// work is attempted (header-level authentication failures).
    pub fn is_header_level(&self) -> bool {
        matches!(
            self,
            ToolkitError::AuthenticateHeader | ToolkitError::AuthenticateKey
        )
    }
}

pub type Result<T> = std::result::Result<T, ToolkitError>;

/// A non-fatal condition: an unknown packet field, a keyring miss that fell
/// back to passphrase entry, and so on. Collected rather than raised so a
/// pipeline can finish and report them together.
#[derive(Debug, Clone)]
pub struct ToolkitWarning {
    pub message: String,
}

impl fmt::Display for ToolkitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Collects warnings raised during one pipeline invocation: warnings are
/// reported via an exception aggregator but allow progress, unlike
/// `ToolkitError`, which is always fatal to the pipeline.
#[derive(Default)]
pub struct ExceptionAggregator {
    warnings: Mutex<Vec<ToolkitWarning>>,
}

impl ExceptionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(%message, "pipeline warning");
        self.warnings.lock().unwrap().push(ToolkitWarning { message });
    }

    /// Drains the collected warnings, leaving the aggregator empty.
    pub fn drain(&self) -> Vec<ToolkitWarning> {
        std::mem::take(&mut self.warnings.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.lock().unwrap().is_empty()
    }
}
