//! The kernel's structured error taxonomy (spec §7).
//!
//! One outer variant per category, each wrapping a closed inner enum over the
//! specific kinds. `recoverable()`/`recovery_hints()` dispatch to the inner
//! variant so callers never need to match on both levels.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SunwellError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Io(#[from] IoError),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model not found: {0}")]
    NotFound(String),
    #[error("model authentication failed: {0}")]
    AuthFailed(String),
    #[error("model rate limited: {0}")]
    RateLimited(String),
    #[error("model context window exceeded: {used}/{limit} tokens")]
    ContextExceeded { used: u64, limit: u64 },
    #[error("model call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("model provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("model returned invalid response: {0}")]
    ResponseInvalid(String),
    #[error("model does not support tool calls")]
    ToolsNotSupported,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("tool permission denied: {0}")]
    PermissionDenied(String),
    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),
    #[error("tool call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("validation script failed: {0}")]
    ScriptFailed(String),
    #[error("validation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("validation produced invalid output: {0}")]
    InvalidOutput(String),
    #[error("validation confidence too low: {0:.2}")]
    ConfidenceLow(f64),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid runtime state: {0}")]
    StateInvalid(String),
    #[error("memory exhausted")]
    MemoryExhausted,
    #[error("concurrent operation limit reached")]
    ConcurrentLimit,
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("network timeout: {0}")]
    NetworkTimeout(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
}

impl SunwellError {
    /// Whether the run should attempt a retry/backoff cycle for this error.
    pub fn recoverable(&self) -> bool {
        match self {
            SunwellError::Model(e) => matches!(
                e,
                ModelError::RateLimited(_) | ModelError::Timeout(_) | ModelError::ProviderUnavailable(_)
            ),
            SunwellError::Tool(e) => {
                matches!(e, ToolError::ExecutionFailed(_) | ToolError::Timeout(_) | ToolError::InvalidArguments(_))
            }
            SunwellError::Validation(e) => matches!(e, ValidationError::ScriptFailed(_) | ValidationError::ConfidenceLow(_)),
            SunwellError::Runtime(e) => matches!(e, RuntimeError::ConcurrentLimit),
            SunwellError::Io(e) => matches!(e, IoError::NetworkUnreachable(_) | IoError::NetworkTimeout(_)),
        }
    }

    /// Structured, machine- and human-readable recovery hints.
    pub fn recovery_hints(&self) -> Vec<String> {
        match self {
            SunwellError::Model(ModelError::RateLimited(_)) => {
                vec!["retry with exponential backoff".into()]
            }
            SunwellError::Model(ModelError::Timeout(_)) => vec!["retry with backoff".into()],
            SunwellError::Model(ModelError::ProviderUnavailable(_)) => {
                vec!["retry under circuit breaker supervision".into()]
            }
            SunwellError::Model(ModelError::ToolsNotSupported) => {
                vec!["fall back to text-generation path".into()]
            }
            SunwellError::Model(ModelError::AuthFailed(_)) => {
                vec!["set the provider's API key environment variable".into()]
            }
            SunwellError::Model(ModelError::ContextExceeded { .. }) => {
                vec!["reduce prompt size or switch to a larger-context model".into()]
            }
            SunwellError::Tool(ToolError::PermissionDenied(_)) => {
                vec!["grant the required trust level before retrying".into()]
            }
            SunwellError::Tool(ToolError::InvalidArguments(_)) => {
                vec!["request one repair attempt from the model".into()]
            }
            SunwellError::Tool(ToolError::ExecutionFailed(_) | ToolError::Timeout(_)) => {
                vec!["retry once".into()]
            }
            SunwellError::Validation(ValidationError::ScriptFailed(_)) => vec!["enter the fix loop".into()],
            SunwellError::Validation(ValidationError::ConfidenceLow(_)) => {
                vec!["escalate to a stronger model".into()]
            }
            SunwellError::Runtime(RuntimeError::MemoryExhausted) => vec!["stop dispatching new tasks".into()],
            SunwellError::Runtime(RuntimeError::ConcurrentLimit) => vec!["wait for a free slot".into()],
            SunwellError::Io(IoError::NetworkUnreachable(_) | IoError::NetworkTimeout(_)) => {
                vec!["retry the network operation".into()]
            }
            _ => Vec::new(),
        }
    }
}

/// Classifies unstructured subprocess output (git / type-checker stderr) the
/// kernel cannot parse structurally. Mirrors the teacher's
/// `classify_cargo_failure` substring-sniffing, kept only where the input is
/// genuinely unstructured text rather than something the kernel controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Ambiguous,
    Permanent,
}

pub fn classify_subprocess_failure(stderr: &str, stdout: &str) -> (ErrorClass, String) {
    let hay = format!("{stderr}\n{stdout}").to_lowercase();

    let retryable = [
        "timeout", "timed out", "connection reset", "connection refused", "temporarily unavailable", "lock held", "resource busy",
    ];
    if retryable.iter().any(|p| hay.contains(p)) {
        return (ErrorClass::Retryable, "transient failure (retryable)".into());
    }

    let permanent = [
        "permission denied", "not a git repository", "unauthorized", "forbidden", "does not exist", "conflict",
    ];
    if permanent.iter().any(|p| hay.contains(p)) {
        return (ErrorClass::Permanent, "permanent failure (fix required)".into());
    }

    (ErrorClass::Ambiguous, "unclassified subprocess failure".into())
}
