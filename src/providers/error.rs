/// Provider-level error with retry classification.
///
/// The runtime consults `is_retryable()` to decide whether to re-attempt a
/// storage operation before giving up.
///
/// Retryable: busy files, connection timeouts, temporary resource exhaustion.
/// Not retryable: missing instances, malformed data, invalid lock tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g. "append", "enqueue_work").
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_and_display() {
        let busy = ProviderError::retryable("append", "file is locked");
        assert!(busy.is_retryable());

        let missing = ProviderError::permanent("append", "instance not found: x");
        assert!(!missing.is_retryable());
        let shown = format!("{missing}");
        assert!(shown.contains("append"));
        assert!(shown.contains("not found"));

        let _err: Box<dyn std::error::Error> = Box::new(missing);
    }
}
