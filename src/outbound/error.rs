use thiserror::Error;

/// Errors surfaced by a delivery call.
///
/// Hook, queue, and mirror failures never appear here; they are recovered
/// inside the call and logged.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// No registered adapter with both text and media support. Not retryable.
    #[error("outbound not configured for channel: {channel}")]
    NotConfigured { channel: String },

    /// The caller's abort token fired before a unit was dispatched.
    #[error("delivery aborted")]
    Aborted,

    /// A payload failed in strict mode; remaining payloads were abandoned.
    #[error("{channel} delivery failed at payload {payload_index}: {error:#}")]
    Send {
        channel: String,
        payload_index: usize,
        error: anyhow::Error,
    },
}

/// Leading text of a [`DeliveryError::NotConfigured`] message, as stored in
/// a queue record's `last_error`.
const NOT_CONFIGURED_PREFIX: &str = "outbound not configured for channel:";

impl DeliveryError {
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Whether replaying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotConfigured { .. })
    }

    /// Whether a recorded failure reason came from a non-retryable error.
    pub fn is_fatal_reason(reason: &str) -> bool {
        reason.starts_with(NOT_CONFIGURED_PREFIX)
    }

    /// Reason recorded on the queue record when this error fails it.
    pub fn reason(&self) -> String {
        match self {
            Self::Send { error, .. } => format!("{error:#}"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_reason_is_the_underlying_message() {
        let err = DeliveryError::Send {
            channel: "telegram".into(),
            payload_index: 1,
            error: anyhow::anyhow!("chat not found"),
        };
        assert_eq!(err.reason(), "chat not found");
        assert!(err.to_string().contains("payload 1"));
        assert!(!err.is_abort());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        let err = DeliveryError::NotConfigured {
            channel: "nope".into(),
        };
        assert!(!err.is_retryable());
        assert!(DeliveryError::is_fatal_reason(&err.reason()));

        assert!(DeliveryError::Aborted.is_retryable());
        assert!(!DeliveryError::is_fatal_reason("chat not found"));
    }

    #[test]
    fn aborted_is_distinguished() {
        assert!(DeliveryError::Aborted.is_abort());
        assert_eq!(DeliveryError::Aborted.reason(), "delivery aborted");
    }
}
