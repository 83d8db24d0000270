//! Retry-tier classification for failures surfaced while processing a job
//! (§4.6). Classification decides retryability, not just logging: a
//! misclassified error either retries something that can never succeed or
//! drops something transient.

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    Timeout,
    RateLimit,
    TransientStorage,
    Validation,
    Serialization,
    Authentication,
    Configuration,
    Unknown,
}

impl ErrorClass {
    /// Derives a class from an [`Error`]'s category and code. Categories are
    /// the coarse signal (`ErrorCategory::Transient` vs `Permanent`); the
    /// code refines it into the specific tier used for logging and alerts.
    pub fn classify(error: &Error) -> Self {
        use crate::error::ErrorCode::*;
        match error.code {
            TransientStorageError | QueueError | PartitionError | DatabaseConnectionError | CacheError => {
                ErrorClass::TransientStorage
            }
            NetworkError | NetworkConnectionRefused | ServiceUnavailable | ExternalServiceError | CircuitOpenError => {
                ErrorClass::Network
            }
            Timeout | NetworkTimeout | JobTimeout => ErrorClass::Timeout,
            RateLimitExceeded | TooManyRequests | ConcurrencyLimitExceeded => ErrorClass::RateLimit,
            ValidationFailed | InvalidInput | MissingRequiredField | InvalidFormat | ValueOutOfRange | IntegrityError => {
                ErrorClass::Validation
            }
            SerializationError | JobDeserializationError => ErrorClass::Serialization,
            AuthenticationFailed | InvalidCredentials | TokenExpired | TokenInvalid | KmsError => {
                ErrorClass::Authentication
            }
            ConfigurationError => ErrorClass::Configuration,
            DeadLetterError => ErrorClass::Unknown,
            _ => ErrorClass::Unknown,
        }
    }

    /// Whether a job that failed with this class is eligible for another
    /// attempt at all (independent of whether `attempts` has run out).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorClass::Validation | ErrorClass::Serialization | ErrorClass::Authentication | ErrorClass::Configuration
        )
    }

    /// `Unknown` failures retry under a stricter cap than the job's
    /// configured `maxAttempts`, since an unclassified error might be a
    /// permanent one we failed to recognize.
    pub fn max_attempts_override(&self) -> Option<u32> {
        match self {
            ErrorClass::Unknown => Some(2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::TransientStorage => "transient_storage",
            ErrorClass::Validation => "validation",
            ErrorClass::Serialization => "serialization",
            ErrorClass::Authentication => "authentication",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn validation_failures_are_not_retryable() {
        let err = Error::new(ErrorCode::ValidationFailed, "bad field");
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Validation);
        assert!(!ErrorClass::Validation.is_retryable());
    }

    #[test]
    fn transient_storage_errors_are_retryable() {
        let err = Error::transient_storage("connection reset");
        assert_eq!(ErrorClass::classify(&err), ErrorClass::TransientStorage);
        assert!(ErrorClass::TransientStorage.is_retryable());
    }

    #[test]
    fn unknown_errors_retry_under_stricter_cap() {
        assert_eq!(ErrorClass::Unknown.max_attempts_override(), Some(2));
        assert_eq!(ErrorClass::Network.max_attempts_override(), None);
    }
}
