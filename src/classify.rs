//! Pure classification of sink failures into retriable vs non-retriable.
//!
//! Kept as a standalone pure function, the way `proxy::error::ErrorKind`
//! classifies upstream errors by inspecting a code/message pair rather
//! than by type, since sink errors arrive off the wire as loosely typed
//! service-error shapes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retriable,
    NonRetriable,
}

/// AWS Kinesis error codes that indicate a retry cannot help: the
/// request itself is wrong, the caller isn't allowed to make it, the
/// target doesn't exist, or a record is malformed/oversize. Everything
/// else -- transport errors, throttling, internal server errors,
/// timeouts -- is retriable (§4.4).
const NON_RETRIABLE_CODES: &[&str] = &[
    "AccessDeniedException",
    "UnauthorizedAccessException",
    "InvalidSignatureException",
    "ResourceNotFoundException",
    "ValidationException",
    "InvalidArgumentException",
];

/// Message substrings that mark a non-retriable failure even when no
/// (or an unrecognized) error code is present: authorization, not-found,
/// validation, and oversize-record indicators.
const NON_RETRIABLE_MARKERS: &[&str] = &[
    "access denied",
    "not authorized",
    "unauthorized",
    "does not exist",
    "not found",
    "validation",
    "invalid partition key",
    "invalid argument",
    "exceeds the maximum",
    "maximum size",
    "oversize",
];

/// Classify a sink error by its service-reported error code, falling
/// back to scanning `message` for a non-retriable marker when the code
/// is absent or unrecognized. Defaults to [`Classification::Retriable`]:
/// per §4.4, only a known non-retriable code or message marker flips it.
pub fn classify(error_code: Option<&str>, message: &str) -> Classification {
    if let Some(code) = error_code {
        if NON_RETRIABLE_CODES.iter().any(|c| *c == code) {
            return Classification::NonRetriable;
        }
    }

    let lower = message.to_ascii_lowercase();
    if NON_RETRIABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        Classification::NonRetriable
    } else {
        Classification::Retriable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_non_retriable_code_is_non_retriable() {
        assert_eq!(
            classify(Some("ValidationException"), "bad partition key"),
            Classification::NonRetriable
        );
    }

    #[test]
    fn unknown_code_defaults_to_retriable() {
        assert_eq!(
            classify(Some("RequestExpired"), ""),
            Classification::Retriable
        );
        assert_eq!(
            classify(Some("RequestTimeout"), ""),
            Classification::Retriable
        );
        assert_eq!(
            classify(Some("LimitExceededException"), ""),
            Classification::Retriable
        );
    }

    #[test]
    fn known_retriable_shapes_stay_retriable() {
        assert_eq!(
            classify(Some("ProvisionedThroughputExceededException"), ""),
            Classification::Retriable
        );
        assert_eq!(
            classify(Some("ThrottlingException"), ""),
            Classification::Retriable
        );
        assert_eq!(
            classify(None, "internal failure, please retry"),
            Classification::Retriable
        );
    }

    #[test]
    fn message_fallback_detects_non_retriable_marker() {
        assert_eq!(
            classify(None, "record exceeds the maximum size"),
            Classification::NonRetriable
        );
    }

    #[test]
    fn message_fallback_defaults_retriable() {
        assert_eq!(
            classify(None, "request was throttled, please retry"),
            Classification::Retriable
        );
    }
}
