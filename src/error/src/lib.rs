// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Error taxonomy for the document database client.
//!
//! Every error the client surfaces belongs to one of three categories:
//! errors shared by all services ([`CommonError`]), errors specific to
//! key-value operations ([`KeyValueError`]), and errors raised by the
//! networking layer ([`NetworkError`]). Each kind carries a stable numeric
//! code matched between client implementations, so the codes here must not
//! be renumbered.

use std::fmt;

/// The category an [`Error`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Common,
    KeyValue,
    Network,
    FieldLevelEncryption,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorCategory::Common => f.write_str("common"),
            ErrorCategory::KeyValue => f.write_str("key_value"),
            ErrorCategory::Network => f.write_str("network"),
            ErrorCategory::FieldLevelEncryption => f.write_str("field_level_encryption"),
        }
    }
}

/// Errors that any service may surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum CommonError {
    #[error("request_canceled")]
    RequestCanceled,
    #[error("invalid_argument")]
    InvalidArgument,
    #[error("service_not_available")]
    ServiceNotAvailable,
    #[error("internal_server_failure")]
    InternalServerFailure,
    #[error("authentication_failure")]
    AuthenticationFailure,
    #[error("temporary_failure")]
    TemporaryFailure,
    #[error("parsing_failure")]
    ParsingFailure,
    #[error("cas_mismatch")]
    CasMismatch,
    #[error("bucket_not_found")]
    BucketNotFound,
    #[error("collection_not_found")]
    CollectionNotFound,
    #[error("unsupported_operation")]
    UnsupportedOperation,
    #[error("ambiguous_timeout")]
    AmbiguousTimeout,
    #[error("unambiguous_timeout")]
    UnambiguousTimeout,
    #[error("feature_not_available")]
    FeatureNotAvailable,
    #[error("scope_not_found")]
    ScopeNotFound,
    #[error("index_not_found")]
    IndexNotFound,
    #[error("index_exists")]
    IndexExists,
    #[error("encoding_failure")]
    EncodingFailure,
    #[error("decoding_failure")]
    DecodingFailure,
    #[error("rate_limited")]
    RateLimited,
    #[error("quota_limited")]
    QuotaLimited,
}

impl CommonError {
    pub const fn code(&self) -> i32 {
        match self {
            CommonError::RequestCanceled => 2,
            CommonError::InvalidArgument => 3,
            CommonError::ServiceNotAvailable => 4,
            CommonError::InternalServerFailure => 5,
            CommonError::AuthenticationFailure => 6,
            CommonError::TemporaryFailure => 7,
            CommonError::ParsingFailure => 8,
            CommonError::CasMismatch => 9,
            CommonError::BucketNotFound => 10,
            CommonError::CollectionNotFound => 11,
            CommonError::UnsupportedOperation => 12,
            CommonError::AmbiguousTimeout => 13,
            CommonError::UnambiguousTimeout => 14,
            CommonError::FeatureNotAvailable => 15,
            CommonError::ScopeNotFound => 16,
            CommonError::IndexNotFound => 17,
            CommonError::IndexExists => 18,
            CommonError::EncodingFailure => 19,
            CommonError::DecodingFailure => 20,
            CommonError::RateLimited => 21,
            CommonError::QuotaLimited => 22,
        }
    }
}

/// Errors specific to key-value operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum KeyValueError {
    #[error("document_not_found")]
    DocumentNotFound,
    #[error("document_irretrievable")]
    DocumentIrretrievable,
    #[error("document_locked")]
    DocumentLocked,
    #[error("value_too_large")]
    ValueTooLarge,
    #[error("document_exists")]
    DocumentExists,
    #[error("durability_level_not_available")]
    DurabilityLevelNotAvailable,
    #[error("durability_impossible")]
    DurabilityImpossible,
    #[error("durability_ambiguous")]
    DurabilityAmbiguous,
    #[error("durable_write_in_progress")]
    DurableWriteInProgress,
    #[error("durable_write_re_commit_in_progress")]
    DurableWriteReCommitInProgress,
    #[error("path_not_found")]
    PathNotFound,
    #[error("path_mismatch")]
    PathMismatch,
    #[error("path_invalid")]
    PathInvalid,
    #[error("path_too_big")]
    PathTooBig,
    #[error("path_too_deep")]
    PathTooDeep,
    #[error("value_too_deep")]
    ValueTooDeep,
    #[error("value_invalid")]
    ValueInvalid,
    #[error("document_not_json")]
    DocumentNotJson,
    #[error("number_too_big")]
    NumberTooBig,
    #[error("delta_invalid")]
    DeltaInvalid,
    #[error("path_exists")]
    PathExists,
    #[error("xattr_unknown_macro")]
    XattrUnknownMacro,
    #[error("xattr_invalid_key_combo")]
    XattrInvalidKeyCombo,
    #[error("xattr_unknown_virtual_attribute")]
    XattrUnknownVirtualAttribute,
    #[error("xattr_cannot_modify_virtual_attribute")]
    XattrCannotModifyVirtualAttribute,
    #[error("xattr_no_access")]
    XattrNoAccess,
    #[error("document_not_locked")]
    DocumentNotLocked,
    #[error("mutation_token_outdated")]
    MutationTokenOutdated,
    #[error("range_scan_completed")]
    RangeScanCompleted,
}

impl KeyValueError {
    pub const fn code(&self) -> i32 {
        match self {
            KeyValueError::DocumentNotFound => 101,
            KeyValueError::DocumentIrretrievable => 102,
            KeyValueError::DocumentLocked => 103,
            KeyValueError::ValueTooLarge => 104,
            KeyValueError::DocumentExists => 105,
            KeyValueError::DurabilityLevelNotAvailable => 107,
            KeyValueError::DurabilityImpossible => 108,
            KeyValueError::DurabilityAmbiguous => 109,
            KeyValueError::DurableWriteInProgress => 110,
            KeyValueError::DurableWriteReCommitInProgress => 111,
            KeyValueError::PathNotFound => 113,
            KeyValueError::PathMismatch => 114,
            KeyValueError::PathInvalid => 115,
            KeyValueError::PathTooBig => 116,
            KeyValueError::PathTooDeep => 117,
            KeyValueError::ValueTooDeep => 118,
            KeyValueError::ValueInvalid => 119,
            KeyValueError::DocumentNotJson => 120,
            KeyValueError::NumberTooBig => 121,
            KeyValueError::DeltaInvalid => 122,
            KeyValueError::PathExists => 123,
            KeyValueError::XattrUnknownMacro => 124,
            KeyValueError::XattrInvalidKeyCombo => 126,
            KeyValueError::XattrUnknownVirtualAttribute => 127,
            KeyValueError::XattrCannotModifyVirtualAttribute => 128,
            KeyValueError::XattrNoAccess => 130,
            KeyValueError::DocumentNotLocked => 131,
            KeyValueError::MutationTokenOutdated => 133,
            KeyValueError::RangeScanCompleted => 134,
        }
    }
}

/// Errors raised by the networking layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum NetworkError {
    #[error("resolve_failure")]
    ResolveFailure,
    #[error("no_endpoints_left")]
    NoEndpointsLeft,
    #[error("handshake_failure")]
    HandshakeFailure,
    #[error("protocol_error")]
    ProtocolError,
    #[error("configuration_not_available")]
    ConfigurationNotAvailable,
    #[error("cluster_closed")]
    ClusterClosed,
    #[error("end_of_stream")]
    EndOfStream,
    #[error("need_more_data")]
    NeedMoreData,
    #[error("operation_queue_closed")]
    OperationQueueClosed,
    #[error("operation_queue_full")]
    OperationQueueFull,
    #[error("request_already_queued")]
    RequestAlreadyQueued,
    #[error("request_cancelled")]
    RequestCancelled,
    #[error("bucket_closed")]
    BucketClosed,
}

impl NetworkError {
    pub const fn code(&self) -> i32 {
        match self {
            NetworkError::ResolveFailure => 1001,
            NetworkError::NoEndpointsLeft => 1002,
            NetworkError::HandshakeFailure => 1003,
            NetworkError::ProtocolError => 1004,
            NetworkError::ConfigurationNotAvailable => 1005,
            NetworkError::ClusterClosed => 1006,
            NetworkError::EndOfStream => 1007,
            NetworkError::NeedMoreData => 1008,
            NetworkError::OperationQueueClosed => 1009,
            NetworkError::OperationQueueFull => 1010,
            NetworkError::RequestAlreadyQueued => 1011,
            NetworkError::RequestCancelled => 1012,
            NetworkError::BucketClosed => 1013,
        }
    }
}

/// Errors raised by field-level encryption. The feature itself lives
/// outside this library, but its codes participate in the shared metrics
/// outcome contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum FieldLevelEncryptionError {
    #[error("generic_cryptography_failure")]
    GenericCryptographyFailure,
    #[error("encryption_failure")]
    EncryptionFailure,
    #[error("decryption_failure")]
    DecryptionFailure,
}

impl FieldLevelEncryptionError {
    pub const fn code(&self) -> i32 {
        match self {
            FieldLevelEncryptionError::GenericCryptographyFailure => 700,
            FieldLevelEncryptionError::EncryptionFailure => 701,
            FieldLevelEncryptionError::DecryptionFailure => 702,
        }
    }
}

/// Any error the client surfaces.
///
/// Cheap to copy; results and error contexts carry an `Option<Error>` where
/// `None` means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Common(#[from] CommonError),
    #[error(transparent)]
    KeyValue(#[from] KeyValueError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    FieldLevelEncryption(#[from] FieldLevelEncryptionError),
}

impl Error {
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Error::Common(_) => ErrorCategory::Common,
            Error::KeyValue(_) => ErrorCategory::KeyValue,
            Error::Network(_) => ErrorCategory::Network,
            Error::FieldLevelEncryption(_) => ErrorCategory::FieldLevelEncryption,
        }
    }

    pub const fn code(&self) -> i32 {
        match self {
            Error::Common(e) => e.code(),
            Error::KeyValue(e) => e.code(),
            Error::Network(e) => e.code(),
            Error::FieldLevelEncryption(e) => e.code(),
        }
    }

    /// The snake_case name of the error kind, e.g. `"document_not_found"`.
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Whether the error indicates a timeout (ambiguous or unambiguous).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Common(CommonError::AmbiguousTimeout)
                | Error::Common(CommonError::UnambiguousTimeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::from(CommonError::RequestCanceled).code(), 2);
        assert_eq!(Error::from(CommonError::UnambiguousTimeout).code(), 14);
        assert_eq!(Error::from(KeyValueError::DocumentIrretrievable).code(), 102);
        assert_eq!(Error::from(KeyValueError::RangeScanCompleted).code(), 134);
        assert_eq!(Error::from(NetworkError::BucketClosed).code(), 1013);
    }

    #[test]
    fn names_match_the_wire_taxonomy() {
        assert_eq!(
            Error::from(KeyValueError::DurabilityAmbiguous).name(),
            "durability_ambiguous"
        );
        assert_eq!(
            Error::from(CommonError::FeatureNotAvailable).name(),
            "feature_not_available"
        );
    }

    #[test]
    fn categories() {
        assert_eq!(
            Error::from(CommonError::CasMismatch).category(),
            ErrorCategory::Common
        );
        assert_eq!(
            Error::from(KeyValueError::DocumentLocked).category(),
            ErrorCategory::KeyValue
        );
        assert_eq!(
            Error::from(NetworkError::ProtocolError).category(),
            ErrorCategory::Network
        );
    }
}
