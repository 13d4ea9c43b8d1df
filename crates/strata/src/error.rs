// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The engine-wide error taxonomy.
//!
//! Every subsystem keeps its own `thiserror` enum; this module defines the
//! flat [`ErrorCode`] the front-end consumes, and the mapping from the
//! payload parser's errors into it. Codes are terminal unless
//! [`ErrorCode::is_retryable`] or [`ErrorCode::is_cancel`] say otherwise.

use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorCode {
    Success,

    // Transport / format
    DownloadTransferError,
    DownloadInvalidMetadataMagicString,
    DownloadManifestParseError,
    UnsupportedMajorPayloadVersion,
    UnsupportedMinorPayloadVersion,
    PayloadMismatchedType,
    PayloadSizeMismatchError,

    // Integrity
    DownloadMetadataSignatureError,
    DownloadMetadataSignatureMissingError,
    DownloadMetadataSignatureMismatch,
    DownloadPayloadVerificationError,
    DownloadOperationHashMismatch,
    DownloadOperationHashMissingError,
    NewRootfsVerificationError,
    VerityCalculationError,

    // State / resource
    DownloadStateInitializationError,
    DownloadOperationExecutionError,
    InstallDeviceOpenError,
    KernelDeviceOpenError,
    FilesystemCopierError,
    NotEnoughSpace,
    DeviceCorrupted,
    PostinstallRunnerError,

    // Policy
    PayloadTimestampError,
    UpdatedButNotActive,
    UserCanceled,
}

impl ErrorCode {
    /// Retryable errors leave the checkpoint untouched and the same
    /// payload may simply be fed again
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::DownloadTransferError)
    }

    /// Cancellation is not a failure; the checkpoint stays valid for a
    /// later resume
    pub fn is_cancel(&self) -> bool {
        matches!(self, ErrorCode::UserCanceled)
    }
}

impl From<&crau::read::Error> for ErrorCode {
    fn from(error: &crau::read::Error) -> Self {
        use crau::header::DecodeError as Header;
        use crau::read::Error as Parse;

        match error {
            Parse::HeaderDecode(Header::InvalidMagic(_)) => ErrorCode::DownloadInvalidMetadataMagicString,
            Parse::HeaderDecode(Header::UnsupportedVersion(_)) => ErrorCode::UnsupportedMajorPayloadVersion,
            Parse::HeaderDecode(_) => ErrorCode::DownloadManifestParseError,
            Parse::ManifestTooLarge(_) | Parse::ManifestParse(_) | Parse::ManifestValidate(_) => {
                ErrorCode::DownloadManifestParseError
            }
            Parse::MetadataSizeMismatch { .. } => ErrorCode::PayloadSizeMismatchError,
            Parse::MetadataSignatureMissing => ErrorCode::DownloadMetadataSignatureMissingError,
            Parse::MetadataSignatureDecode(_) => ErrorCode::DownloadMetadataSignatureError,
            Parse::MetadataSignatureMismatch => ErrorCode::DownloadMetadataSignatureMismatch,
            Parse::PayloadSignatureMissing
            | Parse::PayloadSignatureDecode(_)
            | Parse::PayloadSignatureMismatch
            | Parse::PayloadHashMismatch { .. } => ErrorCode::DownloadPayloadVerificationError,
            Parse::PayloadSizeMismatch { .. } => ErrorCode::PayloadSizeMismatchError,
            Parse::UnsupportedMinorVersion(_) => ErrorCode::UnsupportedMinorPayloadVersion,
            Parse::MismatchedType(_) => ErrorCode::PayloadMismatchedType,
            Parse::Timestamp { .. } => ErrorCode::PayloadTimestampError,
        }
    }
}
