// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TDX quote acquisition from inside a trust domain.
//!
//! Two independent backends are provided:
//!
//! 1. [`NativeLib`] - Intel's `libtdx_attest`, loaded at runtime.
//! 2. [`Configfs`] - the kernel TSM report interface under `/sys/kernel/config/tsm/report`.
//!
//! Callers decide the order; neither backend retries through the other.

use thiserror::Error;

pub use configfs::{Configfs, DEFAULT_CONFIGFS_BASE};
pub use native::{NativeLib, DEFAULT_LIBRARY};

mod configfs;
mod native;

pub type Result<T> = std::result::Result<T, TdxAttestError>;

pub type TdxReportData = [u8; 64];

#[derive(Debug, Error)]
pub enum TdxAttestError {
    #[error("unexpected error: {0}")]
    Unexpected(String),
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("out of memory")]
    OutOfMemory,
    #[error("vsock failure")]
    VsockFailure,
    #[error("report failure")]
    ReportFailure,
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("library unavailable: {0}")]
    LibraryUnavailable(String),
    #[error("quote failure: {0}")]
    QuoteFailure(String),
    #[error("device busy")]
    Busy,
    #[error("device failure")]
    DeviceFailure,
    #[error("unsupported attestation key ID")]
    UnsupportedAttKeyId,
}

impl TdxAttestError {
    /// Map a `tdx_attest_error_t` returned by `libtdx_attest`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0x02 => Self::InvalidParameter,
            0x03 => Self::OutOfMemory,
            0x04 => Self::VsockFailure,
            0x05 => Self::ReportFailure,
            0x07 => Self::NotSupported("reported by libtdx_attest".into()),
            0x08 => Self::QuoteFailure("libtdx_attest".into()),
            0x09 => Self::Busy,
            0x0a => Self::DeviceFailure,
            0x0c => Self::UnsupportedAttKeyId,
            other => Self::Unexpected(format!("tdx_attest error 0x{other:04x}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_library_codes() {
        assert!(matches!(TdxAttestError::from_code(0x09), TdxAttestError::Busy));
        assert!(matches!(
            TdxAttestError::from_code(0x0c),
            TdxAttestError::UnsupportedAttKeyId
        ));
        assert_eq!(
            TdxAttestError::from_code(0x01).to_string(),
            "unexpected error: tdx_attest error 0x0001"
        );
    }
}
