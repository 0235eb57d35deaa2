// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! DCAP quote verification through Intel's Quote Verification Library.
//!
//! The library is opened once at startup. When it cannot be opened the verifier runs
//! in mock mode: structural checks only, always flagged as such in the result.

use std::ffi::c_void;
use std::ptr;

use chrono::{DateTime, Utc};
use gate_types::DcapResult;
use libloading::{Library, Symbol};
use tracing::{info, warn};

use crate::GateError;

pub const MOCK_STATUS: &str = "MOCK";
pub const MOCK_TCB_STATUS: &str = "MockVerification";
pub const MOCK_NOTICE: &str = "DCAP library not available - structural validation only";

const QUOTE_HEADER_SIZE: usize = 48;
/// Offset of `earliest_expiration_date` in `sgx_ql_qv_supplemental_t`.
const SUPPLEMENTAL_EXPIRATION_OFFSET: usize = 24;

type GetSupplementalDataSizeFn = unsafe extern "C" fn(p_data_size: *mut u32) -> u32;

type VerifyQuoteFn = unsafe extern "C" fn(
    p_quote: *const u8,
    quote_size: u32,
    p_quote_collateral: *const c_void,
    expiration_check_date: i64,
    p_collateral_expiration_status: *mut u32,
    p_quote_verification_result: *mut u32,
    p_qve_report_info: *mut c_void,
    supplemental_data_size: u32,
    p_supplemental_data: *mut u8,
) -> u32;

const GET_SUPPLEMENTAL_DATA_SIZE: &[u8] = b"sgx_qv_get_quote_supplemental_data_size\0";
const VERIFY_QUOTE: &[u8] = b"sgx_qv_verify_quote\0";

/// `sgx_ql_qv_result_t` as a status name and, where it has one, a TCB status.
fn qv_result(code: u32) -> (&'static str, Option<&'static str>) {
    match code {
        0x0000 => ("OK", Some("UpToDate")),
        0xA001 => ("CONFIG_NEEDED", Some("ConfigurationNeeded")),
        0xA002 => ("OUT_OF_DATE", Some("OutOfDate")),
        0xA003 => (
            "OUT_OF_DATE_CONFIG_NEEDED",
            Some("OutOfDateConfigurationNeeded"),
        ),
        0xA004 => ("INVALID_SIGNATURE", None),
        0xA005 => ("REVOKED", Some("Revoked")),
        0xA006 => ("UNSPECIFIED", None),
        0xA007 => ("SW_HARDENING_NEEDED", Some("SWHardeningNeeded")),
        0xA008 => (
            "CONFIG_AND_SW_HARDENING_NEEDED",
            Some("ConfigurationAndSWHardeningNeeded"),
        ),
        0xA009 => ("TD_RELAUNCH_ADVISED", Some("TDRelaunchAdvised")),
        0xA00A => (
            "TD_RELAUNCH_ADVISED_CONFIG_NEEDED",
            Some("TDRelaunchAdvisedConfigurationNeeded"),
        ),
        _ => ("UNKNOWN", None),
    }
}

pub struct QvlLibrary {
    lib: Library,
    path: String,
}

impl QvlLibrary {
    pub fn load(path: &str) -> Result<Self, GateError> {
        let unavailable = |e: libloading::Error| GateError::LibraryUnavailable(format!("{path}: {e}"));
        let lib = unsafe { Library::new(path) }.map_err(unavailable)?;
        unsafe {
            lib.get::<GetSupplementalDataSizeFn>(GET_SUPPLEMENTAL_DATA_SIZE)
                .map_err(unavailable)?;
            lib.get::<VerifyQuoteFn>(VERIFY_QUOTE).map_err(unavailable)?;
        }
        Ok(Self {
            lib,
            path: path.to_string(),
        })
    }

    fn verify(&self, quote: &[u8]) -> DcapResult {
        let symbols: (
            Result<Symbol<GetSupplementalDataSizeFn>, _>,
            Result<Symbol<VerifyQuoteFn>, _>,
        ) = unsafe {
            (
                self.lib.get(GET_SUPPLEMENTAL_DATA_SIZE),
                self.lib.get(VERIFY_QUOTE),
            )
        };
        let (get_supplemental_size, verify_quote) = match symbols {
            (Ok(size), Ok(verify)) => (size, verify),
            (Err(e), _) | (_, Err(e)) => {
                return DcapResult::failed("ERROR", format!("{}: {e}", self.path))
            }
        };
        let Ok(quote_size) = u32::try_from(quote.len()) else {
            return DcapResult::failed("INVALID_FORMAT", "quote too large");
        };

        let mut supplemental_size: u32 = 0;
        if unsafe { get_supplemental_size(&mut supplemental_size) } != 0 {
            supplemental_size = 0;
        }
        let mut supplemental = vec![0u8; supplemental_size as usize];
        let supplemental_ptr = if supplemental.is_empty() {
            ptr::null_mut()
        } else {
            supplemental.as_mut_ptr()
        };

        let mut collateral_expiration_status: u32 = 0;
        let mut verification_result: u32 = 0;
        let ret = unsafe {
            verify_quote(
                quote.as_ptr(),
                quote_size,
                ptr::null(),
                Utc::now().timestamp(),
                &mut collateral_expiration_status,
                &mut verification_result,
                ptr::null_mut(),
                supplemental_size,
                supplemental_ptr,
            )
        };
        if ret != 0 {
            return DcapResult::failed(
                "ERROR",
                format!("quote verification failed with code 0x{ret:04x}"),
            );
        }

        let (status, tcb_status) = qv_result(verification_result);
        let verified = verification_result == 0;
        DcapResult {
            verified,
            status: status.into(),
            tcb_status: tcb_status.map(Into::into),
            collateral_expiry: collateral_expiry(&supplemental),
            mock: false,
            error: (!verified).then(|| format!("verification status: {status}")),
        }
    }
}

fn collateral_expiry(supplemental: &[u8]) -> Option<DateTime<Utc>> {
    let bytes = supplemental.get(SUPPLEMENTAL_EXPIRATION_OFFSET..SUPPLEMENTAL_EXPIRATION_OFFSET + 8)?;
    let secs = i64::from_le_bytes(bytes.try_into().ok()?);
    (secs > 0).then(|| DateTime::from_timestamp(secs, 0)).flatten()
}

/// Structural validation used when the QVL cannot be loaded.
fn mock_verify(quote: &[u8]) -> DcapResult {
    if quote.is_empty() {
        return DcapResult::failed("INVALID_FORMAT", "empty quote");
    }
    if quote.len() >= QUOTE_HEADER_SIZE {
        let version = u16::from_le_bytes([quote[0], quote[1]]);
        if version != 4 && version != 5 {
            return DcapResult {
                mock: true,
                ..DcapResult::failed(
                    "INVALID_QUOTE_VERSION",
                    format!("unexpected quote version: {version}"),
                )
            };
        }
    }
    warn!("DCAP library not available, quote accepted on structure only");
    DcapResult {
        verified: true,
        status: MOCK_STATUS.into(),
        tcb_status: Some(MOCK_TCB_STATUS.into()),
        collateral_expiry: None,
        mock: true,
        error: Some(MOCK_NOTICE.into()),
    }
}

/// Quote verification as the pipeline sees it.
pub trait QuoteVerifier: Send + Sync {
    /// Blocking; callers run it off the async executor.
    fn verify(&self, quote: &[u8]) -> DcapResult;
}

/// DCAP verification capability, fixed at startup.
pub enum DcapVerifier {
    Qvl(QvlLibrary),
    Mock,
}

impl DcapVerifier {
    pub fn load(path: Option<&str>) -> Self {
        let Some(path) = path else {
            warn!("no DCAP library configured, running in mock mode");
            return Self::Mock;
        };
        match QvlLibrary::load(path) {
            Ok(lib) => {
                info!(path, "loaded DCAP quote verification library");
                Self::Qvl(lib)
            }
            Err(err) => {
                warn!("{err}, running in mock mode");
                Self::Mock
            }
        }
    }

    pub fn is_library_available(&self) -> bool {
        matches!(self, Self::Qvl(_))
    }
}

impl QuoteVerifier for DcapVerifier {
    fn verify(&self, quote: &[u8]) -> DcapResult {
        match self {
            Self::Qvl(lib) => {
                if quote.is_empty() {
                    return DcapResult::failed("INVALID_FORMAT", "empty quote");
                }
                lib.verify(quote)
            }
            Self::Mock => mock_verify(quote),
        }
    }
}
