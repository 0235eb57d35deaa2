// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::ptr;

use libloading::{Library, Symbol};
use tracing::debug;

use crate::{Result, TdxAttestError, TdxReportData};

pub const DEFAULT_LIBRARY: &str = "libtdx_attest.so.1";

type TdxUuid = [u8; 16];

type GetQuoteFn = unsafe extern "C" fn(
    p_tdx_report_data: *const TdxReportData,
    att_key_id_list: *const TdxUuid,
    list_size: u32,
    p_att_key_id: *mut TdxUuid,
    pp_quote: *mut *mut u8,
    p_quote_size: *mut u32,
    flags: u32,
) -> u32;

type FreeQuoteFn = unsafe extern "C" fn(p_quote: *mut u8) -> u32;

const GET_QUOTE: &[u8] = b"tdx_att_get_quote\0";
const FREE_QUOTE: &[u8] = b"tdx_att_free_quote\0";

/// Intel `libtdx_attest`, opened once and kept for the life of the process.
pub struct NativeLib {
    lib: Library,
    path: String,
}

impl std::fmt::Debug for NativeLib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLib").field("path", &self.path).finish()
    }
}

impl NativeLib {
    /// Open the library and make sure both entry points resolve.
    pub fn load(path: &str) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| TdxAttestError::LibraryUnavailable(format!("{path}: {e}")))?;
        unsafe {
            lib.get::<GetQuoteFn>(GET_QUOTE)
                .map_err(|e| TdxAttestError::LibraryUnavailable(format!("{path}: {e}")))?;
            lib.get::<FreeQuoteFn>(FREE_QUOTE)
                .map_err(|e| TdxAttestError::LibraryUnavailable(format!("{path}: {e}")))?;
        }
        debug!(path, "loaded libtdx_attest");
        Ok(Self {
            lib,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Generate a quote over `report_data` with the platform default attestation key.
    pub fn get_quote(&self, report_data: &TdxReportData) -> Result<Vec<u8>> {
        let (get_quote, free_quote): (Symbol<GetQuoteFn>, Symbol<FreeQuoteFn>) = unsafe {
            (
                self.lib
                    .get(GET_QUOTE)
                    .map_err(|e| TdxAttestError::LibraryUnavailable(e.to_string()))?,
                self.lib
                    .get(FREE_QUOTE)
                    .map_err(|e| TdxAttestError::LibraryUnavailable(e.to_string()))?,
            )
        };

        let mut att_key_id: TdxUuid = [0; 16];
        let mut quote_ptr: *mut u8 = ptr::null_mut();
        let mut quote_size: u32 = 0;
        let rc = unsafe {
            get_quote(
                report_data,
                ptr::null(),
                0,
                &mut att_key_id,
                &mut quote_ptr,
                &mut quote_size,
                0,
            )
        };
        if rc != 0 {
            return Err(TdxAttestError::from_code(rc));
        }
        if quote_ptr.is_null() || quote_size == 0 {
            return Err(TdxAttestError::QuoteFailure(
                "libtdx_attest returned an empty quote".into(),
            ));
        }

        let quote = unsafe { std::slice::from_raw_parts(quote_ptr, quote_size as usize) }.to_vec();
        unsafe {
            free_quote(quote_ptr);
        }
        Ok(quote)
    }
}
