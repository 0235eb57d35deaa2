// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use gate_types::{QuoteMethod, QuoteResponse, QuoteStatus, TdQuote, REPORT_DATA_SIZE};
use tdx_attest::{Configfs, NativeLib, TdxAttestError, TdxReportData};
use thiserror::Error;
use tracing::{info, warn, Level};

use crate::{config::Config, LogRing};

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("quote unavailable: {0}")]
    QuoteUnavailable(String),
    #[error("invalid report data: {0}")]
    InvalidReportData(String),
}

/// One way of obtaining TD evidence.
pub trait Backend: Send + Sync {
    fn method(&self) -> QuoteMethod;
    fn is_available(&self) -> bool;
    fn get_quote(&self, report_data: &TdxReportData) -> tdx_attest::Result<Vec<u8>>;
}

impl Backend for NativeLib {
    fn method(&self) -> QuoteMethod {
        QuoteMethod::Native
    }

    fn is_available(&self) -> bool {
        true
    }

    fn get_quote(&self, report_data: &TdxReportData) -> tdx_attest::Result<Vec<u8>> {
        NativeLib::get_quote(self, report_data)
    }
}

impl Backend for Configfs {
    fn method(&self) -> QuoteMethod {
        QuoteMethod::Configfs
    }

    fn is_available(&self) -> bool {
        Configfs::is_available(self)
    }

    fn get_quote(&self, report_data: &TdxReportData) -> tdx_attest::Result<Vec<u8>> {
        Configfs::get_quote(self, report_data)
    }
}

/// The quote source: backends in priority order plus the diagnostic log ring.
pub struct QuoteSource {
    backends: Vec<Box<dyn Backend>>,
    log: Arc<LogRing>,
}

impl QuoteSource {
    pub fn new(backends: Vec<Box<dyn Backend>>, log: Arc<LogRing>) -> Self {
        Self { backends, log }
    }

    /// Native library first when it loads, configfs second.
    pub fn from_config(config: &Config, log: Arc<LogRing>) -> Self {
        let mut backends: Vec<Box<dyn Backend>> = Vec::new();
        match NativeLib::load(&config.tdx_attest_library) {
            Ok(lib) => {
                log.push(Level::INFO, format!("native library loaded from {}", lib.path()));
                info!(path = lib.path(), "using native libtdx_attest");
                backends.push(Box::new(lib));
            }
            Err(err) => {
                log.push(Level::WARN, format!("native library unavailable: {err}"));
                warn!("native libtdx_attest unavailable: {err}");
            }
        }
        let configfs = Configfs::new(&config.configfs_path);
        if configfs.is_available() {
            log.push(
                Level::INFO,
                format!("configfs found at {}", configfs.base().display()),
            );
        } else {
            log.push(
                Level::WARN,
                format!("configfs not found at {}", configfs.base().display()),
            );
        }
        backends.push(Box::new(configfs));
        Self::new(backends, log)
    }

    pub fn log(&self) -> &Arc<LogRing> {
        &self.log
    }

    pub fn status(&self) -> QuoteStatus {
        match self.backends.iter().find(|b| b.is_available()) {
            Some(backend) => QuoteStatus {
                available: true,
                method: backend.method().to_string(),
            },
            None => QuoteStatus {
                available: false,
                method: "none".into(),
            },
        }
    }

    /// Produce a quote bound to `report_data`, zero-padded to 64 bytes.
    ///
    /// Each backend is tried once, in order.
    pub fn quote(&self, report_data: Option<&[u8]>) -> Result<QuoteResponse, QuoteError> {
        let report_data = pad_report_data(report_data.unwrap_or_default())?;
        let mut failures = Vec::new();
        for backend in self.backends.iter().filter(|b| b.is_available()) {
            let method = backend.method();
            match backend.get_quote(&report_data).and_then(|raw| {
                TdQuote::parse(&raw)
                    .map(|parsed| (raw, parsed))
                    .map_err(|e| TdxAttestError::QuoteFailure(format!("{e:#}")))
            }) {
                Ok((raw, parsed)) => {
                    self.log.push(
                        Level::INFO,
                        format!("{method} quote generated, {} bytes", raw.len()),
                    );
                    info!(%method, size = raw.len(), "quote generated");
                    return Ok(QuoteResponse {
                        quote_size: raw.len(),
                        quote: raw,
                        measurements: parsed.measurements,
                        report_data: report_data.to_vec(),
                        method,
                    });
                }
                Err(err) => {
                    self.log.push(Level::WARN, format!("{method} quote failed: {err}"));
                    warn!(%method, "quote generation failed: {err}");
                    failures.push(format!("{method}: {err}"));
                }
            }
        }
        if failures.is_empty() {
            failures.push("no acquisition method present".into());
        }
        Err(QuoteError::QuoteUnavailable(failures.join("; ")))
    }
}

fn pad_report_data(data: &[u8]) -> Result<TdxReportData, QuoteError> {
    if data.len() > REPORT_DATA_SIZE {
        return Err(QuoteError::InvalidReportData(format!(
            "{} bytes, at most {REPORT_DATA_SIZE} allowed",
            data.len()
        )));
    }
    let mut padded = [0u8; REPORT_DATA_SIZE];
    padded[..data.len()].copy_from_slice(data);
    Ok(padded)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the report data into an unsigned quote.
    pub(crate) struct FakeBackend {
        pub method: QuoteMethod,
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    impl FakeBackend {
        pub(crate) fn new(method: QuoteMethod, fail: bool) -> Self {
            Self {
                method,
                fail,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Backend for FakeBackend {
        fn method(&self) -> QuoteMethod {
            self.method
        }

        fn is_available(&self) -> bool {
            true
        }

        fn get_quote(&self, report_data: &TdxReportData) -> tdx_attest::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TdxAttestError::DeviceFailure);
            }
            Ok(TdQuote::unsigned_v4(
                [0xaa; 48],
                [[0xbb; 48], [0xcc; 48], [0xdd; 48], [0xee; 48]],
                *report_data,
            ))
        }
    }

    #[test]
    fn pads_short_report_data() {
        let source = QuoteSource::new(
            vec![Box::new(FakeBackend::new(QuoteMethod::Configfs, false))],
            Arc::new(LogRing::new(8)),
        );
        let resp = source.quote(Some(b"nonce")).unwrap();
        assert_eq!(resp.report_data.len(), 64);
        assert_eq!(&resp.report_data[..5], b"nonce");
        assert!(resp.report_data[5..].iter().all(|b| *b == 0));
        assert_eq!(resp.measurements.rtmr2, "dd".repeat(48));
        assert_eq!(resp.method, QuoteMethod::Configfs);
    }

    #[test]
    fn rejects_oversized_report_data() {
        let source = QuoteSource::new(vec![], Arc::new(LogRing::new(8)));
        assert!(matches!(
            source.quote(Some(&[0u8; 65])),
            Err(QuoteError::InvalidReportData(_))
        ));
    }

    #[test]
    fn falls_through_to_next_backend_once() {
        let log = Arc::new(LogRing::new(8));
        let source = QuoteSource::new(
            vec![
                Box::new(FakeBackend::new(QuoteMethod::Native, true)),
                Box::new(FakeBackend::new(QuoteMethod::Configfs, false)),
            ],
            log.clone(),
        );
        let resp = source.quote(None).unwrap();
        assert_eq!(resp.method, QuoteMethod::Configfs);
        assert_eq!(resp.report_data, vec![0u8; 64]);
        assert!(log.lines()[0].contains("native quote failed"));
    }

    #[test]
    fn unavailable_when_every_backend_fails() {
        let source = QuoteSource::new(
            vec![Box::new(FakeBackend::new(QuoteMethod::Native, true))],
            Arc::new(LogRing::new(8)),
        );
        let err = source.quote(None).unwrap_err();
        assert!(matches!(err, QuoteError::QuoteUnavailable(_)));
        assert!(err.to_string().contains("native: device failure"));

        let empty = QuoteSource::new(vec![], Arc::new(LogRing::new(8)));
        assert_eq!(
            empty.status(),
            QuoteStatus {
                available: false,
                method: "none".into()
            }
        );
    }
}
