// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TDX quote generation through the Linux TSM configfs interface.
//!
//! The kernel exposes one report entry per directory under the TSM base. A quote is
//! produced by writing report data to `inblob` and reading `outblob`; the
//! `generation` counter detects a concurrent writer between the two steps.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use fs_err::{self as fs, File, OpenOptions};
use tracing::debug;

use crate::{Result, TdxAttestError, TdxReportData};

pub const DEFAULT_CONFIGFS_BASE: &str = "/sys/kernel/config/tsm/report";
const ENTRY_NAME: &str = "com.intel.dcap";
const QUOTE_BUF_SIZE: usize = 8 * 1024;
const QUOTE_MIN_SIZE: usize = 1020;
const MAX_RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);
const GENERATION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Configfs {
    base: PathBuf,
    lock: Mutex<()>,
}

impl std::fmt::Debug for Configfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configfs").field("base", &self.base).finish()
    }
}

impl Configfs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Whether the TSM report base is mounted.
    pub fn is_available(&self) -> bool {
        self.base.is_dir()
    }

    pub fn get_quote(&self, report_data: &TdxReportData) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().map_err(|_| TdxAttestError::Busy)?;
        let entry = self.prepare_entry()?;

        let inblob = entry.join("inblob");
        let outblob = entry.join("outblob");
        let generation = entry.join("generation");

        // Serialise against other processes using the same entry.
        let lock_file = OpenOptions::new()
            .write(true)
            .open(&inblob)
            .map_err(|e| TdxAttestError::Unexpected(e.to_string()))?;
        let ret = unsafe { libc::flock(lock_file.file().as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            return Err(TdxAttestError::Unexpected(format!(
                "flock {}: {err}",
                inblob.display()
            )));
        }

        let gen1 = read_generation(&generation)?;
        write_inblob_with_retry(&inblob, report_data)?;

        let gen2 = wait_for_generation_change(&generation, gen1)?;
        if gen2 != gen1 + 1 {
            debug!(gen1, gen2, "concurrent quote generation detected");
            return Err(TdxAttestError::Busy);
        }

        let quote = read_outblob_with_retry(&outblob)?;

        let gen3 = read_generation(&generation)?;
        if gen3 != gen2 {
            debug!(gen2, gen3, "concurrent quote generation detected after read");
            return Err(TdxAttestError::Busy);
        }

        if quote.len() <= QUOTE_MIN_SIZE || quote.len() >= QUOTE_BUF_SIZE {
            return Err(TdxAttestError::QuoteFailure(format!(
                "invalid quote size: {}",
                quote.len()
            )));
        }
        Ok(quote)
    }

    /// Locate the report entry, creating it if the kernel allows.
    fn prepare_entry(&self) -> Result<PathBuf> {
        if !self.is_available() {
            return Err(TdxAttestError::NotSupported(format!(
                "configfs base not found: {}",
                self.base.display()
            )));
        }
        let entry = self.base.join(ENTRY_NAME);
        if !entry.is_dir() && fs::create_dir(&entry).is_err() && !entry.is_dir() {
            return Err(TdxAttestError::NotSupported(format!(
                "failed to create {}",
                entry.display()
            )));
        }
        let provider_path = entry.join("provider");
        for i in 0..5u64 {
            if provider_path.exists() {
                break;
            }
            thread::sleep(Duration::from_micros(i));
        }
        let provider = fs::read_to_string(&provider_path)
            .map_err(|e| TdxAttestError::NotSupported(e.to_string()))?;
        if !provider.trim().starts_with("tdx_guest") {
            return Err(TdxAttestError::NotSupported(format!(
                "unexpected TSM provider: {}",
                provider.trim()
            )));
        }
        Ok(entry)
    }
}

fn read_generation(path: &Path) -> Result<i64> {
    let content = fs::read_to_string(path).map_err(|e| TdxAttestError::Unexpected(e.to_string()))?;
    content
        .trim()
        .parse()
        .map_err(|e| TdxAttestError::Unexpected(format!("parse generation: {e}")))
}

fn write_inblob_with_retry(path: &Path, data: &TdxReportData) -> Result<()> {
    let mut last_err = None;
    for _ in 0..MAX_RETRIES {
        let mut file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        match file.write_all(data) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                thread::sleep(RETRY_DELAY);
                last_err = Some(e);
            }
            Err(e) => return Err(TdxAttestError::Unexpected(e.to_string())),
        }
    }
    match last_err {
        Some(e) if e.raw_os_error() == Some(libc::EBUSY) => Err(TdxAttestError::Busy),
        Some(e) => Err(TdxAttestError::Unexpected(e.to_string())),
        None => Err(TdxAttestError::Unexpected("unknown error".into())),
    }
}

fn wait_for_generation_change(path: &Path, current: i64) -> Result<i64> {
    let deadline = Instant::now() + GENERATION_TIMEOUT;
    loop {
        let gen = read_generation(path)?;
        if gen != current {
            return Ok(gen);
        }
        if Instant::now() > deadline {
            return Err(TdxAttestError::QuoteFailure(
                "timed out waiting for the quote generation counter".into(),
            ));
        }
        thread::sleep(Duration::from_micros(10));
    }
}

fn read_outblob_with_retry(path: &Path) -> Result<Vec<u8>> {
    let mut last_err = None;
    for _ in 0..MAX_RETRIES {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        let mut buf = vec![0u8; QUOTE_BUF_SIZE];
        match file.read(&mut buf) {
            Ok(0) => return Err(TdxAttestError::QuoteFailure("empty outblob".into())),
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(0);
                if errno == libc::EBUSY || errno == libc::EINTR || errno == libc::ETIMEDOUT {
                    thread::sleep(RETRY_DELAY);
                    last_err = Some(e);
                    continue;
                }
                return Err(TdxAttestError::QuoteFailure(e.to_string()));
            }
        }
    }
    Err(TdxAttestError::QuoteFailure(
        last_err.map_or_else(|| "unknown error".into(), |e| e.to_string()),
    ))
}
