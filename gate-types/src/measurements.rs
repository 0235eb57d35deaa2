// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{bail, Context, Result};
use dcap_qvl::quote::{Quote, Report, TDReport10};
use scale::Encode;
use serde::{Deserialize, Serialize};

/// MRTD and RTMR0..3 of a trust domain, lowercase hex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurements {
    pub mrtd: String,
    pub rtmr0: String,
    pub rtmr1: String,
    pub rtmr2: String,
    pub rtmr3: String,
}

impl Measurements {
    fn from_td_report(report: &TDReport10) -> Self {
        Self {
            mrtd: hex::encode(report.mr_td),
            rtmr0: hex::encode(report.rt_mr0),
            rtmr1: hex::encode(report.rt_mr1),
            rtmr2: hex::encode(report.rt_mr2),
            rtmr3: hex::encode(report.rt_mr3),
        }
    }

    /// Field name and value pairs in register order.
    pub fn fields(&self) -> [(&'static str, &str); 5] {
        [
            ("mrtd", &self.mrtd),
            ("rtmr0", &self.rtmr0),
            ("rtmr1", &self.rtmr1),
            ("rtmr2", &self.rtmr2),
            ("rtmr3", &self.rtmr3),
        ]
    }
}

/// Measurement snapshot captured from a trusted first deployment.
///
/// A baseline is evidence, not a computation: it can only come from a quote.
/// The five registers are either all present (`Some(Baseline)`) or all absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub mrtd: String,
    pub rtmr0: String,
    pub rtmr1: String,
    pub rtmr2: String,
    pub rtmr3: String,
}

impl Baseline {
    pub fn fields(&self) -> [(&'static str, &str); 5] {
        [
            ("mrtd", &self.mrtd),
            ("rtmr0", &self.rtmr0),
            ("rtmr1", &self.rtmr1),
            ("rtmr2", &self.rtmr2),
            ("rtmr3", &self.rtmr3),
        ]
    }
}

impl From<Measurements> for Baseline {
    fn from(m: Measurements) -> Self {
        Self {
            mrtd: m.mrtd,
            rtmr0: m.rtmr0,
            rtmr1: m.rtmr1,
            rtmr2: m.rtmr2,
            rtmr3: m.rtmr3,
        }
    }
}

const TEE_TYPE_TDX: u32 = 0x81;
const ATTESTATION_KEY_ECDSA_P256: u16 = 2;
const CERT_TYPE_PCK_CHAIN: u16 = 5;
const CERT_TYPE_QE_REPORT: u16 = 6;
const TD_REPORT10_SIZE: usize = 584;
const MR_TD_OFFSET: usize = 136;
const RT_MR0_OFFSET: usize = 328;
const REPORT_DATA_OFFSET: usize = 520;

/// The parts of a TDX quote the gateway and the proxy care about.
#[derive(Debug, Clone)]
pub struct TdQuote {
    pub version: u16,
    pub measurements: Measurements,
    pub report_data: [u8; 64],
}

impl TdQuote {
    /// Parse a raw TDX quote (v4, or v5 with a TD 1.0 or TD 1.5 body).
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            bail!("empty quote");
        }
        let quote = Quote::parse(raw).context("failed to parse quote")?;
        let report = match &quote.report {
            Report::TD10(report) => report,
            Report::TD15(report) => &report.base,
            Report::SgxEnclave(_) => bail!("not a TDX quote: SGX enclave report"),
        };
        Ok(Self {
            version: quote.header.version,
            measurements: Measurements::from_td_report(report),
            report_data: report.report_data,
        })
    }

    /// A v4 quote with the given registers, zeroed signatures and an empty PCK chain.
    ///
    /// Parses like a real quote but never passes DCAP verification. Meant for
    /// fixtures and for exercising the pipeline without hardware.
    pub fn unsigned_v4(mr_td: [u8; 48], rtmrs: [[u8; 48]; 4], report_data: [u8; 64]) -> Vec<u8> {
        let mut body = vec![0u8; TD_REPORT10_SIZE];
        body[MR_TD_OFFSET..MR_TD_OFFSET + 48].copy_from_slice(&mr_td);
        for (i, rtmr) in rtmrs.iter().enumerate() {
            let offset = RT_MR0_OFFSET + i * 48;
            body[offset..offset + 48].copy_from_slice(rtmr);
        }
        body[REPORT_DATA_OFFSET..].copy_from_slice(&report_data);

        // QE report certification data: report, signature, auth data, PCK chain.
        let mut qe_certification = ([0u8; 384], [0u8; 64], 0u16).encode();
        (CERT_TYPE_PCK_CHAIN, 0u32).encode_to(&mut qe_certification);

        let mut auth_data = ([0u8; 64], [0u8; 64], CERT_TYPE_QE_REPORT).encode();
        auth_data.extend_from_slice(&length_prefixed(&qe_certification));

        let mut out = (
            4u16,
            ATTESTATION_KEY_ECDSA_P256,
            TEE_TYPE_TDX,
            0u16,
            0u16,
            [0u8; 16],
            [0u8; 20],
        )
            .encode();
        out.extend_from_slice(&body);
        out.extend_from_slice(&length_prefixed(&auth_data));
        out
    }
}

/// `u32` little-endian length followed by the bytes.
fn length_prefixed(bytes: &[u8]) -> Vec<u8> {
    let mut out = (bytes.len() as u32).encode();
    out.extend_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_garbage() {
        assert!(TdQuote::parse(&[]).is_err());
        assert!(TdQuote::parse(&[0x04, 0x00, 0x02, 0x00, 0x81]).is_err());
        let mut sgx = TdQuote::unsigned_v4([0; 48], [[0; 48]; 4], [0; 64]);
        sgx[4] = 0;
        assert!(TdQuote::parse(&sgx).is_err());
    }

    #[test]
    fn parses_registers_at_quote_offsets() {
        let raw = TdQuote::unsigned_v4(
            [0xaa; 48],
            [[0xb0; 48], [0xb1; 48], [0xb2; 48], [0xb3; 48]],
            [0x5a; 64],
        );
        assert_eq!(raw.len(), 48 + 584 + 4 + 590);
        assert_eq!(raw[184], 0xaa);
        assert_eq!(raw[376], 0xb0);
        assert_eq!(raw[568], 0x5a);

        let quote = TdQuote::parse(&raw).unwrap();
        assert_eq!(quote.version, 4);
        assert_eq!(quote.measurements.mrtd, "aa".repeat(48));
        assert_eq!(quote.measurements.rtmr2, "b2".repeat(48));
        assert_eq!(quote.report_data, [0x5a; 64]);
    }

    #[test]
    fn parses_v5_with_td10_body() {
        let v4 = TdQuote::unsigned_v4([0x01; 48], [[0x02; 48]; 4], [0x03; 64]);
        let mut v5 = v4[..48].to_vec();
        v5[0] = 5;
        v5.extend_from_slice(&2u16.to_le_bytes());
        v5.extend_from_slice(&584u32.to_le_bytes());
        v5.extend_from_slice(&v4[48..]);
        let quote = TdQuote::parse(&v5).unwrap();
        assert_eq!(quote.version, 5);
        assert_eq!(quote.measurements.rtmr3, "02".repeat(48));
    }

    #[test]
    fn baseline_from_measurements_keeps_order() {
        let m = Measurements {
            mrtd: "aa".into(),
            rtmr0: "bb".into(),
            rtmr1: "cc".into(),
            rtmr2: "dd".into(),
            rtmr3: "ee".into(),
        };
        let b = Baseline::from(m.clone());
        let names: Vec<_> = b.fields().iter().map(|(n, v)| format!("{n}={v}")).collect();
        assert_eq!(names, ["mrtd=aa", "rtmr0=bb", "rtmr1=cc", "rtmr2=dd", "rtmr3=ee"]);
        assert_eq!(m.fields()[3], ("rtmr2", "dd"));
    }
}
