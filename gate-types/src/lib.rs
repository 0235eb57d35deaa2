// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Data model shared by the quote proxy (inside the TD) and the attestation
//! gateway (outside the trust boundary).

pub use measurements::{Baseline, Measurements, TdQuote};
pub use quote::{QuoteMethod, QuoteRequest, QuoteResponse, QuoteStatus, REPORT_DATA_SIZE};
pub use registration::{Registration, RegistrationError, RegistrationRecord};
pub use verification::{
    DcapResult, GithubResult, MeasurementResult, VerificationResult, VerificationStatus,
};

mod measurements;
mod quote;
mod registration;
mod verification;
