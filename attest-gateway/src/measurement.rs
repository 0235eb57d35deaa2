// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use gate_types::{Baseline, MeasurementResult, Measurements};

use crate::GateError;

/// Compare quoted registers with the captured baseline.
///
/// Case is the only thing normalised. A baseline of a different length or encoding
/// is a mismatch, not an error.
pub fn compare(actual: &Measurements, expected: Option<&Baseline>) -> MeasurementResult {
    let Some(expected) = expected else {
        return MeasurementResult {
            actual: Some(actual.clone()),
            ..MeasurementResult::failed(GateError::NoBaseline.to_string())
        };
    };

    let matches: Vec<bool> = actual
        .fields()
        .iter()
        .zip(expected.fields())
        .map(|((_, a), (_, e))| a.eq_ignore_ascii_case(e))
        .collect();
    let mismatched: Vec<&str> = actual
        .fields()
        .iter()
        .zip(&matches)
        .filter(|(_, ok)| !**ok)
        .map(|((name, _), _)| *name)
        .collect();

    MeasurementResult {
        verified: mismatched.is_empty(),
        mrtd_match: matches[0],
        rtmr0_match: matches[1],
        rtmr1_match: matches[2],
        rtmr2_match: matches[3],
        rtmr3_match: matches[4],
        actual: Some(actual.clone()),
        expected: Some(Measurements {
            mrtd: expected.mrtd.clone(),
            rtmr0: expected.rtmr0.clone(),
            rtmr1: expected.rtmr1.clone(),
            rtmr2: expected.rtmr2.clone(),
            rtmr3: expected.rtmr3.clone(),
        }),
        error: (!mismatched.is_empty())
            .then(|| format!("measurement mismatch: {}", mismatched.join(", "))),
    }
}
