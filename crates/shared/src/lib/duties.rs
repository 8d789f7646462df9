use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Duty accumulator has more included than assigned: {included} > {assigned}")]
    IncludedAboveAssigned { assigned: u64, included: u64 },

    #[error("Computed performance {0} is above 1")]
    PerformanceAboveOne(f64),
}

/// Aggregate of duties of one kind observed for a validator (or the whole
/// network) over a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutyAccumulator {
    pub assigned: u64,
    pub included: u64,
}

impl DutyAccumulator {
    pub fn perf(&self) -> f64 {
        if self.assigned == 0 {
            return 0.0;
        }
        self.included as f64 / self.assigned as f64
    }

    pub fn add(&mut self, included: bool) {
        self.assigned += 1;
        if included {
            self.included += 1;
        }
    }

    pub fn merge(&mut self, other: DutyAccumulator) {
        self.assigned += other.assigned;
        self.included += other.included;
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.included > self.assigned {
            return Err(Error::IncludedAboveAssigned {
                assigned: self.assigned,
                included: self.included,
            });
        }
        Ok(())
    }
}

/// Per-validator (or network-wide) duty aggregates for a frame. A missing
/// duty kind means the validator had no such assignment and contributes
/// nothing to the weighted performance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorDuties {
    pub attestation: Option<DutyAccumulator>,
    pub proposal: Option<DutyAccumulator>,
    pub sync: Option<DutyAccumulator>,
}

/// Weights of the duty kinds in the overall performance metric. The defaults
/// mirror the attestation/proposal/sync reward proportions of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceCoefficients {
    pub attestations_weight: u64,
    pub blocks_weight: u64,
    pub sync_weight: u64,
}

impl Default for PerformanceCoefficients {
    fn default() -> Self {
        Self {
            attestations_weight: 54,
            blocks_weight: 8,
            sync_weight: 2,
        }
    }
}

impl PerformanceCoefficients {
    /// Weighted average of the present duty performances. Kinds the validator
    /// was never assigned carry zero weight.
    pub fn calc_performance(&self, duties: &ValidatorDuties) -> Result<f64, Error> {
        let mut acc = 0.0;
        let mut total_weight = 0u64;

        for (duty, weight) in [
            (duties.attestation, self.attestations_weight),
            (duties.proposal, self.blocks_weight),
            (duties.sync, self.sync_weight),
        ] {
            if let Some(duty) = duty {
                duty.validate()?;
                acc += duty.perf() * weight as f64;
                total_weight += weight;
            }
        }

        if total_weight == 0 {
            return Ok(0.0);
        }

        let performance = acc / total_weight as f64;
        if performance > 1.0 {
            return Err(Error::PerformanceAboveOne(performance));
        }
        Ok(performance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acc(assigned: u64, included: u64) -> Option<DutyAccumulator> {
        Some(DutyAccumulator { assigned, included })
    }

    #[test]
    fn perf_of_unassigned_is_zero() {
        assert_eq!(DutyAccumulator::default().perf(), 0.0);
    }

    #[test]
    fn performance_weighs_only_present_duties() {
        let coeffs = PerformanceCoefficients::default();

        let att_only = ValidatorDuties {
            attestation: acc(10, 5),
            proposal: None,
            sync: None,
        };
        assert_eq!(coeffs.calc_performance(&att_only).unwrap(), 0.5);

        let all = ValidatorDuties {
            attestation: acc(10, 10),
            proposal: acc(1, 1),
            sync: acc(32, 32),
        };
        assert_eq!(coeffs.calc_performance(&all).unwrap(), 1.0);

        let mixed = ValidatorDuties {
            attestation: acc(10, 10),
            proposal: acc(1, 0),
            sync: None,
        };
        let expected = 54.0 / 62.0;
        assert!((coeffs.calc_performance(&mixed).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn included_above_assigned_is_an_error() {
        let duties = ValidatorDuties {
            attestation: acc(1, 2),
            proposal: None,
            sync: None,
        };
        assert!(matches!(
            PerformanceCoefficients::default().calc_performance(&duties),
            Err(Error::IncludedAboveAssigned { .. })
        ));
    }
}
