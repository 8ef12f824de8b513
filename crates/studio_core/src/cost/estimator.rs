//! Additive cost model.

use serde::{Deserialize, Serialize};

use crate::config::{CostSettings, Settings};
use crate::models::JobRequest;

/// Predicted cost of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Predicted cost.
    pub amount: f64,
    /// Currency or resource unit.
    pub unit: String,
    /// Fractional uncertainty; the estimate may be off by `amount * band`.
    pub band: f64,
    /// Whether the band was widened because an input fell outside the
    /// normal ranges.
    pub widened: bool,
}

impl CostEstimate {
    /// Amount to reserve against the budget: the top of the confidence band.
    pub fn upper_bound(&self) -> f64 {
        self.amount * (1.0 + self.band)
    }
}

/// Computes cost estimates from a unit cost table.
#[derive(Debug, Clone)]
pub struct CostEstimator {
    table: CostSettings,
    unit: String,
}

impl CostEstimator {
    pub fn new(table: CostSettings, unit: impl Into<String>) -> Self {
        Self {
            table,
            unit: unit.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.cost.clone(), settings.admission.currency.clone())
    }

    /// Estimate a request: each stage and each target platform adds its
    /// unit cost.
    pub fn estimate(&self, request: &JobRequest) -> CostEstimate {
        let stage_cost: f64 = request
            .stages
            .iter()
            .map(|stage| self.table.stage_cost(*stage))
            .sum();
        let platform_cost = self.table.per_platform * request.platforms.len() as f64;

        let widened = !self.within_normal_range(request);
        let band = if widened {
            self.table.widened_band
        } else {
            self.table.base_band
        };

        CostEstimate {
            amount: stage_cost + platform_cost,
            unit: self.unit.clone(),
            band,
            widened,
        }
    }

    fn within_normal_range(&self, request: &JobRequest) -> bool {
        let duration_ok = request.target_duration_secs.map_or(true, |secs| {
            secs >= self.table.normal_min_duration_secs
                && secs <= self.table.normal_max_duration_secs
        });
        let platforms_ok = request.platforms.len() <= self.table.normal_max_platforms;
        duration_ok && platforms_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StageKind;
    use std::collections::BTreeMap;

    fn table() -> CostSettings {
        CostSettings {
            script: 1.0,
            audio: 2.0,
            video: 10.0,
            platform: 0.5,
            per_platform: 0.25,
            base_band: 0.1,
            widened_band: 0.5,
            normal_min_duration_secs: 15,
            normal_max_duration_secs: 120,
            normal_max_platforms: 2,
        }
    }

    fn request(stages: Vec<StageKind>, platforms: &[&str]) -> JobRequest {
        JobRequest::new(
            "sheet",
            "row",
            BTreeMap::new(),
            stages,
            platforms.iter().map(|p| p.to_string()).collect(),
        )
    }

    #[test]
    fn cost_is_additive_over_stages_and_platforms() {
        let estimator = CostEstimator::new(table(), "USD");
        let estimate = estimator.estimate(&request(StageKind::ALL.to_vec(), &["a", "b"]));

        assert!((estimate.amount - 14.0).abs() < 1e-9);
        assert_eq!(estimate.unit, "USD");
        assert!(!estimate.widened);
        assert!((estimate.upper_bound() - 15.4).abs() < 1e-9);
    }

    #[test]
    fn estimate_is_deterministic() {
        let estimator = CostEstimator::new(table(), "USD");
        let req = request(vec![StageKind::Script, StageKind::Audio], &["a"]);
        assert_eq!(estimator.estimate(&req), estimator.estimate(&req));
    }

    #[test]
    fn band_widens_outside_normal_ranges() {
        let estimator = CostEstimator::new(table(), "USD");

        let many_platforms = request(vec![StageKind::Script], &["a", "b", "c"]);
        assert!(estimator.estimate(&many_platforms).widened);

        let long = request(vec![StageKind::Video], &["a"]).with_duration(600);
        let estimate = estimator.estimate(&long);
        assert!(estimate.widened);
        assert_eq!(estimate.band, 0.5);

        let short = request(vec![StageKind::Video], &["a"]).with_duration(5);
        assert!(estimator.estimate(&short).widened);

        let normal = request(vec![StageKind::Video], &["a"]).with_duration(60);
        assert!(!estimator.estimate(&normal).widened);
    }
}
