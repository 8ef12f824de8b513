//! Admission decisions.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::slots::{SlotGuard, SlotPools};
use crate::config::Settings;
use crate::cost::{CostEstimate, CostEstimator};
use crate::models::{Job, JobId, JobRequest};
use crate::registry::{JobRegistry, RegistryError, RegistryResult};

/// Slack for floating point sums when comparing against the ceiling.
const BUDGET_EPSILON: f64 = 1e-9;

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// A live job already holds the idempotency key.
    Duplicate,
    /// No free slot for the resource class or the source.
    OverCapacity,
    /// Reserving the estimate would exceed the budget ceiling.
    BudgetExceeded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::OverCapacity => "over_capacity",
            Self::BudgetExceeded => "budget_exceeded",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to a job submission: `{accepted, job_id?, reason?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    /// Estimate the decision was based on (absent for duplicates).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<CostEstimate>,
}

impl AdmissionDecision {
    fn accepted(job_id: JobId, estimate: CostEstimate) -> Self {
        Self {
            accepted: true,
            job_id: Some(job_id),
            reason: None,
            estimate: Some(estimate),
        }
    }

    fn rejected(reason: RejectReason, estimate: Option<CostEstimate>) -> Self {
        Self {
            accepted: false,
            job_id: None,
            reason: Some(reason),
            estimate,
        }
    }
}

/// Outcome of [`AdmissionController::admit`].
#[derive(Debug)]
pub enum Admission {
    /// The job was created `queued` and holds `slot` until it finishes.
    Accepted {
        job: Job,
        slot: SlotGuard,
        estimate: CostEstimate,
    },
    Rejected {
        reason: RejectReason,
        estimate: Option<CostEstimate>,
    },
}

impl Admission {
    pub fn decision(&self) -> AdmissionDecision {
        match self {
            Self::Accepted { job, estimate, .. } => {
                AdmissionDecision::accepted(job.id.clone(), estimate.clone())
            }
            Self::Rejected { reason, estimate } => {
                AdmissionDecision::rejected(*reason, estimate.clone())
            }
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Gatekeeper between validated requests and the job registry.
///
/// Decisions are serialized by one lock so that the duplicate, capacity
/// and budget checks together with the job creation are observed as a
/// single step. Everything under the lock is in-memory and never waits.
/// Rejections are final; resubmitting is up to the caller.
pub struct AdmissionController {
    registry: Arc<JobRegistry>,
    estimator: CostEstimator,
    slots: SlotPools,
    budget_ceiling: f64,
    decisions: Mutex<()>,
}

impl AdmissionController {
    pub fn new(registry: Arc<JobRegistry>, estimator: CostEstimator, slots: SlotPools, budget_ceiling: f64) -> Self {
        Self {
            registry,
            estimator,
            slots,
            budget_ceiling,
            decisions: Mutex::new(()),
        }
    }

    pub fn from_settings(registry: Arc<JobRegistry>, settings: &Settings) -> Self {
        Self::new(
            registry,
            CostEstimator::from_settings(settings),
            SlotPools::new(&settings.admission),
            settings.admission.budget_ceiling,
        )
    }

    pub fn slots(&self) -> &SlotPools {
        &self.slots
    }

    pub fn budget_ceiling(&self) -> f64 {
        self.budget_ceiling
    }

    pub fn estimator(&self) -> &CostEstimator {
        &self.estimator
    }

    /// Decide on one request, creating the job when accepted.
    ///
    /// Checks run in order: duplicate key, free slot, budget. The budget
    /// check reserves the top of the estimate's confidence band, so wide
    /// estimates need more headroom.
    pub fn admit(&self, request: &JobRequest) -> RegistryResult<Admission> {
        let _decision = self.decisions.lock();

        if let Some(existing) = self.registry.live_job_for_key(&request.idempotency_key) {
            tracing::info!(
                source = %request.source,
                row_key = %request.row_key,
                existing = %existing,
                "Rejected request: duplicate"
            );
            return Ok(Admission::Rejected {
                reason: RejectReason::Duplicate,
                estimate: None,
            });
        }

        let estimate = self.estimator.estimate(request);
        let class = request.resource_class();

        let Some(slot) = self.slots.try_acquire(class, &request.source) else {
            tracing::info!(
                source = %request.source,
                row_key = %request.row_key,
                %class,
                "Rejected request: over capacity"
            );
            return Ok(Admission::Rejected {
                reason: RejectReason::OverCapacity,
                estimate: Some(estimate),
            });
        };

        let reserve = estimate.upper_bound();
        let committed = self.registry.committed_cost();
        if committed + reserve > self.budget_ceiling + BUDGET_EPSILON {
            tracing::info!(
                source = %request.source,
                row_key = %request.row_key,
                committed,
                reserve,
                ceiling = self.budget_ceiling,
                widened = estimate.widened,
                "Rejected request: budget exceeded"
            );
            drop(slot);
            return Ok(Admission::Rejected {
                reason: RejectReason::BudgetExceeded,
                estimate: Some(estimate),
            });
        }

        let job = Job::from_request(Uuid::new_v4().to_string(), request, reserve);
        match self.registry.create(job.clone()) {
            Ok(()) => {}
            Err(RegistryError::DuplicateKey(_)) => {
                return Ok(Admission::Rejected {
                    reason: RejectReason::Duplicate,
                    estimate: Some(estimate),
                });
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            job_id = %job.id,
            source = %request.source,
            row_key = %request.row_key,
            %class,
            cost = estimate.amount,
            reserve,
            unit = %estimate.unit,
            "Admitted job"
        );

        Ok(Admission::Accepted {
            job,
            slot,
            estimate,
        })
    }
}
