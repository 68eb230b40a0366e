// 🎯 Removal Optimizer - deterministic, permanence-first greedy allocation
//
// allocate(target_kg, budget_usd, offerings) → AllocationPlan
//   1. rank offerings (permanence DESC, price ASC)
//   2. walk the ranking, buying min(remaining target, what the budget affords)
//   3. stop as soon as target or budget is used up
//
// Pure: no I/O, no clock, no randomness. Same inputs → same plan, bit for bit.
// checkout(plan) turns a plan into removal records in one ledger commit.

use crate::catalog::{rank_offerings, validate_offerings, ProviderOffering};
use crate::error::{LedgerError, LedgerResult, LineFailure, ValidationError};
use crate::ledger::{CommitError, Ledger};
use crate::records::{RemovalMethod, RemovalRecord, EPSILON};
use crate::store::Event;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// PLAN TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    /// Nothing to neutralize
    Empty,
    /// Target fully covered
    Full,
    /// Budget ran out before the target was covered
    PartialBudget,
    /// Every offering was used and budget is left over
    PartialCatalog,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Empty => "EMPTY",
            PlanStatus::Full => "FULL",
            PlanStatus::PartialBudget => "PARTIAL_BUDGET",
            PlanStatus::PartialCatalog => "PARTIAL_CATALOG",
        }
    }
}

/// One purchase in a plan. Carries enough of the offering to build a record
/// without going back to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationLine {
    pub offering_id: String,
    pub amount_kg: f64,
    pub cost_usd: f64,
    pub provider: String,
    pub project_name: String,
    pub method: RemovalMethod,
    pub price_per_kg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationPlan {
    pub target_kg: f64,
    pub budget_usd: f64,
    pub lines: Vec<AllocationLine>,
    pub status: PlanStatus,
}

impl AllocationPlan {
    fn empty(target_kg: f64, budget_usd: f64, status: PlanStatus) -> Self {
        AllocationPlan {
            target_kg,
            budget_usd,
            lines: Vec::new(),
            status,
        }
    }

    pub fn total_kg(&self) -> f64 {
        self.lines.iter().map(|l| l.amount_kg).sum()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.lines.iter().map(|l| l.cost_usd).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// SHA-256 over the exact plan contents (floats by bit pattern).
    /// Equal fingerprints mean bit-identical plans.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.status.as_str().as_bytes());
        hasher.update(self.target_kg.to_bits().to_be_bytes());
        hasher.update(self.budget_usd.to_bits().to_be_bytes());
        for line in &self.lines {
            hasher.update(line.offering_id.as_bytes());
            hasher.update([0u8]);
            hasher.update(line.amount_kg.to_bits().to_be_bytes());
            hasher.update(line.cost_usd.to_bits().to_be_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} line(s), {:.2} kg of {:.2} kg target for ${:.2} of ${:.2} budget",
            self.status.as_str(),
            self.lines.len(),
            self.total_kg(),
            self.target_kg,
            self.total_cost_usd(),
            self.budget_usd
        )
    }
}

// ============================================================================
// CHECKOUT OUTPUT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettledLine {
    pub offering_id: String,
    pub amount_kg: f64,
    pub cost_usd: f64,
    pub removal_id: String,
}

/// What the settlement collaborator and the UI consume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementSummary {
    pub settlement_reference: String,
    pub lines: Vec<SettledLine>,
    pub total_kg: f64,
    pub total_cost_usd: f64,
    pub plan_fingerprint: String,
}

// ============================================================================
// ALLOCATE
// ============================================================================

pub fn allocate(
    target_kg: f64,
    budget_usd: f64,
    offerings: &[ProviderOffering],
) -> LedgerResult<AllocationPlan> {
    let mut errors = Vec::new();
    if !target_kg.is_finite() {
        errors.push(ValidationError::new("Allocation", "target_kg", format!("must be finite, got {}", target_kg)));
    }
    if !budget_usd.is_finite() {
        errors.push(ValidationError::new("Allocation", "budget_usd", format!("must be finite, got {}", budget_usd)));
    }
    if !errors.is_empty() {
        return Err(LedgerError::Validation(errors));
    }

    if target_kg <= 0.0 {
        return Ok(AllocationPlan::empty(target_kg, budget_usd, PlanStatus::Empty));
    }
    if budget_usd <= 0.0 {
        return Ok(AllocationPlan::empty(target_kg, budget_usd, PlanStatus::PartialBudget));
    }
    if offerings.is_empty() {
        return Err(LedgerError::catalog_unavailable("no offerings to allocate against"));
    }
    validate_offerings(offerings).map_err(LedgerError::Validation)?;

    let mut ranked = offerings.to_vec();
    rank_offerings(&mut ranked);

    let mut remaining_target = target_kg;
    let mut remaining_budget = budget_usd;
    let mut lines = Vec::new();

    for offering in &ranked {
        let budget_kg = remaining_budget / offering.price_per_kg;
        let mut amount_kg = remaining_target.min(budget_kg);
        let mut budget_bound = budget_kg < remaining_target;

        if let Some(available) = offering.available_kg {
            if available < amount_kg {
                amount_kg = available;
                budget_bound = false;
            }
        }

        let cost_usd = if budget_bound {
            // spend exactly what is left rather than re-multiplying
            remaining_budget
        } else {
            amount_kg * offering.price_per_kg
        };

        if amount_kg > EPSILON {
            tracing::debug!(
                offering = %offering.provider_id,
                amount_kg,
                cost_usd,
                "allocated"
            );
            lines.push(AllocationLine {
                offering_id: offering.provider_id.clone(),
                amount_kg,
                cost_usd,
                provider: offering.display_name.clone(),
                project_name: offering.project().to_string(),
                method: offering.method,
                price_per_kg: offering.price_per_kg,
            });
            remaining_target -= amount_kg;
            remaining_budget -= cost_usd;
        }

        if remaining_target <= EPSILON || remaining_budget <= EPSILON {
            break;
        }
    }

    let status = if remaining_target <= EPSILON {
        PlanStatus::Full
    } else if remaining_budget <= EPSILON {
        PlanStatus::PartialBudget
    } else {
        PlanStatus::PartialCatalog
    };

    let plan = AllocationPlan {
        target_kg,
        budget_usd,
        lines,
        status,
    };
    tracing::debug!(plan = %plan.summary(), "allocation complete");

    Ok(plan)
}

// ============================================================================
// PLAN VERIFICATION
// ============================================================================

/// Slack allowed between a line's cost and amount × price. Budget-bound lines
/// spend the remaining budget exactly, so the product is only close.
fn cost_tolerance(expected_usd: f64) -> f64 {
    EPSILON * expected_usd.abs().max(1.0)
}

fn plan_error(field: &str, message: String) -> ValidationError {
    ValidationError::new("Plan", field, message)
}

/// Re-check what `allocate` guarantees, for plans that came back from a client:
/// every line priced at its own rate, and the running totals inside the
/// plan's target and budget. Returns one failure per offending line.
pub fn verify_plan(plan: &AllocationPlan) -> Vec<LineFailure> {
    let mut failures = Vec::new();
    let mut total_kg = 0.0;
    let mut total_cost = 0.0;

    for (line_index, line) in plan.lines.iter().enumerate() {
        let mut errors = Vec::new();

        if !plan.target_kg.is_finite() || !plan.budget_usd.is_finite() {
            errors.push(plan_error(
                "target_kg",
                format!("plan bounds must be finite, got {} kg / ${}", plan.target_kg, plan.budget_usd),
            ));
        }
        let priced = line.price_per_kg.is_finite() && line.price_per_kg > 0.0;
        if !priced {
            errors.push(plan_error("price_per_kg", format!("must be a finite price > 0, got {}", line.price_per_kg)));
        }
        let measured = line.amount_kg.is_finite() && line.cost_usd.is_finite();
        if !measured {
            errors.push(plan_error(
                "amount_kg",
                format!("amount and cost must be finite, got {} kg / ${}", line.amount_kg, line.cost_usd),
            ));
        }

        if priced && measured {
            let expected = line.amount_kg * line.price_per_kg;
            if (line.cost_usd - expected).abs() > cost_tolerance(expected) {
                errors.push(plan_error(
                    "cost_usd",
                    format!(
                        "{} kg at ${}/kg costs ${:.6}, line says ${:.6}",
                        line.amount_kg, line.price_per_kg, expected, line.cost_usd
                    ),
                ));
            }

            total_kg += line.amount_kg;
            total_cost += line.cost_usd;
            if total_kg > plan.target_kg + EPSILON {
                errors.push(plan_error(
                    "amount_kg",
                    format!("plan reaches {:.6} kg, over its {} kg target", total_kg, plan.target_kg),
                ));
            }
            if total_cost > plan.budget_usd + EPSILON {
                errors.push(plan_error(
                    "cost_usd",
                    format!("plan reaches ${:.6}, over its ${} budget", total_cost, plan.budget_usd),
                ));
            }
        }

        if !errors.is_empty() {
            failures.push(LineFailure {
                line_index,
                offering_id: line.offering_id.clone(),
                errors,
            });
        }
    }

    failures
}

/// Check every line against the offering it claims to come from
pub fn verify_prices(plan: &AllocationPlan, offerings: &[ProviderOffering]) -> Vec<LineFailure> {
    let mut failures = Vec::new();

    for (line_index, line) in plan.lines.iter().enumerate() {
        let mut errors = Vec::new();

        match offerings.iter().find(|o| o.provider_id == line.offering_id) {
            None => errors.push(plan_error("offering_id", format!("'{}' is not in the catalog", line.offering_id))),
            Some(offering) => {
                if offering.price_per_kg.to_bits() != line.price_per_kg.to_bits() {
                    errors.push(plan_error(
                        "price_per_kg",
                        format!("catalog price is ${}/kg, line says ${}/kg", offering.price_per_kg, line.price_per_kg),
                    ));
                }
                if offering.method != line.method {
                    errors.push(plan_error(
                        "method",
                        format!("catalog method is {}, line says {}", offering.method.as_str(), line.method.as_str()),
                    ));
                }
                if let Some(available) = offering.available_kg {
                    if line.amount_kg > available + EPSILON {
                        errors.push(plan_error(
                            "amount_kg",
                            format!("only {} kg available, line takes {}", available, line.amount_kg),
                        ));
                    }
                }
            }
        }

        if !errors.is_empty() {
            failures.push(LineFailure {
                line_index,
                offering_id: line.offering_id.clone(),
                errors,
            });
        }
    }

    failures
}

fn reject_plan(plan: &AllocationPlan, failures: Vec<LineFailure>) -> LedgerError {
    tracing::warn!(lines = failures.len(), plan = %plan.summary(), "plan rejected before commit");
    LedgerError::CommitFailure {
        failures,
        plan: plan.clone(),
    }
}

// ============================================================================
// CHECKOUT
// ============================================================================

/// Opaque settlement reference for a checkout without an external one
pub fn new_settlement_reference() -> String {
    format!("stl-{}", uuid::Uuid::new_v4())
}

/// Commit a plan under a freshly generated settlement reference
pub fn checkout(ledger: &Ledger, plan: &AllocationPlan) -> LedgerResult<SettlementSummary> {
    checkout_with_reference(ledger, plan, &new_settlement_reference(), None)
}

/// Commit a plan after checking each line against the current offerings
pub fn checkout_priced(
    ledger: &Ledger,
    plan: &AllocationPlan,
    offerings: &[ProviderOffering],
    settlement_reference: &str,
    certificate_ref: Option<&str>,
) -> LedgerResult<SettlementSummary> {
    let failures = verify_prices(plan, offerings);
    if !failures.is_empty() {
        return Err(reject_plan(plan, failures));
    }
    checkout_with_reference(ledger, plan, settlement_reference, certificate_ref)
}

/// Commit a plan: one removal record per line, all sharing one settlement
/// reference, appended in a single ledger commit. Partial plans are allowed;
/// a plan that is not internally consistent is rejected whole.
pub fn checkout_with_reference(
    ledger: &Ledger,
    plan: &AllocationPlan,
    settlement_reference: &str,
    certificate_ref: Option<&str>,
) -> LedgerResult<SettlementSummary> {
    let failures = verify_plan(plan);
    if !failures.is_empty() {
        return Err(reject_plan(plan, failures));
    }

    let now = Utc::now();
    let fingerprint = plan.fingerprint();

    let records: Vec<RemovalRecord> = plan
        .lines
        .iter()
        .map(|line| RemovalRecord {
            id: uuid::Uuid::new_v4().to_string(),
            project_name: line.project_name.clone(),
            provider: line.provider.clone(),
            method: line.method,
            amount_kg: line.amount_kg,
            cost_usd: line.cost_usd,
            date: now,
            settlement_reference: Some(settlement_reference.to_string()),
            certificate_ref: certificate_ref.map(str::to_string),
        })
        .collect();

    let audit = Event::new(
        "removals_committed",
        "settlement",
        settlement_reference,
        serde_json::json!({
            "plan_fingerprint": fingerprint,
            "status": plan.status.as_str(),
            "lines": plan.lines.len(),
            "total_kg": plan.total_kg(),
            "total_cost_usd": plan.total_cost_usd(),
        }),
        "optimizer",
    );

    let committed = match ledger.commit_removals(records, audit) {
        Ok(committed) => committed,
        Err(CommitError::Rejected(mut failures)) => {
            // report the plan's offering ids, not the provider names on the records
            for failure in &mut failures {
                if let Some(line) = plan.lines.get(failure.line_index) {
                    failure.offering_id = line.offering_id.clone();
                }
            }
            return Err(LedgerError::CommitFailure {
                failures,
                plan: plan.clone(),
            });
        }
        Err(CommitError::Ledger(err)) => return Err(err),
    };

    let lines: Vec<SettledLine> = plan
        .lines
        .iter()
        .zip(&committed)
        .map(|(line, record)| SettledLine {
            offering_id: line.offering_id.clone(),
            amount_kg: record.amount_kg,
            cost_usd: record.cost_usd,
            removal_id: record.id.clone(),
        })
        .collect();

    let summary = SettlementSummary {
        settlement_reference: settlement_reference.to_string(),
        total_kg: lines.iter().map(|l| l.amount_kg).sum(),
        total_cost_usd: lines.iter().map(|l| l.cost_usd).sum(),
        lines,
        plan_fingerprint: fingerprint,
    };

    tracing::info!(
        settlement = %summary.settlement_reference,
        total_kg = summary.total_kg,
        total_cost_usd = summary.total_cost_usd,
        "checkout settled"
    );

    Ok(summary)
}
