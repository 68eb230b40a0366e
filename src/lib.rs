// Carbon Ledger - Core Library
// Emissions/removals ledger + deterministic removal allocation.
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod records;
pub mod catalog;
pub mod ledger;
pub mod optimizer;
pub mod store;
pub mod snapshot;
pub mod config;

// Re-export commonly used types
pub use error::{LedgerError, LedgerResult, LineFailure, ValidationError};
pub use records::{
    EmissionCategory, EmissionMethod, EmissionRecord, LedgerEntry, NewEmission,
    RemovalMethod, RemovalRecord, parse_timestamp, EPSILON,
};
pub use catalog::{Catalog, CatalogSnapshot, ProviderOffering, default_offerings};
pub use ledger::{BalanceStatus, Ledger, LedgerSummary};
pub use optimizer::{
    AllocationLine, AllocationPlan, PlanStatus, SettledLine, SettlementSummary,
    allocate, checkout, checkout_priced, checkout_with_reference, verify_plan, verify_prices,
};
pub use store::{Event, SqliteStore};
pub use snapshot::{
    CsvImportReport, LedgerSnapshot,
    import_emissions_csv, import_snapshot, save_snapshot,
};
pub use config::LedgerConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Allocate against the catalog's current, fresh snapshot.
///
/// The snapshot is taken once; a refresh racing this call cannot change the plan.
pub fn plan_neutralization(
    catalog: &Catalog,
    target_kg: f64,
    budget_usd: f64,
) -> LedgerResult<AllocationPlan> {
    let trivial = target_kg <= 0.0 || budget_usd <= 0.0;
    if !target_kg.is_finite() || !budget_usd.is_finite() || trivial {
        // bad input and trivial plans never need the catalog
        return allocate(target_kg, budget_usd, &[]);
    }
    let snapshot = catalog.fresh_snapshot(chrono::Utc::now())?;
    allocate(target_kg, budget_usd, snapshot.offerings())
}

/// Commit a plan that came from outside the process, repricing every line
/// against the catalog's current snapshot first.
pub fn settle_plan(
    ledger: &Ledger,
    catalog: &Catalog,
    plan: &AllocationPlan,
    settlement_reference: &str,
    certificate_ref: Option<&str>,
) -> LedgerResult<SettlementSummary> {
    let snapshot = catalog.fresh_snapshot(chrono::Utc::now())?;
    checkout_priced(ledger, plan, snapshot.offerings(), settlement_reference, certificate_ref)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_neutralization_uses_catalog_snapshot() {
        let catalog = Catalog::with_defaults();
        let plan = plan_neutralization(&catalog, 10.0, 100.0).unwrap();

        assert_eq!(plan.status, PlanStatus::Full);
        assert_eq!(plan.lines[0].offering_id, "climeworks");
    }

    #[test]
    fn test_plan_neutralization_trivial_cases_skip_catalog() {
        let empty = Catalog::new();

        assert_eq!(plan_neutralization(&empty, 0.0, 10.0).unwrap().status, PlanStatus::Empty);
        assert_eq!(plan_neutralization(&empty, 10.0, 0.0).unwrap().status, PlanStatus::PartialBudget);
        assert!(matches!(
            plan_neutralization(&empty, 10.0, 10.0),
            Err(LedgerError::CatalogUnavailable { .. })
        ));
    }

    #[test]
    fn test_plan_neutralization_rejects_non_finite_before_catalog() {
        let empty = Catalog::new();

        assert!(matches!(plan_neutralization(&empty, f64::NAN, 10.0), Err(LedgerError::Validation(_))));
        assert!(matches!(plan_neutralization(&empty, 10.0, f64::INFINITY), Err(LedgerError::Validation(_))));
        assert!(matches!(plan_neutralization(&empty, f64::NEG_INFINITY, 10.0), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_settle_plan_reprices_against_catalog() {
        let catalog = Catalog::with_defaults();
        let ledger = Ledger::new();

        let plan = plan_neutralization(&catalog, 10.0, 100.0).unwrap();
        let mut cheaper = plan.clone();
        cheaper.lines[0].price_per_kg /= 10.0;
        cheaper.lines[0].cost_usd /= 10.0;

        let err = settle_plan(&ledger, &catalog, &cheaper, "stl-1", None).unwrap_err();
        assert!(matches!(err, LedgerError::CommitFailure { .. }));
        assert!(ledger.is_empty());

        settle_plan(&ledger, &catalog, &plan, "stl-2", None).unwrap();
        assert!((ledger.balance() + 10.0).abs() < 1e-9);
    }
}
