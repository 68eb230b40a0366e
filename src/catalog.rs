// 🛒 Removal Catalog - purchasable offerings, ranked by permanence
//
// Ranking: permanence_years DESC, then price_per_kg ASC, then provider_id ASC.
// The ranking is the allocation order the optimizer consumes.
// Refreshing prices is someone else's job; the catalog only swaps lists atomically.

use crate::error::{LedgerError, LedgerResult, ValidationError};
use crate::records::RemovalMethod;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

// ============================================================================
// PROVIDER OFFERING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOffering {
    pub provider_id: String,

    /// Provider as shown to the user (e.g., "Climeworks")
    pub display_name: String,

    /// Project the removal is bought from; falls back to the display name
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,

    #[serde(rename = "methodName")]
    pub method: RemovalMethod,

    pub price_per_kg: f64,

    /// Ranking only, never copied onto removal records
    pub permanence_years: f64,

    pub region: String,

    /// Remaining supply in kg; `None` means unlimited
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_kg: Option<f64>,
}

impl ProviderOffering {
    pub fn new(
        provider_id: &str,
        display_name: &str,
        method: RemovalMethod,
        price_per_kg: f64,
        permanence_years: f64,
        region: &str,
    ) -> Self {
        ProviderOffering {
            provider_id: provider_id.to_string(),
            display_name: display_name.to_string(),
            project_name: None,
            method,
            price_per_kg,
            permanence_years,
            region: region.to_string(),
            available_kg: None,
        }
    }

    pub fn with_available_kg(mut self, available_kg: f64) -> Self {
        self.available_kg = Some(available_kg);
        self
    }

    pub fn with_project(mut self, project_name: &str) -> Self {
        self.project_name = Some(project_name.to_string());
        self
    }

    pub fn project(&self) -> &str {
        self.project_name.as_deref().unwrap_or(&self.display_name)
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.provider_id.trim().is_empty() {
            errors.push(ValidationError::new("Offering", "provider_id", "Required field is empty"));
        }
        if self.display_name.trim().is_empty() {
            errors.push(ValidationError::new("Offering", "display_name", "Required field is empty"));
        }
        if !self.price_per_kg.is_finite() || self.price_per_kg <= 0.0 {
            errors.push(ValidationError::new(
                "Offering",
                "price_per_kg",
                format!("must be a finite price > 0, got {}", self.price_per_kg),
            ));
        }
        if !self.permanence_years.is_finite() || self.permanence_years <= 0.0 {
            errors.push(ValidationError::new(
                "Offering",
                "permanence_years",
                format!("must be a finite duration > 0, got {}", self.permanence_years),
            ));
        }
        if let Some(available) = self.available_kg {
            if !available.is_finite() || available < 0.0 {
                errors.push(ValidationError::new(
                    "Offering",
                    "available_kg",
                    format!("must be a finite amount >= 0, got {}", available),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Allocation ranking comparator
pub fn compare_rank(a: &ProviderOffering, b: &ProviderOffering) -> Ordering {
    b.permanence_years
        .total_cmp(&a.permanence_years)
        .then(a.price_per_kg.total_cmp(&b.price_per_kg))
        .then_with(|| a.provider_id.cmp(&b.provider_id))
}

pub fn rank_offerings(offerings: &mut [ProviderOffering]) {
    offerings.sort_by(compare_rank);
}

/// Validate a whole list: every offering well-formed, provider ids unique
pub fn validate_offerings(offerings: &[ProviderOffering]) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for offering in offerings {
        if let Err(mut offering_errors) = offering.validate() {
            errors.append(&mut offering_errors);
        }
        if !seen.insert(offering.provider_id.as_str()) {
            errors.push(ValidationError::new(
                "Offering",
                "provider_id",
                format!("duplicate provider id: {}", offering.provider_id),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Market offerings the wallet ships with (prices in USD/kg)
pub fn default_offerings() -> Vec<ProviderOffering> {
    vec![
        ProviderOffering::new("climeworks", "Climeworks", RemovalMethod::Dac, 0.85, 10_000.0, "Iceland")
            .with_project("Climeworks Orca"),
        ProviderOffering::new("charm-industrial", "Charm Industrial", RemovalMethod::Biochar, 0.60, 1_000.0, "USA")
            .with_project("Charm Bio-oil Sequestration"),
        ProviderOffering::new("running-tide", "Running Tide", RemovalMethod::Kelp, 0.25, 500.0, "North Atlantic")
            .with_project("Running Tide Kelp Sinking"),
        ProviderOffering::new("toucan-nct", "Toucan Protocol", RemovalMethod::PooledToken, 0.02, 50.0, "Global")
            .with_project("Toucan Nature Carbon Tonne Pool"),
    ]
}

/// Read a pricing-feed export: a JSON array of offerings
pub fn load_offerings_json(path: &Path) -> LedgerResult<Vec<ProviderOffering>> {
    let content = std::fs::read_to_string(path)?;
    let offerings: Vec<ProviderOffering> = serde_json::from_str(&content)?;
    Ok(offerings)
}

// ============================================================================
// CATALOG SNAPSHOT
// ============================================================================

/// Immutable, already-ranked view of the catalog at one refresh
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    offerings: Arc<Vec<ProviderOffering>>,
    refreshed_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    pub fn offerings(&self) -> &[ProviderOffering] {
        &self.offerings
    }

    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }

    pub fn is_empty(&self) -> bool {
        self.offerings.is_empty()
    }

    pub fn find(&self, provider_id: &str) -> Option<&ProviderOffering> {
        self.offerings.iter().find(|o| o.provider_id == provider_id)
    }
}

// ============================================================================
// CATALOG
// ============================================================================

pub struct Catalog {
    current: RwLock<CatalogSnapshot>,

    /// Snapshots older than this are treated as unavailable
    max_age: Option<Duration>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog {
            current: RwLock::new(CatalogSnapshot {
                offerings: Arc::new(Vec::new()),
                refreshed_at: Utc::now(),
            }),
            max_age: None,
        }
    }

    /// Catalog pre-loaded with the built-in market offerings
    pub fn with_defaults() -> Self {
        let catalog = Catalog::new();
        let mut offerings = default_offerings();
        rank_offerings(&mut offerings);
        catalog.swap(offerings, Utc::now());
        catalog
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Swap in a new offering list. Either the whole list is accepted or the
    /// catalog keeps serving the previous one.
    pub fn replace(&self, offerings: Vec<ProviderOffering>) -> LedgerResult<()> {
        self.replace_at(offerings, Utc::now())
    }

    pub fn replace_at(&self, mut offerings: Vec<ProviderOffering>, refreshed_at: DateTime<Utc>) -> LedgerResult<()> {
        if let Err(errors) = validate_offerings(&offerings) {
            tracing::warn!(errors = errors.len(), "rejected catalog refresh");
            return Err(LedgerError::Validation(errors));
        }

        rank_offerings(&mut offerings);
        let count = offerings.len();
        self.swap(offerings, refreshed_at);
        tracing::info!(offerings = count, "catalog refreshed");
        Ok(())
    }

    fn swap(&self, offerings: Vec<ProviderOffering>, refreshed_at: DateTime<Utc>) {
        let snapshot = CatalogSnapshot {
            offerings: Arc::new(offerings),
            refreshed_at,
        };
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = snapshot;
    }

    /// Current offerings in ranking order
    pub fn offerings(&self) -> Vec<ProviderOffering> {
        self.snapshot().offerings().to_vec()
    }

    /// Cheap clone of the latest swap, regardless of age
    pub fn snapshot(&self) -> CatalogSnapshot {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Snapshot usable for allocation: non-empty and not older than `max_age`
    pub fn fresh_snapshot(&self, now: DateTime<Utc>) -> LedgerResult<CatalogSnapshot> {
        let snapshot = self.snapshot();

        if snapshot.is_empty() {
            return Err(LedgerError::catalog_unavailable("catalog has no offerings"));
        }

        if let Some(max_age) = self.max_age {
            let age = now.signed_duration_since(snapshot.refreshed_at);
            if age > max_age {
                return Err(LedgerError::catalog_unavailable(format!(
                    "catalog snapshot expired ({}s old, max {}s)",
                    age.num_seconds(),
                    max_age.num_seconds()
                )));
            }
        }

        Ok(snapshot)
    }

    pub fn len(&self) -> usize {
        self.snapshot().offerings().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ids(offerings: &[ProviderOffering]) -> Vec<&str> {
        offerings.iter().map(|o| o.provider_id.as_str()).collect()
    }

    #[test]
    fn test_defaults_ranked_by_permanence() {
        let catalog = Catalog::with_defaults();
        let offerings = catalog.offerings();

        assert_eq!(offerings.len(), 4);
        assert_eq!(
            ids(&offerings),
            vec!["climeworks", "charm-industrial", "running-tide", "toucan-nct"]
        );
    }

    #[test]
    fn test_price_breaks_permanence_ties() {
        let catalog = Catalog::new();
        catalog
            .replace(vec![
                ProviderOffering::new("pricey", "Pricey Trees", RemovalMethod::Reforestation, 0.30, 100.0, "Brazil"),
                ProviderOffering::new("cheap", "Cheap Trees", RemovalMethod::Reforestation, 0.10, 100.0, "Kenya"),
                ProviderOffering::new("rock", "Rock Dust", RemovalMethod::EnhancedWeathering, 0.50, 100_000.0, "UK"),
            ])
            .unwrap();

        assert_eq!(ids(&catalog.offerings()), vec!["rock", "cheap", "pricey"]);
    }

    #[test]
    fn test_ranking_independent_of_input_order() {
        let mut forward = default_offerings();
        let mut backward = default_offerings();
        backward.reverse();

        rank_offerings(&mut forward);
        rank_offerings(&mut backward);

        assert_eq!(forward, backward);
    }

    #[test]
    fn test_invalid_refresh_keeps_previous_list() {
        let catalog = Catalog::with_defaults();

        let result = catalog.replace(vec![
            ProviderOffering::new("ok", "Fine", RemovalMethod::Kelp, 0.2, 500.0, "Pacific"),
            ProviderOffering::new("bad", "Free Lunch", RemovalMethod::Kelp, 0.0, 500.0, "Pacific"),
        ]);

        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert_eq!(catalog.len(), 4, "previous offerings must survive a rejected refresh");
    }

    #[test]
    fn test_duplicate_provider_ids_rejected() {
        let errors = validate_offerings(&[
            ProviderOffering::new("a", "A", RemovalMethod::Kelp, 0.2, 500.0, "Pacific"),
            ProviderOffering::new("a", "A again", RemovalMethod::Dac, 0.9, 9000.0, "Iceland"),
        ])
        .unwrap_err();

        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("duplicate"));
    }

    #[test]
    fn test_empty_catalog_unavailable() {
        let catalog = Catalog::new();
        let result = catalog.fresh_snapshot(Utc::now());
        assert!(matches!(result, Err(LedgerError::CatalogUnavailable { .. })));
    }

    #[test]
    fn test_expired_snapshot_unavailable() {
        let catalog = Catalog::new().with_max_age(Duration::minutes(10));
        let refreshed = Utc::now() - Duration::hours(1);
        catalog.replace_at(default_offerings(), refreshed).unwrap();

        let result = catalog.fresh_snapshot(Utc::now());
        assert!(matches!(result, Err(LedgerError::CatalogUnavailable { .. })));

        let ok = catalog.fresh_snapshot(refreshed + Duration::minutes(5));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_swap() {
        let catalog = Catalog::with_defaults();
        let before = catalog.snapshot();

        catalog
            .replace(vec![ProviderOffering::new("solo", "Solo", RemovalMethod::Biochar, 0.4, 800.0, "Chile")])
            .unwrap();

        assert_eq!(before.offerings().len(), 4);
        assert_eq!(catalog.offerings().len(), 1);
        assert!(before.find("climeworks").is_some());
    }

    #[test]
    fn test_concurrent_readers_see_whole_lists() {
        let catalog = Arc::new(Catalog::with_defaults());
        let small = vec![ProviderOffering::new("solo", "Solo", RemovalMethod::Biochar, 0.4, 800.0, "Chile")];

        let writer = {
            let catalog = Arc::clone(&catalog);
            thread::spawn(move || {
                for i in 0..200 {
                    let list = if i % 2 == 0 { small.clone() } else { default_offerings() };
                    catalog.replace(list).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let len = catalog.offerings().len();
                        assert!(len == 1 || len == 4, "observed half-updated list of {}", len);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_offering_json_shape() {
        let json = serde_json::json!({
            "providerId": "climeworks",
            "displayName": "Climeworks",
            "methodName": "DAC",
            "pricePerKg": 0.85,
            "permanenceYears": 10000.0,
            "region": "Iceland"
        });

        let offering: ProviderOffering = serde_json::from_value(json).unwrap();
        assert_eq!(offering.method, RemovalMethod::Dac);
        assert_eq!(offering.project(), "Climeworks");
    }
}
