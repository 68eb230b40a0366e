// 📒 Carbon Ledger - append-only emissions + removals
//
// Invariant (after every mutation):
//   balance_kg == Σ emissions.amount_kg − Σ removals.amount_kg
//
// All mutations go through one write lock (single writer). Readers take the
// read lock just long enough to copy or sum, so nobody ever sees half a batch.
// With a store attached, rows are committed to SQLite first and only then
// appended in memory.

use crate::error::{LedgerError, LedgerResult, LineFailure, ValidationError};
use crate::records::{
    EmissionCategory, EmissionRecord, LedgerEntry, NewEmission, RemovalRecord, EPSILON,
};
use crate::store::{Event, SqliteStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// kg CO2e one tree absorbs per year
pub const KG_PER_TREE_YEAR: f64 = 20.0;

/// kg CO2e of one London - New York flight
pub const KG_PER_TRANSATLANTIC_FLIGHT: f64 = 900.0;

// ============================================================================
// SUMMARY TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStatus {
    /// More emitted than removed
    Debt,
    Neutral,
    /// Surplus of removals
    CarbonNegative,
}

impl BalanceStatus {
    pub fn from_balance(balance_kg: f64) -> Self {
        if balance_kg > EPSILON {
            BalanceStatus::Debt
        } else if balance_kg < -EPSILON {
            BalanceStatus::CarbonNegative
        } else {
            BalanceStatus::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceStatus::Debt => "Debt",
            BalanceStatus::Neutral => "Neutral",
            BalanceStatus::CarbonNegative => "Carbon Negative",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub balance_kg: f64,
    pub status: BalanceStatus,
    pub lifetime_emitted_kg: f64,
    pub lifetime_removed_kg: f64,
    pub lifetime_spent_usd: f64,
    pub emission_count: usize,
    pub removal_count: usize,
    pub emitted_by_category: BTreeMap<EmissionCategory, f64>,
    /// Trees needed for a year to absorb |balance|
    pub tree_equivalent: f64,
    /// Transatlantic flights equal to |balance|
    pub flight_equivalent: f64,
}

/// Why a removal batch was not committed
#[derive(Debug)]
pub enum CommitError {
    /// One or more records failed validation; nothing was written
    Rejected(Vec<LineFailure>),
    /// The journal could not be written; nothing was appended
    Ledger(LedgerError),
}

// ============================================================================
// LEDGER STATE (only touched under the lock)
// ============================================================================

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    ids: HashSet<String>,
}

impl LedgerState {
    fn add_emission(&mut self, record: EmissionRecord) {
        self.ids.insert(record.id.clone());
        self.entries.push(LedgerEntry::Emission(record));
    }

    fn add_removal(&mut self, record: RemovalRecord) {
        self.ids.insert(record.id.clone());
        self.entries.push(LedgerEntry::Removal(record));
    }

    fn push(&mut self, entry: LedgerEntry) {
        match entry {
            LedgerEntry::Emission(record) => self.add_emission(record),
            LedgerEntry::Removal(record) => self.add_removal(record),
        }
    }

    fn totals(&self) -> (f64, f64) {
        let mut emitted = 0.0;
        let mut removed = 0.0;
        for entry in &self.entries {
            match entry {
                LedgerEntry::Emission(e) => emitted += e.amount_kg,
                LedgerEntry::Removal(r) => removed += r.amount_kg,
            }
        }
        (emitted, removed)
    }
}

// ============================================================================
// LEDGER
// ============================================================================

pub struct Ledger {
    state: RwLock<LedgerState>,
    store: Option<SqliteStore>,
}

impl Ledger {
    /// Memory-only ledger (tests, previews)
    pub fn new() -> Self {
        Ledger {
            state: RwLock::new(LedgerState::default()),
            store: None,
        }
    }

    /// Ledger backed by a SQLite file; replays every stored entry
    pub fn open(path: &Path) -> LedgerResult<Self> {
        Self::with_store(SqliteStore::open(path)?)
    }

    pub fn with_store(store: SqliteStore) -> LedgerResult<Self> {
        let entries = store.load_entries()?;
        let mut state = LedgerState::default();

        let mut errors = Vec::new();
        for entry in entries {
            if let Err(mut entry_errors) = entry.validate() {
                errors.append(&mut entry_errors);
                continue;
            }
            if state.ids.contains(entry.id()) {
                errors.push(duplicate_id_error(entry.kind(), entry.id()));
                continue;
            }
            state.push(entry);
        }

        if !errors.is_empty() {
            tracing::warn!(errors = errors.len(), "stored ledger failed validation");
            return Err(LedgerError::Validation(errors));
        }

        tracing::info!(entries = state.entries.len(), "ledger loaded");

        Ok(Ledger {
            state: RwLock::new(state),
            store: Some(store),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &[LedgerEntry], events: &[Event]) -> LedgerResult<()> {
        match &self.store {
            Some(store) => store.append(entries, events),
            None => Ok(()),
        }
    }

    pub fn store(&self) -> Option<&SqliteStore> {
        self.store.as_ref()
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Validate, assign an id if missing, append. Nothing changes on error.
    pub fn add_emission(&self, draft: NewEmission) -> LedgerResult<EmissionRecord> {
        let record = draft.into_record(Utc::now()).map_err(|errors| {
            tracing::warn!(errors = errors.len(), "rejected emission");
            LedgerError::Validation(errors)
        })?;

        let mut state = self.write();

        if state.ids.contains(&record.id) {
            return Err(LedgerError::Validation(vec![duplicate_id_error("emission", &record.id)]));
        }

        let entry = LedgerEntry::Emission(record.clone());
        let event = Event::new(
            "emission_added",
            "emission",
            &record.id,
            serde_json::json!({
                "source": record.source,
                "amount_kg": record.amount_kg,
                "category": record.category.as_str(),
                "method": record.method.as_str(),
            }),
            "ledger",
        );
        self.persist(std::slice::from_ref(&entry), &[event])?;

        state.add_emission(record.clone());
        tracing::info!(id = %record.id, amount_kg = record.amount_kg, "emission appended");

        Ok(record)
    }

    /// All-or-nothing append of a removal batch.
    ///
    /// Every record is validated first (including id uniqueness against the
    /// ledger and within the batch). The write lock is held from validation
    /// through the append, so no balance read can land mid-batch.
    pub(crate) fn commit_removals(
        &self,
        records: Vec<RemovalRecord>,
        audit: Event,
    ) -> Result<Vec<RemovalRecord>, CommitError> {
        let mut state = self.write();

        let mut failures = Vec::new();
        let mut batch_ids = HashSet::new();

        if records.is_empty() {
            failures.push(LineFailure {
                line_index: 0,
                offering_id: String::new(),
                errors: vec![ValidationError::new("Removal", "lines", "batch has no records")],
            });
        }

        for (index, record) in records.iter().enumerate() {
            let mut errors = record.validate().err().unwrap_or_default();
            if state.ids.contains(&record.id) || !batch_ids.insert(record.id.as_str()) {
                errors.push(duplicate_id_error("removal", &record.id));
            }
            if !errors.is_empty() {
                failures.push(LineFailure {
                    line_index: index,
                    offering_id: record.provider.clone(),
                    errors,
                });
            }
        }

        if !failures.is_empty() {
            tracing::warn!(failures = failures.len(), "removal batch rejected, ledger unchanged");
            return Err(CommitError::Rejected(failures));
        }

        let entries: Vec<LedgerEntry> = records.iter().cloned().map(LedgerEntry::Removal).collect();
        self.persist(&entries, &[audit]).map_err(CommitError::Ledger)?;

        let total_kg: f64 = records.iter().map(|r| r.amount_kg).sum();
        for record in &records {
            state.add_removal(record.clone());
        }
        tracing::info!(count = records.len(), total_kg, "removal batch committed");

        Ok(records)
    }

    /// Load a full entry list into an empty ledger (snapshot import).
    pub fn restore(&self, entries: Vec<LedgerEntry>) -> LedgerResult<usize> {
        let mut state = self.write();

        if !state.entries.is_empty() {
            return Err(LedgerError::validation(
                "Snapshot",
                "entries",
                "can only restore into an empty ledger",
            ));
        }

        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for entry in &entries {
            if let Err(mut entry_errors) = entry.validate() {
                errors.append(&mut entry_errors);
            }
            if !seen.insert(entry.id()) {
                errors.push(duplicate_id_error(entry.kind(), entry.id()));
            }
        }
        if !errors.is_empty() {
            return Err(LedgerError::Validation(errors));
        }

        let event = Event::new(
            "snapshot_restored",
            "ledger",
            "ledger",
            serde_json::json!({ "entries": entries.len() }),
            "snapshot",
        );
        self.persist(&entries, &[event])?;

        let count = entries.len();
        for entry in entries {
            state.push(entry);
        }
        tracing::info!(entries = count, "snapshot restored");

        Ok(count)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Net kg CO2e, recomputed from the records on every call
    pub fn balance(&self) -> f64 {
        let (emitted, removed) = self.read().totals();
        emitted - removed
    }

    /// Outstanding debt: the positive part of the balance
    pub fn debt_kg(&self) -> f64 {
        self.balance().max(0.0)
    }

    /// Newest first; equal timestamps show the most recently appended first
    pub fn activity(&self, limit: Option<usize>) -> Vec<LedgerEntry> {
        let state = self.read();

        let mut feed: Vec<&LedgerEntry> = state.entries.iter().rev().collect();
        // stable sort keeps reverse-insertion order among equal dates
        feed.sort_by(|a, b| b.date().cmp(&a.date()));

        let limit = limit.unwrap_or(feed.len());
        feed.into_iter().take(limit).cloned().collect()
    }

    /// Every entry in insertion order
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.read().entries.clone()
    }

    pub fn emissions(&self) -> Vec<EmissionRecord> {
        self.read()
            .entries
            .iter()
            .filter_map(|entry| match entry {
                LedgerEntry::Emission(e) => Some(e.clone()),
                LedgerEntry::Removal(_) => None,
            })
            .collect()
    }

    pub fn removals(&self) -> Vec<RemovalRecord> {
        self.read()
            .entries
            .iter()
            .filter_map(|entry| match entry {
                LedgerEntry::Removal(r) => Some(r.clone()),
                LedgerEntry::Emission(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> LedgerSummary {
        let state = self.read();

        let mut emitted_by_category = BTreeMap::new();
        let mut emission_count = 0;
        let mut removal_count = 0;
        let mut spent = 0.0;

        for entry in &state.entries {
            match entry {
                LedgerEntry::Emission(e) => {
                    emission_count += 1;
                    *emitted_by_category.entry(e.category).or_insert(0.0) += e.amount_kg;
                }
                LedgerEntry::Removal(r) => {
                    removal_count += 1;
                    spent += r.cost_usd;
                }
            }
        }

        let (emitted, removed) = state.totals();
        let balance = emitted - removed;

        LedgerSummary {
            balance_kg: balance,
            status: BalanceStatus::from_balance(balance),
            lifetime_emitted_kg: emitted,
            lifetime_removed_kg: removed,
            lifetime_spent_usd: spent,
            emission_count,
            removal_count,
            emitted_by_category,
            tree_equivalent: balance.abs() / KG_PER_TREE_YEAR,
            flight_equivalent: balance.abs() / KG_PER_TRANSATLANTIC_FLIGHT,
        }
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Ledger::new()
    }
}

fn duplicate_id_error(kind: &str, id: &str) -> ValidationError {
    ValidationError::new(kind, "id", format!("duplicate record id: {}", id))
}
