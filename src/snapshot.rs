// 💾 Snapshots & Imports
//
// JSON snapshot: the full ordered entry list, nothing derived. One stream of
// both kinds so the cross-kind insertion order survives a round trip.
// CSV import: bank-feed exports turned into emissions, row by row.

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::Ledger;
use crate::records::{EmissionMethod, EmissionRecord, LedgerEntry, NewEmission};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// JSON SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub entries: Vec<LedgerEntry>,
}

impl LedgerSnapshot {
    pub fn from_ledger(ledger: &Ledger) -> Self {
        LedgerSnapshot {
            entries: ledger.entries(),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write the snapshot next to `path` then rename over it, so a crash never
/// leaves a half-written file behind.
pub fn save_snapshot(ledger: &Ledger, path: &Path) -> LedgerResult<usize> {
    let snapshot = LedgerSnapshot::from_ledger(ledger);
    let json = serde_json::to_string_pretty(&snapshot)?;

    let tmp = temp_path(path);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;

    tracing::info!(path = %path.display(), entries = snapshot.entries.len(), "snapshot saved");
    Ok(snapshot.entries.len())
}

pub fn load_snapshot(path: &Path) -> LedgerResult<LedgerSnapshot> {
    let content = std::fs::read_to_string(path)?;
    let snapshot: LedgerSnapshot = serde_json::from_str(&content)?;
    Ok(snapshot)
}

/// Load a snapshot file into an empty ledger, all entries or none
pub fn import_snapshot(ledger: &Ledger, path: &Path) -> LedgerResult<usize> {
    let snapshot = load_snapshot(path)?;
    ledger.restore(snapshot.entries)
}

// ============================================================================
// CSV BANK-FEED IMPORT
// ============================================================================

/// One row of a bank-feed export: `date,source,amount_kg,category,method`
#[derive(Debug, Deserialize)]
struct CsvEmissionRow {
    date: String,
    source: String,
    amount_kg: f64,
    category: String,
    #[serde(default)]
    method: Option<String>,
}

impl CsvEmissionRow {
    fn into_draft(self) -> Result<NewEmission, String> {
        let category = self.category.parse()?;
        let method = match self.method.as_deref().map(str::trim) {
            None | Some("") => EmissionMethod::BankTransaction,
            Some(raw) => raw.parse()?,
        };

        Ok(NewEmission::new(&self.source, self.amount_kg, category, method).with_date(&self.date))
    }
}

#[derive(Debug, Clone)]
pub struct RejectedRow {
    /// 1-based data row (header excluded)
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct CsvImportReport {
    pub accepted: Vec<EmissionRecord>,
    pub rejected: Vec<RejectedRow>,
}

impl CsvImportReport {
    pub fn total_kg(&self) -> f64 {
        self.accepted.iter().map(|e| e.amount_kg).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} emission(s) imported ({:.2} kg), {} row(s) rejected",
            self.accepted.len(),
            self.total_kg(),
            self.rejected.len()
        )
    }
}

/// Parse a bank-feed CSV into drafts; bad rows are reported, not fatal
pub fn load_emissions_csv(path: &Path) -> LedgerResult<Vec<(usize, Result<NewEmission, String>)>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

    let mut rows = Vec::new();
    for (index, result) in rdr.deserialize::<CsvEmissionRow>().enumerate() {
        let draft = match result {
            Ok(row) => row.into_draft(),
            Err(e) => Err(e.to_string()),
        };
        rows.push((index + 1, draft));
    }

    Ok(rows)
}

/// Append every valid row through `add_emission`. Each row stands alone.
pub fn import_emissions_csv(ledger: &Ledger, path: &Path) -> LedgerResult<CsvImportReport> {
    let mut report = CsvImportReport::default();

    for (row, draft) in load_emissions_csv(path)? {
        let outcome = draft.and_then(|draft| {
            ledger.add_emission(draft).map_err(|e| match e {
                LedgerError::Validation(errors) => errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
                other => other.to_string(),
            })
        });

        match outcome {
            Ok(record) => report.accepted.push(record),
            Err(reason) => {
                tracing::warn!(row, %reason, "csv row rejected");
                report.rejected.push(RejectedRow { row, reason });
            }
        }
    }

    tracing::info!(path = %path.display(), summary = %report.summary(), "csv import finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::default_offerings;
    use crate::optimizer::{allocate, checkout};
    use crate::records::EmissionCategory;

    fn sample_ledger() -> Ledger {
        let ledger = Ledger::new();
        ledger
            .add_emission(
                NewEmission::new("Uber ride SFO → SJC", 14.2, EmissionCategory::Transport, EmissionMethod::BankTransaction)
                    .with_date("2025-02-01T09:00:00Z"),
            )
            .unwrap();
        ledger
            .add_emission(
                NewEmission::new("Delta Flight (SFO-JFK)", 420.5, EmissionCategory::Flight, EmissionMethod::AutoDetected)
                    .with_date("2025-01-30T18:00:00Z"),
            )
            .unwrap();
        let plan = allocate(50.0, 42.5, &default_offerings()).unwrap();
        checkout(&ledger, &plan).unwrap();
        ledger
    }

    #[test]
    fn test_snapshot_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = sample_ledger();

        assert_eq!(save_snapshot(&ledger, &path).unwrap(), 3);
        assert!(!temp_path(&path).exists());

        let restored = Ledger::new();
        assert_eq!(import_snapshot(&restored, &path).unwrap(), 3);

        assert_eq!(restored.entries(), ledger.entries());
        assert_eq!(restored.balance(), ledger.balance());
        assert_eq!(restored.activity(None), ledger.activity(None));
    }

    #[test]
    fn test_snapshot_has_no_derived_fields() {
        let snapshot = LedgerSnapshot::from_ledger(&sample_ledger());
        let json = serde_json::to_value(&snapshot).unwrap();

        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["entries"]);
        assert_eq!(json["entries"][0]["kind"], "emission");
        assert_eq!(json["entries"][2]["kind"], "removal");
        assert!(json.to_string().find("balance").is_none());
    }

    #[test]
    fn test_invalid_snapshot_imports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");

        let mut snapshot = LedgerSnapshot::from_ledger(&sample_ledger());
        if let LedgerEntry::Emission(e) = &mut snapshot.entries[1] {
            e.amount_kg = -1.0;
        }
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let ledger = Ledger::new();
        let result = import_snapshot(&ledger, &path);

        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_csv_import_reports_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.csv");
        std::fs::write(
            &path,
            "date,source,amount_kg,category,method\n\
             2025-01-02,Shell Gas Station,18.4,transport,bank_transaction\n\
             2025-01-03,Whole Foods,8.45,food,\n\
             2025-01-04,Mystery,5.0,shopping,manual\n\
             2025-01-05,Negative,-2.0,energy,manual\n\
             not-a-date,PG&E,85.0,energy,manual\n\
             2025-01-06,Bad Number,lots,food,manual\n",
        )
        .unwrap();

        let ledger = Ledger::new();
        let report = import_emissions_csv(&ledger, &path).unwrap();

        assert_eq!(report.accepted.len(), 2);
        assert_eq!(report.accepted[1].method, EmissionMethod::BankTransaction);
        let rejected_rows: Vec<usize> = report.rejected.iter().map(|r| r.row).collect();
        assert_eq!(rejected_rows, vec![3, 4, 5, 6]);

        assert!((ledger.balance() - 26.85).abs() < 1e-9);
        assert!((report.total_kg() - 26.85).abs() < 1e-9);
    }
}
