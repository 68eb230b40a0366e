// 🧾 Ledger Records - the two immutable event kinds
//
// EmissionRecord: something put CO2e into the atmosphere (adds to the balance)
// RemovalRecord:  a purchased, priced removal (subtracts from the balance)
//
// Records are values: created once, validated once, never mutated.

use crate::error::ValidationError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Floating-point dust threshold, in kg or USD
pub const EPSILON: f64 = 1e-6;

// ============================================================================
// ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionCategory {
    Transport,
    Food,
    Energy,
    Consumption,
    Flight,
}

impl EmissionCategory {
    pub const ALL: [EmissionCategory; 5] = [
        EmissionCategory::Transport,
        EmissionCategory::Food,
        EmissionCategory::Energy,
        EmissionCategory::Consumption,
        EmissionCategory::Flight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmissionCategory::Transport => "transport",
            EmissionCategory::Food => "food",
            EmissionCategory::Energy => "energy",
            EmissionCategory::Consumption => "consumption",
            EmissionCategory::Flight => "flight",
        }
    }
}

impl FromStr for EmissionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        EmissionCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == lower)
            .ok_or_else(|| format!("unknown emission category: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionMethod {
    Manual,
    ReceiptScan,
    AutoDetected,
    BankTransaction,
}

impl EmissionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmissionMethod::Manual => "manual",
            EmissionMethod::ReceiptScan => "receipt_scan",
            EmissionMethod::AutoDetected => "auto_detected",
            EmissionMethod::BankTransaction => "bank_transaction",
        }
    }
}

impl FromStr for EmissionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(EmissionMethod::Manual),
            "receipt_scan" => Ok(EmissionMethod::ReceiptScan),
            "auto_detected" => Ok(EmissionMethod::AutoDetected),
            "bank_transaction" => Ok(EmissionMethod::BankTransaction),
            _ => Err(format!("unknown emission method: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalMethod {
    #[serde(rename = "DAC")]
    Dac,
    #[serde(rename = "biochar")]
    Biochar,
    #[serde(rename = "kelp")]
    Kelp,
    #[serde(rename = "enhanced-weathering")]
    EnhancedWeathering,
    #[serde(rename = "reforestation")]
    Reforestation,
    #[serde(rename = "pooled-token")]
    PooledToken,
}

impl RemovalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalMethod::Dac => "DAC",
            RemovalMethod::Biochar => "biochar",
            RemovalMethod::Kelp => "kelp",
            RemovalMethod::EnhancedWeathering => "enhanced-weathering",
            RemovalMethod::Reforestation => "reforestation",
            RemovalMethod::PooledToken => "pooled-token",
        }
    }
}

impl FromStr for RemovalMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "dac" => Ok(RemovalMethod::Dac),
            "biochar" => Ok(RemovalMethod::Biochar),
            "kelp" => Ok(RemovalMethod::Kelp),
            "enhanced-weathering" => Ok(RemovalMethod::EnhancedWeathering),
            "reforestation" => Ok(RemovalMethod::Reforestation),
            "pooled-token" => Ok(RemovalMethod::PooledToken),
            _ => Err(format!("unknown removal method: {}", s)),
        }
    }
}

// ============================================================================
// DATE PARSING
// ============================================================================

/// Parse a caller-supplied timestamp.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD` and the bank-export
/// style `MM/DD/YYYY`. Naive values are taken as UTC; bare dates as midnight.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }

    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }

    None
}

fn check_amount(errors: &mut Vec<ValidationError>, context: &str, field: &str, value: f64) {
    if !value.is_finite() {
        errors.push(ValidationError::new(context, field, format!("must be finite, got {}", value)));
    } else if value <= 0.0 {
        errors.push(ValidationError::new(context, field, format!("must be greater than 0, got {}", value)));
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// EMISSION
// ============================================================================

/// Emission as reported by a collaborator (receipt analysis, bank feed, manual entry).
///
/// The core does not know how `amount_kg` was derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEmission {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(alias = "label")]
    pub source: String,

    pub amount_kg: f64,

    /// Missing date means "now"
    #[serde(default)]
    pub date: Option<String>,

    pub category: EmissionCategory,

    pub method: EmissionMethod,

    /// Estimator confidence, 0.0 - 1.0
    #[serde(default)]
    pub confidence: Option<f64>,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NewEmission {
    pub fn new(source: &str, amount_kg: f64, category: EmissionCategory, method: EmissionMethod) -> Self {
        NewEmission {
            id: None,
            source: source.to_string(),
            amount_kg,
            date: None,
            category,
            method,
            confidence: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_date(mut self, date: &str) -> Self {
        self.date = Some(date.to_string());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Validate and turn the draft into an immutable record
    pub fn into_record(self, now: DateTime<Utc>) -> Result<EmissionRecord, Vec<ValidationError>> {
        let mut errors = Vec::new();

        check_amount(&mut errors, "Emission", "amount_kg", self.amount_kg);

        let date = match self.date.as_deref() {
            None => Some(now),
            Some(raw) => {
                let parsed = parse_timestamp(raw);
                if parsed.is_none() {
                    errors.push(ValidationError::new(
                        "Emission",
                        "date",
                        format!("unparseable timestamp: {:?}", raw),
                    ));
                }
                parsed
            }
        };

        if let Some(score) = self.confidence {
            if !(0.0..=1.0).contains(&score) {
                errors.push(ValidationError::new(
                    "Emission",
                    "confidence",
                    format!("must be between 0.0 and 1.0, got {}", score),
                ));
            }
        }

        let date = match date {
            Some(date) if errors.is_empty() => date,
            _ => return Err(errors),
        };

        let mut metadata = self.metadata;
        if let Some(score) = self.confidence {
            metadata.insert("confidence_score".to_string(), serde_json::json!(score));
        }

        Ok(EmissionRecord {
            id: self.id.filter(|id| !id.trim().is_empty()).unwrap_or_else(new_id),
            source: self.source,
            amount_kg: self.amount_kg,
            date,
            category: self.category,
            method: self.method,
            metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmissionRecord {
    pub id: String,
    pub source: String,
    pub amount_kg: f64,
    pub date: DateTime<Utc>,
    pub category: EmissionCategory,
    pub method: EmissionMethod,
    #[serde(default)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EmissionRecord {
    /// Re-check a record coming back from storage or a snapshot
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push(ValidationError::new("Emission", "id", "Required field is empty"));
        }
        check_amount(&mut errors, "Emission", "amount_kg", self.amount_kg);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn confidence_score(&self) -> Option<f64> {
        self.metadata.get("confidence_score").and_then(|v| v.as_f64())
    }
}

// ============================================================================
// REMOVAL
// ============================================================================

/// A purchased removal. Only produced by a committed checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalRecord {
    pub id: String,
    pub project_name: String,
    pub provider: String,
    pub method: RemovalMethod,
    pub amount_kg: f64,
    pub cost_usd: f64,
    pub date: DateTime<Utc>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_reference: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_ref: Option<String>,
}

impl RemovalRecord {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push(ValidationError::new("Removal", "id", "Required field is empty"));
        }
        if self.provider.trim().is_empty() {
            errors.push(ValidationError::new("Removal", "provider", "Required field is empty"));
        }
        check_amount(&mut errors, "Removal", "amount_kg", self.amount_kg);
        if !self.cost_usd.is_finite() || self.cost_usd < 0.0 {
            errors.push(ValidationError::new(
                "Removal",
                "cost_usd",
                format!("must be a finite amount >= 0, got {}", self.cost_usd),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// ============================================================================
// LEDGER ENTRY (one ordered stream of both kinds)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Emission(EmissionRecord),
    Removal(RemovalRecord),
}

impl LedgerEntry {
    pub fn id(&self) -> &str {
        match self {
            LedgerEntry::Emission(e) => &e.id,
            LedgerEntry::Removal(r) => &r.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEntry::Emission(_) => "emission",
            LedgerEntry::Removal(_) => "removal",
        }
    }

    pub fn date(&self) -> DateTime<Utc> {
        match self {
            LedgerEntry::Emission(e) => e.date,
            LedgerEntry::Removal(r) => r.date,
        }
    }

    pub fn amount_kg(&self) -> f64 {
        match self {
            LedgerEntry::Emission(e) => e.amount_kg,
            LedgerEntry::Removal(r) => r.amount_kg,
        }
    }

    /// Contribution to the balance: emissions add, removals subtract
    pub fn signed_kg(&self) -> f64 {
        match self {
            LedgerEntry::Emission(e) => e.amount_kg,
            LedgerEntry::Removal(r) => -r.amount_kg,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            LedgerEntry::Emission(e) => &e.source,
            LedgerEntry::Removal(r) => &r.project_name,
        }
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        match self {
            LedgerEntry::Emission(e) => e.validate(),
            LedgerEntry::Removal(r) => r.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp("2025-01-15T08:30:00Z").unwrap();
        assert_eq!(rfc, Utc.with_ymd_and_hms(2025, 1, 15, 8, 30, 0).unwrap());

        let offset = parse_timestamp("2025-01-15T08:30:00+02:00").unwrap();
        assert_eq!(offset, Utc.with_ymd_and_hms(2025, 1, 15, 6, 30, 0).unwrap());

        let naive = parse_timestamp("2025-01-15 08:30:00").unwrap();
        assert_eq!(naive, rfc);

        let date = parse_timestamp("2025-01-15").unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());

        let bank = parse_timestamp("12/31/2024").unwrap();
        assert_eq!(bank, Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap());

        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("2025-13-40").is_none());
    }

    #[test]
    fn test_new_emission_assigns_id_and_defaults_date() {
        let record = NewEmission::new("Uber ride SFO → SJC", 14.2, EmissionCategory::Transport, EmissionMethod::BankTransaction)
            .into_record(now())
            .unwrap();

        assert!(!record.id.is_empty());
        assert_eq!(record.date, now());
        assert_eq!(record.amount_kg, 14.2);
    }

    #[test]
    fn test_new_emission_keeps_caller_id() {
        let mut draft = NewEmission::new("Delta Flight", 420.5, EmissionCategory::Flight, EmissionMethod::AutoDetected);
        draft.id = Some("flight-1".to_string());

        let record = draft.into_record(now()).unwrap();
        assert_eq!(record.id, "flight-1");
    }

    #[test]
    fn test_new_emission_rejects_bad_amounts() {
        for amount in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            let result = NewEmission::new("Bad", amount, EmissionCategory::Food, EmissionMethod::Manual)
                .into_record(now());
            let errors = result.unwrap_err();
            assert_eq!(errors.len(), 1, "amount {} should fail once", amount);
            assert_eq!(errors[0].field, "amount_kg");
        }
    }

    #[test]
    fn test_new_emission_collects_every_error() {
        let errors = NewEmission::new("Bad", -1.0, EmissionCategory::Food, EmissionMethod::Manual)
            .with_date("not a date")
            .with_confidence(1.5)
            .into_record(now())
            .unwrap_err();

        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["amount_kg", "date", "confidence"]);
    }

    #[test]
    fn test_confidence_stored_in_metadata() {
        let record = NewEmission::new("Groceries", 8.45, EmissionCategory::Food, EmissionMethod::ReceiptScan)
            .with_confidence(0.92)
            .into_record(now())
            .unwrap();

        assert_eq!(record.confidence_score(), Some(0.92));
    }

    #[test]
    fn test_removal_validation() {
        let mut removal = RemovalRecord {
            id: "r1".to_string(),
            project_name: "Climeworks Orca".to_string(),
            provider: "Climeworks".to_string(),
            method: RemovalMethod::Dac,
            amount_kg: 50.0,
            cost_usd: 42.5,
            date: now(),
            settlement_reference: None,
            certificate_ref: None,
        };
        assert!(removal.validate().is_ok());

        removal.cost_usd = 0.0;
        assert!(removal.validate().is_ok(), "free removals are allowed");

        removal.cost_usd = -1.0;
        removal.amount_kg = 0.0;
        let errors = removal.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("Flight".parse::<EmissionCategory>().unwrap(), EmissionCategory::Flight);
        assert_eq!("receipt_scan".parse::<EmissionMethod>().unwrap(), EmissionMethod::ReceiptScan);
        assert_eq!("Enhanced Weathering".parse::<RemovalMethod>().unwrap(), RemovalMethod::EnhancedWeathering);
        assert_eq!("dac".parse::<RemovalMethod>().unwrap(), RemovalMethod::Dac);
        assert!("lava".parse::<RemovalMethod>().is_err());
        assert!("shopping".parse::<EmissionCategory>().is_err());
    }

    #[test]
    fn test_entry_json_shape() {
        let record = NewEmission::new("Home Energy", 85.0, EmissionCategory::Energy, EmissionMethod::Manual)
            .with_date("2025-01-10")
            .into_record(now())
            .unwrap();
        let entry = LedgerEntry::Emission(record);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "emission");
        assert_eq!(json["amountKg"], 85.0);
        assert_eq!(json["category"], "energy");
        assert!(json.get("metadata").is_none());
        assert_eq!(entry.signed_kg(), 85.0);
    }
}
