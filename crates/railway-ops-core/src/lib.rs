use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OpsError {
    #[error("invalid record handle: {0}")]
    InvalidHandle(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Store-assigned record handle: 12 opaque bytes, rendered as a fixed
/// 24-character hex string. This is the surrogate encoding that leaked
/// into `alerts.train_number` before the schema change.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DocId([u8; 12]);

impl DocId {
    pub const ENCODED_LEN: usize = 24;

    #[must_use]
    pub fn new() -> Self {
        let ulid_bytes = Ulid::new().to_bytes();
        let mut bytes = [0_u8; 12];
        bytes.copy_from_slice(&ulid_bytes[..12]);
        Self(bytes)
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }
}

impl Default for DocId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DocId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for DocId {
    type Err = OpsError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.len() != Self::ENCODED_LEN {
            return Err(OpsError::InvalidHandle(raw.to_string()));
        }

        let mut bytes = [0_u8; 12];
        for (index, pair) in raw.as_bytes().chunks_exact(2).enumerate() {
            let high = hex_value(pair[0]).ok_or_else(|| OpsError::InvalidHandle(raw.to_string()))?;
            let low = hex_value(pair[1]).ok_or_else(|| OpsError::InvalidHandle(raw.to_string()))?;
            bytes[index] = (high << 4) | low;
        }

        Ok(Self(bytes))
    }
}

impl Serialize for DocId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DocId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// What a raw `train_number` value actually is, decided once at read
/// time instead of re-derived on every use.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TrainRef {
    /// Not the legacy handle width; treated as a human-facing number.
    Canonical(String),
    /// Legacy surrogate handle, resolvable against the trains collection.
    Handle(DocId),
    /// Handle width but not valid hex. The legacy heuristic only checked
    /// length, so these would have been sent to a doomed lookup; they are
    /// surfaced for manual review instead of being silently rewritten.
    Ambiguous(String),
}

impl TrainRef {
    #[must_use]
    pub fn classify(raw: &str) -> Self {
        if raw.len() != DocId::ENCODED_LEN {
            return Self::Canonical(raw.to_string());
        }

        match raw.parse::<DocId>() {
            Ok(handle) => Self::Handle(handle),
            Err(_) => Self::Ambiguous(raw.to_string()),
        }
    }
}

/// Renders a JSON scalar the way the legacy store compared it: strings
/// as-is, numbers and booleans via their display form. Arrays, objects,
/// and null have no scalar form.
#[must_use]
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Candidate field names for a train's canonical number, tried in
/// priority order. `TrainNo` predates the schema change; `number` is the
/// current name.
pub const TRAIN_NUMBER_FIELDS: &[&str] = &["TrainNo", "number"];

/// Candidate field names for a train's display name, same priority
/// policy as [`TRAIN_NUMBER_FIELDS`].
pub const TRAIN_NAME_FIELDS: &[&str] = &["TrainName", "name"];

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CanonicalTrain {
    pub number: String,
    pub name: String,
}

/// Extracts the canonical number and name from a train document,
/// walking the alias chains and defaulting to empty strings when no
/// candidate field is present.
#[must_use]
pub fn canonical_train(doc: &Value) -> CanonicalTrain {
    CanonicalTrain {
        number: first_scalar_field(doc, TRAIN_NUMBER_FIELDS),
        name: first_scalar_field(doc, TRAIN_NAME_FIELDS),
    }
}

fn first_scalar_field(doc: &Value, candidates: &[&str]) -> String {
    candidates
        .iter()
        .find_map(|field| doc.get(*field).and_then(scalar_to_string))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AlertRepair {
    /// `train_number` held a resolvable handle; both fields were rewritten.
    Updated {
        previous: String,
        train_number: String,
        train_name: String,
    },
    /// The handle no longer matches any train document.
    TrainMissing { handle: DocId },
    /// Already a human-facing value (or no value at all); no write.
    AlreadyCanonical,
    /// Handle-width value that is not a handle; flagged, no write.
    NeedsReview { value: String },
    /// Lookup or write failed for this record; the batch continued.
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AlertRepairRecord {
    pub alert_id: DocId,
    #[serde(flatten)]
    pub repair: AlertRepair,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub updated: usize,
    pub missing: usize,
    pub compliant: usize,
    pub flagged: usize,
    pub failed: usize,
    pub records: Vec<AlertRepairRecord>,
}

impl ReconcileReport {
    #[must_use]
    pub fn tally(records: Vec<AlertRepairRecord>) -> Self {
        let mut report = Self {
            scanned: records.len(),
            updated: 0,
            missing: 0,
            compliant: 0,
            flagged: 0,
            failed: 0,
            records,
        };

        for record in &report.records {
            match record.repair {
                AlertRepair::Updated { .. } => report.updated += 1,
                AlertRepair::TrainMissing { .. } => report.missing += 1,
                AlertRepair::AlreadyCanonical => report.compliant += 1,
                AlertRepair::NeedsReview { .. } => report.flagged += 1,
                AlertRepair::Failed { .. } => report.failed += 1,
            }
        }

        report
    }
}

pub mod collections {
    pub const USERS: &str = "users";
    pub const BOOKINGS: &str = "bookings";
    pub const TRAINS: &str = "trains";
    pub const PAYMENTS: &str = "payments";
    pub const ALERTS: &str = "alerts";

    pub const ALL: &[&str] = &[USERS, BOOKINGS, TRAINS, PAYMENTS, ALERTS];
}

/// Alert fields the reconciler is allowed to touch.
pub const ALERT_TRAIN_NUMBER: &str = "train_number";
pub const ALERT_TRAIN_NAME: &str = "train_name";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct IndexSpec {
    pub collection: &'static str,
    pub field: &'static str,
    pub unique: bool,
}

impl IndexSpec {
    #[must_use]
    pub fn name(&self) -> String {
        format!("idx_{}_{}", self.collection, self.field)
    }
}

/// The fixed index catalog for the five core collections.
pub const RAILWAY_INDEXES: &[IndexSpec] = &[
    IndexSpec {
        collection: collections::USERS,
        field: "email",
        unique: true,
    },
    IndexSpec {
        collection: collections::USERS,
        field: "role",
        unique: false,
    },
    IndexSpec {
        collection: collections::BOOKINGS,
        field: "passenger_id",
        unique: false,
    },
    IndexSpec {
        collection: collections::BOOKINGS,
        field: "pnr",
        unique: true,
    },
    IndexSpec {
        collection: collections::BOOKINGS,
        field: "train_id",
        unique: false,
    },
    IndexSpec {
        collection: collections::BOOKINGS,
        field: "date",
        unique: false,
    },
    IndexSpec {
        collection: collections::TRAINS,
        field: "train_number",
        unique: true,
    },
    IndexSpec {
        collection: collections::TRAINS,
        field: "source",
        unique: false,
    },
    IndexSpec {
        collection: collections::TRAINS,
        field: "destination",
        unique: false,
    },
    IndexSpec {
        collection: collections::PAYMENTS,
        field: "booking_id",
        unique: false,
    },
    IndexSpec {
        collection: collections::PAYMENTS,
        field: "passenger_id",
        unique: false,
    },
    IndexSpec {
        collection: collections::PAYMENTS,
        field: "transaction_id",
        unique: true,
    },
    IndexSpec {
        collection: collections::ALERTS,
        field: "passenger_id",
        unique: false,
    },
    IndexSpec {
        collection: collections::ALERTS,
        field: "train_id",
        unique: false,
    },
    IndexSpec {
        collection: collections::ALERTS,
        field: "is_active",
        unique: false,
    },
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldCheck {
    /// Field must be present and non-null.
    Required,
    /// Minimal address shape: something before `@`, a dot in the domain.
    AddressShaped,
    /// Value must be one of the listed strings.
    OneOf(&'static [&'static str]),
    /// Numeric value within an inclusive range.
    Range { min: f64, max: f64 },
    /// Value must match a GLOB pattern.
    Glob(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldRule {
    pub field: &'static str,
    pub check: FieldCheck,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatorSpec {
    pub collection: &'static str,
    pub rules: &'static [FieldRule],
}

const PNR_GLOB: &str =
    "[A-Z0-9][A-Z0-9][A-Z0-9][A-Z0-9][A-Z0-9][A-Z0-9][A-Z0-9][A-Z0-9][A-Z0-9][A-Z0-9]";

pub const BOOKING_STATUSES: &[&str] = &["confirmed", "waiting", "cancelled"];
pub const USER_ROLES: &[&str] = &["passenger", "admin"];

/// The fixed validation catalog. Rules only constrain writes performed
/// after installation; pre-existing rows are the reconciler's problem.
pub const RAILWAY_VALIDATORS: &[ValidatorSpec] = &[
    ValidatorSpec {
        collection: collections::USERS,
        rules: &[
            FieldRule {
                field: "email",
                check: FieldCheck::Required,
            },
            FieldRule {
                field: "email",
                check: FieldCheck::AddressShaped,
            },
            FieldRule {
                field: "password",
                check: FieldCheck::Required,
            },
            FieldRule {
                field: "role",
                check: FieldCheck::OneOf(USER_ROLES),
            },
        ],
    },
    ValidatorSpec {
        collection: collections::BOOKINGS,
        rules: &[
            FieldRule {
                field: "pnr",
                check: FieldCheck::Glob(PNR_GLOB),
            },
            FieldRule {
                field: "amount",
                check: FieldCheck::Range {
                    min: 0.0,
                    max: 500_000.0,
                },
            },
            FieldRule {
                field: "status",
                check: FieldCheck::OneOf(BOOKING_STATUSES),
            },
        ],
    },
];

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`OpsError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, OpsError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| OpsError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn doc_id_round_trips_through_hex() {
        let id = DocId::new();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), DocId::ENCODED_LEN);

        let parsed: DocId = must_ok(rendered.parse());
        assert_eq!(parsed, id);
    }

    #[test]
    fn doc_id_accepts_uppercase_hex() {
        let parsed: DocId = must_ok("5F9B2C4D1E8A7B6C5D4E3F2A".parse());
        assert_eq!(parsed.to_string(), "5f9b2c4d1e8a7b6c5d4e3f2a");
    }

    #[test]
    fn doc_id_rejects_wrong_width_and_non_hex() {
        assert!("5f9b2c".parse::<DocId>().is_err());
        assert!("zzzzzzzzzzzzzzzzzzzzzzzz".parse::<DocId>().is_err());
    }

    #[test]
    fn classify_leaves_short_and_long_values_canonical() {
        assert_eq!(
            TrainRef::classify("12345"),
            TrainRef::Canonical("12345".to_string())
        );
        assert_eq!(
            TrainRef::classify("5f9b2c4d1e8a7b6c5d4e3f2a99"),
            TrainRef::Canonical("5f9b2c4d1e8a7b6c5d4e3f2a99".to_string())
        );
        assert_eq!(TrainRef::classify(""), TrainRef::Canonical(String::new()));
    }

    #[test]
    fn classify_detects_handle_width_hex() {
        let raw = "5f9b2c4d1e8a7b6c5d4e3f2a";
        match TrainRef::classify(raw) {
            TrainRef::Handle(handle) => assert_eq!(handle.to_string(), raw),
            other => panic!("expected handle, got {other:?}"),
        }
    }

    #[test]
    fn classify_flags_handle_width_non_hex() {
        let raw = "SUPERFAST EXPRESS LINE X";
        assert_eq!(raw.len(), 24);
        assert_eq!(
            TrainRef::classify(raw),
            TrainRef::Ambiguous(raw.to_string())
        );
    }

    #[test]
    fn canonical_train_prefers_legacy_field_names() {
        let doc = json!({
            "TrainNo": "12951",
            "TrainName": "Rajdhani Express",
            "number": "99999",
            "name": "Wrong Name",
        });

        let train = canonical_train(&doc);
        assert_eq!(train.number, "12951");
        assert_eq!(train.name, "Rajdhani Express");
    }

    #[test]
    fn canonical_train_falls_back_to_current_field_names() {
        let doc = json!({ "number": 12951, "name": "Rajdhani Express" });

        let train = canonical_train(&doc);
        assert_eq!(train.number, "12951");
        assert_eq!(train.name, "Rajdhani Express");
    }

    #[test]
    fn canonical_train_defaults_to_empty_strings() {
        let train = canonical_train(&json!({ "source": "NDLS" }));
        assert_eq!(train.number, "");
        assert_eq!(train.name, "");
    }

    #[test]
    fn tally_counts_each_outcome_once() {
        let records = vec![
            AlertRepairRecord {
                alert_id: DocId::new(),
                repair: AlertRepair::AlreadyCanonical,
            },
            AlertRepairRecord {
                alert_id: DocId::new(),
                repair: AlertRepair::Updated {
                    previous: "5f9b2c4d1e8a7b6c5d4e3f2a".to_string(),
                    train_number: "12345".to_string(),
                    train_name: "Express".to_string(),
                },
            },
            AlertRepairRecord {
                alert_id: DocId::new(),
                repair: AlertRepair::TrainMissing {
                    handle: DocId::new(),
                },
            },
            AlertRepairRecord {
                alert_id: DocId::new(),
                repair: AlertRepair::NeedsReview {
                    value: "SUPERFAST EXPRESS LINE X".to_string(),
                },
            },
            AlertRepairRecord {
                alert_id: DocId::new(),
                repair: AlertRepair::Failed {
                    message: "boom".to_string(),
                },
            },
        ];

        let report = ReconcileReport::tally(records);
        assert_eq!(report.scanned, 5);
        assert_eq!(report.updated, 1);
        assert_eq!(report.missing, 1);
        assert_eq!(report.compliant, 1);
        assert_eq!(report.flagged, 1);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn index_catalog_covers_all_five_collections() {
        for collection in collections::ALL {
            assert!(
                RAILWAY_INDEXES
                    .iter()
                    .any(|spec| spec.collection == *collection),
                "no index declared for {collection}"
            );
        }
    }

    #[test]
    fn unique_indexes_match_the_catalog() {
        let unique: Vec<String> = RAILWAY_INDEXES
            .iter()
            .filter(|spec| spec.unique)
            .map(IndexSpec::name)
            .collect();

        assert_eq!(
            unique,
            vec![
                "idx_users_email",
                "idx_bookings_pnr",
                "idx_trains_train_number",
                "idx_payments_transaction_id",
            ]
        );
    }

    #[test]
    fn scalar_rendering_matches_legacy_comparison_rules() {
        assert_eq!(scalar_to_string(&json!("12345")), Some("12345".to_string()));
        assert_eq!(scalar_to_string(&json!(12345)), Some("12345".to_string()));
        assert_eq!(scalar_to_string(&json!(null)), None);
        assert_eq!(scalar_to_string(&json!({"nested": 1})), None);
    }
}
