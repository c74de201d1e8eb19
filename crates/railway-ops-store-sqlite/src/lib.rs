#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use railway_ops_core::{
    canonical_train, collections, format_rfc3339, now_utc, scalar_to_string, AlertRepair,
    AlertRepairRecord, DocId, FieldCheck, FieldRule, IndexSpec, ReconcileReport, TrainRef,
    ValidatorSpec, ALERT_TRAIN_NAME, ALERT_TRAIN_NUMBER, RAILWAY_INDEXES, RAILWAY_VALIDATORS,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

const STORE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_COLLECTIONS_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  doc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bookings (
  id TEXT PRIMARY KEY,
  doc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trains (
  id TEXT PRIMARY KEY,
  doc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payments (
  id TEXT PRIMARY KEY,
  doc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts (
  id TEXT PRIMARY KEY,
  doc TEXT NOT NULL
);
";

/// A stored document: unique handle plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocId,
    pub body: Value,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ProvisionReport {
    pub created: Vec<String>,
    pub unchanged: Vec<String>,
}

pub struct SqliteDocumentStore {
    conn: Connection,
}

impl SqliteDocumentStore {
    /// Opens the document store. Failure here is fatal to a run: nothing
    /// has been scanned or written yet.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to reach document store at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_COLLECTIONS_V1)
            .context("failed to create collection tables")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORE_MIGRATION_VERSION, now],
            )
            .context("failed to register collection schema migration")?;

        Ok(())
    }

    pub fn insert(&self, collection: &str, id: DocId, body: &Value) -> Result<()> {
        let table = known_collection(collection)?;
        let payload =
            serde_json::to_string(body).context("failed to serialize document body")?;

        self.conn
            .execute(
                &format!("INSERT INTO {table}(id, doc) VALUES (?1, ?2)"),
                params![id.to_string(), payload],
            )
            .with_context(|| format!("failed to insert into {collection}"))?;

        Ok(())
    }

    pub fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        let table = known_collection(collection)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id, doc FROM {table} ORDER BY id ASC"))?;

        let mut rows = stmt.query([])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            documents.push(parse_document_row(collection, row)?);
        }

        Ok(documents)
    }

    pub fn find_limit(&self, collection: &str, limit: usize) -> Result<Vec<Document>> {
        let table = known_collection(collection)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, doc FROM {table} ORDER BY id ASC LIMIT {limit}"
        ))?;

        let mut rows = stmt.query([])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            documents.push(parse_document_row(collection, row)?);
        }

        Ok(documents)
    }

    pub fn find_one(&self, collection: &str, id: DocId) -> Result<Option<Value>> {
        let table = known_collection(collection)?;
        let raw = self
            .conn
            .query_row(
                &format!("SELECT doc FROM {table} WHERE id = ?1"),
                params![id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up {collection}/{id}"))?;

        raw.map(|body| {
            serde_json::from_str(&body)
                .with_context(|| format!("invalid stored document {collection}/{id}"))
        })
        .transpose()
    }

    /// Targeted field-set scoped by the record's unique id. Only the named
    /// fields change; the rest of the document passes through untouched.
    pub fn update_fields(&self, collection: &str, id: DocId, fields: &[(&str, Value)]) -> Result<()> {
        let table = known_collection(collection)?;
        if fields.is_empty() {
            return Ok(());
        }

        let mut assignments = String::new();
        for (position, (field, _)) in fields.iter().enumerate() {
            assignments.push_str(&format!(", '$.{field}', json(?{})", position + 2));
        }

        let mut args = vec![id.to_string()];
        for (_, value) in fields {
            args.push(serde_json::to_string(value).context("failed to serialize field value")?);
        }

        let changed = self
            .conn
            .execute(
                &format!("UPDATE {table} SET doc = json_set(doc{assignments}) WHERE id = ?1"),
                rusqlite::params_from_iter(args),
            )
            .with_context(|| format!("failed to update {collection}/{id}"))?;

        if changed != 1 {
            bail!("no document {collection}/{id} to update");
        }

        Ok(())
    }

    /// Full repair pass over the alerts collection: every record is
    /// classified once, handles are resolved against the trains
    /// collection, and per-record failures never abort the batch.
    pub fn reconcile_alerts(&self) -> Result<ReconcileReport> {
        let alerts = self.find_all(collections::ALERTS)?;

        let mut records = Vec::with_capacity(alerts.len());
        for alert in alerts {
            let repair = self.repair_alert(&alert);
            records.push(AlertRepairRecord {
                alert_id: alert.id,
                repair,
            });
        }

        Ok(ReconcileReport::tally(records))
    }

    fn repair_alert(&self, alert: &Document) -> AlertRepair {
        let Some(raw) = alert
            .body
            .get(ALERT_TRAIN_NUMBER)
            .and_then(scalar_to_string)
        else {
            return AlertRepair::AlreadyCanonical;
        };

        match TrainRef::classify(&raw) {
            TrainRef::Canonical(_) => AlertRepair::AlreadyCanonical,
            TrainRef::Ambiguous(value) => AlertRepair::NeedsReview { value },
            TrainRef::Handle(handle) => match self.resolve_and_update(alert.id, handle, &raw) {
                Ok(repair) => repair,
                Err(err) => AlertRepair::Failed {
                    message: format!("{err:#}"),
                },
            },
        }
    }

    fn resolve_and_update(
        &self,
        alert_id: DocId,
        handle: DocId,
        previous: &str,
    ) -> Result<AlertRepair> {
        let Some(train_doc) = self.find_one(collections::TRAINS, handle)? else {
            return Ok(AlertRepair::TrainMissing { handle });
        };

        let train = canonical_train(&train_doc);
        self.update_fields(
            collections::ALERTS,
            alert_id,
            &[
                (ALERT_TRAIN_NUMBER, Value::String(train.number.clone())),
                (ALERT_TRAIN_NAME, Value::String(train.name.clone())),
            ],
        )?;

        Ok(AlertRepair::Updated {
            previous: previous.to_string(),
            train_number: train.number,
            train_name: train.name,
        })
    }

    /// Installs the index catalog. Re-declaring an identical index is a
    /// no-op; a same-named index with a different definition aborts the
    /// run before anything else is touched for that entry.
    pub fn create_indexes(&self) -> Result<ProvisionReport> {
        let mut report = ProvisionReport::default();

        for spec in RAILWAY_INDEXES {
            let name = spec.name();
            let desired = index_sql(spec);

            match self.schema_object_sql("index", &name)? {
                None => {
                    self.conn
                        .execute_batch(&desired)
                        .with_context(|| format!("failed to create index {name}"))?;
                    report.created.push(name);
                }
                Some(existing) if normalize_sql(&existing) == normalize_sql(&desired) => {
                    report.unchanged.push(name);
                }
                Some(existing) => bail!(
                    "index conflict on {name}: existing definition `{existing}` does not match \
                     requested `{desired}`; drop the index manually and rerun setup"
                ),
            }
        }

        Ok(report)
    }

    /// Installs the validation triggers. Rules only constrain writes made
    /// after installation; pre-existing rows are left for the reconciler.
    pub fn create_validators(&self) -> Result<ProvisionReport> {
        let mut report = ProvisionReport::default();

        for spec in RAILWAY_VALIDATORS {
            for op in [TriggerOp::Insert, TriggerOp::Update] {
                let name = trigger_name(spec.collection, op);
                let desired = trigger_sql(spec, op);

                match self.schema_object_sql("trigger", &name)? {
                    None => {
                        self.conn
                            .execute_batch(&desired)
                            .with_context(|| format!("failed to create validator {name}"))?;
                        report.created.push(name);
                    }
                    Some(existing) if normalize_sql(&existing) == normalize_sql(&desired) => {
                        report.unchanged.push(name);
                    }
                    Some(existing) => bail!(
                        "validator conflict on {name}: existing definition `{existing}` does not \
                         match requested `{desired}`; drop the trigger manually and rerun setup"
                    ),
                }
            }
        }

        Ok(report)
    }

    fn schema_object_sql(&self, object_type: &str, name: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = ?1 AND name = ?2",
                params![object_type, name],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .context("failed to query sqlite_master")
            .map(Option::flatten)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_document_row(collection: &str, row: &rusqlite::Row<'_>) -> Result<Document> {
    let id_raw: String = row.get(0)?;
    let body_raw: String = row.get(1)?;

    let id: DocId = id_raw
        .parse()
        .map_err(|err| anyhow!("invalid document id in {collection}: {err}"))?;
    let body: Value = serde_json::from_str(&body_raw)
        .with_context(|| format!("invalid stored document {collection}/{id_raw}"))?;

    Ok(Document { id, body })
}

fn known_collection(collection: &str) -> Result<&'static str> {
    collections::ALL
        .iter()
        .copied()
        .find(|known| *known == collection)
        .ok_or_else(|| anyhow!("unknown collection: {collection}"))
}

fn index_sql(spec: &IndexSpec) -> String {
    let unique = if spec.unique { "UNIQUE " } else { "" };
    format!(
        "CREATE {unique}INDEX IF NOT EXISTS {} ON {} (json_extract(doc, '$.{}'))",
        spec.name(),
        spec.collection,
        spec.field
    )
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum TriggerOp {
    Insert,
    Update,
}

impl TriggerOp {
    fn keyword(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
        }
    }
}

fn trigger_name(collection: &str, op: TriggerOp) -> String {
    format!("trg_{collection}_validate_{}", op.suffix())
}

fn trigger_sql(spec: &ValidatorSpec, op: TriggerOp) -> String {
    let mut body = String::new();
    for rule in spec.rules {
        body.push_str(&format!(
            "  SELECT RAISE(ABORT, '{}')\n  WHERE NOT ({});\n",
            rule_message(spec.collection, rule),
            rule_predicate(rule)
        ));
    }

    format!(
        "CREATE TRIGGER IF NOT EXISTS {} BEFORE {} ON {}\nBEGIN\n{}END",
        trigger_name(spec.collection, op),
        op.keyword(),
        spec.collection,
        body
    )
}

/// Predicates follow document-validator semantics: apart from
/// `Required`, a rule is only enforced when the field is present (the
/// NULL comparison result skips the RAISE).
fn rule_predicate(rule: &FieldRule) -> String {
    let value = format!("json_extract(NEW.doc, '$.{}')", rule.field);
    match rule.check {
        FieldCheck::Required => format!("{value} IS NOT NULL"),
        FieldCheck::AddressShaped => format!("{value} LIKE '%_@_%._%'"),
        FieldCheck::OneOf(options) => {
            let quoted: Vec<String> = options
                .iter()
                .map(|option| format!("'{option}'"))
                .collect();
            format!("{value} IN ({})", quoted.join(", "))
        }
        FieldCheck::Range { min, max } => {
            format!("CAST({value} AS REAL) BETWEEN {min} AND {max}")
        }
        FieldCheck::Glob(pattern) => format!("{value} GLOB '{pattern}'"),
    }
}

fn rule_message(collection: &str, rule: &FieldRule) -> String {
    let field = rule.field;
    match rule.check {
        FieldCheck::Required => format!("{collection}.{field} is required"),
        FieldCheck::AddressShaped => format!("{collection}.{field} must look like an address"),
        FieldCheck::OneOf(options) => {
            format!("{collection}.{field} must be one of {}", options.join(", "))
        }
        FieldCheck::Range { min, max } => {
            format!("{collection}.{field} must be between {min} and {max}")
        }
        FieldCheck::Glob(_) => format!("{collection}.{field} has an invalid format"),
    }
}

fn normalize_sql(sql: &str) -> String {
    sql.replace("IF NOT EXISTS ", "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
