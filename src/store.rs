use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema;
use crate::types::{
    clamp_risk_score, Asset, AssetContext, AssetId, AssetSummary, ClassificationRecord,
    ClassificationUpdate, ExploitAdvice, PortFinding, Purpose, VulnerabilityFinding,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const EXPORT_SQL: &str = "\
    SELECT a.name, a.purpose, \
           GROUP_CONCAT(DISTINCT p.port || '/' || p.service || '/' || p.state), \
           GROUP_CONCAT(DISTINCT v.template_id || ' (' || v.severity || ')'), \
           c.backend, e.risk_score, e.advice_text \
    FROM assets a \
    LEFT JOIN port_findings p ON p.asset_id = a.id \
    LEFT JOIN vulnerability_findings v ON v.asset_id = a.id \
    LEFT JOIN classifications c ON c.asset_id = a.id \
    LEFT JOIN exploit_advice e ON e.asset_id = a.id \
    GROUP BY a.id \
    ORDER BY a.name";

/// Per-domain findings database backed by SQLite.
///
/// Every write goes through one connection behind a mutex and runs in its own
/// transaction. Asset rows are created implicitly by every writer.
pub struct AssetStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for AssetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetStore").finish_non_exhaustive()
    }
}

impl AssetStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::initialize(&conn)?;
        debug!(path = %path.display(), "asset store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Return the id of `name`, creating the asset if needed.
    ///
    /// Backed by the unique constraint on `assets.name`: concurrent callers,
    /// even on separate connections, always converge on a single row.
    pub fn get_or_create(&self, name: &str) -> Result<AssetId, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = ensure_asset(&tx, name)?;
        tx.commit()?;
        Ok(id)
    }

    /// Replace the classification of `name`. A supplied purpose also becomes
    /// the asset's purpose.
    pub fn upsert_classification(
        &self,
        name: &str,
        update: &ClassificationUpdate,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = ensure_asset(&tx, name)?;
        let purpose = update.purpose.map(|p| p.as_str());
        tx.execute(
            "INSERT INTO classifications \
             (asset_id, backend, purpose, vulnerabilities_summary, exploration_summary, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(asset_id) DO UPDATE SET \
               backend = excluded.backend, \
               purpose = excluded.purpose, \
               vulnerabilities_summary = excluded.vulnerabilities_summary, \
               exploration_summary = excluded.exploration_summary, \
               created_at = excluded.created_at",
            params![
                id,
                update.backend,
                purpose,
                update.vulnerabilities_summary,
                update.exploration_summary,
                now_rfc3339(),
            ],
        )?;
        if let Some(purpose) = purpose {
            tx.execute(
                "UPDATE assets SET purpose = ?1 WHERE id = ?2",
                params![purpose, id],
            )?;
        }
        tx.commit()?;
        info!(asset = name, purpose = purpose.unwrap_or("-"), "saved classification");
        Ok(())
    }

    /// Replace the exploit advice of `name`. The score is clamped to `[0, 10]`.
    pub fn upsert_advice(&self, name: &str, advice: &str, risk_score: f64) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = ensure_asset(&tx, name)?;
        tx.execute(
            "INSERT INTO exploit_advice (asset_id, advice_text, risk_score, created_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(asset_id) DO UPDATE SET \
               advice_text = excluded.advice_text, \
               risk_score = excluded.risk_score, \
               created_at = excluded.created_at",
            params![id, advice, clamp_risk_score(risk_score), now_rfc3339()],
        )?;
        tx.commit()?;
        info!(asset = name, "saved exploit advice");
        Ok(())
    }

    /// Append port findings for `name`; returns the number of rows written.
    pub fn append_port_findings(
        &self,
        name: &str,
        findings: &[PortFinding],
    ) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = ensure_asset(&tx, name)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO port_findings (asset_id, port, protocol, service, version, state) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for f in findings {
                stmt.execute(params![id, f.port, f.protocol, f.service, f.version, f.state])?;
            }
        }
        tx.commit()?;
        debug!(asset = name, count = findings.len(), "saved port findings");
        Ok(findings.len())
    }

    /// Append vulnerability findings for `name`; returns the number of rows written.
    pub fn append_vulnerability_findings(
        &self,
        name: &str,
        findings: &[VulnerabilityFinding],
    ) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = ensure_asset(&tx, name)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO vulnerability_findings \
                 (asset_id, template_id, severity, matcher, matched_at, kind) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for f in findings {
                stmt.execute(params![
                    id,
                    f.template_id,
                    f.severity.as_str(),
                    f.matcher,
                    f.matched_at,
                    f.kind
                ])?;
            }
        }
        tx.commit()?;
        debug!(asset = name, count = findings.len(), "saved vulnerability findings");
        Ok(findings.len())
    }

    /// One row per asset with every finding kind collapsed into a summary
    /// string. Assets without findings still appear, with empty fields.
    pub fn export_joined_view(&self) -> Result<Vec<AssetSummary>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(EXPORT_SQL)?;
        let rows = stmt.query_map([], |row| {
            Ok(AssetSummary {
                subdomain: row.get(0)?,
                purpose: row.get(1)?,
                ports: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                vulnerabilities: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                backend: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                risk_score: row.get(5)?,
                advice: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Write [`export_joined_view`](Self::export_joined_view) as pretty JSON.
    pub fn export_json(&self, path: &Path) -> Result<usize, StoreError> {
        let rows = self.export_joined_view()?;
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &rows)?;
        info!(path = %path.display(), assets = rows.len(), "asset graph exported");
        Ok(rows.len())
    }

    pub fn asset(&self, name: &str) -> Result<Option<Asset>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, name, purpose FROM assets WHERE name = ?1",
                [name],
                |row| {
                    Ok(Asset {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        purpose: row.get::<_, Option<String>>(2)?.map(|p| Purpose::from_label(&p)),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn asset_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM assets ORDER BY name")?;
        let names = stmt.query_map([], |row| row.get(0))?;
        Ok(names.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn port_findings(&self, name: &str) -> Result<Vec<PortFinding>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT p.port, p.protocol, p.service, p.version, p.state \
             FROM port_findings p JOIN assets a ON a.id = p.asset_id \
             WHERE a.name = ?1 ORDER BY p.id",
        )?;
        let rows = stmt.query_map([name], |row| {
            Ok(PortFinding {
                port: row.get(0)?,
                protocol: row.get(1)?,
                service: row.get(2)?,
                version: row.get(3)?,
                state: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn vulnerability_findings(&self, name: &str) -> Result<Vec<VulnerabilityFinding>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT v.template_id, v.severity, v.matcher, v.matched_at, v.kind \
             FROM vulnerability_findings v JOIN assets a ON a.id = v.asset_id \
             WHERE a.name = ?1 ORDER BY v.id",
        )?;
        let rows = stmt.query_map([name], |row| {
            let severity: String = row.get(1)?;
            Ok(VulnerabilityFinding {
                template_id: row.get(0)?,
                severity: severity.parse().unwrap_or_default(),
                matcher: row.get(2)?,
                matched_at: row.get(3)?,
                kind: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Stored findings of `name` for prompt building. Unknown assets yield an
    /// empty context.
    pub fn asset_context(&self, name: &str) -> Result<AssetContext, StoreError> {
        Ok(AssetContext {
            asset: name.to_string(),
            ports: self.port_findings(name)?,
            vulnerabilities: self.vulnerability_findings(name)?,
            tech_stack: Vec::new(),
        })
    }

    pub fn classification(&self, name: &str) -> Result<Option<ClassificationRecord>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT c.backend, c.purpose, c.vulnerabilities_summary, c.exploration_summary, c.created_at \
                 FROM classifications c JOIN assets a ON a.id = c.asset_id WHERE a.name = ?1",
                [name],
                |row| {
                    Ok(ClassificationRecord {
                        asset: name.to_string(),
                        backend: row.get(0)?,
                        purpose: row.get::<_, Option<String>>(1)?.map(|p| Purpose::from_label(&p)),
                        vulnerabilities_summary: row.get(2)?,
                        exploration_summary: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn advice(&self, name: &str) -> Result<Option<ExploitAdvice>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT e.advice_text, e.risk_score, e.created_at \
                 FROM exploit_advice e JOIN assets a ON a.id = e.asset_id WHERE a.name = ?1",
                [name],
                |row| {
                    Ok(ExploitAdvice {
                        asset: name.to_string(),
                        advice_text: row.get(0)?,
                        risk_score: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

fn ensure_asset(conn: &Connection, name: &str) -> rusqlite::Result<AssetId> {
    conn.execute(
        "INSERT INTO assets (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
        [name],
    )?;
    conn.query_row("SELECT id FROM assets WHERE name = ?1", [name], |row| row.get(0))
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    fn vuln(template: &str, severity: Severity) -> VulnerabilityFinding {
        VulnerabilityFinding {
            template_id: template.into(),
            severity,
            matcher: String::new(),
            matched_at: "https://a.example.com".into(),
            kind: "http".into(),
        }
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let store = AssetStore::open_in_memory().unwrap();
        let a = store.get_or_create("a.example.com").unwrap();
        let b = store.get_or_create("b.example.com").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.get_or_create("a.example.com").unwrap(), a);
        assert_eq!(store.asset_names().unwrap().len(), 2);
    }

    #[test]
    fn classification_upsert_replaces_and_sets_purpose() {
        let store = AssetStore::open_in_memory().unwrap();
        let first = ClassificationUpdate {
            backend: "nginx".into(),
            purpose: Some(Purpose::AdminPortal),
            ..Default::default()
        };
        store.upsert_classification("admin.example.com", &first).unwrap();

        let second = ClassificationUpdate {
            backend: "express".into(),
            purpose: None,
            vulnerabilities_summary: "xss".into(),
            exploration_summary: String::new(),
        };
        store.upsert_classification("admin.example.com", &second).unwrap();

        let rec = store.classification("admin.example.com").unwrap().unwrap();
        assert_eq!(rec.backend, "express");
        assert_eq!(rec.vulnerabilities_summary, "xss");
        assert_eq!(rec.purpose, None);
        // an empty purpose leaves the asset's purpose alone
        let asset = store.asset("admin.example.com").unwrap().unwrap();
        assert_eq!(asset.purpose, Some(Purpose::AdminPortal));
    }

    #[test]
    fn advice_upsert_keeps_one_row_and_clamps() {
        let store = AssetStore::open_in_memory().unwrap();
        store.upsert_advice("x.example.com", "first", 4.0).unwrap();
        store.upsert_advice("x.example.com", "second", 42.0).unwrap();
        let adv = store.advice("x.example.com").unwrap().unwrap();
        assert_eq!(adv.advice_text, "second");
        assert_eq!(adv.risk_score, 10.0);
        assert_eq!(store.export_joined_view().unwrap().len(), 1);
    }

    #[test]
    fn findings_are_appended_not_deduplicated() {
        let store = AssetStore::open_in_memory().unwrap();
        let ports = [PortFinding::open_tcp(443)];
        store.append_port_findings("a.example.com", &ports).unwrap();
        store.append_port_findings("a.example.com", &ports).unwrap();
        assert_eq!(store.port_findings("a.example.com").unwrap().len(), 2);

        // duplicates collapse in the export summary
        let view = store.export_joined_view().unwrap();
        assert_eq!(view[0].ports, "443//open");
    }

    #[test]
    fn export_includes_assets_without_findings() {
        let store = AssetStore::open_in_memory().unwrap();
        store.get_or_create("bare.example.com").unwrap();
        store
            .append_vulnerability_findings(
                "vuln.example.com",
                &[vuln("tech-detect", Severity::Info), vuln("cve-2021-1", Severity::High)],
            )
            .unwrap();
        store.upsert_advice("vuln.example.com", "patch it", 6.5).unwrap();

        let view = store.export_joined_view().unwrap();
        assert_eq!(view.len(), 2);
        let bare = &view[0];
        assert_eq!(bare.subdomain, "bare.example.com");
        assert!(bare.ports.is_empty() && bare.vulnerabilities.is_empty());
        assert_eq!(bare.risk_score, None);

        let vulnerable = &view[1];
        assert!(vulnerable.vulnerabilities.contains("tech-detect (info)"));
        assert!(vulnerable.vulnerabilities.contains("cve-2021-1 (high)"));
        assert_eq!(vulnerable.risk_score, Some(6.5));
        assert_eq!(vulnerable.advice, "patch it");
    }

    #[test]
    fn context_of_unknown_asset_is_empty() {
        let store = AssetStore::open_in_memory().unwrap();
        let ctx = store.asset_context("ghost.example.com").unwrap();
        assert!(ctx.ports.is_empty() && ctx.vulnerabilities.is_empty());
        assert!(store.asset("ghost.example.com").unwrap().is_none());
    }

    #[test]
    fn legacy_store_gains_purpose_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE assets (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE);
                 INSERT INTO assets (name) VALUES ('old.example.com');",
            )
            .unwrap();
        }
        let store = AssetStore::open(&path).unwrap();
        store
            .upsert_classification(
                "old.example.com",
                &ClassificationUpdate {
                    purpose: Some(Purpose::Storage),
                    ..Default::default()
                },
            )
            .unwrap();
        let asset = store.asset("old.example.com").unwrap().unwrap();
        assert_eq!(asset.purpose, Some(Purpose::Storage));

        // reopening does not fail on the existing column
        drop(store);
        AssetStore::open(&path).unwrap();
    }
}
