use rusqlite::Connection;

use crate::error::StoreError;

const SCHEMA_SQL: &str = r#"
-- One row per host name ever referenced in this session
CREATE TABLE IF NOT EXISTS assets (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    name    TEXT NOT NULL UNIQUE,
    purpose TEXT
);

-- Append-only; repeated scans add rows
CREATE TABLE IF NOT EXISTS port_findings (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
    port     INTEGER NOT NULL,
    protocol TEXT NOT NULL DEFAULT '',
    service  TEXT NOT NULL DEFAULT '',
    version  TEXT NOT NULL DEFAULT '',
    state    TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_port_asset ON port_findings(asset_id);

CREATE TABLE IF NOT EXISTS vulnerability_findings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id    INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
    template_id TEXT NOT NULL,
    severity    TEXT NOT NULL DEFAULT 'unknown',
    matcher     TEXT NOT NULL DEFAULT '',
    matched_at  TEXT NOT NULL DEFAULT '',
    kind        TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_vuln_asset ON vulnerability_findings(asset_id);

-- At most one current record per asset
CREATE TABLE IF NOT EXISTS classifications (
    asset_id                INTEGER PRIMARY KEY REFERENCES assets(id) ON DELETE CASCADE,
    backend                 TEXT NOT NULL DEFAULT '',
    purpose                 TEXT,
    vulnerabilities_summary TEXT NOT NULL DEFAULT '',
    exploration_summary     TEXT NOT NULL DEFAULT '',
    created_at              TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS exploit_advice (
    asset_id    INTEGER PRIMARY KEY REFERENCES assets(id) ON DELETE CASCADE,
    advice_text TEXT NOT NULL,
    risk_score  REAL NOT NULL CHECK (risk_score >= 0 AND risk_score <= 10),
    created_at  TEXT NOT NULL
);
"#;

pub fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA_SQL)?;

    // Stores created before classification existed lack assets.purpose.
    for stmt in &["ALTER TABLE assets ADD COLUMN purpose TEXT"] {
        if let Err(e) = conn.execute(stmt, []) {
            if !e.to_string().contains("duplicate column name") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}
