//! SQL migration definitions for the overview database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: entities, datasources, capability_flags, snapshot_history",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Enriched reference entities, one row per input entity
CREATE TABLE IF NOT EXISTS entities (
    row_key                 TEXT PRIMARY KEY,
    position                INTEGER NOT NULL,
    identifier              TEXT,
    name                    TEXT NOT NULL,
    kind                    TEXT,
    registry_id             TEXT,
    parent_ids              TEXT NOT NULL DEFAULT '[]',
    funding_projects        INTEGER,
    data_sources            INTEGER,
    total_research_products INTEGER,
    publications            INTEGER,
    research_data           INTEGER,
    research_software       INTEGER,
    other_research_products INTEGER,
    has_metrics             INTEGER NOT NULL DEFAULT 0,
    status                  TEXT NOT NULL,
    added_identifier        INTEGER NOT NULL DEFAULT 0,
    error                   TEXT,
    enriched_at             TEXT NOT NULL
);

-- Datasources harvested per organisation
CREATE TABLE IF NOT EXISTS datasources (
    id              TEXT PRIMARY KEY,
    organization_id TEXT,
    name            TEXT,
    kind            TEXT,
    website_url     TEXT,
    oai_endpoint    TEXT,
    compatibility   TEXT,
    last_indexed    TEXT,
    validated_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_datasources_org ON datasources(organization_id);

-- Latest probe result per entity
CREATE TABLE IF NOT EXISTS capability_flags (
    entity_id                   TEXT PRIMARY KEY,
    run_id                      TEXT NOT NULL,
    status                      TEXT NOT NULL,
    error                       TEXT,
    formats_detected            TEXT,
    supports_nl_didl            INTEGER NOT NULL DEFAULT 0,
    supports_oai_dc             INTEGER NOT NULL DEFAULT 0,
    supports_oai_openaire       INTEGER NOT NULL DEFAULT 0,
    supports_rioxx              INTEGER NOT NULL DEFAULT 0,
    supports_oai_cerif_openaire INTEGER NOT NULL DEFAULT 0,
    supports_openaire_data      INTEGER NOT NULL DEFAULT 0,
    tested_at                   TEXT NOT NULL
);

-- Dated metric snapshots; (entity_id, snapshot_date) uniqueness is checked on append
CREATE TABLE IF NOT EXISTS snapshot_history (
    entity_id               TEXT NOT NULL,
    name                    TEXT,
    total_research_products INTEGER,
    publications            INTEGER,
    research_data           INTEGER,
    research_software       INTEGER,
    other_research_products INTEGER,
    snapshot_date           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshot_date ON snapshot_history(snapshot_date);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
