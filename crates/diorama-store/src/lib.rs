//! SQLite-based persistence for scene configs, scene instances, and state snapshots

mod default_scene;

pub use default_scene::{default_scene_config, DEFAULT_CONFIG_ID};

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::warn;

use diorama_schema::{unix_now, SceneConfig, SceneConfigStatus, SceneState};

/// SQLite store for scene persistence
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        // Run migrations synchronously before wrapping in async mutex
        run_migrations(&conn)?;
        ensure_default_config(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scene Configs
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a config and return its assigned id. On read the row columns
    /// (id, status, votes, proposer) override whatever the stored JSON says.
    pub async fn save_config(&self, config: &SceneConfig) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO scene_configs (config, status, votes, proposer_name, proposed_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                serde_json::to_string(config)?,
                config.status.as_str(),
                config.votes,
                config.proposer_name,
                config.proposed_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Load a config by id
    pub async fn get_config(&self, id: i64) -> Result<Option<SceneConfig>> {
        let conn = self.conn.lock().await;
        get_config_with(&conn, id)
    }

    /// The proposed config with the most votes, earliest submission winning ties
    pub async fn highest_voted_proposed(&self) -> Result<Option<SceneConfig>> {
        let conn = self.conn.lock().await;
        highest_voted_with(&conn)
    }

    /// Add one vote to a proposed config, returning the new tally. Voting
    /// on an unknown or non-proposed config is a no-op returning None.
    pub async fn vote_config(&self, id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE scene_configs SET votes = votes + 1 WHERE id = ?1 AND status = 'proposed'",
            [id],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        let votes = conn
            .prepare("SELECT votes FROM scene_configs WHERE id = ?1")?
            .query_row([id], |row| row.get::<_, i64>(0))?;
        Ok(Some(votes))
    }

    /// Mark a config as the one currently running
    pub async fn activate_config(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE scene_configs SET status = 'active' WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    /// Built-in fallback config, seeded on first open and re-created if its
    /// row ever goes missing
    pub async fn default_config(&self) -> Result<SceneConfig> {
        let conn = self.conn.lock().await;
        ensure_default_config(&conn)
    }

    /// Resolve the config the next scene should run: the winning proposal if
    /// one exists (marking it active), otherwise the default.
    pub async fn next_scene_config(&self) -> Result<SceneConfig> {
        let conn = self.conn.lock().await;
        match highest_voted_with(&conn)? {
            Some(mut config) => {
                conn.execute(
                    "UPDATE scene_configs SET status = 'active' WHERE id = ?1",
                    [config.id],
                )?;
                config.status = SceneConfigStatus::Active;
                Ok(config)
            }
            None => ensure_default_config(&conn),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scenes & Snapshots
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a new scene instance running the given config, returning its id
    pub async fn create_scene(&self, config_id: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute("INSERT INTO scenes (config_id) VALUES (?1)", [config_id])?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a timestamped copy of the full conversation state
    pub async fn save_snapshot(&self, state: &SceneState) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO snapshots (scene_id, config_id, state, timestamp)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![
                state.scene_id,
                state.scene_config_id,
                serde_json::to_string(state)?,
                unix_now(),
            ],
        )?;
        Ok(())
    }

    /// The most recent snapshot together with the config it ran under
    pub async fn load_latest(&self) -> Result<Option<(SceneConfig, SceneState)>> {
        let conn = self.conn.lock().await;
        let latest = conn
            .prepare(
                r#"SELECT config_id, state FROM snapshots
                   ORDER BY timestamp DESC, id DESC
                   LIMIT 1"#,
            )?
            .query_row([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .optional()?;

        let Some((config_id, state_json)) = latest else {
            return Ok(None);
        };
        let state: SceneState = serde_json::from_str(&state_json)?;
        match get_config_with(&conn, config_id)? {
            Some(config) => Ok(Some((config, state))),
            None => {
                warn!(config_id, "latest snapshot references a missing config");
                Ok(None)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Migrations
// ─────────────────────────────────────────────────────────────────────────────

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"CREATE TABLE IF NOT EXISTS __scene_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"#,
    )?;

    let applied: std::collections::HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT version FROM __scene_schema_version")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let migrations: Vec<(i64, &str)> = vec![(
        1,
        r#"
        CREATE TABLE IF NOT EXISTS scene_configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            config TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'proposed',
            votes INTEGER NOT NULL DEFAULT 0,
            proposer_name TEXT,
            proposed_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS scenes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            config_id INTEGER NOT NULL REFERENCES scene_configs(id),
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scene_id INTEGER NOT NULL,
            config_id INTEGER NOT NULL,
            state TEXT NOT NULL,
            timestamp REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON snapshots(timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_scene_configs_status ON scene_configs(status, votes DESC);
        "#,
    )];

    for (version, sql) in migrations {
        if applied.contains(&version) {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO __scene_schema_version(version) VALUES (?1)",
            [version],
        )?;
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn ensure_default_config(conn: &Connection) -> Result<SceneConfig> {
    if let Some(existing) = get_config_with(conn, DEFAULT_CONFIG_ID)? {
        return Ok(existing);
    }
    // Seeded with an explicit id so later proposals can never claim it.
    let config = default_scene_config();
    conn.execute(
        r#"INSERT INTO scene_configs (id, config, status, votes)
           VALUES (?1, ?2, 'active', 0)"#,
        params![DEFAULT_CONFIG_ID, serde_json::to_string(&config)?],
    )?;
    Ok(config)
}

fn get_config_with(conn: &Connection, id: i64) -> Result<Option<SceneConfig>> {
    let config = conn
        .prepare(
            r#"SELECT id, config, status, votes, proposer_name, proposed_at
               FROM scene_configs
               WHERE id = ?1"#,
        )?
        .query_row([id], row_to_config)
        .optional()?;
    Ok(config)
}

fn highest_voted_with(conn: &Connection) -> Result<Option<SceneConfig>> {
    let config = conn
        .prepare(
            r#"SELECT id, config, status, votes, proposer_name, proposed_at
               FROM scene_configs
               WHERE status = 'proposed'
               ORDER BY votes DESC, id ASC
               LIMIT 1"#,
        )?
        .query_row([], row_to_config)
        .optional()?;
    Ok(config)
}

fn row_to_config(row: &rusqlite::Row) -> rusqlite::Result<SceneConfig> {
    let json: String = row.get(1)?;
    let mut config: SceneConfig = serde_json::from_str(&json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    config.id = row.get(0)?;
    config.status = row
        .get::<_, String>(2)?
        .parse()
        .unwrap_or(SceneConfigStatus::Proposed);
    config.votes = row.get(3)?;
    config.proposer_name = row.get(4)?;
    config.proposed_at = row.get(5)?;
    Ok(config)
}
