//! Version-tracked database migrations for the libSQL backend.
//!
//! Versions are applied in order and recorded in `_migrations`; only versions
//! above the recorded maximum run.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                external_user_id TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL DEFAULT '',
                language TEXT NOT NULL DEFAULT 'en',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trips (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL REFERENCES users(id),
                driver_id TEXT,
                from_name TEXT NOT NULL,
                to_name TEXT NOT NULL,
                from_lon REAL,
                from_lat REAL,
                to_lon REAL,
                to_lat REAL,
                reserved_at TEXT NOT NULL,
                accepted_at TEXT,
                picked_up_at TEXT,
                dropped_off_at TEXT,
                cancelled_at TEXT,
                polyline TEXT NOT NULL DEFAULT '',
                num_passengers INTEGER NOT NULL DEFAULT 1,
                note TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trips_user ON trips(user_id);
            CREATE INDEX IF NOT EXISTS idx_trips_updated ON trips(updated_at);
        "#,
    },
    Migration {
        version: 2,
        name: "locations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                name_th TEXT,
                name_ja TEXT,
                lon REAL NOT NULL,
                lat REAL NOT NULL,
                popularity INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_locations_popularity ON locations(popularity);

            INSERT OR IGNORE INTO locations (name, name_th, name_ja, lon, lat, popularity) VALUES
                ('BTS Phromphong', 'บีทีเอส พร้อมพงษ์', 'BTSプロンポン駅', 100.5697, 13.7305, 30),
                ('Condo A', NULL, NULL, 100.5745, 13.7332, 20),
                ('Citi Resort', 'ซิตี้ รีสอร์ท', 'シティリゾート', 100.5718, 13.7360, 10);
        "#,
    },
    Migration {
        version: 3,
        name: "trip_feedback",
        sql: r#"
            ALTER TABLE trips ADD COLUMN user_feedback INTEGER;
        "#,
    },
];

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Bring the schema up to the newest version.
///
/// Each pending migration runs in its own transaction together with its
/// `_migrations` row, so a failed step leaves no partial schema behind.
/// Returns how many migrations were applied.
pub async fn run_migrations(conn: &Connection) -> Result<usize, DatabaseError> {
    conn.execute(TRACKING_TABLE, ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();

    for migration in &pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        apply(conn, migration).await?;
    }

    tracing::debug!(from = applied, applied = pending.len(), "Schema up to date");
    Ok(pending.len())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let failed = |e: libsql::Error| {
        DatabaseError::Migration(format!(
            "V{} ({}) failed: {e}",
            migration.version, migration.name
        ))
    };

    // Dropping the transaction without commit rolls it back.
    let tx = conn.transaction().await.map_err(failed)?;
    tx.execute_batch(migration.sql).await.map_err(failed)?;
    tx.execute(
        "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(failed)?;
    tx.commit().await.map_err(failed)
}

/// Highest recorded version, 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Migration(format!("read _migrations: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}
