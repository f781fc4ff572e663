use sqlx::SqlitePool;

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    // Resolve the file path and ensure the parent directory exists.
    // Handles both "sqlite:./foo.db" and "sqlite:../foo.db" forms.
    let file_path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

    let abs_path = std::env::current_dir()?.join(file_path);
    if let Some(parent) = abs_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let pool = sqlx::SqlitePool::connect_with(
        sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&abs_path)
            .create_if_missing(true),
    )
    .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Create the warden tables if they do not exist.
///
/// Ownership is split: `sessions` and `health_records` belong to the
/// session repositories, `safety_actions` and `resource_streaks` to the
/// safety gate. Same pool, disjoint tables.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sessions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            tier        INTEGER NOT NULL,
            model       TEXT    NOT NULL,
            prompt_path TEXT    NOT NULL,
            status      TEXT    NOT NULL,
            started_at  TEXT    NOT NULL,
            ended_at    TEXT,
            exit_code   INTEGER,
            log_path    TEXT    NOT NULL,
            parent_id   INTEGER,
            response    TEXT,
            cost_usd    REAL,
            turns       INTEGER,
            duration_ms INTEGER
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS health_records (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  INTEGER NOT NULL,
            service     TEXT    NOT NULL,
            status      TEXT    NOT NULL,
            latency_ms  INTEGER,
            error       TEXT,
            observed_at TEXT    NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS safety_actions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            resource    TEXT    NOT NULL,
            kind        TEXT    NOT NULL,
            executed_at TEXT    NOT NULL,
            success     INTEGER NOT NULL,
            error       TEXT,
            session_id  INTEGER
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS safety_actions_window
         ON safety_actions (resource, kind, executed_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS resource_streaks (
            resource      TEXT PRIMARY KEY,
            healthy_count INTEGER NOT NULL DEFAULT 0,
            updated_at    TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}
