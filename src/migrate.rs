use anyhow::Result;
use sqlx::SqlitePool;

/// Idempotent schema creation. `qdx init` and tests call this before the
/// engine starts; timestamps are stored as epoch milliseconds.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create events table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT,
            source_code TEXT,
            event_time INTEGER,
            latitude REAL,
            longitude REAL,
            depth REAL,
            magnitude REAL,
            deleted INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create products table; event_id NULL means unassociated
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id INTEGER,
            source TEXT NOT NULL,
            type TEXT NOT NULL,
            code TEXT NOT NULL,
            update_time INTEGER NOT NULL,
            status TEXT NOT NULL,
            tracker_url TEXT,
            version TEXT,
            event_source TEXT,
            event_source_code TEXT,
            event_time INTEGER,
            latitude REAL,
            longitude REAL,
            depth REAL,
            magnitude REAL,
            preferred_weight INTEGER NOT NULL DEFAULT 1,
            properties TEXT NOT NULL DEFAULT '{}',
            links TEXT NOT NULL DEFAULT '{}',
            UNIQUE(source, type, code, update_time),
            FOREIGN KEY (event_id) REFERENCES events(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_event_id ON products(event_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_products_event_code ON products(event_source, event_source_code)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_event_time ON products(event_time)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_update_time ON products(update_time DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_time ON events(event_time)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_code ON events(source, source_code)")
        .execute(pool)
        .await?;

    Ok(())
}
