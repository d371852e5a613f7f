//! sqlx-backed product index.
//!
//! Two tables: `events` (surrogate id plus denormalized summary columns,
//! refreshed by [`ProductIndex::events_updated`]) and `products` (one row
//! per product version, `event_id` NULL while unassociated). Methods take a
//! `&mut SqliteConnection` so the engine can compose them inside one
//! transaction; `Transaction` derefs to a connection.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{Sqlite, SqliteConnection, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool, Transaction};

use crate::models::{Event, EventSummary, ProductId, ProductStatus, ProductSummary};
use crate::query::{AssociationScope, ProductIndexQuery, ResultType};

#[derive(Clone)]
pub struct ProductIndex {
    pool: SqlitePool,
}

impl ProductIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Insert a new event row and return its surrogate id.
    pub async fn add_event(
        &self,
        conn: &mut SqliteConnection,
        summary: &EventSummary,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (source, source_code, event_time, latitude, longitude, depth, magnitude, deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&summary.source)
        .bind(&summary.source_code)
        .bind(summary.time.map(|t| t.timestamp_millis()))
        .bind(summary.latitude)
        .bind(summary.longitude)
        .bind(summary.depth)
        .bind(summary.magnitude)
        .bind(summary.deleted as i64)
        .execute(conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Delete an event row. Member products must be disassociated or
    /// removed first.
    pub async fn remove_event(&self, conn: &mut SqliteConnection, event_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(event_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Insert a product summary row, returning its surrogate id.
    pub async fn add_product_summary(
        &self,
        conn: &mut SqliteConnection,
        summary: &ProductSummary,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO products (
                source, type, code, update_time, status, tracker_url, version,
                event_source, event_source_code, event_time,
                latitude, longitude, depth, magnitude,
                preferred_weight, properties, links
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&summary.id.source)
        .bind(&summary.id.product_type)
        .bind(&summary.id.code)
        .bind(summary.id.update_time.timestamp_millis())
        .bind(summary.status.as_str())
        .bind(&summary.tracker_url)
        .bind(&summary.version)
        .bind(&summary.event_source)
        .bind(&summary.event_source_code)
        .bind(summary.event_time.map(|t| t.timestamp_millis()))
        .bind(summary.event_latitude)
        .bind(summary.event_longitude)
        .bind(summary.event_depth)
        .bind(summary.event_magnitude)
        .bind(summary.preferred_weight)
        .bind(serde_json::to_string(&summary.properties)?)
        .bind(serde_json::to_string(&summary.links)?)
        .execute(conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Delete one product version.
    pub async fn remove_product_summary(
        &self,
        conn: &mut SqliteConnection,
        id: &ProductId,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM products WHERE source = ? AND type = ? AND code = ? AND update_time = ?",
        )
        .bind(&id.source)
        .bind(&id.product_type)
        .bind(&id.code)
        .bind(id.update_time.timestamp_millis())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Associate every version of a product thread with an event.
    pub async fn add_association(
        &self,
        conn: &mut SqliteConnection,
        event_id: i64,
        id: &ProductId,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE products SET event_id = ? WHERE source = ? AND type = ? AND code = ?",
        )
        .bind(event_id)
        .bind(&id.source)
        .bind(&id.product_type)
        .bind(&id.code)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Disassociate exactly one product version. Other versions of the
    /// thread keep their association.
    pub async fn remove_association(
        &self,
        conn: &mut SqliteConnection,
        id: &ProductId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE products SET event_id = NULL
            WHERE source = ? AND type = ? AND code = ? AND update_time = ?
            "#,
        )
        .bind(&id.source)
        .bind(&id.product_type)
        .bind(&id.code)
        .bind(id.update_time.timestamp_millis())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Set the stored preferred weight of one product version.
    pub async fn set_preferred_weight(
        &self,
        conn: &mut SqliteConnection,
        id: &ProductId,
        weight: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE products SET preferred_weight = ?
            WHERE source = ? AND type = ? AND code = ? AND update_time = ?
            "#,
        )
        .bind(weight)
        .bind(&id.source)
        .bind(&id.product_type)
        .bind(&id.code)
        .bind(id.update_time.timestamp_millis())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Refresh the denormalized summary columns of the given events.
    pub async fn events_updated(
        &self,
        conn: &mut SqliteConnection,
        events: &[Event],
    ) -> Result<()> {
        for event in events {
            let Some(event_id) = event.index_id else {
                continue;
            };
            let summary = event.summary();
            sqlx::query(
                r#"
                UPDATE events
                SET source = ?, source_code = ?, event_time = ?,
                    latitude = ?, longitude = ?, depth = ?, magnitude = ?, deleted = ?
                WHERE id = ?
                "#,
            )
            .bind(&summary.source)
            .bind(&summary.source_code)
            .bind(summary.time.map(|t| t.timestamp_millis()))
            .bind(summary.latitude)
            .bind(summary.longitude)
            .bind(summary.depth)
            .bind(summary.magnitude)
            .bind(summary.deleted as i64)
            .bind(event_id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Load one event with every member product version.
    pub async fn get_event(
        &self,
        conn: &mut SqliteConnection,
        event_id: i64,
    ) -> Result<Option<Event>> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM events WHERE id = ?")
            .bind(event_id)
            .fetch_one(&mut *conn)
            .await?;
        if !exists {
            return Ok(None);
        }

        let rows = sqlx::query(&format!(
            "{} WHERE event_id = ? ORDER BY update_time DESC, id",
            SELECT_PRODUCT
        ))
        .bind(event_id)
        .fetch_all(conn)
        .await?;

        let mut event = Event::new(Some(event_id));
        for row in &rows {
            event.add_product(summary_from_row(row)?);
        }
        Ok(Some(event))
    }

    /// Events whose member products match the query.
    pub async fn get_events(
        &self,
        conn: &mut SqliteConnection,
        query: &ProductIndexQuery,
    ) -> Result<Vec<Event>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT DISTINCT event_id FROM products WHERE event_id IS NOT NULL");
        apply_filters(&mut builder, query);
        builder.push(" ORDER BY event_id");
        let ids: Vec<i64> = builder
            .build_query_scalar()
            .fetch_all(&mut *conn)
            .await?;

        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(event) = self.get_event(conn, id).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Product summaries matching the query.
    pub async fn get_products(
        &self,
        conn: &mut SqliteConnection,
        query: &ProductIndexQuery,
    ) -> Result<Vec<ProductSummary>> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_PRODUCT);
        builder.push(" WHERE 1 = 1");
        apply_filters(&mut builder, query);
        builder.push(" ORDER BY update_time DESC, id");
        let rows = builder.build().fetch_all(conn).await?;
        rows.iter().map(summary_from_row).collect()
    }

    /// Product summaries matching the query that have no event.
    pub async fn get_unassociated_products(
        &self,
        conn: &mut SqliteConnection,
        query: &ProductIndexQuery,
    ) -> Result<Vec<ProductSummary>> {
        let mut query = query.clone();
        query.association_scope = AssociationScope::Unassociated;
        self.get_products(conn, &query).await
    }

    /// All stored versions of one thread, newest first.
    pub async fn get_product_versions(
        &self,
        conn: &mut SqliteConnection,
        id: &ProductId,
    ) -> Result<Vec<ProductSummary>> {
        let rows = sqlx::query(&format!(
            "{} WHERE source = ? AND type = ? AND code = ? ORDER BY update_time DESC",
            SELECT_PRODUCT
        ))
        .bind(&id.source)
        .bind(&id.product_type)
        .bind(&id.code)
        .fetch_all(conn)
        .await?;
        rows.iter().map(summary_from_row).collect()
    }

    /// The event id a thread is associated with, if any version is.
    pub async fn get_thread_event_id(
        &self,
        conn: &mut SqliteConnection,
        id: &ProductId,
    ) -> Result<Option<i64>> {
        let event_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT event_id FROM products
            WHERE source = ? AND type = ? AND code = ? AND event_id IS NOT NULL
            ORDER BY update_time DESC LIMIT 1
            "#,
        )
        .bind(&id.source)
        .bind(&id.product_type)
        .bind(&id.code)
        .fetch_optional(conn)
        .await?;
        Ok(event_id)
    }

    /// Whether this exact product version is already indexed.
    pub async fn has_product(&self, conn: &mut SqliteConnection, id: &ProductId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM products WHERE source = ? AND type = ? AND code = ? AND update_time = ?",
        )
        .bind(&id.source)
        .bind(&id.product_type)
        .bind(&id.code)
        .bind(id.update_time.timestamp_millis())
        .fetch_one(conn)
        .await?;
        Ok(count > 0)
    }
}

const SELECT_PRODUCT: &str = r#"
SELECT id, event_id, source, type, code, update_time, status, tracker_url, version,
       event_source, event_source_code, event_time,
       latitude, longitude, depth, magnitude,
       preferred_weight, properties, links
FROM products
"#;

/// Correlated subquery selecting each thread's newest version.
const THREAD_MAX_UPDATE_TIME: &str = r#"(
    SELECT MAX(p2.update_time) FROM products p2
    WHERE p2.source = products.source AND p2.type = products.type AND p2.code = products.code
)"#;

fn apply_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &ProductIndexQuery) {
    if let Some(source) = &query.event_source {
        builder
            .push(" AND LOWER(event_source) = ")
            .push_bind(source.to_lowercase());
    }
    if let Some(code) = &query.event_source_code {
        builder
            .push(" AND LOWER(event_source_code) = ")
            .push_bind(code.to_lowercase());
    }
    if let Some(min) = query.min_event_time {
        builder
            .push(" AND event_time >= ")
            .push_bind(min.timestamp_millis());
    }
    if let Some(max) = query.max_event_time {
        builder
            .push(" AND event_time <= ")
            .push_bind(max.timestamp_millis());
    }
    if let Some(min) = query.min_event_latitude {
        builder.push(" AND latitude >= ").push_bind(min);
    }
    if let Some(max) = query.max_event_latitude {
        builder.push(" AND latitude <= ").push_bind(max);
    }
    match (query.min_event_longitude, query.max_event_longitude) {
        (Some(min), Some(max)) if min > max => {
            // wrapped range crossing the antimeridian
            builder
                .push(" AND (longitude >= ")
                .push_bind(min)
                .push(" OR longitude <= ")
                .push_bind(max)
                .push(")");
        }
        (min, max) => {
            if let Some(min) = min {
                builder.push(" AND longitude >= ").push_bind(min);
            }
            if let Some(max) = max {
                builder.push(" AND longitude <= ").push_bind(max);
            }
        }
    }
    if let Some(min) = query.min_event_depth {
        builder.push(" AND depth >= ").push_bind(min);
    }
    if let Some(max) = query.max_event_depth {
        builder.push(" AND depth <= ").push_bind(max);
    }
    if let Some(min) = query.min_event_magnitude {
        builder.push(" AND magnitude >= ").push_bind(min);
    }
    if let Some(max) = query.max_event_magnitude {
        builder.push(" AND magnitude <= ").push_bind(max);
    }
    if let Some(source) = &query.product_source {
        builder.push(" AND source = ").push_bind(source.clone());
    }
    if let Some(product_type) = &query.product_type {
        builder.push(" AND type = ").push_bind(product_type.clone());
    }
    if let Some(code) = &query.product_code {
        builder.push(" AND code = ").push_bind(code.clone());
    }
    if let Some(version) = &query.product_version {
        builder.push(" AND version = ").push_bind(version.clone());
    }
    if let Some(status) = query.product_status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if !query.product_ids.is_empty() {
        builder.push(" AND (");
        for (i, id) in query.product_ids.iter().enumerate() {
            if i > 0 {
                builder.push(" OR ");
            }
            builder
                .push("(source = ")
                .push_bind(id.source.clone())
                .push(" AND type = ")
                .push_bind(id.product_type.clone())
                .push(" AND code = ")
                .push_bind(id.code.clone())
                .push(" AND update_time = ")
                .push_bind(id.update_time.timestamp_millis())
                .push(")");
        }
        builder.push(")");
    }
    if let Some(min) = query.min_product_update_time {
        builder
            .push(" AND update_time >= ")
            .push_bind(min.timestamp_millis());
    }
    if let Some(max) = query.max_product_update_time {
        builder
            .push(" AND update_time <= ")
            .push_bind(max.timestamp_millis());
    }
    match query.result_type {
        ResultType::All => {}
        ResultType::Current => {
            builder.push(" AND update_time = ");
            builder.push(THREAD_MAX_UPDATE_TIME);
        }
        ResultType::Superseded => {
            builder.push(" AND update_time < ");
            builder.push(THREAD_MAX_UPDATE_TIME);
        }
    }
    match query.association_scope {
        AssociationScope::Any => {}
        AssociationScope::Associated => {
            builder.push(" AND event_id IS NOT NULL");
        }
        AssociationScope::Unassociated => {
            builder.push(" AND event_id IS NULL");
        }
    }
}

fn summary_from_row(row: &SqliteRow) -> Result<ProductSummary> {
    let status: String = row.get("status");
    let status = ProductStatus::parse(&status)
        .ok_or_else(|| anyhow::anyhow!("unknown product status: {}", status))?;
    let properties: String = row.get("properties");
    let links: String = row.get("links");
    Ok(ProductSummary {
        index_id: Some(row.get("id")),
        id: ProductId::new(
            row.get::<String, _>("source"),
            row.get::<String, _>("type"),
            row.get::<String, _>("code"),
            millis_to_time(row.get("update_time"))?,
        ),
        status,
        tracker_url: row.get("tracker_url"),
        version: row.get("version"),
        event_source: row.get("event_source"),
        event_source_code: row.get("event_source_code"),
        event_time: row
            .get::<Option<i64>, _>("event_time")
            .map(millis_to_time)
            .transpose()?,
        event_latitude: row.get("latitude"),
        event_longitude: row.get("longitude"),
        event_depth: row.get("depth"),
        event_magnitude: row.get("magnitude"),
        preferred_weight: row.get("preferred_weight"),
        properties: serde_json::from_str(&properties)?,
        links: serde_json::from_str(&links)?,
    })
}

fn millis_to_time(millis: i64) -> Result<chrono::DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {}", millis))
}
