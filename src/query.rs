//! Typed filters for the product index, and the search request surface.
//!
//! A `ProductIndexQuery` expresses every condition the index can evaluate
//! in SQL. Longitude ranges are stored normalized; a range whose minimum
//! exceeds its maximum crosses the antimeridian and is evaluated as a
//! wrapped (OR of two half-ranges) condition.

use chrono::{DateTime, Utc};

use crate::models::{Event, EventSummary, Product, ProductId, ProductStatus, ProductSummary};

/// Which product versions a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultType {
    /// Every stored version.
    All,
    /// Only the most recent version of each thread.
    #[default]
    Current,
    /// Only versions superseded by a newer one.
    Superseded,
}

/// Whether matches must be associated to an event, unassociated, or either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssociationScope {
    #[default]
    Any,
    Associated,
    Unassociated,
}

#[derive(Debug, Clone, Default)]
pub struct ProductIndexQuery {
    pub event_source: Option<String>,
    pub event_source_code: Option<String>,
    pub min_event_time: Option<DateTime<Utc>>,
    pub max_event_time: Option<DateTime<Utc>>,
    pub min_event_latitude: Option<f64>,
    pub max_event_latitude: Option<f64>,
    /// Normalized to [-180, 180); min > max means the range wraps.
    pub min_event_longitude: Option<f64>,
    pub max_event_longitude: Option<f64>,
    pub min_event_depth: Option<f64>,
    pub max_event_depth: Option<f64>,
    pub min_event_magnitude: Option<f64>,
    pub max_event_magnitude: Option<f64>,
    pub product_source: Option<String>,
    pub product_type: Option<String>,
    pub product_code: Option<String>,
    pub product_version: Option<String>,
    pub product_status: Option<ProductStatus>,
    pub product_ids: Vec<ProductId>,
    pub min_product_update_time: Option<DateTime<Utc>>,
    pub max_product_update_time: Option<DateTime<Utc>>,
    pub result_type: ResultType,
    pub association_scope: AssociationScope,
}

impl ProductIndexQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a longitude range, normalizing both bounds.
    pub fn set_longitude_range(&mut self, min: f64, max: f64) {
        self.min_event_longitude = Some(normalize_longitude(min));
        self.max_event_longitude = Some(normalize_longitude(max));
    }

    /// A normalized range whose minimum exceeds its maximum wraps.
    pub fn longitude_range_wraps(&self) -> bool {
        match (self.min_event_longitude, self.max_event_longitude) {
            (Some(min), Some(max)) => min > max,
            _ => false,
        }
    }

    /// Evaluate the event-attribute portion of this query against a summary
    /// in memory. Used when deciding association against events already
    /// loaded, mirroring what the SQL renders.
    pub fn contains_location(&self, summary: &ProductSummary) -> bool {
        if let Some(min) = self.min_event_time {
            if !summary.event_time.is_some_and(|t| t >= min) {
                return false;
            }
        }
        if let Some(max) = self.max_event_time {
            if !summary.event_time.is_some_and(|t| t <= max) {
                return false;
            }
        }
        if let Some(min) = self.min_event_latitude {
            if !summary.event_latitude.is_some_and(|lat| lat >= min) {
                return false;
            }
        }
        if let Some(max) = self.max_event_latitude {
            if !summary.event_latitude.is_some_and(|lat| lat <= max) {
                return false;
            }
        }
        if self.min_event_longitude.is_some() || self.max_event_longitude.is_some() {
            let lon = match summary.event_longitude {
                Some(lon) => normalize_longitude(lon),
                None => return false,
            };
            match (self.min_event_longitude, self.max_event_longitude) {
                (Some(min), Some(max)) if min > max => {
                    if lon < min && lon > max {
                        return false;
                    }
                }
                (min, max) => {
                    if min.is_some_and(|m| lon < m) || max.is_some_and(|m| lon > m) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Map a longitude into [-180, 180).
pub fn normalize_longitude(lon: f64) -> f64 {
    let mut lon = lon % 360.0;
    if lon < -180.0 {
        lon += 360.0;
    } else if lon >= 180.0 {
        lon -= 360.0;
    }
    lon
}

/// One typed query within a search request.
#[derive(Debug, Clone)]
pub enum SearchQuery {
    /// Event summaries matching the query.
    EventsSummary(ProductIndexQuery),
    /// Full events, including member product summaries.
    EventDetail(ProductIndexQuery),
    /// Product summaries matching the query.
    ProductsSummary(ProductIndexQuery),
    /// Full products with payloads resolved through product storage.
    ProductDetail(ProductIndexQuery),
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub queries: Vec<SearchQuery>,
}

/// Per-query results, in request order.
#[derive(Debug)]
pub enum SearchResult {
    EventsSummary(Vec<EventSummary>),
    EventDetail(Vec<Event>),
    ProductsSummary(Vec<ProductSummary>),
    ProductDetail(Vec<Product>),
}

#[derive(Debug, Default)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
}
