//! Core data models for the product index.
//!
//! A `Product` is one versioned, authored record. All versions sharing
//! (source, type, code) form a thread; the newest update time is current.
//! An `Event` is a cluster of threads believed to describe one physical
//! occurrence, summarized into an `EventSummary` after every mutation.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Product type that defines event location, time, and magnitude.
pub const ORIGIN_PRODUCT_TYPE: &str = "origin";
/// Administrative product type that forces two events to merge.
pub const ASSOCIATE_PRODUCT_TYPE: &str = "associate";
/// Administrative product type that severs a link between two events.
pub const DISASSOCIATE_PRODUCT_TYPE: &str = "disassociate";
/// Version-specific preferred weight override product type.
pub const TRUMP_PRODUCT_TYPE: &str = "trump";
/// Prefix for persistent trump product types ("trump-origin", ...).
pub const PERSISTENT_TRUMP_PREFIX: &str = "trump-";

/// Property naming the other event's source on associate/disassociate products.
pub const OTHER_EVENT_SOURCE_PROPERTY: &str = "othereventsource";
/// Property naming the other event's code on associate/disassociate products.
pub const OTHER_EVENT_SOURCE_CODE_PROPERTY: &str = "othereventsourcecode";
/// Property naming the source of the product receiving persistent trump.
pub const TRUMP_SOURCE_PROPERTY: &str = "trump-source";
/// Property naming the code of the product receiving persistent trump.
pub const TRUMP_CODE_PROPERTY: &str = "trump-code";

/// Preferred weight assigned by a standing trump; outranks all derived weights.
pub const TRUMP_PREFERRED_WEIGHT: i64 = 100_000_000;

/// Globally unique product version identifier.
///
/// (source, type, code) identifies a logical product thread; a newer
/// `update_time` supersedes older versions of the same thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductId {
    pub source: String,
    pub product_type: String,
    pub code: String,
    pub update_time: DateTime<Utc>,
}

impl ProductId {
    pub fn new(
        source: impl Into<String>,
        product_type: impl Into<String>,
        code: impl Into<String>,
        update_time: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            product_type: product_type.into(),
            code: code.into(),
            update_time,
        }
    }

    /// Key identifying the logical thread, ignoring version.
    pub fn thread_key(&self) -> String {
        format!("{}:{}:{}", self.source, self.product_type, self.code)
    }

    /// Whether two ids name versions of the same thread.
    pub fn is_same_thread(&self, other: &ProductId) -> bool {
        self.source == other.source
            && self.product_type == other.product_type
            && self.code == other.code
    }

    /// Parse a `urn:quakedex:product:source:type:code:millis` reference.
    pub fn parse(urn: &str) -> Option<ProductId> {
        let mut parts = urn.strip_prefix("urn:quakedex:product:")?.splitn(4, ':');
        let source = parts.next()?;
        let product_type = parts.next()?;
        let code = parts.next()?;
        let millis: i64 = parts.next()?.parse().ok()?;
        let update_time = Utc.timestamp_millis_opt(millis).single()?;
        Some(ProductId::new(source, product_type, code, update_time))
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "urn:quakedex:product:{}:{}:{}:{}",
            self.source,
            self.product_type,
            self.code,
            self.update_time.timestamp_millis()
        )
    }
}

/// Status of one product version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductStatus {
    Update,
    Delete,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Update => "UPDATE",
            ProductStatus::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<ProductStatus> {
        match s.to_ascii_uppercase().as_str() {
            "UPDATE" => Some(ProductStatus::Update),
            "DELETE" => Some(ProductStatus::Delete),
            _ => None,
        }
    }
}

/// Raw product record as delivered by a feed, before summarization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub status: ProductStatus,
    #[serde(default)]
    pub tracker_url: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub links: BTreeMap<String, Vec<String>>,
    /// Opaque payload bytes, stored by product storage (not the index).
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
}

/// Lightweight, immutable view of a product used for indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSummary {
    /// Storage-assigned surrogate id, set once indexed.
    pub index_id: Option<i64>,
    pub id: ProductId,
    pub status: ProductStatus,
    pub tracker_url: Option<String>,
    pub version: Option<String>,
    pub event_source: Option<String>,
    pub event_source_code: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub event_latitude: Option<f64>,
    pub event_longitude: Option<f64>,
    pub event_depth: Option<f64>,
    pub event_magnitude: Option<f64>,
    pub preferred_weight: i64,
    pub properties: BTreeMap<String, String>,
    pub links: BTreeMap<String, Vec<String>>,
}

impl ProductSummary {
    pub fn is_deleted(&self) -> bool {
        self.status == ProductStatus::Delete
    }

    /// The (eventSource, eventSourceCode) pair, lowercased, when both are set.
    pub fn event_code(&self) -> Option<(String, String)> {
        match (&self.event_source, &self.event_source_code) {
            (Some(s), Some(c)) => Some((s.to_lowercase(), c.to_lowercase())),
            _ => None,
        }
    }

    /// Combined event id string (source + code), when both are set.
    pub fn event_id(&self) -> Option<String> {
        self.event_code().map(|(s, c)| format!("{}{}", s, c))
    }

    /// Whether this summary carries enough information to define an event.
    pub fn has_origin_properties(&self) -> bool {
        self.event_source.is_some()
            && self.event_source_code.is_some()
            && self.event_latitude.is_some()
            && self.event_longitude.is_some()
            && self.event_time.is_some()
    }
}

/// Derived preferred values for an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventSummary {
    pub index_id: Option<i64>,
    pub source: Option<String>,
    pub source_code: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub depth: Option<f64>,
    pub magnitude: Option<f64>,
    pub deleted: bool,
    /// All known (eventSource → eventSourceCode) pairs for the event.
    pub event_codes: BTreeMap<String, String>,
}

impl EventSummary {
    pub fn event_id(&self) -> Option<String> {
        match (&self.source, &self.source_code) {
            (Some(s), Some(c)) => Some(format!("{}{}", s.to_lowercase(), c.to_lowercase())),
            _ => None,
        }
    }
}

/// A cluster of product threads describing one physical occurrence.
///
/// Holds every version of every member summary, grouped by product type.
/// Superseded versions remain for history; they are filtered on read.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub index_id: Option<i64>,
    products: BTreeMap<String, Vec<ProductSummary>>,
}

impl Event {
    pub fn new(index_id: Option<i64>) -> Self {
        Self {
            index_id,
            products: BTreeMap::new(),
        }
    }

    pub fn add_product(&mut self, summary: ProductSummary) {
        let list = self
            .products
            .entry(summary.id.product_type.clone())
            .or_default();
        if !list.iter().any(|s| s.id == summary.id) {
            list.push(summary);
        }
    }

    pub fn remove_product(&mut self, id: &ProductId) {
        if let Some(list) = self.products.get_mut(&id.product_type) {
            list.retain(|s| s.id != *id);
            if list.is_empty() {
                self.products.remove(&id.product_type);
            }
        }
    }

    /// All member summaries, including deleted and superseded versions.
    pub fn all_products(&self) -> Vec<ProductSummary> {
        self.products.values().flatten().cloned().collect()
    }

    /// Current (not superseded), non-deleted summaries.
    pub fn current_products(&self) -> Vec<ProductSummary> {
        without_deleted(&without_superseded(&self.all_products()))
    }

    /// Current, non-deleted summaries of one type.
    pub fn products_of_type(&self, product_type: &str) -> Vec<ProductSummary> {
        match self.products.get(product_type) {
            Some(list) => without_deleted(&without_superseded(list)),
            None => Vec::new(),
        }
    }

    pub fn product_types(&self) -> Vec<String> {
        self.products.keys().cloned().collect()
    }

    /// The preferred current summary of one type, or None if none remain.
    pub fn preferred_product(&self, product_type: &str) -> Option<ProductSummary> {
        let mut list = self.products_of_type(product_type);
        list.sort_by(cmp_most_preferred_first);
        list.into_iter().next()
    }

    /// One preferred summary per product type.
    pub fn preferred_products(&self) -> BTreeMap<String, ProductSummary> {
        let mut preferred = BTreeMap::new();
        for product_type in self.products.keys() {
            if let Some(summary) = self.preferred_product(product_type) {
                preferred.insert(product_type.clone(), summary);
            }
        }
        preferred
    }

    /// The summary whose thread defines this event's id.
    ///
    /// The preferred origin product defines identity; when the preferred
    /// origin is gone, the most recent product with origin properties
    /// still names the event for display purposes.
    pub fn event_id_product(&self) -> Option<ProductSummary> {
        self.preferred_origin_product()
            .or_else(|| self.product_with_origin_properties())
    }

    /// The most preferred origin-like product for this event.
    ///
    /// The event is deleted when this returns None, a deleted summary, or a
    /// summary without origin properties. When any "origin" products exist
    /// only they are considered; otherwise all products are.
    pub fn preferred_origin_product(&self) -> Option<ProductSummary> {
        let pool: Vec<ProductSummary> = match self.products.get(ORIGIN_PRODUCT_TYPE) {
            Some(list) => list.clone(),
            None => self.all_products(),
        };

        // current versions that are not deletes, with origin properties
        let mut candidates = without_deleted(&without_superseded(&pool));
        candidates.sort_by(cmp_most_preferred_first);
        if let Some(found) = candidates.into_iter().find(|s| s.has_origin_properties()) {
            return Some(found);
        }

        // fall back to current versions that still carry an event id
        let mut candidates = without_superseded(&pool);
        candidates.sort_by(cmp_most_preferred_first);
        candidates
            .into_iter()
            .find(|s| s.event_source.is_some() && s.event_source_code.is_some())
    }

    /// The most recent product carrying origin properties.
    ///
    /// Unlike [`Event::preferred_origin_product`], a version superseded by a
    /// delete still qualifies here, so a deleted event retains location
    /// information for display.
    pub fn product_with_origin_properties(&self) -> Option<ProductSummary> {
        let origin_pool = self.products.get(ORIGIN_PRODUCT_TYPE).cloned();
        let all_pool = self.all_products();
        for pool in [origin_pool.as_deref(), Some(all_pool.as_slice())]
            .into_iter()
            .flatten()
        {
            // current versions that are not deletes
            let mut candidates = without_deleted(&without_superseded(pool));
            candidates.sort_by(cmp_most_preferred_first);
            if let Some(found) = candidates.into_iter().find(|s| s.has_origin_properties()) {
                return Some(found);
            }
            // latest non-delete version, even if superseded by a delete
            let mut candidates = without_superseded(&without_deleted(pool));
            candidates.sort_by(cmp_most_preferred_first);
            if let Some(found) = candidates.into_iter().find(|s| s.has_origin_properties()) {
                return Some(found);
            }
        }
        None
    }

    pub fn source(&self) -> Option<String> {
        self.event_id_product()
            .and_then(|p| p.event_source.map(|s| s.to_lowercase()))
    }

    pub fn source_code(&self) -> Option<String> {
        self.event_id_product()
            .and_then(|p| p.event_source_code.map(|c| c.to_lowercase()))
    }

    /// The event id: preferred source + preferred source code.
    pub fn event_id(&self) -> Option<String> {
        self.event_id_product().and_then(|p| p.event_id())
    }

    /// An event with no current non-deleted origin-category product is deleted.
    pub fn is_deleted(&self) -> bool {
        match self.preferred_origin_product() {
            Some(preferred) => preferred.is_deleted() || !preferred.has_origin_properties(),
            None => true,
        }
    }

    /// All known event codes, source → codes from that source.
    ///
    /// When `include_deleted` is false, codes whose sub-event has no
    /// remaining non-deleted current product are dropped.
    pub fn all_event_codes(&self, include_deleted: bool) -> BTreeMap<String, Vec<String>> {
        let mut codes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (event_id, sub_event) in self.sub_events() {
            if event_id.is_none() {
                continue;
            }
            if !include_deleted
                && without_deleted(&without_superseded(&sub_event.all_products())).is_empty()
            {
                continue;
            }
            let (source, source_code) = match (sub_event.source(), sub_event.source_code()) {
                (Some(s), Some(c)) => (s, c),
                _ => continue,
            };
            let list = codes.entry(source).or_default();
            if !list.contains(&source_code) {
                list.push(source_code);
            }
        }
        codes
    }

    /// Flattened event codes for the event summary, preferred code last
    /// so it wins when one source reports multiple codes.
    fn event_code_map(&self) -> BTreeMap<String, String> {
        let mut sorted = without_superseded(&self.all_products());
        sorted.sort_by(cmp_most_preferred_first);
        sorted.reverse();
        let mut map = BTreeMap::new();
        for summary in sorted {
            if let Some((source, code)) = summary.event_code() {
                map.insert(source, code);
            }
        }
        map
    }

    /// Split this event's members into per-thread sub-events keyed by the
    /// event id each thread reports. Products without an event id ride with
    /// the event's own defining sub-event (key None maps to that id).
    pub fn sub_events(&self) -> Vec<(Option<String>, Event)> {
        let mut sub_events: BTreeMap<Option<String>, Event> = BTreeMap::new();
        sub_events.insert(self.event_id(), Event::default());

        let all = self.all_products();
        let current = without_superseded(&all);
        let mut thread_home: BTreeMap<String, Option<String>> = BTreeMap::new();

        for summary in &current {
            let key = match summary.event_id() {
                Some(id) => Some(id),
                None => self.event_id(),
            };
            thread_home.insert(summary.id.thread_key(), key.clone());
            sub_events
                .entry(key)
                .or_default()
                .add_product(summary.clone());
        }

        // superseded versions follow their thread's current version
        for summary in &all {
            if current.iter().any(|c| c.id == summary.id) {
                continue;
            }
            let key = thread_home
                .get(&summary.id.thread_key())
                .cloned()
                .unwrap_or_else(|| self.event_id());
            sub_events
                .entry(key)
                .or_default()
                .add_product(summary.clone());
        }

        sub_events.into_iter().collect()
    }

    /// Whether this event holds a current associate product naming the other
    /// event's preferred source and code.
    pub fn has_associate_product(&self, other: &Event) -> bool {
        self.has_admin_product(ASSOCIATE_PRODUCT_TYPE, other)
    }

    /// Whether this event holds a current disassociate product naming the
    /// other event's preferred source and code.
    pub fn has_disassociate_product(&self, other: &Event) -> bool {
        self.has_admin_product(DISASSOCIATE_PRODUCT_TYPE, other)
    }

    fn has_admin_product(&self, product_type: &str, other: &Event) -> bool {
        let (other_source, other_code) = match (other.source(), other.source_code()) {
            (Some(s), Some(c)) => (s, c),
            _ => return false,
        };
        self.products_of_type(product_type).iter().any(|summary| {
            summary
                .properties
                .get(OTHER_EVENT_SOURCE_PROPERTY)
                .is_some_and(|s| s.eq_ignore_ascii_case(&other_source))
                && summary
                    .properties
                    .get(OTHER_EVENT_SOURCE_CODE_PROPERTY)
                    .is_some_and(|c| c.eq_ignore_ascii_case(&other_code))
        })
    }

    /// Summarize this event into preferred values.
    pub fn summary(&self) -> EventSummary {
        let mut summary = EventSummary {
            index_id: self.index_id,
            deleted: self.is_deleted(),
            ..EventSummary::default()
        };
        if let Some(id_product) = self.event_id_product() {
            summary.source = id_product.event_source.map(|s| s.to_lowercase());
            summary.source_code = id_product.event_source_code.map(|c| c.to_lowercase());
        }
        if let Some(origin) = self.product_with_origin_properties() {
            summary.time = origin.event_time;
            summary.latitude = origin.event_latitude;
            summary.longitude = origin.event_longitude;
            summary.depth = origin.event_depth;
            summary.magnitude = origin.event_magnitude;
        }
        summary.event_codes = self.event_code_map();
        summary
    }
}

/// Order summaries most preferred first: highest weight, then most recent
/// update time, then lexicographically greatest source, then code.
pub fn cmp_most_preferred_first(a: &ProductSummary, b: &ProductSummary) -> Ordering {
    b.preferred_weight
        .cmp(&a.preferred_weight)
        .then_with(|| b.id.update_time.cmp(&a.id.update_time))
        .then_with(|| b.id.source.cmp(&a.id.source))
        .then_with(|| b.id.code.cmp(&a.id.code))
}

/// Keep only the most recent version of each thread.
pub fn without_superseded(products: &[ProductSummary]) -> Vec<ProductSummary> {
    let mut latest: BTreeMap<String, ProductSummary> = BTreeMap::new();
    for summary in products {
        let key = summary.id.thread_key();
        match latest.get(&key) {
            Some(existing) if existing.id.update_time >= summary.id.update_time => {}
            _ => {
                latest.insert(key, summary.clone());
            }
        }
    }
    latest.into_values().collect()
}

/// Drop delete-status summaries.
pub fn without_deleted(products: &[ProductSummary]) -> Vec<ProductSummary> {
    products
        .iter()
        .filter(|s| !s.is_deleted())
        .cloned()
        .collect()
}
