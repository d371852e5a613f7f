//! Summarizer modules turn raw products into index-ready summaries.
//!
//! Modules are registered on the engine; for each incoming product the
//! module reporting the highest support level summarizes it, with ties
//! going to the earliest registration. The default module supports every
//! product at level 1, so registering nothing still indexes everything.
//!
//! # Example
//!
//! ```rust
//! use quakedex::summary::ModuleRegistry;
//!
//! let mut modules = ModuleRegistry::with_default();
//! // modules.register(Box::new(MyModule::new()));
//! ```

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::IndexerError;
use crate::models::{Product, ProductSummary};

/// Support level meaning "cannot summarize this product".
pub const LEVEL_UNSUPPORTED: u32 = 0;
/// Support level of the default module.
pub const LEVEL_DEFAULT: u32 = 1;

/// Summarizes products of the types it understands.
///
/// Implementations must be deterministic: the same product always yields
/// the same summary, because weights are re-derived after trump removal.
pub trait IndexerModule: Send + Sync {
    /// How well this module understands `product`. `LEVEL_UNSUPPORTED`
    /// declines; higher values outrank lower ones.
    fn support_level(&self, product: &Product) -> u32;

    /// Build the index summary for a supported product.
    fn summarize(&self, product: &Product) -> Result<ProductSummary>;
}

/// Registry of summarizer modules, owned by the engine.
pub struct ModuleRegistry {
    modules: Vec<Box<dyn IndexerModule>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Create a registry pre-loaded with the default module.
    pub fn with_default() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DefaultModule));
        registry
    }

    /// Register a module. Registration order breaks support-level ties.
    pub fn register(&mut self, module: Box<dyn IndexerModule>) {
        self.modules.push(module);
    }

    /// The module with the highest support level for `product`.
    pub fn get_module(&self, product: &Product) -> Result<&dyn IndexerModule> {
        let mut best: Option<(u32, &dyn IndexerModule)> = None;
        for module in &self.modules {
            let level = module.support_level(product);
            if level > LEVEL_UNSUPPORTED && best.map_or(true, |(b, _)| level > b) {
                best = Some((level, module.as_ref()));
            }
        }
        best.map(|(_, module)| module)
            .ok_or_else(|| IndexerError::UnsupportedProduct(product.id.clone()).into())
    }

    /// Summarize `product` with its best supporting module.
    pub fn summarize(&self, product: &Product) -> Result<ProductSummary> {
        self.get_module(product)?.summarize(product)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_default()
    }
}

/// Summarizer of last resort: copies event attributes from the product's
/// well-known properties.
pub struct DefaultModule;

/// Property naming the event's reporting network.
pub const EVENT_SOURCE_PROPERTY: &str = "eventsource";
/// Property naming the code the network assigned.
pub const EVENT_SOURCE_CODE_PROPERTY: &str = "eventsourcecode";
/// Property carrying the origin time (RFC 3339 or epoch milliseconds).
pub const EVENT_TIME_PROPERTY: &str = "eventtime";
/// Property carrying the origin latitude, decimal degrees.
pub const LATITUDE_PROPERTY: &str = "latitude";
/// Property carrying the origin longitude, decimal degrees.
pub const LONGITUDE_PROPERTY: &str = "longitude";
/// Property carrying the origin depth, kilometers.
pub const DEPTH_PROPERTY: &str = "depth";
/// Property carrying the magnitude.
pub const MAGNITUDE_PROPERTY: &str = "magnitude";
/// Optional property overriding the derived preferred weight.
pub const PREFERRED_WEIGHT_PROPERTY: &str = "preferredweight";

impl IndexerModule for DefaultModule {
    fn support_level(&self, _product: &Product) -> u32 {
        LEVEL_DEFAULT
    }

    fn summarize(&self, product: &Product) -> Result<ProductSummary> {
        let props = &product.properties;
        let preferred_weight = props
            .get(PREFERRED_WEIGHT_PROPERTY)
            .and_then(|w| w.parse::<i64>().ok())
            .unwrap_or(1);

        Ok(ProductSummary {
            index_id: None,
            id: product.id.clone(),
            status: product.status,
            tracker_url: product.tracker_url.clone(),
            version: product.version.clone(),
            event_source: props.get(EVENT_SOURCE_PROPERTY).cloned(),
            event_source_code: props.get(EVENT_SOURCE_CODE_PROPERTY).cloned(),
            event_time: props.get(EVENT_TIME_PROPERTY).and_then(|t| parse_time(t)),
            event_latitude: parse_f64(props.get(LATITUDE_PROPERTY)),
            event_longitude: parse_f64(props.get(LONGITUDE_PROPERTY)),
            event_depth: parse_f64(props.get(DEPTH_PROPERTY)),
            event_magnitude: parse_f64(props.get(MAGNITUDE_PROPERTY)),
            preferred_weight,
            properties: product.properties.clone(),
            links: product.links.clone(),
        })
    }
}

fn parse_f64(value: Option<&String>) -> Option<f64> {
    value.and_then(|v| v.parse().ok())
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Some(time.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}
