//! Archive policies and the periodic sweep task.
//!
//! A policy is declarative configuration that translates into one index
//! query at sweep time. Event policies remove whole matching events;
//! product policies remove individual product versions. Contradictory
//! bounds are rejected when the config loads, so a sweep never fails on
//! policy shape.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::indexer::Indexer;
use crate::models::ProductStatus;
use crate::query::{AssociationScope, ProductIndexQuery, ResultType};

/// Removes whole events past their usefulness.
///
/// Age bounds are relative to sweep time; time bounds are absolute. A
/// policy may use one or the other for events, never both.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchivePolicy {
    pub name: String,
    pub min_event_age_secs: Option<u64>,
    pub max_event_age_secs: Option<u64>,
    pub min_event_time: Option<DateTime<Utc>>,
    pub max_event_time: Option<DateTime<Utc>>,
    pub min_latitude: Option<f64>,
    pub max_latitude: Option<f64>,
    pub min_longitude: Option<f64>,
    pub max_longitude: Option<f64>,
    pub min_depth: Option<f64>,
    pub max_depth: Option<f64>,
    pub min_magnitude: Option<f64>,
    pub max_magnitude: Option<f64>,
    pub event_source: Option<String>,
}

impl ArchivePolicy {
    pub fn validate(&self) -> Result<()> {
        let uses_age = self.min_event_age_secs.is_some() || self.max_event_age_secs.is_some();
        let uses_time = self.min_event_time.is_some() || self.max_event_time.is_some();
        if uses_age && uses_time {
            bail!(
                "policy '{}': event age and absolute event time bounds are mutually exclusive",
                self.name
            );
        }
        if let (Some(min), Some(max)) = (self.min_event_age_secs, self.max_event_age_secs) {
            if min > max {
                bail!("policy '{}': min_event_age_secs exceeds max_event_age_secs", self.name);
            }
        }
        if let (Some(min), Some(max)) = (self.min_event_time, self.max_event_time) {
            if min > max {
                bail!("policy '{}': min_event_time exceeds max_event_time", self.name);
            }
        }
        if !uses_age
            && !uses_time
            && self.min_latitude.is_none()
            && self.max_latitude.is_none()
            && self.min_longitude.is_none()
            && self.max_longitude.is_none()
            && self.min_depth.is_none()
            && self.max_depth.is_none()
            && self.min_magnitude.is_none()
            && self.max_magnitude.is_none()
            && self.event_source.is_none()
        {
            bail!("policy '{}': no conditions; it would remove everything", self.name);
        }
        Ok(())
    }

    /// Translate this policy into an index query at sweep time `now`.
    pub fn to_query(&self, now: DateTime<Utc>) -> ProductIndexQuery {
        let mut query = ProductIndexQuery::new();
        query.result_type = ResultType::All;

        // an event at least min_age old has event_time <= now - min_age
        if let Some(min_age) = self.min_event_age_secs {
            query.max_event_time = Some(now - chrono::Duration::seconds(min_age as i64));
        }
        if let Some(max_age) = self.max_event_age_secs {
            query.min_event_time = Some(now - chrono::Duration::seconds(max_age as i64));
        }
        if self.min_event_time.is_some() {
            query.min_event_time = self.min_event_time;
        }
        if self.max_event_time.is_some() {
            query.max_event_time = self.max_event_time;
        }

        query.min_event_latitude = self.min_latitude;
        query.max_event_latitude = self.max_latitude;
        if let (Some(min), Some(max)) = (self.min_longitude, self.max_longitude) {
            query.set_longitude_range(min, max);
        } else {
            query.min_event_longitude = self.min_longitude;
            query.max_event_longitude = self.max_longitude;
        }
        query.min_event_depth = self.min_depth;
        query.max_event_depth = self.max_depth;
        query.min_event_magnitude = self.min_magnitude;
        query.max_event_magnitude = self.max_magnitude;
        query.event_source = self.event_source.clone();
        query
    }
}

/// Removes individual product versions, leaving their events in place.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductArchivePolicy {
    pub name: String,
    pub min_product_age_secs: Option<u64>,
    pub max_product_age_secs: Option<u64>,
    pub min_product_time: Option<DateTime<Utc>>,
    pub max_product_time: Option<DateTime<Utc>>,
    pub product_source: Option<String>,
    pub product_type: Option<String>,
    pub product_status: Option<String>,
    /// Only versions already superseded by a newer one.
    #[serde(default = "default_true")]
    pub only_superseded: bool,
    /// Only products not associated to any event.
    #[serde(default)]
    pub only_unassociated: bool,
}

fn default_true() -> bool {
    true
}

impl ProductArchivePolicy {
    pub fn validate(&self) -> Result<()> {
        let uses_age = self.min_product_age_secs.is_some() || self.max_product_age_secs.is_some();
        let uses_time = self.min_product_time.is_some() || self.max_product_time.is_some();
        if uses_age && uses_time {
            bail!(
                "policy '{}': product age and absolute product time bounds are mutually exclusive",
                self.name
            );
        }
        if let (Some(min), Some(max)) = (self.min_product_age_secs, self.max_product_age_secs) {
            if min > max {
                bail!(
                    "policy '{}': min_product_age_secs exceeds max_product_age_secs",
                    self.name
                );
            }
        }
        if let (Some(min), Some(max)) = (self.min_product_time, self.max_product_time) {
            if min > max {
                bail!("policy '{}': min_product_time exceeds max_product_time", self.name);
            }
        }
        if !uses_age && !uses_time {
            bail!("policy '{}': a product age or time bound is required", self.name);
        }
        if let Some(status) = &self.product_status {
            if ProductStatus::parse(status).is_none() {
                bail!("policy '{}': unknown product status '{}'", self.name, status);
            }
        }
        Ok(())
    }

    pub fn to_query(&self, now: DateTime<Utc>) -> ProductIndexQuery {
        let mut query = ProductIndexQuery::new();
        query.result_type = if self.only_superseded {
            ResultType::Superseded
        } else {
            ResultType::All
        };
        query.association_scope = if self.only_unassociated {
            AssociationScope::Unassociated
        } else {
            AssociationScope::Any
        };

        if let Some(min_age) = self.min_product_age_secs {
            query.max_product_update_time = Some(now - chrono::Duration::seconds(min_age as i64));
        }
        if let Some(max_age) = self.max_product_age_secs {
            query.min_product_update_time = Some(now - chrono::Duration::seconds(max_age as i64));
        }
        if self.min_product_time.is_some() {
            query.min_product_update_time = self.min_product_time;
        }
        if self.max_product_time.is_some() {
            query.max_product_update_time = self.max_product_time;
        }

        query.product_source = self.product_source.clone();
        query.product_type = self.product_type.clone();
        query.product_status = self
            .product_status
            .as_deref()
            .and_then(ProductStatus::parse);
        query
    }
}

/// Handle to the background sweep task.
pub struct ArchiveSweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ArchiveSweeper {
    /// Start sweeping: once immediately, then on every interval tick.
    pub fn spawn(indexer: Arc<Indexer>, interval_secs: u64) -> Self {
        let (shutdown, mut signal) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match indexer.sweep_archives().await {
                            Ok(removed) if removed > 0 => {
                                info!(removed, "archive sweep complete");
                            }
                            Ok(_) => {}
                            Err(e) => warn!("archive sweep failed: {:#}", e),
                        }
                    }
                    _ = signal.changed() => break,
                }
            }
        });
        Self { shutdown, handle }
    }

    /// Stop the sweep task, waiting for an in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
