//! Association rules: which events a summary may join, and whether two
//! events still belong together.
//!
//! Candidate search is a pair of index queries (identity first, then a
//! time/location window); final selection picks the closest candidate by a
//! window-normalized distance so results do not depend on candidate order.

use chrono::Duration;

use crate::models::{Event, ProductSummary};
use crate::query::{normalize_longitude, ProductIndexQuery};

/// Kilometers per degree of latitude, used to convert the search radius
/// into degree deltas.
pub const KM_PER_DEGREE: f64 = 111.12;

/// Above this latitude, meridians converge enough that longitude bounds
/// are dropped and the time/latitude window decides alone.
const LONGITUDE_CUTOFF_LATITUDE: f64 = 89.0;

#[derive(Debug, Clone)]
pub struct Associator {
    /// Half-width of the origin-time window, seconds.
    pub time_window_secs: i64,
    /// Search radius, kilometers.
    pub distance_km: f64,
}

impl Default for Associator {
    fn default() -> Self {
        Self {
            time_window_secs: 16,
            distance_km: 100.0,
        }
    }
}

impl Associator {
    pub fn new(time_window_secs: i64, distance_km: f64) -> Self {
        Self {
            time_window_secs,
            distance_km,
        }
    }

    /// Queries that find candidate events for a summary: an identity query
    /// when the summary names an event code, then a location query when it
    /// carries origin attributes. Identity matches take precedence.
    pub fn event_search_queries(&self, summary: &ProductSummary) -> Vec<ProductIndexQuery> {
        let mut queries = Vec::new();
        if let Some((source, code)) = summary.event_code() {
            let mut query = ProductIndexQuery::new();
            query.event_source = Some(source);
            query.event_source_code = Some(code);
            queries.push(query);
        }
        if let (Some(time), Some(lat), Some(lon)) = (
            summary.event_time,
            summary.event_latitude,
            summary.event_longitude,
        ) {
            queries.push(self.location_query(time, lat, lon));
        }
        queries
    }

    /// Build the time/location window query around an origin.
    pub fn location_query(
        &self,
        time: chrono::DateTime<chrono::Utc>,
        latitude: f64,
        longitude: f64,
    ) -> ProductIndexQuery {
        let mut query = ProductIndexQuery::new();
        let window = Duration::seconds(self.time_window_secs);
        query.min_event_time = Some(time - window);
        query.max_event_time = Some(time + window);

        let lat_delta = self.distance_km / KM_PER_DEGREE;
        query.min_event_latitude = Some(latitude - lat_delta);
        query.max_event_latitude = Some(latitude + lat_delta);

        if latitude.abs() < LONGITUDE_CUTOFF_LATITUDE {
            let lon_delta = lat_delta / latitude.to_radians().cos();
            query.set_longitude_range(longitude - lon_delta, longitude + lon_delta);
        }
        query
    }

    /// Pick the event a summary should join from location-query candidates.
    ///
    /// An event whose preferred source matches the summary's event source
    /// under a different code is excluded: that network has already said
    /// these are different events. Ties are broken by closest normalized
    /// distance, so the result is independent of candidate order.
    pub fn choose_event(&self, candidates: &[Event], summary: &ProductSummary) -> Option<Event> {
        let summary_source = summary.event_source.as_ref().map(|s| s.to_lowercase());
        let summary_id = summary.event_id();

        let eligible: Vec<&Event> = candidates
            .iter()
            .filter(|event| {
                match (&summary_source, event.source()) {
                    (Some(source), Some(event_source)) if *source == event_source => {
                        // same network: only an exact code match may associate
                        event.event_id() == summary_id
                    }
                    _ => true,
                }
            })
            .collect();

        if let (Some(time), Some(lat), Some(lon)) = (
            summary.event_time,
            summary.event_latitude,
            summary.event_longitude,
        ) {
            self.choose_most_similar(&eligible, time, lat, lon)
        } else {
            eligible.first().map(|event| (*event).clone())
        }
    }

    /// Closest event by Euclidean distance over window-normalized time,
    /// latitude, and longitude deltas.
    fn choose_most_similar(
        &self,
        candidates: &[&Event],
        time: chrono::DateTime<chrono::Utc>,
        latitude: f64,
        longitude: f64,
    ) -> Option<Event> {
        let lat_span = self.distance_km / KM_PER_DEGREE;
        let time_span = self.time_window_secs as f64;

        let mut best: Option<(f64, &Event)> = None;
        for event in candidates {
            let summary = event.summary();
            let (Some(event_time), Some(event_lat), Some(event_lon)) =
                (summary.time, summary.latitude, summary.longitude)
            else {
                continue;
            };
            let time_delta =
                (event_time - time).num_milliseconds() as f64 / 1000.0 / time_span;
            let lat_delta = (event_lat - latitude) / lat_span;
            let mut lon_diff =
                normalize_longitude(event_lon) - normalize_longitude(longitude);
            if lon_diff > 180.0 {
                lon_diff -= 360.0;
            } else if lon_diff < -180.0 {
                lon_diff += 360.0;
            }
            let lon_delta = lon_diff / lat_span;
            let distance =
                time_delta * time_delta + lat_delta * lat_delta + lon_delta * lon_delta;
            match best {
                Some((best_distance, _)) if best_distance <= distance => {}
                _ => best = Some((distance, event)),
            }
        }
        best.map(|(_, event)| event.clone())
    }

    /// Whether two sub-events still belong in the same event.
    ///
    /// Administrative products win: a disassociate naming the other event
    /// severs them; an associate naming it binds them. Two sub-events from
    /// the same network belong together only under the same code; shared
    /// networks reporting different codes keep them apart. Otherwise the
    /// time/location window decides.
    pub fn events_associated(&self, a: &Event, b: &Event) -> bool {
        if a.has_disassociate_product(b) || b.has_disassociate_product(a) {
            return false;
        }
        if a.has_associate_product(b) || b.has_associate_product(a) {
            return true;
        }

        match (a.source(), b.source()) {
            (Some(source_a), Some(source_b)) if source_a == source_b => {
                return a.event_id().is_some() && a.event_id() == b.event_id();
            }
            _ => {}
        }

        // a network reporting distinct codes for the two means distinct events
        let codes_a = a.all_event_codes(true);
        let codes_b = b.all_event_codes(true);
        for (source, list_a) in &codes_a {
            if let Some(list_b) = codes_b.get(source) {
                if list_a.iter().all(|code| !list_b.contains(code)) {
                    return false;
                }
            }
        }

        let summary_a = a.summary();
        let Some(origin_b) = b.product_with_origin_properties() else {
            return false;
        };
        let (Some(time), Some(lat), Some(lon)) =
            (summary_a.time, summary_a.latitude, summary_a.longitude)
        else {
            return false;
        };
        self.location_query(time, lat, lon)
            .contains_location(&origin_b)
    }
}
