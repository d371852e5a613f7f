//! The indexing engine: associates incoming products with events, keeps
//! preferred selections current, and emits an ordered change list per
//! ingestion.
//!
//! All index mutation happens under one async lock, inside one SQLite
//! transaction per product, so listeners only ever observe committed
//! state and the change list matches exactly what was persisted.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteConnection;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::associate::Associator;
use crate::config::{ArchiveConfig, Config};
use crate::dispatch::{ChangeKind, Dispatcher, IndexerChange, IndexerEvent, IndexerListener};
use crate::error::IndexerError;
use crate::graph::connected_components;
use crate::index::ProductIndex;
use crate::models::{
    Event, Product, ProductId, ProductSummary, ASSOCIATE_PRODUCT_TYPE,
    OTHER_EVENT_SOURCE_CODE_PROPERTY, OTHER_EVENT_SOURCE_PROPERTY, PERSISTENT_TRUMP_PREFIX,
    TRUMP_CODE_PROPERTY, TRUMP_PREFERRED_WEIGHT, TRUMP_PRODUCT_TYPE, TRUMP_SOURCE_PROPERTY,
};
use crate::query::{ProductIndexQuery, ResultType, SearchQuery, SearchRequest, SearchResponse, SearchResult};
use crate::storage::ProductStorage;
use crate::summary::{ModuleRegistry, PREFERRED_WEIGHT_PROPERTY};

/// Link relation on version-specific trump products naming the target.
const TRUMP_PRODUCT_LINK: &str = "product";
/// Property on version-specific trump products carrying the granted weight.
const TRUMP_WEIGHT_PROPERTY: &str = "weight";

pub struct Indexer {
    index: ProductIndex,
    storage: Arc<dyn ProductStorage>,
    modules: ModuleRegistry,
    associator: Associator,
    archive: ArchiveConfig,
    dispatcher: Mutex<Option<Dispatcher>>,
    /// Serializes every index mutation.
    mutation: Mutex<()>,
}

impl Indexer {
    pub fn new(
        index: ProductIndex,
        storage: Arc<dyn ProductStorage>,
        config: &Config,
        listeners: Vec<Arc<dyn IndexerListener>>,
    ) -> Self {
        Self {
            index,
            storage,
            modules: ModuleRegistry::with_default(),
            associator: Associator::new(
                config.association.time_window_secs,
                config.association.distance_km,
            ),
            archive: config.archive.clone(),
            dispatcher: Mutex::new(Some(Dispatcher::new(listeners, &config.dispatch))),
            mutation: Mutex::new(()),
        }
    }

    /// Register a summarizer module. Call before ingestion starts.
    pub fn register_module(&mut self, module: Box<dyn crate::summary::IndexerModule>) {
        self.modules.register(module);
    }

    pub fn index(&self) -> &ProductIndex {
        &self.index
    }

    pub fn storage(&self) -> &Arc<dyn ProductStorage> {
        &self.storage
    }

    /// Ingest one product version: store, summarize, associate, commit,
    /// then dispatch. Returns the ordered change list.
    pub async fn on_product(&self, product: &Product) -> Result<IndexerEvent> {
        debug!(product = %product.id, "indexing product");

        match self.storage.store(product).await {
            Ok(()) => {}
            Err(e) => match e.downcast_ref::<IndexerError>() {
                Some(IndexerError::AlreadyInStorage(_)) => {
                    // stored but unindexed means an earlier run stopped
                    // between the two steps, so re-index it
                    let mut conn = self.index.pool().acquire().await?;
                    if self.index.has_product(&mut conn, &product.id).await? {
                        return Err(e);
                    }
                    debug!(product = %product.id, "stored but unindexed, indexing");
                }
                _ => return Err(e),
            },
        }

        let mut summary = self.modules.summarize(product)?;

        let _guard = self.mutation.lock().await;
        let mut tx = self.index.begin().await?;
        let result = self.index_summary(&mut tx, &mut summary).await;
        let event = match result {
            Ok(event) => {
                tx.commit().await?;
                event
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        info!(
            product = %product.id,
            changes = ?event.kinds().iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "product indexed"
        );
        // queued while the mutation lock is still held: delivery order is
        // commit order, and the queue send never blocks
        self.dispatch(event.clone()).await;
        Ok(event)
    }

    async fn index_summary(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        summary: &mut ProductSummary,
    ) -> Result<IndexerEvent> {
        let conn: &mut SqliteConnection = &mut *tx;

        let prev_versions = self.index.get_product_versions(conn, &summary.id).await?;
        let prev_current = prev_versions.first().cloned();
        let prev_event_id = self.index.get_thread_event_id(conn, &summary.id).await?;

        let row_id = self.index.add_product_summary(conn, summary).await?;
        summary.index_id = Some(row_id);

        // resolve the event this thread belongs to
        let original_event = match prev_event_id {
            Some(event_id) => self.index.get_event(conn, event_id).await?,
            None => self.find_event(conn, summary).await?,
        };

        let mut changes = IndexerEvent {
            summary: Some(summary.clone()),
            changes: Vec::new(),
        };

        let original_event = match original_event {
            Some(event) => event,
            None => {
                if let Some(created) = self.try_create_event(conn, summary).await? {
                    // brand-new event; adopt loose products before reporting it
                    let event = self.adopt_unassociated(conn, created).await?;
                    let event = self.resummarize_event(conn, event).await?;
                    self.index.events_updated(conn, &[event.clone()]).await?;
                    changes.push(IndexerChange::new(
                        ChangeKind::EventAdded,
                        None,
                        Some(event),
                    ));
                } else {
                    // no event: the product stands alone in the index
                    let kind = if summary.is_deleted() {
                        ChangeKind::ProductDeleted
                    } else if prev_current.is_some() {
                        ChangeKind::ProductUpdated
                    } else {
                        ChangeKind::ProductAdded
                    };
                    changes.push(IndexerChange::new(kind, None, None));
                }
                return Ok(changes);
            }
        };

        let event_id = original_event
            .index_id
            .context("loaded event has no index id")?;
        self.index.add_association(conn, event_id, &summary.id).await?;

        if is_redundant(&prev_current, summary) {
            // identical resubmission: no association state can change
            let event = self
                .index
                .get_event(conn, event_id)
                .await?
                .context("event vanished mid-transaction")?;
            self.index.events_updated(conn, &[event.clone()]).await?;
            changes.push(IndexerChange::new(
                ChangeKind::EventUpdated,
                Some(original_event),
                Some(event),
            ));
            return Ok(changes);
        }

        let event = self
            .index
            .get_event(conn, event_id)
            .await?
            .context("event vanished mid-transaction")?;
        let event = self.resummarize_event(conn, event).await?;

        // split before merge: a disassociate or code change divides first
        if let Some(split_changes) = self.check_split(conn, &original_event, event.clone()).await? {
            changes.changes.extend(split_changes);
            return Ok(changes);
        }

        let (event, merge_changes) = self.check_merge(conn, event, summary).await?;
        let event = self.adopt_unassociated(conn, event).await?;
        let event = self.resummarize_event(conn, event).await?;
        self.index.events_updated(conn, &[event.clone()]).await?;

        changes.changes.extend(merge_changes);
        let kind = if event.is_deleted() && !original_event.is_deleted() {
            ChangeKind::EventDeleted
        } else {
            ChangeKind::EventUpdated
        };
        changes.push(IndexerChange::new(kind, Some(original_event), Some(event)));
        Ok(changes)
    }

    /// Search for the event a summary belongs to: identity first, then the
    /// closest event inside the time/location window.
    async fn find_event(
        &self,
        conn: &mut SqliteConnection,
        summary: &ProductSummary,
    ) -> Result<Option<Event>> {
        for query in self.associator.event_search_queries(summary) {
            let candidates = self.index.get_events(conn, &query).await?;
            if let Some(event) = self.associator.choose_event(&candidates, summary) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// Create an event for a summary that defines one and found no match.
    async fn try_create_event(
        &self,
        conn: &mut SqliteConnection,
        summary: &ProductSummary,
    ) -> Result<Option<Event>> {
        if !summary.has_origin_properties() || summary.is_deleted() {
            return Ok(None);
        }
        let mut event = Event::new(None);
        event.add_product(summary.clone());
        let event_id = self.index.add_event(conn, &event.summary()).await?;
        self.index.add_association(conn, event_id, &summary.id).await?;
        let event = self
            .index
            .get_event(conn, event_id)
            .await?
            .context("event vanished after insert")?;
        debug!(event_id, "created event");
        Ok(Some(event))
    }

    /// Pull in unassociated products that fall inside the event's window
    /// or name one of its event codes.
    async fn adopt_unassociated(
        &self,
        conn: &mut SqliteConnection,
        event: Event,
    ) -> Result<Event> {
        let event_id = event.index_id.context("event has no index id")?;
        let summary = event.summary();
        let (Some(time), Some(lat), Some(lon)) = (summary.time, summary.latitude, summary.longitude)
        else {
            return Ok(event);
        };
        let query = self.associator.location_query(time, lat, lon);
        let mut candidates = self.index.get_unassociated_products(conn, &query).await?;

        // also loose products naming one of this event's codes
        for (source, codes) in event.all_event_codes(true) {
            for code in codes {
                let mut identity = ProductIndexQuery::new();
                identity.event_source = Some(source.clone());
                identity.event_source_code = Some(code);
                candidates.extend(
                    self.index
                        .get_unassociated_products(conn, &identity)
                        .await?,
                );
            }
        }

        let known_codes = event.all_event_codes(true);
        let mut adopted = false;
        let mut seen = BTreeSet::new();
        for candidate in candidates {
            if !seen.insert(candidate.id.thread_key()) {
                continue;
            }
            // a network that already named this event under another code
            // keeps its other products out
            if let Some((source, code)) = candidate.event_code() {
                if known_codes
                    .get(&source)
                    .is_some_and(|codes| !codes.contains(&code))
                {
                    continue;
                }
            }
            self.index
                .add_association(conn, event_id, &candidate.id)
                .await?;
            debug!(product = %candidate.id, event_id, "adopted unassociated product");
            adopted = true;
        }
        if adopted {
            return Ok(self
                .index
                .get_event(conn, event_id)
                .await?
                .context("event vanished after adoption")?);
        }
        Ok(event)
    }

    /// Divide the event when its sub-events no longer form one connected
    /// component. Returns the ordered split changes, or None if connected.
    async fn check_split(
        &self,
        conn: &mut SqliteConnection,
        original_event: &Event,
        event: Event,
    ) -> Result<Option<Vec<IndexerChange>>> {
        let defining_id = event.event_id();
        let sub_events = event.sub_events();
        if sub_events.len() < 2 {
            return Ok(None);
        }

        let components = connected_components(sub_events, |(_, a), (_, b)| {
            self.associator.events_associated(a, b)
        });
        if components.len() < 2 {
            return Ok(None);
        }

        let event_id = event.index_id.context("event has no index id")?;
        info!(event_id, components = components.len(), "splitting event");

        let mut split_changes = Vec::new();
        for component in &components {
            if component.iter().any(|(key, _)| *key == defining_id) {
                continue;
            }
            // promote this component to its own event
            let mut promoted = Event::new(None);
            for (_, sub_event) in component {
                for product in sub_event.all_products() {
                    promoted.add_product(product);
                }
            }
            let new_id = self.index.add_event(conn, &promoted.summary()).await?;
            let mut moved = BTreeSet::new();
            for product in promoted.all_products() {
                if moved.insert(product.id.thread_key()) {
                    self.index.add_association(conn, new_id, &product.id).await?;
                }
            }
            let promoted = self
                .index
                .get_event(conn, new_id)
                .await?
                .context("event vanished after split")?;
            let promoted = self.resummarize_event(conn, promoted).await?;
            self.index.events_updated(conn, &[promoted.clone()]).await?;
            split_changes.push(IndexerChange::new(
                ChangeKind::EventSplit,
                Some(event.clone()),
                Some(promoted),
            ));
        }

        let remaining = self
            .index
            .get_event(conn, event_id)
            .await?
            .context("event vanished after split")?;
        let remaining = self.resummarize_event(conn, remaining).await?;
        self.index.events_updated(conn, &[remaining.clone()]).await?;

        let kind = if remaining.is_deleted() && !original_event.is_deleted() {
            ChangeKind::EventDeleted
        } else {
            ChangeKind::EventUpdated
        };
        let mut changes = vec![IndexerChange::new(
            kind,
            Some(original_event.clone()),
            Some(remaining),
        )];
        changes.extend(split_changes);
        Ok(Some(changes))
    }

    /// Merge this event with any event it now belongs with: the target an
    /// associate product names, and neighbors inside the location window.
    async fn check_merge(
        &self,
        conn: &mut SqliteConnection,
        mut event: Event,
        summary: &ProductSummary,
    ) -> Result<(Event, Vec<IndexerChange>)> {
        let mut changes = Vec::new();
        let mut donors: Vec<Event> = Vec::new();

        if summary.id.product_type == ASSOCIATE_PRODUCT_TYPE {
            match self.associate_target(conn, summary).await {
                Ok(Some(target)) if target.index_id != event.index_id => donors.push(target),
                Ok(_) => {}
                Err(e) => match e.downcast_ref::<IndexerError>() {
                    Some(IndexerError::AssociationConflict { .. }) => {
                        warn!("{}", e);
                    }
                    _ => return Err(e),
                },
            }
        }

        let event_summary = event.summary();
        if let (Some(time), Some(lat), Some(lon)) = (
            event_summary.time,
            event_summary.latitude,
            event_summary.longitude,
        ) {
            let query = self.associator.location_query(time, lat, lon);
            for candidate in self.index.get_events(conn, &query).await? {
                if candidate.index_id == event.index_id {
                    continue;
                }
                if donors
                    .iter()
                    .any(|d| d.index_id == candidate.index_id)
                {
                    continue;
                }
                if self.associator.events_associated(&event, &candidate) {
                    donors.push(candidate);
                }
            }
        }

        for donor in donors {
            let (merged, change) = self.merge_events(conn, event, donor).await?;
            event = merged;
            changes.push(change);
        }
        Ok((event, changes))
    }

    /// The event an associate product points at, or an
    /// `AssociationConflict` when it names an unknown event.
    async fn associate_target(
        &self,
        conn: &mut SqliteConnection,
        summary: &ProductSummary,
    ) -> Result<Option<Event>> {
        let (Some(source), Some(code)) = (
            summary.properties.get(OTHER_EVENT_SOURCE_PROPERTY).cloned(),
            summary
                .properties
                .get(OTHER_EVENT_SOURCE_CODE_PROPERTY)
                .cloned(),
        ) else {
            return Ok(None);
        };

        let mut query = ProductIndexQuery::new();
        query.event_source = Some(source.clone());
        query.event_source_code = Some(code.clone());
        query.result_type = ResultType::All;
        let mut candidates = self.index.get_events(conn, &query).await?;
        match candidates.pop() {
            Some(target) => Ok(Some(target)),
            None => Err(IndexerError::AssociationConflict {
                operation: "associate",
                event_source: source,
                code,
            }
            .into()),
        }
    }

    /// Fold `donor` into `event`, keeping the lower surrogate id so merge
    /// results do not depend on which event received the last product.
    async fn merge_events(
        &self,
        conn: &mut SqliteConnection,
        event: Event,
        donor: Event,
    ) -> Result<(Event, IndexerChange)> {
        let event_id = event.index_id.context("event has no index id")?;
        let donor_id = donor.index_id.context("donor event has no index id")?;
        let (retained_id, donor_id, donor) = if event_id <= donor_id {
            (event_id, donor_id, donor)
        } else {
            (donor_id, event_id, event)
        };
        info!(retained_id, donor_id, "merging events");

        let mut moved = BTreeSet::new();
        for product in donor.all_products() {
            if moved.insert(product.id.thread_key()) {
                self.index
                    .add_association(conn, retained_id, &product.id)
                    .await?;
            }
        }
        self.index.remove_event(conn, donor_id).await?;

        let merged = self
            .index
            .get_event(conn, retained_id)
            .await?
            .context("event vanished after merge")?;
        let merged = self.resummarize_event(conn, merged).await?;
        self.index.events_updated(conn, &[merged.clone()]).await?;

        let change = IndexerChange::new(ChangeKind::EventMerged, Some(donor), Some(merged.clone()));
        Ok((merged, change))
    }

    /// Re-derive the preferred weight of every current member from stored
    /// state: trump grants, property overrides, then the default rule.
    /// Deterministic, so removing a trump restores the exact prior weight.
    async fn resummarize_event(
        &self,
        conn: &mut SqliteConnection,
        event: Event,
    ) -> Result<Event> {
        let event_id = event.index_id.context("event has no index id")?;
        let mut changed = false;
        for member in crate::models::without_superseded(&event.all_products()) {
            let weight = derive_weight(&event, &member);
            if weight != member.preferred_weight {
                self.index
                    .set_preferred_weight(conn, &member.id, weight)
                    .await?;
                debug!(
                    product = %member.id,
                    from = member.preferred_weight,
                    to = weight,
                    "preferred weight re-derived"
                );
                changed = true;
            }
        }
        if changed {
            return Ok(self
                .index
                .get_event(conn, event_id)
                .await?
                .context("event vanished during resummarize")?);
        }
        Ok(event)
    }

    /// Run every archive policy once. Each policy commits independently;
    /// one failing policy does not stop the rest. Returns rows removed.
    pub async fn sweep_archives(&self) -> Result<u64> {
        if self.archive.disabled {
            return Ok(0);
        }
        let mut removed = 0;
        for policy in self.archive.event_policies.clone() {
            match self.sweep_event_policy(&policy).await {
                Ok(n) => removed += n,
                Err(e) => warn!(policy = %policy.name, "event archive policy failed: {:#}", e),
            }
        }
        for policy in self.archive.product_policies.clone() {
            match self.sweep_product_policy(&policy).await {
                Ok(n) => removed += n,
                Err(e) => warn!(policy = %policy.name, "product archive policy failed: {:#}", e),
            }
        }
        Ok(removed)
    }

    async fn sweep_event_policy(&self, policy: &crate::archive::ArchivePolicy) -> Result<u64> {
        let _guard = self.mutation.lock().await;
        let mut tx = self.index.begin().await?;
        let conn: &mut SqliteConnection = &mut *tx;

        let query = policy.to_query(Utc::now());
        let events = self.index.get_events(conn, &query).await?;
        let mut changes = IndexerEvent::default();
        let mut removed_ids = Vec::new();
        let mut removed = 0;
        for event in events {
            let event_id = event.index_id.context("event has no index id")?;
            for product in event.all_products() {
                self.index.remove_product_summary(conn, &product.id).await?;
                removed_ids.push(product.id);
                removed += 1;
            }
            self.index.remove_event(conn, event_id).await?;
            removed += 1;
            changes.push(IndexerChange::new(
                ChangeKind::EventArchived,
                Some(event),
                None,
            ));
        }
        tx.commit().await?;

        // payload files go only once the index rows are gone for good
        for id in removed_ids {
            if let Err(e) = self.storage.remove(&id).await {
                warn!(product = %id, "failed to remove archived payload: {:#}", e);
            }
        }

        if !changes.changes.is_empty() {
            info!(policy = %policy.name, removed, "event archive policy applied");
            self.dispatch(changes).await;
        }
        Ok(removed)
    }

    async fn sweep_product_policy(
        &self,
        policy: &crate::archive::ProductArchivePolicy,
    ) -> Result<u64> {
        let _guard = self.mutation.lock().await;
        let mut tx = self.index.begin().await?;
        let conn: &mut SqliteConnection = &mut *tx;

        let query = policy.to_query(Utc::now());
        let products = self.index.get_products(conn, &query).await?;
        let mut changes = IndexerEvent::default();
        let mut touched_events = BTreeSet::new();
        let mut removed_ids = Vec::new();
        let mut removed = 0;
        for product in products {
            if let Some(event_id) = self.product_event_id(conn, &product.id).await? {
                touched_events.insert(event_id);
            }
            self.index.remove_product_summary(conn, &product.id).await?;
            removed_ids.push(product.id);
            removed += 1;
            changes.push(IndexerChange::new(ChangeKind::ProductArchived, None, None));
        }

        // events that lost their last product go with it
        for event_id in touched_events {
            let Some(event) = self.index.get_event(conn, event_id).await? else {
                continue;
            };
            if event.all_products().is_empty() {
                self.index.remove_event(conn, event_id).await?;
                removed += 1;
                changes.push(IndexerChange::new(
                    ChangeKind::EventArchived,
                    Some(event),
                    None,
                ));
            } else {
                self.index.events_updated(conn, &[event]).await?;
            }
        }
        tx.commit().await?;

        // payload files go only once the index rows are gone for good
        for id in removed_ids {
            if let Err(e) = self.storage.remove(&id).await {
                warn!(product = %id, "failed to remove archived payload: {:#}", e);
            }
        }

        if !changes.changes.is_empty() {
            info!(policy = %policy.name, removed, "product archive policy applied");
            self.dispatch(changes).await;
        }
        Ok(removed)
    }

    async fn product_event_id(
        &self,
        conn: &mut SqliteConnection,
        id: &ProductId,
    ) -> Result<Option<i64>> {
        let mut query = ProductIndexQuery::new();
        query.product_ids = vec![id.clone()];
        query.result_type = ResultType::All;
        let events = self.index.get_events(conn, &query).await?;
        Ok(events.into_iter().next().and_then(|e| e.index_id))
    }

    /// Execute a typed search request against the index.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let mut conn = self.index.pool().acquire().await?;
        let mut response = SearchResponse::default();
        for query in &request.queries {
            let result = match query {
                SearchQuery::EventsSummary(query) => {
                    let events = self.index.get_events(&mut conn, query).await?;
                    SearchResult::EventsSummary(events.iter().map(Event::summary).collect())
                }
                SearchQuery::EventDetail(query) => {
                    SearchResult::EventDetail(self.index.get_events(&mut conn, query).await?)
                }
                SearchQuery::ProductsSummary(query) => {
                    SearchResult::ProductsSummary(self.index.get_products(&mut conn, query).await?)
                }
                SearchQuery::ProductDetail(query) => {
                    let summaries = self.index.get_products(&mut conn, query).await?;
                    let mut products = Vec::with_capacity(summaries.len());
                    for summary in summaries {
                        if let Some(product) = self.storage.get(&summary.id).await? {
                            products.push(product);
                        }
                    }
                    SearchResult::ProductDetail(products)
                }
            };
            response.results.push(result);
        }
        Ok(response)
    }

    async fn dispatch(&self, event: IndexerEvent) {
        if let Some(dispatcher) = &*self.dispatcher.lock().await {
            dispatcher.dispatch(event);
        }
    }

    /// Stop dispatching and wait for queued listener deliveries to drain.
    pub async fn shutdown(&self) {
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            dispatcher.shutdown().await;
        }
    }
}

/// Whether a resubmitted version changes nothing association-relevant.
fn is_redundant(prev: &Option<ProductSummary>, summary: &ProductSummary) -> bool {
    let Some(prev) = prev else {
        return false;
    };
    prev.status == summary.status
        && prev.event_source == summary.event_source
        && prev.event_source_code == summary.event_source_code
        && prev.event_time == summary.event_time
        && prev.event_latitude == summary.event_latitude
        && prev.event_longitude == summary.event_longitude
        && prev.event_depth == summary.event_depth
        && prev.event_magnitude == summary.event_magnitude
        && prev.preferred_weight == summary.preferred_weight
}

/// Deterministically derive a member's preferred weight from the event's
/// current state: trump products, then a property override, then the
/// number of event codes the member's network reports here (minimum 1).
fn derive_weight(event: &Event, member: &ProductSummary) -> i64 {
    let product_type = &member.id.product_type;
    // trump products themselves always weigh 1 so the latest wins
    if product_type == TRUMP_PRODUCT_TYPE || product_type.starts_with(PERSISTENT_TRUMP_PREFIX) {
        return 1;
    }

    // version-specific trump naming this exact version
    for trump in event.products_of_type(TRUMP_PRODUCT_TYPE) {
        let targets = trump
            .links
            .get(TRUMP_PRODUCT_LINK)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let named = targets
            .iter()
            .filter_map(|urn| ProductId::parse(urn))
            .any(|target| target == member.id);
        if named {
            if let Some(weight) = trump
                .properties
                .get(TRUMP_WEIGHT_PROPERTY)
                .and_then(|w| w.parse::<i64>().ok())
            {
                return weight;
            }
        }
    }

    // standing trump for this product type naming this thread
    let trump_type = format!("{}{}", PERSISTENT_TRUMP_PREFIX, product_type);
    if let Some(trump) = event.preferred_product(&trump_type) {
        let source = trump.properties.get(TRUMP_SOURCE_PROPERTY);
        let code = trump.properties.get(TRUMP_CODE_PROPERTY);
        if let (Some(source), Some(code)) = (source, code) {
            if member.id.source.eq_ignore_ascii_case(source)
                && member.id.code.eq_ignore_ascii_case(code)
            {
                return TRUMP_PREFERRED_WEIGHT;
            }
        }
    }

    if let Some(weight) = member
        .properties
        .get(PREFERRED_WEIGHT_PROPERTY)
        .and_then(|w| w.parse::<i64>().ok())
    {
        return weight;
    }

    match &member.event_source {
        Some(source) => event
            .all_event_codes(true)
            .get(&source.to_lowercase())
            .map(|codes| codes.len() as i64)
            .unwrap_or(1)
            .max(1),
        None => 1,
    }
}
