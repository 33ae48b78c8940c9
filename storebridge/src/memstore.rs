//! In-memory store
//!
//! A [`Store`] that keeps everything in process memory. Callbacks run either
//! inline on the calling thread or on a dedicated executor thread; the latter
//! matches a real store, whose completions arrive on a thread the consumer
//! does not own.
//!
//! Handlers are never invoked while the store lock is held, so a handler may
//! call back into the store, for example to stop its own query.
//!
//! Predicates are substring filters on an object's label (sample label,
//! workout activity, document title, summary day, source name).
//! [`Predicate::all`] matches everything.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::catalog::OperationId;
use crate::error::StoreError;
use crate::idgen::{IdGen, QueryId};
use crate::model::{
    ActivitySummary, Correlation, CorrelationType, DeletedObject, DocumentSample, DocumentType,
    ObjectId, ObjectType, Predicate, QuantityType, QueryAnchor, Sample, SampleType,
    SortDescriptor, Source, Statistics, StatisticsCollection, StatisticsOptions, StoredObject,
    Unit, UpdateFrequency, Workout, WorkoutConfiguration,
};
use crate::store::{ObserverAck, OneShot, QueryRequest, Store, NO_LIMIT};

// ============================================================================
// Configuration
// ============================================================================

/// Where store callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Executor {
    /// On the thread that called into the store
    Inline,
    /// On a dedicated thread draining a job queue
    #[default]
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemStoreConfig {
    pub executor: Executor,
    pub thread_name: String,
    /// How many stopped and executed queries stay visible to
    /// [`MemStore::stop_count`] and [`MemStore::executed_queries`].
    pub accounting_window: usize,
}

impl Default for MemStoreConfig {
    fn default() -> Self {
        Self {
            executor: Executor::default(),
            thread_name: "memstore-executor".to_string(),
            accounting_window: 1024,
        }
    }
}

impl MemStoreConfig {
    #[must_use]
    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    #[must_use]
    pub fn with_accounting_window(mut self, accounting_window: usize) -> Self {
        self.accounting_window = accounting_window;
        self
    }
}

// ============================================================================
// Executor
// ============================================================================

type Job = Box<dyn FnOnce() + Send>;

enum Dispatcher {
    Inline,
    Background(mpsc::UnboundedSender<Job>),
}

impl Dispatcher {
    fn start(config: &MemStoreConfig) -> std::io::Result<Self> {
        match config.executor {
            Executor::Inline => Ok(Self::Inline),
            Executor::Background => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                let name = config.thread_name.clone();
                std::thread::Builder::new()
                    .name(config.thread_name.clone())
                    .spawn(move || {
                        while let Some(job) = rx.blocking_recv() {
                            job();
                        }
                        log::debug!("memstore.executor: {name} drained, exiting");
                    })?;
                Ok(Self::Background(tx))
            }
        }
    }

    /// Jobs run in order. A job that cannot be queued is dropped, and with
    /// it any completion it owns.
    fn run(&self, jobs: Vec<Job>) {
        match self {
            Self::Inline => {
                for job in jobs {
                    job();
                }
            }
            Self::Background(tx) => {
                for job in jobs {
                    if tx.send(job).is_err() {
                        log::warn!("memstore.dispatch: executor is gone, job dropped");
                    }
                }
            }
        }
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Registered,
    Running,
}

/// A registered or running query. Stopping removes the entry, so its
/// handlers are released; only the stop count is kept, in `retired`.
struct QueryEntry {
    request: QueryRequest,
    phase: Phase,
    /// Last history position reported to an anchored query.
    delivered: u64,
}

#[derive(Debug, Clone, Copy)]
enum Change {
    Added(ObjectId),
    Deleted(ObjectId),
}

struct HistoryEntry {
    seq: u64,
    object_type: ObjectType,
    change: Change,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Initial,
    Update,
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<ObjectId, StoredObject>,
    history: Vec<HistoryEntry>,
    seq: u64,
    workout_samples: BTreeMap<ObjectId, Vec<ObjectId>>,
    activity: Vec<ActivitySummary>,
    documents: Vec<DocumentSample>,
    correlations: Vec<Correlation>,
    sources: BTreeMap<SampleType, BTreeSet<Source>>,
    units: BTreeMap<QuantityType, Unit>,
    background: BTreeMap<ObjectType, UpdateFrequency>,
    authorized: BTreeSet<ObjectType>,
    watch_app: Option<WorkoutConfiguration>,
    queries: HashMap<QueryId, QueryEntry>,
    /// Stopped queries with their stop counts, oldest first, at most `window`
    retired: VecDeque<(QueryId, usize)>,
    /// Executed queries, oldest first, at most `window`
    executed: VecDeque<QueryId>,
    window: usize,
    failures: HashMap<OperationId, StoreError>,
    query_failure: Option<StoreError>,
    acks: usize,
}

fn matches(predicate: Option<&Predicate>, label: &str) -> bool {
    predicate.map_or(true, |predicate| label.contains(predicate.expression()))
}

fn label(object: &StoredObject) -> &str {
    match object {
        StoredObject::Sample(sample) => &sample.label,
        StoredObject::Workout(workout) => &workout.activity,
    }
}

/// Type a query watches for mutations, if any.
fn watched_type(request: &QueryRequest) -> Option<&ObjectType> {
    match request {
        QueryRequest::Anchored { sample_type, .. } | QueryRequest::Observer { sample_type, .. } => {
            Some(sample_type)
        }
        QueryRequest::StatisticsCollection { quantity_type, .. } => Some(quantity_type),
        QueryRequest::ActivitySummary { .. }
        | QueryRequest::Correlation { .. }
        | QueryRequest::Document { .. }
        | QueryRequest::Sample { .. }
        | QueryRequest::Source { .. }
        | QueryRequest::Statistics { .. } => None,
    }
}

fn warn_unknown_keys(sort: &[SortDescriptor], known: &[&str]) {
    for descriptor in sort {
        if !known.contains(&descriptor.key.as_str()) {
            log::warn!("memstore.sort: unknown key {:?} ignored", descriptor.key);
        }
    }
}

fn sort_by_descriptors<T>(
    items: &mut [T],
    sort: &[SortDescriptor],
    compare: impl Fn(&str, &T, &T) -> Ordering,
) {
    items.sort_by(|a, b| {
        for descriptor in sort {
            let ordering = compare(&descriptor.key, a, b);
            let ordering = if descriptor.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn compare_samples(key: &str, a: &Sample, b: &Sample) -> Ordering {
    match key {
        "value" => a.value.total_cmp(&b.value),
        "start" => a.start.cmp(&b.start),
        "end" => a.end.cmp(&b.end),
        "label" => a.label.cmp(&b.label),
        _ => Ordering::Equal,
    }
}

#[allow(clippy::cast_precision_loss)]
fn aggregate(
    quantity_type: &QuantityType,
    samples: &[Sample],
    options: StatisticsOptions,
) -> Option<Statistics> {
    let start = samples.iter().map(|sample| sample.start).min()?;
    let end = samples.iter().map(|sample| sample.end).max()?;
    let sum: f64 = samples.iter().map(|sample| sample.value).sum();
    Some(Statistics {
        quantity_type: quantity_type.clone(),
        start,
        end,
        average: options.average.then(|| sum / samples.len() as f64),
        min: options
            .min
            .then(|| samples.iter().map(|s| s.value).fold(f64::INFINITY, f64::min)),
        max: options
            .max
            .then(|| samples.iter().map(|s| s.value).fold(f64::NEG_INFINITY, f64::max)),
        sum: options.sum.then_some(sum),
    })
}

/// Buckets samples into `interval`-wide slots starting at `anchor_date`.
/// Samples starting before the anchor are left out.
fn collect_statistics(
    quantity_type: &QuantityType,
    samples: Vec<Sample>,
    options: StatisticsOptions,
    anchor_date: SystemTime,
    interval: Duration,
) -> Result<StatisticsCollection, StoreError> {
    if interval.is_zero() {
        return Err(StoreError::msg("statistics interval must be positive"));
    }
    let mut buckets: BTreeMap<u128, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        let Ok(offset) = sample.start.duration_since(anchor_date) else {
            continue;
        };
        buckets
            .entry(offset.as_nanos() / interval.as_nanos())
            .or_default()
            .push(sample);
    }
    let statistics = buckets
        .iter()
        .filter_map(|(slot, bucket)| {
            let mut statistics = aggregate(quantity_type, bucket, options)?;
            let offset = u32::try_from(*slot)
                .ok()
                .and_then(|slot| interval.checked_mul(slot))?;
            statistics.start = anchor_date.checked_add(offset)?;
            statistics.end = statistics.start.checked_add(interval)?;
            Some(statistics)
        })
        .collect();
    Ok(StatisticsCollection {
        anchor_date,
        interval,
        statistics,
    })
}

impl MemState {
    fn new(config: &MemStoreConfig) -> Self {
        Self {
            window: config.accounting_window,
            ..Self::default()
        }
    }

    fn record(&mut self, object_type: &ObjectType, change: Change) {
        self.seq += 1;
        self.history.push(HistoryEntry {
            seq: self.seq,
            object_type: object_type.clone(),
            change,
        });
    }

    fn insert(&mut self, object: StoredObject, touched: &mut BTreeSet<ObjectType>) {
        let id = object.id();
        self.record(object.object_type(), Change::Added(id));
        touched.insert(object.object_type().clone());
        self.objects.insert(id, object);
    }

    fn remove(&mut self, id: ObjectId, touched: &mut BTreeSet<ObjectType>) -> bool {
        let Some(object) = self.objects.remove(&id) else {
            return false;
        };
        self.record(object.object_type(), Change::Deleted(id));
        touched.insert(object.object_type().clone());
        self.workout_samples.remove(&id);
        true
    }

    fn samples(&self, sample_type: &SampleType, predicate: Option<&Predicate>) -> Vec<Sample> {
        self.objects
            .values()
            .filter_map(|object| match object {
                StoredObject::Sample(sample)
                    if &sample.sample_type == sample_type && matches(predicate, &sample.label) =>
                {
                    Some(sample.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Changes of `sample_type` after history position `since`.
    ///
    /// With a limit, stops before the first sample that does not fit and
    /// returns the position to resume from.
    fn anchored(
        &self,
        sample_type: &SampleType,
        predicate: Option<&Predicate>,
        since: u64,
        limit: usize,
    ) -> (Vec<Sample>, Vec<DeletedObject>, u64) {
        let mut samples: Vec<Sample> = Vec::new();
        let mut deleted = Vec::new();
        let mut reached = self.seq;
        for entry in self
            .history
            .iter()
            .filter(|entry| entry.seq > since && &entry.object_type == sample_type)
        {
            match entry.change {
                Change::Added(id) => {
                    let Some(StoredObject::Sample(sample)) = self.objects.get(&id) else {
                        continue;
                    };
                    if !matches(predicate, &sample.label) || samples.iter().any(|s| s.id == id) {
                        continue;
                    }
                    if limit != NO_LIMIT && samples.len() == limit {
                        reached = entry.seq - 1;
                        break;
                    }
                    samples.push(sample.clone());
                }
                Change::Deleted(id) => deleted.push(DeletedObject { id }),
            }
        }
        (samples, deleted, reached)
    }

    fn activity_summaries(&self, predicate: Option<&Predicate>) -> Vec<ActivitySummary> {
        self.activity
            .iter()
            .filter(|summary| matches(predicate, &summary.day))
            .cloned()
            .collect()
    }

    fn correlations(
        &self,
        correlation_type: &CorrelationType,
        predicate: Option<&Predicate>,
        sample_predicates: Option<&BTreeMap<SampleType, Predicate>>,
    ) -> Vec<Correlation> {
        let any_matches =
            |correlation: &Correlation, sample_type: Option<&SampleType>, predicate: &Predicate| {
                predicate.expression().is_empty()
                    || correlation.objects.iter().any(|sample| {
                        sample_type.map_or(true, |t| &sample.sample_type == t)
                            && matches(Some(predicate), &sample.label)
                    })
            };
        self.correlations
            .iter()
            .filter(|correlation| &correlation.correlation_type == correlation_type)
            .filter(|correlation| predicate.map_or(true, |p| any_matches(correlation, None, p)))
            .filter(|correlation| {
                sample_predicates.map_or(true, |by_type| {
                    by_type
                        .iter()
                        .all(|(sample_type, p)| any_matches(correlation, Some(sample_type), p))
                })
            })
            .cloned()
            .collect()
    }

    fn documents(
        &self,
        document_type: &DocumentType,
        predicate: Option<&Predicate>,
        sort: Option<&[SortDescriptor]>,
        include_data: bool,
    ) -> Vec<DocumentSample> {
        let mut documents: Vec<DocumentSample> = self
            .documents
            .iter()
            .filter(|document| {
                &document.document_type == document_type && matches(predicate, &document.title)
            })
            .cloned()
            .map(|mut document| {
                if !include_data {
                    document.data = None;
                }
                document
            })
            .collect();
        if let Some(sort) = sort {
            warn_unknown_keys(sort, &["title"]);
            sort_by_descriptors(&mut documents, sort, |key, a, b| match key {
                "title" => a.title.cmp(&b.title),
                _ => Ordering::Equal,
            });
        }
        documents
    }

    fn sources(&self, sample_type: &SampleType, predicate: Option<&Predicate>) -> BTreeSet<Source> {
        self.sources
            .get(sample_type)
            .map(|sources| {
                sources
                    .iter()
                    .filter(|source| matches(predicate, &source.name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_running(&self, id: QueryId) -> bool {
        self.queries
            .get(&id)
            .is_some_and(|entry| entry.phase == Phase::Running)
    }

    fn note_executed(&mut self, id: QueryId) {
        self.executed.push_back(id);
        while self.executed.len() > self.window {
            self.executed.pop_front();
        }
    }

    /// Count a stop of a query whose entry was `removed` (or already gone).
    /// Returns the stop count, or `None` for an id the store does not remember.
    fn retire(&mut self, id: QueryId, removed: bool) -> Option<usize> {
        if removed {
            self.retired.push_back((id, 1));
            while self.retired.len() > self.window {
                self.retired.pop_front();
            }
            return Some(1);
        }
        let retired = self.retired.iter_mut().rev().find(|entry| entry.0 == id)?;
        retired.1 += 1;
        Some(retired.1)
    }
}

// ============================================================================
// Store
// ============================================================================

/// Handle of a query registered with a [`MemStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemQuery {
    pub id: QueryId,
}

pub struct MemStore {
    state: Arc<Mutex<MemState>>,
    dispatcher: Dispatcher,
    ids: IdGen,
}

impl MemStore {
    /// Fails only if the executor thread cannot be spawned.
    pub fn new(config: &MemStoreConfig) -> std::io::Result<Self> {
        Ok(Self {
            state: Arc::new(Mutex::new(MemState::new(config))),
            dispatcher: Dispatcher::start(config)?,
            ids: IdGen::new(),
        })
    }

    /// A store whose callbacks run on the calling thread.
    #[must_use]
    pub fn inline() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState::new(&MemStoreConfig::default()))),
            dispatcher: Dispatcher::Inline,
            ids: IdGen::new(),
        }
    }

    pub fn next_object_id(&self) -> ObjectId {
        self.ids.next_object()
    }

    // ------------------------------------------------------------------------
    // Seeding and inspection
    // ------------------------------------------------------------------------

    /// Adds a summary and notifies monitoring activity summary queries.
    pub fn insert_activity_summary(&self, summary: ActivitySummary) {
        let jobs = {
            let mut state = self.state.lock();
            state.activity.push(summary);
            self.monitor_jobs(&mut *state, |request| {
                matches!(request, QueryRequest::ActivitySummary { .. })
            })
        };
        self.dispatcher.run(jobs);
    }

    pub fn insert_document(&self, document: DocumentSample) {
        self.state.lock().documents.push(document);
    }

    pub fn insert_correlation(&self, correlation: Correlation) {
        self.state.lock().correlations.push(correlation);
    }

    pub fn insert_source(&self, sample_type: SampleType, source: Source) {
        self.state
            .lock()
            .sources
            .entry(sample_type)
            .or_default()
            .insert(source);
    }

    pub fn set_preferred_unit(&self, quantity_type: QuantityType, unit: Unit) {
        self.state.lock().units.insert(quantity_type, unit);
    }

    #[must_use]
    pub fn objects_of(&self, object_type: &ObjectType) -> Vec<StoredObject> {
        self.state
            .lock()
            .objects
            .values()
            .filter(|object| object.object_type() == object_type)
            .cloned()
            .collect()
    }

    /// Samples attached to a workout with `add_samples`.
    #[must_use]
    pub fn workout_samples(&self, workout: ObjectId) -> Vec<ObjectId> {
        self.state
            .lock()
            .workout_samples
            .get(&workout)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn background_delivery(&self, object_type: &ObjectType) -> Option<UpdateFrequency> {
        self.state.lock().background.get(object_type).copied()
    }

    #[must_use]
    pub fn is_authorized(&self, object_type: &ObjectType) -> bool {
        self.state.lock().authorized.contains(object_type)
    }

    #[must_use]
    pub fn watch_app(&self) -> Option<WorkoutConfiguration> {
        self.state.lock().watch_app.clone()
    }

    /// Observer updates the consumer has acknowledged.
    #[must_use]
    pub fn acknowledged_updates(&self) -> usize {
        self.state.lock().acks
    }

    // ------------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------------

    /// The next call of `operation` fails with `error` and changes nothing.
    pub fn fail_next(&self, operation: OperationId, error: StoreError) {
        self.state.lock().failures.insert(operation, error);
    }

    /// The next executed query reports `error` instead of its initial results.
    pub fn fail_queries(&self, error: StoreError) {
        self.state.lock().query_failure = Some(error);
    }

    /// Reports `error` to every running monitoring query watching `object_type`.
    pub fn fail_monitors(&self, object_type: &ObjectType, error: &StoreError) {
        let jobs = {
            let state = self.state.lock();
            let mut ids: Vec<QueryId> = state
                .queries
                .iter()
                .filter(|(_, entry)| {
                    entry.phase == Phase::Running
                        && entry.request.monitors_updates()
                        && watched_type(&entry.request) == Some(object_type)
                })
                .map(|(id, _)| *id)
                .collect();
            ids.sort();
            ids.into_iter()
                .filter_map(|id| {
                    let request = &state.queries.get(&id)?.request;
                    self.failure(id, request, Pass::Update, error.clone())
                })
                .collect()
        };
        self.dispatcher.run(jobs);
    }

    // ------------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------------

    /// How many times `stop` was called for the query. Zero for queries that
    /// are still live, and for stopped queries older than the accounting window.
    #[must_use]
    pub fn stop_count(&self, id: QueryId) -> usize {
        self.state
            .lock()
            .retired
            .iter()
            .rev()
            .find(|entry| entry.0 == id)
            .map_or(0, |entry| entry.1)
    }

    /// Executed and not yet stopped.
    #[must_use]
    pub fn active_queries(&self) -> Vec<QueryId> {
        let state = self.state.lock();
        let mut ids: Vec<QueryId> = state
            .queries
            .iter()
            .filter(|(_, entry)| entry.phase == Phase::Running)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Executed queries in execution order, the most recent
    /// `accounting_window` of them.
    #[must_use]
    pub fn executed_queries(&self) -> Vec<QueryId> {
        self.state.lock().executed.iter().copied().collect()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn one_shot<R, F>(&self, operation: OperationId, done: OneShot<R>, apply: F)
    where
        R: Send + 'static,
        F: FnOnce(&mut MemState, &mut BTreeSet<ObjectType>) -> Result<R, StoreError>,
    {
        let mut touched = BTreeSet::new();
        let (outcome, updates) = {
            let mut state = self.state.lock();
            let outcome = match state.failures.remove(&operation) {
                Some(error) => {
                    log::debug!("memstore.{operation}: injected failure");
                    Err(error)
                }
                None => apply(&mut *state, &mut touched),
            };
            let updates = self.monitor_jobs(&mut *state, |request| {
                watched_type(request).is_some_and(|t| touched.contains(t))
            });
            (outcome, updates)
        };
        if let Err(error) = &outcome {
            log::debug!("memstore.{operation}: {error}");
        }
        let completion: Job = Box::new(move || match outcome {
            Ok(value) => done(Some(value), None),
            Err(error) => done(None, Some(error)),
        });
        let mut jobs = Vec::with_capacity(updates.len() + 1);
        jobs.push(completion);
        jobs.extend(updates);
        self.dispatcher.run(jobs);
    }

    /// Wraps a delivery so it is skipped once the query is stopped.
    fn guarded(&self, id: QueryId, deliver: impl FnOnce() + Send + 'static) -> Job {
        let state = Arc::clone(&self.state);
        Box::new(move || {
            let running = state.lock().is_running(id);
            if running {
                deliver();
            } else {
                log::trace!("memstore.deliver: {id} is not running, delivery skipped");
            }
        })
    }

    fn monitor_jobs(
        &self,
        state: &mut MemState,
        affects: impl Fn(&QueryRequest) -> bool,
    ) -> Vec<Job> {
        let mut ids: Vec<QueryId> = state
            .queries
            .iter()
            .filter(|(_, entry)| {
                entry.phase == Phase::Running
                    && entry.request.monitors_updates()
                    && affects(&entry.request)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        let mut jobs = Vec::new();
        for id in ids {
            jobs.extend(self.deliveries(state, id, Pass::Update));
        }
        jobs
    }

    /// Computes what a query reports now and wraps it into jobs.
    #[allow(clippy::too_many_lines)]
    fn deliveries(&self, state: &mut MemState, id: QueryId, pass: Pass) -> Vec<Job> {
        let Some(entry) = state.queries.get(&id) else {
            return Vec::new();
        };
        let request = entry.request.clone();
        let delivered = entry.delivered;
        let initial = pass == Pass::Initial;
        let mut jobs = Vec::new();
        match request {
            QueryRequest::ActivitySummary {
                predicate,
                results,
                updates,
            } => {
                if let Some(handler) = if initial { Some(results) } else { updates } {
                    let summaries = state.activity_summaries(predicate.as_ref());
                    jobs.push(self.guarded(id, move || handler(Some(summaries), None)));
                }
            }
            QueryRequest::Anchored {
                sample_type,
                predicate,
                anchor,
                limit,
                results,
                updates,
            } => {
                if let Some(handler) = if initial { Some(results) } else { updates } {
                    let since = if initial {
                        anchor.map_or(0, |anchor| anchor.0)
                    } else {
                        delivered
                    };
                    let (samples, deleted, reached) =
                        state.anchored(&sample_type, predicate.as_ref(), since, limit);
                    if let Some(entry) = state.queries.get_mut(&id) {
                        entry.delivered = reached;
                    }
                    jobs.push(self.guarded(id, move || {
                        handler(
                            Some(samples),
                            Some(deleted),
                            Some(QueryAnchor(reached)),
                            None,
                        );
                    }));
                }
            }
            QueryRequest::Correlation {
                correlation_type,
                predicate,
                sample_predicates,
                results,
            } if initial => {
                let correlations = state.correlations(
                    &correlation_type,
                    predicate.as_ref(),
                    sample_predicates.as_ref(),
                );
                jobs.push(self.guarded(id, move || results(Some(correlations), None)));
            }
            QueryRequest::Document {
                document_type,
                predicate,
                limit,
                sort,
                include_data,
                results,
            } if initial => {
                let documents = state.documents(
                    &document_type,
                    predicate.as_ref(),
                    sort.as_deref(),
                    include_data,
                );
                if documents.is_empty() {
                    jobs.push(self.guarded(id, move || results(Some(Vec::new()), true, None)));
                } else {
                    let size = if limit == NO_LIMIT {
                        documents.len()
                    } else {
                        limit
                    };
                    let batches = documents.len().div_ceil(size);
                    for (index, batch) in documents.chunks(size).enumerate() {
                        let batch = batch.to_vec();
                        let done = index + 1 == batches;
                        let handler = Arc::clone(&results);
                        jobs.push(self.guarded(id, move || handler(Some(batch), done, None)));
                    }
                }
            }
            QueryRequest::Observer { updates, .. } => {
                let state = Arc::clone(&self.state);
                let ack: ObserverAck = Box::new(move || state.lock().acks += 1);
                jobs.push(self.guarded(id, move || updates(ack, None)));
            }
            QueryRequest::Sample {
                sample_type,
                predicate,
                limit,
                sort,
                results,
            } if initial => {
                let mut samples = state.samples(&sample_type, predicate.as_ref());
                if let Some(sort) = sort.as_deref() {
                    warn_unknown_keys(sort, &["value", "start", "end", "label"]);
                    sort_by_descriptors(&mut samples, sort, compare_samples);
                }
                if limit != NO_LIMIT {
                    samples.truncate(limit);
                }
                jobs.push(self.guarded(id, move || results(Some(samples), None)));
            }
            QueryRequest::Source {
                sample_type,
                predicate,
                results,
            } if initial => {
                let sources = state.sources(&sample_type, predicate.as_ref());
                jobs.push(self.guarded(id, move || results(Some(sources), None)));
            }
            QueryRequest::StatisticsCollection {
                quantity_type,
                predicate,
                options,
                anchor_date,
                interval,
                initial: first,
                updates,
            } => {
                if let Some(handler) = if initial { Some(first) } else { updates } {
                    let samples = state.samples(&quantity_type, predicate.as_ref());
                    let collection =
                        collect_statistics(&quantity_type, samples, options, anchor_date, interval);
                    jobs.push(self.guarded(id, move || match collection {
                        Ok(collection) => handler(Some(collection), None),
                        Err(error) => handler(None, Some(error)),
                    }));
                }
            }
            QueryRequest::Statistics {
                quantity_type,
                predicate,
                options,
                results,
            } if initial => {
                let samples = state.samples(&quantity_type, predicate.as_ref());
                let statistics = aggregate(&quantity_type, &samples, options);
                jobs.push(self.guarded(id, move || results(statistics, None)));
            }
            QueryRequest::Correlation { .. }
            | QueryRequest::Document { .. }
            | QueryRequest::Sample { .. }
            | QueryRequest::Source { .. }
            | QueryRequest::Statistics { .. } => {}
        }
        jobs
    }

    /// Reports `error` through the handler `pass` would use, if there is one.
    fn failure(
        &self,
        id: QueryId,
        request: &QueryRequest,
        pass: Pass,
        error: StoreError,
    ) -> Option<Job> {
        let initial = pass == Pass::Initial;
        let deliver: Job = match request {
            QueryRequest::ActivitySummary {
                results, updates, ..
            } => {
                let handler = if initial {
                    Arc::clone(results)
                } else {
                    Arc::clone(updates.as_ref()?)
                };
                Box::new(move || handler(None, Some(error)))
            }
            QueryRequest::Anchored {
                results, updates, ..
            } => {
                let handler = if initial {
                    Arc::clone(results)
                } else {
                    Arc::clone(updates.as_ref()?)
                };
                Box::new(move || handler(None, None, None, Some(error)))
            }
            QueryRequest::StatisticsCollection {
                initial: first,
                updates,
                ..
            } => {
                let handler = if initial {
                    Arc::clone(first)
                } else {
                    Arc::clone(updates.as_ref()?)
                };
                Box::new(move || handler(None, Some(error)))
            }
            QueryRequest::Observer { updates, .. } => {
                let handler = Arc::clone(updates);
                Box::new(move || handler(Box::new(|| {}), Some(error)))
            }
            QueryRequest::Correlation { results, .. } if initial => {
                let handler = Arc::clone(results);
                Box::new(move || handler(None, Some(error)))
            }
            QueryRequest::Document { results, .. } if initial => {
                let handler = Arc::clone(results);
                Box::new(move || handler(None, false, Some(error)))
            }
            QueryRequest::Sample { results, .. } if initial => {
                let handler = Arc::clone(results);
                Box::new(move || handler(None, Some(error)))
            }
            QueryRequest::Source { results, .. } if initial => {
                let handler = Arc::clone(results);
                Box::new(move || handler(None, Some(error)))
            }
            QueryRequest::Statistics { results, .. } if initial => {
                let handler = Arc::clone(results);
                Box::new(move || handler(None, Some(error)))
            }
            QueryRequest::Correlation { .. }
            | QueryRequest::Document { .. }
            | QueryRequest::Sample { .. }
            | QueryRequest::Source { .. }
            | QueryRequest::Statistics { .. } => return None,
        };
        Some(self.guarded(id, deliver))
    }
}

impl Store for MemStore {
    type Query = MemQuery;

    fn save(&self, objects: Vec<StoredObject>, done: OneShot<bool>) {
        self.one_shot(OperationId::Save, done, |state, touched| {
            for object in objects {
                state.insert(object, touched);
            }
            Ok(true)
        });
    }

    fn delete(&self, objects: Vec<StoredObject>, done: OneShot<bool>) {
        self.one_shot(OperationId::Delete, done, |state, touched| {
            if let Some(missing) = objects
                .iter()
                .find(|object| !state.objects.contains_key(&object.id()))
            {
                return Err(StoreError::msg(format!("object {} not found", missing.id())));
            }
            for object in &objects {
                state.remove(object.id(), touched);
            }
            Ok(true)
        });
    }

    fn delete_objects(
        &self,
        object_type: ObjectType,
        predicate: Predicate,
        done: OneShot<(bool, usize)>,
    ) {
        self.one_shot(OperationId::DeleteObjects, done, |state, touched| {
            let doomed: Vec<ObjectId> = state
                .objects
                .values()
                .filter(|object| {
                    object.object_type() == &object_type && matches(Some(&predicate), label(object))
                })
                .map(StoredObject::id)
                .collect();
            let count = doomed
                .into_iter()
                .filter(|id| state.remove(*id, touched))
                .count();
            Ok((true, count))
        });
    }

    fn add_samples(&self, samples: Vec<Sample>, workout: Workout, done: OneShot<bool>) {
        self.one_shot(OperationId::AddSamples, done, |state, touched| {
            if !matches!(state.objects.get(&workout.id), Some(StoredObject::Workout(_))) {
                return Err(StoreError::msg(format!("workout {} not found", workout.id)));
            }
            let ids: Vec<ObjectId> = samples.iter().map(|sample| sample.id).collect();
            for sample in samples {
                state.insert(StoredObject::Sample(sample), touched);
            }
            state.workout_samples.entry(workout.id).or_default().extend(ids);
            Ok(true)
        });
    }

    fn enable_background_delivery(
        &self,
        object_type: ObjectType,
        frequency: UpdateFrequency,
        done: OneShot<bool>,
    ) {
        self.one_shot(OperationId::EnableBackgroundDelivery, done, |state, _| {
            state.background.insert(object_type, frequency);
            Ok(true)
        });
    }

    fn disable_background_delivery(&self, object_type: ObjectType, done: OneShot<bool>) {
        self.one_shot(OperationId::DisableBackgroundDelivery, done, |state, _| {
            state.background.remove(&object_type);
            Ok(true)
        });
    }

    fn disable_all_background_delivery(&self, done: OneShot<bool>) {
        self.one_shot(OperationId::DisableAllBackgroundDelivery, done, |state, _| {
            state.background.clear();
            Ok(true)
        });
    }

    fn preferred_units(
        &self,
        quantity_types: BTreeSet<QuantityType>,
        done: OneShot<BTreeMap<QuantityType, Unit>>,
    ) {
        self.one_shot(OperationId::PreferredUnits, done, |state, _| {
            quantity_types
                .into_iter()
                .map(|quantity_type| match state.units.get(&quantity_type) {
                    Some(unit) => Ok((quantity_type, unit.clone())),
                    None => Err(StoreError::msg(format!(
                        "no preferred unit for {quantity_type}"
                    ))),
                })
                .collect()
        });
    }

    fn request_authorization(
        &self,
        share: Option<BTreeSet<SampleType>>,
        read: Option<BTreeSet<ObjectType>>,
        done: OneShot<bool>,
    ) {
        self.one_shot(OperationId::RequestAuthorization, done, |state, _| {
            let requested: BTreeSet<ObjectType> =
                share.into_iter().chain(read).flatten().collect();
            if requested.is_empty() {
                return Err(StoreError::msg("nothing to authorize"));
            }
            state.authorized.extend(requested);
            Ok(true)
        });
    }

    fn start_watch_app(&self, configuration: WorkoutConfiguration, done: OneShot<bool>) {
        self.one_shot(OperationId::StartWatchApp, done, |state, _| {
            state.watch_app = Some(configuration);
            Ok(true)
        });
    }

    fn make_query(&self, request: QueryRequest) -> MemQuery {
        let id = self.ids.next_query();
        log::debug!("memstore.make_query: {id} {request:?}");
        self.state.lock().queries.insert(
            id,
            QueryEntry {
                request,
                phase: Phase::Registered,
                delivered: 0,
            },
        );
        MemQuery { id }
    }

    fn execute(&self, query: &MemQuery) {
        let jobs = {
            let mut state = self.state.lock();
            let Some(entry) = state.queries.get_mut(&query.id) else {
                log::warn!("memstore.execute: unknown query {}", query.id);
                return;
            };
            if entry.phase != Phase::Registered {
                log::warn!("memstore.execute: {} is {:?}, ignored", query.id, entry.phase);
                return;
            }
            entry.phase = Phase::Running;
            let request = entry.request.clone();
            state.note_executed(query.id);
            match state.query_failure.take() {
                Some(error) => {
                    log::debug!("memstore.execute: {} fails with injected error", query.id);
                    self.failure(query.id, &request, Pass::Initial, error)
                        .into_iter()
                        .collect()
                }
                None => self.deliveries(&mut *state, query.id, Pass::Initial),
            }
        };
        self.dispatcher.run(jobs);
    }

    fn stop(&self, query: &MemQuery) {
        let mut state = self.state.lock();
        let entry = state.queries.remove(&query.id);
        match state.retire(query.id, entry.is_some()) {
            Some(stops) => log::debug!("memstore.stop: {} (stop #{stops})", query.id),
            None => log::warn!("memstore.stop: unknown query {}", query.id),
        }
        // Handlers are released outside the store lock
        drop(state);
        drop(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AnchoredHandler, DocumentHandler, QueryHandler};
    use std::time::UNIX_EPOCH;

    fn steps() -> ObjectType {
        ObjectType::new("step_count")
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn sample(store: &MemStore, label: &str, value: f64, start: u64) -> Sample {
        Sample {
            id: store.next_object_id(),
            sample_type: steps(),
            label: label.to_string(),
            value,
            start: at(start),
            end: at(start + 60),
        }
    }

    fn save(store: &MemStore, samples: &[Sample]) {
        let objects = samples.iter().cloned().map(StoredObject::Sample).collect();
        store.save(objects, Box::new(|ok: Option<bool>, error: Option<StoreError>| {
            assert_eq!(ok, Some(true));
            assert!(error.is_none());
        }));
    }

    type Seen<T> = Arc<Mutex<Vec<Result<T, StoreError>>>>;

    fn recorder<T: Send + 'static>() -> (Seen<T>, QueryHandler<T>) {
        let seen: Seen<T> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: QueryHandler<T> = Arc::new(move |payload: Option<T>, error: Option<StoreError>| {
            sink.lock().push(match error {
                Some(error) => Err(error),
                None => payload.ok_or_else(StoreError::missing_payload),
            });
        });
        (seen, handler)
    }

    #[test]
    fn test_sample_query_filters_sorts_and_limits() {
        let store = MemStore::inline();
        save(
            &store,
            &[
                sample(&store, "walk", 10.0, 0),
                sample(&store, "run", 30.0, 100),
                sample(&store, "walk home", 20.0, 200),
            ],
        );
        let (seen, results) = recorder::<Vec<Sample>>();
        let query = store.make_query(QueryRequest::Sample {
            sample_type: steps(),
            predicate: Some(Predicate::new("walk")),
            limit: 1,
            sort: Some(vec![SortDescriptor::descending("value")]),
            results,
        });
        store.execute(&query);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let samples = seen[0].as_ref().expect("results");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label, "walk home");
    }

    #[test]
    fn test_anchored_monitor_reports_only_new_changes() {
        let store = MemStore::inline();
        let first = sample(&store, "a", 1.0, 0);
        save(&store, &[first.clone()]);

        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let handler: AnchoredHandler = Arc::new(
            move |samples: Option<Vec<Sample>>,
                  deleted: Option<Vec<DeletedObject>>,
                  anchor: Option<QueryAnchor>,
                  error: Option<StoreError>| {
                assert!(error.is_none());
                sink.lock().push((
                    samples.unwrap_or_default(),
                    deleted.unwrap_or_default(),
                    anchor,
                ));
            },
        );
        let query = store.make_query(QueryRequest::Anchored {
            sample_type: steps(),
            predicate: None,
            anchor: None,
            limit: NO_LIMIT,
            results: Arc::clone(&handler),
            updates: Some(handler),
        });
        store.execute(&query);

        let second = sample(&store, "b", 2.0, 10);
        save(&store, &[second.clone()]);
        store.delete(
            vec![StoredObject::Sample(first.clone())],
            Box::new(|ok: Option<bool>, _| assert_eq!(ok, Some(true))),
        );

        {
            let batches = batches.lock();
            assert_eq!(batches.len(), 3);
            assert_eq!(batches[0].0, vec![first.clone()]);
            assert_eq!(batches[1].0, vec![second]);
            assert!(batches[1].1.is_empty());
            assert!(batches[2].0.is_empty());
            assert_eq!(batches[2].1, vec![DeletedObject { id: first.id }]);
            assert!(batches[1].2 < batches[2].2);
        }

        store.stop(&query);
        save(&store, &[sample(&store, "c", 3.0, 20)]);
        assert_eq!(batches.lock().len(), 3);
        assert_eq!(store.stop_count(query.id), 1);
        assert!(store.active_queries().is_empty());
    }

    #[test]
    fn test_anchored_limit_resumes_from_reported_position() {
        let store = MemStore::inline();
        save(
            &store,
            &[
                sample(&store, "a", 1.0, 0),
                sample(&store, "b", 2.0, 1),
                sample(&store, "c", 3.0, 2),
            ],
        );
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let run = |anchor: Option<QueryAnchor>| {
            let sink = Arc::clone(&sink);
            let query = store.make_query(QueryRequest::Anchored {
                sample_type: steps(),
                predicate: None,
                anchor,
                limit: 2,
                results: Arc::new(
                    move |samples: Option<Vec<Sample>>,
                          _: Option<Vec<DeletedObject>>,
                          anchor: Option<QueryAnchor>,
                          _: Option<StoreError>| {
                        sink.lock().push((samples.unwrap_or_default(), anchor));
                    },
                ),
                updates: None,
            });
            store.execute(&query);
        };
        run(None);
        let resume = batches.lock()[0].1;
        run(resume);

        let batches = batches.lock();
        let labels = |i: usize| -> Vec<String> {
            batches[i].0.iter().map(|s| s.label.clone()).collect()
        };
        assert_eq!(labels(0), ["a", "b"]);
        assert_eq!(labels(1), ["c"]);
    }

    #[test]
    fn test_documents_arrive_in_batches_with_done_on_last() {
        let store = MemStore::inline();
        for title in ["c", "a", "b"] {
            store.insert_document(DocumentSample {
                id: store.next_object_id(),
                document_type: ObjectType::new("cda"),
                title: title.to_string(),
                data: Some(vec![1, 2, 3]),
            });
        }
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let results: DocumentHandler = Arc::new(
            move |documents: Option<Vec<DocumentSample>>, done: bool, _: Option<StoreError>| {
                let titles: Vec<String> = documents
                    .unwrap_or_default()
                    .into_iter()
                    .inspect(|d| assert!(d.data.is_none()))
                    .map(|d| d.title)
                    .collect();
                sink.lock().push((titles, done));
            },
        );
        let query = store.make_query(QueryRequest::Document {
            document_type: ObjectType::new("cda"),
            predicate: None,
            limit: 2,
            sort: Some(vec![SortDescriptor::ascending("title")]),
            include_data: false,
            results,
        });
        store.execute(&query);

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], (vec!["a".to_string(), "b".to_string()], false));
        assert_eq!(batches[1], (vec!["c".to_string()], true));
    }

    #[test]
    fn test_statistics_collection_buckets_by_interval() {
        let store = MemStore::inline();
        save(
            &store,
            &[
                sample(&store, "a", 1.0, 10),
                sample(&store, "b", 2.0, 20),
                sample(&store, "c", 5.0, 3700),
            ],
        );
        let (seen, initial) = recorder::<StatisticsCollection>();
        let query = store.make_query(QueryRequest::StatisticsCollection {
            quantity_type: steps(),
            predicate: None,
            options: StatisticsOptions {
                sum: true,
                max: true,
                ..StatisticsOptions::default()
            },
            anchor_date: at(0),
            interval: Duration::from_secs(3600),
            initial,
            updates: None,
        });
        store.execute(&query);

        let seen = seen.lock();
        let collection = seen[0].as_ref().expect("collection");
        assert_eq!(collection.statistics.len(), 2);
        assert_eq!(collection.statistics[0].sum, Some(3.0));
        assert_eq!(collection.statistics[0].max, Some(2.0));
        assert_eq!(collection.statistics[0].average, None);
        assert_eq!(collection.statistics[1].start, at(3600));
        assert_eq!(collection.statistics[1].sum, Some(5.0));
    }

    #[test]
    fn test_zero_interval_is_an_error() {
        let store = MemStore::inline();
        let (seen, initial) = recorder::<StatisticsCollection>();
        let query = store.make_query(QueryRequest::StatisticsCollection {
            quantity_type: steps(),
            predicate: None,
            options: StatisticsOptions::sum(),
            anchor_date: at(0),
            interval: Duration::ZERO,
            initial,
            updates: None,
        });
        store.execute(&query);
        assert!(seen.lock()[0].is_err());
    }

    #[test]
    fn test_injected_one_shot_failure_changes_nothing() {
        let store = MemStore::inline();
        store.fail_next(OperationId::Save, StoreError::msg("disk full"));
        let outcome = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&outcome);
        store.save(
            vec![StoredObject::Sample(sample(&store, "a", 1.0, 0))],
            Box::new(move |ok: Option<bool>, error: Option<StoreError>| {
                *sink.lock() = Some((ok, error.map(|e| e.to_string())));
            }),
        );
        assert_eq!(*outcome.lock(), Some((None, Some("disk full".to_string()))));
        assert!(store.objects_of(&steps()).is_empty());

        save(&store, &[sample(&store, "b", 1.0, 0)]);
        assert_eq!(store.objects_of(&steps()).len(), 1);
    }

    #[test]
    fn test_injected_query_failure_reaches_initial_handler() {
        let store = MemStore::inline();
        store.fail_queries(StoreError::msg("not authorized"));
        let (seen, results) = recorder::<BTreeSet<Source>>();
        let query = store.make_query(QueryRequest::Source {
            sample_type: steps(),
            predicate: None,
            results,
        });
        store.execute(&query);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_err());
        assert_eq!(store.executed_queries(), vec![query.id]);
    }

    #[test]
    fn test_observer_fires_on_mutation_and_counts_acks() {
        let store = MemStore::inline();
        let fired = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&fired);
        let query = store.make_query(QueryRequest::Observer {
            sample_type: steps(),
            predicate: None,
            updates: Arc::new(move |ack: ObserverAck, error: Option<StoreError>| {
                assert!(error.is_none());
                *sink.lock() += 1;
                ack();
            }),
        });
        store.execute(&query);
        save(&store, &[sample(&store, "a", 1.0, 0)]);
        store.save(
            vec![StoredObject::Sample(Sample {
                sample_type: ObjectType::new("heart_rate"),
                ..sample(&store, "hr", 60.0, 0)
            })],
            Box::new(|_, _| {}),
        );
        // execute plus the step_count save; heart_rate is not watched
        assert_eq!(*fired.lock(), 2);
        assert_eq!(store.acknowledged_updates(), 2);
    }

    #[test]
    fn test_handler_may_stop_its_own_query() {
        let store = Arc::new(MemStore::inline());
        let query_slot: Arc<Mutex<Option<MemQuery>>> = Arc::new(Mutex::new(None));
        let (store2, slot2) = (Arc::clone(&store), Arc::clone(&query_slot));
        let query = store.make_query(QueryRequest::ActivitySummary {
            predicate: None,
            results: Arc::new(move |_: Option<Vec<ActivitySummary>>, _: Option<StoreError>| {
                if let Some(query) = *slot2.lock() {
                    store2.stop(&query);
                }
            }),
            updates: None,
        });
        *query_slot.lock() = Some(query);
        store.execute(&query);
        assert_eq!(store.stop_count(query.id), 1);
    }

    #[test]
    fn test_add_samples_requires_saved_workout() {
        let store = MemStore::inline();
        let workout = Workout {
            id: store.next_object_id(),
            workout_type: ObjectType::new("workout"),
            activity: "running".to_string(),
            start: at(0),
            end: at(600),
        };
        let failed = Arc::new(Mutex::new(false));
        let sink = Arc::clone(&failed);
        store.add_samples(
            vec![sample(&store, "a", 1.0, 0)],
            workout.clone(),
            Box::new(move |_: Option<bool>, error: Option<StoreError>| {
                *sink.lock() = error.is_some();
            }),
        );
        assert!(*failed.lock());

        store.save(vec![StoredObject::Workout(workout.clone())], Box::new(|_, _| {}));
        let attached = sample(&store, "b", 1.0, 0);
        store.add_samples(vec![attached.clone()], workout.clone(), Box::new(|_, _| {}));
        assert_eq!(store.workout_samples(workout.id), vec![attached.id]);
    }

    #[test]
    fn test_background_executor_runs_callbacks_on_its_thread() {
        let config = MemStoreConfig::default().with_thread_name("store-test-thread");
        let store = MemStore::new(&config).expect("spawn executor");
        let (tx, rx) = std::sync::mpsc::channel();
        store.request_authorization(
            Some(BTreeSet::from([steps()])),
            None,
            Box::new(move |ok: Option<bool>, _: Option<StoreError>| {
                let name = std::thread::current().name().map(str::to_string);
                tx.send((ok, name)).expect("receiver alive");
            }),
        );
        let (ok, name) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("callback ran");
        assert_eq!(ok, Some(true));
        assert_eq!(name.as_deref(), Some("store-test-thread"));
        assert!(store.is_authorized(&steps()));
    }
    #[test]
    fn test_stopped_queries_release_handlers_within_accounting_window() {
        let config = MemStoreConfig::default()
            .with_executor(Executor::Inline)
            .with_accounting_window(2);
        let store = MemStore::new(&config).expect("inline store");
        save(&store, &[sample(&store, "a", 1.0, 0)]);

        let mut handlers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let (_, results) = recorder::<Vec<Sample>>();
            handlers.push(Arc::downgrade(&results));
            let query = store.make_query(QueryRequest::Sample {
                sample_type: steps(),
                predicate: None,
                limit: NO_LIMIT,
                sort: None,
                results,
            });
            store.execute(&query);
            store.stop(&query);
            ids.push(query.id);
        }
        store.stop(&MemQuery { id: ids[3] });

        let state = store.state.lock();
        assert!(state.queries.is_empty());
        assert_eq!(state.retired.len(), 2);
        drop(state);
        assert!(handlers.iter().all(|handler| handler.upgrade().is_none()));

        assert_eq!(store.stop_count(ids[0]), 0);
        assert_eq!(store.stop_count(ids[2]), 1);
        assert_eq!(store.stop_count(ids[3]), 2);
        assert_eq!(store.executed_queries(), ids[2..].to_vec());
        assert!(store.active_queries().is_empty());
    }
}
