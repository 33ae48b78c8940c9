//! Operation dispatcher
//!
//! Each public method wires one store operation into a bridge. All race and
//! lifecycle handling lives in [`Deferred`] and [`LiveQuery`]; the helpers
//! here only pick the bridge from the catalog entry, map payloads, and tag
//! errors with the operation id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::{BoxFuture, FutureExt, TryFutureExt};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tracing::debug;

use super::{entry, CallShape, Delivery, OperationId};
use crate::deferred::{Completion, Deferred};
use crate::error::{OperationError, StoreError};
use crate::live::{LiveQuery, QueryMode, ResultHandler};
use crate::model::{
    ActivitySummary, AnchoredBatch, Correlation, CorrelationType, DeletedObject, DocumentSample,
    DocumentType, ObjectType, Predicate, QuantityType, QueryAnchor, Sample, SampleType,
    SortDescriptor, Source, Statistics, StatisticsCollection, StatisticsOptions, StoredObject,
    Unit, UpdateFrequency, Workout, WorkoutConfiguration,
};
use crate::store::{
    AnchoredHandler, DocumentHandler, ObserverAck, ObserverHandler, OneShot, QueryHandler,
    QueryRequest, Store,
};

/// Lazy single result of an operation.
pub type OperationResult<T> = BoxFuture<'static, Result<T, OperationError>>;

/// Stream of results of an operation. Dropping it stops the store query.
pub type OperationStream<T> = BoxStream<'static, Result<T, OperationError>>;

// ============================================================================
// Payload mapping
// ============================================================================

/// Forward the store's `(payload?, error?)` as is.
fn passthrough<T: Send + 'static>(done: Completion<T>) -> OneShot<T> {
    Box::new(move |payload, error| done.resolve(payload, error))
}

/// A missing payload is an empty value, not an error.
fn or_default<T: Default + Send + 'static>(done: Completion<T>) -> OneShot<T> {
    Box::new(move |payload: Option<T>, error: Option<StoreError>| {
        done.resolve(Some(payload.unwrap_or_default()), error);
    })
}

/// Query handler where a missing collection means "no results".
fn or_empty<C: Default + Send + 'static>(handler: ResultHandler<C>) -> QueryHandler<C> {
    Arc::new(move |payload: Option<C>, error: Option<StoreError>| {
        handler.handle(Some(payload.unwrap_or_default()), error);
    })
}

/// Query handler where absence is itself a result.
fn optional<R: Send + 'static>(handler: ResultHandler<Option<R>>) -> QueryHandler<R> {
    Arc::new(move |payload: Option<R>, error: Option<StoreError>| match error {
        Some(error) => handler.fail(error),
        None => handler.emit(payload),
    })
}

fn anchored(handler: ResultHandler<AnchoredBatch>) -> AnchoredHandler {
    Arc::new(
        move |samples: Option<Vec<Sample>>,
              deleted: Option<Vec<DeletedObject>>,
              anchor: Option<QueryAnchor>,
              error: Option<StoreError>| {
            match error {
                Some(error) => handler.fail(error),
                None => handler.emit(AnchoredBatch {
                    samples: samples.unwrap_or_default(),
                    deleted: deleted.unwrap_or_default(),
                    anchor,
                }),
            }
        },
    )
}

/// The store's `done` flag marks the last batch.
fn documents(handler: ResultHandler<Vec<DocumentSample>>) -> DocumentHandler {
    Arc::new(
        move |batch: Option<Vec<DocumentSample>>, done: bool, error: Option<StoreError>| {
            match error {
                Some(error) => handler.fail(error),
                None if done => handler.finish(batch.unwrap_or_default()),
                None => handler.emit(batch.unwrap_or_default()),
            }
        },
    )
}

fn observer(handler: ResultHandler<()>, background_updates: bool) -> ObserverHandler {
    Arc::new(move |ack: ObserverAck, error: Option<StoreError>| match error {
        Some(error) => handler.fail(error),
        None => {
            handler.emit(());
            if background_updates {
                ack();
            }
        }
    })
}

// ============================================================================
// Operations
// ============================================================================

/// Reactive front of a [`Store`].
///
/// Cheap to clone; every result borrows nothing from `self`, so futures and
/// streams can outlive it.
pub struct Operations<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for Operations<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> Operations<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn one_shot<T, F>(&self, id: OperationId, call: F) -> OperationResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&S, Completion<T>) + Send + 'static,
    {
        debug_assert_eq!(entry(id).shape, CallShape::OneShot, "{id}");
        let store = Arc::clone(&self.store);
        Deferred::new(move |done| {
            debug!(operation = %id, "invoking store");
            call(&store, done);
        })
        .map_err(move |source| OperationError::new(id, source))
        .boxed()
    }

    fn live<T, B>(&self, id: OperationId, mode: QueryMode, build: B) -> LiveQuery<T>
    where
        T: Send + 'static,
        B: FnOnce(ResultHandler<T>, QueryMode) -> QueryRequest + Send + 'static,
    {
        debug_assert_eq!(entry(id).shape, CallShape::Query, "{id}");
        let (maker, runner, stopper) = (
            Arc::clone(&self.store),
            Arc::clone(&self.store),
            Arc::clone(&self.store),
        );
        LiveQuery::new(
            mode,
            move |handler| {
                let request = build(handler, mode);
                debug!(operation = %id, ?mode, kind = request.kind(), "building store query");
                maker.make_query(request)
            },
            move |query| runner.execute(query),
            move |query| stopper.stop(query),
        )
    }

    /// Query delivered as a stream, in the mode the catalog allows.
    fn stream<T, B>(
        &self,
        id: OperationId,
        requested: Option<QueryMode>,
        build: B,
    ) -> OperationStream<T>
    where
        T: Send + 'static,
        B: FnOnce(ResultHandler<T>, QueryMode) -> QueryRequest + Send + 'static,
    {
        let entry = entry(id);
        debug_assert_eq!(entry.delivery, Delivery::Stream, "{id}");
        self.live(id, entry.resolve_mode(requested), build)
            .map_err(move |source| OperationError::new(id, source))
            .boxed()
    }

    /// Point-in-time query delivered as a single result.
    ///
    /// Runs as a single-shot live query, so the handle is stopped once the
    /// result arrives or the future is dropped.
    fn query_once<T, B>(&self, id: OperationId, build: B) -> OperationResult<T>
    where
        T: Send + 'static,
        B: FnOnce(ResultHandler<T>, QueryMode) -> QueryRequest + Send + 'static,
    {
        let entry = entry(id);
        debug_assert_eq!(entry.delivery, Delivery::Deferred, "{id}");
        let mut query = self.live(id, entry.resolve_mode(None), build);
        async move {
            match query.next().await {
                Some(outcome) => outcome,
                None => Err(StoreError::abandoned()),
            }
        }
        .map_err(move |source| OperationError::new(id, source))
        .boxed()
    }

    // ------------------------------------------------------------------------
    // One-shot operations
    // ------------------------------------------------------------------------

    pub fn save(&self, object: StoredObject) -> OperationResult<bool> {
        self.save_all(vec![object])
    }

    pub fn save_all(&self, objects: Vec<StoredObject>) -> OperationResult<bool> {
        self.one_shot(OperationId::Save, move |store, done| {
            store.save(objects, passthrough(done));
        })
    }

    pub fn delete(&self, object: StoredObject) -> OperationResult<bool> {
        self.delete_all(vec![object])
    }

    pub fn delete_all(&self, objects: Vec<StoredObject>) -> OperationResult<bool> {
        self.one_shot(OperationId::Delete, move |store, done| {
            store.delete(objects, passthrough(done));
        })
    }

    /// Resolves to `(success, deleted count)`.
    pub fn delete_objects(
        &self,
        object_type: ObjectType,
        predicate: Predicate,
    ) -> OperationResult<(bool, usize)> {
        self.one_shot(OperationId::DeleteObjects, move |store, done| {
            store.delete_objects(object_type, predicate, passthrough(done));
        })
    }

    pub fn add_samples(&self, samples: Vec<Sample>, workout: Workout) -> OperationResult<bool> {
        self.one_shot(OperationId::AddSamples, move |store, done| {
            store.add_samples(samples, workout, passthrough(done));
        })
    }

    pub fn enable_background_delivery(
        &self,
        object_type: ObjectType,
        frequency: UpdateFrequency,
    ) -> OperationResult<bool> {
        self.one_shot(OperationId::EnableBackgroundDelivery, move |store, done| {
            store.enable_background_delivery(object_type, frequency, passthrough(done));
        })
    }

    pub fn disable_background_delivery(&self, object_type: ObjectType) -> OperationResult<bool> {
        self.one_shot(OperationId::DisableBackgroundDelivery, move |store, done| {
            store.disable_background_delivery(object_type, passthrough(done));
        })
    }

    pub fn disable_all_background_delivery(&self) -> OperationResult<bool> {
        self.one_shot(OperationId::DisableAllBackgroundDelivery, |store, done| {
            store.disable_all_background_delivery(passthrough(done));
        })
    }

    pub fn preferred_units(
        &self,
        quantity_types: BTreeSet<QuantityType>,
    ) -> OperationResult<BTreeMap<QuantityType, Unit>> {
        self.one_shot(OperationId::PreferredUnits, move |store, done| {
            store.preferred_units(quantity_types, or_default(done));
        })
    }

    pub fn request_authorization(
        &self,
        share: Option<BTreeSet<SampleType>>,
        read: Option<BTreeSet<ObjectType>>,
    ) -> OperationResult<bool> {
        self.one_shot(OperationId::RequestAuthorization, move |store, done| {
            store.request_authorization(share, read, passthrough(done));
        })
    }

    pub fn start_watch_app(&self, configuration: WorkoutConfiguration) -> OperationResult<bool> {
        self.one_shot(OperationId::StartWatchApp, move |store, done| {
            store.start_watch_app(configuration, passthrough(done));
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// With `monitor_updates`, keeps reporting until dropped.
    pub fn activity_summary_query(
        &self,
        predicate: Option<Predicate>,
        monitor_updates: bool,
    ) -> OperationStream<Vec<ActivitySummary>> {
        let requested = QueryMode::requested_by_flag(monitor_updates);
        self.stream(OperationId::ActivitySummaryQuery, requested, move |handler, mode| {
            QueryRequest::ActivitySummary {
                predicate,
                results: or_empty(handler.clone()),
                updates: mode.is_monitoring().then(|| or_empty(handler)),
            }
        })
    }

    /// With `monitor_updates`, keeps reporting additions and deletions until
    /// dropped. Each batch carries the anchor to resume from.
    pub fn anchored_object_query(
        &self,
        sample_type: SampleType,
        predicate: Option<Predicate>,
        anchor: Option<QueryAnchor>,
        limit: usize,
        monitor_updates: bool,
    ) -> OperationStream<AnchoredBatch> {
        let requested = QueryMode::requested_by_flag(monitor_updates);
        self.stream(OperationId::AnchoredObjectQuery, requested, move |handler, mode| {
            QueryRequest::Anchored {
                sample_type,
                predicate,
                anchor,
                limit,
                results: anchored(handler.clone()),
                updates: mode.is_monitoring().then(|| anchored(handler)),
            }
        })
    }

    pub fn correlation_query(
        &self,
        correlation_type: CorrelationType,
        predicate: Option<Predicate>,
        sample_predicates: Option<BTreeMap<SampleType, Predicate>>,
    ) -> OperationResult<Vec<Correlation>> {
        self.query_once(OperationId::CorrelationQuery, move |handler, _| {
            QueryRequest::Correlation {
                correlation_type,
                predicate,
                sample_predicates,
                results: or_empty(handler),
            }
        })
    }

    /// Completes when the store reports its last batch.
    pub fn document_query(
        &self,
        document_type: DocumentType,
        predicate: Option<Predicate>,
        limit: usize,
        sort: Option<Vec<SortDescriptor>>,
        include_data: bool,
    ) -> OperationStream<Vec<DocumentSample>> {
        self.stream(OperationId::DocumentQuery, None, move |handler, _| {
            QueryRequest::Document {
                document_type,
                predicate,
                limit,
                sort,
                include_data,
                results: documents(handler),
            }
        })
    }

    /// Emits on every store change of `sample_type`; never completes on its
    /// own. With `background_updates`, acknowledges each update to the store
    /// after emitting it.
    pub fn observer_query(
        &self,
        sample_type: SampleType,
        predicate: Option<Predicate>,
        background_updates: bool,
    ) -> OperationStream<()> {
        self.stream(OperationId::ObserverQuery, None, move |handler, _| {
            QueryRequest::Observer {
                sample_type,
                predicate,
                updates: observer(handler, background_updates),
            }
        })
    }

    pub fn sample_query(
        &self,
        sample_type: SampleType,
        predicate: Option<Predicate>,
        limit: usize,
        sort: Option<Vec<SortDescriptor>>,
    ) -> OperationResult<Vec<Sample>> {
        self.query_once(OperationId::SampleQuery, move |handler, _| {
            QueryRequest::Sample {
                sample_type,
                predicate,
                limit,
                sort,
                results: or_empty(handler),
            }
        })
    }

    pub fn source_query(
        &self,
        sample_type: SampleType,
        predicate: Option<Predicate>,
    ) -> OperationResult<BTreeSet<Source>> {
        self.query_once(OperationId::SourceQuery, move |handler, _| {
            QueryRequest::Source {
                sample_type,
                predicate,
                results: or_empty(handler),
            }
        })
    }

    /// Emits the initial collection, then (with `monitor_updates`) every
    /// recomputed collection until dropped.
    pub fn statistics_collection_query(
        &self,
        quantity_type: QuantityType,
        predicate: Option<Predicate>,
        options: StatisticsOptions,
        anchor_date: SystemTime,
        interval: Duration,
        monitor_updates: bool,
    ) -> OperationStream<Option<StatisticsCollection>> {
        let requested = QueryMode::requested_by_flag(monitor_updates);
        self.stream(
            OperationId::StatisticsCollectionQuery,
            requested,
            move |handler, mode| QueryRequest::StatisticsCollection {
                quantity_type,
                predicate,
                options,
                anchor_date,
                interval,
                initial: optional(handler.clone()),
                updates: mode.is_monitoring().then(|| optional(handler)),
            },
        )
    }

    pub fn statistics_query(
        &self,
        quantity_type: QuantityType,
        predicate: Option<Predicate>,
        options: StatisticsOptions,
    ) -> OperationResult<Option<Statistics>> {
        self.query_once(OperationId::StatisticsQuery, move |handler, _| {
            QueryRequest::Statistics {
                quantity_type,
                predicate,
                options,
                results: optional(handler),
            }
        })
    }
}
