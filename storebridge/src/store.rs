//! Store boundary
//!
//! The external store exposes two call shapes:
//!
//! - **one-shot**: a method taking its parameters and a [`OneShot`] callback,
//!   which the store calls exactly once, from any thread;
//! - **query**: [`Store::make_query`] builds a query object around one or two
//!   handlers, [`Store::execute`] submits it, [`Store::stop`] releases it.
//!   Handlers may run zero, one or many times until the query is stopped.
//!
//! Handlers are plain closures in the store's own `(payload?, error?)` shape.
//! Turning them into futures and streams is the job of
//! [`crate::deferred`] and [`crate::live`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::StoreError;
use crate::model::{
    ActivitySummary, Correlation, CorrelationType, DeletedObject, DocumentSample, DocumentType,
    ObjectType, Predicate, QuantityType, QueryAnchor, Sample, SampleType, SortDescriptor, Source,
    Statistics, StatisticsCollection, StatisticsOptions, StoredObject, Unit, UpdateFrequency,
    Workout, WorkoutConfiguration,
};

/// `limit` value meaning "return everything".
pub const NO_LIMIT: usize = 0;

/// Completion callback of a one-shot store call.
pub type OneShot<R> = Box<dyn FnOnce(Option<R>, Option<StoreError>) + Send>;

/// Result handler of a query: `(payload?, error?)`.
pub type QueryHandler<R> = Arc<dyn Fn(Option<R>, Option<StoreError>) + Send + Sync>;

/// Anchored query handler: `(samples?, deleted?, new anchor?, error?)`.
pub type AnchoredHandler = Arc<
    dyn Fn(Option<Vec<Sample>>, Option<Vec<DeletedObject>>, Option<QueryAnchor>, Option<StoreError>)
        + Send
        + Sync,
>;

/// Document query handler: `(documents?, done, error?)`.
pub type DocumentHandler =
    Arc<dyn Fn(Option<Vec<DocumentSample>>, bool, Option<StoreError>) + Send + Sync>;

/// Acknowledgement the store expects after a background observer update.
pub type ObserverAck = Box<dyn FnOnce() + Send>;

/// Observer query handler: `(ack, error?)`.
pub type ObserverHandler = Arc<dyn Fn(ObserverAck, Option<StoreError>) + Send + Sync>;

/// Everything needed to build one store query object.
///
/// Kinds that can monitor carry an optional update handler; when present,
/// the store keeps calling it after the initial delivery until stopped.
#[derive(Clone)]
pub enum QueryRequest {
    ActivitySummary {
        predicate: Option<Predicate>,
        results: QueryHandler<Vec<ActivitySummary>>,
        updates: Option<QueryHandler<Vec<ActivitySummary>>>,
    },
    Anchored {
        sample_type: SampleType,
        predicate: Option<Predicate>,
        anchor: Option<QueryAnchor>,
        limit: usize,
        results: AnchoredHandler,
        updates: Option<AnchoredHandler>,
    },
    Correlation {
        correlation_type: CorrelationType,
        predicate: Option<Predicate>,
        sample_predicates: Option<BTreeMap<SampleType, Predicate>>,
        results: QueryHandler<Vec<Correlation>>,
    },
    Document {
        document_type: DocumentType,
        predicate: Option<Predicate>,
        limit: usize,
        sort: Option<Vec<SortDescriptor>>,
        include_data: bool,
        results: DocumentHandler,
    },
    Observer {
        sample_type: SampleType,
        predicate: Option<Predicate>,
        updates: ObserverHandler,
    },
    Sample {
        sample_type: SampleType,
        predicate: Option<Predicate>,
        limit: usize,
        sort: Option<Vec<SortDescriptor>>,
        results: QueryHandler<Vec<Sample>>,
    },
    Source {
        sample_type: SampleType,
        predicate: Option<Predicate>,
        results: QueryHandler<BTreeSet<Source>>,
    },
    StatisticsCollection {
        quantity_type: QuantityType,
        predicate: Option<Predicate>,
        options: StatisticsOptions,
        anchor_date: SystemTime,
        interval: Duration,
        initial: QueryHandler<StatisticsCollection>,
        updates: Option<QueryHandler<StatisticsCollection>>,
    },
    Statistics {
        quantity_type: QuantityType,
        predicate: Option<Predicate>,
        options: StatisticsOptions,
        results: QueryHandler<Statistics>,
    },
}

impl QueryRequest {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ActivitySummary { .. } => "activity_summary",
            Self::Anchored { .. } => "anchored",
            Self::Correlation { .. } => "correlation",
            Self::Document { .. } => "document",
            Self::Observer { .. } => "observer",
            Self::Sample { .. } => "sample",
            Self::Source { .. } => "source",
            Self::StatisticsCollection { .. } => "statistics_collection",
            Self::Statistics { .. } => "statistics",
        }
    }

    /// True when the request carries a handler for later updates.
    #[must_use]
    pub fn monitors_updates(&self) -> bool {
        match self {
            Self::ActivitySummary { updates, .. } => updates.is_some(),
            Self::Anchored { updates, .. } => updates.is_some(),
            Self::StatisticsCollection { updates, .. } => updates.is_some(),
            Self::Observer { .. } => true,
            Self::Correlation { .. }
            | Self::Document { .. }
            | Self::Sample { .. }
            | Self::Source { .. }
            | Self::Statistics { .. } => false,
        }
    }
}

impl fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueryRequest(kind={}, monitors_updates={})",
            self.kind(),
            self.monitors_updates()
        )
    }
}

/// Callback-based asynchronous store.
///
/// Every one-shot method must call its callback exactly once. Query handlers
/// for a single query object must not run concurrently with each other.
pub trait Store: Send + Sync + 'static {
    /// Opaque handle of a registered query.
    type Query: Send + Sync + 'static;

    fn save(&self, objects: Vec<StoredObject>, done: OneShot<bool>);

    fn delete(&self, objects: Vec<StoredObject>, done: OneShot<bool>);

    /// Delete every object of `object_type` matching `predicate`.
    /// Reports `(success, deleted count)`.
    fn delete_objects(
        &self,
        object_type: ObjectType,
        predicate: Predicate,
        done: OneShot<(bool, usize)>,
    );

    fn add_samples(&self, samples: Vec<Sample>, workout: Workout, done: OneShot<bool>);

    fn enable_background_delivery(
        &self,
        object_type: ObjectType,
        frequency: UpdateFrequency,
        done: OneShot<bool>,
    );

    fn disable_background_delivery(&self, object_type: ObjectType, done: OneShot<bool>);

    fn disable_all_background_delivery(&self, done: OneShot<bool>);

    fn preferred_units(
        &self,
        quantity_types: BTreeSet<QuantityType>,
        done: OneShot<BTreeMap<QuantityType, Unit>>,
    );

    fn request_authorization(
        &self,
        share: Option<BTreeSet<SampleType>>,
        read: Option<BTreeSet<ObjectType>>,
        done: OneShot<bool>,
    );

    fn start_watch_app(&self, configuration: WorkoutConfiguration, done: OneShot<bool>);

    /// Build a query object. Nothing runs until [`Store::execute`].
    fn make_query(&self, request: QueryRequest) -> Self::Query;

    fn execute(&self, query: &Self::Query);

    /// Release a query. Handlers must not be called after this returns,
    /// except for an invocation already in flight.
    fn stop(&self, query: &Self::Query);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn summaries(updates: bool) -> QueryRequest {
        let handler: QueryHandler<Vec<ActivitySummary>> =
            Arc::new(|_: Option<Vec<ActivitySummary>>, _: Option<StoreError>| {});
        QueryRequest::ActivitySummary {
            predicate: None,
            results: Arc::clone(&handler),
            updates: updates.then_some(handler),
        }
    }

    fn collection(updates: bool) -> QueryRequest {
        let handler: QueryHandler<StatisticsCollection> =
            Arc::new(|_: Option<StatisticsCollection>, _: Option<StoreError>| {});
        QueryRequest::StatisticsCollection {
            quantity_type: ObjectType::new("step_count"),
            predicate: None,
            options: StatisticsOptions::sum(),
            anchor_date: UNIX_EPOCH,
            interval: Duration::from_secs(60),
            initial: Arc::clone(&handler),
            updates: updates.then_some(handler),
        }
    }

    #[test]
    fn test_monitors_updates_follows_update_handler() {
        assert!(summaries(true).monitors_updates());
        assert!(!summaries(false).monitors_updates());
        assert!(collection(true).monitors_updates());
        assert!(!collection(false).monitors_updates());
    }

    #[test]
    fn test_observer_always_monitors() {
        let request = QueryRequest::Observer {
            sample_type: ObjectType::new("step_count"),
            predicate: None,
            updates: Arc::new(|_: ObserverAck, _: Option<StoreError>| {}),
        };
        assert!(request.monitors_updates());
        assert_eq!(
            format!("{request:?}"),
            "QueryRequest(kind=observer, monitors_updates=true)"
        );
    }
}
