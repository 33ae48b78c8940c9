//! Operation catalog
//!
//! One declarative entry per store operation: which call shape it uses on
//! the store side, what the consumer receives, and which query modes apply.
//! [`Operations`] is the single dispatcher that interprets the table; its
//! public methods only marshal parameters and map payloads.

mod operations;

use std::fmt;

use crate::live::QueryMode;

pub use operations::{OperationResult, OperationStream, Operations};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationId {
    Save,
    Delete,
    DeleteObjects,
    AddSamples,
    EnableBackgroundDelivery,
    DisableBackgroundDelivery,
    DisableAllBackgroundDelivery,
    PreferredUnits,
    RequestAuthorization,
    StartWatchApp,
    ActivitySummaryQuery,
    AnchoredObjectQuery,
    CorrelationQuery,
    DocumentQuery,
    ObserverQuery,
    SampleQuery,
    SourceQuery,
    StatisticsCollectionQuery,
    StatisticsQuery,
}

impl OperationId {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Delete => "delete",
            Self::DeleteObjects => "delete_objects",
            Self::AddSamples => "add_samples",
            Self::EnableBackgroundDelivery => "enable_background_delivery",
            Self::DisableBackgroundDelivery => "disable_background_delivery",
            Self::DisableAllBackgroundDelivery => "disable_all_background_delivery",
            Self::PreferredUnits => "preferred_units",
            Self::RequestAuthorization => "request_authorization",
            Self::StartWatchApp => "start_watch_app",
            Self::ActivitySummaryQuery => "activity_summary_query",
            Self::AnchoredObjectQuery => "anchored_object_query",
            Self::CorrelationQuery => "correlation_query",
            Self::DocumentQuery => "document_query",
            Self::ObserverQuery => "observer_query",
            Self::SampleQuery => "sample_query",
            Self::SourceQuery => "source_query",
            Self::StatisticsCollectionQuery => "statistics_collection_query",
            Self::StatisticsQuery => "statistics_query",
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Store-side call shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    /// Single completion callback
    OneShot,
    /// Query object: construct, execute, stop
    Query,
}

/// Consumer-side result shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// One value or one error
    Deferred,
    /// Zero or more values, then completion or an error
    Stream,
}

/// Which query modes an operation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSupport {
    /// One-shot calls have no mode
    NotApplicable,
    /// Always runs in this mode
    Fixed(QueryMode),
    /// The consumer picks with a flag; `default` when unspecified
    Selectable { default: QueryMode },
    /// The store marks its last batch. Runs as monitoring until then.
    StoreSignalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: OperationId,
    pub shape: CallShape,
    pub delivery: Delivery,
    pub modes: ModeSupport,
}

impl CatalogEntry {
    const fn one_shot(id: OperationId) -> Self {
        Self {
            id,
            shape: CallShape::OneShot,
            delivery: Delivery::Deferred,
            modes: ModeSupport::NotApplicable,
        }
    }

    const fn query(id: OperationId, delivery: Delivery, modes: ModeSupport) -> Self {
        Self {
            id,
            shape: CallShape::Query,
            delivery,
            modes,
        }
    }

    /// The mode a query runs in, given the consumer's request (if any).
    ///
    /// A request is honoured only for [`ModeSupport::Selectable`] entries.
    #[must_use]
    pub fn resolve_mode(&self, requested: Option<QueryMode>) -> QueryMode {
        match self.modes {
            ModeSupport::Selectable { default } => requested.unwrap_or(default),
            ModeSupport::Fixed(mode) => mode,
            ModeSupport::StoreSignalled => QueryMode::Monitoring,
            ModeSupport::NotApplicable => QueryMode::SingleShot,
        }
    }
}

const SELECTABLE: ModeSupport = ModeSupport::Selectable {
    default: QueryMode::SingleShot,
};
const POINT_IN_TIME: ModeSupport = ModeSupport::Fixed(QueryMode::SingleShot);

/// Every supported operation.
pub static CATALOG: &[CatalogEntry] = &[
    CatalogEntry::one_shot(OperationId::Save),
    CatalogEntry::one_shot(OperationId::Delete),
    CatalogEntry::one_shot(OperationId::DeleteObjects),
    CatalogEntry::one_shot(OperationId::AddSamples),
    CatalogEntry::one_shot(OperationId::EnableBackgroundDelivery),
    CatalogEntry::one_shot(OperationId::DisableBackgroundDelivery),
    CatalogEntry::one_shot(OperationId::DisableAllBackgroundDelivery),
    CatalogEntry::one_shot(OperationId::PreferredUnits),
    CatalogEntry::one_shot(OperationId::RequestAuthorization),
    CatalogEntry::one_shot(OperationId::StartWatchApp),
    CatalogEntry::query(OperationId::ActivitySummaryQuery, Delivery::Stream, SELECTABLE),
    CatalogEntry::query(OperationId::AnchoredObjectQuery, Delivery::Stream, SELECTABLE),
    CatalogEntry::query(OperationId::CorrelationQuery, Delivery::Deferred, POINT_IN_TIME),
    CatalogEntry::query(
        OperationId::DocumentQuery,
        Delivery::Stream,
        ModeSupport::StoreSignalled,
    ),
    CatalogEntry::query(
        OperationId::ObserverQuery,
        Delivery::Stream,
        ModeSupport::Fixed(QueryMode::Monitoring),
    ),
    CatalogEntry::query(OperationId::SampleQuery, Delivery::Deferred, POINT_IN_TIME),
    CatalogEntry::query(OperationId::SourceQuery, Delivery::Deferred, POINT_IN_TIME),
    CatalogEntry::query(OperationId::StatisticsCollectionQuery, Delivery::Stream, SELECTABLE),
    CatalogEntry::query(OperationId::StatisticsQuery, Delivery::Deferred, POINT_IN_TIME),
];

/// Look up the catalog entry of `id`.
///
/// # Panics
///
/// Never for a well-formed [`CATALOG`]: every [`OperationId`] has an entry,
/// which the tests check.
#[must_use]
#[allow(clippy::expect_used)]
pub fn entry(id: OperationId) -> &'static CatalogEntry {
    CATALOG
        .iter()
        .find(|entry| entry.id == id)
        .expect("every operation has a catalog entry")
}
