//! Store data model
//!
//! Parameter and payload types passed through the store boundary. The bridges
//! never look inside them; only a [`Store`](crate::store::Store)
//! implementation gives them meaning.

use std::fmt;
use std::time::{Duration, SystemTime};

/// Identifier of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub i64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type tag of stored objects, e.g. `"step_count"` or `"workout"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectType(pub String);

impl ObjectType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type SampleType = ObjectType;
pub type QuantityType = ObjectType;
pub type CorrelationType = ObjectType;
pub type DocumentType = ObjectType;

/// Opaque filter, built outside this crate and interpreted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Predicate(pub String);

impl Predicate {
    pub fn new(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }

    /// The predicate that matches everything.
    #[must_use]
    pub fn all() -> Self {
        Self(String::new())
    }

    #[must_use]
    pub fn expression(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn descending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }
}

/// Measurement unit, e.g. `"count"` or `"kcal"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Unit(pub String);

/// A timed measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: ObjectId,
    pub sample_type: SampleType,
    pub label: String,
    pub value: f64,
    pub start: SystemTime,
    pub end: SystemTime,
}

/// Anything the store can save or delete.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredObject {
    Sample(Sample),
    Workout(Workout),
}

impl StoredObject {
    #[must_use]
    pub fn id(&self) -> ObjectId {
        match self {
            Self::Sample(sample) => sample.id,
            Self::Workout(workout) => workout.id,
        }
    }

    #[must_use]
    pub fn object_type(&self) -> &ObjectType {
        match self {
            Self::Sample(sample) => &sample.sample_type,
            Self::Workout(workout) => &workout.workout_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workout {
    pub id: ObjectId,
    pub workout_type: ObjectType,
    pub activity: String,
    pub start: SystemTime,
    pub end: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkoutConfiguration {
    pub activity: String,
    pub indoor: bool,
}

/// Reference to an object removed from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedObject {
    pub id: ObjectId,
}

/// Position in the store's change history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryAnchor(pub u64);

/// One delivery of an anchored query.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchoredBatch {
    pub samples: Vec<Sample>,
    pub deleted: Vec<DeletedObject>,
    pub anchor: Option<QueryAnchor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySummary {
    pub day: String,
    pub active_energy: f64,
    pub exercise_minutes: f64,
    pub stand_hours: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    pub id: ObjectId,
    pub correlation_type: CorrelationType,
    pub objects: Vec<Sample>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSample {
    pub id: ObjectId,
    pub document_type: DocumentType,
    pub title: String,
    pub data: Option<Vec<u8>>,
}

/// Origin of stored data (an app or a device).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Source {
    pub name: String,
    pub bundle_id: String,
}

/// Which aggregates a statistics query computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatisticsOptions {
    pub average: bool,
    pub min: bool,
    pub max: bool,
    pub sum: bool,
}

impl StatisticsOptions {
    #[must_use]
    pub fn sum() -> Self {
        Self {
            sum: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub quantity_type: QuantityType,
    pub start: SystemTime,
    pub end: SystemTime,
    pub average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub sum: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsCollection {
    pub anchor_date: SystemTime,
    pub interval: Duration,
    pub statistics: Vec<Statistics>,
}

/// How often background delivery wakes the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFrequency {
    Immediate,
    Hourly,
    Daily,
    Weekly,
}
