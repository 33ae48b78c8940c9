pub mod catalog;
pub mod deferred;
pub mod error;
pub mod idgen;
pub mod live;
pub mod memstore;
pub mod model;
pub mod store;

// Re-export bridge types for convenience
pub use deferred::{Completion, Deferred};
pub use live::{Emission, LiveQuery, QueryMode, ResultHandler};

// Re-export error types
pub use error::{OperationError, StoreError};

// Re-export catalog types
pub use catalog::{
    entry, CallShape, CatalogEntry, Delivery, ModeSupport, OperationId, OperationResult,
    OperationStream, Operations, CATALOG,
};

// Re-export the store boundary
pub use store::{QueryRequest, Store, NO_LIMIT};

// Re-export the in-memory store
pub use idgen::{IdGen, QueryId};
pub use memstore::{Executor, MemQuery, MemStore, MemStoreConfig};
