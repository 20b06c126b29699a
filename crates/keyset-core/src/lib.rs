//! Keyset registry core: lifecycle state machine, tenant-scoped keyset manager,
//! capability-gated operation gateway, metadata stores, a local crypto engine and
//! lifecycle event sinks. The `keysetctl` binary and any transport binding sit on
//! top of this crate.

pub mod cache;
pub mod capability;
pub mod engine;
pub mod error;
pub mod events;
pub mod fsutil;
pub mod gateway;
pub mod local_engine;
pub mod manager;
pub mod models;
pub mod namespaces;
pub mod purge;
pub mod sqlite_store;
pub mod state;
pub mod store;

pub use cache::{CommitHook, KeysetCache};
pub use capability::{AlgorithmFamily, CapabilityTable, KeysetOperation};
pub use engine::{CryptoEngine, MaterialName};
pub use error::{ErrorKind, KeysetError, KeysetResult};
pub use events::{
    ChainedEvent, EventSink, FileEventLog, LifecycleEvent, LifecycleEventKind, MemoryEventSink,
    compute_event_hash,
};
pub use gateway::OperationGateway;
pub use local_engine::{
    FileMaterialVault, LocalCryptoEngine, MaterialVault, MemoryMaterialVault, SealedKeyset,
    SealedVersion,
};
pub use manager::KeysetManager;
pub use models::{
    KeysetAlgorithm, KeysetCriteria, KeysetId, KeysetMetadata, KeysetMetadataDefinition,
    KeysetPage, KeysetQuery, KeysetSort, KeysetState, Namespace,
};
pub use namespaces::{NamespaceDirectory, StaticNamespaceDirectory};
pub use purge::{PurgePolicy, PurgeReport, PurgeSweeper, RetentionPurgePolicy};
pub use sqlite_store::SqliteKeysetStore;
pub use state::Transition;
pub use store::{KeysetStore, MemoryKeysetStore, UnitOfWork};
