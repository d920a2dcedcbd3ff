//! clusterform state management
//!
//! Owns the single document describing every cluster manager, cluster and
//! node of a target, changes it safely, and commits it to durable storage
//! only after the infrastructure it describes has been realized.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 clusterform CLI                  │
//! │        (create / destroy / get / list)           │
//! └─────────────────┬───────────────────────────────┘
//!                   │ ManagerRequest / ClusterRequest / NodeRequest
//! ┌─────────────────▼───────────────────────────────┐
//! │              ProvisionCoordinator                │
//! │  ┌──────────────┐  ┌──────────────┐             │
//! │  │StateDocument │  │  NodeNamer   │             │
//! │  └──────────────┘  └──────────────┘             │
//! └───────┬─────────────────┬───────────────────────┘
//!         │ lock/load/persist│ main.tf.json
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │    Backend    │ │  Provisioner  │
//! │ local / remote│ │  (terraform)  │
//! └───────────────┘ └───────────────┘
//! ```

pub mod backend;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod module;
pub mod naming;
pub mod provisioner;
pub mod workflow;

// Re-exports
pub use backend::{
    Backend, HttpObjectStore, LocalBackend, LockInfo, LockToken, MemoryObjectStore, ObjectStore,
    RemoteBackend,
};
pub use coordinator::{LoadMode, Outcome, Phase, ProvisionCoordinator};
pub use document::StateDocument;
pub use error::{Result, StateError};
pub use module::{ClusterModule, ManagerModule, ModuleKind, NodeModule, Provider};
pub use naming::node_names;
pub use provisioner::Provisioner;
pub use workflow::{ClusterRequest, ManagerRequest, ModuleSources, NodeRequest, Settings};
