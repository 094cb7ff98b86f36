//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │      ResourceStore<K> │ NodeInventory │ EventRecorder       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ KubeStore │ KubeNodeInventory │ KubeEventRecorder          │ │
//! │  │ InMemoryStore │ InMemoryNodeInventory │ InMemoryEventRecorder│ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cstor_operator::adapters::{KubeStore, InMemoryStore};
//! use cstor_operator::crd::CStorPoolCluster;
//!
//! let live: KubeStore<CStorPoolCluster> = KubeStore::new(client);
//! let fake: InMemoryStore<CStorPoolCluster> = InMemoryStore::new();
//! ```

mod event_publisher;
mod kubernetes;
pub mod memory;

pub use event_publisher::{CompositeEventRecorder, InMemoryEventRecorder, LoggingEventRecorder};
pub use kubernetes::{KubeEventRecorder, KubeNodeInventory, KubeStore, FIELD_MANAGER};
pub use memory::{InMemoryNodeInventory, InMemoryStore};
