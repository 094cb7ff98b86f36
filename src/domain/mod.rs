//! Domain Layer
//!
//! This module contains the abstractions the reconcilers are written against.
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Ports** (`ports.rs`) - Typed client traits per object kind, node
//!   inventory, and event sink
//! - **Events** (`events.rs`) - User-visible controller events
//!
//! # Usage
//!
//! ```ignore
//! use cstor_operator::domain::ports::{ResourceStore, Selector};
//! use cstor_operator::crd::{keys, CStorPoolInstance};
//!
//! async fn instances_of(
//!     store: &dyn ResourceStore<CStorPoolInstance>,
//!     ns: &str,
//!     cluster: &str,
//! ) -> Result<Vec<CStorPoolInstance>> {
//!     store.list(ns, &Selector::eq(keys::CLUSTER_LABEL, cluster)).await
//! }
//! ```

pub mod events;
pub mod ports;

// Re-export commonly used types
pub use events::{object_key, ControllerEvent, EventKind, EventReason};
pub use ports::{EventRecorder, NodeInventory, ResourceStore, Selector};
