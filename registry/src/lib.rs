pub mod bundle;
pub mod config;
pub mod context;
pub mod reference;
pub mod registry;
pub mod service;
pub mod tracker;

mod registration;

use trace_err::*;
use tracing::{debug, info, warn};

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::{Arc, Condvar, Mutex, RwLock, Weak},
};

#[cfg(feature = "instrument")]
use tracing::instrument;

// Re-export for consistency
pub use bosun_filter::Filter;
pub use bosun_properties::Properties;

pub use reference::ServiceReference;
pub use registration::{ServiceRegistration, ServiceState};
pub use registry::ServiceRegistry;
pub use service::{Provider, ServiceEvent, ServiceFactory, ServiceListener};
pub use tracker::{ServiceTracker, TrackedService, TrackerListener};

/// Identifies a bundle within a host. Bundle 0 is the host itself.
pub type BundleId = u64;

/// Registry-assigned service identity, strictly increasing per registry.
pub type ServiceId = u64;

/// A type-erased service instance shared between bundles.
pub type Object = Arc<dyn std::any::Any + Send + Sync>;
