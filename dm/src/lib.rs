pub mod component;
pub mod dependency;
pub mod manager;

use trace_err::*;
use tracing::{info, warn};

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, Weak},
};

// Re-export for consistency
pub use bosun_registry::{Filter, Object, Properties};

pub use component::{Component, ComponentBuilder, ComponentState};
pub use dependency::{DependencyBuilder, UpdateStrategy};
pub use manager::DependencyManager;
