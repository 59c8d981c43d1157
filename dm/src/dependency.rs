use super::*;
use bosun_registry::{ServiceTracker, TrackedService, service};

/// How a component reacts when a dependency's service set changes while the
/// component is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Apply the change through the add/remove/set callbacks while the
    /// component keeps running; the callback sees a stable handle for its
    /// whole scope.
    #[default]
    Locking,
    /// Stop the component, apply the change, start it again.
    Suspending,
}

pub(crate) type AddFn = Box<dyn Fn(&TrackedService) -> service::Result<()> + Send + Sync>;
pub(crate) type SetFn = Box<dyn Fn(Option<&TrackedService>) -> service::Result<()> + Send + Sync>;

/// Declares one service dependency of a component: a target service name,
/// an optional filter, a required flag, an update strategy, and callbacks.
///
/// Multi-target dependencies use `on_add`/`on_remove`; single-target
/// dependencies use `on_set`, invoked with the highest-ranked match (or
/// `None` when the last match disappears or the component stops).
pub struct DependencyBuilder {
    service_name: String,
    filter: Option<Filter>,
    required: bool,
    strategy: UpdateStrategy,
    add: Option<AddFn>,
    remove: Option<AddFn>,
    set: Option<SetFn>,
}

impl DependencyBuilder {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            filter: None,
            required: false,
            strategy: UpdateStrategy::default(),
            add: None,
            remove: None,
            set: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Parse and set a filter. Malformed filters fail here, at build time.
    pub fn filter_str(self, filter: &str) -> service::Result<Self> {
        Ok(self.filter(filter.parse::<Filter>()?))
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn on_add(
        mut self,
        add: impl Fn(&TrackedService) -> service::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.add = Some(Box::new(add));
        self
    }

    pub fn on_remove(
        mut self,
        remove: impl Fn(&TrackedService) -> service::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.remove = Some(Box::new(remove));
        self
    }

    pub fn on_set(
        mut self,
        set: impl Fn(Option<&TrackedService>) -> service::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.set = Some(Box::new(set));
        self
    }

    pub(crate) fn build(self) -> Dependency {
        Dependency {
            service_name: self.service_name,
            filter: self.filter,
            required: self.required,
            strategy: self.strategy,
            add: self.add,
            remove: self.remove,
            set: self.set,
            tracker: Mutex::new(None),
        }
    }
}

pub(crate) struct Dependency {
    pub(crate) service_name: String,
    pub(crate) filter: Option<Filter>,
    pub(crate) required: bool,
    pub(crate) strategy: UpdateStrategy,
    pub(crate) add: Option<AddFn>,
    pub(crate) remove: Option<AddFn>,
    pub(crate) set: Option<SetFn>,
    tracker: Mutex<Option<Arc<ServiceTracker>>>,
}

impl Dependency {
    pub(crate) fn tracker(&self) -> Option<Arc<ServiceTracker>> {
        self.tracker
            .lock()
            .trace_expect("Failed to lock mutex")
            .clone()
    }

    pub(crate) fn set_tracker(&self, tracker: Arc<ServiceTracker>) {
        *self.tracker.lock().trace_expect("Failed to lock mutex") = Some(tracker);
    }

    pub(crate) fn take_tracker(&self) -> Option<Arc<ServiceTracker>> {
        self.tracker.lock().trace_expect("Failed to lock mutex").take()
    }

    pub(crate) fn satisfied(&self) -> bool {
        !self.required || self.tracker().is_some_and(|t| !t.is_empty())
    }
}
