use super::*;
use bosun_registry::{
    ServiceId, ServiceRegistration, TrackedService, TrackerListener, context::BundleContext,
    service,
};
use super::dependency::{Dependency, DependencyBuilder, UpdateStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    /// Built but not added to a manager.
    Inactive,
    /// At least one required dependency is unsatisfied.
    WaitingForRequired,
    /// All required dependencies satisfied; `init` has run.
    Instantiated,
    /// Live: `start` has run and dependency callbacks flow.
    TrackingOptional,
    /// Being torn down: removes, `stop`, `deinit`.
    Stopping,
}

pub type LifecycleFn = Box<dyn Fn() -> service::Result<()> + Send + Sync>;

/// Builds a [`Component`]: an implementation handle, lifecycle callbacks,
/// service dependencies, and the services the component provides while it
/// is active.
pub struct ComponentBuilder {
    name: String,
    implementation: Option<Object>,
    init: Option<LifecycleFn>,
    start: Option<LifecycleFn>,
    stop: Option<LifecycleFn>,
    deinit: Option<LifecycleFn>,
    dependencies: Vec<DependencyBuilder>,
    provides: Vec<(Vec<String>, Properties)>,
}

impl ComponentBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            implementation: None,
            init: None,
            start: None,
            stop: None,
            deinit: None,
            dependencies: Vec::new(),
            provides: Vec::new(),
        }
    }

    pub fn implementation(mut self, implementation: Object) -> Self {
        self.implementation = Some(implementation);
        self
    }

    pub fn on_init(
        mut self,
        init: impl Fn() -> service::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.init = Some(Box::new(init));
        self
    }

    pub fn on_start(
        mut self,
        start: impl Fn() -> service::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.start = Some(Box::new(start));
        self
    }

    pub fn on_stop(
        mut self,
        stop: impl Fn() -> service::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.stop = Some(Box::new(stop));
        self
    }

    pub fn on_deinit(
        mut self,
        deinit: impl Fn() -> service::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.deinit = Some(Box::new(deinit));
        self
    }

    pub fn dependency(mut self, dependency: DependencyBuilder) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Publish the implementation under `names` while the component is
    /// active; withdrawn again when it stops.
    pub fn provides(mut self, names: &[&str], properties: Properties) -> Self {
        self.provides.push((
            names.iter().map(|n| n.to_string()).collect(),
            properties,
        ));
        self
    }

    pub(crate) fn build(self, context: Arc<BundleContext>) -> Arc<Component> {
        let dependencies: Vec<Dependency> =
            self.dependencies.into_iter().map(DependencyBuilder::build).collect();
        let count = dependencies.len();
        Arc::new(Component {
            name: self.name,
            implementation: self.implementation.unwrap_or_else(|| Arc::new(())),
            init: self.init,
            start: self.start,
            stop: self.stop,
            deinit: self.deinit,
            provides: self.provides,
            dependencies,
            context,
            runtime: Mutex::new(Runtime {
                state: ComponentState::Inactive,
                processing: false,
                queue: VecDeque::new(),
                notified: vec![HashSet::new(); count],
                set_target: vec![None; count],
                registrations: Vec::new(),
            }),
        })
    }
}

enum Event {
    Added(usize, TrackedService),
    Modified(usize, TrackedService),
    Removed(usize, TrackedService),
    Evaluate,
    Deactivate,
}

struct Runtime {
    state: ComponentState,
    // One thread drains the queue at a time; all callbacks run there, in
    // event-arrival order
    processing: bool,
    queue: VecDeque<Event>,
    // Per-dependency ids delivered through add and not yet through remove
    notified: Vec<HashSet<ServiceId>>,
    // Per-dependency current target of the set callback
    set_target: Vec<Option<ServiceId>>,
    registrations: Vec<ServiceRegistration>,
}

// Tracker callbacks of one dependency, forwarded into the component's
// event queue.
struct DependencyHook {
    component: Weak<Component>,
    index: usize,
}

impl TrackerListener for DependencyHook {
    fn added(&self, tracked: &TrackedService) {
        if let Some(component) = self.component.upgrade() {
            component.enqueue(Event::Added(self.index, tracked.clone()));
        }
    }

    fn modified(&self, tracked: &TrackedService) {
        if let Some(component) = self.component.upgrade() {
            component.enqueue(Event::Modified(self.index, tracked.clone()));
        }
    }

    fn removed(&self, tracked: &TrackedService) {
        if let Some(component) = self.component.upgrade() {
            component.enqueue(Event::Removed(self.index, tracked.clone()));
        }
    }
}

/// A user implementation driven through a deterministic state machine by
/// the trackers behind its service dependencies.
pub struct Component {
    name: String,
    implementation: Object,
    init: Option<LifecycleFn>,
    start: Option<LifecycleFn>,
    stop: Option<LifecycleFn>,
    deinit: Option<LifecycleFn>,
    provides: Vec<(Vec<String>, Properties)>,
    dependencies: Vec<Dependency>,
    context: Arc<BundleContext>,
    runtime: Mutex<Runtime>,
}

impl Component {
    pub fn builder(name: &str) -> ComponentBuilder {
        ComponentBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ComponentState {
        self.runtime
            .lock()
            .trace_expect("Failed to lock mutex")
            .state
    }

    pub fn implementation(&self) -> &Object {
        &self.implementation
    }

    /// Open the dependency trackers and start driving the state machine.
    /// Invoked by the manager when the component is added.
    pub(crate) fn activate(self: &Arc<Self>) -> service::Result<()> {
        {
            let mut runtime = self.runtime.lock().trace_expect("Failed to lock mutex");
            if runtime.state != ComponentState::Inactive {
                return Ok(());
            }
            runtime.state = ComponentState::WaitingForRequired;
            // Hold the queue until every tracker is open
            runtime.processing = true;
        }
        info!("Component '{}' waiting for required dependencies", self.name);

        for (index, dependency) in self.dependencies.iter().enumerate() {
            let mut builder = self
                .context
                .track()
                .service_name(&dependency.service_name)
                .listener(Arc::new(DependencyHook {
                    component: Arc::downgrade(self),
                    index,
                }));
            if let Some(filter) = &dependency.filter {
                builder = builder.filter(filter.clone());
            }
            let tracker = builder.build();
            dependency.set_tracker(tracker.clone());
            if let Err(e) = tracker.open() {
                self.runtime
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .processing = false;
                return Err(e);
            }
        }

        self.runtime
            .lock()
            .trace_expect("Failed to lock mutex")
            .queue
            .push_back(Event::Evaluate);
        self.process_queue();
        Ok(())
    }

    /// Tear the component down. Invoked by the manager on removal.
    pub(crate) fn deactivate(self: &Arc<Self>) {
        self.enqueue(Event::Deactivate);
    }

    fn enqueue(self: &Arc<Self>, event: Event) {
        {
            let mut runtime = self.runtime.lock().trace_expect("Failed to lock mutex");
            runtime.queue.push_back(event);
            if runtime.processing {
                return;
            }
            runtime.processing = true;
        }
        self.process_queue();
    }

    fn process_queue(self: &Arc<Self>) {
        loop {
            let event = {
                let mut runtime = self.runtime.lock().trace_expect("Failed to lock mutex");
                match runtime.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        runtime.processing = false;
                        return;
                    }
                }
            };
            self.process(event);
        }
    }

    fn process(self: &Arc<Self>, event: Event) {
        match event {
            Event::Evaluate => self.try_activate(),
            Event::Deactivate => {
                if self.state() == ComponentState::TrackingOptional {
                    self.stop_instance();
                }
                self.set_state(ComponentState::Inactive);
                for dependency in &self.dependencies {
                    if let Some(tracker) = dependency.take_tracker() {
                        tracker.close();
                    }
                }
                info!("Component '{}' inactive", self.name);
            }
            Event::Added(index, tracked) => match self.state() {
                ComponentState::WaitingForRequired => self.try_activate(),
                ComponentState::TrackingOptional => {
                    // The activation replay may already have delivered this
                    if self.is_notified(index, &tracked) {
                        return;
                    }
                    if self.dependencies[index].strategy == UpdateStrategy::Suspending {
                        self.run_lifecycle("stop", &self.stop);
                        self.deliver_add(index, &tracked);
                        self.run_lifecycle("start", &self.start);
                    } else {
                        self.deliver_add(index, &tracked);
                    }
                }
                _ => {}
            },
            Event::Modified(index, _tracked) => {
                // A ranking change can move the set-callback target
                if self.state() == ComponentState::TrackingOptional {
                    self.refresh_set(index);
                }
            }
            Event::Removed(index, tracked) => match self.state() {
                ComponentState::TrackingOptional => {
                    if !self.is_notified(index, &tracked) {
                        return;
                    }
                    let dependency = &self.dependencies[index];
                    if dependency.required && !dependency.satisfied() {
                        // Lost the last required match: back through Stopping
                        self.deliver_remove(index, &tracked);
                        self.stop_instance();
                        self.set_state(ComponentState::WaitingForRequired);
                        info!(
                            "Component '{}' waiting for required dependencies",
                            self.name
                        );
                        self.try_activate();
                    } else if dependency.strategy == UpdateStrategy::Suspending {
                        self.run_lifecycle("stop", &self.stop);
                        self.deliver_remove(index, &tracked);
                        self.run_lifecycle("start", &self.start);
                    } else {
                        self.deliver_remove(index, &tracked);
                    }
                }
                // Late removals queued across a deactivation still balance
                // their adds
                _ => self.deliver_remove(index, &tracked),
            },
        }
    }

    fn try_activate(self: &Arc<Self>) {
        if self.state() != ComponentState::WaitingForRequired {
            return;
        }
        if !self.dependencies.iter().all(Dependency::satisfied) {
            return;
        }

        self.set_state(ComponentState::Instantiated);
        info!("Component '{}' instantiated", self.name);
        if !self.run_lifecycle("init", &self.init) {
            self.set_state(ComponentState::WaitingForRequired);
            return;
        }

        self.set_state(ComponentState::TrackingOptional);
        self.run_lifecycle("start", &self.start);
        info!("Component '{}' started", self.name);

        // Publish provided services now that the instance is live
        for (names, properties) in &self.provides {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            match self
                .context
                .register_service(&names, self.implementation.clone(), properties.clone())
            {
                Ok(registration) => self
                    .runtime
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .registrations
                    .push(registration),
                Err(e) => warn!(
                    "Component '{}' failed to publish {names:?}: {e}",
                    self.name
                ),
            }
        }

        // One add/set per service already tracked by any dependency
        for (index, dependency) in self.dependencies.iter().enumerate() {
            let Some(tracker) = dependency.tracker() else {
                continue;
            };
            for tracked in tracker.tracked() {
                self.deliver_add(index, &tracked);
            }
        }
    }

    // The Stopping sequence: withdraw provided services, deliver a remove
    // (or set(None)) per tracked service, then stop and deinit.
    fn stop_instance(self: &Arc<Self>) {
        self.set_state(ComponentState::Stopping);
        info!("Component '{}' stopping", self.name);

        let registrations = {
            let mut runtime = self.runtime.lock().trace_expect("Failed to lock mutex");
            std::mem::take(&mut runtime.registrations)
        };
        drop(registrations);

        for (index, dependency) in self.dependencies.iter().enumerate() {
            let entries = dependency
                .tracker()
                .map(|t| t.tracked())
                .unwrap_or_default();
            for tracked in &entries {
                self.deliver_remove(index, tracked);
            }
        }
        for (index, dependency) in self.dependencies.iter().enumerate() {
            if let Some(set) = &dependency.set {
                let had = self
                    .runtime
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .set_target[index]
                    .take();
                if had.is_some() {
                    if let Err(e) = set(None) {
                        warn!("Component '{}' set callback failed: {e}", self.name);
                    }
                }
            }
            self.runtime
                .lock()
                .trace_expect("Failed to lock mutex")
                .notified[index]
                .clear();
        }

        self.run_lifecycle("stop", &self.stop);
        self.run_lifecycle("deinit", &self.deinit);
    }

    fn is_notified(&self, index: usize, tracked: &TrackedService) -> bool {
        self.runtime
            .lock()
            .trace_expect("Failed to lock mutex")
            .notified[index]
            .contains(&tracked.reference.id())
    }

    fn deliver_add(&self, index: usize, tracked: &TrackedService) {
        let fresh = self
            .runtime
            .lock()
            .trace_expect("Failed to lock mutex")
            .notified[index]
            .insert(tracked.reference.id());
        if !fresh {
            return;
        }
        if let Some(add) = &self.dependencies[index].add {
            if let Err(e) = add(tracked) {
                warn!("Component '{}' add callback failed: {e}", self.name);
            }
        }
        self.refresh_set(index);
    }

    fn deliver_remove(&self, index: usize, tracked: &TrackedService) {
        let known = self
            .runtime
            .lock()
            .trace_expect("Failed to lock mutex")
            .notified[index]
            .remove(&tracked.reference.id());
        if !known {
            return;
        }
        if let Some(remove) = &self.dependencies[index].remove {
            if let Err(e) = remove(tracked) {
                warn!("Component '{}' remove callback failed: {e}", self.name);
            }
        }
        self.refresh_set(index);
    }

    // Drive the set callback towards the dependency's current
    // highest-ranked match.
    fn refresh_set(&self, index: usize) {
        let dependency = &self.dependencies[index];
        let Some(set) = &dependency.set else {
            return;
        };

        let highest = dependency.tracker().and_then(|t| t.highest());
        let desired = highest.as_ref().map(|t| t.reference.id());
        {
            let mut runtime = self.runtime.lock().trace_expect("Failed to lock mutex");
            if runtime.set_target[index] == desired {
                return;
            }
            runtime.set_target[index] = desired;
        }
        if let Err(e) = set(highest.as_ref()) {
            warn!("Component '{}' set callback failed: {e}", self.name);
        }
    }

    fn run_lifecycle(&self, hook: &str, callback: &Option<LifecycleFn>) -> bool {
        if let Some(callback) = callback {
            if let Err(e) = callback() {
                warn!("Component '{}' {hook} callback failed: {e}", self.name);
                return false;
            }
        }
        true
    }

    fn set_state(&self, state: ComponentState) {
        self.runtime
            .lock()
            .trace_expect("Failed to lock mutex")
            .state = state;
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}
