use super::*;
use core::cmp::Reverse;
use super::service::{EventKind, ListenerId, ServiceEvent, ServiceListener};

/// One entry of a tracker's view: the reference, the acquired instance and
/// the property snapshot it was last seen with.
#[derive(Clone)]
pub struct TrackedService {
    pub reference: ServiceReference,
    pub service: Object,
    pub properties: Arc<Properties>,
}

impl TrackedService {
    pub fn ranking(&self) -> i32 {
        self.properties
            .get_long(bosun_properties::SERVICE_RANKING, 0) as i32
    }
}

impl std::fmt::Debug for TrackedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedService")
            .field("id", &self.reference.id())
            .field("ranking", &self.ranking())
            .finish()
    }
}

/// Callbacks a tracker invokes as its view changes. All callbacks run
/// inside registry event dispatch (or inside `open`/`close`), serialized
/// per tracker. After `removed` returns the service must not be touched.
pub trait TrackerListener: Send + Sync {
    fn added(&self, _tracked: &TrackedService) {}
    fn modified(&self, _tracked: &TrackedService) {}
    fn removed(&self, _tracked: &TrackedService) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Phase {
    #[default]
    Created,
    Open,
    Closed,
}

#[derive(Default)]
struct View {
    phase: Phase,
    token: Option<ListenerId>,
    tracked: Vec<TrackedService>,
}

/// A standing query over the registry: maintains a live, rank-ordered view
/// of the services matching a (name, filter) pair, holding a use of each.
pub struct ServiceTracker {
    registry: Arc<ServiceRegistry>,
    bundle: BundleId,
    name: Option<Box<str>>,
    filter: Option<Filter>,
    listener: Option<Arc<dyn TrackerListener>>,
    view: Mutex<View>,
}

pub struct TrackerBuilder {
    registry: Arc<ServiceRegistry>,
    bundle: BundleId,
    owner: Option<Weak<context::BundleContext>>,
    name: Option<Box<str>>,
    filter: Option<Filter>,
    listener: Option<Arc<dyn TrackerListener>>,
}

impl TrackerBuilder {
    pub(crate) fn new(
        registry: Arc<ServiceRegistry>,
        bundle: BundleId,
        owner: Option<Weak<context::BundleContext>>,
    ) -> Self {
        Self {
            registry,
            bundle,
            owner,
            name: None,
            filter: None,
            listener: None,
        }
    }

    /// Restrict the tracker to services registered under `name`.
    pub fn service_name(mut self, name: &str) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Parse and set a filter. Malformed filters fail here, not at `open`.
    pub fn filter_str(self, filter: &str) -> service::Result<Self> {
        Ok(self.filter(filter.parse::<Filter>()?))
    }

    pub fn listener(mut self, listener: Arc<dyn TrackerListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> Arc<ServiceTracker> {
        let tracker = Arc::new(ServiceTracker {
            registry: self.registry,
            bundle: self.bundle,
            name: self.name,
            filter: self.filter,
            listener: self.listener,
            view: Mutex::default(),
        });
        if let Some(context) = self.owner.as_ref().and_then(Weak::upgrade) {
            context.record_tracker(&tracker);
        }
        tracker
    }
}

// Registry listener face of a tracker. Weak, so a dropped tracker cannot
// be resurrected by a late event.
struct Hook(Weak<ServiceTracker>);

impl ServiceListener for Hook {
    fn on_event(&self, event: &ServiceEvent) -> service::Result<()> {
        if let Some(tracker) = self.0.upgrade() {
            tracker.handle_event(event);
        }
        Ok(())
    }
}

impl ServiceTracker {
    /// Build a tracker directly against a registry, outside any bundle
    /// context. `bundle` attributes the tracker's service uses.
    pub fn builder(registry: &Arc<ServiceRegistry>, bundle: BundleId) -> TrackerBuilder {
        TrackerBuilder::new(registry.clone(), bundle, None)
    }

    pub fn service_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// Subscribe to the registry and populate the view with the services
    /// that already match, invoking `added` for each in rank order.
    pub fn open(self: &Arc<Self>) -> service::Result<()> {
        {
            let mut view = self.view.lock().trace_expect("Failed to lock mutex");
            match view.phase {
                Phase::Open => return Ok(()),
                Phase::Closed => return Err(service::Error::Closed),
                Phase::Created => view.phase = Phase::Open,
            }
        }

        let (token, references) = self.registry.open_scope(
            self.bundle,
            self.name.as_deref(),
            self.filter.as_ref(),
            Arc::new(Hook(Arc::downgrade(self))),
        );
        self.view
            .lock()
            .trace_expect("Failed to lock mutex")
            .token = Some(token);
        metrics::gauge!("bosun_trackers_open").increment(1.0);

        for reference in references {
            let Some(properties) = reference.properties() else {
                continue;
            };
            self.add_tracked(reference, properties);
        }
        Ok(())
    }

    /// Unsubscribe and drain the view in reverse rank order, invoking
    /// `removed` and releasing each use. Further events are ignored.
    pub fn close(&self) {
        let (token, drained) = {
            let mut view = self.view.lock().trace_expect("Failed to lock mutex");
            if view.phase != Phase::Open {
                view.phase = Phase::Closed;
                return;
            }
            view.phase = Phase::Closed;
            (view.token.take(), std::mem::take(&mut view.tracked))
        };

        if let Some(token) = token {
            self.registry.remove_listener(token);
        }
        metrics::gauge!("bosun_trackers_open").decrement(1.0);

        for entry in drained.iter().rev() {
            if let Some(listener) = &self.listener {
                listener.removed(entry);
            }
            self.registry.unget_service(self.bundle, &entry.reference);
        }
    }

    pub fn size(&self) -> usize {
        self.view
            .lock()
            .trace_expect("Failed to lock mutex")
            .tracked
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Snapshot of the view in rank order.
    pub fn tracked(&self) -> Vec<TrackedService> {
        self.view
            .lock()
            .trace_expect("Failed to lock mutex")
            .tracked
            .clone()
    }

    /// The current highest-ranked entry.
    pub fn highest(&self) -> Option<TrackedService> {
        self.view
            .lock()
            .trace_expect("Failed to lock mutex")
            .tracked
            .first()
            .cloned()
    }

    /// Pin the highest-ranked service and run `f` against it. The extra use
    /// keeps the instance valid for the whole call even if the service is
    /// concurrently unregistered.
    pub fn use_highest_ranked<R>(
        &self,
        f: impl FnOnce(&Object, &Arc<Properties>) -> R,
    ) -> Option<R> {
        for entry in self.tracked() {
            if self.registry.pin_service(self.bundle, &entry.reference) {
                let result = f(&entry.service, &entry.properties);
                self.registry.unget_service(self.bundle, &entry.reference);
                return Some(result);
            }
        }
        None
    }

    /// Run `f` against every tracked service in rank order, pinning each in
    /// turn. Returns how many services were visited.
    pub fn use_all(&self, mut f: impl FnMut(&Object, &Arc<Properties>)) -> usize {
        let mut used = 0;
        for entry in self.tracked() {
            if self.registry.pin_service(self.bundle, &entry.reference) {
                f(&entry.service, &entry.properties);
                self.registry.unget_service(self.bundle, &entry.reference);
                used += 1;
            }
        }
        used
    }

    fn handle_event(&self, event: &ServiceEvent) {
        match event.kind {
            EventKind::Registered => {
                self.add_tracked(event.reference.clone(), event.properties.clone())
            }
            EventKind::Modified => {
                let updated = {
                    let mut view = self.view.lock().trace_expect("Failed to lock mutex");
                    if view.phase != Phase::Open {
                        return;
                    }
                    match view
                        .tracked
                        .iter()
                        .position(|t| t.reference == event.reference)
                    {
                        Some(at) => {
                            view.tracked[at].properties = event.properties.clone();
                            let entry = view.tracked[at].clone();
                            view.tracked.sort_by_key(sort_key);
                            Some(entry)
                        }
                        None => None,
                    }
                };
                match updated {
                    Some(entry) => {
                        if let Some(listener) = &self.listener {
                            listener.modified(&entry);
                        }
                    }
                    // A modification can bring a service into match
                    None => self.add_tracked(event.reference.clone(), event.properties.clone()),
                }
            }
            EventKind::ModifiedEndMatch | EventKind::Unregistering => {
                self.remove_tracked(&event.reference)
            }
        }
    }

    fn add_tracked(&self, reference: ServiceReference, properties: Arc<Properties>) {
        let service = match self.registry.get_service(self.bundle, &reference) {
            Ok(service) => service,
            Err(e) => {
                // Lost a race with unregistration, or the factory failed
                debug!("Tracker could not acquire service #{}: {e}", reference.id());
                return;
            }
        };

        let entry = TrackedService {
            reference,
            service,
            properties,
        };
        {
            let mut view = self.view.lock().trace_expect("Failed to lock mutex");
            if view.phase != Phase::Open
                || view.tracked.iter().any(|t| t.reference == entry.reference)
            {
                drop(view);
                self.registry.unget_service(self.bundle, &entry.reference);
                return;
            }
            let at = view
                .tracked
                .partition_point(|t| sort_key(t) <= sort_key(&entry));
            view.tracked.insert(at, entry.clone());
        }
        if let Some(listener) = &self.listener {
            listener.added(&entry);
        }
    }

    fn remove_tracked(&self, reference: &ServiceReference) {
        let removed = {
            let mut view = self.view.lock().trace_expect("Failed to lock mutex");
            view.tracked
                .iter()
                .position(|t| &t.reference == reference)
                .map(|at| view.tracked.remove(at))
        };
        if let Some(entry) = removed {
            if let Some(listener) = &self.listener {
                listener.removed(&entry);
            }
            self.registry.unget_service(self.bundle, &entry.reference);
        }
    }
}

impl Drop for ServiceTracker {
    fn drop(&mut self) {
        // close() needs no Arc, and the registry hook is already dead
        self.close();
    }
}

impl std::fmt::Debug for ServiceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTracker")
            .field("bundle", &self.bundle)
            .field("name", &self.name)
            .field("tracked", &self.size())
            .finish()
    }
}

fn sort_key(entry: &TrackedService) -> (Reverse<i32>, ServiceId) {
    (Reverse(entry.ranking()), entry.reference.id())
}
