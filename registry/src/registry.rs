use super::*;
use core::cmp::Reverse;
use super::registration::Registration;
use super::service::{EventKind, ListenerId, Provider, ServiceEvent, ServiceListener};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    thread::ThreadId,
};

// Key of a by-name index entry: higher ranking first, then older id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RankedId {
    ranking: Reverse<i32>,
    id: ServiceId,
}

impl RankedId {
    fn new(ranking: i32, id: ServiceId) -> Self {
        Self {
            ranking: Reverse(ranking),
            id,
        }
    }
}

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    bundle: BundleId,
    name: Option<Box<str>>,
    filter: Option<Filter>,
    listener: Arc<dyn ServiceListener>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<ServiceId, Arc<Registration>>,
    by_name: HashMap<Box<str>, BTreeSet<RankedId>>,
    listeners: Vec<ListenerEntry>,
}

// Mutations requested from inside event dispatch, applied after the
// dispatch unwinds.
enum Deferred {
    Register(Arc<Registration>),
    Unregister(Arc<Registration>),
    SetProperties(Arc<Registration>, Arc<Properties>),
    AddListener(Box<ListenerEntry>),
    RemoveListener(ListenerId),
}

/// The service registry: owns every live registration, answers rank-ordered
/// lookups, reference-counts service handoffs and broadcasts change events.
///
/// Lock order: `publish` -> `inner` -> leaf locks (per-registration state,
/// tracker views, the deferred queue). Every mutation takes `publish` first
/// and holds it across its event broadcast, so listeners observe one total
/// event order consistent with service-id assignment.
pub struct ServiceRegistry {
    name: Box<str>,
    grace: std::time::Duration,
    next_service_id: AtomicU64,
    next_listener_id: AtomicU64,
    inner: RwLock<Inner>,
    publish: Mutex<()>,
    dispatching: Mutex<HashSet<ThreadId>>,
    deferred: Mutex<VecDeque<Deferred>>,
}

impl ServiceRegistry {
    pub fn new(config: &config::Config) -> Arc<Self> {
        metrics::describe_counter!(
            "bosun_services_registered",
            metrics::Unit::Count,
            "Services registered over the registry lifetime"
        );
        metrics::describe_counter!(
            "bosun_services_unregistered",
            metrics::Unit::Count,
            "Services unregistered over the registry lifetime"
        );
        metrics::describe_counter!(
            "bosun_service_events",
            metrics::Unit::Count,
            "Service events delivered to listeners"
        );

        Arc::new(Self {
            name: config.name.as_str().into(),
            grace: config.unregister_grace,
            next_service_id: AtomicU64::new(1),
            next_listener_id: AtomicU64::new(1),
            inner: Default::default(),
            publish: Mutex::new(()),
            dispatching: Default::default(),
            deferred: Default::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a service under one or more names.
    ///
    /// The returned handle unregisters the service when dropped. When called
    /// from inside event dispatch the index insert and REGISTERED event are
    /// deferred until the dispatch unwinds; the handle is valid immediately.
    #[cfg_attr(
        feature = "instrument",
        instrument(skip(self, provider, properties), fields(registry = %self.name))
    )]
    pub fn register_service(
        self: &Arc<Self>,
        owner: BundleId,
        names: &[&str],
        provider: Provider,
        properties: Properties,
    ) -> service::Result<ServiceRegistration> {
        if names.is_empty() {
            return Err(service::Error::NoServiceNames);
        }
        if names.iter().any(|n| n.is_empty()) {
            return Err(service::Error::EmptyServiceName);
        }

        if self.in_dispatch() {
            let reg = self.new_registration(owner, names, provider, properties);
            let handle = ServiceRegistration::new(Arc::downgrade(self), reg.clone());
            self.deferred
                .lock()
                .trace_expect("Failed to lock mutex")
                .push_back(Deferred::Register(reg));
            return Ok(handle);
        }

        // Scope the publish lock so the id is assigned in emission order
        let handle;
        let waits = {
            let _publish = self.publish.lock().trace_expect("Failed to lock mutex");
            let reg = self.new_registration(owner, names, provider, properties);
            handle = ServiceRegistration::new(Arc::downgrade(self), reg.clone());
            self.apply_and_drain(Deferred::Register(reg))
        };
        self.settle(waits);
        Ok(handle)
    }

    pub(crate) fn unregister(&self, reg: &Arc<Registration>) -> service::Result<()> {
        reg.begin_unregister()?;

        if self.in_dispatch() {
            self.deferred
                .lock()
                .trace_expect("Failed to lock mutex")
                .push_back(Deferred::Unregister(reg.clone()));
            return Ok(());
        }

        let waits = {
            let _publish = self.publish.lock().trace_expect("Failed to lock mutex");
            self.apply_and_drain(Deferred::Unregister(reg.clone()))
        };
        self.settle(waits);
        Ok(())
    }

    pub(crate) fn modify_properties(
        &self,
        reg: &Arc<Registration>,
        properties: Properties,
    ) -> service::Result<()> {
        if reg.state() != ServiceState::Registered {
            return Err(service::Error::NotRegistered);
        }
        let properties = Arc::new(merge_system_properties(properties, reg.id, &reg.names));

        if self.in_dispatch() {
            self.deferred
                .lock()
                .trace_expect("Failed to lock mutex")
                .push_back(Deferred::SetProperties(reg.clone(), properties));
            return Ok(());
        }

        let waits = {
            let _publish = self.publish.lock().trace_expect("Failed to lock mutex");
            self.apply_and_drain(Deferred::SetProperties(reg.clone(), properties))
        };
        self.settle(waits);
        Ok(())
    }

    /// Resolve references in (ranking DESC, id ASC) order. A missing or
    /// empty name matches every registration; a missing filter matches
    /// every property set.
    pub fn get_references(
        &self,
        name: Option<&str>,
        filter: Option<&Filter>,
    ) -> Vec<ServiceReference> {
        let inner = self.inner.read().trace_expect("Failed to lock mutex");
        let mut references = Vec::new();
        {
            let mut consider = |reg: &Arc<Registration>| {
                if filter.is_none_or(|f| f.matches(&reg.properties())) {
                    references.push(reg.reference());
                }
            };
            match name {
                Some(name) if !name.is_empty() => {
                    for key in inner.by_name.get(name).into_iter().flatten() {
                        if let Some(reg) = inner.by_id.get(&key.id) {
                            consider(reg);
                        }
                    }
                }
                _ => {
                    let mut all: Vec<_> = inner.by_id.values().collect();
                    all.sort_by_key(|reg| RankedId::new(reg.ranking(), reg.id));
                    for reg in all {
                        consider(reg);
                    }
                }
            }
        }
        references
    }

    /// The highest-ranked service under `name`, if any.
    pub fn get_reference(&self, name: &str) -> Option<ServiceReference> {
        self.get_references(Some(name), None).into_iter().next()
    }

    /// Take a use of the referenced service on behalf of `bundle`.
    /// Fails for dead references and registrations that are unregistering.
    pub fn get_service(
        &self,
        bundle: BundleId,
        reference: &ServiceReference,
    ) -> service::Result<Object> {
        let reg = reference.upgrade().ok_or(service::Error::NoService)?;
        reg.acquire(bundle)
    }

    /// Release one use previously taken with [`get_service`](Self::get_service).
    pub fn unget_service(&self, bundle: BundleId, reference: &ServiceReference) -> bool {
        let Some(reg) = reference.upgrade() else {
            return false;
        };
        reg.release(bundle)
    }

    pub fn get_using_bundles(&self, reference: &ServiceReference) -> Vec<BundleId> {
        reference
            .upgrade()
            .map(|reg| reg.using_bundles())
            .unwrap_or_default()
    }

    pub(crate) fn pin_service(&self, bundle: BundleId, reference: &ServiceReference) -> bool {
        reference.upgrade().is_some_and(|reg| reg.pin(bundle))
    }

    /// Subscribe to registry change events, optionally scoped by a filter
    /// evaluated against each event's property snapshots.
    pub fn add_listener(
        &self,
        bundle: BundleId,
        filter: Option<Filter>,
        listener: Arc<dyn ServiceListener>,
    ) -> ListenerId {
        self.add_scoped_listener(bundle, None, filter, listener)
    }

    pub(crate) fn add_scoped_listener(
        &self,
        bundle: BundleId,
        name: Option<&str>,
        filter: Option<Filter>,
        listener: Arc<dyn ServiceListener>,
    ) -> ListenerId {
        let entry = self.new_listener_entry(bundle, name, filter, listener);
        let id = entry.id;

        if self.in_dispatch() {
            self.deferred
                .lock()
                .trace_expect("Failed to lock mutex")
                .push_back(Deferred::AddListener(Box::new(entry)));
            return id;
        }

        let waits = {
            let _publish = self.publish.lock().trace_expect("Failed to lock mutex");
            self.apply_and_drain(Deferred::AddListener(Box::new(entry)))
        };
        self.settle(waits);
        id
    }

    /// Atomically subscribe a listener and snapshot the references it would
    /// already have seen. Trackers build their initial view from this.
    pub(crate) fn open_scope(
        &self,
        bundle: BundleId,
        name: Option<&str>,
        filter: Option<&Filter>,
        listener: Arc<dyn ServiceListener>,
    ) -> (ListenerId, Vec<ServiceReference>) {
        let entry = self.new_listener_entry(bundle, name, filter.cloned(), listener);
        let id = entry.id;

        if self.in_dispatch() {
            let references = self.get_references(name, filter);
            self.deferred
                .lock()
                .trace_expect("Failed to lock mutex")
                .push_back(Deferred::AddListener(Box::new(entry)));
            return (id, references);
        }

        let references;
        let waits = {
            let _publish = self.publish.lock().trace_expect("Failed to lock mutex");
            let waits = self.apply_and_drain(Deferred::AddListener(Box::new(entry)));
            references = self.get_references(name, filter);
            waits
        };
        self.settle(waits);
        (id, references)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        if self.in_dispatch() {
            self.deferred
                .lock()
                .trace_expect("Failed to lock mutex")
                .push_back(Deferred::RemoveListener(id));
            return;
        }

        let waits = {
            let _publish = self.publish.lock().trace_expect("Failed to lock mutex");
            self.apply_and_drain(Deferred::RemoveListener(id))
        };
        self.settle(waits);
    }

    pub fn service_count(&self) -> usize {
        self.inner
            .read()
            .trace_expect("Failed to lock mutex")
            .by_id
            .len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .read()
            .trace_expect("Failed to lock mutex")
            .listeners
            .len()
    }

    /// Unregister every remaining service.
    #[cfg_attr(feature = "instrument", instrument(skip(self), fields(registry = %self.name)))]
    pub fn shutdown(&self) {
        let regs: Vec<_> = {
            self.inner
                .read()
                .trace_expect("Failed to lock mutex")
                .by_id
                .values()
                .cloned()
                .collect()
        };

        for reg in regs {
            if let Err(e) = self.unregister(&reg) {
                debug!("Service #{} already unregistering at shutdown: {e}", reg.id);
            }
        }
    }

    /// Drop every use `bundle` still holds, across all registrations.
    pub(crate) fn release_bundle(&self, bundle: BundleId) {
        let regs: Vec<_> = {
            self.inner
                .read()
                .trace_expect("Failed to lock mutex")
                .by_id
                .values()
                .cloned()
                .collect()
        };

        for reg in regs {
            let leaked = reg.force_release(bundle);
            if leaked > 0 {
                warn!(
                    "Bundle {bundle} stopped holding {leaked} uses of service #{}",
                    reg.id
                );
            }
        }
    }

    fn new_registration(
        &self,
        owner: BundleId,
        names: &[&str],
        provider: Provider,
        properties: Properties,
    ) -> Arc<Registration> {
        let id = self.next_service_id.fetch_add(1, Ordering::Relaxed);
        let names: Box<[Box<str>]> = names.iter().map(|n| Box::from(*n)).collect();
        let properties = Arc::new(merge_system_properties(properties, id, &names));
        Registration::new(id, owner, names, provider, properties)
    }

    fn new_listener_entry(
        &self,
        bundle: BundleId,
        name: Option<&str>,
        filter: Option<Filter>,
        listener: Arc<dyn ServiceListener>,
    ) -> ListenerEntry {
        ListenerEntry {
            id: ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed)),
            bundle,
            name: name.map(Box::from),
            filter,
            listener,
        }
    }

    fn in_dispatch(&self) -> bool {
        self.dispatching
            .lock()
            .trace_expect("Failed to lock mutex")
            .contains(&std::thread::current().id())
    }

    // Apply one mutation, then drain everything queued by the callbacks it
    // (and its successors) dispatched. Caller holds the publish lock and
    // afterwards settles the returned unregistrations.
    fn apply_and_drain(&self, first: Deferred) -> Vec<Arc<Registration>> {
        let mut waits = Vec::new();
        self.apply(first, &mut waits);
        loop {
            let next = self
                .deferred
                .lock()
                .trace_expect("Failed to lock mutex")
                .pop_front();
            let Some(op) = next else {
                break;
            };
            self.apply(op, &mut waits);
        }
        waits
    }

    // Block (outside the publish lock) until unregistered services drain.
    fn settle(&self, waits: Vec<Arc<Registration>>) {
        for reg in waits {
            reg.wait_unused(self.grace);
            info!("Unregistered service #{}", reg.id);
        }
    }

    fn apply(&self, op: Deferred, waits: &mut Vec<Arc<Registration>>) {
        match op {
            Deferred::Register(reg) => {
                let listeners = {
                    let mut inner = self.inner.write().trace_expect("Failed to lock mutex");
                    inner.by_id.insert(reg.id, reg.clone());
                    for name in &reg.names {
                        inner
                            .by_name
                            .entry(name.clone())
                            .or_default()
                            .insert(RankedId::new(reg.ranking(), reg.id));
                    }
                    inner.listeners.clone()
                };
                info!("Registered service #{} as {:?}", reg.id, reg.names);
                metrics::counter!("bosun_services_registered").increment(1);
                let properties = reg.properties();
                self.dispatch(&listeners, &reg, EventKind::Registered, &properties, None);
            }
            Deferred::Unregister(reg) => {
                let listeners = {
                    let mut inner = self.inner.write().trace_expect("Failed to lock mutex");
                    if inner.by_id.remove(&reg.id).is_none() {
                        // Never made it into the indices; no event to raise,
                        // but the state must still settle
                        waits.push(reg);
                        return;
                    }
                    let key = RankedId::new(reg.ranking(), reg.id);
                    for name in &reg.names {
                        if let Some(set) = inner.by_name.get_mut(name.as_ref()) {
                            set.remove(&key);
                            if set.is_empty() {
                                inner.by_name.remove(name.as_ref());
                            }
                        }
                    }
                    inner.listeners.clone()
                };
                info!("Unregistering service #{}", reg.id);
                metrics::counter!("bosun_services_unregistered").increment(1);
                let properties = reg.properties();
                self.dispatch(&listeners, &reg, EventKind::Unregistering, &properties, None);
                waits.push(reg);
            }
            Deferred::SetProperties(reg, properties) => {
                let (old, listeners) = {
                    let mut inner = self.inner.write().trace_expect("Failed to lock mutex");
                    if !inner.by_id.contains_key(&reg.id) {
                        return;
                    }
                    let old = reg.properties();
                    let old_key = RankedId::new(ranking_of(&old), reg.id);
                    let new_key = RankedId::new(ranking_of(&properties), reg.id);
                    if old_key != new_key {
                        for name in &reg.names {
                            if let Some(set) = inner.by_name.get_mut(name.as_ref()) {
                                set.remove(&old_key);
                                set.insert(new_key);
                            }
                        }
                    }
                    reg.set_properties(properties.clone());
                    (old, inner.listeners.clone())
                };
                debug!("Service #{} properties modified", reg.id);
                self.dispatch(
                    &listeners,
                    &reg,
                    EventKind::Modified,
                    &properties,
                    Some(&old),
                );
            }
            Deferred::AddListener(entry) => {
                self.inner
                    .write()
                    .trace_expect("Failed to lock mutex")
                    .listeners
                    .push(*entry);
            }
            Deferred::RemoveListener(id) => {
                self.inner
                    .write()
                    .trace_expect("Failed to lock mutex")
                    .listeners
                    .retain(|l| l.id != id);
            }
        }
    }

    // Deliver one event to every interested listener, under the read lock,
    // with this thread marked as dispatching so reentrant mutations defer.
    fn dispatch(
        &self,
        listeners: &[ListenerEntry],
        reg: &Arc<Registration>,
        kind: EventKind,
        properties: &Arc<Properties>,
        previous: Option<&Arc<Properties>>,
    ) {
        if listeners.is_empty() {
            return;
        }

        let _read = self.inner.read().trace_expect("Failed to lock mutex");
        let thread = std::thread::current().id();
        self.dispatching
            .lock()
            .trace_expect("Failed to lock mutex")
            .insert(thread);

        for entry in listeners {
            if !entry
                .name
                .as_deref()
                .is_none_or(|n| reg.names.iter().any(|m| m.as_ref() == n))
            {
                continue;
            }

            let kind = match kind {
                EventKind::Modified => {
                    let matches_new = entry.filter.as_ref().is_none_or(|f| f.matches(properties));
                    let matches_old = previous
                        .is_some_and(|p| entry.filter.as_ref().is_none_or(|f| f.matches(p)));
                    if matches_new {
                        EventKind::Modified
                    } else if matches_old {
                        EventKind::ModifiedEndMatch
                    } else {
                        continue;
                    }
                }
                kind => {
                    if !entry.filter.as_ref().is_none_or(|f| f.matches(properties)) {
                        continue;
                    }
                    kind
                }
            };

            let event = ServiceEvent {
                kind,
                reference: reg.reference(),
                properties: properties.clone(),
                previous: previous.cloned(),
            };
            metrics::counter!("bosun_service_events").increment(1);
            if let Err(e) = entry.listener.on_event(&event) {
                warn!(
                    "Listener owned by bundle {} failed on {:?} for service #{}: {e}",
                    entry.bundle, kind, reg.id
                );
            }
        }

        self.dispatching
            .lock()
            .trace_expect("Failed to lock mutex")
            .remove(&thread);
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("name", &self.name)
            .field("services", &self.service_count())
            .finish()
    }
}

fn ranking_of(properties: &Properties) -> i32 {
    properties.get_long(bosun_properties::SERVICE_RANKING, 0) as i32
}

fn merge_system_properties(
    mut properties: Properties,
    id: ServiceId,
    names: &[Box<str>],
) -> Properties {
    properties.set(bosun_properties::SERVICE_ID, id.to_string());
    properties.set(
        bosun_properties::OBJECT_CLASS,
        names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(","),
    );
    // Normalize the ranking so the snapshot always carries a parseable value
    let ranking = properties.get_long(bosun_properties::SERVICE_RANKING, 0);
    properties.set(bosun_properties::SERVICE_RANKING, ranking.to_string());
    properties
}
