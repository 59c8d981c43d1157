use super::*;
use super::service::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Registered,
    /// Unregistration has begun: new `get_service` calls fail, held
    /// instances stay valid until released.
    Unregistering,
    Unregistered,
}

struct UseEntry {
    count: usize,
    instance: Option<Object>,
    // A factory get/unget for this bundle is in flight with the lock released
    pending: bool,
}

struct Shared {
    state: ServiceState,
    properties: Arc<Properties>,
    uses: HashMap<BundleId, UseEntry>,
}

/// The registry-owned record of one published service.
pub(crate) struct Registration {
    pub(crate) id: ServiceId,
    pub(crate) owner: BundleId,
    pub(crate) names: Box<[Box<str>]>,
    pub(crate) provider: Provider,
    shared: Mutex<Shared>,
    released: Condvar,
}

impl Registration {
    pub(crate) fn new(
        id: ServiceId,
        owner: BundleId,
        names: Box<[Box<str>]>,
        provider: Provider,
        properties: Arc<Properties>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner,
            names,
            provider,
            shared: Mutex::new(Shared {
                state: ServiceState::Registered,
                properties,
                uses: HashMap::new(),
            }),
            released: Condvar::new(),
        })
    }

    pub(crate) fn state(&self) -> ServiceState {
        self.shared.lock().trace_expect("Failed to lock mutex").state
    }

    pub(crate) fn properties(&self) -> Arc<Properties> {
        self.shared
            .lock()
            .trace_expect("Failed to lock mutex")
            .properties
            .clone()
    }

    pub(crate) fn ranking(&self) -> i32 {
        self.properties()
            .get_long(bosun_properties::SERVICE_RANKING, 0) as i32
    }

    pub(crate) fn set_properties(&self, properties: Arc<Properties>) {
        self.shared
            .lock()
            .trace_expect("Failed to lock mutex")
            .properties = properties;
    }

    pub(crate) fn reference(self: &Arc<Self>) -> ServiceReference {
        ServiceReference::new(self.id, Arc::downgrade(self))
    }

    /// Registered -> Unregistering, exactly once.
    pub(crate) fn begin_unregister(&self) -> service::Result<()> {
        let mut shared = self.shared.lock().trace_expect("Failed to lock mutex");
        if shared.state != ServiceState::Registered {
            return Err(service::Error::NotRegistered);
        }
        shared.state = ServiceState::Unregistering;
        Ok(())
    }

    /// Take a use of this service on behalf of `bundle`, producing the
    /// instance through the factory on first use.
    pub(crate) fn acquire(&self, bundle: BundleId) -> service::Result<Object> {
        let mut shared = self.shared.lock().trace_expect("Failed to lock mutex");
        loop {
            if shared.state != ServiceState::Registered {
                return Err(service::Error::NoService);
            }
            match shared.uses.get_mut(&bundle) {
                Some(entry) if entry.pending => {
                    shared = self
                        .released
                        .wait(shared)
                        .trace_expect("Failed to wait on condvar");
                }
                Some(entry) => {
                    if let Some(instance) = entry.instance.clone() {
                        entry.count += 1;
                        return Ok(instance);
                    }
                    return Err(service::Error::NoService);
                }
                None => break,
            }
        }

        // First use by this bundle
        match &self.provider {
            Provider::Instance(object) => {
                shared.uses.insert(
                    bundle,
                    UseEntry {
                        count: 1,
                        instance: Some(object.clone()),
                        pending: false,
                    },
                );
                Ok(object.clone())
            }
            Provider::Factory(factory) => {
                shared.uses.insert(
                    bundle,
                    UseEntry {
                        count: 0,
                        instance: None,
                        pending: true,
                    },
                );
                let properties = shared.properties.clone();
                drop(shared);

                let produced = factory.get(bundle, &properties);

                let mut shared = self.shared.lock().trace_expect("Failed to lock mutex");
                let mut hand_back = None;
                let result = match produced {
                    Ok(object) if shared.state == ServiceState::Registered => {
                        if let Some(entry) = shared.uses.get_mut(&bundle) {
                            entry.pending = false;
                            entry.count = 1;
                            entry.instance = Some(object.clone());
                        }
                        Ok(object)
                    }
                    Ok(object) => {
                        // Unregistration raced the factory call
                        shared.uses.remove(&bundle);
                        hand_back = Some(object);
                        Err(service::Error::NoService)
                    }
                    Err(e) => {
                        shared.uses.remove(&bundle);
                        warn!(
                            "Service factory for service #{} failed for bundle {bundle}: {e}",
                            self.id
                        );
                        Err(service::Error::Bundle(e.into()))
                    }
                };
                drop(shared);
                self.released.notify_all();
                if let Some(object) = hand_back {
                    factory.unget(bundle, object);
                }
                result
            }
        }
    }

    /// Release one use held by `bundle`. Returns false if the bundle holds
    /// no use of this service.
    pub(crate) fn release(&self, bundle: BundleId) -> bool {
        let mut shared = self.shared.lock().trace_expect("Failed to lock mutex");
        while shared.uses.get(&bundle).is_some_and(|e| e.pending) {
            shared = self
                .released
                .wait(shared)
                .trace_expect("Failed to wait on condvar");
        }
        let Some(entry) = shared.uses.get_mut(&bundle) else {
            return false;
        };
        entry.count -= 1;
        if entry.count > 0 {
            return true;
        }

        let instance = entry.instance.take();
        match &self.provider {
            Provider::Instance(_) => {
                shared.uses.remove(&bundle);
                drop(shared);
            }
            Provider::Factory(factory) => {
                entry.pending = true;
                drop(shared);
                if let Some(object) = instance {
                    factory.unget(bundle, object);
                }
                self.shared
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .uses
                    .remove(&bundle);
            }
        }
        self.released.notify_all();
        true
    }

    /// Take an extra use without going through the factory. Succeeds only
    /// while `bundle` already holds at least one use, which is what keeps
    /// the instance valid across a concurrent unregister.
    pub(crate) fn pin(&self, bundle: BundleId) -> bool {
        let mut shared = self.shared.lock().trace_expect("Failed to lock mutex");
        match shared.uses.get_mut(&bundle) {
            Some(entry) if entry.count > 0 => {
                entry.count += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop every use `bundle` still holds, returning how many were leaked.
    pub(crate) fn force_release(&self, bundle: BundleId) -> usize {
        let mut shared = self.shared.lock().trace_expect("Failed to lock mutex");
        while shared.uses.get(&bundle).is_some_and(|e| e.pending) {
            shared = self
                .released
                .wait(shared)
                .trace_expect("Failed to wait on condvar");
        }
        let Some(entry) = shared.uses.remove(&bundle) else {
            return 0;
        };
        drop(shared);
        if let (Provider::Factory(factory), Some(object)) = (&self.provider, entry.instance) {
            factory.unget(bundle, object);
        }
        self.released.notify_all();
        entry.count
    }

    pub(crate) fn using_bundles(&self) -> Vec<BundleId> {
        let shared = self.shared.lock().trace_expect("Failed to lock mutex");
        let mut bundles: Vec<BundleId> = shared
            .uses
            .iter()
            .filter(|(_, e)| e.count > 0)
            .map(|(b, _)| *b)
            .collect();
        bundles.sort_unstable();
        bundles
    }

    /// Block until every use has been released, then mark the registration
    /// Unregistered. Logs a warning each time `grace` elapses with uses
    /// still outstanding.
    pub(crate) fn wait_unused(&self, grace: std::time::Duration) {
        let mut shared = self.shared.lock().trace_expect("Failed to lock mutex");
        while !shared.uses.is_empty() {
            if grace.is_zero() {
                shared = self
                    .released
                    .wait(shared)
                    .trace_expect("Failed to wait on condvar");
            } else {
                let (guard, timeout) = self
                    .released
                    .wait_timeout(shared, grace)
                    .trace_expect("Failed to wait on condvar");
                shared = guard;
                if timeout.timed_out() && !shared.uses.is_empty() {
                    let holders: Vec<BundleId> = shared.uses.keys().copied().collect();
                    warn!(
                        "Service #{} still in use by bundles {holders:?} after {grace:?}",
                        self.id
                    );
                }
            }
        }
        shared.state = ServiceState::Unregistered;
    }
}

impl PartialEq for Registration {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Registration {}

impl std::hash::Hash for Registration {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("names", &self.names)
            .finish()
    }
}

/// Owner-side handle to a registration. Dropping the handle unregisters
/// the service if that has not already happened.
pub struct ServiceRegistration {
    registry: Weak<ServiceRegistry>,
    inner: Arc<Registration>,
}

impl ServiceRegistration {
    pub(crate) fn new(registry: Weak<ServiceRegistry>, inner: Arc<Registration>) -> Self {
        Self { registry, inner }
    }

    pub(crate) fn inner(&self) -> &Arc<Registration> {
        &self.inner
    }

    pub fn id(&self) -> ServiceId {
        self.inner.id
    }

    pub fn names(&self) -> &[Box<str>] {
        &self.inner.names
    }

    pub fn properties(&self) -> Arc<Properties> {
        self.inner.properties()
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state()
    }

    pub fn reference(&self) -> ServiceReference {
        self.inner.reference()
    }

    /// Atomically replace the user properties. System properties are
    /// re-merged; the by-name indices are re-sorted on the new ranking.
    pub fn set_properties(&self, properties: Properties) -> service::Result<()> {
        self.registry
            .upgrade()
            .ok_or(service::Error::Closed)?
            .modify_properties(&self.inner, properties)
    }

    /// Withdraw the service. Blocks until every outstanding use has been
    /// released. Calling this twice is an error.
    pub fn unregister(&self) -> service::Result<()> {
        self.registry
            .upgrade()
            .ok_or(service::Error::Closed)?
            .unregister(&self.inner)
    }
}

impl Drop for ServiceRegistration {
    fn drop(&mut self) {
        if self.inner.state() == ServiceState::Registered {
            if let Some(registry) = self.registry.upgrade() {
                let _ = registry.unregister(&self.inner);
            }
        }
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}
