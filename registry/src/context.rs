use super::*;
use super::registration::Registration;
use super::service::{ListenerId, Provider, ServiceFactory, ServiceListener};
use super::tracker::{ServiceTracker, TrackerBuilder};

#[derive(Default)]
struct Owned {
    open: bool,
    registrations: Vec<Weak<Registration>>,
    trackers: Vec<Weak<ServiceTracker>>,
    listeners: Vec<ListenerId>,
}

/// Per-bundle façade over the registry.
///
/// Carries the bundle's identity into every call for use-count attribution,
/// and scopes registrations, trackers and listeners so they can all be torn
/// down when the bundle stops. Operations on a closed context fail with
/// [`service::Error::Closed`].
pub struct BundleContext {
    bundle: BundleId,
    registry: Arc<ServiceRegistry>,
    owned: Mutex<Owned>,
}

impl BundleContext {
    pub(crate) fn new(bundle: BundleId, registry: Arc<ServiceRegistry>) -> Arc<Self> {
        Arc::new(Self {
            bundle,
            registry,
            owned: Mutex::new(Owned {
                open: true,
                ..Default::default()
            }),
        })
    }

    pub fn bundle_id(&self) -> BundleId {
        self.bundle
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Publish a shared service instance under one or more names.
    pub fn register_service(
        &self,
        names: &[&str],
        service: Object,
        properties: Properties,
    ) -> service::Result<ServiceRegistration> {
        self.register(names, Provider::Instance(service), properties)
    }

    /// Publish a factory producing one instance per requesting bundle.
    pub fn register_factory(
        &self,
        names: &[&str],
        factory: Arc<dyn ServiceFactory>,
        properties: Properties,
    ) -> service::Result<ServiceRegistration> {
        self.register(names, Provider::Factory(factory), properties)
    }

    fn register(
        &self,
        names: &[&str],
        provider: Provider,
        properties: Properties,
    ) -> service::Result<ServiceRegistration> {
        self.ensure_open()?;
        let registration =
            self.registry
                .register_service(self.bundle, names, provider, properties)?;
        self.owned
            .lock()
            .trace_expect("Failed to lock mutex")
            .registrations
            .push(Arc::downgrade(registration.inner()));
        Ok(registration)
    }

    pub fn get_references(
        &self,
        name: Option<&str>,
        filter: Option<&Filter>,
    ) -> service::Result<Vec<ServiceReference>> {
        self.ensure_open()?;
        Ok(self.registry.get_references(name, filter))
    }

    /// The highest-ranked service under `name`.
    pub fn get_reference(&self, name: &str) -> service::Result<Option<ServiceReference>> {
        self.ensure_open()?;
        Ok(self.registry.get_reference(name))
    }

    pub fn get_service(&self, reference: &ServiceReference) -> service::Result<Object> {
        self.ensure_open()?;
        self.registry.get_service(self.bundle, reference)
    }

    /// [`get_service`](Self::get_service) plus a downcast to the concrete
    /// service type. A failed downcast releases the use again.
    pub fn get_service_as<T: Send + Sync + 'static>(
        &self,
        reference: &ServiceReference,
    ) -> service::Result<Arc<T>> {
        let object = self.get_service(reference)?;
        object.downcast().map_err(|_| {
            self.registry.unget_service(self.bundle, reference);
            service::Error::WrongType
        })
    }

    pub fn unget_service(&self, reference: &ServiceReference) -> bool {
        self.registry.unget_service(self.bundle, reference)
    }

    /// Subscribe to registry events. The filter string is parsed here:
    /// malformed filters fail at registration time.
    pub fn add_listener(
        &self,
        filter: Option<&str>,
        listener: Arc<dyn ServiceListener>,
    ) -> service::Result<ListenerId> {
        self.ensure_open()?;
        let filter = filter.map(str::parse::<Filter>).transpose()?;
        let id = self.registry.add_listener(self.bundle, filter, listener);
        self.owned
            .lock()
            .trace_expect("Failed to lock mutex")
            .listeners
            .push(id);
        Ok(id)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.owned
            .lock()
            .trace_expect("Failed to lock mutex")
            .listeners
            .retain(|l| *l != id);
        self.registry.remove_listener(id);
    }

    /// Start building a tracker scoped to this bundle. The tracker is
    /// closed automatically when the bundle stops.
    pub fn track(self: &Arc<Self>) -> TrackerBuilder {
        TrackerBuilder::new(
            self.registry.clone(),
            self.bundle,
            Some(Arc::downgrade(self)),
        )
    }

    pub(crate) fn record_tracker(&self, tracker: &Arc<ServiceTracker>) {
        self.owned
            .lock()
            .trace_expect("Failed to lock mutex")
            .trackers
            .push(Arc::downgrade(tracker));
    }

    /// Tear down everything this bundle owns: close trackers, remove
    /// listeners, unregister registrations, release leaked uses.
    pub(crate) fn close(&self) {
        let owned = {
            let mut owned = self.owned.lock().trace_expect("Failed to lock mutex");
            if !owned.open {
                return;
            }
            owned.open = false;
            std::mem::take(&mut *owned)
        };

        for tracker in owned.trackers.iter().filter_map(Weak::upgrade) {
            tracker.close();
        }
        for listener in owned.listeners {
            self.registry.remove_listener(listener);
        }
        // Release this bundle's own uses before unregistering its services,
        // so an unregister never waits on a use the stopping bundle holds
        self.registry.release_bundle(self.bundle);
        for registration in owned.registrations.iter().filter_map(Weak::upgrade) {
            if let Err(e) = self.registry.unregister(&registration) {
                debug!(
                    "Service #{} already unregistered at bundle stop: {e}",
                    registration.id
                );
            }
        }
    }

    fn ensure_open(&self) -> service::Result<()> {
        if self.owned.lock().trace_expect("Failed to lock mutex").open {
            Ok(())
        } else {
            Err(service::Error::Closed)
        }
    }
}

impl std::fmt::Debug for BundleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleContext")
            .field("bundle", &self.bundle)
            .finish()
    }
}
