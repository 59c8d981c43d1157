use super::*;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("A service must be registered under at least one name")]
    NoServiceNames,

    #[error("Service names may not be empty")]
    EmptyServiceName,

    #[error(transparent)]
    InvalidFilter(#[from] bosun_filter::Error),

    #[error("The registration has already been unregistered")]
    NotRegistered,

    #[error("There is no such service")]
    NoService,

    #[error("The service does not have the requested type")]
    WrongType,

    #[error("Used after close")]
    Closed,

    #[error(transparent)]
    Bundle(#[from] Box<dyn core::error::Error + Send + Sync>),
}

/// Token returned by listener registration, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A service was registered.
    Registered,
    /// A registration's properties were replaced.
    Modified,
    /// A property change made the registration stop matching the
    /// listener's filter. Synthesized per listener.
    ModifiedEndMatch,
    /// The registration is going away. New `get_service` calls already
    /// fail; held instances stay valid until released.
    Unregistering,
}

#[derive(Clone)]
pub struct ServiceEvent {
    pub kind: EventKind,
    pub reference: ServiceReference,
    /// Property snapshot at the time the event was raised.
    pub properties: Arc<Properties>,
    /// The snapshot a Modified/ModifiedEndMatch change replaced.
    pub previous: Option<Arc<Properties>>,
}

impl std::fmt::Debug for ServiceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEvent")
            .field("kind", &self.kind)
            .field("service", &self.reference.id())
            .finish()
    }
}

/// Receives registry change events.
///
/// Callbacks run inside event dispatch, under the registry read lock: they
/// must return promptly and must not block on external I/O. Registry
/// mutations made from inside a callback are queued and applied after the
/// dispatch unwinds. A returned error is logged against the owning bundle
/// and does not affect other listeners.
pub trait ServiceListener: Send + Sync {
    fn on_event(&self, event: &ServiceEvent) -> Result<()>;
}

impl<F> ServiceListener for F
where
    F: Fn(&ServiceEvent) -> Result<()> + Send + Sync,
{
    fn on_event(&self, event: &ServiceEvent) -> Result<()> {
        (self)(event)
    }
}

/// Produces per-requester service instances on demand.
pub trait ServiceFactory: Send + Sync {
    /// Produce the instance handed to `bundle`. Invoked at most once per
    /// (bundle, registration) pair while the instance remains in use; the
    /// registry serializes `get`/`unget` for one bundle.
    fn get(&self, bundle: BundleId, properties: &Arc<Properties>) -> Result<Object>;

    /// Invoked once the last use by `bundle` has been released, exactly as
    /// many times as `get` succeeded.
    fn unget(&self, bundle: BundleId, service: Object);
}

/// What a registration hands out: a shared instance, or a factory that
/// produces one instance per requesting bundle.
pub enum Provider {
    Instance(Object),
    Factory(Arc<dyn ServiceFactory>),
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Instance(_) => f.write_str("Instance"),
            Provider::Factory(_) => f.write_str("Factory"),
        }
    }
}
