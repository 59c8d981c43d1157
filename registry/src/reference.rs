use super::*;
use super::registration::Registration;

/// A cheap, copyable handle to a service registration.
///
/// Equality, ordering and hashing are by service id alone, so references
/// stay comparable after the registration is gone. A reference whose
/// registration has been dropped is "dead": it no longer resolves and
/// `get_service` on it reports no such service.
#[derive(Clone)]
pub struct ServiceReference {
    id: ServiceId,
    target: Weak<Registration>,
}

impl ServiceReference {
    pub(crate) fn new(id: ServiceId, target: Weak<Registration>) -> Self {
        Self { id, target }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// Current property snapshot, or `None` for a dead reference.
    pub fn properties(&self) -> Option<Arc<Properties>> {
        self.target.upgrade().map(|reg| reg.properties())
    }

    pub fn ranking(&self) -> i32 {
        self.target.upgrade().map(|reg| reg.ranking()).unwrap_or(0)
    }

    pub fn alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Registration>> {
        self.target.upgrade()
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceReference {}

impl PartialOrd for ServiceReference {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceReference {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::hash::Hash for ServiceReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.id)
            .field("alive", &self.alive())
            .finish()
    }
}
