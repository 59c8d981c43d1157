use super::*;
use super::context::BundleContext;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Installed,
    Active,
}

/// The hooks a bundle implements. Construction of the activator value is
/// the create step; dropping it (at uninstall) is the destroy step.
///
/// `start` and `stop` report failure through the normal error taxonomy; a
/// failed `start` leaves the bundle installed with its context closed.
pub trait BundleActivator: Send + Sync {
    fn start(&self, context: &Arc<BundleContext>) -> service::Result<()>;

    fn stop(&self, _context: &Arc<BundleContext>) -> service::Result<()> {
        Ok(())
    }
}

struct Lifecycle {
    state: BundleState,
    context: Option<Arc<BundleContext>>,
}

pub struct Bundle {
    id: BundleId,
    activator: Box<dyn BundleActivator>,
    lifecycle: Mutex<Lifecycle>,
}

impl Bundle {
    pub fn id(&self) -> BundleId {
        self.id
    }

    pub fn state(&self) -> BundleState {
        self.lifecycle
            .lock()
            .trace_expect("Failed to lock mutex")
            .state
    }

    /// The bundle's context while it is active.
    pub fn context(&self) -> Option<Arc<BundleContext>> {
        self.lifecycle
            .lock()
            .trace_expect("Failed to lock mutex")
            .context
            .clone()
    }
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Hosts bundles against one registry: assigns bundle identities, runs the
/// activator hooks, and guarantees that stopping a bundle tears down every
/// registration, tracker and listener it owns.
pub struct BundleHost {
    registry: Arc<ServiceRegistry>,
    host_context: Arc<BundleContext>,
    next_bundle_id: AtomicU64,
    bundles: RwLock<BTreeMap<BundleId, Arc<Bundle>>>,
}

impl BundleHost {
    pub fn new(registry: Arc<ServiceRegistry>) -> Arc<Self> {
        Arc::new(Self {
            host_context: BundleContext::new(0, registry.clone()),
            registry,
            next_bundle_id: AtomicU64::new(1),
            bundles: Default::default(),
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// The host's own context (bundle 0), for code that lives outside any
    /// installed bundle.
    pub fn context(&self) -> &Arc<BundleContext> {
        &self.host_context
    }

    pub fn install(&self, activator: Box<dyn BundleActivator>) -> Arc<Bundle> {
        let id = self.next_bundle_id.fetch_add(1, Ordering::Relaxed);
        let bundle = Arc::new(Bundle {
            id,
            activator,
            lifecycle: Mutex::new(Lifecycle {
                state: BundleState::Installed,
                context: None,
            }),
        });
        self.bundles
            .write()
            .trace_expect("Failed to lock mutex")
            .insert(id, bundle.clone());
        info!("Installed bundle {id}");
        bundle
    }

    pub fn get(&self, id: BundleId) -> Option<Arc<Bundle>> {
        self.bundles
            .read()
            .trace_expect("Failed to lock mutex")
            .get(&id)
            .cloned()
    }

    pub fn start(&self, bundle: &Arc<Bundle>) -> service::Result<()> {
        let mut lifecycle = bundle
            .lifecycle
            .lock()
            .trace_expect("Failed to lock mutex");
        if lifecycle.state == BundleState::Active {
            return Ok(());
        }

        let context = BundleContext::new(bundle.id, self.registry.clone());
        match bundle.activator.start(&context) {
            Ok(()) => {
                lifecycle.context = Some(context);
                lifecycle.state = BundleState::Active;
                info!("Started bundle {}", bundle.id);
                Ok(())
            }
            Err(e) => {
                warn!("Bundle {} failed to start: {e}", bundle.id);
                context.close();
                Err(e)
            }
        }
    }

    pub fn stop(&self, bundle: &Arc<Bundle>) -> service::Result<()> {
        let context = {
            let mut lifecycle = bundle
                .lifecycle
                .lock()
                .trace_expect("Failed to lock mutex");
            if lifecycle.state != BundleState::Active {
                return Ok(());
            }
            lifecycle.state = BundleState::Installed;
            lifecycle.context.take()
        };

        let Some(context) = context else {
            return Ok(());
        };

        let stopped = bundle.activator.stop(&context);
        if let Err(e) = &stopped {
            warn!("Bundle {} failed to stop cleanly: {e}", bundle.id);
        }
        context.close();
        info!("Stopped bundle {}", bundle.id);
        stopped
    }

    /// Stop (if needed) and drop the bundle; dropping the activator is the
    /// destroy hook.
    pub fn uninstall(&self, bundle: &Arc<Bundle>) -> service::Result<()> {
        let stopped = self.stop(bundle);
        self.bundles
            .write()
            .trace_expect("Failed to lock mutex")
            .remove(&bundle.id);
        info!("Uninstalled bundle {}", bundle.id);
        stopped
    }

    /// Stop every bundle in reverse install order, then drain the registry.
    pub fn shutdown(&self) {
        let bundles: Vec<_> = {
            self.bundles
                .read()
                .trace_expect("Failed to lock mutex")
                .values()
                .cloned()
                .collect()
        };

        for bundle in bundles.iter().rev() {
            let _ = self.stop(bundle);
        }
        self.host_context.close();
        self.registry.shutdown();
    }
}

impl std::fmt::Debug for BundleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleHost")
            .field("bundles", &self.bundles.read().trace_expect("Failed to lock mutex").len())
            .finish()
    }
}
