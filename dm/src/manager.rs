use super::*;
use bosun_registry::{context::BundleContext, service};
use super::component::{Component, ComponentBuilder};

/// Assembles components against one bundle context and drives their state
/// machines off the trackers behind their dependencies.
///
/// Dropping the manager (typically at bundle stop) deactivates every
/// component it still holds, in reverse add order.
pub struct DependencyManager {
    context: Arc<BundleContext>,
    components: Mutex<Vec<Arc<Component>>>,
}

impl DependencyManager {
    pub fn new(context: Arc<BundleContext>) -> Self {
        Self {
            context,
            components: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<BundleContext> {
        &self.context
    }

    /// Build the component and start tracking its dependencies. The
    /// component enters WAITING_FOR_REQUIRED and advances on its own as
    /// matches appear.
    pub fn add(&self, builder: ComponentBuilder) -> service::Result<Arc<Component>> {
        let component = builder.build(self.context.clone());
        self.components
            .lock()
            .trace_expect("Failed to lock mutex")
            .push(component.clone());
        component.activate()?;
        Ok(component)
    }

    /// Deactivate and forget the component.
    pub fn remove(&self, component: &Arc<Component>) {
        self.components
            .lock()
            .trace_expect("Failed to lock mutex")
            .retain(|c| !Arc::ptr_eq(c, component));
        component.deactivate();
    }

    pub fn components(&self) -> Vec<Arc<Component>> {
        self.components
            .lock()
            .trace_expect("Failed to lock mutex")
            .clone()
    }

    /// Deactivate everything, in reverse add order.
    pub fn shutdown(&self) {
        let components: Vec<_> = {
            let mut components = self.components.lock().trace_expect("Failed to lock mutex");
            components.drain(..).collect()
        };
        for component in components.iter().rev() {
            component.deactivate();
        }
    }
}

impl Drop for DependencyManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DependencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyManager")
            .field("bundle", &self.context.bundle_id())
            .field(
                "components",
                &self.components.lock().trace_expect("Failed to lock mutex").len(),
            )
            .finish()
    }
}
