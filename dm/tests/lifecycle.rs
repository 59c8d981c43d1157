use bosun_dm::{
    Component, ComponentState, DependencyBuilder, DependencyManager, Object, Properties,
    UpdateStrategy,
};
use bosun_registry::{
    ServiceRegistry,
    bundle::BundleHost,
    config::Config,
    context::BundleContext,
    service,
};
use std::sync::{Arc, Mutex};

type CallLog = Arc<Mutex<Vec<String>>>;

fn host() -> (Arc<BundleHost>, Arc<BundleContext>) {
    let host = BundleHost::new(ServiceRegistry::new(&Config::default()));
    let context = host.context().clone();
    (host, context)
}

fn log_fn(log: CallLog, entry: &'static str) -> impl Fn() -> service::Result<()> + Send + Sync {
    move || {
        log.lock().unwrap().push(entry.to_string());
        Ok(())
    }
}

fn logged(log: &CallLog, entry: String) {
    log.lock().unwrap().push(entry);
}

fn take(log: &CallLog) -> Vec<String> {
    std::mem::take(&mut log.lock().unwrap())
}

fn unit() -> Object {
    Arc::new(())
}

fn lifecycle_builder(log: &CallLog, name: &str) -> bosun_dm::ComponentBuilder {
    Component::builder(name)
        .on_init(log_fn(log.clone(), "init"))
        .on_start(log_fn(log.clone(), "start"))
        .on_stop(log_fn(log.clone(), "stop"))
        .on_deinit(log_fn(log.clone(), "deinit"))
}

fn add_remove_dependency(log: &CallLog, name: &'static str, required: bool) -> DependencyBuilder {
    let add_log = log.clone();
    let remove_log = log.clone();
    DependencyBuilder::new(name)
        .required(required)
        .on_add(move |_t| {
            add_log.lock().unwrap().push(format!("add:{name}"));
            Ok(())
        })
        .on_remove(move |_t| {
            remove_log.lock().unwrap().push(format!("remove:{name}"));
            Ok(())
        })
}

#[test]
fn component_lifecycle_follows_required_dependency() {
    let (_host, context) = host();
    let manager = DependencyManager::new(context.clone());
    let log: CallLog = Default::default();

    let component = manager
        .add(
            lifecycle_builder(&log, "consumer")
                .dependency(add_remove_dependency(&log, "A", true))
                .dependency(add_remove_dependency(&log, "B", false)),
        )
        .unwrap();

    // Nothing there yet: the component waits
    assert_eq!(component.state(), ComponentState::WaitingForRequired);
    assert!(take(&log).is_empty());

    let a = context
        .register_service(&["A"], unit(), Properties::new())
        .unwrap();
    assert_eq!(component.state(), ComponentState::TrackingOptional);
    assert_eq!(take(&log), ["init", "start", "add:A"]);

    let _b = context
        .register_service(&["B"], unit(), Properties::new())
        .unwrap();
    assert_eq!(take(&log), ["add:B"]);

    // Losing the required dependency unwinds through Stopping
    a.unregister().unwrap();
    assert_eq!(take(&log), ["remove:A", "remove:B", "stop", "deinit"]);
    assert_eq!(component.state(), ComponentState::WaitingForRequired);

    // A new match re-instantiates, replaying the optional dependency
    let _a2 = context
        .register_service(&["A"], unit(), Properties::new())
        .unwrap();
    assert_eq!(component.state(), ComponentState::TrackingOptional);
    assert_eq!(take(&log), ["init", "start", "add:A", "add:B"]);
}

#[test]
fn component_without_required_dependencies_starts_immediately() {
    let (_host, context) = host();
    let manager = DependencyManager::new(context.clone());
    let log: CallLog = Default::default();

    let component = manager
        .add(lifecycle_builder(&log, "eager").dependency(add_remove_dependency(&log, "opt", false)))
        .unwrap();

    assert_eq!(component.state(), ComponentState::TrackingOptional);
    assert_eq!(take(&log), ["init", "start"]);

    manager.remove(&component);
    assert_eq!(component.state(), ComponentState::Inactive);
    assert_eq!(take(&log), ["stop", "deinit"]);
}

#[test]
fn set_dependency_follows_the_highest_ranked_service() {
    let (_host, context) = host();
    let manager = DependencyManager::new(context.clone());
    let log: CallLog = Default::default();
    let set_log = log.clone();

    let _component = manager
        .add(
            Component::builder("watcher").dependency(DependencyBuilder::new("S").on_set(
                move |tracked| {
                    let tag = tracked
                        .and_then(|t| t.properties.get("tag").map(str::to_string))
                        .unwrap_or_else(|| "none".to_string());
                    logged(&set_log, format!("set:{tag}"));
                    Ok(())
                },
            )),
        )
        .unwrap();
    assert!(take(&log).is_empty());

    let mut props = Properties::new();
    props.set("tag", "x");
    let x = context.register_service(&["S"], unit(), props).unwrap();
    assert_eq!(take(&log), ["set:x"]);

    let mut props = Properties::new();
    props.set("tag", "y");
    props.set("service.ranking", "10");
    let y = context.register_service(&["S"], unit(), props).unwrap();
    assert_eq!(take(&log), ["set:y"]);

    y.unregister().unwrap();
    assert_eq!(take(&log), ["set:x"]);

    x.unregister().unwrap();
    assert_eq!(take(&log), ["set:none"]);
}

#[test]
fn suspending_dependency_restarts_the_component_around_changes() {
    let (_host, context) = host();
    let manager = DependencyManager::new(context.clone());
    let log: CallLog = Default::default();

    let _component = manager
        .add(
            lifecycle_builder(&log, "suspended").dependency(
                add_remove_dependency(&log, "S", false).strategy(UpdateStrategy::Suspending),
            ),
        )
        .unwrap();
    assert_eq!(take(&log), ["init", "start"]);

    let s = context
        .register_service(&["S"], unit(), Properties::new())
        .unwrap();
    assert_eq!(take(&log), ["stop", "add:S", "start"]);

    s.unregister().unwrap();
    assert_eq!(take(&log), ["stop", "remove:S", "start"]);
}

#[test]
fn components_provide_services_while_active() {
    let (host, context) = host();
    let registry = host.registry().clone();
    let manager = DependencyManager::new(context.clone());
    let log: CallLog = Default::default();

    let mut provided_props = Properties::new();
    provided_props.set("provider", "pipeline");
    let _component = manager
        .add(
            lifecycle_builder(&log, "provider")
                .implementation(unit())
                .provides(&["sink"], provided_props)
                .dependency(add_remove_dependency(&log, "source", true)),
        )
        .unwrap();
    assert!(registry.get_reference("sink").is_none());

    let source = context
        .register_service(&["source"], unit(), Properties::new())
        .unwrap();
    let sink = registry.get_reference("sink").expect("sink published");
    assert_eq!(
        sink.properties().unwrap().get("provider"),
        Some("pipeline")
    );

    source.unregister().unwrap();
    assert!(registry.get_reference("sink").is_none());
}

#[test]
fn manager_shutdown_deactivates_components() {
    let (_host, context) = host();
    let log: CallLog = Default::default();
    let component;
    {
        let manager = DependencyManager::new(context.clone());
        component = manager
            .add(lifecycle_builder(&log, "short-lived"))
            .unwrap();
        assert_eq!(component.state(), ComponentState::TrackingOptional);
        take(&log);
        // Dropping the manager stops everything it still owns
    }
    assert_eq!(component.state(), ComponentState::Inactive);
    assert_eq!(take(&log), ["stop", "deinit"]);
}
