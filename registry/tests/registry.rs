use bosun_properties::{OBJECT_CLASS, SERVICE_ID, SERVICE_RANKING};
use bosun_registry::{
    BundleId, Object, Properties, Provider, ServiceEvent, ServiceFactory, ServiceRegistry,
    config::Config,
    service::{self, EventKind},
};
use std::{
    sync::{Arc, Mutex, mpsc},
    time::Duration,
};

const BUNDLE_A: BundleId = 1;
const BUNDLE_B: BundleId = 2;

struct Calc {
    factor: i64,
}

impl Calc {
    fn apply(&self, value: i64) -> i64 {
        value * self.factor
    }
}

fn registry() -> Arc<ServiceRegistry> {
    ServiceRegistry::new(&Config::default())
}

fn calc(factor: i64) -> Object {
    Arc::new(Calc { factor })
}

fn ranked(ranking: i64) -> Properties {
    let mut props = Properties::new();
    props.set(SERVICE_RANKING, ranking.to_string());
    props
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ServiceEvent>>,
}

impl service::ServiceListener for Recorder {
    fn on_event(&self, event: &ServiceEvent) -> service::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

impl Recorder {
    fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

#[test]
fn references_rank_by_ranking_then_age() {
    let registry = registry();
    let r1 = registry
        .register_service(BUNDLE_A, &["calc"], Provider::Instance(calc(1)), Properties::new())
        .unwrap();
    let r2 = registry
        .register_service(BUNDLE_A, &["calc"], Provider::Instance(calc(2)), ranked(10))
        .unwrap();
    let r3 = registry
        .register_service(BUNDLE_A, &["calc"], Provider::Instance(calc(3)), ranked(10))
        .unwrap();

    let ids: Vec<_> = registry
        .get_references(Some("calc"), None)
        .iter()
        .map(|r| r.id())
        .collect();
    assert_eq!(ids, [r2.id(), r3.id(), r1.id()]);

    // The head of the order is the highest-ranked, oldest service
    assert_eq!(registry.get_reference("calc").unwrap().id(), r2.id());
}

#[test]
fn service_ids_strictly_increase() {
    let registry = registry();
    let mut last = 0;
    for name in ["a", "b", "c", "d"] {
        let registration = registry
            .register_service(BUNDLE_A, &[name], Provider::Instance(calc(0)), Properties::new())
            .unwrap();
        assert!(registration.id() > last);
        last = registration.id();
    }
}

#[test]
fn system_properties_are_present_and_authoritative() {
    let registry = registry();
    let registration = registry
        .register_service(
            BUNDLE_A,
            &["calc", "math"],
            Provider::Instance(calc(1)),
            Properties::new(),
        )
        .unwrap();

    let props = registration.properties();
    assert_eq!(props.get(SERVICE_ID), Some(registration.id().to_string().as_str()));
    assert_eq!(props.get(OBJECT_CLASS), Some("calc,math"));
    assert_eq!(props.get(SERVICE_RANKING), Some("0"));

    // A modification cannot forge the system keys
    let mut forged = Properties::new();
    forged.set(SERVICE_ID, "9999");
    forged.set(OBJECT_CLASS, "impostor");
    registration.set_properties(forged).unwrap();

    let props = registration.properties();
    assert_eq!(props.get(SERVICE_ID), Some(registration.id().to_string().as_str()));
    assert_eq!(props.get(OBJECT_CLASS), Some("calc,math"));
}

#[test]
fn registration_validates_names() {
    let registry = registry();
    assert!(matches!(
        registry.register_service(BUNDLE_A, &[], Provider::Instance(calc(0)), Properties::new()),
        Err(service::Error::NoServiceNames)
    ));
    assert!(matches!(
        registry.register_service(BUNDLE_A, &[""], Provider::Instance(calc(0)), Properties::new()),
        Err(service::Error::EmptyServiceName)
    ));
}

#[test]
fn empty_lookup_returns_everything() {
    let registry = registry();
    let _keep: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            registry
                .register_service(BUNDLE_A, &[name], Provider::Instance(calc(0)), Properties::new())
                .unwrap()
        })
        .collect();
    assert_eq!(registry.get_references(None, None).len(), 3);
    assert_eq!(registry.get_references(Some(""), None).len(), 3);
    assert!(registry.get_references(Some("missing"), None).is_empty());
}

#[test]
fn filtered_lookup_matches_properties() {
    let registry = registry();
    let mut props = Properties::new();
    props.set("flavour", "sweet");
    let sweet = registry
        .register_service(BUNDLE_A, &["jam"], Provider::Instance(calc(1)), props)
        .unwrap();
    let mut props = Properties::new();
    props.set("flavour", "sour");
    let _sour = registry
        .register_service(BUNDLE_A, &["jam"], Provider::Instance(calc(2)), props)
        .unwrap();

    let filter = "(flavour=sweet)".parse().unwrap();
    let refs = registry.get_references(Some("jam"), Some(&filter));
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].id(), sweet.id());
}

#[test]
fn get_service_counts_uses() {
    let registry = registry();
    let registration = registry
        .register_service(BUNDLE_A, &["calc"], Provider::Instance(calc(3)), Properties::new())
        .unwrap();
    let reference = registration.reference();

    let first = registry.get_service(BUNDLE_B, &reference).unwrap();
    let second = registry.get_service(BUNDLE_B, &reference).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.clone().downcast::<Calc>().unwrap().apply(2), 6);
    assert_eq!(registry.get_using_bundles(&reference), [BUNDLE_B]);

    assert!(registry.unget_service(BUNDLE_B, &reference));
    assert!(registry.unget_service(BUNDLE_B, &reference));
    assert!(!registry.unget_service(BUNDLE_B, &reference));
    assert!(registry.get_using_bundles(&reference).is_empty());
}

#[derive(Default)]
struct CountingFactory {
    gets: Mutex<Vec<BundleId>>,
    ungets: Mutex<Vec<BundleId>>,
}

impl ServiceFactory for CountingFactory {
    fn get(&self, bundle: BundleId, _properties: &Arc<Properties>) -> service::Result<Object> {
        self.gets.lock().unwrap().push(bundle);
        Ok(calc(bundle as i64))
    }

    fn unget(&self, bundle: BundleId, _service: Object) {
        self.ungets.lock().unwrap().push(bundle);
    }
}

#[test]
fn factory_invoked_once_per_bundle() {
    let registry = registry();
    let factory = Arc::new(CountingFactory::default());
    let registration = registry
        .register_service(
            BUNDLE_A,
            &["factoryService"],
            Provider::Factory(factory.clone()),
            Properties::new(),
        )
        .unwrap();
    let reference = registration.reference();

    let first = registry.get_service(BUNDLE_A, &reference).unwrap();
    let second = registry.get_service(BUNDLE_A, &reference).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*factory.gets.lock().unwrap(), [BUNDLE_A]);

    // A different bundle gets its own instance
    let other = registry.get_service(BUNDLE_B, &reference).unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(*factory.gets.lock().unwrap(), [BUNDLE_A, BUNDLE_B]);

    assert!(registry.unget_service(BUNDLE_A, &reference));
    assert!(factory.ungets.lock().unwrap().is_empty());
    assert!(registry.unget_service(BUNDLE_A, &reference));
    assert_eq!(*factory.ungets.lock().unwrap(), [BUNDLE_A]);

    assert!(registry.unget_service(BUNDLE_B, &reference));
    assert_eq!(*factory.ungets.lock().unwrap(), [BUNDLE_A, BUNDLE_B]);
}

struct FailingFactory {
    calls: Mutex<usize>,
}

impl ServiceFactory for FailingFactory {
    fn get(&self, _bundle: BundleId, _properties: &Arc<Properties>) -> service::Result<Object> {
        *self.calls.lock().unwrap() += 1;
        Err(service::Error::Bundle("no instances today".into()))
    }

    fn unget(&self, _bundle: BundleId, _service: Object) {
        panic!("unget must only follow a successful get");
    }
}

#[test]
fn factory_failure_does_not_unregister() {
    let registry = registry();
    let factory = Arc::new(FailingFactory {
        calls: Mutex::new(0),
    });
    let registration = registry
        .register_service(
            BUNDLE_A,
            &["factoryService"],
            Provider::Factory(factory.clone()),
            Properties::new(),
        )
        .unwrap();
    let reference = registration.reference();

    assert!(matches!(
        registry.get_service(BUNDLE_B, &reference),
        Err(service::Error::Bundle(_))
    ));
    // The registration survives, and a later get tries the factory again
    assert_eq!(registry.get_references(Some("factoryService"), None).len(), 1);
    let _ = registry.get_service(BUNDLE_B, &reference);
    assert_eq!(*factory.calls.lock().unwrap(), 2);
}

#[test]
fn unregister_blocks_until_released() {
    let registry = registry();
    let registration = registry
        .register_service(BUNDLE_A, &["calc"], Provider::Instance(calc(1)), Properties::new())
        .unwrap();
    let reference = registration.reference();

    let _held = registry.get_service(BUNDLE_A, &reference).unwrap();

    let (tx, rx) = mpsc::channel();
    let worker = std::thread::spawn(move || {
        tx.send("starting").unwrap();
        registration.unregister().unwrap();
        tx.send("returned").unwrap();
    });

    assert_eq!(rx.recv().unwrap(), "starting");
    // The unregister must not return while bundle A holds a use
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    // New acquisitions already fail while unregistering
    assert!(matches!(
        registry.get_service(BUNDLE_B, &reference),
        Err(service::Error::NoService)
    ));

    assert!(registry.unget_service(BUNDLE_A, &reference));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).expect("unregister should return"),
        "returned"
    );
    worker.join().unwrap();
    assert!(!reference.alive());
}

#[test]
fn unregister_twice_is_an_error() {
    let registry = registry();
    let registration = registry
        .register_service(BUNDLE_A, &["calc"], Provider::Instance(calc(1)), Properties::new())
        .unwrap();
    registration.unregister().unwrap();
    assert!(matches!(
        registration.unregister(),
        Err(service::Error::NotRegistered)
    ));
}

#[test]
fn dead_references_compare_but_resolve_to_nothing() {
    let registry = registry();
    let registration = registry
        .register_service(BUNDLE_A, &["calc"], Provider::Instance(calc(1)), Properties::new())
        .unwrap();
    let reference = registration.reference();
    let twin = registration.reference();
    assert_eq!(reference, twin);

    registration.unregister().unwrap();
    drop(registration);

    assert!(!reference.alive());
    assert_eq!(reference, twin);
    assert!(reference.properties().is_none());
    assert!(matches!(
        registry.get_service(BUNDLE_B, &reference),
        Err(service::Error::NoService)
    ));
}

#[test]
fn listeners_see_lifecycle_in_order() {
    let registry = registry();
    let recorder = Arc::new(Recorder::default());
    registry.add_listener(BUNDLE_B, None, recorder.clone());

    let registration = registry
        .register_service(BUNDLE_A, &["calc"], Provider::Instance(calc(1)), Properties::new())
        .unwrap();
    let mut props = Properties::new();
    props.set("k", "v");
    registration.set_properties(props).unwrap();
    registration.unregister().unwrap();

    assert_eq!(
        recorder.kinds(),
        [EventKind::Registered, EventKind::Modified, EventKind::Unregistering]
    );

    let events = recorder.events.lock().unwrap();
    assert!(events.iter().all(|e| e.reference.id() == 1));
    // The Modified event carries both snapshots
    assert_eq!(events[1].properties.get("k"), Some("v"));
    assert_eq!(events[1].previous.as_ref().unwrap().get("k"), None);
}

#[test]
fn modified_endmatch_when_filter_stops_matching() {
    let registry = registry();
    let recorder = Arc::new(Recorder::default());
    registry.add_listener(BUNDLE_B, Some("(key=a)".parse().unwrap()), recorder.clone());

    let mut props = Properties::new();
    props.set("key", "a");
    let registration = registry
        .register_service(BUNDLE_A, &["svc"], Provider::Instance(calc(1)), props)
        .unwrap();

    let mut props = Properties::new();
    props.set("key", "b");
    registration.set_properties(props).unwrap();

    let mut props = Properties::new();
    props.set("key", "a");
    registration.set_properties(props).unwrap();

    assert_eq!(
        recorder.kinds(),
        [
            EventKind::Registered,
            EventKind::ModifiedEndMatch,
            EventKind::Modified
        ]
    );
}

#[test]
fn rewriting_identical_properties_is_observationally_a_no_op() {
    let registry = registry();
    let recorder = Arc::new(Recorder::default());
    registry.add_listener(BUNDLE_B, None, recorder.clone());

    let mut props = Properties::new();
    props.set("k", "v");
    let registration = registry
        .register_service(BUNDLE_A, &["svc"], Provider::Instance(calc(1)), props.clone())
        .unwrap();
    registration.set_properties(props).unwrap();

    let events = recorder.events.lock().unwrap();
    assert_eq!(events.len(), 2);
    let modified = &events[1];
    assert_eq!(modified.kind, EventKind::Modified);
    assert_eq!(
        modified.previous.as_ref().unwrap().as_ref(),
        modified.properties.as_ref()
    );
}

#[test]
fn listener_failure_does_not_stop_dispatch() {
    let registry = registry();
    registry.add_listener(
        BUNDLE_A,
        None,
        Arc::new(|_: &ServiceEvent| -> service::Result<()> {
            Err(service::Error::Bundle("broken listener".into()))
        }),
    );
    let recorder = Arc::new(Recorder::default());
    registry.add_listener(BUNDLE_B, None, recorder.clone());

    let _registration = registry
        .register_service(BUNDLE_A, &["svc"], Provider::Instance(calc(1)), Properties::new())
        .unwrap();
    assert_eq!(recorder.kinds(), [EventKind::Registered]);
}

#[test]
fn removed_listeners_hear_nothing_more() {
    let registry = registry();
    let recorder = Arc::new(Recorder::default());
    let id = registry.add_listener(BUNDLE_B, None, recorder.clone());

    let _first = registry
        .register_service(BUNDLE_A, &["one"], Provider::Instance(calc(1)), Properties::new())
        .unwrap();
    registry.remove_listener(id);
    let _second = registry
        .register_service(BUNDLE_A, &["two"], Provider::Instance(calc(2)), Properties::new())
        .unwrap();

    assert_eq!(recorder.kinds(), [EventKind::Registered]);
}

#[test]
fn callbacks_may_register_services_reentrantly() {
    let registry = registry();
    let inner = registry.clone();
    let spawned: Arc<Mutex<Vec<bosun_registry::ServiceRegistration>>> = Default::default();
    let keep = spawned.clone();

    registry.add_listener(
        BUNDLE_B,
        None,
        Arc::new(move |event: &ServiceEvent| -> service::Result<()> {
            if event.kind == EventKind::Registered
                && event.properties.get(OBJECT_CLASS) == Some("first")
            {
                let registration = inner.register_service(
                    BUNDLE_B,
                    &["second"],
                    Provider::Instance(Arc::new(()) as Object),
                    Properties::new(),
                )?;
                keep.lock().unwrap().push(registration);
            }
            Ok(())
        }),
    );

    let _first = registry
        .register_service(BUNDLE_A, &["first"], Provider::Instance(calc(1)), Properties::new())
        .unwrap();

    // The nested registration was deferred past the dispatch, then applied
    assert_eq!(registry.get_references(Some("second"), None).len(), 1);
    assert_eq!(spawned.lock().unwrap().len(), 1);
}

#[test]
fn shutdown_unregisters_everything() {
    let registry = registry();
    let keep: Vec<_> = ["a", "b"]
        .iter()
        .map(|name| {
            registry
                .register_service(BUNDLE_A, &[name], Provider::Instance(calc(1)), Properties::new())
                .unwrap()
        })
        .collect();

    registry.shutdown();
    assert_eq!(registry.service_count(), 0);
    for registration in &keep {
        assert!(matches!(
            registration.unregister(),
            Err(service::Error::NotRegistered)
        ));
    }
}
