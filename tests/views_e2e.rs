use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use metaview::config::RetryPolicy;
use metaview::{
    Expression, InMemoryTransport, Message, MetadataRecord, Node, PayloadObject, Transport, TransportError,
    ViewManager, ViewManagerConfig, ViewStream,
};

const WAIT: Duration = Duration::from_secs(5);

fn manager() -> (Arc<InMemoryTransport>, Arc<ViewManager>) {
    let transport = Arc::new(InMemoryTransport::new());
    let cfg = ViewManagerConfig {
        // One ingest worker keeps per-namespace arrival order.
        namespace_workers: 1,
        forwarder_workers: 1,
        retry: RetryPolicy::none(),
        ..ViewManagerConfig::default()
    };
    let vm = ViewManager::with_memory_index(cfg, transport.clone()).unwrap();
    (transport, vm)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Receive until a message on `topic` shows up, skipping anything else.
fn recv_topic(stream: &ViewStream, topic: &str) -> Option<Arc<Message>> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Some(msg) = stream.recv_timeout(Duration::from_millis(50)).unwrap() {
            if msg.topic == topic {
                return Some(msg);
            }
        }
    }
    None
}

fn publish_meta(t: &InMemoryTransport, topic: &str, value: &str) {
    t.publish(Message::new(topic, "vk-sensor", vec![PayloadObject::metadata(value, 1)]))
        .unwrap();
}

fn denied_query(topic: &str) -> TransportError {
    TransportError::QueryFailed {
        topic: topic.to_string(),
        message: "denied".to_string(),
        transient: false,
    }
}

#[test]
fn indexed_record_is_matched_after_one_pass() {
    let (_transport, vm) = manager();
    vm.index()
        .insert(MetadataRecord::new("ns1", "/bldg1/rm1", "rm1", "occupied=true", "vk", 1))
        .unwrap();

    let reg = vm
        .register_view(Expression::new(["ns1"], Node::key_equals("rm1")))
        .unwrap();
    vm.reconcile_all().unwrap();

    let hits = vm.index().exec(reg.view.expression()).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uri, "/bldg1/rm1");
    assert!(reg.view.is_matched("/bldg1/rm1").unwrap());
    assert!(vm.has_forwarder("/bldg1/rm1").unwrap());
}

#[test]
fn live_metadata_starts_and_stops_forwarding() {
    let (transport, vm) = manager();
    let reg = vm
        .register_view(Expression::new(["ns1"], Node::entry("location", "floor2")))
        .unwrap();
    assert_eq!(vm.forwarder_count().unwrap(), 0);

    publish_meta(&transport, "ns1/bldg1/rm1/!meta/location", "floor2");
    assert!(wait_until(|| vm.has_forwarder("ns1/bldg1/rm1/*").unwrap()));
    assert!(reg.view.is_matched("ns1/bldg1/rm1/*").unwrap());

    // The triggering metadata message is handed on.
    assert!(recv_topic(&reg.stream, "ns1/bldg1/rm1/!meta/location").is_some());

    transport
        .publish(Message::new("ns1/bldg1/rm1/temp", "vk-sensor", vec![PayloadObject::text("21.5")]))
        .unwrap();
    let data = recv_topic(&reg.stream, "ns1/bldg1/rm1/temp").unwrap();
    assert_eq!(data.payloads[0].contents, b"21.5".to_vec());

    // Tombstone removes the path and the forwarder with it.
    publish_meta(&transport, "ns1/bldg1/rm1/!meta/location", "");
    assert!(wait_until(|| !vm.has_forwarder("ns1/bldg1/rm1/*").unwrap()));
    assert!(reg.view.matched_paths().unwrap().is_empty());
    assert_eq!(transport.subscriptions_on("ns1/bldg1/rm1/*"), 0);
}

#[test]
fn metadata_published_before_registration_is_replayed() {
    let (transport, vm) = manager();
    publish_meta(&transport, "ns1/bldg1/rm1/!meta/location", "floor2");
    publish_meta(&transport, "ns1/bldg1/rm2/!meta/location", "floor3");

    let reg = vm
        .register_view(Expression::new(["ns1"], Node::entry("location", "floor2")))
        .unwrap();

    assert!(wait_until(|| reg.view.is_matched("ns1/bldg1/rm1/*").unwrap()));
    assert!(!reg.view.is_matched("ns1/bldg1/rm2/*").unwrap());
    assert_eq!(transport.query_calls(), 1);
}

#[test]
fn one_subscription_per_namespace() {
    let (transport, vm) = manager();
    let _a = vm
        .register_view(Expression::new(["ns1"], Node::key_equals("location")))
        .unwrap();
    let _b = vm
        .register_view(Expression::new(["ns1"], Node::key_equals("owner")))
        .unwrap();
    let _c = vm
        .register_view(Expression::new(["ns1", "ns2"], Node::All))
        .unwrap();

    assert_eq!(vm.namespace_subscription_count().unwrap(), 2);
    assert_eq!(transport.subscriptions_on("ns1/*/!meta/+"), 1);
    assert_eq!(transport.subscriptions_on("ns2/*/!meta/+"), 1);
    assert_eq!(transport.query_calls(), 2);
    assert_eq!(vm.view_count().unwrap(), 3);
}

#[test]
fn concurrent_registrations_share_namespace_subscription() {
    let (transport, vm) = manager();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let vm = Arc::clone(&vm);
            thread::spawn(move || {
                vm.register_view(Expression::new(["ns1"], Node::key_equals(format!("k{i}"))))
                    .unwrap()
            })
        })
        .collect();
    let regs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(regs.len(), 8);
    assert_eq!(transport.subscriptions_on("ns1/*/!meta/+"), 1);
    assert_eq!(vm.namespace_subscription_count().unwrap(), 1);
}

#[test]
fn failed_history_query_rolls_back_registration() {
    let (transport, vm) = manager();
    transport.fail_next_query(denied_query("ns1/*/!meta/+"));

    let err = vm.register_view(Expression::new(["ns1"], Node::All)).unwrap_err();
    assert!(err.is_transport());
    assert_eq!(vm.namespace_subscription_count().unwrap(), 0);
    assert_eq!(vm.view_count().unwrap(), 0);
    assert_eq!(transport.active_subscriptions(), 0);

    // A later attempt starts from scratch.
    vm.register_view(Expression::new(["ns1"], Node::All)).unwrap();
    assert_eq!(vm.namespace_subscription_count().unwrap(), 1);
}

#[test]
fn failure_on_second_namespace_releases_the_first() {
    let (transport, vm) = manager();
    transport.fail_query_to("ns2/*/!meta/+", denied_query("ns2/*/!meta/+"));

    let err = vm
        .register_view(Expression::new(["ns1", "ns2"], Node::All))
        .unwrap_err();
    assert!(err.is_transport());
    assert_eq!(vm.namespace_subscription_count().unwrap(), 0);
    assert_eq!(transport.subscriptions_on("ns1/*/!meta/+"), 0);
    assert_eq!(transport.active_subscriptions(), 0);
}

#[test]
fn existing_namespaces_survive_a_failed_registration() {
    let (transport, vm) = manager();
    vm.register_view(Expression::new(["ns1"], Node::All)).unwrap();
    transport.fail_subscribe_to(
        "ns2/*/!meta/+",
        TransportError::SubscribeFailed {
            topic: "ns2/*/!meta/+".to_string(),
            message: "denied".to_string(),
            transient: false,
        },
    );

    assert!(vm.register_view(Expression::new(["ns1", "ns2"], Node::All)).is_err());
    assert_eq!(vm.namespace_subscription_count().unwrap(), 1);
    assert_eq!(transport.subscriptions_on("ns1/*/!meta/+"), 1);
    assert_eq!(vm.view_count().unwrap(), 1);
}

#[test]
fn equal_expressions_share_forwarders() {
    let (transport, vm) = manager();
    let expr = Expression::new(["ns1"], Node::entry("location", "floor2"));
    let a = vm.register_view(expr.clone()).unwrap();
    let b = vm.register_view(expr).unwrap();
    assert_eq!(vm.expression_group_count().unwrap(), 1);
    assert_eq!(a.view.hash(), b.view.hash());

    publish_meta(&transport, "ns1/bldg1/rm1/!meta/location", "floor2");
    assert!(wait_until(|| vm.forwarder_interest("ns1/bldg1/rm1/*").unwrap().len() == 2));
    assert_eq!(transport.subscriptions_on("ns1/bldg1/rm1/*"), 1);

    vm.unregister_view(a.view.id()).unwrap();
    assert!(vm.has_forwarder("ns1/bldg1/rm1/*").unwrap());
    assert_eq!(vm.forwarder_interest("ns1/bldg1/rm1/*").unwrap(), vec![b.view.id()]);

    vm.unregister_view(b.view.id()).unwrap();
    assert!(!vm.has_forwarder("ns1/bldg1/rm1/*").unwrap());
    assert_eq!(transport.subscriptions_on("ns1/bldg1/rm1/*"), 0);
    assert_eq!(vm.expression_group_count().unwrap(), 0);
    // Namespace subscriptions outlive the views that opened them.
    assert_eq!(vm.namespace_subscription_count().unwrap(), 1);
}

#[test]
fn late_view_receives_initial_match_only_for_itself() {
    let (transport, vm) = manager();
    let expr = Expression::new(["ns1"], Node::key_equals("location"));
    let first = vm.register_view(expr.clone()).unwrap();

    publish_meta(&transport, "ns1/a/!meta/location", "x");
    assert!(recv_topic(&first.stream, "ns1/a/!meta/location").is_some());

    let second = vm.register_view(expr).unwrap();
    assert!(second.view.is_matched("ns1/a/*").unwrap());
    assert!(recv_topic(&second.stream, "ns1/a/!meta/location").is_some());
    assert!(first.stream.try_recv().unwrap().is_none());
}

#[test]
fn aliases_resolve_to_routing_identity() {
    let (transport, vm) = manager();
    transport.register_alias("building", "vk-bldg");

    let reg = vm
        .register_view(Expression::new(["building"], Node::key_equals("location")))
        .unwrap();
    assert!(reg.view.expression().has_namespace("vk-bldg"));
    assert_eq!(transport.subscriptions_on("vk-bldg/*/!meta/+"), 1);

    publish_meta(&transport, "vk-bldg/rm1/!meta/location", "floor1");
    assert!(wait_until(|| reg.view.is_matched("vk-bldg/rm1/*").unwrap()));
}

#[test]
fn match_sets_converge_with_index() {
    let (transport, vm) = manager();
    let regs: Vec<_> = ["floor1", "floor2"]
        .iter()
        .map(|f| {
            vm.register_view(Expression::new(["ns1"], Node::entry("location", *f)))
                .unwrap()
        })
        .collect();

    for (room, floor) in [("r1", "floor1"), ("r2", "floor2"), ("r3", "floor1"), ("r2", "floor1")] {
        publish_meta(&transport, &format!("ns1/{room}/!meta/location"), floor);
    }
    publish_meta(&transport, "ns1/r3/!meta/location", "");

    let converged = || {
        vm.reconcile_all().unwrap();
        regs.iter().all(|r| {
            let mut expected: Vec<String> = vm
                .index()
                .exec(r.view.expression())
                .unwrap()
                .into_iter()
                .map(|rec| rec.uri)
                .collect();
            expected.sort();
            r.view.matched_paths().unwrap() == expected
        })
    };
    assert!(wait_until(|| vm.index().len().unwrap() == 2 && converged()));

    assert_eq!(regs[0].view.matched_paths().unwrap(), vec!["ns1/r1/*", "ns1/r2/*"]);
    assert!(regs[1].view.matched_paths().unwrap().is_empty());
    assert_eq!(vm.forwarder_count().unwrap(), 2);
}

#[test]
fn failed_initial_forwarding_drops_the_view() {
    let (transport, vm) = manager();
    vm.register_view(Expression::new(["ns1"], Node::All)).unwrap();
    vm.index()
        .insert(MetadataRecord::new("ns1", "ns1/a/*", "k", "v", "vk", 1))
        .unwrap();
    vm.reconcile_all().unwrap();

    vm.index()
        .insert(MetadataRecord::new("ns1", "ns1/b/*", "owner", "v", "vk", 1))
        .unwrap();
    transport.fail_subscribe_to(
        "ns1/b/*",
        TransportError::SubscribeFailed {
            topic: "ns1/b/*".to_string(),
            message: "denied".to_string(),
            transient: false,
        },
    );
    let before = vm.view_count().unwrap();
    let err = vm
        .register_view(Expression::new(["ns1"], Node::key_equals("owner")))
        .unwrap_err();
    assert!(err.is_transport());
    assert_eq!(vm.view_count().unwrap(), before);
    assert!(!vm.has_forwarder("ns1/b/*").unwrap());
}

#[test]
fn shutdown_releases_every_subscription() {
    let (transport, vm) = manager();
    let reg = vm.register_view(Expression::new(["ns1"], Node::All)).unwrap();
    publish_meta(&transport, "ns1/a/!meta/k", "v");
    assert!(wait_until(|| vm.forwarder_count().unwrap() == 1));

    vm.shutdown().unwrap();
    assert_eq!(transport.active_subscriptions(), 0);
    assert!(reg.view.matched_paths().unwrap().is_empty());
    assert!(vm.register_view(Expression::new(["ns1"], Node::All)).is_err());
}
