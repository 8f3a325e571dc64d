//! Cluster routing against scripted nodes: MOVED, ASK, READONLY, redirect
//! limit, discovery fallbacks and batch grouping.
//!
//! Keys and their slots: `key:2368` → 5000, `foo` → 12182.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use common::{bind, bulk, cluster_slots, error, ok, port_of, Action, MockNode};
use rsedis::connection::ConnectionOptions;
use rsedis::router::{ClusterRouter, Router};
use rsedis::{cmd, Client, Reply, RsedisError};

fn router(seed: &MockNode, max_redirects: usize) -> ClusterRouter {
    ClusterRouter::new(
        vec![seed.node()],
        ConnectionOptions::default(),
        max_redirects,
        true,
        None,
    )
    .unwrap()
}

fn addr(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

#[tokio::test]
async fn moved_updates_the_slot_and_retries() {
    common::init_tracing();
    let (la, lb) = (bind().await, bind().await);
    let (pa, pb) = (port_of(&la), port_of(&lb));
    let slots = cluster_slots(&[(0, 16383, pa)]);

    let moved = Arc::new(AtomicUsize::new(0));
    let a = {
        let (slots, moved) = (slots.clone(), moved.clone());
        MockNode::serve(la, move |args| match args[0].as_str() {
            "CLUSTER" => Action::Reply(slots.clone()),
            "GET" if moved.fetch_add(1, Ordering::SeqCst) == 0 => {
                error(format!("MOVED 5000 127.0.0.1:{pb}"))
            }
            _ => bulk("from-a"),
        })
    };
    let b = MockNode::serve(lb, |args| match args[0].as_str() {
        "GET" => bulk("from-b"),
        _ => ok(),
    });

    let r = router(&a, 5);
    let reply = r.submit(&cmd!("GET", "key:2368")).await.unwrap();
    assert_eq!(reply, Reply::bulk("from-b"));
    assert_eq!(r.topology().master_for_slot(5000), Some(addr(pb)));
    // neighbours keep their owner
    assert_eq!(r.topology().master_for_slot(4999), Some(addr(pa)));

    // the correction sticks: the next command goes straight to b
    r.submit(&cmd!("GET", "key:2368")).await.unwrap();
    assert_eq!(a.count("GET"), 1);
    assert_eq!(b.count("GET"), 2);
}

#[tokio::test]
async fn ask_retries_once_without_persisting() {
    let (la, lb) = (bind().await, bind().await);
    let (pa, pb) = (port_of(&la), port_of(&lb));
    let slots = cluster_slots(&[(0, 16383, pa)]);

    let a = MockNode::serve(la, move |args| match args[0].as_str() {
        "CLUSTER" => Action::Reply(slots.clone()),
        _ => error(format!("ASK 5000 127.0.0.1:{pb}")),
    });
    let b = MockNode::serve(lb, |args| match args[0].as_str() {
        "ASKING" => ok(),
        _ => bulk("migrating"),
    });

    let r = router(&a, 5);
    for _ in 0..2 {
        let reply = r.submit(&cmd!("GET", "key:2368")).await.unwrap();
        assert_eq!(reply, Reply::bulk("migrating"));
        assert_eq!(r.topology().master_for_slot(5000), Some(addr(pa)));
    }
    // every attempt went to a first, and every retry on b was preceded by ASKING
    assert_eq!(a.count("GET"), 2);
    assert_eq!(b.names(), ["ASKING", "GET", "ASKING", "GET"]);
}

#[tokio::test]
async fn readonly_rediscovers_and_retries() {
    let (la, lb) = (bind().await, bind().await);
    let (pa, pb) = (port_of(&la), port_of(&lb));
    let before = cluster_slots(&[(0, 16383, pa)]);
    let after = cluster_slots(&[(0, 16383, pb)]);

    // a was demoted: its second slot report names b as the master
    let reports = Arc::new(AtomicUsize::new(0));
    let a = {
        let reports = reports.clone();
        MockNode::serve(la, move |args| match args[0].as_str() {
            "CLUSTER" if reports.fetch_add(1, Ordering::SeqCst) == 0 => {
                Action::Reply(before.clone())
            }
            "CLUSTER" => Action::Reply(after.clone()),
            _ => error("READONLY You can't write against a read only replica."),
        })
    };
    let b = MockNode::serve(lb, |_| ok());

    let r = router(&a, 5);
    let reply = r.submit(&cmd!("SET", "key:2368", "v")).await.unwrap();
    assert_eq!(reply, Reply::Status("OK".into()));
    assert_eq!(r.topology().epoch(), 2);
    assert_eq!(r.topology().master_for_slot(5000), Some(addr(pb)));
    assert_eq!(b.count("SET"), 1);
    assert_eq!(reports.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn redirect_chain_is_bounded() {
    let la = bind().await;
    let pa = port_of(&la);
    let slots = cluster_slots(&[(0, 16383, pa)]);
    let a = MockNode::serve(la, move |args| match args[0].as_str() {
        "CLUSTER" => Action::Reply(slots.clone()),
        _ => error(format!("MOVED 5000 127.0.0.1:{pa}")),
    });

    let r = router(&a, 3);
    match r.submit(&cmd!("GET", "key:2368")).await.unwrap_err() {
        RsedisError::RedirectExhausted { redirects, last } => {
            assert_eq!(redirects, 3);
            assert_eq!(last, format!("MOVED 5000 127.0.0.1:{pa}"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // first try plus three hops
    assert_eq!(a.count("GET"), 4);
    // hitting the limit triggers a fresh discovery
    assert_eq!(r.topology().epoch(), 2);
}

#[tokio::test]
async fn ordinary_errors_pass_through() {
    let la = bind().await;
    let slots = cluster_slots(&[(0, 16383, port_of(&la))]);
    let a = MockNode::serve(la, move |args| match args[0].as_str() {
        "CLUSTER" => Action::Reply(slots.clone()),
        _ => error("WRONGTYPE Operation against a key holding the wrong kind of value"),
    });
    let r = router(&a, 5);
    let reply = r.submit(&cmd!("LPUSH", "foo", "x")).await.unwrap();
    assert!(reply.as_error_msg().unwrap().starts_with("WRONGTYPE"));
    assert_eq!(a.count("LPUSH"), 1);
}

#[tokio::test]
async fn discovery_failure_is_topology_unavailable() {
    let a = MockNode::start(|_| error("ERR This instance has cluster support disabled")).await;
    let r = router(&a, 5);
    let err = r.submit(&cmd!("GET", "foo")).await.unwrap_err();
    assert!(matches!(err, RsedisError::TopologyUnavailable(_)), "got {err:?}");
    // CLUSTER SLOTS, then the CLUSTER NODES fallback
    assert_eq!(a.commands()[0], ["CLUSTER", "SLOTS"]);
    assert_eq!(a.commands()[1], ["CLUSTER", "NODES"]);
    assert_eq!(r.topology().epoch(), 0);
}

#[tokio::test]
async fn cluster_nodes_fallback() {
    let la = bind().await;
    let pa = port_of(&la);
    let nodes = format!("abc 127.0.0.1:{pa}@1{pa} myself,master - 0 0 1 connected 0-16383\n");
    let a = MockNode::serve(la, move |args| match (args[0].as_str(), args.get(1).map(String::as_str)) {
        ("CLUSTER", Some("SLOTS")) => error("ERR unknown subcommand 'SLOTS'"),
        ("CLUSTER", Some("NODES")) => bulk(nodes.clone()),
        _ => bulk("value"),
    });

    let r = router(&a, 5);
    assert_eq!(
        r.submit(&cmd!("GET", "foo")).await.unwrap(),
        Reply::bulk("value")
    );
    assert_eq!(r.topology().master_for_slot(12182), Some(addr(pa)));
}

#[tokio::test]
async fn concurrent_first_use_discovers_once() {
    let la = bind().await;
    let slots = cluster_slots(&[(0, 16383, port_of(&la))]);
    let a = MockNode::serve(la, move |args| match args[0].as_str() {
        "CLUSTER" => Action::After(
            std::time::Duration::from_millis(50),
            Box::new(Action::Reply(slots.clone())),
        ),
        _ => ok(),
    });

    let r = Arc::new(router(&a, 5));
    let handles: Vec<_> = (0..20)
        .map(|i| {
            let r = r.clone();
            tokio::spawn(async move { r.submit(&cmd!("SET", format!("k{i}"), i)).await })
        })
        .collect();
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(a.count("CLUSTER"), 1);
    assert_eq!(r.topology().epoch(), 1);
}

#[tokio::test]
async fn batch_is_grouped_by_node_and_keeps_order() {
    let (la, lb) = (bind().await, bind().await);
    let (pa, pb) = (port_of(&la), port_of(&lb));
    let slots = cluster_slots(&[(0, 8191, pa), (8192, 16383, pb)]);

    let kv_node = |listener: tokio::net::TcpListener, slots: Reply, name: &'static str| {
        let store: Arc<Mutex<HashMap<String, String>>> = Arc::default();
        MockNode::serve(listener, move |args| {
            let mut store = store.lock();
            match args[0].as_str() {
                "CLUSTER" => Action::Reply(slots.clone()),
                "SET" => {
                    store.insert(args[1].clone(), format!("{}@{name}", args[2]));
                    ok()
                }
                "GET" => match store.get(&args[1]) {
                    Some(v) => bulk(v.clone()),
                    None => Action::Reply(Reply::BulkString(None)),
                },
                "PING" => bulk(name),
                _ => error("ERR unknown command"),
            }
        })
    };
    let a = kv_node(la, slots.clone(), "a");
    let b = kv_node(lb, slots, "b");

    let client = Client::from_url(&format!("redis+cluster://127.0.0.1:{pa}")).unwrap();
    let replies = client
        .submit_batch(&[
            cmd!("SET", "foo", 1),
            cmd!("SET", "key:2368", 2),
            cmd!("GET", "foo"),
            cmd!("GET", "key:2368"),
            cmd!("PING"),
        ])
        .await
        .unwrap();

    assert_eq!(
        replies,
        vec![
            Reply::Status("OK".into()),
            Reply::Status("OK".into()),
            Reply::bulk("1@b"),
            Reply::bulk("2@a"),
            Reply::bulk("a"),
        ]
    );
    // slot 5000 and keyless commands on a; slot 12182 on b
    assert_eq!(a.names(), ["CLUSTER", "SET", "GET", "PING"]);
    assert_eq!(b.names(), ["SET", "GET"]);
}

#[tokio::test]
async fn client_connect_discovers_and_opens_masters() {
    let (la, lb) = (bind().await, bind().await);
    let (pa, pb) = (port_of(&la), port_of(&lb));
    let slots = cluster_slots(&[(0, 8191, pa), (8192, 16383, pb)]);
    let a = {
        let slots = slots.clone();
        MockNode::serve(la, move |args| match args[0].as_str() {
            "CLUSTER" => Action::Reply(slots.clone()),
            _ => ok(),
        })
    };
    let b = MockNode::serve(lb, |_| ok());

    let mut config = rsedis::ClientConfig::cluster(vec![a.node()]);
    config.auto_connect = false;
    let client = Client::new(config).unwrap();
    assert!(!client.is_ready());
    let err = client.submit(&cmd!("GET", "foo")).await.unwrap_err();
    assert!(matches!(err, RsedisError::NotConnected(_)));

    client.connect().await.unwrap();
    assert!(client.is_ready());
    client.submit(&cmd!("SET", "foo", "v")).await.unwrap();
    assert_eq!(a.count("CLUSTER"), 1);
    assert_eq!(b.count("SET"), 1);
    assert_eq!(b.connections(), 1);

    client.close().await;
    assert!(!client.is_ready());
    let err = client.submit(&cmd!("GET", "foo")).await.unwrap_err();
    assert!(matches!(err, RsedisError::NotConnected(_)));
}
