use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use leases::{
    api::{router, LEASE_MANAGER_PATH},
    test_utils::{CallCounter, TestCluster},
    Direction, PeerState,
};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = body.map_or_else(Body::empty, |body| Body::from(body.to_string()));
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_get_reports_every_known_server() {
    let cluster = TestCluster::new(3).unwrap();
    let a = cluster.node(0).require_lease(cluster.peer(1), || "a".into(), || {});
    let b = cluster.node(0).require_lease(cluster.peer(2), || "b".into(), || {});
    let c = cluster.node(1).require_lease(cluster.peer(2), || "c".into(), || {});
    let app = router(cluster.node(0).clone());

    let (status, body) = call(&app, Method::GET, LEASE_MANAGER_PATH, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"], json!(false));
    assert_eq!(body["code"], json!(200));

    let result = body["result"].as_object().unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(
        result["PRMR-1"]["leasedFromRemote"],
        json!({"PRMR-2:1": [a.id().0], "PRMR-3:1": [b.id().0]})
    );
    assert_eq!(
        result["PRMR-2"]["leasedFromRemote"],
        json!({"PRMR-3:1": [c.id().0]})
    );
    // Empty maps are rendered, never omitted
    assert_eq!(
        result["PRMR-3"],
        json!({"leasedFromRemote": {}, "leasedToRemote": {}})
    );
}

#[tokio::test]
async fn test_get_filters() {
    let cluster = TestCluster::new(2).unwrap();
    let guard = cluster
        .node(1)
        .require_lease(cluster.peer(0), || "AQL query 12".into(), || {});
    let app = router(cluster.node(0).clone());

    let (status, body) = call(&app, Method::GET, &format!("{LEASE_MANAGER_PATH}?server=PRMR-2"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["result"],
        json!({"PRMR-2": {"leasedFromRemote": {"PRMR-1:1": [guard.id().0]}, "leasedToRemote": {}}})
    );

    let (_, body) = call(&app, Method::GET, &format!("{LEASE_MANAGER_PATH}?local=true"), None).await;
    assert_eq!(
        body["result"],
        json!({"PRMR-1": {"leasedFromRemote": {}, "leasedToRemote": {}}})
    );

    let (_, body) = call(
        &app,
        Method::GET,
        &format!("{LEASE_MANAGER_PATH}?server=PRMR-2&details=true"),
        None,
    )
    .await;
    assert_eq!(
        body["result"]["PRMR-2"]["leasedFromRemote"]["PRMR-1:1"][guard.id().to_string()],
        json!("AQL query 12")
    );
}

#[tokio::test]
async fn test_get_unknown_or_unreachable_server() {
    let cluster = TestCluster::new(2).unwrap();
    let app = router(cluster.node(0).clone());

    let (status, body) = call(&app, Method::GET, &format!("{LEASE_MANAGER_PATH}?server=PRMR-9"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!(true));

    cluster.partition(0, 1);
    let (status, body) = call(&app, Method::GET, &format!("{LEASE_MANAGER_PATH}?server=PRMR-2"), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["errorNum"], json!(503));

    // The full report skips what it cannot reach
    let (status, body) = call(&app, Method::GET, LEASE_MANAGER_PATH, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"].as_object().unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let cluster = TestCluster::new(2).unwrap();
    let counter = CallCounter::new();
    let guard = cluster
        .node(0)
        .require_lease(cluster.peer(1), || "query".into(), counter.callback());
    let app = router(cluster.node(0).clone());

    let abort = json!({
        "server": {"serverId": "PRMR-2", "rebootId": 1},
        "leasedFrom": [guard.id().0],
        "leasedTo": []
    });
    for _ in 0..2 {
        let (status, body) = call(&app, Method::DELETE, LEASE_MANAGER_PATH, Some(abort.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"error": false, "code": 200}));
    }
    cluster.settle().await;

    assert_eq!(counter.count(), 1);
    assert!(!guard.is_active());
}

#[tokio::test]
async fn test_delete_rejects_malformed_body() {
    let cluster = TestCluster::new(2).unwrap();
    let counter = CallCounter::new();
    let _guard = cluster
        .node(0)
        .require_lease(cluster.peer(1), || "query".into(), counter.callback());
    let app = router(cluster.node(0).clone());

    for body in [
        json!({"leasedFrom": [1]}),
        json!({"server": "PRMR-2", "leasedFrom": [1]}),
        json!({"server": {"serverId": "PRMR-2", "rebootId": 1}, "leasedFrom": ["one"]}),
    ] {
        let (status, reply) = call(&app, Method::DELETE, LEASE_MANAGER_PATH, Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply["error"], json!(true));
        assert_eq!(reply["code"], json!(400));
    }
    cluster.settle().await;

    assert_eq!(counter.count(), 0);
    assert_eq!(cluster.node(0).lease_count(Direction::LeasedFromRemote), 1);
}

#[tokio::test]
async fn test_unsupported_verbs_are_not_found() {
    let cluster = TestCluster::new(1).unwrap();
    let app = router(cluster.node(0).clone());

    for method in [Method::PUT, Method::POST] {
        for body in [None, Some(json!({"anything": true}))] {
            let (status, reply) = call(&app, method.clone(), LEASE_MANAGER_PATH, body).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(reply["error"], json!(true));
            assert_eq!(reply["code"], json!(404));
            assert_eq!(reply["errorNum"], json!(404));
            assert!(reply["errorMessage"].is_string());
        }
    }
}

#[tokio::test]
async fn test_walkthrough() {
    let cluster = TestCluster::new(1).unwrap();
    let node = cluster.node(0);
    let app = router(node.clone());

    let l1_calls = CallCounter::new();
    let l2_calls = CallCounter::new();
    let l3_calls = CallCounter::new();
    let b = PeerState::new("B", 1);
    let l1 = node.require_lease(b.clone(), || "L1".into(), l1_calls.callback());
    let l2 = node.require_lease(b, || "L2".into(), l2_calls.callback());
    let mut l3 = node.require_lease(PeerState::new("A", 1), || "L3".into(), l3_calls.callback());

    let (_, body) = call(&app, Method::GET, LEASE_MANAGER_PATH, None).await;
    assert_eq!(
        body["result"]["PRMR-1"]["leasedFromRemote"],
        json!({"A:1": [l3.id().0], "B:1": [l1.id().0, l2.id().0]})
    );

    let (status, _) = call(
        &app,
        Method::DELETE,
        LEASE_MANAGER_PATH,
        Some(json!({"server": {"serverId": "B", "rebootId": 1}, "leasedFrom": [l1.id().0]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    l3.cancel();
    drop(l1);
    drop(l2);
    drop(l3);
    cluster.settle().await;

    let (_, body) = call(&app, Method::GET, LEASE_MANAGER_PATH, None).await;
    assert_eq!(
        body["result"]["PRMR-1"],
        json!({"leasedFromRemote": {}, "leasedToRemote": {}})
    );
    assert_eq!(l1_calls.count(), 1);
    assert_eq!(l2_calls.count(), 0);
    assert_eq!(l3_calls.count(), 0);
    assert_eq!(node.lease_count(Direction::LeasedFromRemote), 0);
}
