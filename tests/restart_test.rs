use axum::body::Body;
use axum::http::Request;
use axum::routing::get;
use axum::{Json, Router};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use restartable::mock::MockFactory;
use restartable::{
    BindOptions, BoxError, ForceCloseConnections, InstanceBuilder, RestartError, RestartOptions,
    Restartable, ServiceConfig, SocketEvent,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

fn loopback() -> BindOptions {
    BindOptions::new("127.0.0.1", 0)
}

async fn start(factory: MockFactory) -> (Restartable, SocketAddr) {
    start_with(factory, ServiceConfig::default()).await
}

async fn start_with(factory: MockFactory, config: ServiceConfig) -> (Restartable, SocketAddr) {
    let service = Restartable::new(factory, config).await.unwrap();
    let addr = service.listen(loopback()).await.unwrap();
    (service, addr)
}

async fn get_json(addr: SocketAddr, path: &str) -> Value {
    reqwest::get(format!("http://{addr}{path}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

fn hello_router() -> Router {
    Router::new().route("/", get(|| async { Json(json!({ "hello": "world" })) }))
}

#[tokio::test]
async fn test_create_and_restart() {
    let (service, addr) = start(MockFactory::new()).await;
    assert!(!service.restarted());
    assert_eq!(get_json(addr, "/").await, json!({ "version": 0 }));

    service.restart(None).await.unwrap();

    assert!(service.restarted());
    assert_eq!(service.local_addr().unwrap(), addr);
    assert_eq!(get_json(addr, "/").await, json!({ "version": 1 }));

    service.close().await.unwrap();
    assert!(!service.is_listening());
}

#[tokio::test]
async fn test_restart_twice_closes_each_generation() {
    let closes = Arc::new(Mutex::new(Vec::new()));
    let recorded = closes.clone();
    let factory = move |builder: InstanceBuilder, config: ServiceConfig, _: RestartOptions| {
        let recorded = recorded.clone();
        async move {
            let builder = builder.on_close(move |context| {
                let recorded = recorded.clone();
                async move {
                    recorded
                        .lock()
                        .push((context.generation, context.closing_restartable));
                    Ok::<(), BoxError>(())
                }
            });
            Ok::<_, BoxError>(builder.build(config, hello_router()))
        }
    };

    let service = Restartable::new(factory, ServiceConfig::default())
        .await
        .unwrap();
    let addr = service.listen(loopback()).await.unwrap();

    service.restart(None).await.unwrap();
    assert_eq!(get_json(addr, "/").await, json!({ "hello": "world" }));
    service.restart(None).await.unwrap();
    assert_eq!(get_json(addr, "/").await, json!({ "hello": "world" }));
    assert_eq!(service.port().unwrap(), addr.port());

    service.close().await.unwrap();

    // Only the last close tears the socket down.
    assert_eq!(*closes.lock(), vec![(1, false), (2, false), (3, true)]);
}

#[tokio::test]
async fn test_restart_from_route_handler() {
    let (service, addr) = start(MockFactory::new()).await;

    assert_eq!(get_json(addr, "/restart").await, json!({ "restarted": true }));
    assert!(service.restarted());
    assert_eq!(get_json(addr, "/").await, json!({ "version": 1 }));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_from_inject() {
    let service = Restartable::new(MockFactory::new(), ServiceConfig::default())
        .await
        .unwrap();

    let response = service
        .inject(Request::builder().uri("/restart").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), 200);
    assert!(service.restarted());

    let response = service
        .inject(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await;
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "version": 1 }));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_new_config_becomes_default() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let factory = move |builder: InstanceBuilder, config: ServiceConfig, _: RestartOptions| {
        let recorded = recorded.clone();
        async move {
            let counter = config.settings["counter"].as_u64().unwrap_or(0);
            recorded.lock().push(counter);
            let next = config.with_settings(json!({ "counter": counter + 1 }));
            Ok::<_, BoxError>(builder.build(next, hello_router()))
        }
    };

    let config = ServiceConfig::default().with_settings(json!({ "counter": 10 }));
    let service = Restartable::new(factory, config).await.unwrap();
    service.listen(loopback()).await.unwrap();
    service.restart(None).await.unwrap();
    service.restart(None).await.unwrap();

    assert_eq!(*seen.lock(), vec![10, 11, 12]);
    assert_eq!(service.app().config().settings, json!({ "counter": 13 }));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_options_reach_factory() {
    let factory = MockFactory::new();
    let (service, _) = start(factory.clone()).await;

    service.restart(Some(json!({ "foo": "bar" }))).await.unwrap();

    assert_eq!(factory.options(), vec![None, Some(json!({ "foo": "bar" }))]);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_repeated_restarts_leak_nothing() {
    let factory = MockFactory::new();
    let (service, addr) = start(factory.clone()).await;
    service.add_pre_restart_hook(|_, _| async { Ok::<(), BoxError>(()) });
    service.add_on_restart_hook(|_, _| async { Ok::<(), BoxError>(()) });

    for _ in 0..11 {
        service.restart(None).await.unwrap();
    }

    assert_eq!(service.live_generations(), 1);
    assert_eq!(service.app().generation(), 12);
    assert_eq!(service.local_addr().unwrap(), addr);
    assert_eq!(service.hooks().len(restartable::hooks::HookKind::PreRestart), 1);
    assert_eq!(service.hooks().len(restartable::hooks::HookKind::OnRestart), 1);
    assert_eq!(get_json(addr, "/").await, json!({ "version": 11 }));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_restart_keeps_current_instance() {
    let factory = MockFactory::new();
    let (service, addr) = start(factory.clone()).await;

    factory.fail_next("kaboom");
    let err = service.restart(None).await.unwrap_err();
    assert!(matches!(err, RestartError::BuildFailure(_)));
    assert!(err.to_string().contains("kaboom"));

    assert!(!service.restarted());
    assert_eq!(service.live_generations(), 1);
    assert_eq!(get_json(addr, "/").await, json!({ "version": 0 }));

    // The factory is not poisoned by the failure.
    service.restart(None).await.unwrap();
    assert_eq!(get_json(addr, "/").await, json!({ "version": 1 }));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_readiness_rolls_back() {
    let factory = MockFactory::new();
    let (service, addr) = start(factory.clone()).await;

    factory.fail_next_ready("not ready");
    let err = service.restart(None).await.unwrap_err();
    assert!(matches!(err, RestartError::BuildFailure(_)));

    assert!(!service.restarted());
    assert_eq!(service.app().generation(), 1);
    assert_eq!(service.live_generations(), 1);
    assert!(service.is_listening());
    assert_eq!(get_json(addr, "/generation").await, json!({ "generation": 1 }));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_old_version_served_during_build() {
    let factory = MockFactory::new();
    let (service, addr) = start(factory.clone()).await;
    factory.set_delay(Some(Duration::from_millis(500)));

    let restarting = {
        let service = service.clone();
        tokio::spawn(async move { service.restart(None).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(get_json(addr, "/").await, json!({ "version": 0 }));

    restarting.await.unwrap().unwrap();
    assert_eq!(get_json(addr, "/").await, json!({ "version": 1 }));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_restarts_are_coalesced() {
    let factory = MockFactory::new().with_delay(Duration::from_millis(500));
    let (service, _) = start(factory.clone()).await;

    let results = futures::future::join_all((0..5).map(|_| service.restart(None))).await;

    assert!(results.iter().all(|result| result.is_ok()));
    assert_eq!(factory.invocations(), 2);
    assert!(service.restarted());

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_coalesced_restart_keeps_first_options() {
    let factory = MockFactory::new();
    let (service, _) = start(factory.clone()).await;
    factory.set_delay(Some(Duration::from_millis(300)));

    let first = {
        let service = service.clone();
        tokio::spawn(async move { service.restart(Some(json!({ "first": true }))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.restart(Some(json!({ "second": true }))).await.unwrap();
    first.await.unwrap().unwrap();

    assert_eq!(factory.options(), vec![None, Some(json!({ "first": true }))]);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_persistent_ref_resolves_to_handle() {
    let (service, _) = start(MockFactory::new()).await;
    let first = service.app();

    assert!(service.persistent_ref().upgrade().unwrap().ptr_eq(&service));

    service.restart(None).await.unwrap();
    let second = service.app();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(first.persistent_ref().upgrade().unwrap(), service);
    assert_eq!(second.persistent_ref().upgrade().unwrap(), service);
    assert_eq!(service.clone(), service);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_proxy_follows_current_instance() {
    let (service, _) = start(MockFactory::new()).await;

    assert_eq!(service.proxy().get("version"), Some(json!(0)));
    assert_eq!(service.proxy().get("restarted"), Some(json!(false)));

    service.restart(None).await.unwrap();

    assert_eq!(service.proxy().get("version"), Some(json!(1)));
    assert_eq!(service.proxy().get("restarted"), Some(json!(true)));
    assert!(!service.proxy().is_thenable());

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_event_emitted_once() {
    let (service, _) = start(MockFactory::new()).await;
    let mut events = service.subscribe();

    for _ in 0..5 {
        service.restart(None).await.unwrap();
    }
    assert!(events.try_recv().is_err());

    service.close().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), SocketEvent::Closed);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_close_during_restart() {
    let factory = MockFactory::new();
    let (service, _) = start(factory.clone()).await;
    let mut events = service.subscribe();
    factory.set_delay(Some(Duration::from_millis(300)));

    let restarting = {
        let service = service.clone();
        tokio::spawn(async move { service.restart(None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.close().await.unwrap();

    // The close waited for the restart in flight.
    restarting.await.unwrap().unwrap();
    assert!(!service.is_listening());
    assert!(service.closing_restartable());
    assert_eq!(events.recv().await.unwrap(), SocketEvent::Closed);
    assert!(events.try_recv().is_err());

    let err = service.restart(None).await.unwrap_err();
    assert!(err.is_closed());
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_before_listen() {
    let service = Restartable::new(MockFactory::new(), ServiceConfig::default())
        .await
        .unwrap();

    service.restart(None).await.unwrap();
    assert!(service.restarted());
    assert!(!service.is_listening());

    let addr = service.listen(loopback()).await.unwrap();
    assert!(service.is_listening());
    assert_eq!(get_json(addr, "/").await, json!({ "version": 1 }));

    service.close().await.unwrap();
    assert!(!service.is_listening());
}

#[tokio::test]
async fn test_listen_twice_keeps_address() {
    let (service, addr) = start(MockFactory::new()).await;
    let again = service.listen(loopback()).await.unwrap();
    assert_eq!(again, addr);
    assert_eq!(service.url().unwrap(), format!("http://{addr}"));
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_http2_protocol_serves_requests() {
    let config = ServiceConfig::default().with_protocol("http2");
    let service = Restartable::new(MockFactory::new(), config).await.unwrap();
    let addr = service.listen(loopback()).await.unwrap();

    service.restart(None).await.unwrap();
    assert_eq!(get_json(addr, "/").await, json!({ "version": 1 }));
    assert!(service.url().unwrap().starts_with("http://"));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_protocol_fails_before_build() {
    let factory = MockFactory::new();
    let config = ServiceConfig::default().with_protocol("foobar");

    let err = Restartable::new(factory.clone(), config).await.unwrap_err();
    assert_eq!(err.to_string(), "Unknown Protocol foobar");
    assert_eq!(factory.invocations(), 0);
}

#[tokio::test]
async fn test_initial_build_failure() {
    let factory = MockFactory::new();
    factory.fail_next("no database");

    let err = Restartable::new(factory, ServiceConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RestartError::BuildFailure(_)));
}

#[tokio::test]
async fn test_address_before_listen() {
    let service = Restartable::new(MockFactory::new(), ServiceConfig::default())
        .await
        .unwrap();

    assert!(matches!(service.address(), Err(RestartError::NotListening)));
    assert!(matches!(service.port(), Err(RestartError::NotListening)));
    assert!(matches!(service.url(), Err(RestartError::NotListening)));

    let err = service.listen(BindOptions::new("not-an-ip", 0)).await.unwrap_err();
    assert!(matches!(err, RestartError::InvalidArgument(_)));

    service.close().await.unwrap();
}

fn force_close(mode: ForceCloseConnections) -> ServiceConfig {
    ServiceConfig::default().with_force_close_connections(mode)
}

#[tokio::test]
async fn test_restart_with_force_close_all_keeps_connections() {
    let config = force_close(ForceCloseConnections::All);
    let (service, addr) = start_with(MockFactory::new(), config).await;

    let request = tokio::spawn(get_json(addr, "/sleep/300"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.restart(None).await.unwrap();

    // Retiring the old generation did not sever the socket's connections.
    assert_eq!(request.await.unwrap(), json!({ "slept": 300 }));
    assert_eq!(get_json(addr, "/").await, json!({ "version": 1 }));
    assert_eq!(service.app().config().force_close_connections, ForceCloseConnections::All);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_close_with_force_close_all_severs_requests() {
    let config = force_close(ForceCloseConnections::All);
    let (service, addr) = start_with(MockFactory::new(), config).await;

    let request = tokio::spawn(reqwest::get(format!("http://{addr}/sleep/5000")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    timeout(Duration::from_secs(1), service.close())
        .await
        .unwrap()
        .unwrap();

    assert!(request.await.unwrap().is_err());
    assert!(!service.is_listening());
}

#[tokio::test]
async fn test_close_with_force_close_idle_finishes_requests() {
    let config = force_close(ForceCloseConnections::Idle);
    let (service, addr) = start_with(MockFactory::new(), config).await;

    // A live client keeps an idle keep-alive connection open.
    let idle = reqwest::Client::new();
    let response = idle.get(format!("http://{addr}/")).send().await.unwrap();
    assert_eq!(response.json::<Value>().await.unwrap(), json!({ "version": 0 }));

    let request = tokio::spawn(get_json(addr, "/sleep/300"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    timeout(Duration::from_secs(2), service.close())
        .await
        .unwrap()
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));

    assert_eq!(request.await.unwrap(), json!({ "slept": 300 }));
    drop(idle);
}

#[tokio::test]
async fn test_close_without_force_close_waits_for_connections() {
    let config = force_close(ForceCloseConnections::Never);
    let (service, addr) = start_with(MockFactory::new(), config).await;

    let client = reqwest::Client::new();
    let response = client.get(format!("http://{addr}/")).send().await.unwrap();
    assert_eq!(response.json::<Value>().await.unwrap(), json!({ "version": 0 }));

    let mut closing = {
        let service = service.clone();
        tokio::spawn(async move { service.close().await })
    };
    assert!(timeout(Duration::from_millis(300), &mut closing).await.is_err());
    assert!(service.is_listening());

    drop(client);
    timeout(Duration::from_secs(2), closing)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!service.is_listening());
}

#[tokio::test]
async fn test_close_while_handler_restarts() {
    let (service, addr) = start(MockFactory::new()).await;

    let url = format!("http://{addr}/restart/300");
    let request = tokio::spawn(async move { reqwest::get(url).await.map(|r| r.status()) });
    tokio::time::sleep(Duration::from_millis(100)).await;
    timeout(Duration::from_secs(5), service.close())
        .await
        .unwrap()
        .unwrap();

    // The handler's restart was answered instead of blocking the drain.
    assert_eq!(request.await.unwrap().unwrap(), 500);
    assert!(!service.restarted());
    assert!(!service.is_listening());
}

#[tokio::test]
async fn test_failed_first_readiness_closes_instance() {
    let closes = Arc::new(Mutex::new(Vec::new()));
    let recorded = closes.clone();
    let factory = move |builder: InstanceBuilder, config: ServiceConfig, _: RestartOptions| {
        let recorded = recorded.clone();
        async move {
            let builder = builder
                .on_ready(|_| async { Err::<(), BoxError>("no database".into()) })
                .on_close(move |context| {
                    let recorded = recorded.clone();
                    async move {
                        recorded.lock().push(context);
                        Ok::<(), BoxError>(())
                    }
                });
            Ok::<_, BoxError>(builder.build(config, hello_router()))
        }
    };

    let err = Restartable::new(factory, ServiceConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RestartError::BuildFailure(_)));

    let closes = closes.lock();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].generation, 1);
    assert!(closes[0].closing_restartable);
}
