//! Command router session auth and lifecycle against in-memory fakes.

mod common;

use common::{
    control_client, make_jwt, router_client, FakeConnector, FakeControlPlane, FakeRouter,
    ROUTER_URL, TASK_ID,
};
use modal_transport::{unix_now, CallContext, CommandRouterClient, RetryOptions, TransportError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tonic::{Code, Status};

fn fakes() -> (Arc<FakeControlPlane>, Arc<FakeRouter>) {
    (
        Arc::new(FakeControlPlane::default()),
        Arc::new(FakeRouter::default()),
    )
}

/// A rejected JWT is refreshed once and the call is resent with the new one.
#[tokio::test]
async fn test_unauthenticated_refreshes_and_retries_once() {
    let (control, router) = fakes();
    let initial = make_jwt(unix_now() + 3600);
    router.rejected.lock().unwrap().push(initial.clone());
    let client = router_client(&control, &router, initial.clone());

    let image_id = client
        .snapshot_directory(&CallContext::new(), "/data")
        .await
        .unwrap();

    assert_eq!(image_id, "im-data");
    assert_eq!(control.access_calls(), 1);
    let issued = control.issued_jwts.lock().unwrap().clone();
    assert_eq!(*router.bearers.lock().unwrap(), vec![initial, issued[0].clone()]);
}

/// A second rejection after the refresh is returned to the caller.
#[tokio::test]
async fn test_second_unauthenticated_is_returned() {
    let (control, router) = fakes();
    router
        .unary_errors
        .lock()
        .unwrap()
        .extend([Status::unauthenticated("nope"), Status::unauthenticated("still no")]);
    let client = router_client(&control, &router, make_jwt(unix_now() + 3600));

    let err = client
        .mount_directory(&CallContext::new(), "/mnt", "im-1")
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), Some(Code::Unauthenticated));
    assert_eq!(router.count("mount"), 2);
    assert_eq!(control.access_calls(), 1);
}

/// A JWT about to expire is replaced before the call goes out.
#[tokio::test]
async fn test_proactive_refresh_near_expiry() {
    let (control, router) = fakes();
    let client = router_client(&control, &router, make_jwt(unix_now() + 10));

    client
        .mount_directory(&CallContext::new(), "/mnt", "im-1")
        .await
        .unwrap();

    assert_eq!(control.access_calls(), 1);
    let issued = control.issued_jwts.lock().unwrap().clone();
    assert_eq!(*router.bearers.lock().unwrap(), issued);
}

/// A JWT with no readable expiry is trusted for the fallback lifetime.
#[tokio::test]
async fn test_malformed_jwt_not_refreshed() {
    let (control, router) = fakes();
    let client = router_client(&control, &router, "garbage".to_string());

    client
        .mount_directory(&CallContext::new(), "/mnt", "im-1")
        .await
        .unwrap();

    assert_eq!(control.access_calls(), 0);
    assert_eq!(*router.bearers.lock().unwrap(), vec!["garbage".to_string()]);
}

/// Concurrent callers holding an expiring JWT share one refresh.
#[tokio::test]
async fn test_concurrent_refreshes_coalesce() {
    let (control, router) = fakes();
    let client = router_client(&control, &router, make_jwt(unix_now() + 5));
    let ctx = CallContext::new();

    let results = futures::future::join_all(
        (0..5).map(|i| {
            let client = Arc::clone(&client);
            let ctx = ctx.clone();
            async move { client.snapshot_directory(&ctx, &format!("/dir{i}")).await }
        }),
    )
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(control.access_calls(), 1);
}

/// The session fails if the control plane moves the task to a new router.
#[tokio::test]
async fn test_router_url_change_is_error() {
    let (control, router) = fakes();
    *control.router_url.lock().unwrap() = "https://elsewhere.test:443".to_string();
    let client = router_client(&control, &router, make_jwt(unix_now() + 5));

    let err = client
        .mount_directory(&CallContext::new(), "/mnt", "im-1")
        .await
        .unwrap_err();

    match err {
        TransportError::Connection(message) => {
            assert_eq!(message, "task router URL changed during session")
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(router.calls().is_empty());
}

/// Transient router errors are retried with the session policy.
#[tokio::test(start_paused = true)]
async fn test_transient_errors_retried() {
    let (control, router) = fakes();
    router
        .unary_errors
        .lock()
        .unwrap()
        .extend([Status::unavailable("restarting"), Status::unknown("hiccup")]);
    let client = router_client(&control, &router, make_jwt(unix_now() + 3600));

    client
        .mount_directory(&CallContext::new(), "/mnt", "im-1")
        .await
        .unwrap();

    assert_eq!(router.count("mount"), 3);
    let times = router.call_times.lock().unwrap().clone();
    assert_eq!(times[1] - times[0], Duration::from_millis(10));
    assert_eq!(times[2] - times[1], Duration::from_millis(20));
}

/// After close every operation fails with `ClientClosed` and makes no RPC.
#[tokio::test]
async fn test_closed_client_rejects_calls() {
    let (control, router) = fakes();
    let client = router_client(&control, &router, make_jwt(unix_now() + 3600));

    client.close();
    client.close();
    assert!(client.is_closed());

    let err = client
        .mount_directory(&CallContext::new(), "/mnt", "im-1")
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ClientClosed));
    assert!(router.calls().is_empty());
    assert_eq!(control.access_calls(), 0);
}

/// Closing the client interrupts an in-flight call with `ClientClosed`.
#[tokio::test(start_paused = true)]
async fn test_close_interrupts_in_flight_call() {
    let (control, router) = fakes();
    *router.wait_delay.lock().unwrap() = Duration::from_secs(30);
    let client = router_client(&control, &router, make_jwt(unix_now() + 3600));

    let ctx = CallContext::new();
    let (result, _) = tokio::join!(client.exec_wait(&ctx, "ex-1", None), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.close();
    });

    assert!(matches!(result.unwrap_err(), TransportError::ClientClosed));
    assert_eq!(router.count("wait"), 1);
}

/// Poll and wait refuse to start once the exec deadline has passed.
#[tokio::test(start_paused = true)]
async fn test_exec_deadline_already_passed() {
    let (control, router) = fakes();
    let client = router_client(&control, &router, make_jwt(unix_now() + 3600));
    let deadline = tokio::time::Instant::now();

    let err = client
        .exec_poll(&CallContext::new(), "ex-1", Some(deadline))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "deadline exceeded while polling for exec ex-1");

    let err = client
        .exec_wait(&CallContext::new(), "ex-1", Some(deadline))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "deadline exceeded while waiting for exec ex-1");
    assert!(router.calls().is_empty());
}

/// Tasks without command router access produce no client.
#[tokio::test]
async fn test_connect_failed_precondition_is_none() {
    let control = Arc::new(FakeControlPlane::default());
    *control.access_error.lock().unwrap() =
        Some(Status::failed_precondition("command router access is not enabled"));
    let connector = FakeConnector {
        router: Arc::new(FakeRouter::default()),
        urls: Mutex::new(Vec::new()),
    };

    let client = CommandRouterClient::connect(
        &CallContext::new(),
        control_client(&control),
        &connector,
        TASK_ID,
        false,
    )
    .await
    .unwrap();

    assert!(client.is_none());
    assert!(connector.urls.lock().unwrap().is_empty());
}

/// Connecting looks up the router URL with the account token attached.
#[tokio::test]
async fn test_connect_uses_access_response() {
    let control = Arc::new(FakeControlPlane::default());
    let connector = FakeConnector {
        router: Arc::new(FakeRouter::default()),
        urls: Mutex::new(Vec::new()),
    };

    let client = CommandRouterClient::connect(
        &CallContext::new(),
        control_client(&control),
        &connector,
        TASK_ID,
        false,
    )
    .await
    .unwrap()
    .expect("router access");

    assert_eq!(client.task_id(), TASK_ID);
    assert_eq!(client.server_url(), ROUTER_URL);
    assert_eq!(*connector.urls.lock().unwrap(), vec![ROUTER_URL.to_string()]);
    assert_eq!(
        *control.auth_tokens_seen.lock().unwrap(),
        vec!["account-token".to_string()]
    );
}

/// A custom retry policy replaces the session default.
#[tokio::test]
async fn test_custom_retry_options() {
    let (control, router) = fakes();
    router
        .unary_errors
        .lock()
        .unwrap()
        .push_back(Status::unavailable("down"));
    let client = CommandRouterClient::new(
        Arc::clone(&router) as Arc<dyn modal_transport::CommandRouter>,
        control_client(&control),
        TASK_ID,
        ROUTER_URL,
        make_jwt(unix_now() + 3600),
    )
    .with_retry_options(RetryOptions::session().with_max_retries(Some(0)));

    let err = client
        .mount_directory(&CallContext::new(), "/mnt", "im-1")
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(Code::Unavailable));
    assert_eq!(router.count("mount"), 1);
}
