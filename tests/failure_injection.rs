//! Failure injection tests: misbehaving handlers, overload and timeouts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::io::AsyncWriteExt;

use sparx::{HandlerError, HttpServer, RequestHandle, ServerConfig};

mod common;

async fn misbehaving(mut request: RequestHandle) -> Result<(), HandlerError> {
    match request.path() {
        "/panic" => panic!("handler crashed before finish"),
        "/error" => {
            request.send_status(200)?;
            Err("handler gave up".into())
        }
        "/drop-mid-header" => {
            request.send_status(201)?;
            request.send_header("x-partial", "1")?;
            Ok(())
        }
        "/write-before-status" => {
            request.write_chunk("too early").await?;
            Ok(())
        }
        "/header-after-body" => {
            request.send_status(200)?;
            request.send_header("content-type", "text/plain")?;
            request.write_chunk("partial").await?;
            request.send_header("x-late", "1")?;
            Ok(())
        }
        _ => sparx::echo::echo(request).await,
    }
}

#[tokio::test]
async fn panicking_handler_gets_500_and_connection_stays_usable() {
    let config = ServerConfig {
        max_connections: 10,
        ..common::test_config()
    };
    let server = common::start_server(config, misbehaving).await;
    let mut stream = common::connect(server.local_addr()).await;

    let response = common::roundtrip(&mut stream, &common::get("/panic")).await;
    assert_eq!(response.status, 500);
    assert!(response.body.is_empty());

    // Same socket, next request is served normally.
    let response = common::roundtrip(&mut stream, &common::post("/", "still alive")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "still alive");

    server.stop().await;
}

#[tokio::test]
async fn handler_errors_and_partial_heads_auto_close_with_500() {
    let server = common::start_server(common::test_config(), misbehaving).await;
    let mut stream = common::connect(server.local_addr()).await;

    for path in ["/error", "/drop-mid-header"] {
        let response = common::roundtrip(&mut stream, &common::get(path)).await;
        assert_eq!(response.status, 500, "path {path}");
        assert!(response.body.is_empty());
        assert_eq!(response.header("x-partial"), None);
    }

    server.stop().await;
}

#[tokio::test]
async fn write_before_status_closes_without_a_response() {
    let server = common::start_server(common::test_config(), misbehaving).await;
    let mut stream = common::connect(server.local_addr()).await;

    stream
        .get_mut()
        .write_all(common::get("/write-before-status").as_bytes())
        .await
        .unwrap();
    let received = common::read_until_closed(&mut stream).await;
    assert!(received.is_empty(), "got {:?}", String::from_utf8_lossy(&received));

    server.stop().await;
}

#[tokio::test]
async fn header_after_body_tears_down_instead_of_corrupting() {
    let server = common::start_server(common::test_config(), misbehaving).await;
    let mut stream = common::connect(server.local_addr()).await;

    stream
        .get_mut()
        .write_all(common::get("/header-after-body").as_bytes())
        .await
        .unwrap();
    let received = common::read_until_closed(&mut stream).await;
    let received = String::from_utf8_lossy(&received);

    // Whatever made it out is a single head and an unterminated body.
    assert!(received.matches("HTTP/1.1 ").count() <= 1, "{received:?}");
    assert!(!received.contains("x-late"), "{received:?}");
    assert!(!received.ends_with("0\r\n\r\n"), "{received:?}");

    server.stop().await;
}

#[tokio::test]
async fn unanswered_request_times_out_with_408() {
    let config = ServerConfig {
        request_timeout_ms: 200,
        ..common::test_config()
    };
    let server = common::start_server(config, |request: RequestHandle| async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(request);
        Ok::<(), HandlerError>(())
    })
    .await;
    let mut stream = common::connect(server.local_addr()).await;

    let response = common::roundtrip(&mut stream, &common::get("/slow")).await;
    assert_eq!(response.status, 408);
    assert_eq!(response.header("connection"), Some("close"));

    server.stop().await;
}

#[tokio::test]
async fn idle_keep_alive_connection_is_closed() {
    let config = ServerConfig {
        request_timeout_ms: 5_000,
        keep_alive_timeout_ms: 300,
        ..common::test_config()
    };
    let server = common::start_server(config, sparx::echo::echo).await;
    let mut stream = common::connect(server.local_addr()).await;

    let response = common::roundtrip(&mut stream, &common::get("/")).await;
    assert_eq!(response.status, 200);
    assert_eq!(server.active_connections(), 1);

    let idle_since = std::time::Instant::now();
    let received = common::read_until_closed(&mut stream).await;
    assert!(received.is_empty());
    assert!(idle_since.elapsed() < Duration::from_secs(3));
    common::wait_until(|| server.active_connections() == 0).await;

    server.stop().await;
}

#[tokio::test]
async fn incomplete_request_head_is_cut_off_at_the_request_deadline() {
    let config = ServerConfig {
        request_timeout_ms: 300,
        keep_alive_timeout_ms: 5_000,
        ..common::test_config()
    };
    let server = common::start_server(config, sparx::echo::echo).await;
    let mut stream = common::connect(server.local_addr()).await;

    let started = std::time::Instant::now();
    stream
        .get_mut()
        .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n")
        .await
        .unwrap();
    let received = common::read_until_closed(&mut stream).await;
    assert!(received.is_empty());
    // Cut off by the request deadline, not the keep-alive timeout.
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());

    server.stop().await;
}

#[tokio::test]
async fn connections_over_the_limit_are_closed_without_response() {
    let config = ServerConfig {
        max_connections: 1,
        ..common::test_config()
    };
    let server = common::start_server(config, sparx::echo::echo).await;

    let mut first = common::connect(server.local_addr()).await;
    let response = common::roundtrip(&mut first, &common::get("/")).await;
    assert_eq!(response.status, 200);
    assert_eq!(server.active_connections(), 1);

    let mut second = common::connect(server.local_addr()).await;
    let _ = second.get_mut().write_all(common::get("/").as_bytes()).await;
    let received = common::read_until_closed(&mut second).await;
    assert!(received.is_empty());

    // The first connection is unaffected.
    let response = common::roundtrip(&mut first, &common::post("/", "ok")).await;
    assert_eq!(response.body_text(), "ok");

    server.stop().await;
}

#[tokio::test]
async fn full_queue_answers_503_and_stop_rejects_leftovers() {
    // No workers: requests stay queued. Capacity equals max_connections.
    let config = ServerConfig {
        max_connections: 2,
        ..common::test_config()
    };
    let server = HttpServer::new(config).unwrap().start().await.unwrap();
    assert_eq!(server.queue_capacity(), 2);
    let url = format!("http://{}/", server.local_addr());

    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build_http();
    let send = |client: Client<_, Full<Bytes>>, url: String| {
        tokio::spawn(async move {
            let request = hyper::Request::get(url).body(Full::new(Bytes::new())).unwrap();
            client.request(request).await.map(|r| r.status().as_u16())
        })
    };

    let first = send(client.clone(), url.clone());
    common::wait_until(|| server.queued() == 1).await;
    let second = send(client.clone(), url.clone());
    common::wait_until(|| server.queued() == 2).await;

    let third = send(client.clone(), url.clone()).await.unwrap().unwrap();
    assert_eq!(third, 503);

    let report = server.stop().await;
    assert_eq!(report.rejected_queued, 2);
    assert_eq!(first.await.unwrap().unwrap(), 503);
    assert_eq!(second.await.unwrap().unwrap(), 503);
}

#[tokio::test]
async fn one_bad_request_does_not_affect_other_connections() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    let server = common::start_server(common::test_config(), move |request: RequestHandle| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            misbehaving(request).await
        }
    })
    .await;
    let addr = server.local_addr();

    let bad = tokio::spawn(async move {
        let mut stream = common::connect(addr).await;
        common::roundtrip(&mut stream, &common::get("/panic")).await.status
    });
    let good = tokio::spawn(async move {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let response = client
            .post(format!("http://{addr}/"))
            .body("unaffected")
            .send()
            .await
            .unwrap();
        (response.status().as_u16(), response.text().await.unwrap())
    });

    assert_eq!(bad.await.unwrap(), 500);
    assert_eq!(good.await.unwrap(), (200, "unaffected".to_string()));
    assert_eq!(served.load(Ordering::SeqCst), 2);

    server.stop().await;
}
