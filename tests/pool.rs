//! Pool behavior: buffering, waiter ordering, capacity law, shutdown.

mod support;

use std::sync::Arc;

use remora::http::Method;
use remora::test_utils::MockChannelFactory;
use remora::{ClientConfig, Endpoint, HttpVersion};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

fn h1_config() -> ClientConfig {
    ClientConfig::new().with_protocols(vec![HttpVersion::Http11])
}

/// A server that answers one request per permit.
fn gated_server(
    gate: Arc<Semaphore>,
) -> impl Fn(tokio::io::DuplexStream) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
+ Send
+ Sync
+ 'static {
    move |mut io| {
        let gate = gate.clone();
        Box::pin(async move {
            loop {
                let head = support::read_h1_head(&mut io).await;
                if head.is_empty() {
                    return;
                }
                let target = head.split_whitespace().nth(1).unwrap().to_owned();
                let permit = gate.acquire().await.unwrap();
                permit.forget();
                let body = target.trim_start_matches('/').to_owned();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                if io.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
            }
        })
    }
}

#[tokio::test]
async fn buffered_waiters_overflow_and_drain_in_order() {
    support::init_tracing();
    let config = h1_config()
        .with_pool_max_size(1)
        .with_pool_buffer_size(Some(2))
        .with_http1_max_concurrent_requests(Some(1));
    let gate = Arc::new(Semaphore::new(0));
    let factory = MockChannelFactory::new(&config, gated_server(gate.clone()));
    let endpoint = Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory)
        .build()
        .unwrap();

    let spawn_exchange = |target: &'static str| {
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let response = endpoint.exchange(Method::GET, target)?.send().await?;
            response.into_bytes().await
        })
    };

    // first waiter grows the pool and occupies the single slot
    let first = spawn_exchange("/one");
    gate.add_permits(1);
    let body = first.await.unwrap().unwrap();
    assert_eq!(&body[..], b"one");

    // hold the slot with a request the server will not answer yet
    let held = spawn_exchange("/held");
    tokio::task::yield_now().await;

    // two waiters fit the buffer, the third overflows
    let second = spawn_exchange("/two");
    tokio::task::yield_now().await;
    let third = spawn_exchange("/three");
    tokio::task::yield_now().await;
    let fourth = spawn_exchange("/four");
    let overflow = fourth.await.unwrap().unwrap_err();
    assert!(overflow.is_pool(), "got: {overflow:?}");
    assert!(!overflow.is_pool_closed());

    // released capacity serves the buffered waiters in arrival order
    gate.add_permits(3);
    assert_eq!(&held.await.unwrap().unwrap()[..], b"held");
    assert_eq!(&second.await.unwrap().unwrap()[..], b"two");
    assert_eq!(&third.await.unwrap().unwrap()[..], b"three");
}

#[tokio::test]
async fn capacity_law_holds_under_load() {
    support::init_tracing();
    let config = h1_config()
        .with_pool_max_size(2)
        .with_http1_max_concurrent_requests(Some(2));
    let gate = Arc::new(Semaphore::new(0));
    let factory = MockChannelFactory::new(&config, gated_server(gate.clone()));
    let endpoint = Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory)
        .build()
        .unwrap();

    let mut handles = Vec::new();
    for target in ["/a", "/b", "/c", "/d"] {
        let endpoint = endpoint.clone();
        handles.push(tokio::spawn(async move {
            endpoint
                .exchange(Method::GET, target)
                .unwrap()
                .send()
                .await
                .unwrap()
                .into_bytes()
                .await
                .unwrap()
        }));
        tokio::task::yield_now().await;

        let report = endpoint.pool_report().await.expect("pool running");
        assert!(report.size + report.connecting <= 2, "report: {report:?}");
        assert!(report.capacity <= report.total_capacity, "report: {report:?}");
        assert!(report.load_factor >= 0.0 && report.load_factor <= 1.0);
    }

    gate.add_permits(4);
    for handle in handles {
        handle.await.unwrap();
    }

    let report = endpoint.pool_report().await.expect("pool running");
    assert_eq!(report.capacity, report.total_capacity, "all allocations released");
    assert_eq!(report.queued, 0);
}

#[tokio::test]
async fn waiters_are_served_in_arrival_order() {
    support::init_tracing();
    let config = h1_config()
        .with_pool_max_size(1)
        .with_http1_max_concurrent_requests(Some(1));
    let gate = Arc::new(Semaphore::new(0));
    let factory = MockChannelFactory::new(&config, gated_server(gate.clone()));
    let endpoint = Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory)
        .build()
        .unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for index in 0..5usize {
        let endpoint = endpoint.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let target = format!("/{index}");
            let response = endpoint
                .exchange(Method::GET, &target)
                .unwrap()
                .send()
                .await
                .unwrap();
            let _ = response.into_bytes().await.unwrap();
            order.lock().unwrap().push(index);
        }));
        tokio::task::yield_now().await;
    }

    gate.add_permits(5);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(order.lock().unwrap().as_slice(), [0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn acquire_times_out_when_capacity_never_appears() {
    support::init_tracing();
    let config = h1_config()
        .with_pool_max_size(1)
        .with_http1_max_concurrent_requests(Some(1))
        .with_pool_connect_timeout(std::time::Duration::from_millis(100));
    let gate = Arc::new(Semaphore::new(0));
    let factory = MockChannelFactory::new(&config, gated_server(gate.clone()));
    let endpoint = Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory)
        .build()
        .unwrap();

    // occupy the only slot forever
    let endpoint2 = endpoint.clone();
    let _held = tokio::spawn(async move {
        let _ = endpoint2
            .exchange(Method::GET, "/held")
            .unwrap()
            .send()
            .await;
    });
    tokio::task::yield_now().await;

    let started = tokio::time::Instant::now();
    let err = endpoint
        .exchange(Method::GET, "/starved")
        .unwrap()
        .send()
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "got: {err:?}");
    assert!(started.elapsed() >= std::time::Duration::from_millis(100));
    assert!(started.elapsed() < std::time::Duration::from_millis(150));
}

#[tokio::test]
async fn shutdown_fails_new_acquisitions() {
    support::init_tracing();
    let config = h1_config();
    let gate = Arc::new(Semaphore::new(8));
    let factory = MockChannelFactory::new(&config, gated_server(gate));
    let endpoint = Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory)
        .build()
        .unwrap();

    let response = endpoint
        .exchange(Method::GET, "/before")
        .unwrap()
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    endpoint.shutdown_gracefully().await;

    let err = endpoint
        .exchange(Method::GET, "/after")
        .unwrap()
        .send()
        .await
        .unwrap_err();
    assert!(err.is_pool_closed(), "got: {err:?}");
}
