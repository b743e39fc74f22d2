//! HTTP/1.1 end-to-end behavior over in-memory channels.

mod support;

use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use remora::http::Method;
use remora::test_utils::MockChannelFactory;
use remora::{ClientConfig, Endpoint, HttpVersion};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

fn h1_config() -> ClientConfig {
    ClientConfig::new().with_protocols(vec![HttpVersion::Http11])
}

fn endpoint_with(
    config: ClientConfig,
    factory: Arc<MockChannelFactory>,
) -> Endpoint {
    Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory)
        .build()
        .expect("endpoint builds")
}

#[tokio::test]
async fn get_hello() {
    support::init_tracing();
    let config = h1_config().with_user_agent("remora/test");
    let factory = MockChannelFactory::new(&config, |mut io| async move {
        let head = support::read_h1_head(&mut io).await;
        assert!(head.starts_with("GET /hello HTTP/1.1\r\n"), "head: {head:?}");
        assert_eq!(support::header_value(&head, "host").as_deref(), Some("h:8080"));
        assert_eq!(
            support::header_value(&head, "user-agent").as_deref(),
            Some("remora/test")
        );
        io.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nHi")
            .await
            .unwrap();
    });
    let endpoint = endpoint_with(config, factory);

    let response = endpoint
        .exchange(Method::GET, "/hello")
        .unwrap()
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.trailers().is_none());
    let body = response.into_bytes().await.unwrap();
    assert_eq!(&body[..], b"Hi");
}

#[tokio::test]
async fn pipelined_responses_arrive_in_request_order() {
    support::init_tracing();
    let config = h1_config()
        .with_pool_max_size(1)
        .with_http1_max_concurrent_requests(Some(3));
    let factory = MockChannelFactory::new(&config, |mut io| async move {
        // all three heads arrive before anything is answered
        let mut targets = Vec::new();
        for _ in 0..3 {
            let head = support::read_h1_head(&mut io).await;
            let target = head
                .split_whitespace()
                .nth(1)
                .expect("request target")
                .to_owned();
            targets.push(target);
        }
        for target in targets {
            let body = target.trim_start_matches('/').to_owned();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            io.write_all(response.as_bytes()).await.unwrap();
        }
    });
    let endpoint = endpoint_with(config, factory);

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for target in ["/alpha", "/beta", "/gamma"] {
        let endpoint = endpoint.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let response = endpoint
                .exchange(Method::GET, target)
                .unwrap()
                .send()
                .await
                .unwrap();
            let body = response.into_bytes().await.unwrap();
            order.lock().unwrap().push(String::from_utf8(body.to_vec()).unwrap());
            body
        }));
        // keep acquisition order deterministic
        tokio::task::yield_now().await;
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(
        order.lock().unwrap().as_slice(),
        ["alpha", "beta", "gamma"]
    );
}

#[tokio::test]
async fn chunked_body_with_trailers() {
    support::init_tracing();
    let config = h1_config();
    let factory = MockChannelFactory::new(&config, |mut io| async move {
        let _ = support::read_h1_head(&mut io).await;
        io.write_all(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\nx-sum: 9\r\n\r\n",
        )
        .await
        .unwrap();
    });
    let endpoint = endpoint_with(config, factory);

    let mut response = endpoint
        .exchange(Method::GET, "/wiki")
        .unwrap()
        .send()
        .await
        .unwrap();
    assert!(response.trailers().is_none(), "trailers only after the body");
    let body = response.body_mut().aggregate().await.unwrap();
    assert_eq!(&body[..], b"Wikipedia");
    let trailers = response.trailers().expect("trailers after body");
    assert_eq!(trailers.get("x-sum").unwrap(), "9");
}

#[tokio::test]
async fn gzip_response_is_decompressed() {
    support::init_tracing();
    let config = h1_config().with_decompression(true);
    let factory = MockChannelFactory::new(&config, |mut io| async move {
        let head = support::read_h1_head(&mut io).await;
        let accept = support::header_value(&head, "accept-encoding").expect("accept-encoding");
        assert!(accept.contains("gzip"), "advertises gzip: {accept:?}");

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"squeezed").unwrap();
        let compressed = encoder.finish().unwrap();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        );
        io.write_all(head.as_bytes()).await.unwrap();
        io.write_all(&compressed).await.unwrap();
    });
    let endpoint = endpoint_with(config, factory);

    let response = endpoint
        .exchange(Method::GET, "/packed")
        .unwrap()
        .send()
        .await
        .unwrap();
    let body = response.into_bytes().await.unwrap();
    assert_eq!(&body[..], b"squeezed");
}

#[tokio::test]
async fn multipart_body_completes_a_boundaryless_content_type() {
    support::init_tracing();
    let config = h1_config();
    let factory = MockChannelFactory::new(&config, |mut io| async move {
        let head = support::read_h1_head(&mut io).await;
        let content_type = support::header_value(&head, "content-type").expect("content-type");
        assert!(content_type.starts_with("multipart/form-data; boundary="));
        let boundary = content_type
            .split_once("boundary=")
            .map(|(_, boundary)| boundary.to_owned())
            .unwrap();

        let length: usize = support::header_value(&head, "content-length")
            .expect("content-length")
            .parse()
            .unwrap();
        let mut body = vec![0u8; length];
        tokio::io::AsyncReadExt::read_exact(&mut io, &mut body)
            .await
            .unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(body.starts_with(&format!("--{boundary}\r\n")));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));

        io.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
    });
    let endpoint = endpoint_with(config, factory);

    let mut exchange = endpoint.exchange(Method::POST, "/upload").unwrap();
    exchange
        .request_mut()
        // the boundary is missing on purpose
        .header("content-type", "multipart/form-data")
        .unwrap()
        .body_multipart(vec![remora::exchange::Part::new("field", "value")])
        .unwrap();
    let response = exchange.send().await.unwrap();
    assert_eq!(response.status(), 204);
}

#[tokio::test(start_paused = true)]
async fn request_times_out_without_response_headers() {
    support::init_tracing();
    let config = h1_config().with_request_timeout(std::time::Duration::from_millis(50));
    let (eof_tx, mut eof_rx) = mpsc::unbounded_channel();
    let factory = MockChannelFactory::new(&config, move |mut io| {
        let eof_tx = eof_tx.clone();
        async move {
            let _ = support::read_h1_head(&mut io).await;
            // withhold the response; report when the client hangs up
            let mut buf = [0u8; 1];
            let n = tokio::io::AsyncReadExt::read(&mut io, &mut buf).await.unwrap_or(0);
            let _ = eof_tx.send(n);
        }
    });
    let endpoint = endpoint_with(config, factory);

    let started = tokio::time::Instant::now();
    let err = endpoint
        .exchange(Method::GET, "/slow")
        .unwrap()
        .send()
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "got: {err:?}");
    assert!(started.elapsed() < std::time::Duration::from_millis(60));

    // the connection is closed after the timeout
    assert_eq!(eof_rx.recv().await, Some(0));
}

#[tokio::test]
async fn connection_close_retires_the_connection() {
    support::init_tracing();
    let config = h1_config();
    let hits = Arc::new(AtomicUsize::new(0));
    let factory = MockChannelFactory::new(&config, {
        let hits = hits.clone();
        move |mut io| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::AcqRel);
                let _ = support::read_h1_head(&mut io).await;
                io.write_all(
                    b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 3\r\n\r\nbye",
                )
                .await
                .unwrap();
            }
        }
    });
    let endpoint = endpoint_with(config, factory.clone());

    for _ in 0..2 {
        let response = endpoint
            .exchange(Method::GET, "/close")
            .unwrap()
            .send()
            .await
            .unwrap();
        let body = response.into_bytes().await.unwrap();
        assert_eq!(&body[..], b"bye");
    }
    // each exchange required a fresh channel
    assert_eq!(factory.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn canceling_the_exchange_closes_the_connection() {
    support::init_tracing();
    let config = h1_config();
    let (eof_tx, mut eof_rx) = mpsc::unbounded_channel();
    let factory = MockChannelFactory::new(&config, move |mut io| {
        let eof_tx = eof_tx.clone();
        async move {
            let _ = support::read_h1_head(&mut io).await;
            let mut buf = [0u8; 1];
            let n = tokio::io::AsyncReadExt::read(&mut io, &mut buf).await.unwrap_or(0);
            let _ = eof_tx.send(n);
        }
    });
    let endpoint = endpoint_with(config, factory);

    let send = endpoint.exchange(Method::GET, "/hang").unwrap().send();
    let result =
        tokio::time::timeout(std::time::Duration::from_millis(20), send).await;
    assert!(result.is_err(), "the caller gave up first");

    // dropping the exchange future closes the h1 connection
    assert_eq!(eof_rx.recv().await, Some(0));
}
