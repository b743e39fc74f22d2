//! Interceptor chain semantics.

mod support;

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use remora::http::{Method, StatusCode};
use remora::test_utils::MockChannelFactory;
use remora::{ClientConfig, Endpoint, HttpVersion, Interceptor};
use tokio::io::AsyncWriteExt;

fn h1_config() -> ClientConfig {
    ClientConfig::new().with_protocols(vec![HttpVersion::Http11])
}

#[tokio::test]
async fn short_circuit_never_touches_the_wire() {
    support::init_tracing();
    let config = h1_config();
    let factory = MockChannelFactory::new(&config, |_io| async move {
        panic!("no channel must be opened");
    });

    let teapot: Interceptor = Arc::new(|mut ie| {
        Box::pin(async move {
            ie.response_mut()
                .set_status(StatusCode::IM_A_TEAPOT)
                .set_body("teapot");
            Ok(None)
        })
    });

    let endpoint = Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory.clone())
        .with_interceptor(teapot)
        .build()
        .unwrap();

    let response = endpoint
        .exchange(Method::GET, "/brew")
        .unwrap()
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    let body = response.into_bytes().await.unwrap();
    assert_eq!(&body[..], b"teapot");

    assert_eq!(factory.opened(), 0, "no connection was acquired");
    assert_eq!(endpoint.active_requests(), 0);
}

#[tokio::test]
async fn interceptors_mutate_the_request_before_send() {
    support::init_tracing();
    let config = h1_config();
    let factory = MockChannelFactory::new(&config, |mut io| async move {
        let head = support::read_h1_head(&mut io).await;
        assert_eq!(
            support::header_value(&head, "x-trace").as_deref(),
            Some("on")
        );
        io.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
    });

    let tracer: Interceptor = Arc::new(|mut ie| {
        Box::pin(async move {
            ie.request_mut().header("x-trace", "on")?;
            Ok(Some(ie))
        })
    });

    let endpoint = Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory)
        .with_interceptor(tracer)
        .build()
        .unwrap();

    let response = endpoint
        .exchange(Method::GET, "/traced")
        .unwrap()
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn response_body_transformer_applies_to_the_real_payload() {
    support::init_tracing();
    let config = h1_config();
    let factory = MockChannelFactory::new(&config, |mut io| async move {
        let _ = support::read_h1_head(&mut io).await;
        io.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nquiet")
            .await
            .unwrap();
    });

    let shout: Interceptor = Arc::new(|mut ie| {
        Box::pin(async move {
            ie.transform_response_body(Box::new(|stream| {
                Box::pin(stream.map(|chunk| {
                    chunk.map(|bytes| {
                        Bytes::from(
                            bytes.iter().map(u8::to_ascii_uppercase).collect::<Vec<_>>(),
                        )
                    })
                }))
            }));
            Ok(Some(ie))
        })
    });

    let endpoint = Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory)
        .with_interceptor(shout)
        .build()
        .unwrap();

    let response = endpoint
        .exchange(Method::GET, "/loud")
        .unwrap()
        .send()
        .await
        .unwrap();
    let body = response.into_bytes().await.unwrap();
    assert_eq!(&body[..], b"QUIET");
}
