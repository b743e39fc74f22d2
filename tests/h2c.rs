//! h2c upgrade: plaintext `{h2, http/1.1}` endpoints advertise the upgrade
//! on their first exchange and either switch to HTTP/2 or stay on HTTP/1.1.

mod support;

use remora::http::{Method, Version};
use remora::test_utils::MockChannelFactory;
use remora::{ClientConfig, Endpoint, HttpVersion};
use tokio::io::AsyncWriteExt;

use support::{FLAG_END_HEADERS, FLAG_END_STREAM, H2_DATA, H2_HEADERS, HPACK_STATUS_200};

fn upgrade_config() -> ClientConfig {
    ClientConfig::new()
        .with_protocols(vec![HttpVersion::H2, HttpVersion::Http11])
        .with_pool_max_size(1)
}

#[tokio::test]
async fn accepted_upgrade_switches_to_h2() {
    support::init_tracing();
    let config = upgrade_config();
    let factory = MockChannelFactory::new(&config, |mut io| async move {
        let head = support::read_h1_head(&mut io).await;
        assert!(head.starts_with("GET /hello HTTP/1.1\r\n"));
        assert_eq!(
            support::header_value(&head, "upgrade").as_deref(),
            Some("h2c")
        );
        let connection = support::header_value(&head, "connection").expect("connection header");
        assert!(connection.to_ascii_lowercase().contains("upgrade"));
        let settings = support::header_value(&head, "http2-settings").expect("settings header");
        assert!(!settings.is_empty());

        io.write_all(
            b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n",
        )
        .await
        .unwrap();

        // now speak h2: the upgraded exchange is stream 1
        support::h2_server_handshake(&mut io).await;
        support::write_frame(&mut io, H2_HEADERS, FLAG_END_HEADERS, 1, HPACK_STATUS_200).await;
        support::write_frame(&mut io, H2_DATA, FLAG_END_STREAM, 1, b"Hi").await;

        // the next exchange rides stream 3
        let second = support::h2_read_request(&mut io).await;
        assert_eq!(second.kind, H2_HEADERS);
        assert_eq!(second.stream_id, 3);
        support::write_frame(&mut io, H2_HEADERS, FLAG_END_HEADERS, 3, HPACK_STATUS_200).await;
        support::write_frame(&mut io, H2_DATA, FLAG_END_STREAM, 3, b"again").await;
        let _ = support::read_frame(&mut io).await;
    });
    let endpoint = Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory.clone())
        .build()
        .unwrap();

    let response = endpoint
        .exchange(Method::GET, "/hello")
        .unwrap()
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.version(), Version::HTTP_2);
    assert_eq!(&response.into_bytes().await.unwrap()[..], b"Hi");

    let response = endpoint
        .exchange(Method::GET, "/again")
        .unwrap()
        .send()
        .await
        .unwrap();
    assert_eq!(response.version(), Version::HTTP_2);
    assert_eq!(&response.into_bytes().await.unwrap()[..], b"again");

    assert_eq!(factory.opened(), 1, "both exchanges share the upgraded channel");
}

#[tokio::test]
async fn declined_upgrade_stays_on_h1() {
    support::init_tracing();
    let config = upgrade_config();
    let factory = MockChannelFactory::new(&config, |mut io| async move {
        let head = support::read_h1_head(&mut io).await;
        assert_eq!(
            support::header_value(&head, "upgrade").as_deref(),
            Some("h2c"),
            "first exchange advertises the upgrade"
        );
        io.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nplain")
            .await
            .unwrap();

        // second exchange: same connection, no upgrade offer
        let head = support::read_h1_head(&mut io).await;
        assert!(head.starts_with("GET /second HTTP/1.1\r\n"));
        assert!(
            support::header_value(&head, "upgrade").is_none(),
            "upgrade is not re-advertised"
        );
        io.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none")
            .await
            .unwrap();
    });
    let endpoint = Endpoint::builder("h", 8080)
        .with_configuration(config)
        .with_channel_factory(factory.clone())
        .build()
        .unwrap();

    let response = endpoint
        .exchange(Method::GET, "/first")
        .unwrap()
        .send()
        .await
        .unwrap();
    assert_eq!(response.version(), Version::HTTP_11);
    assert_eq!(&response.into_bytes().await.unwrap()[..], b"plain");

    let response = endpoint
        .exchange(Method::GET, "/second")
        .unwrap()
        .send()
        .await
        .unwrap();
    assert_eq!(&response.into_bytes().await.unwrap()[..], b"one");

    assert_eq!(factory.opened(), 1, "the declined connection keeps serving");
}
