use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::broker::engine::Broker;
use crate::broker::message::Reliability;
use crate::config::{BrokerSettings, Settings};
use crate::transport::frame::{
    Frame, FrameKind, MAX_FRAME_PAYLOAD, ReportBody, ReportStatus, read_frame, write_frame,
};
use crate::transport::tcp::start_broker_server;
use crate::utils::error::MmwError;

// --- codec ---

#[test]
fn data_frame_layout_is_little_endian() {
    let frame = Frame::data("ab", Reliability::Reliable, 7, Bytes::from_static(b"xyz"));
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);

    let expected: &[u8] = &[
        4, // kind = Data
        2, 0, // topic length
        b'a', b'b', // topic
        1, // flags: reliable
        7, 0, 0, 0, 0, 0, 0, 0, // sequence
        3, 0, 0, 0, // payload length
        b'x', b'y', b'z', // payload
    ];
    assert_eq!(&buf[..], expected);
}

#[tokio::test]
async fn decode_recovers_every_field() {
    let frame = Frame::data(
        "updates",
        Reliability::BestEffort,
        42,
        Bytes::from_static(b"payload"),
    );
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);

    let mut slice: &[u8] = &buf;
    let decoded = read_frame(&mut slice, MAX_FRAME_PAYLOAD).await.unwrap();
    assert_eq!(decoded, frame);
}

#[tokio::test]
async fn unregister_role_flag_survives_decode() {
    let frame = Frame::unregister("updates", true);
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);

    let mut slice: &[u8] = &buf;
    let decoded = read_frame(&mut slice, MAX_FRAME_PAYLOAD).await.unwrap();
    assert_eq!(decoded.kind, FrameKind::Unregister);
    assert!(decoded.subscriber_role);
}

#[tokio::test]
async fn truncated_frame_fails_to_decode() {
    let frame = Frame::data("t", Reliability::BestEffort, 1, Bytes::from_static(b"body"));
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);

    let mut slice: &[u8] = &buf[..buf.len() - 1];
    assert!(matches!(
        read_frame(&mut slice, MAX_FRAME_PAYLOAD).await,
        Err(MmwError::Connection(_))
    ));
}

#[tokio::test]
async fn unknown_frame_kind_is_rejected() {
    let mut slice: &[u8] = &[99, 0, 0];
    assert!(matches!(
        read_frame(&mut slice, MAX_FRAME_PAYLOAD).await,
        Err(MmwError::Frame(_))
    ));
}

#[tokio::test]
async fn payload_over_frame_limit_is_rejected() {
    let frame = Frame::data(
        "t",
        Reliability::BestEffort,
        1,
        Bytes::from(vec![0u8; 128]),
    );
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);

    let mut slice: &[u8] = &buf;
    assert!(matches!(
        read_frame(&mut slice, 64).await,
        Err(MmwError::Frame(_))
    ));
}

#[test]
fn report_body_roundtrip() {
    let body = ReportBody::timeout(3, 2);
    let encoded = body.encode();
    assert_eq!(encoded.len(), 9);
    assert_eq!(ReportBody::decode(&encoded).unwrap(), body);

    assert!(ReportBody::decode(&encoded[..5]).is_err());
}

// --- broker server over raw framed TCP ---

fn test_settings() -> BrokerSettings {
    BrokerSettings {
        ack_timeout_ms: 100,
        max_retries: 1,
        ..Settings::default().broker
    }
}

async fn spawn_server(settings: BrokerSettings) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let broker = Arc::new(Broker::new(settings));
    tokio::spawn(start_broker_server(listener, broker.clone()));
    tokio::spawn(Broker::start_retry_loop(broker));
    addr
}

async fn recv(stream: &mut TcpStream) -> Frame {
    timeout(Duration::from_secs(5), read_frame(stream, MAX_FRAME_PAYLOAD))
        .await
        .expect("timed out waiting for frame")
        .expect("read frame")
}

async fn register(stream: &mut TcpStream, frame: Frame) {
    let corr = frame.seq;
    write_frame(stream, &frame).await.expect("write register");
    let confirm = recv(stream).await;
    assert_eq!(confirm.kind, FrameKind::Report);
    assert_eq!(confirm.seq, corr);
    assert_eq!(
        ReportBody::decode(&confirm.payload).unwrap().status,
        ReportStatus::Ok
    );
}

#[tokio::test]
async fn register_publish_ack_report_over_tcp() {
    let addr = spawn_server(test_settings()).await;

    let mut publisher = TcpStream::connect(addr).await.unwrap();
    register(&mut publisher, Frame::register_publisher("news", 1)).await;

    let mut subscriber = TcpStream::connect(addr).await.unwrap();
    register(&mut subscriber, Frame::register_subscriber("news", 1)).await;

    write_frame(
        &mut publisher,
        &Frame::data("news", Reliability::Reliable, 5, Bytes::from_static(b"hello")),
    )
    .await
    .unwrap();

    let data = recv(&mut subscriber).await;
    assert_eq!(data.kind, FrameKind::Data);
    assert_eq!(data.topic, "news");
    assert_eq!(data.seq, 1);
    assert_eq!(data.reliability, Reliability::Reliable);
    assert_eq!(&data.payload[..], b"hello");

    write_frame(&mut subscriber, &Frame::ack("news", 1)).await.unwrap();

    let report = recv(&mut publisher).await;
    assert_eq!(report.kind, FrameKind::Report);
    assert_eq!(report.seq, 5);
    let body = ReportBody::decode(&report.payload).unwrap();
    assert_eq!(body.status, ReportStatus::Ok);
    assert_eq!(body.delivered, 1);
    assert_eq!(body.failed, 0);
}

#[tokio::test]
async fn silent_subscriber_sees_retry_and_publisher_gets_timeout_report() {
    let addr = spawn_server(test_settings()).await;

    let mut publisher = TcpStream::connect(addr).await.unwrap();
    register(&mut publisher, Frame::register_publisher("jobs", 1)).await;

    let mut subscriber = TcpStream::connect(addr).await.unwrap();
    register(&mut subscriber, Frame::register_subscriber("jobs", 1)).await;

    write_frame(
        &mut publisher,
        &Frame::data("jobs", Reliability::Reliable, 2, Bytes::from_static(b"work")),
    )
    .await
    .unwrap();

    // Never acked, so the same sequence arrives again on retry
    let first = recv(&mut subscriber).await;
    let second = recv(&mut subscriber).await;
    assert_eq!(first.seq, 1);
    assert_eq!(second.seq, 1);
    assert_eq!(&second.payload[..], b"work");

    let report = recv(&mut publisher).await;
    assert_eq!(report.seq, 2);
    let body = ReportBody::decode(&report.payload).unwrap();
    assert_eq!(body.status, ReportStatus::Timeout);
    assert_eq!(body.failed, 1);
}

#[tokio::test]
async fn publish_without_registration_is_reported() {
    let addr = spawn_server(test_settings()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(
        &mut client,
        &Frame::data("nowhere", Reliability::Reliable, 3, Bytes::from_static(b"x")),
    )
    .await
    .unwrap();

    let report = recv(&mut client).await;
    assert_eq!(report.seq, 3);
    assert_eq!(
        ReportBody::decode(&report.payload).unwrap().status,
        ReportStatus::UnknownTopic
    );
}

#[tokio::test]
async fn oversized_payload_is_reported() {
    let settings = BrokerSettings {
        max_payload_bytes: 64,
        ..test_settings()
    };
    let addr = spawn_server(settings).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    register(&mut client, Frame::register_publisher("big", 1)).await;

    write_frame(
        &mut client,
        &Frame::data("big", Reliability::Reliable, 4, Bytes::from(vec![0u8; 128])),
    )
    .await
    .unwrap();

    let report = recv(&mut client).await;
    assert_eq!(report.seq, 4);
    assert_eq!(
        ReportBody::decode(&report.payload).unwrap().status,
        ReportStatus::PayloadTooLarge
    );
}
