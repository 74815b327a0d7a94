//! Scenario 3 (`spec.md` §8): two unsecured sub-connections bound to
//! channels 7 and 9 after sequential `ConnectResponse`s; a `TunnelingRequest`
//! naming channel 9 in its body reaches only that sub-connection.
//!
//! Scenario 4: a `SearchResponse` is broadcast to every registered
//! sub-connection rather than demultiplexed by channel.

mod common;

use knx_ip_secure_core::codec::{Header, ServiceType};
use knx_ip_secure_core::config::Config;
use knx_ip_secure_core::transport::TcpConnection;
use knx_ip_secure_core::types::SerialNumber;
use std::time::Duration;

fn connect_response(channel: u8, status: u8) -> Vec<u8> {
    let header = Header::new(ServiceType::ConnectResponse, 2);
    let mut frame = header.serialize().to_vec();
    frame.push(channel);
    frame.push(status);
    frame
}

fn tunneling_request(channel: u8) -> Vec<u8> {
    let header = Header::new(ServiceType::TunnelingRequest, 2);
    let mut frame = header.serialize().to_vec();
    frame.push(4); // sub-header length
    frame.push(channel);
    frame
}

fn search_response() -> Vec<u8> {
    let header = Header::new(ServiceType::SearchResponse, 4);
    let mut frame = header.serialize().to_vec();
    frame.extend_from_slice(b"knx!");
    frame
}

#[tokio::test]
async fn tunneling_request_reaches_only_its_bound_channel() {
    let server = common::ScriptedServer::bind().await;
    let addr = server.local_addr();
    let connection = TcpConnection::new(addr, SerialNumber::ZERO, Config::default());
    connection.connect().await.unwrap();

    // Subs must be registered in the pending FIFO before the server's
    // ConnectResponses arrive, or the first response finds no pending entry
    // to bind.
    let (sub7, mut rx7) = connection.open_sub_connection(None);
    let (sub9, mut rx9) = connection.open_sub_connection(None);

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let server_task = tokio::spawn(async move {
        let mut stream = server.accept().await;
        ready_rx.await.ok();
        common::write_frame(&mut stream, &connect_response(7, 0)).await;
        common::write_frame(&mut stream, &connect_response(9, 0)).await;
        common::write_frame(&mut stream, &tunneling_request(9)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    });
    ready_tx.send(()).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(sub7.channel_id().map(|c| c.0), Some(7));
    assert_eq!(sub9.channel_id().map(|c| c.0), Some(9));

    assert!(rx9.try_recv().is_ok(), "channel 9 should receive its TunnelingRequest");
    assert!(
        rx7.try_recv().is_err(),
        "channel 7 must not receive a frame addressed to channel 9"
    );

    server_task.await.unwrap();
    connection.close().await;
}

#[tokio::test]
async fn search_response_is_broadcast_to_every_sub_connection() {
    let server = common::ScriptedServer::bind().await;
    let addr = server.local_addr();
    let connection = TcpConnection::new(addr, SerialNumber::ZERO, Config::default());
    connection.connect().await.unwrap();

    let (_s1, mut rx1) = connection.open_sub_connection(None);
    let (_s2, mut rx2) = connection.open_sub_connection(None);
    let (_s3, mut rx3) = connection.open_sub_connection(None);

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let server_task = tokio::spawn(async move {
        let mut stream = server.accept().await;
        ready_rx.await.ok();
        common::write_frame(&mut stream, &connect_response(1, 0)).await;
        common::write_frame(&mut stream, &connect_response(2, 0)).await;
        common::write_frame(&mut stream, &connect_response(3, 0)).await;
        common::write_frame(&mut stream, &search_response()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    });
    ready_tx.send(()).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(rx1.try_recv().is_ok());
    assert!(rx2.try_recv().is_ok());
    assert!(rx3.try_recv().is_ok());

    server_task.await.unwrap();
    connection.close().await;
}
