//! Scenario 2 (`spec.md` §8): replaying a wrapped frame's sequence number
//! closes the session. The first copy is accepted (the session stays
//! authenticated); the second, identical in every field, triggers
//! `ReplayDetected` and the session tears itself down.

mod common;

use knx_ip_secure_core::config::Config;
use knx_ip_secure_core::transport::TcpConnection;
use knx_ip_secure_core::types::{SerialNumber, UserId};
use std::time::Duration;
use zeroize::Zeroizing;

#[tokio::test]
async fn replayed_sequence_number_closes_the_session() {
    let server = common::ScriptedServer::bind().await;
    let addr = server.local_addr();

    let connection = TcpConnection::new(addr, SerialNumber::ZERO, Config::default());
    connection.connect().await.unwrap();

    let server_task = tokio::spawn(async move {
        let mut stream = server.accept().await;
        let (session_id, key) = common::run_handshake(&mut stream, 0x0042, [0; 6]).await;

        common::send_wrapped_tunneling_request(&mut stream, session_id, 17, [0; 6], &key, 9).await;
        common::send_wrapped_tunneling_request(&mut stream, session_id, 17, [0; 6], &key, 9).await;
        stream
    });

    let user = UserId::new(3).unwrap();
    let session = connection.new_secure_session(user, Zeroizing::new([0x03u8; 16]), None);
    session.ensure_open().await.unwrap();
    assert!(session.is_authenticated());

    // Give the receive loop time to process both frames.
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(
        !session.is_authenticated(),
        "session must close after a replayed sequence number"
    );

    server_task.await.unwrap();
    connection.close().await;
}
