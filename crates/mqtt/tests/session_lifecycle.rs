mod common;

use std::time::Duration;

use common::{mock, test_config, Attempt};
use device_mqtt::{
    Config, ConnectReturnCode, ConnectionState, Credentials, DeliveryError, DisconnectReason,
    Packet, PacketId, QoSLevel, SessionBuilder, TransferError, WillRegistration, WillState,
};
use rumqttc::{PubAck, PubComp, PubRec, PubRel, Publish, QoS};
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test(start_paused = true)]
async fn test_connect_publish_disconnect() {
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    assert_eq!(
        session.state(),
        ConnectionState::Disconnected(DisconnectReason::NotYetConnected)
    );

    session.connect().await.unwrap();
    assert!(session.state().is_connected());

    let mut link = broker.accept().await;
    let connect = link.expect_connect().await;
    assert_eq!(connect.client_id, "device-under-test");
    assert!(!connect.clean_session);
    assert!(connect.last_will.is_none());
    assert!(connect.login.is_none());

    let handle = session
        .publish("devices/d1/telemetry", "21.5", QoSLevel::AtLeastOnce, false)
        .await
        .unwrap();
    let publish = link.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(!publish.dup);
    assert_eq!(publish.payload.as_ref(), b"21.5");
    assert_eq!(handle.packet_id().map(PacketId::get), Some(publish.pkid));

    link.send(Packet::PubAck(PubAck::new(publish.pkid)));
    let receipt = handle.await.unwrap();
    assert_eq!(receipt.attempts, 1);

    session.disconnect().await.unwrap();
    assert_eq!(link.next().await, Packet::Disconnect);
    assert_eq!(
        session.state(),
        ConnectionState::Disconnected(DisconnectReason::Graceful)
    );
}

#[tokio::test(start_paused = true)]
async fn test_qos0_publish_resolves_immediately() {
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    let handle = session
        .publish("t/fire-and-forget", "x", QoSLevel::AtMostOnce, true)
        .await
        .unwrap();
    assert_eq!(handle.packet_id(), None);
    assert!(handle.await.is_ok());

    let publish = link.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(publish.retain);
}

#[tokio::test(start_paused = true)]
async fn test_qos0_publish_on_dead_link_fails() {
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;
    link.sever();

    let result = session
        .publish("t/fire-and-forget", "x", QoSLevel::AtMostOnce, false)
        .await;
    assert!(matches!(result, Err(TransferError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_qos2_handshake() {
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    let handle = session
        .publish("t/exactly-once", "payload", QoSLevel::ExactlyOnce, false)
        .await
        .unwrap();
    let publish = link.expect_publish().await;
    assert_eq!(publish.qos, QoS::ExactlyOnce);

    // PUBCOMP before PUBREC is out of order and must not resolve anything.
    link.send(Packet::PubComp(PubComp::new(publish.pkid)));
    link.send(Packet::PubRec(PubRec::new(publish.pkid)));
    assert_eq!(link.next().await, Packet::PubRel(PubRel::new(publish.pkid)));

    link.send(Packet::PubComp(PubComp::new(publish.pkid)));
    let receipt = handle.await.unwrap();
    assert_eq!(receipt.qos, QoSLevel::ExactlyOnce);
}

#[tokio::test(start_paused = true)]
async fn test_publish_requires_connection() {
    let (connector, _broker) = mock([]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();

    let result = session
        .publish("t", "x", QoSLevel::AtLeastOnce, false)
        .await;
    assert!(matches!(result, Err(TransferError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_connect_twice_is_invalid() {
    let (connector, _broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    session.connect().await.unwrap();

    assert!(matches!(
        session.connect().await,
        Err(TransferError::InvalidState("Connected"))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_when_not_connected_is_invalid() {
    let (connector, _broker) = mock([]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();

    assert!(matches!(
        session.disconnect().await,
        Err(TransferError::InvalidState("Disconnected"))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_refused_connect_is_not_retried() {
    let (connector, broker) = mock([Attempt::refuse(ConnectReturnCode::ServiceUnavailable)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();

    let result = session.connect().await;
    assert!(matches!(
        result,
        Err(TransferError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable))
    ));
    assert_eq!(
        session.state(),
        ConnectionState::Disconnected(DisconnectReason::Refused(
            ConnectReturnCode::ServiceUnavailable
        ))
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(broker.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let (connector, broker) = mock([Attempt::Silent]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();

    let result = session.connect().await;
    assert!(matches!(
        result,
        Err(TransferError::HandshakeTimeout(timeout)) if timeout == Duration::from_secs(5)
    ));
    assert_eq!(
        session.state(),
        ConnectionState::Disconnected(DisconnectReason::HandshakeTimeout)
    );
    assert_eq!(broker.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connector_failure_surfaces_io_error() {
    let (connector, broker) = mock([Attempt::Fail]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();

    assert!(matches!(session.connect().await, Err(TransferError::Io(_))));
    assert!(matches!(
        session.state(),
        ConnectionState::Disconnected(DisconnectReason::ConnectFailed(_))
    ));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(broker.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_failure_succeeds() {
    let (connector, mut broker) = mock([Attempt::Fail, Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();

    assert!(session.connect().await.is_err());
    session.connect().await.unwrap();
    broker.accept().await.expect_connect().await;
    assert!(session.state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_credentials_are_resolved_per_connect() {
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config())
        .with_credentials(Credentials::new("device-under-test", "sas-token"))
        .spawn(connector)
        .unwrap();
    session.connect().await.unwrap();

    let connect = broker.accept().await.expect_connect().await;
    let login = connect.login.expect("login present");
    assert_eq!(login.username, "device-under-test");
    assert_eq!(login.password, "sas-token");
}

#[tokio::test(start_paused = true)]
async fn test_inflight_limit() {
    let config = Config {
        max_inflight: 1,
        ..test_config()
    };
    let (connector, _broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(config).spawn(connector).unwrap();
    session.connect().await.unwrap();

    let _first = session
        .publish("t", "1", QoSLevel::AtLeastOnce, false)
        .await
        .unwrap();
    let second = session.publish("t", "2", QoSLevel::AtLeastOnce, false).await;
    assert!(matches!(second, Err(TransferError::InflightLimit(1))));

    // QoS 0 is never tracked, so the limit does not apply.
    assert!(session
        .publish("t", "3", QoSLevel::AtMostOnce, false)
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_handle_leaves_delivery_tracked() {
    let config = Config {
        max_inflight: 1,
        ..test_config()
    };
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(config).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    let handle = session
        .publish("t", "1", QoSLevel::AtLeastOnce, false)
        .await
        .unwrap();
    let publish = link.expect_publish().await;
    assert_eq!(handle.cancel(), Err(DeliveryError::Cancelled));

    // Still pending: the single in-flight slot is taken until the ack.
    let blocked = session.publish("t", "2", QoSLevel::AtLeastOnce, false).await;
    assert!(matches!(blocked, Err(TransferError::InflightLimit(1))));

    link.send(Packet::PubAck(PubAck::new(publish.pkid)));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(session
        .publish("t", "3", QoSLevel::AtLeastOnce, false)
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_graceful_disconnect_resets_pending() {
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    let first = session
        .publish("t", "1", QoSLevel::AtLeastOnce, false)
        .await
        .unwrap();
    let second = session
        .publish("t", "2", QoSLevel::AtLeastOnce, false)
        .await
        .unwrap();

    session.disconnect().await.unwrap();
    assert_eq!(first.await, Err(DeliveryError::SessionReset));
    assert_eq!(second.await, Err(DeliveryError::SessionReset));
}

#[tokio::test(start_paused = true)]
async fn test_inbound_qos1_is_acknowledged_and_delivered() {
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    let mut messages = session.messages();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    let mut command = Publish::new("devices/d1/commands", QoS::AtLeastOnce, "reboot");
    command.pkid = 10;
    link.send(Packet::Publish(command));

    assert_eq!(link.next().await, Packet::PubAck(PubAck::new(10)));
    let message = messages.recv().await.unwrap();
    assert_eq!(message.topic, "devices/d1/commands");
    assert_eq!(message.payload.as_ref(), b"reboot");
    assert_eq!(message.qos, QoSLevel::AtLeastOnce);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_qos2_delivered_once() {
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    let mut messages = session.messages();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    let mut command = Publish::new("devices/d1/commands", QoS::ExactlyOnce, "update");
    command.pkid = 11;
    link.send(Packet::Publish(command.clone()));
    command.dup = true;
    link.send(Packet::Publish(command));

    assert_eq!(link.next().await, Packet::PubRec(PubRec::new(11)));
    assert_eq!(link.next().await, Packet::PubRec(PubRec::new(11)));
    assert_eq!(messages.try_recv().unwrap().payload.as_ref(), b"update");
    assert!(matches!(messages.try_recv(), Err(TryRecvError::Empty)));

    link.send(Packet::PubRel(PubRel::new(11)));
    assert_eq!(link.next().await, Packet::PubComp(PubComp::new(11)));
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_timeout_is_abrupt_loss() {
    let config = Config {
        keep_alive: 10,
        ..test_config()
    };
    let will = WillRegistration::new(1, "devices/d1/status", "offline", true).unwrap();
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(config)
        .with_will(will)
        .spawn(connector)
        .unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    assert_eq!(link.expect_connect().await.keep_alive, 10);

    assert_eq!(link.next().await, Packet::PingReq);
    link.send(Packet::PingResp);
    assert_eq!(link.next().await, Packet::PingReq);
    assert!(session.state().is_connected());

    // The second PINGREQ goes unanswered.
    let mut will_state = session.subscribe_will();
    will_state
        .wait_for(|state| *state == WillState::Triggered)
        .await
        .unwrap();
    assert!(!session.state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects_gracefully() {
    let (connector, mut broker) = mock([Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    session.shutdown();
    assert_eq!(link.next().await, Packet::Disconnect);

    let mut state = session.subscribe_state();
    state
        .wait_for(|s| *s == ConnectionState::Disconnected(DisconnectReason::Graceful))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(matches!(
        session.connect().await,
        Err(TransferError::KernelStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_transport_open() {
    let config = Config {
        connection_timeout: 300,
        ..test_config()
    };
    let (connector, broker) = mock([Attempt::Hang]);
    let session = SessionBuilder::new(config).spawn(connector).unwrap();
    let mut state = session.subscribe_state();

    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });
    state.wait_for(ConnectionState::is_connecting).await.unwrap();

    let started = tokio::time::Instant::now();
    session.shutdown();
    assert!(matches!(
        connecting.await.unwrap(),
        Err(TransferError::KernelStopped)
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(broker.attempts(), 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = Config {
        host: String::new(),
        ..test_config()
    };
    let (connector, _broker) = mock([]);
    assert!(matches!(
        SessionBuilder::new(config).spawn(connector),
        Err(TransferError::ConfigError(_))
    ));
}
