mod common;

use std::time::Duration;

use common::{mock, test_config, Attempt};
use device_mqtt::{Config, ConnectionState, DeliveryError, Packet, QoSLevel, SessionBuilder};
use rumqttc::{PubAck, PubComp, PubRec, PubRel};

#[tokio::test(start_paused = true)]
async fn test_resumed_session_replays_pending() {
    let (connector, mut broker) = mock([Attempt::accept(false), Attempt::accept(true)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    let at_least_once = session
        .publish("t/a", "a", QoSLevel::AtLeastOnce, false)
        .await
        .unwrap();
    let exactly_once = session
        .publish("t/b", "b", QoSLevel::ExactlyOnce, false)
        .await
        .unwrap();
    let first = link.expect_publish().await;
    let second = link.expect_publish().await;

    link.send(Packet::PubRec(PubRec::new(second.pkid)));
    assert_eq!(link.next().await, Packet::PubRel(PubRel::new(second.pkid)));
    link.sever();

    let mut link = broker.accept().await;
    assert!(!link.expect_connect().await.clean_session);

    // Sent entries come back as DUP publishes, received ones as PUBREL only.
    let replayed = link.expect_publish().await;
    assert_eq!(replayed.pkid, first.pkid);
    assert!(replayed.dup);
    assert_eq!(replayed.topic, "t/a");
    assert_eq!(link.next().await, Packet::PubRel(PubRel::new(second.pkid)));

    link.send(Packet::PubAck(PubAck::new(first.pkid)));
    link.send(Packet::PubComp(PubComp::new(second.pkid)));
    assert_eq!(at_least_once.await.unwrap().attempts, 2);
    assert_eq!(exactly_once.await.unwrap().attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_replay_is_ordered_by_packet_id() {
    let (connector, mut broker) = mock([Attempt::accept(false), Attempt::accept(true)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    let mut handles = Vec::new();
    for n in 0..3 {
        handles.push(
            session
                .publish("t/seq", n.to_string(), QoSLevel::AtLeastOnce, false)
                .await
                .unwrap(),
        );
    }
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(link.expect_publish().await.pkid);
    }
    link.sever();

    let mut link = broker.accept().await;
    link.expect_connect().await;
    let mut replayed = Vec::new();
    for _ in 0..3 {
        replayed.push(link.expect_publish().await.pkid);
    }
    ids.sort_unstable();
    assert_eq!(replayed, ids);
}

#[tokio::test(start_paused = true)]
async fn test_missing_broker_session_resets_pending() {
    let (connector, mut broker) = mock([Attempt::accept(false), Attempt::accept(false)]);
    let session = SessionBuilder::new(test_config()).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    let first = session
        .publish("t", "1", QoSLevel::AtLeastOnce, false)
        .await
        .unwrap();
    let second = session
        .publish("t", "2", QoSLevel::ExactlyOnce, false)
        .await
        .unwrap();
    link.sever();

    let mut link = broker.accept().await;
    link.expect_connect().await;
    assert_eq!(first.await, Err(DeliveryError::SessionReset));
    assert_eq!(second.await, Err(DeliveryError::SessionReset));
    assert!(link.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_clean_session_never_replays() {
    let config = Config {
        clean_session: true,
        ..test_config()
    };
    // Even a broker claiming a session is ignored when we asked for a clean one.
    let (connector, mut broker) = mock([Attempt::accept(false), Attempt::accept(true)]);
    let session = SessionBuilder::new(config).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    assert!(link.expect_connect().await.clean_session);

    let handle = session
        .publish("t", "1", QoSLevel::AtLeastOnce, false)
        .await
        .unwrap();
    link.sever();

    let mut link = broker.accept().await;
    link.expect_connect().await;
    let mut state = session.subscribe_state();
    state.wait_for(ConnectionState::is_connected).await.unwrap();
    assert_eq!(handle.await, Err(DeliveryError::SessionReset));
    assert!(link.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stale_deliveries_expire_instead_of_replaying() {
    let mut config = Config {
        delivery_timeout: 1,
        ..test_config()
    };
    config.reconnect.initial_delay_ms = 5_000;
    let (connector, mut broker) = mock([Attempt::accept(false), Attempt::accept(true)]);
    let session = SessionBuilder::new(config).spawn(connector).unwrap();
    session.connect().await.unwrap();
    let mut link = broker.accept().await;
    link.expect_connect().await;

    let handle = session
        .publish("t", "1", QoSLevel::AtLeastOnce, false)
        .await
        .unwrap();
    link.expect_publish().await;
    link.sever();

    let mut link = broker.accept().await;
    link.expect_connect().await;
    assert_eq!(handle.await, Err(DeliveryError::Expired));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(link.try_next().is_none());
}
