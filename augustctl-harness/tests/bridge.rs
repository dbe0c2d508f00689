//! Bridge client and server over an in-memory pipe

use std::sync::Arc;
use std::time::Duration;

use augustctl_harness::{InProcessBridge, SimEvent, controller};
use augustctl_lock::bridge::{self, BridgeClient, BridgeError, Submitter};
use augustctl_lock::{Command, LockStatus, Outcome, ProtocolError, StatusRecord};
use augustctl_proto::bridge::async_io::{read_frame, write_frame};
use augustctl_proto::bridge::{BridgeRequest, BridgeResponse, MSG_RESPONSE};
use augustctl_proto::ble::session;

#[tokio::test]
async fn commands_cross_the_bridge() {
    let (_sim, handle) = controller();
    let spawner = Arc::new(InProcessBridge::new(handle));
    let client = BridgeClient::new(spawner.clone());

    assert_eq!(
        client.call(Command::GetAllStatus).await.unwrap(),
        Outcome::AllStatus(StatusRecord {
            lock: LockStatus::Locked,
            everlocktime: 0
        })
    );
    assert_eq!(client.call(Command::ForceUnlock).await.unwrap(), Outcome::Done);

    let submitter: &dyn Submitter = &client;
    assert_eq!(
        submitter.submit(Command::GetLockStatus).await,
        Ok(Outcome::Status(LockStatus::Unlocked))
    );
    assert_eq!(spawner.spawned(), 1);
}

#[tokio::test]
async fn concurrent_calls_get_their_own_answers() {
    let (_sim, handle) = controller();
    let client = Arc::new(BridgeClient::new(InProcessBridge::new(handle)));

    let calls = [
        Command::GetLockStatus,
        Command::GetEverlockTime,
        Command::GetAllStatus,
    ]
    .map(|command| {
        let client = client.clone();
        tokio::spawn(async move { client.call(command).await })
    });

    let [status, everlock, all] = calls;
    assert!(matches!(status.await.unwrap(), Ok(Outcome::Status(_))));
    assert!(matches!(everlock.await.unwrap(), Ok(Outcome::EverlockTime(0))));
    assert!(matches!(all.await.unwrap(), Ok(Outcome::AllStatus(_))));
}

#[tokio::test]
async fn dead_bridge_is_restarted() {
    let (_sim, handle) = controller();
    let spawner = Arc::new(InProcessBridge::new(handle));
    let client = BridgeClient::new(spawner.clone());

    client.call(Command::GetLockStatus).await.unwrap();
    spawner.kill();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        client.call(Command::GetLockStatus).await.unwrap(),
        Outcome::Status(LockStatus::Locked)
    );
    assert_eq!(spawner.spawned(), 2);
}

#[tokio::test]
async fn in_flight_call_fails_when_the_bridge_dies() {
    let (sim, handle) = controller();
    sim.set_latency(session::OP_LOCK_STATUS, Duration::from_millis(300));
    let spawner = Arc::new(InProcessBridge::new(handle));
    let client = Arc::new(BridgeClient::new(spawner.clone()));

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call(Command::GetLockStatus).await })
    };
    while !sim.events().iter().any(|e| matches!(e, SimEvent::Session(_))) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    spawner.kill();

    assert!(matches!(call.await.unwrap(), Err(BridgeError::Closed)));
}

#[tokio::test]
async fn unknown_command_is_answered_with_an_error() {
    let (_sim, handle) = controller();
    let (client, server) = tokio::io::duplex(4096);
    let (server_read, server_write) = tokio::io::split(server);
    let server = tokio::spawn(async move { bridge::serve(&handle, server_read, server_write).await });

    let (mut read, mut write) = tokio::io::split(client);
    let request = BridgeRequest {
        correlation_id: 42,
        command: "openSesame".to_string(),
        argument: None,
    };
    write_frame(&mut write, &request.to_frame().unwrap()).await.unwrap();

    let response: BridgeResponse = read_frame(&mut read)
        .await
        .unwrap()
        .decode(MSG_RESPONSE)
        .unwrap();
    assert_eq!(response.correlation_id, 42);
    assert_eq!(
        response.result,
        Err(ProtocolError::UnknownCommand {
            name: "openSesame".to_string()
        })
    );

    drop(write);
    drop(read);
    assert!(server.await.unwrap().is_ok());
}
