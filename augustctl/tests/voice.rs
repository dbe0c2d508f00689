//! Control state and voice requests against a simulated lock

use std::sync::Arc;
use std::time::Duration;

use augustctl::alexa::{self, SkillRequest};
use augustctl::config::Config;
use augustctl::control::ControlState;
use augustctl_lock::{Command, LockHandle, LockStatus, Outcome};

fn state() -> (augustctl_harness::SimulatedLock, LockHandle, Arc<ControlState>) {
    let (sim, handle) = augustctl_harness::controller();
    let state = Arc::new(ControlState::new(Arc::new(handle.clone()), &Config::default()));
    (sim, handle, state)
}

fn intent(name: &str, slots: serde_json::Value) -> SkillRequest {
    serde_json::from_value(serde_json::json!({
        "request": {"type": "IntentRequest", "intent": {"name": name, "slots": slots}}
    }))
    .unwrap()
}

fn kind(kind: &str) -> SkillRequest {
    serde_json::from_value(serde_json::json!({"request": {"type": kind}})).unwrap()
}

async fn wait_for(handle: &LockHandle, want: LockStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if handle.submit(Command::GetLockStatus).await == Ok(Outcome::Status(want)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn status_question_reads_the_lock() {
    let (_sim, _handle, state) = state();
    let reply = alexa::respond(&state, &intent("GetStatus", serde_json::json!({}))).await;
    assert_eq!(reply.text(), Some("The door is locked."));
    assert!(reply.response.should_end_session);
    assert_eq!(state.cache().lock, LockStatus::Locked);
}

#[tokio::test]
async fn unlock_for_minutes_schedules_the_relock() {
    let (sim, handle, state) = state();
    let reply = alexa::respond(
        &state,
        &intent("UnlockDoorFor", serde_json::json!({"Duration": {"value": "5"}})),
    )
    .await;
    assert_eq!(
        reply.text(),
        Some("Ok. I will lock the door in 5 minutes")
    );
    assert!(state.cache().remaining(std::time::Instant::now()) > 290);
    assert_eq!(state.cache().lock, LockStatus::Unlocked);

    wait_for(&handle, LockStatus::Unlocked).await;
    assert_eq!(sim.everlock(), 0);

    // the timer fires once the five minutes have passed
    assert!(state.tick(std::time::Instant::now() + Duration::from_secs(301)));
    wait_for(&handle, LockStatus::Locked).await;
    assert_eq!(sim.everlock(), 60);
}

#[tokio::test]
async fn lock_and_unlock_intents() {
    let (_sim, handle, state) = state();
    let reply = alexa::respond(&state, &intent("UnlockDoor", serde_json::json!({}))).await;
    assert_eq!(reply.text(), Some("Ok."));
    wait_for(&handle, LockStatus::Unlocked).await;

    alexa::respond(&state, &intent("LockDoor", serde_json::json!({}))).await;
    wait_for(&handle, LockStatus::Locked).await;
}

#[tokio::test]
async fn launch_and_unknown_intents_keep_the_session_open() {
    let (_sim, _handle, state) = state();

    let launch = alexa::respond(&state, &kind("LaunchRequest")).await;
    assert_eq!(
        launch.text(),
        Some("What would you like to ask to your August lock?")
    );
    assert!(!launch.response.should_end_session);

    let other = alexa::respond(&state, &intent("OrderPizza", serde_json::json!({}))).await;
    assert_eq!(other.text(), Some("What would you like to do?"));
    assert!(!other.response.should_end_session);

    let ended = alexa::respond(&state, &kind("SessionEndedRequest")).await;
    assert_eq!(ended, alexa::SkillResponse::silent());
    assert_eq!(ended.text(), None);

    let missing = alexa::respond(&state, &intent("UnlockDoorFor", serde_json::json!({}))).await;
    assert_eq!(missing, alexa::SkillResponse::prompt());
}

#[tokio::test]
async fn garbage_body_gets_the_bare_envelope() {
    use http_body_util::BodyExt;

    let (_sim, _handle, state) = state();
    let r = state.route("/august/alexa", None, b"{oops").await.unwrap();
    assert_eq!(r.status(), hyper::StatusCode::OK);
    let body = r.into_body().collect().await.unwrap().to_bytes();
    let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply["response"], serde_json::json!({"shouldEndSession": true}));
}

#[tokio::test]
async fn unlock_for_an_absurd_duration_is_refused_without_unlocking() {
    let (sim, _handle, state) = state();
    for minutes in [u64::MAX.to_string(), (u64::MAX / 60).to_string()] {
        let reply = alexa::respond(
            &state,
            &intent("UnlockDoorFor", serde_json::json!({"Duration": {"value": minutes}})),
        )
        .await;
        assert_eq!(reply, alexa::SkillResponse::prompt());
    }
    assert_eq!(state.cache().lock, LockStatus::Unknown);
    assert_eq!(state.cache().relock_at, None);

    // a status read goes through the same queue, so no unlock can be behind it
    state.refresh().await.unwrap();
    assert!(sim.session_opcodes().iter().all(|op| *op != 0x0a));
}
