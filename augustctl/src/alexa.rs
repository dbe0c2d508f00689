//! Voice assistant skill endpoint
//!
//! Requests arrive as the skill service's JSON envelope. Replies are plain
//! text speech; a session end, or anything that cannot be understood, gets
//! the bare envelope without speech rather than an error status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use augustctl::control::ControlState;
use augustctl::http::HttpResult;
use augustctl_lock::{Command, LockStatus};

const WELCOME: &str = "What would you like to ask to your August lock?";
const PROMPT: &str = "What would you like to do?";
const OK: &str = "Ok.";

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct SkillRequest {
    pub request: RequestBody,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct RequestBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub intent: Option<Intent>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct Intent {
    pub name: String,
    pub slots: HashMap<String, Slot>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct Slot {
    pub value: Option<String>,
}

impl Intent {
    fn slot(&self, name: &str) -> Option<&str> {
        self.slots.get(name)?.value.as_deref()
    }
}

#[derive(Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillResponse {
    pub version: &'static str,
    pub session_attributes: serde_json::Map<String, serde_json::Value>,
    pub response: ResponseBody,
}

#[derive(Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub should_end_session: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_speech: Option<OutputSpeech>,
}

#[derive(Debug, PartialEq, serde::Serialize)]
pub struct OutputSpeech {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

impl SkillResponse {
    pub fn say(text: impl Into<String>, end_session: bool) -> Self {
        Self {
            version: "1.0",
            session_attributes: serde_json::Map::new(),
            response: ResponseBody {
                should_end_session: end_session,
                output_speech: Some(OutputSpeech {
                    kind: "PlainText",
                    text: text.into(),
                }),
            },
        }
    }

    /// Ends the session without saying anything
    pub fn silent() -> Self {
        Self {
            version: "1.0",
            session_attributes: serde_json::Map::new(),
            response: ResponseBody {
                should_end_session: true,
                output_speech: None,
            },
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.response.output_speech.as_ref().map(|s| s.text.as_str())
    }

    pub fn prompt() -> Self {
        Self::say(PROMPT, false)
    }
}

pub async fn handle(state: &Arc<ControlState>, body: &[u8]) -> HttpResult {
    let request: SkillRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            warn!("unreadable skill request: {e}");
            return augustctl::http::json(SkillResponse::silent());
        }
    };
    augustctl::http::json(respond(state, &request).await)
}

pub async fn respond(state: &ControlState, request: &SkillRequest) -> SkillResponse {
    debug!(kind = %request.request.kind, "skill request");
    match request.request.kind.as_str() {
        "LaunchRequest" => SkillResponse::say(WELCOME, false),
        "IntentRequest" => match &request.request.intent {
            Some(intent) => on_intent(state, intent).await,
            None => SkillResponse::prompt(),
        },
        _ => SkillResponse::silent(),
    }
}

async fn on_intent(state: &ControlState, intent: &Intent) -> SkillResponse {
    match intent.name.as_str() {
        "LockDoor" => {
            state.fire(Command::Lock);
            SkillResponse::say(OK, true)
        }
        "UnlockDoor" => {
            state.fire(Command::Unlock);
            SkillResponse::say(OK, true)
        }
        "UnlockDoorFor" => {
            let Some(minutes) = intent.slot("Duration").and_then(|v| v.parse::<u64>().ok()) else {
                return SkillResponse::prompt();
            };
            let Some(secs) = minutes.checked_mul(60) else {
                return SkillResponse::prompt();
            };
            if let Err(e) = state.neverlock(Some(Duration::from_secs(secs))) {
                warn!(minutes, "{e}");
                return SkillResponse::prompt();
            }
            SkillResponse::say(format!("Ok. I will lock the door in {minutes} minutes"), true)
        }
        "GetStatus" => match state.refresh().await {
            Ok(record) if record.lock == LockStatus::Locked => {
                SkillResponse::say("The door is locked.", true)
            }
            Ok(record) if record.lock == LockStatus::Unlocked => {
                SkillResponse::say("The door is unlocked.", true)
            }
            Ok(_) => SkillResponse::say("I could not tell if the door is locked.", true),
            Err(e) => {
                warn!(error = %e, "status for voice request failed");
                SkillResponse::say("I could not reach the lock.", true)
            }
        },
        _ => SkillResponse::prompt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_envelope() {
        assert_eq!(
            serde_json::to_value(SkillResponse::say(OK, true)).unwrap(),
            serde_json::json!({
                "version": "1.0",
                "sessionAttributes": {},
                "response": {
                    "shouldEndSession": true,
                    "outputSpeech": {"type": "PlainText", "text": "Ok."}
                }
            })
        );
    }

    #[test]
    fn silent_envelope_has_no_speech() {
        assert_eq!(
            serde_json::to_value(SkillResponse::silent()).unwrap(),
            serde_json::json!({
                "version": "1.0",
                "sessionAttributes": {},
                "response": {"shouldEndSession": true}
            })
        );
    }

    #[test]
    fn request_parsing() {
        let request: SkillRequest = serde_json::from_str(
            r#"{
                "version": "1.0",
                "session": {"new": true},
                "request": {
                    "type": "IntentRequest",
                    "requestId": "r-1",
                    "intent": {
                        "name": "UnlockDoorFor",
                        "slots": {"Duration": {"name": "Duration", "value": "5"}}
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(request.request.kind, "IntentRequest");
        let intent = request.request.intent.unwrap();
        assert_eq!(intent.name, "UnlockDoorFor");
        assert_eq!(intent.slot("Duration"), Some("5"));
        assert_eq!(intent.slot("Other"), None);
    }

    #[test]
    fn slot_without_value() {
        let intent: Intent =
            serde_json::from_str(r#"{"name": "UnlockDoorFor", "slots": {"Duration": {"name": "Duration"}}}"#)
                .unwrap();
        assert_eq!(intent.slot("Duration"), None);
    }
}
