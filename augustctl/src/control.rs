//! Control endpoints, the cached lock state and the relock timer

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use augustctl::http::HttpResult;
use augustctl_lock::{Command, LockStatus, Outcome, ProtocolError, StatusRecord, Submitter};

/// What the server believes about the lock between live status reads.
///
/// Control endpoints update it optimistically; `/status` and the startup
/// fetch overwrite it with what the lock reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCache {
    pub lock: LockStatus,
    /// -1 until the lock has been asked
    pub everlocktime: i32,
    pub relock_at: Option<Instant>,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self {
            lock: LockStatus::Unknown,
            everlocktime: -1,
            relock_at: None,
        }
    }
}

impl StatusCache {
    /// Whole seconds until the scheduled relock, rounded up
    pub fn remaining(&self, now: Instant) -> u64 {
        match self.relock_at {
            Some(at) if at > now => {
                let left = at - now;
                left.as_secs() + u64::from(left.subsec_nanos() > 0)
            }
            _ => 0,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct Remaining {
    remaining: u64,
}

#[derive(Debug, serde::Serialize)]
struct Cached {
    remaining: u64,
    lock: LockStatus,
    everlocktime: i32,
}

#[derive(Debug, serde::Serialize)]
struct SystemReply {
    system: &'static str,
}

/// A command on its way to the lock, with the caller waiting for it or not
struct Queued {
    command: Command,
    reply: Option<oneshot::Sender<Result<Outcome, ProtocolError>>>,
}

/// `neverlock` was asked to relock further out than the clock can express
#[derive(Debug, thiserror::Error)]
#[error("relock time is out of range")]
pub struct RelockOutOfRange;

pub struct ControlState {
    queue: mpsc::UnboundedSender<Queued>,
    cache: Mutex<StatusCache>,
    base_url: String,
    alexa_url: String,
    autolock_time: u16,
}

impl ControlState {
    /// Must be called inside a tokio runtime: it starts the task that hands
    /// commands to `submitter` one at a time, in the order they were queued.
    pub fn new(submitter: Arc<dyn Submitter>, config: &augustctl::config::Config) -> Self {
        let (queue, commands) = mpsc::unbounded_channel();
        tokio::spawn(forward(submitter, commands));
        Self {
            queue,
            cache: Mutex::new(StatusCache::default()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            alexa_url: config.alexa_url.clone(),
            autolock_time: config.autolock_time,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn alexa_url(&self) -> &str {
        &self.alexa_url
    }

    pub fn cache(&self) -> MutexGuard<'_, StatusCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `command` without waiting for it; failures are only logged.
    pub fn fire(&self, command: Command) {
        if self.queue.send(Queued { command, reply: None }).is_err() {
            warn!(%command, "command queue closed");
        }
    }

    async fn submit(&self, command: Command) -> Result<Outcome, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Queued {
                command,
                reply: Some(tx),
            })
            .map_err(|_| ProtocolError::ControllerClosed)?;
        rx.await.map_err(|_| ProtocolError::ControllerClosed)?
    }

    /// Asks the lock for its status and records it in the cache.
    pub async fn refresh(&self) -> Result<StatusRecord, ProtocolError> {
        match self.submit(Command::GetAllStatus).await? {
            Outcome::AllStatus(record) => {
                let mut cache = self.cache();
                cache.lock = record.lock;
                cache.everlocktime = i32::from(record.everlocktime);
                Ok(record)
            }
            other => Err(ProtocolError::transport(format!(
                "unexpected outcome {other:?} for getAllStatus"
            ))),
        }
    }

    /// Unlocks now and relocks after `after`, or never when `None`.
    ///
    /// Nothing is sent when the relock time cannot be represented.
    pub fn neverlock(&self, after: Option<Duration>) -> Result<(), RelockOutOfRange> {
        let relock_at = match after {
            Some(d) => Some(Instant::now().checked_add(d).ok_or(RelockOutOfRange)?),
            None => None,
        };
        self.fire(Command::EverlockOffUnlock);
        let mut cache = self.cache();
        cache.relock_at = relock_at;
        cache.lock = LockStatus::Unlocked;
        cache.everlocktime = 0;
        Ok(())
    }

    pub fn everlock(&self) {
        self.fire(Command::EverlockOnLock(Some(self.autolock_time)));
        let mut cache = self.cache();
        cache.relock_at = None;
        cache.lock = LockStatus::Locked;
        cache.everlocktime = i32::from(self.autolock_time);
    }

    /// One relock timer tick. Returns true when the relock fired.
    pub fn tick(&self, now: Instant) -> bool {
        let due = matches!(self.cache().relock_at, Some(at) if at <= now);
        if due {
            info!("relock time reached");
            self.everlock();
        }
        due
    }

    pub async fn route(self: &Arc<Self>, path: &str, query: Option<&str>, body: &[u8]) -> HttpResult {
        if path == self.alexa_url {
            return augustctl::alexa::handle(self, body).await;
        }

        let Some(endpoint) = path.strip_prefix(self.base_url.as_str()) else {
            return augustctl::not_found!("not found");
        };

        match endpoint {
            "/relocktime" => augustctl::http::json(Remaining {
                remaining: self.cache().remaining(Instant::now()),
            }),
            "/cached" => {
                let cache = self.cache().clone();
                augustctl::http::json(Cached {
                    remaining: cache.remaining(Instant::now()),
                    lock: cache.lock,
                    everlocktime: cache.everlocktime,
                })
            }
            "/unlock" => {
                self.fire(Command::Unlock);
                let mut cache = self.cache();
                if cache.everlocktime <= 0 {
                    cache.lock = LockStatus::Unlocked;
                }
                augustctl::http::json(SystemReply { system: "unlocking" })
            }
            "/lock" => {
                self.fire(Command::Lock);
                let mut cache = self.cache();
                if cache.everlocktime <= 0 {
                    cache.lock = LockStatus::Locked;
                }
                augustctl::http::json(SystemReply { system: "locking" })
            }
            "/neverlock" => {
                let relock = match query.and_then(|q| query_param(q, "relock")) {
                    None => None,
                    Some(v) => match v.parse::<u64>() {
                        Ok(secs) => Some(Duration::from_secs(secs)),
                        Err(_) => return augustctl::bad_request!("invalid relock: {v}"),
                    },
                };
                if let Err(e) = self.neverlock(relock) {
                    return augustctl::bad_request!("{e}");
                }
                augustctl::http::json(SystemReply {
                    system: "neverlocking",
                })
            }
            "/everlock" => {
                self.everlock();
                augustctl::http::json(SystemReply {
                    system: "everlocking",
                })
            }
            "/status" => match self.refresh().await {
                Ok(record) => augustctl::http::json(record),
                Err(e) => augustctl::server_error!("{e}"),
            },
            _ => augustctl::not_found!("not found"),
        }
    }
}

/// Submits queued commands strictly in queue order until the state is dropped.
async fn forward(submitter: Arc<dyn Submitter>, mut commands: mpsc::UnboundedReceiver<Queued>) {
    while let Some(Queued { command, reply }) = commands.recv().await {
        let result = submitter.submit(command).await;
        match reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => match result {
                Ok(outcome) => debug!(%command, ?outcome, "command done"),
                Err(e) => warn!(%command, error = %e, "command failed"),
            },
        }
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

/// Checks every second whether a scheduled relock is due.
pub fn spawn_relock_timer(state: Arc<ControlState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            state.tick(Instant::now());
        }
    })
}

/// Fills the cache from the lock once, in the background.
pub fn prime_cache(state: Arc<ControlState>) {
    tokio::spawn(async move {
        match state.refresh().await {
            Ok(record) => info!(lock = %record.lock, everlocktime = record.everlocktime, "initial status"),
            Err(e) => warn!(error = %e, "initial status fetch failed"),
        }
    });
}
