//! Running the lock in a separate process
//!
//! The bridge process owns the radio and a [`LockController`]; it reads
//! request frames on one byte stream and answers on another. The client end
//! matches answers to callers by correlation id and starts a fresh bridge
//! whenever the old one has gone away.
//!
//! [`LockController`]: crate::controller::LockController

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use augustctl_proto::bridge::async_io::{read_frame, write_frame};
use augustctl_proto::bridge::{BridgeRequest, BridgeResponse, MSG_REQUEST, MSG_RESPONSE};
use augustctl_proto::{Command, Outcome, ProtocolError};

use crate::controller::LockHandle;

type Reply = oneshot::Sender<Result<Outcome, ProtocolError>>;

pub type BridgeReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BridgeWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("correlation id {0} is already pending")]
    DuplicateCorrelation(u64),
    #[error("response for unknown correlation id {0}")]
    UnknownCorrelation(u64),
    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bridge went away before answering")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<BridgeError> for ProtocolError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Protocol(e) => e,
            other => ProtocolError::transport(other),
        }
    }
}

/// Anything commands can be handed to: the controller in this process, or a
/// bridge client talking to one in another.
#[async_trait::async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, command: Command) -> Result<Outcome, ProtocolError>;
}

#[async_trait::async_trait]
impl Submitter for LockHandle {
    async fn submit(&self, command: Command) -> Result<Outcome, ProtocolError> {
        LockHandle::submit(self, command).await
    }
}

/// Answers request frames from `reader` on `writer` until `reader` ends.
///
/// Requests are handed to `submitter` one at a time, in arrival order.
pub async fn serve<R, W>(submitter: &dyn Submitter, mut reader: R, mut writer: W) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("bridge input closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let request: BridgeRequest = match frame.decode(MSG_REQUEST) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed bridge frame");
                continue;
            }
        };
        debug!(id = request.correlation_id, command = %request.command, "bridge request");

        let result = match request.command() {
            Ok(command) => submitter.submit(command).await,
            Err(e) => Err(e),
        };
        let response = BridgeResponse {
            correlation_id: request.correlation_id,
            result,
        };
        write_frame(&mut writer, &response.to_frame()?).await?;
    }
}

/// Callers waiting for a bridge answer, by correlation id
#[derive(Default)]
pub struct PendingReplies {
    waiting: Mutex<HashMap<u64, Reply>>,
}

impl PendingReplies {
    fn waiting(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Reply>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(
        &self,
        id: u64,
    ) -> Result<oneshot::Receiver<Result<Outcome, ProtocolError>>, BridgeError> {
        let mut waiting = self.waiting();
        if waiting.contains_key(&id) {
            return Err(BridgeError::DuplicateCorrelation(id));
        }
        let (tx, rx) = oneshot::channel();
        waiting.insert(id, tx);
        Ok(rx)
    }

    pub fn complete(&self, response: BridgeResponse) -> Result<(), BridgeError> {
        let tx = self
            .waiting()
            .remove(&response.correlation_id)
            .ok_or(BridgeError::UnknownCorrelation(response.correlation_id))?;
        let _ = tx.send(response.result);
        Ok(())
    }

    pub fn forget(&self, id: u64) {
        self.waiting().remove(&id);
    }

    /// Drops every waiter; their callers see [`BridgeError::Closed`].
    pub fn fail_all(&self) {
        let dropped = std::mem::take(&mut *self.waiting());
        if !dropped.is_empty() {
            warn!(count = dropped.len(), "bridge closed with requests in flight");
        }
    }

    pub fn len(&self) -> usize {
        self.waiting().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Starts a bridge and returns its output and input streams.
#[async_trait::async_trait]
pub trait BridgeSpawner: Send + Sync {
    async fn spawn(&self) -> Result<(BridgeReader, BridgeWriter), BridgeError>;
}

#[async_trait::async_trait]
impl<T: BridgeSpawner + ?Sized> BridgeSpawner for Arc<T> {
    async fn spawn(&self) -> Result<(BridgeReader, BridgeWriter), BridgeError> {
        (**self).spawn().await
    }
}

/// Runs a program (normally this binary with `bridge`) and talks to it over
/// its stdout and stdin.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn current_exe(args: Vec<String>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

#[async_trait::async_trait]
impl BridgeSpawner for ProcessSpawner {
    async fn spawn(&self) -> Result<(BridgeReader, BridgeWriter), BridgeError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take().ok_or(BridgeError::Closed)?;
        let stdout = child.stdout.take().ok_or(BridgeError::Closed)?;
        info!(pid = ?child.id(), "bridge process started");

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => warn!(%status, "bridge process exited"),
                Err(e) => error!(error = %e, "failed waiting for bridge process"),
            }
        });
        Ok((Box::new(stdout), Box::new(stdin)))
    }
}

struct BridgeChannel {
    writer: BridgeWriter,
    pending: Arc<PendingReplies>,
    reader: tokio::task::JoinHandle<()>,
}

/// Sends commands to a bridge, restarting it when needed
pub struct BridgeClient {
    spawner: Box<dyn BridgeSpawner>,
    next_id: AtomicU64,
    channel: tokio::sync::Mutex<Option<BridgeChannel>>,
}

impl BridgeClient {
    pub fn new(spawner: impl BridgeSpawner + 'static) -> Self {
        Self {
            spawner: Box::new(spawner),
            next_id: AtomicU64::new(1),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn call(&self, command: Command) -> Result<Outcome, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = BridgeRequest::new(id, command);

        let frame = request.to_frame()?;

        // A bridge that died since the last call may not have been noticed
        // yet; the request never reached it, so one fresh bridge gets it.
        let mut attempts = 0;
        let reply = loop {
            attempts += 1;
            let mut channel = self.channel.lock().await;
            if channel.as_ref().is_none_or(|c| c.reader.is_finished()) {
                *channel = Some(self.open().await?);
            }
            let Some(open) = channel.as_mut() else {
                return Err(BridgeError::Closed);
            };

            let reply = open.pending.register(id)?;
            match write_frame(&mut open.writer, &frame).await {
                Ok(()) => break reply,
                Err(e) => {
                    open.pending.forget(id);
                    *channel = None;
                    if attempts >= 2 {
                        return Err(e.into());
                    }
                    warn!(error = %e, "bridge write failed, restarting bridge");
                }
            }
        };
        debug!(id, %command, "sent to bridge");

        Ok(reply.await.map_err(|_| BridgeError::Closed)??)
    }

    async fn open(&self) -> Result<BridgeChannel, BridgeError> {
        let (reader, writer) = self.spawner.spawn().await?;
        let pending = Arc::new(PendingReplies::default());
        let reader = tokio::spawn(read_responses(reader, pending.clone()));
        Ok(BridgeChannel {
            writer,
            pending,
            reader,
        })
    }
}

#[async_trait::async_trait]
impl Submitter for BridgeClient {
    async fn submit(&self, command: Command) -> Result<Outcome, ProtocolError> {
        Ok(self.call(command).await?)
    }
}

async fn read_responses(mut reader: BridgeReader, pending: Arc<PendingReplies>) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!(error = %e, "bridge read failed");
                }
                break;
            }
        };
        let response: BridgeResponse = match frame.decode(MSG_RESPONSE) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "dropping malformed bridge frame");
                continue;
            }
        };
        if let Err(e) = pending.complete(response) {
            error!(error = %e, "unmatched bridge response");
        }
    }
    pending.fail_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use augustctl_proto::LockStatus;

    fn response(id: u64) -> BridgeResponse {
        BridgeResponse {
            correlation_id: id,
            result: Ok(Outcome::Status(LockStatus::Locked)),
        }
    }

    #[tokio::test]
    async fn pending_replies_match_by_id() {
        let pending = PendingReplies::default();
        let a = pending.register(1).unwrap();
        let b = pending.register(2).unwrap();

        pending.complete(response(2)).unwrap();
        pending.complete(response(1)).unwrap();
        assert_eq!(a.await.unwrap(), Ok(Outcome::Status(LockStatus::Locked)));
        assert_eq!(b.await.unwrap(), Ok(Outcome::Status(LockStatus::Locked)));
        assert!(pending.is_empty());
    }

    #[test]
    fn duplicate_and_unknown_ids_are_rejected() {
        let pending = PendingReplies::default();
        let _rx = pending.register(5).unwrap();
        assert!(matches!(
            pending.register(5),
            Err(BridgeError::DuplicateCorrelation(5))
        ));
        assert!(matches!(
            pending.complete(response(6)),
            Err(BridgeError::UnknownCorrelation(6))
        ));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn fail_all_closes_waiters() {
        let pending = PendingReplies::default();
        let rx = pending.register(1).unwrap();
        pending.fail_all();
        assert!(rx.await.is_err());
    }

    #[test]
    fn protocol_errors_pass_through_the_bridge_error() {
        let e: ProtocolError = BridgeError::Protocol(ProtocolError::Busy).into();
        assert_eq!(e, ProtocolError::Busy);
        let e: ProtocolError = BridgeError::Closed.into();
        assert!(matches!(e, ProtocolError::Transport { .. }));
    }
}
