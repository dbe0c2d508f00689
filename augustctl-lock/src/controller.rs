//! Connection and command queue for one lock
//!
//! A single task owns the link, the session and the queue. Callers talk to it
//! through a [`LockHandle`]; connect attempts and driver operations run in
//! spawned tasks that report back as events, so the task itself never blocks.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use augustctl_proto::{Command, Outcome, ProtocolError};

use crate::driver::{Lock, LockConfig, LockConnection};
use crate::link::BleLink;

type Reply = oneshot::Sender<Result<Outcome, ProtocolError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No peripheral known yet
    Scanning,
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Running,
}

/// Point in time view of the controller, for status pages and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub transport: TransportState,
    pub execution: ExecutionState,
    pub queued: usize,
    pub connect_attempts: u64,
}

enum Event {
    Submit {
        command: Command,
        reply: Reply,
    },
    Discovered(Arc<dyn BleLink>),
    /// `None` comes from outside (adapter events), `Some` from the
    /// notification pump of that connect attempt
    LinkLost {
        generation: Option<u64>,
    },
    Connected {
        generation: u64,
        result: Result<LockConnection, ProtocolError>,
    },
    Finished {
        result: Result<Outcome, ProtocolError>,
    },
    Snapshot(oneshot::Sender<ControllerSnapshot>),
}

struct Entry {
    command: Command,
    reply: Reply,
}

/// Cloneable front of a running [`LockController`]
#[derive(Clone)]
pub struct LockHandle {
    events: mpsc::UnboundedSender<Event>,
    transitions: broadcast::Sender<TransportState>,
}

impl LockHandle {
    /// Queues a command and waits for its outcome. Commands run in
    /// submission order, one at a time.
    pub async fn submit(&self, command: Command) -> Result<Outcome, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Submit { command, reply })
            .map_err(|_| ProtocolError::ControllerClosed)?;
        rx.await.map_err(|_| ProtocolError::ControllerClosed)?
    }

    /// Hands the controller a peripheral to connect to.
    pub fn discovered(&self, link: Arc<dyn BleLink>) {
        let _ = self.events.send(Event::Discovered(link));
    }

    /// Reports that the radio stack saw the peripheral disconnect.
    pub fn link_lost(&self) {
        let _ = self.events.send(Event::LinkLost { generation: None });
    }

    /// Every transport state change from now on
    pub fn transitions(&self) -> broadcast::Receiver<TransportState> {
        self.transitions.subscribe()
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Snapshot(tx))
            .map_err(|_| ProtocolError::ControllerClosed)?;
        rx.await.map_err(|_| ProtocolError::ControllerClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

pub struct LockController {
    config: LockConfig,
    link: Option<Arc<dyn BleLink>>,
    transport: TransportState,
    execution: ExecutionState,
    queue: VecDeque<Entry>,
    running: Option<Entry>,
    connection: Option<Arc<LockConnection>>,
    generation: u64,
    lost_while_connecting: bool,
    transitions: broadcast::Sender<TransportState>,
    events: mpsc::WeakUnboundedSender<Event>,
}

impl LockController {
    /// Starts a controller with no peripheral; commands queue until
    /// [`LockHandle::discovered`] supplies one.
    pub fn spawn(config: LockConfig) -> LockHandle {
        Self::start(config, None)
    }

    pub fn spawn_with_link(config: LockConfig, link: Arc<dyn BleLink>) -> LockHandle {
        Self::start(config, Some(link))
    }

    fn start(config: LockConfig, link: Option<Arc<dyn BleLink>>) -> LockHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (transitions, _) = broadcast::channel(64);
        let transport = if link.is_some() {
            TransportState::Disconnected
        } else {
            TransportState::Scanning
        };

        let controller = LockController {
            config,
            link,
            transport,
            execution: ExecutionState::Idle,
            queue: VecDeque::new(),
            running: None,
            connection: None,
            generation: 0,
            lost_while_connecting: false,
            transitions: transitions.clone(),
            events: tx.downgrade(),
        };
        tokio::spawn(controller.run(rx));

        LockHandle {
            events: tx,
            transitions,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
            self.evaluate();
        }
        debug!("all lock handles dropped, controller stopping");
        if let Some(connection) = self.connection.take() {
            connection.abandon().await;
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Submit { command, reply } => {
                debug!(%command, queued = self.queue.len(), "command submitted");
                self.queue.push_back(Entry { command, reply });
            }
            Event::Discovered(link) => {
                info!(lock = %link.id(), "lock discovered");
                if self.transport == TransportState::Scanning {
                    self.link = Some(link);
                    self.set_transport(TransportState::Disconnected);
                }
            }
            Event::LinkLost { generation } => self.on_link_lost(generation),
            Event::Connected { generation, result } => self.on_connected(generation, result),
            Event::Finished { result } => self.on_finished(result),
            Event::Snapshot(tx) => {
                let _ = tx.send(ControllerSnapshot {
                    transport: self.transport,
                    execution: self.execution,
                    queued: self.queue.len(),
                    connect_attempts: self.generation,
                });
            }
        }
    }

    fn evaluate(&mut self) {
        if self.queue.is_empty() || self.execution == ExecutionState::Running {
            return;
        }
        match self.transport {
            TransportState::Scanning
            | TransportState::Connecting
            | TransportState::Disconnecting => {}
            TransportState::Disconnected => self.start_connect(),
            TransportState::Connected => self.start_next(),
        }
    }

    fn set_transport(&mut self, state: TransportState) {
        if self.transport != state {
            info!(from = ?self.transport, to = ?state, "transport");
            self.transport = state;
            let _ = self.transitions.send(state);
        }
    }

    fn start_connect(&mut self) {
        let Some(link) = self.link.clone() else {
            self.set_transport(TransportState::Scanning);
            return;
        };
        self.generation += 1;
        self.lost_while_connecting = false;
        self.set_transport(TransportState::Connecting);

        let generation = self.generation;
        let lock = Lock::new(link.clone(), self.config.clone());
        let events = self.events.clone();
        let lost = self.events.clone();
        tokio::spawn(async move {
            let result = lock
                .connect(move || {
                    if let Some(tx) = lost.upgrade() {
                        let _ = tx.send(Event::LinkLost {
                            generation: Some(generation),
                        });
                    }
                })
                .await;
            if let Err(e) = &result {
                warn!(error = %e, "connect failed");
                if let Err(e) = link.disconnect().await {
                    debug!(error = %e, "disconnect after failed connect");
                }
            }
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(Event::Connected { generation, result });
            }
        });
    }

    fn start_next(&mut self) {
        let Some(connection) = self.connection.clone() else {
            self.set_transport(TransportState::Disconnected);
            self.start_connect();
            return;
        };
        let Some(entry) = self.queue.pop_front() else {
            return;
        };
        if entry.command == Command::Disconnect {
            self.set_transport(TransportState::Disconnecting);
        }
        self.execution = ExecutionState::Running;
        let command = entry.command;
        self.running = Some(entry);
        debug!(%command, "executing");

        let events = self.events.clone();
        tokio::spawn(async move {
            let result = connection.run(command).await;
            // the link goes down before the controller hears about it, so
            // the next connect cannot race this disconnect
            if let Err(e) = &result {
                if e.drops_link() || command == Command::Disconnect {
                    connection.abandon().await;
                }
            }
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(Event::Finished { result });
            }
        });
    }

    fn on_connected(&mut self, generation: u64, result: Result<LockConnection, ProtocolError>) {
        if generation != self.generation || self.transport != TransportState::Connecting {
            debug!(generation, "stale connect result");
            return;
        }
        match result {
            Ok(_) if self.lost_while_connecting => {
                warn!("link lost during handshake");
                self.set_transport(TransportState::Disconnected);
            }
            Ok(connection) => {
                self.connection = Some(Arc::new(connection));
                self.set_transport(TransportState::Connected);
            }
            Err(e) => {
                if let Some(entry) = self.queue.pop_front() {
                    let _ = entry.reply.send(Err(e));
                }
                self.set_transport(TransportState::Disconnected);
            }
        }
    }

    fn on_finished(&mut self, result: Result<Outcome, ProtocolError>) {
        self.execution = ExecutionState::Idle;
        let Some(entry) = self.running.take() else {
            return;
        };

        let disconnect = entry.command == Command::Disconnect;
        let failed_link = matches!(&result, Err(e) if e.drops_link());
        if let Err(e) = &result {
            warn!(command = %entry.command, error = %e, "command failed");
        }

        if disconnect || failed_link {
            self.connection = None;
            if matches!(
                self.transport,
                TransportState::Connected | TransportState::Disconnecting
            ) {
                self.set_transport(TransportState::Disconnected);
            }
        }

        let _ = entry.reply.send(result);
    }

    fn on_link_lost(&mut self, generation: Option<u64>) {
        if generation.is_some_and(|g| g != self.generation) {
            debug!(?generation, "link lost for an older connection");
            return;
        }
        match self.transport {
            TransportState::Connecting => self.lost_while_connecting = true,
            TransportState::Connected | TransportState::Disconnecting => {
                warn!("link lost");
                if let Some(connection) = self.connection.take() {
                    connection.close_channels();
                }
                self.set_transport(TransportState::Disconnected);
            }
            TransportState::Scanning | TransportState::Disconnected => {}
        }
    }
}
