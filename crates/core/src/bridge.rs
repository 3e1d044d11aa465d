//! The loop bridge drives the shared engine from its own execution context.
//!
//! Sessions never touch the engine directly. They enqueue commands through a
//! [`BridgeHandle`]; a single driver task owns the engine, issues one engine
//! invocation at a time and routes every produced response through the
//! [`SessionRegistry`], which hands it to the owning session's callback.
//!
//! ```text
//!  Session 1 ──┐                    ┌────────────────────┐
//!  Session 2 ──┼─▶ BridgeCommand ──▶│ driver (one call   │──▶ Engine
//!  Session N ──┘    (unbounded)     │  at a time)        │◀── responses
//!                                   └─────────┬──────────┘
//!                                             ▼
//!                                  SessionRegistry::delegate
//! ```

mod worker_pool;

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::message::SessionId;
use crate::registry::SessionRegistry;
use worker_pool::WorkerPool;

/// A message produced by the engine for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResponse {
    pub session: SessionId,
    pub bytes: Vec<u8>,
}

impl EngineResponse {
    pub fn new(session: SessionId, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            session,
            bytes: bytes.into(),
        }
    }
}

/// The shared backend engine.
///
/// Implementations are only ever invoked by one caller at a time.
pub trait Engine: Send + 'static {
    /// Accepts a request from `session`, returning any responses it produced
    /// immediately.
    fn handle_request(&mut self, session: SessionId, request: &[u8]) -> Vec<EngineResponse>;

    /// Runs one processing step, flushing queued work.
    fn poll(&mut self) -> Vec<EngineResponse>;

    /// Whether queued work remains that a later [`Engine::poll`] would flush.
    fn has_pending(&self) -> bool {
        false
    }

    /// Releases resources held on behalf of `session`.
    fn close_session(&mut self, _session: SessionId) {}
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("engine loop is not running")]
    NotRunning,
    #[error("session is closed")]
    Closed,
    #[error("engine worker panicked")]
    WorkerPanicked,
    #[error("failed to start engine loop: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How the driver invokes the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Each invocation runs on the bridge's own loop, which yields between steps.
    Cooperative,
    /// Each invocation is offloaded to a fixed worker pool. Invocations are
    /// still issued one at a time, so at most one worker is ever busy.
    Pool { workers: NonZeroUsize },
}

impl LoopMode {
    /// Pool mode with a single worker.
    pub fn pool() -> Self {
        LoopMode::Pool {
            workers: NonZeroUsize::MIN,
        }
    }
}

impl Default for LoopMode {
    fn default() -> Self {
        Self::pool()
    }
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cooperative" | "single" => Ok(LoopMode::Cooperative),
            "pool" => Ok(LoopMode::pool()),
            other => Err(format!("unknown loop mode `{other}`")),
        }
    }
}

#[derive(Debug)]
enum BridgeCommand {
    Request { session: SessionId, bytes: Vec<u8> },
    Poll,
    Close(SessionId),
    Shutdown,
}

/// Cloneable entry point into a running bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<BridgeCommand>,
    registry: SessionRegistry,
}

impl BridgeHandle {
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Queues a request for `session`. Does not wait for any response.
    pub fn submit(&self, session: SessionId, bytes: Vec<u8>) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Request { session, bytes })
    }

    /// Asks the driver for one engine processing step.
    pub fn schedule_poll(&self) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Poll)
    }

    pub fn close_session(&self, session: SessionId) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Close(session))
    }

    pub fn shutdown(&self) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Shutdown)
    }

    fn send(&self, command: BridgeCommand) -> Result<(), BridgeError> {
        self.commands.send(command).map_err(|err| {
            tracing::error!(command = ?err.0, "engine loop is not running, command discarded");
            BridgeError::NotRunning
        })
    }
}

pub struct LoopBridge<E> {
    engine: Arc<Mutex<E>>,
    registry: SessionRegistry,
    mode: LoopMode,
    commands_tx: mpsc::UnboundedSender<BridgeCommand>,
    commands_rx: mpsc::UnboundedReceiver<BridgeCommand>,
}

impl<E: Engine> LoopBridge<E> {
    pub fn new(engine: E, registry: SessionRegistry) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            registry,
            mode: LoopMode::Cooperative,
            commands_tx,
            commands_rx,
        }
    }

    /// Installs the mechanism used to re-enter the engine for polling.
    pub fn set_loop_callback(&mut self, mode: LoopMode) {
        self.mode = mode;
    }

    pub fn with_mode(mut self, mode: LoopMode) -> Self {
        self.set_loop_callback(mode);
        self
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            commands: self.commands_tx.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Runs the driver on a new OS thread with its own single-threaded runtime.
    pub fn spawn_dedicated(self) -> Result<BridgeThread, BridgeError> {
        let handle = self.handle();
        let thread = std::thread::Builder::new()
            .name("engine-loop".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(error) => {
                        tracing::error!(%error, "failed to build engine loop runtime");
                        return;
                    }
                };
                rt.block_on(self.run());
            })?;
        Ok(BridgeThread {
            handle,
            thread: Some(thread),
        })
    }

    /// Driver loop. Returns on [`BridgeHandle::shutdown`] or once every handle
    /// has been dropped.
    pub async fn run(self) {
        let LoopBridge {
            engine,
            registry,
            mode,
            commands_tx,
            mut commands_rx,
        } = self;
        drop(commands_tx);

        let invoker = match Invoker::new(engine, mode) {
            Ok(invoker) => invoker,
            Err(error) => {
                tracing::error!(%error, "engine loop failed to start");
                return;
            }
        };
        tracing::info!(?mode, "engine loop starting");

        // at most one poll is outstanding; queued commands go first
        let mut poll_scheduled = false;
        loop {
            let command = match commands_rx.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) if poll_scheduled => BridgeCommand::Poll,
                Err(TryRecvError::Empty) => match commands_rx.recv().await {
                    Some(command) => command,
                    None => break,
                },
                Err(TryRecvError::Disconnected) => break,
            };

            match command {
                BridgeCommand::Request { session, bytes } => {
                    let responses = invoker
                        .invoke(move |engine| engine.handle_request(session, &bytes))
                        .await;
                    match responses {
                        Ok(responses) => dispatch(&registry, responses).await,
                        Err(error) => {
                            tracing::error!(%session, %error, "engine failed handling request")
                        }
                    }
                    poll_scheduled = true;
                }
                BridgeCommand::Poll => {
                    poll_scheduled = false;
                    let polled = invoker
                        .invoke(|engine| {
                            let responses = engine.poll();
                            (responses, engine.has_pending())
                        })
                        .await;
                    match polled {
                        Ok((responses, pending)) => {
                            dispatch(&registry, responses).await;
                            poll_scheduled = pending;
                        }
                        Err(error) => tracing::error!(%error, "engine poll failed"),
                    }
                }
                BridgeCommand::Close(session) => {
                    if let Err(error) = invoker
                        .invoke(move |engine| engine.close_session(session))
                        .await
                    {
                        tracing::error!(%session, %error, "engine failed closing session");
                    }
                }
                BridgeCommand::Shutdown => break,
            }

            if matches!(invoker, Invoker::Inline(_)) {
                tokio::task::yield_now().await;
            }
        }

        tracing::info!("engine loop stopped");
    }
}

async fn dispatch(registry: &SessionRegistry, responses: Vec<EngineResponse>) {
    for EngineResponse { session, bytes } in responses {
        // NotFound and delivery failures are logged by the registry
        let _ = registry.delegate(session, bytes).await;
    }
}

enum Invoker<E> {
    Inline(Arc<Mutex<E>>),
    Pool {
        engine: Arc<Mutex<E>>,
        pool: WorkerPool,
    },
}

impl<E: Engine> Invoker<E> {
    fn new(engine: Arc<Mutex<E>>, mode: LoopMode) -> Result<Self, BridgeError> {
        Ok(match mode {
            LoopMode::Cooperative => Invoker::Inline(engine),
            LoopMode::Pool { workers } => Invoker::Pool {
                engine,
                pool: WorkerPool::new(workers)?,
            },
        })
    }

    /// Runs `f` against the engine. The driver awaits each call before issuing
    /// the next, so calls never overlap.
    async fn invoke<F, T>(&self, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce(&mut E) -> T + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Invoker::Inline(engine) => {
                let mut engine = engine.lock();
                Ok(f(&mut *engine))
            }
            Invoker::Pool { engine, pool } => {
                let engine = engine.clone();
                pool.execute(move || f(&mut *engine.lock()))?.await
            }
        }
    }
}

/// A bridge running on its own OS thread.
pub struct BridgeThread {
    handle: BridgeHandle,
    thread: Option<JoinHandle<()>>,
}

impl BridgeThread {
    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Stops the driver and waits for its thread to exit.
    pub fn join(mut self) -> Result<(), BridgeError> {
        let _ = self.handle.shutdown();
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| BridgeError::WorkerPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for BridgeThread {
    fn drop(&mut self) {
        if self.thread.is_some() && self.handle.is_running() {
            let _ = self.handle.shutdown();
        }
    }
}
