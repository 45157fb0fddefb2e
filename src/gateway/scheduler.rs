//! Drives a media loop on the execution context the caller picked.
//!
//! The loops themselves only know how to run one iteration; whether that
//! iteration is scheduled on a dedicated OS thread or a tokio task is
//! decided here and nowhere else.

use std::{io, thread, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One named OS thread per loop. Required for sustained low-latency
    /// audio.
    #[default]
    #[serde(alias = "thread")]
    DedicatedThread,
    /// Cooperative tokio task. Fine for short or outgoing-only sessions.
    Task,
}

/// What the driver should do after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// More work is ready; run again right away.
    Yield,
    Sleep(Duration),
    Exit,
}

pub trait MediaLoop: Send + 'static {
    fn name(&self) -> &'static str;

    /// Runs exactly one iteration. Must not block for longer than a
    /// millisecond or so.
    fn poll(&mut self) -> LoopControl;
}

pub enum LoopHandle {
    Thread(thread::JoinHandle<()>),
    Task(tokio::task::JoinHandle<()>),
}

impl LoopHandle {
    /// Waits for the loop to exit. The loop must already have been told to
    /// stop through its cancellation token.
    pub async fn join(self) {
        match self {
            Self::Thread(handle) => {
                let joined = tokio::task::spawn_blocking(move || handle.join()).await;
                if !matches!(joined, Ok(Ok(()))) {
                    warn!("Media loop thread terminated abnormally");
                }
            }
            Self::Task(handle) => {
                if let Err(e) = handle.await {
                    warn!("Media loop task terminated abnormally: {}", e);
                }
            }
        }
    }
}

pub fn spawn<L: MediaLoop>(
    strategy: ExecutionStrategy,
    media_loop: L,
    cancel: CancellationToken,
) -> io::Result<LoopHandle> {
    let name = media_loop.name();
    debug!("Starting {} loop ({:?})", name, strategy);

    match strategy {
        ExecutionStrategy::DedicatedThread => {
            let handle = thread::Builder::new()
                .name(format!("voice-{}", name))
                .spawn(move || run_blocking(media_loop, cancel))?;
            Ok(LoopHandle::Thread(handle))
        }
        ExecutionStrategy::Task => Ok(LoopHandle::Task(tokio::spawn(run_task(
            media_loop, cancel,
        )))),
    }
}

fn run_blocking<L: MediaLoop>(mut media_loop: L, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        match media_loop.poll() {
            LoopControl::Yield => thread::yield_now(),
            LoopControl::Sleep(duration) => thread::sleep(duration),
            LoopControl::Exit => break,
        }
    }
    debug!("{} loop exited", media_loop.name());
}

async fn run_task<L: MediaLoop>(mut media_loop: L, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        match media_loop.poll() {
            LoopControl::Yield => tokio::task::yield_now().await,
            LoopControl::Sleep(duration) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(duration) => {}
                }
            }
            LoopControl::Exit => break,
        }
    }
    debug!("{} loop exited", media_loop.name());
}
