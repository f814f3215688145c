use crate::error::{ChannelError, TransportError};
use futures::{FutureExt, future::BoxFuture};
use std::fmt;
use tokio::task::AbortHandle;

/// Background task of a channel endpoint, as run by a [`Spawner`].
pub type LinkFuture = BoxFuture<'static, Result<(), ChannelError>>;

/// Launches the writer and reader tasks of a channel endpoint.
///
/// Runtimes that track their tasks implement this so the tasks driving the transport are
/// accounted for alongside the rest of their work.
pub trait Spawner {
    fn spawn(&self, label: &'static str, task: LinkFuture) -> Result<LinkTask, ChannelError>;
}

/// Handle to a spawned channel task.
pub struct LinkTask {
    join: LinkFuture,
    abort: AbortHandle,
}

impl fmt::Debug for LinkTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkTask")
            .field("finished", &self.abort.is_finished())
            .finish()
    }
}

impl LinkTask {
    /// `join` resolves with the task outcome; a cancelled task resolves `Ok`.
    pub fn new(join: LinkFuture, abort: AbortHandle) -> Self {
        Self { join, abort }
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub async fn join(self) -> Result<(), ChannelError> {
        self.join.await
    }
}

/// Plain `tokio::spawn`, untracked.
#[derive(Debug, Copy, Clone, Default)]
pub struct TokioSpawner;

impl TokioSpawner {
    pub fn launch(task: LinkFuture) -> LinkTask {
        let handle = tokio::spawn(task);
        let abort = handle.abort_handle();

        let join = async move {
            match handle.await {
                Ok(result) => result,
                Err(error) if error.is_cancelled() => Ok(()),
                Err(error) => Err(ChannelError::Transport(TransportError::Closed(format!(
                    "channel task panicked: {error}"
                )))),
            }
        };
        LinkTask::new(join.boxed(), abort)
    }
}

impl Spawner for TokioSpawner {
    fn spawn(&self, _: &'static str, task: LinkFuture) -> Result<LinkTask, ChannelError> {
        Ok(Self::launch(task))
    }
}
