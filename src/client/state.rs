use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::AbortHandle;
use tracing::debug;

/// Whether the client is mid-way through an outbound session request.
///
/// While connecting, the key listener turns every inbound request down
/// without asking. Otherwise the client is listening; the two modes are
/// exclusive so one flag carries both.
#[derive(Clone, Debug, Default)]
pub struct ConnectionMode {
    connecting: Arc<AtomicBool>,
}

impl ConnectionMode {
    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    /// Switches to connecting until the returned guard is dropped.
    pub(crate) fn begin_connecting(&self) -> ConnectingGuard {
        self.connecting.store(true, Ordering::Release);
        ConnectingGuard {
            connecting: Arc::clone(&self.connecting),
        }
    }
}

pub(crate) struct ConnectingGuard {
    connecting: Arc<AtomicBool>,
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        self.connecting.store(false, Ordering::Release);
    }
}

/// The one chat a client may have open at a time.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    mode: ConnectionMode,
    peer: Option<String>,
    tasks: Vec<AbortHandle>,
}

impl ConnectionState {
    pub(crate) fn mode(&self) -> &ConnectionMode {
        &self.mode
    }

    pub(crate) fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Marks `peer` as the current chat partner.
    pub(crate) fn install(&mut self, peer: &str) {
        self.peer = Some(peer.to_string());
    }

    /// Ties the tasks of the current chat to this state.
    pub(crate) fn attach(&mut self, tasks: impl IntoIterator<Item = AbortHandle>) {
        self.tasks.extend(tasks);
    }

    /// Ends whatever chat is open. Aborting its tasks drops the socket,
    /// which the peer reads as a close.
    pub(crate) fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(peer) = self.peer.take() {
            debug!(peer = %peer, "closed previous chat");
        }
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_restores_listening() {
        let mode = ConnectionMode::default();
        assert!(!mode.is_connecting());

        let guard = mode.begin_connecting();
        assert!(mode.clone().is_connecting());
        drop(guard);

        assert!(!mode.is_connecting());
    }

    #[tokio::test]
    async fn test_teardown_aborts_receiver() {
        let mut state = ConnectionState::default();
        let task = tokio::spawn(std::future::pending::<()>());

        state.install("bob");
        state.attach([task.abort_handle()]);
        assert_eq!(state.peer(), Some("bob"));

        state.teardown();
        assert!(state.peer().is_none());
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
