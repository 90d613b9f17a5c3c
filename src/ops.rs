//! Tracking and coordinated abort of in-flight operations.
//!
//! Every cancellable unit of work (a live call or a file playback)
//! registers here. Cancelling an operation does not mean its resources are
//! free: cleanup runs asynchronously in the operation's own task, so any
//! path that needs the device channel afterwards must wait on the
//! operation's completion latch, which fires only after cleanup has fully
//! run. The membership lock guards pure data-structure mutation and is
//! never held across a wait, so an operation's cleanup can unregister
//! itself without deadlocking a waiter.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    PlayFile,
    WebRtc,
}

/// One tracked operation: a cancellation handle plus a one-shot completion
/// latch (fires once, many waiters).
pub struct Operation {
    kind: OperationKind,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signals that cleanup has fully run and every resource the operation
    /// acquired has been released. Must be the last step of cleanup.
    pub fn complete(&self) {
        self.done.cancel();
    }

    pub async fn wait_complete(&self) {
        self.done.cancelled().await;
    }

    pub fn is_complete(&self) -> bool {
        self.done.is_cancelled()
    }
}

pub struct OperationRegistry {
    ops: Mutex<Vec<Arc<Operation>>>,
    sessions: Arc<dyn SessionManager>,
}

impl OperationRegistry {
    pub fn new(sessions: Arc<dyn SessionManager>) -> Self {
        OperationRegistry {
            ops: Mutex::new(Vec::new()),
            sessions,
        }
    }

    pub fn register(&self, kind: OperationKind, cancel: CancellationToken) -> Arc<Operation> {
        let op = Arc::new(Operation {
            kind,
            cancel,
            done: CancellationToken::new(),
        });
        self.ops.lock().unwrap().push(op.clone());
        tracing::debug!(target: "ops", kind = ?kind, "registered operation");
        op
    }

    /// Removes an operation from tracking. No-op if it was already removed
    /// (e.g. by an abort that claimed it first).
    pub fn unregister(&self, op: &Arc<Operation>) {
        let mut ops = self.ops.lock().unwrap();
        if let Some(idx) = ops.iter().position(|o| Arc::ptr_eq(o, op)) {
            let removed = ops.remove(idx);
            tracing::debug!(target: "ops", kind = ?removed.kind(), "unregistered operation");
        }
    }

    pub fn has_active_operation(&self) -> bool {
        !self.ops.lock().unwrap().is_empty()
    }

    pub fn has_active_webrtc(&self) -> bool {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .any(|op| op.kind() == OperationKind::WebRtc)
    }

    /// Cancels every tracked file playback and waits for each one's
    /// cleanup to finish. A starting call uses this to guarantee the device
    /// channel is free before acquiring it; live calls are never targeted.
    pub async fn abort_play_file_operations(&self) {
        let claimed: Vec<Arc<Operation>> = {
            let mut ops = self.ops.lock().unwrap();
            let mut claimed = Vec::new();
            ops.retain(|op| {
                if op.kind() == OperationKind::PlayFile {
                    op.cancel();
                    claimed.push(op.clone());
                    false
                } else {
                    true
                }
            });
            claimed
        };

        if claimed.is_empty() {
            return;
        }
        tracing::info!(target: "ops", count = claimed.len(), "preempting file playback");
        for op in &claimed {
            op.wait_complete().await;
        }
        tracing::info!(target: "ops", "file playback cleanup complete");
    }

    /// Cancels every tracked operation, waits for all cleanup, then
    /// force-releases every channel the device still reports in use,
    /// including channels this registry never tracked, to recover from
    /// orphaned device-side state. Per-channel release failures are logged
    /// and skipped; a listing failure is returned.
    pub async fn abort_all(&self) -> Result<()> {
        let claimed: Vec<Arc<Operation>> = {
            let mut ops = self.ops.lock().unwrap();
            for op in ops.iter() {
                op.cancel();
            }
            std::mem::take(&mut *ops)
        };

        tracing::info!(target: "ops", count = claimed.len(), "aborting all operations");
        for op in &claimed {
            op.wait_complete().await;
        }

        let channels = self.sessions.list_channels().await?;
        let mut released = 0usize;
        for channel in channels.iter().filter(|c| c.enabled) {
            match self.sessions.release_channel(&channel.id).await {
                Ok(()) => released += 1,
                Err(err) => {
                    tracing::warn!(
                        target: "ops",
                        channel_id = %channel.id,
                        error = %err,
                        "failed to release channel during abort"
                    );
                }
            }
        }
        tracing::info!(target: "ops", released, "abort complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::device::{AudioSession, Channel};
    use crate::error::Error;

    /// In-memory device: channels flip to enabled on acquire and back on
    /// release, with a log of releases for assertions.
    struct MockSessions {
        channels: Mutex<Vec<Channel>>,
        released: Mutex<Vec<String>>,
    }

    impl MockSessions {
        fn with_channels(channels: Vec<Channel>) -> Arc<Self> {
            Arc::new(MockSessions {
                channels: Mutex::new(channels),
                released: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SessionManager for MockSessions {
        async fn acquire_channel(&self, cancel: &CancellationToken) -> crate::error::Result<AudioSession> {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let mut channels = self.channels.lock().unwrap();
            let Some(ch) = channels.iter_mut().find(|c| !c.enabled) else {
                return Err(Error::NoAvailableChannels);
            };
            ch.enabled = true;
            Ok(AudioSession {
                channel_id: ch.id.clone(),
                session_id: String::new(),
            })
        }

        async fn release_channel(&self, channel_id: &str) -> crate::error::Result<()> {
            let mut channels = self.channels.lock().unwrap();
            if let Some(ch) = channels.iter_mut().find(|c| c.id == channel_id) {
                ch.enabled = false;
            }
            self.released.lock().unwrap().push(channel_id.to_string());
            Ok(())
        }

        async fn list_channels(&self) -> crate::error::Result<Vec<Channel>> {
            Ok(self.channels.lock().unwrap().clone())
        }
    }

    fn test_registry() -> (OperationRegistry, Arc<MockSessions>) {
        let sessions = MockSessions::with_channels(vec![Channel {
            id: "1".into(),
            enabled: false,
        }]);
        (OperationRegistry::new(sessions.clone()), sessions)
    }

    #[tokio::test]
    async fn membership_queries_reflect_registration() {
        let (registry, _) = test_registry();
        assert!(!registry.has_active_operation());

        let op = registry.register(OperationKind::PlayFile, CancellationToken::new());
        assert!(registry.has_active_operation());
        assert!(!registry.has_active_webrtc());

        let call = registry.register(OperationKind::WebRtc, CancellationToken::new());
        assert!(registry.has_active_webrtc());

        registry.unregister(&op);
        registry.unregister(&op); // second removal is a no-op
        registry.unregister(&call);
        assert!(!registry.has_active_operation());
    }

    #[tokio::test]
    async fn precedence_abort_waits_for_cleanup_and_spares_calls() {
        let (registry, sessions) = test_registry();
        let registry = Arc::new(registry);

        let cancel = CancellationToken::new();
        let op = registry.register(OperationKind::PlayFile, cancel.clone());
        let call = registry.register(OperationKind::WebRtc, CancellationToken::new());

        // Simulated playback task: holds the channel until cancelled, then
        // releases it and only afterwards signals completion.
        let session = sessions
            .acquire_channel(&CancellationToken::new())
            .await
            .unwrap();
        let task = {
            let sessions = sessions.clone();
            let op = op.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                sessions.release_channel(&session.channel_id).await.unwrap();
                op.complete();
            })
        };

        registry.abort_play_file_operations().await;
        task.await.unwrap();

        // The abort must not return before the channel was released.
        assert!(op.is_complete());
        assert!(sessions.released.lock().unwrap().contains(&"1".to_string()));
        assert!(!sessions.channels.lock().unwrap()[0].enabled);

        // The live call is untouched and the playback is no longer tracked.
        assert!(registry.has_active_webrtc());
        assert!(!call.cancel_token().is_cancelled());
        registry.unregister(&call);
        assert!(!registry.has_active_operation());
    }

    #[tokio::test]
    async fn cleanup_unregistering_itself_does_not_deadlock_abort() {
        let (registry, _) = test_registry();
        let registry = Arc::new(registry);

        let cancel = CancellationToken::new();
        let op = registry.register(OperationKind::PlayFile, cancel.clone());
        let task = {
            let registry = registry.clone();
            let op = op.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                registry.unregister(&op);
                op.complete();
            })
        };

        tokio::time::timeout(Duration::from_secs(1), registry.abort_play_file_operations())
            .await
            .expect("abort must not deadlock against self-unregistering cleanup");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn abort_all_sweeps_untracked_enabled_channels() {
        let sessions = MockSessions::with_channels(vec![
            Channel {
                id: "1".into(),
                enabled: false,
            },
            // Orphaned device-side state: in use, but no registered
            // operation owns it.
            Channel {
                id: "2".into(),
                enabled: true,
            },
        ]);
        let registry = OperationRegistry::new(sessions.clone());

        registry.abort_all().await.unwrap();

        assert_eq!(*sessions.released.lock().unwrap(), vec!["2".to_string()]);
        assert!(sessions.channels.lock().unwrap().iter().all(|c| !c.enabled));
    }

    #[tokio::test]
    async fn abort_all_cancels_both_kinds_and_waits() {
        let (registry, _) = test_registry();
        let registry = Arc::new(registry);

        let mut tasks = Vec::new();
        for kind in [OperationKind::PlayFile, OperationKind::WebRtc] {
            let cancel = CancellationToken::new();
            let op = registry.register(kind, cancel.clone());
            tasks.push(tokio::spawn(async move {
                cancel.cancelled().await;
                op.complete();
            }));
        }

        registry.abort_all().await.unwrap();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(!registry.has_active_operation());
    }
}
