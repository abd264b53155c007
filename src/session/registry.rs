//! Session registry
//!
//! Process-wide map from [`SessionId`] to [`Session`]. Only the bridge core touches it.
//! Closing a session removes it immediately; the encoder exits it started are kept so
//! shutdown can wait for them.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Session, SessionSnapshot, SessionState};
use crate::encoder::ExitReport;
use crate::transport::Transport;
use crate::types::{ChannelId, SessionId};
use crate::{BridgeError, Result};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    stopping: Vec<JoinHandle<ExitReport>>,
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session; rejects one whose transport is already registered
    pub fn insert(&mut self, session: Session) -> Result<()> {
        if let Some(existing) =
            self.sessions.values().find(|s| same_transport(s.transport(), session.transport()))
        {
            return Err(BridgeError::DuplicateTransport { existing: existing.id() });
        }
        self.sessions.insert(session.id(), session);
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Live session bound to a signaling channel
    pub fn find_by_channel(&self, channel: ChannelId) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.channel() == Some(channel) && s.state() != SessionState::Closed)
            .map(Session::id)
    }

    /// Close and remove a session; returns false if it was not registered
    pub fn close(&mut self, id: SessionId) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            return false;
        };
        if let Some(stopping) = session.close() {
            self.stopping.retain(|handle| !handle.is_finished());
            self.stopping.push(stopping);
        }
        true
    }

    /// Close every session; returns how many were closed
    pub fn close_all(&mut self) -> usize {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.into_iter().filter(|id| self.close(*id)).count()
    }

    /// Wait for every encoder stop begun so far
    pub async fn wait_stopped(&mut self) -> Vec<ExitReport> {
        let handles = std::mem::take(&mut self.stopping);
        let mut reports = Vec::with_capacity(handles.len());
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => warn!(error = %e, "Encoder supervisor task failed"),
            }
        }
        debug!(count = reports.len(), "Encoder stops completed");
        reports
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self.sessions.values().map(Session::snapshot).collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{context, session};
    use crate::test_utils::ShellLauncher;
    use crate::types::{RawFrame, TrackId, TrackInfo};

    #[tokio::test]
    async fn duplicate_transport_is_rejected() {
        let (ctx, _events) = context(ShellLauncher::new("cat > /dev/null"));
        let mut registry = SessionRegistry::new();

        let (first, _) = session(&ctx, 1);
        let shared = Arc::clone(first.transport());
        registry.insert(first).unwrap();

        let duplicate = Session::new(SessionId::new(2), ChannelId::new(2), shared, Arc::clone(&ctx));
        let err = registry.insert(duplicate).unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateTransport { existing } if existing == SessionId::new(1)));
        assert_eq!(registry.len(), 1);

        let (other, _) = session(&ctx, 3);
        registry.insert(other).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn channel_lookup_skips_detached_sessions() {
        let (ctx, _events) = context(ShellLauncher::new("cat > /dev/null"));
        let mut registry = SessionRegistry::new();
        let (first, _) = session(&ctx, 1);
        registry.insert(first).unwrap();

        assert_eq!(registry.find_by_channel(ChannelId::new(1)), Some(SessionId::new(1)));
        registry.get_mut(SessionId::new(1)).unwrap().detach_channel();
        assert_eq!(registry.find_by_channel(ChannelId::new(1)), None);
        assert!(registry.contains(SessionId::new(1)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_all_waits_for_encoders() {
        let (ctx, _events) = context(ShellLauncher::new("cat > /dev/null"));
        let mut registry = SessionRegistry::new();

        for id in 1..=2 {
            let (mut s, _) = session(&ctx, id);
            s.negotiation_finished();
            s.attach_track(TrackInfo::video("video0"));
            s.on_frame(&TrackId::new("video0"), RawFrame::blank_i420(4, 4)).unwrap();
            registry.insert(s).unwrap();
        }
        let (idle, _) = session(&ctx, 3);
        registry.insert(idle).unwrap();

        assert_eq!(registry.close_all(), 3);
        assert!(registry.is_empty());
        assert!(!registry.close(SessionId::new(1)));

        let reports = registry.wait_stopped().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.requested));
    }
}
