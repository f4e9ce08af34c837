//! Permission gate between tools and a human reviewer or session policy.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use opencode_types::{
    Event, EventKind, GrantScope, PermissionAction, PermissionDecision, PermissionEvent, PermissionRequest,
    new_id,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pubsub::Broker;
use crate::sync::lock_unpoisoned;

struct Pending {
    request: PermissionRequest,
    reply: oneshot::Sender<PermissionDecision>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PathGrant {
    session_id: String,
    tool_name: String,
    path: String,
}

/// Blocks tool side effects until a request is granted or denied.
///
/// Each request resolves exactly once. Resolving an id that is no longer
/// pending is a no-op that returns `false`.
#[derive(Default)]
pub struct PermissionGate {
    pending: Mutex<HashMap<String, Pending>>,
    policies: Mutex<HashMap<String, PermissionAction>>,
    session_grants: Mutex<HashSet<String>>,
    path_grants: Mutex<HashSet<PathGrant>>,
    broker: Broker<PermissionEvent>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for permission, waiting for a decision. Cancellation denies.
    pub async fn request(&self, cancel: &CancellationToken, mut request: PermissionRequest) -> bool {
        if request.id.is_empty() {
            request.id = new_id();
        }

        let policy = lock_unpoisoned(&self.policies)
            .get(&request.session_id)
            .copied();
        match policy {
            Some(PermissionAction::Allow) => return true,
            Some(PermissionAction::Deny) => {
                debug!(
                    target: "opencode::permission",
                    session_id = %request.session_id,
                    tool = %request.tool_name,
                    "Denied by session policy"
                );
                return false;
            }
            Some(PermissionAction::Ask) | None => {}
        }

        if self.is_pre_granted(&request) {
            return true;
        }

        let (tx, rx) = oneshot::channel();
        let id = request.id.clone();
        lock_unpoisoned(&self.pending).insert(
            id.clone(),
            Pending {
                request: request.clone(),
                reply: tx,
            },
        );
        info!(
            target: "opencode::permission",
            request_id = %id,
            session_id = %request.session_id,
            tool = %request.tool_name,
            path = %request.path,
            "Permission requested"
        );
        self.broker
            .publish(EventKind::Created, PermissionEvent::Requested(request))
            .await;

        tokio::select! {
            decision = rx => decision.map(|d| d.is_granted()).unwrap_or(false),
            _ = cancel.cancelled() => {
                // A resolver may have won the race; only publish if we removed it.
                let pending = lock_unpoisoned(&self.pending).remove(&id);
                if let Some(pending) = pending {
                    debug!(target: "opencode::permission", request_id = %id, "Request canceled");
                    self.publish_resolved(pending.request, PermissionDecision::Denied).await;
                }
                false
            }
        }
    }

    fn is_pre_granted(&self, request: &PermissionRequest) -> bool {
        if lock_unpoisoned(&self.session_grants).contains(&request.session_id) {
            return true;
        }
        lock_unpoisoned(&self.path_grants).iter().any(|grant| {
            grant.session_id == request.session_id
                && grant.tool_name == request.tool_name
                && path_within(&request.path, &grant.path)
        })
    }

    /// Grant a pending request.
    pub async fn grant(&self, request_id: &str, scope: GrantScope) -> bool {
        let Some(pending) = lock_unpoisoned(&self.pending).remove(request_id) else {
            return false;
        };
        match scope {
            GrantScope::Once => {}
            GrantScope::Session => {
                lock_unpoisoned(&self.session_grants).insert(pending.request.session_id.clone());
            }
            GrantScope::SessionPathTool => {
                lock_unpoisoned(&self.path_grants).insert(PathGrant {
                    session_id: pending.request.session_id.clone(),
                    tool_name: pending.request.tool_name.clone(),
                    path: pending.request.path.clone(),
                });
            }
        }
        self.resolve(pending, PermissionDecision::Granted(scope)).await;
        true
    }

    /// Deny a pending request.
    pub async fn deny(&self, request_id: &str) -> bool {
        let Some(pending) = lock_unpoisoned(&self.pending).remove(request_id) else {
            return false;
        };
        self.resolve(pending, PermissionDecision::Denied).await;
        true
    }

    async fn resolve(&self, pending: Pending, decision: PermissionDecision) {
        info!(
            target: "opencode::permission",
            request_id = %pending.request.id,
            granted = decision.is_granted(),
            "Permission resolved"
        );
        // The requester may have gone away; the decision still stands.
        let _ = pending.reply.send(decision);
        self.publish_resolved(pending.request, decision).await;
    }

    async fn publish_resolved(&self, request: PermissionRequest, decision: PermissionDecision) {
        self.broker
            .publish(
                EventKind::Updated,
                PermissionEvent::Resolved { request, decision },
            )
            .await;
    }

    /// Approve everything for a session. Used by non-interactive runs and flows.
    pub fn auto_approve_session(&self, session_id: &str) {
        self.set_session_policy(session_id, PermissionAction::Allow);
    }

    /// Allow approves everything, deny rejects everything, ask defers to the reviewer.
    pub fn set_session_policy(&self, session_id: &str, policy: PermissionAction) {
        lock_unpoisoned(&self.policies).insert(session_id.to_string(), policy);
    }

    pub fn session_policy(&self, session_id: &str) -> Option<PermissionAction> {
        lock_unpoisoned(&self.policies).get(session_id).copied()
    }

    /// Drop the policy and grants held for a session.
    pub fn clear_session(&self, session_id: &str) {
        lock_unpoisoned(&self.policies).remove(session_id);
        lock_unpoisoned(&self.session_grants).remove(session_id);
        lock_unpoisoned(&self.path_grants).retain(|g| g.session_id != session_id);
    }

    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        lock_unpoisoned(&self.pending)
            .values()
            .map(|p| p.request.clone())
            .collect()
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<PermissionEvent>> {
        self.broker.subscribe(cancel)
    }

    pub fn shutdown(&self) {
        // Dropping the reply senders unblocks every waiter with a denial.
        lock_unpoisoned(&self.pending).clear();
        self.broker.shutdown();
    }
}

fn path_within(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || path == prefix {
        return true;
    }
    Path::new(path).starts_with(Path::new(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(session: &str, tool: &str, path: &str) -> PermissionRequest {
        PermissionRequest {
            id: String::new(),
            session_id: session.into(),
            tool_name: tool.into(),
            action: "execute".into(),
            description: "test".into(),
            path: path.into(),
            params: serde_json::Value::Null,
        }
    }

    async fn wait_pending(gate: &PermissionGate) -> PermissionRequest {
        loop {
            if let Some(req) = gate.pending_requests().into_iter().next() {
                return req;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_grant_once_then_late_grant_is_noop() {
        let gate = Arc::new(PermissionGate::new());
        let cancel = CancellationToken::new();
        let g = gate.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { g.request(&c, request("s", "bash", "/w")).await });

        let pending = wait_pending(&gate).await;
        assert!(gate.grant(&pending.id, GrantScope::Once).await);
        assert!(waiter.await.unwrap());
        assert!(!gate.grant(&pending.id, GrantScope::Once).await);
        assert!(!gate.deny(&pending.id).await);
    }

    #[tokio::test]
    async fn test_deny() {
        let gate = Arc::new(PermissionGate::new());
        let cancel = CancellationToken::new();
        let g = gate.clone();
        let waiter = tokio::spawn(async move { g.request(&cancel, request("s", "bash", "/w")).await });

        let pending = wait_pending(&gate).await;
        assert!(gate.deny(&pending.id).await);
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_with_deny() {
        let gate = Arc::new(PermissionGate::new());
        let cancel = CancellationToken::new();
        let g = gate.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { g.request(&c, request("s", "bash", "/w")).await });

        let pending = wait_pending(&gate).await;
        cancel.cancel();
        assert!(!waiter.await.unwrap());
        assert!(gate.pending_requests().is_empty());
        assert!(!gate.grant(&pending.id, GrantScope::Once).await);
    }

    #[tokio::test]
    async fn test_session_policies() {
        let gate = PermissionGate::new();
        let cancel = CancellationToken::new();
        gate.auto_approve_session("auto");
        gate.set_session_policy("locked", PermissionAction::Deny);
        assert!(gate.request(&cancel, request("auto", "bash", "/")).await);
        assert!(!gate.request(&cancel, request("locked", "bash", "/")).await);
    }

    #[tokio::test]
    async fn test_path_tool_grant_covers_subpaths() {
        let gate = Arc::new(PermissionGate::new());
        let cancel = CancellationToken::new();
        let g = gate.clone();
        let c = cancel.clone();
        let waiter =
            tokio::spawn(async move { g.request(&c, request("s", "write", "/work")).await });
        let pending = wait_pending(&gate).await;
        gate.grant(&pending.id, GrantScope::SessionPathTool).await;
        assert!(waiter.await.unwrap());

        assert!(gate.request(&cancel, request("s", "write", "/work/src/a.rs")).await);

        // different tool still asks
        let g = gate.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { g.request(&c, request("s", "bash", "/work")).await });
        let pending = wait_pending(&gate).await;
        assert_eq!(pending.tool_name, "bash");
        gate.deny(&pending.id).await;
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_events_published() {
        let gate = Arc::new(PermissionGate::new());
        let cancel = CancellationToken::new();
        let mut events = gate.subscribe(&cancel);
        let g = gate.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { g.request(&c, request("s", "bash", "/")).await });

        let requested = events.recv().await.unwrap();
        let id = match requested.payload {
            PermissionEvent::Requested(req) => req.id,
            other => panic!("unexpected event {other:?}"),
        };
        gate.grant(&id, GrantScope::Session).await;
        waiter.await.unwrap();

        match events.recv().await.unwrap().payload {
            PermissionEvent::Resolved { decision, .. } => {
                assert_eq!(decision, PermissionDecision::Granted(GrantScope::Session));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
