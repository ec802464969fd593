use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use loomcast_core::permission::WorkspaceRole;
use loomcast_core::token::SessionPrincipal;

use crate::presence::{CursorPosition, Presence, Selection};

/// Process-wide directory of workflow and workspace rooms. Membership
/// mutations are tiny synchronous critical sections under the map entries;
/// callers perform durable-store calls and broadcasts outside, using the
/// snapshots returned here.
pub struct RoomRegistry {
    workflows: DashMap<String, WorkflowRoomEntry>,
    workspaces: DashMap<String, WorkspaceRoomEntry>,
    socket_workflow: DashMap<String, String>,
    socket_workspace: DashMap<String, WorkspaceMembership>,
    tombstones: DashMap<String, Instant>,
    tombstone_ttl: Duration,
}

struct WorkflowRoomEntry {
    presences: HashMap<String, Presence>,
    active_connections: usize,
    last_modified: i64,
    last_timestamp: i64,
    /// Serializes operations per workflow. Held across durable-store
    /// awaits; never taken inside the membership critical sections.
    op_lock: Arc<AsyncMutex<()>>,
}

impl WorkflowRoomEntry {
    fn new(now: i64) -> Self {
        Self {
            presences: HashMap::new(),
            active_connections: 0,
            last_modified: now,
            last_timestamp: now,
            op_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    fn ordered_snapshot(&self) -> Vec<Presence> {
        let mut users: Vec<Presence> = self.presences.values().cloned().collect();
        users.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.socket_id.cmp(&b.socket_id))
        });
        users
    }
}

struct WorkspaceRoomEntry {
    sockets: HashMap<String, WorkspaceRole>,
    active_connections: usize,
    last_modified: i64,
}

#[derive(Debug, Clone)]
pub struct WorkspaceMembership {
    pub workspace_id: String,
    pub user_id: String,
    pub role: WorkspaceRole,
}

#[derive(Debug)]
pub struct WorkflowJoin {
    /// Effects of the implicit leave of the previous workflow, if any.
    pub previous: Option<WorkflowLeave>,
    /// Ordered snapshot including the joiner.
    pub snapshot: Vec<Presence>,
    pub timestamp: i64,
}

#[derive(Debug)]
pub struct WorkflowLeave {
    pub workflow_id: String,
    pub presence: Presence,
    pub remaining: Vec<Presence>,
    pub destroyed: bool,
    pub timestamp: i64,
}

#[derive(Debug)]
pub struct WorkspaceLeave {
    pub workspace_id: String,
    pub destroyed: bool,
}

#[derive(Debug, Default)]
pub struct DisconnectCleanup {
    pub workflow: Option<WorkflowLeave>,
    pub workspace: Option<WorkspaceLeave>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDenied {
    /// The workflow was deleted recently; re-joins race the deletion notice.
    Tombstoned,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl RoomRegistry {
    pub fn new(tombstone_ttl: Duration) -> Self {
        Self {
            workflows: DashMap::new(),
            workspaces: DashMap::new(),
            socket_workflow: DashMap::new(),
            socket_workspace: DashMap::new(),
            tombstones: DashMap::new(),
            tombstone_ttl,
        }
    }

    // ---- workspace rooms ----

    pub fn join_workspace(
        &self,
        socket_id: &str,
        principal: &SessionPrincipal,
        workspace_id: &str,
        role: WorkspaceRole,
    ) -> Option<WorkspaceLeave> {
        let previous = self.leave_workspace(socket_id);

        let now = now_millis();
        let mut entry = self
            .workspaces
            .entry(workspace_id.to_string())
            .or_insert_with(|| WorkspaceRoomEntry {
                sockets: HashMap::new(),
                active_connections: 0,
                last_modified: now,
            });
        if entry.sockets.insert(socket_id.to_string(), role).is_none() {
            entry.active_connections += 1;
        }
        entry.last_modified = now;
        drop(entry);

        self.socket_workspace.insert(
            socket_id.to_string(),
            WorkspaceMembership {
                workspace_id: workspace_id.to_string(),
                user_id: principal.user_id.to_string(),
                role,
            },
        );

        previous
    }

    pub fn leave_workspace(&self, socket_id: &str) -> Option<WorkspaceLeave> {
        let (_, membership) = self.socket_workspace.remove(socket_id)?;
        let workspace_id = membership.workspace_id;

        let mut destroyed = false;
        if let Some(mut entry) = self.workspaces.get_mut(&workspace_id) {
            if entry.sockets.remove(socket_id).is_some() {
                entry.active_connections = entry.active_connections.saturating_sub(1);
            }
            destroyed = entry.sockets.is_empty();
        }
        if destroyed {
            self.workspaces
                .remove_if(&workspace_id, |_, entry| entry.sockets.is_empty());
        }

        Some(WorkspaceLeave {
            workspace_id,
            destroyed,
        })
    }

    pub fn workspace_membership(&self, socket_id: &str) -> Option<WorkspaceMembership> {
        self.socket_workspace
            .get(socket_id)
            .map(|entry| entry.value().clone())
    }

    pub fn workspace_sockets(&self, workspace_id: &str) -> Vec<String> {
        self.workspaces
            .get(workspace_id)
            .map(|entry| entry.sockets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Sockets of one user currently joined to the given workspace room.
    pub fn user_sockets_in_workspace(&self, user_id: &str, workspace_id: &str) -> Vec<String> {
        self.socket_workspace
            .iter()
            .filter(|entry| {
                entry.value().workspace_id == workspace_id && entry.value().user_id == user_id
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn set_workspace_role(&self, socket_id: &str, role: WorkspaceRole) {
        if let Some(mut membership) = self.socket_workspace.get_mut(socket_id) {
            let workspace_id = membership.workspace_id.clone();
            membership.role = role;
            drop(membership);
            if let Some(mut entry) = self.workspaces.get_mut(&workspace_id) {
                if let Some(cached) = entry.sockets.get_mut(socket_id) {
                    *cached = role;
                }
            }
        }
    }

    // ---- workflow rooms ----

    pub fn join_workflow(
        &self,
        socket_id: &str,
        principal: &SessionPrincipal,
        workflow_id: &str,
        role: WorkspaceRole,
    ) -> Result<WorkflowJoin, JoinDenied> {
        if self.is_tombstoned(workflow_id) {
            return Err(JoinDenied::Tombstoned);
        }

        // Joining a workflow while already in another is an implicit leave.
        let previous = self.leave_workflow(socket_id);

        let now = now_millis();
        let mut entry = self
            .workflows
            .entry(workflow_id.to_string())
            .or_insert_with(|| WorkflowRoomEntry::new(now));

        let presence = Presence::new(socket_id, principal, role, now);
        if entry
            .presences
            .insert(socket_id.to_string(), presence)
            .is_none()
        {
            entry.active_connections += 1;
        }
        let snapshot = entry.ordered_snapshot();
        drop(entry);

        self.socket_workflow
            .insert(socket_id.to_string(), workflow_id.to_string());

        Ok(WorkflowJoin {
            previous,
            snapshot,
            timestamp: now,
        })
    }

    pub fn leave_workflow(&self, socket_id: &str) -> Option<WorkflowLeave> {
        let (_, workflow_id) = self.socket_workflow.remove(socket_id)?;

        let now = now_millis();
        let mut removed = None;
        let mut remaining = Vec::new();
        let mut destroyed = false;

        if let Some(mut entry) = self.workflows.get_mut(&workflow_id) {
            if let Some(presence) = entry.presences.remove(socket_id) {
                entry.active_connections = entry.active_connections.saturating_sub(1);
                removed = Some(presence);
            }
            remaining = entry.ordered_snapshot();
            destroyed = entry.presences.is_empty();
        }
        if destroyed {
            self.workflows
                .remove_if(&workflow_id, |_, entry| entry.presences.is_empty());
        }

        removed.map(|presence| WorkflowLeave {
            workflow_id,
            presence,
            remaining,
            destroyed,
            timestamp: now,
        })
    }

    pub fn current_workflow(&self, socket_id: &str) -> Option<String> {
        self.socket_workflow
            .get(socket_id)
            .map(|entry| entry.value().clone())
    }

    /// The caller's own presence plus the room it lives in, as cached at
    /// join time. This is where the operation pipeline reads its role from.
    pub fn presence(&self, socket_id: &str) -> Option<(String, Presence)> {
        let workflow_id = self.current_workflow(socket_id)?;
        let entry = self.workflows.get(&workflow_id)?;
        let presence = entry.presences.get(socket_id)?.clone();
        drop(entry);
        Some((workflow_id, presence))
    }

    pub fn presence_snapshot(&self, workflow_id: &str) -> Vec<Presence> {
        self.workflows
            .get(workflow_id)
            .map(|entry| entry.ordered_snapshot())
            .unwrap_or_default()
    }

    /// The per-room serialization point for the operation pipeline. The Arc
    /// keeps an in-flight operation valid even if the last participant
    /// leaves while it runs.
    pub fn op_lock(&self, workflow_id: &str) -> Option<Arc<AsyncMutex<()>>> {
        self.workflows
            .get(workflow_id)
            .map(|entry| entry.op_lock.clone())
    }

    /// Server-assigned timestamps are strictly monotonic per room.
    pub fn next_timestamp(&self, workflow_id: &str) -> i64 {
        let now = now_millis();
        match self.workflows.get_mut(workflow_id) {
            Some(mut entry) => {
                let next = now.max(entry.last_timestamp + 1);
                entry.last_timestamp = next;
                next
            }
            None => now,
        }
    }

    pub fn bump_last_modified(&self, workflow_id: &str, timestamp: i64) {
        if let Some(mut entry) = self.workflows.get_mut(workflow_id) {
            entry.last_modified = entry.last_modified.max(timestamp);
        }
    }

    pub fn last_modified(&self, workflow_id: &str) -> Option<i64> {
        self.workflows
            .get(workflow_id)
            .map(|entry| entry.last_modified)
    }

    // ---- presence mutation ----

    pub fn update_cursor(
        &self,
        socket_id: &str,
        cursor: CursorPosition,
    ) -> Option<(String, Presence)> {
        self.mutate_presence(socket_id, |presence| {
            presence.cursor = Some(cursor);
        })
    }

    pub fn update_selection(
        &self,
        socket_id: &str,
        selection: Selection,
    ) -> Option<(String, Presence)> {
        self.mutate_presence(socket_id, |presence| {
            presence.selection = Some(selection);
        })
    }

    fn mutate_presence(
        &self,
        socket_id: &str,
        apply: impl FnOnce(&mut Presence),
    ) -> Option<(String, Presence)> {
        let workflow_id = self.current_workflow(socket_id)?;
        let mut entry = self.workflows.get_mut(&workflow_id)?;
        let presence = entry.presences.get_mut(socket_id)?;
        apply(presence);
        presence.last_activity = now_millis();
        let updated = presence.clone();
        Some((workflow_id, updated))
    }

    /// Updates the cached role on one presence. Returns the room and its
    /// fresh snapshot so the caller can broadcast the change.
    pub fn set_presence_role(
        &self,
        socket_id: &str,
        role: WorkspaceRole,
    ) -> Option<(String, Vec<Presence>)> {
        let workflow_id = self.current_workflow(socket_id)?;
        let mut entry = self.workflows.get_mut(&workflow_id)?;
        let presence = entry.presences.get_mut(socket_id)?;
        presence.role = role;
        presence.last_activity = now_millis();
        let snapshot = entry.ordered_snapshot();
        Some((workflow_id, snapshot))
    }

    /// Drops the whole room (deletion path): every member is removed, the
    /// reverse indices cleaned, and the id tombstoned against stale re-joins.
    pub fn remove_workflow_room(&self, workflow_id: &str) -> Vec<String> {
        let sockets: Vec<String> = self
            .workflows
            .remove(workflow_id)
            .map(|(_, entry)| entry.presences.into_keys().collect())
            .unwrap_or_default();

        for socket_id in &sockets {
            self.socket_workflow
                .remove_if(socket_id, |_, current| current.as_str() == workflow_id);
        }

        self.tombstones
            .insert(workflow_id.to_string(), Instant::now());
        sockets
    }

    pub fn is_tombstoned(&self, workflow_id: &str) -> bool {
        if let Some(entry) = self.tombstones.get(workflow_id) {
            if entry.value().elapsed() < self.tombstone_ttl {
                return true;
            }
        }
        self.tombstones
            .remove_if(workflow_id, |_, stamped| {
                stamped.elapsed() >= self.tombstone_ttl
            });
        false
    }

    pub fn sweep_tombstones(&self) {
        let ttl = self.tombstone_ttl;
        self.tombstones.retain(|_, stamped| stamped.elapsed() < ttl);
    }

    // ---- counters ----

    pub fn active_connections(&self, workflow_id: &str) -> usize {
        self.workflows
            .get(workflow_id)
            .map(|entry| entry.active_connections)
            .unwrap_or(0)
    }

    pub fn unique_user_count(&self, workflow_id: &str) -> usize {
        self.workflows
            .get(workflow_id)
            .map(|entry| {
                entry
                    .presences
                    .values()
                    .map(|presence| presence.user_id.as_str())
                    .collect::<HashSet<_>>()
                    .len()
            })
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.socket_workspace.len()
    }

    pub fn workflow_room_count(&self) -> usize {
        self.workflows.len()
    }

    pub fn workspace_room_count(&self) -> usize {
        self.workspaces.len()
    }

    // ---- teardown ----

    pub fn disconnect(&self, socket_id: &str) -> DisconnectCleanup {
        DisconnectCleanup {
            workflow: self.leave_workflow(socket_id),
            workspace: self.leave_workspace(socket_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomcast_core::ids::UserId;

    fn principal(user_id: &str) -> SessionPrincipal {
        SessionPrincipal {
            user_id: UserId::from(user_id),
            name: format!("User {user_id}"),
            avatar_url: None,
        }
    }

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Duration::from_secs(30))
    }

    #[test]
    fn join_creates_room_and_leave_destroys_it() {
        let registry = registry();
        let join = registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("join");
        assert!(join.previous.is_none());
        assert_eq!(join.snapshot.len(), 1);
        assert_eq!(registry.active_connections("wf-1"), 1);
        assert_eq!(registry.workflow_room_count(), 1);
        assert_eq!(registry.current_workflow("s1").as_deref(), Some("wf-1"));

        let leave = registry.leave_workflow("s1").expect("leave");
        assert!(leave.destroyed);
        assert!(leave.remaining.is_empty());
        assert_eq!(registry.workflow_room_count(), 0);
        assert_eq!(registry.active_connections("wf-1"), 0);
        assert!(registry.current_workflow("s1").is_none());
    }

    #[test]
    fn forward_and_reverse_membership_agree() {
        let registry = registry();
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("join s1");
        registry
            .join_workflow("s2", &principal("u2"), "wf-1", WorkspaceRole::Read)
            .expect("join s2");

        for socket_id in ["s1", "s2"] {
            let workflow = registry.current_workflow(socket_id).expect("reverse index");
            let snapshot = registry.presence_snapshot(&workflow);
            assert!(
                snapshot
                    .iter()
                    .any(|presence| presence.socket_id == socket_id),
                "socket must appear in the forward membership"
            );
        }
        assert_eq!(
            registry.active_connections("wf-1"),
            registry.presence_snapshot("wf-1").len()
        );
    }

    #[test]
    fn switching_workflows_is_an_implicit_leave() {
        let registry = registry();
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("first join");
        let join = registry
            .join_workflow("s1", &principal("u1"), "wf-2", WorkspaceRole::Edit)
            .expect("second join");

        let previous = join.previous.expect("implicit leave");
        assert_eq!(previous.workflow_id, "wf-1");
        assert!(previous.destroyed);
        assert_eq!(registry.current_workflow("s1").as_deref(), Some("wf-2"));
        assert_eq!(registry.active_connections("wf-1"), 0);
        assert_eq!(registry.active_connections("wf-2"), 1);
    }

    #[test]
    fn snapshot_is_ordered_by_join_time() {
        let registry = registry();
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("s1");
        registry
            .join_workflow("s2", &principal("u2"), "wf-1", WorkspaceRole::Edit)
            .expect("s2");
        registry
            .join_workflow("s3", &principal("u3"), "wf-1", WorkspaceRole::Edit)
            .expect("s3");

        let snapshot = registry.presence_snapshot("wf-1");
        // joined_at ties resolve by socket id, so the order is deterministic
        assert_eq!(snapshot.len(), 3);
        for pair in snapshot.windows(2) {
            assert!(
                (pair[0].joined_at, pair[0].socket_id.as_str())
                    <= (pair[1].joined_at, pair[1].socket_id.as_str())
            );
        }
    }

    #[test]
    fn unique_users_deduplicate_multiple_connections() {
        let registry = registry();
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("s1");
        registry
            .join_workflow("s2", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("s2");
        registry
            .join_workflow("s3", &principal("u2"), "wf-1", WorkspaceRole::Edit)
            .expect("s3");

        assert_eq!(registry.active_connections("wf-1"), 3);
        assert_eq!(registry.unique_user_count("wf-1"), 2);
    }

    #[test]
    fn timestamps_are_strictly_monotonic() {
        let registry = registry();
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("join");

        let mut previous = 0;
        for _ in 0..64 {
            let next = registry.next_timestamp("wf-1");
            assert!(next > previous, "{next} must exceed {previous}");
            previous = next;
        }
    }

    #[test]
    fn cursor_updates_touch_only_the_sender() {
        let registry = registry();
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("s1");
        registry
            .join_workflow("s2", &principal("u2"), "wf-1", WorkspaceRole::Edit)
            .expect("s2");

        let (workflow_id, updated) = registry
            .update_cursor("s1", CursorPosition { x: 7.0, y: 9.0 })
            .expect("cursor update");
        assert_eq!(workflow_id, "wf-1");
        assert_eq!(updated.cursor, Some(CursorPosition { x: 7.0, y: 9.0 }));

        let snapshot = registry.presence_snapshot("wf-1");
        let other = snapshot
            .iter()
            .find(|presence| presence.socket_id == "s2")
            .expect("s2 present");
        assert!(other.cursor.is_none());
    }

    #[test]
    fn repeated_cursor_updates_keep_only_the_latest() {
        let registry = registry();
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("join");

        registry
            .update_cursor("s1", CursorPosition { x: 1.0, y: 1.0 })
            .expect("first");
        registry
            .update_cursor("s1", CursorPosition { x: 2.0, y: 2.0 })
            .expect("second");

        let snapshot = registry.presence_snapshot("wf-1");
        assert_eq!(
            snapshot[0].cursor,
            Some(CursorPosition { x: 2.0, y: 2.0 })
        );
    }

    #[test]
    fn removing_a_room_tombstones_it() {
        let registry = registry();
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("join");

        let evicted = registry.remove_workflow_room("wf-1");
        assert_eq!(evicted, vec!["s1".to_string()]);
        assert!(registry.current_workflow("s1").is_none());
        assert_eq!(registry.workflow_room_count(), 0);

        let denied = registry
            .join_workflow("s2", &principal("u2"), "wf-1", WorkspaceRole::Edit)
            .expect_err("tombstoned");
        assert_eq!(denied, JoinDenied::Tombstoned);
    }

    #[test]
    fn tombstones_expire() {
        let registry = RoomRegistry::new(Duration::from_millis(0));
        registry.remove_workflow_room("wf-1");
        // Zero TTL: the next check observes the tombstone as already expired.
        assert!(!registry.is_tombstoned("wf-1"));
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("join after expiry");
    }

    #[test]
    fn workspace_rooms_track_membership_without_presence() {
        let registry = registry();
        assert!(
            registry
                .join_workspace("s1", &principal("u1"), "ws-1", WorkspaceRole::Edit)
                .is_none()
        );
        assert!(
            registry
                .join_workspace("s2", &principal("u2"), "ws-1", WorkspaceRole::Read)
                .is_none()
        );
        assert_eq!(registry.workspace_sockets("ws-1").len(), 2);
        assert_eq!(registry.total_connections(), 2);
        assert_eq!(registry.user_sockets_in_workspace("u1", "ws-1"), vec!["s1"]);

        // Switching workspaces leaves the previous room implicitly.
        let previous = registry
            .join_workspace("s1", &principal("u1"), "ws-2", WorkspaceRole::Edit)
            .expect("implicit leave");
        assert_eq!(previous.workspace_id, "ws-1");
        assert!(!previous.destroyed);

        let leave = registry.leave_workspace("s2").expect("leave");
        assert!(leave.destroyed);
        assert_eq!(registry.workspace_room_count(), 1);
    }

    #[test]
    fn disconnect_cleans_both_rooms() {
        let registry = registry();
        registry.join_workspace("s1", &principal("u1"), "ws-1", WorkspaceRole::Edit);
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("join workflow");

        let cleanup = registry.disconnect("s1");
        assert!(cleanup.workflow.expect("workflow leave").destroyed);
        assert!(cleanup.workspace.expect("workspace leave").destroyed);
        assert_eq!(registry.total_connections(), 0);
        assert_eq!(registry.workflow_room_count(), 0);
    }

    #[test]
    fn role_updates_propagate_to_presences() {
        let registry = registry();
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("s1");
        registry
            .join_workflow("s2", &principal("u2"), "wf-1", WorkspaceRole::Edit)
            .expect("s2");

        let (workflow_id, snapshot) = registry
            .set_presence_role("s1", WorkspaceRole::Read)
            .expect("role update");
        assert_eq!(workflow_id, "wf-1");
        let updated = snapshot
            .iter()
            .find(|p| p.socket_id == "s1")
            .expect("s1 present");
        assert_eq!(updated.role, WorkspaceRole::Read);
        let untouched = snapshot
            .iter()
            .find(|p| p.socket_id == "s2")
            .expect("s2 present");
        assert_eq!(untouched.role, WorkspaceRole::Edit);
    }

    #[test]
    fn op_lock_survives_room_destruction() {
        let registry = registry();
        registry
            .join_workflow("s1", &principal("u1"), "wf-1", WorkspaceRole::Edit)
            .expect("join");
        let lock = registry.op_lock("wf-1").expect("lock");

        registry.leave_workflow("s1").expect("leave");
        assert_eq!(registry.workflow_room_count(), 0);

        // An in-flight operation keeps the serialization point alive past
        // the last leave.
        assert!(lock.try_lock().is_ok());
    }
}
