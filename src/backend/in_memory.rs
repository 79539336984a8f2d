//! In-memory platform
//!
//! Behaves like VirtualBox for the operations this tool uses, but keeps all
//! state in process. The session rules are enforced strictly so tests catch
//! leaked or missing locks, and individual operations can be made to fail.

use crate::backend::{Progress, VirtualBox};
use crate::error::{Error, Result};
use crate::types::{
    LaunchMode, LockType, MachineInfo, MachineState, SessionState, SnapshotId, SnapshotInfo,
    SnapshotNode,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Platform calls recorded by [`InMemoryVirtualBox`], in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    Lock(LockType),
    Unlock,
    Launch(LaunchMode),
    TakeSnapshot { name: String, description: String },
    DeleteSnapshot(SnapshotId),
    PowerDown,
}

/// A machine registered with the in-memory platform
#[derive(Debug, Clone)]
pub struct InMemoryMachine {
    pub name: String,
    pub id: String,
    pub state: MachineState,
    pub root: Option<SnapshotNode>,
    pub current: Option<SnapshotId>,
    timestamps: HashMap<SnapshotId, i64>,
}

impl InMemoryMachine {
    pub fn new(name: impl Into<String>, state: MachineState) -> Self {
        let name = name.into();
        Self {
            id: format!("{}-uuid", name),
            name,
            state,
            root: None,
            current: None,
            timestamps: HashMap::new(),
        }
    }

    /// Seed a linear chain of `count` snapshots, one minute apart.
    ///
    /// The first one is named after the machine, the rest `Snapshot <n>`;
    /// ids are `<machine>-snap-<n>` starting at 0.
    pub fn with_snapshots(mut self, count: usize) -> Self {
        for n in 0..count {
            let name = if n == 0 {
                self.name.clone()
            } else {
                format!("Snapshot {}", n)
            };
            let id = SnapshotId::new(format!("{}-snap-{}", self.name, n));
            self.append_snapshot(id, name, n as i64 * 60_000);
        }
        self
    }

    /// Ids of all snapshots in tree pre-order, root included
    pub fn snapshot_ids(&self) -> Vec<SnapshotId> {
        fn walk(node: &SnapshotNode, out: &mut Vec<SnapshotId>) {
            out.push(node.id.clone());
            for child in &node.children {
                walk(child, out);
            }
        }
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            walk(root, &mut out);
        }
        out
    }

    fn info(&self) -> MachineInfo {
        MachineInfo {
            name: self.name.clone(),
            id: self.id.clone(),
            state: self.state.clone(),
            snapshot_count: self.root.as_ref().map_or(0, SnapshotNode::len),
            settings_file: None,
        }
    }

    /// New snapshots become children of the current one
    fn append_snapshot(&mut self, id: SnapshotId, name: String, timestamp_ms: i64) {
        let node = SnapshotNode {
            id: id.clone(),
            name,
            children: Vec::new(),
        };
        let parent = match (&mut self.root, &self.current) {
            (Some(root), Some(current)) => find_mut(root, current),
            _ => None,
        };
        match parent {
            Some(parent) => parent.children.push(node),
            None => match &mut self.root {
                Some(root) => root.children.push(node),
                None => self.root = Some(node),
            },
        }
        self.timestamps.insert(id.clone(), timestamp_ms);
        self.current = Some(id);
    }

    /// Remove a snapshot, letting its only child take its place
    fn remove_snapshot(&mut self, id: &SnapshotId) -> Result<()> {
        let root = self
            .root
            .as_mut()
            .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))?;

        let successor = if &root.id == id {
            if root.children.len() > 1 {
                return Err(Error::operation(
                    "Delete snapshot",
                    format!("snapshot {} has more than one child", id),
                ));
            }
            let replacement = root.children.pop();
            let successor = replacement.as_ref().map(|r| r.id.clone());
            self.root = replacement;
            successor
        } else {
            let parent = find_parent_mut(root, id)
                .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))?;
            let index = parent
                .children
                .iter()
                .position(|c| &c.id == id)
                .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))?;
            if parent.children[index].children.len() > 1 {
                return Err(Error::operation(
                    "Delete snapshot",
                    format!("snapshot {} has more than one child", id),
                ));
            }
            let removed = parent.children.remove(index);
            for (offset, child) in removed.children.into_iter().enumerate() {
                parent.children.insert(index + offset, child);
            }
            Some(parent.id.clone())
        };

        self.timestamps.remove(id);
        if self.current.as_ref() == Some(id) {
            self.current = successor;
        }
        Ok(())
    }
}

fn find_mut<'a>(node: &'a mut SnapshotNode, id: &SnapshotId) -> Option<&'a mut SnapshotNode> {
    if &node.id == id {
        return Some(node);
    }
    node.children.iter_mut().find_map(|c| find_mut(c, id))
}

fn find_parent_mut<'a>(
    node: &'a mut SnapshotNode,
    id: &SnapshotId,
) -> Option<&'a mut SnapshotNode> {
    if node.children.iter().any(|c| &c.id == id) {
        return Some(node);
    }
    node.children.iter_mut().find_map(|c| find_parent_mut(c, id))
}

/// Progress handle whose outcome is decided when the operation starts
#[derive(Debug)]
pub struct InMemoryProgress {
    operation: String,
    failure: Option<String>,
}

impl InMemoryProgress {
    fn done(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            failure: None,
        }
    }

    fn failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            failure: Some(reason.into()),
        }
    }
}

impl Progress for InMemoryProgress {
    fn wait_for_completion(self, _timeout: Option<Duration>) -> Result<()> {
        match self.failure {
            None => Ok(()),
            Some(reason) => Err(Error::operation(self.operation, reason)),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    machines: Vec<InMemoryMachine>,
    session: SessionState,
    session_machine: Option<String>,
    calls: Vec<PlatformCall>,
    clock_ms: i64,
    next_id: usize,
    failing_deletes: HashSet<SnapshotId>,
    fail_take_snapshot: bool,
    fail_launch: bool,
}

impl Inner {
    fn machine_mut(&mut self, id: &str) -> Result<&mut InMemoryMachine> {
        self.machines
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::MachineNotFound(id.to_string()))
    }

    /// Check the session is locked on `machine`
    fn require_lock(&self, machine: &MachineInfo) -> Result<LockType> {
        match self.session {
            SessionState::Locked(lock)
                if self.session_machine.as_deref() == Some(machine.id.as_str()) =>
            {
                Ok(lock)
            }
            SessionState::Locked(_) => Err(Error::operation(
                "Session",
                format!("session is locked on another machine than '{}'", machine.name),
            )),
            SessionState::Unlocked => Err(Error::SessionNotLocked),
        }
    }
}

/// Deterministic in-process stand-in for VirtualBox
#[derive(Debug, Default)]
pub struct InMemoryVirtualBox {
    inner: RefCell<Inner>,
}

impl InMemoryVirtualBox {
    pub fn new(machines: Vec<InMemoryMachine>) -> Self {
        let inner = Inner {
            clock_ms: 1_000_000,
            machines,
            ..Inner::default()
        };
        Self {
            inner: RefCell::new(inner),
        }
    }

    /// Current copy of a machine by name
    pub fn machine(&self, name: &str) -> Option<InMemoryMachine> {
        self.inner
            .borrow()
            .machines
            .iter()
            .find(|m| m.name == name)
            .cloned()
    }

    /// Every platform call made so far
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.inner.borrow().calls.clone()
    }

    /// Deleting this snapshot will report failure when waited on
    pub fn fail_delete_of(&self, id: SnapshotId) {
        self.inner.borrow_mut().failing_deletes.insert(id);
    }

    pub fn fail_take_snapshot(&self) {
        self.inner.borrow_mut().fail_take_snapshot = true;
    }

    pub fn fail_launch(&self) {
        self.inner.borrow_mut().fail_launch = true;
    }
}

impl VirtualBox for InMemoryVirtualBox {
    type Progress = InMemoryProgress;

    fn find_machine(&self, name: &str) -> Result<MachineInfo> {
        self.inner
            .borrow()
            .machines
            .iter()
            .find(|m| m.name == name || m.id == name)
            .map(InMemoryMachine::info)
            .ok_or_else(|| Error::MachineNotFound(name.to_string()))
    }

    fn root_snapshot(&self, machine: &MachineInfo) -> Result<Option<SnapshotNode>> {
        let mut inner = self.inner.borrow_mut();
        Ok(inner.machine_mut(&machine.id)?.root.clone())
    }

    fn find_snapshot(&self, machine: &MachineInfo, id: &SnapshotId) -> Result<SnapshotInfo> {
        let mut inner = self.inner.borrow_mut();
        let m = inner.machine_mut(&machine.id)?;
        let node = m
            .root
            .as_ref()
            .and_then(|root| root.find(id))
            .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))?;
        Ok(SnapshotInfo {
            id: node.id.clone(),
            name: node.name.clone(),
            timestamp_ms: m.timestamps.get(id).copied().unwrap_or_default(),
        })
    }

    fn session_state(&self) -> SessionState {
        self.inner.borrow().session
    }

    fn lock_machine(&self, machine: &MachineInfo, lock_type: LockType) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if let SessionState::Locked(held) = inner.session {
            return Err(Error::SessionLocked(held));
        }
        let state = inner.machine_mut(&machine.id)?.state.clone();
        if lock_type == LockType::Write && state != MachineState::PoweredOff {
            return Err(Error::operation(
                "Lock machine",
                format!("machine '{}' is already locked by a session", machine.name),
            ));
        }
        inner.calls.push(PlatformCall::Lock(lock_type));
        inner.session = SessionState::Locked(lock_type);
        inner.session_machine = Some(machine.id.clone());
        Ok(())
    }

    fn unlock_machine(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.session.is_locked() {
            return Err(Error::SessionNotLocked);
        }
        inner.calls.push(PlatformCall::Unlock);
        inner.session = SessionState::Unlocked;
        inner.session_machine = None;
        Ok(())
    }

    fn launch_vm_process(&self, machine: &MachineInfo, mode: LaunchMode) -> Result<Self::Progress> {
        let mut inner = self.inner.borrow_mut();
        if let SessionState::Locked(held) = inner.session {
            return Err(Error::SessionLocked(held));
        }
        inner.calls.push(PlatformCall::Launch(mode));
        if inner.fail_launch {
            return Ok(InMemoryProgress::failed("Launch", "VM process exited"));
        }
        let m = inner.machine_mut(&machine.id)?;
        if m.state != MachineState::PoweredOff {
            return Err(Error::operation(
                "Launch",
                format!("machine '{}' is {}", machine.name, m.state),
            ));
        }
        m.state = MachineState::Running;
        inner.session = SessionState::Locked(LockType::Vm);
        inner.session_machine = Some(machine.id.clone());
        Ok(InMemoryProgress::done("Launch"))
    }

    fn take_snapshot(
        &self,
        machine: &MachineInfo,
        name: &str,
        description: &str,
        _live: bool,
    ) -> Result<Self::Progress> {
        let mut inner = self.inner.borrow_mut();
        inner.require_lock(machine)?;
        inner.calls.push(PlatformCall::TakeSnapshot {
            name: name.to_string(),
            description: description.to_string(),
        });
        if inner.fail_take_snapshot {
            return Err(Error::operation("Take snapshot", "not enough disk space"));
        }

        let id = SnapshotId::new(format!("{}-taken-{}", machine.name, inner.next_id));
        inner.next_id += 1;
        inner.clock_ms += 60_000;
        let now = inner.clock_ms;
        inner
            .machine_mut(&machine.id)?
            .append_snapshot(id, name.to_string(), now);
        Ok(InMemoryProgress::done("Take snapshot"))
    }

    fn delete_snapshot(&self, machine: &MachineInfo, id: &SnapshotId) -> Result<Self::Progress> {
        let mut inner = self.inner.borrow_mut();
        inner.require_lock(machine)?;
        inner.calls.push(PlatformCall::DeleteSnapshot(id.clone()));
        if inner.failing_deletes.contains(id) {
            return Ok(InMemoryProgress::failed(
                "Delete snapshot",
                format!("medium of snapshot {} is inaccessible", id),
            ));
        }
        inner.machine_mut(&machine.id)?.remove_snapshot(id)?;
        Ok(InMemoryProgress::done("Delete snapshot"))
    }

    fn power_down(&self, machine: &MachineInfo) -> Result<Self::Progress> {
        let mut inner = self.inner.borrow_mut();
        inner.require_lock(machine)?;
        inner.calls.push(PlatformCall::PowerDown);
        let m = inner.machine_mut(&machine.id)?;
        if m.state != MachineState::Running && m.state != MachineState::Paused {
            return Err(Error::operation(
                "Power down",
                format!("machine '{}' is {}", machine.name, m.state),
            ));
        }
        m.state = MachineState::PoweredOff;
        inner.session = SessionState::Unlocked;
        inner.session_machine = None;
        Ok(InMemoryProgress::done("Power down"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vbox() -> InMemoryVirtualBox {
        InMemoryVirtualBox::new(vec![
            InMemoryMachine::new("web", MachineState::PoweredOff).with_snapshots(3)
        ])
    }

    #[test]
    fn seeded_snapshots_form_a_chain() {
        let vbox = vbox();
        let machine = vbox.find_machine("web").unwrap();
        assert_eq!(machine.snapshot_count, 3);

        let root = vbox.root_snapshot(&machine).unwrap().unwrap();
        assert_eq!(root.name, "web");
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].children[0].name, "Snapshot 2");
    }

    #[test]
    fn double_lock_is_rejected() {
        let vbox = vbox();
        let machine = vbox.find_machine("web").unwrap();
        vbox.lock_machine(&machine, LockType::Shared).unwrap();
        assert!(matches!(
            vbox.lock_machine(&machine, LockType::Shared),
            Err(Error::SessionLocked(LockType::Shared))
        ));
        vbox.unlock_machine().unwrap();
        assert!(matches!(vbox.unlock_machine(), Err(Error::SessionNotLocked)));
    }

    #[test]
    fn write_lock_on_running_machine_fails() {
        let vbox = InMemoryVirtualBox::new(vec![InMemoryMachine::new("db", MachineState::Running)]);
        let machine = vbox.find_machine("db").unwrap();
        assert!(vbox.lock_machine(&machine, LockType::Write).is_err());
        assert_eq!(vbox.session_state(), SessionState::Unlocked);
    }

    #[test]
    fn snapshot_requires_lock() {
        let vbox = vbox();
        let machine = vbox.find_machine("web").unwrap();
        assert!(matches!(
            vbox.take_snapshot(&machine, "x", "y", false),
            Err(Error::SessionNotLocked)
        ));
    }

    #[test]
    fn deleting_middle_snapshot_reparents_child() {
        let vbox = vbox();
        let machine = vbox.find_machine("web").unwrap();
        vbox.lock_machine(&machine, LockType::Write).unwrap();
        vbox.delete_snapshot(&machine, &SnapshotId::new("web-snap-1"))
            .unwrap()
            .wait_for_completion(None)
            .unwrap();
        vbox.unlock_machine().unwrap();

        let ids = vbox.machine("web").unwrap().snapshot_ids();
        assert_eq!(
            ids,
            vec![SnapshotId::new("web-snap-0"), SnapshotId::new("web-snap-2")]
        );
    }

    #[test]
    fn launch_then_power_down_releases_session() {
        let vbox = vbox();
        let machine = vbox.find_machine("web").unwrap();
        vbox.launch_vm_process(&machine, LaunchMode::Headless)
            .unwrap()
            .wait_for_completion(None)
            .unwrap();
        assert_eq!(vbox.session_state(), SessionState::Locked(LockType::Vm));

        vbox.power_down(&machine).unwrap().wait_for_completion(None).unwrap();
        assert_eq!(vbox.session_state(), SessionState::Unlocked);
        assert_eq!(vbox.machine("web").unwrap().state, MachineState::PoweredOff);
    }
}
