//! Core types for machines, sessions and snapshots

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Power state of a machine as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MachineState {
    PoweredOff,
    Running,
    Paused,
    Saved,
    Aborted,
    Starting,
    Stopping,
    Other(String),
}

impl MachineState {
    /// Get the state name as VBoxManage prints it
    pub fn as_str(&self) -> &str {
        match self {
            MachineState::PoweredOff => "poweroff",
            MachineState::Running => "running",
            MachineState::Paused => "paused",
            MachineState::Saved => "saved",
            MachineState::Aborted => "aborted",
            MachineState::Starting => "starting",
            MachineState::Stopping => "stopping",
            MachineState::Other(s) => s,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MachineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s.to_lowercase().as_str() {
            "poweroff" | "poweredoff" => MachineState::PoweredOff,
            "running" => MachineState::Running,
            "paused" => MachineState::Paused,
            "saved" => MachineState::Saved,
            "aborted" => MachineState::Aborted,
            "starting" => MachineState::Starting,
            "stopping" => MachineState::Stopping,
            "" => return Err("Machine state cannot be empty".to_string()),
            other => MachineState::Other(other.to_string()),
        };
        Ok(state)
    }
}

/// Kind of lock a session holds on a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Shared access, used to snapshot a machine that is already running
    Shared,
    /// Exclusive write access, used to delete snapshots
    Write,
    /// Held by the session that launched the VM process
    Vm,
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::Shared => "shared",
            LockType::Write => "write",
            LockType::Vm => "vm",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State of this process's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Unlocked,
    Locked(LockType),
}

impl SessionState {
    pub fn is_locked(&self) -> bool {
        matches!(self, SessionState::Locked(_))
    }
}

/// How a powered-off machine gets started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    #[default]
    Headless,
    Gui,
    Separate,
}

impl LaunchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::Headless => "headless",
            LaunchMode::Gui => "gui",
            LaunchMode::Separate => "separate",
        }
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LaunchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "headless" => Ok(LaunchMode::Headless),
            "gui" => Ok(LaunchMode::Gui),
            "separate" => Ok(LaunchMode::Separate),
            _ => Err(format!(
                "Invalid launch mode '{}'. Must be headless, gui, or separate",
                s
            )),
        }
    }
}

/// Opaque snapshot identifier (a UUID for VirtualBox)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        SnapshotId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a machine's properties at lookup time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub name: String,
    pub id: String,
    pub state: MachineState,
    pub snapshot_count: usize,
    pub settings_file: Option<PathBuf>,
}

impl MachineInfo {
    pub fn is_powered_off(&self) -> bool {
        self.state == MachineState::PoweredOff
    }
}

/// A resolved snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub name: String,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

/// A node of a machine's snapshot tree, children in creation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNode {
    pub id: SnapshotId,
    pub name: String,
    pub children: Vec<SnapshotNode>,
}

impl SnapshotNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        SnapshotNode {
            id: SnapshotId::new(id),
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<SnapshotNode>) -> Self {
        self.children = children;
        self
    }

    /// Find a node by id anywhere below (and including) this one
    pub fn find(&self, id: &SnapshotId) -> Option<&SnapshotNode> {
        if &self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Number of nodes in this subtree, including this one
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(SnapshotNode::len).sum::<usize>()
    }
}
