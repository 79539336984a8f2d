//! Platform trait and implementations for vbox-snapshotter

mod in_memory;
mod vboxmanage;

pub use in_memory::{InMemoryMachine, InMemoryProgress, InMemoryVirtualBox, PlatformCall};
pub use vboxmanage::{ChildProgress, VBoxManageBackend, VBoxManageConfig};

use crate::error::Result;
use crate::types::{
    LaunchMode, LockType, MachineInfo, SessionState, SnapshotId, SnapshotInfo, SnapshotNode,
};
use std::time::Duration;

/// Handle to an asynchronous platform operation
pub trait Progress {
    /// Block until the operation finishes. `None` waits without limit.
    fn wait_for_completion(self, timeout: Option<Duration>) -> Result<()>;
}

/// Trait defining the slice of the virtualization platform this tool drives
///
/// A platform value owns exactly one session. Snapshot, delete and power-down
/// operations go through that session and require it to be locked.
pub trait VirtualBox {
    type Progress: Progress;

    // === Queries ===

    /// Look up a registered machine by name or UUID
    fn find_machine(&self, name: &str) -> Result<MachineInfo>;

    /// Root of the machine's snapshot tree, or `None` without snapshots
    fn root_snapshot(&self, machine: &MachineInfo) -> Result<Option<SnapshotNode>>;

    /// Resolve a snapshot id
    fn find_snapshot(&self, machine: &MachineInfo, id: &SnapshotId) -> Result<SnapshotInfo>;

    // === Session ===

    fn session_state(&self) -> SessionState;

    fn lock_machine(&self, machine: &MachineInfo, lock_type: LockType) -> Result<()>;

    fn unlock_machine(&self) -> Result<()>;

    // === Operations ===

    /// Start the machine; on success the session holds the `Vm` lock
    fn launch_vm_process(&self, machine: &MachineInfo, mode: LaunchMode) -> Result<Self::Progress>;

    fn take_snapshot(
        &self,
        machine: &MachineInfo,
        name: &str,
        description: &str,
        live: bool,
    ) -> Result<Self::Progress>;

    fn delete_snapshot(&self, machine: &MachineInfo, id: &SnapshotId) -> Result<Self::Progress>;

    /// Power the machine off through the session, which is then released
    fn power_down(&self, machine: &MachineInfo) -> Result<Self::Progress>;
}
