//! Snapshot rotation for a single machine
//!
//! [`Snapshotter::run`] performs the whole pipeline: take a snapshot
//! (starting the machine first when it is off), restore the power state,
//! prune the oldest snapshots beyond the retention count and print what is
//! left.

use crate::backend::{Progress, VirtualBox};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::output;
use crate::retention::RetentionPolicy;
use crate::session::{release_stale_lock, SessionLock};
use crate::tree::chronological_ids;
use crate::types::{LaunchMode, LockType, MachineInfo, SnapshotId};
use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

/// Result of a prune pass. Pruning never aborts the run.
#[derive(Debug)]
pub enum PruneOutcome {
    NothingToDelete,
    Deleted(Vec<SnapshotId>),
    Failed {
        deleted: Vec<SnapshotId>,
        /// Candidates not deleted, starting with the one that failed
        remaining: Vec<SnapshotId>,
        reason: Error,
    },
}

impl PruneOutcome {
    pub fn deleted(&self) -> &[SnapshotId] {
        match self {
            PruneOutcome::NothingToDelete => &[],
            PruneOutcome::Deleted(ids) => ids,
            PruneOutcome::Failed { deleted, .. } => deleted,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PruneOutcome::Failed { .. })
    }
}

/// What a run did
#[derive(Debug)]
pub struct RunSummary {
    pub machine: String,
    pub was_running: bool,
    pub prune: PruneOutcome,
}

/// Name and description for a new snapshot.
///
/// The first snapshot of a machine is named after it and serves as the
/// baseline the tree hangs off; later ones are named by time.
pub fn snapshot_label(machine: &MachineInfo, now: &DateTime<Local>) -> (String, String) {
    let stamp = output::format_local(now);
    let name = if machine.snapshot_count == 0 {
        machine.name.clone()
    } else {
        format!("Snapshot {}", stamp)
    };
    (name, format!("Created at {}", stamp))
}

pub struct Snapshotter<'a, V: VirtualBox> {
    vbox: &'a V,
    retention: RetentionPolicy,
    launch_mode: LaunchMode,
}

impl<'a, V: VirtualBox> Snapshotter<'a, V> {
    pub fn new(vbox: &'a V) -> Self {
        Self {
            vbox,
            retention: RetentionPolicy::default(),
            launch_mode: LaunchMode::default(),
        }
    }

    pub fn from_config(vbox: &'a V, config: &Config) -> Self {
        Self::new(vbox)
            .with_retention(config.retention)
            .with_launch_mode(config.launch_mode)
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_launch_mode(mut self, launch_mode: LaunchMode) -> Self {
        self.launch_mode = launch_mode;
        self
    }

    /// Snapshot, restore power, prune and report for the machine `name`
    pub fn run(&self, name: &str) -> Result<RunSummary> {
        let machine = self.vbox.find_machine(name)?;
        info!(machine = %machine.name, state = %machine.state, "machine resolved");

        let was_running = self.create_snapshot(&machine)?;
        if !was_running {
            self.power_down(&machine)?;
        }

        let prune = self.delete_snapshots(&machine);
        self.print_snapshots_info(&machine)?;

        Ok(RunSummary {
            machine: machine.name,
            was_running,
            prune,
        })
    }

    /// Take a snapshot, starting the machine first if it is powered off.
    ///
    /// Returns whether the machine was already running. When it was not, the
    /// machine is left running with the session holding the launch lock and
    /// the caller is expected to [`power_down`](Self::power_down) it.
    pub fn create_snapshot(&self, machine: &MachineInfo) -> Result<bool> {
        let was_running = !machine.is_powered_off();

        if !was_running {
            self.launch(machine)?;
        }

        let (name, description) = snapshot_label(machine, &Local::now());
        let taken = if was_running {
            self.take_snapshot_shared(machine, &name, &description)
        } else {
            self.take_snapshot(machine, &name, &description)
        };

        match taken {
            Ok(()) => {
                output::success(&format!("Created: {}", description));
                info!(machine = %machine.name, snapshot = %name, "snapshot taken");
                Ok(was_running)
            }
            Err(e) => {
                if !was_running {
                    // started by us, so stop it again before bailing out
                    if let Err(stop) = self.power_down(machine) {
                        warn!(
                            machine = %machine.name,
                            error = %stop,
                            "failed to power down after snapshot failure"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    fn launch(&self, machine: &MachineInfo) -> Result<()> {
        output::info(&format!("Starting '{}' ({})...", machine.name, self.launch_mode));
        release_stale_lock(self.vbox)?;

        let launched = self
            .vbox
            .launch_vm_process(machine, self.launch_mode)
            .and_then(|progress| progress.wait_for_completion(None));
        if let Err(e) = launched {
            if let Err(unlock) = release_stale_lock(self.vbox) {
                warn!(
                    machine = %machine.name,
                    error = %unlock,
                    "failed to release session after launch failure"
                );
            }
            return Err(e);
        }
        debug!(machine = %machine.name, "launched");
        Ok(())
    }

    fn take_snapshot(&self, machine: &MachineInfo, name: &str, description: &str) -> Result<()> {
        self.vbox
            .take_snapshot(machine, name, description, false)?
            .wait_for_completion(None)
    }

    fn take_snapshot_shared(
        &self,
        machine: &MachineInfo,
        name: &str,
        description: &str,
    ) -> Result<()> {
        release_stale_lock(self.vbox)?;
        let lock = SessionLock::acquire(self.vbox, machine, LockType::Shared)?;
        self.take_snapshot(machine, name, description)?;
        lock.release()
    }

    /// Power the machine off through the session that launched it
    pub fn power_down(&self, machine: &MachineInfo) -> Result<()> {
        output::info(&format!("Powering off '{}'...", machine.name));
        self.vbox.power_down(machine)?.wait_for_completion(None)?;
        info!(machine = %machine.name, "powered off");
        Ok(())
    }

    /// Chronological ids of the machine's snapshots, baseline excluded
    pub fn snapshot_ids(&self, machine: &MachineInfo) -> Result<Vec<SnapshotId>> {
        Ok(self
            .vbox
            .root_snapshot(machine)?
            .map(|root| chronological_ids(&root))
            .unwrap_or_default())
    }

    /// Delete the oldest snapshots beyond the retention count.
    ///
    /// Stops at the first failure; snapshots deleted before it stay deleted.
    pub fn delete_snapshots(&self, machine: &MachineInfo) -> PruneOutcome {
        let candidates = match self.snapshot_ids(machine) {
            Ok(ids) => self.retention.select_for_deletion(&ids).to_vec(),
            Err(reason) => return self.prune_failed(machine, Vec::new(), Vec::new(), reason),
        };
        if candidates.is_empty() {
            debug!(machine = %machine.name, keep = self.retention.keep, "nothing to prune");
            return PruneOutcome::NothingToDelete;
        }

        println!();
        output::info(&format!("Deleting {} snapshot(s):", candidates.len()));

        let mut deleted = Vec::with_capacity(candidates.len());
        match self.delete_all(machine, &candidates, &mut deleted) {
            Ok(()) => PruneOutcome::Deleted(deleted),
            Err(reason) => {
                let remaining = candidates[deleted.len()..].to_vec();
                self.prune_failed(machine, deleted, remaining, reason)
            }
        }
    }

    fn delete_all(
        &self,
        machine: &MachineInfo,
        candidates: &[SnapshotId],
        deleted: &mut Vec<SnapshotId>,
    ) -> Result<()> {
        // a write lock is only available while no VM process holds the machine
        let current = self.vbox.find_machine(&machine.id)?;
        let lock_type = if current.is_powered_off() {
            LockType::Write
        } else {
            LockType::Shared
        };

        let lock = SessionLock::acquire(self.vbox, &current, lock_type)?;
        for id in candidates {
            println!("-  {} {}", self.snapshot_to_string(&current, id)?, id);
            self.vbox
                .delete_snapshot(&current, id)?
                .wait_for_completion(None)?;
            deleted.push(id.clone());
        }
        debug!(machine = %current.name, lock = %lock.lock_type(), count = deleted.len(), "pruned");
        lock.release()
    }

    fn prune_failed(
        &self,
        machine: &MachineInfo,
        deleted: Vec<SnapshotId>,
        remaining: Vec<SnapshotId>,
        reason: Error,
    ) -> PruneOutcome {
        output::warn(&format!("Delete {} snapshots failed", machine.name));
        warn!(
            machine = %machine.name,
            deleted = deleted.len(),
            remaining = remaining.len(),
            error = %reason,
            "pruning abandoned"
        );
        PruneOutcome::Failed {
            deleted,
            remaining,
            reason,
        }
    }

    /// Name and local creation time of a snapshot
    pub fn snapshot_info(&self, machine: &MachineInfo, id: &SnapshotId) -> Result<(String, String)> {
        let snapshot = self.vbox.find_snapshot(machine, id)?;
        Ok((snapshot.name, output::format_timestamp(snapshot.timestamp_ms)))
    }

    pub fn snapshot_to_string(&self, machine: &MachineInfo, id: &SnapshotId) -> Result<String> {
        let (name, date) = self.snapshot_info(machine, id)?;
        Ok(format!("{}, {}", name, date))
    }

    /// Listing lines for the report; empty when only the baseline exists
    pub fn report_lines(&self, machine: &MachineInfo) -> Result<Vec<String>> {
        let current = self.vbox.find_machine(&machine.id)?;
        if current.snapshot_count <= 1 {
            return Ok(Vec::new());
        }
        let ids = self.snapshot_ids(&current)?;
        self.retention
            .reportable(&ids)
            .iter()
            .map(|id| self.snapshot_to_string(&current, id))
            .collect()
    }

    pub fn print_snapshots_info(&self, machine: &MachineInfo) -> Result<()> {
        let lines = self.report_lines(machine)?;
        if lines.is_empty() {
            return Ok(());
        }
        println!();
        output::info(&format!("{} snapshots:", machine.name));
        for line in lines {
            println!("{}", line);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MachineState;
    use chrono::TimeZone;

    fn machine(snapshot_count: usize) -> MachineInfo {
        MachineInfo {
            name: "ci-runner".to_string(),
            id: "ci-runner-uuid".to_string(),
            state: MachineState::Running,
            snapshot_count,
            settings_file: None,
        }
    }

    #[test]
    fn first_snapshot_is_named_after_machine() {
        let now = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let (name, description) = snapshot_label(&machine(0), &now);
        assert_eq!(name, "ci-runner");
        assert_eq!(description, "Created at 02-01-2024 03:04:05");
    }

    #[test]
    fn later_snapshots_are_named_by_time() {
        let now = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let (name, description) = snapshot_label(&machine(3), &now);
        assert_eq!(name, "Snapshot 02-01-2024 03:04:05");
        assert_eq!(description, "Created at 02-01-2024 03:04:05");
    }

    #[test]
    fn outcome_accessors() {
        let outcome = PruneOutcome::Failed {
            deleted: vec![SnapshotId::new("a")],
            remaining: vec![SnapshotId::new("b")],
            reason: Error::operation("Delete snapshot", "boom"),
        };
        assert!(outcome.is_failed());
        assert_eq!(outcome.deleted(), &[SnapshotId::new("a")]);
        assert!(PruneOutcome::NothingToDelete.deleted().is_empty());
    }
}
