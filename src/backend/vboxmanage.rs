//! VBoxManage platform implementation
//!
//! Drives a local VirtualBox installation through the `VBoxManage` CLI.
//! Queries run to completion; long-running operations are spawned and
//! returned as [`ChildProgress`] handles.
//!
//! VBoxManage opens its own short-lived session for every command, so the
//! session kept here is bookkeeping: it enforces the same lock discipline
//! as the VirtualBox API without holding a lock on the host.

use crate::backend::{Progress, VirtualBox};
use crate::error::{Error, Result};
use crate::types::{
    LaunchMode, LockType, MachineInfo, MachineState, SessionState, SnapshotId, SnapshotInfo,
    SnapshotNode,
};
use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::Cell;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

static SNAPSHOT_ELEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<Snapshot\s[^>]*>").expect("static snapshot element pattern"));
static SNAPSHOT_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\buuid="\{?([0-9A-Fa-f-]+)\}?""#).expect("static uuid attribute pattern")
});
static SNAPSHOT_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\btimeStamp="([^"]+)""#).expect("static timeStamp attribute pattern")
});

/// Configuration for the VBoxManage backend
#[derive(Debug, Clone)]
pub struct VBoxManageConfig {
    /// Path to the VBoxManage executable
    pub executable: PathBuf,
}

impl Default for VBoxManageConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("VBoxManage"),
        }
    }
}

/// A spawned VBoxManage command
#[derive(Debug)]
pub struct ChildProgress {
    operation: String,
    command: String,
    child: Child,
}

impl ChildProgress {
    fn finish(&self, success: bool, stderr: &[u8]) -> Result<()> {
        if success {
            debug!(operation = %self.operation, "completed");
            Ok(())
        } else {
            Err(classify_error(
                &self.command,
                &String::from_utf8_lossy(stderr),
                &self.operation,
            ))
        }
    }

    /// Read stderr on its own thread so the child never blocks on a full pipe
    fn drain_stderr(&mut self) -> thread::JoinHandle<io::Result<Vec<u8>>> {
        let pipe = self.child.stderr.take();
        thread::spawn(move || {
            let mut stderr = Vec::new();
            if let Some(mut pipe) = pipe {
                pipe.read_to_end(&mut stderr)?;
            }
            Ok(stderr)
        })
    }
}

impl Progress for ChildProgress {
    fn wait_for_completion(mut self, timeout: Option<Duration>) -> Result<()> {
        let Some(timeout) = timeout else {
            let stderr = self.drain_stderr();
            let status = self.child.wait()?;
            let stderr = stderr
                .join()
                .map_err(|_| Error::operation(&self.operation, "stderr reader panicked"))??;
            return self.finish(status.success(), &stderr);
        };

        let stderr = self.drain_stderr();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                let stderr = stderr
                    .join()
                    .map_err(|_| Error::operation(&self.operation, "stderr reader panicked"))??;
                return self.finish(status.success(), &stderr);
            }
            if Instant::now() >= deadline {
                self.child.kill()?;
                self.child.wait()?;
                return Err(Error::Timeout {
                    operation: self.operation,
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// VirtualBox driven through the VBoxManage CLI
pub struct VBoxManageBackend {
    config: VBoxManageConfig,
    session: Cell<SessionState>,
}

impl VBoxManageBackend {
    /// Create a backend using `VBoxManage` from `PATH`
    pub fn new() -> Self {
        Self::with_config(VBoxManageConfig::default())
    }

    pub fn with_config(config: VBoxManageConfig) -> Self {
        Self {
            config,
            session: Cell::new(SessionState::Unlocked),
        }
    }

    fn cmd(&self) -> Command {
        Command::new(&self.config.executable)
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.config.executable.display(), args.join(" "))
    }

    /// Run a command to completion and return stdout
    fn run_command(&self, args: &[&str], subject: &str) -> Result<String> {
        let command = self.describe(args);
        debug!(%command, "running");
        let output = self.cmd().args(args).output()?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(classify_error(
                &command,
                &String::from_utf8_lossy(&output.stderr),
                subject,
            ))
        }
    }

    /// Start a long-running command without waiting for it
    fn spawn(&self, operation: &str, args: &[&str]) -> Result<ChildProgress> {
        let command = self.describe(args);
        debug!(%command, "spawning");
        let child = self
            .cmd()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        Ok(ChildProgress {
            operation: operation.to_string(),
            command,
            child,
        })
    }

    fn show_vm_info(&self, name: &str) -> Result<Vec<(String, String)>> {
        let output = self.run_command(&["showvminfo", name, "--machinereadable"], name)?;
        Ok(parse_machine_readable(&output))
    }

    fn require_lock(&self) -> Result<LockType> {
        match self.session.get() {
            SessionState::Locked(lock) => Ok(lock),
            SessionState::Unlocked => Err(Error::SessionNotLocked),
        }
    }
}

impl Default for VBoxManageBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBox for VBoxManageBackend {
    type Progress = ChildProgress;

    fn find_machine(&self, name: &str) -> Result<MachineInfo> {
        let pairs = self.show_vm_info(name)?;
        machine_from_pairs(&pairs)
    }

    fn root_snapshot(&self, machine: &MachineInfo) -> Result<Option<SnapshotNode>> {
        let pairs = self.show_vm_info(&machine.id)?;
        Ok(snapshot_tree_from_pairs(&pairs))
    }

    fn find_snapshot(&self, machine: &MachineInfo, id: &SnapshotId) -> Result<SnapshotInfo> {
        let pairs = self.show_vm_info(&machine.id)?;
        let name = snapshot_tree_from_pairs(&pairs)
            .as_ref()
            .and_then(|root| root.find(id))
            .map(|node| node.name.clone())
            .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))?;

        let settings_file = machine_from_pairs(&pairs)?
            .settings_file
            .ok_or_else(|| Error::Parse(format!("no CfgFile reported for '{}'", machine.name)))?;
        let timestamps = snapshot_timestamps(&fs::read_to_string(&settings_file)?)?;
        let key = SnapshotId::new(id.as_str().to_lowercase());
        let timestamp_ms = timestamps.get(&key).copied().ok_or_else(|| {
            Error::Parse(format!(
                "snapshot {} has no timeStamp in {}",
                id,
                settings_file.display()
            ))
        })?;

        Ok(SnapshotInfo {
            id: id.clone(),
            name,
            timestamp_ms,
        })
    }

    fn session_state(&self) -> SessionState {
        self.session.get()
    }

    fn lock_machine(&self, machine: &MachineInfo, lock_type: LockType) -> Result<()> {
        if let SessionState::Locked(held) = self.session.get() {
            return Err(Error::SessionLocked(held));
        }
        debug!(machine = %machine.name, lock = %lock_type, "lock");
        self.session.set(SessionState::Locked(lock_type));
        Ok(())
    }

    fn unlock_machine(&self) -> Result<()> {
        self.require_lock()?;
        self.session.set(SessionState::Unlocked);
        Ok(())
    }

    fn launch_vm_process(&self, machine: &MachineInfo, mode: LaunchMode) -> Result<Self::Progress> {
        if let SessionState::Locked(held) = self.session.get() {
            return Err(Error::SessionLocked(held));
        }
        let progress = self.spawn(
            "Launch",
            &["startvm", &machine.id, "--type", mode.as_str()],
        )?;
        self.session.set(SessionState::Locked(LockType::Vm));
        Ok(progress)
    }

    fn take_snapshot(
        &self,
        machine: &MachineInfo,
        name: &str,
        description: &str,
        live: bool,
    ) -> Result<Self::Progress> {
        self.require_lock()?;
        let mut args = vec![
            "snapshot",
            machine.id.as_str(),
            "take",
            name,
            "--description",
            description,
        ];
        if live {
            args.push("--live");
        }
        self.spawn("Take snapshot", &args)
    }

    fn delete_snapshot(&self, machine: &MachineInfo, id: &SnapshotId) -> Result<Self::Progress> {
        self.require_lock()?;
        self.spawn(
            "Delete snapshot",
            &["snapshot", &machine.id, "delete", id.as_str()],
        )
    }

    fn power_down(&self, machine: &MachineInfo) -> Result<Self::Progress> {
        self.require_lock()?;
        let progress = self.spawn("Power down", &["controlvm", &machine.id, "poweroff"])?;
        self.session.set(SessionState::Unlocked);
        Ok(progress)
    }
}

/// Map VBoxManage's stderr onto an error variant
fn classify_error(command: &str, stderr: &str, subject: &str) -> Error {
    if stderr.contains("Could not find a registered machine named") {
        return Error::MachineNotFound(subject.to_string());
    }
    if stderr.contains("Could not find a snapshot") {
        return Error::SnapshotNotFound(subject.to_string());
    }
    Error::CommandFailed {
        command: command.to_string(),
        stderr: stderr.trim().to_string(),
    }
}

/// Parse `key="value"` lines from `--machinereadable` output.
///
/// A quoted value may span several lines; its continuation lines are
/// skipped whatever they look like, until the closing quote.
pub(crate) fn parse_machine_readable(output: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut in_value = false;
    for line in output.lines() {
        if in_value {
            in_value = !closes_quote(line);
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().trim_matches('"');
        if key.is_empty() || key.contains(char::is_whitespace) {
            continue;
        }
        let value = value.trim();
        if let Some(rest) = value.strip_prefix('"') {
            in_value = !closes_quote(rest);
        }
        pairs.push((key.to_string(), value.trim_matches('"').to_string()));
    }
    pairs
}

/// Whether `text` ends in a quote that is not escaped with a backslash
fn closes_quote(text: &str) -> bool {
    let Some(body) = text.trim_end().strip_suffix('"') else {
        return false;
    };
    let backslashes = body.chars().rev().take_while(|&c| c == '\\').count();
    backslashes % 2 == 0
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

pub(crate) fn machine_from_pairs(pairs: &[(String, String)]) -> Result<MachineInfo> {
    let required = |key: &str| {
        lookup(pairs, key).ok_or_else(|| Error::Parse(format!("showvminfo output lacks '{}'", key)))
    };

    let state = required("VMState")?
        .parse::<MachineState>()
        .map_err(Error::Parse)?;
    Ok(MachineInfo {
        name: required("name")?.to_string(),
        id: required("UUID")?.to_string(),
        state,
        snapshot_count: pairs
            .iter()
            .filter(|(k, _)| k.starts_with("SnapshotUUID"))
            .count(),
        settings_file: lookup(pairs, "CfgFile").map(PathBuf::from),
    })
}

/// Rebuild the snapshot tree from `SnapshotName<path>`/`SnapshotUUID<path>`
/// keys, where the root's path is empty and its descendants' are `-1`,
/// `-1-2`, and so on.
pub(crate) fn snapshot_tree_from_pairs(pairs: &[(String, String)]) -> Option<SnapshotNode> {
    let mut names: HashMap<&str, &str> = HashMap::new();
    let mut ids: HashMap<&str, &str> = HashMap::new();
    for (key, value) in pairs {
        if let Some(path) = key.strip_prefix("SnapshotName") {
            names.insert(path, value);
        } else if let Some(path) = key.strip_prefix("SnapshotUUID") {
            ids.insert(path, value);
        }
    }

    fn build(
        path: &str,
        names: &HashMap<&str, &str>,
        ids: &HashMap<&str, &str>,
    ) -> Option<SnapshotNode> {
        let id = ids.get(path)?;
        let name = names.get(path).copied().unwrap_or_default();
        let children = (1..)
            .map(|n| format!("{}-{}", path, n))
            .map_while(|child| build(&child, names, ids))
            .collect();
        Some(SnapshotNode::new(*id, name).with_children(children))
    }

    build("", &names, &ids)
}

/// Collect `timeStamp` attributes of `<Snapshot>` elements in a settings file
pub(crate) fn snapshot_timestamps(settings: &str) -> Result<HashMap<SnapshotId, i64>> {
    let mut timestamps = HashMap::new();
    for tag in SNAPSHOT_ELEMENT.find_iter(settings).map(|m| m.as_str()) {
        let (Some(id), Some(time)) = (SNAPSHOT_UUID.captures(tag), SNAPSHOT_TIMESTAMP.captures(tag))
        else {
            continue;
        };
        let parsed = DateTime::parse_from_rfc3339(&time[1])
            .map_err(|e| Error::Parse(format!("bad timeStamp '{}': {}", &time[1], e)))?;
        timestamps.insert(
            SnapshotId::new(id[1].to_lowercase()),
            parsed.timestamp_millis(),
        );
    }
    Ok(timestamps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOWVMINFO: &str = r#"name="build-box"
groups="/"
ostype="Ubuntu (64-bit)"
UUID="0b9a2d4e-1111-2222-3333-444455556666"
CfgFile="/home/ci/VirtualBox VMs/build-box/build-box.vbox"
VMState="poweroff"
VMStateChangeTime="2024-05-01T10:00:00.000000000"
"SATA-0-0"="/home/ci/disk.vdi"
SnapshotName="build-box"
SnapshotUUID="aaaaaaaa-0000-0000-0000-000000000001"
SnapshotDescription="Created at 01-05-2024 10:00:00"
SnapshotName-1="Snapshot 02-05-2024 10:00:00"
SnapshotUUID-1="aaaaaaaa-0000-0000-0000-000000000002"
SnapshotDescription-1="first line
second line"
SnapshotName-1-1="Snapshot 03-05-2024 10:00:00"
SnapshotUUID-1-1="aaaaaaaa-0000-0000-0000-000000000003"
SnapshotName-1-2="Branch"
SnapshotUUID-1-2="aaaaaaaa-0000-0000-0000-000000000004"
CurrentSnapshotName="Snapshot 03-05-2024 10:00:00"
CurrentSnapshotUUID="aaaaaaaa-0000-0000-0000-000000000003"
CurrentSnapshotNode="SnapshotName-1-1"
"#;

    #[test]
    fn parses_machine() {
        let pairs = parse_machine_readable(SHOWVMINFO);
        let machine = machine_from_pairs(&pairs).unwrap();

        assert_eq!(machine.name, "build-box");
        assert_eq!(machine.id, "0b9a2d4e-1111-2222-3333-444455556666");
        assert_eq!(machine.state, MachineState::PoweredOff);
        assert_eq!(machine.snapshot_count, 4);
        assert_eq!(
            machine.settings_file,
            Some(PathBuf::from("/home/ci/VirtualBox VMs/build-box/build-box.vbox"))
        );
    }

    #[test]
    fn quoted_keys_and_continuations() {
        let pairs = parse_machine_readable(SHOWVMINFO);
        assert_eq!(lookup(&pairs, "SATA-0-0"), Some("/home/ci/disk.vdi"));
        assert!(pairs.iter().all(|(k, _)| k != "second line"));
    }

    #[test]
    fn key_shaped_description_lines_are_not_keys() {
        let output = r#"name="vm"
UUID="vm-uuid"
VMState="running"
SnapshotName="vm"
SnapshotUUID="aaaaaaaa-0000-0000-0000-000000000001"
SnapshotDescription="notes
SnapshotUUID-9=\"x\"
SnapshotName-9=plain
end of notes"
SnapshotName-1="later"
SnapshotUUID-1="aaaaaaaa-0000-0000-0000-000000000002"
"#;
        let pairs = parse_machine_readable(output);

        assert!(pairs.iter().all(|(k, _)| !k.ends_with("-9")));
        assert_eq!(machine_from_pairs(&pairs).unwrap().snapshot_count, 2);
        let root = snapshot_tree_from_pairs(&pairs).unwrap();
        assert_eq!(root.len(), 2);
        assert_eq!(root.children[0].name, "later");
    }

    #[test]
    fn escaped_quotes_do_not_close_values() {
        assert!(closes_quote(r#"done""#));
        assert!(!closes_quote(r#"said \""#));
        assert!(closes_quote(r#"path\\""#));
        assert!(!closes_quote("open"));
    }

    #[test]
    fn missing_state_is_parse_error() {
        let pairs = parse_machine_readable("name=\"x\"\nUUID=\"y\"\n");
        assert!(matches!(machine_from_pairs(&pairs), Err(Error::Parse(_))));
    }

    #[test]
    fn rebuilds_snapshot_tree() {
        let pairs = parse_machine_readable(SHOWVMINFO);
        let root = snapshot_tree_from_pairs(&pairs).unwrap();

        assert_eq!(root.name, "build-box");
        assert_eq!(root.children.len(), 1);
        let child = &root.children[0];
        assert_eq!(child.id.as_str(), "aaaaaaaa-0000-0000-0000-000000000002");
        let grandchildren: Vec<&str> = child.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(grandchildren, vec!["Snapshot 03-05-2024 10:00:00", "Branch"]);
    }

    #[test]
    fn no_snapshots_no_tree() {
        let pairs = parse_machine_readable("name=\"x\"\nUUID=\"y\"\nVMState=\"running\"\n");
        assert!(snapshot_tree_from_pairs(&pairs).is_none());
        assert_eq!(machine_from_pairs(&pairs).unwrap().snapshot_count, 0);
    }

    #[test]
    fn reads_timestamps_from_settings() {
        let settings = r#"<?xml version="1.0"?>
<VirtualBox xmlns="http://www.virtualbox.org/" version="1.19-linux">
  <Machine uuid="{0b9a2d4e-1111-2222-3333-444455556666}" name="build-box" currentSnapshot="{aaaaaaaa-0000-0000-0000-000000000002}">
    <Snapshot uuid="{AAAAAAAA-0000-0000-0000-000000000001}" name="build-box" timeStamp="1970-01-01T00:00:01Z">
      <Snapshots>
        <Snapshot uuid="{aaaaaaaa-0000-0000-0000-000000000002}" name="Snapshot" timeStamp="2024-05-02T10:00:00Z" stateFile="x.sav">
        </Snapshot>
      </Snapshots>
    </Snapshot>
  </Machine>
</VirtualBox>
"#;
        let stamps = snapshot_timestamps(settings).unwrap();

        assert_eq!(stamps.len(), 2);
        assert_eq!(
            stamps[&SnapshotId::new("aaaaaaaa-0000-0000-0000-000000000001")],
            1_000
        );
        assert_eq!(
            stamps[&SnapshotId::new("aaaaaaaa-0000-0000-0000-000000000002")],
            1_714_644_000_000
        );
    }

    #[test]
    fn classifies_not_found() {
        let err = classify_error(
            "VBoxManage showvminfo ghost",
            "VBoxManage: error: Could not find a registered machine named 'ghost'\n",
            "ghost",
        );
        assert!(matches!(err, Error::MachineNotFound(name) if name == "ghost"));

        let err = classify_error("VBoxManage x", "VBoxManage: error: Bad things", "vm");
        assert!(matches!(err, Error::CommandFailed { stderr, .. } if stderr == "VBoxManage: error: Bad things"));
    }

    #[test]
    fn session_bookkeeping() {
        let backend = VBoxManageBackend::new();
        let machine = MachineInfo {
            name: "vm".to_string(),
            id: "vm-uuid".to_string(),
            state: MachineState::Running,
            snapshot_count: 0,
            settings_file: None,
        };

        assert!(matches!(
            backend.delete_snapshot(&machine, &SnapshotId::new("x")),
            Err(Error::SessionNotLocked)
        ));
        backend.lock_machine(&machine, LockType::Shared).unwrap();
        assert!(matches!(
            backend.lock_machine(&machine, LockType::Shared),
            Err(Error::SessionLocked(LockType::Shared))
        ));
        backend.unlock_machine().unwrap();
        assert!(matches!(backend.unlock_machine(), Err(Error::SessionNotLocked)));
    }
}
