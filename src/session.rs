//! Scoped session locking
//!
//! [`SessionLock`] is an RAII guard over the platform session: acquiring it
//! locks the machine, and the lock is released either explicitly through
//! [`SessionLock::release`] or when the guard goes out of scope.

use crate::backend::VirtualBox;
use crate::error::Result;
use crate::types::{LockType, MachineInfo};
use tracing::{debug, warn};

pub struct SessionLock<'a, V: VirtualBox + ?Sized> {
    vbox: &'a V,
    lock_type: LockType,
    held: bool,
}

impl<'a, V: VirtualBox + ?Sized> SessionLock<'a, V> {
    /// Lock `machine` through the platform session
    pub fn acquire(vbox: &'a V, machine: &MachineInfo, lock_type: LockType) -> Result<Self> {
        vbox.lock_machine(machine, lock_type)?;
        debug!(machine = %machine.name, lock = %lock_type, "session locked");
        Ok(Self {
            vbox,
            lock_type,
            held: true,
        })
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    /// Unlock now, reporting failure to the caller
    pub fn release(mut self) -> Result<()> {
        self.held = false;
        self.vbox.unlock_machine()?;
        debug!(lock = %self.lock_type, "session unlocked");
        Ok(())
    }
}

impl<V: VirtualBox + ?Sized> Drop for SessionLock<'_, V> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        match self.vbox.unlock_machine() {
            Ok(()) => debug!(lock = %self.lock_type, "session unlocked on drop"),
            Err(e) => warn!(lock = %self.lock_type, error = %e, "failed to unlock session"),
        }
    }
}

/// Release a lock left behind by an earlier step or process
pub fn release_stale_lock<V: VirtualBox + ?Sized>(vbox: &V) -> Result<()> {
    if vbox.session_state().is_locked() {
        debug!("releasing stale session lock");
        vbox.unlock_machine()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryMachine, InMemoryVirtualBox, PlatformCall};
    use crate::error::Error;
    use crate::types::{MachineState, SessionState};

    fn vbox() -> InMemoryVirtualBox {
        InMemoryVirtualBox::new(vec![InMemoryMachine::new("vm", MachineState::Running)])
    }

    #[test]
    fn release_unlocks_once() {
        let vbox = vbox();
        let machine = vbox.find_machine("vm").unwrap();

        let lock = SessionLock::acquire(&vbox, &machine, LockType::Shared).unwrap();
        assert_eq!(vbox.session_state(), SessionState::Locked(LockType::Shared));
        lock.release().unwrap();

        assert_eq!(vbox.session_state(), SessionState::Unlocked);
        assert_eq!(
            vbox.calls(),
            vec![PlatformCall::Lock(LockType::Shared), PlatformCall::Unlock]
        );
    }

    #[test]
    fn drop_unlocks_on_early_return() {
        fn fails_while_locked(vbox: &InMemoryVirtualBox) -> Result<()> {
            let machine = vbox.find_machine("vm")?;
            let _lock = SessionLock::acquire(vbox, &machine, LockType::Shared)?;
            Err(Error::operation("Take snapshot", "boom"))
        }

        let vbox = vbox();
        assert!(fails_while_locked(&vbox).is_err());
        assert_eq!(vbox.session_state(), SessionState::Unlocked);
    }

    #[test]
    fn failed_acquire_holds_nothing() {
        let vbox = vbox();
        let machine = vbox.find_machine("vm").unwrap();
        assert!(SessionLock::acquire(&vbox, &machine, LockType::Write).is_err());
        assert_eq!(vbox.session_state(), SessionState::Unlocked);
        assert!(vbox.calls().is_empty());
    }

    #[test]
    fn stale_lock_is_released() {
        let vbox = vbox();
        let machine = vbox.find_machine("vm").unwrap();
        vbox.lock_machine(&machine, LockType::Shared).unwrap();

        release_stale_lock(&vbox).unwrap();
        assert_eq!(vbox.session_state(), SessionState::Unlocked);
        release_stale_lock(&vbox).unwrap();
    }
}
