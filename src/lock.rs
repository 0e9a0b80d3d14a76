//! Advisory file locking for the metadata file.
//!
//! One exclusive holder may mutate a store; any number of shared holders may
//! read it. Locks are taken on a cloned descriptor so the lock lifetime is
//! tied to this handle, not to every descriptor of the file.

use std::fs::File;

use fs2::FileExt;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct FileLock {
    file: File,
    mode: LockMode,
}

impl FileLock {
    /// Block until a lock of the requested mode is granted.
    pub fn acquire(file: &File, mode: LockMode) -> Result<Self> {
        let handle = file.try_clone()?;
        match mode {
            LockMode::Shared => handle.lock_shared()?,
            LockMode::Exclusive => handle.lock_exclusive()?,
        }
        Ok(Self { file: handle, mode })
    }

    /// Attempt an exclusive lock without blocking. Returns `None` when another
    /// process already holds the store.
    pub fn try_acquire_exclusive(file: &File) -> Result<Option<Self>> {
        let handle = file.try_clone()?;
        match handle.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file: handle,
                mode: LockMode::Exclusive,
            })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Trade a shared lock for an exclusive one. Fails without blocking if a
    /// writer already exists; the shared lock is re-taken in that case so the
    /// handle never ends up unlocked.
    pub fn upgrade_to_exclusive(&mut self) -> Result<()> {
        if self.mode == LockMode::Exclusive {
            return Ok(());
        }
        self.file.unlock()?;
        if let Err(err) = self.file.try_lock_exclusive() {
            let _ = self.file.lock_shared();
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(StoreError::Lock(
                    "exclusive access unavailable; another process holds the store".into(),
                ));
            }
            return Err(err.into());
        }
        self.mode = LockMode::Exclusive;
        Ok(())
    }

    pub fn downgrade_to_shared(&mut self) -> Result<()> {
        if self.mode == LockMode::Shared {
            return Ok(());
        }
        self.file.unlock()?;
        self.file.lock_shared()?;
        self.mode = LockMode::Shared;
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    #[test]
    fn exclusive_excludes_second_holder() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("lock.rvm");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .expect("open");

        let held = FileLock::acquire(&file, LockMode::Exclusive).expect("first lock");

        let second = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("reopen");
        assert!(
            FileLock::try_acquire_exclusive(&second)
                .expect("try lock")
                .is_none()
        );

        drop(held);
        assert!(
            FileLock::try_acquire_exclusive(&second)
                .expect("retry lock")
                .is_some()
        );
    }
}
