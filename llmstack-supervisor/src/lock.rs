use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fd_lock::{RwLock, RwLockWriteGuard};

use crate::config::ServiceKind;
use crate::error::{Result, SupervisorError};

/// Exclusive per-service lock file in the state directory.
///
/// Serializes lifecycle operations across separate invocations of the tool;
/// a held lock turns into [`SupervisorError::Busy`] instead of waiting.
pub struct ServiceLock {
    service: ServiceKind,
    path: PathBuf,
    lock: RwLock<File>,
}

impl ServiceLock {
    pub fn open(state_dir: &Path, service: ServiceKind) -> Result<Self> {
        let path = state_dir.join(format!("{service}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SupervisorError::io(&path, e))?;
        Ok(Self {
            service,
            path,
            lock: RwLock::new(file),
        })
    }

    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        match self.lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(SupervisorError::Busy {
                service: self.service,
            }),
            Err(e) => Err(SupervisorError::io(&self.path, e)),
        }
    }
}
