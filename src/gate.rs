//! Single-permit access to the serial link.
//!
//! The poll loop and every interactive request share one [`DeviceGate`]. The
//! permit is released when the closure returns, on every path. A fatal error
//! closes the transport; reopening is left to the caller.
//!
//! Threads of one process queue on the mutex. Separate processes using the
//! same tty (the daemon and a one-shot command) queue on a [`LinkLock`], an
//! advisory `flock` on a file named after the device.

use crate::device::{DeviceError, DeviceProtocol};
use fs4::fs_std::FileExt;
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Cross-process lock file for one serial device.
#[derive(Debug, Clone)]
pub struct LinkLock {
    path: PathBuf,
}

/// Held lock; dropping the file releases it.
struct LinkLockGuard {
    _file: File,
}

impl LinkLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LinkLock { path: path.into() }
    }

    /// `<lock_dir>/pellet-telemetry.<tty name>.lock`, e.g.
    /// `/run/lock/pellet-telemetry.ttyUSB0.lock` for `/dev/ttyUSB0`.
    pub fn for_device(lock_dir: impl AsRef<Path>, tty_device: &str) -> Self {
        let name: String = tty_device
            .trim_start_matches("/dev/")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        LinkLock::new(lock_dir.as_ref().join(format!("pellet-telemetry.{}.lock", name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until no other holder of this lock file remains.
    fn acquire(&self) -> Result<LinkLockGuard, DeviceError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|e| DeviceError::Transport(format!("opening lock {} failed: {}", self.path.display(), e)))?;
        file.lock_exclusive()
            .map_err(|e| DeviceError::Transport(format!("locking {} failed: {}", self.path.display(), e)))?;
        debug!("Acquired link lock {}", self.path.display());
        Ok(LinkLockGuard { _file: file })
    }
}

pub struct DeviceGate<D> {
    device: Mutex<D>,
    link_lock: Option<LinkLock>,
}

impl<D: DeviceProtocol> DeviceGate<D> {
    /// Gate for a device no other process talks to.
    pub fn new(device: D) -> Self {
        DeviceGate {
            device: Mutex::new(device),
            link_lock: None,
        }
    }

    /// Gate whose permit also holds `lock` for the duration of each access.
    pub fn with_link_lock(device: D, lock: LinkLock) -> Self {
        DeviceGate {
            device: Mutex::new(device),
            link_lock: Some(lock),
        }
    }

    fn lock_link(&self) -> Result<Option<LinkLockGuard>, DeviceError> {
        self.link_lock.as_ref().map(LinkLock::acquire).transpose()
    }

    fn acquire(&self) -> MutexGuard<'_, D> {
        // A panic while holding the permit leaves the device in an unknown
        // protocol state; close it so the next holder starts from `open`.
        self.device.lock().unwrap_or_else(|poisoned| {
            let mut guard = poisoned.into_inner();
            guard.close();
            guard
        })
    }

    /// Runs `f` while holding the sole permit. Blocks until the permit is free.
    pub fn with_exclusive_access<T, F>(&self, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce(&mut D) -> Result<T, DeviceError>,
    {
        let mut device = self.acquire();
        let _link = self.lock_link()?;
        let result = f(&mut device);
        if let Err(e) = &result
            && e.is_fatal()
        {
            warn!("Device gate: {}; closing transport", e);
            device.close();
        }
        result
    }

    pub fn is_open(&self) -> bool {
        self.acquire().is_open()
    }

    /// Close and open the transport under the permit.
    pub fn reopen(&self) -> Result<(), DeviceError> {
        let mut device = self.acquire();
        let _link = self.lock_link()?;
        device.close();
        device.open()
    }

    pub fn close(&self) {
        self.acquire().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn scratch_lock(name: &str) -> LinkLock {
        LinkLock::new(std::env::temp_dir().join(format!("pellet-telemetry-{}-{}.lock", name, std::process::id())))
    }

    #[test]
    fn fatal_error_closes_transport_and_does_not_reopen() {
        let mut dev = FakeDevice::default();
        dev.open().expect("open");
        let gate = DeviceGate::new(dev);

        let err = gate
            .with_exclusive_access(|_| -> Result<(), DeviceError> { Err(DeviceError::Transport("broken pipe".into())) })
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(!gate.is_open());

        gate.reopen().expect("reopen");
        assert!(gate.is_open());
    }

    #[test]
    fn warnings_keep_transport_open() {
        let mut dev = FakeDevice::default();
        dev.open().expect("open");
        let gate = DeviceGate::new(dev);

        let _ = gate.with_exclusive_access(|_| -> Result<(), DeviceError> {
            Err(DeviceError::Warning { code: 1, message: "range".into() })
        });
        assert!(gate.is_open());
    }

    #[test]
    fn holders_never_overlap() {
        let gate = Arc::new(DeviceGate::new(FakeDevice::default()));
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (gate, inside, overlaps) = (gate.clone(), inside.clone(), overlaps.clone());
                thread::spawn(move || {
                    for _ in 0..50 {
                        gate.with_exclusive_access(|_| {
                            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .expect("no error");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread");
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lock_path_is_named_after_the_tty() {
        let lock = LinkLock::for_device("/run/lock", "/dev/ttyUSB0");
        assert_eq!(lock.path(), Path::new("/run/lock/pellet-telemetry.ttyUSB0.lock"));
        let lock = LinkLock::for_device("/tmp", "/dev/serial/by-id/usb-FTDI");
        assert_eq!(lock.path(), Path::new("/tmp/pellet-telemetry.serial_by-id_usb-FTDI.lock"));
    }

    #[test]
    fn separate_gates_on_one_link_take_turns() {
        // The daemon and a one-shot command each build their own gate.
        let lock = scratch_lock("turns");
        let daemon = Arc::new(DeviceGate::with_link_lock(FakeDevice::opened(), lock.clone()));
        let command = Arc::new(DeviceGate::with_link_lock(FakeDevice::opened(), lock.clone()));
        let inside = Arc::new(AtomicUsize::new(0));
        let most = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = [daemon, command]
            .into_iter()
            .map(|gate| {
                let (inside, most) = (inside.clone(), most.clone());
                thread::spawn(move || {
                    gate.with_exclusive_access(|_| {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        most.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(200));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .expect("access");
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread");
        }
        assert_eq!(most.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_file(lock.path());
    }

    #[test]
    fn unusable_lock_dir_fails_without_touching_the_device() {
        let lock = LinkLock::for_device("/nonexistent/lock/dir", "/dev/ttyUSB0");
        let gate = DeviceGate::with_link_lock(FakeDevice::opened(), lock);
        let mut called = false;
        let err = gate
            .with_exclusive_access(|_| {
                called = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));
        assert!(!called);
    }
}
