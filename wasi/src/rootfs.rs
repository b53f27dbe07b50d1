//! Root filesystem: the mount table and path multiplexer.
//!
//! Not a backend. Given an absolute guest path it canonicalises, finds
//! the longest matching mount prefix and forwards to the owning device
//! with the residual path. The pre-open sequence over the table is driven
//! by the process layer at construction time.

use std::sync::Arc;

use crate::driver::Device;
use crate::paths;
use crate::types::{WasiError, WasiResult};

/// One mount: an absolute guest-visible prefix and its backend.
pub struct MountPoint {
    /// Absolute guest path, first character `/`.
    pub path: String,
    /// The backend serving this subtree.
    pub device: Arc<Device>,
}

/// The ordered mount table.
#[derive(Default)]
pub struct RootFileSystem {
    mounts: Vec<MountPoint>,
}

impl RootFileSystem {
    /// An empty table.
    pub fn new() -> RootFileSystem {
        RootFileSystem { mounts: Vec::new() }
    }

    /// Install a filesystem device at an absolute mount point.
    pub fn mount(&mut self, mount_point: &str, device: Arc<Device>) -> WasiResult<()> {
        if !mount_point.starts_with('/') {
            return Err(WasiError::Inval);
        }
        if !device.is_filesystem() {
            return Err(WasiError::Inval);
        }
        let path = paths::normalize(mount_point);
        if self.mounts.iter().any(|m| m.path == path) {
            return Err(WasiError::Exist);
        }
        self.mounts.push(MountPoint { path, device });
        Ok(())
    }

    /// Mounts in installation order (the pre-open order).
    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    /// Resolve an absolute guest path to its owning mount and the
    /// device-relative residual path. Longest prefix wins.
    pub fn resolve(&self, path: &str) -> WasiResult<(&MountPoint, String)> {
        let canonical = paths::normalize(path);
        let mut best: Option<&MountPoint> = None;
        for mount in &self.mounts {
            if paths::is_within(&canonical, &mount.path)
                && best.map_or(true, |b| mount.path.len() > b.path.len())
            {
                best = Some(mount);
            }
        }
        let mount = best.ok_or(WasiError::NoEnt)?;
        let residual = if mount.path == "/" {
            canonical.clone()
        } else if canonical == mount.path {
            String::from("/")
        } else {
            String::from(&canonical[mount.path.len()..])
        };
        Ok((mount, residual))
    }
}

impl core::fmt::Debug for RootFileSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let paths: Vec<&str> = self.mounts.iter().map(|m| m.path.as_str()).collect();
        f.debug_struct("RootFileSystem")
            .field("mounts", &paths)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::InMemoryFileSystemDevice;

    fn mem_device() -> Arc<Device> {
        Arc::new(Device::MemFs(InMemoryFileSystemDevice::new(false)))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut root = RootFileSystem::new();
        let outer = mem_device();
        let inner = mem_device();
        root.mount("/data", outer.clone()).unwrap();
        root.mount("/data/cache", inner.clone()).unwrap();

        let (mount, residual) = root.resolve("/data/cache/x.bin").unwrap();
        assert_eq!(mount.path, "/data/cache");
        assert_eq!(residual, "/x.bin");

        let (mount, residual) = root.resolve("/data/other").unwrap();
        assert_eq!(mount.path, "/data");
        assert_eq!(residual, "/other");
    }

    #[test]
    fn test_mount_point_itself_resolves_to_root() {
        let mut root = RootFileSystem::new();
        root.mount("/w", mem_device()).unwrap();
        let (mount, residual) = root.resolve("/w").unwrap();
        assert_eq!(mount.path, "/w");
        assert_eq!(residual, "/");
    }

    #[test]
    fn test_dotdot_cannot_escape() {
        let mut root = RootFileSystem::new();
        root.mount("/w", mem_device()).unwrap();
        // `..` collapses before matching, so the path stays inside `/w`.
        let (mount, residual) = root.resolve("/w/sub/../f").unwrap();
        assert_eq!(mount.path, "/w");
        assert_eq!(residual, "/f");
        // Climbing past the mount leaves nothing to match.
        assert_eq!(root.resolve("/w/../etc").err(), Some(WasiError::NoEnt));
    }

    #[test]
    fn test_duplicate_and_relative_mounts_rejected() {
        let mut root = RootFileSystem::new();
        root.mount("/w", mem_device()).unwrap();
        assert_eq!(root.mount("/w", mem_device()).err(), Some(WasiError::Exist));
        assert_eq!(
            root.mount("relative", mem_device()).err(),
            Some(WasiError::Inval)
        );
    }
}
