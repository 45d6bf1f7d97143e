use crate::error::{Result, TrapcamError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Disk usage query for the volume holding recorded artifacts
pub trait DiskUsage: Send {
    /// Used share of the volume at `path`, in percent (0.0 - 100.0)
    fn usage_percent(&self, path: &Path) -> Result<f32>;
}

/// Filesystem-backed probe using statvfs
#[derive(Debug, Default)]
pub struct StatvfsProbe;

#[cfg(unix)]
impl DiskUsage for StatvfsProbe {
    fn usage_percent(&self, path: &Path) -> Result<f32> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| TrapcamError::component("disk_probe", "path contains a NUL byte"))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let block_size = stat.f_frsize as u64;
        let total = stat.f_blocks as u64 * block_size;
        if total == 0 {
            return Ok(0.0);
        }
        let available = stat.f_bavail as u64 * block_size;
        let used = total.saturating_sub(available);

        Ok((used as f32 / total as f32) * 100.0)
    }
}

#[cfg(not(unix))]
impl DiskUsage for StatvfsProbe {
    fn usage_percent(&self, _path: &Path) -> Result<f32> {
        Err(TrapcamError::component(
            "disk_probe",
            "statvfs is only available on unix targets",
        ))
    }
}

/// Probe that measures the directory's contents against a byte quota.
///
/// Useful where the artifact directory shares a volume with other data, and
/// as the deterministic probe in tests.
#[derive(Debug)]
pub struct QuotaProbe {
    quota_bytes: u64,
}

impl QuotaProbe {
    pub fn new(quota_bytes: u64) -> Self {
        Self { quota_bytes }
    }
}

impl DiskUsage for QuotaProbe {
    fn usage_percent(&self, path: &Path) -> Result<f32> {
        if self.quota_bytes == 0 {
            return Ok(100.0);
        }

        let mut used = 0u64;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_file() {
                used += metadata.len();
            }
        }

        Ok((used as f32 / self.quota_bytes as f32) * 100.0)
    }
}

/// Result of one pruning pass
#[derive(Debug, Clone, Default)]
pub struct PruneResult {
    pub deleted: usize,
    pub bytes_freed: u64,
}

/// Deletes this device's oldest artifacts while disk usage exceeds budget.
///
/// A pruning collaborator consulted before new sessions open, not part of
/// the recording state machine. Only artifacts matching this device's naming
/// convention are ever deleted; other devices sharing the storage keep
/// theirs.
pub struct RetentionPolicy {
    video_dir: PathBuf,
    device_suffix: String,
    max_usage_percent: f32,
    probe: Box<dyn DiskUsage>,
}

impl RetentionPolicy {
    pub fn new(
        video_dir: PathBuf,
        device_id: &str,
        extension: &str,
        max_usage_percent: f32,
        probe: Box<dyn DiskUsage>,
    ) -> Self {
        Self {
            video_dir,
            device_suffix: format!("_{}.{}", device_id, extension),
            max_usage_percent,
            probe,
        }
    }

    /// Prune oldest-first until usage drops within budget.
    ///
    /// Stops early when nothing matching this device remains to delete.
    pub fn ensure_space(&self) -> Result<PruneResult> {
        let mut result = PruneResult::default();

        loop {
            let usage = self.probe.usage_percent(&self.video_dir)?;
            if usage <= self.max_usage_percent {
                break;
            }

            let oldest = match self.oldest_artifact()? {
                Some(path) => path,
                None => {
                    warn!(
                        "Disk usage {:.1}% exceeds budget {:.1}% but no artifacts of this \
                         device remain to prune",
                        usage, self.max_usage_percent
                    );
                    break;
                }
            };

            let size = std::fs::metadata(&oldest).map(|m| m.len()).unwrap_or(0);
            std::fs::remove_file(&oldest)?;
            info!(
                "Pruned {} ({} bytes) to make space (usage was {:.1}%)",
                oldest.display(),
                size,
                usage
            );
            result.deleted += 1;
            result.bytes_freed += size;
        }

        debug!(
            "Pruning pass complete: {} deleted, {} bytes freed",
            result.deleted, result.bytes_freed
        );
        Ok(result)
    }

    /// Oldest artifact matching this device's naming convention.
    ///
    /// Filenames start with the capture timestamp, so lexicographic order is
    /// chronological order.
    fn oldest_artifact(&self) -> Result<Option<PathBuf>> {
        let mut oldest: Option<(String, PathBuf)> = None;

        for entry in std::fs::read_dir(&self.video_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(&self.device_suffix) {
                continue;
            }

            match oldest.as_ref() {
                Some((current, _)) if *current <= name => {}
                _ => oldest = Some((name, entry.path())),
            }
        }

        Ok(oldest.map(|(_, path)| path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_artifact(dir: &Path, name: &str, size: usize) {
        std::fs::write(dir.join(name), vec![0u8; size]).unwrap();
    }

    #[test]
    fn test_quota_probe_measures_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), "a", 300);
        write_artifact(dir.path(), "b", 200);

        let probe = QuotaProbe::new(1000);
        let usage = probe.usage_percent(dir.path()).unwrap();
        assert!((usage - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_prunes_oldest_first_until_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), "2024-01-01_08.00.00.000_cam-a.rawv", 300);
        write_artifact(dir.path(), "2024-01-02_08.00.00.000_cam-a.rawv", 300);
        write_artifact(dir.path(), "2024-01-03_08.00.00.000_cam-a.rawv", 300);
        write_artifact(dir.path(), "2024-01-01_08.00.00.000_cam-b.rawv", 200);

        let policy = RetentionPolicy::new(
            dir.path().to_path_buf(),
            "cam-a",
            "rawv",
            80.0,
            Box::new(QuotaProbe::new(1000)),
        );

        // Usage starts at 110%; deleting the oldest cam-a artifact brings it
        // to exactly 80%.
        let result = policy.ensure_space().unwrap();
        assert_eq!(result.deleted, 1);
        assert_eq!(result.bytes_freed, 300);
        assert!(!dir
            .path()
            .join("2024-01-01_08.00.00.000_cam-a.rawv")
            .exists());
        assert!(dir
            .path()
            .join("2024-01-02_08.00.00.000_cam-a.rawv")
            .exists());
        // Another device's artifact is never touched
        assert!(dir
            .path()
            .join("2024-01-01_08.00.00.000_cam-b.rawv")
            .exists());
    }

    #[test]
    fn test_stops_when_nothing_left_to_prune() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), "2024-01-01_08.00.00.000_cam-b.rawv", 900);

        let policy = RetentionPolicy::new(
            dir.path().to_path_buf(),
            "cam-a",
            "rawv",
            50.0,
            Box::new(QuotaProbe::new(1000)),
        );

        // Over budget, but only a foreign device's artifact exists
        let result = policy.ensure_space().unwrap();
        assert_eq!(result.deleted, 0);
        assert!(dir
            .path()
            .join("2024-01-01_08.00.00.000_cam-b.rawv")
            .exists());
    }

    #[test]
    fn test_noop_when_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), "2024-01-01_08.00.00.000_cam-a.rawv", 100);

        let policy = RetentionPolicy::new(
            dir.path().to_path_buf(),
            "cam-a",
            "rawv",
            80.0,
            Box::new(QuotaProbe::new(1000)),
        );

        let result = policy.ensure_space().unwrap();
        assert_eq!(result.deleted, 0);
        assert_eq!(result.bytes_freed, 0);
    }
}
