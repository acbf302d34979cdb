//! Free space handling before a download.
//!
//! The update is staged on the cache partition. When it doesn't fit, old
//! files are reclaimed with a shrinking age threshold, and as a last
//! resort the install target moves to the fallback location.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use crate::config::Config;

/// Oldest age threshold tried when reclaiming, in hours
pub const RECLAIM_START_HOURS: u64 = 24;

pub const SENTINEL_CONTENT: &str = "Please don't erase this file!\n";

/// Reports the free space of the filesystem holding a path
pub trait SpaceProbe: Send + Sync {
    fn free_space(&self, path: &Path) -> u64;
}

/// `statvfs(3)` based probe
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn free_space(&self, path: &Path) -> u64 {
        match nix::sys::statvfs::statvfs(path) {
            Ok(stat) => (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64),
            Err(e) => {
                warn!("statvfs on {} failed: {e}", path.display());
                0
            }
        }
    }
}

/// Bytes needed for an update whose size the engine reported as `reported`.
pub fn required_space(reported: &str, default_size: u64, margin: u64) -> u64 {
    let size = match reported.trim().parse::<u64>() {
        Ok(size) => size,
        Err(_) => {
            warn!("Unparseable update size {reported:?}, assuming {default_size} bytes");
            default_size
        }
    };
    size.saturating_add(margin)
}

/// Delete the regular files under `root` last modified more than `max_age`
/// ago, descending into subdirectories. Returns how many were removed.
pub fn remove_files_older_than(root: &Path, max_age: Duration) -> std::io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    remove_older_than(root, cutoff)
}

fn remove_older_than(dir: &Path, cutoff: SystemTime) -> std::io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            match remove_older_than(&path, cutoff) {
                Ok(n) => removed += n,
                Err(e) => warn!("Couldn't clean {}: {e}", path.display()),
            }
        } else if file_type.is_file() {
            let modified = entry.metadata()?.modified()?;
            if modified < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Couldn't remove {}: {e}", path.display()),
                }
            }
        }
    }
    Ok(removed)
}

/// Make sure `dir` exists and holds the sentinel file.
pub fn ensure_install_dir(dir: &Path, sentinel_name: &str) {
    if !dir.exists() {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("Couldn't create install directory {}: {e}", dir.display());
            return;
        }
    }

    let sentinel = dir.join(sentinel_name);
    if sentinel.exists() {
        return;
    }

    let written = fs::File::create(&sentinel).and_then(|mut f| f.write_all(SENTINEL_CONTENT.as_bytes()));
    if let Err(e) = written {
        warn!("Couldn't write sentinel {}: {e}", sentinel.display());
    }
}

/// Free enough cache space for an update of `reported_size` and return the
/// directory the update should be staged in.
pub fn prepare_install_target(
    config: &Config,
    probe: &dyn SpaceProbe,
    reported_size: &str,
    install_dir: &Path,
) -> PathBuf {
    let required = required_space(reported_size, config.default_update_size(), config.space_margin());
    let cache_dir = config.cache_dir();

    info!(
        "Cache free size {}, update needs {required}",
        probe.free_space(cache_dir)
    );

    let mut age_hours = RECLAIM_START_HOURS as i64;
    while probe.free_space(cache_dir) < required && age_hours >= 0 {
        let max_age = Duration::from_secs(age_hours as u64 * 3600);
        match remove_files_older_than(cache_dir, max_age) {
            Ok(n) => debug!("Deleted {n} files older than {age_hours} hours from cache"),
            Err(e) => warn!("Reclaiming cache space failed: {e}"),
        }
        age_hours -= 1;
    }

    if probe.free_space(cache_dir) < required {
        warn!(
            "The cache partition is too small, staging the update in {} instead",
            config.fallback_install_dir().display()
        );
        return config.fallback_install_dir().to_path_buf();
    }

    ensure_install_dir(install_dir, config.sentinel_name());
    install_dir.to_path_buf()
}
