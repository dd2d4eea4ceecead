//! Read-only ground truth: statvfs, directory listings, magic, and sysfs.
//!
//! Sysfs walkers take the block base directory as an argument (normally
//! `/sys/block`) so tests can stage a fake tree.

use crate::error::{FreeholdError, FreeholdResult};
use crate::invoke::ToolInvoker;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Free-space snapshot for one filesystem.
#[derive(Debug, Clone, Copy)]
pub struct DiskFree {
    /// Blocks available to unprivileged callers times the fragment size.
    pub bytes_available: u64,
}

/// Query free space at `path` via statvfs(3).
pub fn statvfs(path: &Path) -> FreeholdResult<DiskFree> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FreeholdError::Io(std::io::ErrorKind::InvalidInput.into()))?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) };
    if rc != 0 {
        return Err(FreeholdError::Io(std::io::Error::last_os_error()));
    }
    Ok(DiskFree {
        bytes_available: vfs.f_bavail as u64 * vfs.f_frsize as u64,
    })
}

pub fn is_dir(path: &Path) -> bool {
    path.is_dir()
}

/// Read a small text file (sysfs attribute, etc.) and trim it.
pub fn read_trimmed(path: &Path) -> FreeholdResult<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Whether a file name has the hyphenated UUIDv4 shape used for pages, keys,
/// and headers.
pub fn is_uuid_name(name: &str) -> bool {
    name.len() == 36 && Uuid::parse_str(name).is_ok()
}

/// List the regular files directly under `dir` whose names are UUID-shaped,
/// sorted by name. A missing directory is an empty listing.
pub fn uuid_entries(dir: &Path) -> FreeholdResult<Vec<PathBuf>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut entries = Vec::new();
    for entry in read {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_uuid_name(name) {
            entries.push(entry.path());
        }
    }
    entries.sort();
    Ok(entries)
}

/// Classify the leading bytes of `path` via `file -b`. A zero-filled virgin
/// page reports as plain `data`; an MD member reports its RAID superblock.
pub fn magic<I: ToolInvoker + ?Sized>(invoker: &I, path: &Path) -> FreeholdResult<String> {
    let path_arg = path.to_string_lossy();
    let out = invoker.run_checked("file", &["-b", path_arg.as_ref()])?;
    Ok(out.stdout_trimmed().to_string())
}

/// List the MD arrays exposed under `sysfs_block` (entries carrying an `md`
/// sub-directory).
pub fn md_arrays(sysfs_block: &Path) -> FreeholdResult<Vec<String>> {
    let read = match fs::read_dir(sysfs_block) {
        Ok(read) => read,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut arrays = Vec::new();
    for entry in read {
        let entry = entry?;
        if entry.path().join("md").is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                arrays.push(name.to_string());
            }
        }
    }
    arrays.sort();
    Ok(arrays)
}

/// List the member devices of `md`, in stripe order.
///
/// Directory order under `slaves/` is not stable, so entries are ordered by
/// their loop index (`loop2` before `loop10`).
pub fn md_slaves(sysfs_block: &Path, md: &str) -> FreeholdResult<Vec<String>> {
    let slaves_dir = sysfs_block.join(md).join("slaves");
    let read = match fs::read_dir(&slaves_dir) {
        Ok(read) => read,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut slaves = Vec::new();
    for entry in read {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            slaves.push(name.to_string());
        }
    }
    slaves.sort_by_key(|name| (loop_index(name), name.clone()));
    Ok(slaves)
}

/// Resolve the backing file of a loop member of `md`, from
/// `<sysfs>/<md>/slaves/<slave>/loop/backing_file`.
pub fn loop_backing_file(
    sysfs_block: &Path,
    md: &str,
    slave: &str,
) -> FreeholdResult<PathBuf> {
    let attr = sysfs_block
        .join(md)
        .join("slaves")
        .join(slave)
        .join("loop")
        .join("backing_file");
    Ok(PathBuf::from(read_trimmed(&attr)?))
}

fn loop_index(name: &str) -> u64 {
    name.strip_prefix("loop")
        .and_then(|rest| rest.parse().ok())
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn statvfs_reports_space_on_tmp() {
        let free = statvfs(Path::new("/tmp")).unwrap();
        assert!(free.bytes_available > 0);
    }

    #[test]
    fn uuid_shape_is_strict() {
        assert!(is_uuid_name("9f2c41de-9f20-4d7c-a2a3-58c6f41f7a11"));
        assert!(!is_uuid_name("9f2c41de9f204d7ca2a358c6f41f7a11"));
        assert!(!is_uuid_name("notauuid"));
        assert!(!is_uuid_name(""));
    }

    #[test]
    fn uuid_entries_filters_and_sorts() {
        let dir = tempdir().unwrap();
        let a = "2b7e1516-28ae-4d2a-abf7-158809cf4f3c";
        let b = "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee";
        fs::write(dir.path().join(b), b"x").unwrap();
        fs::write(dir.path().join(a), b"x").unwrap();
        fs::write(dir.path().join("README"), b"x").unwrap();
        fs::create_dir(dir.path().join("4e1243bd-22c6-4abc-85bb-aaaaaaaaaaaa")).unwrap();

        let entries = uuid_entries(dir.path()).unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec![a.to_string(), b.to_string()]);
    }

    #[test]
    fn uuid_entries_tolerates_missing_dir() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(uuid_entries(&missing).unwrap().is_empty());
    }

    #[test]
    fn sysfs_walk_reads_fake_tree() {
        let sys = tempdir().unwrap();
        let backing = "/tmp/s1/2b7e1516-28ae-4d2a-abf7-158809cf4f3c";
        for (loopdev, order) in [("loop10", 1), ("loop2", 0)] {
            let loop_dir = sys.path().join("md0/slaves").join(loopdev).join("loop");
            fs::create_dir_all(&loop_dir).unwrap();
            fs::write(loop_dir.join("backing_file"), format!("{backing}.{order}\n")).unwrap();
        }
        fs::create_dir_all(sys.path().join("md0/md")).unwrap();
        fs::create_dir_all(sys.path().join("sda")).unwrap();

        assert_eq!(md_arrays(sys.path()).unwrap(), vec!["md0".to_string()]);
        let slaves = md_slaves(sys.path(), "md0").unwrap();
        assert_eq!(slaves, vec!["loop2".to_string(), "loop10".to_string()]);
        assert_eq!(
            loop_backing_file(sys.path(), "md0", "loop2").unwrap(),
            PathBuf::from(format!("{backing}.0"))
        );
    }
}
