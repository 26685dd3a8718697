//! Mount utilities for container filesystem setup.
//!
//! The `nix::Result` functions run inside the child's mount namespace; the
//! `prepare_*`/`resolve_*` helpers run on the host beforehand.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use ctdriver_common::error::{DriverError, Result};
use nix::mount::{MsFlags, mount};

/// Marks `/` recursively as a slave mount so that unmounts made inside this
/// namespace do not propagate back to the host.
///
/// # Errors
///
/// Returns the `mount(2)` errno.
pub fn make_root_rslave() -> nix::Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_SLAVE,
        None::<&str>,
    )
}

/// Creates a recursive bind mount from `source` to `target`, remounting it
/// read-only unless `writable`.
///
/// # Errors
///
/// Returns the `mount(2)` errno of the failing step.
pub fn bind_mount(source: &Path, target: &Path, writable: bool) -> nix::Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    if !writable {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
            None::<&str>,
        )?;
    }
    Ok(())
}

/// Stops mount events under `target` from propagating to or from peers.
///
/// # Errors
///
/// Returns the `mount(2)` errno.
pub fn make_private(target: &Path) -> nix::Result<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
}

/// Mounts a fresh `proc` filesystem at `target`.
///
/// # Errors
///
/// Returns the `mount(2)` errno.
pub fn mount_proc(target: &Path) -> nix::Result<()> {
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
}

/// Symlinks followed while resolving one destination before giving up.
const MAX_SYMLINK_FOLLOWS: u32 = 40;

/// One pending step of a destination walk.
enum Step {
    Root,
    Up,
    Name(OsString),
}

impl Step {
    fn from_component(component: Component<'_>) -> Option<Self> {
        match component {
            Component::RootDir => Some(Self::Root),
            Component::ParentDir => Some(Self::Up),
            Component::Normal(part) => Some(Self::Name(part.to_os_string())),
            Component::CurDir | Component::Prefix(_) => None,
        }
    }
}

/// Resolves an in-container destination against the container root.
///
/// Symlinks met on the way are followed as the container would see them:
/// absolute links restart at `rootfs` and `..` never climbs above it, so
/// the result always lies under `rootfs`.
///
/// # Errors
///
/// Returns a configuration error if the destination is relative, climbs
/// out of the root with `..` or loops through symlinks.
pub fn resolve_target(rootfs: &Path, destination: &Path) -> Result<PathBuf> {
    if !destination.is_absolute() {
        return Err(DriverError::Config {
            message: format!("mount destination must be absolute: {}", destination.display()),
        });
    }
    let escapes = || DriverError::Config {
        message: format!("mount destination escapes root: {}", destination.display()),
    };

    let mut pending: Vec<Step> = Vec::new();
    for component in destination.components().rev() {
        match component {
            Component::ParentDir | Component::Prefix(_) => return Err(escapes()),
            other => pending.extend(Step::from_component(other)),
        }
    }

    let mut resolved = PathBuf::new();
    let mut follows = 0;
    while let Some(step) = pending.pop() {
        let part = match step {
            Step::Name(part) => part,
            Step::Up => {
                let _ = resolved.pop();
                continue;
            }
            Step::Root => {
                resolved = PathBuf::new();
                continue;
            }
        };

        let host = rootfs.join(&resolved).join(&part);
        let is_link = std::fs::symlink_metadata(&host).is_ok_and(|m| m.file_type().is_symlink());
        if !is_link {
            resolved.push(part);
            continue;
        }

        follows += 1;
        if follows > MAX_SYMLINK_FOLLOWS {
            return Err(DriverError::Config {
                message: format!("too many symlinks in mount destination: {}", destination.display()),
            });
        }
        let link = std::fs::read_link(&host).map_err(|e| DriverError::io(&host, e))?;
        tracing::trace!(link = %host.display(), to = %link.display(), "following rootfs symlink");
        pending.extend(link.components().rev().filter_map(Step::from_component));
    }
    Ok(rootfs.join(resolved))
}

/// Creates the mount point for `source` at `target`: a directory for
/// directory sources, an empty file for anything else.
///
/// Returns the paths it had to create, parents first, so that they can be
/// removed with [`remove_mount_points`] once the container is gone.
///
/// # Errors
///
/// Returns an error if the source cannot be inspected or the mount point
/// cannot be created.
pub fn prepare_target(source: &Path, target: &Path) -> Result<Vec<PathBuf>> {
    let metadata = std::fs::metadata(source).map_err(|e| DriverError::io(source, e))?;
    let mut created = Vec::new();
    if metadata.is_dir() {
        create_missing_dirs(target, &mut created)?;
        return Ok(created);
    }

    if let Some(parent) = target.parent() {
        create_missing_dirs(parent, &mut created)?;
    }
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
    {
        Ok(_) => created.push(target.to_path_buf()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => return Err(DriverError::io(target, e)),
    }
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        created = created.len(),
        "mount target prepared"
    );
    Ok(created)
}

/// Creates `dir` and its missing ancestors, recording each one created.
///
/// # Errors
///
/// Returns an error if a directory cannot be created.
pub fn create_missing_dirs(dir: &Path, created: &mut Vec<PathBuf>) -> Result<()> {
    let missing: Vec<&Path> = dir
        .ancestors()
        .take_while(|p| !p.as_os_str().is_empty() && std::fs::symlink_metadata(p).is_err())
        .collect();
    for path in missing.into_iter().rev() {
        match std::fs::create_dir(path) {
            Ok(()) => created.push(path.to_path_buf()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(DriverError::io(path, e)),
        }
    }
    Ok(())
}

/// Removes mount points recorded by [`prepare_target`], newest first.
/// Directories are only removed when empty; failures are logged.
pub fn remove_mount_points(created: &[PathBuf]) {
    for path in created.iter().rev() {
        let removed = match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir(path),
            Ok(_) => std::fs::remove_file(path),
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => tracing::debug!(path = %path.display(), "mount point removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "mount point left behind"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_target_joins_under_root() {
        let target = resolve_target(Path::new("/rootfs"), Path::new("/etc/hosts")).expect("resolve");
        assert_eq!(target, PathBuf::from("/rootfs/etc/hosts"));
    }

    #[test]
    fn resolve_target_rejects_escapes_and_relative_paths() {
        assert!(resolve_target(Path::new("/rootfs"), Path::new("/../etc")).is_err());
        assert!(resolve_target(Path::new("/rootfs"), Path::new("etc/hosts")).is_err());
    }

    #[test]
    fn prepare_target_creates_directory_for_directory_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("data");
        std::fs::create_dir(&source).expect("mkdir");
        std::fs::create_dir(dir.path().join("rootfs")).expect("mkdir rootfs");
        let target = dir.path().join("rootfs/mnt/data");

        let created = prepare_target(&source, &target).expect("prepare");
        assert!(target.is_dir());
        assert_eq!(created, vec![dir.path().join("rootfs/mnt"), target]);
    }

    #[test]
    fn prepare_target_creates_file_for_file_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("config.env");
        std::fs::write(&source, "[]").expect("write");
        std::fs::create_dir(dir.path().join("rootfs")).expect("mkdir rootfs");
        let target = dir.path().join("rootfs/.ctenv");

        let created = prepare_target(&source, &target).expect("prepare");
        assert!(target.is_file());
        assert_eq!(std::fs::read_to_string(&target).expect("read"), "");
        assert_eq!(created, vec![target.clone()]);

        assert!(prepare_target(&source, &target).expect("again").is_empty());
    }

    #[test]
    fn prepare_target_fails_for_missing_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = prepare_target(&dir.path().join("nope"), &dir.path().join("t")).unwrap_err();
        assert!(matches!(err, DriverError::Io { .. }));
    }

    #[test]
    fn created_mount_points_are_removed_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("console");
        std::fs::write(&source, "").expect("write");
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).expect("mkdir");
        std::fs::write(rootfs.join("etc/hosts"), "127.0.0.1 localhost\n").expect("write");

        let mut created = prepare_target(&source, &rootfs.join("dev/console")).expect("console");
        created.extend(prepare_target(&source, &rootfs.join("etc/hosts")).expect("hosts"));
        assert_eq!(created, vec![rootfs.join("dev"), rootfs.join("dev/console")]);

        remove_mount_points(&created);
        assert!(!rootfs.join("dev").exists());
        assert!(rootfs.join("etc/hosts").is_file());
    }

    #[test]
    fn non_empty_created_directory_is_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("data");
        std::fs::create_dir(&source).expect("mkdir");
        let target = dir.path().join("mnt");

        let created = prepare_target(&source, &target).expect("prepare");
        std::fs::write(target.join("keep"), "x").expect("write");
        remove_mount_points(&created);
        assert!(target.join("keep").is_file());
    }

    #[test]
    fn absolute_symlink_resolves_inside_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = dir.path().join("host");
        std::fs::create_dir(&host).expect("mkdir host");
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir(&rootfs).expect("mkdir rootfs");
        std::os::unix::fs::symlink(&host, rootfs.join("data")).expect("symlink");

        let target = resolve_target(&rootfs, Path::new("/data/planted")).expect("resolve");
        assert!(target.starts_with(&rootfs), "{}", target.display());
        let relative = host.strip_prefix("/").expect("absolute host dir");
        assert_eq!(target, rootfs.join(relative).join("planted"));

        let source = dir.path().join("src");
        std::fs::create_dir(&source).expect("mkdir src");
        let _created = prepare_target(&source, &target).expect("prepare");
        assert!(!host.join("planted").exists());
    }

    #[test]
    fn relative_symlinks_are_clamped_at_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("usr/lib")).expect("mkdir");
        std::os::unix::fs::symlink("usr/lib", rootfs.join("lib")).expect("symlink lib");
        std::os::unix::fs::symlink("../../../..", rootfs.join("usr/up")).expect("symlink up");

        assert_eq!(
            resolve_target(&rootfs, Path::new("/lib/x")).expect("lib"),
            rootfs.join("usr/lib/x")
        );
        assert_eq!(
            resolve_target(&rootfs, Path::new("/usr/up/etc")).expect("up"),
            rootfs.join("etc")
        );
    }

    #[test]
    fn symlink_loops_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rootfs = dir.path();
        std::os::unix::fs::symlink("/b", rootfs.join("a")).expect("symlink a");
        std::os::unix::fs::symlink("/a", rootfs.join("b")).expect("symlink b");

        let err = resolve_target(rootfs, Path::new("/a/x")).unwrap_err();
        assert!(matches!(err, DriverError::Config { .. }));
    }
}
