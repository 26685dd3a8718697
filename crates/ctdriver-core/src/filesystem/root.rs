//! Filesystem root rebind.

use std::path::Path;

/// Makes `new_root` the calling process's `/` and moves into it.
///
/// Meant for the window between `clone(2)` and `execve(2)` inside a private
/// mount namespace, so it neither allocates nor logs.
///
/// # Errors
///
/// Returns the `chroot(2)` or `chdir(2)` errno.
pub fn change_root(new_root: &Path) -> nix::Result<()> {
    nix::unistd::chroot(new_root)?;
    nix::unistd::chdir("/")
}
