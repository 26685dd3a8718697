//! User identity resolution and switching.
//!
//! A user spec is `user[:group]`, where each part is a name or a numeric id.
//! Names resolve against the user and group databases of the current root,
//! which inside a container is the container's own `/etc/passwd` and
//! `/etc/group`.

use std::ffi::CString;

use ctdriver_common::error::{DriverError, Result};
use nix::unistd::{Gid, Group, Uid, User};

/// Reference to a user or group by name or number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdRef {
    /// Numeric id.
    Id(u32),
    /// Database name.
    Name(String),
}

impl IdRef {
    fn parse(part: &str) -> Self {
        part.parse::<u32>()
            .map_or_else(|_| Self::Name(part.to_string()), Self::Id)
    }
}

/// Parsed `user[:group]` spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpec {
    /// The user part.
    pub user: IdRef,
    /// The optional group part.
    pub group: Option<IdRef>,
}

/// Parses a `user[:group]` spec.
///
/// # Errors
///
/// Returns a configuration error if either part is empty.
pub fn parse_user_spec(spec: &str) -> Result<UserSpec> {
    let (user, group) = match spec.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (spec, None),
    };
    if user.is_empty() || group.is_some_and(str::is_empty) {
        return Err(DriverError::Config {
            message: format!("invalid user spec '{spec}'"),
        });
    }
    Ok(UserSpec {
        user: IdRef::parse(user),
        group: group.map(IdRef::parse),
    })
}

/// A fully resolved identity to switch to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Target user id.
    pub uid: Uid,
    /// Target primary group id.
    pub gid: Gid,
    /// Supplementary groups.
    pub groups: Vec<Gid>,
}

fn lookup_error(what: &str, e: nix::Error) -> DriverError {
    DriverError::Config {
        message: format!("looking up {what}: {e}"),
    }
}

/// Resolves a user spec against the user and group databases.
///
/// Numeric users absent from the database are allowed; they keep the
/// calling process's gid unless a group is given.
///
/// # Errors
///
/// Returns an error if a named user or group does not exist.
pub fn resolve_identity(spec: &str) -> Result<Identity> {
    let parsed = parse_user_spec(spec)?;

    let (uid, user) = match &parsed.user {
        IdRef::Id(raw) => {
            let uid = Uid::from_raw(*raw);
            (uid, User::from_uid(uid).map_err(|e| lookup_error("user", e))?)
        }
        IdRef::Name(name) => {
            let user = User::from_name(name)
                .map_err(|e| lookup_error("user", e))?
                .ok_or_else(|| DriverError::NotFound {
                    kind: "user",
                    id: name.clone(),
                })?;
            (user.uid, Some(user))
        }
    };

    let gid = match &parsed.group {
        Some(IdRef::Id(gid)) => Gid::from_raw(*gid),
        Some(IdRef::Name(name)) => {
            Group::from_name(name)
                .map_err(|e| lookup_error("group", e))?
                .ok_or_else(|| DriverError::NotFound {
                    kind: "group",
                    id: name.clone(),
                })?
                .gid
        }
        None => user.as_ref().map_or_else(Gid::current, |u| u.gid),
    };

    let groups = match &user {
        Some(u) => {
            let name = CString::new(u.name.as_str()).map_err(|e| DriverError::Config {
                message: format!("user name {}: {e}", u.name),
            })?;
            nix::unistd::getgrouplist(&name, gid).map_err(|e| lookup_error("groups", e))?
        }
        None => vec![gid],
    };

    Ok(Identity { uid, gid, groups })
}

/// Switches the calling process to `identity`: supplementary groups, then
/// gid, then uid.
///
/// # Errors
///
/// Returns an error if any of the id-changing syscalls fail.
pub fn switch_identity(identity: &Identity) -> Result<()> {
    let denied = |what: &str, e: nix::Error| DriverError::PermissionDenied {
        message: format!("{what}: {e}"),
    };
    nix::unistd::setgroups(&identity.groups).map_err(|e| denied("setgroups", e))?;
    nix::unistd::setgid(identity.gid).map_err(|e| denied("setgid", e))?;
    nix::unistd::setuid(identity.uid).map_err(|e| denied("setuid", e))?;
    tracing::debug!(uid = identity.uid.as_raw(), gid = identity.gid.as_raw(), "identity switched");
    Ok(())
}
