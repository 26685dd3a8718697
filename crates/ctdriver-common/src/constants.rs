//! System-wide constants and default paths.

/// Name the driver identifies itself with on the init command line.
pub const DRIVER_NAME: &str = "native";

/// Default driver root directory on Linux.
pub const DEFAULT_DRIVER_ROOT: &str = "/var/lib/ctdriver";

/// Subdirectory of the driver root holding per-container state.
pub const CONTAINERS_DIR: &str = "containers";

/// File name of the generated environment file inside a container's directory.
pub const ENV_FILE_NAME: &str = "config.env";

/// Fixed in-container path where the environment file is mounted read-only.
pub const ENV_FILE_MOUNT: &str = "/.ctenv";

/// Default in-container path of the init program.
pub const DEFAULT_INIT_PATH: &str = "/.ctinit";

/// Launcher placed in the driver root that runs privileged containers unconfined.
pub const UNCONFINED_LAUNCHER: &str = "ctinit-unconfined";

/// In-container mount point of the console device for interactive containers.
pub const CONSOLE_MOUNT: &str = "/dev/console";

/// Mount table of the calling process.
pub const SELF_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Cgroup membership of the calling process.
pub const SELF_CGROUP: &str = "/proc/self/cgroup";

/// Kernel switch reporting whether `AppArmor` is enabled.
pub const APPARMOR_ENABLED: &str = "/sys/module/apparmor/parameters/enabled";

/// Cgroup subsystem used to locate containers; `cpu` is always mounted on v1 hosts.
pub const REFERENCE_SUBSYSTEM: &str = "cpu";

/// Task list file of a v1 cgroup directory.
pub const CGROUP_V1_TASKS: &str = "tasks";

/// Process list file of a v2 cgroup directory.
pub const CGROUP_V2_PROCS: &str = "cgroup.procs";

/// Exit status reserved for "command not found".
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Search path used when the container environment does not define `PATH`.
pub const DEFAULT_SEARCH_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Capabilities retained by non-privileged containers.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];
