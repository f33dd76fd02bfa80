//! Static admission policy: the deny-set and per-command argument sanitizers.
//!
//! This is a blacklist. A base command that is neither denied here nor has a
//! sanitizer is allowed through to the sandbox.
//!
//! The `chown` home check compares whole path components rather than raw
//! string prefixes: `/home/webuserx` is outside `/home/webuser`, though a
//! plain `starts_with` would admit it.

use crate::validator::Segment;

/// Base commands that are never admitted, with the category reported back to
/// the user on rejection.
pub const DENIED_COMMANDS: &[(&str, &str)] = &[
    // Privilege escalation
    ("sudo", "privilege escalation"),
    ("su", "privilege escalation"),
    ("doas", "privilege escalation"),
    ("pkexec", "privilege escalation"),
    // Package management
    ("apt", "package management"),
    ("apt-get", "package management"),
    ("apk", "package management"),
    ("yum", "package management"),
    ("dnf", "package management"),
    ("rpm", "package management"),
    ("dpkg", "package management"),
    ("pacman", "package management"),
    ("zypper", "package management"),
    ("snap", "package management"),
    // Service control
    ("systemctl", "service control"),
    ("service", "service control"),
    ("rc-service", "service control"),
    ("rc-update", "service control"),
    // Disk partitioning
    ("mkfs", "disk partitioning"),
    ("fdisk", "disk partitioning"),
    ("sfdisk", "disk partitioning"),
    ("parted", "disk partitioning"),
    ("mkswap", "disk partitioning"),
    // Remote access
    ("ssh", "remote access"),
    ("scp", "remote access"),
    ("sftp", "remote access"),
    ("telnet", "remote access"),
    ("ftp", "remote access"),
    // Raw networking and scanning
    ("nc", "raw networking"),
    ("netcat", "raw networking"),
    ("ncat", "raw networking"),
    ("socat", "raw networking"),
    ("nmap", "network scanning"),
    ("tcpdump", "network scanning"),
    // Filesystem isolation
    ("chroot", "chroot"),
    ("mount", "mount"),
    ("umount", "mount"),
    // User and password management
    ("useradd", "user management"),
    ("userdel", "user management"),
    ("usermod", "user management"),
    ("adduser", "user management"),
    ("deluser", "user management"),
    ("groupadd", "user management"),
    ("groupdel", "user management"),
    ("passwd", "password management"),
    ("chpasswd", "password management"),
    ("visudo", "user management"),
    // Power control
    ("reboot", "power control"),
    ("shutdown", "power control"),
    ("poweroff", "power control"),
    ("halt", "power control"),
    ("init", "power control"),
    // Firewall
    ("iptables", "firewall"),
    ("ip6tables", "firewall"),
    ("nft", "firewall"),
    ("ufw", "firewall"),
    ("firewall-cmd", "firewall"),
    // Kernel modules
    ("insmod", "kernel modules"),
    ("rmmod", "kernel modules"),
    ("modprobe", "kernel modules"),
    // Scheduling
    ("crontab", "scheduling"),
    ("at", "scheduling"),
    ("batch", "scheduling"),
];

const REMOVAL_FLAGS: &[&str] = &["-r", "-f", "-rf", "-fr"];
const PROTECTED_REMOVAL_TARGETS: &[&str] = &["/", "/*", "..", "../..", "../*"];

const DD_DANGEROUS_ARGS: &[&str] = &[
    "if=/dev/zero",
    "of=/dev/sda",
    "of=/dev/hda",
    "bs=1G",
    "bs=1024M",
];

const PERMISSIVE_MODES: &[&str] = &["777", "a+rwx"];
const KILL_FORCE_FLAGS: &[&str] = &["-9", "-KILL"];
const SHELL_INTERPRETERS: &[&str] = &["sh", "bash"];

/// Returns the deny category for `base`, if the command is on the deny-set.
pub fn denied_category(base: &str) -> Option<&'static str> {
    DENIED_COMMANDS
        .iter()
        .find(|(name, _)| *name == base)
        .map(|(_, category)| *category)
}

/// Argument-level checks for commands that are allowed in general but
/// dangerous with specific arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sanitizer {
    Remove,
    DiskDump,
    Chmod,
    Chown,
    Kill,
    Download,
    Forbidden,
}

impl Sanitizer {
    /// The sanitizer registered for a base command, if any.
    pub fn for_command(base: &str) -> Option<Self> {
        match base {
            "rm" => Some(Self::Remove),
            "dd" => Some(Self::DiskDump),
            "chmod" => Some(Self::Chmod),
            "chown" => Some(Self::Chown),
            "kill" => Some(Self::Kill),
            "curl" | "wget" => Some(Self::Download),
            "eval" | "exec" => Some(Self::Forbidden),
            _ => None,
        }
    }

    /// Checks one pipeline segment. `downstream` holds the segments that
    /// follow it in the same pipeline; `home_prefix` is the sandbox user's
    /// home directory.
    pub fn check(
        self,
        segment: &Segment<'_>,
        downstream: &[Segment<'_>],
        home_prefix: &str,
    ) -> Result<(), String> {
        let args = segment.args();
        match self {
            Self::Remove => check_remove(args),
            Self::DiskDump => check_disk_dump(args),
            Self::Chmod => check_chmod(args),
            Self::Chown => check_chown(args, home_prefix),
            Self::Kill => check_kill(args),
            Self::Download => check_download(segment.base().unwrap_or_default(), downstream),
            Self::Forbidden => Err(format!(
                "'{}' is not allowed",
                segment.base().unwrap_or_default()
            )),
        }
    }
}

fn check_remove(args: &[&str]) -> Result<(), String> {
    if !args.iter().any(|arg| REMOVAL_FLAGS.contains(arg)) {
        return Ok(());
    }
    match args
        .iter()
        .find(|arg| PROTECTED_REMOVAL_TARGETS.contains(*arg))
    {
        Some(target) => Err(format!(
            "Recursive or forced removal of '{target}' is not allowed"
        )),
        None => Ok(()),
    }
}

fn check_disk_dump(args: &[&str]) -> Result<(), String> {
    match args.iter().find(|arg| DD_DANGEROUS_ARGS.contains(*arg)) {
        Some(arg) => Err(format!("dd argument '{arg}' is not allowed")),
        None => Ok(()),
    }
}

fn check_chmod(args: &[&str]) -> Result<(), String> {
    let Some(mode) = args.iter().find(|arg| PERMISSIVE_MODES.contains(*arg)) else {
        return Ok(());
    };
    match args
        .iter()
        .filter(|arg| !PERMISSIVE_MODES.contains(*arg))
        .find(|arg| arg.starts_with('/'))
    {
        Some(path) => Err(format!(
            "Setting mode {mode} on absolute path '{path}' is not allowed"
        )),
        None => Ok(()),
    }
}

fn check_chown(args: &[&str], home_prefix: &str) -> Result<(), String> {
    // First operand is the owner spec, everything after it is a path.
    let paths = args.iter().filter(|arg| !arg.starts_with('-')).skip(1);
    for path in paths {
        if path.starts_with('/') && !within_prefix(path, home_prefix) {
            return Err(format!(
                "Changing ownership of '{path}' outside {home_prefix} is not allowed"
            ));
        }
    }
    Ok(())
}

fn within_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn check_kill(args: &[&str]) -> Result<(), String> {
    if args.iter().any(|arg| KILL_FORCE_FLAGS.contains(arg)) {
        Err("Force killing processes is not allowed".to_string())
    } else {
        Ok(())
    }
}

fn check_download(base: &str, downstream: &[Segment<'_>]) -> Result<(), String> {
    let pipes_to_shell = downstream
        .iter()
        .filter_map(Segment::base)
        .any(|next| SHELL_INTERPRETERS.contains(&next));
    if pipes_to_shell {
        Err(format!("Piping {base} output into a shell is not allowed"))
    } else {
        Ok(())
    }
}
