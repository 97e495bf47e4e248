//! Tiered command permissions and the append-only blacklists.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Result, SandboxError};
use crate::paths::normalize;
use crate::types::PermissionLevel;

/// Commands executable at the read-only permission level.
const READ_ONLY_COMMANDS: &[&str] = &[
    "ls", "dir", "cat", "type", "echo", "pwd", "cd", "find", "grep", "head", "tail", "wc", "stat",
    "file", "which", "where", "whoami",
];

/// Commands rejected at the standard permission level.
const STANDARD_PROHIBITED_COMMANDS: &[&str] =
    &["chmod", "chown", "chgrp", "sudo", "su", "kill", "killall"];

/// Commands whose path arguments must stay inside the sandbox.
const PATH_SENSITIVE_COMMANDS: &[&str] = &["rm", "rmdir", "del", "erase", "rd", "remove"];

/// Commands blacklisted by default at every permission level.
pub const DEFAULT_BLACKLIST_COMMANDS: &[&str] = &[
    // System management
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "init",
    // User management
    "useradd",
    "userdel",
    "usermod",
    "passwd",
    "groupadd",
    "groupdel",
    // Disk management
    "fdisk",
    "mkfs",
    "mount",
    "umount",
    "dd",
    "format",
    // Package management
    "apt",
    "apt-get",
    "yum",
    "dnf",
    "rpm",
    "dpkg",
    "pacman",
    // Service management
    "systemctl",
    "service",
    "chkconfig",
    // Network configuration
    "ifconfig",
    "ip",
    "route",
    "iptables",
    "firewall-cmd",
    // Windows
    "reg",
    "regedit",
    "sc",
    "net",
    "netsh",
    "powercfg",
];

/// Directories blacklisted by default as working directories.
pub const DEFAULT_BLACKLIST_DIRECTORIES: &[&str] = &[
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/usr/local/bin",
    "/usr/local/sbin",
    "/etc",
    "/boot",
    "/dev",
    "/proc",
    "/sys",
    "/root",
    "C:\\Windows",
    "C:\\Windows\\System32",
    "C:\\Windows\\SysWOW64",
    "C:\\Program Files",
    "C:\\Program Files (x86)",
    "/System",
    "/Library",
    "/Applications",
];

/// System directories for the running OS, always treated as blacklisted.
pub fn system_directories() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &[
            "C:\\Windows",
            "C:\\Windows\\System32",
            "C:\\Windows\\SysWOW64",
            "C:\\Program Files",
            "C:\\Program Files (x86)",
            "C:\\ProgramData",
        ]
    }
    #[cfg(target_os = "macos")]
    {
        &[
            "/System",
            "/Library",
            "/Applications",
            "/bin",
            "/sbin",
            "/usr/bin",
            "/usr/sbin",
            "/etc",
            "/var",
            "/private",
        ]
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        &[
            "/bin",
            "/sbin",
            "/usr/bin",
            "/usr/sbin",
            "/usr/local/bin",
            "/usr/local/sbin",
            "/etc",
            "/boot",
            "/dev",
            "/proc",
            "/sys",
            "/root",
            "/lib",
            "/lib64",
            "/var",
        ]
    }
}

/// Mutable permission state: the current level plus the grow-only command
/// and directory blacklists. Lives inside the service's primary lock.
#[derive(Debug)]
pub struct PermissionGuard {
    level: PermissionLevel,
    blacklist_commands: Vec<String>,
    blacklist_directories: Vec<String>,
}

impl PermissionGuard {
    pub fn new() -> Self {
        Self {
            level: PermissionLevel::default(),
            blacklist_commands: DEFAULT_BLACKLIST_COMMANDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            blacklist_directories: DEFAULT_BLACKLIST_DIRECTORIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn level(&self) -> PermissionLevel {
        self.level
    }

    pub fn set_level(&mut self, level: PermissionLevel) {
        self.level = level;
    }

    pub fn blacklist_commands(&self) -> &[String] {
        &self.blacklist_commands
    }

    pub fn blacklist_directories(&self) -> &[String] {
        &self.blacklist_directories
    }

    /// Check whether `command` may run at the requested level, falling back
    /// to the current level when none is given. The blacklist is checked
    /// separately at execution time.
    pub fn check_permission(
        &self,
        command: &str,
        requested: Option<PermissionLevel>,
    ) -> Result<()> {
        let level = requested.unwrap_or(self.level);
        let name = base_name(command);
        match level {
            PermissionLevel::ReadOnly => {
                if !READ_ONLY_COMMANDS.contains(&name.as_str()) {
                    return Err(SandboxError::PermissionDenied(format!(
                        "command '{command}' is not allowed with read-only permission"
                    )));
                }
            }
            PermissionLevel::Standard => {
                if STANDARD_PROHIBITED_COMMANDS.contains(&name.as_str()) {
                    return Err(SandboxError::PermissionDenied(format!(
                        "command '{command}' requires elevated permission"
                    )));
                }
            }
            PermissionLevel::Elevated | PermissionLevel::Admin => {}
        }
        Ok(())
    }

    /// Case-insensitive blacklist match on the command's base name, with
    /// any leading path and Windows `.exe` suffix stripped.
    pub fn is_command_blacklisted(&self, command: &str) -> bool {
        let name = base_name(command);
        self.blacklist_commands
            .iter()
            .any(|b| b.to_lowercase() == name)
    }

    /// Directory blacklist check on path-segment boundaries, so `/etc2`
    /// does not match an `/etc` entry. Paths inside the sandbox root are
    /// implicitly trusted.
    pub fn is_directory_blacklisted(&self, root: &Path, dir: &Path) -> bool {
        let dir = normalize(dir);
        if dir.starts_with(root) {
            return false;
        }
        self.blacklist_directories
            .iter()
            .map(|b| normalize(Path::new(b)))
            .chain(system_directories().iter().map(|s| normalize(Path::new(s))))
            .any(|blacklisted| dir.starts_with(&blacklisted))
    }

    /// For path-mutating commands, require every non-flag argument to
    /// resolve inside the sandbox and outside blacklisted directories.
    /// Other commands pass unchecked.
    pub fn validate_command_args(
        &self,
        root: &Path,
        command: &str,
        args: &[String],
        work_dir: &Path,
    ) -> Result<()> {
        let name = strip_extension(&base_name(command));
        if !PATH_SENSITIVE_COMMANDS.contains(&name.as_str()) {
            return Ok(());
        }

        for arg in args {
            if arg.is_empty() || is_flag(arg) {
                continue;
            }

            let target = if Path::new(arg).is_absolute() {
                PathBuf::from(arg)
            } else {
                work_dir.join(arg)
            };
            let target = normalize(&target);

            if !target.starts_with(root) {
                return Err(SandboxError::SandboxViolation { path: arg.clone() });
            }
            if self.is_directory_blacklisted(root, &target) {
                return Err(SandboxError::DirectoryBlacklisted { path: target });
            }
        }
        Ok(())
    }

    /// Append new blacklist entries, skipping blanks and exact duplicates.
    /// There is no removal.
    pub fn update_blacklist(&mut self, commands: &[String], directories: &[String]) {
        for cmd in commands {
            let cmd = cmd.trim();
            if cmd.is_empty() || self.blacklist_commands.iter().any(|c| c == cmd) {
                continue;
            }
            self.blacklist_commands.push(cmd.to_string());
        }
        for dir in directories {
            let dir = dir.trim();
            if dir.is_empty() || self.blacklist_directories.iter().any(|d| d == dir) {
                continue;
            }
            self.blacklist_directories.push(dir.to_string());
        }
        info!(
            total_commands = self.blacklist_commands.len(),
            total_directories = self.blacklist_directories.len(),
            "command blacklist updated"
        );
    }
}

impl Default for PermissionGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercased command base name: path components and the Windows `.exe`
/// suffix stripped.
fn base_name(command: &str) -> String {
    let mut name = command.trim().to_lowercase();
    if let Some(idx) = name.rfind(['/', '\\']) {
        name = name[idx + 1..].to_string();
    }
    #[cfg(target_os = "windows")]
    {
        name = name.trim_end_matches(".exe").to_string();
    }
    name
}

fn strip_extension(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[..idx].to_string(),
        _ => name.to_string(),
    }
}

/// Option-style arguments are skipped during path validation: anything with
/// a leading `-`, and on Windows `/X` switches that are not themselves
/// paths.
fn is_flag(arg: &str) -> bool {
    if arg.starts_with('-') {
        return true;
    }
    #[cfg(target_os = "windows")]
    {
        if arg.starts_with('/')
            && arg.len() > 1
            && !arg.as_bytes()[1..].contains(&b':')
            && !arg[1..].contains('/')
            && !arg.contains('\\')
        {
            return true;
        }
    }
    false
}
