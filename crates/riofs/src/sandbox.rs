//! Pre-flight shell command validator.
//!
//! Consulted before any command reaches a PTY. The check is purely
//! syntactic: the command is split into pipeline segments and tokens, and
//! classified without executing anything. Same input, same verdict.
//!
//! Policy: reads are unrestricted; mutating commands must keep every path
//! argument under the mount root; destructive operations are blocked no
//! matter where they point.

use std::path::{Path, PathBuf};

/// Commands that are never allowed, regardless of arguments.
const DESTRUCTIVE: &[&str] = &[
    "rm", "rmdir", "dd", "shred", "wipefs", "mkfs", "fdisk", "parted", "mount", "umount",
    "unmount", "shutdown", "reboot", "halt", "poweroff", "swapoff", "sysctl",
];

/// Commands that mutate the filesystem; their path arguments are checked.
const MUTATING: &[&str] = &[
    "cp", "mv", "touch", "mkdir", "ln", "tee", "truncate", "install", "rsync", "chmod", "chown",
    "chgrp",
];

/// Write targets under /dev that are harmless.
const DEV_OK: &[&str] = &["/dev/null", "/dev/stdout", "/dev/stderr", "/dev/tty"];

pub struct Sandbox {
    mount_root: PathBuf,
    enabled: bool,
}

impl Sandbox {
    pub fn new(mount_root: impl Into<PathBuf>) -> Sandbox {
        Sandbox {
            mount_root: mount_root.into(),
            enabled: true,
        }
    }

    /// Development fallback: every command passes. Callers log this loudly
    /// at startup.
    pub fn permissive(mount_root: impl Into<PathBuf>) -> Sandbox {
        Sandbox {
            mount_root: mount_root.into(),
            enabled: false,
        }
    }

    pub fn is_enforcing(&self) -> bool {
        self.enabled
    }

    /// Classify a command. Returns `(ok, reason)`; `reason` is empty on
    /// acceptance. Total over all inputs and idempotent.
    pub fn validate(&self, command: &str) -> (bool, String) {
        if !self.enabled {
            return (true, String::new());
        }

        let trimmed = command.trim();
        if trimmed.is_empty() {
            return (true, String::new());
        }

        if looks_like_fork_bomb(trimmed) {
            return (false, "fork bomb pattern".to_string());
        }

        for segment in split_segments(trimmed) {
            let tokens = tokenize(segment);
            let Some(head) = tokens.first() else { continue };
            let verb = basename(head);

            if DESTRUCTIVE.contains(&verb) || verb.starts_with("mkfs.") {
                return (false, format!("destructive command '{verb}' is blocked"));
            }

            if let Some(reason) = self.check_redirections(&tokens) {
                return (false, reason);
            }

            let mutating = MUTATING.contains(&verb) || is_in_place_sed(verb, &tokens);
            if mutating {
                for arg in tokens.iter().skip(1) {
                    if arg.starts_with('-') {
                        continue;
                    }
                    if let Some(reason) = self.check_write_path(arg) {
                        return (false, reason);
                    }
                }
            }
        }

        (true, String::new())
    }

    fn check_redirections(&self, tokens: &[&str]) -> Option<String> {
        let mut expect_target = false;
        for tok in tokens {
            if expect_target {
                expect_target = false;
                if let Some(reason) = self.check_write_path(tok) {
                    return Some(reason);
                }
                continue;
            }
            if is_redirection(tok) {
                match tok.trim_start_matches(['0', '1', '2', '&', '>']) {
                    "" => expect_target = true,
                    target => {
                        if let Some(reason) = self.check_write_path(target) {
                            return Some(reason);
                        }
                    }
                }
            }
        }
        None
    }

    fn check_write_path(&self, raw: &str) -> Option<String> {
        let path = raw.trim_matches(['\'', '"']);
        if path.is_empty() || !path.starts_with(['/', '~']) {
            // Relative paths resolve inside the shell's working directory,
            // which lives under the mount.
            if path.contains("..") {
                return Some(format!("path '{path}' escapes the mount root"));
            }
            return None;
        }
        if path.starts_with("/dev/") {
            if DEV_OK.contains(&path) {
                return None;
            }
            return Some(format!("device write to '{path}'"));
        }
        if path.starts_with('~') {
            return Some(format!("write target '{path}' is outside the mount root"));
        }
        if path.contains("..") {
            return Some(format!("path '{path}' escapes the mount root"));
        }
        if !Path::new(path).starts_with(&self.mount_root) {
            return Some(format!("write target '{path}' is outside the mount root"));
        }
        None
    }
}

fn looks_like_fork_bomb(cmd: &str) -> bool {
    let squeezed: String = cmd.chars().filter(|c| !c.is_whitespace()).collect();
    squeezed.contains(":(){") || squeezed.contains(":|:")
}

/// Split on pipeline and sequencing operators. Quote-blind on purpose: a
/// separator inside quotes at worst splits a segment that then classifies
/// as harmless or over-blocks, never under-blocks.
fn split_segments(cmd: &str) -> Vec<&str> {
    cmd.split(['|', ';', '\n'])
        .flat_map(|s| s.split("&&"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn tokenize(segment: &str) -> Vec<&str> {
    segment.split_whitespace().collect()
}

fn basename(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

fn is_redirection(token: &str) -> bool {
    token.trim_start_matches(['0', '1', '2', '&']).starts_with('>')
}

fn is_in_place_sed(verb: &str, tokens: &[&str]) -> bool {
    verb == "sed" && tokens.iter().any(|t| t.starts_with("-i"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::new("/mnt/rio")
    }

    #[test]
    fn reads_are_unrestricted() {
        let sb = sandbox();
        for cmd in ["ls -la /etc", "cat /etc/hostname", "grep -r foo .", "ps aux"] {
            let (ok, reason) = sb.validate(cmd);
            assert!(ok, "{cmd} should pass, got: {reason}");
        }
    }

    #[test]
    fn destructive_commands_are_blocked_everywhere() {
        let sb = sandbox();
        for cmd in [
            "rm -rf /",
            "rm file-under-mount",
            "dd if=/dev/zero of=/dev/sda",
            "mkfs.ext4 /dev/sdb1",
            "shutdown -h now",
            "reboot",
            "umount /mnt/rio",
        ] {
            let (ok, reason) = sb.validate(cmd);
            assert!(!ok, "{cmd} must be blocked");
            assert!(!reason.is_empty());
        }
    }

    #[test]
    fn fork_bombs_are_blocked() {
        let (ok, reason) = sandbox().validate(":(){ :|:& };:");
        assert!(!ok);
        assert_eq!(reason, "fork bomb pattern");
    }

    #[test]
    fn mutations_inside_the_mount_are_allowed() {
        let sb = sandbox();
        for cmd in [
            "touch /mnt/rio/notes.txt",
            "mkdir /mnt/rio/scratch",
            "cp /mnt/rio/a /mnt/rio/b",
            "echo hi > /mnt/rio/out.log",
            "touch relative.txt",
        ] {
            let (ok, reason) = sb.validate(cmd);
            assert!(ok, "{cmd} should pass, got: {reason}");
        }
    }

    #[test]
    fn mutations_outside_the_mount_are_blocked() {
        let sb = sandbox();
        for cmd in [
            "touch /etc/evil",
            "cp /mnt/rio/a /tmp/b",
            "echo pwned > /etc/passwd",
            "mv /mnt/rio/../escape x",
            "tee ~/escape.txt",
        ] {
            let (ok, _) = sb.validate(cmd);
            assert!(!ok, "{cmd} must be blocked");
        }
    }

    #[test]
    fn block_device_writes_are_blocked_null_is_fine() {
        let sb = sandbox();
        assert!(!sb.validate("echo x > /dev/sda").0);
        assert!(sb.validate("echo x > /dev/null").0);
    }

    #[test]
    fn pipelines_check_every_segment() {
        let sb = sandbox();
        assert!(!sb.validate("cat notes | tee /etc/motd").0);
        assert!(sb.validate("cat notes | wc -l").0);
        assert!(!sb.validate("ls && rm -rf .").0);
    }

    #[test]
    fn in_place_sed_is_a_mutation() {
        let sb = sandbox();
        assert!(!sb.validate("sed -i s/a/b/ /etc/hosts").0);
        assert!(sb.validate("sed s/a/b/ /etc/hosts").0);
        assert!(sb.validate("sed -i s/a/b/ /mnt/rio/file").0);
    }

    #[test]
    fn validator_is_idempotent() {
        let sb = sandbox();
        for cmd in ["rm -rf /", "ls", "touch /mnt/rio/x", "dd of=/dev/sda"] {
            let first = sb.validate(cmd);
            for _ in 0..3 {
                assert_eq!(sb.validate(cmd), first);
            }
        }
    }

    #[test]
    fn permissive_fallback_accepts_everything() {
        let sb = Sandbox::permissive("/mnt/rio");
        assert!(sb.validate("rm -rf /").0);
        assert!(!sb.is_enforcing());
    }
}
