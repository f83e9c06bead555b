// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

/// Outcome of the destructive-command filter.
#[derive(Debug, Clone)]
pub struct CommandDecision {
    pub blocked: bool,
    pub reason: String,
}

impl CommandDecision {
    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: reason.into(),
        }
    }

    fn clear() -> Self {
        Self {
            blocked: false,
            reason: String::new(),
        }
    }
}

/// Shell-command filter for the bash tool.
///
/// The built-in patterns catch the classic foot-guns; caller-supplied
/// regexes extend the set per deployment. Matching happens on a lowercased,
/// whitespace-collapsed copy of the command.
#[derive(Debug, Default)]
pub struct CommandPolicy {
    extra: Vec<Regex>,
}

impl CommandPolicy {
    /// Compile caller-supplied patterns. Invalid regexes are skipped with a
    /// warning rather than disabling the whole filter.
    pub fn new(extra_patterns: &[String]) -> Self {
        let extra = extra_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "ignoring invalid blocked-command pattern");
                    None
                }
            })
            .collect();
        Self { extra }
    }

    pub fn check(&self, command: &str) -> CommandDecision {
        let normalized = normalize(command);

        if let Some(reason) = builtin_block_reason(&normalized) {
            return CommandDecision::blocked(reason);
        }
        for re in &self.extra {
            if re.is_match(&normalized) {
                return CommandDecision::blocked(format!(
                    "command matches blocked pattern: {}",
                    re.as_str()
                ));
            }
        }
        CommandDecision::clear()
    }
}

fn normalize(command: &str) -> String {
    command
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn static_res() -> &'static StaticPatterns {
    static RES: OnceLock<StaticPatterns> = OnceLock::new();
    RES.get_or_init(|| StaticPatterns {
        sudo: Regex::new(r"(^|[;&|]\s*)sudo\b").unwrap(),
        power: Regex::new(r"(^|[;&|]\s*)(shutdown|reboot|halt)\b").unwrap(),
        mkfs: Regex::new(r"\bmkfs(\.[a-z0-9]+)?\b").unwrap(),
        dd: Regex::new(r"\bdd\s+if=").unwrap(),
        chmod: Regex::new(r"\bchmod\s+777\b").unwrap(),
    })
}

struct StaticPatterns {
    sudo: Regex,
    power: Regex,
    mkfs: Regex,
    dd: Regex,
    chmod: Regex,
}

fn builtin_block_reason(cmd: &str) -> Option<String> {
    if is_dangerous_rm(cmd) {
        return Some("recursive force-delete of a critical path".into());
    }
    let res = static_res();
    if res.sudo.is_match(cmd) {
        return Some("privilege escalation via sudo".into());
    }
    if res.power.is_match(cmd) {
        return Some("system power command".into());
    }
    if res.mkfs.is_match(cmd) {
        return Some("filesystem format command".into());
    }
    if res.dd.is_match(cmd) {
        return Some("raw disk write via dd".into());
    }
    if res.chmod.is_match(cmd) {
        return Some("world-writable permission change".into());
    }
    if is_force_push_to_protected(cmd) {
        return Some("force push to a protected branch".into());
    }
    None
}

/// `rm` with a recursive + force combination aimed at `/`, `~`, `*`, or `/*`.
fn is_dangerous_rm(cmd: &str) -> bool {
    let tokens: Vec<&str> = cmd.split(' ').collect();
    let Some(rm_at) = tokens.iter().position(|t| *t == "rm") else {
        return false;
    };

    let mut recursive = false;
    let mut force = false;
    let mut dangerous_target = false;
    for tok in &tokens[rm_at + 1..] {
        if let Some(flags) = tok.strip_prefix("--") {
            recursive |= flags == "recursive";
            force |= flags == "force";
        } else if let Some(flags) = tok.strip_prefix('-') {
            recursive |= flags.contains('r');
            force |= flags.contains('f');
        } else {
            dangerous_target |= matches!(*tok, "/" | "~" | "*" | "/*");
        }
    }
    recursive && force && dangerous_target
}

/// `git push` carrying `--force`/`-f` with main/master among its arguments.
fn is_force_push_to_protected(cmd: &str) -> bool {
    if !cmd.contains("git push") {
        return false;
    }
    let tokens: Vec<&str> = cmd.split(' ').collect();
    let forced = tokens
        .iter()
        .any(|t| *t == "--force" || *t == "-f" || *t == "--force-with-lease");
    if !forced {
        return false;
    }
    tokens.iter().any(|t| {
        matches!(*t, "main" | "master")
            || t.ends_with("refs/heads/main")
            || t.ends_with("refs/heads/master")
            || t.ends_with(":main")
            || t.ends_with(":master")
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(cmd: &str) -> bool {
        CommandPolicy::default().check(cmd).blocked
    }

    #[test]
    fn rm_rf_root_variants() {
        assert!(blocked("rm -rf /"));
        assert!(blocked("rm -rf /*"));
        assert!(blocked("rm -fr ~"));
        assert!(blocked("rm -r -f *"));
        assert!(blocked("rm --recursive --force /"));
    }

    #[test]
    fn scoped_rm_is_allowed() {
        assert!(!blocked("rm -rf /tmp/build"));
        assert!(!blocked("rm file.txt"));
        assert!(!blocked("rm -r ./target"));
    }

    #[test]
    fn sudo_and_power_commands() {
        assert!(blocked("sudo reboot"));
        assert!(blocked("sudo apt install x"));
        assert!(blocked("shutdown -h now"));
        assert!(blocked("reboot"));
        assert!(blocked("echo hi && halt"));
    }

    #[test]
    fn disk_level_commands() {
        assert!(blocked("mkfs.ext4 /dev/sda1"));
        assert!(blocked("mkfs /dev/sdb"));
        assert!(blocked("dd if=/dev/zero of=/dev/disk1"));
        assert!(blocked("chmod 777 /etc"));
    }

    #[test]
    fn force_push_to_protected_branch() {
        assert!(blocked("git push --force origin main"));
        assert!(blocked("git push -f origin master"));
        assert!(blocked("git push --force origin refs/heads/main"));
        assert!(!blocked("git push origin feature/x"));
        assert!(!blocked("git push --force origin feature/x"));
    }

    #[test]
    fn ordinary_commands_pass() {
        assert!(!blocked("ls -la"));
        assert!(!blocked("cargo test"));
        assert!(!blocked("grep -rn pattern src/"));
    }

    #[test]
    fn case_and_whitespace_are_normalized() {
        assert!(blocked("SUDO   Reboot"));
        assert!(blocked("RM  -RF   /"));
    }

    #[test]
    fn extra_patterns_extend_the_filter() {
        let p = CommandPolicy::new(&["curl .*evil".to_string()]);
        let d = p.check("curl http://evil.example");
        assert!(d.blocked);
        assert!(d.reason.contains("blocked pattern"));
        assert!(!p.check("curl http://good.example").blocked);
    }

    #[test]
    fn invalid_extra_pattern_is_skipped() {
        let p = CommandPolicy::new(&["([unclosed".to_string()]);
        assert!(!p.check("ls").blocked);
    }
}
