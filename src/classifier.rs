//! Pattern-based risk tagging for commands.
//!
//! Classification only annotates; it never blocks execution.

use std::sync::LazyLock;

use regex::Regex;

/// Named matchers, evaluated in order. All are case-insensitive.
const RULES: &[(&str, &str)] = &[
    (
        "recursive delete",
        r"(?i)\brm\s+(?:-[\w-]+\s+)*-(?:[a-z]*r[a-z]*|-recursive)\b|\b(?:rmdir|rd)\s+(?:/\w\s+)*/s\b|\bdel\s+(?:/\w\s+)*/s\b|\bremove-item\b.*-recurse",
    ),
    (
        "disk formatting",
        r"(?i)\bmkfs(?:\.\w+)?\b|\bformat\s+[a-z]:|\bformat-volume\b|\bclear-disk\b|\bdiskpart\b|\bdd\s+.*\bof=/dev/",
    ),
    (
        "forced process kill",
        r"(?i)\bkill\s+(?:-s\s+)?-?(?:9|kill|sigkill)\b|\bkillall\b|\bpkill\b|\btaskkill\b.*\s/f\b|\bstop-process\b.*-force",
    ),
    (
        "force push",
        r"(?i)\bgit\s+push\b.*(?:\s--force(?:-with-lease)?\b|\s-f\b)",
    ),
    (
        "history rewrite",
        r"(?i)\bgit\s+(?:reset\s+--hard|clean\s+-[a-z]*f)",
    ),
    (
        "registry or service change",
        r"(?i)\breg(?:\.exe)?\s+delete\b|\bremove-itemproperty\b|\bsc(?:\.exe)?\s+(?:delete|stop)\b|\b(?:stop|remove)-service\b|\bsystemctl\s+(?:stop|disable|mask)\b",
    ),
    (
        "shutdown or restart",
        r"(?i)\b(?:shutdown|reboot|halt|poweroff)\b|\b(?:restart|stop)-computer\b|\binit\s+[06]\b",
    ),
    (
        "dangerous redirection",
        r"(?i)>\s*/dev/(?:sd|hd|nvme|disk|mmcblk)\w*|>\s*/etc/\w+|>\s*[a-z]:\\windows\\",
    ),
];

static COMPILED_RULES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    RULES
        .iter()
        .filter_map(|(name, pattern)| match Regex::new(pattern) {
            Ok(regex) => Some((*name, regex)),
            Err(e) => {
                tracing::warn!("invalid classifier rule '{}': {}", name, e);
                None
            }
        })
        .collect()
});

/// Name of the first rule `command` matches, if any.
#[must_use]
pub fn matched_rule(command: &str) -> Option<&'static str> {
    COMPILED_RULES
        .iter()
        .find(|(_, regex)| regex.is_match(command))
        .map(|(name, _)| *name)
}

/// Whether `command` looks destructive.
#[must_use]
pub fn is_destructive(command: &str) -> bool {
    matched_rule(command).is_some()
}
