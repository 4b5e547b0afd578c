//! Shell dialect resolution and cross-dialect command proxying.
//!
//! A pane runs one of two interpreters. [`ShellKind::PosixLike`] is the
//! extended shell (PowerShell on Windows, bash on Unix) and
//! [`ShellKind::LegacyCmd`] is the minimal command interpreter (`cmd.exe` on
//! Windows, `/bin/sh` on Unix). Users paste commands written for the extended
//! shell into legacy panes; [`DialectProxy`] detects those and rewrites them
//! into a single encoded invocation of the extended shell.
//!
//! Detection follows the platform's extended shell: cmdlet and variable-sigil
//! syntax on Windows, bash-only constructs (`[[`, brace ranges, arrays,
//! here-strings, process substitution) on Unix.

use std::sync::LazyLock;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Logical shell kind a pane is started with.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShellKind {
    /// Extended interactive shell.
    #[default]
    PosixLike,
    /// Minimal legacy command interpreter.
    LegacyCmd,
}

impl std::fmt::Display for ShellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PosixLike => f.write_str("posixLike"),
            Self::LegacyCmd => f.write_str("legacyCmd"),
        }
    }
}

/// Executable plus argument vector used to start an interpreter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Program to execute (resolved through `PATH` when not absolute).
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl LaunchSpec {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }

    fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[cfg(windows)]
mod platform {
    pub const POSIX_LIKE: &str = "powershell.exe";
    pub const POSIX_LIKE_INTERACTIVE: &[&str] =
        &["-NoLogo", "-NoProfile", "-ExecutionPolicy", "Bypass"];
    pub const POSIX_LIKE_ONE_SHOT: &[&str] = &[
        "-NoLogo",
        "-NoProfile",
        "-NonInteractive",
        "-ExecutionPolicy",
        "Bypass",
        "-Command",
    ];
    pub const LEGACY: &str = "cmd.exe";
    pub const LEGACY_INTERACTIVE: &[&str] = &["/D"];
    pub const LEGACY_ONE_SHOT: &[&str] = &["/D", "/S", "/C"];
}

#[cfg(not(windows))]
mod platform {
    pub const POSIX_LIKE: &str = "bash";
    pub const POSIX_LIKE_INTERACTIVE: &[&str] = &["--noprofile", "--norc", "-i"];
    pub const POSIX_LIKE_ONE_SHOT: &[&str] = &["--noprofile", "--norc", "-c"];
    pub const LEGACY: &str = "/bin/sh";
    pub const LEGACY_INTERACTIVE: &[&str] = &[];
    pub const LEGACY_ONE_SHOT: &[&str] = &["-c"];
}

/// Interactive launch spec for a shell kind.
#[must_use]
pub fn launch_spec_for(kind: ShellKind) -> LaunchSpec {
    match kind {
        ShellKind::PosixLike => {
            LaunchSpec::new(platform::POSIX_LIKE, platform::POSIX_LIKE_INTERACTIVE)
        }
        ShellKind::LegacyCmd => LaunchSpec::new(platform::LEGACY, platform::LEGACY_INTERACTIVE),
    }
}

/// One-shot, non-interactive spec that runs `command` and exits.
#[must_use]
pub fn exec_spec_for(kind: ShellKind, command: &str) -> LaunchSpec {
    let base = match kind {
        ShellKind::PosixLike => LaunchSpec::new(platform::POSIX_LIKE, platform::POSIX_LIKE_ONE_SHOT),
        ShellKind::LegacyCmd => LaunchSpec::new(platform::LEGACY, platform::LEGACY_ONE_SHOT),
    };
    base.with_arg(command)
}

/// PowerShell constructs `cmd.exe` cannot run.
static CMDLET_SYNTAX: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        // Verb-Noun cmdlet tokens
        r"(?i)(?:^|[\s;|(&{])(?:get|set|new|remove|add|clear|copy|move|rename|select|where|foreach|sort|format|out|write|read|invoke|start|stop|restart|test|import|export|convertto|convertfrom|measure|resolve|split|join|push|pop|enable|disable|install|uninstall|update|register|unregister|wait|expand|compress)-[a-z]\w*",
        // $env:NAME drive access
        r"(?i)\$env:\w+",
        // automatic variables
        r"(?i)\$(?:_|true|false|null|psversiontable|psscriptroot|host|lastexitcode)\b",
        // $name = value assignment
        r"(?:^|[\s;])\$\{?\w+\}?\s*=[^=]",
        // array and hashtable literals
        r"@[({]",
        // static member access on type literals
        r"\[[A-Za-z][\w.]*\]::",
        // pipeline into script-block aliases
        r"(?i)\|\s*(?:%|\?|where|foreach)\s*\{",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

/// Bash constructs a plain POSIX `sh` cannot run.
static BASH_SYNTAX: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        // [[ extended test ]]
        r"(?:^|[\s;&|(!])\[\[\s",
        // {1..5} brace ranges
        r"\{-?\w+\.\.-?\w+(?:\.\.\d+)?\}",
        // name=(array literal)
        r"(?:^|[\s;&|])\w+(?:\[[^\]]*\])?=\(",
        // here-strings
        r"<<<",
        // process substitution
        r"(?:^|\s)[<>]\(",
        // ${!indirect}, ${arr[i]}, ${v/pat/rep}, ${v^^}, ${v,,}, ${v:1:2}
        r"\$\{!\w+|\$\{#?\w+\[|\$\{\w+(?:/|\^|,|:-?\d)",
        // $'ANSI-C quoting'
        r"\$'",
        // &> redirection of both streams
        r"(?:^|[^&>\d])&>",
        // bash-only builtins and keywords in command position
        r"(?:^|[;&|(]\s*)(?:declare|typeset|shopt|mapfile|readarray|source|let|function)\s",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

fn extended_syntax() -> &'static RegexSet {
    if cfg!(windows) {
        &CMDLET_SYNTAX
    } else {
        &BASH_SYNTAX
    }
}

/// Heuristic check for extended-shell syntax that the legacy interpreter
/// cannot run.
#[must_use]
pub fn looks_like_other_dialect(command: &str) -> bool {
    extended_syntax().is_match(command)
}

/// Wraps `command` as one encoded invocation of the extended shell.
#[must_use]
pub fn proxy_command_for(command: &str) -> String {
    let spec = launch_spec_for(ShellKind::PosixLike);
    encoded_invocation(&spec.program, command)
}

#[cfg(windows)]
fn encoded_invocation(program: &str, command: &str) -> String {
    // -EncodedCommand takes base64 over UTF-16LE.
    let utf16: Vec<u8> = command.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let encoded = BASE64_STANDARD.encode(utf16);
    format!("{program} -NoLogo -NoProfile -NonInteractive -ExecutionPolicy Bypass -EncodedCommand {encoded}")
}

#[cfg(not(windows))]
fn encoded_invocation(program: &str, command: &str) -> String {
    let encoded = BASE64_STANDARD.encode(command.as_bytes());
    format!("{program} --noprofile --norc -c \"$(echo {encoded} | base64 -d)\"")
}

/// Pluggable dialect detection and rewriting used by the session controller.
pub trait DialectProxy: Send + Sync {
    /// Whether `command` is written for the extended shell.
    fn looks_like_other_dialect(&self, command: &str) -> bool;

    /// Encoded extended-shell invocation of `command`.
    fn proxy_command_for(&self, command: &str) -> String;

    /// Text to actually write into a session of `kind`.
    ///
    /// Only legacy sessions are rewritten.
    fn rewrite(&self, kind: ShellKind, command: &str) -> Option<String> {
        (kind == ShellKind::LegacyCmd && self.looks_like_other_dialect(command))
            .then(|| self.proxy_command_for(command))
    }
}

/// Default [`DialectProxy`] built on the platform's extended-syntax patterns.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyntaxHeuristic;

impl DialectProxy for SyntaxHeuristic {
    fn looks_like_other_dialect(&self, command: &str) -> bool {
        looks_like_other_dialect(command)
    }

    fn proxy_command_for(&self, command: &str) -> String {
        proxy_command_for(command)
    }
}
