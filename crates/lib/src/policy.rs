//! Policy table: command name -> capability descriptor.
//!
//! The table is built once (usually [`PolicyTable::builtin`]) and shared read-only behind an
//! `Arc`. Lookup is by command name only; arguments never select a different entry.
//! Entries are allowlist-style: a name missing from the table is never executed.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Timeout applied to every entry unless it overrides it.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Grouping used for help text and policy listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    SystemInfo,
    Monitoring,
    FileOperations,
    Network,
    Logs,
    Packages,
    Administration,
    Dangerous,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SystemInfo => "System-Info",
            Self::Monitoring => "Monitoring",
            Self::FileOperations => "File Operations",
            Self::Network => "Network",
            Self::Logs => "Logs",
            Self::Packages => "Packages",
            Self::Administration => "Administration",
            Self::Dangerous => "Dangerous",
        }
    }
}

/// Restricts a command to enumerated subcommands (first argument), e.g. `git status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubcommandRule {
    /// Allowed subcommand -> allowed actions. An action is the first positional after the
    /// subcommand (`git remote show`). `None` allows any action; an empty set allows none.
    pub allowed: BTreeMap<String, Option<BTreeSet<String>>>,
    /// Subcommands that would need elevated privileges; rejected with the elevation message.
    pub elevated: BTreeSet<String>,
}

impl SubcommandRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow a subcommand with any trailing arguments.
    pub fn allow(mut self, subcommand: &str) -> Self {
        self.allowed.insert(subcommand.to_string(), None);
        self
    }

    /// Allow a subcommand whose first positional, when present, is one of `actions`.
    pub fn allow_actions(mut self, subcommand: &str, actions: &[&str]) -> Self {
        self.allowed.insert(
            subcommand.to_string(),
            Some(actions.iter().map(|s| s.to_string()).collect()),
        );
        self
    }

    pub fn elevated(mut self, subcommands: &[&str]) -> Self {
        self.elevated
            .extend(subcommands.iter().map(|s| s.to_string()));
        self
    }

    pub fn allowed_names(&self) -> Vec<&str> {
        self.allowed.keys().map(String::as_str).collect()
    }
}

/// Capability descriptor for one command name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPolicy {
    pub name: String,
    pub category: Category,
    /// One-line description used by help text.
    pub description: String,
    pub permitted: bool,
    /// Why the command is blocked (set when `permitted` is false).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub danger_reason: Option<String>,
    pub timeout_ms: u64,
    /// Needs a privilege this terminal never grants; always rejected.
    pub requires_elevation: bool,
    /// Expects a TTY the sandbox cannot provide; always rejected.
    pub requires_interactive_terminal: bool,
    /// When set, every flag argument must be one of these.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_flags: Option<BTreeSet<String>>,
    /// At least one allowed flag must be given; a bare invocation is refused (`yay` alone upgrades).
    pub requires_operation: bool,
    /// Flags that would need elevation (install/remove). A single-letter short flag also
    /// matches clusters starting with it (`-S` matches `-Syu`) unless the cluster is allowed.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub elevated_flags: BTreeSet<String>,
    /// Flags refused even though the command itself is permitted.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub denied_flags: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcommands: Option<SubcommandRule>,
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// `--key=value` compares as `--key`.
fn flag_key(flag: &str) -> &str {
    flag.split_once('=').map(|(k, _)| k).unwrap_or(flag)
}

impl CommandPolicy {
    /// A permitted command with the default timeout and no restrictions.
    pub fn allow(name: &str, category: Category, description: &str) -> Self {
        Self {
            name: name.to_string(),
            category,
            description: description.to_string(),
            permitted: true,
            danger_reason: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            requires_elevation: false,
            requires_interactive_terminal: false,
            allowed_flags: None,
            requires_operation: false,
            elevated_flags: BTreeSet::new(),
            denied_flags: BTreeSet::new(),
            subcommands: None,
        }
    }

    /// A command that is never executed, whatever its arguments.
    pub fn deny(name: &str, reason: &str) -> Self {
        Self {
            permitted: false,
            danger_reason: Some(reason.to_string()),
            ..Self::allow(name, Category::Dangerous, reason)
        }
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn interactive(mut self) -> Self {
        self.requires_interactive_terminal = true;
        self
    }

    pub fn elevation(mut self) -> Self {
        self.requires_elevation = true;
        self
    }

    pub fn allowed_flags(mut self, flags: &[&str]) -> Self {
        self.allowed_flags = Some(set(flags));
        self
    }

    pub fn requires_operation(mut self) -> Self {
        self.requires_operation = true;
        self
    }

    pub fn elevated_flags(mut self, flags: &[&str]) -> Self {
        self.elevated_flags = set(flags);
        self
    }

    pub fn denied_flags(mut self, flags: &[&str]) -> Self {
        self.denied_flags = set(flags);
        self
    }

    pub fn subcommands(mut self, rule: SubcommandRule) -> Self {
        self.subcommands = Some(rule);
        self
    }

    /// True when `flag` is outside `allowed_flags` (always false when no restriction is set).
    pub fn flag_outside_allowlist(&self, flag: &str) -> bool {
        self.allowed_flags
            .as_ref()
            .map_or(false, |allowed| !allowed.contains(flag_key(flag)))
    }

    pub fn flag_requires_elevation(&self, flag: &str) -> bool {
        let key = flag_key(flag);
        if self.elevated_flags.contains(key) {
            return true;
        }
        if key.starts_with("--")
            || self
                .allowed_flags
                .as_ref()
                .map_or(false, |allowed| allowed.contains(key))
        {
            return false;
        }
        self.elevated_flags.iter().any(|e| {
            e.len() == 2 && !e.starts_with("--") && key.starts_with(e.as_str())
        })
    }

    pub fn flag_denied(&self, flag: &str) -> bool {
        self.denied_flags.contains(flag_key(flag))
    }
}

/// Immutable command-name -> policy map.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    entries: BTreeMap<String, CommandPolicy>,
}

/// Curated help examples: (category, example invocation). The description comes from the table.
const HELP_EXAMPLES: &[(Category, &str)] = &[
    (Category::SystemInfo, "uname -a"),
    (Category::SystemInfo, "whoami"),
    (Category::SystemInfo, "uptime"),
    (Category::SystemInfo, "date"),
    (Category::Monitoring, "ps aux"),
    (Category::Monitoring, "free -h"),
    (Category::Monitoring, "df -h"),
    (Category::Monitoring, "lscpu"),
    (Category::FileOperations, "ls -la"),
    (Category::FileOperations, "pwd"),
    (Category::FileOperations, "cat <file>"),
    (Category::FileOperations, "find . -name <pattern>"),
    (Category::Network, "ip addr"),
    (Category::Network, "ping -c 4 <host>"),
    (Category::Network, "ss -tuln"),
    (Category::Logs, "journalctl -n 50"),
    (Category::Logs, "dmesg"),
    (Category::Packages, "pacman -Q"),
    (Category::Packages, "pacman -Ss <term>"),
    (Category::Packages, "yay -Ss <term>"),
];

const HELP_CATEGORIES: &[Category] = &[
    Category::SystemInfo,
    Category::Monitoring,
    Category::FileOperations,
    Category::Network,
    Category::Logs,
    Category::Packages,
];

impl PolicyTable {
    /// Build a table from entries. A later entry with the same name replaces an earlier one.
    pub fn new(entries: impl IntoIterator<Item = CommandPolicy>) -> Self {
        let mut map = BTreeMap::new();
        for entry in entries {
            if let Some(old) = map.insert(entry.name.clone(), entry) {
                log::debug!("policy entry for {} replaced", old.name);
            }
        }
        Self { entries: map }
    }

    pub fn lookup(&self, name: &str) -> Option<&CommandPolicy> {
        self.entries.get(name)
    }

    /// All entries in name order.
    pub fn entries(&self) -> impl Iterator<Item = &CommandPolicy> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Help text grouped by category. Examples whose command is missing or blocked in this table are skipped.
    pub fn help_text(&self) -> String {
        let mut out = String::from("Available commands:\n");
        for category in HELP_CATEGORIES {
            let lines: Vec<String> = HELP_EXAMPLES
                .iter()
                .filter(|(c, _)| c == category)
                .filter_map(|(_, example)| {
                    let name = example.split_whitespace().next()?;
                    let policy = self.lookup(name).filter(|p| p.permitted)?;
                    Some(format!("  {:<24} {}", example, policy.description))
                })
                .collect();
            if lines.is_empty() {
                continue;
            }
            out.push('\n');
            out.push_str(category.label());
            out.push_str(":\n");
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out.push_str("\nTerminal:\n");
        out.push_str(&format!("  {:<24} {}\n", "clear", "Clear the terminal output"));
        out.push_str(&format!("  {:<24} {}\n", "help", "Show this help"));
        out.push_str(&format!("  {:<24} {}\n", "exit", "Close this terminal session"));
        out
    }

    /// Default table for the dashboard terminal.
    pub fn builtin() -> Self {
        use Category::*;
        Self::new([
            // Informational
            CommandPolicy::allow("ls", FileOperations, "List directory contents"),
            CommandPolicy::allow("pwd", FileOperations, "Print the working directory"),
            CommandPolicy::allow("whoami", SystemInfo, "Show the current user"),
            CommandPolicy::allow("date", SystemInfo, "Show date and time"),
            CommandPolicy::allow("uptime", SystemInfo, "Show how long the system has been running"),
            CommandPolicy::allow("id", SystemInfo, "Show user and group ids"),
            CommandPolicy::allow("groups", SystemInfo, "Show group memberships"),
            CommandPolicy::allow("uname", SystemInfo, "Show kernel and system information"),
            CommandPolicy::allow("hostname", SystemInfo, "Show the host name"),
            CommandPolicy::allow("echo", SystemInfo, "Print arguments"),
            // Monitoring
            CommandPolicy::allow("top", Monitoring, "Process snapshot (use -b -n1)"),
            CommandPolicy::allow("ps", Monitoring, "List processes"),
            CommandPolicy::allow("df", Monitoring, "Show disk usage"),
            CommandPolicy::allow("free", Monitoring, "Show memory usage"),
            CommandPolicy::allow("lscpu", Monitoring, "Show CPU information"),
            CommandPolicy::allow("lsblk", Monitoring, "List block devices"),
            CommandPolicy::allow("lsusb", Monitoring, "List USB devices"),
            CommandPolicy::allow("lspci", Monitoring, "List PCI devices"),
            CommandPolicy::allow("sensors", Monitoring, "Show hardware temperatures"),
            CommandPolicy::allow("mount", Monitoring, "List mounted filesystems"),
            CommandPolicy::allow("htop", Monitoring, "Interactive process viewer").interactive(),
            CommandPolicy::allow("less", FileOperations, "Page through a file").interactive(),
            CommandPolicy::allow("vim", FileOperations, "Text editor").interactive(),
            CommandPolicy::allow("nano", FileOperations, "Text editor").interactive(),
            CommandPolicy::allow("ssh", Network, "Remote shell").interactive(),
            // Network
            CommandPolicy::allow("ip", Network, "Show network interfaces and routes"),
            CommandPolicy::allow("netstat", Network, "Show network connections"),
            CommandPolicy::allow("ss", Network, "Show listening sockets"),
            CommandPolicy::allow("ping", Network, "Probe a host").timeout_ms(5_000),
            // Logs
            CommandPolicy::allow("dmesg", Logs, "Show kernel messages")
                .denied_flags(&["-C", "--clear", "-c", "--read-clear", "-D", "--console-off", "-E", "--console-on"]),
            CommandPolicy::allow("journalctl", Logs, "Show system journal entries").denied_flags(&[
                "--vacuum-size",
                "--vacuum-time",
                "--vacuum-files",
                "--rotate",
                "--flush",
                "--sync",
                "--relinquish-var",
                "--setup-keys",
            ]),
            // Bounded file inspection
            CommandPolicy::allow("cat", FileOperations, "Print a file"),
            CommandPolicy::allow("head", FileOperations, "Print the start of a file"),
            CommandPolicy::allow("tail", FileOperations, "Print the end of a file"),
            CommandPolicy::allow("more", FileOperations, "Print a file"),
            CommandPolicy::allow("file", FileOperations, "Identify a file type"),
            CommandPolicy::allow("wc", FileOperations, "Count lines, words and bytes"),
            CommandPolicy::allow("grep", FileOperations, "Search file contents"),
            CommandPolicy::allow("find", FileOperations, "Search for files")
                .timeout_ms(10_000)
                .denied_flags(&[
                    "-delete", "-exec", "-execdir", "-ok", "-okdir", "-fprint", "-fprint0", "-fprintf", "-fls",
                ]),
            // Constrained administrative
            CommandPolicy::allow("systemctl", Administration, "Inspect systemd units").subcommands(
                SubcommandRule::new()
                    .allow("status")
                    .allow("list-units")
                    .allow("list-unit-files")
                    .allow("list-timers")
                    .allow("is-active")
                    .allow("is-enabled")
                    .allow("is-failed")
                    .allow("show")
                    .allow("cat")
                    .elevated(&[
                        "start",
                        "stop",
                        "restart",
                        "reload",
                        "try-restart",
                        "reload-or-restart",
                        "enable",
                        "disable",
                        "reenable",
                        "mask",
                        "unmask",
                        "kill",
                        "edit",
                        "set-property",
                        "daemon-reload",
                        "isolate",
                        "reboot",
                        "poweroff",
                        "halt",
                        "suspend",
                        "hibernate",
                    ]),
            ),
            pacman_like("pacman", "Query and search packages"),
            pacman_like("yay", "Query and search packages (including AUR)"),
            CommandPolicy::allow("git", Administration, "Inspect a git repository")
                .subcommands(
                    SubcommandRule::new()
                        .allow("status")
                        .allow("log")
                        .allow("diff")
                        .allow_actions("branch", &[])
                        .allow_actions("remote", &["show", "get-url"]),
                )
                .denied_flags(&[
                    "--output",
                    "--ext-diff",
                    "-d",
                    "-D",
                    "--delete",
                    "-m",
                    "-M",
                    "--move",
                    "-c",
                    "-C",
                    "--copy",
                    "-f",
                    "--force",
                    "-u",
                    "--set-upstream-to",
                    "--unset-upstream",
                    "--edit-description",
                ]),
            CommandPolicy::allow("reboot", Administration, "Restart the machine").elevation(),
            CommandPolicy::allow("shutdown", Administration, "Power off the machine").elevation(),
            CommandPolicy::allow("poweroff", Administration, "Power off the machine").elevation(),
            // Denied outright
            CommandPolicy::deny("rm", "data-loss risk: deletes files"),
            CommandPolicy::deny("mv", "data-loss risk: moves or overwrites files"),
            CommandPolicy::deny("cp", "data-loss risk: overwrites files"),
            CommandPolicy::deny("chmod", "changes file permissions"),
            CommandPolicy::deny("chown", "changes file ownership"),
            CommandPolicy::deny("sudo", "privilege escalation is never granted"),
            CommandPolicy::deny("su", "privilege escalation is never granted"),
            CommandPolicy::deny("passwd", "changes account credentials"),
            CommandPolicy::deny("fdisk", "data-loss risk: edits partition tables"),
            CommandPolicy::deny("parted", "data-loss risk: edits partition tables"),
            CommandPolicy::deny("mkfs", "data-loss risk: formats filesystems"),
            CommandPolicy::deny("dd", "data-loss risk: raw device writes"),
            CommandPolicy::deny("wget", "network downloads are not allowed"),
            CommandPolicy::deny("curl", "network downloads are not allowed"),
        ])
    }
}

fn pacman_like(name: &str, description: &str) -> CommandPolicy {
    CommandPolicy::allow(name, Category::Packages, description)
        .allowed_flags(&["-Q", "-Ss", "-Si", "-Ql"])
        .requires_operation()
        .elevated_flags(&["-S", "-R", "-U", "--sync", "--remove", "--upgrade", "--database"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup_and_defaults() {
        let table = PolicyTable::builtin();
        let ls = table.lookup("ls").expect("ls");
        assert!(ls.permitted);
        assert_eq!(ls.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(table.lookup("find").map(|p| p.timeout_ms), Some(10_000));
        assert_eq!(table.lookup("ping").map(|p| p.timeout_ms), Some(5_000));
        assert!(table.lookup("LS").is_none());
        assert!(table.lookup("nmap").is_none());
    }

    #[test]
    fn denied_entries_carry_reason() {
        let table = PolicyTable::builtin();
        for name in [
            "rm", "mv", "cp", "chmod", "chown", "sudo", "su", "passwd", "fdisk", "mkfs", "dd", "wget",
            "curl",
        ] {
            let p = table.lookup(name).unwrap_or_else(|| panic!("{} missing", name));
            assert!(!p.permitted, "{} should be denied", name);
            assert!(p.danger_reason.is_some(), "{} needs a reason", name);
        }
    }

    #[test]
    fn interactive_entries() {
        let table = PolicyTable::builtin();
        assert!(table.lookup("htop").unwrap().requires_interactive_terminal);
        assert!(table.lookup("less").unwrap().requires_interactive_terminal);
        assert!(!table.lookup("top").unwrap().requires_interactive_terminal);
    }

    #[test]
    fn pacman_flag_rules() {
        let table = PolicyTable::builtin();
        let pacman = table.lookup("pacman").unwrap();
        for ok in ["-Q", "-Ss", "-Si", "-Ql"] {
            assert!(!pacman.flag_outside_allowlist(ok), "{}", ok);
            assert!(!pacman.flag_requires_elevation(ok), "{}", ok);
        }
        for elevated in ["-S", "-R", "-U", "-Syu", "-Rns", "--sync", "--remove=x"] {
            assert!(pacman.flag_requires_elevation(elevated), "{}", elevated);
        }
        assert!(pacman.flag_outside_allowlist("-Qi"));
        assert!(!pacman.flag_requires_elevation("-Qi"));
        assert!(pacman.flag_outside_allowlist("--dbpath=/tmp"));
    }

    #[test]
    fn package_managers_need_an_operation() {
        let table = PolicyTable::builtin();
        for name in ["pacman", "yay"] {
            assert!(table.lookup(name).unwrap().requires_operation, "{}", name);
        }
        assert!(!table.lookup("ls").unwrap().requires_operation);
    }

    #[test]
    fn denied_flags_match_key_before_equals() {
        let git = CommandPolicy::allow("git", Category::Administration, "git").denied_flags(&["--output"]);
        assert!(git.flag_denied("--output=/tmp/x"));
        assert!(git.flag_denied("--output"));
        assert!(!git.flag_denied("--oneline"));
    }

    #[test]
    fn new_keeps_last_entry_for_duplicate_names() {
        let table = PolicyTable::new([
            CommandPolicy::allow("x", Category::SystemInfo, "first"),
            CommandPolicy::deny("x", "second"),
        ]);
        assert_eq!(table.len(), 1);
        assert!(!table.lookup("x").unwrap().permitted);
    }

    #[test]
    fn help_text_groups_categories() {
        let text = PolicyTable::builtin().help_text();
        for label in ["System-Info", "Monitoring", "File Operations", "Network", "Logs", "Packages"] {
            assert!(text.contains(label), "missing {}", label);
        }
        assert!(text.contains("pacman -Ss <term>"));
        assert!(text.contains("Show memory usage"));
        assert!(!text.contains("rm "));
    }

    #[test]
    fn help_text_skips_missing_commands() {
        let table = PolicyTable::new([CommandPolicy::allow("uptime", Category::SystemInfo, "Up")]);
        let text = table.help_text();
        assert!(text.contains("System-Info"));
        assert!(!text.contains("Packages"));
    }
}
