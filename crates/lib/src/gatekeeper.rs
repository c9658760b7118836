//! Gatekeeper: the single entry point for terminal commands.
//!
//! `execute` classifies the line, handles `clear` / `help` / `exit` itself, checks the
//! policy entry and only then hands the command to the runner. Every input, hostile or not,
//! ends in a well-formed [`ExecutionResult`]; nothing here returns an error or retries.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::command::{self, Intent, ParsedCommand, SpecialCommand};
use crate::exec::{CommandRunner, Sandbox, SandboxSettings};
use crate::policy::{CommandPolicy, PolicyTable};

/// Directive the calling UI must obey; the gatekeeper itself does neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Directive {
    /// Clear the terminal output.
    Clear,
    /// End the interactive session.
    Exit,
}

/// Which class of result this is, so UIs can render them differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Success,
    Special,
    EmptyInput,
    UnknownCommand,
    Denied,
    Timeout,
    SpawnFailure,
    NonZeroExit,
}

/// Result of one `execute` call (wire shape: camelCase JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub succeeded: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special: Option<Directive>,
    #[serde(default)]
    pub timed_out: bool,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            output: output.into(),
            special: None,
            timed_out: false,
            outcome: Outcome::Success,
            exit_code: None,
            truncated: false,
        }
    }

    pub fn failure(outcome: Outcome, output: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            outcome,
            ..Self::success(output)
        }
    }

    pub fn rejected(rejection: &Rejection) -> Self {
        Self::failure(rejection.outcome(), rejection.to_string())
    }

    fn directive(directive: Directive) -> Self {
        Self {
            special: Some(directive),
            outcome: Outcome::Special,
            ..Self::success("")
        }
    }
}

/// Why a command was not executed. `Display` is the user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("no command entered")]
    EmptyInput,
    #[error("command not found or not permitted: {0} (type 'help' to list available commands)")]
    Unknown(String),
    #[error("permission denied: {name} is blocked ({reason})")]
    Blocked { name: String, reason: String },
    #[error("permission denied: {0} requires elevated privileges, which this terminal never grants")]
    Elevation(String),
    #[error("permission denied: {name} {argument} requires elevated privileges, which this terminal never grants")]
    ElevatedArgument { name: String, argument: String },
    #[error("{0} needs an interactive terminal; open a real terminal window to use it")]
    Interactive(String),
    #[error("permission denied: flag {flag} is not allowed for {name}")]
    Flag { name: String, flag: String },
    #[error("permission denied: {name} requires one of {allowed}")]
    OperationRequired { name: String, allowed: String },
    #[error("permission denied: {name} only allows these subcommands: {allowed}")]
    Subcommand { name: String, allowed: String },
    #[error("permission denied: {name} {subcommand} {action} is not allowed")]
    Action {
        name: String,
        subcommand: String,
        action: String,
    },
}

impl Rejection {
    pub fn outcome(&self) -> Outcome {
        match self {
            Rejection::EmptyInput => Outcome::EmptyInput,
            Rejection::Unknown(_) => Outcome::UnknownCommand,
            _ => Outcome::Denied,
        }
    }
}

/// One classified command plus its policy entry (if any).
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'a> {
    pub raw_input: String,
    pub command_name: String,
    pub arguments: Vec<String>,
    pub resolved_policy: Option<&'a CommandPolicy>,
}

impl<'a> ExecutionRequest<'a> {
    /// Look up the policy by command name only.
    pub fn resolve(parsed: ParsedCommand, policies: &'a PolicyTable) -> Self {
        let resolved_policy = policies.lookup(&parsed.name);
        Self {
            raw_input: parsed.raw_input,
            command_name: parsed.name,
            arguments: parsed.arguments,
            resolved_policy,
        }
    }

    fn flags(&self) -> impl Iterator<Item = &str> {
        self.arguments
            .iter()
            .map(String::as_str)
            .filter(|a| command::is_flag(a))
    }
}

/// Decide whether a request may run. Checks run from coarse to fine: unknown, blocked,
/// elevation, TTY, elevated flags and subcommands, denied flags, flag allowlist, required
/// operation, subcommand rule.
pub fn authorize<'a>(request: &ExecutionRequest<'a>) -> Result<&'a CommandPolicy, Rejection> {
    let name = request.command_name.clone();
    let Some(policy) = request.resolved_policy else {
        return Err(Rejection::Unknown(name));
    };
    if !policy.permitted {
        let reason = policy
            .danger_reason
            .clone()
            .unwrap_or_else(|| "blocked by policy".to_string());
        return Err(Rejection::Blocked { name, reason });
    }
    if policy.requires_elevation {
        return Err(Rejection::Elevation(name));
    }
    if policy.requires_interactive_terminal {
        return Err(Rejection::Interactive(name));
    }

    if let Some(flag) = request.flags().find(|f| policy.flag_requires_elevation(f)) {
        return Err(Rejection::ElevatedArgument {
            name,
            argument: flag.to_string(),
        });
    }
    let subcommand = request.arguments.first().map(String::as_str);
    if let (Some(rule), Some(sub)) = (&policy.subcommands, subcommand) {
        if rule.elevated.contains(sub) {
            return Err(Rejection::ElevatedArgument {
                name,
                argument: sub.to_string(),
            });
        }
    }
    if let Some(flag) = request
        .flags()
        .find(|f| policy.flag_denied(f) || policy.flag_outside_allowlist(f))
    {
        return Err(Rejection::Flag {
            name,
            flag: flag.to_string(),
        });
    }
    if policy.requires_operation && request.flags().next().is_none() {
        let allowed = policy
            .allowed_flags
            .as_ref()
            .map(|flags| flags.iter().map(String::as_str).collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        return Err(Rejection::OperationRequired { name, allowed });
    }

    if let Some(rule) = &policy.subcommands {
        let allowed_actions = subcommand
            .filter(|s| !command::is_flag(s))
            .and_then(|s| rule.allowed.get(s).map(|actions| (s, actions)));
        let Some((sub, actions)) = allowed_actions else {
            return Err(Rejection::Subcommand {
                name,
                allowed: rule.allowed_names().join(", "),
            });
        };
        if let Some(actions) = actions {
            let action = request.arguments[1..]
                .iter()
                .find(|a| !command::is_flag(a));
            if let Some(action) = action.filter(|a| !actions.contains(a.as_str())) {
                return Err(Rejection::Action {
                    name,
                    subcommand: sub.to_string(),
                    action: action.clone(),
                });
            }
        }
    }
    Ok(policy)
}

/// Command gatekeeper. Cheap to clone; the policy table is shared read-only.
#[derive(Clone)]
pub struct Gatekeeper {
    policies: Arc<PolicyTable>,
    settings: SandboxSettings,
    runner: Arc<dyn CommandRunner>,
}

impl Gatekeeper {
    /// Gatekeeper that spawns real processes.
    pub fn new(policies: Arc<PolicyTable>, settings: SandboxSettings) -> Self {
        Self::with_runner(policies, settings, Arc::new(Sandbox))
    }

    pub fn with_runner(
        policies: Arc<PolicyTable>,
        settings: SandboxSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            policies,
            settings,
            runner,
        }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn help_text(&self) -> String {
        self.policies.help_text()
    }

    /// Classify, authorize and (when allowed) run one terminal line.
    pub async fn execute(&self, raw_input: &str) -> ExecutionResult {
        let parsed = match command::classify(raw_input) {
            Intent::Empty => return ExecutionResult::rejected(&Rejection::EmptyInput),
            Intent::Special(special) => {
                log::debug!("gatekeeper: special command {}", special.as_str());
                return match special {
                    SpecialCommand::Clear => ExecutionResult::directive(Directive::Clear),
                    SpecialCommand::Exit => ExecutionResult::directive(Directive::Exit),
                    SpecialCommand::Help => ExecutionResult {
                        outcome: Outcome::Special,
                        ..ExecutionResult::success(self.help_text())
                    },
                };
            }
            Intent::Run(parsed) => parsed,
        };

        let request = ExecutionRequest::resolve(parsed, &self.policies);
        let policy = match authorize(&request) {
            Ok(policy) => policy,
            Err(rejection) => {
                log::warn!(
                    "gatekeeper: rejected {:?}: {}",
                    request.raw_input,
                    rejection
                );
                return ExecutionResult::rejected(&rejection);
            }
        };

        let sandbox_request =
            self.settings
                .request(&request.command_name, &request.arguments, policy.timeout_ms);
        let started = Instant::now();
        let result = self
            .runner
            .run(&sandbox_request)
            .await
            .into_result(&sandbox_request);
        log::info!(
            "gatekeeper: ran {:?} in {} ms ({:?})",
            request.raw_input,
            started.elapsed().as_millis(),
            result.outcome
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CapturedOutput, RunOutcome, SandboxRequest};
    use crate::policy::{Category, CommandPolicy};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every request and answers with a fixed successful run.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<SandboxRequest>>,
    }

    impl RecordingRunner {
        fn calls(&self) -> Vec<SandboxRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, request: &SandboxRequest) -> RunOutcome {
            self.calls.lock().unwrap().push(request.clone());
            RunOutcome::Completed {
                exit_code: Some(0),
                output: CapturedOutput {
                    stdout: format!("ran {}\n", request.program),
                    ..CapturedOutput::default()
                },
            }
        }
    }

    fn settings() -> SandboxSettings {
        SandboxSettings {
            working_dir: std::env::temp_dir(),
            ..SandboxSettings::default()
        }
    }

    fn recording() -> (Gatekeeper, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::default());
        let gk = Gatekeeper::with_runner(
            Arc::new(PolicyTable::builtin()),
            settings(),
            runner.clone(),
        );
        (gk, runner)
    }

    #[tokio::test]
    async fn empty_input_is_informational() {
        let (gk, runner) = recording();
        for input in ["", "   ", "\t\n"] {
            let res = gk.execute(input).await;
            assert!(!res.succeeded);
            assert_eq!(res.outcome, Outcome::EmptyInput);
            assert_eq!(res.output, "no command entered");
        }
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_commands_never_spawn() {
        let (gk, runner) = recording();
        for input in ["nmap -sS host", "LS", "/bin/ls", "ls;rm", "foo bar baz"] {
            let res = gk.execute(input).await;
            assert!(!res.succeeded, "{}", input);
            assert_eq!(res.outcome, Outcome::UnknownCommand, "{}", input);
            assert!(res.output.contains("not found or not permitted"));
            assert!(res.output.contains("help"));
        }
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn denied_commands_ignore_arguments() {
        let (gk, runner) = recording();
        let a = gk.execute("rm -rf /").await;
        let b = gk.execute("rm somefile").await;
        assert_eq!(a, b);
        assert_eq!(a.outcome, Outcome::Denied);
        assert!(a.output.contains("data-loss risk"));
        for input in ["sudo pacman -S vim", "dd if=/dev/zero of=/dev/sda", "curl http://x", "su", "mkfs.ext4"] {
            let res = gk.execute(input).await;
            assert!(!res.succeeded, "{}", input);
        }
        let sudo = gk.execute("sudo ls").await;
        assert!(sudo.output.contains("privilege escalation is never granted"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn specials_short_circuit() {
        let (gk, runner) = recording();
        let clear = gk.execute("clear").await;
        assert!(clear.succeeded);
        assert_eq!(clear.special, Some(Directive::Clear));
        let exit = gk.execute("exit").await;
        assert_eq!(exit.special, Some(Directive::Exit));
        let help = gk.execute("help").await;
        assert!(help.succeeded);
        assert_eq!(help.special, None);
        assert_eq!(help.outcome, Outcome::Special);
        assert!(help.output.contains("Packages"));
        assert_eq!(gk.execute("--help").await, help);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn interactive_commands_are_denied() {
        let (gk, runner) = recording();
        let res = gk.execute("htop").await;
        assert!(!res.succeeded);
        assert_eq!(res.outcome, Outcome::Denied);
        assert!(res.output.contains("real terminal"));
        assert!(gk.execute("less /etc/hosts").await.output.contains("real terminal"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn elevation_entries_are_denied() {
        let (gk, runner) = recording();
        let res = gk.execute("reboot").await;
        assert_eq!(res.outcome, Outcome::Denied);
        assert!(res.output.contains("elevated privileges"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn pacman_flag_restrictions() {
        let (gk, runner) = recording();
        let install = gk.execute("pacman -S vim").await;
        assert!(!install.succeeded);
        assert!(install.output.contains("-S requires elevated privileges"));
        for input in ["pacman -Syu", "pacman -R vim", "pacman -U pkg.tar.zst", "yay -S foo", "pacman -Qi vim"] {
            assert_eq!(gk.execute(input).await.outcome, Outcome::Denied, "{}", input);
        }
        assert!(runner.calls().is_empty());

        let search = gk.execute("pacman -Ss vim").await;
        assert!(search.succeeded);
        assert_eq!(search.output, "ran pacman");
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "pacman");
        assert_eq!(calls[0].args, vec!["-Ss", "vim"]);
        assert_eq!(calls[0].timeout, Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn package_managers_without_an_operation_never_spawn() {
        let (gk, runner) = recording();
        for input in ["yay", "yay vim", "pacman", "pacman vim"] {
            let res = gk.execute(input).await;
            assert!(!res.succeeded, "{}", input);
            assert_eq!(res.outcome, Outcome::Denied, "{}", input);
        }
        assert!(runner.calls().is_empty());
        let bare = gk.execute("pacman").await;
        assert_eq!(bare.output, "permission denied: pacman requires one of -Q, -Ql, -Si, -Ss");
        assert!(gk.execute("yay -Q").await.succeeded);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn git_subcommands() {
        let (gk, runner) = recording();
        for ok in ["git status", "git log --oneline -n 5", "git diff HEAD~1", "git branch", "git remote -v", "git remote show origin"] {
            assert!(gk.execute(ok).await.succeeded, "{}", ok);
        }
        let allowed = runner.calls().len();
        for bad in [
            "git",
            "git push",
            "git commit -m x",
            "git -C /tmp status",
            "git branch newbranch",
            "git branch -D main",
            "git remote add evil url",
            "git diff --output=/tmp/x",
        ] {
            let res = gk.execute(bad).await;
            assert_eq!(res.outcome, Outcome::Denied, "{}", bad);
        }
        assert_eq!(runner.calls().len(), allowed);
        let push = gk.execute("git push").await;
        assert!(push.output.contains("branch, diff, log, remote, status"));
    }

    #[tokio::test]
    async fn systemctl_read_only() {
        let (gk, runner) = recording();
        assert!(gk.execute("systemctl status sshd").await.succeeded);
        let restart = gk.execute("systemctl restart sshd").await;
        assert_eq!(restart.outcome, Outcome::Denied);
        assert!(restart.output.contains("restart requires elevated privileges"));
        assert_eq!(gk.execute("systemctl").await.outcome, Outcome::Denied);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn find_uses_wider_timeout_and_denies_exec() {
        let (gk, runner) = recording();
        assert!(gk.execute("find . -name '*.rs'").await.succeeded);
        assert_eq!(runner.calls()[0].timeout, Duration::from_millis(10_000));
        let res = gk.execute("find . -delete").await;
        assert!(res.output.contains("flag -delete is not allowed for find"));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn runner_receives_sandbox_settings() {
        let (gk, runner) = recording();
        gk.execute("ls -la").await;
        let call = &runner.calls()[0];
        assert_eq!(call.working_dir, std::env::temp_dir());
        assert_eq!(call.max_output_bytes, crate::exec::DEFAULT_MAX_OUTPUT_BYTES);
    }

    #[tokio::test]
    async fn custom_table_is_respected() {
        let runner = Arc::new(RecordingRunner::default());
        let table = PolicyTable::new([CommandPolicy::allow("true", Category::SystemInfo, "Succeed").timeout_ms(42)]);
        let gk = Gatekeeper::with_runner(Arc::new(table), settings(), runner.clone());
        assert_eq!(gk.execute("ls").await.outcome, Outcome::UnknownCommand);
        assert!(gk.execute("true").await.succeeded);
        assert_eq!(runner.calls()[0].timeout, Duration::from_millis(42));
    }

    #[test]
    fn result_serializes_camel_case() {
        let res = ExecutionResult {
            timed_out: true,
            ..ExecutionResult::failure(Outcome::Timeout, "slow")
        };
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["timedOut"], true);
        assert_eq!(json["outcome"], "timeout");
        assert!(json.get("special").is_none());
        let clear = serde_json::to_value(ExecutionResult::directive(Directive::Clear)).unwrap();
        assert_eq!(clear["special"], "clear");
    }

    #[cfg(unix)]
    mod real_processes {
        use super::*;

        fn gatekeeper() -> Gatekeeper {
            Gatekeeper::new(Arc::new(PolicyTable::builtin()), settings())
        }

        #[tokio::test]
        async fn whoami_reports_current_user() {
            let expected = std::process::Command::new("id")
                .arg("-un")
                .output()
                .expect("id -un");
            let expected = String::from_utf8_lossy(&expected.stdout).trim().to_string();
            let res = gatekeeper().execute("whoami").await;
            assert!(res.succeeded, "{}", res.output);
            assert_eq!(res.output, expected);
        }

        #[tokio::test]
        async fn pwd_is_repeatable_and_table_unchanged() {
            let gk = gatekeeper();
            let before = gk.policies().len();
            let first = gk.execute("pwd").await;
            let second = gk.execute("pwd").await;
            assert!(first.succeeded && second.succeeded);
            assert_eq!(first.output, second.output);
            assert_eq!(gk.policies().len(), before);
            assert_eq!(gk.policies().lookup("pwd"), PolicyTable::builtin().lookup("pwd"));
        }

        #[tokio::test]
        async fn timeout_from_policy() {
            let table = PolicyTable::new([CommandPolicy::allow("sleep", Category::SystemInfo, "Sleep").timeout_ms(200)]);
            let gk = Gatekeeper::new(Arc::new(table), settings());
            let started = Instant::now();
            let res = gk.execute("sleep 5").await;
            assert!(res.timed_out);
            assert!(!res.succeeded);
            assert!(res.output.contains("200 ms"));
            assert!(started.elapsed() < Duration::from_millis(200 + 1_500));
        }

        #[tokio::test]
        async fn concurrent_calls_are_independent() {
            let gk = gatekeeper();
            let (a, b, c) = tokio::join!(gk.execute("echo one"), gk.execute("echo two"), gk.execute("rm x"));
            assert_eq!(a.output, "one");
            assert_eq!(b.output, "two");
            assert_eq!(c.outcome, Outcome::Denied);
        }
    }
}
