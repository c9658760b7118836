//! Command classifier: turn a raw terminal line into a structured intent.
//!
//! Pure mapping from string to intent. Splits on runs of whitespace, takes the first token
//! as the command name (case-sensitive, no alias resolution, no expansion) and recognizes
//! the built-in pseudo-commands before any policy lookup happens.

use serde::{Deserialize, Serialize};

/// Built-in pseudo-commands handled without consulting the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialCommand {
    /// UI should clear its output buffer.
    Clear,
    /// Return the generated help text.
    Help,
    /// UI should end the interactive session (the host process keeps running).
    Exit,
}

impl SpecialCommand {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "clear" => Some(Self::Clear),
            "help" | "--help" => Some(Self::Help),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Help => "help",
            Self::Exit => "exit",
        }
    }
}

/// A non-empty, non-special command line split into name and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Original input with surrounding whitespace removed.
    pub raw_input: String,
    /// First whitespace-delimited token.
    pub name: String,
    /// Remaining tokens, in order.
    pub arguments: Vec<String>,
}

impl ParsedCommand {
    /// Argument tokens that look like flags (`-x`, `--long`, `--key=value`). A bare `-` is stdin, not a flag.
    pub fn flags(&self) -> impl Iterator<Item = &str> {
        self.arguments
            .iter()
            .map(String::as_str)
            .filter(|a| is_flag(a))
    }

    /// Arguments that are not flags, in order.
    pub fn positionals(&self) -> impl Iterator<Item = &str> {
        self.arguments
            .iter()
            .map(String::as_str)
            .filter(|a| !is_flag(a))
    }
}

/// Result of classification. Classification never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Empty or whitespace-only input.
    Empty,
    Special(SpecialCommand),
    Run(ParsedCommand),
}

pub fn is_flag(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-')
}

/// Classify a raw terminal line.
pub fn classify(input: &str) -> Intent {
    let raw_input = input.trim();
    let mut tokens = raw_input.split_whitespace();
    let Some(name) = tokens.next() else {
        return Intent::Empty;
    };
    if let Some(special) = SpecialCommand::from_name(name) {
        return Intent::Special(special);
    }
    Intent::Run(ParsedCommand {
        raw_input: raw_input.to_string(),
        name: name.to_string(),
        arguments: tokens.map(String::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &str) -> ParsedCommand {
        match classify(input) {
            Intent::Run(p) => p,
            other => panic!("expected Run, got {:?}", other),
        }
    }

    #[test]
    fn empty_and_whitespace_only() {
        assert_eq!(classify(""), Intent::Empty);
        assert_eq!(classify("   \t \n"), Intent::Empty);
    }

    #[test]
    fn special_commands() {
        assert_eq!(classify("clear"), Intent::Special(SpecialCommand::Clear));
        assert_eq!(classify("  help "), Intent::Special(SpecialCommand::Help));
        assert_eq!(classify("--help"), Intent::Special(SpecialCommand::Help));
        assert_eq!(classify("help ls"), Intent::Special(SpecialCommand::Help));
        assert_eq!(classify("exit"), Intent::Special(SpecialCommand::Exit));
    }

    #[test]
    fn special_names_are_case_sensitive() {
        assert_eq!(run("CLEAR").name, "CLEAR");
        assert_eq!(run("Exit now").name, "Exit");
    }

    #[test]
    fn splits_on_runs_of_whitespace() {
        let p = run("  pacman   -Ss\t vim  ");
        assert_eq!(p.raw_input, "pacman   -Ss\t vim");
        assert_eq!(p.name, "pacman");
        assert_eq!(p.arguments, vec!["-Ss", "vim"]);
    }

    #[test]
    fn metacharacters_stay_in_tokens() {
        let p = run("ls;rm -rf ~");
        assert_eq!(p.name, "ls;rm");
        let p = run("/bin/rm x");
        assert_eq!(p.name, "/bin/rm");
        let p = run("echo $HOME");
        assert_eq!(p.arguments, vec!["$HOME"]);
    }

    #[test]
    fn flags_and_positionals() {
        let p = run("grep -n --color=never pattern - file");
        assert_eq!(p.flags().collect::<Vec<_>>(), vec!["-n", "--color=never"]);
        assert_eq!(p.positionals().collect::<Vec<_>>(), vec!["pattern", "-", "file"]);
    }
}
