//! Terminal interpreter for the simulated shell.
//!
//! Commands come from a fixed table ([`Verb`]) where each verb declares its
//! arity and which arguments are paths. Execution order for a recognized
//! verb is always: allow-list, arity, path containment, then the file
//! system call. Nothing touches the VFS until every check has passed.

use crate::sandbox::{CommandRecord, PathAccess, SandboxPolicy};
use crate::vfs::{is_within, EntryKind, VfsError, VfsPath, VirtualFileSystem};
use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// Displayed lines kept for the terminal panel.
const SCROLLBACK_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Help,
    Ls,
    Cd,
    Pwd,
    Cat,
    Echo,
    Mkdir,
    Touch,
    Clear,
    Whoami,
    Date,
    History,
}

/// Which arguments of a verb name paths that must pass containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathArgs {
    None,
    All,
    /// Only the target of a `>`/`>>` redirection.
    Redirect,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub usage: &'static str,
    pub summary: &'static str,
    pub min_args: usize,
    pub max_args: Option<usize>,
    pub path_args: PathArgs,
}

impl Verb {
    pub const ALL: [Verb; 12] = [
        Verb::Help,
        Verb::Ls,
        Verb::Cd,
        Verb::Pwd,
        Verb::Cat,
        Verb::Echo,
        Verb::Mkdir,
        Verb::Touch,
        Verb::Clear,
        Verb::Whoami,
        Verb::Date,
        Verb::History,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Verb::Help => "help",
            Verb::Ls => "ls",
            Verb::Cd => "cd",
            Verb::Pwd => "pwd",
            Verb::Cat => "cat",
            Verb::Echo => "echo",
            Verb::Mkdir => "mkdir",
            Verb::Touch => "touch",
            Verb::Clear => "clear",
            Verb::Whoami => "whoami",
            Verb::Date => "date",
            Verb::History => "history",
        }
    }

    pub fn parse(name: &str) -> Option<Verb> {
        Verb::ALL.iter().copied().find(|v| v.name() == name)
    }

    pub fn spec(self) -> CommandSpec {
        let (usage, summary, min_args, max_args, path_args) = match self {
            Verb::Help => ("help [command]", "show available commands", 0, Some(1), PathArgs::None),
            Verb::Ls => ("ls [path]", "list directory contents", 0, Some(1), PathArgs::All),
            Verb::Cd => ("cd [path]", "change the current directory", 0, Some(1), PathArgs::All),
            Verb::Pwd => ("pwd", "print the current directory", 0, Some(0), PathArgs::None),
            Verb::Cat => ("cat <file>...", "print file contents", 1, None, PathArgs::All),
            Verb::Echo => ("echo <text> [> file]", "print text or write it to a file", 0, None, PathArgs::Redirect),
            Verb::Mkdir => ("mkdir <dir>...", "create directories", 1, None, PathArgs::All),
            Verb::Touch => ("touch <file>...", "create empty files", 1, None, PathArgs::All),
            Verb::Clear => ("clear", "clear the screen", 0, Some(0), PathArgs::None),
            Verb::Whoami => ("whoami", "print the current user", 0, Some(0), PathArgs::None),
            Verb::Date => ("date", "print the current date and time", 0, Some(0), PathArgs::None),
            Verb::History => ("history", "list previous commands", 0, Some(0), PathArgs::None),
        };
        CommandSpec {
            usage,
            summary,
            min_args,
            max_args,
            path_args,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub text: String,
    /// Set by `clear`; the display should wipe its output.
    pub clear_screen: bool,
}

impl CommandOutput {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            clear_screen: false,
        }
    }
}

/// Borrowed collaborators for one command.
pub struct TerminalContext<'a> {
    pub vfs: &'a mut VirtualFileSystem,
    pub policy: &'a mut SandboxPolicy,
    pub user: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Redirect {
    Overwrite,
    Append,
}

/// A parsed command whose paths have been resolved and checked.
struct Checked {
    verb: Verb,
    args: Vec<String>,
    paths: Vec<VfsPath>,
    redirect: Option<(Redirect, VfsPath)>,
}

#[derive(Debug, Clone)]
pub struct TerminalInterpreter {
    current_directory: VfsPath,
    history: Vec<String>,
    history_cursor: usize,
    scrollback: VecDeque<String>,
}

impl TerminalInterpreter {
    pub fn new(start_directory: &str) -> Self {
        Self {
            current_directory: VirtualFileSystem::resolve(start_directory, "/"),
            history: Vec::new(),
            history_cursor: 0,
            scrollback: VecDeque::new(),
        }
    }

    pub fn current_directory(&self) -> &str {
        &self.current_directory
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn history_cursor(&self) -> usize {
        self.history_cursor
    }

    pub fn scrollback(&self) -> impl Iterator<Item = &str> {
        self.scrollback.iter().map(String::as_str)
    }

    /// Replace cwd and history wholesale, as when restoring a snapshot.
    pub fn restore(&mut self, current_directory: &str, history: Vec<String>) {
        self.current_directory = VirtualFileSystem::resolve(current_directory, "/");
        self.history_cursor = history.len();
        self.history = history;
        self.scrollback.clear();
    }

    /// Run one command line. Errors of any kind come back as output text.
    pub fn execute(&mut self, line: &str, ctx: &mut TerminalContext<'_>) -> CommandOutput {
        let trimmed = line.trim();
        let mut tokens = trimmed.split_whitespace();
        let Some(name) = tokens.next() else {
            return CommandOutput::default();
        };
        let Some(verb) = Verb::parse(name) else {
            return CommandOutput::text(format!("{}: command not found", name));
        };
        let args: Vec<String> = tokens.map(str::to_string).collect();

        let output = match self.check(verb, args, &*ctx.policy) {
            Ok(checked) => {
                ctx.policy.record(CommandRecord {
                    raw: trimmed.to_string(),
                    verb: verb.name().to_string(),
                    args: checked.args.clone(),
                    timestamp: Utc::now(),
                    working_directory: self.current_directory.clone(),
                });
                self.run(checked, ctx)
            }
            Err(message) => CommandOutput::text(message),
        };
        debug!(verb = verb.name(), cwd = %self.current_directory, "Executed command");

        self.history.push(trimmed.to_string());
        self.history_cursor = self.history.len();
        if !output.clear_screen {
            self.display(format!("$ {}", trimmed));
            if !output.text.is_empty() {
                self.display(output.text.clone());
            }
        }
        output
    }

    /// Arity, allow-list and path checks. `Err` carries the text to show.
    fn check(
        &self,
        verb: Verb,
        mut args: Vec<String>,
        policy: &SandboxPolicy,
    ) -> Result<Checked, String> {
        let spec = verb.spec();
        if !policy.is_command_allowed(verb.name()) {
            return Err(format!("{}: permission denied", verb.name()));
        }

        let mut redirect = None;
        if spec.path_args == PathArgs::Redirect {
            if let Some(pos) = args.iter().position(|a| a == ">" || a == ">>") {
                let mode = if args[pos] == ">>" {
                    Redirect::Append
                } else {
                    Redirect::Overwrite
                };
                if args.len() != pos + 2 {
                    return Err(format!("usage: {}", spec.usage));
                }
                let target = args.pop().unwrap_or_default();
                args.truncate(pos);
                let resolved = self.resolve_arg(&target, policy);
                self.ensure_access(verb, &target, &resolved, policy)?;
                redirect = Some((mode, resolved));
            }
        }

        if args.len() < spec.min_args || spec.max_args.is_some_and(|max| args.len() > max) {
            return Err(format!("usage: {}", spec.usage));
        }

        let mut paths = Vec::new();
        if spec.path_args == PathArgs::All {
            let raw: Vec<String> = if args.is_empty() {
                match verb {
                    Verb::Cd => vec!["~".to_string()],
                    _ => vec![".".to_string()],
                }
            } else {
                args.clone()
            };
            for arg in &raw {
                let mut resolved = self.resolve_arg(arg, policy);
                if verb == Verb::Cd {
                    resolved = clamp_to_root(resolved, policy);
                }
                self.ensure_access(verb, arg, &resolved, policy)?;
                paths.push(resolved);
            }
        }

        Ok(Checked {
            verb,
            args,
            paths,
            redirect,
        })
    }

    fn resolve_arg(&self, arg: &str, policy: &SandboxPolicy) -> VfsPath {
        if arg == "~" {
            return policy.root().to_string();
        }
        if let Some(rest) = arg.strip_prefix("~/") {
            return VirtualFileSystem::resolve(rest, policy.root());
        }
        VirtualFileSystem::resolve(arg, &self.current_directory)
    }

    fn ensure_access(
        &self,
        verb: Verb,
        arg: &str,
        resolved: &str,
        policy: &SandboxPolicy,
    ) -> Result<(), String> {
        match policy.check_path_access(resolved) {
            PathAccess::Allowed => Ok(()),
            PathAccess::Denied(_) => Err(format!("{}: {}: Permission denied", verb.name(), arg)),
        }
    }

    fn run(&mut self, checked: Checked, ctx: &mut TerminalContext<'_>) -> CommandOutput {
        let Checked {
            verb,
            args,
            paths,
            redirect,
        } = checked;
        let text = match verb {
            Verb::Help => help_text(args.first().map(String::as_str)),
            Verb::Pwd => self.current_directory.clone(),
            Verb::Whoami => ctx.user.to_string(),
            Verb::Date => Utc::now().format("%a %b %e %H:%M:%S UTC %Y").to_string(),
            Verb::History => self
                .history
                .iter()
                .enumerate()
                .map(|(i, line)| format!("{:>5}  {}", i + 1, line))
                .collect::<Vec<_>>()
                .join("\n"),
            Verb::Clear => {
                self.scrollback.clear();
                return CommandOutput {
                    text: String::new(),
                    clear_screen: true,
                };
            }
            Verb::Ls => {
                let path = &paths[0];
                match ctx.vfs.list(path) {
                    Ok(entries) => entries
                        .into_iter()
                        .map(|e| match e.kind {
                            EntryKind::Directory => format!("{}/", e.name),
                            EntryKind::File => e.name,
                        })
                        .collect::<Vec<_>>()
                        .join("  "),
                    Err(VfsError::NotADirectory(_)) => args.first().cloned().unwrap_or_default(),
                    Err(e) => failure(verb, args.first().map_or(".", String::as_str), &e),
                }
            }
            Verb::Cd => {
                let target = &paths[0];
                if ctx.vfs.is_dir(target) {
                    self.current_directory = target.clone();
                    String::new()
                } else {
                    let arg = args.first().map_or("~", String::as_str);
                    let err = if ctx.vfs.exists(target) {
                        VfsError::NotADirectory(target.clone())
                    } else {
                        VfsError::NotFound(target.clone())
                    };
                    failure(verb, arg, &err)
                }
            }
            Verb::Cat => {
                let mut out = Vec::new();
                for (arg, path) in args.iter().zip(&paths) {
                    match ctx.vfs.read(path) {
                        Ok(content) => out.push(content.trim_end_matches('\n').to_string()),
                        Err(e) => out.push(failure(verb, arg, &e)),
                    }
                }
                out.join("\n")
            }
            Verb::Mkdir | Verb::Touch => {
                let mut out = Vec::new();
                for (arg, path) in args.iter().zip(&paths) {
                    let result = if verb == Verb::Mkdir {
                        ctx.vfs.mkdir(path)
                    } else {
                        ctx.vfs.touch(path)
                    };
                    if let Err(e) = result {
                        out.push(failure(verb, arg, &e));
                    }
                }
                out.join("\n")
            }
            Verb::Echo => {
                let text = unquote(&args.join(" "));
                match redirect {
                    None => text,
                    Some((mode, target)) => {
                        let line = format!("{}\n", text);
                        let result = match mode {
                            Redirect::Overwrite => ctx.vfs.write(&target, &line),
                            Redirect::Append => ctx.vfs.append(&target, &line),
                        };
                        match result {
                            Ok(()) => String::new(),
                            Err(e) => failure(verb, &target, &e),
                        }
                    }
                }
            }
        };
        CommandOutput::text(text)
    }

    fn display(&mut self, line: String) {
        if self.scrollback.len() == SCROLLBACK_LIMIT {
            self.scrollback.pop_front();
        }
        self.scrollback.push_back(line);
    }

    /// Up-arrow recall. Returns the entry at the new cursor.
    pub fn recall_previous(&mut self) -> String {
        if self.history_cursor > 0 {
            self.history_cursor -= 1;
        }
        self.entry_at_cursor()
    }

    /// Down-arrow recall. Empty string once past the newest entry.
    pub fn recall_next(&mut self) -> String {
        if self.history_cursor < self.history.len() {
            self.history_cursor += 1;
        }
        self.entry_at_cursor()
    }

    fn entry_at_cursor(&self) -> String {
        self.history
            .get(self.history_cursor)
            .cloned()
            .unwrap_or_default()
    }
}

/// Ancestors of the sandbox root collapse onto the root, so `cd ..` and
/// `cd /` from the root leave the directory unchanged.
fn clamp_to_root(resolved: VfsPath, policy: &SandboxPolicy) -> VfsPath {
    if policy.is_sandboxed() && resolved != policy.root() && is_within(policy.root(), &resolved) {
        policy.root().to_string()
    } else {
        resolved
    }
}

fn failure(verb: Verb, arg: &str, err: &VfsError) -> String {
    let reason = match err {
        VfsError::NotFound(_) => "No such file or directory",
        VfsError::AlreadyExists(_) => "File exists",
        VfsError::NotADirectory(_) => "Not a directory",
        VfsError::IsADirectory(_) => "Is a directory",
        VfsError::InvalidTree(_) => "Invalid argument",
    };
    format!("{}: {}: {}", verb.name(), arg, reason)
}

fn unquote(text: &str) -> String {
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return text[1..text.len() - 1].to_string();
        }
    }
    text.to_string()
}

fn help_text(topic: Option<&str>) -> String {
    match topic {
        Some(name) => match Verb::parse(name) {
            Some(verb) => {
                let spec = verb.spec();
                format!("{}\n    {}", spec.usage, spec.summary)
            }
            None => format!("help: no help topics match '{}'", name),
        },
        None => {
            let mut lines = vec!["Available commands:".to_string()];
            lines.extend(Verb::ALL.iter().map(|v| {
                let spec = v.spec();
                format!("  {:<22} {}", spec.usage, spec.summary)
            }));
            lines.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{AuditLog, SandboxConfig};

    struct Fixture {
        vfs: VirtualFileSystem,
        policy: SandboxPolicy,
        term: TerminalInterpreter,
    }

    impl Fixture {
        fn new(sandboxed: bool) -> Self {
            let config = SandboxConfig::new(
                "/home/student",
                Verb::ALL.iter().map(|v| v.name()),
                ["/home/student/private"],
            )
            .unwrap();
            Self::with_config(config, sandboxed)
        }

        fn with_config(config: SandboxConfig, sandboxed: bool) -> Self {
            Self {
                vfs: VirtualFileSystem::seeded("/home/student"),
                policy: SandboxPolicy::new(config, sandboxed, AuditLog::new("stu", "lab")),
                term: TerminalInterpreter::new("/home/student"),
            }
        }

        fn run(&mut self, line: &str) -> String {
            let mut ctx = TerminalContext {
                vfs: &mut self.vfs,
                policy: &mut self.policy,
                user: "stu",
            };
            self.term.execute(line, &mut ctx).text
        }
    }

    #[test]
    fn unknown_verb_leaves_state_untouched() {
        let mut f = Fixture::new(true);
        assert_eq!(f.run("frobnicate now"), "frobnicate: command not found");
        assert!(f.term.history().is_empty());
        assert!(f.policy.audit_log().is_empty());
    }

    #[test]
    fn empty_line_is_a_no_op() {
        let mut f = Fixture::new(true);
        assert_eq!(f.run("   "), "");
        assert!(f.term.history().is_empty());
    }

    #[test]
    fn cd_up_from_root_stays_at_root() {
        let mut f = Fixture::new(true);
        for _ in 0..5 {
            f.run("cd ..");
            assert_eq!(f.term.current_directory(), "/home/student");
        }
        f.run("cd /");
        assert_eq!(f.term.current_directory(), "/home/student");
    }

    #[test]
    fn cd_without_argument_returns_home() {
        let mut f = Fixture::new(true);
        f.run("cd examples");
        assert_eq!(f.term.current_directory(), "/home/student/examples");
        f.run("cd");
        assert_eq!(f.term.current_directory(), "/home/student");
    }

    #[test]
    fn cd_reports_missing_and_file_targets() {
        let mut f = Fixture::new(true);
        assert_eq!(f.run("cd nowhere"), "cd: nowhere: No such file or directory");
        assert_eq!(f.run("cd readme.txt"), "cd: readme.txt: Not a directory");
        assert_eq!(f.term.current_directory(), "/home/student");
    }

    #[test]
    fn ls_lists_home_in_insertion_order() {
        let mut f = Fixture::new(true);
        assert_eq!(f.run("ls"), "readme.txt  examples/");
        assert_eq!(f.run("ls examples"), "hello.py");
        assert_eq!(f.run("ls ghost"), "ls: ghost: No such file or directory");
    }

    #[test]
    fn paths_outside_root_are_denied_before_touching_vfs() {
        let mut f = Fixture::new(true);
        assert_eq!(f.run("cat /etc/passwd"), "cat: /etc/passwd: Permission denied");
        assert_eq!(f.run("mkdir ../../escape"), "mkdir: ../../escape: Permission denied");
        assert!(!f.vfs.exists("/escape"));
        assert_eq!(f.run("touch private"), "touch: private: Permission denied");
        assert!(!f.vfs.exists("/home/student/private"));
        assert!(f.policy.audit_log().is_empty());
    }

    #[test]
    fn disallowed_command_is_rejected_and_not_audited() {
        let config = SandboxConfig::new("/home/student", ["ls", "pwd"], Vec::<String>::new()).unwrap();
        let mut f = Fixture::with_config(config, true);
        let before = f.vfs.paths();
        assert_eq!(f.run("cat /etc/passwd"), "cat: permission denied");
        assert_eq!(f.run("touch new.txt"), "touch: permission denied");
        assert_eq!(f.vfs.paths(), before);
        assert!(f.policy.audit_log().is_empty());
        f.run("pwd");
        assert_eq!(f.policy.audit_log().len(), 1);
    }

    #[test]
    fn unsandboxed_session_can_leave_root() {
        let mut f = Fixture::new(false);
        assert_eq!(f.run("cat /etc/passwd"), "root:x:0:0:root:/root:/bin/sh");
        f.run("cd ..");
        assert_eq!(f.term.current_directory(), "/home");
    }

    #[test]
    fn file_commands_mutate_vfs() {
        let mut f = Fixture::new(true);
        assert_eq!(f.run("mkdir notes"), "");
        assert_eq!(f.run("mkdir notes"), "mkdir: notes: File exists");
        f.run("touch notes/a.txt");
        f.run("echo \"hello there\" > notes/a.txt");
        f.run("echo again >> notes/a.txt");
        assert_eq!(f.run("cat notes/a.txt"), "hello there\nagain");
        assert_eq!(f.run("cat examples"), "cat: examples: Is a directory");
        assert_eq!(f.run("echo plain text"), "plain text");
        assert_eq!(f.run("echo x >"), "usage: echo <text> [> file]");
    }

    #[test]
    fn arity_violations_print_usage() {
        let mut f = Fixture::new(true);
        assert_eq!(f.run("cat"), "usage: cat <file>...");
        assert_eq!(f.run("pwd extra"), "usage: pwd");
    }

    #[test]
    fn whoami_pwd_and_help() {
        let mut f = Fixture::new(true);
        assert_eq!(f.run("whoami"), "stu");
        assert_eq!(f.run("pwd"), "/home/student");
        assert!(f.run("help").contains("mkdir <dir>..."));
        assert_eq!(f.run("help cd"), "cd [path]\n    change the current directory");
        assert!(!f.run("date").is_empty());
    }

    #[test]
    fn clear_wipes_scrollback_but_not_history() {
        let mut f = Fixture::new(true);
        f.run("pwd");
        f.run("ls");
        assert!(f.term.scrollback().count() > 0);
        let mut ctx = TerminalContext {
            vfs: &mut f.vfs,
            policy: &mut f.policy,
            user: "stu",
        };
        let out = f.term.execute("clear", &mut ctx);
        assert!(out.clear_screen);
        assert_eq!(f.term.scrollback().count(), 0);
        assert_eq!(f.term.history(), &["pwd", "ls", "clear"]);
    }

    #[test]
    fn history_recall_is_clamped() {
        let mut f = Fixture::new(true);
        let commands = ["pwd", "ls", "whoami"];
        for c in commands {
            f.run(c);
        }
        assert_eq!(f.term.history_cursor(), 3);
        assert_eq!(f.term.recall_previous(), "whoami");
        assert_eq!(f.term.recall_previous(), "ls");
        assert_eq!(f.term.recall_previous(), "pwd");
        assert_eq!(f.term.recall_previous(), "pwd");
        assert_eq!(f.term.history_cursor(), 0);
        for _ in 0..commands.len() {
            f.term.recall_next();
        }
        assert_eq!(f.term.history_cursor(), 3);
        assert_eq!(f.term.recall_next(), "");
        assert_eq!(f.term.history_cursor(), 3);
    }

    #[test]
    fn executing_resets_history_cursor() {
        let mut f = Fixture::new(true);
        f.run("pwd");
        f.run("ls");
        f.term.recall_previous();
        f.term.recall_previous();
        f.run("whoami");
        assert_eq!(f.term.history_cursor(), 3);
    }

    #[test]
    fn every_verb_is_parseable_by_name() {
        for verb in Verb::ALL {
            assert_eq!(Verb::parse(verb.name()), Some(verb));
        }
    }
}
