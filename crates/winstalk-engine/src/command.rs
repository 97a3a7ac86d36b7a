use std::collections::BTreeMap;
use std::path::PathBuf;

/// Describes a process to spawn under the debugger.
///
/// ```no_run
/// use winstalk_engine::Command;
///
/// let command = Command::new("C:\\Windows\\System32\\notepad.exe")
///     .arg("C:\\some file.txt")
///     .env("WINSTALK", "1")
///     .follow_children(true);
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// Program to spawn.
    pub program: PathBuf,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// Environment of the process to spawn.
    pub env: CommandEnv,

    /// Working directory of the process to spawn.
    pub current_dir: Option<PathBuf>,

    /// Whether processes spawned by the debuggee are debugged too.
    pub follow_children: bool,
}

impl Command {
    /// Constructs a new `Command` for `program`, without arguments, inheriting
    /// the environment and working directory of the debugger, and without
    /// following child processes.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: CommandEnv::Inherit(BTreeMap::new()),
            current_dir: None,
            follow_children: false,
        }
    }

    /// Adds one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        args.into_iter().fold(self, |cmd, arg| cmd.arg(arg))
    }

    /// Inserts or updates an environment variable.
    ///
    /// Variable names are case-insensitive on Windows, so the variable is
    /// stored as given and compared by the OS.
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        match self.env {
            CommandEnv::Inherit(ref mut env) => {
                env.insert(key.into(), Some(val.into()));
            }
            CommandEnv::NoInherit(ref mut env) => {
                env.insert(key.into(), val.into());
            }
        }

        self
    }

    /// Inserts or updates multiple environment variables.
    pub fn envs<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        vars.into_iter().fold(self, |cmd, (k, v)| cmd.env(k, v))
    }

    /// Removes an environment variable, even if inherited.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        match self.env {
            CommandEnv::Inherit(ref mut env) => {
                env.insert(key.into(), None);
            }
            CommandEnv::NoInherit(ref mut env) => {
                env.remove(&key.into());
            }
        }

        self
    }

    /// Clears the environment, disabling inheritance.
    pub fn env_clear(mut self) -> Self {
        self.env = CommandEnv::NoInherit(BTreeMap::new());
        self
    }

    /// Sets the working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Sets whether child processes of the debuggee are debugged too.
    pub fn follow_children(mut self, follow: bool) -> Self {
        self.follow_children = follow;
        self
    }

    /// Builds the command line passed to the OS, quoting the program and
    /// every argument following the MSVC runtime parsing rules.
    pub fn command_line(&self) -> String {
        let program = self.program.to_string_lossy();

        let mut line = String::new();
        quote_into(&mut line, &program);

        for arg in &self.args {
            line.push(' ');
            quote_into(&mut line, arg);
        }

        line
    }
}

fn quote_into(line: &mut String, arg: &str) {
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '"']);

    if !needs_quotes {
        line.push_str(arg);
        return;
    }

    line.push('"');

    let mut backslashes = 0usize;

    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                // backslashes preceding a quote are escaped, then the quote
                line.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                backslashes = 0;
            }
            _ => {
                line.extend(std::iter::repeat_n('\\', backslashes));
                backslashes = 0;
            }
        }

        if c != '\\' {
            line.push(c);
        }
    }

    // trailing backslashes precede the closing quote
    line.extend(std::iter::repeat_n('\\', backslashes * 2));
    line.push('"');
}

/// Environment variables attached to a [Command].
#[derive(Debug, Clone)]
pub enum CommandEnv {
    /// Variables added to the inherited environment.
    ///
    /// A `None` value removes the variable from the spawned process.
    Inherit(BTreeMap<String, Option<String>>),

    /// Complete environment of the spawned process.
    NoInherit(BTreeMap<String, String>),
}
