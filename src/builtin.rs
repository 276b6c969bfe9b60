use crate::command::{CommandFactory, ExecutableCommand, ExitCode, Stdin};
use crate::env::Environment;
use crate::listing::{self, ListOptions};
use anyhow::{Context, Result, anyhow, bail};
use argh::{EarlyExit, FromArgs};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::PathBuf;

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed
/// without replacing the process image: in the shell itself for a plain
/// command, in a forked child when part of a pipeline or background job.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "echo" or "cd".
    fn name() -> &'static str;

    /// Executes the command using provided IO streams and environment.
    ///
    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    fn execute(
        self,
        stdin: &mut dyn Stdin,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute(
        self: Box<Self>,
        stdin: &mut dyn Stdin,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        T::execute(*self, stdin, stdout, env)
    }
}

/// Result of `--help` or of an argument list argh rejected.
struct ParseOutcome {
    name: &'static str,
    output: String,
    is_error: bool,
}

impl ExecutableCommand for ParseOutcome {
    fn execute(
        self: Box<Self>,
        _stdin: &mut dyn Stdin,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        if self.is_error {
            bail!("{}: {}", self.name, self.output.trim_end());
        }
        stdout.write_all(self.output.as_bytes())?;
        Ok(0)
    }
}

/// Registry handler for builtin `T`.
pub(crate) struct Factory<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: BuiltinCommand + 'static> CommandFactory for Factory<T> {
    fn name(&self) -> &'static str {
        T::name()
    }

    fn create(&self, argv: &[String]) -> Box<dyn ExecutableCommand> {
        let args: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
        match T::from_args(&[T::name()], &args) {
            Ok(cmd) => Box::new(cmd),
            Err(EarlyExit { output, status }) => Box::new(ParseOutcome {
                name: T::name(),
                output,
                is_error: status.is_err(),
            }),
        }
    }
}

/// Exact-name lookup table of builtins, fixed once built.
pub struct Registry {
    builtins: BTreeMap<&'static str, Box<dyn CommandFactory>>,
}

impl Registry {
    fn with(factories: Vec<Box<dyn CommandFactory>>) -> Self {
        let builtins = factories.into_iter().map(|f| (f.name(), f)).collect();
        Self { builtins }
    }

    /// Handler registered under exactly `name` (case-sensitive).
    pub fn lookup(&self, name: &str) -> Option<&dyn CommandFactory> {
        self.builtins.get(name).map(Box::as_ref)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.builtins.keys().copied()
    }
}

impl Default for Registry {
    fn default() -> Self {
        use crate::relay::{CloseServer, SendMessage, StartClient, StartServer};
        Self::with(vec![
            Box::new(Factory::<Echo>::default()),
            Box::new(Factory::<Ls>::default()),
            Box::new(Factory::<Cd>::default()),
            Box::new(Factory::<Cat>::default()),
            Box::new(Factory::<WC>::default()),
            Box::new(Factory::<Kill>::default()),
            Box::new(Factory::<Ps>::default()),
            Box::new(Factory::<Exit>::default()),
            Box::new(Factory::<StartServer>::default()),
            Box::new(Factory::<CloseServer>::default()),
            Box::new(Factory::<SendMessage>::default()),
            Box::new(Factory::<StartClient>::default()),
        ])
    }
}

#[derive(FromArgs)]
/// write the arguments to standard output, separated by spaces.
/// by default, a trailing newline is printed.
pub struct Echo {
    #[argh(switch, short = 'n')]
    /// do not output the trailing newline.
    pub no_newline: bool,

    #[argh(positional, greedy)]
    /// values to print as-is, separated by spaces.
    pub args: Vec<String>,
}

impl BuiltinCommand for Echo {
    fn name() -> &'static str {
        "echo"
    }

    fn execute(
        self,
        _stdin: &mut dyn Stdin,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        let s = self.args.join(" ");
        if self.no_newline {
            write!(stdout, "{}", s)?;
        } else {
            writeln!(stdout, "{}", s)?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// list the entries of a directory.
pub struct Ls {
    #[argh(option)]
    /// only print entries whose name contains this substring.
    pub f: Option<String>,

    #[argh(switch)]
    /// descend into subdirectories.
    pub rec: bool,

    #[argh(option)]
    /// maximum depth of a recursive listing; requires --rec.
    pub d: Option<usize>,

    #[argh(positional)]
    /// directory or file to list. Defaults to the current directory.
    pub path: Option<String>,
}

impl BuiltinCommand for Ls {
    fn name() -> &'static str {
        "ls"
    }

    fn execute(
        self,
        _stdin: &mut dyn Stdin,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        if self.d.is_some() && !self.rec {
            bail!("Invalid depth: --d requires --rec");
        }
        if let Some(filter) = &self.f {
            if filter.starts_with("--") || filter.starts_with('.') {
                bail!("Invalid substring: {filter}");
            }
        }
        let options = ListOptions {
            filter: self.f,
            recursive: self.rec,
            depth: self.d,
        };
        let path = PathBuf::from(self.path.as_deref().unwrap_or("."));
        listing::list(&path, &options, stdout)?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// If no target is provided, changes to the directory specified by the HOME environment variable.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; `...` and `....` climb two and three levels. Defaults to $HOME when omitted.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn execute(
        self,
        _stdin: &mut dyn Stdin,
        _stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        let target = match self.target.as_deref() {
            Some("...") => PathBuf::from("../.."),
            Some("....") => PathBuf::from("../../.."),
            Some(t) if !t.is_empty() => PathBuf::from(t),
            _ => match env::var_os("HOME") {
                Some(home) => PathBuf::from(home),
                None => bail!("cd: no target and HOME not set"),
            },
        };

        let new_dir = if target.is_absolute() {
            target
        } else {
            env.current_dir.join(target)
        };

        let canonical = fs::canonicalize(&new_dir)
            .with_context(|| format!("Invalid path: {}", new_dir.display()))?;

        env::set_current_dir(&canonical)
            .with_context(|| format!("Invalid path: {}", canonical.display()))?;
        env.current_dir = canonical;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// print a file, or standard input when it is not a terminal.
pub struct Cat {
    #[argh(positional)]
    /// file to print.
    pub file: Option<String>,
}

impl BuiltinCommand for Cat {
    fn name() -> &'static str {
        "cat"
    }

    fn execute(
        self,
        stdin: &mut dyn Stdin,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        match self.file {
            Some(fname) => {
                let mut f = fs::File::open(&fname)
                    .with_context(|| format!("Cannot open file: {fname}"))?;
                std::io::copy(&mut f, stdout)?;
            }
            None if stdin.is_terminal() => bail!("No input source provided: cat"),
            None => {
                std::io::copy(stdin, stdout)?;
            }
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// count words, characters and newlines of a file or of standard input.
pub struct WC {
    #[argh(positional)]
    /// file to count. Reads standard input when omitted.
    pub file: Option<String>,
}

/// Word, character and newline totals of a byte stream.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub words: usize,
    pub chars: usize,
    pub newlines: usize,
}

impl Counts {
    pub fn of(input: &[u8]) -> Self {
        let mut counts = Counts {
            chars: input.len(),
            ..Counts::default()
        };
        let mut in_word = false;
        for &b in input {
            match b {
                b'\n' => {
                    counts.newlines += 1;
                    in_word = false;
                }
                b' ' | b'\t' => in_word = false,
                _ if !in_word => {
                    counts.words += 1;
                    in_word = true;
                }
                _ => {}
            }
        }
        counts
    }
}

impl BuiltinCommand for WC {
    fn name() -> &'static str {
        "wc"
    }

    fn execute(
        self,
        stdin: &mut dyn Stdin,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        let mut buf = Vec::new();
        match &self.file {
            Some(fname) => {
                let mut f = fs::File::open(fname)
                    .with_context(|| format!("Cannot open file: {fname}"))?;
                f.read_to_end(&mut buf)?;
            }
            None => {
                stdin.read_to_end(&mut buf)?;
            }
        }
        let counts = Counts::of(&buf);
        writeln!(stdout, "word count {}", counts.words)?;
        writeln!(stdout, "character count {}", counts.chars)?;
        writeln!(stdout, "newline count {}", counts.newlines)?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// send a signal to a process.
pub struct Kill {
    #[argh(positional)]
    /// process id to signal.
    pub pid: i32,

    #[argh(positional)]
    /// signal number. Defaults to SIGTERM.
    pub signum: Option<i32>,
}

impl BuiltinCommand for Kill {
    fn name() -> &'static str {
        "kill"
    }

    fn execute(
        self,
        _stdin: &mut dyn Stdin,
        _stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        let signal = match self.signum {
            None => Signal::SIGTERM,
            Some(n) => Signal::try_from(n).map_err(|_| anyhow!("Invalid signal specified: {n}"))?,
        };
        kill(Pid::from_raw(self.pid), signal)
            .map_err(|_| anyhow!("The process does not exist: {}", self.pid))?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// list background jobs, most recent first.
pub struct Ps {}

impl BuiltinCommand for Ps {
    fn name() -> &'static str {
        "ps"
    }

    fn execute(
        self,
        _stdin: &mut dyn Stdin,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        for job in env.jobs.iter_recent_first() {
            writeln!(stdout, "{} {}", job.display_text, job.pid)?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Exit shell process
pub struct Exit {
    #[argh(positional, greedy)]
    /// ignored.
    pub _args: Vec<String>,
}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn execute(
        self,
        _stdin: &mut dyn Stdin,
        _stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        env.should_exit = true;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    fn lock_current_dir() -> MutexGuard<'static, ()> {
        static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        MUTEX.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_owned).collect()
    }

    fn run(line: &str, input: &[u8], env: &mut Environment) -> (Result<ExitCode>, String) {
        let registry = Registry::default();
        let argv = argv(line);
        let factory = registry.lookup(&argv[0]).expect("builtin registered");
        let mut out = Vec::new();
        let res = crate::command::run_builtin(factory, &argv, &mut Cursor::new(input.to_vec()), &mut out, env);
        (res, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_registry_exact_lookup() {
        let registry = Registry::default();
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("ps").is_some());
        assert!(registry.lookup("start_server").is_some());
        assert!(registry.lookup("Echo").is_none());
        assert!(registry.lookup("ech").is_none());
        assert!(registry.lookup("zzzqx").is_none());
        assert_eq!(registry.names().count(), 12);
    }

    #[test]
    fn test_echo_with_and_without_newline() {
        let mut env = Environment::default();
        let (res, out) = run("echo hello world", b"", &mut env);
        assert_eq!(res.unwrap(), 0);
        assert_eq!(out, "hello world\n");

        let (res, out) = run("echo -n foo bar", b"", &mut env);
        assert_eq!(res.unwrap(), 0);
        assert_eq!(out, "foo bar");

        let (_, out) = run("echo", b"", &mut env);
        assert_eq!(out, "\n");
    }

    #[test]
    fn test_help_is_not_a_failure() {
        let mut env = Environment::default();
        let (res, out) = run("ps --help", b"", &mut env);
        assert_eq!(res.unwrap(), 0);
        assert!(out.contains("ps"));
    }

    #[test]
    fn test_bad_arguments_fail_with_message() {
        let mut env = Environment::default();
        let (res, _) = run("ps extra", b"", &mut env);
        let err = res.unwrap_err().to_string();
        assert!(err.starts_with("ps:"), "{err}");

        let (res, _) = run("kill notapid", b"", &mut env);
        assert!(res.is_err());

        let (res, _) = run("kill", b"", &mut env);
        assert!(res.is_err());
    }

    #[test]
    fn test_kill_rejects_invalid_signal() {
        let mut env = Environment::default();
        let pid = std::process::id().to_string();
        let (res, _) = run(&format!("kill {pid} 999"), b"", &mut env);
        assert!(res.unwrap_err().to_string().contains("Invalid signal"));
    }

    #[test]
    fn test_kill_terminates_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut env = Environment::default();
        let (res, _) = run(&format!("kill {}", child.id()), b"", &mut env);
        assert_eq!(res.unwrap(), 0);
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_ps_lists_recent_first() {
        let mut env = Environment::default();
        env.jobs.register(Pid::from_raw(41), &argv("sleep 10")).unwrap();
        env.jobs.register(Pid::from_raw(42), &argv("sleep 20")).unwrap();
        let (res, out) = run("ps", b"", &mut env);
        assert_eq!(res.unwrap(), 0);
        assert_eq!(out, "sleep 20 42\nsleep 10 41\n");
    }

    #[test]
    fn test_exit_sets_flag() {
        let mut env = Environment::default();
        let (res, _) = run("exit", b"", &mut env);
        assert_eq!(res.unwrap(), 0);
        assert!(env.should_exit);
    }

    #[test]
    fn test_cat_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.txt");
        fs::write(&path, "hello\nworld\n").unwrap();

        let mut env = Environment::default();
        let (res, out) = run(&format!("cat {}", path.display()), b"", &mut env);
        assert_eq!(res.unwrap(), 0);
        assert_eq!(out, "hello\nworld\n");
    }

    #[test]
    fn test_cat_reads_stdin_when_no_args() {
        let mut env = Environment::default();
        let (res, out) = run("cat", b"from stdin\nline2\n", &mut env);
        assert_eq!(res.unwrap(), 0);
        assert_eq!(out, "from stdin\nline2\n");
    }

    #[test]
    fn test_cat_missing_file_fails() {
        let mut env = Environment::default();
        let (res, _) = run("cat /definitely/not/here", b"", &mut env);
        assert!(res.unwrap_err().to_string().contains("Cannot open file"));
    }

    #[test]
    fn test_wc_counts() {
        assert_eq!(
            Counts::of(b"one two\nthree\n"),
            Counts { words: 3, chars: 14, newlines: 2 }
        );
        assert_eq!(Counts::of(b""), Counts::default());
        assert_eq!(Counts::of(b"a\t\tb  c"), Counts { words: 3, chars: 7, newlines: 0 });
    }

    #[test]
    fn test_wc_stdin_output_format() {
        let mut env = Environment::default();
        let (res, out) = run("wc", b"a b c\n", &mut env);
        assert_eq!(res.unwrap(), 0);
        assert_eq!(out, "word count 3\ncharacter count 6\nnewline count 1\n");
    }

    #[test]
    fn test_cd_to_absolute_path() {
        let _lock = lock_current_dir();
        let temp = tempfile::tempdir().unwrap();
        let canonical_temp = fs::canonicalize(temp.path()).unwrap();
        let orig = env::current_dir().unwrap();

        let mut env = Environment::default();
        let (res, _) = run(&format!("cd {}", canonical_temp.display()), b"", &mut env);
        assert_eq!(res.unwrap(), 0);
        assert_eq!(env.current_dir, canonical_temp);
        assert_eq!(fs::canonicalize(env::current_dir().unwrap()).unwrap(), canonical_temp);

        env::set_current_dir(orig).expect("failed to restore cwd");
    }

    #[test]
    fn test_cd_three_dots_climbs_two_levels() {
        let _lock = lock_current_dir();
        let temp = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        let deep = root.join("a").join("b");
        fs::create_dir_all(&deep).unwrap();
        let orig = env::current_dir().unwrap();

        let mut env = Environment::default();
        env.current_dir = deep;
        let (res, _) = run("cd ...", b"", &mut env);
        assert_eq!(res.unwrap(), 0);
        assert_eq!(env.current_dir, root);

        env::set_current_dir(orig).expect("failed to restore cwd");
    }

    #[test]
    fn test_cd_nonexistent_path_errors() {
        let _lock = lock_current_dir();
        let orig = env::current_dir().unwrap();
        let mut env = Environment::default();
        let name = format!("nonexistent_dir_for_mysh_test_{}", std::process::id());
        let (res, _) = run(&format!("cd {name}"), b"", &mut env);
        assert!(res.unwrap_err().to_string().contains("Invalid path"));
        assert_eq!(env::current_dir().unwrap(), orig);
    }

    #[test]
    fn test_ls_depth_requires_rec() {
        let mut env = Environment::default();
        let (res, _) = run("ls --d 2 .", b"", &mut env);
        assert!(res.unwrap_err().to_string().contains("Invalid depth"));

        let (res, _) = run("ls --f .hidden", b"", &mut env);
        assert!(res.unwrap_err().to_string().contains("Invalid substring"));
    }

    #[test]
    fn test_ls_too_many_paths() {
        let mut env = Environment::default();
        let (res, _) = run("ls a b", b"", &mut env);
        assert!(res.is_err());
    }
}
