//! Seams between the build orchestrator and the outside world.
//!
//! The orchestrator only decides *where* and *in what order* things run.
//! Spawning processes, talking to remote daemons and the include server,
//! and reporting discrepancies happen behind these traits so the decision
//! logic can be driven by test doubles.

use dcc_common::args;
use dcc_common::cleanup;
use dcc_common::filename::{self, SuffixRules};
use dcc_common::{DccError, ExitCode, HostDefinition, RecursionGuard, SlotLock};
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, info, warn};

// ============================================================================
// Traits
// ============================================================================

/// Runs a program on this machine and reports its exit status.
pub trait CommandRunner: Send + Sync {
    /// Run `argv`, optionally sending stdout to `stdout_to`.
    ///
    /// A child killed by a signal reports `128 + signo`.
    fn run(&self, argv: &[String], stdout_to: Option<&Path>) -> Result<i32, DccError>;
}

/// Everything a remote compile needs to know.
#[derive(Debug)]
pub struct RemoteJob<'a> {
    pub argv: &'a [String],
    pub input: &'a str,
    /// Locally preprocessed input, when preprocessing ran on the client.
    pub preprocessed: Option<&'a Path>,
    /// Include closure, when preprocessing runs on the server.
    pub files: Option<&'a [PathBuf]>,
    pub output: &'a str,
    /// Dependency file to bring back, when the compile writes one.
    pub deps_file: Option<&'a str>,
    /// Where the server's stderr is captured.
    pub server_stderr: &'a Path,
    pub host: &'a HostDefinition,
}

/// Ships a compile to a remote host.
pub trait RemoteCompiler: Send + Sync {
    /// Run `job` remotely and return the compiler's exit status.
    ///
    /// Owns `local_cpu_lock` from here on and releases it once local work
    /// for the job is finished. `Err` means the compile could not be run,
    /// not that the compiler failed.
    fn compile_remote(
        &self,
        job: &RemoteJob<'_>,
        local_cpu_lock: Option<SlotLock>,
    ) -> Result<i32, DccError>;
}

/// Client side of the include server used for server-side preprocessing.
pub trait IncludeServer: Send + Sync {
    /// Files the compile `argv` reads.
    fn talk(&self, argv: &[String]) -> Result<Vec<PathBuf>, DccError>;

    /// Report the includes of `argv` for `host` instead of compiling.
    fn approximate_includes(&self, host: &HostDefinition, argv: &[String]) -> Result<i32, DccError>;
}

/// Runs the preprocessor on this machine.
pub trait Preprocessor: Send + Sync {
    /// Preprocess `input` as compiled by `argv`; returns the artifact path.
    fn preprocess(&self, argv: &[String], input: &str) -> Result<PathBuf, DccError>;
}

/// Reports remote/local result mismatches. Best effort.
pub trait Notifier: Send + Sync {
    fn notify_discrepancy(&self, input: &str);
}

// ============================================================================
// Process runner
// ============================================================================

/// Spawns real processes with the recursion guard in their environment.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    guard: RecursionGuard,
    path: Option<OsString>,
    cwd: PathBuf,
}

impl ProcessRunner {
    /// Runner for children of a process at recursion level `guard`.
    /// `path`, when set, replaces PATH for program lookup and children.
    pub fn new(guard: RecursionGuard, path: Option<OsString>) -> Self {
        Self {
            guard,
            path,
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    fn resolve(&self, program: &str) -> Result<PathBuf, DccError> {
        let search = self.path.clone().or_else(|| std::env::var_os("PATH"));
        which::which_in(program, search, &self.cwd).map_err(|e| {
            warn!("failed to find {program}: {e}");
            DccError::CompilerMissing(program.to_string())
        })
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, argv: &[String], stdout_to: Option<&Path>) -> Result<i32, DccError> {
        let Some((program, rest)) = argv.split_first() else {
            return Err(DccError::BadArguments("empty command line".to_string()));
        };
        let resolved = self.resolve(program)?;
        debug!("exec {}", args::format_argv(argv));

        let mut cmd = Command::new(&resolved);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.arg0(program);
        }
        cmd.args(rest);
        let (key, value) = self.guard.child_env();
        cmd.env(key, value);
        if let Some(path) = &self.path {
            cmd.env("PATH", path);
        }
        if let Some(out) = stdout_to {
            let file =
                File::create(out).map_err(|e| DccError::io_path("open", out, e))?;
            cmd.stdout(Stdio::from(file));
        }

        let status = cmd
            .status()
            .map_err(|e| DccError::io(format!("failed to run {program}"), e))?;
        Ok(critique_status(program, status))
    }
}

/// Exit status as an integer, logging failures.
pub fn critique_status(program: &str, status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        if code != 0 {
            info!("{program} failed with exit code {code}");
        }
        return code;
    }
    signal_status(program, status)
}

#[cfg(unix)]
fn signal_status(program: &str, status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signo) => {
            warn!("{program} was killed by signal {signo}");
            128 + signo
        }
        None => ExitCode::DistccFailed.code(),
    }
}

#[cfg(not(unix))]
fn signal_status(_program: &str, _status: ExitStatus) -> i32 {
    ExitCode::DistccFailed.code()
}

// ============================================================================
// Local preprocessor
// ============================================================================

/// Runs `argv` with `-E` in place of `-c`/`-S`, stdout into a temp file.
pub struct LocalPreprocessor<'a> {
    runner: &'a dyn CommandRunner,
    rules: SuffixRules,
}

impl<'a> LocalPreprocessor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, rules: SuffixRules) -> Self {
        Self { runner, rules }
    }
}

impl Preprocessor for LocalPreprocessor<'_> {
    fn preprocess(&self, argv: &[String], input: &str) -> Result<PathBuf, DccError> {
        if self.rules.is_preprocessed(input) {
            debug!("{input} is already preprocessed");
            return Ok(PathBuf::from(input));
        }

        let suffix = filename::preprocessed_extension(input).ok_or_else(|| {
            DccError::Failed(format!("no preprocessed extension for {input}"))
        })?;
        let mut cpp_argv = args::strip_dash_o(argv);
        args::set_action_opt(&mut cpp_argv, "-E")?;

        let artifact = cleanup::make_temp_file("dcc_", suffix)
            .map_err(|e| DccError::io("failed to create preprocessor output", e))?;
        match self.runner.run(&cpp_argv, Some(&artifact)) {
            Ok(0) => Ok(artifact),
            Ok(status) => {
                cleanup::remove(&artifact);
                Err(DccError::Collaborator {
                    code: ExitCode::DistccFailed,
                    message: format!("preprocessor failed with status {status}"),
                })
            }
            Err(e) => {
                cleanup::remove(&artifact);
                Err(e)
            }
        }
    }
}

// ============================================================================
// Defaults for the network-facing seams
// ============================================================================

/// Remote compiler used when no transport is linked in. Every remote
/// compile fails, so remote hosts fall back to local builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransport;

impl RemoteCompiler for NoTransport {
    fn compile_remote(
        &self,
        job: &RemoteJob<'_>,
        local_cpu_lock: Option<SlotLock>,
    ) -> Result<i32, DccError> {
        drop(local_cpu_lock);
        debug!(
            host = %job.host,
            input = job.input,
            output = job.output,
            argv = %args::format_argv(job.argv),
            preprocessed = ?job.preprocessed,
            files = job.files.map_or(0, <[PathBuf]>::len),
            deps_file = ?job.deps_file,
            server_stderr = %job.server_stderr.display(),
            "dropping remote job"
        );
        Err(DccError::Collaborator {
            code: ExitCode::ConnectFailed,
            message: format!("no transport configured for {}", job.host),
        })
    }
}

/// Include server client used when none is reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIncludeServer;

impl IncludeServer for NoIncludeServer {
    fn talk(&self, _argv: &[String]) -> Result<Vec<PathBuf>, DccError> {
        Err(DccError::Collaborator {
            code: ExitCode::ConnectFailed,
            message: "include server not available".to_string(),
        })
    }

    fn approximate_includes(&self, host: &HostDefinition, _argv: &[String]) -> Result<i32, DccError> {
        Err(DccError::Collaborator {
            code: ExitCode::ConnectFailed,
            message: format!("include server not available to scan includes for {host}"),
        })
    }
}

/// Notifier that writes discrepancies to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_discrepancy(&self, input: &str) {
        warn!(input, "remote and local compile results differ");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records argv and writes a fixed body to the stdout target.
    struct Recorder {
        status: i32,
        calls: Mutex<Vec<Vec<String>>>,
        written: Mutex<Vec<PathBuf>>,
    }

    impl Recorder {
        fn new(status: i32) -> Self {
            Self {
                status,
                calls: Mutex::new(Vec::new()),
                written: Mutex::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for Recorder {
        fn run(&self, argv: &[String], stdout_to: Option<&Path>) -> Result<i32, DccError> {
            self.calls.lock().unwrap().push(argv.to_vec());
            if let Some(out) = stdout_to {
                std::fs::write(out, "int x;\n").unwrap();
                self.written.lock().unwrap().push(out.to_path_buf());
            }
            Ok(self.status)
        }
    }

    fn argv(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_preprocess_rewrites_command() {
        let runner = Recorder::new(0);
        let cpp = LocalPreprocessor::new(&runner, SuffixRules::default());

        let artifact = cpp
            .preprocess(&argv("gcc -O2 -c hello.cc -o hello.o"), "hello.cc")
            .unwrap();
        assert_eq!(artifact.extension().unwrap(), "ii");
        assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "int x;\n");
        assert_eq!(
            runner.calls.lock().unwrap()[0],
            argv("gcc -O2 -E hello.cc")
        );
        cleanup::remove(&artifact);
    }

    #[test]
    fn test_preprocessed_input_used_as_is() {
        let runner = Recorder::new(0);
        let cpp = LocalPreprocessor::new(&runner, SuffixRules::default());
        let artifact = cpp.preprocess(&argv("gcc -c hello.i"), "hello.i").unwrap();
        assert_eq!(artifact, PathBuf::from("hello.i"));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_preprocess_failure_removes_artifact() {
        let runner = Recorder::new(1);
        let cpp = LocalPreprocessor::new(&runner, SuffixRules::default());
        let err = cpp
            .preprocess(&argv("gcc -c hello.c -o hello.o"), "hello.c")
            .unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::DistccFailed);

        let written = runner.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert!(!written[0].exists());
        assert!(!cleanup::is_registered(&written[0]));
    }

    #[test]
    fn test_no_transport_fails_and_drops_lock() {
        let host = HostDefinition::localhost(1);
        let job = RemoteJob {
            argv: &argv("gcc -c hello.c"),
            input: "hello.c",
            preprocessed: None,
            files: None,
            output: "hello.o",
            deps_file: None,
            server_stderr: Path::new("/dev/null"),
            host: &host,
        };
        let lock = SlotLock::detached("cpu_localhost_0", 0);
        let err = NoTransport.compile_remote(&job, Some(lock)).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_runner_statuses() {
        let runner = ProcessRunner::new(RecursionGuard::default(), None);
        assert_eq!(runner.run(&argv("true"), None).unwrap(), 0);
        assert_eq!(runner.run(&argv("false"), None).unwrap(), 1);
        let killed = vec!["sh".to_string(), "-c".to_string(), "kill -TERM $$".to_string()];
        assert_eq!(runner.run(&killed, None).unwrap(), 128 + 15);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_runner_sets_safeguard_and_stdout() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("env.txt");
        let runner = ProcessRunner::new(RecursionGuard::from_value(Some("2")), None);
        let echo = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo $_DISTCC_SAFEGUARD".to_string(),
        ];
        let status = runner.run(&echo, Some(&out)).unwrap();
        assert_eq!(status, 0);
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "3");
    }

    #[test]
    fn test_process_runner_missing_compiler() {
        let runner = ProcessRunner::new(RecursionGuard::default(), None);
        let err = runner
            .run(&argv("definitely-not-a-compiler-dcc -c x.c"), None)
            .unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::CompilerMissing);
    }
}
