//! Build orchestration.
//!
//! One compile runs through an explicit sequence of stages:
//!
//! ```text
//! ExpandOptions -> Classify -> SelectHost -> LockLocalCpu -> PreprocessDecision
//!     -> { IncludeScan | RemotePreprocess | LocalPreprocess } -> RemoteCompile
//!     -> Evaluate -> { Done | Fallback -> LockLocal -> RunLocal -> Done }
//! ```
//!
//! Anything that goes wrong on the way to a remote compile leads to
//! Fallback, which builds locally unless fallbacks are disabled. Locks and
//! temp files live in [`OrchestratorContext`] and are released when it is
//! dropped, whichever stage the build stopped in.

use crate::collaborators::{
    CommandRunner, IncludeServer, Notifier, Preprocessor, RemoteCompiler, RemoteJob,
};
use dcc_common::args::{self, Classification};
use dcc_common::{
    ClientConfig, CppWhere, DccError, DiscrepancyCounter, ExitCode, HostDefinition,
    HostListProvider, HostSelector, LockProvider, Phase, ReputationTracker, SlotLock,
    StatePublisher, StateTarget, SuffixRules, candidate_hosts, cleanup, dotd,
};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// External capabilities the orchestrator drives.
pub struct Collaborators<'a> {
    pub runner: &'a dyn CommandRunner,
    pub preprocessor: &'a dyn Preprocessor,
    pub remote: &'a dyn RemoteCompiler,
    pub include_server: &'a dyn IncludeServer,
    pub notifier: &'a dyn Notifier,
    pub hosts: &'a dyn HostListProvider,
    pub locks: &'a dyn LockProvider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ExpandOptions,
    Classify,
    SelectHost,
    LockLocalCpu,
    PreprocessDecision,
    IncludeScan,
    RemotePreprocess,
    LocalPreprocess,
    RemoteCompile,
    /// Remote compiler ran and exited with this status.
    Evaluate(i32),
    Fallback,
    LockLocal,
    RunLocal,
    Done,
}

/// Per-build state threaded through the stages.
#[derive(Debug, Default)]
struct OrchestratorContext {
    argv: Vec<String>,
    input: Option<String>,
    output: Option<String>,
    host: Option<HostDefinition>,
    /// Slot on the chosen host, or on localhost when building here.
    host_lock: Option<SlotLock>,
    /// Local slot held while preprocessing for a remote host.
    local_cpu_lock: Option<SlotLock>,
    server_argv: Vec<String>,
    preprocessed: Option<PathBuf>,
    files: Option<Vec<PathBuf>>,
    /// Only known when preprocessing happens on the server.
    deps_file: Option<String>,
    server_stderr: Option<PathBuf>,
    temp_files: Vec<PathBuf>,
    /// Status of a failed remote compile being retried locally.
    remote_status: Option<i32>,
    /// Code to report if the build stops at Fallback.
    failure: i32,
    result: i32,
}

impl OrchestratorContext {
    fn release_locks(&mut self) {
        if let Some(mut lock) = self.host_lock.take() {
            lock.release();
        }
        if let Some(mut lock) = self.local_cpu_lock.take() {
            lock.release();
        }
    }

    fn input_name(&self) -> &str {
        self.input.as_deref().unwrap_or("(unknown)")
    }
}

impl Drop for OrchestratorContext {
    fn drop(&mut self) {
        self.release_locks();
        for path in self.temp_files.drain(..) {
            cleanup::remove(&path);
        }
    }
}

/// Decides where one compile runs and sees it through.
pub struct Orchestrator<'a> {
    config: &'a ClientConfig,
    deps: Collaborators<'a>,
    selector: HostSelector<'a>,
    reputation: ReputationTracker,
    discrepancy: Option<DiscrepancyCounter>,
    rules: SuffixRules,
    state: StatePublisher,
    scan_includes: bool,
    recursion_level: u32,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a ClientConfig, deps: Collaborators<'a>, state: StatePublisher) -> Self {
        let discrepancy = config.include_server_port.as_deref().and_then(|port| {
            DiscrepancyCounter::from_include_server_port(port, config.max_discrepancy)
        });
        Self {
            config,
            selector: HostSelector::new(deps.locks, config.pause_time),
            reputation: ReputationTracker::new(config.lock_dir(), config.backoff_period),
            discrepancy,
            rules: SuffixRules::new(config.remote_assemble),
            deps,
            state,
            scan_includes: false,
            recursion_level: 0,
        }
    }

    /// Report includes instead of compiling.
    pub fn with_scan_includes(mut self, scan_includes: bool) -> Self {
        self.scan_includes = scan_includes;
        self
    }

    /// Recursion level of this process; non-zero builds locally without
    /// taking any lock.
    pub fn with_recursion_level(mut self, level: u32) -> Self {
        self.recursion_level = level;
        self
    }

    /// [`Self::build`], logging the elapsed time.
    pub fn build_timed(&mut self, argv: Vec<String>) -> Result<i32, DccError> {
        let started = Instant::now();
        let result = self.build(argv);
        info!(
            "elapsed compilation time {}",
            humantime::format_duration(started.elapsed())
        );
        result
    }

    /// Build `argv` somewhere and return the exit status to report.
    ///
    /// `Err` is reserved for fatal problems; every recoverable failure ends
    /// in a local build or in its exit code.
    pub fn build(&mut self, argv: Vec<String>) -> Result<i32, DccError> {
        let mut ctx = OrchestratorContext::default();
        ctx.argv = argv;
        let mut stage = Stage::ExpandOptions;
        while stage != Stage::Done {
            trace!(?stage, "build stage");
            stage = self.step(stage, &mut ctx)?;
        }
        Ok(ctx.result)
    }

    fn step(&mut self, stage: Stage, ctx: &mut OrchestratorContext) -> Result<Stage, DccError> {
        match stage {
            Stage::ExpandOptions => Ok(self.expand_options(ctx)),
            Stage::Classify => self.classify(ctx),
            Stage::SelectHost => Ok(self.select_host(ctx)),
            Stage::LockLocalCpu => Ok(self.lock_local_cpu(ctx)),
            Stage::PreprocessDecision => Ok(self.preprocess_decision(ctx)),
            Stage::IncludeScan => Ok(self.include_scan(ctx)),
            Stage::RemotePreprocess => self.remote_preprocess(ctx),
            Stage::LocalPreprocess => Ok(self.local_preprocess(ctx)),
            Stage::RemoteCompile => Ok(self.remote_compile(ctx)),
            Stage::Evaluate(status) => Ok(self.evaluate(ctx, status)),
            Stage::Fallback => Ok(self.fallback(ctx)),
            Stage::LockLocal => Ok(self.lock_local(ctx)),
            Stage::RunLocal => Ok(self.run_local(ctx)),
            Stage::Done => Ok(Stage::Done),
        }
    }

    // ── Stages ─────────────────────────────────────────────────────────────

    fn expand_options(&mut self, ctx: &mut OrchestratorContext) -> Stage {
        ctx.argv = args::expand_preprocessor_options(&ctx.argv);
        if self.recursion_level > 0 {
            debug!(
                level = self.recursion_level,
                "recursive invocation, running locally"
            );
            return Stage::RunLocal;
        }
        Stage::Classify
    }

    fn classify(&mut self, ctx: &mut OrchestratorContext) -> Result<Stage, DccError> {
        let request = match args::scan_args(&ctx.argv, self.rules)? {
            Classification::LocalOnly { .. } => return Ok(Stage::LockLocal),
            Classification::Distributable(request) => request,
        };
        ctx.argv = request.argv;
        ctx.input = Some(request.input);
        ctx.output = Some(request.output);

        match cleanup::make_temp_file("dcc_server_stderr_", ".txt") {
            Ok(path) => {
                ctx.temp_files.push(path.clone());
                ctx.server_stderr = Some(path);
                Ok(Stage::SelectHost)
            }
            Err(e) => {
                warn!("failed to create server stderr file: {e}");
                ctx.failure = ExitCode::IoError.code();
                Ok(Stage::Fallback)
            }
        }
    }

    fn select_host(&mut self, ctx: &mut OrchestratorContext) -> Stage {
        let selected = self
            .deps
            .hosts
            .host_list()
            .and_then(|registry| candidate_hosts(&registry, &self.reputation))
            .and_then(|registry| self.selector.select_and_lock(&registry, &mut self.state));
        let (host, lock) = match selected {
            Ok(found) => found,
            Err(e) => return fail(ctx, &e),
        };

        ctx.host_lock = Some(lock);
        let local = host.is_local();
        ctx.host = Some(host);
        if local {
            // Already holding a local slot.
            Stage::RunLocal
        } else {
            Stage::LockLocalCpu
        }
    }

    /// Always taken after the remote host's lock, never before.
    fn lock_local_cpu(&mut self, ctx: &mut OrchestratorContext) -> Stage {
        match self.selector.lock_local_preprocess(&mut self.state) {
            Ok(lock) => {
                ctx.local_cpu_lock = Some(lock);
                Stage::PreprocessDecision
            }
            Err(e) => fail(ctx, &e),
        }
    }

    fn preprocess_decision(&mut self, ctx: &mut OrchestratorContext) -> Stage {
        let reason = self.demotion_reason(ctx.input_name());
        let Some(host) = ctx.host.as_mut() else {
            return Stage::Fallback;
        };

        if host.cpp_where == CppWhere::OnServer
            && let Some(reason) = reason
        {
            info!("{reason}; preprocessing locally for {host}");
            if let Err(e) = host.demote_to_client_cpp() {
                return fail(ctx, &e);
            }
        }

        if self.scan_includes {
            Stage::IncludeScan
        } else if host.cpp_where == CppWhere::OnServer {
            Stage::RemotePreprocess
        } else {
            Stage::LocalPreprocess
        }
    }

    fn demotion_reason(&self, input: &str) -> Option<String> {
        if let Some(counter) = &self.discrepancy
            && counter.threshold_reached()
        {
            return Some(format!(
                "{} discrepancies recorded (max {})",
                counter.count(),
                counter.max()
            ));
        }
        if self.rules.is_preprocessed(input) {
            return Some(format!("{input} is already preprocessed"));
        }
        if let Some(var) = &self.config.include_path_override {
            return Some(format!("{var} is set"));
        }
        None
    }

    fn include_scan(&mut self, ctx: &mut OrchestratorContext) -> Stage {
        ctx.result = match &ctx.host {
            Some(host) => match self.deps.include_server.approximate_includes(host, &ctx.argv) {
                Ok(status) => status,
                Err(e) => {
                    error!("{e}");
                    e.exit_code().code()
                }
            },
            None => ExitCode::DistccFailed.code(),
        };
        ctx.release_locks();
        Stage::Done
    }

    fn remote_preprocess(&mut self, ctx: &mut OrchestratorContext) -> Result<Stage, DccError> {
        let files = match self.deps.include_server.talk(&ctx.argv) {
            Ok(files) => files,
            Err(e) => {
                warn!("failed to get includes from include server, preprocessing locally: {e}");
                if self.config.testing_include_server {
                    return Err(e);
                }
                if let Some(host) = ctx.host.as_mut()
                    && let Err(e) = host.demote_to_client_cpp()
                {
                    return Ok(fail(ctx, &e));
                }
                return Ok(Stage::LocalPreprocess);
            }
        };

        // Include scanning was the only local work.
        if let Some(mut lock) = ctx.local_cpu_lock.take() {
            lock.release();
        }

        let dotd = args::dotd_info(&ctx.argv, self.rules);
        let mut server_argv = ctx.argv.clone();
        if dotd.needs_dotd
            && !dotd.sets_target
            && let Some(output) = &ctx.output
        {
            server_argv.push("-MT".to_string());
            server_argv.push(output.clone());
        }
        ctx.server_argv = server_argv;
        ctx.deps_file = dotd.deps_file;
        ctx.files = Some(files);
        Ok(Stage::RemoteCompile)
    }

    fn local_preprocess(&mut self, ctx: &mut OrchestratorContext) -> Stage {
        let Some(input) = ctx.input.clone() else {
            return Stage::Fallback;
        };
        match self.deps.preprocessor.preprocess(&ctx.argv, &input) {
            Ok(artifact) => {
                if artifact != Path::new(&input) {
                    ctx.temp_files.push(artifact.clone());
                }
                ctx.preprocessed = Some(artifact);
                ctx.files = None;
                ctx.server_argv = args::strip_local_args(&ctx.argv);
                Stage::RemoteCompile
            }
            Err(e) => fail(ctx, &e),
        }
    }

    fn remote_compile(&mut self, ctx: &mut OrchestratorContext) -> Stage {
        // The remote compiler releases this one.
        let local_cpu_lock = ctx.local_cpu_lock.take();

        let outcome = match (&ctx.host, &ctx.input, &ctx.output, &ctx.server_stderr) {
            (Some(host), Some(input), Some(output), Some(server_stderr)) => {
                let job = RemoteJob {
                    argv: &ctx.server_argv,
                    input,
                    preprocessed: ctx.preprocessed.as_deref(),
                    files: ctx.files.as_deref(),
                    output,
                    deps_file: ctx.deps_file.as_deref(),
                    server_stderr,
                    host,
                };
                self.deps.remote.compile_remote(&job, local_cpu_lock)
            }
            _ => Err(DccError::Failed("incomplete remote job".to_string())),
        };

        match outcome {
            Ok(status) => Stage::Evaluate(status),
            Err(e) => fail(ctx, &e),
        }
    }

    fn evaluate(&mut self, ctx: &mut OrchestratorContext, status: i32) -> Stage {
        if let Some(host) = &ctx.host {
            self.reputation.mark_enjoyed(host);
        }
        if let Some(mut lock) = ctx.host_lock.take() {
            lock.release();
        }

        if status == 0 {
            if let Err(e) = show_server_stderr(ctx.server_stderr.as_deref()) {
                warn!("could not show server-side errors: {e}");
                ctx.failure = ExitCode::IoError.code();
                return Stage::Fallback;
            }
            ctx.result = 0;
            return Stage::Done;
        }

        if status < 128 {
            if self.config.skip_local_retry {
                if let Err(e) = show_server_stderr(ctx.server_stderr.as_deref()) {
                    warn!("remote compilation of '{}' failed", ctx.input_name());
                    warn!("could not show server-side errors, retrying locally: {e}");
                    ctx.failure = status;
                    return Stage::Fallback;
                }
                ctx.result = status;
                return Stage::Done;
            }
            warn!(
                "remote compilation of '{}' failed, retrying locally",
                ctx.input_name()
            );
            ctx.remote_status = Some(status);
        }
        ctx.failure = status;
        Stage::Fallback
    }

    fn fallback(&mut self, ctx: &mut OrchestratorContext) -> Stage {
        if let Some(host) = &ctx.host {
            self.reputation.mark_disliked(host);
        }
        ctx.release_locks();

        if !self.config.fallback {
            warn!("failed to distribute and fallbacks are disabled");
            if let Some(path) = &ctx.server_stderr
                && let Err(e) = show_server_stderr(Some(path.as_path()))
            {
                error!("could not print error messages from {}: {e}", path.display());
            }
            ctx.result = if ctx.failure == 0 {
                ExitCode::DistccFailed.code()
            } else {
                ctx.failure
            };
            return Stage::Done;
        }

        match &ctx.host {
            Some(host) => warn!(
                "failed to distribute {} to {}, running locally instead",
                ctx.input_name(),
                host
            ),
            None => warn!("failed to distribute, running locally instead"),
        }
        Stage::LockLocal
    }

    fn lock_local(&mut self, ctx: &mut OrchestratorContext) -> Stage {
        match self.selector.lock_local(&mut self.state) {
            Ok(lock) => ctx.host_lock = Some(lock),
            Err(e) => warn!("failed to lock a local slot, running anyway: {e}"),
        }
        Stage::RunLocal
    }

    fn run_local(&mut self, ctx: &mut OrchestratorContext) -> Stage {
        self.state.publish(
            Phase::Compile,
            ctx.input.as_deref(),
            Some("localhost"),
            StateTarget::Local,
        );
        ctx.result = match self.deps.runner.run(&ctx.argv, None) {
            Ok(status) => status,
            Err(e) => {
                error!("{e}");
                e.exit_code().code()
            }
        };

        if let Some(remote_status) = ctx.remote_status {
            if remote_status != ctx.result {
                self.investigate_discrepancy(ctx);
            } else if let Some(host) = &ctx.host {
                // The source is broken, not the host.
                self.reputation.mark_enjoyed(host);
            }
        }
        ctx.release_locks();
        Stage::Done
    }

    /// A remote failure the local build did not reproduce.
    ///
    /// Stays quiet when a dependency changed after the build started;
    /// otherwise notifies and bumps the discrepancy counter.
    fn investigate_discrepancy(&self, ctx: &OrchestratorContext) {
        let input = ctx.input_name();
        warn!("remote compilation of '{input}' failed, retried locally and got a different result");

        if let Some(port) = &self.config.include_server_port
            && let Ok(build_start) = dotd::change_time(port)
            && let Some(deps_file) = &ctx.deps_file
            && let Some(fresh) = dotd::fresh_dependency_exists(
                Path::new(deps_file),
                self.config.exclude_fresh_files.as_deref(),
                build_start,
            )
        {
            warn!(
                "file '{}', a dependency of '{input}', changed during the build",
                fresh.display()
            );
            return;
        }

        self.deps.notifier.notify_discrepancy(input);
        if let Some(counter) = &self.discrepancy
            && let Err(e) = counter.note()
        {
            warn!(
                "failed to update discrepancy counter {}: {e}",
                counter.path().display()
            );
        }
    }
}

/// Record a failure on the way to a remote compile.
fn fail(ctx: &mut OrchestratorContext, err: &DccError) -> Stage {
    debug!("giving up on remote compile: {err}");
    ctx.failure = err.exit_code().code();
    Stage::Fallback
}

/// Copy the remote compiler's captured stderr to ours.
fn show_server_stderr(path: Option<&Path>) -> io::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut io::stderr().lock())?;
    Ok(())
}
