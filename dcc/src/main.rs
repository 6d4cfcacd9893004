//! dcc - distributed C/C++ compile client
//!
//! Runs a compile on the least busy host of a configured list, falling
//! back to this machine when distribution is impossible or fails.

#![forbid(unsafe_code)]

mod collaborators;
mod compile;
mod compiler;
mod shutdown;

use anyhow::{Context, Result};
use clap::Parser;
use collaborators::{LocalPreprocessor, NoIncludeServer, NoTransport, ProcessRunner, TracingNotifier};
use compile::{Collaborators, Orchestrator};
use compiler::Invocation;
use dcc_common::{
    ClientConfig, DccError, EnvHostListProvider, ExitCode, FileLockProvider, HostListProvider,
    HostRegistry, LogConfig, RecursionGuard, StatePublisher, SuffixRules, cleanup, filename,
    init_logging,
};
use std::io::Write;
use tracing::{debug, error};

const COMPILE_USAGE: &str = "\
Usage:
   dcc [--scan-includes] [COMPILER] [compile options] -o OBJECT -c SOURCE
   COMPILER [compile options] -o OBJECT -c SOURCE   (dcc installed under the compiler's name)

COMPILER defaults to \"cc\".

Environment:
   DISTCC_HOSTS             host list (otherwise $DISTCC_DIR/hosts)
   DISTCC_DIR               state directory, default ~/.distcc
   DISTCC_VERBOSE=1         debug logging
   DISTCC_LOG=FILE          log to FILE
   DISTCC_FALLBACK=0        fail instead of compiling locally
   DISTCC_BACKOFF_PERIOD    seconds to avoid a failed host
   DISTCC_PAUSE_TIME_MSEC   delay between slot scans when all are busy

Host list entries:
   localhost[/N]  HOST[:PORT][/N][,lzo][,cpp]  [USER]@HOST[/N][,lzo][,cpp]";

#[derive(Parser, Debug)]
#[command(name = "dcc")]
#[command(version, about = "Distributed C/C++ compile client", after_help = COMPILE_USAGE)]
struct Cli {
    /// Print the host list
    #[arg(long)]
    show_hosts: bool,

    /// Print the host list as JSON
    #[arg(long, requires = "show_hosts")]
    json: bool,

    /// Print the total number of slots across all hosts
    #[arg(short = 'j')]
    concurrency: bool,
}

/// Flags handled by [`Cli`] when they come first. Short `-h` and `-V`
/// belong to the compiler.
const MANAGEMENT_FLAGS: &[&str] = &["--help", "--version", "--show-hosts", "-j"];

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            err.downcast_ref::<DccError>()
                .map_or(ExitCode::DistccFailed, DccError::exit_code)
                .code()
        }
    };
    cleanup::cleanup_all();
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let log_config = LogConfig::from_env();
    if let Err(e) = init_logging(&log_config) {
        eprintln!("dcc: failed to initialise logging: {e:#}");
    }
    shutdown::install_cleanup_handler();

    let args: Vec<String> = std::env::args_os()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let progname = args.first().map_or("dcc", |a| filename::basename(a));

    if !is_client_name(progname) {
        let config = ClientConfig::from_env()?;
        let path = std::env::var_os("PATH");
        let cwd = std::env::current_dir().context("failed to get current directory")?;
        let invocation = compiler::masquerade(&args, path.as_deref(), &cwd)?;
        return compile(config, invocation, false).await;
    }

    let rest = args.get(1..).unwrap_or_default();
    match rest.first().map(String::as_str) {
        None => {
            error!("missing operand; try \"dcc --help\"");
            Err(DccError::BadArguments("missing operand".to_string()).into())
        }
        Some(flag) if is_management_flag(flag) => manage(&args),
        Some("--scan-includes") => {
            let config = ClientConfig::from_env()?;
            let rules = SuffixRules::new(config.remote_assemble);
            let invocation = compiler::find_compiler(&rest[1..], rules)?;
            compile(config, invocation, true).await
        }
        Some(_) => {
            let config = ClientConfig::from_env()?;
            let rules = SuffixRules::new(config.remote_assemble);
            let invocation = compiler::find_compiler(rest, rules)?;
            compile(config, invocation, false).await
        }
    }
}

/// True when we were run under our own name rather than a compiler's.
fn is_client_name(progname: &str) -> bool {
    progname.contains("dcc") || progname.contains("distcc")
}

fn is_management_flag(arg: &str) -> bool {
    MANAGEMENT_FLAGS.contains(&arg)
}

fn manage(args: &[String]) -> Result<i32> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                ExitCode::BadArguments.code()
            } else {
                0
            };
            e.print().context("failed to print usage")?;
            return Ok(code);
        }
    };

    let config = ClientConfig::from_env()?;
    let hosts = EnvHostListProvider::new(config.hosts.clone(), config.hosts_file()).host_list()?;

    let mut stdout = std::io::stdout().lock();
    if cli.show_hosts {
        print_hosts(&mut stdout, &hosts, cli.json)?;
    }
    if cli.concurrency {
        writeln!(stdout, "{}", hosts.total_slots())?;
    }
    Ok(0)
}

fn print_hosts(out: &mut impl Write, hosts: &HostRegistry, json: bool) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, hosts.hosts())?;
        writeln!(out)?;
        return Ok(());
    }
    for host in hosts.iter() {
        writeln!(out, "{host}")?;
    }
    Ok(())
}

async fn compile(config: ClientConfig, invocation: Invocation, scan_includes: bool) -> Result<i32> {
    let guard = RecursionGuard::from_env();
    let level = guard.level();
    if level.saturating_sub(u32::from(invocation.tweaked_path)) > 0 {
        error!("dcc seems to have invoked itself recursively");
        return Err(DccError::Recursion { level }.into());
    }
    debug!(argv = ?invocation.argv, "compiling");

    let status = tokio::task::spawn_blocking(move || {
        let runner = ProcessRunner::new(guard, invocation.child_path);
        let preprocessor = LocalPreprocessor::new(&runner, SuffixRules::new(config.remote_assemble));
        let hosts = EnvHostListProvider::new(config.hosts.clone(), config.hosts_file());
        let locks = FileLockProvider::new(config.lock_dir());
        let deps = Collaborators {
            runner: &runner,
            preprocessor: &preprocessor,
            remote: &NoTransport,
            include_server: &NoIncludeServer,
            notifier: &TracingNotifier,
            hosts: &hosts,
            locks: &locks,
        };
        let state = StatePublisher::new(&config.state_dir());
        let mut orchestrator = Orchestrator::new(&config, deps, state)
            .with_scan_includes(scan_includes)
            .with_recursion_level(level);
        orchestrator.build_timed(invocation.argv)
    })
    .await
    .context("build task failed")??;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcc_common::parse_host_list;

    #[test]
    fn test_client_names() {
        assert!(is_client_name("dcc"));
        assert!(is_client_name("distcc"));
        assert!(!is_client_name("gcc"));
        assert!(!is_client_name("c++"));
    }

    #[test]
    fn test_short_version_goes_to_compiler() {
        assert!(is_management_flag("--version"));
        assert!(is_management_flag("--help"));
        assert!(is_management_flag("-j"));
        assert!(!is_management_flag("-V"));
        assert!(!is_management_flag("-h"));
        assert!(!is_management_flag("gcc"));

        let args: Vec<String> = ["-V", "foo.c"].iter().map(|s| s.to_string()).collect();
        let invocation = compiler::find_compiler(&args, SuffixRules::new(false)).unwrap();
        assert_eq!(invocation.argv, ["cc", "-V", "foo.c"]);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["dcc", "--show-hosts", "--json"]).unwrap();
        assert!(cli.show_hosts && cli.json && !cli.concurrency);

        let cli = Cli::try_parse_from(["dcc", "-j"]).unwrap();
        assert!(cli.concurrency);

        assert!(Cli::try_parse_from(["dcc", "-j", "--json"]).is_err());
    }

    #[test]
    fn test_print_hosts() {
        let hosts = parse_host_list("localhost/3 builder:4000/8,lzo").unwrap();

        let mut text = Vec::new();
        print_hosts(&mut text, &hosts, false).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("builder"));

        let mut json = Vec::new();
        print_hosts(&mut json, &hosts, true).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(2));
        assert_eq!(value[1]["hostname"], "builder");
        assert_eq!(value[1]["slots"], 8);
    }
}
