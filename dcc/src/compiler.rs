//! Compiler discovery.
//!
//! Three ways to get here:
//!
//! - explicit: `dcc gcc -c hello.c`
//! - implicit: `dcc -c hello.c`, which runs `cc`
//! - masquerade: `gcc -c hello.c` where `gcc` on PATH is a link to dcc
//!
//! In masquerade mode the PATH handed to children is cut to the entries
//! after our own directory, so the real compiler is found instead of us.

use dcc_common::DccError;
use dcc_common::filename::{self, SuffixRules};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Compiler run when none is named.
pub const DEFAULT_COMPILER: &str = "cc";

/// A resolved compiler command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Compiler argv; `argv[0]` is the compiler.
    pub argv: Vec<String>,
    /// True when PATH was trimmed for masquerading.
    pub tweaked_path: bool,
    /// PATH for child processes, when it differs from ours.
    pub child_path: Option<OsString>,
}

/// Compiler argv for an explicit or implicit invocation.
///
/// `args` are the arguments after the client's own name.
pub fn find_compiler(args: &[String], rules: SuffixRules) -> Result<Invocation, DccError> {
    let Some(first) = args.first() else {
        return Err(DccError::BadArguments("missing operand".to_string()));
    };

    let argv = if first.starts_with('-') || rules.is_source(first) {
        trace!("implicit compiler {DEFAULT_COMPILER}");
        std::iter::once(DEFAULT_COMPILER.to_string())
            .chain(args.iter().cloned())
            .collect()
    } else {
        args.to_vec()
    };

    Ok(Invocation {
        argv,
        tweaked_path: false,
        child_path: None,
    })
}

/// Compiler argv for a masqueraded invocation.
///
/// `args` is our full argv; the compiler is `argv[0]`'s basename.
pub fn masquerade(
    args: &[String],
    path: Option<&OsStr>,
    cwd: &Path,
) -> Result<Invocation, DccError> {
    let Some(argv0) = args.first() else {
        return Err(DccError::BadArguments("empty command line".to_string()));
    };
    let progname = filename::basename(argv0).to_string();

    let child_path = path.and_then(|p| trim_path(argv0, &progname, p, cwd));
    match &child_path {
        Some(p) => debug!("masquerading as {progname}, PATH={}", p.to_string_lossy()),
        None => trace!("not modifying PATH"),
    }

    let mut argv = args.to_vec();
    argv[0] = progname;
    Ok(Invocation {
        argv,
        tweaked_path: child_path.is_some(),
        child_path,
    })
}

/// The part of `path` after the entry we were run from.
///
/// When `argv0` names a directory, that directory is the entry to skip;
/// otherwise it is the first entry holding an executable `progname`.
/// Returns `None` when nothing would remain.
pub fn trim_path(argv0: &str, progname: &str, path: &OsStr, cwd: &Path) -> Option<OsString> {
    let own_dir: Option<PathBuf> = argv0
        .contains('/')
        .then(|| Path::new(argv0).parent())
        .flatten()
        .map(|dir| cwd.join(dir));

    let entries: Vec<PathBuf> = std::env::split_paths(path).collect();
    let matched = entries.iter().position(|entry| match &own_dir {
        Some(dir) => entry == dir,
        None => which::which_in(progname, Some(entry), cwd).is_ok(),
    })?;

    let rest = &entries[matched + 1..];
    if rest.is_empty() {
        return None;
    }
    std::env::join_paths(rest).ok()
}
