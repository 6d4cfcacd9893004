//! Compiler command-line classification and rewriting.
//!
//! [`scan_args`] decides whether a compiler invocation can be distributed
//! and, if so, extracts its single input and output. The remaining helpers
//! rewrite argument vectors for the preprocessor and the remote compiler.

use crate::errors::DccError;
use crate::filename::{self, SuffixRules};
use tracing::{debug, warn};

/// A distributable compile: one input, one output, and the argv to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub input: String,
    pub output: String,
    /// Full argv, including a synthesised `-o` if none was given.
    pub argv: Vec<String>,
    pub saw_c: bool,
    pub saw_s: bool,
}

/// Outcome of scanning a compiler command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Distributable(CompileRequest),
    /// Must run on this machine; `reason` is for logs only.
    LocalOnly { reason: String },
}

impl Classification {
    pub fn local_only(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        debug!("compile must run locally: {reason}");
        Classification::LocalOnly { reason }
    }

    pub fn is_distributable(&self) -> bool {
        matches!(self, Classification::Distributable(_))
    }
}

/// Options that make a build depend on something only the local machine has.
const LOCAL_ONLY_EXACT: &[&str] = &[
    "-E",
    "-march=native",
    "-mtune=native",
    "-fprofile-arcs",
    "-ftest-coverage",
    "--coverage",
];

/// Prefixes with the same effect as [`LOCAL_ONLY_EXACT`].
const LOCAL_ONLY_PREFIXES: &[&str] = &["-specs=", "-frepo", "-x", "-dr"];

/// Scan a compiler command line.
///
/// `argv[0]` is the compiler. Returns `Err(BadArguments)` only when the
/// compiler name itself is missing or looks like an option; every other
/// problem yields [`Classification::LocalOnly`].
pub fn scan_args(argv: &[String], rules: SuffixRules) -> Result<Classification, DccError> {
    let Some(compiler) = argv.first() else {
        return Err(DccError::BadArguments("empty command line".to_string()));
    };
    if compiler.starts_with('-') {
        return Err(DccError::BadArguments(format!(
            "compiler name {compiler:?} looks like an option"
        )));
    }
    debug!(argv = %format_argv(argv), "scanning arguments");

    let mut input: Option<&str> = None;
    let mut output: Option<&str> = None;
    let mut saw_c = false;
    let mut saw_s = false;

    let mut i = 1;
    while i < argv.len() {
        let arg = argv[i].as_str();

        let output_candidate = if arg.starts_with('-') {
            if LOCAL_ONLY_EXACT.contains(&arg) {
                return Ok(Classification::local_only(format!("{arg} must be local")));
            } else if arg.starts_with("-M") {
                match arg {
                    "-MD" | "-MMD" | "-MG" | "-MP" => {}
                    "-MF" | "-MT" | "-MQ" => i += 1,
                    _ if arg.starts_with("-MF")
                        || arg.starts_with("-MT")
                        || arg.starts_with("-MQ") => {}
                    _ => {
                        return Ok(Classification::local_only(format!(
                            "{arg} implies -E (maybe) and must be local"
                        )));
                    }
                }
                None
            } else if let Some(rest) = arg.strip_prefix("-Wa,") {
                let rest = format!(",{rest}");
                if rest.contains(",-a") || rest.contains("--MD") {
                    return Ok(Classification::local_only(format!(
                        "{arg} needs to write out assembly listings and must be local"
                    )));
                }
                None
            } else if LOCAL_ONLY_PREFIXES.iter().any(|p| arg.starts_with(p)) {
                return Ok(Classification::local_only(format!("{arg} must be local")));
            } else if arg == "-S" {
                saw_s = true;
                None
            } else if arg == "-c" {
                saw_c = true;
                None
            } else if arg == "-o" {
                i += 1;
                match argv.get(i) {
                    Some(next) => Some(next.as_str()),
                    None => {
                        return Ok(Classification::local_only("-o without a file name"));
                    }
                }
            } else {
                arg.strip_prefix("-o")
            }
        } else if rules.is_source(arg) {
            if let Some(first) = input {
                return Ok(Classification::local_only(format!(
                    "do we have two inputs? i give up ({first} and {arg})"
                )));
            }
            input = Some(arg);
            None
        } else if filename::is_object(arg) {
            Some(arg)
        } else {
            None
        };

        if let Some(out) = output_candidate {
            if let Some(first) = output {
                return Ok(Classification::local_only(format!(
                    "called for link? i give up ({first} and {out})"
                )));
            }
            output = Some(out);
        }
        i += 1;
    }

    if !saw_c && !saw_s {
        return Ok(Classification::local_only(
            "compiler apparently called not for compile",
        ));
    }
    let Some(input) = input else {
        return Ok(Classification::local_only("no visible input file"));
    };
    if filename::is_conftest(input) {
        return Ok(Classification::local_only(format!(
            "autoconf tests are run locally: {input}"
        )));
    }

    let mut argv = argv.to_vec();
    let output = match output {
        Some(out) => out.to_string(),
        None => {
            let ext = if saw_s { ".s" } else { ".o" };
            let Some(synth) = filename::output_from_source(input, ext) else {
                return Ok(Classification::local_only(format!(
                    "cannot derive an output name from {input}"
                )));
            };
            debug!("no output file given, assuming {synth}");
            argv.push("-o".to_string());
            argv.push(synth.clone());
            synth
        }
    };
    if output == "-" {
        return Ok(Classification::local_only("output to stdout"));
    }

    debug!(input, output = %output, "compile is distributable");
    Ok(Classification::Distributable(CompileRequest {
        input: input.to_string(),
        output,
        argv,
        saw_c,
        saw_s,
    }))
}

/// Split `-Wp,a,b,c` options into discrete tokens.
///
/// `-Wp,-MD,file` and `-Wp,-MMD,file` become `-MD -MF file` (resp. `-MMD`),
/// so later stages never see the compound form.
pub fn expand_preprocessor_options(argv: &[String]) -> Vec<String> {
    let mut expanded = Vec::with_capacity(argv.len());
    for arg in argv {
        let Some(rest) = arg.strip_prefix("-Wp,") else {
            expanded.push(arg.clone());
            continue;
        };
        let tokens: Vec<&str> = rest.split(',').filter(|t| !t.is_empty()).collect();
        match tokens.as_slice() {
            ["-MD" | "-MMD"] => {
                warn!("{arg} is missing a file name argument; leaving it unexpanded");
                expanded.push(arg.clone());
            }
            [flag @ ("-MD" | "-MMD"), file, others @ ..] => {
                expanded.push((*flag).to_string());
                expanded.push("-MF".to_string());
                expanded.push((*file).to_string());
                expanded.extend(others.iter().map(|t| t.to_string()));
            }
            _ => expanded.extend(tokens.iter().map(|t| t.to_string())),
        }
    }
    expanded
}

/// Replace every `-c` and `-S` with `new_action` (e.g. `-E`).
pub fn set_action_opt(argv: &mut [String], new_action: &str) -> Result<(), DccError> {
    let mut found = false;
    for arg in argv
        .iter_mut()
        .filter(|a| matches!(a.as_str(), "-c" | "-S"))
    {
        *arg = new_action.to_string();
        found = true;
    }
    if found {
        Ok(())
    } else {
        Err(DccError::Failed(
            "failed to find -c or -S in the command line".to_string(),
        ))
    }
}

/// Point the first `-o` option at `name`.
pub fn set_output(argv: &mut [String], name: &str) -> Result<(), DccError> {
    let Some(idx) = argv.iter().position(|a| a.starts_with("-o")) else {
        return Err(DccError::Failed("failed to find -o in the command line".to_string()));
    };
    if argv[idx] == "-o" {
        let Some(slot) = argv.get_mut(idx + 1) else {
            return Err(DccError::Failed("-o without a file name".to_string()));
        };
        *slot = name.to_string();
    } else {
        argv[idx] = format!("-o{name}");
    }
    Ok(())
}

/// Replace the first source-file token with `name`.
pub fn set_input(argv: &mut [String], rules: SuffixRules, name: &str) -> Result<(), DccError> {
    let Some(slot) = argv
        .iter_mut()
        .skip(1)
        .find(|a| !a.starts_with('-') && rules.is_source(a))
    else {
        return Err(DccError::Failed(
            "failed to find an input file in the command line".to_string(),
        ));
    };
    *slot = name.to_string();
    Ok(())
}

/// Remove `-o file` / `-ofile`.
pub fn strip_dash_o(argv: &[String]) -> Vec<String> {
    let mut stripped = Vec::with_capacity(argv.len());
    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        if arg == "-o" {
            iter.next();
        } else if !arg.starts_with("-o") {
            stripped.push(arg.clone());
        }
    }
    stripped
}

/// Preprocessor options that take an argument, separately or joined.
const LOCAL_ARGS_WITH_VALUE: &[&str] = &[
    "-D",
    "-I",
    "-U",
    "-L",
    "-l",
    "-MF",
    "-MT",
    "-MQ",
    "-include",
    "-imacros",
    "-iprefix",
    "-iwithprefix",
    "-isystem",
    "-iwithprefixbefore",
    "-idirafter",
];

/// Options from [`LOCAL_ARGS_WITH_VALUE`] that also accept a joined value.
const LOCAL_ARGS_JOINABLE: &[&str] = &["-D", "-I", "-U", "-L", "-l", "-MF", "-MT", "-MQ"];

const LOCAL_ARGS_FLAGS: &[&str] = &["-undef", "-nostdinc", "-nostdinc++", "-MD", "-MMD", "-MG", "-MP"];

/// Remove options that only matter to the local preprocessor, producing the
/// argv sent to a server that compiles already-preprocessed input.
pub fn strip_local_args(argv: &[String]) -> Vec<String> {
    let mut stripped = Vec::with_capacity(argv.len());
    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        if LOCAL_ARGS_WITH_VALUE.contains(&arg.as_str()) {
            iter.next();
            continue;
        }
        if LOCAL_ARGS_FLAGS.contains(&arg.as_str()) || arg.starts_with("-Wp,") {
            continue;
        }
        // Joined forms such as -DFOO=1 or -I/usr/include.
        if LOCAL_ARGS_JOINABLE
            .iter()
            .any(|opt| arg.len() > opt.len() && arg.starts_with(opt))
        {
            continue;
        }
        stripped.push(arg.clone());
    }
    stripped
}

/// How a compile wants its `.d` dependency file produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DotdInfo {
    /// Dependency file the compile will write, when `needs_dotd`.
    pub deps_file: Option<String>,
    /// `-MD` or `-MMD` present.
    pub needs_dotd: bool,
    /// `-MT` or `-MQ` present.
    pub sets_target: bool,
}

/// Work out the dependency-file settings of a compile.
pub fn dotd_info(argv: &[String], rules: SuffixRules) -> DotdInfo {
    let mut info = DotdInfo::default();
    let mut explicit: Option<String> = None;
    let mut output: Option<String> = None;
    let mut input: Option<String> = None;

    let mut iter = argv.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-MD" | "-MMD" => info.needs_dotd = true,
            "-MT" | "-MQ" => {
                info.sets_target = true;
                iter.next();
            }
            "-MF" => explicit = iter.next().cloned(),
            "-o" => output = iter.next().cloned(),
            a if a.starts_with("-MT") || a.starts_with("-MQ") => info.sets_target = true,
            a if a.starts_with("-MF") => explicit = Some(a[3..].to_string()),
            a if a.starts_with("-o") => output = Some(a[2..].to_string()),
            a if !a.starts_with('-') && input.is_none() && rules.is_source(a) => {
                input = Some(a.to_string());
            }
            _ => {}
        }
    }

    if info.needs_dotd {
        info.deps_file = explicit.or_else(|| {
            output
                .as_deref()
                .and_then(|o| filename::replace_extension(o, ".d"))
                .or_else(|| {
                    input
                        .as_deref()
                        .and_then(|i| filename::replace_extension(filename::basename(i), ".d"))
                })
        });
    }
    info
}

/// Render an argv for log output with shell quoting.
pub fn format_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_escape::escape(a.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
