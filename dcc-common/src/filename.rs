//! File-name classification.
//!
//! Table-driven answers to "is this a source file", "is it already
//! preprocessed" and "what is the preprocessed/object name for it".

use std::path::Path;

// ── Suffix tables ──────────────────────────────────────────────────────────

/// Extensions accepted as compiler input.
const SOURCE_EXTENSIONS: &[&str] = &[
    "i", "ii", "c", "cc", "cpp", "cxx", "cp", "c++", "C", "m", "mm", "mi", "mii", "M",
];

/// Assembler sources, distributable only when remote assembly is enabled.
const ASSEMBLER_EXTENSIONS: &[&str] = &["s", "S"];

/// Extensions of files that need no further preprocessing.
const PREPROCESSED_EXTENSIONS: &[&str] = &["i", "ii", "mi", "mii"];

/// Preprocessed extension for each source extension.
const PREPROCESSED_MAP: &[(&str, &str)] = &[
    ("i", ".i"),
    ("c", ".i"),
    ("cc", ".ii"),
    ("cpp", ".ii"),
    ("cxx", ".ii"),
    ("cp", ".ii"),
    ("c++", ".ii"),
    ("C", ".ii"),
    ("ii", ".ii"),
    ("mi", ".mi"),
    ("m", ".mi"),
    ("mii", ".mii"),
    ("mm", ".mii"),
    ("M", ".mii"),
    ("s", ".s"),
    ("S", ".s"),
];

/// Basename prefixes of autoconf probe files, which always build locally.
const CONFTEST_PREFIXES: &[&str] = &["conftest.", "tmp.conftest."];

/// Suffix tables, parameterised by whether assembler input is distributable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuffixRules {
    pub remote_assemble: bool,
}

impl SuffixRules {
    pub fn new(remote_assemble: bool) -> Self {
        Self { remote_assemble }
    }

    /// True if `name` looks like a compiler source file.
    pub fn is_source(&self, name: &str) -> bool {
        let Some(ext) = extension(name) else {
            return false;
        };
        SOURCE_EXTENSIONS.contains(&ext)
            || (self.remote_assemble && ASSEMBLER_EXTENSIONS.contains(&ext))
    }

    /// True if `name` is already preprocessed.
    pub fn is_preprocessed(&self, name: &str) -> bool {
        let Some(ext) = extension(name) else {
            return false;
        };
        PREPROCESSED_EXTENSIONS.contains(&ext) || (self.remote_assemble && ext == "s")
    }
}

/// Extension after the last `.` of the basename, without the dot.
pub fn extension(name: &str) -> Option<&str> {
    let base = basename(name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() && ext.is_empty() {
        return None;
    }
    Some(ext)
}

/// Last path component of `name`, or `name` itself.
pub fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// True for object files (`.o`).
pub fn is_object(name: &str) -> bool {
    extension(name) == Some("o")
}

/// Preprocessed extension (with dot) for a source file, e.g. `.ii` for
/// `foo.cpp`.
pub fn preprocessed_extension(name: &str) -> Option<&'static str> {
    let ext = extension(name)?;
    PREPROCESSED_MAP
        .iter()
        .find(|(src, _)| *src == ext)
        .map(|(_, out)| *out)
}

/// Autoconf probe files must be compiled locally so configure scripts see
/// exactly the local compiler's behaviour.
pub fn is_conftest(input: &str) -> bool {
    let base = basename(input);
    CONFTEST_PREFIXES.iter().any(|p| base.starts_with(p))
}

/// Replace the extension of `name` with `new_ext` (which includes the dot).
pub fn replace_extension(name: &str, new_ext: &str) -> Option<String> {
    let dot = name.rfind('.')?;
    if name[dot..].contains('/') {
        return None;
    }
    Some(format!("{}{new_ext}", &name[..dot]))
}

/// Synthesise an output name from the input basename, e.g. `src/a.c` with
/// `.o` gives `a.o`. Inputs whose basename is shorter than three characters
/// or that lack an extension cannot be mapped.
pub fn output_from_source(input: &str, out_ext: &str) -> Option<String> {
    let base = basename(input);
    if base.len() < 3 {
        return None;
    }
    replace_extension(base, out_ext)
}

/// Display helper for paths that may not be UTF-8.
pub fn display_basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
