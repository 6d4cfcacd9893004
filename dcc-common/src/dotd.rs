//! Dependency-file time analysis.
//!
//! Used when a remote compile failed but the local retry succeeded: if one
//! of the compile's dependencies changed after the build started, the
//! mismatch is explained by the edit rather than by a broken server.

use glob::Pattern;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Return the first dependency listed in `dotd` that changed at or after
/// `reference`.
///
/// Returns `None` when the `.d` file is missing or older than `reference`,
/// when no dependency is fresh, or as soon as a dependency cannot be
/// examined. Names matching `exclude` are skipped.
pub fn fresh_dependency_exists(
    dotd: &Path,
    exclude: Option<&str>,
    reference: SystemTime,
) -> Option<PathBuf> {
    let reference = unix_secs(reference);

    let meta = match fs::metadata(dotd) {
        Ok(meta) => meta,
        Err(e) => {
            trace!("could not stat {}: {}", dotd.display(), e);
            return None;
        }
    };
    if modified_secs(&meta) < reference {
        trace!("old dotd file {}", dotd.display());
        return None;
    }

    let text = match fs::read(dotd) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            trace!("could not open {}: {}", dotd.display(), e);
            return None;
        }
    };

    let pattern = exclude.and_then(|p| match Pattern::new(p) {
        Ok(pattern) => Some(pattern),
        Err(e) => {
            warn!("ignoring invalid DISTCC_EXCLUDE_FRESH_FILES pattern {p:?}: {e}");
            None
        }
    });

    for name in dependency_names(&text) {
        if pattern.as_ref().is_some_and(|p| p.matches(&name)) {
            trace!("excluded dependency {name}");
            continue;
        }
        debug!("checking dependency {name}");
        let changed = match fs::metadata(&name) {
            Ok(meta) => changed_secs(&meta),
            Err(e) => {
                trace!("could not stat {name}: {e}");
                return None;
            }
        };
        if changed >= reference {
            return Some(PathBuf::from(name));
        }
    }
    None
}

/// Dependency names after the first `:` of a make rule.
///
/// Backslash-newline continues a line; other backslashes are dropped.
/// The list ends at the first token ending in `:`, which is the start of
/// the phony rules `-MP` appends.
pub fn dependency_names(text: &str) -> Vec<String> {
    let Some((_, deps)) = text.split_once(':') else {
        return Vec::new();
    };

    let mut names = Vec::new();
    let mut current = String::new();
    let mut chars = deps.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            c if c.is_whitespace() => {
                if !flush(&mut current, &mut names) {
                    return names;
                }
            }
            c => current.push(c),
        }
    }
    flush(&mut current, &mut names);
    names
}

/// Push the pending token. Returns false on a phony target.
fn flush(current: &mut String, names: &mut Vec<String>) -> bool {
    let token = std::mem::take(current);
    if token.ends_with(':') {
        return false;
    }
    if !token.is_empty() {
        names.push(token);
    }
    true
}

fn unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

fn modified_secs(meta: &fs::Metadata) -> i64 {
    meta.modified().map(unix_secs).unwrap_or(i64::MIN)
}

/// Status-change time (ctime) in seconds.
#[cfg(unix)]
fn changed_secs(meta: &fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.ctime()
}

#[cfg(not(unix))]
fn changed_secs(meta: &fs::Metadata) -> i64 {
    modified_secs(meta)
}

/// Change time of `path`, used as the build start reference.
pub fn change_time(path: &Path) -> io::Result<SystemTime> {
    let meta = fs::metadata(path)?;
    let secs = changed_secs(&meta);
    Ok(if secs >= 0 {
        UNIX_EPOCH + std::time::Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_dotd(dir: &Path, deps: &[&Path]) -> PathBuf {
        let list: Vec<String> = deps.iter().map(|d| d.display().to_string()).collect();
        let dotd = dir.join("hello.d");
        fs::write(&dotd, format!("hello.o: {}\n", list.join(" \\\n  "))).unwrap();
        dotd
    }

    #[test]
    fn test_dependency_names_parsing() {
        let names = dependency_names("a.o: a.c \\\n include/a.h\tb.h\n");
        assert_eq!(names, ["a.c", "include/a.h", "b.h"]);
        assert!(dependency_names("no rule here").is_empty());
    }

    #[test]
    fn test_dependency_names_stop_at_phony_target() {
        let names = dependency_names("a.o: a.c a.h\n\na.h:\n\nlate.h\n");
        assert_eq!(names, ["a.c", "a.h"]);

        let names = dependency_names("a.o: a.c\nb.h: c.h\n");
        assert_eq!(names, ["a.c"]);
    }

    #[test]
    fn test_fresh_dependency_found() {
        let dir = TempDir::new().unwrap();
        let header = dir.path().join("hello.h");
        fs::write(&header, "int x;").unwrap();
        let dotd = write_dotd(dir.path(), &[&header]);

        let reference = SystemTime::now() - Duration::from_secs(100);
        assert_eq!(fresh_dependency_exists(&dotd, None, reference), Some(header));
    }

    #[test]
    fn test_old_dotd_means_none() {
        let dir = TempDir::new().unwrap();
        let header = dir.path().join("hello.h");
        fs::write(&header, "int x;").unwrap();
        let dotd = write_dotd(dir.path(), &[&header]);

        let old = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&dotd, FileTime::from_system_time(old)).unwrap();

        let reference = SystemTime::now() - Duration::from_secs(100);
        assert_eq!(fresh_dependency_exists(&dotd, None, reference), None);
    }

    #[test]
    fn test_no_dependency_newer_than_reference() {
        let dir = TempDir::new().unwrap();
        let header = dir.path().join("hello.h");
        fs::write(&header, "int x;").unwrap();
        let dotd = write_dotd(dir.path(), &[&header]);

        // The dotd file must not be older than the reference either.
        let future = SystemTime::now() + Duration::from_secs(3600);
        filetime::set_file_mtime(&dotd, FileTime::from_system_time(future)).unwrap();
        let reference = SystemTime::now() + Duration::from_secs(1800);
        assert_eq!(fresh_dependency_exists(&dotd, None, reference), None);
    }

    #[test]
    fn test_excluded_dependency_is_skipped() {
        let dir = TempDir::new().unwrap();
        let header = dir.path().join("generated.h");
        fs::write(&header, "int x;").unwrap();
        let dotd = write_dotd(dir.path(), &[&header]);

        let reference = SystemTime::now() - Duration::from_secs(100);
        assert_eq!(
            fresh_dependency_exists(&dotd, Some("*/generated.h"), reference),
            None
        );
        assert_eq!(
            fresh_dependency_exists(&dotd, Some("*/other.h"), reference),
            Some(header)
        );
    }

    #[test]
    fn test_missing_dependency_stops_scan() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone.h");
        let header = dir.path().join("hello.h");
        fs::write(&header, "int x;").unwrap();
        let dotd = write_dotd(dir.path(), &[&missing, &header]);

        let reference = SystemTime::now() - Duration::from_secs(100);
        assert_eq!(fresh_dependency_exists(&dotd, None, reference), None);
    }

    #[test]
    fn test_missing_dotd() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            fresh_dependency_exists(&dir.path().join("nope.d"), None, SystemTime::now()),
            None
        );
    }
}
