use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// Scratch directory holding a source file and a private `DISTCC_DIR`.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub state_dir: PathBuf,
    pub source: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: Creating compile workspace");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let state_dir = dir.path().join("distcc");
        let source = dir.path().join("hello.c");
        fs::write(&source, "int main(void) { return 0; }\n").expect("Failed to write hello.c");

        Self {
            dir,
            state_dir,
            source,
        }
    }

    /// `dcc` running in the workspace with a clean client environment.
    pub fn dcc(&self, hosts: Option<&str>) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_dcc"));
        cmd.current_dir(self.dir.path())
            .env("DISTCC_DIR", &self.state_dir)
            .env("DISTCC_PAUSE_TIME_MSEC", "0")
            .env_remove("DISTCC_HOSTS")
            .env_remove("DISTCC_FALLBACK")
            .env_remove("DISTCC_BACKOFF_PERIOD")
            .env_remove("DISTCC_SKIP_LOCAL_RETRY")
            .env_remove("DISTCC_LOG")
            .env_remove("INCLUDE_SERVER_PORT")
            .env_remove("_DISTCC_SAFEGUARD");
        if let Some(hosts) = hosts {
            cmd.env("DISTCC_HOSTS", hosts);
        }
        cmd
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("lock")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.state_dir.join("state")
    }
}
