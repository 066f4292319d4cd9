//! Refreshing "current" from the backed-up host
//!
//! The transfer itself is delegated to an external mirroring tool. hardsnap
//! only needs one operation from it, expressed by [`TreeMirror`]: make the
//! "current" directory an up-to-date copy of the source. [`RsyncMirror`]
//! implements it by running `rsync` over a remote shell, with arguments built
//! as a structured [`Command`] rather than a shell string.

use crate::error::{HardsnapError, Result};
use crate::record::RECORD_FILE;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Brings the "current" snapshot up to date with its source
pub trait TreeMirror {
    /// Refresh the tree rooted at `current`
    fn refresh(&self, current: &Path) -> Result<()>;
}

/// Mirrors a (typically remote) source with rsync
#[derive(Debug, Clone)]
pub struct RsyncMirror {
    program: PathBuf,
    source: String,
    remote_shell: Option<String>,
    excludes: Vec<String>,
    extra_args: Vec<String>,
}

impl RsyncMirror {
    /// Mirror from `source`, e.g. `backup@host:/srv/data`
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            program: PathBuf::from("rsync"),
            source: source.into(),
            remote_shell: Some("ssh".to_string()),
            excludes: vec![format!("/{}", RECORD_FILE)],
            extra_args: Vec::new(),
        }
    }

    /// Use a different rsync binary
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Remote shell passed to `-e`; `None` for local sources
    pub fn remote_shell(mut self, shell: Option<String>) -> Self {
        self.remote_shell = shell;
        self
    }

    /// Exclude an additional rsync pattern
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Append raw rsync arguments before the source operand
    pub fn extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// The command that refreshes `current`
    pub fn command(&self, current: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-a", "--delete", "--numeric-ids", "-H"]);
        if let Some(shell) = &self.remote_shell {
            cmd.arg("-e").arg(shell);
        }
        for pattern in &self.excludes {
            cmd.arg(format!("--exclude={}", pattern));
        }
        cmd.args(&self.extra_args);
        cmd.arg(with_trailing_slash(&self.source));
        cmd.arg(with_trailing_slash(&current.to_string_lossy()));
        cmd
    }
}

impl TreeMirror for RsyncMirror {
    fn refresh(&self, current: &Path) -> Result<()> {
        std::fs::create_dir_all(current)?;
        let mut cmd = self.command(current);
        debug!("Running {:?}", cmd);

        let output = cmd.output().map_err(|e| {
            HardsnapError::Mirror(format!("failed to start {:?}: {}", self.program, e))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HardsnapError::Mirror(format!(
                "{:?} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        info!("Mirrored {} into {:?}", self.source, current);
        Ok(())
    }
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}
