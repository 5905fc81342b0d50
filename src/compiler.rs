//! The pluggable compiler back end.

use std::{
    path::Path,
    process::{Command, Stdio},
};

use crate::error::{CrispyError, Result};

/// Capability set a back end must provide to compile scripts.
///
/// Mirrors the four operations the pipeline actually needs: a stable
/// version string for cache keying, a base flags string derived from
/// library-discovery tooling, and the two compile modes the pipeline's
/// normal and debugger paths use.
pub trait Compiler {
    /// A stable identifier for this compiler, folded into the cache
    /// fingerprint. Not necessarily a strict semver string.
    fn version(&self) -> &str;

    /// Flags this back end always passes, ahead of anything script- or
    /// config-supplied (library-discovery output, typically).
    fn base_flags(&self) -> &str;

    /// Compile `source` into a loadable shared library at `output`.
    fn compile_shared(&self, source: &Path, output: &Path, extra_flags: &str) -> Result<()>;

    /// Compile `source` into a standalone executable at `output`, used by
    /// the debugger-attach path.
    fn compile_executable(&self, source: &Path, output: &Path, extra_flags: &str) -> Result<()>;
}

/// Default back end: a system C compiler invoked via `std::process::Command`.
#[derive(Debug, Clone)]
pub struct CcCompiler {
    cc: String,
    version: String,
    base_flags: String,
}

impl CcCompiler {
    /// Probe `cc` for its version string and cache the library-discovery
    /// flags it should always pass. `cc` not found on `PATH` is reported as
    /// [`CrispyError::CompilerNotFound`].
    #[instrument(level = "debug", skip_all)]
    pub fn new(cc: impl Into<String>) -> Result<Self> {
        let cc = cc.into();
        let version = Self::probe_version(&cc)?;
        let base_flags = Self::probe_base_flags();
        Ok(Self { cc, version, base_flags })
    }

    /// Convenience constructor using `cc` as the compiler binary name.
    pub fn system() -> Result<Self> {
        Self::new("cc")
    }

    fn probe_version(cc: &str) -> Result<String> {
        let mut cmd = Command::new(cc);
        cmd.arg("--version").stdin(Stdio::piped()).stderr(Stdio::piped()).stdout(Stdio::piped());
        debug!(?cmd, "probing compiler version");
        let output = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CrispyError::CompilerNotFound(cc.to_string())
            } else {
                CrispyError::Io(e)
            }
        })?;
        trace!(?output);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().unwrap_or_default().trim().to_string();
        debug!(%first_line, "compiler version probed");
        Ok(first_line)
    }

    fn probe_base_flags() -> String {
        let mut cmd = Command::new("pkg-config");
        cmd.args(["--cflags", "--libs", "glib-2.0", "gobject-2.0", "gio-2.0", "gmodule-2.0"]);
        cmd.stdin(Stdio::piped()).stderr(Stdio::piped()).stdout(Stdio::piped());
        match cmd.output() {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            }
            Ok(output) => {
                warn!(?cmd, "pkg-config base flags probe failed, using empty base flags");
                trace!(?output);
                String::new()
            }
            Err(err) => {
                warn!(%err, "pkg-config not available, using empty base flags");
                String::new()
            }
        }
    }

    fn run(&self, mode_flags: &[&str], source: &Path, output: &Path, extra_flags: &str) -> Result<()> {
        let mut args: Vec<String> = mode_flags.iter().map(|s| s.to_string()).collect();
        args.extend(shell_words::split(&self.base_flags).unwrap_or_default());
        args.extend(shell_words::split(extra_flags).unwrap_or_default());
        args.push("-o".to_string());
        args.push(output.display().to_string());
        args.push(source.display().to_string());

        let mut cmd = Command::new(&self.cc);
        cmd.args(&args).stdin(Stdio::piped()).stderr(Stdio::piped()).stdout(Stdio::piped());
        debug!(?cmd, "invoking compiler");
        let command_line = format!("{} {}", self.cc, args.join(" "));
        let out = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CrispyError::CompilerNotFound(self.cc.clone())
            } else {
                CrispyError::Io(e)
            }
        })?;
        trace!(?out);
        if !out.status.success() {
            return Err(CrispyError::compile(command_line, &out));
        }
        Ok(())
    }
}

impl Compiler for CcCompiler {
    fn version(&self) -> &str {
        &self.version
    }

    fn base_flags(&self) -> &str {
        &self.base_flags
    }

    fn compile_shared(&self, source: &Path, output: &Path, extra_flags: &str) -> Result<()> {
        self.run(&["-shared", "-fPIC"], source, output, extra_flags)
    }

    fn compile_executable(&self, source: &Path, output: &Path, extra_flags: &str) -> Result<()> {
        self.run(&["-g", "-O0"], source, output, extra_flags)
    }
}
