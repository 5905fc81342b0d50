//! Crate-wide error type.

/// Convenience alias used throughout the crate.
pub type Result<T, E = CrispyError> = std::result::Result<T, E>;

/// Everything that can go wrong while preparing, caching, loading, or
/// running a script.
#[derive(Debug, thiserror::Error)]
pub enum CrispyError {
    /// The external compiler exited non-zero.
    #[error("compilation failed: {stderr}\ncommand: {command}")]
    Compile {
        /// Captured standard error from the compiler invocation.
        stderr: String,
        /// The fully rendered command line that was run.
        command: String,
    },

    /// `dlopen`-equivalent loading of a compiled artifact failed.
    #[error("failed to load module: {0}")]
    Load(String),

    /// The loaded module does not export a `main` symbol.
    #[error("compiled module has no main entry point")]
    NoMain,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `CRISPY_PARAMS` extraction or expansion failed.
    #[error("parameter expansion failed: {0}")]
    Params(String),

    /// The cache directory could not be used.
    #[error("cache error: {0}")]
    Cache(String),

    /// No usable compiler binary was found.
    #[error("compiler not found: {0}")]
    CompilerNotFound(String),

    /// A plugin failed to load or is malformed.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// The configuration extension failed to load or run.
    #[error("configuration error: {0}")]
    Config(String),

    /// Context built up at the call site.
    #[error("{0}")]
    Message(String),
}

impl CrispyError {
    pub(crate) fn msg(msg: impl std::fmt::Display) -> Self {
        CrispyError::Message(msg.to_string())
    }

    pub(crate) fn compile(command: impl std::fmt::Display, output: &std::process::Output) -> Self {
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.trim().is_empty() {
            stderr = String::from_utf8_lossy(&output.stdout).into_owned();
        }
        if stderr.trim().is_empty() {
            stderr = "<empty output>".to_string();
        }
        CrispyError::Compile { stderr: stderr.trim().to_string(), command: command.to_string() }
    }
}
