//! Compiling and running a user's configuration extension.

use std::{fs, path::Path, process::Command};

use libloading::Library;

use crate::{
    cache::CacheProvider,
    compiler::Compiler,
    config_context::ConfigContext,
    error::{CrispyError, Result},
    source_utils,
};

type ConfigInitFn = unsafe extern "C" fn(*mut ConfigContext) -> bool;

/// Compile `config_path` (via the same compiler and cache machinery scripts
/// use), load it, and call its `crispy_config_init` entry point once with a
/// fresh [`ConfigContext`].
///
/// The loaded module is intentionally leaked so the extension's internal
/// state and any symbols it exports stay resolvable for the rest of the
/// process.
#[instrument(level = "debug", skip(compiler, cache))]
pub fn load_config(
    config_path: &Path,
    compiler: &dyn Compiler,
    cache: &dyn CacheProvider,
    driver_argv: Vec<String>,
    script_argv: Vec<String>,
    script_path: Option<std::path::PathBuf>,
) -> Result<ConfigContext> {
    let source = fs::read_to_string(config_path)?;
    let params = source_utils::extract_params(&source);
    let expanded = source_utils::shell_expand(params.as_deref())?;

    let include_flags = include_flags();
    let extra_flags = [include_flags.as_str(), expanded.as_str()]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let fingerprint = cache.compute_fingerprint(
        source.as_bytes(),
        if extra_flags.is_empty() { None } else { Some(extra_flags.as_str()) },
        compiler.version(),
    );
    let artifact_path = cache.artifact_path(&fingerprint);

    if !cache.is_valid(&fingerprint, Some(config_path)) {
        let stripped = source_utils::strip_header(&source);
        let temp_path = std::env::temp_dir().join(format!("crispy-config-{fingerprint}.c"));
        fs::write(&temp_path, &stripped)?;
        compiler.compile_shared(&temp_path, &artifact_path, &extra_flags)?;
        let _ = fs::remove_file(&temp_path);
    }

    let library = unsafe { Library::new(&artifact_path) }
        .map_err(|e| CrispyError::Config(format!("{}: {e}", artifact_path.display())))?;
    let init: libloading::Symbol<'_, ConfigInitFn> = unsafe { library.get(b"crispy_config_init\0") }
        .map_err(|_| CrispyError::Config("missing crispy_config_init entry point".to_string()))?;

    let mut ctx = ConfigContext::new(driver_argv, script_argv, script_path);
    let ok = unsafe { init(&mut ctx as *mut ConfigContext) };
    if !ok {
        return Err(CrispyError::Config("configuration init returned failure".to_string()));
    }

    // Deliberately leaked: the extension's internal state must stay
    // resolvable for the rest of the process.
    std::mem::forget(library);

    Ok(ctx)
}

/// Where to find `crispy`'s own headers: a dev-tree include directory when
/// built in place, otherwise whatever `pkg-config` reports for an installed
/// copy, otherwise nothing.
fn include_flags() -> String {
    if let Some(dir) = option_env!("CRISPY_DEV_INCLUDE_DIR") {
        return format!("-I{dir}");
    }
    let mut cmd = Command::new("pkg-config");
    cmd.args(["--cflags", "crispy"]);
    match cmd.output() {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).trim().to_string(),
        _ => {
            debug!("pkg-config could not find an installed crispy, no include flags added");
            String::new()
        }
    }
}
