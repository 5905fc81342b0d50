//! The thin seam a command-line front end drives this crate through.
//!
//! Everything richer than "take parsed options, run the pipeline, return a
//! status" — argv parsing, config-file discovery beyond the one precedence
//! order below, packaging — belongs to the front end, not this crate.

use std::{
    env,
    ffi::CString,
    os::raw::{c_char, c_void},
    path::{Path, PathBuf},
};

use crate::{
    cache::FileCache,
    compiler::Compiler,
    config_loader,
    pipeline::{self, Flags, Script},
    plugin_engine::PluginEngine,
};

/// Parsed options a front end hands to [`run`].
#[derive(Debug, Default)]
pub struct DriverOptions {
    pub flags: Flags,
    pub script_path: Option<PathBuf>,
    pub inline_code: Option<String>,
    pub extra_includes: String,
    pub plugin_paths: Vec<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub script_argv: Vec<String>,
}

/// Resolve the configuration file to load, in precedence order: first,
/// `NO_CRISPY_CONFIG` (presence means "skip discovery entirely" regardless
/// of anything else below); then the `CRISPY_CONFIG_FILE` environment
/// variable; then an explicitly passed path; then the user's config
/// directory.
pub fn discover_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if env::var_os("NO_CRISPY_CONFIG").is_some() {
        return None;
    }
    if let Ok(from_env) = env::var("CRISPY_CONFIG_FILE") {
        if !from_env.is_empty() {
            return Some(PathBuf::from(from_env));
        }
    }
    if let Some(explicit) = explicit {
        return Some(explicit.to_path_buf());
    }
    dirs::config_dir().map(|d| d.join("crispy").join("config.c")).filter(|p| p.exists())
}

/// Install a best-effort cleanup handler that removes whatever temp source
/// file is currently in flight (tracked as process-wide global state in
/// [`pipeline::current_temp_path_handle`]) if the process is interrupted.
pub fn install_cleanup_handler() {
    let _ = ctrlc::set_handler(move || {
        if let Ok(guard) = pipeline::current_temp_path_handle().lock() {
            if let Some(path) = guard.as_ref() {
                let _ = std::fs::remove_file(path);
            }
        }
        std::process::exit(130);
    });
}

/// Run a script end to end: load configuration (if any resolves),
/// load plugins (configuration-declared ones first, per the ordering
/// guarantee), then build and run the [`Script`]. Returns the process exit
/// status.
///
/// The cache directory starts as `opts.cache_dir` (or the platform
/// default) and is rebuilt if the configuration extension overrides it;
/// the configuration source itself is always compiled with the
/// pre-override cache, since the override isn't known until the
/// extension's entry point has already run.
pub fn run(opts: DriverOptions, compiler: &dyn Compiler) -> i32 {
    install_cleanup_handler();

    let initial_cache = match &opts.cache_dir {
        Some(dir) => FileCache::new(dir),
        None => FileCache::platform_default(),
    };

    let mut plugins = PluginEngine::new();
    let mut default_flags = None;
    let mut override_flags = None;
    let mut script_argv = opts.script_argv.clone();
    let mut flags = opts.flags;
    let mut cache = initial_cache;

    if let Some(config_path) = discover_config(opts.config_path.as_deref()) {
        match config_loader::load_config(
            &config_path,
            compiler,
            &cache,
            std::env::args().collect(),
            opts.script_argv.clone(),
            opts.script_path.clone(),
        ) {
            Ok(ctx) => {
                for plugin_path in ctx.plugin_paths() {
                    if let Err(err) = plugins.load(plugin_path) {
                        eprintln!("Warning: failed to load plugin {}: {err}", plugin_path.display());
                    }
                }
                for (key, value) in ctx.plugin_data() {
                    seed_plugin_data(&mut plugins, key, value);
                }
                default_flags = ctx.default_flags().map(str::to_string);
                override_flags = ctx.override_flags().map(str::to_string);
                if ctx.flags_set() {
                    flags |= ctx.flags();
                }
                if ctx.script_argv_was_replaced() {
                    script_argv = ctx.script_argv().to_vec();
                }
                if let Some(dir) = ctx.cache_dir() {
                    cache = FileCache::new(dir);
                }
            }
            Err(err) => {
                eprintln!("Warning: configuration failed to load: {err}");
            }
        }
    }

    for plugin_path in &opts.plugin_paths {
        if let Err(err) = plugins.load(plugin_path) {
            eprintln!("Error: failed to load plugin {}: {err}", plugin_path.display());
            return 1;
        }
    }

    let script = if let Some(code) = &opts.inline_code {
        Script::from_inline(code, &opts.extra_includes, flags)
    } else {
        match &opts.script_path {
            Some(path) => match Script::from_file(path, flags) {
                Ok(script) => script,
                Err(err) => {
                    eprintln!("Error: {err}");
                    return 1;
                }
            },
            None => match Script::from_stdin(flags) {
                Ok(script) => script,
                Err(err) => {
                    eprintln!("Error: {err}");
                    return 1;
                }
            },
        }
    };

    match script.run(compiler, &cache, &mut plugins, default_flags.as_deref(), override_flags.as_deref(), &script_argv) {
        Ok(code) => {
            if flags.contains(Flags::PRESERVE_SOURCE) {
                eprintln!("Note: preserved generated source (temp file not removed)");
            }
            code
        }
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}

/// Seed the plugin engine's shared data store with one configuration-
/// supplied key/value pair as an owned, NUL-terminated C string, so any
/// loaded plugin can look it up by key at any hook point.
fn seed_plugin_data(plugins: &mut PluginEngine, key: &str, value: &str) {
    let owned = match CString::new(value) {
        Ok(c) => c,
        Err(_) => return,
    };
    plugins.set_data(key.to_string(), owned.into_raw() as *mut c_void, Some(free_owned_c_string));
}

unsafe extern "C" fn free_owned_c_string(ptr: *mut c_void) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr as *mut c_char));
    }
}
