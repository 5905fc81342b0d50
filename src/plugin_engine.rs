//! Loading plugin shared libraries and dispatching hooks to them in order.

use std::{collections::HashMap, os::raw::c_void, path::Path};

use libloading::{Library, Symbol};

use crate::{
    abi::{HookContext, HookPoint, HookResult, PluginHookFn, PluginInfo, PluginInitFn, PluginShutdownFn},
    error::{CrispyError, Result},
};

struct DataStoreEntry {
    value: *mut c_void,
    destructor: Option<unsafe extern "C" fn(*mut c_void)>,
}

/// A single loaded plugin: its library (kept alive for the engine's
/// lifetime), its mandatory descriptor, and whichever optional hooks it
/// exports.
struct PluginEntry {
    _library: Library,
    name: String,
    state: *mut c_void,
    shutdown: Option<PluginShutdownFn>,
    hooks: [Option<PluginHookFn>; 9],
}

/// Ordered list of loaded plugins plus the string-keyed data store they
/// share. Plugins fire in the order they were loaded, at every hook point.
#[derive(Default)]
pub struct PluginEngine {
    entries: Vec<PluginEntry>,
    data: HashMap<String, DataStoreEntry>,
}

impl PluginEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a single plugin shared library from `path`.
    ///
    /// The mandatory `crispy_plugin_info` symbol is resolved first; its
    /// absence is a [`CrispyError::Plugin`]. Init/shutdown and all nine
    /// named hooks are resolved as optional. If an initializer is present it
    /// is called immediately and its return value retained as this plugin's
    /// private state.
    #[instrument(level = "debug", skip(self))]
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let library = unsafe { Library::new(path) }
            .map_err(|e| CrispyError::Plugin(format!("{}: {e}", path.display())))?;

        let info: Symbol<'_, *const PluginInfo> = unsafe { library.get(b"crispy_plugin_info\0") }
            .map_err(|e| CrispyError::Plugin(format!("{}: missing crispy_plugin_info: {e}", path.display())))?;
        let info_ptr = unsafe { **info };
        let name = unsafe { read_c_str(info_ptr) };
        debug!(%name, ?path, "loaded plugin descriptor");

        let init: Option<Symbol<'_, PluginInitFn>> = unsafe { library.get(b"crispy_plugin_init\0") }.ok();
        let shutdown: Option<Symbol<'_, PluginShutdownFn>> =
            unsafe { library.get(b"crispy_plugin_shutdown\0") }.ok();

        let mut hooks: [Option<PluginHookFn>; 9] = [None; 9];
        for point in HookPoint::ALL {
            let symbol_name = format!("{}\0", point.symbol_name());
            let hook: Option<Symbol<'_, PluginHookFn>> =
                unsafe { library.get(symbol_name.as_bytes()) }.ok();
            hooks[point as usize] = hook.map(|h| *h);
        }

        let state = match init.as_ref() {
            Some(init) => unsafe { init() },
            None => std::ptr::null_mut(),
        };

        let shutdown = shutdown.map(|s| *s);

        self.entries.push(PluginEntry { _library: library, name, state, shutdown, hooks });
        Ok(())
    }

    /// Load every plugin named in a `:`- or `,`-separated list of paths, in
    /// order, stopping at the first failure.
    pub fn load_list(&mut self, paths: &str) -> Result<()> {
        for token in paths.split([':', ',']) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            self.load(Path::new(token))?;
        }
        Ok(())
    }

    /// Run every loaded plugin's handler for `point`, in load order,
    /// short-circuiting on the first non-[`HookResult::Continue`] result.
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn dispatch(&mut self, point: HookPoint, ctx: &mut HookContext) -> HookResult {
        ctx.hook_point = point;
        for entry in &mut self.entries {
            let Some(hook) = entry.hooks[point as usize] else {
                continue;
            };
            ctx.plugin_data = entry.state;
            ctx.engine = self as *mut Self as *mut c_void;
            let result = unsafe { hook(ctx as *mut HookContext) };
            entry.state = ctx.plugin_data;
            if result != HookResult::Continue {
                trace!(plugin = %entry.name, ?point, ?result, "hook short-circuited dispatch");
                return result;
            }
        }
        HookResult::Continue
    }

    /// Store `value` under `key`, running the previous entry's destructor
    /// (if any) first.
    pub fn set_data(&mut self, key: impl Into<String>, value: *mut c_void, destructor: Option<unsafe extern "C" fn(*mut c_void)>) {
        let key = key.into();
        if let Some(prev) = self.data.remove(&key) {
            if let Some(d) = prev.destructor {
                unsafe { d(prev.value) };
            }
        }
        self.data.insert(key, DataStoreEntry { value, destructor });
    }

    /// Look up a previously stored value.
    pub fn get_data(&self, key: &str) -> Option<*mut c_void> {
        self.data.get(key).map(|e| e.value)
    }
}

impl Drop for PluginEngine {
    fn drop(&mut self) {
        for (_, entry) in self.data.drain() {
            if let Some(d) = entry.destructor {
                unsafe { d(entry.value) };
            }
        }
        for entry in &self.entries {
            if let Some(shutdown) = entry.shutdown {
                unsafe { shutdown(entry.state) };
            }
        }
    }
}

unsafe fn read_c_str(ptr: *const std::os::raw::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_destructor(_value: *mut c_void) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn set_data_replace_runs_prior_destructor() {
        DESTROYED.store(0, Ordering::SeqCst);
        let mut engine = PluginEngine::new();
        engine.set_data("k", std::ptr::null_mut(), Some(count_destructor));
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
        engine.set_data("k", std::ptr::null_mut(), Some(count_destructor));
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 1, "replacing a key must destroy the old value");
    }

    #[test]
    fn get_data_returns_none_for_missing_key() {
        let engine = PluginEngine::new();
        assert!(engine.get_data("absent").is_none());
    }

    #[test]
    fn drop_runs_destructors_for_remaining_entries() {
        DESTROYED.store(0, Ordering::SeqCst);
        {
            let mut engine = PluginEngine::new();
            engine.set_data("a", std::ptr::null_mut(), Some(count_destructor));
            engine.set_data("b", std::ptr::null_mut(), Some(count_destructor));
        }
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn load_list_splits_on_colon_and_comma() {
        let mut engine = PluginEngine::new();
        let err = engine.load_list("missing1.so,missing2.so:missing3.so").unwrap_err();
        // Stops at the first failure rather than attempting all three.
        assert!(matches!(err, CrispyError::Plugin(_)));
    }

    #[test]
    fn dispatch_on_empty_engine_is_continue() {
        let mut engine = PluginEngine::new();
        let mut sink = crate::abi::ErrorSink::default();
        let mut ctx = HookContext {
            hook_point: HookPoint::SourceLoaded,
            source: std::ptr::null(),
            source_len: 0,
            params: std::ptr::null(),
            fingerprint: std::ptr::null(),
            artifact_path: std::ptr::null(),
            compiler_version: std::ptr::null(),
            temp_path: std::ptr::null(),
            flags: 0,
            cache_hit: false,
            time_param_expand_us: 0,
            time_hash_us: 0,
            time_cache_check_us: 0,
            time_compile_us: 0,
            time_module_load_us: 0,
            time_execute_us: 0,
            time_total_us: 0,
            engine: std::ptr::null_mut(),
            error_sink: &mut sink as *mut crate::abi::ErrorSink as *mut c_void,
            set_error: None,
            modified_source: std::ptr::null_mut(),
            modified_source_len: 0,
            extra_flags: std::ptr::null_mut(),
            argc: 0,
            argv: std::ptr::null_mut(),
            force_recompile: false,
            exit_code: 0,
            plugin_data: std::ptr::null_mut(),
        };
        assert_eq!(engine.dispatch(HookPoint::SourceLoaded, &mut ctx), HookResult::Continue);
    }
}
