//! The stable C ABI plugin contract.
//!
//! Every type here is `#[repr(C)]` and is shared verbatim with compiled
//! plugin shared libraries; nothing in this module has a safe public API of
//! its own beyond the type definitions. All access to the pointers it
//! describes is confined to [`crate::plugin_engine`].

use std::os::raw::{c_char, c_int, c_void};

/// The nine points in the pipeline a plugin may observe or intercept.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    SourceLoaded = 0,
    ParamsExpanded = 1,
    HashComputed = 2,
    CacheChecked = 3,
    PreCompile = 4,
    PostCompile = 5,
    ModuleLoaded = 6,
    PreExecute = 7,
    PostExecute = 8,
}

impl HookPoint {
    /// All hook points in pipeline order.
    pub const ALL: [HookPoint; 9] = [
        HookPoint::SourceLoaded,
        HookPoint::ParamsExpanded,
        HookPoint::HashComputed,
        HookPoint::CacheChecked,
        HookPoint::PreCompile,
        HookPoint::PostCompile,
        HookPoint::ModuleLoaded,
        HookPoint::PreExecute,
        HookPoint::PostExecute,
    ];

    /// The exported symbol name a plugin must use for this hook point.
    pub fn symbol_name(self) -> &'static str {
        match self {
            HookPoint::SourceLoaded => "crispy_plugin_on_source_loaded",
            HookPoint::ParamsExpanded => "crispy_plugin_on_params_expanded",
            HookPoint::HashComputed => "crispy_plugin_on_hash_computed",
            HookPoint::CacheChecked => "crispy_plugin_on_cache_checked",
            HookPoint::PreCompile => "crispy_plugin_on_pre_compile",
            HookPoint::PostCompile => "crispy_plugin_on_post_compile",
            HookPoint::ModuleLoaded => "crispy_plugin_on_module_loaded",
            HookPoint::PreExecute => "crispy_plugin_on_pre_execute",
            HookPoint::PostExecute => "crispy_plugin_on_post_execute",
        }
    }
}

/// What a hook handler tells the engine to do next.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    /// Keep going: run the next plugin's handler, then the pipeline phase.
    Continue = 0,
    /// Halt the pipeline immediately.
    Abort = 1,
    /// Meaningful only from [`HookPoint::CacheChecked`]: treat a cache hit
    /// as a miss. Anywhere else the pipeline treats this the same as
    /// `Abort`.
    ForceRecompile = 2,
}

/// Mandatory descriptor every plugin exports under `crispy_plugin_info`.
#[repr(C)]
pub struct PluginInfo {
    pub name: *const c_char,
    pub description: *const c_char,
    pub version: *const c_char,
    pub author: *const c_char,
    pub license: *const c_char,
}

/// Pipeline state passed to every hook invocation.
///
/// Mutable fields (`modified_source*`, `extra_flags`, `argc`/`argv`,
/// `force_recompile`, `exit_code`, `plugin_data`) are reset before each
/// dispatch and only reflect the most recent plugin's writes for the
/// duration of that single dispatch call — they do not persist across
/// pipeline phases except where the pipeline itself reads them back
/// immediately after dispatching.
#[repr(C)]
pub struct HookContext {
    pub hook_point: HookPoint,

    // Read-only pipeline state.
    pub source: *const u8,
    pub source_len: usize,
    pub params: *const c_char,
    pub fingerprint: *const c_char,
    pub artifact_path: *const c_char,
    pub compiler_version: *const c_char,
    pub temp_path: *const c_char,
    pub flags: u32,
    pub cache_hit: bool,

    // Timing, microseconds. Each is set once, as its named phase completes,
    // and is left populated (not reset) for every later hook dispatch in
    // the same run — a plugin firing at `post-execute` can still read how
    // long `hash-computed` or `module-loaded` took. `source-loaded` has no
    // dedicated counter, matching the phases the original tracks.
    pub time_param_expand_us: u64,
    pub time_hash_us: u64,
    pub time_cache_check_us: u64,
    pub time_compile_us: u64,
    pub time_module_load_us: u64,
    pub time_execute_us: u64,
    pub time_total_us: u64,

    // Back-pointers, opaque to plugins.
    pub engine: *mut c_void,
    pub error_sink: *mut c_void,
    /// Call with (`error_sink`, a NUL-terminated message) to report why a
    /// hook is about to abort. A function pointer rather than an exported
    /// symbol so a plugin never has to resolve a host symbol by name.
    pub set_error: Option<SetErrorFn>,

    // Mutable, plugin-writable.
    pub modified_source: *mut u8,
    pub modified_source_len: usize,
    pub extra_flags: *mut c_char,
    pub argc: c_int,
    pub argv: *mut *mut c_char,
    pub force_recompile: bool,
    pub exit_code: c_int,

    /// Swapped in/out around each plugin's own handler call by the engine.
    pub plugin_data: *mut c_void,
}

pub type PluginInitFn = unsafe extern "C" fn() -> *mut c_void;
pub type PluginShutdownFn = unsafe extern "C" fn(*mut c_void);
pub type PluginHookFn = unsafe extern "C" fn(*mut HookContext) -> HookResult;
pub type SetErrorFn = unsafe extern "C" fn(*mut c_void, *const c_char);

/// Owns the message a plugin reports through `HookContext::set_error`
/// before aborting. Opaque to plugins; only [`host_set_error`] and the
/// pipeline that wires up `error_sink` ever touch it.
#[derive(Default)]
pub(crate) struct ErrorSink {
    pub message: Option<String>,
}

/// The function every `HookContext::set_error` pointer is set to. Writes
/// `message` into the `ErrorSink` behind `sink`, replacing whatever was
/// there.
pub(crate) unsafe extern "C" fn host_set_error(sink: *mut c_void, message: *const c_char) {
    if sink.is_null() {
        return;
    }
    let sink = &mut *(sink as *mut ErrorSink);
    sink.message = if message.is_null() {
        None
    } else {
        Some(std::ffi::CStr::from_ptr(message).to_string_lossy().into_owned())
    };
}
