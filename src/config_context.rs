//! The short-lived context passed to a compiled configuration extension.

use std::{
    ffi::CString,
    os::raw::c_char,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;

use crate::pipeline::Flags;

/// A `NULL`-terminated C argv built from owned [`CString`]s, kept alive
/// alongside the pointers handed out to a config extension.
#[derive(Debug, Default)]
struct ArgvCache {
    _storage: Vec<CString>,
    ptrs: Vec<*mut c_char>,
}

impl ArgvCache {
    fn build(items: &[String]) -> Self {
        let storage: Vec<CString> =
            items.iter().map(|s| CString::new(s.as_str()).unwrap_or_default()).collect();
        let mut ptrs: Vec<*mut c_char> = storage.iter().map(|c| c.as_ptr() as *mut c_char).collect();
        ptrs.push(std::ptr::null_mut());
        Self { _storage: storage, ptrs }
    }
}

/// Accumulates everything a configuration extension can customize about a
/// run: default/override compiler flags, plugins to load, plugin data to
/// seed, flag overrides, a cache directory override, and an optional
/// replacement script argv.
///
/// Built fresh for a single call into the configuration extension's entry
/// point; nothing about it is reused across invocations.
#[derive(Debug, Default)]
pub struct ConfigContext {
    driver_argv: Vec<String>,
    driver_argv_cache: ArgvCache,
    script_argv: Vec<String>,
    script_argv_cache: ArgvCache,
    script_argv_replaced: bool,
    script_path: Option<PathBuf>,
    script_path_cache: Option<CString>,

    default_flags: Option<String>,
    override_flags: Option<String>,

    plugin_paths: Vec<PathBuf>,
    plugin_data: IndexMap<String, String>,

    flags: Flags,
    flags_set: bool,

    cache_dir: Option<PathBuf>,
}

impl ConfigContext {
    /// A fresh context seeded with the driver's own argv and the script's
    /// path (if known ahead of time).
    pub fn new(driver_argv: Vec<String>, script_argv: Vec<String>, script_path: Option<PathBuf>) -> Self {
        let driver_argv_cache = ArgvCache::build(&driver_argv);
        let script_argv_cache = ArgvCache::build(&script_argv);
        let script_path_cache =
            script_path.as_ref().map(|p| CString::new(p.to_string_lossy().into_owned()).unwrap_or_default());
        Self {
            driver_argv,
            driver_argv_cache,
            script_argv,
            script_argv_cache,
            script_path,
            script_path_cache,
            ..Default::default()
        }
    }

    pub fn driver_argv(&self) -> &[String] {
        &self.driver_argv
    }

    pub fn script_argv(&self) -> &[String] {
        &self.script_argv
    }

    pub fn script_path(&self) -> Option<&Path> {
        self.script_path.as_deref()
    }

    pub fn default_flags(&self) -> Option<&str> {
        self.default_flags.as_deref()
    }

    pub fn set_default_flags(&mut self, flags: impl Into<String>) {
        self.default_flags = Some(flags.into());
    }

    pub fn append_default_flags(&mut self, flags: &str) {
        append_flag_string(&mut self.default_flags, flags);
    }

    pub fn override_flags(&self) -> Option<&str> {
        self.override_flags.as_deref()
    }

    pub fn set_override_flags(&mut self, flags: impl Into<String>) {
        self.override_flags = Some(flags.into());
    }

    pub fn append_override_flags(&mut self, flags: &str) {
        append_flag_string(&mut self.override_flags, flags);
    }

    pub fn plugin_paths(&self) -> &[PathBuf] {
        &self.plugin_paths
    }

    pub fn add_plugin_path(&mut self, path: impl Into<PathBuf>) {
        self.plugin_paths.push(path.into());
    }

    pub fn plugin_data(&self) -> &IndexMap<String, String> {
        &self.plugin_data
    }

    /// Replace-semantics: a second call with the same key overwrites the
    /// first.
    pub fn set_plugin_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.plugin_data.insert(key.into(), value.into());
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn flags_set(&self) -> bool {
        self.flags_set
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
        self.flags_set = true;
    }

    pub fn add_flags(&mut self, flags: Flags) {
        self.flags |= flags;
        self.flags_set = true;
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    pub fn set_cache_dir(&mut self, dir: impl Into<PathBuf>) {
        self.cache_dir = Some(dir.into());
    }

    pub fn script_argv_was_replaced(&self) -> bool {
        self.script_argv_replaced
    }

    pub fn replace_script_argv(&mut self, argv: Vec<String>) {
        self.script_argv_cache = ArgvCache::build(&argv);
        self.script_argv = argv;
        self.script_argv_replaced = true;
    }
}

fn append_flag_string(slot: &mut Option<String>, addition: &str) {
    match slot {
        Some(existing) => {
            existing.push(' ');
            existing.push_str(addition);
        }
        None => *slot = Some(addition.to_string()),
    }
}

/// The C ABI a compiled configuration extension actually calls.
///
/// `ConfigContext` is never `#[repr(C)]` and a config `.so` never sees its
/// layout: it only ever holds the raw pointer handed to `crispy_config_init`
/// and calls these exported functions on it, exactly as it would an opaque
/// forward-declared struct. For a `dlopen`-loaded extension to resolve these
/// symbols at all, the final executable linking this crate needs to export
/// its own dynamic symbols (`-rdynamic` on Linux, `-Wl,-export_dynamic` on
/// macOS) — a downstream linking concern, not something this library can
/// arrange for itself.
///
/// `set_script_argv` copies the strings it is given rather than adopting the
/// caller's allocation: unlike the original's GLib-allocated `gchar**`,
/// there is no shared allocator to hand ownership across here, so the
/// config extension keeps owning (and must still free) whatever it passed
/// in.
mod ffi {
    use super::ConfigContext;
    use std::ffi::CStr;
    use std::os::raw::{c_char, c_int};

    unsafe fn read_str<'a>(s: *const c_char) -> Option<&'a str> {
        if s.is_null() {
            return None;
        }
        CStr::from_ptr(s).to_str().ok()
    }

    /// # Safety
    /// `ctx` must be a valid, non-null pointer to a live `ConfigContext`,
    /// as `crispy_config_init` is always called with one by `config_loader`.
    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_get_crispy_argc(ctx: *mut ConfigContext) -> c_int {
        (*ctx).driver_argv.len() as c_int
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_get_crispy_argv(ctx: *mut ConfigContext) -> *const *const c_char {
        (*ctx).driver_argv_cache.ptrs.as_ptr() as *const *const c_char
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_get_script_argc(ctx: *mut ConfigContext) -> c_int {
        (*ctx).script_argv.len() as c_int
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_get_script_argv(ctx: *mut ConfigContext) -> *mut *mut c_char {
        (*ctx).script_argv_cache.ptrs.as_mut_ptr()
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_get_script_path(ctx: *mut ConfigContext) -> *const c_char {
        match &(*ctx).script_path_cache {
            Some(cstr) => cstr.as_ptr(),
            None => std::ptr::null(),
        }
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_set_extra_flags(ctx: *mut ConfigContext, flags: *const c_char) {
        let Some(flags) = read_str(flags) else { return };
        (*ctx).set_default_flags(flags);
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_append_extra_flags(ctx: *mut ConfigContext, flags: *const c_char) {
        let Some(flags) = read_str(flags) else { return };
        if flags.is_empty() {
            return;
        }
        (*ctx).append_default_flags(flags);
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_set_override_flags(ctx: *mut ConfigContext, flags: *const c_char) {
        let Some(flags) = read_str(flags) else { return };
        (*ctx).set_override_flags(flags);
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_append_override_flags(
        ctx: *mut ConfigContext,
        flags: *const c_char,
    ) {
        let Some(flags) = read_str(flags) else { return };
        if flags.is_empty() {
            return;
        }
        (*ctx).append_override_flags(flags);
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_add_plugin(ctx: *mut ConfigContext, plugin_path: *const c_char) {
        let Some(plugin_path) = read_str(plugin_path) else { return };
        if plugin_path.is_empty() {
            return;
        }
        (*ctx).add_plugin_path(plugin_path);
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_set_plugin_data(
        ctx: *mut ConfigContext,
        key: *const c_char,
        value: *const c_char,
    ) {
        let Some(key) = read_str(key) else { return };
        let value = read_str(value).unwrap_or("");
        (*ctx).set_plugin_data(key, value);
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_set_flags(ctx: *mut ConfigContext, flags: u32) {
        (*ctx).set_flags(super::Flags::from_bits_truncate(flags));
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_add_flags(ctx: *mut ConfigContext, flags: u32) {
        (*ctx).add_flags(super::Flags::from_bits_truncate(flags));
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_set_cache_dir(ctx: *mut ConfigContext, cache_dir: *const c_char) {
        let Some(cache_dir) = read_str(cache_dir) else { return };
        (*ctx).set_cache_dir(cache_dir);
    }

    #[no_mangle]
    pub unsafe extern "C" fn crispy_config_context_set_script_argv(
        ctx: *mut ConfigContext,
        argc: c_int,
        argv: *mut *mut c_char,
    ) {
        if argc < 0 || argv.is_null() {
            return;
        }
        let mut copied = Vec::with_capacity(argc as usize);
        for i in 0..argc as usize {
            let ptr = *argv.add(i);
            if ptr.is_null() {
                break;
            }
            copied.push(CStr::from_ptr(ptr).to_string_lossy().into_owned());
        }
        (*ctx).replace_script_argv(copied);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_default_flags_accumulates() {
        let mut ctx = ConfigContext::default();
        ctx.append_default_flags("-O2");
        ctx.append_default_flags("-lm");
        assert_eq!(ctx.default_flags(), Some("-O2 -lm"));
    }

    #[test]
    fn set_plugin_data_replaces() {
        let mut ctx = ConfigContext::default();
        ctx.set_plugin_data("k", "v1");
        ctx.set_plugin_data("k", "v2");
        assert_eq!(ctx.plugin_data().get("k").map(String::as_str), Some("v2"));
    }

    #[test]
    fn flags_set_tracks_whether_flags_were_ever_set() {
        let mut ctx = ConfigContext::default();
        assert!(!ctx.flags_set());
        ctx.add_flags(Flags::DRY_RUN);
        assert!(ctx.flags_set());
        assert!(ctx.flags().contains(Flags::DRY_RUN));
    }

    #[test]
    fn replace_script_argv_marks_replaced() {
        let mut ctx = ConfigContext::new(vec![], vec!["a".into()], None);
        assert!(!ctx.script_argv_was_replaced());
        ctx.replace_script_argv(vec!["b".into(), "c".into()]);
        assert!(ctx.script_argv_was_replaced());
        assert_eq!(ctx.script_argv(), ["b", "c"]);
    }
}
