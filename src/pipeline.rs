//! The script record and its nine-phase run pipeline.

use std::{
    ffi::CString,
    fs,
    io::Write,
    os::raw::{c_char, c_int},
    path::{Path, PathBuf},
    time::Instant,
};

use bitflags::bitflags;
use libloading::Library;
use once_cell::sync::Lazy;
use tempfile::{Builder, NamedTempFile};

use crate::{
    abi::{ErrorSink, HookContext, HookPoint, HookResult, host_set_error},
    cache::CacheProvider,
    compiler::Compiler,
    error::{CrispyError, Result},
    plugin_engine::PluginEngine,
    source_utils,
};

/// The temp source path for the run currently in flight, if any. Read by a
/// best-effort signal handler installed by the driver so an interrupt mid
/// compile still cleans up; this is the only cross-invocation global state
/// the pipeline keeps.
static CURRENT_TEMP_PATH: Lazy<std::sync::Mutex<Option<PathBuf>>> =
    Lazy::new(|| std::sync::Mutex::new(None));

/// A handle a signal handler can lock to read or clear the in-flight temp
/// source path.
pub fn current_temp_path_handle() -> &'static std::sync::Mutex<Option<PathBuf>> {
    &CURRENT_TEMP_PATH
}

bitflags! {
    /// Flags controlling a single run, settable from the command line or a
    /// configuration extension.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u32 {
        /// Recompile even if a valid cached artifact exists.
        const FORCE_RECOMPILE = 0b0001;
        /// Do not delete the generated temp source file on drop.
        const PRESERVE_SOURCE = 0b0010;
        /// Print the compile plan and exit without compiling or running.
        const DRY_RUN = 0b0100;
        /// Compile an executable and exec a debugger against it instead of
        /// dlopen-loading a shared library.
        const DEBUGGER = 0b1000;
    }
}

/// Where a script's source came from.
#[derive(Debug, Clone)]
enum Origin {
    File(PathBuf),
    Inline,
    Stdin,
}

/// A script ready to run: its original and header-stripped source, its
/// extracted `CRISPY_PARAMS` (if any), and the flags governing this run.
#[derive(Debug)]
pub struct Script {
    origin: Origin,
    source: Vec<u8>,
    stripped: String,
    params: Option<String>,
    flags: Flags,
    temp_file: Option<NamedTempFile>,
}

impl Script {
    /// Load a script from a file on disk.
    pub fn from_file(path: impl Into<PathBuf>, flags: Flags) -> Result<Self> {
        let path = path.into();
        let source = fs::read(&path)?;
        let text = String::from_utf8_lossy(&source).into_owned();
        let params = source_utils::extract_params(&text);
        let stripped = source_utils::strip_header(&text);
        Ok(Self { origin: Origin::File(path), source, stripped, params, flags, temp_file: None })
    }

    /// Wrap bare code in a `main` body with the given semicolon-separated
    /// extra includes. Inline scripts never have a `CRISPY_PARAMS` macro of
    /// their own and their stripped source equals their original source.
    pub fn from_inline(code: &str, extra_includes: &str, flags: Flags) -> Self {
        let mut wrapped = String::from("#include <stdio.h>\n");
        for inc in extra_includes.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            wrapped.push_str(&format!("#include {inc}\n"));
        }
        wrapped.push_str("int main(int argc, char **argv) {\n");
        wrapped.push_str(code);
        wrapped.push_str("\n}\n");
        let source = wrapped.clone().into_bytes();
        Self { origin: Origin::Inline, source, stripped: wrapped, params: None, flags, temp_file: None }
    }

    /// Read source from standard input.
    pub fn from_stdin(flags: Flags) -> Result<Self> {
        use std::io::Read;
        let mut source = Vec::new();
        std::io::stdin().read_to_end(&mut source)?;
        let text = String::from_utf8_lossy(&source).into_owned();
        let params = source_utils::extract_params(&text);
        let stripped = source_utils::strip_header(&text);
        Ok(Self { origin: Origin::Stdin, source, stripped, params, flags, temp_file: None })
    }

    fn source_path(&self) -> Option<&Path> {
        match &self.origin {
            Origin::File(p) => Some(p.as_path()),
            _ => None,
        }
    }

    /// Run this script to completion: compile-or-reuse, dlopen-load, and
    /// invoke `main`. Returns the script's own exit code, or `-1` if a
    /// plugin aborted the pipeline.
    #[instrument(level = "debug", skip_all)]
    pub fn run(
        mut self,
        compiler: &dyn Compiler,
        cache: &dyn CacheProvider,
        plugins: &mut PluginEngine,
        default_flags: Option<&str>,
        override_flags: Option<&str>,
        argv: &[String],
    ) -> Result<i32> {
        let start = Instant::now();
        let mut error_sink = ErrorSink::default();
        let mut ctx = HookContext {
            hook_point: HookPoint::SourceLoaded,
            source: self.stripped.as_ptr(),
            source_len: self.stripped.len(),
            params: std::ptr::null(),
            fingerprint: std::ptr::null(),
            artifact_path: std::ptr::null(),
            compiler_version: std::ptr::null(),
            temp_path: std::ptr::null(),
            flags: self.flags.bits(),
            cache_hit: false,
            time_param_expand_us: 0,
            time_hash_us: 0,
            time_cache_check_us: 0,
            time_compile_us: 0,
            time_module_load_us: 0,
            time_execute_us: 0,
            time_total_us: 0,
            engine: std::ptr::null_mut(),
            error_sink: &mut error_sink as *mut ErrorSink as *mut std::os::raw::c_void,
            set_error: Some(host_set_error),
            modified_source: std::ptr::null_mut(),
            modified_source_len: 0,
            extra_flags: std::ptr::null_mut(),
            argc: 0,
            argv: std::ptr::null_mut(),
            force_recompile: false,
            exit_code: 0,
            plugin_data: std::ptr::null_mut(),
        };

        // A non-`Continue` result at any hook point other than
        // `cache-checked` halts the pipeline; `force-recompile` is treated
        // as `abort` outside that one point (spec behavior for §4.4).
        macro_rules! dispatch_or_abort {
            ($point:expr) => {{
                let result = plugins.dispatch($point, &mut ctx);
                if result != HookResult::Continue {
                    return Ok(self.report_abort(&error_sink));
                }
            }};
        }

        // Phase 1: source-loaded. No dedicated timing field exists for this
        // phase (neither does the original); `time_total_us` stays at 0
        // until the next phase sets it.
        dispatch_or_abort!(HookPoint::SourceLoaded);
        if !ctx.modified_source.is_null() {
            let replaced = unsafe {
                std::slice::from_raw_parts(ctx.modified_source, ctx.modified_source_len)
            }
            .to_vec();
            self.stripped = String::from_utf8_lossy(&replaced).into_owned();
        }

        // Phase 2: params-expanded.
        let phase_start = Instant::now();
        let expanded_params = source_utils::shell_expand(self.params.as_deref())?;
        ctx.time_param_expand_us = phase_start.elapsed().as_micros() as u64;
        ctx.time_total_us = start.elapsed().as_micros() as u64;
        let expanded_cstr = CString::new(expanded_params.clone()).unwrap_or_default();
        ctx.params = expanded_cstr.as_ptr();
        dispatch_or_abort!(HookPoint::ParamsExpanded);

        // Phase 3: hash-computed. Exactly three tiers enter the hash:
        // config defaults, expanded params, config overrides. Plugin-
        // injected flags from pre-compile have not fired yet.
        let phase_start = Instant::now();
        let hash_flags = join_nonempty(&[default_flags.unwrap_or(""), &expanded_params, override_flags.unwrap_or("")]);
        let fingerprint = cache.compute_fingerprint(
            &self.source,
            if hash_flags.is_empty() { None } else { Some(hash_flags.as_str()) },
            compiler.version(),
        );
        let artifact_path = cache.artifact_path(&fingerprint);
        ctx.time_hash_us = phase_start.elapsed().as_micros() as u64;
        ctx.time_total_us = start.elapsed().as_micros() as u64;
        let fingerprint_cstr = CString::new(fingerprint.clone()).unwrap_or_default();
        let artifact_cstr = CString::new(artifact_path.display().to_string()).unwrap_or_default();
        let version_cstr = CString::new(compiler.version()).unwrap_or_default();
        ctx.fingerprint = fingerprint_cstr.as_ptr();
        ctx.artifact_path = artifact_cstr.as_ptr();
        ctx.compiler_version = version_cstr.as_ptr();
        dispatch_or_abort!(HookPoint::HashComputed);

        // Phase 4: cache-checked. The only point `force-recompile` means
        // what it says rather than being treated as abort.
        let phase_start = Instant::now();
        let force = self.flags.contains(Flags::FORCE_RECOMPILE);
        let mut cache_hit = if force { false } else { cache.is_valid(&fingerprint, self.source_path()) };
        ctx.time_cache_check_us = phase_start.elapsed().as_micros() as u64;
        ctx.time_total_us = start.elapsed().as_micros() as u64;
        ctx.cache_hit = cache_hit;
        let hook_result = plugins.dispatch(HookPoint::CacheChecked, &mut ctx);
        if hook_result == HookResult::ForceRecompile || ctx.force_recompile {
            cache_hit = false;
        } else if hook_result == HookResult::Abort {
            return Ok(self.report_abort(&error_sink));
        }

        // Kept alive until the function returns: `ctx.temp_path` is read
        // again at module-loaded, after this block closes.
        let mut temp_cstr: Option<CString> = None;
        if !cache_hit {
            let temp_path = self.write_temp_source()?;
            temp_cstr = Some(CString::new(temp_path.display().to_string()).unwrap_or_default());
            ctx.temp_path = temp_cstr.as_ref().unwrap().as_ptr();

            if self.flags.contains(Flags::DRY_RUN) {
                println!(
                    "would compile {} -> {} with flags: {}",
                    temp_path.display(),
                    artifact_path.display(),
                    hash_flags
                );
                return Ok(0);
            }

            if self.flags.contains(Flags::DEBUGGER) {
                let exe_path = artifact_path.with_extension("dbg");
                compiler.compile_executable(&temp_path, &exe_path, &expanded_params)?;
                return self.exec_debugger(&exe_path, argv);
            }

            // Pre-compile hook: may set plugin-injected flags (tier 3),
            // never folded into the hash above. No dedicated timing field
            // covers this hook itself; `time_compile_us` below covers only
            // the compiler invocation.
            ctx.time_total_us = start.elapsed().as_micros() as u64;
            dispatch_or_abort!(HookPoint::PreCompile);
            let plugin_flags = read_c_string(ctx.extra_flags);

            let compile_flags =
                join_nonempty(&[default_flags.unwrap_or(""), &expanded_params, &plugin_flags, override_flags.unwrap_or("")]);
            let phase_start = Instant::now();
            compiler.compile_shared(&temp_path, &artifact_path, &compile_flags)?;
            ctx.time_compile_us = phase_start.elapsed().as_micros() as u64;
            ctx.time_total_us = start.elapsed().as_micros() as u64;
            dispatch_or_abort!(HookPoint::PostCompile);
        }

        // Phase 6: module-loaded. Convergence point for hit and miss paths.
        let phase_start = Instant::now();
        let library = unsafe { Library::new(&artifact_path) }
            .map_err(|e| CrispyError::Load(format!("{}: {e}", artifact_path.display())))?;
        ctx.time_module_load_us = phase_start.elapsed().as_micros() as u64;
        ctx.time_total_us = start.elapsed().as_micros() as u64;
        dispatch_or_abort!(HookPoint::ModuleLoaded);

        // Phase 7: pre-execute hook may replace argc/argv. No dedicated
        // timing field covers this hook itself.
        let mut script_argv = argv.to_vec();
        ctx.argc = script_argv.len() as c_int;
        ctx.time_total_us = start.elapsed().as_micros() as u64;
        dispatch_or_abort!(HookPoint::PreExecute);
        if !ctx.argv.is_null() && ctx.argc >= 0 {
            script_argv = unsafe { read_c_argv(ctx.argv, ctx.argc as usize) };
        }

        // Phase 8: invoke main.
        let phase_start = Instant::now();
        let exit_code = unsafe { self.invoke_main(&library, &script_argv)? };
        ctx.time_execute_us = phase_start.elapsed().as_micros() as u64;
        ctx.exit_code = exit_code;

        // Phase 9: post-execute hook, fires regardless of main's outcome.
        // Its own abort does not unroll the already-completed invocation;
        // it just overrides the exit status below.
        ctx.time_total_us = start.elapsed().as_micros() as u64;
        let final_result = plugins.dispatch(HookPoint::PostExecute, &mut ctx);

        if final_result != HookResult::Continue {
            return Ok(self.report_abort(&error_sink));
        }
        Ok(exit_code)
    }

    /// Log and print the message a plugin left in `error_sink` (or a
    /// generic fallback) and yield the driver-level abort exit status.
    fn report_abort(&self, error_sink: &ErrorSink) -> i32 {
        let message = error_sink.message.as_deref().unwrap_or("aborted by plugin");
        error!(%message, "pipeline aborted");
        eprintln!("Error: {message}");
        -1
    }

    fn write_temp_source(&mut self) -> Result<PathBuf> {
        let mut file = Builder::new().prefix("crispy-").suffix(".c").tempfile_in(std::env::temp_dir())?;
        file.write_all(self.stripped.as_bytes())?;
        file.flush()?;
        let path = file.path().to_path_buf();
        self.temp_file = Some(file);
        *CURRENT_TEMP_PATH.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.clone());
        Ok(path)
    }

    fn exec_debugger(&self, executable: &Path, argv: &[String]) -> Result<i32> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let mut cmd = std::process::Command::new("gdb");
            cmd.arg("--args").arg(executable).args(argv);
            let err = cmd.exec();
            Err(CrispyError::Io(err))
        }
        #[cfg(not(unix))]
        {
            let _ = (executable, argv);
            Err(CrispyError::msg("debugger attach is only supported on unix"))
        }
    }

    unsafe fn invoke_main(&self, library: &Library, argv: &[String]) -> Result<i32> {
        type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char) -> c_int;
        let main: libloading::Symbol<'_, MainFn> =
            library.get(b"main\0").map_err(|_| CrispyError::NoMain)?;

        let c_args: Vec<CString> =
            argv.iter().map(|a| CString::new(a.as_str()).unwrap_or_default()).collect();
        let mut c_ptrs: Vec<*mut c_char> =
            c_args.iter().map(|c| c.as_ptr() as *mut c_char).collect();
        c_ptrs.push(std::ptr::null_mut());

        let exit_code = main(c_args.len() as c_int, c_ptrs.as_mut_ptr());
        Ok(exit_code)
    }
}

impl Drop for Script {
    fn drop(&mut self) {
        *CURRENT_TEMP_PATH.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let Some(file) = self.temp_file.take() else { return };
        if self.flags.contains(Flags::PRESERVE_SOURCE) {
            // `keep()` consumes the `NamedTempFile` without deleting it.
            let _ = file.keep();
        }
        // Otherwise `file`'s own `Drop` removes it from disk here.
    }
}

fn join_nonempty(parts: &[&str]) -> String {
    parts.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ")
}

unsafe fn read_c_string(ptr: *mut c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

unsafe fn read_c_argv(argv: *mut *mut c_char, argc: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(argc);
    for i in 0..argc {
        let ptr = *argv.add(i);
        if ptr.is_null() {
            break;
        }
        out.push(std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_script_wraps_in_main() {
        let script = Script::from_inline("printf(\"hi\\n\");", "<math.h>", Flags::empty());
        assert!(script.stripped.contains("int main(int argc, char **argv)"));
        assert!(script.stripped.contains("#include <math.h>"));
        assert!(script.params.is_none());
    }

    #[test]
    fn join_nonempty_skips_blank_tiers() {
        assert_eq!(join_nonempty(&["", "-O2", ""]), "-O2");
        assert_eq!(join_nonempty(&["-a", "-b", "-c"]), "-a -b -c");
        assert_eq!(join_nonempty(&["", "", ""]), "");
    }

    #[test]
    fn flags_force_recompile_bit() {
        let flags = Flags::FORCE_RECOMPILE | Flags::PRESERVE_SOURCE;
        assert!(flags.contains(Flags::FORCE_RECOMPILE));
        assert!(flags.contains(Flags::PRESERVE_SOURCE));
        assert!(!flags.contains(Flags::DRY_RUN));
    }

    #[test]
    fn report_abort_prefers_the_sink_message() {
        let script = Script::from_inline("return 0;", "", Flags::empty());
        let mut sink = ErrorSink::default();
        sink.message = Some("Aborted by test-abort plugin".to_string());
        assert_eq!(script.report_abort(&sink), -1);
    }

    #[test]
    fn report_abort_falls_back_without_a_message() {
        let script = Script::from_inline("return 0;", "", Flags::empty());
        assert_eq!(script.report_abort(&ErrorSink::default()), -1);
    }

    #[test]
    fn host_set_error_round_trips_through_the_sink() {
        let mut sink = ErrorSink::default();
        let msg = CString::new("boom").unwrap();
        unsafe {
            host_set_error(&mut sink as *mut ErrorSink as *mut std::os::raw::c_void, msg.as_ptr());
        }
        assert_eq!(sink.message.as_deref(), Some("boom"));
    }
}
