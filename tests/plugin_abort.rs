//! Scenario 4 from the pipeline's testable properties: a plugin that
//! returns abort from pre-execute halts the run before the script's own
//! `main` is ever called.

use std::{path::Path, process::Command};

use crispy::{
    cache::FileCache,
    compiler::CcCompiler,
    pipeline::{Flags, Script},
    plugin_engine::PluginEngine,
};

fn compile_plugin(out: &Path) -> bool {
    let src = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/abort_plugin.c");
    let status = Command::new("cc")
        .args(["-shared", "-fPIC", "-o"])
        .arg(out)
        .arg(&src)
        .status();
    matches!(status, Ok(s) if s.success())
}

#[test]
fn pre_execute_abort_short_circuits_the_pipeline() {
    let Ok(compiler) = CcCompiler::system() else {
        eprintln!("skipping: no system C compiler available");
        return;
    };
    let work_dir = tempfile::tempdir().unwrap();
    let plugin_path = work_dir.path().join("abort_plugin.so");
    if !compile_plugin(&plugin_path) {
        eprintln!("skipping: could not build the test plugin fixture");
        return;
    }

    let cache = FileCache::new(work_dir.path().join("cache"));
    let mut plugins = PluginEngine::new();
    plugins.load(&plugin_path).expect("plugin should load");

    let script = Script::from_inline("return 55;", "", Flags::empty());
    let status = script.run(&compiler, &cache, &mut plugins, None, None, &[]).unwrap();

    assert_eq!(status, -1, "abort from pre-execute must surface as exit status -1");
}
