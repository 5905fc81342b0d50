//! Parameter macro extraction and shebang/header stripping.

use std::process::{Command, Stdio};

use crate::error::{CrispyError, Result};

const PARAMS_DEFINE: &str = "#define CRISPY_PARAMS";

/// Find the value of the `CRISPY_PARAMS` macro if the source defines one.
///
/// Scans line by line for the first trimmed line beginning with
/// `#define CRISPY_PARAMS` and returns the text between the first and last
/// `"` on that line.
pub fn extract_params(source: &str) -> Option<String> {
    let line = source.lines().find(|l| l.trim_start().starts_with(PARAMS_DEFINE))?;
    let first = line.find('"')?;
    let last = line.rfind('"')?;
    if last <= first {
        return None;
    }
    Some(line[first + 1..last].to_string())
}

/// Remove a leading shebang line and the `CRISPY_PARAMS` define line, if
/// present, preserving every other line's original terminator.
pub fn strip_header(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut first = true;
    let mut params_seen = false;
    for line in source.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n');
        if first {
            first = false;
            if trimmed.starts_with("#!") {
                continue;
            }
        }
        if !params_seen && trimmed.trim_start().starts_with(PARAMS_DEFINE) {
            params_seen = true;
            continue;
        }
        out.push_str(line);
    }
    out
}

/// Expand `params` through `/bin/sh`'s own word-splitting and command
/// substitution rules, trimming trailing whitespace from the result.
///
/// Absent or empty input expands to the empty string without invoking a
/// shell.
pub fn shell_expand(params: Option<&str>) -> Result<String> {
    let Some(params) = params else {
        return Ok(String::new());
    };
    if params.trim().is_empty() {
        return Ok(String::new());
    }
    let script = format!("printf '%s ' {params}");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&script).stdin(Stdio::piped()).stderr(Stdio::piped()).stdout(Stdio::piped());
    debug!(?cmd, "expanding CRISPY_PARAMS");
    let output = cmd.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(CrispyError::Params(stderr));
    }
    let expanded = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    trace!(%expanded);
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_params_finds_define() {
        let src = "#include <stdio.h>\n#define CRISPY_PARAMS \"-O2 -lm\"\nint main(){}\n";
        assert_eq!(extract_params(src).as_deref(), Some("-O2 -lm"));
    }

    #[test]
    fn extract_params_none_when_absent() {
        let src = "int main(){}\n";
        assert_eq!(extract_params(src), None);
    }

    #[test]
    fn strip_header_removes_shebang_and_params_preserving_rest() {
        let src = "#!/usr/bin/env crispy\n#define CRISPY_PARAMS \"-O2\"\nint main(){\n    return 0;\n}\n";
        let stripped = strip_header(src);
        assert_eq!(stripped, "int main(){\n    return 0;\n}\n");
    }

    #[test]
    fn strip_header_no_trailing_blank_line_artifact() {
        let src = "int main(){}\n";
        assert_eq!(strip_header(src), "int main(){}\n");
    }

    #[test]
    fn strip_header_is_idempotent_without_header() {
        let src = "int main(){ return 1; }\n";
        assert_eq!(strip_header(src), strip_header(&strip_header(src)));
    }

    #[test]
    fn shell_expand_empty_is_empty_string() {
        assert_eq!(shell_expand(None).unwrap(), "");
        assert_eq!(shell_expand(Some("")).unwrap(), "");
        assert_eq!(shell_expand(Some("   ")).unwrap(), "");
    }

    #[test]
    fn shell_expand_runs_command_substitution() {
        let expanded = shell_expand(Some("$(echo -n flag1) $(echo -n flag2)")).unwrap();
        assert_eq!(expanded, "flag1 flag2");
    }
}
