// ABOUTME: Execution protocol turning a code string into a runnable script inside a container
// ABOUTME: Interpreter selection by image family, base64 file transfer, run and cleanup commands

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Decodes `$0` (base64) into the file `$1`, truncating it.
pub const WRITE_SCRIPT: &str = r#"printf '%s' "$0" | base64 -d > "$1""#;

/// Same as [`WRITE_SCRIPT`] but appends.
pub const APPEND_SCRIPT: &str = r#"printf '%s' "$0" | base64 -d >> "$1""#;

/// Kills every process other than itself whose command line mentions `$0`.
pub const KILL_SCRIPT: &str = r#"for p in /proc/[0-9]*; do pid="${p#/proc/}"; [ "$pid" = "$$" ] && continue; if tr '\0' ' ' < "$p/cmdline" 2>/dev/null | grep -qF -- "$0"; then kill -9 "$pid" 2>/dev/null; fi; done; true"#;

/// Base64 characters per write step. A multiple of 4 so chunks decode independently
/// and well below the kernel's single-argument limit.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interpreter {
    pub program: &'static str,
    pub extension: &'static str,
}

pub const PYTHON: Interpreter = Interpreter {
    program: "python",
    extension: "py",
};
pub const NODE: Interpreter = Interpreter {
    program: "node",
    extension: "js",
};
pub const BASH: Interpreter = Interpreter {
    program: "bash",
    extension: "sh",
};

/// Pick the interpreter from the image name. The flag is true when nothing
/// matched and bash was chosen as a fallback.
pub fn select_interpreter(image: &str) -> (Interpreter, bool) {
    let image = image.to_lowercase();
    if image.contains("python") {
        (PYTHON, false)
    } else if image.contains("node") {
        (NODE, false)
    } else {
        (BASH, true)
    }
}

/// The commands that write, run and remove one script.
#[derive(Debug, Clone)]
pub struct ScriptPlan {
    pub path: String,
    pub interpreter: Interpreter,
    pub interpreter_fallback: bool,
    pub write_steps: Vec<Vec<String>>,
}

impl ScriptPlan {
    pub fn new(mount_dir: &str, image: &str, code: &str) -> Self {
        let (interpreter, interpreter_fallback) = select_interpreter(image);
        let path = format!(
            "{}/.sandkeep-{}.{}",
            mount_dir.trim_end_matches('/'),
            uuid::Uuid::new_v4().simple(),
            interpreter.extension
        );

        let encoded = BASE64.encode(code.as_bytes());
        let mut write_steps = Vec::new();
        // An empty script still needs the file to exist
        if encoded.is_empty() {
            write_steps.push(write_argv(WRITE_SCRIPT, "", &path));
        }
        for (index, chunk) in encoded.as_bytes().chunks(CHUNK_SIZE).enumerate() {
            let script = if index == 0 { WRITE_SCRIPT } else { APPEND_SCRIPT };
            // base64 output is ASCII, so byte chunks are valid strings
            let chunk = String::from_utf8_lossy(chunk);
            write_steps.push(write_argv(script, &chunk, &path));
        }

        Self {
            path,
            interpreter,
            interpreter_fallback,
            write_steps,
        }
    }

    pub fn run_argv(&self) -> Vec<String> {
        vec![self.interpreter.program.to_string(), self.path.clone()]
    }

    pub fn cleanup_argv(&self) -> Vec<String> {
        vec!["rm".to_string(), "-f".to_string(), self.path.clone()]
    }

    pub fn kill_argv(&self) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            KILL_SCRIPT.to_string(),
            self.path.clone(),
        ]
    }
}

fn write_argv(script: &str, payload: &str, path: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        payload.to_string(),
        path.to_string(),
    ]
}

/// Wrap a literal shell command for exec.
pub fn shell_argv(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interpreter_selection() {
        assert_eq!(select_interpreter("python:3.10-slim-bookworm"), (PYTHON, false));
        assert_eq!(select_interpreter("node:18"), (NODE, false));
        assert_eq!(select_interpreter("registry.local/Python-ml:1"), (PYTHON, false));
        assert_eq!(select_interpreter("ubuntu:22.04"), (BASH, true));
    }

    #[test]
    fn test_plan_paths_are_unique_and_in_mount() {
        let a = ScriptPlan::new("/share_area/", "python:3.10", "print(1)");
        let b = ScriptPlan::new("/share_area", "python:3.10", "print(1)");
        assert!(a.path.starts_with("/share_area/.sandkeep-"));
        assert!(a.path.ends_with(".py"));
        assert_ne!(a.path, b.path);
        assert_eq!(a.run_argv(), vec!["python".to_string(), a.path.clone()]);
        assert_eq!(a.cleanup_argv()[..2], ["rm".to_string(), "-f".to_string()]);
    }

    #[test]
    fn test_write_steps_carry_base64_not_raw_code() {
        let code = "print('it''s \"quoted\"; $(rm -rf /)')";
        let plan = ScriptPlan::new("/share_area", "python:3.10", code);
        assert_eq!(plan.write_steps.len(), 1);

        let step = &plan.write_steps[0];
        assert_eq!(step[2], WRITE_SCRIPT);
        assert!(!step.iter().any(|arg| arg.contains("rm -rf")));
        assert_eq!(BASE64.decode(&step[3]).unwrap(), code.as_bytes());
        assert_eq!(step[4], plan.path);
    }

    #[test]
    fn test_large_code_is_chunked() {
        let code = "x".repeat(CHUNK_SIZE);
        let plan = ScriptPlan::new("/share_area", "node:18", &code);
        assert!(plan.write_steps.len() > 1);
        assert_eq!(plan.write_steps[0][2], WRITE_SCRIPT);
        assert!(plan.write_steps[1..].iter().all(|s| s[2] == APPEND_SCRIPT));

        let mut decoded = Vec::new();
        for step in &plan.write_steps {
            decoded.extend(BASE64.decode(&step[3]).unwrap());
        }
        assert_eq!(decoded, code.as_bytes());
    }

    #[test]
    fn test_empty_code_still_writes_file() {
        let plan = ScriptPlan::new("/share_area", "python:3.10", "");
        assert_eq!(plan.write_steps.len(), 1);
        assert_eq!(plan.write_steps[0][3], "");
    }
}
