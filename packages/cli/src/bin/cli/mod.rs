pub mod maintenance;
pub mod session;
pub mod tool;

use sandkeep_sandbox::ExecOutcome;

/// Echo an outcome's streams and turn its exit code into a process exit code.
pub fn emit_outcome(outcome: &ExecOutcome) -> i32 {
    if let Some(stdout) = &outcome.stdout {
        print!("{}", stdout);
    }
    if let Some(stderr) = &outcome.stderr {
        eprint!("{}", stderr);
    }
    i32::try_from(outcome.exit_code)
        .ok()
        .filter(|code| (0..=255).contains(code))
        .unwrap_or(1)
}
