// ABOUTME: Canonical shell command builders for the agent tool layer
// ABOUTME: Every argument is validated and single-quote escaped; nothing is interpolated raw

use crate::storage::{SandboxSession, SessionStatus};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ToolError {
    #[error("Invalid argument {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// Quote a value for POSIX sh: wrap in single quotes, escape embedded ones.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn validate<'a>(name: &'static str, value: &'a str) -> Result<&'a str> {
    if value.is_empty() {
        return Err(ToolError::InvalidArgument {
            name,
            reason: "must not be empty".to_string(),
        });
    }
    if value.contains('\0') {
        return Err(ToolError::InvalidArgument {
            name,
            reason: "must not contain NUL bytes".to_string(),
        });
    }
    Ok(value)
}

pub fn read_file(path: &str) -> Result<String> {
    Ok(format!("cat -- {}", shell_quote(validate("path", path)?)))
}

/// Content travels base64 encoded, so arbitrary bytes survive.
pub fn write_file(path: &str, content: &str) -> Result<String> {
    let path = shell_quote(validate("path", path)?);
    Ok(format!(
        "printf '%s' {} | base64 -d > {}",
        shell_quote(&BASE64.encode(content.as_bytes())),
        path
    ))
}

pub fn list_dir(path: &str) -> Result<String> {
    Ok(format!("ls -la -- {}", shell_quote(validate("path", path)?)))
}

pub fn grep(pattern: &str, path: &str, recursive: bool) -> Result<String> {
    let pattern = shell_quote(validate("pattern", pattern)?);
    let path = shell_quote(validate("path", path)?);
    let flags = if recursive { "-rn" } else { "-n" };
    Ok(format!("grep {} -e {} -- {}", flags, pattern, path))
}

/// Fetch a URL into `dest` with whichever of wget or curl the image has.
pub fn download_url(url: &str, dest: &str) -> Result<String> {
    let url = validate("url", url)?;
    let lower = url.to_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(ToolError::InvalidArgument {
            name: "url",
            reason: "only http and https URLs are allowed".to_string(),
        });
    }
    if url.chars().any(char::is_whitespace) {
        return Err(ToolError::InvalidArgument {
            name: "url",
            reason: "must not contain whitespace".to_string(),
        });
    }

    let url = shell_quote(url);
    let dest = shell_quote(validate("dest", dest)?);
    Ok(format!(
        "if command -v wget >/dev/null 2>&1; then wget -q -O {dest} {url}; \
         else curl -fsSL -o {dest} {url}; fi"
    ))
}

/// Process listing that still works on images without procps.
pub fn list_processes() -> String {
    "ps aux 2>/dev/null || for p in /proc/[0-9]*; do \
     printf '%s %s\\n' \"${p#/proc/}\" \"$(tr '\\0' ' ' < \"$p/cmdline\" 2>/dev/null)\"; done"
        .to_string()
}

/// Human-readable summary of a session's last execution for an agent.
pub fn summarize(session: &SandboxSession) -> String {
    let output = session
        .execution_result
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("No specific output.");

    let succeeded = matches!(
        session.status,
        SessionStatus::Running | SessionStatus::Success
    ) && session.exit_code.unwrap_or(0) == 0
        && session.error_message.is_none();

    if succeeded {
        format!("Sandbox execution succeeded.\nOutput:\n{}", output)
    } else {
        let error = session
            .error_message
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("No specific error message.");
        let exit_code = session
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "Sandbox execution failed with exit code {}.\nError:\n{}\nOutput:\n{}",
            exit_code, error, output
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_file_commands() {
        assert_eq!(read_file("/share_area/a b.txt").unwrap(), "cat -- '/share_area/a b.txt'");
        assert_eq!(list_dir("/share_area").unwrap(), "ls -la -- '/share_area'");

        let cmd = write_file("/share_area/x.py", "print('hi')\n").unwrap();
        assert_eq!(
            cmd,
            format!(
                "printf '%s' '{}' | base64 -d > '/share_area/x.py'",
                BASE64.encode("print('hi')\n")
            )
        );
    }

    #[test]
    fn test_grep() {
        assert_eq!(
            grep("fn main", "/share_area", true).unwrap(),
            "grep -rn -e 'fn main' -- '/share_area'"
        );
        assert_eq!(
            grep("-v", "notes.txt", false).unwrap(),
            "grep -n -e '-v' -- 'notes.txt'"
        );
    }

    #[test]
    fn test_download_url_validation() {
        let cmd = download_url("https://example.com/data.csv", "/share_area/data.csv").unwrap();
        assert!(cmd.contains("wget -q -O '/share_area/data.csv' 'https://example.com/data.csv'"));
        assert!(cmd.contains("curl -fsSL -o '/share_area/data.csv' 'https://example.com/data.csv'"));

        assert!(matches!(
            download_url("file:///etc/passwd", "/tmp/x"),
            Err(ToolError::InvalidArgument { name: "url", .. })
        ));
        assert!(download_url("https://example.com/a b", "/tmp/x").is_err());
    }

    #[test]
    fn test_rejects_empty_and_nul() {
        assert!(matches!(
            read_file(""),
            Err(ToolError::InvalidArgument { name: "path", .. })
        ));
        assert!(list_dir("a\0b").is_err());
        assert!(grep("", "/share_area", false).is_err());
    }

    #[test]
    fn test_list_processes_has_proc_fallback() {
        let cmd = list_processes();
        assert!(cmd.starts_with("ps aux"));
        assert!(cmd.contains("/proc/[0-9]*"));
    }
}
