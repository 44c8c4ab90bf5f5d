// ABOUTME: Terminal rendering of sandbox sessions and sweep reports
// ABOUTME: Tables via comfy-table, status colouring via colored

use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use sandkeep_sandbox::{EvictionReport, RepairReport, SandboxSession, SessionStatus};

const PLACEHOLDER: &str = "-";

fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

pub fn status_label(status: SessionStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        SessionStatus::Running | SessionStatus::Success => text.green(),
        SessionStatus::Failed => text.red(),
        SessionStatus::Pending | SessionStatus::Regenerating => text.yellow(),
        SessionStatus::Stopped => text.dimmed(),
    }
}

pub fn sessions_table(sessions: &[SandboxSession]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        "ID", "Caller", "Status", "Active", "Image", "Container", "Exit", "Updated",
    ]);

    for session in sessions {
        table.add_row(vec![
            session.id.clone(),
            session.caller_id.clone(),
            session.status.as_str().to_string(),
            if session.is_active { "yes" } else { "no" }.to_string(),
            session.base_image.clone(),
            session
                .runtime_container_id
                .as_deref()
                .map(short_id)
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
            session
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
            session
                .last_updated_at
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        ]);
    }

    table
}

pub fn session_detail(session: &SandboxSession) -> String {
    let mut lines = vec![
        format!("{} {}", "Session:".bold(), session.id),
        format!("{} {}", "Caller:".bold(), session.caller_id),
        format!("{} {}", "Status:".bold(), status_label(session.status)),
        format!("{} {}", "Active:".bold(), session.is_active),
        format!("{} {}", "Image:".bold(), session.base_image),
        format!(
            "{} {}",
            "Container:".bold(),
            session.runtime_container_id.as_deref().unwrap_or(PLACEHOLDER)
        ),
        format!(
            "{} {} MB, cpu {}/{}, pids {}",
            "Limits:".bold(),
            session.resource_limits_applied.memory_mb,
            session.resource_limits_applied.cpu_quota,
            session.resource_limits_applied.cpu_period,
            session.resource_limits_applied.pids_limit
        ),
        format!("{} {}", "Created:".bold(), session.created_at.to_rfc3339()),
        format!("{} {}", "Updated:".bold(), session.last_updated_at.to_rfc3339()),
    ];

    if let Some(code) = session.exit_code {
        lines.push(format!("{} {}", "Exit code:".bold(), code));
    }
    if let Some(result) = &session.execution_result {
        lines.push(format!("{}\n{}", "Output:".bold(), result.trim_end()));
    }
    if let Some(error) = &session.error_message {
        lines.push(format!("{}\n{}", "Error:".bold(), error.trim_end()));
    }

    lines.join("\n")
}

pub fn repair_summary(report: &RepairReport) -> String {
    format!(
        "Repair: examined {}, restored {}, retired {}, skipped {}",
        report.examined, report.restored, report.retired, report.skipped
    )
}

pub fn eviction_summary(report: &EvictionReport) -> String {
    format!(
        "Eviction: {} records deleted, {} containers removed, {} orphans removed, {} failures",
        report.records_deleted, report.containers_removed, report.orphans_removed, report.failures
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use sandkeep_config::ResourceLimits;

    fn session() -> SandboxSession {
        SandboxSession {
            id: "ses_0123456789".to_string(),
            caller_id: "agent-7".to_string(),
            runtime_container_id: Some("4f1c2b3a9d8e7f6a5b4c".to_string()),
            status: SessionStatus::Failed,
            is_active: true,
            base_image: "node:18".to_string(),
            code_to_execute: Some("process.exit(7)".to_string()),
            execution_result: Some("No output.".to_string()),
            error_message: None,
            exit_code: Some(7),
            resource_limits_applied: ResourceLimits::default(),
            created_at: Utc::now(),
            last_updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_sessions_table_contents() {
        let rendered = sessions_table(&[session()]).to_string();
        assert!(rendered.contains("ses_0123456789"));
        assert!(rendered.contains("agent-7"));
        assert!(rendered.contains("failed"));
        assert!(rendered.contains("4f1c2b3a9d8e"));
        assert!(!rendered.contains("4f1c2b3a9d8e7"));
    }

    #[test]
    fn test_session_detail_lists_outcome() {
        let detail = session_detail(&session());
        assert!(detail.contains("node:18"));
        assert!(detail.contains("No output."));
        assert!(detail.contains("2048 MB"));
        assert!(!detail.contains("Error:"));
    }

    #[test]
    fn test_report_summaries() {
        let report = RepairReport {
            examined: 3,
            restored: 1,
            retired: 2,
            skipped: 0,
        };
        assert_eq!(
            repair_summary(&report),
            "Repair: examined 3, restored 1, retired 2, skipped 0"
        );
        assert!(eviction_summary(&EvictionReport::default()).starts_with("Eviction: 0 records"));
    }
}
