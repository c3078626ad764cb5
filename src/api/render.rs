//! Markdown rendering of accepted submissions into tracker issues.

use super::types::{SubmitTicketRequest, TICKET_TYPE_BUG};

/// Render the issue title: `[Feedback][<PLATFORM>] <title>`.
pub fn issue_title(req: &SubmitTicketRequest) -> String {
    let platform = if req.environment.platform.is_empty() {
        "unknown"
    } else {
        &req.environment.platform
    };
    format!("[Feedback][{}] {}", platform.to_uppercase(), req.title)
}

/// Render the issue body. Optional sections are omitted when empty; the
/// server notes carry the source label and the client-IP hash.
pub fn issue_body(req: &SubmitTicketRequest, client_ip_hash: &str) -> String {
    let mut body = String::new();

    body.push_str("## Ticket Type\n");
    if req.ticket_type == TICKET_TYPE_BUG {
        body.push_str("- Bug report\n\n");
    } else {
        body.push_str("- Feature suggestion\n\n");
    }

    body.push_str("## Details\n");
    body.push_str(&req.detail);
    body.push_str("\n\n");

    push_optional_section(&mut body, "Reproduction Steps", &req.reproduction_steps);
    push_optional_section(&mut body, "Expected Behavior", &req.expected_behavior);
    push_optional_section(&mut body, "Actual Behavior", &req.actual_behavior);
    push_optional_section(&mut body, "Additional Context", &req.extra_context);

    let env = &req.environment;
    body.push_str("## Environment\n");
    body.push_str(&format!("- Platform: {}\n", env.platform));
    body.push_str(&format!(
        "- App version: {} (build {})\n",
        env.app_version, env.app_build
    ));
    body.push_str(&format!("- OS version: {}\n", env.os_version));
    body.push_str(&format!("- Device model: {}\n", env.device_model));
    body.push_str(&format!("- Locale: {}\n", env.locale_identifier));
    body.push_str(&format!("- Timezone: {}\n", env.timezone_identifier));
    body.push('\n');

    body.push_str("## Diagnostic Logs\n");
    if req.logs.is_empty() {
        body.push_str("- none\n");
    } else {
        for line in &req.logs {
            body.push_str("- ");
            body.push_str(line);
            body.push('\n');
        }
    }
    body.push('\n');

    body.push_str("## Server Notes\n");
    body.push_str("- Source: source/app-feedback\n");
    body.push_str("- Sync: status updated automatically from tracker labels\n");
    body.push_str(&format!("- Client IP hash: {}\n", client_ip_hash));

    body
}

fn push_optional_section(body: &mut String, heading: &str, content: &str) {
    if content.is_empty() {
        return;
    }
    body.push_str(&format!("## {}\n", heading));
    body.push_str(content);
    body.push_str("\n\n");
}
