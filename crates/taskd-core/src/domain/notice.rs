//! Human-readable summary of a finished task, handed to notifiers.

use serde::Serialize;

use super::{Task, TaskId, TaskStatus};

const SUBJECT_PROMPT_CHARS: usize = 60;
const OUTPUT_PREVIEW_CHARS: usize = 3000;
const ERROR_PREVIEW_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub subject: String,
    pub body: String,
    pub prompt: String,
    pub project_dir: Option<String>,
    pub duration: String,
    pub exit_code: Option<i32>,
    pub tokens_used: Option<i64>,
    pub cost_usd: Option<f64>,
}

impl Notice {
    pub fn for_task(task: &Task) -> Self {
        let label = match task.status {
            TaskStatus::Completed => "Completed",
            TaskStatus::Cancelled => "Cancelled",
            _ => "Failed",
        };
        let subject = format!(
            "[taskd] {label}: {}",
            take_chars(&task.prompt, SUBJECT_PROMPT_CHARS)
        );
        let duration = format_duration(task.run_duration());

        let mut lines = vec![
            format!("Task: {}", task.prompt),
            format!("Status: {}", task.status),
            format!(
                "Project: {}",
                task.project_dir.as_deref().unwrap_or("(default)")
            ),
            format!("Duration: {duration}"),
        ];
        if let Some(tokens) = task.tokens_used.filter(|t| *t != 0) {
            lines.push(format!("Tokens: {}", group_thousands(tokens)));
        }
        if let Some(cost) = task.cost_usd.filter(|c| *c != 0.0) {
            lines.push(format!("Cost: ${cost:.4}"));
        }
        lines.push(String::new());
        lines.push("--- Output ---".to_string());
        lines.push(output_preview(task.output.as_deref()));
        if let Some(error) = task.error.as_deref().filter(|e| !e.is_empty()) {
            lines.push(format!(
                "\n--- Error ---\n{}",
                take_chars(error, ERROR_PREVIEW_CHARS)
            ));
        }

        Self {
            task_id: task.id,
            status: task.status,
            subject,
            body: lines.join("\n"),
            prompt: task.prompt.clone(),
            project_dir: task.project_dir.clone(),
            duration,
            exit_code: task.exit_code,
            tokens_used: task.tokens_used,
            cost_usd: task.cost_usd,
        }
    }
}

fn output_preview(output: Option<&str>) -> String {
    match output {
        Some(text) if !text.is_empty() => {
            let mut preview = take_chars(text, OUTPUT_PREVIEW_CHARS).to_string();
            if text.chars().count() > OUTPUT_PREVIEW_CHARS {
                preview.push_str("\n\n... (truncated, full output available via the API)");
            }
            preview
        }
        _ => "(no output)".to_string(),
    }
}

/// Prefix of at most `n` characters, cut on a char boundary.
fn take_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// `45s`, `2m 5s`, or a dash when the task never ran to completion.
pub fn format_duration(duration: Option<chrono::Duration>) -> String {
    let Some(duration) = duration else {
        return "—".to_string();
    };
    let secs = duration.num_seconds();
    if secs < 60 {
        return format!("{secs}s");
    }
    format!("{}m {}s", secs / 60, secs % 60)
}

fn group_thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, RunRecord, TaskUpdate};
    use chrono::{Duration, TimeZone, Utc};
    use rstest::rstest;
    use ulid::Ulid;

    fn finished(status: TaskStatus, record: RunRecord) -> Task {
        let created = Utc.with_ymd_and_hms(2025, 5, 2, 8, 0, 0).unwrap();
        let mut task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask {
                prompt: "refactor the parser".into(),
                project_dir: Some("/projects/app".into()),
            },
            created,
        );
        TaskUpdate::claim(created).apply(&mut task);
        TaskUpdate::finish(status, record, created + Duration::seconds(125)).apply(&mut task);
        task
    }

    #[rstest]
    #[case::never_ran(None, "—")]
    #[case::seconds(Some(Duration::milliseconds(45_900)), "45s")]
    #[case::minutes(Some(Duration::seconds(125)), "2m 5s")]
    #[case::exact_minute(Some(Duration::seconds(60)), "1m 0s")]
    fn durations(#[case] input: Option<Duration>, #[case] expected: &str) {
        assert_eq!(format_duration(input), expected);
    }

    #[rstest]
    #[case(7, "7")]
    #[case(1_234, "1,234")]
    #[case(1_234_567, "1,234,567")]
    #[case(-9_000, "-9,000")]
    fn thousands(#[case] n: i64, #[case] expected: &str) {
        assert_eq!(group_thousands(n), expected);
    }

    #[test]
    fn completed_notice_lists_metrics() {
        let task = finished(
            TaskStatus::Completed,
            RunRecord {
                output: Some("all green".into()),
                exit_code: Some(0),
                tokens_used: Some(12_500),
                cost_usd: Some(0.0321),
                ..RunRecord::default()
            },
        );
        let notice = Notice::for_task(&task);

        assert_eq!(notice.subject, "[taskd] Completed: refactor the parser");
        assert!(notice.body.contains("Project: /projects/app"));
        assert!(notice.body.contains("Duration: 2m 5s"));
        assert!(notice.body.contains("Tokens: 12,500"));
        assert!(notice.body.contains("Cost: $0.0321"));
        assert!(notice.body.ends_with("--- Output ---\nall green"));
    }

    #[test]
    fn failed_notice_truncates_output_and_error() {
        let task = finished(
            TaskStatus::Failed,
            RunRecord {
                output: Some("x".repeat(OUTPUT_PREVIEW_CHARS + 10)),
                error: Some("e".repeat(ERROR_PREVIEW_CHARS + 10)),
                exit_code: Some(1),
                ..RunRecord::default()
            },
        );
        let notice = Notice::for_task(&task);

        assert!(notice.subject.starts_with("[taskd] Failed: "));
        assert!(notice.body.contains("(truncated"));
        assert!(!notice.body.contains("Tokens:"));
        let error_part = notice.body.split("--- Error ---\n").nth(1).unwrap();
        assert_eq!(error_part.chars().count(), ERROR_PREVIEW_CHARS);
    }

    #[test]
    fn subject_prompt_is_cut_on_char_boundary() {
        assert_eq!(take_chars("héllo wörld", 4), "héll");
        assert_eq!(take_chars("short", 60), "short");
    }
}
