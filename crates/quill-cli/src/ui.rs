//! Line-oriented rendering of session state, feed events and listings

use quill_agent::{FeedEvent, InteractionState, PendingConfirmation};
use quill_wire::{ActionRecord, ActionStatus, Decision, Job, Repo, StepRecord, StepStatus};
use serde_json::Value;
use std::io::{self, BufRead, Write};

use crate::utils::{clock_time, truncate_chars};

/// Print what changed between two snapshots of the same session.
pub fn render_transition(prev: &InteractionState, next: &InteractionState) {
    if prev.status != next.status {
        println!("[{}]", next.status.as_str());
    }
    if prev.message != next.message && !next.message.is_empty() {
        println!("{}", next.message);
    }
    for step in &next.steps {
        if prev.step(step.step) != Some(step) {
            println!("  {}", step_line(step));
        }
    }
    for action in &next.actions {
        if prev.action(&action.kind) != Some(action) {
            println!("  {}", action_line(action));
        }
    }
    if let Some(ref pending) = next.confirmation {
        let changed = prev.confirmation.as_ref().map(|c| &c.id) != Some(&pending.id);
        if changed {
            print_confirmation(pending);
        }
    }
}

fn step_line(step: &StepRecord) -> String {
    let mark = match step.status {
        StepStatus::Pending => " ",
        StepStatus::InProgress => "~",
        StepStatus::Completed => "x",
        StepStatus::Failed => "!",
    };
    match step.total_steps {
        Some(total) => format!("[{}] {}/{} {}", mark, step.step, total, step.description),
        None => format!("[{}] {} {}", mark, step.step, step.description),
    }
}

fn action_line(action: &ActionRecord) -> String {
    let state = match action.status {
        ActionStatus::Pending => "pending",
        ActionStatus::Executing => "running",
        ActionStatus::Completed => "done",
        ActionStatus::Failed => "failed",
    };
    let mut line = format!("<{} {}> {}", action.kind, state, action.description);
    if let Some(ref error) = action.error {
        line.push_str(&format!(" ({})", truncate_chars(error, 80)));
    } else if let Some(ref result) = action.result {
        let preview = match result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        line.push_str(&format!(" -> {}", truncate_chars(&preview.replace('\n', " "), 60)));
    }
    line
}

fn print_confirmation(pending: &PendingConfirmation) {
    println!();
    println!("? {}", pending.message);
    println!("  tool: {}", pending.tool);
    let args = serde_json::to_string_pretty(&pending.args).unwrap_or_default();
    for line in args.lines() {
        println!("  {}", line);
    }
}

/// A user's answer to a confirmation prompt
#[derive(Debug, PartialEq)]
pub enum Answer {
    Decide(Decision, Option<Value>),
    Invalid(String),
}

/// Interpret a line typed at the confirmation prompt.
///
/// `y`/`accept`, `n`/`reject`, or `m`/`modify` followed by replacement JSON
/// arguments.
pub fn parse_answer(input: &str) -> Answer {
    let input = input.trim();
    let (word, rest) = input
        .split_once(char::is_whitespace)
        .map(|(w, r)| (w, r.trim()))
        .unwrap_or((input, ""));

    match word.to_lowercase().as_str() {
        "y" | "yes" | "accept" => Answer::Decide(Decision::Accept, None),
        "n" | "no" | "reject" => Answer::Decide(Decision::Reject, None),
        "m" | "modify" => {
            if rest.is_empty() {
                return Answer::Invalid("modify needs JSON arguments".to_string());
            }
            match serde_json::from_str::<Value>(rest) {
                Ok(args) => Answer::Decide(Decision::Modify, Some(args)),
                Err(e) => Answer::Invalid(format!("invalid JSON arguments: {}", e)),
            }
        }
        _ => Answer::Invalid(format!("unknown answer: {}", word)),
    }
}

/// Ask on stdin until a valid answer is given. `None` on EOF.
pub fn ask_decision() -> io::Result<Option<(Decision, Option<Value>)>> {
    let stdin = io::stdin();
    loop {
        print!("  [y]es / [n]o / [m]odify <json> > ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            return Ok(None);
        }
        match parse_answer(&input) {
            Answer::Decide(decision, args) => return Ok(Some((decision, args))),
            Answer::Invalid(reason) => println!("  {}", reason),
        }
    }
}

/// One line per live feed event
pub fn feed_line(event: &FeedEvent) -> String {
    let notice = event.notice();
    let kind = notice.kind.as_deref().unwrap_or("event");
    format!(
        "{} {} [{}] {}",
        clock_time(event.received_at),
        event.resource_id,
        kind,
        truncate_chars(&notice.headline(), 100)
    )
}

pub fn print_repos(repos: &[Repo]) {
    if repos.is_empty() {
        println!("No connected repositories.");
        return;
    }
    for repo in repos {
        let name = if repo.full_name.is_empty() {
            &repo.name
        } else {
            &repo.full_name
        };
        let active = if repo.is_active { "" } else { " (inactive)" };
        println!("{}  {}{}", repo.id, name, active);
    }
}

pub fn print_available_repos(repos: &[Value]) {
    if repos.is_empty() {
        println!("No repositories available.");
        return;
    }
    for repo in repos {
        let name = repo
            .get("full_name")
            .or_else(|| repo.get("fullName"))
            .or_else(|| repo.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("?");
        println!("{}", name);
    }
}

pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    for job in jobs {
        let mut line = format!(
            "{}  {:<10} {}",
            job.id.as_deref().unwrap_or("-"),
            job.status,
            job.job_type
        );
        if let Some(ref repo) = job.repo_name {
            line.push_str(&format!("  {}", repo));
        }
        if let Some(ref created) = job.created_at {
            line.push_str(&format!("  {}", created));
        }
        if let Some(ref error) = job.error {
            line.push_str(&format!("  error: {}", truncate_chars(error, 60)));
        }
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_answer_words() {
        assert_eq!(parse_answer("y"), Answer::Decide(Decision::Accept, None));
        assert_eq!(parse_answer(" Accept \n"), Answer::Decide(Decision::Accept, None));
        assert_eq!(parse_answer("no"), Answer::Decide(Decision::Reject, None));
        assert!(matches!(parse_answer("maybe"), Answer::Invalid(_)));
    }

    #[test]
    fn test_parse_answer_modify_requires_json() {
        assert_eq!(
            parse_answer(r#"m {"path": "b.md"}"#),
            Answer::Decide(Decision::Modify, Some(json!({"path": "b.md"})))
        );
        assert!(matches!(parse_answer("modify"), Answer::Invalid(_)));
        assert!(matches!(parse_answer("modify {oops"), Answer::Invalid(_)));
    }

    #[test]
    fn test_feed_line_uses_headline() {
        let event = FeedEvent {
            resource_id: "repo-1".into(),
            payload: json!({"type": "commit", "files": ["a.md", "b.md"]}),
            received_at: 0,
        };
        let line = feed_line(&event);
        assert!(line.contains("repo-1 [commit]"));
        assert!(line.ends_with("a.md, b.md"));
    }

    #[test]
    fn test_step_line_shows_total() {
        let step = StepRecord {
            step: 2,
            description: "Write docs".into(),
            status: StepStatus::InProgress,
            total_steps: Some(3),
        };
        assert_eq!(step_line(&step), "[~] 2/3 Write docs");
    }
}
