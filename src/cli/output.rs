//! Terminal rendering helpers

use console::style;
use serde_json::Value;

use crate::intent::Intent;

pub fn print_goal(goal: &str) {
    println!("{} {}", style("Goal:").cyan().bold(), goal);
}

pub fn print_success(message: &str) {
    println!("{} {}", style("ok").green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", style("error:").red().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", style("warning:").yellow().bold(), message);
}

pub fn print_dim(message: &str) {
    println!("{}", style(message).dim());
}

/// One executed step with its (possibly truncated) result
pub fn print_step(index: usize, tool: &str, action: &str, risk: u8, result: &Value) {
    let risk_label = match risk {
        0 => style(format!("risk={}", risk)).green(),
        1 | 2 => style(format!("risk={}", risk)).yellow(),
        _ => style(format!("risk={}", risk)).red(),
    };

    let rendered = render_result(result);
    println!(
        "  {}. {}.{} [{}] {} {}",
        index,
        style(tool).bold(),
        action,
        risk_label,
        style("→").dim(),
        rendered
    );
}

/// Numbered plan for dry runs and high-risk confirmations
pub fn render_plan(intent: &Intent) -> String {
    let mut lines = vec![format!("Would execute: {}", intent.goal)];
    for (i, step) in intent.steps.iter().enumerate() {
        lines.push(format!("{}. {} [risk={}]", i + 1, step.signature(), step.risk));
    }
    lines.join("\n")
}

/// Compact result rendering, truncated for readability
pub fn render_result(result: &Value) -> String {
    let text = match result {
        Value::Null => "(no output)".to_string(),
        Value::String(s) if s.trim().is_empty() => "(no output)".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if text.chars().count() > 300 {
        let truncated: String = text.chars().take(300).collect();
        format!("{}...", truncated)
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_result_truncates() {
        let long = Value::String("y".repeat(400));
        let rendered = render_result(&long);
        assert_eq!(rendered.chars().count(), 303);
        assert!(rendered.ends_with("..."));
    }

    #[test]
    fn test_render_result_empty() {
        assert_eq!(render_result(&Value::Null), "(no output)");
        assert_eq!(render_result(&json!("")), "(no output)");
    }

    #[test]
    fn test_render_plan_numbers_steps() {
        let intent = Intent::parse(
            r#"{"goal": "two things", "steps": [
                {"tool": "FileOps", "action": "scan", "args": {"path": "/a"}, "risk": 0},
                {"tool": "FileOps", "action": "scan", "args": {"path": "/b"}, "risk": 0}
            ]}"#,
        )
        .unwrap();
        let plan = render_plan(&intent);
        assert!(plan.contains("1. FileOps.scan"));
        assert!(plan.contains("2. FileOps.scan"));
    }
}
