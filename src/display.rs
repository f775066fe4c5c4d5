//! Colored terminal output for the CLI.

use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::ipc::Event;
use crate::probe::PingResult;
use crate::supervisor::SupervisorEvent;

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Truncate a string to at most `max_chars` characters, adding an ellipsis
/// if truncated.
#[must_use]
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else if max_chars <= 3 {
        "...".to_string()
    } else {
        let kept: String = s.chars().take(max_chars - 3).collect();
        format!("{kept}...")
    }
}

/// Print the result of a one-shot status query.
pub fn print_ping(address: &str, result: &PingResult) {
    let label = if result.is_online() {
        "[ONLINE]".green().bold().to_string()
    } else {
        "[OFFLINE]".red().bold().to_string()
    };
    println!(
        "{} {} {} {}/{} players, {} ms",
        timestamp().dimmed(),
        label,
        address.cyan(),
        result.online,
        result.max,
        result.latency.as_millis()
    );
    if !result.version.is_empty() {
        println!("  version: {}", result.version.dimmed());
    }
    if !result.motd.is_empty() {
        println!("  motd:    {}", truncate(&result.motd, 80));
    }
    let _ = io::stdout().flush();
}

/// Print buffered child output, oldest first.
pub fn print_logs(lines: &[String]) {
    if lines.is_empty() {
        println!("{}", "(no output recorded)".dimmed());
        return;
    }
    for line in lines {
        println!("{line}");
    }
    let _ = io::stdout().flush();
}

/// Print something the supervisor observed.
pub fn print_supervisor_event(event: &SupervisorEvent) {
    let ts = timestamp();
    match event {
        SupervisorEvent::Spawned { pid } => {
            println!("{} {} pid={}", ts.dimmed(), "[SPAWN]".blue().bold(), pid);
        }
        SupervisorEvent::Child(child_event) => {
            let tag = match child_event {
                Event::Ready => "[READY]".green().bold().to_string(),
                Event::Disconnected { .. } => "[LEFT]".yellow().bold().to_string(),
                Event::Reconnecting => "[RETRY]".yellow().to_string(),
                Event::ChatReceived { .. } => "[CHAT]".cyan().to_string(),
            };
            println!("{} {} {}", ts.dimmed(), tag, child_event);
        }
        SupervisorEvent::Output(line) => {
            println!("{} {}", ts.dimmed(), truncate(line, 200).dimmed());
        }
        SupervisorEvent::Exited { code } => {
            let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            println!("{} {} code={}", ts.dimmed(), "[EXIT]".red().bold(), code);
        }
    }
    let _ = io::stdout().flush();
}

/// Print a confirmation for an operator command.
pub fn print_ok(action: &str) {
    println!("{} {}", "[OK]".green().bold(), action);
    let _ = io::stdout().flush();
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), message.red());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_string() {
        assert_eq!(truncate("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_long_string() {
        assert_eq!(truncate("hello world", 8), "hello...");
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("§a§lWelcome", 6), "§a§...");
    }

    #[test]
    fn test_truncate_tiny_limit() {
        assert_eq!(truncate("hello", 2), "...");
    }
}
