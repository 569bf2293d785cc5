// Output formatting and display for CLI

use crate::daemon::DaemonStatus;
use crate::ipc::{ResponseData, StartFailure};
use crate::logs::LogEntry;
use crate::process::{LifecycleState, ProcessHandle};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

pub fn print_success(data: &ResponseData) {
    match data {
        ResponseData::Started {
            handles,
            skipped,
            failed,
        } => {
            if !handles.is_empty() {
                println!("{}", "✓ Applications started".green().bold());
                print_process_table(handles);
            }
            for name in skipped {
                print_info(&format!("{} is already running, skipped", name.cyan()));
            }
            print_failures(failed);
        }

        ResponseData::Stopped(handles) => {
            print_action("stopped", handles);
        }

        ResponseData::Restarted(handles) => {
            print_action("restarted", handles);
        }

        ResponseData::Reloaded(handles) => {
            print_action("reloaded", handles);
        }

        ResponseData::Status(handles) => {
            if handles.is_empty() {
                println!("{}", "No applications are registered".yellow());
            } else {
                print_process_table(handles);
            }
        }

        ResponseData::Logs { path, lines } => {
            print_logs(path, lines);
        }

        ResponseData::Deleted { name } => {
            println!(
                "{}",
                format!("✓ Application {} deleted", name).green().bold()
            );
        }

        ResponseData::DaemonStatus { pid, uptime, apps } => {
            println!("{}", "✓ Daemon is running".green().bold());
            println!("  {:<14} {}", "PID:".bold(), pid);
            println!("  {:<14} {}", "Uptime:".bold(), format_duration(uptime));
            println!("  {:<14} {}", "Applications:".bold(), apps);
        }

        ResponseData::Success(message) => {
            println!("{} {}", "✓".green().bold(), message);
        }
    }
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

pub fn print_daemon_stopped(status: &DaemonStatus) {
    println!("{}", "✗ Daemon is not running".red().bold());
    println!("  {:<14} {}", "PID file:".bold(), status.pid_file.display());
}

pub fn print_daemon_unreachable(status: &DaemonStatus) {
    let pid = status.pid.map(|p| p.to_string()).unwrap_or_default();
    println!(
        "{}",
        format!("⚠ Daemon process {} is alive but not answering", pid)
            .yellow()
            .bold()
    );
    println!("  {:<14} {}", "Socket:".bold(), status.socket_path.display());
}

fn print_action(verb: &str, handles: &[ProcessHandle]) {
    let app = handles.first().map(|h| h.app.as_str()).unwrap_or_default();
    println!(
        "{}",
        format!("✓ Application {} {}", app, verb).green().bold()
    );
    print_process_table(handles);
}

fn print_failures(failed: &[StartFailure]) {
    for failure in failed {
        eprintln!(
            "{} {}: {}",
            "✗".red().bold(),
            failure.name.cyan(),
            failure.error
        );
    }
}

fn print_process_table(handles: &[ProcessHandle]) {
    #[derive(Tabled)]
    struct InstanceRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "App")]
        app: String,
        #[tabled(rename = "#")]
        instance: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
    }

    let rows: Vec<InstanceRow> = handles
        .iter()
        .map(|h| InstanceRow {
            id: h.id.to_string(),
            app: truncate(&h.app, 20),
            instance: h.instance.to_string(),
            state: format_state_colored(h.state),
            pid: h
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            memory: format_memory(h.memory),
            uptime: format_duration(&h.uptime()),
            restarts: h.restarts.to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);

    for handle in handles.iter().filter(|h| !h.state.is_active()) {
        if let Some(error) = &handle.last_error {
            println!(
                "  {} {}[{}]: {}",
                "!".red().bold(),
                handle.app,
                handle.instance,
                error.dimmed()
            );
        }
    }
}

fn print_logs(path: &Path, lines: &[String]) {
    println!("{}", path.display().to_string().dimmed());

    if lines.is_empty() {
        println!("{}", "No logs available".yellow());
        return;
    }

    for line in lines {
        let entry = LogEntry::parse(line);
        match entry.timestamp {
            Some(stamp) => println!("{} {}", format!("[{}]", stamp).dimmed(), entry.message),
            None => println!("{}", entry.message),
        }
    }
}

fn format_state_colored(state: LifecycleState) -> String {
    match state {
        LifecycleState::Running => state.to_string().green().to_string(),
        LifecycleState::Starting | LifecycleState::Stopping => {
            state.to_string().yellow().to_string()
        }
        LifecycleState::Stopped => state.to_string().bright_black().to_string(),
        LifecycleState::Crashed => state.to_string().red().bold().to_string(),
    }
}

fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        0 => "-".to_string(),
        b if b < KB => format!("{}B", b),
        b if b < MB => format!("{:.1}KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.1}MB", b as f64 / MB as f64),
        b => format!("{:.2}GB", b as f64 / GB as f64),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

pub fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub fn finish_progress_success(pb: ProgressBar, message: &str) {
    pb.finish_with_message(format!("{} {}", "✓".green(), message));
}

pub fn finish_progress_error(pb: ProgressBar, message: &str) {
    pb.finish_with_message(format!("{} {}", "✗".red(), message));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(&Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(&Duration::from_secs(3700)), "1h 1m");
        assert_eq!(format_duration(&Duration::from_secs(90000)), "1d 1h");
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(0), "-");
        assert_eq!(format_memory(512), "512B");
        assert_eq!(format_memory(2048), "2.0KB");
        assert_eq!(format_memory(2 * 1024 * 1024), "2.0MB");
        assert_eq!(format_memory(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-application", 10), "a-very-...");
    }
}
