//! Output formatting shared by list/inspect commands.

use clap::ValueEnum;
use serde::Serialize;
use vmctl::{Error, Machine, ServiceDestination};

/// Output format.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// JSON.
    Json,
    /// YAML.
    Yaml,
}

/// Print `value` as JSON or YAML. Returns false for [`OutputFormat::Table`],
/// which the caller renders itself.
pub fn print_structured<T: Serialize + ?Sized>(
    value: &T,
    format: OutputFormat,
) -> vmctl::Result<bool> {
    let text = match format {
        OutputFormat::Table => return Ok(false),
        OutputFormat::Json => serde_json::to_string_pretty(value)
            .map_err(|e| Error::Storage(format!("failed to encode output: {}", e)))?,
        OutputFormat::Yaml => serde_yaml::to_string(value)
            .map_err(|e| Error::Storage(format!("failed to encode output: {}", e)))?,
    };
    println!("{}", text.trim_end());
    Ok(true)
}

/// Print machines as a table.
pub fn print_machine_table(machines: &[Machine]) {
    println!(
        "{:<20} {:<10} {:<6} {:<10} {:<8} {:<8} {:<8}",
        "NAME", "STATE", "CPUS", "MEMORY", "DISK", "PORT", "PID"
    );
    println!("{}", "-".repeat(76));

    for m in machines {
        let pid_display = m
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<10} {:<6} {:<10} {:<8} {:<8} {:<8}",
            truncate(&m.name, 18),
            m.state,
            m.resources.cpus,
            format!("{} MiB", m.resources.memory_mib),
            format!("{} GiB", m.resources.disk_size_gb),
            m.ssh.port,
            pid_display,
        );
    }
}

/// Render connections as table lines, header first.
pub fn connection_table(destinations: &[ServiceDestination]) -> Vec<String> {
    let row = |name: &str, uri: &str, identity: &str, default: &str| {
        format!("{:<20} {:<50} {:<40} {}", name, uri, identity, default)
    };

    let mut lines = vec![row("NAME", "URI", "IDENTITY", "DEFAULT")];
    for d in destinations {
        lines.push(row(
            &truncate(&d.name, 18),
            &d.uri,
            &d.identity,
            if d.default { "true" } else { "false" },
        ));
    }
    lines
}

/// Print one machine as `key: value` lines.
pub fn print_machine_details(m: &Machine) {
    println!("Name:      {}", m.name);
    println!("State:     {}", m.state);
    println!("CPUs:      {}", m.resources.cpus);
    println!("Memory:    {} MiB", m.resources.memory_mib);
    println!("Disk:      {} GiB ({})", m.resources.disk_size_gb, m.disk_path.display());
    println!("SSH:       {}@localhost:{}", m.ssh.user, m.ssh.port);
    println!("Identity:  {}", m.ssh.identity_path.display());
    if let Some(pid) = m.pid {
        println!("PID:       {}", pid);
    }
    println!("Created:   {}", m.created_at);
    if let Some(last_up) = &m.last_up {
        println!("Last up:   {}", last_up);
    }
}

/// Truncate a string to max length, adding "..." if needed.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
