//! Environment metadata for crash records.
//!
//! The record builder asks a [`MetadataSource`] for one [`Section`] at a time.
//! A failing section is replaced by a placeholder line; it never aborts the
//! record. [`SystemMetadata`] is the default probe: `/proc` on Linux,
//! `std::env`, and `fs2` disk statistics.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;

/// Record sections, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    CrashTime,
    Device,
    Application,
    Display,
    Runtime,
    Processor,
    Memory,
    Storage,
    StackTrace,
}

impl Section {
    /// Sections filled in by a [`MetadataSource`], in output order.
    pub const COLLECTED: [Self; 7] = [
        Self::Device,
        Self::Application,
        Self::Display,
        Self::Runtime,
        Self::Processor,
        Self::Memory,
        Self::Storage,
    ];

    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::CrashTime => "Crash Time",
            Self::Device => "Device Information",
            Self::Application => "Application Information",
            Self::Display => "Display Information",
            Self::Runtime => "Runtime Information",
            Self::Processor => "Processor Information",
            Self::Memory => "Memory Information",
            Self::Storage => "Storage Information",
            Self::StackTrace => "Stack Trace",
        }
    }

    /// Short label used in `"<label> Unavailable (<reason>)"` placeholders.
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::CrashTime => "Crash Time",
            Self::Device => "Device Info",
            Self::Application => "Application Info",
            Self::Display => "Display Info",
            Self::Runtime => "Runtime Info",
            Self::Processor => "Processor Info",
            Self::Memory => "Memory Info",
            Self::Storage => "Storage Info",
            Self::StackTrace => "Stack Trace",
        }
    }

    #[must_use]
    pub fn placeholder(self, reason: &str) -> String {
        format!("{} Unavailable ({reason})", self.short_name())
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// One `Key: value` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub key: String,
    pub value: String,
}

impl Field {
    pub fn new(key: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            key: key.into(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("{0}")]
    Unavailable(String),

    #[error("not supported on this platform")]
    Unsupported,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Supplies environment details for one record section.
pub trait MetadataSource: Send + Sync {
    fn collect(&self, section: Section) -> Result<Vec<Field>, MetadataError>;
}

/// Default metadata probe for the running process.
#[derive(Debug, Clone)]
pub struct SystemMetadata {
    app_name: String,
    app_version: String,
    storage_path: PathBuf,
    started_at: Instant,
}

impl SystemMetadata {
    /// `storage_path` is the volume probed for the storage section,
    /// normally the record directory.
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        storage_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            storage_path: storage_path.into(),
            started_at: Instant::now(),
        }
    }

    fn device(&self) -> Vec<Field> {
        let mut fields = vec![
            Field::new("OS", std::env::consts::OS),
            Field::new("Family", std::env::consts::FAMILY),
            Field::new("Architecture", std::env::consts::ARCH),
        ];
        if let Some(host) = hostname() {
            fields.push(Field::new("Hostname", host));
        }
        if let Some(kernel) = read_trimmed("/proc/sys/kernel/osrelease") {
            fields.push(Field::new("Kernel", kernel));
        }
        if let Some(distro) = std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|text| os_release_name(&text))
        {
            fields.push(Field::new("Distribution", distro));
        }
        fields
    }

    fn application(&self) -> Vec<Field> {
        let mut fields = vec![
            Field::new("Name", &self.app_name),
            Field::new("Version", &self.app_version),
            Field::new("Process ID", std::process::id()),
        ];
        if let Ok(exe) = std::env::current_exe() {
            fields.push(Field::new("Executable", exe.display()));
        }
        if let Ok(cwd) = std::env::current_dir() {
            fields.push(Field::new("Working Directory", cwd.display()));
        }
        fields.push(Field::new(
            "Agent Uptime",
            format_duration(self.started_at.elapsed().as_secs()),
        ));
        fields
    }

    fn display(&self) -> Result<Vec<Field>, MetadataError> {
        let mut fields = Vec::new();
        for var in ["WAYLAND_DISPLAY", "DISPLAY"] {
            if let Ok(value) = std::env::var(var) {
                fields.push(Field::new(var, value));
            }
        }
        if let Ok(term) = std::env::var("TERM") {
            fields.push(Field::new("Terminal", term));
        }
        if fields.is_empty() {
            return Err(MetadataError::Unavailable("no display or terminal".to_string()));
        }
        Ok(fields)
    }

    fn runtime(&self) -> Result<Vec<Field>, MetadataError> {
        let mut fields = Vec::new();
        if let Ok(n) = std::thread::available_parallelism() {
            fields.push(Field::new("Available Processors", n));
        }
        if let Ok(bt) = std::env::var("RUST_BACKTRACE") {
            fields.push(Field::new("RUST_BACKTRACE", bt));
        }
        fields.extend(parse_proc_status(&read_proc("/proc/self/status")?));
        Ok(fields)
    }

    fn processor(&self) -> Result<Vec<Field>, MetadataError> {
        let mut fields = summarize_cpuinfo(&read_proc("/proc/cpuinfo")?);
        if let Some(uptime) = read_trimmed("/proc/uptime")
            .and_then(|text| text.split_whitespace().next().map(str::to_string))
            .and_then(|secs| secs.parse::<f64>().ok())
        {
            fields.push(Field::new("System Uptime", format_duration(uptime as u64)));
        }
        if let Some(load) = read_trimmed("/proc/loadavg") {
            let avg: Vec<&str> = load.split_whitespace().take(3).collect();
            fields.push(Field::new("Load Average", avg.join(" ")));
        }
        Ok(fields)
    }

    fn memory(&self) -> Result<Vec<Field>, MetadataError> {
        let fields = parse_meminfo(&read_proc("/proc/meminfo")?);
        if fields.is_empty() {
            return Err(MetadataError::Unavailable("empty /proc/meminfo".to_string()));
        }
        Ok(fields)
    }

    fn storage(&self) -> Result<Vec<Field>, MetadataError> {
        let probe = existing_ancestor(&self.storage_path).ok_or_else(|| {
            MetadataError::Unavailable(format!("{} does not exist", self.storage_path.display()))
        })?;
        let total = fs2::total_space(probe)?;
        let available = fs2::available_space(probe)?;
        Ok(vec![
            Field::new("Volume", probe.display()),
            Field::new("Total", format_size(total)),
            Field::new("Available", format_size(available)),
        ])
    }
}

impl MetadataSource for SystemMetadata {
    fn collect(&self, section: Section) -> Result<Vec<Field>, MetadataError> {
        match section {
            Section::Device => Ok(self.device()),
            Section::Application => Ok(self.application()),
            Section::Display => self.display(),
            Section::Runtime => self.runtime(),
            Section::Processor => self.processor(),
            Section::Memory => self.memory(),
            Section::Storage => self.storage(),
            Section::CrashTime | Section::StackTrace => Err(MetadataError::Unsupported),
        }
    }
}

#[cfg(target_os = "linux")]
fn read_proc(path: &str) -> Result<String, MetadataError> {
    Ok(std::fs::read_to_string(path)?)
}

#[cfg(not(target_os = "linux"))]
fn read_proc(_path: &str) -> Result<String, MetadataError> {
    Err(MetadataError::Unsupported)
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn hostname() -> Option<String> {
    read_trimmed("/proc/sys/kernel/hostname")
        .or_else(|| read_trimmed("/etc/hostname"))
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
}

fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| !p.as_os_str().is_empty() && p.exists())
}

fn os_release_name(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim_matches('"').to_string())
}

/// Pick the interesting `/proc/meminfo` lines, rendered with [`format_size`].
pub fn parse_meminfo(text: &str) -> Vec<Field> {
    const KEYS: &[(&str, &str)] = &[
        ("MemTotal:", "Total Memory"),
        ("MemFree:", "Free Memory"),
        ("MemAvailable:", "Available Memory"),
        ("Buffers:", "Buffers"),
        ("Cached:", "Cached"),
        ("SwapTotal:", "Swap Total"),
        ("SwapFree:", "Swap Free"),
    ];
    let mut fields = Vec::new();
    for line in text.lines() {
        for (prefix, label) in KEYS {
            if let Some(rest) = line.strip_prefix(prefix) {
                if let Some(kb) = parse_kb(rest) {
                    fields.push(Field::new(*label, format_size(kb * 1024)));
                }
            }
        }
    }
    fields
}

/// `VmRSS`, `VmHWM` and `Threads` from `/proc/self/status`.
pub fn parse_proc_status(text: &str) -> Vec<Field> {
    let mut fields = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            if let Some(kb) = parse_kb(rest) {
                fields.push(Field::new("Resident Memory", format_size(kb * 1024)));
            }
        } else if let Some(rest) = line.strip_prefix("VmHWM:") {
            if let Some(kb) = parse_kb(rest) {
                fields.push(Field::new("Peak Resident Memory", format_size(kb * 1024)));
            }
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            fields.push(Field::new("Threads", rest.trim()));
        }
    }
    fields
}

/// Summarize `/proc/cpuinfo` instead of copying it: model, vendor and the
/// logical processor count.
pub fn summarize_cpuinfo(text: &str) -> Vec<Field> {
    let mut model = None;
    let mut vendor = None;
    let mut hardware = None;
    let mut count = 0_usize;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "processor" => count += 1,
            "model name" | "Model" | "cpu model" if model.is_none() => {
                model = Some(value.to_string());
            }
            "vendor_id" | "CPU implementer" if vendor.is_none() => {
                vendor = Some(value.to_string());
            }
            "Hardware" if hardware.is_none() => hardware = Some(value.to_string()),
            _ => {}
        }
    }
    let mut fields = Vec::new();
    if let Some(model) = model {
        fields.push(Field::new("Model", model));
    }
    if let Some(vendor) = vendor {
        fields.push(Field::new("Vendor", vendor));
    }
    if let Some(hardware) = hardware {
        fields.push(Field::new("Hardware", hardware));
    }
    fields.push(Field::new("Logical Processors", count));
    fields
}

fn parse_kb(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}

/// Human-readable byte count with one decimal, e.g. `1.5 GB`.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// `<d> days, HH:MM:SS`
#[must_use]
pub fn format_duration(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{days} days, {hours:02}:{minutes:02}:{seconds:02}")
}
