//! Colored console output for scan reports and stored records.

use crate::parser::{locality, Locality};
use crate::types::{DomainRecord, ScanReport, Timestamp};
use chrono::DateTime;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

/// Console output handler with colors and formatting.
pub struct ConsoleOutput {
    verbose: bool,
    json_mode: bool,
    quiet: bool,
}

impl ConsoleOutput {
    /// Create a new console output handler.
    pub fn new(verbose: bool, json_mode: bool, quiet: bool) -> Self {
        Self { verbose, json_mode, quiet }
    }

    /// Print scan start message.
    pub fn print_scan_start(&self, target: &str) {
        if self.json_mode || self.quiet {
            return;
        }

        println!("{} Scanning: {}", "[*]".bright_blue(), target.bright_white());
    }

    /// Print scan progress (only in verbose mode).
    pub fn print_progress(&self, message: &str) {
        if self.json_mode || !self.verbose {
            return;
        }

        println!("{} {}", "[.]".dimmed(), message.dimmed());
    }

    /// Print info message.
    pub fn print_info(&self, message: &str) {
        if self.json_mode || self.quiet {
            return;
        }

        println!("{} {}", "[*]".bright_blue(), message);
    }

    /// Print a stored domain record.
    pub fn print_record(&self, domain: &str, record: &DomainRecord) {
        if self.json_mode {
            return;
        }

        println!();
        println!(
            "{} {} ({} files, {} inline, updated {})",
            "===".bright_cyan(),
            domain.bright_white().bold(),
            record.metadata.total_files,
            record.metadata.total_inlines,
            format_timestamp(record.metadata.last_updated).dimmed()
        );

        for file in &record.files {
            let tag = match locality(&file.domain, domain) {
                Locality::Local => "local".green(),
                Locality::External => "external".yellow(),
            };
            println!(
                "    |-- [{}] {} {}",
                tag,
                file.url,
                format!("({}, {})", file.source.as_str(), format_timestamp(file.discovered_at)).dimmed()
            );
        }

        for inline in &record.inlines {
            let signals = if inline.suspicious_signals.is_empty() {
                "-".dimmed()
            } else {
                inline
                    .suspicious_signals
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
                    .red()
                    .bold()
            };
            println!(
                "    |-- inline #{} ({} chars) signals: {}",
                inline.hash, inline.length, signals
            );
            println!("    |     {}", inline.snippet.replace('\n', " ").dimmed());
        }

        if let Some(csp) = &record.csp {
            println!("    |-- CSP: {}", csp);
        }
        for sri in &record.sri {
            println!("    |-- SRI: {} {}", sri.algorithm.bright_white(), sri.url.dimmed());
        }
        println!("    +-- end");
    }

    /// Print scan summary.
    pub fn print_summary(&self, report: &ScanReport) {
        if self.json_mode {
            return;
        }

        if self.quiet {
            println!(
                "{} {} -> {} urls, {} inline, {} write(s)",
                "[*]".bright_blue(),
                report.target,
                report.urls_discovered,
                report.inlines_discovered,
                report.writes
            );
            return;
        }

        println!();
        println!("{}", "=== Scan Summary ===".bright_cyan());
        println!("  Target:    {}", report.target);
        println!("  Domain:    {}", report.domain.as_deref().unwrap_or("-"));
        println!("  Duration:  {:.2}s", report.duration_secs);
        println!("  Scripts:   {}", report.urls_discovered);
        println!("  Inline:    {}", report.inlines_discovered);
        println!("  Writes:    {}", report.writes);

        if report.failed_writes > 0 {
            println!("  {}", format!("FAILED WRITES: {}", report.failed_writes).red().bold());
        }

        if let (Some(domain), Some(record), true) = (&report.domain, &report.record, self.verbose) {
            self.print_record(domain, record);
        }

        if !report.errors.is_empty() {
            println!();
            println!("{}", "Errors encountered:".yellow());
            for error in &report.errors {
                println!("  - {}", error.dimmed());
            }
        }

        println!();
    }

    /// Create a progress bar.
    pub fn create_progress_bar(&self, total: u64, message: &str) -> Option<ProgressBar> {
        if self.json_mode {
            return None;
        }

        let pb = ProgressBar::new(total);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(message.to_string());
        Some(pb)
    }
}

/// Render epoch milliseconds as UTC.
fn format_timestamp(millis: Timestamp) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        Self::new(false, false, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_output_creation() {
        let output = ConsoleOutput::new(true, false, false);
        assert!(output.verbose);
        assert!(!output.json_mode);
        assert!(output.create_progress_bar(3, "pages").is_some());
        assert!(ConsoleOutput::new(false, true, false).create_progress_bar(3, "pages").is_none());
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_timestamp(1_700_000_000_000), "2023-11-14 22:13:20 UTC");
        assert_eq!(format_timestamp(i64::MAX), i64::MAX.to_string());
    }
}
