//! # Command-Line Interface Module
//!
//! Argument parsing for the `cyphal-cli` binary, built with `clap`'s derive
//! API. Every subcommand builds its transport and node identity from the
//! same [`crate::register::RegisterStore`] bootstrap that library users go
//! through.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, Subcommand,
};
use std::time::Duration;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// cyphal-cli — exercises the presentation and transport layers against the
/// loopback reference transport.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Write detailed logs to this file instead of stderr. Pass "stderr" to
    /// force stderr even when a default log file would otherwise be used.
    #[arg(long, global = true, help_heading = "Output and Logging")]
    pub log_file: Option<String>,

    /// Silence user-facing informational output on stdout; diagnostic logs
    /// on stderr/the log file are unaffected.
    #[arg(short = 'q', long, global = true, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity.
    ///
    ///  -v: debug
    ///  -vv and more: trace
    ///
    /// By default, only INFO and above is shown.
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Construct a node from the current registers, publish one scalar
    /// message, and exit.
    Publish {
        /// Subject-ID to publish on.
        subject_id: u16,
        /// The scalar value to publish.
        value: f32,
        /// How long to wait for the send to complete.
        #[arg(long, value_parser = parse_duration, default_value = "1s")]
        timeout: Duration,
    },

    /// Construct a node and print received scalar messages until an
    /// iteration or duration bound is hit (or forever, if neither is set).
    Subscribe {
        /// Subject-ID to subscribe to.
        subject_id: u16,
        /// Stop after receiving this many messages.
        #[arg(long)]
        count: Option<usize>,
        /// Stop after this long.
        #[arg(long, value_parser = parse_duration)]
        duration: Option<Duration>,
    },

    /// Construct a node, issue one `GetInfo`-shaped RPC call, and print the
    /// response.
    Call {
        /// Node-ID of the server to call.
        server_node_id: u16,
        /// Service-ID to call.
        service_id: u16,
        /// How long to wait for a response.
        #[arg(long, value_parser = parse_duration, default_value = "1s")]
        timeout: Duration,
    },

    /// Run plug-and-play node-ID allocation against the loopback transport
    /// and print the allocated node-ID.
    PickNodeId,

    /// Print the protocol parameters and statistics of the transport built
    /// from the current registers.
    ShowTransport,

    /// DSDL package generation is out of scope for this crate; the DSDL
    /// compiler is an external collaborator.
    DsdlGeneratePackages,
}

/// Parse duration from string (e.g., "10s", "5m", "1h").
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str.parse().map_err(|_| format!("Invalid number in duration: {num_str}"))?;
    if num < 0.0 {
        return Err("Duration cannot be negative".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("Invalid duration unit: {unit}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-5s").is_err());
    }
}
