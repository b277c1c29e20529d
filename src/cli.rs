//! # Command-Line Interface Module
//!
//! Argument parsing and configuration for the fabric binary. One
//! executable plays every role: it runs as the initiator by default,
//! re-enters itself in worker mode when spawned as a child, and offers a
//! one-shot sender for smoke checks. The `clap` derive API keeps the
//! surface typed and the help text grouped by concern.
//!
//! ## Usage examples
//!
//! ```bash
//! # Supervise two worker nodes against a shared registry root
//! ipc-fabric --connect file:///tmp/fabric --workers 2
//!
//! # Join the fabric as a stand-alone node endpoint
//! ipc-fabric --mode work --application demo.receiver --connect file:///tmp/fabric
//!
//! # Fire one parcel at a named application
//! ipc-fabric --mode send --to demo.receiver --connect file:///tmp/fabric
//! ```

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};
use std::path::PathBuf;
use std::time::Duration;

use crate::defaults;
use crate::proactor::SupervisorOptions;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Role this process plays in the fabric
    #[arg(long, value_enum, default_value_t = FabricMode::Initiate, help_heading = "Core Options")]
    pub mode: FabricMode,

    /// Registry root as a file:// URL, shared by every endpoint on the host
    #[arg(long, default_value = "file:///tmp/ipc-fabric", help_heading = "Core Options")]
    pub connect: String,

    /// Service name identifying this instance of the network
    #[arg(long, default_value = "demo", help_heading = "Core Options")]
    pub service: String,

    /// Application name of this endpoint
    ///
    /// Defaults per mode: the initiator, a worker and the sender each
    /// take a distinct endpoint name so their registry flows stay apart.
    #[arg(long, help_heading = "Core Options")]
    pub application: Option<String>,

    /// Destination application for the send mode
    #[arg(long, help_heading = "Core Options")]
    pub to: Option<String>,

    /// Worker guid, normally assigned by the initiator
    #[arg(long, help_heading = "Worker Options")]
    pub guid: Option<String>,

    /// Listen port, normally assigned by the initiator
    #[arg(long, help_heading = "Worker Options")]
    pub port: Option<u16>,

    /// Configuration file; standard input when absent
    #[arg(long, help_heading = "Worker Options")]
    pub config: Option<PathBuf>,

    /// Number of worker nodes the initiator raises at startup
    #[arg(long, default_value_t = 1, help_heading = "Supervision")]
    pub workers: usize,

    /// Address the initiator listens on and hands to children
    #[arg(long, default_value = "127.0.0.1", help_heading = "Supervision")]
    pub listen_addr: String,

    /// Port of the initiator's management surface
    #[arg(long, default_value_t = defaults::PARENT_PORT, help_heading = "Supervision")]
    pub listen_port: u16,

    /// Lowest port a child may be assigned
    #[arg(long, default_value_t = defaults::CHILD_PORT_MIN, help_heading = "Supervision")]
    pub child_port_min: u16,

    /// Highest port a child may be assigned
    #[arg(long, default_value_t = defaults::CHILD_PORT_MAX, help_heading = "Supervision")]
    pub child_port_max: u16,

    /// Opaque bearer token forwarded to children for config refresh
    #[arg(long, help_heading = "Supervision")]
    pub token: Option<String>,

    /// Log file path; a rolling file in the working directory when
    /// absent, or the literal value "stderr"
    #[arg(long, help_heading = "Output and Logging")]
    pub log: Option<String>,

    /// Silence all user-facing informational output on stdout
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: debug
    ///  -vv and more: trace
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

/// The roles one fabric process can play.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FabricMode {
    /// Supervise worker processes and run the job queue
    #[value(name = "initiate")]
    Initiate,

    /// Host one node endpoint, configured over standard input
    #[value(name = "work")]
    Work,

    /// Fire one parcel at a named application and exit
    #[value(name = "send")]
    Send,
}

impl std::fmt::Display for FabricMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FabricMode::Initiate => write!(f, "initiate"),
            FabricMode::Work => write!(f, "work"),
            FabricMode::Send => write!(f, "send"),
        }
    }
}

/// The internal configuration the run modes consume.
#[derive(Debug, Clone)]
pub struct FabricConfiguration {
    pub mode: FabricMode,
    pub connect: String,
    pub service: String,
    pub application: String,
    pub to: Option<String>,
    pub guid: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub workers: usize,
    pub listen_addr: String,
    pub listen_port: u16,
    pub child_port_min: u16,
    pub child_port_max: u16,
    pub token: Option<String>,
}

impl FabricConfiguration {
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        if args.child_port_min > args.child_port_max {
            anyhow::bail!(
                "child port range is empty: [{}, {}]",
                args.child_port_min,
                args.child_port_max
            );
        }
        if args.mode == FabricMode::Send && args.to.is_none() {
            anyhow::bail!("send mode needs a --to application");
        }

        let application = args.application.clone().unwrap_or_else(|| match args.mode {
            FabricMode::Initiate => "demo.initiator".to_string(),
            FabricMode::Send => "demo.sender".to_string(),
            FabricMode::Work => match args.guid.as_deref() {
                Some(guid) => format!("demo.worker.{}", guid),
                None => "demo.worker".to_string(),
            },
        });

        Ok(Self {
            mode: args.mode,
            connect: args.connect.clone(),
            service: args.service.clone(),
            application,
            to: args.to.clone(),
            guid: args.guid.clone(),
            port: args.port,
            config: args.config.clone(),
            workers: args.workers,
            listen_addr: args.listen_addr.clone(),
            listen_port: args.listen_port,
            child_port_min: args.child_port_min,
            child_port_max: args.child_port_max,
            token: args.token.clone(),
        })
    }

    /// The supervision options this configuration implies.
    pub fn supervisor_options(&self) -> Result<SupervisorOptions, crate::proactor::SpawnError> {
        let mut options = SupervisorOptions::new(&self.connect)?;
        options.listen_addr = self.listen_addr.clone();
        options.listen_port = self.listen_port;
        options.child_port_min = self.child_port_min;
        options.child_port_max = self.child_port_max;
        options.config_timeout = Duration::from_secs(defaults::CONFIG_TIMEOUT_SEC);
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(mode: FabricMode) -> Args {
        Args {
            mode,
            connect: "file:///tmp/fabric".to_string(),
            service: "demo".to_string(),
            application: None,
            to: Some("demo.receiver".to_string()),
            guid: None,
            port: None,
            config: None,
            workers: 1,
            listen_addr: "127.0.0.1".to_string(),
            listen_port: defaults::PARENT_PORT,
            child_port_min: defaults::CHILD_PORT_MIN,
            child_port_max: defaults::CHILD_PORT_MAX,
            token: None,
            log: None,
            quiet: false,
            verbose: 0,
        }
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(FabricMode::Initiate.to_string(), "initiate");
        assert_eq!(FabricMode::Work.to_string(), "work");
        assert_eq!(FabricMode::Send.to_string(), "send");
    }

    #[test]
    fn test_application_defaults_per_mode() {
        let config = FabricConfiguration::from_args(&args(FabricMode::Initiate)).unwrap();
        assert_eq!(config.application, "demo.initiator");

        let mut worker = args(FabricMode::Work);
        worker.guid = Some("deadbeef".to_string());
        let config = FabricConfiguration::from_args(&worker).unwrap();
        assert_eq!(config.application, "demo.worker.deadbeef");
    }

    #[test]
    fn test_empty_child_port_range_is_rejected() {
        let mut bad = args(FabricMode::Initiate);
        bad.child_port_min = 60001;
        bad.child_port_max = 60000;
        assert!(FabricConfiguration::from_args(&bad).is_err());
    }

    #[test]
    fn test_send_mode_needs_destination() {
        let mut bad = args(FabricMode::Send);
        bad.to = None;
        assert!(FabricConfiguration::from_args(&bad).is_err());
    }
}
