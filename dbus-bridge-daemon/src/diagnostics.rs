//! Diagnostics and Debug Logging
//!
//! Command-line interface, logging setup and the diagnostic commands used
//! to inspect the bus without starting the bridge.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dbus_bridge_core::{Access, ArgumentDescriptor, InterfaceModel};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// D-Bus bridge daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "dbus-bridge-daemon")]
#[command(
    about = "Expose D-Bus objects over a JSON management session on stdin/stdout",
    long_about = None
)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs (`--timestamps false` to hide them)
    #[arg(long, value_name = "BOOL", action = clap::ArgAction::Set, default_value_t = true)]
    pub timestamps: bool,

    /// Configuration file (defaults to <config_dir>/dbus-bridge/bridge.toml)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Attach to the session bus regardless of the configuration file
    #[arg(long)]
    pub session_bus: bool,

    /// Diagnostic subcommand
    #[command(subcommand)]
    pub command: Option<DiagnosticCommand>,
}

/// Diagnostic commands for troubleshooting
#[derive(Subcommand, Debug)]
pub enum DiagnosticCommand {
    /// Show daemon version and build information
    Version {
        /// Show detailed build information
        #[arg(long)]
        verbose: bool,
    },

    /// Show current configuration
    DumpConfig,

    /// Print the interfaces, methods and signals of one object
    Introspect {
        /// Bus name, e.g. org.freedesktop.NetworkManager
        bus_name: String,

        /// Object path, e.g. /org/freedesktop/NetworkManager
        object_path: String,
    },

    /// List the interfaces implemented by one object
    ListInterfaces {
        bus_name: String,
        object_path: String,
    },
}

/// Initialize logging based on CLI configuration
///
/// Output always goes to stderr, stdout carries management packets.
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

/// Human-readable listing of one interface
pub fn describe_interface(interface: &InterfaceModel) -> Vec<String> {
    let mut lines = vec![format!("interface {}", interface.name)];

    for method in &interface.methods {
        let inputs = format_args_list(method.in_args());
        let outputs: Vec<&ArgumentDescriptor> = method.out_args().collect();
        if outputs.is_empty() {
            lines.push(format!("  method {}({})", method.name, inputs));
        } else {
            lines.push(format!(
                "  method {}({}) -> ({})",
                method.name,
                inputs,
                format_args_list(outputs.into_iter())
            ));
        }
    }

    for signal in &interface.signals {
        lines.push(format!(
            "  signal {}({})",
            signal.name,
            format_args_list(signal.args.iter())
        ));
    }

    for property in &interface.properties {
        let access = match property.access {
            Access::ReadOnly => "read",
            Access::ReadWrite => "readwrite",
        };
        lines.push(format!(
            "  property {} {} [{}]",
            property.signature, property.name, access
        ));
    }

    lines
}

fn format_args_list<'a>(args: impl Iterator<Item = &'a ArgumentDescriptor>) -> String {
    args.map(|arg| format!("{} {}", arg.signature, arg.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build information for diagnostics
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: Option<&'static str>,
}

impl BuildInfo {
    pub fn get() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: option_env!("GIT_HASH"),
        }
    }

    pub fn display(&self, verbose: bool) {
        println!("D-Bus Bridge Daemon v{}", self.version);

        if verbose {
            if let Some(hash) = self.git_hash {
                println!("Git commit: {}", hash);
            }
            println!("Platform: {}", std::env::consts::OS);
            println!("Architecture: {}", std::env::consts::ARCH);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbus_bridge_core::IntrospectionNode;

    const XML: &str = r#"<node>
      <interface name="com.example.Calc">
        <method name="Add">
          <arg name="a" type="i" direction="in"/>
          <arg name="b" type="i" direction="in"/>
          <arg name="sum" type="i" direction="out"/>
        </method>
        <method name="Reset"/>
        <signal name="Overflow">
          <arg name="value" type="x"/>
        </signal>
        <property name="Count" type="u" access="read"/>
      </interface>
    </node>"#;

    #[test]
    fn test_describe_interface() {
        let node = IntrospectionNode::parse(XML).unwrap();
        let lines = describe_interface(&node.interfaces[0]);

        assert_eq!(
            lines,
            vec![
                "interface com.example.Calc",
                "  method Add(i a, i b) -> (i sum)",
                "  method Reset()",
                "  signal Overflow(x value)",
                "  property u Count [read]",
            ]
        );
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "dbus-bridge-daemon",
            "--session-bus",
            "--config",
            "/tmp/bridge.toml",
            "list-interfaces",
            "org.freedesktop.DBus",
            "/org/freedesktop/DBus",
        ]);

        assert!(cli.session_bus);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/bridge.toml")));
        match cli.command {
            Some(DiagnosticCommand::ListInterfaces {
                bus_name,
                object_path,
            }) => {
                assert_eq!(bus_name, "org.freedesktop.DBus");
                assert_eq!(object_path, "/org/freedesktop/DBus");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["dbus-bridge-daemon"]);
        assert_eq!(cli.log_level, "info");
        assert!(cli.timestamps);
        assert!(!cli.json_logs);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_timestamps_disabled() {
        let cli = Cli::parse_from(["dbus-bridge-daemon", "--timestamps", "false"]);
        assert!(!cli.timestamps);

        let cli = Cli::parse_from(["dbus-bridge-daemon", "--timestamps=true", "--json-logs"]);
        assert!(cli.timestamps);
        assert!(cli.json_logs);
    }
}
