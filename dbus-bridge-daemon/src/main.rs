mod config;
mod diagnostics;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use config::{BusKind, Config};
use dbus_bridge_core::{
    BridgeDispatcher, BusConnection, ObjectKey, Packet, RemoteObject, ZbusConnection,
};
use diagnostics::{BuildInfo, Cli, DiagnosticCommand};
use session::StdioSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

/// Time allowed for queued packets to reach stdout on shutdown
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Open the configured bus with the configured call timeout
async fn connect(kind: BusKind, timeout: Duration) -> Result<ZbusConnection> {
    let connection = match kind {
        BusKind::System => ZbusConnection::system().await,
        BusKind::Session => ZbusConnection::session().await,
    }
    .with_context(|| format!("Failed to connect to the {:?} bus", kind))?;

    Ok(connection.with_timeout(timeout))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&path).context("Failed to load configuration")?;
    if cli.session_bus {
        config.bus = BusKind::Session;
    }
    Ok(config)
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Answer one inbound line, `None` when there is nobody to answer
async fn handle_line(dispatcher: &BridgeDispatcher, line: &str) -> Option<Packet> {
    let packet = match Packet::from_bytes(line.as_bytes()) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Dropping malformed management packet: {}", e);
            return None;
        }
    };

    let request = match packet.method_request() {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting packet {}: {}", packet.id, e);
            return Some(Packet::method_exception(packet.id, &e));
        }
    };

    let reply = dispatcher
        .handle(request)
        .await
        .and_then(|arguments| Packet::method_response(packet.id, &arguments));

    Some(match reply {
        Ok(response) => response,
        Err(e) => {
            debug!("Request {} failed: {}", packet.id, e);
            Packet::method_exception(packet.id, &e)
        }
    })
}

/// Sequential request loop, returns when input closes or Ctrl+C arrives
async fn serve<R>(dispatcher: &BridgeDispatcher, session: &StdioSession, input: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read management input")?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                info!("Received shutdown signal");
                return Ok(());
            }
        };

        let Some(line) = line else {
            info!("Management input closed");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        if let Some(reply) = handle_line(dispatcher, &line).await {
            session
                .send(reply)
                .context("Management output closed")?;
        }
    }
}

/// Run the bridge until stdin closes
async fn run_bridge(config: Config) -> Result<()> {
    let connection = connect(config.bus, config.call_timeout()).await?;
    info!("Connected to the {:?} bus", config.bus);

    let (session, writer) = StdioSession::spawn(tokio::io::stdout());
    let dispatcher = BridgeDispatcher::new(
        Arc::new(connection),
        Arc::new(session.clone()),
        config.bridge_options(),
    );

    let uuid = uuid::Uuid::new_v4().to_string();
    dispatcher
        .register_bridge(&uuid, &local_hostname())
        .context("Failed to register the bridge")?;
    info!("Bridge {} ready ({})", config.bridge_name, uuid);

    let result = serve(&dispatcher, &session, BufReader::new(tokio::io::stdin())).await;

    info!("Shutting down bridge...");
    dispatcher.shutdown().await;
    drop(dispatcher);
    drop(session);

    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        warn!("Management output did not drain before shutdown");
    }

    info!("Bridge shutdown complete");
    result
}

/// Handle diagnostic commands
async fn handle_diagnostic_command(cli: &Cli, command: &DiagnosticCommand) -> Result<()> {
    match command {
        DiagnosticCommand::Version { verbose } => {
            BuildInfo::get().display(*verbose);
            Ok(())
        }
        DiagnosticCommand::DumpConfig => {
            let config = load_config(cli)?;
            let contents =
                toml::to_string_pretty(&config).context("Failed to serialize config")?;
            print!("{}", contents);
            Ok(())
        }
        DiagnosticCommand::Introspect {
            bus_name,
            object_path,
        } => {
            let config = load_config(cli)?;
            let connection: Arc<dyn BusConnection> =
                Arc::new(connect(config.bus, config.call_timeout()).await?);
            let object = RemoteObject::introspect(
                connection,
                ObjectKey::new(bus_name.clone(), object_path.clone()),
                false,
            )
            .await
            .with_context(|| format!("Failed to introspect {}{}", bus_name, object_path))?;

            println!("{} {}", bus_name, object_path);
            for interface in object.interfaces() {
                for line in diagnostics::describe_interface(interface) {
                    println!("{}", line);
                }
            }
            Ok(())
        }
        DiagnosticCommand::ListInterfaces {
            bus_name,
            object_path,
        } => {
            let config = load_config(cli)?;
            let connection = connect(config.bus, config.call_timeout()).await?;
            let names = RemoteObject::interface_names(&connection, bus_name, object_path).await;
            if names.is_empty() {
                error!("No interfaces found at {}{}", bus_name, object_path);
            }
            for name in names {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    if let Some(command) = &cli.command {
        return handle_diagnostic_command(&cli, command).await;
    }

    info!("Starting D-Bus bridge daemon...");

    let config = load_config(&cli)?;
    info!("Configuration loaded");
    info!("Bus: {:?}", config.bus);
    info!("Call timeout: {}s", config.call_timeout_secs);
    info!("Signal listening: {}", config.listen_for_signals);

    run_bridge(config).await
}
