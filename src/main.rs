use clap::{Parser, Subcommand};
use nm_tunnel_plugin::{Config, ConnectionRequest, Provider, VpnSettings};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "nm-tunnel-plugin")]
#[command(about = "NetworkManager VPN plugin for HANS and Iodine tunnels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (built-in defaults when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the plugin service for a tunnel provider
    ///
    /// This is started by NetworkManager through D-Bus activation.
    Serve {
        #[arg(value_enum)]
        provider: Provider,
    },
    /// Generate default config file
    Init {
        /// Where to write the config
        #[arg(short, long, default_value = "nm-tunnel-plugin.toml")]
        path: PathBuf,
    },
    /// Validate connection settings and print the tunnel command line
    Command {
        #[arg(value_enum)]
        provider: Provider,
        /// Data item as key=value
        #[arg(short, long = "data", value_parser = parse_key_value)]
        data: Vec<(String, String)>,
        /// Secret item as key=value
        #[arg(short, long = "secret", value_parser = parse_key_value)]
        secret: Vec<(String, String)>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, nm_tunnel_plugin::config::ConfigError> {
    match path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            Config::load(path)
        }
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; NetworkManager collects them into the journal.
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve { provider } => {
            let config = load_config(cli.config.as_ref())?;
            info!("Starting {} plugin...", provider);
            if let Err(e) = nm_tunnel_plugin::dbus::serve(provider, config).await {
                error!("Plugin service failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Init { path } => {
            info!("Generating default config...");
            let config = Config::default();
            config.save(&path)?;
            println!("Created default config: {}", path.display());
        }
        Commands::Command {
            provider,
            data,
            secret,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let mut settings = VpnSettings::new();
            settings.data.extend(data);
            settings.secrets.extend(secret);

            let request = ConnectionRequest::from_settings(provider, &settings)?;
            let binary = config.profile(provider).binary;
            println!("{}", request.tunnel_command(&binary));
        }
    }

    Ok(())
}
