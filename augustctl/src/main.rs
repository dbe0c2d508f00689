use std::path::PathBuf;
use std::sync::Arc;

use augustctl::config::{self, Config};
use augustctl::control::{self, ControlState};
use augustctl_lock::bridge::{self, BridgeClient, ProcessSpawner, Submitter};
use augustctl_lock::{Command, LockController};

#[derive(clap::Parser)]
#[command(name = "augustctl")]
#[command(about = "Control an August smart lock over Bluetooth")]
struct Cli {
    /// Directory holding config.json
    #[arg(long, global = true, env = "AUGUSTCTL_HOME")]
    home: Option<PathBuf>,
    /// Offline key, 32 hex digits (overrides config.json)
    #[arg(long, global = true)]
    offline_key: Option<String>,
    /// Slot of the offline key (overrides config.json)
    #[arg(long, global = true)]
    offline_key_offset: Option<u8>,
    /// Bluetooth address of the lock (overrides config.json)
    #[arg(long, global = true)]
    lock_address: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the HTTP control server
    Serve {
        /// Listen address (overrides config.json)
        #[arg(long)]
        http_addr: Option<String>,
        /// Drive the lock from this process instead of a bridge child
        #[arg(long)]
        in_process: bool,
    },
    /// Serve lock commands on stdin/stdout, started by `serve`
    Bridge,
    /// List nearby Bluetooth devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },
    /// Run a single lock command and print the result
    Exec {
        /// e.g. lock, unlock, getAllStatus, everlockOn
        command: String,
        /// Everlock seconds for everlockOn and everlockOnLock
        argument: Option<u16>,
    },
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(key) = &self.offline_key {
            config.offline_key = key.clone();
        }
        if let Some(offset) = self.offline_key_offset {
            config.offline_key_offset = offset;
        }
        if let Some(address) = &self.lock_address {
            config.lock_address = Some(address.clone());
        }
    }

    /// Arguments that make a bridge child see the same settings
    fn bridge_args(&self, home: &std::path::Path) -> Vec<String> {
        let mut args = vec!["--home".to_string(), home.display().to_string()];
        if let Some(key) = &self.offline_key {
            args.extend(["--offline-key".to_string(), key.clone()]);
        }
        if let Some(offset) = self.offline_key_offset {
            args.extend(["--offline-key-offset".to_string(), offset.to_string()]);
        }
        if let Some(address) = &self.lock_address {
            args.extend(["--lock-address".to_string(), address.clone()]);
        }
        args.push("bridge".to_string());
        args
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli: Cli = clap::Parser::parse();
    augustctl::logging::init("info");

    let home = config::augustctl_home(cli.home.clone())?;
    let mut config = Config::load_or_create(&home)?;
    cli.apply(&mut config);

    match &cli.command {
        Commands::Serve {
            http_addr,
            in_process,
        } => {
            let submitter: Arc<dyn Submitter> = if *in_process {
                Arc::new(augustctl::spawn_lock(&config)?)
            } else {
                let spawner = ProcessSpawner::current_exe(cli.bridge_args(&home))?;
                Arc::new(BridgeClient::new(spawner))
            };
            let state = Arc::new(ControlState::new(submitter, &config));
            control::prime_cache(state.clone());
            control::spawn_relock_timer(state.clone());

            let addr = http_addr.clone().unwrap_or_else(|| config.http_addr.clone());
            augustctl::http::run_server(&addr, state).await?;
        }
        Commands::Bridge => {
            let handle = augustctl::spawn_lock(&config)?;
            bridge::serve(&handle, tokio::io::stdin(), tokio::io::stdout()).await?;
            tracing::info!("disconnecting from the lock");
            if let Err(e) = handle.submit(Command::Disconnect).await {
                tracing::warn!(error = %e, "disconnect failed");
            }
        }
        Commands::Scan { seconds } => {
            let adapter = augustctl_lock::btle::get_adapter().await?;
            println!("Scanning for {seconds} seconds...");
            let devices =
                augustctl_lock::btle::scan(&adapter, std::time::Duration::from_secs(*seconds)).await?;
            println!("\nFound {} devices:", devices.len());
            for device in devices {
                let rssi = device
                    .rssi
                    .map(|r| format!("{r} dBm"))
                    .unwrap_or_else(|| "N/A".to_string());
                let marker = if device.is_lock { " [LOCK]" } else { "" };
                println!("  {} ({}) RSSI: {rssi}{marker}", device.name, device.address);
            }
        }
        Commands::Exec { command, argument } => {
            let command = Command::from_parts(command, *argument)?;
            let handle = LockController::spawn(config.lock_config()?);
            augustctl_lock::btle::attach(
                &handle,
                config.lock_address.as_deref(),
                config.scan_timeout(),
            )
            .await?;

            let result = handle.submit(command).await;
            if command != Command::Disconnect {
                if let Err(e) = handle.submit(Command::Disconnect).await {
                    tracing::warn!(error = %e, "disconnect failed");
                }
            }
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
    }

    Ok(())
}
