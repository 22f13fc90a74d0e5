use anyhow::{Context, Result};
use vnic_bridge::config::RunOverrides;
use vnic_bridge::{cli, config, runtime};
use vnic_core::{BridgeConfig, Engine};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = <cli::Cli as clap::Parser>::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command.unwrap_or_else(cli::Command::default_run) {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force } => {
            config::save(&config_path, &BridgeConfig::default(), force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        cli::Command::Run {
            hub,
            port,
            instance,
            mac,
        } => {
            let mut cfg = config::load(&config_path)?;
            RunOverrides {
                hub,
                port,
                instance,
                mac,
            }
            .apply(&mut cfg);
            config::validate(&cfg).context("invalid command-line settings")?;
            run(cfg).await
        }
    }
}

async fn run(cfg: BridgeConfig) -> Result<()> {
    let engine = Engine::new(cfg.engine.clone());
    let addr = match cfg.mac {
        Some(mac) => engine.create_instance_with_addr(cfg.instance, mac).map(|()| mac),
        None => engine.create_instance(cfg.instance),
    }
    .with_context(|| format!("failed to create instance {}", cfg.instance))?;
    tracing::info!("Instance {} address {}", cfg.instance, addr);

    let _worker = engine
        .spawn_service_worker()
        .context("failed to start service worker")?;

    let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    runtime::run_bridge(engine, cfg, stop_rx, Box::new(|m| tracing::info!("{m}"))).await
}
