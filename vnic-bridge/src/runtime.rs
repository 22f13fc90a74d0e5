use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use vnic_core::control::BridgeConfig;
use vnic_core::transport::{HubConnection, HubReader, HubWriter};
use vnic_core::{Endpoint, Engine, Ioctl, Request, Upstream};

pub type LogFn = Box<dyn Fn(String) + Send + Sync + 'static>;

/// How long setup waits for each acknowledgment
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the channel reader blocks before rechecking its stop flag
const READ_POLL: Duration = Duration::from_millis(100);

const CHANNEL_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Default)]
struct RelayCounters {
    to_hub: u64,
    from_hub: u64,
}

/// Wait for the acknowledgment of the last setup step
fn expect_ack(endpoint: &Endpoint, step: &str) -> Result<()> {
    match endpoint.read_timeout(ACK_TIMEOUT) {
        Some(Upstream::ErrorAck { error, .. }) => {
            anyhow::bail!("{step} refused: {error} (code 0x{:02x})", error.code())
        }
        Some(Upstream::IoctlNak(op)) => anyhow::bail!("{step} refused: {op:?} not acknowledged"),
        Some(_) => Ok(()),
        None => anyhow::bail!("{step}: no acknowledgment"),
    }
}

/// Open the bridging channel: attach, switch to raw frames and register
fn open_bridge_channel(engine: &Arc<Engine>, ppa: u32) -> Result<Endpoint> {
    let endpoint = engine.open();
    endpoint.request(Request::Attach { ppa })?;
    expect_ack(&endpoint, "attach")?;
    endpoint.ioctl(Ioctl::Raw)?;
    expect_ack(&endpoint, "raw mode")?;
    endpoint.ioctl(Ioctl::RegisterBridge)?;
    expect_ack(&endpoint, "bridge registration")?;
    Ok(endpoint)
}

/// Run the bridge until `stop` flips to true, Ctrl+C, or the hub goes away.
///
/// The instance `cfg.instance` must already exist on `engine`, and some
/// service worker must be draining the engine's write queues.
pub async fn run_bridge(
    engine: Arc<Engine>,
    cfg: BridgeConfig,
    stop: watch::Receiver<bool>,
    log: LogFn,
) -> Result<()> {
    let log = Arc::new(log);
    let endpoint = Arc::new(
        open_bridge_channel(&engine, cfg.instance)
            .with_context(|| format!("failed to set up bridging channel on instance {}", cfg.instance))?,
    );
    (log.as_ref())(format!(
        "Bridging channel {} registered on instance {}",
        endpoint.id(),
        cfg.instance
    ));

    let hub = cfg.hub_endpoint();
    let result = match HubConnection::connect(&hub).await {
        Ok(conn) => {
            (log.as_ref())(format!("Connected to hub {}", conn.peer_addr()));
            let (reader, writer) = conn.into_split(cfg.sendbuf_threshold);
            relay(&engine, &endpoint, &cfg, reader, writer, stop, &log).await
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("failed to connect to hub {hub}"))),
    };

    if let Err(e) = endpoint.ioctl(Ioctl::UnregisterBridge) {
        tracing::debug!("Unregister on shutdown: {e}");
    }
    match Arc::try_unwrap(endpoint) {
        Ok(endpoint) => endpoint.close().context("failed to close bridging channel")?,
        // the reader still holds a reference; its drop closes the channel
        Err(_) => tracing::warn!("Bridging channel still referenced at shutdown"),
    }
    (log.as_ref())("Bridge stopped".to_string());

    result
}

async fn relay(
    engine: &Engine,
    endpoint: &Arc<Endpoint>,
    cfg: &BridgeConfig,
    mut reader: HubReader,
    mut writer: HubWriter,
    mut stop: watch::Receiver<bool>,
    log: &Arc<LogFn>,
) -> Result<()> {
    // bridging channel -> hub: the channel read blocks, so it gets its own thread
    let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(CHANNEL_QUEUE_DEPTH);
    let pump_stop = Arc::new(AtomicBool::new(false));
    let pump = {
        let endpoint = Arc::clone(endpoint);
        let pump_stop = Arc::clone(&pump_stop);
        tokio::task::spawn_blocking(move || {
            while !pump_stop.load(Ordering::Relaxed) {
                match endpoint.read_timeout(READ_POLL) {
                    Some(Upstream::Frame(frame)) => {
                        if frame_tx.blocking_send(frame).is_err() {
                            return;
                        }
                    }
                    Some(other) => tracing::debug!("Bridging channel: ignoring {:?}", other),
                    None => {}
                }
            }
        })
    };

    let mut counters = RelayCounters::default();
    let mut health_tick = tokio::time::interval(cfg.health_interval);
    let mut flush_tick = tokio::time::interval(cfg.flush_interval);

    let result: Result<()> = loop {
        tokio::select! {
            _ = health_tick.tick() => {
                let stats = engine.stats();
                (log.as_ref())(format!(
                    "Health tick: to_hub={} from_hub={} pending={} delivered={} bridge_dropped={}",
                    counters.to_hub,
                    counters.from_hub,
                    writer.pending(),
                    stats.delivered,
                    stats.bridge_dropped
                ));
            }

            _ = flush_tick.tick() => {
                if let Err(e) = writer.flush().await {
                    break Err(anyhow::Error::new(e).context("failed to flush records to hub"));
                }
            }

            frame = reader.recv_frame() => {
                match frame {
                    Ok(Some(frame)) => {
                        counters.from_hub += 1;
                        if let Err(e) = endpoint.send_frame(frame) {
                            break Err(anyhow::Error::new(e).context("bridging channel went away"));
                        }
                    }
                    Ok(None) => break Err(anyhow::anyhow!("hub closed the connection")),
                    Err(e) => break Err(anyhow::Error::new(e).context("failed to read from hub")),
                }
            }

            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    break Err(anyhow::anyhow!("bridging channel reader stopped"));
                };
                counters.to_hub += 1;
                if let Err(e) = writer.send_frame(&frame).await {
                    break Err(anyhow::Error::new(e).context("failed to send records to hub"));
                }
            }

            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    (log.as_ref())("Stop requested".to_string());
                    break Ok(());
                }
            }

            _ = tokio::signal::ctrl_c() => {
                (log.as_ref())("Ctrl+C received".to_string());
                break Ok(());
            }
        }
    };

    if result.is_ok() {
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Hub shutdown: {e}");
        }
    }
    pump_stop.store(true, Ordering::Relaxed);
    drop(frame_rx);
    if pump.await.is_err() {
        tracing::error!("Bridging channel reader panicked");
    }

    (log.as_ref())(format!(
        "Relay finished: to_hub={} from_hub={}",
        counters.to_hub, counters.from_hub
    ));
    result
}
