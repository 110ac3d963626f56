use anyhow::anyhow;
use leaselock::{CancellationToken, Error, LockConfig, LostCallback, Result};
use std::{env, process, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: leasectl <key> [hold_secs] [ttl_secs]";

struct Args {
    key: String,
    hold: Duration,
    ttl: Duration,
}

fn parse_args() -> Result<Args> {
    let mut args = env::args().skip(1);
    let key = args.next().ok_or_else(|| Error::Other(anyhow!(USAGE)))?;
    let hold = match args.next() {
        Some(v) => v
            .parse::<u64>()
            .map_err(|e| Error::Other(anyhow!("Invalid hold_secs {:?}: {}", v, e)))?,
        None => 30,
    };
    let ttl = match args.next() {
        Some(v) => v
            .parse::<u64>()
            .map_err(|e| Error::Other(anyhow!("Invalid ttl_secs {:?}: {}", v, e)))?,
        None => 10,
    };
    Ok(Args {
        key,
        hold: Duration::from_secs(hold),
        ttl: Duration::from_secs(ttl),
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,leaselock=debug")),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            process::exit(2);
        }
    };

    if let Err(e) = run(args).await {
        error!("leasectl failed: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = LockConfig::from_env()?;
    info!(store = ?config.store, "loaded configuration");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            signal.cancel();
        }
    });

    let lock = config.build().await?.with_shutdown(shutdown.clone());
    let key = args.key.clone();
    let on_lost: LostCallback = Arc::new(move || warn!(key = %key, "lease lost while holding"));

    info!(key = %args.key, ttl_secs = args.ttl.as_secs(), "waiting for lease");
    let handle = lock.lock(&args.key, args.ttl, Some(on_lost)).await?;
    info!(key = %args.key, token = handle.token(), "holding lease");

    let lost = handle.lost_token();
    tokio::select! {
        () = tokio::time::sleep(args.hold) => info!("hold period elapsed"),
        () = shutdown.cancelled() => info!("shutdown requested"),
        () = lost.cancelled() => warn!("lease lost, stopping early"),
    }

    let released = handle.release().await?;
    info!(key = %args.key, released, "done");
    Ok(())
}
