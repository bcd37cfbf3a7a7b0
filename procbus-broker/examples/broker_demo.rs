//! Minimal broker bring-up.
//!
//! Starts the core from `PROCBUS_*` environment variables, spawns one RPC
//! child, grants it permits, and prints a kernel-metrics snapshot.
//!
//! ```bash
//! PROCBUS_NUM_WORKERS=2 cargo run --example broker_demo
//! ```

use std::time::Duration;

use procbus_broker::prelude::*;

#[tokio::main]
async fn main() -> Result<(), BrokerError> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let broker = Broker::start(BrokerConfig::from_env())?;

    let descriptor = broker.spawn_rpc(
        "demo-child",
        "/bin/sh",
        &["-c".to_string(), "exec sleep 3".to_string()],
    )?;
    println!("spawned {} (pid {})", descriptor.id, descriptor.pid);

    let grant = broker.request_permits("demo-child", 2)?;
    println!("granted {} permits, {} left", grant.granted, grant.available);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let metrics = broker.kernel_metrics();
    println!(
        "p99 {:.2}ms, saturation {:.1}%, {} workers, permits {}/{}",
        metrics.p99_latency_ms,
        metrics.buffer_saturation,
        metrics.active_workers,
        metrics.allocated_permits,
        metrics.total_permits,
    );

    broker.shutdown().await;
    Ok(())
}
