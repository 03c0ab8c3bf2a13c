//! ceetmd entry point.
//!
//! Loads a shaping policy, builds every device's hierarchy on the simulated
//! queue manager, optionally pushes synthetic traffic through it and prints
//! the resulting per-leaf statistics as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use ceetm_orch::audit::{
    init_logging, init_logging_pretty, AuditCategory, AuditOutcome, AuditRecord,
};
use ceetm_orch::{
    audit_log, load_policy, CeetmOrch, Collaborators, HierarchyHandle, Outcome, Packet,
    PolicyTree,
};
use ceetm_qman::{SimConfig, SimQman};
use clap::Parser;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// CEETM egress shaping daemon
#[derive(Parser, Debug)]
#[command(name = "ceetmd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Policy file, YAML or JSON (by extension)
    #[arg(short = 'p', long)]
    policy: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,

    /// Synthetic frames sent through each device
    #[arg(short = 'n', long, default_value = "0")]
    packets: usize,

    /// Interval between simulated transmit runs, in milliseconds
    #[arg(long, default_value = "10")]
    drain_interval_ms: u64,

    /// Frames each queue may transmit per run
    #[arg(long, default_value = "16")]
    drain_burst: usize,

    /// Frames a simulated queue holds before rejecting
    #[arg(long, default_value = "1024")]
    queue_limit: u32,

    /// Print every hierarchy after configuration
    #[arg(long)]
    dump: bool,
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!("failed to render output: {}", e),
    }
}

fn teardown_all(orch: &CeetmOrch, configured: &[(&PolicyTree, HierarchyHandle)]) {
    for (device, handle) in configured.iter().rev() {
        if let Err(e) = orch.teardown(*handle) {
            warn!(device = %device.device, "teardown failed: {}", e);
        }
    }
}

/// Sends `count` frames from the device root, marks taken in turn from the
/// root filters. Returns (admitted, dropped).
async fn send_traffic(
    orch: &CeetmOrch,
    device: &PolicyTree,
    handle: HierarchyHandle,
    count: usize,
) -> (u64, u64) {
    let marks: Vec<u32> = device.filters.iter().map(|rule| rule.handle).collect();
    if marks.is_empty() {
        warn!(device = %device.device, "no root filters, skipping traffic");
        return (0, 0);
    }
    let mut admitted = 0;
    let mut dropped = 0;
    for i in 0..count {
        let frame = vec![0u8; 64 + (i % 1400)];
        let packet = Packet::new(frame).with_mark(marks[i % marks.len()]);
        match orch.classify_and_enqueue(handle, packet, device.root_id()) {
            Outcome::Admitted => admitted += 1,
            Outcome::Dropped => dropped += 1,
        }
        if i % 256 == 255 {
            tokio::task::yield_now().await;
        }
    }
    (admitted, dropped)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.pretty {
        init_logging_pretty(&args.log_level);
    } else {
        init_logging(&args.log_level);
    }

    let policy = match load_policy(&args.policy) {
        Ok(policy) => policy,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        policy = %args.policy.display(),
        devices = policy.devices.len(),
        ports = policy.ports.len(),
        "starting ceetmd"
    );
    audit_log!(
        AuditRecord::new(AuditCategory::SystemLifecycle, "ceetmd", "start")
            .with_outcome(AuditOutcome::Success)
            .with_details(json!({ "policy": args.policy.display().to_string() }))
    );

    let sim = Arc::new(SimQman::new(SimConfig {
        queue_limit: Some(args.queue_limit),
        ..SimConfig::default()
    }));
    let collaborators = Collaborators::new(sim.clone(), Arc::new(policy.port_map()));
    let orch = CeetmOrch::new(policy.orch.clone(), collaborators);

    let mut configured = Vec::with_capacity(policy.devices.len());
    for device in &policy.devices {
        match orch.configure(device) {
            Ok(handle) => configured.push((device, handle)),
            Err(e) => {
                error!(device = %device.device, "configuration failed: {}", e);
                teardown_all(&orch, &configured);
                return ExitCode::FAILURE;
            }
        }
    }

    if args.dump {
        for (device, handle) in &configured {
            match orch.dump(*handle) {
                Ok(nodes) => print_json(&json!({ "device": device.device, "nodes": nodes })),
                Err(e) => warn!(device = %device.device, "dump failed: {}", e),
            }
        }
    }

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let drainer = {
        let sim = Arc::clone(&sim);
        let interval = Duration::from_millis(args.drain_interval_ms.max(1));
        let burst = args.drain_burst;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut sent = 0usize;
            loop {
                tokio::select! {
                    _ = ticker.tick() => sent += sim.drain_all(burst),
                    _ = &mut stop_rx => break,
                }
            }
            sent
        })
    };

    let mut traffic = Vec::with_capacity(configured.len());
    for (device, handle) in &configured {
        traffic.push(send_traffic(&orch, device, *handle, args.packets).await);
    }

    // let queued frames go out before reporting
    tokio::time::sleep(Duration::from_millis(args.drain_interval_ms.max(1) * 2)).await;
    let _ = stop_tx.send(());
    let transmitted = match drainer.await {
        Ok(sent) => sent,
        Err(e) => {
            warn!("drain task failed: {}", e);
            0
        }
    };

    for ((device, handle), (admitted, dropped)) in configured.iter().zip(&traffic) {
        let leaves: Vec<serde_json::Value> = match orch.leaf_report(*handle) {
            Ok(reports) => reports
                .into_iter()
                .map(|report| {
                    let counters = orch.read_stats(*handle, report.node).unwrap_or_default();
                    json!({
                        "node": report.node,
                        "level": report.level,
                        "counters": counters,
                        "dequeued": report.dequeued,
                    })
                })
                .collect(),
            Err(e) => {
                warn!(device = %device.device, "stats unavailable: {}", e);
                Vec::new()
            }
        };
        print_json(&json!({
            "device": device.device,
            "handle": handle,
            "admitted": admitted,
            "dropped": dropped,
            "leaves": leaves,
        }));
    }

    teardown_all(&orch, &configured);
    print_json(&json!({
        "transmitted": transmitted,
        "orch": orch.stats(),
        "live_objects": sim.live_objects(),
    }));

    audit_log!(
        AuditRecord::new(AuditCategory::SystemLifecycle, "ceetmd", "stop")
            .with_outcome(AuditOutcome::Success)
    );
    ExitCode::SUCCESS
}
