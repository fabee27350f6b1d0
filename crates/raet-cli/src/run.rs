//! `raet run`: drive a road stack (and optionally a lane) from a tokio
//! interval until Ctrl+C.
//!
//! A non-main stack with `main_ha` configured bootstraps itself: it joins
//! the main estate and then allows every joined remote that has no session.
//! Received messages and failed transactions are logged.

use anyhow::Context;
use raet_road::RoadStack;
use raet_types::config::StackConfig;
use raet_types::kinds::TrnsKind;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub fn cmd_run(config: StackConfig, tick_ms: u64, with_lane: bool) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    rt.block_on(run_loop(config, tick_ms, with_lane))
}

/// Start Allow with every joined remote that lacks a session and is not
/// already being allowed.
fn allow_joined(stack: &mut RoadStack, allowing: &mut HashSet<u32>) {
    let ready: Vec<u32> = stack
        .remotes()
        .filter(|r| r.joined && !r.allowed() && !allowing.contains(&r.uid))
        .map(|r| r.uid)
        .collect();
    for uid in ready {
        match stack.allow(uid) {
            Ok(()) => {
                allowing.insert(uid);
            }
            Err(e) => warn!(uid, error = %e, "cannot start allow"),
        }
    }
    allowing.retain(|uid| stack.remote(*uid).is_some_and(|r| !r.allowed()));
}

async fn run_loop(config: StackConfig, tick_ms: u64, with_lane: bool) -> anyhow::Result<()> {
    let name = config.name.clone();
    let initiate = !config.main && config.main_ha.is_some();

    #[cfg(unix)]
    let mut lane = if with_lane {
        Some(raet_road::LaneStack::open(&config).context("opening lane")?)
    } else {
        None
    };
    #[cfg(not(unix))]
    if with_lane {
        anyhow::bail!("lane stacks need unix datagram sockets");
    }

    let mut stack = RoadStack::open(config).with_context(|| format!("opening stack '{name}'"))?;
    if initiate {
        let uid = stack.bootstrap().context("bootstrapping join")?;
        info!(uid, "joining main estate");
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut allowing = HashSet::new();

    info!(name = %name, ha = %stack.ha(), "stack running, Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                stack.service_all();
                for msg in stack.drain_inbox() {
                    info!(uid = msg.uid, from = %msg.name, body = %msg.body, "message received");
                }
                for failure in stack.failures() {
                    if failure.kind == TrnsKind::Allow {
                        allowing.remove(&failure.uid);
                    }
                    warn!(uid = failure.uid, kind = ?failure.kind, error = %failure.error, "transaction failed");
                }
                if initiate {
                    allow_joined(&mut stack, &mut allowing);
                }
                #[cfg(unix)]
                if let Some(lane) = lane.as_mut() {
                    lane.service_all();
                    for (sender, body) in lane.drain_inbox() {
                        info!(from = %sender, body = %body, "lane message received");
                    }
                }
            }
            res = &mut shutdown => {
                res.context("waiting for Ctrl+C")?;
                info!("shutting down");
                break;
            }
        }
    }

    let stats = serde_json::to_string(stack.stats())?;
    info!(%stats, "final counters");
    Ok(())
}
