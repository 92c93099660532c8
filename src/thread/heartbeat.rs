//! # Summary
//!
//! Liveness monitor. Every interval, probes each peer listed in the
//! persisted store over a cached connection. A peer that fails `misses`
//! consecutive probes is removed from the membership.

use std::collections::HashMap as Map;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::membership::Address;
use crate::message::Message;
use crate::node::Node;
use crate::socket::Connection;
use crate::state::Section;
use crate::storage::Storage;

pub async fn run<S: Section>(node: Node<S>, storage: Storage, interval: Duration, misses: usize) {
    let shutdown = node.shutdown_token().clone();
    let mut ticker = tokio::time::interval(interval);
    let mut missed: Map<usize, usize> = Map::default();

    // The first tick completes immediately; peers get one interval to come up.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => cycle(&node, &storage, &mut missed, misses).await,
        }
    }
    debug!("node {} stopped heartbeats", node.id());
}

async fn cycle<S: Section>(
    node: &Node<S>,
    storage: &Storage,
    missed: &mut Map<usize, usize>,
    misses: usize,
) {
    let rows = match storage.rows() {
    | Ok(rows) => rows,
    | Err(error) => {
        warn!("skipping heartbeat cycle: {}", error);
        return
    }
    };

    let probes = rows.into_iter()
        .filter(|row| row.id != node.id())
        .map(|row| async move {
            let result = probe(node, row.id, &row.address).await;
            (row.id, row.address, result)
        });

    for (id, address, result) in futures::future::join_all(probes).await {
        match result {
        | Ok(()) => {
            missed.remove(&id);
        }
        | Err(error) => {
            let count = missed.entry(id).or_insert(0);
            *count += 1;
            warn!("error sending heartbeat to {} at {}: {} ({} of {})", id, address, error, count, misses);
            if *count >= misses {
                warn!("removing node {} from the membership", id);
                missed.remove(&id);
                node.remove(id);
            }
        }
        }
    }
}

/// Sends one probe and waits for its reply. The connection goes back into
/// the cache only on success; on failure it is dropped, so the next cycle
/// reconnects.
async fn probe<S: Section>(node: &Node<S>, id: usize, address: &Address) -> Result<()> {
    let cached = node.shared().lock().take_channel(id);
    let mut channel = match cached {
    | Some(channel) => channel,
    | None => {
        trace!("opening heartbeat channel to {} at {}", id, address);
        Connection::connect(address, node.timeout()).await?
    }
    };
    let reply = channel.call(&Message::Heartbeat { id: node.id() }, node.timeout()).await?;
    match reply {
    | Message::HeartbeatReply { .. } => {
        node.shared().lock().restore_channel(id, channel);
        Ok(())
    }
    | other => Err(Error::Parse(other.to_string())),
    }
}
