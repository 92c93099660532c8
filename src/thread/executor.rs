//! # Summary
//!
//! Runs one critical-section cycle: hold the section for the interval the
//! `Section` asked for, leave, then send one belated grant to every peer
//! whose request was deferred during the cycle. The state lock is only
//! taken for the exit transition itself. If the node shuts down during the
//! hold, the section is left without replying to anyone.

use std::time::Duration;

use crate::membership::Address;
use crate::message::Message;
use crate::node::Node;
use crate::state::Section;

pub fn spawn<S: Section>(node: Node<S>, hold: Duration) {
    let task = tokio::spawn(run(node.clone(), hold));
    node.track(task);
}

async fn run<S: Section>(node: Node<S>, hold: Duration) {
    let shutdown = node.shutdown_token().clone();
    let interrupted = tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(hold) => false,
    };

    let owed = node.shared().lock().exit();
    if interrupted {
        info!("node {} shut down inside critical section, not replying to {:?}", node.id(), ids(&owed));
        return
    }
    if owed.is_empty() {
        return
    }

    info!("sending replies to deferred nodes {:?}", ids(&owed));
    let grant = Message::CsReply { id: node.id(), timestamp: 0 };
    for (id, result) in node.multicast(&owed, grant).await {
        if result.is_err() {
            warn!("belated grant to node {} was not delivered", id);
        }
    }
}

fn ids(peers: &[(usize, Address)]) -> Vec<usize> {
    peers.iter().map(|(id, _)| *id).collect()
}
