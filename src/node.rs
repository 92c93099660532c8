//! # Summary
//!
//! `Node` is the cheaply cloneable handle every activity works through:
//! the local caller, each inbound connection, the execution task and the
//! heartbeat task all hold one. It owns the outbound side of messaging,
//! since every send has to stamp the clock first and fold the reply back
//! into the shared state afterwards.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::membership::Address;
use crate::message::Message;
use crate::shared::{Shared, Snapshot};
use crate::socket;
use crate::state::Section;
use crate::thread;

#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Node<S: Section> {
    id: usize,
    shared: Shared<S>,

    /// Bound on connecting to a peer, and separately on awaiting its reply
    timeout: Duration,

    shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<S: Section> Node<S> {
    pub(crate) fn new(id: usize, shared: Shared<S>, timeout: Duration) -> Self {
        Node {
            id,
            shared,
            timeout,
            shutdown: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn shared(&self) -> &Shared<S> {
        &self.shared
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|running| !running.is_finished());
        tasks.push(task);
    }

    /// Copy of the node's clock, critical-section intent, wait set,
    /// deferred queue and membership.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.lock().snapshot()
    }

    /// Runs `f` against the critical section implementation.
    pub fn inspect<T, F: FnOnce(&S) -> T>(&self, f: F) -> T {
        f(self.shared.lock().section())
    }

    /// Requests the critical section. Returns once every peer has answered
    /// the request (with a grant or a deferral) or failed to; entry itself
    /// may happen later, when belated grants arrive. Returns `false` if a
    /// request is already outstanding.
    pub async fn enter_cs(&self) -> bool {
        let request = self.shared.lock().request();
        let request = match request {
        | Some(request) => request,
        | None => return false,
        };
        let entry = Message::CsEntry { id: self.id, timestamp: request.timestamp };
        self.multicast(&request.peers, entry).await;

        // Grants may have arrived on other connections while we were
        // broadcasting, or there may have been nobody to ask.
        let hold = self.shared.lock().try_execute();
        if let Some(hold) = hold {
            self.execute(hold);
        }
        true
    }

    /// Sends `message` to member `id` and waits for its reply.
    pub async fn send(&self, id: usize, message: Message) -> Result<Message> {
        let address = self.shared.lock().member(id).cloned();
        let address = address.ok_or(Error::UnknownPeer(id))?;
        self.send_to(id, &address, message).await
    }

    /// Sends `message` to every member except this node, in parallel.
    pub async fn broadcast(&self, message: Message) -> Vec<(usize, Result<Message>)> {
        let peers = self.shared.lock().peers();
        self.multicast(&peers, message).await
    }

    /// Announces this node to every known member.
    pub async fn announce(&self) -> Vec<(usize, Result<Message>)> {
        let address = self.shared.lock().address().clone();
        self.broadcast(Message::NewNode {
            id: self.id,
            host: address.host,
            port: address.port,
            timestamp: 0,
        }).await
    }

    /// Drops `id` from the membership. Returns whether it was a member.
    pub fn remove(&self, id: usize) -> bool {
        let removal = self.shared.lock().remove(id);
        match removal {
        | Some(removal) => {
            if let Some(hold) = removal.hold {
                self.execute(hold);
            }
            true
        }
        | None => false,
        }
    }

    /// Stops accepting connections, probing peers and executing, and waits
    /// for the background tasks to wind down.
    pub async fn shutdown(&self) {
        info!("node {} shutting down", self.id);
        self.shutdown.cancel();
        let tasks = std::mem::replace(&mut *self.tasks.lock(), Vec::new());
        for task in tasks {
            task.await.ok();
        }
        self.shared.lock().close_channels();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn execute(&self, hold: Duration) {
        thread::executor::spawn(self.clone(), hold);
    }

    pub(crate) async fn multicast(
        &self,
        peers: &[(usize, Address)],
        message: Message,
    ) -> Vec<(usize, Result<Message>)> {
        debug!("sending {} to {:?}", message.kind(), peers.iter().map(|(id, _)| id).collect::<Vec<_>>());
        let calls = peers.iter().map(|(id, address)| {
            let message = message.clone();
            async move { (*id, self.send_to(*id, address, message).await) }
        });
        futures::future::join_all(calls).await
    }

    async fn send_to(&self, id: usize, address: &Address, mut message: Message) -> Result<Message> {
        self.shared.lock().stamp(&mut message);
        match socket::call(address, &message, self.timeout).await {
        | Ok(reply) => {
            debug!("received {} from node {} in reply to {}", reply, id, message.kind());
            let hold = self.shared.lock().reply(id, &reply);
            if let Some(hold) = hold {
                self.execute(hold);
            }
            Ok(reply)
        }
        | Err(error) => {
            warn!("could not deliver {} to node {} at {}: {}", message.kind(), id, address, error);
            Err(error)
        }
        }
    }
}
