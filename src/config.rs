use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::shared::{Shared, State};
use crate::state::Section;
use crate::storage::Storage;
use crate::thread;

#[derive(Clone, Debug)]
pub struct Config {
    /// Unique node ID
    id: usize,

    /// Persisted membership store
    path: PathBuf,

    /// Timeout for detecting unresponsive peers
    timeout: Duration,

    /// Interval between heartbeat cycles
    heartbeat: Duration,

    /// Consecutive failed heartbeats before a peer is removed
    misses: usize,

    /// Connection resets tolerated on one inbound connection
    retries: usize,
}

impl Config {
    pub fn new(id: usize) -> Self {
        Config {
            id,
            path: PathBuf::from(format!("config{}.txt", id)),
            timeout: Duration::from_secs(1),
            heartbeat: Duration::from_secs(5),
            misses: 3,
            retries: 5,
        }
    }

    pub fn with_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_misses(mut self, misses: usize) -> Self {
        self.misses = std::cmp::max(misses, 1);
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = std::cmp::max(retries, 1);
        self
    }

    /// Loads the membership store, binds this node's listener and starts
    /// the acceptor and heartbeat tasks. Must be called from within a
    /// `tokio` runtime.
    pub async fn run<S: Section>(self, section: S) -> Result<Node<S>> {
        let storage = Storage::new(&self.path);
        let (members, address) = storage.load(self.id)?;

        let listener = TcpListener::bind((address.host.as_str(), address.port))
            .await
            .map_err(|source| Error::Bind { addr: address.to_string(), source })?;
        info!("node {} listening on {} with {} known members", self.id, address, members.len());

        let state = State::new(self.id, address, members, storage.clone(), section);
        let node = Node::new(self.id, Shared::new(state), self.timeout);

        let acceptor = thread::acceptor::run(node.clone(), listener, self.retries);
        node.track(tokio::spawn(acceptor));

        let heartbeat = thread::heartbeat::run(node.clone(), storage, self.heartbeat, self.misses);
        node.track(tokio::spawn(heartbeat));

        Ok(node)
    }
}
