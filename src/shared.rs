//! # Summary
//!
//! This module implements the node's shared state and every protocol
//! transition on it. We wrap the central `State` type with Arc<Mutex<T>>
//! so that connection handlers, the execution task, the heartbeat task and
//! the local caller all go through one lock.
//!
//! Every method on `State` is a single atomic step: it runs with the lock
//! held, never touches the network, and returns whatever follow-up work
//! (messages to send, a section to start executing) the caller must do
//! after releasing the lock.

use std::collections::BTreeSet as Set;
use std::collections::HashMap as Map;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::clock::{Clock, Timestamp};
use crate::membership::{Address, Admission, Membership};
use crate::message::Message;
use crate::socket::Connection;
use crate::state::Section;
use crate::storage::Storage;

/// Thread-safe wrapper around the node `State`.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Shared<S: Section>(Arc<Mutex<State<S>>>);

impl<S: Section> Shared<S> {
    pub fn new(state: State<S>) -> Self {
        Shared(Arc::new(Mutex::new(state)))
    }

    /// Acquires the lock on the underlying state.
    pub fn lock(&self) -> MutexGuard<State<S>> {
        self.0.lock()
    }
}

/// Request broadcast produced by `State::request`.
#[derive(Clone, Debug)]
pub struct Request {
    pub timestamp: Timestamp,
    pub peers: Vec<(usize, Address)>,
}

/// Reply to an inbound message, plus the hold interval if the message
/// completed our set of grants.
#[derive(Debug)]
pub struct Response {
    pub reply: Message,
    pub hold: Option<Duration>,
}

/// Result of removing a member.
#[derive(Debug)]
pub struct Removal {
    pub address: Address,
    pub hold: Option<Duration>,
}

/// Everything a node knows.
pub struct State<S: Section> {
    id: usize,
    address: Address,
    clock: Clock,
    members: Membership,
    storage: Storage,

    /// Waiting for or holding the critical section
    interested: bool,

    /// Currently inside the critical section
    executing: bool,

    /// Clock value captured when the current request was made
    request: Timestamp,

    /// Peers whose grant is still outstanding
    waiting: Set<usize>,

    /// Peers whose requests we postponed, in arrival order
    deferred: Vec<usize>,

    /// Cached heartbeat connections
    channels: Map<usize, Connection>,

    section: S,
}

impl<S: Section> State<S> {
    pub fn new(id: usize, address: Address, members: Membership, storage: Storage, section: S) -> Self {
        let waiting = members.peers(id).into_iter().map(|(peer, _)| peer).collect();
        State {
            id,
            address,
            clock: Clock::new(),
            members,
            storage,
            interested: false,
            executing: false,
            request: 0,
            waiting,
            deferred: Vec::new(),
            channels: Map::default(),
            section,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn is_executing(&self) -> bool {
        self.executing
    }

    pub fn member(&self, id: usize) -> Option<&Address> {
        self.members.get(id)
    }

    pub fn peers(&self) -> Vec<(usize, Address)> {
        self.members.peers(self.id)
    }

    pub fn section(&self) -> &S {
        &self.section
    }

    /// Ticks the clock for a send event and stamps `message` with it.
    pub fn stamp(&mut self, message: &mut Message) -> Timestamp {
        let now = self.clock.tick();
        message.stamp(now);
        now
    }

    /// Local request for the critical section. Returns `None` unless idle.
    pub fn request(&mut self) -> Option<Request> {
        if self.executing {
            warn!("already executing critical section");
            return None
        }
        if self.interested {
            warn!("already requested critical section at {}", self.request);
            return None
        }
        self.interested = true;
        self.request = self.clock.tick();
        let peers = self.peers();
        self.waiting = peers.iter().map(|(id, _)| *id).collect();
        info!("requesting critical section at {} from {:?}", self.request, self.waiting);
        Some(Request { timestamp: self.request, peers })
    }

    /// Enters the critical section if every grant is in. Returns the hold
    /// interval chosen by the section when the transition happens.
    pub fn try_execute(&mut self) -> Option<Duration> {
        if !self.interested || self.executing || !self.waiting.is_empty() {
            return None
        }
        self.executing = true;
        info!("entering critical section with request {} at {}", self.request, self.clock.now());
        Some(self.section.enter(self.id, self.request))
    }

    /// Records a grant from `from`, either as the reply to our `CSENTRY` or
    /// as a belated `CSREPLY` on a fresh connection.
    pub fn grant(&mut self, from: usize, timestamp: Timestamp) -> Option<Duration> {
        self.clock.observe(timestamp);
        if self.waiting.remove(&from) {
            debug!("grant from {} at {}, still waiting on {:?}", from, timestamp, self.waiting);
        } else {
            debug!("unexpected grant from {} at {}", from, timestamp);
        }
        self.try_execute()
    }

    /// Whether a request from `(timestamp, from)` must wait for us.
    fn defers(&self, from: usize, timestamp: Timestamp) -> bool {
        self.executing || (self.interested && (self.request, self.id) < (timestamp, from))
    }

    /// Handles one inbound message and produces the reply line.
    pub fn receive(&mut self, message: Message) -> Response {
        // Grants are observed by `grant`.
        let observed = match &message {
        | Message::CsReply { .. } => None,
        | other => other.timestamp(),
        };
        if let Some(timestamp) = observed {
            self.clock.observe(timestamp);
        }
        let mut hold = None;
        let reply = match message {
        | Message::Heartbeat { id } => {
            trace!("heartbeat from {}", id);
            Message::HeartbeatReply { id: self.id }
        }
        | Message::NewNode { id, host, port, .. } => {
            self.admit(id, Address::new(host, port));
            Message::admitted(self.clock.now())
        }
        | Message::CsEntry { id, timestamp } => {
            if self.defers(id, timestamp) {
                if !self.deferred.contains(&id) {
                    self.deferred.push(id);
                }
                info!("deferred entry request from {} at {}", id, self.clock.now());
                Message::Deferred { id: self.id, timestamp: self.clock.now() }
            } else {
                let now = self.clock.tick();
                info!("granting entry request from {} at {}", id, now);
                Message::CsReply { id: self.id, timestamp: now }
            }
        }
        | Message::CsReply { id, timestamp } => {
            hold = self.grant(id, timestamp);
            Message::GotIt { timestamp: self.clock.tick() }
        }
        | other => {
            debug!("unrecognized message {}", other);
            Message::unrecognized(self.clock.tick())
        }
        };
        Response { reply, hold }
    }

    /// Reply to a line that failed to parse.
    pub fn unrecognized(&mut self, line: &str) -> Message {
        debug!("malformed line {:?}", line);
        Message::unrecognized(self.clock.tick())
    }

    /// Folds the reply to one of our outbound calls back into the state.
    pub fn reply(&mut self, from: usize, reply: &Message) -> Option<Duration> {
        match reply {
        | Message::CsReply { id, timestamp } => {
            if *id != from {
                debug!("node {} answered with a grant from {}", from, id);
            }
            self.grant(*id, *timestamp)
        }
        | other => {
            if let Some(timestamp) = other.timestamp() {
                self.clock.observe(timestamp);
            }
            None
        }
        }
    }

    /// Leaves the critical section. Returns the peers owed a belated grant.
    pub fn exit(&mut self) -> Vec<(usize, Address)> {
        self.section.exit(self.id);
        self.executing = false;
        self.interested = false;
        self.waiting = self.peers().into_iter().map(|(id, _)| id).collect();
        let deferred = std::mem::replace(&mut self.deferred, Vec::new());
        info!("left critical section at {}, replying to {:?}", self.clock.now(), deferred);
        deferred.into_iter()
            .filter_map(|id| match self.members.get(id) {
            | Some(address) => Some((id, address.clone())),
            | None => {
                warn!("deferred node {} is no longer a member", id);
                None
            }
            })
            .collect()
    }

    /// Adds a member to the table and the persisted store.
    pub fn admit(&mut self, id: usize, address: Address) -> Admission {
        let admission = self.members.insert(id, address.clone());
        match &admission {
        | Admission::Inserted => info!("new node added: {} at {}", id, address),
        | Admission::Unchanged => debug!("node {} at {} already known", id, address),
        | Admission::Conflict(existing) => {
            warn!("ignoring node {} at {}: already bound to {}", id, address, existing);
            return admission
        }
        }
        if let Err(error) = self.storage.append(id, &address) {
            error!("failed to persist node {}: {}", id, error);
        }
        admission
    }

    /// Drops a failed member. Unknown ids and this node itself are ignored.
    pub fn remove(&mut self, id: usize) -> Option<Removal> {
        if id == self.id {
            warn!("refusing to remove self");
            return None
        }
        let address = match self.members.get(id) {
        | Some(address) => address.clone(),
        | None => {
            debug!("node {} already removed", id);
            return None
        }
        };

        self.deferred.retain(|deferred| *deferred != id);

        let mut hold = None;
        if self.interested && self.waiting.remove(&id) {
            info!("dropping vote of failed node {}", id);
            hold = self.try_execute();
        }

        if self.channels.remove(&id).is_some() {
            debug!("closed heartbeat channel to {}", id);
        }

        if let Err(error) = self.storage.remove(id, &address) {
            error!("failed to erase node {} from store: {}", id, error);
        }

        self.members.remove(id);
        self.waiting.remove(&id);
        info!("removed node {} at {}", id, address);
        Some(Removal { address, hold })
    }

    /// Takes the cached heartbeat connection to `id`, if any.
    pub fn take_channel(&mut self, id: usize) -> Option<Connection> {
        self.channels.remove(&id)
    }

    /// Returns a heartbeat connection to the cache. Dropped instead if the
    /// peer was removed while the probe was in flight.
    pub fn restore_channel(&mut self, id: usize, channel: Connection) {
        if self.members.contains(id) {
            self.channels.insert(id, channel);
        }
    }

    /// Closes every cached heartbeat connection.
    pub fn close_channels(&mut self) {
        self.channels.clear();
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut channels = self.channels.keys().cloned().collect::<Vec<_>>();
        channels.sort();
        Snapshot {
            id: self.id,
            timestamp: self.clock.now(),
            interested: self.interested,
            executing: self.executing,
            request: if self.interested { Some(self.request) } else { None },
            waiting: self.waiting.iter().cloned().collect(),
            deferred: self.deferred.clone(),
            members: self.members
                .ids()
                .into_iter()
                .filter_map(|id| self.members.get(id).map(|address| (id, address.clone())))
                .collect(),
            channels,
        }
    }
}

/// Point-in-time copy of a node's data structures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub id: usize,
    pub timestamp: Timestamp,
    pub interested: bool,
    pub executing: bool,
    pub request: Option<Timestamp>,
    pub waiting: Vec<usize>,
    pub deferred: Vec<usize>,
    pub members: Vec<(usize, Address)>,
    pub channels: Vec<usize>,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Node ID: {}", self.id)?;
        writeln!(f, "Timestamp: {}", self.timestamp)?;
        writeln!(f, "Interested CS: {}", self.interested)?;
        writeln!(f, "Executing CS: {}", self.executing)?;
        match self.request {
        | Some(request) => writeln!(f, "Request TS: {}", request)?,
        | None => writeln!(f, "Request TS: -")?,
        }
        writeln!(f, "Deferred List: {:?}", self.deferred)?;
        writeln!(f, "Waiting for Reply: {:?}", self.waiting)?;
        writeln!(f, "Heartbeat Channels: {:?}", self.channels)?;
        write!(f, "Members:")?;
        for (id, address) in &self.members {
            write!(f, "\n  {} {}", id, address)?;
        }
        Ok(())
    }
}
