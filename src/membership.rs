//! # Summary
//!
//! In-memory membership table: every node currently believed live,
//! including this one. Admission inserts, the failure path removes.

use std::collections::HashMap as Map;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Address { host: host.into(), port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of inserting into the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Inserted,

    /// Same id, same address: nothing to do.
    Unchanged,

    /// Same id already bound to another address; the table is left alone.
    Conflict(Address),
}

#[derive(Clone, Debug, Default)]
pub struct Membership {
    members: Map<usize, Address>,
}

impl Membership {
    pub fn new() -> Self {
        Membership::default()
    }

    pub fn insert(&mut self, id: usize, address: Address) -> Admission {
        match self.members.get(&id) {
        | Some(existing) if *existing == address => Admission::Unchanged,
        | Some(existing) => Admission::Conflict(existing.clone()),
        | None => {
            self.members.insert(id, address);
            Admission::Inserted
        }
        }
    }

    pub fn remove(&mut self, id: usize) -> Option<Address> {
        self.members.remove(&id)
    }

    pub fn get(&self, id: usize) -> Option<&Address> {
        self.members.get(&id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.members.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Every member other than `this`, sorted by id.
    pub fn peers(&self, this: usize) -> Vec<(usize, Address)> {
        let mut peers = self.members
            .iter()
            .filter(|(id, _)| **id != this)
            .map(|(id, address)| (*id, address.clone()))
            .collect::<Vec<_>>();
        peers.sort_by_key(|(id, _)| *id);
        peers
    }

    pub fn ids(&self) -> Vec<usize> {
        let mut ids = self.members.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}
