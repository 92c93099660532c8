//! # Summary
//!
//! This module abstracts over the persisted membership store: a plain text
//! file holding one `<id> <host> <port>` row per live node.
//!
//! The store grows by appending rows and shrinks by rewriting the file
//! without the removed row. Rewrites go through a temporary file and a
//! rename, so a concurrent reader (the heartbeat task takes a snapshot
//! every cycle) sees either the old or the new contents, never a torn file.
//! Writers are serialized by the node state lock that owns the `Storage`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::membership::{Address, Membership};

/// One row of the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub id: usize,
    pub address: Address,
}

impl Row {
    fn render(&self) -> String {
        format!("{} {} {}", self.id, self.address.host, self.address.port)
    }
}

/// Persistent membership store.
#[derive(Clone, Debug)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Storage { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Builds the initial membership table and this node's own address.
    /// Fails if the file is unreadable, a row is malformed, or there is
    /// no row for `this`.
    pub fn load(&self, this: usize) -> Result<(Membership, Address)> {
        let mut members = Membership::new();
        for row in self.rows()? {
            members.insert(row.id, row.address);
        }
        let address = members.get(this)
            .cloned()
            .ok_or_else(|| Error::MissingSelf { path: self.path.clone(), id: this })?;
        Ok((members, address))
    }

    /// Snapshot of every well-formed row. Lines without exactly three
    /// fields are skipped; lines with three fields that fail to parse are
    /// an error.
    pub fn rows(&self) -> Result<Vec<Row>> {
        let contents = self.read()?;
        self.parse(&contents)
    }

    fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .map_err(|source| Error::StoreRead { path: self.path.clone(), source })
    }

    fn parse(&self, contents: &str) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let fields = line.split_whitespace().collect::<Vec<_>>();
            if fields.len() != 3 {
                if !line.trim().is_empty() {
                    debug!("skipping line {} of {}: {:?}", index + 1, self.path.display(), line);
                }
                continue
            }
            let malformed = || Error::StoreRow {
                path: self.path.clone(),
                line: index + 1,
                row: line.to_string(),
            };
            let id = fields[0].parse::<usize>().map_err(|_| malformed())?;
            let port = fields[2].parse::<u16>().map_err(|_| malformed())?;
            rows.push(Row { id, address: Address::new(fields[1], port) });
        }
        Ok(rows)
    }

    /// Appends a row unless an identical one is already present.
    /// Returns whether the file changed.
    pub fn append(&mut self, id: usize, address: &Address) -> Result<bool> {
        let row = Row { id, address: address.clone() };
        let contents = self.read()?;
        if self.parse(&contents)?.contains(&row) {
            return Ok(false)
        }
        let write_err = |source| Error::StoreWrite { path: self.path.clone(), source };
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;
        let mut line = String::new();
        if !contents.is_empty() && !contents.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(&row.render());
        line.push('\n');
        file.write_all(line.as_bytes()).map_err(write_err)?;
        Ok(true)
    }

    /// Removes every row matching exactly. Returns whether the file changed.
    pub fn remove(&mut self, id: usize, address: &Address) -> Result<bool> {
        let target = Row { id, address: address.clone() };
        let contents = self.read()?;

        let mut removed = false;
        let mut kept = String::with_capacity(contents.len());
        for line in contents.lines() {
            let fields = line.split_whitespace().collect::<Vec<_>>();
            let matches = fields.len() == 3
                && fields[0].parse::<usize>().ok() == Some(target.id)
                && fields[1] == target.address.host
                && fields[2].parse::<u16>().ok() == Some(target.address.port);
            if matches {
                removed = true;
            } else {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        if !removed {
            return Ok(false)
        }

        let write_err = |source| Error::StoreWrite { path: self.path.clone(), source };
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, kept).map_err(write_err)?;
        fs::rename(&staging, &self.path).map_err(write_err)?;
        Ok(true)
    }
}
