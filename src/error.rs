//! # Summary
//!
//! Errors surfaced by the node. Only the `Store*` and `Bind` variants are
//! fatal, and only at startup; everything else is logged by whoever
//! received it and the node keeps running.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not read membership store at {path}: {source}")]
    StoreRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not write membership store at {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed row {line} in membership store {path}: {row:?}")]
    StoreRow {
        path: PathBuf,
        line: usize,
        row: String,
    },

    #[error("membership store {path} has no entry for node {id}")]
    MissingSelf {
        path: PathBuf,
        id: usize,
    },

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("malformed message {0:?}")]
    Parse(String),

    #[error("node {0} is not a member")]
    UnknownPeer(usize),

    #[error("timed out talking to {0}")]
    Timeout(String),

    #[error("connection to {addr} failed: {source}")]
    Unreachable {
        addr: String,
        source: std::io::Error,
    },

    #[error("{0} closed the connection without replying")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
