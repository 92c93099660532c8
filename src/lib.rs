#[macro_use] extern crate derivative;
#[macro_use] extern crate log;

mod clock;
mod config;
mod error;
mod membership;
mod message;
mod node;
mod shared;
mod socket;
mod state;
mod storage;
mod thread;

pub use crate::clock::{Clock, Timestamp};
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::membership::{Address, Admission, Membership};
pub use crate::message::Message;
pub use crate::node::Node;
pub use crate::shared::Snapshot;
pub use crate::state::{Section, Sleep};
pub use crate::storage::{Row, Storage};
