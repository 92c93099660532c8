use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;

use crate::clock::Timestamp;

/// Work protected by the distributed mutex.
///
/// `enter` runs once this node holds every grant, and returns how long
/// the section is held. `exit` runs when that interval has elapsed, right
/// before the node releases the section and answers deferred requests.
/// Both are called with the node state locked, so they must not block.
pub trait Section: Send + 'static {
    fn enter(&mut self, id: usize, timestamp: Timestamp) -> Duration;
    fn exit(&mut self, id: usize);
}

/// Holds the section for a random duration drawn from `range`.
#[derive(Clone, Debug)]
pub struct Sleep {
    range: RangeInclusive<Duration>,
}

impl Sleep {
    pub fn new(range: RangeInclusive<Duration>) -> Self {
        Sleep { range }
    }
}

impl Default for Sleep {
    fn default() -> Self {
        Sleep::new(Duration::from_secs(3)..=Duration::from_secs(7))
    }
}

impl Section for Sleep {
    fn enter(&mut self, id: usize, timestamp: Timestamp) -> Duration {
        let (start, end) = (*self.range.start(), *self.range.end());
        let hold = if start >= end {
            start
        } else {
            rand::thread_rng().gen_range(start..=end)
        };
        info!("node {} executing critical section at {} for {:?}", id, timestamp, hold);
        hold
    }

    fn exit(&mut self, id: usize) {
        info!("node {} done with critical section", id);
    }
}
