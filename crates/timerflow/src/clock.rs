//! Per-cluster notion of "now".
//!
//! Every staleness decision reads time through a [`ShardClock`] rather than the
//! system clock. The current cluster's time comes from an injectable
//! [`TimeSource`]; remote clusters' times are the last values observed through
//! replication, so a standby executor measures lag against the active cluster's
//! progress instead of its own wall clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use time::OffsetDateTime;

/// Source of the current wall-clock time.
pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;
}

/// Reads `OffsetDateTime::now_utc()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A time source that only moves when told to.
///
/// # Example
///
/// ```
/// use time::{Duration, OffsetDateTime};
/// use timerflow::clock::{ManualTimeSource, TimeSource};
///
/// let source = ManualTimeSource::new(OffsetDateTime::UNIX_EPOCH);
/// source.advance(Duration::seconds(30));
/// assert_eq!(source.now(), OffsetDateTime::UNIX_EPOCH + Duration::seconds(30));
/// ```
#[derive(Debug)]
pub struct ManualTimeSource {
    current: Mutex<OffsetDateTime>,
}

impl ManualTimeSource {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Set the current time. Moving backwards is allowed.
    pub fn update(&self, now: OffsetDateTime) {
        *lock(&self.current) = now;
    }

    /// Move the current time forward by `delta`.
    pub fn advance(&self, delta: time::Duration) {
        let mut current = lock(&self.current);
        *current += delta;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> OffsetDateTime {
        *lock(&self.current)
    }
}

/// Per-shard clock keyed by cluster name.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use time::{Duration, OffsetDateTime};
/// use timerflow::clock::{ManualTimeSource, ShardClock};
///
/// let local = Arc::new(ManualTimeSource::new(OffsetDateTime::UNIX_EPOCH));
/// let clock = ShardClock::new("active", local.clone());
///
/// // Remote time defaults to local until replication reports progress.
/// assert_eq!(clock.now("standby"), OffsetDateTime::UNIX_EPOCH);
///
/// clock.set_current_time("standby", OffsetDateTime::UNIX_EPOCH - Duration::minutes(5));
/// assert_eq!(clock.now("standby"), OffsetDateTime::UNIX_EPOCH - Duration::minutes(5));
/// ```
pub struct ShardClock {
    current_cluster: String,
    source: Arc<dyn TimeSource>,
    remote: Mutex<HashMap<String, OffsetDateTime>>,
}

impl ShardClock {
    pub fn new(current_cluster: impl Into<String>, source: Arc<dyn TimeSource>) -> Self {
        Self {
            current_cluster: current_cluster.into(),
            source,
            remote: Mutex::new(HashMap::new()),
        }
    }

    /// Clock backed by the system time.
    pub fn system(current_cluster: impl Into<String>) -> Self {
        Self::new(current_cluster, Arc::new(SystemTimeSource))
    }

    /// Name of the cluster this shard runs in.
    pub fn current_cluster(&self) -> &str {
        &self.current_cluster
    }

    /// Current time as seen from `cluster`.
    pub fn now(&self, cluster: &str) -> OffsetDateTime {
        if cluster == self.current_cluster {
            return self.source.now();
        }
        match lock(&self.remote).get(cluster) {
            Some(observed) => *observed,
            None => self.source.now(),
        }
    }

    /// Record time observed for a remote cluster.
    ///
    /// Remote time only moves forward; updates for the current cluster are
    /// ignored because its time always comes from the local source.
    pub fn set_current_time(&self, cluster: &str, now: OffsetDateTime) {
        if cluster == self.current_cluster {
            return;
        }
        let mut remote = lock(&self.remote);
        let entry = remote.entry(cluster.to_string()).or_insert(now);
        if now > *entry {
            *entry = now;
        }
    }
}

impl std::fmt::Debug for ShardClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardClock")
            .field("current_cluster", &self.current_cluster)
            .finish_non_exhaustive()
    }
}

// A poisoned lock only means another thread panicked mid-update of a plain
// timestamp, which is still a valid value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
