//! Neighbor discovery: advertisement-driven candidate tracking, the
//! High/Low discovery-mode cadence, per-peer connection backoff, and the
//! scoring function that picks whom to connect to next.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mesh_core::{BleAddress, ClusterId, JoinMePayload};

use crate::config::ClusteringConfig;

/// Advertising/scanning cadence. Entered `High` at boot; drops to `Low` after
/// `high_to_low_discovery_time` with no novel neighbor, returns to `High` the
/// instant one is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    High,
    Low,
}

/// The most recent `JoinMe` payload seen from one peer, with the RSSI and
/// timestamp it arrived at. Stale entries are pruned on `decide`.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    payload: JoinMePayload,
    rssi_dbm: i8,
    last_seen: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    next_retry_at: Instant,
    interval: Duration,
}

/// How long a candidate is kept without a fresh advertisement before it is
/// considered gone. Several advertising intervals' worth of slack.
const CANDIDATE_TTL: Duration = Duration::from_secs(5);

pub struct Discovery {
    config: ClusteringConfig,
    mode: DiscoveryMode,
    last_novel_at: Instant,
    candidates: HashMap<BleAddress, Candidate>,
    backoff: HashMap<BleAddress, Backoff>,
}

impl Discovery {
    #[must_use]
    pub fn new(config: ClusteringConfig, now: Instant) -> Self {
        Self {
            config,
            mode: DiscoveryMode::High,
            last_novel_at: now,
            candidates: HashMap::new(),
            backoff: HashMap::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> DiscoveryMode {
        self.mode
    }

    #[must_use]
    pub fn adv_interval(&self) -> Duration {
        match self.mode {
            DiscoveryMode::High => self.config.adv_interval_high,
            DiscoveryMode::Low => self.config.adv_interval_low,
        }
    }

    #[must_use]
    pub fn scan_window_and_interval(&self) -> (Duration, Duration) {
        match self.mode {
            DiscoveryMode::High => (self.config.scan_window_high, self.config.scan_interval_high),
            DiscoveryMode::Low => (self.config.scan_window_low, self.config.scan_interval_low),
        }
    }

    /// Feeds one `AdvertisementReport`. Returns `true` if this peer was not
    /// already a known candidate -- a novel neighbor, which snaps discovery
    /// back to `High` mode.
    pub fn on_advertisement(&mut self, addr: BleAddress, rssi_dbm: i8, payload: JoinMePayload, now: Instant) -> bool {
        let novel = !self.candidates.contains_key(&addr);
        self.candidates.insert(
            addr,
            Candidate {
                payload,
                rssi_dbm,
                last_seen: now,
            },
        );
        if novel {
            self.mode = DiscoveryMode::High;
            self.last_novel_at = now;
        }
        novel
    }

    /// Drops candidates not refreshed within [`CANDIDATE_TTL`] and, if no
    /// novel neighbor has appeared in `high_to_low_discovery_time`, drops
    /// into `Low` mode.
    pub fn prune_and_update_mode(&mut self, now: Instant) {
        self.candidates.retain(|_, c| now.duration_since(c.last_seen) <= CANDIDATE_TTL);
        if self.mode == DiscoveryMode::High
            && now.duration_since(self.last_novel_at) > self.config.high_to_low_discovery_time
        {
            self.mode = DiscoveryMode::Low;
        }
    }

    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// `true` once enough time, or enough distinct candidates, has
    /// accumulated to justify a connect decision.
    #[must_use]
    pub fn should_decide(&self, since_last_decision: Duration) -> bool {
        since_last_decision >= self.config.max_time_until_decision
            || self.candidate_count() >= self.config.num_nodes_for_decision
    }

    /// Records a failed connection attempt against `addr`: backoff starts at
    /// `backoff_initial` and doubles on every consecutive failure, capped at
    /// `backoff_max`.
    pub fn record_attempt_failure(&mut self, addr: BleAddress, now: Instant) {
        let interval = self
            .backoff
            .get(&addr)
            .map_or(self.config.backoff_initial, |b| {
                (b.interval * 2).min(self.config.backoff_max)
            });
        self.backoff.insert(
            addr,
            Backoff {
                next_retry_at: now + interval,
                interval,
            },
        );
    }

    /// Clears backoff state, e.g. once a connection to `addr` succeeds.
    pub fn clear_backoff(&mut self, addr: BleAddress) {
        self.backoff.remove(&addr);
    }

    pub fn forget(&mut self, addr: BleAddress) {
        self.candidates.remove(&addr);
    }

    fn is_backed_off(&self, addr: BleAddress, now: Instant) -> bool {
        self.backoff.get(&addr).is_some_and(|b| now < b.next_retry_at)
    }

    /// Scores every eligible candidate (not backed off, RSSI at or above the
    /// stable-connection threshold) and returns the highest scorer along with
    /// its advertised payload, per the weighted-sum formula in 4.5.
    #[must_use]
    pub fn best_candidate(
        &self,
        self_cluster_id: ClusterId,
        self_cluster_size: i16,
        now: Instant,
    ) -> Option<(BleAddress, JoinMePayload)> {
        self.candidates
            .iter()
            .filter(|(addr, c)| {
                !self.is_backed_off(**addr, now)
                    && c.rssi_dbm >= self.config.stable_connection_rssi_threshold_dbm
            })
            .map(|(addr, c)| (*addr, c, self.score(c, self_cluster_id, self_cluster_size)))
            .max_by_key(|(_, _, score)| *score)
            .map(|(addr, c, _)| (addr, c.payload))
    }

    fn score(&self, candidate: &Candidate, self_cluster_id: ClusterId, self_cluster_size: i16) -> i64 {
        let rssi_term = i64::from(self.config.weight_rssi) * i64::from((i32::from(candidate.rssi_dbm) + 100).max(0));
        let slots_term = i64::from(self.config.weight_free_slots) * i64::from(candidate.payload.free_in_connections);
        let smaller_term = if candidate.payload.cluster_size < self_cluster_size {
            i64::from(self.config.weight_smaller_cluster)
        } else {
            0
        };
        let bigger_id_term = if candidate.payload.cluster_id > self_cluster_id {
            i64::from(self.config.weight_bigger_cluster_id)
        } else {
            0
        };
        slots_term + rssi_term + smaller_term + bigger_id_term
    }
}
