//! Per-address ban state machine.
//!
//! Every request from an address is fed through [`BanEngine::should_allow`].
//! Requests are counted inside a detection window (`find_time`) anchored at
//! the first request of the window; once `max_retry` is reached the address
//! is banned for `ban_time`, anchored at the moment the ban started.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};

/// Thresholds for the ban state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanConfig {
    /// Requests inside one window that trigger a ban.
    pub max_retry: u32,
    /// Length of the detection window.
    pub find_time: Duration,
    /// How long a ban lasts.
    pub ban_time: Duration,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            max_retry: 4,
            find_time: Duration::from_secs(600),    // 10 minutes
            ban_time: Duration::from_secs(3 * 3600), // 3 hours
        }
    }
}

/// Tracked state of one client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpState {
    /// Start of the current window, or start of the current ban.
    pub last_seen: DateTime<Utc>,
    /// Requests seen since `last_seen`.
    pub count: u32,
    /// Whether the address is banned.
    pub denied: bool,
}

impl IpState {
    const fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            last_seen: now,
            count: 1,
            denied: false,
        }
    }
}

/// What a single request did to an address's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    FirstSeen,
    Counted,
    WindowExpired,
    Banned,
    StillBanned,
    BanExpired,
}

impl Transition {
    const fn allows(self) -> bool {
        !matches!(self, Self::Banned | Self::StillBanned)
    }
}

/// The single source of truth for whether an address may be served.
#[derive(Debug)]
pub struct BanEngine {
    /// Thresholds.
    config: BanConfig,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// State per observed address.
    states: Mutex<HashMap<String, IpState>>,
}

impl BanEngine {
    /// Create an engine driven by the system clock.
    #[must_use]
    pub fn new(config: BanConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an engine driven by the given clock.
    #[must_use]
    pub fn with_clock(config: BanConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Create an engine seeded with previously persisted states.
    #[must_use]
    pub fn with_states<I>(config: BanConfig, clock: Arc<dyn Clock>, states: I) -> Self
    where
        I: IntoIterator<Item = (String, IpState)>,
    {
        let states: HashMap<_, _> = states.into_iter().collect();
        info!(restored = states.len(), "Ban engine seeded with persisted state");
        Self {
            config,
            clock,
            states: Mutex::new(states),
        }
    }

    /// Record a request from `addr` at the current time and decide whether to
    /// serve it.
    pub fn should_allow(&self, addr: &str) -> bool {
        self.should_allow_at(addr, self.clock.now())
    }

    /// Record a request from `addr` at `now` and decide whether to serve it.
    pub fn should_allow_at(&self, addr: &str, now: DateTime<Utc>) -> bool {
        let (transition, state) = {
            let mut states = self.states.lock();
            match states.get_mut(addr) {
                None => {
                    let state = IpState::fresh(now);
                    states.insert(addr.to_string(), state);
                    (Transition::FirstSeen, state)
                }
                Some(state) => {
                    let transition = self.advance(state, now);
                    (transition, *state)
                }
            }
        };

        match transition {
            Transition::Banned => info!(
                ip = %addr,
                count = state.count,
                ban_time_secs = self.config.ban_time.as_secs(),
                "Address banned"
            ),
            Transition::BanExpired => info!(ip = %addr, "Ban expired, address allowed again"),
            Transition::StillBanned => {
                debug!(ip = %addr, count = state.count, "Rejecting banned address");
            }
            Transition::FirstSeen | Transition::Counted | Transition::WindowExpired => {
                debug!(ip = %addr, count = state.count, "Request allowed");
            }
        }

        transition.allows()
    }

    fn advance(&self, state: &mut IpState, now: DateTime<Utc>) -> Transition {
        if state.denied {
            if within(now, state.last_seen, self.config.ban_time) {
                state.count = state.count.saturating_add(1);
                return Transition::StillBanned;
            }
            *state = IpState::fresh(now);
            return Transition::BanExpired;
        }

        if !within(now, state.last_seen, self.config.find_time) {
            *state = IpState::fresh(now);
            return Transition::WindowExpired;
        }

        let count = state.count.saturating_add(1);
        if count >= self.config.max_retry {
            *state = IpState {
                last_seen: now,
                count,
                denied: true,
            };
            Transition::Banned
        } else {
            state.count = count;
            Transition::Counted
        }
    }

    /// Visit every active ban as `(address, banned_since, banned_until)`.
    ///
    /// The map is copied under the lock and the callback runs after it is
    /// released, so the callback may call back into the engine.
    pub fn range_blocks<F>(&self, mut f: F)
    where
        F: FnMut(&str, DateTime<Utc>, DateTime<Utc>),
    {
        let now = self.clock.now();
        let active: Vec<(String, DateTime<Utc>, DateTime<Utc>)> = self
            .states
            .lock()
            .iter()
            .filter(|(_, state)| state.denied)
            .map(|(addr, state)| {
                let until = deadline(state.last_seen, self.config.ban_time)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                (addr.clone(), state.last_seen, until)
            })
            .filter(|(_, _, until)| now < *until)
            .collect();

        for (addr, since, until) in &active {
            f(addr, *since, *until);
        }
    }

    /// Copy of every tracked state, sorted by address.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, IpState)> {
        let mut rows: Vec<_> = self
            .states
            .lock()
            .iter()
            .map(|(addr, state)| (addr.clone(), *state))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Current state of one address.
    #[must_use]
    pub fn state(&self, addr: &str) -> Option<IpState> {
        self.states.lock().get(addr).copied()
    }

    /// Number of tracked addresses.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.states.lock().len()
    }

    /// The thresholds this engine was built with.
    #[must_use]
    pub const fn config(&self) -> &BanConfig {
        &self.config
    }
}

fn deadline(start: DateTime<Utc>, length: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(length)
        .ok()
        .and_then(|length| start.checked_add_signed(length))
}

/// `now < start + length`, where an unrepresentable end lies in the future.
fn within(now: DateTime<Utc>, start: DateTime<Utc>, length: Duration) -> bool {
    deadline(start, length).is_none_or(|end| now < end)
}
