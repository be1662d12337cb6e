//! Connection-security gate
//!
//! Per-IP connection limiting, per-FD request limiting, a TTL blacklist,
//! and zombie-connection detection. Not internally synchronized — the
//! gate is owned and called exclusively from the reactor thread, per the
//! framework's single-writer connection table discipline.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Outcome of a connect-time decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Accept and register the connection.
    Allow,
    /// Reject; the socket must be closed without further processing.
    Close,
}

/// Outcome of a request-time decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecision {
    /// Continue normal dispatch.
    Allow,
    /// Silently ignore this request; the connection stays open.
    Drop,
    /// Close the connection.
    Close,
}

/// A bad-score reaching this threshold upgrades a `Drop` into a `Close`.
pub const CLOSE_THRESHOLD: u32 = 5;

/// Rate-limiting algorithm, selected per limiter instance.
#[derive(Debug, Clone)]
pub enum RateLimiter {
    /// Reject until a full quiet window has elapsed since the last
    /// threshold breach.
    Cooldown {
        seconds: u64,
        times: u32,
        count: u32,
        last_event: Instant,
        cooling_down: bool,
    },
    /// Counter reset every `seconds` from a fixed window start.
    FixedWindow {
        seconds: u64,
        times: u32,
        count: u32,
        window_start: Instant,
    },
    /// Deque of event timestamps within the trailing `seconds` window.
    SlidingWindow {
        seconds: u64,
        times: u32,
        events: VecDeque<Instant>,
    },
    /// Fractional token bucket, refilled at `times / seconds` per second.
    TokenBucket {
        seconds: u64,
        times: u32,
        tokens: f64,
        last_refill: Instant,
    },
}

impl RateLimiter {
    /// A cooldown limiter, the default for connect-rate limiting.
    pub fn cooldown(times: u32, seconds: u64) -> Self {
        Self::Cooldown {
            seconds,
            times,
            count: 0,
            last_event: Instant::now(),
            cooling_down: false,
        }
    }

    /// A fixed-window limiter.
    pub fn fixed_window(times: u32, seconds: u64) -> Self {
        Self::FixedWindow {
            seconds,
            times,
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// A sliding-window limiter, the default for request-rate limiting.
    pub fn sliding_window(times: u32, seconds: u64) -> Self {
        Self::SlidingWindow {
            seconds,
            times,
            events: VecDeque::new(),
        }
    }

    /// A token-bucket limiter.
    pub fn token_bucket(times: u32, seconds: u64) -> Self {
        Self::TokenBucket {
            seconds,
            times,
            tokens: f64::from(times),
            last_refill: Instant::now(),
        }
    }

    /// Records one event at `now`; returns whether it is allowed.
    pub fn check(&mut self, now: Instant) -> bool {
        match self {
            Self::Cooldown {
                seconds,
                times,
                count,
                last_event,
                cooling_down,
            } => {
                if *cooling_down {
                    if now.duration_since(*last_event) >= Duration::from_secs(*seconds) {
                        *cooling_down = false;
                        *count = 0;
                    } else {
                        *last_event = now;
                        return false;
                    }
                }
                *count += 1;
                *last_event = now;
                if *count > *times {
                    *cooling_down = true;
                    return false;
                }
                true
            }
            Self::FixedWindow {
                seconds,
                times,
                count,
                window_start,
            } => {
                if now.duration_since(*window_start) >= Duration::from_secs(*seconds) {
                    *window_start = now;
                    *count = 0;
                }
                *count += 1;
                *count <= *times
            }
            Self::SlidingWindow {
                seconds,
                times,
                events,
            } => {
                let cutoff = now
                    .checked_sub(Duration::from_secs(*seconds))
                    .unwrap_or(now);
                while matches!(events.front(), Some(t) if *t <= cutoff) {
                    events.pop_front();
                }
                if events.len() as u32 >= *times {
                    return false;
                }
                events.push_back(now);
                true
            }
            Self::TokenBucket {
                seconds,
                times,
                tokens,
                last_refill,
            } => {
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                let refill_rate = f64::from(*times) / *seconds as f64;
                *tokens = (*tokens + elapsed * refill_rate).min(f64::from(*times));
                *last_refill = now;
                if *tokens < 1.0 {
                    return false;
                }
                *tokens -= 1.0;
                true
            }
        }
    }
}

/// Per-connection limiter state tracked for a single live FD.
#[derive(Debug)]
struct ConnectionState {
    request_limiter: RateLimiter,
    path_limiters: HashMap<String, RateLimiter>,
    last_activity: Instant,
}

/// Per-IP state tracked while at least one connection is live, or while
/// the IP is banned.
#[derive(Debug)]
struct IpEntry {
    active_connections: usize,
    connect_limiter: RateLimiter,
    bad_score: u32,
    connections: HashMap<usize, ConnectionState>,
}

/// Per-IP/per-FD connection-security gate.
#[derive(Debug, Default)]
pub struct SecurityGate {
    ips: HashMap<IpAddr, IpEntry>,
    blacklist: HashMap<IpAddr, Option<Instant>>,
    max_per_ip: usize,
    request_times: u32,
    request_secs: u64,
    connection_timeout: Option<Duration>,
}

impl SecurityGate {
    /// Creates a gate with the given connect/request limits.
    pub fn new(
        max_per_ip: usize,
        request_times: u32,
        request_secs: u64,
        connection_timeout: Option<Duration>,
    ) -> Self {
        Self {
            ips: HashMap::new(),
            blacklist: HashMap::new(),
            max_per_ip,
            request_times,
            request_secs,
            connection_timeout,
        }
    }

    /// Connect-time decision: bans, per-IP concurrency cap, then the
    /// connect-rate cooldown limiter.
    pub fn allow_connect(
        &mut self,
        ip: IpAddr,
        fd: usize,
        connect_times: u32,
        connect_secs: u64,
    ) -> ConnectDecision {
        let now = Instant::now();
        if self.is_banned_at(ip, now) {
            return ConnectDecision::Close;
        }

        let entry = self.ips.entry(ip).or_insert_with(|| IpEntry {
            active_connections: 0,
            connect_limiter: RateLimiter::cooldown(connect_times, connect_secs),
            bad_score: 0,
            connections: HashMap::new(),
        });

        if entry.active_connections >= self.max_per_ip {
            return ConnectDecision::Close;
        }

        if !entry.connect_limiter.check(now) {
            entry.bad_score += 1;
            return ConnectDecision::Close;
        }

        entry.active_connections += 1;
        entry.connections.insert(
            fd,
            ConnectionState {
                request_limiter: RateLimiter::sliding_window(self.request_times, self.request_secs),
                path_limiters: HashMap::new(),
                last_activity: now,
            },
        );
        ConnectDecision::Allow
    }

    /// Request-time decision: request-rate limiter, then an optional
    /// per-path limiter, escalating to `Close` once bad-score crosses
    /// [`CLOSE_THRESHOLD`].
    pub fn allow_request(&mut self, ip: IpAddr, fd: usize, path: Option<&str>) -> RequestDecision {
        let now = Instant::now();
        let Some(entry) = self.ips.get_mut(&ip) else {
            return RequestDecision::Close;
        };
        let Some(conn) = entry.connections.get_mut(&fd) else {
            return RequestDecision::Close;
        };
        conn.last_activity = now;

        if !conn.request_limiter.check(now) {
            entry.bad_score += 1;
            return Self::escalate(entry.bad_score);
        }

        if let Some(path) = path {
            let limiter = conn
                .path_limiters
                .entry(path.to_string())
                .or_insert_with(|| RateLimiter::sliding_window(self.request_times, self.request_secs));
            if !limiter.check(now) {
                entry.bad_score += 1;
                return Self::escalate(entry.bad_score);
            }
        }

        RequestDecision::Allow
    }

    fn escalate(bad_score: u32) -> RequestDecision {
        if bad_score >= CLOSE_THRESHOLD {
            RequestDecision::Close
        } else {
            RequestDecision::Drop
        }
    }

    /// Releases per-FD state at close. If the IP's active-connection
    /// count drops to zero and it isn't banned, its entry is collected.
    pub fn clear(&mut self, ip: IpAddr, fd: usize) {
        let Some(entry) = self.ips.get_mut(&ip) else {
            return;
        };
        if entry.connections.remove(&fd).is_some() {
            entry.active_connections = entry.active_connections.saturating_sub(1);
        }
        if entry.active_connections == 0 && !self.blacklist.contains_key(&ip) {
            self.ips.remove(&ip);
        }
    }

    /// Whether `fd`'s connection has been idle longer than the
    /// configured connection timeout; if so the caller must close it.
    pub fn connection_detect(&self, ip: IpAddr, fd: usize) -> bool {
        let Some(timeout) = self.connection_timeout else {
            return false;
        };
        let Some(conn) = self.ips.get(&ip).and_then(|e| e.connections.get(&fd)) else {
            return false;
        };
        Instant::now().duration_since(conn.last_activity) > timeout
    }

    /// Bans `ip`. `seconds = None` bans permanently. A later existing
    /// deadline is kept rather than shortened.
    pub fn ban_ip(&mut self, ip: IpAddr, seconds: Option<u64>) {
        let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
        let keep_existing = match (self.blacklist.get(&ip), deadline) {
            (Some(None), _) => true,
            (Some(Some(existing)), Some(new)) => *existing >= new,
            (Some(Some(_)), None) => false,
            (None, _) => false,
        };
        if !keep_existing {
            self.blacklist.insert(ip, deadline);
        }
    }

    /// Removes a ban, if any.
    pub fn unban_ip(&mut self, ip: IpAddr) {
        self.blacklist.remove(&ip);
    }

    /// Whether `ip` is currently banned.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.is_banned_at(ip, Instant::now())
    }

    fn is_banned_at(&self, ip: IpAddr, now: Instant) -> bool {
        match self.blacklist.get(&ip) {
            Some(None) => true,
            Some(Some(deadline)) => *deadline > now,
            None => false,
        }
    }

    /// Active connection count tracked for `ip`, for tests and metrics.
    pub fn active_connections(&self, ip: IpAddr) -> usize {
        self.ips.get(&ip).map_or(0, |e| e.active_connections)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread::sleep;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn allow_connect_then_clear_keeps_count_balanced() {
        let mut gate = SecurityGate::new(20, 12, 1, None);
        assert_eq!(ConnectDecision::Allow, gate.allow_connect(ip(), 1, 6, 1));
        assert_eq!(1, gate.active_connections(ip()));
        gate.clear(ip(), 1);
        assert_eq!(0, gate.active_connections(ip()));
    }

    #[test]
    fn per_ip_concurrency_cap_closes_excess_connections() {
        let mut gate = SecurityGate::new(1, 12, 1, None);
        assert_eq!(ConnectDecision::Allow, gate.allow_connect(ip(), 1, 6, 1));
        assert_eq!(ConnectDecision::Close, gate.allow_connect(ip(), 2, 6, 1));
    }

    #[test]
    fn banned_ip_is_closed_at_connect() {
        let mut gate = SecurityGate::new(20, 12, 1, None);
        gate.ban_ip(ip(), Some(60));
        assert!(gate.is_banned(ip()));
        assert_eq!(ConnectDecision::Close, gate.allow_connect(ip(), 1, 6, 1));
    }

    #[test]
    fn sliding_window_rejects_fourth_request_within_window() {
        let mut limiter = RateLimiter::sliding_window(3, 1);
        let start = Instant::now();
        assert!(limiter.check(start));
        assert!(limiter.check(start + Duration::from_millis(300)));
        assert!(limiter.check(start + Duration::from_millis(600)));
        assert!(!limiter.check(start + Duration::from_millis(800)));
        assert!(limiter.check(start + Duration::from_millis(1100)));
    }

    #[test]
    fn bad_score_escalates_drop_to_close() {
        let mut gate = SecurityGate::new(20, 0, 1, None);
        gate.allow_connect(ip(), 1, 6, 1);
        let mut last = RequestDecision::Allow;
        for _ in 0..CLOSE_THRESHOLD {
            last = gate.allow_request(ip(), 1, None);
        }
        assert_eq!(RequestDecision::Close, last);
    }

    #[test]
    fn cooldown_rejects_until_a_full_quiet_window_elapses() {
        let mut limiter = RateLimiter::cooldown(2, 1);
        let start = Instant::now();
        assert!(limiter.check(start));
        assert!(limiter.check(start + Duration::from_millis(100)));
        // third connect within the window breaches the threshold and starts cooldown
        assert!(!limiter.check(start + Duration::from_millis(200)));
        // a full quiet window after the breach (each attempt resets the clock), the limiter resets
        assert!(limiter.check(start + Duration::from_millis(1300)));
    }

    #[test]
    fn connection_timeout_flags_idle_connections() {
        let mut gate = SecurityGate::new(20, 12, 1, Some(Duration::from_millis(10)));
        gate.allow_connect(ip(), 1, 6, 1);
        assert!(!gate.connection_detect(ip(), 1));
        sleep(Duration::from_millis(20));
        assert!(gate.connection_detect(ip(), 1));
    }
}
