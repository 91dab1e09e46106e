//! Connection monitor — per-link state machine and address blocklist
//!
//! A link enters as Established the moment the transport reports it up and
//! turns Active on its first ANNOUNCE.
//!
//! - a freshly established link must ANNOUNCE within the announce timeout
//!   or its address is blocked
//! - any received packet resets the inactivity timer; silence past the
//!   window blocks the address
//! - five error disconnects within the burst window block the *address*,
//!   outliving any one link
//! - blocklist entries expire on their own after the cool-down
//!
//! Blocking is the system's primary adversarial-resilience mechanism: all
//! per-packet errors are local, but persistent misbehavior escalates here.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Physical link address (e.g. a BLE peripheral address).
pub type LinkAddr = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    /// Connected, no ANNOUNCE seen yet.
    Established,
    /// Announced and exchanging traffic.
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockReason {
    /// No ANNOUNCE within the announce timeout.
    AnnounceTimeout,
    /// No traffic within the inactivity window.
    Inactivity,
    /// Too many error disconnects within the burst window.
    ErrorBurst,
}

#[derive(Debug, Clone)]
struct ConnectionRecord {
    state: LinkState,
    established_at_ms: u64,
    last_announce_at_ms: Option<u64>,
    last_activity_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockEntry {
    pub blocked_until_ms: u64,
    pub reason: BlockReason,
}

/// Snapshot of monitor state for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub links: usize,
    pub active_links: usize,
    pub blocked_addresses: usize,
}

pub struct ConnectionMonitor {
    records: HashMap<LinkAddr, ConnectionRecord>,
    /// Error-disconnect timestamps per address; survives link teardown.
    error_history: HashMap<LinkAddr, VecDeque<u64>>,
    blocklist: HashMap<LinkAddr, BlockEntry>,

    announce_timeout_ms: u64,
    inactivity_timeout_ms: u64,
    burst_threshold: usize,
    burst_window_ms: u64,
    block_duration_ms: u64,
}

impl ConnectionMonitor {
    pub fn new(
        announce_timeout_ms: u64,
        inactivity_timeout_ms: u64,
        burst_threshold: usize,
        burst_window_ms: u64,
        block_duration_ms: u64,
    ) -> Self {
        Self {
            records: HashMap::new(),
            error_history: HashMap::new(),
            blocklist: HashMap::new(),
            announce_timeout_ms,
            inactivity_timeout_ms,
            burst_threshold: burst_threshold.max(1),
            burst_window_ms,
            block_duration_ms,
        }
    }

    /// Consulted before accepting or initiating any connection. Expired
    /// entries are purged here, returning the address to service with no
    /// further action.
    pub fn is_blocked(&mut self, address: &str, now_ms: u64) -> bool {
        match self.blocklist.get(address) {
            Some(entry) if now_ms < entry.blocked_until_ms => true,
            Some(_) => {
                self.blocklist.remove(address);
                false
            }
            None => false,
        }
    }

    /// A link finished connecting. Returns false (and records nothing) when
    /// the address is blocked and must be refused.
    pub fn link_established(&mut self, address: &str, now_ms: u64) -> bool {
        if self.is_blocked(address, now_ms) {
            return false;
        }
        self.records.insert(
            address.to_string(),
            ConnectionRecord {
                state: LinkState::Established,
                established_at_ms: now_ms,
                last_announce_at_ms: None,
                last_activity_ms: now_ms,
            },
        );
        true
    }

    /// ANNOUNCE received: cancels the announce timer, link goes Active.
    pub fn on_announce(&mut self, address: &str, now_ms: u64) {
        if let Some(record) = self.records.get_mut(address) {
            record.state = LinkState::Active;
            record.last_announce_at_ms = Some(now_ms);
            record.last_activity_ms = now_ms;
        }
    }

    /// Any packet, any type: resets the inactivity timer.
    pub fn on_activity(&mut self, address: &str, now_ms: u64) {
        if let Some(record) = self.records.get_mut(address) {
            record.last_activity_ms = now_ms;
        }
    }

    /// Link torn down. Error teardowns count toward the address's burst
    /// window; crossing the threshold blocks the address itself.
    pub fn link_closed(
        &mut self,
        address: &str,
        error: bool,
        now_ms: u64,
    ) -> Option<BlockReason> {
        self.records.remove(address);
        if !error {
            return None;
        }
        let history = self.error_history.entry(address.to_string()).or_default();
        history.push_back(now_ms);
        while let Some(oldest) = history.front() {
            if now_ms.saturating_sub(*oldest) >= self.burst_window_ms {
                history.pop_front();
            } else {
                break;
            }
        }
        if history.len() >= self.burst_threshold {
            history.clear();
            self.block(address, BlockReason::ErrorBurst, now_ms);
            return Some(BlockReason::ErrorBurst);
        }
        None
    }

    /// Evaluate announce/inactivity timeouts. Returns the addresses newly
    /// blocked; the caller is responsible for disconnecting their links.
    pub fn tick(&mut self, now_ms: u64) -> Vec<(LinkAddr, BlockReason)> {
        let mut blocked = Vec::new();
        for (address, record) in &self.records {
            let reason = match record.state {
                LinkState::Established
                    if now_ms.saturating_sub(record.established_at_ms)
                        >= self.announce_timeout_ms =>
                {
                    Some(BlockReason::AnnounceTimeout)
                }
                _ if now_ms.saturating_sub(record.last_activity_ms)
                    >= self.inactivity_timeout_ms =>
                {
                    Some(BlockReason::Inactivity)
                }
                _ => None,
            };
            if let Some(reason) = reason {
                blocked.push((address.clone(), reason));
            }
        }
        for (address, reason) in &blocked {
            self.records.remove(address);
            self.block(address, *reason, now_ms);
        }
        blocked
    }

    pub fn link_state(&self, address: &str) -> Option<LinkState> {
        self.records.get(address).map(|r| r.state)
    }

    pub fn blocked_until(&self, address: &str) -> Option<u64> {
        self.blocklist.get(address).map(|e| e.blocked_until_ms)
    }

    pub fn report(&self) -> MonitorReport {
        MonitorReport {
            links: self.records.len(),
            active_links: self
                .records
                .values()
                .filter(|r| r.state == LinkState::Active)
                .count(),
            blocked_addresses: self.blocklist.len(),
        }
    }

    fn block(&mut self, address: &str, reason: BlockReason, now_ms: u64) {
        tracing::warn!(address, ?reason, "blocking address");
        self.blocklist.insert(
            address.to_string(),
            BlockEntry {
                blocked_until_ms: now_ms + self.block_duration_ms,
                reason,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ConnectionMonitor {
        // announce 15s, inactivity 60s, 5 errors / 5min, block 15min
        ConnectionMonitor::new(15_000, 60_000, 5, 300_000, 900_000)
    }

    #[test]
    fn test_announce_timeout_blocks() {
        let mut mon = monitor();
        assert!(mon.link_established("aa:bb", 0));
        assert_eq!(mon.link_state("aa:bb"), Some(LinkState::Established));

        assert!(mon.tick(10_000).is_empty());
        let blocked = mon.tick(15_000);
        assert_eq!(blocked, vec![("aa:bb".to_string(), BlockReason::AnnounceTimeout)]);
        assert!(mon.is_blocked("aa:bb", 16_000));
    }

    #[test]
    fn test_announce_cancels_timer() {
        let mut mon = monitor();
        mon.link_established("aa:bb", 0);
        mon.on_announce("aa:bb", 5_000);
        assert_eq!(mon.link_state("aa:bb"), Some(LinkState::Active));

        assert!(mon.tick(20_000).is_empty());
    }

    #[test]
    fn test_inactivity_blocks() {
        let mut mon = monitor();
        mon.link_established("aa:bb", 0);
        mon.on_announce("aa:bb", 1_000);
        mon.on_activity("aa:bb", 30_000);

        // 60s of silence measured from the last packet
        assert!(mon.tick(80_000).is_empty());
        let blocked = mon.tick(90_000);
        assert_eq!(blocked, vec![("aa:bb".to_string(), BlockReason::Inactivity)]);
    }

    #[test]
    fn test_activity_resets_inactivity_timer() {
        let mut mon = monitor();
        mon.link_established("aa:bb", 0);
        mon.on_announce("aa:bb", 1_000);

        for t in (10_000..200_000).step_by(30_000) {
            mon.on_activity("aa:bb", t);
            assert!(mon.tick(t + 29_000).is_empty());
        }
    }

    #[test]
    fn test_error_burst_blocks_address() {
        let mut mon = monitor();
        for i in 0..4 {
            mon.link_established("aa:bb", i * 1_000);
            assert_eq!(mon.link_closed("aa:bb", true, i * 1_000 + 500), None);
        }
        mon.link_established("aa:bb", 10_000);
        let reason = mon.link_closed("aa:bb", true, 10_500);
        assert_eq!(reason, Some(BlockReason::ErrorBurst));
        assert!(mon.is_blocked("aa:bb", 11_000));
    }

    #[test]
    fn test_error_burst_window_slides() {
        let mut mon = monitor();
        // Five errors, but spread wider than the 5-minute window
        for i in 0..5u64 {
            mon.link_established("aa:bb", i * 200_000);
            assert_eq!(
                mon.link_closed("aa:bb", true, i * 200_000 + 100),
                None,
                "error {i} should not block yet"
            );
        }
        assert!(!mon.is_blocked("aa:bb", 1_000_000));
    }

    #[test]
    fn test_clean_close_does_not_count() {
        let mut mon = monitor();
        for i in 0..10 {
            mon.link_established("aa:bb", i * 1_000);
            assert_eq!(mon.link_closed("aa:bb", false, i * 1_000 + 500), None);
        }
        assert!(!mon.is_blocked("aa:bb", 20_000));
    }

    #[test]
    fn test_blocked_address_refused() {
        let mut mon = monitor();
        mon.link_established("aa:bb", 0);
        mon.tick(15_000); // announce timeout

        assert!(!mon.link_established("aa:bb", 16_000));
        assert!(mon.link_state("aa:bb").is_none());
    }

    #[test]
    fn test_block_expires_after_cooldown() {
        let mut mon = monitor();
        mon.link_established("aa:bb", 0);
        mon.tick(15_000);
        let until = mon.blocked_until("aa:bb").unwrap();
        assert_eq!(until, 15_000 + 900_000);

        assert!(mon.is_blocked("aa:bb", until - 1));
        assert!(!mon.is_blocked("aa:bb", until));
        // Expired entry purged; connection accepted again
        assert!(mon.link_established("aa:bb", until + 1));
    }

    #[test]
    fn test_report_counts() {
        let mut mon = monitor();
        mon.link_established("a", 0);
        mon.link_established("b", 0);
        mon.on_announce("a", 100);

        let report = mon.report();
        assert_eq!(report.links, 2);
        assert_eq!(report.active_links, 1);
        assert_eq!(report.blocked_addresses, 0);
    }
}
