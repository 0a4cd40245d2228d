//! Address book for peer discovery
//!
//! Keeps two tables of candidate peer addresses:
//! - New: heard about via ADDR or configuration, never connected
//! - Tried: completed at least one handshake with us
//!
//! Outbound selection prefers tried addresses; feelers draw from new only
//! so unverified addresses get a chance to be promoted.
//!
//! Both tables are bounded. A full new table evicts a terrible entry, or the
//! one advertised longest ago; a full tried table demotes the entry whose
//! last success is oldest back to new.

use crate::network::protocol::{
    NetworkAddress, TimestampedAddress, MAX_ADDR_SIZE, MAX_NEW_ADDRESSES, MAX_TRIED_ADDRESSES,
};
use crate::util::SharedClock;
use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// New-table addresses not refreshed for this long are dropped (30 days)
const STALE_AFTER_SECS: i64 = 30 * 24 * 60 * 60;

/// Failed connections before an address is considered terrible
const MAX_FAILURES: u32 = 10;

/// Minimum time between attempts to the same address
const RETRY_COOLDOWN_SECS: i64 = 10 * 60;

/// Attempt count after which the cooldown no longer applies
const COOLDOWN_BYPASS_ATTEMPTS: u32 = 30;

/// Percentage of selections drawn from the tried table
const TRIED_SELECTION_PERCENT: u32 = 80;

/// Random draws per table before falling back to any entry
const MAX_SELECT_CHECKS: usize = 64;

pub const PEERS_FILE: &str = "peers.json";

#[derive(Error, Debug)]
pub enum AddrManError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

// =============================================================================
// Address Entry
// =============================================================================

/// Address with connection history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddrInfo {
    pub address: NetworkAddress,
    /// Last time the address was advertised (seconds)
    pub timestamp: u32,
    /// Last connection attempt (seconds, zero if never)
    pub last_try: i64,
    /// Last successful handshake (seconds, zero if never)
    pub last_success: i64,
    pub attempts: u32,
    pub failures: u32,
    pub tried: bool,
}

impl AddrInfo {
    pub fn new(address: NetworkAddress, timestamp: u32) -> Self {
        Self {
            address,
            timestamp,
            last_try: 0,
            last_success: 0,
            attempts: 0,
            failures: 0,
            tried: false,
        }
    }

    pub fn is_stale(&self, now: i64) -> bool {
        now - self.timestamp as i64 > STALE_AFTER_SECS
    }

    /// Too many failures, or never worked and not heard of for a month
    pub fn is_terrible(&self, now: i64) -> bool {
        if self.failures >= MAX_FAILURES {
            return true;
        }
        !self.tried && self.is_stale(now)
    }

    /// Relative selection weight in (0, 1]
    pub fn chance(&self, now: i64) -> f64 {
        let mut chance = 1.0;
        if self.last_try > 0 && now - self.last_try < RETRY_COOLDOWN_SECS {
            chance *= 0.01;
        }
        chance * 0.66_f64.powi(self.failures.min(8) as i32)
    }

    fn retry_allowed(&self, now: i64) -> bool {
        self.last_try == 0
            || now - self.last_try >= RETRY_COOLDOWN_SECS
            || self.attempts >= COOLDOWN_BYPASS_ATTEMPTS
    }
}

#[derive(Serialize, Deserialize, Default)]
struct AddrFile {
    tried: Vec<AddrInfo>,
    new: Vec<AddrInfo>,
}

// =============================================================================
// Address Book
// =============================================================================

pub struct AddressBook {
    new: HashMap<String, AddrInfo>,
    tried: HashMap<String, AddrInfo>,
    clock: SharedClock,
    /// Reject private/loopback addresses
    routable_only: bool,
}

impl AddressBook {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            new: HashMap::new(),
            tried: HashMap::new(),
            clock,
            routable_only: true,
        }
    }

    /// Accept private and loopback addresses (regtest, in-process networks)
    pub fn allow_private(mut self, allow: bool) -> Self {
        self.routable_only = !allow;
        self
    }

    pub fn size(&self) -> usize {
        self.new.len() + self.tried.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn new_count(&self) -> usize {
        self.new.len()
    }

    pub fn tried_count(&self) -> usize {
        self.tried.len()
    }

    pub fn get(&self, addr: &NetworkAddress) -> Option<&AddrInfo> {
        let key = addr.key();
        self.tried.get(&key).or_else(|| self.new.get(&key))
    }

    pub fn contains(&self, addr: &NetworkAddress) -> bool {
        self.get(addr).is_some()
    }

    fn entry_mut(&mut self, key: &str) -> Option<&mut AddrInfo> {
        match self.tried.get_mut(key) {
            Some(info) => Some(info),
            None => self.new.get_mut(key),
        }
    }

    /// Insert into the new table. Returns false if the address was already
    /// known (its timestamp is refreshed) or is not acceptable.
    pub fn add(&mut self, addr: NetworkAddress, timestamp: u32) -> bool {
        let now = self.clock.now();
        let timestamp = if timestamp == 0 { now as u32 } else { timestamp };
        let key = addr.key();

        if let Some(existing) = self.entry_mut(&key) {
            if timestamp > existing.timestamp {
                existing.timestamp = timestamp;
            }
            return false;
        }

        if addr.is_null() || (self.routable_only && !addr.is_routable()) {
            return false;
        }

        let info = AddrInfo::new(addr, timestamp);
        if info.is_terrible(now) {
            return false;
        }
        if self.new.len() >= MAX_NEW_ADDRESSES {
            self.evict_new(now);
        }
        self.new.insert(key, info);
        true
    }

    /// Drop one new-table entry: a terrible one if any, else the oldest
    fn evict_new(&mut self, now: i64) {
        let victim = self
            .new
            .iter()
            .min_by_key(|(_, info)| (!info.is_terrible(now), info.timestamp))
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            log::trace!("New table full, evicting {}", key);
            self.new.remove(&key);
        }
    }

    /// Move the tried entry with the oldest success back to new
    fn evict_tried(&mut self, now: i64) {
        let victim = self
            .tried
            .iter()
            .min_by_key(|(_, info)| info.last_success)
            .map(|(key, _)| key.clone());
        let Some(mut info) = victim.and_then(|key| self.tried.remove(&key)) else {
            return;
        };
        info.tried = false;
        if self.new.len() >= MAX_NEW_ADDRESSES {
            self.evict_new(now);
        }
        log::trace!("Tried table full, demoting {}", info.address.key());
        self.new.insert(info.address.key(), info);
    }

    /// Insert addresses from an ADDR message
    pub fn add_many(&mut self, addrs: &[TimestampedAddress]) -> usize {
        addrs
            .iter()
            .take(MAX_ADDR_SIZE)
            .filter(|ts| self.add(ts.address, ts.timestamp))
            .count()
    }

    /// Record a dial attempt
    pub fn attempt(&mut self, addr: &NetworkAddress) {
        let now = self.clock.now();
        if let Some(info) = self.entry_mut(&addr.key()) {
            info.last_try = now;
            info.attempts = info.attempts.saturating_add(1);
        }
    }

    /// Record a completed handshake: promote to tried and reset failures
    pub fn good(&mut self, addr: &NetworkAddress) {
        let now = self.clock.now();
        let key = addr.key();

        if let Some(mut info) = self.new.remove(&key) {
            info.tried = true;
            info.last_success = now;
            info.attempts = 0;
            info.failures = 0;
            if self.tried.len() >= MAX_TRIED_ADDRESSES {
                self.evict_tried(now);
            }
            log::debug!("Address {} moved to tried ({} new, {} tried)", key, self.new.len(), self.tried.len() + 1);
            self.tried.insert(key, info);
            return;
        }

        match self.tried.get_mut(&key) {
            Some(info) => {
                info.last_success = now;
                info.attempts = 0;
                info.failures = 0;
            }
            None => log::debug!("good() for unknown address {}", key),
        }
    }

    /// Record a failed connection. Tried entries that keep failing are
    /// demoted to new; nothing is removed here.
    pub fn failed(&mut self, addr: &NetworkAddress) {
        let now = self.clock.now();
        let key = addr.key();

        if let Some(info) = self.new.get_mut(&key) {
            info.failures = info.failures.saturating_add(1);
            return;
        }

        let demote = match self.tried.get_mut(&key) {
            Some(info) => {
                info.failures = info.failures.saturating_add(1);
                info.failures >= MAX_FAILURES
            }
            None => false,
        };
        if demote {
            if let Some(mut info) = self.tried.remove(&key) {
                info.tried = false;
                if self.new.len() >= MAX_NEW_ADDRESSES {
                    self.evict_new(now);
                }
                log::debug!("Address {} demoted to new after {} failures", key, info.failures);
                self.new.insert(key, info);
            }
        }
    }

    fn pick(table: &HashMap<String, AddrInfo>, now: i64, rng: &mut impl Rng) -> Option<NetworkAddress> {
        for _ in 0..table.len().min(MAX_SELECT_CHECKS) {
            let info = table.values().choose(rng)?;
            if info.retry_allowed(now) && rng.gen::<f64>() < info.chance(now) {
                return Some(info.address);
            }
        }
        table.values().choose(rng).map(|info| info.address)
    }

    /// Choose an address for an outbound connection
    pub fn select(&self) -> Option<NetworkAddress> {
        let mut rng = rand::thread_rng();
        let now = self.clock.now();

        let use_tried = !self.tried.is_empty()
            && (self.new.is_empty() || rng.gen_range(0..100) < TRIED_SELECTION_PERCENT);

        if use_tried {
            return Self::pick(&self.tried, now, &mut rng);
        }
        Self::pick(&self.new, now, &mut rng)
    }

    /// Choose an unverified address for a feeler connection
    pub fn select_new_for_feeler(&self) -> Option<NetworkAddress> {
        let mut rng = rand::thread_rng();
        self.new.values().choose(&mut rng).map(|info| info.address)
    }

    /// Addresses for an ADDR reply: tried first, then new, shuffled
    pub fn get_addresses(&self, max_count: usize) -> Vec<TimestampedAddress> {
        let now = self.clock.now();
        let max_count = max_count.min(MAX_ADDR_SIZE);

        let mut result: Vec<TimestampedAddress> = self
            .tried
            .values()
            .chain(self.new.values())
            .filter(|info| !info.is_terrible(now))
            .take(max_count)
            .map(|info| TimestampedAddress::new(info.timestamp, info.address))
            .collect();

        result.shuffle(&mut rand::thread_rng());
        result
    }

    /// Drop stale or terrible entries from the new table. Tried entries are
    /// kept; they worked before.
    pub fn cleanup_stale(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.new.len();
        self.new
            .retain(|_, info| !info.is_stale(now) && !info.is_terrible(now));
        let removed = before - self.new.len();
        if removed > 0 {
            log::debug!("Removed {} stale addresses", removed);
        }
        removed
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn save(&self, path: &Path) -> Result<(), AddrManError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let data = AddrFile {
            tried: self.tried.values().cloned().collect(),
            new: self.new.values().cloned().collect(),
        };

        let temp_path = path.with_extension("json.tmp");
        let file = fs::File::create(&temp_path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &data)?;
        fs::rename(&temp_path, path)?;

        log::debug!("Saved {} addresses to {}", self.size(), path.display());
        Ok(())
    }

    /// Replace the tables with the contents of `path`. A missing file leaves
    /// the book empty.
    pub fn load(&mut self, path: &Path) -> Result<usize, AddrManError> {
        if !path.exists() {
            return Ok(0);
        }
        let file = fs::File::open(path)?;
        let data: AddrFile = serde_json::from_reader(BufReader::new(file))?;

        self.tried = data
            .tried
            .into_iter()
            .take(MAX_TRIED_ADDRESSES)
            .map(|mut info| {
                info.tried = true;
                (info.address.key(), info)
            })
            .collect();
        self.new = data
            .new
            .into_iter()
            .map(|mut info| {
                info.tried = false;
                (info.address.key(), info)
            })
            .filter(|(key, _)| !self.tried.contains_key(key))
            .take(MAX_NEW_ADDRESSES)
            .collect();

        log::info!(
            "Loaded {} addresses ({} tried, {} new) from {}",
            self.size(),
            self.tried.len(),
            self.new.len(),
            path.display()
        );
        Ok(self.size())
    }
}

// =============================================================================
// Tests
// =============================================================================
