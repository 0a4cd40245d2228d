//! Ban and discouragement registry
//!
//! Two independent lists keyed by IP address:
//! - Banned: operator-issued, optionally permanent, persisted to `banlist.json`
//! - Discouraged: automatic, ~24h, in memory only
//!
//! The whitelist is consulted at admission only; it never changes what the
//! two lists record.

use crate::util::SharedClock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How long a misbehaving address stays discouraged (seconds)
pub const DISCOURAGEMENT_DURATION: i64 = 24 * 60 * 60;

/// Upper bound on the discouraged list
pub const MAX_DISCOURAGED: usize = 10_000;

pub const BANLIST_FILE: &str = "banlist.json";

#[derive(Error, Debug)]
pub enum BanError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Persisted ban record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub create_time: i64,
    /// Zero means permanent
    pub ban_until: i64,
}

impl BanEntry {
    pub fn is_permanent(&self) -> bool {
        self.ban_until == 0
    }

    pub fn is_expired(&self, now: i64) -> bool {
        !self.is_permanent() && now >= self.ban_until
    }
}

/// Banned and discouraged addresses
pub struct BanRegistry {
    banned: BTreeMap<String, BanEntry>,
    /// Address -> expiry (seconds)
    discouraged: HashMap<String, i64>,
    whitelist: HashSet<String>,
    clock: SharedClock,
    data_dir: Option<PathBuf>,
    auto_save: bool,
}

fn key(addr: &IpAddr) -> String {
    addr.to_string()
}

impl BanRegistry {
    /// In-memory registry; `save`/`load` are no-ops
    pub fn new(clock: SharedClock) -> Self {
        Self {
            banned: BTreeMap::new(),
            discouraged: HashMap::new(),
            whitelist: HashSet::new(),
            clock,
            data_dir: None,
            auto_save: false,
        }
    }

    /// Registry backed by `<data_dir>/banlist.json`. Nothing is read until
    /// [`BanRegistry::load`] is called.
    pub fn with_data_dir(clock: SharedClock, data_dir: impl AsRef<Path>, auto_save: bool) -> Self {
        let mut registry = Self::new(clock);
        registry.data_dir = Some(data_dir.as_ref().to_path_buf());
        registry.auto_save = auto_save;
        registry
    }

    fn banlist_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(BANLIST_FILE))
    }

    fn persist(&mut self) {
        if self.auto_save {
            if let Err(e) = self.save() {
                log::error!("Failed to save ban list: {}", e);
            }
        }
    }

    // =========================================================================
    // Bans
    // =========================================================================

    /// Ban an address for `duration_secs`, or permanently when zero.
    /// Re-banning replaces the previous entry.
    pub fn ban(&mut self, addr: &IpAddr, duration_secs: i64) {
        let addr = key(addr);
        let now = self.clock.now();
        let ban_until = if duration_secs > 0 { now + duration_secs } else { 0 };
        self.banned.insert(
            addr.clone(),
            BanEntry {
                create_time: now,
                ban_until,
            },
        );

        if ban_until == 0 {
            log::warn!("Permanently banned {}", addr);
        } else {
            log::warn!("Banned {} until {} ({}s)", addr, ban_until, duration_secs);
        }
        self.persist();
    }

    pub fn unban(&mut self, addr: &IpAddr) -> bool {
        let removed = self.banned.remove(&key(addr)).is_some();
        if removed {
            log::info!("Unbanned {}", addr);
            self.persist();
        }
        removed
    }

    /// Expired entries count as absent even before they are swept
    pub fn is_banned(&self, addr: &IpAddr) -> bool {
        let now = self.clock.now();
        self.banned
            .get(&key(addr))
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    pub fn banned(&self) -> &BTreeMap<String, BanEntry> {
        &self.banned
    }

    pub fn clear_banned(&mut self) {
        self.banned.clear();
        log::debug!("Cleared all bans");
        self.persist();
    }

    /// Remove expired bans; returns how many were dropped
    pub fn sweep_banned(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.banned.len();
        self.banned.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.banned.len();
        if removed > 0 {
            log::debug!("Swept {} expired bans", removed);
            self.persist();
        }
        removed
    }

    // =========================================================================
    // Discouragement
    // =========================================================================

    pub fn discourage(&mut self, addr: &IpAddr) {
        let addr = key(addr);
        let now = self.clock.now();
        let expiry = now + DISCOURAGEMENT_DURATION;
        self.discouraged.insert(addr.clone(), expiry);
        log::info!("Discouraged {} until {}", addr, expiry);

        if self.discouraged.len() > MAX_DISCOURAGED {
            self.discouraged.retain(|_, until| now < *until);
        }
        if self.discouraged.len() > MAX_DISCOURAGED {
            let victim = self
                .discouraged
                .iter()
                .min_by_key(|(_, until)| **until)
                .map(|(addr, _)| addr.clone());
            if let Some(victim) = victim {
                log::trace!("Evicting discouraged entry {}", victim);
                self.discouraged.remove(&victim);
            }
        }
    }

    pub fn is_discouraged(&self, addr: &IpAddr) -> bool {
        let now = self.clock.now();
        self.discouraged
            .get(&key(addr))
            .map(|until| now < *until)
            .unwrap_or(false)
    }

    pub fn discouraged_count(&self) -> usize {
        self.discouraged.len()
    }

    pub fn clear_discouraged(&mut self) {
        self.discouraged.clear();
        log::debug!("Cleared all discouraged addresses");
    }

    pub fn sweep_discouraged(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.discouraged.len();
        self.discouraged.retain(|_, until| now < *until);
        before - self.discouraged.len()
    }

    // =========================================================================
    // Whitelist
    // =========================================================================

    /// Whitelisted addresses are admitted even while banned or discouraged
    pub fn add_to_whitelist(&mut self, addr: &IpAddr) {
        self.whitelist.insert(key(addr));
    }

    pub fn remove_from_whitelist(&mut self, addr: &IpAddr) {
        self.whitelist.remove(&key(addr));
    }

    pub fn is_whitelisted(&self, addr: &IpAddr) -> bool {
        self.whitelist.contains(&key(addr))
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write unexpired bans to disk (temp file, then rename)
    pub fn save(&mut self) -> Result<(), BanError> {
        let Some(path) = self.banlist_path() else {
            return Ok(());
        };

        let now = self.clock.now();
        self.banned.retain(|_, entry| !entry.is_expired(now));

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let temp_path = path.with_extension("json.tmp");
        let file = fs::File::create(&temp_path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.banned)?;
        fs::rename(&temp_path, &path)?;

        log::trace!("Saved {} bans to {}", self.banned.len(), path.display());
        Ok(())
    }

    /// Merge bans from disk, skipping expired ones. A missing file is not an error.
    pub fn load(&mut self) -> Result<usize, BanError> {
        let Some(path) = self.banlist_path() else {
            return Ok(0);
        };
        if !path.exists() {
            log::debug!("No ban list at {}", path.display());
            return Ok(0);
        }

        let file = fs::File::open(&path)?;
        let stored: BTreeMap<String, BanEntry> = serde_json::from_reader(BufReader::new(file))?;

        let now = self.clock.now();
        let mut loaded = 0;
        for (addr, entry) in stored {
            if entry.is_expired(now) {
                continue;
            }
            self.banned.insert(addr, entry);
            loaded += 1;
        }
        log::info!("Loaded {} bans from {}", loaded, path.display());
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::MockClock;
    use std::time::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn registry() -> (BanRegistry, std::sync::Arc<MockClock>) {
        let clock = MockClock::new(1_700_000_000);
        (BanRegistry::new(clock.clone()), clock)
    }

    #[test]
    fn test_ban_unban() {
        let (mut bans, _clock) = registry();
        let a = ip("1.2.3.4");

        bans.ban(&a, 0);
        assert!(bans.is_banned(&a));
        assert!(bans.unban(&a));
        assert!(!bans.is_banned(&a));
        assert!(!bans.unban(&a));
    }

    #[test]
    fn test_reban_replaces_entry() {
        let (mut bans, clock) = registry();
        let a = ip("1.2.3.4");

        bans.ban(&a, 60);
        bans.ban(&a, 3600);
        assert_eq!(bans.banned().len(), 1);

        clock.advance(Duration::from_secs(120));
        assert!(bans.is_banned(&a));

        clock.advance(Duration::from_secs(3600));
        assert!(!bans.is_banned(&a));
        // Still present until swept
        assert_eq!(bans.banned().len(), 1);
        assert_eq!(bans.sweep_banned(), 1);
        assert!(bans.banned().is_empty());
    }

    #[test]
    fn test_sweep_keeps_unexpired() {
        let (mut bans, clock) = registry();
        bans.ban(&ip("1.1.1.1"), 10);
        bans.ban(&ip("2.2.2.2"), 1000);
        bans.ban(&ip("3.3.3.3"), 0);

        clock.advance(Duration::from_secs(11));
        assert_eq!(bans.sweep_banned(), 1);
        assert!(bans.is_banned(&ip("2.2.2.2")));
        assert!(bans.is_banned(&ip("3.3.3.3")));
    }

    #[test]
    fn test_ban_and_discourage_independent() {
        let (mut bans, clock) = registry();
        let a = ip("5.6.7.8");

        bans.discourage(&a);
        assert!(bans.is_discouraged(&a));
        assert!(!bans.is_banned(&a));

        bans.ban(&a, 0);
        bans.clear_banned();
        assert!(bans.is_discouraged(&a));

        bans.ban(&a, 0);
        bans.clear_discouraged();
        assert!(bans.is_banned(&a));
        assert!(!bans.is_discouraged(&a));

        bans.discourage(&a);
        clock.advance(Duration::from_secs(DISCOURAGEMENT_DURATION as u64));
        assert!(!bans.is_discouraged(&a));
        assert!(bans.is_banned(&a));
    }

    #[test]
    fn test_whitelist_keeps_records() {
        let (mut bans, _clock) = registry();
        let a = ip("9.9.9.9");
        let b = ip("9.9.9.10");

        bans.ban(&b, 0);
        bans.add_to_whitelist(&b);
        assert!(bans.is_banned(&b));

        bans.add_to_whitelist(&a);
        bans.ban(&a, 0);
        bans.discourage(&a);
        assert!(bans.is_whitelisted(&a));
        assert!(bans.is_banned(&a));
        assert!(bans.is_discouraged(&a));
        assert_eq!(bans.banned().len(), 2);

        bans.remove_from_whitelist(&a);
        assert!(!bans.is_whitelisted(&a));
        assert!(bans.is_banned(&a));
    }

    #[test]
    fn test_discouraged_cap() {
        let (mut bans, clock) = registry();
        for i in 0..(MAX_DISCOURAGED + 5) {
            let a = IpAddr::from([10, (i >> 16) as u8, (i >> 8) as u8, i as u8]);
            bans.discourage(&a);
            clock.advance(Duration::from_millis(1000));
        }
        assert_eq!(bans.discouraged_count(), MAX_DISCOURAGED);
        // Earliest expiries were evicted
        assert!(!bans.is_discouraged(&ip("10.0.0.0")));
        assert!(bans.is_discouraged(&ip("10.0.39.19")));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let clock = MockClock::new(1_700_000_000);

        let mut bans = BanRegistry::with_data_dir(clock.clone(), dir.path(), false);
        bans.ban(&ip("1.2.3.4"), 0);
        bans.ban(&ip("5.6.7.8"), 100);
        bans.discourage(&ip("9.9.9.9"));
        bans.save().unwrap();

        let mut fresh = BanRegistry::with_data_dir(clock.clone(), dir.path(), false);
        assert!(!fresh.is_banned(&ip("1.2.3.4")));

        clock.advance(Duration::from_secs(200));
        assert_eq!(fresh.load().unwrap(), 1);
        assert!(fresh.is_banned(&ip("1.2.3.4")));
        assert!(!fresh.is_banned(&ip("5.6.7.8")));
        assert!(!fresh.is_discouraged(&ip("9.9.9.9")));
    }

    #[test]
    fn test_auto_save_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let clock = MockClock::new(1_700_000_000);

        let mut empty = BanRegistry::with_data_dir(clock.clone(), dir.path(), true);
        assert_eq!(empty.load().unwrap(), 0);

        empty.ban(&ip("4.4.4.4"), 0);
        assert!(dir.path().join(BANLIST_FILE).exists());

        let mut fresh = BanRegistry::with_data_dir(clock, dir.path(), true);
        assert_eq!(fresh.load().unwrap(), 1);
    }
}
