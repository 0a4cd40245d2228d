//! Anchor connections
//!
//! On shutdown the node records a couple of its longest-lived outbound peers
//! and dials them first on the next start, so a restart does not hand every
//! outbound slot to addresses learned from gossip. The file is single use:
//! it is removed as soon as it has been read, valid or not.

use crate::network::protocol::NetworkAddress;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

/// File name inside the data directory
pub const ANCHORS_FILE: &str = "anchors.json";

/// Anchors saved on shutdown
pub const MAX_ANCHORS: usize = 2;

const ANCHORS_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum AnchorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported anchors file version {0}")]
    UnsupportedVersion(u32),

    #[error("Anchors file lists {0} entries")]
    TooMany(usize),
}

#[derive(Serialize, Deserialize)]
struct AnchorsFile {
    version: u32,
    anchors: Vec<NetworkAddress>,
}

/// Write the anchors, replacing any previous file. An empty list removes it.
pub fn save_anchors(path: &Path, anchors: &[NetworkAddress]) -> Result<(), AnchorError> {
    if anchors.is_empty() {
        remove_file(path)?;
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let data = AnchorsFile {
        version: ANCHORS_VERSION,
        anchors: anchors.iter().take(MAX_ANCHORS).copied().collect(),
    };
    let temp_path = path.with_extension("json.tmp");
    let file = fs::File::create(&temp_path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &data)?;
    fs::rename(&temp_path, path)?;

    log::debug!("Saved {} anchors to {}", data.anchors.len(), path.display());
    Ok(())
}

fn read_anchors(path: &Path) -> Result<Vec<NetworkAddress>, AnchorError> {
    let file = fs::File::open(path)?;
    let data: AnchorsFile = serde_json::from_reader(BufReader::new(file))?;
    if data.version != ANCHORS_VERSION {
        return Err(AnchorError::UnsupportedVersion(data.version));
    }
    if data.anchors.len() > MAX_ANCHORS {
        return Err(AnchorError::TooMany(data.anchors.len()));
    }
    Ok(data
        .anchors
        .into_iter()
        .filter(|addr| !addr.is_null())
        .collect())
}

fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Read and delete the anchors file. A missing or unreadable file yields no
/// anchors.
pub fn take_anchors(path: &Path) -> Vec<NetworkAddress> {
    if !path.exists() {
        return Vec::new();
    }
    let anchors = match read_anchors(path) {
        Ok(anchors) => anchors,
        Err(e) => {
            log::warn!("Ignoring anchors file {}: {}", path.display(), e);
            Vec::new()
        }
    };
    if let Err(e) = remove_file(path) {
        log::warn!("Failed to remove anchors file {}: {}", path.display(), e);
    }
    anchors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::ServiceFlags;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn anchor(last: u8) -> NetworkAddress {
        NetworkAddress::from_ipv4(ServiceFlags::NODE_NETWORK, Ipv4Addr::new(5, 6, 7, last), 9590)
    }

    #[test]
    fn test_anchors_are_single_use() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ANCHORS_FILE);

        save_anchors(&path, &[anchor(1), anchor(2), anchor(3)]).unwrap();
        assert_eq!(take_anchors(&path), vec![anchor(1), anchor(2)]);
        assert!(!path.exists());
        assert!(take_anchors(&path).is_empty());
    }

    #[test]
    fn test_empty_list_clears_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ANCHORS_FILE);

        save_anchors(&path, &[anchor(1)]).unwrap();
        save_anchors(&path, &[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_invalid_file_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ANCHORS_FILE);

        fs::write(&path, b"not json").unwrap();
        assert!(take_anchors(&path).is_empty());
        assert!(!path.exists());

        let wrong_version = serde_json::json!({ "version": 9, "anchors": [] });
        fs::write(&path, wrong_version.to_string()).unwrap();
        assert!(take_anchors(&path).is_empty());
        assert!(!path.exists());
    }
}
