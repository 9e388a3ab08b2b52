//! Core identifiers and the needle model shared by the store, the
//! replication path and the placement engine.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Header prefix for needle key/value pairs on replica uploads.
pub const PAIR_NAME_PREFIX: &str = "Seaweed-";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VolumeId(pub u32);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VolumeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u32>()
            .map(VolumeId)
            .map_err(|_| Error::Other(format!("invalid volume id: {}", s)))
    }
}

pub type NeedleId = u64;
pub type Cookie = u32;

/// `<volume>,<needle id hex><cookie as 8 hex digits>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub volume_id: VolumeId,
    pub key: NeedleId,
    pub cookie: Cookie,
}

impl FileId {
    pub fn new(volume_id: VolumeId, key: NeedleId, cookie: Cookie) -> Self {
        Self {
            volume_id,
            key,
            cookie,
        }
    }

    pub fn from_needle(volume_id: VolumeId, needle: &Needle) -> Self {
        Self::new(volume_id, needle.id, needle.cookie)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{:x}{:08x}", self.volume_id, self.key, self.cookie)
    }
}

impl FromStr for FileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidFileId(s.to_string());
        let (vid, rest) = s.trim_start_matches('/').split_once(',').ok_or_else(invalid)?;
        // an optional "_<delta>" suffix addresses a chunk of a multi-part upload
        let rest = rest.split('_').next().unwrap_or(rest);
        if rest.len() <= 8 || !rest.is_ascii() {
            return Err(invalid());
        }
        let (key_hex, cookie_hex) = rest.split_at(rest.len() - 8);
        Ok(FileId {
            volume_id: vid.parse().map_err(|_| invalid())?,
            key: u64::from_str_radix(key_hex, 16).map_err(|_| invalid())?,
            cookie: u32::from_str_radix(cookie_hex, 16).map_err(|_| invalid())?,
        })
    }
}

/// Time-to-live in the `<count><unit>` form, e.g. `3d`. Empty means forever.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ttl(String);

impl Ttl {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Ttl::default());
        }
        let (count, unit) = match s.char_indices().last() {
            Some((i, c)) if c.is_ascii_alphabetic() => (&s[..i], c),
            _ => (s, 'm'),
        };
        if !matches!(unit, 'm' | 'h' | 'd' | 'w' | 'M' | 'y') {
            return Err(Error::Other(format!("unknown ttl unit: {}", s)));
        }
        let count: u8 = count
            .parse()
            .map_err(|_| Error::Other(format!("invalid ttl: {}", s)))?;
        if count == 0 {
            return Ok(Ttl::default());
        }
        Ok(Ttl(format!("{}{}", count, unit)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replica placement `xyz`: x copies in other data centers, y on other
/// racks, z on other servers of the same rack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaPlacement {
    pub diff_data_center_count: u8,
    pub diff_rack_count: u8,
    pub same_rack_count: u8,
}

impl ReplicaPlacement {
    pub fn copy_count(&self) -> usize {
        self.diff_data_center_count as usize
            + self.diff_rack_count as usize
            + self.same_rack_count as usize
            + 1
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        Self::from_str(&format!("{:03}", b))
    }

    pub fn to_byte(self) -> u8 {
        self.diff_data_center_count * 100 + self.diff_rack_count * 10 + self.same_rack_count
    }
}

impl FromStr for ReplicaPlacement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let digits: Vec<u8> = s
            .chars()
            .map(|c| c.to_digit(10).map(|d| d as u8))
            .collect::<Option<_>>()
            .ok_or_else(|| Error::InvalidConfig(format!("unknown replication type: {}", s)))?;
        // shorter forms are left-padded: "1" == "001"
        if digits.is_empty() || digits.len() > 3 {
            return Err(Error::InvalidConfig(format!("unknown replication type: {}", s)));
        }
        let mut padded = [0u8; 3];
        padded[3 - digits.len()..].copy_from_slice(&digits);
        Ok(ReplicaPlacement {
            diff_data_center_count: padded[0],
            diff_rack_count: padded[1],
            same_rack_count: padded[2],
        })
    }
}

impl fmt::Display for ReplicaPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.diff_data_center_count, self.diff_rack_count, self.same_rack_count
        )
    }
}

/// A reachable volume server endpoint. `url` is the `ip:port` identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub url: String,
    #[serde(default)]
    pub public_url: String,
}

impl Location {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            public_url: url.clone(),
            url,
        }
    }

    pub fn server_address(&self) -> &str {
        &self.url
    }
}

/// A stored object with its metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Needle {
    pub id: NeedleId,
    pub cookie: Cookie,
    pub data: Vec<u8>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub is_compressed: bool,
    #[serde(default)]
    pub is_chunk_manifest: bool,
    /// Unix seconds; 0 when unknown.
    #[serde(default)]
    pub last_modified: u64,
    /// JSON object of user key/value pairs.
    #[serde(default)]
    pub pairs: Option<Vec<u8>>,
    #[serde(default)]
    pub ttl: Ttl,
}

impl Needle {
    pub fn new(id: NeedleId, cookie: Cookie, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            cookie,
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn has_pairs(&self) -> bool {
        self.pairs.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Decode the pair map, re-keying every entry with [`PAIR_NAME_PREFIX`].
    pub fn prefixed_pairs(&self) -> Result<BTreeMap<String, String>> {
        let Some(raw) = self.pairs.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(BTreeMap::new());
        };
        let pairs: BTreeMap<String, String> = serde_json::from_slice(raw)
            .map_err(|e| Error::Other(format!("unmarshal pairs: {}", e)))?;
        Ok(pairs
            .into_iter()
            .map(|(k, v)| (format!("{}{}", PAIR_NAME_PREFIX, k), v))
            .collect())
    }

    /// On-disk footprint: header + body + checksum.
    pub fn disk_size(&self) -> u64 {
        16 + self.data.len() as u64 + 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_format_and_parse() {
        let fid = FileId::new(VolumeId(3), 0x01637037d6, 0x2f5bd5f3);
        assert_eq!(fid.to_string(), "3,1637037d62f5bd5f3");
        assert_eq!("3,1637037d62f5bd5f3".parse::<FileId>().unwrap(), fid);
        assert_eq!("/3,1637037d62f5bd5f3_1".parse::<FileId>().unwrap(), fid);
    }

    #[test]
    fn test_file_id_rejects_garbage() {
        assert!("3".parse::<FileId>().is_err());
        assert!("3,abc".parse::<FileId>().is_err());
        assert!("x,1637037d62f5bd5f3".parse::<FileId>().is_err());
    }

    #[test]
    fn test_replica_placement() {
        let rp: ReplicaPlacement = "001".parse().unwrap();
        assert_eq!(rp.copy_count(), 2);
        assert_eq!(rp.to_string(), "001");

        let rp: ReplicaPlacement = "210".parse().unwrap();
        assert_eq!(rp.copy_count(), 4);
        assert_eq!(rp.to_byte(), 210);
        assert_eq!(ReplicaPlacement::from_byte(210).unwrap(), rp);

        assert_eq!(ReplicaPlacement::default().copy_count(), 1);
        assert!("01x".parse::<ReplicaPlacement>().is_err());
        assert!("0001".parse::<ReplicaPlacement>().is_err());
    }

    #[test]
    fn test_ttl_parse() {
        assert_eq!(Ttl::parse("3d").unwrap().to_string(), "3d");
        assert_eq!(Ttl::parse("15").unwrap().to_string(), "15m");
        assert!(Ttl::parse("").unwrap().is_empty());
        assert!(Ttl::parse("0h").unwrap().is_empty());
        assert!(Ttl::parse("5x").is_err());
    }

    #[test]
    fn test_prefixed_pairs() {
        let mut n = Needle::new(1, 2, b"hello".to_vec());
        assert!(n.prefixed_pairs().unwrap().is_empty());

        n.pairs = Some(br#"{"owner":"ops"}"#.to_vec());
        let pairs = n.prefixed_pairs().unwrap();
        assert_eq!(pairs.get("Seaweed-owner").map(String::as_str), Some("ops"));

        n.pairs = Some(b"not json".to_vec());
        assert!(n.prefixed_pairs().is_err());
    }
}
