//! Wallet inventory files.
//!
//! Two formats are accepted: a JSON array of `{ "address", "key_ref" }` objects,
//! or plain text with one `address,key_ref` pair per line (`#` starts a comment).

use crate::model::SigningKeyRef;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct InventoryEntry {
    pub address: String,
    #[serde(alias = "signing_key_ref", alias = "key")]
    pub key_ref: String,
}

impl InventoryEntry {
    pub fn signing_key_ref(&self) -> SigningKeyRef {
        SigningKeyRef::new(self.key_ref.clone())
    }
}

impl fmt::Debug for InventoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InventoryEntry")
            .field("address", &self.address)
            .field("key_ref", &"***REDACTED***")
            .finish()
    }
}

pub fn load_inventory(path: impl AsRef<Path>) -> Result<Vec<InventoryEntry>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read wallet inventory {:?}", path))?;
    parse_inventory(&content).with_context(|| format!("Invalid wallet inventory {:?}", path))
}

pub fn parse_inventory(content: &str) -> Result<Vec<InventoryEntry>> {
    let trimmed = content.trim_start();
    let entries: Vec<InventoryEntry> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("Failed to parse JSON inventory")?
    } else {
        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (address, key_ref) = line
                .split_once(',')
                .ok_or_else(|| anyhow!("line {}: expected 'address,key_ref'", idx + 1))?;
            let (address, key_ref) = (address.trim(), key_ref.trim());
            if address.is_empty() || key_ref.is_empty() {
                return Err(anyhow!("line {}: empty address or key reference", idx + 1));
            }
            entries.push(InventoryEntry {
                address: address.to_string(),
                key_ref: key_ref.to_string(),
            });
        }
        entries
    };

    let mut seen = std::collections::HashSet::new();
    for entry in &entries {
        if !seen.insert(entry.address.as_str()) {
            return Err(anyhow!("duplicate wallet address {}", entry.address));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_lines_skips_comments() {
        let entries = parse_inventory("# pool\n0xaaa, key-a\n\n0xbbb,key-b\n").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].address, "0xaaa");
        assert_eq!(entries[0].signing_key_ref().expose(), "key-a");
    }

    #[test]
    fn test_parse_json_array() {
        let entries =
            parse_inventory(r#"[{"address":"0xaaa","key_ref":"k1"},{"address":"0xbbb","key":"k2"}]"#)
                .unwrap();
        assert_eq!(entries[1].key_ref, "k2");
    }

    #[test]
    fn test_rejects_duplicates_and_bad_lines() {
        assert!(parse_inventory("0xaaa,k1\n0xaaa,k2").is_err());
        assert!(parse_inventory("0xaaa").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let entries = parse_inventory("0xaaa,secret-key").unwrap();
        assert!(!format!("{:?}", entries[0]).contains("secret-key"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0xaaa,k1").unwrap();
        let entries = load_inventory(file.path()).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
