use gxc_core::{now_ts, Address};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

/// Known-entity kinds eligible for clean-zone treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Exchange,
    StakingPool,
    Merchant,
    Validator,
}

impl EntityKind {
    fn as_str(self) -> &'static str {
        match self {
            EntityKind::Exchange => "EXCHANGE",
            EntityKind::StakingPool => "STAKING_POOL",
            EntityKind::Merchant => "MERCHANT",
            EntityKind::Validator => "VALIDATOR",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "EXCHANGE" => Some(EntityKind::Exchange),
            "STAKING_POOL" => Some(EntityKind::StakingPool),
            "MERCHANT" => Some(EntityKind::Merchant),
            "VALIDATOR" => Some(EntityKind::Validator),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub kind: EntityKind,
    pub name: String,
    pub website: String,
    pub verifier: String,
    pub registered_at: u64,
    pub last_verified_at: u64,
    pub verified: bool,
}

/// Registry of verified exchanges, pools, merchants and validators. This is
/// the sole source of clean-zone identity; nothing is inferred.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressRegistry {
    entries: HashMap<Address, EntityInfo>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, address: &str, kind: EntityKind, name: &str, website: &str, verifier: &str) {
        let now = now_ts();
        info!(address, %kind, name, "registered clean-zone entity");
        self.entries.insert(
            address.to_string(),
            EntityInfo {
                kind,
                name: name.to_string(),
                website: website.to_string(),
                verifier: verifier.to_string(),
                registered_at: now,
                last_verified_at: 0,
                verified: false,
            },
        );
    }

    pub fn unregister(&mut self, address: &str) -> bool {
        self.entries.remove(address).is_some()
    }

    pub fn mark_verified(&mut self, address: &str, verifier: &str) -> bool {
        match self.entries.get_mut(address) {
            Some(entry) => {
                entry.verified = true;
                entry.verifier = verifier.to_string();
                entry.last_verified_at = now_ts();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    pub fn get(&self, address: &str) -> Option<&EntityInfo> {
        self.entries.get(address)
    }

    pub fn kind_of(&self, address: &str) -> Option<EntityKind> {
        self.entries.get(address).map(|e| e.kind)
    }

    pub fn addresses_of_kind(&self, kind: EntityKind) -> Vec<&Address> {
        self.entries
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(a, _)| a)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &EntityInfo)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One `|`-separated line per entry, sorted by address for stable
    /// round-trips.
    pub fn export_lines(&self) -> String {
        let mut addresses: Vec<&Address> = self.entries.keys().collect();
        addresses.sort();
        let mut out = String::new();
        for address in addresses {
            let e = &self.entries[address];
            out.push_str(&format!(
                "{}|{}|{}|{}|{}|{}|{}|{}\n",
                address,
                e.kind,
                e.name,
                e.website,
                e.verifier,
                e.registered_at,
                e.last_verified_at,
                e.verified
            ));
        }
        out
    }

    /// Import entries, skipping malformed lines. Returns how many were
    /// loaded.
    pub fn import_lines(&mut self, data: &str) -> usize {
        let mut loaded = 0;
        for line in data.lines() {
            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() != 8 {
                continue;
            }
            let Some(kind) = EntityKind::parse(fields[1]) else {
                continue;
            };
            let (Ok(registered_at), Ok(last_verified_at), Ok(verified)) = (
                fields[5].parse::<u64>(),
                fields[6].parse::<u64>(),
                fields[7].parse::<bool>(),
            ) else {
                continue;
            };
            self.entries.insert(
                fields[0].to_string(),
                EntityInfo {
                    kind,
                    name: fields[2].to_string(),
                    website: fields[3].to_string(),
                    verifier: fields[4].to_string(),
                    registered_at,
                    last_verified_at,
                    verified,
                },
            );
            loaded += 1;
        }
        loaded
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        fs::write(path, self.export_lines())
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let mut registry = Self::new();
        registry.import_lines(&fs::read_to_string(path)?);
        Ok(registry)
    }
}
