//! Rendezvous (HRW) sharder (C8): partitions the watch set across a fleet
//! of worker instances. `assign(key)` picks the member maximizing
//! `FNV-1a64("key::member")`; the assignment is deterministic for a fixed
//! member set and stable under member-set changes (only keys whose
//! top-ranked member is affected ever move).

use domain::WatchedAddress;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub struct RendezvousSharder {
    self_id: String,
    members: Vec<String>,
}

impl RendezvousSharder {
    /// `members` is deduplicated; `self_id` is inserted if absent; an empty
    /// list degenerates to `[self_id]`.
    pub fn new(self_id: impl Into<String>, members: Vec<String>) -> Self {
        let self_id = self_id.into();
        let mut deduped: Vec<String> = Vec::with_capacity(members.len() + 1);
        for m in members {
            if !deduped.contains(&m) {
                deduped.push(m);
            }
        }
        if deduped.is_empty() {
            deduped.push(self_id.clone());
        } else if !deduped.contains(&self_id) {
            deduped.push(self_id.clone());
        }
        RendezvousSharder {
            self_id,
            members: deduped,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// The member that owns `key`: the argmax of `H(key::member)`. Ties
    /// break by the member's position in `members` (stable, deterministic).
    pub fn assign(&self, key: &str) -> &str {
        self.members
            .iter()
            .max_by_key(|member| {
                let scored = format!("{key}::{member}");
                fnv1a_64(scored.as_bytes())
            })
            .expect("members is never empty")
    }

    pub fn is_responsible(&self, address: &str) -> bool {
        self.assign(address) == self.self_id
    }

    pub fn filter_watched<'a>(
        &self,
        list: &'a [WatchedAddress],
    ) -> Vec<&'a WatchedAddress> {
        list.iter()
            .filter(|w| self.is_responsible(&w.address))
            .collect()
    }
}
