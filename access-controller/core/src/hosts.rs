//! Host sets shared by several owners of one Certificate.
//!
//! Each owner's contribution is recorded in an annotation on the Certificate
//! so that the combined host list can be recomputed from the live object
//! alone. When an owner changes its hosts, only the hosts that it stops
//! claiming and that no other owner claims are removed.

use access_controller_k8s_api::labels::{self, Map};
use ahash::AHashSet;
use std::collections::BTreeMap;

/// The change in one owner's host claims.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostDelta {
    pub additions: Vec<String>,
    pub deletions: Vec<String>,
}

/// The per-owner host records of a Certificate, keyed by owner UID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnerHosts {
    controlled: bool,
    by_owner: BTreeMap<String, Vec<String>>,
}

// === impl HostDelta ===

impl HostDelta {
    /// Computes the change from an owner's `previous` claims to `desired`.
    ///
    /// An owner with no previous record contributes additions only.
    pub fn between(previous: Option<&[String]>, desired: &[String]) -> Self {
        let previous = previous.unwrap_or_default();
        let additions = unique(desired.iter().filter(|h| !previous.contains(h)));
        let deletions = unique(previous.iter().filter(|h| !desired.contains(h)));
        Self {
            additions,
            deletions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }

    /// Applies the delta to the combined host list.
    ///
    /// A deleted host is retained while any other owner still claims it.
    /// The result is sorted and free of duplicates.
    pub fn apply<'a>(
        &self,
        union: &[String],
        claimed_by_others: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let retained = claimed_by_others.into_iter().collect::<AHashSet<_>>();
        let mut hosts = union
            .iter()
            .filter(|h| retained.contains(h.as_str()) || !self.deletions.contains(h))
            .chain(self.additions.iter())
            .cloned()
            .collect::<Vec<_>>();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

fn unique<'a>(hosts: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = AHashSet::new();
    hosts
        .filter(|h| seen.insert(h.as_str()))
        .cloned()
        .collect()
}

// === impl OwnerHosts ===

impl OwnerHosts {
    /// Reads the host records and the controlled marker from a Certificate's
    /// annotations.
    pub fn from_annotations(annotations: Option<&Map>) -> Self {
        let Some(annotations) = annotations else {
            return Self::default();
        };
        let by_owner = annotations
            .iter()
            .filter_map(|(k, v)| {
                let uid = k.strip_prefix(labels::OWNER_HOSTS_PREFIX)?;
                Some((uid.to_string(), split_hosts(v)))
            })
            .collect();
        Self {
            controlled: annotations.contains_key(labels::CONTROLLED),
            by_owner,
        }
    }

    /// Records for a newly created Certificate.
    pub fn new<'a>(owners: impl IntoIterator<Item = &'a str>, hosts: &[String]) -> Self {
        let by_owner = owners
            .into_iter()
            .filter(|uid| !uid.is_empty())
            .map(|uid| (uid.to_string(), hosts.to_vec()))
            .collect();
        Self {
            controlled: true,
            by_owner,
        }
    }

    pub fn is_controlled(&self) -> bool {
        self.controlled
    }

    pub fn hosts(&self, owner: &str) -> Option<&[String]> {
        self.by_owner.get(owner).map(Vec::as_slice)
    }

    pub fn owners(&self) -> impl Iterator<Item = &str> {
        self.by_owner.keys().map(String::as_str)
    }

    /// Updates `owner`'s claim to `desired`, returning the new combined list.
    ///
    /// Owners without a UID cannot be recorded; their hosts are only ever
    /// added.
    pub fn claim(&mut self, union: &[String], owner: Option<&str>, desired: &[String]) -> Vec<String> {
        let owner = owner.filter(|uid| !uid.is_empty());
        let previous = owner.and_then(|uid| self.hosts(uid));
        let delta = HostDelta::between(previous, desired);
        let hosts = delta.apply(union, self.claimed_by_others(owner));
        if let Some(uid) = owner {
            self.by_owner.insert(uid.to_string(), desired.to_vec());
        }
        hosts
    }

    /// Drops the records of owners that are no longer referenced, returning
    /// the new combined list.
    pub fn prune<'a>(
        &mut self,
        union: &[String],
        live: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let live = live.into_iter().collect::<AHashSet<_>>();
        let stale = self
            .by_owner
            .keys()
            .filter(|uid| !live.contains(uid.as_str()))
            .cloned()
            .collect::<Vec<_>>();

        let mut hosts = union.to_vec();
        for uid in stale {
            if let Some(previous) = self.by_owner.remove(&uid) {
                let delta = HostDelta::between(Some(previous.as_slice()), &[]);
                hosts = delta.apply(&hosts, self.claimed_by_others(None));
            }
        }
        hosts
    }

    /// Writes the controlled marker and the host records, removing records
    /// for owners that are no longer tracked. Returns true if anything
    /// changed.
    pub fn write(&self, annotations: &mut Map) -> bool {
        let mut changed = false;
        for (key, value) in labels::controlled_annotations() {
            if annotations.get(&key) != Some(&value) {
                annotations.insert(key, value);
                changed = true;
            }
        }

        let before = annotations.len();
        annotations.retain(|k, _| {
            k.strip_prefix(labels::OWNER_HOSTS_PREFIX)
                .map(|uid| self.by_owner.contains_key(uid))
                .unwrap_or(true)
        });
        changed |= annotations.len() != before;

        for (uid, hosts) in &self.by_owner {
            let key = format!("{}{uid}", labels::OWNER_HOSTS_PREFIX);
            let value = hosts.join(",");
            if annotations.get(&key) != Some(&value) {
                annotations.insert(key, value);
                changed = true;
            }
        }
        changed
    }

    fn claimed_by_others<'a>(&'a self, owner: Option<&'a str>) -> impl Iterator<Item = &'a str> + 'a {
        self.by_owner
            .iter()
            .filter(move |(uid, _)| Some(uid.as_str()) != owner)
            .flat_map(|(_, hosts)| hosts.iter().map(String::as_str))
    }
}

fn split_hosts(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(ToString::to_string)
        .collect()
}
