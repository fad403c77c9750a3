// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fingerprint registry, duplicate queue and transfer subscriptions.
//!
//! Plain owned data; the manager is the only writer.

use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;

use super::types::{DownloadRecord, DuplicateRequest, Fingerprint, SubscriptionToken, TransferId};

/// At most one record per fingerprint, kept in insertion order so that
/// URL correlation on transfer start is deterministic.
#[derive(Debug, Default)]
pub struct Registry {
    records: IndexMap<Fingerprint, DownloadRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &str) -> Option<&DownloadRecord> {
        self.records.get(fingerprint)
    }

    pub fn get_mut(&mut self, fingerprint: &str) -> Option<&mut DownloadRecord> {
        self.records.get_mut(fingerprint)
    }

    /// Insert a record, replacing any previous one for the same fingerprint.
    pub fn insert(&mut self, record: DownloadRecord) -> Option<DownloadRecord> {
        // shift_remove first so a re-inserted fingerprint moves to the back
        let previous = self.records.shift_remove(&record.fingerprint);
        self.records.insert(record.fingerprint.clone(), record);
        previous
    }

    pub fn remove(&mut self, fingerprint: &str) -> Option<DownloadRecord> {
        self.records.shift_remove(fingerprint)
    }

    /// Oldest record for `url` that is still waiting for its transfer.
    pub fn awaiting_start_mut(&mut self, url: &str) -> Option<&mut DownloadRecord> {
        self.records
            .values_mut()
            .find(|record| record.handle.is_none() && record.url == url)
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.records.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DownloadRecord> {
        self.records.values()
    }
}

/// Pending duplicate requests keyed by fingerprint.
#[derive(Debug, Default)]
pub struct DuplicateQueue {
    pending: HashMap<Fingerprint, Vec<DuplicateRequest>>,
}

impl DuplicateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a duplicate. Returns `false` if an identical one is already queued.
    pub fn push(&mut self, request: DuplicateRequest) -> bool {
        let entry = self.pending.entry(request.fingerprint.clone()).or_default();
        if entry.contains(&request) {
            return false;
        }
        entry.push(request);
        true
    }

    /// Remove and return every duplicate queued for `fingerprint`.
    pub fn take(&mut self, fingerprint: &str) -> Vec<DuplicateRequest> {
        self.pending.remove(fingerprint).unwrap_or_default()
    }

    pub fn get(&self, fingerprint: &str) -> &[DuplicateRequest] {
        self.pending
            .get(fingerprint)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self, fingerprint: &str) -> usize {
        self.get(fingerprint).len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What the manager needs to relay one transfer's notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub token: SubscriptionToken,
    pub fingerprint: Fingerprint,
    pub url: String,
    pub destination_path: PathBuf,
}

/// One handler per transfer id. Re-subscribing a transfer replaces its
/// handler instead of stacking a second one.
#[derive(Debug, Default)]
pub struct Subscriptions {
    by_transfer: HashMap<TransferId, Subscription>,
    next_token: u64,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        transfer: TransferId,
        fingerprint: &str,
        url: &str,
        destination_path: PathBuf,
    ) -> SubscriptionToken {
        self.next_token += 1;
        let token = SubscriptionToken(self.next_token);
        self.by_transfer.insert(
            transfer,
            Subscription {
                token,
                fingerprint: fingerprint.to_string(),
                url: url.to_string(),
                destination_path,
            },
        );
        token
    }

    pub fn get(&self, transfer: TransferId) -> Option<&Subscription> {
        self.by_transfer.get(&transfer)
    }

    /// Drop the handler for `transfer` if `token` still owns it.
    pub fn unsubscribe(&mut self, transfer: TransferId, token: SubscriptionToken) -> bool {
        match self.by_transfer.get(&transfer) {
            Some(sub) if sub.token == token => {
                self.by_transfer.remove(&transfer);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.by_transfer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_transfer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dup(fp: &str, url: &str, path: &str) -> DuplicateRequest {
        DuplicateRequest {
            fingerprint: fp.to_string(),
            url: url.to_string(),
            destination_path: PathBuf::from(path),
        }
    }

    #[test]
    fn test_registry_one_record_per_fingerprint() {
        let mut registry = Registry::new();
        registry.insert(DownloadRecord::new("f", "https://a", "/tmp/a"));
        let previous = registry.insert(DownloadRecord::new("f", "https://b", "/tmp/b"));

        assert!(previous.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("f").unwrap().url, "https://b");
    }

    #[test]
    fn test_awaiting_start_prefers_oldest() {
        let mut registry = Registry::new();
        registry.insert(DownloadRecord::new("first", "https://same", "/tmp/1"));
        registry.insert(DownloadRecord::new("second", "https://same", "/tmp/2"));

        let record = registry.awaiting_start_mut("https://same").unwrap();
        assert_eq!(record.fingerprint, "first");
        assert!(registry.awaiting_start_mut("https://other").is_none());
    }

    #[test]
    fn test_duplicate_queue_dedupes_identical_requests() {
        let mut queue = DuplicateQueue::new();
        assert!(queue.push(dup("f", "https://b", "/tmp/b")));
        assert!(!queue.push(dup("f", "https://b", "/tmp/b")));
        assert!(queue.push(dup("f", "https://c", "/tmp/c")));
        assert_eq!(queue.len("f"), 2);

        let taken = queue.take("f");
        assert_eq!(taken.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.take("f").is_empty());
    }

    #[test]
    fn test_subscription_replaced_not_stacked() {
        let mut subs = Subscriptions::new();
        let first = subs.subscribe(7, "f", "https://a", PathBuf::from("/tmp/a"));
        let second = subs.subscribe(7, "f", "https://a", PathBuf::from("/tmp/a"));

        assert_ne!(first, second);
        assert_eq!(subs.len(), 1);
        assert!(!subs.unsubscribe(7, first));
        assert!(subs.unsubscribe(7, second));
        assert!(subs.is_empty());
    }
}
