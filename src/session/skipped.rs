use crate::{CipherData, MessageSecret};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A message secret derived ahead of its message.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SkippedKey {
    pub(crate) message_number: u64,
    pub(crate) secret: MessageSecret,
    pub(crate) created_at: u64,
}

/// Skipped keys in insertion order. Several entries may share a message
/// number when they come from different receiving chains.
#[derive(Clone, Default)]
pub(crate) struct SkippedKeys {
    entries: Vec<SkippedKey>,
}

impl SkippedKeys {
    pub(crate) fn from_entries(entries: Vec<SkippedKey>) -> Self {
        Self { entries }
    }

    pub(crate) fn entries(&self) -> &[SkippedKey] {
        &self.entries
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, message_number: u64, secret: MessageSecret, now: u64) {
        self.entries.push(SkippedKey {
            message_number,
            secret,
            created_at: now,
        });
    }

    /// Tries every entry for `message_number` against `cipher_data`. The first
    /// entry that opens it is removed; all others stay.
    pub(crate) fn take(
        &mut self,
        message_number: u64,
        cipher_data: &CipherData,
    ) -> Option<Vec<u8>> {
        let mut found: Option<(usize, Vec<u8>)> = None;

        for (index, entry) in self.entries.iter().enumerate() {
            if entry.message_number != message_number {
                continue;
            }
            // No early exit: every candidate costs one AEAD attempt.
            let result = cipher_data.decrypt(&entry.secret);
            if found.is_none() {
                if let Ok(plaintext) = result {
                    found = Some((index, plaintext));
                }
            }
        }

        let (index, plaintext) = found?;
        self.entries.remove(index);
        Some(plaintext)
    }

    /// Drops entries older than `max_age`, then the oldest entries beyond
    /// `max_entries`. Returns how many were evicted.
    pub(crate) fn prune(&mut self, now: u64, max_age: Duration, max_entries: usize) -> usize {
        let before = self.entries.len();
        let max_age = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);

        self.entries
            .retain(|entry| now.saturating_sub(entry.created_at) <= max_age);

        if self.entries.len() > max_entries {
            self.entries.sort_by_key(|entry| entry.created_at);
            let excess = self.entries.len() - max_entries;
            self.entries.drain(..excess);
        }

        before - self.entries.len()
    }
}
