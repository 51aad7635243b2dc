//! Backup chains: parsed records and the verified sequence built from them.

pub mod naming;
pub mod rotation;
pub mod validator;

use crate::remote::RemoteArtifact;
use chrono::NaiveDate;

pub use rotation::rotate;
pub use validator::validate;

/// A remote artifact whose title parsed as a backup of some job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub name: String,
    pub date: NaiveDate,
    pub index: u32,
    pub artifact: RemoteArtifact,
}

/// Contiguous, evenly spaced run of records starting at index 1.
///
/// Only built by [`validate`] and [`rotate`]; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifiedChain {
    records: Vec<BackupRecord>,
}

impl VerifiedChain {
    pub(crate) fn from_records(records: Vec<BackupRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<BackupRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Index the next uploaded artifact should carry.
    pub fn next_index(&self) -> u32 {
        self.records.len() as u32 + 1
    }

    /// Rotation is due only at exact capacity.
    pub fn is_full(&self, max_retained: u32) -> bool {
        self.records.len() == max_retained as usize
    }

    pub fn indices(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.index).collect()
    }
}
