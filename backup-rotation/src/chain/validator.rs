//! Builds the verified chain from a raw folder listing.
//!
//! The folder is treated as authoritative but untrusted: artifacts may have
//! been renamed, deleted, or left behind by an interrupted run, and unrelated
//! files may sit next to them. Anything that does not fit is dropped; nothing
//! here is an error.

use super::{naming, BackupRecord, VerifiedChain};
use crate::job::{BackupJob, Linkage};
use crate::remote::RemoteArtifact;
use tracing::debug;

/// Produce the chain of artifacts `job` can trust.
///
/// 1. keep gzip artifacts whose title parses with the job's name
/// 2. drop indices above `max_retained`
/// 3. stable-sort by index, leaving duplicates in place
/// 4. walk: the first record anchors the chain only at index 1, every later
///    record must be the next index at exactly `interval_days` after the
///    record it links to (see [`Linkage`])
pub fn validate(job: &BackupJob, artifacts: &[RemoteArtifact]) -> VerifiedChain {
    let mut candidates: Vec<BackupRecord> = artifacts
        .iter()
        .filter_map(|artifact| match naming::parse_artifact(artifact) {
            Ok(record) if record.name == job.name => Some(record),
            Ok(_) => None,
            Err(e) => {
                debug!(job = %job.name, title = %artifact.title, reason = %e, "Ignoring foreign file");
                None
            }
        })
        .filter(|record| record.index <= job.max_retained)
        .collect();

    candidates.sort_by_key(|record| record.index);

    let interval = i64::from(job.interval_days);
    let mut chain: Vec<BackupRecord> = Vec::with_capacity(candidates.len());
    let mut predecessor: Option<(u32, chrono::NaiveDate)> = None;

    for candidate in candidates {
        let accept = match chain.last() {
            None => candidate.index == 1,
            Some(last) => {
                let extends_chain = succeeds(last.index, last.date, &candidate, interval);
                match job.linkage {
                    Linkage::LastAccepted => extends_chain,
                    Linkage::SortedPredecessor => {
                        extends_chain
                            && predecessor
                                .is_some_and(|(index, date)| succeeds(index, date, &candidate, interval))
                    }
                }
            }
        };

        predecessor = Some((candidate.index, candidate.date));

        if accept {
            chain.push(candidate);
        } else {
            debug!(
                job = %job.name,
                title = %candidate.artifact.title,
                index = candidate.index,
                "Rejected record outside the contiguous chain"
            );
        }
    }

    VerifiedChain::from_records(chain)
}

fn succeeds(index: u32, date: chrono::NaiveDate, candidate: &BackupRecord, interval_days: i64) -> bool {
    candidate.index == index + 1 && (candidate.date - date).num_days() == interval_days
}
