//! Artifact title grammar: `<jobName>-<DD/MM/YY>-<index>.tar.gz`.

use super::BackupRecord;
use crate::remote::{RemoteArtifact, GZIP_CONTENT_TYPE};
use crate::utils::errors::NameError;
use chrono::NaiveDate;

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

const DATE_FORMAT: &str = "%d/%m/%y";

/// Fields encoded in a title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTitle {
    pub name: String,
    pub date: NaiveDate,
    pub index: u32,
}

/// Parse a title. Segments are split from the right, so the job name may
/// itself contain `-`.
pub fn parse(title: &str) -> Result<ParsedTitle, NameError> {
    let mut segments = title.rsplitn(3, '-');
    let index_part = segments.next().ok_or(NameError::TooFewSegments)?;
    let date_part = segments.next().ok_or(NameError::TooFewSegments)?;
    let name = segments.next().ok_or(NameError::TooFewSegments)?;

    if name.is_empty() {
        return Err(NameError::EmptyName);
    }

    let digits = index_part
        .strip_suffix(ARCHIVE_SUFFIX)
        .ok_or(NameError::MissingSuffix)?;
    let index = parse_index(digits)?;
    let date = parse_date(date_part)?;

    Ok(ParsedTitle {
        name: name.to_string(),
        date,
        index,
    })
}

/// Turn a listed artifact into a record. Non-gzip entries are rejected
/// before the title is looked at.
pub fn parse_artifact(artifact: &RemoteArtifact) -> Result<BackupRecord, NameError> {
    if artifact.content_type != GZIP_CONTENT_TYPE {
        return Err(NameError::NotGzip(artifact.content_type.clone()));
    }

    let parsed = parse(&artifact.title)?;
    Ok(BackupRecord {
        name: parsed.name,
        date: parsed.date,
        index: parsed.index,
        artifact: artifact.clone(),
    })
}

pub fn format(name: &str, date: NaiveDate, index: u32) -> String {
    format!("{}-{}-{}{}", name, date.format(DATE_FORMAT), index, ARCHIVE_SUFFIX)
}

fn parse_index(digits: &str) -> Result<u32, NameError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NameError::InvalidIndex(digits.to_string()));
    }
    match digits.parse::<u32>() {
        Ok(index) if index >= 1 => Ok(index),
        _ => Err(NameError::InvalidIndex(digits.to_string())),
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, NameError> {
    // chrono accepts unpadded fields; the grammar does not
    let shape_ok = raw.len() == 8
        && raw.bytes().enumerate().all(|(i, b)| match i {
            2 | 5 => b == b'/',
            _ => b.is_ascii_digit(),
        });
    if !shape_ok {
        return Err(NameError::InvalidDate(raw.to_string()));
    }

    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| NameError::InvalidDate(raw.to_string()))
}
