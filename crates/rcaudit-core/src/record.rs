//! Integrity-framed, newline-delimited record format.
//!
//! Audit logs and the archive journal share one framing:
//!
//! ```text
//! <len: 8 hex digits>:<sha256 prefix: 16 hex digits> <compact JSON>\n
//! ```
//!
//! `len` is the byte length of the JSON body and the checksum covers exactly
//! those bytes. Compact JSON never contains a raw newline, so every record is
//! one line and files stay readable with ordinary text tools while they are
//! being appended to.
//!
//! A crash mid-append leaves at most one damaged line at the end of a file.
//! [`scan`] reports it as [`Damage::TornTail`] together with the byte length
//! of the verified prefix, which is where the writer resumes. Damage anywhere
//! else is reported as [`Damage::Corrupt`] and is never repaired silently.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::AuditRecord;

/// Number of hex digits of the SHA-256 digest kept in a tag.
pub const CHECKSUM_HEX_LEN: usize = 16;

/// Length and checksum prefix of a framed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityTag {
    pub len: u32,
    pub checksum: String,
}

impl IntegrityTag {
    /// Compute the tag for a record body.
    pub fn compute(body: &[u8]) -> Self {
        let digest = Sha256::digest(body);
        Self {
            len: body.len() as u32,
            checksum: hex::encode(&digest[..CHECKSUM_HEX_LEN / 2]),
        }
    }

    fn parse(s: &str) -> Result<Self> {
        let (len, checksum) = s
            .split_once(':')
            .ok_or_else(|| Error::Integrity(format!("malformed tag '{s}'")))?;
        let len = u32::from_str_radix(len, 16)
            .map_err(|_| Error::Integrity(format!("malformed length in tag '{s}'")))?;
        if checksum.len() != CHECKSUM_HEX_LEN || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Integrity(format!("malformed checksum in tag '{s}'")));
        }
        Ok(Self {
            len,
            checksum: checksum.to_string(),
        })
    }
}

impl fmt::Display for IntegrityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{}", self.len, self.checksum)
    }
}

/// Encode a value as one framed line, including the trailing newline.
pub fn encode_line<T: Serialize>(value: &T) -> Result<(Vec<u8>, IntegrityTag)> {
    let body = serde_json::to_vec(value)?;
    let tag = IntegrityTag::compute(&body);
    let prefix = tag.to_string();

    let mut line = Vec::with_capacity(prefix.len() + body.len() + 2);
    line.extend_from_slice(prefix.as_bytes());
    line.push(b' ');
    line.extend_from_slice(&body);
    line.push(b'\n');
    Ok((line, tag))
}

/// Verify and decode one framed line (the trailing newline is optional).
pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<(T, IntegrityTag)> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let space = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| Error::Integrity("missing tag separator".to_string()))?;

    let tag_str = std::str::from_utf8(&line[..space])
        .map_err(|_| Error::Integrity("tag is not UTF-8".to_string()))?;
    let tag = IntegrityTag::parse(tag_str)?;

    let body = &line[space + 1..];
    if body.len() != tag.len as usize {
        return Err(Error::Integrity(format!(
            "length mismatch: tag says {} bytes, found {}",
            tag.len,
            body.len()
        )));
    }
    let actual = IntegrityTag::compute(body);
    if actual.checksum != tag.checksum {
        return Err(Error::Integrity(format!(
            "checksum mismatch: tag says {}, computed {}",
            tag.checksum, actual.checksum
        )));
    }

    let value = serde_json::from_slice(body)?;
    Ok((value, tag))
}

/// Damage found while scanning a framed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Damage {
    /// The final line is incomplete or fails verification (torn write).
    TornTail { offset: u64, bytes: u64 },
    /// A line followed by further data fails verification.
    Corrupt { offset: u64, reason: String },
}

/// Summary of a [`scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Number of verified records.
    pub records: u64,
    /// Byte length of the verified prefix.
    pub valid_len: u64,
    /// Total bytes in the input.
    pub total_len: u64,
    pub damage: Option<Damage>,
}

/// Read framed records until the end of input or the first damaged line.
///
/// `on_record` is called for each verified record in file order.
pub fn scan<R, T, F>(mut reader: R, mut on_record: F) -> Result<ScanOutcome>
where
    R: BufRead,
    T: DeserializeOwned,
    F: FnMut(T, IntegrityTag),
{
    let mut outcome = ScanOutcome::default();
    let mut line = Vec::with_capacity(1024);

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        let offset = outcome.total_len;
        outcome.total_len += n as u64;

        if line.last() != Some(&b'\n') {
            outcome.damage = Some(Damage::TornTail {
                offset,
                bytes: n as u64,
            });
            break;
        }

        match decode_line::<T>(&line) {
            Ok((value, tag)) => {
                on_record(value, tag);
                outcome.records += 1;
                outcome.valid_len = outcome.total_len;
            }
            Err(e) => {
                outcome.damage = Some(if reader.fill_buf()?.is_empty() {
                    Damage::TornTail {
                        offset,
                        bytes: n as u64,
                    }
                } else {
                    Damage::Corrupt {
                        offset,
                        reason: e.to_string(),
                    }
                });
                break;
            }
        }
    }

    outcome.total_len += io::copy(&mut reader, &mut io::sink())?;
    Ok(outcome)
}

/// Read every verified record of a framed file.
pub fn read_all<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, ScanOutcome)> {
    let reader = BufReader::new(File::open(path)?);
    let mut values = Vec::new();
    let outcome = scan(reader, |value: T, _| values.push(value))?;
    Ok((values, outcome))
}

/// Read every verified record of a room audit log, keeping integrity tags.
pub fn read_audit_log(path: &Path) -> Result<(Vec<AuditRecord>, ScanOutcome)> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let outcome = scan(reader, |mut record: AuditRecord, tag| {
        record.integrity = Some(tag);
        records.push(record);
    })?;
    Ok((records, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        n: u32,
        text: String,
    }

    fn note(n: u32) -> Note {
        Note {
            n,
            text: format!("line {n}\nwith an embedded newline"),
        }
    }

    fn framed(notes: &[Note]) -> Vec<u8> {
        notes
            .iter()
            .flat_map(|n| encode_line(n).unwrap().0)
            .collect()
    }

    #[test]
    fn test_encoded_record_is_single_line() {
        let (line, tag) = encode_line(&note(1)).unwrap();
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(*line.last().unwrap(), b'\n');

        let (decoded, decoded_tag): (Note, _) = decode_line(&line).unwrap();
        assert_eq!(decoded, note(1));
        assert_eq!(decoded_tag, tag);
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let (mut line, _) = encode_line(&note(1)).unwrap();
        let pos = line.iter().rposition(|&b| b == b'1').unwrap();
        line[pos] = b'2';

        let err = decode_line::<Note>(&line).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_truncated_body_is_rejected_by_length() {
        let (line, _) = encode_line(&note(1)).unwrap();
        let cut = &line[..line.len() - 5];
        let err = decode_line::<Note>(cut).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }

    #[test]
    fn test_scan_clean_file() {
        let data = framed(&[note(1), note(2), note(3)]);
        let mut seen = Vec::new();
        let outcome = scan(&data[..], |n: Note, _| seen.push(n.n)).unwrap();

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(outcome.records, 3);
        assert_eq!(outcome.valid_len, data.len() as u64);
        assert_eq!(outcome.total_len, data.len() as u64);
        assert_eq!(outcome.damage, None);
    }

    #[test]
    fn test_scan_detects_torn_tail() {
        let mut data = framed(&[note(1), note(2)]);
        let valid = data.len() as u64;
        let (partial, _) = encode_line(&note(3)).unwrap();
        data.extend_from_slice(&partial[..partial.len() / 2]);

        let mut seen = Vec::new();
        let outcome = scan(&data[..], |n: Note, _| seen.push(n.n)).unwrap();

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(outcome.valid_len, valid);
        assert_eq!(outcome.total_len, data.len() as u64);
        assert!(matches!(outcome.damage, Some(Damage::TornTail { offset, .. }) if offset == valid));
    }

    #[test]
    fn test_scan_flags_mid_file_corruption() {
        let first = framed(&[note(1)]);
        let mut data = first.clone();
        data.extend_from_slice(b"00000004:0000000000000000 junk\n");
        data.extend_from_slice(&framed(&[note(3)]));

        let outcome = scan(&data[..], |_: Note, _| {}).unwrap();

        assert_eq!(outcome.records, 1);
        assert_eq!(outcome.valid_len, first.len() as u64);
        assert_eq!(outcome.total_len, data.len() as u64);
        assert!(matches!(outcome.damage, Some(Damage::Corrupt { .. })));
    }

    #[test]
    fn test_read_all_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("notes.log");
        std::fs::write(&path, framed(&[note(7), note(8)])).unwrap();

        let (notes, outcome): (Vec<Note>, _) = read_all(&path).unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[1].n, 8);
        assert_eq!(outcome.damage, None);
    }
}
