//! Binary snapshot of a [`TaskRecord`] for handing task state across a
//! process or component boundary.
//!
//! Only the ten transferable fields are written. Timestamps are store-local and
//! are reset to decode time on the receiving side; look the record up by id if
//! the originals are needed.

use crate::core::errors::{TaskError, TaskResult};
use crate::core::model::{RawTask, TaskRecord, TaskState, MAX_TEXT_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use std::path::PathBuf;

pub const SNAPSHOT_VERSION: u8 = 1;
pub const SNAPSHOT_FIELDS: u8 = 10;

const UNKNOWN_TOTAL: i64 = -1;
// header, three i64, two u8, one i32 and four string length prefixes
const FIXED_LEN: usize = 2 + 8 * 3 + 1 + 1 + 4 + 4 * 4;

pub struct SnapshotCodec;

impl SnapshotCodec {
    pub fn encode(record: &TaskRecord) -> Bytes {
        let destination = record.destination_path().to_string_lossy();
        let mut buf = BytesMut::with_capacity(
            FIXED_LEN
                + record.source_url().len()
                + destination.len()
                + record.file_name().len()
                + record.last_modified_tag().len(),
        );

        buf.put_u8(SNAPSHOT_VERSION);
        buf.put_u8(SNAPSHOT_FIELDS);
        buf.put_i64(record.id().unwrap_or(0));
        put_str(&mut buf, record.source_url());
        put_str(&mut buf, &destination);
        put_str(&mut buf, record.file_name());
        buf.put_u8(record.resumable() as u8);
        // byte counts are capped at i64::MAX by the record itself
        buf.put_i64(record.downloaded_bytes() as i64);
        buf.put_i64(record.total_bytes().map(|t| t as i64).unwrap_or(UNKNOWN_TOTAL));
        put_str(&mut buf, record.last_modified_tag());
        buf.put_u8(record.state().code());
        buf.put_i32(record.error_code());

        buf.freeze()
    }

    pub fn decode(mut bytes: &[u8]) -> TaskResult<TaskRecord> {
        let buf = &mut bytes;

        let version = get_u8(buf, "version")?;
        if version != SNAPSHOT_VERSION {
            return Err(malformed(format!("unsupported snapshot version {version}")));
        }
        let fields = get_u8(buf, "field count")?;
        if fields != SNAPSHOT_FIELDS {
            return Err(malformed(format!(
                "expected {SNAPSHOT_FIELDS} fields, header says {fields}"
            )));
        }

        let id = match get_i64(buf, "id")? {
            0 => None,
            id if id > 0 => Some(id),
            id => return Err(malformed(format!("negative id {id}"))),
        };
        let source_url = get_str(buf, "source_url")?;
        let destination_path = PathBuf::from(get_str(buf, "destination_path")?);
        let file_name = get_str(buf, "file_name")?;
        let resumable = match get_u8(buf, "resumable")? {
            0 => false,
            1 => true,
            v => return Err(malformed(format!("resumable flag {v} is not a boolean"))),
        };
        let downloaded_bytes = match get_i64(buf, "downloaded_bytes")? {
            n if n >= 0 => n as u64,
            n => return Err(malformed(format!("negative downloaded_bytes {n}"))),
        };
        let total_bytes = match get_i64(buf, "total_bytes")? {
            UNKNOWN_TOTAL => None,
            n if n >= 0 => Some(n as u64),
            n => return Err(malformed(format!("negative total_bytes {n}"))),
        };
        let last_modified_tag = get_str(buf, "last_modified_tag")?;
        let state_code = get_u8(buf, "state")?;
        let state = TaskState::from_code(state_code)
            .ok_or_else(|| malformed(format!("unknown state code {state_code}")))?;
        let error_code = get_i32(buf, "error_code")?;

        if buf.has_remaining() {
            return Err(malformed(format!("{} trailing bytes", buf.remaining())));
        }

        let now = Utc::now();
        TaskRecord::from_raw(
            RawTask {
                id,
                source_url,
                destination_path,
                file_name,
                resumable,
                downloaded_bytes,
                total_bytes,
                last_modified_tag,
                state,
                error_code,
            },
            now,
            now,
        )
        .map_err(|e| malformed(format!("decoded record is invalid: {e}")))
    }
}

fn malformed(detail: String) -> TaskError {
    TaskError::MalformedEncoding(detail)
}

fn put_str(buf: &mut BytesMut, s: &str) {
    // records cap text at MAX_TEXT_LEN, well inside u32
    debug_assert!(s.len() <= MAX_TEXT_LEN);
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn need(buf: &&[u8], n: usize, field: &str) -> TaskResult<()> {
    if buf.remaining() < n {
        return Err(malformed(format!(
            "truncated at {field}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8], field: &str) -> TaskResult<u8> {
    need(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn get_i32(buf: &mut &[u8], field: &str) -> TaskResult<i32> {
    need(buf, 4, field)?;
    Ok(buf.get_i32())
}

fn get_i64(buf: &mut &[u8], field: &str) -> TaskResult<i64> {
    need(buf, 8, field)?;
    Ok(buf.get_i64())
}

fn get_str(buf: &mut &[u8], field: &str) -> TaskResult<String> {
    need(buf, 4, field)?;
    let len = buf.get_u32() as usize;
    need(buf, len, field)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| malformed(format!("{field} is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskRecord {
        TaskRecord::create("https://x/file.zip", "/dl", "file.zip", Some(1000)).unwrap()
    }

    #[test]
    fn completed_download_survives_transfer() {
        let mut r = sample();
        r.transition_to(TaskState::Running, None).unwrap();
        r.advance_progress(1000).unwrap();
        r.transition_to(TaskState::Completed, None).unwrap();

        let decoded = SnapshotCodec::decode(&SnapshotCodec::encode(&r)).unwrap();
        assert_eq!(decoded.state(), TaskState::Completed);
        assert_eq!(decoded.downloaded_bytes(), 1000);
        assert_eq!(decoded.total_bytes(), Some(1000));
        assert_eq!(decoded.error_code(), 0);
        assert!(decoded.same_transferable_fields(&r));
    }

    #[test]
    fn failed_record_with_metadata_round_trips() {
        let mut r =
            TaskRecord::create("https://例え.jp/ファイル", "/下载", "ファイル.bin", None)
                .unwrap()
                .with_id(42);
        r.set_resumable(true).unwrap();
        r.set_last_modified_tag("\"etag-1\"").unwrap();
        r.transition_to(TaskState::Running, None).unwrap();
        r.advance_progress(12).unwrap();
        r.transition_to(TaskState::Failed, Some(-5)).unwrap();

        let decoded = SnapshotCodec::decode(&SnapshotCodec::encode(&r)).unwrap();
        assert!(decoded.same_transferable_fields(&r));
        assert_eq!(decoded.id(), Some(42));
        assert_eq!(decoded.total_bytes(), None);
        assert_eq!(decoded.error_code(), -5);
    }

    #[test]
    fn decode_resets_timestamps() {
        let r = sample();
        let decoded = SnapshotCodec::decode(&SnapshotCodec::encode(&r)).unwrap();
        assert_eq!(decoded.created_at(), decoded.updated_at());
        assert!(decoded.created_at() >= r.created_at());
    }

    #[test]
    fn every_truncation_is_rejected() {
        let bytes = SnapshotCodec::encode(&sample());
        for cut in 0..bytes.len() {
            let err = SnapshotCodec::decode(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, TaskError::MalformedEncoding(_)), "cut at {cut}: {err:?}");
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = SnapshotCodec::encode(&sample()).to_vec();
        bytes.push(0);
        assert!(matches!(
            SnapshotCodec::decode(&bytes),
            Err(TaskError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn header_mismatches_are_rejected() {
        let good = SnapshotCodec::encode(&sample()).to_vec();

        let mut bad_version = good.clone();
        bad_version[0] = 2;
        assert!(SnapshotCodec::decode(&bad_version).is_err());

        let mut bad_count = good;
        bad_count[1] = 11;
        assert!(matches!(
            SnapshotCodec::decode(&bad_count),
            Err(TaskError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn unknown_state_is_rejected() {
        let mut bytes = SnapshotCodec::encode(&sample()).to_vec();
        // state byte sits right before the trailing i32 error code
        let state_at = bytes.len() - 5;
        bytes[state_at] = 9;
        let err = SnapshotCodec::decode(&bytes).unwrap_err();
        assert!(matches!(err, TaskError::MalformedEncoding(ref m) if m.contains("state")));
    }

    #[test]
    fn invalid_boolean_is_rejected() {
        let r = sample();
        let mut bytes = SnapshotCodec::encode(&r).to_vec();
        let resumable_at = 2
            + 8
            + 4
            + r.source_url().len()
            + 4
            + r.destination_path().to_string_lossy().len()
            + 4
            + r.file_name().len();
        bytes[resumable_at] = 2;
        assert!(matches!(
            SnapshotCodec::decode(&bytes),
            Err(TaskError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn invariant_breaking_payload_is_rejected() {
        let mut bytes = SnapshotCodec::encode(&sample()).to_vec();
        // error code on a pending task
        let n = bytes.len();
        bytes[n - 4..].copy_from_slice(&7i32.to_be_bytes());
        assert!(matches!(
            SnapshotCodec::decode(&bytes),
            Err(TaskError::MalformedEncoding(_))
        ));
    }
}
