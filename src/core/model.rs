use crate::core::errors::{TaskError, TaskResult};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

pub type TaskId = i64;

/// Byte counts are persisted and transferred as `i64`.
pub const MAX_BYTES: u64 = i64::MAX as u64;

/// Longest accepted text field, in bytes. Snapshot length prefixes are `u32`.
pub const MAX_TEXT_LEN: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Running,
        TaskState::Paused,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Stable numeric code used by the database column and the snapshot format.
    pub fn code(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            TaskState::Paused => 2,
            TaskState::Completed => 3,
            TaskState::Failed => 4,
            TaskState::Cancelled => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TaskState::Pending),
            1 => Some(TaskState::Running),
            2 => Some(TaskState::Paused),
            3 => Some(TaskState::Completed),
            4 => Some(TaskState::Failed),
            5 => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// One download task: a single file fetched from a single URL.
///
/// The record is a plain value. It never holds a store handle; persistence is
/// done by passing it to a [`TaskStore`](crate::core::store::TaskStore).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    id: Option<TaskId>,
    source_url: String,
    destination_path: PathBuf,
    file_name: String,
    resumable: bool,
    downloaded_bytes: u64,
    total_bytes: Option<u64>,
    last_modified_tag: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    state: TaskState,
    error_code: i32,
}

/// Field set shared by the snapshot decoder and the store row mapper.
#[derive(Debug, Clone)]
pub(crate) struct RawTask {
    pub id: Option<TaskId>,
    pub source_url: String,
    pub destination_path: PathBuf,
    pub file_name: String,
    pub resumable: bool,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub last_modified_tag: String,
    pub state: TaskState,
    pub error_code: i32,
}

impl TaskRecord {
    pub fn create(
        source_url: impl Into<String>,
        destination_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        total_bytes: Option<u64>,
    ) -> TaskResult<Self> {
        let now = Utc::now();
        Self::from_raw(
            RawTask {
                id: None,
                source_url: source_url.into(),
                destination_path: destination_path.into(),
                file_name: file_name.into(),
                resumable: false,
                downloaded_bytes: 0,
                total_bytes,
                last_modified_tag: String::new(),
                state: TaskState::Pending,
                error_code: 0,
            },
            now,
            now,
        )
    }

    /// Rebuilds a record from stored or transferred parts, checking every invariant.
    pub(crate) fn from_raw(
        raw: RawTask,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> TaskResult<Self> {
        if raw.source_url.is_empty() {
            return Err(TaskError::InvalidArgument("source url is empty".into()));
        }
        if raw.destination_path.as_os_str().is_empty() {
            return Err(TaskError::InvalidArgument("destination path is empty".into()));
        }
        if raw.destination_path.to_str().is_none() {
            return Err(TaskError::InvalidArgument(format!(
                "destination path is not valid UTF-8: {}",
                raw.destination_path.display()
            )));
        }
        if raw.file_name.is_empty() {
            return Err(TaskError::InvalidArgument("file name is empty".into()));
        }
        for (field, len) in [
            ("source url", raw.source_url.len()),
            ("destination path", raw.destination_path.as_os_str().len()),
            ("file name", raw.file_name.len()),
            ("last modified tag", raw.last_modified_tag.len()),
        ] {
            if len > MAX_TEXT_LEN {
                return Err(TaskError::InvalidArgument(format!(
                    "{field} is {len} bytes, limit is {MAX_TEXT_LEN}"
                )));
            }
        }
        if let Some(id) = raw.id {
            if id <= 0 {
                return Err(TaskError::InvalidArgument(format!(
                    "task id must be positive, got {id}"
                )));
            }
        }
        if let Some(total) = raw.total_bytes {
            if total > MAX_BYTES {
                return Err(TaskError::InvalidArgument(format!("total bytes {total} out of range")));
            }
            if raw.downloaded_bytes > total {
                return Err(TaskError::InvariantViolation(format!(
                    "downloaded {} exceeds total {}",
                    raw.downloaded_bytes, total
                )));
            }
        }
        if raw.downloaded_bytes > MAX_BYTES {
            return Err(TaskError::InvariantViolation(format!(
                "downloaded bytes {} out of range",
                raw.downloaded_bytes
            )));
        }
        match (raw.state, raw.error_code) {
            (TaskState::Failed, 0) => {
                return Err(TaskError::InvariantViolation("failed task without error code".into()));
            }
            (TaskState::Failed, _) | (_, 0) => {}
            (state, code) => {
                return Err(TaskError::InvariantViolation(format!(
                    "error code {code} on {} task",
                    state.as_str()
                )));
            }
        }
        if updated_at < created_at {
            return Err(TaskError::InvariantViolation("updated_at precedes created_at".into()));
        }

        Ok(Self {
            id: raw.id,
            source_url: raw.source_url,
            destination_path: raw.destination_path,
            file_name: raw.file_name,
            resumable: raw.resumable,
            downloaded_bytes: raw.downloaded_bytes,
            total_bytes: raw.total_bytes,
            last_modified_tag: raw.last_modified_tag,
            created_at,
            updated_at,
            state: raw.state,
            error_code: raw.error_code,
        })
    }

    pub(crate) fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<TaskId> {
        self.id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn destination_path(&self) -> &Path {
        &self.destination_path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Full on-disk target: destination path joined with the file name.
    pub fn target_path(&self) -> PathBuf {
        self.destination_path.join(&self.file_name)
    }

    pub fn resumable(&self) -> bool {
        self.resumable
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn last_modified_tag(&self) -> &str {
        &self.last_modified_tag
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Everything that still shows up in the active list: not completed and not cancelled.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, TaskState::Completed | TaskState::Cancelled)
    }

    /// Offset a fetch should continue from.
    pub fn resume_offset(&self) -> u64 {
        if self.resumable {
            self.downloaded_bytes
        } else {
            0
        }
    }

    pub fn progress_ratio(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some(self.downloaded_bytes as f64 / total as f64),
            None => None,
        }
    }

    pub fn advance_progress(&mut self, bytes: u64) -> TaskResult<()> {
        if self.state != TaskState::Running {
            return Err(TaskError::InvalidTransition {
                from: self.state,
                to: TaskState::Running,
            });
        }
        let next = self
            .downloaded_bytes
            .checked_add(bytes)
            .filter(|n| *n <= MAX_BYTES)
            .ok_or_else(|| {
                TaskError::InvariantViolation(format!(
                    "progress overflow: {} + {}",
                    self.downloaded_bytes, bytes
                ))
            })?;
        if let Some(total) = self.total_bytes {
            if next > total {
                return Err(TaskError::InvariantViolation(format!(
                    "downloaded {next} would exceed total {total}"
                )));
            }
        }

        self.downloaded_bytes = next;
        self.touch();
        Ok(())
    }

    pub fn transition_to(&mut self, next: TaskState, error_code: Option<i32>) -> TaskResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(TaskError::InvalidTransition { from: self.state, to: next });
        }
        let code = if next == TaskState::Failed {
            match error_code {
                Some(code) if code != 0 => code,
                _ => {
                    return Err(TaskError::InvalidArgument(
                        "a non-zero error code is required to fail a task".into(),
                    ))
                }
            }
        } else {
            0
        };
        if next == TaskState::Completed {
            if let Some(total) = self.total_bytes {
                if self.downloaded_bytes != total {
                    return Err(TaskError::InvariantViolation(format!(
                        "cannot complete with {} of {} bytes",
                        self.downloaded_bytes, total
                    )));
                }
            }
            self.total_bytes = Some(self.downloaded_bytes);
        }

        self.state = next;
        self.error_code = code;
        self.touch();
        Ok(())
    }

    /// Records the size once the origin reports it.
    pub fn set_total_bytes(&mut self, total: u64) -> TaskResult<()> {
        match self.total_bytes {
            Some(known) if known == total => return Ok(()),
            Some(known) => {
                return Err(TaskError::InvariantViolation(format!(
                    "total bytes already known ({known}), got {total}"
                )))
            }
            None => {}
        }
        if total > MAX_BYTES {
            return Err(TaskError::InvalidArgument(format!("total bytes {total} out of range")));
        }
        if self.downloaded_bytes > total {
            return Err(TaskError::InvariantViolation(format!(
                "total {total} is below downloaded {}",
                self.downloaded_bytes
            )));
        }

        self.total_bytes = Some(total);
        self.touch();
        Ok(())
    }

    pub fn set_resumable(&mut self, resumable: bool) -> TaskResult<()> {
        self.ensure_not_terminal()?;
        self.resumable = resumable;
        self.touch();
        Ok(())
    }

    pub fn set_last_modified_tag(&mut self, tag: impl Into<String>) -> TaskResult<()> {
        self.ensure_not_terminal()?;
        let tag = tag.into();
        if tag.len() > MAX_TEXT_LEN {
            return Err(TaskError::InvalidArgument(format!(
                "last modified tag is {} bytes, limit is {MAX_TEXT_LEN}",
                tag.len()
            )));
        }
        self.last_modified_tag = tag;
        self.touch();
        Ok(())
    }

    /// Continues a paused task. Unlike `transition_to(Running)` this refuses
    /// tasks that were never started.
    pub fn resume(&mut self) -> TaskResult<()> {
        if self.state != TaskState::Paused {
            return Err(TaskError::InvalidTransition {
                from: self.state,
                to: TaskState::Running,
            });
        }
        self.transition_to(TaskState::Running, None)
    }

    /// Drops partial progress and the stale validator so the next fetch
    /// starts from byte zero.
    pub fn rewind(&mut self) -> TaskResult<()> {
        if !matches!(self.state, TaskState::Pending | TaskState::Paused) {
            return Err(TaskError::InvalidTransition {
                from: self.state,
                to: TaskState::Pending,
            });
        }
        self.downloaded_bytes = 0;
        self.last_modified_tag.clear();
        self.touch();
        Ok(())
    }

    /// Checks that `next` is a legal later version of this stored record:
    /// same target, an allowed state edge, no lost progress except a rewind,
    /// a total that never changes once known and no older `updated_at`.
    pub(crate) fn check_successor(&self, next: &TaskRecord) -> TaskResult<()> {
        if self.id != next.id
            || self.source_url != next.source_url
            || self.destination_path != next.destination_path
            || self.file_name != next.file_name
        {
            return Err(TaskError::InvalidArgument(
                "identity fields of a stored task cannot change".into(),
            ));
        }
        if self.state != next.state && !self.state.can_transition_to(next.state) {
            return Err(TaskError::InvalidTransition {
                from: self.state,
                to: next.state,
            });
        }
        if next.downloaded_bytes < self.downloaded_bytes {
            let rewound = next.downloaded_bytes == 0
                && self.state == next.state
                && matches!(next.state, TaskState::Pending | TaskState::Paused);
            if !rewound {
                return Err(TaskError::InvariantViolation(format!(
                    "downloaded bytes would go back from {} to {}",
                    self.downloaded_bytes, next.downloaded_bytes
                )));
            }
        }
        if let Some(known) = self.total_bytes {
            if next.total_bytes != Some(known) {
                return Err(TaskError::InvariantViolation(format!(
                    "total bytes already known ({known})"
                )));
            }
        }
        // stored timestamps carry millisecond precision
        if next.updated_at.timestamp_millis() < self.updated_at.timestamp_millis() {
            return Err(TaskError::InvariantViolation(
                "write is older than the stored record".into(),
            ));
        }
        Ok(())
    }

    /// Compares the ten fields that travel in a snapshot.
    pub fn same_transferable_fields(&self, other: &TaskRecord) -> bool {
        self.id == other.id
            && self.source_url == other.source_url
            && self.destination_path == other.destination_path
            && self.file_name == other.file_name
            && self.resumable == other.resumable
            && self.downloaded_bytes == other.downloaded_bytes
            && self.total_bytes == other.total_bytes
            && self.last_modified_tag == other.last_modified_tag
            && self.state == other.state
            && self.error_code == other.error_code
    }

    fn ensure_not_terminal(&self) -> TaskResult<()> {
        if self.state.is_terminal() {
            return Err(TaskError::InvalidTransition { from: self.state, to: self.state });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total: Option<u64>) -> TaskRecord {
        TaskRecord::create("https://x/file.zip", "/dl", "file.zip", total).unwrap()
    }

    fn running(total: Option<u64>) -> TaskRecord {
        let mut r = record(total);
        r.transition_to(TaskState::Running, None).unwrap();
        r
    }

    #[test]
    fn create_initializes_pending() {
        let r = record(Some(1000));
        assert_eq!(r.state(), TaskState::Pending);
        assert_eq!(r.downloaded_bytes(), 0);
        assert_eq!(r.total_bytes(), Some(1000));
        assert_eq!(r.created_at(), r.updated_at());
        assert_eq!(r.error_code(), 0);
        assert!(!r.resumable());
        assert_eq!(r.id(), None);
        assert_eq!(r.target_path(), PathBuf::from("/dl/file.zip"));
    }

    #[test]
    fn create_rejects_empty_inputs() {
        for (url, dir, name) in [("", "/dl", "a"), ("u", "", "a"), ("u", "/dl", "")] {
            let err = TaskRecord::create(url, dir, name, None).unwrap_err();
            assert!(matches!(err, TaskError::InvalidArgument(_)), "{err:?}");
        }
    }

    #[test]
    fn create_rejects_oversized_total() {
        let err = TaskRecord::create("u", "/dl", "a", Some(u64::MAX)).unwrap_err();
        assert!(matches!(err, TaskError::InvalidArgument(_)));
    }

    #[test]
    fn transition_table_is_enforced() {
        let allowed = [
            (TaskState::Pending, TaskState::Running),
            (TaskState::Running, TaskState::Paused),
            (TaskState::Running, TaskState::Completed),
            (TaskState::Running, TaskState::Failed),
            (TaskState::Running, TaskState::Cancelled),
            (TaskState::Paused, TaskState::Running),
            (TaskState::Paused, TaskState::Cancelled),
        ];
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn disallowed_transition_leaves_record_unchanged() {
        let mut r = running(Some(10));
        r.transition_to(TaskState::Failed, Some(7)).unwrap();
        let before = r.clone();

        for to in TaskState::ALL {
            let err = r.transition_to(to, Some(1)).unwrap_err();
            assert_eq!(err, TaskError::InvalidTransition { from: TaskState::Failed, to });
        }
        assert_eq!(r, before);
        assert_eq!(r.error_code(), 7);
    }

    #[test]
    fn pending_cannot_pause_or_complete() {
        let mut r = record(None);
        for to in [
            TaskState::Paused,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            assert!(matches!(
                r.transition_to(to, Some(3)),
                Err(TaskError::InvalidTransition { .. })
            ));
        }
        assert_eq!(r.state(), TaskState::Pending);
    }

    #[test]
    fn failing_requires_error_code() {
        let mut r = running(None);
        assert!(matches!(
            r.transition_to(TaskState::Failed, None),
            Err(TaskError::InvalidArgument(_))
        ));
        assert!(matches!(
            r.transition_to(TaskState::Failed, Some(0)),
            Err(TaskError::InvalidArgument(_))
        ));
        assert_eq!(r.state(), TaskState::Running);

        r.transition_to(TaskState::Failed, Some(404)).unwrap();
        assert_eq!(r.error_code(), 404);
    }

    #[test]
    fn error_code_ignored_outside_failed() {
        let mut r = running(None);
        r.transition_to(TaskState::Paused, Some(9)).unwrap();
        assert_eq!(r.error_code(), 0);
    }

    #[test]
    fn advance_requires_running() {
        let mut r = record(Some(10));
        assert!(matches!(r.advance_progress(1), Err(TaskError::InvalidTransition { .. })));
        assert_eq!(r.downloaded_bytes(), 0);
    }

    #[test]
    fn advance_past_total_is_rejected() {
        let mut r = running(Some(1000));
        r.advance_progress(400).unwrap();
        let before = r.clone();

        let err = r.advance_progress(1500).unwrap_err();
        assert!(matches!(err, TaskError::InvariantViolation(_)));
        assert_eq!(r, before);
        assert_eq!(r.downloaded_bytes(), 400);
    }

    #[test]
    fn advance_with_unknown_total_checks_overflow() {
        let mut r = running(None);
        r.advance_progress(MAX_BYTES).unwrap();
        assert!(matches!(r.advance_progress(1), Err(TaskError::InvariantViolation(_))));
        assert_eq!(r.downloaded_bytes(), MAX_BYTES);
    }

    #[test]
    fn updated_at_never_moves_backwards() {
        let mut r = running(Some(100));
        let mut last = r.updated_at();
        for _ in 0..10 {
            r.advance_progress(5).unwrap();
            assert!(r.updated_at() >= last);
            last = r.updated_at();
        }
        assert!(r.updated_at() >= r.created_at());
    }

    #[test]
    fn complete_requires_all_bytes_when_size_known() {
        let mut r = running(Some(10));
        r.advance_progress(4).unwrap();
        assert!(matches!(
            r.transition_to(TaskState::Completed, None),
            Err(TaskError::InvariantViolation(_))
        ));
        assert_eq!(r.state(), TaskState::Running);

        r.advance_progress(6).unwrap();
        r.transition_to(TaskState::Completed, None).unwrap();
        assert_eq!(r.state(), TaskState::Completed);
    }

    #[test]
    fn complete_with_unknown_size_fixes_total() {
        let mut r = running(None);
        r.advance_progress(77).unwrap();
        r.transition_to(TaskState::Completed, None).unwrap();
        assert_eq!(r.total_bytes(), Some(77));
    }

    #[test]
    fn total_bytes_is_set_once() {
        let mut r = running(None);
        r.advance_progress(50).unwrap();
        assert!(matches!(r.set_total_bytes(10), Err(TaskError::InvariantViolation(_))));
        r.set_total_bytes(100).unwrap();
        r.set_total_bytes(100).unwrap();
        assert!(matches!(r.set_total_bytes(200), Err(TaskError::InvariantViolation(_))));
        assert_eq!(r.total_bytes(), Some(100));
    }

    #[test]
    fn rewind_only_when_idle() {
        let mut r = running(Some(10));
        r.advance_progress(5).unwrap();
        assert!(r.rewind().is_err());

        r.set_last_modified_tag("\"etag-old\"").unwrap();
        r.transition_to(TaskState::Paused, None).unwrap();
        r.rewind().unwrap();
        assert_eq!(r.downloaded_bytes(), 0);
        assert_eq!(r.last_modified_tag(), "");
        assert_eq!(r.state(), TaskState::Paused);
    }

    #[test]
    fn resume_only_from_paused() {
        let mut r = record(None);
        assert!(matches!(r.resume(), Err(TaskError::InvalidTransition { .. })));
        assert_eq!(r.state(), TaskState::Pending);

        r.transition_to(TaskState::Running, None).unwrap();
        r.transition_to(TaskState::Paused, None).unwrap();
        r.resume().unwrap();
        assert_eq!(r.state(), TaskState::Running);
    }

    #[test]
    fn oversized_text_is_rejected() {
        let long = "a".repeat(MAX_TEXT_LEN + 1);
        let err = TaskRecord::create(long.as_str(), "/dl", "a", None).unwrap_err();
        assert!(matches!(err, TaskError::InvalidArgument(_)));

        let mut r = record(None);
        assert!(r.set_last_modified_tag("a".repeat(MAX_TEXT_LEN + 1)).is_err());
        r.set_last_modified_tag("a".repeat(MAX_TEXT_LEN)).unwrap();
        let decoded = crate::core::snapshot::SnapshotCodec::decode(
            &crate::core::snapshot::SnapshotCodec::encode(&r),
        )
        .unwrap();
        assert_eq!(decoded.last_modified_tag().len(), MAX_TEXT_LEN);
    }

    #[test]
    fn successor_check_rejects_stale_writes() {
        let stale = record(Some(100)).with_id(1);
        let mut stored = stale.clone();
        stored.transition_to(TaskState::Running, None).unwrap();
        stored.advance_progress(60).unwrap();
        stored.transition_to(TaskState::Cancelled, None).unwrap();

        assert!(matches!(
            stored.check_successor(&stale),
            Err(TaskError::InvalidTransition { .. })
        ));

        let mut next = stale.clone();
        next.transition_to(TaskState::Running, None).unwrap();
        stale.check_successor(&next).unwrap();
    }

    #[test]
    fn resume_offset_follows_resumable_flag() {
        let mut r = running(Some(10));
        r.advance_progress(6).unwrap();
        assert_eq!(r.resume_offset(), 0);
        r.set_resumable(true).unwrap();
        assert_eq!(r.resume_offset(), 6);
        assert_eq!(r.progress_ratio(), Some(0.6));
    }

    #[test]
    fn terminal_records_reject_metadata_changes() {
        let mut r = running(None);
        r.transition_to(TaskState::Cancelled, None).unwrap();
        assert!(r.set_resumable(true).is_err());
        assert!(r.set_last_modified_tag("W/\"abc\"").is_err());
        assert!(!r.is_active());
    }

    #[test]
    fn state_codes_are_stable() {
        for s in TaskState::ALL {
            assert_eq!(TaskState::from_code(s.code()), Some(s));
        }
        assert_eq!(TaskState::from_code(6), None);
    }
}
