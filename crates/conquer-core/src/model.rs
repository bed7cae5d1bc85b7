//! Domain entities exchanged between the collector, the scheduler and the executor.
//!
//! Suite items are created once at collection time and never mutated
//! afterwards. Schedules and reports are transient protocol values: a
//! schedule lives from the moment the coordinator sends it until a worker
//! picks it up, a report from the moment a worker produces it until the
//! scheduler has handed it to the transport.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source location of a collected item. Identity key for suite dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub module: Option<String>,
    pub class: Option<String>,
    pub func: Option<String>,
    pub line: Option<u32>,
}

impl Location {
    #[must_use]
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    #[must_use]
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    #[must_use]
    pub fn with_func(mut self, func: impl Into<String>) -> Self {
        self.func = Some(func.into());
        self
    }

    #[must_use]
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file)?;
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
        }
        for part in [&self.module, &self.class, &self.func].into_iter().flatten() {
            write!(f, "::{part}")?;
        }
        Ok(())
    }
}

/// Kind of collected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Test,
    Fixture,
    Setup,
    Teardown,
    Class,
    File,
}

impl ItemKind {
    pub const ALL: [Self; 6] = [
        Self::Test,
        Self::Fixture,
        Self::Setup,
        Self::Teardown,
        Self::Class,
        Self::File,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Fixture => "fixture",
            Self::Setup => "setup",
            Self::Teardown => "teardown",
            Self::Class => "class",
            Self::File => "file",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown item type: {s}"))
    }
}

/// Scheduling hint: items sharing a group run together, singletons run alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Tag {
    pub group: Option<String>,
    pub singleton: bool,
}

impl Tag {
    #[must_use]
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            singleton: false,
        }
    }

    #[must_use]
    pub fn singleton() -> Self {
        Self {
            group: None,
            singleton: true,
        }
    }
}

/// A collected test, fixture or lifecycle hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteItem {
    pub kind: ItemKind,
    pub location: Location,
    /// Byte size, only meaningful for `file` items.
    pub size: Option<u64>,
    pub scope: Option<String>,
    pub tags: Vec<Tag>,
    /// Items this one depends on (e.g. fixtures a test needs).
    pub deps: Vec<SuiteItem>,
}

impl SuiteItem {
    #[must_use]
    pub fn new(kind: ItemKind, location: Location) -> Self {
        Self {
            kind,
            location,
            size: None,
            scope: None,
            tags: Vec::new(),
            deps: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    #[must_use]
    pub fn with_dep(mut self, dep: SuiteItem) -> Self {
        self.deps.push(dep);
        self
    }
}

/// Ordered collection of suite items, keyed by [`Location`].
///
/// Inserting an item whose location is already present is a no-op, so the
/// buffer never holds two items with equal locations.
#[derive(Debug, Clone, Default)]
pub struct SuiteBuffer {
    items: Vec<SuiteItem>,
    seen: HashSet<Location>,
}

impl SuiteBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the item was stored, `false` for a duplicate.
    pub fn insert(&mut self, item: SuiteItem) -> bool {
        if self.seen.contains(&item.location) {
            return false;
        }
        self.seen.insert(item.location.clone());
        self.items.push(item);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[SuiteItem] {
        &self.items
    }

    pub fn contains(&self, location: &Location) -> bool {
        self.seen.contains(location)
    }
}

impl Extend<SuiteItem> for SuiteBuffer {
    fn extend<I: IntoIterator<Item = SuiteItem>>(&mut self, iter: I) {
        for item in iter {
            self.insert(item);
        }
    }
}

impl FromIterator<SuiteItem> for SuiteBuffer {
    fn from_iter<I: IntoIterator<Item = SuiteItem>>(iter: I) -> Self {
        let mut buffer = Self::new();
        buffer.extend(iter);
        buffer
    }
}

/// A single unit of scheduled work. Currently a file reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub file: String,
}

impl ScheduleItem {
    #[must_use]
    pub fn new(file: impl Into<String>) -> Self {
        Self { file: file.into() }
    }
}

/// Items meant to run together before the next report.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleBatch {
    pub items: Vec<ScheduleItem>,
}

/// Work handed out by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Option<String>,
    pub batches: Vec<ScheduleBatch>,
}

impl Schedule {
    #[must_use]
    pub fn new(id: Option<String>, batches: Vec<ScheduleBatch>) -> Self {
        Self { id, batches }
    }

    /// The empty schedule returned to workers once there is no more work.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|batch| batch.items.is_empty())
    }

    /// All scheduled items in batch order.
    pub fn items(&self) -> impl Iterator<Item = &ScheduleItem> {
        self.batches.iter().flat_map(|batch| batch.items.iter())
    }
}

/// Outcome of one executed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl Status {
    pub const ALL: [Self; 4] = [Self::Passed, Self::Failed, Self::Skipped, Self::Error];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status: {s}"))
    }
}

/// Why an item failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: String,
    pub message: String,
}

impl Failure {
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Result of executing one collected item. References the suite item by location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportItem {
    pub kind: ItemKind,
    pub location: Location,
    pub status: Status,
    pub error: Option<Failure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReportItem {
    #[must_use]
    pub fn new(kind: ItemKind, location: Location, status: Status) -> Self {
        Self {
            kind,
            location,
            status,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, failure: Failure) -> Self {
        self.error = Some(failure);
        self
    }

    #[must_use]
    pub fn with_timings(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self.finished_at = Some(finished_at);
        self
    }
}

/// Results of one executed schedule batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub items: Vec<ReportItem>,
    /// When the batch was handed to the worker.
    pub pending_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_item(file: &str, func: &str) -> SuiteItem {
        SuiteItem::new(ItemKind::Test, Location::new(file).with_func(func))
    }

    #[test]
    fn suite_buffer_collapses_equal_locations() {
        let mut buffer = SuiteBuffer::new();
        assert!(buffer.insert(test_item("a.py", "test_one")));
        assert!(!buffer.insert(test_item("a.py", "test_one").with_size(10)));
        assert!(buffer.insert(test_item("a.py", "test_two")));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.items()[0].size, None);
    }

    #[test]
    fn suite_buffer_preserves_insertion_order() {
        let buffer: SuiteBuffer = ["c.py", "a.py", "b.py", "a.py"]
            .iter()
            .map(|file| SuiteItem::new(ItemKind::File, Location::new(*file)))
            .collect();
        let files: Vec<_> = buffer.items().iter().map(|i| i.location.file.as_str()).collect();
        assert_eq!(files, vec!["c.py", "a.py", "b.py"]);
    }

    #[test]
    fn location_line_is_part_of_identity() {
        let mut buffer = SuiteBuffer::new();
        buffer.insert(SuiteItem::new(ItemKind::Fixture, Location::new("f.py").with_line(1)));
        buffer.insert(SuiteItem::new(ItemKind::Fixture, Location::new("f.py").with_line(2)));
        assert_eq!(buffer.len(), 2);
        assert!(buffer.contains(&Location::new("f.py").with_line(2)));
    }

    #[test]
    fn item_kind_parses_wire_names() {
        for kind in ItemKind::ALL {
            assert_eq!(kind.as_str().parse::<ItemKind>().unwrap(), kind);
        }
        assert!("suite".parse::<ItemKind>().is_err());
    }

    #[test]
    fn status_parses_wire_names() {
        assert_eq!("failed".parse::<Status>().unwrap(), Status::Failed);
        assert_eq!(Status::Skipped.to_string(), "skipped");
        assert!("flaky".parse::<Status>().is_err());
    }

    #[test]
    fn empty_schedule_detection() {
        assert!(Schedule::empty().is_empty());
        let with_empty_batch = Schedule::new(None, vec![ScheduleBatch::default()]);
        assert!(with_empty_batch.is_empty());
        let real = Schedule::new(
            Some("s1".into()),
            vec![ScheduleBatch {
                items: vec![ScheduleItem::new("a.py")],
            }],
        );
        assert!(!real.is_empty());
        assert_eq!(real.items().count(), 1);
    }

    #[test]
    fn location_display() {
        let location = Location::new("tests/a.py")
            .with_line(12)
            .with_class("TestA")
            .with_func("test_x");
        assert_eq!(location.to_string(), "tests/a.py:12::TestA::test_x");
    }
}
