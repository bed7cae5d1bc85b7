//! Mapping between domain entities and wire payloads.
//!
//! All functions are pure. String fields are truncated to fixed limits on the
//! way out; truncation counts characters and never fails. The `deserialize_*`
//! counterparts of the outbound payloads exist for the coordinator side of
//! tests and for tooling that replays captured traffic.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::codec::MessageType;
use crate::error::ProtocolError;
use crate::model::{
    Failure, ItemKind, Location, Report, ReportItem, Schedule, ScheduleBatch, ScheduleItem,
    Status, SuiteItem, Tag,
};
use crate::settings::Settings;

/// Timestamp layout on the wire. Whole seconds, UTC.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.000Z";

/// Limit for paths, URLs, free text and location parts.
pub const LONG: usize = 1024;
/// Limit for identifiers and names.
pub const SHORT: usize = 64;
/// Limit for version strings.
pub const VERSION: usize = 32;

/// First `max` characters of `text`.
#[must_use]
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

fn truncate_opt(text: Option<&String>, max: usize) -> Value {
    text.map_or(Value::Null, |s| Value::String(truncate(s, max)))
}

#[must_use]
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(text: &str, message_type: MessageType) -> Result<DateTime<Utc>, ProtocolError> {
    NaiveDateTime::parse_from_str(text, DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| malformed(message_type, format!("invalid date '{text}': {e}")))
}

fn malformed(message_type: MessageType, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedPayload {
        message_type: message_type.as_str().to_string(),
        reason: reason.into(),
    }
}

// =============================================================================
// Config
// =============================================================================

/// Payload of the `config` reply.
#[must_use]
pub fn serialize_config(settings: &Settings, worker_id: u32) -> Value {
    let s = settings;
    json!({
        "build": {
            "dir": truncate(&s.build_dir, LONG),
            "id": truncate_opt(s.build_id.as_ref(), SHORT),
            "job": truncate_opt(s.build_job.as_ref(), SHORT),
            "node": truncate(&s.build_node, 256),
            "pool": s.build_pool,
            "project": truncate_opt(s.build_project.as_ref(), LONG),
            "url": truncate_opt(s.build_url.as_ref(), LONG),
        },
        "client": {
            "capabilities": s.client_capabilities.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            "messages": MessageType::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            "name": truncate(&s.client_name, SHORT),
            "version": truncate(&s.client_version, VERSION),
            "workers": s.client_workers,
            "worker_id": worker_id,
        },
        "platform": {
            "name": truncate(&s.platform_name, SHORT),
            "version": truncate_opt(s.platform_version.as_ref(), VERSION),
        },
        "runner": {
            "args": s.runner_args.iter().map(|arg| truncate(arg, 255)).collect::<Vec<_>>(),
            "name": truncate_opt(s.runner_name.as_ref(), SHORT),
            "plugins": s.runner_plugins.iter().map(|(name, version)| json!({
                "name": truncate(name, SHORT),
                "version": truncate(version, SHORT),
            })).collect::<Vec<_>>(),
            "root": truncate_opt(s.runner_root.as_ref(), LONG),
            "version": truncate_opt(s.runner_version.as_ref(), VERSION),
        },
        "system": {
            "context": s.system_context,
            "cpus": s.system_cpus,
            "os": truncate(&s.system_os_name, SHORT),
            "os_version": truncate_opt(s.system_os_version.as_ref(), VERSION),
            "provider": truncate(&s.system_provider, SHORT),
            "ram": s.system_ram,
        },
        "vcs": {
            "branch": truncate_opt(s.vcs_branch.as_ref(), LONG),
            "pr": truncate_opt(s.vcs_pr.as_ref(), SHORT),
            "repo": truncate_opt(s.vcs_repo.as_ref(), LONG),
            "revision": truncate_opt(s.vcs_revision.as_ref(), SHORT),
            "revision_message": truncate_opt(s.vcs_revision_message.as_ref(), LONG),
            "tag": truncate_opt(s.vcs_tag.as_ref(), LONG),
            "type": truncate(&s.vcs_type, SHORT),
        },
    })
}

// =============================================================================
// Location
// =============================================================================

#[must_use]
pub fn serialize_location(location: &Location) -> Value {
    let mut data = Map::new();
    data.insert("file".into(), truncate(&location.file, LONG).into());
    if let Some(func) = &location.func {
        data.insert("func".into(), truncate(func, LONG).into());
    }
    if let Some(module) = &location.module {
        data.insert("module".into(), truncate(module, LONG).into());
    }
    if let Some(class) = &location.class {
        data.insert("class".into(), truncate(class, LONG).into());
    }
    if let Some(line) = location.line {
        data.insert("line".into(), line.into());
    }
    Value::Object(data)
}

fn deserialize_location(value: &Value, ty: MessageType) -> Result<Location, ProtocolError> {
    let object = value
        .as_object()
        .ok_or_else(|| malformed(ty, "location is not an object"))?;
    let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);
    let file = text("file").ok_or_else(|| malformed(ty, "location without file"))?;
    let line = match object.get("line") {
        None | Some(Value::Null) => None,
        Some(line) => Some(
            line.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| malformed(ty, "line is not a number"))?,
        ),
    };
    Ok(Location {
        file,
        module: text("module"),
        class: text("class"),
        func: text("func"),
        line,
    })
}

fn object_of<'a>(value: &'a Value, ty: MessageType) -> Result<&'a Map<String, Value>, ProtocolError> {
    value
        .as_object()
        .ok_or_else(|| malformed(ty, "expected an object"))
}

fn array_of<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    ty: MessageType,
) -> Result<&'a [Value], ProtocolError> {
    object
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| malformed(ty, format!("missing list '{key}'")))
}

fn kind_of(object: &Map<String, Value>, ty: MessageType) -> Result<ItemKind, ProtocolError> {
    object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(ty, "item without type"))?
        .parse()
        .map_err(|e: String| malformed(ty, e))
}

// =============================================================================
// Suite
// =============================================================================

/// Payload of the `suite` message.
#[must_use]
pub fn serialize_suite<'a>(items: impl IntoIterator<Item = &'a SuiteItem>) -> Value {
    json!({ "items": items.into_iter().map(serialize_suite_item).collect::<Vec<_>>() })
}

fn serialize_suite_item(item: &SuiteItem) -> Value {
    let mut data = Map::new();
    data.insert("type".into(), item.kind.as_str().into());
    data.insert("location".into(), serialize_location(&item.location));
    if let Some(size) = item.size {
        data.insert("file_size".into(), size.into());
    }
    if let Some(scope) = &item.scope {
        data.insert("scope".into(), truncate(scope, SHORT).into());
    }
    if !item.tags.is_empty() {
        data.insert(
            "tags".into(),
            item.tags.iter().map(serialize_tag).collect::<Vec<_>>().into(),
        );
    }
    if !item.deps.is_empty() {
        // dependencies are references: type and location only
        let deps: Vec<Value> = item
            .deps
            .iter()
            .map(|dep| json!({"type": dep.kind.as_str(), "location": serialize_location(&dep.location)}))
            .collect();
        data.insert("deps".into(), deps.into());
    }
    Value::Object(data)
}

fn serialize_tag(tag: &Tag) -> Value {
    let mut data = Map::new();
    if let Some(group) = &tag.group {
        data.insert("group".into(), truncate(group, LONG).into());
    }
    if tag.singleton {
        data.insert("singleton".into(), true.into());
    }
    Value::Object(data)
}

/// Inverse of [`serialize_suite`]. Dependencies come back as bare references.
pub fn deserialize_suite(payload: &Value) -> Result<Vec<SuiteItem>, ProtocolError> {
    let ty = MessageType::Suite;
    array_of(object_of(payload, ty)?, "items", ty)?
        .iter()
        .map(|value| deserialize_suite_item(value, true))
        .collect()
}

fn deserialize_suite_item(value: &Value, with_deps: bool) -> Result<SuiteItem, ProtocolError> {
    let ty = MessageType::Suite;
    let object = object_of(value, ty)?;
    let location = object
        .get("location")
        .ok_or_else(|| malformed(ty, "item without location"))?;
    let mut item = SuiteItem::new(kind_of(object, ty)?, deserialize_location(location, ty)?);
    item.size = object.get("file_size").and_then(Value::as_u64);
    item.scope = object.get("scope").and_then(Value::as_str).map(str::to_string);
    if let Some(tags) = object.get("tags").and_then(Value::as_array) {
        item.tags = tags
            .iter()
            .map(|tag| Tag {
                group: tag.get("group").and_then(Value::as_str).map(str::to_string),
                singleton: tag.get("singleton").and_then(Value::as_bool).unwrap_or(false),
            })
            .collect();
    }
    if with_deps {
        if let Some(deps) = object.get("deps").and_then(Value::as_array) {
            item.deps = deps
                .iter()
                .map(|dep| deserialize_suite_item(dep, false))
                .collect::<Result<_, _>>()?;
        }
    }
    Ok(item)
}

// =============================================================================
// Report
// =============================================================================

/// Payload of the `report` message.
#[must_use]
pub fn serialize_report(report: &Report) -> Value {
    json!({
        "items": report.items.iter().map(serialize_report_item).collect::<Vec<_>>(),
        "pending_at": format_date(&report.pending_at),
        "started_at": format_date(&report.started_at),
        "finished_at": format_date(&report.finished_at),
    })
}

fn serialize_report_item(item: &ReportItem) -> Value {
    let mut data = Map::new();
    data.insert("type".into(), item.kind.as_str().into());
    data.insert("location".into(), serialize_location(&item.location));
    data.insert("status".into(), item.status.as_str().into());
    if let Some(started_at) = &item.started_at {
        data.insert("started_at".into(), format_date(started_at).into());
    }
    if let Some(finished_at) = &item.finished_at {
        data.insert("finished_at".into(), format_date(finished_at).into());
    }
    if let Some(error) = &item.error {
        data.insert(
            "error".into(),
            json!({"type": truncate(&error.kind, LONG), "message": truncate(&error.message, LONG)}),
        );
    }
    Value::Object(data)
}

/// Inverse of [`serialize_report`].
pub fn deserialize_report(payload: &Value) -> Result<Report, ProtocolError> {
    let ty = MessageType::Report;
    let object = object_of(payload, ty)?;
    let date = |key: &str| -> Result<DateTime<Utc>, ProtocolError> {
        let text = object
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(ty, format!("missing '{key}'")))?;
        parse_date(text, ty)
    };
    let items = array_of(object, "items", ty)?
        .iter()
        .map(deserialize_report_item)
        .collect::<Result<_, _>>()?;
    Ok(Report {
        items,
        pending_at: date("pending_at")?,
        started_at: date("started_at")?,
        finished_at: date("finished_at")?,
    })
}

fn deserialize_report_item(value: &Value) -> Result<ReportItem, ProtocolError> {
    let ty = MessageType::Report;
    let object = object_of(value, ty)?;
    let location = object
        .get("location")
        .ok_or_else(|| malformed(ty, "item without location"))?;
    let status: Status = object
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(ty, "item without status"))?
        .parse()
        .map_err(|e: String| malformed(ty, e))?;
    let optional_date = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(|text| parse_date(text, ty))
            .transpose()
    };
    let error = object.get("error").map(|error| {
        let text = |key: &str| error.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        Failure::new(text("type"), text("message"))
    });
    Ok(ReportItem {
        kind: kind_of(object, ty)?,
        location: deserialize_location(location, ty)?,
        status,
        error,
        started_at: optional_date("started_at")?,
        finished_at: optional_date("finished_at")?,
    })
}

// =============================================================================
// Schedule
// =============================================================================

/// Decode a `schedule` payload.
///
/// Accepts `{id?, batches: [{items}]}` and the flat `{id?, items}` form,
/// which becomes a single batch.
pub fn deserialize_schedule(payload: &Value) -> Result<Schedule, ProtocolError> {
    let ty = MessageType::Schedule;
    let object = object_of(payload, ty)?;
    let id = match object.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        Some(_) => return Err(malformed(ty, "id is neither string nor number")),
    };
    let batches = if object.contains_key("batches") {
        array_of(object, "batches", ty)?
            .iter()
            .map(|batch| deserialize_batch(object_of(batch, ty)?))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        vec![deserialize_batch(object)?]
    };
    let schedule = Schedule::new(id, batches);
    info!(
        batches = schedule.batches.len(),
        items = schedule.items().count(),
        "received schedule"
    );
    Ok(schedule)
}

fn deserialize_batch(object: &Map<String, Value>) -> Result<ScheduleBatch, ProtocolError> {
    let ty = MessageType::Schedule;
    let items = array_of(object, "items", ty)?
        .iter()
        .map(|item| {
            item.get("file")
                .and_then(Value::as_str)
                .map(ScheduleItem::new)
                .ok_or_else(|| malformed(ty, "schedule item without file"))
        })
        .collect::<Result<_, _>>()?;
    Ok(ScheduleBatch { items })
}

/// Decode a `schedules` payload: a list of schedules.
pub fn deserialize_schedules(payload: &Value) -> Result<Vec<Schedule>, ProtocolError> {
    payload
        .as_array()
        .ok_or_else(|| malformed(MessageType::Schedules, "expected a list"))?
        .iter()
        .map(deserialize_schedule)
        .collect()
}

/// Inverse of [`deserialize_schedule`], in the batched form.
#[must_use]
pub fn serialize_schedule(schedule: &Schedule) -> Value {
    let batches: Vec<Value> = schedule
        .batches
        .iter()
        .map(|batch| {
            json!({"items": batch.items.iter().map(|item| json!({"file": item.file})).collect::<Vec<_>>()})
        })
        .collect();
    let mut data = Map::new();
    if let Some(id) = &schedule.id {
        data.insert("id".into(), id.clone().into());
    }
    data.insert("batches".into(), batches.into());
    Value::Object(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsSources;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 2, 3, 4, secs).unwrap()
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("ääää", 2), "ää");
        assert_eq!(truncate("", 0), "");
    }

    // ── Config ──

    #[test]
    fn config_payload_layout() {
        let settings = SettingsSources::from_args([
            ("build_id", "b".repeat(100)),
            ("vcs_branch", "main".to_string()),
            ("workers", "4".to_string()),
        ])
        .resolve()
        .unwrap();
        let payload = serialize_config(&settings, 2);
        assert_eq!(payload["build"]["id"].as_str().unwrap().len(), 64);
        assert_eq!(payload["build"]["pool"], 0);
        assert_eq!(payload["build"]["job"], Value::Null);
        assert_eq!(payload["client"]["workers"], 4);
        assert_eq!(payload["client"]["worker_id"], 2);
        assert_eq!(payload["client"]["name"], "rust-official");
        assert_eq!(
            payload["client"]["capabilities"],
            json!(["fixtures", "isolated_process", "lifecycle_timings", "split_by_file"])
        );
        assert_eq!(payload["client"]["messages"].as_array().unwrap().len(), 9);
        assert_eq!(payload["vcs"]["branch"], "main");
        assert_eq!(payload["vcs"]["type"], "git");
        assert_eq!(payload["system"]["provider"], "custom");
    }

    // ── Suite ──

    #[test]
    fn suite_item_with_everything() {
        let fixture = SuiteItem::new(ItemKind::Fixture, Location::new("conftest.py").with_func("db").with_line(3))
            .with_tag(Tag::group("never-sent"));
        let item = SuiteItem::new(ItemKind::Test, Location::new("test_a.py").with_func("test_x").with_line(10))
            .with_scope("function")
            .with_tag(Tag::group("db"))
            .with_tag(Tag::singleton())
            .with_dep(fixture);
        let file = SuiteItem::new(ItemKind::File, Location::new("test_a.py")).with_size(1234);

        let payload = serialize_suite([&item, &file]);
        assert_eq!(
            payload,
            json!({"items": [
                {
                    "type": "test",
                    "location": {"file": "test_a.py", "func": "test_x", "line": 10},
                    "scope": "function",
                    "tags": [{"group": "db"}, {"singleton": true}],
                    "deps": [{"type": "fixture", "location": {"file": "conftest.py", "func": "db", "line": 3}}]
                },
                {"type": "file", "location": {"file": "test_a.py"}, "file_size": 1234}
            ]})
        );

        let back = deserialize_suite(&payload).unwrap();
        assert_eq!(back[1], file);
        assert_eq!(back[0].deps[0].location, item.deps[0].location);
        assert!(back[0].deps[0].tags.is_empty());
    }

    #[test]
    fn location_parts_are_truncated() {
        let long = "x".repeat(2000);
        let payload = serialize_location(&Location::new(long.clone()).with_class(long));
        assert_eq!(payload["file"].as_str().unwrap().len(), LONG);
        assert_eq!(payload["class"].as_str().unwrap().len(), LONG);
    }

    // ── Report ──

    #[test]
    fn report_payload_layout() {
        let report = Report {
            items: vec![
                ReportItem::new(ItemKind::Test, Location::new("a.py").with_func("t"), Status::Failed)
                    .with_error(Failure::new("AssertionError", "boom"))
                    .with_timings(at(1), at(2)),
                ReportItem::new(ItemKind::Test, Location::new("b.py"), Status::Passed),
            ],
            pending_at: at(0),
            started_at: at(1),
            finished_at: at(3),
        };
        let payload = serialize_report(&report);
        assert_eq!(payload["pending_at"], "2021-01-02T03:04:00.000Z");
        assert_eq!(payload["items"][0]["status"], "failed");
        assert_eq!(payload["items"][0]["error"], json!({"type": "AssertionError", "message": "boom"}));
        assert_eq!(payload["items"][0]["started_at"], "2021-01-02T03:04:01.000Z");
        assert!(payload["items"][1].get("error").is_none());
        assert!(payload["items"][1].get("started_at").is_none());

        assert_eq!(deserialize_report(&payload).unwrap(), report);
    }

    #[test]
    fn report_dates_drop_subseconds() {
        let date = at(5) + chrono::Duration::milliseconds(750);
        assert_eq!(format_date(&date), "2021-01-02T03:04:05.000Z");
    }

    // ── Schedule ──

    #[test]
    fn schedule_batched_form() {
        let payload = json!({"id": "s1", "batches": [
            {"items": [{"file": "a.py"}]},
            {"items": [{"file": "b.py"}, {"file": "c.py"}]}
        ]});
        let schedule = deserialize_schedule(&payload).unwrap();
        assert_eq!(schedule.id.as_deref(), Some("s1"));
        assert_eq!(schedule.batches.len(), 2);
        assert_eq!(schedule.items().map(|i| i.file.as_str()).collect::<Vec<_>>(), ["a.py", "b.py", "c.py"]);
        assert_eq!(serialize_schedule(&schedule), payload);
    }

    #[test]
    fn schedule_flat_form_is_one_batch() {
        let schedule = deserialize_schedule(&json!({"items": [{"file": "a.py"}]})).unwrap();
        assert_eq!(schedule.id, None);
        assert_eq!(schedule.batches, vec![ScheduleBatch { items: vec![ScheduleItem::new("a.py")] }]);
    }

    #[test]
    fn schedule_numeric_id_becomes_string() {
        let schedule = deserialize_schedule(&json!({"id": 7, "items": []})).unwrap();
        assert_eq!(schedule.id.as_deref(), Some("7"));
        assert!(schedule.is_empty());
    }

    #[test]
    fn schedules_payload_is_a_list() {
        let payload = json!([{"id": "1", "items": [{"file": "a.py"}]}, {"id": "2", "items": []}]);
        let schedules = deserialize_schedules(&payload).unwrap();
        assert_eq!(schedules.len(), 2);
        assert!(deserialize_schedules(&json!({"items": []})).is_err());
    }

    #[test]
    fn malformed_schedules_are_rejected() {
        for payload in [
            json!("nope"),
            json!({}),
            json!({"items": [{"path": "a.py"}]}),
            json!({"batches": [1]}),
            json!({"id": [], "items": []}),
        ] {
            let err = deserialize_schedule(&payload).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedPayload { .. }), "{payload}");
        }
    }
}
