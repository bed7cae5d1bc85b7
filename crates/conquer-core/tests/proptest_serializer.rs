//! Property-based tests for payload serialization.

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use conquer_core::model::{Failure, ItemKind, Location, Report, ReportItem, Schedule, ScheduleBatch, ScheduleItem, Status};
use conquer_core::serializer::{
    LONG, deserialize_report, deserialize_schedule, format_date, serialize_report, serialize_schedule,
    truncate,
};

// =============================================================================
// Strategies
// =============================================================================

/// Whole-second UTC instants between 2000 and 2100.
fn arb_date() -> impl Strategy<Value = DateTime<Utc>> {
    (946_684_800i64..4_102_444_800i64).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn arb_location() -> impl Strategy<Value = Location> {
    (
        "[a-z/_]{1,30}\\.py",
        prop::option::of("[a-z_.]{1,20}"),
        prop::option::of("[A-Z][a-z]{1,10}"),
        prop::option::of("test_[a-z_]{1,15}"),
        prop::option::of(1u32..10_000),
    )
        .prop_map(|(file, module, class, func, line)| Location {
            file,
            module,
            class,
            func,
            line,
        })
}

fn arb_report_item() -> impl Strategy<Value = ReportItem> {
    (
        prop::sample::select(ItemKind::ALL.to_vec()),
        arb_location(),
        prop::sample::select(Status::ALL.to_vec()),
        prop::option::of(("[A-Za-z]{1,20}", "[ -~]{0,80}")),
        prop::option::of((arb_date(), arb_date())),
    )
        .prop_map(|(kind, location, status, error, timings)| {
            let mut item = ReportItem::new(kind, location, status);
            if let Some((kind, message)) = error {
                item = item.with_error(Failure::new(kind, message));
            }
            if let Some((started, finished)) = timings {
                item = item.with_timings(started, finished);
            }
            item
        })
}

fn arb_report() -> impl Strategy<Value = Report> {
    (
        prop::collection::vec(arb_report_item(), 0..8),
        arb_date(),
        arb_date(),
        arb_date(),
    )
        .prop_map(|(items, pending_at, started_at, finished_at)| Report {
            items,
            pending_at,
            started_at,
            finished_at,
        })
}

fn arb_schedule() -> impl Strategy<Value = Schedule> {
    (
        prop::option::of("[a-z0-9-]{1,12}"),
        prop::collection::vec(prop::collection::vec("[a-z/]{1,12}\\.py", 0..5), 0..4),
    )
        .prop_map(|(id, batches)| {
            Schedule::new(
                id,
                batches
                    .into_iter()
                    .map(|files| ScheduleBatch {
                        items: files.into_iter().map(ScheduleItem::new).collect(),
                    })
                    .collect(),
            )
        })
}

// =============================================================================
// Truncation and dates
// =============================================================================

proptest! {
    #[test]
    fn truncate_keeps_a_char_prefix(text in "\\PC{0,200}", max in 0usize..100) {
        let cut = truncate(&text, max);
        prop_assert!(text.starts_with(&cut));
        if text.chars().count() <= max {
            prop_assert_eq!(cut, text);
        } else {
            prop_assert_eq!(cut.chars().count(), max);
        }
    }

    #[test]
    fn dates_use_whole_seconds(date in arb_date()) {
        let text = format_date(&date);
        prop_assert!(text.ends_with(".000Z"));
        prop_assert_eq!(text.len(), 24);
    }
}

// =============================================================================
// Payloads
// =============================================================================

proptest! {
    #[test]
    fn report_survives_the_wire(report in arb_report()) {
        let payload = serialize_report(&report);
        prop_assert_eq!(deserialize_report(&payload).unwrap(), report);
    }

    #[test]
    fn long_failure_messages_are_capped(message in "[a-z]{1025,1400}") {
        let mut report = Report {
            items: vec![ReportItem::new(ItemKind::Test, Location::new("a.py"), Status::Failed)
                .with_error(Failure::new("AssertionError", message))],
            pending_at: Utc::now(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        let payload = serialize_report(&report);
        let sent = payload["items"][0]["error"]["message"].as_str().unwrap();
        prop_assert_eq!(sent.chars().count(), LONG);
        report.items.clear();
        prop_assert!(serialize_report(&report)["items"].as_array().unwrap().is_empty());
    }

    #[test]
    fn schedule_survives_the_wire(schedule in arb_schedule()) {
        let payload = serialize_schedule(&schedule);
        prop_assert_eq!(deserialize_schedule(&payload).unwrap(), schedule);
    }
}
