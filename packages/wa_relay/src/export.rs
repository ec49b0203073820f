//! CSV rendering of event-log records.

use chrono::Utc;
use wa_session::{Direction, EventRecord};

const HEADER: &str = "ts,iso,type,number,name,text,template,source,ok,error";

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn row(record: &EventRecord) -> String {
    let direction = match record.direction {
        Direction::In => "in",
        Direction::Out => "out",
    };
    let ts = record.ts.to_string();
    let ok = record.ok.map(|ok| ok.to_string()).unwrap_or_default();
    [
        ts.as_str(),
        &record.iso,
        direction,
        record.number.as_deref().unwrap_or(""),
        record.name.as_deref().unwrap_or(""),
        record.text.as_deref().unwrap_or(""),
        record.template.as_deref().unwrap_or(""),
        record.source.map(|s| s.as_str()).unwrap_or(""),
        &ok,
        record.error.as_deref().unwrap_or(""),
    ]
    .iter()
    .map(|v| quote(v))
    .collect::<Vec<_>>()
    .join(",")
}

/// Header line plus one row per record, newline separated, every value quoted.
pub fn to_csv(records: &[EventRecord]) -> String {
    std::iter::once(HEADER.to_string())
        .chain(records.iter().map(row))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `events-20240131T101500.csv`
pub fn attachment_name() -> String {
    format!("events-{}.csv", Utc::now().format("%Y%m%dT%H%M%S"))
}
