//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use calltrace_runtime::{set_sink, MemorySink, TraceRecord};

/// Runs a scenario with a fresh in-memory sink installed, restores the
/// previous sink, and returns everything recorded. Callers must serialize
/// tests built on this, since the sink registration is process-wide.
pub fn capture<F: FnOnce()>(scenario: F) -> Vec<TraceRecord> {
    let sink = Arc::new(MemorySink::new());
    let previous = set_sink(sink.clone());
    scenario();
    set_sink(previous);
    sink.take()
}

/// Like [`capture`], but expects the scenario to panic and keeps the records
/// emitted up to and across the unwind.
pub fn capture_panicking<F: FnOnce()>(scenario: F) -> Vec<TraceRecord> {
    let sink = Arc::new(MemorySink::new());
    let previous = set_sink(sink.clone());
    let outcome = catch_unwind(AssertUnwindSafe(scenario));
    set_sink(previous);
    assert!(outcome.is_err(), "scenario was expected to panic");
    sink.take()
}

/// Extracts the bracketed instance tag from a qualified line such as
/// `Counter[3].increment(...)`.
pub fn bracket_tag(line: &str) -> u64 {
    let mut pieces = line.split(|c| c == '[' || c == ']');
    pieces.next();
    pieces
        .next()
        .and_then(|tag| tag.parse().ok())
        .unwrap_or_else(|| panic!("no bracketed tag in {:?}", line))
}
