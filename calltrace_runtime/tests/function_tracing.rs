//! End-to-end tracing of free functions through the attribute.

mod common;

use calltrace_runtime::{trace, trace_call, CallTracer, TraceRecord};
use serial_test::serial;

use common::{capture, capture_panicking};

#[trace]
fn add(a: i32, b: i32) -> i32 {
    a + b
}

#[trace]
fn nothing() {}

#[trace]
fn tail(values: Vec<i32>) -> Option<i32> {
    values.last().copied()
}

#[trace]
fn explode() {
    panic!("boom");
}

#[trace]
fn always_fails() -> Vec<u8> {
    panic!("cannot build");
}

#[trace]
#[trace]
fn stacked(x: u8) -> u8 {
    x
}

#[trace]
fn outer_sum(a: i32, b: i32) -> i32 {
    inner_double(a) + b
}

#[trace]
fn inner_double(a: i32) -> i32 {
    a * 2
}

/// Documented and public; the attribute must leave both intact.
#[trace]
pub fn documented(flag: bool) -> bool {
    !flag
}

mod call_and_return_tests {
    use super::*;

    #[test]
    #[serial]
    fn records_arguments_and_return_value() {
        let records = capture(|| {
            assert_eq!(add(2, 3), 5);
        });
        assert_eq!(
            records,
            vec![
                TraceRecord::Call("add(a=2, b=3)".to_string()),
                TraceRecord::Return("add returned 5".to_string()),
            ]
        );
    }

    #[test]
    #[serial]
    fn records_unit_returns() {
        let records = capture(nothing);
        assert_eq!(
            records,
            vec![
                TraceRecord::Call("nothing()".to_string()),
                TraceRecord::Return("nothing returned ()".to_string()),
            ]
        );
    }

    #[test]
    #[serial]
    fn renders_debug_only_values_with_debug() {
        let records = capture(|| {
            assert_eq!(tail(vec![1, 2, 3]), Some(3));
        });
        assert_eq!(
            records,
            vec![
                TraceRecord::Call("tail(values=[1, 2, 3])".to_string()),
                TraceRecord::Return("tail returned Some(3)".to_string()),
            ]
        );
    }

    #[test]
    #[serial]
    fn nested_calls_are_reported_in_execution_order() {
        let records = capture(|| {
            assert_eq!(outer_sum(4, 1), 9);
        });
        assert_eq!(
            records,
            vec![
                TraceRecord::Call("outer_sum(a=4, b=1)".to_string()),
                TraceRecord::Call("inner_double(a=4)".to_string()),
                TraceRecord::Return("inner_double returned 8".to_string()),
                TraceRecord::Return("outer_sum returned 9".to_string()),
            ]
        );
    }

    #[test]
    #[serial]
    fn stacked_attributes_wrap_once() {
        let records = capture(|| {
            assert_eq!(stacked(7), 7);
        });
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], TraceRecord::Call("stacked(x=7)".to_string()));
    }

    #[test]
    #[serial]
    fn traced_functions_stay_callable_through_their_signature() {
        let records = capture(|| {
            assert!(documented(false));
        });
        assert_eq!(records.len(), 2);
    }
}

mod panic_tests {
    use super::*;

    #[test]
    #[serial]
    fn panics_are_reported_and_propagated() {
        let records = capture_panicking(explode);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], TraceRecord::Call("explode()".to_string()));
        match &records[1] {
            TraceRecord::Panic { line, detail } => {
                assert_eq!(line, "explode raised an exception");
                assert!(detail.starts_with("panicked with 'boom'"));
            }
            other => panic!("expected a panic record, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn panics_are_reported_for_debug_only_return_types() {
        // The body never produces its `Vec<u8>`, so the wrapper must get the
        // return type from the signature rather than from the value.
        let records = capture_panicking(|| {
            always_fails();
        });
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], TraceRecord::Call("always_fails()".to_string()));
        match &records[1] {
            TraceRecord::Panic { line, detail } => {
                assert_eq!(line, "always_fails raised an exception");
                assert!(detail.starts_with("panicked with 'cannot build'"));
            }
            other => panic!("expected a panic record, got {:?}", other),
        }
    }
}

mod combinator_tests {
    use super::*;

    #[test]
    #[serial]
    fn free_closures_report_a_bare_name() {
        let records = capture(|| {
            let value = trace_call!(CallTracer::function("compact"), || 41 + 1);
            assert_eq!(value, 42);
        });
        assert_eq!(
            records,
            vec![
                TraceRecord::Call("compact()".to_string()),
                TraceRecord::Return("compact returned 42".to_string()),
            ]
        );
    }

    #[test]
    #[serial]
    fn named_closures_report_the_type_form() {
        let records = capture(|| {
            let tracer = CallTracer::method("Report", "render");
            let rendered = trace_call!(tracer, || "ok".to_string());
            assert_eq!(rendered, "ok");
        });
        assert_eq!(
            records,
            vec![
                TraceRecord::Call("Report.render()".to_string()),
                TraceRecord::Return("Report.render returned ok".to_string()),
            ]
        );
    }

    #[test]
    #[serial]
    fn closure_returns_without_display_fall_back_to_debug() {
        let records = capture(|| {
            let pair = trace_call!(CallTracer::function("bundle"), || vec![1, 2]);
            assert_eq!(pair, vec![1, 2]);
        });
        assert_eq!(
            records,
            vec![
                TraceRecord::Call("bundle()".to_string()),
                TraceRecord::Return("bundle returned [1, 2]".to_string()),
            ]
        );
    }

    #[test]
    #[serial]
    fn closure_panics_are_reported_and_propagated() {
        let records = capture_panicking(|| {
            let _ = trace_call!(CallTracer::function("doomed"), || -> u8 { panic!("late") });
        });
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], TraceRecord::Call("doomed()".to_string()));
        match &records[1] {
            TraceRecord::Panic { line, detail } => {
                assert_eq!(line, "doomed raised an exception");
                assert!(detail.starts_with("panicked with 'late'"));
            }
            other => panic!("expected a panic record, got {:?}", other),
        }
    }
}
