use proto_results::errors::ResultsError;
use proto_results::listener::{ForwardingListener, ListenerEvent, RecordingListener, TestListener};
use proto_results::parser::{ParserSink, ResultParser, INTERRUPTED_MODULE_MESSAGE};
use proto_results::record::{ChildReference, Status, TestRecord};
use proto_results::reporter::{CollectingSink, ReporterOptions, ResultReporter};
use proto_results::types::{
    ContextHandle, ErrorCause, FailureDescription, FailureStatus, InvocationContext, LogDataType,
    LogFile, Metrics, ModuleContext, TestDescription, INVOCATION_ID_KEY,
};

fn context(id: &str) -> ContextHandle {
    let mut context = InvocationContext::default();
    context.add_attribute(INVOCATION_ID_KEY, id);
    ContextHandle::new(context)
}

fn metrics(pairs: &[(&str, &str)]) -> Metrics {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn inline(record: &TestRecord, position: usize) -> &TestRecord {
    match &record.children[position] {
        ChildReference::Inline(child) => child,
        ChildReference::Id(id) => panic!("expected inline child, got reference {id}"),
    }
}

fn drive_scenario(listener: &mut dyn TestListener, ctx: &ContextHandle) -> Result<(), ResultsError> {
    let t1 = TestDescription::new("com.example.Suite", "t1");
    let t2 = TestDescription::new("com.example.Suite", "t2");
    listener.invocation_started(ctx)?;
    listener.test_module_started(&ModuleContext::new("m1"))?;
    listener.test_run_started("run1", 2, 0, 1_000)?;
    listener.test_started(&t1, 1_001)?;
    listener.test_ended(&t1, 1_010, &Metrics::new())?;
    listener.test_started(&t2, 1_011)?;
    listener.test_failed(&t2, &FailureDescription::new("I failed"))?;
    listener.log_association("log1", &LogFile::new("/logs/log1.txt", LogDataType::Text, 12))?;
    listener.test_ended(&t2, 1_020, &metrics(&[("duration_ms", "9")]))?;
    listener.test_run_ended(50, &metrics(&[("coverage", "80")]))?;
    listener.test_module_ended()?;
    listener.invocation_failed(
        &FailureDescription::new("NullPointerException")
            .with_status(FailureStatus::InfraFailure)
            .with_cause(ErrorCause::new("NullPointerException", "value was null")),
    )?;
    listener.invocation_ended(500)
}

/// Drives `drive` into a recording listener and, alongside, into a reporter
/// whose snapshots are collected.
fn record_direct(
    drive: impl FnOnce(&mut dyn TestListener) -> Result<(), ResultsError>,
) -> (Vec<ListenerEvent>, CollectingSink) {
    let direct = RecordingListener::new();
    let sink = CollectingSink::new();
    let reporter = ResultReporter::new(Box::new(sink.clone()), ReporterOptions::granular());
    let mut both = ForwardingListener::new(vec![Box::new(direct.clone()), Box::new(reporter)]);
    drive(&mut both).expect("legal sequence");
    (direct.events(), sink)
}

fn replay(records: &[TestRecord], report_invocation: bool) -> (Vec<ListenerEvent>, ContextHandle) {
    let replayed = RecordingListener::new();
    let handle = ContextHandle::default();
    let mut parser = ResultParser::new(replayed.clone(), handle.clone(), report_invocation);
    for record in records {
        parser.process_snapshot(record).expect("replay");
    }
    assert!(parser.errors().is_empty());
    (replayed.events(), handle)
}

#[test]
fn scenario_replays_in_process_with_identical_calls() {
    let direct = RecordingListener::new();
    let replayed = RecordingListener::new();
    let parser = ResultParser::new(replayed.clone(), ContextHandle::default(), true);
    let reporter = ResultReporter::new(
        Box::new(ParserSink::new(parser)),
        ReporterOptions::granular(),
    );
    let mut both = ForwardingListener::new(vec![Box::new(direct.clone()), Box::new(reporter)]);

    drive_scenario(&mut both, &context("inv-scenario")).expect("scenario");

    let expected = direct.events();
    assert_eq!(expected.len(), 13);
    assert_eq!(replayed.events(), expected);
}

#[test]
fn scenario_builds_the_expected_tree() {
    let ctx = context("inv-scenario");
    let (_, sink) = record_direct(|listener| drive_scenario(listener, &ctx));
    let root = sink.records().pop().expect("final snapshot");

    assert_eq!(root.record_id, "inv-scenario");
    assert_eq!(root.children.len(), 1);
    let module = inline(&root, 0);
    assert!(module.is_module());
    assert_eq!(module.children.len(), 1);
    let run = inline(module, 0);
    assert_eq!(run.record_id, "run1");
    assert_eq!(run.elapsed_ms(), 50);

    let statuses = (0..2).map(|i| inline(run, i).status).collect::<Vec<_>>();
    assert_eq!(statuses, vec![Status::Pass, Status::Fail]);
    let t2 = inline(run, 1);
    assert_eq!(t2.artifacts.len(), 1);
    assert!(t2.artifacts.contains_key("log1"));
    assert!(inline(run, 0).artifacts.is_empty());

    let info = root.debug_info.as_ref().expect("root debug info");
    let cause = info.serialized_cause.as_deref().expect("serialized cause");
    assert_eq!(
        ErrorCause::from_wire(cause),
        ErrorCause::new("NullPointerException", "value was null")
    );
    assert_eq!(root.elapsed_ms(), 500);
}

#[test]
fn incremental_and_final_only_replays_agree() {
    let ctx = context("inv-modes");
    let (direct, sink) = record_direct(|listener| drive_scenario(listener, &ctx));
    let records = sink.records();

    let (incremental, _) = replay(&records, true);
    let (final_only, _) = replay(&records[records.len() - 1..], true);

    assert_eq!(incremental, direct);
    assert_eq!(final_only, direct);

    let mut non_granular = ResultReporter::new(
        Box::new(sink.clone()),
        ReporterOptions::default(),
    );
    let before = sink.records().len();
    drive_scenario(&mut non_granular, &context("inv-modes")).expect("scenario");
    let emitted = &sink.records()[before..];
    assert_eq!(emitted.len(), 1);
    assert_eq!(replay(emitted, true).0, direct);
}

#[test]
fn ignored_and_assumption_failures_replay_unchanged() {
    let ignored = TestDescription::new("a.B", "ignored");
    let assumed = TestDescription::new("a.B", "assumed");
    let ctx = context("inv-outcomes");
    let (direct, sink) = record_direct(|listener| {
        listener.invocation_started(&ctx)?;
        listener.test_run_started("run1", 2, 0, 10)?;
        listener.test_started(&ignored, 11)?;
        listener.test_ignored(&ignored)?;
        listener.test_ended(&ignored, 12, &Metrics::new())?;
        listener.test_started(&assumed, 13)?;
        listener.test_assumption_failure(&assumed, &FailureDescription::new("needs a device"))?;
        listener.test_ended(&assumed, 14, &Metrics::new())?;
        listener.test_run_ended(4, &Metrics::new())?;
        listener.invocation_ended(20)
    });
    let records = sink.records();
    let run = inline(records.last().expect("final"), 0);
    assert_eq!(inline(run, 0).status, Status::Ignored);
    assert_eq!(inline(run, 1).status, Status::AssumptionFailure);

    let (incremental, _) = replay(&records, true);
    let (final_only, _) = replay(&records[records.len() - 1..], true);
    assert_eq!(incremental, direct);
    assert_eq!(final_only, direct);
    assert!(direct.contains(&ListenerEvent::TestIgnored {
        test: ignored.to_string()
    }));
    assert!(direct.contains(&ListenerEvent::TestAssumptionFailure {
        test: assumed.to_string(),
        failure: FailureDescription::new("needs a device"),
    }));
}

#[test]
fn run_level_artifacts_replay_when_the_run_closes() {
    let test = TestDescription::new("a.B", "c");
    let log = LogFile::new("/logs/run.txt", LogDataType::Text, 3);
    let ctx = context("inv-run-log");
    let (direct, sink) = record_direct(|listener| {
        listener.invocation_started(&ctx)?;
        listener.test_run_started("run1", 1, 0, 10)?;
        listener.log_association("run-log", &log)?;
        listener.test_started(&test, 11)?;
        listener.test_ended(&test, 12, &Metrics::new())?;
        listener.test_run_ended(2, &Metrics::new())?;
        listener.invocation_ended(20)
    });
    let association = ListenerEvent::LogAssociation {
        name: "run-log".to_string(),
        log,
    };
    assert_eq!(direct[2], association);

    let mut expected = direct.clone();
    let moved = expected.remove(2);
    expected.insert(4, moved);
    let (replayed, _) = replay(&sink.records(), true);
    assert_eq!(replayed, expected);
    assert_eq!(replayed[4], association);
    assert!(matches!(replayed[5], ListenerEvent::RunEnded { .. }));
}

#[test]
fn interleaved_run_failure_attaches_to_the_run() {
    let ctx = context("inv-interleaved");
    let test = TestDescription::new("a.B", "flaky");
    let (_, sink) = record_direct(|listener| {
        listener.invocation_started(&ctx)?;
        listener.test_run_started("run1", 1, 0, 10)?;
        listener.test_started(&test, 11)?;
        listener.test_run_failed(&FailureDescription::new("instrumentation crashed"))?;
        listener.test_ended(&test, 12, &Metrics::new())?;
        listener.test_run_ended(5, &Metrics::new())?;
        listener.invocation_ended(10)
    });

    let root = sink.records().pop().expect("final");
    let run = inline(&root, 0);
    assert_eq!(
        run.debug_info.as_ref().map(|info| info.error_message.as_str()),
        Some("instrumentation crashed")
    );
    assert!(inline(run, 0).debug_info.is_none());
    assert_eq!(inline(run, 0).status, Status::Pass);

    let (events, _) = replay(&sink.records(), true);
    let position = |wanted: fn(&ListenerEvent) -> bool| {
        events.iter().position(wanted).expect("event present")
    };
    let started = position(|e| matches!(e, ListenerEvent::TestStarted { .. }));
    let failed = position(|e| matches!(e, ListenerEvent::RunFailed { .. }));
    let run_ended = position(|e| matches!(e, ListenerEvent::RunEnded { .. }));
    assert!(started < failed && failed < run_ended);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ListenerEvent::TestFailed { .. })));
}

#[test]
fn forced_completion_after_module_start_yields_one_triple() {
    let ctx = context("inv-interrupted");
    let sink = CollectingSink::new();
    let mut reporter = ResultReporter::new(Box::new(sink.clone()), ReporterOptions::granular());
    reporter.invocation_started(&ctx).expect("invocation");
    reporter
        .test_module_started(&ModuleContext::new("m1"))
        .expect("module");

    let replayed = RecordingListener::new();
    let mut parser = ResultParser::new(replayed.clone(), ContextHandle::default(), true);
    for record in sink.records() {
        parser.process_snapshot(&record).expect("replay");
    }
    parser.complete_module_events().expect("complete");
    parser.complete_module_events().expect("idempotent");

    let events = replayed.events();
    assert_eq!(events.len(), 6);
    assert!(matches!(
        &events[2],
        ListenerEvent::RunStarted { name, test_count: 0, .. } if name == "m1"
    ));
    match &events[3] {
        ListenerEvent::RunFailed { failure } => {
            assert_eq!(failure.error_message, INTERRUPTED_MODULE_MESSAGE);
            assert_eq!(failure.failure_status, Some(FailureStatus::InfraFailure));
        }
        other => panic!("expected run failure, got {other:?}"),
    }
    assert!(matches!(events[4], ListenerEvent::RunEnded { elapsed_ms: 0, .. }));
    assert_eq!(events[5], ListenerEvent::ModuleEnded);
    assert!(!parser.invocation_ended_reported());
}

#[test]
fn forced_completion_closes_an_open_test_first() {
    let ctx = context("inv-open-test");
    let test = TestDescription::new("a.B", "hangs");
    let (_, sink) = record_direct(|listener| {
        listener.invocation_started(&ctx)?;
        listener.test_module_started(&ModuleContext::new("m1"))?;
        listener.test_run_started("run1", 3, 0, 10)?;
        listener.test_started(&test, 20)
    });

    let replayed = RecordingListener::new();
    let mut parser = ResultParser::new(replayed.clone(), ContextHandle::default(), true);
    for record in sink.records() {
        parser.process_snapshot(&record).expect("replay");
    }
    parser.complete_module_events().expect("complete");

    let tail = replayed.events().split_off(4);
    assert!(matches!(&tail[0], ListenerEvent::TestFailed { test, .. } if test == "a.B#hangs"));
    assert!(matches!(&tail[1], ListenerEvent::TestEnded { test, .. } if test == "a.B#hangs"));
    assert!(matches!(tail[2], ListenerEvent::RunFailed { .. }));
    assert!(matches!(tail[3], ListenerEvent::RunEnded { .. }));
    assert_eq!(tail[4], ListenerEvent::ModuleEnded);
    assert_eq!(tail.len(), 5);
}

#[test]
fn subprocess_forwarding_hides_invocation_events() {
    let ctx = context("inv-sub");
    let (direct, sink) = record_direct(|listener| drive_scenario(listener, &ctx));
    let (forwarded, _) = replay(&sink.records(), false);

    assert!(forwarded.iter().all(|event| !matches!(
        event,
        ListenerEvent::InvocationStarted { .. }
            | ListenerEvent::InvocationFailed { .. }
            | ListenerEvent::InvocationEnded { .. }
    )));

    let expected = direct
        .into_iter()
        .filter_map(|event| match event {
            ListenerEvent::InvocationStarted { .. }
            | ListenerEvent::InvocationFailed { .. }
            | ListenerEvent::InvocationEnded { .. } => None,
            ListenerEvent::LogAssociation { name, log } => Some(ListenerEvent::LogAssociation {
                name: format!("subprocess-{name}"),
                log,
            }),
            other => Some(other),
        })
        .collect::<Vec<_>>();
    assert_eq!(forwarded, expected);
}

#[test]
fn reattempts_replay_as_independent_runs() {
    let ctx = context("inv-retry");
    let (direct, sink) = record_direct(|listener| {
        listener.invocation_started(&ctx)?;
        for attempt in 0..2u32 {
            let test = TestDescription::new("a.B", format!("attempt{attempt}"));
            listener.test_run_started("run1", 1, attempt, 100)?;
            listener.test_started(&test, 101)?;
            listener.test_ended(&test, 102, &Metrics::new())?;
            listener.test_run_ended(3, &Metrics::new())?;
        }
        listener.invocation_ended(10)
    });

    let root = sink.records().pop().expect("final");
    assert_eq!(root.children.len(), 2);
    for attempt in 0..2usize {
        let run = inline(&root, attempt);
        assert_eq!(run.record_id, "run1");
        assert_eq!(run.attempt, Some(attempt as u32));
        assert_eq!(run.children.len(), 1);
        assert_eq!(inline(run, 0).record_id, format!("a.B#attempt{attempt}"));
    }

    let (events, _) = replay(&sink.records(), true);
    assert_eq!(events, direct);
}

#[test]
fn late_context_attributes_reach_the_callers_handle_once() {
    let ctx = context("inv-context");
    let (_, sink) = record_direct(|listener| {
        listener.invocation_started(&ctx)?;
        ctx.add_attribute("build", "1234");
        listener.test_module_started(&ModuleContext::new("m1"))?;
        ctx.add_attribute("build", "1234");
        ctx.add_attribute("branch", "main");
        listener.test_module_ended()?;
        listener.invocation_ended(5)
    });

    let (_, handle) = replay(&sink.records(), true);
    let merged = handle.snapshot();
    assert_eq!(merged.attributes["build"], vec!["1234".to_string()]);
    assert_eq!(merged.attributes["branch"], vec!["main".to_string()]);
    assert_eq!(merged.invocation_id(), Some("inv-context"));
}

#[test]
fn out_of_order_calls_fail_fast() {
    let sink = CollectingSink::new();
    let mut reporter = ResultReporter::new(Box::new(sink.clone()), ReporterOptions::granular());
    let err = reporter
        .test_started(&TestDescription::new("a.B", "t"), 0)
        .expect_err("nothing started");
    assert!(matches!(err, ResultsError::Sequence(_)));

    reporter.invocation_started(&context("inv-seq")).expect("invocation");
    assert!(reporter.test_module_ended().is_err());
    assert!(reporter.test_run_ended(0, &Metrics::new()).is_err());
    reporter.invocation_ended(1).expect("clean end");
    assert!(reporter
        .invocation_started(&context("inv-seq"))
        .is_err());
}
