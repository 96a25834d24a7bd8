//! Replays listener calls from a stream of `TestRecord` snapshots.
//!
//! A shadow tree remembers, per child position, what has already been
//! replayed, so a growing sequence of snapshots and a single final snapshot
//! produce the same calls. Every record replays in the same shape: its start
//! when first seen, then its children, then at closure its failure, its
//! artifacts and finally its end.

use crate::codec::{decode_single, FrameReader, Framing};
use crate::errors::ResultsError;
use crate::listener::TestListener;
use crate::logging::append_run_log;
use crate::record::{ChildReference, Status, TestRecord};
use crate::reporter::{now_ms, SnapshotKind, SnapshotSink};
use crate::types::{
    ContextHandle, FailureDescription, FailureStatus, Metrics, ModuleContext, TestDescription,
};
use serde_json::json;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

pub const INTERRUPTED_MODULE_MESSAGE: &str =
    "Module was interrupted after starting, results are incomplete.";
pub const SUBPROCESS_PREFIX: &str = "subprocess-";

#[derive(Debug, Default)]
struct ReplayNode {
    started: bool,
    ended: bool,
    children: Vec<ReplayNode>,
}

impl ReplayNode {
    fn child(&mut self, position: usize) -> &mut ReplayNode {
        if self.children.len() <= position {
            self.children.resize_with(position + 1, ReplayNode::default);
        }
        &mut self.children[position]
    }

    fn seal(&mut self) {
        if self.started {
            self.ended = true;
        }
        for child in &mut self.children {
            child.seal();
        }
    }
}

#[derive(Debug, Clone)]
struct OpenTest {
    test: TestDescription,
    start_ms: u64,
}

/// Records the parser has opened downstream but not yet closed.
#[derive(Debug, Default)]
struct OpenRecords {
    module: Option<String>,
    run: Option<String>,
    test: Option<OpenTest>,
}

/// Replays snapshot trees as listener calls.
///
/// Failures, artifacts and metrics of a record are replayed when the record
/// closes. A `log_association` made on a run or module before its children
/// therefore arrives after those children have ended: a direct
/// `[RunStarted, LogAssociation, TestStarted, TestEnded, RunEnded]` replays as
/// `[RunStarted, TestStarted, TestEnded, LogAssociation, RunEnded]`. A test
/// case replays as start, outcome, artifacts, end.
pub struct ResultParser<L> {
    listener: L,
    context: ContextHandle,
    report_invocation: bool,
    root_id: Option<String>,
    shadow: ReplayNode,
    open: OpenRecords,
    registry: HashMap<String, TestRecord>,
    last_root: Option<TestRecord>,
    errors: Vec<ResultsError>,
    frames: usize,
}

impl<L: TestListener> ResultParser<L> {
    /// `report_invocation = false` forwards a subprocess's results: the
    /// invocation-level calls are left to the parent and artifact names are
    /// prefixed with `subprocess-`.
    pub fn new(listener: L, context: ContextHandle, report_invocation: bool) -> Self {
        Self {
            listener,
            context,
            report_invocation,
            root_id: None,
            shadow: ReplayNode::default(),
            open: OpenRecords::default(),
            registry: HashMap::new(),
            last_root: None,
            errors: Vec::new(),
            frames: 0,
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn into_listener(self) -> L {
        self.listener
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn errors(&self) -> &[ResultsError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<ResultsError> {
        std::mem::take(&mut self.errors)
    }

    pub fn invocation_ended_reported(&self) -> bool {
        self.shadow.ended
    }

    pub fn module_in_progress(&self) -> Option<&str> {
        self.open.module.as_deref()
    }

    /// Replays whatever `record` adds over the snapshots seen before. A
    /// record without an invocation description is kept as a standalone
    /// record that id references in later trees resolve against.
    pub fn process_snapshot(&mut self, record: &TestRecord) -> Result<(), ResultsError> {
        self.frames += 1;
        if record.invocation_context().is_none() {
            self.registry
                .entry(record.record_id.clone())
                .and_modify(|existing| existing.merge_from(record))
                .or_insert_with(|| record.clone());
            return match self.last_root.take() {
                Some(root) => {
                    let result = self.replay_root(&root);
                    self.last_root = Some(root);
                    result
                }
                None => Ok(()),
            };
        }

        match &self.root_id {
            Some(current) if *current != record.record_id => {
                if !self.shadow.ended {
                    return Err(ResultsError::Decode(format!(
                        "snapshot for invocation {} while {current} is still open",
                        record.record_id
                    )));
                }
                self.shadow = ReplayNode::default();
                self.open = OpenRecords::default();
                self.root_id = Some(record.record_id.clone());
            }
            Some(_) => {}
            None => self.root_id = Some(record.record_id.clone()),
        }

        let result = self.replay_root(record);
        self.last_root = Some(record.clone());
        result
    }

    /// Decodes and replays one non-delimited frame body. Failures are kept
    /// in `errors()` rather than returned.
    pub fn process_frame(&mut self, bytes: &[u8]) {
        match decode_single(bytes) {
            Ok(record) => self.process_record(&record),
            Err(err) => self.record_error(err),
        }
    }

    /// Replays every frame from `reader`; bad frames are captured and skipped.
    pub fn process_reader<R: Read>(&mut self, mut reader: R, framing: Framing) -> usize {
        let before = self.frames;
        match framing {
            Framing::Delimited => {
                for frame in FrameReader::new(reader) {
                    match frame {
                        Ok(record) => self.process_record(&record),
                        Err(err) => self.record_error(err),
                    }
                }
            }
            Framing::Single => {
                let mut bytes = Vec::new();
                match reader.read_to_end(&mut bytes) {
                    Ok(_) => self.process_frame(&bytes),
                    Err(err) => self.record_error(ResultsError::Io(err.to_string())),
                }
            }
        }
        self.frames - before
    }

    pub fn process_file(&mut self, path: &Path, framing: Framing) -> Result<usize, ResultsError> {
        let file = std::fs::File::open(path).map_err(|e| ResultsError::Io(e.to_string()))?;
        let count = self.process_reader(std::io::BufReader::new(file), framing);
        append_run_log(
            "info",
            "parser.file_processed",
            json!({
                "path": path.display().to_string(),
                "frames": count,
                "errors": self.errors.len(),
            }),
        );
        Ok(count)
    }

    /// Closes whatever the stream left open so downstream sees a well-formed
    /// report: an open test fails and ends, the open run (synthesized under
    /// the module name if none is open) gets one interruption failure and
    /// ends, then the module ends. Calling it again is a no-op.
    pub fn complete_module_events(&mut self) -> Result<(), ResultsError> {
        if self.open.module.is_none() && self.open.run.is_none() && self.open.test.is_none() {
            return Ok(());
        }
        let failure = FailureDescription::new(INTERRUPTED_MODULE_MESSAGE)
            .with_status(FailureStatus::InfraFailure);
        append_run_log(
            "warn",
            "parser.forced_completion",
            json!({
                "module": self.open.module,
                "run": self.open.run,
                "test": self.open.test.as_ref().map(|open| open.test.to_string()),
            }),
        );

        if let Some(open) = self.open.test.take() {
            self.listener.test_failed(&open.test, &failure)?;
            self.listener
                .test_ended(&open.test, open.start_ms, &Metrics::new())?;
        }
        if self.open.run.is_none() {
            let name = self.open.module.clone().unwrap_or_default();
            self.listener.test_run_started(&name, 0, 0, now_ms())?;
        }
        self.open.run = None;
        self.listener.test_run_failed(&failure)?;
        self.listener.test_run_ended(0, &Metrics::new())?;
        if self.open.module.take().is_some() {
            self.listener.test_module_ended()?;
        }
        for child in &mut self.shadow.children {
            child.seal();
        }
        Ok(())
    }

    /// Like `process_snapshot`, but keeps any failure in `errors()`.
    pub fn process_record(&mut self, record: &TestRecord) {
        if let Err(err) = self.process_snapshot(record) {
            self.record_error(err);
        }
    }

    pub fn record_error(&mut self, err: ResultsError) {
        append_run_log(
            "warn",
            "parser.frame_rejected",
            json!({ "error": err.to_string() }),
        );
        self.errors.push(err);
    }

    fn artifact_name<'a>(&self, name: &'a str) -> Cow<'a, str> {
        if self.report_invocation {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(format!("{SUBPROCESS_PREFIX}{name}"))
        }
    }

    fn replay_artifacts(&mut self, record: &TestRecord) -> Result<(), ResultsError> {
        for (name, log) in &record.artifacts {
            let name = self.artifact_name(name);
            self.listener.log_association(&name, log)?;
        }
        Ok(())
    }

    fn replay_root(&mut self, root: &TestRecord) -> Result<(), ResultsError> {
        let mut shadow = std::mem::take(&mut self.shadow);
        let result = self.replay_root_into(root, &mut shadow);
        self.shadow = shadow;
        result
    }

    fn replay_root_into(&mut self, root: &TestRecord, shadow: &mut ReplayNode) -> Result<(), ResultsError> {
        if let Some(context) = root.invocation_context() {
            self.context.merge_from(context);
        }
        if !shadow.started {
            shadow.started = true;
            if self.report_invocation {
                self.listener.invocation_started(&self.context)?;
            }
        }

        let registry = std::mem::take(&mut self.registry);
        let result = self.replay_top_level(root, shadow, &registry);
        self.registry = registry;
        result?;

        if root.is_ended() && !shadow.ended {
            shadow.ended = true;
            if self.report_invocation {
                if let Some(info) = &root.debug_info {
                    self.listener.invocation_failed(&info.to_failure())?;
                }
            }
            self.replay_artifacts(root)?;
            if self.report_invocation {
                self.listener.invocation_ended(root.elapsed_ms())?;
            }
        }
        Ok(())
    }

    fn replay_top_level(
        &mut self,
        root: &TestRecord,
        shadow: &mut ReplayNode,
        registry: &HashMap<String, TestRecord>,
    ) -> Result<(), ResultsError> {
        let children = resolve_children(&root.children, registry);
        for (position, child) in children.iter().enumerate() {
            let node = shadow.child(position);
            if child.is_module() {
                self.replay_module(child, node, registry)?;
            } else {
                let attempt = attempt_for(&children, position);
                self.replay_run(child, attempt, node, registry)?;
            }
        }
        Ok(())
    }

    fn replay_module(
        &mut self,
        module: &TestRecord,
        shadow: &mut ReplayNode,
        registry: &HashMap<String, TestRecord>,
    ) -> Result<(), ResultsError> {
        if shadow.ended {
            return Ok(());
        }
        if !shadow.started {
            shadow.started = true;
            let context = module
                .module_context()
                .cloned()
                .unwrap_or_else(|| ModuleContext::new(module.record_id.clone()));
            self.listener.test_module_started(&context)?;
            self.open.module = Some(module.record_id.clone());
        }

        let runs = resolve_children(&module.children, registry);
        for (position, run) in runs.iter().enumerate() {
            let attempt = attempt_for(&runs, position);
            self.replay_run(run, attempt, shadow.child(position), registry)?;
        }

        if module.is_ended() {
            shadow.ended = true;
            self.replay_artifacts(module)?;
            self.listener.test_module_ended()?;
            self.open.module = None;
        }
        Ok(())
    }

    fn replay_run(
        &mut self,
        run: &TestRecord,
        attempt: u32,
        shadow: &mut ReplayNode,
        registry: &HashMap<String, TestRecord>,
    ) -> Result<(), ResultsError> {
        if shadow.ended {
            return Ok(());
        }
        if !shadow.started {
            shadow.started = true;
            self.listener.test_run_started(
                &run.record_id,
                run.num_expected_children.unwrap_or(0),
                attempt,
                run.start_time_ms.unwrap_or(0),
            )?;
            self.open.run = Some(run.record_id.clone());
        }

        let tests = resolve_children(&run.children, registry);
        for (position, test) in tests.iter().enumerate() {
            self.replay_test(test, shadow.child(position))?;
        }

        if run.is_ended() {
            shadow.ended = true;
            if let Some(info) = &run.debug_info {
                self.listener.test_run_failed(&info.to_failure())?;
            }
            self.replay_artifacts(run)?;
            self.listener.test_run_ended(run.elapsed_ms(), &run.metrics)?;
            self.open.run = None;
        }
        Ok(())
    }

    fn replay_test(&mut self, test: &TestRecord, shadow: &mut ReplayNode) -> Result<(), ResultsError> {
        if shadow.ended {
            return Ok(());
        }
        let description = TestDescription::parse_id(&test.record_id);
        let start_ms = test.start_time_ms.unwrap_or(0);
        if !shadow.started {
            shadow.started = true;
            self.listener.test_started(&description, start_ms)?;
            self.open.test = Some(OpenTest {
                test: description.clone(),
                start_ms,
            });
        }
        if !test.is_ended() {
            return Ok(());
        }

        shadow.ended = true;
        let failure = || {
            test.debug_info
                .as_ref()
                .map(|info| info.to_failure())
                .unwrap_or_else(|| FailureDescription::new("test failed without a message"))
        };
        match test.status {
            Status::Fail => self.listener.test_failed(&description, &failure())?,
            Status::AssumptionFailure => {
                self.listener.test_assumption_failure(&description, &failure())?
            }
            Status::Ignored => self.listener.test_ignored(&description)?,
            Status::Pass | Status::Unknown => {}
        }
        self.replay_artifacts(test)?;
        self.listener
            .test_ended(&description, test.end_time_ms.unwrap_or(start_ms), &test.metrics)?;
        self.open.test = None;
        Ok(())
    }
}

/// Children in order, stopping at the first id reference that has not been
/// delivered yet so later siblings never overtake it.
fn resolve_children<'r>(
    children: &'r [ChildReference],
    registry: &HashMap<String, TestRecord>,
) -> Vec<Cow<'r, TestRecord>> {
    let mut resolved = Vec::with_capacity(children.len());
    for child in children {
        match child {
            ChildReference::Inline(record) => resolved.push(Cow::Borrowed(record)),
            ChildReference::Id(id) => match registry.get(id) {
                Some(record) => resolved.push(Cow::Owned(record.clone())),
                None => break,
            },
        }
    }
    resolved
}

/// Attempt number of a run: its own if recorded, else how many earlier
/// siblings share its name.
fn attempt_for(siblings: &[Cow<'_, TestRecord>], position: usize) -> u32 {
    let run = &siblings[position];
    run.attempt.unwrap_or_else(|| {
        siblings[..position]
            .iter()
            .filter(|sibling| sibling.record_id == run.record_id)
            .count() as u32
    })
}

/// Feeds a reporter's snapshots straight into a parser in the same process.
pub struct ParserSink<L> {
    parser: ResultParser<L>,
}

impl<L: TestListener> ParserSink<L> {
    pub fn new(parser: ResultParser<L>) -> Self {
        Self { parser }
    }

    pub fn into_parser(self) -> ResultParser<L> {
        self.parser
    }
}

impl<L: TestListener> SnapshotSink for ParserSink<L> {
    fn on_snapshot(&mut self, root: &TestRecord, _kind: SnapshotKind) -> Result<(), ResultsError> {
        self.parser.process_snapshot(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ListenerEvent, RecordingListener};
    use crate::record::{DebugInfo, Description};
    use crate::types::{InvocationContext, LogDataType, LogFile, INVOCATION_ID_KEY};

    fn root(id: &str) -> TestRecord {
        let mut context = InvocationContext::default();
        context.add_attribute(INVOCATION_ID_KEY, id);
        TestRecord {
            start_time_ms: Some(1_000),
            description: Some(Description::Invocation(context)),
            ..TestRecord::new(id)
        }
    }

    fn module(id: &str) -> TestRecord {
        TestRecord {
            start_time_ms: Some(1_000),
            description: Some(Description::Module(ModuleContext::new(id))),
            ..TestRecord::new(id)
        }
    }

    fn run(name: &str, start: u64) -> TestRecord {
        TestRecord {
            start_time_ms: Some(start),
            num_expected_children: Some(1),
            ..TestRecord::new(name)
        }
    }

    fn ended_test(id: &str, status: Status) -> TestRecord {
        TestRecord {
            start_time_ms: Some(10),
            end_time_ms: Some(20),
            status,
            ..TestRecord::new(id)
        }
    }

    fn parser(report_invocation: bool) -> (ResultParser<RecordingListener>, RecordingListener) {
        let listener = RecordingListener::new();
        let parser = ResultParser::new(listener.clone(), ContextHandle::default(), report_invocation);
        (parser, listener)
    }

    #[test]
    fn growing_snapshots_never_redeliver_children() {
        let (mut parser, listener) = parser(true);
        let mut tree = root("inv");
        let mut first_run = run("run1", 10);
        first_run
            .children
            .push(ChildReference::Inline(ended_test("a.B#t1", Status::Pass)));
        tree.children.push(ChildReference::Inline(first_run.clone()));

        parser.process_snapshot(&tree).expect("first");
        parser.process_snapshot(&tree).expect("repeat");

        let events = listener.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], ListenerEvent::InvocationStarted { .. }));
        assert!(matches!(events[1], ListenerEvent::RunStarted { .. }));
        assert!(matches!(events[3], ListenerEvent::TestEnded { .. }));
    }

    #[test]
    fn forced_completion_closes_an_interrupted_module_once() {
        let (mut parser, listener) = parser(true);
        let mut tree = root("inv");
        tree.children.push(ChildReference::Inline(module("m1")));
        parser.process_snapshot(&tree).expect("snapshot");
        assert_eq!(parser.module_in_progress(), Some("m1"));

        parser.complete_module_events().expect("complete");
        parser.complete_module_events().expect("second call is a no-op");

        let events = listener.events();
        let failures = events
            .iter()
            .filter(|event| matches!(event, ListenerEvent::RunFailed { .. }))
            .count();
        assert_eq!(failures, 1);
        assert_eq!(events.last(), Some(&ListenerEvent::ModuleEnded));
        match &events[3] {
            ListenerEvent::RunFailed { failure } => {
                assert_eq!(failure.error_message, INTERRUPTED_MODULE_MESSAGE);
                assert_eq!(failure.failure_status, Some(FailureStatus::InfraFailure));
            }
            other => panic!("expected run failure, got {other:?}"),
        }
        assert!(parser.module_in_progress().is_none());

        parser.process_snapshot(&tree).expect("stale snapshot");
        assert_eq!(listener.events().len(), events.len());
    }

    #[test]
    fn subprocess_mode_hides_invocation_events_and_prefixes_artifacts() {
        let (mut parser, listener) = parser(false);
        let mut tree = root("inv");
        let mut test = ended_test("a.B#t1", Status::Pass);
        test.artifacts
            .insert("logcat".to_string(), LogFile::new("/l", LogDataType::Logcat, 1));
        let mut only_run = run("run1", 10);
        only_run.end_time_ms = Some(30);
        only_run.children.push(ChildReference::Inline(test));
        tree.children.push(ChildReference::Inline(only_run));
        tree.end_time_ms = Some(2_000);
        tree.debug_info = Some(DebugInfo {
            error_message: "boom".to_string(),
            ..DebugInfo::default()
        });

        parser.process_snapshot(&tree).expect("snapshot");
        let events = listener.events();
        assert!(events.iter().all(|event| !matches!(
            event,
            ListenerEvent::InvocationStarted { .. }
                | ListenerEvent::InvocationEnded { .. }
                | ListenerEvent::InvocationFailed { .. }
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            ListenerEvent::LogAssociation { name, .. } if name == "subprocess-logcat"
        )));
        assert!(parser.invocation_ended_reported());
    }

    #[test]
    fn context_is_merged_into_the_callers_handle() {
        let listener = RecordingListener::new();
        let mut base = InvocationContext::default();
        base.add_attribute("local", "kept");
        let handle = ContextHandle::new(base);
        let mut parser = ResultParser::new(listener, handle.clone(), true);

        let mut tree = root("inv");
        parser.process_snapshot(&tree).expect("first");
        if let Some(Description::Invocation(context)) = &mut tree.description {
            context.add_attribute("late", "value");
        }
        parser.process_snapshot(&tree).expect("second");

        let merged = handle.snapshot();
        assert_eq!(merged.attributes["local"], vec!["kept".to_string()]);
        assert_eq!(merged.attributes["late"], vec!["value".to_string()]);
        assert_eq!(merged.invocation_id(), Some("inv"));
    }

    #[test]
    fn runs_without_attempt_numbers_count_same_named_siblings() {
        let (mut parser, listener) = parser(true);
        let mut tree = root("inv");
        for _ in 0..2 {
            let mut attempt = run("run1", 10);
            attempt.end_time_ms = Some(11);
            tree.children.push(ChildReference::Inline(attempt));
        }
        parser.process_snapshot(&tree).expect("snapshot");
        let attempts = listener
            .events()
            .into_iter()
            .filter_map(|event| match event {
                ListenerEvent::RunStarted { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(attempts, vec![0, 1]);
    }

    #[test]
    fn id_references_replay_once_their_record_arrives() {
        let (mut parser, listener) = parser(true);
        let mut tree = root("inv");
        let mut standalone = run("run1", 10);
        standalone.end_time_ms = Some(15);
        tree.children.push(ChildReference::Id("run1".to_string()));

        parser.process_snapshot(&tree).expect("root");
        assert_eq!(listener.events().len(), 1);

        parser.process_snapshot(&standalone).expect("standalone");
        let events = listener.events();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            ListenerEvent::RunEnded {
                elapsed_ms: 5,
                metrics: Metrics::new(),
            }
        );
    }

    #[test]
    fn malformed_frames_are_captured_not_returned() {
        let (mut parser, listener) = parser(true);
        parser.process_frame(b"{not json");
        let body = crate::codec::encode_single(&root("inv")).expect("encode");
        parser.process_frame(&body);
        assert_eq!(parser.errors().len(), 1);
        assert_eq!(listener.events().len(), 1);
        assert_eq!(parser.take_errors().len(), 1);
        assert!(parser.errors().is_empty());
    }

    #[test]
    fn unknown_cause_is_rebuilt_generically() {
        let (mut parser, listener) = parser(true);
        let mut tree = root("inv");
        tree.end_time_ms = Some(1_500);
        tree.debug_info = Some(DebugInfo {
            error_message: "crash".to_string(),
            serialized_cause: Some("opaque bytes".to_string()),
            ..DebugInfo::default()
        });
        parser.process_snapshot(&tree).expect("snapshot");
        let events = listener.events();
        match &events[1] {
            ListenerEvent::InvocationFailed { failure } => {
                let cause = failure.cause.as_ref().expect("cause");
                assert_eq!(cause.kind, "GenericError");
                assert_eq!(cause.message, "opaque bytes");
            }
            other => panic!("expected invocation failure, got {other:?}"),
        }
        assert_eq!(events[2], ListenerEvent::InvocationEnded { elapsed_ms: 500 });
    }
}
