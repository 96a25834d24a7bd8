//! Listener that turns lifecycle callbacks into a `TestRecord` tree.
//!
//! Records live in an arena; the open-record stack holds arena indices so a
//! run failure delivered while a test case is open can still reach its run.
//! After every stage boundary the whole tree built so far is handed to the
//! configured `SnapshotSink`.

use crate::errors::ResultsError;
use crate::fsm::{validate_event, Position, ReportEvent, ReportStage};
use crate::listener::{ListenerResult, TestListener};
use crate::logging::append_run_log;
use crate::record::{ChildReference, DebugInfo, Description, Status, TestRecord};
use crate::types::{
    ContextHandle, FailureDescription, LogDataType, LogFile, Metrics, ModuleContext,
    TestDescription,
};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    InvocationStarted,
    ModuleStarted,
    ModuleEnded,
    RunStarted,
    RunEnded,
    TestStarted,
    TestEnded,
    InvocationEnded,
}

impl SnapshotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvocationStarted => "invocation_started",
            Self::ModuleStarted => "module_started",
            Self::ModuleEnded => "module_ended",
            Self::RunStarted => "run_started",
            Self::RunEnded => "run_ended",
            Self::TestStarted => "test_started",
            Self::TestEnded => "test_ended",
            Self::InvocationEnded => "invocation_ended",
        }
    }
}

/// Destination for emitted snapshots. Each call receives the full tree.
pub trait SnapshotSink: Send {
    fn on_snapshot(&mut self, root: &TestRecord, kind: SnapshotKind) -> Result<(), ResultsError>;

    fn on_final(&mut self, root: &TestRecord) -> Result<(), ResultsError> {
        self.on_snapshot(root, SnapshotKind::InvocationEnded)
    }
}

/// In-memory sink; clones share the captured snapshots.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    snapshots: Arc<Mutex<Vec<(SnapshotKind, TestRecord)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<(SnapshotKind, TestRecord)> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn records(&self) -> Vec<TestRecord> {
        self.snapshots().into_iter().map(|(_, record)| record).collect()
    }
}

impl SnapshotSink for CollectingSink {
    fn on_snapshot(&mut self, root: &TestRecord, kind: SnapshotKind) -> Result<(), ResultsError> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, root.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReporterOptions {
    /// Emit at every stage boundary. When off only the final tree is emitted.
    pub granular: bool,
    /// Where `test_log` payloads are written. Without it only sizes are kept.
    pub log_dir: Option<PathBuf>,
}

impl ReporterOptions {
    pub fn granular() -> Self {
        Self {
            granular: true,
            log_dir: None,
        }
    }
}

#[derive(Debug)]
struct RecordNode {
    record: TestRecord,
    stage: ReportStage,
    children: Vec<usize>,
    outcome: Option<Status>,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    index: usize,
    parent: Option<usize>,
}

pub struct ResultReporter {
    sink: Box<dyn SnapshotSink>,
    options: ReporterOptions,
    context: Option<ContextHandle>,
    arena: Vec<RecordNode>,
    stack: Vec<Frame>,
    ended: bool,
    sink_errors: Vec<ResultsError>,
}

impl ResultReporter {
    pub fn new(sink: Box<dyn SnapshotSink>, options: ReporterOptions) -> Self {
        Self {
            sink,
            options,
            context: None,
            arena: Vec::new(),
            stack: Vec::new(),
            ended: false,
            sink_errors: Vec::new(),
        }
    }

    /// The tree built so far, or `None` before `invocation_started`.
    pub fn snapshot(&self) -> Option<TestRecord> {
        (!self.arena.is_empty()).then(|| self.materialize(0))
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Sink failures are kept here instead of failing the test thread.
    pub fn sink_errors(&self) -> &[ResultsError] {
        &self.sink_errors
    }

    fn position(&self) -> Position {
        if self.ended {
            return Position::Ended;
        }
        match self.stack.last() {
            Some(frame) => Position::Open(self.arena[frame.index].stage),
            None => Position::NotStarted,
        }
    }

    fn check(&self, event: ReportEvent) -> Result<(), ResultsError> {
        validate_event(self.position(), event)
    }

    fn top(&self) -> Result<Frame, ResultsError> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| ResultsError::Sequence("no open record".to_string()))
    }

    fn push(&mut self, stage: ReportStage, mut record: TestRecord) -> usize {
        let index = self.arena.len();
        let parent = self.stack.last().map(|frame| frame.index);
        if let Some(parent) = parent {
            record.parent_reference_id = Some(self.arena[parent].record.record_id.clone());
            self.arena[parent].children.push(index);
        }
        self.arena.push(RecordNode {
            record,
            stage,
            children: Vec::new(),
            outcome: None,
        });
        self.stack.push(Frame { index, parent });
        index
    }

    fn pop(&mut self) -> Result<usize, ResultsError> {
        self.stack
            .pop()
            .map(|frame| frame.index)
            .ok_or_else(|| ResultsError::Sequence("no open record to close".to_string()))
    }

    fn close(&mut self, index: usize, end_ms: u64) {
        let record = &mut self.arena[index].record;
        let start = record.start_time_ms.unwrap_or(end_ms);
        record.end_time_ms = Some(end_ms.max(start));
    }

    fn materialize(&self, index: usize) -> TestRecord {
        let node = &self.arena[index];
        let mut record = node.record.clone();
        record.children = node
            .children
            .iter()
            .map(|child| ChildReference::Inline(self.materialize(*child)))
            .collect();
        if node.stage != ReportStage::TestCase && record.is_ended() {
            record.status = record.derived_status();
        }
        record
    }

    fn refresh_context(&mut self) {
        if let (Some(context), Some(root)) = (&self.context, self.arena.first_mut()) {
            root.record.description = Some(Description::Invocation(context.snapshot()));
        }
    }

    fn emit(&mut self, kind: SnapshotKind) {
        if !self.options.granular {
            return;
        }
        let root = self.materialize(0);
        if let Err(err) = self.sink.on_snapshot(&root, kind) {
            self.record_sink_error(kind, err);
        }
    }

    fn record_sink_error(&mut self, kind: SnapshotKind, err: ResultsError) {
        append_run_log(
            "warn",
            "reporter.sink_failed",
            json!({ "kind": kind.as_str(), "error": err.to_string() }),
        );
        self.sink_errors.push(err);
    }

    fn open_test(&self, test: &TestDescription) -> Result<usize, ResultsError> {
        let frame = self.top()?;
        let id = test.to_string();
        if self.arena[frame.index].record.record_id != id {
            return Err(ResultsError::Sequence(format!(
                "test {id} is not the open test case {}",
                self.arena[frame.index].record.record_id
            )));
        }
        Ok(frame.index)
    }

    /// Run that encloses the innermost open record, found through the
    /// frames' parent links rather than the stack top.
    fn enclosing_run(&self) -> Result<usize, ResultsError> {
        let mut frame = self.top()?;
        loop {
            if self.arena[frame.index].stage == ReportStage::Run {
                return Ok(frame.index);
            }
            let parent = frame
                .parent
                .ok_or_else(|| ResultsError::Sequence("no open run".to_string()))?;
            frame = self
                .stack
                .iter()
                .rev()
                .find(|candidate| candidate.index == parent)
                .copied()
                .ok_or_else(|| ResultsError::Sequence("no open run".to_string()))?;
        }
    }

    fn set_outcome(
        &mut self,
        test: &TestDescription,
        outcome: Status,
        failure: Option<&FailureDescription>,
    ) -> ListenerResult {
        self.check(ReportEvent::TestOutcome)?;
        let index = self.open_test(test)?;
        let node = &mut self.arena[index];
        node.outcome = Some(outcome);
        if let Some(failure) = failure {
            node.record.debug_info = Some(DebugInfo::from(failure));
        }
        Ok(())
    }

    fn attach_artifact(&mut self, name: &str, log: LogFile) -> ListenerResult {
        self.check(ReportEvent::Log)?;
        let frame = self.top()?;
        self.arena[frame.index]
            .record
            .artifacts
            .insert(name.to_string(), log);
        Ok(())
    }

    fn save_log(&self, name: &str, data_type: LogDataType, data: &[u8]) -> Result<LogFile, ResultsError> {
        let Some(dir) = &self.options.log_dir else {
            return Ok(LogFile::new("", data_type, data.len() as u64));
        };
        std::fs::create_dir_all(dir).map_err(|e| ResultsError::Io(e.to_string()))?;
        let file_name = name
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
            .collect::<String>();
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{file_name}-"))
            .suffix(&format!(".{}", data_type.extension()))
            .tempfile_in(dir)
            .map_err(|e| ResultsError::Io(e.to_string()))?;
        file.write_all(data).map_err(|e| ResultsError::Io(e.to_string()))?;
        let (_, path) = file.keep().map_err(|e| ResultsError::Io(e.to_string()))?;
        append_run_log(
            "info",
            "reporter.test_log_saved",
            json!({ "name": name, "path": path.display().to_string(), "bytes": data.len() }),
        );
        Ok(LogFile::new(
            path.display().to_string(),
            data_type,
            data.len() as u64,
        ))
    }
}

impl TestListener for ResultReporter {
    fn invocation_started(&mut self, context: &ContextHandle) -> ListenerResult {
        self.check(ReportEvent::InvocationStarted)?;
        let snapshot = context.snapshot();
        let record_id = snapshot
            .invocation_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("invocation-{}-{}", std::process::id(), now_ms()));
        let mut root = TestRecord::new(record_id);
        root.start_time_ms = Some(now_ms());
        root.description = Some(Description::Invocation(snapshot));
        self.context = Some(context.clone());
        self.push(ReportStage::Invocation, root);
        self.emit(SnapshotKind::InvocationStarted);
        Ok(())
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) -> ListenerResult {
        self.check(ReportEvent::InvocationFailed)?;
        self.arena[0].record.debug_info = Some(DebugInfo::from(failure));
        Ok(())
    }

    fn invocation_ended(&mut self, elapsed_ms: u64) -> ListenerResult {
        self.check(ReportEvent::InvocationEnded)?;
        let index = self.pop()?;
        let start = self.arena[index].record.start_time_ms.unwrap_or_else(now_ms);
        self.close(index, start.saturating_add(elapsed_ms));
        self.refresh_context();
        self.ended = true;

        let root = self.materialize(0);
        if let Err(err) = self.sink.on_final(&root) {
            self.record_sink_error(SnapshotKind::InvocationEnded, err);
        }
        append_run_log(
            "info",
            "reporter.invocation_ended",
            json!({
                "record_id": root.record_id,
                "status": format!("{:?}", root.status),
                "children": root.children.len(),
            }),
        );
        Ok(())
    }

    fn test_module_started(&mut self, module: &ModuleContext) -> ListenerResult {
        self.check(ReportEvent::ModuleStarted)?;
        self.refresh_context();
        let mut record = TestRecord::new(module.module_id.clone());
        record.start_time_ms = Some(now_ms());
        record.description = Some(Description::Module(module.clone()));
        self.push(ReportStage::Module, record);
        self.emit(SnapshotKind::ModuleStarted);
        Ok(())
    }

    fn test_module_ended(&mut self) -> ListenerResult {
        self.check(ReportEvent::ModuleEnded)?;
        let index = self.pop()?;
        self.close(index, now_ms());
        self.emit(SnapshotKind::ModuleEnded);
        Ok(())
    }

    fn test_run_started(
        &mut self,
        name: &str,
        test_count: u64,
        attempt: u32,
        start_ms: u64,
    ) -> ListenerResult {
        self.check(ReportEvent::RunStarted)?;
        let mut record = TestRecord::new(name);
        record.start_time_ms = Some(start_ms);
        record.num_expected_children = Some(test_count);
        record.attempt = Some(attempt);
        self.push(ReportStage::Run, record);
        self.emit(SnapshotKind::RunStarted);
        Ok(())
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) -> ListenerResult {
        self.check(ReportEvent::RunFailed)?;
        let run = self.enclosing_run()?;
        let record = &mut self.arena[run].record;
        let incoming = DebugInfo::from(failure);
        record.debug_info = Some(match record.debug_info.take() {
            Some(mut existing) => {
                existing.error_message =
                    format!("{}\n\n{}", existing.error_message, incoming.error_message);
                existing
            }
            None => incoming,
        });
        Ok(())
    }

    fn test_run_ended(&mut self, elapsed_ms: u64, metrics: &Metrics) -> ListenerResult {
        self.check(ReportEvent::RunEnded)?;
        let index = self.pop()?;
        let start = self.arena[index].record.start_time_ms.unwrap_or(0);
        self.close(index, start.saturating_add(elapsed_ms));
        for (key, value) in metrics {
            self.arena[index]
                .record
                .metrics
                .insert(key.clone(), value.clone());
        }
        self.emit(SnapshotKind::RunEnded);
        Ok(())
    }

    fn test_started(&mut self, test: &TestDescription, start_ms: u64) -> ListenerResult {
        self.check(ReportEvent::TestStarted)?;
        let mut record = TestRecord::new(test.to_string());
        record.start_time_ms = Some(start_ms);
        self.push(ReportStage::TestCase, record);
        self.emit(SnapshotKind::TestStarted);
        Ok(())
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) -> ListenerResult {
        self.set_outcome(test, Status::Fail, Some(failure))
    }

    fn test_assumption_failure(
        &mut self,
        test: &TestDescription,
        failure: &FailureDescription,
    ) -> ListenerResult {
        self.set_outcome(test, Status::AssumptionFailure, Some(failure))
    }

    fn test_ignored(&mut self, test: &TestDescription) -> ListenerResult {
        self.set_outcome(test, Status::Ignored, None)
    }

    fn test_ended(&mut self, test: &TestDescription, end_ms: u64, metrics: &Metrics) -> ListenerResult {
        self.check(ReportEvent::TestEnded)?;
        let index = self.open_test(test)?;
        self.pop()?;
        self.close(index, end_ms);
        let node = &mut self.arena[index];
        node.record.status = match node.outcome {
            Some(outcome) => outcome,
            None if node.record.debug_info.is_some() => Status::Fail,
            None => Status::Pass,
        };
        for (key, value) in metrics {
            node.record.metrics.insert(key.clone(), value.clone());
        }
        self.emit(SnapshotKind::TestEnded);
        Ok(())
    }

    fn log_association(&mut self, name: &str, log: &LogFile) -> ListenerResult {
        self.attach_artifact(name, log.clone())
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &[u8]) -> ListenerResult {
        self.check(ReportEvent::Log)?;
        let log = self.save_log(name, data_type, data)?;
        self.attach_artifact(name, log)
    }
}
