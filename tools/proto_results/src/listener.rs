//! The test-lifecycle listener surface.
//!
//! Executors call it to report results; the reporter implements it to build
//! records and the parser drives it when replaying them. Every callback has a
//! no-op default so sinks only implement what they care about.

use crate::errors::ResultsError;
use crate::types::{
    ContextHandle, FailureDescription, LogDataType, LogFile, Metrics, ModuleContext,
    TestDescription,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

pub type ListenerResult = Result<(), ResultsError>;

pub trait TestListener: Send {
    fn invocation_started(&mut self, _context: &ContextHandle) -> ListenerResult {
        Ok(())
    }

    fn invocation_failed(&mut self, _failure: &FailureDescription) -> ListenerResult {
        Ok(())
    }

    fn invocation_ended(&mut self, _elapsed_ms: u64) -> ListenerResult {
        Ok(())
    }

    fn test_module_started(&mut self, _module: &ModuleContext) -> ListenerResult {
        Ok(())
    }

    fn test_module_ended(&mut self) -> ListenerResult {
        Ok(())
    }

    fn test_run_started(
        &mut self,
        _name: &str,
        _test_count: u64,
        _attempt: u32,
        _start_ms: u64,
    ) -> ListenerResult {
        Ok(())
    }

    fn test_run_failed(&mut self, _failure: &FailureDescription) -> ListenerResult {
        Ok(())
    }

    fn test_run_ended(&mut self, _elapsed_ms: u64, _metrics: &Metrics) -> ListenerResult {
        Ok(())
    }

    fn test_started(&mut self, _test: &TestDescription, _start_ms: u64) -> ListenerResult {
        Ok(())
    }

    fn test_failed(
        &mut self,
        _test: &TestDescription,
        _failure: &FailureDescription,
    ) -> ListenerResult {
        Ok(())
    }

    fn test_assumption_failure(
        &mut self,
        _test: &TestDescription,
        _failure: &FailureDescription,
    ) -> ListenerResult {
        Ok(())
    }

    fn test_ignored(&mut self, _test: &TestDescription) -> ListenerResult {
        Ok(())
    }

    fn test_ended(
        &mut self,
        _test: &TestDescription,
        _end_ms: u64,
        _metrics: &Metrics,
    ) -> ListenerResult {
        Ok(())
    }

    fn log_association(&mut self, _name: &str, _log: &LogFile) -> ListenerResult {
        Ok(())
    }

    fn test_log(&mut self, _name: &str, _data_type: LogDataType, _data: &[u8]) -> ListenerResult {
        Ok(())
    }
}

impl<L: TestListener + ?Sized> TestListener for Box<L> {
    fn invocation_started(&mut self, context: &ContextHandle) -> ListenerResult {
        (**self).invocation_started(context)
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) -> ListenerResult {
        (**self).invocation_failed(failure)
    }

    fn invocation_ended(&mut self, elapsed_ms: u64) -> ListenerResult {
        (**self).invocation_ended(elapsed_ms)
    }

    fn test_module_started(&mut self, module: &ModuleContext) -> ListenerResult {
        (**self).test_module_started(module)
    }

    fn test_module_ended(&mut self) -> ListenerResult {
        (**self).test_module_ended()
    }

    fn test_run_started(
        &mut self,
        name: &str,
        test_count: u64,
        attempt: u32,
        start_ms: u64,
    ) -> ListenerResult {
        (**self).test_run_started(name, test_count, attempt, start_ms)
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) -> ListenerResult {
        (**self).test_run_failed(failure)
    }

    fn test_run_ended(&mut self, elapsed_ms: u64, metrics: &Metrics) -> ListenerResult {
        (**self).test_run_ended(elapsed_ms, metrics)
    }

    fn test_started(&mut self, test: &TestDescription, start_ms: u64) -> ListenerResult {
        (**self).test_started(test, start_ms)
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) -> ListenerResult {
        (**self).test_failed(test, failure)
    }

    fn test_assumption_failure(
        &mut self,
        test: &TestDescription,
        failure: &FailureDescription,
    ) -> ListenerResult {
        (**self).test_assumption_failure(test, failure)
    }

    fn test_ignored(&mut self, test: &TestDescription) -> ListenerResult {
        (**self).test_ignored(test)
    }

    fn test_ended(&mut self, test: &TestDescription, end_ms: u64, metrics: &Metrics) -> ListenerResult {
        (**self).test_ended(test, end_ms, metrics)
    }

    fn log_association(&mut self, name: &str, log: &LogFile) -> ListenerResult {
        (**self).log_association(name, log)
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &[u8]) -> ListenerResult {
        (**self).test_log(name, data_type, data)
    }
}

/// One observed listener call, owned so it can be compared and printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ListenerEvent {
    InvocationStarted { invocation_id: Option<String> },
    InvocationFailed { failure: FailureDescription },
    InvocationEnded { elapsed_ms: u64 },
    ModuleStarted { module_id: String },
    ModuleEnded,
    RunStarted { name: String, test_count: u64, attempt: u32, start_ms: u64 },
    RunFailed { failure: FailureDescription },
    RunEnded { elapsed_ms: u64, metrics: Metrics },
    TestStarted { test: String, start_ms: u64 },
    TestFailed { test: String, failure: FailureDescription },
    TestAssumptionFailure { test: String, failure: FailureDescription },
    TestIgnored { test: String },
    TestEnded { test: String, end_ms: u64, metrics: Metrics },
    LogAssociation { name: String, log: LogFile },
    TestLog { name: String, data_type: LogDataType, size: u64 },
}

/// Listener that records every call. Clones share one event log, so a clone
/// kept by the caller observes calls made on a copy handed to a receiver.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<ListenerEvent>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, event: ListenerEvent) -> ListenerResult {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

impl TestListener for RecordingListener {
    fn invocation_started(&mut self, context: &ContextHandle) -> ListenerResult {
        let invocation_id = context.snapshot().invocation_id().map(str::to_string);
        self.push(ListenerEvent::InvocationStarted { invocation_id })
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) -> ListenerResult {
        self.push(ListenerEvent::InvocationFailed {
            failure: failure.clone(),
        })
    }

    fn invocation_ended(&mut self, elapsed_ms: u64) -> ListenerResult {
        self.push(ListenerEvent::InvocationEnded { elapsed_ms })
    }

    fn test_module_started(&mut self, module: &ModuleContext) -> ListenerResult {
        self.push(ListenerEvent::ModuleStarted {
            module_id: module.module_id.clone(),
        })
    }

    fn test_module_ended(&mut self) -> ListenerResult {
        self.push(ListenerEvent::ModuleEnded)
    }

    fn test_run_started(
        &mut self,
        name: &str,
        test_count: u64,
        attempt: u32,
        start_ms: u64,
    ) -> ListenerResult {
        self.push(ListenerEvent::RunStarted {
            name: name.to_string(),
            test_count,
            attempt,
            start_ms,
        })
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) -> ListenerResult {
        self.push(ListenerEvent::RunFailed {
            failure: failure.clone(),
        })
    }

    fn test_run_ended(&mut self, elapsed_ms: u64, metrics: &Metrics) -> ListenerResult {
        self.push(ListenerEvent::RunEnded {
            elapsed_ms,
            metrics: metrics.clone(),
        })
    }

    fn test_started(&mut self, test: &TestDescription, start_ms: u64) -> ListenerResult {
        self.push(ListenerEvent::TestStarted {
            test: test.to_string(),
            start_ms,
        })
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) -> ListenerResult {
        self.push(ListenerEvent::TestFailed {
            test: test.to_string(),
            failure: failure.clone(),
        })
    }

    fn test_assumption_failure(
        &mut self,
        test: &TestDescription,
        failure: &FailureDescription,
    ) -> ListenerResult {
        self.push(ListenerEvent::TestAssumptionFailure {
            test: test.to_string(),
            failure: failure.clone(),
        })
    }

    fn test_ignored(&mut self, test: &TestDescription) -> ListenerResult {
        self.push(ListenerEvent::TestIgnored {
            test: test.to_string(),
        })
    }

    fn test_ended(&mut self, test: &TestDescription, end_ms: u64, metrics: &Metrics) -> ListenerResult {
        self.push(ListenerEvent::TestEnded {
            test: test.to_string(),
            end_ms,
            metrics: metrics.clone(),
        })
    }

    fn log_association(&mut self, name: &str, log: &LogFile) -> ListenerResult {
        self.push(ListenerEvent::LogAssociation {
            name: name.to_string(),
            log: log.clone(),
        })
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &[u8]) -> ListenerResult {
        self.push(ListenerEvent::TestLog {
            name: name.to_string(),
            data_type,
            size: data.len() as u64,
        })
    }
}

/// Fans every call out to several listeners in order, stopping at the first
/// error.
#[derive(Default)]
pub struct ForwardingListener {
    targets: Vec<Box<dyn TestListener>>,
}

impl ForwardingListener {
    pub fn new(targets: Vec<Box<dyn TestListener>>) -> Self {
        Self { targets }
    }

    fn each(&mut self, mut call: impl FnMut(&mut dyn TestListener) -> ListenerResult) -> ListenerResult {
        for target in &mut self.targets {
            call(target.as_mut())?;
        }
        Ok(())
    }
}

impl TestListener for ForwardingListener {
    fn invocation_started(&mut self, context: &ContextHandle) -> ListenerResult {
        self.each(|target| target.invocation_started(context))
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) -> ListenerResult {
        self.each(|target| target.invocation_failed(failure))
    }

    fn invocation_ended(&mut self, elapsed_ms: u64) -> ListenerResult {
        self.each(|target| target.invocation_ended(elapsed_ms))
    }

    fn test_module_started(&mut self, module: &ModuleContext) -> ListenerResult {
        self.each(|target| target.test_module_started(module))
    }

    fn test_module_ended(&mut self) -> ListenerResult {
        self.each(|target| target.test_module_ended())
    }

    fn test_run_started(
        &mut self,
        name: &str,
        test_count: u64,
        attempt: u32,
        start_ms: u64,
    ) -> ListenerResult {
        self.each(|target| target.test_run_started(name, test_count, attempt, start_ms))
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) -> ListenerResult {
        self.each(|target| target.test_run_failed(failure))
    }

    fn test_run_ended(&mut self, elapsed_ms: u64, metrics: &Metrics) -> ListenerResult {
        self.each(|target| target.test_run_ended(elapsed_ms, metrics))
    }

    fn test_started(&mut self, test: &TestDescription, start_ms: u64) -> ListenerResult {
        self.each(|target| target.test_started(test, start_ms))
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) -> ListenerResult {
        self.each(|target| target.test_failed(test, failure))
    }

    fn test_assumption_failure(
        &mut self,
        test: &TestDescription,
        failure: &FailureDescription,
    ) -> ListenerResult {
        self.each(|target| target.test_assumption_failure(test, failure))
    }

    fn test_ignored(&mut self, test: &TestDescription) -> ListenerResult {
        self.each(|target| target.test_ignored(test))
    }

    fn test_ended(&mut self, test: &TestDescription, end_ms: u64, metrics: &Metrics) -> ListenerResult {
        self.each(|target| target.test_ended(test, end_ms, metrics))
    }

    fn log_association(&mut self, name: &str, log: &LogFile) -> ListenerResult {
        self.each(|target| target.log_association(name, log))
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &[u8]) -> ListenerResult {
        self.each(|target| target.test_log(name, data_type, data))
    }
}
