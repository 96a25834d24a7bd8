//! The hierarchical result record that travels between reporter and parser.
//!
//! A tree is rooted at the invocation. Its children are modules (records with
//! a module description) or runs; a module's children are runs and a run's
//! children are test cases. Position, not a kind field, tells a run from a
//! test case.

use crate::types::{
    ErrorCause, ErrorIdentifier, FailureDescription, FailureStatus, InvocationContext, LogFile,
    Metrics, ModuleContext,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Artifacts = BTreeMap<String, LogFile>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Unknown,
    Pass,
    Fail,
    Ignored,
    AssumptionFailure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_status: Option<FailureStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_in_progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_identifier: Option<ErrorIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_help_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialized_cause: Option<String>,
}

impl From<&FailureDescription> for DebugInfo {
    fn from(failure: &FailureDescription) -> Self {
        Self {
            error_message: failure.error_message.clone(),
            trace: failure.trace.clone(),
            failure_status: failure.failure_status,
            action_in_progress: failure.action_in_progress.clone(),
            error_identifier: failure.error_identifier.clone(),
            origin: failure.origin.clone(),
            debug_help_message: failure.debug_help_message.clone(),
            serialized_cause: failure.cause.as_ref().map(ErrorCause::to_wire),
        }
    }
}

impl DebugInfo {
    pub fn to_failure(&self) -> FailureDescription {
        FailureDescription {
            error_message: self.error_message.clone(),
            failure_status: self.failure_status,
            action_in_progress: self.action_in_progress.clone(),
            error_identifier: self.error_identifier.clone(),
            origin: self.origin.clone(),
            debug_help_message: self.debug_help_message.clone(),
            trace: self.trace.clone(),
            cause: self.serialized_cause.as_deref().map(ErrorCause::from_wire),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildReference {
    Inline(TestRecord),
    /// Points at a record delivered as its own frame.
    Id(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Description {
    Invocation(InvocationContext),
    Module(ModuleContext),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<DebugInfo>,
    #[serde(default, skip_serializing_if = "Metrics::is_empty")]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Artifacts::is_empty")]
    pub artifacts: Artifacts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_expected_children: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Description>,
}

impl TestRecord {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            ..Self::default()
        }
    }

    pub fn is_ended(&self) -> bool {
        self.end_time_ms.is_some()
    }

    pub fn elapsed_ms(&self) -> u64 {
        match (self.start_time_ms, self.end_time_ms) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => 0,
        }
    }

    pub fn invocation_context(&self) -> Option<&InvocationContext> {
        match &self.description {
            Some(Description::Invocation(context)) => Some(context),
            _ => None,
        }
    }

    pub fn module_context(&self) -> Option<&ModuleContext> {
        match &self.description {
            Some(Description::Module(context)) => Some(context),
            _ => None,
        }
    }

    pub fn is_module(&self) -> bool {
        self.module_context().is_some()
    }

    /// Status a container earns from its own failure and its children.
    pub fn derived_status(&self) -> Status {
        let child_failed = self.children.iter().any(|child| {
            matches!(child, ChildReference::Inline(record) if record.status == Status::Fail)
        });
        if self.debug_info.is_some() || child_failed {
            Status::Fail
        } else {
            Status::Pass
        }
    }

    /// Folds a later snapshot of the same record into this one. Metrics and
    /// artifacts only ever grow; scalar fields take the later value when set.
    pub fn merge_from(&mut self, other: &TestRecord) {
        for (key, value) in &other.metrics {
            self.metrics.insert(key.clone(), value.clone());
        }
        for (key, value) in &other.artifacts {
            self.artifacts.insert(key.clone(), value.clone());
        }
        if other.start_time_ms.is_some() && self.start_time_ms.is_none() {
            self.start_time_ms = other.start_time_ms;
        }
        if other.end_time_ms.is_some() {
            self.end_time_ms = other.end_time_ms;
        }
        if other.status != Status::Unknown {
            self.status = other.status;
        }
        if other.debug_info.is_some() {
            self.debug_info = other.debug_info.clone();
        }
        if other.children.len() > self.children.len() {
            self.children = other.children.clone();
        }
        if other.num_expected_children.is_some() {
            self.num_expected_children = other.num_expected_children;
        }
        match (&mut self.description, &other.description) {
            (Some(Description::Invocation(mine)), Some(Description::Invocation(theirs))) => {
                mine.merge_from(theirs)
            }
            (Some(Description::Module(mine)), Some(Description::Module(theirs))) => {
                mine.merge_from(theirs)
            }
            (None, Some(theirs)) => self.description = Some(theirs.clone()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogDataType;

    fn leaf(id: &str, status: Status) -> ChildReference {
        ChildReference::Inline(TestRecord {
            status,
            ..TestRecord::new(id)
        })
    }

    #[test]
    fn container_status_follows_children_and_own_failure() {
        let mut run = TestRecord::new("run");
        run.children = vec![leaf("a#1", Status::Pass), leaf("a#2", Status::Ignored)];
        assert_eq!(run.derived_status(), Status::Pass);

        run.children.push(leaf("a#3", Status::Fail));
        assert_eq!(run.derived_status(), Status::Fail);

        let mut failed_run = TestRecord::new("run");
        failed_run.debug_info = Some(DebugInfo::default());
        assert_eq!(failed_run.derived_status(), Status::Fail);
    }

    #[test]
    fn merge_is_a_monotonic_union() {
        let mut first = TestRecord::new("run");
        first.metrics.insert("a".to_string(), "1".to_string());
        first.artifacts.insert(
            "log".to_string(),
            LogFile::new("/tmp/log", LogDataType::Text, 3),
        );
        let mut second = TestRecord::new("run");
        second.metrics.insert("b".to_string(), "2".to_string());
        second.metrics.insert("a".to_string(), "3".to_string());
        second.end_time_ms = Some(10);

        first.merge_from(&second);
        assert_eq!(first.metrics.len(), 2);
        assert_eq!(first.metrics["a"], "3");
        assert_eq!(first.artifacts.len(), 1);
        assert!(first.is_ended());
    }

    #[test]
    fn description_is_tagged_by_kind() {
        let mut record = TestRecord::new("module");
        record.description = Some(Description::Module(ModuleContext::new("armeabi CtsFoo")));
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["description"]["type"], "module");
        let back: TestRecord = serde_json::from_value(json).expect("deserialize");
        assert!(back.is_module());
        assert!(back.invocation_context().is_none());
    }

    #[test]
    fn debug_info_keeps_the_cause_through_failure_conversion() {
        let failure = FailureDescription::new("boom")
            .with_status(FailureStatus::InfraFailure)
            .with_cause(ErrorCause::new("NullPointerException", "npe"));
        let info = DebugInfo::from(&failure);
        assert!(info.serialized_cause.as_deref().unwrap_or_default().contains("NullPointerException"));
        assert_eq!(info.to_failure(), failure);
    }
}
