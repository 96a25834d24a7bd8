use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

pub type Metrics = BTreeMap<String, String>;
pub type AttributeMap = BTreeMap<String, Vec<String>>;

pub const INVOCATION_ID_KEY: &str = "invocation_id";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestDescription {
    pub class_name: String,
    pub test_name: String,
}

impl TestDescription {
    pub fn new(class_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            test_name: test_name.into(),
        }
    }

    /// Inverse of `Display`: splits on the last `#`. An id without one is
    /// treated as a bare method name.
    pub fn parse_id(id: &str) -> Self {
        match id.rsplit_once('#') {
            Some((class_name, test_name)) => Self::new(class_name, test_name),
            None => Self::new("", id),
        }
    }
}

impl fmt::Display for TestDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    TestFailure,
    TimedOut,
    Cancelled,
    InfraFailure,
    SystemUnderTestCrashed,
    NotExecuted,
    LostSystemUnderTest,
    DependencyIssue,
    CustomerIssue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorIdentifier {
    pub code: i64,
    pub name: String,
}

/// Portable stand-in for the error object behind an invocation failure. It is
/// what travels in a record's `serialized_cause`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCause {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl ErrorCause {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            chain: Vec::new(),
        }
    }

    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }

    /// Rebuilds a cause from its serialized form; text that is not a
    /// serialized cause becomes a generic one carrying the raw text.
    pub fn from_wire(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::new("GenericError", raw))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescription {
    pub error_message: String,
    pub failure_status: Option<FailureStatus>,
    pub action_in_progress: Option<String>,
    pub error_identifier: Option<ErrorIdentifier>,
    pub origin: Option<String>,
    pub debug_help_message: Option<String>,
    pub trace: Option<String>,
    pub cause: Option<ErrorCause>,
}

impl FailureDescription {
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: FailureStatus) -> Self {
        self.failure_status = Some(status);
        self
    }

    pub fn with_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogDataType {
    Text,
    HostLog,
    Logcat,
    Bugreport,
    Xml,
    Png,
    Zip,
    Unknown,
}

impl LogDataType {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Text | Self::HostLog | Self::Logcat | Self::Bugreport => "txt",
            Self::Xml => "xml",
            Self::Png => "png",
            Self::Zip => "zip",
            Self::Unknown => "dat",
        }
    }

    pub fn is_text(self) -> bool {
        matches!(
            self,
            Self::Text | Self::HostLog | Self::Logcat | Self::Bugreport | Self::Xml
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    pub path: String,
    #[serde(default)]
    pub url: String,
    pub is_text: bool,
    pub data_type: LogDataType,
    pub size: u64,
}

impl LogFile {
    pub fn new(path: impl Into<String>, data_type: LogDataType, size: u64) -> Self {
        Self {
            path: path.into(),
            url: String::new(),
            is_text: data_type.is_text(),
            data_type,
            size,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleContext {
    pub module_id: String,
    #[serde(default)]
    pub attributes: AttributeMap,
}

impl ModuleContext {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            attributes: AttributeMap::new(),
        }
    }

    pub fn merge_from(&mut self, other: &ModuleContext) {
        if !other.module_id.is_empty() {
            self.module_id = other.module_id.clone();
        }
        merge_attributes(&mut self.attributes, &other.attributes);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub build_id: String,
    #[serde(default)]
    pub build_target: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    #[serde(default)]
    pub build_infos: Vec<BuildInfo>,
    #[serde(default)]
    pub attributes: AttributeMap,
}

impl InvocationContext {
    pub fn invocation_id(&self) -> Option<&str> {
        self.attributes
            .get(INVOCATION_ID_KEY)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let values = self.attributes.entry(key.into()).or_default();
        let value = value.into();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Folds `other` into `self`. Per attribute key the incoming list wins;
    /// keys `other` lacks persist, and an empty incoming list never clears a
    /// stored one. Build infos merge by build id.
    pub fn merge_from(&mut self, other: &InvocationContext) {
        merge_attributes(&mut self.attributes, &other.attributes);
        for incoming in &other.build_infos {
            match self
                .build_infos
                .iter_mut()
                .find(|info| info.build_id == incoming.build_id)
            {
                Some(existing) => {
                    if !incoming.build_target.is_empty() {
                        existing.build_target = incoming.build_target.clone();
                    }
                    for (key, value) in &incoming.attributes {
                        existing.attributes.insert(key.clone(), value.clone());
                    }
                }
                None => self.build_infos.push(incoming.clone()),
            }
        }
    }
}

fn merge_attributes(target: &mut AttributeMap, incoming: &AttributeMap) {
    for (key, values) in incoming {
        if values.is_empty() {
            continue;
        }
        let mut deduped = Vec::with_capacity(values.len());
        for value in values {
            if !deduped.contains(value) {
                deduped.push(value.clone());
            }
        }
        target.insert(key.clone(), deduped);
    }
}

/// Long-lived, caller-owned invocation context shared between the code that
/// mutates it and the reporter or parser that serializes it.
#[derive(Debug, Clone, Default)]
pub struct ContextHandle {
    inner: Arc<Mutex<InvocationContext>>,
}

impl ContextHandle {
    pub fn new(context: InvocationContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    pub fn snapshot(&self) -> InvocationContext {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_attribute(key, value);
    }

    pub fn merge_from(&self, other: &InvocationContext) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge_from(other);
    }

    pub fn ptr_eq(&self, other: &ContextHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
