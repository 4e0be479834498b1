//! Immutable per-file update actions.
//!
//! Manifest parsing produces [`ActionSpec`] values; [`ActionSpec::build`]
//! checks every invariant and yields an [`UpdateFileAction`], which cannot be
//! changed afterwards. Deserialization goes through the same check.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid action '{path}': {reason}")]
pub struct ActionError {
    pub path: String,
    pub reason: String,
}

impl ActionError {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    Any,
    Bits32,
    Bits64,
}

impl Architecture {
    /// Architecture of the running build.
    pub fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            Architecture::Bits64
        } else {
            Architecture::Bits32
        }
    }

    pub fn runs_on(self, host: Architecture) -> bool {
        self == Architecture::Any || self == host
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::Any => "any",
            Architecture::Bits32 => "32-bit",
            Architecture::Bits64 => "64-bit",
        })
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(Architecture::Any),
            "32" | "32-bit" | "x86" => Ok(Architecture::Bits32),
            "64" | "64-bit" | "x64" | "x86_64" => Ok(Architecture::Bits64),
            other => Err(format!("unknown architecture '{other}' (expected any, 32 or 64)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionTiming {
    BeforeUpdate,
    AfterUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Elevation {
    #[default]
    Inherit,
    Elevated,
    Unelevated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComRegistration {
    Register,
    Unregister,
}

/// How and when the action's file is run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub timing: ExecutionTiming,
    pub arguments: Vec<String>,
    pub wait: bool,
    pub elevation: Elevation,
    pub rollback_exit_codes: BTreeSet<i32>,
    /// Must be set for 0 to appear in `rollback_exit_codes`.
    pub zero_exit_triggers_rollback: bool,
}

impl Execution {
    pub fn new(timing: ExecutionTiming) -> Self {
        Self {
            timing,
            arguments: Vec::new(),
            wait: false,
            elevation: Elevation::Inherit,
            rollback_exit_codes: BTreeSet::new(),
            zero_exit_triggers_rollback: false,
        }
    }

    pub fn before_update() -> Self {
        Self::new(ExecutionTiming::BeforeUpdate)
    }

    pub fn after_update() -> Self {
        Self::new(ExecutionTiming::AfterUpdate)
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn waiting(mut self) -> Self {
        self.wait = true;
        self
    }

    pub fn with_elevation(mut self, elevation: Elevation) -> Self {
        self.elevation = elevation;
        self
    }

    pub fn rollback_on(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.rollback_exit_codes.extend(codes);
        self
    }

    pub fn triggers_rollback(&self, exit_code: i32) -> bool {
        self.rollback_exit_codes.contains(&exit_code)
    }
}

/// What happens to the file's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOperation {
    /// Replace or create the file with a payload verbatim.
    Copy { payload: String, target_checksum: u32 },
    /// Rebuild the file from its installed version and a delta payload.
    Patch {
        delta: String,
        source_checksum: u32,
        target_checksum: u32,
    },
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Copy,
    Patch,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Copy => "copy",
            ActionKind::Patch => "patch",
            ActionKind::Delete => "delete",
        })
    }
}

impl FileOperation {
    pub fn kind(&self) -> ActionKind {
        match self {
            FileOperation::Copy { .. } => ActionKind::Copy,
            FileOperation::Patch { .. } => ActionKind::Patch,
            FileOperation::Delete => ActionKind::Delete,
        }
    }

    pub fn payload_ref(&self) -> Option<&str> {
        match self {
            FileOperation::Copy { payload, .. } => Some(payload),
            FileOperation::Patch { delta, .. } => Some(delta),
            FileOperation::Delete => None,
        }
    }

    pub fn target_checksum(&self) -> Option<u32> {
        match self {
            FileOperation::Copy {
                target_checksum, ..
            }
            | FileOperation::Patch {
                target_checksum, ..
            } => Some(*target_checksum),
            FileOperation::Delete => None,
        }
    }
}

/// Unvalidated action as read from a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub path: String,
    pub operation: FileOperation,
    pub architecture: Architecture,
    pub execution: Option<Execution>,
    pub com: Option<ComRegistration>,
}

impl ActionSpec {
    pub fn new(path: impl Into<String>, operation: FileOperation) -> Self {
        Self {
            path: path.into(),
            operation,
            architecture: Architecture::Any,
            execution: None,
            com: None,
        }
    }

    pub fn copy(path: impl Into<String>, payload: impl Into<String>, target_checksum: u32) -> Self {
        Self::new(
            path,
            FileOperation::Copy {
                payload: payload.into(),
                target_checksum,
            },
        )
    }

    pub fn patch(
        path: impl Into<String>,
        delta: impl Into<String>,
        source_checksum: u32,
        target_checksum: u32,
    ) -> Self {
        Self::new(
            path,
            FileOperation::Patch {
                delta: delta.into(),
                source_checksum,
                target_checksum,
            },
        )
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(path, FileOperation::Delete)
    }

    pub fn for_architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = Some(execution);
        self
    }

    pub fn with_com(mut self, com: ComRegistration) -> Self {
        self.com = Some(com);
        self
    }

    pub fn build(self) -> Result<UpdateFileAction, ActionError> {
        UpdateFileAction::try_from(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ActionSpec", into = "ActionSpec")]
pub struct UpdateFileAction {
    path: String,
    operation: FileOperation,
    architecture: Architecture,
    execution: Option<Execution>,
    com: Option<ComRegistration>,
}

impl TryFrom<ActionSpec> for UpdateFileAction {
    type Error = ActionError;

    fn try_from(spec: ActionSpec) -> Result<Self, Self::Error> {
        check_relative_path(&spec.path)?;

        if let Some(reference) = spec.operation.payload_ref() {
            if reference.is_empty() {
                return Err(ActionError::new(&spec.path, "empty payload reference"));
            }
        }

        if spec.operation == FileOperation::Delete {
            if spec.execution.is_some() {
                return Err(ActionError::new(&spec.path, "a deleted file cannot be executed"));
            }
            if spec.com.is_some() {
                return Err(ActionError::new(
                    &spec.path,
                    "a deleted file cannot take part in component registration",
                ));
            }
        }

        if let Some(exec) = &spec.execution {
            if exec.rollback_exit_codes.contains(&0) && !exec.zero_exit_triggers_rollback {
                return Err(ActionError::new(
                    &spec.path,
                    "exit code 0 listed as rollback trigger without declaring it",
                ));
            }
            if !exec.rollback_exit_codes.is_empty() && !exec.wait {
                return Err(ActionError::new(
                    &spec.path,
                    "rollback exit codes require waiting for the process",
                ));
            }
        }

        Ok(Self {
            path: spec.path,
            operation: spec.operation,
            architecture: spec.architecture,
            execution: spec.execution,
            com: spec.com,
        })
    }
}

impl From<UpdateFileAction> for ActionSpec {
    fn from(action: UpdateFileAction) -> Self {
        Self {
            path: action.path,
            operation: action.operation,
            architecture: action.architecture,
            execution: action.execution,
            com: action.com,
        }
    }
}

impl UpdateFileAction {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path as platform components, accepting either separator.
    pub fn relative_path(&self) -> PathBuf {
        self.path
            .split(['/', '\\'])
            .filter(|part| !part.is_empty())
            .collect()
    }

    pub fn operation(&self) -> &FileOperation {
        &self.operation
    }

    pub fn kind(&self) -> ActionKind {
        self.operation.kind()
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn execution(&self) -> Option<&Execution> {
        self.execution.as_ref()
    }

    pub fn execution_at(&self, timing: ExecutionTiming) -> Option<&Execution> {
        self.execution.as_ref().filter(|e| e.timing == timing)
    }

    pub fn com(&self) -> Option<ComRegistration> {
        self.com
    }
}

fn check_relative_path(path: &str) -> Result<(), ActionError> {
    if path.trim().is_empty() {
        return Err(ActionError::new(path, "empty relative path"));
    }
    if path.starts_with(['/', '\\']) {
        return Err(ActionError::new(path, "path must be relative"));
    }
    for part in path.split(['/', '\\']) {
        if part == ".." {
            return Err(ActionError::new(path, "path traversal not allowed"));
        }
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(ActionError::new(path, "path must be relative")),
        }
    }
    Ok(())
}

/// Key under which two paths name the same file on a case-insensitive system.
fn path_key(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("/")
}

/// Checks that hold across a whole action list.
pub fn validate_actions(actions: &[UpdateFileAction]) -> Result<(), ActionError> {
    let mut seen: HashMap<String, &str> = HashMap::with_capacity(actions.len());
    for action in actions {
        if let Some(first) = seen.insert(path_key(action.path()), action.path()) {
            return Err(ActionError::new(
                action.path(),
                format!("duplicates '{first}' (paths are case-insensitive)"),
            ));
        }
    }
    Ok(())
}
