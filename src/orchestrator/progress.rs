use std::fmt;

use crate::action::ActionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Skipping,
    PreExecute,
    Deleting,
    Copying,
    Patching,
    Registering,
    PostExecute,
    Committed,
    Restoring,
    Removing,
    RestoringRegistration,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Skipping => "Skipping",
            Phase::PreExecute => "Running",
            Phase::Deleting => "Deleting",
            Phase::Copying => "Copying",
            Phase::Patching => "Patching",
            Phase::Registering => "Registering",
            Phase::PostExecute => "Running",
            Phase::Committed => "Done",
            Phase::Restoring => "Restoring",
            Phase::Removing => "Removing",
            Phase::RestoringRegistration => "Restoring registration",
        })
    }
}

/// Notification for the logger/UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub index: usize,
    pub total: usize,
    pub file: String,
    pub kind: ActionKind,
    pub phase: Phase,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}/{}]: {} ({})",
            self.phase,
            self.index + 1,
            self.total,
            self.file,
            self.kind
        )
    }
}
