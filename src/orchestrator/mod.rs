//! Transactional execution of an ordered action list.
//!
//! Actions run strictly in order. Every change to the tree is preceded by an
//! undo record; on the first failure (or a cancellation seen between actions)
//! the records are replayed newest first. Side effects of processes that were
//! already run are not reversed.

mod progress;
mod undo;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::action::{
    validate_actions, ActionKind, ComRegistration, Execution, ExecutionTiming, FileOperation,
    UpdateFileAction,
};
use crate::apply::apply_delta;
use crate::checksum;
use crate::config::UpdateConfig;
use crate::error::{ExecutionFailure, UpdateError};
use crate::package::PayloadStore;
use crate::platform::{ComRegistrar, LaunchOutcome, LaunchRequest, ProcessLauncher};

pub use progress::{Phase, ProgressEvent};
pub use undo::UndoRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Applying,
    Committed,
    Skipped,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    NotStarted,
    InProgress,
    Completed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub path: String,
    pub kind: ActionKind,
    pub state: ActionState,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub struct UpdateReport {
    pub state: UpdateState,
    pub actions: Vec<ActionReport>,
    /// The failure that stopped the run; `RollbackFailure` when undo also failed.
    pub error: Option<UpdateError>,
    /// Set when backups were left on disk for inspection or manual recovery.
    pub retained_backups: Option<PathBuf>,
}

impl UpdateReport {
    pub fn is_completed(&self) -> bool {
        self.state == UpdateState::Completed
    }

    pub fn into_result(mut self) -> Result<Self, UpdateError> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Shared flag polled between actions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Mutable bookkeeping for one run. Undo records are kept in commit order.
struct RunState {
    state: UpdateState,
    reports: Vec<ActionReport>,
    undo: Vec<(usize, UndoRecord)>,
    backup_dir: PathBuf,
    backup_dir_created: bool,
}

impl RunState {
    fn transition(&mut self, next: UpdateState) {
        info!(from = ?self.state, to = ?next, "update state");
        self.state = next;
    }

    fn set_action(&mut self, index: usize, state: ActionState) {
        self.reports[index].state = state;
    }

    fn record(&mut self, index: usize, record: UndoRecord) {
        debug!(index, ?record, "undo recorded");
        self.undo.push((index, record));
    }
}

pub struct Orchestrator<L, R> {
    config: UpdateConfig,
    launcher: L,
    registrar: R,
    cancel: CancelToken,
}

impl<L: ProcessLauncher, R: ComRegistrar> Orchestrator<L, R> {
    pub fn new(config: UpdateConfig, launcher: L, registrar: R) -> Self {
        Self {
            config,
            launcher,
            registrar,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Apply `actions` in order, rolling everything back on the first failure.
    pub fn run<P, F>(
        &self,
        actions: &[UpdateFileAction],
        payloads: &P,
        mut on_progress: F,
    ) -> UpdateReport
    where
        P: PayloadStore + ?Sized,
        F: FnMut(&ProgressEvent),
    {
        let mut run = RunState {
            state: UpdateState::NotStarted,
            reports: actions
                .iter()
                .map(|a| ActionReport {
                    path: a.path().to_string(),
                    kind: a.kind(),
                    state: ActionState::Pending,
                    reason: None,
                })
                .collect(),
            undo: Vec::new(),
            backup_dir: self.config.backup_dir(),
            backup_dir_created: false,
        };

        info!(
            root = %self.config.root.display(),
            actions = actions.len(),
            host = %self.config.host,
            "update starting"
        );
        run.transition(UpdateState::InProgress);

        let outcome = self.execute(&mut run, actions, payloads, &mut on_progress);

        let (error, retained_backups) = match outcome {
            Ok(()) => {
                run.transition(UpdateState::Completed);
                (None, self.discard_backups(&run, self.config.keep_backups))
            }
            Err(cause) => {
                error!(error = %cause, "update failed, rolling back");
                run.transition(UpdateState::RollingBack);
                let failures = self.roll_back(&mut run, actions, &mut on_progress);
                if failures.is_empty() {
                    run.transition(UpdateState::RolledBack);
                    (Some(cause), self.discard_backups(&run, false))
                } else {
                    run.transition(UpdateState::RollbackFailed);
                    error!(
                        failures = failures.len(),
                        backups = %run.backup_dir.display(),
                        "rollback incomplete, backups kept for manual recovery"
                    );
                    let kept = run.backup_dir_created.then(|| run.backup_dir.clone());
                    (
                        Some(UpdateError::RollbackFailure {
                            original: Box::new(cause),
                            failures,
                        }),
                        kept,
                    )
                }
            }
        };

        UpdateReport {
            state: run.state,
            actions: run.reports,
            error,
            retained_backups,
        }
    }

    fn execute<P, F>(
        &self,
        run: &mut RunState,
        actions: &[UpdateFileAction],
        payloads: &P,
        on_progress: &mut F,
    ) -> Result<(), UpdateError>
    where
        P: PayloadStore + ?Sized,
        F: FnMut(&ProgressEvent),
    {
        validate_actions(actions).map_err(|e| UpdateError::InvalidAction {
            path: e.path,
            reason: e.reason,
        })?;
        for action in actions {
            if self
                .config
                .root
                .join(action.relative_path())
                .starts_with(&run.backup_dir)
            {
                return Err(UpdateError::InvalidAction {
                    path: action.path().to_string(),
                    reason: format!("targets the backup directory {}", run.backup_dir.display()),
                });
            }
        }
        self.prepare_backup_dir(run)?;

        let total = actions.len();
        for (index, action) in actions.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(next = action.path(), "cancellation requested");
                return Err(UpdateError::Cancelled);
            }

            let mut emit = |phase: Phase| {
                on_progress(&ProgressEvent {
                    index,
                    total,
                    file: action.path().to_string(),
                    kind: action.kind(),
                    phase,
                })
            };

            if !action.architecture().runs_on(self.config.host) {
                debug!(
                    file = action.path(),
                    required = %action.architecture(),
                    "architecture mismatch, skipping"
                );
                run.set_action(index, ActionState::Skipped);
                emit(Phase::Skipping);
                continue;
            }

            run.set_action(index, ActionState::Applying);
            match self.apply_action(run, index, action, payloads, &mut emit) {
                Ok(()) => {
                    run.set_action(index, ActionState::Committed);
                    emit(Phase::Committed);
                }
                Err(err) => {
                    run.set_action(index, ActionState::Failed);
                    run.reports[index].reason = Some(err.to_string());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn apply_action<P>(
        &self,
        run: &mut RunState,
        index: usize,
        action: &UpdateFileAction,
        payloads: &P,
        emit: &mut dyn FnMut(Phase),
    ) -> Result<(), UpdateError>
    where
        P: PayloadStore + ?Sized,
    {
        let target = self.config.root.join(action.relative_path());

        if let Some(exec) = action.execution_at(ExecutionTiming::BeforeUpdate) {
            emit(Phase::PreExecute);
            self.execute_file(action, &target, exec)?;
        }

        match action.operation() {
            FileOperation::Delete => {
                emit(Phase::Deleting);
                if fs::symlink_metadata(&target).is_ok() {
                    let backup = run.backup_dir.join(action.relative_path());
                    undo::move_to_backup(&target, &backup)?;
                    run.record(
                        index,
                        UndoRecord::Restore {
                            target: target.clone(),
                            backup,
                        },
                    );
                } else {
                    debug!(file = action.path(), "already absent");
                }
            }
            FileOperation::Copy {
                payload,
                target_checksum,
            } => {
                emit(Phase::Copying);
                let bytes = lookup(payloads, action, payload)?;
                let actual = checksum::checksum(bytes);
                if actual != *target_checksum {
                    return Err(UpdateError::TargetMismatch {
                        path: action.path().to_string(),
                        expected: *target_checksum,
                        actual,
                    });
                }
                self.replace(run, index, action, &target, bytes)?;
            }
            FileOperation::Patch {
                delta,
                source_checksum,
                target_checksum,
            } => {
                emit(Phase::Patching);
                let delta = lookup(payloads, action, delta)?;
                let source = target.exists().then_some(target.as_path());
                let bytes = apply_delta(source, delta, *source_checksum, *target_checksum)?;
                self.replace(run, index, action, &target, &bytes)?;
            }
        }

        if let Some(com) = action.com() {
            emit(Phase::Registering);
            self.register(run, index, &target, com)?;
        }

        if let Some(exec) = action.execution_at(ExecutionTiming::AfterUpdate) {
            emit(Phase::PostExecute);
            self.execute_file(action, &target, exec)?;
        }

        Ok(())
    }

    /// Write verified `bytes` over `target`, recording how to undo it.
    fn replace(
        &self,
        run: &mut RunState,
        index: usize,
        action: &UpdateFileAction,
        target: &Path,
        bytes: &[u8],
    ) -> Result<(), UpdateError> {
        // Writing through a link would leave a regular file that rollback cannot turn back.
        if fs::symlink_metadata(target).is_ok_and(|meta| meta.file_type().is_symlink()) {
            return Err(UpdateError::InvalidAction {
                path: action.path().to_string(),
                reason: "target is a symbolic link".to_string(),
            });
        }

        for dir in undo::create_parent_dirs(&self.config.root, target)? {
            run.record(index, UndoRecord::RemoveDir { dir });
        }

        let existed = target.exists();
        if existed {
            let backup = run.backup_dir.join(action.relative_path());
            undo::copy_to_backup(target, &backup)?;
            run.record(
                index,
                UndoRecord::Restore {
                    target: target.to_path_buf(),
                    backup,
                },
            );
        }

        undo::write_atomic(target, bytes, action.execution().is_some())?;

        if !existed {
            run.record(
                index,
                UndoRecord::RemoveCreated {
                    target: target.to_path_buf(),
                },
            );
        }
        debug!(file = action.path(), len = bytes.len(), "file written");
        Ok(())
    }

    fn register(
        &self,
        run: &mut RunState,
        index: usize,
        target: &Path,
        com: ComRegistration,
    ) -> Result<(), UpdateError> {
        let outcome = match com {
            ComRegistration::Register => self.registrar.register(target),
            ComRegistration::Unregister => self.registrar.unregister(target),
        }
        .map_err(|reason| UpdateError::Registration {
            path: target.display().to_string(),
            reason,
        })?;

        // Only undo what this run actually changed.
        let undo = match (com, outcome.previously_registered) {
            (ComRegistration::Register, false) => Some(ComRegistration::Unregister),
            (ComRegistration::Unregister, true) => Some(ComRegistration::Register),
            _ => None,
        };
        if let Some(undo) = undo {
            run.record(
                index,
                UndoRecord::RestoreRegistration {
                    target: target.to_path_buf(),
                    undo,
                },
            );
        }
        Ok(())
    }

    fn execute_file(
        &self,
        action: &UpdateFileAction,
        target: &Path,
        exec: &Execution,
    ) -> Result<(), UpdateError> {
        let request = LaunchRequest {
            program: target,
            arguments: &exec.arguments,
            elevation: exec.elevation,
            wait: exec.wait,
        };
        let exec_error = |failure: ExecutionFailure| UpdateError::ProcessExecution {
            path: action.path().to_string(),
            failure,
        };

        match self.launcher.launch(&request) {
            Ok(LaunchOutcome::Exited(code)) => {
                info!(file = action.path(), code, "process exited");
                if exec.triggers_rollback(code) {
                    return Err(exec_error(ExecutionFailure::ExitCode(code)));
                }
                Ok(())
            }
            Ok(LaunchOutcome::Detached) => {
                info!(file = action.path(), "process started");
                Ok(())
            }
            Err(reason) if exec.wait => Err(exec_error(ExecutionFailure::Launch(reason))),
            Err(reason) => {
                warn!(file = action.path(), %reason, "detached launch failed, continuing");
                Ok(())
            }
        }
    }

    fn roll_back<F>(
        &self,
        run: &mut RunState,
        actions: &[UpdateFileAction],
        on_progress: &mut F,
    ) -> Vec<UpdateError>
    where
        F: FnMut(&ProgressEvent),
    {
        let total = actions.len();
        let mut failures = Vec::new();
        let mut incomplete = HashSet::new();

        while let Some((index, record)) = run.undo.pop() {
            on_progress(&ProgressEvent {
                index,
                total,
                file: actions[index].path().to_string(),
                kind: actions[index].kind(),
                phase: record.phase(),
            });
            if let Err(err) = record.undo(&self.registrar) {
                error!(file = actions[index].path(), error = %err, "undo step failed");
                incomplete.insert(index);
                failures.push(err);
            }
        }

        for (index, report) in run.reports.iter_mut().enumerate() {
            if report.state != ActionState::Committed {
                continue;
            }
            if incomplete.contains(&index) {
                report.reason = Some("rollback incomplete".to_string());
            } else {
                report.state = ActionState::RolledBack;
            }
        }
        failures
    }

    fn prepare_backup_dir(&self, run: &mut RunState) -> Result<(), UpdateError> {
        if run.backup_dir.exists() {
            return Err(UpdateError::io(
                "refusing to reuse backup directory",
                &run.backup_dir,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "left by an earlier run; recover or remove it first",
                ),
            ));
        }
        fs::create_dir_all(&run.backup_dir)
            .map_err(|e| UpdateError::io("failed to create backup directory", &run.backup_dir, e))?;
        run.backup_dir_created = true;
        Ok(())
    }

    /// Remove the backup directory unless `keep`; returns it when it stays.
    fn discard_backups(&self, run: &RunState, keep: bool) -> Option<PathBuf> {
        if !run.backup_dir_created {
            return None;
        }
        if keep {
            return Some(run.backup_dir.clone());
        }
        match fs::remove_dir_all(&run.backup_dir) {
            Ok(()) => None,
            Err(e) => {
                warn!(dir = %run.backup_dir.display(), error = %e, "could not remove backups");
                Some(run.backup_dir.clone())
            }
        }
    }
}

fn lookup<'p, P>(
    payloads: &'p P,
    action: &UpdateFileAction,
    reference: &str,
) -> Result<&'p [u8], UpdateError>
where
    P: PayloadStore + ?Sized,
{
    payloads
        .payload(reference)
        .ok_or_else(|| UpdateError::MissingPayload {
            path: action.path().to_string(),
            reference: reference.to_string(),
        })
}
