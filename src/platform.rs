//! Narrow interfaces to the operating system: process launch and component
//! registration. The orchestrator only talks to these traits.

use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::action::Elevation;

#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub program: &'a Path,
    pub arguments: &'a [String],
    pub elevation: Elevation,
    pub wait: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Exited(i32),
    /// Started without waiting; the process is no longer tracked.
    Detached,
}

pub trait ProcessLauncher {
    /// Start `request.program`. An `Err` means it could not be started (or,
    /// when waiting, that it ended without an exit code).
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<LaunchOutcome, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationOutcome {
    pub previously_registered: bool,
}

pub trait ComRegistrar {
    fn register(&self, path: &Path) -> Result<RegistrationOutcome, String>;
    fn unregister(&self, path: &Path) -> Result<RegistrationOutcome, String>;
}

impl<T: ProcessLauncher + ?Sized> ProcessLauncher for &T {
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<LaunchOutcome, String> {
        (**self).launch(request)
    }
}

impl<T: ComRegistrar + ?Sized> ComRegistrar for &T {
    fn register(&self, path: &Path) -> Result<RegistrationOutcome, String> {
        (**self).register(path)
    }

    fn unregister(&self, path: &Path) -> Result<RegistrationOutcome, String> {
        (**self).unregister(path)
    }
}

/// Launches processes with `std::process::Command`.
///
/// Only inherited elevation can be expressed portably; forced elevation
/// changes are reported as launch failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<LaunchOutcome, String> {
        if request.elevation != Elevation::Inherit {
            return Err(format!(
                "{:?} launch is not available on this platform",
                request.elevation
            ));
        }

        let mut command = Command::new(request.program);
        command.args(request.arguments);
        debug!(program = %request.program.display(), wait = request.wait, "launching");

        if request.wait {
            let status = command.status().map_err(|e| e.to_string())?;
            status
                .code()
                .map(LaunchOutcome::Exited)
                .ok_or_else(|| format!("terminated without an exit code ({status})"))
        } else {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| e.to_string())?;
            Ok(LaunchOutcome::Detached)
        }
    }
}

/// Registrar for platforms without COM: every request fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedRegistrar;

impl ComRegistrar for UnsupportedRegistrar {
    fn register(&self, path: &Path) -> Result<RegistrationOutcome, String> {
        Err(format!(
            "cannot register {}: component registration is not supported here",
            path.display()
        ))
    }

    fn unregister(&self, path: &Path) -> Result<RegistrationOutcome, String> {
        Err(format!(
            "cannot unregister {}: component registration is not supported here",
            path.display()
        ))
    }
}
