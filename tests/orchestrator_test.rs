use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::{tempdir, TempDir};

use deltaup::action::{
    ActionSpec, Architecture, ComRegistration, Execution, UpdateFileAction,
};
use deltaup::checksum::checksum;
use deltaup::config::{UpdateConfig, BACKUP_DIR};
use deltaup::delta::{self, DiffOptions};
use deltaup::error::{ExecutionFailure, UpdateError};
use deltaup::orchestrator::{
    ActionState, CancelToken, Orchestrator, Phase, ProgressEvent, UpdateReport, UpdateState,
};
use deltaup::platform::{
    ComRegistrar, LaunchOutcome, LaunchRequest, ProcessLauncher, RegistrationOutcome,
};

type Journal = Arc<Mutex<Vec<String>>>;

fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

/// Records launches; exit codes and launch failures are keyed by file name.
#[derive(Default)]
struct StubLauncher {
    exit_codes: HashMap<String, i32>,
    unlaunchable: HashSet<String>,
    journal: Journal,
}

impl StubLauncher {
    fn exiting(mut self, name: &str, code: i32) -> Self {
        self.exit_codes.insert(name.to_string(), code);
        self
    }

    fn failing(mut self, name: &str) -> Self {
        self.unlaunchable.insert(name.to_string());
        self
    }
}

impl ProcessLauncher for StubLauncher {
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<LaunchOutcome, String> {
        let name = file_name(request.program);
        self.journal.lock().unwrap().push(format!("run {name}"));
        if self.unlaunchable.contains(&name) {
            return Err("program not found".to_string());
        }
        if !request.wait {
            return Ok(LaunchOutcome::Detached);
        }
        Ok(LaunchOutcome::Exited(
            self.exit_codes.get(&name).copied().unwrap_or(0),
        ))
    }
}

#[derive(Default)]
struct StubRegistrar {
    registered: Mutex<HashSet<String>>,
    fail_unregister: bool,
    journal: Journal,
}

impl StubRegistrar {
    fn with_registered(self, name: &str) -> Self {
        self.registered.lock().unwrap().insert(name.to_string());
        self
    }

    fn is_registered(&self, name: &str) -> bool {
        self.registered.lock().unwrap().contains(name)
    }
}

impl ComRegistrar for StubRegistrar {
    fn register(&self, path: &Path) -> Result<RegistrationOutcome, String> {
        let name = file_name(path);
        self.journal.lock().unwrap().push(format!("register {name}"));
        let previously_registered = !self.registered.lock().unwrap().insert(name);
        Ok(RegistrationOutcome {
            previously_registered,
        })
    }

    fn unregister(&self, path: &Path) -> Result<RegistrationOutcome, String> {
        let name = file_name(path);
        self.journal.lock().unwrap().push(format!("unregister {name}"));
        if self.fail_unregister {
            return Err("registry is locked".to_string());
        }
        let previously_registered = self.registered.lock().unwrap().remove(&name);
        Ok(RegistrationOutcome {
            previously_registered,
        })
    }
}

struct Fixture {
    dir: TempDir,
    payloads: BTreeMap<String, Vec<u8>>,
}

impl Fixture {
    fn new(files: &[(&str, &[u8])]) -> Self {
        let dir = tempdir().unwrap();
        for (rel, content) in files {
            let full = dir.path().join(rel);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        Self {
            dir,
            payloads: BTreeMap::new(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn read(&self, rel: &str) -> Vec<u8> {
        fs::read(self.path(rel)).unwrap()
    }

    /// Copy action whose payload is `content`.
    fn copy(&mut self, rel: &str, content: &[u8]) -> ActionSpec {
        let key = format!("files/{rel}");
        self.payloads.insert(key.clone(), content.to_vec());
        ActionSpec::copy(rel, key, checksum(content))
    }

    /// Copy action whose declared checksum does not match its payload.
    fn bad_copy(&mut self, rel: &str, content: &[u8]) -> ActionSpec {
        let key = format!("files/{rel}");
        self.payloads.insert(key.clone(), content.to_vec());
        ActionSpec::copy(rel, key, checksum(content).wrapping_add(1))
    }

    fn patch(&mut self, rel: &str, old: &[u8], new: &[u8]) -> ActionSpec {
        let key = format!("deltas/{rel}");
        self.payloads
            .insert(key.clone(), delta::encode(old, new, DiffOptions::default()));
        ActionSpec::patch(rel, key, checksum(old), checksum(new))
    }

    fn run<L: ProcessLauncher, R: ComRegistrar>(
        &self,
        config: UpdateConfig,
        launcher: L,
        registrar: R,
        actions: &[UpdateFileAction],
    ) -> (UpdateReport, Vec<ProgressEvent>) {
        let orchestrator = Orchestrator::new(config, launcher, registrar);
        let mut events = Vec::new();
        let report = orchestrator.run(actions, &self.payloads, |e| events.push(e.clone()));
        (report, events)
    }

    fn run_default(&self, actions: &[UpdateFileAction]) -> (UpdateReport, Vec<ProgressEvent>) {
        self.run(
            UpdateConfig::new(self.root()),
            StubLauncher::default(),
            StubRegistrar::default(),
            actions,
        )
    }
}

fn build(specs: Vec<ActionSpec>) -> Vec<UpdateFileAction> {
    specs.into_iter().map(|s| s.build().unwrap()).collect()
}

fn states(report: &UpdateReport) -> Vec<ActionState> {
    report.actions.iter().map(|a| a.state).collect()
}

#[test]
fn test_all_actions_commit() {
    let mut fx = Fixture::new(&[("app.cfg", b"mode=old"), ("bin/tool", b"tool v1 body")]);
    let actions = build(vec![
        fx.copy("app.cfg", b"mode=new"),
        fx.patch("bin/tool", b"tool v1 body", b"tool v2 body, longer"),
        fx.copy("docs/new.txt", b"fresh"),
    ]);

    let (report, events) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::Completed);
    assert!(report.error.is_none());
    assert_eq!(states(&report), vec![ActionState::Committed; 3]);
    assert_eq!(fx.read("app.cfg"), b"mode=new");
    assert_eq!(fx.read("bin/tool"), b"tool v2 body, longer");
    assert_eq!(fx.read("docs/new.txt"), b"fresh");
    assert!(!fx.path(BACKUP_DIR).exists());

    let committed: Vec<usize> = events
        .iter()
        .filter(|e| e.phase == Phase::Committed)
        .map(|e| e.index)
        .collect();
    assert_eq!(committed, vec![0, 1, 2]);
    assert!(events.iter().all(|e| e.total == 3));
}

#[test]
fn test_third_of_five_fails_restores_first_two() {
    let mut fx = Fixture::new(&[
        ("a.txt", b"old a"),
        ("b.txt", b"old b"),
        ("c.txt", b"old c"),
        ("d.txt", b"old d"),
        ("e.txt", b"old e"),
    ]);
    let actions = build(vec![
        fx.copy("a.txt", b"new a"),
        fx.copy("b.txt", b"new b"),
        fx.bad_copy("c.txt", b"new c"),
        fx.copy("d.txt", b"new d"),
        fx.copy("e.txt", b"new e"),
    ]);

    let (report, _) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(matches!(
        report.error,
        Some(UpdateError::TargetMismatch { ref path, .. }) if path == "c.txt"
    ));
    assert_eq!(
        states(&report),
        vec![
            ActionState::RolledBack,
            ActionState::RolledBack,
            ActionState::Failed,
            ActionState::Pending,
            ActionState::Pending,
        ]
    );
    assert!(report.actions[2].reason.is_some());
    for name in ["a", "b", "c", "d", "e"] {
        assert_eq!(fx.read(&format!("{name}.txt")), format!("old {name}").as_bytes());
    }
    assert!(!fx.path(BACKUP_DIR).exists());
    assert!(report.retained_backups.is_none());
}

#[test]
fn test_delete_rollback_restores_identical_bytes() {
    let original: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
    let mut fx = Fixture::new(&[("lib/engine.bin", &original)]);
    let actions = build(vec![
        ActionSpec::delete("lib/engine.bin"),
        fx.bad_copy("lib/replacement.bin", b"never lands"),
    ]);

    let (report, _) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::RolledBack);
    assert_eq!(fx.read("lib/engine.bin"), original);
    assert!(!fx.path("lib/replacement.bin").exists());
}

#[test]
fn test_delete_of_absent_file_commits() {
    let fx = Fixture::new(&[]);
    let actions = build(vec![ActionSpec::delete("not/there.txt")]);
    let (report, _) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::Completed);
}

#[test]
fn test_post_execute_rollback_code_reverses_in_order() {
    let mut fx = Fixture::new(&[("setup.exe", b"installer v1")]);
    let actions = build(vec![
        fx.copy("plugins/extra/lib.dll", b"plugin"),
        fx.copy("setup.exe", b"installer v2").with_execution(
            Execution::after_update()
                .with_arguments(["--migrate"])
                .waiting()
                .rollback_on([3]),
        ),
    ]);
    let launcher = StubLauncher::default().exiting("setup.exe", 3);
    let journal = launcher.journal.clone();

    let (report, events) = fx.run(
        UpdateConfig::new(fx.root()),
        launcher,
        StubRegistrar::default(),
        &actions,
    );

    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(matches!(
        report.error,
        Some(UpdateError::ProcessExecution {
            failure: ExecutionFailure::ExitCode(3),
            ..
        })
    ));
    assert_eq!(*journal.lock().unwrap(), vec!["run setup.exe".to_string()]);
    assert_eq!(fx.read("setup.exe"), b"installer v1");
    assert!(!fx.path("plugins").exists());

    // Undo runs newest first: action 1 before action 0.
    let undo_indices: Vec<usize> = events
        .iter()
        .filter(|e| matches!(e.phase, Phase::Restoring | Phase::Removing))
        .map(|e| e.index)
        .collect();
    assert_eq!(undo_indices.first(), Some(&1));
    assert!(undo_indices.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(undo_indices.last(), Some(&0));
}

#[test]
fn test_exit_code_outside_rollback_set_completes() {
    let mut fx = Fixture::new(&[("setup.exe", b"installer v1")]);
    let actions = build(vec![fx.copy("setup.exe", b"installer v2").with_execution(
        Execution::after_update().waiting().rollback_on([3]),
    )]);
    let launcher = StubLauncher::default().exiting("setup.exe", 1);

    let (report, _) = fx.run(
        UpdateConfig::new(fx.root()),
        launcher,
        StubRegistrar::default(),
        &actions,
    );
    assert_eq!(report.state, UpdateState::Completed);
    assert_eq!(fx.read("setup.exe"), b"installer v2");
}

#[test]
fn test_pre_execute_launch_failure_rolls_back() {
    let mut fx = Fixture::new(&[("first.txt", b"one"), ("tool.exe", b"tool v1")]);
    let actions = build(vec![
        fx.copy("first.txt", b"uno"),
        fx.copy("tool.exe", b"tool v2")
            .with_execution(Execution::before_update().waiting()),
    ]);
    let launcher = StubLauncher::default().failing("tool.exe");

    let (report, events) = fx.run(
        UpdateConfig::new(fx.root()),
        launcher,
        StubRegistrar::default(),
        &actions,
    );
    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(matches!(
        report.error,
        Some(UpdateError::ProcessExecution {
            failure: ExecutionFailure::Launch(_),
            ..
        })
    ));
    assert_eq!(fx.read("first.txt"), b"one");
    assert_eq!(fx.read("tool.exe"), b"tool v1");
    assert!(!events
        .iter()
        .any(|e| e.index == 1 && e.phase == Phase::Copying));
}

#[test]
fn test_detached_launch_failure_is_not_fatal() {
    let mut fx = Fixture::new(&[("tool.exe", b"tool v1")]);
    let actions = build(vec![fx
        .copy("tool.exe", b"tool v2")
        .with_execution(Execution::before_update())]);
    let launcher = StubLauncher::default().failing("tool.exe");

    let (report, _) = fx.run(
        UpdateConfig::new(fx.root()),
        launcher,
        StubRegistrar::default(),
        &actions,
    );
    assert_eq!(report.state, UpdateState::Completed);
    assert_eq!(fx.read("tool.exe"), b"tool v2");
}

#[test]
fn test_registration_is_undone_on_rollback() {
    let mut fx = Fixture::new(&[]);
    let actions = build(vec![
        fx.copy("comp.dll", b"component").with_com(ComRegistration::Register),
        fx.bad_copy("other.dll", b"broken"),
    ]);
    let registrar = StubRegistrar::default();
    let journal = registrar.journal.clone();

    let (report, events) = fx.run(
        UpdateConfig::new(fx.root()),
        StubLauncher::default(),
        &registrar,
        &actions,
    );
    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(!registrar.is_registered("comp.dll"));
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["register comp.dll".to_string(), "unregister comp.dll".to_string()]
    );
    assert!(events
        .iter()
        .any(|e| e.phase == Phase::RestoringRegistration));
    assert!(!fx.path("comp.dll").exists());
}

#[test]
fn test_prior_registration_is_left_alone() {
    let mut fx = Fixture::new(&[("comp.dll", b"component v1")]);
    let actions = build(vec![
        fx.copy("comp.dll", b"component v2").with_com(ComRegistration::Register),
        fx.bad_copy("other.dll", b"broken"),
    ]);
    let registrar = StubRegistrar::default().with_registered("comp.dll");
    let journal = registrar.journal.clone();

    let (report, _) = fx.run(
        UpdateConfig::new(fx.root()),
        StubLauncher::default(),
        &registrar,
        &actions,
    );
    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(registrar.is_registered("comp.dll"));
    assert_eq!(*journal.lock().unwrap(), vec!["register comp.dll".to_string()]);
    assert_eq!(fx.read("comp.dll"), b"component v1");
}

#[test]
fn test_architecture_mismatch_is_skipped() {
    let mut fx = Fixture::new(&[]);
    let actions = build(vec![
        fx.copy("x86/native.dll", b"32-bit build")
            .for_architecture(Architecture::Bits32),
        fx.copy("x64/native.dll", b"64-bit build")
            .for_architecture(Architecture::Bits64),
    ]);

    let (report, events) = fx.run(
        UpdateConfig::new(fx.root()).with_host(Architecture::Bits64),
        StubLauncher::default(),
        StubRegistrar::default(),
        &actions,
    );
    assert_eq!(report.state, UpdateState::Completed);
    assert_eq!(
        states(&report),
        vec![ActionState::Skipped, ActionState::Committed]
    );
    assert!(!fx.path("x86").exists());
    assert_eq!(fx.read("x64/native.dll"), b"64-bit build");
    assert!(events
        .iter()
        .any(|e| e.index == 0 && e.phase == Phase::Skipping));
}

#[test]
fn test_cancellation_between_actions_rolls_back() {
    let mut fx = Fixture::new(&[("a.txt", b"old a"), ("b.txt", b"old b")]);
    let actions = build(vec![fx.copy("a.txt", b"new a"), fx.copy("b.txt", b"new b")]);

    let token = CancelToken::new();
    let orchestrator = Orchestrator::new(
        UpdateConfig::new(fx.root()),
        StubLauncher::default(),
        StubRegistrar::default(),
    )
    .with_cancel_token(token.clone());

    let report = orchestrator.run(&actions, &fx.payloads, |event| {
        if event.index == 0 && event.phase == Phase::Committed {
            token.cancel();
        }
    });

    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(matches!(report.error, Some(UpdateError::Cancelled)));
    assert_eq!(
        states(&report),
        vec![ActionState::RolledBack, ActionState::Pending]
    );
    assert_eq!(fx.read("a.txt"), b"old a");
    assert_eq!(fx.read("b.txt"), b"old b");
}

#[test]
fn test_failed_undo_reports_rollback_failure_and_keeps_backups() {
    let mut fx = Fixture::new(&[("comp.dll", b"component v1")]);
    let actions = build(vec![
        fx.copy("comp.dll", b"component v2").with_com(ComRegistration::Register),
        fx.bad_copy("other.dll", b"broken"),
    ]);
    let registrar = StubRegistrar {
        fail_unregister: true,
        ..StubRegistrar::default()
    };

    let (report, _) = fx.run(
        UpdateConfig::new(fx.root()),
        StubLauncher::default(),
        &registrar,
        &actions,
    );

    assert_eq!(report.state, UpdateState::RollbackFailed);
    match &report.error {
        Some(UpdateError::RollbackFailure { original, failures }) => {
            assert!(matches!(**original, UpdateError::TargetMismatch { .. }));
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0], UpdateError::Registration { .. }));
        }
        other => panic!("expected rollback failure, got {other:?}"),
    }
    // The remaining undo steps still ran.
    assert_eq!(fx.read("comp.dll"), b"component v1");
    assert_eq!(report.actions[0].state, ActionState::Committed);
    assert_eq!(
        report.actions[0].reason.as_deref(),
        Some("rollback incomplete")
    );
    let kept = report.retained_backups.clone().unwrap();
    assert_eq!(kept, fx.path(BACKUP_DIR));
    assert!(kept.exists());
}

#[test]
fn test_stale_backup_dir_aborts_before_changes() {
    let mut fx = Fixture::new(&[("a.txt", b"old a"), (".update-backup/a.txt", b"recovery")]);
    let actions = build(vec![fx.copy("a.txt", b"new a")]);

    let (report, _) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(matches!(report.error, Some(UpdateError::Io { .. })));
    assert_eq!(states(&report), vec![ActionState::Pending]);
    assert_eq!(fx.read("a.txt"), b"old a");
    assert_eq!(fx.read(".update-backup/a.txt"), b"recovery");
}

#[test]
fn test_custom_backup_dir_and_keep_backups() {
    let mut fx = Fixture::new(&[("a.txt", b"old a")]);
    let backups = tempdir().unwrap();
    let backup_dir = backups.path().join("bk");
    let actions = build(vec![fx.copy("a.txt", b"new a")]);

    let (report, _) = fx.run(
        UpdateConfig::new(fx.root())
            .with_backup_dir(&backup_dir)
            .keep_backups(true),
        StubLauncher::default(),
        StubRegistrar::default(),
        &actions,
    );
    assert_eq!(report.state, UpdateState::Completed);
    assert_eq!(report.retained_backups.as_deref(), Some(backup_dir.as_path()));
    assert_eq!(fs::read(backup_dir.join("a.txt")).unwrap(), b"old a");
    assert!(!fx.path(BACKUP_DIR).exists());
}

#[test]
fn test_patch_against_tampered_file_is_source_mismatch() {
    let mut fx = Fixture::new(&[("data.bin", b"locally edited")]);
    let actions = build(vec![fx.patch("data.bin", b"shipped content", b"new content")]);

    let (report, _) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(matches!(
        report.error,
        Some(UpdateError::SourceMismatch { .. })
    ));
    assert_eq!(fx.read("data.bin"), b"locally edited");
}

#[test]
fn test_patch_without_source_creates_file() {
    let mut fx = Fixture::new(&[]);
    let actions = build(vec![fx.patch("gen/table.dat", b"", &[9u8; 500])]);

    let (report, _) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::Completed);
    assert_eq!(fx.read("gen/table.dat"), vec![9u8; 500]);
}

#[test]
fn test_corrupt_delta_rolls_back() {
    let mut fx = Fixture::new(&[("a.txt", b"old a"), ("b.bin", b"base")]);
    fx.payloads
        .insert("deltas/b.bin".to_string(), b"UDLT\x01\x05".to_vec());
    let actions = build(vec![
        fx.copy("a.txt", b"new a"),
        ActionSpec::patch("b.bin", "deltas/b.bin", checksum(b"base"), 0),
    ]);

    let (report, _) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(report.error.as_ref().is_some_and(UpdateError::is_delta));
    assert_eq!(fx.read("a.txt"), b"old a");
}

#[test]
fn test_missing_payload() {
    let fx = Fixture::new(&[]);
    let actions = build(vec![ActionSpec::copy("a.txt", "files/a.txt", 1)]);
    let (report, _) = fx.run_default(&actions);
    assert!(matches!(
        report.error,
        Some(UpdateError::MissingPayload { .. })
    ));
}

#[test]
fn test_duplicate_paths_rejected_before_changes() {
    let mut fx = Fixture::new(&[("App.cfg", b"v1")]);
    let actions = build(vec![fx.copy("App.cfg", b"v2"), ActionSpec::delete("app.CFG")]);

    let (report, events) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(matches!(
        report.error,
        Some(UpdateError::InvalidAction { .. })
    ));
    assert!(events.is_empty());
    assert_eq!(fx.read("App.cfg"), b"v1");
}

#[test]
fn test_action_inside_backup_dir_rejected() {
    let mut fx = Fixture::new(&[]);
    let actions = build(vec![
        fx.copy("app.cfg", b"settings"),
        fx.copy(".update-backup/cfg.txt", b"lost on cleanup"),
    ]);

    let (report, events) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(matches!(
        report.error,
        Some(UpdateError::InvalidAction { ref path, .. }) if path == ".update-backup/cfg.txt"
    ));
    assert!(events.is_empty());
    assert!(!fx.path("app.cfg").exists());
    assert!(!fx.path(BACKUP_DIR).exists());
}

#[test]
fn test_action_inside_custom_backup_dir_rejected() {
    let mut fx = Fixture::new(&[]);
    let actions = build(vec![fx.copy("state/bk/x.txt", b"x")]);

    let (report, _) = fx.run(
        UpdateConfig::new(fx.root()).with_backup_dir(fx.path("state/bk")),
        StubLauncher::default(),
        StubRegistrar::default(),
        &actions,
    );
    assert!(matches!(
        report.error,
        Some(UpdateError::InvalidAction { .. })
    ));
    assert!(!fx.path("state/bk/x.txt").exists());
}

#[cfg(unix)]
#[test]
fn test_symlink_target_is_refused_and_kept() {
    let mut fx = Fixture::new(&[("real.cfg", b"real"), ("other.txt", b"old other")]);
    std::os::unix::fs::symlink(fx.path("real.cfg"), fx.path("link.cfg")).unwrap();
    let actions = build(vec![
        fx.copy("other.txt", b"new other"),
        fx.copy("link.cfg", b"replacement"),
    ]);

    let (report, _) = fx.run_default(&actions);
    assert_eq!(report.state, UpdateState::RolledBack);
    assert!(matches!(
        report.error,
        Some(UpdateError::InvalidAction { ref path, .. }) if path == "link.cfg"
    ));
    let meta = fs::symlink_metadata(fx.path("link.cfg")).unwrap();
    assert!(meta.file_type().is_symlink());
    assert_eq!(fx.read("real.cfg"), b"real");
    assert_eq!(fx.read("other.txt"), b"old other");
}
