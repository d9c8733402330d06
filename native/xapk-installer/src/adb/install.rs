//! Adaptive install: pre-flight gates, then a bounded fallback state machine over install flags,
//! the multi-file session primitive and a data-preserving uninstall/reinstall.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use tracing::{debug, info, instrument, warn};

use super::{AdbDevice, BackupRecord, CommandOutput, DeviceProfile, InstallFlags, InstalledPackage};
use crate::{
    adb::profile::normalized_abi,
    confirm::Confirm,
    error::InstallError,
    manifest::PackageManifest,
};

/// ABI whose replacement by a 32-bit only build is confirmed with the operator.
const ARM64_ABI: &str = "arm64-v8a";

/// Failure class recognized in installer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureSignal {
    /// The bridge build does not understand one of the flags.
    ArgumentExpected,
    TestOnly,
    VersionDowngrade,
    /// The user has to approve the install on the device.
    UserRestricted,
    AlreadyExists,
    Other,
}

impl FailureSignal {
    pub fn classify(output: &str) -> Self {
        if output.contains("INSTALL_FAILED_TEST_ONLY") {
            FailureSignal::TestOnly
        } else if output.contains("INSTALL_FAILED_VERSION_DOWNGRADE") {
            FailureSignal::VersionDowngrade
        } else if output.contains("INSTALL_FAILED_USER_RESTRICTED") {
            FailureSignal::UserRestricted
        } else if output.contains("INSTALL_FAILED_ALREADY_EXISTS") {
            FailureSignal::AlreadyExists
        } else if output.contains("argument expected") {
            FailureSignal::ArgumentExpected
        } else {
            FailureSignal::Other
        }
    }

    /// Signals that end the attempt immediately, whatever state the engine is in.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FailureSignal::VersionDowngrade
                | FailureSignal::UserRestricted
                | FailureSignal::AlreadyExists
        )
    }
}

impl fmt::Display for FailureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureSignal::ArgumentExpected => "argument expected",
            FailureSignal::TestOnly => "INSTALL_FAILED_TEST_ONLY",
            FailureSignal::VersionDowngrade => "INSTALL_FAILED_VERSION_DOWNGRADE",
            FailureSignal::UserRestricted => "INSTALL_FAILED_USER_RESTRICTED",
            FailureSignal::AlreadyExists => "INSTALL_FAILED_ALREADY_EXISTS",
            FailureSignal::Other => "install failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallAttemptResult {
    pub succeeded: bool,
    pub signal: Option<FailureSignal>,
    pub raw_message: String,
}

impl InstallAttemptResult {
    /// Older bridge builds exit 0 on failure, so the `Failure` marker is checked as well.
    pub fn from_output(output: &CommandOutput) -> Self {
        let succeeded = output.success() && !output.output.contains("Failure");
        Self {
            succeeded,
            signal: (!succeeded).then(|| FailureSignal::classify(&output.output)),
            raw_message: output.output.trim().to_string(),
        }
    }
}

/// Install primitive used by one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// `install` / `install-multiple` with the given flags.
    Bulk(InstallFlags),
    /// create, write, commit.
    Session,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Bulk(flags) => write!(f, "install {flags}"),
            Step::Session => f.write_str("session install"),
        }
    }
}

impl Step {
    fn allows_test(&self) -> bool {
        matches!(self, Step::Bulk(flags) if flags.allow_test)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineState {
    pub step: Step,
    pub multi_file: bool,
    /// An older copy of the package is on the device.
    pub installed: bool,
    pub test_retry_used: bool,
    pub reinstalled: bool,
}

impl EngineState {
    pub fn new(flags: InstallFlags, multi_file: bool, installed: bool) -> Self {
        Self { step: Step::Bulk(flags), multi_file, installed, test_retry_used: false, reinstalled: false }
    }

    /// Moves on to `step`, remembering when it is the `-t` retry of a test-only failure.
    pub fn retry(&mut self, signal: FailureSignal, step: Step) {
        if signal == FailureSignal::TestOnly && !self.step.allows_test() {
            self.test_retry_used = true;
        }
        self.step = step;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Retry(Step),
    /// Back up, uninstall keeping data, then retry without flags.
    Reinstall,
    Terminal,
}

/// Next move after a failed attempt.
///
/// Every path visits each step at most once: aggressive flags, replace only, (reinstall with no
/// flags), session, terminal. A test-only failure on flags without `-t` is retried once with it
/// and nothing is retried after that; flags that already carry `-t` relax like any failure.
pub fn transition(state: &EngineState, signal: FailureSignal) -> Transition {
    if signal.is_terminal() || state.test_retry_used {
        return Transition::Terminal;
    }
    if signal == FailureSignal::TestOnly
        && let Step::Bulk(flags) = state.step
        && !flags.allow_test
    {
        return Transition::Retry(Step::Bulk(flags.with_test()));
    }
    match state.step {
        Step::Bulk(flags) if flags == InstallFlags::AGGRESSIVE => {
            Transition::Retry(Step::Bulk(InstallFlags::REPLACE_ONLY))
        }
        Step::Bulk(_) if state.installed && !state.reinstalled => Transition::Reinstall,
        Step::Bulk(_) if state.multi_file => Transition::Retry(Step::Session),
        Step::Bulk(_) | Step::Session => Transition::Terminal,
    }
}

/// Installs one package on one device.
pub struct InstallEngine<'a> {
    device: &'a AdbDevice,
    profile: &'a DeviceProfile,
    confirm: &'a dyn Confirm,
    /// Parent of backup directories.
    work_root: &'a Path,
    /// Skip the minimum SDK gate.
    pub ignore_sdk: bool,
}

impl<'a> InstallEngine<'a> {
    pub fn new(
        device: &'a AdbDevice,
        profile: &'a DeviceProfile,
        confirm: &'a dyn Confirm,
        work_root: &'a Path,
    ) -> Self {
        Self { device, profile, confirm, work_root, ignore_sdk: false }
    }

    /// Checks run once before any install call: SDK level, ABI compatibility and the installed
    /// version. Returns the installed copy, if any.
    #[instrument(level = "debug", skip_all, fields(package = %manifest.package_name, serial = %self.device.serial()), err)]
    pub async fn preflight(&self, manifest: &PackageManifest) -> Result<Option<InstalledPackage>, InstallError> {
        let sdk = self.profile.sdk;
        if sdk < manifest.min_sdk {
            if !self.ignore_sdk {
                return Err(InstallError::SdkTooLow { required: manifest.min_sdk, actual: sdk });
            }
            warn!(required = manifest.min_sdk, actual = sdk, "Ignoring minimum SDK requirement");
        }
        match manifest.target_sdk {
            Some(target) if target < sdk => warn!(
                target,
                device = sdk,
                "Package targets an older Android version, there may be compatibility issues"
            ),
            Some(_) => {}
            None => warn!("Package does not declare targetSdkVersion"),
        }

        if !manifest.native_abis.is_empty() {
            let declared: Vec<String> = manifest.native_abis.iter().map(|a| normalized_abi(a)).collect();
            if !declared.iter().any(|abi| self.profile.abi_list.contains(abi)) {
                return Err(InstallError::AbiMismatch {
                    declared: manifest.native_abis.iter().cloned().collect(),
                    supported: self.profile.abi_list.clone(),
                });
            }
        }

        let installed = self
            .device
            .installed_package(&manifest.package_name)
            .await
            .map_err(|e| InstallError::Bridge(e.into()))?;
        let Some(current) = &installed else {
            info!("Package is not installed yet. The first install may need confirmation on the device");
            return Ok(None);
        };

        if current.version_code > manifest.version_code {
            self.gate(format!(
                "Installed version {} is newer than {}. Downgrade {}?",
                current.version_code, manifest.version_code, manifest.package_name
            )).await?;
        } else if current.version_code == manifest.version_code {
            self.gate(format!(
                "Version {} of {} is already installed. Reinstall it?",
                current.version_code, manifest.package_name
            )).await?;
        }

        if current.primary_abi.as_deref() == Some(ARM64_ABI)
            && !manifest.native_abis.is_empty()
            && !manifest.native_abis.contains(ARM64_ABI)
        {
            self.gate(format!(
                "The installed {} is 64-bit, this package is 32-bit only. Continue?",
                manifest.package_name
            )).await?;
        }
        Ok(installed)
    }

    async fn gate(&self, prompt: String) -> Result<(), InstallError> {
        if self.confirm.confirm(&prompt).await { Ok(()) } else { Err(InstallError::Cancelled(prompt)) }
    }

    /// Runs pre-flight, then the fallback state machine starting at `flags`.
    #[instrument(level = "debug", skip_all, fields(package = %manifest.package_name, serial = %self.device.serial(), files = files.len()), err)]
    pub async fn install(
        &self,
        manifest: &PackageManifest,
        files: &[PathBuf],
        flags: InstallFlags,
    ) -> Result<Step, InstallError> {
        let installed = self.preflight(manifest).await?;
        self.execute(manifest, files, flags, installed.is_some()).await
    }

    /// The fallback state machine alone. Returns the step that succeeded.
    pub async fn execute(
        &self,
        manifest: &PackageManifest,
        files: &[PathBuf],
        flags: InstallFlags,
        installed: bool,
    ) -> Result<Step, InstallError> {
        let mut state = EngineState::new(flags, files.len() > 1, installed);
        let mut backup: Option<BackupRecord> = None;

        loop {
            debug!(step = %state.step, "Install attempt");
            let output = match self.attempt(state.step, files).await {
                Ok(output) => output,
                Err(e) => {
                    if let Some(record) = &backup {
                        self.device.restore(record).await?;
                    }
                    return Err(InstallError::Bridge(e.into()));
                }
            };
            let result = InstallAttemptResult::from_output(&output);
            let Some(signal) = result.signal else {
                info!(step = %state.step, "Install succeeded");
                if let Some(record) = backup {
                    record.discard().await;
                }
                return Ok(state.step);
            };
            warn!(step = %state.step, %signal, output = %result.raw_message, "Install attempt failed");

            match transition(&state, signal) {
                Transition::Retry(step) => {
                    info!(from = %state.step, to = %step, "Retrying");
                    state.retry(signal, step);
                }
                Transition::Reinstall => {
                    self.gate(format!(
                        "Install over the existing {} keeps failing. Back it up, uninstall it \
                         (keeping data) and install again?",
                        manifest.package_name
                    )).await?;
                    let record = self.device.uninstall_with_backup(&manifest.package_name, self.work_root).await?;
                    backup = Some(record);
                    state.reinstalled = true;
                    state.step = Step::Bulk(InstallFlags::NONE);
                }
                Transition::Terminal => {
                    let error = InstallError::Failed { signal, message: result.raw_message };
                    if let Some(record) = &backup {
                        warn!("Reinstall failed, restoring the previous installation");
                        self.device.restore(record).await?;
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn attempt(&self, step: Step, files: &[PathBuf]) -> anyhow::Result<CommandOutput> {
        match step {
            Step::Bulk(flags) => self.device.install_files(flags, files).await,
            Step::Session => self.device.session_install(files).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use test_log::test;

    use super::*;
    use crate::{
        adb::{
            AdbCommand, PackageName,
            testing::{FakeDevice, ScriptedBridge, is_install},
        },
        confirm::testing::Recorded,
    };

    fn manifest(min_sdk: u32, version_code: i64, abis: &[&str]) -> PackageManifest {
        PackageManifest {
            package_name: PackageName::parse("com.example.app").unwrap(),
            version_code,
            min_sdk,
            target_sdk: Some(33),
            native_abis: abis.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    fn failure(text: &str) -> CommandOutput {
        CommandOutput::new(1, format!("Performing Streamed Install\nadb: failed to install x.apk: Failure [{text}]"))
    }

    async fn setup(fake: FakeDevice, results: Vec<CommandOutput>) -> (AdbDevice, std::sync::Arc<ScriptedBridge>, DeviceProfile) {
        let (device, bridge) = ScriptedBridge::new(fake).install_results(results).into_device();
        let profile = DeviceProfile::probe(&device).await.unwrap();
        (device, bridge, profile)
    }

    #[test]
    fn classify_recognizes_known_signatures() {
        assert_eq!(FailureSignal::classify("Failure [INSTALL_FAILED_TEST_ONLY: ...]"), FailureSignal::TestOnly);
        assert_eq!(
            FailureSignal::classify("Failure [INSTALL_FAILED_VERSION_DOWNGRADE]"),
            FailureSignal::VersionDowngrade
        );
        assert_eq!(
            FailureSignal::classify("Failure [INSTALL_FAILED_USER_RESTRICTED: Install canceled by user]"),
            FailureSignal::UserRestricted
        );
        assert_eq!(
            FailureSignal::classify("Failure [INSTALL_FAILED_ALREADY_EXISTS]"),
            FailureSignal::AlreadyExists
        );
        assert_eq!(FailureSignal::classify("Error: argument expected"), FailureSignal::ArgumentExpected);
        assert_eq!(FailureSignal::classify("Failure [INSTALL_FAILED_INVALID_APK]"), FailureSignal::Other);
    }

    #[test]
    fn failure_marker_with_zero_status_is_a_failure() {
        let result = InstallAttemptResult::from_output(&CommandOutput::ok("Failure [INSTALL_FAILED_TEST_ONLY]"));
        assert!(!result.succeeded);
        assert_eq!(result.signal, Some(FailureSignal::TestOnly));
        assert!(InstallAttemptResult::from_output(&CommandOutput::ok("Success")).succeeded);
    }

    #[test]
    fn terminal_signals_stop_in_every_state() {
        for signal in [FailureSignal::VersionDowngrade, FailureSignal::UserRestricted, FailureSignal::AlreadyExists] {
            for step in [Step::Bulk(InstallFlags::AGGRESSIVE), Step::Bulk(InstallFlags::REPLACE_ONLY), Step::Session] {
                let state = EngineState { step, multi_file: true, installed: true, test_retry_used: false, reinstalled: false };
                assert_eq!(transition(&state, signal), Transition::Terminal, "{signal} at {step}");
            }
        }
    }

    #[test]
    fn flags_relax_from_aggressive_to_replace_only() {
        let state = EngineState::new(InstallFlags::AGGRESSIVE, false, false);
        let expected = Transition::Retry(Step::Bulk(InstallFlags::REPLACE_ONLY));
        assert_eq!(transition(&state, FailureSignal::ArgumentExpected), expected);
        assert_eq!(transition(&state, FailureSignal::Other), expected);
    }

    #[test]
    fn replace_only_failure_depends_on_installed_and_file_count() {
        let state = |multi_file, installed| EngineState::new(InstallFlags::REPLACE_ONLY, multi_file, installed);
        assert_eq!(transition(&state(false, true), FailureSignal::Other), Transition::Reinstall);
        assert_eq!(transition(&state(true, true), FailureSignal::Other), Transition::Reinstall);
        assert_eq!(transition(&state(true, false), FailureSignal::Other), Transition::Retry(Step::Session));
        assert_eq!(transition(&state(false, false), FailureSignal::Other), Transition::Terminal);

        let reinstalled = EngineState {
            step: Step::Bulk(InstallFlags::NONE),
            reinstalled: true,
            ..EngineState::new(InstallFlags::NONE, true, true)
        };
        assert_eq!(transition(&reinstalled, FailureSignal::Other), Transition::Retry(Step::Session));
    }

    #[test]
    fn test_only_is_retried_once() {
        let mut state = EngineState::new(InstallFlags::REPLACE_ONLY, true, true);
        assert_eq!(
            transition(&state, FailureSignal::TestOnly),
            Transition::Retry(Step::Bulk(InstallFlags::REPLACE_ONLY.with_test()))
        );
        state.test_retry_used = true;
        assert_eq!(transition(&state, FailureSignal::TestOnly), Transition::Terminal);
        assert_eq!(transition(&state, FailureSignal::Other), Transition::Terminal);
    }

    #[test]
    fn test_only_with_test_flag_already_set_relaxes_flags() {
        let state = EngineState::new(InstallFlags::AGGRESSIVE, true, true);
        assert_eq!(
            transition(&state, FailureSignal::TestOnly),
            Transition::Retry(Step::Bulk(InstallFlags::REPLACE_ONLY))
        );

        let mut state = state;
        state.retry(FailureSignal::TestOnly, Step::Bulk(InstallFlags::REPLACE_ONLY));
        assert!(!state.test_retry_used);
    }

    #[test]
    fn state_machine_always_terminates_without_repeating_a_step() {
        for multi_file in [false, true] {
            for installed in [false, true] {
                for signal in [FailureSignal::Other, FailureSignal::ArgumentExpected, FailureSignal::TestOnly] {
                    let mut state = EngineState::new(InstallFlags::AGGRESSIVE, multi_file, installed);
                    let mut visited = vec![state.step];
                    loop {
                        match transition(&state, signal) {
                            Transition::Retry(step) => state.retry(signal, step),
                            Transition::Reinstall => {
                                state.reinstalled = true;
                                state.step = Step::Bulk(InstallFlags::NONE);
                            }
                            Transition::Terminal => break,
                        }
                        assert!(visited.len() < 5, "too many attempts: {visited:?}");
                        visited.push(state.step);
                    }
                    let distinct: BTreeSet<String> = visited.iter().map(|s| s.to_string()).collect();
                    assert_eq!(distinct.len(), visited.len(), "{visited:?}");
                }
            }
        }
    }

    #[test(tokio::test)]
    async fn sdk_too_low_fails_before_any_install_call() {
        let (device, bridge, profile) =
            setup(FakeDevice { sdk: "28".into(), ..Default::default() }, vec![]).await;
        let confirm = Recorded::answering(true);
        let engine = InstallEngine::new(&device, &profile, &confirm, Path::new("/nonexistent"));
        let err = engine
            .install(&manifest(31, 1, &[]), &[PathBuf::from("base.apk")], InstallFlags::AGGRESSIVE)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::SdkTooLow { required: 31, actual: 28 }));
        assert_eq!(bridge.count(is_install), 0);
        assert_eq!(bridge.count(|c| matches!(c, AdbCommand::PackageDump(_))), 0);
    }

    #[test(tokio::test)]
    async fn ignore_sdk_skips_the_gate() {
        let (device, bridge, profile) =
            setup(FakeDevice { sdk: "28".into(), ..Default::default() }, vec![]).await;
        let confirm = Recorded::answering(true);
        let mut engine = InstallEngine::new(&device, &profile, &confirm, Path::new("/nonexistent"));
        engine.ignore_sdk = true;
        engine
            .install(&manifest(31, 1, &[]), &[PathBuf::from("base.apk")], InstallFlags::AGGRESSIVE)
            .await
            .unwrap();
        assert_eq!(bridge.count(is_install), 1);
    }

    #[test(tokio::test)]
    async fn abi_mismatch_is_rejected() {
        let (device, bridge, profile) = setup(FakeDevice::default(), vec![]).await;
        let confirm = Recorded::answering(true);
        let engine = InstallEngine::new(&device, &profile, &confirm, Path::new("/nonexistent"));
        let err = engine
            .install(&manifest(21, 1, &["x86", "x86_64"]), &[PathBuf::from("base.apk")], InstallFlags::AGGRESSIVE)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::AbiMismatch { .. }));
        assert_eq!(bridge.count(is_install), 0);
    }

    #[test(tokio::test)]
    async fn declined_downgrade_cancels_before_install() {
        let fake = FakeDevice { installed: Some((200, "arm64-v8a".into())), ..Default::default() };
        let (device, bridge, profile) = setup(fake, vec![]).await;
        let confirm = Recorded::answering(false);
        let engine = InstallEngine::new(&device, &profile, &confirm, Path::new("/nonexistent"));
        let err = engine
            .install(&manifest(21, 100, &[]), &[PathBuf::from("base.apk")], InstallFlags::AGGRESSIVE)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Cancelled(_)));
        assert!(confirm.prompts()[0].contains("Downgrade"));
        assert_eq!(bridge.count(is_install), 0);
    }

    #[test(tokio::test)]
    async fn same_version_and_32_bit_switch_are_confirmed() {
        let fake = FakeDevice { installed: Some((100, "arm64-v8a".into())), ..Default::default() };
        let (device, _, profile) = setup(fake, vec![]).await;
        let confirm = Recorded::answering(true);
        let engine = InstallEngine::new(&device, &profile, &confirm, Path::new("/nonexistent"));
        engine
            .install(&manifest(21, 100, &["armeabi-v7a"]), &[PathBuf::from("base.apk")], InstallFlags::AGGRESSIVE)
            .await
            .unwrap();
        let prompts = confirm.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("already installed"));
        assert!(prompts[1].contains("32-bit"));
    }

    #[test(tokio::test)]
    async fn test_only_failure_retries_once_and_reports_second_failure() {
        let results = vec![failure("INSTALL_FAILED_TEST_ONLY"), failure("INSTALL_FAILED_INVALID_APK")];
        let (device, bridge, profile) = setup(FakeDevice::default(), results).await;
        let confirm = Recorded::answering(true);
        let engine = InstallEngine::new(&device, &profile, &confirm, Path::new("/nonexistent"));
        let files = [PathBuf::from("base.apk"), PathBuf::from("config.en.apk")];
        let err = engine.install(&manifest(21, 1, &[]), &files, InstallFlags::REPLACE_ONLY).await.unwrap_err();

        assert_eq!(err.signal(), Some(FailureSignal::Other));
        assert!(err.to_string().contains("INSTALL_FAILED_INVALID_APK"));
        let installs: Vec<_> = bridge.commands().into_iter().filter(is_install).collect();
        assert_eq!(installs.len(), 2);
        assert!(matches!(
            &installs[1],
            AdbCommand::InstallMultiple { flags, .. } if flags.allow_test
        ));
        assert_eq!(bridge.count(|c| matches!(c, AdbCommand::CreateSession)), 0);
    }

    #[test(tokio::test)]
    async fn test_only_on_aggressive_flags_drops_to_replace_only() {
        let results = vec![
            failure("INSTALL_FAILED_TEST_ONLY"),
            failure("INSTALL_FAILED_TEST_ONLY"),
            failure("INSTALL_FAILED_INVALID_APK"),
        ];
        let (device, bridge, profile) = setup(FakeDevice::default(), results).await;
        let confirm = Recorded::answering(true);
        let engine = InstallEngine::new(&device, &profile, &confirm, Path::new("/nonexistent"));
        let files = [PathBuf::from("base.apk"), PathBuf::from("config.en.apk")];
        let err = engine.install(&manifest(21, 1, &[]), &files, InstallFlags::AGGRESSIVE).await.unwrap_err();

        assert!(err.to_string().contains("INSTALL_FAILED_INVALID_APK"));
        let flags: Vec<InstallFlags> = bridge
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                AdbCommand::InstallMultiple { flags, .. } => Some(flags),
                _ => None,
            })
            .collect();
        assert_eq!(
            flags,
            vec![InstallFlags::AGGRESSIVE, InstallFlags::REPLACE_ONLY, InstallFlags::REPLACE_ONLY.with_test()]
        );
    }

    #[test(tokio::test)]
    async fn terminal_signal_issues_no_further_calls() {
        let (device, bridge, profile) =
            setup(FakeDevice::default(), vec![failure("INSTALL_FAILED_USER_RESTRICTED: Install canceled by user")]).await;
        let confirm = Recorded::answering(true);
        let engine = InstallEngine::new(&device, &profile, &confirm, Path::new("/nonexistent"));
        let files = [PathBuf::from("base.apk"), PathBuf::from("config.en.apk")];
        let err = engine.install(&manifest(21, 1, &[]), &files, InstallFlags::AGGRESSIVE).await.unwrap_err();
        assert_eq!(err.signal(), Some(FailureSignal::UserRestricted));
        let after = bridge.position(is_install).unwrap();
        assert_eq!(bridge.commands().len(), after + 1);
    }

    #[test(tokio::test)]
    async fn multi_file_falls_back_to_session_install() {
        let results = vec![failure("INSTALL_FAILED_INTERNAL_ERROR"), failure("INSTALL_FAILED_INTERNAL_ERROR")];
        let (device, bridge, profile) = setup(FakeDevice::default(), results).await;
        let confirm = Recorded::answering(true);
        let engine = InstallEngine::new(&device, &profile, &confirm, Path::new("/nonexistent"));
        let files = [PathBuf::from("/w/base.apk"), PathBuf::from("/w/config.xxhdpi.apk")];
        let step = engine.install(&manifest(21, 1, &[]), &files, InstallFlags::AGGRESSIVE).await.unwrap();
        assert_eq!(step, Step::Session);
        assert_eq!(bridge.count(|c| matches!(c, AdbCommand::CommitSession(_))), 1);
        assert_eq!(bridge.count(|c| matches!(c, AdbCommand::Uninstall { .. })), 0);
    }

    #[test(tokio::test)]
    async fn reinstall_backs_up_uninstalls_and_discards_backup_on_success() {
        let work = tempfile::tempdir().unwrap();
        let fake = FakeDevice { installed: Some((90, "arm64-v8a".into())), ..Default::default() };
        let results = vec![failure("INSTALL_FAILED_UPDATE_INCOMPATIBLE"), failure("INSTALL_FAILED_UPDATE_INCOMPATIBLE")];
        let (device, bridge, profile) = setup(fake, results).await;
        let confirm = Recorded::answering(true);
        let engine = InstallEngine::new(&device, &profile, &confirm, work.path());
        let step = engine
            .install(&manifest(21, 100, &[]), &[PathBuf::from("base.apk")], InstallFlags::AGGRESSIVE)
            .await
            .unwrap();

        assert_eq!(step, Step::Bulk(InstallFlags::NONE));
        let pull = bridge.position(|c| matches!(c, AdbCommand::Pull { .. })).unwrap();
        let uninstall = bridge.position(|c| matches!(c, AdbCommand::Uninstall { .. })).unwrap();
        assert!(pull < uninstall);
        assert_eq!(
            bridge.commands().into_iter().filter(is_install).last(),
            Some(AdbCommand::Install { flags: InstallFlags::NONE, path: "base.apk".into() })
        );
        assert!(!work.path().join("com.example.app").exists());
    }

    #[test(tokio::test)]
    async fn failed_reinstall_restores_previous_installation() {
        let work = tempfile::tempdir().unwrap();
        let fake = FakeDevice { installed: Some((90, "arm64-v8a".into())), ..Default::default() };
        let results = vec![
            failure("INSTALL_FAILED_UPDATE_INCOMPATIBLE"),
            failure("INSTALL_FAILED_UPDATE_INCOMPATIBLE"),
            failure("INSTALL_PARSE_FAILED_NO_CERTIFICATES"),
        ];
        let (device, bridge, profile) = setup(fake, results).await;
        let confirm = Recorded::answering(true);
        let engine = InstallEngine::new(&device, &profile, &confirm, work.path());
        let err = engine
            .install(&manifest(21, 100, &[]), &[PathBuf::from("base.apk")], InstallFlags::AGGRESSIVE)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("INSTALL_PARSE_FAILED_NO_CERTIFICATES"));
        let restore = AdbCommand::Install {
            flags: InstallFlags::REPLACE_ONLY,
            path: work.path().join("com.example.app/base.apk"),
        };
        assert_eq!(bridge.commands().into_iter().filter(is_install).last(), Some(restore));
        assert!(!work.path().join("com.example.app").exists());
    }

    #[test(tokio::test)]
    async fn declined_reinstall_never_uninstalls() {
        let fake = FakeDevice { installed: Some((90, "arm64-v8a".into())), ..Default::default() };
        let results = vec![failure("INSTALL_FAILED_UPDATE_INCOMPATIBLE"), failure("INSTALL_FAILED_UPDATE_INCOMPATIBLE")];
        let (device, bridge, profile) = setup(fake, results).await;
        let confirm = Recorded::answering(false);
        let engine = InstallEngine::new(&device, &profile, &confirm, Path::new("/nonexistent"));
        let err = engine
            .install(&manifest(21, 100, &[]), &[PathBuf::from("base.apk")], InstallFlags::AGGRESSIVE)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Cancelled(_)));
        assert_eq!(bridge.count(|c| matches!(c, AdbCommand::Uninstall { .. })), 0);
        assert_eq!(bridge.count(|c| matches!(c, AdbCommand::Pull { .. })), 0);
    }
}
