//! In-memory [`Bridge`] that replays canned device answers and records every command.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use async_trait::async_trait;
use derive_more::Debug;

use super::{AdbCommand, AdbDevice, Bridge, CommandOutput};

/// Static answers for the property and dump queries a device profile issues.
#[derive(Debug, Clone)]
pub(crate) struct FakeDevice {
    pub sdk: String,
    pub abi: String,
    pub abilist: String,
    pub dpi: Option<u32>,
    pub locale: String,
    /// `(versionCode, primaryCpuAbi)` of an already installed copy of the package.
    pub installed: Option<(u64, String)>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            sdk: "30".into(),
            abi: "arm64-v8a".into(),
            abilist: "arm64-v8a,armeabi-v7a,armeabi".into(),
            dpi: Some(420),
            locale: "en-US".into(),
            installed: None,
        }
    }
}

impl FakeDevice {
    fn answer(&self, command: &AdbCommand) -> Option<CommandOutput> {
        match command {
            AdbCommand::GetProp(key) => Some(CommandOutput::ok(match key.as_str() {
                "ro.build.version.sdk" => format!("{}\n", self.sdk),
                "ro.product.cpu.abi" => format!("{}\n", self.abi),
                "ro.product.cpu.abilist" => format!("{}\n", self.abilist),
                "ro.product.locale" => format!("{}\n", self.locale),
                _ => "\n".to_string(),
            })),
            AdbCommand::Dumpsys(_) => Some(CommandOutput::ok(match self.dpi {
                Some(dpi) => format!(
                    "WINDOW MANAGER DISPLAY CONTENTS (dumpsys window displays)\n  Display: \
                     mDisplayId=0\n    init=1080x2400 {dpi}dpi cur=1080x2400 app=1080x2256 \
                     rng=1080x1017-2256x2193\n"
                ),
                None => "WINDOW MANAGER DISPLAY CONTENTS\n  Display: mDisplayId=0\n".to_string(),
            })),
            AdbCommand::PackageDump(package) => Some(CommandOutput::ok(match &self.installed {
                Some((version, abi)) => format!(
                    "Packages:\n  Package [{package}] (3b1f2c):\n    userId=10234\n    \
                     primaryCpuAbi={abi}\n    versionCode={version} minSdk=21 targetSdk=33\n"
                ),
                None => "Dexopt state:\n  Unable to find package\n".to_string(),
            })),
            _ => None,
        }
    }
}

type Matcher = Box<dyn Fn(&AdbCommand) -> bool + Send + Sync>;

#[derive(Debug)]
pub(crate) struct ScriptedBridge {
    device: FakeDevice,
    /// Results for `install`, `install-multiple` and `install-commit`, consumed in order.
    install_results: Mutex<VecDeque<CommandOutput>>,
    #[debug(skip)]
    overrides: Vec<(Matcher, CommandOutput)>,
    log: Mutex<Vec<AdbCommand>>,
}

impl ScriptedBridge {
    pub fn new(device: FakeDevice) -> Self {
        Self {
            device,
            install_results: Mutex::new(VecDeque::new()),
            overrides: Vec::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn install_results(self, results: impl IntoIterator<Item = CommandOutput>) -> Self {
        *self.install_results.lock().unwrap() = results.into_iter().collect();
        self
    }

    /// Answers every command matching `matcher` with `output`, ahead of the defaults.
    pub fn answer(
        mut self,
        matcher: impl Fn(&AdbCommand) -> bool + Send + Sync + 'static,
        output: CommandOutput,
    ) -> Self {
        self.overrides.push((Box::new(matcher), output));
        self
    }

    pub fn into_device(self) -> (AdbDevice, Arc<ScriptedBridge>) {
        let bridge = Arc::new(self);
        (AdbDevice::new(bridge.clone()), bridge)
    }

    pub fn commands(&self) -> Vec<AdbCommand> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&AdbCommand) -> bool) -> usize {
        self.log.lock().unwrap().iter().filter(|c| predicate(*c)).count()
    }

    pub fn position(&self, predicate: impl Fn(&AdbCommand) -> bool) -> Option<usize> {
        self.log.lock().unwrap().iter().position(predicate)
    }
}

pub(crate) fn is_install(command: &AdbCommand) -> bool {
    matches!(command, AdbCommand::Install { .. } | AdbCommand::InstallMultiple { .. })
}

#[async_trait]
impl Bridge for ScriptedBridge {
    fn serial(&self) -> &str {
        "FAKE0001"
    }

    async fn execute(&self, command: &AdbCommand) -> Result<CommandOutput> {
        self.log.lock().unwrap().push(command.clone());

        if let Some((_, output)) = self.overrides.iter().find(|(matcher, _)| matcher(command)) {
            return Ok(output.clone());
        }
        if let Some(output) = self.device.answer(command) {
            return Ok(output);
        }
        let output = match command {
            AdbCommand::Install { .. }
            | AdbCommand::InstallMultiple { .. }
            | AdbCommand::CommitSession(_) => self
                .install_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| CommandOutput::ok("Success")),
            AdbCommand::CreateSession => {
                CommandOutput::ok("Success: created install session [1234567890]")
            }
            AdbCommand::PathQuery(package) => {
                CommandOutput::ok(format!("package:/data/app/~~x1/{package}-1/base.apk\n"))
            }
            AdbCommand::Pull { remote, .. } if remote.contains("/Android/obb/") => {
                CommandOutput::new(1, format!("adb: error: failed to stat remote object '{remote}': No such file or directory"))
            }
            AdbCommand::Uninstall { .. } => CommandOutput::ok("Success"),
            _ => CommandOutput::ok(""),
        };
        Ok(output)
    }
}
