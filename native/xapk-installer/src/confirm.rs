//! Yes/no decisions for destructive steps (downgrade, same-version reinstall, uninstall).

use async_trait::async_trait;
use tracing::{info, warn};

/// Answers a yes/no question before a destructive step.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Headless policy: answer yes to everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllow;

#[async_trait]
impl Confirm for AlwaysAllow {
    async fn confirm(&self, prompt: &str) -> bool {
        info!(prompt, "Auto-confirmed");
        true
    }
}

/// Headless policy: answer no to everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysDeny;

#[async_trait]
impl Confirm for AlwaysDeny {
    async fn confirm(&self, prompt: &str) -> bool {
        info!(prompt, "Auto-declined");
        false
    }
}

/// Asks on the terminal. Defaults to no; an unreadable terminal counts as no.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prompt;

#[async_trait]
impl Confirm for Prompt {
    /// The terminal read blocks, so it runs off the async workers.
    async fn confirm(&self, prompt: &str) -> bool {
        let message = prompt.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            inquire::Confirm::new(&message)
                .with_default(false)
                .with_help_message("Press 'y' to continue, Enter to cancel")
                .prompt()
        })
        .await;
        match answer {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!(error = &e as &dyn std::error::Error, "Failed to read confirmation, declining");
                false
            }
            Err(e) => {
                warn!(error = &e as &dyn std::error::Error, "Confirmation task failed, declining");
                false
            }
        }
    }
}

/// Picks the policy for the `--yes` / `--no` command line switches.
pub fn policy(yes: bool, no: bool) -> Box<dyn Confirm> {
    match (yes, no) {
        (true, _) => Box::new(AlwaysAllow),
        (false, true) => Box::new(AlwaysDeny),
        (false, false) => Box::new(Prompt),
    }
}
