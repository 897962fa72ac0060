//! Reauthorization recovery
//!
//! When the platform rejects an upload because the grant expired, the user
//! is asked once whether to sign out and back in. Accepting ends the
//! session by navigating to the sign-out target; declining leaves the
//! session as it was so the upload can be retried.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::Result;

/// Question shown when the platform grant must be renewed
pub const REAUTH_QUESTION: &str = "Platform permissions missing. Would you like to log out and \
log back in to grant the needed permissions?";

/// Asks the user a yes/no reauthorization question
#[async_trait]
pub trait ReauthPrompt: Send + Sync {
    /// Returns true when the user agrees to sign out
    async fn confirm(&self, message: &str) -> Result<bool>;
}

/// Sends the user somewhere else (a browser tab, a log line, ...)
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;
}

/// Result of a recovery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Navigated to the sign-out target
    SignedOut { url: String },
    /// User kept the current session
    Declined,
}

/// Prompt-then-navigate flow for expired authorization
pub struct RecoveryFlow {
    prompt: Arc<dyn ReauthPrompt>,
    navigator: Arc<dyn Navigator>,
}

impl RecoveryFlow {
    pub fn new(prompt: Arc<dyn ReauthPrompt>, navigator: Arc<dyn Navigator>) -> Self {
        Self { prompt, navigator }
    }

    /// Ask once and act on the answer
    pub async fn run(&self, reason: &str, end_session_url: &str) -> Result<RecoveryOutcome> {
        info!("Authorization expired: {}", reason);
        if self.prompt.confirm(REAUTH_QUESTION).await? {
            self.navigator.navigate(end_session_url).await?;
            info!("Session ended via {}", end_session_url);
            Ok(RecoveryOutcome::SignedOut {
                url: end_session_url.to_string(),
            })
        } else {
            info!("Reauthorization declined");
            Ok(RecoveryOutcome::Declined)
        }
    }

    pub fn navigator(&self) -> &Arc<dyn Navigator> {
        &self.navigator
    }
}

/// Terminal prompt reading y/n from stdin
pub struct CliPrompt;

impl CliPrompt {
    fn parse(answer: &str) -> Option<bool> {
        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => Some(true),
            "n" | "no" | "" => Some(false),
            _ => None,
        }
    }
}

#[async_trait]
impl ReauthPrompt for CliPrompt {
    async fn confirm(&self, message: &str) -> Result<bool> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("\n{} [y/N] ", message);
            std::io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                // stdin closed; treat as a decline
                return Ok(false);
            };
            match Self::parse(&line) {
                Some(answer) => return Ok(answer),
                None => println!("Please answer y or n."),
            }
        }
    }
}

/// Prompt with a fixed answer, for non-interactive runs
pub struct FixedPrompt(pub bool);

#[async_trait]
impl ReauthPrompt for FixedPrompt {
    async fn confirm(&self, message: &str) -> Result<bool> {
        info!("{} -> {}", message, if self.0 { "yes" } else { "no" });
        Ok(self.0)
    }
}

/// Navigator that prints the target for the user to open
pub struct PrintNavigator;

#[async_trait]
impl Navigator for PrintNavigator {
    async fn navigate(&self, url: &str) -> Result<()> {
        info!("Navigating to {}", url);
        println!("Open this URL in your browser: {}", url);
        Ok(())
    }
}
