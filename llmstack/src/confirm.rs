use std::io::{self, IsTerminal};

use llmstack_supervisor::{Confirmation, Confirmer};
use tracing::warn;

/// Asks on the terminal. Without one, answers `Unavailable`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DialoguerConfirmer;

impl Confirmer for DialoguerConfirmer {
    fn confirm(&self, prompt: &str) -> Confirmation {
        if !io::stdin().is_terminal() || !io::stderr().is_terminal() {
            return Confirmation::Unavailable;
        }
        match dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
        {
            Ok(true) => Confirmation::Approved,
            Ok(false) => Confirmation::Declined,
            Err(e) => {
                warn!("Could not read an answer: {}", e);
                Confirmation::Unavailable
            }
        }
    }
}
