// ABOUTME: Subcommand modules for the siteaudit binary
// ABOUTME: Also maps top-level errors to process exit codes

pub mod config;
pub mod run;

use siteaudit_sandbox::{Interruption, OrchestratorError};

/// 130 for SIGINT, 143 for SIGTERM, 1 for everything else
pub fn exit_code(error: &anyhow::Error) -> i32 {
    if let Some(e) = error.downcast_ref::<OrchestratorError>() {
        return e.exit_code();
    }
    if let Some(interruption) = error.downcast_ref::<Interruption>() {
        return interruption.exit_code();
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use siteaudit_sandbox::Shutdown;

    #[test]
    fn test_exit_codes() {
        let interrupted = anyhow::Error::new(OrchestratorError::from(Interruption::Signal(
            Shutdown::Interrupt,
        )));
        assert_eq!(exit_code(&interrupted), 130);

        let terminated = anyhow::Error::new(Interruption::Signal(Shutdown::Terminate));
        assert_eq!(exit_code(&terminated), 143);

        assert_eq!(exit_code(&anyhow::anyhow!("E2B_API_KEY is required")), 1);
    }
}
