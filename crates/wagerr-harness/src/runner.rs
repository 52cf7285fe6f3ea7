//! Scenario runner: options parsing, logging, teardown, exit codes.
//!
//! A scenario implements [`TestCase`] and hands itself to [`run_test`];
//! the runner owns setup and teardown. Datadirs are removed only after a
//! passing run so a failure always leaves logs behind for postmortems.

use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info, warn};

use crate::config::HarnessOptions;
use crate::context::{TestContext, TestParams};
use crate::error::HarnessError;

/// CI-visible exit codes.
pub const EXIT_PASSED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_SKIPPED: i32 = 77;

/// One functional-test scenario.
#[async_trait]
pub trait TestCase {
    fn params(&self) -> TestParams;

    /// Override to customize the topology; the default brings up a chain of
    /// nodes, or the full masternode network when `mn_count > 0`.
    async fn setup_network(&self, ctx: &mut TestContext) -> Result<(), HarnessError> {
        ctx.setup_network().await
    }

    async fn run(&self, ctx: &mut TestContext) -> Result<(), HarnessError>;
}

pub fn exit_code(outcome: &Result<(), HarnessError>) -> i32 {
    match outcome {
        Ok(()) => EXIT_PASSED,
        Err(HarnessError::Skipped(_)) => EXIT_SKIPPED,
        Err(_) => EXIT_FAILED,
    }
}

/// Parse options from the command line, run the scenario, return the exit
/// code for `std::process::exit`.
pub async fn run_test<C: TestCase + Sync>(case: C) -> i32 {
    let options = HarnessOptions::parse();
    init_logging(&options.log_level);
    run_test_with_options(case, options).await
}

pub async fn run_test_with_options<C: TestCase + Sync>(case: C, options: HarnessOptions) -> i32 {
    if options.timeout_scale < 1 {
        error!("--timeout-scale must be at least 1");
        return EXIT_FAILED;
    }
    let keep_dirs = options.nocleanup || options.noshutdown;
    let mut ctx = match TestContext::new(options, case.params()) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("failed to build the test context: {e}");
            return EXIT_FAILED;
        }
    };
    let root = ctx.root().to_path_buf();

    let mut outcome = async {
        ctx.setup_chain().await?;
        case.setup_network(&mut ctx).await?;
        case.run(&mut ctx).await
    }
    .await;

    match &outcome {
        Ok(()) => info!("tests successful"),
        Err(HarnessError::Skipped(reason)) => warn!("test skipped: {reason}"),
        Err(e) => error!("test failed: {e}"),
    }

    if ctx.options.noshutdown {
        warn!("daemons were not stopped and may still be running");
    } else if let Err(e) = ctx.stop_nodes().await {
        error!("unexpected error during shutdown: {e}");
        if outcome.is_ok() {
            outcome = Err(e);
        }
    }

    if outcome.is_ok() && !keep_dirs {
        info!("cleaning up {} on exit", root.display());
        if let Err(e) = std::fs::remove_dir_all(&root) {
            warn!("cleanup failed: {e}");
        }
    } else {
        warn!(
            "not cleaning up {}; logs are available for inspection",
            root.display()
        );
    }
    exit_code(&outcome)
}

/// Console subscriber for scenario binaries; `RUST_LOG` overrides `level`.
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_pass_fail_skip() {
        assert_eq!(exit_code(&Ok(())), EXIT_PASSED);
        assert_eq!(
            exit_code(&Err(HarnessError::Skipped("no daemon".into()))),
            EXIT_SKIPPED
        );
        assert_eq!(
            exit_code(&Err(HarnessError::Check("tips differ".into()))),
            EXIT_FAILED
        );
    }
}
