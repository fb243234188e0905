//! CLI command builders for tests
//!
//! Commands run with `RUST_LOG=error` so test output stays clean and
//! deterministic.

use assert_cmd::Command;

/// Get a Command for the `trek` binary with clean environment
///
/// # Example
///
/// ```rust,no_run
/// use trek_test_helpers::cli::trek_command;
///
/// trek_command().arg("--version").assert().success();
/// ```
pub fn trek_command() -> Command {
    command_for("trek")
}

/// Get a Command for a specific binary with clean environment
#[allow(deprecated)]
pub fn command_for(bin_name: &str) -> Command {
    let mut cmd = Command::cargo_bin(bin_name)
        .unwrap_or_else(|_| panic!("Failed to find {} binary", bin_name));
    cmd.env("RUST_LOG", "error");
    cmd
}
