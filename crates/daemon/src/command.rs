//! Helper for driving host networking tools

use std::ffi::OsStr;
use tokio::process::Command;
use tracing::debug;

/// Run `program` with `args` and return its stdout. Spawn failures and
/// non-zero exits are returned as a human-readable message.
pub(crate) async fn run_tool<I, S>(program: &str, args: I) -> Result<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    debug!("Running {:?}", command.as_std());

    let output = command
        .output()
        .await
        .map_err(|e| format!("{} failed to start: {}", program, e))?;

    if !output.status.success() {
        return Err(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
