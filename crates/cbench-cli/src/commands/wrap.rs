use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use cbench_core::ProcessExit;
use cbench_proc::ProcSet;
use tracing::info;

/// Run `command` under supervision. The returned code follows the shell
/// convention so the caller can recover a signal death from it.
pub async fn wrap(
    binary_dir: Option<PathBuf>,
    command: &[String],
    grace: Option<Duration>,
    kill: Option<Duration>,
) -> anyhow::Result<i32> {
    let Some((binary, args)) = command.split_first() else {
        bail!("no program to wrap");
    };
    let program = match &binary_dir {
        Some(dir) => dir.join(binary).display().to_string(),
        None => binary.clone(),
    };

    let mut set = ProcSet::new();
    let pid = set.spawn(&program, args, true, true)?;
    set.wait_for(grace, kill).await?;

    let exit = set
        .exit()
        .cloned()
        .unwrap_or_else(|| ProcessExit::Lost("no exit status".to_string()));
    info!(pid, program = %program, exit = %exit, killed = set.was_killed(), "wrapped process finished");
    Ok(exit.shell_code())
}
