//! External flashing tool collaborators.
//!
//! Program memory is written by an avrdude wrapper script shipped next
//! to the binaries; this module only spawns it and checks the exit
//! status. The reset script pulses the target's reset line through the
//! same programmer, which the SPI transfer path needs before polling.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

/// Time the target takes to reboot after a reset pulse.
const RESET_SETTLE: Duration = Duration::from_secs(4);

/// Failures from the external flashing scripts.
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("failed to run {script}: {source}")]
    Spawn {
        script: String,
        source: std::io::Error,
    },

    #[error("{script} exited with {status}")]
    Failed {
        script: String,
        status: std::process::ExitStatus,
    },
}

async fn run(script: &Path, args: &[&str]) -> Result<(), FlashError> {
    debug!(script = %script.display(), ?args, "running flash script");
    let status = Command::new(script)
        .args(args)
        .status()
        .await
        .map_err(|source| FlashError::Spawn {
            script: script.display().to_string(),
            source,
        })?;
    if !status.success() {
        return Err(FlashError::Failed {
            script: script.display().to_string(),
            status,
        });
    }
    Ok(())
}

/// Flash a firmware HEX image through the avrdude wrapper.
///
/// `device` selects the UART programmer; without it the wrapper falls
/// back to the USBtiny.
pub async fn flash_hex(
    script: &Path,
    hex: &Path,
    device: Option<&str>,
) -> Result<(), FlashError> {
    let hex = hex.display().to_string();
    let mut args = vec![hex.as_str()];
    if let Some(device) = device {
        args.push(device);
    }
    run(script, &args).await
}

/// Pulse the target's reset line and wait for it to reboot.
pub async fn reset_target(script: &Path) -> Result<(), FlashError> {
    info!("resetting target");
    run(script, &[]).await?;
    tokio::time::sleep(RESET_SETTLE).await;
    Ok(())
}
