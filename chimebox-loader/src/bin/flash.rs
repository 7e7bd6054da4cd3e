//! Production flashing sequence.
//!
//! Flashes the production firmware, optionally preceded by the EEPROM
//! preload cycle: preload firmware in, songs transferred to EEPROM by
//! the `chimebox-eeprom` binary, production firmware back in.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chimebox_loader::flashtool;

struct Args {
    device: String,
    eeprom: bool,
    firmware: PathBuf,
    notes: PathBuf,
    scripts: PathBuf,
    verbosity: u8,
}

fn usage() -> ! {
    eprintln!("Usage: chimebox-flash -d <device> [options]");
    eprintln!();
    eprintln!("Firmware and EEPROM flash utility.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -d, --device <dev>     UART device, e.g. /dev/ttyUSB1, or USBTiny");
    eprintln!("  -e, --eeprom           Also preload the EEPROM with song data");
    eprintln!("  -f, --firmware <hex>   Production firmware image (default: chimebox.hex)");
    eprintln!("  -n, --notes <json>     Converted song data (default: notes.json)");
    eprintln!("  -t, --scripts <dir>    avrdude wrapper script directory (default: avrdude)");
    eprintln!("  -v                     Increase verbosity (repeatable)");
    std::process::exit(1);
}

fn parse_args() -> Args {
    let mut args = Args {
        device: String::new(),
        eeprom: false,
        firmware: PathBuf::from("chimebox.hex"),
        notes: PathBuf::from("notes.json"),
        scripts: PathBuf::from("avrdude"),
        verbosity: 0,
    };

    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| iter.next().unwrap_or_else(|| {
            eprintln!("Missing value for {name}");
            usage();
        });
        match arg.as_str() {
            "-d" | "--device" => args.device = value("--device"),
            "-e" | "--eeprom" => args.eeprom = true,
            "-f" | "--firmware" => args.firmware = PathBuf::from(value("--firmware")),
            "-n" | "--notes" => args.notes = PathBuf::from(value("--notes")),
            "-t" | "--scripts" => args.scripts = PathBuf::from(value("--scripts")),
            "-h" | "--help" => usage(),
            flag if flag.starts_with("-v") && flag[1..].bytes().all(|b| b == b'v') => {
                args.verbosity += (flag.len() - 1) as u8;
            }
            other => {
                eprintln!("Unknown argument: {other}");
                usage();
            }
        }
    }

    if args.device.is_empty() {
        usage();
    }
    args
}

/// The wrapper scripts ship without the execute bit; set it before the
/// first spawn.
#[cfg(unix)]
fn set_script_permissions(scripts: &Path) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    for script in ["flash.sh", "reset.sh"] {
        let path = scripts.join(script);
        if path.exists() {
            fs::set_permissions(&path, fs::Permissions::from_mode(0o744))
                .with_context(|| format!("setting permissions on {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_script_permissions(_scripts: &Path) -> Result<()> {
    Ok(())
}

/// Run the EEPROM transfer through the sibling `chimebox-eeprom`
/// binary, with the production geometry.
async fn preload_eeprom(args: &Args) -> Result<()> {
    let eeprom_bin = env::current_exe()
        .context("locating chimebox-eeprom")?
        .with_file_name("chimebox-eeprom");

    let mut command = Command::new(&eeprom_bin);
    command
        .arg("-p")
        .arg("64")
        .arg("-a")
        .arg("256")
        .arg("-s")
        .arg("32768")
        .arg("-r")
        .arg(args.scripts.join("reset.sh"))
        .arg(&args.notes);
    if args.device != "USBTiny" {
        command.arg("-d").arg(&args.device);
    }
    for _ in 0..args.verbosity {
        command.arg("-v");
    }

    let status = command
        .status()
        .await
        .with_context(|| format!("running {}", eeprom_bin.display()))?;
    if !status.success() {
        bail!("EEPROM transfer failed: {status}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    let default = match args.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !args.firmware.exists() {
        bail!("failed to open firmware: {}", args.firmware.display());
    }
    if args.eeprom && !args.notes.exists() {
        bail!("failed to open notes: {}", args.notes.display());
    }
    set_script_permissions(&args.scripts)?;

    let flash_script = args.scripts.join("flash.sh");
    let device = (args.device != "USBTiny").then_some(args.device.as_str());
    let started = Instant::now();

    if args.eeprom {
        info!("flashing preload firmware to target");
        flashtool::flash_hex(&flash_script, &args.scripts.join("hex/preload.hex"), device)
            .await
            .context("flashing preload firmware")?;

        info!("transferring songs to on-board EEPROM");
        preload_eeprom(&args).await?;
    }

    info!("flashing production firmware to target");
    flashtool::flash_hex(&flash_script, &args.firmware, device)
        .await
        .context("flashing production firmware")?;

    info!(
        elapsed = %format_args!("{:.2}s", started.elapsed().as_secs_f64()),
        "production complete"
    );
    Ok(())
}
