//! Write a converted song JSON file to the on-board EEPROM.
//!
//! With `-d` the transfer runs over the named UART device; without it
//! the USBtinyISP SPI bridge is used (and the target is reset through
//! the programmer first).

use std::env;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Result, bail};
use tracing::error;
use tracing_subscriber::EnvFilter;

use chimebox_loader::flashtool;
use chimebox_loader::image::{EepromImage, EncodeParams, encode};
use chimebox_loader::song::load_songs;
use chimebox_loader::transport::serial::SerialLink;
use chimebox_loader::transport::usbtiny::UsbTinyBridge;
use chimebox_loader::transport::{Session, TransferReport, TransportError};

/// Whole-transfer attempts before giving up.
const TRANSMIT_RETRY_COUNT: u32 = 3;

struct Args {
    file: String,
    device: Option<String>,
    reset_script: PathBuf,
    params: EncodeParams,
    verbosity: u8,
}

fn usage() -> ! {
    eprintln!("Usage: chimebox-eeprom [options] <file>");
    eprintln!();
    eprintln!("Write a song JSON file to the on-board EEPROM over SPI or UART.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -d, --device <dev>        UART device to use, e.g. /dev/ttyUSB1.");
    eprintln!("                            Without it, SPI via USBtinyISP is used.");
    eprintln!("  -p, --pagesize <n>        EEPROM page size (default: 32)");
    eprintln!("  -a, --address-start <n>   First EEPROM address for song values (default: 256)");
    eprintln!("  -s, --size-memory <n>     EEPROM size in bytes (default: 8192)");
    eprintln!("  -r, --reset-script <path> Target reset script for the SPI path");
    eprintln!("                            (default: avrdude/reset.sh)");
    eprintln!("  -v                        Increase verbosity (repeatable)");
    std::process::exit(1);
}

fn parse_args() -> Args {
    let mut args = Args {
        file: String::new(),
        device: None,
        reset_script: PathBuf::from("avrdude/reset.sh"),
        params: EncodeParams::default(),
        verbosity: 0,
    };

    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| iter.next().unwrap_or_else(|| {
            eprintln!("Missing value for {name}");
            usage();
        });
        match arg.as_str() {
            "-d" | "--device" => args.device = Some(value("--device")),
            "-p" | "--pagesize" => args.params.pagesize = parse_number(&value("--pagesize")),
            "-a" | "--address-start" => {
                args.params.address_start = parse_number(&value("--address-start"))
            }
            "-s" | "--size-memory" => {
                args.params.size_memory = parse_number(&value("--size-memory"))
            }
            "-r" | "--reset-script" => args.reset_script = PathBuf::from(value("--reset-script")),
            "-h" | "--help" => usage(),
            flag if flag.starts_with("-v") && flag[1..].bytes().all(|b| b == b'v') => {
                args.verbosity += (flag.len() - 1) as u8;
            }
            positional if !positional.starts_with('-') && args.file.is_empty() => {
                args.file = positional.to_string();
            }
            other => {
                eprintln!("Unknown argument: {other}");
                usage();
            }
        }
    }

    if args.file.is_empty() {
        usage();
    }
    args
}

fn parse_number(text: &str) -> u32 {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.unwrap_or_else(|_| {
        eprintln!("Invalid number: {text}");
        usage();
    })
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn transfer(
    device: Option<&str>,
    image: &EepromImage,
) -> Result<TransferReport, TransportError> {
    match device {
        Some(path) => Session::new(SerialLink::new(path)).transfer(image).await,
        None => Session::new(UsbTinyBridge::new()).transfer(image).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    init_tracing(args.verbosity);

    let songs = load_songs(&args.file)?;
    let image = encode(&songs, &args.params)?;

    let started = Instant::now();
    let mut attempts = 0;
    let report = loop {
        attempts += 1;

        if args.device.is_none() {
            flashtool::reset_target(&args.reset_script).await?;
        }

        match transfer(args.device.as_deref(), &image).await {
            Ok(report) => break report,
            Err(err) => {
                error!(error = %err, attempt = attempts, "transfer failed");
                if attempts > TRANSMIT_RETRY_COUNT {
                    bail!("unable to flash EEPROM");
                }
            }
        }
    };

    println!(
        "Transferred {} sections ( {} bytes )",
        report.sections, report.bytes
    );
    println!("Completed in {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}
