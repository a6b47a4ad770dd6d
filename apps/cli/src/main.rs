use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use amflash_core::{
    AssumeYes, ConfirmPrompt, FirmwareImage, FlashConfig, FlashEvent, FlashObserver,
    FlashOptions, FlashSession, LogLevel, SystemBackend,
};

#[derive(Parser, Debug)]
#[command(
    name = "amflash",
    author,
    version,
    about = "AudioMoth firmware flasher",
    long_about = "Flashes firmware onto an attached AudioMoth over the serial \
                  bootloader (XMODEM-CRC) or the USB-HID SRAM path."
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report which mode the attached device is in
    Status {
        /// Keep probing on a 2 second cadence
        #[arg(long)]
        watch: bool,
    },
    /// Flash a firmware image
    Flash {
        /// Firmware binary (.bin)
        file: PathBuf,

        /// Overwrite the bootloader region as well (firmware+bootloader images only)
        #[arg(long)]
        destructive: bool,

        /// Erase the device's user-data region as part of the flash
        #[arg(long)]
        clear_user_data: bool,

        /// Prefer the USB-HID path when the device supports it
        #[arg(long)]
        usb_hid: bool,

        /// Expected image CRC as four hex digits (e.g. 0A1B)
        #[arg(long)]
        expected_crc: Option<String>,

        /// Serial port override (e.g. /dev/ttyACM0 or COM3)
        #[arg(long)]
        port: Option<String>,

        /// Answer every confirmation prompt with yes
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

/// Observer that prints progress to stderr.
struct CliObserver {
    verbose: bool,
}

impl FlashObserver for CliObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::Flashing { current, total } => {
                let pct = if *total > 0 { current * 100 / total } else { 0 };
                eprint!("\r[{pct:>3}%] Flashing {current}/{total}");
                if current == total {
                    eprintln!();
                }
            }
            FlashEvent::Restart { percent } => {
                eprint!("\r[{percent:>3}%] Restarting");
                if *percent == 100 {
                    eprintln!();
                }
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Error => eprintln!("ERROR: {message}"),
                LogLevel::Warn => eprintln!("WARN: {message}"),
                _ if self.verbose => eprintln!("{message}"),
                _ => {}
            },
            FlashEvent::Completed { reported_crc } => match reported_crc {
                Some(crc) => eprintln!("✓ Completed, device CRC {crc}"),
                None => eprintln!("✓ Completed"),
            },
            FlashEvent::Aborted { reason } => eprintln!("✗ {reason}"),
            other => {
                if self.verbose {
                    eprintln!("{other}");
                }
            }
        }
    }
}

/// Asks on stdin; anything but `y`/`yes` declines.
struct StdinPrompt;

impl ConfirmPrompt for StdinPrompt {
    fn confirm(&self, question: &str) -> bool {
        eprint!("{question} [y/N] ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("{e:#}");
        eprintln!("✗ FAILED: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => FlashConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FlashConfig::default(),
    };

    match args.command {
        Command::Status { watch } => {
            let session = FlashSession::new(SystemBackend, config);
            loop {
                match session.probe() {
                    Some(status) => println!("{status}"),
                    None => println!("Busy"),
                }
                if !watch {
                    break;
                }
                thread::sleep(Duration::from_secs(2));
            }
            Ok(())
        }

        Command::Flash {
            file,
            destructive,
            clear_user_data,
            usb_hid,
            expected_crc,
            port,
            yes,
        } => {
            if let Some(port) = port {
                config.port = Some(port);
            }
            let prefer_usbhid = usb_hid || config.prefer_usbhid;

            let expected_crc = expected_crc
                .map(|text| {
                    u16::from_str_radix(text.trim(), 16)
                        .with_context(|| format!("invalid CRC value {text:?}"))
                })
                .transpose()?;

            let image = FirmwareImage::from_file(&file)
                .with_context(|| format!("reading {}", file.display()))?;

            let observer = Arc::new(CliObserver {
                verbose: args.verbose,
            });
            let session = FlashSession::with_observer(SystemBackend, config, observer);

            let options = FlashOptions {
                destructive,
                clear_user_data,
                prefer_usbhid,
                expected_crc,
                version: None,
            };

            let outcome = if yes {
                session.flash(&image, &options, &AssumeYes)
            } else {
                session.flash(&image, &options, &StdinPrompt)
            };

            match outcome {
                Ok(_) => Ok(()),
                Err(e) => bail!(e),
            }
        }
    }
}
