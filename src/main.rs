use anyhow::{Context, Result};
use clap::Parser;
use efm8_load::device_ids::{EFM8_HID_LOADERS, PortKind};
use efm8_load::port::{HidPort, Port, SerialPort, SmbusPort, serial, smbus};
use efm8_load::protocol::{Error, Progress, Trace, download_with_cancel};
use hidapi::HidApi;
use log::{debug, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(windows)]
const DEFAULT_SERIAL_PORT: &str = "COM1";
#[cfg(not(windows))]
const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB0";

/// EFM8 bootloader download utility.
#[derive(Parser, Debug)]
#[command(name = "efm8-load", version)]
struct Opt {
    /// Boot record file to download
    bootfile: PathBuf,

    /// Serial device, "hid" (or "usb") for the USB bootloader, or "smb" (or "i2c") for an SMBus
    /// bootloader behind a CP2112 bridge
    #[arg(short, long, default_value = DEFAULT_SERIAL_PORT)]
    port: String,

    /// Serial baud rate
    #[arg(short, long, default_value_t = serial::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// SMBus clock rate in Hz when using a CP2112
    #[arg(long, default_value_t = smbus::DEFAULT_CLOCK_HZ)]
    smb_clock: u32,

    /// How long to wait for each reply, in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout: u64,

    /// Show a trace line per frame instead of progress characters
    #[arg(short, long)]
    trace: bool,
}

fn open_port(opt: &Opt) -> Result<Box<dyn Port>> {
    let timeout = Duration::from_millis(opt.timeout);
    let kind = PortKind::from_name(&opt.port);
    debug!("Opening {kind}");

    let port: Box<dyn Port> = match kind {
        PortKind::Hid => Box::new(HidPort::open(&HidApi::new()?, EFM8_HID_LOADERS, timeout)?),
        PortKind::Smbus => Box::new(SmbusPort::open(&HidApi::new()?, opt.smb_clock, timeout)?),
        PortKind::Serial(path) => Box::new(SerialPort::open(&path, opt.baud, timeout)?),
    };
    Ok(port)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("EFM8_LOAD_LOG", "warn")
            .write_style("EFM8_LOAD_LOG_STYLE"),
    )
    .init();

    let opt = Opt::parse();

    let file = File::open(&opt.bootfile)
        .with_context(|| format!("unable to open {}", opt.bootfile.display()))?;
    let mut file = BufReader::new(file);

    let mut port = open_port(&opt).context("unable to open port")?;
    println!("Download over port: {}\n", port.name());

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed))?;
    }

    let stdout = std::io::stdout().lock();
    let result = if opt.trace {
        download_with_cancel(&mut *port, &mut file, &mut Trace(stdout), &cancel)
    } else {
        download_with_cancel(&mut *port, &mut file, &mut Progress(stdout), &cancel)
    };

    let closed = port.close();
    if let (Err(_), Err(e)) = (&result, &closed) {
        warn!("Failed to close {}: {e}", port.name());
    }

    match result {
        Ok(result) => {
            closed?;
            println!("\nDownload complete with [ {} ] errors", result.error_count);
            if result.error_count > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(Error::Interrupted { .. }) => {
            println!("\nERROR: Download interrupted!");
            std::process::exit(130);
        }
        Err(e @ Error::BootRecord(_)) => {
            println!("\nERROR: Unable to parse bootfile!");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
