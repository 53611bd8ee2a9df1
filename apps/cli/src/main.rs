use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use rkflash_core::{
    BootPackage, ContainerKind, DeviceSession, EraseMode, NusbTransport, Outcome, ToolConfig,
    Transfer, UsbMode, UsbTransport, parse_number, unpack_file,
};
use tracing::{error, info, warn};

mod progress;

use progress::StderrProgress;

type Session = DeviceSession<NusbTransport, StderrProgress>;

#[derive(Parser, Debug)]
#[command(author, version, about = "RockChip flash tool (Pure Rust)", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// A flash range given either as a partition name or as `OFFSET NSECTORS`.
#[derive(ClapArgs, Debug)]
struct Range {
    /// Partition name, or start sector
    #[arg(value_name = "PART|OFFSET")]
    target: String,

    /// Number of sectors (makes TARGET an offset)
    #[arg(value_name = "NSECTORS", value_parser = number)]
    count: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reboot device
    Reboot {
        /// Reboot target (0 = normal boot)
        #[arg(value_parser = number, default_value = "0")]
        flag: u32,
    },
    /// Load DDR init (MASK ROM MODE)
    LoadDdr { file: PathBuf },
    /// Load USB loader (MASK ROM MODE)
    LoadUsbplug { file: PathBuf },
    /// Upload the DDR init and USB plug of a packed loader (MASK ROM MODE)
    DownloadBoot { loader: PathBuf },
    /// Write the FlashData/FlashBoot of a packed loader to the IDB area
    InstallLoader { loader: PathBuf },
    /// Read chip version
    ChipVersion,
    /// Read NAND flash info
    FlashInfo,
    /// Read raw IDB sectors
    ReadIdb {
        #[arg(value_parser = number)]
        offset: u32,
        #[arg(value_parser = number)]
        count: u32,
        output: Option<PathBuf>,
    },
    /// Write raw IDB sectors
    WriteIdb {
        #[arg(value_parser = number)]
        offset: u32,
        #[arg(value_parser = number)]
        count: u32,
        input: Option<PathBuf>,
    },
    /// Read SDRAM
    ReadRam {
        #[arg(value_parser = number)]
        addr: u32,
        #[arg(value_parser = number)]
        length: u32,
        output: Option<PathBuf>,
    },
    /// Write SDRAM
    WriteRam {
        #[arg(value_parser = number)]
        addr: u32,
        #[arg(value_parser = number)]
        length: u32,
        input: Option<PathBuf>,
    },
    /// Execute code in SDRAM
    ExecRam {
        #[arg(value_parser = number)]
        kernel_addr: u32,
        #[arg(value_parser = number)]
        param_addr: u32,
    },
    /// Read flash partition or range
    Read {
        #[command(flatten)]
        range: Range,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write flash partition or range
    Write {
        #[command(flatten)]
        range: Range,
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Erase flash (fill with 0xff)
    Erase {
        #[arg(value_name = "PART|OFFSET", required_unless_present = "all")]
        target: Option<String>,
        #[arg(value_name = "NSECTORS", value_parser = number)]
        count: Option<u32>,
        /// Erase the whole device
        #[arg(long, conflicts_with = "target")]
        all: bool,
        /// Let the device erase internally instead of writing 0xff blocks
        #[arg(long)]
        fast: bool,
    },
    /// Read the whole flash
    Dump {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fetch parameters
    GetParams {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write parameters
    PutParams {
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Unpack RockChip firmware (RKFW)
    UnpackFw {
        file: PathBuf,
        /// Output directory
        #[arg(short = 'C', long, default_value = ".")]
        directory: PathBuf,
    },
    /// Unpack RockChip image (KRNL, LOADER, RSCE)
    UnpackImg {
        file: PathBuf,
        /// Output file name for KRNL and LOADER images
        output: Option<String>,
        /// Output directory
        #[arg(short = 'C', long, default_value = ".")]
        directory: PathBuf,
    },
}

/// `0x` hex, leading-0 octal, otherwise decimal.
fn number(s: &str) -> std::result::Result<u32, String> {
    parse_number(s).ok_or_else(|| format!("invalid number: {}", s))
}

fn open_input(path: Option<&Path>) -> Result<Box<dyn Read>> {
    Ok(match path {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("{}: cannot open", path.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    })
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("{}: cannot create", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

fn load_config(path: Option<&Path>) -> Result<ToolConfig> {
    match path {
        Some(path) => ToolConfig::load_from_file(path)
            .with_context(|| format!("{}: invalid configuration", path.display())),
        None => Ok(ToolConfig::default()),
    }
}

fn open_session(config: ToolConfig) -> Result<Session> {
    let transport = NusbTransport::open()
        .context("cannot open device")?
        .with_timeout(config.transfer_timeout_ms);
    info!("interface claimed");
    Ok(DeviceSession::with_observer(
        transport,
        config,
        Arc::new(StderrProgress),
    ))
}

fn read_package(path: &Path) -> Result<BootPackage> {
    let file = std::fs::read(path).with_context(|| format!("{}: cannot read", path.display()))?;
    BootPackage::parse(&file).with_context(|| format!("{}: not a boot package", path.display()))
}

/// Offset and size of a range argument, resolving partition names.
fn resolve(session: &mut Session, target: &str, count: Option<u32>) -> Result<(u32, u32)> {
    match count {
        Some(count) => Ok((number(target).map_err(anyhow::Error::msg)?, count)),
        None => Ok(session.resolve_partition(target)?),
    }
}

fn report(transfer: Transfer) {
    if transfer.truncated {
        info!("premature end-of-file reached.");
    }
}

fn report_unpack(outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Ok => {
            info!("Done!");
            Ok(())
        }
        Outcome::Warning(reason) => {
            warn!("Done with warnings: {}", reason);
            Ok(())
        }
        Outcome::Fatal(reason) => bail!(reason),
    }
}

fn run(args: Args) -> Result<()> {
    // Offline commands never open a device.
    match &args.command {
        Command::UnpackFw { file, directory } => {
            return report_unpack(unpack_file(file, directory, None, &[ContainerKind::Firmware]));
        }
        Command::UnpackImg {
            file,
            output,
            directory,
        } => {
            return report_unpack(unpack_file(
                file,
                directory,
                output.as_deref(),
                &[
                    ContainerKind::Kernel,
                    ContainerKind::Loader,
                    ContainerKind::Resource,
                ],
            ));
        }
        _ => {}
    }

    let config = load_config(args.config.as_deref())?;
    let mut session = open_session(config)?;
    info!(mode = %session.mode(), "bcdUSB {:04x}", session.transport().usb_version());

    // Maskrom bring-up goes over the control pipe, not the loader protocol.
    match &args.command {
        Command::LoadDdr { file } | Command::LoadUsbplug { file } => {
            let code = if matches!(args.command, Command::LoadDdr { .. }) {
                info!("load DDR init");
                rkflash_core::protocol::LOAD_CODE_471
            } else {
                info!("load USB loader");
                rkflash_core::protocol::LOAD_CODE_472
            };
            let bin =
                std::fs::read(file).with_context(|| format!("{}: cannot read", file.display()))?;
            session.load_vendor_code(code, &bin)?;
            return Ok(());
        }
        Command::DownloadBoot { loader } => {
            let package = read_package(loader)?;
            session.download_boot(&package)?;
            return Ok(());
        }
        _ => {}
    }

    if session.mode() == UsbMode::Maskrom {
        warn!("device is in MASK ROM MODE, load a USB loader first");
    }
    session.test_unit_ready()?;

    match args.command {
        Command::Reboot { flag } => {
            let flag = u8::try_from(flag).context("reboot flag must fit in one byte")?;
            session.reset(flag)?;
        }
        Command::InstallLoader { loader } => {
            let package = read_package(&loader)?;
            session.install_loader(&package)?;
        }
        Command::ChipVersion => {
            let version = session.read_chip_version()?;
            info!("chip version: {}", version);
        }
        Command::FlashInfo => {
            let id = session.read_flash_id()?;
            info!("Flash ID: {}", id);
            let nand = session.read_nand_info()?;
            info!("{}", nand);
        }
        Command::ReadIdb {
            offset,
            count,
            output,
        } => {
            let mut out = open_output(output.as_deref())?;
            session.read_idb(offset, count, &mut *out)?;
        }
        Command::WriteIdb {
            offset,
            count,
            input,
        } => {
            let mut input = open_input(input.as_deref())?;
            report(session.write_idb(offset, count, &mut *input)?);
        }
        Command::ReadRam {
            addr,
            length,
            output,
        } => {
            let mut out = open_output(output.as_deref())?;
            session.read_ram(addr, length, &mut *out)?;
        }
        Command::WriteRam {
            addr,
            length,
            input,
        } => {
            let mut input = open_input(input.as_deref())?;
            report(session.write_ram(addr, length, &mut *input)?);
        }
        Command::ExecRam {
            kernel_addr,
            param_addr,
        } => {
            session.exec_sdram(kernel_addr, param_addr)?;
        }
        Command::Read { range, output } => {
            let (offset, size) = resolve(&mut session, &range.target, range.count)?;
            let mut out = open_output(output.as_deref())?;
            session.read_flash(offset, size, &mut *out)?;
        }
        Command::Write { range, input } => {
            let (offset, size) = resolve(&mut session, &range.target, range.count)?;
            let mut input = open_input(input.as_deref())?;
            report(session.write_flash(offset, size, &mut *input)?);
        }
        Command::Erase {
            target,
            count,
            all,
            fast,
        } => {
            let mode = if fast {
                EraseMode::Fast
            } else {
                EraseMode::Overwrite
            };
            match target {
                Some(target) if !all => {
                    let (offset, size) = resolve(&mut session, &target, count)?;
                    session.erase_flash(offset, size, mode)?;
                }
                _ => session.erase_all(mode)?,
            }
        }
        Command::Dump { output } => {
            let mut out = open_output(output.as_deref())?;
            session.dump_flash(&mut *out)?;
        }
        Command::GetParams { output } => {
            let payload = session.read_parameters()?;
            let mut out = open_output(output.as_deref())?;
            out.write_all(&payload).context("Write error! Disk full?")?;
            out.flush().context("Write error! Disk full?")?;
        }
        Command::PutParams { input } => {
            let mut payload = Vec::new();
            open_input(input.as_deref())?
                .read_to_end(&mut payload)
                .context("read error")?;
            session.write_parameters(&payload)?;
        }
        Command::LoadDdr { .. }
        | Command::LoadUsbplug { .. }
        | Command::DownloadBoot { .. }
        | Command::UnpackFw { .. }
        | Command::UnpackImg { .. } => {}
    }

    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("rkflashtool v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
