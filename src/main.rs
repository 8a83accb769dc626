use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use ftisp::{
    format, Error, ExitSpec, FtdiTransport, MemoryKind, Part, PartDB, PinAssignment,
    PortSelector, Session, SessionConfig,
};

#[derive(Parser)]
#[command(
    name = "ftisp",
    version,
    about = "AVR in-system programmer for FT232R/FT245R/FT2232H bit-bang adapters"
)]
struct Cli {
    /// FTDI device: ft0 - ft9, or a USB description or serial number
    #[arg(short = 'P', long, default_value = "ft0")]
    port: PortSelector,

    /// Part id, e.g. t85, m328p
    #[arg(short, long)]
    part: String,

    /// Bit clock period in microseconds
    #[arg(short = 'B', long)]
    bitclock: Option<f64>,

    /// State of RESET on exit: reset (release) or noreset (keep asserted)
    #[arg(short = 'E', long, default_value = "")]
    exit: ExitSpec,

    /// Pin assignment, e.g. sck=2,mosi=0,miso=1,reset=4,rdy=9,pgm=10
    #[arg(long, default_value = "")]
    pins: PinAssignment,

    /// USB latency timer in milliseconds
    #[arg(long, default_value_t = 2)]
    latency: u8,

    /// More output, repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read the device signature
    Info,
    /// Erase flash and eeprom
    Erase,
    /// Dump a memory to a file, or to the terminal
    Read {
        /// Memory name
        #[arg(short, long, default_value = "flash")]
        memory: String,
        /// Output file, format picked by extension
        path: Option<PathBuf>,
    },
    /// Program a memory from a file, then verify it
    Write {
        #[arg(short, long, default_value = "flash")]
        memory: String,
        /// Do not erase the chip before writing flash
        #[arg(long)]
        no_erase: bool,
        path: PathBuf,
    },
    /// Compare a memory against a file
    Verify {
        #[arg(short, long, default_value = "flash")]
        memory: String,
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let db = PartDB::load()?;
    let part = db.find(&cli.part)?;
    let config = SessionConfig {
        pins: cli.pins,
        bitclock: cli.bitclock.map_or(0.0, |us| us / 1_000_000.0),
        latency: cli.latency,
        exit: cli.exit,
    };

    if FtdiTransport::scan_devices()? == 0 {
        anyhow::bail!("No FTDI device found");
    }
    let transport = FtdiTransport::open(&cli.port, config.latency_ms())?;
    let mut session = Session::open(transport, config).map_err(exit_if_fatal)?;

    if let Err(err) = run(&mut session, &db, &part, &cli.command) {
        if err.downcast_ref::<Error>().is_some_and(Error::is_fatal) {
            log::error!("{:#}", err);
            // the bus is in an unknown state, leave it as it is
            std::process::exit(1);
        }
        session.close().map_err(exit_if_fatal)?;
        return Err(err);
    }
    session.close().map_err(exit_if_fatal)?;
    Ok(())
}

fn exit_if_fatal(err: Error) -> anyhow::Error {
    if err.is_fatal() {
        log::error!("{}", err);
        std::process::exit(1);
    }
    err.into()
}

fn run(
    session: &mut Session<FtdiTransport>,
    db: &PartDB,
    part: &Part,
    command: &Command,
) -> Result<()> {
    session.initialize(part)?;
    let signature = session.signature();
    log::info!("Device signature = {}", hex::encode(signature));
    if signature != part.signature {
        if let Some(found) = db.find_by_signature(signature) {
            log::warn!("Signature belongs to {}", found);
        }
        anyhow::bail!(
            "Expected signature for {} is {}",
            part.name,
            hex::encode(part.signature)
        );
    }

    match command {
        Command::Info => {
            log::info!("Part: {}", part);
            for memory in &part.memories {
                log::info!(
                    "  {:<8} {:>7} bytes, page {:>3}{}",
                    memory.name,
                    memory.size,
                    memory.page_size,
                    if memory.paged { ", paged" } else { "" }
                );
            }
        }
        Command::Erase => {
            session.chip_erase(part)?;
            log::info!("Chip erased");
        }
        Command::Read { memory, path } => {
            let memory = part.memory(memory)?;
            let mut buf = vec![0u8; memory.size];
            let n = with_progress(session, buf.len(), "Reading", |session| {
                if matches!(memory.kind, MemoryKind::Flash | MemoryKind::Eeprom) {
                    session.paged_load(part, memory, &mut buf)
                } else {
                    // fuses and lock bits, one instruction each
                    for (addr, cell) in buf.iter_mut().enumerate() {
                        *cell = session.read_byte(part, memory, addr)?;
                    }
                    Ok(buf.len())
                }
            })?;
            log::info!("Read {} bytes from {}", n, memory.name);
            match path {
                Some(path) => format::write_firmware_to_file(path, &buf)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => {
                    let mut dump = Vec::new();
                    hxdmp::hexdump(&buf, &mut dump)?;
                    println!("{}", String::from_utf8_lossy(&dump));
                }
            }
        }
        Command::Write {
            memory,
            no_erase,
            path,
        } => {
            let memory = part.memory(memory)?;
            let image = format::read_firmware_from_file(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let data = format::trim_erased(&image);
            log::info!("Firmware size: {}", data.len());

            if memory.kind == MemoryKind::Flash && !no_erase {
                session.chip_erase(part)?;
                log::info!("Chip erased");
            }
            let n = with_progress(session, data.len(), "Writing", |session| {
                session.paged_write(part, memory, data)
            })?;
            log::info!("Wrote {} bytes to {}", n, memory.name);
            verify(session, part, memory, data)?;
        }
        Command::Verify { memory, path } => {
            let memory = part.memory(memory)?;
            let image = format::read_firmware_from_file(path)
                .with_context(|| format!("reading {}", path.display()))?;
            verify(session, part, memory, format::trim_erased(&image))?;
        }
    }
    Ok(())
}

fn verify(
    session: &mut Session<FtdiTransport>,
    part: &Part,
    memory: &ftisp::Memory,
    data: &[u8],
) -> Result<()> {
    let mut buf = vec![0u8; data.len()];
    with_progress(session, data.len(), "Verifying", |session| {
        session.paged_load(part, memory, &mut buf)
    })?;
    if let Some(addr) = buf.iter().zip(data).position(|(a, b)| a != b) {
        anyhow::bail!(
            "Verify failed at {:#06x}: expected {:02x}, read {:02x}",
            addr,
            data[addr],
            buf[addr]
        );
    }
    log::info!("Verified {} bytes", data.len());
    Ok(())
}

fn with_progress<R>(
    session: &mut Session<FtdiTransport>,
    len: usize,
    message: &'static str,
    f: impl FnOnce(&mut Session<FtdiTransport>) -> ftisp::Result<R>,
) -> Result<R> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );
    pb.set_message(message);
    session.set_progress(Some(pb.clone()));
    let result = f(session);
    session.set_progress(None);
    pb.finish_and_clear();
    Ok(result?)
}
