#![deny(rust_2018_idioms, broken_intra_doc_links)]

mod macros;

use argh::FromArgs;
use bytes::Bytes;
use log::LevelFilter;
use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use udpih::ch9::Speed;
use udpih::payload::Payloads;
use udpih::recovery::{LoadError, RecoveryHeader};
use udpih::sim::Simulation;
use udpih::usb::{get_udpih_device, Presence};

#[derive(Error, Debug)]
pub enum Error {
    #[error("to access device: Permission denied.")]
    PermissionDenied,
    #[error("to find a udpih device.")]
    NoDevice,
    #[cfg(not(target_os = "linux"))]
    #[error("because the raw gadget interface only exists on Linux.")]
    Unsupported,
    #[error("to parse the recovery image: {0}")]
    BadImage(#[from] LoadError),
    #[error("{0}")]
    Udpih(#[from] udpih::Error),
    #[error("due to an I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("due an unknown usb error: {0}")]
    UnknownUsbError(#[from] rusb::Error),
}

/// USB host stack exploit device for the Wii U.
#[derive(FromArgs)]
struct Arguments {
    /// print debug logs.
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Serve(ServeArgs),
    Simulate(SimulateArgs),
    Probe(ProbeArgs),
    Recovery(RecoveryArgs),
}

/// Run the exploit device on a UDC through the raw gadget interface.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
struct ServeArgs {
    /// UDC driver name.
    #[argh(option, default = "String::from(\"dummy_udc\")")]
    driver: String,
    /// UDC device name.
    #[argh(option, default = "String::from(\"dummy_udc.0\")")]
    device: String,
    /// enumerate at high speed.
    #[argh(switch)]
    high_speed: bool,
    /// max packet size of the control endpoint.
    #[argh(option, default = "64")]
    max_packet_size: u8,
    /// heap repair data used on a high speed link.
    #[argh(option)]
    high_speed_repair: Option<PathBuf>,

    /// path to the arm kernel binary.
    #[argh(positional)]
    arm_kernel: PathBuf,
    /// path to the full speed heap repair data.
    #[argh(positional)]
    heap_repair: PathBuf,
}

/// Replay the console's enumeration against the device in memory.
#[derive(FromArgs)]
#[argh(subcommand, name = "simulate")]
struct SimulateArgs {
    /// enumerate at high speed.
    #[argh(switch)]
    high_speed: bool,
    /// heap repair data used on a high speed link.
    #[argh(option)]
    high_speed_repair: Option<PathBuf>,

    /// path to the arm kernel binary.
    #[argh(positional)]
    arm_kernel: PathBuf,
    /// path to the full speed heap repair data.
    #[argh(positional)]
    heap_repair: PathBuf,
}

/// Look for the device on this host and report its identity.
#[derive(FromArgs)]
#[argh(subcommand, name = "probe")]
struct ProbeArgs {
    /// wait until the device shows up.
    #[argh(switch, short = 'w')]
    wait: bool,
    /// override the vendor ID.
    #[argh(option, short = 'V')]
    vendor_id: Option<u16>,
    /// override the product ID.
    #[argh(option, short = 'P')]
    product_id: Option<u16>,
}

/// Inspect the header of a recovery image.
#[derive(FromArgs)]
#[argh(subcommand, name = "recovery")]
struct RecoveryArgs {
    /// path to the recovery image.
    #[argh(positional)]
    image: PathBuf,
}

fn main() {
    let args = argh::from_env::<Arguments>();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .init();

    let result = match args.command {
        Command::Serve(args) => serve(args),
        Command::Simulate(args) => simulate(args),
        Command::Probe(args) => probe(args),
        Command::Recovery(args) => inspect(args),
    };

    if let Err(err) = result {
        error!("Failed", "{}", err);
        std::process::exit(1);
    }
}

fn speed(high_speed: bool) -> Speed {
    if high_speed {
        Speed::High
    } else {
        Speed::Full
    }
}

fn load_payloads(
    arm_kernel: &Path,
    heap_repair: &Path,
    high_speed_repair: Option<&Path>,
) -> Result<Payloads, Error> {
    info!("Reading", "payloads from {:?} and {:?}...", arm_kernel, heap_repair);
    let mut payloads = Payloads::new(
        Bytes::from(std::fs::read(arm_kernel)?),
        Bytes::from(std::fs::read(heap_repair)?),
    )?;
    if let Some(path) = high_speed_repair {
        payloads = payloads.with_high_speed_repair(Bytes::from(std::fs::read(path)?))?;
    }
    ok!("Read", "{:#x} bytes of arm kernel", payloads.arm_kernel().len());

    Ok(payloads)
}

#[cfg(target_os = "linux")]
fn serve(args: ServeArgs) -> Result<(), Error> {
    use udpih::descriptor::Responder;
    use udpih::engine::{channel, ControlEngine};
    use udpih::gadget::{GadgetConfig, RawGadget};
    use udpih::timer::ThreadTimer;

    let speed = speed(args.high_speed);
    let payloads = load_payloads(
        &args.arm_kernel,
        &args.heap_repair,
        args.high_speed_repair.as_deref(),
    )?;
    if speed == Speed::High && payloads.heap_repair(Speed::High).is_none() {
        warn!("Missing", "high speed heap repair data, the last stage will stall");
    }

    let (sink, queue) = channel(8);
    let config = GadgetConfig {
        driver: args.driver,
        device: args.device,
        speed,
    };
    info!("Binding", "to {} at {:?} speed...", config.device, speed);
    let gadget = RawGadget::open(config, sink.clone())?;
    let mut engine = ControlEngine::new(
        gadget,
        ThreadTimer::new(sink),
        Responder::bind(args.max_packet_size, payloads),
    );

    engine.start()?;
    ok!("Ready", "plug the device into the console.");
    engine.run(&queue)?;

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn serve(_args: ServeArgs) -> Result<(), Error> {
    Err(Error::Unsupported)
}

fn simulate(args: SimulateArgs) -> Result<(), Error> {
    let speed = speed(args.high_speed);
    let payloads = load_payloads(
        &args.arm_kernel,
        &args.heap_repair,
        args.high_speed_repair.as_deref(),
    )?;

    info!("Simulating", "the console at {:?} speed...", speed);
    let report = Simulation::new(speed, 64, payloads).run()?;

    for enumeration in &report.enumerations {
        ok!(
            "Enumerated",
            "{:?} at address {} with {} configuration reads",
            enumeration.identity,
            enumeration.address,
            enumeration.reads.len()
        );
    }
    ok!(
        "Delivered",
        "{:#x} byte final descriptor after {:?}",
        report.final_descriptor.len(),
        report.elapsed
    );

    Ok(())
}

fn probe(args: ProbeArgs) -> Result<(), Error> {
    info!("Searching", "for a udpih device...");
    let presence = find_udpih_device(args.wait, args.vendor_id, args.product_id)?;

    match presence.identity {
        Some(identity) => {
            ok!(
                "Found",
                "{:?} on bus {} address {}",
                identity,
                presence.bus,
                presence.address
            );
        }
        None => {
            warn!(
                "Found",
                "the device between identities ({} configurations)",
                presence.num_configurations
            );
        }
    }

    Ok(())
}

fn find_udpih_device(wait: bool, vid: Option<u16>, pid: Option<u16>) -> Result<Presence, Error> {
    let get_device = || match get_udpih_device(vid, pid) {
        Ok(presence) => Ok(presence),
        Err(rusb::Error::Access) => Err(Error::PermissionDenied),
        Err(rusb::Error::NoDevice) => Err(Error::NoDevice),
        Err(e) => Err(e.into()),
    };

    let mut device = get_device();
    while wait {
        device = match device {
            Ok(_) => break,
            Err(Error::NoDevice) => {
                thread::sleep(Duration::from_millis(500));
                get_device()
            }
            Err(err) => return Err(err),
        }
    }

    device
}

fn inspect(args: RecoveryArgs) -> Result<(), Error> {
    info!("Reading", "recovery image from {:?}...", args.image);
    let image = std::fs::read(&args.image)?;
    let header = RecoveryHeader::parse(&image)?;

    ok!("Entry", "{:#010x}", header.entry);
    for (index, section) in header.sections.iter().enumerate() {
        let end = section.offset as usize + section.size as usize;
        if end > image.len() {
            warn!("Section", "{} runs past the end of the image", index);
        }
        info!(
            "Section",
            "{}: {:#x} bytes at file offset {:#x} -> paddr {:#010x}",
            index,
            section.size,
            section.offset,
            section.paddr
        );
    }
    Ok(())
}
