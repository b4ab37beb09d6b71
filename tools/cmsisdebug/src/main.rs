use std::error::Error;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use cli::{Args, Command};
use cmsisdebug_common::Transport;
use cmsisdebug_engine::commands::InfoId;
use cmsisdebug_engine::sim::SimProbe;
use cmsisdebug_hid::HidTransport;
use cmsisdebug_session::{ProbeClassifier, Session, SessionConfig, VendorAllowList};

mod cli;
mod number;

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<SessionConfig, Box<dyn Error>> {
    let mut config = SessionConfig::load(args.config.as_deref())?;
    if let Some(clock_hz) = args.clock_hz {
        config.swd.clock_hz = clock_hz;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.usb.timeout_ms = timeout_ms;
    }
    // An explicitly requested vendor is trusted to be a probe
    if let Some(vid) = args.vid {
        if !config.probe.allowed_vendors.contains(&vid) {
            config.probe.allowed_vendors.push(vid);
        }
    }
    config.validate()?;
    Ok(config)
}

fn matches_filter(args: &Args, transport: &HidTransport) -> bool {
    let descriptor = transport.descriptor();
    args.vid.map_or(true, |vid| vid == descriptor.vendor_id)
        && args.pid.map_or(true, |pid| pid == descriptor.product_id)
}

fn list(args: &Args, config: &SessionConfig) -> Result<(), Box<dyn Error>> {
    let classifier = VendorAllowList::new(config.probe.allowed_vendors.clone());
    if args.sim {
        let mut probe = SimProbe::default();
        let verdict = classifier.classify_descriptor(&probe.descriptor());
        let strings = probe.descriptor_strings();
        println!(
            "sim {:04x}:{:04x} {} [{}]",
            SimProbe::VENDOR_ID,
            SimProbe::PRODUCT_ID,
            strings.map(|s| s.to_string()).unwrap_or_default(),
            if verdict { "probe" } else { "not a probe" }
        );
        return Ok(());
    }
    for mut transport in HidTransport::list(config.usb_timeout())? {
        if !matches_filter(args, &transport) {
            continue;
        }
        let verdict = classifier.classify_descriptor(&transport.descriptor());
        let strings = transport.descriptor_strings();
        println!(
            "{transport} {} [{}]",
            strings.map(|s| s.to_string()).unwrap_or_default(),
            if verdict { "probe" } else { "not a probe" }
        );
    }
    Ok(())
}

fn find_probe(args: &Args, config: &SessionConfig) -> Result<Box<dyn Transport>, Box<dyn Error>> {
    if args.sim {
        return Ok(Box::new(SimProbe::default()));
    }
    let classifier = VendorAllowList::new(config.probe.allowed_vendors.clone());
    let mut candidates = HidTransport::list(config.usb_timeout())?
        .into_iter()
        .filter(|t| matches_filter(args, t) && classifier.classify_descriptor(&t.descriptor()));
    let probe = candidates.next().ok_or("no CMSIS-DAP probe found")?;
    if candidates.next().is_some() {
        log::warn!("several probes found, using {probe}");
    }
    Ok(Box::new(probe))
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;
    if let Command::List = args.command {
        return list(&args, &config);
    }

    let transport = find_probe(&args, &config)?;
    let mut session = Session::new(config);
    let description = session.open(transport)?;
    println!("Probe: {description}");
    let report = session.connect()?;

    let result = execute(&mut session, args.command, &report);
    session.disconnect();
    result
}

fn execute(
    session: &mut Session<Box<dyn Transport>>,
    command: Command,
    report: &str,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::List => {}
        Command::Info => {
            println!("{report}");
            if let Some(dap) = session.engine() {
                for (label, id) in [
                    ("Vendor", InfoId::Vendor),
                    ("Product", InfoId::Product),
                    ("Serial", InfoId::SerialNumber),
                ] {
                    println!("{label}: {}", dap.info_string(id)?);
                }
                println!("Capabilities: {:?}", dap.capabilities()?);
                if let Some(size) = dap.reported_packet_size()? {
                    println!("Packet size: {size}");
                }
            }
            println!("Core: {}", session.cpu_status()?);
        }
        Command::Regs => {
            log::info!("{report}");
            println!("{}", session.core_registers()?);
        }
        Command::Read { address } => {
            let value = session.read_addr(address)?;
            println!("{address:#010x}: {value:#010x}");
        }
        Command::Write { address, value } => {
            session.write_addr(address, value)?;
            println!("{address:#010x} <- {value:#010x}");
        }
        Command::Dump {
            address,
            words,
            mut output,
        } => {
            let data = session.read_block(address, words as usize)?;
            for (i, line) in data.chunks(4).enumerate() {
                write!(output, "{:#010x}:", address.wrapping_add(16 * i as u32))?;
                for word in line {
                    write!(output, " {word:08x}")?;
                }
                writeln!(output)?;
            }
            output.flush()?;
        }
        Command::Halt => {
            session.cpu_halt()?;
            println!("Core: {}", session.cpu_status()?);
        }
        Command::Run => {
            session.cpu_run()?;
            println!("Core: {}", session.cpu_status()?);
        }
        Command::Reset => {
            let dpidr = session.cpu_reset()?;
            println!("Reset, IdCode: {dpidr:#010x}");
        }
        Command::Status => {
            println!("Core: {}", session.cpu_status()?);
        }
    }
    for line in session.session_log() {
        log::debug!("session: {line}");
    }
    Ok(())
}
