use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use clio::Output;

use crate::number::{parse_u16, parse_u32};

/// Debug a Cortex-M target through a CMSIS-DAP (HID) probe over SWD
#[derive(Parser, Debug)]
#[command(version)]
pub struct Args {
    /// More logging, repeat for debug output (RUST_LOG overrides)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML configuration file
    #[arg(short, long, env = "CMSISDEBUG_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// SWD clock in Hz, overrides `swd.clock_hz`
    #[arg(long, value_parser = parse_u32, global = true)]
    pub clock_hz: Option<u32>,

    /// Only use probes with this USB vendor id
    #[arg(long, value_parser = parse_u16, global = true)]
    pub vid: Option<u16>,

    /// Only use probes with this USB product id
    #[arg(long, value_parser = parse_u16, global = true)]
    pub pid: Option<u16>,

    /// USB transfer timeout, overrides `usb.timeout_ms`
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Talk to a simulated probe and Cortex-M4 instead of USB
    #[arg(long, default_value_t = false, global = true)]
    pub sim: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List HID devices and whether they are taken for CMSIS-DAP probes
    List,
    /// Connect and print probe and target identification
    Info,
    /// Print PC, LR and SP
    Regs,
    /// Read one word of target memory
    Read {
        #[arg(value_parser = parse_u32)]
        address: u32,
    },
    /// Write one word of target memory
    Write {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        value: u32,
    },
    /// Read a block of words
    Dump {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        words: u32,
        /// Where to write the dump, `-` for stdout
        #[arg(short, long, value_parser, default_value = "-")]
        output: Output,
    },
    /// Halt the core
    Halt,
    /// Resume the core
    Run,
    /// Pulse nRESET and reconnect
    Reset,
    /// Print the core state from DHCSR
    Status,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn args_are_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let args =
            Args::try_parse_from(["cmsisdebug", "read", "0xE000ED00", "--sim", "--clock-hz", "1_000_000"])
                .unwrap();
        assert!(args.sim);
        assert_eq!(args.clock_hz, Some(1_000_000));
        assert!(matches!(
            args.command,
            Command::Read {
                address: 0xE000_ED00
            }
        ));
    }

    #[test]
    fn bad_numbers_are_rejected() {
        assert!(Args::try_parse_from(["cmsisdebug", "read", "0xZZ"]).is_err());
        assert!(Args::try_parse_from(["cmsisdebug", "--vid", "0x10000", "list"]).is_err());
    }
}
