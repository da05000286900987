#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

use std::convert::TryFrom;
use std::error;
use std::io;
use std::io::Read;
use std::process;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use hwaccess::{AidaCpuidDump, CpuidQuery, HardwareAccess, Transfer};
use log::LevelFilter;
use regex::Regex;

use logger::StderrLogger;

mod logger;

type Result<T> = std::result::Result<T, Box<dyn error::Error>>;

/// Access MSRs, CPUID and PCI configuration space of this host.
///
/// Numbers are decimal or 0x-prefixed hexadecimal.
#[derive(Debug, Parser)]
#[command(name = "hwaccess", version)]
struct Options {
    /// Log every transfer
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Log errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Answer reads from an AIDA64 CPUID dump instead of the hardware
    /// ("-" reads it from stdin)
    #[arg(long, global = true, value_name = "FILE")]
    replay: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Options {
    fn level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::Debug
        } else if self.quiet {
            LevelFilter::Error
        } else {
            LevelFilter::Warn
        }
    }
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
enum Command {
    /// Vendor, model and logical CPU count
    Info,

    /// Logical CPU count
    Ncpu,

    /// Execute cpuid on CPU 0
    Cpuid {
        #[arg(value_parser = parse_u32)]
        leaf: u32,
        #[arg(value_parser = parse_u32)]
        subleaf: Option<u32>,
    },

    /// Read an MSR (CPU 0 by default)
    Rdmsr {
        #[arg(value_parser = parse_u32)]
        index: u32,
        #[arg(long, value_parser = parse_u32)]
        cpu: Option<u32>,
    },

    /// Write an MSR on every CPU, or only on --cpu
    Wrmsr {
        #[arg(value_parser = parse_u32)]
        index: u32,
        #[arg(value_parser = parse_number)]
        value: u64,
        #[arg(long, value_parser = parse_u32)]
        cpu: Option<u32>,
    },

    /// Read a PCI configuration register on bus 0
    Rdpci {
        #[arg(value_parser = parse_u32)]
        device: u32,
        #[arg(value_parser = parse_u32)]
        function: u32,
        #[arg(value_parser = parse_u32)]
        reg: u32,
    },

    /// Write a PCI configuration register on bus 0
    Wrpci {
        #[arg(value_parser = parse_u32)]
        device: u32,
        #[arg(value_parser = parse_u32)]
        function: u32,
        #[arg(value_parser = parse_u32)]
        reg: u32,
        #[arg(value_parser = parse_u32)]
        value: u32,
    },
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_number(input: &str) -> std::result::Result<u64, String> {
    lazy_static! {
        static ref NUMBER_RE: Regex =
            Regex::new(r"^(?:0[xX](?P<hex>[0-9a-fA-F_]+)|(?P<dec>[0-9_]+))$").expect("a valid regex");
    }

    let invalid = || format!("not a number: {:?}", input);
    let caps = NUMBER_RE.captures(input).ok_or_else(invalid)?;

    let (digits, radix) = match (caps.name("hex"), caps.name("dec")) {
        (Some(hex), _) => (hex.as_str(), 16),
        (None, Some(dec)) => (dec.as_str(), 10),
        (None, None) => return Err(invalid()),
    };

    u64::from_str_radix(&digits.replace('_', ""), radix).map_err(|_| invalid())
}

fn parse_u32(input: &str) -> std::result::Result<u32, String> {
    let value = parse_number(input)?;
    u32::try_from(value).map_err(|_| format!("{} does not fit in 32 bits", input))
}

fn replay_backend(source: &str) -> Result<Box<dyn HardwareAccess>> {
    let input_string = if source == "-" {
        let mut input_bytes = Vec::new();
        io::stdin().read_to_end(&mut input_bytes)?;
        String::from_utf8(input_bytes)?
    } else {
        fs_err::read_to_string(source)?
    };

    Ok(Box::new(AidaCpuidDump::from_str(&input_string)?))
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn native_backend() -> Result<Box<dyn HardwareAccess>> {
    Ok(Box::new(hwaccess::native()))
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
fn native_backend() -> Result<Box<dyn HardwareAccess>> {
    Err("no hardware access backend for this operating system".into())
}

fn run(options: &Options) -> Result<()> {
    let hw = match &options.replay {
        Some(source) => replay_backend(source)?,
        None => native_backend()?,
    };

    execute(&*hw, &options.command)
}

fn execute(hw: &dyn HardwareAccess, command: &Command) -> Result<()> {
    match *command {
        Command::Info => {
            let unknown = "Unknown".to_owned();
            println!(
                "{} {}",
                hw.vendor_name()?,
                hw.model_name()?.unwrap_or(unknown)
            );
            println!("{} logical CPUs", hw.cpu_count()?);
        }
        Command::Ncpu => println!("{}", hw.cpu_count()?),
        Command::Cpuid { leaf, subleaf } => {
            let r = hw.cpuid(CpuidQuery::new(leaf, subleaf.unwrap_or(0)))?;
            println!("{:08x}-{:08x}-{:08x}-{:08x}", r.eax, r.ebx, r.ecx, r.edx);
        }
        Command::Rdmsr { index, cpu } => {
            println!("{:#018x}", hw.read_msr_on(cpu.unwrap_or(0), index)?);
        }
        Command::Wrmsr {
            index,
            value,
            cpu: Some(cpu),
        } => {
            if let Transfer::Incomplete { .. } = hw.write_msr_on(cpu, index, value)? {
                println!("cpu {}: incomplete", cpu);
            }
        }
        Command::Wrmsr {
            index,
            value,
            cpu: None,
        } => {
            let report = hw.write_msr(index, value)?;
            for cpu in report.incomplete_cpus() {
                println!("cpu {}: incomplete", cpu);
            }
            info!("wrote msr {:#x} on {} cpus", index, report.cpu_count());
        }
        Command::Rdpci {
            device,
            function,
            reg,
        } => println!("{:#010x}", hw.read_pci(device, function, reg)?),
        Command::Wrpci {
            device,
            function,
            reg,
            value,
        } => {
            if let Transfer::Incomplete { .. } = hw.write_pci(device, function, reg, value)? {
                println!("incomplete");
            }
        }
    }

    Ok(())
}

/// An error and its chain of causes on one line.
fn describe(e: &dyn error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Log a failed command and map it to the process exit status.
fn exit_code(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", describe(&*e));
            1
        }
    }
}

fn main() {
    let options = Options::parse();

    if let Err(e) = StderrLogger::new(options.level()).init() {
        eprintln!("hwaccess: {}", e);
    }

    process::exit(exit_code(run(&options)));
}
