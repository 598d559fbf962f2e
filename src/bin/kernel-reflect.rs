//! Command-line access to the toolchain side of kernel-reflect.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use kernel_reflect::toolchain::{self, Toolchain};
use kernel_reflect::{Capability, ReflectResult};

#[derive(Parser)]
#[command(
    name = "kernel-reflect",
    version,
    about = "Inspect the machine code behind GPU kernels"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble a PTX file and print its SASS disassembly
    Sass {
        /// Input .ptx file
        input: PathBuf,
        /// Target capability (`7.5`, `75` or `sm_75`)
        #[arg(short, long)]
        capability: Capability,
        /// Path to ptxas (default: discovered)
        #[arg(long)]
        ptxas: Option<PathBuf>,
        /// Path to nvdisasm (default: discovered)
        #[arg(long)]
        nvdisasm: Option<PathBuf>,
    },
    /// Print the discovered ptxas and nvdisasm locations
    Tools,
    /// Print the toolchain target id of a capability
    Target {
        capability: Capability,
    },
}

fn cmd_sass(
    input: PathBuf,
    capability: Capability,
    ptxas: Option<PathBuf>,
    nvdisasm: Option<PathBuf>,
) -> ReflectResult<()> {
    let discovered = Toolchain::discover();
    let toolchain = Toolchain::new(
        ptxas.or(discovered.ptxas),
        nvdisasm.or(discovered.nvdisasm),
    );
    let ptx = fs::read_to_string(&input)?;
    let sass = toolchain::assemble_and_disassemble(&toolchain, &ptx, capability)?;
    print!("{}", sass);
    Ok(())
}

fn cmd_tools() {
    let toolchain = Toolchain::discover();
    println!("{}", toolchain);
    if !toolchain.is_complete() {
        println!("machine code extraction is unavailable");
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Sass {
            input,
            capability,
            ptxas,
            nvdisasm,
        } => cmd_sass(input, capability, ptxas, nvdisasm),
        Command::Tools => {
            cmd_tools();
            Ok(())
        }
        Command::Target { capability } => {
            println!("{}", capability.target_id());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
