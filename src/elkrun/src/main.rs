//! Example front-end: runs an unmodified static binary under the monitor
//! with full host passthrough, or attaches to a live process (demo).

mod attach;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, Level};

use vmm::debug::Debugger;
use vmm::hv::kvm::KvmHypervisor;
use vmm::syscall::SyscallHandlers;
use vmm::{Vm, VmConfig};

const DEFAULT_RES_PATH: &str = "/usr/share/elkrun";

#[derive(Parser)]
#[command(
    name = "elkrun",
    about = "Run a static binary inside a KVM guest without a kernel"
)]
struct Cli {
    /// Enable internal debug output.
    #[arg(short = 'd')]
    debug: bool,

    /// Stop at the entry point and dump state on every breakpoint instead
    /// of running freely (stand-in for the remote debug stub).
    #[arg(short = 'D')]
    debug_stub: bool,

    /// Attach to a live process instead of loading a binary (demo).
    #[arg(short = 'a', value_name = "PID", conflicts_with = "args")]
    attach: Option<i32>,

    /// The binary to run, followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(status) => ExitCode::from(status as u8),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = VmConfig {
        resource_dir: resource_dir(),
        debug: cli.debug,
        ..Default::default()
    };

    let hv = KvmHypervisor::new().context(
        "opening /dev/kvm failed; check that KVM is available and you are in the kvm group",
    )?;

    let mut vm = if let Some(pid) = cli.attach {
        attach::attach_vm(&hv, &config, pid)?
    } else {
        let Some((binary, binargs)) = cli.args.split_first() else {
            bail!("no binary given; usage: elkrun [-d] [-D] binary [args...]");
        };
        let mut argv = vec![binary.clone()];
        argv.extend_from_slice(binargs);
        let envp: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();

        let handlers = SyscallHandlers {
            bp_callback: cli.debug_stub.then_some(dump_on_breakpoint as fn(u64) -> i32),
            ..Default::default()
        };
        let mut vm = Vm::new(&hv, &config, handlers, Default::default())?;
        vm.load_binary(&PathBuf::from(binary), &argv, &envp)?;
        vm
    };

    if cli.debug_stub {
        let entry = vm.entry_point();
        if entry != 0 {
            let mut dbg = Debugger::new(&mut vm);
            dbg.insert_sw_bp(entry)?;
            info!("planted entry breakpoint at {:#x}", entry);
        }
    }

    let status = vm.run()?;
    info!("guest exited with status {}", status);
    Ok(status)
}

fn resource_dir() -> PathBuf {
    std::env::var_os("ELKRUN_RES_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RES_PATH))
}

fn dump_on_breakpoint(rip: u64) -> i32 {
    info!("breakpoint at {:#x}; continuing", rip);
    0
}
