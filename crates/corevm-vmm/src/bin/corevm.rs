//! Command-line front end for the corevm core.
//!
//! # Usage
//!
//! ```bash
//! # List every versioned state class as JSON
//! corevm versions
//!
//! # Halt, wake on an external interrupt, on the simulated back end
//! corevm demo
//!
//! # Run a tiny real-mode guest on KVM that prints through COM1
//! corevm kvm-hello --config vm.json
//! ```

use std::error::Error;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use corevm::backend::sim::SimBackend;
use corevm::{
    versions, BackendKind, ExitKind, IoDirection, LatchedExtInt, MapRequest, PortHandler, RawExit,
    RunState, SegmentKind, SystemClock, Vm, VmConfig, VmEntry,
};
use log::{info, warn};
use parking_lot::Mutex;

type CliResult = Result<(), Box<dyn Error>>;

const MIB: u64 = 1 << 20;
const COM1: u16 = 0x3f8;

#[derive(Parser)]
#[command(name = "corevm")]
#[command(about = "Host-side VMM core: run loop, injection, time base and state export")]
#[command(version)]
struct Cli {
    /// VM configuration as JSON; defaults apply to missing fields.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the versioned state registry as JSON.
    Versions,

    /// Halt a simulated vCPU and wake it with an external interrupt.
    Demo {
        /// Interrupt vector to deliver.
        #[arg(long, default_value = "32")]
        vector: u8,
    },

    /// Boot a real-mode guest on KVM that prints a greeting and halts.
    KvmHello {
        /// SIPI vector; the guest code is placed at vector << 12.
        #[arg(long, default_value = "1")]
        vector: u8,

        /// Give up after this many exits returned to the caller.
        #[arg(long, default_value = "10000")]
        max_exits: u64,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Versions => print_versions(),
        Commands::Demo { vector } => demo(config, vector),
        Commands::KvmHello { vector, max_exits } => kvm_hello(config, vector, max_exits),
    });
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&str>) -> Result<VmConfig, Box<dyn Error>> {
    let Some(path) = path else {
        return Ok(VmConfig::default());
    };
    let text = fs::read_to_string(path).map_err(|e| format!("reading {path}: {e}"))?;
    Ok(serde_json::from_str(&text)?)
}

fn print_versions() -> CliResult {
    let list: Vec<_> = versions()
        .into_iter()
        .map(|v| {
            serde_json::json!({
                "class": v.class,
                "version": v.version,
                "len_expect": v.len_expect,
                "len_per_item": v.len_per_item,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&list)?);
    Ok(())
}

/// Map `len` bytes of fresh system memory at guest-physical 0.
fn add_sysmem(vm: &Vm, len: u64) -> CliResult {
    vm.alloc_segment(0, len, SegmentKind::Sysmem)?;
    vm.map(MapRequest::new(0, 0, len))?;
    Ok(())
}

fn wait_for_state(vm: &Vm, vcpu: usize, state: RunState) -> CliResult {
    let deadline = Instant::now() + Duration::from_secs(5);
    while vm.run_state(vcpu)?.0 != state {
        if Instant::now() > deadline {
            return Err(format!("vCPU {vcpu} never reached {state:?}").into());
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

// ─── demo ────────────────────────────────────────────────────────────

fn demo(config: VmConfig, vector: u8) -> CliResult {
    let backend = SimBackend::new();
    let sim = backend.handle();
    let config = VmConfig {
        backend: BackendKind::Sim,
        vcpus: 1,
        ..config
    };
    let clock = Arc::new(SystemClock::new(config.time.host_tsc_hz));
    let vm = Vm::with_backend(config, Box::new(backend), clock)?;
    add_sysmem(&vm, MIB)?;

    let pic = Arc::new(LatchedExtInt::new());
    vm.set_extint_source(Some(pic.clone()));
    vm.set_run_state(0, RunState::InitPendingSipi, 0)?;
    sim.push_exit(0, RawExit::Hlt { interrupts_enabled: true });

    let runner = {
        let vm = Arc::clone(&vm);
        thread::spawn(move || vm.run(0, VmEntry::default()))
    };
    wait_for_state(&vm, 0, RunState::Sleeping)?;
    info!("vCPU 0 is sleeping, raising vector {vector:#x}");
    pic.raise(vector);
    vm.inject_extint(0)?;

    let exit = runner.join().map_err(|_| "vCPU thread panicked")??;
    println!("{}", serde_json::to_string(&exit)?);
    for record in sim.vcpu_records(0) {
        println!("  {record:?}");
    }
    println!("{}", serde_json::to_string_pretty(&vm.vcpu_stats(0)?)?);
    Ok(())
}

// ─── kvm-hello ───────────────────────────────────────────────────────

/// COM1 transmit register; anything else on the port range is ignored.
#[derive(Default)]
struct Serial {
    line: Mutex<Vec<u8>>,
}

impl PortHandler for Serial {
    fn read(&self, _vcpu: usize, _port: u16, _size: u8) -> u32 {
        0
    }

    fn write(&self, _vcpu: usize, _port: u16, _size: u8, value: u32) {
        let byte = value as u8;
        let mut line = self.line.lock();
        if byte == b'\n' {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(&line);
            let _ = out.write_all(b"\n");
            line.clear();
        } else {
            line.push(byte);
        }
    }
}

/// Real-mode code run with CS based at the SIPI page:
///
/// ```text
///   mov dx, 0x3f8
///   mov si, page + msg
/// next:
///   lodsb
///   test al, al
///   jz done
///   out dx, al
///   jmp next
/// done:
///   hlt
/// msg: db "Hello from corevm", 10, 0
/// ```
fn hello_image(page: u64) -> Vec<u8> {
    const MSG_OFFSET: u16 = 0x0f;
    let si = (page as u16).wrapping_add(MSG_OFFSET).to_le_bytes();
    let mut code = vec![
        0xba, 0xf8, 0x03, // mov dx, 0x3f8
        0xbe, si[0], si[1], // mov si, imm16
        0xac, // lodsb
        0x84, 0xc0, // test al, al
        0x74, 0x03, // jz +3
        0xee, // out dx, al
        0xeb, 0xf8, // jmp -8
        0xf4, // hlt
    ];
    code.extend_from_slice(b"Hello from corevm\n\0");
    code
}

fn kvm_hello(config: VmConfig, vector: u8, max_exits: u64) -> CliResult {
    let config = VmConfig {
        backend: BackendKind::Kvm,
        vcpus: 1,
        ..config
    };
    let vm = Vm::create(config)?;
    add_sysmem(&vm, MIB)?;

    let page = (vector as u64) << 12;
    vm.write_guest(page, &hello_image(page))?;
    vm.register_port(COM1, IoDirection::Out, Arc::new(Serial::default()))?;
    vm.post_sipi(0, vector)?;

    for _ in 0..max_exits {
        let exit = vm.run(0, VmEntry::default())?;
        match &exit.kind {
            ExitKind::Bogus => continue,
            ExitKind::Suspended { .. } => {
                info!("guest finished: {}", serde_json::to_string(&exit)?);
                println!("{}", serde_json::to_string_pretty(&vm.vcpu_stats(0)?)?);
                return Ok(());
            }
            kind if kind.is_terminal() => {
                return Err(format!("vCPU failed: {}", serde_json::to_string(&exit)?).into());
            }
            _ => {
                warn!("unexpected exit: {}", serde_json::to_string(&exit)?);
                return Err("guest did something the demo does not handle".into());
            }
        }
    }
    Err(format!("guest still running after {max_exits} exits").into())
}
