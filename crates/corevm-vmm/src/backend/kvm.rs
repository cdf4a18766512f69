//! Linux KVM back end.
//!
//! The VM is created without an in-kernel irqchip: the core owns interrupt
//! delivery and injects every event through `KVM_SET_VCPU_EVENTS`, and asks
//! for interrupt-window exits through `kvm_run.request_interrupt_window`.
//!
//! # Kicking a running vCPU
//!
//! A kick sets a per-vCPU flag and sends `SIGRTMIN` to the vCPU thread.  The
//! signal handler sets `kvm_run.immediate_exit` through a thread-local
//! pointer that is only populated while the thread is inside
//! [`KvmVcpu::run`], so `KVM_RUN` either returns `EINTR` or is never
//! entered.  The flag covers a kick that lands before the pointer is set.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use kvm_bindings::{kvm_run, kvm_userspace_memory_region, Msrs, KVM_MEM_READONLY};
use kvm_ioctls::{Cap, Kvm, VcpuExit, VcpuFd, VmFd};
use libc::{c_int, c_void, siginfo_t};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

use super::{
    kvm_err, Backend, BackendError, Event, Kick, RawExit, Register, TscCaps, TscParams,
    VcpuContext, RFLAGS_IF,
};

/// Fractional bits of the VMX TSC multiplier.
pub const KVM_TSC_FRAC_SIZE: u32 = 48;

/// The VMX multiplier leaves 16 integer bits.
pub const KVM_TSC_MAX_RATIO: u64 = 1 << 16;

/// `IA32_TSC`
const MSR_IA32_TSC: u32 = 0x10;

/// TSS placed at the top of the 32-bit space, as KVM on VMX requires for
/// real-mode emulation.
const KVM_TSS_ADDRESS: usize = 0xfffb_d000;

thread_local! {
    static TLS_KVM_RUN: Cell<*mut kvm_run> = const { Cell::new(std::ptr::null_mut()) };
}

static KICK_HANDLER: Once = Once::new();

extern "C" fn handle_kick_signal(_: c_int, _: *mut siginfo_t, _: *mut c_void) {
    TLS_KVM_RUN.with(|cell| {
        let run = cell.get();
        if !run.is_null() {
            // SAFETY: the pointer is set only for the duration of
            // `KvmVcpu::run` on this thread, while the kvm_run mapping of the
            // owning `VcpuFd` is alive.
            unsafe { (*run).immediate_exit = 1 };
        }
    });
}

fn register_kick_handler() {
    KICK_HANDLER.call_once(|| {
        if let Err(e) = register_signal_handler(SIGRTMIN(), handle_kick_signal) {
            error!("failed to register vCPU kick handler: {e}");
        }
    });
}

/// Per-VM KVM state.
pub struct KvmBackend {
    kvm: Kvm,
    vm: VmFd,
    tsc_scaling: bool,
}

impl KvmBackend {
    pub fn new() -> Result<Self, BackendError> {
        let kvm = Kvm::new().map_err(kvm_err("open /dev/kvm"))?;
        let vm = kvm.create_vm().map_err(kvm_err("create VM"))?;
        vm.set_tss_address(KVM_TSS_ADDRESS)
            .map_err(kvm_err("set TSS address"))?;
        let tsc_scaling = kvm.check_extension(Cap::TscControl);
        register_kick_handler();
        info!("KVM back end ready (TSC scaling: {tsc_scaling})");
        Ok(Self {
            kvm,
            vm,
            tsc_scaling,
        })
    }

    pub fn kvm(&self) -> &Kvm {
        &self.kvm
    }
}

impl Backend for KvmBackend {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn create_vcpu(&self, id: usize) -> Result<Box<dyn VcpuContext>, BackendError> {
        let fd = self
            .vm
            .create_vcpu(id as u64)
            .map_err(kvm_err("create vCPU"))?;
        Ok(Box::new(KvmVcpu {
            id,
            fd,
            kick: Arc::new(KvmKick::default()),
            pending_io_in: None,
            pending_mmio_read: false,
        }))
    }

    fn map_memory(
        &self,
        slot: u32,
        gpa: u64,
        host_addr: u64,
        len: u64,
        readonly: bool,
    ) -> Result<(), BackendError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: gpa,
            memory_size: len,
            userspace_addr: host_addr,
            flags: if readonly { KVM_MEM_READONLY } else { 0 },
        };
        // SAFETY: the caller keeps the host mapping alive until the slot is
        // removed with `unmap_memory`.
        unsafe { self.vm.set_user_memory_region(region) }
            .map_err(kvm_err("set user memory region"))?;
        debug!("KVM slot {slot}: gpa {gpa:#x} len {len:#x} ro={readonly}");
        Ok(())
    }

    fn unmap_memory(&self, slot: u32) -> Result<(), BackendError> {
        // A zero-sized region deletes the slot.
        let region = kvm_userspace_memory_region {
            slot,
            ..Default::default()
        };
        // SAFETY: deleting a slot never exposes host memory.
        unsafe { self.vm.set_user_memory_region(region) }
            .map_err(kvm_err("delete user memory region"))
    }

    fn tsc_caps(&self) -> TscCaps {
        TscCaps {
            scaling: self.tsc_scaling,
            frac_size: KVM_TSC_FRAC_SIZE,
            max_ratio: KVM_TSC_MAX_RATIO,
        }
    }
}

#[derive(Default)]
struct KvmKick {
    pending: AtomicBool,
    thread: Mutex<Option<libc::pthread_t>>,
}

impl Kick for KvmKick {
    fn kick(&self) {
        self.pending.store(true, Ordering::SeqCst);
        if let Some(thread) = *self.thread.lock() {
            // SAFETY: `thread` is recorded by the vCPU thread while it is
            // inside `KvmVcpu::run` and cleared before it leaves.
            unsafe {
                libc::pthread_kill(thread, SIGRTMIN());
            }
        }
    }
}

struct KvmVcpu {
    id: usize,
    fd: VcpuFd,
    kick: Arc<KvmKick>,
    pending_io_in: Option<u8>,
    pending_mmio_read: bool,
}

impl KvmVcpu {
    fn enter(&mut self) -> Result<RawExit, BackendError> {
        let exit = match self.fd.run() {
            Ok(exit) => exit,
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                self.fd.set_kvm_immediate_exit(0);
                return Ok(RawExit::Interrupted);
            }
            Err(e) => {
                error!("vcpu{}: KVM_RUN failed: {e}", self.id);
                return Err(BackendError::Kvm { op: "run", source: e });
            }
        };

        let raw = match exit {
            VcpuExit::Hlt => RawExit::Hlt {
                interrupts_enabled: false,
            },
            VcpuExit::IoIn(port, data) => RawExit::IoIn {
                port,
                size: data.len() as u8,
            },
            VcpuExit::IoOut(port, data) => {
                let mut bytes = [0u8; 4];
                let n = data.len().min(4);
                bytes[..n].copy_from_slice(&data[..n]);
                RawExit::IoOut {
                    port,
                    size: data.len() as u8,
                    value: u32::from_le_bytes(bytes),
                }
            }
            VcpuExit::MmioRead(gpa, data) => RawExit::MmioRead {
                gpa,
                size: data.len() as u8,
            },
            VcpuExit::MmioWrite(gpa, data) => {
                let mut bytes = [0u8; 8];
                let n = data.len().min(8);
                bytes[..n].copy_from_slice(&data[..n]);
                RawExit::MmioWrite {
                    gpa,
                    size: data.len() as u8,
                    value: u64::from_le_bytes(bytes),
                }
            }
            VcpuExit::IrqWindowOpen => RawExit::InterruptWindow,
            VcpuExit::Intr => RawExit::Interrupted,
            VcpuExit::Shutdown => RawExit::Shutdown,
            VcpuExit::FailEntry(reason, _cpu) => RawExit::FailEntry { reason },
            other => RawExit::Unknown {
                detail: format!("{other:?}"),
            },
        };
        Ok(raw)
    }
}

impl VcpuContext for KvmVcpu {
    fn run(&mut self) -> Result<RawExit, BackendError> {
        *self.kick.thread.lock() = Some(unsafe { libc::pthread_self() });
        let run_ptr: *mut kvm_run = self.fd.get_kvm_run();
        TLS_KVM_RUN.with(|cell| cell.set(run_ptr));

        let result = if self.kick.pending.swap(false, Ordering::SeqCst) {
            Ok(RawExit::Interrupted)
        } else {
            self.enter()
        };

        TLS_KVM_RUN.with(|cell| cell.set(std::ptr::null_mut()));
        *self.kick.thread.lock() = None;

        let mut result = result?;
        match result {
            RawExit::Hlt { .. } => {
                result = RawExit::Hlt {
                    interrupts_enabled: self.get_register(Register::Rflags)? & RFLAGS_IF != 0,
                };
            }
            RawExit::IoIn { size, .. } => self.pending_io_in = Some(size),
            RawExit::MmioRead { .. } => self.pending_mmio_read = true,
            _ => {}
        }
        Ok(result)
    }

    fn inject(&mut self, event: Event) -> Result<(), BackendError> {
        let mut events = self
            .fd
            .get_vcpu_events()
            .map_err(kvm_err("get vCPU events"))?;
        match event {
            Event::Exception { vector, error_code } => {
                events.exception.injected = 1;
                events.exception.nr = vector;
                events.exception.has_error_code = error_code.is_some() as u8;
                events.exception.error_code = error_code.unwrap_or(0);
            }
            Event::Nmi => events.nmi.injected = 1,
            Event::External { vector } => {
                events.interrupt.injected = 1;
                events.interrupt.nr = vector;
                events.interrupt.soft = 0;
            }
        }
        self.fd
            .set_vcpu_events(&events)
            .map_err(kvm_err("set vCPU events"))
    }

    fn request_interrupt_window(&mut self, enable: bool) -> Result<(), BackendError> {
        self.fd.get_kvm_run().request_interrupt_window = enable as u8;
        Ok(())
    }

    fn interrupts_enabled(&mut self) -> Result<bool, BackendError> {
        let rflags = self.get_register(Register::Rflags)?;
        let events = self
            .fd
            .get_vcpu_events()
            .map_err(kvm_err("get vCPU events"))?;
        Ok(rflags & RFLAGS_IF != 0 && events.interrupt.shadow == 0)
    }

    fn get_register(&mut self, reg: Register) -> Result<u64, BackendError> {
        if let Register::Cr0 | Register::Cr2 | Register::Cr3 | Register::Cr4 | Register::Efer = reg {
            let sregs = self.fd.get_sregs().map_err(kvm_err("get sregs"))?;
            return Ok(match reg {
                Register::Cr0 => sregs.cr0,
                Register::Cr2 => sregs.cr2,
                Register::Cr3 => sregs.cr3,
                Register::Cr4 => sregs.cr4,
                _ => sregs.efer,
            });
        }
        let regs = self.fd.get_regs().map_err(kvm_err("get regs"))?;
        Ok(match reg {
            Register::Rax => regs.rax,
            Register::Rbx => regs.rbx,
            Register::Rcx => regs.rcx,
            Register::Rdx => regs.rdx,
            Register::Rsi => regs.rsi,
            Register::Rdi => regs.rdi,
            Register::Rbp => regs.rbp,
            Register::R8 => regs.r8,
            Register::R9 => regs.r9,
            Register::R10 => regs.r10,
            Register::R11 => regs.r11,
            Register::R12 => regs.r12,
            Register::R13 => regs.r13,
            Register::R14 => regs.r14,
            Register::R15 => regs.r15,
            Register::Rsp => regs.rsp,
            Register::Rip => regs.rip,
            _ => regs.rflags,
        })
    }

    fn set_register(&mut self, reg: Register, value: u64) -> Result<(), BackendError> {
        if let Register::Cr0 | Register::Cr2 | Register::Cr3 | Register::Cr4 | Register::Efer = reg {
            let mut sregs = self.fd.get_sregs().map_err(kvm_err("get sregs"))?;
            match reg {
                Register::Cr0 => sregs.cr0 = value,
                Register::Cr2 => sregs.cr2 = value,
                Register::Cr3 => sregs.cr3 = value,
                Register::Cr4 => sregs.cr4 = value,
                _ => sregs.efer = value,
            }
            return self.fd.set_sregs(&sregs).map_err(kvm_err("set sregs"));
        }
        let mut regs = self.fd.get_regs().map_err(kvm_err("get regs"))?;
        let slot = match reg {
            Register::Rax => &mut regs.rax,
            Register::Rbx => &mut regs.rbx,
            Register::Rcx => &mut regs.rcx,
            Register::Rdx => &mut regs.rdx,
            Register::Rsi => &mut regs.rsi,
            Register::Rdi => &mut regs.rdi,
            Register::Rbp => &mut regs.rbp,
            Register::R8 => &mut regs.r8,
            Register::R9 => &mut regs.r9,
            Register::R10 => &mut regs.r10,
            Register::R11 => &mut regs.r11,
            Register::R12 => &mut regs.r12,
            Register::R13 => &mut regs.r13,
            Register::R14 => &mut regs.r14,
            Register::R15 => &mut regs.r15,
            Register::Rsp => &mut regs.rsp,
            Register::Rip => &mut regs.rip,
            _ => &mut regs.rflags,
        };
        *slot = value;
        self.fd.set_regs(&regs).map_err(kvm_err("set regs"))
    }

    fn complete_io_in(&mut self, value: u32) -> Result<(), BackendError> {
        let size = self
            .pending_io_in
            .take()
            .ok_or(BackendError::NoPendingCompletion)? as usize;
        let run = self.fd.get_kvm_run();
        // SAFETY: the last exit was KVM_EXIT_IO, so the `io` union member is
        // active and `data_offset` points inside the kvm_run mapping.
        unsafe {
            let offset = run.__bindgen_anon_1.io.data_offset as usize;
            let base = (run as *mut kvm_run).cast::<u8>().add(offset);
            let bytes = value.to_le_bytes();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base, size.min(4));
        }
        Ok(())
    }

    fn complete_mmio_read(&mut self, value: u64) -> Result<(), BackendError> {
        if !std::mem::take(&mut self.pending_mmio_read) {
            return Err(BackendError::NoPendingCompletion);
        }
        let run = self.fd.get_kvm_run();
        // SAFETY: the last exit was KVM_EXIT_MMIO, so the `mmio` union member
        // is active.
        unsafe {
            let mmio = &mut run.__bindgen_anon_1.mmio;
            let len = (mmio.len as usize).min(8);
            mmio.data[..len].copy_from_slice(&value.to_le_bytes()[..len]);
        }
        Ok(())
    }

    fn set_tsc(&mut self, params: TscParams) -> Result<(), BackendError> {
        let khz = (params.guest_freq / 1_000) as u32;
        if let Err(e) = self.fd.set_tsc_khz(khz) {
            // Without TSC control only the counter value can be loaded.
            warn!("vcpu{}: cannot pin TSC to {khz} kHz: {e}", self.id);
        }
        let msrs = Msrs::from_entries(&[kvm_bindings::kvm_msr_entry {
            index: MSR_IA32_TSC,
            data: params.guest_tsc,
            ..Default::default()
        }])
        .map_err(|_| BackendError::Unsupported("MSR list allocation"))?;
        self.fd.set_msrs(&msrs).map_err(kvm_err("set IA32_TSC"))?;
        Ok(())
    }

    fn reset(&mut self, vector: u8) -> Result<(), BackendError> {
        let mut sregs = self.fd.get_sregs().map_err(kvm_err("get sregs"))?;
        sregs.cs.selector = (vector as u16) << 8;
        sregs.cs.base = (vector as u64) << 12;
        sregs.cr0 &= !1;
        self.fd.set_sregs(&sregs).map_err(kvm_err("set sregs"))?;

        let mut regs = self.fd.get_regs().map_err(kvm_err("get regs"))?;
        regs.rip = 0;
        regs.rflags = 0x2;
        self.fd.set_regs(&regs).map_err(kvm_err("set regs"))?;
        self.pending_io_in = None;
        self.pending_mmio_read = false;
        Ok(())
    }

    fn kicker(&self) -> Arc<dyn Kick> {
        Arc::clone(&self.kick) as Arc<dyn Kick>
    }
}
