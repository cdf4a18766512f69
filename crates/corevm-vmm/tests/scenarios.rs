//! End-to-end scenarios on the simulated back end.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use corevm::backend::sim::{SimBackend, SimHandle, SimRecord};
use corevm::data::DataRequest;
use corevm::memory::{MAP_FLAG_IOMMU, PAGE_SIZE};
use corevm::time::ManualClock;
use corevm::{
    versions, BackendKind, DataError, Event, ExitKind, LatchedExtInt, MapRequest, MemoryError,
    RawExit, RunState, SegmentKind, SuspendReason, SuspendSource, TimeConfig,
    UnhandledMsrPolicy, Vm, VmConfig, VmEntry, VmError,
};
use corevm_data::{field_entries, FieldEntry, CLASS_MSR, FIELD_ENTRY_SIZE, VERSION_1};

const GHZ: u64 = 1_000_000_000;
const MIB: u64 = 1 << 20;
const MSR_MTRR_VAR_BASE: u32 = 0x200;
const MTRR_VAR_COUNT: u32 = 10;

fn sim_vm(config: VmConfig) -> (Arc<Vm>, SimHandle) {
    let backend = SimBackend::new();
    let sim = backend.handle();
    let clock = Arc::new(ManualClock::new(GHZ));
    clock.set_wall_ns(1_700_000_000 * GHZ);
    let config = VmConfig {
        backend: BackendKind::Sim,
        time: TimeConfig { guest_tsc_hz: GHZ, host_tsc_hz: GHZ },
        ..config
    };
    let vm = Vm::with_backend(config, Box::new(backend), clock).unwrap();
    (vm, sim)
}

fn wait_for(vm: &Vm, vcpu: usize, state: RunState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while vm.run_state(vcpu).unwrap().0 != state {
        assert!(Instant::now() < deadline, "vCPU {vcpu} never reached {state:?}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn spawn_run(vm: &Arc<Vm>, vcpu: usize) -> thread::JoinHandle<Result<corevm::VmExit, VmError>> {
    let vm = Arc::clone(vm);
    thread::spawn(move || vm.run(vcpu, VmEntry::default()))
}

#[test]
fn halted_vcpu_wakes_for_external_interrupt() {
    let (vm, sim) = sim_vm(VmConfig::default());
    vm.alloc_segment(0, MIB, SegmentKind::Sysmem).unwrap();
    vm.map(MapRequest::new(0, 0, MIB)).unwrap();
    let pic = Arc::new(LatchedExtInt::new());
    vm.set_extint_source(Some(pic.clone()));
    vm.set_run_state(0, RunState::InitPendingSipi, 0).unwrap();
    sim.push_exit(0, RawExit::Hlt { interrupts_enabled: true });

    let runner = spawn_run(&vm, 0);
    wait_for(&vm, 0, RunState::Sleeping);
    pic.raise(0x20);
    vm.inject_extint(0).unwrap();

    let exit = runner.join().unwrap().unwrap();
    assert!(matches!(exit.kind, ExitKind::Unhandled { .. }));
    assert_eq!(vm.run_state(0).unwrap().0, RunState::Running);

    // The interrupt goes in before the entry that follows the wake.
    let records = sim.vcpu_records(0);
    let injected = records
        .iter()
        .position(|r| *r == SimRecord::Injected { vcpu: 0, event: Event::External { vector: 0x20 } })
        .expect("extint was injected");
    let last_entry = records
        .iter()
        .rposition(|r| *r == SimRecord::Entered { vcpu: 0 })
        .unwrap();
    assert!(injected < last_entry);
    let entries = records.iter().filter(|r| matches!(r, SimRecord::Entered { .. })).count();
    assert_eq!(entries, 2);

    let stats = vm.vcpu_stats(0).unwrap();
    assert_eq!(stats.counters.halts, 1);
    assert_eq!(stats.counters.extints_delivered, 1);
}

#[test]
fn overlapping_mapping_is_rejected_without_side_effects() {
    let (vm, sim) = sim_vm(VmConfig::default());
    vm.alloc_segment(0, 2 * MIB, SegmentKind::Sysmem).unwrap();
    vm.map(MapRequest::new(0, 0, MIB)).unwrap();
    let before = vm.mappings();
    let slots = sim.slots();

    let overlapping = MapRequest {
        segoff: MIB,
        ..MapRequest::new(MIB / 2, 0, MIB)
    };
    let err = vm.map(overlapping).unwrap_err();
    assert!(matches!(err, VmError::Memory(MemoryError::Overlap { .. })), "{err}");
    assert_eq!(vm.mappings(), before);
    assert_eq!(sim.slots(), slots);
}

#[test]
fn destroy_releases_iommu_mappings() {
    let (vm, sim) = sim_vm(VmConfig::default());
    vm.alloc_segment(0, MIB, SegmentKind::Sysmem).unwrap();
    vm.alloc_segment(1, MIB, SegmentKind::Device { name: Some("fb".into()), file: None })
        .unwrap();
    vm.map(MapRequest::new(0, 0, MIB)).unwrap();
    vm.map(MapRequest { flags: MAP_FLAG_IOMMU, ..MapRequest::new(0x1000_0000, 1, MIB) })
        .unwrap();
    assert_eq!(vm.mappings().len(), 2);
    assert!(vm.is_sysmem(0x8000));
    assert!(!vm.is_sysmem(0x1000_0000));
    assert_eq!(vm.sysmem_max_addr(), MIB);

    vm.destroy().unwrap();
    assert!(sim.slots().is_empty());
    assert!(matches!(vm.run(0, VmEntry::default()), Err(VmError::Destroyed)));
    assert!(matches!(
        vm.alloc_segment(2, PAGE_SIZE, SegmentKind::Sysmem),
        Err(VmError::Destroyed)
    ));
    assert!(matches!(vm.map(MapRequest::new(0, 0, PAGE_SIZE)), Err(VmError::Destroyed)));
    assert!(vm.mappings().is_empty());
}

#[test]
fn out_of_range_mtrr_write_is_unhandled_and_leaves_bank_alone() {
    let (vm, sim) = sim_vm(VmConfig {
        msr_policy: UnhandledMsrPolicy::Exit,
        ..VmConfig::default()
    });
    vm.set_run_state(0, RunState::InitPendingSipi, 0).unwrap();
    let req = DataRequest::vcpu(CLASS_MSR, VERSION_1, 0);
    let mut before = vec![0u8; 64 * FIELD_ENTRY_SIZE];
    let n = vm.data_read(&req, &mut before).unwrap();
    before.truncate(n);

    let past_end = MSR_MTRR_VAR_BASE + 2 * MTRR_VAR_COUNT;
    sim.push_exit(0, RawExit::Wrmsr { msr: past_end, value: 0x6 });
    let exit = vm.run(0, VmEntry::default()).unwrap();
    assert_eq!(exit.kind, ExitKind::Wrmsr { msr: past_end, value: 0x6 });

    let mut after = vec![0u8; n];
    vm.data_read(&req, &mut after).unwrap();
    assert_eq!(after, before);
}

/// Pick the selector each class accepts: VM-wide first, else vCPU 0.
fn selector(vm: &Vm, class: u16, version: u16) -> DataRequest {
    let vm_req = DataRequest::vm(class, version);
    match vm.data_read(&vm_req, &mut []) {
        Err(DataError::BadScope { .. }) => DataRequest::vcpu(class, version, 0),
        _ => vm_req,
    }
}

fn read_exact(vm: &Vm, req: &DataRequest) -> Vec<u8> {
    let required = match vm.data_read(req, &mut []) {
        Ok(0) => 0,
        Err(DataError::Space { required }) => required,
        other => panic!("class {}: unexpected {other:?}", req.class),
    };
    let mut buf = vec![0; required];
    assert_eq!(vm.data_read(req, &mut buf).unwrap(), required);
    buf
}

#[test]
fn every_class_round_trips_and_rejects_short_writes() {
    let (vm, _sim) = sim_vm(VmConfig { vcpus: 2, ..VmConfig::default() });
    vm.inject_nmi(1).unwrap();

    for entry in versions() {
        let req = selector(&vm, entry.class, entry.version);
        let state = read_exact(&vm, &req);
        assert!(!state.is_empty(), "class {} exported nothing", entry.class);
        if entry.len_expect != 0 {
            assert_eq!(state.len(), entry.len_expect as usize);
        }

        vm.data_write(&req, &state).unwrap();
        assert_eq!(read_exact(&vm, &req), state, "class {} changed on write-back", entry.class);

        let short = &state[..state.len() - 1];
        assert_eq!(
            vm.data_write(&req, short),
            Err(DataError::Space { required: state.len() }),
            "class {}",
            entry.class
        );
        assert_eq!(read_exact(&vm, &req), state);
    }
}

#[test]
fn msr_state_migrates_between_vms() {
    let (src, _) = sim_vm(VmConfig::default());
    let (dst, _) = sim_vm(VmConfig::default());
    let req = DataRequest::vcpu(CLASS_MSR, VERSION_1, 0);

    let mut update = [0u8; FIELD_ENTRY_SIZE];
    FieldEntry::new(MSR_MTRR_VAR_BASE, 0x8000_0006).encode(&mut update).unwrap();
    src.data_write(&req, &update).unwrap();

    let state = read_exact(&src, &req);
    dst.data_write(&req, &state).unwrap();
    let migrated: Vec<FieldEntry> = field_entries(&read_exact(&dst, &req)).collect();
    assert!(migrated.contains(&FieldEntry::new(MSR_MTRR_VAR_BASE, 0x8000_0006)));
}

#[test]
fn shutdown_suspends_every_vcpu_and_reinit_recovers() {
    let (vm, sim) = sim_vm(VmConfig { vcpus: 2, ..VmConfig::default() });
    vm.set_run_state(0, RunState::InitPendingSipi, 0).unwrap();
    vm.set_run_state(1, RunState::InitPendingSipi, 0).unwrap();
    sim.push_exit(1, RawExit::Hlt { interrupts_enabled: true });

    let sleeper = spawn_run(&vm, 1);
    wait_for(&vm, 1, RunState::Sleeping);

    sim.push_exit(0, RawExit::Shutdown);
    let exit = vm.run(0, VmEntry::default()).unwrap();
    let suspended = ExitKind::Suspended {
        reason: SuspendReason::TripleFault,
        source: SuspendSource::Vcpu(0),
    };
    assert_eq!(exit.kind, suspended);
    assert_eq!(sleeper.join().unwrap().unwrap().kind, suspended);

    vm.reinit().unwrap();
    assert_eq!(vm.suspend_state(), None);
    for id in 0..2 {
        assert_eq!(vm.run_state(id).unwrap(), (RunState::Init, 0));
    }
    assert!(!vm.nmi_pending(0).unwrap());
}

#[test]
fn explicit_suspend_wakes_sleepers() {
    let (vm, sim) = sim_vm(VmConfig::default());
    vm.set_run_state(0, RunState::InitPendingSipi, 0).unwrap();
    sim.push_exit(0, RawExit::Hlt { interrupts_enabled: true });
    let runner = spawn_run(&vm, 0);
    wait_for(&vm, 0, RunState::Sleeping);

    vm.suspend(SuspendReason::Poweroff, SuspendSource::Vm).unwrap();
    let exit = runner.join().unwrap().unwrap();
    assert_eq!(
        exit.kind,
        ExitKind::Suspended { reason: SuspendReason::Poweroff, source: SuspendSource::Vm }
    );
    assert!(matches!(
        vm.suspend(SuspendReason::Reset, SuspendSource::Vcpu(0)),
        Err(VmError::AlreadySuspended { reason: SuspendReason::Poweroff, .. })
    ));
}

#[test]
fn application_processor_waits_for_its_sipi() {
    let (vm, sim) = sim_vm(VmConfig { vcpus: 2, ..VmConfig::default() });
    let ap = spawn_run(&vm, 1);
    thread::sleep(Duration::from_millis(20));
    assert!(!ap.is_finished(), "AP must park until started");
    assert_eq!(vm.run_state(1).unwrap().0, RunState::Init);

    assert!(vm.post_sipi(1, 0x9a).unwrap());
    let exit = ap.join().unwrap().unwrap();
    assert!(matches!(exit.kind, ExitKind::Unhandled { .. }));
    assert_eq!(exit.rip, 0x9a000);
    assert_eq!(sim.vcpu_records(1)[0], SimRecord::Reset { vcpu: 1, vector: 0x9a });

    // A second SIPI outside INIT is ignored.
    assert!(!vm.post_sipi(1, 0x10).unwrap());
}

#[test]
fn init_while_running_parks_the_vcpu_again() {
    let (vm, sim) = sim_vm(VmConfig::default());
    vm.set_run_state(0, RunState::InitPendingSipi, 0).unwrap();
    sim.push_exit(0, RawExit::Hlt { interrupts_enabled: true });
    let runner = spawn_run(&vm, 0);
    wait_for(&vm, 0, RunState::Sleeping);

    vm.post_init(0).unwrap();
    wait_for(&vm, 0, RunState::Init);
    vm.terminate_vcpu(0).unwrap();
    let exit = runner.join().unwrap().unwrap();
    assert_eq!(exit.kind, ExitKind::Bogus);
    assert_eq!(vm.run_state(0).unwrap(), (RunState::Init, 0));
}
