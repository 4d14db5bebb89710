//! Feature Probe Integration Tests
//!
//! These tests validate the probe framework against simulated kernels:
//! - One trial per probe, however many callers race for it
//! - Feature boundaries follow the kernel version
//! - Broken trials surface as probe errors, never as "not supported"
//! - Probes never leave kernel objects behind

use bpf_sys::{Command, Errno};
use ebpf::{Error, Kernel};
use sim_bpf_kernel::{FaultPlan, SyscallEvent, SyscallFault};
use std::sync::{Arc, Barrier};
use std::thread;
use tests_loader::{test_bootstrap, test_bootstrap_from_profile, test_bootstrap_with_faults};

fn all_probes(kernel: &Kernel) -> Vec<Result<(), Error>> {
    vec![
        kernel.have_obj_name(),
        kernel.have_obj_name_allows_dot(),
        kernel.have_nested_maps(),
        kernel.have_map_mutability_modifiers(),
        kernel.have_mmapable_maps(),
        kernel.have_inner_maps(),
        kernel.have_no_prealloc_maps(),
        kernel.have_batch_api(),
        kernel.have_probe_read_kernel(),
        kernel.have_bpf_to_bpf_calls(),
        kernel.have_program_ext_infos(),
    ]
}

/// Test: concurrent first callers share a single trial
#[test]
fn test_concurrent_probe_runs_once() {
    let (sim, kernel) = test_bootstrap(6, 1);
    let kernel = Arc::new(kernel);
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let kernel = Arc::clone(&kernel);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                kernel.have_batch_api()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    assert_eq!(sim.invocations(Command::MapCreate), 1);
    assert_eq!(sim.invocations(Command::MapUpdateBatch), 1);
    assert_eq!(kernel.features().trial_runs(), 1);
    assert_eq!(sim.live_objects(), 0);
}

/// Test: concurrent callers of an unsupported feature all see the same answer
#[test]
fn test_concurrent_unsupported_outcome_is_shared() {
    let (sim, kernel) = test_bootstrap(5, 1);
    let kernel = Arc::new(kernel);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let kernel = Arc::clone(&kernel);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                kernel.have_obj_name_allows_dot()
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().all(|r| r == &results[0]));
    assert!(results[0].as_ref().unwrap_err().is_not_supported());

    // One trial for names, one for dots.
    assert_eq!(sim.invocations(Command::MapCreate), 2);
}

/// Test: every probe is unsupported on a kernel older than all features
#[test]
fn test_ancient_kernel_supports_nothing() {
    let (sim, kernel) = test_bootstrap(4, 4);
    for result in all_probes(&kernel) {
        let err = result.unwrap_err();
        assert!(err.is_not_supported(), "unexpected error: {err}");
    }
    assert_eq!(sim.live_objects(), 0);
}

/// Test: each probe flips exactly at its minimum version
#[test]
fn test_probe_boundaries() {
    type Probe = fn(&Kernel) -> Result<(), Error>;
    let cases: [(&str, (u32, u32), (u32, u32), Probe); 11] = [
        ("object names", (4, 14), (4, 15), Kernel::have_obj_name),
        ("dot in object names", (5, 1), (5, 2), Kernel::have_obj_name_allows_dot),
        ("nested maps", (4, 11), (4, 12), Kernel::have_nested_maps),
        ("read- and write-only maps", (5, 1), (5, 2), Kernel::have_map_mutability_modifiers),
        ("mmapable maps", (5, 4), (5, 5), Kernel::have_mmapable_maps),
        ("inner maps", (5, 9), (5, 10), Kernel::have_inner_maps),
        ("prealloc maps", (4, 5), (4, 6), Kernel::have_no_prealloc_maps),
        ("map batch api", (5, 5), (5, 6), Kernel::have_batch_api),
        ("bpf_probe_read_kernel", (5, 4), (5, 5), Kernel::have_probe_read_kernel),
        ("bpf2bpf calls", (4, 15), (4, 16), Kernel::have_bpf_to_bpf_calls),
        ("program ext_infos", (4, 20), (5, 0), Kernel::have_program_ext_infos),
    ];

    for (name, before, since, probe) in cases {
        let (_, older) = test_bootstrap(before.0, before.1);
        let err = probe(&older).unwrap_err();
        assert!(err.is_not_supported(), "{name} on {before:?}: {err}");
        assert!(err.to_string().starts_with(name));

        let (sim, newer) = test_bootstrap(since.0, since.1);
        assert_eq!(probe(&newer), Ok(()), "{name} on {since:?}");
        assert_eq!(sim.live_objects(), 0);
    }
}

/// Test: an unexpected error is a probe failure, and it is cached
#[test]
fn test_probe_failure_is_not_unsupported() {
    let plan = FaultPlan::new().with_fault(SyscallFault::FailCommand {
        command: Command::MapCreate,
        count: 1,
        errno: Errno::ENOMEM,
    });
    let (sim, kernel) = test_bootstrap_with_faults(plan);

    let err = kernel.have_mmapable_maps().unwrap_err();
    assert!(!err.is_not_supported());
    assert_eq!(
        err,
        Error::FeatureProbe {
            feature: "mmapable maps",
            source: Box::new(Error::Sys(Errno::ENOMEM)),
        }
    );
    assert_eq!(err.errno(), Some(Errno::ENOMEM));

    // The fault is used up, but the failed outcome stays.
    assert_eq!(kernel.have_mmapable_maps(), Err(err));
    assert_eq!(sim.invocations(Command::MapCreate), 1);
}

/// Test: an unprivileged caller can't tell whether anything is supported
#[test]
fn test_unprivileged_probes_fail() {
    let (sim, kernel) =
        test_bootstrap_from_profile(r#"{"version": "6.1", "unprivileged": true}"#);

    for result in all_probes(&kernel) {
        let err = result.unwrap_err();
        assert!(matches!(err, Error::FeatureProbe { .. }), "{err}");
        assert_eq!(err.errno(), Some(Errno::EPERM));
    }
    assert_eq!(sim.live_objects(), 0);
}

/// Test: a failed dependency fails the dependent probe, naming the dependency
#[test]
fn test_dependent_probe_reports_dependency_failure() {
    let plan = FaultPlan::new().with_fault(SyscallFault::FailNext {
        count: 1,
        errno: Errno::EAGAIN,
    });
    let (sim, kernel) = test_bootstrap_with_faults(plan);

    let err = kernel.have_obj_name_allows_dot().unwrap_err();
    assert!(matches!(err, Error::FeatureProbe { feature: "object names", .. }));
    assert_eq!(sim.invocations(Command::MapCreate), 1);
}

/// Test: objects created by successful trials are closed again
#[test]
fn test_probe_objects_are_released() {
    let (sim, kernel) = test_bootstrap(6, 1);
    for result in all_probes(&kernel) {
        result.unwrap();
    }

    let log = sim.audit_log();
    let created =
        log.count_events(|e| matches!(e, SyscallEvent::Completed { fd: Some(_), .. }));
    let closed = log.count_events(|e| matches!(e, SyscallEvent::Closed { .. }));
    assert!(created > 0);
    assert_eq!(created, closed);
    assert_eq!(sim.live_objects(), 0);
}
