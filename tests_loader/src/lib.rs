//! Loader Test Utilities
//!
//! This crate provides shared utilities for cross-crate integration tests.
//!
//! ## Test Philosophy
//!
//! - **Pick the kernel**: Every test states the kernel version it runs against
//! - **Deterministic failures**: Odd error codes come from a FaultPlan, not luck
//! - **No handle leaks**: Tests check that the simulated kernel ends up empty
//! - **One trial per feature**: Probe counts are asserted through the audit log

use bpf_sys::SyscallClient;
use ebpf::Kernel;
use sim_bpf_kernel::{FaultInjector, FaultPlan, KernelProfile, KernelVersion, SimulatedKernel};
use std::sync::Arc;

/// Bootstrap helper for tests
///
/// Creates a simulated kernel of the given version and a gateway talking to
/// it. The simulated kernel is returned as well, for inspection.
pub fn test_bootstrap(major: u32, minor: u32) -> (Arc<SimulatedKernel>, Kernel) {
    boot(SimulatedKernel::with_version(KernelVersion::new(major, minor)))
}

/// Like [`test_bootstrap`], with faults injected according to `plan`
pub fn test_bootstrap_with_faults(plan: FaultPlan) -> (Arc<SimulatedKernel>, Kernel) {
    boot(SimulatedKernel::default().with_fault_injector(FaultInjector::new(plan)))
}

/// Bootstraps from a JSON kernel profile, e.g. `{"version": "5.4"}`
pub fn test_bootstrap_from_profile(json: &str) -> (Arc<SimulatedKernel>, Kernel) {
    let profile = KernelProfile::from_json(json).expect("valid kernel profile");
    boot(SimulatedKernel::new(profile))
}

fn boot(sim: SimulatedKernel) -> (Arc<SimulatedKernel>, Kernel) {
    let sim = Arc::new(sim);
    let kernel = Kernel::new(SyscallClient::new(sim.clone()));
    (sim, kernel)
}

/// Packs `u32` values the way the kernel expects map keys and values
pub fn pack_u32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}
