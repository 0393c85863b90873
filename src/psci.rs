//! Power State Coordination Interface calls made by guests.

use axerrno::{ax_err, AxResult};

use crate::{AxHyperHal, AxVM, GuestPhysAddr, VCpuState, VCpuTable};

pub const PSCI_VERSION: u32 = 0x8400_0000;
pub const PSCI_MIGRATE_INFO_TYPE: u32 = 0x8400_0006;
pub const PSCI_SYSTEM_OFF: u32 = 0x8400_0008;
pub const PSCI_SYSTEM_RESET: u32 = 0x8400_0009;
pub const PSCI_FEATURES: u32 = 0x8400_000a;
pub const PSCI_CPU_ON_64: u32 = 0xC400_0003;
/// `SMCCC_VERSION`, probed by guests before PSCI.
pub const SMCCC_VERSION: u32 = 0x8000_0000;

pub const PSCI_SUCCESS: i32 = 0;
pub const PSCI_NOT_SUPPORTED: i32 = -1;
pub const PSCI_INVALID_PARAMETERS: i32 = -2;
pub const PSCI_ALREADY_ON: i32 = -4;

/// A PSCI call as found in the caller's registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsciCall {
    /// `x0`
    pub function: u64,
    /// `x1`, the target CPU for `CPU_ON`.
    pub arg0: u64,
    /// `x2`, the entry point for `CPU_ON`.
    pub arg1: u64,
    /// `x3`, the context id for `CPU_ON`.
    pub arg2: u64,
}

const fn ret(code: i32) -> u64 {
    code as i64 as u64
}

/// Handles `call` made by vCPU `caller` of `vm`. Returns the value for the caller's `x0`.
pub fn handle_psci<H: AxHyperHal>(
    vm: &AxVM<H>,
    vcpus: &VCpuTable,
    caller: usize,
    call: PsciCall,
) -> AxResult<u64> {
    let function = call.function as u32;
    match function {
        PSCI_VERSION | PSCI_MIGRATE_INFO_TYPE => Ok(H::firmware_call(function, 0, 0)),
        PSCI_SYSTEM_OFF => {
            warn!("vm {}: unsupported PSCI SYSTEM_OFF", vm.id());
            Ok(ret(PSCI_NOT_SUPPORTED))
        }
        PSCI_SYSTEM_RESET => {
            warn!("vm {}: unsupported PSCI SYSTEM_RESET", vm.id());
            Ok(ret(PSCI_NOT_SUPPORTED))
        }
        PSCI_CPU_ON_64 => cpu_on::<H>(vm, vcpus, caller, call),
        PSCI_FEATURES | SMCCC_VERSION => Ok(ret(PSCI_SUCCESS)),
        _ => {
            error!("vm {}: unknown PSCI function {:#x}", vm.id(), call.function);
            ax_err!(Unsupported, "unknown PSCI function")
        }
    }
}

fn cpu_on<H: AxHyperHal>(
    vm: &AxVM<H>,
    vcpus: &VCpuTable,
    caller: usize,
    call: PsciCall,
) -> AxResult<u64> {
    let target = call.arg0 as usize;
    let entry = GuestPhysAddr::from(call.arg1 as usize);
    info!(
        "vm {}: PSCI CPU_ON vcpu {} at {:?} from vcpu {}",
        vm.id(),
        target,
        entry,
        caller
    );

    let id = match vm.vcpu_id(target) {
        Some(id) => id,
        None => {
            warn!("vm {}: CPU_ON for nonexistent vcpu {}", vm.id(), target);
            return Ok(ret(PSCI_INVALID_PARAMETERS));
        }
    };
    if target == caller {
        return Ok(ret(PSCI_ALREADY_ON));
    }

    let vcpu = vcpus.get(id)?;
    if vcpu.state() != VCpuState::Allocated {
        return Ok(ret(PSCI_ALREADY_ON));
    }
    let started = vcpu.with_state_transition(VCpuState::Allocated, VCpuState::Ready, || {
        // SAFETY: the target is `Allocated`, so no physical CPU runs it.
        let ctx = unsafe { vcpu.context_mut() };
        ctx.frame.elr = entry.as_usize() as u64;
        ctx.frame.x[0] = call.arg2;
        Ok(())
    });
    if started.is_err() {
        return Ok(ret(PSCI_ALREADY_ON));
    }

    // The physical core whose id equals the slot index picks this vcpu up.
    let res = H::firmware_call(
        PSCI_CPU_ON_64,
        id.0 as u64,
        H::secondary_entry().as_usize() as u64,
    );
    if res as i64 != PSCI_SUCCESS as i64 {
        warn!("firmware CPU_ON for core {} returned {}", id.0, res as i64);
    }
    Ok(res)
}
