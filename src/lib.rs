// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxHyper - the EL2 core of a bare-metal AArch64 hypervisor.
//!
//! This crate contains the three tightly coupled pieces that make a guest believe it owns
//! real hardware:
//!
//! - Stage-2 address translation ([`Stage2PageTable`]), mapping guest-physical to
//!   host-physical memory.
//! - Virtual CPU lifecycle and trap dispatch ([`AxVCpu`], [`VCpuTable`],
//!   [`AxHypervisor::handle_sync_exception`], [`AxHypervisor::handle_irq`]).
//! - The virtual GICv3 ([`VGic`]), emulating the distributor and redistributor register
//!   windows and forwarding physical interrupts through hardware list registers.
//!
//! # Features
//!
//! - State machine for vCPU lifecycle (Unused → Allocated → Ready → Running)
//! - Explicit per-core execution context instead of ambient global tables
//! - Hardware reached only through the [`AxHyperHal`], [`AxArchPerCpu`] and [`GicOps`] seams,
//!   so everything above them runs under `cargo test` on the host

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod addr; // Guest/host address types
#[macro_use]
pub mod arch; // Real AArch64 implementations of the hardware seams
pub mod config; // Platform layout and VM configuration record
mod exit; // Decoded synchronous exception reasons
pub mod gic; // Physical interrupt controller interface
mod hal; // Hardware abstraction layer interfaces
mod hypervisor; // VM factory, world switch and trap entry points
mod mmio; // MMIO trap registration and dispatch
mod percpu; // Per-CPU virtualization state management
pub mod psci; // Guest-visible power state coordination calls
mod stage2; // Stage-2 translation tables
mod test; // Unit tests
mod trap; // Exception syndrome decoding
mod vcpu; // VCpu state and the vCPU slot table
pub mod vgic; // Virtual distributor / redistributor
mod vm; // Virtual machine

// Public API exports
pub use addr::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};
pub use exit::{AxVCpuExitReason, SysRegAddr};
pub use gic::GicOps;
pub use hal::AxHyperHal;
pub use hypervisor::AxHypervisor;
pub use mmio::{AccessSize, MmioAccess, MmioContext, MmioRegion, VirtMmioDevice};
pub use percpu::*;
pub use stage2::{MemAttr, Stage2PageTable, Stage2Pte};
pub use trap::TrapSyndrome;
pub use vcpu::*;
pub use vgic::VGic;
pub use vm::AxVM;
