// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared harness: a booted VM context over the simulated machine.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;

use neuron_vm::fault::{FaultSignal, Reaper};
use neuron_vm::hal::sim::{SimFiles, SimMachine};
use neuron_vm::mm::PAGE_SIZE;
use neuron_vm::{Pid, Prot, VmConfig, VmContext};

pub const RW: Prot = Prot::READ.union(Prot::WRITE);
pub const BASE: usize = 0x40_0000;
pub const PAGE: usize = PAGE_SIZE;

pub struct Harness {
    pub machine: Arc<SimMachine>,
    pub files: Arc<SimFiles>,
    pub ctx: VmContext,
}

pub fn boot(pages: usize) -> Harness {
    nexus_sync::set_block_hook(thread::yield_now);
    let machine = SimMachine::new(pages);
    let files = SimFiles::new();
    let ctx = VmContext::boot(
        VmConfig::default(),
        &machine.boot_info(4),
        machine.clone(),
        machine.clone(),
        files.clone(),
    )
    .expect("boot");
    Harness { machine, files, ctx }
}

/// Records kills instead of tearing processes down.
#[derive(Default)]
pub struct RecordingReaper {
    pub kills: Mutex<Vec<(Pid, FaultSignal)>>,
}

impl Reaper for RecordingReaper {
    fn kill(&self, pid: Pid, signal: FaultSignal) {
        self.kills.lock().unwrap().push((pid, signal));
    }
}
