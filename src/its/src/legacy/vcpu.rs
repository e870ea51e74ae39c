// Copyright 2026 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use crossbeam_channel::Sender;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::its::{LpiRegistry, Redistributor, GIC_LPI_OFFSET};

// See https://developer.arm.com/documentation/ddi0595/2020-12/AArch64-Registers/ICC-IAR0-EL1--Interrupt-Controller-Interrupt-Acknowledge-Register-0
const GIC_INTID_SPURIOUS: u32 = 1023;

enum VcpuStatus {
    Running,
    Waiting,
}

struct PerCPUInterruptControllerState {
    vcpuid: u64,
    status: VcpuStatus,
    pending_irqs: VecDeque<u32>,
    wfe_sender: Option<Sender<u32>>,
    pendbaser: u64,
    lpis_enabled: bool,
}

impl PerCPUInterruptControllerState {
    fn set_irq_common(&mut self, irq: u32) {
        debug!(
            "[GICv3] SET_IRQ_COMMON vcpuid={}, irq_line={}",
            self.vcpuid, irq
        );
        // An LPI already waiting for acknowledgement is not queued twice.
        if self.pending_irqs.contains(&irq) {
            return;
        }
        self.pending_irqs.push_back(irq);

        if let VcpuStatus::Waiting = self.status {
            if let Some(sender) = self.wfe_sender.as_ref() {
                if let Err(e) = sender.send(self.vcpuid as u32) {
                    warn!("[GICv3] cannot wake up vCPU {}: {}", self.vcpuid, e);
                }
            }
            self.status = VcpuStatus::Running;
        }
    }

    fn should_wait(&mut self) -> bool {
        if self.pending_irqs.is_empty() {
            self.status = VcpuStatus::Waiting;
            return true;
        }
        false
    }

    fn has_pending_irq(&self) -> bool {
        !self.pending_irqs.is_empty()
    }

    fn get_pending_irq(&mut self) -> u32 {
        self.pending_irqs.pop_front().unwrap_or(GIC_INTID_SPURIOUS)
    }

    fn remove_irq(&mut self, irq: u32) -> bool {
        match self.pending_irqs.iter().position(|&pending| pending == irq) {
            Some(index) => {
                self.pending_irqs.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Per-vCPU redistributor state: the interrupts waiting to be acknowledged and the LPI
/// configuration the ITS delivers against.
pub struct VcpuList {
    cpu_count: u64,
    vcpus: Vec<Mutex<PerCPUInterruptControllerState>>,
    propbaser: AtomicU64,
    paused: AtomicBool,
    lpis: Mutex<Weak<LpiRegistry>>,
}

impl VcpuList {
    pub fn new(cpu_count: u64) -> Self {
        let mut vcpus = Vec::with_capacity(cpu_count as usize);
        for vcpuid in 0..cpu_count {
            vcpus.push(Mutex::new(PerCPUInterruptControllerState {
                vcpuid,
                status: VcpuStatus::Running,
                pending_irqs: VecDeque::new(),
                wfe_sender: None,
                pendbaser: 0,
                lpis_enabled: false,
            }));
        }

        Self {
            cpu_count,
            vcpus,
            propbaser: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            lpis: Mutex::new(Weak::new()),
        }
    }

    pub fn get_cpu_count(&self) -> u64 {
        self.cpu_count
    }

    pub fn set_irq_common(&self, vcpuid: u64, irq: u32) {
        assert!(vcpuid < self.cpu_count);
        self.vcpus[vcpuid as usize]
            .lock()
            .unwrap()
            .set_irq_common(irq);
    }

    pub fn register(&self, vcpuid: u64, wfe_sender: Sender<u32>) {
        assert!(vcpuid < self.cpu_count);
        self.vcpus[vcpuid as usize].lock().unwrap().wfe_sender = Some(wfe_sender);
    }

    pub fn should_wait(&self, vcpuid: u64) -> bool {
        assert!(vcpuid < self.cpu_count);
        self.vcpus[vcpuid as usize].lock().unwrap().should_wait()
    }

    pub fn has_pending_irq(&self, vcpuid: u64) -> bool {
        assert!(vcpuid < self.cpu_count);
        self.vcpus[vcpuid as usize]
            .lock()
            .unwrap()
            .has_pending_irq()
    }

    /// Acknowledges the oldest pending interrupt of `vcpuid`. Taking an LPI consumes its
    /// pending state.
    pub fn get_pending_irq(&self, vcpuid: u64) -> u32 {
        assert!(vcpuid < self.cpu_count);
        let irq = self.vcpus[vcpuid as usize]
            .lock()
            .unwrap()
            .get_pending_irq();

        if irq >= GIC_LPI_OFFSET {
            let lpis = self.lpis.lock().unwrap().upgrade();
            if let Some(lpis) = lpis {
                lpis.acknowledge(irq);
            }
        }
        irq
    }

    /// Registry whose LPIs are delivered through these vCPUs.
    pub fn set_lpi_registry(&self, lpis: &Arc<LpiRegistry>) {
        *self.lpis.lock().unwrap() = Arc::downgrade(lpis);
    }

    /// GICR_PROPBASER is shared by all redistributors.
    pub fn set_propbaser(&self, val: u64) {
        self.propbaser.store(val, Ordering::Release);
    }

    pub fn set_pendbaser(&self, vcpuid: u64, val: u64) {
        assert!(vcpuid < self.cpu_count);
        self.vcpus[vcpuid as usize].lock().unwrap().pendbaser = val;
    }

    /// GICR_CTLR.EnableLPIs
    pub fn set_lpis_enabled(&self, vcpuid: u64, enabled: bool) {
        assert!(vcpuid < self.cpu_count);
        self.vcpus[vcpuid as usize].lock().unwrap().lpis_enabled = enabled;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

impl Redistributor for VcpuList {
    fn vcpu_count(&self) -> u32 {
        self.cpu_count as u32
    }

    fn propbaser(&self) -> u64 {
        self.propbaser.load(Ordering::Acquire)
    }

    fn pendbaser(&self, vcpuid: u32) -> u64 {
        self.vcpus
            .get(vcpuid as usize)
            .map_or(0, |vcpu| vcpu.lock().unwrap().pendbaser)
    }

    fn lpis_enabled(&self, vcpuid: u32) -> bool {
        self.vcpus
            .get(vcpuid as usize)
            .map_or(false, |vcpu| vcpu.lock().unwrap().lpis_enabled)
    }

    fn queue_lpi(&self, vcpuid: u32, intid: u32) {
        match self.vcpus.get(vcpuid as usize) {
            Some(vcpu) => vcpu.lock().unwrap().set_irq_common(intid),
            None => warn!("[GICv3] LPI {} targets unknown vCPU {}", intid, vcpuid),
        }
    }

    fn dequeue_lpi(&self, vcpuid: u32, intid: u32) -> bool {
        self.vcpus
            .get(vcpuid as usize)
            .map_or(false, |vcpu| vcpu.lock().unwrap().remove_irq(intid))
    }

    // Only one party may hold the vCPUs stopped at a time.
    fn pause_vcpus(&self) -> bool {
        self.paused
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn resume_vcpus(&self) {
        self.paused.store(false, Ordering::Release);
    }
}
