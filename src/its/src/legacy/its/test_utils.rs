// Copyright 2026 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared test utilities: guest memory laid out for one ITS, and command builders.

use std::sync::Arc;

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use super::cmd::{ItsCommand, ITS_CMD_SIZE};
use super::lpi::{LpiRegistry, GIC_LPI_OFFSET};
use super::{Its, Redistributor, Result};
use crate::legacy::VcpuList;

pub use super::regs::*;
pub use super::{ItsConfig, ItsCtrl, ItsError, Msi, MsiDelivery};

pub const MEM_SIZE: u64 = 0x100_0000;
/// LPI configuration table, 16 ID bits.
pub const PROPBASE: u64 = 0x10_0000;
/// Pending tables, one 64K page per vCPU.
pub const PENDBASE: u64 = 0x20_0000;
/// One 4K page, 128 commands.
pub const CMDQ_BASE: u64 = 0x40_0000;
pub const DEVICE_TABLE: u64 = 0x50_0000;
pub const COLLECTION_TABLE: u64 = 0x60_0000;
/// Level 2 page for two-level device tables.
pub const L2_PAGE: u64 = 0x70_0000;
pub const ITT_BASE: u64 = 0x80_0000;
pub const ITS_BASE: u64 = 0x0808_0000;

pub struct TestSetup {
    pub mem: GuestMemoryMmap,
    pub vcpus: Arc<VcpuList>,
    pub lpis: Arc<LpiRegistry>,
    pub config: ItsConfig,
    pub its: Its,
}

impl TestSetup {
    pub fn new(vcpu_count: u64) -> Self {
        Self::with_config(vcpu_count, ItsConfig::default())
    }

    /// An ITS with its command queue and tables set up, and enabled.
    pub fn enabled(vcpu_count: u64) -> Self {
        let setup = Self::new(vcpu_count);
        setup.enable();
        setup
    }

    pub fn with_config(vcpu_count: u64, config: ItsConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), MEM_SIZE as usize)]).unwrap();
        let vcpus = Arc::new(VcpuList::new(vcpu_count));
        vcpus.set_propbaser(PROPBASE | 15);
        for vcpuid in 0..vcpu_count {
            vcpus.set_pendbaser(vcpuid, pendbase(vcpuid));
            vcpus.set_lpis_enabled(vcpuid, true);
        }

        let redist: Arc<dyn Redistributor> = vcpus.clone();
        let lpis = Arc::new(LpiRegistry::new(mem.clone(), redist));
        vcpus.set_lpi_registry(&lpis);
        let its = Its::new(config.clone(), lpis.clone()).unwrap();
        its.set_base_address(ITS_BASE).unwrap();

        Self {
            mem,
            vcpus,
            lpis,
            config,
            its,
        }
    }

    /// Programs whatever queue and table registers are still invalid, then enables the ITS.
    pub fn enable(&self) {
        if self.read64(GITS_CBASER) & GITS_CBASER_VALID == 0 {
            self.write64(GITS_CBASER, GITS_CBASER_VALID | CMDQ_BASE);
        }
        if !Baser(self.read64(GITS_BASER)).is_valid() {
            self.write64(GITS_BASER, GITS_BASER_VALID | DEVICE_TABLE);
        }
        if !Baser(self.read64(GITS_BASER + 8)).is_valid() {
            self.write64(GITS_BASER + 8, GITS_BASER_VALID | COLLECTION_TABLE);
        }
        self.write32(GITS_CTLR, GITS_CTLR_ENABLE);
        assert!(self.its.is_enabled());
    }

    /// A second ITS on the same VM, sharing the queue and table registers of the first one.
    /// Its base address is not set.
    pub fn new_its(&self) -> Its {
        let its = Its::new(self.config.clone(), self.lpis.clone()).unwrap();
        {
            let src = self.its.cmdq.lock().unwrap();
            let mut dst = its.cmdq.lock().unwrap();
            dst.cbaser = src.cbaser;
            dst.baser_device = src.baser_device;
            dst.baser_coll = src.baser_coll;
        }
        its
    }

    /// Replaces the ITS by a fresh one with the same registers, as after a migration.
    pub fn reload_its(&mut self) {
        let its = self.new_its();
        its.set_base_address(ITS_BASE).unwrap();
        self.its = its;
    }

    pub fn read32(&self, offset: u64) -> u64 {
        let mut data = [0u8; 4];
        self.its.mmio_read(offset, &mut data);
        u64::from(u32::from_le_bytes(data))
    }

    pub fn write32(&self, offset: u64, val: u32) {
        self.its.mmio_write(offset, &val.to_le_bytes());
    }

    pub fn read64(&self, offset: u64) -> u64 {
        let mut data = [0u8; 8];
        self.its.mmio_read(offset, &mut data);
        u64::from_le_bytes(data)
    }

    pub fn write64(&self, offset: u64, val: u64) {
        self.its.mmio_write(offset, &val.to_le_bytes());
    }

    pub fn read_u64(&self, gpa: u64) -> u64 {
        self.mem.read_obj(GuestAddress(gpa)).unwrap()
    }

    pub fn write_u64(&self, gpa: u64, val: u64) {
        self.mem.write_obj(val, GuestAddress(gpa)).unwrap();
    }

    pub fn read_range(&self, gpa: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.mem.read_slice(&mut buf, GuestAddress(gpa)).unwrap();
        buf
    }

    pub fn set_lpi_prop(&self, intid: u32, prop: u8) {
        let gpa = PROPBASE + u64::from(intid - GIC_LPI_OFFSET);
        self.mem.write_obj(prop, GuestAddress(gpa)).unwrap();
    }

    pub fn pending_bit(&self, vcpuid: u64, intid: u32) -> bool {
        let gpa = pendbase(vcpuid) + u64::from(intid / 8);
        let byte: u8 = self.mem.read_obj(GuestAddress(gpa)).unwrap();
        byte & (1 << (intid % 8)) != 0
    }

    pub fn set_pending_bit(&self, vcpuid: u64, intid: u32, pending: bool) {
        let gpa = pendbase(vcpuid) + u64::from(intid / 8);
        let mut byte: u8 = self.mem.read_obj(GuestAddress(gpa)).unwrap();
        if pending {
            byte |= 1 << (intid % 8);
        } else {
            byte &= !(1 << (intid % 8));
        }
        self.mem.write_obj(byte, GuestAddress(gpa)).unwrap();
    }

    /// Executes a command directly, returning its outcome.
    pub fn exec(&self, cmd: [u64; 4]) -> Result<()> {
        let q = self.its.cmdq.lock().unwrap();
        self.its.handle_command(&q, &ItsCommand::decode(&cmd))
    }

    /// Appends commands to the queue and advances CWRITER past them.
    pub fn run(&self, cmds: &[[u64; 4]]) {
        let cbaser = self.read64(GITS_CBASER);
        let base = cbaser_address(cbaser);
        let size = cmd_buffer_size(cbaser);

        let mut cwriter = self.read64(GITS_CWRITER);
        for cmd in cmds {
            for (i, word) in cmd.iter().enumerate() {
                self.write_u64(base + cwriter + i as u64 * 8, *word);
            }
            cwriter = (cwriter + ITS_CMD_SIZE) % size;
        }
        self.write64(GITS_CWRITER, cwriter);
    }
}

pub fn pendbase(vcpuid: u64) -> u64 {
    PENDBASE + vcpuid * SZ_64K
}

pub fn assert_command_error(err: ItsError, code: u32) {
    match err {
        ItsError::Command(e) => assert_eq!(e.code(), code, "got {}", e),
        e => panic!("expected command error 0x{:x}, got {}", code, e),
    }
}

pub fn mapd(device_id: u32, valid: bool, itt_addr: u64, num_eventid_bits: u32) -> [u64; 4] {
    [
        0x08 | u64::from(device_id) << 32,
        u64::from(num_eventid_bits - 1) & 0x1f,
        (itt_addr & genmask(51, 8)) | u64::from(valid) << 63,
        0,
    ]
}

pub fn mapc(collection_id: u32, valid: bool, target_addr: u32) -> [u64; 4] {
    [
        0x09,
        0,
        u64::from(collection_id) | u64::from(target_addr) << 16 | u64::from(valid) << 63,
        0,
    ]
}

pub fn mapti(device_id: u32, event_id: u32, intid: u32, collection_id: u32) -> [u64; 4] {
    [
        0x0a | u64::from(device_id) << 32,
        u64::from(event_id) | u64::from(intid) << 32,
        u64::from(collection_id),
        0,
    ]
}

pub fn mapi(device_id: u32, event_id: u32, collection_id: u32) -> [u64; 4] {
    [
        0x0b | u64::from(device_id) << 32,
        u64::from(event_id),
        u64::from(collection_id),
        0,
    ]
}

pub fn movi(device_id: u32, event_id: u32, collection_id: u32) -> [u64; 4] {
    [
        0x01 | u64::from(device_id) << 32,
        u64::from(event_id),
        u64::from(collection_id),
        0,
    ]
}

fn device_event_cmd(opcode: u64, device_id: u32, event_id: u32) -> [u64; 4] {
    [opcode | u64::from(device_id) << 32, u64::from(event_id), 0, 0]
}

pub fn discard(device_id: u32, event_id: u32) -> [u64; 4] {
    device_event_cmd(0x0f, device_id, event_id)
}

pub fn clear(device_id: u32, event_id: u32) -> [u64; 4] {
    device_event_cmd(0x04, device_id, event_id)
}

pub fn int(device_id: u32, event_id: u32) -> [u64; 4] {
    device_event_cmd(0x03, device_id, event_id)
}

pub fn inv(device_id: u32, event_id: u32) -> [u64; 4] {
    device_event_cmd(0x0c, device_id, event_id)
}

pub fn invall(collection_id: u32) -> [u64; 4] {
    [0x0d, 0, u64::from(collection_id), 0]
}

pub fn movall(target1: u32, target2: u32) -> [u64; 4] {
    [0x0e, 0, u64::from(target1) << 16, u64::from(target2) << 16]
}

pub fn sync() -> [u64; 4] {
    [0x05, 0, 0, 0]
}
