// Copyright 2026 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Userspace GICv3 Interrupt Translation Service.
//!
//! The ITS turns MSIs, identified by a device ID and an event ID, into LPIs delivered to a
//! redistributor. The guest programs it through its MMIO control frame and a command queue in
//! guest memory; the VMM injects MSIs with [`Its::inject_msi`] and can save or restore the
//! translation state through the tables the guest has provided.

mod cmd;
mod lpi;
mod persist;
mod regs;
mod tables;
#[cfg(test)]
mod test_utils;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use vm_memory::{GuestMemoryError, GuestMemoryMmap};

use self::persist::{CTE_ESZ, DTE_ESZ, ITE_ESZ};
use self::regs::*;
use self::tables::ItsTables;
use crate::bus::BusDevice;

pub use self::cmd::{ItsCommand, ProtocolError};
pub use self::lpi::{Lpi, LpiRef, LpiRegistry, LpiState, GIC_LPI_OFFSET};
pub use self::regs::{GITS_TRANSLATER, ITS_MMIO_SIZE};

/// Revision of the table layout used to save the ITS state.
const ITS_ABI_REV: u32 = 0;

/// Redistributor side of LPI delivery, as seen by the ITS.
pub trait Redistributor: Send + Sync {
    fn vcpu_count(&self) -> u32;
    /// GICR_PROPBASER, shared by all redistributors.
    fn propbaser(&self) -> u64;
    fn pendbaser(&self, vcpuid: u32) -> u64;
    /// Whether GICR_CTLR.EnableLPIs is set for `vcpuid`.
    fn lpis_enabled(&self, vcpuid: u32) -> bool;
    /// Hands a pending LPI over to `vcpuid`. An INTID already queued isn't queued again.
    fn queue_lpi(&self, vcpuid: u32, intid: u32);
    /// Takes back an LPI not yet acknowledged by `vcpuid`. Returns false if it wasn't queued.
    fn dequeue_lpi(&self, vcpuid: u32, intid: u32) -> bool;
    /// Stops all vCPUs. Returns false if some of them couldn't be stopped.
    fn pause_vcpus(&self) -> bool;
    fn resume_vcpus(&self);
}

#[derive(Debug)]
pub enum ItsError {
    GuestMemory(GuestMemoryError),
    InvalidConfig(&'static str),
    /// The base address isn't aligned to the 64K frame.
    InvalidBaseAddress(u64),
    BaseAddressAlreadySet,
    BaseAddressNotSet,
    InvalidRegisterAccess(u64),
    /// The vCPUs couldn't be stopped, or the ITS is enabled.
    Busy,
    /// The MSI isn't meant for this ITS.
    NoDevice,
    InvalidTableEntry(&'static str),
    /// The INTID is outside of the LPI range covered by the property table.
    LpiOutOfRange(u32),
    DuplicateCollection(u32),
    UnsupportedAbi(u32),
    UnknownCommand(u8),
    Command(ProtocolError),
}

impl fmt::Display for ItsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::ItsError::*;

        match self {
            GuestMemory(e) => write!(f, "guest memory access failed: {}", e),
            InvalidConfig(reason) => write!(f, "invalid ITS configuration: {}", reason),
            InvalidBaseAddress(addr) => write!(f, "invalid ITS base address 0x{:x}", addr),
            BaseAddressAlreadySet => write!(f, "the ITS base address is already set"),
            BaseAddressNotSet => write!(f, "the ITS base address is not set"),
            InvalidRegisterAccess(offset) => {
                write!(f, "invalid access to ITS register 0x{:x}", offset)
            }
            Busy => write!(f, "the ITS or its vCPUs are busy"),
            NoDevice => write!(f, "MSI not targeting this ITS"),
            InvalidTableEntry(reason) => write!(f, "invalid table entry: {}", reason),
            LpiOutOfRange(intid) => write!(f, "INTID {} is not a valid LPI", intid),
            DuplicateCollection(id) => write!(f, "collection {} restored twice", id),
            UnsupportedAbi(rev) => write!(f, "unsupported ITS ABI revision {}", rev),
            UnknownCommand(opcode) => write!(f, "unknown ITS command 0x{:02x}", opcode),
            Command(e) => write!(f, "ITS command error {}", e),
        }
    }
}

impl std::error::Error for ItsError {}

impl From<GuestMemoryError> for ItsError {
    fn from(e: GuestMemoryError) -> Self {
        ItsError::GuestMemory(e)
    }
}

pub type Result<T> = std::result::Result<T, ItsError>;

/// ID widths advertised in GITS_TYPER.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItsConfig {
    pub device_id_bits: u32,
    pub event_id_bits: u32,
    pub collection_id_bits: u32,
}

impl Default for ItsConfig {
    fn default() -> Self {
        Self {
            device_id_bits: 16,
            event_id_bits: 16,
            collection_id_bits: 16,
        }
    }
}

impl ItsConfig {
    fn validate(&self) -> Result<()> {
        if !(1..=32).contains(&self.device_id_bits) {
            return Err(ItsError::InvalidConfig("device ID bits must be within 1..=32"));
        }
        if !(1..=16).contains(&self.event_id_bits) {
            return Err(ItsError::InvalidConfig("event ID bits must be within 1..=16"));
        }
        if !(1..=16).contains(&self.collection_id_bits) {
            return Err(ItsError::InvalidConfig(
                "collection ID bits must be within 1..=16",
            ));
        }
        Ok(())
    }
}

/// Out-of-band control operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItsCtrl {
    Init,
    Reset,
    SaveTables,
    RestoreTables,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Msi {
    pub address: u64,
    pub data: u32,
    pub devid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsiDelivery {
    Delivered,
    /// Dropped: the ITS, or LPIs on the target, are disabled, or the event isn't mapped.
    Blocked,
}

/// Command queue registers, and the table base registers the commands depend on.
#[derive(Debug, Default)]
struct CommandQueue {
    cbaser: u64,
    creadr: u64,
    cwriter: u64,
    baser_device: Baser,
    baser_coll: Baser,
}

/// Keeps the vCPUs stopped while alive.
struct PausedVcpus<'a>(&'a dyn Redistributor);

impl<'a> PausedVcpus<'a> {
    fn new(redist: &'a dyn Redistributor) -> Result<Self> {
        if !redist.pause_vcpus() {
            return Err(ItsError::Busy);
        }
        Ok(PausedVcpus(redist))
    }
}

impl Drop for PausedVcpus<'_> {
    fn drop(&mut self) {
        self.0.resume_vcpus();
    }
}

pub struct Its {
    config: ItsConfig,
    mem: GuestMemoryMmap,
    redist: Arc<dyn Redistributor>,
    lpis: Arc<LpiRegistry>,
    base_addr: Mutex<Option<u64>>,
    enabled: AtomicBool,
    // Lock order: cmdq, tables, the LPI registry, a single LPI. MSIs only take the last three.
    // The redistributor's queues come last and are never taken with an LPI lock held.
    cmdq: Mutex<CommandQueue>,
    tables: Mutex<ItsTables>,
}

impl Its {
    pub fn new(config: ItsConfig, lpis: Arc<LpiRegistry>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            mem: lpis.guest_memory().clone(),
            redist: lpis.redistributor().clone(),
            lpis,
            base_addr: Mutex::new(None),
            enabled: AtomicBool::new(false),
            cmdq: Mutex::new(CommandQueue::default()),
            tables: Mutex::new(ItsTables::default()),
        })
    }

    pub fn config(&self) -> &ItsConfig {
        &self.config
    }

    pub fn get_mmio_size(&self) -> u64 {
        ITS_MMIO_SIZE
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_base_address(&self, addr: u64) -> Result<()> {
        if addr & (ITS_BASE_ALIGN - 1) != 0 {
            return Err(ItsError::InvalidBaseAddress(addr));
        }

        let mut base_addr = self.base_addr.lock().unwrap();
        if base_addr.is_some() {
            return Err(ItsError::BaseAddressAlreadySet);
        }
        debug!("[ITS] base address 0x{:x}", addr);
        *base_addr = Some(addr);
        Ok(())
    }

    pub fn base_address(&self) -> Option<u64> {
        *self.base_addr.lock().unwrap()
    }

    pub fn ctrl(&self, op: ItsCtrl) -> Result<()> {
        debug!("[ITS] control {:?}", op);
        match op {
            ItsCtrl::Init => Ok(()),
            ItsCtrl::Reset => {
                let _paused = PausedVcpus::new(self.redist.as_ref())?;
                self.reset();
                Ok(())
            }
            ItsCtrl::SaveTables => {
                let _paused = PausedVcpus::new(self.redist.as_ref())?;
                self.save_tables()
            }
            ItsCtrl::RestoreTables => {
                let _paused = PausedVcpus::new(self.redist.as_ref())?;
                self.restore_tables()
            }
        }
    }

    fn reset(&self) {
        let mut q = self.cmdq.lock().unwrap();
        self.tables.lock().unwrap().clear();
        *q = CommandQueue::default();
        self.enabled.store(false, Ordering::Release);
    }

    /// Translates an MSI written to GITS_TRANSLATER into a pending LPI.
    pub fn inject_msi(&self, msi: &Msi) -> Result<MsiDelivery> {
        let doorbell = self.base_address().map(|base| base + GITS_TRANSLATER);
        if doorbell != Some(msi.address) {
            return Err(ItsError::NoDevice);
        }

        let tables = self.tables.lock().unwrap();
        match self.trigger(&tables, msi.devid, msi.data) {
            Err(ItsError::Command(e)) => {
                debug!(
                    "[ITS] dropping MSI {} from device {}: {}",
                    msi.data, msi.devid, e
                );
                Ok(MsiDelivery::Blocked)
            }
            ret => ret,
        }
    }

    /// Reads a register on behalf of the VMM. 64-bit registers are read whole.
    pub fn uaccess_read(&self, offset: u64) -> Result<u64> {
        let len = self.uaccess_len(offset)?;
        Ok(self.read_reg(offset, len))
    }

    /// Writes a register on behalf of the VMM, typically while restoring its state.
    pub fn uaccess_write(&self, offset: u64, val: u64) -> Result<()> {
        let len = self.uaccess_len(offset)?;
        self.write_reg(offset, len, val, true)
    }

    fn uaccess_len(&self, offset: u64) -> Result<usize> {
        if self.base_address().is_none() {
            return Err(ItsError::BaseAddressNotSet);
        }
        match offset {
            GITS_CTLR | GITS_IIDR => Ok(4),
            GITS_TYPER | GITS_CBASER | GITS_CWRITER | GITS_CREADR => Ok(8),
            o if is_baser(o) && o % 8 == 0 => Ok(8),
            o if (GITS_IDREGS_BASE..GITS_IDREGS_BASE + 0x30).contains(&o) && o % 4 == 0 => Ok(4),
            o => Err(ItsError::InvalidRegisterAccess(o)),
        }
    }

    pub fn mmio_read(&self, offset: u64, data: &mut [u8]) {
        let len = data.len();
        if !(len == 4 || len == 8) || offset % len as u64 != 0 || offset >= ITS_MMIO_SIZE {
            warn!(
                "[ITS] invalid read at offset 0x{:x} with len {}",
                offset, len
            );
            data.iter_mut().for_each(|b| *b = 0);
            return;
        }

        let val = self.read_reg(offset, len);
        debug!("[ITS] read offset=0x{:x} len={} val=0x{:x}", offset, len, val);
        data.copy_from_slice(&val.to_le_bytes()[..len]);
    }

    pub fn mmio_write(&self, offset: u64, data: &[u8]) {
        let len = data.len();
        if !(len == 4 || len == 8) || offset % len as u64 != 0 || offset >= ITS_MMIO_SIZE {
            warn!(
                "[ITS] invalid write at offset 0x{:x} with len {}",
                offset, len
            );
            return;
        }

        let mut bytes = [0u8; 8];
        bytes[..len].copy_from_slice(data);
        let val = u64::from_le_bytes(bytes);
        debug!("[ITS] write offset=0x{:x} len={} val=0x{:x}", offset, len, val);
        if let Err(e) = self.write_reg(offset, len, val, false) {
            debug!("[ITS] write to 0x{:x} ignored: {}", offset, e);
        }
    }

    fn typer(&self) -> u64 {
        typer(
            self.config.device_id_bits,
            self.config.event_id_bits,
            self.config.collection_id_bits,
            ITE_ESZ,
        )
    }

    fn read_reg(&self, offset: u64, len: usize) -> u64 {
        let reg = offset & !7;
        match offset {
            // 32-bit registers
            GITS_CTLR if len == 4 => {
                let q = self.cmdq.lock().unwrap();
                let mut val = 0;
                if self.is_enabled() {
                    val |= GITS_CTLR_ENABLE;
                }
                if q.creadr == q.cwriter {
                    val |= GITS_CTLR_QUIESCENT;
                }
                u64::from(val)
            }
            GITS_IIDR if len == 4 => u64::from(iidr(ITS_ABI_REV)),
            o if (GITS_IDREGS_BASE..GITS_IDREGS_BASE + 0x30).contains(&o) && len == 4 => {
                u64::from(idreg(o))
            }
            // 64-bit registers, also accessible 32 bits at a time
            _ if reg == GITS_TYPER => extract_bytes(self.typer(), offset, len),
            _ if reg == GITS_CBASER => extract_bytes(self.cmdq.lock().unwrap().cbaser, offset, len),
            _ if reg == GITS_CWRITER => {
                extract_bytes(self.cmdq.lock().unwrap().cwriter, offset, len)
            }
            _ if reg == GITS_CREADR => extract_bytes(self.cmdq.lock().unwrap().creadr, offset, len),
            _ if is_baser(reg) => {
                let q = self.cmdq.lock().unwrap();
                let val = match (reg - GITS_BASER) / 8 {
                    0 => q.baser_device.0,
                    1 => q.baser_coll.0,
                    _ => 0,
                };
                extract_bytes(val, offset, len)
            }
            _ => {
                debug!("[ITS] read of unhandled register 0x{:x}", offset);
                0
            }
        }
    }

    fn write_reg(&self, offset: u64, len: usize, val: u64, uaccess: bool) -> Result<()> {
        let reg = offset & !7;
        match offset {
            GITS_CTLR if len == 4 => {
                self.write_ctlr(val as u32);
                Ok(())
            }
            GITS_IIDR if len == 4 => {
                if uaccess {
                    let rev = (val as u32 & GITS_IIDR_REV_MASK) >> GITS_IIDR_REV_SHIFT;
                    if rev != ITS_ABI_REV {
                        return Err(ItsError::UnsupportedAbi(rev));
                    }
                }
                Ok(())
            }
            _ if reg == GITS_CBASER => self.write_cbaser(offset, len, val),
            _ if reg == GITS_CWRITER => self.write_cwriter(offset, len, val),
            _ if reg == GITS_CREADR => {
                if uaccess {
                    self.write_creadr(offset, len, val)
                } else {
                    Ok(())
                }
            }
            _ if is_baser(reg) => self.write_baser(offset, len, val),
            // TYPER, the ID registers and TRANSLATER ignore writes.
            _ => Ok(()),
        }
    }

    fn write_ctlr(&self, val: u32) {
        let mut q = self.cmdq.lock().unwrap();
        let enable = val & GITS_CTLR_ENABLE != 0;

        if !self.is_enabled()
            && enable
            && (q.cbaser & GITS_CBASER_VALID == 0
                || !q.baser_device.is_valid()
                || !q.baser_coll.is_valid())
        {
            debug!("[ITS] not enabling: command queue or tables not set up");
            return;
        }

        self.enabled.store(enable, Ordering::Release);
        self.process_commands(&mut q);
    }

    fn write_cbaser(&self, offset: u64, len: usize, val: u64) -> Result<()> {
        let mut q = self.cmdq.lock().unwrap();
        if self.is_enabled() {
            return Err(ItsError::Busy);
        }

        q.cbaser = sanitise_cbaser(update_64bit_reg(q.cbaser, offset, len, val));
        q.creadr = 0;
        q.cwriter = 0;
        Ok(())
    }

    fn write_cwriter(&self, offset: u64, len: usize, val: u64) -> Result<()> {
        let mut q = self.cmdq.lock().unwrap();
        let reg = update_64bit_reg(q.cwriter, offset, len, val);
        if reg & !ITS_CMD_OFFSET_MASK != 0 || reg >= cmd_buffer_size(q.cbaser) {
            return Err(ItsError::InvalidRegisterAccess(offset));
        }

        q.cwriter = reg;
        self.process_commands(&mut q);
        Ok(())
    }

    fn write_creadr(&self, offset: u64, len: usize, val: u64) -> Result<()> {
        let mut q = self.cmdq.lock().unwrap();
        if self.is_enabled() {
            return Err(ItsError::Busy);
        }

        let reg = update_64bit_reg(q.creadr, offset, len, val);
        if reg & !ITS_CMD_OFFSET_MASK != 0 || reg >= cmd_buffer_size(q.cbaser) {
            return Err(ItsError::InvalidRegisterAccess(offset));
        }
        q.creadr = reg;
        Ok(())
    }

    fn write_baser(&self, offset: u64, len: usize, val: u64) -> Result<()> {
        let mut q = self.cmdq.lock().unwrap();
        if self.is_enabled() {
            return Err(ItsError::Busy);
        }

        let (entry_size, table_type) = match (offset - GITS_BASER) / 8 {
            0 => (DTE_ESZ, GITS_BASER_TYPE_DEVICE),
            1 => (CTE_ESZ, GITS_BASER_TYPE_COLLECTION),
            // Unimplemented tables are RAZ/WI.
            _ => return Ok(()),
        };
        let old = match table_type {
            GITS_BASER_TYPE_DEVICE => q.baser_device,
            _ => q.baser_coll,
        };

        let mut reg = update_64bit_reg(old.0, offset, len, val);
        reg &= !GITS_BASER_RO_MASK;
        reg |= (entry_size - 1) << GITS_BASER_ENTRY_SIZE_SHIFT;
        reg |= table_type << GITS_BASER_TYPE_SHIFT;
        let baser = Baser(sanitise_baser(reg));

        if table_type == GITS_BASER_TYPE_DEVICE {
            q.baser_device = baser;
        } else {
            q.baser_coll = baser;
        }

        if !baser.is_valid() {
            let mut tables = self.tables.lock().unwrap();
            if table_type == GITS_BASER_TYPE_DEVICE {
                tables.clear_devices();
            } else {
                tables.clear_collections();
            }
        }
        Ok(())
    }
}

fn is_baser(offset: u64) -> bool {
    (GITS_BASER..GITS_BASER + 8 * GITS_BASER_NR_REGS).contains(&offset)
}

impl BusDevice for Its {
    fn read(&mut self, _vcpuid: u64, offset: u64, data: &mut [u8]) {
        self.mmio_read(offset, data);
    }

    fn write(&mut self, _vcpuid: u64, offset: u64, data: &[u8]) {
        self.mmio_write(offset, data);
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn test_config_validation() {
        let setup = TestSetup::new(1);
        let config = ItsConfig {
            event_id_bits: 17,
            ..Default::default()
        };
        match Its::new(config, setup.lpis.clone()) {
            Err(ItsError::InvalidConfig(_)) => (),
            _ => panic!("accepted 17 event ID bits"),
        }
        let config = ItsConfig {
            device_id_bits: 0,
            ..Default::default()
        };
        assert!(Its::new(config, setup.lpis.clone()).is_err());
    }

    #[test]
    fn test_base_address() {
        let setup = TestSetup::new(1);
        let its = setup.new_its();
        assert_eq!(its.base_address(), None);
        match its.set_base_address(ITS_BASE + 0x1000) {
            Err(ItsError::InvalidBaseAddress(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        its.set_base_address(ITS_BASE).unwrap();
        assert_eq!(its.base_address(), Some(ITS_BASE));
        match its.set_base_address(ITS_BASE) {
            Err(ItsError::BaseAddressAlreadySet) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_id_registers() {
        let setup = TestSetup::new(1);
        assert_eq!(setup.read32(GITS_IIDR), 0x4b00_043b);
        assert_eq!(setup.read32(GITS_PIDR2), 0x3b);
        assert_eq!(setup.read32(GITS_CIDR3), 0xb1);

        let typer = setup.read64(GITS_TYPER);
        assert_eq!(setup.read32(GITS_TYPER), typer & 0xffff_ffff);
        assert_eq!(setup.read32(GITS_TYPER + 4), typer >> 32);
        // Read-only.
        setup.write64(GITS_TYPER, 0);
        assert_eq!(setup.read64(GITS_TYPER), typer);
    }

    #[test]
    fn test_baser_fixed_fields() {
        let setup = TestSetup::new(1);
        setup.write64(GITS_BASER, GITS_BASER_VALID | (0x1f << 48) | (7 << 56) | DEVICE_TABLE);
        let baser = Baser(setup.read64(GITS_BASER));
        assert!(baser.is_valid());
        assert_eq!(baser.entry_size(), DTE_ESZ);
        assert_eq!((baser.0 >> GITS_BASER_TYPE_SHIFT) & 7, GITS_BASER_TYPE_DEVICE);
        assert_eq!(baser.address(), DEVICE_TABLE);

        setup.write64(GITS_BASER + 8, GITS_BASER_VALID | COLLECTION_TABLE);
        let baser = setup.read64(GITS_BASER + 8);
        assert_eq!((baser >> GITS_BASER_TYPE_SHIFT) & 7, GITS_BASER_TYPE_COLLECTION);

        // The other tables are not implemented.
        setup.write64(GITS_BASER + 16, GITS_BASER_VALID | 0x90_0000);
        assert_eq!(setup.read64(GITS_BASER + 16), 0);
    }

    #[test]
    fn test_baser_32bit_halves() {
        let setup = TestSetup::new(1);
        setup.write32(GITS_BASER, DEVICE_TABLE as u32);
        setup.write32(GITS_BASER + 4, (GITS_BASER_VALID >> 32) as u32);
        let baser = Baser(setup.read64(GITS_BASER));
        assert!(baser.is_valid());
        assert_eq!(baser.address(), DEVICE_TABLE);
    }

    #[test]
    fn test_enable_requires_tables() {
        let setup = TestSetup::new(1);
        setup.write64(GITS_CBASER, GITS_CBASER_VALID | CMDQ_BASE);
        setup.write64(GITS_BASER, GITS_BASER_VALID | DEVICE_TABLE);
        setup.write32(GITS_CTLR, GITS_CTLR_ENABLE);
        assert!(!setup.its.is_enabled());

        setup.write64(GITS_BASER + 8, GITS_BASER_VALID | COLLECTION_TABLE);
        setup.write32(GITS_CTLR, GITS_CTLR_ENABLE);
        assert!(setup.its.is_enabled());
        assert_eq!(
            setup.read32(GITS_CTLR),
            u64::from(GITS_CTLR_ENABLE | GITS_CTLR_QUIESCENT)
        );
    }

    #[test]
    fn test_registers_locked_while_enabled() {
        let setup = TestSetup::enabled(1);
        let cbaser = setup.read64(GITS_CBASER);
        setup.write64(GITS_CBASER, GITS_CBASER_VALID | 0x90_0000);
        assert_eq!(setup.read64(GITS_CBASER), cbaser);

        let baser = setup.read64(GITS_BASER);
        setup.write64(GITS_BASER, 0);
        assert_eq!(setup.read64(GITS_BASER), baser);
    }

    #[test]
    fn test_cbaser_resets_offsets() {
        let setup = TestSetup::new(1);
        setup.write64(GITS_CBASER, GITS_CBASER_VALID | CMDQ_BASE);
        setup.its.uaccess_write(GITS_CREADR, 0x40).unwrap();
        setup.write64(GITS_CWRITER, 0x40);
        assert_eq!(setup.read64(GITS_CREADR), 0x40);

        setup.write64(GITS_CBASER, GITS_CBASER_VALID | CMDQ_BASE | 1);
        assert_eq!(setup.read64(GITS_CREADR), 0);
        assert_eq!(setup.read64(GITS_CWRITER), 0);
    }

    #[test]
    fn test_cwriter_rejects_bad_offsets() {
        let setup = TestSetup::enabled(1);
        // One 4K page: 128 commands.
        setup.write64(GITS_CWRITER, 4096);
        assert_eq!(setup.read64(GITS_CWRITER), 0);
        setup.write64(GITS_CWRITER, 0x21);
        assert_eq!(setup.read64(GITS_CWRITER), 0);
        assert_eq!(setup.read64(GITS_CREADR), 0);
    }

    #[test]
    fn test_creadr_uaccess() {
        let setup = TestSetup::new(1);
        setup.write64(GITS_CBASER, GITS_CBASER_VALID | CMDQ_BASE);
        // Guest writes are ignored.
        setup.write64(GITS_CREADR, 0x20);
        assert_eq!(setup.read64(GITS_CREADR), 0);

        setup.its.uaccess_write(GITS_CREADR, 0x60).unwrap();
        assert_eq!(setup.its.uaccess_read(GITS_CREADR).unwrap(), 0x60);
        assert!(setup.its.uaccess_write(GITS_CREADR, 0x61).is_err());
        assert!(setup.its.uaccess_write(GITS_CREADR, 4096).is_err());

        setup.enable();
        match setup.its.uaccess_write(GITS_CREADR, 0x20) {
            Err(ItsError::Busy) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_uaccess_requires_base_address() {
        let setup = TestSetup::new(1);
        let its = setup.new_its();
        match its.uaccess_read(GITS_CTLR) {
            Err(ItsError::BaseAddressNotSet) => (),
            other => panic!("unexpected result {:?}", other),
        }
        its.set_base_address(ITS_BASE).unwrap();
        assert!(its.uaccess_read(GITS_CTLR).is_ok());
        assert!(its.uaccess_read(0x20).is_err());
    }

    #[test]
    fn test_iidr_abi_check() {
        let setup = TestSetup::new(1);
        let iidr = setup.its.uaccess_read(GITS_IIDR).unwrap();
        setup.its.uaccess_write(GITS_IIDR, iidr).unwrap();
        match setup.its.uaccess_write(GITS_IIDR, iidr | (1 << 12)) {
            Err(ItsError::UnsupportedAbi(1)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_invalidating_baser_frees_table() {
        let setup = TestSetup::enabled(1);
        setup.exec(mapc(0, true, 0)).unwrap();
        setup.exec(mapd(1, true, ITT_BASE, 4)).unwrap();
        setup.exec(mapti(1, 0, 8192, 0)).unwrap();

        setup.write32(GITS_CTLR, 0);
        setup.write64(GITS_BASER, DEVICE_TABLE);
        assert!(setup.lpis.is_empty());
        assert!(setup.its.tables.lock().unwrap().device(1).is_none());
        assert!(setup.its.tables.lock().unwrap().collection(0).is_some());
    }

    #[test]
    fn test_inject_msi() {
        let setup = TestSetup::enabled(1);
        setup.set_lpi_prop(8192, 0x01);
        setup.run(&[
            mapd(7, true, ITT_BASE, 4),
            mapc(0, true, 0),
            mapti(7, 3, 8192, 0),
        ]);

        let msi = Msi {
            address: ITS_BASE + GITS_TRANSLATER,
            data: 3,
            devid: 7,
        };
        assert_eq!(setup.its.inject_msi(&msi).unwrap(), MsiDelivery::Delivered);
        assert!(setup.lpis.get(8192).unwrap().is_pending());
        assert_eq!(setup.vcpus.get_pending_irq(0), 8192);

        // Unmapped event.
        let unmapped = Msi { data: 4, ..msi };
        assert_eq!(setup.its.inject_msi(&unmapped).unwrap(), MsiDelivery::Blocked);

        // Not our doorbell.
        let elsewhere = Msi {
            address: ITS_BASE,
            ..msi
        };
        match setup.its.inject_msi(&elsewhere) {
            Err(ItsError::NoDevice) => (),
            other => panic!("unexpected result {:?}", other),
        }

        // LPIs disabled on the target.
        setup.lpis.get(8192).unwrap().clear_pending();
        setup.vcpus.set_lpis_enabled(0, false);
        assert_eq!(setup.its.inject_msi(&msi).unwrap(), MsiDelivery::Blocked);
        assert!(!setup.lpis.get(8192).unwrap().is_pending());

        // ITS disabled.
        setup.vcpus.set_lpis_enabled(0, true);
        setup.write32(GITS_CTLR, 0);
        assert_eq!(setup.its.inject_msi(&msi).unwrap(), MsiDelivery::Blocked);
    }

    #[test]
    fn test_msi_redelivered_after_ack() {
        let setup = TestSetup::enabled(1);
        setup.set_lpi_prop(8192, 0x01);
        setup.run(&[
            mapd(7, true, ITT_BASE, 4),
            mapc(0, true, 0),
            mapti(7, 3, 8192, 0),
        ]);
        let msi = Msi {
            address: ITS_BASE + GITS_TRANSLATER,
            data: 3,
            devid: 7,
        };

        for _ in 0..2 {
            assert_eq!(setup.its.inject_msi(&msi).unwrap(), MsiDelivery::Delivered);
            assert_eq!(setup.vcpus.get_pending_irq(0), 8192);
            assert!(!setup.lpis.get(8192).unwrap().is_pending());
            assert!(!setup.vcpus.has_pending_irq(0));
        }

        // Two MSIs before the acknowledgement are taken as one.
        setup.its.inject_msi(&msi).unwrap();
        setup.its.inject_msi(&msi).unwrap();
        assert_eq!(setup.vcpus.get_pending_irq(0), 8192);
        assert!(!setup.vcpus.has_pending_irq(0));
    }

    #[test]
    fn test_inject_msi_without_base_address() {
        let setup = TestSetup::new(1);
        let its = setup.new_its();
        let msi = Msi {
            address: GITS_TRANSLATER,
            data: 0,
            devid: 0,
        };
        match its.inject_msi(&msi) {
            Err(ItsError::NoDevice) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_reset() {
        let setup = TestSetup::enabled(1);
        setup.exec(mapc(0, true, 0)).unwrap();
        setup.exec(mapd(1, true, ITT_BASE, 4)).unwrap();
        setup.exec(mapti(1, 0, 8192, 0)).unwrap();

        setup.its.ctrl(ItsCtrl::Reset).unwrap();
        assert!(!setup.its.is_enabled());
        assert!(setup.lpis.is_empty());
        assert!(setup.its.tables.lock().unwrap().is_empty());
        assert_eq!(setup.read64(GITS_CBASER), 0);
        assert_eq!(setup.read64(GITS_BASER), 0);
        assert_eq!(setup.its.base_address(), Some(ITS_BASE));
    }

    #[test]
    fn test_ctrl_busy_while_vcpus_paused() {
        let setup = TestSetup::enabled(1);
        // Someone else holds the vCPUs.
        assert!(setup.vcpus.pause_vcpus());
        match setup.its.ctrl(ItsCtrl::SaveTables) {
            Err(ItsError::Busy) => (),
            other => panic!("unexpected result {:?}", other),
        }
        setup.vcpus.resume_vcpus();
        setup.its.ctrl(ItsCtrl::SaveTables).unwrap();
        assert!(!setup.vcpus.is_paused());
        setup.its.ctrl(ItsCtrl::Init).unwrap();
    }

    #[test]
    fn test_bus_device() {
        let setup = TestSetup::new(1);
        let mut its = setup.new_its();
        let mut data = [0u8; 4];
        BusDevice::read(&mut its, 0, GITS_IIDR, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0x4b00_043b);

        // Unaligned and odd-sized accesses read as zero.
        let mut data = [0xffu8; 2];
        BusDevice::read(&mut its, 0, GITS_IIDR, &mut data);
        assert_eq!(data, [0, 0]);
    }

    #[test]
    fn test_concurrent_msis() {
        use std::thread;

        let setup = TestSetup::enabled(2);
        let mut cmds = vec![mapc(0, true, 0), mapc(1, true, 1), mapd(0, true, ITT_BASE, 8)];
        for event in 0..64u32 {
            cmds.push(mapti(0, event, 8192 + event, event % 2));
            setup.set_lpi_prop(8192 + event, 0x01);
        }
        setup.run(&cmds);

        let its = Arc::new(setup.its);
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let its = its.clone();
                thread::spawn(move || {
                    for event in (t * 16)..(t * 16 + 16) {
                        let msi = Msi {
                            address: ITS_BASE + GITS_TRANSLATER,
                            data: event,
                            devid: 0,
                        };
                        assert_eq!(its.inject_msi(&msi).unwrap(), MsiDelivery::Delivered);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for event in 0..64u32 {
            assert!(setup.lpis.get(8192 + event).unwrap().is_pending());
        }
        let mut queued = 0;
        for vcpu in 0..2 {
            while setup.vcpus.has_pending_irq(vcpu) {
                setup.vcpus.get_pending_irq(vcpu);
                queued += 1;
            }
        }
        assert_eq!(queued, 64);
    }
}
