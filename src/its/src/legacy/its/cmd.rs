// Copyright 2026 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ITS command queue: decoding and execution of the commands written by the guest.

use std::fmt;
use std::sync::atomic::Ordering;

use vm_memory::{Bytes, GuestAddress};

use super::lpi::{max_lpis, GIC_LPI_OFFSET};
use super::persist::table_entry_addr;
use super::regs::{cbaser_address, cmd_buffer_size, GITS_CBASER_VALID};
use super::tables::{Device, Ite, ItsTables, COLLECTION_NOT_MAPPED};
use super::{CommandQueue, Its, ItsError, MsiDelivery, Result};

/// Every command is four little-endian doublewords.
pub const ITS_CMD_SIZE: u64 = 32;

const GITS_CMD_MOVI: u8 = 0x01;
const GITS_CMD_INT: u8 = 0x03;
const GITS_CMD_CLEAR: u8 = 0x04;
const GITS_CMD_SYNC: u8 = 0x05;
const GITS_CMD_MAPD: u8 = 0x08;
const GITS_CMD_MAPC: u8 = 0x09;
const GITS_CMD_MAPTI: u8 = 0x0a;
const GITS_CMD_MAPI: u8 = 0x0b;
const GITS_CMD_INV: u8 = 0x0c;
const GITS_CMD_INVALL: u8 = 0x0d;
const GITS_CMD_MOVALL: u8 = 0x0e;
const GITS_CMD_DISCARD: u8 = 0x0f;

/// Command errors, reported with the architected error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    MapdDeviceOor,
    MapdIttSizeOor,
    MapcProcnumOor,
    MapcCollectionOor,
    MaptiUnmappedDevice,
    MaptiIdOor,
    MaptiPhysicalIdOor,
    InvUnmappedInterrupt,
    InvallUnmappedCollection,
    MoviUnmappedInterrupt,
    MoviUnmappedCollection,
    DiscardUnmappedInterrupt,
    ClearUnmappedInterrupt,
    IntUnmappedInterrupt,
    IntUnmappedCollection,
    MovallProcnumOor,
}

impl ProtocolError {
    pub fn code(&self) -> u32 {
        use self::ProtocolError::*;

        match self {
            MapdDeviceOor => 0x01_0801,
            MapdIttSizeOor => 0x01_0802,
            MapcProcnumOor => 0x01_0902,
            MapcCollectionOor => 0x01_0903,
            MaptiUnmappedDevice => 0x01_0a04,
            MaptiIdOor => 0x01_0a05,
            MaptiPhysicalIdOor => 0x01_0a06,
            InvUnmappedInterrupt => 0x01_0c07,
            InvallUnmappedCollection => 0x01_0d09,
            MoviUnmappedInterrupt => 0x01_0107,
            MoviUnmappedCollection => 0x01_0109,
            DiscardUnmappedInterrupt => 0x01_0f07,
            ClearUnmappedInterrupt => 0x01_0507,
            IntUnmappedInterrupt => 0x01_0307,
            IntUnmappedCollection => 0x01_0309,
            MovallProcnumOor => 0x01_0e01,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} (0x{:06x})", self, self.code())
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for ItsError {
    fn from(e: ProtocolError) -> Self {
        ItsError::Command(e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItsCommand {
    Mapd {
        device_id: u32,
        valid: bool,
        itt_addr: u64,
        num_eventid_bits: u32,
    },
    Mapc {
        collection_id: u32,
        valid: bool,
        target_addr: u32,
    },
    Mapti {
        device_id: u32,
        event_id: u32,
        intid: u32,
        collection_id: u32,
    },
    /// MAPTI with the event ID doubling as INTID.
    Mapi {
        device_id: u32,
        event_id: u32,
        collection_id: u32,
    },
    Movi {
        device_id: u32,
        event_id: u32,
        collection_id: u32,
    },
    Discard {
        device_id: u32,
        event_id: u32,
    },
    Clear {
        device_id: u32,
        event_id: u32,
    },
    Int {
        device_id: u32,
        event_id: u32,
    },
    Inv {
        device_id: u32,
        event_id: u32,
    },
    Invall {
        collection_id: u32,
    },
    Movall {
        target1: u32,
        target2: u32,
    },
    Sync,
    Unknown(u8),
}

fn cmd_field(cmd: &[u64; 4], word: usize, shift: u32, size: u32) -> u64 {
    (cmd[word] >> shift) & ((1u64 << size) - 1)
}

impl ItsCommand {
    pub fn from_bytes(buf: &[u8; ITS_CMD_SIZE as usize]) -> Self {
        let mut cmd = [0u64; 4];
        for (word, chunk) in cmd.iter_mut().zip(buf.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *word = u64::from_le_bytes(bytes);
        }
        Self::decode(&cmd)
    }

    pub fn decode(cmd: &[u64; 4]) -> Self {
        let opcode = cmd_field(cmd, 0, 0, 8) as u8;
        let device_id = cmd_field(cmd, 0, 32, 32) as u32;
        let event_id = cmd_field(cmd, 1, 0, 32) as u32;
        let collection_id = cmd_field(cmd, 2, 0, 16) as u32;

        match opcode {
            GITS_CMD_MAPD => ItsCommand::Mapd {
                device_id,
                valid: cmd_field(cmd, 2, 63, 1) != 0,
                itt_addr: cmd_field(cmd, 2, 8, 44) << 8,
                num_eventid_bits: cmd_field(cmd, 1, 0, 5) as u32 + 1,
            },
            GITS_CMD_MAPC => ItsCommand::Mapc {
                collection_id,
                valid: cmd_field(cmd, 2, 63, 1) != 0,
                target_addr: cmd_field(cmd, 2, 16, 32) as u32,
            },
            GITS_CMD_MAPTI => ItsCommand::Mapti {
                device_id,
                event_id,
                intid: cmd_field(cmd, 1, 32, 32) as u32,
                collection_id,
            },
            GITS_CMD_MAPI => ItsCommand::Mapi {
                device_id,
                event_id,
                collection_id,
            },
            GITS_CMD_MOVI => ItsCommand::Movi {
                device_id,
                event_id,
                collection_id,
            },
            GITS_CMD_DISCARD => ItsCommand::Discard {
                device_id,
                event_id,
            },
            GITS_CMD_CLEAR => ItsCommand::Clear {
                device_id,
                event_id,
            },
            GITS_CMD_INT => ItsCommand::Int {
                device_id,
                event_id,
            },
            GITS_CMD_INV => ItsCommand::Inv {
                device_id,
                event_id,
            },
            GITS_CMD_INVALL => ItsCommand::Invall { collection_id },
            GITS_CMD_MOVALL => ItsCommand::Movall {
                target1: cmd_field(cmd, 2, 16, 32) as u32,
                target2: cmd_field(cmd, 3, 16, 32) as u32,
            },
            GITS_CMD_SYNC => ItsCommand::Sync,
            op => ItsCommand::Unknown(op),
        }
    }
}

impl Its {
    /// Runs the commands between CREADR and CWRITER.
    pub(super) fn process_commands(&self, q: &mut CommandQueue) {
        if !self.enabled.load(Ordering::Acquire) || q.cbaser & GITS_CBASER_VALID == 0 {
            return;
        }

        let base = cbaser_address(q.cbaser);
        let size = cmd_buffer_size(q.cbaser);
        while q.cwriter != q.creadr {
            let mut buf = [0u8; ITS_CMD_SIZE as usize];
            match self.mem.read_slice(&mut buf, GuestAddress(base + q.creadr)) {
                Ok(()) => {
                    let cmd = ItsCommand::from_bytes(&buf);
                    match self.handle_command(q, &cmd) {
                        Ok(()) => (),
                        Err(e @ ItsError::GuestMemory(_)) => {
                            warn!("[ITS] {:?} failed: {}", cmd, e)
                        }
                        Err(e) => debug!("[ITS] {:?} failed: {}", cmd, e),
                    }
                }
                // The architecture lets an ITS ignore a command it cannot read.
                Err(e) => debug!(
                    "[ITS] skipping command at 0x{:x}: {}",
                    base + q.creadr,
                    e
                ),
            }

            q.creadr += ITS_CMD_SIZE;
            if q.creadr == size {
                q.creadr = 0;
            }
        }
    }

    pub(super) fn handle_command(&self, q: &CommandQueue, cmd: &ItsCommand) -> Result<()> {
        debug!("[ITS] command {:?}", cmd);
        let mut tables = self.tables.lock().unwrap();

        match *cmd {
            ItsCommand::Mapd {
                device_id,
                valid,
                itt_addr,
                num_eventid_bits,
            } => self.cmd_mapd(q, &mut tables, device_id, valid, itt_addr, num_eventid_bits),
            ItsCommand::Mapc {
                collection_id,
                valid,
                target_addr,
            } => self.cmd_mapc(q, &mut tables, collection_id, valid, target_addr),
            ItsCommand::Mapti {
                device_id,
                event_id,
                intid,
                collection_id,
            } => self.cmd_mapti(q, &mut tables, device_id, event_id, intid, collection_id),
            ItsCommand::Mapi {
                device_id,
                event_id,
                collection_id,
            } => self.cmd_mapti(q, &mut tables, device_id, event_id, event_id, collection_id),
            ItsCommand::Movi {
                device_id,
                event_id,
                collection_id,
            } => Self::cmd_movi(&mut tables, device_id, event_id, collection_id),
            ItsCommand::Discard {
                device_id,
                event_id,
            } => self.cmd_discard(&mut tables, device_id, event_id),
            ItsCommand::Clear {
                device_id,
                event_id,
            } => {
                let ite = tables
                    .ite(device_id, event_id)
                    .ok_or(ProtocolError::ClearUnmappedInterrupt)?;
                self.lpis.clear_pending(&ite.lpi);
                Ok(())
            }
            ItsCommand::Int {
                device_id,
                event_id,
            } => self.trigger(&tables, device_id, event_id).map(|_| ()),
            ItsCommand::Inv {
                device_id,
                event_id,
            } => {
                let ite = tables
                    .ite(device_id, event_id)
                    .ok_or(ProtocolError::InvUnmappedInterrupt)?;
                self.lpis.update_config(&ite.lpi, None)?;
                Ok(())
            }
            ItsCommand::Invall { collection_id } => self.cmd_invall(&tables, collection_id),
            ItsCommand::Movall { target1, target2 } => self.cmd_movall(target1, target2),
            ItsCommand::Sync => Ok(()),
            ItsCommand::Unknown(opcode) => Err(ItsError::UnknownCommand(opcode)),
        }
    }

    fn cmd_mapd(
        &self,
        q: &CommandQueue,
        tables: &mut ItsTables,
        device_id: u32,
        valid: bool,
        itt_addr: u64,
        num_eventid_bits: u32,
    ) -> Result<()> {
        if u64::from(device_id) >= 1u64 << self.config.device_id_bits
            || table_entry_addr(&self.mem, q.baser_device, device_id).is_none()
        {
            return Err(ProtocolError::MapdDeviceOor.into());
        }
        if valid && num_eventid_bits > self.config.event_id_bits {
            return Err(ProtocolError::MapdIttSizeOor.into());
        }

        // Remapping a device starts from an empty ITT.
        let stale = tables.remove_device(device_id);
        if valid {
            tables.insert_device(Device::new(device_id, num_eventid_bits, itt_addr));
        }

        // Saved entries of the old mapping must not come back on restore.
        if let Some(old) = stale {
            debug!("[ITS] unmapped device {}", device_id);
            for &event_id in old.ites.keys() {
                self.clear_itt_entry(old.itt_addr, event_id)?;
            }
        }
        if !valid {
            self.clear_device_entry(q.baser_device, device_id)?;
        }
        Ok(())
    }

    fn cmd_mapc(
        &self,
        q: &CommandQueue,
        tables: &mut ItsTables,
        collection_id: u32,
        valid: bool,
        target_addr: u32,
    ) -> Result<()> {
        if target_addr >= self.redist.vcpu_count() {
            return Err(ProtocolError::MapcProcnumOor.into());
        }

        if !valid {
            tables.remove_collection(collection_id);
        } else if tables.collection(collection_id).is_some() {
            tables.retarget_collection(collection_id, target_addr);
        } else {
            self.check_collection_id(q, collection_id)?;
            tables.insert_collection(collection_id, target_addr);
        }
        Ok(())
    }

    fn check_collection_id(&self, q: &CommandQueue, collection_id: u32) -> Result<()> {
        if u64::from(collection_id) >= 1u64 << self.config.collection_id_bits
            || table_entry_addr(&self.mem, q.baser_coll, collection_id).is_none()
        {
            return Err(ProtocolError::MapcCollectionOor.into());
        }
        Ok(())
    }

    fn cmd_mapti(
        &self,
        q: &CommandQueue,
        tables: &mut ItsTables,
        device_id: u32,
        event_id: u32,
        intid: u32,
        collection_id: u32,
    ) -> Result<()> {
        let device = tables
            .device(device_id)
            .ok_or(ProtocolError::MaptiUnmappedDevice)?;
        if u64::from(event_id) >= 1u64 << device.num_eventid_bits {
            return Err(ProtocolError::MaptiIdOor.into());
        }
        if intid < GIC_LPI_OFFSET || intid >= max_lpis(self.redist.propbaser()) {
            return Err(ProtocolError::MaptiPhysicalIdOor.into());
        }

        // An existing translation is left untouched.
        if tables.ite(device_id, event_id).is_some() {
            return Ok(());
        }

        let new_collection = tables.collection(collection_id).is_none();
        if new_collection {
            self.check_collection_id(q, collection_id)?;
            tables.insert_collection(collection_id, COLLECTION_NOT_MAPPED);
        }

        let target = tables.mapped_target(Some(collection_id));
        let lpi = match self.lpis.acquire(intid, target) {
            Ok(lpi) => lpi,
            Err(e) => {
                if new_collection {
                    tables.remove_collection(collection_id);
                }
                return Err(e.into());
            }
        };
        if target.is_some() {
            lpi.retarget(target);
        }

        tables.insert_ite(
            device_id,
            Ite {
                event_id,
                lpi,
                collection: Some(collection_id),
            },
        );
        Ok(())
    }

    fn cmd_movi(
        tables: &mut ItsTables,
        device_id: u32,
        event_id: u32,
        collection_id: u32,
    ) -> Result<()> {
        let current = tables
            .ite(device_id, event_id)
            .ok_or(ProtocolError::MoviUnmappedInterrupt)?
            .collection;
        if tables.mapped_target(current).is_none() {
            return Err(ProtocolError::MoviUnmappedCollection.into());
        }
        let target = tables
            .mapped_target(Some(collection_id))
            .ok_or(ProtocolError::MoviUnmappedCollection)?;

        tables.move_ite(device_id, event_id, collection_id, target);
        Ok(())
    }

    fn cmd_discard(&self, tables: &mut ItsTables, device_id: u32, event_id: u32) -> Result<()> {
        let itt_addr = tables
            .ite(device_id, event_id)
            .and_then(|ite| tables.mapped_target(ite.collection))
            .and(tables.device(device_id))
            .map(|device| device.itt_addr)
            .ok_or(ProtocolError::DiscardUnmappedInterrupt)?;

        tables.remove_ite(device_id, event_id);
        self.clear_itt_entry(itt_addr, event_id)
    }

    fn cmd_invall(&self, tables: &ItsTables, collection_id: u32) -> Result<()> {
        let target = tables
            .mapped_target(Some(collection_id))
            .ok_or(ProtocolError::InvallUnmappedCollection)?;

        for intid in self.lpis.copy_ids_for(target) {
            if let Some(lpi) = self.lpis.get(intid) {
                self.lpis.update_config(&lpi, Some(target))?;
            }
        }
        Ok(())
    }

    fn cmd_movall(&self, target1: u32, target2: u32) -> Result<()> {
        let vcpu_count = self.redist.vcpu_count();
        if target1 >= vcpu_count || target2 >= vcpu_count {
            return Err(ProtocolError::MovallProcnumOor.into());
        }
        if target1 == target2 {
            return Ok(());
        }

        for intid in self.lpis.copy_ids_for(target1) {
            if let Some(lpi) = self.lpis.get(intid) {
                self.lpis.retarget(&lpi, Some(target2));
            }
        }
        Ok(())
    }

    /// Makes the LPI mapped to `device_id`/`event_id` pending.
    pub(super) fn trigger(
        &self,
        tables: &ItsTables,
        device_id: u32,
        event_id: u32,
    ) -> Result<MsiDelivery> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(MsiDelivery::Blocked);
        }

        let ite = tables
            .ite(device_id, event_id)
            .ok_or(ProtocolError::IntUnmappedInterrupt)?;
        let vcpuid = tables
            .mapped_target(ite.collection)
            .ok_or(ProtocolError::IntUnmappedCollection)?;
        if vcpuid >= self.redist.vcpu_count() {
            return Err(ProtocolError::IntUnmappedInterrupt.into());
        }
        if !self.redist.lpis_enabled(vcpuid) {
            return Ok(MsiDelivery::Blocked);
        }

        if let Some(target) = ite.lpi.set_pending() {
            self.redist.queue_lpi(target, ite.lpi.intid());
        }
        Ok(MsiDelivery::Delivered)
    }
}
