// Copyright 2026 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Saving and restoring the ITS state through the guest's device, collection and ITT tables.
//!
//! Entries are 8 bytes and little-endian. Device table entries and ITT entries carry the
//! distance to the next valid entry, so sparse tables can be walked without visiting every
//! slot.

use std::marker::PhantomData;

use vm_memory::{Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};

use super::lpi::GIC_LPI_OFFSET;
use super::regs::{genmask, Baser, SZ_64K};
use super::tables::{Device, Ite, ItsTables, COLLECTION_NOT_MAPPED};
use super::{Its, ItsError, Result};

pub const DTE_ESZ: u64 = 8;
pub const CTE_ESZ: u64 = 8;
pub const ITE_ESZ: u64 = 8;
const L1E_ESZ: u64 = 8;

const DTE_VALID_SHIFT: u64 = 63;
const DTE_NEXT_SHIFT: u64 = 49;
const DTE_NEXT_MASK: u64 = genmask(62, 49);
const DTE_ITTADDR_SHIFT: u64 = 5;
const DTE_ITTADDR_MASK: u64 = genmask(48, 5);
const DTE_SIZE_MASK: u64 = genmask(4, 0);
const DTE_MAX_DEVID_OFFSET: u32 = (1 << 14) - 1;

const CTE_VALID_SHIFT: u64 = 63;
const CTE_RDBASE_SHIFT: u64 = 16;
const CTE_RDBASE_MASK: u64 = genmask(47, 16);
const CTE_ICID_MASK: u64 = genmask(15, 0);

const ITE_NEXT_SHIFT: u64 = 48;
const ITE_PINTID_SHIFT: u64 = 16;
const ITE_PINTID_MASK: u64 = genmask(47, 16);
const ITE_ICID_MASK: u64 = genmask(15, 0);
const ITE_MAX_EVENTID_OFFSET: u32 = (1 << 16) - 1;

const L1E_VALID: u64 = 1 << 63;
const L1E_ADDR_MASK: u64 = genmask(51, 16);

fn read_u64(mem: &GuestMemoryMmap, gpa: u64) -> std::result::Result<u64, GuestMemoryError> {
    let mut buf = [0u8; 8];
    mem.read_slice(&mut buf, GuestAddress(gpa))?;
    Ok(u64::from_le_bytes(buf))
}

fn write_u64(
    mem: &GuestMemoryMmap,
    gpa: u64,
    val: u64,
) -> std::result::Result<(), GuestMemoryError> {
    mem.write_slice(&val.to_le_bytes(), GuestAddress(gpa))
}

/// Guest address of the entry for `id` in the table described by `baser`, or `None` if the
/// table can't hold it.
///
/// For a two-level table the level 1 entry covering `id` has to be valid.
pub fn table_entry_addr(mem: &GuestMemoryMmap, baser: Baser, id: u32) -> Option<u64> {
    let esz = baser.entry_size();
    let id = u64::from(id);

    if !baser.is_indirect() {
        return if id < baser.table_size() / esz {
            Some(baser.address() + id * esz)
        } else {
            None
        };
    }

    let ids_per_page = SZ_64K / esz;
    let index = id / ids_per_page;
    if index >= baser.table_size() / L1E_ESZ {
        return None;
    }
    let l1 = match read_u64(mem, baser.address() + index * L1E_ESZ) {
        Ok(entry) => L1Entry::decode(entry),
        Err(e) => {
            debug!("[ITS] cannot read level 1 entry {}: {}", index, e);
            return None;
        }
    };
    if !l1.valid {
        return None;
    }
    Some(l1.addr + (id % ids_per_page) * esz)
}

/// An entry of one of the in-memory tables.
pub trait TableEntry: Sized {
    fn decode(raw: u64) -> Self;

    /// Distance in entries to the next one worth visiting; 0 ends the walk.
    fn next_offset(&self) -> u32;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dte {
    pub valid: bool,
    pub next: u32,
    pub itt_addr: u64,
    pub num_eventid_bits: u32,
}

impl Dte {
    pub fn encode(&self) -> u64 {
        (u64::from(self.valid) << DTE_VALID_SHIFT)
            | ((u64::from(self.next) << DTE_NEXT_SHIFT) & DTE_NEXT_MASK)
            | (((self.itt_addr >> 8) << DTE_ITTADDR_SHIFT) & DTE_ITTADDR_MASK)
            | (u64::from(self.num_eventid_bits - 1) & DTE_SIZE_MASK)
    }
}

impl TableEntry for Dte {
    fn decode(raw: u64) -> Self {
        Self {
            valid: raw >> DTE_VALID_SHIFT != 0,
            next: ((raw & DTE_NEXT_MASK) >> DTE_NEXT_SHIFT) as u32,
            itt_addr: ((raw & DTE_ITTADDR_MASK) >> DTE_ITTADDR_SHIFT) << 8,
            num_eventid_bits: (raw & DTE_SIZE_MASK) as u32 + 1,
        }
    }

    fn next_offset(&self) -> u32 {
        if self.valid {
            self.next
        } else {
            1
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cte {
    pub valid: bool,
    pub target_addr: u32,
    pub collection_id: u32,
}

impl Cte {
    pub fn encode(&self) -> u64 {
        (u64::from(self.valid) << CTE_VALID_SHIFT)
            | ((u64::from(self.target_addr) << CTE_RDBASE_SHIFT) & CTE_RDBASE_MASK)
            | (u64::from(self.collection_id) & CTE_ICID_MASK)
    }
}

impl TableEntry for Cte {
    fn decode(raw: u64) -> Self {
        Self {
            valid: raw >> CTE_VALID_SHIFT != 0,
            target_addr: ((raw & CTE_RDBASE_MASK) >> CTE_RDBASE_SHIFT) as u32,
            collection_id: (raw & CTE_ICID_MASK) as u32,
        }
    }

    // The collection table is packed and ends at the first invalid entry.
    fn next_offset(&self) -> u32 {
        u32::from(self.valid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IttEntry {
    pub next: u32,
    /// 0 marks an unused entry.
    pub intid: u32,
    pub collection_id: u32,
}

impl IttEntry {
    pub fn encode(&self) -> u64 {
        (u64::from(self.next) << ITE_NEXT_SHIFT)
            | ((u64::from(self.intid) << ITE_PINTID_SHIFT) & ITE_PINTID_MASK)
            | (u64::from(self.collection_id) & ITE_ICID_MASK)
    }
}

impl TableEntry for IttEntry {
    fn decode(raw: u64) -> Self {
        Self {
            next: (raw >> ITE_NEXT_SHIFT) as u32,
            intid: ((raw & ITE_PINTID_MASK) >> ITE_PINTID_SHIFT) as u32,
            collection_id: (raw & ITE_ICID_MASK) as u32,
        }
    }

    fn next_offset(&self) -> u32 {
        if self.intid == 0 {
            1
        } else {
            self.next
        }
    }
}

/// Level 1 entry of a two-level device table, pointing at a 64K page of DTEs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct L1Entry {
    pub valid: bool,
    pub addr: u64,
}

impl TableEntry for L1Entry {
    fn decode(raw: u64) -> Self {
        Self {
            valid: raw & L1E_VALID != 0,
            addr: raw & L1E_ADDR_MASK,
        }
    }

    fn next_offset(&self) -> u32 {
        1
    }
}

/// Walks a table, following the next-entry offsets, and yields `(id, entry)` pairs.
///
/// The walk ends after an entry whose offset is 0, or once the offset leads out of the table.
pub struct TableScan<'a, T> {
    mem: &'a GuestMemoryMmap,
    gpa: u64,
    remaining: u64,
    esz: u64,
    id: u32,
    done: bool,
    entry: PhantomData<T>,
}

impl<'a, T: TableEntry> TableScan<'a, T> {
    pub fn new(mem: &'a GuestMemoryMmap, gpa: u64, size: u64, esz: u64, start_id: u32) -> Self {
        Self {
            mem,
            gpa,
            remaining: size,
            esz,
            id: start_id,
            done: size < esz,
            entry: PhantomData,
        }
    }
}

impl<'a, T: TableEntry> Iterator for TableScan<'a, T> {
    type Item = std::result::Result<(u32, T), GuestMemoryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let entry = match read_u64(self.mem, self.gpa) {
            Ok(raw) => T::decode(raw),
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let id = self.id;

        let next = entry.next_offset();
        let byte_offset = u64::from(next) * self.esz;
        if next == 0 || byte_offset >= self.remaining {
            self.done = true;
        } else {
            self.id += next;
            self.gpa += byte_offset;
            self.remaining -= byte_offset;
        }
        Some(Ok((id, entry)))
    }
}

impl Its {
    /// Flushes devices, ITTs and collections to the tables the guest has provided.
    pub(super) fn save_tables(&self) -> Result<()> {
        let q = self.cmdq.lock().unwrap();
        let tables = self.tables.lock().unwrap();

        self.save_device_table(q.baser_device, &tables)?;
        self.save_collection_table(q.baser_coll, &tables)
    }

    /// Rebuilds devices, ITTs and collections from the guest tables.
    ///
    /// On failure the state rebuilt so far is dropped again.
    pub(super) fn restore_tables(&self) -> Result<()> {
        let q = self.cmdq.lock().unwrap();
        let mut tables = self.tables.lock().unwrap();

        if let Err(e) = self.restore_collection_table(q.baser_coll, &mut tables) {
            tables.clear_collections();
            return Err(e);
        }
        if let Err(e) = self.restore_device_table(q.baser_device, &mut tables) {
            tables.clear();
            return Err(e);
        }
        Ok(())
    }

    fn save_device_table(&self, baser: Baser, tables: &ItsTables) -> Result<()> {
        if !baser.is_valid() {
            return Ok(());
        }

        let mut devices = tables.devices().peekable();
        while let Some(device) = devices.next() {
            let gpa = table_entry_addr(&self.mem, baser, device.device_id)
                .ok_or(ItsError::InvalidTableEntry("device outside of the device table"))?;
            self.save_itt(device, tables)?;

            let next = devices.peek().map_or(0, |n| {
                (n.device_id - device.device_id).min(DTE_MAX_DEVID_OFFSET)
            });
            let dte = Dte {
                valid: true,
                next,
                itt_addr: device.itt_addr,
                num_eventid_bits: device.num_eventid_bits,
            };
            write_u64(&self.mem, gpa, dte.encode())?;
        }
        Ok(())
    }

    fn save_itt(&self, device: &Device, tables: &ItsTables) -> Result<()> {
        // An ITE without a collection has no entry to be saved as.
        for ite in device.ites.values().filter(|ite| ite.collection.is_none()) {
            warn!(
                "[ITS] not saving detached event {} of device {}",
                ite.event_id, device.device_id
            );
            self.clear_itt_entry(device.itt_addr, ite.event_id)?;
        }

        let mut ites = device
            .ites
            .values()
            .filter(|ite| ite.collection.is_some())
            .peekable();

        while let Some(ite) = ites.next() {
            let collection_id = match ite.collection.and_then(|id| tables.collection(id)) {
                Some(coll) => coll.collection_id,
                None => continue,
            };
            let next = ites.peek().map_or(0, |n| {
                (n.event_id - ite.event_id).min(ITE_MAX_EVENTID_OFFSET)
            });
            let entry = IttEntry {
                next,
                intid: ite.lpi.intid(),
                collection_id,
            };
            let gpa = device.itt_addr + u64::from(ite.event_id) * ITE_ESZ;
            write_u64(&self.mem, gpa, entry.encode())?;
        }
        Ok(())
    }

    /// Invalidates the saved entry of an event that is no longer mapped.
    pub(super) fn clear_itt_entry(&self, itt_addr: u64, event_id: u32) -> Result<()> {
        write_u64(&self.mem, itt_addr + u64::from(event_id) * ITE_ESZ, 0)?;
        Ok(())
    }

    /// Invalidates the saved entry of a device that is no longer mapped.
    pub(super) fn clear_device_entry(&self, baser: Baser, device_id: u32) -> Result<()> {
        if let Some(gpa) = table_entry_addr(&self.mem, baser, device_id) {
            write_u64(&self.mem, gpa, 0)?;
        }
        Ok(())
    }

    fn save_collection_table(&self, baser: Baser, tables: &ItsTables) -> Result<()> {
        if !baser.is_valid() {
            return Ok(());
        }

        let size = baser.table_size();
        let mut gpa = baser.address();
        let mut filled = 0;
        for coll in tables.collections() {
            if filled + CTE_ESZ > size {
                return Err(ItsError::InvalidTableEntry("collection table is full"));
            }
            let cte = Cte {
                valid: true,
                target_addr: coll.target_addr,
                collection_id: coll.collection_id,
            };
            write_u64(&self.mem, gpa, cte.encode())?;
            gpa += CTE_ESZ;
            filled += CTE_ESZ;
        }

        if filled == size {
            return Ok(());
        }
        // Terminate a partially filled table.
        write_u64(&self.mem, gpa, 0)?;
        Ok(())
    }

    fn restore_collection_table(&self, baser: Baser, tables: &mut ItsTables) -> Result<()> {
        if !baser.is_valid() {
            return Ok(());
        }

        let vcpu_count = self.redist.vcpu_count();
        let scan =
            TableScan::<Cte>::new(&self.mem, baser.address(), baser.table_size(), CTE_ESZ, 0);
        for entry in scan {
            let (_, cte) = entry?;
            if !cte.valid {
                break;
            }
            if cte.target_addr != COLLECTION_NOT_MAPPED && cte.target_addr >= vcpu_count {
                return Err(ItsError::InvalidTableEntry("collection target out of range"));
            }
            if tables.collection(cte.collection_id).is_some() {
                return Err(ItsError::DuplicateCollection(cte.collection_id));
            }
            if table_entry_addr(&self.mem, baser, cte.collection_id).is_none() {
                return Err(ItsError::InvalidTableEntry("collection ID out of range"));
            }
            tables.insert_collection(cte.collection_id, cte.target_addr);
        }
        Ok(())
    }

    fn restore_device_table(&self, baser: Baser, tables: &mut ItsTables) -> Result<()> {
        if !baser.is_valid() {
            return Ok(());
        }

        let esz = baser.entry_size();
        if !baser.is_indirect() {
            let scan =
                TableScan::<Dte>::new(&self.mem, baser.address(), baser.table_size(), esz, 0);
            self.restore_dtes(scan, tables)?;
            return Ok(());
        }

        let ids_per_page = (SZ_64K / esz) as u32;
        let l1_scan =
            TableScan::<L1Entry>::new(&self.mem, baser.address(), baser.table_size(), L1E_ESZ, 0);
        for entry in l1_scan {
            let (index, l1) = entry?;
            if !l1.valid {
                continue;
            }
            let start_id = index * ids_per_page;
            let scan = TableScan::<Dte>::new(&self.mem, l1.addr, SZ_64K, esz, start_id);
            // The last device ends the whole walk, not just this page.
            if self.restore_dtes(scan, tables)? {
                break;
            }
        }
        Ok(())
    }

    /// Restores the devices of one (level 2) device table page. Returns true once the entry of
    /// the last device has been seen.
    fn restore_dtes(&self, scan: TableScan<Dte>, tables: &mut ItsTables) -> Result<bool> {
        for entry in scan {
            let (device_id, dte) = entry?;
            if !dte.valid {
                continue;
            }
            if dte.num_eventid_bits > self.config.event_id_bits {
                return Err(ItsError::InvalidTableEntry("ITT size out of range"));
            }
            if tables.device(device_id).is_some() {
                return Err(ItsError::InvalidTableEntry("duplicate device"));
            }

            tables.insert_device(Device::new(device_id, dte.num_eventid_bits, dte.itt_addr));
            if let Err(e) = self.restore_itt(device_id, dte, tables) {
                tables.remove_device(device_id);
                return Err(e);
            }
            if dte.next == 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn restore_itt(&self, device_id: u32, dte: Dte, tables: &mut ItsTables) -> Result<()> {
        let max_events = 1u64 << dte.num_eventid_bits;
        let scan =
            TableScan::<IttEntry>::new(&self.mem, dte.itt_addr, max_events * ITE_ESZ, ITE_ESZ, 0);

        for entry in scan {
            let (event_id, ite) = entry?;
            if ite.intid == 0 {
                continue;
            }
            if ite.intid < GIC_LPI_OFFSET {
                return Err(ItsError::InvalidTableEntry("INTID outside of the LPI range"));
            }
            if u64::from(event_id) + u64::from(ite.next) >= max_events {
                return Err(ItsError::InvalidTableEntry("event ID out of range"));
            }
            if tables.ite(device_id, event_id).is_some() {
                return Err(ItsError::InvalidTableEntry("duplicate event"));
            }
            let coll = tables
                .collection(ite.collection_id)
                .ok_or(ItsError::InvalidTableEntry("event routed to unknown collection"))?;

            let target = tables.mapped_target(Some(coll.collection_id));
            let lpi = self.lpis.acquire(ite.intid, target)?;
            tables.insert_ite(
                device_id,
                Ite {
                    event_id,
                    lpi,
                    collection: Some(ite.collection_id),
                },
            );
        }
        Ok(())
    }
}
