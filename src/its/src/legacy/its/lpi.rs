// Copyright 2026 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! VM-wide registry of the LPIs mapped by the ITSs.
//!
//! An [`Lpi`] exists once per INTID. Every ITE holding it owns an [`LpiRef`], which gives the
//! reference back to the registry when it is dropped; the last one removes the LPI.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use super::regs::genmask;
use super::{ItsError, Redistributor, Result};

/// First INTID of the LPI range.
pub const GIC_LPI_OFFSET: u32 = 8192;

/// Maximum width of an INTID handled through the ITS.
pub const INTERRUPT_ID_BITS_ITS: u32 = 16;

const LPI_PROP_ENABLE_BIT: u8 = 1 << 0;
const LPI_PROP_PRIORITY_MASK: u8 = 0xfc;

const GICR_PROPBASER_ADDRESS_MASK: u64 = genmask(51, 12);
const GICR_PROPBASER_IDBITS_MASK: u64 = 0x1f;
const GICR_PENDBASER_ADDRESS_MASK: u64 = genmask(51, 16);

/// Guest physical address of the LPI configuration table.
pub fn propbase_address(propbaser: u64) -> u64 {
    propbaser & GICR_PROPBASER_ADDRESS_MASK
}

/// Number of INTIDs covered by the LPI configuration table.
pub fn max_lpis(propbaser: u64) -> u32 {
    let nr_idbits = (propbaser & GICR_PROPBASER_IDBITS_MASK) as u32 + 1;
    1 << nr_idbits.min(INTERRUPT_ID_BITS_ITS)
}

pub fn pendbase_address(pendbaser: u64) -> u64 {
    pendbaser & GICR_PENDBASER_ADDRESS_MASK
}

/// Snapshot of the mutable part of an LPI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LpiState {
    pub priority: u8,
    pub enabled: bool,
    pub pending_latch: bool,
    pub target_vcpu: Option<u32>,
}

pub struct Lpi {
    intid: u32,
    state: Mutex<LpiState>,
}

impl Lpi {
    fn new(intid: u32, prop: u8, pending: bool, target_vcpu: Option<u32>) -> Self {
        Self {
            intid,
            state: Mutex::new(LpiState {
                priority: prop & LPI_PROP_PRIORITY_MASK,
                enabled: prop & LPI_PROP_ENABLE_BIT != 0,
                pending_latch: pending,
                target_vcpu,
            }),
        }
    }

    pub fn intid(&self) -> u32 {
        self.intid
    }

    pub fn state(&self) -> LpiState {
        *self.state.lock().unwrap()
    }

    pub fn target(&self) -> Option<u32> {
        self.state.lock().unwrap().target_vcpu
    }

    /// Returns the previous target along with the state after the change.
    fn swap_target(&self, target_vcpu: Option<u32>) -> (Option<u32>, LpiState) {
        let mut state = self.state.lock().unwrap();
        let old = std::mem::replace(&mut state.target_vcpu, target_vcpu);
        (old, *state)
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().unwrap().pending_latch
    }

    pub fn clear_pending(&self) {
        self.state.lock().unwrap().pending_latch = false;
    }

    /// Latches the LPI as pending. Returns the vCPU it has to be queued on, if any.
    ///
    /// An enabled LPI is handed over on every trigger; the redistributor doesn't queue an
    /// INTID twice, so a trigger before the guest acknowledged the LPI collapses into it.
    pub(crate) fn set_pending(&self) -> Option<u32> {
        let mut state = self.state.lock().unwrap();
        state.pending_latch = true;
        if state.enabled {
            state.target_vcpu
        } else {
            None
        }
    }

    /// Applies a configuration byte from the property table, unless `filter` names a vCPU the
    /// LPI isn't targeting.
    fn apply_config(&self, prop: u8, filter: Option<u32>) -> Option<Handover> {
        let mut state = self.state.lock().unwrap();
        if filter.is_some() && filter != state.target_vcpu {
            return None;
        }

        let was_enabled = state.enabled;
        state.priority = prop & LPI_PROP_PRIORITY_MASK;
        state.enabled = prop & LPI_PROP_ENABLE_BIT != 0;
        let vcpuid = state.target_vcpu?;
        match (was_enabled, state.enabled) {
            (false, true) if state.pending_latch => Some(Handover::Queue(vcpuid)),
            (true, false) => Some(Handover::Withdraw(vcpuid)),
            _ => None,
        }
    }
}

/// What a configuration change asks of the redistributor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Handover {
    Queue(u32),
    Withdraw(u32),
}

impl fmt::Debug for Lpi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Lpi")
            .field("intid", &self.intid)
            .field("state", &self.state())
            .finish()
    }
}

struct LpiEntry {
    lpi: Arc<Lpi>,
    refcount: usize,
}

/// The LPIs of one VM, shared by all its ITSs.
pub struct LpiRegistry {
    mem: GuestMemoryMmap,
    redist: Arc<dyn Redistributor>,
    lpis: Mutex<BTreeMap<u32, LpiEntry>>,
}

impl LpiRegistry {
    pub fn new(mem: GuestMemoryMmap, redist: Arc<dyn Redistributor>) -> Self {
        Self {
            mem,
            redist,
            lpis: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn guest_memory(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    pub fn redistributor(&self) -> &Arc<dyn Redistributor> {
        &self.redist
    }

    /// Takes a reference on the LPI `intid`, creating it if needed.
    ///
    /// A new LPI is targeted at `target_vcpu`, gets its configuration from the property table
    /// and its pending state from the pending table of its target.
    pub fn acquire(self: &Arc<Self>, intid: u32, target_vcpu: Option<u32>) -> Result<LpiRef> {
        if intid < GIC_LPI_OFFSET || intid >= max_lpis(self.redist.propbaser()) {
            return Err(ItsError::LpiOutOfRange(intid));
        }
        if let Some(lpi) = self.take_ref(intid) {
            return Ok(LpiRef {
                lpi,
                registry: self.clone(),
            });
        }

        // The configuration is only cached for mapped LPIs, so read it in now.
        let prop = self.read_config(intid)?;
        let pending = match target_vcpu {
            Some(vcpuid) => self.read_pending(intid, vcpuid)?,
            None => false,
        };

        let mut created = false;
        let lpi = {
            let mut lpis = self.lpis.lock().unwrap();
            let entry = match lpis.entry(intid) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    created = true;
                    entry.insert(LpiEntry {
                        lpi: Arc::new(Lpi::new(intid, prop, pending, target_vcpu)),
                        refcount: 0,
                    })
                }
            };
            entry.refcount += 1;
            entry.lpi.clone()
        };

        if created {
            debug!("[ITS] new LPI {} targeting {:?}", intid, target_vcpu);
            let state = lpi.state();
            if let (true, true, Some(vcpuid)) =
                (state.pending_latch, state.enabled, state.target_vcpu)
            {
                self.redist.queue_lpi(vcpuid, intid);
            }
        }

        Ok(LpiRef {
            lpi,
            registry: self.clone(),
        })
    }

    fn take_ref(&self, intid: u32) -> Option<Arc<Lpi>> {
        let mut lpis = self.lpis.lock().unwrap();
        lpis.get_mut(&intid).map(|entry| {
            entry.refcount += 1;
            entry.lpi.clone()
        })
    }

    fn release(&self, intid: u32) {
        let mut lpis = self.lpis.lock().unwrap();
        if let Entry::Occupied(mut entry) = lpis.entry(intid) {
            entry.get_mut().refcount -= 1;
            if entry.get().refcount == 0 {
                debug!("[ITS] freeing LPI {}", intid);
                let lpi = entry.remove().lpi;
                // Kept under the registry lock, so a new LPI with this INTID isn't withdrawn.
                if let Some(vcpuid) = lpi.target() {
                    self.redist.dequeue_lpi(vcpuid, intid);
                }
            }
        }
    }

    /// Looks up an LPI without taking a reference on it.
    pub fn get(&self, intid: u32) -> Option<Arc<Lpi>> {
        self.lpis
            .lock()
            .unwrap()
            .get(&intid)
            .map(|entry| entry.lpi.clone())
    }

    pub fn refcount(&self, intid: u32) -> usize {
        self.lpis
            .lock()
            .unwrap()
            .get(&intid)
            .map_or(0, |entry| entry.refcount)
    }

    pub fn len(&self) -> usize {
        self.lpis.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// INTIDs of the LPIs currently targeting `vcpuid`.
    ///
    /// The list is a snapshot: LPIs may be retargeted or freed once the registry lock is
    /// dropped, so callers look each of them up again.
    pub fn copy_ids_for(&self, vcpuid: u32) -> Vec<u32> {
        let lpis = self.lpis.lock().unwrap();
        lpis.values()
            .filter(|entry| entry.lpi.target() == Some(vcpuid))
            .map(|entry| entry.lpi.intid())
            .collect()
    }

    fn read_config(&self, intid: u32) -> Result<u8> {
        let propbase = propbase_address(self.redist.propbaser());
        let addr = propbase + u64::from(intid - GIC_LPI_OFFSET);
        let mut prop = [0u8; 1];
        self.mem.read_slice(&mut prop, GuestAddress(addr))?;
        Ok(prop[0])
    }

    fn read_pending(&self, intid: u32, vcpuid: u32) -> Result<bool> {
        let pendbase = pendbase_address(self.redist.pendbaser(vcpuid));
        let mut byte = [0u8; 1];
        self.mem
            .read_slice(&mut byte, GuestAddress(pendbase + u64::from(intid / 8)))?;
        Ok(byte[0] & (1 << (intid % 8)) != 0)
    }

    /// Refreshes priority and enable bit of `lpi` from the property table.
    ///
    /// With a `filter`, LPIs not targeting that vCPU are left alone.
    pub fn update_config(&self, lpi: &Lpi, filter: Option<u32>) -> Result<()> {
        let prop = self.read_config(lpi.intid())?;
        match lpi.apply_config(prop, filter) {
            Some(Handover::Queue(vcpuid)) => self.redist.queue_lpi(vcpuid, lpi.intid()),
            Some(Handover::Withdraw(vcpuid)) => {
                self.redist.dequeue_lpi(vcpuid, lpi.intid());
            }
            None => (),
        }
        Ok(())
    }

    /// Routes `lpi` to `target_vcpu`. A pending LPI leaves the queue of its old target and,
    /// if it is enabled, joins the queue of the new one.
    pub fn retarget(&self, lpi: &Lpi, target_vcpu: Option<u32>) {
        let (old, state) = lpi.swap_target(target_vcpu);
        if old == target_vcpu {
            return;
        }
        if let Some(vcpuid) = old {
            self.redist.dequeue_lpi(vcpuid, lpi.intid());
        }
        if let (true, true, Some(vcpuid)) = (state.pending_latch, state.enabled, target_vcpu) {
            self.redist.queue_lpi(vcpuid, lpi.intid());
        }
    }

    /// Drops the pending state of `lpi`, withdrawing it from its target if it was queued.
    pub fn clear_pending(&self, lpi: &Lpi) {
        lpi.clear_pending();
        if let Some(vcpuid) = lpi.target() {
            self.redist.dequeue_lpi(vcpuid, lpi.intid());
        }
    }

    /// Consumes the pending state of an LPI a vCPU has taken from its queue.
    pub fn acknowledge(&self, intid: u32) {
        if let Some(lpi) = self.get(intid) {
            lpi.clear_pending();
        }
    }

    /// Writes the pending state of every targeted LPI to its vCPU's pending table.
    pub fn save_pending_tables(&self) -> Result<()> {
        let snapshot: Vec<(u32, LpiState)> = {
            let lpis = self.lpis.lock().unwrap();
            lpis.values()
                .map(|entry| (entry.lpi.intid(), entry.lpi.state()))
                .collect()
        };

        for (intid, state) in snapshot {
            let vcpuid = match state.target_vcpu {
                Some(vcpuid) => vcpuid,
                None => continue,
            };
            let addr = GuestAddress(
                pendbase_address(self.redist.pendbaser(vcpuid)) + u64::from(intid / 8),
            );
            let bit = 1u8 << (intid % 8);

            let mut byte = [0u8; 1];
            self.mem.read_slice(&mut byte, addr)?;
            let stored = byte[0] & bit != 0;
            if stored == state.pending_latch {
                continue;
            }
            if state.pending_latch {
                byte[0] |= bit;
            } else {
                byte[0] &= !bit;
            }
            self.mem.write_slice(&byte, addr)?;
        }
        Ok(())
    }
}

/// A counted reference on a registered LPI.
pub struct LpiRef {
    lpi: Arc<Lpi>,
    registry: Arc<LpiRegistry>,
}

impl LpiRef {
    pub fn lpi(&self) -> &Arc<Lpi> {
        &self.lpi
    }

    pub fn retarget(&self, target_vcpu: Option<u32>) {
        self.registry.retarget(&self.lpi, target_vcpu);
    }
}

impl Deref for LpiRef {
    type Target = Lpi;

    fn deref(&self) -> &Lpi {
        &self.lpi
    }
}

impl Drop for LpiRef {
    fn drop(&mut self) {
        self.registry.release(self.lpi.intid());
    }
}

impl fmt::Debug for LpiRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.lpi.fmt(f)
    }
}
