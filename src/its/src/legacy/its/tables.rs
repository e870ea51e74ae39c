// Copyright 2026 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use super::lpi::LpiRef;

/// Target of a collection that has been allocated by MAPTI but never mapped by MAPC.
pub const COLLECTION_NOT_MAPPED: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Collection {
    pub collection_id: u32,
    pub target_addr: u32,
}

impl Collection {
    pub fn is_mapped(&self) -> bool {
        self.target_addr != COLLECTION_NOT_MAPPED
    }
}

/// Interrupt translation entry: maps an event of a device onto an LPI.
#[derive(Debug)]
pub struct Ite {
    pub event_id: u32,
    pub lpi: LpiRef,
    /// `None` once the collection has been unmapped from under the ITE.
    pub collection: Option<u32>,
}

#[derive(Debug)]
pub struct Device {
    pub device_id: u32,
    pub num_eventid_bits: u32,
    pub itt_addr: u64,
    pub ites: BTreeMap<u32, Ite>,
}

impl Device {
    pub fn new(device_id: u32, num_eventid_bits: u32, itt_addr: u64) -> Self {
        Self {
            device_id,
            num_eventid_bits,
            itt_addr,
            ites: BTreeMap::new(),
        }
    }
}

/// Devices and collections known to one ITS, ordered by ID.
#[derive(Debug, Default)]
pub struct ItsTables {
    devices: BTreeMap<u32, Device>,
    collections: BTreeMap<u32, Collection>,
}

impl ItsTables {
    pub fn device(&self, device_id: u32) -> Option<&Device> {
        self.devices.get(&device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Inserts `device`, returning the one it replaces.
    pub fn insert_device(&mut self, device: Device) -> Option<Device> {
        self.devices.insert(device.device_id, device)
    }

    /// Removes a device; its ITEs go with it and release their LPIs.
    pub fn remove_device(&mut self, device_id: u32) -> Option<Device> {
        self.devices.remove(&device_id)
    }

    pub fn ite(&self, device_id: u32, event_id: u32) -> Option<&Ite> {
        self.devices.get(&device_id)?.ites.get(&event_id)
    }

    /// Adds `ite` to a mapped device. Returns false if the device is unknown.
    pub fn insert_ite(&mut self, device_id: u32, ite: Ite) -> bool {
        match self.devices.get_mut(&device_id) {
            Some(device) => {
                device.ites.insert(ite.event_id, ite);
                true
            }
            None => false,
        }
    }

    pub fn remove_ite(&mut self, device_id: u32, event_id: u32) -> Option<Ite> {
        self.devices.get_mut(&device_id)?.ites.remove(&event_id)
    }

    /// Points an ITE at `collection_id` and moves its LPI over to `target_addr`.
    pub fn move_ite(
        &mut self,
        device_id: u32,
        event_id: u32,
        collection_id: u32,
        target_addr: u32,
    ) -> bool {
        let ite = match self
            .devices
            .get_mut(&device_id)
            .and_then(|device| device.ites.get_mut(&event_id))
        {
            Some(ite) => ite,
            None => return false,
        };
        ite.collection = Some(collection_id);
        ite.lpi.retarget(Some(target_addr));
        true
    }

    pub fn collection(&self, collection_id: u32) -> Option<&Collection> {
        self.collections.get(&collection_id)
    }

    pub fn collections(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    /// vCPU a collection routes to, if it exists and is mapped.
    pub fn mapped_target(&self, collection_id: Option<u32>) -> Option<u32> {
        collection_id
            .and_then(|id| self.collections.get(&id))
            .filter(|coll| coll.is_mapped())
            .map(|coll| coll.target_addr)
    }

    pub fn insert_collection(&mut self, collection_id: u32, target_addr: u32) {
        self.collections.insert(
            collection_id,
            Collection {
                collection_id,
                target_addr,
            },
        );
    }

    /// Retargets a collection, and with it the LPIs of every ITE routed through it.
    pub fn retarget_collection(&mut self, collection_id: u32, target_addr: u32) {
        let coll = match self.collections.get_mut(&collection_id) {
            Some(coll) => coll,
            None => return,
        };
        coll.target_addr = target_addr;
        let target = Some(target_addr).filter(|&t| t != COLLECTION_NOT_MAPPED);

        for ite in self.ites_in(collection_id) {
            ite.lpi.retarget(target);
        }
    }

    /// Removes a collection. ITEs routed through it are detached and their LPIs lose their
    /// target.
    pub fn remove_collection(&mut self, collection_id: u32) -> Option<Collection> {
        let coll = self.collections.remove(&collection_id)?;
        for ite in self.ites_in_mut(collection_id) {
            ite.collection = None;
            ite.lpi.retarget(None);
        }
        Some(coll)
    }

    fn ites_in(&self, collection_id: u32) -> impl Iterator<Item = &Ite> {
        self.devices
            .values()
            .flat_map(|device| device.ites.values())
            .filter(move |ite| ite.collection == Some(collection_id))
    }

    fn ites_in_mut(&mut self, collection_id: u32) -> impl Iterator<Item = &mut Ite> {
        self.devices
            .values_mut()
            .flat_map(|device| device.ites.values_mut())
            .filter(move |ite| ite.collection == Some(collection_id))
    }

    pub fn clear_devices(&mut self) {
        self.devices.clear();
    }

    pub fn clear_collections(&mut self) {
        let ids: Vec<u32> = self.collections.keys().copied().collect();
        for collection_id in ids {
            self.remove_collection(collection_id);
        }
    }

    pub fn clear(&mut self) {
        self.clear_devices();
        self.clear_collections();
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.collections.is_empty()
    }
}
