//! Fixed-capacity registry of known peers
//!
//! The table stores [`Device`] records contiguously. A record's index always
//! equals its position, so removing a record shifts every later one down and
//! changes its index. Code that needs to refer to a record across such
//! changes holds a [`DeviceHandle`] instead of an index: the handle also
//! carries the record's insertion id and either resolves to the same record
//! or reports [`StaleHandle`].

use heapless::Vec;

use crate::{
    device::{Device, TagState},
    error::{AddError, StaleHandle},
    mac::ShortAddress,
};


/// A reference to a record that survives compaction of the table
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceHandle {
    index: usize,
    id: u32,
}

impl DeviceHandle {
    /// The index the record had when the handle was created
    pub fn index(&self) -> usize {
        self.index
    }
}


/// The outcome of a successful [`DeviceTable::add_device`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Insertion {
    /// A new record was appended
    Added(DeviceHandle),

    /// An inactive record with the same short address was reactivated
    Reactivated(DeviceHandle),
}

impl Insertion {
    /// The handle of the affected record
    pub fn handle(&self) -> DeviceHandle {
        match *self {
            Insertion::Added(handle) | Insertion::Reactivated(handle) => handle,
        }
    }
}


/// Registry of up to `N` peers
#[derive(Debug)]
pub struct DeviceTable<const N: usize> {
    devices: Vec<Device, N>,
    next_id: u32,
}

impl<const N: usize> DeviceTable<N> {
    /// Creates an empty table
    pub const fn new() -> Self {
        DeviceTable {
            devices: Vec::new(),
            next_id: 0,
        }
    }

    /// Adds a record, or reactivates an existing one
    ///
    /// With `match_by_short_address` set, an existing record with the same
    /// short address is reactivated if it's inactive, and the insertion is
    /// rejected if it's active. Otherwise, a record with the same identity
    /// causes a rejection. An active record with the same short address is
    /// rejected in both modes.
    pub fn add_device(
        &mut self,
        mut device: Device,
        match_by_short_address: bool,
        now_ms: u32,
    ) -> Result<Insertion, AddError> {
        let short_address = device.short_address();

        for existing in self.devices.iter() {
            if existing.is_active() && existing.is_short_address_equal(&device) {
                return Err(AddError::DuplicateActive(short_address.0));
            }
            if !match_by_short_address && existing.is_address_equal(&device) {
                return Err(AddError::AlreadyPresent);
            }
        }

        if match_by_short_address {
            let inactive = self.devices
                .iter_mut()
                .find(|existing| existing.is_short_address_equal(&device));

            if let Some(existing) = inactive {
                existing.note_activity(now_ms);
                debug!("reactivated device {=u16:#x}", short_address.0);
                return Ok(Insertion::Reactivated(DeviceHandle {
                    index: existing.index,
                    id: existing.id,
                }));
            }
        }

        let handle = DeviceHandle {
            index: self.devices.len(),
            id: self.next_id,
        };

        device.range = Default::default();
        device.index = handle.index;
        device.id = handle.id;
        device.note_activity(now_ms);

        self.devices.push(device).map_err(|_| AddError::TableFull)?;
        self.next_id = self.next_id.wrapping_add(1);

        debug!("added device {=u16:#x} at {=usize}", short_address.0, handle.index);
        Ok(Insertion::Added(handle))
    }

    /// Removes the record at `index`, shifting all later records down
    ///
    /// Returns `None`, if `index` is out of bounds.
    pub fn remove_device(&mut self, index: usize) -> Option<Device> {
        if index >= self.devices.len() {
            return None;
        }

        let removed = self.devices.remove(index);
        for (i, device) in self.devices.iter_mut().enumerate().skip(index) {
            device.index = i;
        }

        Some(removed)
    }

    /// Returns the record at `index`
    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    /// Returns the record at `index`
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Device> {
        self.devices.get_mut(index)
    }

    /// Returns the record with the given short address
    ///
    /// Prefers an active record over inactive ones sharing the address.
    pub fn by_short_address(&self, short_address: ShortAddress) -> Option<&Device> {
        let index = self.position_by_short_address(short_address)?;
        Some(&self.devices[index])
    }

    /// Returns the record with the given short address
    pub fn by_short_address_mut(&mut self, short_address: ShortAddress)
        -> Option<&mut Device>
    {
        let index = self.position_by_short_address(short_address)?;
        Some(&mut self.devices[index])
    }

    fn position_by_short_address(&self, short_address: ShortAddress) -> Option<usize> {
        let mut found = None;
        for (i, device) in self.devices.iter().enumerate() {
            if device.short_address() != short_address {
                continue;
            }
            if device.is_active() {
                return Some(i);
            }
            found = found.or(Some(i));
        }
        found
    }

    /// Returns a handle to the record at `index`
    pub fn handle(&self, index: usize) -> Option<DeviceHandle> {
        self.devices
            .get(index)
            .map(|device| DeviceHandle { index, id: device.id })
    }

    /// Returns the record a handle refers to
    pub fn resolve(&self, handle: DeviceHandle) -> Result<&Device, StaleHandle> {
        let index = self.position(handle).ok_or(StaleHandle)?;
        Ok(&self.devices[index])
    }

    /// Returns the record a handle refers to
    pub fn resolve_mut(&mut self, handle: DeviceHandle)
        -> Result<&mut Device, StaleHandle>
    {
        let index = self.position(handle).ok_or(StaleHandle)?;
        Ok(&mut self.devices[index])
    }

    fn position(&self, handle: DeviceHandle) -> Option<usize> {
        match self.devices.get(handle.index) {
            Some(device) if device.id == handle.id => Some(handle.index),
            _ => self.devices.iter().position(|device| device.id == handle.id),
        }
    }

    /// Marks the record with the given short address as active
    ///
    /// Returns `false`, if no such record exists.
    pub fn reactivate(&mut self, short_address: ShortAddress, now_ms: u32) -> bool {
        match self.by_short_address_mut(short_address) {
            Some(device) => {
                device.note_activity(now_ms);
                true
            }
            None => false,
        }
    }

    /// Sweeps the table for records that went quiet
    ///
    /// Every active record that is inactive according to
    /// [`Device::is_inactive`] is passed to `on_inactive` and then marked as
    /// inactive, so the callback fires once per transition. Independently,
    /// records stuck in [`TagState::Ranging`] are put back to
    /// [`TagState::Idle`].
    pub fn check_for_inactive_devices<F>(&mut self, now_ms: u32, mut on_inactive: F)
        where F: FnMut(&Device)
    {
        for device in self.devices.iter_mut() {
            if device.is_active() && device.is_inactive(now_ms) {
                on_inactive(device);
                device.set_inactive();
                info!("device {=u16:#x} inactive", device.short_address().0);
            }

            if device.is_ranging_stuck(now_ms) {
                device.set_tag_state(TagState::Idle, now_ms);
                debug!("forcing device {=u16:#x} to idle", device.short_address().0);
            }
        }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether there are no records
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Maximum number of records
    pub fn capacity(&self) -> usize {
        N
    }

    /// Iterates over all records in index order
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Iterates over all records in index order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut()
    }
}

impl<const N: usize> Default for DeviceTable<N> {
    fn default() -> Self {
        DeviceTable::new()
    }
}
