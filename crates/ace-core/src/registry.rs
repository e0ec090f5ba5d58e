//! Multi-device tool routing
//!
//! Several hubs can feed one printer. Devices are registered in order and each
//! owns a run of `slots_per_device` consecutive global tool numbers: with four
//! slots per hub, tools 0-3 live on the first hub, 4-7 on the second, and so on.

use std::ops::Range;

use crate::error::AceError;

/// Devices in registration order, each owning a contiguous tool range
#[derive(Debug)]
pub struct DeviceRegistry<D> {
    devices: Vec<D>,
    slots_per_device: u8,
}

impl<D> DeviceRegistry<D> {
    /// Empty registry; `slots_per_device` is clamped to at least 1
    pub fn new(slots_per_device: u8) -> Self {
        Self {
            devices: Vec::new(),
            slots_per_device: slots_per_device.max(1),
        }
    }

    /// Add a device; returns its position
    pub fn register(&mut self, device: D) -> usize {
        self.devices.push(device);
        self.devices.len() - 1
    }

    /// Registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// No devices registered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Tools per device
    pub fn slots_per_device(&self) -> u8 {
        self.slots_per_device
    }

    /// Total number of routable tools
    pub fn tool_count(&self) -> u32 {
        self.devices.len() as u32 * u32::from(self.slots_per_device)
    }

    /// Global tool numbers owned by device `position`
    pub fn tool_range(&self, position: usize) -> Option<Range<u32>> {
        if position >= self.devices.len() {
            return None;
        }
        let per = u32::from(self.slots_per_device);
        let start = position as u32 * per;
        Some(start..start + per)
    }

    /// Split a global tool number into (device position, local slot)
    pub fn locate(&self, tool: u32) -> Result<(usize, u8), AceError> {
        let per = u32::from(self.slots_per_device);
        let position = (tool / per) as usize;
        if position >= self.devices.len() {
            return Err(AceError::UnknownTool(tool));
        }
        Ok((position, (tool % per) as u8))
    }

    /// Device owning `tool` and the tool's slot on it
    pub fn route(&mut self, tool: u32) -> Result<(&mut D, u8), AceError> {
        let (position, slot) = self.locate(tool)?;
        let device = self
            .devices
            .get_mut(position)
            .ok_or(AceError::UnknownTool(tool))?;
        Ok((device, slot))
    }

    /// Global tool number of `slot` on device `position`
    pub fn global_tool(&self, position: usize, slot: u8) -> Option<u32> {
        if slot >= self.slots_per_device {
            return None;
        }
        self.tool_range(position)
            .map(|range| range.start + u32::from(slot))
    }

    /// Device at `position`
    pub fn get(&self, position: usize) -> Option<&D> {
        self.devices.get(position)
    }

    /// Device at `position`, mutably
    pub fn get_mut(&mut self, position: usize) -> Option<&mut D> {
        self.devices.get_mut(position)
    }

    /// Devices in registration order
    pub fn iter(&self) -> impl Iterator<Item = &D> {
        self.devices.iter()
    }

    /// Devices in registration order, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut D> {
        self.devices.iter_mut()
    }
}
