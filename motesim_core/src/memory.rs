//! Section-based mote memory.
//!
//! Memory is a set of non-overlapping sections, each a contiguous run of
//! bytes starting at some address. Firmware variables are resolved through
//! a symbol map (name -> address). Writing to a range that touches no
//! section creates a new one; writing across section boundaries merges the
//! touched sections.

use crate::error::MemoryError;
use motesim_env::{CpuFault, MemoryBus};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    start: u32,
    data: Vec<u8>,
}

impl Section {
    fn end(&self) -> u64 {
        self.start as u64 + self.data.len() as u64
    }

    fn contains(&self, address: u32, len: usize) -> bool {
        address >= self.start && address as u64 + len as u64 <= self.end()
    }

    /// True if `[address, address+len)` overlaps or is adjacent to this section.
    fn touches(&self, address: u32, len: usize) -> bool {
        (address as u64) <= self.end() && address as u64 + len as u64 >= self.start as u64
    }
}

/// Memory of one emulated mote.
#[derive(Debug, Clone, Default)]
pub struct MoteMemory {
    sections: Vec<Section>,
    variables: BTreeMap<String, u32>,
}

impl MoteMemory {
    /// Creates an empty memory with the given symbol map.
    pub fn new<I, S>(variables: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            sections: Vec::new(),
            variables: variables.into_iter().map(|(name, addr)| (name.into(), addr)).collect(),
        }
    }

    /// Adds a zero-filled section covering `[start, start+size)`.
    pub fn with_ram(mut self, start: u32, size: usize) -> Self {
        self.set_memory_segment(start, &vec![0; size]);
        self
    }

    /// Names of all known variables, sorted.
    pub fn variable_names(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }

    /// Address of a variable.
    pub fn variable_address(&self, name: &str) -> Result<u32, MemoryError> {
        self.variables
            .get(name)
            .copied()
            .ok_or_else(|| MemoryError::UnknownVariable(name.to_string()))
    }

    /// True if the symbol map contains `name`.
    pub fn variable_exists(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Copies `len` bytes starting at `address`. The range must lie within
    /// one section.
    pub fn memory_segment(&self, address: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        let section = self
            .sections
            .iter()
            .find(|s| s.contains(address, len))
            .ok_or(MemoryError::Unmapped { address, len })?;
        let offset = (address - section.start) as usize;
        Ok(section.data[offset..offset + len].to_vec())
    }

    /// Writes `data` at `address`, creating or merging sections as needed.
    pub fn set_memory_segment(&mut self, address: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if let Some(section) = self.sections.iter_mut().find(|s| s.contains(address, data.len())) {
            let offset = (address - section.start) as usize;
            section.data[offset..offset + data.len()].copy_from_slice(data);
            return;
        }

        // Pull out every section the write touches and fold them into one.
        let (touched, mut kept): (Vec<Section>, Vec<Section>) = self
            .sections
            .drain(..)
            .partition(|s| s.touches(address, data.len()));

        let start = touched.iter().map(|s| s.start).fold(address, u32::min);
        let end = touched
            .iter()
            .map(Section::end)
            .fold(address as u64 + data.len() as u64, u64::max);

        let mut merged = Section {
            start,
            data: vec![0; (end - start as u64) as usize],
        };
        for section in &touched {
            let offset = (section.start - start) as usize;
            merged.data[offset..offset + section.data.len()].copy_from_slice(&section.data);
        }
        let offset = (address - start) as usize;
        merged.data[offset..offset + data.len()].copy_from_slice(data);

        kept.push(merged);
        kept.sort_by_key(|s| s.start);
        self.sections = kept;
    }

    /// Reads a variable as a little-endian `i32`.
    pub fn int_value_of(&self, name: &str) -> Result<i32, MemoryError> {
        let bytes = self.byte_array(name, 4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Writes a variable as a little-endian `i32`.
    pub fn set_int_value_of(&mut self, name: &str, value: i32) -> Result<(), MemoryError> {
        self.set_byte_array(name, &value.to_le_bytes())
    }

    /// Reads a single-byte variable.
    pub fn byte_value_of(&self, name: &str) -> Result<u8, MemoryError> {
        Ok(self.byte_array(name, 1)?[0])
    }

    /// Writes a single-byte variable.
    pub fn set_byte_value_of(&mut self, name: &str, value: u8) -> Result<(), MemoryError> {
        self.set_byte_array(name, &[value])
    }

    /// Reads `len` bytes starting at a variable.
    pub fn byte_array(&self, name: &str, len: usize) -> Result<Vec<u8>, MemoryError> {
        let address = self.variable_address(name)?;
        self.memory_segment(address, len)
    }

    /// Writes bytes starting at a variable.
    pub fn set_byte_array(&mut self, name: &str, data: &[u8]) -> Result<(), MemoryError> {
        let address = self.variable_address(name)?;
        self.set_memory_segment(address, data);
        Ok(())
    }

    /// Total bytes across all sections.
    pub fn total_size(&self) -> usize {
        self.sections.iter().map(|s| s.data.len()).sum()
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Drops every section. The symbol map is kept.
    pub fn clear(&mut self) {
        self.sections.clear();
    }
}

impl MemoryBus for MoteMemory {
    fn read_byte(&self, address: u32) -> Result<u8, CpuFault> {
        self.memory_segment(address, 1)
            .map(|bytes| bytes[0])
            .map_err(|_| CpuFault::MemoryAccess { address })
    }

    fn write_byte(&mut self, address: u32, value: u8) -> Result<(), CpuFault> {
        self.set_memory_segment(address, &[value]);
        Ok(())
    }

    fn write_bytes(&mut self, address: u32, data: &[u8]) -> Result<(), CpuFault> {
        self.set_memory_segment(address, data);
        Ok(())
    }
}
