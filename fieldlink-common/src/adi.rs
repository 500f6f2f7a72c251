//! Application Data Items and their default process data mapping
//!
//! The ADI table is a static list describing every value exposed to the fieldbus master. Each
//! entry points at its backing storage, an [`AdiValue`], which the application updates and the
//! fieldbus driver reads when building the write process data image.

use core::sync::atomic::Ordering;

use portable_atomic::AtomicU32;

/// Data type of an ADI, using the type codes of the module's application data object
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[repr(u8)]
pub enum AdiType {
    /// Boolean
    Bool = 0,
    /// Signed 8-bit integer
    SInt8 = 1,
    /// Signed 16-bit integer
    SInt16 = 2,
    /// Signed 32-bit integer
    SInt32 = 3,
    /// Unsigned 8-bit integer
    UInt8 = 4,
    /// Unsigned 16-bit integer
    UInt16 = 5,
    /// Unsigned 32-bit integer
    UInt32 = 6,
    /// 32-bit float
    Float = 18,
}

impl AdiType {
    /// Size of one element in bytes
    pub const fn size(&self) -> usize {
        match self {
            AdiType::Bool | AdiType::SInt8 | AdiType::UInt8 => 1,
            AdiType::SInt16 | AdiType::UInt16 => 2,
            AdiType::SInt32 | AdiType::UInt32 | AdiType::Float => 4,
        }
    }
}

/// Access descriptor bits of an ADI
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Access(u8);

impl Access {
    /// The value may be read over the network
    pub const GET: Access = Access(0x01);
    /// The value may be written over the network
    pub const SET: Access = Access(0x02);
    /// The value may be mapped into write (input) process data
    pub const MAPPABLE_WRITE_PD: Access = Access(0x08);
    /// The value may be mapped into read (output) process data
    pub const MAPPABLE_READ_PD: Access = Access(0x10);
    /// Readable, and mappable to write process data. The usual access for a sampled input.
    pub const INPUT: Access = Access::GET.union(Access::MAPPABLE_WRITE_PD);

    /// Combine two access descriptors
    pub const fn union(self, other: Access) -> Access {
        Access(self.0 | other.0)
    }

    /// Returns true if all bits of `other` are set
    pub const fn contains(&self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }

    /// Get the raw descriptor byte
    pub const fn bits(&self) -> u8 {
        self.0
    }
}

/// Backing storage for a single ADI element
///
/// Values are stored as raw bits, and truncated to the ADI's type when written to the process data
/// image.
#[derive(Debug, Default)]
pub struct AdiValue {
    raw: AtomicU32,
}

impl AdiValue {
    /// Create a new value
    pub const fn new(value: u32) -> Self {
        Self {
            raw: AtomicU32::new(value),
        }
    }

    /// Read the raw value
    pub fn get(&self) -> u32 {
        self.raw.load(Ordering::Relaxed)
    }

    /// Set the raw value
    pub fn set(&self, value: u32) {
        self.raw.store(value, Ordering::Relaxed);
    }
}

/// One entry of the ADI table
#[derive(Debug, Clone, Copy)]
pub struct AdiEntry<'a> {
    /// ADI instance number. Instance 0 is reserved.
    pub index: u16,
    /// Name shown to the network master
    pub name: &'static str,
    /// Element data type
    pub data_type: AdiType,
    /// Number of elements
    pub num_elements: u8,
    /// Access descriptor
    pub access: Access,
    /// Backing storage, one per element
    pub values: &'a [AdiValue],
}

impl<'a> AdiEntry<'a> {
    /// Size of the whole ADI in bytes
    pub const fn size(&self) -> usize {
        self.data_type.size() * self.num_elements as usize
    }
}

/// Direction of a process data mapping
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
pub enum Direction {
    /// Application to network (inputs)
    Write,
    /// Network to application (outputs)
    Read,
}

/// One entry of the default process data map
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DefaultMap {
    /// ADI instance number
    pub index: u16,
    /// Mapping direction
    pub direction: Direction,
}

/// Find an ADI by instance number
pub fn find_adi<'a, 'b>(table: &'b [AdiEntry<'a>], index: u16) -> Option<&'b AdiEntry<'a>> {
    table.iter().find(|entry| entry.index == index)
}

/// Compute the size of the write process data image described by `map`
pub fn write_pd_size(table: &[AdiEntry], map: &[DefaultMap]) -> usize {
    map.iter()
        .filter(|m| m.direction == Direction::Write)
        .filter_map(|m| find_adi(table, m.index))
        .map(|adi| adi.size())
        .sum()
}

/// Copy every write-mapped ADI into the process data image, little endian
///
/// Returns the number of bytes written, or None if `buf` is too small to hold the image or an ADI
/// in the map is not mappable to write process data.
pub fn update_write_pd(table: &[AdiEntry], map: &[DefaultMap], buf: &mut [u8]) -> Option<usize> {
    let mut pos = 0;
    for m in map.iter().filter(|m| m.direction == Direction::Write) {
        let adi = find_adi(table, m.index)?;
        if !adi.access.contains(Access::MAPPABLE_WRITE_PD) {
            return None;
        }
        let size = adi.data_type.size();
        for value in adi.values.iter().take(adi.num_elements as usize) {
            let bytes = value.get().to_le_bytes();
            buf.get_mut(pos..pos + size)?
                .copy_from_slice(&bytes[..size]);
            pos += size;
        }
    }
    Some(pos)
}
