//! The memory access trait shared by the MEM-AP engine and the core handles.

use crate::coresight::ArmError;

/// Read and write access to target memory.
///
/// Block operations take byte addresses; word operations require their
/// natural alignment unless noted otherwise.
pub trait MemoryInterface {
    /// Read a 32 bit word from `address`, which must be 4-byte aligned.
    fn read_word_32(&mut self, address: u32) -> Result<u32, ArmError>;

    /// Read a 16 bit word from `address`, which must be 2-byte aligned.
    fn read_word_16(&mut self, address: u32) -> Result<u16, ArmError>;

    /// Read an 8 bit word from `address`.
    fn read_word_8(&mut self, address: u32) -> Result<u8, ArmError>;

    /// Read a block of 32 bit words starting at `address`.
    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), ArmError>;

    /// Read a block of bytes starting at `address`; no alignment required.
    fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), ArmError>;

    /// Write a 32 bit word to `address`, which must be 4-byte aligned.
    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), ArmError>;

    /// Write a 16 bit word to `address`, which must be 2-byte aligned.
    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), ArmError>;

    /// Write an 8 bit word to `address`.
    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), ArmError>;

    /// Write a block of 32 bit words starting at `address`.
    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), ArmError>;

    /// Write a block of bytes starting at `address`; no alignment required.
    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), ArmError>;

    /// Force all buffered transfers out and surface their errors.
    fn flush(&mut self) -> Result<(), ArmError>;

    /// Read a value of `bits` width (8, 16 or 32), zero extended.
    fn read_memory(&mut self, address: u32, bits: usize) -> Result<u32, ArmError> {
        match bits {
            8 => self.read_word_8(address).map(u32::from),
            16 => self.read_word_16(address).map(u32::from),
            32 => self.read_word_32(address),
            other => Err(ArmError::UnsupportedTransferWidth(other)),
        }
    }

    /// Write a value of `bits` width (8, 16 or 32).
    fn write_memory(&mut self, address: u32, value: u32, bits: usize) -> Result<(), ArmError> {
        match bits {
            8 => self.write_word_8(address, value as u8),
            16 => self.write_word_16(address, value as u16),
            32 => self.write_word_32(address, value),
            other => Err(ArmError::UnsupportedTransferWidth(other)),
        }
    }
}

impl<T: MemoryInterface + ?Sized> MemoryInterface for &mut T {
    fn read_word_32(&mut self, address: u32) -> Result<u32, ArmError> {
        (**self).read_word_32(address)
    }

    fn read_word_16(&mut self, address: u32) -> Result<u16, ArmError> {
        (**self).read_word_16(address)
    }

    fn read_word_8(&mut self, address: u32) -> Result<u8, ArmError> {
        (**self).read_word_8(address)
    }

    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), ArmError> {
        (**self).read_32(address, data)
    }

    fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), ArmError> {
        (**self).read_8(address, data)
    }

    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), ArmError> {
        (**self).write_word_32(address, data)
    }

    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), ArmError> {
        (**self).write_word_16(address, data)
    }

    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), ArmError> {
        (**self).write_word_8(address, data)
    }

    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), ArmError> {
        (**self).write_32(address, data)
    }

    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), ArmError> {
        (**self).write_8(address, data)
    }

    fn flush(&mut self) -> Result<(), ArmError> {
        (**self).flush()
    }
}
