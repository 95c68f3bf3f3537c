//! The MEM-AP memory engine.
//!
//! Word accesses drive CSW/TAR/DRW directly; block accesses use the probe's
//! repeated register transfers with the auto-increment wrap honored, or the
//! probe's own memory commands when the firmware has them. Byte blocks of any
//! alignment are decomposed into at most five segments: a leading byte, a
//! leading halfword, the aligned word bulk, a trailing halfword and a
//! trailing byte.

use super::ap::{ap_addr, AddressIncrement, Csw, DataSize, Drw, Tar};
use super::dp::DapController;
use super::{ArmError, Register};
use crate::memory::MemoryInterface;
use crate::probe::DeferredResult;

/// Memory access through one MEM-AP.
pub struct ApMemory<'c> {
    dap: &'c mut DapController,
    apsel: u8,
    wrap_size: u32,
}

impl<'c> ApMemory<'c> {
    pub(crate) fn new(dap: &'c mut DapController, apsel: u8, wrap_size: u32) -> Self {
        ApMemory {
            dap,
            apsel,
            wrap_size,
        }
    }

    /// The APSEL of the MEM-AP behind this engine.
    pub fn apsel(&self) -> u8 {
        self.apsel
    }

    fn set_csw(&mut self, size: DataSize, increment: AddressIncrement) -> Result<(), ArmError> {
        self.dap
            .write_csw(self.apsel, Csw::memory_access(size, increment))
    }

    fn write_tar(&mut self, address: u32) -> Result<(), ArmError> {
        self.dap
            .write_ap(ap_addr(self.apsel, Tar::ADDRESS), address)
    }

    fn drw(&self) -> u32 {
        ap_addr(self.apsel, Drw::ADDRESS)
    }

    /// Issue a 32 bit read without demanding the value, for callers that
    /// pipeline polls.
    pub fn read_word_32_deferred(&mut self, address: u32) -> Result<DeferredResult, ArmError> {
        if address % 4 != 0 {
            return Err(ArmError::alignment_error(address, 4));
        }
        self.set_csw(DataSize::U32, AddressIncrement::Single)?;
        self.write_tar(address)?;
        self.dap.read_ap_deferred(self.drw())
    }

    /// Demand the value of a deferred read.
    pub fn resolve(&mut self, deferred: DeferredResult) -> Result<u32, ArmError> {
        self.dap.resolve(deferred)
    }

    /// Read the aligned word bulk of a transfer, split at the auto-increment
    /// wrap boundary.
    fn read_block_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), ArmError> {
        self.set_csw(DataSize::U32, AddressIncrement::Single)?;

        let mut address = address;
        let mut offset = 0;
        while offset < data.len() {
            let bytes_to_boundary = self.wrap_size - (address & (self.wrap_size - 1));
            let chunk = ((bytes_to_boundary / 4) as usize).min(data.len() - offset);

            tracing::debug!("Reading chunk of {} words at {:#010x}", chunk, address);
            self.write_tar(address)?;
            self.dap
                .read_ap_repeated(self.drw(), &mut data[offset..offset + chunk])?;

            address += chunk as u32 * 4;
            offset += chunk;
        }

        Ok(())
    }

    fn write_block_32(&mut self, address: u32, data: &[u32]) -> Result<(), ArmError> {
        self.set_csw(DataSize::U32, AddressIncrement::Single)?;

        let mut address = address;
        let mut offset = 0;
        while offset < data.len() {
            let bytes_to_boundary = self.wrap_size - (address & (self.wrap_size - 1));
            let chunk = ((bytes_to_boundary / 4) as usize).min(data.len() - offset);

            tracing::debug!("Writing chunk of {} words at {:#010x}", chunk, address);
            self.write_tar(address)?;
            self.dap
                .write_ap_repeated(self.drw(), &data[offset..offset + chunk])?;

            address += chunk as u32 * 4;
            offset += chunk;
        }

        Ok(())
    }
}

impl MemoryInterface for ApMemory<'_> {
    fn read_word_32(&mut self, address: u32) -> Result<u32, ArmError> {
        if address % 4 != 0 {
            return Err(ArmError::alignment_error(address, 4));
        }

        if self.dap.has_native_memory_access() {
            let mut buf = [0u8; 4];
            self.dap
                .read_memory_native(self.apsel, address, &mut buf, 32)?;
            return Ok(u32::from_le_bytes(buf));
        }

        self.set_csw(DataSize::U32, AddressIncrement::Single)?;
        self.write_tar(address)?;
        self.dap.read_ap(self.drw())
    }

    fn read_word_16(&mut self, address: u32) -> Result<u16, ArmError> {
        if address % 2 != 0 {
            return Err(ArmError::alignment_error(address, 2));
        }

        if self.dap.has_native_memory_access() {
            let mut buf = [0u8; 2];
            self.dap
                .read_memory_native(self.apsel, address, &mut buf, 16)?;
            return Ok(u16::from_le_bytes(buf));
        }

        self.set_csw(DataSize::U16, AddressIncrement::Single)?;
        self.write_tar(address)?;
        let value = self.dap.read_ap(self.drw())?;

        // The data rides on its byte lane of the word.
        let shift = (address & 0x3) * 8;
        Ok((value >> shift) as u16)
    }

    fn read_word_8(&mut self, address: u32) -> Result<u8, ArmError> {
        if self.dap.has_native_memory_access() {
            let mut buf = [0u8; 1];
            self.dap
                .read_memory_native(self.apsel, address, &mut buf, 8)?;
            return Ok(buf[0]);
        }

        self.set_csw(DataSize::U8, AddressIncrement::Single)?;
        self.write_tar(address)?;
        let value = self.dap.read_ap(self.drw())?;

        let shift = (address & 0x3) * 8;
        Ok((value >> shift) as u8)
    }

    fn read_32(&mut self, address: u32, data: &mut [u32]) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }
        if address % 4 != 0 {
            return Err(ArmError::alignment_error(address, 4));
        }

        if self.dap.has_native_memory_access() {
            let mut buf = vec![0u8; data.len() * 4];
            self.dap
                .read_memory_native(self.apsel, address, &mut buf, 32)?;
            for (word, bytes) in data.iter_mut().zip(buf.chunks_exact(4)) {
                *word = u32::from_le_bytes(bytes.try_into().unwrap());
            }
            return Ok(());
        }

        self.read_block_32(address, data)
    }

    fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }

        let mut address = address;
        let mut offset = 0;
        let mut remaining = data.len();

        // Leading byte up to a halfword boundary.
        if address & 1 != 0 {
            data[offset] = self.read_word_8(address)?;
            address += 1;
            offset += 1;
            remaining -= 1;
        }

        // Leading halfword up to a word boundary.
        if address & 2 != 0 && remaining >= 2 {
            let halfword = self.read_word_16(address)?;
            data[offset..offset + 2].copy_from_slice(&halfword.to_le_bytes());
            address += 2;
            offset += 2;
            remaining -= 2;
        }

        // The aligned word bulk.
        let word_count = remaining / 4;
        if word_count > 0 {
            let mut words = vec![0u32; word_count];
            self.read_32(address, &mut words)?;
            for word in words {
                data[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
                offset += 4;
            }
            address += word_count as u32 * 4;
            remaining -= word_count * 4;
        }

        // Trailing halfword.
        if remaining >= 2 {
            let halfword = self.read_word_16(address)?;
            data[offset..offset + 2].copy_from_slice(&halfword.to_le_bytes());
            address += 2;
            offset += 2;
            remaining -= 2;
        }

        // Trailing byte.
        if remaining >= 1 {
            data[offset] = self.read_word_8(address)?;
        }

        Ok(())
    }

    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), ArmError> {
        if address % 4 != 0 {
            return Err(ArmError::alignment_error(address, 4));
        }

        if self.dap.has_native_memory_access() {
            return self
                .dap
                .write_memory_native(self.apsel, address, &data.to_le_bytes(), 32);
        }

        self.set_csw(DataSize::U32, AddressIncrement::Single)?;
        self.write_tar(address)?;
        self.dap.write_ap(self.drw(), data)
    }

    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), ArmError> {
        if address % 2 != 0 {
            return Err(ArmError::alignment_error(address, 2));
        }

        if self.dap.has_native_memory_access() {
            return self
                .dap
                .write_memory_native(self.apsel, address, &data.to_le_bytes(), 16);
        }

        self.set_csw(DataSize::U16, AddressIncrement::Single)?;
        self.write_tar(address)?;

        let shift = (address & 0x3) * 8;
        self.dap.write_ap(self.drw(), u32::from(data) << shift)
    }

    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), ArmError> {
        if self.dap.has_native_memory_access() {
            return self
                .dap
                .write_memory_native(self.apsel, address, &[data], 8);
        }

        self.set_csw(DataSize::U8, AddressIncrement::Single)?;
        self.write_tar(address)?;

        let shift = (address & 0x3) * 8;
        self.dap.write_ap(self.drw(), u32::from(data) << shift)
    }

    fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }
        if address % 4 != 0 {
            return Err(ArmError::alignment_error(address, 4));
        }

        if self.dap.has_native_memory_access() {
            let mut buf = Vec::with_capacity(data.len() * 4);
            for word in data {
                buf.extend_from_slice(&word.to_le_bytes());
            }
            return self.dap.write_memory_native(self.apsel, address, &buf, 32);
        }

        self.write_block_32(address, data)
    }

    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }

        let mut address = address;
        let mut offset = 0;
        let mut remaining = data.len();

        if address & 1 != 0 {
            self.write_word_8(address, data[offset])?;
            address += 1;
            offset += 1;
            remaining -= 1;
        }

        if address & 2 != 0 && remaining >= 2 {
            let halfword = u16::from_le_bytes([data[offset], data[offset + 1]]);
            self.write_word_16(address, halfword)?;
            address += 2;
            offset += 2;
            remaining -= 2;
        }

        let word_count = remaining / 4;
        if word_count > 0 {
            let mut words = Vec::with_capacity(word_count);
            for chunk in data[offset..offset + word_count * 4].chunks_exact(4) {
                words.push(u32::from_le_bytes(chunk.try_into().unwrap()));
            }
            self.write_32(address, &words)?;
            address += word_count as u32 * 4;
            offset += word_count * 4;
            remaining -= word_count * 4;
        }

        if remaining >= 2 {
            let halfword = u16::from_le_bytes([data[offset], data[offset + 1]]);
            self.write_word_16(address, halfword)?;
            address += 2;
            offset += 2;
            remaining -= 2;
        }

        if remaining >= 1 {
            self.write_word_8(address, data[offset])?;
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), ArmError> {
        self.dap.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coresight::dp::DapController;
    use crate::probe::fake_probe::{FakeOperation, FakeProbe, FakeStateHandle};
    use pretty_assertions::assert_eq;

    fn memory_setup() -> (DapController, FakeStateHandle) {
        let probe = FakeProbe::new();
        let handle = probe.state_handle();
        let mut dap = DapController::new(Box::new(probe));
        dap.init().unwrap();
        dap.find_aps().unwrap();
        (dap, handle)
    }

    // Visually obvious pattern used to test memory transfers.
    const DATA8: &[u8] = &[
        128, 129, 130, 131, 132, 133, 134, 135, 136, 137, 138, 139, 140, 141, 142, 143,
    ];

    #[test]
    fn word_round_trip() {
        let (mut dap, _) = memory_setup();
        let mut memory = dap.memory_interface(0).unwrap();

        memory.write_word_32(0x2000_0000, 0xdead_beef).unwrap();
        assert_eq!(memory.read_word_32(0x2000_0000).unwrap(), 0xdead_beef);

        memory.write_word_16(0x2000_0006, 0xabcd).unwrap();
        assert_eq!(memory.read_word_16(0x2000_0006).unwrap(), 0xabcd);

        memory.write_word_8(0x2000_0009, 0x5a).unwrap();
        assert_eq!(memory.read_word_8(0x2000_0009).unwrap(), 0x5a);
    }

    #[test]
    fn unaligned_word_access_is_rejected() {
        let (mut dap, _) = memory_setup();
        let mut memory = dap.memory_interface(0).unwrap();

        assert!(memory.read_word_32(0x2000_0002).is_err());
        assert!(memory.read_word_16(0x2000_0001).is_err());
        assert!(memory.write_word_32(0x2000_0001, 0).is_err());
        assert!(memory.read_32(0x2000_0001, &mut [0u32; 2]).is_err());
    }

    #[test]
    fn unaligned_byte_block_read_decomposes_into_segments() {
        let (mut dap, handle) = memory_setup();
        handle.load_memory(0x2000_0000, DATA8);
        handle.clear_operations();

        let mut memory = dap.memory_interface(0).unwrap();
        let mut data = [0u8; 7];
        memory.read_8(0x2000_0001, &mut data).unwrap();

        assert_eq!(&data, &DATA8[1..8]);

        // One byte read, one halfword read, one aligned word block, one
        // trailing byte read.
        let ops = handle.operations();
        let single_drw_reads = ops
            .iter()
            .filter(|op| matches!(op, FakeOperation::ReadAp(0, 0x0C)))
            .count();
        let block_reads: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                FakeOperation::BlockRead(0, 0x0C, n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(single_drw_reads, 3);
        assert_eq!(block_reads, vec![1]);
    }

    #[test]
    fn unaligned_byte_block_round_trip() {
        let (mut dap, _) = memory_setup();
        let mut memory = dap.memory_interface(0).unwrap();

        memory.write_8(0x2000_0003, &DATA8[..11]).unwrap();

        let mut read_back = [0u8; 11];
        memory.read_8(0x2000_0003, &mut read_back).unwrap();
        assert_eq!(&read_back, &DATA8[..11]);
    }

    #[test]
    fn block_write_splits_at_wrap_boundary() {
        let (mut dap, handle) = memory_setup();
        handle.clear_operations();

        // The fake AP advertises a 4 KiB wrap. A 2048 byte write starting
        // four bytes before the boundary must split into 1 + 511 words.
        let data = vec![0xa5a5_a5a5u32; 512];
        let mut memory = dap.memory_interface(0).unwrap();
        memory.write_32(0x2000_0FFC, &data).unwrap();

        let block_writes: Vec<_> = handle
            .operations()
            .iter()
            .filter_map(|op| match op {
                FakeOperation::BlockWrite(0, 0x0C, n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(block_writes, vec![1, 511]);
    }

    #[test]
    fn block_read_crossing_many_pages() {
        let (mut dap, handle) = memory_setup();
        let pattern: Vec<u8> = (0..0x3000u32).map(|i| i as u8).collect();
        handle.load_memory(0x2000_0000, &pattern);

        let mut memory = dap.memory_interface(0).unwrap();
        let mut words = vec![0u32; 0x3000 / 4];
        memory.read_32(0x2000_0000, &mut words).unwrap();

        assert_eq!(words[0], u32::from_le_bytes([0, 1, 2, 3]));
        assert_eq!(
            words[0x1000 / 4],
            u32::from_le_bytes([0x00, 0x01, 0x02, 0x03])
        );
    }

    #[test]
    fn csw_is_cached_between_word_accesses() {
        let (mut dap, handle) = memory_setup();
        let mut memory = dap.memory_interface(0).unwrap();

        memory.write_word_32(0x2000_0000, 1).unwrap();
        handle.clear_operations();
        memory.write_word_32(0x2000_0004, 2).unwrap();

        let csw_writes = handle
            .operations()
            .iter()
            .filter(|op| matches!(op, FakeOperation::WriteAp(0, 0x00, _)))
            .count();
        assert_eq!(csw_writes, 0, "CSW write must be elided");
    }
}
