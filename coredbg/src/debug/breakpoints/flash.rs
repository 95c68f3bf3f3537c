//! The flash breakpoint provider: BKPT instructions written into flash.
//!
//! The provider keeps a byte cache per touched flash page and coalesces all
//! patches so one flush rewrites each dirty page exactly once. The actual
//! erase and program steps are delegated to a [`FlashPager`] supplied by the
//! flash-algorithm layer; around those calls the core register file is saved
//! and restored, because flash algorithms execute on the target.

use super::{Breakpoint, BreakpointKind, BreakpointProvider};
use super::software::BKPT_INSTRUCTION;
use crate::coresight::ArmError;
use crate::memory::MemoryInterface;

use std::collections::HashMap;
use std::time::{Duration, Instant};

const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;
const DCRSR_REGWNR: u32 = 1 << 16;
const DHCSR_S_REGRDY: u32 = 1 << 16;

/// The DCRSR selectors preserved around flash algorithm execution:
/// R0-R12, SP, LR, PC, xPSR, MSP, PSP and CFBP.
const SAVED_REGISTERS: &[u32] = &[
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 20,
];

/// Erases and programs flash pages on behalf of the provider.
///
/// Implemented by the flash-algorithm driver sitting above this crate.
pub trait FlashPager: Send {
    /// The page size of the sector containing `address`.
    fn page_size(&self, address: u32) -> u32;

    /// Erase the page at `page_base` and program `data` into it. `data` is
    /// exactly one page long.
    fn rewrite_page(
        &mut self,
        memory: &mut dyn MemoryInterface,
        page_base: u32,
        data: &[u8],
    ) -> Result<(), ArmError>;
}

#[derive(Debug)]
struct PageCache {
    data: Vec<u8>,
    dirty: bool,
}

/// Realizes breakpoints by rewriting flash pages with patched contents.
pub struct FlashBreakpointProvider {
    pager: Box<dyn FlashPager>,
    /// Original instruction per patched address.
    patched: HashMap<u32, u16>,
    /// Cached page contents keyed by page base.
    pages: HashMap<u32, PageCache>,
}

impl std::fmt::Debug for FlashBreakpointProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashBreakpointProvider")
            .field("patched", &self.patched)
            .field("cached_pages", &self.pages.len())
            .finish()
    }
}

impl FlashBreakpointProvider {
    /// A provider delegating page rewrites to `pager`.
    pub fn new(pager: Box<dyn FlashPager>) -> Self {
        FlashBreakpointProvider {
            pager,
            patched: HashMap::new(),
            pages: HashMap::new(),
        }
    }

    fn page_base(&self, addr: u32) -> u32 {
        addr & !(self.pager.page_size(addr) - 1)
    }

    fn ensure_page_cached(
        &mut self,
        memory: &mut dyn MemoryInterface,
        page_base: u32,
    ) -> Result<(), ArmError> {
        if self.pages.contains_key(&page_base) {
            return Ok(());
        }

        let size = self.pager.page_size(page_base) as usize;
        let mut data = vec![0u8; size];
        memory.read_8(page_base, &mut data)?;
        self.pages.insert(
            page_base,
            PageCache {
                data,
                dirty: false,
            },
        );
        Ok(())
    }

    fn patch_halfword(&mut self, page_base: u32, addr: u32, value: u16) {
        let page = self
            .pages
            .get_mut(&page_base)
            .expect("page was cached before patching");
        let offset = (addr - page_base) as usize;
        page.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        page.dirty = true;
    }

    /// Save the core register file before the flash algorithm runs.
    fn save_registers(&self, memory: &mut dyn MemoryInterface) -> Result<Vec<u32>, ArmError> {
        SAVED_REGISTERS
            .iter()
            .map(|selector| {
                memory.write_word_32(DCRSR, *selector)?;
                wait_for_regrdy(memory)?;
                memory.read_word_32(DCRDR)
            })
            .collect()
    }

    /// Restore the register file after the flash algorithm ran.
    fn restore_registers(
        &self,
        memory: &mut dyn MemoryInterface,
        values: &[u32],
    ) -> Result<(), ArmError> {
        for (selector, value) in SAVED_REGISTERS.iter().zip(values) {
            memory.write_word_32(DCRDR, *value)?;
            memory.write_word_32(DCRSR, *selector | DCRSR_REGWNR)?;
            wait_for_regrdy(memory)?;
        }
        Ok(())
    }
}

fn wait_for_regrdy(memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(100) {
        if memory.read_word_32(DHCSR)? & DHCSR_S_REGRDY != 0 {
            return Ok(());
        }
    }
    Err(ArmError::RegisterTransferTimeout)
}

impl BreakpointProvider for FlashBreakpointProvider {
    fn kind(&self) -> BreakpointKind {
        BreakpointKind::Flash
    }

    fn set_breakpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        addr: u32,
    ) -> Result<Option<Breakpoint>, ArmError> {
        let page_base = self.page_base(addr);
        self.ensure_page_cached(memory, page_base)?;

        let page = &self.pages[&page_base];
        let offset = (addr - page_base) as usize;
        let original_instr =
            u16::from_le_bytes([page.data[offset], page.data[offset + 1]]);

        self.patch_halfword(page_base, addr, BKPT_INSTRUCTION);
        self.patched.insert(addr, original_instr);

        Ok(Some(Breakpoint::Flash {
            addr,
            original_instr,
            page_base,
        }))
    }

    fn remove_breakpoint(
        &mut self,
        _memory: &mut dyn MemoryInterface,
        breakpoint: &Breakpoint,
    ) -> Result<(), ArmError> {
        let addr = breakpoint.addr();
        if let Some(original) = self.patched.remove(&addr) {
            let page_base = self.page_base(addr);
            if self.pages.contains_key(&page_base) {
                self.patch_halfword(page_base, addr, original);
            }
        }
        Ok(())
    }

    fn available_breakpoints(&self) -> Option<usize> {
        None
    }

    fn do_filter_memory(&self) -> bool {
        true
    }

    fn filter_memory(&self, addr: u32, data: &mut [u8]) {
        let end = addr.wrapping_add(data.len() as u32);
        for (bp_addr, original) in &self.patched {
            let bytes = original.to_le_bytes();
            for (i, byte) in bytes.iter().enumerate() {
                let byte_addr = bp_addr.wrapping_add(i as u32);
                if byte_addr >= addr && byte_addr < end {
                    data[(byte_addr - addr) as usize] = *byte;
                }
            }
        }
    }

    /// Rewrite every dirty page once, with the register file preserved
    /// around the algorithm runs.
    fn flush(&mut self, memory: &mut dyn MemoryInterface) -> Result<(), ArmError> {
        let dirty: Vec<u32> = self
            .pages
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(base, _)| *base)
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let saved = self.save_registers(memory)?;

        let mut result = Ok(());
        for page_base in dirty {
            let data = self.pages[&page_base].data.clone();
            tracing::debug!("Rewriting flash page at {:#010x}", page_base);
            if let Err(e) = self.pager.rewrite_page(memory, page_base, &data) {
                result = Err(e);
                break;
            }
            self.pages.get_mut(&page_base).unwrap().dirty = false;
        }

        self.restore_registers(memory, &saved)?;

        // Pages with no remaining patches do not need their cache anymore.
        let patched = std::mem::take(&mut self.patched);
        self.pages.retain(|base, _| {
            patched
                .keys()
                .any(|addr| addr & !(self.pager.page_size(*addr) - 1) == *base)
        });
        self.patched = patched;

        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coresight::dp::DapController;
    use crate::probe::fake_probe::{FakeProbe, FakeStateHandle};

    /// A pager that programs pages with plain memory writes, standing in for
    /// a real flash algorithm.
    #[derive(Debug)]
    struct RamPager {
        rewrites: usize,
    }

    impl FlashPager for RamPager {
        fn page_size(&self, _address: u32) -> u32 {
            0x100
        }

        fn rewrite_page(
            &mut self,
            memory: &mut dyn MemoryInterface,
            page_base: u32,
            data: &[u8],
        ) -> Result<(), ArmError> {
            self.rewrites += 1;
            memory.write_8(page_base, data)
        }
    }

    fn setup() -> (DapController, FakeStateHandle) {
        let probe = FakeProbe::new();
        let handle = probe.state_handle();
        let mut dap = DapController::new(Box::new(probe));
        dap.init().unwrap();
        dap.find_aps().unwrap();
        (dap, handle)
    }

    #[test]
    fn patches_coalesce_into_one_page_rewrite() {
        let (mut dap, handle) = setup();
        let code: Vec<u8> = (0..0x100).map(|i| i as u8).collect();
        handle.load_memory(0x0000_0000, &code);

        let mut provider = FlashBreakpointProvider::new(Box::new(RamPager { rewrites: 0 }));
        let mut memory = dap.memory_interface(0).unwrap();

        // Two breakpoints in the same page.
        let bp1 = provider.set_breakpoint(&mut memory, 0x10).unwrap().unwrap();
        provider.set_breakpoint(&mut memory, 0x20).unwrap().unwrap();

        let Breakpoint::Flash {
            original_instr,
            page_base,
            ..
        } = bp1
        else {
            panic!("expected a flash breakpoint");
        };
        assert_eq!(original_instr, u16::from_le_bytes([0x10, 0x11]));
        assert_eq!(page_base, 0);

        // Nothing on the target yet.
        assert_eq!(handle.memory_contents(0x10, 2), vec![0x10, 0x11]);

        provider.flush(&mut memory).unwrap();

        // One rewrite, both patches present.
        assert_eq!(handle.memory_contents(0x10, 2), vec![0x00, 0xBE]);
        assert_eq!(handle.memory_contents(0x20, 2), vec![0x00, 0xBE]);
        // Unpatched bytes survived the rewrite.
        assert_eq!(handle.memory_contents(0x30, 2), vec![0x30, 0x31]);
    }

    #[test]
    fn remove_restores_original_on_next_flush() {
        let (mut dap, handle) = setup();
        let code: Vec<u8> = (0..0x100).map(|i| i as u8).collect();
        handle.load_memory(0x0000_0000, &code);

        let mut provider = FlashBreakpointProvider::new(Box::new(RamPager { rewrites: 0 }));
        let mut memory = dap.memory_interface(0).unwrap();

        let bp = provider.set_breakpoint(&mut memory, 0x40).unwrap().unwrap();
        provider.flush(&mut memory).unwrap();
        assert_eq!(handle.memory_contents(0x40, 2), vec![0x00, 0xBE]);

        provider.remove_breakpoint(&mut memory, &bp).unwrap();
        provider.flush(&mut memory).unwrap();
        assert_eq!(handle.memory_contents(0x40, 2), vec![0x40, 0x41]);
    }

    #[test]
    fn registers_survive_page_rewrites() {
        let (mut dap, handle) = setup();
        handle.halt_core(1);
        handle.set_core_register(0, 0xdead_beef);
        handle.set_core_register(15, 0x0000_1234);

        let mut provider = FlashBreakpointProvider::new(Box::new(RamPager { rewrites: 0 }));
        let mut memory = dap.memory_interface(0).unwrap();

        provider.set_breakpoint(&mut memory, 0x50).unwrap().unwrap();
        provider.flush(&mut memory).unwrap();

        assert_eq!(handle.core_register(0), 0xdead_beef);
        assert_eq!(handle.core_register(15), 0x0000_1234);
    }
}
