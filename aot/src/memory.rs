// memory.rs - Linear memory
//
// A growable, page-granular byte buffer with bounds-checked typed
// accessors. Growth never mutates in place: a new zero-filled buffer is
// allocated, the old contents copied into its prefix, and the live buffer
// swapped under the write lock, so readers against the old buffer stay
// valid until the swap.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Trap;
use crate::types::Limits;

pub const PAGE_SIZE: u64 = 65536;
pub const DEFAULT_PADDING: u64 = 1024;

/// When storage for an out-of-bounds access is actually allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    /// Grow lazily on fault, quantized by the padding increment.
    OnDemand,
    /// Allocate the declared minimum up front; faults grow exactly.
    Immediate,
}

pub struct Memory {
    limits: Option<Limits>,
    mode: AllocationMode,
    padding: u64,
    buf: RwLock<Vec<u8>>,
}

impl Memory {
    /// An unbounded on-demand memory.
    pub fn new() -> Self {
        Memory {
            limits: None,
            mode: AllocationMode::OnDemand,
            padding: DEFAULT_PADDING,
            buf: RwLock::new(Vec::new()),
        }
    }

    pub fn with_limits(limits: Limits, mode: AllocationMode, padding: u64) -> Self {
        let buf = match mode {
            AllocationMode::Immediate => vec![0; (limits.min as u64 * PAGE_SIZE) as usize],
            AllocationMode::OnDemand => Vec::new(),
        };
        Memory {
            limits: Some(limits),
            mode,
            padding: padding.max(1),
            buf: RwLock::new(buf),
        }
    }

    pub fn limits(&self) -> Option<Limits> {
        self.limits
    }

    fn read_buf(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.buf.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_buf(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.buf.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Current size in pages.
    pub fn size(&self) -> u32 {
        (self.read_buf().len() as u64 / PAGE_SIZE) as u32
    }

    /// Extend by `delta_pages`. Returns the previous page count, or -1 if
    /// the configured maximum forbids the growth. Never traps.
    pub fn grow(&self, delta_pages: u32) -> i32 {
        let mut buf = self.write_buf();
        let current = buf.len() as u64 / PAGE_SIZE;
        let target = (current + delta_pages as u64) * PAGE_SIZE;
        Self::grow_locked(&mut buf, self.limits, target)
    }

    /// Extend to at least `byte_size` bytes, rounded up to whole pages.
    /// Returns the previous page count or -1 on a limit violation.
    pub fn grow_bytes(&self, byte_size: u64) -> i32 {
        let mut buf = self.write_buf();
        Self::grow_locked(&mut buf, self.limits, byte_size)
    }

    fn grow_locked(buf: &mut Vec<u8>, limits: Option<Limits>, byte_size: u64) -> i32 {
        let mut target = byte_size;
        if let Some(limits) = limits {
            if let Some(max) = limits.max {
                if target > max as u64 * PAGE_SIZE {
                    return -1;
                }
            }
            target = target.max(limits.min as u64 * PAGE_SIZE);
        }
        let pages = target.div_ceil(PAGE_SIZE);
        let target = pages * PAGE_SIZE;

        let old_pages = (buf.len() as u64 / PAGE_SIZE) as i32;
        if target as usize <= buf.len() {
            // growth only ever extends
            return old_pages;
        }

        let mut replacement = vec![0u8; target as usize];
        replacement[..buf.len()].copy_from_slice(buf);
        *buf = replacement;
        old_pages
    }

    /// Grow to cover an access ending at `end`, or fault if the limits
    /// forbid it.
    fn fault_or_grow(&self, end: u64) -> Result<(), Trap> {
        if let Some(limits) = self.limits {
            if let Some(max) = limits.max {
                let max_bytes = max as u64 * PAGE_SIZE;
                if end > max_bytes {
                    return Err(Trap::Segmentation {
                        addr: end,
                        max: max_bytes,
                    });
                }
            }
        }
        let target = match self.mode {
            AllocationMode::OnDemand => ((end - 1) / self.padding + 1) * self.padding,
            AllocationMode::Immediate => end,
        };
        if self.grow_bytes(target) == -1 {
            let max_bytes = self
                .limits
                .and_then(|l| l.max)
                .map(|m| m as u64 * PAGE_SIZE)
                .unwrap_or(0);
            return Err(Trap::Segmentation {
                addr: end,
                max: max_bytes,
            });
        }
        Ok(())
    }

    fn read_exact(&self, addr: u64, out: &mut [u8]) -> Result<(), Trap> {
        let end = addr + out.len() as u64;
        {
            let buf = self.read_buf();
            if end <= buf.len() as u64 {
                out.copy_from_slice(&buf[addr as usize..end as usize]);
                return Ok(());
            }
        }
        self.fault_or_grow(end)?;
        let buf = self.read_buf();
        if end <= buf.len() as u64 {
            out.copy_from_slice(&buf[addr as usize..end as usize]);
            Ok(())
        } else {
            Err(Trap::Segmentation {
                addr: end,
                max: buf.len() as u64,
            })
        }
    }

    fn write_exact(&self, addr: u64, bytes: &[u8]) -> Result<(), Trap> {
        let end = addr + bytes.len() as u64;
        {
            let mut buf = self.write_buf();
            if end <= buf.len() as u64 {
                buf[addr as usize..end as usize].copy_from_slice(bytes);
                return Ok(());
            }
        }
        self.fault_or_grow(end)?;
        let mut buf = self.write_buf();
        if end <= buf.len() as u64 {
            buf[addr as usize..end as usize].copy_from_slice(bytes);
            Ok(())
        } else {
            Err(Trap::Segmentation {
                addr: end,
                max: buf.len() as u64,
            })
        }
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, Trap> {
        let mut b = [0u8; 1];
        self.read_exact(addr, &mut b)?;
        Ok(b[0])
    }

    pub fn read_i8(&self, addr: u64) -> Result<i8, Trap> {
        self.read_u8(addr).map(|v| v as i8)
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, Trap> {
        let mut b = [0u8; 2];
        self.read_exact(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_i16(&self, addr: u64) -> Result<i16, Trap> {
        self.read_u16(addr).map(|v| v as i16)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, Trap> {
        let mut b = [0u8; 4];
        self.read_exact(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_i32(&self, addr: u64) -> Result<i32, Trap> {
        self.read_u32(addr).map(|v| v as i32)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, Trap> {
        let mut b = [0u8; 8];
        self.read_exact(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_i64(&self, addr: u64) -> Result<i64, Trap> {
        self.read_u64(addr).map(|v| v as i64)
    }

    pub fn read_f32(&self, addr: u64) -> Result<f32, Trap> {
        self.read_u32(addr).map(f32::from_bits)
    }

    pub fn read_f64(&self, addr: u64) -> Result<f64, Trap> {
        self.read_u64(addr).map(f64::from_bits)
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), Trap> {
        self.write_exact(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), Trap> {
        self.write_exact(addr, &value.to_le_bytes())
    }

    pub fn write_i32(&self, addr: u64, value: i32) -> Result<(), Trap> {
        self.write_exact(addr, &value.to_le_bytes())
    }

    pub fn write_i64(&self, addr: u64, value: i64) -> Result<(), Trap> {
        self.write_exact(addr, &value.to_le_bytes())
    }

    pub fn write_f32(&self, addr: u64, value: f32) -> Result<(), Trap> {
        self.write_exact(addr, &value.to_bits().to_le_bytes())
    }

    pub fn write_f64(&self, addr: u64, value: f64) -> Result<(), Trap> {
        self.write_exact(addr, &value.to_bits().to_le_bytes())
    }

    /// Copy a data segment into memory.
    pub fn write_bulk(&self, addr: u64, bytes: &[u8]) -> Result<(), Trap> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.write_exact(addr, bytes)
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_is_monotonic_and_copy_preserving() {
        let mem = Memory::new();
        assert_eq!(mem.size(), 0);
        assert_eq!(mem.grow(2), 0);
        assert_eq!(mem.size(), 2);

        mem.write_i32(100, 0x1234_5678).unwrap();
        assert_eq!(mem.grow(3), 2);
        assert_eq!(mem.size(), 5);
        // bytes below the old boundary are unchanged
        assert_eq!(mem.read_i32(100).unwrap(), 0x1234_5678);
        // and the extension is zero-filled
        assert_eq!(mem.read_i64(2 * PAGE_SIZE).unwrap(), 0);
    }

    #[test]
    fn grow_past_max_returns_sentinel() {
        let mem = Memory::with_limits(
            Limits::new(1, Some(2)),
            AllocationMode::Immediate,
            DEFAULT_PADDING,
        );
        assert_eq!(mem.size(), 1);
        assert_eq!(mem.grow(1), 1);
        assert_eq!(mem.size(), 2);
        assert_eq!(mem.grow(1), -1);
        assert_eq!(mem.size(), 2);
    }

    #[test]
    fn access_past_max_faults_in_both_modes() {
        for mode in [AllocationMode::OnDemand, AllocationMode::Immediate] {
            let mem = Memory::with_limits(Limits::new(1, Some(2)), mode, DEFAULT_PADDING);
            assert!(mem.write_i32(2 * PAGE_SIZE, 1).is_err());
            assert!(matches!(
                mem.read_i32(2 * PAGE_SIZE),
                Err(Trap::Segmentation { .. })
            ));
        }
    }

    #[test]
    fn on_demand_growth_is_padding_quantized() {
        let mem = Memory::with_limits(Limits::new(0, None), AllocationMode::OnDemand, 1024);
        mem.write_u8(10, 7).unwrap();
        // quantized to the padding increment, then rounded up to a page
        assert_eq!(mem.size(), 1);
        assert_eq!(mem.read_u8(10).unwrap(), 7);
        assert_eq!(mem.read_u8(11).unwrap(), 0);
    }

    #[test]
    fn immediate_mode_allocates_min_up_front() {
        let mem = Memory::with_limits(
            Limits::new(2, None),
            AllocationMode::Immediate,
            DEFAULT_PADDING,
        );
        assert_eq!(mem.size(), 2);
    }

    #[test]
    fn min_is_a_growth_floor() {
        let mem = Memory::with_limits(
            Limits::new(2, Some(4)),
            AllocationMode::OnDemand,
            DEFAULT_PADDING,
        );
        assert_eq!(mem.size(), 0);
        mem.write_u8(0, 1).unwrap();
        assert_eq!(mem.size(), 2);
    }

    #[test]
    fn last_word_of_page_is_accessible() {
        let mem = Memory::with_limits(
            Limits::new(1, Some(2)),
            AllocationMode::OnDemand,
            DEFAULT_PADDING,
        );
        mem.write_i32(PAGE_SIZE - 4, -1).unwrap();
        assert_eq!(mem.read_i32(PAGE_SIZE - 4).unwrap(), -1);
        mem.write_i32(2 * PAGE_SIZE - 4, 7).unwrap();
        assert_eq!(mem.read_i32(2 * PAGE_SIZE - 4).unwrap(), 7);
        assert!(mem.write_i32(2 * PAGE_SIZE, 1).is_err());
    }

    #[test]
    fn narrow_accessors_round_trip() {
        let mem = Memory::new();
        mem.write_u8(0, 0xFF).unwrap();
        assert_eq!(mem.read_i8(0).unwrap(), -1);
        assert_eq!(mem.read_u8(0).unwrap(), 0xFF);
        mem.write_u16(2, 0x8000).unwrap();
        assert_eq!(mem.read_i16(2).unwrap(), i16::MIN);
        mem.write_f64(8, 1.25).unwrap();
        assert_eq!(mem.read_f64(8).unwrap(), 1.25);
    }

    #[test]
    fn bulk_write_copies_bytes() {
        let mem = Memory::new();
        mem.write_bulk(5, b"hello").unwrap();
        assert_eq!(mem.read_u8(5).unwrap(), b'h');
        assert_eq!(mem.read_u8(9).unwrap(), b'o');
    }
}
