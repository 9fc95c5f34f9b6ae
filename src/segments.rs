//! Segmented memory access: linear-address formation, protected-mode
//! validation, paging translation, A20 masking and provider dispatch — the
//! single pipeline every read/write/instruction-fetch funnels through.

use crate::bits::Width;
use crate::error::Fault;
use crate::mem::PhysicalMemory;
use crate::paging::{self, AccessKind};
use crate::reg::{Regs, SegReg};

/// Resolves `segment:offset` down to a physical address, performing every
/// protection and limit check in the access pipeline, without touching
/// memory yet.
pub fn linear_to_physical(
    regs: &Regs,
    mem: &mut PhysicalMemory,
    seg: SegReg,
    offset: u32,
    width: Width,
    access: AccessKind,
) -> Result<u32, Fault> {
    let cache = regs.seg(seg);
    let linear = cache.base.wrapping_add(offset);

    if regs.cr[0] & 1 != 0 {
        // Protected mode: validate against the cached descriptor.
        if cache.selector == 0 && !cache.non_system {
            return Err(Fault::general_protection(0));
        }
        match access {
            AccessKind::Execute => {
                if !cache.is_code() {
                    return Err(Fault::general_protection(cache.selector as u32 & !0b111));
                }
            }
            AccessKind::Read => {
                if cache.is_code() && !cache.code_readable() {
                    return Err(Fault::general_protection(cache.selector as u32 & !0b111));
                }
            }
            AccessKind::Write => {
                if !cache.is_data() || !cache.data_writable() {
                    return Err(Fault::general_protection(cache.selector as u32 & !0b111));
                }
            }
        }
        let last_byte = offset.wrapping_add(width.bytes() - 1);
        if cache.data_expand_down() {
            // Expand-down: valid offsets lie strictly above the limit, up to
            // the segment's upper bound (0xFFFF, or 0xFFFFFFFF if B/D is set).
            let max = if cache.default_big { 0xFFFF_FFFF } else { 0xFFFF };
            if offset <= cache.limit || last_byte > max || last_byte < offset {
                return Err(Fault::general_protection(cache.selector as u32 & !0b111));
            }
        } else if last_byte > cache.limit || last_byte < offset {
            return Err(Fault::general_protection(cache.selector as u32 & !0b111));
        }
    }

    if regs.cr[0] & 1 != 0 && regs.cr[0] & 0x8000_0000 != 0 {
        let user = regs.cpl() == 3;
        let wp = regs.cr[0] & (1 << 16) != 0;
        paging::translate(mem, regs.cr[3], linear, access, user, wp)
    } else {
        Ok(linear)
    }
}

pub fn read(
    regs: &Regs,
    mem: &mut PhysicalMemory,
    seg: SegReg,
    offset: u32,
    width: Width,
) -> Result<u32, Fault> {
    let phys = linear_to_physical(regs, mem, seg, offset, width, AccessKind::Read)?;
    Ok(mem.read(phys, width.bytes()))
}

pub fn write(
    regs: &Regs,
    mem: &mut PhysicalMemory,
    seg: SegReg,
    offset: u32,
    width: Width,
    value: u32,
) -> Result<(), Fault> {
    let phys = linear_to_physical(regs, mem, seg, offset, width, AccessKind::Write)?;
    mem.write(phys, width.bytes(), value);
    Ok(())
}

/// Fetches one byte through CS with Execute access and advances neither
/// EIP nor any cursor itself — callers own their own cursor (the decoder's
/// `InstructionStream`, or an ad hoc peek).
pub fn fetch_byte(regs: &Regs, mem: &mut PhysicalMemory, eip: u32) -> Result<u8, Fault> {
    let phys = linear_to_physical(regs, mem, SegReg::Cs, eip, Width::Byte, AccessKind::Execute)?;
    Ok(mem.read(phys, 1) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_mode_read_write_round_trips() {
        let mut regs = Regs::default();
        regs.seg_mut(SegReg::Ds).base = 0x1000;
        let mut mem = PhysicalMemory::new(0x10000);
        write(&regs, &mut mem, SegReg::Ds, 0x10, Width::Word, 0xBEEF).unwrap();
        assert_eq!(read(&regs, &mut mem, SegReg::Ds, 0x10, Width::Word).unwrap(), 0xBEEF);
    }

    #[test]
    fn protected_mode_limit_violation_faults() {
        let mut regs = Regs::default();
        regs.cr[0] = 1;
        let ds = regs.seg_mut(SegReg::Ds);
        ds.selector = 0x10;
        ds.base = 0;
        ds.limit = 0xF;
        ds.non_system = true;
        ds.segment_type = 0b0010; // data, writable
        let mut mem = PhysicalMemory::new(0x10000);
        let err = write(&regs, &mut mem, SegReg::Ds, 0x10, Width::Byte, 1).unwrap_err();
        assert_eq!(err.vector, 13);
    }

    #[test]
    fn expand_down_segment_rejects_offsets_at_or_below_limit() {
        let mut regs = Regs::default();
        regs.cr[0] = 1;
        let ds = regs.seg_mut(SegReg::Ds);
        ds.selector = 0x10;
        ds.base = 0;
        ds.limit = 0x100;
        ds.non_system = true;
        ds.default_big = false;
        ds.segment_type = 0b0110; // data, writable, expand-down
        let mut mem = PhysicalMemory::new(0x10000);

        let err = write(&regs, &mut mem, SegReg::Ds, 0x100, Width::Byte, 1).unwrap_err();
        assert_eq!(err.vector, 13);

        write(&regs, &mut mem, SegReg::Ds, 0x101, Width::Byte, 1).unwrap();
        assert_eq!(read(&regs, &mut mem, SegReg::Ds, 0x101, Width::Byte).unwrap(), 1);
    }
}
