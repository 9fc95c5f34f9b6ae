//! ModR/M + SIB + displacement decoding: the operand-encoding bytes that
//! follow most opcodes, parameterised over 16- vs 32-bit addressing instead
//! of duplicating eight near-identical decode functions per width.

use crate::error::Fault;
use crate::reg::{Gpr, SegReg};

/// Where an operand, once decoded, actually lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(Gpr),
    Memory { segment: SegReg, offset: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
    pub operand: Operand,
    /// Total bytes consumed after the ModR/M byte itself (SIB + displacement).
    pub trailing_len: u8,
}

/// A byte source abstracting over "read the next instruction byte"; kept
/// generic so both the live fetch path and unit tests can drive it.
pub trait ByteCursor {
    fn next_byte(&mut self) -> Result<u8, Fault>;
}

fn read_u16(cursor: &mut dyn ByteCursor) -> Result<u16, Fault> {
    let lo = cursor.next_byte()? as u16;
    let hi = cursor.next_byte()? as u16;
    Ok(lo | (hi << 8))
}

fn read_u32(cursor: &mut dyn ByteCursor) -> Result<u32, Fault> {
    let lo = read_u16(cursor)? as u32;
    let hi = read_u16(cursor)? as u32;
    Ok(lo | (hi << 16))
}

/// Decodes one ModR/M (+ SIB + displacement) given the active address size
/// (16 or 32) and the current segment-override prefix, if any.
pub fn decode(
    cursor: &mut dyn ByteCursor,
    address_size_32: bool,
    segment_override: Option<SegReg>,
    regs_for_base: &dyn Fn(Gpr) -> u32,
) -> Result<ModRm, Fault> {
    let byte = cursor.next_byte()?;
    let md = byte >> 6;
    let reg = (byte >> 3) & 0b111;
    let rm = byte & 0b111;
    let mut trailing = 0u8;

    if md == 0b11 {
        return Ok(ModRm {
            md,
            reg,
            rm,
            operand: Operand::Register(Gpr::from_index(rm)),
            trailing_len: 0,
        });
    }

    let (offset, default_seg) = if address_size_32 {
        decode_32(cursor, md, rm, &mut trailing, regs_for_base)?
    } else {
        decode_16(cursor, md, rm, &mut trailing, regs_for_base)?
    };

    let segment = segment_override.unwrap_or(default_seg);
    Ok(ModRm {
        md,
        reg,
        rm,
        operand: Operand::Memory { segment, offset },
        trailing_len: trailing,
    })
}

fn decode_16(
    cursor: &mut dyn ByteCursor,
    md: u8,
    rm: u8,
    trailing: &mut u8,
    regs: &dyn Fn(Gpr) -> u32,
) -> Result<(u32, SegReg), Fault> {
    let base_index = |rm: u8, regs: &dyn Fn(Gpr) -> u32| -> u32 {
        match rm {
            0 => (regs(Gpr::Ebx) as u16).wrapping_add(regs(Gpr::Esi) as u16) as u32,
            1 => (regs(Gpr::Ebx) as u16).wrapping_add(regs(Gpr::Edi) as u16) as u32,
            2 => (regs(Gpr::Ebp) as u16).wrapping_add(regs(Gpr::Esi) as u16) as u32,
            3 => (regs(Gpr::Ebp) as u16).wrapping_add(regs(Gpr::Edi) as u16) as u32,
            4 => regs(Gpr::Esi) as u16 as u32,
            5 => regs(Gpr::Edi) as u16 as u32,
            6 => regs(Gpr::Ebp) as u16 as u32,
            _ => regs(Gpr::Ebx) as u16 as u32,
        }
    };

    let default_seg = match rm {
        0b010 | 0b011 => SegReg::Ss,
        0b110 if md != 0 => SegReg::Ss,
        _ => SegReg::Ds,
    };

    let offset = match (md, rm) {
        (0, 0b110) => {
            *trailing += 2;
            read_u16(cursor)? as u32
        }
        (0, _) => base_index(rm, regs),
        (1, _) => {
            *trailing += 1;
            let disp = cursor.next_byte()? as i8 as i32 as u32;
            base_index(rm, regs).wrapping_add(disp) & 0xFFFF
        }
        (2, _) => {
            *trailing += 2;
            let disp = read_u16(cursor)? as i16 as i32 as u32;
            base_index(rm, regs).wrapping_add(disp) & 0xFFFF
        }
        _ => unreachable!("mod==3 handled by caller"),
    };

    Ok((offset, default_seg))
}

fn decode_32(
    cursor: &mut dyn ByteCursor,
    md: u8,
    rm: u8,
    trailing: &mut u8,
    regs: &dyn Fn(Gpr) -> u32,
) -> Result<(u32, SegReg), Fault> {
    if rm == 0b100 {
        // SIB byte.
        *trailing += 1;
        let sib = cursor.next_byte()?;
        let scale = 1u32 << (sib >> 6);
        let index = (sib >> 3) & 0b111;
        let base = sib & 0b111;

        let index_value = if index == 0b100 {
            0
        } else {
            regs(Gpr::from_index(index))
        };

        let no_base = base == 0b101 && md == 0;
        let (base_value, extra_disp) = if no_base {
            *trailing += 4;
            (0u32, read_u32(cursor)?)
        } else {
            (regs(Gpr::from_index(base)), 0)
        };

        let default_seg = if base == 0b100 || (base == 0b101 && !no_base) {
            SegReg::Ss
        } else {
            SegReg::Ds
        };

        let mut offset = base_value.wrapping_add(index_value.wrapping_mul(scale)).wrapping_add(extra_disp);
        offset = apply_disp(cursor, md, trailing, offset)?;

        return Ok((offset, default_seg));
    }

    if rm == 0b101 && md == 0 {
        *trailing += 4;
        let disp = read_u32(cursor)?;
        return Ok((disp, SegReg::Ds));
    }

    let default_seg = if rm == 0b101 { SegReg::Ss } else { SegReg::Ds };
    let base_value = regs(Gpr::from_index(rm));
    let offset = apply_disp(cursor, md, trailing, base_value)?;
    Ok((offset, default_seg))
}

fn apply_disp(cursor: &mut dyn ByteCursor, md: u8, trailing: &mut u8, base: u32) -> Result<u32, Fault> {
    match md {
        0 => Ok(base),
        1 => {
            *trailing += 1;
            let disp = cursor.next_byte()? as i8 as i32 as u32;
            Ok(base.wrapping_add(disp))
        }
        2 => {
            *trailing += 4;
            let disp = read_u32(cursor)?;
            Ok(base.wrapping_add(disp))
        }
        _ => unreachable!("mod==3 handled by caller"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bytes {
        data: Vec<u8>,
        pos: usize,
    }

    impl ByteCursor for Bytes {
        fn next_byte(&mut self) -> Result<u8, Fault> {
            let b = self.data[self.pos];
            self.pos += 1;
            Ok(b)
        }
    }

    fn no_regs(_: Gpr) -> u32 {
        0
    }

    #[test]
    fn register_mode_decodes_direct() {
        let mut c = Bytes { data: vec![0xC0], pos: 0 }; // mod=11 reg=0 rm=0
        let m = decode(&mut c, true, None, &no_regs).unwrap();
        assert_eq!(m.operand, Operand::Register(Gpr::Eax));
        assert_eq!(m.trailing_len, 0);
    }

    #[test]
    fn mod0_rm5_32bit_is_bare_disp32() {
        let mut c = Bytes {
            data: vec![0x05, 0x78, 0x56, 0x34, 0x12],
            pos: 0,
        }; // mod=00 reg=0 rm=101
        let m = decode(&mut c, true, None, &no_regs).unwrap();
        match m.operand {
            Operand::Memory { offset, .. } => assert_eq!(offset, 0x1234_5678),
            _ => panic!("expected memory operand"),
        }
        assert_eq!(m.trailing_len, 4);
    }

    #[test]
    fn sib_with_scale_and_index() {
        // mod=00 reg=0 rm=100 (SIB follows), SIB: scale=2(x4) index=EAX base=EBX
        let mut c = Bytes {
            data: vec![0x04, 0b10_000_011],
            pos: 0,
        };
        let regs = |r: Gpr| match r {
            Gpr::Eax => 2,
            Gpr::Ebx => 100,
            _ => 0,
        };
        let m = decode(&mut c, true, None, &regs).unwrap();
        match m.operand {
            Operand::Memory { offset, .. } => assert_eq!(offset, 100 + 2 * 4),
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn bp_based_16bit_defaults_to_ss() {
        let mut c = Bytes { data: vec![0x46, 0x10], pos: 0 }; // mod=01 reg=0 rm=110 (BP+disp8)
        let regs = |r: Gpr| match r {
            Gpr::Ebp => 0x200,
            _ => 0,
        };
        let m = decode(&mut c, false, None, &regs).unwrap();
        match m.operand {
            Operand::Memory { segment, offset } => {
                assert_eq!(segment, SegReg::Ss);
                assert_eq!(offset, 0x210);
            }
            _ => panic!("expected memory operand"),
        }
    }
}
