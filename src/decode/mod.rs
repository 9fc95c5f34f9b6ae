//! Instruction decoder: prefix handling, opcode dispatch, ModR/M resolution
//! and immediate reads, producing an [`Instruction`] the `exec` module
//! carries out.
//!
//! Rather than two 256-entry opcode tables (16-/32-bit default) plus a
//! parallel `0F`-prefixed pair of executor-pointer entries, this decoder
//! uses a single `match` on a compact opcode enum. Slash (group) opcodes
//! still re-index by the ModR/M reg field, the same nested eight-entry
//! sub-table shape, just expressed as a nested match.

pub mod tables;

use crate::bits::Width;
use crate::error::Fault;
use crate::modrm::{self, ByteCursor, Operand};
use crate::reg::{Gpr, SegReg};
pub use tables::Instruction;

/// Sticky state accumulated while consuming prefix bytes; cleared after the
/// next non-prefix instruction completes or faults.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    pub segment_override: Option<SegReg>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub lock: bool,
    pub repne: bool,
    pub rep: bool,
}

/// Drives the byte fetch through the CPU's own fetch path (segmented,
/// Execute access) while tracking how many bytes have been consumed, so the
/// caller can advance EIP by exactly the decoded length.
pub struct Fetcher<'a> {
    pub regs: &'a crate::reg::Regs,
    pub mem: &'a mut crate::mem::PhysicalMemory,
    pub start_eip: u32,
    pub cursor_eip: u32,
}

impl<'a> ByteCursor for Fetcher<'a> {
    fn next_byte(&mut self) -> Result<u8, Fault> {
        let b = crate::segments::fetch_byte(self.regs, self.mem, self.cursor_eip)?;
        self.cursor_eip = self.cursor_eip.wrapping_add(1);
        Ok(b)
    }
}

impl<'a> Fetcher<'a> {
    pub fn consumed(&self) -> u32 {
        self.cursor_eip.wrapping_sub(self.start_eip)
    }

    fn read_imm(&mut self, width: Width) -> Result<u32, Fault> {
        match width {
            Width::Byte => Ok(self.next_byte()? as u32),
            Width::Word => {
                let lo = self.next_byte()? as u32;
                let hi = self.next_byte()? as u32;
                Ok(lo | (hi << 8))
            }
            Width::DWord => {
                let lo = self.next_byte()? as u32;
                let b1 = self.next_byte()? as u32;
                let b2 = self.next_byte()? as u32;
                let b3 = self.next_byte()? as u32;
                Ok(lo | (b1 << 8) | (b2 << 16) | (b3 << 24))
            }
        }
    }

    fn modrm(&mut self, prefixes: &Prefixes, address_size_32: bool, gpr: &[u32; 8]) -> Result<modrm::ModRm, Fault> {
        let get = |r: Gpr| gpr[r as usize];
        modrm::decode(self, address_size_32, prefixes.segment_override, &get)
    }
}

/// Reads prefix bytes, the opcode, and operands; returns the decoded
/// instruction and the total byte length (for advancing EIP).
pub fn decode_one(
    regs: &crate::reg::Regs,
    mem: &mut crate::mem::PhysicalMemory,
    eip: u32,
    default_operand_size_32: bool,
    default_address_size_32: bool,
) -> Result<(Instruction, u32), Fault> {
    let mut prefixes = Prefixes::default();
    let gpr_snapshot = {
        let mut arr = [0u32; 8];
        for i in 0..8 {
            arr[i] = regs.get32(Gpr::from_index(i as u8));
        }
        arr
    };

    let mut fetcher = Fetcher {
        regs,
        mem,
        start_eip: eip,
        cursor_eip: eip,
    };

    let opcode = loop {
        let byte = fetcher.next_byte()?;
        match byte {
            0x26 => prefixes.segment_override = Some(SegReg::Es),
            0x2E => prefixes.segment_override = Some(SegReg::Cs),
            0x36 => prefixes.segment_override = Some(SegReg::Ss),
            0x3E => prefixes.segment_override = Some(SegReg::Ds),
            0x64 => prefixes.segment_override = Some(SegReg::Fs),
            0x65 => prefixes.segment_override = Some(SegReg::Gs),
            0x66 => prefixes.operand_size_override = true,
            0x67 => prefixes.address_size_override = true,
            0xF0 => prefixes.lock = true,
            0xF2 => prefixes.repne = true,
            0xF3 => prefixes.rep = true,
            other => break other,
        }
    };

    let operand_size_32 = default_operand_size_32 ^ prefixes.operand_size_override;
    let address_size_32 = default_address_size_32 ^ prefixes.address_size_override;

    let instruction = tables::decode_opcode(
        &mut fetcher,
        opcode,
        &prefixes,
        operand_size_32,
        address_size_32,
        &gpr_snapshot,
    )?;

    Ok((instruction, fetcher.consumed()))
}

pub(crate) fn operand_width(operand_size_32: bool) -> Width {
    if operand_size_32 {
        Width::DWord
    } else {
        Width::Word
    }
}

pub(crate) fn as_memory(op: Operand) -> Option<(SegReg, u32)> {
    match op {
        Operand::Memory { segment, offset } => Some((segment, offset)),
        _ => None,
    }
}
