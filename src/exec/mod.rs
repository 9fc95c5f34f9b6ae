//! Instruction execution: carries out every [`crate::decode::Instruction`]
//! variant against a [`Cpu`], one match arm per enum variant instead of one
//! executor function per opcode-table entry.

use crate::alu::{self, AluOp, ShiftOp};
use crate::bits::Width;
use crate::control_flow::{self, JumpType};
use crate::cpu::Cpu;
use crate::decode::tables::{Direction, Instruction, LoopKind, RepKind, ShiftCount, StringOpKind};
use crate::descriptor::{DescriptorKind, Selector, SegmentCache};
use crate::error::Fault;
use crate::modrm::Operand;
use crate::reg::{EFlags, Gpr, SegReg};
use crate::segments;

fn read_rm(cpu: &mut Cpu, rm: Operand, width: Width) -> Result<u32, Fault> {
    match rm {
        Operand::Register(r) => Ok(cpu.regs.get(r, width)),
        Operand::Memory { segment, offset } => segments::read(&cpu.regs, &mut cpu.mem, segment, offset, width),
    }
}

fn write_rm(cpu: &mut Cpu, rm: Operand, width: Width, value: u32) -> Result<(), Fault> {
    match rm {
        Operand::Register(r) => {
            cpu.regs.set(r, width, value);
            Ok(())
        }
        Operand::Memory { segment, offset } => segments::write(&cpu.regs, &mut cpu.mem, segment, offset, width, value),
    }
}

fn address_width(cpu: &Cpu) -> Width {
    if cpu.regs.seg(SegReg::Cs).default_big {
        Width::DWord
    } else {
        Width::Word
    }
}

/// Loads `selector` into `seg`, validating against its descriptor in
/// protected mode. Used by MOV to Sreg, POP Sreg and LDS/LES/LFS/LGS-style
/// loads. Far jumps/calls/iret go through [`control_flow`] instead, which
/// also handles gates and task switches.
fn load_segment(cpu: &mut Cpu, seg: SegReg, selector: u16) -> Result<(), Fault> {
    if cpu.regs.cr[0] & 1 == 0 {
        let cache = cpu.regs.seg_mut(seg);
        cache.selector = selector;
        cache.base = (selector as u32) << 4;
        cache.limit = 0xFFFF;
        cache.valid = true;
        return Ok(());
    }

    let sel = Selector(selector);
    if sel.is_null() {
        if seg == SegReg::Ss {
            return Err(Fault::general_protection(0));
        }
        let cache = cpu.regs.seg_mut(seg);
        cache.selector = 0;
        cache.valid = false;
        return Ok(());
    }

    let desc = control_flow::read_descriptor(&cpu.regs, &mut cpu.mem, sel)?;
    let cpl = cpu.regs.cpl();

    if seg == SegReg::Ss {
        if !desc.is_data() || !desc.data_writable() || desc.dpl != cpl || sel.rpl() != cpl {
            return Err(Fault::general_protection(selector as u32 & !0b111));
        }
    } else {
        let readable = desc.is_data() || (desc.is_code() && desc.code_readable());
        if !readable {
            return Err(Fault::general_protection(selector as u32 & !0b111));
        }
        let non_conforming = desc.is_data() || (desc.is_code() && !desc.conforming());
        if non_conforming && desc.dpl < cpl.max(sel.rpl()) {
            return Err(Fault::general_protection(selector as u32 & !0b111));
        }
    }
    if !desc.present {
        return Err(Fault::not_present(selector as u32 & !0b111));
    }

    *cpu.regs.seg_mut(seg) = SegmentCache::from_descriptor(selector, &desc);
    Ok(())
}

fn push(cpu: &mut Cpu, width: Width, value: u32) -> Result<(), Fault> {
    control_flow::push_value(&mut cpu.regs, &mut cpu.mem, width, value)
}

fn pop(cpu: &mut Cpu, width: Width) -> Result<u32, Fault> {
    control_flow::pop_value(&mut cpu.regs, &mut cpu.mem, width)
}

pub fn execute(cpu: &mut Cpu, instruction: Instruction) -> Result<(), Fault> {
    match instruction {
        Instruction::AluRmReg { op, width, rm, reg, dir } => match dir {
            Direction::ToRm => {
                let dest = read_rm(cpu, rm, width)?;
                let src = cpu.regs.get(reg, width);
                let result = alu::apply(&mut cpu.regs, op, dest, src, width);
                if op != AluOp::Cmp {
                    write_rm(cpu, rm, width, result)?;
                }
            }
            Direction::ToReg => {
                let dest = cpu.regs.get(reg, width);
                let src = read_rm(cpu, rm, width)?;
                let result = alu::apply(&mut cpu.regs, op, dest, src, width);
                if op != AluOp::Cmp {
                    cpu.regs.set(reg, width, result);
                }
            }
        },
        Instruction::AluAccImm { op, width, imm } => {
            let dest = cpu.regs.get(Gpr::Eax, width);
            let result = alu::apply(&mut cpu.regs, op, dest, imm, width);
            if op != AluOp::Cmp {
                cpu.regs.set(Gpr::Eax, width, result);
            }
        }
        Instruction::AluRmImm { op, width, rm, imm } => {
            let dest = read_rm(cpu, rm, width)?;
            let result = alu::apply(&mut cpu.regs, op, dest, imm, width);
            if op != AluOp::Cmp {
                write_rm(cpu, rm, width, result)?;
            }
        }
        Instruction::IncDecRm { width, rm, inc } => {
            let v = read_rm(cpu, rm, width)?;
            let r = if inc { alu::inc(&mut cpu.regs, v, width) } else { alu::dec(&mut cpu.regs, v, width) };
            write_rm(cpu, rm, width, r)?;
        }
        Instruction::NotNegRm { width, rm, neg } => {
            let v = read_rm(cpu, rm, width)?;
            let r = if neg { alu::neg(&mut cpu.regs, v, width) } else { alu::not(v, width) };
            write_rm(cpu, rm, width, r)?;
        }
        Instruction::TestRmImm { width, rm, imm } => {
            let v = read_rm(cpu, rm, width)?;
            alu::apply(&mut cpu.regs, AluOp::And, v, imm, width);
        }
        Instruction::TestRmReg { width, rm, reg } => {
            let v = read_rm(cpu, rm, width)?;
            let r = cpu.regs.get(reg, width);
            alu::apply(&mut cpu.regs, AluOp::And, v, r, width);
        }
        Instruction::MulRm { width, rm, signed } => {
            let src = read_rm(cpu, rm, width)?;
            let dest = cpu.regs.get(Gpr::Eax, width);
            let (lo, hi, cf) = if signed { alu::imul(dest, src, width) } else { alu::mul(dest, src, width) };
            match width {
                Width::Byte => cpu.regs.set16(Gpr::Eax, (((hi & 0xFF) << 8) | (lo & 0xFF)) as u16),
                Width::Word => {
                    cpu.regs.set16(Gpr::Eax, lo as u16);
                    cpu.regs.set16(Gpr::Edx, hi as u16);
                }
                Width::DWord => {
                    cpu.regs.set32(Gpr::Eax, lo);
                    cpu.regs.set32(Gpr::Edx, hi);
                }
            }
            cpu.regs.set_flag(EFlags::CF, cf);
            cpu.regs.set_flag(EFlags::OF, cf);
        }
        Instruction::DivRm { width, rm, signed } => {
            let src = read_rm(cpu, rm, width)?;
            let (high, low) = match width {
                Width::Byte => (cpu.regs.get8(Gpr::Eax, true) as u32, cpu.regs.get8(Gpr::Eax, false) as u32),
                Width::Word => (cpu.regs.get16(Gpr::Edx) as u32, cpu.regs.get16(Gpr::Eax) as u32),
                Width::DWord => (cpu.regs.get32(Gpr::Edx), cpu.regs.get32(Gpr::Eax)),
            };
            let (q, r) = if signed { alu::idiv(high, low, src, width)? } else { alu::div(high, low, src, width)? };
            match width {
                Width::Byte => {
                    cpu.regs.set8(Gpr::Eax, false, q as u8);
                    cpu.regs.set8(Gpr::Eax, true, r as u8);
                }
                Width::Word => {
                    cpu.regs.set16(Gpr::Eax, q as u16);
                    cpu.regs.set16(Gpr::Edx, r as u16);
                }
                Width::DWord => {
                    cpu.regs.set32(Gpr::Eax, q);
                    cpu.regs.set32(Gpr::Edx, r);
                }
            }
        }
        Instruction::ShiftRm { op, width, rm, count } => {
            let v = read_rm(cpu, rm, width)?;
            let c = match count {
                ShiftCount::One => 1,
                ShiftCount::Cl => cpu.regs.get8(Gpr::Ecx, false),
                ShiftCount::Imm8(n) => n,
            };
            let r = alu::shift(&mut cpu.regs, op, v, c, width);
            write_rm(cpu, rm, width, r)?;
        }
        Instruction::Aaa => {
            let (old_al, old_ah) = (cpu.regs.get8(Gpr::Eax, false), cpu.regs.get8(Gpr::Eax, true));
            let (al, ah) = alu::aaa(&mut cpu.regs, old_al, old_ah);
            cpu.regs.set8(Gpr::Eax, false, al);
            cpu.regs.set8(Gpr::Eax, true, ah);
        }
        Instruction::Aas => {
            let (old_al, old_ah) = (cpu.regs.get8(Gpr::Eax, false), cpu.regs.get8(Gpr::Eax, true));
            let (al, ah) = alu::aas(&mut cpu.regs, old_al, old_ah);
            cpu.regs.set8(Gpr::Eax, false, al);
            cpu.regs.set8(Gpr::Eax, true, ah);
        }
        Instruction::Aam { base } => {
            let old_al = cpu.regs.get8(Gpr::Eax, false);
            let (al, ah) = alu::aam(&mut cpu.regs, old_al, base)?;
            cpu.regs.set8(Gpr::Eax, false, al);
            cpu.regs.set8(Gpr::Eax, true, ah);
        }
        Instruction::Aad { base } => {
            let (old_al, old_ah) = (cpu.regs.get8(Gpr::Eax, false), cpu.regs.get8(Gpr::Eax, true));
            let al = alu::aad(&mut cpu.regs, old_al, old_ah, base);
            cpu.regs.set8(Gpr::Eax, false, al);
            cpu.regs.set8(Gpr::Eax, true, 0);
        }
        Instruction::Daa => {
            let old_al = cpu.regs.get8(Gpr::Eax, false);
            let al = alu::daa(&mut cpu.regs, old_al);
            cpu.regs.set8(Gpr::Eax, false, al);
        }
        Instruction::Das => {
            let old_al = cpu.regs.get8(Gpr::Eax, false);
            let al = alu::das(&mut cpu.regs, old_al);
            cpu.regs.set8(Gpr::Eax, false, al);
        }
        Instruction::MovRmReg { width, rm, reg, dir } => match dir {
            Direction::ToRm => {
                let v = cpu.regs.get(reg, width);
                write_rm(cpu, rm, width, v)?;
            }
            Direction::ToReg => {
                let v = read_rm(cpu, rm, width)?;
                cpu.regs.set(reg, width, v);
            }
        },
        Instruction::MovRmImm { width, rm, imm } => write_rm(cpu, rm, width, imm)?,
        Instruction::MovRegImm { width, reg, imm } => cpu.regs.set(reg, width, imm),
        Instruction::MovAccMoffs { width, to_acc, segment, offset } => {
            if to_acc {
                let v = segments::read(&cpu.regs, &mut cpu.mem, segment, offset, width)?;
                cpu.regs.set(Gpr::Eax, width, v);
            } else {
                let v = cpu.regs.get(Gpr::Eax, width);
                segments::write(&cpu.regs, &mut cpu.mem, segment, offset, width, v)?;
            }
        }
        Instruction::MovSegRm { rm, seg, to_seg } => {
            if to_seg {
                let v = read_rm(cpu, rm, Width::Word)? as u16;
                load_segment(cpu, seg, v)?;
            } else {
                let v = cpu.regs.seg(seg).selector as u32;
                write_rm(cpu, rm, Width::Word, v)?;
            }
        }
        Instruction::Lea { reg, width, segment: _, offset } => cpu.regs.set(reg, width, offset),
        Instruction::XchgRmReg { width, rm, reg } => {
            let a = read_rm(cpu, rm, width)?;
            let b = cpu.regs.get(reg, width);
            write_rm(cpu, rm, width, b)?;
            cpu.regs.set(reg, width, a);
        }
        Instruction::PushReg { reg, width } => {
            let v = cpu.regs.get(reg, width);
            push(cpu, width, v)?;
        }
        Instruction::PopReg { reg, width } => {
            let v = pop(cpu, width)?;
            cpu.regs.set(reg, width, v);
        }
        Instruction::PushImm { width, imm } => push(cpu, width, imm)?,
        Instruction::PushRm { width, rm } => {
            let v = read_rm(cpu, rm, width)?;
            push(cpu, width, v)?;
        }
        Instruction::PopRm { width, rm } => {
            let v = pop(cpu, width)?;
            write_rm(cpu, rm, width, v)?;
        }
        Instruction::PushSeg { seg, width } => {
            let v = cpu.regs.seg(seg).selector as u32;
            push(cpu, width, v)?;
        }
        Instruction::PopSeg { seg, width } => {
            let v = pop(cpu, width)? as u16;
            load_segment(cpu, seg, v)?;
        }
        Instruction::Cbw => {
            let al = cpu.regs.get8(Gpr::Eax, false) as i8 as i16 as u16;
            cpu.regs.set16(Gpr::Eax, al);
        }
        Instruction::Cwd => {
            let big = address_width(cpu) == Width::DWord;
            if big {
                let eax = cpu.regs.get32(Gpr::Eax) as i32;
                cpu.regs.set32(Gpr::Edx, if eax < 0 { 0xFFFF_FFFF } else { 0 });
            } else {
                let ax = cpu.regs.get16(Gpr::Eax) as i16;
                cpu.regs.set16(Gpr::Edx, if ax < 0 { 0xFFFF } else { 0 });
            }
        }
        Instruction::Nop => {}

        Instruction::JmpShort { disp } => {
            cpu.regs.eip = cpu.regs.eip.wrapping_add(disp as i32 as u32);
        }
        Instruction::JccShort { cond, disp } => {
            if crate::decode::tables::cond_holds(cond, &cpu.regs) {
                cpu.regs.eip = cpu.regs.eip.wrapping_add(disp as i32 as u32);
            }
        }
        Instruction::JccNear { cond, disp } => {
            if crate::decode::tables::cond_holds(cond, &cpu.regs) {
                cpu.regs.eip = cpu.regs.eip.wrapping_add(disp as u32);
            }
        }
        Instruction::JmpNear { disp } => {
            cpu.regs.eip = cpu.regs.eip.wrapping_add(disp as u32);
        }
        Instruction::JmpFarPtr { selector, offset } => {
            let width = address_width(cpu);
            control_flow::far_transfer(&mut cpu.regs, &mut cpu.mem, selector, offset, false, width, JumpType::Jmp)?;
        }
        Instruction::JmpFarIndirect { segment, offset, width } => {
            let new_offset = segments::read(&cpu.regs, &mut cpu.mem, segment, offset, width)?;
            let new_selector = segments::read(&cpu.regs, &mut cpu.mem, segment, offset.wrapping_add(width.bytes()), Width::Word)? as u16;
            control_flow::far_transfer(&mut cpu.regs, &mut cpu.mem, new_selector, new_offset, false, width, JumpType::Jmp)?;
        }
        Instruction::JmpNearAbsRm { width, rm } => {
            cpu.regs.eip = read_rm(cpu, rm, width)?;
        }
        Instruction::CallNear { disp } => {
            let width = address_width(cpu);
            push(cpu, width, cpu.regs.eip)?;
            cpu.regs.eip = cpu.regs.eip.wrapping_add(disp as u32);
        }
        Instruction::CallNearAbsRm { width, rm } => {
            let target = read_rm(cpu, rm, width)?;
            push(cpu, width, cpu.regs.eip)?;
            cpu.regs.eip = target;
        }
        Instruction::CallFarPtr { selector, offset } => {
            let width = address_width(cpu);
            control_flow::far_transfer(&mut cpu.regs, &mut cpu.mem, selector, offset, true, width, JumpType::Call)?;
        }
        Instruction::CallFarIndirect { segment, offset, width } => {
            let new_offset = segments::read(&cpu.regs, &mut cpu.mem, segment, offset, width)?;
            let new_selector = segments::read(&cpu.regs, &mut cpu.mem, segment, offset.wrapping_add(width.bytes()), Width::Word)? as u16;
            control_flow::far_transfer(&mut cpu.regs, &mut cpu.mem, new_selector, new_offset, true, width, JumpType::Call)?;
        }
        Instruction::RetNear { pop: pop_bytes } => {
            let width = address_width(cpu);
            let new_eip = pop(cpu, width)?;
            cpu.regs.eip = new_eip;
            let sp = cpu.regs.get(Gpr::Esp, width);
            cpu.regs.set(Gpr::Esp, width, sp.wrapping_add(pop_bytes as u32));
        }
        Instruction::RetFar { pop: pop_bytes } => {
            let width = address_width(cpu);
            control_flow::far_return(&mut cpu.regs, &mut cpu.mem, width, pop_bytes, false)?;
        }
        Instruction::Loop { kind, disp } => {
            let width = address_width(cpu);
            let taken = match kind {
                LoopKind::Jcxz => cpu.regs.get(Gpr::Ecx, width) == 0,
                _ => {
                    let count = cpu.regs.get(Gpr::Ecx, width).wrapping_sub(1);
                    cpu.regs.set(Gpr::Ecx, width, count);
                    match kind {
                        LoopKind::Loop => count != 0,
                        LoopKind::Loopz => count != 0 && cpu.regs.flag(EFlags::ZF),
                        LoopKind::Loopnz => count != 0 && !cpu.regs.flag(EFlags::ZF),
                        LoopKind::Jcxz => unreachable!(),
                    }
                }
            };
            if taken {
                cpu.regs.eip = cpu.regs.eip.wrapping_add(disp as i32 as u32);
            }
        }
        Instruction::IntImm { vector } => {
            control_flow::deliver_interrupt(&mut cpu.regs, &mut cpu.mem, vector, None, true)?;
        }
        Instruction::Into => {
            if cpu.regs.flag(EFlags::OF) {
                control_flow::deliver_interrupt(&mut cpu.regs, &mut cpu.mem, 4, None, true)?;
            }
        }
        Instruction::Iret => {
            let width = address_width(cpu);
            control_flow::far_return(&mut cpu.regs, &mut cpu.mem, width, 0, true)?;
        }
        Instruction::Hlt => cpu.halt(),
        Instruction::Cli => cpu.regs.set_flag(EFlags::IF, false),
        Instruction::Sti => {
            cpu.regs.set_flag(EFlags::IF, true);
            cpu.inhibit_interrupts_for_next_instruction();
        }
        Instruction::Cld => cpu.regs.set_flag(EFlags::DF, false),
        Instruction::Std => cpu.regs.set_flag(EFlags::DF, true),
        Instruction::Clc => cpu.regs.set_flag(EFlags::CF, false),
        Instruction::Stc => cpu.regs.set_flag(EFlags::CF, true),
        Instruction::Cmc => {
            let cf = cpu.regs.flag(EFlags::CF);
            cpu.regs.set_flag(EFlags::CF, !cf);
        }

        Instruction::StringOp { op, width, address_size_32, segment_override, rep } => {
            exec_string_op(cpu, op, width, address_size_32, segment_override, rep)?;
        }

        Instruction::InImm { port, width } => {
            let v = cpu.io.read(port as u16, width.bytes());
            cpu.regs.set(Gpr::Eax, width, v);
        }
        Instruction::InDx { width } => {
            let port = cpu.regs.get16(Gpr::Edx);
            let v = cpu.io.read(port, width.bytes());
            cpu.regs.set(Gpr::Eax, width, v);
        }
        Instruction::OutImm { port, width } => {
            let v = cpu.regs.get(Gpr::Eax, width);
            cpu.io.write(port as u16, width.bytes(), v);
        }
        Instruction::OutDx { width } => {
            let port = cpu.regs.get16(Gpr::Edx);
            let v = cpu.regs.get(Gpr::Eax, width);
            cpu.io.write(port, width.bytes(), v);
        }

        Instruction::Lgdt { segment, offset } => {
            let limit = segments::read(&cpu.regs, &mut cpu.mem, segment, offset, Width::Word)? as u16;
            let base = segments::read(&cpu.regs, &mut cpu.mem, segment, offset.wrapping_add(2), Width::DWord)?;
            cpu.regs.gdtr_limit = limit;
            cpu.regs.gdtr_base = base;
        }
        Instruction::Lidt { segment, offset } => {
            let limit = segments::read(&cpu.regs, &mut cpu.mem, segment, offset, Width::Word)? as u16;
            let base = segments::read(&cpu.regs, &mut cpu.mem, segment, offset.wrapping_add(2), Width::DWord)?;
            cpu.regs.idtr_limit = limit;
            cpu.regs.idtr_base = base;
        }
        Instruction::Sgdt { segment, offset } => {
            segments::write(&cpu.regs, &mut cpu.mem, segment, offset, Width::Word, cpu.regs.gdtr_limit as u32)?;
            segments::write(&cpu.regs, &mut cpu.mem, segment, offset.wrapping_add(2), Width::DWord, cpu.regs.gdtr_base)?;
        }
        Instruction::Sidt { segment, offset } => {
            segments::write(&cpu.regs, &mut cpu.mem, segment, offset, Width::Word, cpu.regs.idtr_limit as u32)?;
            segments::write(&cpu.regs, &mut cpu.mem, segment, offset.wrapping_add(2), Width::DWord, cpu.regs.idtr_base)?;
        }
        Instruction::Lldt { rm } => {
            let sel = read_rm(cpu, rm, Width::Word)? as u16;
            if Selector(sel).is_null() {
                cpu.regs.ldtr.selector = 0;
                cpu.regs.ldtr.valid = false;
            } else {
                let desc = control_flow::read_descriptor(&cpu.regs, &mut cpu.mem, Selector(sel))?;
                if desc.kind != DescriptorKind::Ldt {
                    return Err(Fault::general_protection(sel as u32 & !0b111));
                }
                cpu.regs.ldtr = SegmentCache::from_descriptor(sel, &desc);
            }
        }
        Instruction::Sldt { rm } => write_rm(cpu, rm, Width::Word, cpu.regs.ldtr.selector as u32)?,
        Instruction::Ltr { rm } => {
            let sel = read_rm(cpu, rm, Width::Word)? as u16;
            let desc = control_flow::read_descriptor(&cpu.regs, &mut cpu.mem, Selector(sel))?;
            if !desc.kind.is_tss() || desc.kind.is_tss_busy() {
                return Err(Fault::general_protection(sel as u32 & !0b111));
            }
            cpu.regs.tr = SegmentCache::from_descriptor(sel, &desc);
        }
        Instruction::Str { rm } => write_rm(cpu, rm, Width::Word, cpu.regs.tr.selector as u32)?,
        Instruction::Clts => cpu.regs.cr[0] &= !(1 << 3),
        Instruction::MovCr { cr_index, gpr, to_cr } => {
            if to_cr {
                let value = cpu.regs.get32(gpr);
                if cr_index == 0 && (cpu.regs.cr[0] ^ value) & 1 != 0 {
                    log::debug!("cr0.pe transition: {} -> {}", cpu.regs.cr[0] & 1 != 0, value & 1 != 0);
                }
                cpu.regs.cr[cr_index as usize] = value;
            } else {
                let v = cpu.regs.cr[cr_index as usize];
                cpu.regs.set32(gpr, v);
            }
        }
        Instruction::MovDr { dr_index, gpr, to_dr } => {
            if to_dr {
                cpu.regs.dr[dr_index as usize] = cpu.regs.get32(gpr);
            } else {
                let v = cpu.regs.dr[dr_index as usize];
                cpu.regs.set32(gpr, v);
            }
        }
        Instruction::FpuStub => {
            log::trace!("fpu opcode stubbed at eip {:#010x}", cpu.regs.eip);
        }
    }
    Ok(())
}

fn step_index(cpu: &Cpu, width: Width) -> u32 {
    if cpu.regs.flag(EFlags::DF) {
        (-(width.bytes() as i32)) as u32
    } else {
        width.bytes()
    }
}

fn exec_string_op(
    cpu: &mut Cpu,
    op: StringOpKind,
    width: Width,
    address_size_32: bool,
    segment_override: Option<SegReg>,
    rep: Option<RepKind>,
) -> Result<(), Fault> {
    let addr_width = if address_size_32 { Width::DWord } else { Width::Word };
    let source_segment = segment_override.unwrap_or(SegReg::Ds);
    let step = step_index(cpu, width);

    loop {
        if let Some(_) = rep {
            let count = cpu.regs.get(Gpr::Ecx, addr_width);
            if count == 0 {
                break;
            }
            if cpu.regs.flag(EFlags::IF) && cpu.pic.has_pending_irq() {
                return Err(Fault::hardware_interrupt_during_rep());
            }
        }

        match op {
            StringOpKind::Movs => {
                let si = cpu.regs.get(Gpr::Esi, addr_width);
                let di = cpu.regs.get(Gpr::Edi, addr_width);
                let v = segments::read(&cpu.regs, &mut cpu.mem, source_segment, si, width)?;
                segments::write(&cpu.regs, &mut cpu.mem, SegReg::Es, di, width, v)?;
                cpu.regs.set(Gpr::Esi, addr_width, si.wrapping_add(step));
                cpu.regs.set(Gpr::Edi, addr_width, di.wrapping_add(step));
            }
            StringOpKind::Cmps => {
                let si = cpu.regs.get(Gpr::Esi, addr_width);
                let di = cpu.regs.get(Gpr::Edi, addr_width);
                let a = segments::read(&cpu.regs, &mut cpu.mem, source_segment, si, width)?;
                let b = segments::read(&cpu.regs, &mut cpu.mem, SegReg::Es, di, width)?;
                alu::apply(&mut cpu.regs, AluOp::Cmp, a, b, width);
                cpu.regs.set(Gpr::Esi, addr_width, si.wrapping_add(step));
                cpu.regs.set(Gpr::Edi, addr_width, di.wrapping_add(step));
            }
            StringOpKind::Stos => {
                let di = cpu.regs.get(Gpr::Edi, addr_width);
                let v = cpu.regs.get(Gpr::Eax, width);
                segments::write(&cpu.regs, &mut cpu.mem, SegReg::Es, di, width, v)?;
                cpu.regs.set(Gpr::Edi, addr_width, di.wrapping_add(step));
            }
            StringOpKind::Lods => {
                let si = cpu.regs.get(Gpr::Esi, addr_width);
                let v = segments::read(&cpu.regs, &mut cpu.mem, source_segment, si, width)?;
                cpu.regs.set(Gpr::Eax, width, v);
                cpu.regs.set(Gpr::Esi, addr_width, si.wrapping_add(step));
            }
            StringOpKind::Scas => {
                let di = cpu.regs.get(Gpr::Edi, addr_width);
                let a = cpu.regs.get(Gpr::Eax, width);
                let b = segments::read(&cpu.regs, &mut cpu.mem, SegReg::Es, di, width)?;
                alu::apply(&mut cpu.regs, AluOp::Cmp, a, b, width);
                cpu.regs.set(Gpr::Edi, addr_width, di.wrapping_add(step));
            }
            StringOpKind::Ins => {
                let di = cpu.regs.get(Gpr::Edi, addr_width);
                let port = cpu.regs.get16(Gpr::Edx);
                let v = cpu.io.read(port, width.bytes());
                segments::write(&cpu.regs, &mut cpu.mem, SegReg::Es, di, width, v)?;
                cpu.regs.set(Gpr::Edi, addr_width, di.wrapping_add(step));
            }
            StringOpKind::Outs => {
                let si = cpu.regs.get(Gpr::Esi, addr_width);
                let v = segments::read(&cpu.regs, &mut cpu.mem, source_segment, si, width)?;
                let port = cpu.regs.get16(Gpr::Edx);
                cpu.io.write(port, width.bytes(), v);
                cpu.regs.set(Gpr::Esi, addr_width, si.wrapping_add(step));
            }
        }

        match rep {
            None => break,
            Some(kind) => {
                let count = cpu.regs.get(Gpr::Ecx, addr_width).wrapping_sub(1);
                cpu.regs.set(Gpr::Ecx, addr_width, count);
                if count == 0 {
                    break;
                }
                let repeat_on_equal = match op {
                    StringOpKind::Cmps | StringOpKind::Scas => match kind {
                        RepKind::Rep => cpu.regs.flag(EFlags::ZF),
                        RepKind::Repne => !cpu.regs.flag(EFlags::ZF),
                    },
                    _ => true,
                };
                if !repeat_on_equal {
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tables::Instruction;
    use crate::reg::EFlags;

    fn new_cpu() -> Cpu {
        let mut cpu = Cpu::new(0x10_0000);
        cpu.reset();
        cpu.regs.seg_mut(SegReg::Cs).selector = 0;
        cpu.regs.seg_mut(SegReg::Cs).base = 0;
        cpu.regs.eip = 0;
        cpu
    }

    #[test]
    fn add_instruction_updates_register_and_flags() {
        let mut cpu = new_cpu();
        cpu.regs.set16(Gpr::Eax, 0x7FFF);
        execute(
            &mut cpu,
            Instruction::AluAccImm { op: AluOp::Add, width: Width::Word, imm: 1 },
        )
        .unwrap();
        assert_eq!(cpu.regs.get16(Gpr::Eax), 0x8000);
        assert!(cpu.regs.flag(EFlags::OF));
    }

    #[test]
    fn div_by_zero_faults_without_mutating_registers() {
        let mut cpu = new_cpu();
        cpu.regs.set16(Gpr::Eax, 10);
        cpu.regs.set16(Gpr::Edx, 0);
        let rm = Operand::Register(Gpr::Ecx);
        cpu.regs.set16(Gpr::Ecx, 0);
        let err = execute(&mut cpu, Instruction::DivRm { width: Width::Word, rm, signed: false }).unwrap_err();
        assert_eq!(err.vector, 0);
    }

    #[test]
    fn stos_writes_and_advances_di_by_width() {
        let mut cpu = new_cpu();
        cpu.regs.seg_mut(SegReg::Es).base = 0x2000;
        cpu.regs.set32(Gpr::Edi, 0x10);
        cpu.regs.set16(Gpr::Eax, 0xABCD);
        execute(
            &mut cpu,
            Instruction::StringOp {
                op: StringOpKind::Stos,
                width: Width::Word,
                address_size_32: true,
                segment_override: None,
                rep: None,
            },
        )
        .unwrap();
        assert_eq!(cpu.mem.read(0x2010, 2), 0xABCD);
        assert_eq!(cpu.regs.get32(Gpr::Edi), 0x12);
    }

    #[test]
    fn loop_decrements_cx_and_branches_until_zero() {
        let mut cpu = new_cpu();
        cpu.regs.set16(Gpr::Ecx, 1);
        cpu.regs.eip = 0x100;
        execute(&mut cpu, Instruction::Loop { kind: LoopKind::Loop, disp: -5 }).unwrap();
        assert_eq!(cpu.regs.get16(Gpr::Ecx), 0);
        assert_eq!(cpu.regs.eip, 0x100);
    }
}
