//! Near/far jump, call, return and iret. Real mode simply loads CS:EIP;
//! protected mode validates conforming/DPL/RPL rules, recurses through
//! call gates, and hands off to [`crate::tasking`] for TSS/task-gate
//! targets.

use crate::bits::Width;
use crate::descriptor::{DescriptorKind, RawDescriptor, Selector};
use crate::error::Fault;
use crate::mem::PhysicalMemory;
use crate::reg::{EFlags, Regs, SegReg};
use crate::segments;
use crate::tasking;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpType {
    Call,
    Jmp,
    Int,
    Iret,
}

pub(crate) fn read_descriptor(regs: &Regs, mem: &mut PhysicalMemory, selector: Selector) -> Result<RawDescriptor, Fault> {
    let (table_base, table_limit) = if selector.ti() {
        (regs.ldtr.base, regs.ldtr.limit as u16)
    } else {
        (regs.gdtr_base, regs.gdtr_limit)
    };
    let offset = selector.index() as u32 * 8;
    if offset + 7 > table_limit as u32 {
        return Err(Fault::general_protection(selector.0 as u32 & !0b111));
    }
    let lo = mem.read(table_base + offset, 4) as u64;
    let hi = mem.read(table_base + offset + 4, 4) as u64;
    Ok(RawDescriptor::parse(lo | (hi << 32)))
}

fn push(regs: &mut Regs, mem: &mut PhysicalMemory, width: Width, value: u32) -> Result<(), Fault> {
    let sp = regs.get(crate::reg::Gpr::Esp, if regs.seg(SegReg::Ss).default_big { Width::DWord } else { Width::Word });
    let new_sp = sp.wrapping_sub(width.bytes());
    segments::write(regs, mem, SegReg::Ss, new_sp, width, value)?;
    if regs.seg(SegReg::Ss).default_big {
        regs.set32(crate::reg::Gpr::Esp, new_sp);
    } else {
        regs.set16(crate::reg::Gpr::Esp, new_sp as u16);
    }
    Ok(())
}

fn pop(regs: &mut Regs, mem: &mut PhysicalMemory, width: Width) -> Result<u32, Fault> {
    let sp = regs.get(crate::reg::Gpr::Esp, if regs.seg(SegReg::Ss).default_big { Width::DWord } else { Width::Word });
    let value = segments::read(regs, mem, SegReg::Ss, sp, width)?;
    let new_sp = sp.wrapping_add(width.bytes());
    if regs.seg(SegReg::Ss).default_big {
        regs.set32(crate::reg::Gpr::Esp, new_sp);
    } else {
        regs.set16(crate::reg::Gpr::Esp, new_sp as u16);
    }
    Ok(value)
}

fn load_cs(regs: &mut Regs, selector: u16, desc: &RawDescriptor) {
    let cache = crate::descriptor::SegmentCache::from_descriptor(selector, desc);
    *regs.seg_mut(SegReg::Cs) = cache;
}

/// The real-mode case: no descriptor, just load CS:EIP directly.
fn jump_real_mode(regs: &mut Regs, selector: u16, offset: u32) {
    let cs = regs.seg_mut(SegReg::Cs);
    cs.selector = selector;
    cs.base = (selector as u32) << 4;
    regs.eip = offset;
}

/// Far jump/call/iret entry point. `selector:offset` is the raw target;
/// `is_call` distinguishes JMP from CALL for the stack-push behaviour;
/// `source` tags the caller for tasking's NT-bit bookkeeping.
pub fn far_transfer(
    regs: &mut Regs,
    mem: &mut PhysicalMemory,
    selector: u16,
    offset: u32,
    is_call: bool,
    operand_width: Width,
    source: JumpType,
) -> Result<(), Fault> {
    if regs.cr[0] & 1 == 0 {
        if is_call {
            push(regs, mem, operand_width, regs.seg(SegReg::Cs).selector as u32)?;
            push(regs, mem, operand_width, regs.eip)?;
        }
        jump_real_mode(regs, selector, offset);
        return Ok(());
    }

    let sel = Selector(selector);
    if sel.is_null() {
        return Err(Fault::general_protection(0));
    }
    let desc = read_descriptor(regs, mem, sel)?;
    let cpl = regs.cpl();

    if desc.kind.is_tss() || desc.kind == DescriptorKind::TaskGate {
        return tasking::task_switch_via_descriptor(regs, mem, sel, &desc, source);
    }

    if desc.kind == DescriptorKind::CallGate16 || desc.kind == DescriptorKind::CallGate32 {
        if desc.dpl < cpl.max(sel.rpl()) {
            return Err(Fault::general_protection(selector as u32 & !0b111));
        }
        if !desc.present {
            return Err(Fault::not_present(selector as u32 & !0b111));
        }
        let gate_width = if desc.kind == DescriptorKind::CallGate32 { Width::DWord } else { Width::Word };
        let target_sel = Selector(desc.gate_selector);
        let target_desc = read_descriptor(regs, mem, target_sel)?;
        if !target_desc.is_code() {
            return Err(Fault::general_protection(desc.gate_selector as u32 & !0b111));
        }

        if is_call && target_desc.dpl < cpl {
            // Privilege escalation: switch to the target ring's stack.
            let (new_ss, new_esp) = tasking::stack_for_ring(regs, mem, target_desc.dpl)?;
            let old_ss_cache = *regs.seg(SegReg::Ss);
            let old_ss = old_ss_cache.selector as u32;
            let old_esp = regs.get(crate::reg::Gpr::Esp, gate_width);
            let old_cs = regs.seg(SegReg::Cs).selector as u32;
            let old_eip = regs.eip;

            let ss_desc = read_descriptor(regs, mem, Selector(new_ss))?;
            *regs.seg_mut(SegReg::Ss) = crate::descriptor::SegmentCache::from_descriptor(new_ss, &ss_desc);
            regs.set(crate::reg::Gpr::Esp, gate_width, new_esp);

            push(regs, mem, gate_width, old_ss)?;
            push(regs, mem, gate_width, old_esp)?;

            // Copy the call gate's parameter words from the caller's stack
            // onto the new stack, last parameter first so they land in the
            // callee's expected order just below the return CS:EIP.
            for i in (0..desc.gate_param_count as u32).rev() {
                let param_addr = old_ss_cache.base.wrapping_add(old_esp.wrapping_add(i * gate_width.bytes()));
                let param = mem.read(param_addr, gate_width.bytes());
                push(regs, mem, gate_width, param)?;
            }

            push(regs, mem, gate_width, old_cs)?;
            push(regs, mem, gate_width, old_eip)?;
        } else {
            if is_call {
                push(regs, mem, gate_width, regs.seg(SegReg::Cs).selector as u32)?;
                push(regs, mem, gate_width, regs.eip)?;
            }
        }
        load_cs(regs, desc.gate_selector, &target_desc);
        regs.eip = desc.gate_offset;
        if regs.eip > regs.seg(SegReg::Cs).limit {
            return Err(Fault::general_protection(0));
        }
        return Ok(());
    }

    if !desc.is_code() {
        return Err(Fault::general_protection(selector as u32 & !0b111));
    }
    if desc.conforming() {
        if desc.dpl > cpl {
            return Err(Fault::general_protection(selector as u32 & !0b111));
        }
    } else {
        if desc.dpl != cpl || sel.rpl() > cpl {
            return Err(Fault::general_protection(selector as u32 & !0b111));
        }
    }
    if !desc.present {
        return Err(Fault::not_present(selector as u32 & !0b111));
    }
    if offset > desc.limit {
        return Err(Fault::general_protection(0));
    }

    if is_call {
        push(regs, mem, operand_width, regs.seg(SegReg::Cs).selector as u32)?;
        push(regs, mem, operand_width, regs.eip)?;
    }
    load_cs(regs, selector, &desc);
    regs.eip = offset;
    Ok(())
}

/// Far return (RETF) / IRET's CS:EIP-popping half. `with_flags` selects
/// IRET's extra flags pop.
pub fn far_return(regs: &mut Regs, mem: &mut PhysicalMemory, operand_width: Width, pop_bytes: u16, with_flags: bool) -> Result<(), Fault> {
    if regs.cr[0] & 1 == 0 {
        let new_eip = pop(regs, mem, operand_width)?;
        let new_cs = pop(regs, mem, operand_width)? as u16;
        if with_flags {
            let flags = pop(regs, mem, operand_width)?;
            regs.set_eflags(flags);
        }
        jump_real_mode(regs, new_cs, new_eip);
        let sp = regs.get(crate::reg::Gpr::Esp, operand_width);
        regs.set(crate::reg::Gpr::Esp, operand_width, sp.wrapping_add(pop_bytes as u32));
        return Ok(());
    }

    let new_eip = pop(regs, mem, operand_width)?;
    let new_cs_sel = pop(regs, mem, operand_width)? as u16;
    let new_eflags = if with_flags { Some(pop(regs, mem, operand_width)?) } else { None };

    let old_cpl = regs.cpl();
    let sel = Selector(new_cs_sel);
    if sel.is_null() {
        return Err(Fault::general_protection(0));
    }
    let desc = read_descriptor(regs, mem, sel)?;
    if !desc.is_code() {
        return Err(Fault::general_protection(new_cs_sel as u32 & !0b111));
    }
    if sel.rpl() < old_cpl {
        return Err(Fault::general_protection(new_cs_sel as u32 & !0b111));
    }
    if !desc.present {
        return Err(Fault::not_present(new_cs_sel as u32 & !0b111));
    }

    load_cs(regs, new_cs_sel, &desc);
    regs.eip = new_eip;
    if let Some(flags) = new_eflags {
        regs.set_eflags(flags);
    }

    let new_cpl = sel.rpl();
    if new_cpl > old_cpl {
        let new_esp = pop(regs, mem, operand_width)?;
        let new_ss_sel = pop(regs, mem, operand_width)? as u16;
        let ss_desc = read_descriptor(regs, mem, Selector(new_ss_sel))?;
        *regs.seg_mut(SegReg::Ss) = crate::descriptor::SegmentCache::from_descriptor(new_ss_sel, &ss_desc);
        regs.set(crate::reg::Gpr::Esp, operand_width, new_esp);

        for seg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
            let cache = regs.seg(seg);
            let inaccessible = cache.selector == 0
                || (cache.is_data() && cache.dpl < new_cpl)
                || (cache.is_code() && !cache.conforming() && cache.dpl < new_cpl);
            if inaccessible {
                *regs.seg_mut(seg) = crate::descriptor::SegmentCache::default();
                regs.seg_mut(seg).selector = 0;
                regs.seg_mut(seg).valid = false;
            }
        }
    }

    let sp = regs.get(crate::reg::Gpr::Esp, operand_width);
    regs.set(crate::reg::Gpr::Esp, operand_width, sp.wrapping_add(pop_bytes as u32));
    Ok(())
}

/// Delivers an interrupt/exception vector through the IDT using the same
/// far-call machinery as a software `INT`.
pub fn deliver_interrupt(regs: &mut Regs, mem: &mut PhysicalMemory, vector: u8, error_code: Option<u32>, is_software_int: bool) -> Result<(), Fault> {
    if regs.cr[0] & 1 == 0 {
        let flags = regs.eflags() as u16;
        push(regs, mem, Width::Word, flags as u32)?;
        push(regs, mem, Width::Word, regs.seg(SegReg::Cs).selector as u32)?;
        push(regs, mem, Width::Word, regs.eip)?;
        regs.set_flag(EFlags::IF, false);
        regs.set_flag(EFlags::TF, false);

        let vector_offset = vector as u32 * 4;
        let new_ip = mem.read(vector_offset, 2);
        let new_cs = mem.read(vector_offset + 2, 2);
        jump_real_mode(regs, new_cs as u16, new_ip);
        return Ok(());
    }

    let idt_offset = vector as u32 * 8;
    if idt_offset + 7 > regs.idtr_limit as u32 {
        return Err(Fault::general_protection(vector as u32 * 8 + 2));
    }
    let lo = mem.read(regs.idtr_base + idt_offset, 4) as u64;
    let hi = mem.read(regs.idtr_base + idt_offset + 4, 4) as u64;
    let gate = RawDescriptor::parse(lo | (hi << 32));

    if gate.kind == DescriptorKind::TaskGate {
        return tasking::task_switch_via_descriptor(regs, mem, Selector(vector as u16 * 8), &gate, JumpType::Int);
    }

    let gate_width = match gate.kind {
        DescriptorKind::InterruptGate32 | DescriptorKind::TrapGate32 => Width::DWord,
        _ => Width::Word,
    };

    let cpl = regs.cpl();
    if is_software_int && gate.dpl < cpl {
        return Err(Fault::general_protection(vector as u32 * 8 + 2));
    }
    if !gate.present {
        return Err(Fault::not_present(vector as u32 * 8 + 2));
    }

    let target_sel = Selector(gate.gate_selector);
    let target_desc = read_descriptor(regs, mem, target_sel)?;
    let old_eflags = regs.eflags();
    let old_cs = regs.seg(SegReg::Cs).selector as u32;
    let old_eip = regs.eip;

    if target_desc.dpl < cpl {
        let (new_ss, new_esp) = tasking::stack_for_ring(regs, mem, target_desc.dpl)?;
        let old_ss = regs.seg(SegReg::Ss).selector as u32;
        let old_esp = regs.get(crate::reg::Gpr::Esp, gate_width);

        let ss_desc = read_descriptor(regs, mem, Selector(new_ss))?;
        *regs.seg_mut(SegReg::Ss) = crate::descriptor::SegmentCache::from_descriptor(new_ss, &ss_desc);
        regs.set(crate::reg::Gpr::Esp, gate_width, new_esp);

        push(regs, mem, gate_width, old_ss)?;
        push(regs, mem, gate_width, old_esp)?;
    }

    push(regs, mem, gate_width, old_eflags)?;
    push(regs, mem, gate_width, old_cs)?;
    push(regs, mem, gate_width, old_eip)?;
    if let Some(code) = error_code {
        push(regs, mem, gate_width, code)?;
    }

    load_cs(regs, gate.gate_selector, &target_desc);
    regs.eip = gate.gate_offset;
    if matches!(gate.kind, DescriptorKind::InterruptGate16 | DescriptorKind::InterruptGate32) {
        regs.set_flag(EFlags::IF, false);
    }
    regs.set_flag(EFlags::TF, false);
    Ok(())
}

pub(crate) fn push_value(regs: &mut Regs, mem: &mut PhysicalMemory, width: Width, value: u32) -> Result<(), Fault> {
    push(regs, mem, width, value)
}

pub(crate) fn pop_value(regs: &mut Regs, mem: &mut PhysicalMemory, width: Width) -> Result<u32, Fault> {
    pop(regs, mem, width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_mode_int_pushes_flags_cs_ip_and_vectors() {
        let mut regs = Regs::default();
        regs.seg_mut(SegReg::Cs).selector = 0x1000;
        regs.seg_mut(SegReg::Cs).base = 0x10000;
        regs.seg_mut(SegReg::Ss).base = 0;
        regs.set16(crate::reg::Gpr::Esp, 0x100);
        regs.eip = 0;

        let mut mem = PhysicalMemory::new(0x30000);
        // IDT entry for vector 8 at 0000:0020 -> 2000:0100.
        mem.write(8 * 4, 2, 0x0100);
        mem.write(8 * 4 + 2, 2, 0x2000);

        deliver_interrupt(&mut regs, &mut mem, 8, None, false).unwrap();

        assert_eq!(regs.seg(SegReg::Cs).selector, 0x2000);
        assert_eq!(regs.eip, 0x0100);
        assert_eq!(regs.get16(crate::reg::Gpr::Esp), 0x100 - 6);
    }
}
