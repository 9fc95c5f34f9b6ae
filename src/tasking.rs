//! TSS layout and task switching: save the outgoing task's full register
//! state into its TSS, mark it available (unless this is an IRET-driven
//! switch, which instead clears NT of the *new* task), load the incoming
//! TSS's state, mark it busy, and update TR/CR3/EIP-limit.

use crate::control_flow::JumpType;
use crate::descriptor::{DescriptorKind, RawDescriptor, Selector, SegmentCache};
use crate::error::Fault;
use crate::mem::PhysicalMemory;
use crate::reg::{EFlags, Gpr, Regs, SegReg};

const TSS16_LEN: u32 = 44;
const TSS32_LEN: u32 = 104;

/// Field offsets within a 32-bit TSS, per the standard layout.
mod tss32 {
    pub const BACKLINK: u32 = 0;
    pub const ESP0: u32 = 4;
    pub const SS0: u32 = 8;
    pub const ESP1: u32 = 12;
    pub const SS1: u32 = 16;
    pub const ESP2: u32 = 20;
    pub const SS2: u32 = 24;
    pub const CR3: u32 = 28;
    pub const EIP: u32 = 32;
    pub const EFLAGS: u32 = 36;
    pub const EAX: u32 = 40;
    pub const ECX: u32 = 44;
    pub const EDX: u32 = 48;
    pub const EBX: u32 = 52;
    pub const ESP: u32 = 56;
    pub const EBP: u32 = 60;
    pub const ESI: u32 = 64;
    pub const EDI: u32 = 68;
    pub const ES: u32 = 72;
    pub const CS: u32 = 76;
    pub const SS: u32 = 80;
    pub const DS: u32 = 84;
    pub const FS: u32 = 88;
    pub const GS: u32 = 92;
    pub const LDT: u32 = 96;
}

/// Field offsets within a 16-bit TSS.
mod tss16 {
    pub const BACKLINK: u32 = 0;
    pub const SP0: u32 = 2;
    pub const SS0: u32 = 4;
    pub const SP1: u32 = 6;
    pub const SS1: u32 = 8;
    pub const SP2: u32 = 10;
    pub const SS2: u32 = 12;
    pub const IP: u32 = 14;
    pub const FLAGS: u32 = 16;
    pub const AX: u32 = 18;
    pub const CX: u32 = 20;
    pub const DX: u32 = 22;
    pub const BX: u32 = 24;
    pub const SP: u32 = 26;
    pub const BP: u32 = 28;
    pub const SI: u32 = 30;
    pub const DI: u32 = 32;
    pub const ES: u32 = 34;
    pub const CS: u32 = 36;
    pub const SS: u32 = 38;
    pub const DS: u32 = 40;
    pub const LDT: u32 = 42;
}

fn read_ring_stack_32(mem: &mut PhysicalMemory, tss_base: u32, ring: u8) -> (u16, u32) {
    let (esp_off, ss_off) = match ring {
        0 => (tss32::ESP0, tss32::SS0),
        1 => (tss32::ESP1, tss32::SS1),
        _ => (tss32::ESP2, tss32::SS2),
    };
    (
        mem.read(tss_base + ss_off, 2) as u16,
        mem.read(tss_base + esp_off, 4),
    )
}

fn read_ring_stack_16(mem: &mut PhysicalMemory, tss_base: u32, ring: u8) -> (u16, u32) {
    let (sp_off, ss_off) = match ring {
        0 => (tss16::SP0, tss16::SS0),
        1 => (tss16::SP1, tss16::SS1),
        _ => (tss16::SP2, tss16::SS2),
    };
    (
        mem.read(tss_base + ss_off, 2) as u16,
        mem.read(tss_base + sp_off, 2),
    )
}

/// Looks up the SS:ESP the incoming privilege level should run on, from the
/// *current* task's TSS (read before the switch, or for call-gate privilege
/// escalation within the same task).
pub fn stack_for_ring(regs: &Regs, mem: &mut PhysicalMemory, ring: u8) -> Result<(u16, u32), Fault> {
    let tss_base = regs.tr.base;
    if regs.tr.segment_type & 0x8 != 0 {
        Ok(read_ring_stack_32(mem, tss_base, ring))
    } else {
        Ok(read_ring_stack_16(mem, tss_base, ring))
    }
}

fn save_current_task(regs: &Regs, mem: &mut PhysicalMemory) {
    let tss_base = regs.tr.base;
    let is32 = regs.tr.segment_type & 0x8 != 0;
    if is32 {
        mem.write(tss_base + tss32::EIP, 4, regs.eip);
        mem.write(tss_base + tss32::EFLAGS, 4, regs.eflags());
        mem.write(tss_base + tss32::EAX, 4, regs.get32(Gpr::Eax));
        mem.write(tss_base + tss32::ECX, 4, regs.get32(Gpr::Ecx));
        mem.write(tss_base + tss32::EDX, 4, regs.get32(Gpr::Edx));
        mem.write(tss_base + tss32::EBX, 4, regs.get32(Gpr::Ebx));
        mem.write(tss_base + tss32::ESP, 4, regs.get32(Gpr::Esp));
        mem.write(tss_base + tss32::EBP, 4, regs.get32(Gpr::Ebp));
        mem.write(tss_base + tss32::ESI, 4, regs.get32(Gpr::Esi));
        mem.write(tss_base + tss32::EDI, 4, regs.get32(Gpr::Edi));
        mem.write(tss_base + tss32::ES, 2, regs.seg(SegReg::Es).selector as u32);
        mem.write(tss_base + tss32::CS, 2, regs.seg(SegReg::Cs).selector as u32);
        mem.write(tss_base + tss32::SS, 2, regs.seg(SegReg::Ss).selector as u32);
        mem.write(tss_base + tss32::DS, 2, regs.seg(SegReg::Ds).selector as u32);
        mem.write(tss_base + tss32::FS, 2, regs.seg(SegReg::Fs).selector as u32);
        mem.write(tss_base + tss32::GS, 2, regs.seg(SegReg::Gs).selector as u32);
    } else {
        mem.write(tss_base + tss16::IP, 2, regs.eip);
        mem.write(tss_base + tss16::FLAGS, 2, regs.eflags());
        mem.write(tss_base + tss16::AX, 2, regs.get16(Gpr::Eax) as u32);
        mem.write(tss_base + tss16::CX, 2, regs.get16(Gpr::Ecx) as u32);
        mem.write(tss_base + tss16::DX, 2, regs.get16(Gpr::Edx) as u32);
        mem.write(tss_base + tss16::BX, 2, regs.get16(Gpr::Ebx) as u32);
        mem.write(tss_base + tss16::SP, 2, regs.get16(Gpr::Esp) as u32);
        mem.write(tss_base + tss16::BP, 2, regs.get16(Gpr::Ebp) as u32);
        mem.write(tss_base + tss16::SI, 2, regs.get16(Gpr::Esi) as u32);
        mem.write(tss_base + tss16::DI, 2, regs.get16(Gpr::Edi) as u32);
        mem.write(tss_base + tss16::ES, 2, regs.seg(SegReg::Es).selector as u32);
        mem.write(tss_base + tss16::CS, 2, regs.seg(SegReg::Cs).selector as u32);
        mem.write(tss_base + tss16::SS, 2, regs.seg(SegReg::Ss).selector as u32);
        mem.write(tss_base + tss16::DS, 2, regs.seg(SegReg::Ds).selector as u32);
    }
}

fn load_new_task(regs: &mut Regs, mem: &mut PhysicalMemory, tss_base: u32, is32: bool) {
    if is32 {
        regs.eip = mem.read(tss_base + tss32::EIP, 4);
        regs.set_eflags(mem.read(tss_base + tss32::EFLAGS, 4));
        regs.set32(Gpr::Eax, mem.read(tss_base + tss32::EAX, 4));
        regs.set32(Gpr::Ecx, mem.read(tss_base + tss32::ECX, 4));
        regs.set32(Gpr::Edx, mem.read(tss_base + tss32::EDX, 4));
        regs.set32(Gpr::Ebx, mem.read(tss_base + tss32::EBX, 4));
        regs.set32(Gpr::Esp, mem.read(tss_base + tss32::ESP, 4));
        regs.set32(Gpr::Ebp, mem.read(tss_base + tss32::EBP, 4));
        regs.set32(Gpr::Esi, mem.read(tss_base + tss32::ESI, 4));
        regs.set32(Gpr::Edi, mem.read(tss_base + tss32::EDI, 4));
        regs.cr[3] = mem.read(tss_base + tss32::CR3, 4);
        let ldt_sel = mem.read(tss_base + tss32::LDT, 2) as u16;
        regs.ldtr.selector = ldt_sel;
        for (seg, off) in [
            (SegReg::Es, tss32::ES),
            (SegReg::Cs, tss32::CS),
            (SegReg::Ss, tss32::SS),
            (SegReg::Ds, tss32::DS),
            (SegReg::Fs, tss32::FS),
            (SegReg::Gs, tss32::GS),
        ] {
            let sel = mem.read(tss_base + off, 2) as u16;
            regs.seg_mut(seg).selector = sel;
            regs.seg_mut(seg).valid = false;
        }
    } else {
        regs.eip = mem.read(tss_base + tss16::IP, 2);
        regs.set_eflags(mem.read(tss_base + tss16::FLAGS, 2));
        regs.set16(Gpr::Eax, mem.read(tss_base + tss16::AX, 2) as u16);
        regs.set16(Gpr::Ecx, mem.read(tss_base + tss16::CX, 2) as u16);
        regs.set16(Gpr::Edx, mem.read(tss_base + tss16::DX, 2) as u16);
        regs.set16(Gpr::Ebx, mem.read(tss_base + tss16::BX, 2) as u16);
        regs.set16(Gpr::Esp, mem.read(tss_base + tss16::SP, 2) as u16);
        regs.set16(Gpr::Ebp, mem.read(tss_base + tss16::BP, 2) as u16);
        regs.set16(Gpr::Esi, mem.read(tss_base + tss16::SI, 2) as u16);
        regs.set16(Gpr::Edi, mem.read(tss_base + tss16::DI, 2) as u16);
        let ldt_sel = mem.read(tss_base + tss16::LDT, 2) as u16;
        regs.ldtr.selector = ldt_sel;
        for (seg, off) in [
            (SegReg::Es, tss16::ES),
            (SegReg::Cs, tss16::CS),
            (SegReg::Ss, tss16::SS),
            (SegReg::Ds, tss16::DS),
        ] {
            let sel = mem.read(tss_base + off, 2) as u16;
            regs.seg_mut(seg).selector = sel;
            regs.seg_mut(seg).valid = false;
        }
    }
}

fn write_descriptor_raw(mem: &mut PhysicalMemory, table_base: u32, index: u16, desc: &RawDescriptor) {
    let offset = index as u32 * 8;
    let raw = desc.to_raw();
    mem.write(table_base + offset, 4, raw as u32);
    mem.write(table_base + offset + 4, 4, (raw >> 32) as u32);
}

fn read_descriptor_from_gdt(regs: &Regs, mem: &mut PhysicalMemory, sel: Selector) -> RawDescriptor {
    let offset = sel.index() as u32 * 8;
    let lo = mem.read(regs.gdtr_base + offset, 4) as u64;
    let hi = mem.read(regs.gdtr_base + offset + 4, 4) as u64;
    RawDescriptor::parse(lo | (hi << 32))
}

/// Performs a task switch to the TSS named directly, or indirectly through a
/// task gate. `source` distinguishes CALL/INT (which link back, via the
/// backlink field, and leave the old task marked busy) from JMP and IRET
/// (which don't link, and for IRET additionally clear NT on entry).
pub fn task_switch_via_descriptor(
    regs: &mut Regs,
    mem: &mut PhysicalMemory,
    gate_selector: Selector,
    desc: &RawDescriptor,
    source: JumpType,
) -> Result<(), Fault> {
    let (tss_selector, tss_desc) = if desc.kind == DescriptorKind::TaskGate {
        let sel = Selector(desc.gate_selector);
        let d = read_descriptor_from_gdt(regs, mem, sel);
        if !d.kind.is_tss() {
            return Err(Fault::general_protection(sel.0 as u32 & !0b111));
        }
        (sel, d)
    } else {
        (gate_selector, *desc)
    };

    if !tss_desc.present {
        return Err(Fault::not_present(tss_selector.0 as u32 & !0b111));
    }
    if tss_desc.kind.is_tss_busy() && source != JumpType::Iret {
        return Err(Fault::general_protection(tss_selector.0 as u32 & !0b111));
    }

    let is32 = tss_desc.kind.is_tss_32();
    let new_base = tss_desc.base;

    let links_back = matches!(source, JumpType::Call | JumpType::Int);
    if links_back {
        save_current_task(regs, mem);
        mem.write(new_base, 4, regs.tr.selector as u32);
        let old_sel = Selector(regs.tr.selector);
        let old_desc = read_descriptor_from_gdt(regs, mem, old_sel).with_busy();
        write_descriptor_raw(mem, regs.gdtr_base, old_sel.index(), &old_desc);
    } else if source == JumpType::Jmp {
        save_current_task(regs, mem);
        let old_sel = Selector(regs.tr.selector);
        let old_desc = read_descriptor_from_gdt(regs, mem, old_sel).with_available();
        write_descriptor_raw(mem, regs.gdtr_base, old_sel.index(), &old_desc);
    } else {
        save_current_task(regs, mem);
    }

    if source != JumpType::Iret {
        let busy_desc = tss_desc.with_busy();
        write_descriptor_raw(mem, regs.gdtr_base, tss_selector.index(), &busy_desc);
    }

    log::debug!(
        "task switch: tss {:#06x} -> tss {:#06x} via {:?}",
        regs.tr.selector,
        tss_selector.0,
        source
    );
    load_new_task(regs, mem, new_base, is32);
    regs.tr = SegmentCache::from_descriptor(tss_selector.0, &tss_desc);
    regs.cr[0] |= 1 << 3; // CR0.TS

    if links_back {
        regs.set_flag(EFlags::NT, true);
    } else if source == JumpType::Iret {
        regs.set_flag(EFlags::NT, false);
    }

    let len = if is32 { TSS32_LEN } else { TSS16_LEN };
    let _ = len;
    if regs.eip > regs.seg(SegReg::Cs).limit {
        return Err(Fault::general_protection(0));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PhysicalMemory;

    #[test]
    fn jmp_to_tss_loads_new_register_state() {
        let mut regs = Regs::default();
        regs.gdtr_base = 0x1000;
        regs.gdtr_limit = 0xFFFF;
        regs.tr.base = 0x2000;
        regs.tr.selector = 0x0008;
        regs.tr.segment_type = 0x9;

        let mut mem = PhysicalMemory::new(0x10000);
        // Old TSS descriptor at GDT index 1 (selector 0x08): 32-bit TSS, available.
        let old_desc = RawDescriptor {
            kind: DescriptorKind::TssAvailable32,
            type_nibble: 0x9,
            dpl: 0,
            present: true,
            avl: false,
            long: false,
            default_big: false,
            granularity: false,
            base: 0x2000,
            limit: 103,
            gate_selector: 0,
            gate_offset: 0,
            gate_param_count: 0,
        };
        write_descriptor_raw(&mut mem, 0x1000, 1, &old_desc);

        // New TSS descriptor at GDT index 2 (selector 0x10).
        let new_desc = RawDescriptor {
            base: 0x3000,
            ..old_desc
        };
        write_descriptor_raw(&mut mem, 0x1000, 2, &new_desc);
        mem.write(0x3000 + tss32::EIP, 4, 0xABCD);
        mem.write(0x3000 + tss32::EAX, 4, 0x1111);

        task_switch_via_descriptor(&mut regs, &mut mem, Selector(0x0010), &new_desc, JumpType::Jmp).unwrap();

        assert_eq!(regs.eip, 0xABCD);
        assert_eq!(regs.get32(Gpr::Eax), 0x1111);
        assert_eq!(regs.tr.selector, 0x0010);
    }
}
