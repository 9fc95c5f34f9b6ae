//! End-to-end scenarios assembled from `Cpu` plus in-memory state, one per
//! documented behavior: real-mode interrupt delivery, arithmetic overflow,
//! divide-by-zero fault addressing, LOOP, a paging protection fault, and a
//! privilege-escalating far call through a call gate.

use x86em::bits::Width;
use x86em::control_flow::{self, JumpType};
use x86em::cpu::Cpu;
use x86em::descriptor::{DescriptorKind, RawDescriptor};
use x86em::reg::{EFlags, Gpr, SegReg};
use x86em::segments;

fn real_mode_cpu() -> Cpu {
    let mut cpu = Cpu::new(0x10_0000);
    cpu.reset();
    cpu.regs.seg_mut(SegReg::Cs).selector = 0x1000;
    cpu.regs.seg_mut(SegReg::Cs).base = 0x1_0000;
    cpu.regs.eip = 0;
    cpu.regs.seg_mut(SegReg::Ss).base = 0;
    cpu.regs.set16(Gpr::Esp, 0x1000);
    cpu
}

fn load(cpu: &mut Cpu, base: u32, bytes: &[u8]) {
    for (i, b) in bytes.iter().enumerate() {
        cpu.mem.write(base + i as u32, 1, *b as u32);
    }
}

#[test]
fn real_mode_int_pushes_return_address_and_vectors_through_ivt() {
    let mut cpu = real_mode_cpu();
    // IDT entry for vector 8 at 0000:0020 -> 2000:0100.
    cpu.mem.write(8 * 4, 2, 0x0100);
    cpu.mem.write(8 * 4 + 2, 2, 0x2000);
    let cs_base = cpu.regs.seg(SegReg::Cs).base;

    load(&mut cpu, cs_base, &[0xCD, 0x08]); // INT 8

    let old_sp = cpu.regs.get16(Gpr::Esp);
    cpu.step().unwrap();

    assert_eq!(cpu.regs.seg(SegReg::Cs).selector, 0x2000);
    assert_eq!(cpu.regs.eip, 0x0100);
    assert_eq!(cpu.regs.get16(Gpr::Esp), old_sp - 6);

    let sp = cpu.regs.get16(Gpr::Esp) as u32;
    let pushed_ip = cpu.mem.read(sp, 2);
    let pushed_cs = cpu.mem.read(sp + 2, 2);
    assert_eq!(pushed_ip, 2); // return address is past the 2-byte CD 08
    assert_eq!(pushed_cs, 0x1000);
}

#[test]
fn add_ax_1_with_7fff_sets_overflow_and_sign() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set16(Gpr::Eax, 0x7FFF);
    let cs_base = cpu.regs.seg(SegReg::Cs).base;

    load(&mut cpu, cs_base, &[0x05, 0x01, 0x00]); // ADD AX, 1

    cpu.step().unwrap();

    assert_eq!(cpu.regs.get16(Gpr::Eax), 0x8000);
    assert!(cpu.regs.flag(EFlags::OF));
    assert!(cpu.regs.flag(EFlags::SF));
    assert!(!cpu.regs.flag(EFlags::ZF));
    assert!(!cpu.regs.flag(EFlags::CF));
}

#[test]
fn div_by_zero_delivers_vector_0_with_return_at_offending_opcode() {
    let mut cpu = real_mode_cpu();
    cpu.mem.write(0 * 4, 2, 0x9000); // IDT[0] -> F000:9000, somewhere harmless
    cpu.mem.write(0 * 4 + 2, 2, 0xF000);
    cpu.regs.set16(Gpr::Eax, 0x1234);
    cpu.regs.set8(Gpr::Edx, false, 0x00);
    let cs_base = cpu.regs.seg(SegReg::Cs).base;

    load(&mut cpu, cs_base, &[0xF6, 0xF2]); // DIV DL

    let start_ip = cpu.regs.eip;
    cpu.step().unwrap();

    assert_eq!(cpu.regs.seg(SegReg::Cs).selector, 0xF000);
    assert_eq!(cpu.regs.eip, 0x9000);
    let sp = cpu.regs.get16(Gpr::Esp) as u32;
    let pushed_ip = cpu.mem.read(sp, 2);
    assert_eq!(pushed_ip, start_ip);
}

#[test]
fn loop_runs_three_times_then_falls_through() {
    let mut cpu = real_mode_cpu();
    cpu.regs.set16(Gpr::Ecx, 3);
    let cs_base = cpu.regs.seg(SegReg::Cs).base;

    load(&mut cpu, cs_base, &[0xE2, 0xFE]); // LOOP back to self

    for expected_cx in [2u16, 1, 0] {
        cpu.step().unwrap();
        assert_eq!(cpu.regs.get16(Gpr::Ecx), expected_cx);
        if expected_cx == 0 {
            assert_eq!(cpu.regs.eip, 2); // fell through past the instruction
        } else {
            assert_eq!(cpu.regs.eip, 0); // branched back to the loop start
        }
    }
}

#[test]
fn user_write_to_read_only_page_raises_page_fault_0b111() {
    let mut cpu = Cpu::new(0x20_0000);
    cpu.reset();
    cpu.regs.cr[0] = 1 | (1 << 31); // PE | PG
    cpu.regs.cr[3] = 0x1000;
    cpu.regs.seg_mut(SegReg::Cs).selector = 0b11; // CPL 3

    cpu.regs.seg_mut(SegReg::Ds).base = 0;
    cpu.regs.seg_mut(SegReg::Ds).limit = 0xFFFF_FFFF;
    cpu.regs.seg_mut(SegReg::Ds).non_system = true;
    cpu.regs.seg_mut(SegReg::Ds).segment_type = 0b0010; // data, writable

    let linear = 0x3000u32;
    let dir = (linear >> 22) & 0x3FF;
    let table = (linear >> 12) & 0x3FF;
    let pt_base = 0x2000u32;
    cpu.mem.write(0x1000 + dir * 4, 4, pt_base | 0b111); // PDE: P|W|U
    cpu.mem.write(pt_base + table * 4, 4, 0x4000 | 0b101); // PTE: P|U, not writable

    let before = cpu.mem.read(0x4000, 4);
    let err = segments::write(&cpu.regs, &mut cpu.mem, SegReg::Ds, linear, Width::DWord, 0xFFFF_FFFF).unwrap_err();

    assert_eq!(err.vector, 14);
    assert_eq!(err.error_code, Some(0b111));
    assert_eq!(err.linear_address, Some(linear));
    assert_eq!(cpu.mem.read(0x4000, 4), before);
}

#[test]
fn far_call_through_call_gate_escalates_to_ring_0_and_switches_stack() {
    let mut cpu = Cpu::new(0x20_0000);
    cpu.reset();
    cpu.regs.cr[0] = 1; // PE, no paging
    cpu.regs.gdtr_base = 0x1000;
    cpu.regs.gdtr_limit = 0xFFFF;

    // CPL=3 running on its own code/stack segments.
    cpu.regs.seg_mut(SegReg::Cs).selector = 0x1B; // index 3, RPL 3
    cpu.regs.seg_mut(SegReg::Cs).base = 0x5000;
    cpu.regs.seg_mut(SegReg::Cs).limit = 0xFFFF;
    cpu.regs.seg_mut(SegReg::Ss).selector = 0x23; // index 4, RPL 3
    cpu.regs.set32(Gpr::Esp, 0x100);
    cpu.regs.eip = 0x10;

    // TSS supplies the ring-0 stack the gate escalates onto.
    cpu.regs.tr.base = 0x9000;
    cpu.regs.tr.segment_type = 0x9; // 32-bit TSS, so stack_for_ring reads ESP0/SS0 as dword/word
    cpu.mem.write(0x9000 + 4, 4, 0x2000); // ESP0
    cpu.mem.write(0x9000 + 8, 2, 0x08); // SS0

    let code_desc = RawDescriptor {
        kind: DescriptorKind::Code,
        type_nibble: 0b1010,
        dpl: 0,
        present: true,
        avl: false,
        long: false,
        default_big: true,
        granularity: false,
        base: 0x6000,
        limit: 0xFFFF,
        gate_selector: 0,
        gate_offset: 0,
        gate_param_count: 0,
    };
    let gate = RawDescriptor {
        kind: DescriptorKind::CallGate32,
        type_nibble: 0xC,
        dpl: 3,
        present: true,
        avl: false,
        long: false,
        default_big: false,
        granularity: false,
        base: 0,
        limit: 0,
        gate_selector: 0x10, // targets GDT index 2 (the code descriptor)
        gate_offset: 0x2000,
        gate_param_count: 0,
    };
    let ring0_stack_desc = RawDescriptor {
        kind: DescriptorKind::Data,
        type_nibble: 0b0010,
        dpl: 0,
        present: true,
        avl: false,
        long: false,
        default_big: true,
        granularity: false,
        base: 0,
        limit: 0xFFFF_FFFF,
        gate_selector: 0,
        gate_offset: 0,
        gate_param_count: 0,
    };
    // GDT index 1 (selector 0x08) is the ring-0 stack SS0 points at; index 2
    // (selector 0x10) is the gate's ring-0 code target; index 3 (selector
    // 0x18) is the call gate itself.
    write_gdt_entry(&mut cpu, 1, &ring0_stack_desc);
    write_gdt_entry(&mut cpu, 2, &code_desc);
    write_gdt_entry(&mut cpu, 3, &gate);
    let call_gate_selector = 0x18u16;

    let old_ss = cpu.regs.seg(SegReg::Ss).selector as u32;
    let old_esp = cpu.regs.get32(Gpr::Esp);
    let old_cs = cpu.regs.seg(SegReg::Cs).selector as u32;
    let old_eip = cpu.regs.eip;

    control_flow::far_transfer(&mut cpu.regs, &mut cpu.mem, call_gate_selector, 0, true, Width::DWord, JumpType::Call).unwrap();

    assert_eq!(cpu.regs.cpl(), 0);
    assert_eq!(cpu.regs.seg(SegReg::Ss).selector, 0x08);
    assert_eq!(cpu.regs.get32(Gpr::Esp), 0x2000 - 16);
    assert_eq!(cpu.regs.eip, 0x2000);

    // Pushed in order old_ss, old_esp, old_cs, old_eip; each push lands at a
    // lower address, so the last push (old_eip) sits at the final ESP.
    let sp = cpu.regs.get32(Gpr::Esp);
    assert_eq!(cpu.mem.read(sp, 4), old_eip);
    assert_eq!(cpu.mem.read(sp + 4, 4), old_cs);
    assert_eq!(cpu.mem.read(sp + 8, 4), old_esp);
    assert_eq!(cpu.mem.read(sp + 12, 4), old_ss);
}

fn write_gdt_entry(cpu: &mut Cpu, index: u16, desc: &RawDescriptor) {
    let offset = cpu.regs.gdtr_base + index as u32 * 8;
    let raw = desc.to_raw();
    cpu.mem.write(offset, 4, raw as u32);
    cpu.mem.write(offset + 4, 4, (raw >> 32) as u32);
}
