//! The top-level CPU: register/memory/IO ownership, reset, and the main
//! execution loop — decode, execute, interrupt delivery, halted-state
//! handling.

use crate::control_flow;
use crate::decode;
use crate::error::Fault;
use crate::exec;
use crate::io::{InterruptController, IoBus, NoInterrupts};
use crate::mem::PhysicalMemory;
use crate::reg::{EFlags, Regs, SegReg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Alive,
    /// Waiting for an unmasked interrupt or reset; no instructions execute.
    Halted,
    /// A second fault while handling a double fault: unrecoverable.
    Dead,
}

pub struct Cpu {
    pub regs: Regs,
    pub mem: PhysicalMemory,
    pub io: IoBus,
    pub pic: Box<dyn InterruptController>,
    state: CpuState,
    /// Set for one instruction after STI/POP SS/MOV SS: an IRQ may not be
    /// serviced until the following instruction has also retired.
    interrupt_inhibited: bool,
}

impl Cpu {
    pub fn new(memory_bytes: usize) -> Cpu {
        Cpu {
            regs: Regs::default(),
            mem: PhysicalMemory::new(memory_bytes),
            io: IoBus::new(),
            pic: Box::new(NoInterrupts),
            state: CpuState::Alive,
            interrupt_inhibited: false,
        }
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    /// Resets to the documented power-on state: real mode, CS=F000 based at
    /// 0xFFFF0000 (so CS:EIP = 0xFFFF_FFF0, the standard reset vector),
    /// IF/TF clear, everything else zeroed.
    pub fn reset(&mut self) {
        self.regs = Regs::default();
        self.regs.seg_mut(SegReg::Cs).selector = 0xF000;
        self.regs.seg_mut(SegReg::Cs).base = 0xFFFF_0000;
        self.regs.eip = 0x0000_FFF0;
        for seg in [SegReg::Ds, SegReg::Es, SegReg::Ss, SegReg::Fs, SegReg::Gs] {
            self.regs.seg_mut(seg).selector = 0;
            self.regs.seg_mut(seg).base = 0;
        }
        self.state = CpuState::Alive;
        self.interrupt_inhibited = false;
        log::debug!(
            "cpu reset: cs={:#06x} base={:#010x} eip={:#010x}",
            self.regs.seg(SegReg::Cs).selector,
            self.regs.seg(SegReg::Cs).base,
            self.regs.eip
        );
    }

    fn operand_address_size_32(&self) -> (bool, bool) {
        let big = self.regs.seg(SegReg::Cs).default_big;
        (big, big)
    }

    /// Services a pending hardware IRQ if one exists, IF is set, and the
    /// previous instruction didn't inhibit delivery.
    fn maybe_service_irq(&mut self) -> Result<(), Fault> {
        if self.interrupt_inhibited {
            self.interrupt_inhibited = false;
            return Ok(());
        }
        if self.regs.flag(EFlags::IF) && self.pic.has_pending_irq() {
            let vector = self.pic.acknowledge();
            control_flow::deliver_interrupt(&mut self.regs, &mut self.mem, vector, None, false)?;
            self.state = CpuState::Alive;
        }
        Ok(())
    }

    /// Decodes and executes exactly one instruction, or delivers the fault
    /// it raises through the IDT. Returns the fault only if fault delivery
    /// itself failed catastrophically (double/triple fault), which marks the
    /// CPU dead.
    pub fn step(&mut self) -> Result<(), Fault> {
        if self.state == CpuState::Dead {
            return Ok(());
        }

        self.maybe_service_irq()?;

        if self.state == CpuState::Halted {
            return Ok(());
        }

        let (operand_size_32, address_size_32) = self.operand_address_size_32();
        let eip = self.regs.eip;
        let result = decode::decode_one(&self.regs, &mut self.mem, eip, operand_size_32, address_size_32)
            .and_then(|(instruction, len)| {
                self.regs.eip = eip.wrapping_add(len);
                exec::execute(self, instruction)
            });

        match result {
            Ok(()) => {
                // The instruction retired cleanly; EIP already points past
                // it, unlike a fault, which must rewind. A pending TF traps
                // here rather than through the fault path below.
                if self.regs.flag(EFlags::TF) {
                    match control_flow::deliver_interrupt(&mut self.regs, &mut self.mem, 1, None, false) {
                        Ok(()) => Ok(()),
                        Err(_) => {
                            self.state = CpuState::Dead;
                            Ok(())
                        }
                    }
                } else {
                    Ok(())
                }
            }
            Err(fault) if fault.kind == crate::error::FaultKind::HardwareInterruptDuringRep => {
                // The REP unwound itself back to its own start; let the next
                // step's IRQ poll take it from here instead of delivering
                // this as a real vector-0 exception.
                self.regs.eip = eip;
                Ok(())
            }
            Err(fault) => {
                self.regs.eip = eip;
                log::warn!("delivering vector {} (error_code={:?}) to guest at eip {:#010x}", fault.vector, fault.error_code, eip);
                match control_flow::deliver_interrupt(&mut self.regs, &mut self.mem, fault.vector, fault.error_code, false) {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        self.state = CpuState::Dead;
                        Ok(())
                    }
                }
            }
        }
    }

    pub fn halt(&mut self) {
        self.state = CpuState::Halted;
    }

    pub fn inhibit_interrupts_for_next_instruction(&mut self) {
        self.interrupt_inhibited = true;
    }

    /// Runs until the CPU halts or dies, bounded by `max_instructions` so a
    /// runaway guest can't loop forever inside a single host call.
    pub fn run(&mut self, max_instructions: u64) -> CpuState {
        for _ in 0..max_instructions {
            if self.state != CpuState::Alive {
                break;
            }
            let _ = self.step();
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_sets_documented_power_on_vector() {
        let mut cpu = Cpu::new(0x10_0000);
        cpu.reset();
        assert_eq!(cpu.regs.seg(SegReg::Cs).selector, 0xF000);
        assert_eq!(cpu.regs.eip, 0x0000_FFF0);
        assert!(!cpu.regs.flag(EFlags::IF));
    }

    #[test]
    fn hlt_then_step_stays_halted_without_pending_irq() {
        let mut cpu = Cpu::new(0x10_0000);
        cpu.reset();
        cpu.halt();
        cpu.step().unwrap();
        assert_eq!(cpu.state(), CpuState::Halted);
    }
}
