//! Error types: the tagged architectural [`Fault`] that unwinds to the
//! instruction boundary and is delivered through the IDT, and the
//! host/implementation ['thiserror']-derived `Error` used at the crate's
//! outer edges (configuration, CLI, I/O).
use thiserror::Error;

/// An architectural exception, carrying everything the IDT dispatch and the
/// guest-visible error code need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub vector: u8,
    pub error_code: Option<u32>,
    /// Set only for page faults; becomes CR2.
    pub linear_address: Option<u32>,
    pub kind: FaultKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    DivideError,
    Debug,
    Nmi,
    Breakpoint,
    Overflow,
    BoundRangeExceeded,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss,
    SegmentNotPresent,
    StackFault,
    GeneralProtectionFault,
    PageFault,
    /// A REP-prefixed string instruction must be unwound to its start so a
    /// pending IRQ can preempt cleanly once IF allows it again.
    HardwareInterruptDuringRep,
}

impl Fault {
    pub fn new(vector: u8, kind: FaultKind) -> Self {
        Fault {
            vector,
            error_code: None,
            linear_address: None,
            kind,
        }
    }

    pub fn with_error_code(mut self, code: u32) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn with_linear_address(mut self, addr: u32) -> Self {
        self.linear_address = Some(addr);
        self
    }

    pub fn divide_error() -> Self {
        Fault::new(0, FaultKind::DivideError)
    }

    pub fn breakpoint() -> Self {
        Fault::new(3, FaultKind::Breakpoint)
    }

    pub fn overflow() -> Self {
        Fault::new(4, FaultKind::Overflow)
    }

    pub fn invalid_opcode() -> Self {
        Fault::new(6, FaultKind::InvalidOpcode)
    }

    pub fn device_not_available() -> Self {
        Fault::new(7, FaultKind::DeviceNotAvailable)
    }

    pub fn general_protection(error_code: u32) -> Self {
        Fault::new(13, FaultKind::GeneralProtectionFault).with_error_code(error_code)
    }

    pub fn not_present(error_code: u32) -> Self {
        Fault::new(11, FaultKind::SegmentNotPresent).with_error_code(error_code)
    }

    pub fn stack_fault(error_code: u32) -> Self {
        Fault::new(12, FaultKind::StackFault).with_error_code(error_code)
    }

    pub fn invalid_tss(error_code: u32) -> Self {
        Fault::new(10, FaultKind::InvalidTss).with_error_code(error_code)
    }

    pub fn page_fault(linear_address: u32, error_code: u32) -> Self {
        Fault::new(14, FaultKind::PageFault)
            .with_error_code(error_code)
            .with_linear_address(linear_address)
    }

    pub fn hardware_interrupt_during_rep() -> Self {
        Fault::new(0, FaultKind::HardwareInterruptDuringRep)
    }
}

/// Host/implementation errors. Fatal: logged and the process exits non-zero.
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration text was malformed.
    #[error("configuration error: {0}")]
    Config(String),
    /// The backing physical memory could not be allocated.
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },
    /// A host-supplied address does not correspond to a valid physical range.
    #[error("invalid guest address: {0:#010x}")]
    InvalidGuestAddress(u32),
    /// Wraps [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
