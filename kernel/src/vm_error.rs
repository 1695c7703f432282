use crate::swapping::SwapSlot;
use crate::threading::process::Pid;
use core::error::Error;
use core::fmt::{self, Debug, Display, Formatter};
use std::io;

/// How far a [`VmError`] is allowed to travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Terminates the faulting process.
    ProcessFatal,
    /// A broken kernel invariant; the machine is aborted.
    KernelFatal,
    /// Handled by blocking until the resource frees up.
    Recoverable,
    /// Handled by falling back to another way of populating the page.
    Guarded,
}

/// Error type for the virtual-memory subsystem
pub enum VmError {
    /// A page table lookup past the end of the address space
    OutOfRange { vpn: usize, num_pages: usize },
    /// A user access to an address outside the process's address space
    SegmentationFault { vaddr: usize },
    /// A user write to a read-only page
    ReadOnlyViolation { vaddr: usize },
    /// Every frame is pinned, so nothing can be evicted
    NoVictimAvailable,
    /// Every swap slot is in use
    SwapExhausted,
    /// A swap slot is recorded as belonging to another process
    SlotOwnerMismatch {
        slot: SwapSlot,
        expected: Pid,
        found: Option<Pid>,
    },
    /// The inverted frame table disagrees with a page table
    FrameTableCorrupt { frame: usize },
    /// The swap free list disagrees with the swap maps
    SwapTableCorrupt { slot: SwapSlot },
    /// The process has no address space (never spawned, or already exited)
    NoSuchProcess { pid: Pid },
    /// The address space does not fit the translation entry format
    AddressSpaceTooLarge { num_pages: usize },
    /// An executable laid out for a different page size than the machine's
    PageSizeMismatch { image: usize, machine: usize },
    /// The backing store failed
    SwapIo(io::Error),
}

impl VmError {
    pub fn severity(&self) -> Severity {
        match self {
            VmError::OutOfRange { .. }
            | VmError::SegmentationFault { .. }
            | VmError::ReadOnlyViolation { .. }
            | VmError::NoSuchProcess { .. }
            | VmError::AddressSpaceTooLarge { .. }
            | VmError::PageSizeMismatch { .. } => Severity::ProcessFatal,
            VmError::NoVictimAvailable
            | VmError::FrameTableCorrupt { .. }
            | VmError::SwapTableCorrupt { .. }
            | VmError::SwapIo(_) => Severity::KernelFatal,
            VmError::SwapExhausted => Severity::Recoverable,
            VmError::SlotOwnerMismatch { .. } => Severity::Guarded,
        }
    }
}

impl Debug for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfRange { vpn, num_pages } => {
                write!(f, "OutOfRange(vpn {vpn} of {num_pages})")
            }
            VmError::SegmentationFault { vaddr } => write!(f, "SegmentationFault({vaddr:#x})"),
            VmError::ReadOnlyViolation { vaddr } => write!(f, "ReadOnlyViolation({vaddr:#x})"),
            VmError::NoVictimAvailable => write!(f, "NoVictimAvailable"),
            VmError::SwapExhausted => write!(f, "SwapExhausted"),
            VmError::SlotOwnerMismatch {
                slot,
                expected,
                found,
            } => write!(
                f,
                "SlotOwnerMismatch(slot {slot}, expected {expected}, found {found:?})"
            ),
            VmError::FrameTableCorrupt { frame } => write!(f, "FrameTableCorrupt(frame {frame})"),
            VmError::SwapTableCorrupt { slot } => write!(f, "SwapTableCorrupt(slot {slot})"),
            VmError::NoSuchProcess { pid } => write!(f, "NoSuchProcess({pid})"),
            VmError::AddressSpaceTooLarge { num_pages } => {
                write!(f, "AddressSpaceTooLarge({num_pages} pages)")
            }
            VmError::PageSizeMismatch { image, machine } => {
                write!(f, "PageSizeMismatch(image {image}, machine {machine})")
            }
            VmError::SwapIo(err) => write!(f, "SwapIo({err:?})"),
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfRange { vpn, num_pages } => {
                write!(f, "virtual page {vpn} is outside a {num_pages}-page address space")
            }
            VmError::SegmentationFault { vaddr } => {
                write!(f, "segmentation fault at {vaddr:#x}")
            }
            VmError::ReadOnlyViolation { vaddr } => {
                write!(f, "write to read-only page at {vaddr:#x}")
            }
            VmError::NoVictimAvailable => write!(f, "every frame is pinned, nothing to evict"),
            VmError::SwapExhausted => write!(f, "no free swap slots"),
            VmError::SlotOwnerMismatch {
                slot,
                expected,
                found,
            } => match found {
                Some(owner) => write!(
                    f,
                    "swap slot {slot} belongs to process {owner}, not process {expected}"
                ),
                None => write!(f, "swap slot {slot} has no owner, expected process {expected}"),
            },
            VmError::FrameTableCorrupt { frame } => {
                write!(f, "inverted table entry for frame {frame} disagrees with its page table")
            }
            VmError::SwapTableCorrupt { slot } => {
                write!(f, "swap slot {slot} is both free and in use, or neither")
            }
            VmError::NoSuchProcess { pid } => write!(f, "process {pid} has no address space"),
            VmError::AddressSpaceTooLarge { num_pages } => {
                write!(f, "an address space of {num_pages} pages is too large")
            }
            VmError::PageSizeMismatch { image, machine } => write!(
                f,
                "executable uses {image}-byte pages but the machine uses {machine}-byte pages"
            ),
            VmError::SwapIo(err) => write!(f, "swap I/O failed: {err}"),
        }
    }
}

impl Error for VmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            VmError::SwapIo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for VmError {
    fn from(err: io::Error) -> Self {
        VmError::SwapIo(err)
    }
}
