//! Kernel-wide error codes.
//!
//! Every kernel operation reports one of these; the system-call dispatcher
//! forwards the raw value to user space in the status register.

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    None = 0,
    Io = 1,
    FileNotFound = 2,
    FileOut = 3,
    InvalidPtr = 4,
    IsNotElf = 5,
    Is64Bits = 6,
    IsNotExecutable = 7,
    WrongInstructionSet = 8,
    HasNoChild = 9,
    InvalidPid = 10,
    Permission = 11,
    InvalidSignal = 12,
    NoDevice = 13,
    Unknown = 14,
}

pub type KResult<T> = Result<T, Errno>;

impl Errno {
    pub fn str_error(self) -> &'static str {
        match self {
            Errno::None => "no error",
            Errno::Io => "input/output error",
            Errno::FileNotFound => "file not found",
            Errno::FileOut => "out of file bounds",
            Errno::InvalidPtr => "invalid pointer",
            Errno::IsNotElf => "not an ELF image",
            Errno::Is64Bits => "64-bit image",
            Errno::IsNotExecutable => "not an executable image",
            Errno::WrongInstructionSet => "wrong instruction set",
            Errno::HasNoChild => "process has no child",
            Errno::InvalidPid => "invalid pid",
            Errno::Permission => "permission denied",
            Errno::InvalidSignal => "invalid signal",
            Errno::NoDevice => "not a device",
            Errno::Unknown => "unknown error",
        }
    }

    /// Collapses a `KResult` into the `(value, status)` pair the syscall ABI
    /// hands back to user space.
    pub fn of<T: Into<u32>>(res: KResult<T>) -> (u32, Errno) {
        match res {
            Ok(v) => (v.into(), Errno::None),
            Err(e) => (0, e),
        }
    }
}
