//! Remote debugging engine speaking the gdb remote serial protocol to an
//! `lldb-server` stub: launching a debugee, symbolizing its image over the
//! wire and driving breakpoints and execution.

pub mod breakpoint;
pub mod error;
pub mod rsp;
pub mod session;
pub mod symbol;
pub mod vfile;

pub use breakpoint::Breakpoint;
pub use error::Error;
pub use session::Session;

/// Target architectures the engine knows how to plant breakpoints on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    /// Classify a stub-reported architecture name, `None` for anything the
    /// engine cannot debug.
    pub fn from_target_name(name: &str) -> Option<Self> {
        if name.contains("x86_64") {
            Some(Arch::X86_64)
        } else if name.contains("aarch64") {
            Some(Arch::Aarch64)
        } else {
            None
        }
    }

    /// Software breakpoint kind for `Z0` packets: the byte length of the trap
    /// instruction.
    pub fn breakpoint_kind(&self) -> u32 {
        match self {
            Arch::X86_64 => 1,
            Arch::Aarch64 => 4,
        }
    }
}

/// Operations every debugger backend exposes to a front end.
pub trait Debugger {
    /// Start the program under the stub and load its debug information.
    fn run(&mut self, program: &str, args: &[String]) -> Result<(), Error>;

    /// Install a breakpoint at a source location.
    fn set_breakpoint(&mut self, file: &str, line: u64) -> Result<Breakpoint, Error>;

    /// Resume the stopped debugee.
    fn continue_debugee(&mut self) -> Result<(), Error>;

    /// Tear the session down and release the stub.
    fn detach(&mut self) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_classification() {
        assert_eq!(
            Arch::from_target_name("x86_64-unknown-linux-gnu"),
            Some(Arch::X86_64)
        );
        assert_eq!(Arch::from_target_name("aarch64"), Some(Arch::Aarch64));
        assert_eq!(Arch::from_target_name("riscv64"), None);
    }

    #[test]
    fn test_breakpoint_kinds() {
        assert_eq!(Arch::X86_64.breakpoint_kind(), 1);
        assert_eq!(Arch::Aarch64.breakpoint_kind(), 4);
    }
}
