//! Debug session lifetime: spawning an `lldb-server` stub on a private unix
//! socket, running the debugee, symbolizing its image over `vFile` and
//! driving breakpoints and execution until detach.

use crate::debugger::breakpoint::{Breakpoint, BreakpointRegistry};
use crate::debugger::error::Error;
use crate::debugger::rsp::Connection;
use crate::debugger::symbol::SymbolTable;
use crate::debugger::vfile::RemoteFile;
use crate::debugger::{Arch, Debugger};
use crate::weak_error;
use nix::sys::prctl;
use nix::sys::signal::Signal;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

const STUB_EXECUTABLE: &str = "lldb-server";
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_DELAY_STEP: Duration = Duration::from_millis(100);
const DIAL_DELAY_MAX: Duration = Duration::from_millis(5000);

struct StubProcess {
    process: Child,
    tmp_dir: PathBuf,
    closer: UnixStream,
}

/// A debug session over one stub connection. Until [`Session::run`] succeeds
/// the session has no symbols and no target architecture, and every command
/// that needs them is rejected.
pub struct Session<T: Read + Write = UnixStream> {
    conn: Connection<T>,
    stub: Option<StubProcess>,
    symbols: Option<SymbolTable>,
    arch: Option<Arch>,
    breakpoints: BreakpointRegistry,
}

impl Session<UnixStream> {
    /// Spawn a stub listening on a fresh unix socket and connect to it. The
    /// stub is tied to this process lifetime with a parent-death signal.
    pub fn launch() -> Result<Self, Error> {
        let path = which::which(STUB_EXECUTABLE)?;
        let tmp_dir = std::env::temp_dir().join(format!("rspdbg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&tmp_dir)?;
        let socket = tmp_dir.join("dbg.socket");

        let mut cmd = Command::new(path);
        cmd.arg("gdbserver")
            .arg(format!("unix://{}", socket.display()));
        unsafe {
            cmd.pre_exec(|| {
                prctl::set_pdeathsig(Signal::SIGTERM)
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
        }
        let mut process = match cmd.spawn() {
            Ok(process) => process,
            Err(e) => {
                weak_error!(std::fs::remove_dir_all(&tmp_dir), "temp dir cleanup:");
                return Err(e.into());
            }
        };

        match Self::connect(&socket) {
            Ok((conn, closer)) => Ok(Self {
                conn,
                stub: Some(StubProcess {
                    process,
                    tmp_dir,
                    closer,
                }),
                symbols: None,
                arch: None,
                breakpoints: BreakpointRegistry::default(),
            }),
            Err(e) => {
                weak_error!(process.kill(), "stub shutdown:");
                weak_error!(process.wait(), "stub shutdown:");
                weak_error!(std::fs::remove_dir_all(&tmp_dir), "temp dir cleanup:");
                Err(e)
            }
        }
    }

    fn connect(socket: &Path) -> Result<(Connection<UnixStream>, UnixStream), Error> {
        let stream = Self::try_connect(socket)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let closer = stream.try_clone()?;

        let mut conn = Connection::new(stream);
        if let Err(e) = conn.handshake() {
            weak_error!(closer.shutdown(Shutdown::Both), "socket shutdown:");
            return Err(e);
        }
        Ok((conn, closer))
    }

    /// Dial the socket with a growing delay, the stub needs a moment to
    /// create it.
    fn try_connect(socket: &Path) -> Result<UnixStream, Error> {
        let mut delay = DIAL_DELAY_STEP;
        loop {
            match UnixStream::connect(socket) {
                Ok(stream) => return Ok(stream),
                Err(e) if delay >= DIAL_DELAY_MAX => return Err(e.into()),
                Err(_) => {
                    std::thread::sleep(delay);
                    delay += DIAL_DELAY_STEP;
                }
            }
        }
    }
}

impl<T: Read + Write> Session<T> {
    /// Drive an already established and handshaken stub connection.
    pub fn with_connection(conn: Connection<T>) -> Self {
        Self {
            conn,
            stub: None,
            symbols: None,
            arch: None,
            breakpoints: BreakpointRegistry::default(),
        }
    }

    /// Start the program under the stub, then classify the target
    /// architecture, locate the debugee image by pid and load its debug
    /// information over the wire. Symbols and architecture are adopted only
    /// when every stage succeeds, a failed run leaves the session in the
    /// not-started state.
    pub fn run(&mut self, program: &str, args: &[String]) -> Result<(), Error> {
        self.conn.run(program, args)?;

        let target = self.conn.read_target_features()?;
        let arch = Arch::from_target_name(&target.arch)
            .ok_or(Error::UnsupportedArchitecture(target.arch))?;

        let info = self.conn.get_process_info()?;
        let info = self.conn.get_process_info_pid(info.pid)?;

        let image = self.fetch_image(&info.name)?;
        let symbols = SymbolTable::load(&image)?;

        self.arch = Some(arch);
        self.symbols = Some(symbols);
        Ok(())
    }

    fn fetch_image(&mut self, filename: &str) -> Result<Vec<u8>, Error> {
        let mut file = RemoteFile::open(&mut self.conn, filename)?;
        match file.read_to_end() {
            Ok(image) => {
                weak_error!(file.close(), "remote file close:");
                Ok(image)
            }
            Err(e) => {
                weak_error!(file.close(), "remote file close:");
                Err(e)
            }
        }
    }

    /// Resolve a source location and install a software breakpoint there. An
    /// identifier is assigned only to breakpoints the stub accepted.
    pub fn set_breakpoint(&mut self, file: &str, line: u64) -> Result<Breakpoint, Error> {
        let Some(arch) = self.arch else {
            return Err(Error::ProcessNotStarted);
        };
        let symbols = self.symbols.as_ref().ok_or(Error::ProcessNotStarted)?;

        let (addr, resolved) = symbols.line_to_pc(file, line)?;
        self.conn.insert_breakpoint(addr, arch.breakpoint_kind())?;
        Ok(self.breakpoints.register(file, &resolved, line, addr))
    }

    /// Resume the stopped debugee.
    pub fn continue_debugee(&mut self) -> Result<(), Error> {
        if self.symbols.is_none() {
            return Err(Error::ProcessNotStarted);
        }
        self.conn.exec("c")?;
        Ok(())
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    /// Tear the session down: close the connection and reap the stub with its
    /// socket directory. Safe to call more than once.
    pub fn detach(&mut self) -> Result<(), Error> {
        self.breakpoints.clear();
        self.symbols = None;
        self.arch = None;

        let Some(mut stub) = self.stub.take() else {
            return Ok(());
        };
        let shut = stub.closer.shutdown(Shutdown::Both);
        weak_error!(stub.process.kill(), "stub shutdown:");
        weak_error!(stub.process.wait(), "stub shutdown:");
        weak_error!(std::fs::remove_dir_all(&stub.tmp_dir), "temp dir cleanup:");
        shut?;
        Ok(())
    }
}

impl<T: Read + Write> Debugger for Session<T> {
    fn run(&mut self, program: &str, args: &[String]) -> Result<(), Error> {
        Session::run(self, program, args)
    }

    fn set_breakpoint(&mut self, file: &str, line: u64) -> Result<Breakpoint, Error> {
        Session::set_breakpoint(self, file, line)
    }

    fn continue_debugee(&mut self) -> Result<(), Error> {
        Session::continue_debugee(self)
    }

    fn detach(&mut self) -> Result<(), Error> {
        Session::detach(self)
    }
}

impl<T: Read + Write> Drop for Session<T> {
    fn drop(&mut self) {
        weak_error!(self.detach(), "detach:");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::rsp::testing::{frame, MockStream};
    use crate::debugger::symbol::{CompileUnit, FileInfo};
    use std::rc::Rc;

    fn session() -> (Session<MockStream>, MockStream) {
        let stream = MockStream::new();
        let mut conn = Connection::new(stream.clone());
        conn.set_ack_mode(false);
        (Session::with_connection(conn), stream)
    }

    fn started() -> (Session<MockStream>, MockStream) {
        let (mut session, stream) = session();
        let unit = CompileUnit::new(
            "app".to_string(),
            vec![Rc::new(FileInfo::new(
                "/src/app/main.rs".to_string(),
                [(33u64, 0x1000u64), (34, 0x1008)].into_iter().collect(),
            ))],
            vec![],
        );
        session.symbols = Some(SymbolTable::from_units(vec![unit]));
        session.arch = Some(Arch::X86_64);
        (session, stream)
    }

    #[test]
    fn test_commands_rejected_before_run() {
        let (mut session, _stream) = session();
        assert!(matches!(
            session.set_breakpoint("main.rs", 33),
            Err(Error::ProcessNotStarted)
        ));
        assert!(matches!(
            session.continue_debugee(),
            Err(Error::ProcessNotStarted)
        ));
    }

    #[test]
    fn test_set_breakpoint() {
        let (mut session, stream) = started();
        stream.append(frame("OK"));
        let bp = session.set_breakpoint("main.rs", 33).unwrap();
        assert_eq!(bp.id, 1);
        assert_eq!(bp.addr, 0x1000);
        assert_eq!(bp.requested_file, "main.rs");
        assert_eq!(bp.file, "/src/app/main.rs");
        assert_eq!(stream.written(), frame("Z0,1000,1").as_bytes());
    }

    #[test]
    fn test_failed_resolution_consumes_no_id() {
        let (mut session, stream) = started();
        assert!(matches!(
            session.set_breakpoint("nope.rs", 1),
            Err(Error::FileNotFound(_))
        ));
        assert!(matches!(
            session.set_breakpoint("main.rs", 9),
            Err(Error::LocationNotFound { .. })
        ));
        // nothing reached the wire
        assert!(stream.written().is_empty());

        stream.append(frame("OK"));
        let bp = session.set_breakpoint("main.rs", 33).unwrap();
        assert_eq!(bp.id, 1);
    }

    #[test]
    fn test_rejected_install_is_not_registered() {
        let (mut session, stream) = started();
        stream.append(frame("E01"));
        assert!(matches!(
            session.set_breakpoint("main.rs", 33),
            Err(Error::Protocol { .. })
        ));
        assert_eq!(session.breakpoints().count(), 0);

        stream.append(frame("OK"));
        let bp = session.set_breakpoint("main.rs", 34).unwrap();
        assert_eq!(bp.id, 1);
    }

    #[test]
    fn test_continue() {
        let (mut session, stream) = started();
        stream.append(frame("OK"));
        session.continue_debugee().unwrap();
        assert_eq!(stream.written(), frame("c").as_bytes());
    }

    #[test]
    fn test_run_rejects_unknown_architecture() {
        let (mut session, stream) = session();
        stream.append(frame("T05"));
        stream.append(frame(
            "l<target><architecture>riscv64</architecture></target>",
        ));
        match session.run("/bin/app", &[]).unwrap_err() {
            Error::UnsupportedArchitecture(arch) => assert_eq!(arch, "riscv64"),
            e => panic!("unexpected error: {e}"),
        }
        // the session did not adopt any state from the failed run
        assert!(matches!(
            session.continue_debugee(),
            Err(Error::ProcessNotStarted)
        ));
    }

    #[test]
    fn test_detach_is_idempotent() {
        let (mut session, stream) = started();
        stream.append(frame("OK"));
        session.set_breakpoint("main.rs", 33).unwrap();

        session.detach().unwrap();
        assert_eq!(session.breakpoints().count(), 0);
        session.detach().unwrap();
        assert!(matches!(
            session.set_breakpoint("main.rs", 33),
            Err(Error::ProcessNotStarted)
        ));
    }
}
