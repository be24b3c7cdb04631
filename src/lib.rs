//! Remote debugging engine speaking the GDB/LLDB remote serial protocol.
//!
//! The engine launches an `lldb-server` debug stub, talks to it over a unix
//! socket, fetches the debugee image through the stub's remote file protocol
//! and resolves file:line locations to addresses from the image's DWARF
//! debug information.

pub mod debugger;
