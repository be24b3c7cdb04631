use std::collections::HashMap;

/// An installed breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Identifier unique for the session lifetime, 1-based.
    pub id: u32,
    /// Location as the caller requested it.
    pub requested_file: String,
    /// Canonical compile-time path of the matched file.
    pub file: String,
    pub line: u64,
    /// Resolved instruction address.
    pub addr: u64,
}

/// Assigns stable identifiers to installed breakpoints and keeps them
/// available for query until the session detaches.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    seq: u32,
    breakpoints: HashMap<u32, Breakpoint>,
}

impl BreakpointRegistry {
    /// Register a successfully installed breakpoint. Identifiers are
    /// assigned monotonically and only here, a failed resolve or install
    /// never consumes one.
    pub fn register(&mut self, requested_file: &str, file: &str, line: u64, addr: u64) -> Breakpoint {
        self.seq += 1;
        let bp = Breakpoint {
            id: self.seq,
            requested_file: requested_file.to_string(),
            file: file.to_string(),
            line,
            addr,
        };
        self.breakpoints.insert(bp.id, bp.clone());
        bp
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn clear(&mut self) {
        self.breakpoints.clear();
    }
}
