//! In-memory symbol index of the debugee image: compile units, per-file line
//! tables and function address ranges, with file:line to address resolution.

mod parser;

use crate::debugger::error::Error;
use std::collections::HashMap;
use std::rc::Rc;

/// One source file of a compile unit with its line table.
pub struct FileInfo {
    name: String,
    lines: HashMap<u64, u64>,
}

impl FileInfo {
    pub(crate) fn new(name: String, lines: HashMap<u64, u64>) -> Self {
        Self { name, lines }
    }

    /// Normalized compile-time path of the file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the instruction generated for `line`, if the line emitted
    /// any code.
    pub fn line_to_pc(&self, line: u64) -> Option<u64> {
        self.lines.get(&line).copied()
    }
}

/// A function with a resolvable address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Func {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: u64,
}

impl Func {
    /// Function name with the `::`-qualified prefix stripped.
    pub fn base_name(&self) -> &str {
        self.name.rsplit("::").next().unwrap_or(&self.name)
    }
}

/// Debug information grouping of one translation unit.
pub struct CompileUnit {
    name: String,
    files: Vec<Rc<FileInfo>>,
    funcs: Vec<Func>,
}

impl CompileUnit {
    pub(crate) fn new(name: String, files: Vec<Rc<FileInfo>>, funcs: Vec<Func>) -> Self {
        Self { name, files, funcs }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.iter().map(Rc::as_ref)
    }

    pub fn functions(&self) -> &[Func] {
        &self.funcs
    }
}

/// All compile units of an image plus an index from every directory-boundary
/// suffix of a file path to the files sharing that suffix.
pub struct SymbolTable {
    units: Vec<CompileUnit>,
    file_index: HashMap<String, Vec<Rc<FileInfo>>>,
}

impl SymbolTable {
    /// Load the debug information of an object file image.
    pub fn load(data: &[u8]) -> Result<Self, Error> {
        let dwarf = parser::load_dwarf(data)?;
        Self::from_dwarf(&dwarf)
    }

    /// Build the table from already loaded DWARF sections.
    pub fn from_dwarf<R: gimli::Reader>(dwarf: &gimli::Dwarf<R>) -> Result<Self, Error> {
        Ok(Self::from_units(parser::parse_units(dwarf)?))
    }

    pub(crate) fn from_units(units: Vec<CompileUnit>) -> Self {
        let mut file_index: HashMap<String, Vec<Rc<FileInfo>>> = HashMap::new();
        for unit in &units {
            for file in &unit.files {
                let mut pos = file.name.len();
                while let Some(i) = file.name[..pos].rfind('/') {
                    file_index
                        .entry(file.name[i..].to_string())
                        .or_default()
                        .push(Rc::clone(file));
                    pos = i;
                }
            }
        }
        Self { units, file_index }
    }

    pub fn units(&self) -> &[CompileUnit] {
        &self.units
    }

    /// Resolve a file and line to an address. The file may be given as any
    /// directory-boundary suffix of its compile-time path; a suffix shared by
    /// files from several compile units is reported as ambiguous together
    /// with all full candidate paths, the caller decides how to
    /// disambiguate. Returns the address and the canonical path of the
    /// matched file.
    pub fn line_to_pc(&self, file: &str, line: u64) -> Result<(u64, String), Error> {
        let normalized = normalize_path(file);
        let files = self
            .file_index
            .get(&normalized)
            .ok_or_else(|| Error::FileNotFound(file.to_string()))?;

        if files.len() > 1 {
            return Err(Error::AmbiguousLocation {
                location: file.to_string(),
                candidates: files.iter().map(|f| f.name.clone()).collect(),
            });
        }

        let found = &files[0];
        match found.line_to_pc(line) {
            Some(pc) => Ok((pc, found.name.clone())),
            None => Err(Error::LocationNotFound {
                file: file.to_string(),
                line,
            }),
        }
    }
}

/// Root the path and drop empty, `.` and `..` components, the result always
/// starts with a separator.
fn normalize_path(file: &str) -> String {
    let mut parts: Vec<&str> = vec![];
    for comp in file.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, lines: &[(u64, u64)]) -> Rc<FileInfo> {
        Rc::new(FileInfo::new(
            name.to_string(),
            lines.iter().copied().collect(),
        ))
    }

    fn table() -> SymbolTable {
        let app = CompileUnit::new(
            "app".to_string(),
            vec![
                file("/src/app/main.rs", &[(33, 0x1000), (34, 0x1008)]),
                file("/src/app/util.rs", &[(4, 0x2000)]),
            ],
            vec![Func {
                name: "app::method1".to_string(),
                low_pc: 0x1000,
                high_pc: 0x1010,
            }],
        );
        let lib = CompileUnit::new(
            "lib".to_string(),
            vec![file("/src/lib2/util.rs", &[(4, 0x3000)])],
            vec![],
        );
        SymbolTable::from_units(vec![app, lib])
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("main.rs"), "/main.rs");
        assert_eq!(normalize_path("//main.rs"), "/main.rs");
        assert_eq!(normalize_path("./app/main.rs"), "/app/main.rs");
        assert_eq!(normalize_path("app/../main.rs"), "/main.rs");
        assert_eq!(normalize_path("/src/app/main.rs"), "/src/app/main.rs");
    }

    #[test]
    fn test_line_to_pc() {
        let sym = table();
        assert_eq!(
            sym.line_to_pc("main.rs", 33).unwrap(),
            (0x1000, "/src/app/main.rs".to_string())
        );
        // a doubled separator normalizes away
        assert_eq!(sym.line_to_pc("//main.rs", 34).unwrap().0, 0x1008);
        // any directory-boundary suffix matches
        assert_eq!(sym.line_to_pc("app/main.rs", 33).unwrap().0, 0x1000);
        assert_eq!(sym.line_to_pc("src/app/main.rs", 33).unwrap().0, 0x1000);
    }

    #[test]
    fn test_line_without_code() {
        let sym = table();
        match sym.line_to_pc("main.rs", 9).unwrap_err() {
            Error::LocationNotFound { file, line } => {
                assert_eq!(file, "main.rs");
                assert_eq!(line, 9);
            }
            e => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_unknown_file() {
        let sym = table();
        assert!(matches!(
            sym.line_to_pc("nope.rs", 1),
            Err(Error::FileNotFound(_))
        ));
        // a partial path component is not a directory-boundary suffix
        assert!(matches!(
            sym.line_to_pc("ain.rs", 33),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_ambiguous_suffix() {
        let sym = table();
        match sym.line_to_pc("util.rs", 4).unwrap_err() {
            Error::AmbiguousLocation {
                location,
                mut candidates,
            } => {
                assert_eq!(location, "util.rs");
                candidates.sort();
                assert_eq!(candidates, vec!["/src/app/util.rs", "/src/lib2/util.rs"]);
            }
            e => panic!("unexpected error: {e}"),
        }
        // a longer suffix disambiguates
        assert_eq!(sym.line_to_pc("app/util.rs", 4).unwrap().0, 0x2000);
        assert_eq!(sym.line_to_pc("lib2/util.rs", 4).unwrap().0, 0x3000);
    }

    #[test]
    fn test_func_base_name() {
        let f = Func {
            name: "app::server::serve".to_string(),
            low_pc: 0,
            high_pc: 1,
        };
        assert_eq!(f.base_name(), "serve");

        let f = Func {
            name: "main".to_string(),
            low_pc: 0,
            high_pc: 1,
        };
        assert_eq!(f.base_name(), "main");
    }
}
