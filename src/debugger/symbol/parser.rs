//! Extraction of compile units, line tables and subprograms from the DWARF
//! sections of an object file.

use super::{CompileUnit, FileInfo, Func};
use crate::debugger::error::Error;
use gimli::{
    AttributeValue, DW_AT_language, DW_AT_name, DW_LANG_Rust, DW_TAG_compile_unit,
    DW_TAG_subprogram, EntriesTreeNode, Reader, RunTimeEndian,
};
use object::{Object, ObjectSection};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

pub(super) type EndianRcSlice = gimli::EndianRcSlice<RunTimeEndian>;

pub(super) fn load_dwarf(data: &[u8]) -> Result<gimli::Dwarf<EndianRcSlice>, Error> {
    let obj = object::File::parse(data)?;
    let endian = if obj.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> Result<EndianRcSlice, gimli::Error> {
        let data = obj
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[]));
        Ok(EndianRcSlice::new(Rc::from(&*data), endian))
    };
    Ok(gimli::Dwarf::load(load_section)?)
}

pub(super) fn parse_units<R: Reader>(dwarf: &gimli::Dwarf<R>) -> Result<Vec<CompileUnit>, Error> {
    let mut units = vec![];
    let mut headers = dwarf.units();
    while let Some(header) = headers.next()? {
        let unit = dwarf.unit(header)?;
        if let Some(cu) = parse_unit(dwarf, &unit)? {
            units.push(cu);
        }
    }
    Ok(units)
}

fn parse_unit<R: Reader>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
) -> Result<Option<CompileUnit>, Error> {
    let mut tree = unit.entries_tree(None)?;
    let root = tree.root()?;
    if root.entry().tag() != DW_TAG_compile_unit {
        return Ok(None);
    }

    // runtime and support-library units written in other languages would
    // collide on file names, accept a single source language
    match root.entry().attr_value(DW_AT_language)? {
        Some(AttributeValue::Language(lang)) if lang == DW_LANG_Rust => {}
        _ => return Ok(None),
    }

    let name = match unit.name.as_ref() {
        Some(name) => name.to_string_lossy()?.into_owned(),
        None => String::default(),
    };
    let funcs = parse_functions(dwarf, unit, root)?;
    let files = parse_line_table(dwarf, unit)?;

    Ok(Some(CompileUnit::new(name, files, funcs)))
}

/// Scan the immediate subprogram children of a compile unit root, nested
/// scopes are not descended into. Subprograms without a name or without any
/// resolvable range cannot be indexed and are dropped.
fn parse_functions<R: Reader>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    root: EntriesTreeNode<R>,
) -> Result<Vec<Func>, Error> {
    let mut funcs = vec![];
    let mut children = root.children();
    while let Some(die) = children.next()? {
        let entry = die.entry();
        if entry.tag() != DW_TAG_subprogram {
            continue;
        }

        let name = match entry.attr(DW_AT_name)? {
            Some(attr) => dwarf
                .attr_string(unit, attr.value())
                .ok()
                .and_then(|s| s.to_string_lossy().ok().map(Cow::into_owned)),
            None => None,
        };
        let range = dwarf.die_ranges(unit, entry)?.next()?;

        if let (Some(name), Some(range)) = (name, range) {
            funcs.push(Func {
                name,
                low_pc: range.begin,
                high_pc: range.end,
            });
        }
    }
    Ok(funcs)
}

/// Replay the line-number program of a unit into per-file line maps. A later
/// row for the same file and line overwrites the earlier one.
fn parse_line_table<R: Reader>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
) -> Result<Vec<Rc<FileInfo>>, Error> {
    let Some(ref lp) = unit.line_program else {
        return Ok(vec![]);
    };

    let mut rows = lp.clone().rows();
    let mut table: Vec<(u64, u64, u64)> = vec![];
    while let Some((_, row)) = rows.next_row()? {
        if row.end_sequence() {
            continue;
        }
        let Some(line) = row.line() else {
            continue;
        };
        table.push((row.file_index(), line.get(), row.address()));
    }

    let header = rows.header();
    let mut paths: HashMap<u64, String> = HashMap::new();
    let mut files: HashMap<String, HashMap<u64, u64>> = HashMap::new();
    for (file_index, line, address) in table {
        let path = match paths.get(&file_index) {
            Some(path) => path.clone(),
            None => {
                let Some(file) = header.file(file_index) else {
                    continue;
                };
                let path = render_file_path(unit, file, header, dwarf)?;
                paths.insert(file_index, path.clone());
                path
            }
        };
        files.entry(path).or_default().insert(line, address);
    }

    Ok(files
        .into_iter()
        .map(|(name, lines)| Rc::new(FileInfo::new(name, lines)))
        .collect())
}

fn render_file_path<R: Reader>(
    unit: &gimli::Unit<R>,
    file: &gimli::FileEntry<R, R::Offset>,
    header: &gimli::LineProgramHeader<R, R::Offset>,
    dwarf: &gimli::Dwarf<R>,
) -> Result<String, gimli::Error> {
    let mut path = if let Some(ref comp_dir) = unit.comp_dir {
        PathBuf::from(comp_dir.to_string_lossy()?.as_ref())
    } else {
        PathBuf::new()
    };

    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            path.push(
                dwarf
                    .attr_string(unit, directory)?
                    .to_string_lossy()?
                    .as_ref(),
            );
        }
    }

    path.push(
        dwarf
            .attr_string(unit, file.path_name())?
            .to_string_lossy()?
            .as_ref(),
    );

    Ok(path.to_string_lossy().into_owned())
}
