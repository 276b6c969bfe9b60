//! Directory listing behind the `ls` builtin.

use anyhow::{Result, bail};
use std::fs;
use std::io::Write;
use std::path::Path;

/// How `ls` walks and filters.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Keep only names containing this substring.
    pub filter: Option<String>,
    /// Descend into subdirectories.
    pub recursive: bool,
    /// Levels to print when recursive; 1 is the directory itself. `None` is unbounded.
    pub depth: Option<usize>,
}

impl ListOptions {
    fn matches(&self, name: &str) -> bool {
        self.filter.as_deref().is_none_or(|f| name.contains(f))
    }
}

/// Prints the entries of `path` to `out`, one name per line.
///
/// Directory entries come in name order, preceded by `.` and `..`. Hidden
/// entries are never descended into, and are skipped altogether by a
/// filtered recursive listing. A regular file prints its own path.
pub fn list(path: &Path, options: &ListOptions, out: &mut dyn Write) -> Result<()> {
    let Ok(meta) = fs::metadata(path) else {
        bail!("Invalid path: {}", path.display());
    };
    if meta.is_file() {
        let shown = path.to_string_lossy();
        if !options.matches(&shown) {
            bail!("Invalid path: {}", path.display());
        }
        writeln!(out, "{shown}")?;
        return Ok(());
    }
    if !meta.is_dir() {
        bail!("Invalid path: {}", path.display());
    }

    let depth = if options.recursive { options.depth } else { Some(1) };
    walk(path, depth, options, out)
}

fn walk(dir: &Path, depth: Option<usize>, options: &ListOptions, out: &mut dyn Write) -> Result<()> {
    if depth == Some(0) {
        return Ok(());
    }
    let descend = options.recursive && depth != Some(1);
    let skip_hidden = descend && options.filter.is_some();

    let mut names = vec![".".to_string(), "..".to_string()];
    let mut entries: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    names.extend(entries);

    for name in names {
        let hidden = name.starts_with('.');
        if hidden && skip_hidden {
            continue;
        }
        if options.matches(&name) {
            writeln!(out, "{name}")?;
        }
        if !descend || hidden {
            continue;
        }
        let child = dir.join(&name);
        if child.is_dir() {
            walk(&child, depth.map(|d| d - 1), options, out)?;
        }
    }
    Ok(())
}
