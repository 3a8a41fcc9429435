// Store handles: one logical slot = primary file + temp file

use eyre::{Context, Result, eyre};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of the primary data file
pub const PRIMARY_EXTENSION: &str = "obj";

/// Suffix appended to the primary file name to form the temp file name
pub const TEMP_SUFFIX: &str = ".temp";

/// Identifies one logical object store inside a directory.
///
/// For a store named `N` the primary file is `N.obj` and the temp file is
/// `N.obj.temp`. Primary files always end in `.obj` and temp files in
/// `.temp`, so no store's temp file can be mistaken for another's primary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreHandle {
    name: String,
    primary: PathBuf,
    temp: PathBuf,
}

impl StoreHandle {
    /// Derive the file pair for `name` inside `dir`
    pub fn new(name: &str, dir: impl AsRef<Path>) -> Result<Self> {
        validate_name(name)?;

        let dir = dir.as_ref();
        let primary_name = format!("{}.{}", name, PRIMARY_EXTENSION);
        let temp_name = format!("{}{}", primary_name, TEMP_SUFFIX);

        Ok(Self {
            name: name.to_string(),
            primary: dir.join(primary_name),
            temp: dir.join(temp_name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the committed data file
    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    /// Path of the in-flight temp file
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn dir(&self) -> Option<&Path> {
        self.primary.parent()
    }
}

impl fmt::Display for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Names of all stores with a committed primary file in `dir`, sorted
pub fn list_store_names(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).context(format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some(PRIMARY_EXTENSION) {
            continue;
        }
        match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) if validate_name(stem).is_ok() => names.push(stem.to_string()),
            _ => continue,
        }
    }

    names.sort();
    Ok(names)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(eyre!("Store name cannot be empty"));
    }
    if name.len() > 128 {
        return Err(eyre!("Store name too long: {} chars (max 128)", name.len()));
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(eyre!("Invalid store name: {} (must be alphanumeric with _/-)", name));
    }
    Ok(())
}
