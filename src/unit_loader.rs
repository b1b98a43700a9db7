// ABOUTME: Resolves a unit's `uses` clause to a parsed or decoded unit, with caching and cycle detection

use crate::ast::{self, CompilationUnit};
use crate::bytecode;
use crate::config::{DEFAULT_UNIT_SEARCH_PATH, SOURCE_EXT, UNIT_BYTECODE_EXT};
use crate::error::LoadError;
use crate::parser;
use crate::serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

fn locate(dir: &Path, search_path: Option<&Path>, name: &str, ext: &str) -> Result<PathBuf, LoadError> {
    let filename = format!("{name}.{ext}");
    let local = dir.join(&filename);
    if local.exists() {
        return Ok(local);
    }
    if let Some(search_path) = search_path {
        let alt = search_path.join(&filename);
        if alt.exists() {
            return Ok(alt);
        }
    }
    Err(LoadError::FileNotFound(name.to_string()))
}

/// Loads units from `.pas` source, parsing each on first use.
///
/// `LoadUnit` (`load`) follows the same five steps for every unit: return
/// the cached copy if present, reject a cycle, locate and parse the file
/// and check its declared name, recursively load everything it uses, then
/// cache and return.
pub struct SourceUnitLoader {
    dir: PathBuf,
    search_path: Option<PathBuf>,
    cache: HashMap<String, Rc<ast::Unit>>,
    loading: HashSet<String>,
}

impl SourceUnitLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SourceUnitLoader {
            dir: dir.into(),
            search_path: Some(PathBuf::from(DEFAULT_UNIT_SEARCH_PATH)),
            cache: HashMap::new(),
            loading: HashSet::new(),
        }
    }

    pub fn with_search_path(mut self, path: Option<PathBuf>) -> Self {
        self.search_path = path;
        self
    }

    pub fn load(&mut self, name: &str) -> Result<Rc<ast::Unit>, LoadError> {
        let key = name.to_lowercase();
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }
        if self.loading.contains(&key) {
            return Err(LoadError::CircularDependency(name.to_string()));
        }
        self.loading.insert(key.clone());

        let path = locate(&self.dir, self.search_path.as_deref(), name, SOURCE_EXT)?;
        let src = fs::read_to_string(&path)
            .map_err(|e| LoadError::Io { name: name.to_string(), message: e.to_string() })?;
        let parsed = parser::parse(&src)
            .map_err(|e| LoadError::ParseFailed { name: name.to_string(), message: e.to_string() })?;
        let unit = match parsed {
            CompilationUnit::Unit(u) => u,
            CompilationUnit::Program(_) => {
                return Err(LoadError::ParseFailed {
                    name: name.to_string(),
                    message: "expected a unit, found a program".to_string(),
                })
            }
        };
        if !unit.name.eq_ignore_ascii_case(name) {
            self.loading.remove(&key);
            return Err(LoadError::NameMismatch { requested: name.to_string(), declared: unit.name });
        }

        for dep in unit.uses.clone() {
            self.load(&dep)?;
        }

        self.loading.remove(&key);
        let rc = Rc::new(unit);
        self.cache.insert(key, rc.clone());
        Ok(rc)
    }
}

/// Loads units from pre-compiled `.pbu` bytecode, decoding each on first use.
/// Shares the exact cache/cycle-detection shape of `SourceUnitLoader`; only
/// the locate-and-decode step differs.
pub struct BytecodeUnitLoader {
    dir: PathBuf,
    search_path: Option<PathBuf>,
    cache: HashMap<String, Rc<bytecode::Unit>>,
    loading: HashSet<String>,
}

impl BytecodeUnitLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BytecodeUnitLoader {
            dir: dir.into(),
            search_path: Some(PathBuf::from(DEFAULT_UNIT_SEARCH_PATH)),
            cache: HashMap::new(),
            loading: HashSet::new(),
        }
    }

    pub fn with_search_path(mut self, path: Option<PathBuf>) -> Self {
        self.search_path = path;
        self
    }

    pub fn load(&mut self, name: &str) -> Result<Rc<bytecode::Unit>, LoadError> {
        let key = name.to_lowercase();
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }
        if self.loading.contains(&key) {
            return Err(LoadError::CircularDependency(name.to_string()));
        }
        self.loading.insert(key.clone());

        let path = locate(&self.dir, self.search_path.as_deref(), name, UNIT_BYTECODE_EXT)?;
        let bytes = fs::read(&path)
            .map_err(|e| LoadError::Io { name: name.to_string(), message: e.to_string() })?;
        let unit = serialize::read_unit(&bytes)?;
        if !unit.name.eq_ignore_ascii_case(name) {
            self.loading.remove(&key);
            return Err(LoadError::NameMismatch { requested: name.to_string(), declared: unit.name });
        }

        for dep in unit.uses.clone() {
            self.load(&dep)?;
        }

        self.loading.remove(&key);
        let rc = Rc::new(unit);
        self.cache.insert(key, rc.clone());
        Ok(rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn tempdir(tag: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("pascal_unit_loader_test_{tag}_{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        dir
    }

    fn write_file(dir: &Path, name: &str, ext: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(format!("{name}.{ext}"))).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    #[serial]
    fn loads_and_caches_a_simple_unit() {
        let dir = tempdir("simple");
        write_file(
            &dir,
            "MathUtils",
            "pas",
            "unit MathUtils; interface function Double(x: integer): integer; implementation function Double(x: integer): integer; begin Double := x * 2; end; end.",
        );
        let mut loader = SourceUnitLoader::new(&dir).with_search_path(None);
        let first = loader.load("MathUtils").unwrap();
        let second = loader.load("mathutils").unwrap();
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    #[serial]
    fn name_mismatch_is_rejected() {
        let dir = tempdir("mismatch");
        write_file(&dir, "Wrong", "pas", "unit Other; interface implementation end.");
        let mut loader = SourceUnitLoader::new(&dir).with_search_path(None);
        let err = loader.load("Wrong").unwrap_err();
        assert!(matches!(err, LoadError::NameMismatch { .. }));
    }

    #[test]
    #[serial]
    fn missing_file_is_reported() {
        let dir = tempdir("missing");
        let mut loader = SourceUnitLoader::new(&dir).with_search_path(None);
        let err = loader.load("Nonexistent").unwrap_err();
        assert!(matches!(err, LoadError::FileNotFound(_)));
    }

    #[test]
    #[serial]
    fn circular_dependency_is_detected() {
        let dir = tempdir("cycle");
        write_file(&dir, "A", "pas", "unit A; interface uses B; implementation end.");
        write_file(&dir, "B", "pas", "unit B; interface uses A; implementation end.");
        let mut loader = SourceUnitLoader::new(&dir).with_search_path(None);
        let err = loader.load("A").unwrap_err();
        assert!(matches!(err, LoadError::CircularDependency(_)));
    }

    #[test]
    #[serial]
    fn transitive_uses_are_loaded() {
        let dir = tempdir("transitive");
        write_file(&dir, "Base", "pas", "unit Base; interface const K = 1; implementation end.");
        write_file(&dir, "Mid", "pas", "unit Mid; interface uses Base; implementation end.");
        let mut loader = SourceUnitLoader::new(&dir).with_search_path(None);
        loader.load("Mid").unwrap();
        assert!(loader.cache.contains_key("base"));
    }
}
