//! Program manifests.
//!
//! A manifest is a TOML description of a program:
//!
//! ```toml
//! entry = "Main:main"
//!
//! [[classes]]
//! name = "Main"
//! fields = 2
//!
//! [[classes.methods]]
//! name = "main"
//! locals = 1
//! returns = "int"
//! code = [
//!   { op = "load_int_lit", value = 42 },
//!   { op = "rtrn" },
//! ]
//! ```
//!
//! Classes and methods are numbered by position; call instructions refer to
//! them by those numbers.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use super::{Class, Method, Op, Program, ReturnType, VerifyError, Verifier};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed manifest: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("entry point '{0}' is not a method")]
    UnknownEntry(String),
    #[error("class '{0}' is defined twice")]
    DuplicateClass(String),
    #[error("class '{class}' extends unknown class '{parent}'")]
    UnknownParent { class: String, parent: String },
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    entry: String,
    #[serde(default)]
    classes: Vec<ClassEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassEntry {
    name: String,
    parent: Option<String>,
    #[serde(default)]
    fields: usize,
    #[serde(default)]
    statics: usize,
    #[serde(default)]
    methods: Vec<MethodEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MethodEntry {
    name: String,
    #[serde(default)]
    params: usize,
    #[serde(default)]
    locals: usize,
    #[serde(default)]
    returns: ReturnType,
    code: Vec<Op>,
}

/// Load and verify the manifest at `path`.
pub fn load(path: &Path) -> Result<Program, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    from_toml(&text)
}

/// Parse and verify a manifest.
pub fn from_toml(text: &str) -> Result<Program, LoadError> {
    let file: ManifestFile = toml::from_str(text)?;

    let mut ids = HashMap::new();
    for (id, class) in file.classes.iter().enumerate() {
        if ids.insert(class.name.clone(), id).is_some() {
            return Err(LoadError::DuplicateClass(class.name.clone()));
        }
    }

    let mut classes = Vec::with_capacity(file.classes.len());
    for entry in file.classes {
        let methods = entry
            .methods
            .into_iter()
            .map(|m| Method::new(m.name, m.params, m.locals, m.code).returns(m.returns))
            .collect();
        let mut class = Class::new(entry.name, entry.fields, entry.statics, methods);
        if let Some(parent) = entry.parent {
            let Some(&id) = ids.get(&parent) else {
                return Err(LoadError::UnknownParent {
                    class: class.name,
                    parent,
                });
            };
            class = class.extends(id);
        }
        classes.push(class);
    }

    let entry = resolve_entry(&classes, &file.entry)?;
    let program = Program::new(classes, entry);
    Verifier::new().verify_program(&program)?;
    Ok(program)
}

fn resolve_entry(classes: &[Class], entry: &str) -> Result<(usize, usize), LoadError> {
    let unknown = || LoadError::UnknownEntry(entry.to_string());
    let (class_name, method_name) = entry.split_once(':').ok_or_else(unknown)?;
    let cls = classes
        .iter()
        .position(|c| c.name == class_name)
        .ok_or_else(unknown)?;
    let mthd = classes[cls]
        .methods
        .iter()
        .position(|m| m.name == method_name)
        .ok_or_else(unknown)?;
    Ok((cls, mthd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::MemoryContext;

    const TWO_CLASSES: &str = r#"
entry = "Main:main"

[[classes]]
name = "Base"
fields = 1

[[classes]]
name = "Main"
parent = "Base"
fields = 2
statics = 1

[[classes.methods]]
name = "helper"
params = 1
locals = 1
returns = "int"
code = [
  { op = "stor_int_var", id = 0, ctx = "local" },
  { op = "load_int_var", id = 0, ctx = "local" },
  { op = "rtrn" },
]

[[classes.methods]]
name = "main"
returns = "int"
code = [
  { op = "load_int_lit", value = 5 },
  { op = "load_inst_mem" },
  { op = "mthd_call", cls = 1, mthd = 0 },
  { op = "rtrn" },
]
"#;

    #[test]
    fn test_load_program() {
        let program = from_toml(TWO_CLASSES).unwrap();
        assert_eq!(program.entry, (1, 1));
        assert_eq!(program.classes[1].parent, Some(0));
        let helper = program.find_method("Main:helper").unwrap();
        assert_eq!(helper.rtrn, ReturnType::Int);
        assert_eq!(
            helper.code[0],
            Op::StorIntVar { id: 0, ctx: MemoryContext::Local }
        );
    }

    #[test]
    fn test_unknown_entry() {
        let text = TWO_CLASSES.replace("Main:main", "Main:missing");
        assert!(matches!(from_toml(&text), Err(LoadError::UnknownEntry(e)) if e == "Main:missing"));
    }

    #[test]
    fn test_unknown_parent() {
        let text = TWO_CLASSES.replace("parent = \"Base\"", "parent = \"Nope\"");
        assert!(matches!(from_toml(&text), Err(LoadError::UnknownParent { .. })));
    }

    #[test]
    fn test_verifier_runs() {
        let text = TWO_CLASSES.replace("mthd = 0", "mthd = 7");
        assert!(matches!(
            from_toml(&text),
            Err(LoadError::Verify(VerifyError::UnknownMethod { mthd: 7, .. }))
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let text = TWO_CLASSES.replace("\"rtrn\"", "\"halt\"");
        assert!(matches!(from_toml(&text), Err(LoadError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.toml");
        std::fs::write(&path, TWO_CLASSES).unwrap();
        assert!(load(&path).is_ok());
        assert!(matches!(
            load(&dir.path().join("missing.toml")),
            Err(LoadError::Io { .. })
        ));
    }
}
