//! Key/value views of zarr stores.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use super::LoadError;

/// A read-only zarr store.
pub trait Store {
    /// Returns the value at `key`, or `None` if it does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LoadError>;

    /// Lists all keys of the store.
    fn keys(&self) -> Result<Vec<String>, LoadError>;
}

/// A zarr store in a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, LoadError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(LoadError::Io {
                source: io::Error::new(io::ErrorKind::NotFound, "not a directory"),
                path: root,
            });
        }
        Ok(Self { root })
    }

    fn walk(&self, dir: &Path, prefix: &str, keys: &mut Vec<String>) -> Result<(), LoadError> {
        for entry in fs::read_dir(dir).map_err(LoadError::io(dir))? {
            let entry = entry.map_err(LoadError::io(dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = format!("{prefix}{name}");
            if entry.path().is_dir() {
                self.walk(&entry.path(), &format!("{key}/"), keys)?;
            } else {
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl Store for DirectoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LoadError> {
        let path = self.root.join(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(LoadError::io(path)(err)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, LoadError> {
        let mut keys = Vec::new();
        self.walk(&self.root, "", &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Reference {
    Inline(Vec<u8>),
    File(PathBuf),
    Range {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
}

/// A zarr store described by a kerchunk reference file.
///
/// Both the version 0 format (a flat object of references) and version 1 (with `refs` and
/// `templates`) are supported. References to byte ranges must point to local files, relative
/// paths are resolved against the directory of the reference file.
#[derive(Debug, Clone)]
pub struct ReferenceStore {
    refs: BTreeMap<String, Reference>,
}

impl ReferenceStore {
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let bytes = fs::read(path).map_err(LoadError::io(path))?;
        let base_dir = path.parent().unwrap_or(Path::new("."));
        Self::from_json(&bytes, base_dir)
    }

    pub fn from_json(bytes: &[u8], base_dir: &Path) -> Result<Self, LoadError> {
        let json: Value = serde_json::from_slice(bytes)
            .map_err(|err| LoadError::Malformed(format!("invalid reference file: {err}")))?;
        let Value::Object(mut root) = json else {
            return Err(LoadError::Malformed("reference file is not an object".into()));
        };

        let (refs, templates) = match root.get("version").and_then(Value::as_u64) {
            Some(1) => {
                let templates: BTreeMap<String, String> = match root.remove("templates") {
                    Some(Value::Object(templates)) => templates
                        .into_iter()
                        .filter_map(|(k, v)| Some((k, v.as_str()?.to_owned())))
                        .collect(),
                    _ => BTreeMap::new(),
                };
                match root.remove("refs") {
                    Some(Value::Object(refs)) => (refs, templates),
                    _ => return Err(LoadError::Malformed("reference file has no refs".into())),
                }
            }
            Some(version) => {
                return Err(LoadError::Unsupported(format!(
                    "kerchunk reference version {version}"
                )));
            }
            None => (root, BTreeMap::new()),
        };

        let refs = refs
            .into_iter()
            .map(|(key, value)| {
                let reference = parse_reference(&key, value, &templates, base_dir)?;
                Ok((key, reference))
            })
            .collect::<Result<_, LoadError>>()?;
        Ok(Self { refs })
    }
}

fn parse_reference(
    key: &str,
    value: Value,
    templates: &BTreeMap<String, String>,
    base_dir: &Path,
) -> Result<Reference, LoadError> {
    let malformed = || LoadError::Malformed(format!("invalid reference for {key:?}"));
    match value {
        Value::String(s) => match s.strip_prefix("base64:") {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Reference::Inline)
                .map_err(|_| malformed()),
            None => Ok(Reference::Inline(s.into_bytes())),
        },
        Value::Array(parts) => {
            let url = parts.first().and_then(Value::as_str).ok_or_else(malformed)?;
            let path = resolve_url(&render_template(url, templates), base_dir)?;
            match parts.as_slice() {
                [_] => Ok(Reference::File(path)),
                [_, offset, length] => Ok(Reference::Range {
                    path,
                    offset: offset.as_u64().ok_or_else(malformed)?,
                    length: length.as_u64().ok_or_else(malformed)?,
                }),
                _ => Err(malformed()),
            }
        }
        // Any other JSON is inline zarr metadata.
        other => Ok(Reference::Inline(other.to_string().into_bytes())),
    }
}

/// Replaces `{{name}}` placeholders with the matching template.
fn render_template(url: &str, templates: &BTreeMap<String, String>) -> String {
    let mut url = url.to_owned();
    for (name, value) in templates {
        url = url.replace(&format!("{{{{{name}}}}}"), value);
    }
    url
}

fn resolve_url(url: &str, base_dir: &Path) -> Result<PathBuf, LoadError> {
    let path = match url.strip_prefix("file://") {
        Some(path) => path,
        None if url.contains("://") => {
            return Err(LoadError::Unsupported(format!("remote reference {url:?}")));
        }
        None => url,
    };
    let path = Path::new(path);
    Ok(if path.is_absolute() {
        path.to_owned()
    } else {
        base_dir.join(path)
    })
}

impl Store for ReferenceStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LoadError> {
        let Some(reference) = self.refs.get(key) else {
            return Ok(None);
        };
        match reference {
            Reference::Inline(bytes) => Ok(Some(bytes.clone())),
            Reference::File(path) => fs::read(path).map(Some).map_err(LoadError::io(path)),
            Reference::Range {
                path,
                offset,
                length,
            } => {
                let read = || -> io::Result<Vec<u8>> {
                    let mut file = fs::File::open(path)?;
                    file.seek(SeekFrom::Start(*offset))?;
                    let mut buf = vec![0; *length as usize];
                    file.read_exact(&mut buf)?;
                    Ok(buf)
                };
                read().map(Some).map_err(LoadError::io(path))
            }
        }
    }

    fn keys(&self) -> Result<Vec<String>, LoadError> {
        Ok(self.refs.keys().cloned().collect())
    }
}
