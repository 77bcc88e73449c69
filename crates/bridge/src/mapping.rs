//! IPX relay name -> Fibaro device id lookup, loaded from a static file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// File structures
// ---------------------------------------------------------------------------

/// TOML layout: a single `[devices]` table of `name = id` pairs.
#[derive(Debug, Default, Deserialize)]
struct MappingFile {
    #[serde(default)]
    devices: HashMap<String, i64>,
}

// ---------------------------------------------------------------------------
// DeviceMapping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct DeviceMapping {
    devices: HashMap<String, u32>,
}

impl DeviceMapping {
    #[cfg(test)]
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            devices: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Load the mapping from `path`. A missing or unreadable file yields an
    /// empty mapping and a warning; startup never fails on it.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(mapping) => {
                info!(
                    path = %path.display(),
                    devices = mapping.len(),
                    "mapping: loaded"
                );
                mapping
            }
            Err(e) => {
                warn!(path = %path.display(), "mapping: {e:#}, continuing with an empty mapping");
                Self::default()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read device mapping: {}", path.display()))?;
        let raw = parse(path, &contents)
            .with_context(|| format!("failed to parse device mapping: {}", path.display()))?;

        let mut devices = HashMap::with_capacity(raw.len());
        for (name, id) in raw {
            if name.trim().is_empty() {
                warn!("mapping: skipping entry with empty name");
                continue;
            }
            match u32::try_from(id) {
                Ok(id) if id > 0 => {
                    devices.insert(name, id);
                }
                _ => warn!(name = %name, id, "mapping: skipping entry with invalid device id"),
            }
        }
        Ok(Self { devices })
    }

    /// Exact, case-sensitive lookup.
    pub fn resolve(&self, name: &str) -> Option<u32> {
        self.devices.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// `.json` files hold a flat object, everything else is TOML.
fn parse(path: &Path, contents: &str) -> Result<HashMap<String, i64>> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        Ok(serde_json::from_str(contents)?)
    } else {
        let file: MappingFile = toml::from_str(contents)?;
        Ok(file.devices)
    }
}

// ---------------------------------------------------------------------------
// Reloadable store
// ---------------------------------------------------------------------------

/// Holds the current mapping. Readers get an immutable snapshot; `reload`
/// swaps in a freshly loaded one.
#[derive(Debug)]
pub struct MappingStore {
    path: PathBuf,
    current: RwLock<Arc<DeviceMapping>>,
}

impl MappingStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mapping = DeviceMapping::load(&path);
        if mapping.is_empty() {
            warn!("mapping: no named devices, only numeric ids will dispatch");
        }
        Self {
            path,
            current: RwLock::new(Arc::new(mapping)),
        }
    }

    /// Store with a fixed mapping and no backing file to reload from.
    #[cfg(test)]
    pub fn fixed(mapping: DeviceMapping) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(mapping)),
        }
    }

    pub fn snapshot(&self) -> Arc<DeviceMapping> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Re-read the backing file. Returns the number of devices now mapped.
    pub fn reload(&self) -> usize {
        let fresh = Arc::new(DeviceMapping::load(&self.path));
        let len = fresh.len();
        match self.current.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        len
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ipx-bridge-mapping-{}-{}",
            std::process::id(),
            name
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn load_json_mapping() {
        let path = write_temp(
            "map.json",
            r#"{"ipx_congelateur": 27, "ipx_garage": 31}"#,
        );
        let mapping = DeviceMapping::load(&path);
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.resolve("ipx_congelateur"), Some(27));
        assert_eq!(mapping.resolve("ipx_garage"), Some(31));
    }

    #[test]
    fn load_toml_mapping() {
        let path = write_temp(
            "map.toml",
            r#"
[devices]
ipx_congelateur = 27
ipx_portail = 44
"#,
        );
        let mapping = DeviceMapping::load(&path);
        assert_eq!(mapping.resolve("ipx_portail"), Some(44));
    }

    #[test]
    fn missing_file_yields_empty_mapping() {
        let mapping = DeviceMapping::load(Path::new("/nonexistent/device_mapping.json"));
        assert!(mapping.is_empty());
    }

    #[test]
    fn malformed_file_yields_empty_mapping() {
        let path = write_temp("broken.json", "{ not json");
        assert!(DeviceMapping::load(&path).is_empty());
    }

    #[test]
    fn invalid_ids_are_skipped() {
        let path = write_temp("ids.json", r#"{"ok": 5, "zero": 0, "neg": -3}"#);
        let mapping = DeviceMapping::load(&path);
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.resolve("ok"), Some(5));
        assert_eq!(mapping.resolve("zero"), None);
    }

    #[test]
    fn resolve_is_case_sensitive() {
        let mapping = DeviceMapping::from_pairs([("ipx_congelateur", 27)]);
        assert_eq!(mapping.resolve("IPX_CONGELATEUR"), None);
        assert_eq!(mapping.resolve("unknown"), None);
    }

    #[test]
    fn reload_picks_up_changes() {
        let path = write_temp("reload.json", r#"{"a": 1}"#);
        let store = MappingStore::open(&path);
        assert_eq!(store.snapshot().resolve("b"), None);

        std::fs::write(&path, r#"{"a": 1, "b": 2}"#).unwrap();
        assert_eq!(store.reload(), 2);
        assert_eq!(store.snapshot().resolve("b"), Some(2));
    }

    #[test]
    fn snapshot_survives_reload() {
        let path = write_temp("snap.json", r#"{"a": 1}"#);
        let store = MappingStore::open(&path);
        let before = store.snapshot();

        std::fs::remove_file(&path).unwrap();
        assert_eq!(store.reload(), 0);

        assert_eq!(before.resolve("a"), Some(1));
        assert!(store.snapshot().is_empty());
    }
}
