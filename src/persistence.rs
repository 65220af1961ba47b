use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde_json::Value;

use crate::error::AppError;
use crate::zone::RoleClass;

/// Zone key to class. Zones absent from the map keep their default.
pub type ClassificationMap = BTreeMap<String, RoleClass>;

/// Durable classification storage. `save` always replaces the whole map.
pub trait PersistenceStore: Send + Sync {
    fn load(&self) -> Result<ClassificationMap, AppError>;
    fn save(&self, map: &ClassificationMap) -> Result<(), AppError>;
}

pub struct JsonFileStore {
    path: PathBuf,
    known_zones: HashSet<String>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, known_zones: impl IntoIterator<Item = String>) -> Self {
        Self {
            path: path.into(),
            known_zones: known_zones.into_iter().collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Keeps entries naming a known zone and a valid class; drops the rest.
    fn sanitize(&self, raw: serde_json::Map<String, Value>) -> ClassificationMap {
        let mut out = ClassificationMap::new();
        for (key, value) in raw {
            let key = key.trim();
            if !self.known_zones.contains(key) {
                warn!("ignoring persisted class for unknown zone '{key}'");
                continue;
            }
            match value.as_str().map(str::parse::<RoleClass>) {
                Some(Ok(class)) => {
                    out.insert(key.to_string(), class);
                }
                _ => warn!("ignoring invalid persisted class for zone '{key}': {value}"),
            }
        }
        out
    }
}

impl PersistenceStore for JsonFileStore {
    fn load(&self) -> Result<ClassificationMap, AppError> {
        if !self.path.exists() {
            return Ok(ClassificationMap::new());
        }

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| AppError::Persistence(format!("read {}: {e}", self.path.display())))?;
        let value: Value = serde_json::from_str(&contents)
            .map_err(|e| AppError::Persistence(format!("parse {}: {e}", self.path.display())))?;

        match value {
            Value::Object(raw) => Ok(self.sanitize(raw)),
            Value::Null => Ok(ClassificationMap::new()),
            _ => Err(AppError::Persistence(format!(
                "{} does not hold a JSON object",
                self.path.display()
            ))),
        }
    }

    fn save(&self, map: &ClassificationMap) -> Result<(), AppError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| AppError::Persistence(format!("create {}: {e}", dir.display())))?;
        }

        let body = serde_json::to_string_pretty(map)
            .map_err(|e| AppError::Persistence(format!("encode classes: {e}")))?;
        let tmp = self.temp_path();
        fs::write(&tmp, body)
            .map_err(|e| AppError::Persistence(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            AppError::Persistence(format!("rename into {}: {e}", self.path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::{InputKind, OutputKind};

    fn temp_store(name: &str) -> JsonFileStore {
        let path = std::env::temp_dir().join(format!(
            "zonebridge-{}-{name}/zones.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);
        JsonFileStore::new(path, ["zone1", "zone2", "zone3"].map(String::from))
    }

    #[test]
    fn missing_file_loads_empty() {
        let store = temp_store("missing");
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn ignores_unknown_zones_and_invalid_classes() {
        let store = temp_store("sanitize");
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(
            store.path(),
            r#"{"zone1": "Door", "zone2": "garage", "zone7": "window", "zone3": 4}"#,
        )
        .unwrap();

        let map = store.load().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["zone1"], RoleClass::Input(InputKind::Door));
    }

    #[test]
    fn save_replaces_whole_map_without_leaving_temp() {
        let store = temp_store("save");
        let mut map = ClassificationMap::new();
        map.insert("zone2".into(), RoleClass::Output(OutputKind::Momentary));
        map.insert("zone1".into(), RoleClass::Input(InputKind::Window));
        store.save(&map).unwrap();

        assert_eq!(store.load().unwrap(), map);
        assert!(!store.temp_path().exists());

        let written = fs::read_to_string(store.path()).unwrap();
        assert!(written.find("zone1").unwrap() < written.find("zone2").unwrap());
        assert!(written.contains("\"output_tap\""));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let store = temp_store("corrupt");
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "[1, 2").unwrap();
        assert!(matches!(store.load(), Err(AppError::Persistence(_))));
    }
}
