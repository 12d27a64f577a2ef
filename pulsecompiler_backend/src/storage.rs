//! One-file-per-object persistence of blocks, ensembles and sequences.
//!
//! Every object is a pretty-printed JSON file `<name>.<kind>.json` in the storage directory. A
//! damaged file only affects the object it holds: [`ObjectStore::load_all`] skips unreadable files
//! with a warning.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PulsedError, Result};
use crate::pulse_objects::{PulseBlock, PulseBlockEnsemble, PulseSequence};

/// An object that can be stored by [`ObjectStore`].
pub trait StoredObject: Serialize + DeserializeOwned {
    /// File name suffix, e.g. `block`.
    const KIND: &'static str;
    fn name(&self) -> &str;
}

impl StoredObject for PulseBlock {
    const KIND: &'static str = "block";
    fn name(&self) -> &str {
        &self.name
    }
}

impl StoredObject for PulseBlockEnsemble {
    const KIND: &'static str = "ensemble";
    fn name(&self) -> &str {
        &self.name
    }
}

impl StoredObject for PulseSequence {
    const KIND: &'static str = "sequence";
    fn name(&self) -> &str {
        &self.name
    }
}

pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Opens (and creates if needed) the storage directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(ObjectStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of<T: StoredObject>(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(PulsedError::config(format!(
                "'{}' can not be used as a {} file name",
                name,
                T::KIND
            )));
        }
        Ok(self.root.join(format!("{}.{}.json", name, T::KIND)))
    }

    pub fn save<T: StoredObject>(&self, object: &T) -> Result<()> {
        let path = self.path_of::<T>(object.name())?;
        let text = serde_json::to_string_pretty(object)?;
        // Write to a temporary file first so a crash never leaves a truncated object behind
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!("Saved {} {} to {}", T::KIND, object.name(), path.display());
        Ok(())
    }

    pub fn load<T: StoredObject>(&self, name: &str) -> Result<T> {
        let path = self.path_of::<T>(name)?;
        if !path.exists() {
            return Err(PulsedError::lookup(format!("stored {}s", T::KIND), name));
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Returns whether a file was removed.
    pub fn delete<T: StoredObject>(&self, name: &str) -> Result<bool> {
        let path = self.path_of::<T>(name)?;
        if path.exists() {
            fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Sorted names of all stored objects of kind `T`.
    pub fn names<T: StoredObject>(&self) -> Result<Vec<String>> {
        let suffix = format!(".{}.json", T::KIND);
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let file_name = entry?.file_name();
            if let Some(name) = file_name.to_str().and_then(|f| f.strip_suffix(&suffix)) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load_all<T: StoredObject>(&self) -> Result<IndexMap<String, T>> {
        let mut objects = IndexMap::new();
        for name in self.names::<T>()? {
            match self.load::<T>(&name) {
                Ok(object) => {
                    objects.insert(name, object);
                }
                Err(err) => tracing::warn!("Skipping {} {}: {}", T::KIND, name, err),
            }
        }
        Ok(objects)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pulse_objects::*;
    use crate::shapes::ShapeDescriptor;
    use indexmap::indexmap;

    fn block(name: &str) -> PulseBlock {
        PulseBlock::new(
            name,
            vec![PulseBlockElement::new(
                1e-6,
                1e-9,
                indexmap! {"a_ch1".to_string() => ShapeDescriptor::sin(0.1, 1e6, 0.0)},
                indexmap! {"d_ch1".to_string() => true},
                true,
            )],
        )
    }

    #[test]
    fn save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        store.save(&block("rabi")).unwrap();
        store.save(&block("laser")).unwrap();
        let mut ensemble = PulseBlockEnsemble::new("rabi", vec![("rabi".to_string(), 50)], true);
        ensemble.measurement_information = Some(MeasurementInformation {
            number_of_lasers: 50,
            ..Default::default()
        });
        store.save(&ensemble).unwrap();

        assert_eq!(store.names::<PulseBlock>().unwrap(), vec!["laser", "rabi"]);
        assert_eq!(store.names::<PulseBlockEnsemble>().unwrap(), vec!["rabi"]);
        assert_eq!(store.load::<PulseBlock>("rabi").unwrap(), block("rabi"));
        assert_eq!(store.load::<PulseBlockEnsemble>("rabi").unwrap(), ensemble);

        assert!(store.delete::<PulseBlock>("rabi").unwrap());
        assert!(!store.delete::<PulseBlock>("rabi").unwrap());
        assert!(matches!(
            store.load::<PulseBlock>("rabi"),
            Err(PulsedError::Lookup { .. })
        ));
    }

    #[test]
    fn corrupt_file_only_affects_its_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        store.save(&block("good")).unwrap();
        fs::write(dir.path().join("bad.block.json"), "{ not json").unwrap();
        let all = store.load_all::<PulseBlock>().unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["good"]);
        assert!(matches!(
            store.load::<PulseBlock>("bad"),
            Err(PulsedError::Serialization(_))
        ));
    }

    #[test]
    fn rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        assert!(store.save(&block("../escape")).is_err());
        assert!(store.save(&block("")).is_err());
    }
}
