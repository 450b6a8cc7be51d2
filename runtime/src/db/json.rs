//! JSON file database.
//!
//! Everything lives in one file that is rewritten atomically (write to a tmp
//! file, then rename) on every change. Read-modify-write cycles hold an
//! exclusive `flock` on a sibling `.lock` file, so several processes can share
//! one database; the in-process mutex orders threads of the same handle.

use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thinimage_core::error::{Result, ThinError};
use thinimage_core::{Image, ImageManifest, ImageRef, LayerSet, Wish};

use super::{ConversionDb, ConversionRecord, Credential, WishInfo};

#[derive(Debug, Default, Serialize, Deserialize)]
struct DbFile {
    #[serde(default)]
    next_image_id: u64,
    #[serde(default)]
    next_wish_id: u64,
    #[serde(default)]
    images: Vec<Image>,
    #[serde(default)]
    wishes: Vec<Wish>,
    #[serde(default)]
    conversions: Vec<ConversionRecord>,
    #[serde(default)]
    credentials: Vec<Credential>,
}

impl DbFile {
    fn image(&self, id: u64) -> Result<&Image> {
        self.images
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| ThinError::NotFound(format!("image {}", id)))
    }
}

#[derive(Debug)]
pub struct JsonDatabase {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonDatabase {
    /// Open (or create) the database file.
    ///
    /// An existing file that does not parse is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let db = Self {
            path: path.into(),
            lock: Mutex::new(()),
        };
        if let Some(parent) = db.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ThinError::Database(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        db.load()?;
        tracing::debug!(path = %db.path.display(), "Database opened");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<DbFile> {
        if !self.path.exists() {
            return Ok(DbFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            ThinError::Database(format!(
                "failed to read database {}: {}",
                self.path.display(),
                e
            ))
        })?;
        if data.trim().is_empty() {
            return Ok(DbFile::default());
        }
        serde_json::from_str(&data)
            .map_err(|e| ThinError::Database(format!("failed to parse database: {}", e)))
    }

    fn save(&self, file: &DbFile) -> Result<()> {
        let json = serde_json::to_string_pretty(file)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| {
            ThinError::Database(format!(
                "failed to write tmp file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            ThinError::Database(format!(
                "failed to rename {} -> {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    /// Advisory lock released when the returned guard drops.
    fn file_lock(&self, arg: FlockArg) -> Result<Flock<std::fs::File>> {
        let lock_path = self.lock_path();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                ThinError::Database(format!(
                    "failed to open lock file {}: {}",
                    lock_path.display(),
                    e
                ))
            })?;
        Flock::lock(file, arg).map_err(|(_, errno)| {
            ThinError::Database(format!(
                "failed to lock {}: {}",
                lock_path.display(),
                errno
            ))
        })
    }

    fn read<T>(&self, f: impl FnOnce(&DbFile) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        let _flock = self.file_lock(FlockArg::LockShared)?;
        f(&self.load()?)
    }

    /// Apply `f` and persist the result if it succeeds.
    fn update<T>(&self, f: impl FnOnce(&mut DbFile) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        let _flock = self.file_lock(FlockArg::LockExclusive)?;
        let mut file = self.load()?;
        let out = f(&mut file)?;
        self.save(&file)?;
        Ok(out)
    }
}

impl ConversionDb for JsonDatabase {
    fn add_image(&self, user: Option<&str>, reference: &ImageRef, is_thin: bool) -> Result<Image> {
        self.update(|db| {
            if let Some(existing) = db.images.iter().find(|i| &i.reference == reference) {
                return Ok(existing.clone());
            }
            db.next_image_id += 1;
            let image = Image {
                id: db.next_image_id,
                user: user.map(str::to_string),
                reference: reference.clone(),
                is_thin,
            };
            db.images.push(image.clone());
            Ok(image)
        })
    }

    fn get_image(&self, reference: &ImageRef) -> Result<Option<Image>> {
        self.read(|db| Ok(db.images.iter().find(|i| &i.reference == reference).cloned()))
    }

    fn get_image_by_id(&self, id: u64) -> Result<Image> {
        self.read(|db| db.image(id).cloned())
    }

    fn list_images(&self) -> Result<Vec<Image>> {
        self.read(|db| Ok(db.images.clone()))
    }

    fn add_wish(&self, input_image: u64, output_image: u64, repo: &str) -> Result<Wish> {
        self.update(|db| {
            let input = db.image(input_image)?.reference.whole_name();
            let output = db.image(output_image)?.reference.whole_name();
            let wish = Wish {
                id: db.next_wish_id + 1,
                input_image,
                output_image,
                repo: repo.to_string(),
            };
            if db.wishes.iter().any(|w| w.same_target(&wish)) {
                return Err(ThinError::WishAlreadyExists {
                    input,
                    output,
                    repo: repo.to_string(),
                });
            }
            db.next_wish_id = wish.id;
            db.wishes.push(wish.clone());
            Ok(wish)
        })
    }

    fn get_wish(&self, input_image: u64, output_image: u64, repo: &str) -> Result<Option<Wish>> {
        self.read(|db| {
            Ok(db
                .wishes
                .iter()
                .find(|w| w.input_image == input_image && w.output_image == output_image && w.repo == repo)
                .cloned())
        })
    }

    fn get_wish_by_id(&self, id: u64) -> Result<Wish> {
        self.read(|db| {
            db.wishes
                .iter()
                .find(|w| w.id == id)
                .cloned()
                .ok_or_else(|| ThinError::NotFound(format!("wish {}", id)))
        })
    }

    fn list_wishes(&self) -> Result<Vec<WishInfo>> {
        self.read(|db| {
            db.wishes
                .iter()
                .map(|w| {
                    Ok(WishInfo {
                        id: w.id,
                        input_id: w.input_image,
                        input_name: db.image(w.input_image)?.reference.whole_name(),
                        output_id: w.output_image,
                        output_name: db.image(w.output_image)?.reference.whole_name(),
                        repo: w.repo.clone(),
                        converted: db.conversions.iter().any(|c| c.wish == w.id),
                    })
                })
                .collect()
        })
    }

    fn delete_wish(&self, id: u64) -> Result<usize> {
        self.update(|db| {
            let before = db.wishes.len();
            db.wishes.retain(|w| w.id != id);
            let removed = before - db.wishes.len();
            db.conversions.retain(|c| c.wish != id);
            Ok(removed)
        })
    }

    fn add_conversion_record(&self, wish: u64, manifest: &ImageManifest) -> Result<()> {
        self.update(|db| {
            let digest = manifest.config_digest();
            if db
                .conversions
                .iter()
                .any(|c| c.wish == wish && c.input_reference == digest)
            {
                return Ok(());
            }
            db.conversions.push(ConversionRecord {
                wish,
                input_reference: digest.to_string(),
                manifest: manifest.clone(),
                converted_at: chrono::Utc::now(),
            });
            Ok(())
        })
    }

    fn already_converted(&self, wish: u64, config_digest: &str) -> Result<bool> {
        self.read(|db| {
            Ok(db
                .conversions
                .iter()
                .any(|c| c.wish == wish && c.input_reference == config_digest))
        })
    }

    fn conversions(&self) -> Result<Vec<ConversionRecord>> {
        self.read(|db| Ok(db.conversions.clone()))
    }

    fn delete_conversions(&self, wish: Option<u64>) -> Result<Vec<ConversionRecord>> {
        self.update(|db| {
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut db.conversions)
                .into_iter()
                .partition(|c| wish.map_or(true, |w| c.wish == w));
            db.conversions = kept;
            Ok(removed)
        })
    }

    fn needed_layers(&self, layers_subdir: &str) -> Result<LayerSet> {
        self.read(|db| {
            let mut needed = LayerSet::new();
            for record in &db.conversions {
                // Records whose wish is gone keep nothing alive.
                let Some(wish) = db.wishes.iter().find(|w| w.id == record.wish) else {
                    continue;
                };
                for path in record.layer_paths(&wish.repo, layers_subdir) {
                    needed.insert(path);
                }
            }
            Ok(needed)
        })
    }

    fn add_credential(&self, user: &str, registry: &str, password: &str) -> Result<()> {
        if user.is_empty() || registry.is_empty() {
            return Err(ThinError::Database(
                "user and registry must not be empty".to_string(),
            ));
        }
        self.update(|db| {
            db.credentials
                .retain(|c| !(c.user == user && c.registry == registry));
            db.credentials.push(Credential {
                user: user.to_string(),
                registry: registry.to_string(),
                password: password.to_string(),
            });
            Ok(())
        })
    }

    fn get_credential(&self, user: &str, registry: &str) -> Result<Option<String>> {
        self.read(|db| {
            Ok(db
                .credentials
                .iter()
                .find(|c| c.user == user && c.registry == registry)
                .map(|c| c.password.clone()))
        })
    }

    fn list_users(&self) -> Result<Vec<(String, String)>> {
        self.read(|db| {
            let mut users: Vec<(String, String)> = db
                .credentials
                .iter()
                .map(|c| (c.user.clone(), c.registry.clone()))
                .collect();
            users.sort();
            Ok(users)
        })
    }
}
