//! Anti-cheat checksum manifest.
//!
//! The manifest holds reference MD5 hashes for the track files every client
//! must match, in a fixed order, plus one or more accepted data hashes per car
//! model. A client answers with the track hashes concatenated in manifest
//! order followed by the hash of its own car data:
//!
//! ```text
//! | track[0] (16) | track[1] (16) | ... | track[n-1] (16) | car (16) |
//! ```

use crate::config::ConfigError;
use log::{debug, warn};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub type FileHash = [u8; 16];

pub const HASH_LEN: usize = 16;

#[derive(Debug, Default, Clone)]
pub struct ChecksumManifest {
    track: Vec<(String, FileHash)>,
    cars: HashMap<String, Vec<FileHash>>,
}

impl ChecksumManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a track file. Order of insertion is the order clients send.
    pub fn add_track_file(&mut self, path: impl Into<String>, hash: FileHash) {
        self.track.push((path.into(), hash));
    }

    /// Adds an accepted data hash for `model`.
    pub fn add_car_checksum(&mut self, model: impl Into<String>, hash: FileHash) {
        self.cars.entry(model.into()).or_default().push(hash);
    }

    pub fn track_paths(&self) -> Vec<String> {
        self.track.iter().map(|(path, _)| path.clone()).collect()
    }

    pub fn track_hashes(&self) -> impl Iterator<Item = &FileHash> {
        self.track.iter().map(|(_, hash)| hash)
    }

    pub fn car_checksums(&self, model: &str) -> &[FileHash] {
        self.cars.get(model).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Payload length a client must send, tag excluded.
    pub fn expected_len(&self) -> usize {
        HASH_LEN * (self.track.len() + 1)
    }

    /// Compares a client's checksum payload byte for byte.
    ///
    /// A model without reference hashes passes its car segment; the track
    /// segments must always match in order.
    pub fn verify(&self, model: &str, payload: &[u8]) -> bool {
        if payload.len() != self.expected_len() {
            debug!(
                "Checksum payload is {} bytes, expected {}",
                payload.len(),
                self.expected_len()
            );
            return false;
        }

        let (track_part, car_part) = payload.split_at(payload.len() - HASH_LEN);
        let accepted = self.car_checksums(model);
        if !accepted.is_empty() && !accepted.iter().any(|hash| hash.as_slice() == car_part) {
            return false;
        }

        track_part
            .chunks_exact(HASH_LEN)
            .zip(self.track_hashes())
            .all(|(sent, expected)| sent == expected.as_slice())
    }

    /// Fails startup when a configured model has no car hash, unless told to
    /// only warn.
    pub fn validate_models(&self, models: &[String], ignore_missing: bool) -> Result<(), ConfigError> {
        let missing: Vec<String> = models
            .iter()
            .filter(|model| self.car_checksums(model).is_empty())
            .cloned()
            .collect();

        if missing.is_empty() {
            return Ok(());
        }
        if ignore_missing {
            warn!(
                "No checksums for car models {}, cars with modified data will be able to join",
                missing.join(", ")
            );
            return Ok(());
        }
        Err(ConfigError::MissingCarChecksums(missing))
    }

    /// Hashes the reference files under a content root.
    ///
    /// Missing files are skipped; only the caller knows whether a gap is fatal,
    /// see [`validate_models`](Self::validate_models).
    pub fn from_content(
        root: &Path,
        track: &str,
        layout: &str,
        models: &[String],
    ) -> Result<Self, ConfigError> {
        let mut manifest = Self::new();

        manifest.add_if_present(root, "system/data/surfaces.ini")?;

        let track_dir = format!("content/tracks/{}", track);
        if layout.is_empty() {
            manifest.add_if_present(root, &format!("{}/data/surfaces.ini", track_dir))?;
            manifest.add_if_present(root, &format!("{}/models.ini", track_dir))?;
        } else {
            manifest.add_if_present(root, &format!("{}/{}/data/surfaces.ini", track_dir, layout))?;
            manifest.add_if_present(root, &format!("{}/models_{}.ini", track_dir, layout))?;
        }
        for kn5 in sorted_files(&root.join(&track_dir), |name| name.ends_with(".kn5"))? {
            manifest.add_if_present(root, &format!("{}/{}", track_dir, kn5))?;
        }

        for model in models {
            let car_dir = root.join("content/cars").join(model);
            let acd_files = sorted_files(&car_dir, |name| {
                name.starts_with("data") && name.ends_with(".acd")
            })?;
            for file in acd_files {
                let path = car_dir.join(&file);
                manifest.add_car_checksum(model.clone(), hash_file(&path)?);
                debug!("Added checksum for {}/{}", model, file);
            }
        }

        Ok(manifest)
    }

    fn add_if_present(&mut self, root: &Path, relative: &str) -> Result<(), ConfigError> {
        let path = root.join(relative);
        if path.is_file() {
            let hash = hash_file(&path)?;
            self.add_track_file(relative, hash);
            debug!("Added checksum for {}", relative);
        }
        Ok(())
    }
}

fn hash_file(path: &Path) -> Result<FileHash, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Md5::digest(&bytes).into())
}

/// File names in `dir` accepted by `keep`, sorted. A missing directory is empty.
fn sorted_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<String>, ConfigError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let io_err = |source| ConfigError::Io {
        path: PathBuf::from(dir),
        source,
    };

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.path().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if keep(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
