//! Manifest: the authoritative on-store representation of the core state.
//!
//! Manifests are written as numbered objects
//! (`<root>/manifest/<20-digit-generation>.manifest`); generation `N+1` is
//! written only after reading generation `N`, and the write is conditional
//! on the target object being vacant. Losing a generation race surfaces as
//! `Error::AlreadyExists`; callers refresh and retry.
//!
//! `FenceableManifest` layers writer epochs on top: opening a role bumps
//! that role's epoch, and every later operation validates the epoch so a
//! superseded process fails with `Error::Fenced` instead of publishing.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::object_store::ObjectStore;
use crate::state::CoreState;

const MANIFEST_FORMAT_VERSION: u16 = 1;

/// Versioned record persisted per generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub generation: u64,
    pub writer_epoch: u64,
    pub compactor_epoch: u64,
    pub core: CoreState,
}

pub struct ManifestStore {
    store: Arc<dyn ObjectStore>,
    root: String,
}

impl ManifestStore {
    pub fn new(root: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    fn manifest_path(&self, generation: u64) -> String {
        format!("{}/manifest/{:020}.manifest", self.root, generation)
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let payload = encode_manifest(manifest)?;
        self.store
            .put_if_absent(&self.manifest_path(manifest.generation), payload)
    }

    fn read_manifest(&self, generation: u64) -> Result<Manifest> {
        let raw = self.store.get(&self.manifest_path(generation))?;
        let manifest = decode_manifest(&raw)?;
        if manifest.generation != generation {
            return Err(Error::invalid_db_state(format!(
                "manifest object {} claims generation {}",
                generation, manifest.generation
            )));
        }
        Ok(manifest)
    }

    fn read_latest(&self) -> Result<Option<Manifest>> {
        let prefix = format!("{}/manifest/", self.root);
        let mut latest = None;
        for path in self.store.list(&prefix)? {
            let Some(name) = path.rsplit('/').next() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".manifest") else {
                continue;
            };
            match stem.parse::<u64>() {
                Ok(generation) => latest = latest.max(Some(generation)),
                Err(_) => warn!(%path, "ignoring manifest object with unparseable generation"),
            }
        }
        match latest {
            Some(generation) => Ok(Some(self.read_manifest(generation)?)),
            None => Ok(None),
        }
    }
}

fn encode_manifest(manifest: &Manifest) -> Result<Bytes> {
    let body = bincode::serialize(manifest)?;
    let mut buf = BytesMut::with_capacity(2 + body.len() + 4);
    buf.put_u16_le(MANIFEST_FORMAT_VERSION);
    buf.put_slice(&body);
    buf.put_u32_le(crc32c::crc32c(&buf));
    Ok(buf.freeze())
}

fn decode_manifest(raw: &[u8]) -> Result<Manifest> {
    if raw.len() < 6 {
        return Err(Error::invalid_db_state("manifest object too small"));
    }
    let (payload, crc) = raw.split_at(raw.len() - 4);
    let stored_crc = u32::from_le_bytes(crc.try_into().unwrap());
    if crc32c::crc32c(payload) != stored_crc {
        return Err(Error::Checksum("manifest checksum mismatch"));
    }
    let mut buf = payload;
    let version = buf.get_u16_le();
    if version != MANIFEST_FORMAT_VERSION {
        return Err(Error::invalid_db_state(format!(
            "unsupported manifest format version {version}"
        )));
    }
    Ok(bincode::deserialize(buf)?)
}

/// The latest known manifest plus the means to publish successors.
pub struct StoredManifest {
    store: Arc<ManifestStore>,
    manifest: Manifest,
}

impl StoredManifest {
    /// Discovers the newest generation, if the db exists at all.
    pub fn load(store: Arc<ManifestStore>) -> Result<Option<StoredManifest>> {
        Ok(store
            .read_latest()?
            .map(|manifest| StoredManifest { store, manifest }))
    }

    /// Bootstraps generation 1 for a fresh db.
    pub fn create_new(store: Arc<ManifestStore>, core: CoreState) -> Result<StoredManifest> {
        let manifest = Manifest {
            generation: 1,
            writer_epoch: 0,
            compactor_epoch: 0,
            core,
        };
        store.write_manifest(&manifest)?;
        Ok(StoredManifest { store, manifest })
    }

    pub fn generation(&self) -> u64 {
        self.manifest.generation
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn db_state(&self) -> &CoreState {
        &self.manifest.core
    }

    /// Re-reads the newest generation.
    pub fn refresh(&mut self) -> Result<&CoreState> {
        self.manifest = self.store.read_latest()?.ok_or_else(|| {
            Error::invalid_db_state("manifest vanished from the object store")
        })?;
        Ok(&self.manifest.core)
    }

    /// Publishes `core` as the next generation, keeping the current epochs.
    pub fn update_db_state(&mut self, core: CoreState) -> Result<()> {
        let next = Manifest {
            generation: self.manifest.generation + 1,
            writer_epoch: self.manifest.writer_epoch,
            compactor_epoch: self.manifest.compactor_epoch,
            core,
        };
        self.update_manifest(next)
    }

    fn update_manifest(&mut self, manifest: Manifest) -> Result<()> {
        self.store.write_manifest(&manifest)?;
        self.manifest = manifest;
        Ok(())
    }
}

/// Which background role owns the epoch being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpochRole {
    Writer,
    Compactor,
}

impl EpochRole {
    fn epoch_of(&self, manifest: &Manifest) -> u64 {
        match self {
            EpochRole::Writer => manifest.writer_epoch,
            EpochRole::Compactor => manifest.compactor_epoch,
        }
    }

    fn set_epoch(&self, manifest: &mut Manifest, epoch: u64) {
        match self {
            EpochRole::Writer => manifest.writer_epoch = epoch,
            EpochRole::Compactor => manifest.compactor_epoch = epoch,
        }
    }
}

/// A `StoredManifest` bound to a claimed epoch. Claiming publishes a new
/// generation with the bumped epoch; any later observation of a higher
/// epoch means another process took over and this one must stop.
pub struct FenceableManifest {
    stored: StoredManifest,
    role: EpochRole,
    local_epoch: u64,
}

impl FenceableManifest {
    pub fn init_writer(stored: StoredManifest) -> Result<FenceableManifest> {
        Self::init(stored, EpochRole::Writer)
    }

    pub fn init_compactor(stored: StoredManifest) -> Result<FenceableManifest> {
        Self::init(stored, EpochRole::Compactor)
    }

    fn init(mut stored: StoredManifest, role: EpochRole) -> Result<FenceableManifest> {
        loop {
            let mut next = stored.manifest.clone();
            let local_epoch = role.epoch_of(&next) + 1;
            role.set_epoch(&mut next, local_epoch);
            next.generation += 1;
            match stored.update_manifest(next) {
                Ok(()) => {
                    return Ok(FenceableManifest {
                        stored,
                        role,
                        local_epoch,
                    })
                }
                Err(Error::AlreadyExists) => {
                    stored.refresh()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn check_epoch(&self) -> Result<()> {
        let stored_epoch = self.role.epoch_of(&self.stored.manifest);
        if stored_epoch > self.local_epoch {
            return Err(Error::Fenced);
        }
        if stored_epoch < self.local_epoch {
            return Err(Error::invalid_db_state(
                "stored manifest epoch regressed below the claimed epoch",
            ));
        }
        Ok(())
    }

    pub fn db_state(&self) -> Result<&CoreState> {
        self.check_epoch()?;
        Ok(self.stored.db_state())
    }

    pub fn refresh(&mut self) -> Result<&CoreState> {
        self.stored.refresh()?;
        self.check_epoch()?;
        Ok(self.stored.db_state())
    }

    pub fn update_db_state(&mut self, core: CoreState) -> Result<()> {
        self.check_epoch()?;
        self.stored.update_db_state(core)
    }
}
