pub mod aggregate;
pub mod bucket;
pub mod config;
pub mod event;
pub mod mapper;
pub mod pipeline;
pub mod state;
pub mod store;

pub use anyhow::{Context, Error};
use qu::ick_use::*;
use serde::{de::DeserializeOwned, Serialize};
use std::{fs, io, path::Path, sync::Arc};

pub use crate::{
    bucket::MetricsBucket,
    event::{CountRow, DeltaRow, EventPayload, Metric, ParticipantKind},
    pipeline::PipelineConfig,
    store::{MemoryStore, MetricsStore, MetricsVersion, VersionId},
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;

/// Participant identifiers are carried as opaque strings, exactly as the
/// export job writes them.
pub type ParticipantId = ArcStr;

/// Load a bincode-serialized value from disk.
pub fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    fn inner<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let reader = io::BufReader::new(fs::File::open(path)?);
        bincode::deserialize_from(reader).map_err(Into::into)
    }
    let path = path.as_ref();
    inner(path).with_context(|| format!("unable to load data from \"{}\"", path.display()))
}

/// Save a bincode-serialized value to disk, creating parent directories as
/// needed.
pub fn save<T: Serialize>(contents: &T, path: impl AsRef<Path>) -> Result {
    fn inner<T: Serialize>(contents: &T, path: &Path) -> Result {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("could not create parent")?;
        }
        if path_exists(path)? {
            event!(
                Level::WARN,
                "overwriting existing file at \"{}\"",
                path.display()
            );
        }
        let mut out = io::BufWriter::new(fs::File::create(path)?);
        bincode::serialize_into(&mut out, contents)?;
        Ok(())
    }
    let path = path.as_ref();
    inner(contents, path).with_context(|| format!("unable to save data to \"{}\"", path.display()))
}

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}
