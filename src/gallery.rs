//! Snapshot capture and the in-memory image gallery

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::capture::convert;
use crate::error::GalleryError;
use crate::pipeline::FrameSlot;
use crate::stream::encoder::encode_jpeg;

/// Where a gallery image lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRef {
    Path(PathBuf),
    /// Opaque identifier of an image held outside the filesystem
    Blob(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub reference: ImageRef,
    pub name: String,
}

impl GalleryEntry {
    pub fn from_path(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            reference: ImageRef::Path(path),
            name,
        }
    }
}

/// Ordered list of captured and imported images. No deduplication.
#[derive(Default)]
pub struct Gallery {
    entries: Mutex<Vec<GalleryEntry>>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: GalleryEntry) {
        self.lock().push(entry);
    }

    /// Removes the first entry with `reference`. Returns false if none matched.
    pub fn remove(&self, reference: &ImageRef) -> bool {
        let mut entries = self.lock();
        match entries.iter().position(|e| &e.reference == reference) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the entries in insertion order
    pub fn entries(&self) -> Vec<GalleryEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<GalleryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Writes main camera snapshots and imported files into one directory
pub struct Snapshotter {
    directory: PathBuf,
    quality: u8,
    source: Option<Arc<FrameSlot>>,
}

impl Snapshotter {
    pub fn new(directory: impl Into<PathBuf>, quality: u8) -> Self {
        Self {
            directory: directory.into(),
            quality,
            source: None,
        }
    }

    /// Attaches the main camera's frame slot.
    pub fn with_source(mut self, slot: Arc<FrameSlot>) -> Self {
        self.source = Some(slot);
        self
    }

    /// Saves the current main camera frame as a JPEG and adds it to `gallery`.
    #[instrument(skip_all)]
    pub fn capture(&self, gallery: &Gallery) -> Result<GalleryEntry, GalleryError> {
        let slot = self.source.as_ref().ok_or(GalleryError::CameraUnavailable)?;
        let frame = slot.read_copy().ok_or(GalleryError::NoFrame)?;

        let rgb = convert::to_rgb(&frame)?;
        let jpeg = encode_jpeg(&rgb, self.quality)?;

        fs::create_dir_all(&self.directory)?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let (path, mut file) =
            create_unique(&self.directory, &format!("snapshot_{}", stamp), "jpg")?;
        file.write_all(&jpeg)?;
        file.sync_all()?;
        info!(
            "Snapshot saved: {} ({}x{})",
            path.display(),
            frame.width(),
            frame.height()
        );

        let entry = GalleryEntry::from_path(path);
        gallery.add(entry.clone());
        Ok(entry)
    }

    /// Copies an existing image into the snapshot directory and adds it.
    #[instrument(skip(self, gallery))]
    pub fn import(&self, source: &Path, gallery: &Gallery) -> Result<GalleryEntry, GalleryError> {
        if !source.is_file() {
            return Err(GalleryError::NotAFile(source.to_path_buf()));
        }
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| GalleryError::NotAFile(source.to_path_buf()))?;
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();

        fs::create_dir_all(&self.directory)?;
        let mut input = File::open(source)?;
        let (dest, mut output) = create_unique(&self.directory, &stem, &ext)?;
        io::copy(&mut input, &mut output)?;
        info!("Imported {} as {}", source.display(), dest.display());

        let entry = GalleryEntry::from_path(dest);
        gallery.add(entry.clone());
        Ok(entry)
    }
}

// Creates `dir/stem.ext`, or `dir/stem_N.ext` with the first free N. The
// name is claimed by `create_new`, so concurrent callers never share a file.
fn create_unique(dir: &Path, stem: &str, ext: &str) -> io::Result<(PathBuf, File)> {
    let file_name = |suffix: Option<u32>| {
        let base = match suffix {
            Some(n) => format!("{}_{}", stem, n),
            None => stem.to_string(),
        };
        if ext.is_empty() {
            base
        } else {
            format!("{}.{}", base, ext)
        }
    };

    let mut suffix = None;
    loop {
        let path = dir.join(file_name(suffix));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                suffix = Some(suffix.map_or(1, |n| n + 1));
            }
            Err(e) => return Err(e),
        }
    }
}
