// In: src/data/store.rs

//! The backing-store interface and its reference file implementation.
//!
//! The engine only talks to persistent storage through [`BackingStore`]: it opens
//! sources, creates the final stage's outputs, reads and writes hyperslab regions,
//! and closes handles. `RawFileStore` is a deliberately simple self-describing file
//! format so the engine can run end to end without an HDF5 dependency.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

//==================================================================================
// I. The Collaborator Interface
//==================================================================================

/// One half-open index range per axis.
pub type Region = [Range<usize>];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// An opaque reference to an open store entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreHandle(u64);

/// Persistent N-dimensional storage.
///
/// Implementations must allow concurrent `write_region` calls on disjoint regions
/// of the same handle from several workers. The engine serialises `open`, `create`
/// and `close` itself (only the coordinating worker calls them).
pub trait BackingStore: Send + Sync + fmt::Debug {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<StoreHandle>;

    fn create(
        &self,
        path: &Path,
        shape: &[usize],
        dtype: &str,
        chunking_hint: &[usize],
    ) -> Result<StoreHandle>;

    /// The shape recorded for an open handle.
    fn shape(&self, handle: StoreHandle) -> Result<Vec<usize>>;

    /// Reads `region`; the returned array has one axis per region entry.
    fn read_region(&self, handle: StoreHandle, region: &Region) -> Result<ArrayD<f64>>;

    /// Writes `data`, whose shape must equal the region's extents.
    fn write_region(&self, handle: StoreHandle, region: &Region, data: &ArrayD<f64>) -> Result<()>;

    fn close(&self, handle: StoreHandle) -> Result<()>;
}

//==================================================================================
// II. RawFileStore Format
//==================================================================================

/// The magic number to identify a sliceflow raw array file.
pub const STORE_MAGIC: &[u8; 4] = b"SLFW";
/// The current version of the raw array file format.
pub const STORE_FORMAT_VERSION: u16 = 1;
/// magic(4) + version(2) + header_len(4)
const FIXED_HEADER_SIZE: u64 = 10;
const ELEMENT_SIZE: u64 = std::mem::size_of::<f64>() as u64;

/// The JSON header stored at the start of every raw array file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub shape: Vec<usize>,
    pub dtype: String,
    /// Layout hint recorded at creation time. The raw format itself is unchunked.
    #[serde(default)]
    pub chunking: Vec<usize>,
}

struct OpenEntry {
    path: PathBuf,
    layout: StoreLayout,
    data_offset: u64,
    mode: OpenMode,
    file: Mutex<File>,
}

/// A file store holding one `f64` array per file: a fixed header, a JSON
/// [`StoreLayout`], then the elements in row-major little-endian order.
#[derive(Default)]
pub struct RawFileStore {
    next_handle: AtomicU64,
    entries: Mutex<HashMap<StoreHandle, Arc<OpenEntry>>>,
}

impl fmt::Debug for RawFileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paths: Vec<PathBuf> = self.entries.lock().values().map(|e| e.path.clone()).collect();
        f.debug_struct("RawFileStore").field("open", &paths).finish()
    }
}

impl RawFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently open handles.
    pub fn open_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Writes a complete array to `path` in one call. Used to prepare source files.
    pub fn write_array(path: &Path, array: &ArrayD<f64>) -> Result<()> {
        let store = RawFileStore::new();
        let handle = store.create(path, array.shape(), "f64", &[])?;
        let region: Vec<Range<usize>> = array.shape().iter().map(|&n| 0..n).collect();
        store.write_region(handle, &region, array)?;
        store.close(handle)
    }

    /// Reads a complete array from `path` in one call.
    pub fn read_array(path: &Path) -> Result<ArrayD<f64>> {
        let store = RawFileStore::new();
        let handle = store.open(path, OpenMode::Read)?;
        let shape = store.shape(handle)?;
        let region: Vec<Range<usize>> = shape.iter().map(|&n| 0..n).collect();
        let array = store.read_region(handle, &region);
        store.close(handle)?;
        array
    }

    fn register(&self, entry: OpenEntry) -> StoreHandle {
        let handle = StoreHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(handle, Arc::new(entry));
        handle
    }

    /// True when an open handle refers to the file at `path`.
    fn holds(&self, path: &Path) -> bool {
        let Ok(target) = path.canonicalize() else {
            // Nothing exists there, so nothing open can refer to it.
            return false;
        };
        self.entries
            .lock()
            .values()
            .any(|entry| entry.path.canonicalize().is_ok_and(|open| open == target))
    }

    fn entry(&self, handle: StoreHandle) -> Result<Arc<OpenEntry>> {
        self.entries
            .lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| PipelineError::BackingStore(format!("handle {:?} is not open", handle)))
    }
}

fn read_header(file: &mut File) -> Result<(StoreLayout, u64)> {
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if magic != *STORE_MAGIC {
        return Err(PipelineError::BackingStore("invalid store magic number".into()));
    }

    let mut u16_buf = [0u8; 2];
    file.read_exact(&mut u16_buf)?;
    let version = u16::from_le_bytes(u16_buf);
    if version != STORE_FORMAT_VERSION {
        return Err(PipelineError::BackingStore(format!(
            "unsupported store version: expected {}, got {}",
            STORE_FORMAT_VERSION, version
        )));
    }

    let mut u32_buf = [0u8; 4];
    file.read_exact(&mut u32_buf)?;
    let header_len = u32::from_le_bytes(u32_buf) as u64;

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    let layout: StoreLayout = serde_json::from_slice(&header)?;
    Ok((layout, FIXED_HEADER_SIZE + header_len))
}

/// Calls `f(element_offset, row_start, row_len)` for each contiguous run of the
/// last axis inside `region`, in row-major order. `row_start` is the position of
/// the run inside the flattened region.
fn for_each_row<F>(shape: &[usize], region: &Region, mut f: F) -> Result<()>
where
    F: FnMut(u64, usize, usize) -> Result<()>,
{
    let ndim = shape.len();
    if ndim == 0 {
        return f(0, 0, 1);
    }

    let mut strides = vec![1u64; ndim];
    for axis in (0..ndim - 1).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1] as u64;
    }

    let row_len = region[ndim - 1].len();
    let outer: Vec<usize> = region[..ndim - 1].iter().map(|r| r.len()).collect();
    let rows: usize = outer.iter().product();
    if row_len == 0 || rows == 0 {
        return Ok(());
    }

    let mut counter = vec![0usize; ndim - 1];
    for row in 0..rows {
        let mut offset = region[ndim - 1].start as u64;
        for axis in 0..ndim - 1 {
            offset += (region[axis].start + counter[axis]) as u64 * strides[axis];
        }
        f(offset, row * row_len, row_len)?;

        for axis in (0..ndim - 1).rev() {
            counter[axis] += 1;
            if counter[axis] < outer[axis] {
                break;
            }
            counter[axis] = 0;
        }
    }
    Ok(())
}

fn check_region(layout: &StoreLayout, region: &Region) -> Result<()> {
    let in_bounds = region.len() == layout.shape.len()
        && region
            .iter()
            .zip(&layout.shape)
            .all(|(range, &n)| range.start <= range.end && range.end <= n);
    if in_bounds {
        Ok(())
    } else {
        Err(PipelineError::ShapeMismatch {
            expected: layout.shape.clone(),
            actual: region.iter().map(|r| r.end).collect(),
        })
    }
}

//==================================================================================
// III. BackingStore Implementation
//==================================================================================

impl BackingStore for RawFileStore {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<StoreHandle> {
        let mut file = match mode {
            OpenMode::Read => File::open(path)?,
            OpenMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
        };
        let (layout, data_offset) = read_header(&mut file)?;
        log::debug!("opened store {} ({:?}) shape {:?}", path.display(), mode, layout.shape);
        Ok(self.register(OpenEntry {
            path: path.to_path_buf(),
            layout,
            data_offset,
            mode,
            file: Mutex::new(file),
        }))
    }

    fn create(
        &self,
        path: &Path,
        shape: &[usize],
        dtype: &str,
        chunking_hint: &[usize],
    ) -> Result<StoreHandle> {
        if dtype != "f64" {
            return Err(PipelineError::BackingStore(format!(
                "RawFileStore only stores f64 data, got '{}'",
                dtype
            )));
        }
        if self.holds(path) {
            return Err(PipelineError::BackingStore(format!(
                "{} is already open and cannot be recreated",
                path.display()
            )));
        }
        let layout = StoreLayout {
            shape: shape.to_vec(),
            dtype: dtype.to_string(),
            chunking: chunking_hint.to_vec(),
        };
        let header = serde_json::to_vec(&layout)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&STORE_FORMAT_VERSION.to_le_bytes())?;
        file.write_all(&(header.len() as u32).to_le_bytes())?;
        file.write_all(&header)?;

        // Allocate the payload up front; unwritten elements read back as 0.0.
        let data_offset = FIXED_HEADER_SIZE + header.len() as u64;
        let elements: u64 = shape.iter().map(|&n| n as u64).product();
        file.set_len(data_offset + elements * ELEMENT_SIZE)?;

        log::debug!("created store {} shape {:?}", path.display(), shape);
        Ok(self.register(OpenEntry {
            path: path.to_path_buf(),
            layout,
            data_offset,
            mode: OpenMode::ReadWrite,
            file: Mutex::new(file),
        }))
    }

    fn shape(&self, handle: StoreHandle) -> Result<Vec<usize>> {
        Ok(self.entry(handle)?.layout.shape.clone())
    }

    fn read_region(&self, handle: StoreHandle, region: &Region) -> Result<ArrayD<f64>> {
        let entry = self.entry(handle)?;
        check_region(&entry.layout, region)?;

        let extents: Vec<usize> = region.iter().map(|r| r.len()).collect();
        let mut values = vec![0f64; extents.iter().product()];
        {
            let mut file = entry.file.lock();
            for_each_row(&entry.layout.shape, region, |offset, start, len| {
                file.seek(SeekFrom::Start(entry.data_offset + offset * ELEMENT_SIZE))?;
                let row = &mut values[start..start + len];
                file.read_exact(bytemuck::cast_slice_mut(row))?;
                Ok(())
            })?;
        }
        for value in values.iter_mut() {
            *value = f64::from_bits(u64::from_le(value.to_bits()));
        }
        Ok(ArrayD::from_shape_vec(IxDyn(&extents), values)?)
    }

    fn write_region(&self, handle: StoreHandle, region: &Region, data: &ArrayD<f64>) -> Result<()> {
        let entry = self.entry(handle)?;
        if entry.mode != OpenMode::ReadWrite {
            return Err(PipelineError::BackingStore(format!(
                "{} is open read-only",
                entry.path.display()
            )));
        }
        check_region(&entry.layout, region)?;
        let extents: Vec<usize> = region.iter().map(|r| r.len()).collect();
        if data.shape() != extents.as_slice() {
            return Err(PipelineError::ShapeMismatch {
                expected: extents,
                actual: data.shape().to_vec(),
            });
        }

        let values: Vec<f64> = data.iter().map(|v| f64::from_bits(v.to_bits().to_le())).collect();
        let mut file = entry.file.lock();
        for_each_row(&entry.layout.shape, region, |offset, start, len| {
            file.seek(SeekFrom::Start(entry.data_offset + offset * ELEMENT_SIZE))?;
            file.write_all(bytemuck::cast_slice(&values[start..start + len]))?;
            Ok(())
        })
    }

    fn close(&self, handle: StoreHandle) -> Result<()> {
        let entry = self
            .entries
            .lock()
            .remove(&handle)
            .ok_or_else(|| PipelineError::BackingStore(format!("handle {:?} is not open", handle)))?;
        if entry.mode == OpenMode::ReadWrite {
            let mut file = entry.file.lock();
            file.flush()?;
            file.sync_all()?;
        }
        log::debug!("closed store {}", entry.path.display());
        Ok(())
    }
}
