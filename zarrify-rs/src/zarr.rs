use half::f16;
use ndarray::{Array3, ArrayD, Axis, IxDyn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::{data_type, Array, ArrayBuilder};
use zarrs::config::MetadataRetrieveVersion;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};
use zarrs::storage::ReadableWritableListableStorageTraits;

use crate::error::{Error, Result};

/// Fixed top-level layout of a specimen store.
pub const TOP_LEVEL_GROUPS: [&str; 4] = ["METADATA", "TENSORS", "IMAGE", "TRACKING"];

pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Type alias for arrays in the store.
pub type StoreArray = Array<dyn ReadableWritableListableStorageTraits>;

/// Filesystem-backed store plus the directory it lives in, used for cheap
/// existence checks before expensive extraction work.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    inner: Arc<FilesystemStore>,
}

impl Store {
    fn storage(&self) -> Arc<dyn ReadableWritableListableStorageTraits> {
        self.inner.clone()
    }
}

/// Join path components into a store node path (`/A/B`).
pub fn node_path(parts: &[&str]) -> String {
    let joined: Vec<&str> = parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|p| !p.is_empty())
        .collect();
    format!("/{}", joined.join("/"))
}

pub fn open_store(root: &Path) -> Result<Store> {
    fs::create_dir_all(root)?;
    let store = FilesystemStore::new(root).map_err(Error::store)?;
    Ok(Store {
        root: root.to_path_buf(),
        inner: Arc::new(store),
    })
}

/// True when a group or array already exists at `path`. Stores written by the
/// Python tooling (Zarr v2 metadata) count as well.
pub fn node_exists(store: &Store, path: &str) -> bool {
    let dir = store.root.join(path.trim_start_matches('/'));
    ["zarr.json", ".zarray", ".zgroup"]
        .iter()
        .any(|meta| dir.join(meta).is_file())
}

pub fn array_exists(store: &Store, path: &str) -> bool {
    let dir = store.root.join(path.trim_start_matches('/'));
    if dir.join(".zarray").is_file() {
        return true;
    }
    match fs::read_to_string(dir.join("zarr.json")) {
        Ok(text) => serde_json::from_str::<serde_json::Value>(&text)
            .map(|meta| meta.get("node_type").and_then(|t| t.as_str()) == Some("array"))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Create the group at `path` unless something already exists there.
/// Existing groups keep their attributes. Returns whether a group was created.
pub fn ensure_group(store: &Store, path: &str) -> Result<bool> {
    if node_exists(store, path) {
        return Ok(false);
    }
    let group = GroupBuilder::new()
        .build(store.storage(), path)
        .map_err(Error::store)?;
    group.store_metadata().map_err(Error::store)?;
    Ok(true)
}

/// Ensure every group along `parts` exists, returning the deepest node path.
pub fn ensure_group_path(store: &Store, parts: &[&str]) -> Result<String> {
    let mut path = String::from("/");
    ensure_group(store, &path)?;
    for part in parts {
        path = node_path(&[path.as_str(), *part]);
        ensure_group(store, &path)?;
    }
    Ok(path)
}

/// Root group plus the fixed top-level groups.
pub fn ensure_layout(store: &Store) -> Result<()> {
    ensure_group(store, "/")?;
    for group in TOP_LEVEL_GROUPS {
        ensure_group(store, &node_path(&[group]))?;
    }
    Ok(())
}

/// Open a Zarr v3 array. Rejects v2 data.
pub fn open_array(store: &Store, path: &str) -> Result<StoreArray> {
    Array::open_opt(store.storage(), path, &MetadataRetrieveVersion::V3).map_err(Error::store)
}

pub fn group_attributes(store: &Store, path: &str) -> Result<Attributes> {
    let group = Group::open(store.storage(), path).map_err(Error::store)?;
    Ok(group.attributes().clone())
}

/// Insert or replace attributes on an existing group.
pub fn set_group_attributes(
    store: &Store,
    path: &str,
    entries: impl IntoIterator<Item = (String, serde_json::Value)>,
) -> Result<()> {
    let mut group = Group::open(store.storage(), path).map_err(Error::store)?;
    for (key, value) in entries {
        group.attributes_mut().insert(key, value);
    }
    group.store_metadata().map_err(Error::store)?;
    Ok(())
}

/// One chunk per index of the leading axis.
fn frame_chunks(shape: &[u64]) -> Vec<u64> {
    shape
        .iter()
        .enumerate()
        .map(|(i, &d)| if i == 0 { 1 } else { d.max(1) })
        .collect()
}

fn chunk_origin(rank: usize, index: u64) -> Vec<u64> {
    let mut origin = vec![0u64; rank];
    origin[0] = index;
    origin
}

pub fn create_array_u8(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Option<Attributes>,
) -> Result<StoreArray> {
    let mut builder = ArrayBuilder::new(shape, chunks, data_type::uint8(), 0u8);
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder.build(store.storage(), path).map_err(Error::store)?;
    array.store_metadata().map_err(Error::store)?;
    Ok(array)
}

pub fn create_array_f16(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Option<Attributes>,
) -> Result<StoreArray> {
    let mut builder = ArrayBuilder::new(shape, chunks, data_type::float16(), f16::ZERO);
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder.build(store.storage(), path).map_err(Error::store)?;
    array.store_metadata().map_err(Error::store)?;
    Ok(array)
}

/// Write an image stack `(frame, y, x)` as `uint8`, one frame per chunk.
/// An existing dataset is left untouched and `false` is returned.
pub fn write_stack_u8(
    store: &Store,
    path: &str,
    stack: &Array3<u8>,
    attrs: Option<Attributes>,
) -> Result<bool> {
    if array_exists(store, path) {
        return Ok(false);
    }
    let shape: Vec<u64> = stack.shape().iter().map(|&d| d as u64).collect();
    let array = create_array_u8(store, path, shape.clone(), frame_chunks(&shape), attrs)?;
    for (t, frame) in stack.axis_iter(Axis(0)).enumerate() {
        let data: Vec<u8> = frame.iter().copied().collect();
        array
            .store_chunk(&chunk_origin(shape.len(), t as u64), data.as_slice())
            .map_err(Error::store)?;
    }
    Ok(true)
}

/// Write a harmonized quantity as `float16`, one index of axis 0 per chunk.
/// An existing dataset is left untouched and `false` is returned.
pub fn write_quantity_f16(
    store: &Store,
    path: &str,
    values: &ArrayD<f64>,
    attrs: Option<Attributes>,
) -> Result<bool> {
    if array_exists(store, path) {
        return Ok(false);
    }
    if values.ndim() == 0 {
        return Err(Error::Shape(format!("{path}: cannot store a 0-d value as a dataset")));
    }
    let shape: Vec<u64> = values.shape().iter().map(|&d| d as u64).collect();
    let array = create_array_f16(store, path, shape.clone(), frame_chunks(&shape), attrs)?;
    if values.is_empty() {
        return Ok(true);
    }
    for (t, slab) in values.axis_iter(Axis(0)).enumerate() {
        let data: Vec<f16> = slab.iter().map(|&v| f16::from_f64(v)).collect();
        array
            .store_chunk(&chunk_origin(shape.len(), t as u64), data.as_slice())
            .map_err(Error::store)?;
    }
    Ok(true)
}

pub fn read_chunk_u8(array: &StoreArray, chunk_indices: &[u64]) -> Result<Vec<u8>> {
    array
        .retrieve_chunk::<Vec<u8>>(chunk_indices)
        .map_err(Error::store)
}

pub fn read_chunk_f16(array: &StoreArray, chunk_indices: &[u64]) -> Result<Vec<f16>> {
    array
        .retrieve_chunk::<Vec<f16>>(chunk_indices)
        .map_err(Error::store)
}

/// Read back a dataset written with one chunk per leading index.
fn read_frames<T: Clone>(
    array: &StoreArray,
    read_chunk: impl Fn(&StoreArray, &[u64]) -> Result<Vec<T>>,
) -> Result<ArrayD<T>> {
    let shape: Vec<usize> = array.shape().iter().map(|&d| d as usize).collect();
    if shape.is_empty() {
        return Err(Error::Shape("0-d dataset".into()));
    }
    let frame_len: usize = shape[1..].iter().product();
    let mut values = Vec::with_capacity(shape.iter().product());
    for t in 0..shape[0] {
        let mut chunk = read_chunk(array, &chunk_origin(shape.len(), t as u64))?;
        chunk.truncate(frame_len);
        values.extend(chunk);
    }
    ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| Error::Shape(e.to_string()))
}

pub fn read_array_u8(store: &Store, path: &str) -> Result<ArrayD<u8>> {
    read_frames(&open_array(store, path)?, read_chunk_u8)
}

pub fn read_array_f16(store: &Store, path: &str) -> Result<ArrayD<f16>> {
    read_frames(&open_array(store, path)?, read_chunk_f16)
}
