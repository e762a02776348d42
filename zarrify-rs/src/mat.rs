//! Level-5 MAT-file reader.
//!
//! Result files written by the MATLAB analysis suite are level-5 MAT files whose
//! variables are usually zlib-compressed. Decoding happens in two steps:
//!   1. the byte stream is parsed into [`MatNode`]s that keep MATLAB's raw
//!      column-major layout and dimensions;
//!   2. [`MatValue::from_node`] converts nodes into plain values, squeezing
//!      singleton dimensions of numeric arrays and turning every struct into an
//!      ordinary [`Record`].
//!
//! MATLAB 7.3 files are HDF5 containers and are rejected with a clear message.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use ndarray::{Array1, ArrayD, Axis, IxDyn, ShapeBuilder};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};

const HEADER_LEN: usize = 128;

const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT16: u32 = 3;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_INT64: u32 = 12;
const MI_UINT64: u32 = 13;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;
const MI_UTF8: u32 = 16;
const MI_UTF16: u32 = 17;
const MI_UTF32: u32 = 18;

const MX_CELL: u8 = 1;
const MX_STRUCT: u8 = 2;
const MX_OBJECT: u8 = 3;
const MX_CHAR: u8 = 4;
const MX_SPARSE: u8 = 5;
const MX_DOUBLE: u8 = 6;
const MX_UINT64: u8 = 15;

/// Upper bound on the dense size of a sparse matrix.
const MAX_DENSE_ELEMENTS: usize = 1 << 28;

type Decode<T> = std::result::Result<T, String>;

/// Number of elements `dims` describes, refused above `limit`.
fn element_count(dims: &[usize], limit: usize) -> Decode<usize> {
    let count = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or("dimension product overflows")?;
    if count > limit {
        return Err(format!(
            "dimensions {dims:?} declare {count} elements, at most {limit} fit"
        ));
    }
    Ok(count)
}

/// Variables of a result file (or fields of a struct), keyed by name.
pub type Record = BTreeMap<String, MatValue>;

/// A decoded MATLAB value after squeezing.
#[derive(Debug, Clone, PartialEq)]
pub enum MatValue {
    Scalar(f64),
    Array(ArrayD<f64>),
    Text(String),
    Record(Record),
    Cells(ArrayD<MatValue>),
    /// A variable whose payload contradicts its header, with the reason.
    Invalid(String),
}

/// Raw decoded element, still in MATLAB's column-major order.
#[derive(Debug, Clone)]
pub enum MatNode {
    Numeric { dims: Vec<usize>, values: Vec<f64> },
    Char { dims: Vec<usize>, chars: Vec<char> },
    Cell { dims: Vec<usize>, items: Vec<MatNode> },
    Struct {
        dims: Vec<usize>,
        fields: Vec<String>,
        elements: Vec<Vec<MatNode>>,
    },
    Empty,
    Unsupported(u8),
}

impl MatValue {
    /// Convert a raw node. Unsupported classes (function handles, opaque
    /// objects) yield `None`.
    pub fn from_node(node: MatNode) -> Option<MatValue> {
        match node {
            MatNode::Numeric { dims, values } => Some(numeric_value(&dims, values)),
            MatNode::Char { dims, chars } => Some(char_value(&dims, &chars)),
            MatNode::Cell { dims, items } => {
                let values: Vec<MatValue> = items
                    .into_iter()
                    .map(|n| MatValue::from_node(n).unwrap_or_else(empty_value))
                    .collect();
                Some(cells_value(&dims, values))
            }
            MatNode::Struct {
                dims,
                fields,
                elements,
            } => {
                let records: Vec<MatValue> = elements
                    .into_iter()
                    .map(|element| {
                        let mut record = Record::new();
                        for (field, node) in fields.iter().zip(element) {
                            if let Some(value) = MatValue::from_node(node) {
                                record.insert(field.clone(), value);
                            }
                        }
                        MatValue::Record(record)
                    })
                    .collect();
                Some(cells_value(&dims, records))
            }
            MatNode::Empty => Some(empty_value()),
            MatNode::Unsupported(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MatValue::Scalar(_) => "scalar",
            MatValue::Array(_) => "array",
            MatValue::Text(_) => "text",
            MatValue::Record(_) => "record",
            MatValue::Cells(_) => "cells",
            MatValue::Invalid(_) => "invalid",
        }
    }

    /// Numeric view of the value. Scalars become 0-d arrays.
    pub fn as_array(&self) -> Option<ArrayD<f64>> {
        match self {
            MatValue::Scalar(v) => Some(ArrayD::from_elem(IxDyn(&[]), *v)),
            MatValue::Array(a) => Some(a.clone()),
            _ => None,
        }
    }
}

fn empty_value() -> MatValue {
    MatValue::Array(ArrayD::zeros(IxDyn(&[0, 0])))
}

/// Build a C-order-indexed array from column-major data.
fn from_column_major<T: Clone>(dims: &[usize], values: Vec<T>) -> Decode<ArrayD<T>> {
    let held = values.len();
    ArrayD::from_shape_vec(IxDyn(dims).f(), values)
        .map_err(|_| format!("dimensions {dims:?} do not match the {held} stored elements"))
}

/// Drop every length-1 axis. Empty arrays are left alone.
fn squeeze<T>(mut array: ArrayD<T>) -> ArrayD<T> {
    if array.is_empty() {
        return array;
    }
    for axis in (0..array.ndim()).rev() {
        if array.shape()[axis] == 1 {
            array = array.index_axis_move(Axis(axis), 0);
        }
    }
    array
}

fn numeric_value(dims: &[usize], values: Vec<f64>) -> MatValue {
    if values.len() == 1 && dims.iter().all(|&d| d == 1) {
        return MatValue::Scalar(values[0]);
    }
    match from_column_major(dims, values) {
        Ok(array) => MatValue::Array(squeeze(array)),
        Err(reason) => MatValue::Invalid(reason),
    }
}

fn char_value(dims: &[usize], chars: &[char]) -> MatValue {
    let rows = dims.first().copied().unwrap_or(0);
    if rows <= 1 {
        return MatValue::Text(chars.iter().collect());
    }
    let cols = chars.len() / rows;
    let lines: Vec<MatValue> = (0..rows)
        .map(|r| MatValue::Text((0..cols).map(|c| chars[r + c * rows]).collect()))
        .collect();
    MatValue::Cells(Array1::from(lines).into_dyn())
}

/// Cell and struct arrays keep MATLAB's dimensions, so a `(n, 1)` column and a
/// `(1, n)` row stay distinguishable. A single element is unwrapped.
fn cells_value(dims: &[usize], mut values: Vec<MatValue>) -> MatValue {
    if values.len() == 1 {
        return values.remove(0);
    }
    match from_column_major(dims, values) {
        Ok(array) => MatValue::Cells(array),
        Err(reason) => MatValue::Invalid(reason),
    }
}

/// Read a result file and convert all of its variables.
pub fn read_file(path: &Path) -> Result<Record> {
    let bytes = fs::read(path)?;
    let nodes = parse(&bytes).map_err(|message| Error::Mat {
        path: path.to_path_buf(),
        message,
    })?;
    Ok(nodes
        .into_iter()
        .filter_map(|(name, node)| MatValue::from_node(node).map(|v| (name, v)))
        .collect())
}

/// Parse a complete file image into named top-level nodes, in file order.
pub fn parse(bytes: &[u8]) -> Decode<Vec<(String, MatNode)>> {
    if bytes.len() < HEADER_LEN {
        return Err("file is shorter than a MAT header".into());
    }
    let text = String::from_utf8_lossy(&bytes[..116]);
    if text.starts_with("MATLAB 7.3") {
        return Err("MATLAB 7.3 (HDF5) files are not supported; re-save with -v7".into());
    }
    let endian = match &bytes[126..128] {
        b"IM" => Endian::Little,
        b"MI" => Endian::Big,
        _ => return Err("missing endian indicator, not a level-5 MAT file".into()),
    };
    let decoder = Decoder { endian };
    decoder.elements(&bytes[HEADER_LEN..])
}

#[derive(Clone, Copy, Debug)]
enum Endian {
    Little,
    Big,
}

macro_rules! endian_read {
    ($name:ident, $ty:ty, $read:ident) => {
        fn $name(self, b: &[u8]) -> $ty {
            match self {
                Endian::Little => LittleEndian::$read(b),
                Endian::Big => BigEndian::$read(b),
            }
        }
    };
}

impl Endian {
    endian_read!(u16, u16, read_u16);
    endian_read!(i16, i16, read_i16);
    endian_read!(u32, u32, read_u32);
    endian_read!(i32, i32, read_i32);
    endian_read!(u64, u64, read_u64);
    endian_read!(i64, i64, read_i64);
    endian_read!(f32, f32, read_f32);
    endian_read!(f64, f64, read_f64);
}

/// Location of one data element inside a buffer.
struct Tag {
    kind: u32,
    start: usize,
    len: usize,
    next: usize,
}

impl Tag {
    fn data<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.start + self.len]
    }
}

struct Decoder {
    endian: Endian,
}

impl Decoder {
    fn tag(&self, buf: &[u8], pos: usize) -> Decode<Tag> {
        if pos + 8 > buf.len() {
            return Err(format!("truncated element tag at offset {pos}"));
        }
        let first = self.endian.u32(&buf[pos..pos + 4]);
        // Small data element: length in the upper half, payload in the tag itself.
        if first >> 16 != 0 {
            let len = (first >> 16) as usize;
            if len > 4 {
                return Err(format!("invalid small element length {len} at offset {pos}"));
            }
            return Ok(Tag {
                kind: first & 0xffff,
                start: pos + 4,
                len,
                next: pos + 8,
            });
        }
        let len = self.endian.u32(&buf[pos + 4..pos + 8]) as usize;
        let start = pos + 8;
        if start + len > buf.len() {
            return Err(format!(
                "element at offset {pos} claims {len} bytes, only {} left",
                buf.len() - start
            ));
        }
        let next = if first == MI_COMPRESSED {
            start + len
        } else {
            (start + len.div_ceil(8) * 8).min(buf.len())
        };
        Ok(Tag {
            kind: first,
            start,
            len,
            next,
        })
    }

    fn elements(&self, buf: &[u8]) -> Decode<Vec<(String, MatNode)>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 8 <= buf.len() {
            let tag = self.tag(buf, pos)?;
            match tag.kind {
                MI_COMPRESSED => {
                    let mut inflated = Vec::new();
                    ZlibDecoder::new(tag.data(buf))
                        .read_to_end(&mut inflated)
                        .map_err(|e| format!("zlib stream at offset {pos}: {e}"))?;
                    out.extend(self.elements(&inflated)?);
                }
                MI_MATRIX => out.push(self.matrix(tag.data(buf))?),
                _ => {}
            }
            pos = tag.next;
        }
        Ok(out)
    }

    fn matrix(&self, buf: &[u8]) -> Decode<(String, MatNode)> {
        if buf.is_empty() {
            return Ok((String::new(), MatNode::Empty));
        }
        let flags_tag = self.tag(buf, 0)?;
        if flags_tag.kind != MI_UINT32 || flags_tag.len < 8 {
            return Err("array flags subelement missing".into());
        }
        let flags = self.endian.u32(&flags_tag.data(buf)[..4]);
        let class = (flags & 0xff) as u8;

        let dims_tag = self.tag(buf, flags_tag.next)?;
        let dims: Vec<usize> = self
            .numbers(buf, &dims_tag)?
            .into_iter()
            .map(|d| d.max(0.0) as usize)
            .collect();

        let name_tag = self.tag(buf, dims_tag.next)?;
        let name = String::from_utf8_lossy(name_tag.data(buf))
            .trim_end_matches('\0')
            .to_string();
        let pos = name_tag.next;

        let node = match class {
            MX_DOUBLE..=MX_UINT64 => {
                let real = self.tag(buf, pos)?;
                // Imaginary parts, when present, follow and are dropped.
                let values = self.numbers(buf, &real)?;
                MatNode::Numeric { dims, values }
            }
            MX_CHAR => {
                let data = self.tag(buf, pos)?;
                MatNode::Char {
                    dims,
                    chars: self.chars(buf, &data)?,
                }
            }
            MX_CELL => {
                // Every item is a matrix element of at least one 8-byte tag.
                let count = element_count(&dims, buf.len().saturating_sub(pos) / 8)?;
                let mut items = Vec::with_capacity(count);
                let mut at = pos;
                for _ in 0..count {
                    let tag = self.tag(buf, at)?;
                    if tag.kind != MI_MATRIX {
                        return Err(format!("cell item of type {} is not a matrix", tag.kind));
                    }
                    items.push(self.matrix(tag.data(buf))?.1);
                    at = tag.next;
                }
                MatNode::Cell { dims, items }
            }
            MX_STRUCT | MX_OBJECT => {
                let mut at = pos;
                if class == MX_OBJECT {
                    at = self.tag(buf, at)?.next;
                }
                let len_tag = self.tag(buf, at)?;
                let field_len = self
                    .numbers(buf, &len_tag)?
                    .first()
                    .map(|v| *v as usize)
                    .ok_or("missing field name length")?;
                let names_tag = self.tag(buf, len_tag.next)?;
                let fields: Vec<String> = if field_len == 0 {
                    Vec::new()
                } else {
                    names_tag
                        .data(buf)
                        .chunks(field_len)
                        .map(|raw| {
                            String::from_utf8_lossy(raw)
                                .trim_end_matches('\0')
                                .to_string()
                        })
                        .collect()
                };
                at = names_tag.next;

                let per_element = fields.len().max(1);
                let count =
                    element_count(&dims, buf.len().saturating_sub(at) / 8 / per_element)?;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut element = Vec::with_capacity(fields.len());
                    for _ in &fields {
                        let tag = self.tag(buf, at)?;
                        element.push(self.matrix(tag.data(buf))?.1);
                        at = tag.next;
                    }
                    elements.push(element);
                }
                MatNode::Struct {
                    dims,
                    fields,
                    elements,
                }
            }
            MX_SPARSE => self.sparse(buf, pos, &dims)?,
            other => MatNode::Unsupported(other),
        };
        Ok((name, node))
    }

    /// Sparse matrices are densified; they only ever hold small masks.
    fn sparse(&self, buf: &[u8], pos: usize, dims: &[usize]) -> Decode<MatNode> {
        let ir_tag = self.tag(buf, pos)?;
        let jc_tag = self.tag(buf, ir_tag.next)?;
        let pr_tag = self.tag(buf, jc_tag.next)?;
        let rows_idx = self.numbers(buf, &ir_tag)?;
        let col_ptr = self.numbers(buf, &jc_tag)?;
        let values = self.numbers(buf, &pr_tag)?;
        let (rows, cols) = match dims {
            [r, c, ..] => (*r, *c),
            _ => return Err("sparse matrix without two dimensions".into()),
        };
        let mut dense = vec![0.0; element_count(&[rows, cols], MAX_DENSE_ELEMENTS)?];
        for col in 0..cols.min(col_ptr.len().saturating_sub(1)) {
            for k in col_ptr[col] as usize..col_ptr[col + 1] as usize {
                let row = *rows_idx.get(k).ok_or("sparse row index out of range")? as usize;
                let value = *values.get(k).ok_or("sparse value out of range")?;
                if row < rows {
                    dense[row + col * rows] = value;
                }
            }
        }
        Ok(MatNode::Numeric {
            dims: vec![rows, cols],
            values: dense,
        })
    }

    fn numbers(&self, buf: &[u8], tag: &Tag) -> Decode<Vec<f64>> {
        let data = tag.data(buf);
        let e = self.endian;
        let values = match tag.kind {
            MI_INT8 => data.iter().map(|&b| b as i8 as f64).collect(),
            MI_UINT8 | MI_UTF8 => data.iter().map(|&b| b as f64).collect(),
            MI_INT16 => data.chunks_exact(2).map(|c| e.i16(c) as f64).collect(),
            MI_UINT16 | MI_UTF16 => data.chunks_exact(2).map(|c| e.u16(c) as f64).collect(),
            MI_INT32 => data.chunks_exact(4).map(|c| e.i32(c) as f64).collect(),
            MI_UINT32 | MI_UTF32 => data.chunks_exact(4).map(|c| e.u32(c) as f64).collect(),
            MI_SINGLE => data.chunks_exact(4).map(|c| e.f32(c) as f64).collect(),
            MI_DOUBLE => data.chunks_exact(8).map(|c| e.f64(c)).collect(),
            MI_INT64 => data.chunks_exact(8).map(|c| e.i64(c) as f64).collect(),
            MI_UINT64 => data.chunks_exact(8).map(|c| e.u64(c) as f64).collect(),
            other => return Err(format!("unexpected numeric data type {other}")),
        };
        Ok(values)
    }

    fn chars(&self, buf: &[u8], tag: &Tag) -> Decode<Vec<char>> {
        let data = tag.data(buf);
        Ok(match tag.kind {
            MI_UTF8 => String::from_utf8_lossy(data).chars().collect(),
            MI_UINT16 | MI_UTF16 => {
                let units: Vec<u16> = data.chunks_exact(2).map(|c| self.endian.u16(c)).collect();
                String::from_utf16_lossy(&units).chars().collect()
            }
            MI_INT8 | MI_UINT8 => data.iter().map(|&b| b as char).collect(),
            _ => self
                .numbers(buf, tag)?
                .into_iter()
                .map(|v| char::from_u32(v as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fixture::{encode, Fx};
    use super::*;

    fn decode(vars: &[(&str, Fx)], compressed: bool) -> Record {
        parse(&encode(vars, compressed))
            .unwrap()
            .into_iter()
            .filter_map(|(n, node)| MatValue::from_node(node).map(|v| (n, v)))
            .collect()
    }

    #[test]
    fn column_major_data_is_indexed_like_matlab() {
        // 2x3 matrix [[1,2,3],[4,5,6]] stored column by column.
        let rec = decode(
            &[("m", Fx::Double(vec![2, 3], vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]))],
            false,
        );
        let m = rec["m"].as_array().unwrap();
        assert_eq!(m.shape(), &[2, 3]);
        assert_eq!(m[[0, 2]], 3.0);
        assert_eq!(m[[1, 0]], 4.0);
    }

    #[test]
    fn compressed_variables_decode() {
        let rec = decode(
            &[
                ("a", Fx::Double(vec![1, 1], vec![7.5])),
                ("name", Fx::Char("AOA_1".into())),
            ],
            true,
        );
        assert_eq!(rec["a"], MatValue::Scalar(7.5));
        assert_eq!(rec["name"], MatValue::Text("AOA_1".into()));
    }

    #[test]
    fn singleton_dimensions_are_squeezed() {
        let rec = decode(&[("v", Fx::Double(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]))], false);
        assert_eq!(rec["v"].as_array().unwrap().shape(), &[4]);

        let rec = decode(&[("t", Fx::Double(vec![2, 2, 1], vec![0.0; 4]))], false);
        assert_eq!(rec["t"].as_array().unwrap().shape(), &[2, 2]);
    }

    #[test]
    fn nested_structs_become_records() {
        let rec = decode(
            &[(
                "REG",
                Fx::Struct(vec![
                    ("xywh".into(), Fx::Double(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0])),
                    (
                        "inner".into(),
                        Fx::Struct(vec![("k".into(), Fx::Double(vec![1, 1], vec![2.0]))]),
                    ),
                ]),
            )],
            true,
        );
        let MatValue::Record(reg) = &rec["REG"] else {
            panic!("REG should be a record");
        };
        let MatValue::Record(inner) = &reg["inner"] else {
            panic!("inner should be a record");
        };
        assert_eq!(inner["k"], MatValue::Scalar(2.0));
        assert!(matches!(reg["xywh"], MatValue::Array(_)));
    }

    #[test]
    fn cell_arrays_keep_grid_shape() {
        let items = (0..6)
            .map(|i| Fx::Double(vec![1, 2], vec![i as f64, 0.0]))
            .collect();
        let rec = decode(&[("c", Fx::Cell(vec![2, 3], items))], false);
        let MatValue::Cells(cells) = &rec["c"] else {
            panic!("expected cells");
        };
        assert_eq!(cells.shape(), &[2, 3]);
        // Column-major: item 1 is row 1, column 0.
        assert_eq!(cells[[1, 0]].as_array().unwrap()[[0]], 1.0);
    }

    #[test]
    fn cell_columns_stay_columns() {
        let items = (0..3).map(|i| Fx::Double(vec![1, 1], vec![i as f64])).collect();
        let rec = decode(&[("c", Fx::Cell(vec![3, 1], items))], false);
        let MatValue::Cells(cells) = &rec["c"] else {
            panic!("expected cells");
        };
        assert_eq!(cells.shape(), &[3, 1]);
    }

    #[test]
    fn overflowing_dimensions_are_refused() {
        let huge = i32::MAX as usize;
        let bytes = encode(&[("c", Fx::Cell(vec![huge; 3], vec![]))], false);
        let err = parse(&bytes).unwrap_err();
        assert!(err.contains("overflow"), "{err}");

        // Fits in usize, but far more items than bytes left.
        let bytes = encode(&[("c", Fx::Cell(vec![huge, 2], vec![]))], true);
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn payload_shorter_than_dimensions_is_invalid() {
        let rec = decode(&[("u", Fx::Double(vec![2, 3, 2, 2], vec![1.0; 4]))], false);
        assert!(matches!(&rec["u"], MatValue::Invalid(reason) if reason.contains("[2, 3, 2, 2]")));
        assert!(rec["u"].as_array().is_none());
    }

    #[test]
    fn rejects_hdf5_based_files() {
        let mut bytes = b"MATLAB 7.3 MAT-file".to_vec();
        bytes.resize(HEADER_LEN, b' ');
        let err = parse(&bytes).unwrap_err();
        assert!(err.contains("7.3"));
    }

    #[test]
    fn rejects_truncated_elements() {
        let mut bytes = encode(&[("a", Fx::Double(vec![1, 3], vec![1.0, 2.0, 3.0]))], false);
        bytes.truncate(bytes.len() - 12);
        assert!(parse(&bytes).is_err());
    }
}
