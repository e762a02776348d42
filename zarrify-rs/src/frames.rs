//! Frame stacks: a folder of single-frame images read into one `(n, h, w)`
//! `u8` array, and the reverse export as numbered TIFF files.

use glob::Pattern;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use regex::Regex;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype::Gray8, TiffEncoder};
use tiff::ColorType;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Highest frame number an exported file name can carry.
pub const MAX_FRAME_NUMBER: usize = 9999;

/// Last run of digits in a file stem.
static TRAILING_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\D*$").expect("valid trailing index regex"));

pub struct FrameStack {
    pub files: Vec<PathBuf>,
    /// `None` when no file matched.
    pub stack: Option<Array3<u8>>,
}

/// Files of `dir` whose name matches the glob `pattern`, ordered by the
/// trailing number in their stem, then by name.
pub fn list_frames(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = Pattern::new(pattern)?;
    let mut keyed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !pattern.matches(&name) {
            continue;
        }
        let stem = Path::new(&name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let index = TRAILING_INDEX
            .captures(&stem)
            .and_then(|cap| cap[1].parse::<u64>().ok());
        keyed.push(((index.is_none(), index, name), entry.path()));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed.into_iter().map(|(_, path)| path).collect())
}

fn is_tiff(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let e = e.to_string_lossy().to_ascii_lowercase();
            e == "tif" || e == "tiff"
        })
        .unwrap_or(false)
}

fn image_error(path: &Path, message: impl ToString) -> Error {
    Error::Image {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Grey TIFF samples cast to `u8` (values above 255 wrap). Colour TIFFs are
/// left to the generic decoder.
fn read_tiff_frame(path: &Path) -> Result<Option<Array2<u8>>> {
    let file = fs::File::open(path)?;
    let mut decoder = Decoder::new(file).map_err(|e| image_error(path, e))?;
    if !matches!(decoder.colortype().map_err(|e| image_error(path, e))?, ColorType::Gray(_)) {
        return Ok(None);
    }
    let (width, height) = decoder.dimensions().map_err(|e| image_error(path, e))?;
    let pixels: Vec<u8> = match decoder.read_image().map_err(|e| image_error(path, e))? {
        DecodingResult::U8(v) => v,
        DecodingResult::U16(v) => v.into_iter().map(|p| p as u8).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|p| p as u8).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|p| p as u8).collect(),
        DecodingResult::I8(v) => v.into_iter().map(|p| p as u8).collect(),
        DecodingResult::I16(v) => v.into_iter().map(|p| p as u8).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|p| p as u8).collect(),
        DecodingResult::F32(v) => v.into_iter().map(|p| p as u8).collect(),
        DecodingResult::F64(v) => v.into_iter().map(|p| p as u8).collect(),
        _ => return Err(image_error(path, "unsupported TIFF sample format")),
    };
    Array2::from_shape_vec((height as usize, width as usize), pixels)
        .map(Some)
        .map_err(|e| image_error(path, e))
}

fn read_image_frame(path: &Path) -> Result<Array2<u8>> {
    let luma = image::open(path).map_err(|e| image_error(path, e))?.to_luma8();
    let (width, height) = luma.dimensions();
    Array2::from_shape_vec((height as usize, width as usize), luma.into_raw())
        .map_err(|e| image_error(path, e))
}

/// Decode one frame as a 2-D `u8` array.
pub fn read_frame(path: &Path) -> Result<Array2<u8>> {
    if is_tiff(path) {
        if let Some(frame) = read_tiff_frame(path)? {
            return Ok(frame);
        }
    }
    read_image_frame(path)
}

/// Load every frame of `dir` matching `pattern`.
pub fn load_stack(dir: &Path, pattern: &str, progress: impl Fn(f64, &str)) -> Result<FrameStack> {
    let files = list_frames(dir, pattern)?;
    info!(dir = %dir.display(), pattern, count = files.len(), "found frames");
    if files.is_empty() {
        return Ok(FrameStack { files, stack: None });
    }

    let total = files.len();
    let mut stack: Option<Array3<u8>> = None;
    for (i, path) in files.iter().enumerate() {
        let frame = read_frame(path)?;
        let stack = stack.get_or_insert_with(|| {
            let (h, w) = frame.dim();
            Array3::zeros((total, h, w))
        });
        let expected = (stack.shape()[1], stack.shape()[2]);
        if frame.dim() != expected {
            return Err(Error::Shape(format!(
                "{} is {:?}, previous frames are {:?}",
                path.display(),
                frame.dim(),
                expected
            )));
        }
        stack.index_axis_mut(Axis(0), i).assign(&frame);
        progress(
            (i + 1) as f64 / total as f64,
            &format!("Loading frames {}/{}", i + 1, total),
        );
    }
    Ok(FrameStack { files, stack })
}

/// File name of exported frame `number` (1-based).
pub fn frame_file_name(base_name: &str, number: usize) -> Result<String> {
    if number > MAX_FRAME_NUMBER {
        return Err(Error::Shape(format!(
            "frame number {number} does not fit in four digits"
        )));
    }
    Ok(format!("{base_name}_{number:04}.tif"))
}

fn write_tiff_frame(path: &Path, frame: ArrayView2<u8>) -> Result<()> {
    let (h, w) = frame.dim();
    let pixels: Vec<u8> = frame.iter().copied().collect();
    let mut writer = BufWriter::new(fs::File::create(path)?);
    let mut encoder = TiffEncoder::new(&mut writer).map_err(|e| image_error(path, e))?;
    encoder
        .write_image::<Gray8>(w as u32, h as u32, &pixels)
        .map_err(|e| image_error(path, e))?;
    Ok(())
}

/// Write each frame of `stack` as `<base_name>_<NNNN>.tif` in `dir`.
pub fn save_stack(
    dir: &Path,
    base_name: &str,
    stack: &Array3<u8>,
    progress: impl Fn(f64, &str),
) -> Result<Vec<PathBuf>> {
    let total = stack.shape()[0];
    // Fail before writing anything.
    frame_file_name(base_name, total)?;
    fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(total);
    for (i, frame) in stack.axis_iter(Axis(0)).enumerate() {
        let path = dir.join(frame_file_name(base_name, i + 1)?);
        write_tiff_frame(&path, frame)?;
        debug!(file = %path.display(), "frame exported");
        written.push(path);
        progress(
            (i + 1) as f64 / total as f64,
            &format!("Exporting frames {}/{}", i + 1, total),
        );
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use tiff::encoder::colortype::Gray16;

    fn write_png(path: &Path, w: u32, h: u32, value: u8) {
        GrayImage::from_pixel(w, h, Luma([value])).save(path).unwrap();
    }

    fn file_names(files: &[PathBuf]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn frames_sort_by_embedded_number() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["seg_10.png", "seg_9.png", "seg_1.png", "seg_b.png", "seg_a.png", "roi_1.png"] {
            write_png(&dir.path().join(name), 2, 2, 0);
        }
        let files = list_frames(dir.path(), "seg*.png").unwrap();
        assert_eq!(
            file_names(&files),
            ["seg_1.png", "seg_9.png", "seg_10.png", "seg_a.png", "seg_b.png"]
        );
    }

    #[test]
    fn last_number_in_stem_is_the_index() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["t2_seg10.png", "t9_seg2.png", "t1_seg3_final.png"] {
            write_png(&dir.path().join(name), 2, 2, 0);
        }
        let first = list_frames(dir.path(), "*.png").unwrap();
        assert_eq!(
            file_names(&first),
            ["t9_seg2.png", "t1_seg3_final.png", "t2_seg10.png"]
        );
        assert_eq!(list_frames(dir.path(), "*.png").unwrap(), first);
    }

    #[test]
    fn no_match_gives_no_stack() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_stack(dir.path(), "*.tif", |_, _| {}).unwrap();
        assert!(loaded.files.is_empty());
        assert!(loaded.stack.is_none());
    }

    #[test]
    fn png_stack_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("seg_2.png"), 3, 2, 20);
        write_png(&dir.path().join("seg_1.png"), 3, 2, 10);
        let stack = load_stack(dir.path(), "seg*.png", |_, _| {}).unwrap().stack.unwrap();
        assert_eq!(stack.shape(), &[2, 2, 3]);
        assert_eq!(stack[[0, 1, 2]], 10);
        assert_eq!(stack[[1, 0, 0]], 20);
    }

    #[test]
    fn colour_frames_become_luma() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(2, 2, Rgb([200, 200, 200]))
            .save(dir.path().join("roi_1.png"))
            .unwrap();
        let stack = load_stack(dir.path(), "roi*.png", |_, _| {}).unwrap().stack.unwrap();
        assert_eq!(stack[[0, 0, 0]], 200);
    }

    #[test]
    fn mismatched_frame_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a_1.png"), 3, 2, 0);
        write_png(&dir.path().join("a_2.png"), 2, 2, 0);
        assert!(matches!(
            load_stack(dir.path(), "*.png", |_, _| {}),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn sixteen_bit_tiff_wraps_to_u8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw_1.tif");
        let mut file = fs::File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(&mut file).unwrap();
        encoder.write_image::<Gray16>(2, 1, &[300u16, 7]).unwrap();
        let frame = read_frame(&path).unwrap();
        assert_eq!(frame.as_slice().unwrap(), &[44, 7]);
    }

    #[test]
    fn export_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let stack = Array3::from_shape_fn((3, 2, 4), |(f, y, x)| (f * 50 + y * 4 + x) as u8);
        let written = save_stack(dir.path(), "wing", &stack, |_, _| {}).unwrap();
        assert_eq!(
            file_names(&written),
            ["wing_0001.tif", "wing_0002.tif", "wing_0003.tif"]
        );
        let back = load_stack(dir.path(), "*.tif", |_, _| {}).unwrap().stack.unwrap();
        assert_eq!(back, stack);
    }

    #[test]
    fn frame_numbers_are_four_digits() {
        assert_eq!(frame_file_name("a", 1).unwrap(), "a_0001.tif");
        assert_eq!(frame_file_name("a", 9999).unwrap(), "a_9999.tif");
        assert!(frame_file_name("a", 10000).is_err());
    }
}
