use crate::error::{Result, TrapcamError};
use crate::frame::Frame;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

/// Pull-based producer of ordered frames.
///
/// `Ok(None)` means the stream ended normally. Sequence numbers are assigned
/// by the source and increase monotonically.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

const SUPPORTED_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "pgm", "bmp"];

/// Frame source reading still images from a directory in filename order.
///
/// Offline stand-in for a live camera: frame cadence is decided by the
/// caller, frames are decoded to luma on the way in.
pub struct ImageDirSource {
    paths: std::vec::IntoIter<PathBuf>,
    next_seq: u64,
    dims: Option<(u32, u32)>,
}

impl ImageDirSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if supported {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            warn!("No frames found in {}", dir.display());
        } else {
            info!("Found {} frames in {}", paths.len(), dir.display());
        }

        Ok(Self {
            paths: paths.into_iter(),
            next_seq: 0,
            dims: None,
        })
    }

    /// Frames not yet emitted
    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let path = match self.paths.next() {
            Some(path) => path,
            None => return Ok(None),
        };

        let image = image::open(&path)
            .map_err(|e| {
                TrapcamError::invalid_frame(format!("could not decode {}: {}", path.display(), e))
            })?
            .to_luma8();
        let (width, height) = image.dimensions();

        match self.dims {
            None => self.dims = Some((width, height)),
            Some(dims) if dims != (width, height) => {
                return Err(TrapcamError::invalid_frame(format!(
                    "{} is {}x{} but the stream started at {}x{}",
                    path.display(),
                    width,
                    height,
                    dims.0,
                    dims.1
                )));
            }
            Some(_) => {}
        }

        let frame = Frame::new(self.next_seq, SystemTime::now(), image.into_raw(), width, height);
        self.next_seq += 1;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(dir: &Path, name: &str, value: u8, width: u32, height: u32) {
        let data = vec![value; (width * height) as usize];
        image::save_buffer(
            dir.join(name),
            &data,
            width,
            height,
            image::ColorType::L8,
        )
        .unwrap();
    }

    #[test]
    fn test_reads_frames_in_filename_order() {
        let dir = tempfile::tempdir().unwrap();
        // Written out of order on purpose
        write_png(dir.path(), "frame-0002.png", 20, 8, 8);
        write_png(dir.path(), "frame-0001.png", 10, 8, 8);
        write_png(dir.path(), "frame-0003.png", 30, 8, 8);
        std::fs::write(dir.path().join("notes.txt"), b"not a frame").unwrap();

        let mut source = ImageDirSource::open(dir.path()).unwrap();
        assert_eq!(source.remaining(), 3);

        let mut values = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            values.push((frame.seq, frame.data[0]));
        }
        assert_eq!(values, vec![(0, 10), (1, 20), (2, 30)]);
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 0, 8, 8);
        write_png(dir.path(), "b.png", 0, 4, 4);

        let mut source = ImageDirSource::open(dir.path()).unwrap();
        assert!(source.next_frame().unwrap().is_some());
        assert!(matches!(
            source.next_frame(),
            Err(TrapcamError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_empty_directory_yields_no_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ImageDirSource::open(dir.path()).unwrap();
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_undecodable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not actually a png").unwrap();

        let mut source = ImageDirSource::open(dir.path()).unwrap();
        assert!(matches!(
            source.next_frame(),
            Err(TrapcamError::InvalidFrame { .. })
        ));
    }
}
