use opencv::{core::Mat, prelude::*, videoio};
use std::{num::NonZeroU32, path::Path};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Failed to open video: {0}")]
    OpenFailed(String),
    #[error("Failed to decode frame {index}: {source}")]
    DecodeFailed {
        index: u64,
        #[source]
        source: opencv::Error,
    },
}

#[derive(Error, Debug, PartialEq)]
#[error("frame_skip must be >= 1, got {0}")]
pub struct InvalidStride(pub i64);

/// Forward every Nth decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStride(NonZeroU32);

impl FrameStride {
    pub fn new(n: i64) -> Result<Self, InvalidStride> {
        u32::try_from(n)
            .ok()
            .and_then(NonZeroU32::new)
            .map(Self)
            .ok_or(InvalidStride(n))
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }

    pub fn selects(&self, index: u64) -> bool {
        index % self.get() as u64 == 0
    }
}

/// A decoded frame chosen for inference. `index` is the 1-based position of
/// the frame in the source.
#[derive(Debug)]
pub struct SampledFrame<F> {
    pub index: u64,
    pub frame: F,
}

/// A sequential, non-seekable source of decoded frames.
pub trait FrameSource: Send {
    type Frame: Send + 'static;

    /// `Ok(None)` marks end of stream.
    fn read_frame(&mut self) -> Result<Option<Self::Frame>, SamplerError>;

    /// Releases the underlying handle. Must be idempotent.
    fn release(&mut self);
}

pub trait VideoOpener: Send + Sync + 'static {
    type Source: FrameSource + 'static;

    fn open(&self, path: &Path) -> Result<Self::Source, SamplerError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCvOpener;

impl VideoOpener for OpenCvOpener {
    type Source = VideoSource;

    fn open(&self, path: &Path) -> Result<VideoSource, SamplerError> {
        VideoSource::open(path)
    }
}

pub struct VideoSource {
    capture: videoio::VideoCapture,
    decoded: u64,
    released: bool,
}

impl VideoSource {
    pub fn open(path: &Path) -> Result<Self, SamplerError> {
        let filename = path
            .to_str()
            .ok_or_else(|| SamplerError::OpenFailed(format!("non UTF-8 path {:?}", path)))?;
        let capture = videoio::VideoCapture::from_file(filename, videoio::CAP_ANY)
            .map_err(|e| SamplerError::OpenFailed(e.to_string()))?;
        let opened = capture
            .is_opened()
            .map_err(|e| SamplerError::OpenFailed(e.to_string()))?;
        if !opened {
            return Err(SamplerError::OpenFailed(
                "file is not a readable video".to_string(),
            ));
        }

        tracing::debug!("Opened video source {:?}", path);
        Ok(Self {
            capture,
            decoded: 0,
            released: false,
        })
    }
}

impl FrameSource for VideoSource {
    type Frame = Mat;

    fn read_frame(&mut self) -> Result<Option<Mat>, SamplerError> {
        if self.released {
            return Ok(None);
        }
        let mut frame = Mat::default();
        let grabbed = self
            .capture
            .read(&mut frame)
            .map_err(|source| SamplerError::DecodeFailed {
                index: self.decoded + 1,
                source,
            })?;
        if !grabbed || frame.empty() {
            return Ok(None);
        }
        self.decoded += 1;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.capture.release() {
            tracing::warn!("Failed to release video capture: {}", e);
        }
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Decodes every frame of `source` in order and yields only the frames whose
/// 1-based index is a multiple of the stride.
pub struct FrameSampler<S: FrameSource> {
    source: S,
    stride: FrameStride,
    decoded: u64,
}

impl<S: FrameSource> FrameSampler<S> {
    pub fn new(source: S, stride: FrameStride) -> Self {
        Self {
            source,
            stride,
            decoded: 0,
        }
    }

    pub fn next_sampled(&mut self) -> Result<Option<SampledFrame<S::Frame>>, SamplerError> {
        loop {
            let Some(frame) = self.source.read_frame()? else {
                return Ok(None);
            };
            self.decoded += 1;
            if self.stride.selects(self.decoded) {
                return Ok(Some(SampledFrame {
                    index: self.decoded,
                    frame,
                }));
            }
        }
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    pub fn release(&mut self) {
        self.source.release();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Yields `1..=total` and then end of stream.
    pub(crate) struct CountingSource {
        pub next: u64,
        pub total: u64,
        pub released: bool,
    }

    impl CountingSource {
        pub(crate) fn new(total: u64) -> Self {
            Self {
                next: 0,
                total,
                released: false,
            }
        }
    }

    impl FrameSource for CountingSource {
        type Frame = u64;

        fn read_frame(&mut self) -> Result<Option<u64>, SamplerError> {
            if self.released || self.next >= self.total {
                return Ok(None);
            }
            self.next += 1;
            Ok(Some(self.next))
        }

        fn release(&mut self) {
            self.released = true;
        }
    }

    fn sampled_indices(total: u64, stride: i64) -> Vec<u64> {
        let mut sampler =
            FrameSampler::new(CountingSource::new(total), FrameStride::new(stride).unwrap());
        let mut indices = Vec::new();
        while let Some(sampled) = sampler.next_sampled().unwrap() {
            assert_eq!(sampled.index, sampled.frame);
            indices.push(sampled.index);
        }
        assert_eq!(sampler.decoded(), total);
        indices
    }

    #[test]
    fn test_ten_frames_stride_three() {
        assert_eq!(sampled_indices(10, 3), vec![3, 6, 9]);
    }

    #[test]
    fn test_forwarded_count_is_floor_of_total_over_stride() {
        for total in [0u64, 1, 2, 7, 30, 31] {
            for stride in 1..=7i64 {
                let indices = sampled_indices(total, stride);
                assert_eq!(indices.len() as u64, total / stride as u64);
                assert!(indices.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    #[test]
    fn test_stride_one_forwards_everything() {
        assert_eq!(sampled_indices(4, 1), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_non_positive_stride_is_rejected() {
        assert_eq!(FrameStride::new(0), Err(InvalidStride(0)));
        assert_eq!(FrameStride::new(-3), Err(InvalidStride(-3)));
        assert!(FrameStride::new(i64::MAX).is_err());
    }

    #[test]
    fn test_release_ends_stream() {
        let mut sampler =
            FrameSampler::new(CountingSource::new(10), FrameStride::new(1).unwrap());
        assert!(sampler.next_sampled().unwrap().is_some());

        sampler.release();

        assert!(sampler.next_sampled().unwrap().is_none());
    }

    #[test]
    fn test_opening_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_video.mp4");
        std::fs::write(&path, b"definitely not a video container").unwrap();

        assert!(matches!(
            VideoSource::open(&path),
            Err(SamplerError::OpenFailed(_))
        ));
    }
}
