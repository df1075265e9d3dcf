use bytes::{BufMut, Bytes, BytesMut};
use opencv::{
    core::{Mat, Vector},
    imgcodecs,
    prelude::*,
};
use thiserror::Error;

pub const FRAME_BOUNDARY: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(#[from] opencv::Error),
    #[error("Encoder produced no data")]
    Empty,
}

/// JPEG-encodes a frame. `quality` is clamped to `1..=100`.
pub fn encode_jpeg(mat: &Mat, quality: i32) -> Result<Vec<u8>, EncodeError> {
    if mat.empty() {
        return Err(EncodeError::Empty);
    }
    let params = Vector::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, quality.clamp(1, 100)]);
    let mut buf = Vector::<u8>::new();
    imgcodecs::imencode(".jpg", mat, &mut buf, &params)?;
    if buf.is_empty() {
        return Err(EncodeError::Empty);
    }
    Ok(buf.into())
}

/// Wraps one JPEG payload as a `multipart/x-mixed-replace` part.
pub fn frame_chunk(jpeg: &[u8]) -> Bytes {
    let mut chunk = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + PART_TRAILER.len());
    chunk.put_slice(PART_HEADER);
    chunk.put_slice(jpeg);
    chunk.put_slice(PART_TRAILER);
    chunk.freeze()
}
