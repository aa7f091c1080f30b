// Low-level frame IO over the read half of a connection.
use bytes::BytesMut;
use quill_wire::Frame;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use crate::error::{Error, Result};

/// Read one frame: `[u32 length][u32 frame type][payload]`.
///
/// Any short or failed read maps to `Error::Dropped`; a length outside the
/// valid range or an unknown frame type is a protocol error. The scratch
/// buffer is reused to avoid per-frame allocations.
pub(crate) async fn read_frame(
    reader: &mut OwnedReadHalf,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Frame> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let length = u32::from_be_bytes(len_bytes) as usize;
    if length < 4 {
        return Err(Error::Protocol(format!(
            "frame length {length} below minimum"
        )));
    }
    if length > max_frame_bytes {
        return Err(Error::Protocol(format!(
            "frame too large: {length} bytes (cap {max_frame_bytes})"
        )));
    }
    let mut type_bytes = [0u8; 4];
    reader.read_exact(&mut type_bytes).await?;
    let frame_type = u32::from_be_bytes(type_bytes);

    scratch.clear();
    scratch.resize(length - 4, 0u8);
    reader.read_exact(&mut scratch[..]).await?;
    let payload = scratch.split().freeze();

    Frame::decode(frame_type, payload).map_err(Error::from)
}
