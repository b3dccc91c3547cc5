//! RNTBD frames and their little-endian wire layout.
//!
//! ```text
//! u32  frame_length      (includes itself)
//! u16  resource_type
//! u16  operation_type
//! [16] activity_id
//! u32  metadata_length
//!      tokens...
//! u32  payload_length
//!      payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::error::{Result, RntbdError};
use super::metadata::Metadata;
use super::types::{OperationType, ResourceType};

/// Maximum encoded frame size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Fixed header plus the two length fields of an empty frame.
pub const MIN_FRAME_SIZE: usize = 4 + 2 + 2 + 16 + 4 + 4;

/// An immutable request or response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    activity_id: Uuid,
    resource_type: ResourceType,
    operation_type: OperationType,
    metadata: Metadata,
    payload: Bytes,
}

impl Frame {
    pub fn new(
        activity_id: Uuid,
        resource_type: ResourceType,
        operation_type: OperationType,
        metadata: Metadata,
        payload: Bytes,
    ) -> Self {
        Self {
            activity_id,
            resource_type,
            operation_type,
            metadata,
            payload,
        }
    }

    /// Builds the response to `request`, echoing its activity id and types.
    pub fn response(request: &Frame, metadata: Metadata, payload: Bytes) -> Self {
        Self::new(
            request.activity_id,
            request.resource_type,
            request.operation_type,
            metadata,
            payload,
        )
    }

    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_parts(self) -> (Metadata, Bytes) {
        (self.metadata, self.payload)
    }

    /// Appends the encoded frame to `dst`. On error `dst` is left as it was.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        dst.reserve(MIN_FRAME_SIZE + self.payload.len());

        dst.put_u32_le(0);
        dst.put_u16_le(self.resource_type.to_wire());
        dst.put_u16_le(self.operation_type.to_wire());
        dst.put_slice(self.activity_id.as_bytes());

        let metadata_len_at = dst.len();
        dst.put_u32_le(0);
        if let Err(e) = self.metadata.encode(dst) {
            dst.truncate(start);
            return Err(e);
        }
        let metadata_len = dst.len() - metadata_len_at - 4;

        dst.put_u32_le(self.payload.len() as u32);
        dst.put_slice(&self.payload);

        let frame_len = dst.len() - start;
        if frame_len > MAX_FRAME_SIZE {
            dst.truncate(start);
            return Err(RntbdError::MalformedFrame(format!(
                "frame of {} bytes exceeds maximum of {} bytes",
                frame_len, MAX_FRAME_SIZE
            )));
        }

        dst[start..start + 4].copy_from_slice(&(frame_len as u32).to_le_bytes());
        dst[metadata_len_at..metadata_len_at + 4].copy_from_slice(&(metadata_len as u32).to_le_bytes());
        Ok(())
    }

    /// Decodes one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` while fewer bytes than the declared frame length
    /// are buffered; nothing is consumed in that case.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len < MIN_FRAME_SIZE {
            return Err(RntbdError::MalformedFrame(format!(
                "declared length {} is below the minimum of {} bytes",
                frame_len, MIN_FRAME_SIZE
            )));
        }
        if frame_len > MAX_FRAME_SIZE {
            return Err(RntbdError::MalformedFrame(format!(
                "declared length {} exceeds maximum of {} bytes",
                frame_len, MAX_FRAME_SIZE
            )));
        }

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut buf = src.split_to(frame_len).freeze();
        buf.advance(4);

        let resource_type = ResourceType::from_wire(buf.get_u16_le())?;
        let operation_type = OperationType::from_wire(buf.get_u16_le())?;
        let mut raw_id = [0u8; 16];
        buf.copy_to_slice(&mut raw_id);
        let activity_id = Uuid::from_bytes(raw_id);

        let metadata_len = buf.get_u32_le() as usize;
        if metadata_len + 4 > buf.remaining() {
            return Err(RntbdError::MalformedFrame(format!(
                "metadata length {} overruns frame of {} bytes",
                metadata_len, frame_len
            )));
        }
        let metadata_bytes = buf.split_to(metadata_len);
        let metadata = Metadata::decode(&metadata_bytes)?;

        let payload_len = buf.get_u32_le() as usize;
        if payload_len > buf.remaining() {
            return Err(RntbdError::MalformedFrame(format!(
                "payload shorter than declared: {} of {} bytes",
                buf.remaining(),
                payload_len
            )));
        }
        if payload_len < buf.remaining() {
            return Err(RntbdError::MalformedFrame(format!(
                "{} trailing bytes after payload",
                buf.remaining() - payload_len
            )));
        }
        let payload = buf.split_to(payload_len);

        Ok(Some(Frame {
            activity_id,
            resource_type,
            operation_type,
            metadata,
            payload,
        }))
    }
}
