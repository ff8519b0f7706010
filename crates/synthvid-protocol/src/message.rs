//! Synthvid message envelope and payload codec.
//!
//! Every message is framed as:
//!
//! ```text
//! pipe header { type: u32, size: u32 }   // type == PIPE_MESSAGE_DATA, size == gfx.size
//! gfx header  { type: u32, size: u32 }   // size == 8 + payload length
//! payload
//! ```
//!
//! All integers are little-endian and payload structs are packed.

use thiserror::Error;

use crate::version::ProtocolVersion;

/// Pipe message type for data packets. Every other pipe type is rejected.
pub const PIPE_MESSAGE_DATA: u32 = 1;

pub const PIPE_HEADER_LEN: usize = 8;
pub const GFX_HEADER_LEN: usize = 8;
pub const ENVELOPE_LEN: usize = PIPE_HEADER_LEN + GFX_HEADER_LEN;

/// Offset of `gfx.size` from the start of the message. Inbound messages whose pipe size is
/// smaller than this are rejected before the gfx header is looked at.
pub const GFX_SIZE_FIELD_OFFSET: u32 = 12;

/// Transaction IDs are this base plus the expected response [`MessageType`].
pub const REQUEST_TRANSACTION_BASE_ID: u64 = 0xCAFE_0000;

// Maximum supported cursor is 96x96 pixels in 32-bit ARGB.
pub const CURSOR_MAX_WIDTH: u32 = 96;
pub const CURSOR_MAX_HEIGHT: u32 = 96;
pub const CURSOR_ARGB_PIXEL_SIZE: u32 = 4;
pub const CURSOR_MAX_SIZE: usize =
    (CURSOR_MAX_WIDTH * CURSOR_MAX_HEIGHT * CURSOR_ARGB_PIXEL_SIZE) as usize;

/// `part_index` value meaning "this message carries the whole cursor".
pub const CURSOR_PART_COMPLETE: u8 = 0xFF;

pub const CURSOR_SHAPE_HEADER_LEN: usize = 18;
pub const CURSOR_SHAPE_DATA_OFFSET: usize = ENVELOPE_LEN + CURSOR_SHAPE_HEADER_LEN;
pub const MAX_CURSOR_SHAPE_PACKET_LEN: usize = CURSOR_SHAPE_DATA_OFFSET + CURSOR_MAX_SIZE;

/// Rectangle and output counts are carried in a `u8`.
pub const MAX_IMAGE_UPDATE_RECTS: usize = u8::MAX as usize;
pub const MAX_VIDEO_OUTPUTS: usize = u8::MAX as usize;

const VIDEO_OUTPUT_SITUATION_LEN: usize = 18;
const RECT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Error = 0,
    VersionRequest = 1,
    VersionResponse = 2,
    VramLocation = 3,
    VramAck = 4,
    ResolutionUpdate = 5,
    ResolutionUpdateAck = 6,
    CursorPosition = 7,
    CursorShape = 8,
    FeatureChange = 9,
    ImageUpdate = 10,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Error,
            1 => Self::VersionRequest,
            2 => Self::VersionResponse,
            3 => Self::VramLocation,
            4 => Self::VramAck,
            5 => Self::ResolutionUpdate,
            6 => Self::ResolutionUpdateAck,
            7 => Self::CursorPosition,
            8 => Self::CursorShape,
            9 => Self::FeatureChange,
            10 => Self::ImageUpdate,
            _ => return None,
        })
    }

    /// Correlation key for a transaction that waits on a response of this type.
    pub const fn transaction_id(self) -> u64 {
        REQUEST_TRANSACTION_BASE_ID + self as u64
    }

    /// Whether this type completes a pending request rather than arriving unsolicited.
    pub const fn is_response(self) -> bool {
        matches!(
            self,
            Self::VersionResponse | Self::VramAck | Self::ResolutionUpdateAck
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message too short: {len} < {min}")]
    TooShort { len: usize, min: usize },
    #[error("unexpected pipe message type 0x{0:x}")]
    BadPipeType(u32),
    #[error("pipe size {0} is smaller than the gfx header")]
    PipeSizeTooSmall(u32),
    #[error("invalid gfx header size {0}")]
    BadGfxSize(u32),
    #[error("truncated message: gfx size {gfx_size} but only {available} bytes follow the pipe header")]
    Truncated { gfx_size: u32, available: usize },
    #[error("unsupported message type 0x{0:x}")]
    UnsupportedMessageType(u32),
    #[error("payload too short: need {needed} bytes, have {len}")]
    PayloadTooShort { needed: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("buffer too small: need {needed} bytes, have {len}")]
    BufferTooSmall { needed: usize, len: usize },
    #[error("too many entries: {count} > {max}")]
    TooManyEntries { count: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRequest {
    pub version: ProtocolVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionResponse {
    pub version: ProtocolVersion,
    pub accepted: bool,
    pub max_video_outputs: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VramLocation {
    /// Opaque token echoed back in [`VramAck::context`].
    pub context: u64,
    pub is_specified: bool,
    pub vram_gpa: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VramAck {
    pub context: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoOutputSituation {
    pub active: bool,
    pub vram_offset: u32,
    pub depth: u8,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionUpdate {
    pub context: u64,
    pub outputs: Vec<VideoOutputSituation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionUpdateAck {
    pub context: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPosition {
    pub is_visible: bool,
    pub video_output: u8,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorShapeHeader {
    pub part_index: u8,
    pub is_argb: bool,
    pub width: u32,
    pub height: u32,
    pub hot_x: u32,
    pub hot_y: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorShape {
    pub header: CursorShapeHeader,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpdate {
    pub video_output: u8,
    pub rects: Vec<Rect>,
}

/// Unsolicited host request to re-send one or more pieces of display state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureChange {
    pub needs_image: bool,
    pub needs_cursor_position: bool,
    pub needs_cursor_shape: bool,
    pub needs_resolution: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthVideoMessage {
    VersionRequest(VersionRequest),
    VersionResponse(VersionResponse),
    VramLocation(VramLocation),
    VramAck(VramAck),
    ResolutionUpdate(ResolutionUpdate),
    ResolutionUpdateAck(ResolutionUpdateAck),
    CursorPosition(CursorPosition),
    CursorShape(CursorShape),
    FeatureChange(FeatureChange),
    ImageUpdate(ImageUpdate),
}

/// A validated envelope borrowed from an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// Raw gfx message type; may not be a known [`MessageType`].
    pub message_type: u32,
    pub gfx_size: u32,
    pub payload: &'a [u8],
}

/// Validates the pipe and gfx headers of an inbound packet.
pub fn parse_envelope(packet: &[u8]) -> Result<Envelope<'_>, DecodeError> {
    let mut reader = Reader::new(packet);
    let pipe_type = reader.u32().map_err(|_| DecodeError::TooShort {
        len: packet.len(),
        min: PIPE_HEADER_LEN,
    })?;
    let pipe_size = reader.u32().map_err(|_| DecodeError::TooShort {
        len: packet.len(),
        min: PIPE_HEADER_LEN,
    })?;

    if pipe_type != PIPE_MESSAGE_DATA {
        return Err(DecodeError::BadPipeType(pipe_type));
    }
    if pipe_size < GFX_SIZE_FIELD_OFFSET {
        return Err(DecodeError::PipeSizeTooSmall(pipe_size));
    }
    if packet.len() < ENVELOPE_LEN {
        return Err(DecodeError::TooShort {
            len: packet.len(),
            min: ENVELOPE_LEN,
        });
    }

    let message_type = reader.u32()?;
    let gfx_size = reader.u32()?;
    if (gfx_size as usize) < GFX_HEADER_LEN {
        return Err(DecodeError::BadGfxSize(gfx_size));
    }
    let available = packet.len() - PIPE_HEADER_LEN;
    let end = PIPE_HEADER_LEN
        .checked_add(gfx_size as usize)
        .filter(|_| gfx_size as usize <= available)
        .ok_or(DecodeError::Truncated {
            gfx_size,
            available,
        })?;

    Ok(Envelope {
        message_type,
        gfx_size,
        payload: &packet[ENVELOPE_LEN..end],
    })
}

impl SynthVideoMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::VersionRequest(_) => MessageType::VersionRequest,
            Self::VersionResponse(_) => MessageType::VersionResponse,
            Self::VramLocation(_) => MessageType::VramLocation,
            Self::VramAck(_) => MessageType::VramAck,
            Self::ResolutionUpdate(_) => MessageType::ResolutionUpdate,
            Self::ResolutionUpdateAck(_) => MessageType::ResolutionUpdateAck,
            Self::CursorPosition(_) => MessageType::CursorPosition,
            Self::CursorShape(_) => MessageType::CursorShape,
            Self::FeatureChange(_) => MessageType::FeatureChange,
            Self::ImageUpdate(_) => MessageType::ImageUpdate,
        }
    }

    /// Encodes the message including both headers.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut payload = Writer::default();
        match self {
            Self::VersionRequest(msg) => payload.u32(msg.version.to_wire()),
            Self::VersionResponse(msg) => {
                payload.u32(msg.version.to_wire());
                payload.u8(msg.accepted.into());
                payload.u8(msg.max_video_outputs);
            }
            Self::VramLocation(msg) => {
                payload.u64(msg.context);
                payload.u8(msg.is_specified.into());
                payload.u64(msg.vram_gpa);
            }
            Self::VramAck(VramAck { context })
            | Self::ResolutionUpdateAck(ResolutionUpdateAck { context }) => payload.u64(*context),
            Self::ResolutionUpdate(msg) => {
                payload.u64(msg.context);
                payload.u8(count_u8(msg.outputs.len(), MAX_VIDEO_OUTPUTS)?);
                for output in &msg.outputs {
                    payload.u8(output.active.into());
                    payload.u32(output.vram_offset);
                    payload.u8(output.depth);
                    payload.u32(output.width);
                    payload.u32(output.height);
                    payload.u32(output.pitch);
                }
            }
            Self::CursorPosition(msg) => {
                payload.u8(msg.is_visible.into());
                payload.u8(msg.video_output);
                payload.i32(msg.x);
                payload.i32(msg.y);
            }
            Self::CursorShape(msg) => {
                write_cursor_shape_header(&mut payload, &msg.header);
                payload.bytes(&msg.data);
            }
            Self::FeatureChange(msg) => {
                payload.u8(msg.needs_image.into());
                payload.u8(msg.needs_cursor_position.into());
                payload.u8(msg.needs_cursor_shape.into());
                payload.u8(msg.needs_resolution.into());
            }
            Self::ImageUpdate(msg) => {
                payload.u8(msg.video_output);
                payload.u8(count_u8(msg.rects.len(), MAX_IMAGE_UPDATE_RECTS)?);
                for rect in &msg.rects {
                    payload.i32(rect.x1);
                    payload.i32(rect.y1);
                    payload.i32(rect.x2);
                    payload.i32(rect.y2);
                }
            }
        }

        let mut out = vec![0u8; ENVELOPE_LEN + payload.0.len()];
        write_envelope(&mut out, self.message_type(), payload.0.len());
        out[ENVELOPE_LEN..].copy_from_slice(&payload.0);
        Ok(out)
    }

    /// Decodes a complete packet, validating the envelope first.
    pub fn decode(packet: &[u8]) -> Result<Self, DecodeError> {
        let envelope = parse_envelope(packet)?;
        let message_type = MessageType::from_u32(envelope.message_type)
            .ok_or(DecodeError::UnsupportedMessageType(envelope.message_type))?;
        Self::decode_payload(message_type, envelope.payload)
    }

    pub fn decode_payload(message_type: MessageType, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let msg = match message_type {
            MessageType::Error => {
                return Err(DecodeError::UnsupportedMessageType(message_type as u32))
            }
            MessageType::VersionRequest => Self::VersionRequest(VersionRequest {
                version: ProtocolVersion::from_wire(r.u32()?),
            }),
            MessageType::VersionResponse => Self::VersionResponse(VersionResponse {
                version: ProtocolVersion::from_wire(r.u32()?),
                accepted: r.u8()? != 0,
                max_video_outputs: r.u8()?,
            }),
            MessageType::VramLocation => Self::VramLocation(VramLocation {
                context: r.u64()?,
                is_specified: r.u8()? != 0,
                vram_gpa: r.u64()?,
            }),
            MessageType::VramAck => Self::VramAck(VramAck { context: r.u64()? }),
            MessageType::ResolutionUpdate => {
                let context = r.u64()?;
                let count = usize::from(r.u8()?);
                r.ensure(count * VIDEO_OUTPUT_SITUATION_LEN)?;
                let mut outputs = Vec::with_capacity(count);
                for _ in 0..count {
                    outputs.push(VideoOutputSituation {
                        active: r.u8()? != 0,
                        vram_offset: r.u32()?,
                        depth: r.u8()?,
                        width: r.u32()?,
                        height: r.u32()?,
                        pitch: r.u32()?,
                    });
                }
                Self::ResolutionUpdate(ResolutionUpdate { context, outputs })
            }
            MessageType::ResolutionUpdateAck => {
                Self::ResolutionUpdateAck(ResolutionUpdateAck { context: r.u64()? })
            }
            MessageType::CursorPosition => Self::CursorPosition(CursorPosition {
                is_visible: r.u8()? != 0,
                video_output: r.u8()?,
                x: r.i32()?,
                y: r.i32()?,
            }),
            MessageType::CursorShape => {
                let header = CursorShapeHeader {
                    part_index: r.u8()?,
                    is_argb: r.u8()? != 0,
                    width: r.u32()?,
                    height: r.u32()?,
                    hot_x: r.u32()?,
                    hot_y: r.u32()?,
                };
                Self::CursorShape(CursorShape {
                    header,
                    data: r.rest().to_vec(),
                })
            }
            MessageType::FeatureChange => Self::FeatureChange(FeatureChange {
                needs_image: r.u8()? != 0,
                needs_cursor_position: r.u8()? != 0,
                needs_cursor_shape: r.u8()? != 0,
                needs_resolution: r.u8()? != 0,
            }),
            MessageType::ImageUpdate => {
                let video_output = r.u8()?;
                let count = usize::from(r.u8()?);
                r.ensure(count * RECT_LEN)?;
                let mut rects = Vec::with_capacity(count);
                for _ in 0..count {
                    rects.push(Rect {
                        x1: r.i32()?,
                        y1: r.i32()?,
                        x2: r.i32()?,
                        y2: r.i32()?,
                    });
                }
                Self::ImageUpdate(ImageUpdate {
                    video_output,
                    rects,
                })
            }
        };
        Ok(msg)
    }
}

/// Writes a cursor-shape envelope and header into `buf`, leaving the pixel data region
/// (`buf[CURSOR_SHAPE_DATA_OFFSET..][..data_len]`) untouched for the caller to fill.
///
/// Returns the total packet length.
pub fn encode_cursor_shape_in_place(
    buf: &mut [u8],
    header: &CursorShapeHeader,
    data_len: usize,
) -> Result<usize, EncodeError> {
    let total = CURSOR_SHAPE_DATA_OFFSET + data_len;
    if buf.len() < total {
        return Err(EncodeError::BufferTooSmall {
            needed: total,
            len: buf.len(),
        });
    }

    write_envelope(buf, MessageType::CursorShape, CURSOR_SHAPE_HEADER_LEN + data_len);
    let mut shape = Writer::default();
    write_cursor_shape_header(&mut shape, header);
    buf[ENVELOPE_LEN..CURSOR_SHAPE_DATA_OFFSET].copy_from_slice(&shape.0);
    Ok(total)
}

fn write_envelope(buf: &mut [u8], message_type: MessageType, payload_len: usize) {
    let gfx_size = (GFX_HEADER_LEN + payload_len) as u32;
    buf[0..4].copy_from_slice(&PIPE_MESSAGE_DATA.to_le_bytes());
    buf[4..8].copy_from_slice(&gfx_size.to_le_bytes());
    buf[8..12].copy_from_slice(&(message_type as u32).to_le_bytes());
    buf[12..16].copy_from_slice(&gfx_size.to_le_bytes());
}

fn write_cursor_shape_header(w: &mut Writer, header: &CursorShapeHeader) {
    w.u8(header.part_index);
    w.u8(header.is_argb.into());
    w.u32(header.width);
    w.u32(header.height);
    w.u32(header.hot_x);
    w.u32(header.hot_y);
}

fn count_u8(count: usize, max: usize) -> Result<u8, EncodeError> {
    u8::try_from(count)
        .ok()
        .filter(|_| count <= max)
        .ok_or(EncodeError::TooManyEntries { count, max })
}

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn ensure(&self, n: usize) -> Result<(), DecodeError> {
        let needed = self.pos.saturating_add(n);
        if needed > self.buf.len() {
            return Err(DecodeError::PayloadTooShort {
                needed,
                len: self.buf.len(),
            });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}
