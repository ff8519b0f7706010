//! The synthvid protocol engine.
//!
//! [`SynthVideoDevice`] owns all mutable display state and talks to the host through a
//! [`Transport`]. It is single-threaded: concurrent callers go through
//! [`crate::SynthVideoWorker`], which serializes every call onto one thread.

use std::sync::Arc;

use synthvid_protocol::{
    parse_envelope, FeatureChange, ImageUpdate, MessageType, ProtocolVersion, ResolutionUpdate,
    SynthVideoMessage, VersionRequest, VideoOutputSituation, VramLocation, SUPPORTED_VERSIONS,
};

use crate::channel::{Transport, TransportError};
use crate::config::SynthVideoConfig;
use crate::cursor::{CursorImage, CursorState};
use crate::dirty::DirtyTracker;
use crate::error::{GfxError, Result};
use crate::modes::{build_mode_catalog, validate_mode, DisplayMode};

/// Guest physical address the hypervisor reserves for the framebuffer.
pub const HYPERV_VRAM_BASE: u64 = 0xF800_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    VersionNegotiated,
    MemoryConfigured,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMemoryRegion {
    pub base: u64,
    pub length: u64,
    /// Whether the driver allocated the range itself. The reserved range is never freed.
    pub allocated: bool,
}

/// The mode currently programmed on the single video output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenState {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub depth: u8,
}

/// What the platform needs to know once graphics are up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsInfo {
    pub version: ProtocolVersion,
    pub vram_base: u64,
    pub vram_length: u64,
}

/// Point-in-time copy of the engine state, for callers on other threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub state: DeviceState,
    pub version: Option<ProtocolVersion>,
    pub vram: Option<VideoMemoryRegion>,
    pub screen: Option<ScreenState>,
    pub modes: Vec<DisplayMode>,
    pub cursor_x: i32,
    pub cursor_y: i32,
    pub cursor_visible: bool,
    pub dirty: bool,
}

/// Routes one inbound packet.
///
/// Responses complete the matching pending transaction on `transport`. A feature change is
/// returned to the caller. Anything else, including malformed packets, is dropped.
pub fn dispatch_inbound<T: Transport + ?Sized>(
    transport: &T,
    packet: &[u8],
) -> Option<FeatureChange> {
    let envelope = match parse_envelope(packet) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::debug!(len = packet.len(), "dropping inbound packet: {err}");
            return None;
        }
    };
    let Some(message_type) = MessageType::from_u32(envelope.message_type) else {
        tracing::debug!(
            message_type = envelope.message_type,
            "dropping unknown inbound message"
        );
        return None;
    };

    if message_type.is_response() {
        if !transport.complete_transaction(message_type.transaction_id(), packet) {
            tracing::debug!(?message_type, "response with no pending request");
        }
        return None;
    }

    match SynthVideoMessage::decode_payload(message_type, envelope.payload) {
        Ok(SynthVideoMessage::FeatureChange(change)) => Some(change),
        Ok(other) => {
            tracing::debug!(message_type = ?other.message_type(), "ignoring unexpected inbound message");
            None
        }
        Err(err) => {
            tracing::debug!(?message_type, "dropping malformed inbound message: {err}");
            None
        }
    }
}

pub struct SynthVideoDevice<T: Transport> {
    transport: Arc<T>,
    config: SynthVideoConfig,
    state: DeviceState,
    version: Option<ProtocolVersion>,
    vram: Option<VideoMemoryRegion>,
    screen: Option<ScreenState>,
    dirty: Option<DirtyTracker>,
    cursor: CursorState,
    modes: Vec<DisplayMode>,
}

impl<T: Transport> SynthVideoDevice<T> {
    pub fn new(transport: Arc<T>, config: SynthVideoConfig) -> Self {
        Self {
            transport,
            config,
            state: DeviceState::Uninitialized,
            version: None,
            vram: None,
            screen: None,
            dirty: None,
            cursor: CursorState::new(),
            modes: Vec::new(),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &SynthVideoConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    pub fn vram(&self) -> Option<VideoMemoryRegion> {
        self.vram
    }

    pub fn screen(&self) -> Option<ScreenState> {
        self.screen
    }

    pub fn modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    pub fn cursor(&self) -> &CursorState {
        &self.cursor
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.as_ref().is_some_and(DirtyTracker::is_dirty)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let cursor = self.cursor.position();
        DeviceSnapshot {
            state: self.state,
            version: self.version,
            vram: self.vram,
            screen: self.screen,
            modes: self.modes.clone(),
            cursor_x: cursor.x,
            cursor_y: cursor.y,
            cursor_visible: cursor.is_visible,
            dirty: self.is_dirty(),
        }
    }

    fn require_ready(&self) -> Result<()> {
        match self.state {
            DeviceState::Ready => Ok(()),
            state => Err(GfxError::NotReady(state)),
        }
    }

    fn post(&self, msg: &SynthVideoMessage) -> Result<()> {
        let packet = msg.encode()?;
        self.transport
            .send(&packet, msg.message_type().transaction_id())?;
        Ok(())
    }

    fn request(&self, msg: &SynthVideoMessage, response: MessageType) -> Result<SynthVideoMessage> {
        let packet = msg.encode()?;
        let reply = self
            .transport
            .send_and_await(
                &packet,
                response.transaction_id(),
                self.config.response_timeout(),
            )
            .map_err(|err| match err {
                TransportError::TimedOut { .. } => GfxError::Timeout(response),
                other => GfxError::Transport(other),
            })?;

        let reply = SynthVideoMessage::decode(&reply)?;
        if reply.message_type() != response {
            return Err(GfxError::Protocol(format!(
                "expected {response:?}, host answered {:?}",
                reply.message_type()
            )));
        }
        Ok(reply)
    }

    /// Offers `candidate` to the host. Returns whether the host accepted it.
    pub fn negotiate_version(&mut self, candidate: ProtocolVersion) -> Result<bool> {
        let reply = self.request(
            &SynthVideoMessage::VersionRequest(VersionRequest { version: candidate }),
            MessageType::VersionResponse,
        )?;
        let SynthVideoMessage::VersionResponse(response) = reply else {
            return Err(GfxError::Protocol("malformed version response".into()));
        };

        if !response.accepted {
            tracing::debug!(version = %candidate, "host rejected synthvid version");
            return Ok(false);
        }
        tracing::info!(
            version = %candidate,
            max_video_outputs = response.max_video_outputs,
            "negotiated synthvid version"
        );
        self.version = Some(candidate);
        self.state = DeviceState::VersionNegotiated;
        Ok(true)
    }

    /// Tries every supported version, newest first.
    pub fn negotiate(&mut self) -> Result<ProtocolVersion> {
        for candidate in SUPPORTED_VERSIONS {
            if self.negotiate_version(candidate)? {
                return Ok(candidate);
            }
        }
        tracing::error!("host accepted none of the supported synthvid versions");
        Err(GfxError::Unsupported(
            "host accepted no supported synthvid version".into(),
        ))
    }

    /// Works out where the framebuffer lives and how large it is.
    pub fn allocate_video_memory(&mut self) -> Result<VideoMemoryRegion> {
        let length = match self.config.vram_size_bytes {
            Some(bytes) => u64::from(bytes),
            None => self
                .transport
                .mmio_byte_count()
                .ok_or(GfxError::NoResources("host reported no MMIO range"))?,
        };
        if length == 0 {
            return Err(GfxError::NoResources("video memory size is zero"));
        }

        let region = VideoMemoryRegion {
            base: HYPERV_VRAM_BASE,
            length,
            allocated: false,
        };
        tracing::debug!(base = region.base, length, "video memory region");
        Ok(region)
    }

    /// Tells the host where the framebuffer is and waits for its acknowledgement.
    pub fn set_graphics_memory_location(&mut self, region: VideoMemoryRegion) -> Result<()> {
        let reply = self.request(
            &SynthVideoMessage::VramLocation(VramLocation {
                context: region.base,
                is_specified: true,
                vram_gpa: region.base,
            }),
            MessageType::VramAck,
        )?;
        let SynthVideoMessage::VramAck(ack) = reply else {
            return Err(GfxError::Protocol("malformed VRAM ack".into()));
        };

        if ack.context != region.base {
            tracing::error!(
                expected = region.base,
                got = ack.context,
                "VRAM ack context mismatch"
            );
            return Err(GfxError::Protocol(format!(
                "VRAM ack context 0x{:x} does not match 0x{:x}",
                ack.context, region.base
            )));
        }

        self.vram = Some(region);
        self.state = DeviceState::MemoryConfigured;
        Ok(())
    }

    /// Brings the device up. Once ready, further calls return the cached result.
    pub fn init_graphics(&mut self) -> Result<GraphicsInfo> {
        if self.state != DeviceState::Ready {
            let version = self.negotiate()?;
            let region = self.allocate_video_memory()?;
            self.set_graphics_memory_location(region)?;

            self.modes = build_mode_catalog(
                self.config.supported_resolutions.as_deref(),
                version,
                region.length,
            );
            self.state = DeviceState::Ready;
            tracing::info!(
                %version,
                vram_length = region.length,
                modes = self.modes.len(),
                "synthvid ready"
            );
        }
        self.graphics_info()
    }

    fn graphics_info(&self) -> Result<GraphicsInfo> {
        match (self.version, self.vram) {
            (Some(version), Some(vram)) => Ok(GraphicsInfo {
                version,
                vram_base: vram.base,
                vram_length: vram.length,
            }),
            _ => Err(GfxError::NotReady(self.state)),
        }
    }

    /// Programs a new mode on the single output.
    pub fn set_resolution(&mut self, width: u32, height: u32, wait_for_ack: bool) -> Result<()> {
        self.require_ready()?;
        let (version, vram) = match (self.version, self.vram) {
            (Some(version), Some(vram)) => (version, vram),
            _ => return Err(GfxError::NotReady(self.state)),
        };
        validate_mode(width, height, version, vram.length)?;

        let limits = version.limits();
        let screen = ScreenState {
            width,
            height,
            pitch: width * limits.bytes_per_pixel(),
            depth: limits.bit_depth,
        };
        self.send_resolution(screen, wait_for_ack)?;

        tracing::info!(width, height, "synthvid resolution set");
        self.screen = Some(screen);
        self.dirty = Some(DirtyTracker::new(width, height));
        Ok(())
    }

    fn send_resolution(&self, screen: ScreenState, wait_for_ack: bool) -> Result<()> {
        let msg = SynthVideoMessage::ResolutionUpdate(ResolutionUpdate {
            context: 0,
            outputs: vec![VideoOutputSituation {
                active: true,
                vram_offset: 0,
                depth: screen.depth,
                width: screen.width,
                height: screen.height,
                pitch: screen.pitch,
            }],
        });
        if wait_for_ack {
            self.request(&msg, MessageType::ResolutionUpdateAck)?;
            Ok(())
        } else {
            self.post(&msg)
        }
    }

    /// Sends a cursor shape. `None` hides the cursor; `resend` repeats the last shape.
    pub fn set_cursor_shape(&mut self, image: Option<&CursorImage>, resend: bool) -> Result<()> {
        self.require_ready()?;
        let packet = if resend {
            self.cursor.resend_shape()?
        } else {
            self.cursor.prepare_shape(image)?
        };
        self.transport
            .send(packet, MessageType::CursorShape.transaction_id())?;
        Ok(())
    }

    /// Moves the cursor. The position is remembered even if sending fails.
    pub fn set_cursor_position(
        &mut self,
        x: i32,
        y: i32,
        visible: bool,
        resend: bool,
    ) -> Result<()> {
        self.require_ready()?;
        if !resend {
            self.cursor.record_position(x, y, visible);
        }
        self.post(&SynthVideoMessage::CursorPosition(self.cursor.position()))
    }

    pub fn mark_dirty(&mut self, x: u32, y: u32, width: u32, height: u32) {
        if let Some(dirty) = self.dirty.as_mut() {
            dirty.mark_region(x, y, width, height);
        }
    }

    pub fn mark_full_screen_dirty(&mut self) {
        if let Some(dirty) = self.dirty.as_mut() {
            dirty.mark_full_screen();
        }
    }

    /// Pushes the dirty part of the screen to the host, if any.
    pub fn refresh_image(&mut self) -> Result<()> {
        if self.state != DeviceState::Ready {
            return Ok(());
        }
        let Some(dirty) = self.dirty.as_mut() else {
            return Ok(());
        };
        if !dirty.is_dirty() {
            return Ok(());
        }

        let max = self.config.max_update_rects();
        let mut rects = dirty.build_rectangles(max + 1);
        if rects.len() > max {
            // Too fragmented to describe exactly; send everything.
            rects = vec![dirty.full_screen_rect()];
        }

        let msg = SynthVideoMessage::ImageUpdate(ImageUpdate {
            video_output: 0,
            rects,
        });
        let packet = msg.encode()?;
        self.transport
            .send(&packet, MessageType::ImageUpdate.transaction_id())?;
        dirty.clear();
        Ok(())
    }

    /// Re-sends whatever the host asked for. Ignored unless the device is ready.
    pub fn handle_feature_change(&mut self, change: FeatureChange) {
        if self.state != DeviceState::Ready {
            tracing::debug!(state = ?self.state, ?change, "ignoring feature change");
            return;
        }
        tracing::debug!(?change, "host feature change");

        if change.needs_resolution {
            // Goes through the full path so the tracker is rebuilt and the next refresh repaints.
            if let Some(screen) = self.screen {
                if let Err(err) = self.set_resolution(screen.width, screen.height, false) {
                    tracing::warn!("failed to resend resolution: {err}");
                }
            }
        }
        if change.needs_image {
            self.mark_full_screen_dirty();
            if let Err(err) = self.refresh_image() {
                tracing::warn!("failed to refresh image: {err}");
            }
        }
        if change.needs_cursor_shape {
            if let Err(err) = self.set_cursor_shape(None, true) {
                tracing::warn!("failed to resend cursor shape: {err}");
            }
        }
        if change.needs_cursor_position {
            if let Err(err) = self.set_cursor_position(0, 0, false, true) {
                tracing::warn!("failed to resend cursor position: {err}");
            }
        }
    }

    /// Handles an inbound packet on the engine's own thread.
    pub fn handle_inbound(&mut self, packet: &[u8]) {
        if let Some(change) = dispatch_inbound(&*self.transport, packet) {
            self.handle_feature_change(change);
        }
    }

    /// Tears the device down to `Uninitialized`. Cursor buffers are kept.
    pub fn stop(&mut self) {
        tracing::debug!(state = ?self.state, "stopping synthvid");
        self.dirty = None;
        self.screen = None;
        // The reserved VRAM range is not ours to free.
        self.vram = None;
        self.version = None;
        self.modes.clear();
        self.state = DeviceState::Uninitialized;
    }
}
