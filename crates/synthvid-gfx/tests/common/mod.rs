#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use synthvid_gfx::{
    PendingTransactions, SynthVideoConfig, SynthVideoDevice, Transport, TransportError,
};
use synthvid_protocol::{
    FeatureChange, MessageType, ProtocolVersion, ResolutionUpdateAck, SynthVideoMessage,
    VersionResponse, VramAck,
};

pub struct HostBehavior {
    pub accepted: Vec<ProtocolVersion>,
    /// Context to echo in VRAM acks instead of the one the guest sent.
    pub vram_ack_context: Option<u64>,
    pub mmio_bytes: Option<u64>,
    /// When false, requests never get a response.
    pub answer: bool,
    pub fail_sends: bool,
}

impl Default for HostBehavior {
    fn default() -> Self {
        Self {
            accepted: vec![ProtocolVersion::V3_5],
            vram_ack_context: None,
            mmio_bytes: Some(64 * 1024 * 1024),
            answer: true,
            fail_sends: false,
        }
    }
}

/// In-process stand-in for the hypervisor side of the synthvid channel.
///
/// Requests are answered inline, before the caller starts waiting.
#[derive(Default)]
pub struct FakeHost {
    pending: PendingTransactions,
    behavior: Mutex<HostBehavior>,
    sent: Mutex<Vec<SynthVideoMessage>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(behavior: HostBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            ..Self::default()
        })
    }

    pub fn configure(&self, f: impl FnOnce(&mut HostBehavior)) {
        f(&mut self.behavior.lock().unwrap());
    }

    pub fn sent(&self) -> Vec<SynthVideoMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<SynthVideoMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent_types(&self) -> Vec<MessageType> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(SynthVideoMessage::message_type)
            .collect()
    }

    fn reply_for(&self, request: &SynthVideoMessage) -> Option<SynthVideoMessage> {
        let behavior = self.behavior.lock().unwrap();
        if !behavior.answer {
            return None;
        }
        Some(match request {
            SynthVideoMessage::VersionRequest(req) => {
                SynthVideoMessage::VersionResponse(VersionResponse {
                    version: req.version,
                    accepted: behavior.accepted.contains(&req.version),
                    max_video_outputs: 1,
                })
            }
            SynthVideoMessage::VramLocation(loc) => SynthVideoMessage::VramAck(VramAck {
                context: behavior.vram_ack_context.unwrap_or(loc.context),
            }),
            SynthVideoMessage::ResolutionUpdate(update) => {
                SynthVideoMessage::ResolutionUpdateAck(ResolutionUpdateAck {
                    context: update.context,
                })
            }
            other => panic!("host got an unexpected request: {other:?}"),
        })
    }
}

impl Transport for FakeHost {
    fn send(&self, packet: &[u8], _transaction_id: u64) -> Result<(), TransportError> {
        if self.behavior.lock().unwrap().fail_sends {
            return Err(TransportError::Send("ring full".into()));
        }
        let msg = SynthVideoMessage::decode(packet).expect("guest sent a malformed packet");
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }

    fn send_and_await(
        &self,
        packet: &[u8],
        transaction_id: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.pending.begin(transaction_id)?;
        let msg = SynthVideoMessage::decode(packet).expect("guest sent a malformed packet");
        self.sent.lock().unwrap().push(msg.clone());

        if let Some(reply) = self.reply_for(&msg) {
            self.pending
                .complete(transaction_id, &reply.encode().unwrap());
        }
        self.pending.wait(transaction_id, timeout)
    }

    fn complete_transaction(&self, transaction_id: u64, response: &[u8]) -> bool {
        self.pending.complete(transaction_id, response)
    }

    fn mmio_byte_count(&self) -> Option<u64> {
        self.behavior.lock().unwrap().mmio_bytes
    }
}

pub fn ready_device(host: &Arc<FakeHost>, config: SynthVideoConfig) -> SynthVideoDevice<FakeHost> {
    let mut device = SynthVideoDevice::new(Arc::clone(host), config);
    device.init_graphics().unwrap();
    device
}

pub fn feature_change_packet(change: FeatureChange) -> Vec<u8> {
    SynthVideoMessage::FeatureChange(change).encode().unwrap()
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
