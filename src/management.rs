//! Management Query Client: a non-blocking, single-outstanding-request
//! client for the PTP management protocol, used only to fetch port state
//! (startup wait) and UTC offset / leap flags (leap coordination).
//!
//! Transport is `AF_UNIX`/`SOCK_DGRAM` against a local peer socket (the
//! historical `pmc`/`phc2sys` transport: one PTP management message per
//! datagram, no stream framing needed) — see the Open Question decision in
//! the design notes for why datagram rather than stream.

use anyhow::{bail, Context, Result};
use std::os::unix::net::UnixDatagram;
use std::time::Duration;

/// PTP management TLV ids this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementId {
    PortDataSet,
    TimePropertiesDataSet,
}

impl ManagementId {
    fn wire_id(self) -> u16 {
        match self {
            ManagementId::PortDataSet => 0x2004,
            ManagementId::TimePropertiesDataSet => 0x2001,
        }
    }

    fn from_wire(id: u16) -> Option<Self> {
        match id {
            0x2004 => Some(ManagementId::PortDataSet),
            0x2001 => Some(ManagementId::TimePropertiesDataSet),
            _ => None,
        }
    }
}

/// Decoded PORT_DATA_SET response fields we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
}

impl PortState {
    fn from_wire(v: u8) -> Option<Self> {
        use PortState::*;
        Some(match v {
            1 => Initializing,
            2 => Faulty,
            3 => Disabled,
            4 => Listening,
            5 => PreMaster,
            6 => Master,
            7 => Passive,
            8 => Uncalibrated,
            9 => Slave,
            _ => return None,
        })
    }
}

/// Decoded TIME_PROPERTIES_DATA_SET response fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeProperties {
    pub current_utc_offset: i32,
    pub ptp_timescale: bool,
    pub leap61: bool,
    pub leap59: bool,
}

#[derive(Debug)]
pub enum ManagementResponse {
    PortDataSet(PortState),
    TimeProperties(TimeProperties),
}

/// Request/response state machine: at most one request outstanding at a
/// time, replacing the original's loose `pmc_ds_requested` boolean.
enum PmcRequestState {
    Idle,
    Outstanding {
        id: ManagementId,
        sequence: u16,
        sent_at: std::time::Instant,
    },
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ManagementClient {
    socket: UnixDatagram,
    state: PmcRequestState,
    next_sequence: u16,
}

impl ManagementClient {
    pub fn connect(local_path: &str, peer_path: &str) -> Result<Self> {
        let _ = std::fs::remove_file(local_path);
        let socket = UnixDatagram::bind(local_path)
            .with_context(|| format!("binding management socket at {local_path}"))?;
        socket
            .connect(peer_path)
            .with_context(|| format!("connecting to management peer at {peer_path}"))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            state: PmcRequestState::Idle,
            next_sequence: 0,
        })
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.socket.as_raw_fd()
    }

    /// Issues a GET request for `id` if none is currently outstanding.
    pub fn request(&mut self, id: ManagementId) -> Result<()> {
        if matches!(self.state, PmcRequestState::Outstanding { .. }) {
            return Ok(());
        }
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let msg = encode_get_request(id, sequence);
        self.socket.send(&msg).context("sending management request")?;
        self.state = PmcRequestState::Outstanding {
            id,
            sequence,
            sent_at: std::time::Instant::now(),
        };
        Ok(())
    }

    /// Clears a timed-out outstanding request so the next tick re-sends.
    pub fn clear_if_timed_out(&mut self) {
        if let PmcRequestState::Outstanding { sent_at, .. } = &self.state {
            if sent_at.elapsed() >= REQUEST_TIMEOUT {
                self.state = PmcRequestState::Idle;
            }
        }
    }

    /// True iff a write would be meaningful right now (no outstanding
    /// request) — used as one of the three poll conditions in §4.11.
    pub fn wants_write(&self) -> bool {
        matches!(self.state, PmcRequestState::Idle)
    }

    /// Attempts to read and decode one response. Returns `Ok(None)` if
    /// nothing is available, or the response doesn't match the outstanding
    /// request (wrong id, not exactly one MANAGEMENT TLV, not a RESPONSE).
    pub fn poll_response(&mut self) -> Result<Option<ManagementResponse>> {
        let (expected_id, expected_sequence) = match &self.state {
            PmcRequestState::Outstanding { id, sequence, .. } => (*id, *sequence),
            PmcRequestState::Idle => return Ok(None),
        };

        let mut buf = [0u8; 1024];
        let n = match self.socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e).context("reading management response"),
        };

        match decode_response(&buf[..n], expected_id, expected_sequence)? {
            Some(resp) => {
                self.state = PmcRequestState::Idle;
                Ok(Some(resp))
            }
            None => Ok(None), // didn't match; keep waiting for the real reply
        }
    }
}

/// Minimal PTP management message: a fixed header, one MANAGEMENT TLV.
/// Field widths/order follow IEEE 1588's management message layout; only
/// what this client needs to send/accept is encoded.
fn encode_get_request(id: ManagementId, sequence: u16) -> Vec<u8> {
    const ACTION_GET: u8 = 0;
    let mut msg = Vec::with_capacity(48);
    msg.push(0x0D); // messageType(4)=MANAGEMENT(0xD), transportSpecific=0
    msg.push(0x02); // versionPTP = 2
    msg.extend_from_slice(&(44u16).to_be_bytes()); // messageLength
    msg.push(0); // domainNumber
    msg.push(0); // reserved
    msg.extend_from_slice(&[0u8; 2]); // flagField
    msg.extend_from_slice(&[0u8; 8]); // correctionField
    msg.extend_from_slice(&[0u8; 4]); // reserved2
    msg.extend_from_slice(&[0u8; 10]); // sourcePortIdentity
    msg.extend_from_slice(&sequence.to_be_bytes()); // sequenceId
    msg.push(5); // controlField
    msg.push(0); // logMessageInterval
    msg.extend_from_slice(&[0xFFu8; 8]); // targetPortIdentity.clockIdentity = all-ones (any)
    msg.extend_from_slice(&0xFFFFu16.to_be_bytes()); // targetPortIdentity.portNumber = any
    msg.push(0); // startingBoundaryHops
    msg.push(0); // boundaryHops
    msg.push(ACTION_GET << 4);
    msg.push(0); // reserved
    msg.extend_from_slice(&4u16.to_be_bytes()); // TLV length (id + 2 reserved bytes)
    msg.extend_from_slice(&id.wire_id().to_be_bytes());
    msg.extend_from_slice(&[0u8; 2]);
    msg
}

fn decode_response(
    buf: &[u8],
    expected_id: ManagementId,
    expected_sequence: u16,
) -> Result<Option<ManagementResponse>> {
    if buf.len() < 48 {
        bail!("management response too short ({} bytes)", buf.len());
    }
    let message_type = buf[0] & 0x0F;
    const MANAGEMENT: u8 = 0xD;
    if message_type != MANAGEMENT {
        return Ok(None);
    }
    let sequence = u16::from_be_bytes([buf[30], buf[31]]);
    if sequence != expected_sequence {
        return Ok(None);
    }
    let action = buf[45] >> 4;
    const RESPONSE: u8 = 2;
    if action != RESPONSE {
        return Ok(None);
    }
    let tlv_len = u16::from_be_bytes([buf[46], buf[47]]) as usize;
    let payload_start = 48;
    if buf.len() < payload_start + tlv_len {
        bail!("truncated management TLV");
    }
    let wire_id = u16::from_be_bytes([buf[payload_start], buf[payload_start + 1]]);
    let Some(id) = ManagementId::from_wire(wire_id) else {
        return Ok(None);
    };
    if id != expected_id {
        return Ok(None);
    }

    let payload = &buf[payload_start + 4..payload_start + tlv_len];
    match id {
        ManagementId::PortDataSet => {
            if payload.is_empty() {
                bail!("PORT_DATA_SET payload too short");
            }
            let state = PortState::from_wire(payload[0])
                .ok_or_else(|| anyhow::anyhow!("unknown portState {}", payload[0]))?;
            Ok(Some(ManagementResponse::PortDataSet(state)))
        }
        ManagementId::TimePropertiesDataSet => {
            if payload.len() < 6 {
                bail!("TIME_PROPERTIES_DATA_SET payload too short");
            }
            let current_utc_offset = i16::from_be_bytes([payload[0], payload[1]]) as i32;
            let flags = payload[3];
            Ok(Some(ManagementResponse::TimeProperties(TimeProperties {
                current_utc_offset,
                ptp_timescale: flags & 0x08 != 0,
                leap61: flags & 0x01 != 0,
                leap59: flags & 0x02 != 0,
            })))
        }
    }
}
