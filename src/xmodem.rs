use crc::{Crc, CRC_16_XMODEM};
use log::{debug, info, warn};

use crate::flash::FlashError;

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
/// Receiver request for a CRC-16 transfer.
const CRC_MODE: u8 = b'C';

/// Payload bytes carried by one packet.
pub const DATA_LEN: usize = 128;
/// Packet bytes following SOH: block number, its complement, data, CRC.
pub const BODY_LEN: usize = 2 + DATA_LEN + 2;
/// Complete packet on the wire, SOH included.
pub const PACKET_LEN: usize = 1 + BODY_LEN;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC16-CCITT, polynomial `0x1021`, initial value `0x0000`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Trait that describes the serial link and the countdown timer
/// [`XmodemEngine`] runs on. Constants tune the protocol timing.
pub trait ByteTransport {
    /// Per-byte timeout, restarted on every received byte. Default is `1000` ms.
    const TIMEOUT_MS: u32 = 1000;

    /// How long [`XmodemEngine::send_file`] waits for the receiver to
    /// request the transfer. Default is `10000` ms.
    const START_TIMEOUT_MS: u32 = 10_000;

    /// Attempts per packet once the transfer is running. Every failed
    /// attempt but the last is answered with NAK (receiving) or a
    /// retransmission (sending); the last one ends the transfer with
    /// [`XmodemError::RetriesExhausted`]. Default is `4`.
    const MAX_RETRIES: u8 = 4;

    /// Attempts, each starting with a `C`, before the first packet is
    /// accepted. Default is `10`.
    const MAX_RETRIES_START: u8 = 10;

    /// Return a received byte if there is one, without blocking.
    fn read_u8(&mut self) -> Option<u8>;

    /// Transmit a byte, blocking until it is queued.
    fn write_u8(&mut self, byte: u8);

    /// (Re)start the countdown timer.
    fn timer_start(&mut self, ms: u32);

    /// Returns `true` once the countdown started last has elapsed.
    fn timer_expired(&mut self) -> bool;
}

/// Reasons a transfer ends without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmodemError {
    /// Retry budget ran out.
    RetriesExhausted,
    /// Receiver did not request a CRC-16 transfer in time.
    NoStart,
    /// Peer cancelled the transfer.
    Cancelled,
    /// Data callback failed, transfer was cancelled.
    Flash(FlashError),
}

/// Why a received packet was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Block number and its complement do not add up to `255`.
    Header,
    /// CRC over the data does not match.
    Crc,
}

/// A single XMODEM-CRC data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmodemPacket {
    /// Sequence number, starts at `1` and wraps at `256`.
    pub block_nr: u8,
    /// Payload.
    pub data: [u8; DATA_LEN],
}

impl XmodemPacket {
    /// Creates a packet.
    pub fn new(block_nr: u8, data: [u8; DATA_LEN]) -> Self {
        Self { block_nr, data }
    }

    /// Serialize as `SOH, nr, !nr, data, crc_hi, crc_lo`.
    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let mut out = [0u8; PACKET_LEN];
        out[0] = SOH;
        out[1] = self.block_nr;
        out[2] = !self.block_nr;
        out[3..3 + DATA_LEN].copy_from_slice(&self.data);
        out[3 + DATA_LEN..].copy_from_slice(&crc16(&self.data).to_be_bytes());
        out
    }

    /// Parse and verify the bytes that follow SOH.
    pub fn decode(body: &[u8; BODY_LEN]) -> Result<Self, PacketError> {
        if body[0].wrapping_add(body[1]) != 0xff {
            return Err(PacketError::Header);
        }

        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(&body[2..2 + DATA_LEN]);

        let crc = u16::from_be_bytes([body[2 + DATA_LEN], body[3 + DATA_LEN]]);
        if crc16(&data) != crc {
            return Err(PacketError::Crc);
        }

        Ok(Self {
            block_nr: body[0],
            data,
        })
    }
}

enum Frame {
    Packet,
    EndOfTransmission,
    Cancel,
}

enum ReadError {
    Timeout,
    Unexpected(u8),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RxState {
    /// Nothing accepted yet, ask the sender for a CRC-16 transfer.
    AwaitFirstAck,
    /// Waiting for the next packet or EOT.
    ReceivingPacket,
    /// Packet in the buffer passed header and CRC checks.
    Verified,
    /// Packet was handed over and acknowledged.
    Dispatched,
    /// Last attempt failed, spend one retry.
    Retry,
    Done,
    Failed(XmodemError),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TxState {
    AwaitStart,
    NextPacket,
    SendPacket,
    AwaitAck,
    SendEot,
    Done,
    Failed(XmodemError),
}

/// XMODEM-CRC sender and receiver.
///
/// All calls block, busy-polling the transport, until the transfer ends.
pub struct XmodemEngine<T: ByteTransport> {
    transport: T,
    block_nr: u8,
    retries: u8,
    first_ack_sent: bool,
    body: [u8; BODY_LEN],
    packet: XmodemPacket,
}

impl<T: ByteTransport> XmodemEngine<T> {
    /// Creates a new engine on top of `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            block_nr: 1,
            retries: 0,
            first_ack_sent: false,
            body: [0; BODY_LEN],
            packet: XmodemPacket::new(1, [0; DATA_LEN]),
        }
    }

    /// Access the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Return the underlying transport.
    pub fn release(self) -> T {
        self.transport
    }

    /// Receive a file, handing each new 128-byte block to `on_rx_data`
    /// exactly once and in order.
    ///
    /// Blocks already passed to `on_rx_data` stay written if the transfer
    /// fails later.
    pub fn receive_file<F>(&mut self, mut on_rx_data: F) -> Result<(), XmodemError>
    where
        F: FnMut(&[u8; DATA_LEN]) -> Result<(), FlashError>,
    {
        self.block_nr = 1;
        self.retries = T::MAX_RETRIES_START;
        self.first_ack_sent = false;

        info!("xmodem: waiting for sender");

        let mut state = RxState::AwaitFirstAck;
        loop {
            state = match state {
                RxState::Done => {
                    self.absorb_eot_resends();
                    info!("xmodem: receive complete");
                    return Ok(());
                }
                RxState::Failed(e) => {
                    warn!("xmodem: receive failed: {:?}", e);
                    return Err(e);
                }
                s => self.rx_step(s, &mut on_rx_data),
            };
        }
    }

    fn rx_step<F>(&mut self, state: RxState, on_rx_data: &mut F) -> RxState
    where
        F: FnMut(&[u8; DATA_LEN]) -> Result<(), FlashError>,
    {
        match state {
            RxState::AwaitFirstAck => {
                self.transport.write_u8(CRC_MODE);
                RxState::ReceivingPacket
            }
            RxState::ReceivingPacket => match self.read_frame() {
                Ok(Frame::Packet) => match XmodemPacket::decode(&self.body) {
                    Ok(packet) => {
                        self.packet = packet;
                        RxState::Verified
                    }
                    Err(e) => {
                        debug!("xmodem: packet rejected: {:?}", e);
                        RxState::Retry
                    }
                },
                Ok(Frame::EndOfTransmission) => {
                    self.transport.write_u8(ACK);
                    RxState::Done
                }
                Ok(Frame::Cancel) => RxState::Failed(XmodemError::Cancelled),
                Err(ReadError::Unexpected(b)) => {
                    debug!("xmodem: unexpected start byte {:#04x}", b);
                    self.skip_frame();
                    RxState::Retry
                }
                Err(ReadError::Timeout) => {
                    debug!("xmodem: no packet");
                    RxState::Retry
                }
            },
            RxState::Verified => self.dispatch(on_rx_data),
            RxState::Dispatched => RxState::ReceivingPacket,
            RxState::Retry => {
                self.retries = self.retries.saturating_sub(1);
                if self.retries == 0 {
                    RxState::Failed(XmodemError::RetriesExhausted)
                } else if self.first_ack_sent {
                    self.transport.write_u8(NAK);
                    RxState::ReceivingPacket
                } else {
                    RxState::AwaitFirstAck
                }
            }
            RxState::Done | RxState::Failed(_) => state,
        }
    }

    fn dispatch<F>(&mut self, on_rx_data: &mut F) -> RxState
    where
        F: FnMut(&[u8; DATA_LEN]) -> Result<(), FlashError>,
    {
        let block_nr = self.packet.block_nr;

        if self.first_ack_sent && block_nr == self.block_nr.wrapping_sub(1) {
            // our ACK got lost, sender repeats the packet
            debug!("xmodem: duplicate block {}", block_nr);
            self.transport.write_u8(ACK);
            return RxState::ReceivingPacket;
        }

        if block_nr != self.block_nr {
            warn!("xmodem: got block {}, expected {}", block_nr, self.block_nr);
            return RxState::Retry;
        }

        if let Err(e) = on_rx_data(&self.packet.data) {
            self.cancel();
            return RxState::Failed(XmodemError::Flash(e));
        }

        debug!("xmodem: block {} received", block_nr);
        self.transport.write_u8(ACK);
        self.block_nr = self.block_nr.wrapping_add(1);
        self.retries = T::MAX_RETRIES;
        self.first_ack_sent = true;
        RxState::Dispatched
    }

    /// Drop what is left of a frame whose start byte was lost or garbled,
    /// up to one packet body or until the line goes quiet.
    fn skip_frame(&mut self) {
        for _ in 0..BODY_LEN {
            if self.read_byte(T::TIMEOUT_MS).is_none() {
                break;
            }
        }
    }

    /// After the final ACK the sender may miss it and repeat EOT.
    fn absorb_eot_resends(&mut self) {
        for _ in 0..T::MAX_RETRIES {
            match self.read_byte(T::TIMEOUT_MS) {
                Some(EOT) => self.transport.write_u8(ACK),
                _ => break,
            }
        }
    }

    /// Send a file. `on_tx_data` fills the next 128-byte block and returns
    /// `Ok(false)` when there is nothing left to send.
    pub fn send_file<F>(&mut self, mut on_tx_data: F) -> Result<(), XmodemError>
    where
        F: FnMut(&mut [u8; DATA_LEN]) -> Result<bool, FlashError>,
    {
        info!("xmodem: waiting for receiver");

        let mut state = TxState::AwaitStart;
        loop {
            state = match state {
                TxState::Done => {
                    info!("xmodem: send complete");
                    return Ok(());
                }
                TxState::Failed(e) => {
                    warn!("xmodem: send failed: {:?}", e);
                    return Err(e);
                }
                s => self.tx_step(s, &mut on_tx_data),
            };
        }
    }

    fn tx_step<F>(&mut self, state: TxState, on_tx_data: &mut F) -> TxState
    where
        F: FnMut(&mut [u8; DATA_LEN]) -> Result<bool, FlashError>,
    {
        match state {
            TxState::AwaitStart => match self.read_byte(T::START_TIMEOUT_MS) {
                Some(CRC_MODE) => {
                    self.block_nr = 1;
                    TxState::NextPacket
                }
                Some(b) => {
                    debug!("xmodem: unexpected start byte {:#04x}", b);
                    TxState::Failed(XmodemError::NoStart)
                }
                None => TxState::Failed(XmodemError::NoStart),
            },
            TxState::NextPacket => {
                let mut data = [0u8; DATA_LEN];
                self.retries = T::MAX_RETRIES;
                match on_tx_data(&mut data) {
                    Ok(true) => {
                        self.packet = XmodemPacket::new(self.block_nr, data);
                        TxState::SendPacket
                    }
                    Ok(false) => TxState::SendEot,
                    Err(e) => {
                        self.cancel();
                        TxState::Failed(XmodemError::Flash(e))
                    }
                }
            }
            TxState::SendPacket => {
                for b in self.packet.encode() {
                    self.transport.write_u8(b);
                }
                TxState::AwaitAck
            }
            TxState::AwaitAck => match self.read_byte(T::TIMEOUT_MS) {
                Some(ACK) => {
                    debug!("xmodem: block {} sent", self.block_nr);
                    self.block_nr = self.block_nr.wrapping_add(1);
                    TxState::NextPacket
                }
                Some(CAN) if self.read_byte(T::TIMEOUT_MS) == Some(CAN) => {
                    TxState::Failed(XmodemError::Cancelled)
                }
                reply => {
                    debug!("xmodem: block {} not acknowledged: {:?}", self.block_nr, reply);
                    self.spend_retry(TxState::SendPacket)
                }
            },
            TxState::SendEot => {
                self.transport.write_u8(EOT);
                match self.read_byte(T::TIMEOUT_MS) {
                    Some(ACK) => TxState::Done,
                    _ => self.spend_retry(TxState::SendEot),
                }
            }
            TxState::Done | TxState::Failed(_) => state,
        }
    }

    fn spend_retry(&mut self, again: TxState) -> TxState {
        self.retries = self.retries.saturating_sub(1);
        if self.retries == 0 {
            TxState::Failed(XmodemError::RetriesExhausted)
        } else {
            again
        }
    }

    fn read_frame(&mut self) -> Result<Frame, ReadError> {
        let start = self.read_byte(T::TIMEOUT_MS).ok_or(ReadError::Timeout)?;
        match start {
            SOH => {
                for i in 0..BODY_LEN {
                    self.body[i] = self.read_byte(T::TIMEOUT_MS).ok_or(ReadError::Timeout)?;
                }
                Ok(Frame::Packet)
            }
            EOT => Ok(Frame::EndOfTransmission),
            CAN => match self.read_byte(T::TIMEOUT_MS) {
                Some(CAN) => Ok(Frame::Cancel),
                _ => Err(ReadError::Unexpected(CAN)),
            },
            other => Err(ReadError::Unexpected(other)),
        }
    }

    fn read_byte(&mut self, timeout_ms: u32) -> Option<u8> {
        self.transport.timer_start(timeout_ms);
        loop {
            if let Some(b) = self.transport.read_u8() {
                return Some(b);
            }
            if self.transport.timer_expired() {
                return None;
            }
        }
    }

    fn cancel(&mut self) {
        self.transport.write_u8(CAN);
        self.transport.write_u8(CAN);
    }
}
