#![allow(dead_code)]

use std::collections::VecDeque;

use flashload::uf2::{BLOCK_SIZE, PAYLOAD_SIZE};
use flashload::xmodem::{DATA_LEN, PACKET_LEN};
use flashload::*;

// Flow control
pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
pub const C: u8 = b'C';

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

enum Rx {
    Byte(u8),
    /// Line stays idle until the running timer expires.
    Silence,
}

/// Serial link with a scripted peer. Bytes the peer "sends" are queued
/// up front; a `pause()` makes the next timer wait expire. An empty queue
/// means the peer went quiet for good.
pub struct MockSerial {
    rx: VecDeque<Rx>,
    pub tx: Vec<u8>,
    pub timers: Vec<u32>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().map(|b| Rx::Byte(*b)));
    }

    pub fn pause(&mut self) {
        self.rx.push_back(Rx::Silence);
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl ByteTransport for MockSerial {
    const TIMEOUT_MS: u32 = 100;
    const START_TIMEOUT_MS: u32 = 500;
    const MAX_RETRIES: u8 = 4;
    const MAX_RETRIES_START: u8 = 3;

    fn read_u8(&mut self) -> Option<u8> {
        match self.rx.front() {
            Some(Rx::Byte(b)) => {
                let b = *b;
                self.rx.pop_front();
                Some(b)
            }
            _ => None,
        }
    }

    fn write_u8(&mut self, byte: u8) {
        self.tx.push(byte);
    }

    fn timer_start(&mut self, ms: u32) {
        self.timers.push(ms);
    }

    fn timer_expired(&mut self) -> bool {
        match self.rx.front() {
            Some(Rx::Byte(_)) => false,
            Some(Rx::Silence) => {
                self.rx.pop_front();
                true
            }
            None => true,
        }
    }
}

pub fn block_data(seed: u8) -> [u8; DATA_LEN] {
    core::array::from_fn(|i| seed.wrapping_mul(31).wrapping_add(i as u8))
}

pub fn packet(block_nr: u8, data: &[u8; DATA_LEN]) -> [u8; PACKET_LEN] {
    XmodemPacket::new(block_nr, *data).encode()
}

pub const TEST_FLASH_START: u32 = 0x0800_4000;
pub const TEST_FLASH_SIZE: u32 = 64 * 1024;
pub const TEST_PAGE_SIZE: u32 = 1024;
pub const TEST_FAMILY_ID: u32 = 0xe48b_ff56;

pub struct TestFlashOverride {
    pub read: Option<fn(&mut TestFlash, address: u32, buf: &mut [u8]) -> Result<(), FlashError>>,
    pub erase_page: Option<fn(&mut TestFlash, address: u32) -> Result<(), FlashError>>,
    pub write_block: Option<fn(&mut TestFlash, address: u32, data: &[u8]) -> Result<(), FlashError>>,
}

impl TestFlashOverride {
    pub fn none() -> Self {
        Self {
            read: None,
            erase_page: None,
            write_block: None,
        }
    }
}

/// Flash in RAM with NOR semantics: erase sets bytes to 0xff, programming
/// can only clear bits.
pub struct TestFlash {
    pub memory: Vec<u8>,
    pub erases: Vec<u32>,
    pub writes: Vec<(u32, usize)>,
    pub completions: u32,
    pub overrides: TestFlashOverride,
}

impl TestFlash {
    pub fn new() -> Self {
        Self::with_overrides(TestFlashOverride::none())
    }

    pub fn with_overrides(overrides: TestFlashOverride) -> Self {
        Self {
            memory: Self::init_buf(),
            erases: Vec::new(),
            writes: Vec::new(),
            completions: 0,
            overrides,
        }
    }

    // Initialize memory as: [0,0, 1,0, 2,0, ... 255,0, 0,1, ...]
    fn init_buf() -> Vec<u8> {
        (0..TEST_FLASH_SIZE as usize)
            .map(|i| {
                if i & 1 == 1 {
                    ((i >> 9) & 0xff) as u8
                } else {
                    ((i >> 1) & 0xff) as u8
                }
            })
            .collect()
    }

    pub fn at(&self, address: u32, len: usize) -> &[u8] {
        let offset = (address - TEST_FLASH_START) as usize;
        &self.memory[offset..offset + len]
    }

    fn offset(address: u32, len: usize) -> Result<usize, FlashError> {
        if address < TEST_FLASH_START {
            return Err(FlashError::Address);
        }
        let offset = (address - TEST_FLASH_START) as usize;
        if offset + len > TEST_FLASH_SIZE as usize {
            return Err(FlashError::Address);
        }
        Ok(offset)
    }
}

impl FlashSink for TestFlash {
    const FLASH_START: u32 = TEST_FLASH_START;
    const FLASH_SIZE: u32 = TEST_FLASH_SIZE;
    const PAGE_SIZE: u32 = TEST_PAGE_SIZE;

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if let Some(read) = self.overrides.read {
            return read(self, address, buf);
        }
        let offset = Self::offset(address, buf.len())?;
        buf.copy_from_slice(&self.memory[offset..offset + buf.len()]);
        Ok(())
    }

    fn erase_page(&mut self, address: u32) -> Result<(), FlashError> {
        if let Some(erase_page) = self.overrides.erase_page {
            return erase_page(self, address);
        }
        let offset = Self::offset(address, TEST_PAGE_SIZE as usize)?;
        if offset % TEST_PAGE_SIZE as usize != 0 {
            return Err(FlashError::Address);
        }
        self.memory[offset..offset + TEST_PAGE_SIZE as usize].fill(0xff);
        self.erases.push(address);
        Ok(())
    }

    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if let Some(write_block) = self.overrides.write_block {
            return write_block(self, address, data);
        }
        let offset = Self::offset(address, data.len())?;
        self.writes.push((address, data.len()));

        let target = &mut self.memory[offset..offset + data.len()];
        for (m, d) in target.iter_mut().zip(data) {
            *m &= *d;
        }
        if target != data {
            return Err(FlashError::Verify);
        }
        Ok(())
    }
}

impl Uf2Target for TestFlash {
    const FAMILY_ID: u32 = TEST_FAMILY_ID;

    fn transfer_complete(&mut self) {
        self.completions += 1;
    }
}

pub fn payload(block_nr: u32) -> [u8; PAYLOAD_SIZE as usize] {
    core::array::from_fn(|i| (block_nr as u8).wrapping_mul(7) ^ i as u8)
}

/// Block `block_nr` of a `nr_of_blocks` long image written from the start
/// of the test flash.
pub fn uf2_block(block_nr: u32, nr_of_blocks: u32) -> Uf2Block {
    let mut block = Uf2Block::new(TEST_FAMILY_ID);
    block.target_addr = TEST_FLASH_START + block_nr * PAYLOAD_SIZE;
    block.block_nr = block_nr;
    block.nr_of_blocks = nr_of_blocks;
    block.data[..PAYLOAD_SIZE as usize].copy_from_slice(&payload(block_nr));
    block
}

pub fn sector(block: &Uf2Block) -> [u8; BLOCK_SIZE] {
    let mut buf = [0u8; BLOCK_SIZE];
    block.encode(&mut buf).unwrap();
    buf
}
