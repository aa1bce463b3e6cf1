//! NTPv4 header wire format (RFC 5905, section 7.3).
//!
//! Only the fixed 48-byte header is handled; extension fields and the
//! message digest are ignored on decode and never produced.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

/// The Unix epoch in NTP seconds (1970 - 1900).
pub const JAN_1970: i64 = 2_208_988_800;

pub const HEADER_SIZE: usize = 48;

pub const NTP_V4: u8 = 4;

const LI_MAX: u8 = 3;
const LI_OFFSET: u8 = 6;
const VN_MAX: u8 = 7;
const VN_OFFSET: u8 = 3;
const MODE_MAX: u8 = 7;

/// NTP short format: 16-bit seconds, 16-bit fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Short {
    pub seconds: u16,
    pub fraction: u16,
}

impl Short {
    fn put(&self, b: &mut [u8]) {
        b[0..2].copy_from_slice(&self.seconds.to_be_bytes());
        b[2..4].copy_from_slice(&self.fraction.to_be_bytes());
    }

    fn get(b: &[u8]) -> Self {
        Self {
            seconds: u16::from_be_bytes([b[0], b[1]]),
            fraction: u16::from_be_bytes([b[2], b[3]]),
        }
    }
}

/// NTP timestamp format: 32-bit seconds since 1900, 32-bit binary fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(t: DateTime<Utc>) -> Self {
        let secs = t.timestamp() + JAN_1970;
        // [0, 999999999] scaled onto [0, u32::MAX]
        let frac = ((t.timestamp_subsec_nanos() as u64) << 32) / 1_000_000_000;
        Self {
            // Era wrap-around is intentional.
            seconds: secs as u32,
            fraction: frac as u32,
        }
    }

    fn put(&self, b: &mut [u8]) {
        b[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        b[4..8].copy_from_slice(&self.fraction.to_be_bytes());
    }

    fn get(b: &[u8]) -> Self {
        Self {
            seconds: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            fraction: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
        }
    }
}

/// Clock precision reported in responses, in log2 seconds (about 1us).
pub fn precision() -> i8 {
    -20
}

/// Warning of an impending leap second in the last minute of the day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum LeapIndicator {
    #[default]
    None = 0,
    /// Last minute of the day has 61 seconds
    Add = 1,
    /// Last minute of the day has 59 seconds
    Sub = 2,
    /// Clock unsynchronized
    NoSync = 3,
}

impl LeapIndicator {
    fn from_bits(b: u8) -> Self {
        match b & LI_MAX {
            0 => LeapIndicator::None,
            1 => LeapIndicator::Add,
            2 => LeapIndicator::Sub,
            _ => LeapIndicator::NoSync,
        }
    }
}

/// Association mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    #[default]
    Reserved = 0,
    SymmetricActive = 1,
    SymmetricPassive = 2,
    Client = 3,
    Server = 4,
    Broadcast = 5,
    Control = 6,
    Private = 7,
}

impl Mode {
    fn from_bits(b: u8) -> Self {
        match b & MODE_MAX {
            0 => Mode::Reserved,
            1 => Mode::SymmetricActive,
            2 => Mode::SymmetricPassive,
            3 => Mode::Client,
            4 => Mode::Server,
            5 => Mode::Broadcast,
            6 => Mode::Control,
            _ => Mode::Private,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub leap_indicator: LeapIndicator,
    pub version: u8,
    pub mode: Mode,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: Short,
    pub root_dispersion: Short,
    pub reference_id: [u8; 4],
    pub reference_timestamp: Timestamp,
    pub origin_timestamp: Timestamp,
    pub receive_timestamp: Timestamp,
    pub transmit_timestamp: Timestamp,
}

impl Header {
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        if self.version > VN_MAX {
            bail!("invalid NTP header: version {} out of range", self.version);
        }

        let mut data = [0u8; HEADER_SIZE];
        data[0] = ((self.leap_indicator as u8) << LI_OFFSET)
            | (self.version << VN_OFFSET)
            | (self.mode as u8);
        data[1] = self.stratum;
        data[2] = self.poll as u8;
        data[3] = self.precision as u8;
        self.root_delay.put(&mut data[4..]);
        self.root_dispersion.put(&mut data[8..]);
        data[12..16].copy_from_slice(&self.reference_id);
        self.reference_timestamp.put(&mut data[16..]);
        self.origin_timestamp.put(&mut data[24..]);
        self.receive_timestamp.put(&mut data[32..]);
        self.transmit_timestamp.put(&mut data[40..]);
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            bail!("NTP packet too small: {} < {}", data.len(), HEADER_SIZE);
        }

        Ok(Self {
            leap_indicator: LeapIndicator::from_bits(data[0] >> LI_OFFSET),
            version: (data[0] >> VN_OFFSET) & VN_MAX,
            mode: Mode::from_bits(data[0]),
            stratum: data[1],
            poll: data[2] as i8,
            precision: data[3] as i8,
            root_delay: Short::get(&data[4..]),
            root_dispersion: Short::get(&data[8..]),
            reference_id: [data[12], data[13], data[14], data[15]],
            reference_timestamp: Timestamp::get(&data[16..]),
            origin_timestamp: Timestamp::get(&data[24..]),
            receive_timestamp: Timestamp::get(&data[32..]),
            transmit_timestamp: Timestamp::get(&data[40..]),
        })
    }
}
