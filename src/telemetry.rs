//! Decoder for the binary readings carried (base64) in telemetry batches.
//!
//! A blob is a back-to-back sequence of records. Every record starts with
//! [`MAGIC`] and a version byte that is the same for the whole blob,
//! followed by a 20-byte little-endian common block and a trailer whose
//! layout depends on the version.

use std::fmt;

use thiserror::Error;

pub const MAGIC: [u8; 2] = [0xca, 0xa0];

const HEADER_LEN: usize = 3;
const COMMON_LEN: usize = 20;
const V3_TRAILER_LEN: usize = 10;
const V0_TRAILER_LEN: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedTelemetry {
    #[error("readings of length {len} do not start with the magic prefix")]
    MissingMagic { len: usize },

    #[error("record at offset {offset} has header {found:02x?}, expected version {version}")]
    HeaderMismatch {
        offset: usize,
        version: u8,
        found: Vec<u8>,
    },

    #[error("record at offset {offset} is truncated: needed {needed} bytes, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// Trailer of a v3 record (BB-V2-0 and BB-V2-0-L).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerTrailer {
    // Observed to always be 1.
    pub always_one: i8,
    pub on_off: i8,
    pub voltage: i16,
    pub current_ma: i32,
    // Observed to always be zero.
    pub reserved: [u8; 3],
    pub checksum: u8,
}

/// Trailer of a v0 record (BB-V1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioTrailer {
    pub rssi_dbm: i16,
    pub on_off: i8,
    pub checksum: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trailer {
    Power(PowerTrailer),
    Radio(RadioTrailer),
    Opaque(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryReading {
    pub version: u8,
    pub started_at: u32,
    /// Temperatures are in tenths of a degree Celsius.
    pub sensor_temp: i16,
    pub ambient_temp: i16,
    pub setpoint: i16,
    pub humidity_percent: i8,
    pub duty_percent: i8,
    /// Raw on/off durations; see [`BinaryReading::on_millis`] for units.
    pub on_duration: i16,
    pub off_duration: i16,
    pub heatsink_temp: i16,
    pub flags: u16,
    pub trailer: Trailer,
}

impl BinaryReading {
    pub fn sensor_celsius(&self) -> f32 {
        tenths(self.sensor_temp)
    }

    pub fn ambient_celsius(&self) -> f32 {
        tenths(self.ambient_temp)
    }

    pub fn setpoint_celsius(&self) -> f32 {
        tenths(self.setpoint)
    }

    pub fn heatsink_celsius(&self) -> f32 {
        tenths(self.heatsink_temp)
    }

    /// On-duration in milliseconds, when the unit is known for this version.
    pub fn on_millis(&self) -> Option<i32> {
        self.duration_millis(self.on_duration)
    }

    pub fn off_millis(&self) -> Option<i32> {
        self.duration_millis(self.off_duration)
    }

    fn duration_millis(&self, raw: i16) -> Option<i32> {
        match self.trailer {
            Trailer::Power(_) => Some(raw as i32),
            Trailer::Radio(_) => Some(raw as i32 * 100),
            Trailer::Opaque(_) => None,
        }
    }
}

fn tenths(v: i16) -> f32 {
    v as f32 / 10f32
}

impl fmt::Display for Trailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trailer::Power(p) => write!(
                f,
                "one?={}, on|off={}, voltage={}V, cur={}mA, zero?={}, crc?={:08b}",
                p.always_one,
                p.on_off,
                p.voltage,
                p.current_ma,
                hex::encode(p.reserved),
                p.checksum
            ),
            Trailer::Radio(r) => write!(
                f,
                "rssi={} dBm, on|off={}, crc(?)={:08b}",
                r.rssi_dbm, r.on_off, r.checksum
            ),
            Trailer::Opaque(bytes) => {
                let words: Vec<String> = bytes.chunks(4).map(hex::encode).collect();
                f.write_str(&words.join(" "))
            }
        }
    }
}

pub fn decode(readings: &[u8]) -> Result<Vec<BinaryReading>, MalformedTelemetry> {
    if !readings.starts_with(&MAGIC) || readings.len() < HEADER_LEN {
        return Err(MalformedTelemetry::MissingMagic {
            len: readings.len(),
        });
    }

    let version = readings[2];
    let mut cursor = Cursor {
        buf: readings,
        offset: 0,
    };
    let mut decoded = Vec::new();

    while cursor.offset < readings.len() {
        let record_start = cursor.offset;
        let header = cursor.take(HEADER_LEN)?;
        if header[..2] != MAGIC || header[2] != version {
            return Err(MalformedTelemetry::HeaderMismatch {
                offset: record_start,
                version,
                found: header.to_vec(),
            });
        }

        let common = cursor.take(COMMON_LEN)?;
        let le16 = |i: usize| i16::from_le_bytes([common[i], common[i + 1]]);

        let trailer = match version {
            3 => {
                let t = cursor.take(V3_TRAILER_LEN)?;
                Trailer::Power(PowerTrailer {
                    always_one: t[0] as i8,
                    on_off: t[1] as i8,
                    voltage: i16::from_le_bytes([t[2], t[3]]),
                    current_ma: i16::from_le_bytes([t[4], t[5]]) as i32 * 10,
                    reserved: [t[6], t[7], t[8]],
                    checksum: t[9],
                })
            }
            0 => {
                let t = cursor.take(V0_TRAILER_LEN)?;
                Trailer::Radio(RadioTrailer {
                    rssi_dbm: -(t[0] as i8 as i16),
                    on_off: t[1] as i8,
                    checksum: t[2],
                })
            }
            _ => {
                let header = [MAGIC[0], MAGIC[1], version];
                let end = readings[cursor.offset..]
                    .windows(HEADER_LEN)
                    .position(|w| w == header)
                    .map_or(readings.len(), |p| cursor.offset + p);
                Trailer::Opaque(cursor.take(end - cursor.offset)?.to_vec())
            }
        };

        decoded.push(BinaryReading {
            version,
            started_at: u32::from_le_bytes([common[0], common[1], common[2], common[3]]),
            sensor_temp: le16(4),
            ambient_temp: le16(6),
            setpoint: le16(8),
            humidity_percent: common[10] as i8,
            duty_percent: common[11] as i8,
            on_duration: le16(12),
            off_duration: le16(14),
            heatsink_temp: le16(16),
            flags: u16::from_le_bytes([common[18], common[19]]),
            trailer,
        });
    }

    Ok(decoded)
}

struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MalformedTelemetry> {
        let available = self.buf.len() - self.offset;
        if available < n {
            return Err(MalformedTelemetry::Truncated {
                offset: self.offset,
                needed: n,
                available,
            });
        }

        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }
}
