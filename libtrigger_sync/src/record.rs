use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::constants::RECORD_HEADER_SIZE;
use super::error::RecordError;

/// Sample element type of a raw data record, as coded in the record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
}

impl TryFrom<u8> for DataType {
    type Error = RecordError;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Int8),
            1 => Ok(Self::Uint8),
            2 => Ok(Self::Int16),
            3 => Ok(Self::Uint16),
            4 => Ok(Self::Int32),
            5 => Ok(Self::Uint32),
            6 => Ok(Self::Int64),
            7 => Ok(Self::Uint64),
            _ => Err(RecordError::UnknownDataType(code)),
        }
    }
}

impl DataType {
    /// Width of one sample in bytes
    pub fn width(&self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 => 4,
            Self::Int64 | Self::Uint64 => 8,
        }
    }
}

/// The fixed-layout header preceding each raw data record on the record feed
#[derive(Debug, Clone, PartialEq)]
pub struct RecordHeader {
    pub channel_index: u16,
    pub version: u8,
    pub data_type: DataType,
    pub n_presamples: u32,
    pub n_samples: u32,
    pub volts_per_arb: f32,
    pub sample_period: f32,
    pub trigger_time_ns: u64,
    pub trigger_frame: u64,
}

impl TryFrom<&[u8]> for RecordHeader {
    type Error = RecordError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != RECORD_HEADER_SIZE {
            return Err(RecordError::BadHeaderSize(bytes.len()));
        }
        let mut cursor = Cursor::new(bytes);
        let channel_index = cursor.read_u16::<LittleEndian>()?;
        let version = cursor.read_u8()?;
        let data_type = DataType::try_from(cursor.read_u8()?)?;
        Ok(Self {
            channel_index,
            version,
            data_type,
            n_presamples: cursor.read_u32::<LittleEndian>()?,
            n_samples: cursor.read_u32::<LittleEndian>()?,
            volts_per_arb: cursor.read_f32::<LittleEndian>()?,
            sample_period: cursor.read_f32::<LittleEndian>()?,
            trigger_time_ns: cursor.read_u64::<LittleEndian>()?,
            trigger_frame: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// One raw message of the record feed: header bytes and sample bytes, undecoded
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub header: Vec<u8>,
    pub data: Vec<u8>,
}

/// A decoded data record. Samples are widened to i64; u64 samples wrap.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub header: RecordHeader,
    pub samples: Vec<i64>,
}

impl TryFrom<&RawRecord> for DataRecord {
    type Error = RecordError;
    fn try_from(raw: &RawRecord) -> Result<Self, Self::Error> {
        let header = RecordHeader::try_from(raw.header.as_slice())?;
        let samples = decode_samples(header.data_type, &raw.data)?;
        Ok(Self { header, samples })
    }
}

/// Decode a little-endian sample array
pub fn decode_samples(data_type: DataType, bytes: &[u8]) -> Result<Vec<i64>, RecordError> {
    let width = data_type.width();
    if bytes.len() % width != 0 {
        return Err(RecordError::RaggedData {
            len: bytes.len(),
            width,
        });
    }
    let n = bytes.len() / width;
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(n);
    for _ in 0..n {
        let value = match data_type {
            DataType::Int8 => cursor.read_i8()? as i64,
            DataType::Uint8 => cursor.read_u8()? as i64,
            DataType::Int16 => cursor.read_i16::<LittleEndian>()? as i64,
            DataType::Uint16 => cursor.read_u16::<LittleEndian>()? as i64,
            DataType::Int32 => cursor.read_i32::<LittleEndian>()? as i64,
            DataType::Uint32 => cursor.read_u32::<LittleEndian>()? as i64,
            DataType::Int64 => cursor.read_i64::<LittleEndian>()?,
            DataType::Uint64 => cursor.read_u64::<LittleEndian>()? as i64,
        };
        samples.push(value);
    }
    Ok(samples)
}

//Unit tests
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    pub(crate) fn header_bytes(channel_index: u16, type_code: u8, n_samples: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u16::<LittleEndian>(channel_index).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_u8(type_code).unwrap();
        buf.write_u32::<LittleEndian>(n_samples / 4).unwrap();
        buf.write_u32::<LittleEndian>(n_samples).unwrap();
        buf.write_f32::<LittleEndian>(1.0 / 65536.0).unwrap();
        buf.write_f32::<LittleEndian>(1e-6).unwrap();
        buf.write_u64::<LittleEndian>(123_456_789).unwrap();
        buf.write_u64::<LittleEndian>(42).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        // <HBBIIffQQ
        let bytes = header_bytes(17, 3, 8);
        assert_eq!(bytes.len(), 36);
        assert_eq!(bytes.len(), RECORD_HEADER_SIZE);
        let header = RecordHeader::try_from(bytes.as_slice()).unwrap();
        assert_eq!(header.channel_index, 17);
        assert_eq!(header.data_type, DataType::Uint16);
        assert_eq!(header.n_presamples, 2);
        assert_eq!(header.n_samples, 8);
        assert_eq!(header.trigger_time_ns, 123_456_789);
        assert_eq!(header.trigger_frame, 42);
    }

    #[test]
    fn test_bad_headers() {
        let bytes = header_bytes(1, 9, 8);
        assert!(matches!(
            RecordHeader::try_from(bytes.as_slice()),
            Err(RecordError::UnknownDataType(9))
        ));
        assert!(matches!(
            RecordHeader::try_from(&bytes[..10]),
            Err(RecordError::BadHeaderSize(10))
        ));
        assert!(matches!(
            RecordHeader::try_from(&bytes[..28]),
            Err(RecordError::BadHeaderSize(28))
        ));
    }

    #[test]
    fn test_signed_samples() {
        let mut data = Vec::new();
        for v in [-3i16, 0, 1000] {
            data.write_i16::<LittleEndian>(v).unwrap();
        }
        let raw = RawRecord {
            header: header_bytes(0, 2, 3),
            data,
        };
        let record = DataRecord::try_from(&raw).unwrap();
        assert_eq!(record.samples, vec![-3, 0, 1000]);

        assert!(matches!(
            decode_samples(DataType::Int32, &[0, 1, 2]),
            Err(RecordError::RaggedData { len: 3, width: 4 })
        ));
    }
}
