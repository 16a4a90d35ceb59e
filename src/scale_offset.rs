//! Scale-offset filter
//!
//! Integers are stored as `value - min` packed into `minbits` bits each,
//! most significant bit first. Floating-point data using decimal scaling is
//! stored as integers `round((value - min) * 10^D)`. The chunk starts with a
//! 21-byte header: `minbits` (u32 LE), the byte width of the minimum, and
//! the minimum itself (little-endian, zero padded).

use crate::error::{H5Error, Result};
use crate::filters::Filter;
use crate::types::ByteOrder;

/// Scale-offset, as registered with the HDF Group
pub const FILTER_SCALE_OFFSET: u16 = 6;

/// Bytes before the packed values
const PAYLOAD_OFFSET: usize = 21;

/// Number of client data words the filter expects
const CLIENT_DATA_LEN: usize = 20;

/// How values were reduced before packing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleType {
    /// Floating point, decimal scale factor `D`
    FloatDecimal,
    /// Floating point, exponent scaling (not written by current libraries)
    FloatExponent,
    /// Integer, scale factor is the requested `minbits` (0 chooses it)
    Integer,
}

/// Decoded client data of a scale-offset filter entry
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleOffsetParameters {
    pub scale_type: ScaleType,
    pub scale_factor: i32,
    pub element_count: u32,
    pub is_float: bool,
    pub element_size: u32,
    pub signed: bool,
    pub byte_order: ByteOrder,
    /// Fill value bytes, little-endian, when the dataset defines one
    pub fill_value: Option<Vec<u8>>,
}

impl ScaleOffsetParameters {
    /// Parameters for an integer dataset with automatically chosen `minbits`
    pub fn integer(element_count: u32, element_size: u32, signed: bool) -> Self {
        Self {
            scale_type: ScaleType::Integer,
            scale_factor: 0,
            element_count,
            is_float: false,
            element_size,
            signed,
            byte_order: ByteOrder::LittleEndian,
            fill_value: None,
        }
    }

    pub fn with_fill_value(mut self, fill_value: Vec<u8>) -> Self {
        self.fill_value = Some(fill_value);
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn from_client_data(client_data: &[u32]) -> Result<Self> {
        if client_data.len() != CLIENT_DATA_LEN {
            return Err(H5Error::InvalidFormat(format!(
                "scale-offset filter expects {} client data values, got {}",
                CLIENT_DATA_LEN,
                client_data.len()
            )));
        }

        let is_float = match client_data[3] {
            0 => false,
            1 => true,
            other => {
                return Err(H5Error::InvalidFormat(format!(
                    "scale-offset datatype class {} is not integer or float",
                    other
                )))
            }
        };

        let scale_type = match (client_data[0], is_float) {
            (0, true) => ScaleType::FloatDecimal,
            (1, true) => ScaleType::FloatExponent,
            (2, false) => ScaleType::Integer,
            (other, _) => {
                return Err(H5Error::InvalidFormat(format!(
                    "scale-offset scale type {} does not match the datatype class",
                    other
                )))
            }
        };

        let element_size = client_data[4];
        let valid_size = if is_float {
            matches!(element_size, 4 | 8)
        } else {
            matches!(element_size, 1 | 2 | 4 | 8)
        };
        if !valid_size {
            return Err(H5Error::InvalidFormat(format!(
                "scale-offset cannot handle {}-byte elements",
                element_size
            )));
        }

        let fill_value = (client_data[7] == 1).then(|| {
            client_data[8..]
                .iter()
                .flat_map(|word| word.to_le_bytes())
                .take(element_size as usize)
                .collect()
        });

        Ok(Self {
            scale_type,
            scale_factor: client_data[1] as i32,
            element_count: client_data[2],
            is_float,
            element_size,
            signed: client_data[5] == 1,
            byte_order: if client_data[6] == 1 {
                ByteOrder::BigEndian
            } else {
                ByteOrder::LittleEndian
            },
            fill_value,
        })
    }

    pub fn to_client_data(&self) -> Vec<u32> {
        let mut data = vec![0u32; CLIENT_DATA_LEN];
        data[0] = match self.scale_type {
            ScaleType::FloatDecimal => 0,
            ScaleType::FloatExponent => 1,
            ScaleType::Integer => 2,
        };
        data[1] = self.scale_factor as u32;
        data[2] = self.element_count;
        data[3] = self.is_float as u32;
        data[4] = self.element_size;
        data[5] = self.signed as u32;
        data[6] = (self.byte_order == ByteOrder::BigEndian) as u32;

        if let Some(fill) = &self.fill_value {
            data[7] = 1;
            for (i, word) in fill.chunks(4).take(CLIENT_DATA_LEN - 8).enumerate() {
                let mut bytes = [0u8; 4];
                bytes[..word.len()].copy_from_slice(word);
                data[8 + i] = u32::from_le_bytes(bytes);
            }
        }

        data
    }

    fn bits(&self) -> u32 {
        self.element_size * 8
    }

    /// All-ones value of the element width
    fn width_mask(&self) -> u64 {
        if self.bits() == 64 {
            u64::MAX
        } else {
            (1u64 << self.bits()) - 1
        }
    }

    fn fill_bits(&self) -> Option<u64> {
        self.fill_value.as_deref().map(le_value)
    }

    fn read_element(&self, bytes: &[u8]) -> u64 {
        match self.byte_order {
            ByteOrder::BigEndian => bytes.iter().fold(0u64, |v, &b| (v << 8) | b as u64),
            _ => le_value(bytes),
        }
    }

    fn write_element(&self, value: u64, output: &mut Vec<u8>) {
        let bytes = &value.to_le_bytes()[..self.element_size as usize];
        match self.byte_order {
            ByteOrder::BigEndian => output.extend(bytes.iter().rev()),
            _ => output.extend_from_slice(bytes),
        }
    }
}

fn le_value(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .rev()
        .fold(0u64, |v, &b| (v << 8) | b as u64)
}

/// Sign-extend the low `bits` of `value`
fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Reads fixed-width fields, most significant bit first
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn read(&mut self, width: u32) -> Result<u64> {
        let mut value = 0u64;
        for _ in 0..width {
            let byte = self.data.get(self.bit / 8).ok_or_else(|| {
                H5Error::Decompression("scale-offset payload is truncated".to_string())
            })?;
            let bit = (byte >> (7 - self.bit % 8)) & 1;
            value = (value << 1) | bit as u64;
            self.bit += 1;
        }
        Ok(value)
    }
}

struct BitWriter {
    data: Vec<u8>,
    bit: usize,
}

impl BitWriter {
    fn write(&mut self, value: u64, width: u32) {
        for shift in (0..width).rev() {
            if self.bit % 8 == 0 {
                self.data.push(0);
            }
            let bit = ((value >> shift) & 1) as u8;
            if let Some(last) = self.data.last_mut() {
                *last |= bit << (7 - self.bit % 8);
            }
            self.bit += 1;
        }
    }
}

/// Scale-offset filter for integer and decimally scaled float data
#[derive(Debug, Default)]
pub struct ScaleOffsetFilter;

impl Filter for ScaleOffsetFilter {
    fn name(&self) -> &str {
        "scaleoffset"
    }

    fn decode(&self, _flags: u16, client_data: &[u32], input: Vec<u8>) -> Result<Vec<u8>> {
        let parameters = ScaleOffsetParameters::from_client_data(client_data)?;
        if parameters.scale_type == ScaleType::FloatExponent {
            return Err(H5Error::Decompression(
                "scale-offset exponent scaling is not supported".to_string(),
            ));
        }

        if input.len() < PAYLOAD_OFFSET {
            return Err(H5Error::Decompression(format!(
                "scale-offset chunk of {} bytes is shorter than its header",
                input.len()
            )));
        }

        let minbits = u32::from_le_bytes([input[0], input[1], input[2], input[3]]);
        let minval_size = (input[4] as usize).min(PAYLOAD_OFFSET - 5);
        let minval = le_value(&input[5..5 + minval_size]);

        if minbits > parameters.bits() {
            return Err(H5Error::Decompression(format!(
                "scale-offset minbits {} exceeds the {}-bit element",
                minbits,
                parameters.bits()
            )));
        }

        let count = parameters.element_count as usize;
        let size = parameters.element_size as usize;
        let payload = &input[PAYLOAD_OFFSET..];

        // full precision: values were stored unchanged
        if minbits == parameters.bits() {
            return payload
                .get(..count * size)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| {
                    H5Error::Decompression("scale-offset payload is truncated".to_string())
                });
        }

        let maxval = (1u64 << minbits) - 1;
        let fill = parameters.fill_bits();
        let mut reader = BitReader {
            data: payload,
            bit: 0,
        };
        let mut output = Vec::with_capacity(count * size);

        for _ in 0..count {
            let packed = if minbits == 0 { 0 } else { reader.read(minbits)? };

            let value = match fill {
                Some(fill) if packed == maxval => fill,
                _ if parameters.is_float => float_value(&parameters, packed, minval),
                _ => packed.wrapping_add(minval) & parameters.width_mask(),
            };
            parameters.write_element(value, &mut output);
        }

        Ok(output)
    }

    /// Integer data only; `minbits` is chosen from the value range
    fn encode(&self, _flags: u16, client_data: &[u32], input: Vec<u8>) -> Result<Vec<u8>> {
        let parameters = ScaleOffsetParameters::from_client_data(client_data)?;
        if parameters.is_float {
            return Err(H5Error::Compression(
                "scale-offset encoding supports integer data only".to_string(),
            ));
        }

        let size = parameters.element_size as usize;
        let bits = parameters.bits();
        let fill = parameters.fill_bits();

        // values as offsets from the signed or unsigned minimum
        let values: Vec<u64> = input
            .chunks_exact(size)
            .map(|bytes| parameters.read_element(bytes))
            .collect();
        let key = |v: u64| -> i128 {
            if parameters.signed {
                sign_extend(v, bits) as i128
            } else {
                v as i128
            }
        };

        let stored = values.iter().copied().filter(|&v| Some(v) != fill);
        let min = stored.clone().map(key).min().unwrap_or(0);
        let max = stored.map(key).max().unwrap_or(0);

        let span = (max - min) as u128 + u128::from(fill.is_some());
        let mut minbits = 128 - span.leading_zeros();
        if minbits > bits {
            minbits = bits;
        }

        let mut output = Vec::with_capacity(PAYLOAD_OFFSET + input.len());
        output.extend_from_slice(&minbits.to_le_bytes());
        output.push(8);
        output.extend_from_slice(&((min as i64) as u64).to_le_bytes());
        output.resize(PAYLOAD_OFFSET, 0);

        if minbits == bits {
            output.extend_from_slice(&input[..values.len() * size]);
            return Ok(output);
        }

        let maxval = (1u64 << minbits) - 1;
        let mut writer = BitWriter {
            data: Vec::new(),
            bit: 0,
        };
        for &v in &values {
            let packed = if Some(v) == fill {
                maxval
            } else {
                (key(v) - min) as u64
            };
            writer.write(packed, minbits);
        }
        output.extend_from_slice(&writer.data);

        Ok(output)
    }
}

/// `packed / 10^D + min` in the element's float width, as raw bits
fn float_value(parameters: &ScaleOffsetParameters, packed: u64, minval: u64) -> u64 {
    let scale = 10f64.powi(parameters.scale_factor);
    let offset = sign_extend(packed, parameters.bits()) as f64 / scale;

    if parameters.element_size == 4 {
        let min = f32::from_bits(minval as u32);
        ((offset as f32 + min).to_bits()) as u64
    } else {
        (offset + f64::from_bits(minval)).to_bits()
    }
}
