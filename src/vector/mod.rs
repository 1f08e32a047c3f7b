//! Vector values and their on-page encoding
//!
//! ## Encoding
//! ```text
//! [tag: u8][reserved: u8][dims: u16 LE][payload]
//!
//! Float: dims × f32 LE
//! Half:  dims × f16 bits LE
//! Bit:   ceil(dims / 8) bytes, most significant bit first
//! ```

pub mod distance;
pub mod opclass;

pub use opclass::{DistanceFn, NormFn, OpClass, SupportProc, TypeInfo};

use crate::{Result, StorageError};
use half::f16;
use serde::{Deserialize, Serialize};

/// Encoded header size
pub const VECTOR_HEADER_SIZE: usize = 4;

/// Maximum dimensions of a `vector` column in this index
pub const VECTOR_MAX_DIM: usize = 2000;
/// Maximum dimensions of a `halfvec` column in this index
pub const HALFVEC_MAX_DIM: usize = 4000;
/// Maximum dimensions of a `bit` column in this index
pub const BIT_MAX_DIM: usize = 64000;

/// Column element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VectorType {
    /// `vector`: single precision
    Float,
    /// `halfvec`: half precision
    Half,
    /// `bit(n)`: fixed-length bit string
    Bit,
    /// `varbit`: variable-length bit string, never indexable
    VarBit,
}

impl VectorType {
    fn tag(&self) -> u8 {
        match self {
            VectorType::Float => 1,
            VectorType::Half => 2,
            VectorType::Bit => 3,
            VectorType::VarBit => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VectorType::Float => "vector",
            VectorType::Half => "halfvec",
            VectorType::Bit => "bit",
            VectorType::VarBit => "varbit",
        }
    }
}

/// A vector value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Vector {
    Float(Vec<f32>),
    Half(Vec<f16>),
    Bit { dims: u32, data: Vec<u8> },
}

impl Vector {
    /// Half-precision vector from f32 values
    pub fn half_from_f32(values: &[f32]) -> Self {
        Vector::Half(values.iter().map(|&v| f16::from_f32(v)).collect())
    }

    /// Bit vector from booleans
    pub fn bits(values: &[bool]) -> Self {
        let mut data = vec![0u8; values.len().div_ceil(8)];
        for (i, &set) in values.iter().enumerate() {
            if set {
                data[i / 8] |= 0x80 >> (i % 8);
            }
        }
        Vector::Bit { dims: values.len() as u32, data }
    }

    pub fn vector_type(&self) -> VectorType {
        match self {
            Vector::Float(_) => VectorType::Float,
            Vector::Half(_) => VectorType::Half,
            Vector::Bit { .. } => VectorType::Bit,
        }
    }

    pub fn dims(&self) -> usize {
        match self {
            Vector::Float(v) => v.len(),
            Vector::Half(v) => v.len(),
            Vector::Bit { dims, .. } => *dims as usize,
        }
    }

    /// Bit payload length agrees with `dims`
    pub fn is_well_formed(&self) -> bool {
        match self {
            Vector::Bit { dims, data } => data.len() == (*dims as usize).div_ceil(8),
            _ => true,
        }
    }

    /// Elements widened to f32 (bit vectors yield 0.0 / 1.0)
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Vector::Float(v) => v.clone(),
            Vector::Half(v) => v.iter().map(|x| x.to_f32()).collect(),
            Vector::Bit { dims, data } => (0..*dims as usize)
                .map(|i| if data[i / 8] & (0x80 >> (i % 8)) != 0 { 1.0 } else { 0.0 })
                .collect(),
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        TypeInfo::for_type(self.vector_type()).map_or(0, |info| (info.item_size)(self.dims()))
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.vector_type().tag());
        out.push(0);
        out.extend_from_slice(&(self.dims() as u16).to_le_bytes());
        match self {
            Vector::Float(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Vector::Half(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_bits().to_le_bytes())),
            Vector::Bit { data, .. } => out.extend_from_slice(data),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VECTOR_HEADER_SIZE {
            return Err(StorageError::Corruption(format!(
                "vector datum too short: {} bytes",
                bytes.len()
            )));
        }
        let dims = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        let payload = &bytes[VECTOR_HEADER_SIZE..];
        let truncated = |need: usize| {
            StorageError::Corruption(format!(
                "vector datum has {} payload bytes, expected {}",
                payload.len(),
                need
            ))
        };

        match bytes[0] {
            1 => {
                let need = dims * 4;
                if payload.len() < need {
                    return Err(truncated(need));
                }
                Ok(Vector::Float(
                    payload[..need]
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ))
            }
            2 => {
                let need = dims * 2;
                if payload.len() < need {
                    return Err(truncated(need));
                }
                Ok(Vector::Half(
                    payload[..need]
                        .chunks_exact(2)
                        .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])))
                        .collect(),
                ))
            }
            3 => {
                let need = dims.div_ceil(8);
                if payload.len() < need {
                    return Err(truncated(need));
                }
                Ok(Vector::Bit { dims: dims as u32, data: payload[..need].to_vec() })
            }
            tag => Err(StorageError::Corruption(format!("unknown vector tag {}", tag))),
        }
    }
}
