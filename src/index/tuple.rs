//! Entry tuple: `[locator: 6B][pad: 2B][encoded vector]`

use crate::host::RecordLocator;
use crate::vector::Vector;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};

const VECTOR_AT: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryTuple {
    pub locator: RecordLocator,
    pub vector: Vector,
}

impl EntryTuple {
    pub fn new(locator: RecordLocator, vector: Vector) -> Self {
        Self { locator, vector }
    }

    /// Encoded size of a tuple holding `vector`
    pub fn encoded_len(vector: &Vector) -> usize {
        VECTOR_AT + vector.encoded_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(&self.vector));
        out.extend_from_slice(&self.locator.encode());
        out.extend_from_slice(&[0, 0]);
        self.vector.encode_into(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VECTOR_AT {
            return Err(StorageError::Corruption(format!(
                "entry tuple too short: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            locator: RecordLocator::decode(bytes)?,
            vector: Vector::decode(&bytes[VECTOR_AT..])?,
        })
    }

    /// Only the locator, without decoding the vector
    pub fn decode_locator(bytes: &[u8]) -> Result<RecordLocator> {
        RecordLocator::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let tuple = EntryTuple::new(RecordLocator::new(3, 4), Vector::Float(vec![1.0, 2.0, 3.0]));
        let bytes = tuple.encode();
        assert_eq!(bytes.len(), EntryTuple::encoded_len(&tuple.vector));
        assert_eq!(bytes.len(), 8 + 4 + 12);
        assert_eq!(EntryTuple::decode_locator(&bytes).unwrap(), RecordLocator::new(3, 4));
        assert_eq!(EntryTuple::decode(&bytes).unwrap(), tuple);
        assert!(EntryTuple::decode(&bytes[..7]).unwrap_err().is_corruption());
    }
}
