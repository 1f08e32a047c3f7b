//! Operator classes
//!
//! An operator class binds a column type to the support procedures the
//! index calls, looked up by slot number:
//!
//! | slot | procedure  | required |
//! |------|------------|----------|
//! | 1    | distance   | yes      |
//! | 2    | norm       | no (present for cosine-style classes) |
//! | 3    | type info  | no (defaults to `vector`) |
//!
//! When slot 2 is present, a value whose norm is not positive is not
//! indexed, and values are normalized before they are stored or compared.

use super::distance;
use super::{Vector, VectorType, BIT_MAX_DIM, HALFVEC_MAX_DIM, VECTOR_HEADER_SIZE, VECTOR_MAX_DIM};
use crate::{Result, StorageError};
use half::f16;

pub const DISTANCE_PROC: u16 = 1;
pub const NORM_PROC: u16 = 2;
pub const TYPE_INFO_PROC: u16 = 3;

/// Distance between a stored value and the query
pub type DistanceFn = fn(&Vector, &Vector) -> Result<f32>;

/// Norm of a value (slot 2)
pub type NormFn = fn(&Vector) -> f64;

/// Per-type facts the index needs (slot 3)
#[derive(Debug, Clone, Copy)]
pub struct TypeInfo {
    pub max_dimensions: usize,
    pub normalize: Option<fn(&Vector) -> Vector>,
    /// Encoded size of a value with the given dimensions
    pub item_size: fn(usize) -> usize,
}

const FLOAT_TYPE_INFO: TypeInfo = TypeInfo {
    max_dimensions: VECTOR_MAX_DIM,
    normalize: Some(l2_normalize),
    item_size: float_item_size,
};

const HALF_TYPE_INFO: TypeInfo = TypeInfo {
    max_dimensions: HALFVEC_MAX_DIM,
    normalize: Some(l2_normalize),
    item_size: half_item_size,
};

const BIT_TYPE_INFO: TypeInfo = TypeInfo {
    max_dimensions: BIT_MAX_DIM,
    normalize: None,
    item_size: bit_item_size,
};

fn float_item_size(dims: usize) -> usize {
    VECTOR_HEADER_SIZE + dims * 4
}

fn half_item_size(dims: usize) -> usize {
    VECTOR_HEADER_SIZE + dims * 2
}

fn bit_item_size(dims: usize) -> usize {
    VECTOR_HEADER_SIZE + dims.div_ceil(8)
}

impl TypeInfo {
    /// Type info for an indexable element type; `None` for `varbit`
    pub fn for_type(vector_type: VectorType) -> Option<TypeInfo> {
        match vector_type {
            VectorType::Float => Some(FLOAT_TYPE_INFO),
            VectorType::Half => Some(HALF_TYPE_INFO),
            VectorType::Bit => Some(BIT_TYPE_INFO),
            VectorType::VarBit => None,
        }
    }
}

/// A support procedure looked up by slot
#[derive(Debug, Clone, Copy)]
pub enum SupportProc {
    Distance(DistanceFn),
    Norm(NormFn),
    TypeInfo(TypeInfo),
}

#[derive(Debug, Clone, Copy)]
pub struct OpClass {
    name: &'static str,
    input_type: VectorType,
    distance: DistanceFn,
    norm: Option<NormFn>,
    type_info: Option<TypeInfo>,
}

impl OpClass {
    /// Every operator class this index supports
    pub fn all() -> Vec<OpClass> {
        let float = TypeInfo::for_type(VectorType::Float);
        let half = TypeInfo::for_type(VectorType::Half);
        let bit = TypeInfo::for_type(VectorType::Bit);
        vec![
            Self::new("vector_l2_ops", VectorType::Float, l2_distance, None, float),
            Self::new("vector_ip_ops", VectorType::Float, negative_inner_product, None, float),
            Self::new("vector_cosine_ops", VectorType::Float, cosine_distance, Some(l2_norm), float),
            Self::new("vector_l1_ops", VectorType::Float, l1_distance, None, float),
            Self::new("halfvec_l2_ops", VectorType::Half, l2_distance, None, half),
            Self::new("halfvec_ip_ops", VectorType::Half, negative_inner_product, None, half),
            Self::new("halfvec_cosine_ops", VectorType::Half, cosine_distance, Some(l2_norm), half),
            Self::new("bit_hamming_ops", VectorType::Bit, hamming_distance, None, bit),
            Self::new("bit_jaccard_ops", VectorType::Bit, jaccard_distance, None, bit),
        ]
    }

    fn new(
        name: &'static str,
        input_type: VectorType,
        distance: DistanceFn,
        norm: Option<NormFn>,
        type_info: Option<TypeInfo>,
    ) -> Self {
        Self { name, input_type, distance, norm, type_info }
    }

    pub fn lookup(name: &str) -> Result<OpClass> {
        Self::all()
            .into_iter()
            .find(|op| op.name == name)
            .ok_or_else(|| StorageError::Config(format!("operator class \"{}\" does not exist for access method \"flat\"", name)))
    }

    /// Default operator class of a column type
    pub fn default_for(vector_type: VectorType) -> Result<OpClass> {
        match vector_type {
            VectorType::Float => Self::lookup("vector_l2_ops"),
            VectorType::Half => Self::lookup("halfvec_l2_ops"),
            VectorType::Bit => Self::lookup("bit_hamming_ops"),
            VectorType::VarBit => Err(StorageError::Config("type not supported for flat index".into())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn input_type(&self) -> VectorType {
        self.input_type
    }

    /// Support procedure in `slot`, if this class defines one
    pub fn support_proc(&self, slot: u16) -> Option<SupportProc> {
        match slot {
            DISTANCE_PROC => Some(SupportProc::Distance(self.distance)),
            NORM_PROC => self.norm.map(SupportProc::Norm),
            TYPE_INFO_PROC => self.type_info.map(SupportProc::TypeInfo),
            _ => None,
        }
    }

    pub fn distance_fn(&self) -> DistanceFn {
        self.distance
    }

    /// Slot 3, falling back to the `vector` type info
    pub fn type_info(&self) -> TypeInfo {
        self.type_info.unwrap_or(FLOAT_TYPE_INFO)
    }

    /// Operator class validation hook; every class defined here is valid
    pub fn validate(&self) -> bool {
        true
    }

    /// Apply the norm check and normalization of this class.
    ///
    /// Returns `None` when the value must not be indexed (norm not positive).
    pub fn prepare(&self, value: Vector) -> Option<Vector> {
        let Some(norm) = self.norm else {
            return Some(value);
        };
        if norm(&value) <= 0.0 {
            return None;
        }
        Some(self.normalize(value))
    }

    /// Normalization only, without the norm check. Queries go through here
    /// so that a zero query still ranks instead of being dropped.
    pub fn normalize(&self, value: Vector) -> Vector {
        if self.norm.is_none() {
            return value;
        }
        match self.type_info().normalize {
            Some(normalize) => normalize(&value),
            None => value,
        }
    }
}

fn mismatch(a: &Vector, b: &Vector) -> StorageError {
    StorageError::Usage(format!(
        "different vector types or dimensions: {} ({} dims) vs {} ({} dims)",
        a.vector_type().name(),
        a.dims(),
        b.vector_type().name(),
        b.dims()
    ))
}

/// Run an f32 kernel over two float or half vectors
fn float_kernel(a: &Vector, b: &Vector, kernel: fn(&[f32], &[f32]) -> f32) -> Result<f32> {
    match (a, b) {
        (Vector::Float(x), Vector::Float(y)) if x.len() == y.len() => Ok(kernel(x, y)),
        (Vector::Half(x), Vector::Half(y)) if x.len() == y.len() => {
            let x: Vec<f32> = x.iter().map(|v| v.to_f32()).collect();
            let y: Vec<f32> = y.iter().map(|v| v.to_f32()).collect();
            Ok(kernel(&x, &y))
        }
        _ => Err(mismatch(a, b)),
    }
}

fn bit_kernel(a: &Vector, b: &Vector, kernel: fn(&[u8], &[u8]) -> f32) -> Result<f32> {
    match (a, b) {
        (Vector::Bit { dims: da, data: x }, Vector::Bit { dims: db, data: y }) if da == db => Ok(kernel(x, y)),
        _ => Err(mismatch(a, b)),
    }
}

fn l2_distance(a: &Vector, b: &Vector) -> Result<f32> {
    float_kernel(a, b, |x, y| distance::l2_squared(x, y).sqrt())
}

fn negative_inner_product(a: &Vector, b: &Vector) -> Result<f32> {
    float_kernel(a, b, |x, y| -distance::inner_product(x, y))
}

fn cosine_distance(a: &Vector, b: &Vector) -> Result<f32> {
    float_kernel(a, b, distance::cosine)
}

fn l1_distance(a: &Vector, b: &Vector) -> Result<f32> {
    float_kernel(a, b, distance::l1)
}

fn hamming_distance(a: &Vector, b: &Vector) -> Result<f32> {
    bit_kernel(a, b, distance::hamming)
}

fn jaccard_distance(a: &Vector, b: &Vector) -> Result<f32> {
    bit_kernel(a, b, distance::jaccard)
}

fn l2_norm(value: &Vector) -> f64 {
    value.to_f32().iter().map(|&x| x as f64 * x as f64).sum::<f64>().sqrt()
}

/// Scale to unit L2 norm; zero vectors come back unchanged
pub fn l2_normalize(value: &Vector) -> Vector {
    let norm = l2_norm(value);
    if norm == 0.0 {
        return value.clone();
    }
    match value {
        Vector::Float(v) => Vector::Float(v.iter().map(|&x| (x as f64 / norm) as f32).collect()),
        Vector::Half(v) => Vector::Half(
            v.iter().map(|x| f16::from_f64(x.to_f64() / norm)).collect(),
        ),
        Vector::Bit { .. } => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_support_proc_slots() {
        let cosine = OpClass::lookup("vector_cosine_ops").unwrap();
        assert!(matches!(cosine.support_proc(DISTANCE_PROC), Some(SupportProc::Distance(_))));
        assert!(matches!(cosine.support_proc(NORM_PROC), Some(SupportProc::Norm(_))));
        assert!(matches!(cosine.support_proc(TYPE_INFO_PROC), Some(SupportProc::TypeInfo(_))));
        assert!(cosine.support_proc(4).is_none());

        let l2 = OpClass::lookup("vector_l2_ops").unwrap();
        assert!(l2.support_proc(NORM_PROC).is_none());
        assert!(OpClass::lookup("vector_foo_ops").is_err());
        assert!(OpClass::all().iter().all(|op| op.validate()));
    }

    #[test]
    fn test_prepare_skips_zero_vector_under_cosine() {
        let cosine = OpClass::lookup("vector_cosine_ops").unwrap();
        assert!(cosine.prepare(Vector::Float(vec![0.0, 0.0, 0.0])).is_none());

        let unit = cosine.prepare(Vector::Float(vec![3.0, 4.0])).unwrap();
        assert_eq!(unit, Vector::Float(vec![0.6, 0.8]));

        // 没有 norm 过程的类不做处理
        let l2 = OpClass::lookup("vector_l2_ops").unwrap();
        assert_eq!(l2.prepare(Vector::Float(vec![0.0, 0.0])), Some(Vector::Float(vec![0.0, 0.0])));
    }

    #[test]
    fn test_normalize_keeps_zero_query() {
        let cosine = OpClass::lookup("vector_cosine_ops").unwrap();
        let v = Vector::Float(vec![3.0, 4.0]);
        assert_eq!(cosine.normalize(v.clone()), cosine.prepare(v).unwrap());
        assert_eq!(cosine.normalize(Vector::Float(vec![0.0, 0.0])).dims(), 2);

        let ip = OpClass::lookup("vector_ip_ops").unwrap();
        assert_eq!(ip.normalize(Vector::Float(vec![3.0, 4.0])), Vector::Float(vec![3.0, 4.0]));
        let hamming = OpClass::lookup("bit_hamming_ops").unwrap();
        let bits = Vector::bits(&[true, false]);
        assert_eq!(hamming.normalize(bits.clone()), bits);
    }

    #[test]
    fn test_distances() {
        let a = Vector::Float(vec![0.0, 0.0]);
        let b = Vector::Float(vec![3.0, 4.0]);
        let l2 = OpClass::lookup("vector_l2_ops").unwrap();
        assert_eq!((l2.distance_fn())(&a, &b).unwrap(), 5.0);

        let ip = OpClass::lookup("vector_ip_ops").unwrap();
        assert_eq!((ip.distance_fn())(&b, &b).unwrap(), -25.0);

        let half = OpClass::lookup("halfvec_l1_ops");
        assert!(half.is_err());

        let hamming = OpClass::lookup("bit_hamming_ops").unwrap();
        let x = Vector::bits(&[true, true, false]);
        let y = Vector::bits(&[false, true, true]);
        assert_eq!((hamming.distance_fn())(&x, &y).unwrap(), 2.0);
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        let l2 = OpClass::lookup("vector_l2_ops").unwrap();
        let err = (l2.distance_fn())(&Vector::Float(vec![1.0]), &Vector::Float(vec![1.0, 2.0])).unwrap_err();
        assert!(matches!(err, StorageError::Usage(_)));
        assert!((l2.distance_fn())(&Vector::Float(vec![1.0]), &Vector::half_from_f32(&[1.0])).is_err());
    }

    #[test]
    fn test_type_info() {
        let info = TypeInfo::for_type(VectorType::Float).unwrap();
        assert_eq!(info.max_dimensions, 2000);
        assert_eq!((info.item_size)(128), 4 + 512);
        assert!(TypeInfo::for_type(VectorType::VarBit).is_none());
        assert!(TypeInfo::for_type(VectorType::Bit).unwrap().normalize.is_none());
    }
}
