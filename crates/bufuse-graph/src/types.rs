//! Tensor and operator descriptors for the compute graph.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float16,
    BFloat16,
    Int32,
    Int16,
    Int8,
    Uint8,
    Bool,
}

impl DataType {
    /// Width of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Float16 | Self::BFloat16 | Self::Int16 => 2,
            Self::Int8 | Self::Uint8 | Self::Bool => 1,
        }
    }
}

/// Storage layout of a tensor.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Format {
    #[serde(rename = "NCHW")]
    Nchw,
    #[serde(rename = "NHWC")]
    Nhwc,
    /// 5-D blocked layout with the channel axis split into C1 x C0.
    #[serde(rename = "NC1HWC0")]
    Nc1hwc0,
    /// Blocked weight layout used by the cube unit.
    #[serde(rename = "FRACTAL_Z")]
    FractalZ,
    #[serde(rename = "ND")]
    Nd,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nchw => "NCHW",
            Self::Nhwc => "NHWC",
            Self::Nc1hwc0 => "NC1HWC0",
            Self::FractalZ => "FRACTAL_Z",
            Self::Nd => "ND",
        })
    }
}

/// Shape, layout and element type of a tensor edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    /// Dimensions; `-1` marks a dynamic dimension.
    pub shape: Vec<i64>,
    pub format: Format,
    pub dtype: DataType,
}

impl TensorDesc {
    pub fn new(shape: impl Into<Vec<i64>>, format: Format, dtype: DataType) -> Self {
        Self {
            shape: shape.into(),
            format,
            dtype,
        }
    }

    /// Returns `true` if every dimension is 1 (or the tensor is rank 0).
    pub fn is_scalar(&self) -> bool {
        self.shape.iter().all(|&d| d == 1)
    }

    /// Logical channel count, if the layout carries one.
    pub fn channels(&self) -> Option<i64> {
        let dims = &self.shape;
        match self.format {
            Format::Nchw if dims.len() == 4 => Some(dims[1]),
            Format::Nhwc if dims.len() == 4 => Some(dims[3]),
            Format::Nc1hwc0 if dims.len() == 5 => dims[1].checked_mul(dims[4]),
            _ => None,
        }
    }

    /// Spatial width, if the layout carries one.
    pub fn width(&self) -> Option<i64> {
        let dims = &self.shape;
        match self.format {
            Format::Nchw if dims.len() == 4 => Some(dims[3]),
            Format::Nhwc if dims.len() == 4 => Some(dims[2]),
            Format::Nc1hwc0 if dims.len() == 5 => Some(dims[3]),
            _ => None,
        }
    }
}

/// Fusion category of an operator.
///
/// Patterns match on this tag rather than on the concrete operator type, so
/// one descriptor covers e.g. every elementwise operator.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum OpKind {
    Convolution,
    DepthwiseConvolution,
    MatMul,
    ElemWise,
    Broadcast,
    Dequant,
    DequantS16,
    Requant,
    RequantS16,
    Quant,
    Pool2d,
    StridedRead,
    StridedWrite,
    ReadSelect,
    WriteSelect,
    CommReduce,
    /// Anything the fusion engine has no special knowledge of.
    Opaque,
}

impl OpKind {
    /// Compute-heavy kinds whose slice info seeds a fused kernel.
    pub fn is_anchor(self) -> bool {
        matches!(
            self,
            Self::Convolution | Self::DepthwiseConvolution | Self::MatMul | Self::Pool2d
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Convolution => "Convolution",
            Self::DepthwiseConvolution => "DepthwiseConvolution",
            Self::MatMul => "MatMul",
            Self::ElemWise => "ElemWise",
            Self::Broadcast => "Broadcast",
            Self::Dequant => "Dequant",
            Self::DequantS16 => "DequantS16",
            Self::Requant => "Requant",
            Self::RequantS16 => "RequantS16",
            Self::Quant => "Quant",
            Self::Pool2d => "Pool2d",
            Self::StridedRead => "StridedRead",
            Self::StridedWrite => "StridedWrite",
            Self::ReadSelect => "ReadSelect",
            Self::WriteSelect => "WriteSelect",
            Self::CommReduce => "CommReduce",
            Self::Opaque => "Opaque",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Convolution" => Self::Convolution,
            "DepthwiseConvolution" => Self::DepthwiseConvolution,
            "MatMul" => Self::MatMul,
            "ElemWise" => Self::ElemWise,
            "Broadcast" => Self::Broadcast,
            "Dequant" => Self::Dequant,
            "DequantS16" => Self::DequantS16,
            "Requant" => Self::Requant,
            "RequantS16" => Self::RequantS16,
            "Quant" => Self::Quant,
            "Pool2d" => Self::Pool2d,
            "StridedRead" => Self::StridedRead,
            "StridedWrite" => Self::StridedWrite,
            "ReadSelect" => Self::ReadSelect,
            "WriteSelect" => Self::WriteSelect,
            "CommReduce" => Self::CommReduce,
            "Opaque" => Self::Opaque,
            other => return Err(GraphError::UnknownOpKind(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_detection() {
        assert!(TensorDesc::new(vec![1, 1, 1, 1], Format::Nchw, DataType::Float16).is_scalar());
        assert!(TensorDesc::new(vec![], Format::Nd, DataType::Float16).is_scalar());
        assert!(!TensorDesc::new(vec![1, 16, 1, 1], Format::Nchw, DataType::Float16).is_scalar());
    }

    #[test]
    fn channels_per_layout() {
        let nchw = TensorDesc::new(vec![1, 8, 4, 4], Format::Nchw, DataType::Float16);
        let nhwc = TensorDesc::new(vec![1, 4, 4, 8], Format::Nhwc, DataType::Float16);
        let nc1hwc0 = TensorDesc::new(vec![1, 2, 4, 4, 16], Format::Nc1hwc0, DataType::Float16);
        assert_eq!(nchw.channels(), Some(8));
        assert_eq!(nhwc.channels(), Some(8));
        assert_eq!(nc1hwc0.channels(), Some(32));
        assert_eq!(nc1hwc0.width(), Some(4));
        let nd = TensorDesc::new(vec![8], Format::Nd, DataType::Float16);
        assert_eq!(nd.channels(), None);
        let huge = TensorDesc::new(vec![1, i64::MAX, 4, 4, 16], Format::Nc1hwc0, DataType::Float16);
        assert_eq!(huge.channels(), None);
    }

    #[test]
    fn dtype_sizes() {
        assert_eq!(DataType::Float32.size_bytes(), 4);
        assert_eq!(DataType::Float16.size_bytes(), 2);
        assert_eq!(DataType::Int8.size_bytes(), 1);
    }

    #[test]
    fn op_kind_parse_and_display() {
        for kind in [OpKind::Convolution, OpKind::StridedWrite, OpKind::CommReduce] {
            assert_eq!(kind.to_string().parse::<OpKind>().unwrap(), kind);
        }
        assert!("Bogus".parse::<OpKind>().is_err());
    }

    #[test]
    fn format_serde_names() {
        let json = serde_json::to_string(&Format::Nc1hwc0).unwrap();
        assert_eq!(json, "\"NC1HWC0\"");
        let back: Format = serde_json::from_str("\"FRACTAL_Z\"").unwrap();
        assert_eq!(back, Format::FractalZ);
    }
}
