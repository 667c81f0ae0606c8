//! Axis-split metadata and its persisted JSON form.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Overlap value meaning "unbounded or unknown".
pub const UNBOUNDED_OVERLAP: i64 = -1;

/// Channel axis of the blocked feature-map and weight layouts.
pub const CHANNEL_AXIS: i64 = 1;

/// Splittable axes of one kernel input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSplitInfo {
    #[serde(rename = "idx")]
    pub index: usize,
    pub axis: Vec<i64>,
    #[serde(rename = "headOverLap")]
    pub head_overlap: Vec<i64>,
    #[serde(rename = "tailOverLap")]
    pub tail_overlap: Vec<i64>,
}

impl InputSplitInfo {
    /// Split on `axis` with no overlap between neighbouring slices.
    pub fn new(index: usize, axis: Vec<i64>) -> Self {
        let zeros = vec![0; axis.len()];
        Self {
            index,
            axis,
            head_overlap: zeros.clone(),
            tail_overlap: zeros,
        }
    }

    /// Split on `axis` with the same head/tail overlap on every axis.
    pub fn with_overlap(mut self, head: i64, tail: i64) -> Self {
        self.head_overlap = vec![head; self.axis.len()];
        self.tail_overlap = vec![tail; self.axis.len()];
        self
    }

    /// Split on `axis` with unbounded head/tail overlap.
    pub fn unbounded(index: usize, axis: Vec<i64>) -> Self {
        Self::new(index, axis).with_overlap(UNBOUNDED_OVERLAP, UNBOUNDED_OVERLAP)
    }
}

/// Splittable axes of one kernel output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSplitInfo {
    #[serde(rename = "idx")]
    pub index: usize,
    pub axis: Vec<i64>,
}

impl OutputSplitInfo {
    pub fn new(index: usize, axis: Vec<i64>) -> Self {
        Self { index, axis }
    }
}

/// One legal simultaneous split choice across the kernel's operands.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSplitMap {
    #[serde(rename = "inputList")]
    pub inputs: Vec<InputSplitInfo>,
    #[serde(rename = "outputList")]
    pub outputs: Vec<OutputSplitInfo>,
}

impl AxisSplitMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, info: InputSplitInfo) -> Self {
        self.inputs.push(info);
        self
    }

    pub fn with_output(mut self, info: OutputSplitInfo) -> Self {
        self.outputs.push(info);
        self
    }

    pub fn input(&self, index: usize) -> Option<&InputSplitInfo> {
        self.inputs.iter().find(|i| i.index == index)
    }

    pub fn output(&self, index: usize) -> Option<&OutputSplitInfo> {
        self.outputs.iter().find(|o| o.index == index)
    }

    /// Axes of the primary (index 0) output.
    pub fn primary_output_axes(&self) -> Option<&[i64]> {
        self.output(0).map(|o| o.axis.as_slice())
    }

    /// Returns `true` if the map splits the primary output on the channel axis.
    pub fn splits_channel(&self) -> bool {
        self.primary_output_axes()
            .is_some_and(|axes| axes.contains(&CHANNEL_AXIS))
    }
}

/// Whether adjacent kernels may share the L1 buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum L1FusionEnable {
    Disabled,
    Basic,
    /// Enabled, with input placement controlled by the scheduler.
    #[default]
    InputControlled,
}

impl From<L1FusionEnable> for i64 {
    fn from(v: L1FusionEnable) -> Self {
        match v {
            L1FusionEnable::Disabled => 0,
            L1FusionEnable::Basic => 1,
            L1FusionEnable::InputControlled => 2,
        }
    }
}

impl TryFrom<i64> for L1FusionEnable {
    type Error = String;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Basic),
            2 => Ok(Self::InputControlled),
            other => Err(format!("invalid l1FusionEnable value {other}")),
        }
    }
}

impl fmt::Display for L1FusionEnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "disabled",
            Self::Basic => "basic",
            Self::InputControlled => "input-controlled",
        })
    }
}

/// Complete slice metadata of a (fused) kernel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCalcInfo {
    #[serde(rename = "splitMaps")]
    pub split_maps: Vec<AxisSplitMap>,
    #[serde(rename = "l1FusionEnable", default)]
    pub l1_fusion_enable: L1FusionEnable,
    #[serde(rename = "minTbeL1Space", default)]
    pub min_tbe_l1_space: i64,
}

#[derive(Serialize, Deserialize)]
struct SliceInfoDocument {
    #[serde(rename = "_op_slice_info")]
    info: OpCalcInfo,
}

impl OpCalcInfo {
    pub fn new(split_maps: Vec<AxisSplitMap>) -> Self {
        Self {
            split_maps,
            ..Self::default()
        }
    }

    /// Encode in the persisted `{"_op_slice_info": {...}}` form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&SliceInfoDocument { info: self.clone() })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let doc: SliceInfoDocument = serde_json::from_str(text)?;
        Ok(doc.info)
    }
}
