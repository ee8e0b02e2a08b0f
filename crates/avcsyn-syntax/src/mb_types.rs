//! 宏块类型与子宏块类型 (H.264 表 7-11 ~ 7-18).

use avcsyn_core::{AvcError, AvcResult};

/// 分区的预测方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartPred {
    /// 仅 list0
    L0,
    /// 仅 list1
    L1,
    /// 双向
    Bi,
}

impl PartPred {
    /// 是否使用指定参考列表
    pub fn uses_list(self, list: usize) -> bool {
        match self {
            PartPred::L0 => list == 0,
            PartPred::L1 => list == 1,
            PartPred::Bi => true,
        }
    }
}

/// 宏块预测模式 (MbPartPredMode)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredMode {
    /// Intra_4x4
    Intra4x4,
    /// Intra_8x8
    Intra8x8,
    /// Intra_16x16
    Intra16x16,
    /// 直接预测
    Direct,
    /// 帧间预测
    Inter(PartPred),
    /// I_PCM / SI 等无分区预测
    None,
}

/// 宏块类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MbType {
    /// I_NxN (Intra_4x4 或 Intra_8x8, 由 transform_size_8x8_flag 区分)
    #[default]
    INxN,
    /// I_16x16_<pred>_<chroma>_<luma>
    I16x16 {
        /// Intra16x16PredMode
        pred_mode: u8,
        /// CodedBlockPatternChroma
        cbp_chroma: u8,
        /// CodedBlockPatternLuma (0 或 15)
        cbp_luma: u8,
    },
    /// I_PCM
    IPcm,
    /// SI
    Si,
    /// P_L0_16x16
    PL016x16,
    /// P_L0_L0_16x8
    PL0L016x8,
    /// P_L0_L0_8x16
    PL0L08x16,
    /// P_8x8
    P8x8,
    /// P_8x8ref0 (仅 CAVLC)
    P8x8Ref0,
    /// P_Skip
    PSkip,
    /// B_Direct_16x16
    BDirect16x16,
    /// B_X_16x16
    B16x16(PartPred),
    /// B_X_Y_16x8
    B16x8(PartPred, PartPred),
    /// B_X_Y_8x16
    B8x16(PartPred, PartPred),
    /// B_8x8
    B8x8,
    /// B_Skip
    BSkip,
}

/// B 16x8/8x16 的预测方向组合, 按 mb_type 4..21 的顺序
const B_PAIR_PREDS: [(PartPred, PartPred); 9] = [
    (PartPred::L0, PartPred::L0),
    (PartPred::L1, PartPred::L1),
    (PartPred::L0, PartPred::L1),
    (PartPred::L1, PartPred::L0),
    (PartPred::L0, PartPred::Bi),
    (PartPred::L1, PartPred::Bi),
    (PartPred::Bi, PartPred::L0),
    (PartPred::Bi, PartPred::L1),
    (PartPred::Bi, PartPred::Bi),
];

impl MbType {
    /// I slice 中的 mb_type 数值 (0..=25)
    pub fn from_i(raw: u32) -> AvcResult<Self> {
        match raw {
            0 => Ok(MbType::INxN),
            1..=24 => {
                let v = (raw - 1) as u8;
                Ok(MbType::I16x16 {
                    pred_mode: v % 4,
                    cbp_chroma: (v / 4) % 3,
                    cbp_luma: if raw >= 13 { 15 } else { 0 },
                })
            }
            25 => Ok(MbType::IPcm),
            _ => Err(AvcError::InvalidData(format!(
                "H.264: I slice mb_type 非法, value={}",
                raw
            ))),
        }
    }

    /// SI slice 中的 mb_type 数值
    pub fn from_si(raw: u32) -> AvcResult<Self> {
        if raw == 0 {
            Ok(MbType::Si)
        } else {
            Self::from_i(raw - 1)
        }
    }

    /// P/SP slice 中的 mb_type 数值
    pub fn from_p(raw: u32) -> AvcResult<Self> {
        match raw {
            0 => Ok(MbType::PL016x16),
            1 => Ok(MbType::PL0L016x8),
            2 => Ok(MbType::PL0L08x16),
            3 => Ok(MbType::P8x8),
            4 => Ok(MbType::P8x8Ref0),
            _ => Self::from_i(raw - 5),
        }
    }

    /// B slice 中的 mb_type 数值
    pub fn from_b(raw: u32) -> AvcResult<Self> {
        match raw {
            0 => Ok(MbType::BDirect16x16),
            1 => Ok(MbType::B16x16(PartPred::L0)),
            2 => Ok(MbType::B16x16(PartPred::L1)),
            3 => Ok(MbType::B16x16(PartPred::Bi)),
            4..=21 => {
                let idx = (raw - 4) as usize;
                let (first, second) = B_PAIR_PREDS[idx / 2];
                if idx % 2 == 0 {
                    Ok(MbType::B16x8(first, second))
                } else {
                    Ok(MbType::B8x16(first, second))
                }
            }
            22 => Ok(MbType::B8x8),
            _ => Self::from_i(raw - 23),
        }
    }

    /// 是否为帧内宏块 (含 I_PCM 与 SI)
    pub fn is_intra(self) -> bool {
        matches!(
            self,
            MbType::INxN | MbType::I16x16 { .. } | MbType::IPcm | MbType::Si
        )
    }

    /// 是否为跳过宏块
    pub fn is_skip(self) -> bool {
        matches!(self, MbType::PSkip | MbType::BSkip)
    }

    /// 是否为 B_Skip / B_Direct_16x16
    pub fn is_b_direct(self) -> bool {
        matches!(self, MbType::BSkip | MbType::BDirect16x16)
    }

    /// 是否为 8x8 子宏块划分
    pub fn is_8x8(self) -> bool {
        matches!(self, MbType::P8x8 | MbType::P8x8Ref0 | MbType::B8x8)
    }

    /// NumMbPart
    pub fn num_mb_part(self) -> usize {
        match self {
            MbType::PL016x16 | MbType::PSkip | MbType::B16x16(_) => 1,
            MbType::PL0L016x8 | MbType::PL0L08x16 | MbType::B16x8(..) | MbType::B8x16(..) => 2,
            MbType::P8x8 | MbType::P8x8Ref0 | MbType::B8x8 | MbType::BSkip
            | MbType::BDirect16x16 => 4,
            _ => 1,
        }
    }

    /// 分区宽高 (MbPartWidth, MbPartHeight)
    pub fn part_size(self) -> (u8, u8) {
        match self {
            MbType::PL0L016x8 | MbType::B16x8(..) => (16, 8),
            MbType::PL0L08x16 | MbType::B8x16(..) => (8, 16),
            MbType::P8x8 | MbType::P8x8Ref0 | MbType::B8x8 | MbType::BSkip
            | MbType::BDirect16x16 => (8, 8),
            _ => (16, 16),
        }
    }

    /// MbPartPredMode(mb_type, mbPartIdx)
    pub fn part_pred_mode(self, mb_part_idx: usize, transform_8x8: bool) -> PredMode {
        match self {
            MbType::INxN if transform_8x8 => PredMode::Intra8x8,
            MbType::INxN => PredMode::Intra4x4,
            MbType::I16x16 { .. } => PredMode::Intra16x16,
            MbType::IPcm => PredMode::None,
            MbType::Si => PredMode::Intra4x4,
            MbType::PL016x16 | MbType::PL0L016x8 | MbType::PL0L08x16 | MbType::PSkip => {
                PredMode::Inter(PartPred::L0)
            }
            MbType::P8x8 | MbType::P8x8Ref0 | MbType::B8x8 => PredMode::None,
            MbType::BDirect16x16 | MbType::BSkip => PredMode::Direct,
            MbType::B16x16(pred) => PredMode::Inter(pred),
            MbType::B16x8(first, second) | MbType::B8x16(first, second) => {
                PredMode::Inter(if mb_part_idx == 0 { first } else { second })
            }
        }
    }
}

/// 子宏块分区形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubShape {
    /// 8x8
    S8x8,
    /// 8x4
    S8x4,
    /// 4x8
    S4x8,
    /// 4x4
    S4x4,
}

/// 子宏块类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubMbType {
    /// 预测方向, `None` 表示 B_Direct_8x8
    pub pred: Option<PartPred>,
    /// 分区形状
    pub shape: SubShape,
}

impl Default for SubMbType {
    fn default() -> Self {
        Self {
            pred: Some(PartPred::L0),
            shape: SubShape::S8x8,
        }
    }
}

impl SubMbType {
    /// P slice sub_mb_type (0..=3)
    pub fn from_p(raw: u32) -> AvcResult<Self> {
        let shape = match raw {
            0 => SubShape::S8x8,
            1 => SubShape::S8x4,
            2 => SubShape::S4x8,
            3 => SubShape::S4x4,
            _ => {
                return Err(AvcError::InvalidData(format!(
                    "H.264: P sub_mb_type 非法, value={}",
                    raw
                )));
            }
        };
        Ok(Self {
            pred: Some(PartPred::L0),
            shape,
        })
    }

    /// B slice sub_mb_type (0..=12)
    pub fn from_b(raw: u32) -> AvcResult<Self> {
        use PartPred::{Bi, L0, L1};
        use SubShape::{S4x4, S4x8, S8x4, S8x8};
        let (pred, shape) = match raw {
            0 => (None, S8x8),
            1 => (Some(L0), S8x8),
            2 => (Some(L1), S8x8),
            3 => (Some(Bi), S8x8),
            4 => (Some(L0), S8x4),
            5 => (Some(L0), S4x8),
            6 => (Some(L1), S8x4),
            7 => (Some(L1), S4x8),
            8 => (Some(Bi), S8x4),
            9 => (Some(Bi), S4x8),
            10 => (Some(L0), S4x4),
            11 => (Some(L1), S4x4),
            12 => (Some(Bi), S4x4),
            _ => {
                return Err(AvcError::InvalidData(format!(
                    "H.264: B sub_mb_type 非法, value={}",
                    raw
                )));
            }
        };
        Ok(Self { pred, shape })
    }

    /// B_Direct_8x8
    pub fn is_direct(self) -> bool {
        self.pred.is_none()
    }

    /// NumSubMbPart
    pub fn num_parts(self) -> usize {
        match self.shape {
            SubShape::S8x8 => 1,
            SubShape::S8x4 | SubShape::S4x8 => 2,
            SubShape::S4x4 => 4,
        }
    }

    /// 子分区宽高
    pub fn part_size(self) -> (u8, u8) {
        match self.shape {
            SubShape::S8x8 => (8, 8),
            SubShape::S8x4 => (8, 4),
            SubShape::S4x8 => (4, 8),
            SubShape::S4x4 => (4, 4),
        }
    }

    /// 子分区尺寸是否小于 8x8
    pub fn smaller_than_8x8(self) -> bool {
        self.shape != SubShape::S8x8
    }
}
