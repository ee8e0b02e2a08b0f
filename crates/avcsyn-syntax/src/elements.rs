//! 语法元素的 CABAC 元数据 (H.264 表 9-34, 9-40, 9-43).

use crate::slice_header::SliceType;

// ============================================================
// 语法元素
// ============================================================

/// CABAC 编码的语法元素
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyntaxElement {
    MbType,
    MbSkipFlag,
    SubMbType,
    /// mvd_lX[][][0]
    MvdX,
    /// mvd_lX[][][1]
    MvdY,
    RefIdx,
    MbQpDelta,
    IntraChromaPredMode,
    PrevIntraPredModeFlag,
    RemIntraPredMode,
    MbFieldDecodingFlag,
    CodedBlockPattern,
    CodedBlockFlag,
    SignificantCoeffFlag,
    LastSignificantCoeffFlag,
    CoeffAbsLevelMinus1,
    CoeffSignFlag,
    EndOfSliceFlag,
    TransformSize8x8Flag,
}

/// 前缀或后缀的上下文参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinSection {
    /// maxBinIdxCtx
    pub max_bin_idx_ctx: u8,
    /// ctxIdxOffset, 旁路解码时为 `None`
    pub ctx_idx_offset: Option<u16>,
}

impl BinSection {
    const fn ctx(max_bin_idx_ctx: u8, offset: u16) -> Self {
        Self {
            max_bin_idx_ctx,
            ctx_idx_offset: Some(offset),
        }
    }

    const BYPASS: Self = Self {
        max_bin_idx_ctx: 0,
        ctx_idx_offset: None,
    };

    /// 是否为旁路解码 (bypassFlag)
    pub fn is_bypass(&self) -> bool {
        self.ctx_idx_offset.is_none()
    }
}

/// 语法元素的上下文元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementInfo {
    pub prefix: BinSection,
    pub suffix: Option<BinSection>,
}

impl ElementInfo {
    const fn single(max_bin_idx_ctx: u8, offset: u16) -> Self {
        Self {
            prefix: BinSection::ctx(max_bin_idx_ctx, offset),
            suffix: None,
        }
    }

    const fn split(prefix: BinSection, suffix: BinSection) -> Self {
        Self {
            prefix,
            suffix: Some(suffix),
        }
    }
}

/// 查询语法元素的 (maxBinIdxCtx, ctxIdxOffset, bypassFlag)
///
/// 残差元素需要给出块类别与帧/场编码方式; 不适用于当前 slice 类型的元素返回 `None`.
pub fn element_info(
    element: SyntaxElement,
    slice_type: SliceType,
    cat: Option<BlockCat>,
    field_coded: bool,
) -> Option<ElementInfo> {
    use SyntaxElement::*;
    let info = match element {
        MbType => match slice_type {
            SliceType::Si => ElementInfo::split(BinSection::ctx(0, 0), BinSection::ctx(6, 3)),
            SliceType::I => ElementInfo::single(6, 3),
            SliceType::P | SliceType::Sp => {
                ElementInfo::split(BinSection::ctx(2, 14), BinSection::ctx(5, 17))
            }
            SliceType::B => ElementInfo::split(BinSection::ctx(3, 27), BinSection::ctx(5, 32)),
        },
        MbSkipFlag => match slice_type {
            SliceType::P | SliceType::Sp => ElementInfo::single(0, 11),
            SliceType::B => ElementInfo::single(0, 24),
            _ => return None,
        },
        SubMbType => match slice_type {
            SliceType::P | SliceType::Sp => ElementInfo::single(2, 21),
            SliceType::B => ElementInfo::single(3, 36),
            _ => return None,
        },
        MvdX => ElementInfo::split(BinSection::ctx(4, 40), BinSection::BYPASS),
        MvdY => ElementInfo::split(BinSection::ctx(4, 47), BinSection::BYPASS),
        RefIdx => ElementInfo::single(2, 54),
        MbQpDelta => ElementInfo::single(2, 60),
        IntraChromaPredMode => ElementInfo::single(1, 64),
        PrevIntraPredModeFlag => ElementInfo::single(0, 68),
        RemIntraPredMode => ElementInfo::single(0, 69),
        MbFieldDecodingFlag => ElementInfo::single(0, 70),
        CodedBlockPattern => ElementInfo::split(BinSection::ctx(3, 73), BinSection::ctx(1, 77)),
        CodedBlockFlag => ElementInfo::single(0, cat?.cbf_offset()),
        SignificantCoeffFlag => ElementInfo::single(0, cat?.sig_offset(field_coded)),
        LastSignificantCoeffFlag => ElementInfo::single(0, cat?.last_offset(field_coded)),
        CoeffAbsLevelMinus1 => {
            ElementInfo::split(BinSection::ctx(1, cat?.abs_offset()), BinSection::BYPASS)
        }
        CoeffSignFlag => ElementInfo {
            prefix: BinSection::BYPASS,
            suffix: None,
        },
        EndOfSliceFlag => ElementInfo::single(0, 276),
        TransformSize8x8Flag => ElementInfo::single(0, 399),
    };
    Some(info)
}

// ============================================================
// 固定的 ctxIdxOffset
// ============================================================

pub const CTX_MB_TYPE_SI_PREFIX: u16 = 0;
pub const CTX_MB_TYPE_I: u16 = 3;
pub const CTX_MB_SKIP_P: u16 = 11;
pub const CTX_MB_TYPE_P_PREFIX: u16 = 14;
pub const CTX_MB_TYPE_P_SUFFIX: u16 = 17;
pub const CTX_SUB_MB_TYPE_P: u16 = 21;
pub const CTX_MB_SKIP_B: u16 = 24;
pub const CTX_MB_TYPE_B_PREFIX: u16 = 27;
pub const CTX_MB_TYPE_B_SUFFIX: u16 = 32;
pub const CTX_SUB_MB_TYPE_B: u16 = 36;
pub const CTX_MVD_X: u16 = 40;
pub const CTX_MVD_Y: u16 = 47;
pub const CTX_REF_IDX: u16 = 54;
pub const CTX_MB_QP_DELTA: u16 = 60;
pub const CTX_INTRA_CHROMA_PRED_MODE: u16 = 64;
pub const CTX_PREV_INTRA_PRED_MODE_FLAG: u16 = 68;
pub const CTX_REM_INTRA_PRED_MODE: u16 = 69;
pub const CTX_MB_FIELD_DECODING_FLAG: u16 = 70;
pub const CTX_CBP_LUMA: u16 = 73;
pub const CTX_CBP_CHROMA: u16 = 77;
pub const CTX_END_OF_SLICE: u16 = 276;
pub const CTX_TRANSFORM_SIZE_8X8: u16 = 399;

// ============================================================
// 残差块类别
// ============================================================

/// 残差块类别 ctxBlockCat (表 9-42)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockCat {
    LumaDc = 0,
    LumaAc = 1,
    Luma4x4 = 2,
    ChromaDc = 3,
    ChromaAc = 4,
    Luma8x8 = 5,
    CbDc = 6,
    CbAc = 7,
    Cb4x4 = 8,
    Cb8x8 = 9,
    CrDc = 10,
    CrAc = 11,
    Cr4x4 = 12,
    Cr8x8 = 13,
}

/// 各类别的 ctxIdxBlockCatOffset: coded_block_flag
const CBF_CAT_OFFSET: [u16; 14] = [0, 4, 8, 12, 16, 0, 0, 4, 8, 4, 0, 4, 8, 8];
/// significant_coeff_flag / last_significant_coeff_flag
const SIG_CAT_OFFSET: [u16; 14] = [0, 15, 29, 44, 47, 0, 0, 15, 29, 0, 0, 15, 29, 0];
/// coeff_abs_level_minus1
const ABS_CAT_OFFSET: [u16; 14] = [0, 10, 20, 30, 39, 0, 0, 10, 20, 0, 0, 10, 20, 0];

/// 按类别区间的基础 ctxIdxOffset: (cbf, sig 帧, sig 场, last 帧, last 场, abs)
const fn range_offsets(cat: u8) -> [u16; 6] {
    match cat {
        0..=4 => [85, 105, 277, 166, 338, 227],
        5 => [1012, 402, 436, 417, 451, 426],
        6..=8 => [460, 484, 776, 572, 864, 952],
        9 => [1012, 660, 675, 690, 699, 708],
        10..=12 => [472, 528, 820, 616, 908, 982],
        _ => [1012, 718, 733, 748, 757, 766],
    }
}

impl BlockCat {
    /// 全部类别, 按 ctxBlockCat 顺序
    pub const ALL: [BlockCat; 14] = [
        BlockCat::LumaDc,
        BlockCat::LumaAc,
        BlockCat::Luma4x4,
        BlockCat::ChromaDc,
        BlockCat::ChromaAc,
        BlockCat::Luma8x8,
        BlockCat::CbDc,
        BlockCat::CbAc,
        BlockCat::Cb4x4,
        BlockCat::Cb8x8,
        BlockCat::CrDc,
        BlockCat::CrAc,
        BlockCat::Cr4x4,
        BlockCat::Cr8x8,
    ];

    /// ctxBlockCat 数值
    pub fn index(self) -> usize {
        self as usize
    }

    /// 对应颜色分量 (0=Y, 1=Cb, 2=Cr); 4:2:0/4:2:2 色度 DC/AC 由调用方给出分量
    pub fn plane(self) -> usize {
        match self.index() {
            0..=5 => 0,
            6..=9 => 1,
            _ => 2,
        }
    }

    /// 4:4:4 下与亮度同构的类别 (`plane` 为 0/1/2, `base` 为亮度类别)
    pub fn for_plane(base: BlockCat, plane: usize) -> BlockCat {
        let shift = match (base, plane) {
            (_, 0) => return base,
            (BlockCat::LumaDc | BlockCat::LumaAc | BlockCat::Luma4x4, p) => 6 + 4 * (p - 1),
            (BlockCat::Luma8x8, p) => return if p == 1 { BlockCat::Cb8x8 } else { BlockCat::Cr8x8 },
            _ => return base,
        };
        BlockCat::ALL[shift + base.index()]
    }

    /// 是否为 16 系数的 DC 块
    pub fn is_luma_dc(self) -> bool {
        matches!(self, BlockCat::LumaDc | BlockCat::CbDc | BlockCat::CrDc)
    }

    /// 是否为去掉 DC 的 15 系数块
    pub fn is_ac(self) -> bool {
        matches!(
            self,
            BlockCat::LumaAc | BlockCat::ChromaAc | BlockCat::CbAc | BlockCat::CrAc
        )
    }

    /// 是否为 8x8 变换块
    pub fn is_8x8(self) -> bool {
        matches!(self, BlockCat::Luma8x8 | BlockCat::Cb8x8 | BlockCat::Cr8x8)
    }

    /// coded_block_flag 的 ctxIdxOffset + ctxIdxBlockCatOffset
    pub fn cbf_offset(self) -> u16 {
        range_offsets(self as u8)[0] + CBF_CAT_OFFSET[self.index()]
    }

    /// significant_coeff_flag 的基础上下文
    pub fn sig_offset(self, field_coded: bool) -> u16 {
        let offsets = range_offsets(self as u8);
        let base = if field_coded { offsets[2] } else { offsets[1] };
        base + SIG_CAT_OFFSET[self.index()]
    }

    /// last_significant_coeff_flag 的基础上下文
    pub fn last_offset(self, field_coded: bool) -> u16 {
        let offsets = range_offsets(self as u8);
        let base = if field_coded { offsets[4] } else { offsets[3] };
        base + SIG_CAT_OFFSET[self.index()]
    }

    /// coeff_abs_level_minus1 的基础上下文
    pub fn abs_offset(self) -> u16 {
        range_offsets(self as u8)[5] + ABS_CAT_OFFSET[self.index()]
    }
}

// ============================================================
// 8x8 块的 significant/last 上下文映射 (表 9-43)
// ============================================================

/// significant_coeff_flag, 帧编码
pub const SIG_8X8_FRAME: [u8; 63] = [
    0, 1, 2, 3, 4, 5, 5, 4, 4, 3, 3, 4, 4, 4, 5, 5, 4, 4, 4, 4, 3, 3, 6, 7, 7, 7, 8, 9, 10, 9, 8, 7,
    7, 6, 11, 12, 13, 11, 6, 7, 8, 9, 14, 10, 9, 8, 6, 11, 12, 13, 11, 6, 9, 14, 10, 9, 11, 12, 13,
    11, 14, 10, 12,
];

/// significant_coeff_flag, 场编码
pub const SIG_8X8_FIELD: [u8; 63] = [
    0, 1, 1, 2, 2, 3, 3, 4, 5, 6, 7, 7, 7, 8, 4, 5, 6, 9, 10, 10, 8, 11, 12, 11, 9, 9, 10, 10, 8,
    11, 12, 11, 9, 9, 10, 10, 8, 11, 12, 11, 9, 9, 10, 10, 8, 13, 13, 9, 9, 10, 10, 8, 13, 13, 9, 9,
    10, 10, 14, 14, 14, 14, 14,
];

/// last_significant_coeff_flag (帧场相同)
pub const LAST_8X8: [u8; 64] = [
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    3, 3, 3, 3, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, 5, 5, 5, 5, 6, 6, 6, 6, 7, 7, 7, 7, 8, 8, 8, 8,
];
