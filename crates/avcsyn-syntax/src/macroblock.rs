//! 宏块语法输出.

use crate::mb_types::{MbType, SubMbType};

/// 一个颜色分量的残差系数 (亮度, 或 4:4:4 下的 Cb/Cr)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneResidual {
    /// Intra16x16 DC
    pub dc: [i32; 16],
    /// Intra16x16 AC, 按 luma4x4BlkIdx
    pub ac: [[i32; 15]; 16],
    /// 4x4 变换块
    pub level4x4: [[i32; 16]; 16],
    /// 8x8 变换块
    pub level8x8: [[i32; 64]; 4],
}

impl Default for PlaneResidual {
    fn default() -> Self {
        Self {
            dc: [0; 16],
            ac: [[0; 15]; 16],
            level4x4: [[0; 16]; 16],
            level8x8: [[0; 64]; 4],
        }
    }
}

/// 4:2:0 / 4:2:2 色度残差
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChromaResidual {
    /// [iCbCr][4 * NumC8x8]
    pub dc: [[i32; 8]; 2],
    /// [iCbCr][chroma4x4BlkIdx]
    pub ac: [[[i32; 15]; 8]; 2],
}

/// 宏块残差
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResidualData {
    /// 下标 0 为亮度, 1/2 仅在 ChromaArrayType 为 3 时使用
    pub planes: [PlaneResidual; 3],
    pub chroma: ChromaResidual,
}

impl ResidualData {
    /// 所有系数均为 0
    pub fn is_zero(&self) -> bool {
        let plane_zero = |p: &PlaneResidual| {
            p.dc.iter().all(|&v| v == 0)
                && p.ac.iter().flatten().all(|&v| v == 0)
                && p.level4x4.iter().flatten().all(|&v| v == 0)
                && p.level8x8.iter().flatten().all(|&v| v == 0)
        };
        self.planes.iter().all(plane_zero)
            && self.chroma.dc.iter().flatten().all(|&v| v == 0)
            && self.chroma.ac.iter().flatten().flatten().all(|&v| v == 0)
    }
}

/// I_PCM 样本
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcmSamples {
    /// 256 个亮度样本
    pub luma: Vec<u16>,
    /// 2 * MbWidthC * MbHeightC 个色度样本, Cb 在前
    pub chroma: Vec<u16>,
}

/// 一个宏块的全部语法值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroblockInfo {
    pub mb_addr: u32,
    pub slice_num: u32,
    pub mb_type: MbType,
    pub sub_mb_types: [SubMbType; 4],
    /// 按场解码
    pub field: bool,
    pub skip: bool,
    pub transform_8x8: bool,
    /// Intra4x4 (16 项) / Intra8x8 (前 4 项) 预测模式语法:
    /// `None` 表示 prev_intra_pred_mode_flag = 1, 否则为 rem_intra_pred_mode
    pub intra_pred_modes: [Option<u8>; 16],
    pub intra_chroma_pred_mode: u8,
    /// [list][mbPartIdx]
    pub ref_idx: [[i8; 4]; 2],
    /// [list][mbPartIdx][subMbPartIdx][compIdx]
    pub mvd: [[[[i32; 2]; 4]; 4]; 2],
    /// CodedBlockPatternLuma | CodedBlockPatternChroma << 4
    pub coded_block_pattern: u8,
    pub mb_qp_delta: i32,
    pub qp_y: i32,
    /// 每个分量的 coded_block_flag 位, 布局同邻居摘要
    pub coded_block_flags: [u32; 3],
    pub residual: Option<Box<ResidualData>>,
    pub pcm: Option<PcmSamples>,
}

impl MacroblockInfo {
    pub fn new(mb_addr: u32, slice_num: u32) -> Self {
        Self {
            mb_addr,
            slice_num,
            mb_type: MbType::default(),
            sub_mb_types: [SubMbType::default(); 4],
            field: false,
            skip: false,
            transform_8x8: false,
            intra_pred_modes: [None; 16],
            intra_chroma_pred_mode: 0,
            ref_idx: [[-1; 4]; 2],
            mvd: [[[[0; 2]; 4]; 4]; 2],
            coded_block_pattern: 0,
            mb_qp_delta: 0,
            qp_y: 0,
            coded_block_flags: [0; 3],
            residual: None,
            pcm: None,
        }
    }

    pub fn cbp_luma(&self) -> u8 {
        self.coded_block_pattern & 0x0F
    }

    pub fn cbp_chroma(&self) -> u8 {
        self.coded_block_pattern >> 4
    }

    pub fn is_intra(&self) -> bool {
        self.mb_type.is_intra()
    }

    /// 非零系数个数
    pub fn nonzero_coefficients(&self) -> usize {
        let Some(res) = self.residual.as_deref() else {
            return 0;
        };
        let plane = |p: &PlaneResidual| {
            p.dc.iter()
                .chain(p.ac.iter().flatten())
                .chain(p.level4x4.iter().flatten())
                .chain(p.level8x8.iter().flatten())
                .filter(|&&v| v != 0)
                .count()
        };
        res.planes.iter().map(plane).sum::<usize>()
            + res
                .chroma
                .dc
                .iter()
                .flatten()
                .chain(res.chroma.ac.iter().flatten().flatten())
                .filter(|&&v| v != 0)
                .count()
    }
}
