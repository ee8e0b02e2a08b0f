//! CABAC 概率状态机.
//!
//! 64 个概率状态的 MPS/LPS 转移表, 以及区间划分使用的 rangeTabLPS.
//! 纯查表, 无失败路径.

/// LPS 转移表 transIdxLPS
const TRANS_IDX_LPS: [u8; 64] = [
    0, 0, 1, 2, 2, 4, 4, 5, 6, 7, 8, 9, 9, 11, 11, 12, 13, 13, 15, 15, 16, 16, 18, 18, 19, 19, 21,
    21, 22, 22, 23, 24, 24, 25, 26, 26, 27, 27, 28, 29, 29, 30, 30, 30, 31, 32, 32, 33, 33, 33, 34,
    34, 35, 35, 35, 36, 36, 36, 37, 37, 37, 38, 38, 63,
];

/// MPS 转移表 transIdxMPS
const TRANS_IDX_MPS: [u8; 64] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26,
    27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50,
    51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 62, 63,
];

/// LPS 子区间宽度表 rangeTabLPS[pStateIdx][qCodIRangeIdx]
pub(crate) const RANGE_TAB_LPS: [[u8; 4]; 64] = [
    [128, 176, 208, 240],
    [128, 167, 197, 227],
    [128, 158, 187, 216],
    [123, 150, 178, 205],
    [116, 142, 169, 195],
    [111, 135, 160, 185],
    [105, 128, 152, 175],
    [100, 122, 144, 166],
    [95, 116, 137, 158],
    [90, 110, 130, 150],
    [85, 104, 123, 142],
    [81, 99, 117, 135],
    [77, 94, 111, 128],
    [73, 89, 105, 122],
    [69, 85, 100, 116],
    [66, 80, 95, 110],
    [62, 76, 90, 104],
    [59, 72, 86, 99],
    [56, 69, 81, 94],
    [53, 65, 77, 89],
    [51, 62, 73, 85],
    [48, 59, 69, 80],
    [46, 56, 66, 76],
    [43, 53, 63, 72],
    [41, 50, 59, 69],
    [39, 48, 56, 65],
    [37, 45, 54, 62],
    [35, 43, 51, 59],
    [33, 41, 48, 56],
    [32, 39, 46, 53],
    [30, 37, 43, 50],
    [29, 35, 41, 48],
    [27, 33, 39, 45],
    [26, 31, 37, 43],
    [24, 30, 35, 41],
    [23, 28, 33, 39],
    [22, 27, 32, 37],
    [21, 26, 30, 35],
    [20, 24, 29, 33],
    [19, 23, 27, 31],
    [18, 22, 26, 30],
    [17, 21, 25, 28],
    [16, 20, 23, 27],
    [15, 19, 22, 25],
    [14, 18, 21, 24],
    [14, 17, 20, 23],
    [13, 16, 19, 22],
    [12, 15, 18, 21],
    [12, 14, 17, 20],
    [11, 14, 16, 19],
    [11, 13, 15, 18],
    [10, 12, 15, 17],
    [10, 12, 14, 16],
    [9, 11, 13, 15],
    [9, 11, 12, 14],
    [8, 10, 12, 14],
    [8, 9, 11, 13],
    [7, 9, 11, 12],
    [7, 9, 10, 12],
    [7, 8, 10, 11],
    [6, 8, 9, 11],
    [6, 7, 9, 10],
    [6, 7, 8, 9],
    [2, 2, 2, 2],
];

/// 单个上下文变量: (pStateIdx, valMPS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextVariable {
    /// 概率状态索引 [0, 63]
    pub state_idx: u8,
    /// 最可能符号
    pub mps: u8,
}

impl ContextVariable {
    /// 由 (m, n) 初始化参数与 SliceQPY 计算初始状态
    pub fn from_init(m: i32, n: i32, slice_qp: i32) -> Self {
        let qp = slice_qp.clamp(0, 51);
        let pre = (((m * qp) >> 4) + n).clamp(1, 126);
        if pre <= 63 {
            Self {
                state_idx: (63 - pre) as u8,
                mps: 0,
            }
        } else {
            Self {
                state_idx: (pre - 64) as u8,
                mps: 1,
            }
        }
    }

    /// 按已解码的 bin 值更新状态
    pub fn apply(&mut self, bin: u8) {
        if bin == self.mps {
            self.state_idx = next_on_mps(self.state_idx);
        } else {
            if self.state_idx == 0 {
                self.mps ^= 1;
            }
            self.state_idx = next_on_lps(self.state_idx);
        }
    }
}

/// MPS 路径下的下一状态
pub fn next_on_mps(state_idx: u8) -> u8 {
    TRANS_IDX_MPS[usize::from(state_idx & 63)]
}

/// LPS 路径下的下一状态
pub fn next_on_lps(state_idx: u8) -> u8 {
    TRANS_IDX_LPS[usize::from(state_idx & 63)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_tables_stay_in_range() {
        for s in 0u8..64 {
            assert!(next_on_mps(s) < 64, "MPS 转移越界, state={}", s);
            assert!(next_on_lps(s) < 64, "LPS 转移越界, state={}", s);
        }
    }

    #[test]
    fn test_lps_at_state_zero_flips_mps() {
        let mut ctx = ContextVariable {
            state_idx: 0,
            mps: 1,
        };
        ctx.apply(0);
        assert_eq!(ctx.mps, 0);
        assert_eq!(ctx.state_idx, 0);

        let mut ctx = ContextVariable {
            state_idx: 10,
            mps: 1,
        };
        ctx.apply(0);
        assert_eq!(ctx.mps, 1, "非零状态的 LPS 不应翻转 MPS");
        assert_eq!(ctx.state_idx, 8);
        ctx.apply(1);
        assert_eq!(ctx.state_idx, 9);
    }

    #[test]
    fn test_mps_saturates_at_62() {
        let mut ctx = ContextVariable {
            state_idx: 62,
            mps: 0,
        };
        ctx.apply(0);
        assert_eq!(ctx.state_idx, 62);
    }

    #[test]
    fn test_from_init_boundaries() {
        // preCtxState = clip(1, 126, ((m * qp) >> 4) + n)
        let ctx = ContextVariable::from_init(0, 64, 26);
        assert_eq!(ctx, ContextVariable { state_idx: 0, mps: 1 });
        let ctx = ContextVariable::from_init(0, 63, 26);
        assert_eq!(ctx, ContextVariable { state_idx: 0, mps: 0 });
        let ctx = ContextVariable::from_init(0, -40, 26);
        assert_eq!(ctx, ContextVariable { state_idx: 62, mps: 0 });
        let ctx = ContextVariable::from_init(0, 127, 26);
        assert_eq!(ctx, ContextVariable { state_idx: 62, mps: 1 });
        // QP 超出 [0, 51] 时先钳位
        assert_eq!(
            ContextVariable::from_init(16, 0, 80),
            ContextVariable::from_init(16, 0, 51)
        );
    }

    #[test]
    fn test_range_tab_monotonic_per_row() {
        for row in RANGE_TAB_LPS.iter() {
            assert!(row[0] <= row[1] && row[1] <= row[2] && row[2] <= row[3]);
        }
    }
}
