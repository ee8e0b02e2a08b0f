//! 解析器配置.

use serde::{Deserialize, Serialize};

/// 一元二值化的默认 bin 上限
pub const DEFAULT_MAX_UNARY_BINS: u32 = 10_000;

/// UEGk 后缀转义位的默认上限
pub const DEFAULT_MAX_ESCAPE_BITS: u32 = 32;

/// RBSP 语法解析器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// 一元二值化允许的最大 bin 数
    pub max_unary_bins: u32,
    /// UEGk 后缀允许的最大转义位数
    pub max_escape_bits: u32,
    /// 遇到可恢复错误时跳过当前 slice 并继续
    pub skip_corrupt_slices: bool,
    /// 输出的 MacroblockInfo 是否携带残差系数
    pub emit_coefficients: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_unary_bins: DEFAULT_MAX_UNARY_BINS,
            max_escape_bits: DEFAULT_MAX_ESCAPE_BITS,
            skip_corrupt_slices: false,
            emit_coefficients: true,
        }
    }
}

impl ParserConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_unary_bins(mut self, limit: u32) -> Self {
        self.max_unary_bins = limit.max(1);
        self
    }

    pub fn with_max_escape_bits(mut self, limit: u32) -> Self {
        self.max_escape_bits = limit;
        self
    }

    pub fn with_skip_corrupt_slices(mut self, skip: bool) -> Self {
        self.skip_corrupt_slices = skip;
        self
    }

    pub fn with_emit_coefficients(mut self, emit: bool) -> Self {
        self.emit_coefficients = emit;
        self
    }
}
