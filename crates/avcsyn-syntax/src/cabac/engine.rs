//! CABAC 算术解码引擎 (H.264 9.3.3.2).
//!
//! 寄存器为 9 位 codIRange / codIOffset, 重归一化逐位从比特源读取.
//! 引擎本身不持有比特源, 每次调用由外部传入.

use avcsyn_core::{AvcError, AvcResult, BitSource};

use super::state::{ContextVariable, RANGE_TAB_LPS};

/// 算术解码引擎寄存器
#[derive(Debug, Clone, Copy)]
pub struct ArithmeticDecoder {
    range: u32,
    offset: u32,
}

impl ArithmeticDecoder {
    /// 初始化引擎: codIRange=510, codIOffset=read_bits(9)
    pub fn init<S: BitSource + ?Sized>(source: &mut S) -> AvcResult<Self> {
        let offset = source.read_bits(9)?;
        if offset >= 510 {
            return Err(AvcError::StructuralViolation(format!(
                "CABAC: codIOffset 初始化值非法, value={}",
                offset
            )));
        }
        Ok(Self { range: 510, offset })
    }

    /// 当前 codIRange
    pub fn range(&self) -> u32 {
        self.range
    }

    /// 当前 codIOffset
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// 上下文模式解码一个 bin, 并更新上下文状态
    pub fn decode_decision<S: BitSource + ?Sized>(
        &mut self,
        source: &mut S,
        ctx: &mut ContextVariable,
    ) -> AvcResult<u8> {
        let q_idx = ((self.range >> 6) & 3) as usize;
        let r_lps = u32::from(RANGE_TAB_LPS[usize::from(ctx.state_idx & 63)][q_idx]);
        self.range -= r_lps;

        let bin = if self.offset >= self.range {
            self.offset -= self.range;
            self.range = r_lps;
            ctx.mps ^ 1
        } else {
            ctx.mps
        };
        ctx.apply(bin);
        self.renorm(source)?;
        Ok(bin)
    }

    /// 旁路模式解码一个 bin
    pub fn decode_bypass<S: BitSource + ?Sized>(&mut self, source: &mut S) -> AvcResult<u8> {
        self.offset = (self.offset << 1) | source.read_bit()?;
        if self.offset >= self.range {
            self.offset -= self.range;
            Ok(1)
        } else {
            Ok(0)
        }
    }

    /// 终止模式解码一个 bin (end_of_slice_flag 与 I_PCM 判定)
    ///
    /// 返回 1 时不做重归一化, 最后读入的位即为停止位或 PCM 对齐位之前的位.
    pub fn decode_terminate<S: BitSource + ?Sized>(&mut self, source: &mut S) -> AvcResult<u8> {
        self.range -= 2;
        if self.offset >= self.range {
            return Ok(1);
        }
        self.renorm(source)?;
        Ok(0)
    }

    fn renorm<S: BitSource + ?Sized>(&mut self, source: &mut S) -> AvcResult<()> {
        while self.range < 256 {
            self.range <<= 1;
            self.offset = (self.offset << 1) | source.read_bit()?;
        }
        Ok(())
    }
}
