//! CABAC 算术编码器 (H.264 9.3.4).
//!
//! 与 [`ArithmeticDecoder`](super::ArithmeticDecoder) 严格对称,
//! 用于生成一致性测试码流和基准测试输入.

use avcsyn_core::{AvcResult, BitWriter};

use super::context::ContextStore;
use super::state::RANGE_TAB_LPS;

/// CABAC 算术编码器
pub struct CabacEncoder {
    writer: BitWriter,
    contexts: ContextStore,
    low: u32,
    range: u32,
    first_bit: bool,
    bits_outstanding: u32,
}

impl CabacEncoder {
    /// 以空输出缓冲区创建编码器
    pub fn new(contexts: ContextStore) -> Self {
        Self::with_writer(BitWriter::new(), contexts)
    }

    /// 在已有内容 (通常是 slice header) 之后继续编码
    ///
    /// 调用方负责先写好 cabac_alignment_one_bit.
    pub fn with_writer(writer: BitWriter, contexts: ContextStore) -> Self {
        Self {
            writer,
            contexts,
            low: 0,
            range: 510,
            first_bit: true,
            bits_outstanding: 0,
        }
    }

    /// 上下文模式编码一个 bin
    pub fn encode_decision(&mut self, ctx_idx: usize, bin: u8) -> AvcResult<()> {
        let ctx = self.contexts.get_mut(ctx_idx)?;
        let q_idx = ((self.range >> 6) & 3) as usize;
        let r_lps = u32::from(RANGE_TAB_LPS[usize::from(ctx.state_idx & 63)][q_idx]);
        self.range -= r_lps;
        if bin != ctx.mps {
            self.low += self.range;
            self.range = r_lps;
        }
        ctx.apply(bin);
        self.renorm();
        Ok(())
    }

    /// 旁路模式编码一个 bin
    pub fn encode_bypass(&mut self, bin: u8) {
        self.low <<= 1;
        if bin != 0 {
            self.low += self.range;
        }
        if self.low >= 1024 {
            self.put_bit(1);
            self.low -= 1024;
        } else if self.low < 512 {
            self.put_bit(0);
        } else {
            self.low -= 512;
            self.bits_outstanding += 1;
        }
    }

    /// 终止模式编码一个 bin, bin=1 时同时完成刷新
    ///
    /// 刷新写出的最后一位是 1, 用作 end_of_slice 的 rbsp_stop_one_bit.
    pub fn encode_terminate(&mut self, bin: u8) {
        self.range -= 2;
        if bin != 0 {
            self.low += self.range;
            self.flush();
        } else {
            self.renorm();
        }
    }

    /// 终止后访问底层写入器 (I_PCM 对齐位与样本)
    pub fn writer_mut(&mut self) -> &mut BitWriter {
        &mut self.writer
    }

    /// I_PCM 样本之后重新初始化编码引擎, 上下文保持不变
    pub fn restart(&mut self) {
        self.low = 0;
        self.range = 510;
        self.first_bit = true;
        self.bits_outstanding = 0;
    }

    /// 结束编码, 补齐字节并返回数据
    ///
    /// 调用前应已通过 `encode_terminate(1)` 刷新.
    pub fn finish(self) -> Vec<u8> {
        self.writer.finish()
    }

    fn flush(&mut self) {
        self.range = 2;
        self.renorm();
        self.put_bit((self.low >> 9) & 1);
        self.writer.write_bits(((self.low >> 7) & 3) | 1, 2);
    }

    fn renorm(&mut self) {
        while self.range < 256 {
            if self.low < 256 {
                self.put_bit(0);
            } else if self.low >= 512 {
                self.low -= 512;
                self.put_bit(1);
            } else {
                self.low -= 256;
                self.bits_outstanding += 1;
            }
            self.range <<= 1;
            self.low <<= 1;
        }
    }

    fn put_bit(&mut self, bit: u32) {
        if self.first_bit {
            self.first_bit = false;
        } else {
            self.writer.write_bit(bit);
        }
        while self.bits_outstanding > 0 {
            self.writer.write_bit(1 - bit);
            self.bits_outstanding -= 1;
        }
    }
}
