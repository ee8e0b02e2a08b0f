//! 比特源抽象.
//!
//! 语法解析器与 CABAC 引擎只通过该 trait 读取 RBSP 比特,
//! 越过数据末尾时必须返回 `StreamExhaustion`, 不允许补零.

use crate::{AvcError, AvcResult};

/// 按位读取 RBSP 的比特源
pub trait BitSource {
    /// 读取 1 个位
    fn read_bit(&mut self) -> AvcResult<u32>;

    /// 读取 N 个位 (最多 32 位), 大端位序
    fn read_bits(&mut self, n: u32) -> AvcResult<u32>;

    /// 已读取的总位数
    fn bits_read(&self) -> usize;

    /// 剩余可读位数
    fn bits_left(&self) -> usize;

    /// 判断 RBSP 是否仍有有效语法数据 (排除 rbsp_trailing_bits)
    fn more_rbsp_data(&self) -> bool;

    /// 读取 1 位标志
    fn read_flag(&mut self) -> AvcResult<bool> {
        Ok(self.read_bit()? == 1)
    }

    /// 读取无符号 Exp-Golomb 编码值 ue(v)
    fn read_ue(&mut self) -> AvcResult<u32> {
        let mut leading_zeros = 0u32;
        loop {
            let bit = self.read_bit()?;
            if bit == 1 {
                break;
            }
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(AvcError::InvalidData("H.264: Exp-Golomb 前导零过多".into()));
            }
        }

        if leading_zeros == 0 {
            return Ok(0);
        }

        let suffix = self.read_bits(leading_zeros)?;
        let base = (1u64 << leading_zeros) - 1;
        u32::try_from(base + u64::from(suffix))
            .map_err(|_| AvcError::InvalidData("H.264: Exp-Golomb 值溢出".into()))
    }

    /// 读取有符号 Exp-Golomb 编码值 se(v)
    fn read_se(&mut self) -> AvcResult<i32> {
        let code = self.read_ue()?;
        // 映射: 0→0, 1→1, 2→-1, 3→2, 4→-2, ...
        let value = code.div_ceil(2) as i32;
        if code & 1 == 0 { Ok(-value) } else { Ok(value) }
    }

    /// 当前字节位置 (向下取整)
    fn byte_position(&self) -> usize {
        self.bits_read() / 8
    }

    /// 当前是否位于字节边界
    fn is_byte_aligned(&self) -> bool {
        self.bits_read() % 8 == 0
    }
}
