//! 比特流写入器.
//!
//! 按大端位序向字节缓冲区写入, 与 [`BitReader`](crate::BitReader) 对应.
//! 用于构造参数集/slice header 码流以及 CABAC 编码器的输出.

/// 比特流写入器
///
/// # 示例
/// ```
/// use avcsyn_core::BitWriter;
///
/// let mut bw = BitWriter::new();
/// bw.write_bits(0b1011, 4);
/// bw.write_ue(0);
/// bw.write_ue(1);
/// let data = bw.finish();
/// assert_eq!(data, vec![0b1011_1010]);
/// ```
pub struct BitWriter {
    /// 输出缓冲区
    data: Vec<u8>,
    /// 当前字节 (正在填充)
    current_byte: u8,
    /// 当前字节中已填充的位数 (0-7)
    bit_count: u8,
}

impl BitWriter {
    /// 创建新的比特流写入器
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            current_byte: 0,
            bit_count: 0,
        }
    }

    /// 获取已写入的总位数
    pub fn bits_written(&self) -> usize {
        self.data.len() * 8 + self.bit_count as usize
    }

    /// 当前是否位于字节边界
    pub fn is_byte_aligned(&self) -> bool {
        self.bit_count == 0
    }

    /// 写入 1 个位
    pub fn write_bit(&mut self, bit: u32) {
        self.current_byte = (self.current_byte << 1) | (bit & 1) as u8;
        self.bit_count += 1;
        if self.bit_count >= 8 {
            self.data.push(self.current_byte);
            self.current_byte = 0;
            self.bit_count = 0;
        }
    }

    /// 写入 1 位标志
    pub fn write_flag(&mut self, flag: bool) {
        self.write_bit(u32::from(flag));
    }

    /// 写入 N 个位 (最多 32 位)
    ///
    /// 值的低 N 位被写入, 高位在前 (大端).
    pub fn write_bits(&mut self, value: u32, n: u32) {
        debug_assert!(n <= 32, "write_bits: n={} 超过 32 位", n);
        for i in (0..n).rev() {
            self.write_bit((value >> i) & 1);
        }
    }

    /// 写入无符号 Exp-Golomb 编码值 ue(v)
    pub fn write_ue(&mut self, value: u32) {
        let code = u64::from(value) + 1;
        let len = 64 - code.leading_zeros();
        for _ in 0..len - 1 {
            self.write_bit(0);
        }
        for i in (0..len).rev() {
            self.write_bit(((code >> i) & 1) as u32);
        }
    }

    /// 写入有符号 Exp-Golomb 编码值 se(v)
    pub fn write_se(&mut self, value: i32) {
        // 映射: 0→0, 1→1, -1→2, 2→3, -2→4, ...
        let code = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.write_ue(code);
    }

    /// 写入 rbsp_trailing_bits: 停止位 1 后以 0 对齐
    pub fn write_trailing_bits(&mut self) {
        self.write_bit(1);
        self.align_to_byte();
    }

    /// 对齐到字节边界 (用 0 填充)
    pub fn align_to_byte(&mut self) {
        if self.bit_count > 0 {
            let pad = 8 - self.bit_count;
            self.current_byte <<= pad;
            self.data.push(self.current_byte);
            self.current_byte = 0;
            self.bit_count = 0;
        }
    }

    /// 写入完整字节
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.bit_count == 0 {
            // 快速路径: 已对齐
            self.data.extend_from_slice(bytes);
        } else {
            for &b in bytes {
                self.write_bits(u32::from(b), 8);
            }
        }
    }

    /// 完成写入, 返回字节数据
    ///
    /// 如果当前不在字节边界, 自动用 0 填充.
    pub fn finish(mut self) -> Vec<u8> {
        self.align_to_byte();
        self.data
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BitReader, BitSource};

    #[test]
    fn test_exp_golomb_written_values_read_back() {
        let mut bw = BitWriter::new();
        let unsigned = [0u32, 1, 2, 7, 255, 65_535];
        let signed = [0i32, 1, -1, 13, -26];
        for v in unsigned {
            bw.write_ue(v);
        }
        for v in signed {
            bw.write_se(v);
        }
        bw.write_trailing_bits();
        let data = bw.finish();

        let mut br = BitReader::new(&data);
        for v in unsigned {
            assert_eq!(br.read_ue().unwrap(), v);
        }
        for v in signed {
            assert_eq!(br.read_se().unwrap(), v);
        }
        assert!(!br.more_rbsp_data());
    }

    #[test]
    fn test_write_bytes_unaligned() {
        let mut bw = BitWriter::new();
        bw.write_bits(0b1, 1);
        bw.write_bytes(&[0xFF]);
        assert_eq!(bw.bits_written(), 9);
        assert_eq!(bw.finish(), vec![0xFF, 0x80]);
    }
}
