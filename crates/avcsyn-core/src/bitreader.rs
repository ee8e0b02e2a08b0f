//! 比特流读取器.
//!
//! 从去除防竞争字节后的 RBSP 缓冲区中按位读取数据, 大端位序 (MSB first).

use crate::{AvcError, AvcResult, BitSource};

/// 比特流读取器
///
/// # 示例
/// ```
/// use avcsyn_core::{BitReader, BitSource};
///
/// let data = [0b10110001, 0b01010101];
/// let mut br = BitReader::new(&data);
/// assert_eq!(br.read_bits(4).unwrap(), 0b1011);
/// assert_eq!(br.read_bits(4).unwrap(), 0b0001);
/// assert_eq!(br.read_bits(8).unwrap(), 0b01010101);
/// ```
pub struct BitReader<'a> {
    /// 源数据
    data: &'a [u8],
    /// 当前字节索引
    byte_pos: usize,
    /// 当前字节中的位位置 (0-7, 0 表示最高位)
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    /// 创建新的比特流读取器
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    /// 是否已到达末尾
    pub fn is_eof(&self) -> bool {
        self.bits_left() == 0
    }

    /// 窥视 N 个位 (不移动位置)
    pub fn peek_bits(&mut self, n: u32) -> AvcResult<u32> {
        let saved_byte = self.byte_pos;
        let saved_bit = self.bit_pos;
        let result = self.read_bits(n);
        self.byte_pos = saved_byte;
        self.bit_pos = saved_bit;
        result
    }

    /// 跳过 N 个位
    pub fn skip_bits(&mut self, n: u32) -> AvcResult<()> {
        if (n as usize) > self.bits_left() {
            return Err(exhausted(n as usize, self.bits_left()));
        }

        let total_bits = self.bit_pos as usize + n as usize;
        self.byte_pos += total_bits / 8;
        self.bit_pos = (total_bits % 8) as u8;

        Ok(())
    }

    /// 对齐到下一个字节边界
    ///
    /// 如果当前已在字节边界, 则不做任何事.
    pub fn align_to_byte(&mut self) {
        if self.bit_pos > 0 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
    }

    /// 从当前位置读取原始字节切片
    ///
    /// 仅在字节对齐时可用.
    pub fn read_bytes(&mut self, n: usize) -> AvcResult<&'a [u8]> {
        if self.bit_pos != 0 {
            return Err(AvcError::StructuralViolation(
                "read_bytes 需要字节对齐".into(),
            ));
        }

        let end = self.byte_pos + n;
        if end > self.data.len() {
            return Err(exhausted(n * 8, self.bits_left()));
        }

        let slice = &self.data[self.byte_pos..end];
        self.byte_pos = end;
        Ok(slice)
    }

    /// 获取底层数据的引用
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// rbsp_stop_one_bit 的绝对位位置 (最后一个为 1 的位)
    fn stop_bit_position(&self) -> Option<usize> {
        let last = self.data.iter().rposition(|&b| b != 0)?;
        let trailing = self.data[last].trailing_zeros() as usize;
        Some(last * 8 + 7 - trailing)
    }
}

impl BitSource for BitReader<'_> {
    fn read_bit(&mut self) -> AvcResult<u32> {
        if self.byte_pos >= self.data.len() {
            return Err(exhausted(1, 0));
        }

        let bit = (self.data[self.byte_pos] >> (7 - self.bit_pos)) & 1;
        self.bit_pos += 1;
        if self.bit_pos >= 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }

        Ok(u32::from(bit))
    }

    fn read_bits(&mut self, n: u32) -> AvcResult<u32> {
        if n == 0 {
            return Ok(0);
        }
        if n > 32 {
            return Err(AvcError::InvalidData(format!(
                "read_bits: n={} 超过 32 位",
                n,
            )));
        }
        if (n as usize) > self.bits_left() {
            return Err(exhausted(n as usize, self.bits_left()));
        }

        let mut result: u32 = 0;
        let mut remaining = n;

        while remaining > 0 {
            let available = 8 - self.bit_pos as u32;
            let to_read = remaining.min(available);

            // 从当前字节中提取位
            let shift = available - to_read;
            let mask = ((1u32 << to_read) - 1) as u8;
            let bits = (self.data[self.byte_pos] >> shift) & mask;

            result = (result << to_read) | u32::from(bits);

            self.bit_pos += to_read as u8;
            if self.bit_pos >= 8 {
                self.bit_pos = 0;
                self.byte_pos += 1;
            }
            remaining -= to_read;
        }

        Ok(result)
    }

    fn bits_read(&self) -> usize {
        self.byte_pos * 8 + self.bit_pos as usize
    }

    fn bits_left(&self) -> usize {
        if self.byte_pos >= self.data.len() {
            return 0;
        }
        (self.data.len() - self.byte_pos) * 8 - self.bit_pos as usize
    }

    fn more_rbsp_data(&self) -> bool {
        match self.stop_bit_position() {
            Some(stop) => self.bits_read() < stop,
            None => false,
        }
    }
}

fn exhausted(requested: usize, left: usize) -> AvcError {
    AvcError::StreamExhaustion(format!("请求 {} 位, 剩余 {} 位", requested, left))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bits_basic() {
        let data = [0b10110001, 0b01010101];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_bit().unwrap(), 1);
        assert_eq!(br.read_bit().unwrap(), 0);
        assert_eq!(br.read_bits(6).unwrap(), 0b110001);
        assert_eq!(br.read_bits(8).unwrap(), 0b01010101);
        assert!(br.is_eof());
    }

    #[test]
    fn test_read_bits_32_bit() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_bits(32).unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn test_read_ue_se() {
        // ue: 1 -> 0, 010 -> 1, 011 -> 2, 00100 -> 3
        // se: 010 -> 1, 011 -> -1
        let data = [0b1010_0110, 0b0100_0100, 0b1100_0000];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_ue().unwrap(), 0);
        assert_eq!(br.read_ue().unwrap(), 1);
        assert_eq!(br.read_ue().unwrap(), 2);
        assert_eq!(br.read_ue().unwrap(), 3);
        assert_eq!(br.read_se().unwrap(), 1);
        assert_eq!(br.read_se().unwrap(), -1);
    }

    #[test]
    fn test_peek_and_skip_bits() {
        let data = [0b11001010, 0xFF];
        let mut br = BitReader::new(&data);
        assert_eq!(br.peek_bits(4).unwrap(), 0b1100);
        assert_eq!(br.bits_read(), 0);
        br.skip_bits(4).unwrap();
        assert_eq!(br.read_bits(4).unwrap(), 0b1010);
    }

    #[test]
    fn test_align_to_byte() {
        let data = [0xFF, 0x42];
        let mut br = BitReader::new(&data);
        br.read_bits(3).unwrap();
        assert!(!br.is_byte_aligned());
        br.align_to_byte();
        assert!(br.is_byte_aligned());
        assert_eq!(br.byte_position(), 1);
        assert_eq!(br.read_bytes(1).unwrap(), &[0x42]);
    }

    #[test]
    fn test_more_rbsp_data() {
        // 数据 101 + stop bit 1 + 对齐 0000, 后随 cabac_zero_word
        let data = [0b1011_0000, 0x00, 0x00];
        let mut br = BitReader::new(&data);
        br.read_bits(3).unwrap();
        assert!(!br.more_rbsp_data());

        let mut br = BitReader::new(&data);
        br.read_bits(2).unwrap();
        assert!(br.more_rbsp_data());
    }

    #[test]
    fn test_exhaustion_is_error() {
        let data = [0xAB];
        let mut br = BitReader::new(&data);
        br.read_bits(8).unwrap();
        let err = br.read_bit().expect_err("越过末尾应失败");
        assert!(matches!(err, AvcError::StreamExhaustion(_)));
        let mut br = BitReader::new(&data);
        assert!(matches!(
            br.read_bits(9),
            Err(AvcError::StreamExhaustion(_))
        ));
    }
}
