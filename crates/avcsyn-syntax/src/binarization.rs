//! CABAC 二值化方案.
//!
//! 一元码、截断一元码、定长码、UEGk 以及 mb_type / sub_mb_type 前缀码树.
//! 每个 bin 使用的上下文由调用方的闭包给出, 本模块只负责 bin 串与数值的映射.

use std::sync::OnceLock;

use avcsyn_core::{AvcError, AvcResult};

use crate::cabac::BinDecoder;

// ============================================================
// 基础二值化
// ============================================================

/// 一元码: 读取 bin 直到遇到 0, 返回 1 的个数
///
/// 连续 `limit` 个 1 视为码流损坏, 返回 `UnboundedLoopDetected`.
pub fn decode_unary<D, F>(
    decoder: &mut D,
    limit: u32,
    element: &'static str,
    mut ctx_of: F,
) -> AvcResult<u32>
where
    D: BinDecoder + ?Sized,
    F: FnMut(u32) -> usize,
{
    let mut count = 0u32;
    while decoder.decode_decision(ctx_of(count))? == 1 {
        count += 1;
        if count >= limit {
            return Err(AvcError::UnboundedLoopDetected { element, limit });
        }
    }
    Ok(count)
}

/// 截断一元码: 最多读取 `c_max` 个 bin
pub fn decode_truncated_unary<D, F>(decoder: &mut D, c_max: u32, mut ctx_of: F) -> AvcResult<u32>
where
    D: BinDecoder + ?Sized,
    F: FnMut(u32) -> usize,
{
    let mut count = 0u32;
    while count < c_max && decoder.decode_decision(ctx_of(count))? == 1 {
        count += 1;
    }
    Ok(count)
}

/// 定长码长度: ceil(log2(cMax + 1))
pub fn fixed_length_bins(c_max: u32) -> u32 {
    u32::BITS - c_max.leading_zeros()
}

/// 定长码: 低位在前, 第 i 个 bin 贡献 `bin << i`
pub fn decode_fixed_length<D, F>(decoder: &mut D, c_max: u32, mut ctx_of: F) -> AvcResult<u32>
where
    D: BinDecoder + ?Sized,
    F: FnMut(u32) -> usize,
{
    let mut value = 0u32;
    for bin_idx in 0..fixed_length_bins(c_max) {
        value |= u32::from(decoder.decode_decision(ctx_of(bin_idx))?) << bin_idx;
    }
    Ok(value)
}

/// UEGk 二值化参数
#[derive(Debug, Clone, Copy)]
pub struct UegkParams {
    /// 指数哥伦布阶数 k
    pub k: u32,
    /// 前缀截断值 uCoff
    pub u_coff: u32,
    /// 是否带符号位
    pub signed: bool,
    /// 后缀转义 bin 的上限
    pub max_escape_bits: u32,
    /// 语法元素名称 (用于错误信息)
    pub element: &'static str,
}

impl UegkParams {
    /// mvd_lX: UEG3, signed, uCoff=9
    pub const fn mvd(max_escape_bits: u32) -> Self {
        Self {
            k: 3,
            u_coff: 9,
            signed: true,
            max_escape_bits,
            element: "mvd",
        }
    }

    /// coeff_abs_level_minus1: UEG0, unsigned, uCoff=14
    pub const fn coeff_abs_level(max_escape_bits: u32) -> Self {
        Self {
            k: 0,
            u_coff: 14,
            signed: false,
            max_escape_bits,
            element: "coeff_abs_level_minus1",
        }
    }
}

/// UEGk: 截断一元前缀 + k 阶指数哥伦布旁路后缀 (+ 符号位)
pub fn decode_uegk<D, F>(decoder: &mut D, params: UegkParams, ctx_of: F) -> AvcResult<i32>
where
    D: BinDecoder + ?Sized,
    F: FnMut(u32) -> usize,
{
    let prefix = decode_truncated_unary(decoder, params.u_coff, ctx_of)?;
    let mut value = u64::from(prefix);

    if prefix >= params.u_coff {
        let mut k = params.k;
        let mut escapes = 0u32;
        while decoder.decode_bypass()? == 1 {
            value += 1u64 << k;
            k += 1;
            escapes += 1;
            if escapes > params.max_escape_bits {
                return Err(AvcError::UnboundedLoopDetected {
                    element: params.element,
                    limit: params.max_escape_bits,
                });
            }
        }
        while k > 0 {
            k -= 1;
            value += u64::from(decoder.decode_bypass()?) << k;
        }
    }

    let magnitude = i32::try_from(value).map_err(|_| {
        AvcError::InvalidData(format!(
            "CABAC: {} 数值溢出, value={}",
            params.element, value
        ))
    })?;
    if params.signed && magnitude != 0 && decoder.decode_bypass()? == 1 {
        return Ok(-magnitude);
    }
    Ok(magnitude)
}

/// mb_qp_delta 映射: 0→0, 奇数→+ceil(n/2), 偶数→-(n/2)
pub fn map_qp_delta(code_num: u32) -> i32 {
    let magnitude = code_num.div_ceil(2) as i32;
    if code_num & 1 == 1 { magnitude } else { -magnitude }
}

// ============================================================
// 前缀码树
// ============================================================

/// bin 的解码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinKind {
    /// 上下文模式, 携带 ctxIdx
    Decision(usize),
    /// 终止模式
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Empty,
    Node(u16),
    Leaf(u8),
}

/// 由码表构建的二叉前缀码树
///
/// 每个节点保存 bin=0 / bin=1 两条边, 边指向下一节点或符号.
#[derive(Debug)]
pub struct BinTrie {
    name: &'static str,
    nodes: Vec<[Edge; 2]>,
    max_depth: usize,
}

/// 码树的最大深度
const MAX_TRIE_DEPTH: usize = 8;

impl BinTrie {
    /// 从 (符号, 码字) 表构建, 码字按 bin 顺序写成 '0'/'1' 字符串
    pub fn from_codes(name: &'static str, codes: &[(u8, &str)]) -> Self {
        let mut nodes = vec![[Edge::Empty; 2]];
        let mut max_depth = 0;
        for &(symbol, code) in codes {
            let bits: Vec<usize> = code.bytes().map(|b| usize::from(b == b'1')).collect();
            debug_assert!(!bits.is_empty() && bits.len() <= MAX_TRIE_DEPTH);
            max_depth = max_depth.max(bits.len());
            let mut node = 0usize;
            for (pos, &bit) in bits.iter().enumerate() {
                if pos + 1 == bits.len() {
                    debug_assert_eq!(nodes[node][bit], Edge::Empty, "{name}: 码字冲突 {code}");
                    nodes[node][bit] = Edge::Leaf(symbol);
                    break;
                }
                node = match nodes[node][bit] {
                    Edge::Node(next) => usize::from(next),
                    _ => {
                        nodes.push([Edge::Empty; 2]);
                        let next = nodes.len() - 1;
                        nodes[node][bit] = Edge::Node(next as u16);
                        next
                    }
                };
            }
        }
        Self {
            name,
            nodes,
            max_depth,
        }
    }

    /// 名称
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 逐 bin 走树解码一个符号
    ///
    /// `kind_of(bin_idx, prior_bins)` 给出当前 bin 的解码方式.
    pub fn decode<D, F>(&self, decoder: &mut D, mut kind_of: F) -> AvcResult<u8>
    where
        D: BinDecoder + ?Sized,
        F: FnMut(u32, &[u8]) -> AvcResult<BinKind>,
    {
        let mut bins = [0u8; MAX_TRIE_DEPTH];
        let mut node = 0usize;
        for depth in 0..self.max_depth {
            let bin = match kind_of(depth as u32, &bins[..depth])? {
                BinKind::Decision(ctx_idx) => decoder.decode_decision(ctx_idx)?,
                BinKind::Terminate => decoder.decode_terminate()?,
            };
            bins[depth] = bin;
            match self.nodes.get(node).map(|edges| edges[usize::from(bin & 1)]) {
                Some(Edge::Leaf(symbol)) => return Ok(symbol),
                Some(Edge::Node(next)) => node = usize::from(next),
                _ => break,
            }
        }
        Err(AvcError::StructuralViolation(format!(
            "CABAC: {} 前缀码落入未定义分支",
            self.name
        )))
    }
}

/// I slice mb_type (表 9-36), 25 为 I_PCM
const I_MB_TYPE_CODES: [(u8, &str); 26] = [
    (0, "0"),
    (1, "100000"),
    (2, "100001"),
    (3, "100010"),
    (4, "100011"),
    (5, "1001000"),
    (6, "1001001"),
    (7, "1001010"),
    (8, "1001011"),
    (9, "1001100"),
    (10, "1001101"),
    (11, "1001110"),
    (12, "1001111"),
    (13, "101000"),
    (14, "101001"),
    (15, "101010"),
    (16, "101011"),
    (17, "1011000"),
    (18, "1011001"),
    (19, "1011010"),
    (20, "1011011"),
    (21, "1011100"),
    (22, "1011101"),
    (23, "1011110"),
    (24, "1011111"),
    (25, "11"),
];

/// P/SP slice mb_type 前缀, 5 表示帧内后缀
const P_MB_TYPE_CODES: [(u8, &str); 5] = [
    (0, "000"),
    (1, "011"),
    (2, "010"),
    (3, "001"),
    (5, "1"),
];

/// B slice mb_type 前缀, 23 表示帧内后缀
const B_MB_TYPE_CODES: [(u8, &str); 24] = [
    (0, "0"),
    (1, "100"),
    (2, "101"),
    (3, "110000"),
    (4, "110001"),
    (5, "110010"),
    (6, "110011"),
    (7, "110100"),
    (8, "110101"),
    (9, "110110"),
    (10, "110111"),
    (11, "111110"),
    (12, "1110000"),
    (13, "1110001"),
    (14, "1110010"),
    (15, "1110011"),
    (16, "1110100"),
    (17, "1110101"),
    (18, "1110110"),
    (19, "1110111"),
    (20, "1111000"),
    (21, "1111001"),
    (22, "111111"),
    (23, "111101"),
];

/// SI slice mb_type 前缀: 0 为 SI, 1 表示 I 后缀
const SI_MB_TYPE_CODES: [(u8, &str); 2] = [(0, "0"), (1, "1")];

const P_SUB_MB_TYPE_CODES: [(u8, &str); 4] = [(0, "1"), (1, "00"), (2, "011"), (3, "010")];

const B_SUB_MB_TYPE_CODES: [(u8, &str); 13] = [
    (0, "0"),
    (1, "100"),
    (2, "101"),
    (3, "11000"),
    (4, "11001"),
    (5, "11010"),
    (6, "11011"),
    (7, "111000"),
    (8, "111001"),
    (9, "111010"),
    (10, "111011"),
    (11, "11110"),
    (12, "11111"),
];

/// I mb_type 码树
pub fn i_mb_type_trie() -> &'static BinTrie {
    static TRIE: OnceLock<BinTrie> = OnceLock::new();
    TRIE.get_or_init(|| BinTrie::from_codes("I mb_type", &I_MB_TYPE_CODES))
}

/// P/SP mb_type 前缀码树
pub fn p_mb_type_trie() -> &'static BinTrie {
    static TRIE: OnceLock<BinTrie> = OnceLock::new();
    TRIE.get_or_init(|| BinTrie::from_codes("P mb_type", &P_MB_TYPE_CODES))
}

/// B mb_type 前缀码树
pub fn b_mb_type_trie() -> &'static BinTrie {
    static TRIE: OnceLock<BinTrie> = OnceLock::new();
    TRIE.get_or_init(|| BinTrie::from_codes("B mb_type", &B_MB_TYPE_CODES))
}

/// SI mb_type 前缀码树
pub fn si_mb_type_trie() -> &'static BinTrie {
    static TRIE: OnceLock<BinTrie> = OnceLock::new();
    TRIE.get_or_init(|| BinTrie::from_codes("SI mb_type", &SI_MB_TYPE_CODES))
}

/// P sub_mb_type 码树
pub fn p_sub_mb_type_trie() -> &'static BinTrie {
    static TRIE: OnceLock<BinTrie> = OnceLock::new();
    TRIE.get_or_init(|| BinTrie::from_codes("P sub_mb_type", &P_SUB_MB_TYPE_CODES))
}

/// B sub_mb_type 码树
pub fn b_sub_mb_type_trie() -> &'static BinTrie {
    static TRIE: OnceLock<BinTrie> = OnceLock::new();
    TRIE.get_or_init(|| BinTrie::from_codes("B sub_mb_type", &B_SUB_MB_TYPE_CODES))
}

/// 查找符号对应的码字 (编码侧使用)
pub fn code_of(table: MbTypeTable, symbol: u8) -> Option<&'static str> {
    let codes: &[(u8, &str)] = match table {
        MbTypeTable::I => &I_MB_TYPE_CODES,
        MbTypeTable::P => &P_MB_TYPE_CODES,
        MbTypeTable::B => &B_MB_TYPE_CODES,
        MbTypeTable::Si => &SI_MB_TYPE_CODES,
        MbTypeTable::PSub => &P_SUB_MB_TYPE_CODES,
        MbTypeTable::BSub => &B_SUB_MB_TYPE_CODES,
    };
    codes
        .iter()
        .find(|(sym, _)| *sym == symbol)
        .map(|(_, code)| *code)
}

/// 码表标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbTypeTable {
    /// I slice mb_type
    I,
    /// P/SP mb_type 前缀
    P,
    /// B mb_type 前缀
    B,
    /// SI mb_type 前缀
    Si,
    /// P sub_mb_type
    PSub,
    /// B sub_mb_type
    BSub,
}
