//! 宏块层语法 (H.264 7.3.5).
//!
//! 解析 mb_type 之后的全部宏块语法, 并在解析过程中更新当前宏块的邻居摘要,
//! 使同一宏块内后续语法元素的上下文推导能看到已解码的分区.

use avcsyn_core::{AvcError, AvcResult, BitSource};

use crate::binarization::{
    BinKind, BinTrie, UegkParams, b_mb_type_trie, b_sub_mb_type_trie, decode_fixed_length,
    decode_truncated_unary, decode_uegk, decode_unary, i_mb_type_trie, map_qp_delta,
    p_mb_type_trie, p_sub_mb_type_trie, si_mb_type_trie,
};
use crate::cabac::{BinDecoder, CabacReader};
use crate::config::ParserConfig;
use crate::derivation::{CtxRequest, CtxTarget, DerivationContext};
use crate::elements::{
    CTX_CBP_CHROMA, CTX_CBP_LUMA, CTX_END_OF_SLICE, CTX_MB_TYPE_B_PREFIX, CTX_MB_TYPE_B_SUFFIX,
    CTX_MB_TYPE_I, CTX_MB_TYPE_P_PREFIX, CTX_MB_TYPE_P_SUFFIX, CTX_MB_TYPE_SI_PREFIX,
    CTX_PREV_INTRA_PRED_MODE_FLAG, CTX_REM_INTRA_PRED_MODE, CTX_SUB_MB_TYPE_B, CTX_SUB_MB_TYPE_P,
    CTX_TRANSFORM_SIZE_8X8, SyntaxElement,
};
use crate::macroblock::{MacroblockInfo, PcmSamples, ResidualData};
use crate::mb_types::{MbType, PredMode, SubMbType};
use crate::neighbor::{MbFlags, MbGeometry, NeighborInfo, NeighborStore, luma4x4_blk_idx};
use crate::residual::residual;
use crate::slice_header::{SliceHeader, SliceType};

/// I_PCM 宏块的 coded_block_pattern 摘要 (亮度全编码, 色度 DC+AC)
pub const PCM_SUMMARY_CBP: u8 = 0x2F;

// ============================================================
// 解析环境
// ============================================================

/// 单个宏块的解析环境
pub struct MbEnv<'a, N: NeighborStore + ?Sized> {
    pub store: &'a N,
    pub header: &'a SliceHeader,
    pub config: &'a ParserConfig,
    pub geom: MbGeometry,
    pub slice_num: u32,
    pub mb_addr: u32,
    /// 当前宏块按场解码 (场图像, 或 MBAFF 场宏块)
    pub field: bool,
    /// mb_field_decoding_flag (仅 MBAFF 下可能为 true)
    pub mb_field: bool,
    /// 前一个宏块的 mb_qp_delta 非零
    pub prev_qp_delta_nonzero: bool,
}

impl<'a, N: NeighborStore + ?Sized> MbEnv<'a, N> {
    pub fn new(
        store: &'a N,
        header: &'a SliceHeader,
        config: &'a ParserConfig,
        slice_num: u32,
        mb_addr: u32,
    ) -> Self {
        Self {
            store,
            header,
            config,
            geom: MbGeometry {
                width_mbs: header.pic_width_in_mbs(),
                height_mbs: header.pic_height_in_mbs(),
                mbaff: header.mbaff(),
            },
            slice_num,
            mb_addr,
            field: header.field_pic,
            mb_field: false,
            prev_qp_delta_nonzero: false,
        }
    }

    /// 设置 MBAFF 宏块对的 mb_field_decoding_flag
    pub fn with_mb_field(mut self, mb_field: bool) -> Self {
        self.mb_field = mb_field && self.geom.mbaff;
        self.field = self.header.field_pic || self.mb_field;
        self
    }

    pub fn with_prev_qp_delta_nonzero(mut self, nonzero: bool) -> Self {
        self.prev_qp_delta_nonzero = nonzero;
        self
    }

    /// 以当前宏块摘要构造上下文推导环境
    pub fn derive<'b>(&'b self, current: &'b NeighborInfo) -> DerivationContext<'b, N> {
        let (w, h) = self.chroma_size();
        DerivationContext {
            store: self.store,
            geom: self.geom,
            slice_num: self.slice_num,
            slice_type: self.header.slice_type,
            mb_addr: self.mb_addr,
            field: self.field,
            current,
            prev_qp_delta_nonzero: self.prev_qp_delta_nonzero,
            chroma_size: (w as i32, h as i32),
        }
    }

    pub fn chroma_array_type(&self) -> u32 {
        self.header.chroma_array_type()
    }

    /// (MbWidthC, MbHeightC)
    pub fn chroma_size(&self) -> (u32, u32) {
        self.header.sps.mb_chroma_size()
    }

    /// NumC8x8
    pub fn num_c8x8(&self) -> u32 {
        let (w, h) = self.chroma_size();
        (w / 8) * (h / 8)
    }

    /// ref_idx 的合法上限 (不含)
    fn ref_idx_limit(&self, list: usize) -> u32 {
        let active = if list == 0 {
            self.header.num_ref_idx_l0_active
        } else {
            self.header.num_ref_idx_l1_active
        };
        if self.mb_field { active * 2 } else { active }
    }

    /// ref_idx_lX 是否出现在码流中
    fn ref_idx_present(&self, list: usize) -> bool {
        let active = if list == 0 {
            self.header.num_ref_idx_l0_active
        } else {
            self.header.num_ref_idx_l1_active
        };
        active > 1 || self.mb_field != self.header.field_pic
    }
}

// ============================================================
// I_PCM
// ============================================================

/// 能读取 I_PCM 原始样本的 bin 源
pub trait PcmReader: BinDecoder {
    /// 读取 pcm_alignment_zero_bit 与全部样本, 然后重新初始化算术解码引擎
    fn read_pcm(
        &mut self,
        bit_depth_luma: u32,
        bit_depth_chroma: u32,
        chroma_samples: usize,
    ) -> AvcResult<PcmSamples>;
}

impl<S: BitSource + ?Sized> PcmReader for CabacReader<'_, S> {
    fn read_pcm(
        &mut self,
        bit_depth_luma: u32,
        bit_depth_chroma: u32,
        chroma_samples: usize,
    ) -> AvcResult<PcmSamples> {
        let source = self.source_mut();
        while !source.is_byte_aligned() {
            if source.read_bit()? != 0 {
                return Err(AvcError::StructuralViolation(
                    "H.264: pcm_alignment_zero_bit 不为 0".into(),
                ));
            }
        }
        let mut read_samples = |count: usize, bits: u32| -> AvcResult<Vec<u16>> {
            (0..count)
                .map(|_| source.read_bits(bits).map(|v| v as u16))
                .collect()
        };
        let luma = read_samples(256, bit_depth_luma)?;
        let chroma = read_samples(chroma_samples, bit_depth_chroma)?;
        self.reinit()?;
        Ok(PcmSamples { luma, chroma })
    }
}

// ============================================================
// mb_type / sub_mb_type
// ============================================================

fn decode_trie_symbol<D, N>(
    decoder: &mut D,
    dc: &DerivationContext<'_, N>,
    trie: &BinTrie,
    offset: u16,
) -> AvcResult<u32>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let symbol = trie.decode(decoder, |bin_idx, prior| {
        let req = CtxRequest::new(offset, bin_idx, CtxTarget::Macroblock).with_prior(prior);
        let ctx = dc.ctx_idx(&req)?;
        Ok(if ctx == usize::from(CTX_END_OF_SLICE) {
            BinKind::Terminate
        } else {
            BinKind::Decision(ctx)
        })
    })?;
    Ok(u32::from(symbol))
}

/// mb_type (9.3.2.5): 按 slice 类型选择前缀/后缀码树
pub fn decode_mb_type<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &NeighborInfo,
) -> AvcResult<MbType>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let dc = env.derive(current);
    match env.header.slice_type {
        SliceType::I => {
            let raw = decode_trie_symbol(decoder, &dc, i_mb_type_trie(), CTX_MB_TYPE_I)?;
            MbType::from_i(raw)
        }
        SliceType::Si => {
            let prefix =
                decode_trie_symbol(decoder, &dc, si_mb_type_trie(), CTX_MB_TYPE_SI_PREFIX)?;
            if prefix == 0 {
                return Ok(MbType::Si);
            }
            let raw = decode_trie_symbol(decoder, &dc, i_mb_type_trie(), CTX_MB_TYPE_I)?;
            MbType::from_si(raw + 1)
        }
        SliceType::P | SliceType::Sp => {
            let prefix = decode_trie_symbol(decoder, &dc, p_mb_type_trie(), CTX_MB_TYPE_P_PREFIX)?;
            if prefix < 5 {
                return MbType::from_p(prefix);
            }
            let suffix = decode_trie_symbol(decoder, &dc, i_mb_type_trie(), CTX_MB_TYPE_P_SUFFIX)?;
            MbType::from_p(5 + suffix)
        }
        SliceType::B => {
            let prefix = decode_trie_symbol(decoder, &dc, b_mb_type_trie(), CTX_MB_TYPE_B_PREFIX)?;
            if prefix < 23 {
                return MbType::from_b(prefix);
            }
            let suffix = decode_trie_symbol(decoder, &dc, i_mb_type_trie(), CTX_MB_TYPE_B_SUFFIX)?;
            MbType::from_b(23 + suffix)
        }
    }
}

fn decode_sub_mb_type<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &NeighborInfo,
) -> AvcResult<SubMbType>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let dc = env.derive(current);
    if env.header.slice_type.is_b() {
        let raw = decode_trie_symbol(decoder, &dc, b_sub_mb_type_trie(), CTX_SUB_MB_TYPE_B)?;
        SubMbType::from_b(raw)
    } else {
        let raw = decode_trie_symbol(decoder, &dc, p_sub_mb_type_trie(), CTX_SUB_MB_TYPE_P)?;
        SubMbType::from_p(raw)
    }
}

// ============================================================
// 预测语法
// ============================================================

/// 8x8 分区 `mb_part_idx` 覆盖的 8x8 块位掩码
fn part_8x8_mask(mb_type: MbType, mb_part_idx: usize) -> u8 {
    match mb_type.part_size() {
        (16, 16) => 0b1111,
        (16, 8) => 0b0011 << (2 * mb_part_idx),
        (8, 16) => 0b0101 << mb_part_idx,
        _ => 1 << mb_part_idx,
    }
}

/// 宏块分区左上角的亮度坐标
fn part_origin(mb_type: MbType, mb_part_idx: usize) -> (i32, i32) {
    let (w, h) = mb_type.part_size();
    let per_row = usize::from(16 / w);
    (
        ((mb_part_idx % per_row) * usize::from(w)) as i32,
        ((mb_part_idx / per_row) * usize::from(h)) as i32,
    )
}

/// 子宏块分区左上角的亮度坐标
fn sub_part_origin(sub: SubMbType, mb_part_idx: usize, sub_part_idx: usize) -> (i32, i32) {
    let (w, h) = sub.part_size();
    let per_row = usize::from(8 / w);
    let x0 = (mb_part_idx % 2) * 8;
    let y0 = (mb_part_idx / 2) * 8;
    (
        (x0 + (sub_part_idx % per_row) * usize::from(w)) as i32,
        (y0 + (sub_part_idx / per_row) * usize::from(h)) as i32,
    )
}

fn decode_ref_idx<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &NeighborInfo,
    list: usize,
    (x, y): (i32, i32),
) -> AvcResult<i8>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let target = CtxTarget::Partition { list, x, y };
    let ladder = env
        .derive(current)
        .element_ladder(SyntaxElement::RefIdx, None, target)?;
    let value = decode_unary(decoder, env.config.max_unary_bins, "ref_idx", |bin| {
        ladder.at(bin)
    })?;
    let limit = env.ref_idx_limit(list);
    if value >= limit {
        return Err(AvcError::InvalidData(format!(
            "H.264: ref_idx_l{} 超出范围, value={}, limit={}",
            list, value, limit
        )));
    }
    i8::try_from(value).map_err(|_| {
        AvcError::InvalidData(format!("H.264: ref_idx_l{} 超出范围, value={}", list, value))
    })
}

/// mvd_lX 的一个 (子) 分区, 返回 (水平, 垂直) 并更新摘要中的 |mvd|
fn decode_mvd_pair<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &mut NeighborInfo,
    list: usize,
    (x, y): (i32, i32),
    (w, h): (u8, u8),
) -> AvcResult<[i32; 2]>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let params = UegkParams::mvd(env.config.max_escape_bits);
    let target = CtxTarget::Partition { list, x, y };
    let mut mvd = [0i32; 2];
    for (comp, element) in [SyntaxElement::MvdX, SyntaxElement::MvdY].into_iter().enumerate() {
        let ladder = env.derive(current).element_ladder(element, None, target)?;
        mvd[comp] = decode_uegk(decoder, params, |bin| ladder.at(bin))?;
        let abs = u16::try_from(mvd[comp].unsigned_abs()).unwrap_or(u16::MAX);
        for by in (y..y + i32::from(h)).step_by(4) {
            for bx in (x..x + i32::from(w)).step_by(4) {
                let blk = luma4x4_blk_idx(bx, by);
                current.abs_mvd[list][blk][comp] = abs;
            }
        }
    }
    Ok(mvd)
}

/// sub_mb_pred (7.3.5.2)
fn sub_mb_pred<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &mut NeighborInfo,
    info: &mut MacroblockInfo,
) -> AvcResult<()>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    for part in 0..4 {
        info.sub_mb_types[part] = decode_sub_mb_type(decoder, env, current)?;
    }

    for list in 0..2 {
        for part in 0..4 {
            let sub = info.sub_mb_types[part];
            let Some(pred) = sub.pred else {
                continue;
            };
            if !pred.uses_list(list) {
                continue;
            }
            let ref_idx = if info.mb_type != MbType::P8x8Ref0 && env.ref_idx_present(list) {
                let origin = sub_part_origin(sub, part, 0);
                decode_ref_idx(decoder, env, current, list, origin)?
            } else {
                0
            };
            info.ref_idx[list][part] = ref_idx;
            current.ref_idx[list][part] = ref_idx;
        }
    }

    for list in 0..2 {
        for part in 0..4 {
            let sub = info.sub_mb_types[part];
            if !sub.pred.is_some_and(|p| p.uses_list(list)) {
                continue;
            }
            for sub_part in 0..sub.num_parts() {
                let origin = sub_part_origin(sub, part, sub_part);
                info.mvd[list][part][sub_part] =
                    decode_mvd_pair(decoder, env, current, list, origin, sub.part_size())?;
            }
        }
    }
    Ok(())
}

/// mb_pred (7.3.5.1)
fn mb_pred<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &mut NeighborInfo,
    info: &mut MacroblockInfo,
) -> AvcResult<()>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let mode = info.mb_type.part_pred_mode(0, info.transform_8x8);
    match mode {
        PredMode::Intra4x4 | PredMode::Intra8x8 | PredMode::Intra16x16 => {
            let blocks = match mode {
                PredMode::Intra4x4 => 16,
                PredMode::Intra8x8 => 4,
                _ => 0,
            };
            for blk in 0..blocks {
                let dc = env.derive(current);
                let flag_ctx = dc.ctx_idx(&CtxRequest::new(
                    CTX_PREV_INTRA_PRED_MODE_FLAG,
                    0,
                    CtxTarget::Macroblock,
                ))?;
                info.intra_pred_modes[blk] = if decoder.decode_decision(flag_ctx)? == 1 {
                    None
                } else {
                    let rem_ctx = dc.ctx_idx(&CtxRequest::new(
                        CTX_REM_INTRA_PRED_MODE,
                        0,
                        CtxTarget::Macroblock,
                    ))?;
                    Some(decode_fixed_length(decoder, 7, |_| rem_ctx)? as u8)
                };
            }
            if matches!(env.chroma_array_type(), 1 | 2) {
                let ladder = env.derive(current).element_ladder(
                    SyntaxElement::IntraChromaPredMode,
                    None,
                    CtxTarget::Macroblock,
                )?;
                let mode = decode_truncated_unary(decoder, 3, |bin| ladder.at(bin))? as u8;
                info.intra_chroma_pred_mode = mode;
                current.intra_chroma_pred_mode = mode;
            }
        }
        PredMode::Direct | PredMode::None => {}
        PredMode::Inter(_) => {
            let num_parts = info.mb_type.num_mb_part();
            for list in 0..2 {
                for part in 0..num_parts {
                    let PredMode::Inter(pred) = info.mb_type.part_pred_mode(part, false) else {
                        continue;
                    };
                    if !pred.uses_list(list) {
                        continue;
                    }
                    let ref_idx = if env.ref_idx_present(list) {
                        let origin = part_origin(info.mb_type, part);
                        decode_ref_idx(decoder, env, current, list, origin)?
                    } else {
                        0
                    };
                    info.ref_idx[list][part] = ref_idx;
                    let mask = part_8x8_mask(info.mb_type, part);
                    for b8 in (0..4).filter(|b8| mask & (1 << b8) != 0) {
                        current.ref_idx[list][b8] = ref_idx;
                    }
                }
            }
            for list in 0..2 {
                for part in 0..num_parts {
                    let PredMode::Inter(pred) = info.mb_type.part_pred_mode(part, false) else {
                        continue;
                    };
                    if !pred.uses_list(list) {
                        continue;
                    }
                    let origin = part_origin(info.mb_type, part);
                    let size = info.mb_type.part_size();
                    info.mvd[list][part][0] =
                        decode_mvd_pair(decoder, env, current, list, origin, size)?;
                }
            }
        }
    }
    Ok(())
}

// ============================================================
// 宏块级标志与数值
// ============================================================

fn decode_transform_size_8x8<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &mut NeighborInfo,
) -> AvcResult<bool>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let ctx = env.derive(current).ctx_idx(&CtxRequest::new(
        CTX_TRANSFORM_SIZE_8X8,
        0,
        CtxTarget::Macroblock,
    ))?;
    let flag = decoder.decode_decision(ctx)? == 1;
    current.flags.set(MbFlags::TRANSFORM_8X8, flag);
    Ok(flag)
}

/// coded_block_pattern (9.3.2.6): FL(15) 亮度前缀 + TU(2) 色度后缀
pub fn decode_coded_block_pattern<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &NeighborInfo,
) -> AvcResult<u8>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let dc = env.derive(current);
    let mut prior = [0u8; 4];
    for b8 in 0..4 {
        let req = CtxRequest::new(CTX_CBP_LUMA, b8 as u32, CtxTarget::Macroblock)
            .with_prior(&prior[..b8]);
        prior[b8] = decoder.decode_decision(dc.ctx_idx(&req)?)?;
    }
    let luma = prior
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, &bin)| acc | (bin << i));

    let chroma = if matches!(env.chroma_array_type(), 1 | 2) {
        let suffix = dc
            .element(SyntaxElement::CodedBlockPattern, None)?
            .suffix
            .ok_or(AvcError::InvalidDerivationRequest {
                ctx_idx_offset: CTX_CBP_CHROMA,
                bin_idx: 0,
            })?;
        let ladder = dc.section_ladder(suffix, CtxTarget::Macroblock)?;
        decode_truncated_unary(decoder, 2, |bin| ladder.at(bin))? as u8
    } else {
        0
    };
    Ok(luma | (chroma << 4))
}

/// mb_qp_delta: 一元码映射为有符号值, 并检查取值范围
pub fn decode_mb_qp_delta<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &NeighborInfo,
) -> AvcResult<i32>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let ladder = env
        .derive(current)
        .element_ladder(SyntaxElement::MbQpDelta, None, CtxTarget::Macroblock)?;
    let code = decode_unary(decoder, env.config.max_unary_bins, "mb_qp_delta", |bin| {
        ladder.at(bin)
    })?;
    let delta = map_qp_delta(code);
    let half = env.header.sps.qp_bd_offset_y() / 2;
    if delta < -(26 + half) || delta > 25 + half {
        return Err(AvcError::InvalidData(format!(
            "H.264: mb_qp_delta 超出范围, value={}",
            delta
        )));
    }
    Ok(delta)
}

/// QP_Y = ((QP_Y,PRED + mb_qp_delta + 52 + 2 * QpBdOffsetY) % (52 + QpBdOffsetY)) - QpBdOffsetY
pub fn next_qp_y(qp_prev: i32, mb_qp_delta: i32, qp_bd_offset_y: i32) -> i32 {
    (qp_prev + mb_qp_delta + 52 + 2 * qp_bd_offset_y).rem_euclid(52 + qp_bd_offset_y)
        - qp_bd_offset_y
}

// ============================================================
// macroblock_layer
// ============================================================

/// 解析一个非跳过宏块的 macroblock_layer
///
/// `current` 是该宏块的邻居摘要, 调用前已设置 slice 序号与场标志;
/// 返回后由调用方写入邻居存储.
pub fn macroblock_layer<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &mut NeighborInfo,
    qp_prev: i32,
) -> AvcResult<MacroblockInfo>
where
    D: PcmReader + ?Sized,
    N: NeighborStore + ?Sized,
{
    let mut info = MacroblockInfo::new(env.mb_addr, env.slice_num);
    info.field = env.field;
    info.qp_y = qp_prev;

    let mb_type = decode_mb_type(decoder, env, current)?;
    info.mb_type = mb_type;
    current.mb_type = mb_type;
    current.flags.set(MbFlags::INTRA, mb_type.is_intra());
    current.flags.set(MbFlags::DIRECT, mb_type.is_b_direct());

    if mb_type == MbType::IPcm {
        let sps = &env.header.sps;
        let (w, h) = env.chroma_size();
        let chroma_samples = 2 * (w * h) as usize;
        let pcm = decoder.read_pcm(sps.bit_depth_luma, sps.bit_depth_chroma, chroma_samples)?;
        current.flags.insert(MbFlags::PCM);
        current.cbp = PCM_SUMMARY_CBP;
        info.coded_block_pattern = PCM_SUMMARY_CBP;
        info.pcm = Some(pcm);
        return Ok(info);
    }

    let pps = &env.header.pps;
    let direct_8x8_inference = env.header.sps.direct_8x8_inference;
    let mut no_sub_mb_part_less_than_8x8 = true;
    let pred_mode = mb_type.part_pred_mode(0, false);

    if mb_type.is_8x8() {
        sub_mb_pred(decoder, env, current, &mut info)?;
        for sub in info.sub_mb_types {
            if !sub.is_direct() {
                if sub.num_parts() > 1 {
                    no_sub_mb_part_less_than_8x8 = false;
                }
            } else if !direct_8x8_inference {
                no_sub_mb_part_less_than_8x8 = false;
            }
        }
    } else {
        if pps.transform_8x8_mode && mb_type == MbType::INxN {
            info.transform_8x8 = decode_transform_size_8x8(decoder, env, current)?;
        }
        mb_pred(decoder, env, current, &mut info)?;
    }

    if let MbType::I16x16 {
        cbp_chroma,
        cbp_luma,
        ..
    } = mb_type
    {
        info.coded_block_pattern = cbp_luma | (cbp_chroma << 4);
        current.cbp = info.coded_block_pattern;
    } else {
        info.coded_block_pattern = decode_coded_block_pattern(decoder, env, current)?;
        current.cbp = info.coded_block_pattern;
        if info.cbp_luma() > 0
            && pps.transform_8x8_mode
            && mb_type != MbType::INxN
            && no_sub_mb_part_less_than_8x8
            && (mb_type != MbType::BDirect16x16 || direct_8x8_inference)
        {
            info.transform_8x8 = decode_transform_size_8x8(decoder, env, current)?;
        }
    }

    let intra16x16 = pred_mode == PredMode::Intra16x16;
    if info.cbp_luma() > 0 || info.cbp_chroma() > 0 || intra16x16 {
        info.mb_qp_delta = decode_mb_qp_delta(decoder, env, current)?;
        info.qp_y = next_qp_y(qp_prev, info.mb_qp_delta, env.header.sps.qp_bd_offset_y());
        let mut data = Box::<ResidualData>::default();
        residual(decoder, env, current, &mut data)?;
        info.coded_block_flags = current.cbf;
        if env.config.emit_coefficients {
            info.residual = Some(data);
        }
    }
    Ok(info)
}
