//! CABAC 上下文索引推导 (H.264 9.3.3.1).
//!
//! 给定 ctxIdxOffset 与 binIdx, 结合相邻宏块状态得到 ctxIdxInc.
//! 残差类元素的 ctxIdxOffset 已包含 ctxBlockCatOffset.

use avcsyn_core::{AvcError, AvcResult};

use crate::elements::{
    BlockCat, CTX_CBP_CHROMA, CTX_CBP_LUMA, CTX_END_OF_SLICE, CTX_INTRA_CHROMA_PRED_MODE,
    CTX_MB_FIELD_DECODING_FLAG, CTX_MB_QP_DELTA, CTX_MB_SKIP_B, CTX_MB_SKIP_P, CTX_MB_TYPE_B_PREFIX,
    CTX_MB_TYPE_B_SUFFIX, CTX_MB_TYPE_I, CTX_MB_TYPE_P_PREFIX, CTX_MB_TYPE_P_SUFFIX,
    CTX_MB_TYPE_SI_PREFIX, CTX_MVD_X, CTX_MVD_Y, CTX_PREV_INTRA_PRED_MODE_FLAG, CTX_REF_IDX,
    CTX_REM_INTRA_PRED_MODE, CTX_SUB_MB_TYPE_B, CTX_SUB_MB_TYPE_P, CTX_TRANSFORM_SIZE_8X8,
    BinSection, ElementInfo, LAST_8X8, SIG_8X8_FIELD, SIG_8X8_FRAME, SyntaxElement, element_info,
};
use crate::mb_types::MbType;
use crate::neighbor::{
    CBF_DC_BIT, Direction, MbFlags, MbGeometry, NeighborInfo, NeighborLoc, NeighborStore,
    chroma4x4_blk_idx, chroma4x4_blk_pos, luma4x4_blk_idx, luma4x4_blk_pos, luma8x8_blk_idx,
    luma8x8_blk_pos,
};
use crate::slice_header::SliceType;

/// 推导目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxTarget {
    /// 宏块级元素
    Macroblock,
    /// 分区级元素 (ref_idx, mvd), (x, y) 为分区左上角的亮度坐标
    Partition { list: usize, x: i32, y: i32 },
    /// coded_block_flag; 色度 DC 的 `blk_idx` 为 0
    Block {
        cat: BlockCat,
        plane: usize,
        blk_idx: usize,
    },
    /// significant / last / coeff_abs_level_minus1
    Coeff {
        cat: BlockCat,
        field: bool,
        level_list_idx: usize,
        num_c8x8: u32,
        num_gt1: u32,
        num_eq1: u32,
    },
}

/// 一次推导请求
#[derive(Debug, Clone, Copy)]
pub struct CtxRequest<'b> {
    pub offset: u16,
    pub bin_idx: u32,
    /// 同一语法元素已解码的 bin
    pub prior_bins: &'b [u8],
    pub target: CtxTarget,
}

impl<'b> CtxRequest<'b> {
    pub fn new(offset: u16, bin_idx: u32, target: CtxTarget) -> Self {
        Self {
            offset,
            bin_idx,
            prior_bins: &[],
            target,
        }
    }

    pub fn with_prior(mut self, prior_bins: &'b [u8]) -> Self {
        self.prior_bins = prior_bins;
        self
    }
}

/// 推导结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derived {
    /// ctxIdxInc
    Inc(u32),
    /// 语法元素不出现, 取推断值 (mb_field_decoding_flag)
    Inferred(bool),
}

/// 各 bin 的 ctxIdx, 超过 maxBinIdxCtx 的 bin 沿用最后一个
#[derive(Debug, Clone, Copy)]
pub struct CtxLadder {
    ctx: [usize; 8],
    max: usize,
}

impl CtxLadder {
    pub fn at(&self, bin_idx: u32) -> usize {
        self.ctx[(bin_idx as usize).min(self.max)]
    }
}

/// 单个 bin 的推导环境
///
/// 每个语法元素解码前按当前宏块状态重建.
pub struct DerivationContext<'a, N: NeighborStore + ?Sized> {
    pub store: &'a N,
    pub geom: MbGeometry,
    pub slice_num: u32,
    pub slice_type: SliceType,
    pub mb_addr: u32,
    /// 当前宏块按场解码 (场图像或 MBAFF 场宏块)
    pub field: bool,
    /// 当前宏块已解码部分的摘要
    pub current: &'a NeighborInfo,
    /// 解码顺序上前一个宏块的 mb_qp_delta 非零
    pub prev_qp_delta_nonzero: bool,
    /// (MbWidthC, MbHeightC)
    pub chroma_size: (i32, i32),
}

impl<'a, N: NeighborStore + ?Sized> DerivationContext<'a, N> {
    /// 查询同一 slice 内已解码的宏块, 当前宏块返回进行中的摘要
    pub fn neighbor_mb(&self, mb_addr: u32) -> Option<&'a NeighborInfo> {
        if mb_addr == self.mb_addr {
            return Some(self.current);
        }
        self.store
            .get(mb_addr)
            .filter(|n| n.slice_num == self.slice_num)
    }

    fn locate(
        &self,
        xn: i32,
        yn: i32,
        max: (i32, i32),
    ) -> Option<(&'a NeighborInfo, NeighborLoc)> {
        let loc = self.geom.neighbor_location(self.mb_addr, self.field, (xn, yn), max, |addr| {
            self.neighbor_mb(addr).map(NeighborInfo::is_field)
        })?;
        Some((self.neighbor_mb(loc.mb_addr)?, loc))
    }

    /// 宏块级邻居 mbAddrA (6.4.11.1)
    pub fn mb_a(&self) -> Option<&'a NeighborInfo> {
        self.locate(-1, 0, (16, 16)).map(|(n, _)| n)
    }

    /// 宏块级邻居 mbAddrB
    pub fn mb_b(&self) -> Option<&'a NeighborInfo> {
        self.locate(0, -1, (16, 16)).map(|(n, _)| n)
    }

    fn pair_neighbor(&self, dir: Direction) -> Option<&'a NeighborInfo> {
        self.geom
            .neighbor_addr(self.mb_addr, dir)
            .and_then(|addr| self.neighbor_mb(addr))
    }

    /// 宏块对均未携带 mb_field_decoding_flag 时的推断值: 左侧宏块对, 其次上方, 否则帧
    pub fn inferred_field_flag(&self) -> bool {
        self.pair_neighbor(Direction::A)
            .or_else(|| self.pair_neighbor(Direction::B))
            .is_some_and(NeighborInfo::is_field)
    }

    // ============================================================
    // 入口
    // ============================================================

    /// ctxIdxInc 推导
    pub fn ctx_idx_inc(&self, req: &CtxRequest<'_>) -> AvcResult<Derived> {
        let invalid = || AvcError::InvalidDerivationRequest {
            ctx_idx_offset: req.offset,
            bin_idx: req.bin_idx,
        };
        let bin = req.bin_idx;
        let prior = req.prior_bins;
        let inc = match (req.offset, req.target) {
            (CTX_MB_SKIP_P | CTX_MB_SKIP_B, _) => self.mb_skip_inc(),
            (CTX_MB_FIELD_DECODING_FLAG, _) => return Ok(self.mb_field_ctx()),
            (CTX_MB_TYPE_SI_PREFIX, _) => self.mb_type_neighbor_inc(req.offset),
            (CTX_MB_TYPE_I, _) => match bin {
                0 => self.mb_type_neighbor_inc(req.offset),
                _ => intra_mb_type_inc(bin, prior, req.offset),
            },
            (CTX_MB_TYPE_P_SUFFIX | CTX_MB_TYPE_B_SUFFIX, _) => {
                intra_mb_type_inc(bin, prior, req.offset)
            }
            (CTX_MB_TYPE_P_PREFIX, _) => match bin {
                0 => 0,
                1 => 1,
                _ => {
                    if prior.get(1).copied().unwrap_or(0) != 1 {
                        2
                    } else {
                        3
                    }
                }
            },
            (CTX_MB_TYPE_B_PREFIX, _) => match bin {
                0 => self.mb_type_neighbor_inc(req.offset),
                1 => 3,
                2 => {
                    if prior.get(1).copied().unwrap_or(0) != 0 {
                        4
                    } else {
                        5
                    }
                }
                _ => 5,
            },
            (CTX_SUB_MB_TYPE_P, _) => bin.min(2),
            (CTX_SUB_MB_TYPE_B, _) => match bin {
                0 => 0,
                1 => 1,
                2 => {
                    if prior.get(1).copied().unwrap_or(0) != 0 {
                        2
                    } else {
                        3
                    }
                }
                _ => 3,
            },
            (CTX_MVD_X | CTX_MVD_Y, CtxTarget::Partition { list, x, y }) => {
                let comp = usize::from(req.offset == CTX_MVD_Y);
                self.mvd_inc(list, x, y, comp, bin)
            }
            (CTX_REF_IDX, CtxTarget::Partition { list, x, y }) => self.ref_idx_inc(list, x, y, bin),
            (CTX_MB_QP_DELTA, _) => match bin {
                0 => u32::from(self.prev_qp_delta_nonzero),
                1 => 2,
                _ => 3,
            },
            (CTX_INTRA_CHROMA_PRED_MODE, _) => match bin {
                0 => self.intra_chroma_pred_inc(),
                _ => 3,
            },
            (CTX_PREV_INTRA_PRED_MODE_FLAG | CTX_REM_INTRA_PRED_MODE | CTX_END_OF_SLICE, _) => 0,
            (CTX_CBP_LUMA, _) if bin < 4 => self.cbp_luma_inc(bin as usize, prior),
            (CTX_CBP_CHROMA, _) if bin < 2 => self.cbp_chroma_inc(bin),
            (CTX_TRANSFORM_SIZE_8X8, _) => self.transform_8x8_inc(),
            (offset, CtxTarget::Block { cat, plane, blk_idx }) if offset == cat.cbf_offset() => {
                self.coded_block_flag_inc(cat, plane, blk_idx)
            }
            (offset, CtxTarget::Coeff { .. }) => coeff_inc(offset, bin, req.target).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
        Ok(Derived::Inc(inc))
    }

    /// ctxIdx = ctxIdxOffset + ctxIdxInc
    pub fn ctx_idx(&self, req: &CtxRequest<'_>) -> AvcResult<usize> {
        match self.ctx_idx_inc(req)? {
            Derived::Inc(inc) => Ok(usize::from(req.offset) + inc as usize),
            Derived::Inferred(_) => Err(AvcError::InvalidDerivationRequest {
                ctx_idx_offset: req.offset,
                bin_idx: req.bin_idx,
            }),
        }
    }

    /// 预先推导 bin 0..=maxBinIdxCtx 的 ctxIdx, 供一元/UEGk 二值化使用
    pub fn ladder(&self, offset: u16, max_bin_idx_ctx: u32, target: CtxTarget) -> AvcResult<CtxLadder> {
        let max = (max_bin_idx_ctx as usize).min(7);
        let mut ctx = [0usize; 8];
        for (bin_idx, slot) in ctx.iter_mut().enumerate().take(max + 1) {
            *slot = self.ctx_idx(&CtxRequest::new(offset, bin_idx as u32, target))?;
        }
        Ok(CtxLadder { ctx, max })
    }

    /// 当前 slice 类型与编码方式下的语法元素元数据
    pub fn element(&self, element: SyntaxElement, cat: Option<BlockCat>) -> AvcResult<ElementInfo> {
        element_info(element, self.slice_type, cat, self.field).ok_or_else(|| {
            AvcError::InvalidDerivationRequest {
                ctx_idx_offset: u16::MAX,
                bin_idx: 0,
            }
        })
    }

    /// 按元数据中的 ctxIdxOffset 与 maxBinIdxCtx 预先推导一段 bin 的 ctxIdx
    pub fn section_ladder(&self, section: BinSection, target: CtxTarget) -> AvcResult<CtxLadder> {
        let offset = section.ctx_idx_offset.ok_or(AvcError::InvalidDerivationRequest {
            ctx_idx_offset: u16::MAX,
            bin_idx: 0,
        })?;
        self.ladder(offset, u32::from(section.max_bin_idx_ctx), target)
    }

    /// 语法元素前缀的各 bin ctxIdx
    pub fn element_ladder(
        &self,
        element: SyntaxElement,
        cat: Option<BlockCat>,
        target: CtxTarget,
    ) -> AvcResult<CtxLadder> {
        self.section_ladder(self.element(element, cat)?.prefix, target)
    }

    // ============================================================
    // 宏块级规则
    // ============================================================

    fn mb_skip_inc(&self) -> u32 {
        let cond = |n: Option<&NeighborInfo>| u32::from(n.is_some_and(|n| !n.is_skip()));
        cond(self.mb_a()) + cond(self.mb_b())
    }

    /// mb_field_decoding_flag: 底宏块且顶宏块未跳过时取顶宏块的值
    pub fn mb_field_ctx(&self) -> Derived {
        if self.mb_addr % 2 == 1
            && let Some(top) = self.neighbor_mb(self.mb_addr - 1)
            && !top.is_skip()
        {
            return Derived::Inferred(top.is_field());
        }
        let cond = |dir| u32::from(self.pair_neighbor(dir).is_some_and(NeighborInfo::is_field));
        Derived::Inc(cond(Direction::A) + cond(Direction::B))
    }

    fn mb_type_neighbor_inc(&self, offset: u16) -> u32 {
        let cond = |n: Option<&NeighborInfo>| {
            u32::from(n.is_some_and(|n| match offset {
                CTX_MB_TYPE_SI_PREFIX => n.mb_type != MbType::Si,
                CTX_MB_TYPE_I => n.mb_type != MbType::INxN,
                _ => !n.flags.contains(MbFlags::DIRECT),
            }))
        };
        cond(self.mb_a()) + cond(self.mb_b())
    }

    fn intra_chroma_pred_inc(&self) -> u32 {
        let cond = |n: Option<&NeighborInfo>| {
            u32::from(n.is_some_and(|n| {
                n.is_intra() && !n.is_pcm() && n.intra_chroma_pred_mode != 0
            }))
        };
        cond(self.mb_a()) + cond(self.mb_b())
    }

    fn transform_8x8_inc(&self) -> u32 {
        let cond = |n: Option<&NeighborInfo>| {
            u32::from(n.is_some_and(|n| n.flags.contains(MbFlags::TRANSFORM_8X8)))
        };
        cond(self.mb_a()) + cond(self.mb_b())
    }

    fn cbp_luma_inc(&self, b8: usize, prior: &[u8]) -> u32 {
        let (x, y) = luma8x8_blk_pos(b8);
        let cond = |xn: i32, yn: i32| -> u32 {
            let Some((n, loc)) = self.locate(xn, yn, (16, 16)) else {
                return 0;
            };
            let b8n = luma8x8_blk_idx(loc.x, loc.y);
            let coded = if loc.mb_addr == self.mb_addr {
                prior.get(b8n).copied().unwrap_or(0) != 0
            } else {
                (n.cbp_luma() >> b8n) & 1 != 0
            };
            u32::from(!coded)
        };
        cond(x - 1, y) + 2 * cond(x, y - 1)
    }

    fn cbp_chroma_inc(&self, bin_idx: u32) -> u32 {
        let cond = |n: Option<&NeighborInfo>| {
            u32::from(n.is_some_and(|n| {
                if bin_idx == 0 {
                    n.cbp_chroma() != 0
                } else {
                    n.cbp_chroma() == 2
                }
            }))
        };
        cond(self.mb_a()) + 2 * cond(self.mb_b()) + if bin_idx == 1 { 4 } else { 0 }
    }

    // ============================================================
    // 分区级规则
    // ============================================================

    fn ref_idx_inc(&self, list: usize, x: i32, y: i32, bin_idx: u32) -> u32 {
        match bin_idx {
            0 => {}
            1 => return 4,
            _ => return 5,
        }
        let cond = |xn: i32, yn: i32| -> u32 {
            self.locate(xn, yn, (16, 16)).map_or(0, |(n, loc)| {
                if n.is_skip() || n.is_intra() {
                    return 0;
                }
                let threshold = if self.geom.mbaff && !self.field && n.is_field() {
                    1
                } else {
                    0
                };
                let ref_idx = n.ref_idx[list & 1][luma8x8_blk_idx(loc.x, loc.y)];
                u32::from(ref_idx > threshold)
            })
        };
        cond(x - 1, y) + 2 * cond(x, y - 1)
    }

    fn mvd_inc(&self, list: usize, x: i32, y: i32, comp: usize, bin_idx: u32) -> u32 {
        if bin_idx > 0 {
            return (bin_idx + 2).min(6);
        }
        let abs_of = |xn: i32, yn: i32| -> u32 {
            self.locate(xn, yn, (16, 16)).map_or(0, |(n, loc)| {
                let v = u32::from(n.abs_mvd[list & 1][luma4x4_blk_idx(loc.x, loc.y)][comp]);
                if comp == 1 && self.geom.mbaff {
                    match (self.field, n.is_field()) {
                        (false, true) => v * 2,
                        (true, false) => v / 2,
                        _ => v,
                    }
                } else {
                    v
                }
            })
        };
        let sum = abs_of(x - 1, y) + abs_of(x, y - 1);
        match sum {
            0..=2 => 0,
            3..=32 => 1,
            _ => 2,
        }
    }

    // ============================================================
    // coded_block_flag
    // ============================================================

    fn coded_block_flag_inc(&self, cat: BlockCat, plane: usize, blk_idx: usize) -> u32 {
        let cur_intra = self.current.is_intra();
        let cond = |found: Option<(&NeighborInfo, NeighborLoc)>| -> u32 {
            match found {
                None => u32::from(cur_intra),
                Some((n, _)) if n.is_pcm() => 1,
                Some((n, loc)) => u32::from(trans_block_coded(n, loc, cat, plane).unwrap_or(false)),
            }
        };
        let (x, y, max) = match cat {
            BlockCat::LumaDc | BlockCat::CbDc | BlockCat::CrDc | BlockCat::ChromaDc => {
                (0, 0, (16, 16))
            }
            BlockCat::ChromaAc => {
                let (x, y) = chroma4x4_blk_pos(blk_idx);
                (x, y, self.chroma_size)
            }
            BlockCat::Luma8x8 | BlockCat::Cb8x8 | BlockCat::Cr8x8 => {
                let (x, y) = luma8x8_blk_pos(blk_idx);
                (x, y, (16, 16))
            }
            _ => {
                let (x, y) = luma4x4_blk_pos(blk_idx);
                (x, y, (16, 16))
            }
        };
        cond(self.locate(x - 1, y, max)) + 2 * cond(self.locate(x, y - 1, max))
    }
}

/// 邻居 transBlockN 的 coded_block_flag, transBlockN 不可用时返回 `None`
fn trans_block_coded(n: &NeighborInfo, loc: NeighborLoc, cat: BlockCat, plane: usize) -> Option<bool> {
    match cat {
        BlockCat::LumaDc | BlockCat::CbDc | BlockCat::CrDc => {
            matches!(n.mb_type, MbType::I16x16 { .. }).then(|| n.cbf_bit(plane, CBF_DC_BIT))
        }
        BlockCat::ChromaDc => (n.cbp_chroma() != 0).then(|| n.cbf_bit(plane, CBF_DC_BIT)),
        BlockCat::ChromaAc => {
            let blk = chroma4x4_blk_idx(loc.x, loc.y) as u32;
            (n.cbp_chroma() == 2).then(|| n.cbf_bit(plane, blk))
        }
        BlockCat::Luma8x8 | BlockCat::Cb8x8 | BlockCat::Cr8x8 => {
            let b8 = luma8x8_blk_idx(loc.x, loc.y);
            let coded = (n.cbp_luma() >> b8) & 1 != 0 && n.flags.contains(MbFlags::TRANSFORM_8X8);
            coded.then(|| n.cbf_bit(plane, 4 * b8 as u32))
        }
        _ => {
            let b8 = luma8x8_blk_idx(loc.x, loc.y);
            let blk = luma4x4_blk_idx(loc.x, loc.y) as u32;
            ((n.cbp_luma() >> b8) & 1 != 0).then(|| n.cbf_bit(plane, blk))
        }
    }
}

/// I 类 mb_type 在 binIdx >= 1 时的 ctxIdxInc (表 9-39)
///
/// binIdx 1 为终止 bin, 返回值使 ctxIdx 等于 276.
fn intra_mb_type_inc(bin_idx: u32, prior: &[u8], offset: u16) -> u32 {
    let b3 = prior.get(3).copied().unwrap_or(0) != 0;
    if bin_idx == 1 {
        return u32::from(CTX_END_OF_SLICE - offset);
    }
    if offset == CTX_MB_TYPE_I {
        match bin_idx {
            2 => 3,
            3 => 4,
            4 => {
                if b3 {
                    5
                } else {
                    6
                }
            }
            5 => {
                if b3 {
                    6
                } else {
                    7
                }
            }
            _ => 7,
        }
    } else {
        match bin_idx {
            0 => 0,
            2 => 1,
            3 => 2,
            4 => {
                if b3 {
                    2
                } else {
                    3
                }
            }
            _ => 3,
        }
    }
}

/// significant / last / coeff_abs_level_minus1 (9.3.3.1.3)
fn coeff_inc(offset: u16, bin_idx: u32, target: CtxTarget) -> Option<u32> {
    let CtxTarget::Coeff {
        cat,
        field,
        level_list_idx,
        num_c8x8,
        num_gt1,
        num_eq1,
    } = target
    else {
        return None;
    };
    let sig = offset == cat.sig_offset(field);
    let last = offset == cat.last_offset(field);
    if sig || last {
        if cat == BlockCat::ChromaDc {
            return Some((level_list_idx as u32 / num_c8x8.max(1)).min(2));
        }
        if cat.is_8x8() {
            let table: &[u8] = match (last, field) {
                (true, _) => &LAST_8X8,
                (false, false) => &SIG_8X8_FRAME,
                (false, true) => &SIG_8X8_FIELD,
            };
            return table.get(level_list_idx).map(|&v| u32::from(v));
        }
        return Some(level_list_idx as u32);
    }
    if offset == cat.abs_offset() {
        if bin_idx == 0 {
            return Some(if num_gt1 != 0 { 0 } else { (1 + num_eq1).min(4) });
        }
        let cap = 4 - u32::from(cat == BlockCat::ChromaDc);
        return Some(5 + num_gt1.min(cap));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mb_types::PartPred;
    use crate::neighbor::PictureMbStore;

    const GEOM: MbGeometry = MbGeometry {
        width_mbs: 3,
        height_mbs: 3,
        mbaff: false,
    };

    fn ctx<'a>(store: &'a PictureMbStore, current: &'a NeighborInfo, mb_addr: u32) -> DerivationContext<'a, PictureMbStore> {
        DerivationContext {
            store,
            geom: GEOM,
            slice_num: 1,
            slice_type: SliceType::P,
            mb_addr,
            field: false,
            current,
            prev_qp_delta_nonzero: false,
            chroma_size: (8, 8),
        }
    }

    fn inc(dc: &DerivationContext<'_, PictureMbStore>, req: CtxRequest<'_>) -> u32 {
        match dc.ctx_idx_inc(&req).expect("推导失败") {
            Derived::Inc(v) => v,
            Derived::Inferred(v) => panic!("不应为推断值: {}", v),
        }
    }

    fn store_with(entries: &[(u32, NeighborInfo)]) -> PictureMbStore {
        let mut store = PictureMbStore::new();
        store.prepare(GEOM.pic_size_in_mbs());
        for (addr, info) in entries {
            store.put(*addr, *info);
        }
        store
    }

    #[test]
    fn test_mb_skip_counts_non_skipped_neighbors() {
        let mut skipped = NeighborInfo::empty(1);
        skipped.flags = MbFlags::SKIP;
        let coded = NeighborInfo::empty(1);
        // 宏块 4: A = 3, B = 1
        let store = store_with(&[(3, skipped), (1, coded)]);
        let current = NeighborInfo::empty(1);
        let dc = ctx(&store, &current, 4);
        assert_eq!(inc(&dc, CtxRequest::new(CTX_MB_SKIP_P, 0, CtxTarget::Macroblock)), 1);

        // 其他 slice 的宏块不可用
        let other = store_with(&[(3, NeighborInfo::empty(0)), (1, NeighborInfo::empty(0))]);
        let dc = ctx(&other, &current, 4);
        assert_eq!(inc(&dc, CtxRequest::new(CTX_MB_SKIP_P, 0, CtxTarget::Macroblock)), 0);
    }

    #[test]
    fn test_unknown_offset_is_rejected() {
        let store = store_with(&[]);
        let current = NeighborInfo::empty(1);
        let dc = ctx(&store, &current, 0);
        let err = dc
            .ctx_idx_inc(&CtxRequest::new(1000, 2, CtxTarget::Macroblock))
            .expect_err("未定义的偏移应失败");
        assert!(matches!(
            err,
            AvcError::InvalidDerivationRequest {
                ctx_idx_offset: 1000,
                bin_idx: 2
            }
        ));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_b_mb_type_bin_ordering() {
        let store = store_with(&[]);
        let current = NeighborInfo::empty(1);
        let dc = ctx(&store, &current, 0);
        let req = |bin, prior| CtxRequest::new(CTX_MB_TYPE_B_PREFIX, bin, CtxTarget::Macroblock).with_prior(prior);
        assert_eq!(inc(&dc, req(1, &[1])), 3);
        assert_eq!(inc(&dc, req(2, &[1, 1])), 4);
        assert_eq!(inc(&dc, req(2, &[1, 0])), 5);
        assert_eq!(inc(&dc, req(4, &[1, 1, 0, 1])), 5);
        let p = |bin, prior| CtxRequest::new(CTX_MB_TYPE_P_PREFIX, bin, CtxTarget::Macroblock).with_prior(prior);
        assert_eq!(inc(&dc, p(2, &[0, 0])), 2);
        assert_eq!(inc(&dc, p(2, &[0, 1])), 3);
    }

    #[test]
    fn test_intra_mb_type_terminate_bin_maps_to_276() {
        let store = store_with(&[]);
        let current = NeighborInfo::empty(1);
        let dc = ctx(&store, &current, 0);
        for offset in [CTX_MB_TYPE_I, CTX_MB_TYPE_P_SUFFIX, CTX_MB_TYPE_B_SUFFIX] {
            let idx = dc
                .ctx_idx(&CtxRequest::new(offset, 1, CtxTarget::Macroblock).with_prior(&[1]))
                .expect("推导失败");
            assert_eq!(idx, 276);
        }
        let req = CtxRequest::new(CTX_MB_TYPE_I, 5, CtxTarget::Macroblock).with_prior(&[1, 0, 1, 1, 0]);
        assert_eq!(inc(&dc, req), 6);
    }

    #[test]
    fn test_cbp_luma_uses_prior_bins_inside_macroblock() {
        let mut left = NeighborInfo::empty(1);
        left.cbp = 0b0010; // 只有 8x8 块 1 有残差
        let store = store_with(&[(3, left)]);
        let current = NeighborInfo::empty(1);
        let dc = ctx(&store, &current, 4);
        // b8 = 0: A 为宏块 3 的 b8 1 (已编码 → 0), B 不可用 → 0
        assert_eq!(inc(&dc, CtxRequest::new(CTX_CBP_LUMA, 0, CtxTarget::Macroblock)), 0);
        // b8 = 1: A 为当前宏块 b8 0 (prior 0 → 1), B 不可用
        let req = CtxRequest::new(CTX_CBP_LUMA, 1, CtxTarget::Macroblock).with_prior(&[0]);
        assert_eq!(inc(&dc, req), 1);
        // b8 = 3: A = 当前 b8 2, B = 当前 b8 1
        let req = CtxRequest::new(CTX_CBP_LUMA, 3, CtxTarget::Macroblock).with_prior(&[1, 0, 1]);
        assert_eq!(inc(&dc, req), 2);
    }

    #[test]
    fn test_mvd_sum_thresholds() {
        let mut left = NeighborInfo::empty(1);
        let mut above = NeighborInfo::empty(1);
        left.mb_type = MbType::PL016x16;
        above.mb_type = MbType::PL016x16;
        let cases = [(1u16, 1u16, 0u32), (2, 1, 1), (16, 16, 1), (20, 13, 2)];
        for (a, b, want) in cases {
            left.abs_mvd[0][5][0] = a;
            above.abs_mvd[0][10][0] = b;
            let store = store_with(&[(3, left), (1, above)]);
            let current = NeighborInfo::empty(1);
            let dc = ctx(&store, &current, 4);
            let target = CtxTarget::Partition { list: 0, x: 0, y: 0 };
            assert_eq!(inc(&dc, CtxRequest::new(CTX_MVD_X, 0, target)), want, "a={} b={}", a, b);
        }
        let store = store_with(&[]);
        let current = NeighborInfo::empty(1);
        let dc = ctx(&store, &current, 4);
        let target = CtxTarget::Partition { list: 1, x: 0, y: 0 };
        let ladder = dc.ladder(CTX_MVD_Y, 4, target).expect("推导失败");
        assert_eq!(
            (0..7).map(|b| ladder.at(b)).collect::<Vec<_>>(),
            vec![47, 50, 51, 52, 53, 53, 53]
        );
    }

    #[test]
    fn test_ref_idx_skips_intra_and_unused_lists() {
        let mut left = NeighborInfo::empty(1);
        left.mb_type = MbType::B16x16(PartPred::L1);
        left.ref_idx = [[-1; 4], [2; 4]];
        let mut above = NeighborInfo::empty(1);
        above.flags = MbFlags::INTRA;
        above.ref_idx = [[3; 4], [3; 4]];
        let store = store_with(&[(3, left), (1, above)]);
        let current = NeighborInfo::empty(1);
        let dc = ctx(&store, &current, 4);
        let l0 = CtxTarget::Partition { list: 0, x: 0, y: 0 };
        let l1 = CtxTarget::Partition { list: 1, x: 0, y: 0 };
        assert_eq!(inc(&dc, CtxRequest::new(CTX_REF_IDX, 0, l0)), 0);
        assert_eq!(inc(&dc, CtxRequest::new(CTX_REF_IDX, 0, l1)), 1);
        assert_eq!(inc(&dc, CtxRequest::new(CTX_REF_IDX, 3, l1)), 5);
    }

    #[test]
    fn test_coded_block_flag_neighbor_rules() {
        let mut pcm = NeighborInfo::empty(1);
        pcm.flags = MbFlags::PCM | MbFlags::INTRA;
        pcm.mb_type = MbType::IPcm;
        let store = store_with(&[(3, pcm)]);
        let mut current = NeighborInfo::empty(1);
        current.flags = MbFlags::INTRA;
        let dc = ctx(&store, &current, 4);
        let target = CtxTarget::Block {
            cat: BlockCat::Luma4x4,
            plane: 0,
            blk_idx: 0,
        };
        // A 为 I_PCM → 1, B 不可用且当前帧内 → 1
        let offset = BlockCat::Luma4x4.cbf_offset();
        assert_eq!(inc(&dc, CtxRequest::new(offset, 0, target)), 3);

        let mut inter = NeighborInfo::empty(1);
        inter.mb_type = MbType::PL016x16;
        let store = store_with(&[(3, inter)]);
        let current = NeighborInfo::empty(1);
        let dc = ctx(&store, &current, 4);
        assert_eq!(inc(&dc, CtxRequest::new(offset, 0, target)), 0);

        // 当前宏块内部的 4x4 块
        let mut current = NeighborInfo::empty(1);
        current.cbp = 0x0F;
        current.cbf[0] = 1 << 0;
        let dc = ctx(&store, &current, 4);
        let target = CtxTarget::Block {
            cat: BlockCat::Luma4x4,
            plane: 0,
            blk_idx: 1,
        };
        assert_eq!(inc(&dc, CtxRequest::new(offset, 0, target)), 1);
    }

    #[test]
    fn test_coeff_increments() {
        let store = store_with(&[]);
        let current = NeighborInfo::empty(1);
        let dc = ctx(&store, &current, 0);
        let coeff = |cat, idx, gt1, eq1| CtxTarget::Coeff {
            cat,
            field: false,
            level_list_idx: idx,
            num_c8x8: 1,
            num_gt1: gt1,
            num_eq1: eq1,
        };
        let cdc = BlockCat::ChromaDc;
        assert_eq!(inc(&dc, CtxRequest::new(cdc.sig_offset(false), 0, coeff(cdc, 3, 0, 0))), 2);
        let l8 = BlockCat::Luma8x8;
        assert_eq!(inc(&dc, CtxRequest::new(l8.sig_offset(false), 0, coeff(l8, 22, 0, 0))), 6);
        assert_eq!(inc(&dc, CtxRequest::new(l8.last_offset(false), 0, coeff(l8, 40, 0, 0))), 4);
        let l4 = BlockCat::Luma4x4;
        assert_eq!(inc(&dc, CtxRequest::new(l4.abs_offset(), 0, coeff(l4, 0, 0, 2))), 3);
        assert_eq!(inc(&dc, CtxRequest::new(l4.abs_offset(), 0, coeff(l4, 0, 1, 9))), 0);
        assert_eq!(inc(&dc, CtxRequest::new(l4.abs_offset(), 1, coeff(l4, 0, 7, 0))), 9);
        assert_eq!(inc(&dc, CtxRequest::new(cdc.abs_offset(), 1, coeff(cdc, 0, 7, 0))), 8);
        assert!(
            dc.ctx_idx_inc(&CtxRequest::new(85, 0, coeff(l4, 0, 0, 0))).is_err(),
            "cbf 偏移不能用于系数推导"
        );
    }

    #[test]
    fn test_mb_field_flag_inference() {
        let geom = MbGeometry {
            width_mbs: 2,
            height_mbs: 2,
            mbaff: true,
        };
        let mut field_top = NeighborInfo::empty(1);
        field_top.flags = MbFlags::FIELD;
        let mut store = PictureMbStore::new();
        store.prepare(4);
        store.put(0, field_top);
        store.put(2, field_top);
        let current = NeighborInfo::empty(1);
        let mut dc = DerivationContext {
            store: &store,
            geom,
            slice_num: 1,
            slice_type: SliceType::P,
            mb_addr: 3,
            field: false,
            current: &current,
            prev_qp_delta_nonzero: false,
            chroma_size: (8, 8),
        };
        assert_eq!(dc.mb_field_ctx(), Derived::Inferred(true));
        // 宏块对 1 的顶宏块: 左侧宏块对为场宏块对
        dc.mb_addr = 2;
        assert_eq!(dc.mb_field_ctx(), Derived::Inc(1));
        assert!(dc.inferred_field_flag());
    }

    #[test]
    fn test_element_ladder_follows_metadata() {
        let store = store_with(&[]);
        let current = NeighborInfo::empty(1);
        let dc = ctx(&store, &current, 0);
        let part = CtxTarget::Partition { list: 0, x: 0, y: 0 };
        let bins = |element, target| {
            let ladder = dc.element_ladder(element, None, target).expect("推导失败");
            (0..6).map(|b| ladder.at(b)).collect::<Vec<_>>()
        };
        // 超过 maxBinIdxCtx 的 bin 沿用最后一个上下文
        assert_eq!(bins(SyntaxElement::MvdX, part), vec![40, 43, 44, 45, 46, 46]);
        assert_eq!(bins(SyntaxElement::RefIdx, part), vec![54, 58, 59, 59, 59, 59]);
        assert_eq!(
            bins(SyntaxElement::MbQpDelta, CtxTarget::Macroblock),
            vec![60, 62, 63, 63, 63, 63]
        );

        let coeff = CtxTarget::Coeff {
            cat: BlockCat::ChromaAc,
            field: false,
            level_list_idx: 0,
            num_c8x8: 1,
            num_gt1: 1,
            num_eq1: 0,
        };
        let ladder = dc
            .element_ladder(SyntaxElement::CoeffAbsLevelMinus1, Some(BlockCat::ChromaAc), coeff)
            .expect("推导失败");
        assert_eq!(ladder.at(0), 266);
        assert_eq!(ladder.at(1), 266 + 6);
        assert_eq!(ladder.at(9), 266 + 6);

        // P slice 的元数据表中没有对应条目
        let err = dc
            .element_ladder(SyntaxElement::CoeffAbsLevelMinus1, None, coeff)
            .expect_err("缺少块类别应失败");
        assert!(matches!(err, AvcError::InvalidDerivationRequest { .. }));
    }
}
