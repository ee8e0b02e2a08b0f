//! CABAC 残差语法 (H.264 7.3.5.3).
//!
//! 系数以扫描顺序输出, 不做反扫描与反量化.

use avcsyn_core::{AvcError, AvcResult};

use crate::binarization::{UegkParams, decode_uegk};
use crate::cabac::BinDecoder;
use crate::derivation::CtxTarget;
use crate::elements::{BlockCat, SyntaxElement};
use crate::macroblock::{ChromaResidual, PlaneResidual, ResidualData};
use crate::mb_layer::MbEnv;
use crate::mb_types::MbType;
use crate::neighbor::{CBF_DC_BIT, MbFlags, NeighborInfo, NeighborStore};

/// 残差块在宏块中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId {
    pub cat: BlockCat,
    /// 颜色分量 (0=Y, 1=Cb, 2=Cr)
    pub plane: usize,
    /// luma4x4BlkIdx / luma8x8BlkIdx / chroma4x4BlkIdx, DC 块为 0
    pub blk_idx: usize,
}

/// residual_block_cabac: 解码一个残差块, 返回 coded_block_flag
///
/// `coeff_level` 的长度即 maxNumCoeff, 解码前全部清零.
/// coded_block_flag 为 0 时不再读取任何 bin.
pub fn residual_block_cabac<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &NeighborInfo,
    block: BlockId,
    coeff_level: &mut [i32],
) -> AvcResult<bool>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    coeff_level.fill(0);
    let max_num_coeff = coeff_level.len();
    let cat = block.cat;
    let dc = env.derive(current);

    let coded = if max_num_coeff != 64 || env.chroma_array_type() == 3 {
        let target = CtxTarget::Block {
            cat,
            plane: block.plane,
            blk_idx: block.blk_idx,
        };
        let ctx = dc
            .element_ladder(SyntaxElement::CodedBlockFlag, Some(cat), target)?
            .at(0);
        decoder.decode_decision(ctx)? == 1
    } else {
        true
    };
    if !coded {
        return Ok(false);
    }

    let field = env.field;
    let num_c8x8 = env.num_c8x8();
    let coeff_target = |level_list_idx: usize, num_gt1: u32, num_eq1: u32| CtxTarget::Coeff {
        cat,
        field,
        level_list_idx,
        num_c8x8,
        num_gt1,
        num_eq1,
    };

    // 显著性图
    let mut significant = [false; 64];
    let mut num_coeff = max_num_coeff;
    let mut i = 0usize;
    while i + 1 < num_coeff {
        let sig_ctx = dc
            .element_ladder(SyntaxElement::SignificantCoeffFlag, Some(cat), coeff_target(i, 0, 0))?
            .at(0);
        if decoder.decode_decision(sig_ctx)? == 1 {
            significant[i] = true;
            let last_ctx = dc
                .element_ladder(
                    SyntaxElement::LastSignificantCoeffFlag,
                    Some(cat),
                    coeff_target(i, 0, 0),
                )?
                .at(0);
            if decoder.decode_decision(last_ctx)? == 1 {
                num_coeff = i + 1;
            }
        }
        i += 1;
    }
    significant[num_coeff - 1] = true;

    // 系数值, 从最后一个显著系数反向解码
    let params = UegkParams::coeff_abs_level(env.config.max_escape_bits);
    let mut num_gt1 = 0u32;
    let mut num_eq1 = 0u32;
    for i in (0..num_coeff).rev().filter(|&i| significant[i]) {
        let ladder = dc.element_ladder(
            SyntaxElement::CoeffAbsLevelMinus1,
            Some(cat),
            coeff_target(i, num_gt1, num_eq1),
        )?;
        let abs_minus1 = decode_uegk(decoder, params, |bin| ladder.at(bin))?;
        if abs_minus1 == 0 {
            num_eq1 += 1;
        } else {
            num_gt1 += 1;
        }
        let level = abs_minus1.checked_add(1).ok_or_else(|| {
            AvcError::InvalidData(format!(
                "H.264: coeff_abs_level_minus1 溢出, value={}",
                abs_minus1
            ))
        })?;
        coeff_level[i] = if decoder.decode_bypass()? == 1 { -level } else { level };
    }
    Ok(true)
}

/// residual_luma: 一个与亮度同构的颜色分量
///
/// 4:4:4 下 Cb/Cr 也走这里, `plane` 选择块类别与 coded_block_flag 存储.
pub fn residual_luma<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &mut NeighborInfo,
    plane: usize,
    out: &mut PlaneResidual,
) -> AvcResult<()>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let intra16x16 = matches!(current.mb_type, MbType::I16x16 { .. });
    let cbp_luma = current.cbp_luma();
    let transform_8x8 = current.flags.contains(MbFlags::TRANSFORM_8X8);
    let cat_of = |base| BlockCat::for_plane(base, plane);

    if intra16x16 {
        let block = BlockId {
            cat: cat_of(BlockCat::LumaDc),
            plane,
            blk_idx: 0,
        };
        if residual_block_cabac(decoder, env, current, block, &mut out.dc)? {
            current.cbf[plane] |= 1 << CBF_DC_BIT;
        }
    }

    for i8x8 in 0..4 {
        if cbp_luma & (1 << i8x8) == 0 {
            continue;
        }
        if transform_8x8 {
            let block = BlockId {
                cat: cat_of(BlockCat::Luma8x8),
                plane,
                blk_idx: i8x8,
            };
            if residual_block_cabac(decoder, env, current, block, &mut out.level8x8[i8x8])? {
                current.cbf[plane] |= 0xF << (4 * i8x8);
            }
            continue;
        }
        for i4x4 in 0..4 {
            let blk_idx = i8x8 * 4 + i4x4;
            let coded = if intra16x16 {
                let block = BlockId {
                    cat: cat_of(BlockCat::LumaAc),
                    plane,
                    blk_idx,
                };
                residual_block_cabac(decoder, env, current, block, &mut out.ac[blk_idx])?
            } else {
                let block = BlockId {
                    cat: cat_of(BlockCat::Luma4x4),
                    plane,
                    blk_idx,
                };
                residual_block_cabac(decoder, env, current, block, &mut out.level4x4[blk_idx])?
            };
            if coded {
                current.cbf[plane] |= 1 << blk_idx;
            }
        }
    }
    Ok(())
}

/// 4:2:0 / 4:2:2 色度残差
pub fn residual_chroma<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &mut NeighborInfo,
    out: &mut ChromaResidual,
) -> AvcResult<()>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let cbp_chroma = current.cbp_chroma();
    let num_c8x8 = env.num_c8x8() as usize;

    if cbp_chroma & 3 != 0 {
        for i_cb_cr in 0..2 {
            let block = BlockId {
                cat: BlockCat::ChromaDc,
                plane: 1 + i_cb_cr,
                blk_idx: 0,
            };
            let dc = &mut out.dc[i_cb_cr][..4 * num_c8x8];
            if residual_block_cabac(decoder, env, current, block, dc)? {
                current.cbf[1 + i_cb_cr] |= 1 << CBF_DC_BIT;
            }
        }
    }

    if cbp_chroma & 2 != 0 {
        for i_cb_cr in 0..2 {
            for blk_idx in 0..4 * num_c8x8 {
                let block = BlockId {
                    cat: BlockCat::ChromaAc,
                    plane: 1 + i_cb_cr,
                    blk_idx,
                };
                let ac = &mut out.ac[i_cb_cr][blk_idx];
                if residual_block_cabac(decoder, env, current, block, ac)? {
                    current.cbf[1 + i_cb_cr] |= 1 << blk_idx;
                }
            }
        }
    }
    Ok(())
}

/// residual( 0, 15 )
pub fn residual<D, N>(
    decoder: &mut D,
    env: &MbEnv<'_, N>,
    current: &mut NeighborInfo,
    out: &mut ResidualData,
) -> AvcResult<()>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    residual_luma(decoder, env, current, 0, &mut out.planes[0])?;
    match env.chroma_array_type() {
        1 | 2 => residual_chroma(decoder, env, current, &mut out.chroma)?,
        3 => {
            let [_, cb, cr] = &mut out.planes;
            residual_luma(decoder, env, current, 1, cb)?;
            residual_luma(decoder, env, current, 2, cr)?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParserConfig;
    use crate::neighbor::PictureMbStore;
    use crate::slice_header::SliceType;
    use crate::test_support::{ScriptedBins, test_slice_header};

    fn with_env<R>(f: impl FnOnce(&MbEnv<'_, PictureMbStore>) -> R) -> R {
        let header = test_slice_header(SliceType::I, 2, 2);
        let config = ParserConfig::default();
        let mut store = PictureMbStore::new();
        store.prepare(4);
        let env = MbEnv::new(&store, &header, &config, 1, 0);
        f(&env)
    }

    #[test]
    fn test_cbf_zero_leaves_block_untouched() {
        with_env(|env| {
            let mut bins = ScriptedBins::new(&[0]);
            let mut coeffs = [7i32; 16];
            let current = NeighborInfo::empty(1);
            let block = BlockId {
                cat: BlockCat::Luma4x4,
                plane: 0,
                blk_idx: 0,
            };
            let coded =
                residual_block_cabac(&mut bins, env, &current, block, &mut coeffs).expect("解码失败");
            assert!(!coded);
            assert!(coeffs.iter().all(|&c| c == 0), "cbf=0 时系数必须全为 0");
            assert_eq!(bins.consumed(), 1, "cbf=0 后不应再读取 bin");
            assert_eq!(bins.bypass_consumed(), 0);
        });
    }

    #[test]
    fn test_significance_map_and_levels() {
        with_env(|env| {
            // cbf=1; sig[0]=1 last[0]=0; sig[1]=0; sig[2]=1 last[2]=1;
            // 系数 2: abs 前缀 0 → 1; 系数 0: abs 前缀 1,0 → 2
            let mut bins = ScriptedBins::new(&[1, 1, 0, 0, 1, 1, 0, 1, 0]).with_bypass(&[1, 0]);
            let mut coeffs = [0i32; 16];
            let current = NeighborInfo::empty(1);
            let block = BlockId {
                cat: BlockCat::Luma4x4,
                plane: 0,
                blk_idx: 0,
            };
            let coded =
                residual_block_cabac(&mut bins, env, &current, block, &mut coeffs).expect("解码失败");
            assert!(coded);
            assert_eq!(&coeffs[..4], &[2, 0, -1, 0]);
            let abs = usize::from(BlockCat::Luma4x4.abs_offset());
            let sig = usize::from(BlockCat::Luma4x4.sig_offset(false));
            let last = usize::from(BlockCat::Luma4x4.last_offset(false));
            let ctxs = bins.contexts();
            assert_eq!(&ctxs[1..6], &[sig, last, sig + 1, sig + 2, last + 2]);
            // 第一个值: numEq1=0 → inc 1; 第二个值: numEq1=1 → inc 2, 后续 bin inc 5
            assert_eq!(&ctxs[6..], &[abs + 1, abs + 2, abs + 5]);
        });
    }

    #[test]
    fn test_last_position_inferred_significant() {
        with_env(|env| {
            // 15 个 sig=0, 最后一个位置隐含显著
            let mut script = vec![1u8];
            script.extend_from_slice(&[0; 15]);
            script.push(0);
            let mut bins = ScriptedBins::new(&script).with_bypass(&[0]);
            let mut coeffs = [0i32; 16];
            let current = NeighborInfo::empty(1);
            let block = BlockId {
                cat: BlockCat::Luma4x4,
                plane: 0,
                blk_idx: 3,
            };
            residual_block_cabac(&mut bins, env, &current, block, &mut coeffs).expect("解码失败");
            assert_eq!(coeffs[15], 1);
            assert_eq!(coeffs.iter().filter(|&&c| c != 0).count(), 1);
        });
    }

    #[test]
    fn test_8x8_block_has_no_cbf_outside_444() {
        with_env(|env| {
            let mut current = NeighborInfo::empty(1);
            current.cbp = 0b0001;
            current.flags = MbFlags::TRANSFORM_8X8;
            current.mb_type = MbType::PL016x16;
            // sig[0]=1 last[0]=1, abs 0, sign 0
            let mut bins = ScriptedBins::new(&[1, 1, 0]).with_bypass(&[0]);
            let mut out = PlaneResidual::default();
            residual_luma(&mut bins, env, &mut current, 0, &mut out).expect("解码失败");
            assert_eq!(out.level8x8[0][0], 1);
            assert_eq!(current.cbf[0], 0xF, "8x8 块的 coded_block_flag 推断为 1");
            let sig = usize::from(BlockCat::Luma8x8.sig_offset(false));
            assert_eq!(bins.contexts()[0], sig);
        });
    }
}
