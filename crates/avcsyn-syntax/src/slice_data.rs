//! CABAC slice_data 循环 (H.264 7.3.4).

use log::trace;
use serde::Serialize;

use avcsyn_core::{AvcError, AvcResult, BitSource};

use crate::cabac::{BinDecoder, CabacReader, ContextStore};
use crate::config::ParserConfig;
use crate::derivation::{CtxTarget, Derived};
use crate::elements::{CTX_MB_FIELD_DECODING_FLAG, SyntaxElement};
use crate::macroblock::MacroblockInfo;
use crate::mb_layer::{MbEnv, PcmReader, macroblock_layer};
use crate::mb_types::MbType;
use crate::neighbor::{MbFlags, NeighborInfo, NeighborStore};
use crate::parser::MacroblockSink;
use crate::slice_group::SliceGroupMap;
use crate::slice_header::SliceHeader;

/// 单个 slice 的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SliceStats {
    pub macroblocks: u32,
    pub skipped: u32,
    pub intra: u32,
    pub pcm: u32,
    pub nonzero_coefficients: u64,
}

impl SliceStats {
    fn record(&mut self, info: &MacroblockInfo) {
        self.macroblocks += 1;
        if info.skip {
            self.skipped += 1;
        }
        if info.is_intra() {
            self.intra += 1;
        }
        if info.mb_type == MbType::IPcm {
            self.pcm += 1;
        }
        self.nonzero_coefficients += info.nonzero_coefficients() as u64;
    }

    /// 累加另一个 slice 的统计
    pub fn merge(&mut self, other: &SliceStats) {
        self.macroblocks += other.macroblocks;
        self.skipped += other.skipped;
        self.intra += other.intra;
        self.pcm += other.pcm;
        self.nonzero_coefficients += other.nonzero_coefficients;
    }
}

/// slice 内跨宏块传递的解码状态
#[derive(Debug)]
struct SliceScratch {
    slice_num: u32,
    /// 前一个宏块的 QP_Y
    qp_y: i32,
    prev_qp_delta_nonzero: bool,
    prev_mb_skipped: bool,
    /// 当前 MBAFF 宏块对的场标志
    pair_field: bool,
    /// MBAFF 下跳过的顶宏块, 等底宏块确定场标志后再输出
    deferred_top: Option<MacroblockInfo>,
}

/// 从 slice header 之后的位置解析 slice_data
///
/// `br` 应位于 `header.data_bit_offset`. 每个宏块解析完成后调用一次 `sink`,
/// 其摘要写入 `store` 供后续宏块推导上下文.
pub fn parse_slice_data<S, N, K>(
    br: &mut S,
    header: &SliceHeader,
    config: &ParserConfig,
    store: &mut N,
    slice_num: u32,
    sink: &mut K,
) -> AvcResult<SliceStats>
where
    S: BitSource + ?Sized,
    N: NeighborStore + ?Sized,
    K: MacroblockSink + ?Sized,
{
    if !header.pps.is_cabac() {
        return Err(AvcError::UnsupportedFeature(
            "H.264: CAVLC slice_data 不支持".into(),
        ));
    }
    let contexts = ContextStore::new_for_slice(header.cabac_init_idc, header.slice_qp)?;
    let mut reader = CabacReader::new(br, contexts)?;
    decode_slice_macroblocks(&mut reader, header, config, store, slice_num, sink)
}

/// slice_data 宏块循环, 与具体的 bin 源无关
pub fn decode_slice_macroblocks<D, N, K>(
    decoder: &mut D,
    header: &SliceHeader,
    config: &ParserConfig,
    store: &mut N,
    slice_num: u32,
    sink: &mut K,
) -> AvcResult<SliceStats>
where
    D: PcmReader + ?Sized,
    N: NeighborStore + ?Sized,
    K: MacroblockSink + ?Sized,
{
    let pic_size = header.pic_size_in_mbs();
    let map = SliceGroupMap::build(
        &header.sps,
        &header.pps,
        header.field_pic,
        header.slice_group_change_cycle.unwrap_or(0),
    )?;
    let mbaff = header.mbaff();
    let mut curr = header.first_mb_addr();
    if curr >= pic_size {
        return Err(AvcError::StructuralViolation(format!(
            "H.264: first_mb_in_slice 超出图像, mb_addr={}, pic_size={}",
            curr, pic_size
        )));
    }
    store.prepare(pic_size);

    let mut scratch = SliceScratch {
        slice_num,
        qp_y: header.slice_qp,
        prev_qp_delta_nonzero: false,
        prev_mb_skipped: false,
        pair_field: false,
        deferred_top: None,
    };
    let mut stats = SliceStats::default();

    loop {
        let top = curr % 2 == 0;
        let mut mb_field = if mbaff && !top {
            scratch.pair_field
        } else {
            false
        };
        if mbaff && top {
            let env = MbEnv::new(&*store, header, config, slice_num, curr);
            mb_field = env.derive(&NeighborInfo::empty(slice_num)).inferred_field_flag();
        }

        let skip = if header.slice_type.is_intra() {
            false
        } else {
            let env = MbEnv::new(&*store, header, config, slice_num, curr).with_mb_field(mb_field);
            decode_mb_skip_flag(decoder, &env)?
        };

        if skip {
            let field = header.field_pic || mb_field;
            let (info, summary) = skipped_macroblock(header, &scratch, curr, field);
            store.put(curr, summary);
            scratch.prev_qp_delta_nonzero = false;
            if mbaff && top {
                scratch.deferred_top = Some(info);
            } else {
                emit(&mut scratch, &mut stats, sink, info);
            }
        } else {
            if mbaff && (top || scratch.prev_mb_skipped) {
                mb_field = decode_mb_field_decoding_flag(decoder, &*store, header, config, &scratch, curr)?;
                if !top {
                    update_deferred_top(&mut scratch, store, curr - 1, mb_field);
                }
            }
            let mut current = NeighborInfo::empty(slice_num);
            let info = {
                let env = MbEnv::new(&*store, header, config, slice_num, curr)
                    .with_mb_field(mb_field)
                    .with_prev_qp_delta_nonzero(scratch.prev_qp_delta_nonzero);
                current.flags.set(MbFlags::FIELD, env.field);
                macroblock_layer(decoder, &env, &mut current, scratch.qp_y)?
            };
            store.put(curr, current);
            scratch.qp_y = info.qp_y;
            scratch.prev_qp_delta_nonzero = info.mb_qp_delta != 0;
            emit(&mut scratch, &mut stats, sink, info);
        }

        if mbaff && top {
            scratch.pair_field = mb_field;
        }
        scratch.prev_mb_skipped = skip;

        let more = if mbaff && top {
            true
        } else {
            decoder.decode_terminate()? == 0
        };
        if !more {
            break;
        }
        curr = map.next_mb_addr(curr);
        if curr >= pic_size {
            return Err(AvcError::StructuralViolation(format!(
                "H.264: end_of_slice_flag 缺失, 宏块地址越过图像末尾, mb_addr={}",
                curr
            )));
        }
    }
    Ok(stats)
}

fn decode_mb_skip_flag<D, N>(decoder: &mut D, env: &MbEnv<'_, N>) -> AvcResult<bool>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let mut current = NeighborInfo::empty(env.slice_num);
    current.flags.set(MbFlags::FIELD, env.field);
    let ctx = env
        .derive(&current)
        .element_ladder(SyntaxElement::MbSkipFlag, None, CtxTarget::Macroblock)?
        .at(0);
    Ok(decoder.decode_decision(ctx)? == 1)
}

fn decode_mb_field_decoding_flag<D, N>(
    decoder: &mut D,
    store: &N,
    header: &SliceHeader,
    config: &ParserConfig,
    scratch: &SliceScratch,
    curr: u32,
) -> AvcResult<bool>
where
    D: BinDecoder + ?Sized,
    N: NeighborStore + ?Sized,
{
    let env = MbEnv::new(store, header, config, scratch.slice_num, curr);
    let current = NeighborInfo::empty(scratch.slice_num);
    match env.derive(&current).mb_field_ctx() {
        Derived::Inc(inc) => {
            let ctx = usize::from(CTX_MB_FIELD_DECODING_FLAG) + inc as usize;
            Ok(decoder.decode_decision(ctx)? == 1)
        }
        Derived::Inferred(field) => Ok(field),
    }
}

/// 底宏块读到 mb_field_decoding_flag 后, 跳过的顶宏块沿用该值
fn update_deferred_top<N: NeighborStore + ?Sized>(
    scratch: &mut SliceScratch,
    store: &mut N,
    top_addr: u32,
    mb_field: bool,
) {
    if let Some(top) = scratch.deferred_top.as_mut() {
        top.field = mb_field;
    }
    if let Some(mut summary) = store.get(top_addr).copied() {
        summary.flags.set(MbFlags::FIELD, mb_field);
        store.put(top_addr, summary);
    }
}

/// P_Skip / B_Skip 的推断语法与邻居摘要
fn skipped_macroblock(
    header: &SliceHeader,
    scratch: &SliceScratch,
    mb_addr: u32,
    field: bool,
) -> (MacroblockInfo, NeighborInfo) {
    let b_slice = header.slice_type.is_b();
    let mut info = MacroblockInfo::new(mb_addr, scratch.slice_num);
    info.skip = true;
    info.field = field;
    info.qp_y = scratch.qp_y;
    info.mb_type = if b_slice { MbType::BSkip } else { MbType::PSkip };
    if !b_slice {
        info.ref_idx[0][0] = 0;
    }

    let mut summary = NeighborInfo::empty(scratch.slice_num);
    summary.mb_type = info.mb_type;
    summary.flags = MbFlags::SKIP;
    summary.flags.set(MbFlags::FIELD, field);
    summary.flags.set(MbFlags::DIRECT, b_slice);
    (info, summary)
}

fn emit<K: MacroblockSink + ?Sized>(
    scratch: &mut SliceScratch,
    stats: &mut SliceStats,
    sink: &mut K,
    info: MacroblockInfo,
) {
    for mb in scratch.deferred_top.take().into_iter().chain(Some(info)) {
        trace!(
            "H.264: 宏块 mb_addr={}, mb_type={:?}, cbp=0x{:02x}, qp={}",
            mb.mb_addr, mb.mb_type, mb.coded_block_pattern, mb.qp_y
        );
        stats.record(&mb);
        sink.on_macroblock(&mb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::RangeInclusive;

    use avcsyn_core::{BitReader, BitWriter};

    use crate::cabac::CabacEncoder;
    use crate::macroblock::ChromaResidual;
    use crate::mb_types::{PartPred, SubMbType};
    use crate::neighbor::{CBF_DC_BIT, PictureMbStore};
    use crate::slice_header::{SliceType, parse_slice_header};
    use crate::test_support::{
        ScriptedBins, StreamParams, build_cabac_slice, slice_nal, test_slice_header,
    };

    /// 用真实的 CABAC 解码器解析 `params` 下编码的 slice RBSP
    fn parse_encoded(
        params: StreamParams,
        slice_type: SliceType,
        rbsp: &[u8],
    ) -> (Vec<MacroblockInfo>, SliceStats) {
        let sets = params.parameter_sets().expect("参数集解析失败");
        let mut br = BitReader::new(rbsp);
        let header = parse_slice_header(&mut br, &slice_nal(slice_type), |_| Some(sets))
            .expect("slice header 解析失败");
        let mut store = PictureMbStore::new();
        let mut decoded = Vec::new();
        let stats = parse_slice_data(
            &mut br,
            &header,
            &ParserConfig::default(),
            &mut store,
            0,
            &mut |mb: &MacroblockInfo| decoded.push(mb.clone()),
        )
        .expect("CABAC 解析失败");
        (decoded, stats)
    }

    /// 用脚本 bin 跑一遍宏块循环, 再用编码器生成真实码流并完整解析, 两者输出必须一致
    fn scripted_and_encoded(
        slice_type: SliceType,
        width: u32,
        height: u32,
        script: &[u8],
        bypass: &[u8],
    ) -> (Vec<MacroblockInfo>, SliceStats) {
        let header = test_slice_header(slice_type, width, height);
        let config = ParserConfig::default();

        let mut bins = ScriptedBins::new(script).with_bypass(bypass);
        let mut store = PictureMbStore::new();
        let mut scripted = Vec::new();
        let stats = decode_slice_macroblocks(
            &mut bins,
            &header,
            &config,
            &mut store,
            0,
            &mut |mb: &MacroblockInfo| scripted.push(mb.clone()),
        )
        .expect("脚本解析失败");
        assert_eq!(bins.consumed(), script.len(), "脚本 bin 应恰好用完");

        let rbsp = build_cabac_slice(slice_type, 0, bins.events());
        let (decoded, real_stats) =
            parse_encoded(StreamParams::new(width, height), slice_type, &rbsp);
        assert_eq!(decoded, scripted, "真实码流与脚本的解析结果不一致");
        assert_eq!(real_stats, stats);
        (decoded, stats)
    }

    /// 按策略记录整帧 slice, 编码后重新解析, 两者输出必须一致
    fn recorded_and_encoded<F>(
        params: StreamParams,
        slice_type: SliceType,
        policy: F,
    ) -> (Vec<MacroblockInfo>, SliceStats)
    where
        F: FnMut(usize) -> u8,
    {
        let (events, recorded) = params.record_slice(slice_type, policy).expect("记录失败");
        let rbsp = params.encode_slice(slice_type, 0, &events).expect("重放 bin 失败");
        let (decoded, stats) = parse_encoded(params, slice_type, &rbsp);
        assert_eq!(decoded, recorded, "真实码流与记录的解析结果不一致");
        (decoded, stats)
    }

    /// ctxIdx 落在 `range` 内时依次给出 `bits` 的各位 (用完后从头循环), 其余交给 `rest`
    fn queued(
        range: RangeInclusive<usize>,
        bits: &str,
        mut rest: impl FnMut(usize) -> u8,
    ) -> impl FnMut(usize) -> u8 {
        let bits: Vec<u8> = bits.bytes().map(|b| b - b'0').collect();
        let mut pos = 0;
        move |ctx| {
            if range.contains(&ctx) {
                let bin = bits[pos % bits.len()];
                pos += 1;
                bin
            } else {
                rest(ctx)
            }
        }
    }

    #[test]
    fn test_p_skip_run_and_inter_mb() {
        // 2x2 P slice
        // mb0: skip, end=0; mb1: skip, end=0
        // mb2: 非 skip, P_L0_16x16, mvd (-1, 0), cbp=0, end=0
        // mb3: skip, end=1
        let script = [
            1, 0, //
            1, 0, //
            0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, //
            1, 1,
        ];
        let (mbs, stats) = scripted_and_encoded(SliceType::P, 2, 2, &script, &[1]);
        assert_eq!(mbs.len(), 4);
        assert_eq!(stats.skipped, 3);
        assert_eq!(mbs[0].mb_type, MbType::PSkip);
        assert_eq!(mbs[0].ref_idx[0][0], 0);
        assert_eq!(mbs[2].mb_type, MbType::PL016x16);
        assert_eq!(mbs[2].mvd[0][0][0], [-1, 0]);
        assert!(mbs.iter().all(|mb| mb.qp_y == 26));
        assert_eq!(
            mbs.iter().map(|mb| mb.mb_addr).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn test_i16x16_dc_end_to_end() {
        // 1x1 I slice: I_16x16_0_0_0, chroma 0, qp_delta +1, DC 系数 2
        let script = [1, 0, 0, 0, 0, 0, 0, 1, 0, 1, 1, 1, 1, 0, 1];
        let (mbs, stats) = scripted_and_encoded(SliceType::I, 1, 1, &script, &[0]);
        assert_eq!(mbs.len(), 1);
        let mb = &mbs[0];
        assert!(matches!(mb.mb_type, MbType::I16x16 { .. }));
        assert_eq!(mb.qp_y, 27);
        let res = mb.residual.as_deref().expect("应有残差");
        assert_eq!(res.planes[0].dc[0], 2);
        assert_eq!(stats.nonzero_coefficients, 1);
        assert_eq!(stats.intra, 1);
    }

    #[test]
    fn test_qp_delta_context_follows_previous_mb() {
        // 2x1 I slice, 两个 I_16x16 宏块, 第一个 mb_qp_delta 非零
        let mb = |qp_bins: &[u8]| {
            let mut v = vec![1u8, 0, 0, 0, 0, 0, 0];
            v.extend_from_slice(qp_bins);
            v.push(0); // Luma DC cbf = 0
            v
        };
        let mut script = mb(&[1, 0]);
        script.push(0);
        script.extend(mb(&[0]));
        script.push(1);
        let header = test_slice_header(SliceType::I, 2, 1);
        let config = ParserConfig::default();
        let mut bins = ScriptedBins::new(&script);
        let mut store = PictureMbStore::new();
        let mut qps = Vec::new();
        decode_slice_macroblocks(
            &mut bins,
            &header,
            &config,
            &mut store,
            0,
            &mut |mb: &MacroblockInfo| qps.push(mb.qp_y),
        )
        .expect("解析失败");
        assert_eq!(qps, vec![27, 27]);
        // 第二个宏块的 mb_qp_delta bin0: 前一宏块非零 → ctxIdxInc 1
        let ctxs = bins.contexts();
        let second_qp = ctxs.iter().rposition(|&c| (60..64).contains(&c)).expect("qp ctx");
        assert_eq!(ctxs[second_qp], 61);
    }

    #[test]
    fn test_i_pcm_end_to_end() {
        let params = StreamParams::default();
        let mut bw = BitWriter::new();
        params.write_slice_header(&mut bw, SliceType::I, 0);
        let contexts = ContextStore::new_for_slice(None, 26).expect("上下文初始化失败");
        let mut enc = CabacEncoder::with_writer(bw, contexts);
        enc.encode_decision(3, 1).expect("mb_type bin0");
        enc.encode_terminate(1);
        let w = enc.writer_mut();
        while !w.is_byte_aligned() {
            w.write_bit(0);
        }
        for i in 0..256u32 {
            w.write_bits(i & 0xFF, 8);
        }
        for i in 0..128u32 {
            w.write_bits(255 - i, 8);
        }
        enc.restart();
        enc.encode_terminate(1);
        let rbsp = enc.finish();

        let mut br = BitReader::new(&rbsp);
        let sets = params.parameter_sets().expect("参数集解析失败");
        let header = parse_slice_header(&mut br, &slice_nal(SliceType::I), |_| Some(sets))
            .expect("slice header 解析失败");
        let config = ParserConfig::default();
        let mut store = PictureMbStore::new();
        let mut mbs = Vec::new();
        let stats = parse_slice_data(
            &mut br,
            &header,
            &config,
            &mut store,
            0,
            &mut |mb: &MacroblockInfo| mbs.push(mb.clone()),
        )
        .expect("I_PCM slice 解析失败");
        assert_eq!(stats.pcm, 1);
        let pcm = mbs[0].pcm.as_ref().expect("应有 PCM 样本");
        assert_eq!(pcm.luma.len(), 256);
        assert_eq!(pcm.chroma.len(), 128);
        assert_eq!(pcm.luma[17], 17);
        assert_eq!(pcm.chroma[0], 255);
        assert_eq!(pcm.chroma[127], 128);
        assert_eq!(mbs[0].coded_block_pattern, 0x2F);
        assert!(store.get(0).is_some_and(NeighborInfo::is_pcm));
    }

    #[test]
    fn test_pcm_alignment_bit_must_be_zero() {
        let params = StreamParams::default();
        let mut bw = BitWriter::new();
        params.write_slice_header(&mut bw, SliceType::I, 0);
        let contexts = ContextStore::new_for_slice(None, 26).expect("上下文初始化失败");
        let mut enc = CabacEncoder::with_writer(bw, contexts);
        enc.encode_decision(3, 1).expect("mb_type bin0");
        enc.encode_terminate(1);
        let w = enc.writer_mut();
        let mut pad = 0;
        while !w.is_byte_aligned() {
            w.write_bit(1);
            pad += 1;
        }
        w.write_bits(0, 32);
        let rbsp = enc.finish();
        assert!(pad > 0, "刷新后应存在对齐位");
        let mut br = BitReader::new(&rbsp);
        let sets = params.parameter_sets().expect("参数集解析失败");
        let header = parse_slice_header(&mut br, &slice_nal(SliceType::I), |_| Some(sets))
            .expect("slice header 解析失败");
        let mut store = PictureMbStore::new();
        let err = parse_slice_data(
            &mut br,
            &header,
            &ParserConfig::default(),
            &mut store,
            0,
            &mut |_: &MacroblockInfo| {},
        )
        .expect_err("对齐位为 1 应失败");
        assert!(
            matches!(err, AvcError::StructuralViolation(_)),
            "错误类型不符, actual={:?}",
            err
        );
    }

    #[test]
    fn test_missing_end_of_slice_is_structural() {
        // 1x1 P slice: skip, end_of_slice=0 后已无宏块
        let header = test_slice_header(SliceType::P, 1, 1);
        let mut bins = ScriptedBins::new(&[1, 0]);
        let mut store = PictureMbStore::new();
        let err = decode_slice_macroblocks(
            &mut bins,
            &header,
            &ParserConfig::default(),
            &mut store,
            0,
            &mut |_: &MacroblockInfo| {},
        )
        .expect_err("越过图像末尾应失败");
        let msg = format!("{}", err);
        assert!(msg.contains("end_of_slice_flag"), "错误信息不符, actual={}", msg);
    }

    #[test]
    fn test_exhausted_stream_aborts_slice() {
        let header = test_slice_header(SliceType::P, 2, 2);
        let mut bins = ScriptedBins::new(&[1, 0, 1]);
        let mut store = PictureMbStore::new();
        let mut count = 0;
        let err = decode_slice_macroblocks(
            &mut bins,
            &header,
            &ParserConfig::default(),
            &mut store,
            0,
            &mut |_: &MacroblockInfo| count += 1,
        )
        .expect_err("bin 耗尽应失败");
        assert!(matches!(err, AvcError::StreamExhaustion(_)));
        assert_eq!(count, 2, "耗尽前已完成的宏块照常输出");
    }

    #[test]
    fn test_cavlc_slice_data_unsupported() {
        let header = StreamParams::default()
            .with_cabac(false)
            .slice_header(SliceType::I, 0)
            .expect("slice header 解析失败");
        let mut br = BitReader::new(&[0xA5]);
        let mut store = PictureMbStore::new();
        let err = parse_slice_data(
            &mut br,
            &header,
            &ParserConfig::default(),
            &mut store,
            0,
            &mut |_: &MacroblockInfo| {},
        )
        .expect_err("CAVLC 应不支持");
        assert!(matches!(err, AvcError::UnsupportedFeature(_)));
    }

    // ============================================================
    // MBAFF、B slice、4:4:4 与多参考帧
    // ============================================================

    /// ref_idx bin0 (ctxIdx 54..=57) 取 1, 其后取 0: ref_idx = 1
    fn ref_idx_one(ctx: usize) -> u8 {
        u8::from((54..=57).contains(&ctx))
    }

    #[test]
    fn test_mbaff_field_flag_inference_and_deferred_top() {
        // 3x2 MBAFF P 帧, 三个宏块对
        // 对 0: 两个宏块均非 skip, 顶宏块解码 mb_field_decoding_flag = 1
        // 对 1: 全部 skip, 场标志从左侧对推断
        // 对 2: 顶 skip 底非 skip, 底宏块解码 mb_field_decoding_flag = 0 并回写顶宏块
        let params = StreamParams::new(3, 2).with_mbaff(true);
        let policy = queued(11..=13, "001110", queued(70..=72, "10", ref_idx_one));
        let (mbs, stats) = recorded_and_encoded(params, SliceType::P, policy);

        assert_eq!(mbs.iter().map(|mb| mb.mb_addr).collect::<Vec<_>>(), [0, 1, 2, 3, 4, 5]);
        assert_eq!(
            mbs.iter().map(|mb| mb.skip).collect::<Vec<_>>(),
            [false, false, true, true, true, false]
        );
        assert_eq!(
            mbs.iter().map(|mb| mb.field).collect::<Vec<_>>(),
            [true, true, true, true, false, false]
        );
        assert_eq!(stats.skipped, 3);
        // 单参考帧下场宏块仍出现 ref_idx, 上限加倍
        assert_eq!(mbs[0].ref_idx[0][0], 1);
        assert_eq!(mbs[1].ref_idx[0][0], 1);
        // 帧宏块的 ref_idx 不出现, 推断为 0
        assert_eq!(mbs[5].mb_type, MbType::PL016x16);
        assert_eq!(mbs[5].ref_idx[0][0], 0);
    }

    /// ref_idx bin0 (ctxIdx 54..=57) 与 bin1 (58) 取 1, bin2 (59) 取 0: ref_idx = 2
    fn ref_idx_two(ctx: usize) -> u8 {
        u8::from((54..=58).contains(&ctx))
    }

    #[test]
    fn test_mbaff_ref_idx_limit_follows_field_flag() {
        // 1x2 MBAFF P 帧, 两个参考帧: 场宏块的 ref_idx 上限为 4, 帧宏块为 2
        let params = StreamParams::new(1, 2).with_mbaff(true).with_ref_idx_active(2);
        let policy = queued(70..=72, "1", ref_idx_two);
        let (mbs, _) = recorded_and_encoded(params, SliceType::P, policy);
        assert!(mbs.iter().all(|mb| mb.field));
        assert!(mbs.iter().all(|mb| mb.ref_idx[0][0] == 2));

        let err = params
            .record_slice(SliceType::P, queued(70..=72, "0", ref_idx_two))
            .expect_err("帧宏块的 ref_idx 越界应失败");
        let msg = format!("{}", err);
        assert!(msg.contains("ref_idx_l0"), "错误信息不符, actual={}", msg);
        assert!(msg.contains("limit=2"), "错误信息不符, actual={}", msg);
    }

    #[test]
    fn test_ref_idx_with_multiple_active_refs() {
        let params = StreamParams::new(2, 1).with_ref_idx_active(3);
        let (mbs, _) = recorded_and_encoded(params, SliceType::P, ref_idx_two);
        assert!(mbs.iter().all(|mb| mb.mb_type == MbType::PL016x16));
        assert!(mbs.iter().all(|mb| mb.ref_idx[0][0] == 2));

        let err = params
            .with_ref_idx_active(2)
            .record_slice(SliceType::P, ref_idx_two)
            .expect_err("ref_idx 越界应失败");
        assert!(matches!(err, AvcError::InvalidData(_)));
    }

    #[test]
    fn test_b_slice_direct_bi_and_sub_types() {
        // 2x2 B slice, 两个参考帧
        // mb_type 前缀 (27..=32): B_Direct_16x16, B_L1_16x16, B_Bi_16x16, B_8x8
        // sub_mb_type (36..=39): B_Direct_8x8, B_L0_8x8, B_Bi_8x8, B_L1_4x4
        // ref_idx 均为 1, mvd 均为 (+1, 0), cbp = 0
        let params = StreamParams::new(2, 2).with_ref_idx_active(2);
        let rest = |ctx: usize| u8::from(matches!(ctx, 54..=57 | 40..=42));
        let subs = queued(36..=39, "01001100011110", rest);
        let policy = queued(27..=32, "0101110000111111", subs);
        let (mbs, stats) = recorded_and_encoded(params, SliceType::B, policy);

        assert_eq!(mbs.len(), 4);
        assert_eq!(stats.skipped, 0);
        assert_eq!(mbs[0].mb_type, MbType::BDirect16x16);

        assert_eq!(mbs[1].mb_type, MbType::B16x16(PartPred::L1));
        assert_eq!(mbs[1].ref_idx[0][0], -1);
        assert_eq!(mbs[1].ref_idx[1][0], 1);
        assert_eq!(mbs[1].mvd[1][0][0], [1, 0]);

        assert_eq!(mbs[2].mb_type, MbType::B16x16(PartPred::Bi));
        assert_eq!(mbs[2].ref_idx[0][0], 1);
        assert_eq!(mbs[2].ref_idx[1][0], 1);
        assert_eq!(mbs[2].mvd[0][0][0], [1, 0]);
        assert_eq!(mbs[2].mvd[1][0][0], [1, 0]);

        let b8x8 = &mbs[3];
        assert_eq!(b8x8.mb_type, MbType::B8x8);
        let expected = [0, 1, 3, 11].map(|raw| SubMbType::from_b(raw).expect("sub_mb_type"));
        assert_eq!(b8x8.sub_mb_types, expected);
        assert!(b8x8.sub_mb_types[0].is_direct());
        // 直接预测子宏块不带 ref_idx
        assert_eq!(b8x8.ref_idx[0], [-1, 1, 1, -1]);
        assert_eq!(b8x8.ref_idx[1], [-1, -1, 1, 1]);
        assert_eq!(b8x8.mvd[1][3], [[1, 0]; 4]);
        assert_eq!(b8x8.mvd[0][3], [[0, 0]; 4]);
    }

    #[test]
    fn test_yuv444_cb_cr_residual_categories() {
        // 1x1 4:4:4 I slice: I_16x16_0_0_1, 亮度无系数
        // Cb/Cr 的 DC (类别 6/10) 与 16 个 AC 块 (类别 7/11) 各有一个系数 1
        let params = StreamParams::new(1, 1).with_chroma_format_idc(3);
        // mb_type bin0 (3) 与亮度 cbp bin (6) 取 1; Cb/Cr 的 cbf、significant、last 取 1
        let policy = |ctx: usize| u8::from(matches!(ctx, 3 | 6 | 460..=659));
        let (mbs, stats) = recorded_and_encoded(params, SliceType::I, policy);

        let mb = &mbs[0];
        assert_eq!(
            mb.mb_type,
            MbType::I16x16 {
                pred_mode: 0,
                cbp_chroma: 0,
                cbp_luma: 15
            }
        );
        assert_eq!(mb.coded_block_flags[0], 0);
        for plane in 1..3 {
            assert_eq!(mb.coded_block_flags[plane], (1 << CBF_DC_BIT) | 0xFFFF);
        }
        let res = mb.residual.as_deref().expect("应有残差");
        assert!(res.planes[0].dc.iter().all(|&v| v == 0));
        for plane in &res.planes[1..] {
            assert_eq!(plane.dc[0], 1);
            assert!(plane.ac.iter().all(|ac| ac[0] == 1));
        }
        assert_eq!(res.chroma, ChromaResidual::default());
        assert_eq!(stats.nonzero_coefficients, 34);
    }
}
