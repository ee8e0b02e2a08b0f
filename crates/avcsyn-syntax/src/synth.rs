//! 合成码流构造.
//!
//! 以 [`CabacEncoder`] 重放 bin 序列, 生成可被解析器完整解码的 CABAC slice.
//! 用于测试与基准. 参数集由 [`StreamParams`] 描述, 覆盖单 slice group、
//! 8 bit 的帧图像, 可选 MBAFF、4:4:4 等色度格式与多参考帧.

use std::sync::Arc;

use avcsyn_core::{AvcError, AvcResult, BitReader, BitWriter};

use crate::cabac::{BinDecoder, CabacEncoder, ContextStore};
use crate::config::ParserConfig;
use crate::macroblock::{MacroblockInfo, PcmSamples};
use crate::mb_layer::PcmReader;
use crate::nal::{NalUnit, add_emulation_prevention};
use crate::neighbor::PictureMbStore;
use crate::pps::{Pps, parse_pps};
use crate::slice_data::decode_slice_macroblocks;
use crate::slice_header::{SliceHeader, SliceType, parse_slice_header};
use crate::sps::{Sps, parse_sps};

/// 一次 bin 解码的记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinEvent {
    Decision(usize, u8),
    Bypass(u8),
    Terminate(u8),
}

// ============================================================
// 参数集
// ============================================================

/// 合成码流的 SPS/PPS 配置
///
/// 所有 slice 都是覆盖整帧的帧图像 (field_pic_flag = 0), I slice 按 IDR 写出.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub width_mbs: u32,
    /// 帧高 (宏块), MBAFF 时须为偶数
    pub height_mbs: u32,
    pub chroma_format_idc: u32,
    /// frame_mbs_only_flag = 0 且 mb_adaptive_frame_field_flag = 1
    pub mbaff: bool,
    /// 两个列表的 num_ref_idx_default_active, 同时作为 max_num_ref_frames
    pub num_ref_idx_active: u32,
    pub cabac: bool,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl StreamParams {
    /// 4:2:0、单参考帧、仅帧编码的 CABAC 码流
    pub fn new(width_mbs: u32, height_mbs: u32) -> Self {
        Self {
            width_mbs,
            height_mbs,
            chroma_format_idc: 1,
            mbaff: false,
            num_ref_idx_active: 1,
            cabac: true,
        }
    }

    pub fn with_chroma_format_idc(mut self, chroma_format_idc: u32) -> Self {
        self.chroma_format_idc = chroma_format_idc;
        self
    }

    pub fn with_mbaff(mut self, mbaff: bool) -> Self {
        self.mbaff = mbaff;
        self
    }

    pub fn with_ref_idx_active(mut self, num_ref_idx_active: u32) -> Self {
        self.num_ref_idx_active = num_ref_idx_active;
        self
    }

    pub fn with_cabac(mut self, cabac: bool) -> Self {
        self.cabac = cabac;
        self
    }

    /// SPS RBSP: 4:2:0 用 Main profile, 其余色度格式用 High 4:4:4 Predictive
    pub fn sps_rbsp(&self) -> Vec<u8> {
        let high = self.chroma_format_idc != 1;
        let mut bw = BitWriter::new();
        bw.write_bits(if high { 244 } else { 77 }, 8); // profile_idc
        bw.write_bits(0, 8); // constraint flags + reserved
        bw.write_bits(30, 8); // level_idc
        bw.write_ue(0); // seq_parameter_set_id
        if high {
            bw.write_ue(self.chroma_format_idc);
            if self.chroma_format_idc == 3 {
                bw.write_flag(false); // separate_colour_plane_flag
            }
            bw.write_ue(0); // bit_depth_luma_minus8
            bw.write_ue(0); // bit_depth_chroma_minus8
            bw.write_flag(false); // qpprime_y_zero_transform_bypass_flag
            bw.write_flag(false); // seq_scaling_matrix_present_flag
        }
        bw.write_ue(0); // log2_max_frame_num_minus4
        bw.write_ue(2); // pic_order_cnt_type
        bw.write_ue(self.num_ref_idx_active); // max_num_ref_frames
        bw.write_flag(false); // gaps_in_frame_num_value_allowed_flag
        bw.write_ue(self.width_mbs.saturating_sub(1));
        let map_units = if self.mbaff { self.height_mbs / 2 } else { self.height_mbs };
        bw.write_ue(map_units.saturating_sub(1));
        bw.write_flag(!self.mbaff); // frame_mbs_only_flag
        if self.mbaff {
            bw.write_flag(true); // mb_adaptive_frame_field_flag
        }
        bw.write_flag(true); // direct_8x8_inference_flag
        bw.write_flag(false); // frame_cropping_flag
        bw.write_flag(false); // vui_parameters_present_flag
        bw.write_trailing_bits();
        bw.finish()
    }

    /// 单 slice group 的 PPS RBSP
    pub fn pps_rbsp(&self) -> Vec<u8> {
        let refs = self.num_ref_idx_active.saturating_sub(1);
        let mut bw = BitWriter::new();
        bw.write_ue(0); // pic_parameter_set_id
        bw.write_ue(0); // seq_parameter_set_id
        bw.write_flag(self.cabac); // entropy_coding_mode_flag
        bw.write_flag(false); // bottom_field_pic_order_in_frame_present_flag
        bw.write_ue(0); // num_slice_groups_minus1
        bw.write_ue(refs); // num_ref_idx_l0_default_active_minus1
        bw.write_ue(refs); // num_ref_idx_l1_default_active_minus1
        bw.write_flag(false); // weighted_pred_flag
        bw.write_bits(0, 2); // weighted_bipred_idc
        bw.write_se(0); // pic_init_qp_minus26
        bw.write_se(0); // pic_init_qs_minus26
        bw.write_se(0); // chroma_qp_index_offset
        bw.write_flag(true); // deblocking_filter_control_present_flag
        bw.write_flag(false); // constrained_intra_pred_flag
        bw.write_flag(false); // redundant_pic_cnt_present_flag
        bw.write_trailing_bits();
        bw.finish()
    }

    /// 解析后的 SPS 与 PPS
    pub fn parameter_sets(&self) -> AvcResult<(Arc<Sps>, Arc<Pps>)> {
        let sps = parse_sps(&self.sps_rbsp())?;
        let pps = parse_pps(&self.pps_rbsp(), |_| Some(sps.chroma_format_idc))?;
        Ok((Arc::new(sps), Arc::new(pps)))
    }

    /// SPS 与 PPS 的 Annex B 封装
    pub fn annex_b_parameter_sets(&self) -> Vec<u8> {
        let mut out = annex_b_nal(3, 7, &self.sps_rbsp());
        out.extend(annex_b_nal(3, 8, &self.pps_rbsp()));
        out
    }

    // ============================================================
    // slice
    // ============================================================

    /// 写出 first_mb_in_slice = 0 的 slice header (nal_ref_idc 非 0),
    /// 以 cabac_alignment_one_bit 结束
    pub fn write_slice_header(&self, bw: &mut BitWriter, slice_type: SliceType, qp_delta: i32) {
        let idr = slice_type == SliceType::I;
        let raw = match slice_type {
            SliceType::P => 0,
            SliceType::B => 1,
            SliceType::I => 2,
            SliceType::Sp => 3,
            SliceType::Si => 4,
        };
        bw.write_ue(0); // first_mb_in_slice
        bw.write_ue(raw);
        bw.write_ue(0); // pic_parameter_set_id
        bw.write_bits(0, 4); // frame_num
        if self.mbaff {
            bw.write_flag(false); // field_pic_flag
        }
        if idr {
            bw.write_ue(0); // idr_pic_id
        }
        if slice_type.is_b() {
            bw.write_flag(true); // direct_spatial_mv_pred_flag
        }
        if !slice_type.is_intra() {
            bw.write_flag(false); // num_ref_idx_active_override_flag
            bw.write_flag(false); // ref_pic_list_modification_flag_l0
            if slice_type.is_b() {
                bw.write_flag(false); // ref_pic_list_modification_flag_l1
            }
        }
        if idr {
            bw.write_flag(false); // no_output_of_prior_pics_flag
            bw.write_flag(false); // long_term_reference_flag
        } else {
            bw.write_flag(false); // adaptive_ref_pic_marking_mode_flag
        }
        if self.cabac && !slice_type.is_intra() {
            bw.write_ue(0); // cabac_init_idc
        }
        bw.write_se(qp_delta);
        bw.write_ue(1); // disable_deblocking_filter_idc
        if self.cabac {
            while !bw.is_byte_aligned() {
                bw.write_bit(1);
            }
        }
    }

    /// 解析 [`Self::write_slice_header`] 写出的 slice header
    pub fn slice_header(&self, slice_type: SliceType, qp_delta: i32) -> AvcResult<SliceHeader> {
        let mut bw = BitWriter::new();
        self.write_slice_header(&mut bw, slice_type, qp_delta);
        let data = bw.finish();
        let params = self.parameter_sets()?;
        let mut br = BitReader::new(&data);
        parse_slice_header(&mut br, &slice_nal_unit(slice_type)?, |_| Some(params))
    }

    /// 生成完整的 CABAC slice RBSP: slice header + 记录的 bin
    ///
    /// 记录须以 end_of_slice_flag = 1 结束.
    pub fn encode_slice(
        &self,
        slice_type: SliceType,
        qp_delta: i32,
        events: &[BinEvent],
    ) -> AvcResult<Vec<u8>> {
        let mut bw = BitWriter::new();
        self.write_slice_header(&mut bw, slice_type, qp_delta);
        let init_idc = if slice_type.is_intra() { None } else { Some(0) };
        let contexts = ContextStore::new_for_slice(init_idc, 26 + qp_delta)?;
        let mut enc = CabacEncoder::with_writer(bw, contexts);
        encode_events(&mut enc, events)?;
        Ok(enc.finish())
    }

    /// 按策略解码一个覆盖整帧的 slice, 返回记录的 bin 与解码出的宏块
    pub fn record_slice<F>(
        &self,
        slice_type: SliceType,
        policy: F,
    ) -> AvcResult<(Vec<BinEvent>, Vec<MacroblockInfo>)>
    where
        F: FnMut(usize) -> u8,
    {
        let header = self.slice_header(slice_type, 0)?;
        // MBAFF 下 end_of_slice_flag 只在每个宏块对之后出现
        let ends = header.pic_size_in_mbs() / if header.mbaff() { 2 } else { 1 };
        let mut bins = RecordingBins::new(ends, policy);
        let mut store = PictureMbStore::new();
        let mut mbs = Vec::new();
        decode_slice_macroblocks(
            &mut bins,
            &header,
            &ParserConfig::default(),
            &mut store,
            0,
            &mut |mb: &MacroblockInfo| mbs.push(mb.clone()),
        )?;
        Ok((bins.into_events(), mbs))
    }

    /// 生成一段 Annex B 码流: SPS + PPS + 每个 `slice_types` 元素一个覆盖整帧的 slice
    pub fn synth_annex_b<F>(&self, slice_types: &[SliceType], mut policy: F) -> AvcResult<Vec<u8>>
    where
        F: FnMut(usize) -> u8,
    {
        let mut out = self.annex_b_parameter_sets();
        for &slice_type in slice_types {
            let (events, _) = self.record_slice(slice_type, &mut policy)?;
            let rbsp = self.encode_slice(slice_type, 0, &events)?;
            out.extend(annex_b_nal(3, slice_nal_type(slice_type), &rbsp));
        }
        Ok(out)
    }
}

/// 带 4 字节起始码与 NAL 头封装 RBSP, 并插入防竞争字节
pub fn annex_b_nal(nal_ref_idc: u8, nal_type: u8, rbsp: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00, 0x01, (nal_ref_idc << 5) | nal_type];
    out.extend_from_slice(&add_emulation_prevention(rbsp));
    out
}

/// 用算术编码器重放记录的 bin
pub fn encode_events(enc: &mut CabacEncoder, events: &[BinEvent]) -> AvcResult<()> {
    for event in events {
        match *event {
            BinEvent::Decision(ctx_idx, bin) => enc.encode_decision(ctx_idx, bin)?,
            BinEvent::Bypass(bin) => enc.encode_bypass(bin),
            BinEvent::Terminate(bin) => enc.encode_terminate(bin),
        }
    }
    Ok(())
}

/// 默认参数下的 CABAC slice RBSP, 见 [`StreamParams::encode_slice`]
pub fn encode_slice_rbsp(
    slice_type: SliceType,
    qp_delta: i32,
    events: &[BinEvent],
) -> AvcResult<Vec<u8>> {
    StreamParams::default().encode_slice(slice_type, qp_delta, events)
}

/// 合成 slice 的 nal_unit_type: I slice 为 IDR
pub fn slice_nal_type(slice_type: SliceType) -> u8 {
    if slice_type == SliceType::I { 5 } else { 1 }
}

/// 合成 slice 的 NAL 单元头 (nal_ref_idc = 1)
pub fn slice_nal_unit(slice_type: SliceType) -> AvcResult<NalUnit> {
    NalUnit::parse(&[(1 << 5) | slice_nal_type(slice_type), 0x80])
}

/// [`StreamParams::synth_annex_b`] 的默认参数形式
///
/// 全 0 策略在 I slice 中得到 I_NxN, 在 P slice 中得到零 mvd 的 P_L0_16x16,
/// 两者均无残差.
pub fn synth_annex_b<F>(
    width_mbs: u32,
    height_mbs: u32,
    slice_types: &[SliceType],
    policy: F,
) -> AvcResult<Vec<u8>>
where
    F: FnMut(usize) -> u8,
{
    StreamParams::new(width_mbs, height_mbs).synth_annex_b(slice_types, policy)
}

// ============================================================
// 按策略回答的 bin 源
// ============================================================

/// 按策略回答 bin 请求并记录的解码器
///
/// decision 由 `policy(ctxIdx)` 决定, bypass 恒为 0. 紧跟在取 1 的帧内
/// mb_type 首个 bin 之后的 terminate 是 I_PCM 判定, 恒答 0. 其余 terminate 为
/// end_of_slice_flag, 第 `slice_ends` 次时返回 1.
pub struct RecordingBins<F> {
    policy: F,
    remaining_ends: u32,
    events: Vec<BinEvent>,
}

impl<F: FnMut(usize) -> u8> RecordingBins<F> {
    pub fn new(slice_ends: u32, policy: F) -> Self {
        Self {
            policy,
            remaining_ends: slice_ends,
            events: Vec::new(),
        }
    }

    pub fn into_events(self) -> Vec<BinEvent> {
        self.events
    }
}

impl<F: FnMut(usize) -> u8> BinDecoder for RecordingBins<F> {
    fn decode_decision(&mut self, ctx_idx: usize) -> AvcResult<u8> {
        let bin = (self.policy)(ctx_idx) & 1;
        self.events.push(BinEvent::Decision(ctx_idx, bin));
        Ok(bin)
    }

    fn decode_bypass(&mut self) -> AvcResult<u8> {
        self.events.push(BinEvent::Bypass(0));
        Ok(0)
    }

    fn decode_terminate(&mut self) -> AvcResult<u8> {
        // I slice 前缀 3..=5, P/SP 后缀 17, B 后缀 32
        let pcm_bin = matches!(
            self.events.last(),
            Some(BinEvent::Decision(3..=5 | 17 | 32, 1))
        );
        let bin = if pcm_bin {
            0
        } else {
            self.remaining_ends = self.remaining_ends.saturating_sub(1);
            u8::from(self.remaining_ends == 0)
        };
        self.events.push(BinEvent::Terminate(bin));
        Ok(bin)
    }
}

impl<F: FnMut(usize) -> u8> PcmReader for RecordingBins<F> {
    fn read_pcm(&mut self, _: u32, _: u32, _: usize) -> AvcResult<PcmSamples> {
        Err(AvcError::UnsupportedFeature(
            "H.264: 合成码流不支持 I_PCM".into(),
        ))
    }
}
