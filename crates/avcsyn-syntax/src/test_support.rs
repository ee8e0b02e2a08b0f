//! 单元测试共用的脚本化 bin 源与码流构造工具.

use avcsyn_core::{AvcError, AvcResult};

use crate::cabac::BinDecoder;
use crate::macroblock::PcmSamples;
use crate::mb_layer::PcmReader;
use crate::nal::NalUnit;
use crate::slice_header::{SliceHeader, SliceType};
use crate::synth::{encode_slice_rbsp, slice_nal_unit};

pub use crate::synth::{BinEvent, StreamParams, annex_b_nal};

/// 按预设序列返回 bin 的解码器
///
/// decision 与 terminate 共用一条脚本, bypass 单独一条脚本.
/// 每个返回的 bin 都按解码顺序记录, 可交给 [`build_cabac_slice`] 生成真实码流.
pub struct ScriptedBins {
    decisions: Vec<u8>,
    bypass: Vec<u8>,
    pos: usize,
    bypass_pos: usize,
    endless_ones: bool,
    contexts: Vec<usize>,
    events: Vec<BinEvent>,
}

impl ScriptedBins {
    pub fn new(decisions: &[u8]) -> Self {
        Self {
            decisions: decisions.to_vec(),
            bypass: Vec::new(),
            pos: 0,
            bypass_pos: 0,
            endless_ones: false,
            contexts: Vec::new(),
            events: Vec::new(),
        }
    }

    /// 永远返回 1 的 bin 源
    pub fn all_ones() -> Self {
        let mut bins = Self::new(&[]);
        bins.endless_ones = true;
        bins
    }

    pub fn with_bypass(mut self, bypass: &[u8]) -> Self {
        self.bypass = bypass.to_vec();
        self
    }

    /// 已消耗的 decision/terminate bin 数
    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn bypass_consumed(&self) -> usize {
        self.bypass_pos
    }

    /// 依次请求过的 ctxIdx
    pub fn contexts(&self) -> &[usize] {
        &self.contexts
    }

    /// 按解码顺序记录的全部 bin
    pub fn events(&self) -> &[BinEvent] {
        &self.events
    }

    fn next_decision(&mut self) -> AvcResult<u8> {
        if self.endless_ones {
            self.pos += 1;
            return Ok(1);
        }
        let bin = self
            .decisions
            .get(self.pos)
            .copied()
            .ok_or_else(|| AvcError::StreamExhaustion("脚本 bin 耗尽".into()))?;
        self.pos += 1;
        Ok(bin)
    }
}

impl BinDecoder for ScriptedBins {
    fn decode_decision(&mut self, ctx_idx: usize) -> AvcResult<u8> {
        self.contexts.push(ctx_idx);
        let bin = self.next_decision()?;
        self.events.push(BinEvent::Decision(ctx_idx, bin));
        Ok(bin)
    }

    fn decode_bypass(&mut self) -> AvcResult<u8> {
        if self.endless_ones {
            self.bypass_pos += 1;
            self.events.push(BinEvent::Bypass(1));
            return Ok(1);
        }
        let bin = self
            .bypass
            .get(self.bypass_pos)
            .copied()
            .ok_or_else(|| AvcError::StreamExhaustion("脚本 bypass bin 耗尽".into()))?;
        self.bypass_pos += 1;
        self.events.push(BinEvent::Bypass(bin));
        Ok(bin)
    }

    fn decode_terminate(&mut self) -> AvcResult<u8> {
        self.contexts.push(276);
        let bin = self.next_decision()?;
        self.events.push(BinEvent::Terminate(bin));
        Ok(bin)
    }
}

impl PcmReader for ScriptedBins {
    /// 样本全部为 0, 不消耗任何 bin
    fn read_pcm(
        &mut self,
        _bit_depth_luma: u32,
        _bit_depth_chroma: u32,
        chroma_samples: usize,
    ) -> AvcResult<PcmSamples> {
        Ok(PcmSamples {
            luma: vec![0; 256],
            chroma: vec![0; chroma_samples],
        })
    }
}

/// 解析出默认参数下的 CABAC slice header, 供宏块层单元测试使用
pub fn test_slice_header(slice_type: SliceType, width_mbs: u32, height_mbs: u32) -> SliceHeader {
    StreamParams::new(width_mbs, height_mbs)
        .slice_header(slice_type, 0)
        .expect("slice header 解析失败")
}

/// 生成默认参数下的 CABAC slice RBSP: slice header + 记录的 bin
pub fn build_cabac_slice(slice_type: SliceType, qp_delta: i32, events: &[BinEvent]) -> Vec<u8> {
    encode_slice_rbsp(slice_type, qp_delta, events).expect("重放 bin 失败")
}

/// 与 [`build_cabac_slice`] 配套的 NAL 单元头
pub fn slice_nal(slice_type: SliceType) -> NalUnit {
    slice_nal_unit(slice_type).expect("NAL 解析失败")
}
