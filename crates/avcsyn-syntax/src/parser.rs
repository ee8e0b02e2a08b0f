//! RBSP 语法解析器.
//!
//! 按 NAL 类型分派: SPS / 子集 SPS / PPS 存入参数集表, slice 依次解析 header 与
//! slice_data, 每个宏块交给 [`MacroblockSink`].

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use avcsyn_core::{AvcError, AvcResult, BitReader};

use crate::config::ParserConfig;
use crate::macroblock::MacroblockInfo;
use crate::nal::{NalHeaderExtension, NalUnit, NalUnitType, split_annex_b};
use crate::neighbor::{NeighborStore, PictureMbStore};
use crate::pps::{Pps, parse_pps};
use crate::slice_data::{SliceStats, parse_slice_data};
use crate::slice_header::{SliceHeader, parse_slice_header};
use crate::sps::{Sps, parse_sps, parse_subset_sps};

const MAX_SPS: usize = 32;
const MAX_PPS: usize = 256;

// ============================================================
// 输出接口
// ============================================================

/// 宏块输出接口
pub trait MacroblockSink {
    /// slice header 解析完成, slice_data 开始之前调用
    fn on_slice_start(&mut self, _header: &SliceHeader) {}

    /// 每个宏块解析完成后调用一次
    fn on_macroblock(&mut self, mb: &MacroblockInfo);
}

impl<F> MacroblockSink for F
where
    F: FnMut(&MacroblockInfo),
{
    fn on_macroblock(&mut self, mb: &MacroblockInfo) {
        self(mb)
    }
}

/// 单个 NAL 的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NalOutcome {
    Sps(u32),
    SubsetSps(u32),
    Pps(u32),
    Slice(SliceStats),
    /// 与语法解析无关的 NAL (SEI, AUD 等)
    Ignored(NalUnitType),
}

/// 码流统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub nal_units: u64,
    pub sps: u64,
    pub subset_sps: u64,
    pub pps: u64,
    pub slices: u64,
    /// 因错误跳过的 NAL
    pub skipped_nals: u64,
    pub ignored_nals: u64,
    pub macroblocks: SliceStats,
    /// 按 slice 类型统计
    pub slice_types: BTreeMap<String, u64>,
    /// 按错误分类统计
    pub errors_by_kind: BTreeMap<String, u64>,
}

// ============================================================
// 解析器
// ============================================================

/// 同步 RBSP 解析器
///
/// 持有参数集表与邻居存储, slice 之间只共享这两者.
pub struct RbspParser<N: NeighborStore = PictureMbStore> {
    config: ParserConfig,
    sps: Vec<Option<Arc<Sps>>>,
    subset_sps: Vec<Option<Arc<Sps>>>,
    pps: Vec<Option<Arc<Pps>>>,
    store: N,
    slice_num: u32,
    summary: StreamSummary,
}

impl RbspParser<PictureMbStore> {
    pub fn new(config: ParserConfig) -> Self {
        Self::with_store(config, PictureMbStore::new())
    }
}

impl Default for RbspParser<PictureMbStore> {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

impl<N: NeighborStore> RbspParser<N> {
    /// 使用调用方提供的邻居存储
    pub fn with_store(config: ParserConfig, store: N) -> Self {
        Self {
            config,
            sps: vec![None; MAX_SPS],
            subset_sps: vec![None; MAX_SPS],
            pps: vec![None; MAX_PPS],
            store,
            slice_num: 0,
            summary: StreamSummary::default(),
        }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn summary(&self) -> &StreamSummary {
        &self.summary
    }

    /// 结束解析, 取出统计
    pub fn into_summary(self) -> StreamSummary {
        self.summary
    }

    pub fn sps(&self, sps_id: u32) -> Option<&Arc<Sps>> {
        self.sps.get(sps_id as usize).and_then(Option::as_ref)
    }

    pub fn subset_sps(&self, sps_id: u32) -> Option<&Arc<Sps>> {
        self.subset_sps.get(sps_id as usize).and_then(Option::as_ref)
    }

    pub fn pps(&self, pps_id: u32) -> Option<&Arc<Pps>> {
        self.pps.get(pps_id as usize).and_then(Option::as_ref)
    }

    /// 解析一段 Annex B 字节流
    ///
    /// 错误按 `skip_corrupt_slices` 处理: 开启时记录并跳过可恢复错误.
    pub fn parse_annex_b<K>(&mut self, data: &[u8], sink: &mut K) -> AvcResult<()>
    where
        K: MacroblockSink + ?Sized,
    {
        for nal in split_annex_b(data) {
            self.process_nal(&nal, sink)?;
        }
        Ok(())
    }

    /// 处理一个不含起始码的 NAL 单元 (含头部字节), 错误处理同 [`Self::parse_annex_b`]
    pub fn push_nal<K>(&mut self, data: &[u8], sink: &mut K) -> AvcResult<()>
    where
        K: MacroblockSink + ?Sized,
    {
        match NalUnit::parse(data) {
            Ok(nal) => self.process_nal(&nal, sink),
            Err(err) => {
                self.summary.nal_units += 1;
                self.recover(None, err)
            }
        }
    }

    fn process_nal<K>(&mut self, nal: &NalUnit, sink: &mut K) -> AvcResult<()>
    where
        K: MacroblockSink + ?Sized,
    {
        match self.parse_nal(nal, sink) {
            Ok(_) => Ok(()),
            Err(err) => self.recover(Some(nal.nal_type), err),
        }
    }

    fn recover(&mut self, nal_type: Option<NalUnitType>, err: AvcError) -> AvcResult<()> {
        *self
            .summary
            .errors_by_kind
            .entry(err.kind().to_string())
            .or_default() += 1;
        if self.config.skip_corrupt_slices && err.is_recoverable() {
            warn!(
                "H.264: 跳过损坏的 NAL, nal_type={:?}, kind={}, err={}",
                nal_type,
                err.kind(),
                err
            );
            self.summary.skipped_nals += 1;
            return Ok(());
        }
        Err(err)
    }

    /// 解析一个 NAL 单元, 错误直接返回
    pub fn parse_nal<K>(&mut self, nal: &NalUnit, sink: &mut K) -> AvcResult<NalOutcome>
    where
        K: MacroblockSink + ?Sized,
    {
        self.summary.nal_units += 1;
        match nal.nal_type {
            NalUnitType::Sps => {
                let sps = parse_sps(&nal.rbsp())?;
                let id = sps.sps_id;
                debug!(
                    "H.264: SPS sps_id={}, profile={}, {}x{} MB, chroma_format_idc={}",
                    id,
                    sps.profile_idc,
                    sps.pic_width_in_mbs,
                    sps.frame_height_in_mbs(),
                    sps.chroma_format_idc
                );
                self.sps[id as usize] = Some(Arc::new(sps));
                self.summary.sps += 1;
                Ok(NalOutcome::Sps(id))
            }
            NalUnitType::SubsetSps => {
                let sps = parse_subset_sps(&nal.rbsp())?;
                let id = sps.sps_id;
                debug!("H.264: 子集 SPS sps_id={}, profile={}", id, sps.profile_idc);
                self.subset_sps[id as usize] = Some(Arc::new(sps));
                self.summary.subset_sps += 1;
                Ok(NalOutcome::SubsetSps(id))
            }
            NalUnitType::Pps => {
                let (sps, subset) = (&self.sps, &self.subset_sps);
                let pps = parse_pps(&nal.rbsp(), |sps_id| {
                    let idx = sps_id as usize;
                    sps.get(idx)
                        .and_then(Option::as_ref)
                        .or_else(|| subset.get(idx).and_then(Option::as_ref))
                        .map(|s| s.chroma_format_idc)
                })?;
                let id = pps.pps_id;
                debug!(
                    "H.264: PPS pps_id={}, sps_id={}, cabac={}, slice_groups={}",
                    id,
                    pps.sps_id,
                    pps.entropy_coding_mode,
                    pps.num_slice_groups()
                );
                self.pps[id as usize] = Some(Arc::new(pps));
                self.summary.pps += 1;
                Ok(NalOutcome::Pps(id))
            }
            NalUnitType::SliceDpa | NalUnitType::SliceDpb | NalUnitType::SliceDpc => {
                Err(AvcError::UnsupportedFeature(format!(
                    "H.264: 数据分区 slice 仅用于 CAVLC, nal_type={}",
                    nal.nal_type.type_id()
                )))
            }
            NalUnitType::SliceAux => Err(AvcError::UnsupportedFeature(
                "H.264: 辅助图像 slice 不支持".into(),
            )),
            NalUnitType::SliceExtension | NalUnitType::SliceExtensionDepth
                if !nal.is_mvc_slice() =>
            {
                let ext = match nal.extension {
                    Some(NalHeaderExtension::Svc(_)) => "SVC",
                    Some(NalHeaderExtension::Avc3d(_)) => "3D-AVC",
                    _ => "未知",
                };
                Err(AvcError::UnsupportedFeature(format!(
                    "H.264: {} 扩展 slice 不支持",
                    ext
                )))
            }
            t if t.is_slice() => self.parse_slice(nal, sink).map(NalOutcome::Slice),
            other => {
                self.summary.ignored_nals += 1;
                Ok(NalOutcome::Ignored(other))
            }
        }
    }

    fn parse_slice<K>(&mut self, nal: &NalUnit, sink: &mut K) -> AvcResult<SliceStats>
    where
        K: MacroblockSink + ?Sized,
    {
        let slice_num = self.slice_num;
        self.slice_num = self.slice_num.wrapping_add(1);

        let rbsp = nal.rbsp();
        let mut br = BitReader::new(&rbsp);
        let mvc = nal.is_mvc_slice();
        let (sps_table, subset_table, pps_table) = (&self.sps, &self.subset_sps, &self.pps);
        let header = parse_slice_header(&mut br, nal, |pps_id| {
            let pps = pps_table.get(pps_id as usize)?.clone()?;
            let idx = pps.sps_id as usize;
            let sps = if mvc {
                subset_table.get(idx)?.clone()?
            } else {
                sps_table.get(idx)?.clone()?
            };
            Some((sps, pps))
        })?;
        debug!(
            "H.264: slice #{} type={:?}, first_mb={}, qp={}, frame_num={}",
            slice_num,
            header.slice_type,
            header.first_mb_in_slice,
            header.slice_qp,
            header.frame_num
        );

        sink.on_slice_start(&header);
        let stats = parse_slice_data(
            &mut br,
            &header,
            &self.config,
            &mut self.store,
            slice_num,
            sink,
        )?;

        self.summary.slices += 1;
        self.summary.macroblocks.merge(&stats);
        *self
            .summary
            .slice_types
            .entry(format!("{:?}", header.slice_type))
            .or_default() += 1;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice_header::SliceType;
    use crate::test_support::{BinEvent, StreamParams, annex_b_nal, build_cabac_slice};

    /// 1x1 I slice: 单个 I_NxN 宏块, 全部预测模式取 prev 标志, cbp=0
    fn i_nxn_slice_events() -> Vec<BinEvent> {
        let mut events = vec![BinEvent::Decision(3, 0)];
        events.extend(std::iter::repeat_n(BinEvent::Decision(68, 1), 16));
        events.push(BinEvent::Decision(64, 0));
        // cbp 亮度 bin: 左/上 8x8 落在本宏块内且为 0 时 condTermFlag 为 1
        events.extend([73, 74, 75, 76].map(|ctx| BinEvent::Decision(ctx, 0)));
        events.push(BinEvent::Decision(77, 0));
        events.push(BinEvent::Terminate(1));
        events
    }

    /// 唯一的宏块之后 end_of_slice_flag 为 0, 末尾的 1 只用于冲刷编码器
    fn missing_end_events() -> Vec<BinEvent> {
        let mut events = i_nxn_slice_events();
        events.pop();
        events.push(BinEvent::Terminate(0));
        events.push(BinEvent::Terminate(1));
        events
    }

    fn stream_with_slice(slice_rbsp: &[u8]) -> Vec<u8> {
        let mut data = StreamParams::default().annex_b_parameter_sets();
        data.extend(annex_b_nal(3, 5, slice_rbsp));
        data
    }

    #[test]
    fn test_parse_annex_b_stream() {
        let slice = build_cabac_slice(SliceType::I, 0, &i_nxn_slice_events());
        let data = stream_with_slice(&slice);
        let mut parser = RbspParser::default();
        let mut mbs = Vec::new();
        parser
            .parse_annex_b(&data, &mut |mb: &MacroblockInfo| mbs.push(mb.clone()))
            .expect("解析失败");
        assert_eq!(mbs.len(), 1);
        assert_eq!(mbs[0].mb_type, crate::mb_types::MbType::INxN);
        let summary = parser.summary();
        assert_eq!((summary.sps, summary.pps, summary.slices), (1, 1, 1));
        assert_eq!(summary.macroblocks.macroblocks, 1);
        assert_eq!(summary.slice_types.get("I"), Some(&1));
        assert!(summary.errors_by_kind.is_empty());
    }

    #[test]
    fn test_slice_start_callback_precedes_macroblocks() {
        struct Recorder(Vec<String>);
        impl MacroblockSink for Recorder {
            fn on_slice_start(&mut self, header: &SliceHeader) {
                self.0.push(format!("slice:{:?}", header.slice_type));
            }
            fn on_macroblock(&mut self, mb: &MacroblockInfo) {
                self.0.push(format!("mb:{}", mb.mb_addr));
            }
        }
        let slice = build_cabac_slice(SliceType::I, 0, &i_nxn_slice_events());
        let mut parser = RbspParser::default();
        let mut rec = Recorder(Vec::new());
        parser
            .parse_annex_b(&stream_with_slice(&slice), &mut rec)
            .expect("解析失败");
        assert_eq!(rec.0, vec!["slice:I".to_string(), "mb:0".to_string()]);
    }

    #[test]
    fn test_missing_pps_is_invalid_data() {
        let slice = build_cabac_slice(SliceType::I, 0, &i_nxn_slice_events());
        let data = annex_b_nal(3, 5, &slice);
        let mut parser = RbspParser::default();
        let err = parser
            .parse_annex_b(&data, &mut |_: &MacroblockInfo| {})
            .expect_err("缺少 PPS 应失败");
        let msg = format!("{}", err);
        assert!(msg.contains("PPS"), "错误信息不符, actual={}", msg);
    }

    #[test]
    fn test_skip_corrupt_slices_counts_errors() {
        let bad = build_cabac_slice(SliceType::I, 0, &missing_end_events());
        let good = build_cabac_slice(SliceType::I, 0, &i_nxn_slice_events());
        let mut data = stream_with_slice(&bad);
        data.extend(annex_b_nal(3, 5, &good));

        let config = ParserConfig::default().with_skip_corrupt_slices(true);
        let mut parser = RbspParser::new(config);
        let mut count = 0;
        parser
            .parse_annex_b(&data, &mut |_: &MacroblockInfo| count += 1)
            .expect("开启跳过时不应返回错误");
        let summary = parser.into_summary();
        assert_eq!(summary.skipped_nals, 1);
        assert_eq!(summary.slices, 1);
        assert_eq!(summary.errors_by_kind.values().sum::<u64>(), 1);
        // 损坏 slice 的宏块在读 end_of_slice_flag 之前已输出
        assert_eq!(count, 2);
    }

    #[test]
    fn test_corrupt_slice_fails_without_skip() {
        let bad = build_cabac_slice(SliceType::I, 0, &missing_end_events());
        let mut parser = RbspParser::default();
        parser
            .parse_annex_b(&stream_with_slice(&bad), &mut |_: &MacroblockInfo| {})
            .expect_err("损坏 slice 应失败");
        assert_eq!(parser.summary().slices, 0);
    }

    #[test]
    fn test_data_partition_unsupported() {
        let mut parser = RbspParser::default();
        let nal = NalUnit::parse(&[0x62, 0x80]).expect("NAL 解析失败");
        let err = parser
            .parse_nal(&nal, &mut |_: &MacroblockInfo| {})
            .expect_err("数据分区应不支持");
        assert!(matches!(err, AvcError::UnsupportedFeature(_)));
    }

    #[test]
    fn test_cavlc_slice_skipped_as_unsupported() {
        let params = StreamParams::default().with_cabac(false);
        let mut data = params.annex_b_parameter_sets();
        // CAVLC I slice header + 任意数据
        let mut bw = avcsyn_core::BitWriter::new();
        params.write_slice_header(&mut bw, SliceType::I, 0);
        bw.write_bits(0xA5, 8);
        bw.write_trailing_bits();
        data.extend(annex_b_nal(3, 5, &bw.finish()));

        let config = ParserConfig::default().with_skip_corrupt_slices(true);
        let mut parser = RbspParser::new(config);
        parser
            .parse_annex_b(&data, &mut |_: &MacroblockInfo| {})
            .expect("应跳过");
        assert_eq!(
            parser.summary().errors_by_kind.get("UnsupportedFeature"),
            Some(&1)
        );
    }

    #[test]
    fn test_ignored_nal_types() {
        let mut parser = RbspParser::default();
        let aud = NalUnit::parse(&[0x09, 0xF0]).expect("NAL 解析失败");
        let outcome = parser
            .parse_nal(&aud, &mut |_: &MacroblockInfo| {})
            .expect("AUD 不应失败");
        assert_eq!(outcome, NalOutcome::Ignored(NalUnitType::Aud));
        assert_eq!(parser.summary().ignored_nals, 1);
    }

    #[test]
    fn test_push_nal_forbidden_bit() {
        let config = ParserConfig::default().with_skip_corrupt_slices(true);
        let mut parser = RbspParser::new(config);
        parser
            .push_nal(&[0x85, 0x00], &mut |_: &MacroblockInfo| {})
            .expect("可恢复错误应被跳过");
        assert_eq!(
            parser.summary().errors_by_kind.get("StructuralViolation"),
            Some(&1)
        );
    }
}
