//! 码流探测: 整体统计与前若干个宏块的摘要.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use avcsyn_core::AvcResult;
use avcsyn_syntax::{
    Framing, MacroblockInfo, MacroblockSink, ParserConfig, RbspParser, SliceHeader,
    StreamSummary, parse_stream_async,
};

/// 单个宏块的摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MacroblockDigest {
    pub slice_num: u32,
    pub mb_addr: u32,
    pub mb_type: String,
    pub skip: bool,
    pub field: bool,
    pub coded_block_pattern: u8,
    pub qp_y: i32,
    pub nonzero_coefficients: usize,
}

impl From<&MacroblockInfo> for MacroblockDigest {
    fn from(mb: &MacroblockInfo) -> Self {
        Self {
            slice_num: mb.slice_num,
            mb_addr: mb.mb_addr,
            mb_type: format!("{:?}", mb.mb_type),
            skip: mb.skip,
            field: mb.field,
            coded_block_pattern: mb.coded_block_pattern,
            qp_y: mb.qp_y,
            nonzero_coefficients: mb.nonzero_coefficients(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReport {
    pub summary: StreamSummary,
    pub macroblocks: Vec<MacroblockDigest>,
    /// 宏块数超过上限, `macroblocks` 只含前一部分
    pub truncated: bool,
}

struct DigestCollector {
    limit: usize,
    digests: Vec<MacroblockDigest>,
    truncated: bool,
}

impl DigestCollector {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            digests: Vec::new(),
            truncated: false,
        }
    }

    fn finish(self, summary: StreamSummary) -> ProbeReport {
        info!(
            "探测完成: nal={}, slices={}, macroblocks={}, skipped_nals={}",
            summary.nal_units, summary.slices, summary.macroblocks.macroblocks, summary.skipped_nals
        );
        ProbeReport {
            summary,
            macroblocks: self.digests,
            truncated: self.truncated,
        }
    }
}

impl MacroblockSink for DigestCollector {
    fn on_slice_start(&mut self, header: &SliceHeader) {
        tracing::debug!(
            "slice 开始: type={:?}, first_mb={}, qp={}",
            header.slice_type,
            header.first_mb_in_slice,
            header.slice_qp
        );
    }

    fn on_macroblock(&mut self, mb: &MacroblockInfo) {
        if self.digests.len() < self.limit {
            self.digests.push(MacroblockDigest::from(mb));
        } else {
            self.truncated = true;
        }
    }
}

/// 探测内存中的 Annex B 码流, 最多保留 `max_mb` 个宏块摘要
pub fn probe_annex_b(data: &[u8], config: ParserConfig, max_mb: usize) -> AvcResult<ProbeReport> {
    let mut parser = RbspParser::new(config);
    let mut collector = DigestCollector::new(max_mb);
    parser.parse_annex_b(data, &mut collector)?;
    Ok(collector.finish(parser.into_summary()))
}

/// 异步读取并探测 Annex B 文件
pub async fn probe_file(path: &Path, config: ParserConfig, max_mb: usize) -> Result<ProbeReport> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("打开输入文件失败, path={}", path.display()))?;
    let mut parser = RbspParser::new(config);
    let mut collector = DigestCollector::new(max_mb);
    parse_stream_async(file, Framing::AnnexB, &mut parser, &mut collector)
        .await
        .with_context(|| format!("解析码流失败, path={}", path.display()))?;
    Ok(collector.finish(parser.into_summary()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use avcsyn_syntax::SliceType;
    use avcsyn_syntax::synth::synth_annex_b;

    #[test]
    fn test_probe_truncates_digests() {
        let data = synth_annex_b(3, 2, &[SliceType::I], |_| 0).expect("生成失败");
        let report = probe_annex_b(&data, ParserConfig::default(), 4).expect("探测失败");
        assert_eq!(report.summary.macroblocks.macroblocks, 6);
        assert_eq!(report.macroblocks.len(), 4);
        assert!(report.truncated);
        assert_eq!(report.macroblocks[3].mb_addr, 3);
        assert_eq!(report.macroblocks[0].mb_type, "INxN");
    }

    #[test]
    fn test_probe_report_serializes() {
        let data = synth_annex_b(1, 1, &[SliceType::I], |_| 0).expect("生成失败");
        let report = probe_annex_b(&data, ParserConfig::default(), 16).expect("探测失败");
        let json = serde_json::to_value(&report).expect("序列化失败");
        assert_eq!(json["summary"]["slices"], 1);
        assert_eq!(json["macroblocks"][0]["qp_y"], 26);
        assert_eq!(json["truncated"], false);
    }

    #[tokio::test]
    async fn test_probe_missing_file() {
        let err = probe_file(Path::new("/nonexistent/avcsyn.264"), ParserConfig::default(), 1)
            .await
            .expect_err("不存在的文件应失败");
        assert!(format!("{:#}", err).contains("打开输入文件失败"));
    }
}
