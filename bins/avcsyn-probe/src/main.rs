//! avcsyn-probe - H.264 CABAC 码流语法探测工具
//!
//! 读取 Annex B 文件, 解析参数集、slice header 与全部宏块语法,
//! 输出统计与前若干个宏块的摘要.

use std::io::Write;
use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::Parser;

use avcsyn::logging::{self, LoggingConfig};
use avcsyn::probe::{ProbeReport, probe_file};
use avcsyn::syntax::ParserConfig;

/// H.264 CABAC 码流语法探测工具
#[derive(Parser, Debug)]
#[command(name = "avcsyn-probe", version, about = "纯 Rust H.264 CABAC 语法探测工具")]
struct Cli {
    /// 输入 Annex B 文件路径
    input: PathBuf,

    /// 输出 JSON 格式
    #[arg(long)]
    json: bool,

    /// 最多输出的宏块摘要数
    #[arg(long, default_value_t = 0)]
    max_mb: usize,

    /// 跳过损坏的 slice 并继续
    #[arg(long)]
    skip_corrupt: bool,

    /// 不保留残差系数
    #[arg(long)]
    no_coefficients: bool,

    /// 日志目录 (按天滚动)
    #[arg(long)]
    log_dir: Option<String>,

    /// 日志详细程度, 可重复 (-v / -vv / -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn logging_config(&self) -> LoggingConfig {
        let config = LoggingConfig::from_verbosity(self.verbose);
        match &self.log_dir {
            Some(dir) => config.with_directory(dir.clone()),
            None => config,
        }
    }

    fn parser_config(&self) -> ParserConfig {
        ParserConfig::default()
            .with_skip_corrupt_slices(self.skip_corrupt)
            .with_emit_coefficients(!self.no_coefficients)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(&cli).await {
        eprintln!("错误: {:#}", err);
        process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    logging::init(&cli.logging_config())?;
    let report = probe_file(&cli.input, cli.parser_config(), cli.max_mb).await?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    write_report(&mut out, &report, cli.json)?;
    out.flush()?;
    Ok(())
}

fn write_report<W: Write>(out: &mut W, report: &ProbeReport, json: bool) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, report)?;
        writeln!(out)?;
        return Ok(());
    }

    let s = &report.summary;
    writeln!(out, "NAL 单元: {}", s.nal_units)?;
    writeln!(out, "参数集: SPS={}, 子集 SPS={}, PPS={}", s.sps, s.subset_sps, s.pps)?;
    let types: Vec<String> = s
        .slice_types
        .iter()
        .map(|(t, n)| format!("{}={}", t, n))
        .collect();
    writeln!(out, "slice: {} ({})", s.slices, types.join(", "))?;
    let mb = &s.macroblocks;
    writeln!(
        out,
        "宏块: {} (跳过 {}, 帧内 {}, PCM {}), 非零系数 {}",
        mb.macroblocks, mb.skipped, mb.intra, mb.pcm, mb.nonzero_coefficients
    )?;
    if s.skipped_nals > 0 {
        let kinds: Vec<String> = s
            .errors_by_kind
            .iter()
            .map(|(k, n)| format!("{}={}", k, n))
            .collect();
        writeln!(out, "跳过的 NAL: {} ({})", s.skipped_nals, kinds.join(", "))?;
    }

    for d in &report.macroblocks {
        writeln!(
            out,
            "  slice {:3} mb {:5} {:<12} cbp=0x{:02x} qp={:2}{}{}",
            d.slice_num,
            d.mb_addr,
            d.mb_type,
            d.coded_block_pattern,
            d.qp_y,
            if d.skip { " skip" } else { "" },
            if d.field { " field" } else { "" }
        )?;
    }
    if report.truncated {
        writeln!(out, "  ... (宏块摘要已截断, 使用 --max-mb 调整)")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use avcsyn::syntax::SliceType;
    use avcsyn::syntax::synth::synth_annex_b;

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "avcsyn-probe",
            "in.264",
            "--json",
            "--max-mb",
            "8",
            "--skip-corrupt",
            "-vv",
        ])
        .expect("参数解析失败");
        assert!(cli.json);
        assert_eq!(cli.max_mb, 8);
        assert_eq!(cli.logging_config().level, "debug");
        let config = cli.parser_config();
        assert!(config.skip_corrupt_slices);
        assert!(config.emit_coefficients);
    }

    #[test]
    fn test_cli_requires_input() {
        assert!(Cli::try_parse_from(["avcsyn-probe"]).is_err());
    }

    #[tokio::test]
    async fn test_probe_file_text_and_json() {
        let data = synth_annex_b(2, 2, &[SliceType::I], |_| 0).expect("生成失败");
        let mut file = tempfile::NamedTempFile::new().expect("创建临时文件失败");
        file.write_all(&data).expect("写入失败");
        file.flush().expect("刷新失败");

        let report = probe_file(file.path(), ParserConfig::default(), 2)
            .await
            .expect("探测失败");

        let mut text = Vec::new();
        write_report(&mut text, &report, false).expect("输出失败");
        let text = String::from_utf8(text).expect("非 UTF-8 输出");
        assert!(text.contains("slice: 1 (I=1)"), "文本输出不符, actual={}", text);
        assert!(text.contains("宏块: 4"), "文本输出不符, actual={}", text);
        assert!(text.contains("已截断"), "文本输出不符, actual={}", text);

        let mut json = Vec::new();
        write_report(&mut json, &report, true).expect("输出失败");
        let value: serde_json::Value = serde_json::from_slice(&json).expect("JSON 解析失败");
        assert_eq!(value["summary"]["macroblocks"]["macroblocks"], 4);
        assert_eq!(value["macroblocks"].as_array().map(Vec::len), Some(2));
    }
}
