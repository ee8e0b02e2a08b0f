//! 异步 NAL 读取.
//!
//! 只在等待字节时挂起. 读到完整的 NAL 单元后交给同步的 [`RbspParser`],
//! 因此 slice header 的全部子语法都在同一条解析路径上完成.

use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};

use avcsyn_core::{AvcError, AvcResult};

use crate::neighbor::NeighborStore;
use crate::parser::{MacroblockSink, RbspParser};

const READ_CHUNK: usize = 64 * 1024;

/// NAL 分帧方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// 起始码分隔 (0x000001 / 0x00000001)
    AnnexB,
    /// 大端长度前缀, 参数为前缀字节数 (1..=4)
    LengthPrefixed(usize),
}

/// 从 [`AsyncRead`] 中逐个切出 NAL 单元 (含 NAL 头, 不含起始码或长度前缀)
pub struct AsyncNalReader<R> {
    reader: R,
    framing: Framing,
    buf: BytesMut,
    /// Annex B: 已越过第一个起始码
    started: bool,
    /// Annex B: 下一次查找起始码的位置
    scan_from: usize,
    /// Annex B: 第一个起始码之前丢弃的字节数
    discarded: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> AsyncNalReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader,
            framing,
            buf: BytesMut::with_capacity(READ_CHUNK),
            started: false,
            scan_from: 0,
            discarded: 0,
            eof: false,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// 读取下一个 NAL 单元, 流结束时返回 `None`
    pub async fn next_nal(&mut self) -> AvcResult<Option<Bytes>> {
        match self.framing {
            Framing::AnnexB => self.next_annex_b().await,
            Framing::LengthPrefixed(size) => self.next_length_prefixed(size).await,
        }
    }

    async fn fill(&mut self) -> AvcResult<usize> {
        if self.eof {
            return Ok(0);
        }
        self.buf.reserve(READ_CHUNK);
        let n = self.reader.read_buf(&mut self.buf).await?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    async fn next_annex_b(&mut self) -> AvcResult<Option<Bytes>> {
        while !self.started {
            if let Some(pos) = find_start_code(&self.buf, 0) {
                if self.discarded + pos > 1 {
                    debug!("H.264: 跳过起始码之前的 {} 字节", self.discarded + pos);
                }
                self.buf.advance(pos + 3);
                self.started = true;
                self.scan_from = 0;
                break;
            }
            // 保留可能属于下一个起始码的前两个字节
            let keep = self.buf.len().min(2);
            self.discarded += self.buf.len() - keep;
            self.buf.advance(self.buf.len() - keep);
            if self.fill().await? == 0 {
                let total = self.discarded + self.buf.len();
                if total > 0 {
                    debug!("H.264: Annex B 流中没有起始码, 丢弃 {} 字节", total);
                }
                self.buf.clear();
                return Ok(None);
            }
        }

        loop {
            if let Some(pos) = find_start_code(&self.buf, self.scan_from) {
                let body = self.buf.split_to(pos).freeze();
                self.buf.advance(3);
                self.scan_from = 0;
                let body = trim_trailing_zeros(body);
                if body.is_empty() {
                    continue;
                }
                return Ok(Some(body));
            }
            self.scan_from = self.buf.len().saturating_sub(2);
            if self.fill().await? == 0 {
                let body = trim_trailing_zeros(self.buf.split().freeze());
                self.scan_from = 0;
                return Ok((!body.is_empty()).then_some(body));
            }
        }
    }

    async fn next_length_prefixed(&mut self, size: usize) -> AvcResult<Option<Bytes>> {
        if !(1..=4).contains(&size) {
            return Err(AvcError::InvalidData(format!(
                "H.264: 长度前缀大小非法, length_size={}",
                size
            )));
        }
        loop {
            while self.buf.len() < size {
                if self.fill().await? == 0 {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(AvcError::StreamExhaustion(format!(
                        "H.264: 长度前缀截断, remain={}",
                        self.buf.len()
                    )));
                }
            }
            let len = self.buf[..size]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
            while self.buf.len() < size + len {
                if self.fill().await? == 0 {
                    return Err(AvcError::StreamExhaustion(format!(
                        "H.264: NAL 数据截断, declared_len={}, remain={}",
                        len,
                        self.buf.len() - size
                    )));
                }
            }
            self.buf.advance(size);
            let body = self.buf.split_to(len).freeze();
            if !body.is_empty() {
                return Ok(Some(body));
            }
        }
    }
}

/// 查找 0x000001 的起始位置
fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|p| p + from)
}

fn trim_trailing_zeros(mut body: Bytes) -> Bytes {
    let end = body.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    body.truncate(end);
    body
}

/// 异步读取整个码流并逐个 NAL 交给 `parser`
///
/// 错误处理与 [`RbspParser::push_nal`] 一致. I/O 错误总是直接返回.
pub async fn parse_stream_async<R, N, K>(
    reader: R,
    framing: Framing,
    parser: &mut RbspParser<N>,
    sink: &mut K,
) -> AvcResult<()>
where
    R: AsyncRead + Unpin,
    N: NeighborStore,
    K: MacroblockSink + ?Sized,
{
    let mut nals = AsyncNalReader::new(reader, framing);
    while let Some(nal) = nals.next_nal().await? {
        parser.push_nal(&nal, sink)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    use crate::macroblock::MacroblockInfo;
    use crate::slice_header::SliceType;
    use crate::test_support::{BinEvent, StreamParams, annex_b_nal, build_cabac_slice};

    /// 每次只交出一个字节的读取器
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos < self.data.len() && buf.remaining() > 0 {
                let byte = self.data[self.pos];
                buf.put_slice(&[byte]);
                self.pos += 1;
            }
            Poll::Ready(Ok(()))
        }
    }

    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "断开")))
        }
    }

    async fn collect(reader: impl AsyncRead + Unpin, framing: Framing) -> Vec<Bytes> {
        let mut nals = AsyncNalReader::new(reader, framing);
        let mut out = Vec::new();
        while let Some(nal) = nals.next_nal().await.expect("读取失败") {
            out.push(nal);
        }
        out
    }

    #[tokio::test]
    async fn test_annex_b_mixed_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x4D, 0x00, // 4 字节起始码
            0x00, 0x00, 0x01, 0x68, 0xEE, // 3 字节起始码
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x00, 0x00,
        ];
        let nals = collect(&data[..], Framing::AnnexB).await;
        assert_eq!(nals.len(), 3);
        assert_eq!(&nals[0][..], &[0x67, 0x4D]);
        assert_eq!(&nals[1][..], &[0x68, 0xEE]);
        assert_eq!(&nals[2][..], &[0x65, 0x88], "尾随零字节应去除");
    }

    #[tokio::test]
    async fn test_annex_b_byte_by_byte_matches_slice_split() {
        let mut data = vec![0xAB, 0xCD]; // 起始码之前的垃圾字节
        data.extend(StreamParams::new(2, 2).annex_b_parameter_sets());
        let expect = crate::nal::annex_b_payloads(&data);
        let nals = collect(Trickle { data: data.clone(), pos: 0 }, Framing::AnnexB).await;
        let got: Vec<&[u8]> = nals.iter().map(|b| &b[..]).collect();
        assert_eq!(got, expect);
    }

    #[tokio::test]
    async fn test_annex_b_without_start_code() {
        let data = [0x12, 0x34, 0x56];
        assert!(collect(&data[..], Framing::AnnexB).await.is_empty());
    }

    #[tokio::test]
    async fn test_length_prefixed() {
        let data = [0x00, 0x02, 0x67, 0x4D, 0x00, 0x00, 0x00, 0x01, 0x68];
        let nals = collect(Trickle { data: data.to_vec(), pos: 0 }, Framing::LengthPrefixed(2)).await;
        assert_eq!(nals.len(), 2, "长度为 0 的 NAL 应跳过");
        assert_eq!(&nals[0][..], &[0x67, 0x4D]);
        assert_eq!(&nals[1][..], &[0x68]);
    }

    #[tokio::test]
    async fn test_length_prefixed_truncated() {
        let data = [0x00, 0x00, 0x00, 0x05, 0x67, 0x4D];
        let mut nals = AsyncNalReader::new(&data[..], Framing::LengthPrefixed(4));
        let err = nals.next_nal().await.expect_err("截断的 NAL 应失败");
        assert!(matches!(err, AvcError::StreamExhaustion(_)));
    }

    #[tokio::test]
    async fn test_io_error_is_not_recoverable() {
        let mut nals = AsyncNalReader::new(Broken, Framing::AnnexB);
        let err = nals.next_nal().await.expect_err("I/O 错误应返回");
        assert_eq!(err.kind(), "Io");
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_parse_stream_async_matches_sync() {
        let mut events = vec![BinEvent::Decision(3, 0)];
        events.extend(std::iter::repeat_n(BinEvent::Decision(68, 1), 16));
        events.push(BinEvent::Decision(64, 0));
        events.extend([73, 74, 75, 76].map(|ctx| BinEvent::Decision(ctx, 0)));
        events.push(BinEvent::Decision(77, 0));
        events.push(BinEvent::Terminate(1));
        let mut data = StreamParams::default().annex_b_parameter_sets();
        data.extend(annex_b_nal(3, 5, &build_cabac_slice(SliceType::I, 0, &events)));

        let mut sync_parser = RbspParser::default();
        let mut sync_mbs = Vec::new();
        sync_parser
            .parse_annex_b(&data, &mut |mb: &MacroblockInfo| sync_mbs.push(mb.clone()))
            .expect("同步解析失败");

        let mut async_parser = RbspParser::default();
        let mut async_mbs = Vec::new();
        parse_stream_async(
            Trickle { data, pos: 0 },
            Framing::AnnexB,
            &mut async_parser,
            &mut |mb: &MacroblockInfo| async_mbs.push(mb.clone()),
        )
        .await
        .expect("异步解析失败");

        assert_eq!(async_mbs, sync_mbs);
        assert_eq!(async_parser.summary(), sync_parser.summary());
        assert_eq!(async_parser.summary().slices, 1);
    }
}
