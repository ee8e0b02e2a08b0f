//! H.264 NAL 单元解析与码流分帧.
//!
//! # Annex B 格式
//!
//! 使用 3 字节 `00 00 01` 或 4 字节 `00 00 00 01` 起始码分隔 NAL 单元.
//!
//! # NAL 头部
//! ```text
//! ┌──────────────────────────────────────┐
//! │ forbidden(1) | ref_idc(2) | type(5)  │
//! └──────────────────────────────────────┘
//! ```
//! 类型 14/20/21 额外携带 3 字节头部扩展 (MVC/SVC/3D-AVC).
//!
//! # avcC 格式
//! ```text
//! [length: 1~4 bytes BE] [NAL data: length bytes]
//! ```

use avcsyn_core::{AvcError, AvcResult};
use log::warn;

/// NAL 单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NalUnitType {
    /// 非 IDR 图像 slice
    Slice,
    /// 数据分区 A
    SliceDpa,
    /// 数据分区 B
    SliceDpb,
    /// 数据分区 C
    SliceDpc,
    /// IDR 图像 slice
    SliceIdr,
    /// 增补增强信息
    Sei,
    /// 序列参数集
    Sps,
    /// 图像参数集
    Pps,
    /// 访问单元分隔符
    Aud,
    /// 序列结束
    EndOfSequence,
    /// 流结束
    EndOfStream,
    /// 填充数据
    FillerData,
    /// SPS 扩展
    SpsExtension,
    /// 前缀 NAL (MVC/SVC)
    Prefix,
    /// 子集序列参数集
    SubsetSps,
    /// 辅助图像 slice
    SliceAux,
    /// 扩展 slice (MVC 非基本视图)
    SliceExtension,
    /// 深度视图 slice 扩展
    SliceExtensionDepth,
    /// 未知或保留类型
    Unknown(u8),
}

impl NalUnitType {
    /// 从 nal_unit_type 数值创建
    pub fn from_type_id(type_id: u8) -> Self {
        match type_id {
            1 => Self::Slice,
            2 => Self::SliceDpa,
            3 => Self::SliceDpb,
            4 => Self::SliceDpc,
            5 => Self::SliceIdr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            10 => Self::EndOfSequence,
            11 => Self::EndOfStream,
            12 => Self::FillerData,
            13 => Self::SpsExtension,
            14 => Self::Prefix,
            15 => Self::SubsetSps,
            19 => Self::SliceAux,
            20 => Self::SliceExtension,
            21 => Self::SliceExtensionDepth,
            _ => Self::Unknown(type_id),
        }
    }

    /// nal_unit_type 数值
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Slice => 1,
            Self::SliceDpa => 2,
            Self::SliceDpb => 3,
            Self::SliceDpc => 4,
            Self::SliceIdr => 5,
            Self::Sei => 6,
            Self::Sps => 7,
            Self::Pps => 8,
            Self::Aud => 9,
            Self::EndOfSequence => 10,
            Self::EndOfStream => 11,
            Self::FillerData => 12,
            Self::SpsExtension => 13,
            Self::Prefix => 14,
            Self::SubsetSps => 15,
            Self::SliceAux => 19,
            Self::SliceExtension => 20,
            Self::SliceExtensionDepth => 21,
            Self::Unknown(id) => *id,
        }
    }

    /// 是否携带 slice_layer 语法
    pub fn is_slice(&self) -> bool {
        matches!(
            self,
            Self::Slice
                | Self::SliceIdr
                | Self::SliceAux
                | Self::SliceExtension
                | Self::SliceExtensionDepth
        )
    }

    /// 是否为数据分区 slice (仅用于 CAVLC)
    pub fn is_partitioned(&self) -> bool {
        matches!(self, Self::SliceDpa | Self::SliceDpb | Self::SliceDpc)
    }

    /// 是否为 IDR
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::SliceIdr)
    }

    /// 头部是否带 3 字节扩展
    pub fn has_header_extension(&self) -> bool {
        matches!(
            self,
            Self::Prefix | Self::SliceExtension | Self::SliceExtensionDepth
        )
    }
}

impl std::fmt::Display for NalUnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slice => write!(f, "Slice"),
            Self::SliceDpa => write!(f, "SliceDPA"),
            Self::SliceDpb => write!(f, "SliceDPB"),
            Self::SliceDpc => write!(f, "SliceDPC"),
            Self::SliceIdr => write!(f, "IDR"),
            Self::Sei => write!(f, "SEI"),
            Self::Sps => write!(f, "SPS"),
            Self::Pps => write!(f, "PPS"),
            Self::Aud => write!(f, "AUD"),
            Self::EndOfSequence => write!(f, "EndOfSeq"),
            Self::EndOfStream => write!(f, "EndOfStream"),
            Self::FillerData => write!(f, "Filler"),
            Self::SpsExtension => write!(f, "SPSExt"),
            Self::Prefix => write!(f, "Prefix"),
            Self::SubsetSps => write!(f, "SubsetSPS"),
            Self::SliceAux => write!(f, "SliceAux"),
            Self::SliceExtension => write!(f, "SliceExt"),
            Self::SliceExtensionDepth => write!(f, "SliceExtDepth"),
            Self::Unknown(id) => write!(f, "Unknown({id})"),
        }
    }
}

/// NAL 头部扩展 (类型 14/20/21)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalHeaderExtension {
    /// nal_unit_header_mvc_extension
    Mvc {
        /// non_idr_flag
        non_idr: bool,
        /// priority_id
        priority_id: u8,
        /// view_id
        view_id: u16,
        /// temporal_id
        temporal_id: u8,
        /// anchor_pic_flag
        anchor_pic: bool,
        /// inter_view_flag
        inter_view: bool,
    },
    /// SVC 扩展, 仅保留原始 23 位
    Svc(u32),
    /// 3D-AVC 扩展, 仅保留原始 15 位
    Avc3d(u16),
}

/// 解析后的 NAL 单元
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// NAL 单元类型
    pub nal_type: NalUnitType,
    /// nal_ref_idc (0-3)
    pub ref_idc: u8,
    /// 头部扩展
    pub extension: Option<NalHeaderExtension>,
    /// 原始数据 (不含起始码, 含头部字节)
    pub data: Vec<u8>,
}

impl NalUnit {
    /// 从 NAL 数据 (含头部字节) 解析
    pub fn parse(data: &[u8]) -> AvcResult<Self> {
        let Some(&header) = data.first() else {
            return Err(AvcError::InvalidData("H.264: NAL 单元数据为空".into()));
        };

        let forbidden = header >> 7;
        if forbidden != 0 {
            return Err(AvcError::StructuralViolation(format!(
                "H.264: forbidden_zero_bit 非法, value={}",
                forbidden
            )));
        }
        let ref_idc = (header >> 5) & 0x03;
        let nal_type = NalUnitType::from_type_id(header & 0x1F);

        let extension = if nal_type.has_header_extension() {
            if data.len() < 4 {
                return Err(AvcError::StreamExhaustion(format!(
                    "H.264: {} NAL 头部扩展截断, len={}",
                    nal_type,
                    data.len()
                )));
            }
            let ext = u32::from(data[1]) << 16 | u32::from(data[2]) << 8 | u32::from(data[3]);
            Some(parse_header_extension(nal_type, ext))
        } else {
            None
        };

        Ok(Self {
            nal_type,
            ref_idc,
            extension,
            data: data.to_vec(),
        })
    }

    /// 头部字节数
    pub fn header_len(&self) -> usize {
        if self.extension.is_some() { 4 } else { 1 }
    }

    /// 是否为 MVC 非基本视图 slice (使用 MVC 参考列表修改语法)
    pub fn is_mvc_slice(&self) -> bool {
        matches!(self.nal_type, NalUnitType::SliceExtension | NalUnitType::SliceExtensionDepth)
            && matches!(self.extension, Some(NalHeaderExtension::Mvc { .. }))
    }

    /// 去除头部与防竞争字节后的 RBSP
    pub fn rbsp(&self) -> Vec<u8> {
        remove_emulation_prevention(&self.data[self.header_len().min(self.data.len())..])
    }
}

fn parse_header_extension(nal_type: NalUnitType, ext: u32) -> NalHeaderExtension {
    // 首位: 类型 14/20 为 svc_extension_flag, 类型 21 为 avc_3d_extension_flag
    let flag = ext >> 23 != 0;
    match (nal_type, flag) {
        (NalUnitType::SliceExtensionDepth, true) => {
            NalHeaderExtension::Avc3d(((ext >> 8) & 0x7FFF) as u16)
        }
        (_, true) => NalHeaderExtension::Svc(ext & 0x7F_FFFF),
        (_, false) => NalHeaderExtension::Mvc {
            non_idr: (ext >> 22) & 1 != 0,
            priority_id: ((ext >> 16) & 0x3F) as u8,
            view_id: ((ext >> 6) & 0x3FF) as u16,
            temporal_id: ((ext >> 3) & 0x07) as u8,
            anchor_pic: (ext >> 2) & 1 != 0,
            inter_view: (ext >> 1) & 1 != 0,
        },
    }
}

/// 从 Annex B 字节流中分割出所有 NAL 单元
///
/// 头部非法的 NAL 单元被丢弃并记录警告.
pub fn split_annex_b(data: &[u8]) -> Vec<NalUnit> {
    annex_b_payloads(data)
        .into_iter()
        .filter_map(|payload| match NalUnit::parse(payload) {
            Ok(nalu) => Some(nalu),
            Err(e) => {
                warn!("H.264: 丢弃非法 NAL 单元, err={}", e);
                None
            }
        })
        .collect()
}

/// 按起始码切出各 NAL 单元的字节区间 (不含起始码与尾随零字节)
pub fn annex_b_payloads(data: &[u8]) -> Vec<&[u8]> {
    let mut payloads = Vec::new();
    let mut cursor = find_start_code(data, 0);
    while let Some((_, body_start)) = cursor {
        let next = find_start_code(data, body_start);
        let end = next.map_or(data.len(), |(pos, _)| pos);
        let body = trim_trailing_zeros(&data[body_start..end]);
        if !body.is_empty() {
            payloads.push(body);
        }
        cursor = next;
    }
    payloads
}

/// 从 avcC (长度前缀) 数据中提取 NAL 单元
pub fn split_avcc(data: &[u8], length_size: usize) -> AvcResult<Vec<NalUnit>> {
    if !(1..=4).contains(&length_size) {
        return Err(AvcError::InvalidData(format!(
            "H.264: avcC 长度前缀大小非法, length_size={}",
            length_size
        )));
    }

    let mut nalus = Vec::new();
    let mut pos = 0;
    while pos + length_size <= data.len() {
        let nal_len = data[pos..pos + length_size]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        pos += length_size;

        if pos + nal_len > data.len() {
            return Err(AvcError::StreamExhaustion(format!(
                "H.264: avcC NAL 数据截断, declared_len={}, remain={}",
                nal_len,
                data.len() - pos
            )));
        }
        if nal_len > 0 {
            nalus.push(NalUnit::parse(&data[pos..pos + nal_len])?);
        }
        pos += nal_len;
    }

    Ok(nalus)
}

/// avcC 配置解析结果
#[derive(Debug)]
pub struct AvccConfig {
    /// profile_idc
    pub profile_idc: u8,
    /// level_idc
    pub level_idc: u8,
    /// SPS 列表 (含 NAL 头部)
    pub sps_list: Vec<Vec<u8>>,
    /// PPS 列表 (含 NAL 头部)
    pub pps_list: Vec<Vec<u8>>,
    /// NAL 长度前缀大小 (字节)
    pub length_size: usize,
}

/// 解析 AVCDecoderConfigurationRecord
pub fn parse_avcc_config(data: &[u8]) -> AvcResult<AvccConfig> {
    if data.len() < 7 {
        return Err(AvcError::InvalidData("H.264: avcC 数据太短".into()));
    }

    let profile_idc = data[1];
    let level_idc = data[3];
    let length_size = usize::from(data[4] & 0x03) + 1;

    let mut pos = 6;
    let sps_list = read_param_set_list(data, &mut pos, usize::from(data[5] & 0x1F), "SPS")?;

    let Some(&num_pps) = data.get(pos) else {
        return Err(AvcError::InvalidData(
            "H.264: avcC 缺少 numOfPictureParameterSets 字段".into(),
        ));
    };
    pos += 1;
    let pps_list = read_param_set_list(data, &mut pos, usize::from(num_pps), "PPS")?;

    Ok(AvccConfig {
        profile_idc,
        level_idc,
        sps_list,
        pps_list,
        length_size,
    })
}

fn read_param_set_list(
    data: &[u8],
    pos: &mut usize,
    count: usize,
    kind: &str,
) -> AvcResult<Vec<Vec<u8>>> {
    let mut list = Vec::with_capacity(count);
    for i in 0..count {
        if *pos + 2 > data.len() {
            return Err(AvcError::InvalidData(format!(
                "H.264: avcC {} 长度字段截断, index={}",
                kind, i
            )));
        }
        let len = usize::from(u16::from_be_bytes([data[*pos], data[*pos + 1]]));
        *pos += 2;
        if len == 0 {
            return Err(AvcError::InvalidData(format!(
                "H.264: avcC {} 长度非法, index={}, len=0",
                kind, i
            )));
        }
        if *pos + len > data.len() {
            return Err(AvcError::InvalidData(format!(
                "H.264: avcC {} 数据截断, index={}, declared_len={}, remain={}",
                kind,
                i,
                len,
                data.len().saturating_sub(*pos)
            )));
        }
        list.push(data[*pos..*pos + len].to_vec());
        *pos += len;
    }
    Ok(list)
}

// ============================================================
// 防竞争字节
// ============================================================

/// 移除防竞争字节 (`00 00 03` → `00 00`)
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0x00 { zeros + 1 } else { 0 };
        rbsp.push(byte);
    }
    rbsp
}

/// 插入防竞争字节, 使输出不含 `00 00 0x` (x <= 3) 序列
pub fn add_emulation_prevention(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64 + 1);
    let mut zeros = 0usize;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        zeros = if byte == 0x00 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    // 以 0x00 结尾时 (cabac_zero_word) 追加 0x03
    if out.last() == Some(&0x00) {
        out.push(0x03);
    }
    out
}

// ============================================================
// 内部工具函数
// ============================================================

/// 从 `from` 开始查找下一个起始码, 返回 (起始码位置, NAL 数据起点)
pub(crate) fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 2 < data.len() {
        // 4 字节起始码的首个零字节归入上一个 NAL 的尾随零, 之后被裁掉
        if data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01 {
            return Some((i, i + 3));
        }
        i += 1;
    }
    None
}

fn trim_trailing_zeros(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0x00).map_or(0, |p| p + 1);
    &data[..end]
}
