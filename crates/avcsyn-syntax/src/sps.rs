//! H.264 SPS (Sequence Parameter Set) 解析.
//!
//! SPS 描述编码视频序列的全局参数:
//! - Profile / Level
//! - 色度格式与位深, 决定 ChromaArrayType 与残差块布局
//! - 以宏块为单位的图像尺寸, 帧/场编码方式 (含 MBAFF)
//! - 量化矩阵与 VUI
//!
//! 子集 SPS (NAL 15) 的 `seq_parameter_set_data` 部分与普通 SPS 相同,
//! 其后的 SVC/MVC 扩展不参与 CABAC 语法解析, 这里不展开.

use avcsyn_core::{AvcError, AvcResult, BitReader, BitSource};

/// VUI 参数中语法解析关心的部分
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VuiParameters {
    /// 样本宽高比 (sar_width, sar_height), 未指定时为 (0, 1)
    pub sar: (u32, u32),
    /// video_full_range_flag
    pub full_range: bool,
    /// (colour_primaries, transfer_characteristics, matrix_coefficients)
    pub colour_description: Option<(u8, u8, u8)>,
    /// (num_units_in_tick, time_scale)
    pub timing: Option<(u32, u32)>,
    /// fixed_frame_rate_flag
    pub fixed_frame_rate: bool,
    /// nal_hrd_parameters_present_flag
    pub nal_hrd_present: bool,
    /// vcl_hrd_parameters_present_flag
    pub vcl_hrd_present: bool,
    /// pic_struct_present_flag
    pub pic_struct_present: bool,
    /// max_dec_frame_buffering (bitstream_restriction)
    pub max_dec_frame_buffering: Option<u32>,
}

impl VuiParameters {
    /// 帧率 (time_scale, 2 * num_units_in_tick)
    pub fn frame_rate(&self) -> Option<(u32, u64)> {
        self.timing
            .map(|(units, scale)| (scale, u64::from(units) * 2))
    }
}

/// SPS 解析结果
#[derive(Debug, Clone)]
pub struct Sps {
    /// profile_idc
    pub profile_idc: u8,
    /// constraint_set 标志位
    pub constraint_set_flags: u8,
    /// level_idc
    pub level_idc: u8,
    /// seq_parameter_set_id
    pub sps_id: u32,
    /// chroma_format_idc (0=单色, 1=4:2:0, 2=4:2:2, 3=4:4:4)
    pub chroma_format_idc: u32,
    /// separate_colour_plane_flag
    pub separate_colour_plane: bool,
    /// 亮度位深
    pub bit_depth_luma: u32,
    /// 色度位深
    pub bit_depth_chroma: u32,
    /// qpprime_y_zero_transform_bypass_flag
    pub qpprime_y_zero_transform_bypass: bool,
    /// seq_scaling_matrix_present_flag
    pub scaling_matrix_present: bool,
    /// 4x4 量化矩阵 (已应用默认/回退规则)
    pub scaling_list_4x4: [[u8; 16]; 6],
    /// 8x8 量化矩阵 (4:4:4 为 6 组, 其余为 2 组)
    pub scaling_list_8x8: Vec<[u8; 64]>,
    /// log2(MaxFrameNum)
    pub log2_max_frame_num: u32,
    /// pic_order_cnt_type
    pub poc_type: u32,
    /// log2(MaxPicOrderCntLsb), 仅 poc_type==0
    pub log2_max_poc_lsb: u32,
    /// delta_pic_order_always_zero_flag
    pub delta_pic_order_always_zero_flag: bool,
    /// offset_for_non_ref_pic
    pub offset_for_non_ref_pic: i32,
    /// offset_for_top_to_bottom_field
    pub offset_for_top_to_bottom_field: i32,
    /// offset_for_ref_frame 列表
    pub offset_for_ref_frame: Vec<i32>,
    /// max_num_ref_frames
    pub max_num_ref_frames: u32,
    /// gaps_in_frame_num_value_allowed_flag
    pub gaps_in_frame_num_value_allowed_flag: bool,
    /// PicWidthInMbs
    pub pic_width_in_mbs: u32,
    /// PicHeightInMapUnits
    pub pic_height_in_map_units: u32,
    /// frame_mbs_only_flag
    pub frame_mbs_only: bool,
    /// mb_adaptive_frame_field_flag
    pub mb_adaptive_frame_field: bool,
    /// direct_8x8_inference_flag
    pub direct_8x8_inference: bool,
    /// 裁剪偏移 (left, right, top, bottom), 以裁剪单位计
    pub crop: (u32, u32, u32, u32),
    /// 裁剪后的图像宽度 (像素)
    pub width: u32,
    /// 裁剪后的图像高度 (像素)
    pub height: u32,
    /// VUI 参数
    pub vui: Option<VuiParameters>,
}

impl Sps {
    /// ChromaArrayType
    pub fn chroma_array_type(&self) -> u32 {
        if self.separate_colour_plane {
            0
        } else {
            self.chroma_format_idc
        }
    }

    /// (SubWidthC, SubHeightC), 单色或独立色彩平面时为 None
    pub fn chroma_subsampling(&self) -> Option<(u32, u32)> {
        match self.chroma_array_type() {
            1 => Some((2, 2)),
            2 => Some((2, 1)),
            3 => Some((1, 1)),
            _ => None,
        }
    }

    /// (MbWidthC, MbHeightC), 无色度时为 (0, 0)
    pub fn mb_chroma_size(&self) -> (u32, u32) {
        self.chroma_subsampling()
            .map_or((0, 0), |(sw, sh)| (16 / sw, 16 / sh))
    }

    /// FrameHeightInMbs
    pub fn frame_height_in_mbs(&self) -> u32 {
        self.pic_height_in_map_units * if self.frame_mbs_only { 1 } else { 2 }
    }

    /// PicSizeInMapUnits
    pub fn pic_size_in_map_units(&self) -> u32 {
        self.pic_width_in_mbs * self.pic_height_in_map_units
    }

    /// 一帧的宏块数
    pub fn frame_size_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs * self.frame_height_in_mbs()
    }

    /// QpBdOffsetY
    pub fn qp_bd_offset_y(&self) -> i32 {
        6 * (self.bit_depth_luma as i32 - 8)
    }

    /// QpBdOffsetC
    pub fn qp_bd_offset_c(&self) -> i32 {
        6 * (self.bit_depth_chroma as i32 - 8)
    }
}

/// 预定义的 SAR 表 (ITU-T H.264 表 E-1)
const SAR_TABLE: [(u32, u32); 17] = [
    (0, 1),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

pub(crate) const DEFAULT_SCALING_4X4_INTRA: [u8; 16] = [
    6, 13, 20, 28, 13, 20, 28, 32, 20, 28, 32, 37, 28, 32, 37, 42,
];

pub(crate) const DEFAULT_SCALING_4X4_INTER: [u8; 16] = [
    10, 14, 20, 24, 14, 20, 24, 27, 20, 24, 27, 30, 24, 27, 30, 34,
];

pub(crate) const DEFAULT_SCALING_8X8_INTRA: [u8; 64] = [
    6, 10, 13, 16, 18, 23, 25, 27, 10, 11, 16, 18, 23, 25, 27, 29, 13, 16, 18, 23, 25, 27, 29, 31,
    16, 18, 23, 25, 27, 29, 31, 33, 18, 23, 25, 27, 29, 31, 33, 36, 23, 25, 27, 29, 31, 33, 36, 38,
    25, 27, 29, 31, 33, 36, 38, 40, 27, 29, 31, 33, 36, 38, 40, 42,
];

pub(crate) const DEFAULT_SCALING_8X8_INTER: [u8; 64] = [
    9, 13, 15, 17, 19, 21, 22, 24, 13, 13, 17, 19, 21, 22, 24, 25, 15, 17, 19, 21, 22, 24, 25, 27,
    17, 19, 21, 22, 24, 25, 27, 28, 19, 21, 22, 24, 25, 27, 28, 30, 21, 22, 24, 25, 27, 28, 30, 32,
    22, 24, 25, 27, 28, 30, 32, 33, 24, 25, 27, 28, 30, 32, 33, 35,
];

/// 从 RBSP 数据解析 SPS
pub fn parse_sps(rbsp: &[u8]) -> AvcResult<Sps> {
    if rbsp.len() < 3 {
        return Err(AvcError::InvalidData("H.264: SPS RBSP 太短".into()));
    }
    let mut br = BitReader::new(rbsp);
    parse_seq_parameter_set_data(&mut br)
}

/// 解析子集 SPS (NAL 15), 仅保留 seq_parameter_set_data 部分
pub fn parse_subset_sps(rbsp: &[u8]) -> AvcResult<Sps> {
    parse_sps(rbsp)
}

fn parse_seq_parameter_set_data(br: &mut BitReader) -> AvcResult<Sps> {
    let profile_idc = br.read_bits(8)? as u8;
    let constraint_set_flags = br.read_bits(8)? as u8;
    let level_idc = br.read_bits(8)? as u8;
    let sps_id = br.read_ue()?;
    if sps_id > 31 {
        return Err(AvcError::InvalidData(format!(
            "H.264: sps_id 超出范围, sps_id={}",
            sps_id
        )));
    }

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    let mut bit_depth_luma = 8;
    let mut bit_depth_chroma = 8;
    let mut qpprime_y_zero_transform_bypass = false;
    let mut scaling_matrix_present = false;
    let mut scaling_list_4x4 = default_scaling_lists_4x4();
    let mut scaling_list_8x8 = default_scaling_lists_8x8(chroma_format_idc);

    if has_chroma_info(profile_idc) {
        chroma_format_idc = br.read_ue()?;
        if chroma_format_idc > 3 {
            return Err(AvcError::InvalidData(format!(
                "H.264: chroma_format_idc 非法, value={}",
                chroma_format_idc
            )));
        }
        if chroma_format_idc == 3 {
            separate_colour_plane = br.read_flag()?;
        }
        scaling_list_8x8 = default_scaling_lists_8x8(chroma_format_idc);
        bit_depth_luma = br.read_ue()?.saturating_add(8);
        bit_depth_chroma = br.read_ue()?.saturating_add(8);
        if !(8..=14).contains(&bit_depth_luma) {
            return Err(AvcError::InvalidData(format!(
                "H.264: bit_depth_luma 非法, value={}",
                bit_depth_luma
            )));
        }
        if !(8..=14).contains(&bit_depth_chroma) {
            return Err(AvcError::InvalidData(format!(
                "H.264: bit_depth_chroma 非法, value={}",
                bit_depth_chroma
            )));
        }
        qpprime_y_zero_transform_bypass = br.read_flag()?;
        scaling_matrix_present = br.read_flag()?;
        if scaling_matrix_present {
            parse_seq_scaling_lists(
                br,
                chroma_format_idc,
                &mut scaling_list_4x4,
                &mut scaling_list_8x8,
            )?;
        }
    }

    let log2_max_frame_num_minus4 = br.read_ue()?;
    if log2_max_frame_num_minus4 > 12 {
        return Err(AvcError::InvalidData(format!(
            "H.264: log2_max_frame_num_minus4 超出范围, value={}",
            log2_max_frame_num_minus4
        )));
    }

    let poc_type = br.read_ue()?;
    let mut log2_max_poc_lsb = 0u32;
    let mut delta_pic_order_always_zero_flag = false;
    let mut offset_for_non_ref_pic = 0i32;
    let mut offset_for_top_to_bottom_field = 0i32;
    let mut offset_for_ref_frame = Vec::new();
    match poc_type {
        0 => {
            let log2_max_poc_lsb_minus4 = br.read_ue()?;
            if log2_max_poc_lsb_minus4 > 12 {
                return Err(AvcError::InvalidData(format!(
                    "H.264: log2_max_pic_order_cnt_lsb_minus4 超出范围, value={}",
                    log2_max_poc_lsb_minus4
                )));
            }
            log2_max_poc_lsb = log2_max_poc_lsb_minus4 + 4;
        }
        1 => {
            delta_pic_order_always_zero_flag = br.read_flag()?;
            offset_for_non_ref_pic = br.read_se()?;
            offset_for_top_to_bottom_field = br.read_se()?;
            let num_ref_in_poc = br.read_ue()?;
            if num_ref_in_poc > 255 {
                return Err(AvcError::InvalidData(format!(
                    "H.264: num_ref_frames_in_pic_order_cnt_cycle 超出范围, value={}",
                    num_ref_in_poc
                )));
            }
            for _ in 0..num_ref_in_poc {
                offset_for_ref_frame.push(br.read_se()?);
            }
        }
        2 => {}
        _ => {
            return Err(AvcError::InvalidData(format!(
                "H.264: pic_order_cnt_type 非法, value={}",
                poc_type
            )));
        }
    }

    let max_num_ref_frames = br.read_ue()?;
    if max_num_ref_frames > 16 {
        return Err(AvcError::InvalidData(format!(
            "H.264: max_num_ref_frames 超出范围, value={}",
            max_num_ref_frames
        )));
    }
    let gaps_in_frame_num_value_allowed_flag = br.read_flag()?;

    let pic_width_in_mbs = br.read_ue()?.saturating_add(1);
    let pic_height_in_map_units = br.read_ue()?.saturating_add(1);
    // 邻居存储按整帧分配, 尺寸需有上限
    if pic_width_in_mbs > 1024 || pic_height_in_map_units > 1024 {
        return Err(AvcError::InvalidData(format!(
            "H.264: 图像尺寸超出范围, width_mbs={}, height_map_units={}",
            pic_width_in_mbs, pic_height_in_map_units
        )));
    }

    let frame_mbs_only = br.read_flag()?;
    let mb_adaptive_frame_field = if frame_mbs_only {
        false
    } else {
        br.read_flag()?
    };
    let direct_8x8_inference = br.read_flag()?;

    let mut crop = (0, 0, 0, 0);
    if br.read_flag()? {
        crop = (br.read_ue()?, br.read_ue()?, br.read_ue()?, br.read_ue()?);
    }

    let chroma_array_type = if separate_colour_plane {
        0
    } else {
        chroma_format_idc
    };
    let (crop_unit_x, crop_unit_y) = cropping_unit(chroma_array_type, frame_mbs_only);
    let raw_width = pic_width_in_mbs * 16;
    let raw_height = pic_height_in_map_units * if frame_mbs_only { 16 } else { 32 };
    let crop_x = crop
        .0
        .checked_add(crop.1)
        .and_then(|v| v.checked_mul(crop_unit_x))
        .ok_or_else(|| AvcError::InvalidData("H.264: 计算水平裁剪时发生溢出".into()))?;
    let crop_y = crop
        .2
        .checked_add(crop.3)
        .and_then(|v| v.checked_mul(crop_unit_y))
        .ok_or_else(|| AvcError::InvalidData("H.264: 计算垂直裁剪时发生溢出".into()))?;
    if crop_x >= raw_width || crop_y >= raw_height {
        return Err(AvcError::InvalidData(format!(
            "H.264: 裁剪参数非法, raw={}x{}, crop_x={}, crop_y={}",
            raw_width, raw_height, crop_x, crop_y
        )));
    }

    let vui = if br.read_flag()? {
        Some(parse_vui(br)?)
    } else {
        None
    };

    Ok(Sps {
        profile_idc,
        constraint_set_flags,
        level_idc,
        sps_id,
        chroma_format_idc,
        separate_colour_plane,
        bit_depth_luma,
        bit_depth_chroma,
        qpprime_y_zero_transform_bypass,
        scaling_matrix_present,
        scaling_list_4x4,
        scaling_list_8x8,
        log2_max_frame_num: log2_max_frame_num_minus4 + 4,
        poc_type,
        log2_max_poc_lsb,
        delta_pic_order_always_zero_flag,
        offset_for_non_ref_pic,
        offset_for_top_to_bottom_field,
        offset_for_ref_frame,
        max_num_ref_frames,
        gaps_in_frame_num_value_allowed_flag,
        pic_width_in_mbs,
        pic_height_in_map_units,
        frame_mbs_only,
        mb_adaptive_frame_field,
        direct_8x8_inference,
        crop,
        width: raw_width - crop_x,
        height: raw_height - crop_y,
        vui,
    })
}

// ============================================================
// 辅助函数
// ============================================================

/// 是否携带 chroma_format_idc 等扩展字段
fn has_chroma_info(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

/// 裁剪单位 (CropUnitX, CropUnitY)
fn cropping_unit(chroma_array_type: u32, frame_mbs_only: bool) -> (u32, u32) {
    let (sub_width, sub_height) = match chroma_array_type {
        1 => (2, 2),
        2 => (2, 1),
        _ => (1, 1),
    };
    let height_mult = if frame_mbs_only { 1 } else { 2 };
    (sub_width, sub_height * height_mult)
}

pub(crate) fn default_scaling_lists_4x4() -> [[u8; 16]; 6] {
    [
        DEFAULT_SCALING_4X4_INTRA,
        DEFAULT_SCALING_4X4_INTRA,
        DEFAULT_SCALING_4X4_INTRA,
        DEFAULT_SCALING_4X4_INTER,
        DEFAULT_SCALING_4X4_INTER,
        DEFAULT_SCALING_4X4_INTER,
    ]
}

pub(crate) fn default_scaling_lists_8x8(chroma_format_idc: u32) -> Vec<[u8; 64]> {
    let list_count = if chroma_format_idc == 3 { 6 } else { 2 };
    (0..list_count).map(default_scaling_list_8x8_by_idx).collect()
}

pub(crate) fn default_scaling_list_4x4_by_idx(idx: usize) -> [u8; 16] {
    if idx < 3 {
        DEFAULT_SCALING_4X4_INTRA
    } else {
        DEFAULT_SCALING_4X4_INTER
    }
}

pub(crate) fn default_scaling_list_8x8_by_idx(idx: usize) -> [u8; 64] {
    if idx % 2 == 0 {
        DEFAULT_SCALING_8X8_INTRA
    } else {
        DEFAULT_SCALING_8X8_INTER
    }
}

fn parse_seq_scaling_lists<S: BitSource + ?Sized>(
    br: &mut S,
    chroma_format_idc: u32,
    scaling_list_4x4: &mut [[u8; 16]; 6],
    scaling_list_8x8: &mut [[u8; 64]],
) -> AvcResult<()> {
    let list_count = if chroma_format_idc != 3 { 8 } else { 12 };
    for list_idx in 0..list_count {
        if !br.read_flag()? {
            // 回退规则 A: 首个列表用默认值, 其余沿用前一个同类列表
            if list_idx < 6 {
                scaling_list_4x4[list_idx] = if list_idx == 0 || list_idx == 3 {
                    default_scaling_list_4x4_by_idx(list_idx)
                } else {
                    scaling_list_4x4[list_idx - 1]
                };
            } else {
                let idx8 = list_idx - 6;
                scaling_list_8x8[idx8] = if idx8 < 2 {
                    default_scaling_list_8x8_by_idx(idx8)
                } else {
                    scaling_list_8x8[idx8 - 2]
                };
            }
            continue;
        }

        if list_idx < 6 {
            let mut list = [0u8; 16];
            if read_scaling_list(br, &mut list)? {
                list = default_scaling_list_4x4_by_idx(list_idx);
            }
            scaling_list_4x4[list_idx] = list;
        } else {
            let idx8 = list_idx - 6;
            let mut list = [0u8; 64];
            if read_scaling_list(br, &mut list)? {
                list = default_scaling_list_8x8_by_idx(idx8);
            }
            scaling_list_8x8[idx8] = list;
        }
    }
    Ok(())
}

/// 读取一个量化矩阵, 返回 useDefaultScalingMatrixFlag
pub(crate) fn read_scaling_list<S: BitSource + ?Sized>(
    br: &mut S,
    list: &mut [u8],
) -> AvcResult<bool> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    let mut use_default = false;
    for (idx, slot) in list.iter_mut().enumerate() {
        if next_scale != 0 {
            let delta_scale = br.read_se()?;
            if !(-128..=127).contains(&delta_scale) {
                return Err(AvcError::InvalidData(format!(
                    "H.264: delta_scale 超出范围, value={}",
                    delta_scale
                )));
            }
            next_scale = (last_scale + delta_scale + 256).rem_euclid(256);
            use_default = idx == 0 && next_scale == 0;
        }
        let cur_scale = if next_scale == 0 { last_scale } else { next_scale };
        *slot = cur_scale as u8;
        last_scale = cur_scale;
    }
    Ok(use_default)
}

/// 解析 VUI 参数
fn parse_vui(br: &mut BitReader) -> AvcResult<VuiParameters> {
    let mut vui = VuiParameters {
        sar: (0, 1),
        ..VuiParameters::default()
    };

    if br.read_flag()? {
        let ar_idc = br.read_bits(8)? as usize;
        if ar_idc == 255 {
            let sar_w = br.read_bits(16)?;
            let sar_h = br.read_bits(16)?;
            if sar_w == 0 || sar_h == 0 {
                return Err(AvcError::InvalidData(format!(
                    "H.264: VUI Extended_SAR 非法, sar_w={}, sar_h={}",
                    sar_w, sar_h
                )));
            }
            vui.sar = (sar_w, sar_h);
        } else if let Some(&sar) = SAR_TABLE.get(ar_idc) {
            vui.sar = sar;
        } else {
            return Err(AvcError::InvalidData(format!(
                "H.264: VUI aspect_ratio_idc 非法, value={}",
                ar_idc
            )));
        }
    }

    // overscan_info_present_flag
    if br.read_flag()? {
        br.skip_bits(1)?;
    }

    // video_signal_type_present_flag
    if br.read_flag()? {
        br.skip_bits(3)?; // video_format
        vui.full_range = br.read_flag()?;
        if br.read_flag()? {
            vui.colour_description = Some((
                br.read_bits(8)? as u8,
                br.read_bits(8)? as u8,
                br.read_bits(8)? as u8,
            ));
        }
    }

    // chroma_loc_info_present_flag
    if br.read_flag()? {
        br.read_ue()?;
        br.read_ue()?;
    }

    if br.read_flag()? {
        let num_units = br.read_bits(32)?;
        let time_scale = br.read_bits(32)?;
        if num_units == 0 {
            return Err(AvcError::InvalidData(
                "H.264: VUI num_units_in_tick 不能为 0".into(),
            ));
        }
        if time_scale == 0 {
            return Err(AvcError::InvalidData("H.264: VUI time_scale 不能为 0".into()));
        }
        vui.timing = Some((num_units, time_scale));
        vui.fixed_frame_rate = br.read_flag()?;
    }

    vui.nal_hrd_present = br.read_flag()?;
    if vui.nal_hrd_present {
        skip_hrd_parameters(br)?;
    }
    vui.vcl_hrd_present = br.read_flag()?;
    if vui.vcl_hrd_present {
        skip_hrd_parameters(br)?;
    }
    if vui.nal_hrd_present || vui.vcl_hrd_present {
        br.skip_bits(1)?; // low_delay_hrd_flag
    }
    vui.pic_struct_present = br.read_flag()?;

    // bitstream_restriction_flag
    if br.read_flag()? {
        br.skip_bits(1)?; // motion_vectors_over_pic_boundaries_flag
        for _ in 0..4 {
            // max_bytes_per_pic_denom .. log2_max_mv_length_vertical
            br.read_ue()?;
        }
        br.read_ue()?; // max_num_reorder_frames
        vui.max_dec_frame_buffering = Some(br.read_ue()?);
    }

    Ok(vui)
}

fn skip_hrd_parameters(br: &mut BitReader) -> AvcResult<()> {
    let cpb_cnt = br.read_ue()?.saturating_add(1);
    if cpb_cnt > 32 {
        return Err(AvcError::InvalidData(format!(
            "H.264: VUI cpb_cnt_minus1 超出范围, value={}",
            cpb_cnt - 1
        )));
    }
    br.skip_bits(8)?; // bit_rate_scale + cpb_size_scale
    for _ in 0..cpb_cnt {
        br.read_ue()?; // bit_rate_value_minus1
        br.read_ue()?; // cpb_size_value_minus1
        br.skip_bits(1)?; // cbr_flag
    }
    br.skip_bits(20)?; // 4 个 5 位长度字段
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use avcsyn_core::BitWriter;

    /// 测试用 SPS 构造器
    struct SpsBuilder {
        profile_idc: u8,
        sps_id: u32,
        chroma_format_idc: u32,
        bit_depth_luma_minus8: u32,
        poc_type: u32,
        poc_cycle: u32,
        max_num_ref_frames: u32,
        width_mbs: u32,
        height_map_units: u32,
        frame_mbs_only: bool,
        mbaff: bool,
        crop: Option<(u32, u32, u32, u32)>,
        vui: Option<(u32, Option<(u32, u32)>, Option<(u32, u32)>)>,
    }

    impl Default for SpsBuilder {
        fn default() -> Self {
            Self {
                profile_idc: 66,
                sps_id: 0,
                chroma_format_idc: 1,
                bit_depth_luma_minus8: 0,
                poc_type: 0,
                poc_cycle: 0,
                max_num_ref_frames: 4,
                width_mbs: 120,
                height_map_units: 68,
                frame_mbs_only: true,
                mbaff: false,
                crop: Some((0, 0, 0, 4)),
                vui: None,
            }
        }
    }

    impl SpsBuilder {
        fn build(&self) -> Vec<u8> {
            let mut bw = BitWriter::new();
            bw.write_bits(u32::from(self.profile_idc), 8);
            bw.write_bits(0, 8);
            bw.write_bits(40, 8);
            bw.write_ue(self.sps_id);
            if has_chroma_info(self.profile_idc) {
                bw.write_ue(self.chroma_format_idc);
                if self.chroma_format_idc == 3 {
                    bw.write_flag(false);
                }
                bw.write_ue(self.bit_depth_luma_minus8);
                bw.write_ue(0);
                bw.write_flag(false);
                bw.write_flag(false);
            }
            bw.write_ue(0);
            bw.write_ue(self.poc_type);
            match self.poc_type {
                0 => bw.write_ue(0),
                1 => {
                    bw.write_flag(false);
                    bw.write_se(0);
                    bw.write_se(0);
                    bw.write_ue(self.poc_cycle);
                    for i in 0..self.poc_cycle.min(300) {
                        bw.write_se(i as i32);
                    }
                }
                _ => {}
            }
            bw.write_ue(self.max_num_ref_frames);
            bw.write_flag(false);
            bw.write_ue(self.width_mbs - 1);
            bw.write_ue(self.height_map_units - 1);
            bw.write_flag(self.frame_mbs_only);
            if !self.frame_mbs_only {
                bw.write_flag(self.mbaff);
            }
            bw.write_flag(true);
            match self.crop {
                Some((l, r, t, b)) => {
                    bw.write_flag(true);
                    bw.write_ue(l);
                    bw.write_ue(r);
                    bw.write_ue(t);
                    bw.write_ue(b);
                }
                None => bw.write_flag(false),
            }
            match self.vui {
                Some((ar_idc, ext_sar, timing)) => {
                    bw.write_flag(true);
                    bw.write_flag(true);
                    bw.write_bits(ar_idc, 8);
                    if let Some((w, h)) = ext_sar {
                        bw.write_bits(w, 16);
                        bw.write_bits(h, 16);
                    }
                    bw.write_flag(false); // overscan
                    bw.write_flag(false); // video_signal_type
                    bw.write_flag(false); // chroma_loc
                    match timing {
                        Some((units, scale)) => {
                            bw.write_flag(true);
                            bw.write_bits(units, 32);
                            bw.write_bits(scale, 32);
                            bw.write_flag(true);
                        }
                        None => bw.write_flag(false),
                    }
                    bw.write_flag(false); // nal_hrd
                    bw.write_flag(false); // vcl_hrd
                    bw.write_flag(false); // pic_struct
                    bw.write_flag(true); // bitstream_restriction
                    bw.write_flag(true);
                    for _ in 0..5 {
                        bw.write_ue(1);
                    }
                    bw.write_ue(3);
                }
                None => bw.write_flag(false),
            }
            bw.write_trailing_bits();
            bw.finish()
        }
    }

    #[test]
    fn test_sps_baseline_1080p() {
        let sps = parse_sps(&SpsBuilder::default().build()).expect("SPS 解析失败");
        assert_eq!(sps.profile_idc, 66);
        assert_eq!(sps.width, 1920);
        assert_eq!(sps.height, 1080);
        assert_eq!(sps.chroma_array_type(), 1);
        assert_eq!(sps.mb_chroma_size(), (8, 8));
        assert_eq!(sps.frame_size_in_mbs(), 120 * 68);
        assert_eq!(sps.qp_bd_offset_y(), 0);
        assert!(sps.vui.is_none());
    }

    #[test]
    fn test_sps_high_422_10bit() {
        let sps = parse_sps(
            &SpsBuilder {
                profile_idc: 122,
                chroma_format_idc: 2,
                bit_depth_luma_minus8: 2,
                crop: None,
                ..SpsBuilder::default()
            }
            .build(),
        )
        .expect("High 4:2:2 SPS 解析失败");
        assert_eq!(sps.chroma_array_type(), 2);
        assert_eq!(sps.chroma_subsampling(), Some((2, 1)));
        assert_eq!(sps.mb_chroma_size(), (8, 16));
        assert_eq!(sps.bit_depth_luma, 10);
        assert_eq!(sps.qp_bd_offset_y(), 12);
    }

    #[test]
    fn test_sps_mbaff_field_geometry() {
        let sps = parse_sps(
            &SpsBuilder {
                frame_mbs_only: false,
                mbaff: true,
                height_map_units: 34,
                crop: None,
                ..SpsBuilder::default()
            }
            .build(),
        )
        .expect("MBAFF SPS 解析失败");
        assert!(sps.mb_adaptive_frame_field);
        assert_eq!(sps.frame_height_in_mbs(), 68);
        assert_eq!(sps.height, 1088);
        assert_eq!(sps.pic_size_in_map_units(), 120 * 34);
    }

    #[test]
    fn test_sps_vui_timing_and_sar() {
        let sps = parse_sps(
            &SpsBuilder {
                vui: Some((255, Some((4, 3)), Some((1001, 60000)))),
                ..SpsBuilder::default()
            }
            .build(),
        )
        .expect("带 VUI 的 SPS 解析失败");
        let vui = sps.vui.expect("应解析出 VUI");
        assert_eq!(vui.sar, (4, 3));
        assert_eq!(vui.frame_rate(), Some((60000, 2002)));
        assert!(vui.fixed_frame_rate);
        assert_eq!(vui.max_dec_frame_buffering, Some(3));
    }

    #[test]
    fn test_sps_rbsp_too_short() {
        assert!(parse_sps(&[0x42]).is_err());
    }

    #[test]
    fn test_sps_reject_sps_id_out_of_range() {
        let rbsp = SpsBuilder {
            sps_id: 32,
            ..SpsBuilder::default()
        }
        .build();
        let err = parse_sps(&rbsp).expect_err("sps_id 超范围应失败");
        let msg = format!("{}", err);
        assert!(msg.contains("sps_id"), "错误信息应包含 sps_id, actual={}", msg);
    }

    #[test]
    fn test_sps_reject_invalid_poc_type() {
        let rbsp = SpsBuilder {
            poc_type: 3,
            ..SpsBuilder::default()
        }
        .build();
        let err = parse_sps(&rbsp).expect_err("poc_type 非法应失败");
        let msg = format!("{}", err);
        assert!(
            msg.contains("pic_order_cnt_type"),
            "错误信息应包含 pic_order_cnt_type, actual={}",
            msg
        );
    }

    #[test]
    fn test_sps_reject_too_many_ref_frames() {
        let rbsp = SpsBuilder {
            max_num_ref_frames: 17,
            ..SpsBuilder::default()
        }
        .build();
        let err = parse_sps(&rbsp).expect_err("max_num_ref_frames 超范围应失败");
        assert!(matches!(err, AvcError::InvalidData(_)));
    }

    #[test]
    fn test_sps_reject_invalid_chroma_format_idc() {
        let rbsp = SpsBuilder {
            profile_idc: 100,
            chroma_format_idc: 4,
            ..SpsBuilder::default()
        }
        .build();
        let err = parse_sps(&rbsp).expect_err("chroma_format_idc 非法应失败");
        let msg = format!("{}", err);
        assert!(
            msg.contains("chroma_format_idc"),
            "错误信息应包含 chroma_format_idc, actual={}",
            msg
        );
    }

    #[test]
    fn test_sps_poc_type1_cycle() {
        let sps = parse_sps(
            &SpsBuilder {
                poc_type: 1,
                poc_cycle: 3,
                ..SpsBuilder::default()
            }
            .build(),
        )
        .expect("poc_type1 SPS 解析失败");
        assert_eq!(sps.offset_for_ref_frame, vec![0, 1, 2]);

        let err = parse_sps(
            &SpsBuilder {
                poc_type: 1,
                poc_cycle: 256,
                ..SpsBuilder::default()
            }
            .build(),
        )
        .expect_err("num_ref_frames_in_pic_order_cnt_cycle 超范围应失败");
        let msg = format!("{}", err);
        assert!(
            msg.contains("num_ref_frames_in_pic_order_cnt_cycle"),
            "错误信息应包含 num_ref_frames_in_pic_order_cnt_cycle, actual={}",
            msg
        );
    }

    #[test]
    fn test_sps_reject_invalid_crop() {
        let rbsp = SpsBuilder {
            crop: Some((0, 0, 0, 1000)),
            ..SpsBuilder::default()
        }
        .build();
        let err = parse_sps(&rbsp).expect_err("裁剪超过图像高度应失败");
        let msg = format!("{}", err);
        assert!(msg.contains("裁剪"), "错误信息应包含 裁剪, actual={}", msg);
    }

    #[test]
    fn test_sps_reject_invalid_vui_aspect_ratio_idc() {
        let rbsp = SpsBuilder {
            vui: Some((17, None, None)),
            ..SpsBuilder::default()
        }
        .build();
        let err = parse_sps(&rbsp).expect_err("非法 aspect_ratio_idc 应失败");
        let msg = format!("{}", err);
        assert!(
            msg.contains("aspect_ratio_idc"),
            "错误信息应包含 aspect_ratio_idc, actual={}",
            msg
        );
    }

    #[test]
    fn test_sps_reject_zero_time_scale() {
        let rbsp = SpsBuilder {
            vui: Some((1, None, Some((1001, 0)))),
            ..SpsBuilder::default()
        }
        .build();
        let err = parse_sps(&rbsp).expect_err("time_scale=0 应失败");
        let msg = format!("{}", err);
        assert!(msg.contains("time_scale"), "错误信息应包含 time_scale, actual={}", msg);
    }

    #[test]
    fn test_truncated_sps_is_stream_exhaustion() {
        let rbsp = SpsBuilder::default().build();
        let err = parse_sps(&rbsp[..4]).expect_err("截断的 SPS 应失败");
        assert!(matches!(err, AvcError::StreamExhaustion(_)));
    }

    #[test]
    fn test_scaling_list_use_default_flag() {
        // delta_scale = -8 使 nextScale 在首个位置为 0
        let mut bw = BitWriter::new();
        bw.write_se(-8);
        bw.write_trailing_bits();
        let data = bw.finish();
        let mut br = BitReader::new(&data);
        let mut list = [0u8; 16];
        assert!(read_scaling_list(&mut br, &mut list).expect("读取量化矩阵失败"));
    }
}
