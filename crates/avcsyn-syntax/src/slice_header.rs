//! Slice header 解析 (H.264 7.3.3).
//!
//! 解析结束时比特源停在 slice_data 起始位置; CABAC 模式下已经消耗
//! cabac_alignment_one_bit.

use std::sync::Arc;

use avcsyn_core::{AvcError, AvcResult, BitSource};

use crate::nal::{NalHeaderExtension, NalUnit, NalUnitType};
use crate::pps::Pps;
use crate::slice_group::{SliceGroupMapType, change_cycle_bits};
use crate::sps::Sps;

/// MMCO 操作数量上限
const MAX_MMCO_OPS: usize = 64;

/// 单个列表的参考列表修改项上限
const MAX_LIST_MODS: usize = 96;

/// slice 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceType {
    /// P
    P,
    /// B
    B,
    /// I
    I,
    /// SP
    Sp,
    /// SI
    Si,
}

impl SliceType {
    /// 从 slice_type 原始值 (0..=9) 解析
    pub fn from_raw(raw: u32) -> AvcResult<Self> {
        match raw % 5 {
            _ if raw > 9 => Err(AvcError::InvalidData(format!(
                "H.264: slice_type 非法, value={}",
                raw
            ))),
            0 => Ok(SliceType::P),
            1 => Ok(SliceType::B),
            2 => Ok(SliceType::I),
            3 => Ok(SliceType::Sp),
            _ => Ok(SliceType::Si),
        }
    }

    /// I 或 SI
    pub fn is_intra(self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }

    /// B
    pub fn is_b(self) -> bool {
        self == SliceType::B
    }

    /// P 或 SP
    pub fn is_p_like(self) -> bool {
        matches!(self, SliceType::P | SliceType::Sp)
    }
}

impl std::fmt::Display for SliceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SliceType::P => "P",
            SliceType::B => "B",
            SliceType::I => "I",
            SliceType::Sp => "SP",
            SliceType::Si => "SI",
        };
        f.write_str(name)
    }
}

/// 参考列表修改项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefPicListMod {
    /// modification_of_pic_nums_idc = 0
    ShortTermSub {
        /// abs_diff_pic_num_minus1
        abs_diff_pic_num_minus1: u32,
    },
    /// modification_of_pic_nums_idc = 1
    ShortTermAdd {
        /// abs_diff_pic_num_minus1
        abs_diff_pic_num_minus1: u32,
    },
    /// modification_of_pic_nums_idc = 2
    LongTerm {
        /// long_term_pic_num
        long_term_pic_num: u32,
    },
    /// modification_of_pic_nums_idc = 4 (仅 MVC)
    ViewIdxSub {
        /// abs_diff_view_idx_minus1
        abs_diff_view_idx_minus1: u32,
    },
    /// modification_of_pic_nums_idc = 5 (仅 MVC)
    ViewIdxAdd {
        /// abs_diff_view_idx_minus1
        abs_diff_view_idx_minus1: u32,
    },
}

/// 单个参考帧的加权预测参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredWeight {
    pub luma_weight: i32,
    pub luma_offset: i32,
    pub chroma_weight: [i32; 2],
    pub chroma_offset: [i32; 2],
    /// luma_weight_lX_flag
    pub luma_present: bool,
    /// chroma_weight_lX_flag
    pub chroma_present: bool,
}

/// pred_weight_table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,
    pub l0: Vec<PredWeight>,
    pub l1: Vec<PredWeight>,
}

/// 自适应参考帧标记操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcoOp {
    /// 1: 短期参考标记为不参考
    ForgetShort { difference_of_pic_nums_minus1: u32 },
    /// 2: 长期参考标记为不参考
    ForgetLong { long_term_pic_num: u32 },
    /// 3: 短期转长期
    ConvertShortToLong {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },
    /// 4: 设置最大长期帧索引
    TrimLong { max_long_term_frame_idx_plus1: u32 },
    /// 5: 清空全部参考
    ClearAll,
    /// 6: 当前图像标记为长期
    MarkCurrentLong { long_term_frame_idx: u32 },
}

/// dec_ref_pic_marking
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecRefPicMarking {
    pub is_idr: bool,
    pub no_output_of_prior_pics: bool,
    pub long_term_reference_flag: bool,
    /// adaptive_ref_pic_marking_mode_flag
    pub adaptive: bool,
    pub ops: Vec<MmcoOp>,
}

/// 解析后的 slice header
#[derive(Debug, Clone)]
pub struct SliceHeader {
    /// 激活的 SPS
    pub sps: Arc<Sps>,
    /// 激活的 PPS
    pub pps: Arc<Pps>,
    pub nal_type: NalUnitType,
    pub nal_ref_idc: u8,
    /// IdrPicFlag (MVC 扩展 NAL 取 !non_idr_flag)
    pub idr: bool,
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    /// slice_type 原始值 >= 5 (图像内所有 slice 类型相同)
    pub slice_type_fixed: bool,
    pub pps_id: u32,
    pub colour_plane_id: Option<u8>,
    pub frame_num: u32,
    pub field_pic: bool,
    pub bottom_field: bool,
    pub idr_pic_id: Option<u32>,
    pub pic_order_cnt_lsb: Option<u32>,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
    pub direct_spatial_mv_pred: bool,
    pub num_ref_idx_l0_active: u32,
    pub num_ref_idx_l1_active: u32,
    pub ref_pic_list_mod_l0: Vec<RefPicListMod>,
    pub ref_pic_list_mod_l1: Vec<RefPicListMod>,
    pub pred_weight_table: Option<PredWeightTable>,
    pub dec_ref_pic_marking: Option<DecRefPicMarking>,
    pub cabac_init_idc: Option<u8>,
    pub slice_qp_delta: i32,
    /// SliceQPY
    pub slice_qp: i32,
    pub sp_for_switch: bool,
    /// QSY (仅 SP/SI)
    pub slice_qs: Option<i32>,
    pub disable_deblocking_filter_idc: u32,
    pub slice_alpha_c0_offset_div2: i32,
    pub slice_beta_offset_div2: i32,
    pub slice_group_change_cycle: Option<u32>,
    /// slice_data 在 RBSP 中的起始位偏移
    pub data_bit_offset: usize,
}

impl SliceHeader {
    /// MbaffFrameFlag
    pub fn mbaff(&self) -> bool {
        self.sps.mb_adaptive_frame_field && !self.field_pic
    }

    /// PicWidthInMbs
    pub fn pic_width_in_mbs(&self) -> u32 {
        self.sps.pic_width_in_mbs
    }

    /// PicHeightInMbs
    pub fn pic_height_in_mbs(&self) -> u32 {
        self.sps.frame_height_in_mbs() / if self.field_pic { 2 } else { 1 }
    }

    /// PicSizeInMbs
    pub fn pic_size_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs() * self.pic_height_in_mbs()
    }

    /// 第一个宏块的地址 (MBAFF 下为宏块对顶部地址)
    pub fn first_mb_addr(&self) -> u32 {
        self.first_mb_in_slice * if self.mbaff() { 2 } else { 1 }
    }

    /// ChromaArrayType
    pub fn chroma_array_type(&self) -> u32 {
        self.sps.chroma_array_type()
    }
}

/// 从 slice_layer RBSP 起始位置解析 slice header
///
/// `resolve` 根据 pps_id 返回 PPS 及其引用的 SPS.
pub fn parse_slice_header<S, F>(br: &mut S, nal: &NalUnit, resolve: F) -> AvcResult<SliceHeader>
where
    S: BitSource + ?Sized,
    F: FnOnce(u32) -> Option<(Arc<Sps>, Arc<Pps>)>,
{
    let first_mb_in_slice = br.read_ue()?;
    let slice_type_raw = br.read_ue()?;
    let slice_type = SliceType::from_raw(slice_type_raw)?;
    let pps_id = br.read_ue()?;
    if pps_id > 255 {
        return Err(AvcError::InvalidData(format!(
            "H.264: slice pps_id 超出范围, pps_id={}",
            pps_id
        )));
    }
    let (sps, pps) = resolve(pps_id).ok_or_else(|| {
        AvcError::InvalidData(format!("H.264: 未找到 PPS 或其 SPS, pps_id={}", pps_id))
    })?;

    let idr = match nal.extension {
        Some(NalHeaderExtension::Mvc { non_idr, .. }) => !non_idr,
        _ => nal.nal_type.is_idr(),
    };
    if idr && !slice_type.is_intra() {
        return Err(AvcError::InvalidData(format!(
            "H.264: IDR slice 类型必须为 I/SI, slice_type={}",
            slice_type_raw
        )));
    }

    let colour_plane_id = if sps.separate_colour_plane {
        let id = br.read_bits(2)?;
        if id > 2 {
            return Err(AvcError::InvalidData(format!(
                "H.264: colour_plane_id 非法, value={}",
                id
            )));
        }
        Some(id as u8)
    } else {
        None
    };

    let frame_num = br.read_bits(sps.log2_max_frame_num)?;

    let mut field_pic = false;
    let mut bottom_field = false;
    if !sps.frame_mbs_only {
        field_pic = br.read_flag()?;
        if field_pic {
            bottom_field = br.read_flag()?;
        }
    }

    let mbaff = sps.mb_adaptive_frame_field && !field_pic;
    let pic_size_in_mbs =
        sps.pic_width_in_mbs * (sps.frame_height_in_mbs() / if field_pic { 2 } else { 1 });
    let first_mb_addr = u64::from(first_mb_in_slice) * if mbaff { 2 } else { 1 };
    if first_mb_addr >= u64::from(pic_size_in_mbs) {
        return Err(AvcError::InvalidData(format!(
            "H.264: first_mb_in_slice 超出范围, value={}, pic_size_in_mbs={}",
            first_mb_in_slice, pic_size_in_mbs
        )));
    }

    let idr_pic_id = if idr {
        let id = br.read_ue()?;
        if id > 65535 {
            return Err(AvcError::InvalidData(format!(
                "H.264: idr_pic_id 超出范围, value={}",
                id
            )));
        }
        Some(id)
    } else {
        None
    };

    let mut pic_order_cnt_lsb = None;
    let mut delta_pic_order_cnt_bottom = 0;
    let mut delta_pic_order_cnt = [0i32; 2];
    if sps.poc_type == 0 {
        pic_order_cnt_lsb = Some(br.read_bits(sps.log2_max_poc_lsb)?);
        if pps.pic_order_present && !field_pic {
            delta_pic_order_cnt_bottom = br.read_se()?;
        }
    } else if sps.poc_type == 1 && !sps.delta_pic_order_always_zero_flag {
        delta_pic_order_cnt[0] = br.read_se()?;
        if pps.pic_order_present && !field_pic {
            delta_pic_order_cnt[1] = br.read_se()?;
        }
    }

    let mut redundant_pic_cnt = 0;
    if pps.redundant_pic_cnt_present {
        redundant_pic_cnt = br.read_ue()?;
        if redundant_pic_cnt > 127 {
            return Err(AvcError::InvalidData(format!(
                "H.264: redundant_pic_cnt 超出范围, value={}",
                redundant_pic_cnt
            )));
        }
    }

    let mut direct_spatial_mv_pred = false;
    if slice_type.is_b() {
        direct_spatial_mv_pred = br.read_flag()?;
    }

    let mut num_ref_idx_l0_active = pps.num_ref_idx_l0_default_active;
    let mut num_ref_idx_l1_active = pps.num_ref_idx_l1_default_active;
    if slice_type.is_p_like() || slice_type.is_b() {
        if br.read_flag()? {
            num_ref_idx_l0_active = br.read_ue()?.saturating_add(1);
            if slice_type.is_b() {
                num_ref_idx_l1_active = br.read_ue()?.saturating_add(1);
            }
        }
        let max_refs = if field_pic { 32 } else { 16 };
        if num_ref_idx_l0_active > max_refs {
            return Err(AvcError::InvalidData(format!(
                "H.264: num_ref_idx_l0_active_minus1 非法, value={}",
                num_ref_idx_l0_active - 1
            )));
        }
        if slice_type.is_b() && num_ref_idx_l1_active > max_refs {
            return Err(AvcError::InvalidData(format!(
                "H.264: num_ref_idx_l1_active_minus1 非法, value={}",
                num_ref_idx_l1_active - 1
            )));
        }
    }
    if !slice_type.is_b() {
        num_ref_idx_l1_active = 0;
    }
    if slice_type.is_intra() {
        num_ref_idx_l0_active = 0;
    }

    let limits = RefLimits::new(&sps, field_pic);
    let mvc = nal.is_mvc_slice();
    let mut ref_pic_list_mod_l0 = Vec::new();
    let mut ref_pic_list_mod_l1 = Vec::new();
    if !slice_type.is_intra() {
        if br.read_flag()? {
            ref_pic_list_mod_l0 = parse_ref_pic_list_mod(br, &limits, mvc)?;
        }
        if slice_type.is_b() && br.read_flag()? {
            ref_pic_list_mod_l1 = parse_ref_pic_list_mod(br, &limits, mvc)?;
        }
    }

    let use_weights = (pps.weighted_pred && slice_type.is_p_like())
        || (pps.weighted_bipred_idc == 1 && slice_type.is_b());
    let pred_weight_table = if use_weights {
        Some(parse_pred_weight_table(
            br,
            sps.chroma_array_type(),
            slice_type,
            num_ref_idx_l0_active,
            num_ref_idx_l1_active,
        )?)
    } else {
        None
    };

    let dec_ref_pic_marking = if nal.ref_idc != 0 {
        Some(parse_dec_ref_pic_marking(br, idr, &limits)?)
    } else {
        None
    };

    let mut cabac_init_idc = None;
    if pps.is_cabac() && !slice_type.is_intra() {
        let idc = br.read_ue()?;
        if idc > 2 {
            return Err(AvcError::InvalidData(format!(
                "H.264: cabac_init_idc 非法, value={}",
                idc
            )));
        }
        cabac_init_idc = Some(idc as u8);
    }

    let slice_qp_delta = br.read_se()?;
    let slice_qp = pps.pic_init_qp + slice_qp_delta;
    let qp_bd_offset = sps.qp_bd_offset_y();
    if !(-qp_bd_offset..=51).contains(&slice_qp) {
        return Err(AvcError::InvalidData(format!(
            "H.264: slice_qp 超出范围, slice_qp={}",
            slice_qp
        )));
    }

    let mut sp_for_switch = false;
    let mut slice_qs = None;
    if matches!(slice_type, SliceType::Sp | SliceType::Si) {
        if slice_type == SliceType::Sp {
            sp_for_switch = br.read_flag()?;
        }
        let qs = pps.pic_init_qs + br.read_se()?;
        if !(0..=51).contains(&qs) {
            return Err(AvcError::InvalidData(format!(
                "H.264: slice_qs 超出范围, slice_qs={}",
                qs
            )));
        }
        slice_qs = Some(qs);
    }

    let mut disable_deblocking_filter_idc = 0;
    let mut slice_alpha_c0_offset_div2 = 0;
    let mut slice_beta_offset_div2 = 0;
    if pps.deblocking_filter_control {
        disable_deblocking_filter_idc = br.read_ue()?;
        if disable_deblocking_filter_idc > 2 {
            return Err(AvcError::InvalidData(format!(
                "H.264: disable_deblocking_filter_idc 非法, value={}",
                disable_deblocking_filter_idc
            )));
        }
        if disable_deblocking_filter_idc != 1 {
            slice_alpha_c0_offset_div2 = read_filter_offset(br, "slice_alpha_c0_offset_div2")?;
            slice_beta_offset_div2 = read_filter_offset(br, "slice_beta_offset_div2")?;
        }
    }

    let mut slice_group_change_cycle = None;
    let evolving_rate = pps
        .slice_groups
        .as_ref()
        .filter(|groups| matches!(groups.map_type, SliceGroupMapType::Evolving { .. }))
        .and_then(|groups| groups.change_rate());
    if let Some(rate) = evolving_rate {
        let pic_size_in_map_units = sps.pic_size_in_map_units();
        let bits = change_cycle_bits(pic_size_in_map_units, rate);
        let cycle = br.read_bits(bits)?;
        let max_cycle = pic_size_in_map_units.div_ceil(rate.max(1));
        if cycle > max_cycle {
            return Err(AvcError::InvalidData(format!(
                "H.264: slice_group_change_cycle 超出范围, value={}, max={}",
                cycle, max_cycle
            )));
        }
        slice_group_change_cycle = Some(cycle);
    }

    if pps.is_cabac() {
        while !br.is_byte_aligned() {
            if br.read_bit()? != 1 {
                return Err(AvcError::StructuralViolation(format!(
                    "H.264: cabac_alignment_one_bit 必须为 1, bit_pos={}",
                    br.bits_read() - 1
                )));
            }
        }
    }
    let data_bit_offset = br.bits_read();

    Ok(SliceHeader {
        sps,
        pps,
        nal_type: nal.nal_type,
        nal_ref_idc: nal.ref_idc,
        idr,
        first_mb_in_slice,
        slice_type,
        slice_type_fixed: slice_type_raw >= 5,
        pps_id,
        colour_plane_id,
        frame_num,
        field_pic,
        bottom_field,
        idr_pic_id,
        pic_order_cnt_lsb,
        delta_pic_order_cnt_bottom,
        delta_pic_order_cnt,
        redundant_pic_cnt,
        direct_spatial_mv_pred,
        num_ref_idx_l0_active,
        num_ref_idx_l1_active,
        ref_pic_list_mod_l0,
        ref_pic_list_mod_l1,
        pred_weight_table,
        dec_ref_pic_marking,
        cabac_init_idc,
        slice_qp_delta,
        slice_qp,
        sp_for_switch,
        slice_qs,
        disable_deblocking_filter_idc,
        slice_alpha_c0_offset_div2,
        slice_beta_offset_div2,
        slice_group_change_cycle,
        data_bit_offset,
    })
}

fn read_filter_offset<S: BitSource + ?Sized>(br: &mut S, field: &str) -> AvcResult<i32> {
    let value = br.read_se()?;
    if !(-6..=6).contains(&value) {
        return Err(AvcError::InvalidData(format!(
            "H.264: {} 超出范围, value={}",
            field, value
        )));
    }
    Ok(value)
}

/// 参考图像编号相关的取值上限
struct RefLimits {
    /// MaxPicNum - 1
    max_abs_diff_pic_num_minus1: u32,
    /// 长期图像编号上限
    max_long_term_pic_num: u32,
    /// 长期帧索引上限
    max_long_term_frame_idx: u32,
    max_num_ref_frames: u32,
}

impl RefLimits {
    fn new(sps: &Sps, field_pic: bool) -> Self {
        let max_frame_num = 1u32.checked_shl(sps.log2_max_frame_num).unwrap_or(u32::MAX);
        let max_pic_num = if field_pic {
            max_frame_num.saturating_mul(2)
        } else {
            max_frame_num
        };
        let max_num_ref_frames = sps.max_num_ref_frames.max(1);
        let max_long_term_pic_num = if field_pic {
            2 * max_num_ref_frames + 1
        } else {
            max_num_ref_frames - 1
        };
        Self {
            max_abs_diff_pic_num_minus1: max_pic_num.saturating_sub(1),
            max_long_term_pic_num,
            max_long_term_frame_idx: max_num_ref_frames - 1,
            max_num_ref_frames,
        }
    }
}

/// ref_pic_list_modification / ref_pic_list_mvc_modification 的单个列表
fn parse_ref_pic_list_mod<S: BitSource + ?Sized>(
    br: &mut S,
    limits: &RefLimits,
    mvc: bool,
) -> AvcResult<Vec<RefPicListMod>> {
    let mut mods = Vec::new();
    loop {
        let idc = br.read_ue()?;
        let item = match idc {
            0 | 1 => {
                let abs_diff_pic_num_minus1 = br.read_ue()?;
                if abs_diff_pic_num_minus1 > limits.max_abs_diff_pic_num_minus1 {
                    return Err(AvcError::InvalidData(format!(
                        "H.264: ref_pic_list_modification abs_diff_pic_num_minus1 超范围, value={}, max={}",
                        abs_diff_pic_num_minus1, limits.max_abs_diff_pic_num_minus1
                    )));
                }
                if idc == 0 {
                    RefPicListMod::ShortTermSub {
                        abs_diff_pic_num_minus1,
                    }
                } else {
                    RefPicListMod::ShortTermAdd {
                        abs_diff_pic_num_minus1,
                    }
                }
            }
            2 => {
                let long_term_pic_num = br.read_ue()?;
                if long_term_pic_num > limits.max_long_term_pic_num {
                    return Err(AvcError::InvalidData(format!(
                        "H.264: ref_pic_list_modification long_term_pic_num 超范围, value={}, max={}",
                        long_term_pic_num, limits.max_long_term_pic_num
                    )));
                }
                RefPicListMod::LongTerm { long_term_pic_num }
            }
            3 => break,
            4 | 5 if mvc => {
                let abs_diff_view_idx_minus1 = br.read_ue()?;
                if abs_diff_view_idx_minus1 > 1023 {
                    return Err(AvcError::InvalidData(format!(
                        "H.264: abs_diff_view_idx_minus1 超范围, value={}",
                        abs_diff_view_idx_minus1
                    )));
                }
                if idc == 4 {
                    RefPicListMod::ViewIdxSub {
                        abs_diff_view_idx_minus1,
                    }
                } else {
                    RefPicListMod::ViewIdxAdd {
                        abs_diff_view_idx_minus1,
                    }
                }
            }
            _ => {
                return Err(AvcError::InvalidData(format!(
                    "H.264: modification_of_pic_nums_idc 非法, value={}",
                    idc
                )));
            }
        };
        mods.push(item);
        if mods.len() > MAX_LIST_MODS {
            return Err(AvcError::InvalidData(
                "H.264: ref_pic_list_modification 项数过多".into(),
            ));
        }
    }
    Ok(mods)
}

fn parse_pred_weight_table<S: BitSource + ?Sized>(
    br: &mut S,
    chroma_array_type: u32,
    slice_type: SliceType,
    num_ref_idx_l0: u32,
    num_ref_idx_l1: u32,
) -> AvcResult<PredWeightTable> {
    let luma_log2_weight_denom = read_weight_denom(br, "luma_log2_weight_denom")?;
    let chroma_log2_weight_denom = if chroma_array_type != 0 {
        read_weight_denom(br, "chroma_log2_weight_denom")?
    } else {
        0
    };

    let mut table = PredWeightTable {
        luma_log2_weight_denom,
        chroma_log2_weight_denom,
        ..Default::default()
    };
    table.l0 = parse_weight_list(br, &table, chroma_array_type != 0, num_ref_idx_l0, 0)?;
    if slice_type.is_b() {
        table.l1 = parse_weight_list(br, &table, chroma_array_type != 0, num_ref_idx_l1, 1)?;
    }
    Ok(table)
}

fn read_weight_denom<S: BitSource + ?Sized>(br: &mut S, field: &str) -> AvcResult<u8> {
    let denom = br.read_ue()?;
    if denom > 7 {
        return Err(AvcError::InvalidData(format!(
            "H.264: {} 非法, value={}",
            field, denom
        )));
    }
    Ok(denom as u8)
}

fn parse_weight_list<S: BitSource + ?Sized>(
    br: &mut S,
    table: &PredWeightTable,
    chroma_present: bool,
    count: u32,
    list: usize,
) -> AvcResult<Vec<PredWeight>> {
    let mut weights = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut w = PredWeight {
            luma_weight: 1 << table.luma_log2_weight_denom,
            luma_offset: 0,
            chroma_weight: [1 << table.chroma_log2_weight_denom; 2],
            chroma_offset: [0, 0],
            luma_present: false,
            chroma_present: false,
        };
        if br.read_flag()? {
            w.luma_present = true;
            w.luma_weight = read_weight_value(br, "luma_weight", list, None)?;
            w.luma_offset = read_weight_value(br, "luma_offset", list, None)?;
        }
        if chroma_present && br.read_flag()? {
            w.chroma_present = true;
            for c in 0..2 {
                w.chroma_weight[c] = read_weight_value(br, "chroma_weight", list, Some(c))?;
                w.chroma_offset[c] = read_weight_value(br, "chroma_offset", list, Some(c))?;
            }
        }
        weights.push(w);
    }
    Ok(weights)
}

fn read_weight_value<S: BitSource + ?Sized>(
    br: &mut S,
    field: &str,
    list: usize,
    component: Option<usize>,
) -> AvcResult<i32> {
    let value = br.read_se()?;
    if !(-128..=127).contains(&value) {
        let name = match component {
            Some(c) => format!("{}_l{}[{}]", field, list, c),
            None => format!("{}_l{}", field, list),
        };
        return Err(AvcError::InvalidData(format!(
            "H.264: {} 超出范围, value={}",
            name, value
        )));
    }
    Ok(value)
}

fn parse_dec_ref_pic_marking<S: BitSource + ?Sized>(
    br: &mut S,
    idr: bool,
    limits: &RefLimits,
) -> AvcResult<DecRefPicMarking> {
    let mut marking = DecRefPicMarking::default();
    if idr {
        marking.is_idr = true;
        marking.no_output_of_prior_pics = br.read_flag()?;
        marking.long_term_reference_flag = br.read_flag()?;
        return Ok(marking);
    }

    marking.adaptive = br.read_flag()?;
    if !marking.adaptive {
        return Ok(marking);
    }

    loop {
        let op = br.read_ue()?;
        if op == 0 {
            break;
        }
        if marking.ops.len() >= MAX_MMCO_OPS {
            return Err(AvcError::InvalidData(format!(
                "H.264: MMCO 操作数量过多, max={}",
                MAX_MMCO_OPS
            )));
        }
        let item = match op {
            1 => MmcoOp::ForgetShort {
                difference_of_pic_nums_minus1: read_difference(br, limits, op)?,
            },
            2 => {
                let long_term_pic_num = br.read_ue()?;
                if long_term_pic_num > limits.max_long_term_pic_num {
                    return Err(AvcError::InvalidData(format!(
                        "H.264: MMCO2 long_term_pic_num 超范围, value={}, max={}",
                        long_term_pic_num, limits.max_long_term_pic_num
                    )));
                }
                MmcoOp::ForgetLong { long_term_pic_num }
            }
            3 => MmcoOp::ConvertShortToLong {
                difference_of_pic_nums_minus1: read_difference(br, limits, op)?,
                long_term_frame_idx: read_long_term_frame_idx(br, limits, op)?,
            },
            4 => {
                let max_long_term_frame_idx_plus1 = br.read_ue()?;
                if max_long_term_frame_idx_plus1 > limits.max_num_ref_frames {
                    return Err(AvcError::InvalidData(format!(
                        "H.264: MMCO4 max_long_term_frame_idx_plus1 超范围, value={}, max={}",
                        max_long_term_frame_idx_plus1, limits.max_num_ref_frames
                    )));
                }
                MmcoOp::TrimLong {
                    max_long_term_frame_idx_plus1,
                }
            }
            5 => MmcoOp::ClearAll,
            6 => MmcoOp::MarkCurrentLong {
                long_term_frame_idx: read_long_term_frame_idx(br, limits, op)?,
            },
            _ => {
                return Err(AvcError::InvalidData(format!(
                    "H.264: MMCO op 非法, op={}",
                    op
                )));
            }
        };
        marking.ops.push(item);
    }
    Ok(marking)
}

fn read_difference<S: BitSource + ?Sized>(
    br: &mut S,
    limits: &RefLimits,
    op: u32,
) -> AvcResult<u32> {
    let difference = br.read_ue()?;
    if difference > limits.max_abs_diff_pic_num_minus1 {
        return Err(AvcError::InvalidData(format!(
            "H.264: MMCO{} difference_of_pic_nums_minus1 超范围, value={}, max={}",
            op, difference, limits.max_abs_diff_pic_num_minus1
        )));
    }
    Ok(difference)
}

fn read_long_term_frame_idx<S: BitSource + ?Sized>(
    br: &mut S,
    limits: &RefLimits,
    op: u32,
) -> AvcResult<u32> {
    let idx = br.read_ue()?;
    if idx > limits.max_long_term_frame_idx {
        return Err(AvcError::InvalidData(format!(
            "H.264: MMCO{} long_term_frame_idx 超范围, value={}, max={}",
            op, idx, limits.max_long_term_frame_idx
        )));
    }
    Ok(idx)
}
