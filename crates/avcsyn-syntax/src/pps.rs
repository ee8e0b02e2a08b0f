//! H.264 PPS (Picture Parameter Set) 解析.

use avcsyn_core::{AvcError, AvcResult, BitReader, BitSource};

use crate::slice_group::SliceGroupParams;
use crate::sps::{
    DEFAULT_SCALING_4X4_INTER, DEFAULT_SCALING_4X4_INTRA, default_scaling_list_4x4_by_idx,
    default_scaling_list_8x8_by_idx, read_scaling_list,
};

/// PPS 量化矩阵: (4x4 六组, 8x8 若干组)
pub type PpsScalingLists = ([[u8; 16]; 6], Vec<[u8; 64]>);

/// PPS 解析结果
#[derive(Debug, Clone)]
pub struct Pps {
    /// pic_parameter_set_id
    pub pps_id: u32,
    /// 引用的 seq_parameter_set_id
    pub sps_id: u32,
    /// entropy_coding_mode_flag (true 为 CABAC)
    pub entropy_coding_mode: bool,
    /// bottom_field_pic_order_in_frame_present_flag
    pub pic_order_present: bool,
    /// slice group 参数, 仅有一个 slice group 时为 None
    pub slice_groups: Option<SliceGroupParams>,
    /// num_ref_idx_l0_default_active_minus1 + 1
    pub num_ref_idx_l0_default_active: u32,
    /// num_ref_idx_l1_default_active_minus1 + 1
    pub num_ref_idx_l1_default_active: u32,
    /// weighted_pred_flag
    pub weighted_pred: bool,
    /// weighted_bipred_idc
    pub weighted_bipred_idc: u32,
    /// 26 + pic_init_qp_minus26
    pub pic_init_qp: i32,
    /// 26 + pic_init_qs_minus26
    pub pic_init_qs: i32,
    /// chroma_qp_index_offset
    pub chroma_qp_index_offset: i32,
    /// deblocking_filter_control_present_flag
    pub deblocking_filter_control: bool,
    /// constrained_intra_pred_flag
    pub constrained_intra_pred: bool,
    /// redundant_pic_cnt_present_flag
    pub redundant_pic_cnt_present: bool,
    /// transform_8x8_mode_flag
    pub transform_8x8_mode: bool,
    /// 量化矩阵覆盖
    pub scaling_lists: Option<PpsScalingLists>,
    /// second_chroma_qp_index_offset (缺省等于 chroma_qp_index_offset)
    pub second_chroma_qp_index_offset: i32,
}

impl Pps {
    /// 是否为 CABAC
    pub fn is_cabac(&self) -> bool {
        self.entropy_coding_mode
    }

    /// slice group 数量
    pub fn num_slice_groups(&self) -> u32 {
        self.slice_groups.as_ref().map_or(1, |g| g.num_slice_groups)
    }
}

/// 从 RBSP 解析 PPS
///
/// `chroma_format_of` 根据 sps_id 返回对应 SPS 的 chroma_format_idc, 用于确定
/// 8x8 量化矩阵数量; 找不到 SPS 时按 4:2:0 处理.
pub fn parse_pps<F>(rbsp: &[u8], chroma_format_of: F) -> AvcResult<Pps>
where
    F: Fn(u32) -> Option<u32>,
{
    if rbsp.is_empty() {
        return Err(AvcError::InvalidData("H.264: PPS RBSP 为空".into()));
    }

    let mut br = BitReader::new(rbsp);
    let pps_id = br.read_ue()?;
    if pps_id > 255 {
        return Err(AvcError::InvalidData(format!(
            "H.264: pps_id 超出范围, pps_id={}",
            pps_id
        )));
    }
    let sps_id = br.read_ue()?;
    if sps_id > 31 {
        return Err(AvcError::InvalidData(format!(
            "H.264: sps_id 超出范围, sps_id={}",
            sps_id
        )));
    }

    let entropy_coding_mode = br.read_flag()?;
    let pic_order_present = br.read_flag()?;

    let num_slice_groups_minus1 = br.read_ue()?;
    if num_slice_groups_minus1 > 7 {
        return Err(AvcError::InvalidData(format!(
            "H.264: num_slice_groups_minus1 超出范围, value={}",
            num_slice_groups_minus1
        )));
    }
    let slice_groups = if num_slice_groups_minus1 > 0 {
        Some(SliceGroupParams::parse(&mut br, num_slice_groups_minus1)?)
    } else {
        None
    };

    let num_ref_idx_l0_default_active = read_num_ref_idx(&mut br, "l0")?;
    let num_ref_idx_l1_default_active = read_num_ref_idx(&mut br, "l1")?;

    let weighted_pred = br.read_flag()?;
    let weighted_bipred_idc = br.read_bits(2)?;
    if weighted_bipred_idc > 2 {
        return Err(AvcError::InvalidData(format!(
            "H.264: weighted_bipred_idc 非法, value={}",
            weighted_bipred_idc
        )));
    }

    let pic_init_qp = 26 + br.read_se()?;
    // 下限对应 14 位位深时的 -QpBdOffsetY
    if !(-36..=51).contains(&pic_init_qp) {
        return Err(AvcError::InvalidData(format!(
            "H.264: pic_init_qp 超出范围, pic_init_qp={}",
            pic_init_qp
        )));
    }
    let pic_init_qs = 26 + br.read_se()?;
    if !(0..=51).contains(&pic_init_qs) {
        return Err(AvcError::InvalidData(format!(
            "H.264: pic_init_qs 超出范围, pic_init_qs={}",
            pic_init_qs
        )));
    }

    let chroma_qp_index_offset = br.read_se()?;
    validate_chroma_offset("chroma_qp_index_offset", chroma_qp_index_offset)?;

    let deblocking_filter_control = br.read_flag()?;
    let constrained_intra_pred = br.read_flag()?;
    let redundant_pic_cnt_present = br.read_flag()?;

    let mut transform_8x8_mode = false;
    let mut scaling_lists = None;
    let mut second_chroma_qp_index_offset = chroma_qp_index_offset;

    if br.more_rbsp_data() {
        transform_8x8_mode = br.read_flag()?;
        if br.read_flag()? {
            let chroma_format_idc = chroma_format_of(sps_id).unwrap_or(1);
            scaling_lists = Some(parse_pps_scaling_lists(
                &mut br,
                transform_8x8_mode,
                chroma_format_idc,
            )?);
        }
        second_chroma_qp_index_offset = br.read_se()?;
        validate_chroma_offset(
            "second_chroma_qp_index_offset",
            second_chroma_qp_index_offset,
        )?;
    }

    Ok(Pps {
        pps_id,
        sps_id,
        entropy_coding_mode,
        pic_order_present,
        slice_groups,
        num_ref_idx_l0_default_active,
        num_ref_idx_l1_default_active,
        weighted_pred,
        weighted_bipred_idc,
        pic_init_qp,
        pic_init_qs,
        chroma_qp_index_offset,
        deblocking_filter_control,
        constrained_intra_pred,
        redundant_pic_cnt_present,
        transform_8x8_mode,
        scaling_lists,
        second_chroma_qp_index_offset,
    })
}

fn read_num_ref_idx(br: &mut BitReader, list: &str) -> AvcResult<u32> {
    let minus1 = br.read_ue()?;
    if minus1 > 31 {
        return Err(AvcError::InvalidData(format!(
            "H.264: num_ref_idx_{}_default_active_minus1 超出范围, value={}",
            list, minus1
        )));
    }
    Ok(minus1 + 1)
}

fn validate_chroma_offset(field: &str, value: i32) -> AvcResult<()> {
    if !(-12..=12).contains(&value) {
        return Err(AvcError::InvalidData(format!(
            "H.264: {} 超出范围, value={}",
            field, value
        )));
    }
    Ok(())
}

fn parse_pps_scaling_lists(
    br: &mut BitReader,
    transform_8x8_mode: bool,
    chroma_format_idc: u32,
) -> AvcResult<PpsScalingLists> {
    let mut lists4x4 = [
        DEFAULT_SCALING_4X4_INTRA,
        DEFAULT_SCALING_4X4_INTRA,
        DEFAULT_SCALING_4X4_INTRA,
        DEFAULT_SCALING_4X4_INTER,
        DEFAULT_SCALING_4X4_INTER,
        DEFAULT_SCALING_4X4_INTER,
    ];
    let count8x8 = match (transform_8x8_mode, chroma_format_idc) {
        (false, _) => 0,
        (true, 3) => 6,
        (true, _) => 2,
    };
    let mut lists8x8: Vec<[u8; 64]> = (0..count8x8).map(default_scaling_list_8x8_by_idx).collect();

    for list_idx in 0..6 + count8x8 {
        let present = br.read_flag()?;
        if list_idx < 6 {
            lists4x4[list_idx] = if !present {
                if list_idx == 0 || list_idx == 3 {
                    default_scaling_list_4x4_by_idx(list_idx)
                } else {
                    lists4x4[list_idx - 1]
                }
            } else {
                let mut list = [0u8; 16];
                if read_scaling_list(br, &mut list)? {
                    default_scaling_list_4x4_by_idx(list_idx)
                } else {
                    list
                }
            };
        } else {
            let idx8 = list_idx - 6;
            lists8x8[idx8] = if !present {
                if idx8 < 2 {
                    default_scaling_list_8x8_by_idx(idx8)
                } else {
                    lists8x8[idx8 - 2]
                }
            } else {
                let mut list = [0u8; 64];
                if read_scaling_list(br, &mut list)? {
                    default_scaling_list_8x8_by_idx(idx8)
                } else {
                    list
                }
            };
        }
    }
    Ok((lists4x4, lists8x8))
}
