//! DICOM数据解析器
//!
//! 提供DICOM字节数据解析、标签读取和像素模块提取功能

use crate::transfer_syntax::TransferSyntaxManager;
use crate::worker::TagSpec;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::DefaultDicomObject;
use pacs_core::{PacsError, PixelType, Result};
use std::collections::HashMap;
use tracing::{debug, error, warn};

/// 文件前导区长度
const PREAMBLE_LEN: usize = 128;
const DICM_MAGIC: &[u8] = b"DICM";

/// DICOM数据解析器
pub struct DicomParser;

impl DicomParser {
    /// 字节数据是否具有DICOM文件结构
    pub fn looks_like_dicom(data: &[u8]) -> bool {
        data.get(PREAMBLE_LEN..PREAMBLE_LEN + DICM_MAGIC.len()) == Some(DICM_MAGIC)
            || data.starts_with(DICM_MAGIC)
    }

    /// 解析DICOM字节数据
    pub fn parse_bytes(data: &[u8]) -> Result<DefaultDicomObject> {
        debug!("开始解析DICOM字节数据，大小: {} bytes", data.len());

        // 跳过128字节前导区，从DICM魔数开始读取
        let body = if data.get(PREAMBLE_LEN..PREAMBLE_LEN + DICM_MAGIC.len()) == Some(DICM_MAGIC) {
            &data[PREAMBLE_LEN..]
        } else if data.starts_with(DICM_MAGIC) {
            data
        } else {
            return Err(PacsError::DicomParseError("缺少DICM文件标识".to_string()));
        };

        dicom::object::from_reader(body).map_err(|e| {
            error!("DICOM数据解析失败: {:?}", e);
            PacsError::DicomParseError(format!("无法解析DICOM数据: {}", e))
        })
    }

    /// 按标签规格读取字段，缺失的标签不出现在结果中
    pub fn read_tags(obj: &DefaultDicomObject, specs: &[TagSpec]) -> HashMap<String, String> {
        specs
            .iter()
            .filter_map(|spec| {
                Self::get_string_element(obj, spec.tag).map(|value| (spec.name.to_string(), value))
            })
            .collect()
    }

    /// 获取字符串类型元素的值，去除尾部空格和空字符
    pub fn get_string_element(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
        match obj.element(tag) {
            Ok(element) => match element.to_str() {
                Ok(value) => Some(value.trim_end_matches([' ', '\0']).to_string()),
                Err(_) => {
                    debug!("标签 {:?} 不是字符串类型", tag);
                    None
                }
            },
            Err(_) => {
                debug!("未找到标签: {:?}", tag);
                None
            }
        }
    }

    /// 获取整数类型元素的值
    pub fn get_integer_element(obj: &DefaultDicomObject, tag: Tag) -> Option<i32> {
        obj.element(tag).ok().and_then(|e| e.to_int::<i32>().ok())
    }

    /// 获取多值浮点元素
    pub fn get_float_values(obj: &DefaultDicomObject, tag: Tag) -> Option<Vec<f64>> {
        obj.element(tag)
            .ok()
            .and_then(|e| e.to_multi_float64().ok())
            .filter(|values| !values.is_empty())
    }

    /// 提取切片头信息
    pub fn slice_header(obj: &DefaultDicomObject) -> SliceHeader {
        SliceHeader {
            series_instance_uid: Self::get_string_element(obj, tags::SERIES_INSTANCE_UID),
            instance_number: Self::get_integer_element(obj, tags::INSTANCE_NUMBER),
            image_position: Self::get_float_values(obj, tags::IMAGE_POSITION_PATIENT)
                .filter(|v| v.len() == 3)
                .map(|v| [v[0], v[1], v[2]]),
            pixel_spacing: Self::get_float_values(obj, tags::PIXEL_SPACING)
                .filter(|v| v.len() == 2)
                .map(|v| [v[0], v[1]]),
            slice_thickness: Self::get_float_values(obj, tags::SLICE_THICKNESS)
                .map(|v| v[0]),
        }
    }

    /// 提取原生（未压缩）像素数据
    pub fn pixel_module(obj: &DefaultDicomObject) -> Result<PixelModule> {
        let transfer_syntax = obj.meta().transfer_syntax();
        if TransferSyntaxManager::is_compressed(transfer_syntax) {
            return Err(PacsError::Dicom(format!(
                "不支持压缩传输语法: {}",
                TransferSyntaxManager::name(transfer_syntax)
            )));
        }
        if !TransferSyntaxManager::is_native(transfer_syntax) {
            warn!("未知传输语法 {}，按原生像素数据读取", transfer_syntax);
        }

        let require = |tag: Tag, name: &str| {
            Self::get_integer_element(obj, tag)
                .ok_or_else(|| PacsError::Dicom(format!("缺少像素模块标签 {}", name)))
        };
        let rows = dimension(require(tags::ROWS, "Rows")?, "Rows")?;
        let columns = dimension(require(tags::COLUMNS, "Columns")?, "Columns")?;
        let bits_allocated = require(tags::BITS_ALLOCATED, "BitsAllocated")?;
        let pixel_representation = Self::get_integer_element(obj, tags::PIXEL_REPRESENTATION).unwrap_or(0);
        let samples_per_pixel = Self::get_integer_element(obj, tags::SAMPLES_PER_PIXEL).unwrap_or(1);
        if samples_per_pixel != 1 {
            return Err(PacsError::Dicom(format!(
                "仅支持单通道图像，SamplesPerPixel={}",
                samples_per_pixel
            )));
        }

        let pixel_type = match (bits_allocated, pixel_representation) {
            (8, _) => PixelType::U8,
            (16, 0) => PixelType::U16,
            (16, _) => PixelType::I16,
            (bits, _) => {
                return Err(PacsError::Dicom(format!("不支持的BitsAllocated: {}", bits)));
            }
        };

        let pixels = obj
            .element(tags::PIXEL_DATA)
            .map_err(|_| PacsError::Dicom("缺少像素数据".to_string()))?
            .to_bytes()
            .map_err(|e| PacsError::Dicom(format!("无法读取像素数据: {}", e)))?
            .into_owned();

        let expected = rows
            .checked_mul(columns)
            .and_then(|n| n.checked_mul(pixel_type.bytes_per_sample()))
            .ok_or_else(|| PacsError::Dicom(format!("图像尺寸溢出: {}x{}", rows, columns)))?;
        if pixels.len() < expected {
            return Err(PacsError::Dicom(format!(
                "像素数据长度不足: {} < {}",
                pixels.len(),
                expected
            )));
        }

        Ok(PixelModule {
            rows,
            columns,
            pixel_type,
            pixels: pixels[..expected].to_vec(),
        })
    }
}

/// 校验图像尺寸标签，负值与零均视为无效
fn dimension(value: i32, name: &str) -> Result<usize> {
    usize::try_from(value)
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| PacsError::Dicom(format!("无效的 {}: {}", name, value)))
}

/// 切片头信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceHeader {
    pub series_instance_uid: Option<String>,
    pub instance_number: Option<i32>,
    pub image_position: Option<[f64; 3]>,
    /// 行间距、列间距
    pub pixel_spacing: Option<[f64; 2]>,
    pub slice_thickness: Option<f64>,
}

/// 像素模块
#[derive(Debug, Clone)]
pub struct PixelModule {
    pub rows: usize,
    pub columns: usize,
    pub pixel_type: PixelType,
    pub pixels: Vec<u8>,
}
