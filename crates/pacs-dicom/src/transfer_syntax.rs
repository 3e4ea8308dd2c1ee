//! DICOM传输语法支持模块
//!
//! 判断像素数据能否被原生解码

/// 常用的传输语法UID常量
pub mod transfer_syntax_uids {
    /// 隐式VR Little Endian (默认传输语法)
    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";

    /// 显式VR Little Endian
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

    /// 显式VR Big Endian
    pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

    /// Deflated Explicit VR Little Endian
    pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";

    /// JPEG Baseline (Process 1)
    pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

    /// JPEG 2000 Image Compression
    pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";

    /// RLE Lossless
    pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
}

use transfer_syntax_uids::*;

const COMPRESSED_UIDS: &[&str] = &[
    JPEG_BASELINE,
    "1.2.840.10008.1.2.4.51", // JPEG Extended
    "1.2.840.10008.1.2.4.57", // JPEG Lossless
    "1.2.840.10008.1.2.4.70", // JPEG Lossless SV1
    "1.2.840.10008.1.2.4.80", // JPEG-LS Lossless
    "1.2.840.10008.1.2.4.81", // JPEG-LS Near Lossless
    "1.2.840.10008.1.2.4.90", // JPEG 2000 Lossless
    JPEG_2000,
    RLE_LOSSLESS,
];

/// DICOM传输语法管理器
pub struct TransferSyntaxManager;

impl TransferSyntaxManager {
    /// 像素数据是否为封装（压缩）格式
    pub fn is_compressed(uid: &str) -> bool {
        let uid = uid.trim_end_matches('\0');
        COMPRESSED_UIDS.contains(&uid) || uid.starts_with("1.2.840.10008.1.2.4.")
    }

    /// 像素数据是否可以直接读取
    pub fn is_native(uid: &str) -> bool {
        matches!(
            uid.trim_end_matches('\0'),
            IMPLICIT_VR_LITTLE_ENDIAN
                | EXPLICIT_VR_LITTLE_ENDIAN
                | EXPLICIT_VR_BIG_ENDIAN
                | DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN
        )
    }

    /// 获取传输语法的名称
    pub fn name(uid: &str) -> String {
        match uid.trim_end_matches('\0') {
            IMPLICIT_VR_LITTLE_ENDIAN => "Implicit VR Little Endian".to_string(),
            EXPLICIT_VR_LITTLE_ENDIAN => "Explicit VR Little Endian".to_string(),
            EXPLICIT_VR_BIG_ENDIAN => "Explicit VR Big Endian".to_string(),
            DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN => "Deflated Explicit VR Little Endian".to_string(),
            JPEG_BASELINE => "JPEG Baseline (Process 1)".to_string(),
            "1.2.840.10008.1.2.4.51" => "JPEG Extended (Process 2 & 4)".to_string(),
            "1.2.840.10008.1.2.4.57" => "JPEG Lossless (Process 14)".to_string(),
            "1.2.840.10008.1.2.4.70" => {
                "JPEG Lossless, Non-Hierarchical, First-Order Prediction".to_string()
            }
            "1.2.840.10008.1.2.4.80" => "JPEG-LS Lossless Image Compression".to_string(),
            "1.2.840.10008.1.2.4.81" => "JPEG-LS Near Lossless Image Compression".to_string(),
            "1.2.840.10008.1.2.4.90" => "JPEG 2000 Image Compression (Lossless Only)".to_string(),
            JPEG_2000 => "JPEG 2000 Image Compression".to_string(),
            RLE_LOSSLESS => "RLE Lossless".to_string(),
            other => format!("Unknown Transfer Syntax ({})", other),
        }
    }
}
