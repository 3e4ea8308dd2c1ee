//! 通用工具函数

use crate::models::{DatasetFile, PatientInfo, ANONYMOUS_PATIENT, ANONYMOUS_PATIENT_ID};
use std::collections::HashSet;

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty() && uid.len() <= 64 && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// 使一批文件的名称互不相同
///
/// 重名文件依次追加 ` (2)`、` (3)` 等后缀，新名称不会与批次内任何原有名称冲突。
/// 返回被改名的文件数。
pub fn make_names_unique(files: &mut [DatasetFile]) -> usize {
    let original: HashSet<String> = files.iter().map(|f| f.name.clone()).collect();
    let mut used = HashSet::with_capacity(files.len());
    let mut renamed = 0;
    for file in files.iter_mut() {
        if used.insert(file.name.clone()) {
            continue;
        }
        let mut n = 2;
        let unique = loop {
            let candidate = format!("{} ({})", file.name, n);
            if !original.contains(&candidate) && !used.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };
        used.insert(unique.clone());
        file.name = unique;
        renamed += 1;
    }
    renamed
}

/// 为缺失的人口学字段填充匿名默认值
pub fn normalize_patient(mut patient: PatientInfo) -> PatientInfo {
    if patient.patient_id.trim().is_empty() {
        patient.patient_id = ANONYMOUS_PATIENT_ID.to_string();
    }
    if patient.patient_name.trim().is_empty() {
        patient.patient_name = ANONYMOUS_PATIENT.to_string();
    }
    patient
}

/// 生成合成患者键
///
/// PatientID不保证唯一（匿名数据尤其如此），因此由ID、姓名、出生日期、性别共同组成。
/// 人口学字段完全相同的不同患者会被合并为同一条记录。
pub fn synthetic_patient_key(patient: &PatientInfo) -> String {
    [
        &patient.patient_id,
        &patient.patient_name,
        &patient.patient_birth_date,
        &patient.patient_sex,
    ]
    .iter()
    .map(|part| part.trim().replace('|', "_"))
    .collect::<Vec<_>>()
    .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient(id: &str, name: &str) -> PatientInfo {
        PatientInfo {
            patient_id: id.to_string(),
            patient_name: name.to_string(),
            patient_birth_date: "19700101".to_string(),
            patient_sex: "F ".to_string(),
        }
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
    }

    #[test]
    fn test_make_names_unique() {
        let mut files = vec![
            DatasetFile::new("IMG0001", vec![1u8]),
            DatasetFile::new("IMG0001", vec![2u8]),
            DatasetFile::new("IMG0001 (2)", vec![3u8]),
            DatasetFile::new("other", vec![4u8]),
        ];
        assert_eq!(make_names_unique(&mut files), 1);

        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["IMG0001", "IMG0001 (3)", "IMG0001 (2)", "other"]);
        assert_eq!(&files[1].data[..], &[2]);
        assert_eq!(make_names_unique(&mut files), 0);
    }

    #[test]
    fn test_synthetic_patient_key() {
        let key = synthetic_patient_key(&patient(" 123 ", "Doe|Jane"));
        assert_eq!(key, "123|Doe_Jane|19700101|F");
    }

    #[test]
    fn test_identical_demographics_collide() {
        let a = normalize_patient(patient("", ""));
        let b = normalize_patient(patient("  ", ""));
        assert_eq!(a.patient_id, ANONYMOUS_PATIENT_ID);
        assert_eq!(a.patient_name, ANONYMOUS_PATIENT);
        assert_eq!(synthetic_patient_key(&a), synthetic_patient_key(&b));
    }
}
