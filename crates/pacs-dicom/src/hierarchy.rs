//! 患者/检查/卷层级
//!
//! 子键列表与父指针双向维护：父记录的子键列表中出现的每个键都有对应的父指针，反之亦然。
//! 只有 [`DicomHierarchy::insert_volume`] 与 [`DicomHierarchy::remove_volume`] 修改结构。

use pacs_core::{PatientInfo, StudyInfo, VolumeInfo, VolumeKeys};
use std::collections::HashMap;

/// 层级中的记录及其子键
#[derive(Debug, Clone)]
pub struct Node<T> {
    pub info: T,
    pub children: Vec<String>,
}

impl<T> Node<T> {
    fn new(info: T) -> Self {
        Self {
            info,
            children: Vec::new(),
        }
    }
}

/// 删除卷后被级联移除的上层记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovedVolume {
    pub study_removed: Option<String>,
    pub patient_removed: Option<String>,
}

#[derive(Debug, Default)]
pub struct DicomHierarchy {
    patients: HashMap<String, Node<PatientInfo>>,
    studies: HashMap<String, Node<StudyInfo>>,
    volumes: HashMap<String, VolumeInfo>,
    volume_study: HashMap<String, String>,
    study_patient: HashMap<String, String>,
}

impl DicomHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patient(&self, key: &str) -> Option<&Node<PatientInfo>> {
        self.patients.get(key)
    }

    pub fn study(&self, key: &str) -> Option<&Node<StudyInfo>> {
        self.studies.get(key)
    }

    pub fn volume(&self, key: &str) -> Option<&VolumeInfo> {
        self.volumes.get(key)
    }

    pub fn volume_mut(&mut self, key: &str) -> Option<&mut VolumeInfo> {
        self.volumes.get_mut(key)
    }

    pub fn contains_volume(&self, key: &str) -> bool {
        self.volumes.contains_key(key)
    }

    pub fn volume_keys(&self) -> impl Iterator<Item = &String> {
        self.volumes.keys()
    }

    pub fn study_of_volume(&self, volume_key: &str) -> Option<&str> {
        self.volume_study.get(volume_key).map(String::as_str)
    }

    pub fn patient_of_study(&self, study_key: &str) -> Option<&str> {
        self.study_patient.get(study_key).map(String::as_str)
    }

    /// 卷在层级中的完整位置
    pub fn keys_of_volume(&self, volume_key: &str) -> Option<VolumeKeys> {
        let study_key = self.study_of_volume(volume_key)?;
        let patient_key = self.patient_of_study(study_key)?;
        Some(VolumeKeys {
            patient_key: patient_key.to_string(),
            study_key: study_key.to_string(),
            volume_key: volume_key.to_string(),
        })
    }

    /// 插入新卷，患者与检查记录按需创建，已存在时保留原记录
    pub fn insert_volume(
        &mut self,
        keys: &VolumeKeys,
        patient: PatientInfo,
        study: StudyInfo,
        volume: VolumeInfo,
    ) {
        self.patients
            .entry(keys.patient_key.clone())
            .or_insert_with(|| Node::new(patient));

        if !self.studies.contains_key(&keys.study_key) {
            self.studies.insert(keys.study_key.clone(), Node::new(study));
            self.study_patient
                .insert(keys.study_key.clone(), keys.patient_key.clone());
            if let Some(node) = self.patients.get_mut(&keys.patient_key) {
                node.children.push(keys.study_key.clone());
            }
        }

        // 检查已归属其他患者时沿用原归属
        let owner = self
            .study_patient
            .get(&keys.study_key)
            .cloned()
            .unwrap_or_else(|| keys.patient_key.clone());
        if owner != keys.patient_key {
            if let Some(node) = self.patients.get(&keys.patient_key) {
                if node.children.is_empty() {
                    self.patients.remove(&keys.patient_key);
                }
            }
        }

        self.volumes.insert(keys.volume_key.clone(), volume);
        self.volume_study
            .insert(keys.volume_key.clone(), keys.study_key.clone());
        if let Some(node) = self.studies.get_mut(&keys.study_key) {
            node.children.push(keys.volume_key.clone());
        }
    }

    /// 删除卷，检查或患者因此变空时一并删除
    pub fn remove_volume(&mut self, volume_key: &str) -> Option<(VolumeInfo, RemovedVolume)> {
        let volume = self.volumes.remove(volume_key)?;
        let mut removed = RemovedVolume::default();

        let Some(study_key) = self.volume_study.remove(volume_key) else {
            return Some((volume, removed));
        };
        let study_empty = match self.studies.get_mut(&study_key) {
            Some(node) => {
                node.children.retain(|k| k != volume_key);
                node.children.is_empty()
            }
            None => false,
        };
        if !study_empty {
            return Some((volume, removed));
        }

        self.studies.remove(&study_key);
        removed.study_removed = Some(study_key.clone());
        let Some(patient_key) = self.study_patient.remove(&study_key) else {
            return Some((volume, removed));
        };
        let patient_empty = match self.patients.get_mut(&patient_key) {
            Some(node) => {
                node.children.retain(|k| k != &study_key);
                node.children.is_empty()
            }
            None => false,
        };
        if patient_empty {
            self.patients.remove(&patient_key);
            removed.patient_removed = Some(patient_key);
        }

        Some((volume, removed))
    }

    /// 检查下的全部卷键
    pub fn volumes_of_study(&self, study_key: &str) -> Vec<String> {
        self.studies
            .get(study_key)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    /// 患者下的全部卷键
    pub fn volumes_of_patient(&self, patient_key: &str) -> Vec<String> {
        self.patients
            .get(patient_key)
            .map(|node| {
                node.children
                    .iter()
                    .flat_map(|study| self.volumes_of_study(study))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
            && self.studies.is_empty()
            && self.volumes.is_empty()
            && self.volume_study.is_empty()
            && self.study_patient.is_empty()
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (self.patients.len(), self.studies.len(), self.volumes.len())
    }

    /// 校验子键列表与父指针的一致性
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (patient_key, node) in &self.patients {
            assert!(!node.children.is_empty(), "患者 {} 没有检查", patient_key);
            for study in &node.children {
                assert_eq!(self.study_patient.get(study), Some(patient_key));
            }
        }
        for (study_key, patient_key) in &self.study_patient {
            assert!(self.patients[patient_key].children.contains(study_key));
        }
        for (study_key, node) in &self.studies {
            assert!(self.study_patient.contains_key(study_key));
            for volume in &node.children {
                assert_eq!(self.volume_study.get(volume), Some(study_key));
            }
        }
        for (volume_key, study_key) in &self.volume_study {
            assert!(self.volumes.contains_key(volume_key));
            assert!(self.studies[study_key].children.contains(volume_key));
        }
        assert_eq!(self.volumes.len(), self.volume_study.len());
    }
}
