//! DICOM组织存储
//!
//! 将导入的文件组织为 患者 -> 检查 -> 卷 三级结构，并通过卷缓存提供切片与体数据。
//!
//! 内部状态位于一把同步锁之后，锁只在不含 `.await` 的短临界区内持有：
//! 先取出本次操作所需的数据，释放锁后经由任务队列等待worker，再重新加锁提交结果。
//! 任务队列是唯一的串行化点，并发请求按队列优先级执行。
//! 提交时用卷的修订号判断在途结果是否仍然有效，失败时保持上一个一致状态。

use crate::dicom_io::DicomIo;
use crate::file_store::FileStore;
use crate::hierarchy::DicomHierarchy;
use crate::image_store::{ImageStore, VolumeImage};
use crate::slice_cache::VolumeCache;
use crate::worker::DESCRIPTIVE_TAGS;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use pacs_core::utils::{is_valid_dicom_uid, make_names_unique, normalize_patient, synthetic_patient_key};
use pacs_core::{
    DatasetFile, ImageData, PacsError, PatientInfo, Result, StudyInfo, VolumeInfo, VolumeKeys,
    VolumePipeline,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// 读取了描述性标签的候选卷
struct Candidate {
    key: String,
    tags: HashMap<String, String>,
    files: Vec<DatasetFile>,
}

impl Candidate {
    fn tag(&self, name: &str) -> String {
        self.tags.get(name).cloned().unwrap_or_default()
    }

    fn modality(&self) -> String {
        self.tag("Modality").trim().to_ascii_uppercase()
    }

    /// 检查键取Study Instance UID，缺失或格式无效时由卷键合成
    fn study_key(&self) -> String {
        let uid = self.tag("StudyInstanceUID");
        let uid = uid.trim_end_matches('\0').trim();
        if is_valid_dicom_uid(uid) {
            return uid.to_string();
        }
        if !uid.is_empty() {
            warn!("卷 {} 的StudyInstanceUID格式无效: {:?}，使用合成检查键", self.key, uid);
        }
        format!("study-{}", self.key)
    }
}

/// 快照中的单个卷记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    pub keys: VolumeKeys,
    pub patient: PatientInfo,
    pub study: StudyInfo,
    pub volume: VolumeInfo,
}

/// 存储快照，仅记录文件名，不含文件内容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    pub volumes: Vec<VolumeRecord>,
}

/// 一个导入批次的结果
#[derive(Debug, Clone, Default)]
pub struct ImportedBatch {
    /// 新建卷的键
    pub created: Vec<VolumeKeys>,
    /// 文件名 -> 所属卷键，标签读取失败被丢弃的文件不在其中
    pub placements: HashMap<String, String>,
}

/// 存储的内部状态
#[derive(Debug, Default)]
pub struct StoreState {
    files: FileStore,
    hierarchy: DicomHierarchy,
    cache: VolumeCache,
    images: ImageStore,
}

impl StoreState {
    pub fn hierarchy(&self) -> &DicomHierarchy {
        &self.hierarchy
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn cache(&self) -> &VolumeCache {
        &self.cache
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    /// 卷当前已构建的体数据
    pub fn volume_image(&self, volume_key: &str) -> Option<Arc<VolumeImage>> {
        self.cache
            .image_for_volume(volume_key)
            .and_then(|id| self.images.get(id))
    }

    /// 插入新卷或将文件合并到已有卷，新建时返回其键
    fn upsert(
        &mut self,
        keys: VolumeKeys,
        patient: PatientInfo,
        study: StudyInfo,
        volume: VolumeInfo,
    ) -> Option<VolumeKeys> {
        if let Some(existing) = self.hierarchy.volume_mut(&keys.volume_key) {
            if existing.pipeline.merge(volume.pipeline) {
                existing.number_of_slices = existing.pipeline.file_count();
                let files = existing.pipeline.files();
                debug!(
                    "卷 {} 加入新文件，共 {} 个切片，标记为需要重建",
                    keys.volume_key,
                    files.len()
                );
                self.files.set(&keys.volume_key, files);
                self.cache.invalidate_slices(&keys.volume_key);
                self.cache.mark_needs_rebuild(&keys.volume_key);
            }
            return None;
        }

        self.files.set(&keys.volume_key, volume.pipeline.files());
        // 新卷取得新的修订号
        self.cache.invalidate_slices(&keys.volume_key);
        self.hierarchy.insert_volume(&keys, patient, study, volume);
        self.hierarchy.keys_of_volume(&keys.volume_key)
    }

    fn delete_volume(&mut self, volume_key: &str) -> Result<()> {
        let (_, removed) = self
            .hierarchy
            .remove_volume(volume_key)
            .ok_or_else(|| PacsError::NotFound(format!("卷 {}", volume_key)))?;
        self.files.remove(volume_key);
        if let Some(image_id) = self.cache.remove_volume(volume_key) {
            self.images.delete(&image_id);
        }

        info!("已删除卷 {}", volume_key);
        if let Some(study) = removed.study_removed {
            info!("检查 {} 已无卷，随之删除", study);
        }
        if let Some(patient) = removed.patient_removed {
            info!("患者 {} 已无检查，随之删除", patient);
        }
        Ok(())
    }

    fn delete_volumes(&mut self, volumes: Vec<String>) -> Result<()> {
        volumes
            .iter()
            .try_for_each(|volume| self.delete_volume(volume))
    }

    /// 登记构建结果，已有图像时原位替换
    fn commit_image(&mut self, volume_key: &str, image: VolumeImage) -> Result<Arc<VolumeImage>> {
        let image_id = match self.cache.image_for_volume(volume_key).map(str::to_string) {
            Some(id) => {
                self.images.update(&id, image)?;
                id
            }
            None => {
                let id = self.images.add(image);
                if let Some(stale) = self.cache.register_image(volume_key, &id) {
                    self.images.delete(&stale);
                }
                id
            }
        };
        self.images
            .get(&image_id)
            .ok_or_else(|| PacsError::Internal(format!("数据集 {} 登记后丢失", image_id)))
    }
}

/// DICOM组织存储
///
/// 方法只需要 `&self`，可通过 `Arc` 在多个任务间共享。
pub struct DicomStore {
    io: Arc<DicomIo>,
    state: Mutex<StoreState>,
}

impl DicomStore {
    pub fn new(io: Arc<DicomIo>) -> Self {
        Self {
            io,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn io(&self) -> &Arc<DicomIo> {
        &self.io
    }

    /// 锁定内部状态，返回的守卫不得跨越 `.await` 持有
    pub fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn needs_rebuild(&self, volume_key: &str) -> bool {
        self.state().cache.needs_rebuild(volume_key)
    }

    pub fn volume_image(&self, volume_key: &str) -> Option<Arc<VolumeImage>> {
        self.state().volume_image(volume_key)
    }

    /// 导入文件，返回新建卷的 (患者, 检查, 卷) 键
    ///
    /// 读取标签失败的分组被丢弃，其余分组照常导入。已存在的卷合并新文件并标记为需要重建。
    pub async fn import_files(&self, files: Vec<DatasetFile>) -> Result<Vec<VolumeKeys>> {
        Ok(self.import_batch(files).await?.created)
    }

    /// 导入文件，同时返回每个文件所属的卷
    ///
    /// 批次内的重名文件先被改名，worker的分组结果按文件名关联回文件。
    pub async fn import_batch(&self, mut files: Vec<DatasetFile>) -> Result<ImportedBatch> {
        if files.is_empty() {
            return Ok(ImportedBatch::default());
        }
        let renamed = make_names_unique(&mut files);
        if renamed > 0 {
            warn!("批次中 {} 个文件重名，已改名", renamed);
        }
        info!("开始导入 {} 个DICOM文件", files.len());

        let groups = self.io.categorize(files.clone()).await?;
        let by_name: HashMap<&str, &DatasetFile> =
            files.iter().map(|f| (f.name.as_str(), f)).collect();

        let mut grouped: Vec<(String, Vec<DatasetFile>)> = groups
            .into_iter()
            .map(|(key, names)| {
                let members = names
                    .iter()
                    .filter_map(|name| by_name.get(name.as_str()).map(|f| (*f).clone()))
                    .collect::<Vec<_>>();
                (key, members)
            })
            .filter(|(_, members)| !members.is_empty())
            .collect();
        grouped.sort_by(|a, b| a.0.cmp(&b.0));

        // 每组只读取首个文件的标签
        let io = &self.io;
        let tag_reads = grouped.iter().map(|(_, members)| {
            let first = members[0].clone();
            io.read_tags(first, DESCRIPTIVE_TAGS)
        });
        let tag_results = join_all(tag_reads).await;

        let mut candidates = Vec::with_capacity(grouped.len());
        for ((key, members), tags) in grouped.into_iter().zip(tag_results) {
            match tags {
                Ok(tags) => candidates.push(Candidate {
                    key,
                    tags,
                    files: members,
                }),
                Err(e) => warn!("卷 {} 标签读取失败，已从本批次中丢弃: {}", key, e),
            }
        }

        let mut batch = ImportedBatch::default();
        let mut state = self.state();
        for (candidate, pipeline) in pair_pet_ct(candidates) {
            for file in pipeline.files() {
                batch.placements.insert(file.name, candidate.key.clone());
            }
            let patient = normalize_patient(PatientInfo {
                patient_id: candidate.tag("PatientID"),
                patient_name: candidate.tag("PatientName"),
                patient_birth_date: candidate.tag("PatientBirthDate"),
                patient_sex: candidate.tag("PatientSex"),
            });
            let study = StudyInfo {
                study_id: candidate.tag("StudyID"),
                study_instance_uid: candidate.tag("StudyInstanceUID"),
                study_date: candidate.tag("StudyDate"),
                study_time: candidate.tag("StudyTime"),
                accession_number: candidate.tag("AccessionNumber"),
                study_description: candidate.tag("StudyDescription"),
            };
            let keys = VolumeKeys {
                patient_key: synthetic_patient_key(&patient),
                study_key: candidate.study_key(),
                volume_key: candidate.key.clone(),
            };
            let volume = VolumeInfo {
                number_of_slices: pipeline.file_count(),
                volume_id: candidate.key.clone(),
                modality: candidate.modality(),
                series_instance_uid: candidate.tag("SeriesInstanceUID"),
                series_number: candidate.tag("SeriesNumber"),
                series_description: candidate.tag("SeriesDescription"),
                pipeline,
            };
            if let Some(keys) = state.upsert(keys, patient, study, volume) {
                batch.created.push(keys);
            }
        }

        info!("导入完成，新建 {} 个卷", batch.created.len());
        Ok(batch)
    }

    /// 删除卷，检查或患者变空时级联删除
    pub fn delete_volume(&self, volume_key: &str) -> Result<()> {
        self.state().delete_volume(volume_key)
    }

    /// 删除检查下的全部卷
    pub fn delete_study(&self, study_key: &str) -> Result<()> {
        let mut state = self.state();
        if state.hierarchy.study(study_key).is_none() {
            return Err(PacsError::NotFound(format!("检查 {}", study_key)));
        }
        let volumes = state.hierarchy.volumes_of_study(study_key);
        state.delete_volumes(volumes)
    }

    /// 删除患者下的全部卷
    pub fn delete_patient(&self, patient_key: &str) -> Result<()> {
        let mut state = self.state();
        if state.hierarchy.patient(patient_key).is_none() {
            return Err(PacsError::NotFound(format!("患者 {}", patient_key)));
        }
        let volumes = state.hierarchy.volumes_of_patient(patient_key);
        state.delete_volumes(volumes)
    }

    /// 获取切片，序号从1开始
    ///
    /// 解码期间卷加入了新文件或被删除时，结果照常返回但不写入缓存。
    pub async fn get_volume_slice(
        &self,
        volume_key: &str,
        index: usize,
        as_thumbnail: bool,
    ) -> Result<Arc<ImageData>> {
        let (file, revision) = {
            let state = self.state();
            if let Some(image) = state.cache.get_slice(volume_key, index, as_thumbnail) {
                debug!("切片缓存命中: {} #{}", volume_key, index);
                return Ok(image);
            }

            let count = state
                .hierarchy
                .volume(volume_key)
                .ok_or_else(|| PacsError::NotFound(format!("卷 {}", volume_key)))?
                .number_of_slices;
            if index < 1 || index > count {
                return Err(PacsError::SliceOutOfBounds { index, count });
            }

            let file = state
                .files
                .get_files(volume_key)
                .and_then(|files| files.get(index - 1))
                .cloned()
                .ok_or_else(|| PacsError::Storage(format!("卷 {} 缺少第 {} 个文件", volume_key, index)))?;
            (file, state.cache.revision(volume_key))
        };

        let image = Arc::new(self.io.decode_slice(file, as_thumbnail).await?);

        let mut state = self.state();
        if state.cache.revision(volume_key) == revision {
            state
                .cache
                .put_slice(volume_key, index, as_thumbnail, image.clone());
        } else {
            debug!("卷 {} 在解码期间发生变化，切片不写入缓存", volume_key);
        }
        Ok(image)
    }

    /// 获取卷缩略图，取结构切片的中间一张
    pub async fn get_volume_thumbnail(&self, volume_key: &str) -> Result<Arc<ImageData>> {
        let structural = self
            .state()
            .hierarchy
            .volume(volume_key)
            .ok_or_else(|| PacsError::NotFound(format!("卷 {}", volume_key)))?
            .pipeline
            .structural_slice_count();
        let middle = structural.div_ceil(2);
        self.get_volume_slice(volume_key, middle, true).await
    }

    /// 构建卷
    ///
    /// 已有构建结果且未强制、未标记重建时直接返回缓存结果。
    /// 构建期间卷被删除时返回 `NotFound`，构建期间加入了新文件时登记结果但保留重建标记。
    pub async fn build_volume(&self, volume_key: &str, force_rebuild: bool) -> Result<Arc<VolumeImage>> {
        let (name, pipeline, revision) = {
            let state = self.state();
            let volume = state
                .hierarchy
                .volume(volume_key)
                .ok_or_else(|| PacsError::NotFound(format!("卷 {}", volume_key)))?;

            if !force_rebuild && !state.cache.needs_rebuild(volume_key) {
                if let Some(image) = state.volume_image(volume_key) {
                    debug!("卷 {} 使用已构建结果", volume_key);
                    return Ok(image);
                }
            }
            (
                volume.volume_id.clone(),
                volume.pipeline.clone(),
                state.cache.revision(volume_key),
            )
        };
        info!("构建卷 {} ({}, {} 个文件)", volume_key, pipeline.kind(), pipeline.file_count());

        let built = self.io.build_volume(pipeline).await?;
        let image = VolumeImage::from_image(name, &built)?;

        let mut state = self.state();
        if !state.hierarchy.contains_volume(volume_key) {
            return Err(PacsError::NotFound(format!("卷 {} 在构建期间被删除", volume_key)));
        }
        let image = state.commit_image(volume_key, image)?;
        if state.cache.revision(volume_key) == revision {
            state.cache.clear_needs_rebuild(volume_key);
        } else {
            debug!("卷 {} 在构建期间加入了新文件，保留重建标记", volume_key);
        }
        Ok(image)
    }

    /// 导出快照
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state();
        let hierarchy = &state.hierarchy;
        let mut volumes: Vec<VolumeRecord> = hierarchy
            .volume_keys()
            .filter_map(|volume_key| {
                let keys = hierarchy.keys_of_volume(volume_key)?;
                Some(VolumeRecord {
                    patient: hierarchy.patient(&keys.patient_key)?.info.clone(),
                    study: hierarchy.study(&keys.study_key)?.info.clone(),
                    volume: hierarchy.volume(volume_key)?.clone(),
                    keys,
                })
            })
            .collect();
        volumes.sort_by(|a, b| a.keys.volume_key.cmp(&b.keys.volume_key));
        StoreSnapshot {
            created_at: Utc::now(),
            volumes,
        }
    }

    /// 由快照恢复层级，按文件名重新关联文件内容
    ///
    /// 不读取标签。任何被引用的文件缺失时整体失败，存储保持不变。
    pub fn restore(&self, snapshot: StoreSnapshot, files: Vec<DatasetFile>) -> Result<Vec<VolumeKeys>> {
        let by_name: HashMap<String, bytes::Bytes> =
            files.into_iter().map(|f| (f.name, f.data)).collect();

        let mut records = snapshot.volumes;
        for record in &mut records {
            record
                .volume
                .pipeline
                .attach_data(|name| by_name.get(name).cloned())
                .map_err(|name| {
                    PacsError::NotFound(format!(
                        "恢复卷 {} 所需的文件 {}",
                        record.keys.volume_key, name
                    ))
                })?;
        }

        let mut state = self.state();
        let restored: Vec<VolumeKeys> = records
            .into_iter()
            .filter_map(|record| state.upsert(record.keys, record.patient, record.study, record.volume))
            .collect();
        info!("已从快照恢复 {} 个卷", restored.len());
        Ok(restored)
    }
}

/// PET-CT配对
///
/// 每个CT卷在剩余的PT卷中寻找同一Study Instance UID的第一个匹配，匹配到的PT卷不再参与后续配对。
/// 配对结果沿用CT卷的键，文件按CT在前、PT在后排列。
fn pair_pet_ct(candidates: Vec<Candidate>) -> Vec<(Candidate, VolumePipeline)> {
    let (mut pts, others): (Vec<Candidate>, Vec<Candidate>) =
        candidates.into_iter().partition(|c| c.modality() == "PT");

    let mut volumes = Vec::with_capacity(others.len() + pts.len());
    for mut candidate in others {
        if candidate.modality() == "CT" {
            let study = candidate.tag("StudyInstanceUID");
            if let Some(pos) = pts.iter().position(|pt| pt.tag("StudyInstanceUID") == study) {
                let pt = pts.remove(pos);
                info!("PET-CT配对: CT {} + PT {} (检查 {})", candidate.key, pt.key, study);
                let ct_files = std::mem::take(&mut candidate.files);
                volumes.push((
                    candidate,
                    VolumePipeline::PtCt {
                        ct_files,
                        pt_files: pt.files,
                    },
                ));
                continue;
            }
        }
        let files = std::mem::take(&mut candidate.files);
        volumes.push((candidate, VolumePipeline::series(files)));
    }

    for mut pt in pts {
        let files = std::mem::take(&mut pt.files);
        volumes.push((pt, VolumePipeline::series(files)));
    }
    volumes
}
