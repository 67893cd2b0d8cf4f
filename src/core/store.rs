//! 配置持久化存储 (Configuration Store)
//!
//! 每条记录一个 JSON 文件，外加一个有序索引文件；所有写入先落盘临时文件再原子替换。
//! 索引文件是插入的提交点，未出现在索引中的记录文件在加载时被忽略。

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::error::{MangoError, Result};
use crate::core::model::{Configuration, ConfigurationId};

const INDEX_FILE: &str = "index.json";

/// 持久化配置集合
///
/// 纯数据访问，不含业务策略。所有写操作由同一把锁串行化，返回前已落盘。
pub struct ConfigurationStore {
    dir: PathBuf,
    records: Mutex<IndexMap<ConfigurationId, Configuration>>,
}

impl ConfigurationStore {
    /// 打开 (或初始化) 存储目录
    ///
    /// 任何无法解析的索引或记录都会导致打开失败，不做自动修复。
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let order: Vec<ConfigurationId> = match fs::read_to_string(&index_path) {
            Ok(data) => serde_json::from_str(&data).map_err(|e| corrupted(&index_path, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut records = IndexMap::with_capacity(order.len());
        for id in order {
            let path = record_path(&dir, &id);
            let data = fs::read_to_string(&path).map_err(|e| corrupted(&path, e))?;
            let configuration: Configuration =
                serde_json::from_str(&data).map_err(|e| corrupted(&path, e))?;

            if configuration.id != id {
                return Err(corrupted(
                    &path,
                    format!("record id {} does not match index entry {}", configuration.id, id),
                ));
            }
            if records.insert(id.clone(), configuration).is_some() {
                return Err(corrupted(&index_path, format!("duplicate index entry {}", id)));
            }
        }

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && path.file_name().is_some_and(|name| name != INDEX_FILE);
            if !is_record {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if !records.contains_key(&ConfigurationId::from(stem)) {
                warn!("Ignoring uncommitted record: {}", path.display());
            }
        }

        info!("Loaded {} configuration(s) from {}", records.len(), dir.display());

        Ok(Self {
            dir,
            records: Mutex::new(records),
        })
    }

    /// 记录文件路径
    pub fn record_path(&self, id: &ConfigurationId) -> PathBuf {
        record_path(&self.dir, id)
    }

    /// 按插入顺序列出全部配置
    pub fn list(&self) -> Vec<Configuration> {
        self.records.lock().values().cloned().collect()
    }

    pub fn get(&self, id: &ConfigurationId) -> Result<Configuration> {
        self.records
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| MangoError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &ConfigurationId) -> bool {
        self.records.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, configuration: Configuration) -> Result<()> {
        let mut records = self.records.lock();
        let id = configuration.id.clone();
        if records.contains_key(&id) {
            return Err(MangoError::DuplicateId(id));
        }

        let path = self.record_path(&id);
        write_json(&path, &configuration)?;

        let mut order: Vec<&ConfigurationId> = records.keys().collect();
        order.push(&id);
        if let Err(e) = write_json(&self.dir.join(INDEX_FILE), &order) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        debug!("Inserted configuration {}", id);
        records.insert(id, configuration);
        Ok(())
    }

    /// 整体替换一条记录，ID 以参数为准
    #[allow(dead_code)]
    pub fn replace(&self, id: &ConfigurationId, mut configuration: Configuration) -> Result<()> {
        let mut records = self.records.lock();
        let slot = records
            .get_mut(id)
            .ok_or_else(|| MangoError::NotFound(id.clone()))?;

        configuration.id = id.clone();
        write_json(&record_path(&self.dir, id), &configuration)?;
        *slot = configuration;

        debug!("Replaced configuration {}", id);
        Ok(())
    }

    /// 在锁内完成读取-修改-写回，返回写入后的记录
    pub fn modify<F>(&self, id: &ConfigurationId, f: F) -> Result<Configuration>
    where
        F: FnOnce(&mut Configuration),
    {
        let mut records = self.records.lock();
        let slot = records
            .get_mut(id)
            .ok_or_else(|| MangoError::NotFound(id.clone()))?;

        let mut updated = slot.clone();
        f(&mut updated);
        updated.id = id.clone();

        write_json(&record_path(&self.dir, id), &updated)?;
        *slot = updated.clone();

        debug!("Modified configuration {}", id);
        Ok(updated)
    }

    pub fn remove(&self, id: &ConfigurationId) -> Result<Configuration> {
        let mut records = self.records.lock();
        if !records.contains_key(id) {
            return Err(MangoError::NotFound(id.clone()));
        }

        let order: Vec<&ConfigurationId> = records.keys().filter(|k| *k != id).collect();
        write_json(&self.dir.join(INDEX_FILE), &order)?;

        let path = self.record_path(id);
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove record file {}: {}", path.display(), e);
        }

        debug!("Removed configuration {}", id);
        records
            .shift_remove(id)
            .ok_or_else(|| MangoError::NotFound(id.clone()))
    }
}

fn record_path(dir: &Path, id: &ConfigurationId) -> PathBuf {
    dir.join(format!("{}.json", id))
}

fn corrupted(path: &Path, reason: impl std::fmt::Display) -> MangoError {
    MangoError::StoreCorrupted {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// 序列化后原子写入：临时文件 + fsync + rename
fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
