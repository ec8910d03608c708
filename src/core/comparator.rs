use crate::core::file_state::{wire, FileKey, FileRecord, RecordMap};
use serde::{Deserialize, Serialize};

/// 同步动作类型（由持有权威状态的一方给出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// 客户端需要从服务器下载
    Download,
    /// 客户端需要上传
    Upload,
    /// 客户端需要删除本地文件
    Delete,
}

impl ActionKind {
    fn order(&self) -> u8 {
        match self {
            ActionKind::Download => 0,
            ActionKind::Upload => 1,
            ActionKind::Delete => 2,
        }
    }
}

/// 同步动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAction {
    #[serde(default, deserialize_with = "wire::index")]
    pub root_index: usize,
    pub path: String,
    #[serde(
        serialize_with = "wire::serialize_version",
        deserialize_with = "wire::version"
    )]
    pub version: u64,
    #[serde(rename = "type")]
    pub kind: ActionKind,
}

impl SyncAction {
    pub fn new(key: &FileKey, version: u64, kind: ActionKind) -> Self {
        Self {
            root_index: key.root_index,
            path: key.path.clone(),
            version,
            kind,
        }
    }

    pub fn key(&self) -> FileKey {
        FileKey::new(self.root_index, self.path.clone())
    }
}

/// 版本比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRelation {
    Equal,
    ServerNewer,
    ClientNewer,
}

/// 文件比较器
pub struct FileComparator;

impl FileComparator {
    pub fn compare_versions(server: u64, client: u64) -> FileRelation {
        match server.cmp(&client) {
            std::cmp::Ordering::Equal => FileRelation::Equal,
            std::cmp::Ordering::Greater => FileRelation::ServerNewer,
            std::cmp::Ordering::Less => FileRelation::ClientNewer,
        }
    }

    /// 服务器状态与客户端上报做三方差异，返回有序动作列表
    pub fn compare_trees(server: &RecordMap, client: &RecordMap) -> Vec<SyncAction> {
        let mut actions = Vec::new();

        for (key, theirs) in server {
            match client.get(key) {
                None => actions.push(SyncAction::new(key, theirs.version, ActionKind::Download)),
                Some(ours) => match Self::compare_versions(theirs.version, ours.version) {
                    FileRelation::Equal => {}
                    FileRelation::ServerNewer => {
                        actions.push(SyncAction::new(key, theirs.version, ActionKind::Download))
                    }
                    FileRelation::ClientNewer => {
                        actions.push(SyncAction::new(key, ours.version, ActionKind::Upload))
                    }
                },
            }
        }

        // 只有客户端有：服务器端已删除
        for (key, ours) in client {
            if !server.contains_key(key) {
                actions.push(SyncAction::new(key, ours.version, ActionKind::Delete));
            }
        }

        // 按操作类型和键排序，确保一致性
        actions.sort_by(|a, b| {
            a.kind
                .order()
                .cmp(&b.kind.order())
                .then_with(|| a.root_index.cmp(&b.root_index))
                .then_with(|| a.path.cmp(&b.path))
        });
        actions
    }

    /// 将客户端上报转为文件表（只取普通文件条目）
    pub fn client_map(report: &[FileRecord]) -> RecordMap {
        report
            .iter()
            .filter(|r| !r.is_deleted())
            .map(|r| (r.key(), r.clone()))
            .collect()
    }

    /// 统计同步动作
    pub fn summarize_actions(actions: &[SyncAction]) -> ActionSummary {
        let mut summary = ActionSummary::default();
        for action in actions {
            match action.kind {
                ActionKind::Download => summary.download_count += 1,
                ActionKind::Upload => summary.upload_count += 1,
                ActionKind::Delete => summary.delete_count += 1,
            }
        }
        summary
    }
}

/// 动作统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSummary {
    pub download_count: usize,
    pub upload_count: usize,
    pub delete_count: usize,
}

impl ActionSummary {
    pub fn total(&self) -> usize {
        self.download_count + self.upload_count + self.delete_count
    }
}
