use serde::{Deserialize, Serialize};
use std::{env::temp_dir, fmt::Debug, path::PathBuf, sync::Arc, time::Duration};

/// 客户端配置
///
/// 只描述配置的形态，环境变量或配置文件的解析由外部完成。
/// 数值字段取 `0`（或空）时由各组件套用自己的缺省值。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// AccessKey
    pub ak: String,
    /// SecretKey
    pub sk: String,
    /// 存储空间名称
    pub bucket: String,

    /// 主机发现服务地址
    pub uc_hosts: Vec<String>,
    /// 下载服务种子地址
    pub io_hosts: Vec<String>,
    /// 上传服务种子地址
    pub up_hosts: Vec<String>,
    /// 元信息变更服务种子地址
    pub rs_hosts: Vec<String>,
    /// 元信息列举服务种子地址
    pub rsf_hosts: Vec<String>,
    /// 打点上报服务种子地址
    pub monitor_hosts: Vec<String>,

    /// 重试次数预算，下载缺省 5 次，打点上传缺省 10 次
    pub retry: usize,
    /// 主机惩罚时长，秒
    pub punish_time_s: u64,
    /// 连接建立超时，毫秒
    pub dial_timeout_ms: u64,

    /// 分片阈值，MiB，不低于 4 MiB
    pub part_size: u64,
    /// 分片上传并行度
    pub up_concurrency: usize,

    /// 批量操作单批大小，缺省 100
    pub batch_size: usize,
    /// 批量操作并行度，缺省 20
    pub batch_concurrency: usize,

    /// 打点上传时间阈值，秒，缺省 10
    pub dot_interval_s: u64,
    /// 打点缓冲文件大小阈值，字节，缺省 1 MiB
    pub max_dot_buffer_size: u64,

    /// 打点缓冲目录，多进程共享，缺省为系统临时目录
    pub cache_dir: Option<PathBuf>,
}

impl Config {
    /// 创建最小配置
    pub fn new(
        ak: impl Into<String>,
        sk: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            ak: ak.into(),
            sk: sk.into(),
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    pub(crate) fn dial_timeout(&self) -> Duration {
        if self.dial_timeout_ms == 0 {
            Duration::from_millis(500)
        } else {
            Duration::from_millis(self.dial_timeout_ms)
        }
    }

    pub(crate) fn punish_duration(&self) -> Duration {
        Duration::from_secs(self.punish_time_s)
    }

    pub(crate) fn part_size_bytes(&self) -> u64 {
        const MIN_PART_SIZE: u64 = 4 * 1024 * 1024;
        (self.part_size * 1024 * 1024).max(MIN_PART_SIZE)
    }

    pub(crate) fn cache_dir_path(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(temp_dir)
    }
}

/// 按对象键路由配置的能力
///
/// 多集群部署中，一个对象键只归属一个集群。
pub trait ConfigRouter: Debug + Send + Sync {
    /// 查询对象键对应的配置，不存在时返回 `None`
    fn for_key(&self, key: &str) -> Option<Config>;
}

/// 上传集群形态
///
/// 单集群直接携带配置，多集群通过路由能力在调用时解析。
#[derive(Clone, Debug)]
pub enum Clusters {
    /// 单集群
    Single(Config),
    /// 按对象键路由的多集群
    KeyRouted(Arc<dyn ConfigRouter>),
}

impl From<Config> for Clusters {
    #[inline]
    fn from(config: Config) -> Self {
        Self::Single(config)
    }
}
