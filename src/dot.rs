use crate::{
    config::Config,
    credential::{Credential, PutPolicy},
    error::{Error, ErrorKind, Result},
    host_selector::HostSelector,
    http::{HttpCaller, Request},
    spawn::spawn_named,
};
use fs4::FileExt;
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use log::{debug, info, warn};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fs::{create_dir_all, File, OpenOptions},
    io::{BufRead, BufReader, ErrorKind as IoErrorKind, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// 打点上报自身的 API 名
pub const API_MONITOR_V1_STAT: &str = "monitor_v1_stat";

const DOT_FILE_NAME: &str = "dot-file";
const DOT_LOCK_FILE_NAME: &str = "dot-file.lock";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_BUFFER_SIZE: u64 = 1 << 20;
const DEFAULT_UPLOAD_TRIES: usize = 10;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(1);
const TOKEN_LIFETIME: Duration = Duration::from_secs(10);
const UPLOAD_TASK_NAME: &str = "kodo-operation.dotter.upload";

/// 打点类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DotType {
    /// SDK 层面的一次完整操作
    Sdk,
    /// 单次 HTTP 请求
    Http,
}

impl Serialize for DotType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            Self::Sdk => 1,
            Self::Http => 2,
        })
    }
}

impl<'de> Deserialize<'de> for DotType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(Self::Sdk),
            2 => Ok(Self::Http),
            other => Err(de::Error::custom(format!("unknown dot type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LocalDotRecord {
    #[serde(rename = "t")]
    dot_type: DotType,
    #[serde(rename = "a")]
    api_name: String,
    #[serde(rename = "f", default, skip_serializing_if = "is_false")]
    failed: bool,
}

#[inline]
fn is_false(failed: &bool) -> bool {
    !*failed
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct RemoteDotRecord {
    #[serde(rename = "type")]
    dot_type: DotType,
    api_name: String,
    success_count: u64,
    failed_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteDotRecords {
    logs: Vec<RemoteDotRecord>,
}

/// 打点器
///
/// 按 API 记录每次调用成败，缓冲在内存与磁盘文件中，
/// 达到大小或时间阈值后在后台聚合上报。磁盘文件由协作进程
/// 共享，读写都在文件锁保护下进行，锁竞争不是错误。
/// 对调用方而言打点永远不失败。
#[derive(Debug, Clone, Default)]
pub struct Dotter {
    inner: Option<Arc<DotterInner>>,
}

#[derive(Debug)]
struct DotterInner {
    credential: Credential,
    bucket: String,
    buffer: Mutex<Vec<LocalDotRecord>>,
    buffer_file: Mutex<File>,
    dot_file_path: PathBuf,
    lock_file_path: PathBuf,
    selector: HostSelector,
    http_caller: Arc<dyn HttpCaller>,
    interval: Duration,
    max_buffer_size: u64,
    upload_tries: usize,
    uploaded_at: Mutex<Instant>,
}

impl Dotter {
    /// 根据配置创建打点器
    ///
    /// 未配置打点上报地址时返回禁用的打点器。
    pub fn new(config: &Config, http_caller: Arc<dyn HttpCaller>) -> Result<Self> {
        if config.monitor_hosts.is_empty() {
            return Ok(Self::disabled());
        }
        let cache_dir = config.cache_dir_path();
        create_dir_all(&cache_dir)?;
        let dot_file_path = cache_dir.join(DOT_FILE_NAME);
        let buffer_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&dot_file_path)?;
        let selector = HostSelector::builder(config.monitor_hosts.to_owned())
            .punish_duration(config.punish_duration())
            .build();
        let interval = if config.dot_interval_s == 0 {
            DEFAULT_INTERVAL
        } else {
            Duration::from_secs(config.dot_interval_s)
        };
        let max_buffer_size = if config.max_dot_buffer_size == 0 {
            DEFAULT_MAX_BUFFER_SIZE
        } else {
            config.max_dot_buffer_size
        };
        let upload_tries = if config.retry == 0 {
            DEFAULT_UPLOAD_TRIES
        } else {
            config.retry
        };
        Ok(Self {
            inner: Some(Arc::new(DotterInner {
                credential: Credential::new(config.ak.to_owned(), config.sk.to_owned()),
                bucket: config.bucket.to_owned(),
                buffer: Default::default(),
                buffer_file: Mutex::new(buffer_file),
                dot_file_path,
                lock_file_path: cache_dir.join(DOT_LOCK_FILE_NAME),
                selector,
                http_caller,
                interval,
                max_buffer_size,
                upload_tries,
                uploaded_at: Mutex::new(Instant::now()),
            })),
        })
    }

    /// 创建禁用的打点器，所有操作都是空操作
    #[inline]
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// 记录一次调用结果
    ///
    /// 即发即忘：内部错误只记录日志，永远不影响调用方。
    pub fn dot(&self, dot_type: DotType, api_name: &str, success: bool) {
        if let Err(err) = self.try_dot(dot_type, api_name, success) {
            debug!("dot record dropped: {}", err);
        }
    }

    /// 只追加到内存缓冲，不触发落盘与上报检查
    ///
    /// 上报自身的结果走这条路径，避免上报失败再次触发上报。
    pub(crate) fn buffer_only(&self, dot_type: DotType, api_name: &str, success: bool) {
        if let Some(inner) = &self.inner {
            inner.buffer.lock().unwrap().push(LocalDotRecord {
                dot_type,
                api_name: api_name.to_owned(),
                failed: !success,
            });
        }
    }

    fn try_dot(&self, dot_type: DotType, api_name: &str, success: bool) -> Result<()> {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return Ok(()),
        };
        let mut buffer = inner.buffer.lock().unwrap();
        buffer.push(LocalDotRecord {
            dot_type,
            api_name: api_name.to_owned(),
            failed: !success,
        });
        let _lock = match inner.try_lock_file()? {
            Some(guard) => guard,
            // 其他进程正持有锁，记录留在内存里等下一次机会
            None => return Ok(()),
        };
        inner.flush_records(&mut buffer)?;
        drop(buffer);

        if inner.time_to_upload()? {
            let dotter = self.to_owned();
            spawn_named(UPLOAD_TASK_NAME, move || {
                if let Err(err) = dotter.upload() {
                    info!("dot upload failed: {}", err);
                }
            });
        }
        Ok(())
    }

    /// 聚合缓冲文件并上报
    ///
    /// 在文件锁保护下重新检查阈值，聚合整个缓冲文件后 POST 到
    /// 打点服务。2xx 时清空缓冲文件并刷新上报时间。
    pub(crate) fn upload(&self) -> Result<()> {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return Ok(()),
        };
        self.retry(inner, |host| {
            let guard = match inner.try_lock_file() {
                Ok(Some(guard)) => guard,
                Ok(None) => return (true, Ok(())),
                Err(err) => return (true, Err(err)),
            };
            let _guard = guard;
            match inner.time_to_upload() {
                Ok(true) => {}
                Ok(false) => return (true, Ok(())),
                Err(err) => return (true, Err(err)),
            }
            let records = match inner.aggregate() {
                Ok(records) => records,
                Err(err) => return (true, Err(err)),
            };
            if records.logs.is_empty() {
                return (true, Ok(()));
            }
            let body = match serde_json::to_vec(&records) {
                Ok(body) => body,
                Err(err) => return (true, Err(Error::new(ErrorKind::LocalIo, err))),
            };
            let token = match inner
                .credential
                .upload_token(&PutPolicy::new(inner.bucket.to_owned(), TOKEN_LIFETIME))
            {
                Ok(token) => token,
                Err(err) => return (true, Err(err)),
            };
            let authorization = match HeaderValue::from_str(&format!("UpToken {}", token)) {
                Ok(authorization) => authorization,
                Err(err) => return (true, Err(Error::new(ErrorKind::LocalIo, err))),
            };
            let request = Request::post(format!("{}/v1/stat", host))
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .header(AUTHORIZATION, authorization)
                .body(body)
                .timeout(UPLOAD_TIMEOUT);
            match inner.http_caller.call(request) {
                Ok(response) if response.status_code().is_success() => {
                    self.buffer_only(DotType::Http, API_MONITOR_V1_STAT, true);
                    if let Err(err) = inner.truncate_dot_file() {
                        return (true, Err(err));
                    }
                    *inner.uploaded_at.lock().unwrap() = Instant::now();
                    (false, Ok(()))
                }
                Ok(response) => {
                    self.buffer_only(DotType::Http, API_MONITOR_V1_STAT, false);
                    (false, Err(Error::from_status(response.status_code())))
                }
                Err(err) => {
                    self.buffer_only(DotType::Http, API_MONITOR_V1_STAT, false);
                    (false, Err(err))
                }
            }
        })
    }

    /// 打点上报专用的重试循环
    ///
    /// `f` 返回的布尔位表示本次结果来自调用方内部，
    /// 不奖惩主机也不消耗重试预算。
    fn retry(
        &self,
        inner: &Arc<DotterInner>,
        mut f: impl FnMut(&str) -> (bool, Result<()>),
    ) -> Result<()> {
        let tries = inner.upload_tries.max(1);
        let mut result = Ok(());
        for i in 0..tries {
            let host = inner.selector.select_host()?;
            let (skip_host_accounting, attempt) = f(&host);
            match attempt {
                Err(err) => {
                    if !skip_host_accounting {
                        warn!("dot upload try {} failed, punish host {}: {}", i, host, err);
                        inner.selector.punish_if_needed(&host, &err);
                        if err.is_retryable() {
                            result = Err(err);
                            continue;
                        }
                    }
                    return Err(err);
                }
                Ok(()) => {
                    if !skip_host_accounting {
                        inner.selector.reward(&host);
                    }
                    return Ok(());
                }
            }
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn rewind_uploaded_at(&self, by: Duration) {
        if let Some(inner) = &self.inner {
            *inner.uploaded_at.lock().unwrap() = Instant::now().checked_sub(by).unwrap();
        }
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.buffer.lock().unwrap().len())
    }
}

struct FileLockGuard(File);

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.0.unlock() {
            warn!("failed to unlock dot lock file: {}", err);
        }
    }
}

impl DotterInner {
    fn try_lock_file(&self) -> Result<Option<FileLockGuard>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.lock_file_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLockGuard(file))),
            Err(err) if err.kind() == IoErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn flush_records(&self, buffer: &mut Vec<LocalDotRecord>) -> Result<()> {
        let mut file = self.buffer_file.lock().unwrap();
        for record in buffer.iter() {
            // 整行一次写入，其他进程不会读到半行
            let mut line =
                serde_json::to_string(record).map_err(|err| Error::new(ErrorKind::LocalIo, err))?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        buffer.clear();
        Ok(())
    }

    fn time_to_upload(&self) -> Result<bool> {
        let size = self.dot_file_path.metadata()?.len();
        let uploaded_at = *self.uploaded_at.lock().unwrap();
        Ok(size >= self.max_buffer_size || uploaded_at.elapsed() >= self.interval)
    }

    fn aggregate(&self) -> Result<RemoteDotRecords> {
        let file = File::open(&self.dot_file_path)?;
        let mut logs: Vec<RemoteDotRecord> = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let record: LocalDotRecord =
                serde_json::from_str(&line).map_err(|err| Error::new(ErrorKind::LocalIo, err))?;
            let index = logs
                .iter()
                .position(|log| log.api_name == record.api_name && log.dot_type == record.dot_type);
            let index = match index {
                Some(index) => index,
                None => {
                    logs.push(RemoteDotRecord {
                        dot_type: record.dot_type,
                        api_name: record.api_name.to_owned(),
                        success_count: 0,
                        failed_count: 0,
                    });
                    logs.len() - 1
                }
            };
            if record.failed {
                logs[index].failed_count += 1;
            } else {
                logs[index].success_count += 1;
            }
        }
        Ok(RemoteDotRecords { logs })
    }

    fn truncate_dot_file(&self) -> Result<()> {
        self.buffer_file.lock().unwrap().set_len(0)?;
        Ok(())
    }
}
