use crate::{
    config::Config,
    credential::Credential,
    error::{Error, ErrorKind, Result},
    host_selector::{HostSelector, DEFAULT_UPDATE_INTERVAL},
    http::{HttpCaller, Request, UreqCaller},
    pool::TaskPool,
    query::Queryer,
};
use http::{
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Method,
};
use log::{debug, info, warn};
use rand::{seq::SliceRandom, thread_rng};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::Debug,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use url::Url;

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_BATCH_CONCURRENCY: usize = 20;
const LIST_PAGE_LIMIT: usize = 1000;
const RS_TIMEOUT: Duration = Duration::from_secs(60);
const FORM_MIME: &str = "application/x-www-form-urlencoded";

/// 对象元信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileStat {
    /// 对象键
    pub name: String,
    /// 对象大小，字节，获取失败时为 `-1`
    pub size: i64,
}

/// 批量查询中单个对象的结果
#[derive(Debug, Clone, Deserialize)]
pub struct BatchStatResult {
    /// 单个对象的状态码
    pub code: u16,
    /// 对象数据，状态码为 200 时有效
    #[serde(default)]
    pub data: Option<StatData>,
}

/// 对象的元信息数据
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatData {
    /// 对象大小，字节
    #[serde(default)]
    pub fsize: i64,
}

/// 前缀列举的一页结果
#[derive(Debug, Clone)]
pub struct ListPage {
    /// 本页的对象键
    pub keys: Vec<String>,
    /// 下一页的游标，空或缺失表示列举结束
    pub marker: Option<String>,
}

/// RS / RSF 单次操作客户端接口
///
/// 每个方法只对一台给定主机发起一次操作，不做重试，
/// 主机轮换与失败处理由列举器负责。
pub trait BucketApiClient: Debug + Send + Sync {
    /// 移动对象，可跨存储空间
    fn move_object(
        &self,
        rs_host: &str,
        bucket: &str,
        from_key: &str,
        to_bucket: &str,
        to_key: &str,
    ) -> Result<()>;

    /// 在存储空间内复制对象
    fn copy_object(&self, rs_host: &str, bucket: &str, from_key: &str, to_key: &str) -> Result<()>;

    /// 删除对象
    fn delete_object(&self, rs_host: &str, bucket: &str, key: &str) -> Result<()>;

    /// 批量查询对象元信息，结果与输入一一对应
    fn batch_stat(&self, rs_host: &str, bucket: &str, keys: &[String]) -> Result<Vec<BatchStatResult>>;

    /// 按前缀列举一页对象
    fn list_page(
        &self,
        rsf_host: &str,
        bucket: &str,
        prefix: &str,
        marker: &str,
        limit: usize,
    ) -> Result<ListPage>;
}

/// 默认的 RS / RSF 客户端，直接走 HTTP 协议
#[derive(Debug)]
pub struct KodoBucketClient {
    credential: Credential,
    http_caller: Arc<dyn HttpCaller>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListResponse {
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    items: Vec<ListItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListItem {
    key: String,
}

impl KodoBucketClient {
    /// 创建默认客户端
    pub fn new(credential: Credential, http_caller: Arc<dyn HttpCaller>) -> Self {
        Self {
            credential,
            http_caller,
        }
    }

    fn encoded_entry(bucket: &str, key: &str) -> String {
        base64::encode_config(format!("{}:{}", bucket, key), base64::URL_SAFE)
    }

    fn call(&self, method: Method, url: String, body: Vec<u8>) -> Result<Vec<u8>> {
        let parsed = Url::parse(&url).map_err(|err| Error::new(ErrorKind::LocalIo, err))?;
        let authorization = self
            .credential
            .authorization_v1_for_request(&parsed, FORM_MIME, &body);
        let request = Request::new(method, url)
            .header(CONTENT_TYPE, HeaderValue::from_static(FORM_MIME))
            .header(
                AUTHORIZATION,
                HeaderValue::from_str(&authorization)
                    .map_err(|err| Error::new(ErrorKind::LocalIo, err))?,
            )
            .body(body)
            .timeout(RS_TIMEOUT);
        let response = self.http_caller.call(request)?;
        if !response.status_code().is_success() {
            return Err(Error::from_status(response.status_code()));
        }
        response.into_bytes()
    }
}

impl BucketApiClient for KodoBucketClient {
    fn move_object(
        &self,
        rs_host: &str,
        bucket: &str,
        from_key: &str,
        to_bucket: &str,
        to_key: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/move/{}/{}",
            rs_host,
            Self::encoded_entry(bucket, from_key),
            Self::encoded_entry(to_bucket, to_key)
        );
        self.call(Method::POST, url, Vec::new()).map(|_| ())
    }

    fn copy_object(&self, rs_host: &str, bucket: &str, from_key: &str, to_key: &str) -> Result<()> {
        let url = format!(
            "{}/copy/{}/{}",
            rs_host,
            Self::encoded_entry(bucket, from_key),
            Self::encoded_entry(bucket, to_key)
        );
        self.call(Method::POST, url, Vec::new()).map(|_| ())
    }

    fn delete_object(&self, rs_host: &str, bucket: &str, key: &str) -> Result<()> {
        let url = format!("{}/delete/{}", rs_host, Self::encoded_entry(bucket, key));
        self.call(Method::POST, url, Vec::new()).map(|_| ())
    }

    fn batch_stat(&self, rs_host: &str, bucket: &str, keys: &[String]) -> Result<Vec<BatchStatResult>> {
        let body = keys
            .iter()
            .map(|key| format!("op=/stat/{}", Self::encoded_entry(bucket, key)))
            .collect::<Vec<_>>()
            .join("&");
        let response = self.call(
            Method::POST,
            format!("{}/batch", rs_host),
            body.into_bytes(),
        )?;
        serde_json::from_slice(&response).map_err(|err| Error::new(ErrorKind::LocalIo, err))
    }

    fn list_page(
        &self,
        rsf_host: &str,
        bucket: &str,
        prefix: &str,
        marker: &str,
        limit: usize,
    ) -> Result<ListPage> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("bucket", bucket)
            .append_pair("prefix", prefix)
            .append_pair("marker", marker)
            .append_pair("limit", &limit.to_string())
            .finish();
        let response = self.call(Method::POST, format!("{}/list?{}", rsf_host, query), Vec::new())?;
        let decoded: ListResponse =
            serde_json::from_slice(&response).map_err(|err| Error::new(ErrorKind::LocalIo, err))?;
        Ok(ListPage {
            keys: decoded.items.into_iter().map(|item| item.key).collect(),
            marker: decoded.marker,
        })
    }
}

/// 列举器
///
/// 对象的重命名、移动、复制、删除、批量元信息查询与前缀列举。
/// 每个操作失败后换一台主机再试一次，批量查询通过任务池并行。
#[derive(Debug, Clone)]
pub struct Lister {
    bucket: String,
    rs_selector: HostSelector,
    rsf_selector: HostSelector,
    client: Arc<dyn BucketApiClient>,
    batch_size: usize,
    batch_concurrency: usize,
}

impl Lister {
    /// 根据配置创建列举器
    pub fn new(config: &Config) -> Self {
        let http_caller: Arc<dyn HttpCaller> = Arc::new(UreqCaller::with_timeouts(
            config.dial_timeout(),
            RS_TIMEOUT,
        ));
        let client = Arc::new(KodoBucketClient::new(
            Credential::new(config.ak.to_owned(), config.sk.to_owned()),
            http_caller.to_owned(),
        ));
        Self::with_parts(config, client, http_caller)
    }

    /// 根据配置、注入的客户端与 HTTP 客户端创建列举器
    pub fn with_parts(
        config: &Config,
        client: Arc<dyn BucketApiClient>,
        http_caller: Arc<dyn HttpCaller>,
    ) -> Self {
        let queryer = if config.uc_hosts.is_empty() {
            None
        } else {
            Some(Queryer::new(config, http_caller))
        };
        let rs_selector = make_selector(config.rs_hosts.to_owned(), config, {
            let queryer = queryer.to_owned();
            queryer.map(|queryer| move || shuffled(queryer.query_rs_hosts(false)))
        });
        let rsf_selector = make_selector(config.rsf_hosts.to_owned(), config, {
            queryer.map(|queryer| move || shuffled(queryer.query_rsf_hosts(false)))
        });
        Self {
            bucket: config.bucket.to_owned(),
            rs_selector,
            rsf_selector,
            client,
            batch_size: if config.batch_size == 0 {
                DEFAULT_BATCH_SIZE
            } else {
                config.batch_size
            },
            batch_concurrency: if config.batch_concurrency == 0 {
                DEFAULT_BATCH_CONCURRENCY
            } else {
                config.batch_concurrency
            },
        }
    }

    /// 重命名对象
    pub fn rename(&self, from_key: &str, to_key: &str) -> Result<()> {
        let failed_hosts = RwLock::new(HashSet::new());
        self.with_two_hosts("rename", &self.rs_selector, &failed_hosts, |host| {
            self.client
                .move_object(host, &self.bucket, from_key, &self.bucket, to_key)
        })
    }

    /// 移动对象到指定存储空间的指定对象
    pub fn move_to(&self, from_key: &str, to_bucket: &str, to_key: &str) -> Result<()> {
        let failed_hosts = RwLock::new(HashSet::new());
        self.with_two_hosts("move", &self.rs_selector, &failed_hosts, |host| {
            self.client
                .move_object(host, &self.bucket, from_key, to_bucket, to_key)
        })
    }

    /// 复制对象到当前存储空间的指定对象
    pub fn copy(&self, from_key: &str, to_key: &str) -> Result<()> {
        let failed_hosts = RwLock::new(HashSet::new());
        self.with_two_hosts("copy", &self.rs_selector, &failed_hosts, |host| {
            self.client.copy_object(host, &self.bucket, from_key, to_key)
        })
    }

    /// 删除对象
    pub fn delete(&self, key: &str) -> Result<()> {
        let failed_hosts = RwLock::new(HashSet::new());
        self.with_two_hosts("delete", &self.rs_selector, &failed_hosts, |host| {
            self.client.delete_object(host, &self.bucket, key)
        })
    }

    /// 批量获取对象元信息
    ///
    /// 结果与输入一一对应。单个对象查询失败时其大小为 `-1`，
    /// 任何批次不可恢复地失败时整个调用返回空列表。
    pub fn list_stat(&self, keys: &[String]) -> Vec<FileStat> {
        if keys.is_empty() {
            return Vec::new();
        }
        let chunk_count = (keys.len() + self.batch_size - 1) / self.batch_size;
        let pool = match TaskPool::new(chunk_count.min(self.batch_concurrency)) {
            Ok(pool) => pool,
            Err(err) => {
                warn!("failed to create task pool: {}", err);
                return Vec::new();
            }
        };
        let stats: Arc<Mutex<Vec<FileStat>>> = Arc::new(Mutex::new(
            keys.iter()
                .map(|key| FileStat {
                    name: key.to_owned(),
                    size: -1,
                })
                .collect(),
        ));
        let failed_hosts: Arc<RwLock<HashSet<String>>> = Default::default();

        for (chunk_index, chunk) in keys.chunks(self.batch_size).enumerate() {
            let offset = chunk_index * self.batch_size;
            let chunk = chunk.to_vec();
            let lister = self.to_owned();
            let stats = stats.to_owned();
            let failed_hosts = failed_hosts.to_owned();
            pool.spawn(move || {
                let results = lister.with_two_hosts(
                    "batch stat",
                    &lister.rs_selector,
                    &failed_hosts,
                    |host| lister.client.batch_stat(host, &lister.bucket, &chunk),
                )?;
                let mut stats = stats.lock().unwrap();
                for (i, key) in chunk.iter().enumerate() {
                    match results.get(i) {
                        Some(result) if result.code == 200 => {
                            let size = result.data.as_ref().map_or(-1, |data| data.fsize);
                            stats[offset + i] = FileStat {
                                name: key.to_owned(),
                                size,
                            };
                        }
                        Some(result) => {
                            warn!("stat bad file {} with code {}", key, result.code);
                        }
                        None => {
                            warn!("stat result missing for file {}", key);
                        }
                    }
                }
                Ok(())
            });
        }

        match pool.wait() {
            Ok(()) => Arc::try_unwrap(stats)
                .map(|stats| stats.into_inner().unwrap())
                .unwrap_or_else(|stats| stats.lock().unwrap().to_owned()),
            Err(err) => {
                warn!("list stat failed: {}", err);
                Vec::new()
            }
        }
    }

    /// 按前缀列举存储空间内的全部对象键
    ///
    /// 单页失败时换一台主机从空游标重新开始，可能产生重复，
    /// 由调用方去重。连续两次失败返回空列表。
    pub fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let failed_hosts = RwLock::new(HashSet::new());
        let mut rsf_host = self.next_host(&self.rsf_selector, &failed_hosts)?;
        let mut keys = Vec::new();
        let mut marker = String::new();
        loop {
            let page = match self
                .client
                .list_page(&rsf_host, &self.bucket, prefix, &marker, LIST_PAGE_LIMIT)
            {
                Ok(page) => {
                    self.rsf_selector.reward(&rsf_host);
                    page
                }
                Err(err) => {
                    self.mark_failed(&self.rsf_selector, &failed_hosts, &rsf_host, &err);
                    info!("list prefix retry 0 on host {}: {}", rsf_host, err);
                    rsf_host = self.next_host(&self.rsf_selector, &failed_hosts)?;
                    match self
                        .client
                        .list_page(&rsf_host, &self.bucket, prefix, "", LIST_PAGE_LIMIT)
                    {
                        Ok(page) => {
                            self.rsf_selector.reward(&rsf_host);
                            page
                        }
                        Err(err) => {
                            self.mark_failed(&self.rsf_selector, &failed_hosts, &rsf_host, &err);
                            info!("list prefix retry 1 on host {}: {}", rsf_host, err);
                            return Ok(Vec::new());
                        }
                    }
                }
            };
            debug!("list prefix got {} keys at marker {:?}", page.keys.len(), marker);
            keys.extend(page.keys);
            match page.marker {
                Some(next_marker) if !next_marker.is_empty() => marker = next_marker,
                _ => break,
            }
        }
        Ok(keys)
    }

    fn with_two_hosts<T>(
        &self,
        what: &str,
        selector: &HostSelector,
        failed_hosts: &RwLock<HashSet<String>>,
        op: impl Fn(&str) -> Result<T>,
    ) -> Result<T> {
        let host = self.next_host(selector, failed_hosts)?;
        match op(&host) {
            Ok(value) => {
                selector.reward(&host);
                Ok(value)
            }
            Err(err) => {
                self.mark_failed(selector, failed_hosts, &host, &err);
                info!("{} retry 0 on host {}: {}", what, host, err);
                let host = self.next_host(selector, failed_hosts)?;
                match op(&host) {
                    Ok(value) => {
                        selector.reward(&host);
                        Ok(value)
                    }
                    Err(err) => {
                        self.mark_failed(selector, failed_hosts, &host, &err);
                        info!("{} retry 1 on host {}: {}", what, host, err);
                        Err(err)
                    }
                }
            }
        }
    }

    fn next_host(
        &self,
        selector: &HostSelector,
        failed_hosts: &RwLock<HashSet<String>>,
    ) -> Result<String> {
        let failed_hosts = failed_hosts.read().unwrap();
        selector.select_host_excluding(&failed_hosts)
    }

    fn mark_failed(
        &self,
        selector: &HostSelector,
        failed_hosts: &RwLock<HashSet<String>>,
        host: &str,
        err: &Error,
    ) {
        failed_hosts.write().unwrap().insert(host.to_owned());
        selector.punish_if_needed(host, err);
    }
}

fn make_selector<F>(seed_hosts: Vec<String>, config: &Config, update_func: Option<F>) -> HostSelector
where
    F: Fn() -> Vec<String> + Send + Sync + 'static,
{
    let mut builder = HostSelector::builder(shuffled(seed_hosts))
        .punish_duration(config.punish_duration())
        .update_interval(DEFAULT_UPDATE_INTERVAL);
    if let Some(update_func) = update_func {
        builder = builder.update_func(update_func);
    }
    builder.build()
}

fn shuffled(mut hosts: Vec<String>) -> Vec<String> {
    hosts.shuffle(&mut thread_rng());
    hosts
}
