use crate::{
    config::Config,
    error::{Error, ErrorKind, Result},
    http::{HttpCaller, Request},
};
use dashmap::DashMap;
use log::warn;
use serde::Deserialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CACHE_LIFETIME: Duration = Duration::from_secs(300);

/// 主机发现查询器
///
/// 向 UC 服务查询存储空间当前的 IO / UP / RS / RSF 主机列表，
/// 按 (AccessKey, 存储空间) 缓存，有效期由响应给出。
/// 查询失败降级为返回空列表，由调用方继续使用种子主机。
#[derive(Debug, Clone)]
pub struct Queryer {
    inner: Arc<QueryerInner>,
}

#[derive(Debug)]
struct QueryerInner {
    uc_hosts: Vec<String>,
    access_key: String,
    bucket: String,
    http_caller: Arc<dyn HttpCaller>,
    cache: DashMap<String, CachedHosts>,
}

#[derive(Debug, Clone)]
struct CachedHosts {
    io_hosts: Vec<String>,
    up_hosts: Vec<String>,
    rs_hosts: Vec<String>,
    rsf_hosts: Vec<String>,
    lifetime: Duration,
    cached_at: Instant,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    hosts: Vec<QueryHost>,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryHost {
    #[serde(default)]
    ttl: u64,
    #[serde(default)]
    io: DomainsInfo,
    #[serde(default)]
    up: DomainsInfo,
    #[serde(default)]
    rs: DomainsInfo,
    #[serde(default)]
    rsf: DomainsInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DomainsInfo {
    #[serde(default)]
    domains: Vec<String>,
}

impl Queryer {
    /// 根据配置与注入的 HTTP 客户端创建查询器
    pub fn new(config: &Config, http_caller: Arc<dyn HttpCaller>) -> Self {
        Self {
            inner: Arc::new(QueryerInner {
                uc_hosts: config.uc_hosts.to_owned(),
                access_key: config.ak.to_owned(),
                bucket: config.bucket.to_owned(),
                http_caller,
                cache: Default::default(),
            }),
        }
    }

    /// 查询当前的下载主机列表
    pub fn query_io_hosts(&self, force: bool) -> Vec<String> {
        self.query(force).map(|hosts| hosts.io_hosts).unwrap_or_default()
    }

    /// 查询当前的上传主机列表
    pub fn query_up_hosts(&self, force: bool) -> Vec<String> {
        self.query(force).map(|hosts| hosts.up_hosts).unwrap_or_default()
    }

    /// 查询当前的元信息变更主机列表
    pub fn query_rs_hosts(&self, force: bool) -> Vec<String> {
        self.query(force).map(|hosts| hosts.rs_hosts).unwrap_or_default()
    }

    /// 查询当前的元信息列举主机列表
    pub fn query_rsf_hosts(&self, force: bool) -> Vec<String> {
        self.query(force).map(|hosts| hosts.rsf_hosts).unwrap_or_default()
    }

    fn query(&self, force: bool) -> Option<CachedHosts> {
        let inner = &self.inner;
        let cache_key = format!("{}:{}", inner.access_key, inner.bucket);
        if !force {
            if let Some(cached) = inner.cache.get(&cache_key) {
                if cached.cached_at.elapsed() < cached.lifetime {
                    return Some(cached.to_owned());
                }
            }
        }
        match self.query_uc() {
            Ok(hosts) => {
                inner.cache.insert(cache_key, hosts.to_owned());
                Some(hosts)
            }
            Err(err) => {
                warn!("failed to query hosts for {}: {}", inner.bucket, err);
                // 过期的缓存也好过没有
                inner.cache.get(&cache_key).map(|cached| cached.to_owned())
            }
        }
    }

    fn query_uc(&self) -> Result<CachedHosts> {
        let inner = &self.inner;
        let mut last_err = Error::with_msg(ErrorKind::NoHosts, "no uc hosts configured");
        for uc_host in inner.uc_hosts.iter() {
            let url = format!(
                "{}/v4/query?ak={}&bucket={}",
                uc_host, inner.access_key, inner.bucket
            );
            match self.query_one(uc_host, &url) {
                Ok(hosts) => return Ok(hosts),
                Err(err) => {
                    warn!("uc host {} query failed: {}", uc_host, err);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn query_one(&self, uc_host: &str, url: &str) -> Result<CachedHosts> {
        let response = self
            .inner
            .http_caller
            .call(Request::get(url).timeout(QUERY_TIMEOUT))?;
        if !response.status_code().is_success() {
            return Err(Error::from_status(response.status_code()));
        }
        let body = response.into_bytes()?;
        let decoded: QueryResponse = serde_json::from_slice(&body)
            .map_err(|err| Error::new(ErrorKind::LocalIo, err))?;

        let scheme = if uc_host.starts_with("https://") {
            "https"
        } else {
            "http"
        };
        let mut hosts = CachedHosts {
            io_hosts: Vec::new(),
            up_hosts: Vec::new(),
            rs_hosts: Vec::new(),
            rsf_hosts: Vec::new(),
            lifetime: DEFAULT_CACHE_LIFETIME,
            cached_at: Instant::now(),
        };
        for entry in decoded.hosts.iter() {
            if entry.ttl > 0 {
                hosts.lifetime = hosts.lifetime.min(Duration::from_secs(entry.ttl));
            }
            extend_hosts(&mut hosts.io_hosts, &entry.io.domains, scheme);
            extend_hosts(&mut hosts.up_hosts, &entry.up.domains, scheme);
            extend_hosts(&mut hosts.rs_hosts, &entry.rs.domains, scheme);
            extend_hosts(&mut hosts.rsf_hosts, &entry.rsf.domains, scheme);
        }
        Ok(hosts)
    }
}

fn extend_hosts(hosts: &mut Vec<String>, domains: &[String], scheme: &str) {
    for domain in domains.iter() {
        if domain.contains("://") {
            hosts.push(domain.to_owned());
        } else {
            hosts.push(format!("{}://{}", scheme, domain));
        }
    }
}
