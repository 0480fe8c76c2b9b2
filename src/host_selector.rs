use crate::error::{Error, ErrorKind, Result};
use dashmap::DashMap;
use log::warn;
use std::{
    collections::HashSet,
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc, RwLock,
    },
    time::{Duration, Instant},
};
use url::Url;

/// 单次选择最多探测的候选比例
pub(crate) const MAX_FIND_HOSTS_PERCENT: usize = 50;

pub(crate) const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_PUNISH_DURATION: Duration = Duration::from_secs(30);

type UpdateFn = Arc<dyn Fn() -> Vec<String> + Send + Sync>;
type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
struct HostHealth {
    failed_at: Instant,
    punish_count: usize,
}

#[derive(Debug, Clone)]
struct Refreshed {
    hosts: Vec<String>,
    refreshed_at: Instant,
}

/// 主机选择器
///
/// 在一组等价主机间轮转负载，失败的主机在惩罚窗口内被跳过，
/// 窗口过后自动恢复。主机集合的成员变更只来自更新回调。
/// 所有操作都可以并发调用。
#[derive(Clone)]
pub struct HostSelector {
    inner: Arc<SelectorInner>,
}

struct SelectorInner {
    hosts: Vec<String>,
    update_func: Option<UpdateFn>,
    refreshed: RwLock<Option<Refreshed>>,
    update_interval: Duration,
    punish_duration: Duration,
    punish_threshold: usize,
    max_punished_hosts: isize,
    punished: DashMap<String, HostHealth>,
    cursor: AtomicUsize,
    should_retry: RetryPredicate,
}

impl HostSelector {
    /// 创建主机选择器构建器
    #[inline]
    pub fn builder(hosts: Vec<String>) -> HostSelectorBuilder {
        HostSelectorBuilder {
            hosts,
            update_func: None,
            update_interval: Duration::ZERO,
            punish_duration: DEFAULT_PUNISH_DURATION,
            punish_threshold: 0,
            max_punished_hosts: -1,
            should_retry: Arc::new(Error::is_retryable),
        }
    }

    /// 选择一台主机
    pub fn select_host(&self) -> Result<String> {
        self.select_host_excluding(&HashSet::new())
    }

    /// 选择一台主机，跳过给定集合中的主机
    ///
    /// 候选为更新回调的缓存结果（非空且未过期时），否则为种子列表。
    /// 从游标处开始最多探测候选数的一半，全部被惩罚或被排除时
    /// 退化返回最后一个探测到的主机，保证调用方能继续前进。
    pub fn select_host_excluding(&self, excluded: &HashSet<String>) -> Result<String> {
        let hosts = self.candidates();
        match hosts.len() {
            0 => Err(Error::with_msg(ErrorKind::NoHosts, "no hosts configured")),
            1 => Ok(hosts[0].to_owned()),
            host_count => {
                let budget = host_count * MAX_FIND_HOSTS_PERCENT / 100 + 1;
                let base = self.inner.cursor.fetch_add(1, Relaxed);
                let mut picked = &hosts[base % host_count];
                for i in 0..budget {
                    picked = &hosts[(base + i) % host_count];
                    if is_host_valid(picked)
                        && !excluded.contains(picked)
                        && !self.is_punished(picked)
                    {
                        return Ok(picked.to_owned());
                    }
                }
                Ok(picked.to_owned())
            }
        }
    }

    /// 失败反馈，需要时惩罚主机
    ///
    /// 终结性错误不反映主机健康状况，不会惩罚。已达惩罚预算时
    /// 放过该主机。返回是否实施了惩罚。
    pub fn punish_if_needed(&self, host: &str, err: &Error) -> bool {
        if !(self.inner.should_retry)(err) {
            return false;
        }
        if self.inner.max_punished_hosts >= 0
            && !self.inner.punished.contains_key(host)
            && self.currently_punished() >= self.inner.max_punished_hosts as usize
        {
            warn!("punished hosts budget reached, host {} is spared", host);
            return false;
        }
        let now = Instant::now();
        self.inner
            .punished
            .entry(host.to_owned())
            .and_modify(|health| {
                health.failed_at = now;
                health.punish_count += 1;
            })
            .or_insert_with(|| HostHealth {
                failed_at: now,
                punish_count: 1,
            });
        true
    }

    /// 成功反馈，立即恢复主机
    #[inline]
    pub fn reward(&self, host: &str) {
        self.inner.punished.remove(host);
    }

    fn is_punished(&self, host: &str) -> bool {
        self.inner.punished.get(host).map_or(false, |health| {
            health.failed_at.elapsed() < self.inner.punish_duration
                && health.punish_count > self.inner.punish_threshold
        })
    }

    fn currently_punished(&self) -> usize {
        self.inner
            .punished
            .iter()
            .filter(|entry| entry.value().failed_at.elapsed() < self.inner.punish_duration)
            .count()
    }

    fn candidates(&self) -> Vec<String> {
        let inner = &self.inner;
        if let Some(update_func) = &inner.update_func {
            if inner.update_interval > Duration::ZERO {
                let expired = inner.refreshed.read().unwrap().as_ref().map_or(
                    true,
                    |refreshed| refreshed.refreshed_at.elapsed() >= inner.update_interval,
                );
                if expired {
                    let fresh = update_func();
                    *inner.refreshed.write().unwrap() = Some(Refreshed {
                        hosts: fresh,
                        refreshed_at: Instant::now(),
                    });
                }
                if let Some(refreshed) = inner.refreshed.read().unwrap().as_ref() {
                    if !refreshed.hosts.is_empty()
                        && refreshed.refreshed_at.elapsed() < inner.update_interval
                    {
                        return refreshed.hosts.to_owned();
                    }
                }
            }
        }
        inner.hosts.to_owned()
    }

    #[cfg(test)]
    pub(crate) fn punish_count_of(&self, host: &str) -> usize {
        self.inner
            .punished
            .get(host)
            .map_or(0, |health| health.punish_count)
    }
}

impl Debug for HostSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSelector")
            .field("hosts", &self.inner.hosts)
            .field("update_interval", &self.inner.update_interval)
            .field("punish_duration", &self.inner.punish_duration)
            .finish()
    }
}

/// 主机选择器构建器
#[must_use]
pub struct HostSelectorBuilder {
    hosts: Vec<String>,
    update_func: Option<UpdateFn>,
    update_interval: Duration,
    punish_duration: Duration,
    punish_threshold: usize,
    max_punished_hosts: isize,
    should_retry: RetryPredicate,
}

impl HostSelectorBuilder {
    /// 设置主机集合的更新回调
    #[inline]
    pub fn update_func(mut self, update_func: impl Fn() -> Vec<String> + Send + Sync + 'static) -> Self {
        self.update_func = Some(Arc::new(update_func));
        self
    }

    /// 设置更新回调的刷新间隔，为零时禁用刷新
    #[inline]
    pub fn update_interval(mut self, update_interval: Duration) -> Self {
        self.update_interval = update_interval;
        self
    }

    /// 设置惩罚窗口
    #[inline]
    pub fn punish_duration(mut self, punish_duration: Duration) -> Self {
        self.punish_duration = punish_duration;
        self
    }

    /// 设置惩罚阈值，惩罚次数超过该值的主机才被跳过
    #[inline]
    pub fn punish_threshold(mut self, punish_threshold: usize) -> Self {
        self.punish_threshold = punish_threshold;
        self
    }

    /// 设置同时处于惩罚状态的主机数上限，`-1` 表示不设限
    #[inline]
    pub fn max_punished_hosts(mut self, max_punished_hosts: isize) -> Self {
        self.max_punished_hosts = max_punished_hosts;
        self
    }

    /// 设置错误重试判定，决定哪些错误反映主机健康状况
    #[inline]
    pub fn should_retry(mut self, should_retry: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Arc::new(should_retry);
        self
    }

    /// 构建主机选择器
    pub fn build(self) -> HostSelector {
        HostSelector {
            inner: Arc::new(SelectorInner {
                hosts: self.hosts,
                update_func: self.update_func,
                refreshed: RwLock::new(None),
                update_interval: self.update_interval,
                punish_duration: self.punish_duration,
                punish_threshold: self.punish_threshold,
                max_punished_hosts: self.max_punished_hosts,
                punished: Default::default(),
                cursor: AtomicUsize::new(0),
                should_retry: self.should_retry,
            }),
        }
    }
}

fn is_host_valid(host: &str) -> bool {
    let url;
    let to_parse = if host.contains("://") {
        host
    } else {
        url = format!("http://{}", host);
        &url
    };
    Url::parse(to_parse)
        .map(|parsed| parsed.host_str().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::{sync::atomic::AtomicUsize, thread::sleep};

    fn transient_error() -> Error {
        Error::from_status(StatusCode::SERVICE_UNAVAILABLE)
    }

    fn three_hosts() -> Vec<String> {
        vec![
            "http://host-1.example.com".to_owned(),
            "http://host-2.example.com".to_owned(),
            "http://host-3.example.com".to_owned(),
        ]
    }

    #[test]
    fn test_round_robin() -> anyhow::Result<()> {
        let selector = HostSelector::builder(three_hosts()).build();
        assert_eq!(selector.select_host()?, "http://host-1.example.com");
        assert_eq!(selector.select_host()?, "http://host-2.example.com");
        assert_eq!(selector.select_host()?, "http://host-3.example.com");
        assert_eq!(selector.select_host()?, "http://host-1.example.com");
        Ok(())
    }

    #[test]
    fn test_empty_pool() {
        let selector = HostSelector::builder(vec![]).build();
        let err = selector.select_host().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoHosts);
    }

    #[test]
    fn test_punished_host_is_skipped_until_window_elapses() -> anyhow::Result<()> {
        let selector = HostSelector::builder(three_hosts())
            .punish_duration(Duration::from_millis(200))
            .build();
        assert!(selector.punish_if_needed("http://host-1.example.com", &transient_error()));
        for _ in 0..6 {
            assert_ne!(selector.select_host()?, "http://host-1.example.com");
        }
        sleep(Duration::from_millis(250));
        let selected: HashSet<String> = (0..3).map(|_| selector.select_host().unwrap()).collect();
        assert!(selected.contains("http://host-1.example.com"));
        Ok(())
    }

    #[test]
    fn test_reward_restores_immediately() -> anyhow::Result<()> {
        let selector = HostSelector::builder(three_hosts())
            .punish_duration(Duration::from_secs(3600))
            .build();
        assert!(selector.punish_if_needed("http://host-2.example.com", &transient_error()));
        selector.reward("http://host-2.example.com");
        let selected: HashSet<String> = (0..3).map(|_| selector.select_host().unwrap()).collect();
        assert!(selected.contains("http://host-2.example.com"));
        assert_eq!(selector.punish_count_of("http://host-2.example.com"), 0);
        Ok(())
    }

    #[test]
    fn test_terminal_error_does_not_punish() {
        let selector = HostSelector::builder(three_hosts()).build();
        let terminal = Error::from_status(StatusCode::FORBIDDEN);
        assert!(!selector.punish_if_needed("http://host-1.example.com", &terminal));
        assert_eq!(selector.punish_count_of("http://host-1.example.com"), 0);
    }

    #[test]
    fn test_punish_threshold() -> anyhow::Result<()> {
        let selector = HostSelector::builder(three_hosts())
            .punish_duration(Duration::from_secs(3600))
            .punish_threshold(1)
            .build();
        assert!(selector.punish_if_needed("http://host-1.example.com", &transient_error()));
        let selected: HashSet<String> = (0..3).map(|_| selector.select_host().unwrap()).collect();
        assert!(selected.contains("http://host-1.example.com"));

        assert!(selector.punish_if_needed("http://host-1.example.com", &transient_error()));
        for _ in 0..6 {
            assert_ne!(selector.select_host()?, "http://host-1.example.com");
        }
        Ok(())
    }

    #[test]
    fn test_punished_hosts_budget() {
        let selector = HostSelector::builder(three_hosts())
            .punish_duration(Duration::from_secs(3600))
            .max_punished_hosts(1)
            .build();
        assert!(selector.punish_if_needed("http://host-1.example.com", &transient_error()));
        assert!(!selector.punish_if_needed("http://host-2.example.com", &transient_error()));
        // 已在惩罚状态的主机不占用新预算
        assert!(selector.punish_if_needed("http://host-1.example.com", &transient_error()));
        assert_eq!(selector.punish_count_of("http://host-1.example.com"), 2);
    }

    #[test]
    fn test_degraded_selection_with_all_hosts_punished() -> anyhow::Result<()> {
        let selector = HostSelector::builder(three_hosts())
            .punish_duration(Duration::from_secs(3600))
            .build();
        for host in three_hosts() {
            assert!(selector.punish_if_needed(&host, &transient_error()));
        }
        // 全部被惩罚时退化返回最后探测的主机
        let picked = selector.select_host()?;
        assert!(three_hosts().contains(&picked));
        Ok(())
    }

    #[test]
    fn test_single_host_always_returned() -> anyhow::Result<()> {
        let selector = HostSelector::builder(vec!["http://only.example.com".to_owned()])
            .punish_duration(Duration::from_secs(3600))
            .build();
        assert!(selector.punish_if_needed("http://only.example.com", &transient_error()));
        assert_eq!(selector.select_host()?, "http://only.example.com");
        Ok(())
    }

    #[test]
    fn test_excluded_hosts_are_skipped() -> anyhow::Result<()> {
        let selector = HostSelector::builder(three_hosts()).build();
        let mut excluded = HashSet::new();
        excluded.insert("http://host-1.example.com".to_owned());
        for _ in 0..6 {
            assert_ne!(selector.select_host_excluding(&excluded)?, "http://host-1.example.com");
        }
        Ok(())
    }

    #[test]
    fn test_update_func_refresh() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let selector = {
            let calls = calls.to_owned();
            HostSelector::builder(three_hosts())
                .update_func(move || {
                    calls.fetch_add(1, Relaxed);
                    vec!["http://fresh.example.com".to_owned()]
                })
                .update_interval(Duration::from_secs(3600))
                .build()
        };
        assert_eq!(selector.select_host()?, "http://fresh.example.com");
        assert_eq!(selector.select_host()?, "http://fresh.example.com");
        assert_eq!(calls.load(Relaxed), 1);
        Ok(())
    }

    #[test]
    fn test_update_func_empty_result_falls_back_to_seeds() -> anyhow::Result<()> {
        let selector = HostSelector::builder(three_hosts())
            .update_func(Vec::new)
            .update_interval(Duration::from_secs(3600))
            .build();
        assert!(three_hosts().contains(&selector.select_host()?));
        Ok(())
    }

    #[test]
    fn test_invalid_host_is_skipped() -> anyhow::Result<()> {
        let selector = HostSelector::builder(vec![
            "http://".to_owned(),
            "http://valid.example.com".to_owned(),
        ])
        .build();
        for _ in 0..4 {
            assert_eq!(selector.select_host()?, "http://valid.example.com");
        }
        Ok(())
    }
}
