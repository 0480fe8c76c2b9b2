use crate::{
    dot::{DotType, Dotter},
    error::{Error, Result},
    host_selector::HostSelector,
};
use log::warn;
use std::result::Result as StdResult;

/// 单次尝试的失败
///
/// `skip_host_accounting` 表示错误来自调用方内部（本地文件、锁竞争等），
/// 不反映主机健康状况：不惩罚、不重试、不打点。
#[derive(Debug)]
pub(crate) struct TryError {
    error: Error,
    skip_host_accounting: bool,
}

impl TryError {
    /// 将调用方内部错误标记为跳过主机记账
    #[inline]
    pub(crate) fn skip(error: Error) -> Self {
        Self {
            error,
            skip_host_accounting: true,
        }
    }
}

impl From<Error> for TryError {
    #[inline]
    fn from(error: Error) -> Self {
        Self {
            error,
            skip_host_accounting: false,
        }
    }
}

pub(crate) type TryResult<T> = StdResult<T, TryError>;

/// 在主机池上带重试地执行请求
///
/// 每轮从选择器取一台主机执行 `f`。成功时奖励主机并打成功点；
/// 失败时视情况惩罚主机（被惩罚打失败点，未被惩罚说明主机本身
/// 工作正常，打成功点），可重试的错误继续消耗尝试预算，
/// 终结性错误立即返回。
pub(crate) fn try_hosts<T, F>(
    selector: &HostSelector,
    dotter: &Dotter,
    http_api: &str,
    tries: usize,
    mut f: F,
) -> Result<T>
where
    F: FnMut(&str) -> TryResult<T>,
{
    let tries = tries.max(1);
    for i in 0..tries {
        let host = selector.select_host()?;
        match f(&host) {
            Ok(value) => {
                selector.reward(&host);
                dotter.dot(DotType::Http, http_api, true);
                return Ok(value);
            }
            Err(tried) => {
                if tried.skip_host_accounting {
                    return Err(tried.error);
                }
                if selector.punish_if_needed(&host, &tried.error) {
                    warn!("try {} failed, host {} punished: {}", i, host, tried.error);
                    dotter.dot(DotType::Http, http_api, false);
                } else {
                    warn!("try {} failed, host {} not punished: {}", i, host, tried.error);
                    dotter.dot(DotType::Http, http_api, true);
                }
                if i + 1 >= tries || !tried.error.is_retryable() {
                    return Err(tried.error);
                }
            }
        }
    }
    unreachable!("try budget is at least one")
}
