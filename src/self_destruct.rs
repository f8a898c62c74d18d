//! 定时自毁：到期后记录并关闭整个服务。

use std::time::Duration;
use tracing::error;

/// 在 `delay` 之后执行一次 `shutdown`。
///
/// 不返回任何句柄，计时一旦开始就无法续期或取消。
pub fn schedule<F>(delay: Duration, shutdown: F)
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        error!("Time ran out for server. Killing process for security.");
        shutdown();
    });
}
