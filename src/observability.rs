//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info 级别，RUST_LOG 可覆盖；重复初始化（例如测试中）只返回错误，不 panic。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing init failed: {}", e))
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let _ = super::init();
        assert!(super::init().is_err());
    }
}
